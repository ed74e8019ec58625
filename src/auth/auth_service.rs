use std::sync::Arc;

use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use tracing::{info, warn};

use super::JwtConfig;
use crate::error::{AppError, AppResult};
use crate::model::{Identity, User};
use crate::store::Store;

/// Password login against locally registered users.
pub struct AuthService {
    store: Arc<dyn Store>,
    jwt_config: Arc<JwtConfig>,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, jwt_config: Arc<JwtConfig>) -> Self {
        Self { store, jwt_config }
    }

    /// Hash a password using Argon2
    pub fn hash_password(password: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow!("Password hashing error: {}", e))?
            .to_string();
        Ok(password_hash)
    }

    /// Verify a password against a hash using Argon2
    pub fn verify_password(password: &str, password_hash: &str) -> anyhow::Result<bool> {
        let parsed_hash = PasswordHash::new(password_hash)
            .map_err(|e| anyhow!("Password hash parsing error: {}", e))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    pub async fn register_user(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> AppResult<User> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::invalid("email", "must be an email address"));
        }
        if password.is_empty() {
            return Err(AppError::invalid("password", "must not be empty"));
        }
        let password_hash = Self::hash_password(password)?;
        let user = self
            .store
            .insert_user(email, &password_hash, display_name)
            .await?;
        info!(user_id = %user.user_id, "New user registered");
        Ok(user)
    }

    /// Check credentials and mint a token. Unknown users, inactive users and
    /// wrong passwords all fail the same way.
    pub async fn authenticate(&self, email: &str, password: &str) -> AppResult<(Identity, String)> {
        let user = self
            .store
            .find_user_by_email(email.trim())
            .await?
            .filter(|u| u.is_active)
            .ok_or(AppError::Unauthenticated)?;

        if !Self::verify_password(password, &user.password_hash)? {
            warn!(user_id = %user.user_id, "Password verification failed");
            return Err(AppError::Unauthenticated);
        }

        let identity = Identity {
            user_id: user.user_id,
            email: Some(user.email),
        };
        let token = self.jwt_config.generate_token(&identity)?;

        info!(user_id = %identity.user_id, "User authenticated successfully");
        Ok((identity, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::IdentityVerifier;
    use crate::config::JwtSettings;
    use crate::store::MemoryStore;

    fn service() -> (AuthService, Arc<JwtConfig>) {
        let jwt = Arc::new(
            JwtConfig::new(&JwtSettings {
                secret: "auth_service_test_secret".to_string(),
                ..JwtSettings::default()
            })
            .unwrap(),
        );
        (AuthService::new(Arc::new(MemoryStore::new()), jwt.clone()), jwt)
    }

    #[test]
    fn test_password_hashing() {
        let hash = AuthService::hash_password("test_password").unwrap();
        assert!(AuthService::verify_password("test_password", &hash).unwrap());
        assert!(!AuthService::verify_password("wrong_password", &hash).unwrap());
    }

    #[tokio::test]
    async fn test_user_registration_and_authentication() {
        let (auth, jwt) = service();
        let user = auth
            .register_user("clerk@example.com", "s3cret", "Clerk")
            .await
            .unwrap();

        let (identity, token) = auth.authenticate("clerk@example.com", "s3cret").await.unwrap();
        assert_eq!(identity.user_id, user.user_id);
        assert_eq!(jwt.verify(&token).unwrap().user_id, user.user_id);

        assert!(matches!(
            auth.authenticate("clerk@example.com", "nope").await,
            Err(AppError::Unauthenticated)
        ));
        assert!(matches!(
            auth.authenticate("nobody@example.com", "s3cret").await,
            Err(AppError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let (auth, _) = service();
        auth.register_user("dup@example.com", "pw", "One").await.unwrap();
        assert!(matches!(
            auth.register_user("dup@example.com", "pw", "Two").await,
            Err(AppError::Conflict(_))
        ));
    }
}
