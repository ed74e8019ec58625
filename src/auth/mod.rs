mod auth_service;

use anyhow::{Result, anyhow};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::config::JwtSettings;
use crate::error::{AppError, AppResult};
use crate::model::Identity;

pub use auth_service::AuthService;

/// JWT Claims structure that will be encoded in the token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Issued at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
    /// Issuer
    pub iss: String,
}

/// Turns a bearer token into a caller identity.
///
/// Tenant roles never travel in the token; they are resolved per request
/// from memberships.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> AppResult<Identity>;
}

/// Configuration for JWT tokens
pub struct JwtConfig {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    /// Token expiration time in seconds
    expiration: i64,
    issuer: String,
}

impl JwtConfig {
    pub fn new(settings: &JwtSettings) -> Result<Self> {
        if settings.secret.is_empty() {
            return Err(anyhow!("JWT secret must not be empty"));
        }
        if settings.expiration_seconds <= 0 {
            return Err(anyhow!("JWT expiration must be positive"));
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(settings.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(settings.secret.as_bytes()),
            expiration: settings.expiration_seconds,
            issuer: settings.issuer.clone(),
        })
    }

    pub fn generate_token(&self, identity: &Identity) -> Result<String> {
        let now = OffsetDateTime::now_utc();
        let expiration = now + Duration::seconds(self.expiration);

        let claims = Claims {
            sub: identity.user_id,
            email: identity.email.clone(),
            iat: now.unix_timestamp(),
            exp: expiration.unix_timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow!("Failed to generate JWT token: {}", e))?;

        debug!(user_id = %identity.user_id, "Generated JWT token");
        Ok(token)
    }

    /// Validate signature, expiry and issuer, and extract the claims
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow!("Failed to validate JWT token: {}", e))?;

        debug!(user_id = %token_data.claims.sub, "Validated JWT token");
        Ok(token_data.claims)
    }
}

impl IdentityVerifier for JwtConfig {
    fn verify(&self, token: &str) -> AppResult<Identity> {
        let claims = self.validate_token(token).map_err(|e| {
            debug!(error = %e, "rejected bearer token");
            AppError::Unauthenticated
        })?;
        Ok(Identity {
            user_id: claims.sub,
            email: claims.email,
        })
    }
}
