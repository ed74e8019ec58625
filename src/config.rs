use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::flags::FlagSetting;

/// Environment variable naming an extra configuration file.
pub const CONFIG_PATH_VAR: &str = "CRM_CONFIG";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub jwt: JwtSettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub flags: FlagSettings,
    /// Create a demo tenant and owner at boot.
    #[serde(default)]
    pub seed_demo: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: String,
    /// Privileged connection used only for migrations; falls back to `url`.
    #[serde(default)]
    pub admin_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            admin_url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtSettings {
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_expiration")]
    pub expiration_seconds: i64,
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

fn default_expiration() -> i64 {
    86_400
}

fn default_issuer() -> String {
    "crmcore".to_string()
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            expiration_seconds: default_expiration(),
            issuer: default_issuer(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LedgerSettings {
    #[serde(default = "default_recent")]
    pub recent_transactions: u32,
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

fn default_recent() -> u32 {
    10
}

fn default_page_size() -> u32 {
    20
}

fn default_max_page_size() -> u32 {
    100
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            recent_transactions: default_recent(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagSettings {
    #[serde(default = "default_refresh")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub features: HashMap<String, FlagSetting>,
}

fn default_refresh() -> u64 {
    30
}

impl Default for FlagSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh(),
            features: HashMap::new(),
        }
    }
}

impl Settings {
    /// Layer `config/default.toml`, the file named by `CRM_CONFIG`, and
    /// `CRM__*` environment variables. The bare `DATABASE_URL`,
    /// `DATABASE_ADMIN_URL` and `JWT_SECRET` variables override the rest.
    pub fn load() -> Result<Self> {
        let settings: Settings = base_builder(env::var(CONFIG_PATH_VAR).ok().as_deref())
            .set_override_option("database.url", env::var("DATABASE_URL").ok())?
            .set_override_option("database.admin_url", env::var("DATABASE_ADMIN_URL").ok())?
            .set_override_option("jwt.secret", env::var("JWT_SECRET").ok())?
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        if settings.database.url.is_empty() {
            anyhow::bail!("DATABASE_URL (or database.url) must be set");
        }
        if settings.jwt.secret.is_empty() {
            anyhow::bail!("JWT_SECRET (or jwt.secret) must be set");
        }
        Ok(settings)
    }

    pub fn admin_database_url(&self) -> &str {
        self.database
            .admin_url
            .as_deref()
            .unwrap_or(&self.database.url)
    }
}

fn base_builder(extra_file: Option<&str>) -> config::ConfigBuilder<config::builder::DefaultState> {
    let mut builder = Config::builder().add_source(File::with_name("config/default").required(false));
    if let Some(path) = extra_file {
        builder = builder.add_source(File::with_name(path).required(true));
    }
    builder.add_source(Environment::with_prefix("CRM").separator("__"))
}

/// Re-read only the feature flag table from the configuration sources.
pub fn load_flag_features(extra_file: Option<&str>) -> Result<HashMap<String, FlagSetting>> {
    let cfg = base_builder(extra_file)
        .build()
        .context("failed to reload configuration")?;
    match cfg.get::<HashMap<String, FlagSetting>>("flags.features") {
        Ok(features) => Ok(features),
        Err(config::ConfigError::NotFound(_)) => Ok(HashMap::new()),
        Err(e) => Err(e).context("invalid flags.features table"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let s = Settings::default();
        assert_eq!(s.ledger.max_page_size, 100);
        assert_eq!(s.ledger.default_page_size, 20);
        assert_eq!(s.ledger.recent_transactions, 10);
        assert_eq!(s.flags.refresh_interval_secs, 30);
        assert_eq!(s.jwt.issuer, "crmcore");
    }

    #[test]
    fn admin_url_falls_back_to_application_url() {
        let mut s = Settings::default();
        s.database.url = "postgres://app@localhost/crm".into();
        assert_eq!(s.admin_database_url(), "postgres://app@localhost/crm");
        s.database.admin_url = Some("postgres://admin@localhost/crm".into());
        assert_eq!(s.admin_database_url(), "postgres://admin@localhost/crm");
    }
}
