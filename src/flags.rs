//! Feature gates and kill switches.
//!
//! Flags are process-wide, fetched from a [`FlagProvider`] and cached for a
//! bounded interval. Every lookup fails closed: a missing flag, a flag whose
//! `disabled` switch is set, or a provider that cannot be reached all mean the
//! feature is off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Flag guarding credit account and transaction writes.
pub const CREDIT_WRITES: &str = "credit_writes";
/// Flag guarding loyalty point redemption.
pub const LOYALTY_REDEMPTION: &str = "loyalty_redemption";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub struct FlagSetting {
    #[serde(default)]
    pub enabled: bool,
    /// Kill switch. Overrides `enabled` when set.
    #[serde(default)]
    pub disabled: bool,
}

impl FlagSetting {
    pub fn on() -> Self {
        Self {
            enabled: true,
            disabled: false,
        }
    }

    pub fn killed() -> Self {
        Self {
            enabled: true,
            disabled: true,
        }
    }

    pub fn allows(&self) -> bool {
        self.enabled && !self.disabled
    }
}

#[async_trait]
pub trait FlagProvider: Send + Sync {
    async fn fetch(&self) -> Result<HashMap<String, FlagSetting>>;
}

/// Reads `flags.features` from the layered configuration on every fetch.
pub struct FileFlagProvider {
    extra_file: Option<String>,
}

impl FileFlagProvider {
    pub fn new(extra_file: Option<String>) -> Self {
        Self { extra_file }
    }
}

#[async_trait]
impl FlagProvider for FileFlagProvider {
    async fn fetch(&self) -> Result<HashMap<String, FlagSetting>> {
        let extra = self.extra_file.clone();
        tokio::task::spawn_blocking(move || crate::config::load_flag_features(extra.as_deref()))
            .await?
    }
}

/// Fixed flag table, swappable at runtime.
#[derive(Default)]
pub struct StaticFlagProvider {
    flags: std::sync::RwLock<HashMap<String, FlagSetting>>,
}

impl StaticFlagProvider {
    pub fn new(flags: HashMap<String, FlagSetting>) -> Self {
        Self {
            flags: std::sync::RwLock::new(flags),
        }
    }

    /// Every known feature switched on.
    pub fn all_enabled() -> Self {
        Self::new(HashMap::from([
            (CREDIT_WRITES.to_string(), FlagSetting::on()),
            (LOYALTY_REDEMPTION.to_string(), FlagSetting::on()),
        ]))
    }

    pub fn set(&self, name: &str, setting: FlagSetting) {
        if let Ok(mut flags) = self.flags.write() {
            flags.insert(name.to_string(), setting);
        }
    }
}

#[async_trait]
impl FlagProvider for StaticFlagProvider {
    async fn fetch(&self) -> Result<HashMap<String, FlagSetting>> {
        self.flags
            .read()
            .map(|flags| flags.clone())
            .map_err(|_| anyhow::anyhow!("flag table lock poisoned"))
    }
}

struct Snapshot {
    flags: HashMap<String, FlagSetting>,
    fetched_at: Option<Instant>,
}

/// Cached view over a [`FlagProvider`].
pub struct FeatureFlags {
    provider: Arc<dyn FlagProvider>,
    refresh_interval: Duration,
    snapshot: RwLock<Snapshot>,
}

impl FeatureFlags {
    pub fn new(provider: Arc<dyn FlagProvider>, refresh_interval: Duration) -> Self {
        Self {
            provider,
            refresh_interval,
            snapshot: RwLock::new(Snapshot {
                flags: HashMap::new(),
                fetched_at: None,
            }),
        }
    }

    /// Fetch now, replacing the cached table. On error the table is emptied.
    pub async fn refresh(&self) {
        let fetched = self.provider.fetch().await;
        let mut snapshot = self.snapshot.write().await;
        match fetched {
            Ok(flags) => {
                debug!(count = flags.len(), "feature flags refreshed");
                snapshot.flags = flags;
            }
            Err(e) => {
                warn!(error = %e, "feature flag refresh failed, disabling all gated features");
                snapshot.flags.clear();
            }
        }
        snapshot.fetched_at = Some(Instant::now());
    }

    /// Whether `name` is present, enabled and not killed.
    pub async fn allows(&self, name: &str) -> bool {
        let stale = {
            let snapshot = self.snapshot.read().await;
            snapshot
                .fetched_at
                .is_none_or(|at| at.elapsed() >= self.refresh_interval)
        };
        if stale {
            self.refresh().await;
        }
        self.snapshot
            .read()
            .await
            .flags
            .get(name)
            .is_some_and(FlagSetting::allows)
    }
}
