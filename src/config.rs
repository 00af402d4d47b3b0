//! Engine configuration.
//!
//! Environment variables override the pairing credentials held in the OS
//! keyring. Intervals and tolerances fall back to the defaults below.

use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

use crate::api::{extract_admin_url_from_connection_string, normalize_admin_url, DEFAULT_TIMEOUT};
use crate::error::{Result, SyncError};
use crate::money::DRIFT_TOLERANCE;
use crate::storage::PairingInfo;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PAGES_PER_DATASET: u32 = 50;

const ENV_ADMIN_URL: &str = "POS_SYNC_ADMIN_URL";
const ENV_API_KEY: &str = "POS_SYNC_API_KEY";
const ENV_TERMINAL_ID: &str = "POS_SYNC_TERMINAL_ID";
const ENV_DATA_DIR: &str = "POS_SYNC_DATA_DIR";
const ENV_SYNC_INTERVAL: &str = "POS_SYNC_INTERVAL_SECS";
const ENV_HEARTBEAT_INTERVAL: &str = "POS_HEARTBEAT_INTERVAL_SECS";

#[derive(Clone)]
pub struct EngineConfig {
    pub admin_url: String,
    pub api_key: Zeroizing<String>,
    pub terminal_id: String,
    pub branch_id: Option<String>,
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
    pub heartbeat_interval: Duration,
    pub http_timeout: Duration,
    pub drift_tolerance: f64,
    pub max_pages_per_dataset: u32,
    pub app_version: String,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("admin_url", &self.admin_url)
            .field("terminal_id", &crate::logging::mask_terminal_id(&self.terminal_id))
            .field("data_dir", &self.data_dir)
            .field("sync_interval", &self.sync_interval)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Config for an already-known pairing, with default tunables.
    pub fn from_pairing(pairing: &PairingInfo, data_dir: PathBuf) -> Self {
        Self {
            admin_url: normalize_admin_url(&pairing.admin_url),
            api_key: pairing.api_key.clone(),
            terminal_id: pairing.terminal_id.clone(),
            branch_id: pairing.branch_id.clone(),
            data_dir,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            http_timeout: DEFAULT_TIMEOUT,
            drift_tolerance: DRIFT_TOLERANCE,
            max_pages_per_dataset: DEFAULT_MAX_PAGES_PER_DATASET,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Load from the process environment layered over the keyring.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok(), crate::storage::load_pairing)
    }

    /// `lookup` and `keyring` are injected so the layering is testable.
    pub fn load_with(
        lookup: impl Fn(&str) -> Option<String>,
        keyring: impl FnOnce() -> Option<PairingInfo>,
    ) -> Result<Self> {
        let env = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let stored = keyring();

        let api_key = env(ENV_API_KEY)
            .map(Zeroizing::new)
            .or_else(|| stored.as_ref().map(|p| p.api_key.clone()))
            .ok_or(SyncError::NotPaired)?;
        let admin_url = env(ENV_ADMIN_URL)
            .or_else(|| extract_admin_url_from_connection_string(&api_key))
            .or_else(|| stored.as_ref().map(|p| p.admin_url.clone()))
            .ok_or(SyncError::NotPaired)?;
        let terminal_id = env(ENV_TERMINAL_ID)
            .or_else(|| crate::api::extract_terminal_id_from_connection_string(&api_key))
            .or_else(|| stored.as_ref().map(|p| p.terminal_id.clone()))
            .ok_or(SyncError::NotPaired)?;

        let data_dir = env(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let pairing = PairingInfo {
            admin_url,
            api_key,
            terminal_id,
            branch_id: stored.and_then(|p| p.branch_id),
        };
        let mut config = Self::from_pairing(&pairing, data_dir);
        if let Some(secs) = parse_secs(env(ENV_SYNC_INTERVAL), ENV_SYNC_INTERVAL)? {
            config.sync_interval = secs;
        }
        if let Some(secs) = parse_secs(env(ENV_HEARTBEAT_INTERVAL), ENV_HEARTBEAT_INTERVAL)? {
            config.heartbeat_interval = secs;
        }
        debug!(?config, "engine configuration loaded");
        Ok(config)
    }
}

fn parse_secs(raw: Option<String>, name: &str) -> Result<Option<Duration>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(0) | Err(_) => Err(SyncError::Config(format!(
            "{name} must be a positive number of seconds, got {raw:?}"
        ))),
        Ok(secs) => Ok(Some(Duration::from_secs(secs))),
    }
}

/// `POS_SYNC_DATA_DIR` when set, else the platform default. Used before a
/// full config can be loaded (pairing, factory reset).
pub fn resolve_data_dir() -> PathBuf {
    std::env::var(ENV_DATA_DIR)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_data_dir)
}

/// Platform data dir (`%LOCALAPPDATA%`, `$XDG_DATA_HOME` or
/// `~/.local/share`) joined with the app folder.
pub fn default_data_dir() -> PathBuf {
    std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        })
        .join("the-small-pos")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn stored() -> Option<PairingInfo> {
        Some(PairingInfo {
            admin_url: "https://stored.example.com".into(),
            api_key: Zeroizing::new("stored-key".into()),
            terminal_id: "term-stored".into(),
            branch_id: Some("b-1".into()),
        })
    }

    #[test]
    fn test_environment_overrides_keyring() {
        let config = EngineConfig::load_with(
            env_of(&[
                (ENV_ADMIN_URL, "env.example.com/api"),
                (ENV_API_KEY, "env-key"),
                (ENV_DATA_DIR, "/tmp/pos"),
                (ENV_SYNC_INTERVAL, "5"),
            ]),
            stored,
        )
        .unwrap();

        assert_eq!(config.admin_url, "https://env.example.com");
        assert_eq!(config.api_key.as_str(), "env-key");
        assert_eq!(config.terminal_id, "term-stored");
        assert_eq!(config.branch_id.as_deref(), Some("b-1"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pos"));
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.drift_tolerance, DRIFT_TOLERANCE);
    }

    #[test]
    fn test_unpaired_terminal_is_reported() {
        let err = EngineConfig::load_with(env_of(&[]), || None).unwrap_err();
        assert!(matches!(err, SyncError::NotPaired));
    }

    #[test]
    fn test_invalid_interval_is_rejected() {
        let err = EngineConfig::load_with(env_of(&[(ENV_SYNC_INTERVAL, "0")]), stored).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
