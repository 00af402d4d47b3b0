//! Terminal pairing credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. The non-secret part of the identity
//! is mirrored into `local_settings` so heartbeat and logging can still name
//! the terminal when the keyring is locked.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::api::{
    extract_admin_url_from_connection_string, extract_api_key_from_connection_string,
    extract_terminal_id_from_connection_string, normalize_admin_url,
};
use crate::db::{LocalStore, TerminalIdentity};
use crate::error::{Result, SyncError};
use crate::logging::mask_terminal_id;
use crate::value_str;

const SERVICE_NAME: &str = "the-small-pos";

const KEY_ADMIN_URL: &str = "admin_dashboard_url";
const KEY_TERMINAL_ID: &str = "terminal_id";
const KEY_API_KEY: &str = "pos_api_key";
const KEY_BRANCH_ID: &str = "branch_id";

const ALL_KEYS: &[&str] = &[KEY_ADMIN_URL, KEY_TERMINAL_ID, KEY_API_KEY, KEY_BRANCH_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Credentials(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| SyncError::Credentials(e.to_string()))
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Credentials(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(SyncError::Credentials(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PairingInfo {
    pub admin_url: String,
    pub api_key: Zeroizing<String>,
    pub terminal_id: String,
    pub branch_id: Option<String>,
}

impl std::fmt::Debug for PairingInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingInfo")
            .field("admin_url", &self.admin_url)
            .field("api_key", &"***")
            .field("terminal_id", &mask_terminal_id(&self.terminal_id))
            .field("branch_id", &self.branch_id)
            .finish()
    }
}

impl PairingInfo {
    /// Parse an onboarding payload. `apiKey` may be a connection string, in
    /// which case its embedded url and terminal id take precedence.
    pub fn from_onboarding(payload: &Value) -> Result<Self> {
        let raw_api_key = value_str(payload, &["apiKey", "pos_api_key"])
            .ok_or_else(|| SyncError::Config("missing required field: apiKey".into()))?;
        let mut terminal_id = value_str(payload, &["terminalId", "terminal_id"]);
        let mut admin_url =
            value_str(payload, &["adminDashboardUrl", "adminUrl", "admin_dashboard_url"]);

        let mut api_key = raw_api_key.clone();
        if let Some(decoded_key) = extract_api_key_from_connection_string(&raw_api_key) {
            api_key = decoded_key;
            if let Some(decoded_tid) = extract_terminal_id_from_connection_string(&raw_api_key) {
                terminal_id = Some(decoded_tid);
            }
            if let Some(decoded_url) = extract_admin_url_from_connection_string(&raw_api_key) {
                admin_url = Some(decoded_url);
            }
        }

        let terminal_id = terminal_id
            .ok_or_else(|| SyncError::Config("missing required field: terminalId".into()))?;
        let admin_url =
            admin_url.ok_or_else(|| SyncError::Config("missing required field: adminUrl".into()))?;

        Ok(Self {
            admin_url: normalize_admin_url(&admin_url),
            api_key: Zeroizing::new(api_key),
            terminal_id,
            branch_id: value_str(payload, &["branchId", "branch_id"]),
        })
    }

    pub fn identity(&self) -> TerminalIdentity {
        TerminalIdentity {
            terminal_id: self.terminal_id.clone(),
            branch_id: self.branch_id.clone(),
        }
    }
}

/// The terminal counts as paired when admin URL, terminal id and API key are
/// all present.
pub fn load_pairing() -> Option<PairingInfo> {
    let admin_url = get_credential(KEY_ADMIN_URL)?;
    let terminal_id = get_credential(KEY_TERMINAL_ID)?;
    let api_key = get_credential(KEY_API_KEY)?;
    Some(PairingInfo {
        admin_url,
        api_key: Zeroizing::new(api_key),
        terminal_id,
        branch_id: get_credential(KEY_BRANCH_ID),
    })
}

pub fn store_pairing(info: &PairingInfo, store: &LocalStore) -> Result<()> {
    set_credential(KEY_ADMIN_URL, &info.admin_url)?;
    set_credential(KEY_TERMINAL_ID, &info.terminal_id)?;
    set_credential(KEY_API_KEY, info.api_key.as_str())?;
    match &info.branch_id {
        Some(branch) => set_credential(KEY_BRANCH_ID, branch)?,
        None => delete_credential(KEY_BRANCH_ID)?,
    }
    store.set_pairing_info(&info.identity())?;
    info!(terminal_id = %mask_terminal_id(&info.terminal_id), "terminal paired");
    Ok(())
}

/// Factory reset: forget every stored credential.
pub fn clear_pairing() -> Result<()> {
    info!("clearing terminal pairing credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde_json::json;

    #[test]
    fn test_onboarding_payload_with_connection_string() {
        let connection = STANDARD.encode(
            json!({ "url": "admin.example.com/api", "key": "live-key", "tid": "term-9001" })
                .to_string(),
        );
        let info = PairingInfo::from_onboarding(&json!({
            "apiKey": connection,
            "terminalId": "ignored",
            "branchId": "b-1"
        }))
        .unwrap();

        assert_eq!(info.admin_url, "https://admin.example.com");
        assert_eq!(info.api_key.as_str(), "live-key");
        assert_eq!(info.terminal_id, "term-9001");
        assert_eq!(info.branch_id.as_deref(), Some("b-1"));
        assert!(!format!("{info:?}").contains("live-key"));
    }

    #[test]
    fn test_onboarding_payload_requires_terminal() {
        let payload = json!({ "apiKey": "k", "adminUrl": "x.io" });
        let err = PairingInfo::from_onboarding(&payload).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
