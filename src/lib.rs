//! The Small POS - offline-first cart and sync engine
//!
//! The cart state machine applies every command to local state first and
//! hands the resulting operation to a `Gateway`; server pushes are merged by
//! the drift reconciler. In the background, `sync` keeps the reference
//! datasets current, flushes orders completed while offline and reports
//! terminal health.

use serde_json::Value;

pub mod api;
pub mod calculator;
pub mod cart;
pub mod catalog;
pub mod config;
pub mod dataset_sync;
pub mod db;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod ingestion;
pub mod logging;
pub mod money;
pub mod operations;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use api::{AdminClient, ApiError, SyncApi};
pub use cart::{CartMachine, CommitOutcome, PendingCommit};
pub use config::EngineConfig;
pub use db::LocalStore;
pub use error::{CartError, Result, SyncError};
pub use sync::{start_heartbeat_loop, start_sync_loop, SyncEngine};

// ---------------------------------------------------------------------------
// Loose JSON field access
// ---------------------------------------------------------------------------
//
// Admin dashboard payloads are not uniform across endpoints (snake_case vs
// camelCase, numbers sent as strings), so readers try several keys.

/// First non-empty string among `keys`, trimmed.
pub(crate) fn value_str(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        v.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

pub(crate) fn value_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| v.get(*key).and_then(Value::as_f64))
}

/// Accepts booleans, 0/1 and the usual string spellings.
pub(crate) fn value_bool(v: &Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        let Some(value) = v.get(*key) else {
            continue;
        };
        if let Some(flag) = value.as_bool() {
            return Some(flag);
        }
        if let Some(flag) = value.as_i64() {
            return Some(flag == 1);
        }
        if let Some(flag) = value.as_str() {
            match flag.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => return Some(true),
                "false" | "0" | "no" | "off" => return Some(false),
                _ => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_helpers_try_keys_in_order() {
        let v = json!({
            "name": "  ",
            "title": " Latte ",
            "price": 3.5,
            "active": "yes",
            "flag": 0,
        });
        assert_eq!(value_str(&v, &["name", "title"]).as_deref(), Some("Latte"));
        assert_eq!(value_f64(&v, &["missing", "price"]), Some(3.5));
        assert_eq!(value_bool(&v, &["active"]), Some(true));
        assert_eq!(value_bool(&v, &["flag"]), Some(false));
        assert_eq!(value_bool(&v, &["name"]), None);
    }
}
