//! Terminal heartbeat.
//!
//! Reports health on its own timer, independent of dataset sync. A tick
//! while the admin dashboard is unreachable only records when the outage
//! started; the first heartbeat after reconnecting carries that timestamp.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::api::SyncApi;
use crate::db::{LocalStore, TerminalIdentity};
use crate::error::Result;
use crate::logging::mask_terminal_id;
use crate::value_bool;

pub const HEARTBEAT_PATH: &str = "/sync/heartbeat/";

/// Sync-loop state sampled at each tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncActivity {
    pub is_syncing: bool,
    pub is_flushing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_flush_at: Option<DateTime<Utc>>,
    /// Cart operations still waiting for an acknowledgement.
    pub pending_cart_operations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatStatus {
    pub terminal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    pub app_version: String,
    pub online: bool,
    pub is_flushing: bool,
    pub pending_orders: u32,
    pub conflicted_orders: u32,
    pub failed_orders: u32,
    pub pending_operations: usize,
    pub exposure: f64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_flush_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_since: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Server directives carried in a heartbeat response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatDirectives {
    pub force_sync: bool,
    pub force_flush: bool,
}

impl HeartbeatDirectives {
    pub fn from_response(body: &Value) -> Self {
        Self {
            force_sync: value_bool(body, &["force_sync", "forceSync"]).unwrap_or(false),
            force_flush: value_bool(body, &["force_flush", "forceFlush"]).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatOutcome {
    /// Dashboard unreachable; nothing was sent.
    Skipped { offline_since: DateTime<Utc> },
    Sent(HeartbeatDirectives),
}

pub struct HeartbeatReporter {
    api: Arc<dyn SyncApi>,
    store: Arc<LocalStore>,
    identity: TerminalIdentity,
    app_version: String,
    offline_since: Mutex<Option<DateTime<Utc>>>,
}

impl HeartbeatReporter {
    pub fn new(
        api: Arc<dyn SyncApi>,
        store: Arc<LocalStore>,
        identity: TerminalIdentity,
        app_version: &str,
    ) -> Self {
        Self {
            api,
            store,
            identity,
            app_version: app_version.to_string(),
            offline_since: Mutex::new(None),
        }
    }

    pub fn offline_since(&self) -> Option<DateTime<Utc>> {
        *self.offline_since.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn build_status(
        &self,
        activity: &SyncActivity,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatStatus> {
        let queue = self.store.get_queue_stats()?;
        Ok(HeartbeatStatus {
            terminal_id: self.identity.terminal_id.clone(),
            branch_id: self.identity.branch_id.clone(),
            app_version: self.app_version.clone(),
            online: true,
            is_flushing: activity.is_flushing,
            pending_orders: queue.pending,
            conflicted_orders: queue.conflicted,
            failed_orders: queue.failed,
            pending_operations: activity.pending_cart_operations,
            exposure: queue.exposure,
            last_sync_at: activity.last_sync_at,
            last_flush_at: activity.last_flush_at,
            offline_since: self.offline_since(),
            timestamp: now,
        })
    }

    pub async fn tick(&self, activity: &SyncActivity) -> Result<HeartbeatOutcome> {
        let now = Utc::now();
        if !self.api.is_reachable().await {
            let mut guard = self.offline_since.lock().unwrap_or_else(|p| p.into_inner());
            let since = *guard.get_or_insert(now);
            debug!(offline_since = %since, "heartbeat skipped while offline");
            return Ok(HeartbeatOutcome::Skipped { offline_since: since });
        }

        let status = self.build_status(activity, now)?;
        let reconnected = status.offline_since;
        let response = self
            .api
            .post_json(HEARTBEAT_PATH, &serde_json::to_value(&status)?)
            .await?;

        // Only clear the outage marker once the server has seen it.
        if let Some(since) = reconnected {
            let mut guard = self.offline_since.lock().unwrap_or_else(|p| p.into_inner());
            if *guard == Some(since) {
                *guard = None;
            }
            info!(
                terminal_id = %mask_terminal_id(&self.identity.terminal_id),
                offline_secs = (now - since).num_seconds(),
                "terminal back online"
            );
        }

        let directives = HeartbeatDirectives::from_response(&response);
        if directives != HeartbeatDirectives::default() {
            debug!(?directives, "heartbeat directives received");
        }
        Ok(HeartbeatOutcome::Sent(directives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::test_support::FakeApi;
    use serde_json::json;

    fn reporter(api: Arc<FakeApi>) -> HeartbeatReporter {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        HeartbeatReporter::new(
            api,
            store,
            TerminalIdentity {
                terminal_id: "term-1".into(),
                branch_id: Some("b-1".into()),
            },
            "1.0.0",
        )
    }

    #[tokio::test]
    async fn test_offline_tick_sends_nothing() {
        let api = FakeApi::new();
        api.set_reachable(false);
        let reporter = reporter(api.clone());

        let first = reporter.tick(&SyncActivity::default()).await.unwrap();
        let second = reporter.tick(&SyncActivity::default()).await.unwrap();

        assert!(api.requests().is_empty());
        match (first, second) {
            (
                HeartbeatOutcome::Skipped { offline_since: a },
                HeartbeatOutcome::Skipped { offline_since: b },
            ) => assert_eq!(a, b),
            other => panic!("expected skipped ticks, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_reports_offline_since_once() {
        let api = FakeApi::new();
        api.set_reachable(false);
        let reporter = reporter(api.clone());
        reporter.tick(&SyncActivity::default()).await.unwrap();
        let since = reporter.offline_since().unwrap();

        api.set_reachable(true);
        api.push(HEARTBEAT_PATH, Ok(json!({ "success": true })));
        api.push(HEARTBEAT_PATH, Ok(json!({ "success": true })));
        reporter.tick(&SyncActivity::default()).await.unwrap();
        reporter.tick(&SyncActivity::default()).await.unwrap();

        let sent = api.requests_to(HEARTBEAT_PATH);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["offline_since"], json!(since));
        assert!(sent[1].get("offline_since").is_none());
        assert_eq!(sent[0]["terminal_id"], "term-1");
        assert_eq!(sent[0]["online"], true);
    }

    #[tokio::test]
    async fn test_failed_post_keeps_outage_marker() {
        let api = FakeApi::new();
        api.set_reachable(false);
        let reporter = reporter(api.clone());
        reporter.tick(&SyncActivity::default()).await.unwrap();

        api.set_reachable(true);
        api.push(HEARTBEAT_PATH, Err(ApiError::Timeout));
        assert!(reporter.tick(&SyncActivity::default()).await.is_err());
        assert!(reporter.offline_since().is_some());
    }

    #[tokio::test]
    async fn test_directives_and_activity_fields() {
        let api = FakeApi::new();
        api.push(HEARTBEAT_PATH, Ok(json!({ "force_sync": true, "forceFlush": "true" })));
        let reporter = reporter(api.clone());
        let activity = SyncActivity {
            is_flushing: true,
            pending_cart_operations: 2,
            ..Default::default()
        };

        let outcome = reporter.tick(&activity).await.unwrap();
        assert_eq!(
            outcome,
            HeartbeatOutcome::Sent(HeartbeatDirectives {
                force_sync: true,
                force_flush: true
            })
        );
        let sent = &api.requests_to(HEARTBEAT_PATH)[0];
        assert_eq!(sent["is_flushing"], true);
        assert_eq!(sent["pending_operations"], 2);
        assert_eq!(sent["pending_orders"], 0);
    }

    #[test]
    fn test_missing_directives_default_to_false() {
        assert_eq!(
            HeartbeatDirectives::from_response(&Value::Null),
            HeartbeatDirectives::default()
        );
    }
}
