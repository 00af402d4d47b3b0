//! Background sync orchestration.
//!
//! Two independent loops run per paired terminal: the sync loop (dataset
//! pull followed by the offline-order flush) and the heartbeat loop. Both
//! stop when the shared `CancellationToken` is cancelled.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::SyncApi;
use crate::cart::{CartMachine, CommitOutcome};
use crate::catalog::load_pricing_settings;
use crate::config::EngineConfig;
use crate::dataset_sync::{DatasetSyncManager, DatasetSyncReport};
use crate::db::{LocalStore, TerminalIdentity};
use crate::error::{Result, SyncError};
use crate::heartbeat::{HeartbeatDirectives, HeartbeatOutcome, HeartbeatReporter, SyncActivity};
use crate::ingestion::{FlushReport, OfflineOrderFlusher};

fn is_auth_failure(error: &SyncError) -> bool {
    matches!(error, SyncError::Api(e) if e.is_auth_failure())
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Run guards and timestamps shared by the loops and the force entry points.
#[derive(Debug, Default)]
pub struct SyncState {
    is_syncing: AtomicBool,
    is_flushing: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    last_flush: Mutex<Option<DateTime<Utc>>>,
    shutdown: CancellationToken,
}

/// Clears its flag on drop, including when the guarded future is cancelled.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncState {
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.is_flushing.load(Ordering::Acquire)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn last_flush(&self) -> Option<DateTime<Utc>> {
        *self.last_flush.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn mark_synced(&self, at: DateTime<Utc>) {
        *self.last_sync.lock().unwrap_or_else(|p| p.into_inner()) = Some(at);
    }

    fn mark_flushed(&self, at: DateTime<Utc>) {
        *self.last_flush.lock().unwrap_or_else(|p| p.into_inner()) = Some(at);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncCycleReport {
    pub datasets: Vec<DatasetSyncReport>,
    pub flush: Option<FlushReport>,
    pub pricing_reloaded: bool,
    pub retried_operations: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    api: Arc<dyn SyncApi>,
    store: Arc<LocalStore>,
    datasets: DatasetSyncManager,
    flusher: OfflineOrderFlusher,
    heartbeat: HeartbeatReporter,
    cart: Option<CartMachine>,
    state: SyncState,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn SyncApi>,
        store: Arc<LocalStore>,
        identity: TerminalIdentity,
        config: &EngineConfig,
    ) -> Self {
        Self {
            datasets: DatasetSyncManager::new(api.clone(), store.clone())
                .with_max_pages(config.max_pages_per_dataset),
            flusher: OfflineOrderFlusher::new(api.clone(), store.clone(), identity.clone()),
            heartbeat: HeartbeatReporter::new(
                api.clone(),
                store.clone(),
                identity,
                &config.app_version,
            ),
            api,
            store,
            cart: None,
            state: SyncState::default(),
        }
    }

    /// Attach the live cart so each cycle refreshes its pricing settings and
    /// retries its deferred operations.
    pub fn with_cart(mut self, cart: CartMachine) -> Self {
        self.cart = Some(cart);
        self
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn shutdown(&self) {
        info!("sync engine shutting down");
        self.state.shutdown.cancel();
    }

    pub fn activity(&self) -> SyncActivity {
        SyncActivity {
            is_syncing: self.state.is_syncing(),
            is_flushing: self.state.is_flushing(),
            last_sync_at: self.state.last_sync(),
            last_flush_at: self.state.last_flush(),
            pending_cart_operations: self
                .cart
                .as_ref()
                .map(|cart| cart.registry_stats().in_flight)
                .unwrap_or_default(),
        }
    }

    /// One full cycle: datasets in dependency order, then the offline
    /// queue. Returns `Ok(None)` without doing anything when a cycle is
    /// already running.
    ///
    /// A dataset failure stops the remaining datasets but the queue is
    /// still flushed; the dataset error is returned afterwards.
    pub async fn run_sync_cycle(&self) -> Result<Option<SyncCycleReport>> {
        let Some(_guard) = RunGuard::acquire(&self.state.is_syncing) else {
            debug!("sync cycle already running");
            return Ok(None);
        };

        let mut report = SyncCycleReport::default();
        let dataset_result = self.datasets.sync_all().await;
        if let Ok(datasets) = &dataset_result {
            report.datasets = datasets.clone();
            report.pricing_reloaded = self.reload_pricing(datasets);
        }

        report.flush = self.flush_queue().await?;

        if let Some(cart) = &self.cart {
            let outcomes = cart.retry_pending().await;
            report.retried_operations = outcomes.len();
            let confirmed = outcomes
                .iter()
                .filter(|o| matches!(o, CommitOutcome::Confirmed))
                .count();
            if !outcomes.is_empty() {
                debug!(retried = outcomes.len(), confirmed, "deferred cart operations retried");
            }
        }

        dataset_result?;
        self.state.mark_synced(Utc::now());
        Ok(Some(report))
    }

    fn reload_pricing(&self, datasets: &[DatasetSyncReport]) -> bool {
        let Some(cart) = &self.cart else {
            return false;
        };
        let changed = datasets.iter().any(|r| {
            r.dataset.is_some_and(|d| d.affects_pricing()) && r.upserted + r.deleted > 0
        });
        if !changed {
            return false;
        }
        match load_pricing_settings(&self.store) {
            Ok(settings) => {
                cart.replace_settings(settings);
                info!("pricing settings reloaded");
                true
            }
            Err(e) => {
                warn!("failed to reload pricing settings: {e}");
                false
            }
        }
    }

    /// Submit queued offline orders. `Ok(None)` when a flush is already in
    /// progress.
    pub async fn flush_queue(&self) -> Result<Option<FlushReport>> {
        let Some(_guard) = RunGuard::acquire(&self.state.is_flushing) else {
            debug!("offline queue flush already running");
            return Ok(None);
        };
        let report = self.flusher.flush().await?;
        if !report.interrupted {
            self.state.mark_flushed(Utc::now());
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                accepted = report.accepted,
                conflicted = report.conflicted,
                rejected = report.rejected,
                interrupted = report.interrupted,
                "offline queue flushed"
            );
        }
        Ok(Some(report))
    }

    /// Returns false (and does nothing) when a cycle is already running.
    pub async fn force_sync(&self) -> Result<bool> {
        if self.state.is_syncing() {
            return Ok(false);
        }
        Ok(self.run_sync_cycle().await?.is_some())
    }

    /// Returns false (and does nothing) when a flush is already running.
    pub async fn force_flush(&self) -> Result<bool> {
        if self.state.is_flushing() {
            return Ok(false);
        }
        Ok(self.flush_queue().await?.is_some())
    }

    /// Send one heartbeat and honour its directives.
    pub async fn heartbeat_tick(&self) -> Result<HeartbeatOutcome> {
        let outcome = self.heartbeat.tick(&self.activity()).await?;
        if let HeartbeatOutcome::Sent(directives) = &outcome {
            self.apply_directives(*directives).await;
        }
        Ok(outcome)
    }

    async fn apply_directives(&self, directives: HeartbeatDirectives) {
        if directives.force_sync {
            match self.force_sync().await {
                Ok(true) => info!("server-requested sync completed"),
                Ok(false) => debug!("server-requested sync ignored, cycle already running"),
                Err(e) => warn!("server-requested sync failed: {e}"),
            }
        }
        if directives.force_flush {
            match self.force_flush().await {
                Ok(true) => info!("server-requested flush completed"),
                Ok(false) => debug!("server-requested flush ignored, flush already running"),
                Err(e) => warn!("server-requested flush failed: {e}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// Spawn the sync loop. Ticks while the dashboard is unreachable are
/// skipped; the queue stays pending until the next reachable tick.
pub fn start_sync_loop(engine: Arc<SyncEngine>, interval: Duration) -> JoinHandle<()> {
    let shutdown = engine.state.shutdown_token();
    tokio::spawn(async move {
        info!("Sync loop started (interval: {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous_online: Option<bool> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let online = engine.api.is_reachable().await;
            if !online {
                if previous_online != Some(false) {
                    info!("Network offline; deferring remote sync and keeping queue pending");
                }
                previous_online = Some(false);
                continue;
            }
            if previous_online == Some(false) {
                info!("Network restored; resuming queued sync");
            }
            previous_online = Some(true);

            match engine.run_sync_cycle().await {
                Ok(Some(report)) => {
                    let changed: usize =
                        report.datasets.iter().map(|r| r.upserted + r.deleted).sum();
                    if changed > 0 {
                        info!("Sync cycle complete: {changed} records changed");
                    }
                }
                Ok(None) => {}
                Err(e) if is_auth_failure(&e) => {
                    error!("Sync cycle rejected: terminal credentials are no longer valid ({e})");
                }
                Err(e) if e.is_transient() => debug!("Sync cycle deferred: {e}"),
                Err(e) => warn!("Sync cycle failed: {e}"),
            }
        }
        info!("Sync loop stopped");
    })
}

/// Spawn the heartbeat loop on its own timer.
pub fn start_heartbeat_loop(engine: Arc<SyncEngine>, interval: Duration) -> JoinHandle<()> {
    let shutdown = engine.state.shutdown_token();
    tokio::spawn(async move {
        info!("Heartbeat loop started (interval: {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match engine.heartbeat_tick().await {
                Ok(_) => {}
                Err(e) if e.is_transient() => debug!("Heartbeat deferred: {e}"),
                Err(e) => warn!("Heartbeat failed: {e}"),
            }
        }
        info!("Heartbeat loop stopped");
    })
}
