//! Headless sync agent for a paired terminal.
//!
//! `run` (the default) drives dataset sync, the offline-order flush and the
//! heartbeat until interrupted. `pair` and `unpair` manage the credentials
//! held in the OS keyring.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use the_small_pos_sync::config::resolve_data_dir;
use the_small_pos_sync::db::TerminalIdentity;
use the_small_pos_sync::logging::{default_log_dir, init_logging, mask_terminal_id};
use the_small_pos_sync::storage::{clear_pairing, store_pairing, PairingInfo};
use the_small_pos_sync::{
    start_heartbeat_loop, start_sync_loop, AdminClient, EngineConfig, LocalStore, SyncEngine,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync agent until interrupted
    Run,
    /// Store pairing credentials from an onboarding payload
    Pair {
        /// JSON file as issued by the admin dashboard
        onboarding: PathBuf,
    },
    /// Forget the stored pairing credentials (factory reset)
    Unpair,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Pair { onboarding } => pair(&onboarding),
        Commands::Unpair => unpair(),
    }
}

async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::load().context("failed to load engine configuration")?;
    let _log_guard =
        init_logging(&default_log_dir(&config.data_dir)).context("failed to initialise logging")?;

    info!(
        version = %config.app_version,
        terminal_id = %mask_terminal_id(&config.terminal_id),
        admin_url = %config.admin_url,
        "starting sync agent"
    );

    let store =
        Arc::new(LocalStore::open(&config.data_dir).context("failed to open local database")?);
    let identity = TerminalIdentity {
        terminal_id: config.terminal_id.clone(),
        branch_id: config.branch_id.clone(),
    };
    store.set_pairing_info(&identity)?;

    let client = AdminClient::new(
        &config.admin_url,
        config.api_key.as_str(),
        &config.terminal_id,
        config.http_timeout,
    )?;
    let probe = client.check_connectivity().await;
    if probe.success {
        info!(latency_ms = ?probe.latency_ms, "admin dashboard reachable");
    } else {
        warn!(error = ?probe.error, "admin dashboard unreachable, running offline");
    }

    let engine = Arc::new(SyncEngine::new(Arc::new(client), store, identity, &config));
    let sync_task = start_sync_loop(engine.clone(), config.sync_interval);
    let heartbeat_task = start_heartbeat_loop(engine.clone(), config.heartbeat_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    engine.shutdown();
    let (sync_result, heartbeat_result) = tokio::join!(sync_task, heartbeat_task);
    sync_result?;
    heartbeat_result?;

    info!("sync agent stopped");
    Ok(())
}

fn pair(onboarding: &Path) -> anyhow::Result<()> {
    let data_dir = resolve_data_dir();
    let _log_guard =
        init_logging(&default_log_dir(&data_dir)).context("failed to initialise logging")?;

    let raw = std::fs::read_to_string(onboarding)
        .with_context(|| format!("failed to read {}", onboarding.display()))?;
    let payload: Value =
        serde_json::from_str(&raw).context("onboarding payload is not valid JSON")?;
    let pairing = PairingInfo::from_onboarding(&payload)?;

    let store = LocalStore::open(&data_dir).context("failed to open local database")?;
    store_pairing(&pairing, &store)?;
    info!(admin_url = %pairing.admin_url, "pairing stored");
    Ok(())
}

fn unpair() -> anyhow::Result<()> {
    let _log_guard = init_logging(&default_log_dir(&resolve_data_dir()))
        .context("failed to initialise logging")?;
    clear_pairing()?;
    Ok(())
}
