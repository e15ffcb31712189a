//! seekerd library.
//!
//! A headless Soulseek file-sharing daemon: a share indexer with masked
//! paths, an upload/download orchestrator, a supervised protocol-client
//! connection, and an optional controller/agent federation plane. The
//! binary wires these together; the library surface exists for embedders
//! (who supply a real protocol client) and for integration tests.

use std::sync::Arc;
use tokio::sync::mpsc;

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod state;
pub mod sync;

use config::{ChangeClass, OptionChange, OptionsStore};
use services::relay::{RelayAgent, RelayHub};
use services::shares::ShareService;
use services::soulseek::Supervisor;
use services::transfers::TransferOrchestrator;
use state::StateStore;
use sync::CancelHandle;

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub options: Arc<OptionsStore>,
    pub state: Arc<StateStore>,
    pub shares: Arc<ShareService>,
    pub orchestrator: Arc<TransferOrchestrator>,
    /// Present when running as a controller.
    pub relay: Option<Arc<RelayHub>>,
}

/// React to option changes that cross component boundaries: the
/// requires-restart flag, and share re-fills (with the follow-up uploads a
/// fill implies for agents and connected supervisors).
pub fn spawn_option_reactors(
    options: &OptionsStore,
    state: Arc<StateStore>,
    shares: Arc<ShareService>,
    agent: Option<Arc<RelayAgent>>,
    supervisor: Option<Arc<Supervisor>>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<OptionChange>>();

    let flag_state = Arc::clone(&state);
    options.subscribe(move |_, changes| {
        if changes
            .iter()
            .any(|change| change.change_class == ChangeClass::RequiresRestart)
        {
            flag_state.update(|current| {
                let mut next = current.clone();
                next.pending_restart = true;
                next
            });
        }
        let _ = tx.send(changes.to_vec());
    });

    tokio::spawn(async move {
        while let Some(changes) = rx.recv().await {
            if !changes.iter().any(|change| change.path.starts_with("shares.")) {
                continue;
            }
            tracing::info!("Share configuration changed, rebuilding index");
            match shares.fill().await {
                Ok(()) => {
                    if let Some(agent) = &agent {
                        if let Err(e) = agent.upload_shares().await {
                            tracing::warn!(error = %e, "Share upload after refill failed");
                        }
                    }
                    if let Some(supervisor) = &supervisor {
                        supervisor.publish_share_counts().await;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Share refill failed"),
            }
        }
    });
}

/// Poll the configuration file and hot-reload it on change.
pub fn spawn_config_watcher(
    options: Arc<OptionsStore>,
    config_path: String,
    shutdown: CancelHandle,
) {
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

    tokio::spawn(async move {
        let mut last_modified = tokio::fs::metadata(&config_path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let modified = match tokio::fs::metadata(&config_path).await {
                Ok(metadata) => metadata.modified().ok(),
                Err(_) => continue,
            };
            if modified == last_modified {
                continue;
            }
            last_modified = modified;

            tracing::info!(path = %config_path, "Configuration file changed, reloading");
            match options.reload_from(&config_path) {
                Ok(changes) if changes.is_empty() => {
                    tracing::debug!("Reload produced no changes");
                }
                Ok(changes) => {
                    tracing::info!(changes = changes.len(), "Configuration reloaded");
                }
                Err(e) => {
                    // The previous snapshot stays in effect.
                    tracing::error!(error = %e, "Configuration reload rejected");
                }
            }
        }
    });
}
