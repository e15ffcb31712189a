use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use seekerd::config::{Options, OptionsStore, RelayMode};
use seekerd::services::relay::{RelayAgent, RelayHub};
use seekerd::services::shares::ShareService;
use seekerd::services::soulseek::{NoopClient, Supervisor};
use seekerd::services::transfers::{TransferOrchestrator, TransferStore};
use seekerd::state::{DaemonState, RelayState, StateStore};
use seekerd::sync::{CancelHandle, CancelReason};
use seekerd::{api, db, spawn_config_watcher, spawn_option_reactors, AppState};

const CONFIG_PATH: &str = "config.toml";

fn init_tracing() {
    // RUST_LOG controls log levels; default to debug for our crate and
    // warn for dependencies.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("seekerd=debug,tower_http=debug,axum=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Create the directories the daemon cannot run without.
fn ensure_directories(options: &Options) -> Result<(), String> {
    let mut required = vec![
        options.directories.incomplete.clone(),
        options.directories.downloads.clone(),
    ];
    if let Some(parent) = options.database.path.parent() {
        required.push(parent.to_path_buf());
    }
    for dir in required {
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    tracing::info!("Starting seekerd v{}", env!("CARGO_PKG_VERSION"));

    let options = match Options::load_from(CONFIG_PATH) {
        Ok(options) => {
            tracing::info!("Configuration loaded");
            tracing::debug!(?options, "Effective configuration");
            options
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = ensure_directories(&options) {
        tracing::error!("Failed to prepare data directories: {}", e);
        std::process::exit(1);
    }

    let conn = match db::init_db(&options.database.path) {
        Ok(conn) => {
            tracing::info!("Database initialized at {:?}", options.database.path);
            Arc::new(Mutex::new(conn))
        }
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let relay_mode = options.relay.mode;
    let options = OptionsStore::new_shared(options);
    let state = StateStore::new_shared(DaemonState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        relay: RelayState {
            mode: relay_mode,
            ..Default::default()
        },
        ..Default::default()
    });

    // Process-lifetime cancellation handle; Ctrl-C trips it.
    let shutdown = CancelHandle::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                shutdown.cancel(CancelReason::Shutdown);
            }
        });
    }

    let shares = ShareService::new(Arc::clone(&options), Arc::clone(&state));
    let store = TransferStore::new(Arc::clone(&conn));

    // Controller side of the federation: accept agent channels.
    let hub = if relay_mode == RelayMode::Controller {
        let hub = RelayHub::new(Arc::clone(&options), Arc::clone(&state), shutdown.clone());
        match hub.bind().await {
            Ok(listener) => {
                tokio::spawn(Arc::clone(&hub).run(listener));
                Some(hub)
            }
            Err(e) => {
                tracing::error!("Failed to start relay hub: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    // The protocol backend is injected by embedders; the shipped binary
    // runs with the offline client, which keeps shares, relay, and the API
    // fully functional.
    let client = NoopClient::new_shared();
    let orchestrator = TransferOrchestrator::new(
        Arc::clone(&options),
        store,
        Arc::clone(&shares),
        client.clone(),
        hub.clone(),
        None,
    );

    // Agent side of the federation: dial the controller.
    let agent = if relay_mode == RelayMode::Agent {
        match RelayAgent::new(
            Arc::clone(&options),
            Arc::clone(&state),
            Arc::clone(&shares),
            shutdown.clone(),
        ) {
            Ok(agent) => {
                tokio::spawn(Arc::clone(&agent).run());
                Some(agent)
            }
            Err(e) => {
                tracing::error!("Failed to start relay agent: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    // Agents do not speak to the Soulseek network themselves.
    let supervisor = if relay_mode != RelayMode::Agent {
        let supervisor = Supervisor::new(
            Arc::clone(&options),
            Arc::clone(&state),
            client,
            Arc::clone(&orchestrator),
            Arc::clone(&shares),
            Arc::clone(&conn),
            shutdown.clone(),
        );
        if let Err(e) = supervisor.start().await {
            tracing::warn!("Supervisor start failed: {}", e);
        }
        Some(supervisor)
    } else {
        None
    };

    // First fill at boot, unless disabled.
    let current = options.current();
    if current.shares.scan_on_start && !current.shares.directories.is_empty() {
        let shares = Arc::clone(&shares);
        let agent = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = shares.fill().await {
                tracing::error!("Initial share scan failed: {}", e);
            } else if let Some(agent) = agent {
                if let Err(e) = agent.upload_shares().await {
                    tracing::debug!("Deferred share upload: {}", e);
                }
            }
        });
    } else {
        tracing::info!("Share scan at boot disabled or no shares configured");
    }

    spawn_option_reactors(
        &options,
        Arc::clone(&state),
        Arc::clone(&shares),
        agent,
        supervisor,
    );
    spawn_config_watcher(
        Arc::clone(&options),
        CONFIG_PATH.to_string(),
        shutdown.clone(),
    );

    let app_state = AppState {
        options: Arc::clone(&options),
        state,
        shares,
        orchestrator,
        relay: hub,
    };
    let app = api::router(app_state);

    let addr = options.current().web_addr();
    tracing::info!(mode = %relay_mode, "seekerd listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let graceful = shutdown.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            graceful.cancelled().await;
        })
        .await
    {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("seekerd stopped");
}
