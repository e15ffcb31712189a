//! Test infrastructure for seekerd integration tests.
//!
//! Builds a complete daemon wiring (in-memory database, offline protocol
//! client, real router) around an `axum_test::TestServer`, plus helpers
//! for hand-rolled multipart bodies.

#![allow(dead_code)]

use axum_test::TestServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use seekerd::config::{AgentOptions, Options, OptionsStore, RelayMode};
use seekerd::services::relay::RelayHub;
use seekerd::services::shares::ShareService;
use seekerd::services::soulseek::NoopClient;
use seekerd::services::transfers::{TransferOrchestrator, TransferStore};
use seekerd::state::{DaemonState, StateStore};
use seekerd::sync::CancelHandle;
use seekerd::{api, db, AppState};

pub const AGENT_NAME: &str = "a1";
pub const AGENT_SECRET: &str = "0123456789abcdef";

/// A complete daemon instance under test.
pub struct TestApp {
    pub server: TestServer,
    pub options: Arc<OptionsStore>,
    pub state: Arc<StateStore>,
    pub shares: Arc<ShareService>,
    pub orchestrator: Arc<TransferOrchestrator>,
    pub hub: Option<Arc<RelayHub>>,
    /// Address of the relay listener, when running as a controller.
    pub relay_addr: Option<SocketAddr>,
}

impl TestApp {
    /// A standalone daemon: no federation, offline client.
    pub async fn standalone() -> Self {
        Self::build(|_| {}).await
    }

    /// A controller with one registered agent and a live relay listener.
    pub async fn controller(tune: impl FnOnce(&mut Options)) -> Self {
        Self::build(|options| {
            options.relay.mode = RelayMode::Controller;
            // Port zero gives the listener an ephemeral port.
            options.relay.listen_port = 0;
            options.relay.agents = vec![AgentOptions {
                name: AGENT_NAME.to_string(),
                secret: AGENT_SECRET.to_string(),
            }];
            tune(options);
        })
        .await
    }

    async fn build(tune: impl FnOnce(&mut Options)) -> Self {
        let mut options = Options::default();
        tune(&mut options);
        let relay_mode = options.relay.mode;

        let options = OptionsStore::new_shared(options);
        let state = StateStore::new_shared(DaemonState::default());
        let shares = ShareService::new(Arc::clone(&options), Arc::clone(&state));

        let conn = db::init_db_memory().expect("Failed to initialize test database");
        let store = TransferStore::new(Arc::new(Mutex::new(conn)));

        let (hub, relay_addr) = if relay_mode == RelayMode::Controller {
            let hub = RelayHub::new(
                Arc::clone(&options),
                Arc::clone(&state),
                CancelHandle::new(),
            );
            let listener = hub.bind().await.expect("Failed to bind relay listener");
            let addr = listener.local_addr().expect("relay listener address");
            tokio::spawn(Arc::clone(&hub).run(listener));
            (Some(hub), Some(addr))
        } else {
            (None, None)
        };

        let client = NoopClient::new_shared();
        let orchestrator = TransferOrchestrator::new(
            Arc::clone(&options),
            store,
            Arc::clone(&shares),
            client,
            hub.clone(),
            None,
        );

        let app_state = AppState {
            options: Arc::clone(&options),
            state: Arc::clone(&state),
            shares: Arc::clone(&shares),
            orchestrator: Arc::clone(&orchestrator),
            relay: hub.clone(),
        };
        let server = TestServer::new(api::router(app_state)).expect("Failed to create test server");

        Self {
            server,
            options,
            state,
            shares,
            orchestrator,
            hub,
            relay_addr,
        }
    }
}

/// One part of a hand-rolled multipart body.
pub struct BodyPart {
    pub name: &'static str,
    pub filename: Option<&'static str>,
    pub content: Vec<u8>,
}

impl BodyPart {
    pub fn text(name: &'static str, content: impl Into<String>) -> Self {
        Self {
            name,
            filename: None,
            content: content.into().into_bytes(),
        }
    }

    pub fn file(name: &'static str, filename: &'static str, content: Vec<u8>) -> Self {
        Self {
            name,
            filename: Some(filename),
            content,
        }
    }
}

pub const BOUNDARY: &str = "seekerd-test-boundary";

/// Encode parts as `multipart/form-data` with the fixed test boundary.
pub fn multipart_body(parts: &[BodyPart]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part.filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\r\n",
                    part.name, filename
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name)
                    .as_bytes(),
            ),
        }
        body.extend_from_slice(&part.content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}
