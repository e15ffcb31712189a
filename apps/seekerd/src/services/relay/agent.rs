//! Agent-side relay connector.
//!
//! Dials the controller's relay listener, authenticates with the pre-shared
//! secret, and serves `REQUEST_FILE` by streaming the body back over HTTP
//! multipart. The channel reconnects with the same backoff policy as the
//! server link; the share index slice is re-uploaded on every connect and
//! after every fill.

use bytes::BytesMut;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::config::OptionsStore;
use crate::error::{AppError, Result};
use crate::services::shares::ShareService;
use crate::state::StateStore;
use crate::sync::{backoff_delay, CancelHandle};

use super::credential;
use super::wire::{read_frame, write_frame, RelayMessage};

/// How often the agent pings an idle channel.
const PING_INTERVAL: Duration = Duration::from_secs(30);

struct ControllerTarget {
    address: String,
    api_url: String,
    secret: String,
    agent_name: String,
}

/// The agent half of the relay plane.
pub struct RelayAgent {
    options: Arc<OptionsStore>,
    state: Arc<StateStore>,
    shares: Arc<ShareService>,
    http: reqwest::Client,
    shutdown: CancelHandle,
}

impl RelayAgent {
    pub fn new(
        options: Arc<OptionsStore>,
        state: Arc<StateStore>,
        shares: Arc<ShareService>,
        shutdown: CancelHandle,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Arc::new(Self {
            options,
            state,
            shares,
            http,
            shutdown,
        }))
    }

    fn target(&self) -> Result<ControllerTarget> {
        let options = self.options.current();
        let controller = &options.relay.controller;
        Ok(ControllerTarget {
            address: controller
                .address
                .clone()
                .ok_or_else(|| AppError::Fatal("relay.controller.address not set".to_string()))?,
            api_url: controller
                .api_url
                .clone()
                .ok_or_else(|| AppError::Fatal("relay.controller.api_url not set".to_string()))?
                .trim_end_matches('/')
                .to_string(),
            secret: controller
                .secret
                .clone()
                .ok_or_else(|| AppError::Fatal("relay.controller.secret not set".to_string()))?,
            agent_name: controller
                .agent_name
                .clone()
                .ok_or_else(|| AppError::Fatal("relay.controller.agent_name not set".to_string()))?,
        })
    }

    /// Maintain the controller channel until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            match self.session().await {
                Ok(()) => {
                    tracing::info!("Controller closed the relay channel");
                    attempt = 1;
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt = attempt, "Relay channel failed");
                }
            }

            self.state.update(|state| {
                let mut next = state.clone();
                next.relay.controller_connected = false;
                next
            });

            let delay = backoff_delay(attempt.max(1));
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to controller");
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connected session: handshake, share upload, request serving.
    async fn session(self: &Arc<Self>) -> Result<()> {
        let target = self.target()?;

        tracing::info!(address = %target.address, "Connecting to controller");
        let stream = TcpStream::connect(&target.address).await?;
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = BytesMut::with_capacity(8192);

        // Challenge-response handshake, verifying the controller in turn.
        let challenge = read_frame(&mut reader, &mut buffer).await?;
        let Some(RelayMessage::Challenge { token }) = challenge else {
            return Err(AppError::TransportFailure(
                "controller did not send a challenge".to_string(),
            ));
        };
        let proof = credential::sign(&target.secret, &[&token, &target.agent_name]);
        write_frame(
            &mut writer,
            &RelayMessage::Hello {
                agent: target.agent_name.clone(),
                proof: proof.clone(),
            },
        )
        .await?;
        match read_frame(&mut reader, &mut buffer).await? {
            Some(RelayMessage::Welcome { proof: controller_proof }) => {
                if !credential::verify(&target.secret, &[&proof], &controller_proof) {
                    return Err(AppError::Unauthorized);
                }
            }
            Some(RelayMessage::Denied { reason }) => {
                tracing::error!(reason = %reason, "Controller rejected this agent");
                return Err(AppError::Unauthorized);
            }
            other => {
                return Err(AppError::TransportFailure(format!(
                    "unexpected handshake frame: {:?}",
                    other
                )));
            }
        }

        tracing::info!(agent = %target.agent_name, "Relay channel established");
        self.state.update(|state| {
            let mut next = state.clone();
            next.relay.controller_connected = true;
            next
        });

        // Ship the current index slice up front.
        if let Err(e) = self.upload_shares().await {
            tracing::warn!(error = %e, "Initial share upload failed");
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ping.tick() => {
                    write_frame(&mut writer, &RelayMessage::Ping).await?;
                }
                incoming = read_frame(&mut reader, &mut buffer) => match incoming? {
                    Some(RelayMessage::RequestFile { id, filename }) => {
                        let agent = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(e) = agent.serve_file(id, &filename).await {
                                tracing::warn!(id = %id, filename = %filename, error = %e, "Failed to serve relayed file");
                            }
                        });
                    }
                    Some(RelayMessage::Pong) => {}
                    Some(message) => {
                        tracing::trace!(?message, "Ignoring controller frame");
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    /// Answer one `REQUEST_FILE` by posting the body to the controller.
    async fn serve_file(self: &Arc<Self>, id: Uuid, filename: &str) -> Result<()> {
        let target = self.target()?;

        let path = self.shares.resolve(filename).await?;
        let file = tokio::fs::File::open(&path).await?;

        let presented =
            credential::file_credential(&target.secret, id, &target.agent_name, filename);
        let url = format!(
            "{}/api/v0/network/files/{}/{}",
            target.api_url, target.agent_name, id
        );

        tracing::debug!(id = %id, filename = %filename, path = ?path, "Posting relayed file");

        let form = Form::new().text("credential", presented).part(
            "file",
            Part::stream(Body::wrap_stream(ReaderStream::new(file)))
                .file_name(filename.to_string()),
        );

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::TransportFailure(format!("file post failed: {}", e)))?;
        response
            .error_for_status()
            .map_err(|e| AppError::TransportFailure(format!("controller refused file: {}", e)))?;

        tracing::debug!(id = %id, "Relayed file delivered");
        Ok(())
    }

    /// Upload the local share index slice to the controller.
    pub async fn upload_shares(&self) -> Result<()> {
        let target = self.target()?;
        let id = Uuid::new_v4();

        let staging: PathBuf =
            std::env::temp_dir().join(format!("seekerd-shares-{}.db", id.as_simple()));
        self.shares.serialize_local(&staging).await?;

        let masks = self.shares.local_masks().await;
        let description = serde_json::json!({
            "host": target.agent_name,
            "masks": &masks,
        });

        let database = tokio::fs::File::open(&staging).await?;
        let presented = credential::share_credential(&target.secret, id, &target.agent_name);
        let url = format!(
            "{}/api/v0/network/shares/{}/{}",
            target.api_url, target.agent_name, id
        );

        let form = Form::new()
            .text("credential", presented)
            .text("shares", description.to_string())
            .part(
                "database",
                Part::stream(Body::wrap_stream(ReaderStream::new(database)))
                    .file_name("shares.db"),
            );

        let result = async {
            let response = self
                .http
                .post(&url)
                .multipart(form)
                .send()
                .await
                .map_err(|e| AppError::TransportFailure(format!("share upload failed: {}", e)))?;
            response.error_for_status().map_err(|e| {
                AppError::TransportFailure(format!("controller refused share upload: {}", e))
            })?;
            Ok(())
        }
        .await;

        let _ = tokio::fs::remove_file(&staging).await;
        if result.is_ok() {
            tracing::info!(masks = masks.len(), "Share index slice uploaded");
        }
        result
    }
}
