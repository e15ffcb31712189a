//! Controller-side relay hub.
//!
//! Accepts persistent channels from agents, authenticates them against the
//! configured registry, and hands out file bodies on demand: the hub sends
//! `RequestFile` down the channel, the agent answers with an HTTP multipart
//! POST, and the waiting upload receives the body as a byte stream. Pending
//! requests live in a concurrent map keyed by opaque id; each entry is
//! removed exactly once on completion, credential failure, or timeout.

use bytes::{Bytes, BytesMut};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use crate::config::OptionsStore;
use crate::error::{AppError, Result};
use crate::state::{AgentState, StateStore};
use crate::sync::CancelHandle;

use super::credential;
use super::wire::{read_frame, write_frame, RelayMessage};

/// How long an agent gets to complete the channel handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fires its completion signal when dropped; the upload task holds it for
/// exactly as long as the body is needed.
pub struct CompletionGuard {
    tx: Option<oneshot::Sender<()>>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A relayed file body: the byte stream plus the guard keeping the agent's
/// HTTP request open.
pub struct RelayFile {
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
    pub completion: CompletionGuard,
}

/// Handler-side intake for a claimed file request.
pub struct FileIntake {
    /// Body chunks forwarded from the HTTP request.
    pub bytes: mpsc::Sender<std::io::Result<Bytes>>,
    /// Resolves when the upload is done with the body.
    pub completion: oneshot::Receiver<()>,
}

struct PendingFile {
    agent: String,
    filename: String,
    reply: oneshot::Sender<Result<RelayFile>>,
}

struct AgentChannel {
    connection: Uuid,
    tx: mpsc::Sender<RelayMessage>,
}

/// Relay hub state.
pub struct RelayHub {
    options: Arc<OptionsStore>,
    state: Arc<StateStore>,
    pending: std::sync::Mutex<HashMap<Uuid, PendingFile>>,
    connected: std::sync::Mutex<HashMap<String, AgentChannel>>,
    shutdown: CancelHandle,
}

impl RelayHub {
    pub fn new(
        options: Arc<OptionsStore>,
        state: Arc<StateStore>,
        shutdown: CancelHandle,
    ) -> Arc<Self> {
        // Seed the observable agent list from the registry.
        let agents: Vec<AgentState> = options
            .current()
            .relay
            .agents
            .iter()
            .map(|agent| AgentState {
                name: agent.name.clone(),
                connected: false,
            })
            .collect();
        state.update(move |current| {
            let mut next = current.clone();
            next.relay.agents = agents.clone();
            next
        });

        Arc::new(Self {
            options,
            state,
            pending: std::sync::Mutex::new(HashMap::new()),
            connected: std::sync::Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Bind the relay listener.
    pub async fn bind(&self) -> Result<TcpListener> {
        let port = self.options.current().relay.listen_port;
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::Fatal(format!("failed to bind relay listener on {}: {}", addr, e)))?;
        tracing::info!(port = port, "Relay listener bound");
        Ok(listener)
    }

    /// Accept and serve agent channels until shutdown.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("Relay hub shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(peer = %addr, "Incoming agent connection");
                        let hub = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_agent(stream).await {
                                tracing::debug!(peer = %addr, error = %e, "Agent channel error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept agent connection");
                    }
                }
            }
        }
    }

    async fn handle_agent(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);
        let mut buffer = BytesMut::with_capacity(8192);

        // Challenge-response handshake; the Welcome proof makes it mutual.
        let token: String = {
            let mut rng = rand::thread_rng();
            (0..32).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
        };
        write_frame(&mut writer, &RelayMessage::Challenge { token: token.clone() }).await?;

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader, &mut buffer))
            .await
            .map_err(|_| AppError::TimedOut("agent handshake".to_string()))??;
        let (agent, proof) = match hello {
            Some(RelayMessage::Hello { agent, proof }) => (agent, proof),
            other => {
                return Err(AppError::TransportFailure(format!(
                    "unexpected handshake frame: {:?}",
                    other
                )));
            }
        };

        let secret = match self.agent_secret(&agent) {
            Ok(secret) => secret,
            Err(_) => {
                write_frame(&mut writer, &RelayMessage::Denied {
                    reason: "unknown agent".to_string(),
                })
                .await?;
                return Err(AppError::Unauthorized);
            }
        };
        if !credential::verify(&secret, &[&token, &agent], &proof) {
            write_frame(&mut writer, &RelayMessage::Denied {
                reason: "bad credentials".to_string(),
            })
            .await?;
            tracing::warn!(agent = %agent, "Agent failed authentication");
            return Err(AppError::Unauthorized);
        }
        write_frame(&mut writer, &RelayMessage::Welcome {
            proof: credential::sign(&secret, &[&proof]),
        })
        .await?;

        // Register, replacing any stale channel for the same agent.
        let connection = Uuid::new_v4();
        let (tx, mut outbound) = mpsc::channel::<RelayMessage>(32);
        {
            let mut connected = self.connected.lock().unwrap_or_else(|p| p.into_inner());
            connected.insert(agent.clone(), AgentChannel { connection, tx });
        }
        self.set_agent_connected(&agent, true);
        tracing::info!(agent = %agent, "Agent connected");

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                outgoing = outbound.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = write_frame(&mut writer, &message).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                incoming = read_frame(&mut reader, &mut buffer) => match incoming {
                    Ok(Some(RelayMessage::Ping)) => {
                        if let Err(e) = write_frame(&mut writer, &RelayMessage::Pong).await {
                            break Err(e);
                        }
                    }
                    Ok(Some(message)) => {
                        tracing::trace!(agent = %agent, ?message, "Ignoring agent frame");
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        };

        // Unregister only if this connection still owns the slot.
        {
            let mut connected = self.connected.lock().unwrap_or_else(|p| p.into_inner());
            if connected
                .get(&agent)
                .map(|channel| channel.connection == connection)
                .unwrap_or(false)
            {
                connected.remove(&agent);
                drop(connected);
                self.set_agent_connected(&agent, false);
            }
        }
        tracing::info!(agent = %agent, "Agent disconnected");
        result
    }

    /// Ask `agent` for a file body.
    ///
    /// Resolves once the agent's HTTP response arrives with a valid
    /// credential, or fails with `TimedOut` when the agent does not answer
    /// within the configured window.
    pub async fn request_file(&self, agent: &str, filename: &str) -> Result<RelayFile> {
        let tx = {
            let connected = self.connected.lock().unwrap_or_else(|p| p.into_inner());
            connected
                .get(agent)
                .map(|channel| channel.tx.clone())
                .ok_or_else(|| AppError::NotFound(format!("agent {} is not connected", agent)))?
        };

        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.insert(
                id,
                PendingFile {
                    agent: agent.to_string(),
                    filename: filename.to_string(),
                    reply: reply_tx,
                },
            );
        }

        if tx
            .send(RelayMessage::RequestFile {
                id,
                filename: filename.to_string(),
            })
            .await
            .is_err()
        {
            self.pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
            return Err(AppError::TransportFailure(format!(
                "agent {} channel closed",
                agent
            )));
        }

        tracing::debug!(id = %id, agent = %agent, filename = %filename, "Requested file from agent");

        let timeout = Duration::from_millis(self.options.current().relay.file_timeout_ms);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                Err(AppError::TransportFailure(
                    "relay request dropped".to_string(),
                ))
            }
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                Err(AppError::TimedOut(format!(
                    "agent {} did not respond within {}ms",
                    agent, timeout.as_millis()
                )))
            }
        }
    }

    /// Claim a pending file request from an inbound HTTP upload.
    ///
    /// Verifies the credential binding `(id, agent, filename)`; a mismatch
    /// fails both the HTTP request and the waiting upload. Unknown ids are
    /// a 404.
    pub fn claim_file(&self, agent: &str, id: Uuid, presented: &str) -> Result<FileIntake> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("relay request {}", id)))?;

        let authorized = self
            .agent_secret(&pending.agent)
            .map(|secret| {
                pending.agent == agent
                    && credential::verify(
                        &secret,
                        &[&id.to_string(), agent, &pending.filename],
                        presented,
                    )
            })
            .unwrap_or(false);
        if !authorized {
            tracing::warn!(id = %id, agent = %agent, "Relay credential mismatch");
            let _ = pending.reply.send(Err(AppError::Unauthorized));
            return Err(AppError::Unauthorized);
        }

        let (bytes_tx, bytes_rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
        let (done_tx, done_rx) = oneshot::channel();
        let stream = StreamReader::new(ReceiverStream::new(bytes_rx));

        if pending
            .reply
            .send(Ok(RelayFile {
                stream: Box::new(stream),
                completion: CompletionGuard { tx: Some(done_tx) },
            }))
            .is_err()
        {
            // The requester gave up (timeout) between removal and claim.
            return Err(AppError::NotFound(format!("relay request {} expired", id)));
        }

        Ok(FileIntake {
            bytes: bytes_tx,
            completion: done_rx,
        })
    }

    /// Validate a share-index upload credential (signed over id and agent).
    pub fn verify_share_upload(&self, agent: &str, id: Uuid, presented: &str) -> Result<()> {
        let secret = self.agent_secret(agent).map_err(|_| AppError::Unauthorized)?;
        if credential::verify(&secret, &[&id.to_string(), agent], presented) {
            Ok(())
        } else {
            tracing::warn!(id = %id, agent = %agent, "Share upload credential mismatch");
            Err(AppError::Unauthorized)
        }
    }

    pub fn is_connected(&self, agent: &str) -> bool {
        self.connected
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(agent)
    }

    fn agent_secret(&self, agent: &str) -> Result<String> {
        self.options
            .current()
            .relay
            .agents
            .iter()
            .find(|registered| registered.name == agent)
            .map(|registered| registered.secret.clone())
            .ok_or_else(|| AppError::NotFound(format!("agent {} is not registered", agent)))
    }

    fn set_agent_connected(&self, agent: &str, connected: bool) {
        let agent = agent.to_string();
        self.state.update(move |state| {
            let mut next = state.clone();
            match next.relay.agents.iter_mut().find(|a| a.name == agent) {
                Some(entry) => entry.connected = connected,
                None => next.relay.agents.push(AgentState {
                    name: agent.clone(),
                    connected,
                }),
            }
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentOptions, Options, RelayMode};
    use crate::state::DaemonState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SECRET: &str = "0123456789abcdef";

    fn hub_options(timeout_ms: u64) -> Arc<OptionsStore> {
        let mut options = Options::default();
        options.relay.mode = RelayMode::Controller;
        options.relay.file_timeout_ms = timeout_ms;
        options.relay.agents = vec![AgentOptions {
            name: "a1".to_string(),
            secret: SECRET.to_string(),
        }];
        OptionsStore::new_shared(options)
    }

    async fn connected_hub(timeout_ms: u64) -> (Arc<RelayHub>, TcpStream) {
        let options = hub_options(timeout_ms);
        let state = StateStore::new_shared(DaemonState::default());
        let hub = RelayHub::new(options, state, CancelHandle::new());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&hub).run(listener));

        // Agent side of the handshake, by hand.
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let mut buffer = BytesMut::new();
        let challenge = read_frame(&mut socket, &mut buffer).await.unwrap();
        let Some(RelayMessage::Challenge { token }) = challenge else {
            panic!("expected challenge");
        };
        let proof = credential::sign(SECRET, &[&token, "a1"]);
        write_frame(
            &mut socket,
            &RelayMessage::Hello {
                agent: "a1".to_string(),
                proof: proof.clone(),
            },
        )
        .await
        .unwrap();
        let welcome = read_frame(&mut socket, &mut buffer).await.unwrap();
        let Some(RelayMessage::Welcome { proof: controller_proof }) = welcome else {
            panic!("expected welcome");
        };
        assert!(credential::verify(SECRET, &[&proof], &controller_proof));

        // Wait for registration to land.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !hub.is_connected("a1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        (hub, socket)
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_proof() {
        let options = hub_options(3000);
        let state = StateStore::new_shared(DaemonState::default());
        let hub = RelayHub::new(options, state, CancelHandle::new());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&hub).run(listener));

        let mut socket = TcpStream::connect(addr).await.unwrap();
        let mut buffer = BytesMut::new();
        let _ = read_frame(&mut socket, &mut buffer).await.unwrap();
        write_frame(
            &mut socket,
            &RelayMessage::Hello {
                agent: "a1".to_string(),
                proof: "feedface".to_string(),
            },
        )
        .await
        .unwrap();

        let reply = read_frame(&mut socket, &mut buffer).await.unwrap();
        assert!(matches!(reply, Some(RelayMessage::Denied { .. })));
        assert!(!hub.is_connected("a1"));
    }

    #[tokio::test]
    async fn test_request_file_round_trip() {
        let (hub, mut socket) = connected_hub(3000).await;

        let requester = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.request_file("a1", "music\\song.mp3").await })
        };

        // Agent receives the request frame.
        let mut buffer = BytesMut::new();
        let frame = read_frame(&mut socket, &mut buffer).await.unwrap();
        let Some(RelayMessage::RequestFile { id, filename }) = frame else {
            panic!("expected request_file");
        };
        assert_eq!(filename, "music\\song.mp3");

        // Agent answers over the HTTP path (claim + body push).
        let presented = credential::file_credential(SECRET, id, "a1", &filename);
        let intake = hub.claim_file("a1", id, &presented).unwrap();

        let mut relay_file = requester.await.unwrap().unwrap();

        intake
            .bytes
            .send(Ok(Bytes::from_static(b"hello ")))
            .await
            .unwrap();
        intake
            .bytes
            .send(Ok(Bytes::from_static(b"world")))
            .await
            .unwrap();
        drop(intake.bytes);

        let mut body = Vec::new();
        relay_file.stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello world");

        // The completion promise resolves only when the consumer is done.
        let mut completion = intake.completion;
        assert!(completion.try_recv().is_err());
        drop(relay_file.completion);
        completion.await.unwrap();

        socket.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_credential_mismatch_fails_both_sides() {
        let (hub, mut socket) = connected_hub(3000).await;

        let requester = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.request_file("a1", "music\\song.mp3").await })
        };

        let mut buffer = BytesMut::new();
        let frame = read_frame(&mut socket, &mut buffer).await.unwrap();
        let Some(RelayMessage::RequestFile { id, .. }) = frame else {
            panic!("expected request_file");
        };

        // Credential derived from a different id.
        let wrong = credential::file_credential(SECRET, Uuid::new_v4(), "a1", "music\\song.mp3");
        let claim = hub.claim_file("a1", id, &wrong);
        assert!(matches!(claim, Err(AppError::Unauthorized)));

        let upload_side = requester.await.unwrap();
        assert!(matches!(upload_side, Err(AppError::Unauthorized)));

        // The pending entry is gone: a retry with the right credential 404s.
        let right = credential::file_credential(SECRET, id, "a1", "music\\song.mp3");
        assert!(matches!(
            hub.claim_file("a1", id, &right),
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_request_times_out_without_response() {
        let (hub, _socket) = connected_hub(100).await;

        let result = hub.request_file("a1", "music\\song.mp3").await;
        assert!(matches!(result, Err(AppError::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_unknown_claim_is_not_found() {
        let (hub, _socket) = connected_hub(3000).await;
        let claim = hub.claim_file("a1", Uuid::new_v4(), "anything");
        assert!(matches!(claim, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_disconnected_agent_is_not_found() {
        let options = hub_options(3000);
        let state = StateStore::new_shared(DaemonState::default());
        let hub = RelayHub::new(options, state, CancelHandle::new());
        let result = hub.request_file("a1", "f").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
