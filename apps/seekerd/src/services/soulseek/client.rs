//! Protocol client seam.
//!
//! The daemon does not implement the Soulseek wire protocol; it drives an
//! injected client through [`SoulseekClient`] and answers the requests the
//! client receives from remote peers through [`PeerRequestHandler`]. All
//! client-side happenings surface on a single typed event channel rather
//! than per-event subscriptions.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::config::ConnectionOptions;
use crate::error::{AppError, Result};
use crate::services::shares::{DirectoryRecord, FileRecord};
use crate::sync::CancelHandle;

/// Byte source handed to the client for an upload.
pub type TransferReader = Box<dyn AsyncRead + Send + Unpin>;
/// Byte sink handed to the client for a download.
pub type TransferWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why the server link dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Application shutdown.
    Shutdown,
    /// A local caller asked for the disconnect.
    UserInitiated,
    /// The client object was disposed.
    Disposed,
    /// The server rejected the login.
    LoginRejected,
    /// Another login with the same account kicked this one.
    DuplicateLogin,
    /// Anything else: connection reset, timeouts, server restarts.
    Transport,
}

/// Client-side phase of a single transfer, as reported by the protocol
/// client while it drives the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Queued,
    Initializing,
    InProgress,
    Completed,
}

/// Direction of a transfer as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSide {
    Upload,
    Download,
}

/// Everything the protocol client can tell us, on one channel.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    LoggedIn,
    LoginFailed {
        reason: String,
    },
    Disconnected {
        cause: DisconnectCause,
        message: String,
    },
    Diagnostic {
        message: String,
    },
    TransferUpdate {
        side: TransferSide,
        username: String,
        filename: String,
        phase: TransferPhase,
        bytes: u64,
    },
    BrowseProgress {
        username: String,
        percent: u8,
    },
    UserStatus {
        username: String,
        status: String,
    },
    PrivateMessage {
        id: u32,
        username: String,
        message: String,
    },
    RoomMessage {
        room: String,
        username: String,
        message: String,
    },
    RoomJoined {
        room: String,
    },
    RoomLeft {
        room: String,
    },
}

/// Minimal patch of client options; only changed fields are present. The
/// connection block is all-or-nothing because the client cannot patch it
/// partially.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientPatch {
    pub listen_port: Option<u16>,
    pub distributed_enabled: Option<bool>,
    pub distributed_child_limit: Option<u32>,
    pub connection: Option<ConnectionOptions>,
}

impl ClientPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of applying a patch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconfigureOutcome {
    /// The client needs a reconnect before the patch fully takes effect.
    pub reconnect_required: bool,
}

/// Final accounting for a driven transfer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferSummary {
    pub bytes_transferred: u64,
}

/// Reply to a user-info request.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub description: String,
    /// Always empty; the daemon serves no picture.
    pub picture: Vec<u8>,
    pub upload_slots: u32,
    pub queue_length: u32,
    pub has_free_slot: bool,
}

/// Reply to a browse request, already in wire order.
#[derive(Debug, Clone, Default)]
pub struct BrowseReply {
    pub directories: Vec<DirectoryRecord>,
}

/// Reply to a search request.
#[derive(Debug, Clone)]
pub struct SearchAnswer {
    pub token: u32,
    pub files: Vec<FileRecord>,
    pub has_free_slot: bool,
    pub average_speed: u32,
    pub queue_length: u32,
}

/// Acknowledgement of an accepted download enqueue.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueAck {
    pub place_in_queue: Option<u32>,
}

/// The synchronous resolvers the protocol client calls when remote peers
/// ask something of us. Implementations must map internal failures to safe
/// rejection messages; arbitrary errors must not cross this boundary.
#[async_trait]
pub trait PeerRequestHandler: Send + Sync {
    async fn user_info(&self, username: &str) -> UserInfo;
    async fn browse(&self, username: &str) -> BrowseReply;
    /// Unknown directories yield an empty listing.
    async fn directory_contents(&self, username: &str, directory: &str) -> DirectoryRecord;
    /// `None` suppresses the response entirely.
    async fn search(&self, username: &str, token: u32, query: &str) -> Option<SearchAnswer>;
    /// `Err` carries the rejection reason sent back to the peer.
    async fn enqueue_download(
        &self,
        username: &str,
        filename: &str,
    ) -> std::result::Result<EnqueueAck, String>;
}

/// Operations the daemon needs from the protocol client library.
#[async_trait]
pub trait SoulseekClient: Send + Sync {
    async fn connect(&self, username: &str, password: &str) -> Result<()>;
    async fn disconnect(&self, reason: &str) -> Result<()>;
    async fn reconfigure(&self, patch: ClientPatch) -> Result<ReconfigureOutcome>;

    /// Subscribe to the client's typed event stream.
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
    /// Install the resolver callbacks invoked for remote peer requests.
    fn set_handler(&self, handler: Arc<dyn PeerRequestHandler>);

    /// Drive an upload to `username`, reading the body from `stream`.
    async fn upload(
        &self,
        username: &str,
        filename: &str,
        size: u64,
        stream: TransferReader,
        cancel: CancelHandle,
    ) -> Result<TransferSummary>;

    /// Drive a download from `username`, writing the body into `sink`.
    async fn download(
        &self,
        username: &str,
        filename: &str,
        sink: TransferWriter,
        size: Option<u64>,
        start_offset: u64,
        cancel: CancelHandle,
    ) -> Result<TransferSummary>;

    /// Prime the peer connection, optionally dropping a cached endpoint.
    async fn connect_to_user(&self, username: &str, invalidate_cache: bool) -> Result<()>;
    async fn place_in_queue(&self, username: &str, filename: &str) -> Result<u32>;

    async fn set_shared_counts(&self, directories: u32, files: u32) -> Result<()>;
    async fn send_upload_speed(&self, bytes_per_second: u32) -> Result<()>;

    async fn join_room(&self, room: &str) -> Result<()>;
    async fn leave_room(&self, room: &str) -> Result<()>;
    async fn send_room_message(&self, room: &str, message: &str) -> Result<()>;
    async fn send_private_message(&self, username: &str, message: &str) -> Result<()>;
    async fn acknowledge_private_message(&self, id: u32) -> Result<()>;
}

// =============================================================================
// Offline stand-in
// =============================================================================

/// Client used when no protocol backend is wired in.
///
/// Handler registration and the event channel work so the rest of the
/// daemon runs normally (shares, relay, state); every network operation
/// fails with a transport error. Embedders supply a real implementation
/// through `Daemon::with_client`.
pub struct NoopClient {
    event_tx: broadcast::Sender<ClientEvent>,
    handler: std::sync::RwLock<Option<Arc<dyn PeerRequestHandler>>>,
}

impl NoopClient {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            event_tx,
            handler: std::sync::RwLock::new(None),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn offline<T>(&self) -> Result<T> {
        Err(AppError::TransportFailure(
            "no protocol backend configured".to_string(),
        ))
    }
}

impl Default for NoopClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SoulseekClient for NoopClient {
    async fn connect(&self, _username: &str, _password: &str) -> Result<()> {
        self.offline()
    }

    async fn disconnect(&self, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn reconfigure(&self, _patch: ClientPatch) -> Result<ReconfigureOutcome> {
        Ok(ReconfigureOutcome::default())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    fn set_handler(&self, handler: Arc<dyn PeerRequestHandler>) {
        *self.handler.write().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    async fn upload(
        &self,
        _username: &str,
        _filename: &str,
        _size: u64,
        _stream: TransferReader,
        _cancel: CancelHandle,
    ) -> Result<TransferSummary> {
        self.offline()
    }

    async fn download(
        &self,
        _username: &str,
        _filename: &str,
        _sink: TransferWriter,
        _size: Option<u64>,
        _start_offset: u64,
        _cancel: CancelHandle,
    ) -> Result<TransferSummary> {
        self.offline()
    }

    async fn connect_to_user(&self, _username: &str, _invalidate_cache: bool) -> Result<()> {
        self.offline()
    }

    async fn place_in_queue(&self, _username: &str, _filename: &str) -> Result<u32> {
        self.offline()
    }

    async fn set_shared_counts(&self, _directories: u32, _files: u32) -> Result<()> {
        Ok(())
    }

    async fn send_upload_speed(&self, _bytes_per_second: u32) -> Result<()> {
        Ok(())
    }

    async fn join_room(&self, _room: &str) -> Result<()> {
        self.offline()
    }

    async fn leave_room(&self, _room: &str) -> Result<()> {
        self.offline()
    }

    async fn send_room_message(&self, _room: &str, _message: &str) -> Result<()> {
        self.offline()
    }

    async fn send_private_message(&self, _username: &str, _message: &str) -> Result<()> {
        self.offline()
    }

    async fn acknowledge_private_message(&self, _id: u32) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Scripted client for tests
// =============================================================================
