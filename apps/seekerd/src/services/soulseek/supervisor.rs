//! Soulseek connection supervisor.
//!
//! Owns the protocol client instance: login at startup, option patching on
//! configuration changes, disconnect classification with exponential-backoff
//! reconnect, and the resolver callbacks the client invokes for remote peer
//! requests.

use async_trait::async_trait;
use rusqlite::params;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::config::{ChangeClass, OptionChange, Options, OptionsStore};
use crate::error::Result;
use crate::services::shares::{DirectoryRecord, ShareService};
use crate::services::transfers::TransferOrchestrator;
use crate::state::{ConnectionState, StateStore};
use crate::sync::{backoff_delay, CancelHandle};

use super::client::{
    BrowseReply, ClientEvent, ClientPatch, DisconnectCause, EnqueueAck, PeerRequestHandler,
    SearchAnswer, SoulseekClient, UserInfo,
};

/// Queries shorter than this are never answered.
const MIN_SEARCH_LENGTH: usize = 3;

/// Supervises the protocol client lifecycle.
pub struct Supervisor {
    options: Arc<OptionsStore>,
    state: Arc<StateStore>,
    client: Arc<dyn SoulseekClient>,
    orchestrator: Arc<TransferOrchestrator>,
    shares: Arc<ShareService>,
    db: Arc<Mutex<rusqlite::Connection>>,
    shutdown: CancelHandle,
    reconnecting: AtomicBool,
}

impl Supervisor {
    pub fn new(
        options: Arc<OptionsStore>,
        state: Arc<StateStore>,
        client: Arc<dyn SoulseekClient>,
        orchestrator: Arc<TransferOrchestrator>,
        shares: Arc<ShareService>,
        db: Arc<Mutex<rusqlite::Connection>>,
        shutdown: CancelHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            state,
            client,
            orchestrator,
            shares,
            db,
            shutdown,
            reconnecting: AtomicBool::new(false),
        })
    }

    /// Wire the handler and the event pump, then log in when configured.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let handler: Arc<dyn PeerRequestHandler> = self.clone();
        self.client.set_handler(handler);

        // Event pump: one consumer for the client's typed event channel.
        {
            let supervisor = Arc::clone(self);
            let mut events = self.client.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = supervisor.shutdown.cancelled() => return,
                        event = events.recv() => match event {
                            Ok(event) => supervisor.handle_event(event).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped = skipped, "Client event stream lagged");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            });
        }

        // Option changes arrive on a channel so the synchronous fan-out
        // never blocks on client calls.
        {
            let (tx, mut rx) = mpsc::unbounded_channel::<(Arc<Options>, Vec<OptionChange>)>();
            self.options.subscribe(move |next, changes| {
                let _ = tx.send((Arc::clone(next), changes.to_vec()));
            });
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((next, changes)) = rx.recv().await {
                    supervisor.apply_option_changes(&next, &changes).await;
                }
            });
        }

        let options = self.options.current();
        self.state.update(|state| {
            let mut next = state.clone();
            next.server.address = Some(format!(
                "{}:{}",
                options.soulseek.server_host, options.soulseek.server_port
            ));
            next.server.username = options.soulseek.username.clone();
            next
        });

        // Sync the client with the full current option set before any
        // connection exists.
        let initial = ClientPatch {
            listen_port: Some(options.soulseek.listen_port),
            distributed_enabled: Some(options.soulseek.distributed.enabled),
            distributed_child_limit: Some(options.soulseek.distributed.child_limit),
            connection: Some(options.soulseek.connection.clone()),
        };
        if let Err(e) = self.client.reconfigure(initial).await {
            tracing::warn!(error = %e, "Failed to apply initial client options");
        }

        if options.soulseek.no_connect {
            tracing::info!("no_connect is set; staying offline");
            return Ok(());
        }
        let (Some(username), Some(password)) = (
            options.soulseek.username.clone(),
            options.soulseek.password.clone(),
        ) else {
            tracing::info!("Soulseek credentials not configured; staying offline");
            return Ok(());
        };

        self.set_connection_state(ConnectionState::Connecting);
        match self.client.connect(&username, &password).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "Initial connect failed, starting reconnect loop");
                self.set_connection_state(ConnectionState::Disconnected);
                self.spawn_reconnect_loop();
                Ok(())
            }
        }
    }

    fn set_connection_state(&self, connection: ConnectionState) {
        self.state.update(move |state| {
            let mut next = state.clone();
            next.server.state = connection;
            next
        });
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state.current().server.state,
            ConnectionState::Connected | ConnectionState::LoggedIn
        )
    }

    /// Push current share totals to the server.
    pub async fn publish_share_counts(&self) {
        let (files, directories) = self.shares.totals().await;
        if let Err(e) = self
            .client
            .set_shared_counts(directories as u32, files as u32)
            .await
        {
            tracing::debug!(error = %e, "Failed to publish shared counts");
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    async fn handle_event(self: &Arc<Self>, event: ClientEvent) {
        match event {
            ClientEvent::Connected => {
                self.set_connection_state(ConnectionState::Connected);
            }
            ClientEvent::LoggedIn => {
                tracing::info!("Logged in to the Soulseek server");
                self.state.update(|state| {
                    let mut next = state.clone();
                    next.server.state = ConnectionState::LoggedIn;
                    next.pending_reconnect = false;
                    next
                });
                self.publish_share_counts().await;
            }
            ClientEvent::LoginFailed { reason } => {
                tracing::error!(reason = %reason, "Login failed; not retrying");
                self.set_connection_state(ConnectionState::Disconnected);
            }
            ClientEvent::Disconnected { cause, message } => {
                self.set_connection_state(ConnectionState::Disconnected);
                self.handle_disconnect(cause, &message).await;
            }
            ClientEvent::Diagnostic { message } => {
                tracing::debug!(message = %message, "Client diagnostic");
            }
            ClientEvent::TransferUpdate { .. } | ClientEvent::BrowseProgress { .. } => {
                // Transfer progress is consumed by the orchestrator's own
                // subscription; browse progress is informational.
            }
            ClientEvent::UserStatus { username, status } => {
                tracing::trace!(username = %username, status = %status, "User status");
            }
            ClientEvent::PrivateMessage {
                id,
                username,
                message,
            } => {
                if let Err(e) = self.record_private_message(&username, &message).await {
                    tracing::warn!(error = %e, "Failed to record private message");
                }
                if let Err(e) = self.client.acknowledge_private_message(id).await {
                    tracing::debug!(error = %e, "Failed to acknowledge private message");
                }
            }
            ClientEvent::RoomMessage {
                room,
                username,
                message,
            } => {
                if let Err(e) = self.record_room_message(&room, &username, &message).await {
                    tracing::warn!(error = %e, "Failed to record room message");
                }
            }
            ClientEvent::RoomJoined { room } => {
                tracing::debug!(room = %room, "Joined room");
            }
            ClientEvent::RoomLeft { room } => {
                tracing::debug!(room = %room, "Left room");
            }
        }
    }

    async fn handle_disconnect(self: &Arc<Self>, cause: DisconnectCause, message: &str) {
        match cause {
            DisconnectCause::Shutdown | DisconnectCause::UserInitiated | DisconnectCause::Disposed => {
                tracing::info!(message = %message, "Disconnected; no reconnect");
            }
            DisconnectCause::LoginRejected | DisconnectCause::DuplicateLogin => {
                tracing::error!(
                    message = %message,
                    "Disconnected by the server; automatic reconnect disabled"
                );
            }
            DisconnectCause::Transport => {
                tracing::warn!(message = %message, "Connection lost; reconnecting");
                self.orchestrator.handle_reconnect().await;
                self.spawn_reconnect_loop();
            }
        }
    }

    /// Unbounded exponential-backoff reconnect, using the latest credentials
    /// from the options store on every attempt.
    fn spawn_reconnect_loop(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                let delay = backoff_delay(attempt);
                tracing::info!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );

                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let options = supervisor.options.current();
                if options.soulseek.no_connect {
                    tracing::info!("no_connect set during reconnect; stopping");
                    break;
                }
                let (Some(username), Some(password)) = (
                    options.soulseek.username.clone(),
                    options.soulseek.password.clone(),
                ) else {
                    tracing::info!("Credentials removed during reconnect; stopping");
                    break;
                };

                supervisor.set_connection_state(ConnectionState::Connecting);
                match supervisor.client.connect(&username, &password).await {
                    Ok(()) => {
                        tracing::info!(attempt = attempt, "Reconnected");
                        break;
                    }
                    Err(e) => {
                        supervisor.set_connection_state(ConnectionState::Disconnected);
                        tracing::warn!(attempt = attempt, error = %e, "Reconnect attempt failed");
                    }
                }
            }
            supervisor.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    // =========================================================================
    // Option patching
    // =========================================================================

    async fn apply_option_changes(&self, next: &Options, changes: &[OptionChange]) {
        let patch = build_patch(changes, next);
        let mut reconnect_required = false;

        if !patch.is_empty() {
            tracing::info!(?patch, "Applying client option patch");
            match self.client.reconfigure(patch).await {
                Ok(outcome) => reconnect_required = outcome.reconnect_required,
                Err(e) => tracing::warn!(error = %e, "Failed to reconfigure client"),
            }
        }

        let reconnect_classed = changes.iter().any(|change| {
            change.path.starts_with("soulseek.")
                && change.change_class == ChangeClass::RequiresReconnect
        });

        if self.is_connected() && (reconnect_classed || reconnect_required) {
            self.state.update(|state| {
                let mut updated = state.clone();
                updated.pending_reconnect = true;
                updated
            });
        }
    }

    // =========================================================================
    // Messaging trigger points
    // =========================================================================

    async fn record_private_message(&self, username: &str, message: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO private_messages (username, direction, message, sent_at, acknowledged)
             VALUES (?1, 'in', ?2, ?3, 1)",
            params![username, message, now],
        )?;
        conn.execute(
            "INSERT INTO conversations (username, last_message_at, unread)
             VALUES (?1, ?2, 1)
             ON CONFLICT (username) DO UPDATE SET
                 last_message_at = excluded.last_message_at,
                 unread = unread + 1",
            params![username, now],
        )?;
        Ok(())
    }

    async fn record_room_message(&self, room: &str, username: &str, message: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO room_messages (room, username, message, sent_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![room, username, message, now],
        )?;
        Ok(())
    }
}

/// Build the minimal client patch for a set of changes. Any change under
/// the connection block replaces the whole block.
fn build_patch(changes: &[OptionChange], next: &Options) -> ClientPatch {
    let mut patch = ClientPatch::default();
    let mut connection_changed = false;

    for change in changes {
        match change.path.as_str() {
            "soulseek.listen_port" => patch.listen_port = Some(next.soulseek.listen_port),
            "soulseek.distributed.enabled" => {
                patch.distributed_enabled = Some(next.soulseek.distributed.enabled)
            }
            "soulseek.distributed.child_limit" => {
                patch.distributed_child_limit = Some(next.soulseek.distributed.child_limit)
            }
            path if path.starts_with("soulseek.connection.") => connection_changed = true,
            _ => {}
        }
    }

    if connection_changed {
        patch.connection = Some(next.soulseek.connection.clone());
    }
    patch
}

// =============================================================================
// Resolvers
// =============================================================================

#[async_trait]
impl PeerRequestHandler for Supervisor {
    async fn user_info(&self, username: &str) -> UserInfo {
        tracing::debug!(username = %username, "User info requested");
        let options = self.options.current();
        let stats = self.orchestrator.upload_stats().await;
        UserInfo {
            description: options.soulseek.description.clone(),
            picture: Vec::new(),
            upload_slots: options.transfers.uploads.slots,
            queue_length: stats.queue_length,
            has_free_slot: stats.has_free_slot,
        }
    }

    async fn browse(&self, username: &str) -> BrowseReply {
        tracing::debug!(username = %username, "Browse requested");
        match self.shares.browse().await {
            Ok(directories) => BrowseReply { directories },
            Err(e) => {
                tracing::error!(error = %e, "Browse failed");
                BrowseReply::default()
            }
        }
    }

    async fn directory_contents(&self, username: &str, directory: &str) -> DirectoryRecord {
        tracing::debug!(username = %username, directory = %directory, "Directory contents requested");
        let files = self.shares.directory(directory).await.unwrap_or_default();
        DirectoryRecord {
            name: directory.to_string(),
            files,
        }
    }

    async fn search(&self, username: &str, token: u32, query: &str) -> Option<SearchAnswer> {
        if query.trim().len() < MIN_SEARCH_LENGTH {
            return None;
        }
        let options = self.options.current();
        if options
            .soulseek
            .search_blacklist
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(username))
        {
            tracing::debug!(username = %username, "Search from blacklisted user ignored");
            return None;
        }

        let files = match self.shares.search(query).await {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(error = %e, "Search failed");
                return None;
            }
        };
        if files.is_empty() {
            return None;
        }

        tracing::debug!(username = %username, query = %query, results = files.len(), "Answering search");
        let stats = self.orchestrator.upload_stats().await;
        Some(SearchAnswer {
            token,
            files,
            has_free_slot: stats.has_free_slot,
            average_speed: stats.average_speed,
            queue_length: stats.queue_length,
        })
    }

    async fn enqueue_download(
        &self,
        username: &str,
        filename: &str,
    ) -> std::result::Result<EnqueueAck, String> {
        match self.orchestrator.enqueue_upload(username, filename).await {
            Ok(ack) => Ok(ack),
            Err(crate::error::AppError::Rejected(reason)) => Err(reason),
            Err(e) => {
                // Internal details never cross the protocol boundary.
                tracing::error!(
                    username = %username,
                    filename = %filename,
                    error = %e,
                    "Enqueue failed"
                );
                Err("Unable to process request".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::db;
    use crate::error::AppError;
    use crate::services::soulseek::client::mock::MockClient;
    use crate::services::transfers::TransferStore;
    use crate::state::DaemonState;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        supervisor: Arc<Supervisor>,
        client: Arc<MockClient>,
        options: Arc<OptionsStore>,
        state: Arc<StateStore>,
        db: Arc<Mutex<rusqlite::Connection>>,
        #[allow(dead_code)]
        share_root: TempDir,
    }

    async fn fixture(tune: impl FnOnce(&mut Options)) -> Fixture {
        let share_root = TempDir::new().unwrap();
        std::fs::write(share_root.path().join("song.mp3"), vec![1u8; 256]).unwrap();

        let mut options = Options::default();
        options.soulseek.username = Some("me".to_string());
        options.soulseek.password = Some("secret".to_string());
        options.shares.directories = vec![share_root.path().to_path_buf()];
        tune(&mut options);

        let options = OptionsStore::new_shared(options);
        let state = StateStore::new_shared(DaemonState::default());
        let shares = ShareService::new(Arc::clone(&options), Arc::clone(&state));
        shares.fill().await.unwrap();

        let conn = Arc::new(Mutex::new(db::init_db_memory().unwrap()));
        let store = TransferStore::new(Arc::clone(&conn));
        let client = MockClient::new_shared();
        let orchestrator = TransferOrchestrator::new(
            Arc::clone(&options),
            store,
            Arc::clone(&shares),
            client.clone(),
            None,
            None,
        );

        let supervisor = Supervisor::new(
            Arc::clone(&options),
            Arc::clone(&state),
            client.clone(),
            orchestrator,
            shares,
            Arc::clone(&conn),
            CancelHandle::new(),
        );

        Fixture {
            supervisor,
            client,
            options,
            state,
            db: conn,
            share_root,
        }
    }

    async fn wait_until(description: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !check() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", description);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_build_patch_minimal() {
        let mut next = Options::default();
        next.soulseek.listen_port = 50301;
        let changes = crate::config::diff::diff(&Options::default(), &next);

        let patch = build_patch(&changes, &next);
        assert_eq!(patch.listen_port, Some(50301));
        assert!(patch.connection.is_none());
        assert!(patch.distributed_enabled.is_none());
    }

    #[test]
    fn test_build_patch_replaces_whole_connection_block() {
        let mut next = Options::default();
        next.soulseek.connection.timeout_ms = 20_000;
        let changes = crate::config::diff::diff(&Options::default(), &next);

        let patch = build_patch(&changes, &next);
        let connection = patch.connection.expect("connection block present");
        assert_eq!(connection.timeout_ms, 20_000);
        // Unchanged connection fields ride along with the block.
        assert_eq!(connection.inactivity_ms, 15_000);
    }

    #[test]
    fn test_build_patch_ignores_unrelated_changes() {
        let mut next = Options::default();
        next.web.port = 5031;
        let changes = crate::config::diff::diff(&Options::default(), &next);
        assert!(build_patch(&changes, &next).is_empty());
    }

    #[tokio::test]
    async fn test_start_connects_and_marks_logged_in() {
        let fx = fixture(|_| {}).await;
        fx.supervisor.start().await.unwrap();

        let state = Arc::clone(&fx.state);
        wait_until("login", move || {
            state.current().server.state == ConnectionState::LoggedIn
        })
        .await;
        assert_eq!(fx.client.connects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_connect_stays_offline() {
        let fx = fixture(|options| options.soulseek.no_connect = true).await;
        fx.supervisor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.client.connects.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_disconnect_triggers_backoff_reconnect() {
        let fx = fixture(|_| {}).await;
        fx.supervisor.start().await.unwrap();
        let state = Arc::clone(&fx.state);
        wait_until("login", move || {
            state.current().server.state == ConnectionState::LoggedIn
        })
        .await;

        // Two failures, then success.
        fx.client.script_connects(vec![
            Err(AppError::TransportFailure("refused".to_string())),
            Err(AppError::TransportFailure("refused".to_string())),
            Ok(()),
        ]);
        fx.client.emit(ClientEvent::Disconnected {
            cause: DisconnectCause::Transport,
            message: "connection reset".to_string(),
        });

        let client = fx.client.clone();
        wait_until("three reconnect attempts", move || {
            client.connects.lock().unwrap().len() >= 4
        })
        .await;

        let state = Arc::clone(&fx.state);
        wait_until("re-login", move || {
            state.current().server.state == ConnectionState::LoggedIn
        })
        .await;
    }

    #[tokio::test]
    async fn test_login_rejected_does_not_reconnect() {
        let fx = fixture(|_| {}).await;
        fx.supervisor.start().await.unwrap();
        let state = Arc::clone(&fx.state);
        wait_until("login", move || {
            state.current().server.state == ConnectionState::LoggedIn
        })
        .await;

        fx.client.emit(ClientEvent::Disconnected {
            cause: DisconnectCause::DuplicateLogin,
            message: "kicked".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.client.connects.lock().unwrap().len(), 1);
        assert_eq!(
            fx.state.current().server.state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_listen_port_change_sets_pending_reconnect() {
        let fx = fixture(|_| {}).await;
        fx.supervisor.start().await.unwrap();
        let state = Arc::clone(&fx.state);
        wait_until("login", move || {
            state.current().server.state == ConnectionState::LoggedIn
        })
        .await;

        let mut next = (*fx.options.current()).clone();
        next.soulseek.listen_port = 50301;
        fx.options.replace(next).unwrap();

        let state = Arc::clone(&fx.state);
        wait_until("pending_reconnect", move || {
            state.current().pending_reconnect
        })
        .await;

        let patches = fx.client.patches.lock().unwrap();
        // One full patch at startup, then the minimal change patch.
        assert_eq!(patches.len(), 2);
        let patch = patches.last().unwrap();
        assert_eq!(patch.listen_port, Some(50301));
        assert!(patch.connection.is_none());
    }

    #[tokio::test]
    async fn test_search_resolver_rules() {
        let fx = fixture(|options| {
            options.soulseek.search_blacklist = vec!["leech".to_string()];
        })
        .await;

        // Below minimum length.
        assert!(fx.supervisor.search("peer", 1, "ab").await.is_none());
        // Blacklisted username, regardless of query.
        assert!(fx.supervisor.search("leech", 2, "song").await.is_none());
        // No matches.
        assert!(fx.supervisor.search("peer", 3, "zzzzzz").await.is_none());

        let answer = fx.supervisor.search("peer", 4, "song").await.unwrap();
        assert_eq!(answer.token, 4);
        assert_eq!(answer.files.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_resolver_maps_rejections() {
        let fx = fixture(|_| {}).await;
        let rejected = fx
            .supervisor
            .enqueue_download("peer", "music\\missing.mp3")
            .await;
        assert_eq!(rejected.unwrap_err(), "File not shared");
    }

    #[tokio::test]
    async fn test_directory_contents_unknown_is_empty() {
        let fx = fixture(|_| {}).await;
        let listing = fx.supervisor.directory_contents("peer", "nope").await;
        assert!(listing.files.is_empty());
    }

    #[tokio::test]
    async fn test_private_message_recorded_and_acknowledged() {
        let fx = fixture(|_| {}).await;
        fx.supervisor.start().await.unwrap();

        fx.client.emit(ClientEvent::PrivateMessage {
            id: 42,
            username: "friend".to_string(),
            message: "hey there".to_string(),
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let count: i64 = {
                let conn = fx.db.lock().await;
                conn.query_row("SELECT COUNT(*) FROM private_messages", [], |row| row.get(0))
                    .unwrap_or(0)
            };
            if count == 1 {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("private message never persisted");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let conn = fx.db.lock().await;
        let unread: i64 = conn
            .query_row(
                "SELECT unread FROM conversations WHERE username = 'friend'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(unread, 1);
    }
}
