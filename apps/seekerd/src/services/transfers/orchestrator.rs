//! Transfer orchestration.
//!
//! Drives uploads and downloads between this process and remote peers:
//! slot-gated FIFO admission for uploads, a single-slot admission lock for
//! download enqueues, governor pacing, durable lifecycle records, and
//! relay-backed file bodies when the requested share lives on an agent.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};
use uuid::Uuid;

use crate::config::OptionsStore;
use crate::error::{AppError, Result};
use crate::services::relay::RelayHub;
use crate::services::shares::{FileLocation, ShareService};
use crate::services::soulseek::client::{
    ClientEvent, EnqueueAck, SoulseekClient, TransferPhase, TransferSide,
};
use crate::sync::{CancelHandle, CancelReason};

use super::governor::{speed_limited, unthrottled, GovernedReader};
use super::store::{
    CompletionReason, TransferDirection, TransferRecord, TransferState, TransferStore,
};

/// Hook invoked with the final path of every completed download.
#[async_trait::async_trait]
pub trait DownloadSink: Send + Sync {
    async fn deliver(&self, path: &Path) -> Result<()>;
}

/// Upload capacity as advertised to peers.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct UploadStats {
    pub has_free_slot: bool,
    pub queue_length: u32,
    /// Average speed of the most recent completed upload, bytes/sec.
    pub average_speed: u32,
}

#[derive(Default)]
struct Schedule {
    /// Queued upload ids in request order.
    queued: VecDeque<Uuid>,
    /// Username per queued id.
    queued_users: HashMap<Uuid, String>,
    /// Admitted upload id -> username.
    active: HashMap<Uuid, String>,
}

/// Upload/download scheduler and lifecycle driver.
pub struct TransferOrchestrator {
    options: Arc<OptionsStore>,
    store: Arc<TransferStore>,
    shares: Arc<ShareService>,
    client: Arc<dyn SoulseekClient>,
    /// Present on controllers; supplies file bodies for agent-hosted shares.
    relay: Option<Arc<RelayHub>>,
    schedule: Mutex<Schedule>,
    handles: std::sync::Mutex<HashMap<Uuid, CancelHandle>>,
    /// At most one download enqueue operation at a time.
    download_gate: Mutex<()>,
    download_slots: Arc<Semaphore>,
    last_upload_speed: AtomicU64,
    sink: Option<Arc<dyn DownloadSink>>,
}

impl TransferOrchestrator {
    pub fn new(
        options: Arc<OptionsStore>,
        store: Arc<TransferStore>,
        shares: Arc<ShareService>,
        client: Arc<dyn SoulseekClient>,
        relay: Option<Arc<RelayHub>>,
        sink: Option<Arc<dyn DownloadSink>>,
    ) -> Arc<Self> {
        let download_slots = options.current().transfers.downloads.slots as usize;
        Arc::new(Self {
            options,
            store,
            shares,
            client,
            relay,
            schedule: Mutex::new(Schedule::default()),
            handles: std::sync::Mutex::new(HashMap::new()),
            download_gate: Mutex::new(()),
            download_slots: Arc::new(Semaphore::new(download_slots)),
            last_upload_speed: AtomicU64::new(0),
            sink,
        })
    }

    // =========================================================================
    // Uploads
    // =========================================================================

    /// Handle a remote peer asking to download `filename` from us.
    ///
    /// A re-request for a live `(username, filename)` pair does not create a
    /// duplicate record; it answers with the live record's place in queue.
    pub async fn enqueue_upload(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
    ) -> Result<EnqueueAck> {
        if let Some(existing) = self
            .store
            .find_active(TransferDirection::Upload, username, filename)
            .await?
        {
            tracing::debug!(
                username = %username,
                filename = %filename,
                "Re-requested live upload"
            );
            return Ok(EnqueueAck {
                place_in_queue: self.place_in_upload_queue(existing.id).await,
            });
        }

        let record = match self.shares.get(filename).await? {
            Some(file) => {
                let mut record =
                    TransferRecord::new(TransferDirection::Upload, username, filename, file.size);
                self.store.upsert(&record).await?;
                record.state = TransferState::Queued;
                self.store.upsert(&record).await?;
                record
            }
            None => return Err(AppError::Rejected("File not shared".to_string())),
        };

        let cancel = CancelHandle::new();
        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(record.id, cancel);

        {
            let mut schedule = self.schedule.lock().await;
            schedule.queued.push_back(record.id);
            schedule
                .queued_users
                .insert(record.id, username.to_string());
        }

        tracing::info!(
            id = %record.id,
            username = %username,
            filename = %filename,
            "Upload queued"
        );

        self.pump().await;
        Ok(EnqueueAck {
            place_in_queue: self.place_in_upload_queue(record.id).await,
        })
    }

    /// 1-based position among queued uploads; `None` once admitted.
    pub async fn place_in_upload_queue(&self, id: Uuid) -> Option<u32> {
        let schedule = self.schedule.lock().await;
        schedule
            .queued
            .iter()
            .position(|queued| *queued == id)
            .map(|pos| pos as u32 + 1)
    }

    /// Admit queued uploads while both the global and the per-user budgets
    /// have capacity, in FIFO order.
    fn pump<'a>(self: &'a Arc<Self>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let options = self.options.current();
        let global = options.transfers.uploads.slots as usize;
        let per_user = options.transfers.uploads.slots_per_user as usize;

        let mut admitted = Vec::new();
        {
            let mut schedule = self.schedule.lock().await;
            while schedule.active.len() < global {
                let next = schedule.queued.iter().position(|id| {
                    let user = &schedule.queued_users[id];
                    schedule.active.values().filter(|u| *u == user).count() < per_user
                });
                let Some(pos) = next else { break };
                let id = schedule.queued.remove(pos).expect("position valid");
                let user = schedule.queued_users.remove(&id).expect("user recorded");
                schedule.active.insert(id, user);
                admitted.push(id);
            }
        }

        for id in admitted {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                orchestrator.run_upload(id).await;
            });
        }
        })
    }

    async fn run_upload(self: Arc<Self>, id: Uuid) {
        let outcome = self.drive_upload(id).await;
        if let Err(e) = outcome {
            tracing::error!(id = %id, error = %e, "Upload bookkeeping failed");
        }

        {
            let mut schedule = self.schedule.lock().await;
            schedule.active.remove(&id);
        }
        self.pump().await;
    }

    async fn drive_upload(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let Some(mut record) = self.store.get(id).await? else {
            return Ok(());
        };
        let cancel = self
            .handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
            .unwrap_or_default();

        if cancel.is_cancelled() {
            record.complete(CompletionReason::Cancelled, record.bytes_transferred);
            self.store.upsert(&record).await?;
            self.forget_handle(id);
            return Ok(());
        }

        record.state = TransferState::Initializing;
        self.store.upsert(&record).await?;

        // Obtain the body: local disk, or the relay plane for agent shares.
        let location = self.shares.locate(&record.filename).await;
        let (reader, relay_completion): (
            Box<dyn tokio::io::AsyncRead + Send + Unpin>,
            Option<crate::services::relay::CompletionGuard>,
        ) = match location {
            Ok(FileLocation::Local(path)) => match tokio::fs::File::open(&path).await {
                Ok(file) => (Box::new(file), None),
                Err(e) => {
                    record.exception = Some(format!("failed to open {}: {}", path.display(), e));
                    record.complete(CompletionReason::Errored, 0);
                    self.store.upsert(&record).await?;
                    self.forget_handle(id);
                    return Ok(());
                }
            },
            Ok(FileLocation::Remote { host }) => {
                let Some(relay) = &self.relay else {
                    record.exception = Some("no relay hub configured".to_string());
                    record.complete(CompletionReason::Errored, 0);
                    self.store.upsert(&record).await?;
                    self.forget_handle(id);
                    return Ok(());
                };
                match relay.request_file(&host, &record.filename).await {
                    Ok(file) => (file.stream, Some(file.completion)),
                    Err(AppError::TimedOut(message)) => {
                        record.exception = Some(message);
                        record.complete(CompletionReason::TimedOut, 0);
                        self.store.upsert(&record).await?;
                        self.forget_handle(id);
                        return Ok(());
                    }
                    Err(e) => {
                        record.exception = Some(e.to_string());
                        record.complete(CompletionReason::Errored, 0);
                        self.store.upsert(&record).await?;
                        self.forget_handle(id);
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                record.exception = Some(e.to_string());
                record.complete(CompletionReason::Errored, 0);
                self.store.upsert(&record).await?;
                self.forget_handle(id);
                return Ok(());
            }
        };

        let speed_limit = self.options.current().transfers.uploads.speed_limit;
        let governor = if speed_limit > 0 {
            speed_limited(speed_limit)
        } else {
            unthrottled()
        };
        let transferred = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&transferred);
        let reader = GovernedReader::new(reader, governor)
            .with_progress(Box::new(move |bytes| counter.store(bytes, Ordering::Relaxed)));

        record.state = TransferState::InProgress;
        record.started_at = Some(chrono::Utc::now());
        self.store.upsert(&record).await?;

        tracing::info!(
            id = %id,
            username = %record.username,
            filename = %record.filename,
            size = record.size,
            "Upload started"
        );

        let result = self
            .client
            .upload(
                &record.username,
                &record.filename,
                record.size,
                Box::new(reader),
                cancel.clone(),
            )
            .await;

        // Keep the relay body open exactly as long as the upload needed it.
        drop(relay_completion);

        match result {
            Ok(summary) => {
                record.complete(CompletionReason::Succeeded, summary.bytes_transferred);
                self.store.upsert(&record).await?;
                let speed = record.average_speed as u64;
                self.last_upload_speed.store(speed, Ordering::Relaxed);
                if let Err(e) = self.client.send_upload_speed(speed as u32).await {
                    tracing::debug!(error = %e, "Failed to publish upload speed");
                }
                tracing::info!(id = %id, bytes = record.bytes_transferred, "Upload completed");
            }
            Err(e) => {
                let bytes = transferred.load(Ordering::Relaxed);
                match cancel.reason() {
                    Some(CancelReason::Requeue) => {
                        record.exception = Some("connection reset; requeued".to_string());
                        record.complete(CompletionReason::Errored, bytes);
                        self.store.upsert(&record).await?;
                        self.requeue_upload(&record).await?;
                    }
                    Some(_) => {
                        record.complete(CompletionReason::Cancelled, bytes);
                        self.store.upsert(&record).await?;
                        tracing::info!(id = %id, "Upload cancelled");
                    }
                    None => {
                        let reason = match &e {
                            AppError::TimedOut(_) => CompletionReason::TimedOut,
                            AppError::Rejected(_) => CompletionReason::Rejected,
                            _ => CompletionReason::Errored,
                        };
                        record.exception = Some(e.to_string());
                        record.complete(reason, bytes);
                        self.store.upsert(&record).await?;
                        tracing::warn!(id = %id, error = %e, "Upload failed");
                    }
                }
            }
        }

        self.forget_handle(id);
        Ok(())
    }

    /// Re-queue the same work under a fresh record after a retriable failure.
    async fn requeue_upload(self: &Arc<Self>, failed: &TransferRecord) -> Result<()> {
        let mut record = TransferRecord::new(
            TransferDirection::Upload,
            &failed.username,
            &failed.filename,
            failed.size,
        );
        record.state = TransferState::Queued;
        self.store.upsert(&record).await?;

        let cancel = CancelHandle::new();
        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(record.id, cancel);

        let mut schedule = self.schedule.lock().await;
        schedule.queued.push_back(record.id);
        schedule
            .queued_users
            .insert(record.id, failed.username.clone());
        drop(schedule);

        tracing::info!(
            id = %record.id,
            username = %failed.username,
            filename = %failed.filename,
            "Upload re-queued after retriable failure"
        );
        Ok(())
    }

    /// React to a server reconnect: queued uploads stay queued; in-flight
    /// transfers fail with a retriable cause and are re-queued.
    pub async fn handle_reconnect(self: &Arc<Self>) {
        let active: Vec<Uuid> = {
            let schedule = self.schedule.lock().await;
            schedule.active.keys().copied().collect()
        };
        if active.is_empty() {
            return;
        }
        tracing::info!(count = active.len(), "Requeueing in-flight transfers after reconnect");
        let handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        for id in active {
            if let Some(handle) = handles.get(&id) {
                handle.cancel(CancelReason::Requeue);
            }
        }
    }

    /// Upload capacity snapshot for search and user-info replies.
    pub async fn upload_stats(&self) -> UploadStats {
        let options = self.options.current();
        let schedule = self.schedule.lock().await;
        UploadStats {
            has_free_slot: schedule.active.len() < options.transfers.uploads.slots as usize,
            queue_length: schedule.queued.len() as u32,
            average_speed: self.last_upload_speed.load(Ordering::Relaxed) as u32,
        }
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    /// Enqueue downloads of `files` from `username`.
    ///
    /// At most one enqueue operation runs at a time; concurrent attempts
    /// fail with a rate-limited signal. Each request races the remote
    /// acknowledgement against early task failure.
    pub async fn enqueue_downloads(
        self: &Arc<Self>,
        username: &str,
        files: &[(String, u64)],
    ) -> Result<Vec<Uuid>> {
        let _gate = self
            .download_gate
            .try_lock()
            .map_err(|_| AppError::RateLimited("another enqueue is in progress".to_string()))?;

        // Prime the peer connection, dropping any cached endpoint.
        self.client.connect_to_user(username, true).await?;

        let mut events = self.client.subscribe();
        let mut ids = Vec::with_capacity(files.len());

        for (filename, size) in files {
            let record =
                TransferRecord::new(TransferDirection::Download, username, filename, *size);
            let id = record.id;
            self.store.upsert(&record).await?;

            let cancel = CancelHandle::new();
            self.handles
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(id, cancel.clone());

            let orchestrator = Arc::clone(self);
            let task_user = username.to_string();
            let task_file = filename.clone();
            let task_size = *size;
            let mut task = tokio::spawn(async move {
                orchestrator
                    .run_download(id, task_user, task_file, task_size, cancel)
                    .await
            });

            let accepted = loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ClientEvent::TransferUpdate { side: TransferSide::Download, username: u, filename: f, phase, .. })
                            if u == username
                                && f == *filename
                                && matches!(phase, TransferPhase::Queued | TransferPhase::Initializing) =>
                        {
                            break Ok(());
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            break match (&mut task).await {
                                Ok(result) => result,
                                Err(e) => Err(AppError::TransportFailure(e.to_string())),
                            };
                        }
                    },
                    joined = &mut task => {
                        break match joined {
                            Ok(result) => result,
                            Err(e) => Err(AppError::TransportFailure(e.to_string())),
                        };
                    }
                }
            };

            match accepted {
                Ok(()) => {
                    ids.push(id);
                }
                Err(AppError::Rejected(reason)) => {
                    return Err(AppError::Rejected(reason));
                }
                Err(e) => {
                    tracing::warn!(
                        username = %username,
                        filename = %filename,
                        error = %e,
                        "Download enqueue failed"
                    );
                    return Err(AppError::TransportFailure(
                        "download enqueue failed".to_string(),
                    ));
                }
            }
        }

        Ok(ids)
    }

    async fn run_download(
        self: Arc<Self>,
        id: Uuid,
        username: String,
        filename: String,
        size: u64,
        cancel: CancelHandle,
    ) -> Result<()> {
        let _permit = self
            .download_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::TransportFailure("download slots closed".to_string()))?;

        let options = self.options.current();
        let relative = sanitize_remote_path(&filename);
        let staging = options
            .directories
            .incomplete
            .join(&username)
            .join(&relative);
        let destination = options.directories.downloads.join(&relative);

        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut record = match self.store.get(id).await? {
            Some(record) => record,
            None => return Ok(()),
        };
        record.state = TransferState::Queued;
        record.started_at = Some(chrono::Utc::now());
        self.store.upsert(&record).await?;

        let sink = tokio::fs::File::create(&staging).await?;

        let result = self
            .client
            .download(
                &username,
                &filename,
                Box::new(sink),
                Some(size),
                0,
                cancel.clone(),
            )
            .await;

        let outcome = match result {
            Ok(summary) => {
                record.complete(CompletionReason::Succeeded, summary.bytes_transferred);
                self.store.upsert(&record).await?;

                move_into_place(&staging, &destination).await?;
                prune_empty_dirs(&options.directories.incomplete, staging.parent()).await;

                if let Some(sink) = &self.sink {
                    if let Err(e) = sink.deliver(&destination).await {
                        tracing::warn!(path = ?destination, error = %e, "Download sink failed");
                    }
                }

                tracing::info!(
                    id = %id,
                    path = ?destination,
                    bytes = record.bytes_transferred,
                    "Download completed"
                );
                Ok(())
            }
            Err(e) => {
                let reason = match (&e, cancel.reason()) {
                    (_, Some(_)) => CompletionReason::Cancelled,
                    (AppError::Rejected(_), _) => CompletionReason::Rejected,
                    (AppError::TimedOut(_), _) => CompletionReason::TimedOut,
                    _ => CompletionReason::Errored,
                };
                record.exception = Some(e.to_string());
                record.complete(reason, record.bytes_transferred);
                self.store.upsert(&record).await?;
                let _ = tokio::fs::remove_file(&staging).await;
                Err(e)
            }
        };

        self.forget_handle(id);
        outcome
    }

    /// Remote place in queue for a pending download.
    pub async fn download_position(&self, id: Uuid) -> Result<u32> {
        let Some(mut record) = self.store.get(id).await? else {
            return Err(AppError::NotFound(format!("transfer {}", id)));
        };
        let position = self
            .client
            .place_in_queue(&record.username, &record.filename)
            .await?;
        record.place_in_queue = Some(position);
        self.store.upsert(&record).await?;
        Ok(position)
    }

    // =========================================================================
    // Shared lifecycle operations
    // =========================================================================

    /// Cancel a transfer. Idempotent: cancelling a terminal transfer is a
    /// no-op success.
    pub async fn cancel(self: &Arc<Self>, id: Uuid) -> Result<()> {
        // Queued uploads are cancelled in place without waking a task.
        let was_queued = {
            let mut schedule = self.schedule.lock().await;
            match schedule.queued.iter().position(|queued| *queued == id) {
                Some(pos) => {
                    schedule.queued.remove(pos);
                    schedule.queued_users.remove(&id);
                    true
                }
                None => false,
            }
        };

        let Some(mut record) = self.store.get(id).await? else {
            return Err(AppError::NotFound(format!("transfer {}", id)));
        };

        if was_queued {
            record.complete(CompletionReason::Cancelled, record.bytes_transferred);
            self.store.upsert(&record).await?;
            self.forget_handle(id);
            return Ok(());
        }

        if record.state.is_terminal() {
            return Ok(());
        }

        let handle = self
            .handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned();
        match handle {
            Some(handle) => {
                handle.cancel(CancelReason::User);
                Ok(())
            }
            None => {
                // No live task; close the record directly.
                record.complete(CompletionReason::Cancelled, record.bytes_transferred);
                self.store.upsert(&record).await?;
                Ok(())
            }
        }
    }

    /// Remove a record from default views, cancelling it first when live.
    pub async fn remove(self: &Arc<Self>, id: Uuid) -> Result<()> {
        match self.cancel(id).await {
            Ok(()) => {}
            Err(AppError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if !self.store.mark_removed(id).await? {
            return Err(AppError::NotFound(format!("transfer {}", id)));
        }
        Ok(())
    }

    /// Drop every completed record for one direction.
    pub async fn clear_completed(&self, direction: TransferDirection) -> Result<u64> {
        self.store.clear_completed(direction).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<TransferRecord>> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        direction: TransferDirection,
        include_removed: bool,
    ) -> Result<Vec<TransferRecord>> {
        self.store.list(direction, include_removed).await
    }

    fn forget_handle(&self, id: Uuid) {
        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }
}

/// Map a remote path onto a safe relative path, preserving directory
/// structure while dropping traversal components and drive prefixes.
fn sanitize_remote_path(remote: &str) -> PathBuf {
    let mut relative = PathBuf::new();
    for segment in remote.split(['\\', '/']) {
        let cleaned = segment.trim().trim_end_matches(':');
        if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
            continue;
        }
        relative.push(cleaned);
    }
    if relative.as_os_str().is_empty() {
        relative.push("download");
    }
    relative
}

async fn move_into_place(staging: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(staging, destination).await {
        Ok(()) => Ok(()),
        Err(_) => {
            // Cross-device moves fall back to copy + delete.
            tokio::fs::copy(staging, destination).await?;
            tokio::fs::remove_file(staging).await?;
            Ok(())
        }
    }
}

/// Remove now-empty directories between a finished download and the
/// incomplete root.
async fn prune_empty_dirs(root: &Path, mut dir: Option<&Path>) {
    while let Some(current) = dir {
        if !current.starts_with(root) || current == root {
            break;
        }
        match tokio::fs::remove_dir(current).await {
            Ok(()) => dir = current.parent(),
            Err(_) => break,
        }
    }
}
