//! Durable transfer records.
//!
//! Every upload and download the daemon has handled is recorded in the
//! `transfers` table. Per-record updates are serialized by the connection
//! guard; list queries may return slightly stale data.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Direction of a transfer as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

impl FromStr for TransferDirection {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upload" => Ok(TransferDirection::Upload),
            "download" => Ok(TransferDirection::Download),
            other => Err(AppError::BadRequest(format!(
                "unknown transfer direction: {}",
                other
            ))),
        }
    }
}

/// Why a transfer reached the completed category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Succeeded,
    Cancelled,
    TimedOut,
    Rejected,
    Errored,
}

/// Lifecycle state of a transfer. Transitions for a single transfer are
/// totally ordered; the completed category is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Queued,
    Initializing,
    InProgress,
    Completed(CompletionReason),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Requested => "requested",
            TransferState::Queued => "queued",
            TransferState::Initializing => "initializing",
            TransferState::InProgress => "in_progress",
            TransferState::Completed(CompletionReason::Succeeded) => "completed_succeeded",
            TransferState::Completed(CompletionReason::Cancelled) => "completed_cancelled",
            TransferState::Completed(CompletionReason::TimedOut) => "completed_timed_out",
            TransferState::Completed(CompletionReason::Rejected) => "completed_rejected",
            TransferState::Completed(CompletionReason::Errored) => "completed_errored",
        }
    }
}

impl FromStr for TransferState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "requested" => Ok(TransferState::Requested),
            "queued" => Ok(TransferState::Queued),
            "initializing" => Ok(TransferState::Initializing),
            "in_progress" => Ok(TransferState::InProgress),
            "completed_succeeded" => Ok(TransferState::Completed(CompletionReason::Succeeded)),
            "completed_cancelled" => Ok(TransferState::Completed(CompletionReason::Cancelled)),
            "completed_timed_out" => Ok(TransferState::Completed(CompletionReason::TimedOut)),
            "completed_rejected" => Ok(TransferState::Completed(CompletionReason::Rejected)),
            "completed_errored" => Ok(TransferState::Completed(CompletionReason::Errored)),
            other => Err(AppError::BadRequest(format!(
                "unknown transfer state: {}",
                other
            ))),
        }
    }
}

impl Serialize for TransferState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable transfer record.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub username: String,
    /// Masked path for uploads; the remote path for downloads.
    pub filename: String,
    pub size: u64,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub bytes_transferred: u64,
    /// Bytes per second across the whole transfer.
    pub average_speed: f64,
    pub place_in_queue: Option<u32>,
    pub state: TransferState,
    pub exception: Option<String>,
    pub removed: bool,
}

impl TransferRecord {
    pub fn new(
        direction: TransferDirection,
        username: &str,
        filename: &str,
        size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            username: username.to_string(),
            filename: filename.to_string(),
            size,
            requested_at: Utc::now(),
            started_at: None,
            ended_at: None,
            bytes_transferred: 0,
            average_speed: 0.0,
            place_in_queue: None,
            state: TransferState::Requested,
            exception: None,
            removed: false,
        }
    }

    /// Transition into a completed state with final accounting.
    pub fn complete(&mut self, reason: CompletionReason, bytes: u64) {
        let ended = Utc::now();
        self.bytes_transferred = bytes.min(self.size);
        self.state = TransferState::Completed(reason);
        self.ended_at = Some(ended);
        if let Some(started) = self.started_at {
            let elapsed = (ended - started).num_milliseconds().max(1) as f64 / 1000.0;
            self.average_speed = self.bytes_transferred as f64 / elapsed;
        }
    }
}

/// Durable record store over the `transfers` table.
pub struct TransferStore {
    conn: Arc<Mutex<Connection>>,
}

impl TransferStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Arc<Self> {
        Arc::new(Self { conn })
    }

    /// Insert or fully update a record.
    pub async fn upsert(&self, record: &TransferRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO transfers
                 (id, direction, username, filename, size, requested_at, started_at,
                  ended_at, bytes_transferred, average_speed, place_in_queue, state,
                  exception, removed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT (id) DO UPDATE SET
                 started_at = excluded.started_at,
                 ended_at = excluded.ended_at,
                 bytes_transferred = excluded.bytes_transferred,
                 average_speed = excluded.average_speed,
                 place_in_queue = excluded.place_in_queue,
                 state = excluded.state,
                 exception = excluded.exception,
                 removed = excluded.removed",
            params![
                record.id.to_string(),
                record.direction.as_str(),
                record.username,
                record.filename,
                record.size as i64,
                record.requested_at.to_rfc3339(),
                record.started_at.map(|t| t.to_rfc3339()),
                record.ended_at.map(|t| t.to_rfc3339()),
                record.bytes_transferred as i64,
                record.average_speed,
                record.place_in_queue,
                record.state.as_str(),
                record.exception,
                record.removed as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<TransferRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM transfers WHERE id = ?1",
            COLUMNS
        ))?;
        let record = stmt
            .query_row(params![id.to_string()], row_to_record)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(record)
    }

    /// List records for one direction, newest request first.
    pub async fn list(
        &self,
        direction: TransferDirection,
        include_removed: bool,
    ) -> Result<Vec<TransferRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM transfers
             WHERE direction = ?1 AND (?2 OR removed = 0)
             ORDER BY requested_at DESC",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![direction.as_str(), include_removed], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// Find a live (non-terminal, not removed) record for a peer/file pair.
    pub async fn find_active(
        &self,
        direction: TransferDirection,
        username: &str,
        filename: &str,
    ) -> Result<Option<TransferRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM transfers
             WHERE direction = ?1 AND username = ?2 AND filename = ?3
               AND removed = 0 AND state NOT LIKE 'completed%'
             ORDER BY requested_at DESC LIMIT 1",
            COLUMNS
        ))?;
        let record = stmt
            .query_row(params![direction.as_str(), username, filename], row_to_record)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(record)
    }

    /// Hide a record from default views. Returns whether it existed.
    pub async fn mark_removed(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE transfers SET removed = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Remove every completed record for one direction.
    pub async fn clear_completed(&self, direction: TransferDirection) -> Result<u64> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM transfers WHERE direction = ?1 AND state LIKE 'completed%'",
            params![direction.as_str()],
        )?;
        Ok(removed as u64)
    }
}

const COLUMNS: &str = "id, direction, username, filename, size, requested_at, started_at, \
                       ended_at, bytes_transferred, average_speed, place_in_queue, state, \
                       exception, removed";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRecord> {
    let parse_time = |value: Option<String>| {
        value.and_then(|v| {
            DateTime::parse_from_rfc3339(&v)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
    };

    let id: String = row.get(0)?;
    let direction: String = row.get(1)?;
    let requested_at: String = row.get(5)?;
    let state: String = row.get(11)?;

    Ok(TransferRecord {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        direction: direction.parse().unwrap_or(TransferDirection::Upload),
        username: row.get(2)?,
        filename: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        requested_at: parse_time(Some(requested_at)).unwrap_or_else(Utc::now),
        started_at: parse_time(row.get(6)?),
        ended_at: parse_time(row.get(7)?),
        bytes_transferred: row.get::<_, i64>(8)? as u64,
        average_speed: row.get(9)?,
        place_in_queue: row.get(10)?,
        state: state.parse().unwrap_or(TransferState::Requested),
        exception: row.get(12)?,
        removed: row.get::<_, i64>(13)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn store() -> Arc<TransferStore> {
        let conn = db::init_db_memory().unwrap();
        TransferStore::new(Arc::new(Mutex::new(conn)))
    }

    #[tokio::test]
    async fn test_upsert_and_get_round_trip() {
        let store = store();
        let mut record = TransferRecord::new(
            TransferDirection::Upload,
            "peer",
            "music\\song.mp3",
            1024,
        );
        record.state = TransferState::Queued;
        store.upsert(&record).await.unwrap();

        let loaded = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.username, "peer");
        assert_eq!(loaded.state, TransferState::Queued);
        assert_eq!(loaded.size, 1024);
        assert!(!loaded.removed);
    }

    #[tokio::test]
    async fn test_find_active_skips_terminal() {
        let store = store();
        let mut record =
            TransferRecord::new(TransferDirection::Upload, "peer", "music\\a.mp3", 10);
        record.state = TransferState::Queued;
        store.upsert(&record).await.unwrap();

        assert!(store
            .find_active(TransferDirection::Upload, "peer", "music\\a.mp3")
            .await
            .unwrap()
            .is_some());

        record.complete(CompletionReason::Succeeded, 10);
        store.upsert(&record).await.unwrap();

        assert!(store
            .find_active(TransferDirection::Upload, "peer", "music\\a.mp3")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_clear_completed_only_touches_terminal() {
        let store = store();
        let mut done = TransferRecord::new(TransferDirection::Upload, "p", "a", 1);
        done.complete(CompletionReason::Succeeded, 1);
        store.upsert(&done).await.unwrap();

        let mut live = TransferRecord::new(TransferDirection::Upload, "p", "b", 1);
        live.state = TransferState::InProgress;
        store.upsert(&live).await.unwrap();

        assert_eq!(
            store.clear_completed(TransferDirection::Upload).await.unwrap(),
            1
        );
        assert!(store.get(done.id).await.unwrap().is_none());
        assert!(store.get(live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_removed_hides_from_default_list() {
        let store = store();
        let record = TransferRecord::new(TransferDirection::Download, "p", "f", 1);
        store.upsert(&record).await.unwrap();

        assert!(store.mark_removed(record.id).await.unwrap());
        assert!(store
            .list(TransferDirection::Download, false)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.list(TransferDirection::Download, true).await.unwrap().len(),
            1
        );
        // Removing again still reports the record as present.
        assert!(store.mark_removed(record.id).await.unwrap());
    }

    #[test]
    fn test_completed_invariants() {
        let mut record = TransferRecord::new(TransferDirection::Upload, "p", "f", 100);
        record.started_at = Some(Utc::now());
        record.complete(CompletionReason::Succeeded, 100);

        assert!(record.bytes_transferred <= record.size);
        assert!(record.ended_at.unwrap() >= record.started_at.unwrap());
        assert!(record.average_speed >= 0.0);
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            TransferState::Requested,
            TransferState::Queued,
            TransferState::Initializing,
            TransferState::InProgress,
            TransferState::Completed(CompletionReason::Succeeded),
            TransferState::Completed(CompletionReason::Cancelled),
            TransferState::Completed(CompletionReason::TimedOut),
            TransferState::Completed(CompletionReason::Rejected),
            TransferState::Completed(CompletionReason::Errored),
        ] {
            assert_eq!(state.as_str().parse::<TransferState>().unwrap(), state);
        }
    }
}
