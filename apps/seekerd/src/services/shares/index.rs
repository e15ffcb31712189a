//! Share index snapshots.
//!
//! A [`ShareSnapshot`] is one host's slice of the share catalog: an
//! in-memory SQLite database with an FTS5 table over masked filenames, plus
//! the `mask ↔ root` map needed to resolve masked paths back to disk.
//! Snapshots are immutable once published; a rebuild constructs a private
//! snapshot and swaps it in (see `super::ShareService`).
//!
//! Slices are portable: `serialize_to` backs the database up to a file an
//! agent can ship to its controller, and `load_from` re-opens such a file
//! into memory after validating it.

use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Audio attributes extracted from file metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileAttributes {
    /// Bitrate in kbps.
    pub bitrate: Option<u32>,
    /// Duration in seconds.
    pub duration: Option<u32>,
    /// Sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Bit depth.
    pub bit_depth: Option<u32>,
    /// Whether the file uses variable bitrate.
    pub vbr: Option<bool>,
    /// Whether the format is lossless.
    pub lossless: Option<bool>,
}

/// A file advertised by the index, keyed by its masked path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    /// Host contributing the file.
    pub host: String,
    /// `mask\relative\path` with backslash separators.
    pub masked_path: String,
    /// File size in bytes.
    pub size: u64,
    /// File extension (lowercase).
    pub extension: String,
    pub attributes: FileAttributes,
}

/// A directory in the browse view.
#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    /// Masked directory name.
    pub name: String,
    pub files: Vec<FileRecord>,
}

/// Where a masked path physically lives.
#[derive(Debug, Clone, PartialEq)]
pub enum FileLocation {
    /// On this host's filesystem.
    Local(PathBuf),
    /// On a federated agent.
    Remote { host: String },
}

const SCHEMA: &str = "
    CREATE TABLE shares (
        mask TEXT PRIMARY KEY,
        root TEXT
    );
    CREATE TABLE directories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        masked_path TEXT NOT NULL UNIQUE,
        directory TEXT NOT NULL,
        size INTEGER NOT NULL,
        extension TEXT NOT NULL,
        bitrate INTEGER,
        duration INTEGER,
        sample_rate INTEGER,
        bit_depth INTEGER,
        vbr INTEGER,
        lossless INTEGER
    );
    CREATE VIRTUAL TABLE filenames USING fts5(tokens);
";

/// Replace path separators and quoting characters with whitespace and
/// lowercase the result; both indexed filenames and queries go through this.
pub fn normalize_tokens(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '"' => ' ',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// One host's slice of the share catalog.
pub struct ShareSnapshot {
    host: String,
    db: Mutex<Connection>,
    /// mask -> absolute root; `None` for remote slices.
    masks: HashMap<String, Option<PathBuf>>,
    files: u64,
    directories: u64,
}

impl std::fmt::Debug for ShareSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareSnapshot")
            .field("host", &self.host)
            .field("masks", &self.masks)
            .field("files", &self.files)
            .field("directories", &self.directories)
            .finish()
    }
}

impl ShareSnapshot {
    /// Create an empty slice for `host`.
    pub fn empty(host: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            host: host.to_string(),
            db: Mutex::new(conn),
            masks: HashMap::new(),
            files: 0,
            directories: 0,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn file_count(&self) -> u64 {
        self.files
    }

    pub fn directory_count(&self) -> u64 {
        self.directories
    }

    /// The masks this slice advertises.
    pub fn masks(&self) -> impl Iterator<Item = &str> {
        self.masks.keys().map(String::as_str)
    }

    /// Register a mask for a scanned root. Remote slices carry no root.
    pub fn add_mask(&mut self, mask: &str, root: Option<&Path>) -> Result<()> {
        let conn = self.db.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO shares (mask, root) VALUES (?1, ?2)",
            params![mask, root.map(|r| r.to_string_lossy().into_owned())],
        )?;
        drop(conn);
        self.masks
            .insert(mask.to_string(), root.map(Path::to_path_buf));
        Ok(())
    }

    /// Insert a file record.
    ///
    /// Returns `false` when the masked path was already present, in which
    /// case the later insertion wins.
    pub fn insert_file(&mut self, record: &FileRecord) -> Result<bool> {
        let directory = parent_directory(&record.masked_path);
        let conn = self.db.lock().unwrap_or_else(|p| p.into_inner());

        let displaced: bool = {
            let mut stmt =
                conn.prepare_cached("SELECT id FROM files WHERE masked_path = ?1")?;
            let existing: Option<i64> = stmt
                .query_row(params![record.masked_path], |row| row.get(0))
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            if let Some(id) = existing {
                conn.execute("DELETE FROM files WHERE id = ?1", params![id])?;
                conn.execute("DELETE FROM filenames WHERE rowid = ?1", params![id])?;
                true
            } else {
                false
            }
        };

        conn.execute(
            "INSERT OR IGNORE INTO directories (name) VALUES (?1)",
            params![directory],
        )?;
        conn.execute(
            "INSERT INTO files (masked_path, directory, size, extension,
                                bitrate, duration, sample_rate, bit_depth, vbr, lossless)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.masked_path,
                directory,
                record.size as i64,
                record.extension,
                record.attributes.bitrate,
                record.attributes.duration,
                record.attributes.sample_rate,
                record.attributes.bit_depth,
                record.attributes.vbr.map(|v| v as i64),
                record.attributes.lossless.map(|v| v as i64),
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO filenames (rowid, tokens) VALUES (?1, ?2)",
            params![id, normalize_tokens(&record.masked_path)],
        )?;
        drop(conn);

        if !displaced {
            self.files += 1;
        }
        self.refresh_directory_count()?;
        Ok(!displaced)
    }

    fn refresh_directory_count(&mut self) -> Result<()> {
        let conn = self.db.lock().unwrap_or_else(|p| p.into_inner());
        self.directories =
            conn.query_row("SELECT COUNT(*) FROM directories", [], |row| row.get(0))?;
        Ok(())
    }

    /// Full-text search over masked filenames. The query is sanitized; an
    /// empty or under-length query returns the empty set.
    pub fn search(&self, query: &str) -> Result<Vec<FileRecord>> {
        let sanitized = normalize_tokens(query);
        let tokens: Vec<&str> = sanitized.split_whitespace().collect();
        if tokens.is_empty() || sanitized.trim().len() < 3 {
            return Ok(Vec::new());
        }

        // Quote every token so FTS5 treats them as terms, not syntax.
        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" ");

        let conn = self.db.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare_cached(
            "SELECT f.masked_path, f.size, f.extension,
                    f.bitrate, f.duration, f.sample_rate, f.bit_depth, f.vbr, f.lossless
             FROM files f
             JOIN filenames ON filenames.rowid = f.id
             WHERE filenames MATCH ?1",
        )?;
        let rows = stmt.query_map(params![match_expr], |row| self.row_to_record(row))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// Directories in insertion-stable order, each with its files.
    pub fn browse(&self) -> Result<Vec<DirectoryRecord>> {
        let conn = self.db.lock().unwrap_or_else(|p| p.into_inner());
        let mut dir_stmt = conn.prepare_cached("SELECT name FROM directories ORDER BY id")?;
        let names: Vec<String> = dir_stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut file_stmt = conn.prepare_cached(
            "SELECT f.masked_path, f.size, f.extension,
                    f.bitrate, f.duration, f.sample_rate, f.bit_depth, f.vbr, f.lossless
             FROM files f WHERE f.directory = ?1 ORDER BY f.id",
        )?;

        let mut result = Vec::with_capacity(names.len());
        for name in names {
            let files: Vec<FileRecord> = file_stmt
                .query_map(params![name], |row| self.row_to_record(row))?
                .collect::<std::result::Result<_, _>>()?;
            result.push(DirectoryRecord { name, files });
        }
        Ok(result)
    }

    /// Files of one masked directory; unknown directories yield empty.
    pub fn directory(&self, name: &str) -> Result<Vec<FileRecord>> {
        let normalized = name.replace('/', "\\");
        let conn = self.db.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare_cached(
            "SELECT f.masked_path, f.size, f.extension,
                    f.bitrate, f.duration, f.sample_rate, f.bit_depth, f.vbr, f.lossless
             FROM files f WHERE f.directory = ?1 ORDER BY f.id",
        )?;
        let rows = stmt.query_map(params![normalized], |row| self.row_to_record(row))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// Whether the slice advertises `masked_path`.
    pub fn contains(&self, masked_path: &str) -> Result<bool> {
        let normalized = masked_path.replace('/', "\\");
        let conn = self.db.lock().unwrap_or_else(|p| p.into_inner());
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE masked_path = ?1",
            params![normalized],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Look up a single advertised file.
    pub fn get(&self, masked_path: &str) -> Result<Option<FileRecord>> {
        let normalized = masked_path.replace('/', "\\");
        let conn = self.db.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare_cached(
            "SELECT f.masked_path, f.size, f.extension,
                    f.bitrate, f.duration, f.sample_rate, f.bit_depth, f.vbr, f.lossless
             FROM files f WHERE f.masked_path = ?1",
        )?;
        let record = stmt
            .query_row(params![normalized], |row| self.row_to_record(row))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(record)
    }

    /// Reverse the mask map: `mask\relative` to where the bytes live.
    ///
    /// Fails for masked paths the slice does not advertise.
    pub fn locate(&self, masked_path: &str) -> Result<FileLocation> {
        let normalized = masked_path.replace('/', "\\");
        if !self.contains(&normalized)? {
            return Err(AppError::NotFound(format!("share {}", masked_path)));
        }

        let mask = normalized.split('\\').next().unwrap_or_default();
        match self.masks.get(mask) {
            Some(Some(root)) => {
                let relative = normalized
                    .strip_prefix(mask)
                    .and_then(|rest| rest.strip_prefix('\\'))
                    .unwrap_or_default();
                let mut absolute = root.clone();
                for segment in relative.split('\\') {
                    absolute.push(segment);
                }
                Ok(FileLocation::Local(absolute))
            }
            Some(None) => Ok(FileLocation::Remote {
                host: self.host.clone(),
            }),
            None => Err(AppError::NotFound(format!("mask {}", mask))),
        }
    }

    /// Resolve a masked path to a local absolute path.
    pub fn resolve(&self, masked_path: &str) -> Result<PathBuf> {
        match self.locate(masked_path)? {
            FileLocation::Local(path) => Ok(path),
            FileLocation::Remote { host } => Err(AppError::NotFound(format!(
                "{} is hosted remotely on {}",
                masked_path, host
            ))),
        }
    }

    fn row_to_record(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
        Ok(FileRecord {
            host: self.host.clone(),
            masked_path: row.get(0)?,
            size: row.get::<_, i64>(1)? as u64,
            extension: row.get(2)?,
            attributes: FileAttributes {
                bitrate: row.get(3)?,
                duration: row.get(4)?,
                sample_rate: row.get(5)?,
                bit_depth: row.get(6)?,
                vbr: row.get::<_, Option<i64>>(7)?.map(|v| v != 0),
                lossless: row.get::<_, Option<i64>>(8)?.map(|v| v != 0),
            },
        })
    }

    // =========================================================================
    // Portability
    // =========================================================================

    /// Back the slice up to a database file.
    pub fn serialize_to(&self, path: &Path) -> Result<()> {
        let source = self.db.lock().unwrap_or_else(|p| p.into_inner());
        let mut destination = Connection::open(path)?;
        let backup = rusqlite::backup::Backup::new(&source, &mut destination)?;
        backup.run_to_completion(128, Duration::from_millis(10), None)?;
        Ok(())
    }

    /// Open a shipped database file into a fresh in-memory slice for `host`.
    ///
    /// The file is validated before the slice is returned: the expected
    /// tables must exist and the FTS row count must agree with the file
    /// table.
    pub fn load_from(host: &str, path: &Path) -> Result<Self> {
        let source = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut conn = Connection::open_in_memory()?;
        {
            let backup = rusqlite::backup::Backup::new(&source, &mut conn)?;
            backup.run_to_completion(128, Duration::from_millis(10), None)?;
        }

        for table in ["shares", "directories", "files", "filenames"] {
            let present: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
                    params![table],
                    |row| row.get(0),
                )
                .map_err(|_| {
                    AppError::TransportFailure("malformed share index database".to_string())
                })?;
            if present == 0 {
                return Err(AppError::TransportFailure(format!(
                    "share index database is missing the {} table",
                    table
                )));
            }
        }

        let files: u64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        let indexed: u64 =
            conn.query_row("SELECT COUNT(*) FROM filenames", [], |row| row.get(0))?;
        if files != indexed {
            return Err(AppError::TransportFailure(format!(
                "share index database is inconsistent: {} files, {} indexed",
                files, indexed
            )));
        }
        let directories: u64 =
            conn.query_row("SELECT COUNT(*) FROM directories", [], |row| row.get(0))?;

        // Remote slices resolve to their owning host, never to a local root.
        let mut masks = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT mask FROM shares")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for mask in rows {
                masks.insert(mask?, None);
            }
        }

        Ok(Self {
            host: host.to_string(),
            db: Mutex::new(conn),
            masks,
            files,
            directories,
        })
    }
}

fn parent_directory(masked_path: &str) -> String {
    match masked_path.rsplit_once('\\') {
        Some((directory, _)) => directory.to_string(),
        None => masked_path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(masked_path: &str, size: u64) -> FileRecord {
        FileRecord {
            host: "local".to_string(),
            masked_path: masked_path.to_string(),
            size,
            extension: masked_path
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_string(),
            attributes: FileAttributes::default(),
        }
    }

    fn snapshot_with_songs() -> ShareSnapshot {
        let mut snapshot = ShareSnapshot::empty("local").unwrap();
        snapshot.add_mask("a", Some(Path::new("/m/a"))).unwrap();
        snapshot.add_mask("b", Some(Path::new("/m/b"))).unwrap();
        snapshot
            .insert_file(&record("a\\song.mp3", 5 * 1024 * 1024))
            .unwrap();
        snapshot
            .insert_file(&record("b\\track.flac", 20 * 1024 * 1024))
            .unwrap();
        snapshot
    }

    #[test]
    fn test_search_finds_by_token() {
        let snapshot = snapshot_with_songs();
        let results = snapshot.search("song").unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].masked_path.ends_with("song.mp3"));
    }

    #[test]
    fn test_search_under_length_is_empty() {
        let snapshot = snapshot_with_songs();
        assert!(snapshot.search("ab").unwrap().is_empty());
        assert!(snapshot.search("").unwrap().is_empty());
    }

    #[test]
    fn test_search_sanitizes_separators() {
        let snapshot = snapshot_with_songs();
        let results = snapshot.search("a\\song").unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_resolve_round_trips() {
        let snapshot = snapshot_with_songs();
        let path = snapshot.resolve("a\\song.mp3").unwrap();
        assert_eq!(path, PathBuf::from("/m/a/song.mp3"));
    }

    #[test]
    fn test_resolve_unknown_mask_fails() {
        let snapshot = snapshot_with_songs();
        assert!(snapshot.resolve("zz\\nope.mp3").is_err());
    }

    #[test]
    fn test_browse_counts_agree_with_file_count() {
        let snapshot = snapshot_with_songs();
        let browsed: u64 = snapshot
            .browse()
            .unwrap()
            .iter()
            .map(|d| d.files.len() as u64)
            .sum();
        assert_eq!(browsed, snapshot.file_count());
    }

    #[test]
    fn test_duplicate_masked_path_keeps_later() {
        let mut snapshot = ShareSnapshot::empty("local").unwrap();
        snapshot.add_mask("a", Some(Path::new("/m/a"))).unwrap();
        assert!(snapshot.insert_file(&record("a\\dup.mp3", 10)).unwrap());
        assert!(!snapshot.insert_file(&record("a\\dup.mp3", 20)).unwrap());

        assert_eq!(snapshot.file_count(), 1);
        assert_eq!(snapshot.get("a\\dup.mp3").unwrap().unwrap().size, 20);
    }

    #[test]
    fn test_unknown_directory_is_empty() {
        let snapshot = snapshot_with_songs();
        assert!(snapshot.directory("nope").unwrap().is_empty());
    }

    #[test]
    fn test_serialize_and_load_round_trip() {
        let snapshot = snapshot_with_songs();
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("slice.db");
        snapshot.serialize_to(&db_path).unwrap();

        let loaded = ShareSnapshot::load_from("a1", &db_path).unwrap();
        assert_eq!(loaded.file_count(), snapshot.file_count());
        assert_eq!(loaded.directory_count(), snapshot.directory_count());
        assert_eq!(loaded.search("song").unwrap().len(), 1);
        // Remote slices locate to their owning host.
        assert_eq!(
            loaded.locate("a\\song.mp3").unwrap(),
            FileLocation::Remote {
                host: "a1".to_string()
            }
        );
    }

    #[test]
    fn test_load_rejects_malformed_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("bogus.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE unrelated (x INTEGER)")
            .unwrap();
        drop(conn);

        assert!(ShareSnapshot::load_from("a1", &db_path).is_err());
    }
}
