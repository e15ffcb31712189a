//! Share index service.
//!
//! Owns the published share catalog: the local host's slice built by
//! scanning configured roots, plus (on a controller) one slice per agent.
//! Queries run against the current snapshots; `fill` builds a private
//! snapshot and swaps it in atomically, so readers never observe a partial
//! index.

mod index;
mod scanner;

pub use index::{DirectoryRecord, FileAttributes, FileLocation, FileRecord, ShareSnapshot};
pub use scanner::{assign_masks, FilterRule, ScanOutcome};

use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::OptionsStore;
use crate::error::{AppError, Result};
use crate::state::{SharesState, StateStore};

/// Share catalog service.
pub struct ShareService {
    options: Arc<OptionsStore>,
    state: Arc<StateStore>,
    /// Slices keyed by host; the local host's slice is rebuilt by `fill`.
    slices: RwLock<HashMap<String, Arc<ShareSnapshot>>>,
    /// Exclusive-build lock; only one fill runs at a time.
    fill_lock: Mutex<()>,
    local_host: String,
}

impl ShareService {
    pub fn new(options: Arc<OptionsStore>, state: Arc<StateStore>) -> Arc<Self> {
        let local_host = options.current().instance.name.clone();
        Arc::new(Self {
            options,
            state,
            slices: RwLock::new(HashMap::new()),
            fill_lock: Mutex::new(()),
            local_host,
        })
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Rebuild the local slice from the configured roots.
    ///
    /// Publishes coarse progress through the state store. On failure the
    /// previous snapshot stays visible and the state is marked faulted.
    pub async fn fill(&self) -> Result<()> {
        let _guard = self.fill_lock.lock().await;

        let options = self.options.current();
        let roots = options.shares.directories.clone();
        let filters = FilterRule::compile_all(&options.shares.filters)?;
        let on_conflict = options.shares.on_conflict;
        let host = self.local_host.clone();

        self.state.update(|state| {
            let mut next = state.clone();
            next.shares.filling = true;
            next.shares.fill_progress = 0;
            next
        });

        tracing::info!(roots = roots.len(), "Filling share index");

        let progress_state = Arc::clone(&self.state);
        let outcome = tokio::task::spawn_blocking(move || {
            scanner::scan(&host, &roots, &filters, on_conflict, &move |percent| {
                progress_state.update(|state| {
                    let mut next = state.clone();
                    next.shares.fill_progress = percent;
                    next
                });
            })
        })
        .await
        .map_err(|e| AppError::TransportFailure(format!("scan task panicked: {}", e)))?;

        match outcome {
            Ok(outcome) => {
                {
                    let mut slices = self.slices.write().await;
                    slices.insert(self.local_host.clone(), Arc::new(outcome.snapshot));
                }
                let (files, directories) = self.totals().await;
                let excluded = outcome.excluded;
                self.state.update(move |state| {
                    let mut next = state.clone();
                    next.shares = SharesState {
                        scan_pending: false,
                        directories,
                        files,
                        excluded,
                        filling: false,
                        fill_progress: 100,
                        faulted: false,
                        last_filled: Some(Utc::now()),
                    };
                    next
                });
                tracing::info!(
                    files = outcome.files,
                    directories = outcome.directories,
                    excluded = outcome.excluded,
                    "Share index fill complete"
                );
                Ok(())
            }
            Err(e) => {
                self.state.update(|state| {
                    let mut next = state.clone();
                    next.shares.filling = false;
                    next.shares.faulted = true;
                    next
                });
                Err(e)
            }
        }
    }

    /// Slices in deterministic query order: local first, then agents by name.
    async fn ordered_slices(&self) -> Vec<Arc<ShareSnapshot>> {
        let slices = self.slices.read().await;
        let mut hosts: Vec<&String> = slices.keys().collect();
        hosts.sort_by_key(|h| (*h != &self.local_host, (*h).clone()));
        hosts
            .into_iter()
            .filter_map(|h| slices.get(h).cloned())
            .collect()
    }

    /// Full-text search across every slice, de-duplicated by masked path.
    pub async fn search(&self, query: &str) -> Result<Vec<FileRecord>> {
        let mut seen = std::collections::HashSet::new();
        let mut results = Vec::new();
        for slice in self.ordered_slices().await {
            for record in slice.search(query)? {
                if seen.insert(record.masked_path.clone()) {
                    results.push(record);
                }
            }
        }
        Ok(results)
    }

    /// The merged browse view in insertion-stable order.
    pub async fn browse(&self) -> Result<Vec<DirectoryRecord>> {
        let mut directories = Vec::new();
        for slice in self.ordered_slices().await {
            directories.extend(slice.browse()?);
        }
        Ok(directories)
    }

    /// Files of one masked directory; unknown directories yield empty.
    pub async fn directory(&self, name: &str) -> Result<Vec<FileRecord>> {
        let mut files = Vec::new();
        for slice in self.ordered_slices().await {
            files.extend(slice.directory(name)?);
        }
        Ok(files)
    }

    /// Where an advertised masked path lives.
    pub async fn locate(&self, masked_path: &str) -> Result<FileLocation> {
        for slice in self.ordered_slices().await {
            match slice.locate(masked_path) {
                Ok(location) => return Ok(location),
                Err(AppError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(AppError::NotFound(format!("share {}", masked_path)))
    }

    /// Resolve a masked path to a local absolute path.
    pub async fn resolve(&self, masked_path: &str) -> Result<PathBuf> {
        match self.locate(masked_path).await? {
            FileLocation::Local(path) => Ok(path),
            FileLocation::Remote { host } => Err(AppError::NotFound(format!(
                "{} is hosted remotely on {}",
                masked_path, host
            ))),
        }
    }

    /// Look up a single advertised file.
    pub async fn get(&self, masked_path: &str) -> Result<Option<FileRecord>> {
        for slice in self.ordered_slices().await {
            if let Some(record) = slice.get(masked_path)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// `(files, directories)` across every slice.
    pub async fn totals(&self) -> (u64, u64) {
        let slices = self.slices.read().await;
        slices.values().fold((0, 0), |(f, d), slice| {
            (f + slice.file_count(), d + slice.directory_count())
        })
    }

    /// Masks advertised by the local slice.
    pub async fn local_masks(&self) -> Vec<String> {
        let slices = self.slices.read().await;
        slices
            .get(&self.local_host)
            .map(|slice| slice.masks().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Serialize the local slice to a portable database file.
    pub async fn serialize_local(&self, path: &Path) -> Result<()> {
        let slice = {
            let slices = self.slices.read().await;
            slices
                .get(&self.local_host)
                .cloned()
                .ok_or_else(|| AppError::NotFound("local share index".to_string()))?
        };
        slice.serialize_to(path)
    }

    /// Replace one agent's slice with a shipped database file.
    pub async fn replace_remote_slice(&self, host: &str, database: &Path) -> Result<()> {
        if host == self.local_host {
            return Err(AppError::BadRequest(
                "cannot replace the local slice with a remote upload".to_string(),
            ));
        }
        let slice = ShareSnapshot::load_from(host, database)?;
        tracing::info!(
            host = %host,
            files = slice.file_count(),
            directories = slice.directory_count(),
            "Replacing remote share slice"
        );
        {
            let mut slices = self.slices.write().await;
            slices.insert(host.to_string(), Arc::new(slice));
        }

        let (files, directories) = self.totals().await;
        self.state.update(move |state| {
            let mut next = state.clone();
            next.shares.files = files;
            next.shares.directories = directories;
            next
        });
        Ok(())
    }

    /// Drop an agent's slice (e.g. when the agent is deregistered).
    pub async fn remove_remote_slice(&self, host: &str) {
        let removed = {
            let mut slices = self.slices.write().await;
            slices.remove(host).is_some()
        };
        if removed {
            let (files, directories) = self.totals().await;
            self.state.update(move |state| {
                let mut next = state.clone();
                next.shares.files = files;
                next.shares.directories = directories;
                next
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::state::DaemonState;
    use std::fs;
    use tempfile::TempDir;

    async fn service_with_roots(roots: Vec<PathBuf>) -> Arc<ShareService> {
        let mut options = Options::default();
        options.shares.directories = roots;
        let options = OptionsStore::new_shared(options);
        let state = StateStore::new_shared(DaemonState::default());
        ShareService::new(options, state)
    }

    #[tokio::test]
    async fn test_queries_empty_until_first_fill() {
        let service = service_with_roots(vec![]).await;
        assert!(service.search("anything").await.unwrap().is_empty());
        assert!(service.browse().await.unwrap().is_empty());
        assert!(service.resolve("a\\b.mp3").await.is_err());
    }

    #[tokio::test]
    async fn test_fill_publishes_state() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("song.mp3"), vec![0u8; 512]).unwrap();

        let service = service_with_roots(vec![root.path().to_path_buf()]).await;
        let state = Arc::clone(&service.state);
        service.fill().await.unwrap();

        let current = state.current();
        assert!(!current.shares.scan_pending);
        assert!(!current.shares.filling);
        assert!(!current.shares.faulted);
        assert_eq!(current.shares.files, 1);
        assert_eq!(current.shares.fill_progress, 100);
        assert!(current.shares.last_filled.is_some());
    }

    #[tokio::test]
    async fn test_search_and_resolve_after_fill() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("song.mp3"), vec![0u8; 512]).unwrap();
        fs::write(b.path().join("track.flac"), vec![0u8; 1024]).unwrap();

        let service =
            service_with_roots(vec![a.path().to_path_buf(), b.path().to_path_buf()]).await;
        service.fill().await.unwrap();

        let results = service.search("song").await.unwrap();
        assert_eq!(results.len(), 1);
        let resolved = service.resolve(&results[0].masked_path).await.unwrap();
        assert_eq!(resolved, a.path().join("song.mp3"));

        let (files, directories) = service.totals().await;
        assert_eq!(files, 2);
        assert_eq!(directories, 2);
    }

    #[tokio::test]
    async fn test_remote_slice_merges_into_queries() {
        let local = TempDir::new().unwrap();
        fs::write(local.path().join("here.mp3"), b"x").unwrap();

        let service = service_with_roots(vec![local.path().to_path_buf()]).await;
        service.fill().await.unwrap();

        // Build a slice as an agent would and ship it as a database file.
        let agent_root = TempDir::new().unwrap();
        fs::write(agent_root.path().join("there.mp3"), b"y").unwrap();
        let outcome = scanner::scan(
            "a1",
            &[agent_root.path().to_path_buf()],
            &[],
            crate::config::ConflictPolicy::Replace,
            &|_| {},
        )
        .unwrap();
        let shipped = TempDir::new().unwrap();
        let db_path = shipped.path().join("slice.db");
        outcome.snapshot.serialize_to(&db_path).unwrap();

        service.replace_remote_slice("a1", &db_path).await.unwrap();

        let results = service.search("there").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].host, "a1");
        assert_eq!(
            service.locate(&results[0].masked_path).await.unwrap(),
            FileLocation::Remote {
                host: "a1".to_string()
            }
        );

        let (files, _) = service.totals().await;
        assert_eq!(files, 2);
    }
}
