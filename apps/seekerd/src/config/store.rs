//! Live options store.
//!
//! Holds the current merged snapshot and fans out field-level diffs to
//! subscribers. Reads clone an `Arc` of the current snapshot; writes are
//! serialized by a single guard, and subscribers run to completion under
//! that guard before the next snapshot can be assembled.

use std::sync::{Arc, RwLock};

use crate::error::{AppError, Result};

use super::diff::{diff, OptionChange};
use super::Options;

type Subscriber = Box<dyn Fn(&Arc<Options>, &[OptionChange]) + Send + Sync>;

struct Inner {
    current: Arc<Options>,
    subscribers: Vec<Subscriber>,
}

/// Snapshot store with synchronous change fan-out.
pub struct OptionsStore {
    inner: RwLock<Inner>,
}

impl OptionsStore {
    /// Wrap an already-validated snapshot.
    pub fn new(initial: Options) -> Self {
        Self {
            inner: RwLock::new(Inner {
                current: Arc::new(initial),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn new_shared(initial: Options) -> Arc<Self> {
        Arc::new(Self::new(initial))
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<Options> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .current
            .clone()
    }

    /// Register a change callback. Callbacks observe `(next, changes)` and
    /// run synchronously, in registration order, while the write guard is
    /// held.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Arc<Options>, &[OptionChange]) + Send + Sync + 'static,
    {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.subscribers.push(Box::new(callback));
    }

    /// Validate and swap in a new snapshot, returning the applied changes.
    ///
    /// An empty diff swaps nothing and fires no callbacks. A validation
    /// failure aborts the swap and the previous snapshot stays current.
    pub fn replace(&self, next: Options) -> Result<Vec<OptionChange>> {
        let report = next.validate();
        if !report.is_empty() {
            return Err(AppError::ConfigurationInvalid(report));
        }

        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let changes = diff(&inner.current, &next);
        if changes.is_empty() {
            tracing::debug!("Options snapshot unchanged, skipping fan-out");
            return Ok(changes);
        }

        for change in &changes {
            tracing::info!(change = %change.describe(), "Option changed");
        }

        inner.current = Arc::new(next);
        let current = inner.current.clone();
        for subscriber in &inner.subscribers {
            subscriber(&current, &changes);
        }

        Ok(changes)
    }

    /// Re-read the configuration sources and swap the result in.
    pub fn reload_from(&self, config_path: &str) -> Result<Vec<OptionChange>> {
        let next = Options::load_from(config_path)?;
        self.replace(next)
    }
}
