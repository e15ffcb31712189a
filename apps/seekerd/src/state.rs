//! Process-wide observable state.
//!
//! A typed, copy-on-write record of everything the UI and the other
//! components need to observe: connection status, share counters, relay
//! membership, and pending reconnect/restart flags. Writes take a
//! transformer and publish `(previous, current)` to subscribers
//! synchronously in registration order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::config::RelayMode;

/// Connection status of the Soulseek server link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    LoggedIn,
}

/// Server-link slice of the state record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerState {
    pub address: Option<String>,
    pub state: ConnectionState,
    pub username: Option<String>,
}

/// Share-index slice of the state record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharesState {
    /// True until the first fill completes.
    pub scan_pending: bool,
    pub directories: u64,
    pub files: u64,
    pub excluded: u64,
    pub filling: bool,
    /// Whole percent, 0-100.
    pub fill_progress: u8,
    pub faulted: bool,
    pub last_filled: Option<DateTime<Utc>>,
}

impl Default for SharesState {
    fn default() -> Self {
        Self {
            scan_pending: true,
            directories: 0,
            files: 0,
            excluded: 0,
            filling: false,
            fill_progress: 0,
            faulted: false,
            last_filled: None,
        }
    }
}

/// One registered agent as seen by a controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentState {
    pub name: String,
    pub connected: bool,
}

/// Federation slice of the state record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayState {
    pub mode: RelayMode,
    /// Agent side: whether the controller channel is up.
    pub controller_connected: bool,
    /// Controller side: registered agents and their connectivity.
    pub agents: Vec<AgentState>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            mode: RelayMode::None,
            controller_connected: false,
            agents: Vec::new(),
        }
    }
}

/// The full observable record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DaemonState {
    pub version: String,
    pub server: ServerState,
    pub relay: RelayState,
    pub shares: SharesState,
    pub pending_reconnect: bool,
    pub pending_restart: bool,
}

type Subscriber = Box<dyn Fn(&Arc<DaemonState>, &Arc<DaemonState>) + Send + Sync>;

struct Inner {
    current: Arc<DaemonState>,
    subscribers: Vec<Subscriber>,
}

/// Copy-on-write store for [`DaemonState`].
pub struct StateStore {
    inner: RwLock<Inner>,
}

impl StateStore {
    pub fn new(initial: DaemonState) -> Self {
        Self {
            inner: RwLock::new(Inner {
                current: Arc::new(initial),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn new_shared(initial: DaemonState) -> Arc<Self> {
        Arc::new(Self::new(initial))
    }

    /// The current record.
    pub fn current(&self) -> Arc<DaemonState> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .current
            .clone()
    }

    /// Register a subscriber observing `(previous, current)` pairs.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Arc<DaemonState>, &Arc<DaemonState>) + Send + Sync + 'static,
    {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.subscribers.push(Box::new(callback));
    }

    /// Apply a transformer and publish the resulting record.
    pub fn update<F>(&self, transform: F) -> Arc<DaemonState>
    where
        F: FnOnce(&DaemonState) -> DaemonState,
    {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = inner.current.clone();
        let current = Arc::new(transform(&previous));
        inner.current = current.clone();

        for subscriber in &inner.subscribers {
            subscriber(&previous, &current);
        }

        current
    }
}
