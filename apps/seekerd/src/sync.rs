//! Small synchronization helpers shared across services.

use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(300);
const BACKOFF_JITTER_MS: u64 = 1000;

/// Exponential reconnect delay: `base * 2^(attempt - 1)`, clamped to the
/// maximum, without jitter. Attempts are 1-based.
pub fn backoff_base_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(BACKOFF_MAX)
}

/// The full reconnect delay: clamped exponential plus bounded additive
/// jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    backoff_base_delay(attempt)
        + Duration::from_millis(rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS))
}

/// Why a cancellation fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A user or API call asked for the work to stop.
    User,
    /// The work should fail with a retriable cause and be re-queued.
    Requeue,
    /// The process is shutting down.
    Shutdown,
}

/// A cloneable cancellation handle.
///
/// Cancelling is sticky: the first reason wins and every clone observes it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<Option<CancelReason>>>,
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Trigger the handle. Later reasons are ignored.
    pub fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Wait until the handle fires.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = *rx.borrow() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CancelReason::Shutdown;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
