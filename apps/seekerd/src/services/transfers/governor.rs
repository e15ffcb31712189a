//! Transfer pacing.
//!
//! The rate-control contract is a plain function: given the bytes moved so
//! far and the elapsed time, return how long to sleep before the next
//! chunk. The default returns zero, which still yields cooperatively
//! between chunks. [`GovernedReader`] applies a governor to any byte
//! source handed to the protocol client.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Pacing function: `(bytes_so_far, elapsed) -> delay`.
pub type Governor = Arc<dyn Fn(u64, Duration) -> Duration + Send + Sync>;

/// The default governor: no throttling.
pub fn unthrottled() -> Governor {
    Arc::new(|_, _| Duration::ZERO)
}

/// A delay-based limiter holding throughput at `bytes_per_second`.
/// Zero means unlimited.
pub fn speed_limited(bytes_per_second: u64) -> Governor {
    Arc::new(move |bytes, elapsed| {
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        let target = Duration::from_secs_f64(bytes as f64 / bytes_per_second as f64);
        target.saturating_sub(elapsed)
    })
}

/// Observer invoked with the running byte total after each chunk.
pub type ProgressFn = Box<dyn Fn(u64) + Send + Sync>;

/// An `AsyncRead` adapter that consults a governor between chunks.
pub struct GovernedReader<R> {
    inner: R,
    governor: Governor,
    progress: Option<ProgressFn>,
    started: Option<Instant>,
    bytes: u64,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<R: AsyncRead + Unpin> GovernedReader<R> {
    pub fn new(inner: R, governor: Governor) -> Self {
        Self {
            inner,
            governor,
            progress: None,
            started: None,
            bytes: 0,
            delay: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for GovernedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.delay = None;
        }

        let started = *this.started.get_or_insert_with(Instant::now);

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let chunk = buf.filled().len() - before;

        if chunk > 0 {
            this.bytes += chunk as u64;
            if let Some(progress) = &this.progress {
                progress(this.bytes);
            }
            let pause = (this.governor)(this.bytes, started.elapsed());
            if pause > Duration::ZERO {
                this.delay = Some(Box::pin(tokio::time::sleep(pause)));
            }
        }

        Poll::Ready(Ok(()))
    }
}
