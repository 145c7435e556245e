//! Periodic callbacks driven by a single background loop.
//!
//! Every tick the loop collects the due entries, dispatches them without
//! waiting for completion and moves each entry's next due time forward by
//! whole intervals, so a slow tick never makes later ticks drift or burst.
//! Sync callbacks run on the blocking pool, async ones as supervised tasks.
//!
//! ```
//! use dispatch_web::{ticker::Ticker, BoxError};
//! use std::{sync::{atomic::{AtomicUsize, Ordering}, Arc}, time::Duration};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), dispatch_web::ServerError> {
//! let ticker = Ticker::new();
//! let count = Arc::new(AtomicUsize::new(0));
//!
//! let counter = Arc::clone(&count);
//! let handle = ticker.every(Duration::from_millis(20), move || {
//!     counter.fetch_add(1, Ordering::Relaxed);
//! })?;
//!
//! ticker.every_async(Duration::from_secs(60), || async {
//!     // e.g. flush metrics
//!     Ok::<(), BoxError>(())
//! })?;
//!
//! tokio::time::sleep(Duration::from_millis(100)).await;
//! handle.cancel();
//! assert!(count.load(Ordering::Relaxed) >= 1);
//! # Ok(())
//! # }
//! ```

use crate::{
    errors::{BoxError, ServerError},
    lifecycle::{spawn_supervised, CancelSignal},
    BoxFuture,
};
use parking_lot::Mutex;
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};

const MAX_SLEEP: Duration = Duration::from_secs(1);

type SyncCallback = Arc<dyn Fn() + Send + Sync>;
type AsyncCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

#[derive(Clone)]
enum Callback {
    Sync(SyncCallback),
    Async(AsyncCallback),
}

struct Entry {
    id: u64,
    interval: Duration,
    next_due: Instant,
    callback: Callback,
    cancelled: Arc<AtomicBool>,
}

struct Inner {
    entries: Mutex<Vec<Entry>>,
    wake: Notify,
    shutdown: CancelSignal,
    stopped: CancelSignal,
    next_id: AtomicU64,
    started: AtomicBool,
}

/// Registry of periodic callbacks.
///
/// The loop starts with the first registration made inside a Tokio runtime
/// (or when the owning server launches) and stops on shutdown.
pub struct Ticker {
    inner: Arc<Inner>,
}

impl Ticker {
    /// A standalone ticker with its own shutdown signal.
    pub fn new() -> Self {
        Self::with_shutdown(CancelSignal::new())
    }

    pub(crate) fn with_shutdown(shutdown: CancelSignal) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                wake: Notify::new(),
                shutdown,
                stopped: CancelSignal::new(),
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Calls `callback` every `interval` on the blocking thread pool.
    pub fn every<F>(&self, interval: Duration, callback: F) -> Result<TickerHandle, ServerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(interval, Callback::Sync(Arc::new(callback)))
    }

    /// Spawns `callback()` every `interval`; errors are logged.
    pub fn every_async<F, Fut>(
        &self,
        interval: Duration,
        callback: F,
    ) -> Result<TickerHandle, ServerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.register(
            interval,
            Callback::Async(Arc::new(move || Box::pin(callback()))),
        )
    }

    fn register(&self, interval: Duration, callback: Callback) -> Result<TickerHandle, ServerError> {
        if interval.is_zero() {
            return Err(ServerError::ZeroInterval);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));

        self.inner.entries.lock().push(Entry {
            id,
            interval,
            next_due: Instant::now() + interval,
            callback,
            cancelled: Arc::clone(&cancelled),
        });
        tracing::debug!(ticker = id, interval_ms = interval.as_millis() as u64, "Ticker registered");

        self.inner.wake.notify_one();
        self.start();

        Ok(TickerHandle {
            id,
            cancelled,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Starts the loop if a runtime is available and it is not running yet.
    pub(crate) fn start(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        tokio::spawn(run(Arc::clone(&self.inner)));
    }

    /// Stops the loop; registered callbacks never fire again.
    pub fn stop(&self) {
        self.inner.stopped.trigger();
    }

    /// Number of live (not cancelled) entries.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|entry| !entry.cancelled.load(Ordering::Acquire))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticker").field("entries", &self.len()).finish()
    }
}

/// Cancels one registration. Dropping the handle does not cancel it.
#[derive(Debug, Clone)]
pub struct TickerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    inner: Weak<Inner>,
}

impl TickerHandle {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.wake.notify_one();
        }
        tracing::debug!(ticker = self.id, "Ticker cancelled");
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

async fn run(inner: Arc<Inner>) {
    tracing::debug!("Ticker loop started");

    loop {
        let now = Instant::now();
        let nearest = tick(&inner, now);

        tokio::select! {
            biased;

            _ = inner.shutdown.cancelled() => break,
            _ = inner.stopped.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = sleep_until(nearest) => {}
        }
    }

    tracing::debug!("Ticker loop stopped");
}

/// Fires due entries and returns when the loop should wake next.
fn tick(inner: &Inner, now: Instant) -> Instant {
    let mut nearest = now + MAX_SLEEP;
    let mut entries = inner.entries.lock();
    entries.retain(|entry| !entry.cancelled.load(Ordering::Acquire));

    for entry in entries.iter_mut() {
        if entry.next_due <= now {
            let missed = (now - entry.next_due).as_nanos() / entry.interval.as_nanos();
            let steps = u32::try_from(missed + 1).unwrap_or(u32::MAX);
            entry.next_due = entry
                .interval
                .checked_mul(steps)
                .map_or(now + entry.interval, |advance| entry.next_due + advance);

            dispatch(entry);
        }
        nearest = nearest.min(entry.next_due);
    }

    nearest
}

fn dispatch(entry: &Entry) {
    let cancelled = Arc::clone(&entry.cancelled);

    match entry.callback.clone() {
        Callback::Sync(callback) => {
            spawn_supervised("ticker", async move {
                tokio::task::spawn_blocking(move || {
                    if !cancelled.load(Ordering::Acquire) {
                        callback();
                    }
                })
                .await
                .map_err(BoxError::from)
            });
        }
        Callback::Async(callback) => {
            if !cancelled.load(Ordering::Acquire) {
                spawn_supervised("ticker", callback());
            }
        }
    }
}
