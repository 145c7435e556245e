//! Shutdown signalling and supervised background tasks.

use crate::errors::BoxError;
use std::{future::Future, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};

/// A one-shot cancellation flag shared by every loop of the server.
///
/// Cloning is cheap; all clones observe the same flag.
///
/// ```
/// use dispatch_web::lifecycle::CancelSignal;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let signal = CancelSignal::new();
/// let waiter = signal.clone();
///
/// signal.trigger();
/// waiter.cancelled().await;
/// assert!(waiter.is_triggered());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Sets the flag and wakes every waiter. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives as long as `self`
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns `fut` and logs its error or panic instead of losing it.
pub(crate) fn spawn_supervised<F>(task: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let inner = tokio::spawn(fut);

    tokio::spawn(async move {
        match inner.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(task, error = %err, "Background task failed"),
            Err(err) if err.is_panic() => tracing::error!(task, "Background task panicked"),
            Err(_) => tracing::debug!(task, "Background task cancelled"),
        }
    })
}

/// Resolves on Ctrl-C or, on Unix, `SIGTERM`.
///
/// ```no_run
/// use dispatch_web::{lifecycle, Server};
///
/// # async fn run(server: Server) -> Result<(), dispatch_web::ServerError> {
/// server.launch_with_signal(lifecycle::shutdown_signal()).await
/// # }
/// ```
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let signal = CancelSignal::new();
        assert!(!signal.is_triggered());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        signal.trigger();

        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        // Already triggered: resolves immediately
        timeout(Duration::from_millis(50), signal.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn supervised_tasks_survive_failures() {
        let failed = spawn_supervised("failing", async { Err::<(), BoxError>("boom".into()) });
        let panicked = spawn_supervised("panicking", async {
            if true {
                panic!("boom");
            }
            Ok::<(), BoxError>(())
        });
        let fine = spawn_supervised("fine", async { Ok::<(), BoxError>(()) });

        // The supervisor itself never propagates the failure
        failed.await.unwrap();
        panicked.await.unwrap();
        fine.await.unwrap();
    }
}
