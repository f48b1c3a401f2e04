//! Session task supervision
//!
//! One long-lived task per logical responsibility, supervised as a group:
//! the first task error cancels the siblings, session expiry surfaces to the
//! caller verbatim, and every other error is logged and collapsed into a
//! generic failure.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::error::SessionError;

/// Named task group sharing one cancellation token.
pub struct TaskGroup {
    cancel: CancellationToken,
    results: mpsc::UnboundedReceiver<(&'static str, Result<(), SessionError>)>,
    results_tx: mpsc::UnboundedSender<(&'static str, Result<(), SessionError>)>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        let (results_tx, results) = mpsc::unbounded_channel();
        Self {
            cancel,
            results,
            results_tx,
            handles: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a named task. The future must observe the group's cancellation
    /// token at every blocking point and return `Ok(())` when cancelled.
    pub fn go<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        let tx = self.results_tx.clone();
        self.handles.push(tokio::spawn(async move {
            let result = fut.await;
            let _ = tx.send((name, result));
        }));
    }

    /// Wait for all tasks. The first error cancels the remaining tasks;
    /// `SessionError::Expired` wins over any other outcome.
    pub async fn wait(mut self) -> Result<(), SessionError> {
        drop(self.results_tx);
        let total = self.handles.len();
        let mut outcome = Ok(());
        for _ in 0..total {
            let Some((name, result)) = self.results.recv().await else {
                break;
            };
            match result {
                Ok(()) => tracing::debug!("task {name} ended"),
                Err(SessionError::Expired) => {
                    tracing::info!("task {name}: session expired");
                    outcome = Err(SessionError::Expired);
                    self.cancel.cancel();
                }
                Err(e) => {
                    tracing::error!("task {name} failed: {e}");
                    if outcome.is_ok() {
                        outcome = Err(SessionError::Fatal(format!("task {name} failed")));
                    }
                    self.cancel.cancel();
                }
            }
        }
        for handle in self.handles {
            let _ = handle.await;
        }
        outcome
    }
}

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(3);

/// Run a fallible unit of work until the token is cancelled.
///
/// Errors are logged and retried with exponential backoff (100 ms, doubling,
/// capped at 3 s). Cancellation is the only exit.
pub async fn run_with_retry<F, Fut>(cancel: &CancellationToken, name: &str, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut backoff = RETRY_INITIAL_BACKOFF;
    while !cancel.is_cancelled() {
        let result = tokio::select! {
            r = f() => r,
            _ = cancel.cancelled() => return,
        };
        if let Err(e) = result {
            tracing::error!("{name}: {e:#}");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
        }
    }
}
