// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process lifecycle.
//!
//! Two loops run side by side and share one [`CancellationToken`]: a listener
//! for the termination signal and the service's worker loop. A termination
//! signal cancels the token; so does the first loop that fails. No loop is
//! restarted.

use std::future::Future;
use std::io;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum RunError<E>
where
    E: std::error::Error + 'static,
{
    #[error("cannot listen for termination signal")]
    Signal(#[source] io::Error),
    #[error("worker stopped")]
    Worker(#[source] E),
    #[error("loop task failed")]
    Join(#[source] JoinError),
}

#[derive(Default)]
pub struct LifecycleCoordinator {
    shutdown_token: CancellationToken,
}

impl LifecycleCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `worker` until `shutdown` resolves (the binaries pass
    /// [`wait_for_signal`]) or until a loop fails. Returns the first failure.
    pub async fn run<S, F, Fut, E>(self, shutdown: S, worker: F) -> Result<(), RunError<E>>
    where
        S: Future<Output = io::Result<()>> + Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let token = self.shutdown_token;
        let mut loops = JoinSet::new();

        let signal_token = token.clone();
        loops.spawn(async move {
            tokio::select! {
                () = signal_token.cancelled() => Ok(()),
                received = shutdown => match received {
                    Ok(()) => {
                        info!("Termination signal received, shutting down");
                        signal_token.cancel();
                        Ok(())
                    }
                    Err(e) => Err(RunError::Signal(e)),
                },
            }
        });

        let worker = worker(token.clone());
        loops.spawn(async move { worker.await.map_err(RunError::Worker) });

        let mut first_error = None;
        while let Some(joined) = loops.join_next().await {
            let Err(e) = joined.unwrap_or_else(|e| Err(RunError::Join(e))) else {
                continue;
            };
            if first_error.is_none() {
                token.cancel();
                first_error = Some(e);
            } else {
                debug!("Loop failed after shutdown began: {e}");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Resolves on the first SIGTERM or SIGINT.
#[cfg(unix)]
pub async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => debug!("Received SIGTERM"),
        _ = interrupt.recv() => debug!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    debug!("Received Ctrl+C");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("worker broke")]
    struct WorkerBroke;

    async fn until_cancelled(token: CancellationToken) -> Result<(), WorkerBroke> {
        token.cancelled().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_error_cancels_and_is_returned() {
        let mut worker_token = None;

        let result = LifecycleCoordinator::new()
            .run(std::future::pending(), |token| {
                worker_token = Some(token);
                async { Err::<(), _>(WorkerBroke) }
            })
            .await;

        assert!(matches!(result, Err(RunError::Worker(WorkerBroke))));
        assert!(worker_token.unwrap().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_cancels_worker() {
        let signal = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<(), io::Error>(())
        };

        // returns only once the worker has observed cancellation
        let result = LifecycleCoordinator::new()
            .run(signal, until_cancelled)
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_signal_listener_failure_stops_worker() {
        let coordinator = LifecycleCoordinator::new();

        let result = coordinator
            .run(
                async { Err::<(), _>(io::Error::new(io::ErrorKind::Other, "no signals")) },
                until_cancelled,
            )
            .await;

        assert!(matches!(result, Err(RunError::Signal(_))));
    }

    #[tokio::test]
    async fn test_error_during_shutdown_is_reported_once() {
        let coordinator = LifecycleCoordinator::new();

        let result = coordinator
            .run(async { Ok::<(), io::Error>(()) }, |token| async move {
                token.cancelled().await;
                Err::<(), _>(WorkerBroke)
            })
            .await;

        assert!(matches!(result, Err(RunError::Worker(WorkerBroke))));
    }

    #[tokio::test]
    async fn test_worker_panic_is_reported() {
        let coordinator = LifecycleCoordinator::new();

        let result = coordinator
            .run(std::future::pending(), |token| async move {
                if !token.is_cancelled() {
                    panic!("worker panicked");
                }
                Ok::<(), WorkerBroke>(())
            })
            .await;

        assert!(matches!(result, Err(RunError::Join(_))));
    }
}
