//! Background task management
//!
//! Every long-running loop watches the same shutdown channel. On shutdown the
//! signal is flipped and each task gets a bounded time to finish its current
//! unit of work before it is aborted.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Receiver to hand to a task loop.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(task = name, "Spawning background task");
        self.handles.push((name, tokio::spawn(task)));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown and join every task, aborting those that overrun `timeout`.
    pub async fn shutdown(self, timeout: Duration) {
        tracing::info!(tasks = self.handles.len(), "Shutting down background tasks...");
        let _ = self.shutdown_tx.send(true);

        for (name, mut handle) in self.handles {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => tracing::info!(task = name, "Task shut down gracefully"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Task panicked or was cancelled"),
                Err(_) => {
                    handle.abort();
                    tracing::warn!(task = name, "Task did not shut down within timeout, aborted");
                }
            }
        }

        tracing::info!("All background tasks shut down");
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}
