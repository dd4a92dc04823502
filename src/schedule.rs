//! Recurring background tasks

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A task that runs every `interval` until stopped or until it breaks.
///
/// The first run happens one interval after spawning.
pub struct PeriodicTask {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            info!(task = %task_name, interval_ms = interval.as_millis(), "Periodic task started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if tick().await.is_break() {
                            debug!(task = %task_name, "Periodic task finished");
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!(task = %task_name, "Periodic task stopped");
                            break;
                        }
                    }
                }
            }
        });

        Self { name, stop_tx, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task and wait for it. A run already in progress completes first.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}
