//! Task registry - shutdown coordination for the client's background tasks
//!
//! Every long-running task subscribes to one broadcast channel. Shutdown
//! sends once and then awaits tasks in reverse spawn order, aborting any
//! task that outlives its timeout.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TaskRegistry {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn sender(&self) -> &broadcast::Sender<()> {
        &self.shutdown_tx
    }

    /// Spawn a task that is handed its own shutdown receiver
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(task(self.subscribe()));
        debug!(task = %name, "Task spawned");
        self.tasks.push((name, handle));
    }

    /// Track tasks spawned elsewhere, named `<name>-<index>`
    pub fn extend(&mut self, name: &str, handles: Vec<JoinHandle<()>>) {
        for (index, handle) in handles.into_iter().enumerate() {
            self.tasks.push((format!("{name}-{index}"), handle));
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal shutdown and wait for every task, newest first
    pub async fn shutdown(mut self, timeout_per_task: Duration) {
        info!(tasks = self.tasks.len(), "Stopping background tasks");
        let _ = self.shutdown_tx.send(());

        while let Some((name, mut handle)) = self.tasks.pop() {
            match tokio::time::timeout(timeout_per_task, &mut handle).await {
                Ok(Ok(())) => debug!(task = %name, "Task stopped"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = %name, timeout_ms = timeout_per_task.as_millis() as u64, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}
