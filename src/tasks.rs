use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Keyed set of long-lived background tasks with a shared shutdown signal.
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawns `fut` under `key`. Returns `false` without spawning when a task
    /// with that key is still running or shutdown has begun.
    pub fn spawn<F>(&self, key: &str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            return false;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|_, handle| !handle.is_finished());
        if tasks.contains_key(key) {
            return false;
        }
        tasks.insert(key.to_string(), tokio::spawn(fut));
        true
    }

    pub fn is_running(&self, key: &str) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(key).map(|h| !h.is_finished()).unwrap_or(false)
    }

    pub fn active(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.values().filter(|h| !h.is_finished()).count()
    }

    /// Signals shutdown, waits up to `grace` for tasks to finish, then aborts the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain().collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "waiting for background tasks");

        let deadline = tokio::time::Instant::now() + grace;
        for (key, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(task = %key, "background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}
