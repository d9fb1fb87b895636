//! Task management for the shared cooperative run loop.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to the run loop that services register their work with.
///
/// Every task gets a child of the global cancellation token, so stopping the
/// loop cancels all of them at once. Services receive the manager explicitly
/// in [`Service::run`](crate::providers::Service::run); there is no global
/// scheduler.
pub struct TaskManager {
    tasks: HashMap<String, JoinHandle<Result<()>>>,
    pub global_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
        }
    }

    /// Spawns and registers a task with the given name.
    ///
    /// Task names must be unique; spawning a name twice is an error.
    pub fn spawn_task<F, Fut>(&mut self, name: impl Into<String>, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.tasks.get(&name).is_some_and(|h| !h.is_finished()) {
            anyhow::bail!("Task '{name}' is already running");
        }

        let task_token = self.global_token.child_token();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            debug!("Starting task: {task_name}");
            let result = task_fn(task_token).await;
            match &result {
                Ok(()) => debug!("Task '{task_name}' completed"),
                Err(e) => error!("Task '{task_name}' failed: {e:#}"),
            }
            result
        });

        self.tasks.insert(name.clone(), handle);
        info!("Task '{name}' spawned");
        Ok(())
    }

    /// Stops the loop: cancels every task and waits up to `timeout` for each
    /// to finish before aborting it.
    ///
    /// Returns the first task error encountered, if any.
    pub async fn shutdown_all(&mut self, timeout: Duration) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());

        self.global_token.cancel();

        let mut first_error = None;
        for (name, mut handle) in self.tasks.drain() {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!("Task '{name}' failed during shutdown: {e}");
                    first_error.get_or_insert(e);
                }
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    let error = anyhow::anyhow!("Task '{name}' panicked: {e}");
                    error!("{error}");
                    first_error.get_or_insert(error);
                }
                Err(_) => {
                    warn!("Task '{name}' did not stop within {timeout:?}, aborting");
                    handle.abort();
                }
            }
        }

        match first_error {
            Some(error) => Err(error).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    /// Number of tasks that have not finished yet.
    pub fn active_count(&self) -> usize {
        self.tasks.values().filter(|h| !h.is_finished()).count()
    }

    /// Checks if a task with the given name is currently running.
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.get(name).is_some_and(|h| !h.is_finished())
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
