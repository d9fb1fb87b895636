use anyhow::Result;
use async_trait::async_trait;

use crate::task_manager::TaskManager;

/// Lifecycle contract of every long-lived component.
///
/// `run` registers the service's cooperative work with the shared
/// [`TaskManager`] and returns without blocking. `shutdown` stops that work
/// and releases resources. The coordinator calls each exactly once.
///
/// # Example
///
/// ```no_run
/// use neopixeld::providers::Service;
/// use neopixeld::task_manager::TaskManager;
/// use anyhow::Result;
/// use tokio_util::sync::CancellationToken;
///
/// struct Heartbeat {
///     token: CancellationToken,
/// }
///
/// #[async_trait::async_trait]
/// impl Service for Heartbeat {
///     fn name(&self) -> &'static str { "Heartbeat" }
///
///     async fn run(&self, task_manager: &mut TaskManager) -> Result<()> {
///         let token = self.token.clone();
///         task_manager.spawn_task(self.name(), move |_| async move {
///             token.cancelled().await;
///             Ok(())
///         })
///     }
///
///     async fn shutdown(&self) -> Result<()> {
///         self.token.cancel();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Service: Send + Sync {
    /// Returns service name for logging and management.
    fn name(&self) -> &'static str;

    /// Indicates if the daemon cannot operate without this service.
    fn is_critical(&self) -> bool {
        false
    }

    /// Starts the service on the run loop.
    async fn run(&self, task_manager: &mut TaskManager) -> Result<()>;

    /// Stops the service.
    async fn shutdown(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct MockSuccessfulService {
        token: CancellationToken,
        task_spawned: Arc<AtomicBool>,
    }

    impl MockSuccessfulService {
        fn new() -> Self {
            Self {
                token: CancellationToken::new(),
                task_spawned: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Service for MockSuccessfulService {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn run(&self, task_manager: &mut TaskManager) -> Result<()> {
            let spawned = self.task_spawned.clone();
            let token = self.token.clone();
            task_manager.spawn_task("mock_task", move |loop_token| async move {
                spawned.store(true, Ordering::SeqCst);
                tokio::select! {
                    () = token.cancelled() => {}
                    () = loop_token.cancelled() => {}
                }
                Ok(())
            })
        }

        async fn shutdown(&self) -> Result<()> {
            self.token.cancel();
            Ok(())
        }
    }

    struct MockFailingService;

    #[async_trait]
    impl Service for MockFailingService {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn run(&self, _task_manager: &mut TaskManager) -> Result<()> {
            Err(anyhow!("failing: bind refused"))
        }

        async fn shutdown(&self) -> Result<()> {
            Err(anyhow!("failing: nothing to stop"))
        }
    }

    #[tokio::test]
    async fn service_run_spawns_task_and_shutdown_stops_it() {
        let mut task_manager = TaskManager::new();
        let service = MockSuccessfulService::new();

        service.run(&mut task_manager).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(service.task_spawned.load(Ordering::SeqCst));
        assert!(task_manager.is_running("mock_task"));

        service.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task_manager.is_running("mock_task"));
    }

    #[tokio::test]
    async fn service_default_criticality() {
        assert!(!MockSuccessfulService::new().is_critical());
    }

    #[tokio::test]
    async fn service_trait_object_reports_errors() {
        let mut task_manager = TaskManager::new();
        let services: Vec<Box<dyn Service>> =
            vec![Box::new(MockSuccessfulService::new()), Box::new(MockFailingService)];

        let mut results = vec![];
        for service in &services {
            results.push(service.run(&mut task_manager).await);
        }
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().to_string().contains("bind refused"));
        assert!(services[1].shutdown().await.is_err());

        task_manager.shutdown_all(Duration::from_secs(1)).await.unwrap();
    }
}
