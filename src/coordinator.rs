//! System coordinator: service lifecycle state machine.
//!
//! Services are registered in run order while the coordinator is
//! `Constructing`. Once the application has wired every route and
//! subscription it marks the coordinator `Configured`, which unlocks
//! [`SystemCoordinator::start_all_services`]. A stop signal or an
//! [`Event::ShutdownRequested`] moves it to `ShuttingDown`; every service is
//! then stopped exactly once, in run order, before the task manager tears
//! down whatever is left.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{sleep, timeout},
};

use crate::{
    event::{Event, EventBus},
    providers::Service,
    task_manager::TaskManager,
};

/// Upper bound for a single service's `shutdown`.
pub const SERVICE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause after the last `shutdown` so in-flight cleanup can finish.
pub const GRACE_PERIOD: Duration = Duration::from_millis(100);
/// How long the task manager waits for each task before aborting it.
pub const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructing,
    Configured,
    Running,
    ShuttingDown,
    Stopped,
}

/// Owns the services and the run loop handle.
///
/// # Example
///
/// ```no_run
/// use neopixeld::coordinator::{SystemCoordinator, stop_signal};
/// use neopixeld::event::EventBus;
///
/// # async fn example() -> anyhow::Result<()> {
/// let mut coordinator = SystemCoordinator::new(EventBus::new());
/// // coordinator.register(Box::new(service))?;
/// coordinator.mark_configured()?;
/// coordinator.start_all_services().await?;
/// coordinator.run_until_stopped(stop_signal()).await?;
/// # Ok(())
/// # }
/// ```
pub struct SystemCoordinator {
    state: LifecycleState,
    task_manager: TaskManager,
    event_bus: EventBus,
    events: broadcast::Receiver<Event>,
    services: Vec<Box<dyn Service>>,
}

impl SystemCoordinator {
    pub fn new(event_bus: EventBus) -> Self {
        let events = event_bus.subscribe();
        Self {
            state: LifecycleState::Constructing,
            task_manager: TaskManager::new(),
            event_bus,
            events,
            services: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Names of the registered services, in run order.
    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Appends a service to the run order.
    pub fn register(&mut self, service: Box<dyn Service>) -> Result<()> {
        if self.state != LifecycleState::Constructing {
            bail!(
                "Cannot register service '{}' while {:?}",
                service.name(),
                self.state
            );
        }
        debug!("Registered service '{}'", service.name());
        self.services.push(service);
        Ok(())
    }

    /// Closes registration. Called once all routes and subscriptions exist.
    pub fn mark_configured(&mut self) -> Result<()> {
        if self.state != LifecycleState::Constructing {
            bail!("Cannot configure coordinator while {:?}", self.state);
        }
        self.state = LifecycleState::Configured;
        info!("Configured {} services", self.services.len());
        Ok(())
    }

    /// Runs every service in registration order.
    ///
    /// A critical service failing aborts startup after stopping everything
    /// that was registered; other failures are logged and skipped.
    pub async fn start_all_services(&mut self) -> Result<()> {
        if self.state != LifecycleState::Configured {
            bail!("Cannot start services while {:?}", self.state);
        }
        self.state = LifecycleState::Running;
        info!("Starting {} services...", self.services.len());

        let mut failure = None;
        for service in &self.services {
            match service.run(&mut self.task_manager).await {
                Ok(()) => info!(
                    "Service '{}' started (critical: {})",
                    service.name(),
                    service.is_critical()
                ),
                Err(e) if service.is_critical() => {
                    failure = Some(e.context(format!(
                        "Critical service '{}' failed to start",
                        service.name()
                    )));
                    break;
                }
                Err(e) => warn!("Non-critical service '{}' failed to start: {e:#}", service.name()),
            }
        }

        if let Some(e) = failure {
            error!("{e:#}");
            self.shutdown().await?;
            return Err(e);
        }

        info!("All services started");
        Ok(())
    }

    /// Drives the loop until `stop` resolves or a service requests shutdown,
    /// then shuts everything down.
    pub async fn run_until_stopped<F>(&mut self, stop: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        if self.state != LifecycleState::Running {
            bail!("Cannot run main loop while {:?}", self.state);
        }
        tokio::pin!(stop);
        info!("Main loop running");

        loop {
            tokio::select! {
                result = &mut stop => {
                    match result {
                        Ok(()) => info!("Stop signal received, shutting down..."),
                        Err(e) => error!("Stop signal failed, shutting down: {e:#}"),
                    }
                    break;
                }
                event = self.events.recv() => match event {
                    Ok(Event::ShutdownRequested) => {
                        info!("Shutdown requested by a service");
                        break;
                    }
                    Ok(event) => debug!("Event: {event:?}"),
                    Err(RecvError::Lagged(n)) => warn!("Event bus lagged by {n} messages"),
                    Err(RecvError::Closed) => bail!("Event bus closed unexpectedly"),
                },
            }
        }

        self.shutdown().await
    }

    /// Stops every registered service once, in run order.
    ///
    /// Each `shutdown` is bounded by [`SERVICE_SHUTDOWN_TIMEOUT`]. Errors,
    /// panics and timeouts are logged and never prevent the remaining ones.
    /// Calling this again after it started is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        if matches!(
            self.state,
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        ) {
            debug!("Shutdown already {:?}", self.state);
            return Ok(());
        }
        self.state = LifecycleState::ShuttingDown;
        info!("Initiating graceful shutdown...");

        for service in &self.services {
            let stopping = AssertUnwindSafe(service.shutdown()).catch_unwind();
            match timeout(SERVICE_SHUTDOWN_TIMEOUT, stopping).await {
                Ok(Ok(Ok(()))) => debug!("Service '{}' stopped", service.name()),
                Ok(Ok(Err(e))) => error!("Service '{}' failed to stop: {e:#}", service.name()),
                Ok(Err(_)) => error!("Service '{}' panicked while stopping", service.name()),
                Err(_) => warn!(
                    "Service '{}' did not stop within {:?}, abandoning it",
                    service.name(),
                    SERVICE_SHUTDOWN_TIMEOUT
                ),
            }
        }

        sleep(GRACE_PERIOD).await;

        if let Err(e) = self.task_manager.shutdown_all(TASK_STOP_TIMEOUT).await {
            error!("Error during task shutdown: {e:#}");
        }

        self.state = LifecycleState::Stopped;
        info!("Shutdown complete");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn stop_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C"),
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")
    }
}
