use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::{Instant, interval};
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigError, ConfigStore},
    drivers::DigitalInput,
    event::{Event, EventBus},
    providers::traits::Service,
    task_manager::TaskManager,
};

pub const SETUP_BUTTON_HOLD_MS: &str = "setup_button_hold_ms";

const POLL_PERIOD: Duration = Duration::from_millis(50);

/// Long press detector for the setup button (active low).
#[derive(Debug, Default)]
struct PressTracker {
    pressed_since: Option<Instant>,
    fired: bool,
}

impl PressTracker {
    /// Feeds one sample; returns `true` once per press held for `hold`.
    fn sample(&mut self, pressed: bool, now: Instant, hold: Duration) -> bool {
        if !pressed {
            *self = Self::default();
            return false;
        }
        let since = *self.pressed_since.get_or_insert(now);
        if !self.fired && now.duration_since(since) >= hold {
            self.fired = true;
            return true;
        }
        false
    }
}

/// Setup button poller.
///
/// Holding the button for `setup_button_hold_ms` clears the `configured`
/// flag, persists it and asks the daemon to stop so it restarts in setup
/// mode.
pub struct SetupButton {
    input: Arc<dyn DigitalInput>,
    config: ConfigStore,
    event_bus: EventBus,
    token: CancellationToken,
}

impl SetupButton {
    pub fn new(input: Arc<dyn DigitalInput>, config: ConfigStore, event_bus: EventBus) -> Result<Self> {
        config.add_param(SETUP_BUTTON_HOLD_MS, 3000)?;
        Ok(Self {
            input,
            config,
            event_bus,
            token: CancellationToken::new(),
        })
    }
}

fn enter_setup_mode(config: &ConfigStore, event_bus: &EventBus) {
    info!("Setup button held, returning to setup mode");
    if let Err(e) = config.set_configured(false) {
        warn!("Failed to clear configured flag: {e}");
    }
    match config.save() {
        Ok(()) => {}
        Err(ConfigError::NoPath) => debug!("No config file to update"),
        Err(e) => warn!("Failed to save configuration: {e}"),
    }
    event_bus.notify(Event::ShutdownRequested);
}

#[async_trait]
impl Service for SetupButton {
    fn name(&self) -> &'static str {
        "SetupButton"
    }

    async fn run(&self, task_manager: &mut TaskManager) -> Result<()> {
        let input = self.input.clone();
        let config = self.config.clone();
        let event_bus = self.event_bus.clone();
        let token = self.token.clone();

        task_manager.spawn_task(self.name(), move |loop_token| async move {
            let mut ticks = IntervalStream::new(interval(POLL_PERIOD));
            let mut tracker = PressTracker::default();
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = loop_token.cancelled() => break,
                    Some(now) = ticks.next() => {
                        let pressed = match input.is_high() {
                            Ok(high) => !high,
                            Err(e) => {
                                warn!("Setup button read failed: {e:#}");
                                continue;
                            }
                        };
                        let hold_ms = config.get_int(SETUP_BUTTON_HOLD_MS).unwrap_or(3000);
                        let hold = Duration::from_millis(u64::try_from(hold_ms).unwrap_or(0));
                        if tracker.sample(pressed, now, hold) {
                            enter_setup_mode(&config, &event_bus);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}
