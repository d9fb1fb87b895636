use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    sync::broadcast::error::RecvError,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigStore,
    drivers::DigitalOutput,
    event::{Event, EventBus},
    providers::{mqtt::MqttHandle, traits::Service},
    task_manager::TaskManager,
};

const FAST_BLINK: Duration = Duration::from_millis(200);
const SLOW_BLINK: Duration = Duration::from_millis(1000);
const SOLID_RECHECK: Duration = Duration::from_millis(1000);

/// What the status LED shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Toggle every given period.
    Blink(Duration),
    Solid,
}

impl Pattern {
    /// Fast blink in setup mode, slow blink without broker, solid when online.
    pub fn for_state(configured: bool, mqtt_connected: bool) -> Self {
        match (configured, mqtt_connected) {
            (false, _) => Pattern::Blink(FAST_BLINK),
            (true, false) => Pattern::Blink(SLOW_BLINK),
            (true, true) => Pattern::Solid,
        }
    }
}

/// Status LED driver.
pub struct StatusLed {
    output: Arc<dyn DigitalOutput>,
    config: ConfigStore,
    mqtt: MqttHandle,
    event_bus: EventBus,
    token: CancellationToken,
}

impl StatusLed {
    pub fn new(
        output: Arc<dyn DigitalOutput>,
        config: ConfigStore,
        mqtt: MqttHandle,
        event_bus: EventBus,
    ) -> Self {
        Self {
            output,
            config,
            mqtt,
            event_bus,
            token: CancellationToken::new(),
        }
    }

    pub fn pattern(&self) -> Pattern {
        Pattern::for_state(self.config.configured(), self.mqtt.is_connected())
    }
}

#[async_trait]
impl Service for StatusLed {
    fn name(&self) -> &'static str {
        "StatusLed"
    }

    async fn run(&self, task_manager: &mut TaskManager) -> Result<()> {
        let output = self.output.clone();
        let config = self.config.clone();
        let mqtt = self.mqtt.clone();
        let mut events = self.event_bus.subscribe();
        let token = self.token.clone();

        task_manager.spawn_task(self.name(), move |loop_token| async move {
            let mut lit = false;
            let mut shown = None;
            let mut deadline = Instant::now();
            let mut bus_open = true;
            loop {
                let now = Instant::now();
                let pattern = Pattern::for_state(config.configured(), mqtt.is_connected());
                if shown != Some(pattern) {
                    shown = Some(pattern);
                    deadline = now;
                }
                match pattern {
                    Pattern::Solid => {
                        lit = true;
                        deadline = now + SOLID_RECHECK;
                    }
                    Pattern::Blink(period) if now >= deadline => {
                        lit = !lit;
                        deadline = now + period;
                    }
                    Pattern::Blink(_) => {}
                }
                if let Err(e) = output.set(lit) {
                    warn!("Status LED write failed: {e:#}");
                }

                // link state events only wake the loop early
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = loop_token.cancelled() => break,
                    event = events.recv(), if bus_open => match event {
                        Ok(Event::MqttConnected(up)) => debug!("Status LED: MQTT link {}", if up { "up" } else { "down" }),
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => bus_open = false,
                    },
                    () = sleep_until(deadline) => {}
                }
            }
            output.set(false)
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        self.output.set(false)
    }
}
