use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::{
    sync::watch,
    time::{Instant, interval, interval_at},
};
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigStore, drivers::AnalogInput, providers::mqtt::MqttHandle,
    providers::traits::Service, task_manager::TaskManager,
};

pub const TOPIC_AMBIENT: &str = "mqtt_topic_ambient";
pub const AMBIENT_POLL_MS: &str = "ambient_poll_ms";
pub const AMBIENT_THRESHOLD: &str = "ambient_threshold";

const MIN_POLL: Duration = Duration::from_millis(50);

/// Ambient light sensor poller.
///
/// Publishes the reading on `mqtt_topic_ambient` whenever it moved by at
/// least `ambient_threshold` since the last successful publish. A changed
/// `ambient_poll_ms` takes effect after the next tick.
pub struct AmbientSensor {
    input: Arc<dyn AnalogInput>,
    config: ConfigStore,
    mqtt: MqttHandle,
    reading: Arc<watch::Sender<Option<u16>>>,
    token: CancellationToken,
}

impl AmbientSensor {
    pub fn new(input: Arc<dyn AnalogInput>, config: ConfigStore, mqtt: MqttHandle) -> Result<Self> {
        config.add_param(TOPIC_AMBIENT, "neopixel/ambient")?;
        config.add_param(AMBIENT_POLL_MS, 5000)?;
        config.add_param(AMBIENT_THRESHOLD, 16)?;
        Ok(Self {
            input,
            config,
            mqtt,
            reading: Arc::new(watch::Sender::new(None)),
            token: CancellationToken::new(),
        })
    }

    /// Latest reading, if the sensor has been polled at least once.
    pub fn last_value(&self) -> Option<u16> {
        *self.reading.borrow()
    }

}

fn poll_period(config: &ConfigStore) -> Duration {
    let ms = config.get_int(AMBIENT_POLL_MS).unwrap_or(5000);
    Duration::from_millis(u64::try_from(ms).unwrap_or(0)).max(MIN_POLL)
}

/// Whether `value` differs enough from the last published one.
fn should_publish(last_published: Option<u16>, value: u16, threshold: u16) -> bool {
    last_published.is_none_or(|last| last.abs_diff(value) >= threshold)
}

#[async_trait]
impl Service for AmbientSensor {
    fn name(&self) -> &'static str {
        "AmbientSensor"
    }

    async fn run(&self, task_manager: &mut TaskManager) -> Result<()> {
        let input = self.input.clone();
        let config = self.config.clone();
        let mqtt = self.mqtt.clone();
        let reading = self.reading.clone();
        let token = self.token.clone();

        task_manager.spawn_task(self.name(), move |loop_token| async move {
            let mut period = poll_period(&config);
            let mut ticks = IntervalStream::new(interval(period));
            let mut last_published = None;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = loop_token.cancelled() => break,
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        let next = poll_period(&config);
                        if next != period {
                            debug!("Ambient poll period now {next:?}");
                            period = next;
                            ticks = IntervalStream::new(interval_at(Instant::now() + period, period));
                        }
                        let value = match input.read() {
                            Ok(value) => value,
                            Err(e) => {
                                warn!("Ambient sensor read failed: {e:#}");
                                continue;
                            }
                        };
                        reading.send_replace(Some(value));

                        let threshold = config
                            .get_int(AMBIENT_THRESHOLD)
                            .and_then(|t| u16::try_from(t).ok())
                            .unwrap_or(16);
                        if !should_publish(last_published, value, threshold) {
                            continue;
                        }
                        let topic = config.get_str(TOPIC_AMBIENT).unwrap_or_default();
                        match mqtt.publish(&topic, value.to_string()) {
                            Ok(()) => {
                                debug!("Ambient light {value} published");
                                last_published = Some(value);
                            }
                            Err(e) => debug!("Ambient light {value} not published: {e:#}"),
                        }
                    }
                }
            }
            info!("Ambient sensor stopped");
            Ok(())
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{drivers::FixedAnalogInput, event::EventBus, providers::mqtt::MqttClient};
    use pretty_assertions::assert_eq;

    fn sensor(input: FixedAnalogInput) -> (AmbientSensor, ConfigStore) {
        let config = ConfigStore::new();
        let mqtt = MqttClient::new("c", config.clone(), EventBus::new()).unwrap();
        let sensor = AmbientSensor::new(Arc::new(input), config.clone(), mqtt.handle()).unwrap();
        (sensor, config)
    }

    #[test]
    fn threshold_decides_publishing() {
        assert!(should_publish(None, 0, 16));
        assert!(!should_publish(Some(100), 115, 16));
        assert!(should_publish(Some(100), 116, 16));
        assert!(should_publish(Some(100), 84, 16));
    }

    #[test]
    fn poll_period_has_floor() {
        let (sensor, config) = sensor(FixedAnalogInput::new(0));
        assert_eq!(poll_period(&sensor.config), Duration::from_millis(5000));
        config.set(AMBIENT_POLL_MS, 0).unwrap();
        assert_eq!(poll_period(&config), MIN_POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_latest_reading() {
        let input = FixedAnalogInput::new(300);
        let (sensor, config) = sensor(input.clone());
        config.set(AMBIENT_POLL_MS, 100).unwrap();
        assert_eq!(sensor.last_value(), None);

        let mut task_manager = TaskManager::new();
        sensor.run(&mut task_manager).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sensor.last_value(), Some(300));

        input.set(512);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sensor.last_value(), Some(512));

        sensor.shutdown().await.unwrap();
        task_manager.shutdown_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn poll_period_change_applies_while_running() {
        let input = FixedAnalogInput::new(300);
        let (sensor, config) = sensor(input.clone());
        config.set(AMBIENT_POLL_MS, 100).unwrap();

        let mut task_manager = TaskManager::new();
        sensor.run(&mut task_manager).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        config.set(AMBIENT_POLL_MS, 1000).unwrap();

        // the tick at 100 ms picks up the new period
        tokio::time::sleep(Duration::from_millis(100)).await;
        input.set(512);
        tokio::time::sleep(Duration::from_millis(490)).await;
        assert_eq!(sensor.last_value(), Some(300));

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(sensor.last_value(), Some(512));

        sensor.shutdown().await.unwrap();
        task_manager.shutdown_all(Duration::from_secs(1)).await.unwrap();
    }
}
