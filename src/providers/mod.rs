//! Long-lived services run by the coordinator.
//!
//! Each service implements [`Service`]: it is constructed with the shared
//! dependencies it needs (config store, event bus, MQTT handle, hardware
//! seams), registers its cooperative work with the [`TaskManager`] on `run`
//! and stops it on `shutdown`.
//!
//! [`TaskManager`]: crate::task_manager::TaskManager

pub mod ambient;
pub mod config_store;
pub mod dns;
pub mod led_strip;
pub mod mqtt;
pub mod setup_button;
pub mod status_led;
pub mod traits;
pub mod web;

pub use ambient::AmbientSensor;
pub use config_store::ConfigStoreService;
pub use dns::DnsServer;
pub use led_strip::LedStripService;
pub use mqtt::{MqttClient, MqttHandle};
pub use setup_button::SetupButton;
pub use status_led::StatusLed;
pub use traits::Service;
pub use web::{Resource, WebServer};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::{
        config::ConfigStore,
        drivers::{FixedAnalogInput, RecordingPixelWriter, SharedLevel},
        event::EventBus,
        ledstrip::LedStrip,
    };
    use std::sync::Arc;

    fn all_services() -> Vec<Box<dyn Service>> {
        let config = ConfigStore::new();
        let event_bus = EventBus::new();
        let mqtt = MqttClient::new("neopixelcontroller-test", config.clone(), event_bus.clone()).unwrap();
        let handle = mqtt.handle();
        let strip = LedStrip::new(4, Box::new(RecordingPixelWriter::new()), config.clone(), event_bus.clone()).unwrap();

        vec![
            Box::new(DnsServer::new(([127, 0, 0, 1], 0).into(), [192, 168, 168, 1].into())),
            Box::new(WebServer::new(([127, 0, 0, 1], 0).into())),
            Box::new(AmbientSensor::new(Arc::new(FixedAnalogInput::new(0)), config.clone(), handle.clone()).unwrap()),
            Box::new(SetupButton::new(Arc::new(SharedLevel::new(true)), config.clone(), event_bus.clone()).unwrap()),
            Box::new(StatusLed::new(Arc::new(SharedLevel::new(false)), config.clone(), handle, event_bus)),
            Box::new(mqtt),
            Box::new(LedStripService::new(Arc::new(strip))),
            Box::new(ConfigStoreService::new(config)),
        ]
    }

    #[test]
    fn service_names_are_unique() {
        let services = all_services();
        let mut names: Vec<_> = services.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), services.len());
    }

    #[test]
    fn only_web_server_is_critical() {
        let critical: Vec<_> = all_services()
            .iter()
            .filter(|s| s.is_critical())
            .map(|s| s.name())
            .collect();
        assert_eq!(critical, vec!["WebServer"]);
    }

    #[test]
    fn shared_config_collects_every_declared_param() {
        let config = ConfigStore::new();
        let event_bus = EventBus::new();
        let mqtt = MqttClient::new("c", config.clone(), event_bus.clone()).unwrap();
        LedStrip::new(1, Box::new(RecordingPixelWriter::new()), config.clone(), event_bus.clone()).unwrap();
        AmbientSensor::new(Arc::new(FixedAnalogInput::new(0)), config.clone(), mqtt.handle()).unwrap();
        SetupButton::new(Arc::new(SharedLevel::new(true)), config.clone(), event_bus).unwrap();

        for name in [
            "mqtt_host",
            "mqtt_port",
            "mqtt_topic_led_status",
            "mqtt_topic_led_control",
            "mqtt_topic_ambient",
            "ambient_poll_ms",
            "ambient_threshold",
            "setup_button_hold_ms",
        ] {
            assert!(config.contains(name), "{name} not declared");
        }
    }
}
