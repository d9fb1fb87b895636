//! Application entry point and builder pattern implementation.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use crate::{
    config::{CONFIGURED, ConfigStore},
    coordinator::{SystemCoordinator, stop_signal},
    device,
    drivers::{
        AnalogInput, DigitalInput, DigitalOutput, FixedAnalogInput, LogDigitalOutput,
        LogPixelWriter, PixelWriter, SharedLevel,
    },
    event::EventBus,
    ledstrip::LedStrip,
    providers::{
        AmbientSensor, ConfigStoreService, DnsServer, LedStripService, MqttClient, SetupButton,
        StatusLed, WebServer,
        web::{DASHBOARD_PAGE, SETUP_PAGE, gzip_page_route, index_route},
    },
};

/// Runtime settings, usually derived from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Backing file of the parameter store; `None` keeps it in memory.
    pub config_path: Option<PathBuf>,
    pub http_addr: SocketAddr,
    pub dns_addr: SocketAddr,
    pub ap_address: Ipv4Addr,
    pub pixels: usize,
    pub static_dir: PathBuf,
    pub device_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: None,
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            dns_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 5335)),
            ap_address: Ipv4Addr::new(192, 168, 168, 1),
            pixels: 60,
            static_dir: PathBuf::from("./www"),
            device_id: None,
        }
    }
}

/// Main application structure that orchestrates all daemon components.
///
/// # Example
///
/// ```no_run
/// use neopixeld::application::{Application, Settings};
///
/// # async fn example() -> anyhow::Result<()> {
/// let mut app = Application::builder()
///     .with_settings(Settings::default())
///     .build()?;
///
/// app.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    pub coordinator: SystemCoordinator,
    config: ConfigStore,
    led_strip: Arc<LedStrip>,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn led_strip(&self) -> &Arc<LedStrip> {
        &self.led_strip
    }

    /// Runs until Ctrl+C, SIGTERM or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(stop_signal()).await
    }

    /// Starts all services and runs until `stop` resolves.
    pub async fn run_until<F>(&mut self, stop: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        self.coordinator.start_all_services().await?;
        self.coordinator.run_until_stopped(stop).await
    }
}

/// Builder pattern for creating Application instances.
///
/// Hardware seams default to the host backends: a logging pixel writer, a
/// dark ambient sensor, a released setup button and a logging status LED.
pub struct ApplicationBuilder {
    settings: Settings,
    pixel_writer: Option<Box<dyn PixelWriter>>,
    ambient_input: Option<Arc<dyn AnalogInput>>,
    setup_button: Option<Arc<dyn DigitalInput>>,
    status_led: Option<Arc<dyn DigitalOutput>>,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            settings: Settings::default(),
            pixel_writer: None,
            ambient_input: None,
            setup_button: None,
            status_led: None,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_pixel_writer(mut self, writer: Box<dyn PixelWriter>) -> Self {
        self.pixel_writer = Some(writer);
        self
    }

    pub fn with_ambient_input(mut self, input: Arc<dyn AnalogInput>) -> Self {
        self.ambient_input = Some(input);
        self
    }

    pub fn with_setup_button(mut self, input: Arc<dyn DigitalInput>) -> Self {
        self.setup_button = Some(input);
        self
    }

    pub fn with_status_led(mut self, output: Arc<dyn DigitalOutput>) -> Self {
        self.status_led = Some(output);
        self
    }

    /// Constructs and wires every service, then loads the stored config.
    ///
    /// The coordinator is left `Configured`; nothing runs yet.
    pub fn build(self) -> Result<Application> {
        let settings = self.settings;
        let config = match &settings.config_path {
            Some(path) => ConfigStore::with_path(path),
            None => ConfigStore::new(),
        };
        config.add_param(CONFIGURED, false)?;

        let event_bus = EventBus::new();
        let mut coordinator = SystemCoordinator::new(event_bus.clone());

        let client_id = device::client_id(&device::mac_suffix(settings.device_id.as_deref()));
        let mqtt = MqttClient::new(client_id, config.clone(), event_bus.clone())?;
        let dns = DnsServer::new(settings.dns_addr, settings.ap_address);
        let web = WebServer::new(settings.http_addr);

        let writer = self
            .pixel_writer
            .unwrap_or_else(|| Box::new(LogPixelWriter::default()));
        let led_strip = Arc::new(
            LedStrip::new(settings.pixels, writer, config.clone(), event_bus.clone())?
                .with_mqtt(mqtt.handle()),
        );
        let led_strip_service = LedStripService::new(led_strip.clone());
        led_strip_service.subscribe_control(&mqtt)?;

        let ambient = AmbientSensor::new(
            self.ambient_input
                .unwrap_or_else(|| Arc::new(FixedAnalogInput::new(0))),
            config.clone(),
            mqtt.handle(),
        )?;
        let setup_button = SetupButton::new(
            self.setup_button
                .unwrap_or_else(|| Arc::new(SharedLevel::new(true))),
            config.clone(),
            event_bus.clone(),
        )?;
        let status_led = StatusLed::new(
            self.status_led
                .unwrap_or_else(|| Arc::new(LogDigitalOutput::new("status_led"))),
            config.clone(),
            mqtt.handle(),
            event_bus,
        );

        web.add_resource("/config", Arc::new(config.clone()))?;
        web.add_resource("/ledstrip", led_strip.clone())?;
        web.add_route("/", index_route(config.clone()))?;
        web.add_route(
            "/dashboard",
            gzip_page_route(settings.static_dir.join(DASHBOARD_PAGE)),
        )?;
        web.add_route("/setup", gzip_page_route(settings.static_dir.join(SETUP_PAGE)))?;

        coordinator.register(Box::new(dns))?;
        coordinator.register(Box::new(web))?;
        coordinator.register(Box::new(mqtt))?;
        coordinator.register(Box::new(ambient))?;
        coordinator.register(Box::new(setup_button))?;
        coordinator.register(Box::new(status_led))?;
        coordinator.register(Box::new(led_strip_service))?;
        coordinator.register(Box::new(ConfigStoreService::new(config.clone())))?;
        coordinator.mark_configured()?;

        if config.path().is_some() {
            match config.load() {
                Ok(()) => info!("Configuration loaded"),
                Err(e) => warn!("Config load failed: {e}"),
            }
        }

        Ok(Application {
            coordinator,
            config,
            led_strip,
        })
    }
}
