//! # neopixeld
//!
//! Control core of a networked addressable LED strip controller.
//!
//! ## Features
//!
//! - **Single-threaded cooperative loop**: every service runs on one tokio
//!   current-thread runtime
//! - **Deterministic lifecycle**: services start in a fixed order and are
//!   each shut down exactly once
//! - **Pixel command language**: `"all"`, `"5"` and `"1-10"` address specs
//!   mapped to hex colors, applied as fades
//! - **HTTP API**: `/ledstrip`, `/config` and the captive-portal pages
//! - **MQTT**: remote control topic, LED status and ambient light publishing
//! - **Captive-portal DNS**: every lookup resolves to the access point
//!
//! ## Architecture
//!
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) - lifecycle state machine
//! - [`TaskManager`](task_manager::TaskManager) - explicit run loop handle
//! - [`EventBus`](event::EventBus) - inter-service communication
//! - [`ConfigStore`](config::ConfigStore) - shared parameter registry
//! - [`Service`](providers::Service) implementations under [`providers`]
//!
//! ## Example
//!
//! ```no_run
//! use neopixeld::application::{Application, Settings};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     Application::builder()
//!         .with_settings(Settings::default())
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod application;
pub mod cli;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod drivers;
pub mod event;
pub mod fade;
pub mod ledstrip;
pub mod providers;
pub mod task_manager;
