use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::info;
use serde_json::{Map, Value};

use crate::{
    ledstrip::{LedStrip, TOPIC_LED_CONTROL},
    providers::{
        mqtt::{MqttClient, Topic},
        traits::Service,
        web::{Resource, message_response},
    },
    task_manager::TaskManager,
};

/// Lifecycle wrapper around the shared [`LedStrip`].
pub struct LedStripService {
    strip: Arc<LedStrip>,
}

impl LedStripService {
    pub fn new(strip: Arc<LedStrip>) -> Self {
        Self { strip }
    }

    /// Routes the control topic to [`LedStrip::handle_control_message`].
    pub fn subscribe_control(&self, mqtt: &MqttClient) -> Result<()> {
        let strip = self.strip.clone();
        mqtt.subscribe(Topic::Param(TOPIC_LED_CONTROL), move |payload| {
            strip.handle_control_message(payload);
        })
    }
}

#[async_trait]
impl Service for LedStripService {
    fn name(&self) -> &'static str {
        "LedStrip"
    }

    async fn run(&self, task_manager: &mut TaskManager) -> Result<()> {
        self.strip.start(task_manager)?;
        info!("LED strip ready with {} pixels", self.strip.len());
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.strip.stop();
        Ok(())
    }
}

/// `/ledstrip`: GET returns the buffer as hex strings, POST applies commands.
#[async_trait]
impl Resource for LedStrip {
    async fn get(&self) -> Response {
        Json(self.pixels_hex().await).into_response()
    }

    async fn post(&self, body: Map<String, Value>) -> Response {
        match LedStrip::post(self, &body) {
            Ok(status) => Json(status).into_response(),
            Err(e) => message_response(StatusCode::BAD_REQUEST, e.to_string()),
        }
    }
}
