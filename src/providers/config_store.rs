use anyhow::Result;
use async_trait::async_trait;
use axum::{Json, http::StatusCode, response::{IntoResponse, Response}};
use log::{info, warn};
use serde_json::{Map, Value};

use crate::{
    config::{ConfigError, ConfigStore, ParamValue},
    providers::{
        mqtt::MQTT_PASSWORD,
        traits::Service,
        web::{Resource, message_response},
    },
    task_manager::TaskManager,
};

/// Parameters never echoed back over HTTP.
const SECRET_PARAMS: &[&str] = &[MQTT_PASSWORD];

/// Stand-in for a set secret in `GET /config`.
const SECRET_MASK: &str = "********";

/// Persists the parameter store when the daemon stops.
pub struct ConfigStoreService {
    config: ConfigStore,
}

impl ConfigStoreService {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Service for ConfigStoreService {
    fn name(&self) -> &'static str {
        "ConfigStore"
    }

    async fn run(&self, _task_manager: &mut TaskManager) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.config.is_dirty() && self.config.path().is_some() {
            self.config.save()?;
            info!("Unsaved configuration written on shutdown");
        }
        Ok(())
    }
}

/// `/config`: read all parameters, update a subset.
///
/// Secrets read back as [`SECRET_MASK`]; posting the mask unchanged keeps the
/// stored value.
#[async_trait]
impl Resource for ConfigStore {
    async fn get(&self) -> Response {
        let mut params = self.snapshot();
        for name in SECRET_PARAMS {
            if let Some(ParamValue::Str(secret)) = params.get_mut(*name) {
                if !secret.is_empty() {
                    *secret = SECRET_MASK.to_string();
                }
            }
        }
        Json(params).into_response()
    }

    async fn post(&self, body: Map<String, Value>) -> Response {
        update_and_save(self, body)
    }

    async fn put(&self, body: Map<String, Value>) -> Response {
        update_and_save(self, body)
    }
}

fn update_and_save(config: &ConfigStore, body: Map<String, Value>) -> Response {
    let values = body
        .into_iter()
        .filter(|(name, value)| !(SECRET_PARAMS.contains(&name.as_str()) && value == SECRET_MASK))
        .map(|(name, value)| match serde_json::from_value::<ParamValue>(value) {
            Ok(value) => Ok((name, value)),
            Err(_) => Err(format!("Unsupported value for '{name}'")),
        })
        .collect::<Result<Vec<_>, String>>();

    let values = match values {
        Ok(values) => values,
        Err(message) => return message_response(StatusCode::BAD_REQUEST, message),
    };

    if let Err(e) = config.update(values) {
        return message_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    match config.save() {
        Ok(()) | Err(ConfigError::NoPath) => message_response(StatusCode::OK, "config updated"),
        Err(e) => {
            warn!("Failed to save configuration: {e}");
            message_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
