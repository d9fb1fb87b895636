//! Configuration store for the neopixeld daemon.
//!
//! A dynamically extensible registry of named parameters. Components declare
//! the parameters they need with [`ConfigStore::add_param`] at construction
//! time; values are read and written through the shared store and persisted
//! as a flat YAML mapping.
//!
//! # Example
//!
//! ```yaml
//! configured: true
//! mqtt_host: broker.local
//! mqtt_port: 1883
//! mqtt_topic_led_control: neopixel/led/set
//! ```

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parameter name of the "device has been set up" flag.
pub const CONFIGURED: &str = "configured";

/// Dynamically typed parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ParamValue {
    fn kind(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Str(_) => "string",
        }
    }

    fn same_kind(&self, other: &ParamValue) -> bool {
        self.kind() == other.kind()
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Errors raised by the configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown config parameter '{0}'")]
    UnknownParam(String),

    #[error("Config parameter '{name}' expects a {expected} value")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("Config parameter '{name}' already declared with default '{existing}'")]
    ConflictingDefault { name: String, existing: ParamValue },

    #[error("Config store has no backing file")]
    NoPath,

    #[error("Config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone)]
struct Param {
    value: ParamValue,
    default: ParamValue,
}

/// Shared parameter registry.
///
/// Cloning is cheap; all clones see the same parameters. Every operation
/// completes synchronously, so no value is ever held across an await point.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    params: Arc<DashMap<String, Param>>,
    path: Option<PathBuf>,
    dirty: Arc<AtomicBool>,
}

impl ConfigStore {
    /// Creates an in-memory store without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store persisted to `path`. Nothing is read until [`load`](Self::load).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Declares a parameter with its default value.
    ///
    /// Declaring an existing name with the same default is a no-op and
    /// leaves the current value untouched.
    pub fn add_param(&self, name: &str, default: impl Into<ParamValue>) -> Result<(), ConfigError> {
        let default = default.into();
        match self.params.entry(name.to_string()) {
            Entry::Occupied(entry) if entry.get().default == default => Ok(()),
            Entry::Occupied(entry) => Err(ConfigError::ConflictingDefault {
                name: name.to_string(),
                existing: entry.get().default.clone(),
            }),
            Entry::Vacant(entry) => {
                debug!("Declared config parameter {name} = {default}");
                entry.insert(Param {
                    value: default.clone(),
                    default,
                });
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.params.get(name).map(|p| p.value.clone())
    }

    /// Updates a declared parameter. The value must have the default's type.
    pub fn set(&self, name: &str, value: impl Into<ParamValue>) -> Result<(), ConfigError> {
        let value = value.into();
        let mut param = self
            .params
            .get_mut(name)
            .ok_or_else(|| ConfigError::UnknownParam(name.to_string()))?;

        if !param.default.same_kind(&value) {
            return Err(ConfigError::TypeMismatch {
                name: name.to_string(),
                expected: param.default.kind(),
            });
        }

        if param.value != value {
            param.value = value;
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParamValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ParamValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Whether initial device setup has been completed.
    pub fn configured(&self) -> bool {
        self.get_bool(CONFIGURED).unwrap_or(false)
    }

    pub fn set_configured(&self, configured: bool) -> Result<(), ConfigError> {
        self.set(CONFIGURED, configured)
    }

    /// Sorted copy of every parameter's current value.
    pub fn snapshot(&self) -> BTreeMap<String, ParamValue> {
        self.params
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Applies a batch of updates atomically with respect to validation:
    /// either every entry is valid and applied, or nothing changes.
    pub fn update<I>(&self, values: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, ParamValue)>,
    {
        let values: Vec<_> = values.into_iter().collect();
        for (name, value) in &values {
            let param = self
                .params
                .get(name)
                .ok_or_else(|| ConfigError::UnknownParam(name.clone()))?;
            if !param.default.same_kind(value) {
                return Err(ConfigError::TypeMismatch {
                    name: name.clone(),
                    expected: param.default.kind(),
                });
            }
        }
        values
            .into_iter()
            .try_for_each(|(name, value)| self.set(&name, value))
    }

    /// Restores every parameter to its declared default.
    pub fn reset(&self) {
        for mut entry in self.params.iter_mut() {
            let param = entry.value_mut();
            param.value = param.default.clone();
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether values changed since the last load or save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Loads persisted values for declared parameters.
    ///
    /// Unknown names are ignored and values of the wrong type are skipped,
    /// so a stale file never prevents the device from booting.
    pub fn load(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoPath)?;
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let stored: BTreeMap<String, ParamValue> =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
                path: path.clone(),
                source,
            })?;

        let mut applied = 0;
        for (name, value) in stored {
            match self.params.get_mut(&name) {
                Some(mut param) if param.default.same_kind(&value) => {
                    param.value = value;
                    applied += 1;
                }
                Some(param) => warn!(
                    "Ignoring stored {name}: expected a {} value",
                    param.default.kind()
                ),
                None => debug!("Ignoring unknown stored parameter {name}"),
            }
        }

        self.dirty.store(false, Ordering::Release);
        info!("Loaded {applied} config parameters from {}", path.display());
        Ok(())
    }

    /// Writes all current values to the backing file.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoPath)?;
        let yaml = serde_yaml::to_string(&self.snapshot()).map_err(|source| ConfigError::Yaml {
            path: path.clone(),
            source,
        })?;

        let io_err = |source| ConfigError::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let tmp_path = path.with_extension("yml.tmp");
        fs::write(&tmp_path, yaml).map_err(io_err)?;
        fs::rename(&tmp_path, path).map_err(io_err)?;

        self.dirty.store(false, Ordering::Release);
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn add_param_sets_default() {
        let store = ConfigStore::new();
        store.add_param("configured", false).unwrap();
        store.add_param("mqtt_port", 1883).unwrap();
        store.add_param("topic", "neopixel/led").unwrap();

        assert_eq!(store.get_bool("configured"), Some(false));
        assert_eq!(store.get_int("mqtt_port"), Some(1883));
        assert_eq!(store.get_str("topic").as_deref(), Some("neopixel/led"));
    }

    #[test]
    fn redeclaring_same_default_keeps_current_value() {
        let store = ConfigStore::new();
        store.add_param("topic", "a").unwrap();
        store.set("topic", "b").unwrap();

        store.add_param("topic", "a").unwrap();
        assert_eq!(store.get_str("topic").as_deref(), Some("b"));
    }

    #[test]
    fn redeclaring_different_default_fails() {
        let store = ConfigStore::new();
        store.add_param("topic", "a").unwrap();
        let err = store.add_param("topic", "c").unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingDefault { .. }));
        assert_eq!(store.get_str("topic").as_deref(), Some("a"));
    }

    #[test]
    fn set_rejects_unknown_and_mistyped() {
        let store = ConfigStore::new();
        store.add_param("configured", false).unwrap();

        assert!(matches!(
            store.set("missing", true),
            Err(ConfigError::UnknownParam(_))
        ));
        assert!(matches!(
            store.set("configured", "yes"),
            Err(ConfigError::TypeMismatch { expected: "bool", .. })
        ));
        assert!(!store.is_dirty());
    }

    #[test]
    fn clones_share_state() {
        let store = ConfigStore::new();
        store.add_param(CONFIGURED, false).unwrap();
        let other = store.clone();
        other.set_configured(true).unwrap();
        assert!(store.configured());
        assert!(store.is_dirty());
    }

    #[test]
    fn update_is_all_or_nothing() {
        let store = ConfigStore::new();
        store.add_param("a", 1).unwrap();
        store.add_param("b", "x").unwrap();

        let result = store.update([
            ("a".to_string(), ParamValue::Int(2)),
            ("b".to_string(), ParamValue::Int(3)),
        ]);
        assert!(result.is_err());
        assert_eq!(store.get_int("a"), Some(1));

        store
            .update([
                ("a".to_string(), ParamValue::Int(2)),
                ("b".to_string(), ParamValue::from("y")),
            ])
            .unwrap();
        assert_eq!(store.get_int("a"), Some(2));
        assert_eq!(store.get_str("b").as_deref(), Some("y"));
    }

    #[test]
    fn reset_restores_defaults() {
        let store = ConfigStore::new();
        store.add_param("a", 1).unwrap();
        store.set("a", 5).unwrap();
        store.reset();
        assert_eq!(store.get_int("a"), Some(1));
    }

    #[test]
    fn load_applies_known_params_only() {
        let file = create_temp_config(
            "configured: true\nmqtt_port: 8883\nunknown: 1\nmqtt_host: 12\n",
        );
        let store = ConfigStore::with_path(file.path());
        store.add_param("configured", false).unwrap();
        store.add_param("mqtt_port", 1883).unwrap();
        store.add_param("mqtt_host", "").unwrap();

        store.load().unwrap();

        assert!(store.configured());
        assert_eq!(store.get_int("mqtt_port"), Some(8883));
        assert_eq!(store.get_str("mqtt_host").as_deref(), Some(""));
        assert!(!store.contains("unknown"));
        assert!(!store.is_dirty());
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::with_path(dir.path().join("absent.yml"));
        assert!(matches!(store.load(), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn load_invalid_yaml_fails() {
        let file = create_temp_config("configured: [unterminated");
        let store = ConfigStore::with_path(file.path());
        assert!(matches!(store.load(), Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn load_without_path_fails() {
        assert!(matches!(ConfigStore::new().load(), Err(ConfigError::NoPath)));
    }

    #[test]
    fn save_then_load_restores_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.yml");

        let store = ConfigStore::with_path(&path);
        store.add_param("configured", false).unwrap();
        store.add_param("topic", "neopixel/led").unwrap();
        store.set_configured(true).unwrap();
        store.set("topic", "custom/led").unwrap();
        store.save().unwrap();
        assert!(!store.is_dirty());

        let reloaded = ConfigStore::with_path(&path);
        reloaded.add_param("configured", false).unwrap();
        reloaded.add_param("topic", "neopixel/led").unwrap();
        reloaded.load().unwrap();

        assert_eq!(reloaded.snapshot(), store.snapshot());
    }
}
