//! Built-in South and North adapters and the factory registry keyed by connector type.

mod console;
mod file_writer;
mod folder_scanner;
mod mqtt;
mod mqtt_north;
mod mqtt_south;

pub use self::console::ConsoleNorth;
pub use self::file_writer::FileWriterNorth;
pub use self::folder_scanner::FolderScannerSouth;
pub use self::mqtt_north::MqttNorth;
pub use self::mqtt_south::MqttSouth;

use crate::checkpoint::CheckpointStore;
use crate::config::{NorthConnectorConfig, SouthConnectorConfig};
use crate::error::ConfigError;
use crate::north::NorthAdapter;
use crate::south::SouthAdapter;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a South adapter. The checkpoint store is handed over for adapters that keep
/// per-source state of their own (e.g. files already read).
pub type SouthFactory = Arc<
    dyn Fn(&SouthConnectorConfig, &Arc<CheckpointStore>) -> Result<Box<dyn SouthAdapter>, ConfigError>
        + Send
        + Sync,
>;
pub type NorthFactory =
    Arc<dyn Fn(&NorthConnectorConfig) -> Result<Box<dyn NorthAdapter>, ConfigError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    south: HashMap<String, SouthFactory>,
    north: HashMap<String, NorthFactory>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_south("folder-scanner", |config, checkpoints| {
            Ok(Box::new(FolderScannerSouth::from_config(config, checkpoints.clone())?) as Box<dyn SouthAdapter>)
        });
        registry.register_south("mqtt", |config, _| {
            Ok(Box::new(MqttSouth::from_config(config)?) as Box<dyn SouthAdapter>)
        });
        registry.register_north("console", |config| {
            Ok(Box::new(ConsoleNorth::new(&config.id)) as Box<dyn NorthAdapter>)
        });
        registry.register_north("file-writer", |config| {
            Ok(Box::new(FileWriterNorth::from_config(config)?) as Box<dyn NorthAdapter>)
        });
        registry.register_north("mqtt", |config| {
            Ok(Box::new(MqttNorth::from_config(config)?) as Box<dyn NorthAdapter>)
        });
        registry
    }

    pub fn register_south<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&SouthConnectorConfig, &Arc<CheckpointStore>) -> Result<Box<dyn SouthAdapter>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.south.insert(kind.into(), Arc::new(factory));
    }

    pub fn register_north<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&NorthConnectorConfig) -> Result<Box<dyn NorthAdapter>, ConfigError> + Send + Sync + 'static,
    {
        self.north.insert(kind.into(), Arc::new(factory));
    }

    pub fn has_south(&self, kind: &str) -> bool {
        self.south.contains_key(kind)
    }

    pub fn has_north(&self, kind: &str) -> bool {
        self.north.contains_key(kind)
    }

    pub fn build_south(
        &self,
        config: &SouthConnectorConfig,
        checkpoints: &Arc<CheckpointStore>,
    ) -> Result<Box<dyn SouthAdapter>, ConfigError> {
        let factory = self.south.get(&config.kind).ok_or_else(|| ConfigError::UnknownType {
            role: "south",
            kind: config.kind.clone(),
        })?;
        factory(config, checkpoints)
    }

    pub fn build_north(&self, config: &NorthConnectorConfig) -> Result<Box<dyn NorthAdapter>, ConfigError> {
        let factory = self.north.get(&config.kind).ok_or_else(|| ConfigError::UnknownType {
            role: "north",
            kind: config.kind.clone(),
        })?;
        factory(config)
    }
}

pub(crate) fn parse_settings<T: DeserializeOwned>(
    owner: &str,
    settings: &serde_json::Value,
) -> Result<T, ConfigError> {
    serde_json::from_value(settings.clone()).map_err(|err| ConfigError::InvalidSettings {
        owner: owner.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_every_shipped_type() {
        let registry = AdapterRegistry::builtin();
        for kind in ["folder-scanner", "mqtt"] {
            assert!(registry.has_south(kind), "{kind}");
        }
        for kind in ["console", "file-writer", "mqtt"] {
            assert!(registry.has_north(kind), "{kind}");
        }
        assert!(!registry.has_south("opcua"));
    }

    #[test]
    fn building_an_unknown_type_fails() {
        let registry = AdapterRegistry::empty();
        let config: NorthConnectorConfig = serde_json::from_value(serde_json::json!({
            "id": "n1",
            "type": "console",
            "caching": { "scanModeId": "every-second" }
        }))
        .unwrap();
        assert!(matches!(
            registry.build_north(&config),
            Err(ConfigError::UnknownType { role: "north", .. })
        ));
    }
}
