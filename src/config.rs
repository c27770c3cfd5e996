use crate::adapters::AdapterRegistry;
use crate::error::ConfigError;
use crate::model::ContentType;
use crate::scan_mode::CronSchedule;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-level settings, read from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub config_file: PathBuf,
    pub http_bind: String,
    pub max_concurrent_acquisitions: usize,
    pub shutdown_grace: Duration,
    pub sweep_interval: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let data_dir = PathBuf::from(env_string("OIBUS_DATA_DIR", Some("./oibus-data".to_string()))?);
        let config_file = env_optional("OIBUS_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("engine.json"));
        let http_bind = env_string("OIBUS_HTTP_BIND", Some("127.0.0.1:2223".to_string()))?;
        let max_concurrent_acquisitions =
            env_u64("OIBUS_MAX_CONCURRENT_ACQUISITIONS", Some(8))?.max(1) as usize;
        let shutdown_grace =
            Duration::from_millis(env_u64("OIBUS_SHUTDOWN_GRACE_MS", Some(10_000))?);
        let sweep_interval =
            Duration::from_secs(env_u64("OIBUS_SWEEP_INTERVAL_SECONDS", Some(3600))?.max(1));

        Ok(Self {
            data_dir,
            config_file,
            http_bind,
            max_concurrent_acquisitions,
            shutdown_grace,
            sweep_interval,
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn checkpoint_db_path(&self) -> PathBuf {
        self.data_dir.join("checkpoints.db")
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanModeConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub cron_expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySettings {
    /// Seconds; 0 reads the whole window at once.
    #[serde(default)]
    pub max_read_interval: u64,
    /// Milliseconds between two sub-interval reads.
    #[serde(default)]
    pub read_delay: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SouthItemConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub south_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub scan_mode_id: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SouthConnectorConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub items: Vec<SouthItemConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStoreSettings {
    /// Hours; 0 keeps errored content until an operator acts on it.
    #[serde(default)]
    pub retention_hours: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachingSettings {
    pub scan_mode_id: String,
    #[serde(default = "default_group_count")]
    pub group_count: usize,
    #[serde(default = "default_max_send_count")]
    pub max_send_count: usize,
    /// Milliseconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Megabytes of pending content; 0 is unlimited.
    #[serde(default)]
    pub max_size_mb: u64,
    /// Upper bound on the payload of one batch; 0 is unlimited.
    #[serde(default)]
    pub max_batch_bytes: u64,
    #[serde(default)]
    pub error: ErrorStoreSettings,
}

fn default_group_count() -> usize {
    1000
}

fn default_max_send_count() -> usize {
    10_000
}

fn default_retry_interval() -> u64 {
    5_000
}

fn default_retry_count() -> u32 {
    3
}

fn default_timeout() -> u64 {
    30_000
}

impl CachingSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.max(1))
    }

    pub fn max_size_bytes(&self) -> Option<u64> {
        (self.max_size_mb > 0).then(|| self.max_size_mb.saturating_mul(1024 * 1024))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Hours.
    #[serde(default = "default_archive_retention")]
    pub retention_duration: u64,
}

fn default_archive_retention() -> u64 {
    72
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_duration: default_archive_retention(),
        }
    }
}

/// Explicit transformation applied when content of `input_type` is cached for a North.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerBinding {
    pub input_type: ContentType,
    pub output_type: ContentType,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NorthConnectorConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: serde_json::Value,
    pub caching: CachingSettings,
    #[serde(default)]
    pub archive: ArchiveSettings,
    #[serde(default)]
    pub transformers: Vec<TransformerBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub north_id: String,
    pub south_id: String,
}

/// Status codes a North type treats as transient when a send is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default)]
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

/// Connector topology document (`engine.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineTopology {
    #[serde(default)]
    pub scan_modes: Vec<ScanModeConfig>,
    #[serde(default)]
    pub south: Vec<SouthConnectorConfig>,
    #[serde(default)]
    pub north: Vec<NorthConnectorConfig>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub retry_policies: HashMap<String, RetryPolicy>,
}

impl EngineTopology {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "engine config not found; starting with no connectors");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut topology: EngineTopology = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        topology.normalize();
        Ok(topology)
    }

    /// Fills in back-references the document leaves implicit.
    pub fn normalize(&mut self) {
        for south in &mut self.south {
            if south.name.is_empty() {
                south.name = south.id.clone();
            }
            for item in &mut south.items {
                item.south_id = south.id.clone();
                if item.name.is_empty() {
                    item.name = item.id.clone();
                }
            }
        }
        for north in &mut self.north {
            if north.name.is_empty() {
                north.name = north.id.clone();
            }
        }
    }

    pub fn validate(&self, adapters: &AdapterRegistry) -> Result<(), ConfigError> {
        let mut scan_modes = HashSet::new();
        for mode in &self.scan_modes {
            if !scan_modes.insert(mode.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    kind: "scan mode",
                    id: mode.id.clone(),
                });
            }
            CronSchedule::parse(&mode.id, &mode.cron_expression)?;
        }

        let mut souths = HashSet::new();
        for south in &self.south {
            if !souths.insert(south.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    kind: "south",
                    id: south.id.clone(),
                });
            }
            if !adapters.has_south(&south.kind) {
                return Err(ConfigError::UnknownType {
                    role: "south",
                    kind: south.kind.clone(),
                });
            }
            let mut items = HashSet::new();
            for item in &south.items {
                if !items.insert(item.id.as_str()) {
                    return Err(ConfigError::DuplicateId {
                        kind: "south item",
                        id: format!("{}/{}", south.id, item.id),
                    });
                }
                if !scan_modes.contains(item.scan_mode_id.as_str()) {
                    return Err(ConfigError::UnknownScanMode {
                        scan_mode: item.scan_mode_id.clone(),
                        owner: format!("south item {}/{}", south.id, item.id),
                    });
                }
            }
        }

        let mut norths = HashSet::new();
        for north in &self.north {
            if !norths.insert(north.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    kind: "north",
                    id: north.id.clone(),
                });
            }
            if !adapters.has_north(&north.kind) {
                return Err(ConfigError::UnknownType {
                    role: "north",
                    kind: north.kind.clone(),
                });
            }
            if !scan_modes.contains(north.caching.scan_mode_id.as_str()) {
                return Err(ConfigError::UnknownScanMode {
                    scan_mode: north.caching.scan_mode_id.clone(),
                    owner: format!("north {}", north.id),
                });
            }
            if north.caching.group_count == 0 {
                return Err(ConfigError::InvalidGroupCount(north.id.clone()));
            }
        }

        for subscription in &self.subscriptions {
            if !norths.contains(subscription.north_id.as_str()) {
                return Err(ConfigError::UnknownConnector {
                    role: "north",
                    id: subscription.north_id.clone(),
                });
            }
            if !souths.contains(subscription.south_id.as_str()) {
                return Err(ConfigError::UnknownConnector {
                    role: "south",
                    id: subscription.south_id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_document() -> serde_json::Value {
        serde_json::json!({
            "scanModes": [
                { "id": "every-10s", "name": "Every 10 seconds", "cronExpression": "*/10 * * * * *" }
            ],
            "south": [{
                "id": "folder",
                "type": "folder-scanner",
                "settings": { "inputFolder": "/tmp/in" },
                "items": [{ "id": "csv", "scanModeId": "every-10s", "settings": { "regex": ".*\\.csv" } }]
            }],
            "north": [{
                "id": "console",
                "type": "console",
                "caching": { "scanModeId": "every-10s", "groupCount": 2, "retryCount": 2 },
                "archive": { "enabled": true }
            }],
            "subscriptions": [{ "northId": "console", "southId": "folder" }],
            "retryPolicies": { "console": { "retryableStatusCodes": [400] } }
        })
    }

    #[test]
    fn load_parses_and_normalizes_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, sample_document().to_string()).unwrap();

        let topology = EngineTopology::load(&path).unwrap();
        assert_eq!(topology.south[0].items[0].south_id, "folder");
        assert_eq!(topology.south[0].items[0].name, "csv");
        let caching = &topology.north[0].caching;
        assert_eq!(caching.group_count, 2);
        assert_eq!(caching.max_send_count, 10_000);
        assert_eq!(caching.retry_interval(), Duration::from_millis(5_000));
        assert!(topology.north[0].archive.enabled);
        assert_eq!(topology.north[0].archive.retention_duration, 72);
        assert_eq!(topology.retry_policies["console"].retryable_status_codes, vec![400]);
        assert!(!topology.retry_policies.contains_key("file-writer"));
        topology.validate(&AdapterRegistry::builtin()).unwrap();
    }

    #[test]
    fn missing_document_yields_empty_topology() {
        let dir = TempDir::new().unwrap();
        let topology = EngineTopology::load(&dir.path().join("absent.json")).unwrap();
        assert!(topology.south.is_empty());
        assert!(topology.north.is_empty());
    }

    #[test]
    fn validate_rejects_unknown_scan_mode() {
        let mut topology: EngineTopology = serde_json::from_value(sample_document()).unwrap();
        topology.normalize();
        topology.north[0].caching.scan_mode_id = "hourly".to_string();
        let err = topology.validate(&AdapterRegistry::builtin()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownScanMode { .. }));
    }

    #[test]
    fn validate_rejects_unknown_type_and_zero_group_count() {
        let mut topology: EngineTopology = serde_json::from_value(sample_document()).unwrap();
        topology.south[0].kind = "opcua".to_string();
        assert!(matches!(
            topology.validate(&AdapterRegistry::builtin()),
            Err(ConfigError::UnknownType { role: "south", .. })
        ));

        let mut topology: EngineTopology = serde_json::from_value(sample_document()).unwrap();
        topology.north[0].caching.group_count = 0;
        assert_eq!(
            topology.validate(&AdapterRegistry::builtin()),
            Err(ConfigError::InvalidGroupCount("console".to_string()))
        );
    }

    #[test]
    fn validate_rejects_dangling_subscription() {
        let mut topology: EngineTopology = serde_json::from_value(sample_document()).unwrap();
        topology.subscriptions.push(Subscription {
            north_id: "console".to_string(),
            south_id: "ghost".to_string(),
        });
        assert!(matches!(
            topology.validate(&AdapterRegistry::builtin()),
            Err(ConfigError::UnknownConnector { role: "south", .. })
        ));
    }
}
