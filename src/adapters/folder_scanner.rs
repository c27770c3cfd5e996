use super::parse_settings;
use crate::checkpoint::CheckpointStore;
use crate::config::{SouthConnectorConfig, SouthItemConfig};
use crate::error::{ConfigError, ConnectorError};
use crate::model::{ContentUnit, FileContent, Instant};
use crate::south::SouthAdapter;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderScannerSettings {
    input_folder: PathBuf,
    #[serde(default)]
    preserve_files: bool,
    #[serde(default)]
    compression: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemSettings {
    regex: String,
    /// Milliseconds a file must stay untouched before it is picked up.
    #[serde(default)]
    min_age: u64,
}

const MAX_MIN_AGE_MS: u64 = 1 << 40;

/// Picks up files from a local folder, one file unit per matching file.
///
/// Without `preserveFiles` every old-enough file is read and deleted once cached. With it,
/// files stay in place and a file is read again only when its modification time changes.
pub struct FolderScannerSouth {
    id: String,
    settings: FolderScannerSettings,
    patterns: HashMap<String, (Regex, u64)>,
    checkpoints: Arc<CheckpointStore>,
}

impl FolderScannerSouth {
    pub fn from_config(config: &SouthConnectorConfig, checkpoints: Arc<CheckpointStore>) -> Result<Self, ConfigError> {
        let owner = format!("south {}", config.id);
        let settings: FolderScannerSettings = parse_settings(&owner, &config.settings)?;
        if settings.compression {
            return Err(ConfigError::InvalidSettings {
                owner,
                reason: "compression is not supported".to_string(),
            });
        }
        let mut patterns = HashMap::new();
        for item in &config.items {
            let owner = format!("south item {}/{}", config.id, item.id);
            let item_settings: ItemSettings = parse_settings(&owner, &item.settings)?;
            let regex = Regex::new(&item_settings.regex).map_err(|err| ConfigError::InvalidSettings {
                owner,
                reason: err.to_string(),
            })?;
            patterns.insert(item.id.clone(), (regex, item_settings.min_age));
        }
        Ok(Self {
            id: config.id.clone(),
            settings,
            patterns,
            checkpoints,
        })
    }
}

#[async_trait]
impl SouthAdapter for FolderScannerSouth {
    async fn connect(&mut self) -> Result<(), ConnectorError> {
        match tokio::fs::metadata(&self.settings.input_folder).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ConnectorError::connection(format!(
                "{} is not a folder",
                self.settings.input_folder.display()
            ))),
            Err(err) => Err(ConnectorError::connection(format!(
                "input folder {}: {err}",
                self.settings.input_folder.display()
            ))),
        }
    }

    async fn acquire(
        &mut self,
        item: &SouthItemConfig,
        _since: Instant,
        until: Instant,
    ) -> Result<Vec<ContentUnit>, ConnectorError> {
        let Some((regex, min_age)) = self.patterns.get(&item.id) else {
            return Err(ConnectorError::protocol(format!("item {} is not configured", item.id)));
        };
        let newest_allowed = until - chrono::Duration::milliseconds((*min_age).min(MAX_MIN_AGE_MS) as i64);
        // File age, not the item checkpoint, decides: moved or copied files keep an old mtime.
        let seen = if self.settings.preserve_files {
            self.checkpoints
                .seen_files(&self.id)
                .map_err(|err| ConnectorError::protocol(format!("seen files: {err}")))?
        } else {
            HashMap::new()
        };

        let folder = &self.settings.input_folder;
        let mut dir = tokio::fs::read_dir(folder)
            .await
            .map_err(|err| ConnectorError::connection(format!("read {}: {err}", folder.display())))?;
        let mut found = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| ConnectorError::connection(format!("read {}: {err}", folder.display())))?
        {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !regex.is_match(&filename) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            // Checkpoints carry millisecond precision.
            let modified = DateTime::<Utc>::from(modified).trunc_subsecs(3);
            if modified > newest_allowed || seen.get(&filename) == Some(&modified) {
                continue;
            }
            found.push((modified, filename, entry.path()));
        }
        found.sort();

        let mut units = Vec::with_capacity(found.len());
        for (modified, filename, path) in found {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(south = %self.id, file = %path.display(), error = %err, "file vanished before it could be read");
                    continue;
                }
            };
            units.push(ContentUnit::File(FileContent {
                filename,
                bytes: Bytes::from(bytes),
                modified_at: Some(modified),
            }));
        }
        Ok(units)
    }

    async fn disconnect(&mut self) {}

    async fn committed(&mut self, _item: &SouthItemConfig, units: &[ContentUnit]) {
        for unit in units {
            let ContentUnit::File(file) = unit else {
                continue;
            };
            if self.settings.preserve_files {
                let Some(modified) = file.modified_at else {
                    continue;
                };
                if let Err(err) = self.checkpoints.record_seen_file(&self.id, &file.filename, &modified) {
                    tracing::warn!(south = %self.id, file = %file.filename, error = %err, "failed to record read file");
                }
                continue;
            }
            let path = self.settings.input_folder.join(&file.filename);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(south = %self.id, file = %path.display(), error = %err, "failed to remove acquired file");
            }
        }
    }
}
