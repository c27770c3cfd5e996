use super::parse_settings;
use crate::config::NorthConnectorConfig;
use crate::error::{ConfigError, ConnectorError};
use crate::model::{Content, ContentType};
use crate::north::{NorthAdapter, OutgoingContent};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileWriterSettings {
    output_folder: PathBuf,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    suffix: String,
}

/// Writes every file unit into a local folder. Time-values reach it as CSV files.
pub struct FileWriterNorth {
    id: String,
    settings: FileWriterSettings,
}

const ACCEPTS: &[ContentType] = &[ContentType::Any];

impl FileWriterNorth {
    pub fn from_config(config: &NorthConnectorConfig) -> Result<Self, ConfigError> {
        let settings = parse_settings(&format!("north {}", config.id), &config.settings)?;
        Ok(Self {
            id: config.id.clone(),
            settings,
        })
    }

    fn target_name(&self, filename: &str) -> String {
        let (stem, ext) = match filename.rfind('.') {
            Some(idx) if idx > 0 => (&filename[..idx], &filename[idx..]),
            _ => (filename, ""),
        };
        format!("{}{stem}{}{ext}", self.settings.prefix, self.settings.suffix)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl NorthAdapter for FileWriterNorth {
    fn accepts(&self) -> &[ContentType] {
        ACCEPTS
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        tokio::fs::create_dir_all(&self.settings.output_folder)
            .await
            .map_err(|err| {
                ConnectorError::connection(format!(
                    "output folder {}: {err}",
                    self.settings.output_folder.display()
                ))
            })
    }

    async fn send(&mut self, batch: &[OutgoingContent], _timeout: Duration) -> Result<(), ConnectorError> {
        for item in batch {
            let Content::File(file) = &item.content else {
                return Err(ConnectorError::protocol(format!(
                    "{} content cannot be written as a file",
                    item.content.content_type()
                )));
            };
            let path = self.settings.output_folder.join(self.target_name(&file.filename));
            write_atomic(&path, &file.bytes).await.map_err(|err| {
                ConnectorError::connection(format!("write {}: {err}", path.display()))
            })?;
            tracing::debug!(north = %self.id, file = %path.display(), "file written");
        }
        Ok(())
    }

    async fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CacheEntry, CacheMetadata, CacheSource, FileContent};
    use bytes::Bytes;
    use chrono::Utc;
    use tempfile::TempDir;

    fn writer(folder: &Path) -> FileWriterNorth {
        let config: NorthConnectorConfig = serde_json::from_value(serde_json::json!({
            "id": "files",
            "type": "file-writer",
            "settings": { "outputFolder": folder, "prefix": "oibus-", "suffix": "-out" },
            "caching": { "scanModeId": "every-second" }
        }))
        .unwrap();
        FileWriterNorth::from_config(&config).unwrap()
    }

    fn outgoing(content: Content) -> OutgoingContent {
        OutgoingContent {
            entry: CacheEntry {
                metadata_filename: "entry.json".to_string(),
                metadata: CacheMetadata {
                    content_file: "data.csv".to_string(),
                    content_size: 0,
                    number_of_element: 0,
                    created_at: Utc::now(),
                    content_type: content.content_type(),
                    source: CacheSource::External,
                    options: serde_json::Value::Null,
                },
            },
            content,
        }
    }

    #[tokio::test]
    async fn writes_files_with_prefix_and_suffix() {
        let dir = TempDir::new().unwrap();
        let mut north = writer(&dir.path().join("out"));
        north.connect().await.unwrap();

        let file = Content::File(FileContent {
            filename: "data.csv".to_string(),
            bytes: Bytes::from_static(b"a,b\n"),
            modified_at: None,
        });
        north.send(&[outgoing(file)], Duration::from_secs(1)).await.unwrap();

        let written = std::fs::read(dir.path().join("out/oibus-data-out.csv")).unwrap();
        assert_eq!(written, b"a,b\n");
    }

    #[tokio::test]
    async fn refuses_structured_content() {
        let dir = TempDir::new().unwrap();
        let mut north = writer(dir.path());
        let err = north
            .send(&[outgoing(Content::TimeValues(Vec::new()))], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Protocol(_)));
    }
}
