use crate::error::CacheResult;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Instant = DateTime<Utc>;

/// RFC3339, millisecond precision, `Z` suffix. Lexicographic order matches time order.
pub fn format_instant(instant: &Instant) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_instant(raw: &str) -> Option<Instant> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    /// Raw file bytes.
    Any,
    TimeValues,
    Setpoint,
    Mqtt,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Any => "any",
            ContentType::TimeValues => "time-values",
            ContentType::Setpoint => "setpoint",
            ContentType::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeValueData {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeValue {
    pub point_id: String,
    pub timestamp: Instant,
    pub data: TimeValueData,
}

impl TimeValue {
    pub fn new(point_id: impl Into<String>, timestamp: Instant, value: serde_json::Value) -> Self {
        Self {
            point_id: point_id.into(),
            timestamp,
            data: TimeValueData {
                value,
                quality: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    pub reference: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileContent {
    pub filename: String,
    pub bytes: Bytes,
    pub modified_at: Option<Instant>,
}

/// One element produced by a South adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentUnit {
    TimeValue(TimeValue),
    Setpoint(Setpoint),
    File(FileContent),
}

impl ContentUnit {
    /// Source-side instant used to advance the checkpoint.
    pub fn instant(&self) -> Option<Instant> {
        match self {
            ContentUnit::TimeValue(value) => Some(value.timestamp),
            ContentUnit::Setpoint(_) => None,
            ContentUnit::File(file) => file.modified_at,
        }
    }
}

/// Payload of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    TimeValues(Vec<TimeValue>),
    Setpoints(Vec<Setpoint>),
    Mqtt(Vec<MqttMessage>),
    File(FileContent),
}

impl Content {
    pub fn content_type(&self) -> ContentType {
        match self {
            Content::TimeValues(_) => ContentType::TimeValues,
            Content::Setpoints(_) => ContentType::Setpoint,
            Content::Mqtt(_) => ContentType::Mqtt,
            Content::File(_) => ContentType::Any,
        }
    }

    /// Raw files count as zero elements.
    pub fn number_of_element(&self) -> usize {
        match self {
            Content::TimeValues(values) => values.len(),
            Content::Setpoints(values) => values.len(),
            Content::Mqtt(values) => values.len(),
            Content::File(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::File(_) => false,
            _ => self.number_of_element() == 0,
        }
    }

    /// Groups acquired units into cache entries: all time-values in one entry,
    /// all setpoints in one entry, one entry per file.
    pub fn group(units: Vec<ContentUnit>) -> Vec<Content> {
        let mut values = Vec::new();
        let mut setpoints = Vec::new();
        let mut files = Vec::new();
        for unit in units {
            match unit {
                ContentUnit::TimeValue(value) => values.push(value),
                ContentUnit::Setpoint(setpoint) => setpoints.push(setpoint),
                ContentUnit::File(file) => files.push(Content::File(file)),
            }
        }
        let mut grouped = Vec::with_capacity(files.len() + 2);
        if !values.is_empty() {
            grouped.push(Content::TimeValues(values));
        }
        if !setpoints.is_empty() {
            grouped.push(Content::Setpoints(setpoints));
        }
        grouped.extend(files);
        grouped
    }

    pub fn encode(&self) -> CacheResult<Bytes> {
        let encoded = match self {
            Content::TimeValues(values) => serde_json::to_vec(values)?,
            Content::Setpoints(values) => serde_json::to_vec(values)?,
            Content::Mqtt(values) => serde_json::to_vec(values)?,
            Content::File(file) => return Ok(file.bytes.clone()),
        };
        Ok(Bytes::from(encoded))
    }

    pub fn decode(content_type: ContentType, content_file: &str, bytes: Bytes) -> CacheResult<Self> {
        let content = match content_type {
            ContentType::TimeValues => Content::TimeValues(serde_json::from_slice(&bytes)?),
            ContentType::Setpoint => Content::Setpoints(serde_json::from_slice(&bytes)?),
            ContentType::Mqtt => Content::Mqtt(serde_json::from_slice(&bytes)?),
            ContentType::Any => Content::File(FileContent {
                filename: original_filename(content_file),
                bytes,
                modified_at: None,
            }),
        };
        Ok(content)
    }

    /// Name the content file will carry in the cache, unique per entry.
    pub fn cache_filename(&self, unique: &str) -> String {
        match self {
            Content::File(file) => {
                let (stem, ext) = split_extension(&file.filename);
                format!("{stem}-{unique}{ext}")
            }
            _ => format!("{unique}.json"),
        }
    }
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx..]),
        _ => (filename, ""),
    }
}

/// Reverses [`Content::cache_filename`] for file content.
pub fn original_filename(content_file: &str) -> String {
    let (stem, ext) = split_extension(content_file);
    match stem.rsplit_once('-') {
        Some((base, suffix))
            if suffix.len() == 32 && suffix.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            format!("{base}{ext}")
        }
        _ => content_file.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CacheSource {
    #[serde(rename_all = "camelCase")]
    South {
        south_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    /// Content injected by an operator or an external API.
    External,
}

impl CacheSource {
    pub fn south(south_id: impl Into<String>, item_id: Option<String>) -> Self {
        CacheSource::South {
            south_id: south_id.into(),
            item_id,
        }
    }

    pub fn south_id(&self) -> Option<&str> {
        match self {
            CacheSource::South { south_id, .. } => Some(south_id),
            CacheSource::External => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub content_file: String,
    pub content_size: u64,
    pub number_of_element: usize,
    pub created_at: Instant,
    pub content_type: ContentType,
    pub source: CacheSource,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub metadata_filename: String,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStore {
    Pending,
    Error,
    Archive,
}

impl CacheStore {
    pub const ALL: [CacheStore; 3] = [CacheStore::Pending, CacheStore::Error, CacheStore::Archive];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheStore::Pending => "pending",
            CacheStore::Error => "error",
            CacheStore::Archive => "archive",
        }
    }
}

impl fmt::Display for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSearchParam {
    #[serde(default)]
    pub name_contains: Option<String>,
    #[serde(default)]
    pub start: Option<Instant>,
    #[serde(default)]
    pub end: Option<Instant>,
}

impl CacheSearchParam {
    pub fn matches(&self, metadata: &CacheMetadata) -> bool {
        if let Some(needle) = self.name_contains.as_deref().filter(|v| !v.is_empty()) {
            if !metadata
                .content_file
                .to_uppercase()
                .contains(&needle.to_uppercase())
            {
                return false;
            }
        }
        if let Some(start) = self.start {
            if metadata.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if metadata.created_at > end {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> Instant {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    #[test]
    fn group_batches_values_and_keeps_files_separate() {
        let units = vec![
            ContentUnit::TimeValue(TimeValue::new("p1", at(5), serde_json::json!(1.5))),
            ContentUnit::File(FileContent {
                filename: "a.csv".to_string(),
                bytes: Bytes::from_static(b"x"),
                modified_at: Some(at(7)),
            }),
            ContentUnit::TimeValue(TimeValue::new("p1", at(10), serde_json::json!(2.5))),
            ContentUnit::File(FileContent {
                filename: "b.csv".to_string(),
                bytes: Bytes::from_static(b"y"),
                modified_at: Some(at(8)),
            }),
        ];
        let grouped = Content::group(units);
        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[0].content_type(), ContentType::TimeValues);
        assert_eq!(grouped[0].number_of_element(), 2);
        assert_eq!(grouped[1].number_of_element(), 0);
    }

    #[test]
    fn file_cache_name_round_trips_to_original() {
        let content = Content::File(FileContent {
            filename: "report.2024.csv".to_string(),
            bytes: Bytes::new(),
            modified_at: None,
        });
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let cached = content.cache_filename(&unique);
        assert!(cached.starts_with("report.2024-"));
        assert_eq!(original_filename(&cached), "report.2024.csv");
        assert_eq!(original_filename("plain-name.txt"), "plain-name.txt");
    }

    #[test]
    fn metadata_uses_wire_field_names() {
        let metadata = CacheMetadata {
            content_file: "x.json".to_string(),
            content_size: 12,
            number_of_element: 2,
            created_at: at(0),
            content_type: ContentType::TimeValues,
            source: CacheSource::south("s1", Some("i1".to_string())),
            options: serde_json::Value::Null,
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["contentType"], "time-values");
        assert_eq!(json["numberOfElement"], 2);
        assert_eq!(json["source"]["type"], "south");
        assert_eq!(json["source"]["southId"], "s1");
        assert_eq!(json["source"]["itemId"], "i1");
    }

    #[test]
    fn search_filter_is_case_insensitive_with_inclusive_bounds() {
        let metadata = CacheMetadata {
            content_file: "Report-abc.csv".to_string(),
            content_size: 1,
            number_of_element: 0,
            created_at: at(10),
            content_type: ContentType::Any,
            source: CacheSource::External,
            options: serde_json::Value::Null,
        };
        let mut filter = CacheSearchParam {
            name_contains: Some("report".to_string()),
            start: Some(at(10)),
            end: Some(at(10)),
        };
        assert!(filter.matches(&metadata));
        filter.end = Some(at(9));
        assert!(!filter.matches(&metadata));
    }

    #[test]
    fn instants_format_with_millis_and_z() {
        assert_eq!(format_instant(&at(10)), "2024-01-01T00:00:10.000Z");
        assert_eq!(parse_instant("2024-01-01T00:00:10Z"), Some(at(10)));
    }
}
