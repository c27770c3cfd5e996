use super::{delimiter_byte, parse_options, TransformOutput, Transformer};
use crate::error::ConnectorError;
use crate::model::{
    original_filename, parse_instant, CacheMetadata, Content, ContentType, FileContent,
    MqttMessage, TimeValue, TimeValueData,
};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::BTreeMap;

fn default_delimiter() -> String {
    ",".to_string()
}

fn transform_err(transformer: &str, message: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Transform(format!("{transformer}: {message}"))
}

fn file_bytes<'a>(transformer: &str, input: &'a Content) -> Result<&'a FileContent, ConnectorError> {
    match input {
        Content::File(file) => Ok(file),
        other => Err(transform_err(
            transformer,
            format!("expected file content, got {}", other.content_type()),
        )),
    }
}

fn reader<'a>(delimiter: u8, bytes: &'a [u8]) -> ::csv::Reader<&'a [u8]> {
    ::csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(::csv::Trim::All)
        .from_reader(bytes)
}

fn column_index(
    transformer: &str,
    headers: &::csv::StringRecord,
    column: &str,
) -> Result<usize, ConnectorError> {
    headers
        .iter()
        .position(|header| header == column)
        .ok_or_else(|| transform_err(transformer, format!("column {column:?} not found in header")))
}

fn non_empty(record: &::csv::StringRecord, idx: usize) -> Option<&str> {
    record.get(idx).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeValuesToCsvOptions {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// `@SourceId` and `@CurrentDate` are substituted.
    #[serde(default = "default_csv_filename")]
    pub filename: String,
}

fn default_csv_filename() -> String {
    "@SourceId-@CurrentDate.csv".to_string()
}

impl Default for TimeValuesToCsvOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            filename: default_csv_filename(),
        }
    }
}

/// Flattens time-values into a `pointId,timestamp,value` file.
pub struct TimeValuesToCsv;

impl Transformer for TimeValuesToCsv {
    fn id(&self) -> &'static str {
        "time-values-to-csv"
    }

    fn input_type(&self) -> ContentType {
        ContentType::TimeValues
    }

    fn output_type(&self) -> ContentType {
        ContentType::Any
    }

    fn transform(
        &self,
        input: &Content,
        metadata: &CacheMetadata,
        options: &serde_json::Value,
    ) -> Result<TransformOutput, ConnectorError> {
        let options: TimeValuesToCsvOptions = parse_options(self.id(), options)?;
        let delimiter = delimiter_byte(self.id(), &options.delimiter)?;
        let Content::TimeValues(values) = input else {
            return Err(transform_err(self.id(), "expected time-values content"));
        };

        let mut writer = ::csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(Vec::new());
        writer
            .write_record(["pointId", "timestamp", "value"])
            .map_err(|err| transform_err(self.id(), err))?;
        for value in values {
            let rendered = match &value.data.value {
                serde_json::Value::String(raw) => raw.clone(),
                other => other.to_string(),
            };
            writer
                .write_record([
                    value.point_id.as_str(),
                    crate::model::format_instant(&value.timestamp).as_str(),
                    rendered.as_str(),
                ])
                .map_err(|err| transform_err(self.id(), err))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| transform_err(self.id(), err))?;

        let source_id = metadata.source.south_id().unwrap_or("oibus");
        let filename = options
            .filename
            .replace("@SourceId", source_id)
            .replace("@CurrentDate", &metadata.created_at.format("%Y_%m_%d_%H_%M_%S_%3f").to_string());

        let mut out_metadata = metadata.clone();
        out_metadata.content_file = filename.clone();
        Ok(TransformOutput {
            content: Content::File(FileContent {
                filename,
                bytes: Bytes::from(bytes),
                modified_at: None,
            }),
            metadata: out_metadata,
            discarded: 0,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvToTimeValuesOptions {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_point_id_column")]
    pub point_id_column: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    #[serde(default = "default_value_column")]
    pub value_column: String,
}

fn default_point_id_column() -> String {
    "pointId".to_string()
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

fn default_value_column() -> String {
    "value".to_string()
}

impl Default for CsvToTimeValuesOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            point_id_column: default_point_id_column(),
            timestamp_column: default_timestamp_column(),
            value_column: default_value_column(),
        }
    }
}

/// Parses a CSV file into time-values. Rows with a missing field or a bad timestamp are dropped.
pub struct CsvToTimeValues;

impl Transformer for CsvToTimeValues {
    fn id(&self) -> &'static str {
        "csv-to-time-values"
    }

    fn input_type(&self) -> ContentType {
        ContentType::Any
    }

    fn output_type(&self) -> ContentType {
        ContentType::TimeValues
    }

    fn transform(
        &self,
        input: &Content,
        metadata: &CacheMetadata,
        options: &serde_json::Value,
    ) -> Result<TransformOutput, ConnectorError> {
        let options: CsvToTimeValuesOptions = parse_options(self.id(), options)?;
        let delimiter = delimiter_byte(self.id(), &options.delimiter)?;
        let file = file_bytes(self.id(), input)?;

        let mut rdr = reader(delimiter, &file.bytes);
        let headers = rdr
            .headers()
            .map_err(|err| transform_err(self.id(), err))?
            .clone();
        let point_idx = column_index(self.id(), &headers, &options.point_id_column)?;
        let ts_idx = column_index(self.id(), &headers, &options.timestamp_column)?;
        let value_idx = column_index(self.id(), &headers, &options.value_column)?;

        let mut values = Vec::new();
        let mut discarded = 0;
        for record in rdr.records() {
            let Ok(record) = record else {
                discarded += 1;
                continue;
            };
            let parsed = non_empty(&record, point_idx).and_then(|point_id| {
                let timestamp = non_empty(&record, ts_idx).and_then(parse_instant)?;
                let raw = non_empty(&record, value_idx)?;
                let value = raw
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or_else(|| serde_json::Value::String(raw.to_string()));
                Some(TimeValue {
                    point_id: point_id.to_string(),
                    timestamp,
                    data: TimeValueData {
                        value,
                        quality: None,
                    },
                })
            });
            match parsed {
                Some(value) => values.push(value),
                None => discarded += 1,
            }
        }

        let mut out_metadata = metadata.clone();
        let stem = original_filename(&metadata.content_file);
        out_metadata.content_file = format!("{stem}.json");
        Ok(TransformOutput {
            content: Content::TimeValues(values),
            metadata: out_metadata,
            discarded,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvToMqttOptions {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_topic_column")]
    pub topic_column: String,
    /// Columns copied into the JSON payload; empty copies every other column.
    #[serde(default)]
    pub payload_columns: Vec<String>,
}

fn default_topic_column() -> String {
    "topic".to_string()
}

impl Default for CsvToMqttOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            topic_column: default_topic_column(),
            payload_columns: Vec::new(),
        }
    }
}

/// Maps each CSV row to an MQTT message whose topic comes from a column.
pub struct CsvToMqtt;

impl Transformer for CsvToMqtt {
    fn id(&self) -> &'static str {
        "csv-to-mqtt"
    }

    fn input_type(&self) -> ContentType {
        ContentType::Any
    }

    fn output_type(&self) -> ContentType {
        ContentType::Mqtt
    }

    fn transform(
        &self,
        input: &Content,
        metadata: &CacheMetadata,
        options: &serde_json::Value,
    ) -> Result<TransformOutput, ConnectorError> {
        let options: CsvToMqttOptions = parse_options(self.id(), options)?;
        let delimiter = delimiter_byte(self.id(), &options.delimiter)?;
        let file = file_bytes(self.id(), input)?;

        let mut rdr = reader(delimiter, &file.bytes);
        let headers = rdr
            .headers()
            .map_err(|err| transform_err(self.id(), err))?
            .clone();
        let topic_idx = column_index(self.id(), &headers, &options.topic_column)?;
        let payload: Vec<(String, usize)> = if options.payload_columns.is_empty() {
            headers
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != topic_idx)
                .map(|(idx, name)| (name.to_string(), idx))
                .collect()
        } else {
            options
                .payload_columns
                .iter()
                .map(|name| Ok((name.clone(), column_index(self.id(), &headers, name)?)))
                .collect::<Result<_, ConnectorError>>()?
        };

        let mut messages = Vec::new();
        let mut discarded = 0;
        for record in rdr.records() {
            let Ok(record) = record else {
                discarded += 1;
                continue;
            };
            let Some(topic) = non_empty(&record, topic_idx) else {
                discarded += 1;
                continue;
            };
            let fields: Option<BTreeMap<&str, &str>> = payload
                .iter()
                .map(|(name, idx)| record.get(*idx).map(|value| (name.as_str(), value)))
                .collect();
            let Some(fields) = fields else {
                discarded += 1;
                continue;
            };
            let body = serde_json::to_string(&fields)
                .map_err(|err| transform_err(self.id(), err))?;
            messages.push(MqttMessage {
                topic: topic.to_string(),
                payload: body,
            });
        }

        let mut out_metadata = metadata.clone();
        out_metadata.content_file = format!("{}.json", original_filename(&metadata.content_file));
        Ok(TransformOutput {
            content: Content::Mqtt(messages),
            metadata: out_metadata,
            discarded,
        })
    }
}
