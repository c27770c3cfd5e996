//! Content-type conversions applied on the cache write and dispatch paths.
//!
//! A transformer reads one unit and produces one unit. Malformed records are dropped and
//! counted; only an unusable unit as a whole is an error.

mod tabular;
mod setpoint;

pub use self::tabular::{CsvToMqtt, CsvToTimeValues, TimeValuesToCsv};
pub use self::setpoint::TimeValuesToSetpoint;

use crate::error::ConnectorError;
use crate::model::{CacheMetadata, Content, ContentType};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub content: Content,
    /// Metadata of the produced unit. `content_size` and `created_at` are left as received
    /// and finalized by the caller once the output is stored.
    pub metadata: CacheMetadata,
    pub discarded: usize,
}

pub trait Transformer: Send + Sync {
    fn id(&self) -> &'static str;

    fn input_type(&self) -> ContentType;

    fn output_type(&self) -> ContentType;

    fn transform(
        &self,
        input: &Content,
        metadata: &CacheMetadata,
        options: &serde_json::Value,
    ) -> Result<TransformOutput, ConnectorError>;
}

/// Passes content through untouched.
pub struct Identity;

impl Transformer for Identity {
    fn id(&self) -> &'static str {
        "identity"
    }

    fn input_type(&self) -> ContentType {
        ContentType::Any
    }

    fn output_type(&self) -> ContentType {
        ContentType::Any
    }

    fn transform(
        &self,
        input: &Content,
        metadata: &CacheMetadata,
        _options: &serde_json::Value,
    ) -> Result<TransformOutput, ConnectorError> {
        Ok(TransformOutput {
            content: input.clone(),
            metadata: metadata.clone(),
            discarded: 0,
        })
    }
}

/// Transformers keyed by `(input, output)` content type.
#[derive(Clone)]
pub struct TransformerRegistry {
    by_pair: HashMap<(ContentType, ContentType), Arc<dyn Transformer>>,
    identity: Arc<dyn Transformer>,
}

impl TransformerRegistry {
    pub fn empty() -> Self {
        Self {
            by_pair: HashMap::new(),
            identity: Arc::new(Identity),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(TimeValuesToCsv));
        registry.register(Arc::new(CsvToTimeValues));
        registry.register(Arc::new(CsvToMqtt));
        registry.register(Arc::new(TimeValuesToSetpoint));
        registry
    }

    pub fn register(&mut self, transformer: Arc<dyn Transformer>) {
        self.by_pair.insert(
            (transformer.input_type(), transformer.output_type()),
            transformer,
        );
    }

    pub fn find(&self, input: ContentType, output: ContentType) -> Option<Arc<dyn Transformer>> {
        if input == output {
            return Some(self.identity.clone());
        }
        self.by_pair.get(&(input, output)).cloned()
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Runs `transformer` and stamps the output type and element count into the metadata.
pub fn apply(
    transformer: &dyn Transformer,
    input: &Content,
    metadata: &CacheMetadata,
    options: &serde_json::Value,
) -> Result<TransformOutput, ConnectorError> {
    let mut output = transformer.transform(input, metadata, options)?;
    output.metadata.content_type = output.content.content_type();
    output.metadata.number_of_element = output.content.number_of_element();
    if output.discarded > 0 {
        tracing::warn!(
            transformer = transformer.id(),
            file = %metadata.content_file,
            discarded = output.discarded,
            "malformed records dropped during transformation"
        );
    }
    Ok(output)
}

pub(crate) fn parse_options<T: DeserializeOwned + Default>(
    transformer: &str,
    options: &serde_json::Value,
) -> Result<T, ConnectorError> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone())
        .map_err(|err| ConnectorError::Transform(format!("{transformer}: invalid options: {err}")))
}

pub(crate) fn delimiter_byte(transformer: &str, delimiter: &str) -> Result<u8, ConnectorError> {
    match delimiter.as_bytes() {
        [byte] => Ok(*byte),
        _ => Err(ConnectorError::Transform(format!(
            "{transformer}: delimiter must be a single byte, got {delimiter:?}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::model::{CacheMetadata, CacheSource, ContentType};
    use chrono::{TimeZone, Utc};

    pub fn metadata(content_type: ContentType, content_file: &str) -> CacheMetadata {
        CacheMetadata {
            content_file: content_file.to_string(),
            content_size: 0,
            number_of_element: 0,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap(),
            content_type,
            source: CacheSource::south("plant-a", Some("line-1".to_string())),
            options: serde_json::Value::Null,
        }
    }
}
