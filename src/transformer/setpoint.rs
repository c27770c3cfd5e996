use super::{parse_options, TransformOutput, Transformer};
use crate::error::ConnectorError;
use crate::model::{CacheMetadata, Content, ContentType, Setpoint};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetpointMapping {
    pub point_id: String,
    pub reference: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeValuesToSetpointOptions {
    #[serde(default)]
    pub mapping: Vec<SetpointMapping>,
}

/// Turns time-values into setpoints through a point-to-reference table. Unmapped points
/// are dropped.
pub struct TimeValuesToSetpoint;

impl Transformer for TimeValuesToSetpoint {
    fn id(&self) -> &'static str {
        "time-values-to-setpoint"
    }

    fn input_type(&self) -> ContentType {
        ContentType::TimeValues
    }

    fn output_type(&self) -> ContentType {
        ContentType::Setpoint
    }

    fn transform(
        &self,
        input: &Content,
        metadata: &CacheMetadata,
        options: &serde_json::Value,
    ) -> Result<TransformOutput, ConnectorError> {
        let options: TimeValuesToSetpointOptions = parse_options(self.id(), options)?;
        let Content::TimeValues(values) = input else {
            return Err(ConnectorError::Transform(format!(
                "{}: expected time-values content",
                self.id()
            )));
        };
        let mapping: HashMap<&str, &str> = options
            .mapping
            .iter()
            .map(|m| (m.point_id.as_str(), m.reference.as_str()))
            .collect();

        let mut setpoints = Vec::with_capacity(values.len());
        let mut discarded = 0;
        for value in values {
            match mapping.get(value.point_id.as_str()) {
                Some(reference) => setpoints.push(Setpoint {
                    reference: (*reference).to_string(),
                    value: value.data.value.clone(),
                }),
                None => discarded += 1,
            }
        }

        Ok(TransformOutput {
            content: Content::Setpoints(setpoints),
            metadata: metadata.clone(),
            discarded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeValue;
    use crate::transformer::{apply, test_support::metadata};
    use chrono::Utc;

    #[test]
    fn maps_known_points_and_counts_the_rest() {
        let now = Utc::now();
        let input = Content::TimeValues(vec![
            TimeValue::new("temp-sp", now, serde_json::json!(21)),
            TimeValue::new("unmapped", now, serde_json::json!(1)),
        ]);
        let options = serde_json::json!({
            "mapping": [{ "pointId": "temp-sp", "reference": "ns=2;s=Boiler.Setpoint" }]
        });
        let out = apply(
            &TimeValuesToSetpoint,
            &input,
            &metadata(ContentType::TimeValues, "x.json"),
            &options,
        )
        .unwrap();
        assert_eq!(
            out.content,
            Content::Setpoints(vec![Setpoint {
                reference: "ns=2;s=Boiler.Setpoint".to_string(),
                value: serde_json::json!(21),
            }])
        );
        assert_eq!(out.discarded, 1);
        assert_eq!(out.metadata.content_type, ContentType::Setpoint);
        assert_eq!(out.metadata.number_of_element, 1);
    }
}
