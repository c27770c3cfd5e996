use super::mqtt::{topic_matches, MqttBroker, MqttSettings};
use super::parse_settings;
use crate::config::{SouthConnectorConfig, SouthItemConfig};
use crate::error::{ConfigError, ConnectorError};
use crate::model::{parse_instant, ContentUnit, Instant, TimeValue, TimeValueData};
use crate::south::{ContentSink, SouthAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, ClientError, Event, Incoming, QoS, SubscribeFilter};
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemSettings {
    topic: String,
}

#[derive(Debug, Clone)]
struct Route {
    filter: String,
    item_id: String,
    point_id: String,
}

/// Subscribes to one topic per item and pushes every decoded message as a time-value.
pub struct MqttSouth {
    id: String,
    broker: MqttBroker,
    routes: Vec<Route>,
    client: Option<AsyncClient>,
    cancel: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl MqttSouth {
    pub fn from_config(config: &SouthConnectorConfig) -> Result<Self, ConfigError> {
        let owner = format!("south {}", config.id);
        let settings: MqttSettings = parse_settings(&owner, &config.settings)?;
        let broker = settings.broker(&owner, &format!("oibus-south-{}", config.id))?;
        let mut routes = Vec::new();
        for item in &config.items {
            let item_settings: ItemSettings =
                parse_settings(&format!("south item {}/{}", config.id, item.id), &item.settings)?;
            routes.push(Route {
                filter: item_settings.topic,
                item_id: item.id.clone(),
                point_id: if item.name.is_empty() {
                    item.id.clone()
                } else {
                    item.name.clone()
                },
            });
        }
        Ok(Self {
            id: config.id.clone(),
            broker,
            routes,
            client: None,
            cancel: CancellationToken::new(),
            listener: None,
        })
    }
}

/// Queues one SUBSCRIBE carrying every route's filter. Never waits on the request
/// channel, so it is safe to call from the task polling the event loop.
fn subscribe_all(client: &AsyncClient, routes: &[Route], qos: QoS) -> Result<(), ClientError> {
    if routes.is_empty() {
        return Ok(());
    }
    let filters = routes
        .iter()
        .map(|route| SubscribeFilter::new(route.filter.clone(), qos));
    client.try_subscribe_many(filters)
}

#[derive(Debug, Deserialize)]
struct PointPayload {
    value: serde_json::Value,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    quality: Option<String>,
}

/// Decodes `{value, timestamp?, quality?}`. Timestamps are RFC3339 strings or epoch millis.
fn decode_payload(point_id: &str, payload: &[u8], received_at: Instant) -> Option<TimeValue> {
    let parsed: PointPayload = serde_json::from_slice(payload).ok()?;
    let timestamp = match parsed.timestamp {
        None | Some(serde_json::Value::Null) => received_at,
        Some(serde_json::Value::String(raw)) => parse_instant(&raw)?,
        Some(serde_json::Value::Number(millis)) => DateTime::<Utc>::from_timestamp_millis(millis.as_i64()?)?,
        Some(_) => return None,
    };
    Some(TimeValue {
        point_id: point_id.to_string(),
        timestamp,
        data: TimeValueData {
            value: parsed.value,
            quality: parsed.quality,
        },
    })
}

#[async_trait]
impl SouthAdapter for MqttSouth {
    async fn connect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn acquire(
        &mut self,
        _item: &SouthItemConfig,
        _since: Instant,
        _until: Instant,
    ) -> Result<Vec<ContentUnit>, ConnectorError> {
        Ok(Vec::new())
    }

    async fn subscribe(&mut self, items: &[SouthItemConfig], sink: ContentSink) -> Result<bool, ConnectorError> {
        let routes: Vec<Route> = self
            .routes
            .iter()
            .filter(|route| items.iter().any(|item| item.id == route.item_id))
            .cloned()
            .collect();
        let (client, mut eventloop) = AsyncClient::new(self.broker.options(), 64);
        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();

        let subscriber = client.clone();
        let qos = self.broker.qos;
        let south_id = self.id.clone();
        let listener = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => match subscribe_all(&subscriber, &routes, qos) {
                        Ok(()) => tracing::info!(south = %south_id, topics = routes.len(), "subscribed to mqtt topics"),
                        Err(err) => tracing::warn!(south = %south_id, error = %err, "mqtt subscribe failed"),
                    },
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let Some(route) = routes.iter().find(|route| topic_matches(&route.filter, &publish.topic)) else {
                            continue;
                        };
                        let Some(value) = decode_payload(&route.point_id, &publish.payload, Utc::now()) else {
                            tracing::warn!(south = %south_id, topic = %publish.topic, "undecodable mqtt payload dropped");
                            continue;
                        };
                        if sink
                            .push(Some(route.item_id.as_str()), vec![ContentUnit::TimeValue(value)])
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(south = %south_id, error = %err, "mqtt connection lost; reconnecting");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
            tracing::debug!(south = %south_id, "mqtt listener stopped");
        });

        self.client = Some(client);
        self.listener = Some(listener);
        Ok(true)
    }

    async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        if let Some(listener) = self.listener.take() {
            let _ = listener.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_values_with_and_without_timestamps() {
        let received = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let value = decode_payload("temp", br#"{"value": 21.5}"#, received).unwrap();
        assert_eq!(value.timestamp, received);
        assert_eq!(value.data.value, serde_json::json!(21.5));

        let value = decode_payload(
            "temp",
            br#"{"value": 3, "timestamp": "2024-01-01T00:00:05.000Z", "quality": "good"}"#,
            received,
        )
        .unwrap();
        assert_eq!(value.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap());
        assert_eq!(value.data.quality.as_deref(), Some("good"));

        let value = decode_payload("temp", br#"{"value": 3, "timestamp": 1704067210000}"#, received).unwrap();
        assert_eq!(value.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap());
    }

    #[test]
    fn rejects_payloads_without_a_value() {
        let now = Utc::now();
        assert!(decode_payload("temp", b"21.5", now).is_none());
        assert!(decode_payload("temp", br#"{"timestamp": "2024-01-01T00:00:00Z"}"#, now).is_none());
        assert!(decode_payload("temp", br#"{"value": 1, "timestamp": "yesterday"}"#, now).is_none());
    }

    #[tokio::test]
    async fn many_topics_fit_in_one_subscribe_request() {
        let options = rumqttc::MqttOptions::new("oibus-test", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 4);
        let routes: Vec<Route> = (0..200)
            .map(|i| Route {
                filter: format!("plant/line-{i}/+"),
                item_id: format!("item-{i}"),
                point_id: format!("point-{i}"),
            })
            .collect();

        assert!(subscribe_all(&client, &routes, QoS::AtLeastOnce).is_ok());
        assert!(subscribe_all(&client, &[], QoS::AtLeastOnce).is_ok());
    }

    #[test]
    fn items_need_a_topic() {
        let config: SouthConnectorConfig = serde_json::from_value(serde_json::json!({
            "id": "broker",
            "type": "mqtt",
            "settings": { "url": "mqtt://localhost" },
            "items": [{ "id": "temp", "scanModeId": "every-second", "settings": {} }]
        }))
        .unwrap();
        assert!(matches!(
            MqttSouth::from_config(&config),
            Err(ConfigError::InvalidSettings { .. })
        ));
    }
}
