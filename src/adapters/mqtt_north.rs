use super::mqtt::{MqttBroker, MqttSettings};
use super::parse_settings;
use crate::config::NorthConnectorConfig;
use crate::error::{ConfigError, ConnectorError};
use crate::model::{format_instant, Content, ContentType};
use crate::north::{NorthAdapter, OutgoingContent};
use async_trait::async_trait;
use rumqttc::AsyncClient;
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ACCEPTS: &[ContentType] = &[ContentType::TimeValues, ContentType::Mqtt];

/// Publishes time-values to `<pointId>` and MQTT messages to their own topics.
pub struct MqttNorth {
    id: String,
    broker: MqttBroker,
    client: Option<AsyncClient>,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

impl MqttNorth {
    pub fn from_config(config: &NorthConnectorConfig) -> Result<Self, ConfigError> {
        let owner = format!("north {}", config.id);
        let settings: MqttSettings = parse_settings(&owner, &config.settings)?;
        Ok(Self {
            id: config.id.clone(),
            broker: settings.broker(&owner, &format!("oibus-north-{}", config.id))?,
            client: None,
            cancel: CancellationToken::new(),
            poller: None,
        })
    }

    async fn publish(&self, client: &AsyncClient, topic: &str, payload: Vec<u8>) -> Result<(), ConnectorError> {
        client
            .publish(topic, self.broker.qos, false, payload)
            .await
            .map_err(|err| ConnectorError::connection(format!("publish to {topic}: {err}")))
    }
}

#[async_trait]
impl NorthAdapter for MqttNorth {
    fn accepts(&self) -> &[ContentType] {
        ACCEPTS
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        let (client, mut eventloop) = AsyncClient::new(self.broker.options(), 256);
        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();
        let north_id = self.id.clone();
        let poller = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                if let Err(err) = event {
                    tracing::warn!(north = %north_id, error = %err, "mqtt connection lost; reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        });
        self.client = Some(client);
        self.poller = Some(poller);
        Ok(())
    }

    async fn send(&mut self, batch: &[OutgoingContent], _timeout: Duration) -> Result<(), ConnectorError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| ConnectorError::connection("mqtt client not connected"))?;
        for item in batch {
            match &item.content {
                Content::TimeValues(values) => {
                    for value in values {
                        let payload = json!({
                            "value": value.data.value,
                            "timestamp": format_instant(&value.timestamp),
                        });
                        self.publish(&client, &value.point_id, payload.to_string().into_bytes())
                            .await?;
                    }
                }
                Content::Mqtt(messages) => {
                    for message in messages {
                        self.publish(&client, &message.topic, message.payload.clone().into_bytes())
                            .await?;
                    }
                }
                other => {
                    return Err(ConnectorError::protocol(format!(
                        "{} content cannot be published",
                        other.content_type()
                    )))
                }
            }
        }
        tracing::debug!(north = %self.id, entries = batch.len(), "mqtt batch published");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        self.cancel.cancel();
        if let Some(poller) = self.poller.take() {
            let _ = poller.await;
        }
    }
}
