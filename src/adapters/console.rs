use crate::error::ConnectorError;
use crate::model::ContentType;
use crate::north::{NorthAdapter, OutgoingContent};
use async_trait::async_trait;
use std::time::Duration;

const ACCEPTS: &[ContentType] = &[
    ContentType::TimeValues,
    ContentType::Setpoint,
    ContentType::Mqtt,
    ContentType::Any,
];

/// Debug destination: logs what it receives and acknowledges everything.
pub struct ConsoleNorth {
    id: String,
}

impl ConsoleNorth {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl NorthAdapter for ConsoleNorth {
    fn accepts(&self) -> &[ContentType] {
        ACCEPTS
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn send(&mut self, batch: &[OutgoingContent], _timeout: Duration) -> Result<(), ConnectorError> {
        let elements: usize = batch.iter().map(|item| item.content.number_of_element()).sum();
        let bytes: u64 = batch.iter().map(|item| item.entry.metadata.content_size).sum();
        tracing::info!(north = %self.id, entries = batch.len(), elements, bytes, "console north received batch");
        Ok(())
    }

    async fn disconnect(&mut self) {}
}
