use crate::config::RetryPolicy;
use crate::error::ConnectorError;
use crate::model::{CacheEntry, Content, ContentType};
use async_trait::async_trait;
use std::time::Duration;

/// One cache entry as handed to a North adapter, already in an accepted content type.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingContent {
    pub entry: CacheEntry,
    pub content: Content,
}

#[async_trait]
pub trait NorthAdapter: Send {
    /// Content types this adapter can send, preferred first.
    fn accepts(&self) -> &[ContentType];

    async fn connect(&mut self) -> Result<(), ConnectorError>;

    /// Sends one batch. `Ok` means the destination acknowledged every entry.
    async fn send(&mut self, batch: &[OutgoingContent], timeout: Duration) -> Result<(), ConnectorError>;

    fn should_retry(&self, error: &ConnectorError, policy: &RetryPolicy) -> bool {
        default_should_retry(error, policy)
    }

    async fn disconnect(&mut self);
}

pub fn default_should_retry(error: &ConnectorError, policy: &RetryPolicy) -> bool {
    match error {
        ConnectorError::Connection(_) | ConnectorError::Timeout(_) | ConnectorError::Protocol(_) => true,
        ConnectorError::Rejected { status_code, .. } => policy.retryable_status_codes.contains(status_code),
        ConnectorError::Transform(_) => false,
        ConnectorError::Cancelled => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_follow_the_retry_policy() {
        let policy = RetryPolicy::default();
        assert!(default_should_retry(&ConnectorError::rejected(503, "busy"), &policy));
        assert!(!default_should_retry(&ConnectorError::rejected(400, "bad"), &policy));

        let strict = RetryPolicy {
            retryable_status_codes: vec![400],
        };
        assert!(default_should_retry(&ConnectorError::rejected(400, "bad"), &strict));
        assert!(!default_should_retry(&ConnectorError::rejected(503, "busy"), &strict));
    }

    #[test]
    fn transport_faults_are_retryable_and_transform_faults_are_not() {
        let policy = RetryPolicy::default();
        assert!(default_should_retry(&ConnectorError::connection("refused"), &policy));
        assert!(default_should_retry(&ConnectorError::Timeout(Duration::from_secs(1)), &policy));
        assert!(!default_should_retry(&ConnectorError::Transform("bad csv".into()), &policy));
    }
}
