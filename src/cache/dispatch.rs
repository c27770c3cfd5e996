//! One dispatch cycle: drain pending entries of a North in FIFO batches.

use super::NorthCache;
use crate::config::{NorthConnectorConfig, RetryPolicy, TransformerBinding};
use crate::error::{CacheError, CacheResult, ConnectorError};
use crate::model::{CacheEntry, CacheStore, Content, ContentType};
use crate::north::{NorthAdapter, OutgoingContent};
use crate::transformer::{self, TransformerRegistry};
use bytes::Bytes;
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub group_count: usize,
    pub max_send_count: usize,
    pub max_batch_bytes: Option<u64>,
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub timeout: Duration,
    pub archive: bool,
    pub transformers: Vec<TransformerBinding>,
}

impl DispatchSettings {
    pub fn from_config(config: &NorthConnectorConfig) -> Self {
        let caching = &config.caching;
        Self {
            group_count: caching.group_count.max(1),
            max_send_count: caching.max_send_count.max(1),
            max_batch_bytes: (caching.max_batch_bytes > 0).then_some(caching.max_batch_bytes),
            retry_count: caching.retry_count,
            retry_interval: caching.retry_interval(),
            timeout: caching.timeout(),
            archive: config.archive.enabled,
            transformers: config.transformers.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub batches: usize,
    pub sent: usize,
    pub bytes: u64,
    /// Entries moved to the error store during this cycle.
    pub errored: usize,
    /// Last send failure, if the cycle stopped on one.
    pub failure: Option<ConnectorError>,
}

/// Sends pending entries until the queue is empty, `max_send_count` entries were handled,
/// a send fails, or `cancel` fires.
///
/// Only cache failures are returned as errors; send failures are recorded in the cache
/// (backoff or error store) and reported through [`DispatchReport::failure`].
pub async fn run_dispatch_cycle(
    cache: &NorthCache,
    adapter: &mut dyn NorthAdapter,
    transformers: &TransformerRegistry,
    policy: &RetryPolicy,
    settings: &DispatchSettings,
    cancel: &CancellationToken,
) -> CacheResult<DispatchReport> {
    let north_id = cache.north_id().to_string();
    let accepts = adapter.accepts().to_vec();
    let budget = settings.max_send_count.max(1);
    let mut handled = 0;
    let mut report = DispatchReport::default();

    while handled < budget && !cancel.is_cancelled() {
        if let Some(not_before) = cache.not_before() {
            if not_before > Utc::now() {
                tracing::debug!(north = %north_id, %not_before, "dispatch backing off");
                break;
            }
        }
        let group = settings.group_count.max(1).min(budget - handled);
        let entries = cache.checkout(group, settings.max_batch_bytes);
        if entries.is_empty() {
            break;
        }
        handled += entries.len();

        let mut batch: Vec<OutgoingContent> = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            let bytes = match cache.read_content(CacheStore::Pending, entry) {
                Ok(bytes) => Ok(bytes),
                Err(err @ CacheError::Io { .. }) => {
                    // Transient disk fault: leave the whole batch pending for the next cycle.
                    let mut held: Vec<CacheEntry> = batch.iter().map(|item| item.entry.clone()).collect();
                    held.extend(entries[idx..].iter().cloned());
                    cache.release(&held);
                    tracing::error!(north = %north_id, file = %entry.metadata.content_file, error = %err, "cache content unreadable; dispatch cycle aborted");
                    return Err(err);
                }
                Err(err) => Err(ConnectorError::Transform(err.to_string())),
            };
            match bytes.and_then(|bytes| prepare(entry, bytes, &accepts, transformers, &settings.transformers)) {
                Ok(content) => batch.push(OutgoingContent {
                    entry: entry.clone(),
                    content,
                }),
                Err(err) => {
                    tracing::warn!(north = %north_id, file = %entry.metadata.content_file, error = %err, "content cannot be sent; moving to error store");
                    cache.fail(
                        std::slice::from_ref(entry),
                        false,
                        settings.retry_count,
                        settings.retry_interval,
                    )?;
                    report.errored += 1;
                }
            }
        }
        if batch.is_empty() {
            continue;
        }

        let sent: Vec<CacheEntry> = batch.iter().map(|item| item.entry.clone()).collect();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectorError::Cancelled),
            res = tokio::time::timeout(settings.timeout, adapter.send(&batch, settings.timeout)) => {
                res.unwrap_or(Err(ConnectorError::Timeout(settings.timeout)))
            }
        };

        match result {
            Ok(()) => {
                cache.complete(&sent, settings.archive)?;
                report.batches += 1;
                report.sent += sent.len();
                report.bytes += sent.iter().map(|entry| entry.metadata.content_size).sum::<u64>();
                tracing::debug!(north = %north_id, entries = sent.len(), "batch sent");
            }
            Err(ConnectorError::Cancelled) => {
                cache.release(&sent);
                break;
            }
            Err(err) => {
                let retryable = adapter.should_retry(&err, policy);
                let outcome = cache.fail(&sent, retryable, settings.retry_count, settings.retry_interval)?;
                if outcome.moved_to_error > 0 {
                    report.errored += outcome.moved_to_error;
                    tracing::error!(north = %north_id, error = %err, attempts = outcome.attempts, entries = outcome.moved_to_error, "send failed; content moved to error store");
                }
                if let Some(not_before) = outcome.not_before {
                    tracing::warn!(north = %north_id, error = %err, attempts = outcome.attempts, %not_before, "send failed; will retry");
                }
                report.failure = Some(err);
                break;
            }
        }
    }
    Ok(report)
}

/// Decodes one pending entry and converts it to a type the adapter accepts.
fn prepare(
    entry: &CacheEntry,
    bytes: Bytes,
    accepts: &[ContentType],
    transformers: &TransformerRegistry,
    bindings: &[TransformerBinding],
) -> Result<Content, ConnectorError> {
    let metadata = &entry.metadata;
    let content = Content::decode(metadata.content_type, &metadata.content_file, bytes)
        .map_err(|err| ConnectorError::Transform(err.to_string()))?;
    if accepts.is_empty() || accepts.contains(&metadata.content_type) {
        return Ok(content);
    }

    let binding = bindings
        .iter()
        .find(|b| b.input_type == metadata.content_type && accepts.contains(&b.output_type));
    let (transformer, options) = match binding {
        Some(binding) => (
            transformers.find(binding.input_type, binding.output_type),
            binding.options.clone(),
        ),
        None => (
            accepts
                .iter()
                .find_map(|output| transformers.find(metadata.content_type, *output)),
            serde_json::Value::Null,
        ),
    };
    let Some(transformer) = transformer else {
        return Err(ConnectorError::Transform(format!(
            "no transformer from {} to any of {:?}",
            metadata.content_type, accepts
        )));
    };
    let output = transformer::apply(transformer.as_ref(), &content, metadata, &options)?;
    Ok(output.content)
}
