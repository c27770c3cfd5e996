//! South adapter contract and the acquisition path:
//! checkpoint read, adapter read, cache write, then checkpoint advance.

use crate::cache::CacheRouter;
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::config::{HistorySettings, SouthItemConfig};
use crate::error::{AcquisitionError, ConnectorError};
use crate::model::{CacheSource, Content, ContentUnit, Instant};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait SouthAdapter: Send {
    async fn connect(&mut self) -> Result<(), ConnectorError>;

    /// Returns everything strictly newer than `since` and not newer than `until`.
    async fn acquire(
        &mut self,
        item: &SouthItemConfig,
        since: Instant,
        until: Instant,
    ) -> Result<Vec<ContentUnit>, ConnectorError>;

    async fn disconnect(&mut self);

    /// Push-mode adapters keep delivering through `sink` and return `true`.
    async fn subscribe(
        &mut self,
        _items: &[SouthItemConfig],
        _sink: ContentSink,
    ) -> Result<bool, ConnectorError> {
        Ok(false)
    }

    /// Called after `units` are cached and the checkpoint advanced.
    async fn committed(&mut self, _item: &SouthItemConfig, _units: &[ContentUnit]) {}
}

#[derive(Debug)]
pub struct PushedContent {
    pub south_id: String,
    pub item_id: Option<String>,
    pub units: Vec<ContentUnit>,
}

/// Handle through which push-mode adapters hand content to the engine.
#[derive(Debug, Clone)]
pub struct ContentSink {
    south_id: String,
    tx: mpsc::Sender<PushedContent>,
}

impl ContentSink {
    pub fn new(south_id: impl Into<String>, tx: mpsc::Sender<PushedContent>) -> Self {
        Self {
            south_id: south_id.into(),
            tx,
        }
    }

    pub async fn push(
        &self,
        item_id: Option<&str>,
        units: Vec<ContentUnit>,
    ) -> Result<(), ConnectorError> {
        if units.is_empty() {
            return Ok(());
        }
        self.tx
            .send(PushedContent {
                south_id: self.south_id.clone(),
                item_id: item_id.map(str::to_string),
                units,
            })
            .await
            .map_err(|_| ConnectorError::Cancelled)
    }
}

/// Splits `(start, end]` into consecutive windows no longer than `max_interval`.
pub fn generate_intervals(start: Instant, end: Instant, max_interval: Duration) -> Vec<(Instant, Instant)> {
    if start >= end {
        return Vec::new();
    }
    let Ok(step) = chrono::Duration::from_std(max_interval) else {
        return vec![(start, end)];
    };
    if step <= chrono::Duration::zero() || end - start <= step {
        return vec![(start, end)];
    }
    let mut intervals = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + step).min(end);
        intervals.push((cursor, next));
        cursor = next;
    }
    intervals
}

pub struct AcquisitionContext<'a> {
    pub south_id: &'a str,
    pub scan_mode_id: &'a str,
    pub history: &'a HistorySettings,
    pub checkpoints: &'a CheckpointStore,
    pub router: &'a CacheRouter,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub units: usize,
    pub entries: usize,
    pub checkpoint: Option<Instant>,
}

/// Runs one acquisition for `item` up to `now`.
pub async fn acquire_item(
    ctx: &AcquisitionContext<'_>,
    adapter: &mut dyn SouthAdapter,
    item: &SouthItemConfig,
    now: Instant,
) -> Result<AcquisitionReport, AcquisitionError> {
    let key = CheckpointKey::new(ctx.south_id, ctx.scan_mode_id, item.id.as_str());
    let stored = ctx.checkpoints.get(&key)?;
    let mut since = stored.unwrap_or_else(|| now - chrono::Duration::hours(1));
    let mut report = AcquisitionReport {
        checkpoint: stored,
        ..Default::default()
    };

    let intervals = generate_intervals(
        since,
        now,
        Duration::from_secs(ctx.history.max_read_interval),
    );
    let read_delay = Duration::from_millis(ctx.history.read_delay);
    for (idx, (start, end)) in intervals.into_iter().enumerate() {
        if idx > 0 && !read_delay.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ConnectorError::Cancelled.into()),
                _ = tokio::time::sleep(read_delay) => {}
            }
        }
        // Intervals after the first start where the previous read left the checkpoint.
        let window_start = start.max(since);
        let units = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ConnectorError::Cancelled.into()),
            res = adapter.acquire(item, window_start, end) => res?,
        };
        if units.is_empty() {
            tracing::debug!(south = %ctx.south_id, item = %item.id, "no new content");
            continue;
        }

        let newest = units.iter().filter_map(ContentUnit::instant).max();
        let count = units.len();
        let source = CacheSource::south(ctx.south_id, Some(item.id.clone()));
        let entries = ctx.router.cache_content(&source, Content::group(units.clone()))?;
        report.units += count;
        report.entries += entries;

        if let Some(newest) = newest {
            let stored = ctx.checkpoints.advance(&key, &newest)?;
            report.checkpoint = Some(stored);
            since = stored;
        }
        tracing::debug!(south = %ctx.south_id, item = %item.id, units = count, entries, "content acquired");
        adapter.committed(item, &units).await;
    }
    Ok(report)
}
