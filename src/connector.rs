//! Runtime wrapper around one South or North adapter: lifecycle state, health counters
//! and the serialized tick entry points called by the scheduler.

use crate::cache::{run_dispatch_cycle, CacheRouter, DispatchSettings, NorthCache, RouteTarget};
use crate::checkpoint::CheckpointStore;
use crate::config::{NorthConnectorConfig, RetryPolicy, SouthConnectorConfig};
use crate::error::{AcquisitionError, ConnectorError};
use crate::model::Instant;
use crate::north::NorthAdapter;
use crate::south::{acquire_item, AcquisitionContext, ContentSink, PushedContent, SouthAdapter};
use crate::transformer::TransformerRegistry;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorState {
    Created,
    Starting,
    Running,
    Errored,
    Stopping,
    Stopped,
}

impl ConnectorState {
    pub fn can_transition_to(self, next: ConnectorState) -> bool {
        use ConnectorState::*;
        matches!(
            (self, next),
            (Created | Stopped, Starting)
                | (Starting, Running | Errored | Stopping)
                | (Running, Errored | Stopping)
                | (Errored, Running | Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Whether scheduled ticks should do work in this state.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectorState::Running | ConnectorState::Errored)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectorState,
    pub last_error: Option<String>,
    pub consecutive_failures: u64,
    pub last_success_at: Option<Instant>,
}

#[derive(Debug)]
pub struct ConnectorStatus {
    state: Mutex<ConnectorState>,
    consecutive_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_success_at: Mutex<Option<Instant>>,
}

impl ConnectorStatus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectorState::Created),
            consecutive_failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_success_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectorState {
        *lock(&self.state)
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(&self, next: ConnectorState) -> bool {
        let mut state = lock(&self.state);
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
        let mut state = lock(&self.state);
        if *state == ConnectorState::Running {
            *state = ConnectorState::Errored;
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
        if let Ok(mut guard) = self.last_success_at.lock() {
            *guard = Some(Utc::now());
        }
        let mut state = lock(&self.state);
        if *state == ConnectorState::Errored {
            *state = ConnectorState::Running;
        }
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            last_error: lock(&self.last_error).clone(),
            consecutive_failures: self.consecutive_failures(),
            last_success_at: *lock(&self.last_success_at),
        }
    }
}

impl Default for ConnectorStatus {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared services a South connector writes through.
#[derive(Clone)]
pub struct SouthDeps {
    pub checkpoints: Arc<CheckpointStore>,
    pub router: Arc<CacheRouter>,
    /// Global cap on concurrent acquisitions.
    pub permits: Arc<Semaphore>,
    pub push_tx: mpsc::Sender<PushedContent>,
}

pub struct SouthConnector {
    config: SouthConnectorConfig,
    adapter: AsyncMutex<Box<dyn SouthAdapter>>,
    deps: SouthDeps,
    status: ConnectorStatus,
    cancel: Mutex<CancellationToken>,
    connected: AtomicBool,
    push_mode: AtomicBool,
    /// Scan modes with a tick running or waiting for the adapter.
    scans: Mutex<HashSet<String>>,
}

/// Marks a scan mode busy until dropped.
struct ScanClaim<'a> {
    scans: &'a Mutex<HashSet<String>>,
    scan_mode_id: String,
}

impl<'a> ScanClaim<'a> {
    fn take(scans: &'a Mutex<HashSet<String>>, scan_mode_id: &str) -> Option<Self> {
        lock(scans).insert(scan_mode_id.to_string()).then(|| ScanClaim {
            scans,
            scan_mode_id: scan_mode_id.to_string(),
        })
    }
}

impl Drop for ScanClaim<'_> {
    fn drop(&mut self) {
        lock(self.scans).remove(&self.scan_mode_id);
    }
}

impl SouthConnector {
    pub fn new(config: SouthConnectorConfig, adapter: Box<dyn SouthAdapter>, deps: SouthDeps) -> Self {
        Self {
            config,
            adapter: AsyncMutex::new(adapter),
            deps,
            status: ConnectorStatus::new(),
            cancel: Mutex::new(CancellationToken::new()),
            connected: AtomicBool::new(false),
            push_mode: AtomicBool::new(false),
            scans: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &SouthConnectorConfig {
        &self.config
    }

    pub fn status(&self) -> &ConnectorStatus {
        &self.status
    }

    pub fn is_push_mode(&self) -> bool {
        self.push_mode.load(Ordering::Relaxed)
    }

    /// Scan modes referenced by enabled items, in item order.
    pub fn scan_mode_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for item in self.config.items.iter().filter(|item| item.enabled) {
            if !ids.contains(&item.scan_mode_id) {
                ids.push(item.scan_mode_id.clone());
            }
        }
        ids
    }

    fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    pub async fn start(&self, parent: &CancellationToken) {
        if !self.status.transition(ConnectorState::Starting) {
            tracing::warn!(south = %self.config.id, state = ?self.status.state(), "start ignored");
            return;
        }
        *lock(&self.cancel) = parent.child_token();

        let mut adapter = self.adapter.lock().await;
        if let Err(err) = adapter.connect().await {
            self.status.transition(ConnectorState::Errored);
            self.status.record_error(err.to_string());
            tracing::warn!(south = %self.config.id, error = %err, "south connect failed; retrying on next tick");
            return;
        }
        self.connected.store(true, Ordering::Relaxed);

        let items: Vec<_> = self.config.items.iter().filter(|item| item.enabled).cloned().collect();
        let sink = ContentSink::new(self.config.id.clone(), self.deps.push_tx.clone());
        match adapter.subscribe(&items, sink).await {
            Ok(push) => self.push_mode.store(push, Ordering::Relaxed),
            Err(err) => {
                self.status.transition(ConnectorState::Errored);
                self.status.record_error(err.to_string());
                tracing::warn!(south = %self.config.id, error = %err, "south subscription failed");
                return;
            }
        }
        self.status.transition(ConnectorState::Running);
        tracing::info!(south = %self.config.id, kind = %self.config.kind, push = self.is_push_mode(), "south connector started");
    }

    /// One acquisition tick for every enabled item on `scan_mode_id`.
    ///
    /// Ticks of different scan modes queue on the adapter in arrival order. A tick whose
    /// scan mode is already running or queued is skipped.
    pub async fn run_scan(&self, scan_mode_id: &str) {
        if !self.status.state().is_active() {
            return;
        }
        let Some(_claim) = ScanClaim::take(&self.scans, scan_mode_id) else {
            tracing::warn!(south = %self.config.id, scan_mode = %scan_mode_id, "previous acquisition for this scan mode still running; tick skipped");
            return;
        };
        let cancel = self.cancel_token();
        let mut adapter = tokio::select! {
            _ = cancel.cancelled() => return,
            adapter = self.adapter.lock() => adapter,
        };
        if cancel.is_cancelled() || !self.status.state().is_active() {
            return;
        }
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = self.deps.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        if !self.connected.load(Ordering::Relaxed) {
            adapter.disconnect().await;
            if let Err(err) = adapter.connect().await {
                self.status.record_error(err.to_string());
                tracing::warn!(south = %self.config.id, error = %err, "south reconnect failed");
                return;
            }
            self.connected.store(true, Ordering::Relaxed);
        }

        let ctx = AcquisitionContext {
            south_id: &self.config.id,
            scan_mode_id,
            history: &self.config.history,
            checkpoints: &self.deps.checkpoints,
            router: &self.deps.router,
            cancel: &cancel,
        };
        let mut failure = None;
        let items = self
            .config
            .items
            .iter()
            .filter(|item| item.enabled && item.scan_mode_id == scan_mode_id);
        for item in items {
            match acquire_item(&ctx, &mut **adapter, item, Utc::now()).await {
                Ok(report) => {
                    tracing::debug!(south = %self.config.id, item = %item.id, units = report.units, entries = report.entries, "item acquired");
                }
                Err(AcquisitionError::Connector(ConnectorError::Cancelled)) => return,
                Err(err) => {
                    if matches!(err, AcquisitionError::Connector(ConnectorError::Connection(_))) {
                        self.connected.store(false, Ordering::Relaxed);
                    }
                    tracing::warn!(south = %self.config.id, item = %item.id, error = %err, "acquisition failed");
                    failure = Some(err.to_string());
                }
            }
        }
        match failure {
            Some(err) => self.status.record_error(err),
            None => self.status.record_success(),
        }
    }

    /// Cancels in-flight work and tears the adapter down, waiting at most `grace`.
    pub async fn stop(&self, grace: Duration) {
        if !self.status.transition(ConnectorState::Stopping) {
            return;
        }
        self.cancel_token().cancel();
        match tokio::time::timeout(grace, self.adapter.lock()).await {
            Ok(mut adapter) => adapter.disconnect().await,
            Err(_) => {
                tracing::warn!(south = %self.config.id, "adapter did not yield in time; abandoning in-flight acquisition");
            }
        }
        self.connected.store(false, Ordering::Relaxed);
        self.push_mode.store(false, Ordering::Relaxed);
        self.status.transition(ConnectorState::Stopped);
        tracing::info!(south = %self.config.id, "south connector stopped");
    }
}

/// Shared services a North connector dispatches through.
#[derive(Clone)]
pub struct NorthDeps {
    pub transformers: Arc<TransformerRegistry>,
    pub router: Arc<CacheRouter>,
}

pub struct NorthConnector {
    config: NorthConnectorConfig,
    adapter: AsyncMutex<Box<dyn NorthAdapter>>,
    cache: Arc<NorthCache>,
    policy: RetryPolicy,
    settings: DispatchSettings,
    deps: NorthDeps,
    status: ConnectorStatus,
    cancel: Mutex<CancellationToken>,
    connected: AtomicBool,
}

impl NorthConnector {
    pub fn new(
        config: NorthConnectorConfig,
        adapter: Box<dyn NorthAdapter>,
        cache: Arc<NorthCache>,
        policy: RetryPolicy,
        deps: NorthDeps,
    ) -> Self {
        let settings = DispatchSettings::from_config(&config);
        Self {
            config,
            adapter: AsyncMutex::new(adapter),
            cache,
            policy,
            settings,
            deps,
            status: ConnectorStatus::new(),
            cancel: Mutex::new(CancellationToken::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &NorthConnectorConfig {
        &self.config
    }

    pub fn status(&self) -> &ConnectorStatus {
        &self.status
    }

    pub fn cache(&self) -> &Arc<NorthCache> {
        &self.cache
    }

    fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    /// Connects the adapter and starts receiving content from subscribed Souths.
    ///
    /// Content is cached even while the destination is unreachable.
    pub async fn start(&self, parent: &CancellationToken) {
        if !self.status.transition(ConnectorState::Starting) {
            tracing::warn!(north = %self.config.id, state = ?self.status.state(), "start ignored");
            return;
        }
        *lock(&self.cancel) = parent.child_token();
        self.deps.router.attach(
            &self.config.id,
            RouteTarget {
                cache: self.cache.clone(),
                bindings: self.config.transformers.clone(),
            },
        );

        let mut adapter = self.adapter.lock().await;
        match adapter.connect().await {
            Ok(()) => {
                self.connected.store(true, Ordering::Relaxed);
                self.status.transition(ConnectorState::Running);
                tracing::info!(north = %self.config.id, kind = %self.config.kind, "north connector started");
            }
            Err(err) => {
                self.status.transition(ConnectorState::Errored);
                self.status.record_error(err.to_string());
                tracing::warn!(north = %self.config.id, error = %err, "north connect failed; retrying on next tick");
            }
        }
    }

    /// One dispatch cycle.
    pub async fn run_dispatch(&self) {
        if !self.status.state().is_active() {
            return;
        }
        let Ok(mut adapter) = self.adapter.try_lock() else {
            tracing::warn!(north = %self.config.id, "previous dispatch still running; tick skipped");
            return;
        };
        let cancel = self.cancel_token();

        if !self.connected.load(Ordering::Relaxed) {
            adapter.disconnect().await;
            if let Err(err) = adapter.connect().await {
                self.status.record_error(err.to_string());
                tracing::warn!(north = %self.config.id, error = %err, "north reconnect failed");
                return;
            }
            self.connected.store(true, Ordering::Relaxed);
        }

        let outcome = run_dispatch_cycle(
            &self.cache,
            &mut **adapter,
            &self.deps.transformers,
            &self.policy,
            &self.settings,
            &cancel,
        )
        .await;
        match outcome {
            Ok(report) => {
                if report.sent > 0 {
                    tracing::info!(north = %self.config.id, entries = report.sent, bytes = report.bytes, batches = report.batches, "content sent");
                }
                match report.failure {
                    Some(ConnectorError::Cancelled) => {}
                    Some(err) => {
                        if matches!(err, ConnectorError::Connection(_)) {
                            self.connected.store(false, Ordering::Relaxed);
                        }
                        self.status.record_error(err.to_string());
                    }
                    None => self.status.record_success(),
                }
            }
            Err(err) => {
                tracing::error!(north = %self.config.id, error = %err, "dispatch cycle aborted by cache failure");
                self.status.record_error(err.to_string());
            }
        }
    }

    /// Stops receiving content, cancels in-flight sends and tears the adapter down.
    ///
    /// Cached entries stay on disk.
    pub async fn stop(&self, grace: Duration) {
        if !self.status.transition(ConnectorState::Stopping) {
            return;
        }
        self.deps.router.detach(&self.config.id);
        self.cancel_token().cancel();
        match tokio::time::timeout(grace, self.adapter.lock()).await {
            Ok(mut adapter) => adapter.disconnect().await,
            Err(_) => {
                tracing::warn!(north = %self.config.id, "adapter did not yield in time; abandoning in-flight send");
            }
        }
        self.connected.store(false, Ordering::Relaxed);
        self.status.transition(ConnectorState::Stopped);
        tracing::info!(north = %self.config.id, "north connector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HistorySettings, SouthItemConfig};
    use crate::model::ContentUnit;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Counts reads per item and holds the adapter for a while on each one.
    struct SlowSouth {
        reads: Arc<Mutex<HashMap<String, usize>>>,
    }

    #[async_trait]
    impl SouthAdapter for SlowSouth {
        async fn connect(&mut self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn acquire(
            &mut self,
            item: &SouthItemConfig,
            _since: Instant,
            _until: Instant,
        ) -> Result<Vec<ContentUnit>, ConnectorError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            *self.reads.lock().unwrap().entry(item.id.clone()).or_default() += 1;
            Ok(Vec::new())
        }

        async fn disconnect(&mut self) {}
    }

    fn south_item(id: &str, scan_mode_id: &str) -> SouthItemConfig {
        SouthItemConfig {
            id: id.to_string(),
            name: id.to_string(),
            south_id: "south-1".to_string(),
            enabled: true,
            scan_mode_id: scan_mode_id.to_string(),
            settings: serde_json::Value::Null,
        }
    }

    fn slow_south(reads: Arc<Mutex<HashMap<String, usize>>>) -> (SouthConnector, mpsc::Receiver<PushedContent>) {
        let config = SouthConnectorConfig {
            id: "south-1".to_string(),
            name: "south-1".to_string(),
            kind: "slow".to_string(),
            enabled: true,
            settings: serde_json::Value::Null,
            history: HistorySettings::default(),
            items: vec![south_item("fast-item", "every-second"), south_item("slow-item", "every-hour")],
        };
        let (push_tx, push_rx) = mpsc::channel(4);
        let deps = SouthDeps {
            checkpoints: Arc::new(CheckpointStore::open_in_memory().unwrap()),
            router: Arc::new(CacheRouter::new(Arc::new(TransformerRegistry::builtin()), &[])),
            permits: Arc::new(Semaphore::new(4)),
            push_tx,
        };
        (SouthConnector::new(config, Box::new(SlowSouth { reads }), deps), push_rx)
    }

    fn reads_of(reads: &Arc<Mutex<HashMap<String, usize>>>, item: &str) -> usize {
        reads.lock().unwrap().get(item).copied().unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_of_other_scan_modes_wait_while_same_mode_overlaps_are_skipped() {
        let reads = Arc::new(Mutex::new(HashMap::new()));
        let (south, _push_rx) = slow_south(reads.clone());
        south.start(&CancellationToken::new()).await;
        assert_eq!(south.status().state(), ConnectorState::Running);

        tokio::join!(
            south.run_scan("every-second"),
            south.run_scan("every-hour"),
            south.run_scan("every-second"),
        );
        assert_eq!(reads_of(&reads, "fast-item"), 1);
        assert_eq!(reads_of(&reads, "slow-item"), 1);

        south.run_scan("every-second").await;
        assert_eq!(reads_of(&reads, "fast-item"), 2);
        assert_eq!(reads_of(&reads, "slow-item"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_tick_is_dropped_when_the_connector_stops() {
        let reads = Arc::new(Mutex::new(HashMap::new()));
        let (south, _push_rx) = slow_south(reads.clone());
        south.start(&CancellationToken::new()).await;

        tokio::join!(
            south.run_scan("every-second"),
            south.run_scan("every-hour"),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                south.stop(Duration::from_secs(1)).await;
            },
        );
        assert_eq!(reads_of(&reads, "slow-item"), 0);
        assert_eq!(south.status().state(), ConnectorState::Stopped);
    }

    #[test]
    fn state_machine_allows_documented_transitions_only() {
        use ConnectorState::*;
        assert!(Created.can_transition_to(Starting));
        assert!(Running.can_transition_to(Errored));
        assert!(Errored.can_transition_to(Running));
        assert!(Stopped.can_transition_to(Starting));
        assert!(!Created.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn failures_flip_running_to_errored_and_success_recovers() {
        let status = ConnectorStatus::new();
        assert!(status.transition(ConnectorState::Starting));
        assert!(status.transition(ConnectorState::Running));

        status.record_error("connection refused");
        status.record_error("connection refused");
        let snapshot = status.snapshot();
        assert_eq!(snapshot.state, ConnectorState::Errored);
        assert_eq!(snapshot.consecutive_failures, 2);
        assert_eq!(snapshot.last_error.as_deref(), Some("connection refused"));

        status.record_success();
        let snapshot = status.snapshot();
        assert_eq!(snapshot.state, ConnectorState::Running);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.last_success_at.is_some());
    }

    #[test]
    fn errors_before_start_do_not_change_state() {
        let status = ConnectorStatus::new();
        status.record_error("boom");
        assert_eq!(status.state(), ConnectorState::Created);
    }
}
