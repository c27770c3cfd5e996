//! Connector registry: owns every South and North instance, wires them to the scheduler
//! and the cache router, and exposes the operator actions on North caches.

use crate::adapters::AdapterRegistry;
use crate::cache::{sweep_north, CacheRouter, CacheStats, NorthCache};
use crate::checkpoint::CheckpointStore;
use crate::config::{EngineConfig, EngineTopology, NorthConnectorConfig, RetryPolicy, SouthConnectorConfig};
use crate::connector::{NorthConnector, NorthDeps, SouthConnector, SouthDeps, StatusSnapshot};
use crate::error::{ConfigError, EngineError};
use crate::model::{CacheEntry, CacheSearchParam, CacheSource, CacheStore, Content, Instant};
use crate::scan_mode::ScanModeRegistry;
use crate::scheduler::{Job, JobRunner, Scheduler};
use crate::south::PushedContent;
use crate::transformer::TransformerRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const PUSH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorView {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub status: StatusSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub south: Vec<ConnectorView>,
    pub north: Vec<ConnectorView>,
}

pub struct Engine {
    config: EngineConfig,
    scan_modes: ScanModeRegistry,
    adapters: AdapterRegistry,
    transformers: Arc<TransformerRegistry>,
    checkpoints: Arc<CheckpointStore>,
    router: Arc<CacheRouter>,
    scheduler: Arc<Scheduler>,
    retry_policies: HashMap<String, RetryPolicy>,
    souths: RwLock<HashMap<String, Arc<SouthConnector>>>,
    norths: RwLock<HashMap<String, Arc<NorthConnector>>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    push_tx: mpsc::Sender<PushedContent>,
    push_rx: Mutex<Option<mpsc::Receiver<PushedContent>>>,
}

impl Engine {
    /// Validates `topology` and builds every configured connector in the `Created` state.
    pub fn new(
        config: EngineConfig,
        mut topology: EngineTopology,
        adapters: AdapterRegistry,
        transformers: TransformerRegistry,
        checkpoints: Arc<CheckpointStore>,
    ) -> Result<Arc<Self>, EngineError> {
        topology.normalize();
        topology.validate(&adapters)?;
        let scan_modes = ScanModeRegistry::from_configs(&topology.scan_modes)?;
        let transformers = Arc::new(transformers);
        let router = Arc::new(CacheRouter::new(transformers.clone(), &topology.subscriptions));
        let tracker = TaskTracker::new();
        let (push_tx, push_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);

        let engine = Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_acquisitions.max(1))),
            config,
            scan_modes,
            adapters,
            transformers,
            checkpoints,
            router,
            scheduler: Arc::new(Scheduler::new(tracker.clone())),
            retry_policies: topology.retry_policies.clone(),
            souths: RwLock::new(HashMap::new()),
            norths: RwLock::new(HashMap::new()),
            tracker,
            cancel: CancellationToken::new(),
            push_tx,
            push_rx: Mutex::new(Some(push_rx)),
        };
        for north in topology.north {
            engine.insert_north(north)?;
        }
        for south in topology.south {
            engine.insert_south(south)?;
        }
        Ok(Arc::new(engine))
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn north_cache_dir(&self, north_id: &str) -> PathBuf {
        self.config.cache_dir().join(format!("north-{north_id}"))
    }

    fn check_scan_mode(&self, scan_mode_id: &str, owner: String) -> Result<(), ConfigError> {
        if self.scan_modes.get(scan_mode_id).is_none() {
            return Err(ConfigError::UnknownScanMode {
                scan_mode: scan_mode_id.to_string(),
                owner,
            });
        }
        Ok(())
    }

    fn insert_south(&self, config: SouthConnectorConfig) -> Result<Arc<SouthConnector>, EngineError> {
        if read(&self.souths).contains_key(&config.id) {
            return Err(EngineError::ConnectorExists {
                role: "south",
                id: config.id,
            });
        }
        let adapter = self.adapters.build_south(&config, &self.checkpoints)?;
        let deps = SouthDeps {
            checkpoints: self.checkpoints.clone(),
            router: self.router.clone(),
            permits: self.permits.clone(),
            push_tx: self.push_tx.clone(),
        };
        let connector = Arc::new(SouthConnector::new(config, adapter, deps));
        write(&self.souths).insert(connector.id().to_string(), connector.clone());
        Ok(connector)
    }

    fn insert_north(&self, config: NorthConnectorConfig) -> Result<Arc<NorthConnector>, EngineError> {
        if read(&self.norths).contains_key(&config.id) {
            return Err(EngineError::ConnectorExists {
                role: "north",
                id: config.id,
            });
        }
        let adapter = self.adapters.build_north(&config)?;
        let cache = Arc::new(NorthCache::open(
            &config.id,
            self.north_cache_dir(&config.id),
            config.caching.max_size_bytes(),
        )?);
        let policy = self.retry_policies.get(&config.kind).cloned().unwrap_or_default();
        let deps = NorthDeps {
            transformers: self.transformers.clone(),
            router: self.router.clone(),
        };
        let connector = Arc::new(NorthConnector::new(config, adapter, cache, policy, deps));
        write(&self.norths).insert(connector.id().to_string(), connector.clone());
        Ok(connector)
    }

    /// Registers a new South at runtime. It stays `Created` until started.
    pub fn add_south(&self, mut config: SouthConnectorConfig) -> Result<(), EngineError> {
        if !self.adapters.has_south(&config.kind) {
            return Err(ConfigError::UnknownType {
                role: "south",
                kind: config.kind,
            }
            .into());
        }
        for item in &mut config.items {
            item.south_id = config.id.clone();
            if item.name.is_empty() {
                item.name = item.id.clone();
            }
            self.check_scan_mode(&item.scan_mode_id, format!("south item {}/{}", config.id, item.id))?;
        }
        self.insert_south(config)?;
        Ok(())
    }

    /// Registers a new North at runtime. Content already cached for its id is recovered.
    pub fn add_north(&self, config: NorthConnectorConfig) -> Result<(), EngineError> {
        if !self.adapters.has_north(&config.kind) {
            return Err(ConfigError::UnknownType {
                role: "north",
                kind: config.kind,
            }
            .into());
        }
        self.check_scan_mode(&config.caching.scan_mode_id, format!("north {}", config.id))?;
        if config.caching.group_count == 0 {
            return Err(ConfigError::InvalidGroupCount(config.id).into());
        }
        self.insert_north(config)?;
        Ok(())
    }

    pub fn south(&self, id: &str) -> Result<Arc<SouthConnector>, EngineError> {
        read(&self.souths)
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownConnector {
                role: "south",
                id: id.to_string(),
            })
    }

    pub fn north(&self, id: &str) -> Result<Arc<NorthConnector>, EngineError> {
        read(&self.norths)
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownConnector {
                role: "north",
                id: id.to_string(),
            })
    }

    pub async fn start_south(&self, id: &str) -> Result<(), EngineError> {
        let connector = self.south(id)?;
        connector.start(&self.cancel).await;
        if !connector.status().state().is_active() || connector.is_push_mode() {
            return Ok(());
        }
        for scan_mode_id in connector.scan_mode_ids() {
            if let Some(mode) = self.scan_modes.get(&scan_mode_id) {
                self.scheduler.register(
                    mode,
                    Job::South {
                        south_id: id.to_string(),
                        scan_mode_id,
                    },
                );
            }
        }
        Ok(())
    }

    pub async fn stop_south(&self, id: &str) -> Result<(), EngineError> {
        let connector = self.south(id)?;
        self.scheduler.deregister_south(id);
        connector.stop(self.config.shutdown_grace).await;
        Ok(())
    }

    /// Stops and forgets a South. Its checkpoints are dropped only when `purge_checkpoints`.
    pub async fn delete_south(&self, id: &str, purge_checkpoints: bool) -> Result<(), EngineError> {
        self.stop_south(id).await?;
        write(&self.souths).remove(id);
        if purge_checkpoints {
            let removed = self.checkpoints.delete_for_south(id)?;
            tracing::info!(south = %id, removed, "south checkpoints purged");
        }
        tracing::info!(south = %id, "south connector deleted");
        Ok(())
    }

    pub async fn start_north(&self, id: &str) -> Result<(), EngineError> {
        let connector = self.north(id)?;
        connector.start(&self.cancel).await;
        if !connector.status().state().is_active() {
            return Ok(());
        }
        let scan_mode_id = &connector.config().caching.scan_mode_id;
        if let Some(mode) = self.scan_modes.get(scan_mode_id) {
            self.scheduler.register(
                mode,
                Job::North {
                    north_id: id.to_string(),
                },
            );
        }
        Ok(())
    }

    pub async fn stop_north(&self, id: &str) -> Result<(), EngineError> {
        let connector = self.north(id)?;
        self.scheduler.deregister_north(id);
        connector.stop(self.config.shutdown_grace).await;
        Ok(())
    }

    /// Stops and forgets a North. Its cache stays on disk unless `purge_cache`.
    pub async fn delete_north(&self, id: &str, purge_cache: bool) -> Result<(), EngineError> {
        self.stop_north(id).await?;
        let removed = write(&self.norths).remove(id);
        if purge_cache {
            if let Some(connector) = removed {
                connector.cache().destroy()?;
                tracing::info!(north = %id, "north cache purged");
            }
        }
        tracing::info!(north = %id, "north connector deleted");
        Ok(())
    }

    pub fn list_cache_content(
        &self,
        north_id: &str,
        store: CacheStore,
        filter: &CacheSearchParam,
    ) -> Result<Vec<CacheEntry>, EngineError> {
        Ok(self.north(north_id)?.cache().list(store, filter)?)
    }

    pub fn move_cache_content(
        &self,
        north_id: &str,
        from: CacheStore,
        to: CacheStore,
        metadata_filenames: &[String],
    ) -> Result<usize, EngineError> {
        let moved = self
            .north(north_id)?
            .cache()
            .move_entries(from, to, metadata_filenames)?;
        Ok(moved.len())
    }

    pub fn remove_cache_content(
        &self,
        north_id: &str,
        store: CacheStore,
        metadata_filenames: &[String],
    ) -> Result<usize, EngineError> {
        Ok(self
            .north(north_id)?
            .cache()
            .remove_entries(store, metadata_filenames)?)
    }

    pub fn get_cache_file_content(
        &self,
        north_id: &str,
        store: CacheStore,
        content_file: &str,
    ) -> Result<Bytes, EngineError> {
        Ok(self.north(north_id)?.cache().get_content(store, content_file)?)
    }

    /// Caches content handed in from outside any South, straight into one North's pending
    /// store. Subscriptions do not apply.
    pub fn add_external_content(&self, north_id: &str, content: Content) -> Result<CacheEntry, EngineError> {
        let north = self.north(north_id)?;
        let entry = north
            .cache()
            .write(&content, CacheSource::External, serde_json::Value::Null)?;
        tracing::info!(north = %north_id, file = %entry.metadata.content_file, elements = entry.metadata.number_of_element, "external content cached");
        Ok(entry)
    }

    /// Requeues errored entries with a fresh retry budget.
    pub fn retry_error_content(&self, north_id: &str, metadata_filenames: &[String]) -> Result<usize, EngineError> {
        self.move_cache_content(north_id, CacheStore::Error, CacheStore::Pending, metadata_filenames)
    }

    pub fn retry_all_error_content(&self, north_id: &str) -> Result<usize, EngineError> {
        let moved = self
            .north(north_id)?
            .cache()
            .move_all(CacheStore::Error, CacheStore::Pending)?;
        Ok(moved.len())
    }

    pub fn remove_all_content(&self, north_id: &str, store: CacheStore) -> Result<usize, EngineError> {
        Ok(self.north(north_id)?.cache().remove_all(store)?)
    }

    /// Applies archive and error retention to every North cache.
    pub fn sweep_caches(&self, now: Instant) -> usize {
        let norths: Vec<Arc<NorthConnector>> = read(&self.norths).values().cloned().collect();
        let mut removed = 0;
        for north in norths {
            let config = north.config();
            match sweep_north(north.cache(), &config.archive, &config.caching.error, now) {
                Ok(report) => removed += report.archive_removed + report.error_removed,
                Err(err) => {
                    tracing::warn!(north = %north.id(), error = %err, "cache sweep failed");
                }
            }
        }
        removed
    }

    pub fn status(&self) -> EngineStatus {
        let mut south: Vec<ConnectorView> = read(&self.souths)
            .values()
            .map(|connector| ConnectorView {
                id: connector.id().to_string(),
                name: connector.config().name.clone(),
                kind: connector.config().kind.clone(),
                status: connector.status().snapshot(),
                cache: None,
            })
            .collect();
        let mut north: Vec<ConnectorView> = read(&self.norths)
            .values()
            .map(|connector| ConnectorView {
                id: connector.id().to_string(),
                name: connector.config().name.clone(),
                kind: connector.config().kind.clone(),
                status: connector.status().snapshot(),
                cache: Some(connector.cache().stats()),
            })
            .collect();
        south.sort_by(|a, b| a.id.cmp(&b.id));
        north.sort_by(|a, b| a.id.cmp(&b.id));
        EngineStatus { south, north }
    }

    /// Starts background tasks, then every enabled North and South.
    pub async fn start(self: &Arc<Self>) {
        let runner: Arc<dyn JobRunner> = self.clone();
        self.scheduler.clone().start(runner, self.cancel.clone());
        self.spawn_push_consumer();
        self.spawn_sweeper();

        let norths: Vec<String> = sorted_ids(&read(&self.norths), |c| c.config().enabled);
        for id in norths {
            if let Err(err) = self.start_north(&id).await {
                tracing::warn!(north = %id, error = %err, "failed to start north connector");
            }
        }
        let souths: Vec<String> = sorted_ids(&read(&self.souths), |c| c.config().enabled);
        for id in souths {
            if let Err(err) = self.start_south(&id).await {
                tracing::warn!(south = %id, error = %err, "failed to start south connector");
            }
        }
        tracing::info!(
            scan_modes = ?self.scheduler.scan_mode_ids(),
            "engine started"
        );
    }

    fn spawn_push_consumer(&self) {
        let Some(mut rx) = self.push_rx.lock().ok().and_then(|mut guard| guard.take()) else {
            return;
        };
        let router = self.router.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                let pushed = tokio::select! {
                    _ = cancel.cancelled() => break,
                    pushed = rx.recv() => match pushed {
                        Some(pushed) => pushed,
                        None => break,
                    },
                };
                let source = CacheSource::south(pushed.south_id.clone(), pushed.item_id);
                if let Err(err) = router.cache_content(&source, Content::group(pushed.units)) {
                    tracing::warn!(south = %pushed.south_id, error = %err, "failed to cache pushed content");
                }
            }
        });
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let engine = self.clone();
        let cancel = self.cancel.clone();
        let period = self.config.sweep_interval.max(Duration::from_secs(1));
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = engine.sweep_caches(Utc::now());
                        tracing::debug!(removed, "cache sweep done");
                    }
                }
            }
        });
    }

    /// Stops every connector, then waits for background tasks up to the shutdown grace.
    pub async fn shutdown(&self) {
        let grace = self.config.shutdown_grace;
        let souths: Vec<Arc<SouthConnector>> = read(&self.souths).values().cloned().collect();
        for south in &souths {
            self.scheduler.deregister_south(south.id());
        }
        futures::future::join_all(souths.iter().map(|south| south.stop(grace))).await;

        let norths: Vec<Arc<NorthConnector>> = read(&self.norths).values().cloned().collect();
        for north in &norths {
            self.scheduler.deregister_north(north.id());
        }
        futures::future::join_all(norths.iter().map(|north| north.stop(grace))).await;

        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!("background tasks still running after shutdown grace");
        }
        tracing::info!("engine stopped");
    }
}

#[async_trait]
impl JobRunner for Engine {
    async fn run(&self, job: Job) {
        match job {
            Job::South {
                south_id,
                scan_mode_id,
            } => {
                if let Ok(connector) = self.south(&south_id) {
                    connector.run_scan(&scan_mode_id).await;
                }
            }
            Job::North { north_id } => {
                if let Ok(connector) = self.north(&north_id) {
                    connector.run_dispatch().await;
                }
            }
        }
    }
}

fn sorted_ids<C>(map: &HashMap<String, Arc<C>>, keep: impl Fn(&C) -> bool) -> Vec<String> {
    let mut ids: Vec<String> = map
        .iter()
        .filter(|(_, connector)| keep(connector.as_ref()))
        .map(|(id, _)| id.clone())
        .collect();
    ids.sort();
    ids
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
