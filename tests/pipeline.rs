use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use oibus_engine::adapters::AdapterRegistry;
use oibus_engine::checkpoint::{CheckpointKey, CheckpointStore};
use oibus_engine::config::{
    ArchiveSettings, CachingSettings, EngineConfig, EngineTopology, ErrorStoreSettings, HistorySettings,
    NorthConnectorConfig, ScanModeConfig, SouthConnectorConfig, SouthItemConfig, Subscription,
};
use oibus_engine::connector::ConnectorState;
use oibus_engine::error::{ConnectorError, EngineError};
use oibus_engine::model::{CacheSearchParam, CacheSource, CacheStore, Content, ContentType, ContentUnit, TimeValue};
use oibus_engine::north::{NorthAdapter, OutgoingContent};
use oibus_engine::south::SouthAdapter;
use oibus_engine::engine::Engine;
use oibus_engine::transformer::TransformerRegistry;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn at(minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, second).unwrap()
}

struct MockSouth {
    values: Vec<TimeValue>,
}

#[async_trait]
impl SouthAdapter for MockSouth {
    async fn connect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn acquire(
        &mut self,
        _item: &SouthItemConfig,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ContentUnit>, ConnectorError> {
        Ok(self
            .values
            .iter()
            .filter(|value| value.timestamp > since && value.timestamp <= until)
            .cloned()
            .map(ContentUnit::TimeValue)
            .collect())
    }

    async fn disconnect(&mut self) {}
}

#[derive(Default)]
struct NorthLog {
    sent: Vec<Vec<OutgoingContent>>,
    reject: bool,
}

struct MockNorth {
    log: Arc<Mutex<NorthLog>>,
}

#[async_trait]
impl NorthAdapter for MockNorth {
    fn accepts(&self) -> &[ContentType] {
        &[ContentType::TimeValues]
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn send(&mut self, batch: &[OutgoingContent], _timeout: Duration) -> Result<(), ConnectorError> {
        let mut log = self.log.lock().unwrap();
        if log.reject {
            return Err(ConnectorError::rejected(400, "malformed payload"));
        }
        log.sent.push(batch.to_vec());
        Ok(())
    }

    async fn disconnect(&mut self) {}
}

struct Harness {
    _dir: TempDir,
    engine: Arc<Engine>,
    log: Arc<Mutex<NorthLog>>,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        data_dir: dir.path().to_path_buf(),
        config_file: dir.path().join("engine.json"),
        http_bind: "127.0.0.1:0".to_string(),
        max_concurrent_acquisitions: 2,
        shutdown_grace: Duration::from_secs(2),
        sweep_interval: Duration::from_secs(3600),
    };
    let topology = EngineTopology {
        scan_modes: vec![ScanModeConfig {
            id: "yearly".into(),
            name: "Yearly".into(),
            cron_expression: "0 0 0 1 1 *".into(),
        }],
        south: vec![SouthConnectorConfig {
            id: "s1".into(),
            name: String::new(),
            kind: "mock".into(),
            enabled: true,
            settings: serde_json::Value::Null,
            history: HistorySettings::default(),
            items: vec![SouthItemConfig {
                id: "temperature".into(),
                name: String::new(),
                south_id: String::new(),
                enabled: true,
                scan_mode_id: "yearly".into(),
                settings: serde_json::Value::Null,
            }],
        }],
        north: vec![NorthConnectorConfig {
            id: "n1".into(),
            name: String::new(),
            kind: "mock".into(),
            enabled: true,
            settings: serde_json::Value::Null,
            caching: CachingSettings {
                scan_mode_id: "yearly".into(),
                group_count: 10,
                max_send_count: 100,
                retry_interval: 0,
                retry_count: 0,
                timeout: 1_000,
                max_size_mb: 0,
                max_batch_bytes: 0,
                error: ErrorStoreSettings::default(),
            },
            archive: ArchiveSettings {
                enabled: true,
                retention_duration: 72,
            },
            transformers: Vec::new(),
        }],
        subscriptions: vec![Subscription {
            north_id: "n1".into(),
            south_id: "s1".into(),
        }],
        retry_policies: Default::default(),
    };

    let log = Arc::new(Mutex::new(NorthLog::default()));
    let mut adapters = AdapterRegistry::empty();
    adapters.register_south("mock", |_, _| {
        Ok(Box::new(MockSouth {
            values: vec![
                TimeValue::new("temperature", at(0, 5), serde_json::json!(21.5)),
                TimeValue::new("temperature", at(0, 10), serde_json::json!(21.7)),
            ],
        }) as Box<dyn SouthAdapter>)
    });
    let north_log = log.clone();
    adapters.register_north("mock", move |_| {
        Ok(Box::new(MockNorth {
            log: north_log.clone(),
        }) as Box<dyn NorthAdapter>)
    });

    let checkpoints = Arc::new(CheckpointStore::open_in_memory().unwrap());
    let engine = Engine::new(config, topology, adapters, TransformerRegistry::builtin(), checkpoints).unwrap();
    Harness { _dir: dir, engine, log }
}

fn checkpoint_key() -> CheckpointKey {
    CheckpointKey::new("s1", "yearly", "temperature")
}

#[tokio::test]
async fn scan_caches_new_values_and_advances_the_checkpoint() {
    let h = harness();
    h.engine.checkpoints().advance(&checkpoint_key(), &at(0, 0)).unwrap();
    h.engine.start_north("n1").await.unwrap();
    h.engine.start_south("s1").await.unwrap();

    h.engine.south("s1").unwrap().run_scan("yearly").await;

    let pending = h
        .engine
        .list_cache_content("n1", CacheStore::Pending, &CacheSearchParam::default())
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].metadata.number_of_element, 2);
    assert_eq!(pending[0].metadata.content_type, ContentType::TimeValues);
    assert_eq!(
        h.engine.checkpoints().get(&checkpoint_key()).unwrap(),
        Some(at(0, 10))
    );

    // Nothing newer than the checkpoint: no second entry.
    h.engine.south("s1").unwrap().run_scan("yearly").await;
    let pending = h
        .engine
        .list_cache_content("n1", CacheStore::Pending, &CacheSearchParam::default())
        .unwrap();
    assert_eq!(pending.len(), 1);

    h.engine.north("n1").unwrap().run_dispatch().await;
    {
        let log = h.log.lock().unwrap();
        assert_eq!(log.sent.len(), 1);
        match &log.sent[0][0].content {
            Content::TimeValues(values) => assert_eq!(values.len(), 2),
            other => panic!("unexpected content {other:?}"),
        }
    }
    let stats = h.engine.north("n1").unwrap().cache().stats();
    assert_eq!(stats.pending.count, 0);
    assert_eq!(stats.archive.count, 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn rejected_content_can_be_retried_from_the_error_store() {
    let h = harness();
    h.engine.checkpoints().advance(&checkpoint_key(), &at(0, 0)).unwrap();
    h.engine.start_north("n1").await.unwrap();
    h.engine.start_south("s1").await.unwrap();
    h.engine.south("s1").unwrap().run_scan("yearly").await;

    h.log.lock().unwrap().reject = true;
    let north = h.engine.north("n1").unwrap();
    north.run_dispatch().await;
    assert_eq!(north.cache().stats().error.count, 1);
    assert_eq!(north.status().state(), ConnectorState::Errored);

    h.log.lock().unwrap().reject = false;
    assert_eq!(h.engine.retry_all_error_content("n1").unwrap(), 1);
    assert_eq!(north.cache().stats().pending.count, 1);

    north.run_dispatch().await;
    assert_eq!(h.log.lock().unwrap().sent.len(), 1);
    assert_eq!(north.cache().stats().error.count, 0);
    assert_eq!(north.status().state(), ConnectorState::Running);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn status_reports_every_connector() {
    let h = harness();
    h.engine.start_north("n1").await.unwrap();

    let status = h.engine.status();
    assert_eq!(status.south.len(), 1);
    assert_eq!(status.south[0].status.state, ConnectorState::Created);
    assert_eq!(status.north[0].status.state, ConnectorState::Running);
    assert!(status.north[0].cache.is_some());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["north"][0]["type"], "mock");
    assert_eq!(json["north"][0]["state"], "RUNNING");

    h.engine.shutdown().await;
}

#[tokio::test]
async fn stopped_south_ignores_ticks() {
    let h = harness();
    h.engine.checkpoints().advance(&checkpoint_key(), &at(0, 0)).unwrap();
    h.engine.start_north("n1").await.unwrap();
    h.engine.start_south("s1").await.unwrap();
    h.engine.stop_south("s1").await.unwrap();

    let south = h.engine.south("s1").unwrap();
    assert_eq!(south.status().state(), ConnectorState::Stopped);
    south.run_scan("yearly").await;
    assert_eq!(h.engine.north("n1").unwrap().cache().stats().pending.count, 0);

    // A stopped connector can be started again.
    h.engine.start_south("s1").await.unwrap();
    assert_eq!(south.status().state(), ConnectorState::Running);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn delete_south_purges_checkpoints_on_request() {
    let h = harness();
    h.engine.checkpoints().advance(&checkpoint_key(), &at(0, 0)).unwrap();
    h.engine.start_south("s1").await.unwrap();

    h.engine.delete_south("s1", true).await.unwrap();

    assert!(matches!(
        h.engine.south("s1"),
        Err(EngineError::UnknownConnector { role: "south", .. })
    ));
    assert!(h.engine.checkpoints().list_for_south("s1").unwrap().is_empty());
}

#[tokio::test]
async fn delete_north_keeps_cache_unless_purged() {
    let h = harness();
    h.engine.checkpoints().advance(&checkpoint_key(), &at(0, 0)).unwrap();
    h.engine.start_north("n1").await.unwrap();
    h.engine.start_south("s1").await.unwrap();
    h.engine.south("s1").unwrap().run_scan("yearly").await;

    let root = h.engine.north("n1").unwrap().cache().root().to_path_buf();
    h.engine.delete_north("n1", false).await.unwrap();
    assert!(root.exists());
    assert!(h.engine.north("n1").is_err());

    let h = harness();
    h.engine.start_north("n1").await.unwrap();
    let root = h.engine.north("n1").unwrap().cache().root().to_path_buf();
    h.engine.delete_north("n1", true).await.unwrap();
    assert!(!root.exists());
}

#[tokio::test]
async fn external_content_is_cached_for_one_north_and_dispatched() {
    let h = harness();
    h.engine.start_north("n1").await.unwrap();

    let content = Content::TimeValues(vec![TimeValue::new("manual", at(1, 0), serde_json::json!(42))]);
    let entry = h.engine.add_external_content("n1", content).unwrap();
    assert_eq!(entry.metadata.source, CacheSource::External);
    assert_eq!(entry.metadata.number_of_element, 1);

    let pending = h
        .engine
        .list_cache_content("n1", CacheStore::Pending, &CacheSearchParam::default())
        .unwrap();
    assert_eq!(pending, vec![entry]);

    h.engine.north("n1").unwrap().run_dispatch().await;
    let log = h.log.lock().unwrap();
    assert_eq!(log.sent.len(), 1);
    assert_eq!(log.sent[0][0].entry.metadata.source, CacheSource::External);
    drop(log);

    let missing = Content::TimeValues(Vec::new());
    assert!(matches!(
        h.engine.add_external_content("n2", missing),
        Err(EngineError::UnknownConnector { .. })
    ));
    h.engine.shutdown().await;
}
