use crate::error::{CacheError, CacheResult};
use crate::model::{
    CacheEntry, CacheMetadata, CacheSearchParam, CacheSource, CacheStore, Content, Instant,
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const CONTENT_DIR: &str = "content";
const METADATA_DIR: &str = "metadata";
const RETRY_FILE: &str = "retry.json";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub count: usize,
    pub bytes: u64,
}

impl StoreStats {
    fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes = self.bytes.saturating_add(bytes);
    }

    fn sub(&mut self, bytes: u64) {
        self.count = self.count.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(bytes);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub pending: StoreStats,
    pub error: StoreStats,
    pub archive: StoreStats,
}

impl CacheStats {
    fn store_mut(&mut self, store: CacheStore) -> &mut StoreStats {
        match store {
            CacheStore::Pending => &mut self.pending,
            CacheStore::Error => &mut self.error,
            CacheStore::Archive => &mut self.archive,
        }
    }

    pub fn store(&self, store: CacheStore) -> StoreStats {
        match store {
            CacheStore::Pending => self.pending,
            CacheStore::Error => self.error,
            CacheStore::Archive => self.archive,
        }
    }
}

/// Retry bookkeeping persisted next to the stores so the retry bound holds across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryStateDisk {
    #[serde(default)]
    not_before: Option<Instant>,
    #[serde(default)]
    attempts: HashMap<String, u32>,
}

/// What [`NorthCache::fail`] did with a failed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Highest attempt count among the batch entries.
    pub attempts: u32,
    pub moved_to_error: usize,
    /// Set while some entries stay pending behind a backoff.
    pub not_before: Option<Instant>,
}

#[derive(Default)]
struct CacheState {
    queue: VecDeque<CacheEntry>,
    in_flight: HashSet<String>,
    retry: RetryStateDisk,
    stats: CacheStats,
    last_created_at: Option<Instant>,
}

impl CacheState {
    /// Strictly increasing creation time so FIFO order survives equal clock readings.
    fn next_created_at(&mut self) -> Instant {
        let now = Utc::now();
        let next = match self.last_created_at {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(next);
        next
    }

    fn remove_from_queue(&mut self, metadata_filename: &str) {
        self.queue
            .retain(|entry| entry.metadata_filename != metadata_filename);
    }

    /// Inserts by `createdAt`, never ahead of entries checked out for dispatch.
    fn insert_into_queue(&mut self, entry: CacheEntry) {
        let floor = self
            .queue
            .iter()
            .rposition(|queued| self.in_flight.contains(&queued.metadata_filename))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let idx = self
            .queue
            .iter()
            .skip(floor)
            .position(|queued| queued.metadata.created_at > entry.metadata.created_at)
            .map(|pos| pos + floor)
            .unwrap_or(self.queue.len());
        self.queue.insert(idx, entry);
    }
}

/// The pending/error/archive stores of one North connector.
///
/// Layout: `<root>/<store>/content/<file>` and `<root>/<store>/metadata/<uuid>.json`.
/// An entry is visible once its metadata file exists: writes commit content first and
/// metadata last, moves rename content then metadata, deletes remove metadata first.
pub struct NorthCache {
    north_id: String,
    root: PathBuf,
    max_size: Option<u64>,
    state: Mutex<CacheState>,
}

impl NorthCache {
    pub fn open(north_id: &str, root: impl Into<PathBuf>, max_size: Option<u64>) -> CacheResult<Self> {
        let root = root.into();
        for store in CacheStore::ALL {
            for sub in [CONTENT_DIR, METADATA_DIR] {
                let dir = root.join(store.as_str()).join(sub);
                fs::create_dir_all(&dir).map_err(CacheError::io(&dir))?;
            }
        }
        let cache = Self {
            north_id: north_id.to_string(),
            root,
            max_size,
            state: Mutex::new(CacheState::default()),
        };
        let recovered = cache.recover()?;
        *cache.lock() = recovered;

        let stats = cache.stats();
        if stats.pending.count > 0 {
            tracing::info!(north = %cache.north_id, count = stats.pending.count, bytes = stats.pending.bytes, "content in cache");
        } else {
            tracing::debug!(north = %cache.north_id, "no content in cache");
        }
        if stats.error.count > 0 {
            tracing::warn!(north = %cache.north_id, count = stats.error.count, "content errored");
        }
        Ok(cache)
    }

    pub fn north_id(&self) -> &str {
        &self.north_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn content_dir(&self, store: CacheStore) -> PathBuf {
        self.root.join(store.as_str()).join(CONTENT_DIR)
    }

    fn metadata_dir(&self, store: CacheStore) -> PathBuf {
        self.root.join(store.as_str()).join(METADATA_DIR)
    }

    fn retry_path(&self) -> PathBuf {
        self.root.join(RETRY_FILE)
    }

    /// Persists `content` into the pending store.
    pub fn write(
        &self,
        content: &Content,
        source: CacheSource,
        options: serde_json::Value,
    ) -> CacheResult<CacheEntry> {
        let bytes = content.encode()?;
        let mut state = self.lock();
        if let Some(limit) = self.max_size {
            if state.stats.pending.bytes >= limit {
                return Err(CacheError::Full {
                    north_id: self.north_id.clone(),
                    size: state.stats.pending.bytes,
                    limit,
                });
            }
        }

        let unique = Uuid::new_v4().simple().to_string();
        let metadata = CacheMetadata {
            content_file: content.cache_filename(&unique),
            content_size: bytes.len() as u64,
            number_of_element: content.number_of_element(),
            created_at: state.next_created_at(),
            content_type: content.content_type(),
            source,
            options,
        };
        let entry = CacheEntry {
            metadata_filename: format!("{unique}.json"),
            metadata,
        };
        self.commit_entry(CacheStore::Pending, &entry, &bytes)?;

        state.stats.pending.add(entry.metadata.content_size);
        state.queue.push_back(entry.clone());
        tracing::trace!(north = %self.north_id, file = %entry.metadata.content_file, "content cached");
        Ok(entry)
    }

    fn commit_entry(&self, store: CacheStore, entry: &CacheEntry, bytes: &[u8]) -> CacheResult<()> {
        let content_path = self.content_dir(store).join(&entry.metadata.content_file);
        write_atomic(&content_path, bytes)?;
        let metadata_path = self.metadata_dir(store).join(&entry.metadata_filename);
        let encoded = serde_json::to_vec(&entry.metadata)?;
        if let Err(err) = write_atomic(&metadata_path, &encoded) {
            let _ = fs::remove_file(&content_path);
            return Err(err);
        }
        Ok(())
    }

    /// Checks out the oldest pending entries for one send.
    ///
    /// At most `max_entries` entries; stops before exceeding `max_bytes` unless the batch
    /// would otherwise be empty.
    pub fn checkout(&self, max_entries: usize, max_bytes: Option<u64>) -> Vec<CacheEntry> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut batch = Vec::new();
        let mut bytes = 0u64;
        for entry in state.queue.iter() {
            if batch.len() >= max_entries {
                break;
            }
            if state.in_flight.contains(&entry.metadata_filename) {
                continue;
            }
            let size = entry.metadata.content_size;
            if let Some(limit) = max_bytes {
                if !batch.is_empty() && bytes.saturating_add(size) > limit {
                    break;
                }
            }
            bytes = bytes.saturating_add(size);
            batch.push(entry.clone());
        }
        for entry in &batch {
            state.in_flight.insert(entry.metadata_filename.clone());
        }
        batch
    }

    /// Hands checked-out entries back untouched.
    pub fn release(&self, entries: &[CacheEntry]) {
        let mut state = self.lock();
        for entry in entries {
            state.in_flight.remove(&entry.metadata_filename);
        }
    }

    pub fn read_content(&self, store: CacheStore, entry: &CacheEntry) -> CacheResult<Bytes> {
        let path = self.content_dir(store).join(&entry.metadata.content_file);
        match fs::read(&path) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(CacheError::NotFound(
                entry.metadata.content_file.clone(),
                store,
            )),
            Err(err) => Err(CacheError::io(&path)(err)),
        }
    }

    /// Finalizes a successful send: archive or delete.
    pub fn complete(&self, entries: &[CacheEntry], archive: bool) -> CacheResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut result = Ok(());
        for entry in entries {
            state.in_flight.remove(&entry.metadata_filename);
            state.retry.attempts.remove(&entry.metadata_filename);
            let outcome = if archive {
                self.relocate(state, entry, CacheStore::Pending, CacheStore::Archive)
            } else {
                self.delete(state, entry, CacheStore::Pending)
            };
            if let Err(err) = outcome {
                tracing::error!(north = %self.north_id, file = %entry.metadata.content_file, error = %err, "failed to finalize sent content");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        state.retry.not_before = None;
        self.persist_retry(&state.retry)?;
        result
    }

    /// Records a failed send of `entries`.
    ///
    /// Each entry is judged on its own counter: it goes to the error store when the failure
    /// is permanent or when it has now failed more than `retry_count` times. Entries still
    /// within budget keep their place at the head of the queue behind a `retry_interval`
    /// backoff.
    pub fn fail(
        &self,
        entries: &[CacheEntry],
        retryable: bool,
        retry_count: u32,
        retry_interval: Duration,
    ) -> CacheResult<FailureOutcome> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut attempts = 0;
        let mut exhausted = Vec::new();
        let mut retrying = 0;
        for entry in entries {
            state.in_flight.remove(&entry.metadata_filename);
            let counter = state
                .retry
                .attempts
                .entry(entry.metadata_filename.clone())
                .or_insert(0);
            *counter += 1;
            attempts = attempts.max(*counter);
            if !retryable || *counter > retry_count {
                exhausted.push(entry);
            } else {
                retrying += 1;
            }
        }

        let mut result = Ok(());
        for entry in &exhausted {
            state.retry.attempts.remove(&entry.metadata_filename);
            if let Err(err) = self.relocate(state, entry, CacheStore::Pending, CacheStore::Error) {
                tracing::error!(north = %self.north_id, file = %entry.metadata.content_file, error = %err, "failed to move content to error store");
                result = Err(err);
            }
        }

        let not_before = (retrying > 0).then(|| {
            let backoff = chrono::Duration::from_std(retry_interval).unwrap_or(chrono::Duration::zero());
            Utc::now() + backoff
        });
        state.retry.not_before = not_before;
        self.persist_retry(&state.retry)?;
        result?;
        Ok(FailureOutcome {
            attempts,
            moved_to_error: exhausted.len(),
            not_before,
        })
    }

    /// Earliest instant the next send may start after a retryable failure.
    pub fn not_before(&self) -> Option<Instant> {
        self.lock().retry.not_before
    }

    pub fn attempts(&self, metadata_filename: &str) -> u32 {
        self.lock()
            .retry
            .attempts
            .get(metadata_filename)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    pub fn pending_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn list(&self, store: CacheStore, filter: &CacheSearchParam) -> CacheResult<Vec<CacheEntry>> {
        if store == CacheStore::Pending {
            let state = self.lock();
            return Ok(state
                .queue
                .iter()
                .filter(|entry| filter.matches(&entry.metadata))
                .cloned()
                .collect());
        }
        let _state = self.lock();
        let (mut entries, _) = self.read_metadata_dir(store)?;
        entries.retain(|entry| filter.matches(&entry.metadata));
        entries.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.metadata_filename.cmp(&b.metadata_filename))
        });
        Ok(entries)
    }

    /// Relocates entries between stores. Entries being dispatched are refused.
    pub fn move_entries(
        &self,
        from: CacheStore,
        to: CacheStore,
        metadata_filenames: &[String],
    ) -> CacheResult<Vec<CacheEntry>> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let entries = self.resolve(state, from, metadata_filenames)?;
        if from == to {
            return Ok(entries);
        }
        for entry in &entries {
            state.retry.attempts.remove(&entry.metadata_filename);
            self.relocate(state, entry, from, to)?;
        }
        if from == CacheStore::Pending || to == CacheStore::Pending {
            self.persist_retry(&state.retry)?;
        }
        tracing::info!(north = %self.north_id, count = entries.len(), from = %from, to = %to, "cache content moved");
        Ok(entries)
    }

    pub fn move_all(&self, from: CacheStore, to: CacheStore) -> CacheResult<Vec<CacheEntry>> {
        let names = self.movable_names(from)?;
        self.move_entries(from, to, &names)
    }

    pub fn remove_entries(&self, store: CacheStore, metadata_filenames: &[String]) -> CacheResult<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let entries = self.resolve(state, store, metadata_filenames)?;
        for entry in &entries {
            state.retry.attempts.remove(&entry.metadata_filename);
            self.delete(state, entry, store)?;
        }
        if store == CacheStore::Pending {
            self.persist_retry(&state.retry)?;
        }
        tracing::info!(north = %self.north_id, count = entries.len(), store = %store, "cache content removed");
        Ok(entries.len())
    }

    pub fn remove_all(&self, store: CacheStore) -> CacheResult<usize> {
        let names = self.movable_names(store)?;
        self.remove_entries(store, &names)
    }

    fn movable_names(&self, store: CacheStore) -> CacheResult<Vec<String>> {
        if store == CacheStore::Pending {
            let state = self.lock();
            return Ok(state
                .queue
                .iter()
                .filter(|entry| !state.in_flight.contains(&entry.metadata_filename))
                .map(|entry| entry.metadata_filename.clone())
                .collect());
        }
        Ok(self
            .list(store, &CacheSearchParam::default())?
            .into_iter()
            .map(|entry| entry.metadata_filename)
            .collect())
    }

    /// Raw bytes of a content file, addressed by its name inside `store`.
    pub fn get_content(&self, store: CacheStore, content_file: &str) -> CacheResult<Bytes> {
        validate_name(content_file)?;
        let _state = self.lock();
        let path = self.content_dir(store).join(content_file);
        match fs::read(&path) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(content_file.to_string(), store))
            }
            Err(err) => Err(CacheError::io(&path)(err)),
        }
    }

    /// Deletes entries of `store` created before `cutoff`.
    pub fn purge_older_than(&self, store: CacheStore, cutoff: Instant) -> CacheResult<usize> {
        let expired: Vec<String> = self
            .list(store, &CacheSearchParam::default())?
            .into_iter()
            .filter(|entry| entry.metadata.created_at < cutoff)
            .map(|entry| entry.metadata_filename)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut removed = 0;
        for name in &expired {
            if state.in_flight.contains(name) {
                continue;
            }
            let entry = match self.load_entry(state, store, name) {
                Ok(entry) => entry,
                Err(CacheError::NotFound(..)) => continue,
                Err(err) => return Err(err),
            };
            self.delete(state, &entry, store)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Moves metadata that stopped parsing since startup out of the pending and archive
    /// stores into the error store, where an operator can inspect it. Returns the count.
    pub fn quarantine_corrupt(&self) -> CacheResult<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut moved = 0;
        for store in [CacheStore::Pending, CacheStore::Archive] {
            let (entries, corrupt) = self.read_metadata_dir(store)?;
            for name in corrupt {
                if state.in_flight.contains(&name) {
                    continue;
                }
                let queued = state
                    .queue
                    .iter()
                    .find(|entry| entry.metadata_filename == name)
                    .cloned();
                match queued {
                    // The queue still knows the content file, so the whole entry moves.
                    Some(entry) => self.relocate(state, &entry, store, CacheStore::Error)?,
                    None => {
                        let from = self.metadata_dir(store).join(&name);
                        let to = self.metadata_dir(CacheStore::Error).join(&name);
                        fs::rename(&from, &to).map_err(CacheError::io(&from))?;
                    }
                }
                tracing::error!(north = %self.north_id, file = %name, store = %store, "unparsable metadata moved to error store");
                moved += 1;
            }
            if store == CacheStore::Archive && moved > 0 {
                let mut stats = StoreStats::default();
                for entry in &entries {
                    stats.add(entry.metadata.content_size);
                }
                state.stats.archive = stats;
            }
        }
        Ok(moved)
    }

    /// Deletes every store of this North.
    pub fn destroy(&self) -> CacheResult<()> {
        let mut state = self.lock();
        if !state.in_flight.is_empty() {
            tracing::warn!(north = %self.north_id, "purging cache with content in flight");
        }
        *state = CacheState::default();
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::io(&self.root)(err)),
        }
    }

    fn resolve(
        &self,
        state: &CacheState,
        store: CacheStore,
        metadata_filenames: &[String],
    ) -> CacheResult<Vec<CacheEntry>> {
        let mut entries = Vec::with_capacity(metadata_filenames.len());
        for name in metadata_filenames {
            validate_name(name)?;
            if store == CacheStore::Pending && state.in_flight.contains(name) {
                return Err(CacheError::Busy(name.clone()));
            }
            entries.push(self.load_entry(state, store, name)?);
        }
        Ok(entries)
    }

    fn load_entry(&self, state: &CacheState, store: CacheStore, name: &str) -> CacheResult<CacheEntry> {
        if store == CacheStore::Pending {
            return state
                .queue
                .iter()
                .find(|entry| entry.metadata_filename == name)
                .cloned()
                .ok_or_else(|| CacheError::NotFound(name.to_string(), store));
        }
        let path = self.metadata_dir(store).join(name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(name.to_string(), store))
            }
            Err(err) => return Err(CacheError::io(&path)(err)),
        };
        Ok(CacheEntry {
            metadata_filename: name.to_string(),
            metadata: serde_json::from_slice(&raw)?,
        })
    }

    fn relocate(
        &self,
        state: &mut CacheState,
        entry: &CacheEntry,
        from: CacheStore,
        to: CacheStore,
    ) -> CacheResult<()> {
        let content_from = self.content_dir(from).join(&entry.metadata.content_file);
        let content_to = self.content_dir(to).join(&entry.metadata.content_file);
        match fs::rename(&content_from, &content_to) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(north = %self.north_id, file = %entry.metadata.content_file, store = %from, "content file missing while moving entry");
            }
            Err(err) => return Err(CacheError::io(&content_from)(err)),
        }
        let metadata_from = self.metadata_dir(from).join(&entry.metadata_filename);
        let metadata_to = self.metadata_dir(to).join(&entry.metadata_filename);
        fs::rename(&metadata_from, &metadata_to).map_err(CacheError::io(&metadata_from))?;

        let size = entry.metadata.content_size;
        state.stats.store_mut(from).sub(size);
        state.stats.store_mut(to).add(size);
        if from == CacheStore::Pending {
            state.remove_from_queue(&entry.metadata_filename);
        }
        if to == CacheStore::Pending {
            state.insert_into_queue(entry.clone());
        }
        tracing::trace!(north = %self.north_id, file = %entry.metadata.content_file, from = %from, to = %to, "cache entry moved");
        Ok(())
    }

    fn delete(&self, state: &mut CacheState, entry: &CacheEntry, store: CacheStore) -> CacheResult<()> {
        let metadata_path = self.metadata_dir(store).join(&entry.metadata_filename);
        remove_if_exists(&metadata_path)?;
        let content_path = self.content_dir(store).join(&entry.metadata.content_file);
        remove_if_exists(&content_path)?;
        state.stats.store_mut(store).sub(entry.metadata.content_size);
        if store == CacheStore::Pending {
            state.remove_from_queue(&entry.metadata_filename);
        }
        Ok(())
    }

    fn persist_retry(&self, retry: &RetryStateDisk) -> CacheResult<()> {
        let path = self.retry_path();
        if retry.not_before.is_none() && retry.attempts.is_empty() {
            return remove_if_exists(&path);
        }
        let encoded = serde_json::to_vec_pretty(retry)?;
        write_atomic(&path, &encoded)
    }

    fn load_retry(&self) -> RetryStateDisk {
        let path = self.retry_path();
        if !path.exists() {
            return RetryStateDisk::default();
        }
        match fs::read(&path)
            .map_err(|err| err.to_string())
            .and_then(|raw| {
                serde_json::from_slice::<RetryStateDisk>(&raw).map_err(|err| err.to_string())
            })
        {
            Ok(retry) => retry,
            Err(err) => {
                tracing::warn!(north = %self.north_id, error = %err, "failed to load retry state; starting fresh");
                RetryStateDisk::default()
            }
        }
    }

    /// Parses every metadata file of `store`; returns entries and unparsable file names.
    fn read_metadata_dir(&self, store: CacheStore) -> CacheResult<(Vec<CacheEntry>, Vec<String>)> {
        let dir = self.metadata_dir(store);
        let mut entries = Vec::new();
        let mut corrupt = Vec::new();
        for name in list_files(&dir)? {
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let path = dir.join(&name);
            let parsed = fs::read(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| {
                    serde_json::from_slice::<CacheMetadata>(&raw).map_err(|err| err.to_string())
                });
            match parsed {
                Ok(metadata) => entries.push(CacheEntry {
                    metadata_filename: name,
                    metadata,
                }),
                Err(err) => {
                    tracing::error!(north = %self.north_id, path = %path.display(), error = %err, "unreadable cache metadata");
                    corrupt.push(name);
                }
            }
        }
        Ok((entries, corrupt))
    }

    /// Rebuilds in-memory state from disk and repairs interrupted writes and moves.
    fn recover(&self) -> CacheResult<CacheState> {
        let mut located: Vec<(CacheStore, CacheEntry)> = Vec::new();
        let mut contents: HashMap<CacheStore, HashSet<String>> = HashMap::new();

        for store in CacheStore::ALL {
            for dir in [self.content_dir(store), self.metadata_dir(store)] {
                for name in list_files(&dir)? {
                    if name.ends_with(TMP_SUFFIX) {
                        remove_if_exists(&dir.join(name))?;
                    }
                }
            }
            contents.insert(store, list_files(&self.content_dir(store))?.into_iter().collect());

            let (entries, corrupt) = self.read_metadata_dir(store)?;
            for name in corrupt {
                if store != CacheStore::Error {
                    let from = self.metadata_dir(store).join(&name);
                    let to = self.metadata_dir(CacheStore::Error).join(&name);
                    fs::rename(&from, &to).map_err(CacheError::io(&from))?;
                    tracing::error!(north = %self.north_id, file = %name, store = %store, "unparsable metadata moved to error store");
                }
            }
            located.extend(entries.into_iter().map(|entry| (store, entry)));
        }

        let has_content = |contents: &HashMap<CacheStore, HashSet<String>>, store: CacheStore, file: &str| {
            contents.get(&store).is_some_and(|files| files.contains(file))
        };

        let mut state = CacheState::default();
        let mut pending = Vec::new();
        let mut referenced: HashMap<CacheStore, HashSet<String>> = HashMap::new();
        for (store, entry) in located {
            let file = entry.metadata.content_file.clone();
            let mut target = store;
            if !has_content(&contents, store, &file) {
                if let Some(other) = CacheStore::ALL
                    .into_iter()
                    .find(|other| *other != store && has_content(&contents, *other, &file))
                {
                    // Interrupted move: content already renamed, metadata not yet.
                    target = other;
                    tracing::warn!(north = %self.north_id, file = %file, from = %store, to = %other, "completing interrupted cache move");
                } else if store != CacheStore::Error {
                    target = CacheStore::Error;
                    tracing::error!(north = %self.north_id, file = %file, store = %store, "cache content missing; metadata moved to error store");
                }
                if target != store {
                    let from = self.metadata_dir(store).join(&entry.metadata_filename);
                    let to = self.metadata_dir(target).join(&entry.metadata_filename);
                    fs::rename(&from, &to).map_err(CacheError::io(&from))?;
                }
            }
            referenced.entry(target).or_default().insert(file);
            state.stats.store_mut(target).add(entry.metadata.content_size);
            if target == CacheStore::Pending {
                pending.push(entry);
            }
        }

        for store in CacheStore::ALL {
            let Some(files) = contents.get(&store) else {
                continue;
            };
            for file in files {
                let known = referenced.get(&store).is_some_and(|names| names.contains(file));
                if !known {
                    // Content whose metadata never committed.
                    tracing::warn!(north = %self.north_id, file = %file, store = %store, "removing orphan cache content");
                    remove_if_exists(&self.content_dir(store).join(file))?;
                }
            }
        }

        pending.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.metadata_filename.cmp(&b.metadata_filename))
        });
        state.last_created_at = pending.last().map(|entry| entry.metadata.created_at);
        let names: HashSet<&str> = pending.iter().map(|e| e.metadata_filename.as_str()).collect();
        let mut retry = self.load_retry();
        retry.attempts.retain(|name, _| names.contains(name.as_str()));
        if retry.attempts.is_empty() {
            retry.not_before = None;
        }
        state.retry = retry;
        state.queue = pending.into();
        Ok(state)
    }
}

fn validate_name(name: &str) -> CacheResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(CacheError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);
    let mut file = fs::File::create(&tmp).map_err(CacheError::io(&tmp))?;
    file.write_all(bytes).map_err(CacheError::io(&tmp))?;
    file.sync_all().map_err(CacheError::io(&tmp))?;
    drop(file);
    fs::rename(&tmp, path).map_err(CacheError::io(path))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> CacheResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CacheError::io(path)(err)),
    }
}

fn list_files(dir: &Path) -> CacheResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(CacheError::io(dir))? {
        let entry = entry.map_err(CacheError::io(dir))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        names.push(name.to_string());
    }
    Ok(names)
}
