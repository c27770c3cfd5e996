//! Fan-out of freshly acquired content into the caches of subscribed Norths.

use super::NorthCache;
use crate::config::{Subscription, TransformerBinding};
use crate::error::{CacheError, CacheResult};
use crate::model::{CacheMetadata, CacheSource, Content};
use crate::transformer::{self, TransformerRegistry};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Clone)]
pub struct RouteTarget {
    pub cache: Arc<NorthCache>,
    pub bindings: Vec<TransformerBinding>,
}

pub struct CacheRouter {
    transformers: Arc<TransformerRegistry>,
    targets: RwLock<HashMap<String, RouteTarget>>,
    /// North id to the South ids it listens to. A North without rows takes everything.
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
}

impl CacheRouter {
    pub fn new(transformers: Arc<TransformerRegistry>, subscriptions: &[Subscription]) -> Self {
        let router = Self {
            transformers,
            targets: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        };
        router.set_subscriptions(subscriptions);
        router
    }

    pub fn set_subscriptions(&self, subscriptions: &[Subscription]) {
        let mut map: HashMap<String, HashSet<String>> = HashMap::new();
        for sub in subscriptions {
            map.entry(sub.north_id.clone())
                .or_default()
                .insert(sub.south_id.clone());
        }
        *write(&self.subscriptions) = map;
    }

    /// Starts routing content to `north_id`.
    pub fn attach(&self, north_id: &str, target: RouteTarget) {
        write(&self.targets).insert(north_id.to_string(), target);
    }

    pub fn detach(&self, north_id: &str) {
        write(&self.targets).remove(north_id);
    }

    pub fn is_attached(&self, north_id: &str) -> bool {
        read(&self.targets).contains_key(north_id)
    }

    pub fn accepts(&self, north_id: &str, source: &CacheSource) -> bool {
        let Some(south_id) = source.south_id() else {
            return true;
        };
        match read(&self.subscriptions).get(north_id) {
            Some(souths) => souths.contains(south_id),
            None => true,
        }
    }

    /// Writes `contents` into every attached North that accepts `source`.
    ///
    /// Returns the number of cache entries written. A full cache drops the content for that
    /// North only; any other cache failure is returned so the caller does not advance its
    /// checkpoint.
    pub fn cache_content(&self, source: &CacheSource, contents: Vec<Content>) -> CacheResult<usize> {
        let targets: Vec<(String, RouteTarget)> = read(&self.targets)
            .iter()
            .filter(|(north_id, _)| self.accepts(north_id, source))
            .map(|(north_id, target)| (north_id.clone(), target.clone()))
            .collect();

        let mut written = 0;
        for (north_id, target) in &targets {
            for content in &contents {
                if content.is_empty() {
                    continue;
                }
                let (content, options) = self.prepare(north_id, target, source, content);
                match target.cache.write(&content, source.clone(), options) {
                    Ok(_) => written += 1,
                    Err(CacheError::Full { size, limit, .. }) => {
                        tracing::warn!(north = %north_id, size, limit, "cache full; content discarded");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(written)
    }

    /// Applies the North's write-path transformer for this content type, if any.
    fn prepare(
        &self,
        north_id: &str,
        target: &RouteTarget,
        source: &CacheSource,
        content: &Content,
    ) -> (Content, serde_json::Value) {
        let Some(binding) = target
            .bindings
            .iter()
            .find(|binding| binding.input_type == content.content_type())
        else {
            return (content.clone(), serde_json::Value::Null);
        };
        let Some(transformer) = self
            .transformers
            .find(binding.input_type, binding.output_type)
        else {
            tracing::warn!(
                north = %north_id,
                input = %binding.input_type,
                output = %binding.output_type,
                "no transformer registered; caching content unchanged"
            );
            return (content.clone(), serde_json::Value::Null);
        };

        let metadata = CacheMetadata {
            content_file: content.cache_filename(&Uuid::nil().simple().to_string()),
            content_size: 0,
            number_of_element: content.number_of_element(),
            created_at: Utc::now(),
            content_type: content.content_type(),
            source: source.clone(),
            options: serde_json::Value::Null,
        };
        match transformer::apply(transformer.as_ref(), content, &metadata, &binding.options) {
            Ok(output) => (output.content, output.metadata.options),
            Err(err) => {
                tracing::warn!(north = %north_id, transformer = transformer.id(), error = %err, "transformation failed; caching content unchanged");
                (content.clone(), serde_json::Value::Null)
            }
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
