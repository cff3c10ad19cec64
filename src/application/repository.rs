//! Cache-consistency repository.
//!
//! Every client operation runs as one critical section per key:
//! reconcile the staleness marker, inspect or mutate the cache, write through
//! to the durable store and publish an invalidation. Incoming invalidations
//! only set markers; the value is pulled from the durable store the next time
//! the key is used.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics::counter;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheConfig, CacheError, CacheStore, KeyLocks, Staleness};
use crate::domain::entities::{Entry, NodeId};
use crate::domain::messages::InvalidationMessage;

use super::bus::{BusError, InvalidationBus};
use super::repos::{KeyValueStore, RepoError};

const OP_STORE_ADD: &str = "store.add";
const OP_STORE_GET: &str = "store.try_get";
const OP_STORE_UPDATE: &str = "store.update";
const OP_STORE_DELETE: &str = "store.delete";
const OP_STORE_LIST: &str = "store.list_all";

const METRIC_CACHE_HIT: &str = "kvs_cache_hit_total";
const METRIC_CACHE_MISS: &str = "kvs_cache_miss_total";
const METRIC_RECONCILE: &str = "kvs_reconcile_total";
const METRIC_RECONCILE_INCONSISTENCY: &str = "kvs_reconcile_inconsistency_total";
const METRIC_PUBLISHED: &str = "kvs_invalidation_published_total";
const METRIC_PUBLISH_FAILED: &str = "kvs_invalidation_publish_failed_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Success,
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Success(String),
    NotFound,
}

/// Outcome of an update or a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Success,
    NotFound,
}

/// Infrastructure failure surfaced by a repository operation.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("durable store failed during `{operation}`")]
    Store {
        operation: &'static str,
        #[source]
        source: RepoError,
    },
    #[error("`{operation}` timed out after {elapsed_ms} ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },
    /// The durable write and the local cache update are already committed.
    #[error("invalidation for key `{key}` not published after {attempts} attempt(s)")]
    Publish {
        key: String,
        attempts: u32,
        #[source]
        source: BusError,
    },
    #[error("cache invariant violated")]
    Cache(#[from] CacheError),
}

impl RepositoryError {
    /// Whether repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RepositoryError::Store {
                source: RepoError::Duplicate { .. },
                ..
            } => false,
            RepositoryError::Store { .. }
            | RepositoryError::Timeout { .. }
            | RepositoryError::Publish { .. } => true,
            RepositoryError::Cache(_) => false,
        }
    }
}

pub struct KeyValueRepository {
    node_id: NodeId,
    cache: Arc<CacheStore>,
    locks: KeyLocks,
    store: Arc<dyn KeyValueStore>,
    bus: Arc<dyn InvalidationBus>,
    config: CacheConfig,
    /// Bumped whenever the whole cache is distrusted.
    distrust_epoch: AtomicU64,
}

impl KeyValueRepository {
    pub fn new(
        node_id: NodeId,
        cache: Arc<CacheStore>,
        store: Arc<dyn KeyValueStore>,
        bus: Arc<dyn InvalidationBus>,
        config: CacheConfig,
    ) -> Self {
        Self {
            node_id,
            cache,
            locks: KeyLocks::new(),
            store,
            bus,
            config,
            distrust_epoch: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[instrument(skip(self, value), fields(node_id = %self.node_id))]
    pub async fn add_key_value(&self, key: &str, value: &str) -> Result<AddOutcome, RepositoryError> {
        let _guard = self.locks.acquire(key).await;
        self.reconcile(key).await?;

        if self.cache.contains(key) {
            debug!(key, "add rejected, key already cached");
            return Ok(AddOutcome::AlreadyPresent);
        }

        let entry = Entry::new(key, value);
        match self.store_call(OP_STORE_ADD, self.store.add(&entry)).await {
            Ok(()) => {}
            Err(RepositoryError::Store {
                source: RepoError::Duplicate { .. },
                ..
            }) => {
                // Created elsewhere; that node's notification is still in flight.
                self.cache.mark(key, Staleness::ModifiedRemotely);
                debug!(key, "add rejected by durable store, key exists on another node");
                return Ok(AddOutcome::AlreadyPresent);
            }
            Err(err) => return Err(err),
        }

        self.cache.add(key, value)?;
        self.publish(InvalidationMessage::modified(self.node_id, key))
            .await?;
        Ok(AddOutcome::Success)
    }

    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn get_value_by_key(&self, key: &str) -> Result<GetOutcome, RepositoryError> {
        let _guard = self.locks.acquire(key).await;
        self.reconcile(key).await?;

        match self.cache.get(key) {
            Some(value) => {
                counter!(METRIC_CACHE_HIT).increment(1);
                Ok(GetOutcome::Success(value))
            }
            None => {
                counter!(METRIC_CACHE_MISS).increment(1);
                Ok(GetOutcome::NotFound)
            }
        }
    }

    #[instrument(skip(self, new_value), fields(node_id = %self.node_id))]
    pub async fn update_key_value(
        &self,
        key: &str,
        new_value: &str,
    ) -> Result<ChangeOutcome, RepositoryError> {
        let _guard = self.locks.acquire(key).await;
        self.reconcile(key).await?;

        if !self.cache.contains(key) {
            return Ok(ChangeOutcome::NotFound);
        }

        let entry = Entry::new(key, new_value);
        if !self
            .store_call(OP_STORE_UPDATE, self.store.update(&entry))
            .await?
        {
            self.evict_vanished(key);
            return Ok(ChangeOutcome::NotFound);
        }

        self.cache.update(key, new_value)?;
        self.publish(InvalidationMessage::modified(self.node_id, key))
            .await?;
        Ok(ChangeOutcome::Success)
    }

    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn remove_by_key(&self, key: &str) -> Result<ChangeOutcome, RepositoryError> {
        let _guard = self.locks.acquire(key).await;
        self.reconcile(key).await?;

        if !self.cache.contains(key) {
            return Ok(ChangeOutcome::NotFound);
        }

        if !self
            .store_call(OP_STORE_DELETE, self.store.delete(key))
            .await?
        {
            self.evict_vanished(key);
            return Ok(ChangeOutcome::NotFound);
        }

        self.cache.remove(key);
        self.publish(InvalidationMessage::deleted(self.node_id, key))
            .await?;
        Ok(ChangeOutcome::Success)
    }

    /// Record that another node changed `key`.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn mark_modified(&self, key: &str) {
        self.mark(key, Staleness::ModifiedRemotely).await;
    }

    /// Record that another node removed `key`.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn mark_deleted(&self, key: &str) {
        self.mark(key, Staleness::DeletedRemotely).await;
    }

    /// Distrust every cached key, used when notifications may have been lost.
    pub async fn mark_all_modified(&self) -> usize {
        self.distrust_epoch.fetch_add(1, Ordering::SeqCst);
        let keys = self.cache.keys();
        for key in &keys {
            self.mark(key, Staleness::ModifiedRemotely).await;
        }
        info!(node_id = %self.node_id, count = keys.len(), "marked all cached keys as remotely modified");
        keys.len()
    }

    /// Load every durable entry into the cache.
    ///
    /// If the whole cache was distrusted while the entries were in flight,
    /// everything loaded is marked as remotely modified as well.
    pub async fn warm(&self) -> Result<usize, RepositoryError> {
        let started = Instant::now();
        let epoch = self.distrust_epoch.load(Ordering::SeqCst);
        let entries = self
            .store_call(OP_STORE_LIST, self.store.list_all())
            .await?;
        let total = entries.len();
        let loaded = self.cache.warm(entries);
        if self.distrust_epoch.load(Ordering::SeqCst) != epoch {
            warn!(node_id = %self.node_id, "invalidations may have been lost during warmup");
            self.mark_all_modified().await;
        }
        info!(
            node_id = %self.node_id,
            loaded,
            skipped = total - loaded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cache warmed from durable store"
        );
        Ok(loaded)
    }

    async fn mark(&self, key: &str, staleness: Staleness) {
        let _guard = self.locks.acquire(key).await;
        self.cache.mark(key, staleness);
        debug!(key, marker = staleness.as_str(), "staleness marker set");
    }

    /// Bring the cached state of `key` in line with its marker.
    ///
    /// Must run under the key's lock. The marker is only cleared once the
    /// durable store answered, so a failed reconcile is retried next time.
    async fn reconcile(&self, key: &str) -> Result<(), RepositoryError> {
        let marker = self.cache.staleness(key);
        match marker {
            Staleness::Fresh => {
                if self.config.read_through_on_miss && !self.cache.contains(key) {
                    if let Some(value) = self
                        .store_call(OP_STORE_GET, self.store.try_get(key))
                        .await?
                    {
                        self.cache.set(key, &value);
                    }
                }
                return Ok(());
            }
            Staleness::ModifiedRemotely => {
                match self
                    .store_call(OP_STORE_GET, self.store.try_get(key))
                    .await?
                {
                    Some(value) => self.cache.set(key, &value),
                    None => {
                        let evicted = self.cache.remove(key);
                        counter!(METRIC_RECONCILE_INCONSISTENCY).increment(1);
                        warn!(
                            key,
                            evicted,
                            "key marked as remotely modified is missing from the durable store"
                        );
                    }
                }
            }
            Staleness::DeletedRemotely => {
                self.cache.remove(key);
            }
        }

        self.cache.clear_marker(key);
        counter!(METRIC_RECONCILE, "kind" => marker.as_str()).increment(1);
        debug!(key, marker = marker.as_str(), "stale key reconciled");
        Ok(())
    }

    fn evict_vanished(&self, key: &str) {
        self.cache.remove(key);
        counter!(METRIC_RECONCILE_INCONSISTENCY).increment(1);
        warn!(
            key,
            "cached key is missing from the durable store, evicted locally"
        );
    }

    async fn store_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, RepoError>>,
    ) -> Result<T, RepositoryError> {
        let started = Instant::now();
        match timeout(self.config.store_timeout, call).await {
            Ok(result) => result.map_err(|source| RepositoryError::Store { operation, source }),
            Err(_) => {
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                warn!(operation, elapsed_ms, "durable store call timed out");
                Err(RepositoryError::Timeout {
                    operation,
                    elapsed_ms,
                })
            }
        }
    }

    async fn publish(&self, message: InvalidationMessage) -> Result<(), RepositoryError> {
        let attempts = self.config.publish_attempts.get();
        let mut attempt = 1;
        loop {
            let result = match timeout(self.config.bus_timeout, self.bus.publish(&message)).await {
                Ok(result) => result,
                Err(_) => Err(BusError::Timeout),
            };

            match result {
                Ok(()) => {
                    counter!(METRIC_PUBLISHED, "kind" => message.kind.as_str()).increment(1);
                    debug!(
                        key = %message.key,
                        kind = message.kind.as_str(),
                        attempt,
                        "invalidation published"
                    );
                    return Ok(());
                }
                Err(source) if attempt >= attempts => {
                    counter!(METRIC_PUBLISH_FAILED, "kind" => message.kind.as_str()).increment(1);
                    warn!(
                        key = %message.key,
                        kind = message.kind.as_str(),
                        attempts,
                        error = %source,
                        "invalidation not published, peers keep their cached copy"
                    );
                    return Err(RepositoryError::Publish {
                        key: message.key,
                        attempts,
                        source,
                    });
                }
                Err(err) => {
                    let backoff = self.config.backoff_after(attempt);
                    debug!(
                        key = %message.key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "publish failed, retrying"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;
    use crate::application::bus::{Delivery, DeliveryStream};
    use crate::domain::messages::InvalidationKind;
    use crate::infra::bus::MemoryInvalidationBus;
    use crate::infra::memory::{DelayedStore, MemoryKeyValueStore};

    struct Harness {
        repository: KeyValueRepository,
        store: Arc<MemoryKeyValueStore>,
        bus: Arc<MemoryInvalidationBus>,
    }

    fn harness(config: CacheConfig) -> Harness {
        let store = Arc::new(MemoryKeyValueStore::new());
        let bus = Arc::new(MemoryInvalidationBus::new(64));
        let repository = KeyValueRepository::new(
            NodeId::generate(),
            Arc::new(CacheStore::new()),
            store.clone(),
            bus.clone(),
            config,
        );
        Harness {
            repository,
            store,
            bus,
        }
    }

    fn fast_config() -> CacheConfig {
        CacheConfig {
            publish_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    struct FailingStore;

    #[async_trait]
    impl KeyValueStore for FailingStore {
        async fn add(&self, _entry: &Entry) -> Result<(), RepoError> {
            Err(RepoError::from_persistence("connection refused"))
        }

        async fn try_get(&self, _key: &str) -> Result<Option<String>, RepoError> {
            Err(RepoError::from_persistence("connection refused"))
        }

        async fn update(&self, _entry: &Entry) -> Result<bool, RepoError> {
            Err(RepoError::from_persistence("connection refused"))
        }

        async fn delete(&self, _key: &str) -> Result<bool, RepoError> {
            Err(RepoError::from_persistence("connection refused"))
        }

        async fn list_all(&self) -> Result<Vec<Entry>, RepoError> {
            Err(RepoError::from_persistence("connection refused"))
        }
    }

    struct SlowStore;

    #[async_trait]
    impl KeyValueStore for SlowStore {
        async fn add(&self, _entry: &Entry) -> Result<(), RepoError> {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn try_get(&self, _key: &str) -> Result<Option<String>, RepoError> {
            Ok(None)
        }

        async fn update(&self, _entry: &Entry) -> Result<bool, RepoError> {
            Ok(true)
        }

        async fn delete(&self, _key: &str) -> Result<bool, RepoError> {
            Ok(true)
        }

        async fn list_all(&self) -> Result<Vec<Entry>, RepoError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FailingBus {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl InvalidationBus for FailingBus {
        async fn publish(&self, _message: &InvalidationMessage) -> Result<(), BusError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(BusError::transport("broker unreachable"))
        }

        async fn subscribe(&self) -> Result<DeliveryStream, BusError> {
            Err(BusError::Closed)
        }
    }

    #[tokio::test]
    async fn crud_scenario() {
        let h = harness(fast_config());
        let repo = &h.repository;

        assert_eq!(
            repo.add_key_value("user:1", "alice").await.unwrap(),
            AddOutcome::Success
        );
        assert_eq!(
            repo.get_value_by_key("user:1").await.unwrap(),
            GetOutcome::Success("alice".to_string())
        );
        assert_eq!(
            repo.update_key_value("user:1", "alicia").await.unwrap(),
            ChangeOutcome::Success
        );
        assert_eq!(
            repo.get_value_by_key("user:1").await.unwrap(),
            GetOutcome::Success("alicia".to_string())
        );
        assert_eq!(
            repo.remove_by_key("user:1").await.unwrap(),
            ChangeOutcome::Success
        );
        assert_eq!(
            repo.get_value_by_key("user:1").await.unwrap(),
            GetOutcome::NotFound
        );
        assert_eq!(h.store.snapshot().len(), 0);
    }

    #[tokio::test]
    async fn second_add_is_rejected_and_keeps_value() {
        let h = harness(fast_config());

        h.repository.add_key_value("k", "v1").await.unwrap();
        let outcome = h.repository.add_key_value("k", "v2").await.unwrap();

        assert_eq!(outcome, AddOutcome::AlreadyPresent);
        assert_eq!(
            h.repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::Success("v1".to_string())
        );
        assert_eq!(h.store.value("k").as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn missing_key_is_not_found_everywhere() {
        let h = harness(fast_config());

        assert_eq!(
            h.repository.get_value_by_key("nope").await.unwrap(),
            GetOutcome::NotFound
        );
        assert_eq!(
            h.repository.update_key_value("nope", "v").await.unwrap(),
            ChangeOutcome::NotFound
        );
        assert_eq!(
            h.repository.remove_by_key("nope").await.unwrap(),
            ChangeOutcome::NotFound
        );
        assert!(h.store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn mutations_publish_tagged_with_own_node() {
        let h = harness(fast_config());
        let mut deliveries = h.bus.subscribe().await.unwrap();
        let node = h.repository.node_id();

        h.repository.add_key_value("k", "v").await.unwrap();
        h.repository.update_key_value("k", "v2").await.unwrap();
        h.repository.remove_by_key("k").await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..3 {
            match deliveries.next().await {
                Some(Ok(Delivery::Message(message))) => {
                    assert_eq!(message.origin_node, node);
                    assert_eq!(message.key, "k");
                    kinds.push(message.kind);
                }
                other => panic!("unexpected delivery: {other:?}"),
            }
        }
        assert_eq!(
            kinds,
            vec![
                InvalidationKind::Modified,
                InvalidationKind::Modified,
                InvalidationKind::Deleted
            ]
        );
    }

    #[tokio::test]
    async fn remote_modification_is_pulled_on_next_read() {
        let h = harness(fast_config());
        h.repository.add_key_value("k", "old").await.unwrap();

        h.store.put("k", "new");
        assert_eq!(
            h.repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::Success("old".to_string())
        );

        h.repository.mark_modified("k").await;
        assert_eq!(
            h.repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::Success("new".to_string())
        );
        assert_eq!(h.repository.cache().staleness("k"), Staleness::Fresh);
    }

    #[tokio::test]
    async fn remote_modification_of_uncached_key_populates_cache() {
        let h = harness(fast_config());
        h.store.put("k", "remote");

        h.repository.mark_modified("k").await;

        assert_eq!(
            h.repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::Success("remote".to_string())
        );
    }

    #[tokio::test]
    async fn remote_deletion_evicts_cached_value() {
        let h = harness(fast_config());
        h.repository.add_key_value("k", "v").await.unwrap();

        h.repository.mark_deleted("k").await;
        h.repository.mark_deleted("k").await;

        assert_eq!(
            h.repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::NotFound
        );
        assert!(!h.repository.cache().contains("k"));
    }

    #[tokio::test]
    async fn latest_marker_wins() {
        let h = harness(fast_config());
        h.repository.add_key_value("k", "v").await.unwrap();

        h.repository.mark_deleted("k").await;
        h.repository.mark_modified("k").await;

        assert_eq!(
            h.repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::Success("v".to_string())
        );
    }

    #[tokio::test]
    async fn modified_marker_with_missing_row_evicts() {
        let h = harness(fast_config());
        h.repository.add_key_value("k", "v").await.unwrap();
        h.store.forget("k");

        h.repository.mark_modified("k").await;

        assert_eq!(
            h.repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::NotFound
        );
        assert_eq!(h.repository.cache().staleness("k"), Staleness::Fresh);
    }

    #[tokio::test]
    async fn durable_duplicate_reports_already_present() {
        let h = harness(fast_config());
        h.store.put("k", "from-elsewhere");

        let outcome = h.repository.add_key_value("k", "mine").await.unwrap();

        assert_eq!(outcome, AddOutcome::AlreadyPresent);
        assert_eq!(
            h.repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::Success("from-elsewhere".to_string())
        );
    }

    #[tokio::test]
    async fn vanished_row_on_update_and_remove_is_not_found() {
        let h = harness(fast_config());
        h.repository.add_key_value("a", "1").await.unwrap();
        h.repository.add_key_value("b", "2").await.unwrap();
        h.store.forget("a");
        h.store.forget("b");

        assert_eq!(
            h.repository.update_key_value("a", "x").await.unwrap(),
            ChangeOutcome::NotFound
        );
        assert_eq!(
            h.repository.remove_by_key("b").await.unwrap(),
            ChangeOutcome::NotFound
        );
        assert!(h.repository.cache().is_empty());
    }

    #[tokio::test]
    async fn store_failure_leaves_cache_and_marker_untouched() {
        let cache = Arc::new(CacheStore::new());
        cache.set("k", "cached");
        cache.mark("k", Staleness::ModifiedRemotely);
        let repository = KeyValueRepository::new(
            NodeId::generate(),
            cache.clone(),
            Arc::new(FailingStore),
            Arc::new(MemoryInvalidationBus::new(8)),
            fast_config(),
        );

        let err = repository.get_value_by_key("k").await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Store {
                operation: "store.try_get",
                ..
            }
        ));
        assert!(err.is_retryable());

        let err = repository.add_key_value("fresh", "v").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Store { .. }));
        assert!(!cache.contains("fresh"));
        assert_eq!(cache.staleness("k"), Staleness::ModifiedRemotely);
        assert_eq!(cache.get("k").as_deref(), Some("cached"));
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let repository = KeyValueRepository::new(
            NodeId::generate(),
            Arc::new(CacheStore::new()),
            Arc::new(SlowStore),
            Arc::new(MemoryInvalidationBus::new(8)),
            CacheConfig {
                store_timeout: Duration::from_millis(20),
                ..fast_config()
            },
        );

        let err = repository.add_key_value("k", "v").await.unwrap_err();

        assert!(matches!(
            err,
            RepositoryError::Timeout {
                operation: "store.add",
                ..
            }
        ));
        assert!(!repository.cache().contains("k"));
    }

    #[tokio::test]
    async fn publish_failure_is_retried_then_reported() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let bus = Arc::new(FailingBus::default());
        let repository = KeyValueRepository::new(
            NodeId::generate(),
            Arc::new(CacheStore::new()),
            store.clone(),
            bus.clone(),
            CacheConfig {
                publish_attempts: NonZeroU32::new(3).unwrap(),
                ..fast_config()
            },
        );

        let err = repository.add_key_value("k", "v").await.unwrap_err();

        match err {
            RepositoryError::Publish { key, attempts, .. } => {
                assert_eq!(key, "k");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(bus.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.value("k").as_deref(), Some("v"));
        assert_eq!(repository.cache().get("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn read_through_loads_unmarked_misses() {
        let h = harness(CacheConfig {
            read_through_on_miss: true,
            ..fast_config()
        });
        h.store.put("k", "durable");

        assert_eq!(
            h.repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::Success("durable".to_string())
        );
        assert_eq!(
            h.repository.add_key_value("k", "other").await.unwrap(),
            AddOutcome::AlreadyPresent
        );
        assert_eq!(
            h.repository.get_value_by_key("missing").await.unwrap(),
            GetOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn warm_loads_durable_entries() {
        let h = harness(fast_config());
        h.store.put("a", "1");
        h.store.put("b", "2");

        assert_eq!(h.repository.warm().await.unwrap(), 2);
        assert_eq!(
            h.repository.get_value_by_key("b").await.unwrap(),
            GetOutcome::Success("2".to_string())
        );
    }

    #[tokio::test]
    async fn mark_all_modified_marks_every_cached_key() {
        let h = harness(fast_config());
        h.repository.add_key_value("a", "1").await.unwrap();
        h.repository.add_key_value("b", "2").await.unwrap();

        assert_eq!(h.repository.mark_all_modified().await, 2);
        assert_eq!(
            h.repository.cache().staleness("a"),
            Staleness::ModifiedRemotely
        );
        assert_eq!(
            h.repository.cache().staleness("b"),
            Staleness::ModifiedRemotely
        );
    }

    #[tokio::test]
    async fn concurrent_adds_of_one_key_admit_exactly_one() {
        let h = harness(fast_config());
        let repository = Arc::new(h.repository);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let repository = Arc::clone(&repository);
            tasks.push(tokio::spawn(async move {
                repository
                    .add_key_value("contended", &format!("v{i}"))
                    .await
                    .unwrap()
            }));
        }

        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap() == AddOutcome::Success {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(
            repository.cache().get("contended"),
            h.store.value("contended")
        );
    }

    fn slow_reading(
        store: Arc<MemoryKeyValueStore>,
        read_delay: Duration,
    ) -> Arc<KeyValueRepository> {
        Arc::new(KeyValueRepository::new(
            NodeId::generate(),
            Arc::new(CacheStore::new()),
            Arc::new(DelayedStore {
                inner: store,
                read_delay,
                write_delay: Duration::ZERO,
            }),
            Arc::new(MemoryInvalidationBus::new(16)),
            fast_config(),
        ))
    }

    #[tokio::test]
    async fn marker_arriving_during_reconcile_is_kept() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let repository = slow_reading(Arc::clone(&store), Duration::from_millis(200));
        repository.add_key_value("k", "v1").await.unwrap();

        store.put("k", "v2");
        repository.mark_modified("k").await;
        let reader = {
            let repository = Arc::clone(&repository);
            tokio::spawn(async move { repository.get_value_by_key("k").await })
        };
        // The reader holds the key and has already fetched "v2".
        sleep(Duration::from_millis(50)).await;

        store.put("k", "v3");
        let marker = {
            let repository = Arc::clone(&repository);
            tokio::spawn(async move { repository.mark_modified("k").await })
        };

        assert_eq!(
            reader.await.unwrap().unwrap(),
            GetOutcome::Success("v2".to_string())
        );
        marker.await.unwrap();
        assert_eq!(
            repository.cache().staleness("k"),
            Staleness::ModifiedRemotely
        );
        assert_eq!(
            repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::Success("v3".to_string())
        );
    }

    #[tokio::test]
    async fn distrust_during_warm_marks_loaded_entries() {
        let store = Arc::new(MemoryKeyValueStore::new());
        store.put("k", "v1");
        let repository = slow_reading(Arc::clone(&store), Duration::from_millis(200));

        let warming = {
            let repository = Arc::clone(&repository);
            tokio::spawn(async move { repository.warm().await })
        };
        sleep(Duration::from_millis(50)).await;

        store.put("k", "v2");
        assert_eq!(repository.mark_all_modified().await, 0);

        assert_eq!(warming.await.unwrap().unwrap(), 1);
        assert_eq!(
            repository.cache().staleness("k"),
            Staleness::ModifiedRemotely
        );
        assert_eq!(
            repository.get_value_by_key("k").await.unwrap(),
            GetOutcome::Success("v2".to_string())
        );
    }
}
