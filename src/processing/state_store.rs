// src/processing/state_store.rs
//
// Per-document {total, processed} counters used to detect "all sub-work
// done". The remote backend is authoritative and shared across worker
// instances; the in-process map only has to survive a remote outage window,
// so it is deliberately not durable or shared.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StateStoreSettings;
use crate::error::Result;
use crate::utils::prometheus_metrics::STATE_STORE_FALLBACK_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingProgress {
    pub total_items: u32,
    pub processed_items: u32,
}

impl ProcessingProgress {
    pub fn is_complete(&self) -> bool {
        self.processed_items >= self.total_items
    }
}

/// TTL-bounded counter keyed by document id.
#[async_trait]
pub trait ProcessingStateStore: Send + Sync {
    /// Sets `{total_items, processed: 0}`. The TTL cleans up abandoned
    /// documents without any background sweeper.
    async fn initialize(&self, document_id: Uuid, total_items: u32) -> Result<()>;

    /// Atomically increments `processed`. Returns `None` (a no-op) when no
    /// state exists, which covers duplicate and late feedback.
    async fn increment_processed(&self, document_id: Uuid) -> Result<Option<ProcessingProgress>>;

    /// True once `processed >= total`. Deletes the entry when returning true,
    /// so completion can be consumed exactly once.
    async fn is_complete(&self, document_id: Uuid) -> Result<bool>;

    /// Unconditional removal, used on failure paths.
    async fn clear(&self, document_id: Uuid) -> Result<()>;
}

// --- Redis backend ---

fn state_key(document_id: Uuid) -> String {
    format!("receiptflow:processing:{}", document_id)
}

// Existence check + increment must be one atomic step at the store, since
// multiple worker instances increment the same document concurrently.
const INCREMENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  local p = redis.call('HINCRBY', KEYS[1], 'processed', 1)
  local t = redis.call('HGET', KEYS[1], 'total')
  return {tonumber(t), p}
else
  return false
end
"#;

// Read + conditional delete in one step so only one caller observes "true".
const COMPLETE_SCRIPT: &str = r#"
local vals = redis.call('HMGET', KEYS[1], 'total', 'processed')
if not vals[1] then
  return 0
end
if tonumber(vals[2]) >= tonumber(vals[1]) then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#;

pub struct RedisStateStore {
    manager: ConnectionManager,
    ttl: Duration,
    increment_script: Script,
    complete_script: Script,
}

impl RedisStateStore {
    pub fn new(manager: ConnectionManager, ttl: Duration) -> Self {
        RedisStateStore {
            manager,
            ttl,
            increment_script: Script::new(INCREMENT_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
        }
    }

    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(RedisStateStore::new(manager, ttl))
    }
}

#[async_trait]
impl ProcessingStateStore for RedisStateStore {
    async fn initialize(&self, document_id: Uuid, total_items: u32) -> Result<()> {
        let key = state_key(document_id);
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .hset(&key, "total", total_items)
            .hset(&key, "processed", 0u32)
            .expire(&key, self.ttl.as_secs() as i64)
            .query_async::<()>(&mut conn)
            .await?;
        debug!(document_id = %document_id, total_items, "Initialized processing state");
        Ok(())
    }

    async fn increment_processed(&self, document_id: Uuid) -> Result<Option<ProcessingProgress>> {
        let key = state_key(document_id);
        let mut conn = self.manager.clone();
        let result: Option<(u32, u32)> = self
            .increment_script
            .key(&key)
            .invoke_async(&mut conn)
            .await?;

        match result {
            Some((total_items, processed_items)) => Ok(Some(ProcessingProgress {
                total_items,
                processed_items,
            })),
            None => {
                warn!(
                    document_id = %document_id,
                    "Increment for document without processing state; dropping"
                );
                Ok(None)
            }
        }
    }

    async fn is_complete(&self, document_id: Uuid) -> Result<bool> {
        let key = state_key(document_id);
        let mut conn = self.manager.clone();
        let complete: i32 = self
            .complete_script
            .key(&key)
            .invoke_async(&mut conn)
            .await?;
        Ok(complete == 1)
    }

    async fn clear(&self, document_id: Uuid) -> Result<()> {
        let key = state_key(document_id);
        let mut conn = self.manager.clone();
        redis::cmd("DEL").arg(&key).query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

// --- In-process fallback backend ---

struct LocalEntry {
    total_items: u32,
    processed_items: u32,
    expires_at: Instant,
}

pub struct InMemoryStateStore {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, LocalEntry>>,
}

impl InMemoryStateStore {
    pub fn new(ttl: Duration) -> Self {
        InMemoryStateStore {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProcessingStateStore for InMemoryStateStore {
    async fn initialize(&self, document_id: Uuid, total_items: u32) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            document_id,
            LocalEntry {
                total_items,
                processed_items: 0,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn increment_processed(&self, document_id: Uuid) -> Result<Option<ProcessingProgress>> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&document_id) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.processed_items += 1;
                Ok(Some(ProcessingProgress {
                    total_items: entry.total_items,
                    processed_items: entry.processed_items,
                }))
            }
            _ => {
                entries.remove(&document_id);
                warn!(
                    document_id = %document_id,
                    "Increment for document without processing state; dropping"
                );
                Ok(None)
            }
        }
    }

    async fn is_complete(&self, document_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let complete = match entries.get(&document_id) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.processed_items >= entry.total_items
            }
            _ => false,
        };
        if complete {
            entries.remove(&document_id);
        }
        Ok(complete)
    }

    async fn clear(&self, document_id: Uuid) -> Result<()> {
        self.entries.lock().await.remove(&document_id);
        Ok(())
    }
}

// --- Resilience wrapper ---

/// Tries the primary (remote) store first, retrying a bounded number of times
/// with fixed backoff; on persistent remote failure the operation degrades to
/// the in-process fallback instead of failing the pipeline.
///
/// A counter initialized in the fallback during an outage stays there, so
/// reads that come up empty against a healthy primary are re-checked against
/// the fallback before being treated as missing.
pub struct ResilientStateStore {
    primary: Arc<dyn ProcessingStateStore>,
    fallback: Arc<dyn ProcessingStateStore>,
    remote_attempts: u32,
    remote_backoff: Duration,
}

impl ResilientStateStore {
    pub fn new(
        primary: Arc<dyn ProcessingStateStore>,
        fallback: Arc<dyn ProcessingStateStore>,
        settings: &StateStoreSettings,
    ) -> Self {
        ResilientStateStore {
            primary,
            fallback,
            remote_attempts: settings.remote_attempts,
            remote_backoff: settings.remote_backoff(),
        }
    }

    /// Retries `op` against the primary; `Ok(None)` means every attempt
    /// failed and the caller should degrade.
    async fn try_primary<T, F, Fut>(&self, op_name: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        for attempt in 1..=self.remote_attempts {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.remote_attempts,
                        operation = op_name,
                        error = %e,
                        "Remote state store operation failed"
                    );
                    if attempt < self.remote_attempts {
                        sleep(self.remote_backoff).await;
                    }
                }
            }
        }
        STATE_STORE_FALLBACK_TOTAL.inc();
        warn!(
            operation = op_name,
            "Remote state store unreachable; degrading to in-process fallback"
        );
        None
    }
}

#[async_trait]
impl ProcessingStateStore for ResilientStateStore {
    async fn initialize(&self, document_id: Uuid, total_items: u32) -> Result<()> {
        match self
            .try_primary("initialize", || {
                self.primary.initialize(document_id, total_items)
            })
            .await
        {
            Some(()) => Ok(()),
            None => self.fallback.initialize(document_id, total_items).await,
        }
    }

    async fn increment_processed(&self, document_id: Uuid) -> Result<Option<ProcessingProgress>> {
        match self
            .try_primary("increment_processed", || {
                self.primary.increment_processed(document_id)
            })
            .await
        {
            Some(Some(progress)) => Ok(Some(progress)),
            // Primary reachable but has no state: the counter may live in the
            // fallback from an earlier outage.
            Some(None) => self.fallback.increment_processed(document_id).await,
            None => self.fallback.increment_processed(document_id).await,
        }
    }

    async fn is_complete(&self, document_id: Uuid) -> Result<bool> {
        match self
            .try_primary("is_complete", || self.primary.is_complete(document_id))
            .await
        {
            Some(true) => Ok(true),
            Some(false) => self.fallback.is_complete(document_id).await,
            None => self.fallback.is_complete(document_id).await,
        }
    }

    async fn clear(&self, document_id: Uuid) -> Result<()> {
        // Clear both sides; the entry lives in exactly one of them.
        if self
            .try_primary("clear", || self.primary.clear(document_id))
            .await
            .is_none()
        {
            debug!(document_id = %document_id, "Primary clear skipped (remote unreachable)");
        }
        self.fallback.clear(document_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn settings() -> StateStoreSettings {
        StateStoreSettings {
            ttl_secs: 60,
            remote_attempts: 2,
            remote_backoff_ms: 1,
        }
    }

    /// A primary that always fails, to exercise the degradation path.
    struct DownStore;

    #[async_trait]
    impl ProcessingStateStore for DownStore {
        async fn initialize(&self, _: Uuid, _: u32) -> Result<()> {
            Err(PipelineError::StateStoreError("connection refused".into()))
        }
        async fn increment_processed(&self, _: Uuid) -> Result<Option<ProcessingProgress>> {
            Err(PipelineError::StateStoreError("connection refused".into()))
        }
        async fn is_complete(&self, _: Uuid) -> Result<bool> {
            Err(PipelineError::StateStoreError("connection refused".into()))
        }
        async fn clear(&self, _: Uuid) -> Result<()> {
            Err(PipelineError::StateStoreError("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn in_memory_counts_to_completion() {
        let store = InMemoryStateStore::new(Duration::from_secs(60));
        let doc = Uuid::new_v4();

        store.initialize(doc, 2).await.unwrap();
        let p1 = store.increment_processed(doc).await.unwrap().unwrap();
        assert_eq!(p1.processed_items, 1);
        assert!(!store.is_complete(doc).await.unwrap());

        let p2 = store.increment_processed(doc).await.unwrap().unwrap();
        assert!(p2.is_complete());
        assert!(store.is_complete(doc).await.unwrap());

        // Completion is consumed exactly once: the entry is gone now.
        assert!(!store.is_complete(doc).await.unwrap());
    }

    #[tokio::test]
    async fn increment_without_state_is_a_noop() {
        let store = InMemoryStateStore::new(Duration::from_secs(60));
        assert!(store
            .increment_processed(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_state_behaves_like_missing_state() {
        let store = InMemoryStateStore::new(Duration::from_millis(5));
        let doc = Uuid::new_v4();
        store.initialize(doc, 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(store.increment_processed(doc).await.unwrap().is_none());
        assert!(!store.is_complete(doc).await.unwrap());
    }

    #[tokio::test]
    async fn clear_removes_state() {
        let store = InMemoryStateStore::new(Duration::from_secs(60));
        let doc = Uuid::new_v4();
        store.initialize(doc, 3).await.unwrap();
        store.clear(doc).await.unwrap();
        assert!(store.increment_processed(doc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_primary_degrades_transparently() {
        let resilient = ResilientStateStore::new(
            Arc::new(DownStore),
            Arc::new(InMemoryStateStore::new(Duration::from_secs(60))),
            &settings(),
        );
        let doc = Uuid::new_v4();

        // Caller-visible behavior is identical to the healthy path.
        resilient.initialize(doc, 2).await.unwrap();
        assert_eq!(
            resilient
                .increment_processed(doc)
                .await
                .unwrap()
                .unwrap()
                .processed_items,
            1
        );
        assert!(!resilient.is_complete(doc).await.unwrap());
        assert!(resilient
            .increment_processed(doc)
            .await
            .unwrap()
            .unwrap()
            .is_complete());
        assert!(resilient.is_complete(doc).await.unwrap());
    }

    #[tokio::test]
    async fn healthy_primary_still_finds_fallback_state() {
        // State initialized during an outage lives in the fallback; a later
        // increment against a healthy (but empty) primary must still count.
        let primary = Arc::new(InMemoryStateStore::new(Duration::from_secs(60)));
        let fallback = Arc::new(InMemoryStateStore::new(Duration::from_secs(60)));
        let doc = Uuid::new_v4();
        fallback.initialize(doc, 1).await.unwrap();

        let resilient = ResilientStateStore::new(primary, fallback, &settings());
        let progress = resilient.increment_processed(doc).await.unwrap().unwrap();
        assert!(progress.is_complete());
        assert!(resilient.is_complete(doc).await.unwrap());
    }
}
