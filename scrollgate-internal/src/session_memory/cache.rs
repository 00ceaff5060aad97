use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, ErrorDetails};
use crate::session_memory::{
    RollingCounters, SessionEntry, SessionMemoryConfig, SessionMemorySnapshot, SessionMemoryUpdate,
};
use crate::storage::{SessionKind, StoreConnectionInfo};

#[derive(Debug, Default)]
struct SessionMemoryMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    rebuilds: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMemoryMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub rebuilds: u64,
    pub entries: u64,
}

/// TTL and size bounded cache of [`SessionMemorySnapshot`]s, keyed by user id
pub struct SessionMemoryCache {
    cache: Cache<String, SessionMemorySnapshot>,
    store: StoreConnectionInfo,
    config: SessionMemoryConfig,
    clock: Clock,
    metrics: SessionMemoryMetrics,
}

impl std::fmt::Debug for SessionMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMemoryCache")
            .field("entries", &self.cache.entry_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionMemoryCache {
    pub fn new(store: StoreConnectionInfo, config: SessionMemoryConfig, clock: Clock) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();
        Self {
            cache,
            store,
            config,
            clock,
            metrics: SessionMemoryMetrics::default(),
        }
    }

    /// Cached snapshot for `user_id`, rebuilt from the store on a miss.
    /// Concurrent misses for the same user share one rebuild.
    pub async fn get_snapshot(&self, user_id: &str) -> Result<SessionMemorySnapshot, Error> {
        if let Some(snapshot) = self.cache.get(user_id).await {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(snapshot);
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);

        self.cache
            .try_get_with(user_id.to_string(), self.rebuild(user_id))
            .await
            .map_err(|e: Arc<Error>| {
                // Already logged when the rebuild failed
                Error::new_without_logging(ErrorDetails::Storage {
                    message: e.to_string(),
                })
            })
    }

    async fn rebuild(&self, user_id: &str) -> Result<SessionMemorySnapshot, Error> {
        let rows = self
            .store
            .recent_sessions(user_id, self.config.history_window)
            .await?;
        let last_scan = self
            .store
            .latest_session_of_kind(user_id, SessionKind::Scan)
            .await?;
        let last_decree = self
            .store
            .latest_session_of_kind(user_id, SessionKind::Decree)
            .await?;

        let snapshot = SessionMemorySnapshot {
            user_id: user_id.to_string(),
            recent_sessions: rows
                .iter()
                .take(self.config.recent_limit as usize)
                .map(SessionEntry::from)
                .collect(),
            last_scan: last_scan.as_ref().map(SessionEntry::from),
            last_decree: last_decree.map(|r| r.derived_output),
            counters: RollingCounters::from_rows(&rows),
            built_at: self.clock.now(),
        };
        self.metrics.rebuilds.fetch_add(1, Ordering::Relaxed);
        debug!(user_id, rows = rows.len(), "Rebuilt session memory snapshot");
        Ok(snapshot)
    }

    /// Merge `update` into the cached snapshot. Users without a cached snapshot are left alone;
    /// their next read rebuilds from the store.
    pub async fn update(&self, user_id: &str, update: SessionMemoryUpdate) {
        if let Some(mut snapshot) = self.cache.get(user_id).await {
            snapshot.apply(update, self.config.recent_limit as usize);
            self.cache.insert(user_id.to_string(), snapshot).await;
        }
    }

    /// Drop one user's snapshot, or every snapshot when `user_id` is `None`
    pub async fn invalidate(&self, user_id: Option<&str>) {
        match user_id {
            Some(user_id) => self.cache.invalidate(user_id).await,
            None => self.cache.invalidate_all(),
        }
    }

    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    pub async fn metrics(&self) -> SessionMemoryMetricsSnapshot {
        SessionMemoryMetricsSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            rebuilds: self.metrics.rebuilds.load(Ordering::Relaxed),
            entries: self.entry_count().await,
        }
    }
}
