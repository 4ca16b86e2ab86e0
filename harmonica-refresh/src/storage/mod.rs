//! Storage abstraction for summary versions
//!
//! The coordinator never owns persistent state. It reads and advances two
//! watermarks per resource through the [`SummaryStore`] trait and tells dependent
//! read views to refresh through [`CacheInvalidator`].
//!
//! ## Key Components
//!
//! - **SummaryStore**: edit/summary watermarks and stored summary text
//! - **CacheInvalidator**: keyed invalidation of cached read views
//! - **SqliteStore**: sqlx-backed implementation
//! - **MemoryStore**: in-process implementation for tests and tooling
//!
//! ## Architecture
//!
//! ```text
//! SummaryCoordinator ── SummaryStore ─┬─ SqliteStore
//!         │                           └─ MemoryStore
//!         └──────────── CacheInvalidator ─┬─ NoopInvalidator
//!                                         └─ BroadcastInvalidator
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub mod memory_store;
pub mod sqlite_store;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Edit and summary watermarks for one resource, in Unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryVersion {
    pub last_edit: i64,
    pub last_summary_update: i64,
}

impl SummaryVersion {
    pub fn new(last_edit: i64, last_summary_update: i64) -> Self {
        Self {
            last_edit,
            last_summary_update,
        }
    }

    /// The summary predates the most recent edit.
    pub fn is_stale(&self) -> bool {
        self.last_edit > self.last_summary_update
    }
}

/// Persistence operations the coordinator depends on.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Read both watermarks for a session, or for a project when `is_project`
    async fn get_summary_version(&self, resource_id: &str, is_project: bool)
    -> Result<SummaryVersion>;

    /// Record a participant edit against their user session
    async fn update_user_last_edit(&self, user_session_id: &str) -> Result<()>;

    /// Record a host edit against a session or project
    async fn update_host_last_edit(&self, resource_id: &str) -> Result<()>;

    /// Advance the "summary refreshed" watermark to now
    async fn update_last_summary_update(&self, resource_id: &str) -> Result<()>;

    /// Persist freshly generated summary text
    async fn save_summary(&self, resource_id: &str, summary: &str) -> Result<()>;
}

/// Cached read views that depend on a resource's summary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "resource_id", rename_all = "snake_case")]
pub enum CacheKey {
    SummaryContent(String),
    SummaryVersion(String),
}

impl CacheKey {
    /// Every key that must be dropped once `resource_id` has a new summary.
    pub fn for_resource(resource_id: &str) -> [CacheKey; 2] {
        [
            CacheKey::SummaryContent(resource_id.to_string()),
            CacheKey::SummaryVersion(resource_id.to_string()),
        ]
    }
}

/// Keyed invalidation of cached read views.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, key: CacheKey) -> Result<()>;
}

/// Invalidator for deployments without a read cache.
#[derive(Debug, Default, Clone)]
pub struct NoopInvalidator;

#[async_trait]
impl CacheInvalidator for NoopInvalidator {
    async fn invalidate(&self, _key: CacheKey) -> Result<()> {
        Ok(())
    }
}

/// Publishes invalidated keys to any number of listeners.
#[derive(Debug, Clone)]
pub struct BroadcastInvalidator {
    tx: broadcast::Sender<CacheKey>,
}

impl BroadcastInvalidator {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheKey> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl CacheInvalidator for BroadcastInvalidator {
    async fn invalidate(&self, key: CacheKey) -> Result<()> {
        // No listeners is not an error: nothing is cached.
        if self.tx.send(key.clone()).is_err() {
            tracing::trace!("No cache listeners for {:?}", key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness() {
        assert!(SummaryVersion::new(200, 100).is_stale());
        assert!(!SummaryVersion::new(100, 100).is_stale());
        assert!(!SummaryVersion::new(100, 200).is_stale());
    }

    #[test]
    fn test_cache_keys_for_resource() {
        let keys = CacheKey::for_resource("sess-1");
        assert_eq!(keys[0], CacheKey::SummaryContent("sess-1".into()));
        assert_eq!(keys[1], CacheKey::SummaryVersion("sess-1".into()));
    }

    #[tokio::test]
    async fn test_broadcast_invalidator_delivers_keys() -> Result<()> {
        let invalidator = BroadcastInvalidator::new(8);
        // Sending without listeners must still succeed
        invalidator
            .invalidate(CacheKey::SummaryContent("early".into()))
            .await?;

        let mut rx = invalidator.subscribe();
        invalidator
            .invalidate(CacheKey::SummaryVersion("sess-1".into()))
            .await?;
        assert_eq!(rx.recv().await?, CacheKey::SummaryVersion("sess-1".into()));
        Ok(())
    }
}
