//! Single entry point for stale-summary coordination.
//!
//! [`SummaryCoordinator`] owns one [`StaleTracker`] and wires it to the store,
//! the summarizer and the cache invalidator. Edits are recorded through
//! [`register_edit`](SummaryCoordinator::register_edit); regeneration is either
//! debounced ([`schedule_update`](SummaryCoordinator::schedule_update)) or forced
//! ([`update_now`](SummaryCoordinator::update_now)). Both paths share the
//! tracker's status, so they can never regenerate the same resource twice at
//! once.
//!
//! ```text
//! register_edit ──► SummaryStore (last_edit)
//!                        │
//!   SummaryPoller ◄──────┘
//!        │ stale
//!        ├── schedule_update ──► StaleTracker timer ─┐
//!        └── update_now ─────────────────────────────┴─► regenerate
//!                                                          │
//!     Summarizer ─► save_summary ─► update_last_summary_update ─► invalidate
//! ```

use super::stale_tracker::{StaleTracker, Subscription};
use super::status::{RefreshStatus, UpdateOutcome};
use crate::config::RefreshConfig;
use crate::error::Result;
use crate::storage::{CacheInvalidator, CacheKey, SummaryStore, SummaryVersion, now_millis};
use crate::summarizer::Summarizer;
use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Who made an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditSource {
    /// The host edited the session or project itself
    Host,
    /// A participant's chat advanced; recorded on their user session
    Participant { user_session_id: String },
}

/// What a regeneration should summarize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SummaryScope {
    /// The resource is a single session
    #[default]
    Session,
    /// The resource aggregates several sessions
    Project {
        /// Defaults to the resource id
        project_id: Option<String>,
        session_ids: Vec<String>,
    },
}

impl SummaryScope {
    pub fn project(session_ids: Vec<String>) -> Self {
        Self::Project {
            project_id: None,
            session_ids,
        }
    }

    pub fn is_project(&self) -> bool {
        matches!(self, Self::Project { .. })
    }
}

/// Local bookkeeping for one resource. No I/O is needed to read it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrarState {
    pub is_running: bool,
    /// When this process last registered an edit, Unix millis
    pub last_edit_timestamp: Option<i64>,
}

/// Everything the coordinator knows about a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub resource_id: String,
    pub status: RefreshStatus,
    pub pending_timer: bool,
    pub last_registered_edit: Option<i64>,
    #[serde(flatten)]
    pub state: RegistrarState,
}

struct CoordinatorInner {
    config: RefreshConfig,
    tracker: StaleTracker,
    store: Arc<dyn SummaryStore>,
    summarizer: Arc<dyn Summarizer>,
    invalidator: Arc<dyn CacheInvalidator>,
    edits: Mutex<HashMap<String, i64>>,
}

/// Coordinates edits and summary regeneration. Clones share all state.
#[derive(Clone)]
pub struct SummaryCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for SummaryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryCoordinator")
            .field("config", &self.inner.config)
            .field("tracker", &self.inner.tracker)
            .finish()
    }
}

impl SummaryCoordinator {
    pub fn new(
        config: RefreshConfig,
        store: Arc<dyn SummaryStore>,
        summarizer: Arc<dyn Summarizer>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        let tracker = StaleTracker::new(config.debounce(), config.event_capacity);
        info!(
            "Summary coordinator ready (debounce {:?}, poll every {:?})",
            config.debounce(),
            config.poll_interval()
        );
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                tracker,
                store,
                summarizer,
                invalidator,
                edits: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &StaleTracker {
        &self.inner.tracker
    }

    pub fn store(&self) -> &Arc<dyn SummaryStore> {
        &self.inner.store
    }

    pub fn get_status(&self, resource_id: &str) -> RefreshStatus {
        self.inner.tracker.get_status(resource_id)
    }

    pub fn subscribe<F>(&self, resource_id: &str, callback: F) -> Subscription
    where
        F: Fn(RefreshStatus) + Send + Sync + 'static,
    {
        self.inner.tracker.subscribe(resource_id, callback)
    }

    fn edits(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        self.inner.edits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist that `resource_id` was edited.
    ///
    /// Failures are logged and swallowed: the next poll simply sees the old
    /// timestamp and does nothing.
    pub async fn register_edit(&self, resource_id: &str, source: EditSource) {
        self.edits().insert(resource_id.to_string(), now_millis());

        let result = match &source {
            EditSource::Participant { user_session_id } => {
                self.inner.store.update_user_last_edit(user_session_id).await
            }
            EditSource::Host => self.inner.store.update_host_last_edit(resource_id).await,
        };

        match result {
            Ok(()) => debug!("Registered {:?} edit for {resource_id}", source),
            Err(e) => warn!("Failed to register edit for {resource_id}: {e:#}"),
        }
    }

    /// Regenerate now, logging instead of returning failures.
    pub async fn update_now(&self, resource_id: &str, scope: SummaryScope) {
        match self.try_update_now(resource_id, scope).await {
            Ok(UpdateOutcome::Completed) => {}
            Ok(UpdateOutcome::AlreadyRunning) => {
                debug!("Skipped update for {resource_id}: already running")
            }
            Err(e) => warn!("Summary update failed: {e:#}"),
        }
    }

    /// Regenerate now and report the outcome; the resource is `Outdated` on error.
    pub async fn try_update_now(
        &self,
        resource_id: &str,
        scope: SummaryScope,
    ) -> Result<UpdateOutcome> {
        self.inner
            .tracker
            .start_update_now(resource_id, self.regeneration(resource_id, scope))
            .await
    }

    /// Debounced regeneration; see [`StaleTracker::schedule_update`].
    pub fn schedule_update(&self, resource_id: &str, version: SummaryVersion, scope: SummaryScope) {
        self.inner
            .tracker
            .schedule_update(resource_id, version, self.regeneration(resource_id, scope));
    }

    /// Whether the stored summary predates the latest edit.
    pub async fn needs_update(&self, resource_id: &str, is_project: bool) -> Result<bool> {
        let version = self
            .inner
            .store
            .get_summary_version(resource_id, is_project)
            .await?;
        Ok(version.is_stale())
    }

    pub fn get_state(&self, resource_id: &str) -> RegistrarState {
        RegistrarState {
            is_running: self.get_status(resource_id).is_running(),
            last_edit_timestamp: self.edits().get(resource_id).copied(),
        }
    }

    /// Drop the locally recorded edit timestamp.
    pub fn clear_state(&self, resource_id: &str) {
        self.edits().remove(resource_id);
    }

    /// Forget the resource entirely, cancelling any pending regeneration.
    pub fn cleanup(&self, resource_id: &str) {
        self.inner.tracker.cleanup(resource_id);
        self.clear_state(resource_id);
    }

    pub fn snapshot(&self, resource_id: &str) -> ResourceSnapshot {
        let tracker = &self.inner.tracker;
        ResourceSnapshot {
            resource_id: resource_id.to_string(),
            status: tracker.get_status(resource_id),
            pending_timer: tracker.has_pending_timer(resource_id),
            last_registered_edit: tracker.last_registered_edit(resource_id),
            state: self.get_state(resource_id),
        }
    }

    /// Summarize, persist, advance the watermark, then invalidate cached views.
    fn regeneration(
        &self,
        resource_id: &str,
        scope: SummaryScope,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let resource_id = resource_id.to_string();
        move || {
            async move {
                let summary = match &scope {
                    SummaryScope::Project {
                        project_id,
                        session_ids,
                    } if !session_ids.is_empty() => {
                        let project_id = project_id.as_deref().unwrap_or(&resource_id);
                        inner
                            .summarizer
                            .create_multi_session_summary(session_ids, project_id)
                            .await?
                    }
                    _ => inner.summarizer.create_summary(&resource_id).await?,
                };

                inner
                    .store
                    .save_summary(&resource_id, &summary)
                    .await
                    .context("Failed to store summary")?;
                inner
                    .store
                    .update_last_summary_update(&resource_id)
                    .await
                    .context("Failed to advance summary watermark")?;

                for key in CacheKey::for_resource(&resource_id) {
                    if let Err(e) = inner.invalidator.invalidate(key).await {
                        warn!("Cache invalidation failed for {resource_id}: {e:#}");
                    }
                }
                anyhow::Ok(())
            }
            .boxed()
        }
    }
}
