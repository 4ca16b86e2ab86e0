//! Integration tests for the summary refresh pipeline over an on-disk database
//!
//! These tests verify that the pieces work together against SQLite:
//! - Host and participant edits make sessions and projects stale
//! - Debounced and immediate regeneration store a summary and advance the watermark
//! - Project summaries span member sessions
//! - The polling driver picks up edits made through the store

use anyhow::Result;
use harmonica_refresh::{
    config::RefreshConfig,
    refresh::{
        EditSource, PollOptions, RefreshStatus, SummaryCoordinator, SummaryPoller, SummaryScope,
    },
    storage::{
        BroadcastInvalidator, CacheKey, SummaryStore, SummaryVersion, sqlite_store::SqliteStore,
    },
    summarizer::{MockSummarizer, SummarizerCall},
};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};
use tokio::time::{Duration, sleep, timeout};

struct Harness {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    summarizer: MockSummarizer,
    invalidator: BroadcastInvalidator,
    coordinator: SummaryCoordinator,
}

async fn harness() -> Result<Harness> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStore::open(dir.path()).await?);
    store.create_session("sess-1").await?;
    store.create_session("sess-2").await?;
    store.create_user_session("user-1", "sess-2").await?;
    store
        .create_project("proj-1", &["sess-1".to_string(), "sess-2".to_string()])
        .await?;

    let summarizer = MockSummarizer::new();
    let invalidator = BroadcastInvalidator::new(16);
    let config = RefreshConfig::default()
        .with_debounce_secs(1)
        .with_poll_interval_secs(1);
    let coordinator = SummaryCoordinator::new(
        config,
        store.clone(),
        Arc::new(summarizer.clone()),
        Arc::new(invalidator.clone()),
    );

    Ok(Harness {
        _dir: dir,
        store,
        summarizer,
        invalidator,
        coordinator,
    })
}

/// Wait until `resource_id` reaches `status`, failing after a few seconds.
async fn wait_for_status(
    coordinator: &SummaryCoordinator,
    resource_id: &str,
    status: RefreshStatus,
) -> Result<()> {
    timeout(Duration::from_secs(10), async {
        while coordinator.get_status(resource_id) != status {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("{resource_id} never reached {status}"))
}

/// Test the full host edit to stored summary flow with the debounce window
#[tokio::test]
async fn test_debounced_refresh_after_host_edit() -> Result<()> {
    let h = harness().await?;
    assert!(!h.coordinator.needs_update("sess-1", false).await?);

    h.coordinator.register_edit("sess-1", EditSource::Host).await;
    let version = h.store.get_summary_version("sess-1", false).await?;
    assert!(version.is_stale());

    h.coordinator
        .schedule_update("sess-1", version, SummaryScope::Session);
    assert_eq!(h.coordinator.get_status("sess-1"), RefreshStatus::UpdatePending);
    assert_eq!(h.summarizer.call_count(), 0);

    wait_for_status(&h.coordinator, "sess-1", RefreshStatus::UpToDate).await?;
    assert_eq!(h.summarizer.call_count(), 1);
    assert_eq!(
        h.store.get_summary("sess-1").await?.as_deref(),
        Some("Summary of sess-1")
    );
    assert!(!h.coordinator.needs_update("sess-1", false).await?);

    Ok(())
}

/// Test that a participant edit makes both the session and its projects stale
#[tokio::test]
async fn test_participant_edit_refreshes_project() -> Result<()> {
    let h = harness().await?;
    let mut invalidations = h.invalidator.subscribe();

    h.coordinator
        .register_edit(
            "sess-2",
            EditSource::Participant {
                user_session_id: "user-1".to_string(),
            },
        )
        .await;
    assert!(h.coordinator.needs_update("sess-2", false).await?);
    assert!(h.coordinator.needs_update("proj-1", true).await?);
    assert!(!h.coordinator.needs_update("sess-1", false).await?);

    let session_ids = h.store.project_sessions("proj-1").await?;
    h.coordinator
        .update_now("proj-1", SummaryScope::project(session_ids))
        .await;

    assert_eq!(h.coordinator.get_status("proj-1"), RefreshStatus::UpToDate);
    assert!(!h.coordinator.needs_update("proj-1", true).await?);
    assert_eq!(
        h.store.get_summary("proj-1").await?.as_deref(),
        Some("Summary of proj-1 across 2 sessions")
    );

    let calls = h.summarizer.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![SummarizerCall::Project {
            project_id: "proj-1".to_string(),
            session_ids: vec!["sess-1".to_string(), "sess-2".to_string()],
        }]
    );

    let mut keys = vec![invalidations.recv().await?, invalidations.recv().await?];
    keys.sort_by_key(|key| format!("{key:?}"));
    assert_eq!(
        keys,
        vec![
            CacheKey::SummaryContent("proj-1".to_string()),
            CacheKey::SummaryVersion("proj-1".to_string()),
        ]
    );

    Ok(())
}

/// Test that a failed regeneration leaves the resource outdated and stale
#[tokio::test]
async fn test_failed_refresh_keeps_resource_stale() -> Result<()> {
    let h = harness().await?;
    h.coordinator.register_edit("sess-1", EditSource::Host).await;

    h.summarizer.set_fail(true);
    h.coordinator
        .update_now("sess-1", SummaryScope::Session)
        .await;
    assert_eq!(h.coordinator.get_status("sess-1"), RefreshStatus::Outdated);
    assert!(h.coordinator.needs_update("sess-1", false).await?);
    assert_eq!(h.store.get_summary("sess-1").await?, None);

    h.summarizer.set_fail(false);
    h.coordinator
        .update_now("sess-1", SummaryScope::Session)
        .await;
    assert_eq!(h.coordinator.get_status("sess-1"), RefreshStatus::UpToDate);
    assert!(!h.coordinator.needs_update("sess-1", false).await?);

    Ok(())
}

/// Test that the immediate poller regenerates for edits made by other writers
#[tokio::test]
async fn test_poller_follows_store_edits() -> Result<()> {
    let h = harness().await?;
    let poller = SummaryPoller::spawn(
        h.coordinator.clone(),
        "sess-1",
        PollOptions::immediate(&h.coordinator, SummaryScope::Session),
    )?;

    // Another process records the edit directly in the database
    h.store.update_host_last_edit("sess-1").await?;

    timeout(Duration::from_secs(10), async {
        while h.summarizer.call_count() == 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    wait_for_status(&h.coordinator, "sess-1", RefreshStatus::UpToDate).await?;
    assert!(!h.coordinator.needs_update("sess-1", false).await?);

    poller.shutdown();
    assert_eq!(h.coordinator.get_status("sess-1"), RefreshStatus::Unknown);

    Ok(())
}

/// Test that summaries and watermarks survive reopening the database
#[tokio::test]
async fn test_summary_persists_across_reopen() -> Result<()> {
    let h = harness().await?;
    h.coordinator.register_edit("sess-1", EditSource::Host).await;
    h.coordinator
        .update_now("sess-1", SummaryScope::Session)
        .await;
    let before = h.store.get_summary_version("sess-1", false).await?;

    let reopened = SqliteStore::open(h._dir.path()).await?;
    let after = reopened.get_summary_version("sess-1", false).await?;
    assert_eq!(before, after);
    assert!(!after.is_stale());
    assert_eq!(
        reopened.get_summary("sess-1").await?.as_deref(),
        Some("Summary of sess-1")
    );
    assert_ne!(after, SummaryVersion::default());
    Ok(())
}
