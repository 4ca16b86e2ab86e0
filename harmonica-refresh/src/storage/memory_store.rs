//! In-process [`SummaryStore`] with the same semantics as the SQLite store.
//!
//! Used by tests and by embedders that keep watermarks elsewhere. Failures can
//! be injected to exercise the coordinator's recovery paths.

use super::{SummaryStore, SummaryVersion, now_millis};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default, Clone)]
struct Record {
    last_edit: i64,
    last_summary_update: i64,
    summary: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<String, Record>,
    projects: HashMap<String, (Record, Vec<String>)>,
    /// user session id -> (session id, last edit)
    user_sessions: HashMap<String, (String, i64)>,
}

impl Tables {
    fn record_mut(&mut self, resource_id: &str) -> Option<&mut Record> {
        if let Some(record) = self.sessions.get_mut(resource_id) {
            return Some(record);
        }
        self.projects.get_mut(resource_id).map(|(record, _)| record)
    }

    fn session_last_edit(&self, session_id: &str) -> Option<i64> {
        let host = self.sessions.get(session_id)?.last_edit;
        let participants = self
            .user_sessions
            .values()
            .filter(|(owner, _)| owner == session_id)
            .map(|(_, edit)| *edit)
            .max()
            .unwrap_or(0);
        Some(host.max(participants))
    }
}

/// Mutex-guarded maps standing in for the sessions/projects tables.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, session_id: &str) {
        self.lock()
            .sessions
            .entry(session_id.to_string())
            .or_default();
    }

    pub fn add_user_session(&self, user_session_id: &str, session_id: &str) {
        self.lock()
            .user_sessions
            .insert(user_session_id.to_string(), (session_id.to_string(), 0));
    }

    pub fn add_project(&self, project_id: &str, session_ids: &[&str]) {
        let members = session_ids.iter().map(|s| s.to_string()).collect();
        self.lock()
            .projects
            .insert(project_id.to_string(), (Record::default(), members));
    }

    /// Overwrite both watermarks of a session or project.
    pub fn set_version(&self, resource_id: &str, version: SummaryVersion) {
        let mut tables = self.lock();
        if let Some(record) = tables.record_mut(resource_id) {
            record.last_edit = version.last_edit;
            record.last_summary_update = version.last_summary_update;
        }
    }

    pub fn summary(&self, resource_id: &str) -> Option<String> {
        let tables = self.lock();
        tables
            .sessions
            .get(resource_id)
            .or_else(|| tables.projects.get(resource_id).map(|(record, _)| record))
            .and_then(|record| record.summary.clone())
    }

    /// Make every subsequent read fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock only means a test panicked mid-write; the maps are still usable
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn get_summary_version(
        &self,
        resource_id: &str,
        is_project: bool,
    ) -> Result<SummaryVersion> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("injected read failure"));
        }
        let tables = self.lock();
        if is_project {
            let (record, members) = tables
                .projects
                .get(resource_id)
                .ok_or_else(|| anyhow!("Unknown project: {resource_id}"))?;
            let last_edit = members
                .iter()
                .filter_map(|session_id| tables.session_last_edit(session_id))
                .fold(record.last_edit, i64::max);
            Ok(SummaryVersion::new(last_edit, record.last_summary_update))
        } else {
            let record = tables
                .sessions
                .get(resource_id)
                .ok_or_else(|| anyhow!("Unknown session: {resource_id}"))?;
            let last_edit = tables.session_last_edit(resource_id).unwrap_or(0);
            Ok(SummaryVersion::new(last_edit, record.last_summary_update))
        }
    }

    async fn update_user_last_edit(&self, user_session_id: &str) -> Result<()> {
        self.check_write()?;
        let mut tables = self.lock();
        let (_, edit) = tables
            .user_sessions
            .get_mut(user_session_id)
            .ok_or_else(|| anyhow!("Unknown user session: {user_session_id}"))?;
        *edit = (*edit).max(now_millis());
        Ok(())
    }

    async fn update_host_last_edit(&self, resource_id: &str) -> Result<()> {
        self.check_write()?;
        let mut tables = self.lock();
        let record = tables
            .record_mut(resource_id)
            .ok_or_else(|| anyhow!("Unknown resource: {resource_id}"))?;
        record.last_edit = record.last_edit.max(now_millis());
        Ok(())
    }

    async fn update_last_summary_update(&self, resource_id: &str) -> Result<()> {
        self.check_write()?;
        let mut tables = self.lock();
        let record = tables
            .record_mut(resource_id)
            .ok_or_else(|| anyhow!("Unknown resource: {resource_id}"))?;
        record.last_summary_update = record.last_summary_update.max(now_millis());
        Ok(())
    }

    async fn save_summary(&self, resource_id: &str, summary: &str) -> Result<()> {
        self.check_write()?;
        let mut tables = self.lock();
        let record = tables
            .record_mut(resource_id)
            .ok_or_else(|| anyhow!("Unknown resource: {resource_id}"))?;
        record.summary = Some(summary.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_project_sees_member_edits() -> Result<()> {
        let store = MemoryStore::new();
        store.add_session("sess-1");
        store.add_session("sess-2");
        store.add_user_session("user-1", "sess-2");
        store.add_project("proj-1", &["sess-1", "sess-2"]);

        store.update_user_last_edit("user-1").await?;
        let project = store.get_summary_version("proj-1", true).await?;
        let session = store.get_summary_version("sess-2", false).await?;
        assert!(project.is_stale());
        assert_eq!(project.last_edit, session.last_edit);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failures() -> Result<()> {
        let store = MemoryStore::new();
        store.add_session("sess-1");

        store.set_fail_writes(true);
        assert!(store.update_host_last_edit("sess-1").await.is_err());
        store.set_fail_writes(false);
        store.update_host_last_edit("sess-1").await?;

        store.set_fail_reads(true);
        assert!(store.get_summary_version("sess-1", false).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_set_version_and_summary() -> Result<()> {
        let store = MemoryStore::new();
        store.add_session("sess-1");
        store.set_version("sess-1", SummaryVersion::new(200, 100));
        assert_eq!(
            store.get_summary_version("sess-1", false).await?,
            SummaryVersion::new(200, 100)
        );

        store.save_summary("sess-1", "two themes").await?;
        assert_eq!(store.summary("sess-1").as_deref(), Some("two themes"));
        Ok(())
    }
}
