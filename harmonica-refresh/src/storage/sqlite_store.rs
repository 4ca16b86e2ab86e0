//! SQLite implementation of [`SummaryStore`]
//!
//! ## Database Schema
//!
//! ```sql
//! -- Host-level records; one summary per session
//! CREATE TABLE sessions (
//!     id TEXT PRIMARY KEY,
//!     last_edit INTEGER NOT NULL DEFAULT 0,            -- Unix millis
//!     last_summary_update INTEGER NOT NULL DEFAULT 0,  -- Unix millis
//!     summary TEXT
//! );
//!
//! -- Multi-session workspaces with an aggregate summary
//! CREATE TABLE projects ( ...same columns as sessions... );
//! CREATE TABLE project_sessions (project_id, session_id);
//!
//! -- Participant sub-records; their edits count towards the session
//! CREATE TABLE user_sessions (
//!     id TEXT PRIMARY KEY,
//!     session_id TEXT NOT NULL REFERENCES sessions(id),
//!     last_edit INTEGER NOT NULL DEFAULT 0
//! );
//! ```
//!
//! A session's effective `last_edit` is the newest of its host edit and all
//! participant edits. A project's is the newest of its own edit and every edit
//! in its member sessions.
//!
//! Sessions and projects share one id space: watermark and summary writes
//! address a resource by id alone, so an id may live in only one of the two
//! tables.

use super::{SummaryStore, SummaryVersion, now_millis};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File name of the database inside the base directory.
pub const DATABASE_FILE: &str = ".harmonica.db";

const SESSION_VERSION_SQL: &str = r#"
    SELECT s.last_summary_update AS last_summary_update,
           MAX(s.last_edit,
               COALESCE((SELECT MAX(u.last_edit) FROM user_sessions u WHERE u.session_id = s.id), 0)
           ) AS last_edit
    FROM sessions s
    WHERE s.id = ?
"#;

const PROJECT_VERSION_SQL: &str = r#"
    SELECT p.last_summary_update AS last_summary_update,
           MAX(p.last_edit,
               COALESCE((SELECT MAX(s.last_edit)
                         FROM sessions s
                         JOIN project_sessions ps ON ps.session_id = s.id
                         WHERE ps.project_id = p.id), 0),
               COALESCE((SELECT MAX(u.last_edit)
                         FROM user_sessions u
                         JOIN project_sessions ps ON ps.session_id = u.session_id
                         WHERE ps.project_id = p.id), 0)
           ) AS last_edit
    FROM projects p
    WHERE p.id = ?
"#;

/// sqlx-backed summary store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    base: Option<PathBuf>,
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the store persisted at `<base>/.harmonica.db`, creating it if missing.
    pub async fn open(base: &Path) -> Result<Self> {
        let db_path = base.join(DATABASE_FILE);

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(&db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true),
        )
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        Self::new_with_pool(Some(base.to_path_buf()), pool).await
    }

    /// Opens a store that lives only as long as this value. Intended for tests.
    pub async fn open_memory() -> Result<Self> {
        // A single connection, otherwise every pooled connection gets its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::new_with_pool(None, pool).await
    }

    async fn new_with_pool(base: Option<PathBuf>, pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { base, pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        for table in ["sessions", "projects"] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    last_edit INTEGER NOT NULL DEFAULT 0,
                    last_summary_update INTEGER NOT NULL DEFAULT 0,
                    summary TEXT,
                    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )
                "#
            ))
            .execute(pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_sessions (
                project_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                PRIMARY KEY (project_id, session_id),
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_sessions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                last_edit INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_user_sessions_session ON user_sessions(session_id)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Directory holding the database file, `None` for in-memory stores.
    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a session. Existing sessions are left untouched.
    pub async fn create_session(&self, session_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_id_free(&mut tx, "projects", session_id).await?;
        sqlx::query("INSERT OR IGNORE INTO sessions (id) VALUES (?)")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Register a participant's user session within `session_id`.
    pub async fn create_user_session(&self, user_session_id: &str, session_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO user_sessions (id, session_id) VALUES (?, ?)")
            .bind(user_session_id)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to add participant to session {session_id}"))?;
        Ok(())
    }

    /// Register a project and link it to existing sessions.
    pub async fn create_project(&self, project_id: &str, session_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_id_free(&mut tx, "sessions", project_id).await?;
        sqlx::query("INSERT OR IGNORE INTO projects (id) VALUES (?)")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        for session_id in session_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO project_sessions (project_id, session_id) VALUES (?, ?)",
            )
            .bind(project_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to link session {session_id} to {project_id}"))?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Session ids linked to a project, in insertion order.
    pub async fn project_sessions(&self, project_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT session_id FROM project_sessions WHERE project_id = ? ORDER BY rowid",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("session_id").map_err(Into::into))
            .collect()
    }

    /// Stored summary text for a session or project.
    pub async fn get_summary(&self, resource_id: &str) -> Result<Option<String>> {
        for table in ["sessions", "projects"] {
            let row = sqlx::query(&format!("SELECT summary FROM {table} WHERE id = ?"))
                .bind(resource_id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                return Ok(row.try_get("summary")?);
            }
        }
        Ok(None)
    }

    /// Set `column` on whichever of sessions/projects holds `resource_id`.
    /// Watermarks never move backwards.
    async fn advance_watermark(&self, column: &str, resource_id: &str, at: i64) -> Result<()> {
        for table in ["sessions", "projects"] {
            let result = sqlx::query(&format!(
                "UPDATE {table} SET {column} = MAX({column}, ?) WHERE id = ?"
            ))
            .bind(at)
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                return Ok(());
            }
        }
        Err(anyhow!("Unknown resource: {resource_id}"))
    }
}

/// Fail if `id` already names a row in `table`.
async fn ensure_id_free(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    id: &str,
) -> Result<()> {
    let taken = sqlx::query(&format!("SELECT 1 FROM {table} WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .is_some();
    if taken {
        let kind = if table == "sessions" { "session" } else { "project" };
        return Err(anyhow!("Id {id} is already used by a {kind}"));
    }
    Ok(())
}

#[async_trait]
impl SummaryStore for SqliteStore {
    async fn get_summary_version(
        &self,
        resource_id: &str,
        is_project: bool,
    ) -> Result<SummaryVersion> {
        let sql = if is_project {
            PROJECT_VERSION_SQL
        } else {
            SESSION_VERSION_SQL
        };
        let row = sqlx::query(sql)
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                let kind = if is_project { "project" } else { "session" };
                anyhow!("Unknown {kind}: {resource_id}")
            })?;

        Ok(SummaryVersion {
            last_edit: row.try_get("last_edit")?,
            last_summary_update: row.try_get("last_summary_update")?,
        })
    }

    async fn update_user_last_edit(&self, user_session_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE user_sessions SET last_edit = MAX(last_edit, ?) WHERE id = ?")
            .bind(now_millis())
            .bind(user_session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("Unknown user session: {user_session_id}"));
        }
        Ok(())
    }

    async fn update_host_last_edit(&self, resource_id: &str) -> Result<()> {
        self.advance_watermark("last_edit", resource_id, now_millis())
            .await
    }

    async fn update_last_summary_update(&self, resource_id: &str) -> Result<()> {
        self.advance_watermark("last_summary_update", resource_id, now_millis())
            .await
    }

    async fn save_summary(&self, resource_id: &str, summary: &str) -> Result<()> {
        for table in ["sessions", "projects"] {
            let result = sqlx::query(&format!("UPDATE {table} SET summary = ? WHERE id = ?"))
                .bind(summary)
                .bind(resource_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() > 0 {
                return Ok(());
            }
        }
        Err(anyhow!("Unknown resource: {resource_id}"))
    }
}
