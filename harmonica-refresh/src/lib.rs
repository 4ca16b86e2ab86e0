//! harmonica-refresh: Debounced summary regeneration for deliberation sessions
//!
//! Sessions and projects accumulate edits from hosts and participants. Each
//! resource carries two watermarks, the newest edit and the last summary
//! update, and this crate keeps the summary behind them fresh without
//! regenerating on every keystroke.
//!
//! ## Key Modules
//!
//! - **[`refresh`]**: Stale tracking state machine, summary coordinator, and polling driver
//! - **[`storage`]**: Watermark store abstraction with SQLite and in-memory implementations
//! - **[`summarizer`]**: Summary generation seam and an external-command implementation
//! - **[`config`]**: TOML configuration for debounce and polling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use harmonica_refresh::config::RefreshConfig;
//! use harmonica_refresh::refresh::{EditSource, SummaryCoordinator, SummaryScope};
//! use harmonica_refresh::storage::{NoopInvalidator, sqlite_store::SqliteStore};
//! use harmonica_refresh::summarizer::CommandSummarizer;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = SqliteStore::open(Path::new(".")).await?;
//! let summarizer = CommandSummarizer::from_command_line(&["my-summarizer".to_string()])?;
//! let coordinator = SummaryCoordinator::new(
//!     RefreshConfig::default(),
//!     Arc::new(store),
//!     Arc::new(summarizer),
//!     Arc::new(NoopInvalidator),
//! );
//!
//! coordinator.register_edit("session-1", EditSource::Host).await;
//! coordinator.update_now("session-1", SummaryScope::Session).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! register_edit ─► SummaryStore ◄─ SummaryPoller (interval)
//!                                        │
//!                                        ▼
//!                 StaleTracker ◄─ SummaryCoordinator ─► Summarizer
//!                      │                 │
//!                 subscribers      CacheInvalidator
//! ```

pub mod config;
pub mod error;
pub mod refresh;
pub mod storage;
pub mod summarizer;

pub use config::RefreshConfig;
pub use error::{RefreshError, Result};
pub use refresh::{RefreshStatus, SummaryCoordinator, SummaryScope};
