use serde::{Deserialize, Serialize};
use std::fmt;

/// Freshness of a resource's cached summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    /// Never observed by this tracker
    #[default]
    Unknown,
    /// The last regeneration failed
    Outdated,
    /// Stale, waiting for the debounce window to pass
    UpdatePending,
    /// A regeneration is in flight
    UpdateStarted,
    /// The summary reflects the latest edit
    UpToDate,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Outdated => "outdated",
            Self::UpdatePending => "update_pending",
            Self::UpdateStarted => "update_started",
            Self::UpToDate => "up_to_date",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::UpdateStarted)
    }
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `start_update_now` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// `regenerate` ran and succeeded
    Completed,
    /// Another regeneration was already in flight; nothing was run
    AlreadyRunning,
}

/// Published on the tracker's broadcast channel for every status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub resource_id: String,
    pub status: RefreshStatus,
    pub at: chrono::DateTime<chrono::Utc>,
}
