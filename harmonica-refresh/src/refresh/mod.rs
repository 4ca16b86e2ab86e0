// Summary freshness tracking
pub mod coordinator;
pub mod poller;
pub mod stale_tracker;
pub mod status;

// Re-export the types most callers need
pub use coordinator::{EditSource, RegistrarState, ResourceSnapshot, SummaryCoordinator, SummaryScope};
pub use poller::{PollMode, PollOptions, PollerHandle, SummaryPoller};
pub use stale_tracker::{StaleTracker, StatusCallback, Subscription};
pub use status::{RefreshStatus, StatusEvent, UpdateOutcome};
