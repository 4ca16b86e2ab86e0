//! Polling driver that keeps one resource's summary fresh.
//!
//! A [`PollerHandle`] owns a background task that reads the resource's
//! [`SummaryVersion`] on a fixed interval and hands every newly observed edit
//! to the [`SummaryCoordinator`]. Polling pauses while the view is hidden or
//! the client is offline; resuming does not trigger an extra read.

use super::coordinator::{SummaryCoordinator, SummaryScope};
use crate::error::{RefreshError, Result};
use crate::storage::SummaryVersion;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// How a poller reacts to a stale observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Route through the tracker's debounce window
    Debounced,
    /// Regenerate as soon as the edit is seen
    Immediate,
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub mode: PollMode,
    pub scope: SummaryScope,
    pub interval: Duration,
}

impl PollOptions {
    pub fn new(mode: PollMode, scope: SummaryScope, interval: Duration) -> Self {
        Self {
            mode,
            scope,
            interval,
        }
    }

    /// Debounced polling at the coordinator's configured interval.
    pub fn debounced(coordinator: &SummaryCoordinator, scope: SummaryScope) -> Self {
        Self::new(PollMode::Debounced, scope, coordinator.config().poll_interval())
    }

    /// Immediate polling at the coordinator's configured interval.
    pub fn immediate(coordinator: &SummaryCoordinator, scope: SummaryScope) -> Self {
        Self::new(PollMode::Immediate, scope, coordinator.config().poll_interval())
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_project(&self) -> bool {
        self.scope.is_project()
    }
}

#[derive(Debug, Clone, Copy)]
struct PollGate {
    visible: bool,
    online: bool,
}

impl PollGate {
    fn is_open(&self) -> bool {
        self.visible && self.online
    }
}

pub struct SummaryPoller;

impl SummaryPoller {
    /// Start polling `resource_id`. The first read happens right away.
    ///
    /// Fails with [`RefreshError::Config`] for a zero interval.
    pub fn spawn(
        coordinator: SummaryCoordinator,
        resource_id: impl Into<String>,
        options: PollOptions,
    ) -> Result<PollerHandle> {
        if options.interval.is_zero() {
            return Err(RefreshError::invalid_config("poll interval must be positive"));
        }
        let resource_id = resource_id.into();
        let (gate_tx, gate_rx) = watch::channel(PollGate {
            visible: true,
            online: true,
        });

        let worker = PollWorker {
            coordinator: coordinator.clone(),
            resource_id: resource_id.clone(),
            options,
            gate: gate_rx,
            last_processed: None,
        };
        let task = tokio::spawn(worker.run());
        debug!("Started summary poller for {resource_id}");

        Ok(PollerHandle {
            resource_id,
            coordinator,
            gate: gate_tx,
            task,
        })
    }
}

struct PollWorker {
    coordinator: SummaryCoordinator,
    resource_id: String,
    options: PollOptions,
    gate: watch::Receiver<PollGate>,
    /// Newest stale `last_edit` already handed to the coordinator
    last_processed: Option<i64>,
}

impl PollWorker {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.options.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let open = self.gate.borrow().is_open();
            if !open {
                trace!("Poller for {} is paused", self.resource_id);
                continue;
            }
            self.poll_once().await;
        }
    }

    async fn poll_once(&mut self) {
        let version = match self
            .coordinator
            .store()
            .get_summary_version(&self.resource_id, self.options.is_project())
            .await
        {
            Ok(version) => version,
            Err(e) => {
                warn!("Failed to poll summary version for {}: {e:#}", self.resource_id);
                return;
            }
        };

        if !version.is_stale() {
            if self.options.mode == PollMode::Debounced {
                self.coordinator.schedule_update(
                    &self.resource_id,
                    version,
                    self.options.scope.clone(),
                );
            }
            return;
        }

        if self.last_processed == Some(version.last_edit) {
            trace!("Edit {} on {} already handled", version.last_edit, self.resource_id);
            return;
        }
        self.last_processed = Some(version.last_edit);
        self.dispatch(version);
    }

    fn dispatch(&self, version: SummaryVersion) {
        debug!(
            "Observed edit {} on {} ({:?})",
            version.last_edit, self.resource_id, self.options.mode
        );
        match self.options.mode {
            PollMode::Debounced => {
                self.coordinator.schedule_update(
                    &self.resource_id,
                    version,
                    self.options.scope.clone(),
                );
            }
            PollMode::Immediate => {
                // Runs on its own task so stopping the poller never cancels a started regeneration
                let coordinator = self.coordinator.clone();
                let resource_id = self.resource_id.clone();
                let scope = self.options.scope.clone();
                tokio::spawn(async move {
                    coordinator.update_now(&resource_id, scope).await;
                });
            }
        }
    }
}

/// Controls a running poller. Dropping it stops polling; [`PollerHandle::shutdown`]
/// also forgets the resource's tracker state.
pub struct PollerHandle {
    resource_id: String,
    coordinator: SummaryCoordinator,
    gate: watch::Sender<PollGate>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Pause or resume polling as the view is hidden or shown.
    pub fn set_visible(&self, visible: bool) {
        self.gate.send_modify(|gate| gate.visible = visible);
    }

    /// Pause or resume polling as connectivity drops or returns.
    pub fn set_online(&self, online: bool) {
        self.gate.send_modify(|gate| gate.online = online);
    }

    pub fn is_paused(&self) -> bool {
        !self.gate.borrow().is_open()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop polling and release every timer and subscriber for the resource.
    pub fn shutdown(self) {
        self.task.abort();
        self.coordinator.cleanup(&self.resource_id);
        debug!("Stopped summary poller for {}", self.resource_id);
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for PollerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerHandle")
            .field("resource_id", &self.resource_id)
            .field("paused", &self.is_paused())
            .finish()
    }
}
