//! Debounced stale-summary tracking.
//!
//! [`StaleTracker`] keeps, per resource id, a [`RefreshStatus`], at most one
//! pending debounce timer, the newest edit it has already scheduled a response
//! for, and a set of status subscribers.
//!
//! ## State machine
//!
//! ```text
//!             schedule_update (stale, newer edit)
//! UpToDate ────────────────────────────────────► UpdatePending
//!    ▲  ▲                                             │ timer fires /
//!    │  │ schedule_update (not stale)                 │ start_update_now
//!    │  └──────────────── any state                   ▼
//!    └──────────── regenerate Ok ─────────────── UpdateStarted
//!                                                     │ regenerate Err
//!                                                     ▼
//!                                                  Outdated
//! ```
//!
//! While a resource is `UpdateStarted`, `schedule_update` is ignored and
//! `start_update_now` returns [`UpdateOutcome::AlreadyRunning`] without calling
//! `regenerate`, so at most one regeneration per resource is ever in flight.
//!
//! Every timer and every in-flight run carries an operation token. A fired
//! timer whose token is no longer current does nothing, and a run that
//! finishes after [`StaleTracker::cleanup`] leaves no trace.

use super::status::{RefreshStatus, StatusEvent, UpdateOutcome};
use crate::error::{RefreshError, Result};
use crate::storage::{SummaryVersion, now_millis};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Callback invoked with a resource's new status.
pub type StatusCallback = Arc<dyn Fn(RefreshStatus) + Send + Sync>;

/// A registered callback. `active` is cleared before the slot leaves the map,
/// and is checked again right before every delivery.
struct SubscriberSlot {
    active: AtomicBool,
    /// One past the sequence number of the newest status handed to the callback
    delivered: AtomicU64,
    callback: StatusCallback,
}

/// Subscribers to call after a status change, tagged with the change's sequence number.
struct Delivery {
    seq: u64,
    slots: Vec<Arc<SubscriberSlot>>,
}

struct PendingTimer {
    token: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TrackerState {
    statuses: HashMap<String, RefreshStatus>,
    timers: HashMap<String, PendingTimer>,
    last_registered_edit: HashMap<String, i64>,
    subscribers: HashMap<String, HashMap<u64, Arc<SubscriberSlot>>>,
    in_flight: HashMap<String, u64>,
    next_token: u64,
    next_subscriber: u64,
    /// Bumped on every status change
    change_seq: u64,
}

impl TrackerState {
    fn status(&self, resource_id: &str) -> RefreshStatus {
        self.statuses
            .get(resource_id)
            .copied()
            .unwrap_or_default()
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn cancel_timer(&mut self, resource_id: &str) -> bool {
        match self.timers.remove(resource_id) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Record `status` and return the subscribers to notify, if it changed.
    fn set_status(&mut self, resource_id: &str, status: RefreshStatus) -> Option<Delivery> {
        let previous = self.statuses.insert(resource_id.to_string(), status);
        if previous == Some(status) {
            return None;
        }
        self.change_seq += 1;
        Some(Delivery {
            seq: self.change_seq,
            slots: self
                .subscribers
                .get(resource_id)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default(),
        })
    }

    fn remove_subscribers(&mut self, resource_id: &str) {
        if let Some(set) = self.subscribers.remove(resource_id) {
            for slot in set.values() {
                slot.active.store(false, Ordering::SeqCst);
            }
        }
    }
}

struct TrackerInner {
    debounce: Duration,
    state: Mutex<TrackerState>,
    events: broadcast::Sender<StatusEvent>,
}

/// Per-resource debounce and status tracking. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct StaleTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for StaleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("StaleTracker")
            .field("debounce", &self.inner.debounce)
            .field("resources", &state.statuses.len())
            .field("pending_timers", &state.timers.len())
            .finish()
    }
}

impl StaleTracker {
    /// Create a tracker that waits `debounce` after the newest edit before regenerating.
    pub fn new(debounce: Duration, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(TrackerInner {
                debounce,
                state: Mutex::new(TrackerState::default()),
                events,
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // No invariant spans a panic point while the lock is held
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current status; `Unknown` for resources never referenced.
    pub fn get_status(&self, resource_id: &str) -> RefreshStatus {
        self.lock().status(resource_id)
    }

    /// Whether a debounce timer is armed for the resource.
    pub fn has_pending_timer(&self, resource_id: &str) -> bool {
        self.lock().timers.contains_key(resource_id)
    }

    /// Newest edit timestamp the tracker has already responded to.
    pub fn last_registered_edit(&self, resource_id: &str) -> Option<i64> {
        self.lock().last_registered_edit.get(resource_id).copied()
    }

    /// Number of resources with a recorded status.
    pub fn resource_count(&self) -> usize {
        self.lock().statuses.len()
    }

    /// Receive every status change as a [`StatusEvent`].
    pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    /// Register `callback` for status changes of `resource_id`.
    ///
    /// The callback is invoked once with the current status before this
    /// returns, unless a newer status change has already reached it. Dropping
    /// the returned [`Subscription`] unsubscribes; no call starts after that.
    pub fn subscribe<F>(&self, resource_id: &str, callback: F) -> Subscription
    where
        F: Fn(RefreshStatus) + Send + Sync + 'static,
    {
        let slot = Arc::new(SubscriberSlot {
            active: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
            callback: Arc::new(callback),
        });
        let (subscriber_id, status, seq) = {
            let mut state = self.lock();
            state.next_subscriber += 1;
            let subscriber_id = state.next_subscriber;
            state
                .subscribers
                .entry(resource_id.to_string())
                .or_default()
                .insert(subscriber_id, Arc::clone(&slot));
            (subscriber_id, state.status(resource_id), state.change_seq)
        };

        deliver(resource_id, &slot, status, seq);

        Subscription {
            tracker: Arc::downgrade(&self.inner),
            slot,
            resource_id: resource_id.to_string(),
            subscriber_id,
        }
    }

    fn unsubscribe(&self, resource_id: &str, subscriber_id: u64) {
        let mut state = self.lock();
        if let Some(set) = state.subscribers.get_mut(resource_id) {
            if let Some(slot) = set.remove(&subscriber_id) {
                slot.active.store(false, Ordering::SeqCst);
            }
            if set.is_empty() {
                state.subscribers.remove(resource_id);
            }
        }
    }

    /// Number of live subscribers for a resource.
    pub fn subscriber_count(&self, resource_id: &str) -> usize {
        self.lock()
            .subscribers
            .get(resource_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Debounced entry point.
    ///
    /// If `version` is not stale the resource is marked `UpToDate` and any armed
    /// timer is cancelled. If it is stale and `last_edit` is newer than the last
    /// edit already scheduled, the previous timer is replaced by a new one that
    /// runs `regenerate` once the debounce window passes without newer edits.
    pub fn schedule_update<F, Fut>(&self, resource_id: &str, version: SummaryVersion, regenerate: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let notify = {
            let mut state = self.lock();

            if state.status(resource_id).is_running() {
                debug!("Regeneration in flight for {resource_id}, not scheduling");
                return;
            }

            if !version.is_stale() {
                if state.cancel_timer(resource_id) {
                    debug!("Summary for {resource_id} caught up, cancelled pending timer");
                }
                (
                    RefreshStatus::UpToDate,
                    state.set_status(resource_id, RefreshStatus::UpToDate),
                )
            } else if state
                .last_registered_edit
                .get(resource_id)
                .is_some_and(|&seen| version.last_edit <= seen)
            {
                debug!(
                    "Edit {} for {resource_id} already scheduled",
                    version.last_edit
                );
                return;
            } else {
                state
                    .last_registered_edit
                    .insert(resource_id.to_string(), version.last_edit);
                state.cancel_timer(resource_id);

                let token = state.next_token();
                let tracker = self.clone();
                let id = resource_id.to_string();
                let debounce = self.inner.debounce;
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    tracker.fire(&id, token, regenerate).await;
                });
                state
                    .timers
                    .insert(resource_id.to_string(), PendingTimer { token, handle });

                debug!(
                    "Scheduled summary regeneration for {resource_id} in {:?}",
                    debounce
                );
                (
                    RefreshStatus::UpdatePending,
                    state.set_status(resource_id, RefreshStatus::UpdatePending),
                )
            }
        };

        if let (status, Some(delivery)) = notify {
            self.notify(resource_id, status, delivery);
        }
    }

    async fn fire<F, Fut>(&self, resource_id: &str, token: u64, regenerate: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        {
            let mut state = self.lock();
            match state.timers.get(resource_id) {
                // Drop our own handle without aborting the task we are running in
                Some(timer) if timer.token == token => {
                    state.timers.remove(resource_id);
                }
                _ => {
                    debug!("Stale timer for {resource_id} ignored");
                    return;
                }
            }
        }

        if let Err(e) = self.run_update(resource_id, regenerate).await {
            error!("Debounced regeneration failed: {e}");
        }
    }

    /// Regenerate immediately, bypassing and cancelling the debounce timer.
    ///
    /// On failure the resource becomes `Outdated` and the error is returned.
    pub async fn start_update_now<F, Fut>(
        &self,
        resource_id: &str,
        regenerate: F,
    ) -> Result<UpdateOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        if self.lock().cancel_timer(resource_id) {
            debug!("Cancelled pending timer for {resource_id}");
        }
        self.run_update(resource_id, regenerate).await
    }

    async fn run_update<F, Fut>(&self, resource_id: &str, regenerate: F) -> Result<UpdateOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let (token, notify) = {
            let mut state = self.lock();
            if state.status(resource_id).is_running() {
                debug!("Regeneration already running for {resource_id}");
                return Ok(UpdateOutcome::AlreadyRunning);
            }
            let token = state.next_token();
            state.in_flight.insert(resource_id.to_string(), token);
            (token, state.set_status(resource_id, RefreshStatus::UpdateStarted))
        };
        if let Some(delivery) = notify {
            self.notify(resource_id, RefreshStatus::UpdateStarted, delivery);
        }

        // Dropping this future mid-regeneration must not pin the resource at UpdateStarted
        let guard = InFlightGuard {
            tracker: self,
            resource_id,
            token,
            armed: true,
        };

        info!("Regenerating summary for {resource_id}");
        let result = match AssertUnwindSafe(regenerate()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("regeneration panicked")),
        };
        guard.disarm();

        match result {
            Ok(()) => {
                self.finish(resource_id, token, RefreshStatus::UpToDate);
                info!("Summary for {resource_id} is up to date");
                Ok(UpdateOutcome::Completed)
            }
            Err(e) => {
                self.finish(resource_id, token, RefreshStatus::Outdated);
                Err(RefreshError::regeneration(resource_id, e))
            }
        }
    }

    fn finish(&self, resource_id: &str, token: u64, status: RefreshStatus) {
        let notify = {
            let mut state = self.lock();
            if state.in_flight.get(resource_id) != Some(&token) {
                debug!("{resource_id} was cleaned up during regeneration");
                return;
            }
            state.in_flight.remove(resource_id);
            if status == RefreshStatus::UpToDate {
                // Polling may still report the pre-regeneration edit for a while
                state
                    .last_registered_edit
                    .insert(resource_id.to_string(), now_millis());
            }
            state.set_status(resource_id, status)
        };
        if let Some(delivery) = notify {
            self.notify(resource_id, status, delivery);
        }
    }

    /// Forget everything about a resource and cancel its timer. Idempotent.
    pub fn cleanup(&self, resource_id: &str) {
        let mut state = self.lock();
        state.cancel_timer(resource_id);
        state.statuses.remove(resource_id);
        state.last_registered_edit.remove(resource_id);
        state.remove_subscribers(resource_id);
        state.in_flight.remove(resource_id);
        debug!("Cleaned up refresh state for {resource_id}");
    }

    fn notify(&self, resource_id: &str, status: RefreshStatus, delivery: Delivery) {
        for slot in &delivery.slots {
            deliver(resource_id, slot, status, delivery.seq);
        }
        // Err only means nobody is listening
        let _ = self.inner.events.send(StatusEvent {
            resource_id: resource_id.to_string(),
            status,
            at: chrono::Utc::now(),
        });
    }
}

struct InFlightGuard<'a> {
    tracker: &'a StaleTracker,
    resource_id: &'a str,
    token: u64,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Regeneration for {} was cancelled", self.resource_id);
            self.tracker
                .finish(self.resource_id, self.token, RefreshStatus::Outdated);
        }
    }
}

/// Call one subscriber, unless it has unsubscribed or already seen a newer change.
fn deliver(resource_id: &str, slot: &SubscriberSlot, status: RefreshStatus, seq: u64) {
    if !slot.active.load(Ordering::SeqCst) {
        return;
    }
    let mark = seq + 1;
    if slot.delivered.fetch_max(mark, Ordering::SeqCst) >= mark {
        trace!("Dropped out-of-order {status} for a {resource_id} subscriber");
        return;
    }
    if std::panic::catch_unwind(AssertUnwindSafe(|| (slot.callback)(status))).is_err() {
        warn!("Status subscriber for {resource_id} panicked");
    }
}

/// Handle returned by [`StaleTracker::subscribe`]. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    tracker: Weak<TrackerInner>,
    slot: Arc<SubscriberSlot>,
    resource_id: String,
    subscriber_id: u64,
}

impl Subscription {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.active.store(false, Ordering::SeqCst);
        if let Some(inner) = self.tracker.upgrade() {
            StaleTracker { inner }.unsubscribe(&self.resource_id, self.subscriber_id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("resource_id", &self.resource_id)
            .field("subscriber_id", &self.subscriber_id)
            .finish()
    }
}
