//! Activity tracking
//!
//! Provides:
//! - Per-key last-recorded / last-reported timestamps
//! - Pluggable reporting strategies (ALL, FIRST, LAST, FIRST_AND_LAST)
//! - A periodic sweep that reports pending activity and expires idle keys
//!
//! The tracker never holds a map guard while calling into its host, so hosts
//! are free to call back into the tracker (directly or through the report
//! callback).

mod strategy;

pub use strategy::{new_strategy, ActivityStrategy};

use dashmap::DashMap;
use devgate_common::config::ActivityReportingStrategy;
use devgate_common::metrics;
use devgate_common::{SharedClock, TransportError};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// View of a key's state handed to the host during the sweep
#[derive(Debug, Clone)]
pub struct ActivitySnapshot<M> {
    pub last_recorded_time: i64,
    pub metadata: Option<M>,
}

/// Callbacks into the owner of the tracked keys
pub trait ActivityHost<K, M>: Send + Sync + 'static {
    /// Metadata for a key seen for the first time; `None` drops the record
    fn create_metadata(&self, key: &K) -> Option<M>;

    /// Refresh a key's snapshot before the sweep decides on it
    ///
    /// `recorded` looks up the last recorded time of any other key. Returns
    /// `false` when the key no longer exists on the host side.
    fn update_state(
        &self,
        key: &K,
        snapshot: &mut ActivitySnapshot<M>,
        recorded: &dyn Fn(&K) -> Option<i64>,
    ) -> bool;

    /// Deliver a report; must not block and must complete `callback` once
    fn report_activity(&self, key: &K, metadata: Option<&M>, time: i64, callback: ActivityReportCallback<K, M>);

    /// Called once for a key removed because of inactivity
    fn on_expired(&self, key: &K, metadata: Option<M>);
}

struct ActivityState<M> {
    last_recorded: i64,
    last_reported: i64,
    metadata: Option<M>,
    strategy: Box<dyn ActivityStrategy>,
}

struct TrackerInner<K, M> {
    states: DashMap<K, ActivityState<M>>,
    host: Arc<dyn ActivityHost<K, M>>,
    strategy: ActivityReportingStrategy,
    inactivity_timeout_ms: i64,
    clock: SharedClock,
}

/// Completion handle for one activity report
pub struct ActivityReportCallback<K, M> {
    key: K,
    tracker: Weak<TrackerInner<K, M>>,
}

impl<K, M> ActivityReportCallback<K, M>
where
    K: Eq + Hash,
{
    /// Mark everything up to `time` as reported
    pub fn on_success(self, time: i64) {
        metrics::record_activity_report(true);
        if let Some(inner) = self.tracker.upgrade() {
            if let Some(mut state) = inner.states.get_mut(&self.key) {
                state.last_reported = state.last_reported.max(time);
            }
        }
    }

    /// Leave the state unreported so the next sweep retries
    pub fn on_failure(self, error: &TransportError) {
        metrics::record_activity_report(false);
        debug!(error = %error, "Activity report failed");
    }
}

/// Tracks activity per key and reports it according to a strategy
pub struct ActivityTracker<K, M> {
    inner: Arc<TrackerInner<K, M>>,
}

impl<K, M> Clone for ActivityTracker<K, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, M> ActivityTracker<K, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    pub fn new(
        host: Arc<dyn ActivityHost<K, M>>,
        strategy: ActivityReportingStrategy,
        inactivity_timeout: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                states: DashMap::new(),
                host,
                strategy,
                inactivity_timeout_ms: inactivity_timeout.as_millis() as i64,
                clock,
            }),
        }
    }

    /// Record activity for `key` at `time`
    pub fn record_activity(&self, key: K, time: i64) {
        let pending = {
            let mut state = match self.inner.states.get_mut(&key) {
                Some(state) => state,
                None => {
                    let Some(metadata) = self.inner.host.create_metadata(&key) else {
                        return;
                    };
                    let strategy = self.inner.strategy;
                    self.inner.states.entry(key.clone()).or_insert_with(|| ActivityState {
                        last_recorded: 0,
                        last_reported: 0,
                        metadata: Some(metadata),
                        strategy: new_strategy(strategy),
                    })
                }
            };
            state.last_recorded = state.last_recorded.max(time);
            let report = state.strategy.on_activity() && state.last_reported < state.last_recorded;
            report.then(|| (state.metadata.clone(), state.last_recorded))
        };

        if let Some((metadata, time)) = pending {
            self.report(key, metadata, time);
        }
    }

    /// Run one reporting period over every tracked key
    pub fn sweep(&self) {
        let now = self.inner.clock.now_millis();
        let keys: Vec<K> = self.inner.states.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.sweep_key(key, now);
        }
    }

    fn sweep_key(&self, key: K, now: i64) {
        let mut snapshot = match self.inner.states.get(&key) {
            Some(state) => ActivitySnapshot {
                last_recorded_time: state.last_recorded,
                metadata: state.metadata.clone(),
            },
            None => return,
        };

        let states = &self.inner.states;
        let recorded = |other: &K| states.get(other).map(|s| s.last_recorded);
        if !self.inner.host.update_state(&key, &mut snapshot, &recorded) {
            if let Some((_, state)) = self.inner.states.remove(&key) {
                let last_recorded = state.last_recorded.max(snapshot.last_recorded_time);
                if state.last_reported < last_recorded {
                    self.report(key, snapshot.metadata.or(state.metadata), last_recorded);
                }
            }
            return;
        }

        let (expired, pending) = {
            let Some(mut state) = self.inner.states.get_mut(&key) else {
                return;
            };
            state.last_recorded = state.last_recorded.max(snapshot.last_recorded_time);
            state.metadata = snapshot.metadata;
            let period_end = state.strategy.on_reporting_period_end();
            let expired = now - state.last_recorded > self.inner.inactivity_timeout_ms;
            let unreported = state.last_reported < state.last_recorded;
            let pending = (unreported && (expired || period_end))
                .then(|| (state.metadata.clone(), state.last_recorded));
            (expired, pending)
        };

        if expired {
            if let Some((_, state)) = self.inner.states.remove(&key) {
                if let Some((metadata, time)) = pending {
                    self.report(key.clone(), metadata, time);
                }
                self.inner.host.on_expired(&key, state.metadata);
            }
            return;
        }

        if let Some((metadata, time)) = pending {
            self.report(key, metadata, time);
        }
    }

    fn report(&self, key: K, metadata: Option<M>, time: i64) {
        let callback = self.report_callback(key.clone());
        self.inner
            .host
            .report_activity(&key, metadata.as_ref(), time, callback);
    }

    /// Completion handle that advances `key`'s reported time on success
    pub(crate) fn report_callback(&self, key: K) -> ActivityReportCallback<K, M> {
        ActivityReportCallback {
            key,
            tracker: Arc::downgrade(&self.inner),
        }
    }

    /// Stop tracking a key without reporting
    pub fn remove(&self, key: &K) -> bool {
        self.inner.states.remove(key).is_some()
    }

    pub fn last_recorded_time(&self, key: &K) -> Option<i64> {
        self.inner.states.get(key).map(|s| s.last_recorded)
    }

    pub fn last_reported_time(&self, key: &K) -> Option<i64> {
        self.inner.states.get(key).map(|s| s.last_reported)
    }

    pub fn len(&self) -> usize {
        self.inner.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.states.is_empty()
    }

    /// Sweep every `period` until cancelled or the tracker is dropped
    pub fn spawn_sweeper(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            info!(period_ms = period.as_millis() as u64, "Activity sweeper started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = tracker.upgrade() else { break };
                        ActivityTracker { inner }.sweep();
                    }
                }
            }
            info!("Activity sweeper stopped");
        })
    }
}
