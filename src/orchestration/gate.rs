//! Rate-limited execution gate.
//!
//! Every downstream agent call passes through a `RateGate`, which enforces a
//! rolling one-hour request quota. Callers queue in arrival order behind a
//! fair async mutex, so exactly one admission decision is evaluated at a
//! time. The head of the queue waits until the quota has room for its
//! estimated cost and the minimum inter-dispatch spacing has elapsed, then
//! takes a reservation and releases the queue to the next caller.
//!
//! After the call finishes the caller reports how many requests were really
//! made; those are recorded as window timestamps and the reservation is
//! released. Estimates are only used for admission.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::orchestration::cancel::CancellationScope;
use crate::{clog_debug, clog_trace};

/// Length of the rolling quota window.
pub const WINDOW: Duration = Duration::from_secs(3600);
/// Queue depth above which dispatch spacing grows.
pub const BACKPRESSURE_DEPTH: usize = 10;
/// Largest extra spacing, as a multiple of the base interval.
pub const MAX_BACKPRESSURE_FACTOR: f64 = 3.0;

/// Hourly request quota of a downstream resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quota {
    /// No throttling at all.
    Unlimited,
    PerHour(u32),
}

impl Quota {
    /// Interpret a configured limit: `-1` disables throttling, positive
    /// values are requests per hour.
    pub fn from_limit(limit: i64) -> Result<Self> {
        match limit {
            -1 => Ok(Quota::Unlimited),
            n if n > 0 => Ok(Quota::PerHour(u32::try_from(n).unwrap_or(u32::MAX))),
            n => Err(Error::InvalidRateLimit(n)),
        }
    }

    /// Reject `PerHour(0)`, which could never admit a call.
    pub fn validate(self) -> Result<Self> {
        match self {
            Quota::PerHour(0) => Err(Error::InvalidRateLimit(0)),
            quota => Ok(quota),
        }
    }

    /// Configured limit in its config form (`-1` for unlimited).
    pub fn as_limit(&self) -> i64 {
        match self {
            Quota::Unlimited => -1,
            Quota::PerHour(n) => i64::from(*n),
        }
    }

    /// Base spacing between dispatches: one hour divided by the limit.
    pub fn min_interval(&self) -> Duration {
        match self {
            Quota::Unlimited => Duration::ZERO,
            Quota::PerHour(n) => WINDOW / (*n).max(1),
        }
    }
}

impl std::fmt::Display for Quota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quota::Unlimited => write!(f, "unlimited"),
            Quota::PerHour(n) => write!(f, "{}/hour", n),
        }
    }
}

struct GateState {
    quota: Quota,
    min_interval: Duration,
    /// Completion times of recorded requests, oldest first.
    window: VecDeque<Instant>,
    /// Cost reserved by admitted calls that have not finished yet.
    in_flight: u32,
    /// Callers waiting for admission, including the one being evaluated.
    queued: usize,
    last_dispatch: Option<Instant>,
    total_dispatched: u64,
}

impl GateState {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.window.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Spacing to enforce given the current backlog.
    fn spacing(&self) -> Duration {
        if self.queued > BACKPRESSURE_DEPTH {
            let factor = (self.queued as f64 / BACKPRESSURE_DEPTH as f64).min(MAX_BACKPRESSURE_FACTOR);
            self.min_interval + self.min_interval.mul_f64(factor)
        } else {
            self.min_interval
        }
    }
}

enum Decision {
    Admit,
    WaitUntil(Instant),
    WaitForCompletion,
}

/// Snapshot of a gate's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub name: String,
    pub quota: Quota,
    pub in_window: usize,
    pub in_flight: u32,
    pub queued: usize,
    pub total_dispatched: u64,
    pub min_interval_ms: u64,
}

/// Admission control for one named downstream resource.
pub struct RateGate {
    name: String,
    state: Mutex<GateState>,
    /// Arrival-order queue. tokio's mutex grants the lock first-in first-out.
    admission: tokio::sync::Mutex<()>,
    /// Signalled when quota frees up or the gate is reconfigured.
    changed: Notify,
}

impl RateGate {
    pub fn new(name: &str, quota: Quota) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(GateState {
                quota,
                min_interval: quota.min_interval(),
                window: VecDeque::new(),
                in_flight: 0,
                queued: 0,
                last_dispatch: None,
                total_dispatched: 0,
            }),
            admission: tokio::sync::Mutex::new(()),
            changed: Notify::new(),
        }
    }

    pub fn unlimited(name: &str) -> Self {
        Self::new(name, Quota::Unlimited)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quota(&self) -> Quota {
        self.lock().quota
    }

    /// Change the quota in place.
    ///
    /// Derived spacing is recomputed immediately; queued callers and
    /// recorded timestamps are kept, and the waiting head re-evaluates.
    ///
    /// # Errors
    /// `Error::InvalidRateLimit` for a zero quota; the old quota stays.
    pub fn set_quota(&self, quota: Quota) -> Result<()> {
        let quota = quota.validate()?;
        {
            let mut state = self.lock();
            clog_debug!("RateGate[{}]: quota {} -> {}", self.name, state.quota, quota);
            state.quota = quota;
            state.min_interval = quota.min_interval();
        }
        self.changed.notify_one();
        Ok(())
    }

    /// Reconfigure from a config-style limit (`-1` for unlimited).
    pub fn set_limit(&self, limit: i64) -> Result<()> {
        self.set_quota(Quota::from_limit(limit)?)
    }

    pub fn stats(&self) -> GateStats {
        let mut state = self.lock();
        state.prune(Instant::now());
        GateStats {
            name: self.name.clone(),
            quota: state.quota,
            in_window: state.window.len(),
            in_flight: state.in_flight,
            queued: state.queued,
            total_dispatched: state.total_dispatched,
            min_interval_ms: state.min_interval.as_millis() as u64,
        }
    }

    /// Wait for admission of a call expected to make `estimated_requests`
    /// downstream requests.
    ///
    /// The estimate is clamped to the quota so an oversized caller is still
    /// admitted once the window is empty. The returned permit must be
    /// completed with the observed request count; dropping it records the
    /// estimate instead.
    ///
    /// # Errors
    /// Returns `Error::Cancelled` if `scope` is cancelled while waiting, and
    /// `Error::InvalidRateLimit` if the gate was built with a zero quota.
    pub async fn acquire(
        &self,
        estimated_requests: u32,
        scope: &CancellationScope,
    ) -> Result<GatePermit<'_>> {
        scope.check()?;
        self.quota().validate()?;

        if self.quota() == Quota::Unlimited {
            let mut state = self.lock();
            state.total_dispatched += 1;
            state.last_dispatch = Some(Instant::now());
            return Ok(GatePermit::new(self, 0, false));
        }

        self.lock().queued += 1;
        let _queued = QueueSlot { gate: self };

        let _ticket = scope.run(async { Ok(self.admission.lock().await) }).await?;

        loop {
            scope.check()?;

            let decision = {
                let mut state = self.lock();
                let now = Instant::now();
                state.prune(now);
                match state.quota {
                    Quota::Unlimited => Decision::Admit,
                    Quota::PerHour(limit) => {
                        let cost = estimated_requests.clamp(1, limit);
                        let used = state.window.len() as u32 + state.in_flight;
                        if used.saturating_add(cost) > limit {
                            match state.window.front() {
                                Some(&oldest) => Decision::WaitUntil(oldest + WINDOW),
                                None => Decision::WaitForCompletion,
                            }
                        } else {
                            let spacing = state.spacing();
                            match state.last_dispatch {
                                Some(last) if now < last + spacing => {
                                    Decision::WaitUntil(last + spacing)
                                }
                                _ => {
                                    state.in_flight += cost;
                                    state.last_dispatch = Some(now);
                                    state.total_dispatched += 1;
                                    clog_trace!(
                                        "RateGate[{}]: admitted cost={} used={} limit={}",
                                        self.name,
                                        cost,
                                        used + cost,
                                        limit
                                    );
                                    return Ok(GatePermit::new(self, cost, true));
                                }
                            }
                        }
                    }
                }
            };

            match decision {
                Decision::Admit => {
                    let mut state = self.lock();
                    state.total_dispatched += 1;
                    state.last_dispatch = Some(Instant::now());
                    return Ok(GatePermit::new(self, 0, false));
                }
                Decision::WaitUntil(deadline) => {
                    clog_debug!(
                        "RateGate[{}]: waiting {:?}",
                        self.name,
                        deadline.saturating_duration_since(Instant::now())
                    );
                    scope
                        .run(async {
                            tokio::select! {
                                _ = tokio::time::sleep_until(deadline) => {}
                                _ = self.changed.notified() => {}
                            }
                            Ok(())
                        })
                        .await?;
                }
                Decision::WaitForCompletion => {
                    clog_debug!("RateGate[{}]: quota held by in-flight calls", self.name);
                    scope
                        .run(async {
                            self.changed.notified().await;
                            Ok(())
                        })
                        .await?;
                }
            }
        }
    }

    fn release(&self, reserved: u32, requests: u32) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(reserved);
            let now = Instant::now();
            for _ in 0..requests {
                state.window.push_back(now);
            }
        }
        self.changed.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("name", &self.name)
            .field("quota", &self.quota())
            .finish()
    }
}

/// Keeps the queue depth honest even if the waiting caller is dropped.
struct QueueSlot<'a> {
    gate: &'a RateGate,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.queued = state.queued.saturating_sub(1);
    }
}

/// Admission granted by a [`RateGate`].
#[must_use = "complete the permit with the observed request count"]
pub struct GatePermit<'a> {
    gate: &'a RateGate,
    reserved: u32,
    metered: bool,
    finished: bool,
}

impl std::fmt::Debug for GatePermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit")
            .field("reserved", &self.reserved)
            .field("metered", &self.metered)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<'a> GatePermit<'a> {
    fn new(gate: &'a RateGate, reserved: u32, metered: bool) -> Self {
        Self {
            gate,
            reserved,
            metered,
            finished: false,
        }
    }

    /// Cost reserved at admission.
    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// Record the requests the call actually made and release the reservation.
    pub fn complete(mut self, observed_requests: u32) {
        self.finish(observed_requests);
    }

    fn finish(&mut self, requests: u32) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.metered {
            self.gate.release(self.reserved, requests);
        }
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let estimate = self.reserved;
        self.finish(estimate);
    }
}

/// One shared gate per named downstream resource.
#[derive(Default)]
pub struct GateRegistry {
    gates: Mutex<HashMap<String, Arc<RateGate>>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the gate for `name`, creating it with `quota` on first use.
    ///
    /// An existing gate keeps its quota; use [`RateGate::set_quota`] to change it.
    pub fn get_or_create(&self, name: &str, quota: Quota) -> Arc<RateGate> {
        let mut gates = self.lock();
        Arc::clone(
            gates
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RateGate::new(name, quota))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateGate>> {
        self.lock().get(name).map(Arc::clone)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<RateGate>>> {
        self.gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
