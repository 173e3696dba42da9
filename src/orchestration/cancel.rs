//! Cooperative cancellation for a whole run.
//!
//! A `CancellationScope` wraps a `CancellationToken` with the run's
//! execution id, the first cancellation reason, and a registry of cleanup
//! callbacks. Every long-running step races its work against
//! [`CancellationScope::cancelled`] and surfaces [`Error::Cancelled`], which
//! callers never retry.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::core::task::ExecutionId;
use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};

/// Callback run once when the scope is cancelled.
pub type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

/// Handle for unregistering a cleanup callback before cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Cancelled,
    Disposed,
}

struct Cleanups {
    phase: Phase,
    next_id: u64,
    pending: Vec<(CleanupId, CleanupFn)>,
}

struct ScopeInner {
    execution_id: ExecutionId,
    token: CancellationToken,
    reason: OnceLock<String>,
    cleanups: Mutex<Cleanups>,
}

/// Per-run abort handle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CancellationScope {
    inner: Arc<ScopeInner>,
}

impl CancellationScope {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                execution_id,
                token: CancellationToken::new(),
                reason: OnceLock::new(),
                cleanups: Mutex::new(Cleanups {
                    phase: Phase::Active,
                    next_id: 0,
                    pending: Vec::new(),
                }),
            }),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.inner.execution_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Reason given by the first `cancel` call.
    pub fn reason(&self) -> Option<&str> {
        self.inner.reason.get().map(String::as_str)
    }

    /// The abort signal. Child work can select on it or derive child tokens.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// The error every suspension point raises after cancellation.
    pub fn cancelled_error(&self) -> Error {
        Error::Cancelled {
            execution_id: self.inner.execution_id.to_string(),
            reason: self.reason().unwrap_or("cancelled").to_string(),
        }
    }

    /// Fail fast if the scope is already cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the scope is cancelled first.
    ///
    /// On cancellation `fut` is dropped at its current suspension point.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.inner.token.cancelled() => Err(self.cancelled_error()),
            result = fut => result,
        }
    }

    /// Cancel the scope and fire every registered cleanup callback.
    ///
    /// Returns `false` when the scope was already cancelled or disposed;
    /// repeated calls change nothing, and the first reason is kept.
    pub fn cancel(&self, reason: &str) -> bool {
        let callbacks = {
            let mut cleanups = self.lock();
            if cleanups.phase != Phase::Active {
                return false;
            }
            cleanups.phase = Phase::Cancelled;
            let _ = self.inner.reason.set(reason.to_string());
            self.inner.token.cancel();
            std::mem::take(&mut cleanups.pending)
        };

        clog_debug!(
            "CancellationScope[{}]: cancelled ({}), running {} cleanups",
            self.inner.execution_id.short(),
            reason,
            callbacks.len()
        );

        for (id, callback) in callbacks {
            run_cleanup(id, callback);
        }
        true
    }

    /// Register a callback for cancellation.
    ///
    /// If the scope is already cancelled the callback runs immediately and
    /// `None` is returned. On a disposed scope the callback is dropped.
    pub fn on_cancel<F>(&self, callback: F) -> Option<CleanupId>
    where
        F: FnOnce() + Send + 'static,
    {
        let callback: CleanupFn = Box::new(callback);
        let mut cleanups = self.lock();
        let phase = cleanups.phase;
        match phase {
            Phase::Active => {
                let id = CleanupId(cleanups.next_id);
                cleanups.next_id += 1;
                cleanups.pending.push((id, callback));
                Some(id)
            }
            Phase::Cancelled => {
                let id = CleanupId(cleanups.next_id);
                cleanups.next_id += 1;
                drop(cleanups);
                run_cleanup(id, callback);
                None
            }
            Phase::Disposed => {
                clog_debug!(
                    "CancellationScope[{}]: cleanup registered after dispose, dropped",
                    self.inner.execution_id.short()
                );
                None
            }
        }
    }

    /// Unregister a callback that has not fired yet.
    pub fn remove_cleanup(&self, id: CleanupId) -> bool {
        let mut cleanups = self.lock();
        let before = cleanups.pending.len();
        cleanups.pending.retain(|(pending_id, _)| *pending_id != id);
        cleanups.pending.len() != before
    }

    /// Number of callbacks waiting for cancellation.
    pub fn pending_cleanups(&self) -> usize {
        self.lock().pending.len()
    }

    /// End of run without cancellation: drop pending callbacks unfired.
    pub fn dispose(&self) {
        let mut cleanups = self.lock();
        if cleanups.phase == Phase::Active {
            cleanups.phase = Phase::Disposed;
            cleanups.pending.clear();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cleanups> {
        self.inner
            .cleanups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationScope")
            .field("execution_id", &self.inner.execution_id)
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

fn run_cleanup(id: CleanupId, callback: CleanupFn) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        clog_warn!("Cleanup callback {:?} panicked", id);
    }
}

/// Scopes of in-flight runs, keyed by execution id.
#[derive(Default)]
pub struct ScopeRegistry {
    scopes: Mutex<HashMap<ExecutionId, CancellationScope>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return the existing) scope for `execution_id`.
    pub fn create(&self, execution_id: ExecutionId) -> CancellationScope {
        self.lock()
            .entry(execution_id)
            .or_insert_with(|| CancellationScope::new(execution_id))
            .clone()
    }

    pub fn get(&self, execution_id: &ExecutionId) -> Option<CancellationScope> {
        self.lock().get(execution_id).cloned()
    }

    /// Cancel one run. Returns `false` if unknown or already cancelled.
    pub fn cancel(&self, execution_id: &ExecutionId, reason: &str) -> bool {
        match self.get(execution_id) {
            Some(scope) => scope.cancel(reason),
            None => false,
        }
    }

    /// Cancel every registered run; returns how many were newly cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let scopes: Vec<CancellationScope> = self.lock().values().cloned().collect();
        scopes.iter().filter(|scope| scope.cancel(reason)).count()
    }

    /// Remove a finished run's scope, dropping callbacks that never fired.
    pub fn dispose(&self, execution_id: &ExecutionId) {
        if let Some(scope) = self.lock().remove(execution_id) {
            scope.dispose();
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ExecutionId, CancellationScope>> {
        self.scopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
