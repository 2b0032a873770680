// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle state machine, call gate and hook runner.
//!
//! [`Lifecycle`] is the single owner of the process state. It holds the
//! state and the number of in-flight Calls in one `watch` channel, so the
//! call gate and the drain wait observe the same value:
//!
//! ```text
//! STARTING ──init ok──▶ READY ──signal──▶ DRAINING ──drained + destroy──▶ TERMINATED
//!     │                                                  │
//!     └───────── init failed / timed out ────────────────┴──▶ TERMINATED
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::function::{FunctionError, LifecycleHook};

/// Process lifecycle state. Ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Starting,
    Ready,
    Draining,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Ready => write!(f, "READY"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean shutdown.
    Clean,
    /// A lifecycle hook did not settle in time.
    HookTimeout,
    /// A lifecycle hook returned an error or panicked.
    HookError,
    /// Configuration could not be loaded or applied.
    Config,
    /// The function module exposes no recognized interaction model.
    UnknownInteractionModel,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::HookTimeout => 1,
            Self::HookError => 2,
            // EX_CONFIG from sysexits.h
            Self::Config => 78,
            Self::UnknownInteractionModel => 255,
        }
    }
}

/// Which lifecycle hook is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Init,
    Destroy,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// Lifecycle hook failures.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{hook} hook failed: {source}")]
    HookFailed {
        hook: Hook,
        #[source]
        source: FunctionError,
    },

    #[error("{hook} hook did not settle within {timeout:?}")]
    HookTimedOut { hook: Hook, timeout: Duration },
}

impl LifecycleError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::HookFailed { .. } => ExitStatus::HookError,
            Self::HookTimedOut { .. } => ExitStatus::HookTimeout,
        }
    }
}

/// Run a hook on its own task, racing it against `timeout`.
///
/// An absent hook succeeds immediately. On timeout the hook's task is
/// aborted and its eventual result discarded.
pub async fn run_hook(
    hook: Hook,
    callback: Option<Arc<dyn LifecycleHook>>,
    timeout: Duration,
) -> Result<(), LifecycleError> {
    let Some(callback) = callback else {
        debug!(%hook, "no hook exported");
        return Ok(());
    };

    info!(%hook, timeout_ms = timeout.as_millis() as u64, "running lifecycle hook");
    let mut task = tokio::spawn(async move { callback.run().await });

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(()))) => {
            info!(%hook, "lifecycle hook completed");
            Ok(())
        }
        Ok(Ok(Err(source))) => Err(LifecycleError::HookFailed { hook, source }),
        Ok(Err(join_error)) => {
            let source = match join_error.try_into_panic() {
                Ok(payload) => FunctionError::from_panic(payload),
                Err(join_error) => FunctionError::msg(join_error),
            };
            Err(LifecycleError::HookFailed { hook, source })
        }
        Err(_) => {
            task.abort();
            Err(LifecycleError::HookTimedOut { hook, timeout })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    state: LifecycleState,
    active: usize,
}

/// Shared handle to the process lifecycle.
///
/// Cloning is cheap; all clones observe and drive the same state.
#[derive(Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = *self.tx.borrow();
        f.debug_struct("Lifecycle")
            .field("state", &snapshot.state)
            .field("active_calls", &snapshot.active)
            .finish()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A fresh lifecycle in `STARTING`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot {
            state: LifecycleState::Starting,
            active: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> LifecycleState {
        self.tx.borrow().state
    }

    /// Number of Calls currently holding a permit.
    pub fn active_calls(&self) -> usize {
        self.tx.borrow().active
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let changed = self.tx.send_if_modified(|snapshot| {
            if snapshot.state != from {
                return false;
            }
            snapshot.state = to;
            true
        });
        if changed {
            info!(%from, %to, "lifecycle transition");
        }
        changed
    }

    /// `STARTING` → `READY`. Returns false from any other state.
    pub fn mark_ready(&self) -> bool {
        self.transition(LifecycleState::Starting, LifecycleState::Ready)
    }

    /// `READY` → `DRAINING`. Returns false from any other state.
    pub fn begin_draining(&self) -> bool {
        self.transition(LifecycleState::Ready, LifecycleState::Draining)
    }

    /// Move to `TERMINATED` from wherever the process is.
    pub fn terminate(&self) {
        let from = self.state();
        let changed = self.tx.send_if_modified(|snapshot| {
            if snapshot.state == LifecycleState::Terminated {
                return false;
            }
            snapshot.state = LifecycleState::Terminated;
            true
        });
        if changed {
            info!(%from, to = %LifecycleState::Terminated, "lifecycle transition");
        }
    }

    /// Admit a new Call if, and only if, the process is `READY`.
    ///
    /// The returned permit keeps the Call counted until dropped.
    pub fn try_begin_call(&self) -> Option<CallPermit> {
        let admitted = self.tx.send_if_modified(|snapshot| {
            if snapshot.state != LifecycleState::Ready {
                return false;
            }
            snapshot.active += 1;
            true
        });

        admitted.then(|| CallPermit {
            tx: self.tx.clone(),
        })
    }

    /// Wait until the state has reached `state` (or moved past it).
    pub async fn wait_until(&self, state: LifecycleState) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|snapshot| snapshot.state >= state).await;
    }

    /// Wait until no Call holds a permit.
    pub async fn drained(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|snapshot| snapshot.active == 0).await;
    }

    /// Wait for in-flight Calls, giving up after `timeout`.
    ///
    /// Returns the number of Calls still active when the wait ended.
    pub async fn drain(&self, timeout: Duration) -> usize {
        info!(
            active_calls = self.active_calls(),
            timeout_ms = timeout.as_millis() as u64,
            "draining in-flight calls"
        );
        if tokio::time::timeout(timeout, self.drained()).await.is_err() {
            let remaining = self.active_calls();
            warn!(
                active_calls = remaining,
                "drain timeout elapsed with calls still in flight"
            );
            return remaining;
        }
        debug!("all calls drained");
        0
    }
}

/// Admission ticket for one Call. Dropping it marks the Call complete.
pub struct CallPermit {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit").finish_non_exhaustive()
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.tx.send_modify(|snapshot| {
            snapshot.active = snapshot.active.saturating_sub(1);
        });
    }
}
