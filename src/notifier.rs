//! Sequential commit notifier.
//!
//! Worker threads block on `wait_for` until a monotonically increasing
//! commit counter reaches their requested value. The replicator drives
//! the counter forward with `notify_through`, which wakes every waiter
//! at or below the new value in one pass. `cancel` tears waiters down
//! cooperatively, optionally protecting values at or below a cutoff so
//! they can still be satisfied by a later `notify_through`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Outcome of one wait, and the per-waiter slot it is delivered in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    Unknown,
    Completed,
    Canceled,
}

impl Default for WaitResult {
    fn default() -> Self {
        WaitResult::Unknown
    }
}

/// One waiter's result slot, shared between the waiter and the
/// notifier that will wake it. Outlives whichever party drops it first.
#[derive(Debug, Default)]
struct WaitState {
    result: Mutex<WaitResult>,
    cv: Condvar,
}

type PendingMap = BTreeMap<u64, Vec<Arc<WaitState>>>;

#[derive(Debug, Default)]
struct Inner {
    value: u64,
    // Waits issued inside an active transaction are tracked apart from
    // the rest; both are woken identically, but callers can apply
    // different admission policies to them later.
    pending_transaction: PendingMap,
    pending_outside: PendingMap,
    global_result: WaitResult,
    cancel_after: u64,
}

/// Blocks threads until a monotonically rising counter reaches their
/// requested value. Never fails; shutdown is the caller invoking
/// `cancel` so no waiter is left blocked.
#[derive(Debug, Default)]
pub struct SequentialNotifier {
    inner: Mutex<Inner>,
}

impl SequentialNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the counter reaches `value` (Completed) or the
    /// notifier is canceled with a cutoff that does not protect this
    /// value (Canceled).
    pub fn wait_for(&self, value: u64, inside_transaction: bool) -> WaitResult {
        let state = {
            let mut inner = self.inner.lock().expect("notifier lock poisoned");
            if value <= inner.value {
                return WaitResult::Completed;
            }
            let state = Arc::new(WaitState::default());
            let map = if inside_transaction {
                &mut inner.pending_transaction
            } else {
                &mut inner.pending_outside
            };
            map.entry(value).or_default().push(Arc::clone(&state));
            state
        };

        let mut woke_by_timeout = false;
        loop {
            // Internal lock first, then the per-waiter lock. Never the
            // other way around.
            let (global_result, cancel_after) = {
                let inner = self.inner.lock().expect("notifier lock poisoned");
                (inner.global_result, inner.cancel_after)
            };

            let mut result = state.result.lock().expect("wait state lock poisoned");
            // The waiter's own slot wins: once notify_through reached
            // this WaitState the outcome is Completed, even if the
            // notifier has since been canceled.
            if *result != WaitResult::Unknown {
                self.diagnose_timeout_wakeup(woke_by_timeout, value);
                return *result;
            }
            if global_result == WaitResult::Canceled {
                if cancel_after != 0 && value <= cancel_after {
                    // The cutoff protects this value; keep waiting for
                    // a notify_through to decide it.
                    tracing::info!(
                        "canceled after {cancel_after}, but waiting for {value} so not returning yet"
                    );
                } else {
                    self.diagnose_timeout_wakeup(woke_by_timeout, value);
                    return WaitResult::Canceled;
                }
            }

            let (guard, wait) = state
                .cv
                .wait_timeout(result, Duration::from_secs(1))
                .expect("wait state lock poisoned");
            // Spurious and periodic timeout wake-ups both re-check every
            // predicate at the top of the loop.
            woke_by_timeout = wait.timed_out();
            drop(guard);
        }
    }

    /// Current counter value under the internal lock.
    pub fn value(&self) -> u64 {
        let inner = self.inner.lock().expect("notifier lock poisoned");
        inner.value
    }

    /// Advance the counter to `max(current, value)` and complete every
    /// waiter whose requested value is at or below the new current.
    pub fn notify_through(&self, value: u64) {
        let mut inner = self.inner.lock().expect("notifier lock poisoned");
        if value > inner.value {
            inner.value = value;
        }
        complete_through(&mut inner.pending_transaction, value);
        complete_through(&mut inner.pending_outside, value);
    }

    /// Cancel every waiter whose requested value is strictly above
    /// `cancel_after`; waiters at or below the cutoff stay pending and
    /// can still be completed by a later `notify_through`. A cutoff of
    /// 0 cancels everyone.
    pub fn cancel(&self, cancel_after: u64) {
        let mut inner = self.inner.lock().expect("notifier lock poisoned");

        // The cutoff is recorded before the global result so a waiter
        // that observes CANCELED never pairs it with a stale cutoff.
        inner.cancel_after = cancel_after;
        inner.global_result = WaitResult::Canceled;

        cancel_above(&mut inner.pending_transaction, cancel_after);
        cancel_above(&mut inner.pending_outside, cancel_after);
    }

    /// Clear the global result, cutoff, and counter. Outstanding
    /// waiters are untouched.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("notifier lock poisoned");
        inner.global_result = WaitResult::Unknown;
        inner.cancel_after = 0;
        inner.value = 0;
    }

    // A timeout wake-up that lands on an already-changed condition means
    // the notification path failed to wake us; worth investigating,
    // though a notify can also race the timeout by chance.
    fn diagnose_timeout_wakeup(&self, woke_by_timeout: bool, value: u64) {
        if woke_by_timeout {
            tracing::warn!("timed out in wait_for but state has changed; was waiting for {value}");
        }
    }
}

fn complete_through(map: &mut PendingMap, value: u64) {
    // Mark and broadcast first; erase strictly afterwards, still under
    // the notifier lock, so a waiter re-checking predicates observes a
    // consistent state.
    for states in map.range(..=value).map(|(_, states)| states) {
        for state in states {
            let mut result = state.result.lock().expect("wait state lock poisoned");
            *result = WaitResult::Completed;
            state.cv.notify_all();
        }
    }
    *map = match value.checked_add(1) {
        Some(split) => map.split_off(&split),
        None => PendingMap::new(),
    };
}

fn cancel_above(map: &mut PendingMap, cutoff: u64) {
    let Some(split) = cutoff.checked_add(1) else {
        return;
    };
    for states in map
        .range((Bound::Excluded(cutoff), Bound::Unbounded))
        .map(|(_, states)| states)
    {
        for state in states {
            let mut result = state.result.lock().expect("wait state lock poisoned");
            *result = WaitResult::Canceled;
            state.cv.notify_all();
        }
    }
    map.split_off(&split);
}
