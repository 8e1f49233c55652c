use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Instant;

/// Result of a single backend wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// One unit of the signal count was consumed.
    Signalled,
    /// The deadline passed first.
    TimedOut,
    /// The abort predicate became true while no signal was pending.
    Aborted,
}

/// The blocking half of a semaphore: a signal count plus a way to park on it.
///
/// Implementations must re-check `abort` whenever they wake, and
/// [`interrupt`](SignalBackend::interrupt) must wake every parked waiter so it
/// can observe an abort condition that was set before the call.
pub trait SignalBackend: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Add one unit to the signal count and wake a single waiter.
    fn post(&self);

    /// Block until a unit is consumed, the deadline passes, or `abort` holds.
    ///
    /// A pending signal always wins over `abort`.
    fn wait(&self, deadline: Option<Instant>, abort: &dyn Fn() -> bool) -> WaitOutcome;

    /// Consume a unit if one is pending, without blocking.
    fn try_wait(&self) -> bool;

    /// Wake every parked waiter so it re-evaluates its abort predicate.
    fn interrupt(&self);

    /// Current signal count.
    fn count(&self) -> u32;
}

/// Portable backend built on `Mutex` + `Condvar`.
#[derive(Debug)]
pub struct CondvarBackend {
    count: Mutex<u32>,
    cond: Condvar,
}

impl CondvarBackend {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }
}

impl SignalBackend for CondvarBackend {
    fn name(&self) -> &'static str {
        "condvar"
    }

    fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_add(1);
        self.cond.notify_one();
    }

    fn wait(&self, deadline: Option<Instant>, abort: &dyn Fn() -> bool) -> WaitOutcome {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *count > 0 {
                *count -= 1;
                return WaitOutcome::Signalled;
            }
            if abort() {
                return WaitOutcome::Aborted;
            }
            match deadline {
                None => {
                    count = self
                        .cond
                        .wait(count)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    count = self
                        .cond
                        .wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    fn interrupt(&self) {
        // Taking the lock orders this wakeup after any abort flag the caller set.
        let _count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    fn count(&self) -> u32 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
