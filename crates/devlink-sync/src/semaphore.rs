use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::backend::{CondvarBackend, SignalBackend, WaitOutcome};
use crate::error::{Result, SyncError};

/// Largest initial signal count accepted by [`RefSemaphore::new`].
pub const MAX_COUNT: u32 = i32::MAX as u32;

/// Waiter count reported once a semaphore has been destroyed.
pub const DESTROYED_REFS: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Live,
    Destroying,
    Destroyed,
}

struct Lifecycle {
    refs: i32,
    phase: Phase,
    backend: Option<Arc<dyn SignalBackend>>,
}

/// Counting semaphore with a live-waiter count and drain-on-destroy.
///
/// Every blocking call increments the waiter count on entry and decrements it
/// on exit. [`destroy`](Self::destroy) rejects new operations, wakes waiters
/// that have no pending signal, then blocks on a separate condition variable
/// until the waiter count is zero before releasing the backend. A waiter whose
/// signal was already posted still consumes it and returns `Ok`.
pub struct RefSemaphore {
    lifecycle: Mutex<Lifecycle>,
    drained: Condvar,
    closing: AtomicBool,
    cancel_epoch: AtomicU64,
}

impl RefSemaphore {
    /// Create a semaphore on the default condvar backend.
    pub fn new(initial_count: u32) -> Result<Self> {
        if initial_count > MAX_COUNT {
            return Err(SyncError::InvalidArgument(format!(
                "initial count {initial_count} exceeds maximum {MAX_COUNT}"
            )));
        }
        Ok(Self::with_backend(Arc::new(CondvarBackend::new(
            initial_count,
        ))))
    }

    /// Create a semaphore on an explicit backend.
    ///
    /// The backend's current count becomes the initial signal count.
    pub fn with_backend(backend: Arc<dyn SignalBackend>) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                refs: 0,
                phase: Phase::Live,
                backend: Some(backend),
            }),
            drained: Condvar::new(),
            closing: AtomicBool::new(false),
            cancel_epoch: AtomicU64::new(0),
        }
    }

    /// Block until a signal is consumed.
    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None, None)
    }

    /// Block until a signal is consumed or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        self.wait_inner(deadline, Some(timeout))
    }

    /// Consume a signal if one is pending. Returns whether one was consumed.
    pub fn try_wait(&self) -> Result<bool> {
        let backend = self.live_backend()?;
        Ok(backend.try_wait())
    }

    /// Add one signal, waking a single waiter if any is blocked.
    pub fn post(&self) -> Result<()> {
        let backend = self.live_backend()?;
        backend.post();
        Ok(())
    }

    /// Release every thread currently blocked in a wait with
    /// [`SyncError::Cancelled`]. Threads that enter a wait afterwards are
    /// unaffected.
    pub fn cancel_waiters(&self) -> Result<()> {
        let backend = self.live_backend()?;
        self.cancel_epoch.fetch_add(1, Ordering::AcqRel);
        backend.interrupt();
        Ok(())
    }

    /// Number of threads currently inside a wait call, or [`DESTROYED_REFS`].
    pub fn get_ref_count(&self) -> i32 {
        self.lock().refs
    }

    /// Force the waiter count. Destruction waits for this count to reach zero,
    /// so a raised count must be lowered again before `destroy` can finish.
    /// Allowed while a destroy is draining; rejected once it has completed.
    pub fn set_ref_count(&self, refs: i32) -> Result<()> {
        if refs < 0 {
            return Err(SyncError::InvalidArgument(format!(
                "waiter count must not be negative (got {refs})"
            )));
        }
        let mut life = self.lock();
        if life.phase == Phase::Destroyed {
            return Err(SyncError::InvalidState("destroyed"));
        }
        life.refs = refs;
        if refs == 0 && life.phase == Phase::Destroying {
            self.drained.notify_all();
        }
        Ok(())
    }

    /// Pending signal count; zero once destroyed.
    pub fn count(&self) -> u32 {
        self.lock()
            .backend
            .as_ref()
            .map(|backend| backend.count())
            .unwrap_or(0)
    }

    /// Whether [`destroy`](Self::destroy) has completed.
    pub fn is_destroyed(&self) -> bool {
        self.lock().phase == Phase::Destroyed
    }

    /// Destroy the semaphore, blocking until no thread is inside a wait.
    pub fn destroy(&self) -> Result<()> {
        self.destroy_inner(None)
    }

    /// Like [`destroy`](Self::destroy) but gives up after `timeout`, leaving
    /// the semaphore live. Waiters released while the attempt was in progress
    /// have already returned [`SyncError::InvalidState`].
    pub fn destroy_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        self.destroy_inner(deadline.map(|d| (d, timeout)))
    }

    fn destroy_inner(&self, deadline: Option<(Instant, Duration)>) -> Result<()> {
        let backend = {
            let mut life = self.lock();
            match life.phase {
                Phase::Live => {}
                Phase::Destroying => return Err(SyncError::InvalidState("being destroyed")),
                Phase::Destroyed => return Err(SyncError::InvalidState("destroyed")),
            }
            life.phase = Phase::Destroying;
            self.closing.store(true, Ordering::Release);
            life.backend.clone()
        };

        if let Some(backend) = &backend {
            backend.interrupt();
        }
        drop(backend);

        let mut life = self.lock();
        while life.refs > 0 {
            match deadline {
                None => {
                    life = self
                        .drained
                        .wait(life)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some((deadline, timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(refs = life.refs, "semaphore destroy timed out; still live");
                        life.phase = Phase::Live;
                        self.closing.store(false, Ordering::Release);
                        return Err(SyncError::Timeout(timeout));
                    }
                    life = self
                        .drained
                        .wait_timeout(life, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        life.phase = Phase::Destroyed;
        life.refs = DESTROYED_REFS;
        let released = life.backend.take();
        drop(life);

        if let Some(backend) = released {
            debug!(backend = backend.name(), "semaphore destroyed");
        }
        Ok(())
    }

    fn wait_inner(&self, deadline: Option<Instant>, timeout: Option<Duration>) -> Result<()> {
        let backend = self.enter()?;
        let epoch = self.cancel_epoch.load(Ordering::Acquire);

        let outcome = backend.wait(deadline, &|| {
            self.closing.load(Ordering::Acquire)
                || self.cancel_epoch.load(Ordering::Acquire) != epoch
        });
        self.leave();

        match outcome {
            WaitOutcome::Signalled => Ok(()),
            WaitOutcome::TimedOut => Err(SyncError::Timeout(timeout.unwrap_or_default())),
            WaitOutcome::Aborted if self.closing.load(Ordering::Acquire) => {
                Err(SyncError::InvalidState("being destroyed"))
            }
            WaitOutcome::Aborted => Err(SyncError::Cancelled),
        }
    }

    fn enter(&self) -> Result<Arc<dyn SignalBackend>> {
        let mut life = self.lock();
        match (life.phase, life.backend.clone()) {
            (Phase::Live, Some(backend)) => {
                life.refs += 1;
                Ok(backend)
            }
            (Phase::Destroying, _) => Err(SyncError::InvalidState("being destroyed")),
            _ => Err(SyncError::InvalidState("destroyed")),
        }
    }

    fn leave(&self) {
        let mut life = self.lock();
        if life.refs > 0 {
            life.refs -= 1;
        }
        if life.refs == 0 && life.phase == Phase::Destroying {
            self.drained.notify_all();
        }
    }

    fn live_backend(&self) -> Result<Arc<dyn SignalBackend>> {
        let life = self.lock();
        match (life.phase, life.backend.clone()) {
            (Phase::Live, Some(backend)) => Ok(backend),
            (Phase::Destroying, _) => Err(SyncError::InvalidState("being destroyed")),
            _ => Err(SyncError::InvalidState("destroyed")),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RefSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let life = self.lock();
        f.debug_struct("RefSemaphore")
            .field("refs", &life.refs)
            .field("phase", &life.phase)
            .field(
                "backend",
                &life.backend.as_ref().map(|backend| backend.name()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    fn wait_for_refs(sem: &RefSemaphore, expected: i32) {
        let start = Instant::now();
        while sem.get_ref_count() != expected {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "waiters never reached {expected}"
            );
            thread::sleep(Duration::from_millis(2));
        }
    }

    struct TrackedBackend {
        inner: CondvarBackend,
        released: Arc<AtomicBool>,
        uses_after_release: Arc<AtomicUsize>,
    }

    impl TrackedBackend {
        fn check(&self) {
            if self.released.load(Ordering::SeqCst) {
                self.uses_after_release.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl SignalBackend for TrackedBackend {
        fn name(&self) -> &'static str {
            "tracked"
        }
        fn post(&self) {
            self.check();
            self.inner.post();
        }
        fn wait(&self, deadline: Option<Instant>, abort: &dyn Fn() -> bool) -> WaitOutcome {
            self.check();
            let outcome = self.inner.wait(deadline, abort);
            self.check();
            outcome
        }
        fn try_wait(&self) -> bool {
            self.check();
            self.inner.try_wait()
        }
        fn interrupt(&self) {
            self.check();
            self.inner.interrupt();
        }
        fn count(&self) -> u32 {
            self.inner.count()
        }
    }

    impl Drop for TrackedBackend {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn init_rejects_count_above_max() {
        let err = RefSemaphore::new(MAX_COUNT + 1).unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[test]
    fn initial_count_is_consumable() {
        let sem = RefSemaphore::new(2).unwrap();
        sem.wait().unwrap();
        sem.wait_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(sem.count(), 0);
        assert_eq!(sem.get_ref_count(), 0);
    }

    #[test]
    fn wait_timeout_reports_timeout() {
        let sem = RefSemaphore::new(0).unwrap();
        let start = Instant::now();
        let err = sem.wait_timeout(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(sem.get_ref_count(), 0);
    }

    #[test]
    fn post_wakes_blocked_waiter() {
        let sem = Arc::new(RefSemaphore::new(0).unwrap());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };

        wait_for_refs(&sem, 1);
        sem.post().unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(sem.get_ref_count(), 0);
    }

    #[test]
    fn destroyed_semaphore_rejects_operations() {
        let sem = RefSemaphore::new(0).unwrap();
        sem.destroy().unwrap();

        assert!(sem.is_destroyed());
        assert_eq!(sem.get_ref_count(), DESTROYED_REFS);
        assert!(matches!(sem.wait(), Err(SyncError::InvalidState(_))));
        assert!(matches!(sem.post(), Err(SyncError::InvalidState(_))));
        assert!(matches!(sem.set_ref_count(0), Err(SyncError::InvalidState(_))));
        assert!(matches!(sem.destroy(), Err(SyncError::InvalidState(_))));
    }

    #[test]
    fn destroy_after_posting_every_waiter_never_touches_released_backend() {
        const WAITERS: usize = 8;

        let released = Arc::new(AtomicBool::new(false));
        let uses_after_release = Arc::new(AtomicUsize::new(0));
        let sem = Arc::new(RefSemaphore::with_backend(Arc::new(TrackedBackend {
            inner: CondvarBackend::new(0),
            released: Arc::clone(&released),
            uses_after_release: Arc::clone(&uses_after_release),
        })));

        let waiters: Vec<_> = (0..WAITERS)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.wait())
            })
            .collect();

        wait_for_refs(&sem, WAITERS as i32);
        for _ in 0..WAITERS {
            sem.post().unwrap();
        }
        sem.destroy().unwrap();

        for waiter in waiters {
            waiter.join().unwrap().unwrap();
        }

        assert_eq!(sem.get_ref_count(), DESTROYED_REFS);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(uses_after_release.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn destroy_releases_unsignalled_waiters_with_invalid_state() {
        let sem = Arc::new(RefSemaphore::new(0).unwrap());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.wait())
            })
            .collect();

        wait_for_refs(&sem, 3);
        sem.destroy().unwrap();

        for waiter in waiters {
            let err = waiter.join().unwrap().unwrap_err();
            assert!(matches!(err, SyncError::InvalidState(_)));
        }
    }

    #[test]
    fn destroy_blocks_while_ref_count_is_held() {
        let sem = Arc::new(RefSemaphore::new(0).unwrap());
        sem.set_ref_count(1).unwrap();

        let err = sem.destroy_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(!sem.is_destroyed());
        sem.post().unwrap();

        let destroyer = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.destroy())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!destroyer.is_finished());

        sem.set_ref_count(0).unwrap();
        destroyer.join().unwrap().unwrap();
        assert!(sem.is_destroyed());
    }

    #[test]
    fn cancel_waiters_releases_blocked_threads() {
        let sem = Arc::new(RefSemaphore::new(0).unwrap());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };

        wait_for_refs(&sem, 1);
        sem.cancel_waiters().unwrap();

        assert_eq!(waiter.join().unwrap(), Err(SyncError::Cancelled));
        sem.post().unwrap();
        sem.wait_timeout(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn set_ref_count_rejects_negative_values() {
        let sem = RefSemaphore::new(0).unwrap();
        assert!(matches!(
            sem.set_ref_count(-3),
            Err(SyncError::InvalidArgument(_))
        ));
        sem.set_ref_count(4).unwrap();
        assert_eq!(sem.get_ref_count(), 4);
        sem.set_ref_count(0).unwrap();
        sem.destroy().unwrap();
    }
}
