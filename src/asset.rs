//! Generic wait-with-timeout primitive.
//!
//! An *asset* is anything units of work wait upon: a managed object being
//! sourced, an asynchronous managed object becoming ready, an asynchronous
//! operation finishing. Each asset has an [`AssetMonitor`] holding the latched
//! waiters in an ownership list. Whoever owns the asset releases or fails the
//! waiters directly; in addition an [`AssetManager`] periodically calls
//! [`Asset::check_on_asset`] with an approximate current time so the asset can
//! decide on timeouts.
//!
//! Every latched waiter is resumed exactly once: it is unlinked from the
//! monitor under the monitor's lock before being resumed or failed. A
//! *permanent* outcome makes every later [`AssetMonitor::await_on_asset`]
//! resolve immediately with that outcome.

mod clock;
mod heartbeat;

pub use clock::{Clock, ManualClock, SystemClock};
pub use heartbeat::Heartbeat;

use crate::{
    error::Escalation,
    list::{LinkedArena, OwnershipList},
    sync::{AtomicUsize, Mutex, Ordering},
};
use core::fmt::{self, Debug};
use std::{
    sync::{Arc, Weak},
    time::Instant,
};

/// Something units of work may wait upon.
pub trait Asset: Send + Sync + 'static {
    /// Inspects the asset at (approximately) `check.time()` and may release or
    /// fail the waiters.
    fn check_on_asset(&self, check: &mut AssetCheck<'_>);
}

/// A latched waiter's continuation.
pub trait LatchedWork: Send + 'static {
    /// Continue the waiter; the asset is available.
    fn resume(self: Box<Self>);
    /// Continue the waiter with a failure.
    fn fail(self: Box<Self>, escalation: Escalation);
}

/// Result of awaiting an asset.
#[derive(Debug)]
#[must_use]
pub enum AwaitOutcome {
    /// The asset is permanently available; continue immediately.
    Proceed,
    /// The waiter is latched and will be resumed or failed later.
    Latched,
    /// The asset permanently failed.
    Failed(Escalation),
}

#[derive(Debug, Clone)]
enum PermanentOutcome {
    Released,
    Failed(Escalation),
}

struct MonitorState {
    latches: LinkedArena<Box<dyn LatchedWork>>,
    waiting: OwnershipList,
    permanent: Option<PermanentOutcome>,
}

/// Ownership list of the waiters latched on one asset.
pub struct AssetMonitor {
    asset: Arc<dyn Asset>,
    state: Mutex<MonitorState>,
    waiting: AtomicUsize,
}

impl Debug for AssetMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetMonitor")
            .field("waiting", &self.waiting())
            .finish_non_exhaustive()
    }
}

impl AssetMonitor {
    /// Monitor for `asset`, not registered with any manager.
    #[must_use]
    pub fn new(asset: Arc<dyn Asset>) -> Self {
        let mut latches = LinkedArena::new();
        let waiting = latches.new_list();
        Self {
            asset,
            state: Mutex::new(MonitorState {
                latches,
                waiting,
                permanent: None,
            }),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Latches the waiter produced by `work` unless a permanent outcome is
    /// already known, in which case `work` is never called.
    pub fn await_on_asset<F>(&self, work: F) -> AwaitOutcome
    where
        F: FnOnce() -> Box<dyn LatchedWork>,
    {
        let mut state = self.state.lock();
        match &state.permanent {
            Some(PermanentOutcome::Released) => AwaitOutcome::Proceed,
            Some(PermanentOutcome::Failed(escalation)) => AwaitOutcome::Failed(escalation.clone()),
            None => {
                let MonitorState {
                    latches, waiting, ..
                } = &mut *state;
                let latch = latches.insert(work());
                latches.push_back(waiting, latch);
                self.waiting.fetch_add(1, Ordering::Relaxed);
                AwaitOutcome::Latched
            }
        }
    }

    /// Resumes every latched waiter. With `permanent`, later awaits proceed
    /// immediately (unless a permanent outcome was already recorded).
    ///
    /// Returns the number of waiters resumed.
    pub fn release_functions(&self, permanent: bool) -> usize {
        let waiters = self.take_waiters(permanent.then_some(PermanentOutcome::Released));
        let released = waiters.len();
        for waiter in waiters {
            waiter.resume();
        }
        released
    }

    /// Fails every latched waiter with `escalation`. With `permanent`, later
    /// awaits fail immediately (unless a permanent outcome was already
    /// recorded).
    ///
    /// Returns the number of waiters failed.
    pub fn fail_functions(&self, escalation: Escalation, permanent: bool) -> usize {
        let waiters =
            self.take_waiters(permanent.then(|| PermanentOutcome::Failed(escalation.clone())));
        let failed = waiters.len();
        for waiter in waiters {
            waiter.fail(escalation.clone());
        }
        failed
    }

    /// Lets the asset inspect itself at `now`. Skipped once a permanent
    /// outcome is known.
    pub fn check_on_asset(&self, now: Instant) {
        if self.is_permanent() {
            return;
        }
        let mut check = AssetCheck { monitor: self, now };
        self.asset.check_on_asset(&mut check);
    }

    /// Number of latched waiters.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Whether a permanent release or failure has been recorded.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.state.lock().permanent.is_some()
    }

    fn take_waiters(&self, permanent: Option<PermanentOutcome>) -> Vec<Box<dyn LatchedWork>> {
        let mut state = self.state.lock();
        let MonitorState {
            latches,
            waiting,
            permanent: recorded,
        } = &mut *state;
        if recorded.is_none() {
            *recorded = permanent;
        }
        let mut waiters = Vec::with_capacity(waiting.len());
        while let Some(latch) = latches.pop_front(waiting) {
            waiters.push(latches.remove(latch).expect("AssetMonitor::take_waiters: [1]"));
        }
        self.waiting.fetch_sub(waiters.len(), Ordering::Relaxed);
        waiters
    }
}

/// Handed to [`Asset::check_on_asset`].
#[derive(Debug)]
pub struct AssetCheck<'a> {
    monitor: &'a AssetMonitor,
    now: Instant,
}

impl AssetCheck<'_> {
    /// Approximate current time of the check.
    #[must_use]
    pub const fn time(&self) -> Instant {
        self.now
    }

    /// Number of latched waiters.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.monitor.waiting()
    }

    /// See [`AssetMonitor::release_functions`].
    pub fn release_functions(&mut self, permanent: bool) -> usize {
        self.monitor.release_functions(permanent)
    }

    /// See [`AssetMonitor::fail_functions`].
    pub fn fail_functions(&mut self, escalation: Escalation, permanent: bool) -> usize {
        self.monitor.fail_functions(escalation, permanent)
    }
}

/// Creates monitors and checks them on each heartbeat.
#[derive(Debug)]
pub struct AssetManager {
    name: Arc<str>,
    clock: Arc<dyn Clock>,
    monitors: parking_lot::Mutex<Vec<Weak<AssetMonitor>>>,
}

impl AssetManager {
    /// Manager reading time from `clock`.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            monitors: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Name of the manager.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Current time according to the manager's clock.
    #[must_use]
    pub fn time(&self) -> Instant {
        self.clock.now()
    }

    /// Creates a monitor for `asset` checked by this manager while alive.
    pub fn create_monitor(&self, asset: Arc<dyn Asset>) -> Arc<AssetMonitor> {
        let monitor = Arc::new(AssetMonitor::new(asset));
        self.monitors.lock().push(Arc::downgrade(&monitor));
        monitor
    }

    /// Checks every live monitor at the clock's current time.
    pub fn check_on_assets(&self) -> usize {
        self.check_on_assets_at(self.clock.now())
    }

    /// Checks every live monitor at `now`, returning how many were checked.
    pub fn check_on_assets_at(&self, now: Instant) -> usize {
        let live: Vec<Arc<AssetMonitor>> = {
            let mut monitors = self.monitors.lock();
            monitors.retain(|monitor| monitor.strong_count() > 0);
            monitors.iter().filter_map(Weak::upgrade).collect()
        };
        let mut checked = 0;
        for monitor in live {
            if monitor.is_permanent() {
                continue;
            }
            monitor.check_on_asset(now);
            checked += 1;
        }
        checked
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counts {
        resumed: AtomicUsize,
        failed: AtomicUsize,
    }

    struct Waiter(Arc<Counts>);

    impl LatchedWork for Waiter {
        fn resume(self: Box<Self>) {
            self.0.resumed.fetch_add(1, Ordering::SeqCst);
        }

        fn fail(self: Box<Self>, _escalation: Escalation) {
            self.0.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Deadline {
        at: Instant,
    }

    impl Asset for Deadline {
        fn check_on_asset(&self, check: &mut AssetCheck<'_>) {
            if check.time() >= self.at {
                check.fail_functions(Escalation::msg("deadline"), true);
            }
        }
    }

    #[test]
    fn non_permanent_release_relatches() {
        let clock = ManualClock::new();
        let monitor = AssetMonitor::new(Arc::new(Deadline {
            at: clock.now() + Duration::from_secs(1),
        }));
        let counts = Arc::new(Counts::default());
        let waiter = Waiter(counts.clone());
        assert!(matches!(
            monitor.await_on_asset(|| Box::new(waiter)),
            AwaitOutcome::Latched
        ));
        assert_eq!(monitor.release_functions(false), 1);
        let waiter = Waiter(counts.clone());
        assert!(matches!(
            monitor.await_on_asset(|| Box::new(waiter)),
            AwaitOutcome::Latched
        ));
        assert_eq!(monitor.waiting(), 1);
        assert_eq!(counts.resumed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn permanent_failure_applies_to_later_waiters() {
        let clock = ManualClock::new();
        let manager = AssetManager::new("test", Arc::new(SystemClock));
        let monitor = manager.create_monitor(Arc::new(Deadline {
            at: clock.now() + Duration::from_secs(5),
        }));
        let counts = Arc::new(Counts::default());
        let waiter = Waiter(counts.clone());
        let _ = monitor.await_on_asset(|| Box::new(waiter));

        assert_eq!(manager.check_on_assets_at(clock.now()), 1);
        assert_eq!(counts.failed.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(5));
        manager.check_on_assets_at(clock.now());
        assert_eq!(counts.failed.load(Ordering::SeqCst), 1);

        let outcome = monitor.await_on_asset(|| unreachable!("permanent outcome known"));
        assert!(matches!(outcome, AwaitOutcome::Failed(_)));
        // Permanent monitors are no longer checked.
        assert_eq!(manager.check_on_assets_at(clock.now()), 0);
        // A later permanent release does not override the failure.
        assert_eq!(monitor.release_functions(true), 0);
        assert!(matches!(
            monitor.await_on_asset(|| unreachable!("permanent outcome known")),
            AwaitOutcome::Failed(_)
        ));
        assert_eq!(counts.resumed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_monitors_are_forgotten() {
        let manager = AssetManager::new("test", Arc::new(SystemClock));
        let monitor = manager.create_monitor(Arc::new(Deadline {
            at: Instant::now(),
        }));
        drop(monitor);
        assert_eq!(manager.check_on_assets(), 0);
    }
}
