#![allow(missing_docs)]
#![cfg(feature = "loom")]

use ckernel::{
    Escalation,
    asset::{Asset, AssetCheck, AssetMonitor, AwaitOutcome, LatchedWork},
};
use loom::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};
use std::sync::Arc;

struct Idle;

impl Asset for Idle {
    fn check_on_asset(&self, _check: &mut AssetCheck<'_>) {}
}

#[derive(Default)]
struct Counts {
    resumed: AtomicUsize,
    failed: AtomicUsize,
}

impl Counts {
    fn total(&self) -> usize {
        self.resumed.load(Ordering::Acquire) + self.failed.load(Ordering::Acquire)
    }
}

struct Waiter(Arc<Counts>);

impl LatchedWork for Waiter {
    fn resume(self: Box<Self>) {
        self.0.resumed.fetch_add(1, Ordering::AcqRel);
    }

    fn fail(self: Box<Self>, _escalation: Escalation) {
        self.0.failed.fetch_add(1, Ordering::AcqRel);
    }
}

#[test]
fn concurrent_release_and_failure_continue_waiter_once() {
    loom::model(|| {
        let monitor = Arc::new(AssetMonitor::new(Arc::new(Idle)));
        let counts = Arc::new(Counts::default());
        let waiter = counts.clone();
        assert!(matches!(
            monitor.await_on_asset(move || Box::new(Waiter(waiter))),
            AwaitOutcome::Latched
        ));

        let releasing = monitor.clone();
        let release = thread::spawn(move || releasing.release_functions(false));
        let failing = monitor.clone();
        let fail = thread::spawn(move || failing.fail_functions(Escalation::msg("gone"), true));

        let released = release.join().unwrap();
        let failed = fail.join().unwrap();

        assert_eq!(released + failed, 1);
        assert_eq!(counts.total(), 1);
        assert_eq!(monitor.waiting(), 0);
    });
}

#[test]
fn await_racing_permanent_release_is_continued_once() {
    loom::model(|| {
        let monitor = Arc::new(AssetMonitor::new(Arc::new(Idle)));
        let counts = Arc::new(Counts::default());

        let releasing = monitor.clone();
        let release = thread::spawn(move || releasing.release_functions(true));

        let waiter = counts.clone();
        let proceeded = match monitor.await_on_asset(move || Box::new(Waiter(waiter))) {
            AwaitOutcome::Proceed => 1,
            AwaitOutcome::Latched => 0,
            AwaitOutcome::Failed(escalation) => panic!("unexpected failure: {escalation}"),
        };
        release.join().unwrap();

        assert_eq!(proceeded + counts.total(), 1);
        assert!(monitor.is_permanent());
    });
}
