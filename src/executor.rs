//! Dispatch of thread states onto teams.
//!
//! A worker *attaches* to one thread state at a time and runs its nodes back
//! to back. Everything that would run another thread state's work while the
//! worker is attached (resuming a latched node, firing a callback, assigning a
//! job to a passive team) is *deferred*: it is queued on the calling OS thread
//! and run once the worker detached and released every lock. Outside an
//! attachment a deferred job runs immediately, and jobs it defers in turn are
//! drained iteratively rather than recursively.

mod execute;
mod setup;

pub(crate) use execute::{Continuation, Resume, dispatch, run};
pub(crate) use setup::{LoadPlan, PlanError};

use crate::{thread::ThreadState, types::Job};
use core::cell::{Cell, RefCell};
use std::collections::VecDeque;

thread_local! {
    /// Address of the thread state the calling OS thread is attached to.
    static ATTACHED: Cell<usize> = const { Cell::new(0) };
    /// Whether the calling OS thread is draining deferred jobs.
    static DRAINING: Cell<bool> = const { Cell::new(false) };
    static PENDING: RefCell<VecDeque<Job>> = const { RefCell::new(VecDeque::new()) };
}

fn address(thread: &ThreadState) -> usize {
    core::ptr::from_ref(thread) as usize
}

/// Marks the calling OS thread as running `thread` until dropped.
pub(crate) struct Attachment<'a> {
    thread: &'a ThreadState,
    previous: usize,
}

impl<'a> Attachment<'a> {
    pub(crate) fn enter(thread: &'a ThreadState) -> Self {
        let previous = ATTACHED.replace(address(thread));
        thread.set_attached(true);
        Self { thread, previous }
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        self.thread.set_attached(false);
        ATTACHED.set(self.previous);
    }
}

/// Whether the calling OS thread is attached to `thread`.
pub(crate) fn is_attached_to(thread: &ThreadState) -> bool {
    ATTACHED.get() == address(thread)
}

/// Runs `job` now, or once the calling OS thread is no longer attached to a
/// thread state.
pub(crate) fn defer(job: impl FnOnce() + Send + 'static) {
    if ATTACHED.get() != 0 || DRAINING.get() {
        PENDING.with_borrow_mut(|pending| pending.push_back(Box::new(job)));
        return;
    }
    let _draining = Draining::enter();
    job();
    run_pending();
}

/// Defers every job of `jobs` in order.
pub(crate) fn defer_all(jobs: impl IntoIterator<Item = Job>) {
    for job in jobs {
        defer(job);
    }
}

/// Runs the jobs deferred while attached, unless an outer frame of the
/// calling OS thread is already draining them.
pub(crate) fn drain() {
    if ATTACHED.get() != 0 || DRAINING.get() {
        return;
    }
    let _draining = Draining::enter();
    run_pending();
}

fn run_pending() {
    while let Some(job) = PENDING.with_borrow_mut(VecDeque::pop_front) {
        job();
    }
}

struct Draining;

impl Draining {
    fn enter() -> Self {
        DRAINING.set(true);
        Self
    }
}

impl Drop for Draining {
    fn drop(&mut self) {
        DRAINING.set(false);
    }
}
