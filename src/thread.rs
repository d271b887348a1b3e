//! Thread states: the unit of mutual exclusion for execution.
//!
//! Each thread state owns a node graph, its thread-scope objects and its
//! governance slots. At most one worker is attached to a thread state at any
//! time; everything it mutates is guarded by the thread state's lock.

mod step;

pub(crate) use step::Step;

use crate::{
    executor,
    function::FlowCallback,
    governance::GovernanceContainer,
    graph::{NodeGraph, NodeKey},
    object::container::ManagedObjectContainer,
    office::OfficeShared,
    process::ProcessState,
    types::{ProcessId, ThreadId},
};
use core::fmt::{self, Debug};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

pub(crate) struct ThreadInner {
    pub(crate) graph: NodeGraph,
    pub(crate) objects: Vec<ManagedObjectContainer>,
    pub(crate) governance: Vec<GovernanceContainer>,
    callback: Option<FlowCallback>,
    /// First escalation handed to the callback of a spawned thread state.
    escalation: Option<crate::error::Escalation>,
    /// Governance deactivation at completion has started.
    winding_down: bool,
    complete: bool,
}

/// One logical thread of a process.
pub struct ThreadState {
    id: ThreadId,
    process: Arc<ProcessState>,
    inner: Mutex<ThreadInner>,
    attached: AtomicBool,
    thread_safe: AtomicBool,
}

impl Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("process", &self.process.id())
            .field("attached", &self.is_attached())
            .field("thread_safe", &self.is_thread_safe())
            .finish_non_exhaustive()
    }
}

impl ThreadState {
    /// New thread state of `process` whose first node `start` adds to the
    /// graph. `callback` receives the outcome once the thread state completed.
    pub(crate) fn new(
        process: &Arc<ProcessState>,
        callback: Option<FlowCallback>,
        start: impl FnOnce(&mut NodeGraph) -> NodeKey,
    ) -> (Arc<Self>, NodeKey) {
        let office = process.office();
        let mut graph = NodeGraph::new();
        let node = start(&mut graph);
        let inner = ThreadInner {
            graph,
            objects: office
                .thread_objects()
                .iter()
                .cloned()
                .map(ManagedObjectContainer::new)
                .collect(),
            governance: office
                .governance()
                .iter()
                .cloned()
                .map(GovernanceContainer::new)
                .collect(),
            callback,
            escalation: None,
            winding_down: false,
            complete: false,
        };
        let thread = Arc::new(Self {
            id: office.ids().next_thread(),
            process: process.clone(),
            inner: Mutex::new(inner),
            attached: AtomicBool::new(false),
            thread_safe: AtomicBool::new(false),
        });
        process.register_thread(&thread);
        (thread, node)
    }

    /// Identifier of the thread state.
    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    /// Process the thread state belongs to.
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    /// Whether a worker is running the thread state.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Whether a node flagged the thread state as touched by more than one OS
    /// thread. Once set it stays set.
    #[must_use]
    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe.load(Ordering::Acquire)
    }

    /// Runs `operation` mutually exclusive with the thread state's execution.
    /// Runs directly when called from the worker attached to it.
    pub fn run_thread_safe_operation<R>(&self, operation: impl FnOnce() -> R) -> R {
        if executor::is_attached_to(self) {
            return operation();
        }
        let _guard = self.inner.lock();
        operation()
    }

    /// Runs `operation` mutually exclusive with every other process-safe
    /// operation of the process.
    pub fn run_process_safe_operation<R>(&self, operation: impl FnOnce() -> R) -> R {
        self.process.run_process_safe_operation(operation)
    }

    pub(crate) fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    pub(crate) fn office(&self) -> &Arc<OfficeShared> {
        self.process.office()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ThreadInner> {
        self.inner.lock()
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
    }

    pub(crate) fn mark_thread_safe(&self) {
        if !self.thread_safe.swap(true, Ordering::AcqRel) {
            tracing::trace!(thread = %self.id, "thread state requires thread safety");
        }
    }
}
