//! Processes: isolated invocations owning process-scope objects and one or
//! more thread states.
//!
//! A process completes once every thread state completed, its objects were
//! unloaded (including unloads delayed by interests) and its cleanup sequence
//! ran dry. Recycle functions of unloaded objects run strictly one after the
//! other, each as its own process; their failures are collected as cleanup
//! escalations instead of being escalated.

use crate::{
    error::{CleanupEscalation, Escalation, KernelError},
    executor::{Resume, defer, defer_all, run},
    function::FunctionDescriptor,
    graph::FlowKind,
    object::{
        ManagedObject, ManagedObjectPool, RecycleParameter,
        container::{ManagedObjectContainer, Unload},
    },
    office::OfficeShared,
    thread::ThreadState,
    types::{Argument, Job, ProcessId},
};
use core::fmt::{self, Debug};
use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, warn};

/// Summary handed to a process's completion callback.
#[derive(Debug)]
#[non_exhaustive]
pub struct ProcessCompletion {
    /// The completed process.
    pub process: ProcessId,
    /// Escalation that reached the office catch-all, if any.
    pub escalation: Option<Escalation>,
    /// Failures collected while cleaning up.
    pub cleanup_escalations: Vec<CleanupEscalation>,
    /// Number of recycle functions run for the process.
    pub cleanup_jobs: usize,
    /// Whether the process was cancelled.
    pub cancelled: bool,
}

/// Completion callback of a process.
pub type ProcessCallback = Box<dyn FnOnce(ProcessCompletion) + Send + 'static>;

/// What becomes of an unloaded object.
pub(crate) enum Disposal {
    Nothing,
    Return(Arc<dyn ManagedObjectPool>, Box<dyn ManagedObject>),
    Recycle(CleanupJob),
}

/// A recycle function to run for one unloaded object.
pub(crate) struct CleanupJob {
    pub(crate) source: Arc<str>,
    pub(crate) function: Arc<FunctionDescriptor>,
    pub(crate) parameter: RecycleParameter,
}

pub(crate) struct ProcessInner {
    pub(crate) objects: Vec<ManagedObjectContainer>,
    threads: Vec<Weak<ThreadState>>,
    active_threads: usize,
    pending_unloads: usize,
    objects_unloaded: bool,
    cleanup: VecDeque<CleanupJob>,
    cleanup_running: bool,
    cleanup_jobs: usize,
    escalation: Option<Escalation>,
    cleanup_escalations: Vec<CleanupEscalation>,
    callback: Option<ProcessCallback>,
    complete: bool,
}

/// Shared state of one process.
pub struct ProcessState {
    id: ProcessId,
    office: Arc<OfficeShared>,
    inner: Mutex<ProcessInner>,
    cancelled: AtomicBool,
    safety: ReentrantMutex<()>,
}

impl Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ProcessState {
    pub(crate) fn new(office: Arc<OfficeShared>, callback: Option<ProcessCallback>) -> Arc<Self> {
        let objects = office
            .process_objects()
            .iter()
            .cloned()
            .map(ManagedObjectContainer::new)
            .collect();
        Arc::new(Self {
            id: office.ids().next_process(),
            office,
            inner: Mutex::new(ProcessInner {
                objects,
                threads: Vec::new(),
                active_threads: 0,
                pending_unloads: 0,
                objects_unloaded: false,
                cleanup: VecDeque::new(),
                cleanup_running: false,
                cleanup_jobs: 0,
                escalation: None,
                cleanup_escalations: Vec::new(),
                callback,
                complete: false,
            }),
            cancelled: AtomicBool::new(false),
            safety: ReentrantMutex::new(()),
        })
    }

    /// Identifier of the process.
    #[must_use]
    pub const fn id(&self) -> ProcessId {
        self.id
    }

    /// Whether the process was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the process completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    /// Runs `operation` mutually exclusive with every other process-safe
    /// operation of the process. Re-entrant on the calling OS thread.
    pub fn run_process_safe_operation<R>(&self, operation: impl FnOnce() -> R) -> R {
        let _guard = self.safety.lock();
        operation()
    }

    pub(crate) fn office(&self) -> &Arc<OfficeShared> {
        &self.office
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ProcessInner> {
        self.inner.lock()
    }

    /// Runs `access` on the process object at `index`.
    pub(crate) fn with_object<R>(
        &self,
        index: usize,
        access: impl FnOnce(&mut ManagedObjectContainer) -> Result<R, Escalation>,
    ) -> Result<R, Escalation> {
        let mut inner = self.inner.lock();
        let container = inner.objects.get_mut(index).ok_or(KernelError::UnknownObject {
            index: crate::object::ObjectIndex::process(index),
        })?;
        access(container)
    }

    pub(crate) fn register_thread(&self, thread: &Arc<ThreadState>) {
        let mut inner = self.inner.lock();
        assert!(!inner.complete, "thread state started in completed {}", self.id);
        inner.active_threads += 1;
        inner.threads.retain(|thread| thread.strong_count() > 0);
        inner.threads.push(Arc::downgrade(thread));
    }

    /// Records the escalation that reached the office; the first one wins.
    pub(crate) fn record_escalation(&self, escalation: &Escalation) {
        let mut inner = self.inner.lock();
        if inner.escalation.is_none() {
            inner.escalation = Some(escalation.clone());
        }
    }

    pub(crate) fn record_cleanup_escalation(&self, source: Arc<str>, escalation: Escalation) {
        warn!(process = %self.id, %source, %escalation, "cleanup escalation");
        self.inner
            .lock()
            .cleanup_escalations
            .push(CleanupEscalation { source, escalation });
    }

    /// Flags the process cancelled and has every live thread state cancel its
    /// flows. Returns `false` if it was already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let threads: Vec<Arc<ThreadState>> = self
            .inner
            .lock()
            .threads
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        debug!(process = %self.id, threads = threads.len(), "process cancelled");
        for thread in threads {
            defer(move || run(thread, Resume::Cancel));
        }
        true
    }

    /// Takes over unloaded function or thread objects.
    pub(crate) fn absorb_unloads(self: &Arc<Self>, unloads: Vec<Unload>) {
        if unloads.is_empty() {
            return;
        }
        let jobs = {
            let mut inner = self.inner.lock();
            let mut jobs = Vec::new();
            self.absorb(&mut inner, unloads, &mut jobs);
            self.advance_cleanup(&mut inner, &mut jobs);
            jobs
        };
        defer_all(jobs);
    }

    /// Accounts for a completed thread state, unloading the process objects
    /// once the last one completed.
    pub(crate) fn thread_complete(self: &Arc<Self>, unloads: Vec<Unload>) {
        let jobs = {
            let mut inner = self.inner.lock();
            let mut jobs = Vec::new();
            inner.active_threads -= 1;
            self.absorb(&mut inner, unloads, &mut jobs);
            if inner.active_threads == 0 && !inner.objects_unloaded {
                inner.objects_unloaded = true;
                let unloads = core::mem::take(&mut inner.objects)
                    .into_iter()
                    .map(|container| container.unload(self))
                    .collect();
                self.absorb(&mut inner, unloads, &mut jobs);
            }
            self.advance_cleanup(&mut inner, &mut jobs);
            self.check_complete(&mut inner, &mut jobs);
            jobs
        };
        defer_all(jobs);
    }

    /// Finishes an unload delayed by interests.
    pub(crate) fn finish_pending_unload(self: &Arc<Self>, disposal: Disposal) {
        let jobs = {
            let mut inner = self.inner.lock();
            let mut jobs = Vec::new();
            inner.pending_unloads -= 1;
            Self::apply(&mut inner, disposal, &mut jobs);
            self.advance_cleanup(&mut inner, &mut jobs);
            self.check_complete(&mut inner, &mut jobs);
            jobs
        };
        defer_all(jobs);
    }

    fn absorb(&self, inner: &mut ProcessInner, unloads: Vec<Unload>, jobs: &mut Vec<Job>) {
        for unload in unloads {
            match unload {
                Unload::Done(disposal) => Self::apply(inner, disposal, jobs),
                Unload::AwaitingInterest => inner.pending_unloads += 1,
            }
        }
    }

    fn apply(inner: &mut ProcessInner, disposal: Disposal, jobs: &mut Vec<Job>) {
        match disposal {
            Disposal::Nothing => {}
            Disposal::Return(pool, object) => {
                jobs.push(Box::new(move || pool.return_managed_object(object)));
            }
            Disposal::Recycle(job) => inner.cleanup.push_back(job),
        }
    }

    /// Starts the next recycle function unless one is running.
    fn advance_cleanup(self: &Arc<Self>, inner: &mut ProcessInner, jobs: &mut Vec<Job>) {
        if inner.cleanup_running {
            return;
        }
        let Some(CleanupJob {
            source,
            function,
            parameter,
        }) = inner.cleanup.pop_front()
        else {
            return;
        };
        inner.cleanup_running = true;
        inner.cleanup_jobs += 1;
        debug!(
            process = %self.id,
            %source,
            function = %function.name(),
            "running recycle function"
        );
        let process = self.clone();
        jobs.push(Box::new(move || {
            let office = process.office.clone();
            let argument: Argument = Box::new(parameter);
            invoke(
                &office,
                &function,
                Some(argument),
                Some(Box::new(move |completion: ProcessCompletion| {
                    process.cleanup_finished(&source, completion);
                })),
            );
        }));
    }

    fn cleanup_finished(self: &Arc<Self>, source: &Arc<str>, completion: ProcessCompletion) {
        let ProcessCompletion {
            escalation,
            cleanup_escalations,
            ..
        } = completion;
        if let Some(escalation) = escalation {
            self.record_cleanup_escalation(source.clone(), escalation);
        }
        let jobs = {
            let mut inner = self.inner.lock();
            let mut jobs = Vec::new();
            inner.cleanup_escalations.extend(cleanup_escalations);
            inner.cleanup_running = false;
            self.advance_cleanup(&mut inner, &mut jobs);
            self.check_complete(&mut inner, &mut jobs);
            jobs
        };
        defer_all(jobs);
    }

    fn check_complete(&self, inner: &mut ProcessInner, jobs: &mut Vec<Job>) {
        let settled = inner.active_threads == 0
            && inner.objects_unloaded
            && inner.pending_unloads == 0
            && !inner.cleanup_running
            && inner.cleanup.is_empty();
        if inner.complete || !settled {
            return;
        }
        inner.complete = true;
        let completion = ProcessCompletion {
            process: self.id,
            escalation: inner.escalation.take(),
            cleanup_escalations: core::mem::take(&mut inner.cleanup_escalations),
            cleanup_jobs: inner.cleanup_jobs,
            cancelled: self.is_cancelled(),
        };
        debug!(
            process = %self.id,
            escalated = completion.escalation.is_some(),
            cleanup_jobs = completion.cleanup_jobs,
            cancelled = completion.cancelled,
            "process complete"
        );
        if let Some(callback) = inner.callback.take() {
            jobs.push(Box::new(move || callback(completion)));
        }
    }
}

/// Starts `function` in a new process of `office`.
pub(crate) fn invoke(
    office: &Arc<OfficeShared>,
    function: &Arc<FunctionDescriptor>,
    argument: Option<Argument>,
    callback: Option<ProcessCallback>,
) -> ProcessHandle {
    let process = ProcessState::new(office.clone(), callback);
    let (thread, node) = ThreadState::new(&process, None, |graph| {
        let flow = graph.create_flow(FlowKind::Work, None, None);
        graph.add_function(flow, function.clone(), argument)
    });
    debug!(
        process = %process.id,
        thread = %thread.id(),
        function = %function.name(),
        "process invoked"
    );
    defer(move || run(thread, Resume::Node(node)));
    ProcessHandle(process)
}

/// Handle on an invoked process.
#[derive(Debug, Clone)]
pub struct ProcessHandle(Arc<ProcessState>);

impl ProcessHandle {
    /// Identifier of the process.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.0.id()
    }

    /// Cancels the process: its flows are dropped without running further,
    /// their callbacks receive `FlowOutcome::Cancelled`, and its objects are
    /// still unloaded and recycled.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    /// Whether the process was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Whether the process completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.0.is_complete()
    }

    /// See [`ProcessState::run_process_safe_operation`].
    pub fn run_process_safe_operation<R>(&self, operation: impl FnOnce() -> R) -> R {
        self.0.run_process_safe_operation(operation)
    }
}
