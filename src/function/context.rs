use crate::{
    asset::{Asset, AssetCheck, AssetMonitor},
    error::{Escalation, KernelError},
    executor::{Resume, defer, run},
    function::{FlowCallback, FunctionNode},
    governance::GovernanceState,
    graph::{FlowKind, NodeKey},
    object::{ManagedObjectInterest, ObjectIndex, ObjectScope},
    thread::{ThreadInner, ThreadState},
    types::{ProcessId, TeamName, ThreadId},
};
use core::{
    any::Any,
    fmt::{self, Debug},
    time::Duration,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};
use tracing::trace;

/// What user logic sees of the running function.
pub struct FunctionContext<'a> {
    thread: &'a Arc<ThreadState>,
    node: NodeKey,
    function: &'a mut FunctionNode,
    inner: &'a mut ThreadInner,
}

impl Debug for FunctionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("function", self.function.descriptor.name())
            .field("thread", &self.thread.id())
            .finish_non_exhaustive()
    }
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(
        thread: &'a Arc<ThreadState>,
        node: NodeKey,
        function: &'a mut FunctionNode,
        inner: &'a mut ThreadInner,
    ) -> Self {
        Self {
            thread,
            node,
            function,
            inner,
        }
    }

    /// Name of the running function.
    #[must_use]
    pub fn function_name(&self) -> &Arc<str> {
        self.function.descriptor.name()
    }

    /// Process the function runs in.
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.thread.process_id()
    }

    /// Thread state the function runs in.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    /// Thread state the function runs in, for thread-safe and process-safe
    /// operations from other OS threads.
    #[must_use]
    pub fn thread(&self) -> &Arc<ThreadState> {
        self.thread
    }

    /// Argument of the invocation as a `T`.
    #[must_use]
    pub fn argument<T: Any>(&self) -> Option<&T> {
        self.function.argument.as_ref()?.downcast_ref::<T>()
    }

    /// Takes the argument of the invocation if it is a `T`.
    pub fn take_argument<T: Any>(&mut self) -> Option<T> {
        let argument = self.function.argument.take()?;
        match argument.downcast::<T>() {
            Ok(argument) => Some(*argument),
            Err(argument) => {
                self.function.argument = Some(argument);
                None
            }
        }
    }

    /// Runs `access` on the loaded object at `index`.
    ///
    /// # Errors
    /// If nothing is bound at `index`, the object is not loaded for this
    /// function, or it is not a `T`.
    pub fn with_object<T, R>(
        &mut self,
        index: ObjectIndex,
        access: impl FnOnce(&mut T) -> R,
    ) -> Result<R, Escalation>
    where
        T: Any,
    {
        let unknown = || Escalation::new(KernelError::UnknownObject { index });
        match index.scope {
            ObjectScope::Function => {
                let container = self.function.objects.get_mut(index.index).ok_or_else(unknown)?;
                Ok(access(container.object_mut::<T>()?))
            }
            ObjectScope::Thread => {
                let container = self.inner.objects.get_mut(index.index).ok_or_else(unknown)?;
                Ok(access(container.object_mut::<T>()?))
            }
            ObjectScope::Process => self
                .thread
                .process()
                .with_object(index.index, |container| Ok(access(container.object_mut::<T>()?))),
        }
    }

    /// Keeps the object at `index` alive past the end of its scope until the
    /// returned interest is dropped.
    ///
    /// # Errors
    /// If nothing is bound at `index`.
    pub fn register_interest(
        &mut self,
        index: ObjectIndex,
    ) -> Result<ManagedObjectInterest, Escalation> {
        let unknown = || Escalation::new(KernelError::UnknownObject { index });
        match index.scope {
            ObjectScope::Function => Ok(self
                .function
                .objects
                .get_mut(index.index)
                .ok_or_else(unknown)?
                .register_interest()),
            ObjectScope::Thread => Ok(self
                .inner
                .objects
                .get_mut(index.index)
                .ok_or_else(unknown)?
                .register_interest()),
            ObjectScope::Process => self
                .thread
                .process()
                .with_object(index.index, |container| Ok(container.register_interest())),
        }
    }

    /// Triggers the flow at `index` with `argument`. The flow runs before
    /// the function completes, unless it is spawned into its own thread
    /// state. `callback` fires once the flow drained.
    ///
    /// # Errors
    /// If the function has no flow at `index` or its process was cancelled.
    pub fn do_flow(
        &mut self,
        index: usize,
        argument: Option<Box<dyn Any + Send>>,
        callback: Option<FlowCallback>,
    ) -> Result<(), Escalation> {
        let descriptor = self.function.descriptor.clone();
        let flow = descriptor.flows().get(index).ok_or_else(|| KernelError::UnknownFlow {
            function: descriptor.name().clone(),
            index,
        })?;
        let function = flow.function().clone();
        let process = self.thread.process();
        if process.is_cancelled() {
            return Err(KernelError::ProcessCancelled { process: process.id() }.into());
        }
        if flow.is_spawned() {
            let (thread, node) = ThreadState::new(process, callback, |graph| {
                let flow = graph.create_flow(FlowKind::Work, None, None);
                graph.add_function(flow, function, argument)
            });
            trace!(
                process = %self.thread.process_id(),
                thread = %thread.id(),
                flow = index,
                "spawned thread state"
            );
            defer(move || run(thread, Resume::Node(node)));
            return Ok(());
        }
        let graph = &mut self.inner.graph;
        let current = graph.node(self.node);
        let (floor, avoid_team) = (graph.flow(current.flow).floor, current.avoid_team.clone());
        let flow = graph.create_flow(FlowKind::Work, callback, floor);
        let node = graph.add_function(flow, function, argument);
        graph.node_mut(node).avoid_team = avoid_team;
        graph.load_parallel(self.node, node);
        Ok(())
    }

    /// Argument handed to the next function.
    pub fn set_next_argument(&mut self, argument: impl Any + Send) {
        self.function.next_argument = Some(Box::new(argument));
    }

    /// Starts an asynchronous operation. The function does not complete before
    /// every asynchronous flow it created completed or timed out.
    pub fn create_asynchronous_flow(&mut self) -> AsynchronousFlow {
        self.thread.mark_thread_safe();
        let (operations, monitor) = match &self.function.asynchronous {
            Some(asynchronous) => asynchronous.clone(),
            None => {
                let descriptor = &self.function.descriptor;
                let office = self.thread.office();
                let manager = office.asset_manager(descriptor.asset_manager());
                let operations = Arc::new(AsynchronousOperations {
                    function: descriptor.name().clone(),
                    outstanding: AtomicUsize::new(0),
                    started: manager.time(),
                    timeout: descriptor
                        .asynchronous_timeout()
                        .unwrap_or(office.config().default_asynchronous_timeout),
                });
                let monitor = manager.create_monitor(operations.clone());
                self.function.asynchronous = Some((operations.clone(), monitor.clone()));
                (operations, monitor)
            }
        };
        operations.outstanding.fetch_add(1, Ordering::AcqRel);
        AsynchronousFlow {
            operations,
            monitor,
            thread: self.thread.clone(),
        }
    }

    /// Steers the function's continuations (its flows and next function) away
    /// from the team called `team`.
    pub fn avoid_team(&mut self, team: impl Into<TeamName>) {
        self.inner.graph.node_mut(self.node).avoid_team = Some(team.into());
    }

    /// Flags the thread state as touched by more than one OS thread.
    pub fn require_thread_safety(&mut self) {
        self.thread.mark_thread_safe();
    }

    /// State of the thread governance at `index`, if configured.
    #[must_use]
    pub fn governance_state(&self, index: usize) -> Option<GovernanceState> {
        self.inner.governance.get(index).map(|governance| governance.state())
    }
}

/// Outstanding asynchronous operations of one function invocation.
pub(crate) struct AsynchronousOperations {
    function: Arc<str>,
    outstanding: AtomicUsize,
    started: Instant,
    timeout: Duration,
}

impl AsynchronousOperations {
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Asset for AsynchronousOperations {
    fn check_on_asset(&self, check: &mut AssetCheck<'_>) {
        if self.outstanding() == 0 {
            check.release_functions(false);
        } else if check.time() >= self.started + self.timeout {
            tracing::debug!(function = %self.function, "asynchronous operation timed out");
            check.fail_functions(
                KernelError::AsynchronousOperationTimedOut {
                    function: self.function.clone(),
                }
                .into(),
                true,
            );
        }
    }
}

/// Handle completing one asynchronous operation, from any OS thread.
///
/// Dropping it without completing leaves the operation to time out.
#[must_use = "the function waits until the flow completes or times out"]
pub struct AsynchronousFlow {
    operations: Arc<AsynchronousOperations>,
    monitor: Arc<AssetMonitor>,
    thread: Arc<ThreadState>,
}

impl Debug for AsynchronousFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsynchronousFlow")
            .field("function", &self.operations.function)
            .field("outstanding", &self.operations.outstanding())
            .finish_non_exhaustive()
    }
}

impl AsynchronousFlow {
    /// Completes the operation.
    pub fn complete(self) {
        self.complete_with(|| {});
    }

    /// Applies `update` as a thread-safe operation of the function's thread
    /// state, then completes the operation.
    pub fn complete_with(self, update: impl FnOnce()) {
        let Self {
            operations,
            monitor,
            thread,
        } = self;
        thread.run_thread_safe_operation(update);
        if operations.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            monitor.release_functions(false);
        }
    }
}
