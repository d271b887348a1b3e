//! Function descriptors: the immutable meta-data of a unit of user logic and
//! of the continuations it may trigger.

mod context;

pub use context::{AsynchronousFlow, FunctionContext};

use crate::{
    asset::AssetMonitor,
    error::Escalation,
    escalation::{EscalationFlow, EscalationProcedure},
    executor::LoadPlan,
    object::{ManagedObjectDescriptor, ObjectIndex, container::ManagedObjectContainer},
    types::{Argument, TeamName},
};
use context::AsynchronousOperations;
use core::{
    fmt::{self, Debug},
    time::Duration,
};
use derive_more::Display;
use std::sync::Arc;

/// User logic of a function.
pub type ManagedFunction = dyn Fn(&mut FunctionContext<'_>) -> Result<(), Escalation> + Send + Sync;

/// Outcome handed to a flow's completion callback.
#[derive(Debug, Clone)]
pub enum FlowOutcome {
    /// Every node of the flow completed.
    Completed,
    /// A node of the flow escalated and the callback is the handler.
    Escalated(Escalation),
    /// The flow was cancelled with its process.
    Cancelled,
}

impl FlowOutcome {
    /// Whether the flow completed without escalation.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Completion callback of a flow.
pub type FlowCallback = Box<dyn FnOnce(FlowOutcome) + Send + 'static>;

/// A continuation a function may trigger through
/// [`FunctionContext::do_flow`].
#[derive(Debug, Clone)]
pub struct FlowDescriptor {
    function: Arc<FunctionDescriptor>,
    spawn_thread_state: bool,
}

impl FlowDescriptor {
    /// Flow running `function` within the invoking thread.
    #[must_use]
    pub const fn new(function: Arc<FunctionDescriptor>) -> Self {
        Self {
            function,
            spawn_thread_state: false,
        }
    }

    /// Runs the flow in a new thread state of the same process.
    #[must_use]
    pub const fn spawn_thread_state(mut self) -> Self {
        self.spawn_thread_state = true;
        self
    }

    /// Function the flow starts with.
    #[must_use]
    pub fn function(&self) -> &Arc<FunctionDescriptor> {
        &self.function
    }

    /// Whether the flow runs in its own thread state.
    #[must_use]
    pub const fn is_spawned(&self) -> bool {
        self.spawn_thread_state
    }
}

/// Immutable description of a function.
pub struct FunctionDescriptor {
    name: Arc<str>,
    logic: Box<ManagedFunction>,
    team: Option<TeamName>,
    required_objects: Vec<ObjectIndex>,
    function_objects: Vec<Arc<ManagedObjectDescriptor>>,
    governance: Vec<(usize, bool)>,
    flows: Vec<FlowDescriptor>,
    next: Option<Arc<FunctionDescriptor>>,
    escalation: EscalationProcedure,
    asynchronous_timeout: Option<Duration>,
    asset_manager: Option<Arc<str>>,
}

impl Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("team", &self.team)
            .field("required_objects", &self.required_objects)
            .field("function_objects", &self.function_objects.len())
            .field("governance", &self.governance)
            .field("flows", &self.flows.len())
            .field("next", &self.next.as_ref().map(|next| &next.name))
            .finish_non_exhaustive()
    }
}

impl FunctionDescriptor {
    /// Starts describing a function called `name` running `logic`.
    pub fn builder<F>(name: impl Into<Arc<str>>, logic: F) -> FunctionDescriptorBuilder
    where
        F: Fn(&mut FunctionContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static,
    {
        FunctionDescriptorBuilder {
            descriptor: Self {
                name: name.into(),
                logic: Box::new(logic),
                team: None,
                required_objects: Vec::new(),
                function_objects: Vec::new(),
                governance: Vec::new(),
                flows: Vec::new(),
                next: None,
                escalation: EscalationProcedure::new(),
                asynchronous_timeout: None,
                asset_manager: None,
            },
        }
    }

    /// Name of the function.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Team responsible for the function; `None` lets any team run it.
    #[must_use]
    pub fn team(&self) -> Option<&TeamName> {
        self.team.as_ref()
    }

    /// Objects loaded before the logic runs, in declaration order.
    #[must_use]
    pub fn required_objects(&self) -> &[ObjectIndex] {
        &self.required_objects
    }

    /// Objects bound to each invocation of the function.
    #[must_use]
    pub fn function_objects(&self) -> &[Arc<ManagedObjectDescriptor>] {
        &self.function_objects
    }

    /// Governance requirements: thread governance index and whether it must
    /// be active (`true`) or inactive (`false`) while the function runs.
    #[must_use]
    pub fn governance(&self) -> &[(usize, bool)] {
        &self.governance
    }

    /// Flows the function may trigger, by index.
    #[must_use]
    pub fn flows(&self) -> &[FlowDescriptor] {
        &self.flows
    }

    /// Function run after this one, in the same flow.
    #[must_use]
    pub fn next(&self) -> Option<&Arc<FunctionDescriptor>> {
        self.next.as_ref()
    }

    /// Escalation procedure of the function.
    #[must_use]
    pub fn escalation_procedure(&self) -> &EscalationProcedure {
        &self.escalation
    }

    pub(crate) fn asynchronous_timeout(&self) -> Option<Duration> {
        self.asynchronous_timeout
    }

    pub(crate) fn asset_manager(&self) -> Option<&Arc<str>> {
        self.asset_manager.as_ref()
    }

    pub(crate) fn execute(&self, context: &mut FunctionContext<'_>) -> Result<(), Escalation> {
        (self.logic)(context)
    }
}

/// Builder of a [`FunctionDescriptor`].
#[must_use]
#[derive(Debug)]
pub struct FunctionDescriptorBuilder {
    descriptor: FunctionDescriptor,
}

impl FunctionDescriptorBuilder {
    /// Team responsible for running the function.
    pub fn team(mut self, team: impl Into<TeamName>) -> Self {
        self.descriptor.team = Some(team.into());
        self
    }

    /// Requires the object at `index` to be loaded and ready before the logic
    /// runs.
    pub fn require_object(mut self, index: ObjectIndex) -> Self {
        self.descriptor.required_objects.push(index);
        self
    }

    /// Binds an object to each invocation; it is reachable as
    /// `ObjectIndex::function(n)` in binding order and is loaded before the
    /// logic runs.
    pub fn function_object(mut self, descriptor: ManagedObjectDescriptor) -> Self {
        self.descriptor.function_objects.push(Arc::new(descriptor));
        self
    }

    /// Requires the thread governance at `index` to be active (`true`) or
    /// inactive (`false`) while the function runs.
    pub fn govern(mut self, index: usize, active: bool) -> Self {
        self.descriptor.governance.push((index, active));
        self
    }

    /// Adds a flow, reachable by index in declaration order.
    pub fn flow(mut self, flow: FlowDescriptor) -> Self {
        self.descriptor.flows.push(flow);
        self
    }

    /// Function run after this one completes.
    pub fn next(mut self, function: Arc<FunctionDescriptor>) -> Self {
        self.descriptor.next = Some(function);
        self
    }

    /// Appends an escalation entry to the function's procedure.
    pub fn escalation(mut self, flow: EscalationFlow) -> Self {
        self.descriptor.escalation = self.descriptor.escalation.with(flow);
        self
    }

    /// Timeout of the function's asynchronous flows.
    pub fn asynchronous_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.asynchronous_timeout = Some(timeout);
        self
    }

    /// Asset manager checking the function's asynchronous flows.
    pub fn asset_manager(mut self, name: impl Into<Arc<str>>) -> Self {
        self.descriptor.asset_manager = Some(name.into());
        self
    }

    /// Finishes the descriptor.
    #[must_use]
    pub fn build(self) -> Arc<FunctionDescriptor> {
        Arc::new(self.descriptor)
    }
}

/// Progress of a function node. Re-executing a node resumes at its phase.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    #[display("governance")]
    Governance,
    #[display("load")]
    Load,
    #[display("ready")]
    Ready,
    #[display("execute")]
    Execute,
    #[display("await-asynchronous")]
    AwaitAsynchronous,
    #[display("complete")]
    Complete,
    /// Escalated; completes without running the next function.
    #[display("failed")]
    Failed,
}

/// Runtime state of one function invocation.
pub(crate) struct FunctionNode {
    pub(crate) descriptor: Arc<FunctionDescriptor>,
    pub(crate) argument: Option<Argument>,
    pub(crate) next_argument: Option<Argument>,
    pub(crate) phase: Phase,
    pub(crate) objects: Vec<ManagedObjectContainer>,
    pub(crate) plan: Option<LoadPlan>,
    pub(crate) cursor: usize,
    pub(crate) asynchronous: Option<(Arc<AsynchronousOperations>, Arc<AssetMonitor>)>,
}

impl Debug for FunctionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionNode")
            .field("function", &self.descriptor.name)
            .field("phase", &self.phase)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl FunctionNode {
    pub(crate) fn new(descriptor: Arc<FunctionDescriptor>, argument: Option<Argument>) -> Self {
        let objects = descriptor
            .function_objects
            .iter()
            .cloned()
            .map(ManagedObjectContainer::new)
            .collect();
        Self {
            descriptor,
            argument,
            next_argument: None,
            phase: Phase::Governance,
            objects,
            plan: None,
            cursor: 0,
            asynchronous: None,
        }
    }
}
