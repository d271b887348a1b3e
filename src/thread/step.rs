use super::{ThreadInner, ThreadState};
use crate::{
    asset::AwaitOutcome,
    config::GovernanceDeactivationStrategy,
    error::{Escalation, KernelError},
    escalation::EscalationLevel,
    executor::{Continuation, LoadPlan, PlanError, Resume, defer},
    function::{FlowOutcome, FunctionContext, FunctionDescriptor, FunctionNode, Phase},
    governance::GovernanceContainer,
    graph::{Completion, FlowKind, FlowRecord, NodeGraph, NodeKey, NodeWork, Operation, Removal},
    object::{
        ObjectIndex, ObjectRegistry, ObjectScope,
        container::{Availability, ManagedObjectContainer, Registration},
    },
    office::OfficeShared,
    types::ThreadId,
};
use core::any::Any;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// How far a function node got in one execution.
enum Outcome {
    /// A parallel branch was loaded under the node; run this node first.
    Continue(NodeKey),
    /// The node waits on an asset.
    Latched,
    /// The node completed.
    Finished,
    /// The node failed.
    Escalate(Escalation),
}

/// Exclusive access to an attached thread state.
pub(crate) struct Step<'a> {
    thread: &'a Arc<ThreadState>,
    inner: &'a mut ThreadInner,
}

impl<'a> Step<'a> {
    pub(crate) fn new(thread: &'a Arc<ThreadState>, inner: &'a mut ThreadInner) -> Self {
        Self { thread, inner }
    }

    pub(crate) fn office(&self) -> &'a Arc<OfficeShared> {
        let thread: &'a Arc<ThreadState> = self.thread;
        thread.office()
    }

    pub(crate) fn graph(&self) -> &NodeGraph {
        &self.inner.graph
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.thread.process().is_cancelled()
    }

    /// Node to continue at, if the reason for running still applies.
    pub(crate) fn resume(&mut self, resume: Resume) -> Option<NodeKey> {
        match resume {
            Resume::Node(node) if self.inner.graph.contains(node) => Some(node),
            Resume::Failed(node, escalation) if self.inner.graph.contains(node) => {
                self.handle_escalation(node, escalation)
            }
            Resume::Cancel if self.is_cancelled() && self.inner.graph.has_cancellable_flows() => {
                self.cancel_flows()
            }
            stale => {
                trace!(thread = %self.thread.id(), ?stale, "ignoring stale resumption");
                None
            }
        }
    }

    /// Runs `node` and determines the node to run next.
    pub(crate) fn execute(&mut self, node: NodeKey) -> Option<NodeKey> {
        match self.inner.graph.take_work(node) {
            NodeWork::Operation(operation) => {
                operation(self);
                self.finish_node(node, None)
            }
            NodeWork::Function(mut function) => match self.execute_function(node, &mut function) {
                Outcome::Finished => self.finish_node(node, Some(function)),
                Outcome::Continue(next) => {
                    self.inner.graph.restore_work(node, NodeWork::Function(function));
                    Some(next)
                }
                Outcome::Latched => {
                    self.inner.graph.restore_work(node, NodeWork::Function(function));
                    None
                }
                Outcome::Escalate(escalation) => {
                    self.inner.graph.restore_work(node, NodeWork::Function(function));
                    self.handle_escalation(node, escalation)
                }
            },
            NodeWork::Executing => {
                unreachable!("Step::execute: node {node:?} is already executing")
            }
        }
    }

    /// Runs `b` once `a` and everything loaded after it completed.
    pub(crate) fn then(&mut self, a: NodeKey, b: NodeKey) {
        self.inner.graph.load_sequential(a, b);
    }

    fn execute_function(&mut self, node: NodeKey, function: &mut FunctionNode) -> Outcome {
        loop {
            trace!(
                thread = %self.thread.id(),
                function = %function.descriptor.name(),
                phase = %function.phase,
                "executing function"
            );
            match function.phase {
                Phase::Governance => {
                    function.phase = Phase::Load;
                    if let Some(first) = self.govern(node, function) {
                        return Outcome::Continue(first);
                    }
                }
                Phase::Load => match self.load(node, function) {
                    Ok(Availability::Available) => {
                        function.phase = Phase::Ready;
                        function.cursor = 0;
                    }
                    Ok(Availability::Latched) => return Outcome::Latched,
                    Err(escalation) => return Outcome::Escalate(escalation),
                },
                Phase::Ready => match self.ready(node, function) {
                    Ok(Availability::Available) => function.phase = Phase::Execute,
                    Ok(Availability::Latched) => return Outcome::Latched,
                    Err(escalation) => return Outcome::Escalate(escalation),
                },
                Phase::Execute => {
                    function.phase = Phase::AwaitAsynchronous;
                    let descriptor = function.descriptor.clone();
                    let mut context = FunctionContext::new(self.thread, node, function, self.inner);
                    if let Err(escalation) = descriptor.execute(&mut context) {
                        return Outcome::Escalate(escalation);
                    }
                    if self.inner.graph.node(node).parallel_node().is_some() {
                        return Outcome::Continue(self.inner.graph.furthest_parallel(node));
                    }
                }
                Phase::AwaitAsynchronous => match self.await_asynchronous(node, function) {
                    Ok(Availability::Available) => function.phase = Phase::Complete,
                    Ok(Availability::Latched) => return Outcome::Latched,
                    Err(escalation) => return Outcome::Escalate(escalation),
                },
                Phase::Complete => {
                    self.load_next(node, function);
                    return Outcome::Finished;
                }
                Phase::Failed => return Outcome::Finished,
            }
        }
    }

    /// Loads the governance transitions the function requires as one
    /// sequential branch under `node`.
    fn govern(&mut self, node: NodeKey, function: &FunctionNode) -> Option<NodeKey> {
        let strategy = self.deactivation_strategy();
        let flow = self.inner.graph.node(node).flow;
        let mut first = None;
        for &(index, active) in function.descriptor.governance() {
            let Some(governance) = self.inner.governance.get(index) else {
                continue;
            };
            let operations = match (active, governance.is_active()) {
                (true, false) => vec![activate(index)],
                (false, true) => vec![transit(index, strategy), deactivate(index)],
                _ => continue,
            };
            for operation in operations {
                let step = self.inner.graph.add_node(flow, NodeWork::Operation(operation));
                match first {
                    None => first = Some(step),
                    Some(first) => self.then(first, step),
                }
            }
        }
        let first = first?;
        self.inner.graph.load_parallel(node, first);
        Some(self.inner.graph.furthest_parallel(node))
    }

    fn deactivation_strategy(&self) -> GovernanceDeactivationStrategy {
        if self.is_cancelled() {
            GovernanceDeactivationStrategy::Disregard
        } else {
            self.office().config().deactivation_strategy
        }
    }

    fn plan(&self, function: &FunctionNode) -> Result<LoadPlan, Escalation> {
        let office = self.office();
        let descriptor = &function.descriptor;
        let required: Vec<ObjectIndex> = descriptor
            .required_objects()
            .iter()
            .copied()
            .chain((0..descriptor.function_objects().len()).map(ObjectIndex::function))
            .collect();
        LoadPlan::new(&required, |index| {
            let objects = match index.scope {
                ObjectScope::Function => descriptor.function_objects(),
                ObjectScope::Thread => office.thread_objects(),
                ObjectScope::Process => office.process_objects(),
            };
            objects.get(index.index).map(|object| object.dependencies())
        })
        .map_err(|error| match error {
            PlanError::Unknown(index) => KernelError::UnknownObject { index }.into(),
            PlanError::Cycle => KernelError::DependencyCycle {
                function: descriptor.name().clone(),
            }
            .into(),
        })
    }

    /// Sources the planned objects in order, enlisting each with the active
    /// governance of the thread.
    fn load(
        &mut self,
        node: NodeKey,
        function: &mut FunctionNode,
    ) -> Result<Availability, Escalation> {
        if function.plan.is_none() {
            function.plan = Some(self.plan(function)?);
            function.cursor = 0;
        }
        let thread = self.thread;
        let office = self.office();
        while let Some(&index) = function
            .plan
            .as_ref()
            .and_then(|plan| plan.order().get(function.cursor))
        {
            let work = || Continuation::boxed(thread.clone(), node);
            let availability = match index.scope {
                ObjectScope::Function => {
                    object_at(&mut function.objects, index)?.load(office, work)?
                }
                ObjectScope::Thread => {
                    object_at(&mut self.inner.objects, index)?.load(office, work)?
                }
                ObjectScope::Process => thread
                    .process()
                    .with_object(index.index, |container| container.load(office, work))?,
            };
            if availability == Availability::Latched {
                return Ok(Availability::Latched);
            }
            self.enlist(index, function)?;
            function.cursor += 1;
        }
        Ok(Availability::Available)
    }

    fn enlist(
        &mut self,
        index: ObjectIndex,
        function: &mut FunctionNode,
    ) -> Result<(), Escalation> {
        let ThreadInner {
            objects, governance, ..
        } = &mut *self.inner;
        if !governance.iter().any(GovernanceContainer::is_active) {
            return Ok(());
        }
        let thread = self.thread.id();
        match index.scope {
            ObjectScope::Function => {
                enlist(thread, object_at(&mut function.objects, index)?, governance)
            }
            ObjectScope::Thread => enlist(thread, object_at(objects, index)?, governance),
            ObjectScope::Process => self
                .thread
                .process()
                .with_object(index.index, |container| enlist(thread, container, governance)),
        }
    }

    /// Injects dependencies into coordinating objects and waits for
    /// asynchronous objects to be ready.
    fn ready(
        &mut self,
        node: NodeKey,
        function: &mut FunctionNode,
    ) -> Result<Availability, Escalation> {
        let thread = self.thread;
        let planned = function.plan.as_ref().map_or(0, LoadPlan::len);
        while function.cursor < planned {
            let index = function.plan.as_ref().expect("Step::ready: [1]").order()[function.cursor];
            self.coordinate(index, function)?;
            let work = || Continuation::boxed(thread.clone(), node);
            let availability = match index.scope {
                ObjectScope::Function => {
                    object_at(&mut function.objects, index)?.check_ready(work)?
                }
                ObjectScope::Thread => {
                    object_at(&mut self.inner.objects, index)?.check_ready(work)?
                }
                ObjectScope::Process => thread
                    .process()
                    .with_object(index.index, |container| container.check_ready(work))?,
            };
            if availability == Availability::Latched {
                return Ok(Availability::Latched);
            }
            function.cursor += 1;
        }
        Ok(Availability::Available)
    }

    fn coordinate(
        &mut self,
        index: ObjectIndex,
        function: &mut FunctionNode,
    ) -> Result<(), Escalation> {
        let process = self.thread.process();
        let pending = |container: &mut ManagedObjectContainer| -> Result<_, Escalation> {
            Ok(container
                .needs_coordination()
                .then(|| container.descriptor().dependencies().to_vec()))
        };
        let dependencies = match index.scope {
            ObjectScope::Function => pending(object_at(&mut function.objects, index)?)?,
            ObjectScope::Thread => pending(object_at(&mut self.inner.objects, index)?)?,
            ObjectScope::Process => process.with_object(index.index, pending)?,
        };
        let Some(dependencies) = dependencies else {
            return Ok(());
        };
        let take = |container: &mut ManagedObjectContainer| -> Result<_, Escalation> {
            Ok(container.take_object())
        };
        let mut object = match index.scope {
            ObjectScope::Function => take(object_at(&mut function.objects, index)?)?,
            ObjectScope::Thread => take(object_at(&mut self.inner.objects, index)?)?,
            ObjectScope::Process => process.with_object(index.index, take)?,
        }
        .expect("Step::coordinate: [1]");
        let result = {
            let mut process_inner = process.lock();
            gather(
                [
                    (ObjectScope::Function, &mut function.objects[..]),
                    (ObjectScope::Thread, &mut self.inner.objects[..]),
                    (ObjectScope::Process, &mut process_inner.objects[..]),
                ],
                &dependencies,
            )
            .and_then(|dependencies| match object.coordinating() {
                Some(coordinating) => {
                    coordinating.load_objects(&mut ObjectRegistry::new(dependencies))
                }
                None => Ok(()),
            })
        };
        let coordinated = result.is_ok();
        let restore = move |container: &mut ManagedObjectContainer| -> Result<(), Escalation> {
            container.restore_object(object, coordinated);
            Ok(())
        };
        match index.scope {
            ObjectScope::Function => restore(object_at(&mut function.objects, index)?)?,
            ObjectScope::Thread => restore(object_at(&mut self.inner.objects, index)?)?,
            ObjectScope::Process => process.with_object(index.index, restore)?,
        }
        result
    }

    fn await_asynchronous(
        &mut self,
        node: NodeKey,
        function: &FunctionNode,
    ) -> Result<Availability, Escalation> {
        let Some((operations, monitor)) = &function.asynchronous else {
            return Ok(Availability::Available);
        };
        if operations.outstanding() == 0 {
            return Ok(Availability::Available);
        }
        match monitor.await_on_asset(|| Continuation::boxed(self.thread.clone(), node)) {
            AwaitOutcome::Proceed => Ok(Availability::Available),
            AwaitOutcome::Failed(escalation) => Err(escalation),
            AwaitOutcome::Latched => {
                if operations.outstanding() == 0 {
                    // Completed between the check and the latch.
                    monitor.release_functions(false);
                }
                Ok(Availability::Latched)
            }
        }
    }

    fn load_next(&mut self, node: NodeKey, function: &mut FunctionNode) {
        let Some(next) = function.descriptor.next().cloned() else {
            return;
        };
        let argument = function.next_argument.take();
        let graph = &mut self.inner.graph;
        let record = graph.node(node);
        let (flow, avoid_team) = (record.flow, record.avoid_team.clone());
        let successor = graph.add_function(flow, next, argument);
        graph.node_mut(successor).avoid_team = avoid_team;
        self.then(node, successor);
    }

    fn finish_node(
        &mut self,
        node: NodeKey,
        function: Option<Box<FunctionNode>>,
    ) -> Option<NodeKey> {
        let (work, completion) = self.inner.graph.complete(node);
        let function = function.or(match work {
            NodeWork::Function(function) => Some(function),
            NodeWork::Operation(_) | NodeWork::Executing => None,
        });
        if let Some(function) = function {
            let FunctionNode { objects, .. } = *function;
            self.release_objects(objects);
        }
        self.after_completion(completion)
    }

    /// Finishes a failed node once its parallel branch completed.
    fn finish_failed(&mut self, node: NodeKey) -> Option<NodeKey> {
        if self.inner.graph.node(node).parallel_node().is_some() {
            return Some(self.inner.graph.furthest_parallel(node));
        }
        self.finish_node(node, None)
    }

    fn after_completion(&mut self, completion: Completion) -> Option<NodeKey> {
        let Completion { next, drained } = completion;
        if let Some(flow) = drained {
            self.flow_drained(flow, false);
        }
        match next {
            Some(next) => Some(next),
            None if self.inner.graph.has_active_flows() => None,
            None => self.thread_drained(),
        }
    }

    /// Unregisters the objects from this thread's governance and unloads them.
    fn release_objects(&mut self, objects: Vec<ManagedObjectContainer>) {
        if objects.is_empty() {
            return;
        }
        let thread = self.thread.id();
        let process = self.thread.process();
        let governance = &mut self.inner.governance;
        let unloads = objects
            .into_iter()
            .map(|mut container| {
                for registration in container.registrations_of(thread) {
                    container.remove_registrations(thread, registration.governance);
                    let Some(governance) = governance.get_mut(registration.governance) else {
                        continue;
                    };
                    if let Err(escalation) = governance.unregister(registration.id) {
                        process.record_cleanup_escalation(
                            container.bound_name().clone(),
                            escalation,
                        );
                    }
                }
                container.unload(process)
            })
            .collect();
        process.absorb_unloads(unloads);
    }

    fn flow_drained(&mut self, flow: FlowRecord, cancelled: bool) {
        if let FlowKind::Escalation { escalation, level } = flow.kind {
            trace!(thread = %self.thread.id(), %level, "escalation handler completed");
            defer(move || escalation.notify_completion());
        }
        let escalation = flow.escalation;
        match flow.callback {
            Some(callback) => {
                let outcome = match &escalation {
                    _ if cancelled => FlowOutcome::Cancelled,
                    Some(escalation) => FlowOutcome::Escalated(escalation.clone()),
                    None => FlowOutcome::Completed,
                };
                defer(move || {
                    callback(outcome);
                    if let Some(escalation) = escalation {
                        escalation.notify_completion();
                    }
                });
            }
            None => {
                if let Some(escalation) = escalation {
                    defer(move || escalation.notify_completion());
                }
            }
        }
    }

    /// Every flow of the thread drained: deactivate the governance still
    /// active, then complete the thread state.
    fn thread_drained(&mut self) -> Option<NodeKey> {
        if !self.inner.winding_down {
            self.inner.winding_down = true;
            let active: Vec<usize> = self
                .inner
                .governance
                .iter()
                .enumerate()
                .filter(|(_, governance)| governance.is_active())
                .map(|(index, _)| index)
                .collect();
            if !active.is_empty() {
                let strategy = self.deactivation_strategy();
                debug!(
                    thread = %self.thread.id(),
                    governance = active.len(),
                    ?strategy,
                    "deactivating governance"
                );
                let flow = self.inner.graph.create_flow(FlowKind::Governance, None, None);
                let mut first = None;
                for index in active {
                    for operation in [transit(index, strategy), deactivate(index)] {
                        let step = self.inner.graph.add_node(flow, NodeWork::Operation(operation));
                        match first {
                            None => first = Some(step),
                            Some(first) => self.then(first, step),
                        }
                    }
                }
                return first;
            }
        }
        self.complete_thread();
        None
    }

    fn complete_thread(&mut self) {
        assert!(!self.inner.complete, "thread state {} completed twice", self.thread.id());
        self.inner.complete = true;
        let process = self.thread.process();
        let cancelled = self.is_cancelled();
        if let Some(callback) = self.inner.callback.take() {
            let escalation = self.inner.escalation.take();
            let outcome = match &escalation {
                _ if cancelled => FlowOutcome::Cancelled,
                Some(escalation) => FlowOutcome::Escalated(escalation.clone()),
                None => FlowOutcome::Completed,
            };
            defer(move || {
                callback(outcome);
                if let Some(escalation) = escalation {
                    escalation.notify_completion();
                }
            });
        }
        let unloads = core::mem::take(&mut self.inner.objects)
            .into_iter()
            .map(|container| container.unload(process))
            .collect();
        debug!(
            process = %process.id(),
            thread = %self.thread.id(),
            cancelled,
            "thread state complete"
        );
        process.thread_complete(unloads);
    }

    /// Drops every cancellable flow without running it further.
    pub(crate) fn cancel_flows(&mut self) -> Option<NodeKey> {
        let removal = self.inner.graph.cancel_flows(FlowKind::is_cancellable);
        debug!(
            thread = %self.thread.id(),
            nodes = removal.works.len(),
            flows = removal.drained.len(),
            "cancelled flows"
        );
        self.discard(removal, true);
        if self.inner.graph.has_active_flows() {
            None
        } else {
            self.thread_drained()
        }
    }

    fn discard(&mut self, removal: Removal, cancelled: bool) {
        let Removal { works, drained } = removal;
        for work in works {
            if let NodeWork::Function(function) = work {
                let FunctionNode { objects, .. } = *function;
                self.release_objects(objects);
            }
        }
        for flow in drained {
            self.flow_drained(flow, cancelled);
        }
    }

    /// Resolves `escalation` raised by `node` to the nearest handler.
    fn handle_escalation(&mut self, node: NodeKey, escalation: Escalation) -> Option<NodeKey> {
        let removal = self.inner.graph.remove_successors(node);
        self.discard(removal, true);

        let record = self.inner.graph.node_mut(node);
        let flow = record.flow;
        if let NodeWork::Function(function) = &mut record.work {
            function.phase = Phase::Failed;
            debug!(
                thread = %self.thread.id(),
                function = %function.descriptor.name(),
                %escalation,
                "function escalated"
            );
            let handler = function
                .descriptor
                .escalation_procedure()
                .escalation_flow(&escalation)
                .map(|flow| flow.handler().clone());
            if let Some(handler) = handler {
                return Some(self.escalate_to_handler(
                    node,
                    handler,
                    escalation,
                    EscalationLevel::Function,
                ));
            }
        }

        let record = self.inner.graph.flow_mut(flow);
        let floor = record.floor;
        if record.callback.is_some() {
            trace!(thread = %self.thread.id(), "escalation handed to flow callback");
            if record.escalation.is_none() {
                record.escalation = Some(escalation);
            } else {
                defer(move || escalation.notify_completion());
            }
            return self.finish_failed(node);
        }

        let admits = |level: EscalationLevel| floor.map_or(true, |floor| level > floor);
        let office = self.office();
        if admits(EscalationLevel::Thread) {
            if self.inner.callback.is_some() {
                trace!(thread = %self.thread.id(), "escalation handed to thread callback");
                if self.inner.escalation.is_none() {
                    self.inner.escalation = Some(escalation);
                } else {
                    defer(move || escalation.notify_completion());
                }
                return self.finish_failed(node);
            }
            if let Some(flow) = office.thread_escalation().escalation_flow(&escalation) {
                let handler = flow.handler().clone();
                return Some(self.escalate_to_handler(
                    node,
                    handler,
                    escalation,
                    EscalationLevel::Thread,
                ));
            }
        }
        if admits(EscalationLevel::Process) {
            if let Some(flow) = office.process_escalation().escalation_flow(&escalation) {
                let handler = flow.handler().clone();
                return Some(self.escalate_to_handler(
                    node,
                    handler,
                    escalation,
                    EscalationLevel::Process,
                ));
            }
        }
        self.escalate_to_office(node, escalation)
    }

    /// Runs `handler` with the escalation as argument before `node` finishes.
    fn escalate_to_handler(
        &mut self,
        node: NodeKey,
        handler: Arc<FunctionDescriptor>,
        escalation: Escalation,
        level: EscalationLevel,
    ) -> NodeKey {
        debug!(thread = %self.thread.id(), %level, handler = %handler.name(), "escalation handled");
        let graph = &mut self.inner.graph;
        let avoid_team = graph.node(node).avoid_team.clone();
        let flow = graph.create_flow(
            FlowKind::Escalation {
                escalation: escalation.clone(),
                level,
            },
            None,
            Some(level),
        );
        let argument: Box<dyn Any + Send> = Box::new(escalation);
        let handler = graph.add_function(flow, handler, Some(argument));
        graph.node_mut(handler).avoid_team = avoid_team;
        graph.load_parallel(node, handler);
        graph.furthest_parallel(node)
    }

    /// Hands an unhandled escalation to the office catch-all and cancels the
    /// process.
    fn escalate_to_office(&mut self, node: NodeKey, escalation: Escalation) -> Option<NodeKey> {
        let process = self.thread.process();
        error!(
            process = %process.id(),
            thread = %self.thread.id(),
            %escalation,
            "unhandled escalation"
        );
        process.record_escalation(&escalation);
        let catch_all = self.office().catch_all().clone();
        let id = process.id();
        defer(move || {
            catch_all(&escalation, id);
            escalation.notify_completion();
        });
        process.cancel();
        if self.inner.graph.has_cancellable_flows() {
            return self.cancel_flows();
        }
        self.finish_failed(node)
    }

    fn activate_governance(&mut self, index: usize) {
        self.inner.governance[index].activate();
    }

    fn transit_governance(&mut self, index: usize, strategy: GovernanceDeactivationStrategy) {
        let governance = &mut self.inner.governance[index];
        let result = match strategy {
            GovernanceDeactivationStrategy::Enforce => governance.enforce(),
            GovernanceDeactivationStrategy::Disregard => governance.disregard(),
        };
        if let Err(escalation) = result {
            self.thread
                .process()
                .record_cleanup_escalation(governance.name().clone(), escalation);
        }
    }

    fn deactivate_governance(&mut self, index: usize) {
        let process = self.thread.process();
        for (source, escalation) in self.inner.governance[index].deactivate() {
            process.record_cleanup_escalation(source, escalation);
        }
        let thread = self.thread.id();
        let forget = |container: &mut ManagedObjectContainer| {
            container.remove_registrations(thread, index);
        };
        self.inner
            .graph
            .for_each_function(|function| function.objects.iter_mut().for_each(forget));
        self.inner.objects.iter_mut().for_each(forget);
        process.lock().objects.iter_mut().for_each(forget);
    }
}

fn activate(index: usize) -> Operation {
    Box::new(move |step: &mut Step<'_>| step.activate_governance(index))
}

fn transit(index: usize, strategy: GovernanceDeactivationStrategy) -> Operation {
    Box::new(move |step: &mut Step<'_>| step.transit_governance(index, strategy))
}

fn deactivate(index: usize) -> Operation {
    Box::new(move |step: &mut Step<'_>| step.deactivate_governance(index))
}

fn object_at(
    objects: &mut [ManagedObjectContainer],
    index: ObjectIndex,
) -> Result<&mut ManagedObjectContainer, Escalation> {
    objects
        .get_mut(index.index)
        .ok_or_else(|| KernelError::UnknownObject { index }.into())
}

/// Registers the object with every active governance it has an extension for
/// and is not yet registered with.
fn enlist(
    thread: ThreadId,
    container: &mut ManagedObjectContainer,
    governance: &mut [GovernanceContainer],
) -> Result<(), Escalation> {
    for (index, governance) in governance.iter_mut().enumerate() {
        if !governance.is_active() || container.is_governed_by(thread, index) {
            continue;
        }
        let Some(extension) = container.extract_extension(index) else {
            continue;
        };
        let id = governance.register(container.bound_name().clone(), extension)?;
        trace!(
            %thread,
            governance = %governance.name(),
            bound_name = %container.bound_name(),
            %id,
            "object governed"
        );
        container.add_registration(Registration {
            thread,
            governance: index,
            id,
        });
    }
    Ok(())
}

/// Borrows the objects at `wanted` across the three scopes, in `wanted`
/// order.
fn gather<'o>(
    scopes: [(ObjectScope, &'o mut [ManagedObjectContainer]); 3],
    wanted: &[ObjectIndex],
) -> Result<Vec<(Arc<str>, &'o mut dyn Any)>, Escalation> {
    let mut slots: Vec<Option<(Arc<str>, &'o mut dyn Any)>> = wanted.iter().map(|_| None).collect();
    for (scope, containers) in scopes {
        for (index, container) in containers.iter_mut().enumerate() {
            let Some(slot) = wanted
                .iter()
                .position(|&object| object == ObjectIndex { scope, index })
            else {
                continue;
            };
            let bound_name = container.bound_name().clone();
            slots[slot] = Some((bound_name, container.object_any()?));
        }
    }
    slots
        .into_iter()
        .zip(wanted)
        .map(|(slot, &index)| slot.ok_or_else(|| KernelError::UnknownObject { index }.into()))
        .collect()
}
