//! Execution node graph and flows of one thread state.
//!
//! Nodes form a tree through three links: the *parallel owner* (the node
//! waiting for this one), the *parallel node* (the branch this node waits
//! for) and the *sequential node* (the successor run once this node and its
//! whole parallel branch completed). Every node belongs to exactly one flow,
//! and every live flow belongs to the thread's set of active flows.
//!
//! The next node to run after a completion is found without recursion:
//! 1. a sequential successor takes the completed node's place under its
//!    parallel owner and runs next;
//! 2. otherwise the parallel owner runs again;
//! 3. whichever node is chosen, its furthest parallel branch runs first.

use crate::{
    error::Escalation,
    escalation::EscalationLevel,
    function::{FlowCallback, FunctionDescriptor, FunctionNode},
    list::{ArenaIndex, LinkedArena, OwnershipList},
    thread::Step,
    types::{Argument, TeamName},
};
use core::fmt::{self, Debug};
use std::sync::Arc;

/// Key of a node within its thread's graph.
pub(crate) type NodeKey = ArenaIndex;
/// Key of a flow within its thread's graph.
pub(crate) type FlowKey = ArenaIndex;

/// Internal kernel step run as a node.
pub(crate) type Operation = Box<dyn FnOnce(&mut Step<'_>) + Send>;

pub(crate) enum NodeWork {
    Function(Box<FunctionNode>),
    Operation(Operation),
    /// Taken out while running.
    Executing,
}

impl Debug for NodeWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(function) => Debug::fmt(function, f),
            Self::Operation(_) => f.write_str("Operation"),
            Self::Executing => f.write_str("Executing"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct NodeRecord {
    pub(crate) flow: FlowKey,
    parallel_owner: Option<NodeKey>,
    parallel_node: Option<NodeKey>,
    sequential_node: Option<NodeKey>,
    pub(crate) team: Option<TeamName>,
    pub(crate) avoid_team: Option<TeamName>,
    pub(crate) work: NodeWork,
}

impl NodeRecord {
    pub(crate) const fn parallel_owner(&self) -> Option<NodeKey> {
        self.parallel_owner
    }

    pub(crate) const fn parallel_node(&self) -> Option<NodeKey> {
        self.parallel_node
    }
}

#[derive(Debug)]
pub(crate) enum FlowKind {
    /// User work.
    Work,
    /// Handler of an escalation resolved at `level`; the escalation's
    /// completion is notified once the flow drains.
    Escalation {
        escalation: Escalation,
        level: EscalationLevel,
    },
    /// Governance transitions at thread completion.
    Governance,
}

impl FlowKind {
    /// Whether cancelling the process cancels flows of this kind.
    pub(crate) const fn is_cancellable(&self) -> bool {
        !matches!(self, Self::Governance)
    }
}

pub(crate) struct FlowRecord {
    nodes: OwnershipList,
    pub(crate) kind: FlowKind,
    pub(crate) callback: Option<FlowCallback>,
    /// First escalation handed to the callback.
    pub(crate) escalation: Option<Escalation>,
    /// Lowest level escalations of this flow may resolve at (besides the
    /// function level and the office catch-all).
    pub(crate) floor: Option<EscalationLevel>,
}

impl Debug for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRecord")
            .field("nodes", &self.nodes.len())
            .field("kind", &self.kind)
            .field("callback", &self.callback.is_some())
            .field("escalation", &self.escalation)
            .finish()
    }
}

/// Result of completing a node.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) next: Option<NodeKey>,
    pub(crate) drained: Option<FlowRecord>,
}

/// Nodes and flows removed without running.
#[derive(Debug, Default)]
pub(crate) struct Removal {
    pub(crate) works: Vec<NodeWork>,
    pub(crate) drained: Vec<FlowRecord>,
}

#[derive(Debug)]
pub(crate) struct NodeGraph {
    nodes: LinkedArena<NodeRecord>,
    flows: LinkedArena<FlowRecord>,
    active_flows: OwnershipList,
}

impl Default for NodeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeGraph {
    pub(crate) fn new() -> Self {
        let mut flows = LinkedArena::new();
        let active_flows = flows.new_list();
        Self {
            nodes: LinkedArena::new(),
            flows,
            active_flows,
        }
    }

    pub(crate) fn create_flow(
        &mut self,
        kind: FlowKind,
        callback: Option<FlowCallback>,
        floor: Option<EscalationLevel>,
    ) -> FlowKey {
        let nodes = self.nodes.new_list();
        let flow = self.flows.insert(FlowRecord {
            nodes,
            kind,
            callback,
            escalation: None,
            floor,
        });
        self.flows.push_back(&mut self.active_flows, flow);
        flow
    }

    pub(crate) fn flow(&self, flow: FlowKey) -> &FlowRecord {
        self.flows.get(flow).expect("NodeGraph::flow: [1]")
    }

    pub(crate) fn flow_mut(&mut self, flow: FlowKey) -> &mut FlowRecord {
        self.flows.get_mut(flow).expect("NodeGraph::flow_mut: [1]")
    }

    pub(crate) fn has_active_flows(&self) -> bool {
        !self.active_flows.is_empty()
    }

    pub(crate) fn has_cancellable_flows(&self) -> bool {
        self.flows
            .members(&self.active_flows)
            .into_iter()
            .any(|flow| self.flow(flow).kind.is_cancellable())
    }

    /// Adds an unlinked node to `flow`.
    pub(crate) fn add_node(&mut self, flow: FlowKey, work: NodeWork) -> NodeKey {
        let node = self.nodes.insert(NodeRecord {
            flow,
            parallel_owner: None,
            parallel_node: None,
            sequential_node: None,
            team: None,
            avoid_team: None,
            work,
        });
        let record = self.flows.get_mut(flow).expect("NodeGraph::add_node: [1]");
        self.nodes.push_back(&mut record.nodes, node);
        node
    }

    /// Adds an unlinked node running `function`, assigned to the function's
    /// team.
    pub(crate) fn add_function(
        &mut self,
        flow: FlowKey,
        function: Arc<FunctionDescriptor>,
        argument: Option<Argument>,
    ) -> NodeKey {
        let team = function.team().cloned();
        let work = NodeWork::Function(Box::new(FunctionNode::new(function, argument)));
        let node = self.add_node(flow, work);
        self.node_mut(node).team = team;
        node
    }

    pub(crate) fn contains(&self, node: NodeKey) -> bool {
        self.nodes.contains(node)
    }

    pub(crate) fn node(&self, node: NodeKey) -> &NodeRecord {
        self.nodes.get(node).expect("NodeGraph::node: [1]")
    }

    pub(crate) fn node_mut(&mut self, node: NodeKey) -> &mut NodeRecord {
        self.nodes.get_mut(node).expect("NodeGraph::node_mut: [1]")
    }

    /// Makes `branch` run before `owner` resumes. An existing branch of
    /// `owner` is re-parented under `branch`, so branches run in the order
    /// they were loaded.
    pub(crate) fn load_parallel(&mut self, owner: NodeKey, branch: NodeKey) {
        let existing = self.node_mut(owner).parallel_node.replace(branch);
        let record = self.node_mut(branch);
        assert!(
            record.parallel_owner.is_none() && record.parallel_node.is_none(),
            "NodeGraph::load_parallel: node {branch:?} is already part of a tree"
        );
        record.parallel_owner = Some(owner);
        record.parallel_node = existing;
        if let Some(existing) = existing {
            self.node_mut(existing).parallel_owner = Some(branch);
        }
    }

    /// Appends `successor` at the end of the sequential chain of `node`.
    pub(crate) fn load_sequential(&mut self, node: NodeKey, successor: NodeKey) {
        let mut tail = node;
        while let Some(next) = self.node(tail).sequential_node {
            tail = next;
        }
        self.node_mut(tail).sequential_node = Some(successor);
    }

    /// Follows parallel links from `node` to the branch that must run first.
    pub(crate) fn furthest_parallel(&self, node: NodeKey) -> NodeKey {
        let mut furthest = node;
        while let Some(branch) = self.node(furthest).parallel_node {
            furthest = branch;
        }
        furthest
    }

    /// Takes the work of `node` out to run it.
    pub(crate) fn take_work(&mut self, node: NodeKey) -> NodeWork {
        core::mem::replace(&mut self.node_mut(node).work, NodeWork::Executing)
    }

    /// Puts the work of a node that has not completed back.
    pub(crate) fn restore_work(&mut self, node: NodeKey, work: NodeWork) {
        self.node_mut(node).work = work;
    }

    /// Removes a node whose parallel branch completed and determines the node
    /// to run next.
    ///
    /// # Panics
    /// If the node still has a parallel branch.
    pub(crate) fn complete(&mut self, node: NodeKey) -> (NodeWork, Completion) {
        let record = self.node(node);
        assert!(
            record.parallel_node.is_none(),
            "NodeGraph::complete: node {node:?} completed before its parallel branch"
        );
        let (owner, successor) = (record.parallel_owner, record.sequential_node);
        let next = match successor {
            Some(successor) => {
                self.node_mut(successor).parallel_owner = owner;
                if let Some(owner) = owner {
                    self.node_mut(owner).parallel_node = Some(successor);
                }
                Some(successor)
            }
            None => {
                if let Some(owner) = owner {
                    self.node_mut(owner).parallel_node = None;
                }
                owner
            }
        };
        let (work, drained) = self.detach(node);
        let next = next.map(|next| self.furthest_parallel(next));
        (work, Completion { next, drained })
    }

    /// Removes the sequential successors of `node` without running them.
    pub(crate) fn remove_successors(&mut self, node: NodeKey) -> Removal {
        let mut removal = Removal::default();
        let mut cursor = self.node_mut(node).sequential_node.take();
        while let Some(successor) = cursor {
            cursor = self.node(successor).sequential_node;
            let (work, drained) = self.detach(successor);
            removal.works.push(work);
            removal.drained.extend(drained);
        }
        removal
    }

    /// Visits the function of every node that is not executing.
    pub(crate) fn for_each_function(&mut self, mut visit: impl FnMut(&mut FunctionNode)) {
        let nodes: Vec<NodeKey> = self
            .flows
            .members(&self.active_flows)
            .into_iter()
            .flat_map(|flow| self.nodes.members(&self.flow(flow).nodes))
            .collect();
        for node in nodes {
            if let NodeWork::Function(function) = &mut self.node_mut(node).work {
                visit(function);
            }
        }
    }

    /// Removes every node of every flow whose kind matches `cancel`.
    pub(crate) fn cancel_flows(&mut self, cancel: impl Fn(&FlowKind) -> bool) -> Removal {
        let mut removal = Removal::default();
        for flow in self.flows.members(&self.active_flows) {
            if !cancel(&self.flow(flow).kind) {
                continue;
            }
            let record = self.flows.get_mut(flow).expect("NodeGraph::cancel_flows: [1]");
            while let Some(node) = self.nodes.pop_front(&mut record.nodes) {
                let node = self.nodes.remove(node).expect("NodeGraph::cancel_flows: [2]");
                removal.works.push(node.work);
            }
            self.flows.unlink(&mut self.active_flows, flow);
            removal
                .drained
                .push(self.flows.remove(flow).expect("NodeGraph::cancel_flows: [3]"));
        }
        for flow in self.flows.members(&self.active_flows) {
            for node in self.nodes.members(&self.flow(flow).nodes) {
                let live = |link: Option<NodeKey>| link.filter(|&link| self.nodes.contains(link));
                let record = self.node(node);
                let (owner, branch, successor) = (
                    live(record.parallel_owner),
                    live(record.parallel_node),
                    live(record.sequential_node),
                );
                let record = self.node_mut(node);
                record.parallel_owner = owner;
                record.parallel_node = branch;
                record.sequential_node = successor;
            }
        }
        removal
    }

    fn detach(&mut self, node: NodeKey) -> (NodeWork, Option<FlowRecord>) {
        let flow = self.node(node).flow;
        let record = self.flows.get_mut(flow).expect("NodeGraph::detach: [1]");
        let emptied = self.nodes.unlink(&mut record.nodes, node);
        let work = self.nodes.remove(node).expect("NodeGraph::detach: [2]").work;
        let drained = emptied.then(|| {
            self.flows.unlink(&mut self.active_flows, flow);
            self.flows.remove(flow).expect("NodeGraph::detach: [3]")
        });
        (work, drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation() -> NodeWork {
        NodeWork::Operation(Box::new(|_| {}))
    }

    /// Completes nodes in the order the graph hands them out, starting at the
    /// furthest branch of `root`.
    fn drain(graph: &mut NodeGraph, root: NodeKey) -> Vec<NodeKey> {
        let mut order = Vec::new();
        let mut next = Some(graph.furthest_parallel(root));
        while let Some(node) = next {
            order.push(node);
            next = graph.complete(node).1.next;
        }
        order
    }

    #[test]
    fn parallel_branches_run_in_load_order_before_owner() {
        let mut graph = NodeGraph::new();
        let flow = graph.create_flow(FlowKind::Work, None, None);
        let root = graph.add_node(flow, operation());
        let first = graph.add_node(flow, operation());
        let first_next = graph.add_node(flow, operation());
        let second = graph.add_node(flow, operation());
        graph.load_parallel(root, first);
        graph.load_sequential(first, first_next);
        graph.load_parallel(root, second);
        assert_eq!(drain(&mut graph, root), vec![first, first_next, second, root]);
        assert!(!graph.has_active_flows());
    }

    #[test]
    fn sequential_successor_waits_for_parallel_subtree() {
        let mut graph = NodeGraph::new();
        let flow = graph.create_flow(FlowKind::Work, None, None);
        let root = graph.add_node(flow, operation());
        let successor = graph.add_node(flow, operation());
        let branch = graph.add_node(flow, operation());
        let nested = graph.add_node(flow, operation());
        graph.load_sequential(root, successor);
        graph.load_parallel(root, branch);
        graph.load_parallel(branch, nested);
        assert_eq!(drain(&mut graph, root), vec![nested, branch, root, successor]);
    }

    #[test]
    fn flow_drains_with_its_last_node() {
        let mut graph = NodeGraph::new();
        let outer = graph.create_flow(FlowKind::Work, None, None);
        let inner = graph.create_flow(FlowKind::Work, None, None);
        let root = graph.add_node(outer, operation());
        let branch = graph.add_node(inner, operation());
        graph.load_parallel(root, branch);
        let (_, completion) = graph.complete(branch);
        assert_eq!(completion.next, Some(root));
        assert!(completion.drained.is_some());
        assert!(graph.has_active_flows());
        let (_, completion) = graph.complete(root);
        assert_eq!(completion.next, None);
        assert!(completion.drained.is_some());
    }

    #[test]
    fn removing_successors_leaves_node_in_place() {
        let mut graph = NodeGraph::new();
        let flow = graph.create_flow(FlowKind::Work, None, None);
        let node = graph.add_node(flow, operation());
        let a = graph.add_node(flow, operation());
        let b = graph.add_node(flow, operation());
        graph.load_sequential(node, a);
        graph.load_sequential(node, b);
        let removal = graph.remove_successors(node);
        assert_eq!(removal.works.len(), 2);
        assert!(removal.drained.is_empty());
        assert!(graph.contains(node) && !graph.contains(a) && !graph.contains(b));
        assert_eq!(graph.complete(node).1.next, None);
    }

    #[test]
    fn cancellation_spares_governance_flows() {
        let mut graph = NodeGraph::new();
        let work = graph.create_flow(FlowKind::Work, None, None);
        let governance = graph.create_flow(FlowKind::Governance, None, None);
        let root = graph.add_node(work, operation());
        let branch = graph.add_node(work, operation());
        let kept = graph.add_node(governance, operation());
        graph.load_parallel(root, branch);
        let removal = graph.cancel_flows(FlowKind::is_cancellable);
        assert_eq!(removal.works.len(), 2);
        assert_eq!(removal.drained.len(), 1);
        assert!(!graph.has_cancellable_flows());
        assert!(graph.contains(kept));
        assert_eq!(graph.complete(kept).1.next, None);
        assert!(!graph.has_active_flows());
    }

    #[test]
    #[should_panic(expected = "completed before its parallel branch")]
    fn owner_cannot_complete_before_branch() {
        let mut graph = NodeGraph::new();
        let flow = graph.create_flow(FlowKind::Work, None, None);
        let root = graph.add_node(flow, operation());
        let branch = graph.add_node(flow, operation());
        graph.load_parallel(root, branch);
        let _ = graph.complete(root);
    }
}
