use crate::{
    asset::LatchedWork,
    error::Escalation,
    executor::{Attachment, defer, drain},
    graph::NodeKey,
    team::Team,
    thread::{Step, ThreadState},
};
use std::sync::Arc;
use tracing::trace;

/// Why a thread state is being run.
#[derive(Debug)]
pub(crate) enum Resume {
    /// Run from the node.
    Node(NodeKey),
    /// The node's latch failed; escalate from the node.
    Failed(NodeKey, Escalation),
    /// The process was cancelled; cancel the thread's flows.
    Cancel,
}

/// Assigns a run of `thread` to `team` once the caller detached.
pub(crate) fn dispatch(thread: Arc<ThreadState>, resume: Resume, team: Arc<dyn Team>) {
    defer(move || team.assign_job(Box::new(move || run(thread, resume))));
}

/// Attaches to `thread` and runs its nodes until the path blocks, hands off to
/// another team or the thread completes.
pub(crate) fn run(thread: Arc<ThreadState>, resume: Resume) {
    {
        let _attachment = Attachment::enter(&thread);
        let mut inner = thread.lock();
        let mut step = Step::new(&thread, &mut inner);
        let mut next = step.resume(resume);
        let mut chain = 0usize;
        while let Some(node) = next {
            if step.is_cancelled() && step.graph().has_cancellable_flows() {
                next = step.cancel_flows();
                continue;
            }
            if let Some(team) = handoff(&step, node, chain) {
                trace!(thread = %thread.id(), team = %team.name(), chain, "handing off");
                dispatch(thread.clone(), Resume::Node(node), team);
                break;
            }
            next = step.execute(node);
            chain += 1;
        }
    }
    drain();
}

/// Team that must continue at `node` instead of the calling worker, if any.
fn handoff(step: &Step<'_>, node: NodeKey, chain: usize) -> Option<Arc<dyn Team>> {
    let office = step.office();
    let teams = office.teams();
    let record = step.graph().node(node);
    let responsible = record.team.as_ref().map(|name| teams.resolve(Some(name)));
    match responsible {
        Some(team) if !team.is_current() => return Some(team.clone()),
        Some(_) => {}
        // Work entering the office from a foreign thread.
        None if chain == 0 && !teams.any_current() => return Some(teams.default_team().clone()),
        None => {}
    }
    // A responsible team outranks a team the predecessor asked to avoid.
    let avoid = record
        .avoid_team
        .as_ref()
        .filter(|avoid| responsible.map_or(true, |team| team.name() != *avoid));
    if let Some(avoid) = avoid {
        if teams.get(avoid).is_some_and(|team| team.is_current()) {
            let alternative = [teams.break_chain_team(), teams.default_team()]
                .into_iter()
                .find(|team| team.name() != avoid);
            if let Some(team) = alternative {
                return Some(team.clone());
            }
        }
    }
    if chain >= office.config().max_chain_length {
        return Some(teams.break_chain_team().clone());
    }
    None
}

/// Latched waiter continuing one node of one thread state.
pub(crate) struct Continuation {
    thread: Arc<ThreadState>,
    node: NodeKey,
}

impl Continuation {
    pub(crate) fn boxed(thread: Arc<ThreadState>, node: NodeKey) -> Box<dyn LatchedWork> {
        Box::new(Self { thread, node })
    }
}

impl LatchedWork for Continuation {
    fn resume(self: Box<Self>) {
        let Self { thread, node } = *self;
        defer(move || run(thread, Resume::Node(node)));
    }

    fn fail(self: Box<Self>, escalation: Escalation) {
        let Self { thread, node } = *self;
        defer(move || run(thread, Resume::Failed(node, escalation)));
    }
}
