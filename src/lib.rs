//! Cooperative execution kernel multiplexing logical processes and threads
//! over a small set of worker teams.
//!
//! Work is expressed as functions arranged into flows. An invoked function
//! runs inside a *process*, which owns one or more *thread states*; each
//! thread state owns a graph of pending nodes executed one at a time by
//! whichever worker is attached to it. Workers never block on the kernel:
//! a node waiting on a managed object, an asynchronous operation or the
//! readiness of an object is latched on an asset monitor and resumed as a
//! continuation once the asset is released or fails.
//!
//! Key modules:
//! - `office`: the root object assembling teams, object descriptors,
//!   governance and escalation procedures; entry point
//!   [`Office::invoke_process`].
//! - `function`: function descriptors, flows and the [`FunctionContext`]
//!   seen by user logic.
//! - `object`: managed objects, their sources and pools, and the container
//!   driving their lifecycle.
//! - `governance`: transactional activity over registered objects.
//! - `asset`: the wait-with-timeout primitive every latch is built on.
//! - `team`: worker teams the dispatcher assigns continuations to.
//!
//! Failures travel as [`Escalation`]s. They are resolved to the nearest
//! handler: the function's escalation procedure, the flow's callback, the
//! thread and process procedures, and finally the office catch-all, which
//! also cancels the process.

/// Assets, asset monitors and the managers checking them on a heartbeat.
///
/// Every suspension in the kernel latches a continuation on an
/// [`AssetMonitor`](asset::AssetMonitor); the monitor resumes or fails each
/// latched continuation exactly once.
pub mod asset;
/// Office tunables.
pub mod config;
/// Kernel errors and the escalation type propagated through flows.
pub mod error;
/// Escalation procedures mapping escalation types to handler functions.
pub mod escalation;
mod executor;
/// Function descriptors, flows and the context user logic runs in.
pub mod function;
/// Governance over managed objects.
///
/// A governance is activated per thread state, collects the objects that
/// provide its extension and is enforced or disregarded on deactivation.
pub mod governance;
mod graph;
mod list;
/// Managed objects, their sources and pools.
pub mod object;
/// The office and its builder.
pub mod office;
/// Processes and their cleanup of unloaded objects.
pub mod process;
mod sync;
/// Worker teams.
pub mod team;
/// Thread states, the unit of mutual exclusion for execution.
pub mod thread;
/// Identifiers and common aliases.
pub mod types;

pub use asset::{Asset, AssetManager, Clock, ManualClock, SystemClock};
pub use config::{GovernanceDeactivationStrategy, OfficeConfig};
pub use error::{CleanupEscalation, Escalation, KernelError, OfficeSetupError};
pub use escalation::{EscalationFlow, EscalationLevel, EscalationProcedure};
pub use function::{
    AsynchronousFlow, FlowDescriptor, FlowOutcome, FunctionContext, FunctionDescriptor,
};
pub use governance::{Governance, GovernanceDescriptor, GovernanceState};
pub use object::{
    ManagedObject, ManagedObjectDescriptor, ManagedObjectSource, ManagedObjectUser, ObjectIndex,
    ValueObject,
};
pub use office::{Office, OfficeBuilder};
pub use process::{ProcessCompletion, ProcessHandle};
pub use team::{PassiveTeam, QueuedTeam, RayonTeam, Team};
pub use types::{ProcessId, ThreadId};
