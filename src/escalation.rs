//! Typed escalation-to-handler mapping.
//!
//! A failing node's escalation is resolved by the nearest procedure that has a
//! matching entry, walking outwards:
//!
//! 1. the function's own [`EscalationProcedure`],
//! 2. the completion callback of the node's flow, if the flow has one,
//! 3. the thread's procedure (or the spawning flow's callback for spawned
//!    threads),
//! 4. the process procedure,
//! 5. the office catch-all, which also cancels the process.
//!
//! Within a procedure the first matching entry wins, so entries are listed
//! most specific first.

use crate::{error::Escalation, function::FunctionDescriptor};
use core::{
    any::type_name,
    fmt::{self, Debug},
};
use derive_more::Display;
use std::{error::Error, sync::Arc};

/// Level at which an escalation was resolved.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationLevel {
    /// The failing function's procedure.
    #[display("function")]
    Function,
    /// The completion callback of the failing node's flow.
    #[display("flow")]
    Flow,
    /// The thread's procedure or the spawning flow's callback.
    #[display("thread")]
    Thread,
    /// The process procedure.
    #[display("process")]
    Process,
    /// The office catch-all.
    #[display("office")]
    Office,
}

/// One entry of an [`EscalationProcedure`]: a type test and the function
/// handling matching escalations. The handler receives the [`Escalation`] as
/// its argument.
#[derive(Clone)]
pub struct EscalationFlow {
    type_name: &'static str,
    matches: fn(&Escalation) -> bool,
    handler: Arc<FunctionDescriptor>,
}

impl EscalationFlow {
    /// Handles escalations whose cause is an `E`.
    #[must_use]
    pub fn of<E: Error + 'static>(handler: Arc<FunctionDescriptor>) -> Self {
        Self {
            type_name: type_name::<E>(),
            matches: Escalation::is::<E>,
            handler,
        }
    }

    /// Handles every escalation.
    #[must_use]
    pub fn any(handler: Arc<FunctionDescriptor>) -> Self {
        Self {
            type_name: "*",
            matches: |_| true,
            handler,
        }
    }

    /// Name of the matched type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The handling function.
    #[must_use]
    pub fn handler(&self) -> &Arc<FunctionDescriptor> {
        &self.handler
    }

    fn matches(&self, escalation: &Escalation) -> bool {
        (self.matches)(escalation)
    }
}

impl Debug for EscalationFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationFlow")
            .field("type_name", &self.type_name)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Ordered escalation entries of a function, thread or process.
#[derive(Debug, Clone, Default)]
pub struct EscalationProcedure {
    flows: Vec<EscalationFlow>,
}

impl EscalationProcedure {
    /// Procedure without entries.
    #[must_use]
    pub const fn new() -> Self {
        Self { flows: Vec::new() }
    }

    /// Appends an entry.
    #[must_use]
    pub fn with(mut self, flow: EscalationFlow) -> Self {
        self.flows.push(flow);
        self
    }

    /// Whether the procedure has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// First entry matching `escalation`.
    #[must_use]
    pub fn escalation_flow(&self, escalation: &Escalation) -> Option<&EscalationFlow> {
        self.flows.iter().find(|flow| flow.matches(escalation))
    }
}

/// Last-resort handling of escalations no procedure matched.
pub type CatchAll = Arc<dyn Fn(&Escalation, crate::types::ProcessId) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::KernelError, function::FunctionDescriptor};

    #[derive(Debug, thiserror::Error)]
    #[error("io")]
    struct IoFailure;

    fn handler(name: &str) -> Arc<FunctionDescriptor> {
        FunctionDescriptor::builder(name, |_| Ok(())).build()
    }

    #[test]
    fn first_matching_entry_wins() {
        let procedure = EscalationProcedure::new()
            .with(EscalationFlow::of::<IoFailure>(handler("io")))
            .with(EscalationFlow::of::<KernelError>(handler("kernel")))
            .with(EscalationFlow::any(handler("any")));

        let io = Escalation::new(IoFailure);
        assert_eq!(&**procedure.escalation_flow(&io).unwrap().handler().name(), "io");

        let other = Escalation::msg("other");
        let flow = procedure.escalation_flow(&other).unwrap();
        assert_eq!(flow.type_name(), "*");
        assert_eq!(&**flow.handler().name(), "any");
    }

    #[test]
    fn empty_procedure_matches_nothing() {
        assert!(EscalationProcedure::new()
            .escalation_flow(&Escalation::msg("x"))
            .is_none());
    }
}
