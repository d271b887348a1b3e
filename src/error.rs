//! Escalations and the kernel's own error conditions.
//!
//! An [`Escalation`] is what flows through the kernel whenever a unit of work
//! fails: user logic returns one (any `std::error::Error` converts into it via
//! `?`), resource sourcing produces one, the heartbeat raises one on timeout.
//! The kernel's own conditions are the variants of [`KernelError`].

use crate::{object::ObjectIndex, types::ProcessId};
use core::{
    any::type_name,
    fmt::{self, Debug, Display},
};
use parking_lot::Mutex;
use std::{error::Error, sync::Arc};
use thiserror::Error;

/// Conditions raised by the kernel itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KernelError {
    /// A managed object was not sourced before its sourcing timeout.
    #[error("managed object `{bound_name}` timed out while being sourced")]
    SourceTimedOut {
        /// Bound name of the managed object.
        bound_name: Arc<str>,
    },
    /// A managed object arrived after the scope that requested it ended.
    #[error("managed object `{bound_name}` arrived after its scope ended")]
    SourceAbandoned {
        /// Bound name of the managed object.
        bound_name: Arc<str>,
    },
    /// An asynchronous managed object did not become ready before its timeout.
    #[error("managed object `{bound_name}` timed out waiting to become ready")]
    ReadinessTimedOut {
        /// Bound name of the managed object.
        bound_name: Arc<str>,
    },
    /// An asynchronous operation of a function did not complete before its timeout.
    #[error("asynchronous operation of `{function}` timed out")]
    AsynchronousOperationTimedOut {
        /// Name of the function that started the operation.
        function: Arc<str>,
    },
    /// The function does not have the requested object bound.
    #[error("no managed object bound at {index:?}")]
    UnknownObject {
        /// Requested index.
        index: ObjectIndex,
    },
    /// The managed object exists but is not of the requested type.
    #[error("managed object `{bound_name}` is not a `{expected}`")]
    ObjectType {
        /// Bound name of the managed object.
        bound_name: Arc<str>,
        /// Requested type.
        expected: &'static str,
    },
    /// The managed object has not been loaded for the function.
    #[error("managed object `{bound_name}` is not loaded")]
    ObjectNotLoaded {
        /// Bound name of the managed object.
        bound_name: Arc<str>,
    },
    /// The function has no flow at the requested index.
    #[error("`{function}` has no flow at index {index}")]
    UnknownFlow {
        /// Name of the function.
        function: Arc<str>,
        /// Requested flow index.
        index: usize,
    },
    /// An extension value did not have the type the governance expects.
    #[error("extension for governance `{governance}` is not a `{expected}`")]
    ExtensionType {
        /// Name of the governance.
        governance: Arc<str>,
        /// Expected extension type.
        expected: &'static str,
    },
    /// Managed object dependencies of a function form a cycle.
    #[error("managed object dependencies of `{function}` contain cycle(s)")]
    DependencyCycle {
        /// Name of the function whose objects could not be ordered.
        function: Arc<str>,
    },
    /// The process was cancelled.
    #[error("{process} was cancelled")]
    ProcessCancelled {
        /// The cancelled process.
        process: ProcessId,
    },
}

/// Errors detected while assembling an office.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum OfficeSetupError {
    /// No team was registered.
    #[error("office requires at least one team")]
    NoTeams,
    /// Two teams were registered under one name.
    #[error("team `{0}` is registered more than once")]
    DuplicateTeam(Arc<str>),
    /// A team name is referenced but not registered.
    #[error("team `{0}` is not registered")]
    UnknownTeam(Arc<str>),
    /// An object dependency points outside the configured objects.
    #[error("managed object `{bound_name}` depends on unknown {index:?}")]
    UnknownDependency {
        /// Bound name of the dependent object.
        bound_name: Arc<str>,
        /// The unresolved index.
        index: ObjectIndex,
    },
    /// Managed objects of the process or thread depend on each other cyclically.
    #[error("managed object dependencies contain cycle(s)")]
    DependencyCycle,
}

/// Notified once the handling of an escalation has fully settled.
pub trait EscalationCompletion: Send + 'static {
    /// Called exactly once.
    fn escalation_complete(self: Box<Self>);
}

impl<F> EscalationCompletion for F
where
    F: FnOnce() + Send + 'static,
{
    fn escalation_complete(self: Box<Self>) {
        (*self)();
    }
}

struct CompletionSlot(Mutex<Option<Box<dyn EscalationCompletion>>>);

/// A failure propagated through the kernel and resolved to a handler.
///
/// Clones share the cause and the completion notifier, so however many clones
/// exist the notifier fires at most once.
#[derive(Clone)]
pub struct Escalation {
    cause: Arc<dyn Error + Send + Sync + 'static>,
    completion: Option<Arc<CompletionSlot>>,
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

impl Escalation {
    /// Wraps an error.
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            cause: Arc::new(error),
            completion: None,
        }
    }

    /// Escalation carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Attaches a notifier fired once the escalation's handling has settled.
    #[must_use]
    pub fn with_completion(mut self, completion: impl EscalationCompletion) -> Self {
        self.completion = Some(Arc::new(CompletionSlot(Mutex::new(Some(Box::new(completion))))));
        self
    }

    /// Whether the cause is an `E`.
    #[must_use]
    pub fn is<E: Error + 'static>(&self) -> bool {
        self.cause.is::<E>()
    }

    /// The cause as an `E`, if it is one.
    #[must_use]
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.cause.downcast_ref::<E>()
    }

    /// The cause as a [`KernelError`], if the kernel raised it.
    #[must_use]
    pub fn kernel_error(&self) -> Option<&KernelError> {
        self.downcast_ref::<KernelError>()
    }

    /// The underlying error.
    #[must_use]
    pub fn cause(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.cause
    }

    /// Whether a completion notifier is attached and has not fired yet.
    #[must_use]
    pub fn has_pending_completion(&self) -> bool {
        self.completion
            .as_ref()
            .is_some_and(|slot| slot.0.lock().is_some())
    }

    pub(crate) fn notify_completion(&self) {
        let Some(slot) = &self.completion else {
            return;
        };
        let completion = slot.0.lock().take();
        if let Some(completion) = completion {
            completion.escalation_complete();
        }
    }
}

impl<E> From<E> for Escalation
where
    E: Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl Debug for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("cause", &self.cause)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

impl Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.cause, f)
    }
}

/// A failure collected while cleaning up, reported instead of thrown.
#[derive(Debug, Clone)]
pub struct CleanupEscalation {
    /// What was being cleaned up: a managed object's bound name or a
    /// governance name.
    pub source: Arc<str>,
    /// The failure.
    pub escalation: Escalation,
}
