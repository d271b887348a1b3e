//! Cross-cutting coordination over the managed objects of one thread.
//!
//! A governance is enlisted with the extensions of the objects loaded while it
//! is active, and is then either enforced (commit-like) or disregarded
//! (rollback-like) before being deactivated. Deactivation always unregisters
//! every registration, even after a failed enforcement.

use crate::{
    error::{Escalation, KernelError},
    types::IndexMap,
};
use core::{
    any::{Any, type_name},
    fmt::{self, Debug},
    marker::PhantomData,
};
use derive_more::Display;
use std::sync::Arc;

/// Identifies one registration within one activation of a governance.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("registration-{_0}")]
pub struct RegistrationId(u64);

impl RegistrationId {
    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// User-supplied governance over extensions of type `E`.
pub trait Governance<E>: Send + 'static {
    /// Enlists an object's extension.
    ///
    /// # Errors
    /// Escalated to the function whose object load triggered the registration.
    fn register_governed(&mut self, id: RegistrationId, extension: E) -> Result<(), Escalation>;

    /// Removes one registration. Failures are reported as cleanup escalations.
    ///
    /// # Errors
    /// If the registration cannot be released cleanly.
    fn unregister_governed(&mut self, id: RegistrationId) -> Result<(), Escalation> {
        let _ = id;
        Ok(())
    }

    /// Applies the governance (commit-like).
    ///
    /// # Errors
    /// Reported as a cleanup escalation; deactivation still follows.
    fn enforce(&mut self) -> Result<(), Escalation>;

    /// Abandons the governance (rollback-like).
    ///
    /// # Errors
    /// Reported as a cleanup escalation; deactivation still follows.
    fn disregard(&mut self) -> Result<(), Escalation>;
}

/// Type-erased governance activity.
trait GovernanceActivity: Send {
    fn register(
        &mut self,
        id: RegistrationId,
        extension: Box<dyn Any + Send>,
    ) -> Result<(), Escalation>;
    fn unregister(&mut self, id: RegistrationId) -> Result<(), Escalation>;
    fn enforce(&mut self) -> Result<(), Escalation>;
    fn disregard(&mut self) -> Result<(), Escalation>;
}

struct TypedActivity<E, G> {
    name: Arc<str>,
    governance: G,
    _extension: PhantomData<fn(E)>,
}

impl<E, G> GovernanceActivity for TypedActivity<E, G>
where
    E: Any + Send,
    G: Governance<E>,
{
    fn register(
        &mut self,
        id: RegistrationId,
        extension: Box<dyn Any + Send>,
    ) -> Result<(), Escalation> {
        let extension = extension.downcast::<E>().map_err(|_| KernelError::ExtensionType {
            governance: self.name.clone(),
            expected: type_name::<E>(),
        })?;
        self.governance.register_governed(id, *extension)
    }

    fn unregister(&mut self, id: RegistrationId) -> Result<(), Escalation> {
        self.governance.unregister_governed(id)
    }

    fn enforce(&mut self) -> Result<(), Escalation> {
        self.governance.enforce()
    }

    fn disregard(&mut self) -> Result<(), Escalation> {
        self.governance.disregard()
    }
}

type ActivityFactory = dyn Fn(&Arc<str>) -> Box<dyn GovernanceActivity> + Send + Sync;

/// Immutable description of a governance: its name, extension type and the
/// factory creating a fresh activity on each activation.
#[derive(Clone)]
pub struct GovernanceDescriptor {
    name: Arc<str>,
    extension_type: &'static str,
    factory: Arc<ActivityFactory>,
}

impl Debug for GovernanceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceDescriptor")
            .field("name", &self.name)
            .field("extension_type", &self.extension_type)
            .finish_non_exhaustive()
    }
}

impl GovernanceDescriptor {
    /// Governance over extensions of type `E`, activated by `factory`.
    pub fn new<E, G, F>(name: impl Into<Arc<str>>, factory: F) -> Self
    where
        E: Any + Send,
        G: Governance<E>,
        F: Fn() -> G + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            extension_type: type_name::<E>(),
            factory: Arc::new(move |name: &Arc<str>| {
                Box::new(TypedActivity {
                    name: name.clone(),
                    governance: factory(),
                    _extension: PhantomData::<fn(E)>,
                }) as Box<dyn GovernanceActivity>
            }),
        }
    }

    /// Name of the governance.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Name of the extension type.
    #[must_use]
    pub const fn extension_type(&self) -> &'static str {
        self.extension_type
    }
}

/// State of one governance slot of a thread.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum GovernanceState {
    /// No activity exists.
    #[display("inactive")]
    Inactive,
    /// The activity is being created.
    #[display("activating")]
    Activating,
    /// Objects may register.
    #[display("active")]
    Active,
    /// The activity is being enforced.
    #[display("enforcing")]
    Enforcing,
    /// The activity is being disregarded.
    #[display("disregarding")]
    Disregarding,
    /// Registrations are being released.
    #[display("deactivating")]
    Deactivating,
}

/// One governance slot of a thread.
pub(crate) struct GovernanceContainer {
    descriptor: Arc<GovernanceDescriptor>,
    state: GovernanceState,
    activity: Option<Box<dyn GovernanceActivity>>,
    registrations: IndexMap<RegistrationId, Arc<str>>,
    next_registration: u64,
}

impl Debug for GovernanceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceContainer")
            .field("name", &self.descriptor.name)
            .field("state", &self.state)
            .field("registrations", &self.registrations.len())
            .finish_non_exhaustive()
    }
}

impl GovernanceContainer {
    pub(crate) fn new(descriptor: Arc<GovernanceDescriptor>) -> Self {
        Self {
            descriptor,
            state: GovernanceState::Inactive,
            activity: None,
            registrations: IndexMap::default(),
            next_registration: 0,
        }
    }

    pub(crate) fn name(&self) -> &Arc<str> {
        &self.descriptor.name
    }

    pub(crate) const fn state(&self) -> GovernanceState {
        self.state
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state, GovernanceState::Activating | GovernanceState::Active)
    }

    #[cfg(test)]
    pub(crate) fn registrations(&self) -> usize {
        self.registrations.len()
    }

    pub(crate) fn activate(&mut self) {
        assert_eq!(
            self.state,
            GovernanceState::Inactive,
            "governance `{}` activated twice",
            self.descriptor.name
        );
        self.state = GovernanceState::Activating;
        self.activity = Some((self.descriptor.factory)(&self.descriptor.name));
        self.state = GovernanceState::Active;
        tracing::trace!(governance = %self.descriptor.name, "governance activated");
    }

    /// Enlists `extension` of the object bound as `bound_name`.
    ///
    /// # Panics
    /// If the governance is not active.
    pub(crate) fn register(
        &mut self,
        bound_name: Arc<str>,
        extension: Box<dyn Any + Send>,
    ) -> Result<RegistrationId, Escalation> {
        assert!(
            self.is_active(),
            "registration with governance `{}` outside its active period ({})",
            self.descriptor.name,
            self.state
        );
        let id = RegistrationId(self.next_registration);
        self.next_registration += 1;
        self.activity
            .as_mut()
            .expect("GovernanceContainer::register: [1]")
            .register(id, extension)?;
        self.registrations.insert(id, bound_name);
        Ok(id)
    }

    /// Removes one registration, if still present.
    pub(crate) fn unregister(&mut self, id: RegistrationId) -> Result<(), Escalation> {
        if self.registrations.shift_remove(&id).is_none() {
            return Ok(());
        }
        match &mut self.activity {
            Some(activity) => activity.unregister(id),
            None => Ok(()),
        }
    }

    pub(crate) fn enforce(&mut self) -> Result<(), Escalation> {
        self.transit(GovernanceState::Enforcing, |activity| activity.enforce())
    }

    pub(crate) fn disregard(&mut self) -> Result<(), Escalation> {
        self.transit(GovernanceState::Disregarding, |activity| activity.disregard())
    }

    fn transit(
        &mut self,
        state: GovernanceState,
        apply: impl FnOnce(&mut dyn GovernanceActivity) -> Result<(), Escalation>,
    ) -> Result<(), Escalation> {
        if !self.is_active() {
            return Ok(());
        }
        self.state = state;
        let activity = self.activity.as_mut().expect("GovernanceContainer::transit: [1]");
        apply(activity.as_mut())
    }

    /// Unregisters everything and drops the activity. Returns the failures of
    /// individual unregistrations.
    pub(crate) fn deactivate(&mut self) -> Vec<(Arc<str>, Escalation)> {
        if self.state == GovernanceState::Inactive {
            return Vec::new();
        }
        self.state = GovernanceState::Deactivating;
        let mut failures = Vec::new();
        let registrations = core::mem::take(&mut self.registrations);
        if let Some(activity) = &mut self.activity {
            for (id, bound_name) in registrations {
                if let Err(escalation) = activity.unregister(id) {
                    failures.push((bound_name, escalation));
                }
            }
        }
        self.activity = None;
        self.state = GovernanceState::Inactive;
        tracing::trace!(
            governance = %self.descriptor.name,
            failures = failures.len(),
            "governance deactivated"
        );
        failures
    }
}
