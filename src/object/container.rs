use crate::{
    asset::{AssetMonitor, AwaitOutcome, LatchedWork},
    error::{Escalation, KernelError},
    executor::defer,
    governance::RegistrationId,
    object::{
        AsynchronousContext, ManagedObject, ManagedObjectDescriptor, ManagedObjectUser, Readiness,
        RecycleParameter, SourcingAsset,
    },
    office::OfficeShared,
    process::{CleanupJob, Disposal, ProcessState},
    types::ThreadId,
};
use core::{
    any::{Any, type_name},
    fmt::{self, Debug},
};
use derive_more::Display;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

/// Lifecycle state of a managed object container.
///
/// States only ever move forward. `Ready`, `AwaitingReady` and `Governed`
/// share one rank: an asynchronous object may go in and out of readiness, and
/// in and out of governance, while loaded.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum ContainerState {
    /// Nothing requested the object yet.
    #[display("unsourced")]
    Unsourced,
    /// The source was asked for the object.
    #[display("sourcing")]
    Sourcing,
    /// The object was delivered.
    #[display("sourced")]
    Sourced,
    /// The object is usable.
    #[display("ready")]
    Ready,
    /// An asynchronous operation of the object is in flight.
    #[display("awaiting-ready")]
    AwaitingReady,
    /// The object is registered with at least one governance.
    #[display("governed")]
    Governed,
    /// The object is being torn down.
    #[display("unloading")]
    Unloading,
    /// The object is gone.
    #[display("unloaded")]
    Unloaded,
}

impl ContainerState {
    /// Position in the lifecycle; never decreases.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Unsourced => 0,
            Self::Sourcing => 1,
            Self::Sourced => 2,
            Self::Ready | Self::AwaitingReady | Self::Governed => 3,
            Self::Unloading => 4,
            Self::Unloaded => 5,
        }
    }
}

/// Whether a requester may continue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Availability {
    Available,
    Latched,
}

/// A registration of the object with one governance of one thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Registration {
    pub(crate) thread: ThreadId,
    pub(crate) governance: usize,
    pub(crate) id: RegistrationId,
}

/// Outcome of unloading a container.
pub(crate) enum Unload {
    /// The object is torn down; apply the disposal.
    Done(Disposal),
    /// Interests are still held; the last release finishes the unload.
    AwaitingInterest,
}

struct PendingUnload {
    descriptor: Arc<ManagedObjectDescriptor>,
    object: Option<Box<dyn ManagedObject>>,
    process: Arc<ProcessState>,
}

#[derive(Default)]
struct InterestInner {
    holders: usize,
    pending: Option<PendingUnload>,
}

#[derive(Default)]
pub(crate) struct InterestState(Mutex<InterestInner>);

/// Keeps a managed object alive past the end of its scope.
///
/// The object is unloaded once its scope ended and every interest was
/// dropped. The owning process does not complete before that.
#[must_use = "dropping the interest releases it immediately"]
pub struct ManagedObjectInterest {
    bound_name: Arc<str>,
    state: Arc<InterestState>,
}

impl Debug for ManagedObjectInterest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectInterest")
            .field("bound_name", &self.bound_name)
            .finish_non_exhaustive()
    }
}

impl ManagedObjectInterest {
    /// Name of the object kept alive.
    #[must_use]
    pub fn bound_name(&self) -> &Arc<str> {
        &self.bound_name
    }
}

impl Drop for ManagedObjectInterest {
    fn drop(&mut self) {
        let pending = {
            let mut inner = self.state.0.lock();
            inner.holders -= 1;
            if inner.holders == 0 {
                inner.pending.take()
            } else {
                None
            }
        };
        if let Some(PendingUnload {
            descriptor,
            object,
            process,
        }) = pending
        {
            tracing::trace!(bound_name = %descriptor.bound_name(), "last interest released");
            defer(move || {
                let disposal = dispose(&descriptor, object);
                process.finish_pending_unload(disposal);
            });
        }
    }
}

/// Lifecycle of one managed object within its scope.
pub(crate) struct ManagedObjectContainer {
    descriptor: Arc<ManagedObjectDescriptor>,
    state: ContainerState,
    object: Option<Box<dyn ManagedObject>>,
    sourcing: Option<(Arc<SourcingAsset>, Arc<AssetMonitor>)>,
    readiness: Option<AsynchronousContext>,
    coordinated: bool,
    registrations: SmallVec<[Registration; 2]>,
    interest: Arc<InterestState>,
}

impl Debug for ManagedObjectContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectContainer")
            .field("bound_name", self.descriptor.bound_name())
            .field("state", &self.state)
            .field("registrations", &self.registrations)
            .finish_non_exhaustive()
    }
}

impl ManagedObjectContainer {
    pub(crate) fn new(descriptor: Arc<ManagedObjectDescriptor>) -> Self {
        Self {
            descriptor,
            state: ContainerState::Unsourced,
            object: None,
            sourcing: None,
            readiness: None,
            coordinated: false,
            registrations: SmallVec::new(),
            interest: Arc::default(),
        }
    }

    pub(crate) fn descriptor(&self) -> &Arc<ManagedObjectDescriptor> {
        &self.descriptor
    }

    pub(crate) fn bound_name(&self) -> &Arc<str> {
        self.descriptor.bound_name()
    }

    pub(crate) const fn state(&self) -> ContainerState {
        self.state
    }

    fn transition(&mut self, next: ContainerState) {
        assert!(
            next.rank() >= self.state.rank(),
            "managed object `{}` cannot move from {} back to {next}",
            self.descriptor.bound_name(),
            self.state,
        );
        self.state = next;
    }

    fn assert_accessible(&self) {
        assert!(
            self.state.rank() < ContainerState::Unloading.rank(),
            "managed object `{}` accessed after unload",
            self.descriptor.bound_name()
        );
    }

    /// Sources the object if not yet sourced. Latches the waiter produced by
    /// `work` while sourcing is outstanding.
    pub(crate) fn load<W>(
        &mut self,
        office: &OfficeShared,
        work: W,
    ) -> Result<Availability, Escalation>
    where
        W: FnOnce() -> Box<dyn LatchedWork>,
    {
        self.assert_accessible();
        match self.state {
            ContainerState::Unsourced => self.begin_sourcing(office),
            ContainerState::Sourcing => {}
            _ => return Ok(Availability::Available),
        }
        if let Some(outcome) = self.take_sourced() {
            return outcome.map(|object| self.sourced(office, object));
        }
        let monitor = self
            .sourcing
            .as_ref()
            .map(|(_, monitor)| monitor.clone())
            .expect("ManagedObjectContainer::load: [1]");
        match monitor.await_on_asset(work) {
            AwaitOutcome::Latched => Ok(Availability::Latched),
            AwaitOutcome::Failed(escalation) => Err(escalation),
            AwaitOutcome::Proceed => match self.take_sourced() {
                Some(outcome) => outcome.map(|object| self.sourced(office, object)),
                None => unreachable!("ManagedObjectContainer::load: released without an object"),
            },
        }
    }

    fn begin_sourcing(&mut self, office: &OfficeShared) {
        let manager = office.asset_manager(self.descriptor.asset_manager());
        let timeout = self
            .descriptor
            .timeout()
            .unwrap_or(office.config().default_sourcing_timeout);
        let asset = Arc::new(SourcingAsset::new(
            self.descriptor.bound_name().clone(),
            manager.time(),
            timeout,
            self.descriptor.pool().cloned(),
        ));
        let monitor = manager.create_monitor(asset.clone());
        self.sourcing = Some((asset.clone(), monitor.clone()));
        self.transition(ContainerState::Sourcing);
        tracing::trace!(bound_name = %self.descriptor.bound_name(), "sourcing managed object");
        self.descriptor
            .begin_sourcing(ManagedObjectUser::new(asset, monitor));
    }

    fn take_sourced(&self) -> Option<Result<Box<dyn ManagedObject>, Escalation>> {
        let (asset, _) = self.sourcing.as_ref()?;
        asset.take()
    }

    fn sourced(
        &mut self,
        office: &OfficeShared,
        mut object: Box<dyn ManagedObject>,
    ) -> Availability {
        self.sourcing = None;
        if let Some(asynchronous) = object.asynchronous() {
            let manager = office.asset_manager(self.descriptor.asset_manager());
            let readiness = Arc::new(Readiness::new(
                self.descriptor.bound_name().clone(),
                self.descriptor
                    .timeout()
                    .unwrap_or(office.config().default_asynchronous_timeout),
            ));
            let monitor = manager.create_monitor(readiness.clone());
            let context = AsynchronousContext::new(readiness, monitor, office.clock().clone());
            asynchronous.register_asynchronous_context(context.clone());
            self.readiness = Some(context);
        }
        self.coordinated = object.coordinating().is_none();
        self.object = Some(object);
        self.transition(ContainerState::Sourced);
        Availability::Available
    }

    /// Whether the object still needs its dependencies injected.
    pub(crate) const fn needs_coordination(&self) -> bool {
        !self.coordinated && self.object.is_some()
    }

    pub(crate) fn take_object(&mut self) -> Option<Box<dyn ManagedObject>> {
        self.assert_accessible();
        self.object.take()
    }

    pub(crate) fn restore_object(&mut self, object: Box<dyn ManagedObject>, coordinated: bool) {
        self.object = Some(object);
        self.coordinated |= coordinated;
    }

    /// Latches the waiter produced by `work` while an asynchronous operation
    /// of the object is in flight.
    pub(crate) fn check_ready<W>(&mut self, work: W) -> Result<Availability, Escalation>
    where
        W: FnOnce() -> Box<dyn LatchedWork>,
    {
        self.assert_accessible();
        let Some(context) = self.readiness.clone() else {
            self.settle();
            return Ok(Availability::Available);
        };
        if !context.is_in_progress() {
            self.settle();
            return Ok(Availability::Available);
        }
        let monitor = context.monitor().clone();
        let outcome = monitor.await_on_asset(work);
        if !context.is_in_progress() {
            // Completed between the check and the latch.
            monitor.release_functions(false);
        }
        match outcome {
            AwaitOutcome::Latched => {
                self.transition(ContainerState::AwaitingReady);
                Ok(Availability::Latched)
            }
            AwaitOutcome::Proceed => {
                self.settle();
                Ok(Availability::Available)
            }
            AwaitOutcome::Failed(escalation) => Err(escalation),
        }
    }

    fn settle(&mut self) {
        let next = if self.registrations.is_empty() {
            ContainerState::Ready
        } else {
            ContainerState::Governed
        };
        self.transition(next);
    }

    /// The loaded object.
    pub(crate) fn object_any(&mut self) -> Result<&mut dyn Any, Escalation> {
        self.assert_accessible();
        let bound_name = self.descriptor.bound_name().clone();
        let sourced = self.state.rank() >= ContainerState::Sourced.rank();
        match &mut self.object {
            Some(object) if sourced => Ok(object.object()),
            _ => Err(KernelError::ObjectNotLoaded { bound_name }.into()),
        }
    }

    /// The loaded object as a `T`.
    pub(crate) fn object_mut<T: Any>(&mut self) -> Result<&mut T, Escalation> {
        let bound_name = self.descriptor.bound_name().clone();
        self.object_any()?
            .downcast_mut::<T>()
            .ok_or_else(|| {
                KernelError::ObjectType {
                    bound_name,
                    expected: type_name::<T>(),
                }
                .into()
            })
    }

    /// Capability view of the object for the governance at `governance`, if
    /// the object declares one and is loaded.
    pub(crate) fn extract_extension(&mut self, governance: usize) -> Option<Box<dyn Any + Send>> {
        let extractor = self
            .descriptor
            .extensions()
            .iter()
            .find(|extractor| extractor.governance() == governance)?
            .clone();
        let object = self.object_any().ok()?;
        extractor.extract(object)
    }

    pub(crate) fn is_governed_by(&self, thread: ThreadId, governance: usize) -> bool {
        self.registrations.iter().any(|registration| {
            registration.thread == thread && registration.governance == governance
        })
    }

    pub(crate) fn add_registration(&mut self, registration: Registration) {
        self.assert_accessible();
        self.registrations.push(registration);
        if self.state != ContainerState::AwaitingReady
            && self.state.rank() == ContainerState::Ready.rank()
        {
            self.transition(ContainerState::Governed);
        }
    }

    /// Forgets the registrations with one governance of one thread, returning
    /// their ids.
    pub(crate) fn remove_registrations(
        &mut self,
        thread: ThreadId,
        governance: usize,
    ) -> SmallVec<[RegistrationId; 1]> {
        let mut removed = SmallVec::new();
        self.registrations.retain(|registration| {
            let matches = registration.thread == thread && registration.governance == governance;
            if matches {
                removed.push(registration.id);
            }
            !matches
        });
        if self.registrations.is_empty() && self.state == ContainerState::Governed {
            self.transition(ContainerState::Ready);
        }
        removed
    }

    /// Registrations of the object with governance of `thread`.
    pub(crate) fn registrations_of(&self, thread: ThreadId) -> SmallVec<[Registration; 2]> {
        self.registrations
            .iter()
            .filter(|registration| registration.thread == thread)
            .copied()
            .collect()
    }

    pub(crate) fn register_interest(&mut self) -> ManagedObjectInterest {
        self.assert_accessible();
        self.interest.0.lock().holders += 1;
        ManagedObjectInterest {
            bound_name: self.descriptor.bound_name().clone(),
            state: self.interest.clone(),
        }
    }

    /// Tears the object down, or hands it to the last interest holder.
    ///
    /// # Panics
    /// If the object is still registered with a governance.
    pub(crate) fn unload(mut self, process: &Arc<ProcessState>) -> Unload {
        assert!(
            self.registrations.is_empty(),
            "managed object `{}` unloaded while governed: {:?}",
            self.descriptor.bound_name(),
            self.registrations
        );
        if self.state == ContainerState::Sourcing {
            match self.take_sourced() {
                Some(Ok(object)) => self.object = Some(object),
                Some(Err(_)) => {}
                None => {
                    if let Some((asset, _)) = &self.sourcing {
                        asset.abandon();
                    }
                }
            }
        }
        self.transition(ContainerState::Unloading);
        let object = self.object.take();
        {
            let mut interest = self.interest.0.lock();
            if interest.holders > 0 {
                tracing::trace!(
                    bound_name = %self.descriptor.bound_name(),
                    holders = interest.holders,
                    "unload waits for interests"
                );
                interest.pending = Some(PendingUnload {
                    descriptor: self.descriptor.clone(),
                    object,
                    process: process.clone(),
                });
                return Unload::AwaitingInterest;
            }
        }
        self.transition(ContainerState::Unloaded);
        Unload::Done(dispose(&self.descriptor, object))
    }
}

/// Decides what becomes of an unloaded object: recycled through the cleanup
/// sequence, returned to its pool, or dropped.
fn dispose(
    descriptor: &Arc<ManagedObjectDescriptor>,
    object: Option<Box<dyn ManagedObject>>,
) -> Disposal {
    let Some(object) = object else {
        return Disposal::Nothing;
    };
    if let Some(recycle) = descriptor.recycle() {
        return Disposal::Recycle(CleanupJob {
            source: descriptor.bound_name().clone(),
            function: recycle.clone(),
            parameter: RecycleParameter::new(
                descriptor.bound_name().clone(),
                object,
                descriptor.pool().cloned(),
            ),
        });
    }
    match descriptor.pool() {
        Some(pool) => Disposal::Return(pool.clone(), object),
        None => Disposal::Nothing,
    }
}
