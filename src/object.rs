//! Managed objects: lifecycle-managed resources with possibly asynchronous
//! sourcing, readiness and teardown.
//!
//! The kernel never constructs a resource itself. A [`ManagedObjectSource`]
//! (or a [`ManagedObjectPool`]) is handed a [`ManagedObjectUser`] and delivers
//! the object through it, immediately or later from any OS thread. Functions
//! waiting for the object are latched on the sourcing asset until then.

pub(crate) mod container;
mod pool;

pub use container::{ContainerState, ManagedObjectInterest};
pub use pool::{IdlePool, RecycleParameter};

use crate::{
    asset::{Asset, AssetCheck, AssetMonitor, Clock},
    error::{Escalation, KernelError},
    function::FunctionDescriptor,
};
use core::{
    any::{Any, type_name},
    fmt::{self, Debug},
    time::Duration,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};

/// Where a managed object lives and how long it lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectScope {
    /// Bound to one function invocation; unloaded when the function completes.
    Function,
    /// Bound to a thread state; unloaded when the thread completes.
    Thread,
    /// Bound to a process; unloaded once every thread of the process completed.
    Process,
}

/// Scope and position of a managed object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIndex {
    /// Scope the index is relative to.
    pub scope: ObjectScope,
    /// Position within the scope's objects.
    pub index: usize,
}

impl ObjectIndex {
    /// Object bound to the function at `index`.
    #[must_use]
    pub const fn function(index: usize) -> Self {
        Self {
            scope: ObjectScope::Function,
            index,
        }
    }

    /// Object bound to the thread at `index`.
    #[must_use]
    pub const fn thread(index: usize) -> Self {
        Self {
            scope: ObjectScope::Thread,
            index,
        }
    }

    /// Object bound to the process at `index`.
    #[must_use]
    pub const fn process(index: usize) -> Self {
        Self {
            scope: ObjectScope::Process,
            index,
        }
    }
}

/// A sourced resource.
///
/// The kernel only needs the object itself (as `Any`) plus the optional
/// capabilities.
pub trait ManagedObject: Send + 'static {
    /// The object exposed to functions.
    fn object(&mut self) -> &mut dyn Any;

    /// Readiness capability.
    fn asynchronous(&mut self) -> Option<&mut dyn AsynchronousManagedObject> {
        None
    }

    /// Dependency-injection capability.
    fn coordinating(&mut self) -> Option<&mut dyn CoordinatingManagedObject> {
        None
    }
}

/// A managed object that is only ever a plain value.
#[derive(Debug)]
pub struct ValueObject<T>(pub T);

impl<T: Any + Send> ManagedObject for ValueObject<T> {
    fn object(&mut self) -> &mut dyn Any {
        &mut self.0
    }
}

/// A managed object that may be temporarily unavailable while an
/// asynchronous operation of its own is in flight.
pub trait AsynchronousManagedObject {
    /// Called once, right after the object is sourced.
    fn register_asynchronous_context(&mut self, context: AsynchronousContext);
}

/// A managed object that needs other managed objects before use.
pub trait CoordinatingManagedObject {
    /// Called once, after every dependency is loaded. Dependencies appear in
    /// the registry in the order they are declared on the descriptor.
    ///
    /// # Errors
    /// Failures escalate to the function requiring the object.
    fn load_objects(&mut self, registry: &mut ObjectRegistry<'_>) -> Result<(), Escalation>;
}

/// Dependencies handed to a [`CoordinatingManagedObject`].
pub struct ObjectRegistry<'a> {
    dependencies: Vec<(Arc<str>, &'a mut dyn Any)>,
}

impl<'a> ObjectRegistry<'a> {
    pub(crate) fn new(dependencies: Vec<(Arc<str>, &'a mut dyn Any)>) -> Self {
        Self { dependencies }
    }

    /// Number of dependencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Whether there are no dependencies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Dependency at `position` as a `T`.
    ///
    /// # Errors
    /// If there is no such dependency or it is not a `T`.
    pub fn object<T: Any>(&mut self, position: usize) -> Result<&mut T, Escalation> {
        let Some((bound_name, object)) = self.dependencies.get_mut(position) else {
            return Err(KernelError::UnknownObject {
                index: ObjectIndex::function(position),
            }
            .into());
        };
        let bound_name = bound_name.clone();
        object.downcast_mut::<T>().ok_or_else(|| {
            KernelError::ObjectType {
                bound_name,
                expected: type_name::<T>(),
            }
            .into()
        })
    }
}

impl Debug for ObjectRegistry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.dependencies.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Delivers managed objects.
pub trait ManagedObjectSource: Send + Sync + 'static {
    /// Source one object and hand it (or a failure) to `user`, now or later.
    fn source(&self, user: ManagedObjectUser);
}

impl<F> ManagedObjectSource for F
where
    F: Fn(ManagedObjectUser) + Send + Sync + 'static,
{
    fn source(&self, user: ManagedObjectUser) {
        self(user);
    }
}

/// Pool of reusable managed objects.
pub trait ManagedObjectPool: Send + Sync + 'static {
    /// Hand an object to `user`, reusing an idle one when possible.
    fn source_managed_object(&self, user: ManagedObjectUser);
    /// Take back an object that is fit for reuse.
    fn return_managed_object(&self, object: Box<dyn ManagedObject>);
    /// The object will not come back.
    fn lost_managed_object(&self, object: Box<dyn ManagedObject>, cause: Escalation) {
        let _ = (object, cause);
    }
}

/// Capability view of a managed object extracted for one governance.
#[derive(Clone)]
pub struct ExtensionExtractor {
    governance: usize,
    extract: Arc<dyn Fn(&mut dyn Any) -> Option<Box<dyn Any + Send>> + Send + Sync>,
}

impl ExtensionExtractor {
    /// Extracts an `E` from objects of type `O` for the governance at index
    /// `governance` of the thread.
    pub fn new<O, E, F>(governance: usize, extract: F) -> Self
    where
        O: Any,
        E: Any + Send,
        F: Fn(&mut O) -> E + Send + Sync + 'static,
    {
        Self {
            governance,
            extract: Arc::new(move |object: &mut dyn Any| {
                object
                    .downcast_mut::<O>()
                    .map(|object| Box::new(extract(object)) as Box<dyn Any + Send>)
            }),
        }
    }

    /// Index of the governance the extension is for.
    #[must_use]
    pub const fn governance(&self) -> usize {
        self.governance
    }

    pub(crate) fn extract(&self, object: &mut dyn Any) -> Option<Box<dyn Any + Send>> {
        (self.extract)(object)
    }
}

impl Debug for ExtensionExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionExtractor")
            .field("governance", &self.governance)
            .finish_non_exhaustive()
    }
}

/// Immutable description of a managed object.
#[derive(derive_more::Debug)]
pub struct ManagedObjectDescriptor {
    bound_name: Arc<str>,
    #[debug(skip)]
    source: Arc<dyn ManagedObjectSource>,
    #[debug(skip)]
    pool: Option<Arc<dyn ManagedObjectPool>>,
    timeout: Option<Duration>,
    dependencies: Vec<ObjectIndex>,
    extensions: Vec<ExtensionExtractor>,
    #[debug("{:?}", recycle.as_ref().map(|function| function.name()))]
    recycle: Option<Arc<FunctionDescriptor>>,
    asset_manager: Option<Arc<str>>,
}

impl ManagedObjectDescriptor {
    /// Object bound as `bound_name`, sourced by `source`.
    pub fn new(bound_name: impl Into<Arc<str>>, source: impl ManagedObjectSource) -> Self {
        Self {
            bound_name: bound_name.into(),
            source: Arc::new(source),
            pool: None,
            timeout: None,
            dependencies: Vec::new(),
            extensions: Vec::new(),
            recycle: None,
            asset_manager: None,
        }
    }

    /// Sources through `pool` instead of the source.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn ManagedObjectPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sourcing timeout, overriding the office default.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declares a dependency handed to the object when it coordinates.
    #[must_use]
    pub fn depends_on(mut self, index: ObjectIndex) -> Self {
        self.dependencies.push(index);
        self
    }

    /// Declares an extension extracted for governance.
    #[must_use]
    pub fn with_extension(mut self, extractor: ExtensionExtractor) -> Self {
        self.extensions.push(extractor);
        self
    }

    /// Function run (in its own process) with a [`RecycleParameter`] when the
    /// object is unloaded.
    #[must_use]
    pub fn with_recycle(mut self, function: Arc<FunctionDescriptor>) -> Self {
        self.recycle = Some(function);
        self
    }

    /// Asset manager checking the sourcing and readiness timeouts.
    #[must_use]
    pub fn with_asset_manager(mut self, name: impl Into<Arc<str>>) -> Self {
        self.asset_manager = Some(name.into());
        self
    }

    /// Name the object is bound under.
    #[must_use]
    pub fn bound_name(&self) -> &Arc<str> {
        &self.bound_name
    }

    /// Declared dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[ObjectIndex] {
        &self.dependencies
    }

    /// Declared extensions.
    #[must_use]
    pub fn extensions(&self) -> &[ExtensionExtractor] {
        &self.extensions
    }

    pub(crate) fn pool(&self) -> Option<&Arc<dyn ManagedObjectPool>> {
        self.pool.as_ref()
    }

    pub(crate) fn recycle(&self) -> Option<&Arc<FunctionDescriptor>> {
        self.recycle.as_ref()
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn asset_manager(&self) -> Option<&Arc<str>> {
        self.asset_manager.as_ref()
    }

    pub(crate) fn begin_sourcing(&self, user: ManagedObjectUser) {
        match &self.pool {
            Some(pool) => pool.source_managed_object(user),
            None => self.source.source(user),
        }
    }
}

pub(crate) enum SourcingOutcome {
    Pending,
    Sourced(Box<dyn ManagedObject>),
    Taken,
    Failed(Escalation),
    /// The container unloaded before the object arrived.
    Abandoned,
}

/// Asset of one sourcing attempt.
pub(crate) struct SourcingAsset {
    bound_name: Arc<str>,
    started: Instant,
    timeout: Duration,
    pool: Option<Arc<dyn ManagedObjectPool>>,
    outcome: Mutex<SourcingOutcome>,
}

impl SourcingAsset {
    pub(crate) fn new(
        bound_name: Arc<str>,
        started: Instant,
        timeout: Duration,
        pool: Option<Arc<dyn ManagedObjectPool>>,
    ) -> Self {
        Self {
            bound_name,
            started,
            timeout,
            pool,
            outcome: Mutex::new(SourcingOutcome::Pending),
        }
    }

    /// The sourced object (once) or the sourcing failure; `None` while pending.
    pub(crate) fn take(&self) -> Option<Result<Box<dyn ManagedObject>, Escalation>> {
        let mut outcome = self.outcome.lock();
        match core::mem::replace(&mut *outcome, SourcingOutcome::Taken) {
            SourcingOutcome::Sourced(object) => Some(Ok(object)),
            SourcingOutcome::Pending => {
                *outcome = SourcingOutcome::Pending;
                None
            }
            SourcingOutcome::Failed(escalation) => {
                *outcome = SourcingOutcome::Failed(escalation.clone());
                Some(Err(escalation))
            }
            SourcingOutcome::Taken | SourcingOutcome::Abandoned => {
                unreachable!("SourcingAsset::take: object already taken")
            }
        }
    }

    /// Gives up on a pending sourcing. An object delivered afterwards is
    /// reported lost to the pool.
    pub(crate) fn abandon(&self) {
        let mut outcome = self.outcome.lock();
        if matches!(*outcome, SourcingOutcome::Pending) {
            *outcome = SourcingOutcome::Abandoned;
        }
    }

    /// Records the outcome unless sourcing already settled; hands `settled`
    /// back otherwise.
    fn settle(&self, settled: SourcingOutcome) -> Result<(), SourcingOutcome> {
        let mut outcome = self.outcome.lock();
        if matches!(*outcome, SourcingOutcome::Pending) {
            *outcome = settled;
            Ok(())
        } else {
            Err(settled)
        }
    }

    /// Disposes of an object delivered after sourcing timed out or was
    /// abandoned.
    fn late(&self, object: Box<dyn ManagedObject>) {
        let cause = match &*self.outcome.lock() {
            SourcingOutcome::Failed(escalation) => escalation.clone(),
            _ => Escalation::new(KernelError::SourceAbandoned {
                bound_name: self.bound_name.clone(),
            }),
        };
        tracing::debug!(bound_name = %self.bound_name, %cause, "managed object delivered late");
        match &self.pool {
            Some(pool) => pool.lost_managed_object(object, cause),
            None => drop(object),
        }
    }
}

impl Asset for SourcingAsset {
    fn check_on_asset(&self, check: &mut AssetCheck<'_>) {
        let timed_out = check.time() >= self.started + self.timeout;
        let escalation = {
            let mut outcome = self.outcome.lock();
            match &*outcome {
                SourcingOutcome::Pending if timed_out => {
                    let escalation = Escalation::new(KernelError::SourceTimedOut {
                        bound_name: self.bound_name.clone(),
                    });
                    *outcome = SourcingOutcome::Failed(escalation.clone());
                    Some(escalation)
                }
                SourcingOutcome::Pending => return,
                SourcingOutcome::Failed(escalation) => Some(escalation.clone()),
                SourcingOutcome::Sourced(_)
                | SourcingOutcome::Taken
                | SourcingOutcome::Abandoned => None,
            }
        };
        match escalation {
            Some(escalation) => {
                tracing::debug!(bound_name = %self.bound_name, "managed object sourcing failed");
                check.fail_functions(escalation, true);
            }
            None => {
                check.release_functions(true);
            }
        }
    }
}

/// Handed to a source or pool to deliver one managed object.
///
/// Consumed on delivery; delivering nothing lets the sourcing time out.
pub struct ManagedObjectUser {
    asset: Arc<SourcingAsset>,
    monitor: Arc<AssetMonitor>,
}

impl Debug for ManagedObjectUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectUser")
            .field("bound_name", &self.asset.bound_name)
            .finish_non_exhaustive()
    }
}

impl ManagedObjectUser {
    pub(crate) fn new(asset: Arc<SourcingAsset>, monitor: Arc<AssetMonitor>) -> Self {
        Self { asset, monitor }
    }

    /// Name of the object being sourced.
    #[must_use]
    pub fn bound_name(&self) -> &Arc<str> {
        &self.asset.bound_name
    }

    /// Delivers the object.
    pub fn set_object(self, object: impl ManagedObject) {
        self.set_boxed(Box::new(object));
    }

    /// Delivers a boxed object.
    ///
    /// An object arriving after sourcing timed out, or after its scope ended,
    /// is reported lost to the pool it came from.
    pub fn set_boxed(self, object: Box<dyn ManagedObject>) {
        match self.asset.settle(SourcingOutcome::Sourced(object)) {
            Ok(()) => {
                self.monitor.release_functions(true);
            }
            Err(SourcingOutcome::Sourced(object)) => self.asset.late(object),
            Err(_) => unreachable!("ManagedObjectUser::set_boxed: [1]"),
        }
    }

    /// Reports that sourcing failed.
    pub fn set_failure(self, escalation: impl Into<Escalation>) {
        let escalation = escalation.into();
        if self
            .asset
            .settle(SourcingOutcome::Failed(escalation.clone()))
            .is_ok()
        {
            self.monitor.fail_functions(escalation, true);
        }
    }
}

/// Readiness state of one asynchronous managed object.
pub(crate) struct Readiness {
    bound_name: Arc<str>,
    timeout: Duration,
    in_progress: Mutex<Option<Instant>>,
}

impl Readiness {
    pub(crate) fn new(bound_name: Arc<str>, timeout: Duration) -> Self {
        Self {
            bound_name,
            timeout,
            in_progress: Mutex::new(None),
        }
    }
}

impl Asset for Readiness {
    fn check_on_asset(&self, check: &mut AssetCheck<'_>) {
        let started = *self.in_progress.lock();
        match started {
            None => {
                check.release_functions(false);
            }
            Some(started) if check.time() >= started + self.timeout => {
                check.fail_functions(
                    KernelError::ReadinessTimedOut {
                        bound_name: self.bound_name.clone(),
                    }
                    .into(),
                    false,
                );
            }
            Some(_) => {}
        }
    }
}

/// Lets an asynchronous managed object flag itself busy and ready again.
#[derive(Clone)]
pub struct AsynchronousContext {
    readiness: Arc<Readiness>,
    monitor: Arc<AssetMonitor>,
    clock: Arc<dyn Clock>,
}

impl Debug for AsynchronousContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsynchronousContext")
            .field("bound_name", &self.readiness.bound_name)
            .field("in_progress", &self.is_in_progress())
            .finish()
    }
}

impl AsynchronousContext {
    pub(crate) fn new(
        readiness: Arc<Readiness>,
        monitor: Arc<AssetMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            readiness,
            monitor,
            clock,
        }
    }

    /// Flags an operation in flight; functions requiring the object wait.
    pub fn start(&self) {
        let mut in_progress = self.readiness.in_progress.lock();
        if in_progress.is_none() {
            *in_progress = Some(self.clock.now());
        }
    }

    /// Flags the operation complete and resumes waiting functions.
    pub fn complete(&self) {
        *self.readiness.in_progress.lock() = None;
        self.monitor.release_functions(false);
    }

    /// Whether an operation is in flight.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.readiness.in_progress.lock().is_some()
    }

    pub(crate) fn monitor(&self) -> &Arc<AssetMonitor> {
        &self.monitor
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn pooled_user(pool: &Arc<IdlePool>) -> (Arc<SourcingAsset>, ManagedObjectUser) {
        let asset = Arc::new(SourcingAsset::new(
            Arc::from("connection"),
            Instant::now(),
            Duration::from_secs(1),
            Some(pool.clone() as Arc<dyn ManagedObjectPool>),
        ));
        let monitor = Arc::new(AssetMonitor::new(asset.clone()));
        (asset.clone(), ManagedObjectUser::new(asset, monitor))
    }

    #[test]
    fn object_arriving_after_abandon_is_lost_to_the_pool() {
        let pool = Arc::new(IdlePool::new(|_user: ManagedObjectUser| {}, 1));
        let (asset, user) = pooled_user(&pool);

        asset.abandon();
        user.set_object(ValueObject(7_u32));

        assert_eq!(pool.lost_count(), 1);
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(*asset.outcome.lock(), SourcingOutcome::Abandoned));
    }

    #[test]
    fn abandon_keeps_an_object_already_delivered() {
        let pool = Arc::new(IdlePool::new(|_user: ManagedObjectUser| {}, 1));
        let (asset, user) = pooled_user(&pool);

        user.set_object(ValueObject(7_u32));
        asset.abandon();

        assert_eq!(pool.lost_count(), 0);
        assert!(matches!(asset.take(), Some(Ok(_))));
    }
}
