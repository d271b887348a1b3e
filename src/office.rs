//! The office: root of the kernel owning teams, asset managers and the
//! process and thread descriptors every invoked process is built from.

use crate::{
    asset::{AssetManager, Clock, Heartbeat, SystemClock},
    config::OfficeConfig,
    error::{Escalation, OfficeSetupError},
    escalation::{CatchAll, EscalationProcedure},
    executor::{LoadPlan, PlanError},
    function::FunctionDescriptor,
    governance::GovernanceDescriptor,
    object::{ManagedObjectDescriptor, ObjectIndex, ObjectScope},
    process::{self, ProcessCallback, ProcessHandle},
    team::{Team, TeamRegistry},
    types::{Argument, IdSequence, IndexMap, ProcessId, TeamName},
};
use core::fmt::{self, Debug};
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use std::{io, sync::Arc};
use tracing::{debug, error, warn};

const DEFAULT_ASSET_MANAGER: &str = "default";

/// State shared by every process of an office.
pub(crate) struct OfficeShared {
    config: OfficeConfig,
    teams: TeamRegistry,
    clock: Arc<dyn Clock>,
    asset_managers: IndexMap<Arc<str>, Arc<AssetManager>>,
    ids: IdSequence,
    process_objects: Vec<Arc<ManagedObjectDescriptor>>,
    thread_objects: Vec<Arc<ManagedObjectDescriptor>>,
    governance: Vec<Arc<GovernanceDescriptor>>,
    process_escalation: EscalationProcedure,
    thread_escalation: EscalationProcedure,
    catch_all: CatchAll,
    startup: Vec<Arc<FunctionDescriptor>>,
}

impl OfficeShared {
    pub(crate) const fn config(&self) -> &OfficeConfig {
        &self.config
    }

    pub(crate) const fn teams(&self) -> &TeamRegistry {
        &self.teams
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) const fn ids(&self) -> &IdSequence {
        &self.ids
    }

    /// Manager called `name`, or the default manager.
    pub(crate) fn asset_manager(&self, name: Option<&Arc<str>>) -> &Arc<AssetManager> {
        if let Some(name) = name {
            if let Some(manager) = self.asset_managers.get(name) {
                return manager;
            }
            warn!(asset_manager = %name, "unknown asset manager, using default");
        }
        &self.asset_managers[DEFAULT_ASSET_MANAGER]
    }

    pub(crate) fn process_objects(&self) -> &[Arc<ManagedObjectDescriptor>] {
        &self.process_objects
    }

    pub(crate) fn thread_objects(&self) -> &[Arc<ManagedObjectDescriptor>] {
        &self.thread_objects
    }

    pub(crate) fn governance(&self) -> &[Arc<GovernanceDescriptor>] {
        &self.governance
    }

    pub(crate) const fn process_escalation(&self) -> &EscalationProcedure {
        &self.process_escalation
    }

    pub(crate) const fn thread_escalation(&self) -> &EscalationProcedure {
        &self.thread_escalation
    }

    pub(crate) fn catch_all(&self) -> &CatchAll {
        &self.catch_all
    }
}

impl Debug for OfficeShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeShared")
            .field("config", &self.config)
            .field("teams", &self.teams)
            .field("asset_managers", &self.asset_managers.keys().collect::<Vec<_>>())
            .field("process_objects", &self.process_objects.len())
            .field("thread_objects", &self.thread_objects.len())
            .field("governance", &self.governance.len())
            .finish_non_exhaustive()
    }
}

/// Root of the kernel. Invokes processes and drives the asset heartbeat.
///
/// ```
/// use ckernel::{FunctionDescriptor, Office, PassiveTeam};
/// use std::sync::Arc;
///
/// let office = Office::builder()
///     .team(Arc::new(PassiveTeam::new("main")))
///     .build()
///     .unwrap();
/// let hello = FunctionDescriptor::builder("hello", |_| Ok(())).build();
/// let process = office.invoke_process(&hello, None, None);
/// assert!(process.is_complete());
/// ```
#[derive(Debug)]
pub struct Office {
    shared: Arc<OfficeShared>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl Office {
    /// Starts configuring an office.
    #[must_use]
    pub fn builder() -> OfficeBuilder {
        OfficeBuilder::default()
    }

    /// Configuration of the office.
    #[must_use]
    pub fn config(&self) -> &OfficeConfig {
        self.shared.config()
    }

    /// Starts the heartbeat if an interval is configured and invokes every
    /// startup function in its own process.
    ///
    /// # Errors
    /// If the heartbeat thread cannot be spawned.
    pub fn open(&self) -> io::Result<Vec<ProcessHandle>> {
        if let Some(interval) = self.shared.config.heartbeat_interval {
            let mut heartbeat = self.heartbeat.lock();
            if heartbeat.is_none() {
                let managers = self.shared.asset_managers.values().cloned().collect();
                *heartbeat = Some(Heartbeat::start(managers, interval)?);
            }
        }
        debug!(startup = self.shared.startup.len(), "office opened");
        Ok(self
            .shared
            .startup
            .iter()
            .map(|function| process::invoke(&self.shared, function, None, None))
            .collect())
    }

    /// Stops the heartbeat. Processes still running continue, but timeouts
    /// are only detected by explicit [`Office::check_on_assets`] calls.
    pub fn close(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop();
            debug!("office closed");
        }
    }

    /// Invokes `function` with `argument` in a new process. `callback`
    /// receives the outcome once the process and all its cleanup completed.
    pub fn invoke_process(
        &self,
        function: &Arc<FunctionDescriptor>,
        argument: Option<Argument>,
        callback: Option<ProcessCallback>,
    ) -> ProcessHandle {
        process::invoke(&self.shared, function, argument, callback)
    }

    /// Checks every asset of every manager once, returning how many monitors
    /// were checked.
    pub fn check_on_assets(&self) -> usize {
        self.shared
            .asset_managers
            .values()
            .map(|manager| manager.check_on_assets())
            .sum()
    }

    /// Asset manager called `name`.
    #[must_use]
    pub fn asset_manager(&self, name: &str) -> Option<&Arc<AssetManager>> {
        self.shared.asset_managers.get(name)
    }
}

/// Assembles and validates an [`Office`].
pub struct OfficeBuilder {
    config: OfficeConfig,
    teams: Vec<Arc<dyn Team>>,
    default_team: Option<TeamName>,
    break_chain_team: Option<TeamName>,
    clock: Option<Arc<dyn Clock>>,
    asset_managers: Vec<Arc<str>>,
    process_objects: Vec<ManagedObjectDescriptor>,
    thread_objects: Vec<ManagedObjectDescriptor>,
    governance: Vec<GovernanceDescriptor>,
    process_escalation: EscalationProcedure,
    thread_escalation: EscalationProcedure,
    catch_all: Option<CatchAll>,
    startup: Vec<Arc<FunctionDescriptor>>,
}

impl Default for OfficeBuilder {
    fn default() -> Self {
        Self {
            config: OfficeConfig::default(),
            teams: Vec::new(),
            default_team: None,
            break_chain_team: None,
            clock: None,
            asset_managers: Vec::new(),
            process_objects: Vec::new(),
            thread_objects: Vec::new(),
            governance: Vec::new(),
            process_escalation: EscalationProcedure::new(),
            thread_escalation: EscalationProcedure::new(),
            catch_all: None,
            startup: Vec::new(),
        }
    }
}

impl Debug for OfficeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeBuilder")
            .field("config", &self.config)
            .field("teams", &self.teams)
            .field("process_objects", &self.process_objects.len())
            .field("thread_objects", &self.thread_objects.len())
            .field("governance", &self.governance.len())
            .finish_non_exhaustive()
    }
}

impl OfficeBuilder {
    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: OfficeConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a team. The first team is the default team unless
    /// [`OfficeBuilder::default_team`] names another.
    #[must_use]
    pub fn team(mut self, team: Arc<dyn Team>) -> Self {
        self.teams.push(team);
        self
    }

    /// Team running work arriving from outside the office and nodes without a
    /// team.
    #[must_use]
    pub fn default_team(mut self, name: impl Into<TeamName>) -> Self {
        self.default_team = Some(name.into());
        self
    }

    /// Team continuing chains that exceeded the maximum chain length.
    /// Defaults to the default team.
    #[must_use]
    pub fn break_chain_team(mut self, name: impl Into<TeamName>) -> Self {
        self.break_chain_team = Some(name.into());
        self
    }

    /// Clock of every asset manager. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adds an asset manager that descriptors may name. A manager called
    /// `default` always exists.
    #[must_use]
    pub fn asset_manager(mut self, name: impl Into<Arc<str>>) -> Self {
        self.asset_managers.push(name.into());
        self
    }

    /// Binds an object shared by every thread state of a process.
    #[must_use]
    pub fn process_object(mut self, object: ManagedObjectDescriptor) -> Self {
        self.process_objects.push(object);
        self
    }

    /// Binds an object private to each thread state.
    #[must_use]
    pub fn thread_object(mut self, object: ManagedObjectDescriptor) -> Self {
        self.thread_objects.push(object);
        self
    }

    /// Adds a governance slot to every thread state.
    #[must_use]
    pub fn governance(mut self, governance: GovernanceDescriptor) -> Self {
        self.governance.push(governance);
        self
    }

    /// Handlers consulted for escalations no function or flow handled.
    #[must_use]
    pub fn process_escalation(mut self, procedure: EscalationProcedure) -> Self {
        self.process_escalation = procedure;
        self
    }

    /// Handlers consulted before the process escalation procedure.
    #[must_use]
    pub fn thread_escalation(mut self, procedure: EscalationProcedure) -> Self {
        self.thread_escalation = procedure;
        self
    }

    /// Receives escalations nothing else handled. Defaults to logging them.
    #[must_use]
    pub fn catch_all(
        mut self,
        catch_all: impl Fn(&Escalation, ProcessId) + Send + Sync + 'static,
    ) -> Self {
        self.catch_all = Some(Arc::new(catch_all));
        self
    }

    /// Function invoked in its own process by [`Office::open`].
    #[must_use]
    pub fn startup(mut self, function: Arc<FunctionDescriptor>) -> Self {
        self.startup.push(function);
        self
    }

    /// Validates the configuration and builds the office.
    ///
    /// # Errors
    /// If no team is registered, a team name is unknown or duplicated, or
    /// object dependencies are unknown or cyclic.
    pub fn build(self) -> Result<Office, OfficeSetupError> {
        let Self {
            config,
            teams,
            default_team,
            break_chain_team,
            clock,
            asset_managers: manager_names,
            process_objects,
            thread_objects,
            governance,
            process_escalation,
            thread_escalation,
            catch_all,
            startup,
        } = self;

        let teams = TeamRegistry::new(teams, default_team, break_chain_team)?;
        for function in &startup {
            if let Some(team) = function.team() {
                if !teams.contains(team) {
                    return Err(OfficeSetupError::UnknownTeam(team.clone()));
                }
            }
        }
        validate_dependencies(&process_objects, &thread_objects)?;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let mut asset_managers =
            IndexMap::with_capacity_and_hasher(manager_names.len() + 1, FxBuildHasher);
        for name in core::iter::once(Arc::from(DEFAULT_ASSET_MANAGER)).chain(manager_names) {
            asset_managers
                .entry(name.clone())
                .or_insert_with(|| Arc::new(AssetManager::new(name, clock.clone())));
        }
        let catch_all = catch_all.unwrap_or_else(|| {
            Arc::new(|escalation: &Escalation, process: ProcessId| {
                error!(%process, %escalation, "escalation reached the office catch-all");
            })
        });

        debug!(
            teams = ?teams,
            process_objects = process_objects.len(),
            thread_objects = thread_objects.len(),
            governance = governance.len(),
            "office built"
        );
        Ok(Office {
            shared: Arc::new(OfficeShared {
                config,
                teams,
                clock,
                asset_managers,
                ids: IdSequence::new(),
                process_objects: process_objects.into_iter().map(Arc::new).collect(),
                thread_objects: thread_objects.into_iter().map(Arc::new).collect(),
                governance: governance.into_iter().map(Arc::new).collect(),
                process_escalation,
                thread_escalation,
                catch_all,
                startup,
            }),
            heartbeat: Mutex::new(None),
        })
    }
}

/// Process objects may only depend on process objects; thread objects on
/// thread and process objects. Neither may depend on themselves, directly or
/// not.
fn validate_dependencies(
    process_objects: &[ManagedObjectDescriptor],
    thread_objects: &[ManagedObjectDescriptor],
) -> Result<(), OfficeSetupError> {
    let scoped = [
        (ObjectScope::Process, process_objects),
        (ObjectScope::Thread, thread_objects),
    ];
    for (scope, objects) in scoped {
        for object in objects {
            for &index in object.dependencies() {
                let known = match index.scope {
                    ObjectScope::Process => index.index < process_objects.len(),
                    ObjectScope::Thread => {
                        scope == ObjectScope::Thread && index.index < thread_objects.len()
                    }
                    ObjectScope::Function => false,
                };
                if !known {
                    return Err(OfficeSetupError::UnknownDependency {
                        bound_name: object.bound_name().clone(),
                        index,
                    });
                }
            }
        }
    }
    let every: Vec<ObjectIndex> = (0..process_objects.len())
        .map(ObjectIndex::process)
        .chain((0..thread_objects.len()).map(ObjectIndex::thread))
        .collect();
    LoadPlan::new(&every, |index| {
        let objects = match index.scope {
            ObjectScope::Process => process_objects,
            ObjectScope::Thread => thread_objects,
            ObjectScope::Function => return None,
        };
        objects.get(index.index).map(ManagedObjectDescriptor::dependencies)
    })
    .map(drop)
    .map_err(|error| match error {
        PlanError::Unknown(index) => OfficeSetupError::UnknownDependency {
            bound_name: Arc::from("<unknown>"),
            index,
        },
        PlanError::Cycle => OfficeSetupError::DependencyCycle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object::ManagedObjectSource, team::PassiveTeam};

    struct Never;

    impl ManagedObjectSource for Never {
        fn source(&self, _user: crate::object::ManagedObjectUser) {}
    }

    fn object(name: &str, dependencies: &[ObjectIndex]) -> ManagedObjectDescriptor {
        dependencies
            .iter()
            .fold(ManagedObjectDescriptor::new(name, Never), |object, &index| {
                object.depends_on(index)
            })
    }

    fn builder() -> OfficeBuilder {
        Office::builder().team(Arc::new(PassiveTeam::new("main")))
    }

    #[test]
    fn requires_a_team() {
        assert!(matches!(Office::builder().build(), Err(OfficeSetupError::NoTeams)));
    }

    #[test]
    fn rejects_unknown_break_chain_team() {
        let result = builder().break_chain_team("missing").build();
        assert!(matches!(result, Err(OfficeSetupError::UnknownTeam(name)) if &*name == "missing"));
    }

    #[test]
    fn rejects_process_object_depending_on_thread_object() {
        let result = builder()
            .process_object(object("a", &[ObjectIndex::thread(0)]))
            .thread_object(object("b", &[]))
            .build();
        assert!(matches!(
            result,
            Err(OfficeSetupError::UnknownDependency { bound_name, .. }) if &*bound_name == "a"
        ));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let result = builder()
            .process_object(object("a", &[ObjectIndex::process(1)]))
            .process_object(object("b", &[ObjectIndex::process(0)]))
            .build();
        assert!(matches!(result, Err(OfficeSetupError::DependencyCycle)));
    }

    #[test]
    fn falls_back_to_default_asset_manager() {
        let office = builder().asset_manager("io").build().unwrap();
        assert!(office.asset_manager("io").is_some());
        let fallback = office.shared.asset_manager(Some(&Arc::from("missing")));
        assert_eq!(&**fallback.name(), DEFAULT_ASSET_MANAGER);
    }
}
