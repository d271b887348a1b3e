use crate::{
    error::OfficeSetupError,
    types::{IndexMap, Job, TeamName},
};
use core::{cell::Cell, fmt::Debug};
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use std::{collections::VecDeque, sync::Arc};
use tracing::warn;

/// A group of real worker threads the dispatcher assigns jobs to.
pub trait Team: Debug + Send + Sync + 'static {
    /// Name the team is registered under.
    fn name(&self) -> &TeamName;
    /// Hands a job to the team. Must not run it on the caller's stack unless
    /// the team is passive.
    fn assign_job(&self, job: Job);
    /// Whether the calling OS thread is one of this team's workers.
    fn is_current(&self) -> bool;
}

/// Runs every job immediately on the thread assigning it.
#[derive(Debug)]
pub struct PassiveTeam {
    name: TeamName,
}

impl PassiveTeam {
    /// Passive team called `name`.
    pub fn new(name: impl Into<TeamName>) -> Self {
        Self { name: name.into() }
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &TeamName {
        &self.name
    }

    fn assign_job(&self, job: Job) {
        job();
    }

    fn is_current(&self) -> bool {
        true
    }
}

/// Team backed by a dedicated `rayon` thread pool.
#[derive(derive_more::Debug)]
pub struct RayonTeam {
    name: TeamName,
    #[debug(skip)]
    pool: rayon::ThreadPool,
}

impl RayonTeam {
    /// Team of `threads` workers.
    ///
    /// # Errors
    /// If the thread pool cannot be built.
    pub fn new(
        name: impl Into<TeamName>,
        threads: usize,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let name: TeamName = name.into();
        let prefix = name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |idx| format!("{prefix}-{idx}"))
            .build()?;
        Ok(Self { name, pool })
    }
}

impl Team for RayonTeam {
    fn name(&self) -> &TeamName {
        &self.name
    }

    fn assign_job(&self, job: Job) {
        self.pool.spawn(job);
    }

    fn is_current(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }
}

thread_local! {
    static RUNNING_QUEUE: Cell<usize> = const { Cell::new(0) };
}

/// Team that only queues jobs; the owner runs them with
/// [`QueuedTeam::run_pending`]. Gives tests full control over scheduling.
#[derive(derive_more::Debug)]
pub struct QueuedTeam {
    name: TeamName,
    #[debug(skip)]
    jobs: Mutex<VecDeque<Job>>,
}

impl QueuedTeam {
    /// Empty queued team called `name`.
    pub fn new(name: impl Into<TeamName>) -> Self {
        Self {
            name: name.into(),
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of jobs waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Runs queued jobs, including jobs queued while running, until the queue
    /// is empty. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let identity = self.identity();
        let previous = RUNNING_QUEUE.with(|running| running.replace(identity));
        let mut ran = 0;
        loop {
            let job = self.jobs.lock().pop_front();
            let Some(job) = job else {
                break;
            };
            job();
            ran += 1;
        }
        RUNNING_QUEUE.with(|running| running.set(previous));
        ran
    }

    /// Runs at most one queued job, returning whether one ran.
    pub fn run_one(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        let Some(job) = job else {
            return false;
        };
        let previous = RUNNING_QUEUE.with(|running| running.replace(self.identity()));
        job();
        RUNNING_QUEUE.with(|running| running.set(previous));
        true
    }

    fn identity(&self) -> usize {
        core::ptr::from_ref(self) as usize
    }
}

impl Team for QueuedTeam {
    fn name(&self) -> &TeamName {
        &self.name
    }

    fn assign_job(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }

    fn is_current(&self) -> bool {
        RUNNING_QUEUE.with(Cell::get) == self.identity()
    }
}

/// Teams of an office by name, with the default and break-chain teams.
#[derive(Debug)]
pub(crate) struct TeamRegistry {
    teams: IndexMap<TeamName, Arc<dyn Team>>,
    default_team: TeamName,
    break_chain_team: TeamName,
}

impl TeamRegistry {
    pub(crate) fn new(
        teams: Vec<Arc<dyn Team>>,
        default_team: Option<TeamName>,
        break_chain_team: Option<TeamName>,
    ) -> Result<Self, OfficeSetupError> {
        let mut registry = IndexMap::with_capacity_and_hasher(teams.len(), FxBuildHasher);
        for team in teams {
            let name = team.name().clone();
            if registry.insert(name.clone(), team).is_some() {
                return Err(OfficeSetupError::DuplicateTeam(name));
            }
        }
        let first = registry
            .keys()
            .next()
            .cloned()
            .ok_or(OfficeSetupError::NoTeams)?;
        let default_team = default_team.unwrap_or(first);
        let break_chain_team = break_chain_team.unwrap_or_else(|| default_team.clone());
        for name in [&default_team, &break_chain_team] {
            if !registry.contains_key(name) {
                return Err(OfficeSetupError::UnknownTeam(name.clone()));
            }
        }
        Ok(Self {
            teams: registry,
            default_team,
            break_chain_team,
        })
    }

    pub(crate) fn contains(&self, name: &TeamName) -> bool {
        self.teams.contains_key(name)
    }

    pub(crate) fn get(&self, name: &TeamName) -> Option<&Arc<dyn Team>> {
        self.teams.get(name)
    }

    /// Whether the calling OS thread is a worker of any registered team.
    pub(crate) fn any_current(&self) -> bool {
        self.teams.values().any(|team| team.is_current())
    }

    /// Team responsible for `name`, falling back to the default team.
    pub(crate) fn resolve(&self, name: Option<&TeamName>) -> &Arc<dyn Team> {
        if let Some(name) = name {
            if let Some(team) = self.teams.get(name) {
                return team;
            }
            warn!(team = %name, "unknown team, using default team");
        }
        self.default_team()
    }

    pub(crate) fn default_team(&self) -> &Arc<dyn Team> {
        &self.teams[&self.default_team]
    }

    pub(crate) fn break_chain_team(&self) -> &Arc<dyn Team> {
        &self.teams[&self.break_chain_team]
    }
}
