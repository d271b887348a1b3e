use core::time::Duration;

/// What happens to governance still active when the thread owning it
/// completes, or when a function no longer requires it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum GovernanceDeactivationStrategy {
    /// Enforce the governance before deactivating it.
    #[default]
    Enforce,
    /// Disregard the governance before deactivating it.
    Disregard,
}

/// Tunables of an office.
///
/// Every value has a default suitable for tests; production offices usually
/// only adjust the chain length and the heartbeat interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfficeConfig {
    /// Maximum number of nodes executed back to back on one native stack
    /// before the remaining chain is handed to the break-chain team.
    pub max_chain_length: usize,
    /// Timeout for sourcing a managed object that does not declare its own.
    pub default_sourcing_timeout: Duration,
    /// Timeout for asynchronous operations of functions that do not declare
    /// their own.
    pub default_asynchronous_timeout: Duration,
    /// Period of the asset heartbeat. `None` leaves asset checks to explicit
    /// calls of `Office::check_on_assets`.
    pub heartbeat_interval: Option<Duration>,
    /// Strategy applied to active governance on deactivation.
    pub deactivation_strategy: GovernanceDeactivationStrategy,
}

impl Default for OfficeConfig {
    fn default() -> Self {
        Self {
            max_chain_length: 1000,
            default_sourcing_timeout: Duration::from_secs(10),
            default_asynchronous_timeout: Duration::from_secs(10),
            heartbeat_interval: None,
            deactivation_strategy: GovernanceDeactivationStrategy::default(),
        }
    }
}

impl OfficeConfig {
    /// Sets [`OfficeConfig::max_chain_length`]. A zero length is treated as one.
    #[must_use]
    pub fn with_max_chain_length(mut self, length: usize) -> Self {
        self.max_chain_length = length.max(1);
        self
    }

    /// Sets [`OfficeConfig::default_sourcing_timeout`].
    #[must_use]
    pub fn with_sourcing_timeout(mut self, timeout: Duration) -> Self {
        self.default_sourcing_timeout = timeout;
        self
    }

    /// Sets [`OfficeConfig::default_asynchronous_timeout`].
    #[must_use]
    pub fn with_asynchronous_timeout(mut self, timeout: Duration) -> Self {
        self.default_asynchronous_timeout = timeout;
        self
    }

    /// Sets [`OfficeConfig::heartbeat_interval`].
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets [`OfficeConfig::deactivation_strategy`].
    #[must_use]
    pub fn with_deactivation_strategy(mut self, strategy: GovernanceDeactivationStrategy) -> Self {
        self.deactivation_strategy = strategy;
        self
    }
}
