use crate::cpuset::CPUSET_MAX_CPUS;

/// Tunables of the MP runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MpConfig {
    /// Hard cap on the processor count; larger systems fail to initialize.
    /// Clamped to [`CPUSET_MAX_CPUS`].
    pub max_cpus: u32,
    /// Topology discovery passes before giving up on a moving active count.
    pub discovery_attempts: u32,
    pub specific_wait: SpecificWait,
}

impl MpConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_cpus: CPUSET_MAX_CPUS,
            discovery_attempts: 16,
            specific_wait: SpecificWait::new(),
        }
    }
}

impl Default for MpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How long [`Mp::on_specific`](crate::Mp::on_specific) waits at each
/// escalation step before trying the next one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SpecificWait {
    /// Busy polls of the completion flag right after queuing.
    pub spin_iterations: u32,
    /// First wait, before anything else is tried.
    pub short_wait_ns: u64,
    /// Wait after poking the target processor.
    pub poke_wait_ns: u64,
    /// Once the work is known to be running, an error is logged every time
    /// this much passes without completion.
    pub give_up_interval_ns: u64,
}

impl SpecificWait {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            spin_iterations: 4096,
            short_wait_ns: 1_000_000,
            poke_wait_ns: 10_000_000,
            give_up_interval_ns: 30_000_000_000,
        }
    }
}

impl Default for SpecificWait {
    fn default() -> Self {
        Self::new()
    }
}
