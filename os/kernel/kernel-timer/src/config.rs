use crate::RearmPolicy;

/// Per-timer tunables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct TimerConfig {
    pub rearm: RearmPolicy,
}

impl TimerConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rearm: RearmPolicy::new(),
        }
    }
}
