//! Deadline computation for periodic re-arming.
//!
//! Kernel timers are one-shot, so a periodic timer re-arms itself from each
//! expiry. Aiming every expiry at the nominal schedule keeps the long-term
//! rate exact; when the routine runs late the schedule is given up for a
//! catch-up deadline instead of firing a burst of back-to-back ticks.

/// Catch-up tuning.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RearmPolicy {
    /// Lateness still treated as on schedule.
    pub safety_margin_ns: u64,
    /// Shortest delay ever armed; capped at the interval.
    pub min_rearm_ns: u64,
}

impl RearmPolicy {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            safety_margin_ns: 1_000,
            min_rearm_ns: 250_000,
        }
    }
}

impl Default for RearmPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute deadline for tick number `tick` of a timer started at `start_ns`
/// (tick 0 being due at `start_ns` itself).
///
/// With `nominal = start + tick * interval` and `drift = now - nominal`:
///
/// | drift | deadline |
/// |-------|----------|
/// | `< safety_margin` | `max(nominal, now + floor)` |
/// | `..= interval` | `now + floor` |
/// | `..= 2 * interval` | `now + max(interval / 2, floor)` |
/// | larger | `now + max(interval / 4, floor)` |
///
/// where `floor = min(min_rearm, interval)`.
#[must_use]
pub fn next_deadline(now_ns: u64, start_ns: u64, interval_ns: u64, tick: u64, policy: &RearmPolicy) -> u64 {
    let nominal = start_ns.saturating_add(tick.saturating_mul(interval_ns));
    let floor = policy.min_rearm_ns.min(interval_ns);
    let drift = now_ns.saturating_sub(nominal);

    if now_ns < nominal || drift < policy.safety_margin_ns {
        nominal.max(now_ns.saturating_add(floor))
    } else if drift <= interval_ns {
        now_ns.saturating_add(floor)
    } else if drift <= interval_ns.saturating_mul(2) {
        now_ns.saturating_add((interval_ns / 2).max(floor))
    } else {
        now_ns.saturating_add((interval_ns / 4).max(floor))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MS: u64 = 1_000_000;
    const POLICY: RearmPolicy = RearmPolicy {
        safety_margin_ns: 1_000,
        min_rearm_ns: 250_000,
    };

    #[test]
    fn on_schedule_targets_the_nominal_time() {
        // tick 3 of a 10 ms timer started at 100 ms, evaluated at 121 ms
        assert_eq!(next_deadline(121 * MS, 100 * MS, 10 * MS, 3, &POLICY), 130 * MS);
        // within the margin still counts as on time, but never sooner than the floor
        let now = 130 * MS + 500;
        assert_eq!(next_deadline(now, 100 * MS, 10 * MS, 3, &POLICY), now + 250_000);
    }

    #[test]
    fn nominal_closer_than_the_floor_is_pushed_out() {
        let now = 130 * MS - 100_000;
        assert_eq!(next_deadline(now, 100 * MS, 10 * MS, 3, &POLICY), now + 250_000);
    }

    #[test]
    fn catch_up_slows_down_as_drift_grows() {
        let start = 0;
        let interval = 8 * MS;
        let nominal = 5 * interval;

        let now = nominal + 2 * MS;
        assert_eq!(next_deadline(now, start, interval, 5, &POLICY), now + 250_000);

        let now = nominal + interval + MS;
        assert_eq!(next_deadline(now, start, interval, 5, &POLICY), now + 4 * MS);

        let now = nominal + 3 * interval;
        assert_eq!(next_deadline(now, start, interval, 5, &POLICY), now + 2 * MS);
    }

    #[test]
    fn floor_never_exceeds_the_interval() {
        let interval = 100_000;
        let now = 10 * interval + 50_000;
        assert_eq!(next_deadline(now, 0, interval, 10, &POLICY), now + interval);
        // far behind: interval / 4 is below the capped floor, so the floor wins
        let now = 40 * interval;
        assert_eq!(next_deadline(now, 0, interval, 10, &POLICY), now + interval);
    }
}
