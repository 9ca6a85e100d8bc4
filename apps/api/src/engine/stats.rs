//! Recipe statistics: success-rate math and the retirement rule.
//!
//! The SQL layer updates counters atomically; the arithmetic lives here so
//! the policy is testable without a database. `times_used` counts every
//! execution (success or failure), `failure_count` only the failures, so
//! successes are always `times_used - failure_count`.

/// Cumulative success rate. A recipe with no recorded executions is
/// treated as fully trusted until evidence says otherwise.
pub fn cumulative_rate(times_used: i32, failure_count: i32) -> f64 {
    if times_used <= 0 {
        return 1.0;
    }
    let successes = (times_used - failure_count).max(0);
    f64::from(successes) / f64::from(times_used)
}

/// Success rate over a trailing window of execution outcomes, newest first.
/// Used instead of the cumulative rate when a stats window is configured,
/// so one bad streak can retire a recipe that was good a thousand runs ago.
pub fn windowed_rate(outcomes: &[bool]) -> f64 {
    if outcomes.is_empty() {
        return 1.0;
    }
    let successes = outcomes.iter().filter(|&&s| s).count();
    successes as f64 / outcomes.len() as f64
}

/// Retirement rule: a recipe below the floor is no longer selected for
/// replay and must be re-recorded. Recipes with fewer than `min_sample`
/// executions are exempt; one early failure is not a verdict.
pub fn should_retire(success_rate: f64, times_used: i32, floor: f64, min_sample: i32) -> bool {
    times_used >= min_sample && success_rate < floor
}

/// Amount saved by replaying a recipe instead of paying for a fresh
/// AI-driven recording pass.
pub fn replay_saving(recording_cost: f64, replay_cost: f64) -> f64 {
    (recording_cost - replay_cost).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_rate_is_successes_over_total() {
        // M successes out of N executions must give exactly M/N.
        for total in 1..=20 {
            for failures in 0..=total {
                let rate = cumulative_rate(total, failures);
                let expected = f64::from(total - failures) / f64::from(total);
                assert!(
                    (rate - expected).abs() < 1e-12,
                    "total={total} failures={failures}: got {rate}, want {expected}"
                );
            }
        }
    }

    #[test]
    fn test_cumulative_rate_of_fresh_recipe_is_one() {
        assert_eq!(cumulative_rate(0, 0), 1.0);
    }

    #[test]
    fn test_cumulative_rate_clamps_excess_failures() {
        // failure_count > times_used only happens on corrupt data; never
        // report a negative rate for it.
        assert_eq!(cumulative_rate(2, 5), 0.0);
    }

    #[test]
    fn test_windowed_rate() {
        assert_eq!(windowed_rate(&[]), 1.0);
        assert_eq!(windowed_rate(&[true, true, true]), 1.0);
        assert_eq!(windowed_rate(&[false, false]), 0.0);
        assert!((windowed_rate(&[true, false, true, false]) - 0.5).abs() < 1e-12);
        assert!((windowed_rate(&[true, false, false]) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_retirement_requires_minimum_sample() {
        // 0% success but only 2 uses: below the sample floor, keep trying.
        assert!(!should_retire(0.0, 2, 0.5, 3));
        // Third execution makes it eligible.
        assert!(should_retire(0.0, 3, 0.5, 3));
    }

    #[test]
    fn test_retirement_is_strictly_below_floor() {
        assert!(!should_retire(0.5, 10, 0.5, 3));
        assert!(should_retire(0.49, 10, 0.5, 3));
    }

    #[test]
    fn test_healthy_recipe_is_not_retired() {
        assert!(!should_retire(0.9, 100, 0.5, 3));
    }

    #[test]
    fn test_replay_saving() {
        assert!((replay_saving(0.80, 0.05) - 0.75).abs() < 1e-12);
        // Misconfigured costs never produce a negative saving.
        assert_eq!(replay_saving(0.05, 0.80), 0.0);
    }
}
