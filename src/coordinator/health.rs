// =============================================================================
// Upstream health tracking and adaptive backpressure
// =============================================================================
//
// The health snapshot is written by the background poller and by every
// response; readers (workers computing their pre-call delay, the status
// surface) tolerate loosely consistent values, so a short RwLock suffices.
// =============================================================================

use std::time::Duration;

use crate::config::QueueThresholds;
use crate::gateway::GatewayHealth;

/// Latest observed upstream health. `consecutive_errors` counts coordinator-
/// observed failures, distinct from the gateway's own `recent_errors`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthSnapshot {
    pub queue_depth: u32,
    pub rtt_ms: u64,
    pub recent_errors: u32,
    pub consecutive_errors: u32,
}

impl HealthSnapshot {
    pub fn absorb(&mut self, h: GatewayHealth) {
        self.queue_depth = h.queue_depth;
        self.rtt_ms = h.rtt_ms;
        self.recent_errors = h.recent_errors;
    }
}

/// Pre-call delay for the observed upstream queue depth. Monotone in depth:
///
/// | depth        | delay  |
/// |--------------|--------|
/// | > critical   | 500 ms |
/// | > high       | 100 ms |
/// | > medium     |  50 ms |
/// | > low        |  25 ms |
/// | otherwise    |  10 ms |
pub fn compute_delay(queue_depth: u32, t: &QueueThresholds) -> Duration {
    let ms = if queue_depth > t.critical {
        500
    } else if queue_depth > t.high {
        100
    } else if queue_depth > t.medium {
        50
    } else if queue_depth > t.low {
        25
    } else {
        10
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: delays are nondecreasing across escalating queue depths and
    /// hit the reference values exactly at the default thresholds.
    #[test]
    fn delay_escalates_monotonically() {
        let t = QueueThresholds::default();
        let depths = [10u32, 30, 60, 80, 120];
        let expected_ms = [10u64, 25, 50, 100, 500];

        let mut last = Duration::ZERO;
        for (depth, want) in depths.iter().zip(expected_ms) {
            let d = compute_delay(*depth, &t);
            assert_eq!(d, Duration::from_millis(want), "depth {depth}");
            assert!(d >= last, "delay regressed at depth {depth}");
            last = d;
        }
    }

    #[test]
    fn thresholds_are_exclusive_lower_bounds() {
        let t = QueueThresholds::default();
        // Exactly at a threshold stays in the lower band.
        assert_eq!(compute_delay(25, &t), Duration::from_millis(10));
        assert_eq!(compute_delay(26, &t), Duration::from_millis(25));
        assert_eq!(compute_delay(100, &t), Duration::from_millis(100));
        assert_eq!(compute_delay(101, &t), Duration::from_millis(500));
    }

    #[test]
    fn absorb_keeps_consecutive_errors() {
        let mut s = HealthSnapshot {
            consecutive_errors: 3,
            ..Default::default()
        };
        s.absorb(GatewayHealth {
            queue_depth: 42,
            rtt_ms: 12,
            recent_errors: 1,
        });
        assert_eq!(s.queue_depth, 42);
        assert_eq!(s.consecutive_errors, 3);
    }
}
