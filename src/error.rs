// =============================================================================
// Error taxonomy for the scan pipeline
// =============================================================================
//
// Each variant maps to a well-defined recovery:
//   Config      — rejected at start_scan / update_filters, surfaced to caller.
//   Dependency  — transient external-source failure; filter becomes
//                 pass-through or the tick is skipped.
//   Deadline    — request exceeded its per-call deadline; tick skipped.
//   CircuitOpen — upstream unhealthy; tick skipped, reason in status event.
//   Overload    — internal queue full / too many scans; admission error.
//   Protocol    — malformed subscriber message; subscriber disconnected.
//   Internal    — invariant violation; tick fails, scan continues.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ScanError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dependency unavailable: {0}")]
    Dependency(String),

    #[error("request deadline exceeded")]
    Deadline,

    #[error("upstream circuit breaker is open")]
    CircuitOpen,

    #[error("overloaded: {0}")]
    Overload(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Short machine-readable tag carried in status events and error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Dependency(_) => "dependency",
            Self::Deadline => "deadline",
            Self::CircuitOpen => "circuit_open",
            Self::Overload(_) => "overload",
            Self::Protocol(_) => "protocol",
            Self::Internal(_) => "internal",
        }
    }

    /// True for errors the engine recovers from by skipping the current tick.
    pub fn is_tick_skip(&self) -> bool {
        matches!(
            self,
            Self::Deadline | Self::CircuitOpen | Self::Dependency(_) | Self::Overload(_)
        )
    }
}
