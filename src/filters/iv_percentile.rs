// =============================================================================
// IV Percentile filter
// =============================================================================
//
// Ranks each contract's current implied volatility within the last N trading
// days of its symbol's historical IV and keeps contracts whose rank falls in
// [min, max]. History comes from the per-process IvHistoryStore; when no
// series is loaded for a symbol the filter fails with Dependency, which the
// chain executor downgrades to pass-through for the tick.
// =============================================================================

use std::time::Duration;

use crate::error::ScanError;
use crate::types::Contract;

use super::{in_range, CostClass, FilterContext, SpreadFilter};

#[derive(Debug, Clone)]
pub struct IvPercentileFilter {
    min: f64,
    max: f64,
    lookback_days: usize,
    key: u64,
}

impl IvPercentileFilter {
    pub fn new(min: f64, max: f64, lookback_days: usize, key: u64) -> Self {
        Self {
            min,
            max,
            lookback_days,
            key,
        }
    }
}

impl SpreadFilter for IvPercentileFilter {
    fn name(&self) -> &'static str {
        "iv_percentile"
    }

    fn priority(&self) -> u8 {
        90
    }

    fn cost_class(&self) -> CostClass {
        CostClass::High
    }

    fn cache_ttl(&self) -> Duration {
        // History only moves once per trading day; rank drift within the hour
        // is negligible.
        Duration::from_secs(60 * 60)
    }

    fn static_key(&self) -> u64 {
        self.key
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.min.is_nan() || self.max.is_nan() {
            return Err(ScanError::Config(
                "iv_percentile: bounds must not be NaN".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.min) || !(0.0..=100.0).contains(&self.max) {
            return Err(ScanError::Config(format!(
                "iv_percentile: bounds must lie in [0, 100], got [{}, {}]",
                self.min, self.max
            )));
        }
        if self.max < self.min {
            return Err(ScanError::Config(format!(
                "iv_percentile: max {} < min {}",
                self.max, self.min
            )));
        }
        if self.lookback_days == 0 {
            return Err(ScanError::Config(
                "iv_percentile: lookback_days must be >= 1".into(),
            ));
        }
        Ok(())
    }

    fn apply(&self, input: &[Contract], ctx: &FilterContext) -> Result<Vec<Contract>, ScanError> {
        let store = ctx
            .iv_history
            .as_ref()
            .ok_or_else(|| ScanError::Dependency("IV history source not configured".into()))?;

        let mut out = Vec::new();
        for c in input {
            let rank = store
                .percentile_rank(&c.symbol, c.implied_vol, self.lookback_days)
                .ok_or_else(|| {
                    ScanError::Dependency(format!("no IV history loaded for {}", c.symbol))
                })?;
            if in_range(rank, self.min, self.max) {
                out.push(c.clone());
            }
        }
        Ok(out)
    }
}
