// =============================================================================
// Delta filter
// =============================================================================

use std::time::Duration;

use crate::error::ScanError;
use crate::types::{Contract, OptionRight};

use super::{in_range, FilterContext, SpreadFilter};

/// Keeps a contract iff `min <= delta <= max`. With `use_absolute`, put deltas
/// are compared by magnitude so one config can cover both rights.
#[derive(Debug, Clone)]
pub struct DeltaFilter {
    min: f64,
    max: f64,
    use_absolute: bool,
    key: u64,
}

impl DeltaFilter {
    pub fn new(min: f64, max: f64, use_absolute: bool, key: u64) -> Self {
        Self {
            min,
            max,
            use_absolute,
            key,
        }
    }
}

impl SpreadFilter for DeltaFilter {
    fn name(&self) -> &'static str {
        "delta"
    }

    fn priority(&self) -> u8 {
        50
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn static_key(&self) -> u64 {
        self.key
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.min.is_nan() || self.max.is_nan() {
            return Err(ScanError::Config("delta: bounds must not be NaN".into()));
        }
        if self.max < self.min {
            return Err(ScanError::Config(format!(
                "delta: max {} < min {}",
                self.max, self.min
            )));
        }
        Ok(())
    }

    fn apply(&self, input: &[Contract], _ctx: &FilterContext) -> Result<Vec<Contract>, ScanError> {
        Ok(input
            .iter()
            .filter(|c| {
                let d = if self.use_absolute && c.right == OptionRight::Put {
                    c.delta.abs()
                } else {
                    c.delta
                };
                in_range(d, self.min, self.max)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn contract(right: OptionRight, delta: f64) -> Contract {
        Contract {
            symbol: "SPY".into(),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
            strike: 450.0,
            right,
            bid: 1.0,
            ask: 1.1,
            last: 1.05,
            volume: 100,
            open_interest: 100,
            delta,
            gamma: 0.02,
            theta: -0.03,
            vega: 0.1,
            implied_vol: 0.2,
            prob_itm: 0.3,
            underlying_price: 440.0,
        }
    }

    fn ctx() -> FilterContext {
        FilterContext::new(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(), None)
    }

    #[test]
    fn keeps_in_range_inclusive() {
        let f = DeltaFilter::new(0.25, 0.35, false, 0);
        let input = vec![
            contract(OptionRight::Call, 0.25),
            contract(OptionRight::Call, 0.30),
            contract(OptionRight::Call, 0.35),
            contract(OptionRight::Call, 0.36),
            contract(OptionRight::Call, 0.24),
        ];
        let out = f.apply(&input, &ctx()).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn absolute_mode_covers_puts() {
        let f = DeltaFilter::new(0.25, 0.35, true, 0);
        let input = vec![
            contract(OptionRight::Put, -0.30),
            contract(OptionRight::Put, -0.50),
            contract(OptionRight::Call, 0.30),
        ];
        let out = f.apply(&input, &ctx()).unwrap();
        assert_eq!(out.len(), 2);

        // Without the flag, a negative put delta falls outside a positive range.
        let strict = DeltaFilter::new(0.25, 0.35, false, 0);
        let out = strict
            .apply(&[contract(OptionRight::Put, -0.30)], &ctx())
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn nan_delta_is_dropped() {
        let f = DeltaFilter::new(-1.0, 1.0, false, 0);
        let out = f
            .apply(&[contract(OptionRight::Call, f64::NAN)], &ctx())
            .unwrap();
        assert!(out.is_empty());
    }
}
