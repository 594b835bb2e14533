// =============================================================================
// Probability filter
// =============================================================================

use std::time::Duration;

use crate::error::ScanError;
use crate::types::Contract;

use super::{in_range, FilterContext, SpreadFilter};

/// Keeps contracts whose probability-in-the-money lies in `[min, max]`.
/// Probabilities are fractions in [0, 1].
#[derive(Debug, Clone)]
pub struct ProbabilityFilter {
    min: f64,
    max: f64,
    key: u64,
}

impl ProbabilityFilter {
    pub fn new(min: f64, max: f64, key: u64) -> Self {
        Self { min, max, key }
    }
}

impl SpreadFilter for ProbabilityFilter {
    fn name(&self) -> &'static str {
        "probability"
    }

    fn priority(&self) -> u8 {
        70
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn static_key(&self) -> u64 {
        self.key
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.min.is_nan() || self.max.is_nan() {
            return Err(ScanError::Config(
                "probability: bounds must not be NaN".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min) || !(0.0..=1.0).contains(&self.max) {
            return Err(ScanError::Config(format!(
                "probability: bounds must lie in [0, 1], got [{}, {}]",
                self.min, self.max
            )));
        }
        if self.max < self.min {
            return Err(ScanError::Config(format!(
                "probability: max {} < min {}",
                self.max, self.min
            )));
        }
        Ok(())
    }

    fn apply(&self, input: &[Contract], _ctx: &FilterContext) -> Result<Vec<Contract>, ScanError> {
        Ok(input
            .iter()
            .filter(|c| in_range(c.prob_itm, self.min, self.max))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OptionRight;
    use chrono::NaiveDate;

    fn contract(prob: f64) -> Contract {
        Contract {
            symbol: "SPY".into(),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
            strike: 450.0,
            right: OptionRight::Call,
            bid: 1.0,
            ask: 1.1,
            last: 1.05,
            volume: 100,
            open_interest: 100,
            delta: 0.3,
            gamma: 0.02,
            theta: -0.03,
            vega: 0.1,
            implied_vol: 0.2,
            prob_itm: prob,
            underlying_price: 440.0,
        }
    }

    #[test]
    fn keeps_in_window() {
        let f = ProbabilityFilter::new(0.2, 0.4, 0);
        let ctx = FilterContext::new(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(), None);
        let out = f
            .apply(
                &[contract(0.2), contract(0.3), contract(0.4), contract(0.41)],
                &ctx,
            )
            .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn bounds_must_be_probabilities() {
        assert!(ProbabilityFilter::new(0.0, 1.1, 0).validate().is_err());
        assert!(ProbabilityFilter::new(-0.1, 0.5, 0).validate().is_err());
        assert!(ProbabilityFilter::new(0.6, 0.4, 0).validate().is_err());
        assert!(ProbabilityFilter::new(0.2, 0.8, 0).validate().is_ok());
    }
}
