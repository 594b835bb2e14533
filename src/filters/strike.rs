// =============================================================================
// Strike filter
// =============================================================================

use std::time::Duration;

use crate::error::ScanError;
use crate::types::Contract;

use super::{in_range, FilterContext, SpreadFilter};

/// Keeps contracts with `min <= strike <= max`. Strikes are static for the
/// life of a contract, so cached output stays valid until expiry.
#[derive(Debug, Clone)]
pub struct StrikeFilter {
    min: f64,
    max: f64,
    key: u64,
}

impl StrikeFilter {
    pub fn new(min: f64, max: f64, key: u64) -> Self {
        Self { min, max, key }
    }
}

impl SpreadFilter for StrikeFilter {
    fn name(&self) -> &'static str {
        "strike"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn cache_ttl(&self) -> Duration {
        // Strike membership never changes; effectively until expiry.
        Duration::from_secs(30 * 24 * 60 * 60)
    }

    fn static_key(&self) -> u64 {
        self.key
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.min.is_nan() || self.max.is_nan() {
            return Err(ScanError::Config("strike: bounds must not be NaN".into()));
        }
        if self.min < 0.0 {
            return Err(ScanError::Config(format!(
                "strike: min must be >= 0, got {}",
                self.min
            )));
        }
        if self.max < self.min {
            return Err(ScanError::Config(format!(
                "strike: max {} < min {}",
                self.max, self.min
            )));
        }
        Ok(())
    }

    fn apply(&self, input: &[Contract], _ctx: &FilterContext) -> Result<Vec<Contract>, ScanError> {
        Ok(input
            .iter()
            .filter(|c| in_range(c.strike, self.min, self.max))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OptionRight;
    use chrono::NaiveDate;

    fn contract(strike: f64) -> Contract {
        Contract {
            symbol: "SPY".into(),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
            strike,
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
            prob_itm: 0.3,
            underlying_price: 440.0,
        }
    }

    #[test]
    fn inclusive_range() {
        let f = StrikeFilter::new(400.0, 450.0, 0);
        let ctx = FilterContext::new(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(), None);
        let out = f
            .apply(
                &[
                    contract(400.0),
                    contract(425.0),
                    contract(450.0),
                    contract(399.99),
                    contract(450.01),
                ],
                &ctx,
            )
            .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!(StrikeFilter::new(450.0, 400.0, 0).validate().is_err());
        assert!(StrikeFilter::new(-1.0, 400.0, 0).validate().is_err());
    }
}
