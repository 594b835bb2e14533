// =============================================================================
// DTE filter — days-to-expiration window
// =============================================================================

use std::time::Duration;

use crate::error::ScanError;
use crate::types::Contract;

use super::{CostClass, FilterContext, SpreadFilter};

/// Keeps a contract iff `min_days <= floor((expiry - today) / 1 day) <= max_days`.
/// Both bounds inclusive.
#[derive(Debug, Clone)]
pub struct DteFilter {
    min_days: i64,
    max_days: i64,
    key: u64,
}

impl DteFilter {
    pub fn new(min_days: i64, max_days: i64, key: u64) -> Self {
        Self {
            min_days,
            max_days,
            key,
        }
    }
}

impl SpreadFilter for DteFilter {
    fn name(&self) -> &'static str {
        "dte"
    }

    fn priority(&self) -> u8 {
        20
    }

    fn cache_ttl(&self) -> Duration {
        // DTE only changes at the day boundary.
        Duration::from_secs(24 * 60 * 60)
    }

    fn static_key(&self) -> u64 {
        self.key
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.min_days < 0 {
            return Err(ScanError::Config(format!(
                "dte: min_days must be >= 0, got {}",
                self.min_days
            )));
        }
        if self.max_days < self.min_days {
            return Err(ScanError::Config(format!(
                "dte: max_days {} < min_days {}",
                self.max_days, self.min_days
            )));
        }
        Ok(())
    }

    fn apply(&self, input: &[Contract], ctx: &FilterContext) -> Result<Vec<Contract>, ScanError> {
        Ok(input
            .iter()
            .filter(|c| {
                let dte = c.days_to_expiry(ctx.today);
                dte >= self.min_days && dte <= self.max_days
            })
            .cloned()
            .collect())
    }

    fn cost_class(&self) -> CostClass {
        CostClass::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OptionRight;
    use chrono::NaiveDate;

    fn contract_expiring(expiry: NaiveDate) -> Contract {
        Contract {
            symbol: "SPY".into(),
            expiry,
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
            prob_itm: 0.3,
            underlying_price: 440.0,
        }
    }

    fn ctx(today: NaiveDate) -> FilterContext {
        FilterContext::new(today, None)
    }

    #[test]
    fn boundary_days_are_inclusive() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let f = DteFilter::new(30, 60, 0);

        let at_30 = contract_expiring(today + chrono::Duration::days(30));
        let at_60 = contract_expiring(today + chrono::Duration::days(60));
        let at_29 = contract_expiring(today + chrono::Duration::days(29));
        let at_61 = contract_expiring(today + chrono::Duration::days(61));

        let out = f
            .apply(&[at_30, at_60, at_29, at_61], &ctx(today))
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|c| { (30..=60).contains(&c.days_to_expiry(today)) }));
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(DteFilter::new(60, 30, 0).validate().is_err());
        assert!(DteFilter::new(-1, 30, 0).validate().is_err());
        assert!(DteFilter::new(0, 0, 0).validate().is_ok());
    }
}
