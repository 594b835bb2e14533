// =============================================================================
// Greeks composite filter
// =============================================================================

use std::time::Duration;

use crate::error::ScanError;
use crate::types::Contract;

use super::{FilterContext, SpreadFilter, RATIO_EPSILON};

/// Composite bound check over gamma, theta, and vega, with an optional
/// |theta/gamma| ratio floor. Any unset bound is not enforced. NaN in a
/// checked greek drops the contract.
#[derive(Debug, Clone)]
pub struct GreeksFilter {
    max_gamma: Option<f64>,
    min_theta: Option<f64>,
    max_vega: Option<f64>,
    theta_gamma_ratio: Option<f64>,
    key: u64,
}

impl GreeksFilter {
    pub fn new(
        max_gamma: Option<f64>,
        min_theta: Option<f64>,
        max_vega: Option<f64>,
        theta_gamma_ratio: Option<f64>,
        key: u64,
    ) -> Self {
        Self {
            max_gamma,
            min_theta,
            max_vega,
            theta_gamma_ratio,
            key,
        }
    }

    fn keeps(&self, c: &Contract) -> bool {
        if let Some(max_gamma) = self.max_gamma {
            if c.gamma.is_nan() || c.gamma > max_gamma {
                return false;
            }
        }
        if let Some(min_theta) = self.min_theta {
            if c.theta.is_nan() || c.theta < min_theta {
                return false;
            }
        }
        if let Some(max_vega) = self.max_vega {
            if c.vega.is_nan() || c.vega > max_vega {
                return false;
            }
        }
        if let Some(ratio) = self.theta_gamma_ratio {
            // Ratio constraint only applies when gamma is meaningfully nonzero.
            if c.gamma.abs() > RATIO_EPSILON {
                let observed = (c.theta / c.gamma).abs();
                if observed.is_nan() || observed < ratio {
                    return false;
                }
            }
        }
        true
    }
}

impl SpreadFilter for GreeksFilter {
    fn name(&self) -> &'static str {
        "greeks"
    }

    fn priority(&self) -> u8 {
        60
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn static_key(&self) -> u64 {
        self.key
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.max_gamma.is_none()
            && self.min_theta.is_none()
            && self.max_vega.is_none()
            && self.theta_gamma_ratio.is_none()
        {
            return Err(ScanError::Config(
                "greeks: at least one bound must be set".into(),
            ));
        }
        for (label, v) in [
            ("max_gamma", self.max_gamma),
            ("min_theta", self.min_theta),
            ("max_vega", self.max_vega),
            ("theta_gamma_ratio", self.theta_gamma_ratio),
        ] {
            if v.is_some_and(f64::is_nan) {
                return Err(ScanError::Config(format!("greeks: {label} must not be NaN")));
            }
        }
        if self.theta_gamma_ratio.is_some_and(|r| r < 0.0) {
            return Err(ScanError::Config(
                "greeks: theta_gamma_ratio must be >= 0".into(),
            ));
        }
        Ok(())
    }

    fn apply(&self, input: &[Contract], _ctx: &FilterContext) -> Result<Vec<Contract>, ScanError> {
        Ok(input.iter().filter(|c| self.keeps(c)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OptionRight;
    use chrono::NaiveDate;

    fn contract(gamma: f64, theta: f64, vega: f64) -> Contract {
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
            gamma,
            theta,
            vega,
            implied_vol: 0.2,
            prob_itm: 0.3,
            underlying_price: 440.0,
        }
    }

    fn ctx() -> FilterContext {
        FilterContext::new(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(), None)
    }

    #[test]
    fn bounds_are_inclusive() {
        let f = GreeksFilter::new(Some(0.05), Some(-0.10), Some(0.20), None, 0);
        let keep = contract(0.05, -0.10, 0.20);
        let drop_gamma = contract(0.051, -0.10, 0.20);
        let drop_theta = contract(0.05, -0.11, 0.20);
        let drop_vega = contract(0.05, -0.10, 0.21);

        let out = f
            .apply(&[keep, drop_gamma, drop_theta, drop_vega], &ctx())
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn ratio_only_enforced_for_nonzero_gamma() {
        let f = GreeksFilter::new(None, None, None, Some(2.0), 0);

        // |theta/gamma| = 3 passes, 1 fails.
        let pass = contract(0.01, -0.03, 0.1);
        let fail = contract(0.03, -0.03, 0.1);
        // Zero gamma bypasses the ratio check entirely.
        let zero_gamma = contract(0.0, -0.0001, 0.1);

        let out = f.apply(&[pass, fail, zero_gamma], &ctx()).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn nan_greek_drops_contract() {
        let f = GreeksFilter::new(Some(0.05), None, None, None, 0);
        let out = f.apply(&[contract(f64::NAN, -0.1, 0.1)], &ctx()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn all_unset_is_config_error() {
        let f = GreeksFilter::new(None, None, None, None, 0);
        assert!(matches!(f.validate(), Err(ScanError::Config(_))));
    }
}
