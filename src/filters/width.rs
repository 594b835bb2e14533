// =============================================================================
// Spread Width filter
// =============================================================================
//
// Width is a property of a spread, not of a single contract, so this stage is
// an identity pass at the contract level; its bounds constrain the pairing
// step when spread candidates are constructed (see `spreads::build_spreads`).
// With `relative` set the bounds are fractions of the underlying price.
// =============================================================================

use std::time::Duration;

use crate::error::ScanError;
use crate::types::Contract;

use super::{FilterContext, SpreadFilter};

#[derive(Debug, Clone)]
pub struct WidthFilter {
    min: f64,
    max: f64,
    relative: bool,
    key: u64,
}

impl WidthFilter {
    pub fn new(min: f64, max: f64, relative: bool, key: u64) -> Self {
        Self {
            min,
            max,
            relative,
            key,
        }
    }

}

impl SpreadFilter for WidthFilter {
    fn name(&self) -> &'static str {
        "width"
    }

    fn priority(&self) -> u8 {
        40
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(30 * 24 * 60 * 60)
    }

    fn static_key(&self) -> u64 {
        self.key
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.min.is_nan() || self.max.is_nan() {
            return Err(ScanError::Config("width: bounds must not be NaN".into()));
        }
        if self.min < 0.0 {
            return Err(ScanError::Config(format!(
                "width: min must be >= 0, got {}",
                self.min
            )));
        }
        if self.max < self.min {
            return Err(ScanError::Config(format!(
                "width: max {} < min {}",
                self.max, self.min
            )));
        }
        if self.relative && self.max > 1.0 {
            return Err(ScanError::Config(format!(
                "width: relative bounds are fractions of the underlying, max {} > 1",
                self.max
            )));
        }
        Ok(())
    }

    fn apply(&self, input: &[Contract], _ctx: &FilterContext) -> Result<Vec<Contract>, ScanError> {
        // Contract-level identity; bounds apply at spread construction.
        Ok(input.to_vec())
    }
}
