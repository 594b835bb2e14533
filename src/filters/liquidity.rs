// =============================================================================
// Liquidity filter
// =============================================================================

use std::time::Duration;

use crate::error::ScanError;
use crate::types::Contract;

use super::{FilterContext, SpreadFilter};

/// Keeps a contract iff
/// `(volume >= min_volume || open_interest >= min_open_interest) && (ask - bid) <= max_spread`.
///
/// The most selective filter on real chains; the optimizer's default
/// priority puts it first unless observed stats say otherwise.
#[derive(Debug, Clone)]
pub struct LiquidityFilter {
    min_volume: u64,
    min_open_interest: u64,
    max_spread: f64,
    key: u64,
}

impl LiquidityFilter {
    pub fn new(min_volume: u64, min_open_interest: u64, max_spread: f64, key: u64) -> Self {
        Self {
            min_volume,
            min_open_interest,
            max_spread,
            key,
        }
    }
}

impl SpreadFilter for LiquidityFilter {
    fn name(&self) -> &'static str {
        "liquidity"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn cache_ttl(&self) -> Duration {
        // Quotes move fast; keep the floor tight.
        Duration::from_secs(60)
    }

    fn static_key(&self) -> u64 {
        self.key
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.max_spread.is_nan() || self.max_spread < 0.0 {
            return Err(ScanError::Config(format!(
                "liquidity: max_spread must be >= 0, got {}",
                self.max_spread
            )));
        }
        Ok(())
    }

    fn apply(&self, input: &[Contract], _ctx: &FilterContext) -> Result<Vec<Contract>, ScanError> {
        Ok(input
            .iter()
            .filter(|c| {
                let active = c.volume >= self.min_volume || c.open_interest >= self.min_open_interest;
                let spread = c.quoted_spread();
                active && !spread.is_nan() && spread <= self.max_spread
            })
            .cloned()
            .collect())
    }
}
