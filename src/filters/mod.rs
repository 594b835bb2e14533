// =============================================================================
// Filter contract and config decoding
// =============================================================================
//
// Each concrete filter is a value type holding only its parameters and
// implementing `SpreadFilter`. User JSON becomes a filter in exactly one
// place: `FilterConfig::build`, called by the chain constructor after
// validation. Filters are pure over a contract batch, never mutate their
// input, and fail only with Config (at validation) or Dependency (at runtime).
// =============================================================================

pub mod delta;
pub mod dte;
pub mod greeks;
pub mod iv_percentile;
pub mod liquidity;
pub mod probability;
pub mod strike;
pub mod width;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::iv_history::IvHistoryStore;
use crate::types::Contract;

/// Division guard for ratio predicates.
pub const RATIO_EPSILON: f64 = 1e-9;

/// Relative execution cost of a filter, used by the skip heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostClass {
    Low,
    High,
}

/// Per-tick context handed to every filter invocation.
pub struct FilterContext {
    /// Trading date the tick runs under; DTE arithmetic keys off this.
    pub today: NaiveDate,
    /// Historical-IV store for the IV percentile filter; `None` when the
    /// source is not configured.
    pub iv_history: Option<Arc<IvHistoryStore>>,
}

impl FilterContext {
    pub fn new(today: NaiveDate, iv_history: Option<Arc<IvHistoryStore>>) -> Self {
        Self { today, iv_history }
    }
}

/// The filter capability set. `apply` keeps a contract iff all of the
/// filter's predicates hold; output is always a sub-multiset of the input.
pub trait SpreadFilter: Send + Sync {
    /// Stable identifier used as a cache-key prefix and stats key.
    fn name(&self) -> &'static str;

    /// Default ordering hint; lower runs earlier. Only consulted while the
    /// optimizer lacks observed stats.
    fn priority(&self) -> u8;

    fn cost_class(&self) -> CostClass {
        CostClass::Low
    }

    /// Order-dependent filters are never moved by the optimizer.
    fn order_dependent(&self) -> bool {
        false
    }

    /// TTL floor for this filter's cached outputs.
    fn cache_ttl(&self) -> Duration;

    /// Deterministic hash of the filter's parameters; identical configs
    /// produce identical keys.
    fn static_key(&self) -> u64;

    fn validate(&self) -> Result<(), ScanError>;

    fn apply(&self, input: &[Contract], ctx: &FilterContext) -> Result<Vec<Contract>, ScanError>;
}

/// Inclusive range check that fails on NaN (NaN greeks drop the contract).
pub(crate) fn in_range(v: f64, min: f64, max: f64) -> bool {
    !v.is_nan() && v >= min && v <= max
}

// =============================================================================
// FilterConfig — tagged variants, one per filter kind
// =============================================================================

/// User-supplied filter configuration. The serde tag is the wire `kind`
/// field, e.g. `{"kind":"dte","min_days":30,"max_days":60}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterConfig {
    Dte {
        min_days: i64,
        max_days: i64,
    },
    Delta {
        min: f64,
        max: f64,
        #[serde(default)]
        use_absolute: bool,
    },
    Greeks {
        #[serde(default)]
        max_gamma: Option<f64>,
        #[serde(default)]
        min_theta: Option<f64>,
        #[serde(default)]
        max_vega: Option<f64>,
        #[serde(default)]
        theta_gamma_ratio: Option<f64>,
    },
    Liquidity {
        min_volume: u64,
        min_open_interest: u64,
        max_spread: f64,
    },
    IvPercentile {
        min: f64,
        max: f64,
        lookback_days: usize,
    },
    Strike {
        min: f64,
        max: f64,
    },
    Width {
        min: f64,
        max: f64,
        #[serde(default)]
        relative: bool,
    },
    Probability {
        min: f64,
        max: f64,
    },
}

impl FilterConfig {
    /// Wire name of the variant; matches `SpreadFilter::name` of the built
    /// filter.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Dte { .. } => "dte",
            Self::Delta { .. } => "delta",
            Self::Greeks { .. } => "greeks",
            Self::Liquidity { .. } => "liquidity",
            Self::IvPercentile { .. } => "iv_percentile",
            Self::Strike { .. } => "strike",
            Self::Width { .. } => "width",
            Self::Probability { .. } => "probability",
        }
    }

    /// Deterministic parameter hash. Identical configs hash identically; the
    /// chain uses this for cache keys and for invalidation on filter updates.
    pub fn static_key(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.kind_name().hash(&mut h);
        serde_json::to_string(self)
            .expect("FilterConfig serialisation is infallible")
            .hash(&mut h);
        h.finish()
    }

    /// Validate parameters and construct the filter value. The only place
    /// user config becomes an executable filter.
    pub fn build(&self) -> Result<Box<dyn SpreadFilter>, ScanError> {
        let key = self.static_key();
        let filter: Box<dyn SpreadFilter> = match self.clone() {
            Self::Dte { min_days, max_days } => Box::new(dte::DteFilter::new(min_days, max_days, key)),
            Self::Delta {
                min,
                max,
                use_absolute,
            } => Box::new(delta::DeltaFilter::new(min, max, use_absolute, key)),
            Self::Greeks {
                max_gamma,
                min_theta,
                max_vega,
                theta_gamma_ratio,
            } => Box::new(greeks::GreeksFilter::new(
                max_gamma,
                min_theta,
                max_vega,
                theta_gamma_ratio,
                key,
            )),
            Self::Liquidity {
                min_volume,
                min_open_interest,
                max_spread,
            } => Box::new(liquidity::LiquidityFilter::new(
                min_volume,
                min_open_interest,
                max_spread,
                key,
            )),
            Self::IvPercentile {
                min,
                max,
                lookback_days,
            } => Box::new(iv_percentile::IvPercentileFilter::new(
                min,
                max,
                lookback_days,
                key,
            )),
            Self::Strike { min, max } => Box::new(strike::StrikeFilter::new(min, max, key)),
            Self::Width { min, max, relative } => {
                Box::new(width::WidthFilter::new(min, max, relative, key))
            }
            Self::Probability { min, max } => {
                Box::new(probability::ProbabilityFilter::new(min, max, key))
            }
        };
        filter.validate()?;
        Ok(filter)
    }

    /// Spread-width bounds, when this config carries them. Consumed by the
    /// spread constructor rather than the contract-level chain.
    pub fn width_bounds(&self) -> Option<(f64, f64, bool)> {
        match self {
            Self::Width { min, max, relative } => Some((*min, *max, *relative)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_key_deterministic_and_parameter_sensitive() {
        let a = FilterConfig::Dte {
            min_days: 30,
            max_days: 60,
        };
        let b = FilterConfig::Dte {
            min_days: 30,
            max_days: 60,
        };
        let c = FilterConfig::Dte {
            min_days: 30,
            max_days: 61,
        };
        assert_eq!(a.static_key(), b.static_key());
        assert_ne!(a.static_key(), c.static_key());
    }

    #[test]
    fn kinds_differ_even_with_same_params() {
        let strike = FilterConfig::Strike { min: 1.0, max: 2.0 };
        let prob = FilterConfig::Probability { min: 1.0, max: 2.0 };
        assert_ne!(strike.static_key(), prob.static_key());
    }

    #[test]
    fn wire_format_uses_kind_tag() {
        let cfg = FilterConfig::Delta {
            min: 0.25,
            max: 0.35,
            use_absolute: true,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"kind\":\"delta\""));

        let parsed: FilterConfig =
            serde_json::from_str(r#"{"kind":"dte","min_days":30,"max_days":60}"#).unwrap();
        assert_eq!(
            parsed,
            FilterConfig::Dte {
                min_days: 30,
                max_days: 60
            }
        );
    }

    #[test]
    fn build_rejects_nonsense_ranges() {
        let bad = FilterConfig::Delta {
            min: 0.5,
            max: 0.2,
            use_absolute: false,
        };
        assert!(matches!(bad.build(), Err(ScanError::Config(_))));
    }

    #[test]
    fn in_range_drops_nan() {
        assert!(in_range(0.5, 0.0, 1.0));
        assert!(in_range(0.0, 0.0, 1.0)); // inclusive bounds
        assert!(in_range(1.0, 0.0, 1.0));
        assert!(!in_range(f64::NAN, 0.0, 1.0));
        assert!(!in_range(1.1, 0.0, 1.0));
    }
}
