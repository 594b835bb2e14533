// =============================================================================
// Shared types used across the SpreadScan engine
// =============================================================================
//
// Contracts are immutable once produced by the gateway; they flow by value
// through the filter chain and are discarded at end-of-tick. SpreadResults
// carry a stable id so adjacent ticks can be diffed by identity.
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// =============================================================================
// Option contracts
// =============================================================================

/// Call or put side of an option contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Put => write!(f, "put"),
        }
    }
}

/// A single option instrument at a point in time, as returned by the upstream
/// gateway. Invariants: `bid <= ask`; `expiry` is strictly in the future for
/// every contract handed to a filter chain (the engine drops violators at
/// ingestion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub right: OptionRight,

    // Quote snapshot
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub last: f64,
    #[serde(default)]
    pub volume: u64,
    #[serde(default)]
    pub open_interest: u64,

    // Greeks
    #[serde(default)]
    pub delta: f64,
    #[serde(default)]
    pub gamma: f64,
    #[serde(default)]
    pub theta: f64,
    #[serde(default)]
    pub vega: f64,

    // Derived
    #[serde(default)]
    pub implied_vol: f64,
    #[serde(default)]
    pub prob_itm: f64,
    #[serde(default)]
    pub underlying_price: f64,
}

impl Contract {
    /// Stable identifier for cache keys and dedup. Two snapshots of the same
    /// instrument at different ticks share the same id.
    pub fn contract_id(&self) -> String {
        format!(
            "{}:{}:{:.2}:{}",
            self.symbol, self.expiry, self.strike, self.right
        )
    }

    /// Whole days until expiry relative to `today` (floor semantics).
    pub fn days_to_expiry(&self, today: NaiveDate) -> i64 {
        (self.expiry - today).num_days()
    }

    /// Quote midpoint; falls back to `last` when the book is empty.
    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 || self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.last
        }
    }

    /// Absolute bid/ask spread.
    pub fn quoted_spread(&self) -> f64 {
        self.ask - self.bid
    }
}

// =============================================================================
// Vertical spreads
// =============================================================================

/// The four vertical-spread constructions the scanner emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalKind {
    /// Buy lower-strike call, sell higher-strike call (debit).
    BullCall,
    /// Sell lower-strike call, buy higher-strike call (credit).
    BearCall,
    /// Sell higher-strike put, buy lower-strike put (credit).
    BullPut,
    /// Buy higher-strike put, sell lower-strike put (debit).
    BearPut,
}

impl VerticalKind {
    pub fn right(&self) -> OptionRight {
        match self {
            Self::BullCall | Self::BearCall => OptionRight::Call,
            Self::BullPut | Self::BearPut => OptionRight::Put,
        }
    }

    /// True when the spread is opened for a net debit.
    pub fn is_debit(&self) -> bool {
        matches!(self, Self::BullCall | Self::BearPut)
    }
}

impl Default for VerticalKind {
    fn default() -> Self {
        Self::BullCall
    }
}

impl std::fmt::Display for VerticalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BullCall => write!(f, "bull_call"),
            Self::BearCall => write!(f, "bear_call"),
            Self::BullPut => write!(f, "bull_put"),
            Self::BearPut => write!(f, "bear_put"),
        }
    }
}

/// A spread candidate emitted by one scan tick. The id uniquely identifies the
/// spread across ticks; two results with the same id from adjacent ticks are
/// the same spread with refreshed metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadResult {
    pub id: String,
    pub symbol: String,
    pub expiry: NaiveDate,
    pub right: OptionRight,
    pub kind: VerticalKind,
    pub long_strike: f64,
    pub short_strike: f64,
    pub width: f64,

    // Economics
    /// Net premium: debit paid (debit spreads) or credit received (credit
    /// spreads). Always positive for sane quotes.
    pub net_price: f64,
    pub max_profit: f64,
    pub max_loss: f64,
    /// Probability of profit at expiration, approximated from leg deltas.
    pub pop: f64,

    // Net position greeks (long leg minus short leg)
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv_percentile: Option<f64>,

    // Liquidity snapshot (worst leg)
    pub volume: u64,
    pub open_interest: u64,
    pub bid_ask_spread: f64,

    pub score: f64,
}

// =============================================================================
// Sorting
// =============================================================================

/// Result sort key for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Score,
    Pop,
    NetPrice,
    MaxProfit,
    Width,
}

impl Default for SortKey {
    fn default() -> Self {
        Self::Score
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

impl Default for SortDir {
    fn default() -> Self {
        Self::Desc
    }
}

impl SortKey {
    /// Extract the sort value from a result.
    pub fn value(&self, r: &SpreadResult) -> f64 {
        match self {
            Self::Score => r.score,
            Self::Pop => r.pop,
            Self::NetPrice => r.net_price,
            Self::MaxProfit => r.max_profit,
            Self::Width => r.width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_contract() -> Contract {
        Contract {
            symbol: "SPY".into(),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
            strike: 450.0,
            right: OptionRight::Call,
            bid: 2.10,
            ask: 2.20,
            last: 2.15,
            volume: 1500,
            open_interest: 12000,
            delta: 0.32,
            gamma: 0.04,
            theta: -0.05,
            vega: 0.11,
            implied_vol: 0.22,
            prob_itm: 0.31,
            underlying_price: 440.0,
        }
    }

    #[test]
    fn contract_id_is_stable() {
        let c = sample_contract();
        assert_eq!(c.contract_id(), "SPY:2026-09-18:450.00:call");
        assert_eq!(c.contract_id(), c.clone().contract_id());
    }

    #[test]
    fn days_to_expiry_floor() {
        let c = sample_contract();
        let today = NaiveDate::from_ymd_opt(2026, 8, 19).unwrap();
        assert_eq!(c.days_to_expiry(today), 30);
    }

    #[test]
    fn mid_falls_back_to_last() {
        let mut c = sample_contract();
        assert!((c.mid() - 2.15).abs() < 1e-9);
        c.bid = 0.0;
        c.ask = 0.0;
        assert!((c.mid() - c.last).abs() < 1e-9);
    }

    #[test]
    fn vertical_kind_properties() {
        assert_eq!(VerticalKind::BullCall.right(), OptionRight::Call);
        assert_eq!(VerticalKind::BearPut.right(), OptionRight::Put);
        assert!(VerticalKind::BullCall.is_debit());
        assert!(VerticalKind::BearPut.is_debit());
        assert!(!VerticalKind::BearCall.is_debit());
        assert!(!VerticalKind::BullPut.is_debit());
    }

    #[test]
    fn right_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&OptionRight::Call).unwrap(),
            "\"call\""
        );
        assert_eq!(serde_json::to_string(&OptionRight::Put).unwrap(), "\"put\"");
    }
}
