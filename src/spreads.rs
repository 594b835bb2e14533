// =============================================================================
// Vertical-spread construction and scoring
// =============================================================================
//
// Deterministic transform from a filtered contract batch to spread
// candidates: contracts are grouped by (symbol, expiry) on the scan's right,
// strikes are paired long/short per the vertical kind, and pair width is
// constrained by the scan's width bounds. The same inputs always produce the
// same candidates in the same pre-sort order.
// =============================================================================

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::iv_history::IvHistoryStore;
use crate::types::{Contract, SortDir, SortKey, SpreadResult, VerticalKind};

/// Guard against division by a vanishing max-loss.
const LOSS_EPSILON: f64 = 1e-6;

/// Reward-to-risk ratio cap used by the published score.
const SCORE_RATIO_CAP: f64 = 4.0;

/// Width bounds applied while pairing strikes. With `relative` set the
/// bounds are fractions of the underlying price.
#[derive(Debug, Clone, Copy)]
pub struct WidthBounds {
    pub min: f64,
    pub max: f64,
    pub relative: bool,
}

impl Default for WidthBounds {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: f64::INFINITY,
            relative: false,
        }
    }
}

impl WidthBounds {
    pub fn from_config(bounds: Option<(f64, f64, bool)>) -> Self {
        match bounds {
            Some((min, max, relative)) => Self { min, max, relative },
            None => Self::default(),
        }
    }

    fn accepts(&self, width: f64, underlying: f64) -> bool {
        let (min, max) = if self.relative && underlying > 0.0 {
            (self.min * underlying, self.max * underlying)
        } else if self.relative {
            // Relative bounds without a price are unusable; accept nothing.
            return false;
        } else {
            (self.min, self.max)
        };
        width >= min && width <= max
    }
}

/// Build every vertical spread of `kind` expressible over `contracts`.
///
/// Pairing is a constrained Cartesian combination: same symbol, same expiry,
/// same right, distinct strikes, width inside `bounds`. Output order is
/// deterministic (symbol, expiry, then ascending strike pairs).
pub fn build_spreads(
    contracts: &[Contract],
    kind: VerticalKind,
    bounds: WidthBounds,
    iv_lookup: Option<(&IvHistoryStore, usize)>,
) -> Vec<SpreadResult> {
    let right = kind.right();

    // Group on the scan's right by (symbol, expiry); BTreeMap keeps the
    // output deterministic.
    let mut groups: BTreeMap<(String, NaiveDate), Vec<&Contract>> = BTreeMap::new();
    for c in contracts.iter().filter(|c| c.right == right) {
        groups
            .entry((c.symbol.clone(), c.expiry))
            .or_default()
            .push(c);
    }

    let mut results = Vec::new();
    for legs in groups.values_mut() {
        legs.sort_by(|a, b| a.strike.total_cmp(&b.strike));

        for i in 0..legs.len() {
            for j in (i + 1)..legs.len() {
                let lower = legs[i];
                let upper = legs[j];
                if lower.strike == upper.strike {
                    continue;
                }

                let width = upper.strike - lower.strike;
                if !bounds.accepts(width, lower.underlying_price) {
                    continue;
                }

                let (long, short) = assign_legs(kind, lower, upper);
                if let Some(result) = spread_result(kind, long, short, width, iv_lookup) {
                    results.push(result);
                }
            }
        }
    }

    results
}

/// Long/short leg assignment per vertical kind.
fn assign_legs<'a>(
    kind: VerticalKind,
    lower: &'a Contract,
    upper: &'a Contract,
) -> (&'a Contract, &'a Contract) {
    match kind {
        // Buy lower call, sell higher call.
        VerticalKind::BullCall => (lower, upper),
        // Sell lower call, buy higher call.
        VerticalKind::BearCall => (upper, lower),
        // Sell higher put, buy lower put.
        VerticalKind::BullPut => (lower, upper),
        // Buy higher put, sell lower put.
        VerticalKind::BearPut => (upper, lower),
    }
}

fn spread_result(
    kind: VerticalKind,
    long: &Contract,
    short: &Contract,
    width: f64,
    iv_lookup: Option<(&IvHistoryStore, usize)>,
) -> Option<SpreadResult> {
    // Net premium: positive debit for debit spreads, positive credit for
    // credit spreads. Degenerate quotes produce inverted premiums; drop them.
    let net_price = if kind.is_debit() {
        long.mid() - short.mid()
    } else {
        short.mid() - long.mid()
    };
    if !net_price.is_finite() || net_price <= 0.0 || net_price >= width {
        return None;
    }

    let (max_profit, max_loss) = if kind.is_debit() {
        (width - net_price, net_price)
    } else {
        (net_price, width - net_price)
    };

    let pop = probability_of_profit(kind, long, short);
    if !pop.is_finite() {
        return None;
    }

    let iv_percentile = iv_lookup.and_then(|(store, lookback)| {
        store.percentile_rank(&long.symbol, long.implied_vol, lookback)
    });

    Some(SpreadResult {
        id: spread_id(long, short),
        symbol: long.symbol.clone(),
        expiry: long.expiry,
        right: long.right,
        kind,
        long_strike: long.strike,
        short_strike: short.strike,
        width,
        net_price,
        max_profit,
        max_loss,
        pop,
        delta: long.delta - short.delta,
        gamma: long.gamma - short.gamma,
        theta: long.theta - short.theta,
        vega: long.vega - short.vega,
        iv_percentile,
        volume: long.volume.min(short.volume),
        open_interest: long.open_interest.min(short.open_interest),
        bid_ask_spread: long.quoted_spread().max(short.quoted_spread()),
        score: score_spread(pop, max_profit, max_loss),
    })
}

/// Stable result id: `symbol:expiry:long_strike:short_strike:right`.
/// Identical across ticks for the same spread.
pub fn spread_id(long: &Contract, short: &Contract) -> String {
    format!(
        "{}:{}:{:.2}:{:.2}:{}",
        long.symbol, long.expiry, long.strike, short.strike, long.right
    )
}

/// Probability of profit at expiration, approximated from leg deltas:
/// credit spreads use the chance the short strike expires worthless
/// (`1 - |delta_short|`); debit spreads use the midpoint of the leg deltas
/// as a breakeven proxy. Clamped to [0, 1].
fn probability_of_profit(kind: VerticalKind, long: &Contract, short: &Contract) -> f64 {
    let p = if kind.is_debit() {
        (long.delta.abs() + short.delta.abs()) / 2.0
    } else {
        1.0 - short.delta.abs()
    };
    p.clamp(0.0, 1.0)
}

/// Published result score: probability of profit weighted by the
/// reward-to-risk ratio, with the ratio capped at 4:1 so deep-OTM lottery
/// spreads do not dominate. Scaled to [0, 100].
pub fn score_spread(pop: f64, max_profit: f64, max_loss: f64) -> f64 {
    let ratio = (max_profit / max_loss.max(LOSS_EPSILON)).min(SCORE_RATIO_CAP);
    (pop * ratio * 25.0).clamp(0.0, 100.0)
}

/// Sort results by the scan's key and direction; ties break on id so the
/// order is total and stable across ticks. NaN keys rank below every finite
/// value.
pub fn sort_results(results: &mut [SpreadResult], key: SortKey, dir: SortDir) {
    results.sort_by(|a, b| {
        let (va, vb) = (norm(key.value(a)), norm(key.value(b)));
        let ord = match dir {
            SortDir::Asc => va.total_cmp(&vb),
            SortDir::Desc => vb.total_cmp(&va),
        };
        ord.then_with(|| a.id.cmp(&b.id))
    });
}

fn norm(v: f64) -> f64 {
    if v.is_nan() {
        f64::NEG_INFINITY
    } else {
        v
    }
}
