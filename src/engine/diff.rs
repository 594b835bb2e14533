// =============================================================================
// Result-set diffing between adjacent ticks
// =============================================================================
//
// Results are compared by stable id. A result is "changed" when any price
// metric, any net greek, or the score moved beyond its epsilon threshold;
// quote jitter below the thresholds emits nothing. Applying (removed,
// changed, added) to the previous set must reproduce the next set exactly.
// =============================================================================

use std::collections::HashMap;

use crate::types::SpreadResult;

/// Change-detection thresholds for the tick diff.
#[derive(Debug, Clone, Copy)]
pub struct EpsThresholds {
    pub price: f64,
    pub greeks: f64,
    pub score: f64,
}

impl Default for EpsThresholds {
    fn default() -> Self {
        Self {
            price: 0.01,
            greeks: 0.001,
            score: 0.5,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResultDiff {
    pub added: Vec<SpreadResult>,
    pub removed: Vec<SpreadResult>,
    pub changed: Vec<SpreadResult>,
}

impl ResultDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Diff `next` (this tick's sorted results) against `prev` (previous tick,
/// keyed by id). `added` and `changed` preserve `next`'s order; `removed` is
/// ordered by id for determinism.
pub fn diff_results(
    prev: &HashMap<String, SpreadResult>,
    next: &[SpreadResult],
    eps: &EpsThresholds,
) -> ResultDiff {
    let mut diff = ResultDiff::default();

    for result in next {
        match prev.get(&result.id) {
            None => diff.added.push(result.clone()),
            Some(old) if metrics_changed(old, result, eps) => diff.changed.push(result.clone()),
            Some(_) => {}
        }
    }

    let next_ids: HashMap<&str, ()> = next.iter().map(|r| (r.id.as_str(), ())).collect();
    let mut removed: Vec<&SpreadResult> = prev
        .values()
        .filter(|r| !next_ids.contains_key(r.id.as_str()))
        .collect();
    removed.sort_by(|a, b| a.id.cmp(&b.id));
    diff.removed = removed.into_iter().cloned().collect();

    diff
}

fn metrics_changed(old: &SpreadResult, new: &SpreadResult, eps: &EpsThresholds) -> bool {
    let price_moved = (old.net_price - new.net_price).abs() > eps.price
        || (old.max_profit - new.max_profit).abs() > eps.price
        || (old.max_loss - new.max_loss).abs() > eps.price
        || (old.bid_ask_spread - new.bid_ask_spread).abs() > eps.price;

    let greeks_moved = (old.delta - new.delta).abs() > eps.greeks
        || (old.gamma - new.gamma).abs() > eps.greeks
        || (old.theta - new.theta).abs() > eps.greeks
        || (old.vega - new.vega).abs() > eps.greeks;

    let score_moved = (old.score - new.score).abs() > eps.score;

    price_moved || greeks_moved || score_moved
}
