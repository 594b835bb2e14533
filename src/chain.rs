// =============================================================================
// Filter Chain Executor — ordered filters, stage cache, adaptive reordering
// =============================================================================
//
// One executor per scan, driven only by that scan's tick task, so no internal
// locking. The executor owns:
//   - per-filter rolling stats (EWMA selectivity and cost, run counter),
//   - a bounded LRU cache of stage outputs keyed by filter identity plus a
//     rolling digest of the first few input contract ids,
//   - the reordering and skip heuristics.
//
// A filter failing with Dependency is downgraded to pass-through for the tick
// and recorded as a warning on the outcome; Config failures cannot reach
// apply because the chain constructor validates every filter.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ScanError;
use crate::filters::{CostClass, FilterConfig, FilterContext, SpreadFilter};
use crate::types::Contract;

/// EWMA smoothing factor for selectivity and cost updates.
const EWMA_ALPHA: f64 = 0.2;

/// Contract-count floor below which high-cost filters may be skipped.
const SKIP_SMALL_INPUT: usize = 100;

/// Selectivity at or above which a late-chain filter retains nearly
/// everything and may be skipped.
const SKIP_SELECTIVITY: f64 = 0.9;

/// Number of leading contract ids folded into a stage cache key.
const CACHE_KEY_IDS: usize = 10;

// =============================================================================
// Filter stats
// =============================================================================

/// Rolling per-filter statistics read by the optimizer.
#[derive(Debug, Clone, Serialize)]
pub struct FilterStats {
    /// EWMA of output/input ratio; lower is more selective.
    pub selectivity: f64,
    /// EWMA of execution time per input contract, in microseconds.
    pub cost_per_contract_us: f64,
    pub runs: u64,
    /// Input size of the most recent non-cached invocation.
    pub last_input: usize,
}

impl FilterStats {
    fn new() -> Self {
        Self {
            selectivity: 1.0,
            cost_per_contract_us: 0.0,
            runs: 0,
            last_input: 0,
        }
    }

    fn update(&mut self, selectivity: f64, cost_per_contract_us: f64, input_len: usize) {
        if self.runs == 0 {
            self.selectivity = selectivity;
            self.cost_per_contract_us = cost_per_contract_us;
        } else {
            self.selectivity = EWMA_ALPHA * selectivity + (1.0 - EWMA_ALPHA) * self.selectivity;
            self.cost_per_contract_us =
                EWMA_ALPHA * cost_per_contract_us + (1.0 - EWMA_ALPHA) * self.cost_per_contract_us;
        }
        self.runs += 1;
        self.last_input = input_len;
    }
}

/// Serialisable stats row for status events and the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct FilterStatsSnapshot {
    pub name: &'static str,
    pub selectivity: f64,
    pub cost_per_contract_us: f64,
    pub runs: u64,
}

// =============================================================================
// Stage cache (bounded LRU)
// =============================================================================

struct CacheEntry {
    contracts: Vec<Contract>,
    expires_at: Instant,
    hit_count: u64,
    /// Static key of the stage that produced this entry; used for targeted
    /// invalidation when filters are updated.
    stage_key: u64,
}

/// Bounded LRU keyed by stage cache key. Single-writer (the scan's tick
/// task), so plain collections suffice. Recency is a small deque; the move-
/// to-back on hit is linear but the capacity is modest by construction.
struct StageCache {
    entries: HashMap<u64, CacheEntry>,
    recency: VecDeque<u64>,
    capacity: usize,
}

impl StageCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, key: u64, now: Instant) -> Option<&[Contract]> {
        let expired = match self.entries.get(&key) {
            Some(e) => e.expires_at <= now,
            None => return None,
        };
        if expired {
            self.entries.remove(&key);
            self.recency.retain(|k| *k != key);
            return None;
        }

        self.recency.retain(|k| *k != key);
        self.recency.push_back(key);
        let entry = self.entries.get_mut(&key).expect("presence checked above");
        entry.hit_count += 1;
        Some(&entry.contracts)
    }

    fn insert(&mut self, key: u64, stage_key: u64, contracts: Vec<Contract>, ttl: Duration) {
        if self.entries.insert(
            key,
            CacheEntry {
                contracts,
                expires_at: Instant::now() + ttl,
                hit_count: 0,
                stage_key,
            },
        ).is_none()
        {
            self.recency.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                debug!(hits = evicted.hit_count, "stage cache entry evicted");
            }
        }
    }

    fn invalidate_stage(&mut self, stage_key: u64) {
        self.entries.retain(|_, e| e.stage_key != stage_key);
        let entries = &self.entries;
        self.recency.retain(|k| entries.contains_key(k));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// Chain executor
// =============================================================================

struct Stage {
    config: FilterConfig,
    filter: Box<dyn SpreadFilter>,
}

/// Result of one chain run.
pub struct ChainOutcome {
    pub contracts: Vec<Contract>,
    /// Human-readable warnings (dependency pass-throughs), surfaced in the
    /// scan's status event.
    pub warnings: Vec<String>,
}

pub struct ChainExecutor {
    stages: Vec<Stage>,
    stats: HashMap<&'static str, FilterStats>,
    cache: StageCache,
    reorder_threshold: u64,
    skip_heuristics: bool,
    /// The owning scan's interval; skips are only sound when the next tick
    /// lands inside the skipped filter's TTL.
    scan_interval: Duration,
    cache_hits: u64,
    cache_misses: u64,
}

impl ChainExecutor {
    /// Validate every filter config and construct the executor. The sole
    /// entry point from user JSON to executable filters.
    pub fn new(
        configs: &[FilterConfig],
        cache_capacity: usize,
        reorder_threshold: u64,
        skip_heuristics: bool,
        scan_interval: Duration,
    ) -> Result<Self, ScanError> {
        let stages = configs
            .iter()
            .map(|cfg| {
                Ok(Stage {
                    filter: cfg.build()?,
                    config: cfg.clone(),
                })
            })
            .collect::<Result<Vec<_>, ScanError>>()?;

        Ok(Self {
            stages,
            stats: HashMap::new(),
            cache: StageCache::new(cache_capacity),
            reorder_threshold,
            skip_heuristics,
            scan_interval,
            cache_hits: 0,
            cache_misses: 0,
        })
    }

    /// Current filter configs, in user-declared order.
    pub fn configs(&self) -> Vec<FilterConfig> {
        self.stages.iter().map(|s| s.config.clone()).collect()
    }

    /// Width bounds carried by a `width` filter config, if any; consumed by
    /// the spread constructor.
    pub fn width_bounds(&self) -> Option<(f64, f64, bool)> {
        self.stages.iter().find_map(|s| s.config.width_bounds())
    }

    pub fn stats_snapshot(&self) -> Vec<FilterStatsSnapshot> {
        self.stages
            .iter()
            .map(|s| {
                let name = s.filter.name();
                let st = self.stats.get(name);
                FilterStatsSnapshot {
                    name,
                    selectivity: st.map_or(1.0, |s| s.selectivity),
                    cost_per_contract_us: st.map_or(0.0, |s| s.cost_per_contract_us),
                    runs: st.map_or(0, |s| s.runs),
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn stats_for(&self, name: &str) -> Option<&FilterStats> {
        self.stats.get(name)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Atomically replace the chain with new configs. Stats survive for
    /// filters keeping their name; cached outputs are invalidated for every
    /// stage whose static key changed.
    pub fn replace(&mut self, configs: &[FilterConfig]) -> Result<(), ScanError> {
        let new_keys: Vec<u64> = configs.iter().map(FilterConfig::static_key).collect();

        let new_stages = configs
            .iter()
            .map(|cfg| {
                Ok(Stage {
                    filter: cfg.build()?,
                    config: cfg.clone(),
                })
            })
            .collect::<Result<Vec<_>, ScanError>>()?;

        for stage in &self.stages {
            let old_key = stage.config.static_key();
            if !new_keys.contains(&old_key) {
                self.cache.invalidate_stage(old_key);
            }
        }

        self.stages = new_stages;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Run the chain over `input`.
    pub fn apply(&mut self, input: Vec<Contract>, ctx: &FilterContext) -> ChainOutcome {
        let mut warnings = Vec::new();

        if self.stages.is_empty() {
            return ChainOutcome {
                contracts: input,
                warnings,
            };
        }

        let order = self.effective_order(input.len());
        let mut current = input;

        for (position, &idx) in order.iter().enumerate() {
            if current.is_empty() {
                break;
            }

            let stage = &self.stages[idx];
            let name = stage.filter.name();

            if self.should_skip(&*stage.filter, position, order.len(), current.len()) {
                debug!(filter = name, input = current.len(), "filter skipped by heuristic");
                continue;
            }

            let key = stage_cache_key(name, stage.filter.static_key(), &current);
            let now = Instant::now();
            if let Some(cached) = self.cache.get(key, now) {
                self.cache_hits += 1;
                current = cached.to_vec();
                continue;
            }
            self.cache_misses += 1;

            let input_len = current.len();
            let started = Instant::now();
            match stage.filter.apply(&current, ctx) {
                Ok(out) => {
                    let elapsed = started.elapsed();
                    let selectivity = out.len() as f64 / input_len as f64;
                    let cost_us = elapsed.as_secs_f64() * 1e6 / input_len as f64;
                    self.stats
                        .entry(name)
                        .or_insert_with(FilterStats::new)
                        .update(selectivity, cost_us, input_len);
                    self.cache
                        .insert(key, stage.filter.static_key(), out.clone(), stage.filter.cache_ttl());
                    current = out;
                }
                Err(ScanError::Dependency(msg)) => {
                    warn!(filter = name, error = %msg, "filter dependency unavailable — pass-through");
                    warnings.push(format!("{name}: {msg}"));
                }
                Err(e) => {
                    // Filters are contracted to fail only with Dependency at
                    // runtime; anything else is an invariant breach.
                    warn!(filter = name, error = %e, "unexpected filter error — pass-through");
                    warnings.push(format!("{name}: unexpected error: {e}"));
                }
            }
        }

        ChainOutcome {
            contracts: current,
            warnings,
        }
    }

    /// Effective stage order for this run. Reordering is observational: it
    /// requires every filter to have at least `reorder_threshold` recorded
    /// runs, and order-dependent filters never move from their declared
    /// position.
    fn effective_order(&self, input_len: usize) -> Vec<usize> {
        let n = self.stages.len();
        let all_warm = self.stages.iter().all(|s| {
            self.stats
                .get(s.filter.name())
                .is_some_and(|st| st.runs >= self.reorder_threshold)
        });

        if !all_warm || self.reorder_threshold == 0 {
            // Fall back to declared order refined by static priority hints.
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by_key(|&i| (self.stages[i].filter.priority(), i));
            return order;
        }

        let estimate = |i: usize| -> f64 {
            let st = &self.stats[self.stages[i].filter.name()];
            st.selectivity * st.cost_per_contract_us * input_len as f64
        };

        let movable: Vec<usize> = (0..n)
            .filter(|&i| !self.stages[i].filter.order_dependent())
            .collect();
        let mut sorted = movable.clone();
        sorted.sort_by(|&a, &b| estimate(a).total_cmp(&estimate(b)));

        // Re-slot sorted movable stages into the non-pinned positions.
        let mut sorted_iter = sorted.into_iter();
        (0..n)
            .map(|i| {
                if self.stages[i].filter.order_dependent() {
                    i
                } else {
                    sorted_iter.next().expect("one movable stage per slot")
                }
            })
            .collect()
    }

    /// Skip heuristics. Correctness is preserved because a skip is only taken
    /// when the next scheduled tick lands inside the filter's cache TTL, so
    /// the following full run is cheap and re-establishes exact output.
    fn should_skip(
        &self,
        filter: &dyn SpreadFilter,
        position: usize,
        chain_len: usize,
        input_len: usize,
    ) -> bool {
        if !self.skip_heuristics {
            return false;
        }
        if self.scan_interval > filter.cache_ttl() {
            return false;
        }

        // High-cost filters are not worth running over tiny remainders.
        if input_len < SKIP_SMALL_INPUT && filter.cost_class() == CostClass::High {
            return true;
        }

        // Late-chain filters that retain nearly everything.
        let late = position * 2 >= chain_len;
        if late {
            if let Some(st) = self.stats.get(filter.name()) {
                if st.runs >= self.reorder_threshold && st.selectivity >= SKIP_SELECTIVITY {
                    return true;
                }
            }
        }

        false
    }
}

/// Stage cache key: filter name, parameter hash, and a rolling digest of the
/// first `CACHE_KEY_IDS` input contract ids. The first-k keying is
/// deliberately probabilistic — upstream returns contracts in stable
/// per-symbol order, and the TTL floor bounds staleness from a collision. An
/// implementation hashing the full id set would also be correct.
fn stage_cache_key(name: &str, static_key: u64, input: &[Contract]) -> u64 {
    let mut h = DefaultHasher::new();
    name.hash(&mut h);
    static_key.hash(&mut h);
    input.len().hash(&mut h);
    for c in input.iter().take(CACHE_KEY_IDS) {
        c.contract_id().hash(&mut h);
    }
    h.finish()
}
