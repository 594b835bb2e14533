// =============================================================================
// Scan Engine — scan registry, tick scheduling, and result broadcasting
// =============================================================================
//
// The engine exclusively owns every Scan. A single cheap tick loop wakes at
// 4 Hz and dispatches one tick task per due scan; at most one tick task per
// scan is ever in flight (the coordinator's per-scan ordering guarantee rests
// on this), while ticks across scans run in parallel. Tick tasks are wrapped
// in catch_unwind: a panic fails the tick, never the engine.
//
// A scan's mutable state sits behind a per-scan lock held only for the CPU
// section of a tick (chain, spreads, diff, fan-out) and for admin calls;
// the upstream fetch happens without the lock.
// =============================================================================

pub mod broadcast;
pub mod diff;

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chain::{ChainExecutor, FilterStatsSnapshot};
use crate::config::ScannerConfig;
use crate::coordinator::RequestCoordinator;
use crate::error::ScanError;
use crate::filters::{FilterConfig, FilterContext};
use crate::iv_history::IvHistoryStore;
use crate::spreads::{build_spreads, sort_results, WidthBounds};
use crate::types::{Contract, SortDir, SortKey, SpreadResult, VerticalKind};

use broadcast::{
    assemble_tick_frames, result_frame, status_frame, EventKind, OutboundFrame, ResultAction,
    StatusEvent, Subscriber, SubscriberSet,
};
use diff::{diff_results, EpsThresholds};

/// Tick-loop wakeup period; scans declare intervals >= 1 s, so 4 Hz keeps
/// dispatch jitter well under a tick.
const TICK_LOOP_PERIOD: Duration = Duration::from_millis(250);

/// IV percentile lookback used for result annotation when the chain carries
/// no explicit iv_percentile filter.
const DEFAULT_IV_LOOKBACK_DAYS: usize = 252;

// =============================================================================
// Scan specification
// =============================================================================

/// User-supplied scan configuration, as posted to `POST /scans`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSpec {
    pub symbols: Vec<String>,
    #[serde(default)]
    pub strategy: VerticalKind,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    /// Scan interval in seconds; must be >= 1. Defaults from config.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub sort_key: SortKey,
    #[serde(default)]
    pub sort_dir: SortDir,
}

/// REST status payload for one scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub scan_id: Uuid,
    pub tick_count: u64,
    pub last_tick_at: Option<String>,
    pub next_tick_at: String,
    pub interval_secs: u64,
    pub result_count: usize,
    pub subscriber_count: usize,
    pub last_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub filter_stats: Vec<FilterStatsSnapshot>,
    pub cache_entries: usize,
    pub cache_hit_rate: f64,
}

/// Paginated result listing for `GET /scans/:id/results`.
#[derive(Debug, Clone, Serialize)]
pub struct ResultsPage {
    pub results: Vec<SpreadResult>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub tick: u64,
}

// =============================================================================
// Scan runtime state
// =============================================================================

struct ScanState {
    symbols: Vec<String>,
    strategy: VerticalKind,
    interval: Duration,
    max_results: usize,
    sort_key: SortKey,
    sort_dir: SortDir,

    chain: ChainExecutor,
    tick_count: u64,
    /// Most recent emitted result set, in sort order. The diff against the
    /// next tick is computed from this.
    last_results: Vec<SpreadResult>,
    subscribers: SubscriberSet,
    next_due_at: Instant,
    last_tick_at: Option<DateTime<Utc>>,
    last_skip_reason: Option<String>,
    last_warnings: Vec<String>,
    last_duration_ms: u64,
}

/// One live scan. The engine holds the registry entry; tick tasks and admin
/// calls share the handle.
pub struct ScanHandle {
    pub id: Uuid,
    state: Mutex<ScanState>,
    in_flight: AtomicBool,
    stopped: AtomicBool,
}

impl ScanHandle {
    /// Claim the scan for a tick. Returns false when a tick task is already
    /// in flight — the engine never runs two ticks of one scan concurrently.
    fn begin_tick(&self) -> bool {
        !self.in_flight.swap(true, Ordering::AcqRel)
    }

    fn end_tick(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    fn is_due(&self, now: Instant) -> bool {
        if self.stopped.load(Ordering::Acquire) || self.in_flight.load(Ordering::Acquire) {
            return false;
        }
        // try_lock: a held lock means a tick or admin call is touching the
        // scan right now; it will be picked up on a later wakeup.
        match self.state.try_lock() {
            Some(st) => st.next_due_at <= now,
            None => false,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct ScanEngine {
    scans: RwLock<HashMap<Uuid, Arc<ScanHandle>>>,
    coordinator: Arc<RequestCoordinator>,
    iv_history: Arc<IvHistoryStore>,
    config: ScannerConfig,
    eps: EpsThresholds,

    active_ticks: AtomicUsize,
    ticks_total: AtomicU64,
    ticks_skipped: AtomicU64,
    ticks_failed: AtomicU64,
    shutting_down: AtomicBool,

    /// Live WebSocket connections across all scans, bounded by config.
    pub ws_connections: AtomicUsize,
    start_time: Instant,
}

impl ScanEngine {
    pub fn new(
        coordinator: Arc<RequestCoordinator>,
        iv_history: Arc<IvHistoryStore>,
        config: ScannerConfig,
    ) -> Arc<Self> {
        let eps = EpsThresholds {
            price: config.chain.eps_price,
            greeks: config.chain.eps_greeks,
            score: config.chain.eps_score,
        };
        Arc::new(Self {
            scans: RwLock::new(HashMap::new()),
            coordinator,
            iv_history,
            config,
            eps,
            active_ticks: AtomicUsize::new(0),
            ticks_total: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            ticks_failed: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            ws_connections: AtomicUsize::new(0),
            start_time: Instant::now(),
        })
    }

    // -------------------------------------------------------------------------
    // Scan lifecycle
    // -------------------------------------------------------------------------

    /// Validate `spec`, instantiate its chain executor, and enroll the scan.
    /// The first tick is due immediately.
    pub fn start_scan(&self, spec: ScanSpec) -> Result<Uuid, ScanError> {
        if spec.symbols.is_empty() || spec.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(ScanError::Config(
                "scan requires a non-empty symbol set".into(),
            ));
        }

        let interval_secs = spec
            .interval_secs
            .unwrap_or(self.config.scan.default_interval_secs);
        if interval_secs < 1 {
            return Err(ScanError::Config(format!(
                "scan interval must be >= 1 s, got {interval_secs}"
            )));
        }
        let interval = Duration::from_secs(interval_secs);

        let max_results = spec.max_results.unwrap_or(self.config.scan.max_results);
        if max_results == 0 {
            return Err(ScanError::Config("max_results must be >= 1".into()));
        }

        let chain = ChainExecutor::new(
            &spec.filters,
            self.config.cache.size,
            self.config.chain.reorder_threshold,
            self.config.chain.skip_heuristics,
            interval,
        )?;

        let mut scans = self.scans.write();
        if scans.len() >= self.config.scan.max_concurrent {
            return Err(ScanError::Overload(format!(
                "scan limit reached ({})",
                self.config.scan.max_concurrent
            )));
        }

        let id = Uuid::new_v4();
        let handle = Arc::new(ScanHandle {
            id,
            state: Mutex::new(ScanState {
                symbols: spec.symbols.clone(),
                strategy: spec.strategy,
                interval,
                max_results,
                sort_key: spec.sort_key,
                sort_dir: spec.sort_dir,
                chain,
                tick_count: 0,
                last_results: Vec::new(),
                subscribers: SubscriberSet::default(),
                next_due_at: Instant::now(),
                last_tick_at: None,
                last_skip_reason: None,
                last_warnings: Vec::new(),
                last_duration_ms: 0,
            }),
            in_flight: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        scans.insert(id, handle);
        drop(scans);

        info!(
            scan_id = %id,
            symbols = ?spec.symbols,
            strategy = %spec.strategy,
            interval_secs,
            "scan started"
        );
        gauge!("spreadscan_scans_live", self.scans.read().len() as f64);
        Ok(id)
    }

    /// Remove a scan. An in-flight tick finishes but emits no events.
    pub fn stop_scan(&self, id: Uuid) -> bool {
        let Some(handle) = self.scans.write().remove(&id) else {
            return false;
        };
        handle.stopped.store(true, Ordering::Release);
        info!(scan_id = %id, "scan stopped");
        gauge!("spreadscan_scans_live", self.scans.read().len() as f64);
        true
    }

    /// Atomically replace the scan's filter chain between ticks. Cached
    /// outputs of stages whose parameters changed are invalidated.
    pub fn update_filters(
        &self,
        id: Uuid,
        configs: &[FilterConfig],
    ) -> Option<Result<Vec<FilterConfig>, ScanError>> {
        let handle = self.scans.read().get(&id).cloned()?;
        // Taking the per-scan lock serialises against a running tick: the
        // swap lands strictly between ticks.
        let mut st = handle.state.lock();
        Some(match st.chain.replace(configs) {
            Ok(()) => {
                info!(scan_id = %id, filters = configs.len(), "filter chain replaced");
                Ok(st.chain.configs())
            }
            Err(e) => Err(e),
        })
    }

    pub fn get_filters(&self, id: Uuid) -> Option<Vec<FilterConfig>> {
        let handle = self.scans.read().get(&id).cloned()?;
        let st = handle.state.lock();
        Some(st.chain.configs())
    }

    pub fn status(&self, id: Uuid) -> Option<ScanStatus> {
        let handle = self.scans.read().get(&id).cloned()?;
        let st = handle.state.lock();

        let now = Instant::now();
        let until_next = st.next_due_at.saturating_duration_since(now);
        let next_tick_at = (Utc::now()
            + chrono::Duration::from_std(until_next).unwrap_or_else(|_| chrono::Duration::zero()))
        .to_rfc3339();

        Some(ScanStatus {
            scan_id: id,
            tick_count: st.tick_count,
            last_tick_at: st.last_tick_at.map(|t| t.to_rfc3339()),
            next_tick_at,
            interval_secs: st.interval.as_secs(),
            result_count: st.last_results.len(),
            subscriber_count: st.subscribers.len(),
            last_duration_ms: st.last_duration_ms,
            last_skip_reason: st.last_skip_reason.clone(),
            warnings: st.last_warnings.clone(),
            filter_stats: st.chain.stats_snapshot(),
            cache_entries: st.chain.cache_len(),
            cache_hit_rate: st.chain.cache_hit_rate(),
        })
    }

    /// Page through the scan's latest result set. `since` is a tick number:
    /// when the scan has not ticked past it, the page is empty (nothing new).
    pub fn results_page(
        &self,
        id: Uuid,
        limit: usize,
        offset: usize,
        since: Option<u64>,
    ) -> Option<ResultsPage> {
        let handle = self.scans.read().get(&id).cloned()?;
        let st = handle.state.lock();

        let fresh = since.map_or(true, |s| st.tick_count > s);
        let results: Vec<SpreadResult> = if fresh {
            st.last_results
                .iter()
                .skip(offset)
                .take(limit.max(1))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        Some(ResultsPage {
            results,
            total: st.last_results.len(),
            limit: limit.max(1),
            offset,
            tick: st.tick_count,
        })
    }

    pub fn scan_ids(&self) -> Vec<Uuid> {
        self.scans.read().keys().copied().collect()
    }

    /// Union of symbols across live scans (feeds the IV history refresher).
    pub fn all_symbols(&self) -> Vec<String> {
        let scans = self.scans.read();
        let mut set = HashSet::new();
        for handle in scans.values() {
            if let Some(st) = handle.state.try_lock() {
                set.extend(st.symbols.iter().cloned());
            }
        }
        set.into_iter().collect()
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Attach a subscriber. The current result set arrives immediately as a
    /// synthetic `added` burst, followed by live diffs.
    pub fn subscribe(&self, id: Uuid) -> Option<(Uuid, mpsc::Receiver<OutboundFrame>)> {
        let handle = self.scans.read().get(&id).cloned()?;
        let mut st = handle.state.lock();

        let (sub, rx) = Subscriber::new(self.config.websocket.queue_size);
        let sub_id = sub.id;
        let snapshot: Vec<OutboundFrame> = st
            .last_results
            .iter()
            .map(|r| result_frame(ResultAction::Added, r))
            .collect();

        st.subscribers.add(sub);
        st.subscribers.push_to(sub_id, &snapshot);
        counter!("spreadscan_subscribers_total", 1);
        Some((sub_id, rx))
    }

    pub fn unsubscribe(&self, id: Uuid, sub_id: Uuid) -> bool {
        let Some(handle) = self.scans.read().get(&id).cloned() else {
            return false;
        };
        let mut st = handle.state.lock();
        st.subscribers.remove(sub_id)
    }

    pub fn set_subscriber_events(&self, id: Uuid, sub_id: Uuid, events: HashSet<EventKind>) -> bool {
        let Some(handle) = self.scans.read().get(&id).cloned() else {
            return false;
        };
        let mut st = handle.state.lock();
        st.subscribers.set_events(sub_id, events)
    }

    // -------------------------------------------------------------------------
    // Engine-wide stats
    // -------------------------------------------------------------------------

    pub fn engine_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "scans": self.scans.read().len(),
            "active_ticks": self.active_ticks.load(Ordering::Relaxed),
            "ticks_total": self.ticks_total.load(Ordering::Relaxed),
            "ticks_skipped": self.ticks_skipped.load(Ordering::Relaxed),
            "ticks_failed": self.ticks_failed.load(Ordering::Relaxed),
            "ws_connections": self.ws_connections.load(Ordering::Relaxed),
            "uptime_secs": self.start_time.elapsed().as_secs(),
            "coordinator": self.coordinator.state(),
        })
    }

    // -------------------------------------------------------------------------
    // Tick scheduling
    // -------------------------------------------------------------------------

    /// Spawn the engine tick loop. One instance process-wide.
    pub fn spawn_tick_loop(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_LOOP_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if engine.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                engine.dispatch_due_scans();
            }
        });
    }

    fn dispatch_due_scans(self: &Arc<Self>) {
        let now = Instant::now();
        let due: Vec<Arc<ScanHandle>> = {
            let scans = self.scans.read();
            scans.values().filter(|h| h.is_due(now)).cloned().collect()
        };

        for handle in due {
            if !handle.begin_tick() {
                continue;
            }
            self.active_ticks.fetch_add(1, Ordering::SeqCst);

            let engine = self.clone();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(engine.execute_tick(handle.clone()))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    // A panicking tick must not take the engine down; the scan
                    // resumes at its next interval.
                    engine.ticks_failed.fetch_add(1, Ordering::SeqCst);
                    counter!("spreadscan_ticks_failed_total", 1);
                    error!(scan_id = %handle.id, "tick task panicked — scan continues");
                    if let Some(mut st) = handle.state.try_lock() {
                        let interval = st.interval;
                        st.next_due_at = Instant::now() + interval;
                    }
                }
                handle.end_tick();
                engine.active_ticks.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    /// One full scan tick: fetch through the coordinator, run the chain,
    /// construct and rank spreads, diff, fan out.
    pub(crate) async fn execute_tick(&self, handle: Arc<ScanHandle>) {
        let (symbols, deadline) = {
            let st = handle.state.lock();
            (
                st.symbols.clone(),
                Instant::now()
                    + Duration::from_millis(self.config.coordinator.request_deadline_ms),
            )
        };

        let tick_started = Instant::now();
        let fetched = self.coordinator.fetch(handle.id, symbols, deadline).await;

        // Stopped while the request was in flight: finish silently.
        if handle.stopped.load(Ordering::Acquire) {
            debug!(scan_id = %handle.id, "tick completed for stopped scan — no events");
            return;
        }

        self.ticks_total.fetch_add(1, Ordering::SeqCst);
        counter!("spreadscan_ticks_total", 1);

        let mut st = handle.state.lock();
        st.tick_count += 1;
        let interval = st.interval;
        st.next_due_at = Instant::now() + interval;
        st.last_tick_at = Some(Utc::now());
        let tick = st.tick_count;

        let contracts = match fetched {
            Ok(contracts) => contracts,
            Err(e) => {
                // Transient upstream trouble skips the tick: no result change,
                // no diff; subscribers learn why from the status event.
                if e.is_tick_skip() {
                    self.ticks_skipped.fetch_add(1, Ordering::SeqCst);
                    counter!("spreadscan_ticks_skipped_total", 1);
                } else {
                    self.ticks_failed.fetch_add(1, Ordering::SeqCst);
                    counter!("spreadscan_ticks_failed_total", 1);
                    error!(scan_id = %handle.id, error = %e, "tick failed with non-transient error");
                }
                st.last_skip_reason = Some(e.kind().to_string());
                st.last_duration_ms = tick_started.elapsed().as_millis() as u64;

                let status = StatusEvent {
                    scan_id: handle.id,
                    tick,
                    results: st.last_results.len(),
                    added: 0,
                    removed: 0,
                    changed: 0,
                    duration_ms: st.last_duration_ms,
                    skipped: Some(e.kind().to_string()),
                    warnings: Vec::new(),
                };
                let evicted = st.subscribers.broadcast_tick(&[status_frame(&status)]);
                drop(st);
                self.log_evicted(handle.id, &evicted);
                return;
            }
        };

        // Ingestion invariants: bid <= ask, expiry strictly in the future.
        let today = Utc::now().date_naive();
        let before = contracts.len();
        let contracts: Vec<Contract> = contracts
            .into_iter()
            .filter(|c| c.bid <= c.ask && c.expiry > today)
            .collect();
        if contracts.len() != before {
            debug!(
                scan_id = %handle.id,
                dropped = before - contracts.len(),
                "invalid contracts dropped at ingestion"
            );
        }

        let ctx = FilterContext::new(today, Some(self.iv_history.clone()));
        let outcome = st.chain.apply(contracts, &ctx);

        let bounds = WidthBounds::from_config(st.chain.width_bounds());
        let lookback = iv_lookback(&st.chain.configs());
        let mut results = build_spreads(
            &outcome.contracts,
            st.strategy,
            bounds,
            Some((self.iv_history.as_ref(), lookback)),
        );
        sort_results(&mut results, st.sort_key, st.sort_dir);
        results.truncate(st.max_results);

        let prev: HashMap<String, SpreadResult> = st
            .last_results
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect();
        let d = diff_results(&prev, &results, &self.eps);
        if !d.is_empty() {
            counter!("spreadscan_diff_events_total", 1);
        }

        st.last_results = results;
        st.last_skip_reason = None;
        st.last_warnings = outcome.warnings.clone();
        let duration_ms = tick_started.elapsed().as_millis() as u64;
        st.last_duration_ms = duration_ms;
        histogram!("spreadscan_tick_duration_ms", duration_ms as f64);

        let status = StatusEvent {
            scan_id: handle.id,
            tick,
            results: st.last_results.len(),
            added: d.added.len(),
            removed: d.removed.len(),
            changed: d.changed.len(),
            duration_ms,
            skipped: None,
            warnings: outcome.warnings,
        };

        debug!(
            scan_id = %handle.id,
            tick,
            results = status.results,
            added = status.added,
            removed = status.removed,
            changed = status.changed,
            duration_ms,
            "tick complete"
        );

        let frames = assemble_tick_frames(&d, &status);
        let evicted = st.subscribers.broadcast_tick(&frames);
        drop(st);
        self.log_evicted(handle.id, &evicted);
    }

    fn log_evicted(&self, scan_id: Uuid, evicted: &[Uuid]) {
        for sub_id in evicted {
            warn!(scan_id = %scan_id, subscriber = %sub_id, "subscriber disconnected during fan-out");
            counter!("spreadscan_subscribers_evicted_total", 1);
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop dispatching new ticks and wait up to `timeout` for in-flight tick
    /// tasks to finish.
    pub async fn drain(&self, timeout: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;

        while self.active_ticks.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.active_ticks.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "drain timeout — abandoning in-flight tick tasks");
        } else {
            info!("engine drained cleanly");
        }
    }

    #[cfg(test)]
    pub(crate) fn handle(&self, id: Uuid) -> Option<Arc<ScanHandle>> {
        self.scans.read().get(&id).cloned()
    }
}

/// Lookback used for IV percentile annotation on results.
fn iv_lookback(configs: &[FilterConfig]) -> usize {
    configs
        .iter()
        .find_map(|c| match c {
            FilterConfig::IvPercentile { lookback_days, .. } => Some(*lookback_days),
            _ => None,
        })
        .unwrap_or(DEFAULT_IV_LOOKBACK_DAYS)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayHealth, MarketGateway};
    use crate::types::OptionRight;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    fn far_expiry() -> NaiveDate {
        Utc::now().date_naive() + chrono::Duration::days(45)
    }

    fn call(symbol: &str, strike: f64, mid: f64, delta: f64) -> Contract {
        Contract {
            symbol: symbol.into(),
            expiry: far_expiry(),
            strike,
            right: OptionRight::Call,
            bid: mid - 0.05,
            ask: mid + 0.05,
            last: mid,
            volume: 500,
            open_interest: 1000,
            delta,
            gamma: 0.02,
            theta: -0.03,
            vega: 0.1,
            implied_vol: 0.2,
            prob_itm: delta,
            underlying_price: 100.0,
        }
    }

    /// Gateway returning a small fixed chain per symbol, or scripted errors.
    struct StubGateway {
        fail: AtomicBool,
    }

    impl StubGateway {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl MarketGateway for StubGateway {
        async fn fetch_contracts(&self, symbols: &[String]) -> Result<Vec<Contract>, ScanError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ScanError::Dependency("stub outage".into()));
            }
            let mut out = Vec::new();
            for s in symbols {
                out.push(call(s, 100.0, 3.0, 0.55));
                out.push(call(s, 105.0, 1.0, 0.30));
            }
            Ok(out)
        }

        async fn health(&self) -> Result<GatewayHealth, ScanError> {
            Ok(GatewayHealth::default())
        }
    }

    fn test_config() -> ScannerConfig {
        let mut cfg = ScannerConfig::default();
        cfg.coordinator.adaptive_backpressure = false;
        cfg.coordinator.health_poll_interval_secs = 3600;
        cfg.workers = 2;
        cfg
    }

    fn engine_with(gateway: Arc<StubGateway>, cfg: ScannerConfig) -> Arc<ScanEngine> {
        let coordinator = RequestCoordinator::new(gateway, &cfg);
        coordinator.spawn();
        ScanEngine::new(coordinator, Arc::new(IvHistoryStore::detached()), cfg)
    }

    fn basic_spec() -> ScanSpec {
        ScanSpec {
            symbols: vec!["SPY".into()],
            strategy: VerticalKind::BullCall,
            filters: vec![FilterConfig::Liquidity {
                min_volume: 50,
                min_open_interest: 100,
                max_spread: 0.25,
            }],
            interval_secs: Some(1),
            max_results: Some(10),
            sort_key: SortKey::Score,
            sort_dir: SortDir::Desc,
        }
    }

    #[tokio::test]
    async fn start_scan_validates_spec() {
        let engine = engine_with(Arc::new(StubGateway::new()), test_config());

        let mut empty = basic_spec();
        empty.symbols.clear();
        assert!(matches!(
            engine.start_scan(empty),
            Err(ScanError::Config(_))
        ));

        let mut zero_interval = basic_spec();
        zero_interval.interval_secs = Some(0);
        assert!(matches!(
            engine.start_scan(zero_interval),
            Err(ScanError::Config(_))
        ));

        let mut bad_filter = basic_spec();
        bad_filter.filters = vec![FilterConfig::Dte {
            min_days: 60,
            max_days: 30,
        }];
        assert!(matches!(
            engine.start_scan(bad_filter),
            Err(ScanError::Config(_))
        ));
    }

    #[tokio::test]
    async fn scan_limit_is_admission_overload() {
        let mut cfg = test_config();
        cfg.scan.max_concurrent = 1;
        let engine = engine_with(Arc::new(StubGateway::new()), cfg);

        engine.start_scan(basic_spec()).unwrap();
        assert!(matches!(
            engine.start_scan(basic_spec()),
            Err(ScanError::Overload(_))
        ));
    }

    #[tokio::test]
    async fn full_tick_produces_sorted_truncated_results() {
        let engine = engine_with(Arc::new(StubGateway::new()), test_config());
        let id = engine.start_scan(basic_spec()).unwrap();

        let handle = engine.handle(id).unwrap();
        engine.execute_tick(handle).await;

        let page = engine.results_page(id, 50, 0, None).unwrap();
        assert_eq!(page.tick, 1);
        assert_eq!(page.results.len(), 1);
        let r = &page.results[0];
        assert_eq!(r.long_strike, 100.0);
        assert_eq!(r.short_strike, 105.0);
        assert!(r.score > 0.0);

        let status = engine.status(id).unwrap();
        assert_eq!(status.tick_count, 1);
        assert_eq!(status.result_count, 1);
        assert!(status.last_skip_reason.is_none());
    }

    #[tokio::test]
    async fn max_results_cap_and_sort_are_enforced() {
        let engine = engine_with(Arc::new(StubGateway::new()), test_config());
        let mut spec = basic_spec();
        spec.symbols = vec!["SPY".into(), "QQQ".into(), "IWM".into()];
        spec.max_results = Some(2);
        spec.sort_key = SortKey::Score;
        spec.sort_dir = SortDir::Desc;
        let id = engine.start_scan(spec).unwrap();

        let handle = engine.handle(id).unwrap();
        engine.execute_tick(handle).await;

        // Three symbols yield one spread each, truncated to the cap and
        // sorted by descending score.
        let page = engine.results_page(id, 50, 0, None).unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.results.len(), 2);
        assert!(page.results[0].score >= page.results[1].score);
    }

    #[tokio::test]
    async fn subscriber_receives_tick_events_in_order() {
        let engine = engine_with(Arc::new(StubGateway::new()), test_config());
        let id = engine.start_scan(basic_spec()).unwrap();

        let (_sub_id, mut rx) = engine.subscribe(id).unwrap();

        let handle = engine.handle(id).unwrap();
        engine.execute_tick(handle).await;

        // First tick from an empty previous set: one added frame, then status.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Result);
        assert!(first.json.contains("\"added\""));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::Status);
    }

    #[tokio::test]
    async fn late_subscriber_gets_snapshot_burst() {
        let engine = engine_with(Arc::new(StubGateway::new()), test_config());
        let id = engine.start_scan(basic_spec()).unwrap();

        let handle = engine.handle(id).unwrap();
        engine.execute_tick(handle).await;

        let (sub_id, mut rx) = engine.subscribe(id).unwrap();
        let frame = rx.try_recv().expect("snapshot burst queued on subscribe");
        assert_eq!(frame.kind, EventKind::Result);
        assert!(frame.json.contains("\"added\""));

        assert!(engine.unsubscribe(id, sub_id));
        assert_eq!(engine.status(id).unwrap().subscriber_count, 0);
    }

    #[tokio::test]
    async fn upstream_failure_skips_tick_with_reason() {
        let gateway = Arc::new(StubGateway::new());
        let mut cfg = test_config();
        cfg.circuit.max_failures = 100; // keep the breaker out of this test
        let engine = engine_with(gateway.clone(), cfg);
        let id = engine.start_scan(basic_spec()).unwrap();

        let (_sub_id, mut rx) = engine.subscribe(id).unwrap();

        gateway.fail.store(true, Ordering::SeqCst);
        let handle = engine.handle(id).unwrap();
        engine.execute_tick(handle).await;

        // Only a status frame, carrying the skip reason; no result events.
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind, EventKind::Status);
        assert!(frame.json.contains("\"skipped\":\"dependency\""));
        assert!(rx.try_recv().is_err());

        let status = engine.status(id).unwrap();
        assert_eq!(status.last_skip_reason.as_deref(), Some("dependency"));

        // Recovery: the next tick emits results again.
        gateway.fail.store(false, Ordering::SeqCst);
        let handle = engine.handle(id).unwrap();
        engine.execute_tick(handle).await;
        let status = engine.status(id).unwrap();
        assert_eq!(status.result_count, 1);
        assert!(status.last_skip_reason.is_none());
    }

    #[tokio::test]
    async fn stopped_scan_emits_nothing() {
        let engine = engine_with(Arc::new(StubGateway::new()), test_config());
        let id = engine.start_scan(basic_spec()).unwrap();
        let (_sub_id, mut rx) = engine.subscribe(id).unwrap();

        let handle = engine.handle(id).unwrap();
        assert!(engine.stop_scan(id));
        engine.execute_tick(handle).await;

        assert!(rx.try_recv().is_err());
        assert!(engine.status(id).is_none());
        assert!(!engine.stop_scan(id));
    }

    #[tokio::test]
    async fn one_tick_in_flight_per_scan() {
        let engine = engine_with(Arc::new(StubGateway::new()), test_config());
        let id = engine.start_scan(basic_spec()).unwrap();
        let handle = engine.handle(id).unwrap();

        assert!(handle.begin_tick());
        // Second dispatch attempt is refused while the first is running.
        assert!(!handle.begin_tick());
        assert!(!handle.is_due(Instant::now()));
        handle.end_tick();
        assert!(handle.begin_tick());
        handle.end_tick();
    }

    #[tokio::test]
    async fn update_filters_round_trips_and_rejects_bad_configs() {
        let engine = engine_with(Arc::new(StubGateway::new()), test_config());
        let id = engine.start_scan(basic_spec()).unwrap();

        let new_chain = vec![
            FilterConfig::Dte {
                min_days: 20,
                max_days: 70,
            },
            FilterConfig::Delta {
                min: 0.2,
                max: 0.4,
                use_absolute: true,
            },
        ];
        let applied = engine.update_filters(id, &new_chain).unwrap().unwrap();
        assert_eq!(applied, new_chain);
        assert_eq!(engine.get_filters(id).unwrap(), new_chain);

        let bad = vec![FilterConfig::Delta {
            min: 0.9,
            max: 0.1,
            use_absolute: false,
        }];
        assert!(engine.update_filters(id, &bad).unwrap().is_err());
        // Failed update leaves the previous chain in place.
        assert_eq!(engine.get_filters(id).unwrap(), new_chain);

        assert!(engine.update_filters(Uuid::new_v4(), &new_chain).is_none());
    }

    #[tokio::test]
    async fn drain_waits_for_active_ticks() {
        let engine = engine_with(Arc::new(StubGateway::new()), test_config());
        engine.drain(Duration::from_millis(200)).await;
        assert_eq!(engine.active_ticks.load(Ordering::SeqCst), 0);
    }
}
