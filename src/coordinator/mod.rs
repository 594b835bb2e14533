// =============================================================================
// Request Coordinator — bounded-concurrency dispatcher to the upstream gateway
// =============================================================================
//
// A fixed pool of worker tasks pulls batched requests from one bounded MPMC
// queue. Before every upstream call a worker:
//   1. drops requests that expired while queued (no permit consumed),
//   2. coalesces overlapping batches that arrived within the coalesce window,
//   3. sleeps the adaptive backpressure delay derived from upstream health,
//   4. passes the circuit breaker,
//   5. acquires an in-flight permit from the concurrency semaphore.
//
// Responses are demultiplexed back to the originating callers by symbol set.
// Per-scan ordering (one outstanding request per scan) is enforced by the
// engine, not here.
// =============================================================================

pub mod circuit;
pub mod health;

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ScannerConfig;
use crate::error::ScanError;
use crate::gateway::MarketGateway;
use crate::types::Contract;

use circuit::{CircuitBreaker, CircuitState};
use health::{compute_delay, HealthSnapshot};

/// One queued batch: the symbols a scan tick needs, with a hard deadline and
/// a reply channel back to the tick task.
struct FetchRequest {
    scan_id: Uuid,
    symbols: Vec<String>,
    deadline: Instant,
    reply: oneshot::Sender<Result<Vec<Contract>, ScanError>>,
}

/// Serialisable coordinator snapshot for status events and the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorState {
    pub queue_depth: u32,
    pub rtt_ms: u64,
    pub recent_errors: u32,
    pub consecutive_errors: u32,
    pub circuit_state: CircuitState,
    pub backpressure_delay_ms: u64,
    pub inflight: usize,
}

struct Shared {
    gateway: Arc<dyn MarketGateway>,
    semaphore: Semaphore,
    circuit: CircuitBreaker,
    health: RwLock<HealthSnapshot>,
    config: ScannerConfig,
    inflight: AtomicUsize,
}

pub struct RequestCoordinator {
    tx: async_channel::Sender<FetchRequest>,
    rx: async_channel::Receiver<FetchRequest>,
    shared: Arc<Shared>,
}

impl RequestCoordinator {
    pub fn new(gateway: Arc<dyn MarketGateway>, config: &ScannerConfig) -> Arc<Self> {
        let (tx, rx) = async_channel::bounded(config.coordinator.queue_size.max(1));

        let shared = Arc::new(Shared {
            gateway,
            semaphore: Semaphore::new(config.max_concurrent.max(1)),
            circuit: CircuitBreaker::new(
                config.circuit.max_failures,
                Duration::from_secs(config.circuit.reset_timeout_secs),
            ),
            health: RwLock::new(HealthSnapshot::default()),
            config: config.clone(),
            inflight: AtomicUsize::new(0),
        });

        Arc::new(Self { tx, rx, shared })
    }

    /// Spawn the worker pool and the background health poller.
    pub fn spawn(self: &Arc<Self>) {
        for worker_id in 0..self.shared.config.workers.max(1) {
            let rx = self.rx.clone();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, rx, shared).await;
            });
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            health_poll_loop(shared).await;
        });
    }

    /// Submit a batch and await the contracts. Fails immediately with
    /// `Overload` when the request queue is full.
    pub async fn fetch(
        &self,
        scan_id: Uuid,
        symbols: Vec<String>,
        deadline: Instant,
    ) -> Result<Vec<Contract>, ScanError> {
        let (reply, rx) = oneshot::channel();
        let req = FetchRequest {
            scan_id,
            symbols,
            deadline,
            reply,
        };

        self.tx
            .try_send(req)
            .map_err(|_| ScanError::Overload("coordinator request queue full".into()))?;
        counter!("spreadscan_coordinator_requests_total", 1);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ScanError::Internal(
                "coordinator dropped the request reply".into(),
            )),
        }
    }

    /// Loosely consistent snapshot of coordinator health.
    pub fn state(&self) -> CoordinatorState {
        let h = *self.shared.health.read();
        CoordinatorState {
            queue_depth: h.queue_depth,
            rtt_ms: h.rtt_ms,
            recent_errors: h.recent_errors,
            consecutive_errors: h.consecutive_errors,
            circuit_state: self.shared.circuit.state(),
            backpressure_delay_ms: compute_delay(
                h.queue_depth,
                &self.shared.config.coordinator.queue_thresholds,
            )
            .as_millis() as u64,
            inflight: self.shared.inflight.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn circuit_state(&self) -> CircuitState {
        self.shared.circuit.state()
    }

    /// Inject a health observation directly.
    #[cfg(test)]
    pub(crate) fn record_health(&self, h: crate::gateway::GatewayHealth) {
        self.shared.health.write().absorb(h);
    }
}

// =============================================================================
// Worker loop
// =============================================================================

async fn worker_loop(
    worker_id: usize,
    rx: async_channel::Receiver<FetchRequest>,
    shared: Arc<Shared>,
) {
    // Requests pulled during coalescing that could not merge with the current
    // batch; served before touching the queue again.
    let mut carry: VecDeque<FetchRequest> = VecDeque::new();

    loop {
        let head = match carry.pop_front() {
            Some(req) => req,
            None => match rx.recv().await {
                Ok(req) => req,
                Err(_) => {
                    debug!(worker_id, "request queue closed — worker exiting");
                    return;
                }
            },
        };

        // Expired while queued: dropped without consuming a permit.
        if Instant::now() >= head.deadline {
            counter!("spreadscan_coordinator_deadline_drops_total", 1);
            let _ = head.reply.send(Err(ScanError::Deadline));
            continue;
        }

        let merged = coalesce(head, &rx, &mut carry, &shared.config);
        dispatch(&shared, merged).await;
    }
}

/// Merge immediately available requests that share symbols with the batch,
/// bounded by the upstream's max symbols per call and the coalesce window.
fn coalesce(
    head: FetchRequest,
    rx: &async_channel::Receiver<FetchRequest>,
    carry: &mut VecDeque<FetchRequest>,
    config: &ScannerConfig,
) -> Vec<FetchRequest> {
    let window_end = Instant::now() + Duration::from_millis(config.coordinator.coalesce_window_ms);
    let max_symbols = config.coordinator.max_symbols_per_call.max(1);

    let mut union: BTreeSet<String> = head.symbols.iter().cloned().collect();
    let mut merged = vec![head];

    while union.len() < max_symbols && Instant::now() < window_end {
        let Ok(req) = rx.try_recv() else {
            break;
        };

        let overlaps = req.symbols.iter().any(|s| union.contains(s));
        let grown = union.len() + req.symbols.iter().filter(|s| !union.contains(*s)).count();

        if overlaps && grown <= max_symbols {
            union.extend(req.symbols.iter().cloned());
            merged.push(req);
        } else {
            carry.push_back(req);
        }
    }

    if merged.len() > 1 {
        debug!(
            batches = merged.len(),
            symbols = union.len(),
            "coalesced overlapping scan batches"
        );
        counter!("spreadscan_coordinator_coalesced_total", 1);
    }

    merged
}

async fn dispatch(shared: &Arc<Shared>, merged: Vec<FetchRequest>) {
    // Adaptive pre-call delay from the latest health sample.
    if shared.config.coordinator.adaptive_backpressure {
        let depth = shared.health.read().queue_depth;
        let delay = compute_delay(depth, &shared.config.coordinator.queue_thresholds);
        tokio::time::sleep(delay).await;
    }

    // Deadline re-check after the delay, still without a permit.
    let now = Instant::now();
    let (live, expired): (Vec<_>, Vec<_>) = merged.into_iter().partition(|r| r.deadline > now);
    for req in expired {
        counter!("spreadscan_coordinator_deadline_drops_total", 1);
        let _ = req.reply.send(Err(ScanError::Deadline));
    }
    if live.is_empty() {
        return;
    }

    // Circuit breaker gates the call before any permit is taken.
    if let Err(e) = shared.circuit.check() {
        counter!("spreadscan_coordinator_circuit_rejections_total", 1);
        for req in live {
            let _ = req.reply.send(Err(e.clone()));
        }
        return;
    }

    let _permit = shared
        .semaphore
        .acquire()
        .await
        .expect("coordinator semaphore is never closed");

    // Requests may have expired while waiting for a permit; the admission is
    // cancelled if nothing is left to serve.
    let now = Instant::now();
    let (live, expired): (Vec<_>, Vec<_>) = live.into_iter().partition(|r| r.deadline > now);
    for req in expired {
        let _ = req.reply.send(Err(ScanError::Deadline));
    }
    if live.is_empty() {
        shared.circuit.on_cancel();
        return;
    }

    let symbols: Vec<String> = {
        let mut set = BTreeSet::new();
        for req in &live {
            set.extend(req.symbols.iter().cloned());
        }
        set.into_iter().collect()
    };
    let earliest = live
        .iter()
        .map(|r| r.deadline)
        .min()
        .expect("live batch is non-empty");

    let inflight = shared.inflight.fetch_add(1, Ordering::SeqCst) + 1;
    gauge!("spreadscan_coordinator_inflight", inflight as f64);

    let started = Instant::now();
    let outcome = tokio::time::timeout_at(
        tokio::time::Instant::from_std(earliest),
        shared.gateway.fetch_contracts(&symbols),
    )
    .await;

    shared.inflight.fetch_sub(1, Ordering::SeqCst);
    histogram!(
        "spreadscan_coordinator_rtt_ms",
        started.elapsed().as_millis() as f64
    );

    match outcome {
        Ok(Ok(contracts)) => {
            shared.circuit.on_success();
            {
                let mut h = shared.health.write();
                h.rtt_ms = started.elapsed().as_millis() as u64;
                h.consecutive_errors = 0;
            }
            demux(live, contracts);
        }
        Ok(Err(e)) => {
            warn!(error = %e, "upstream fetch failed");
            counter!("spreadscan_coordinator_upstream_errors_total", 1);
            shared.circuit.on_failure();
            shared.health.write().consecutive_errors += 1;
            for req in live {
                let _ = req.reply.send(Err(e.clone()));
            }
        }
        Err(_) => {
            warn!("upstream fetch timed out at caller deadline");
            counter!("spreadscan_coordinator_deadline_drops_total", 1);
            shared.circuit.on_failure();
            shared.health.write().consecutive_errors += 1;
            for req in live {
                let _ = req.reply.send(Err(ScanError::Deadline));
            }
        }
    }
}

/// Route each contract back to every caller whose symbol set contains it.
fn demux(live: Vec<FetchRequest>, contracts: Vec<Contract>) {
    for req in live {
        let wanted: HashSet<&str> = req.symbols.iter().map(String::as_str).collect();
        let own: Vec<Contract> = contracts
            .iter()
            .filter(|c| wanted.contains(c.symbol.as_str()))
            .cloned()
            .collect();
        debug!(scan_id = %req.scan_id, contracts = own.len(), "demuxed batch reply");
        let _ = req.reply.send(Ok(own));
    }
}

// =============================================================================
// Health poller
// =============================================================================

async fn health_poll_loop(shared: Arc<Shared>) {
    let period = Duration::from_secs(shared.config.coordinator.health_poll_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match shared.gateway.health().await {
            Ok(h) => {
                gauge!("spreadscan_upstream_queue_depth", h.queue_depth as f64);
                shared.health.write().absorb(h);
            }
            Err(e) => {
                debug!(error = %e, "health poll failed");
                shared.health.write().consecutive_errors += 1;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayHealth;
    use crate::types::OptionRight;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::AtomicU32;

    fn contract_for(symbol: &str) -> Contract {
        Contract {
            symbol: symbol.into(),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
            strike: 100.0,
            right: OptionRight::Call,
            bid: 1.0,
            ask: 1.05,
            last: 1.02,
            volume: 10,
            open_interest: 10,
            delta: 0.3,
            gamma: 0.02,
            theta: -0.03,
            vega: 0.1,
            implied_vol: 0.2,
            prob_itm: 0.3,
            underlying_price: 100.0,
        }
    }

    /// Gateway double: optional per-call latency, scripted failures, and
    /// concurrency accounting for the semaphore invariant.
    struct MockGateway {
        delay: Duration,
        failures_remaining: AtomicU32,
        calls: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                delay: Duration::ZERO,
                failures_remaining: AtomicU32::new(0),
                calls: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new()
            }
        }

        fn failing(times: u32) -> Self {
            Self {
                failures_remaining: AtomicU32::new(times),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl MarketGateway for MockGateway {
        async fn fetch_contracts(&self, symbols: &[String]) -> Result<Vec<Contract>, ScanError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.current.fetch_sub(1, Ordering::SeqCst);

            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(ScanError::Dependency("scripted failure".into()));
            }

            Ok(symbols.iter().map(|s| contract_for(s)).collect())
        }

        async fn health(&self) -> Result<GatewayHealth, ScanError> {
            Ok(GatewayHealth::default())
        }
    }

    fn fast_config() -> ScannerConfig {
        let mut cfg = ScannerConfig::default();
        cfg.coordinator.adaptive_backpressure = false;
        cfg.coordinator.health_poll_interval_secs = 3600;
        cfg
    }

    #[tokio::test]
    async fn inflight_never_exceeds_max_concurrent() {
        let gw = Arc::new(MockGateway::with_delay(Duration::from_millis(25)));
        let mut cfg = fast_config();
        cfg.workers = 8;
        cfg.max_concurrent = 3;

        let coord = RequestCoordinator::new(gw.clone(), &cfg);
        coord.spawn();

        let deadline = Instant::now() + Duration::from_secs(10);
        let fetches: Vec<_> = (0..20)
            .map(|i| coord.fetch(Uuid::new_v4(), vec![format!("SYM{i}")], deadline))
            .collect();
        let results = futures_util::future::join_all(fetches).await;

        assert!(results.iter().all(Result::is_ok));
        assert!(
            gw.peak.load(Ordering::SeqCst) <= 3,
            "observed {} concurrent upstream calls",
            gw.peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn queued_request_past_deadline_is_dropped() {
        let gw = Arc::new(MockGateway::new());
        let coord = RequestCoordinator::new(gw.clone(), &fast_config());
        coord.spawn();

        let res = coord
            .fetch(
                Uuid::new_v4(),
                vec!["SPY".into()],
                Instant::now() - Duration::from_millis(1),
            )
            .await;
        assert!(matches!(res, Err(ScanError::Deadline)));
        assert_eq!(gw.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn circuit_opens_and_fails_fast_without_io() {
        let gw = Arc::new(MockGateway::failing(u32::MAX));
        let mut cfg = fast_config();
        cfg.workers = 1;
        cfg.circuit.max_failures = 2;
        cfg.circuit.reset_timeout_secs = 3600;

        let coord = RequestCoordinator::new(gw.clone(), &cfg);
        coord.spawn();

        let deadline = || Instant::now() + Duration::from_secs(5);
        for _ in 0..2 {
            let res = coord
                .fetch(Uuid::new_v4(), vec!["SPY".into()], deadline())
                .await;
            assert!(matches!(res, Err(ScanError::Dependency(_))));
        }
        assert_eq!(coord.circuit_state(), CircuitState::Open);

        let calls_before = gw.calls.load(Ordering::SeqCst);
        let res = coord
            .fetch(Uuid::new_v4(), vec!["SPY".into()], deadline())
            .await;
        assert!(matches!(res, Err(ScanError::CircuitOpen)));
        // Fail-fast: no network I/O happened for the rejected call.
        assert_eq!(gw.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn full_queue_is_admission_overload() {
        let gw = Arc::new(MockGateway::new());
        let mut cfg = fast_config();
        cfg.coordinator.queue_size = 1;

        // No workers spawned: the queue cannot drain.
        let coord = RequestCoordinator::new(gw, &cfg);

        let c1 = coord.clone();
        let pending = tokio::spawn(async move {
            c1.fetch(
                Uuid::new_v4(),
                vec!["SPY".into()],
                Instant::now() + Duration::from_secs(5),
            )
            .await
        });
        // Give the first fetch time to occupy the queue slot.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let res = coord
            .fetch(
                Uuid::new_v4(),
                vec!["QQQ".into()],
                Instant::now() + Duration::from_secs(5),
            )
            .await;
        assert!(matches!(res, Err(ScanError::Overload(_))));
        pending.abort();
    }

    #[tokio::test]
    async fn replies_are_demuxed_by_symbol() {
        let gw = Arc::new(MockGateway::new());
        let mut cfg = fast_config();
        cfg.workers = 1;

        let coord = RequestCoordinator::new(gw, &cfg);
        coord.spawn();

        let deadline = Instant::now() + Duration::from_secs(5);
        let (a, b) = tokio::join!(
            coord.fetch(Uuid::new_v4(), vec!["SPY".into(), "QQQ".into()], deadline),
            coord.fetch(Uuid::new_v4(), vec!["QQQ".into()], deadline),
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.iter().any(|c| c.symbol == "SPY"));
        assert!(a.iter().any(|c| c.symbol == "QQQ"));
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].symbol, "QQQ");
    }

    #[test]
    fn coalesce_merges_overlap_and_carries_disjoint() {
        let cfg = fast_config();
        let (tx, rx) = async_channel::bounded::<FetchRequest>(8);
        let mut carry = VecDeque::new();

        let mk = |symbols: Vec<&str>| {
            let (reply, _rx) = oneshot::channel();
            FetchRequest {
                scan_id: Uuid::new_v4(),
                symbols: symbols.into_iter().map(String::from).collect(),
                deadline: Instant::now() + Duration::from_secs(5),
                reply,
            }
        };

        tx.try_send(mk(vec!["SPY", "IWM"])).unwrap();
        tx.try_send(mk(vec!["TSLA"])).unwrap();

        let merged = coalesce(mk(vec!["SPY"]), &rx, &mut carry, &cfg);
        assert_eq!(merged.len(), 2);
        assert_eq!(carry.len(), 1);
        assert_eq!(carry[0].symbols, vec!["TSLA".to_string()]);
    }

    #[tokio::test]
    async fn record_health_feeds_state_snapshot() {
        let gw = Arc::new(MockGateway::new());
        let coord = RequestCoordinator::new(gw, &fast_config());

        coord.record_health(GatewayHealth {
            queue_depth: 80,
            rtt_ms: 15,
            recent_errors: 2,
        });

        let state = coord.state();
        assert_eq!(state.queue_depth, 80);
        assert_eq!(state.rtt_ms, 15);
        assert_eq!(state.backpressure_delay_ms, 100);
        assert_eq!(state.circuit_state, CircuitState::Closed);
    }
}
