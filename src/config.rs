// =============================================================================
// Scanner Configuration
// =============================================================================
//
// One struct holds every tunable the coordinator, chain executor, scan
// engine, and WebSocket surface recognise at startup. Each field is
// individually serde-defaulted, which keeps config files forward-compatible:
// a file written before a field existed still parses, with the new field at
// its documented default. Saving stages the JSON beside the target and
// renames it into place.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_workers() -> usize {
    8
}

fn default_max_concurrent() -> usize {
    10
}

fn default_cache_size() -> usize {
    256
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_queue_size() -> usize {
    128
}

fn default_coalesce_window_ms() -> u64 {
    50
}

fn default_max_symbols_per_call() -> usize {
    50
}

fn default_health_poll_secs() -> u64 {
    5
}

fn default_request_deadline_ms() -> u64 {
    10_000
}

fn default_threshold_low() -> u32 {
    25
}

fn default_threshold_medium() -> u32 {
    50
}

fn default_threshold_high() -> u32 {
    75
}

fn default_threshold_critical() -> u32 {
    100
}

fn default_scan_interval_secs() -> u64 {
    30
}

fn default_scan_max_concurrent() -> usize {
    64
}

fn default_scan_max_results() -> usize {
    100
}

fn default_ws_ping_secs() -> u64 {
    30
}

fn default_ws_queue_size() -> usize {
    1000
}

fn default_ws_max_connections() -> usize {
    256
}

fn default_circuit_max_failures() -> u32 {
    5
}

fn default_circuit_reset_secs() -> u64 {
    30
}

fn default_reorder_threshold() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_eps_price() -> f64 {
    0.01
}

fn default_eps_greeks() -> f64 {
    0.001
}

fn default_eps_score() -> f64 {
    0.5
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:4001".to_string()
}

fn default_iv_history_url() -> String {
    "http://127.0.0.1:4002".to_string()
}

fn default_preset_path() -> String {
    "presets.json".to_string()
}

fn default_drain_timeout_secs() -> u64 {
    10
}

// =============================================================================
// Sections
// =============================================================================

/// Stage-cache settings for the chain executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached filter outputs per scan.
    #[serde(default = "default_cache_size")]
    pub size: usize,

    /// Fallback TTL for filter kinds without an explicit floor.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_default_secs: u64,

    /// Only `lru` is supported.
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    Lru,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::Lru
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            ttl_default_secs: default_cache_ttl_secs(),
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

/// Upstream queue-depth thresholds driving the adaptive backpressure delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueThresholds {
    #[serde(default = "default_threshold_low")]
    pub low: u32,
    #[serde(default = "default_threshold_medium")]
    pub medium: u32,
    #[serde(default = "default_threshold_high")]
    pub high: u32,
    #[serde(default = "default_threshold_critical")]
    pub critical: u32,
}

impl Default for QueueThresholds {
    fn default() -> Self {
        Self {
            low: default_threshold_low(),
            medium: default_threshold_medium(),
            high: default_threshold_high(),
            critical: default_threshold_critical(),
        }
    }
}

/// Request coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Pre-call delay scaling with upstream queue depth. Disabling it pins
    /// every call to the minimum delay.
    #[serde(default = "default_true")]
    pub adaptive_backpressure: bool,

    #[serde(default)]
    pub queue_thresholds: QueueThresholds,

    #[serde(default = "default_health_poll_secs")]
    pub health_poll_interval_secs: u64,

    /// Capacity of the bounded request queue; admission past this fails with
    /// an overload error.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// How long a worker waits to merge overlapping batches.
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,

    /// Upstream limit on symbols per FetchContracts call.
    #[serde(default = "default_max_symbols_per_call")]
    pub max_symbols_per_call: usize,

    /// Per-request deadline applied by the engine when submitting a tick.
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            adaptive_backpressure: true,
            queue_thresholds: QueueThresholds::default(),
            health_poll_interval_secs: default_health_poll_secs(),
            queue_size: default_queue_size(),
            coalesce_window_ms: default_coalesce_window_ms(),
            max_symbols_per_call: default_max_symbols_per_call(),
            request_deadline_ms: default_request_deadline_ms(),
        }
    }
}

/// Scan engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub default_interval_secs: u64,

    /// Maximum number of live scans; admission past this fails with overload.
    #[serde(default = "default_scan_max_concurrent")]
    pub max_concurrent: usize,

    /// Cap applied when a ScanSpec does not set its own.
    #[serde(default = "default_scan_max_results")]
    pub max_results: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_scan_interval_secs(),
            max_concurrent: default_scan_max_concurrent(),
            max_results: default_scan_max_results(),
        }
    }
}

/// WebSocket surface settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ws_ping_secs")]
    pub ping_interval_secs: u64,

    /// Per-subscriber bounded event queue capacity.
    #[serde(default = "default_ws_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_ws_max_connections")]
    pub max_connections: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ws_ping_secs(),
            queue_size: default_ws_queue_size(),
            max_connections: default_ws_max_connections(),
        }
    }
}

/// Circuit breaker settings for the upstream gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_circuit_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_circuit_reset_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_failures: default_circuit_max_failures(),
            reset_timeout_secs: default_circuit_reset_secs(),
        }
    }
}

/// Chain executor tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Minimum per-filter run count before observed stats may reorder the
    /// chain.
    #[serde(default = "default_reorder_threshold")]
    pub reorder_threshold: u64,

    /// Master switch for the skip heuristics. Even when enabled, skips only
    /// apply when the scan interval fits inside the skipped filters' TTLs.
    #[serde(default = "default_true")]
    pub skip_heuristics: bool,

    /// Change-detection thresholds for the tick diff.
    #[serde(default = "default_eps_price")]
    pub eps_price: f64,
    #[serde(default = "default_eps_greeks")]
    pub eps_greeks: f64,
    #[serde(default = "default_eps_score")]
    pub eps_score: f64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            reorder_threshold: default_reorder_threshold(),
            skip_heuristics: true,
            eps_price: default_eps_price(),
            eps_greeks: default_eps_greeks(),
            eps_score: default_eps_score(),
        }
    }
}

// =============================================================================
// ScannerConfig
// =============================================================================

/// Top-level configuration for the SpreadScan engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Coordinator worker count.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Coordinator semaphore capacity (max in-flight upstream calls).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub chain: ChainConfig,

    /// Base URL of the upstream market-data gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Base URL of the historical-IV source.
    #[serde(default = "default_iv_history_url")]
    pub iv_history_url: String,

    /// Path of the preset store file.
    #[serde(default = "default_preset_path")]
    pub preset_path: String,

    /// How long shutdown waits for in-flight tick tasks.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_concurrent: default_max_concurrent(),
            cache: CacheConfig::default(),
            coordinator: CoordinatorConfig::default(),
            scan: ScanConfig::default(),
            websocket: WebSocketConfig::default(),
            circuit: CircuitConfig::default(),
            chain: ChainConfig::default(),
            gateway_url: default_gateway_url(),
            iv_history_url: default_iv_history_url(),
            preset_path: default_preset_path(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl ScannerConfig {
    /// Read and parse the config file at `path`. A missing or malformed file
    /// is the caller's decision: `main` falls back to `Self::default()`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a valid scanner config", path.display()))?;

        info!(
            source = %path.display(),
            workers = config.workers,
            inflight_cap = config.max_concurrent,
            scans_cap = config.scan.max_concurrent,
            "configuration read"
        );
        Ok(config)
    }

    /// Write the config back to `path`. The bytes land in a sibling tmp file
    /// first and are renamed into place, so a crash mid-write leaves either
    /// the old file or the new one, never a truncated mix.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let pretty =
            serde_json::to_string_pretty(self).context("scanner config not serialisable")?;

        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, &pretty)
            .with_context(|| format!("cannot stage config at {}", staging.display()))?;
        std::fs::rename(&staging, path)
            .with_context(|| format!("cannot move staged config into {}", path.display()))?;

        info!(target = %path.display(), "configuration written");
        Ok(())
    }
}
