// =============================================================================
// Historical IV Store — background refresh, lock-free-read percentile lookups
// =============================================================================
//
// The IV Percentile filter must not suspend (the chain executor is pure CPU),
// so history lives in a read-mostly in-process map refreshed by a background
// task. An empty or missing series surfaces as a Dependency error to the
// filter, which the chain executor downgrades to pass-through.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Daily closing IVs per symbol, newest last.
pub struct IvHistoryStore {
    series: RwLock<HashMap<String, Vec<f64>>>,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl IvHistoryStore {
    /// Store backed by an HTTP history source. Endpoint:
    ///   GET {base}/history?symbol=SPY&days=252 -> [f64]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            base_url: Some(base_url.into()),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    /// Detached store with no upstream; series are seeded via
    /// [`insert_series`](Self::insert_series). Used in tests and when the
    /// history source is not configured.
    pub fn detached() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            base_url: None,
            client: reqwest::Client::new(),
        }
    }

    /// Replace the stored series for `symbol`.
    pub fn insert_series(&self, symbol: impl Into<String>, ivs: Vec<f64>) {
        self.series.write().insert(symbol.into(), ivs);
    }

    /// Percentile rank (0–100) of `current_iv` within the last `lookback`
    /// entries of the symbol's history. Returns `None` when no history is
    /// loaded — the caller maps that to a Dependency error.
    pub fn percentile_rank(&self, symbol: &str, current_iv: f64, lookback: usize) -> Option<f64> {
        let series = self.series.read();
        let ivs = series.get(symbol)?;
        if ivs.is_empty() || lookback == 0 {
            return None;
        }

        let window = &ivs[ivs.len().saturating_sub(lookback)..];
        let below = window.iter().filter(|&&v| v <= current_iv).count();
        Some(below as f64 / window.len() as f64 * 100.0)
    }

    /// Fetch fresh history for each of `symbols` from the upstream source.
    /// Failures are logged per symbol and leave the previous series intact.
    pub async fn refresh(&self, symbols: &[String], lookback_days: usize) {
        let Some(base) = &self.base_url else {
            return;
        };

        for symbol in symbols {
            let url = format!("{base}/history?symbol={symbol}&days={lookback_days}");
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<Vec<f64>>().await {
                    Ok(ivs) => {
                        debug!(symbol = %symbol, points = ivs.len(), "IV history refreshed");
                        self.series.write().insert(symbol.clone(), ivs);
                    }
                    Err(e) => warn!(symbol = %symbol, error = %e, "malformed IV history payload"),
                },
                Ok(resp) => {
                    warn!(symbol = %symbol, status = %resp.status(), "IV history fetch rejected")
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "IV history fetch failed"),
            }
        }
    }

    /// Spawn the background refresher. Symbols are read from `symbols_fn` on
    /// each cycle so newly started scans get history without a restart.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval_secs: u64,
        lookback_days: usize,
        symbols_fn: impl Fn() -> Vec<String> + Send + 'static,
    ) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(60)));
            loop {
                interval.tick().await;
                let symbols = symbols_fn();
                if symbols.is_empty() {
                    continue;
                }
                store.refresh(&symbols, lookback_days).await;
            }
        });
    }
}
