// =============================================================================
// Upstream Market-Data Gateway Client
// =============================================================================
//
// The brokerage gateway is an external collaborator with two operations:
// batched contract fetches and a health probe reporting its own queue depth.
// The trait seam exists so the coordinator can be exercised against a mock in
// tests; `HttpGateway` is the production implementation.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::ScanError;
use crate::types::Contract;

/// Health snapshot reported by the gateway's own health endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GatewayHealth {
    /// Depth of the gateway's internal request queue.
    #[serde(default)]
    pub queue_depth: u32,
    /// Recent round-trip time to the brokerage, in milliseconds.
    #[serde(default)]
    pub rtt_ms: u64,
    /// Errors observed by the gateway in its recent window.
    #[serde(default)]
    pub recent_errors: u32,
}

/// Batched market-data access consumed by the request coordinator.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    /// Fetch all option contracts (all listed expiries and strikes) for each
    /// of `symbols`.
    async fn fetch_contracts(&self, symbols: &[String]) -> Result<Vec<Contract>, ScanError>;

    /// Probe the gateway's health endpoint.
    async fn health(&self) -> Result<GatewayHealth, ScanError>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// REST gateway client. Endpoints:
///   GET {base}/contracts?symbols=A,B,C  -> [Contract]
///   GET {base}/health                   -> GatewayHealth
#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "HttpGateway initialised");

        Self { base_url, client }
    }
}

#[async_trait]
impl MarketGateway for HttpGateway {
    #[instrument(skip(self), fields(n = symbols.len()), name = "gateway::fetch_contracts")]
    async fn fetch_contracts(&self, symbols: &[String]) -> Result<Vec<Contract>, ScanError> {
        let url = format!("{}/contracts?symbols={}", self.base_url, symbols.join(","));

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ScanError::Dependency(format!("gateway request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScanError::Dependency(format!(
                "gateway returned {status} for contract fetch"
            )));
        }

        let contracts: Vec<Contract> = resp
            .json()
            .await
            .map_err(|e| ScanError::Dependency(format!("malformed contract payload: {e}")))?;

        debug!(count = contracts.len(), "contracts fetched");
        Ok(contracts)
    }

    #[instrument(skip(self), name = "gateway::health")]
    async fn health(&self) -> Result<GatewayHealth, ScanError> {
        let url = format!("{}/health", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ScanError::Dependency(format!("gateway health probe failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ScanError::Dependency(format!(
                "gateway health returned {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| ScanError::Dependency(format!("malformed health payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_deserialises_with_missing_fields() {
        let h: GatewayHealth = serde_json::from_str(r#"{ "queue_depth": 42 }"#).unwrap();
        assert_eq!(h.queue_depth, 42);
        assert_eq!(h.rtt_ms, 0);
        assert_eq!(h.recent_errors, 0);
    }
}
