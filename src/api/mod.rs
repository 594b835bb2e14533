// =============================================================================
// API surface — REST routes, subscription WebSocket, bearer auth
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

use std::sync::Arc;

use crate::config::ScannerConfig;
use crate::engine::ScanEngine;
use crate::presets::PresetStore;

/// Shared state handed to every handler.
pub struct ApiState {
    pub engine: Arc<ScanEngine>,
    pub presets: Arc<PresetStore>,
    config: ScannerConfig,
}

impl ApiState {
    pub fn new(engine: Arc<ScanEngine>, presets: Arc<PresetStore>, config: ScannerConfig) -> Self {
        Self {
            engine,
            presets,
            config,
        }
    }

    pub fn engine_config(&self) -> &ScannerConfig {
        &self.config
    }
}
