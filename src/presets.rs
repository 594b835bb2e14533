// =============================================================================
// Preset Store — opaque JSON blobs with atomic file persistence
// =============================================================================
//
// Presets are client-owned scan configurations the scanner stores but never
// interprets. The file is rewritten with a tmp + rename pair so a crash
// mid-save cannot corrupt it. The only durable state in the process.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

pub struct PresetStore {
    path: PathBuf,
    presets: RwLock<HashMap<String, serde_json::Value>>,
}

impl PresetStore {
    /// Open the store at `path`, loading existing presets when the file is
    /// present. A missing file is an empty store, not an error.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let presets = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, serde_json::Value>>(&content)
            {
                Ok(map) => {
                    info!(path = %path.display(), count = map.len(), "preset store loaded");
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "preset store unreadable — starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            presets: RwLock::new(presets),
        }
    }

    pub fn get(&self, id: &str) -> Option<serde_json::Value> {
        self.presets.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.presets.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Insert or replace a preset and persist. Returns true when an existing
    /// preset was replaced.
    pub fn put(&self, id: impl Into<String>, blob: serde_json::Value) -> Result<bool> {
        let replaced = self.presets.write().insert(id.into(), blob).is_some();
        self.save()?;
        Ok(replaced)
    }

    /// Remove a preset and persist. Returns false when the id was unknown.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.presets.write().remove(id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> Result<()> {
        let content = {
            let presets = self.presets.read();
            serde_json::to_string_pretty(&*presets).context("failed to serialise preset store")?
        };

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp presets to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp presets to {}", self.path.display()))?;
        Ok(())
    }
}
