// =============================================================================
// Snapshot Store — durable position state across restarts
// =============================================================================
//
// The full position set (active and closed, every field including the
// fired-trigger set) is written as pretty JSON with an atomic tmp + rename,
// on every applied exit and on a timer. A restart reloads the snapshot and
// resumes monitoring without re-firing already-executed triggers or losing
// thresholds.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::registry::Position;

/// Atomic JSON file store for the position set.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persist all positions. Write to `.tmp`, then rename, so a crash
    /// mid-write never corrupts the previous snapshot.
    pub fn save(&self, positions: &[Position]) -> Result<()> {
        let content = serde_json::to_string_pretty(positions)
            .context("failed to serialise position snapshot")?;

        let tmp_path = self.path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", self.path.display()))?;

        info!(
            path = %self.path.display(),
            count = positions.len(),
            "position snapshot saved (atomic)"
        );
        Ok(())
    }

    /// Load the persisted position set. A missing file is a fresh start, not
    /// an error.
    pub fn load(&self) -> Result<Vec<Position>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no position snapshot — starting fresh");
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read snapshot from {}", self.path.display()))?;

        let positions: Vec<Position> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse snapshot from {}", self.path.display()))?;

        info!(
            path = %self.path.display(),
            count = positions.len(),
            "position snapshot loaded"
        );
        Ok(positions)
    }
}

// =============================================================================
// Tests
// =============================================================================
