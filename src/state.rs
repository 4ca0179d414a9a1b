// =============================================================================
// Central Engine State — Vanta Exit Sentinel
// =============================================================================
//
// The single source of truth tying the subsystems together. All async tasks
// hold `Arc<EngineState>`.
//
// Thread safety:
//   - `parking_lot::RwLock` for the configuration.
//   - The registry serializes per-position internally.
//   - Atomic counters for lock-free observability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::ingest::EventRouter;
use crate::notify::NotificationSink;
use crate::persist::SnapshotStore;
use crate::registry::PositionRegistry;

// =============================================================================
// Counters
// =============================================================================

/// Lock-free counters exposed via `GET /stats`. Dropped events are counted,
/// never raised.
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Events discarded by timestamp gating or inactive positions.
    pub stale_events_discarded: AtomicU64,
    /// Decisions skipped because the (kind, level) had already fired.
    pub duplicate_triggers_ignored: AtomicU64,
    /// Webhook payloads outside the consumed categories.
    pub pushes_ignored: AtomicU64,
    pub sells_executed: AtomicU64,
    pub sells_failed: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            stale_events_discarded: self.stale_events_discarded.load(Ordering::Relaxed),
            duplicate_triggers_ignored: self.duplicate_triggers_ignored.load(Ordering::Relaxed),
            pushes_ignored: self.pushes_ignored.load(Ordering::Relaxed),
            sells_executed: self.sells_executed.load(Ordering::Relaxed),
            sells_failed: self.sells_failed.load(Ordering::Relaxed),
        }
    }
}

/// Serialisable view of [`EngineCounters`].
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub stale_events_discarded: u64,
    pub duplicate_triggers_ignored: u64,
    pub pushes_ignored: u64,
    pub sells_executed: u64,
    pub sells_failed: u64,
}

// =============================================================================
// EngineState
// =============================================================================

/// Central state shared across all async tasks via `Arc<EngineState>`.
pub struct EngineState {
    pub config: RwLock<EngineConfig>,
    pub registry: Arc<PositionRegistry>,
    pub router: EventRouter,
    pub sink: Arc<NotificationSink>,
    pub store: Arc<SnapshotStore>,
    pub counters: Arc<EngineCounters>,

    /// Instant when the engine was started. Used for uptime reporting.
    pub start_time: Instant,
}

impl EngineState {
    pub fn new(config: EngineConfig) -> Self {
        let sink = Arc::new(NotificationSink::new(
            config.sink_url.clone(),
            std::time::Duration::from_secs(config.request_timeout_secs),
        ));
        let store = Arc::new(SnapshotStore::new(config.snapshot_path.clone()));

        Self {
            config: RwLock::new(config),
            registry: Arc::new(PositionRegistry::new()),
            router: EventRouter::new(),
            sink,
            store,
            counters: Arc::new(EngineCounters::default()),
            start_time: Instant::now(),
        }
    }

    /// Persist the full position set, logging (not propagating) failures —
    /// a snapshot miss must never stall the exit pipeline.
    pub fn persist_positions(&self) {
        if let Err(e) = self.store.save(&self.registry.all_positions()) {
            tracing::error!(error = %e, "position snapshot failed");
        }
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("registry", &self.registry)
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish()
    }
}
