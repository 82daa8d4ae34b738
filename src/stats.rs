//! Process-wide ingestion counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::database::StoreSummary;

/// Shared counters, incremented by every session on its happy path and
/// its per-frame error paths. Atomics only; there is no lock to convoy
/// on.
#[derive(Debug, Default)]
pub struct Stats {
    frames: AtomicU64,
    decode_errors: AtomicU64,
    filter_rejections: AtomicU64,
    storage_errors: AtomicU64,
    transport_faults: AtomicU64,
    quota_rejections: AtomicU64,
}

/// Handle cloned into every session.
pub type SharedStats = Arc<Stats>;

impl Stats {
    pub fn new() -> SharedStats {
        Arc::new(Self::default())
    }

    /// Count one processed frame. Returns true when this frame crosses
    /// the reporting interval and the caller should emit a snapshot.
    pub fn frame_processed(&self, interval: u64) -> bool {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        interval > 0 && n % interval == 0
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn filter_rejection(&self) {
        self.filter_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_fault(&self) {
        self.transport_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn quota_rejection(&self) {
        self.quota_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Emit one snapshot line, combining the running counters with the
    /// store's enrichment-completeness numbers.
    pub fn emit(&self, summary: &StoreSummary) {
        info!(
            frames = self.frames.load(Ordering::Relaxed),
            vessels = summary.vessels,
            with_length = summary.with_length,
            with_company = summary.with_company,
            decode_errors = self.decode_errors.load(Ordering::Relaxed),
            filter_rejections = self.filter_rejections.load(Ordering::Relaxed),
            storage_errors = self.storage_errors.load(Ordering::Relaxed),
            transport_faults = self.transport_faults.load(Ordering::Relaxed),
            quota_rejections = self.quota_rejections.load(Ordering::Relaxed),
            "ingestion snapshot"
        );
    }
}
