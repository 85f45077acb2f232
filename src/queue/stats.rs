use serde::Serialize;
use tokio::time::Instant;

use crate::state_machine::{ItemState, WorkItem};

/// Counts and progress recomputed from item states on every call.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    /// Resolving, authorized or transferring.
    pub in_flight: usize,
    /// Failed and waiting out a backoff.
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duplicate: usize,
    pub cancelled: usize,
    pub bytes_transferred: u64,
    /// Size-weighted progress over items that need bytes moved.
    pub aggregate_progress: f64,
    pub throughput_bps: f64,
}

impl QueueStats {
    pub(super) fn collect<'a>(
        items: impl IntoIterator<Item = &'a WorkItem>,
        first_transfer: Option<Instant>,
    ) -> Self {
        let mut stats = Self::default();
        let mut weighted = 0.0;
        let mut weight = 0.0;

        for item in items {
            stats.total += 1;
            stats.bytes_transferred += item.bytes_transferred;
            match item.state {
                ItemState::Queued => stats.queued += 1,
                ItemState::Resolving | ItemState::Authorized | ItemState::Transferring => {
                    stats.in_flight += 1
                }
                ItemState::Failed if item.retry_pending => stats.retrying += 1,
                ItemState::Failed => stats.failed += 1,
                ItemState::Succeeded => stats.succeeded += 1,
                ItemState::Duplicate => stats.duplicate += 1,
                ItemState::Cancelled => stats.cancelled += 1,
            }
            if !matches!(item.state, ItemState::Duplicate | ItemState::Cancelled) {
                // Empty files still count as one unit of work.
                let size = item.size.max(1) as f64;
                weighted += item.progress * size;
                weight += size;
            }
        }

        stats.aggregate_progress = if weight > 0.0 {
            (weighted / weight).clamp(0.0, 1.0)
        } else if stats.total > 0 && stats.is_idle() {
            1.0
        } else {
            0.0
        };

        if let Some(started) = first_transfer {
            let secs = started.elapsed().as_secs_f64();
            if secs > 0.0 {
                stats.throughput_bps = stats.bytes_transferred as f64 / secs;
            }
        }
        stats
    }

    /// Nothing left to resolve, transfer or retry.
    pub fn is_idle(&self) -> bool {
        self.queued + self.in_flight + self.retrying == 0
    }
}
