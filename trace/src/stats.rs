use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// AgentStats counts every fault the agent absorbs instead of surfacing.
///
/// Counters only ever increase. They are shared by the tracer, the diagnostic
/// intake and the export pipeline.
#[derive(Debug, Default)]
pub struct AgentStats {
    // data quality
    pub(crate) orphaned_spans: AtomicU64,
    pub(crate) double_ends: AtomicU64,
    pub(crate) out_of_order_stops: AtomicU64,
    pub(crate) unmatched_errors: AtomicU64,
    pub(crate) unknown_source_events: AtomicU64,
    pub(crate) unsampled_dropped: AtomicU64,
    pub(crate) max_spans_dropped: AtomicU64,
    pub(crate) unscoped_segments: AtomicU64,
    // resource exhaustion
    pub(crate) queue_dropped: AtomicU64,
    pub(crate) oversize_dropped: AtomicU64,
    pub(crate) rejected_after_shutdown: AtomicU64,
    pub(crate) capture_only_dropped: AtomicU64,
    // transport
    pub(crate) sent_records: AtomicU64,
    pub(crate) sent_batches: AtomicU64,
    pub(crate) failed_batches: AtomicU64,
    pub(crate) failed_records: AtomicU64,
    pub(crate) transport_retries: AtomicU64,
    pub(crate) shutdown_discarded: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// StatsSnapshot is a point-in-time copy of [`AgentStats`].
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default, Serialize)]
pub struct StatsSnapshot {
    pub orphaned_spans: u64,
    pub double_ends: u64,
    pub out_of_order_stops: u64,
    pub unmatched_errors: u64,
    pub unknown_source_events: u64,
    pub unsampled_dropped: u64,
    pub max_spans_dropped: u64,
    /// Segments started in async code without a task-local slot, which
    /// therefore never became current.
    pub unscoped_segments: u64,
    pub queue_dropped: u64,
    pub oversize_dropped: u64,
    pub rejected_after_shutdown: u64,
    pub capture_only_dropped: u64,
    pub sent_records: u64,
    pub sent_batches: u64,
    pub failed_batches: u64,
    pub failed_records: u64,
    pub transport_retries: u64,
    pub shutdown_discarded: u64,
}

impl AgentStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            orphaned_spans: load(&self.orphaned_spans),
            double_ends: load(&self.double_ends),
            out_of_order_stops: load(&self.out_of_order_stops),
            unmatched_errors: load(&self.unmatched_errors),
            unknown_source_events: load(&self.unknown_source_events),
            unsampled_dropped: load(&self.unsampled_dropped),
            max_spans_dropped: load(&self.max_spans_dropped),
            unscoped_segments: load(&self.unscoped_segments),
            queue_dropped: load(&self.queue_dropped),
            oversize_dropped: load(&self.oversize_dropped),
            rejected_after_shutdown: load(&self.rejected_after_shutdown),
            capture_only_dropped: load(&self.capture_only_dropped),
            sent_records: load(&self.sent_records),
            sent_batches: load(&self.sent_batches),
            failed_batches: load(&self.failed_batches),
            failed_records: load(&self.failed_records),
            transport_retries: load(&self.transport_retries),
            shutdown_discarded: load(&self.shutdown_discarded),
        }
    }
}

impl StatsSnapshot {
    /// Records that entered the export queue but were never delivered.
    pub fn export_dropped(&self) -> u64 {
        self.queue_dropped
            + self.oversize_dropped
            + self.failed_records
            + self.shutdown_discarded
            + self.rejected_after_shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = AgentStats::default();
        bump(&stats.queue_dropped);
        add(&stats.shutdown_discarded, 4);
        add(&stats.sent_records, 10);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queue_dropped, 1);
        assert_eq!(snapshot.sent_records, 10);
        assert_eq!(snapshot.export_dropped(), 5);
        assert_eq!(snapshot.double_ends, 0);
    }
}
