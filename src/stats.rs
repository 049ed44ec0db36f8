use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one run. Owned by the caller, updated only by the orchestrator.
#[derive(Default)]
pub struct PipelineStats {
    pub units_total: AtomicU64,
    pub units_done: AtomicU64,
    pub units_failed: AtomicU64,
    pub units_skipped: AtomicU64,
    pub records_scanned: AtomicU64,
    pub relevant_found: AtomicU64,
    pub parse_errors: AtomicU64,
    pub inner_skipped: AtomicU64,
    pub rows_written: AtomicU64,
}

/// Point-in-time view for progress reporting; pulled, never pushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub units_total: u64,
    pub units_done: u64,
    pub records_scanned: u64,
    pub relevant_found: u64,
    pub errors: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_units_total(&self, count: u64) {
        self.units_total.store(count, Ordering::Relaxed);
    }

    pub fn inc_units_done(&self) {
        self.units_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_units_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_units_skipped(&self, count: u64) {
        self.units_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_records(&self, count: u64) {
        self.records_scanned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_relevant(&self, count: u64) {
        self.relevant_found.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_parse_errors(&self, count: u64) {
        self.parse_errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_inner_skipped(&self, count: u64) {
        self.inner_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_rows_written(&self, count: u64) {
        self.rows_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn units_total(&self) -> u64 {
        self.units_total.load(Ordering::Relaxed)
    }

    pub fn units_done(&self) -> u64 {
        self.units_done.load(Ordering::Relaxed)
    }

    pub fn units_failed(&self) -> u64 {
        self.units_failed.load(Ordering::Relaxed)
    }

    pub fn units_skipped(&self) -> u64 {
        self.units_skipped.load(Ordering::Relaxed)
    }

    pub fn records(&self) -> u64 {
        self.records_scanned.load(Ordering::Relaxed)
    }

    pub fn relevant(&self) -> u64 {
        self.relevant_found.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn inner_skipped(&self) -> u64 {
        self.inner_skipped.load(Ordering::Relaxed)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// `units_done` counts units finished this run, committed or already done.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            units_total: self.units_total(),
            units_done: self.units_done() + self.units_skipped(),
            records_scanned: self.records(),
            relevant_found: self.relevant(),
            errors: self.parse_errors(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn new_creates_zeroed_stats() {
        let stats = PipelineStats::new();
        assert_eq!(stats.snapshot(), ProgressSnapshot::default());
        assert_eq!(stats.units_failed(), 0);
        assert_eq!(stats.inner_skipped(), 0);
    }

    #[test]
    fn snapshot_counts_skipped_units_as_done() {
        let stats = PipelineStats::new();
        stats.set_units_total(5);
        stats.add_units_skipped(2);
        stats.inc_units_done();
        stats.inc_units_failed();
        stats.add_records(100);
        stats.add_relevant(7);
        stats.add_parse_errors(3);

        let snap = stats.snapshot();
        assert_eq!(snap.units_total, 5);
        assert_eq!(snap.units_done, 3);
        assert_eq!(snap.records_scanned, 100);
        assert_eq!(snap.relevant_found, 7);
        assert_eq!(snap.errors, 3);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let stats = PipelineStats::new();
        stats.add_records(42);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["records_scanned"], 42);
        assert_eq!(json["units_total"], 0);
    }

    #[test]
    fn concurrent_updates_are_all_counted() {
        let stats = Arc::new(PipelineStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.add_records(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.records(), 8000);
    }
}
