//! Drives work units end to end: walk, parse, classify, resolve, persist, commit.
//!
//! Units run in parallel on a bounded rayon pool; everything inside one unit is
//! sequential. A unit is committed to the checkpoint only after all of its
//! rows have been written, and any unit-level failure leaves it uncommitted
//! for the next run without stopping the rest of the backlog.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveWalker, WalkError};
use crate::checkpoint::CheckpointManager;
use crate::classify::Classifier;
use crate::config::{PipelineConfig, RecordConfig, PROGRESS_INTERVAL};
use crate::models::{PersistedRow, WorkUnit};
use crate::normalize::{Deduplicator, Normalizer};
use crate::parser::{self, ErrorBudget, RecordFormat};
use crate::source::{SourceAdapter, UnitInput};
use crate::stats::{PipelineStats, ProgressSnapshot};
use crate::store::{EntityStore, StoreError};

/// Why a unit was left uncommitted.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("failed to open unit: {0:#}")]
    Open(anyhow::Error),

    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error("too many malformed records: {errors} of {attempted}")]
    ErrorBudget { attempted: u64, errors: u64 },

    #[error("failed to persist rows: {0}")]
    Store(#[from] StoreError),

    #[error("failed to commit checkpoint: {0:#}")]
    Checkpoint(anyhow::Error),
}

impl UnitError {
    pub fn kind(&self) -> &'static str {
        match self {
            UnitError::Open(_) => "open",
            UnitError::Walk(_) => "archive",
            UnitError::ErrorBudget { .. } => "error_budget",
            UnitError::Store(_) => "store",
            UnitError::Checkpoint(_) => "checkpoint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub unit_id: String,
    pub kind: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub batch_size: usize,
    pub error_budget: ErrorBudget,
    /// Caps how many not-yet-done units this run attempts
    pub limit: Option<usize>,
    pub fields: RecordConfig,
}

impl PipelineOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            workers: config.pipeline.workers,
            batch_size: config.pipeline.batch_size,
            error_budget: ErrorBudget {
                max_error_rate: config.pipeline.max_error_rate,
                min_sample: config.pipeline.min_error_sample,
            },
            limit: None,
            fields: config.records.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitOutcome {
    pub records: u64,
    pub parse_errors: u64,
    pub relevant: u64,
    /// Relevant records whose name was missing or normalized to nothing
    pub unpersisted: u64,
    pub entities: u64,
    pub rows_written: u64,
    pub inner_skipped: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub succeeded: u64,
    /// Sorted by unit id
    pub failed: Vec<FailedUnit>,
    pub skipped_done: u64,
    pub parse_errors: u64,
    pub cancelled: bool,
    pub snapshot: ProgressSnapshot,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

type ProgressFn = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

pub struct Orchestrator {
    source: Box<dyn SourceAdapter>,
    classifier: Classifier,
    normalizer: Normalizer,
    checkpoint: CheckpointManager,
    store: EntityStore,
    options: PipelineOptions,
    cancel: Arc<AtomicBool>,
    on_progress: Option<ProgressFn>,
}

impl Orchestrator {
    pub fn new(
        source: Box<dyn SourceAdapter>,
        classifier: Classifier,
        normalizer: Normalizer,
        checkpoint: CheckpointManager,
        store: EntityStore,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            classifier,
            normalizer,
            checkpoint,
            store,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
            on_progress: None,
        }
    }

    /// Called with a fresh snapshot each time a unit finishes.
    pub fn with_progress(mut self, callback: impl Fn(ProgressSnapshot) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Setting the flag lets in-flight units finish and stops new ones from starting.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn run(&self, stats: &PipelineStats) -> Result<RunReport> {
        let start = Instant::now();
        let units = self
            .source
            .enumerate_units()
            .with_context(|| format!("Failed to enumerate units for source {}", self.source.name()))?;

        let (done, mut pending): (Vec<WorkUnit>, Vec<WorkUnit>) = units
            .into_iter()
            .partition(|u| self.checkpoint.is_done(&u.unit_id));
        if let Some(limit) = self.options.limit {
            pending.truncate(limit);
        }

        stats.set_units_total((done.len() + pending.len()) as u64);
        stats.add_units_skipped(done.len() as u64);
        info!(
            source = %self.source.name(),
            already_done = done.len(),
            pending = pending.len(),
            workers = self.options.workers,
            "Starting run"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers.max(1))
            .thread_name(|i| format!("trawl-worker-{i}"))
            .build()
            .context("Failed to build worker pool")?;

        let succeeded = AtomicU64::new(0);
        let failed = Mutex::new(Vec::new());

        pool.install(|| {
            pending.par_iter().with_max_len(1).for_each(|unit| {
                if self.cancel.load(Ordering::SeqCst) {
                    return;
                }
                match self.process_unit(unit, stats) {
                    Ok(_) => {
                        succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!(
                            unit_id = %unit.unit_id,
                            source_name = %unit.source_name,
                            kind = e.kind(),
                            error = %e,
                            "Unit failed, leaving it for the next run"
                        );
                        stats.inc_units_failed();
                        failed
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .push(FailedUnit {
                                unit_id: unit.unit_id.clone(),
                                kind: e.kind().to_string(),
                                error: e.to_string(),
                            });
                    }
                }
                if let Some(callback) = &self.on_progress {
                    callback(stats.snapshot());
                }
            });
        });

        let mut failed = failed.into_inner().unwrap_or_else(|p| p.into_inner());
        failed.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        let cancelled = self.cancel.load(Ordering::SeqCst);
        if cancelled {
            warn!("Run cancelled, remaining units left for the next run");
        }

        let report = RunReport {
            succeeded: succeeded.into_inner(),
            failed,
            skipped_done: done.len() as u64,
            parse_errors: stats.parse_errors(),
            cancelled,
            snapshot: stats.snapshot(),
        };
        info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            skipped = report.skipped_done,
            parse_errors = report.parse_errors,
            duration_secs = start.elapsed().as_secs_f64(),
            "Run finished"
        );
        Ok(report)
    }

    /// Runs one unit from scratch. On error nothing is committed and the
    /// unit becomes eligible again.
    pub fn process_unit(&self, unit: &WorkUnit, stats: &PipelineStats) -> Result<UnitOutcome, UnitError> {
        let start = Instant::now();
        self.checkpoint.begin(&unit.unit_id);

        let outcome = match self.ingest(unit, stats) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.checkpoint.abandon(&unit.unit_id);
                return Err(e);
            }
        };

        let cursor = self
            .source
            .cursor_after(unit)
            .map(|value| (self.source.name(), value));
        if let Err(e) = self.checkpoint.commit(&unit.unit_id, cursor) {
            self.checkpoint.abandon(&unit.unit_id);
            return Err(UnitError::Checkpoint(e));
        }

        stats.inc_units_done();
        info!(
            unit_id = %unit.unit_id,
            records = outcome.records,
            relevant = outcome.relevant,
            entities = outcome.entities,
            rows_written = outcome.rows_written,
            parse_errors = outcome.parse_errors,
            inner_skipped = outcome.inner_skipped,
            duration_secs = start.elapsed().as_secs_f64(),
            "Unit committed"
        );
        Ok(outcome)
    }

    fn ingest(&self, unit: &WorkUnit, stats: &PipelineStats) -> Result<UnitOutcome, UnitError> {
        let fields = &self.options.fields;
        let budget = self.options.error_budget;
        let source_name = self.source.name();
        let unit_id = unit.unit_id.as_str();

        let cursor = self.checkpoint.cursor(source_name);
        let input = self
            .source
            .open(unit, cursor.as_ref())
            .map_err(UnitError::Open)?;
        let mut walker = match input {
            UnitInput::Path(path) => ArchiveWalker::open(&path)?,
            UnitInput::Stream { name, reader } => ArchiveWalker::open_stream(&name, reader)?,
        };

        let mut dedup = Deduplicator::new(&self.normalizer);
        // (canonical_key, fingerprint) -> (confidence, reasons) for each relevant record
        let mut hits: BTreeMap<(String, String), (f64, Vec<String>)> = BTreeMap::new();
        let mut outcome = UnitOutcome::default();
        let mut attempted = 0u64;

        while let Some(leaf) = walker.next() {
            let leaf = leaf?;
            let Some(format) = RecordFormat::resolve(fields.format, &leaf.path) else {
                debug!(unit_id, path = %leaf.path, "Skipping non-record entry");
                continue;
            };
            if format == RecordFormat::Xml && fields.xml_record_element.is_none() {
                debug!(unit_id, path = %leaf.path, "Skipping XML entry, no record element configured");
                continue;
            }

            let leaf_path = leaf.path.clone();
            let is_root = leaf.depth == 0;
            for item in parser::parse(format, leaf, source_name, unit_id, fields) {
                match item {
                    // The stream broke off; nothing further in this leaf is readable
                    Err(e) if e.is_read_failure() => {
                        if is_root {
                            return Err(UnitError::Walk(WalkError::Corrupt {
                                path: leaf_path,
                                reason: e.to_string(),
                            }));
                        }
                        walker.skip_entry(leaf_path.clone(), e.to_string());
                        break;
                    }
                    Ok(record) => {
                        attempted += 1;
                        outcome.records += 1;
                        stats.add_records(1);
                        let result = self.classifier.classify(
                            &record.payload,
                            &fields.text_fields,
                            fields.name_field.as_deref(),
                        );
                        if result.is_relevant {
                            outcome.relevant += 1;
                            stats.add_relevant(1);
                            let key = result
                                .entity_name_raw
                                .as_deref()
                                .and_then(|name| dedup.observe(name, &result, unit_id));
                            match key {
                                Some(key) => {
                                    hits.insert(
                                        (key, record.fingerprint()),
                                        (result.confidence, result.matched_reasons),
                                    );
                                }
                                None => outcome.unpersisted += 1,
                            }
                        }
                    }
                    Err(e) => {
                        attempted += 1;
                        outcome.parse_errors += 1;
                        stats.add_parse_errors(1);
                        debug!(unit_id, error = %e, "Skipping malformed record");
                    }
                }

                if attempted % PROGRESS_INTERVAL == 0 {
                    info!(
                        unit_id,
                        records = outcome.records,
                        relevant = outcome.relevant,
                        errors = outcome.parse_errors,
                        "Progress"
                    );
                }
                if budget.exceeded(attempted, outcome.parse_errors) {
                    return Err(UnitError::ErrorBudget {
                        attempted,
                        errors: outcome.parse_errors,
                    });
                }
            }
        }

        if budget.exceeded_final(attempted, outcome.parse_errors) {
            return Err(UnitError::ErrorBudget {
                attempted,
                errors: outcome.parse_errors,
            });
        }
        outcome.inner_skipped = walker.skipped().len() as u64;
        stats.add_inner_skipped(outcome.inner_skipped);
        drop(walker);

        outcome.entities = dedup.len() as u64;
        let rows = build_rows(source_name, &dedup, hits);
        for batch in rows.chunks(self.options.batch_size.max(1)) {
            let written = self.store.upsert_batch(batch)? as u64;
            outcome.rows_written += written;
            stats.add_rows_written(written);
        }
        if outcome.unpersisted > 0 {
            debug!(unit_id, count = outcome.unpersisted, "Relevant records without a usable name");
        }
        Ok(outcome)
    }
}

/// Rows carry the record's own score plus the entity as it stands once the
/// whole unit has been seen, so a replayed unit produces identical rows.
fn build_rows(
    source_name: &str,
    dedup: &Deduplicator<'_>,
    hits: BTreeMap<(String, String), (f64, Vec<String>)>,
) -> Vec<PersistedRow> {
    hits.into_iter()
        .filter_map(|((key, fingerprint), (confidence, matched_reasons))| {
            let entity = dedup.get(&key)?;
            Some(PersistedRow {
                source_name: source_name.to_string(),
                canonical_key: key,
                record_fingerprint: fingerprint,
                display_name: entity.display_name.clone(),
                confidence,
                matched_reasons,
                variants: entity.variants.clone(),
                first_seen_unit: entity.first_seen_unit.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CategoryConfig, ClassifierConfig, NormalizerConfig, StoreConfig};
    use crate::retry::RetryPolicy;
    use crate::source::DirectorySource;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn classifier() -> Classifier {
        Classifier::new(&ClassifierConfig {
            normalization_constant: 1.0,
            min_confidence: 0.0,
            categories: vec![
                CategoryConfig {
                    name: "explicit_mentions".into(),
                    weight: Some(0.6),
                    patterns: vec!["china shipping development".into()],
                    exclusions: vec![],
                    regex: false,
                },
                CategoryConfig {
                    name: "state_owned".into(),
                    weight: Some(0.5),
                    patterns: vec!["cosco".into()],
                    exclusions: vec![],
                    regex: false,
                },
            ],
        })
        .unwrap()
    }

    fn fields() -> RecordConfig {
        RecordConfig {
            name_field: Some("name".into()),
            text_fields: vec!["name".into(), "text".into()],
            ..RecordConfig::default()
        }
    }

    fn orchestrator(input: &Path, work: &Path, min_sample: u64) -> Orchestrator {
        let store = EntityStore::open(&work.join("entities.db"), &StoreConfig::default())
            .unwrap()
            .with_retry(RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            });
        Orchestrator::new(
            Box::new(DirectorySource::new("test", input, &[])),
            classifier(),
            Normalizer::new(&NormalizerConfig::default()),
            CheckpointManager::open(work.join("checkpoint.json")).unwrap(),
            store,
            PipelineOptions {
                workers: 2,
                batch_size: 2,
                error_budget: ErrorBudget {
                    max_error_rate: 0.5,
                    min_sample,
                },
                limit: None,
                fields: fields(),
            },
        )
    }

    fn write_lines(path: &Path, lines: &[&str]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, lines.join("\n")).unwrap();
    }

    #[test]
    fn unit_with_relevant_records_is_committed() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        write_lines(
            &input.path().join("a.jsonl"),
            &[
                r#"{"name": "COSCO Shipping Co., Ltd.", "text": "china shipping development"}"#,
                r#"{"name": "Cosco Shipping Co Ltd", "text": "port works"}"#,
                r#"{"name": "Unrelated Inc", "text": "bakery"}"#,
            ],
        );

        let orch = orchestrator(input.path(), work.path(), 1000);
        let stats = PipelineStats::new();
        let report = orch.run(&stats).unwrap();

        assert!(report.is_success());
        assert_eq!(report.succeeded, 1);
        assert!(orch.checkpoint().is_done("a.jsonl"));
        assert_eq!(stats.records(), 3);
        assert_eq!(stats.relevant(), 2);

        let entity = orch.store().entity("test", "cosco shipping").unwrap().unwrap();
        assert_eq!(entity.aggregate_confidence, 1.0);
        assert_eq!(entity.variants.len(), 2);
        assert_eq!(orch.store().row_count().unwrap(), 2);
    }

    #[test]
    fn second_run_skips_committed_units() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        write_lines(&input.path().join("a.jsonl"), &[r#"{"name": "COSCO", "text": ""}"#]);

        orchestrator(input.path(), work.path(), 1000)
            .run(&PipelineStats::new())
            .unwrap();
        let stats = PipelineStats::new();
        let report = orchestrator(input.path(), work.path(), 1000).run(&stats).unwrap();

        assert_eq!(report.skipped_done, 1);
        assert_eq!(report.succeeded, 0);
        assert_eq!(stats.records(), 0);
        assert_eq!(report.snapshot.units_done, 1);
    }

    #[test]
    fn mostly_malformed_unit_is_not_committed() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        write_lines(
            &input.path().join("bad.jsonl"),
            &[r#"{"name": "COSCO"}"#, "{oops", "nope", "[1,"],
        );

        let orch = orchestrator(input.path(), work.path(), 1000);
        let report = orch.run(&PipelineStats::new()).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind, "error_budget");
        assert!(!orch.checkpoint().is_done("bad.jsonl"));
        assert_eq!(orch.store().row_count().unwrap(), 0);
    }

    #[test]
    fn error_budget_aborts_early_once_sample_is_reached() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let mut lines = vec!["garbage"; 6];
        lines.extend([r#"{"name": "COSCO"}"#; 20]);
        write_lines(&input.path().join("bad.jsonl"), &lines);

        let orch = orchestrator(input.path(), work.path(), 4);
        let stats = PipelineStats::new();
        let report = orch.run(&stats).unwrap();
        assert_eq!(report.failed.len(), 1);
        // Stopped at the sample size, not after reading the good tail
        assert_eq!(stats.records(), 0);
    }

    #[test]
    fn failing_unit_does_not_block_others() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        fs::write(input.path().join("broken.zip"), b"not a zip at all").unwrap();
        write_lines(&input.path().join("good.jsonl"), &[r#"{"name": "COSCO"}"#]);

        let orch = orchestrator(input.path(), work.path(), 1000);
        let stats = PipelineStats::new();
        let report = orch.run(&stats).unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].unit_id, "broken.zip");
        assert_eq!(report.failed[0].kind, "archive");
        assert_eq!(stats.units_failed(), 1);
        assert!(orch.checkpoint().is_done("good.jsonl"));
        assert!(!orch.checkpoint().is_done("broken.zip"));
    }

    #[test]
    fn cancelled_run_starts_nothing() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        write_lines(&input.path().join("a.jsonl"), &[r#"{"name": "COSCO"}"#]);

        let orch = orchestrator(input.path(), work.path(), 1000);
        orch.cancel_handle().store(true, Ordering::SeqCst);
        let report = orch.run(&PipelineStats::new()).unwrap();

        assert!(report.cancelled);
        assert_eq!(report.succeeded, 0);
        assert_eq!(orch.checkpoint().processed_count(), 0);
    }

    #[test]
    fn limit_caps_pending_units() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        for name in ["a", "b", "c"] {
            write_lines(&input.path().join(format!("{name}.jsonl")), &[r#"{"name": "x"}"#]);
        }

        let mut orch = orchestrator(input.path(), work.path(), 1000);
        orch.options.limit = Some(2);
        let report = orch.run(&PipelineStats::new()).unwrap();
        assert_eq!(report.succeeded, 2);
        assert!(orch.checkpoint().is_done("a.jsonl"));
        assert!(!orch.checkpoint().is_done("c.jsonl"));
    }

    #[test]
    fn relevant_record_without_name_is_counted_not_persisted() {
        let input = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        write_lines(
            &input.path().join("a.jsonl"),
            &[r#"{"text": "cosco"}"#, r#"{"name": "Ltd.", "text": "cosco"}"#],
        );

        let orch = orchestrator(input.path(), work.path(), 1000);
        let unit = WorkUnit::new("test", "a.jsonl");
        let outcome = orch.process_unit(&unit, &PipelineStats::new()).unwrap();
        assert_eq!(outcome.relevant, 2);
        assert_eq!(outcome.unpersisted, 1);
        assert_eq!(outcome.rows_written, 1);
    }
}
