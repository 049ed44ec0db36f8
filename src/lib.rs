//! Trawl: resumable bulk ingestion and entity resolution
//!
//! Pulls very large public bulk datasets (nested archives of JSON or XML
//! records), classifies every record against weighted indicator categories,
//! resolves the names of relevant entities to canonical keys, and upserts the
//! results into SQLite. Runs survive crashes and can be re-run at any time:
//!
//! 1. **Enumerate** -- a [`source::SourceAdapter`] lists deterministic work units
//! 2. **Walk** -- nested tar/zip/gzip/bzip2 containers are streamed depth-first;
//!    only a nested zip is spilled to scratch, and only while it is being walked
//! 3. **Parse** -- leaves are streamed into records (JSON lines, huge JSON arrays,
//!    namespaced XML), skipping and counting malformed ones
//! 4. **Classify & resolve** -- weighted pattern categories score each record;
//!    relevant names are folded to canonical keys and merged per unit
//! 5. **Persist & commit** -- rows are merge-upserted in batches, then the unit is
//!    durably marked done in the checkpoint
//!
//! # Architecture
//!
//! - **Work-unit granularity** -- a unit is committed only after its rows are
//!   flushed, so a crash at any point re-runs at most the in-flight units
//! - **Idempotent upserts** -- rows are keyed by `(source, canonical key, record
//!   fingerprint)` and merged with union/max/min rules
//! - **Parallel units** -- a bounded rayon pool runs independent units; each unit is
//!   processed sequentially
//! - **Atomic counters** -- lock-free [`stats::PipelineStats`] with a pull-based snapshot
//! - **Bounded retry** -- lock contention in SQLite is retried with exponential backoff
//!
//! # Key Modules
//!
//! - [`source`] -- Work-unit enumeration and the built-in directory source
//! - [`archive`] -- Depth-first walker over nested archives
//! - [`parser`] -- Streaming record parsers and the per-unit error budget
//! - [`classify`] -- Weighted category classifier
//! - [`normalize`] -- Canonical keys and per-unit deduplication
//! - [`checkpoint`] -- Durable record of committed units
//! - [`store`] -- SQLite persistence with merge-upsert
//! - [`retry`] -- Exponential backoff for transient errors
//! - [`pipeline`] -- The orchestrator tying it all together
//! - [`models`] -- Core data types (WorkUnit, RawRecord, CanonicalEntity, PersistedRow)
//! - [`stats`] -- Thread-safe counters and progress snapshots
//! - [`config`] -- Constants and the TOML deployment configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Ingest every archive under data/ into entities.db
//! trawl run -c pipeline.toml -i data/ --db entities.db -v
//!
//! # How far along is the backlog?
//! trawl status -c pipeline.toml -i data/
//!
//! # Start over
//! trawl reset --checkpoint data/.trawl/checkpoint.json
//! ```

pub mod archive;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod models;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod stats;
pub mod store;
