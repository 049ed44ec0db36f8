use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use trawl::checkpoint::{self, CheckpointManager};
use trawl::classify::Classifier;
use trawl::config::PipelineConfig;
use trawl::normalize::Normalizer;
use trawl::pipeline::{Orchestrator, PipelineOptions, RunReport};
use trawl::retry::RetryPolicy;
use trawl::source::{DirectorySource, SourceAdapter};
use trawl::stats::PipelineStats;
use trawl::store::EntityStore;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "trawl")]
#[command(about = "Resumable bulk ingestion and entity resolution over nested archives")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv); RUST_LOG overrides it
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every pending unit under the input directory
    Run(RunArgs),
    /// Show how many units are done and pending
    Status(StatusArgs),
    /// Delete the checkpoint so every unit runs again
    Reset(ResetArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Pipeline configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Directory whose files are the work units
    #[arg(short, long)]
    input: PathBuf,

    /// SQLite database receiving resolved entities
    #[arg(long)]
    db: PathBuf,

    /// Checkpoint file (default: <input>/.trawl/checkpoint.json)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Worker threads (overrides the config)
    #[arg(long)]
    workers: Option<usize>,

    /// Limit the number of pending units attempted (for testing)
    #[arg(long)]
    limit: Option<usize>,

    /// Delete the checkpoint and database before starting
    #[arg(long)]
    clean: bool,
}

#[derive(Args)]
struct StatusArgs {
    /// Pipeline configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Directory whose files are the work units
    #[arg(short, long)]
    input: PathBuf,

    /// Checkpoint file (default: <input>/.trawl/checkpoint.json)
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

#[derive(Args)]
struct ResetArgs {
    /// Checkpoint file to delete
    #[arg(long)]
    checkpoint: PathBuf,
}

fn default_checkpoint(input: &Path) -> PathBuf {
    checkpoint::checkpoint_path(&input.join(".trawl"))
}

fn remove_database(db: &Path) -> Result<()> {
    let mut files = vec![db.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = db.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    for file in files.iter().filter(|f| f.exists()) {
        fs::remove_file(file)
            .with_context(|| format!("Failed to remove database file: {}", file.display()))?;
    }
    Ok(())
}

fn make_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} units {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn run_ingest(args: RunArgs) -> Result<bool> {
    let config = PipelineConfig::load(&args.config)
        .with_context(|| format!("Invalid configuration: {}", args.config.display()))?;
    let checkpoint_path = args
        .checkpoint
        .unwrap_or_else(|| default_checkpoint(&args.input));

    if args.clean {
        info!("Cleaning checkpoint and database");
        checkpoint::clear(&checkpoint_path)?;
        remove_database(&args.db)?;
    }

    let classifier = Classifier::new(&config.classifier)?;
    let normalizer = Normalizer::new(&config.normalizer);
    let store = EntityStore::open(&args.db, &config.store)
        .with_context(|| format!("Failed to open database: {}", args.db.display()))?
        .with_retry(RetryPolicy::from(&config.retry));
    let checkpoint = CheckpointManager::open(&checkpoint_path)?;
    let source = DirectorySource::new(&config.source.name, &args.input, &config.source.extensions);

    let mut options = PipelineOptions::from_config(&config);
    if let Some(workers) = args.workers {
        options.workers = workers;
    }
    options.limit = args.limit;

    let pb = make_progress_bar();
    let bar = pb.clone();
    let orchestrator = Orchestrator::new(
        Box::new(source),
        classifier,
        normalizer,
        checkpoint,
        store,
        options,
    )
    .with_progress(move |snap| {
        bar.set_length(snap.units_total);
        bar.set_position(snap.units_done);
        bar.set_message(format!(
            "{} records, {} relevant, {} errors",
            snap.records_scanned, snap.relevant_found, snap.errors
        ));
    });

    let start = Instant::now();
    let stats = PipelineStats::new();
    let report = orchestrator.run(&stats)?;
    pb.finish_and_clear();

    print_summary(&report, &stats, start.elapsed().as_secs_f64());
    Ok(report.is_success())
}

fn print_summary(report: &RunReport, stats: &PipelineStats, secs: f64) {
    println!();
    println!("=== Summary ===");
    println!("Total time:         {:.2}s", secs);
    println!();
    println!("Units total:        {}", report.snapshot.units_total);
    println!("Units succeeded:    {}", report.succeeded);
    println!("Units failed:       {}", report.failed.len());
    println!("Units already done: {}", report.skipped_done);
    println!("Records scanned:    {}", report.snapshot.records_scanned);
    println!("Relevant records:   {}", report.snapshot.relevant_found);
    println!("Parse errors:       {}", report.parse_errors);
    println!("Inner skipped:      {}", stats.inner_skipped());
    println!("Rows written:       {}", stats.rows_written());
    if report.cancelled {
        println!();
        println!("Run was cancelled; pending units remain.");
    }
    if !report.failed.is_empty() {
        println!();
        println!("Failed units:");
        for failed in &report.failed {
            println!("  {} [{}]: {}", failed.unit_id, failed.kind, failed.error);
        }
    }
}

fn run_status(args: StatusArgs) -> Result<()> {
    let config = PipelineConfig::load(&args.config)
        .with_context(|| format!("Invalid configuration: {}", args.config.display()))?;
    let checkpoint_path = args
        .checkpoint
        .unwrap_or_else(|| default_checkpoint(&args.input));
    let checkpoint = CheckpointManager::open(&checkpoint_path)?;
    let source = DirectorySource::new(&config.source.name, &args.input, &config.source.extensions);

    let classifier = Classifier::new(&config.classifier)?;
    let units = source.enumerate_units()?;
    let done = units
        .iter()
        .filter(|u| checkpoint.is_done(&u.unit_id))
        .count();

    println!("Source:       {}", source.name());
    println!("Input:        {}", source.root().display());
    println!(
        "Categories:   {}",
        classifier.category_names().collect::<Vec<_>>().join(", ")
    );
    println!("Checkpoint:   {}", checkpoint.path().display());
    println!("Last updated: {}", checkpoint.snapshot().last_updated.to_rfc3339());
    println!("Units total:  {}", units.len());
    println!("Units done:   {}", done);
    println!("Pending:      {}", units.len() - done);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::Run(args) => run_ingest(args),
        Commands::Status(args) => run_status(args).map(|()| true),
        Commands::Reset(args) => checkpoint::clear(&args.checkpoint).map(|()| true),
    };

    match result {
        Ok(true) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            error!("Some units failed; re-run to retry them");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
