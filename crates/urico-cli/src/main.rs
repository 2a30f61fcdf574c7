use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use urico_core::{Axis, DataKind, Target, TargetFilter};
use urico_sync::{
    dedup_targets, failed_targets, render_progress_markdown, BatchOptions, BatchRunner,
    BatchSummary, BundleMerger, LegacyLogScanner, OutcomeLog, ProgressReport, SyncConfig,
    TargetPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "urico")]
#[command(about = "Buyer-interest dataset generation pipeline")]
struct Cli {
    /// Workspace root (overrides URICO_WORKSPACE_ROOT).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    max_retries: Option<u32>,
    /// Kill the generation tool after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Print the batch summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(long)]
    kind: DataKind,
    #[arg(long)]
    pref: Option<String>,
    #[arg(long)]
    city: Option<String>,
    #[arg(long)]
    rail: Option<String>,
    #[arg(long)]
    line: Option<String>,
    #[arg(long)]
    station: Option<String>,
}

impl TargetArgs {
    fn into_target(self) -> Result<Target> {
        match self {
            TargetArgs {
                kind,
                pref: Some(pref),
                city: Some(city),
                rail: None,
                line: None,
                station: None,
            } => Ok(Target::area(kind, pref, city)),
            TargetArgs {
                kind,
                pref: None,
                city: None,
                rail: Some(rail),
                line: Some(line),
                station: Some(station),
            } => Ok(Target::station(kind, rail, line, station)),
            _ => bail!("give either --pref/--city or --rail/--line/--station"),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate one target.
    Generate {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Generate every enumerated target (both kinds unless --kind is given).
    Batch {
        #[arg(long)]
        kind: Option<DataKind>,
        #[arg(long)]
        pref: Option<String>,
        #[arg(long)]
        axis: Option<Axis>,
        /// Delete existing output and regenerate.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        delay_secs: Option<u64>,
        /// List the targets without generating.
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Re-drive failed targets from outcomes.jsonl, or from legacy run logs.
    Retry {
        #[arg(long = "legacy-log")]
        legacy_logs: Vec<PathBuf>,
        /// Data kind of the legacy logs.
        #[arg(long)]
        kind: Option<DataKind>,
        #[arg(long)]
        delay_secs: Option<u64>,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Merge generated files into bundle.json and the per-kind JS modules.
    Bundle {
        /// Output directory (defaults to the workspace root).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show generated vs total targets per prefecture.
    Progress {
        #[arg(long)]
        kind: Option<DataKind>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn kinds(kind: Option<DataKind>) -> Vec<DataKind> {
    kind.map_or_else(|| DataKind::ALL.to_vec(), |k| vec![k])
}

fn apply_run_args(config: &mut SyncConfig, run: &RunArgs) {
    if let Some(max_retries) = run.max_retries {
        config.retry.max_retries = max_retries;
    }
    if let Some(secs) = run.timeout_secs {
        config.timeout = Some(Duration::from_secs(secs));
    }
}

async fn run_batch(
    config: &SyncConfig,
    options: BatchOptions,
    targets: Vec<Target>,
    json: bool,
) -> Result<ExitCode> {
    let pipeline = Arc::new(TargetPipeline::from_config(config)?);
    let outcomes = Arc::new(OutcomeLog::new(config.outcomes_path()));
    let summary = BatchRunner::new(pipeline, options)
        .with_outcome_log(outcomes)
        .run(targets)
        .await;
    report(&summary, json)
}

fn report(summary: &BatchSummary, json: bool) -> Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    }
    Ok(if summary.all_failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env_with_root(cli.root);

    match cli.command {
        Commands::Generate { target, force, run } => {
            apply_run_args(&mut config, &run);
            let target = target.into_target()?;
            let options = BatchOptions {
                concurrency: 1,
                delay: Duration::ZERO,
                force,
            };
            run_batch(&config, options, vec![target], run.json).await
        }
        Commands::Batch {
            kind,
            pref,
            axis,
            force,
            concurrency,
            delay_secs,
            dry_run,
            run,
        } => {
            apply_run_args(&mut config, &run);
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency.max(1);
            }
            if let Some(secs) = delay_secs {
                config.delay = Duration::from_secs(secs);
            }
            let geography = config.load_geography()?;
            let filter = TargetFilter {
                prefecture: pref,
                axis,
            };
            let targets = kinds(kind)
                .into_iter()
                .flat_map(|k| geography.enumerate(k, &filter))
                .collect::<Vec<_>>();
            info!(targets = targets.len(), "targets enumerated");

            if dry_run {
                for (idx, target) in targets.iter().enumerate() {
                    println!("[{}/{}] {target}", idx + 1, targets.len());
                }
                return Ok(ExitCode::SUCCESS);
            }
            let options = BatchOptions {
                force,
                ..BatchOptions::from_config(&config)
            };
            run_batch(&config, options, targets, run.json).await
        }
        Commands::Retry {
            legacy_logs,
            kind,
            delay_secs,
            dry_run,
            run,
        } => {
            apply_run_args(&mut config, &run);
            let targets = if legacy_logs.is_empty() {
                let outcomes = OutcomeLog::new(config.outcomes_path());
                failed_targets(&outcomes.read_all().await?)
            } else {
                let kind = kind.context("--kind is required with --legacy-log")?;
                let scanner = LegacyLogScanner::default();
                let mut found = Vec::new();
                for path in &legacy_logs {
                    let text = std::fs::read_to_string(path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    for failure in scanner.scan(kind, &text) {
                        info!(
                            log = %path.display(),
                            line = failure.failure_line,
                            label = %failure.target.label(),
                            "failed target found in legacy log"
                        );
                        found.push(failure.target);
                    }
                }
                dedup_targets(found)
            };

            if targets.is_empty() {
                println!("再試行が必要なターゲットはありません");
                return Ok(ExitCode::SUCCESS);
            }
            if dry_run {
                for target in &targets {
                    println!("{target}");
                }
                return Ok(ExitCode::SUCCESS);
            }
            let delay = delay_secs.map_or(config.delay, Duration::from_secs);
            run_batch(&config, BatchOptions::for_retry(delay), targets, run.json).await
        }
        Commands::Bundle { out } => {
            let out_dir = out.unwrap_or_else(|| config.workspace_root.clone());
            let merger = BundleMerger::new(config.locator());
            let artifact = merger.build()?;
            let files = merger.write(&artifact, &out_dir).await?;
            for (kind, totals) in &artifact.totals {
                println!(
                    "{}: {} records, {} buyers",
                    kind.type_label(),
                    totals.records,
                    totals.buyers
                );
            }
            println!("wrote {}", files.bundle_json.display());
            for module in &files.modules {
                println!("wrote {}", module.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Progress { kind } => {
            let geography = config.load_geography()?;
            let locator = config.locator();
            let reports = kinds(kind)
                .into_iter()
                .map(|k| ProgressReport::collect(&geography, &locator, k))
                .collect::<Vec<_>>();
            println!("{}", render_progress_markdown(&reports));
            Ok(ExitCode::SUCCESS)
        }
    }
}
