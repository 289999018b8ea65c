//! Tandem binary - composition root.
//!
//! 1. Parse the command line and load configuration from TOML
//! 2. Initialize tracing
//! 3. Wire the state store and the providers the command needs
//! 4. Run the command and map its error onto the process exit code

mod cli;
mod wiring;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use tandem_catalog::{CatalogStore, StatusPredicate};
use tandem_core::config::TandemConfig;
use tandem_core::types::Stage;
use tandem_core::{Result, TandemError};
use tandem_pipeline::{RunReport, Step};
use tandem_storage::SyncOutcome;

use cli::{CliArgs, Command};
use wiring::{build_pipeline, require_digest, require_feed, Role};

fn load_config(args: &CliArgs) -> Result<(TandemConfig, bool)> {
    let path = args.resolve_config_path();
    if path.exists() {
        Ok((TandemConfig::load(&path)?, true))
    } else {
        Ok((TandemConfig::default(), false))
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_run(report: &RunReport) {
    for stage in &report.stages {
        println!("{}", stage);
    }
    print_sync(&report.sync);
}

fn print_sync(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Committed {
            revision,
            applied,
            attempts,
            ..
        } => println!(
            "committed {} ({} changes, attempt {})",
            revision, applied, attempts
        ),
        SyncOutcome::UpToDate { revision, .. } => println!("nothing to commit at {}", revision),
    }
    if !outcome.dropped().is_empty() {
        println!(
            "{} local changes superseded by the other environment",
            outcome.dropped().len()
        );
    }
}

fn print_status(revision: &str, catalog: &CatalogStore, limit: usize) {
    let summary = catalog.snapshot().summary();
    println!("revision:     {}", revision);
    println!("videos:       {}", summary.videos);
    for (label, counts) in [
        ("transcript", &summary.transcript),
        ("analysis", &summary.analysis),
        ("publish", &summary.publish),
    ] {
        let parts: Vec<String> = counts.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        println!("{:<13} {}", format!("{}:", label), parts.join(" "));
    }
    println!("abandoned:    {}", summary.abandoned);
    println!("swept:        {}", summary.swept);
    println!(
        "transcripts:  {} ({} bytes)",
        summary.transcripts, summary.transcript_bytes
    );
    println!("results:      {}", summary.results);
    match catalog.snapshot().latest_digest() {
        Some(latest) => println!(
            "digests:      {} (latest {} at {})",
            summary.digests,
            latest.period,
            latest.created_at.format("%Y-%m-%d %H:%M")
        ),
        None => println!("digests:      0"),
    }

    if limit == 0 {
        return;
    }
    println!();
    for record in catalog.list(&StatusPredicate::any()).into_iter().take(limit) {
        let mut flags = Vec::new();
        if record.is_abandoned() {
            flags.push("abandoned");
        }
        if record.is_swept() {
            flags.push("swept");
        }
        println!(
            "{:<14} {:<11} {:<15} {:<11} {:<24} {}",
            record.id,
            record.transcript_status,
            record.analysis_status,
            record.publish_status,
            flags.join(","),
            record.source.title
        );
        if let Some(err) = record.last_error.as_deref().filter(|_| record.is_abandoned()) {
            println!("{:<14} last error: {}", "", err);
        }
    }
}

async fn run_single(config: &TandemConfig, step: Step) -> Result<()> {
    let pipeline = build_pipeline(config, Role::Process)?;
    print_run(&pipeline.run(step.as_str(), &[step]).await?);
    Ok(())
}

async fn run(args: CliArgs, config: TandemConfig) -> Result<()> {
    let config_path = args.resolve_config_path();
    match args.command {
        Command::Fetch => {
            let report = build_pipeline(&config, Role::Fetch)?.run_fetch().await?;
            print_run(&report);
        }
        Command::Process => {
            let report = build_pipeline(&config, Role::Process)?.run_process().await?;
            print_run(&report);
        }
        Command::Discover => {
            require_feed(&config)?;
            let pipeline = build_pipeline(&config, Role::Fetch)?;
            print_run(&pipeline.run("discover", &[Step::Discover]).await?);
        }
        Command::Analyze => run_single(&config, Step::Analyze).await?,
        Command::Publish => run_single(&config, Step::Publish).await?,
        Command::Digest => {
            require_digest(&config)?;
            run_single(&config, Step::Digest).await?
        }
        Command::Sweep => run_single(&config, Step::Sweep).await?,
        Command::Status { limit } => {
            let copy = build_pipeline(&config, Role::Admin)?.checkout().await?;
            print_status(copy.revision.as_str(), &copy.catalog, limit);
        }
        Command::Requeue { id, stage } => {
            let id = CatalogStore::parse_id(&id)?;
            let stage: Stage = stage.parse().map_err(TandemError::InvalidInput)?;
            let outcome = build_pipeline(&config, Role::Admin)?
                .requeue(&id, stage)
                .await?;
            print_sync(&outcome);
        }
        Command::Reanalyze { id } => {
            let id = CatalogStore::parse_id(&id)?;
            let outcome = build_pipeline(&config, Role::Admin)?.reanalyze(&id).await?;
            print_sync(&outcome);
        }
        Command::InitConfig { path, force } => {
            let path = path.unwrap_or(config_path);
            if path.exists() && !force {
                return Err(TandemError::InvalidInput(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            TandemConfig::default().save(&path)?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let (config, from_file) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            init_tracing(&args.resolve_log_level("info"));
            error!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };
    init_tracing(&args.resolve_log_level(&config.general.log_level));

    info!("Starting Tandem v{}", env!("CARGO_PKG_VERSION"));
    if from_file {
        info!(path = %args.resolve_config_path().display(), "Configuration loaded");
    } else if !matches!(args.command, Command::InitConfig { .. }) {
        warn!(
            path = %args.resolve_config_path().display(),
            "No configuration file, using defaults"
        );
    }

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
