use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pubmed2gene_sync::LoadOptions;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "pubmed2gene")]
#[command(about = "Load PubMed/Entrez Gene reference associations")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile, bulk load and submit status updates.
    Run(RunArgs),
    /// Reconcile and write the bulk file only.
    DryRun(SourceArgs),
}

#[derive(Debug, Default, Args)]
struct SourceArgs {
    /// Read a JSON fixture store instead of the curation database.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long)]
    skip_status_updates: bool,
}

fn init_tracing() -> Result<()> {
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let diagnostic = match std::env::var("LOG_DIAG") {
        Ok(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening diagnostic log {path}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            )
        }
        Err(_) => None,
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pubmed2gene=info".into()),
        )
        .with(stderr)
        .with(diagnostic)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let (options, fixture) = match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => (
            LoadOptions {
                bulk_load: true,
                status_updates: !args.skip_status_updates,
            },
            args.source.fixture,
        ),
        Commands::DryRun(args) => (LoadOptions::dry_run(), args.fixture),
    };

    match pubmed2gene_sync::run_load_once_from_env(options, fixture).await {
        Ok(summary) => {
            info!(run_id = %summary.run_id, "run finished");
            println!(
                "load complete: run_id={} feed_pairs={} added={} deleted={} status_updates={} bulk_file={}",
                summary.run_id,
                summary.total_feed_pairs,
                summary.added,
                summary.deleted,
                summary.status_updates,
                summary.bulk_file
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "load failed");
            Err(err)
        }
    }
}
