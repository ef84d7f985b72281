use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rws_sync::{BatchPolicy, ReportRegistry, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rws-cli")]
#[command(about = "Sync Looker reports into warehouse tables")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Transfer reports into their target tables (every enabled report by default).
    Sync {
        /// Report title to transfer; repeat for several.
        #[arg(long = "report", value_name = "NAME")]
        reports: Vec<String>,
        #[arg(long, conflicts_with = "abort_on_error")]
        continue_on_error: bool,
        #[arg(long)]
        abort_on_error: bool,
        /// Merge into an in-memory warehouse instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Drop leftover staging tables for every registered report.
    Sweep,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("rws_sync=info,rws_adapters=info,rws_cli=info"))
        .context("building log filter")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync {
        reports: Vec::new(),
        continue_on_error: false,
        abort_on_error: false,
        dry_run: false,
    }) {
        Commands::Sync {
            reports,
            continue_on_error,
            abort_on_error,
            dry_run,
        } => {
            if continue_on_error {
                config.batch_policy = BatchPolicy::Continue;
            } else if abort_on_error {
                config.batch_policy = BatchPolicy::Abort;
            }
            let summary = rws_sync::run_sync_once(&config, &reports, dry_run).await?;

            for outcome in &summary.outcomes {
                match &outcome.result {
                    Ok(run) => println!("ok    {}", run.message()),
                    Err(err) => println!("fail  {:?}: [{}] {}", outcome.report, err.kind(), err),
                }
            }
            for name in &summary.skipped {
                println!("skip  {name:?}");
            }
            println!(
                "sync complete: {} of {} reports succeeded, {} skipped",
                summary.succeeded(),
                summary.outcomes.len() + summary.skipped.len(),
                summary.skipped.len()
            );
            if !summary.is_success() {
                bail!("sync finished with failures");
            }
        }
        Commands::Sweep => {
            let registry = ReportRegistry::load(&config.reports_file).await?;
            let pipeline = SyncPipeline::from_config(&config, false).await?;
            let dropped = pipeline.sweep_staging(&registry.reports).await?;
            info!(count = dropped.len(), "sweep finished");
            for table in &dropped {
                println!("dropped {table}");
            }
            println!("sweep complete: {} staging tables dropped", dropped.len());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_sync_flags() {
        let cli = Cli::try_parse_from([
            "rws-cli", "sync", "--report", "A", "--report", "B", "--abort-on-error",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Sync {
                reports,
                abort_on_error,
                ..
            }) => {
                assert_eq!(reports, vec!["A", "B"]);
                assert!(abort_on_error);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from([
            "rws-cli",
            "sync",
            "--abort-on-error",
            "--continue-on-error",
        ])
        .is_err());
    }
}
