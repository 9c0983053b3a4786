use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use matrixwatch::analysis::runner::{run_analysis, AnalysisKind};
use matrixwatch::config::{Config, CONFIG_ENV};
use matrixwatch::patterns::{calibration, PredictionStore};
use matrixwatch::storage::Store;

#[derive(Parser)]
#[command(
    name = "matrixwatch",
    about = "Cross-source anomaly detection, clustering and pattern learning",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (live pipeline + scheduler + status API)
    Serve {
        /// Bind address, overriding [api] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one batch analysis over stored history and print it as JSON
    Analyze {
        /// Which analyzer to run
        #[arg(value_enum)]
        kind: AnalysisKind,

        /// Hours of history to analyze, overriding [offline] lookback_hours
        #[arg(long)]
        hours: Option<f64>,
    },

    /// Print the active prediction set
    Predictions {
        /// Re-apply expiry and exclusion rules and persist the result first
        #[arg(long)]
        refresh: bool,
    },

    /// Print Brier-score calibration per event type
    Calibration,

    /// Preview when scheduled batch analyses will fire
    Schedule {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_or_default(cli.config.as_deref());
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting matrixwatch daemon");
            matrixwatch::serve(config).await?;
        }
        Commands::Analyze { kind, hours } => {
            let store = Store::open(&config.storage.db_path)?;
            let cancel = CancellationToken::new();
            matrixwatch::cancel_on_ctrl_c(cancel.clone());
            let hours = hours.unwrap_or(config.offline.lookback_hours);
            let output = run_analysis(
                &store,
                &config.offline,
                kind,
                hours,
                matrixwatch::unix_now(),
                cancel,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Predictions { refresh } => {
            let store = Store::open(&config.storage.db_path)?;
            let predictions = PredictionStore::open(store, config.patterns.clone());
            if refresh {
                let outcome = predictions.refresh(matrixwatch::unix_now())?;
                eprintln!(
                    "Refreshed: {} expired, {} excluded, {} active",
                    outcome.expired,
                    outcome.excluded,
                    outcome.remaining.len()
                );
            }
            let active = predictions.active();
            if active.is_empty() {
                println!("No active predictions.");
            } else {
                println!(
                    "{:<36} | {:<24} | {:>6} | {:>5} | Window (h)",
                    "Condition", "Event", "Prob", "n"
                );
                println!("{:-<36}-|-{:-<24}-|-{:->6}-|-{:->5}-|-{:-<12}", "", "", "", "", "");
                for p in active {
                    println!(
                        "{:<36} | {:<24} | {:>5.1}% | {:>5} | {:.1}-{:.1}",
                        p.condition,
                        p.event_type,
                        p.probability * 100.0,
                        p.sample_size,
                        p.min_time_h,
                        p.max_time_h
                    );
                }
            }
        }
        Commands::Calibration => {
            let store = Store::open(&config.storage.db_path)?;
            let summary = calibration::summarize(&store.load_calibration()?);
            if summary.total == 0 {
                println!("No resolved predictions yet.");
            } else {
                println!("{:<28} | {:>8} | Brier", "Event type", "Outcomes");
                println!("{:-<28}-|-{:->8}-|-{:-<8}", "", "", "");
                for (event_type, c) in &summary.per_event_type {
                    println!("{:<28} | {:>8} | {:.4}", event_type, c.outcomes, c.brier);
                }
                println!(
                    "\nMean Brier {:.4} over {} event types; {:.0}% well calibrated",
                    summary.mean_brier, summary.total, summary.well_calibrated_percent
                );
            }
        }
        Commands::Schedule { hours } => {
            let runs = matrixwatch::scheduler::cron::preview(
                &config.offline.schedule,
                chrono::Utc::now(),
                hours,
            )?;
            if runs.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming batch runs (next {} hours):", hours);
                for time in runs {
                    println!("{}", time);
                }
            }
        }
    }

    Ok(())
}
