use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use telemetry_pipeline::analysis::StatsStore;
use telemetry_pipeline::config::{AppConfig, LogFormat, LoggingConfig};
use telemetry_pipeline::detect::{AnomalyStore, AnomalyType};
use telemetry_pipeline::event::{Event, MusicInfo, RunningStats};
use telemetry_pipeline::eventlog::SqliteEventLog;
use telemetry_pipeline::storage;

#[derive(Parser)]
#[command(
    name = "telemetry-pipeline",
    about = "Anomaly detection and aggregate statistics for running and music telemetry",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the event consumer and the HTTP API
    Serve {
        /// Bind address (overrides api.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print the aggregate statistics snapshot as JSON
    Stats,

    /// Print recorded anomalies as JSON, newest first
    Anomalies {
        /// Only this anomaly type (LongRun, ShortRun, LongSong, ShortSong)
        #[arg(long = "type")]
        anomaly_type: Option<String>,
    },

    /// Enqueue one running event on the log
    PublishRunning {
        #[arg(long)]
        user: String,

        /// Distance in metres
        #[arg(long)]
        distance: f64,

        /// Duration in seconds
        #[arg(long)]
        duration: f64,
    },

    /// Enqueue one music event on the log
    PublishMusic {
        #[arg(long)]
        user: String,

        #[arg(long)]
        song: String,

        #[arg(long)]
        artist: String,

        /// Song duration in seconds
        #[arg(long)]
        duration: f64,
    },

    /// Count events per type over the whole log
    History,
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cfg.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Resolve the config under a stderr subscriber so fallback warnings are
/// visible before the configured one is installed.
fn resolve_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || AppConfig::resolve(explicit))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = resolve_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting telemetry pipeline");

            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, shutting down");
                }
                on_signal.cancel();
            });

            telemetry_pipeline::serve(config, shutdown).await?;
        }
        Commands::Stats => {
            let pool = storage::open_pool(&config.datastore.path)?;
            let stats = StatsStore::new(pool).snapshot()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Anomalies { anomaly_type } => {
            let filter = anomaly_type
                .as_deref()
                .map(str::parse::<AnomalyType>)
                .transpose()?;
            let pool = storage::open_pool(&config.datastore.path)?;
            let records = AnomalyStore::new(pool).query(filter)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::PublishRunning {
            user,
            distance,
            duration,
        } => {
            let event = Event::RunningStats(RunningStats {
                user_id: user,
                trace_id: Uuid::new_v4().to_string(),
                distance,
                duration,
                timestamp: Utc::now(),
            });
            publish(&config, &event)?;
        }
        Commands::PublishMusic {
            user,
            song,
            artist,
            duration,
        } => {
            let event = Event::MusicInfo(MusicInfo {
                user_id: user,
                trace_id: Uuid::new_v4().to_string(),
                song_name: song,
                artist,
                song_duration: duration,
                timestamp: Utc::now(),
            });
            publish(&config, &event)?;
        }
        Commands::History => {
            let log = open_log(&config)?;
            let counts = log.history().counts()?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }

    Ok(())
}

fn open_log(config: &AppConfig) -> Result<SqliteEventLog> {
    SqliteEventLog::open(&config.log.endpoint, &config.log.topic).with_context(|| {
        format!(
            "failed to open event log at {}",
            config.log.endpoint.display()
        )
    })
}

fn publish(config: &AppConfig, event: &Event) -> Result<()> {
    let offset = open_log(config)?.publish(event)?;
    println!(
        "{}",
        serde_json::json!({ "trace_id": event.trace_id(), "offset": offset })
    );
    Ok(())
}
