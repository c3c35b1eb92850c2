use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use telemetry_replay::{
    Config, Engine, ReplayStatus, SignalStateStore, StateShape, WindowConfig,
    export::{self, ExportFormat},
    inspect::{self, QueryArgs},
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[clap(
        long,
        global = true,
        value_enum,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace)"
    )]
    log_level: LogLevel,
}

#[derive(Subcommand, Clone)]
enum Commands {
    #[command(about = "Load history and replay it into the signal state store")]
    Run(RunArgs),
    #[command(about = "Run one windowed query and print the rows")]
    Query(QueryCmd),
    #[command(about = "List a store's tables and their recorded runs")]
    Tables(TablesArgs),
    #[command(about = "Export the history a configuration loads to files")]
    Export(ExportArgs),
}

#[derive(clap::Args, Clone, Debug)]
struct RunArgs {
    #[clap(
        long,
        help = "Path to the configuration file (defaults to $TELEMETRY_REPLAY_CONFIG or replay.toml)"
    )]
    config: Option<PathBuf>,
}

#[derive(clap::Args, Clone, Debug)]
struct QueryCmd {
    #[clap(help = "Path to the SQLite store")]
    store: PathBuf,
    #[clap(help = "Table to query")]
    table: String,
    #[clap(
        long,
        value_enum,
        default_value = "predicted",
        help = "State shape whose default columns are selected"
    )]
    shape: ShapeArg,
    #[clap(long = "column", help = "Column to select, overrides the shape's columns")]
    columns: Vec<String>,
    #[clap(long, help = "Earliest run timestamp (YYYY-MM-DD HH:MM:SS)")]
    start_timestamp: Option<String>,
    #[clap(long, help = "Latest run timestamp (YYYY-MM-DD HH:MM:SS)")]
    end_timestamp: Option<String>,
    #[clap(long, help = "Lowest relative time index")]
    start_index: Option<f64>,
    #[clap(long, help = "Highest relative time index")]
    end_index: Option<f64>,
    #[clap(long, help = "Timestamp column name")]
    timestamp_column: Option<String>,
    #[clap(long, help = "Time index column name")]
    index_column: Option<String>,
    #[clap(long, help = "Show only the first N rows")]
    head: Option<usize>,
    #[clap(long, help = "Show only the last N rows")]
    tail: Option<usize>,
}

#[derive(clap::Args, Clone, Debug)]
struct TablesArgs {
    #[clap(help = "Path to the SQLite store")]
    store: PathBuf,
    #[clap(long, help = "Timestamp column name")]
    timestamp_column: Option<String>,
}

#[derive(clap::Args, Clone, Debug)]
struct ExportArgs {
    #[clap(help = "Output directory")]
    output: PathBuf,
    #[clap(long, help = "Path to the configuration file")]
    config: Option<PathBuf>,
    #[clap(long, value_enum, default_value = "csv", help = "Output file format")]
    format: FormatArg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ShapeArg {
    Predicted,
    Rods,
    Reactor,
}

impl From<ShapeArg> for StateShape {
    fn from(shape: ShapeArg) -> Self {
        match shape {
            ShapeArg::Predicted => StateShape::Predicted,
            ShapeArg::Rods => StateShape::Rods,
            ShapeArg::Reactor => StateShape::Reactor,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Parquet,
    ArrowIpc,
    Csv,
}

impl From<FormatArg> for ExportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Parquet => ExportFormat::Parquet,
            FormatArg::ArrowIpc => ExportFormat::ArrowIpc,
            FormatArg::Csv => ExportFormat::Csv,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let args = Cli::parse();
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::builder().from_env_lossy()
    } else {
        EnvFilter::builder().parse_lossy(format!("telemetry_replay={}", args.log_level.as_str()))
    };

    let _ = tracing_subscriber::fmt::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .try_init();

    match args.command {
        Commands::Run(RunArgs { config }) => {
            let path = config.unwrap_or_else(Config::default_path);
            info!(?path, "loading config");
            let config = Config::load(&path).into_diagnostic()?;
            run(config).await
        }
        Commands::Query(cmd) => {
            let window = WindowConfig {
                start_timestamp: cmd.start_timestamp,
                end_timestamp: cmd.end_timestamp,
                start_index: cmd.start_index,
                end_index: cmd.end_index,
            }
            .to_window()
            .into_diagnostic()?;
            let columns = if cmd.columns.is_empty() {
                StateShape::from(cmd.shape)
                    .default_columns()
                    .iter()
                    .map(|c| c.to_string())
                    .collect()
            } else {
                cmd.columns
            };
            inspect::run_query(QueryArgs {
                store: cmd.store,
                table: cmd.table,
                columns,
                window,
                timestamp_column: cmd.timestamp_column,
                index_column: cmd.index_column,
                head: cmd.head,
                tail: cmd.tail,
            })
        }
        Commands::Tables(TablesArgs {
            store,
            timestamp_column,
        }) => inspect::list_tables(store, timestamp_column),
        Commands::Export(ExportArgs {
            output,
            config,
            format,
        }) => {
            let path = config.unwrap_or_else(Config::default_path);
            let config = Config::load(&path).into_diagnostic()?;
            let engine = load_engine(config).await?;
            export::run(engine.chunks(), &output, format.into()).into_diagnostic()?;
            Ok(())
        }
    }
}

/// Loads the engine on the blocking pool, off the runtime's worker threads.
async fn load_engine(config: Config) -> miette::Result<Engine> {
    tokio::task::spawn_blocking(move || Engine::load(&config))
        .await
        .into_diagnostic()?
        .into_diagnostic()
}

async fn run(config: Config) -> miette::Result<()> {
    let engine = load_engine(config.clone()).await?;
    let replays = engine.replay_names().collect::<Vec<_>>().join(", ");
    info!(%replays, chunks = engine.chunks().len(), "engine loaded");
    if engine.chunks().is_empty() {
        warn!("no history loaded, every signal stays at its default");
    } else if !engine.query_errors().is_empty() {
        warn!(
            failed = engine.query_errors().len(),
            "some signals have no history and stay at their defaults"
        );
    }

    let (tx, mut tick_errors) = mpsc::unbounded_channel();
    let handles = engine.spawn(Some(tx)).into_diagnostic()?;
    let mut failed_ticks = 0u64;

    let mut poll = tokio::time::interval(config.poll_interval());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("received ctrl-c, stopping replays");
                break;
            }
            Some(_) = tick_errors.recv() => failed_ticks += 1,
            _ = poll.tick() => {
                log_snapshot(engine.states());
                if handles.iter().all(|h| h.status() != ReplayStatus::Running) {
                    info!("all replays finished");
                    break;
                }
            }
        }
    }

    for handle in &handles {
        handle.cancel();
    }
    for handle in handles {
        let name = handle.name().to_string();
        let replay = handle.stop().await.into_diagnostic()?;
        info!(replay = %name, rows = replay.rows_written(), "replay stopped");
    }
    if failed_ticks > 0 {
        warn!(failed_ticks, "some rows could not be replayed");
    }
    Ok(())
}

fn log_snapshot(states: &SignalStateStore) {
    for (signal, state) in states.snapshot() {
        let fields = state
            .fields()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(%signal, "{fields}");
    }
}
