use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use adsb_bridge::BridgeConfig;
use adsb_bridge::log_format::TargetFirstFormat;

mod commands;

use commands::{RunOverrides, handle_config, handle_parse, handle_run};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "adsb-bridge")]
#[command(about = "Stream SBS-1 BaseStation messages into an analytical store")]
#[command(version = adsb_bridge::VERSION)]
struct Cli {
    /// Config file (defaults to $ADSB_BRIDGE_CONFIG, then ./bridge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until SIGINT/SIGTERM
    Run {
        /// SBS server hostname (overrides [source] host)
        #[arg(long)]
        host: Option<String>,

        /// SBS server port (overrides [source] port)
        #[arg(long)]
        port: Option<u16>,

        /// Records per sink call (overrides [streaming] batch_size)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Serve /metrics, /status and /health on this port
        #[arg(long)]
        metrics_port: Option<u16>,

        /// Log batches instead of writing to the sink
        #[arg(long)]
        dry_run: bool,
    },
    /// Parse SBS lines from a file (or stdin) and print records as JSON
    Parse {
        /// Input file; reads stdin when omitted
        input: Option<PathBuf>,

        /// Print the indexed field breakdown instead of records
        #[arg(long)]
        fields: bool,
    },
    /// Print the resolved configuration as TOML
    Config,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = TargetFirstFormat::new().with_ansi(std::io::stderr().is_terminal());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(format)
                .with_writer(std::io::stderr),
        )
        .with(sentry_tracing::layer())
        .init();
}

fn init_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: Some(adsb_bridge::VERSION.into()),
            environment: std::env::var("ADSB_BRIDGE_ENV").ok().map(Into::into),
            attach_stacktrace: true,
            ..Default::default()
        },
    )))
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Sentry has to be up before the runtime starts its threads
    let _sentry = init_sentry();
    init_tracing();

    let cli = Cli::parse();
    let (config, config_path) = BridgeConfig::load_resolved(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            host,
            port,
            batch_size,
            metrics_port,
            dry_run,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            let overrides = RunOverrides {
                host,
                port,
                batch_size,
                metrics_port,
            };
            runtime.block_on(handle_run(config, config_path, overrides, dry_run))
        }
        Commands::Parse { input, fields } => handle_parse(input.as_deref(), fields),
        Commands::Config => handle_config(&config, config_path.as_deref()),
    }
}
