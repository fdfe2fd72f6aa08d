mod config;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(version, about = "Cluster observability and control service")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the dashboard API.
    Serve {
        #[arg(long, short, default_value = "dashboard.yaml")]
        config: PathBuf,
    },
    /// Check a config file and exit.
    Validate {
        #[arg(long, short, default_value = "dashboard.yaml")]
        config: PathBuf,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to set up metrics: {0}")]
    Metrics(String),
    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Console(#[from] console::ConsoleError),
}

fn load_config(path: &PathBuf) -> Result<Config, ConfigError> {
    let config = Config::from_file(path)?;
    config.validate()?;
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics_config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(&metrics_config.statsd_host, metrics_config.statsd_port)
        .build(Some("dashboard"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(console::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(logsearch::metrics_defs::ALL_METRICS);
    Ok(())
}

fn serve(config: Config) -> Result<(), CliError> {
    let _sentry = init_logging(&config.logging());
    if let Some(metrics_config) = &config.common.metrics {
        init_metrics(metrics_config)?;
    }

    tracing::info!(
        listener = %config.console.listener.addr(),
        admin_listener = %config.console.admin_listener.addr(),
        "starting dashboard"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(console::run(config.console))?;

    tracing::info!("dashboard stopped");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        CliCommand::Serve { config } => load_config(&config)
            .map_err(CliError::from)
            .and_then(serve),
        CliCommand::Validate { config } => load_config(&config)
            .map(|_| println!("{}: ok", config.display()))
            .map_err(CliError::from),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dashboard: {e}");
            ExitCode::FAILURE
        }
    }
}
