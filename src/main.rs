use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tab_jobs::config::{
    AppConfig, CliConfig, FileConfig, LogLevel, DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_PENDING_JOBS,
    DEFAULT_MIN_INTERVAL_MS, DEFAULT_SHUTDOWN_GRACE_MS,
};
use tab_jobs::scenario::{run_scenario, Scenario};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to the TOML scenario describing contexts and their jobs.
    #[clap(value_parser = parse_path)]
    pub scenario: PathBuf,

    /// Path to a TOML config file. Values there override the CLI flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// How long to wait for every context to go idle, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_IDLE_TIMEOUT_MS)]
    pub idle_timeout_ms: u64,

    /// Shortest allowed interval period, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_MIN_INTERVAL_MS)]
    pub min_interval_ms: u64,

    /// How long shutdown waits for a running job, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_SHUTDOWN_GRACE_MS)]
    pub shutdown_grace_ms: u64,

    /// Maximum outstanding jobs per browsing context.
    #[clap(long, default_value_t = DEFAULT_MAX_PENDING_JOBS)]
    pub max_pending_jobs: usize,

    /// Log verbosity. LOG_LEVEL in the environment takes precedence.
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            log_level: self.log_level,
            idle_timeout_ms: self.idle_timeout_ms,
            min_interval_ms: self.min_interval_ms,
            shutdown_grace_ms: self.shutdown_grace_ms,
            max_pending_jobs: self.max_pending_jobs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(config.log_level.as_filter().into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!("Loading scenario from {:?}", cli_args.scenario);
    let scenario = Scenario::load(&cli_args.scenario)?;

    let report = run_scenario(&scenario, &config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
