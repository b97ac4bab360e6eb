mod file_config;

pub use file_config::{FileConfig, SchedulerFileConfig};

use anyhow::{bail, Result};
use clap::ValueEnum;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

pub const DEFAULT_MIN_INTERVAL_MS: u64 = 4;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_PENDING_JOBS: usize = 10_000;

/// Verbosity of the runner's log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub log_level: LogLevel,
    pub idle_timeout_ms: u64,
    pub min_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_pending_jobs: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            max_pending_jobs: DEFAULT_MAX_PENDING_JOBS,
        }
    }
}

/// Tuning for every [`JobManager`](crate::background_jobs::JobManager) of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Shortest period a repeating job may have; shorter periods are raised to it.
    pub min_interval: Duration,
    /// How long shutdown waits for the job currently running.
    pub shutdown_grace: Duration,
    /// Upper bound on outstanding jobs per browsing context.
    pub max_pending_jobs: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(DEFAULT_MIN_INTERVAL_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            max_pending_jobs: DEFAULT_MAX_PENDING_JOBS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: LogLevel,
    pub idle_timeout: Duration,
    pub scheduler: SchedulerSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let log_level = match file.log_level {
            Some(level) => match parse_log_level(&level) {
                Some(level) => level,
                None => bail!("Unknown log_level in config file: {}", level),
            },
            None => cli.log_level,
        };

        let idle_timeout_ms = file.idle_timeout_ms.unwrap_or(cli.idle_timeout_ms);

        let sched_file = file.scheduler.unwrap_or_default();
        let min_interval_ms = sched_file.min_interval_ms.unwrap_or(cli.min_interval_ms);
        let shutdown_grace_ms = sched_file
            .shutdown_grace_ms
            .unwrap_or(cli.shutdown_grace_ms);
        let max_pending_jobs = sched_file
            .max_pending_jobs
            .unwrap_or(cli.max_pending_jobs);

        if min_interval_ms == 0 {
            bail!("min_interval_ms must be greater than zero");
        }
        if max_pending_jobs == 0 {
            bail!("max_pending_jobs must be greater than zero");
        }

        Ok(Self {
            log_level,
            idle_timeout: Duration::from_millis(idle_timeout_ms),
            scheduler: SchedulerSettings {
                min_interval: Duration::from_millis(min_interval_ms),
                shutdown_grace: Duration::from_millis(shutdown_grace_ms),
                max_pending_jobs,
            },
        })
    }
}

/// Parses a log level string, case insensitive.
/// Uses clap's ValueEnum trait for parsing.
fn parse_log_level(s: &str) -> Option<LogLevel> {
    LogLevel::from_str(s, true).ok()
}
