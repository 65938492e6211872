use std::path::PathBuf;

use clap::Parser;

use crate::config::GovernorConfig;
use crate::{GovernorError, Result};

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "GOVERNOR_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the governor YAML configuration; built-in defaults are used when omitted"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "GOVERNOR_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path for printing governor metrics, e.g. /logs/metrics.log"
    )]
    pub metrics_file: Option<PathBuf>,

    #[arg(long, env = "GOVERNOR_WORKERS", help = "Override the number of worker threads")]
    pub workers: Option<usize>,

    #[arg(
        long,
        env = "GOVERNOR_METRICS_FORMAT",
        help = "Metrics format, either 'influx' or 'json'"
    )]
    pub metrics_format: Option<String>,

    #[arg(
        long,
        help = "Enable metrics reporting",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_metrics: bool,
}

#[derive(Parser, Clone, Debug)]
pub struct PrintConfigArgs {
    #[arg(
        long,
        env = "GOVERNOR_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the governor YAML configuration"
    )]
    pub config: Option<PathBuf>,
}

/// Loads the file (or defaults) and applies command line overrides.
pub fn effective_config(
    path: Option<&PathBuf>,
    workers: Option<usize>,
    metrics_format: Option<&str>,
    enable_metrics: bool,
) -> Result<GovernorConfig, GovernorError> {
    let mut cfg = match path {
        Some(path) => GovernorConfig::load(path)?,
        None => GovernorConfig::default(),
    };
    if let Some(workers) = workers {
        cfg.workers.threads = workers;
    }
    if let Some(format) = metrics_format {
        cfg.metrics.format = format.to_string();
    }
    cfg.metrics.enabled &= enable_metrics;
    cfg.validate()?;
    Ok(cfg)
}

impl DaemonArgs {
    pub fn load_config(&self) -> Result<GovernorConfig, GovernorError> {
        effective_config(
            self.config.as_ref(),
            self.workers,
            self.metrics_format.as_deref(),
            self.enable_metrics,
        )
    }
}

impl PrintConfigArgs {
    pub fn load_config(&self) -> Result<GovernorConfig, GovernorError> {
        effective_config(self.config.as_ref(), None, None, true)
    }
}
