use crate::{extract::FileFormat, tf2maps::SiteSettings, EngineConfig, FetchSettings};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Command-line names of the record file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Jsonl,
}

impl From<OutputFormat> for FileFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Json => FileFormat::Json,
            OutputFormat::Jsonl => FileFormat::JsonLines,
        }
    }
}

/// Harvest map listings and map details from tf2maps.net.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Site root that listing and detail hrefs are relative to.
    #[arg(long, env = "TF2MAPS_BASE_URL", default_value = "https://tf2maps.net/")]
    pub base_url: String,

    #[arg(long, env = "TF2MAPS_START_PAGE", default_value_t = 1)]
    pub start_page: u64,

    /// Follow "Next" links while the current page number is below this.
    #[arg(long, env = "TF2MAPS_MAX_PAGES", default_value_t = 2)]
    pub max_pages: u64,

    #[arg(long, env = "TF2MAPS_WORKERS", default_value_t = 4)]
    pub workers: usize,

    #[arg(long, env = "TF2MAPS_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "TF2MAPS_RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// Minimum gap between two requests.
    #[arg(long, env = "TF2MAPS_REQUEST_DELAY_MS", default_value_t = 200)]
    pub request_delay_ms: u64,

    #[arg(long, env = "TF2MAPS_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    #[arg(long, env = "TF2MAPS_USER_AGENT")]
    pub user_agent: Option<String>,

    #[arg(long, env = "TF2MAPS_OUTPUT_DIR", default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(long, env = "TF2MAPS_FORMAT", value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// SQLite file used to resume an interrupted run and keep a copy of every record.
    #[arg(long, env = "TF2MAPS_DB")]
    pub db: Option<PathBuf>,

    #[arg(long, env = "TF2MAPS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Cli {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..EngineConfig::default()
        }
    }

    pub fn fetch(&self) -> FetchSettings {
        let defaults = FetchSettings::default();
        FetchSettings {
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
            timeout: Duration::from_secs(self.timeout_secs),
            request_delay: Duration::from_millis(self.request_delay_ms),
            ..FetchSettings::default()
        }
    }

    pub fn site(&self) -> SiteSettings {
        SiteSettings {
            base_url: self.base_url.clone(),
            start_page: self.start_page,
            format: self.format.into(),
        }
    }
}
