use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::{
    Error, Result, DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY, DEFAULT_ENDPOINT, DEFAULT_USER_AGENT,
    ID_PLACEHOLDER,
};

/// Everything a scan needs to know before it starts.
#[derive(Parser, Debug, Clone)]
#[command(name = "parcel-scan")]
#[command(about = "Scan a numeric id range of parcel records into SQLite", long_about = None)]
#[command(version)]
pub struct Config {
    /// SQLite database file the parcels are written to
    #[arg(long, env = "PARCEL_SCAN_DB_PATH", default_value = "cadastral.db")]
    pub db_path: PathBuf,

    /// First id of the range (inclusive)
    #[arg(long, env = "PARCEL_SCAN_START_ID")]
    pub start_id: i64,

    /// Last id of the range (inclusive)
    #[arg(long, env = "PARCEL_SCAN_END_ID")]
    pub end_id: i64,

    /// Maximum number of ids in flight at once
    #[arg(long, env = "PARCEL_SCAN_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency_limit: usize,

    /// Parcels buffered before a flush
    #[arg(long, env = "PARCEL_SCAN_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Retries after the first attempt for transient failures
    #[arg(long, env = "PARCEL_SCAN_RETRY_LIMIT", default_value_t = 3)]
    pub retry_limit: u32,

    /// Per-request timeout in seconds
    #[arg(long, env = "PARCEL_SCAN_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout: u64,

    /// Optional cap on new requests per second
    #[arg(long, env = "PARCEL_SCAN_RATE_LIMIT")]
    pub rate_limit: Option<u32>,

    /// Maximum age of a non-empty buffer in seconds
    #[arg(long, env = "PARCEL_SCAN_FLUSH_INTERVAL", default_value_t = 30)]
    pub flush_interval: u64,

    /// Emit a status line every N processed ids
    #[arg(long, env = "PARCEL_SCAN_REPORT_EVERY", default_value_t = 10_000)]
    pub report_every: u64,

    /// Emit a status line at least this often, in seconds
    #[arg(long, env = "PARCEL_SCAN_REPORT_INTERVAL", default_value_t = 60)]
    pub report_interval: u64,

    /// Record URL, `{id}` is replaced with the identifier
    #[arg(long, env = "PARCEL_SCAN_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Checkpoint to assume when the database holds nothing yet
    #[arg(long, env = "PARCEL_SCAN_RESUME_FALLBACK")]
    pub resume_fallback: Option<i64>,

    #[arg(long, env = "PARCEL_SCAN_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,
}

impl Config {
    /// Config for `start_id..=end_id` with every other option at its default.
    pub fn for_range(db_path: impl Into<PathBuf>, start_id: i64, end_id: i64) -> Self {
        Self {
            db_path: db_path.into(),
            start_id,
            end_id,
            concurrency_limit: DEFAULT_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            retry_limit: 3,
            request_timeout: 30,
            rate_limit: None,
            flush_interval: 30,
            report_every: 10_000,
            report_interval: 60,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            resume_fallback: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Rejects settings that would make the scan meaningless before any work begins.
    pub fn validate(&self) -> Result<()> {
        if self.start_id < 0 || self.end_id < 0 {
            return Err(Error::Config(format!(
                "ids must be non-negative, got {}..={}",
                self.start_id, self.end_id
            )));
        }
        if self.start_id > self.end_id {
            return Err(Error::Config(format!(
                "start_id {} is past end_id {}",
                self.start_id, self.end_id
            )));
        }
        if self.concurrency_limit == 0 {
            return Err(Error::Config("concurrency_limit must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.rate_limit == Some(0) {
            return Err(Error::Config("rate_limit must be at least 1 request/sec".into()));
        }
        if self.report_every == 0 {
            return Err(Error::Config("report_every must be at least 1".into()));
        }
        for (name, secs) in [
            ("request_timeout", self.request_timeout),
            ("flush_interval", self.flush_interval),
            ("report_interval", self.report_interval),
        ] {
            if secs == 0 {
                return Err(Error::Config(format!("{name} must be at least 1 second")));
            }
        }
        if !self.endpoint.contains(ID_PLACEHOLDER) {
            return Err(Error::Config(format!(
                "endpoint must contain the {ID_PLACEHOLDER} placeholder: {}",
                self.endpoint
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval)
    }

    pub fn rate_limit(&self) -> Option<NonZeroU32> {
        self.rate_limit.and_then(NonZeroU32::new)
    }
}
