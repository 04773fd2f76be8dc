//! Resumable scanner for numeric parcel records.
//! Fetches one record per id, parses it and persists the results in batches to SQLite.

mod macros;

pub mod batch;
pub mod config;
mod error;
pub mod parse;
pub mod process;
pub mod progress;
pub mod rate_limit;
pub mod request;
pub mod resume;
pub mod retry;
pub mod store;

pub use config::Config;
pub use error::{Error, FetchError, Result};

/// Placeholder substituted with the identifier in the endpoint template.
pub const ID_PLACEHOLDER: &str = "{id}";
const DEFAULT_ENDPOINT: &str =
    "https://oss.uredjenazemlja.hr/oss/public/cad/parcel-info?parcelId={id}";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const DEFAULT_CONCURRENCY: usize = 1000;
const DEFAULT_BATCH_SIZE: usize = 10_000;
/// Flush attempts before a storage failure becomes fatal.
const FLUSH_ATTEMPTS: u32 = 3;
