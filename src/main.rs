use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use parcel_scan::{info_time, process::Scan, request::HttpFetcher, Config, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// `LOG_FORMAT=json` switches to JSON lines, `RUST_LOG` overrides the filter.
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parcel_scan=info"));

    if json_format {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let start_time = Local::now();

    let config = Config::parse();
    config.validate()?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received, finishing in-flight ids and flushing...");
                shutdown.cancel();
            }
        }
    });

    let fetcher = Arc::new(HttpFetcher::new(&config)?);
    let summary = Scan::new(config, fetcher)
        .with_shutdown(shutdown)
        .run()
        .await?;
    info_time!(
        start_time,
        "Full program time: {} processed, checkpoint {:?}",
        summary.processed,
        summary.checkpoint
    );

    Ok(())
}
