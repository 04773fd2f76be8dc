use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Client, StatusCode,
};
use tracing::debug;

use crate::{Config, Error, FetchError, Result, ID_PLACEHOLDER};

/// Fetches the raw record for one identifier.
#[async_trait]
pub trait FetchRecord: Send + Sync {
    async fn fetch(&self, id: i64) -> core::result::Result<String, FetchError>;
}

/// Fetches records over HTTP through one shared connection pool.
#[derive(Clone)]
pub struct HttpFetcher {
    // Client uses Arc internally so clones share the pool.
    client: Client,
    endpoint: String,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|_| Error::Config(format!("invalid user agent: {}", config.user_agent)))?,
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(config.concurrency_limit)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }

    pub fn url_for(&self, id: i64) -> String {
        self.endpoint.replace(ID_PLACEHOLDER, &id.to_string())
    }
}

#[async_trait]
impl FetchRecord for HttpFetcher {
    async fn fetch(&self, id: i64) -> core::result::Result<String, FetchError> {
        let res = self
            .client
            .get(self.url_for(id))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = res.status();
        if !status.is_success() {
            let retry_after = retry_after(res.headers());
            debug!(id, %status, "non-success response");
            return Err(classify_status(status, retry_after));
        }

        res.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Body(e.to_string())
            }
        })
    }
}

/// Maps a non-success status to the failure taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> FetchError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited { retry_after },
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound,
        StatusCode::REQUEST_TIMEOUT => FetchError::Timeout,
        s if s.is_server_error() => FetchError::ServerError(s.as_u16()),
        s => FetchError::Rejected(s.as_u16()),
    }
}

fn classify_send_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_builder() {
        FetchError::Malformed(e.to_string())
    } else {
        FetchError::Connection(e.to_string())
    }
}

/// Only the delta-seconds form of `Retry-After` is honoured.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_template() {
        let mut config = Config::for_range("scan.db", 1, 2);
        config.endpoint = "http://127.0.0.1:3000/parcel?parcelId={id}".into();
        let fetcher = HttpFetcher::new(&config).unwrap();
        assert_eq!(
            fetcher.url_for(5625555),
            "http://127.0.0.1:3000/parcel?parcelId=5625555"
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND, None), FetchError::NotFound);
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            FetchError::ServerError(502)
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, None),
            FetchError::Rejected(403)
        );
        let limited = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)));
        assert_eq!(
            limited,
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert!(limited.is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, None).is_transient());
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        // Bind then drop a listener so the port is very likely closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = Config::for_range("scan.db", 1, 2);
        config.endpoint = format!("http://127.0.0.1:{port}/{{id}}");
        config.request_timeout = 2;
        let fetcher = HttpFetcher::new(&config).unwrap();

        let err = fetcher.fetch(1).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
