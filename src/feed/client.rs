use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use super::parse::{self, PayloadError};
use super::{Category, RawBatch};
use crate::config::ApiConfig;
use crate::model::{Meeting, Timestamp};

/// Failure to obtain a response body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("reading response body: {0}")]
    Body(String),
}

/// Why a fetch for one category failed.
#[derive(Error, Debug)]
pub enum FetchCause {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed response: {0}")]
    Malformed(#[from] PayloadError),
}

/// A failed fetch. Always recoverable; retry policy belongs to the caller.
#[derive(Error, Debug)]
#[error("fetching {category}: {cause}")]
pub struct FetchError {
    pub category: Category,
    #[source]
    pub cause: FetchCause,
}

/// Raw byte transport. Implementations must bound every request with a timeout.
pub trait Transport: Send + Sync {
    /// Issue a GET and return the response body of a 2xx response.
    fn get(
        &self,
        url: &str,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// HTTP transport backed by reqwest.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    /// Create a new transport with the configured request timeout.
    pub fn new(cfg: &ApiConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self { http })
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;

        Ok(body.to_vec())
    }
}

/// Callback type for recording fetch metrics.
/// Receives (category, status, duration).
pub type MetricsCallback = Box<dyn Fn(Category, &str, Duration) + Send + Sync>;

/// Builds time-bounded queries and decodes their responses.
pub struct Fetcher<T> {
    transport: T,
    endpoint: String,
    session_key: String,
    metrics: Option<MetricsCallback>,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, endpoint: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            session_key: session_key.into(),
            metrics: None,
        }
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Build the query URL for one category.
    ///
    /// `since` is exclusive and `until` inclusive. Both are ignored for
    /// categories without a time field.
    pub fn query_url(
        &self,
        category: Category,
        since: Option<Timestamp>,
        until: Option<Timestamp>,
    ) -> String {
        let mut url = format!(
            "{}/{}?session_key={}",
            self.endpoint,
            category.endpoint(),
            self.session_key
        );

        if let Some(field) = category.time_field() {
            if let Some(since) = since {
                url.push_str(&format!("&{field}%3E{}", format_query_time(since)));
            }
            if let Some(until) = until {
                url.push_str(&format!("&{field}%3C%3D{}", format_query_time(until)));
            }
        }

        url
    }

    /// Fetch all records of `category` in the `(since, until]` window.
    ///
    /// Zero records is a normal outcome and yields an empty batch.
    pub async fn fetch(
        &self,
        category: Category,
        since: Option<Timestamp>,
        until: Option<Timestamp>,
    ) -> Result<RawBatch, FetchError> {
        let url = self.query_url(category, since, until);
        let start = Instant::now();

        debug!(%category, %url, "fetching");

        let body = match self.transport.get(&url).await {
            Ok(body) => body,
            Err(e) => {
                self.record_request(category, "error", start.elapsed());
                return Err(FetchError {
                    category,
                    cause: e.into(),
                });
            }
        };

        match parse::parse_batch(category, &body, Utc::now()) {
            Ok(batch) => {
                self.record_request(category, "success", start.elapsed());
                Ok(batch)
            }
            Err(e) => {
                self.record_request(category, "malformed", start.elapsed());
                Err(FetchError {
                    category,
                    cause: e.into(),
                })
            }
        }
    }

    /// Fetch the latest meeting description.
    pub async fn fetch_meeting(&self) -> Result<Option<Meeting>> {
        let url = format!("{}/meetings?meeting_key=latest", self.endpoint);

        let body = self
            .transport
            .get(&url)
            .await
            .context("requesting meeting")?;

        parse::parse_meeting(&body).context("decoding meeting")
    }

    fn record_request(&self, category: Category, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(category, status, duration);
        }
    }
}

/// Render a timestamp the way the upstream query filter expects it.
pub fn format_query_time(ts: Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use chrono::TimeZone;
    use parking_lot::Mutex;

    use super::*;

    /// Transport replaying canned responses and recording requested URLs.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn push(&self, response: Result<&str, TransportError>) {
            self.responses
                .lock()
                .push_back(response.map(|s| s.as_bytes().to_vec()));
        }
    }

    impl Transport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
            self.requests.lock().push(url.to_string());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(b"[]".to_vec()))
        }
    }

    fn ts(secs: u32, millis: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 9, 1, 13, 0, secs).unwrap()
            + chrono::Duration::milliseconds(i64::from(millis))
    }

    #[test]
    fn test_query_url_bounds() {
        let fetcher = Fetcher::new(ScriptedTransport::default(), "https://api.example/v1/", "latest");

        assert_eq!(
            fetcher.query_url(Category::Position, None, None),
            "https://api.example/v1/position?session_key=latest"
        );

        assert_eq!(
            fetcher.query_url(Category::Position, Some(ts(5, 250)), None),
            "https://api.example/v1/position?session_key=latest&date%3E2024-09-01T13:00:05.250000"
        );

        assert_eq!(
            fetcher.query_url(Category::Laps, Some(ts(5, 0)), Some(ts(9, 0))),
            "https://api.example/v1/laps?session_key=latest\
             &date_start%3E2024-09-01T13:00:05.000000\
             &date_start%3C%3D2024-09-01T13:00:09.000000"
        );
    }

    #[test]
    fn test_query_url_untimed_category_ignores_bounds() {
        let fetcher = Fetcher::new(ScriptedTransport::default(), "https://api.example/v1", "9590");

        assert_eq!(
            fetcher.query_url(Category::Stints, Some(ts(5, 0)), Some(ts(9, 0))),
            "https://api.example/v1/stints?session_key=9590"
        );
    }

    #[tokio::test]
    async fn test_fetch_empty_is_not_an_error() {
        let transport = ScriptedTransport::default();
        transport.push(Ok("[]"));
        let fetcher = Fetcher::new(transport, "https://api.example/v1", "latest");

        let batch = fetcher
            .fetch(Category::Intervals, Some(ts(1, 0)), None)
            .await
            .expect("empty batch");
        assert!(batch.is_empty());
        assert_eq!(batch.category, Category::Intervals);
    }

    #[tokio::test]
    async fn test_fetch_transport_failure() {
        let transport = ScriptedTransport::default();
        transport.push(Err(TransportError::Status {
            status: 503,
            body: "unavailable".to_string(),
        }));
        let fetcher = Fetcher::new(transport, "https://api.example/v1", "latest");

        let err = fetcher
            .fetch(Category::Position, None, None)
            .await
            .expect_err("503");
        assert_eq!(err.category, Category::Position);
        assert!(matches!(
            err.cause,
            FetchCause::Transport(TransportError::Status { status: 503, .. })
        ));
        assert!(err.to_string().contains("fetching position"));
    }

    #[tokio::test]
    async fn test_fetch_malformed_body_is_fetch_error() {
        let transport = ScriptedTransport::default();
        transport.push(Ok(r#"{"detail":"rate limited"}"#));
        let fetcher = Fetcher::new(transport, "https://api.example/v1", "latest");

        let err = fetcher
            .fetch(Category::Laps, None, None)
            .await
            .expect_err("object body");
        assert!(matches!(err.cause, FetchCause::Malformed(_)));
    }

    #[tokio::test]
    async fn test_fetch_records_metrics() {
        use std::sync::Arc;

        let transport = ScriptedTransport::default();
        transport.push(Ok("[]"));
        transport.push(Err(TransportError::Request("connection reset".to_string())));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let fetcher = Fetcher::new(transport, "https://api.example/v1", "latest").with_metrics(
            Box::new(move |category, status, _| {
                seen_cb.lock().push((category, status.to_string()));
            }),
        );

        let _ = fetcher.fetch(Category::Pit, None, None).await;
        let _ = fetcher.fetch(Category::Pit, None, None).await;

        assert_eq!(
            *seen.lock(),
            vec![
                (Category::Pit, "success".to_string()),
                (Category::Pit, "error".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_meeting() {
        let transport = ScriptedTransport::default();
        transport.push(Ok(r#"[{"meeting_official_name":"GP","country_name":"Japan","location":"Suzuka","circuit_short_name":"Suzuka"}]"#));
        let fetcher = Fetcher::new(transport, "https://api.example/v1", "latest");

        let meeting = fetcher
            .fetch_meeting()
            .await
            .expect("fetch")
            .expect("meeting");
        assert_eq!(meeting.location, "Suzuka");
        assert_eq!(
            fetcher.transport().requests.lock()[0],
            "https://api.example/v1/meetings?meeting_key=latest"
        );
    }
}
