//! Thin HTTP wrapper shared by the vendor adapters.

use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::Serialize;

use crate::provider::error::ProviderError;

/// Default deadline for a whole streaming request, connect through last byte.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a vendor wants its credentials presented.
#[derive(Clone)]
pub enum AuthConfig {
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// Custom header, e.g. `x-api-key: <key>`.
    ApiKey { header: &'static str, key: String },
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => f.debug_tuple("Bearer").field(&"[REDACTED]").finish(),
            Self::ApiKey { header, .. } => f
                .debug_struct("ApiKey")
                .field("header", header)
                .field("key", &"[REDACTED]")
                .finish(),
        }
    }
}

/// JSON-over-HTTPS client with auth and SSE streaming support.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    auth: AuthConfig,
    extra: HeaderMap,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>, auth: AuthConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Build(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            auth,
            extra: HeaderMap::new(),
        })
    }

    /// Attach a fixed header to every request (vendor version pinning).
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.extra.insert(name, value);
        self
    }

    fn build_headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = self.extra.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        match &self.auth {
            AuthConfig::Bearer(token) => {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| ProviderError::Build("bearer token is not a valid header value".into()))?;
                headers.insert(AUTHORIZATION, value);
            }
            AuthConfig::ApiKey { header, key } => {
                let value = HeaderValue::from_str(key)
                    .map_err(|_| ProviderError::Build("API key is not a valid header value".into()))?;
                headers.insert(HeaderName::from_static(header), value);
            }
        }

        Ok(headers)
    }

    fn join_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// POST a JSON body and return the raw SSE byte stream.
    ///
    /// The optional `timeout` replaces [`DEFAULT_TIMEOUT`] as the deadline
    /// for the whole call; expiry mid-body surfaces as an `Err` item on the
    /// returned stream.
    pub async fn post_stream<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        timeout: Option<Duration>,
    ) -> Result<impl Stream<Item = Result<Bytes, reqwest::Error>>, ProviderError> {
        let mut headers = self.build_headers()?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self
            .client
            .post(self.join_url(path))
            .headers(headers)
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after: retry_after_seconds(&response),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("HTTP {status}: {text}")));
        }

        Ok(response.bytes_stream())
    }
}

fn retry_after_seconds(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value)
}

/// Seconds from a `Retry-After` value; fractional values round up, HTTP
/// dates and non-positive values are ignored.
fn parse_retry_after(value: &str) -> Option<u64> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs > 0.0).then(|| (secs.ceil() as u64).max(1))
}
