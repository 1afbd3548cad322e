//! Third-party web archival
//!
//! ## Overview
//!
//! An [`Archive`] takes a fetchable URL, asks an external service to capture
//! it, and hands back a permanent URL for the captured copy. It can also
//! stream that copy back, which is how verification obtains its third hash.
//!
//! [`WaybackClient`] implements the trait against the Wayback Machine's
//! Save Page Now 2 API:
//!
//! ```text
//! POST {api}/save                  -> {"job_id": "..."}
//! GET  {api}/save/status/{job_id}  -> {"status": "pending" | "success" | ..., ...}
//! ```
//!
//! A capture job is `submitted`, then polled every
//! [`ArchiveConfig::poll_interval`] while `pending`, until it reports
//! `success`, reports anything else, or runs past [`ArchiveConfig::timeout`].
//! Only the job id is held between polls.
//!
//! ## Errors
//!
//! - [`CustodyError::ArchiveTimedOut`] when the job outlives the timeout;
//!   this is the one archival failure worth retrying as-is
//! - [`CustodyError::Archive`] for any non-200 answer or unexpected status,
//!   carrying the response body

use crate::error::{CustodyError, Result};
use crate::storage::ByteStream;
use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// An external service that keeps independent copies of URLs
#[async_trait]
pub trait Archive: Send + Sync + fmt::Debug {
    /// Capture `url` and return the permanent URL of the capture
    async fn capture(&self, url: &Url) -> Result<String>;

    /// Stream the content behind a permanent archive URL
    async fn retrieve(&self, archive_url: &str) -> Result<ByteStream>;
}

/// Wayback Machine client settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Root of the capture API
    pub api_base: String,
    /// Prefix of permanent capture URLs
    pub web_base: String,
    /// S3-style access key
    pub access_key: String,
    /// S3-style secret key
    pub secret_key: String,
    /// Delay between two status polls
    #[serde(with = "humantime_str")]
    pub poll_interval: Duration,
    /// Overall limit for one capture job
    #[serde(with = "humantime_str")]
    pub timeout: Duration,
    /// Limit for each API request
    #[serde(with = "humantime_str")]
    pub request_timeout: Duration,
    /// Connect limit, and longest silence between body chunks, when
    /// streaming a capture back
    #[serde(with = "humantime_str")]
    pub download_timeout: Duration,
    /// Extra attempts for rate-limited or failing API requests
    pub max_retries: u32,
    /// First retry delay, doubled on each further attempt
    #[serde(with = "humantime_str")]
    pub retry_backoff: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            api_base: "https://web.archive.org".to_string(),
            web_base: "https://web.archive.org/web/".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15 * 60),
            request_timeout: Duration::from_secs(12),
            download_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl fmt::Debug for ArchiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveConfig")
            .field("api_base", &self.api_base)
            .field("web_base", &self.web_base)
            .field("credentials", &"<redacted>")
            .field("poll_interval", &self.poll_interval)
            .field("timeout", &self.timeout)
            .field("request_timeout", &self.request_timeout)
            .field("download_timeout", &self.download_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// (De)serialize a `Duration` as a humantime string such as `"15m"`
pub(crate) mod humantime_str {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Save Page Now 2 client
#[derive(Debug)]
pub struct WaybackClient {
    config: ArchiveConfig,
    api: Client,
    downloads: reqwest::Client,
}

#[derive(Debug)]
struct Client {
    http: reqwest::Client,
    save_url: Url,
    status_base: Url,
}

impl WaybackClient {
    /// Create a client
    ///
    /// # Errors
    ///
    /// Returns [`CustodyError::InvalidConfiguration`] if `api_base` is not a
    /// URL.
    pub fn new(config: ArchiveConfig) -> Result<Self> {
        let base = config.api_base.trim_end_matches('/');
        let parse = |s: String| {
            Url::parse(&s).map_err(|e| CustodyError::InvalidConfiguration(format!("bad archive URL '{}': {}", s, e)))
        };
        let save_url = parse(format!("{}/save", base))?;
        let status_base = parse(format!("{}/save/status/", base))?;

        let http = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        let downloads = reqwest::Client::builder()
            .connect_timeout(config.download_timeout)
            .read_timeout(config.download_timeout)
            .build()?;

        Ok(Self {
            config,
            api: Client { http, save_url, status_base },
            downloads,
        })
    }

    /// Settings in use
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, format!("LOW {}:{}", self.config.access_key, self.config.secret_key))
    }

    /// Send a request, retrying rate limits, 5xx answers and connect failures
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            let outcome = self.authorize(build()).send().await;
            let transient = match &outcome {
                Ok(response) => is_transient(response.status()),
                Err(e) => e.is_connect() || e.is_timeout(),
            };
            if !transient || attempt >= self.config.max_retries {
                return Ok(outcome?);
            }
            let delay = self.config.retry_backoff * 2u32.saturating_pow(attempt);
            warn!("Archive API request failed transiently, retrying in {:?}", delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn submit(&self, url: &Url) -> Result<String> {
        let params = capture_params(url);
        let response = self
            .send(|| self.api.http.post(self.api.save_url.clone()).form(&params))
            .await?;
        let body = expect_ok(response).await?;
        match body.json.get("job_id") {
            Some(Value::String(job_id)) => Ok(job_id.clone()),
            Some(Value::Number(job_id)) => Ok(job_id.to_string()),
            _ => Err(CustodyError::archive(format!("Error: {}", body.text))),
        }
    }

    async fn poll(&self, job_id: &str) -> Result<String> {
        let status_url = self
            .api
            .status_base
            .join(job_id)
            .map_err(|e| CustodyError::archive(format!("Error: bad job id '{}': {}", job_id, e)))?;
        let deadline = Instant::now() + self.config.timeout;

        loop {
            if Instant::now() > deadline {
                return Err(CustodyError::ArchiveTimedOut(self.config.timeout));
            }
            let response = self.send(|| self.api.http.get(status_url.clone())).await?;
            let body = expect_ok(response).await?;
            match body.json.get("status").and_then(Value::as_str) {
                Some("pending") => {
                    debug!("Capture job {} pending", job_id);
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Some("success") => {
                    let timestamp = text_of(body.json.get("timestamp"));
                    let original = text_of(body.json.get("original_url"));
                    return match (timestamp, original) {
                        (Some(timestamp), Some(original)) => {
                            Ok(permanent_url(&self.config.web_base, &timestamp, &original))
                        }
                        _ => Err(CustodyError::archive(format!("Error: {}", body.text))),
                    };
                }
                _ => return Err(CustodyError::archive(format!("Error: {}", body.text))),
            }
        }
    }
}

#[async_trait]
impl Archive for WaybackClient {
    #[instrument(skip_all, fields(url = %url))]
    async fn capture(&self, url: &Url) -> Result<String> {
        let job_id = self.submit(url).await?;
        info!("Submitted capture job {}", job_id);
        self.poll(&job_id).await
    }

    async fn retrieve(&self, archive_url: &str) -> Result<ByteStream> {
        let response = self.downloads.get(archive_url).send().await?.error_for_status()?;
        Ok(response.bytes_stream().map_err(CustodyError::from).boxed())
    }
}

struct Body {
    text: String,
    json: Value,
}

async fn expect_ok(response: Response) -> Result<Body> {
    let status = response.status();
    let text = response.text().await?;
    if status != StatusCode::OK {
        return Err(CustodyError::archive(format!("Error: {}", text)));
    }
    let json = serde_json::from_str(&text).unwrap_or(Value::Null);
    Ok(Body { text, json })
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Form parameters of a capture request
pub fn capture_params(url: &Url) -> Vec<(&'static str, String)> {
    let mut params = vec![("url", url.to_string())];
    params.extend(
        [
            ("capture_all", "0"),
            ("capture_outlinks", "0"),
            ("capture_screenshot", "0"),
            ("delay_wb_availability", "0"),
            ("force_get", "1"),
            ("skip_first_archive", "1"),
            ("outlinks_availability", "0"),
            ("email_result", "1"),
            ("js_behavior_timeout", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string())),
    );
    params
}

/// Permanent URL of a capture
pub fn permanent_url(web_base: &str, timestamp: &str, original_url: &str) -> String {
    format!("{}/{}/{}", web_base.trim_end_matches('/'), timestamp, original_url)
}
