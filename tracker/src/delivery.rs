//! HTTP delivery to the collector.
//!
//! This module handles transmitting events with:
//!
//! - Connection pooling via reqwest
//! - Client identification on every request (header and `client_id` query
//!   parameter)
//! - Optional exponential backoff retry for transient failures (connection
//!   errors, timeouts, 429 and 5xx responses)
//! - A fire-and-forget beacon path for page teardown
//!
//! In-flight requests are never cancelled by the tracker; once a send has
//! started it runs to completion or failure even if the page goes away.
//!
//! # Example
//!
//! ```no_run
//! use databuddy_tracker::delivery::{DeliveryClient, DeliveryConfig, Endpoint, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = DeliveryConfig::new("https://basket.databuddy.cc", "my-site")
//!         .with_retry_policy(RetryPolicy::default());
//!     let client = DeliveryClient::new(config, None).unwrap();
//!
//!     let payload = serde_json::json!([{ "name": "screen_view" }]);
//!     client.send(Endpoint::Batch, &payload).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::host::Beacon;

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Header carrying the client id.
pub const CLIENT_ID_HEADER: &str = "databuddy-client-id";

/// Header carrying the SDK name.
pub const SDK_NAME_HEADER: &str = "databuddy-sdk-name";

/// Header carrying the SDK version.
pub const SDK_VERSION_HEADER: &str = "databuddy-sdk-version";

/// Query parameter carrying the client id.
pub const CLIENT_ID_PARAM: &str = "client_id";

/// Errors that can occur during delivery.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// HTTP request failed before a response was received.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Collector answered with a non-success status.
    #[error("collector returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Transient failures persisted through every retry.
    #[error("delivery failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DeliveryError>,
    },

    /// Payload could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client id or SDK identification contains invalid header characters.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// Collector base URL cannot be parsed.
    #[error("invalid collector URL '{0}'")]
    InvalidUrl(String),
}

impl DeliveryError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || StatusCode::from_u16(*status).is_ok_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}

/// Collector endpoints, relative to the configured base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `POST /` - one forced event.
    Single,
    /// `POST /batch` - primary batch.
    Batch,
    /// `POST /vitals` - performance vitals batch.
    Vitals,
    /// `POST /errors` - error batch.
    Errors,
    /// `POST /events` - custom event batch.
    Events,
}

impl Endpoint {
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::Single => "/",
            Self::Batch => "/batch",
            Self::Vitals => "/vitals",
            Self::Errors => "/errors",
            Self::Events => "/events",
        }
    }
}

/// Retry behaviour for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// When false every send is a single attempt.
    pub enabled: bool,

    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry; doubles for each subsequent retry.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Enabled policy with `max_retries` retries starting at `initial_delay`.
    #[must_use]
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            enabled: true,
            max_retries,
            initial_delay,
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Enabled policy with very short delays, for tests against a mock
    /// collector.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self::new(3, Duration::from_millis(10))
    }

    /// Total attempts a send may make.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        if self.enabled {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }
}

/// Configuration for the delivery client.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Collector base URL (e.g., `https://basket.databuddy.cc`).
    pub api_url: String,

    /// Site identifier sent with every request.
    pub client_id: String,

    pub sdk_name: String,

    pub sdk_version: String,

    pub retry_policy: RetryPolicy,
}

impl DeliveryConfig {
    /// Creates a configuration with default SDK identification and no
    /// retries.
    #[must_use]
    pub fn new(api_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            client_id: client_id.into(),
            sdk_name: "web".to_string(),
            sdk_version: "2.0.0".to_string(),
            retry_policy: RetryPolicy::disabled(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    #[must_use]
    pub fn with_sdk(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.sdk_name = name.into();
        self.sdk_version = version.into();
        self
    }
}

/// HTTP client for the collector.
pub struct DeliveryClient {
    config: DeliveryConfig,
    client: Client,
    headers: HeaderMap,
    beacon: Option<Arc<dyn Beacon>>,
}

impl DeliveryClient {
    /// Creates a client. `beacon` is the host's background-delivery
    /// primitive, if it has one.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError` if the base URL is invalid, the identification
    /// headers contain invalid characters, or the HTTP client cannot be built.
    pub fn new(
        config: DeliveryConfig,
        beacon: Option<Arc<dyn Beacon>>,
    ) -> Result<Self, DeliveryError> {
        Url::parse(&config.api_url).map_err(|_| DeliveryError::InvalidUrl(config.api_url.clone()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CLIENT_ID_HEADER, HeaderValue::from_str(&config.client_id)?);
        headers.insert(SDK_NAME_HEADER, HeaderValue::from_str(&config.sdk_name)?);
        headers.insert(SDK_VERSION_HEADER, HeaderValue::from_str(&config.sdk_version)?);

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            config,
            client,
            headers,
            beacon,
        })
    }

    /// Returns the retry policy in effect.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy
    }

    /// Full URL for `endpoint`, without the query string.
    #[must_use]
    pub fn endpoint_url(&self, endpoint: Endpoint) -> String {
        format!(
            "{}{}",
            self.config.api_url.trim_end_matches('/'),
            endpoint.path()
        )
    }

    /// Sends `payload` as JSON to `endpoint`, retrying transient failures
    /// when the retry policy is enabled.
    ///
    /// # Errors
    ///
    /// Returns the failure of the last attempt, wrapped in
    /// `DeliveryError::RetriesExhausted` when retries were made.
    pub async fn send<T>(&self, endpoint: Endpoint, payload: &T) -> Result<(), DeliveryError>
    where
        T: Serialize + ?Sized,
    {
        let url = self.endpoint_url(endpoint);
        let body = serde_json::to_vec(payload)?;
        let policy = self.config.retry_policy;
        let max_attempts = policy.max_attempts();

        let mut attempts = 0;

        loop {
            attempts += 1;

            debug!(
                url = %url,
                bytes = body.len(),
                attempt = attempts,
                "Sending payload"
            );

            match self.attempt(&url, body.clone()).await {
                Ok(()) => {
                    debug!(url = %url, attempts, "Payload delivered");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    let delay = policy.delay_for(attempts);
                    warn!(
                        error = %e,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient delivery failure, will retry"
                    );
                    sleep(delay).await;
                }
                Err(e) if e.is_transient() && attempts > 1 => {
                    return Err(DeliveryError::RetriesExhausted {
                        attempts,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, url: &str, body: Vec<u8>) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .query(&[(CLIENT_ID_PARAM, self.config.client_id.as_str())])
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status {
            status: status.as_u16(),
            message,
        })
    }

    /// Hands `data` to the host's beacon primitive.
    ///
    /// Returns whether the host accepted the request for delivery. There is
    /// no success or failure signal beyond that, so this is only used when a
    /// normal send cannot be awaited.
    pub fn send_beacon<T>(&self, data: &T, endpoint: Endpoint) -> bool
    where
        T: Serialize + ?Sized,
    {
        let Some(beacon) = &self.beacon else {
            debug!("No beacon primitive available");
            return false;
        };

        let body = match serde_json::to_vec(data) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize beacon payload");
                return false;
            }
        };

        let url = match Url::parse_with_params(
            &self.endpoint_url(endpoint),
            &[(CLIENT_ID_PARAM, self.config.client_id.as_str())],
        ) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Failed to build beacon URL");
                return false;
            }
        };

        let accepted = beacon.send_beacon(url.as_str(), body);
        info!(endpoint = endpoint.path(), accepted, "Beacon handed to host");
        accepted
    }
}

/// Beacon primitive for native hosts.
///
/// Spawns the POST on the current tokio runtime and returns immediately.
/// "Accepted" means a runtime was available to take the request.
#[derive(Debug, Clone)]
pub struct SpawnedBeacon {
    client: Client,
}

impl SpawnedBeacon {
    /// # Errors
    ///
    /// Returns `DeliveryError::Http` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }
}

impl Beacon for SpawnedBeacon {
    fn send_beacon(&self, url: &str, body: Vec<u8>) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let url = url.to_string();

        handle.spawn(async move {
            if let Err(e) = request.send().await {
                debug!(url = %url, error = %e, "Beacon delivery failed");
            }
        });
        true
    }
}
