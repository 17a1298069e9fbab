//! Tracker configuration.
//!
//! Options are fixed at construction. They can be built in code with the
//! `with_*` setters, deserialized from a camelCase JSON document, or read
//! from the environment.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DATABUDDY_CLIENT_ID` | Yes | - | Site identifier |
//! | `DATABUDDY_API_URL` | No | `https://basket.databuddy.cc` | Collector base URL |
//! | `DATABUDDY_DISABLED` | No | false | Skip every event |
//! | `DATABUDDY_TRACK_PERFORMANCE` | No | true | Report web vitals |
//! | `DATABUDDY_SAMPLING_RATE` | No | 1.0 | Keep probability per event (0.0-1.0) |
//! | `DATABUDDY_ENABLE_RETRIES` | No | false | Retry transient delivery failures |
//! | `DATABUDDY_MAX_RETRIES` | No | 3 | Retries after the first attempt |
//! | `DATABUDDY_INITIAL_RETRY_DELAY_MS` | No | 500 | First backoff delay, doubles per retry |
//! | `DATABUDDY_ENABLE_BATCHING` | No | true | Batch primary events |
//! | `DATABUDDY_BATCH_SIZE` | No | 10 | Primary batch size threshold |
//! | `DATABUDDY_BATCH_TIMEOUT_MS` | No | 5000 | Flush timer for every queue |
//! | `DATABUDDY_SKIP_PATTERNS` | No | (none) | Comma-separated path patterns to skip |
//! | `DATABUDDY_MASK_PATTERNS` | No | (none) | Comma-separated path patterns to mask |
//! | `DATABUDDY_IGNORE_BOT_DETECTION` | No | false | Track automated traffic too |
//!
//! # Example
//!
//! ```no_run
//! use databuddy_tracker::config::TrackerOptions;
//!
//! let options = TrackerOptions::from_env().expect("Failed to load configuration");
//! println!("Collector: {}", options.api_url);
//! ```

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::delivery::{DeliveryConfig, RetryPolicy};
use crate::types::Event;

/// Default collector base URL.
pub const DEFAULT_API_URL: &str = "https://basket.databuddy.cc";

/// Default primary batch size threshold.
const DEFAULT_BATCH_SIZE: usize = 10;

/// Default flush timer (in milliseconds).
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 5000;

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default first backoff delay (in milliseconds).
const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 500;

const DEFAULT_SDK_NAME: &str = "web";

const DEFAULT_SDK_VERSION: &str = "2.0.0";

/// Errors that can occur while building tracker options.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No client id was supplied.
    #[error("client id is required")]
    MissingClientId,

    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Option or environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Caller-supplied predicate deciding whether an event is tracked.
#[derive(Clone)]
pub struct EventFilter(Arc<dyn Fn(&Event) -> bool + Send + Sync>);

impl EventFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Runs the predicate. Panics propagate to the caller.
    #[must_use]
    pub fn allows(&self, event: &Event) -> bool {
        (self.0)(event)
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventFilter(..)")
    }
}

/// Options a tracker is constructed with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerOptions {
    /// Site identifier. Required.
    pub client_id: String,

    /// Collector base URL.
    pub api_url: String,

    /// Kill switch: when set every event is skipped.
    pub disabled: bool,

    /// When false, vitals are skipped.
    pub track_performance: bool,

    /// Probability in `[0, 1]` that an event is kept.
    pub sampling_rate: f64,

    pub enable_retries: bool,

    /// Retries after the first attempt.
    pub max_retries: u32,

    /// First backoff delay in milliseconds; doubles for each retry.
    #[serde(rename = "initialRetryDelay")]
    pub initial_retry_delay_ms: u64,

    /// When false, primary events are sent one by one to `POST /`.
    pub enable_batching: bool,

    /// Primary queue size threshold.
    pub batch_size: usize,

    /// Flush timer for all four queues, in milliseconds.
    #[serde(rename = "batchTimeout")]
    pub batch_timeout_ms: u64,

    /// Path patterns that skip tracking.
    pub skip_patterns: Vec<String>,

    /// Path patterns that mask the reported path.
    pub mask_patterns: Vec<String>,

    /// Optional event predicate; not representable in JSON.
    #[serde(skip)]
    pub filter: Option<EventFilter>,

    /// Track visitors classified as automated traffic.
    pub ignore_bot_detection: bool,

    /// SDK name reported to the collector.
    pub sdk: String,

    /// SDK version reported to the collector.
    pub sdk_version: String,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
            disabled: false,
            track_performance: true,
            sampling_rate: 1.0,
            enable_retries: false,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_retry_delay_ms: DEFAULT_INITIAL_RETRY_DELAY_MS,
            enable_batching: true,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            skip_patterns: Vec::new(),
            mask_patterns: Vec::new(),
            filter: None,
            ignore_bot_detection: false,
            sdk: DEFAULT_SDK_NAME.to_string(),
            sdk_version: DEFAULT_SDK_VERSION.to_string(),
        }
    }
}

impl TrackerOptions {
    /// Default options for `client_id`.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Reads options from `DATABUDDY_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `DATABUDDY_CLIENT_ID` is not set
    /// - a numeric or boolean variable cannot be parsed
    /// - the resulting options fail [`TrackerOptions::validate`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = env::var("DATABUDDY_CLIENT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("DATABUDDY_CLIENT_ID".to_string()))?;

        let defaults = Self::default();

        let options = Self {
            client_id,
            api_url: env::var("DATABUDDY_API_URL").unwrap_or(defaults.api_url),
            disabled: env_bool("DATABUDDY_DISABLED", defaults.disabled)?,
            track_performance: env_bool("DATABUDDY_TRACK_PERFORMANCE", defaults.track_performance)?,
            sampling_rate: env_parse("DATABUDDY_SAMPLING_RATE", defaults.sampling_rate)?,
            enable_retries: env_bool("DATABUDDY_ENABLE_RETRIES", defaults.enable_retries)?,
            max_retries: env_parse("DATABUDDY_MAX_RETRIES", defaults.max_retries)?,
            initial_retry_delay_ms: env_parse(
                "DATABUDDY_INITIAL_RETRY_DELAY_MS",
                defaults.initial_retry_delay_ms,
            )?,
            enable_batching: env_bool("DATABUDDY_ENABLE_BATCHING", defaults.enable_batching)?,
            batch_size: env_parse("DATABUDDY_BATCH_SIZE", defaults.batch_size)?,
            batch_timeout_ms: env_parse("DATABUDDY_BATCH_TIMEOUT_MS", defaults.batch_timeout_ms)?,
            skip_patterns: env_list("DATABUDDY_SKIP_PATTERNS"),
            mask_patterns: env_list("DATABUDDY_MASK_PATTERNS"),
            filter: None,
            ignore_bot_detection: env_bool(
                "DATABUDDY_IGNORE_BOT_DETECTION",
                defaults.ignore_bot_detection,
            )?,
            sdk: defaults.sdk,
            sdk_version: defaults.sdk_version,
        };

        options.validate()?;
        Ok(options)
    }

    /// Checks option ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingClientId` for an empty client id and
    /// `ConfigError::InvalidValue` for an out-of-range option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(invalid(
                "sampling_rate",
                format!("must be between 0.0 and 1.0, got {}", self.sampling_rate),
            ));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be greater than 0"));
        }
        if self.batch_timeout_ms == 0 {
            return Err(invalid("batch_timeout", "must be greater than 0"));
        }
        if let Err(e) = Url::parse(&self.api_url) {
            return Err(invalid("api_url", format!("'{}': {e}", self.api_url)));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    #[must_use]
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    #[must_use]
    pub fn with_track_performance(mut self, track_performance: bool) -> Self {
        self.track_performance = track_performance;
        self
    }

    #[must_use]
    pub fn with_sampling_rate(mut self, sampling_rate: f64) -> Self {
        self.sampling_rate = sampling_rate;
        self
    }

    /// Enables retries with `max_retries` retries starting at
    /// `initial_delay`.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, initial_delay: Duration) -> Self {
        self.enable_retries = true;
        self.max_retries = max_retries;
        self.initial_retry_delay_ms = u64::try_from(initial_delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_batching(mut self, enable_batching: bool) -> Self {
        self.enable_batching = enable_batching;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout_ms = u64::try_from(batch_timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_skip_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_mask_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mask_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(EventFilter::new(predicate));
        self
    }

    #[must_use]
    pub fn with_ignore_bot_detection(mut self, ignore: bool) -> Self {
        self.ignore_bot_detection = ignore;
        self
    }

    #[must_use]
    pub fn with_sdk(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.sdk = name.into();
        self.sdk_version = version.into();
        self
    }

    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.enable_retries,
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_retry_delay_ms),
        }
    }

    /// Delivery settings derived from these options.
    #[must_use]
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig::new(&self.api_url, &self.client_id)
            .with_retry_policy(self.retry_policy())
            .with_sdk(&self.sdk, &self.sdk_version)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|_| invalid(key, format!("cannot parse '{val}'"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, format!("expected true or false, got '{val}'"))),
        },
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|val| {
            val.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
