//! Event types for the Databuddy tracker.
//!
//! This module defines the wire schema shared with the collector. Every event
//! carries an [`EventMeta`] header (client, visitor, session, timestamp) plus a
//! kind-specific payload. All types serialize to `snake_case` JSON and
//! timestamps are UTC milliseconds since the epoch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Prefix for all event IDs.
const EVENT_ID_PREFIX: &str = "evt_";

/// Arbitrary JSON properties attached to an event.
pub type Properties = Map<String, Value>;

/// Identification header carried by every event kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Site identifier the tracker was constructed with.
    pub client_id: String,

    /// Long-lived visitor identifier (`anon_<uuid>`).
    pub anonymous_id: String,

    /// Current session identifier (`sess_<uuid>`).
    pub session_id: String,

    /// When the event was produced.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of page and environment state, computed fresh for every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    /// Origin + masked pathname + search + hash.
    pub path: String,
    pub title: String,
    /// Document referrer, `"direct"` when there is none.
    pub referrer: String,
    /// `"<width>x<height>"`, omitted when the viewport is implausible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
}

/// A page or interaction event, routed through the primary queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseEvent {
    /// Unique event identifier (`evt_<uuid>`), used by the collector to
    /// de-duplicate at-least-once deliveries.
    pub event_id: String,

    /// Event name, e.g. `screen_view`.
    pub name: String,

    #[serde(flatten)]
    pub meta: EventMeta,

    /// When the current session started.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub session_start_time: DateTime<Utc>,

    #[serde(flatten)]
    pub context: EventContext,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
}

impl BaseEvent {
    /// Creates a new event with a freshly generated ID.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::Utc;
    /// use databuddy_tracker::types::{BaseEvent, EventContext, EventMeta};
    ///
    /// let meta = EventMeta {
    ///     client_id: "site-1".to_string(),
    ///     anonymous_id: "anon_1".to_string(),
    ///     session_id: "sess_1".to_string(),
    ///     timestamp: Utc::now(),
    /// };
    /// let event = BaseEvent::new("screen_view", meta, Utc::now(), EventContext::default());
    ///
    /// assert!(event.event_id.starts_with("evt_"));
    /// ```
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        meta: EventMeta,
        session_start_time: DateTime<Utc>,
        context: EventContext,
    ) -> Self {
        Self {
            event_id: generate_event_id(),
            name: name.into(),
            meta,
            session_start_time,
            context,
            properties: None,
        }
    }

    /// Attaches custom properties to the event.
    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// A web performance measurement (LCP, FCP, CLS, INP, TTFB, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebVitalEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub metric_name: String,
    pub metric_value: f64,
    /// Masked page path the measurement was taken on.
    pub path: String,
}

/// A captured client-side error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSpan {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub path: String,
}

/// A custom, application-defined event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEventSpan {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    pub path: String,
}

/// Any event the tracker accepts, as seen by the filter predicate.
///
/// Serializes as the wrapped event, with no tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Page(BaseEvent),
    Vital(WebVitalEvent),
    Error(ErrorSpan),
    Custom(CustomEventSpan),
}

impl Event {
    /// Returns the identification header of the wrapped event.
    #[must_use]
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::Page(e) => &e.meta,
            Self::Vital(e) => &e.meta,
            Self::Error(e) => &e.meta,
            Self::Custom(e) => &e.meta,
        }
    }
}

impl From<BaseEvent> for Event {
    fn from(event: BaseEvent) -> Self {
        Self::Page(event)
    }
}

impl From<WebVitalEvent> for Event {
    fn from(event: WebVitalEvent) -> Self {
        Self::Vital(event)
    }
}

impl From<ErrorSpan> for Event {
    fn from(event: ErrorSpan) -> Self {
        Self::Error(event)
    }
}

impl From<CustomEventSpan> for Event {
    fn from(event: CustomEventSpan) -> Self {
        Self::Custom(event)
    }
}

/// Generates a unique event ID with the format `evt_<uuid>`.
fn generate_event_id() -> String {
    format!("{EVENT_ID_PREFIX}{}", Uuid::new_v4())
}
