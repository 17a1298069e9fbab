//! Databuddy Tracker - telemetry collection and delivery engine.
//!
//! This crate captures page, interaction, performance, error and custom
//! events for a visiting user and ships them to a Databuddy collector,
//! batching them per kind and coping with flaky networks, page teardown,
//! rate control and bot traffic.
//!
//! # Overview
//!
//! The page a tracker runs in is a [`host::BrowsingContext`]: location,
//! document metadata, storage and the beacon primitive. A [`Tracker`] built
//! over one applies skip checks, the caller's filter and sampling to every
//! event, then routes it to one of four [`queue::EventQueue`]s that flush on
//! a size threshold or a timer. A tracker built without a browsing context
//! (server-side rendering) skips everything.
//!
//! Delivery is at-least-once. Each page event carries a unique `event_id`
//! so the collector can de-duplicate.
//!
//! # Modules
//!
//! - [`tracker`]: The orchestrator and public API
//! - [`queue`]: Batching queues with size and time triggers
//! - [`delivery`]: HTTP client with retry and the beacon path
//! - [`identity`]: Anonymous and session identifiers
//! - [`bot`]: Automated-traffic classification
//! - [`gate`]: Environment-level skip checks
//! - [`patterns`]: Skip and mask path patterns
//! - [`routes`]: Route-change subscribers
//! - [`host`]: Browsing context capability and an in-memory page
//! - [`storage`]: Key-value storage capability
//! - [`types`]: Event wire types
//! - [`config`]: Tracker options
//! - [`error`]: Error types for tracker operations

pub mod bot;
pub mod config;
pub mod delivery;
pub mod error;
pub mod gate;
pub mod host;
pub mod identity;
pub mod patterns;
pub mod queue;
pub mod routes;
pub mod storage;
pub mod tracker;
pub mod types;

pub use config::{ConfigError, EventFilter, TrackerOptions};
pub use delivery::{DeliveryClient, DeliveryConfig, DeliveryError, Endpoint, RetryPolicy};
pub use error::{Result, TrackerError};
pub use gate::SkipReason;
pub use host::{Beacon, BrowsingContext, StaticPage};
pub use queue::{FlushOutcome, QueueKind};
pub use routes::Subscription;
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use tracker::{Dispatch, ErrorDetails, FlushReport, Tracker, UnloadReport};
pub use types::{BaseEvent, CustomEventSpan, ErrorSpan, Event, EventContext, EventMeta, WebVitalEvent};
