//! The tracker orchestrator.
//!
//! A [`Tracker`] owns everything one page needs: identity, the latched bot
//! verdict, four batching queues and the delivery client. Every reported
//! event goes through the same pipeline before any queue sees it:
//!
//! 1. environment checks (no browsing context, disabled, bot, skip pattern)
//! 2. the caller's filter
//! 3. the sampling draw
//! 4. routing to a queue, or straight to `POST /` for forced sends and when
//!    batching is off
//!
//! Reporting never blocks and never fails; the outcome is returned as a
//! [`Dispatch`] for callers that care.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reqwest::Url;
use serde::Serialize;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bot::BotFilter;
use crate::config::TrackerOptions;
use crate::delivery::{DeliveryClient, Endpoint};
use crate::error::{Result, TrackerError};
use crate::gate::{SkipReason, TrackingGate};
use crate::host::BrowsingContext;
use crate::identity::IdentityManager;
use crate::patterns::mask_path;
use crate::queue::{EventQueue, Fallback, FlushOutcome, QueueKind};
use crate::routes::{RouteChangeChannel, SubscriberError, Subscription};
use crate::types::{
    BaseEvent, CustomEventSpan, ErrorSpan, Event, EventContext, EventMeta, Properties,
    WebVitalEvent,
};

/// Smallest plausible viewport dimension, in CSS pixels.
const MIN_VIEWPORT: u32 = 240;

/// Largest plausible viewport dimension, in CSS pixels.
const MAX_VIEWPORT: u32 = 10_000;

/// Referrer reported when the document has none.
const DIRECT_REFERRER: &str = "direct";

/// Event name used for page views.
pub const PAGE_VIEW_EVENT: &str = "screen_view";

const UTM_PARAMS: [&str; 5] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
];

/// What happened to a reported event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Appended to the queue of this kind.
    Queued(QueueKind),
    /// Sent on its own to `POST /`.
    SentDirect,
    /// Not tracked.
    Skipped(SkipReason),
}

/// Optional error location and classification for [`Tracker::track_error`].
#[derive(Debug, Clone, Default)]
pub struct ErrorDetails {
    pub filename: Option<String>,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
    pub stack: Option<String>,
    pub error_type: Option<String>,
}

/// One batch handed to the beacon primitive on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadBatch {
    pub kind: QueueKind,
    pub events: usize,
    /// Whether the host accepted the beacon.
    pub accepted: bool,
}

/// Result of [`Tracker::flush_on_unload`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnloadReport {
    /// Non-empty batches, in primary, vitals, errors, custom order.
    pub batches: Vec<UnloadBatch>,
}

impl UnloadReport {
    /// Events in batches the host accepted.
    #[must_use]
    pub fn handed_off(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.accepted)
            .map(|b| b.events)
            .sum()
    }

    /// Events in batches the host declined. These are lost.
    #[must_use]
    pub fn declined(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| !b.accepted)
            .map(|b| b.events)
            .sum()
    }
}

/// Flush results of [`Tracker::flush_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub primary: FlushOutcome,
    pub vitals: FlushOutcome,
    pub errors: FlushOutcome,
    pub custom: FlushOutcome,
}

/// The four queues of one tracker.
struct Queues {
    primary: EventQueue<BaseEvent>,
    vitals: EventQueue<WebVitalEvent>,
    errors: EventQueue<ErrorSpan>,
    custom: EventQueue<CustomEventSpan>,
}

impl Queues {
    fn new(
        options: &TrackerOptions,
        client: &Arc<DeliveryClient>,
        gate: &Arc<TrackingGate>,
        runtime: &Handle,
    ) -> Self {
        Self {
            primary: build_queue(
                QueueKind::Primary,
                options,
                client,
                Fallback::SendIndividually(Arc::clone(gate)),
                runtime,
            ),
            vitals: build_queue(QueueKind::Vitals, options, client, Fallback::Drop, runtime),
            errors: build_queue(QueueKind::Errors, options, client, Fallback::Drop, runtime),
            custom: build_queue(QueueKind::Custom, options, client, Fallback::Drop, runtime),
        }
    }

    fn lost(&self) -> usize {
        self.primary.lost() + self.vitals.lost() + self.errors.lost() + self.custom.lost()
    }

    fn in_flight(&self) -> usize {
        self.primary.in_flight()
            + self.vitals.in_flight()
            + self.errors.in_flight()
            + self.custom.in_flight()
    }
}

fn build_queue<E>(
    kind: QueueKind,
    options: &TrackerOptions,
    client: &Arc<DeliveryClient>,
    fallback: Fallback,
    runtime: &Handle,
) -> EventQueue<E>
where
    E: Serialize + Send + Sync + 'static,
{
    EventQueue::new(
        kind,
        kind.batch_size(options.batch_size),
        options.batch_timeout(),
        Arc::clone(client),
        fallback,
        runtime.clone(),
    )
}

struct Inner {
    options: TrackerOptions,
    host: Option<Arc<dyn BrowsingContext>>,
    identity: IdentityManager,
    bot: BotFilter,
    gate: Arc<TrackingGate>,
    client: Arc<DeliveryClient>,
    queues: Queues,
    routes: RouteChangeChannel,
    runtime: Handle,
}

/// Telemetry tracker for one page.
///
/// Cloning yields another handle to the same tracker.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use databuddy_tracker::config::TrackerOptions;
/// use databuddy_tracker::host::StaticPage;
/// use databuddy_tracker::tracker::Tracker;
/// use reqwest::Url;
///
/// #[tokio::main]
/// async fn main() {
///     let page = Arc::new(StaticPage::new(Url::parse("https://example.com/").unwrap()));
///     let tracker = Tracker::new(TrackerOptions::new("my-site"), Some(page)).unwrap();
///
///     tracker.track_page_view();
///     tracker.shutdown(std::time::Duration::from_secs(5)).await;
/// }
/// ```
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl Tracker {
    /// Creates a tracker for `host`, or a server-side tracker that skips
    /// every event when `host` is `None`.
    ///
    /// Bot classification happens here, once.
    ///
    /// # Errors
    ///
    /// Returns `TrackerError::Config` when the options fail validation,
    /// `TrackerError::NoRuntime` outside a tokio runtime, and
    /// `TrackerError::Delivery` when the HTTP client cannot be built.
    pub fn new(options: TrackerOptions, host: Option<Arc<dyn BrowsingContext>>) -> Result<Self> {
        options.validate()?;
        let runtime = Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;

        let beacon = host.as_ref().and_then(|h| h.beacon());
        let client = Arc::new(DeliveryClient::new(options.delivery_config(), beacon)?);

        let bot = BotFilter::new(host.as_deref(), options.ignore_bot_detection);
        if let Some(host) = &host {
            bot.setup_bot_detection(host.as_ref());
        }

        let gate = Arc::new(TrackingGate::new(
            host.clone(),
            options.disabled,
            bot.is_likely_bot(),
            options.skip_patterns.clone(),
        ));
        let queues = Queues::new(&options, &client, &gate, &runtime);
        let identity = IdentityManager::new(host.clone());

        info!(
            client_id = %options.client_id,
            api_url = %options.api_url,
            batching = options.enable_batching,
            browsing_context = host.is_some(),
            "Tracker initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                host,
                identity,
                bot,
                gate,
                client,
                queues,
                routes: RouteChangeChannel::new(),
                runtime,
            }),
        })
    }

    #[must_use]
    pub fn options(&self) -> &TrackerOptions {
        &self.inner.options
    }

    // ----- reporting -----

    /// Reports a page or interaction event.
    pub fn send(&self, event: BaseEvent) -> Dispatch {
        self.dispatch(Event::Page(event))
    }

    pub fn send_vital(&self, event: WebVitalEvent) -> Dispatch {
        self.dispatch(Event::Vital(event))
    }

    pub fn send_error(&self, error: ErrorSpan) -> Dispatch {
        self.dispatch(Event::Error(error))
    }

    pub fn send_custom_event(&self, event: CustomEventSpan) -> Dispatch {
        self.dispatch(Event::Custom(event))
    }

    /// Runs `event` through the pipeline and routes it.
    pub fn dispatch(&self, event: Event) -> Dispatch {
        if let Some(reason) = self.skip_reason(&event) {
            debug!(%reason, "Event skipped");
            return Dispatch::Skipped(reason);
        }

        let queues = &self.inner.queues;
        match event {
            Event::Page(event) if self.inner.options.enable_batching => {
                queues.primary.enqueue(event);
                Dispatch::Queued(QueueKind::Primary)
            }
            Event::Page(event) => {
                self.spawn_direct(Event::Page(event));
                Dispatch::SentDirect
            }
            Event::Vital(event) => {
                queues.vitals.enqueue(event);
                Dispatch::Queued(QueueKind::Vitals)
            }
            Event::Error(event) => {
                queues.errors.enqueue(event);
                Dispatch::Queued(QueueKind::Errors)
            }
            Event::Custom(event) => {
                queues.custom.enqueue(event);
                Dispatch::Queued(QueueKind::Custom)
            }
        }
    }

    /// Forced send: runs the pipeline, then awaits a single `POST /`,
    /// bypassing the primary queue.
    ///
    /// # Errors
    ///
    /// Returns `TrackerError::Delivery` when the collector rejects the event
    /// or cannot be reached.
    pub async fn send_now(&self, event: BaseEvent) -> Result<Dispatch> {
        let event = Event::Page(event);
        if let Some(reason) = self.skip_reason(&event) {
            debug!(%reason, "Forced event skipped");
            return Ok(Dispatch::Skipped(reason));
        }

        self.inner.client.send(Endpoint::Single, &event).await?;
        Ok(Dispatch::SentDirect)
    }

    /// Builds a page event and sends it with [`Tracker::send_now`].
    ///
    /// The environment checks run before the event is built, so a skipped
    /// event never touches the visitor's identity.
    ///
    /// # Errors
    ///
    /// Same as [`Tracker::send_now`].
    pub async fn track_now(&self, name: &str, properties: Properties) -> Result<Dispatch> {
        if let Some(reason) = self.inner.gate.skip_reason() {
            return Ok(Dispatch::Skipped(reason));
        }
        self.send_now(self.page_event(name, properties)).await
    }

    /// Why `event` would not be tracked right now, if it would not.
    fn skip_reason(&self, event: &Event) -> Option<SkipReason> {
        if let Some(reason) = self.inner.gate.skip_reason() {
            return Some(reason);
        }

        let options = &self.inner.options;
        if matches!(event, Event::Vital(_)) && !options.track_performance {
            return Some(SkipReason::PerformanceTrackingDisabled);
        }

        if let Some(filter) = &options.filter {
            match catch_unwind(AssertUnwindSafe(|| filter.allows(event))) {
                Ok(true) => {}
                Ok(false) => return Some(SkipReason::Filtered),
                Err(_) => {
                    warn!("Event filter panicked, skipping event");
                    return Some(SkipReason::FilterPanicked);
                }
            }
        }

        if options.sampling_rate < 1.0 {
            let draw: f64 = rand::rng().random();
            if draw >= options.sampling_rate {
                return Some(SkipReason::SampledOut);
            }
        }

        None
    }

    fn spawn_direct(&self, event: Event) {
        let client = Arc::clone(&self.inner.client);
        self.inner.runtime.spawn(async move {
            if let Err(e) = client.send(Endpoint::Single, &event).await {
                warn!(error = %e, "Direct send failed");
            }
        });
    }

    // ----- event builders -----

    /// Reports a named event with optional properties.
    pub fn track(&self, name: &str, properties: Properties) -> Dispatch {
        if let Some(reason) = self.inner.gate.skip_reason() {
            debug!(%reason, name, "Event skipped");
            return Dispatch::Skipped(reason);
        }

        self.send(self.page_event(name, properties))
    }

    /// Builds a page event for the current location and session without
    /// reporting it.
    #[must_use]
    pub fn page_event(&self, name: &str, properties: Properties) -> BaseEvent {
        let event = BaseEvent::new(
            name,
            self.meta(),
            self.inner.identity.session_start_time(),
            self.context(),
        );
        if properties.is_empty() {
            event
        } else {
            event.with_properties(properties)
        }
    }

    /// Reports a page view of the current location.
    pub fn track_page_view(&self) -> Dispatch {
        self.track(PAGE_VIEW_EVENT, Properties::new())
    }

    /// Reports a performance measurement.
    pub fn track_vital(&self, metric_name: &str, metric_value: f64) -> Dispatch {
        if let Some(reason) = self.inner.gate.skip_reason() {
            return Dispatch::Skipped(reason);
        }

        self.send_vital(WebVitalEvent {
            meta: self.meta(),
            metric_name: metric_name.to_string(),
            metric_value,
            path: self.masked_path(),
        })
    }

    /// Reports a client-side error.
    pub fn track_error(&self, message: &str, details: ErrorDetails) -> Dispatch {
        if let Some(reason) = self.inner.gate.skip_reason() {
            return Dispatch::Skipped(reason);
        }

        self.send_error(ErrorSpan {
            meta: self.meta(),
            message: message.to_string(),
            filename: details.filename,
            lineno: details.lineno,
            colno: details.colno,
            stack: details.stack,
            error_type: details.error_type,
            path: self.masked_path(),
        })
    }

    /// Reports an application-defined event.
    pub fn track_custom(&self, event_name: &str, properties: Properties) -> Dispatch {
        if let Some(reason) = self.inner.gate.skip_reason() {
            return Dispatch::Skipped(reason);
        }

        self.send_custom_event(CustomEventSpan {
            meta: self.meta(),
            event_name: event_name.to_string(),
            properties: (!properties.is_empty()).then_some(properties),
            path: self.masked_path(),
        })
    }

    fn meta(&self) -> EventMeta {
        EventMeta {
            client_id: self.inner.options.client_id.clone(),
            anonymous_id: self.inner.identity.anonymous_id(),
            session_id: self.inner.identity.session_id(),
            timestamp: Utc::now(),
        }
    }

    // ----- page context -----

    /// Snapshot of the current page, with the path masked.
    ///
    /// Empty without a browsing context.
    #[must_use]
    pub fn context(&self) -> EventContext {
        let Some(host) = &self.inner.host else {
            return EventContext::default();
        };

        let location = host.location();
        let path = format!(
            "{}{}{}{}",
            location.origin().ascii_serialization(),
            mask_path(location.path(), &self.inner.options.mask_patterns),
            location.query().map(|q| format!("?{q}")).unwrap_or_default(),
            location.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        );

        let viewport_size = host
            .viewport()
            .filter(|&(w, h)| {
                (MIN_VIEWPORT..=MAX_VIEWPORT).contains(&w) && (MIN_VIEWPORT..=MAX_VIEWPORT).contains(&h)
            })
            .map(|(w, h)| format!("{w}x{h}"));

        let [utm_source, utm_medium, utm_campaign, utm_term, utm_content] =
            UTM_PARAMS.map(|name| utm_param(&location, name));

        EventContext {
            path,
            title: host.title(),
            referrer: host
                .referrer()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DIRECT_REFERRER.to_string()),
            viewport_size,
            timezone: host.timezone(),
            language: host.language(),
            utm_source,
            utm_medium,
            utm_campaign,
            utm_term,
            utm_content,
        }
    }

    /// Current pathname with the first matching mask pattern applied.
    ///
    /// Empty without a browsing context.
    #[must_use]
    pub fn masked_path(&self) -> String {
        match &self.inner.host {
            Some(host) => mask_path(host.location().path(), &self.inner.options.mask_patterns),
            None => String::new(),
        }
    }

    // ----- flushing -----

    /// Flushes all four queues concurrently.
    pub async fn flush_all(&self) -> FlushReport {
        let queues = &self.inner.queues;
        let (primary, vitals, errors, custom) = tokio::join!(
            queues.primary.flush(),
            queues.vitals.flush(),
            queues.errors.flush(),
            queues.custom.flush(),
        );
        FlushReport {
            primary,
            vitals,
            errors,
            custom,
        }
    }

    /// Page teardown: takes every pending event synchronously and hands each
    /// non-empty queue to the beacon primitive as one batch.
    ///
    /// Batches already in flight are left to finish on their own.
    pub fn flush_on_unload(&self) -> UnloadReport {
        let queues = &self.inner.queues;
        let mut report = UnloadReport::default();

        report.batches.extend(self.beacon_batch(QueueKind::Primary, queues.primary.drain()));
        report.batches.extend(self.beacon_batch(QueueKind::Vitals, queues.vitals.drain()));
        report.batches.extend(self.beacon_batch(QueueKind::Errors, queues.errors.drain()));
        report.batches.extend(self.beacon_batch(QueueKind::Custom, queues.custom.drain()));

        if report.declined() > 0 {
            warn!(events = report.declined(), "Beacon declined, events lost on unload");
        }
        report
    }

    fn beacon_batch<E: Serialize>(&self, kind: QueueKind, batch: Vec<E>) -> Option<UnloadBatch> {
        if batch.is_empty() {
            return None;
        }
        let accepted = self.inner.client.send_beacon(&batch, kind.endpoint());
        Some(UnloadBatch {
            kind,
            events: batch.len(),
            accepted,
        })
    }

    /// Flushes every queue until it is idle and empty, waiting at most
    /// `timeout`. Batches already in flight are waited for.
    ///
    /// Returns the number of events not delivered: those lost to failed
    /// flushes during shutdown plus those still pending or in flight when
    /// it gave up.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let queues = &self.inner.queues;
        let lost_before = queues.lost();

        // Spawned so a timeout does not cancel requests mid-flight and
        // hide their events from the count below.
        let settling = [
            self.spawn_settle(&queues.primary),
            self.spawn_settle(&queues.vitals),
            self.spawn_settle(&queues.errors),
            self.spawn_settle(&queues.custom),
        ];
        if tokio::time::timeout(timeout, join_all(settling)).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Shutdown flush timed out");
        }

        let lost = queues.lost().saturating_sub(lost_before);
        let remaining = self.pending_events() + queues.in_flight();
        if lost > 0 {
            error!(lost, "Events lost to failed flushes during shutdown");
        }
        if remaining > 0 {
            warn!(remaining, "Events still pending after shutdown");
        }
        if lost == 0 && remaining == 0 {
            info!("Tracker shut down cleanly");
        }
        lost + remaining
    }

    fn spawn_settle<E>(&self, queue: &EventQueue<E>) -> JoinHandle<()>
    where
        E: Serialize + Send + Sync + 'static,
    {
        let queue = queue.clone();
        self.inner.runtime.spawn(async move { queue.settle().await })
    }

    /// Events waiting in the queue of `kind`.
    #[must_use]
    pub fn pending(&self, kind: QueueKind) -> usize {
        let queues = &self.inner.queues;
        match kind {
            QueueKind::Primary => queues.primary.len(),
            QueueKind::Vitals => queues.vitals.len(),
            QueueKind::Errors => queues.errors.len(),
            QueueKind::Custom => queues.custom.len(),
        }
    }

    /// Events waiting across all four queues.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        [
            QueueKind::Primary,
            QueueKind::Vitals,
            QueueKind::Errors,
            QueueKind::Custom,
        ]
        .into_iter()
        .map(|kind| self.pending(kind))
        .sum()
    }

    // ----- route changes -----

    /// Registers a route-change subscriber.
    pub fn on_route_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str) -> std::result::Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.inner.routes.subscribe(callback)
    }

    /// Notifies subscribers of a navigation to `path`. Returns how many
    /// completed without error.
    pub fn notify_route_change(&self, path: &str) -> usize {
        self.inner.routes.notify(path)
    }

    // ----- visitor -----

    #[must_use]
    pub fn is_likely_bot(&self) -> bool {
        self.inner.bot.is_likely_bot()
    }

    #[must_use]
    pub fn has_interacted(&self) -> bool {
        self.inner.bot.has_interacted()
    }

    pub fn record_interaction(&self) {
        self.inner.bot.record_interaction();
    }

    pub fn anonymous_id(&self) -> String {
        self.inner.identity.anonymous_id()
    }

    pub fn session_id(&self) -> String {
        self.inner.identity.session_id()
    }
}

fn utm_param(location: &Url, name: &str) -> Option<String> {
    location
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}
