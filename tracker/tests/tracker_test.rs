//! End-to-end tests for the tracker pipeline.
//!
//! A tracker runs over an in-memory page against a mock collector; the tests
//! check what reaches the wire for each configuration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use databuddy_tracker::config::TrackerOptions;
use databuddy_tracker::delivery::{CLIENT_ID_HEADER, SDK_NAME_HEADER};
use databuddy_tracker::gate::SkipReason;
use databuddy_tracker::host::{AutomationMarkers, Beacon, BrowsingContext, StaticPage};
use databuddy_tracker::identity::{ANONYMOUS_ID_KEY, SESSION_ID_KEY};
use databuddy_tracker::storage::{KeyValueStore, MemoryStore};
use databuddy_tracker::queue::{FlushOutcome, QueueKind};
use databuddy_tracker::tracker::{Dispatch, ErrorDetails, Tracker};
use databuddy_tracker::types::Properties;
use reqwest::Url;
use serde_json::{json, Value};
use tokio::time::sleep;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

/// Beacon primitive that records what it is handed.
#[derive(Default)]
struct RecordingBeacon {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl Beacon for RecordingBeacon {
    fn send_beacon(&self, url: &str, body: Vec<u8>) -> bool {
        self.sent.lock().unwrap().push((url.to_string(), body));
        true
    }
}

fn create_page(url: &str) -> Arc<StaticPage> {
    Arc::new(
        StaticPage::new(Url::parse(url).unwrap())
            .with_title("Pricing")
            .with_viewport(1440, 900)
            .with_language("en-US"),
    )
}

fn create_options(server: &MockServer) -> TrackerOptions {
    TrackerOptions::new("site-1")
        .with_api_url(server.uri())
        .with_batch_timeout(Duration::from_millis(100))
}

fn create_tracker(options: TrackerOptions, page: &Arc<StaticPage>) -> Tracker {
    let host: Arc<dyn BrowsingContext> = page.clone();
    Tracker::new(options, Some(host)).unwrap()
}

async fn mount_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, endpoint: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == endpoint)
        .collect()
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

// =============================================================================
// Delivery
// =============================================================================

/// Verifies a page view reaches `/batch` with identity and context.
#[tokio::test]
async fn test_page_view_is_batched_with_context() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/pricing?utm_campaign=launch");
    let tracker = create_tracker(create_options(&mock_server), &page);

    let mut properties = Properties::new();
    properties.insert("plan".to_string(), json!("pro"));

    assert_eq!(tracker.track_page_view(), Dispatch::Queued(QueueKind::Primary));
    assert_eq!(
        tracker.track("plan_selected", properties),
        Dispatch::Queued(QueueKind::Primary)
    );

    sleep(Duration::from_millis(400)).await;

    let requests = requests_to(&mock_server, "/batch").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].headers.get(CLIENT_ID_HEADER).unwrap(),
        "site-1"
    );
    assert_eq!(requests[0].headers.get(SDK_NAME_HEADER).unwrap(), "web");

    let batch: Vec<Value> = requests[0].body_json().unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0]["name"], "screen_view");
    assert_eq!(batch[0]["client_id"], "site-1");
    assert_eq!(batch[0]["anonymous_id"], tracker.anonymous_id());
    assert_eq!(batch[0]["session_id"], tracker.session_id());
    assert_eq!(
        batch[0]["path"],
        "https://example.com/pricing?utm_campaign=launch"
    );
    assert_eq!(batch[0]["title"], "Pricing");
    assert_eq!(batch[0]["referrer"], "direct");
    assert_eq!(batch[0]["viewport_size"], "1440x900");
    assert_eq!(batch[0]["utm_campaign"], "launch");
    assert!(batch[0]["event_id"].as_str().unwrap().starts_with("evt_"));
    assert_eq!(batch[1]["name"], "plan_selected");
    assert_eq!(batch[1]["properties"]["plan"], "pro");
}

/// Verifies each diagnostic kind reaches its own endpoint.
#[tokio::test]
async fn test_diagnostic_events_reach_their_endpoints() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/user/42/profile");
    let tracker = create_tracker(
        create_options(&mock_server).with_mask_patterns(["/user/*"]),
        &page,
    );

    tracker.track_vital("LCP", 1234.5);
    tracker.track_error(
        "TypeError: x is undefined",
        ErrorDetails {
            filename: Some("app.js".to_string()),
            lineno: Some(10),
            error_type: Some("TypeError".to_string()),
            ..ErrorDetails::default()
        },
    );
    tracker.track_custom("signup", Properties::new());

    let report = tracker.flush_all().await;
    assert_eq!(report.primary, FlushOutcome::Skipped);
    assert_eq!(report.vitals, FlushOutcome::Delivered { events: 1 });
    assert_eq!(report.errors, FlushOutcome::Delivered { events: 1 });
    assert_eq!(report.custom, FlushOutcome::Delivered { events: 1 });

    let vitals: Vec<Value> = requests_to(&mock_server, "/vitals").await[0]
        .body_json()
        .unwrap();
    assert_eq!(vitals[0]["metric_name"], "LCP");
    assert_eq!(vitals[0]["metric_value"], 1234.5);
    assert_eq!(vitals[0]["path"], "/user/*/profile");

    let errors: Vec<Value> = requests_to(&mock_server, "/errors").await[0]
        .body_json()
        .unwrap();
    assert_eq!(errors[0]["message"], "TypeError: x is undefined");
    assert_eq!(errors[0]["lineno"], 10);

    let custom: Vec<Value> = requests_to(&mock_server, "/events").await[0]
        .body_json()
        .unwrap();
    assert_eq!(custom[0]["event_name"], "signup");
}

/// Verifies primary events go straight to `POST /` when batching is off.
#[tokio::test]
async fn test_batching_disabled_sends_directly() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/");
    let tracker = create_tracker(create_options(&mock_server).with_batching(false), &page);

    assert_eq!(tracker.track_page_view(), Dispatch::SentDirect);
    assert_eq!(tracker.track_page_view(), Dispatch::SentDirect);
    sleep(Duration::from_millis(200)).await;

    let singles = requests_to(&mock_server, "/").await;
    assert_eq!(singles.len(), 2);
    let event: Value = singles[0].body_json().unwrap();
    assert_eq!(event["name"], "screen_view");
    assert!(requests_to(&mock_server, "/batch").await.is_empty());
}

/// Verifies a forced send bypasses the queue and reports failures.
#[tokio::test]
async fn test_send_now_is_forced_and_awaited() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&mock_server)
        .await;

    let page = create_page("https://example.com/");
    let tracker = create_tracker(create_options(&mock_server), &page);

    let event = tracker.page_event("purchase", Properties::new());
    assert_eq!(tracker.send_now(event).await.unwrap(), Dispatch::SentDirect);
    assert_eq!(tracker.pending(QueueKind::Primary), 0);

    let event = tracker.page_event("purchase", Properties::new());
    assert!(tracker.send_now(event).await.is_err());
}

/// Verifies a skipped forced send leaves the visitor's identity untouched.
#[tokio::test]
async fn test_track_now_checks_gate_before_building_event() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let local = Arc::new(MemoryStore::new());
    let session = Arc::new(MemoryStore::new());
    let page = Arc::new(
        StaticPage::new(Url::parse("https://example.com/").unwrap())
            .with_local_storage(Some(local.clone()))
            .with_session_storage(Some(session.clone())),
    );
    let tracker = create_tracker(create_options(&mock_server).with_disabled(true), &page);

    let dispatch = tracker.track_now("purchase", Properties::new()).await.unwrap();
    assert_eq!(dispatch, Dispatch::Skipped(SkipReason::Disabled));

    assert_eq!(local.get(ANONYMOUS_ID_KEY).unwrap(), None);
    assert_eq!(session.get(SESSION_ID_KEY).unwrap(), None);
    assert_eq!(request_count(&mock_server).await, 0);
}

/// Verifies `track_now` sends a page event straight to `POST /`.
#[tokio::test]
async fn test_track_now_sends_direct() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/");
    let tracker = create_tracker(create_options(&mock_server), &page);

    let dispatch = tracker.track_now("purchase", Properties::new()).await.unwrap();
    assert_eq!(dispatch, Dispatch::SentDirect);

    let singles = requests_to(&mock_server, "/").await;
    assert_eq!(singles.len(), 1);
    let event: Value = singles[0].body_json().unwrap();
    assert_eq!(event["name"], "purchase");
}

/// Verifies a failing primary batch falls back to individual sends.
#[tokio::test]
async fn test_failed_batch_falls_back_to_individual_sends() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/batch"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/");
    let tracker = create_tracker(
        create_options(&mock_server).with_batch_timeout(Duration::from_secs(60)),
        &page,
    );

    for _ in 0..3 {
        tracker.track_page_view();
    }

    let report = tracker.flush_all().await;
    assert_eq!(
        report.primary,
        FlushOutcome::Failed {
            events: 3,
            fallback_attempted: 3,
            fallback_delivered: 3,
        }
    );
    assert_eq!(requests_to(&mock_server, "/").await.len(), 3);
}

// =============================================================================
// Skipping
// =============================================================================

/// Verifies a zero sampling rate produces no network traffic at all.
#[tokio::test]
async fn test_zero_sampling_rate_sends_nothing() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/");
    let tracker = create_tracker(create_options(&mock_server).with_sampling_rate(0.0), &page);

    for _ in 0..20 {
        tracker.track_page_view();
        tracker.track_vital("FCP", 300.0);
        tracker.track_error("boom", ErrorDetails::default());
        tracker.track_custom("click", Properties::new());
    }
    tracker.flush_all().await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(request_count(&mock_server).await, 0);
}

/// Verifies bots, disabled trackers and server contexts send nothing.
#[tokio::test]
async fn test_skipped_environments_send_nothing() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let bot_page = Arc::new(
        StaticPage::new(Url::parse("https://example.com/").unwrap()).with_automation_markers(
            AutomationMarkers {
                selenium: true,
                ..AutomationMarkers::default()
            },
        ),
    );
    let bot = create_tracker(create_options(&mock_server), &bot_page);
    assert_eq!(bot.track_page_view(), Dispatch::Skipped(SkipReason::Bot));

    let page = create_page("https://example.com/");
    let disabled = create_tracker(create_options(&mock_server).with_disabled(true), &page);
    assert_eq!(
        disabled.track_page_view(),
        Dispatch::Skipped(SkipReason::Disabled)
    );

    let server_side = Tracker::new(create_options(&mock_server), None).unwrap();
    assert_eq!(
        server_side.track_page_view(),
        Dispatch::Skipped(SkipReason::NoBrowsingContext)
    );

    sleep(Duration::from_millis(300)).await;
    assert_eq!(request_count(&mock_server).await, 0);
}

/// Verifies skip patterns follow navigation.
#[tokio::test]
async fn test_skip_pattern_follows_navigation() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/admin/users");
    let tracker = create_tracker(
        create_options(&mock_server).with_skip_patterns(["/admin/*"]),
        &page,
    );

    assert_eq!(
        tracker.track_page_view(),
        Dispatch::Skipped(SkipReason::SkipPattern("/admin/*".to_string()))
    );

    page.navigate("/administration").unwrap();
    assert_eq!(tracker.track_page_view(), Dispatch::Queued(QueueKind::Primary));
}

// =============================================================================
// Teardown
// =============================================================================

/// Verifies unload hands every non-empty queue to the beacon.
#[tokio::test]
async fn test_unload_hands_batches_to_beacon() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let beacon = Arc::new(RecordingBeacon::default());
    let page = Arc::new(
        StaticPage::new(Url::parse("https://example.com/").unwrap()).with_beacon(beacon.clone()),
    );
    let tracker = create_tracker(
        create_options(&mock_server).with_batch_timeout(Duration::from_secs(60)),
        &page,
    );

    tracker.track_page_view();
    tracker.track_page_view();
    tracker.track_error("boom", ErrorDetails::default());

    let report = tracker.flush_on_unload();
    assert_eq!(report.handed_off(), 3);
    assert_eq!(report.declined(), 0);
    assert_eq!(tracker.pending_events(), 0);

    let sent = beacon.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);

    let (url, body) = &sent[0];
    assert_eq!(url, &format!("{}/batch?client_id=site-1", mock_server.uri()));
    let batch: Vec<Value> = serde_json::from_slice(body).unwrap();
    assert_eq!(batch.len(), 2);

    let (url, _) = &sent[1];
    assert!(url.ends_with("/errors?client_id=site-1"));
}

/// Verifies shutdown flushes pending events before returning.
#[tokio::test]
async fn test_shutdown_flushes_pending_events() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/");
    let tracker = create_tracker(
        create_options(&mock_server).with_batch_timeout(Duration::from_secs(60)),
        &page,
    );

    tracker.track_page_view();
    tracker.track_custom("signup", Properties::new());

    let remaining = tracker.shutdown(Duration::from_secs(5)).await;
    assert_eq!(remaining, 0);
    assert_eq!(request_count(&mock_server).await, 2);
}

/// Verifies shutdown waits for a batch in flight and flushes the events
/// that arrived during it.
#[tokio::test]
async fn test_shutdown_waits_for_batch_in_flight() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&mock_server)
        .await;

    let page = create_page("https://example.com/");
    let tracker = create_tracker(
        create_options(&mock_server)
            .with_batch_size(2)
            .with_batch_timeout(Duration::from_secs(60)),
        &page,
    );

    tracker.track_page_view();
    tracker.track_page_view();
    sleep(Duration::from_millis(50)).await;
    tracker.track_page_view();

    let remaining = tracker.shutdown(Duration::from_secs(5)).await;
    assert_eq!(remaining, 0);
    assert_eq!(tracker.pending_events(), 0);

    let batches: Vec<usize> = requests_to(&mock_server, "/batch")
        .await
        .iter()
        .map(|r| r.body_json::<Vec<Value>>().unwrap().len())
        .collect();
    assert_eq!(batches, vec![2, 1]);
}

/// Verifies events in flight when the timeout expires count as undelivered.
#[tokio::test]
async fn test_shutdown_timeout_counts_events_in_flight() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&mock_server)
        .await;

    let page = create_page("https://example.com/");
    let tracker = create_tracker(
        create_options(&mock_server).with_batch_timeout(Duration::from_secs(60)),
        &page,
    );

    tracker.track_page_view();
    tracker.track_custom("signup", Properties::new());

    let remaining = tracker.shutdown(Duration::from_millis(200)).await;
    assert_eq!(remaining, 2);
}

/// Verifies batches the collector rejects during shutdown count as
/// undelivered.
#[tokio::test]
async fn test_shutdown_counts_failed_batches() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let page = create_page("https://example.com/");
    let tracker = create_tracker(
        create_options(&mock_server)
            .with_retries(0, Duration::from_millis(10))
            .with_batch_timeout(Duration::from_secs(60)),
        &page,
    );

    tracker.track_custom("signup", Properties::new());
    tracker.track_vital("LCP", 1200.0);

    let remaining = tracker.shutdown(Duration::from_secs(5)).await;
    assert_eq!(remaining, 2);
    assert_eq!(request_count(&mock_server).await, 2);
}

// =============================================================================
// Identity
// =============================================================================

/// Verifies events across trackers sharing storage keep the same visitor.
#[tokio::test]
async fn test_identity_survives_tracker_restart() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/");

    let first = create_tracker(create_options(&mock_server), &page);
    let anonymous_id = first.anonymous_id();
    let session_id = first.session_id();
    drop(first);

    let second = create_tracker(create_options(&mock_server), &page);
    assert_eq!(second.anonymous_id(), anonymous_id);
    assert_eq!(second.session_id(), session_id);
}

/// Verifies an `anonId` query parameter overrides the stored visitor id.
#[tokio::test]
async fn test_query_string_identity_override() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let page = create_page("https://example.com/?anonId=anon_shared&sessionId=sess_shared");
    let tracker = create_tracker(create_options(&mock_server), &page);

    assert_eq!(tracker.anonymous_id(), "anon_shared");
    assert_eq!(tracker.session_id(), "sess_shared");
}
