//! Integration tests for batching queue behaviour.
//!
//! These tests run queues against a mock collector and check the size and
//! time triggers, the single-flight guarantee, and the per-kind failure
//! policy.

use std::sync::Arc;
use std::time::Duration;

use databuddy_tracker::delivery::{DeliveryClient, DeliveryConfig, RetryPolicy};
use databuddy_tracker::gate::TrackingGate;
use databuddy_tracker::host::{BrowsingContext, StaticPage};
use databuddy_tracker::queue::{EventQueue, Fallback, FlushOutcome, QueueKind};
use reqwest::Url;
use tokio::runtime::Handle;
use tokio::time::sleep;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

fn create_client(server_url: &str) -> Arc<DeliveryClient> {
    let config =
        DeliveryConfig::new(server_url, "site-1").with_retry_policy(RetryPolicy::disabled());
    Arc::new(DeliveryClient::new(config, None).unwrap())
}

fn create_queue(
    server: &MockServer,
    kind: QueueKind,
    batch_size: usize,
    batch_timeout: Duration,
    fallback: Fallback,
) -> EventQueue<u32> {
    EventQueue::new(
        kind,
        batch_size,
        batch_timeout,
        create_client(&server.uri()),
        fallback,
        Handle::current(),
    )
}

fn open_gate(page: &Arc<StaticPage>) -> Arc<TrackingGate> {
    let host: Arc<dyn BrowsingContext> = page.clone();
    Arc::new(TrackingGate::new(
        Some(host),
        false,
        false,
        vec!["/admin/*".to_string()],
    ))
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

fn body(request: &Request) -> Vec<u32> {
    request.body_json().unwrap()
}

async fn mount_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

// =============================================================================
// Triggers
// =============================================================================

/// Verifies the timer flushes everything enqueued, once and in order.
#[tokio::test]
async fn test_timed_flush_sends_one_ordered_batch() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let queue = create_queue(
        &mock_server,
        QueueKind::Errors,
        10,
        Duration::from_millis(100),
        Fallback::Drop,
    );

    for n in 0..3 {
        queue.enqueue(n);
    }
    assert!(queue.has_timer());

    sleep(Duration::from_millis(400)).await;

    let requests = requests_to(&mock_server, "/errors").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(body(&requests[0]), vec![0, 1, 2]);
    assert!(queue.is_empty());
    assert!(!queue.has_timer());
}

/// Verifies reaching the threshold flushes immediately and the earlier timer
/// does not produce a second request.
#[tokio::test]
async fn test_size_trigger_flushes_and_timer_is_noop() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let queue = create_queue(
        &mock_server,
        QueueKind::Primary,
        3,
        Duration::from_millis(200),
        Fallback::Drop,
    );

    for n in 0..3 {
        queue.enqueue(n);
    }

    sleep(Duration::from_millis(100)).await;
    let requests = requests_to(&mock_server, "/batch").await;
    assert_eq!(requests.len(), 1, "size trigger should flush before the timer");
    assert_eq!(body(&requests[0]), vec![0, 1, 2]);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(requests_to(&mock_server, "/batch").await.len(), 1);
}

/// Verifies the fixed vitals threshold of six.
#[tokio::test]
async fn test_vitals_threshold_is_six() {
    let mock_server = MockServer::start().await;
    mount_ok(&mock_server).await;

    let queue = create_queue(
        &mock_server,
        QueueKind::Vitals,
        QueueKind::Vitals.batch_size(10),
        Duration::from_secs(60),
        Fallback::Drop,
    );

    for n in 0..5 {
        queue.enqueue(n);
    }
    sleep(Duration::from_millis(100)).await;
    assert!(requests_to(&mock_server, "/vitals").await.is_empty());

    queue.enqueue(5);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(requests_to(&mock_server, "/vitals").await.len(), 1);
}

// =============================================================================
// Single Flight
// =============================================================================

/// Verifies a flush in flight and events enqueued meanwhile stay disjoint,
/// and the late events are picked up after the flight ends.
#[tokio::test]
async fn test_in_flight_snapshot_and_live_queue_are_disjoint() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&mock_server)
        .await;

    let queue = create_queue(
        &mock_server,
        QueueKind::Custom,
        10,
        Duration::from_millis(100),
        Fallback::Drop,
    );

    for n in 0..3 {
        queue.enqueue(n);
    }

    let in_flight = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.flush().await })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(queue.is_flushing());

    queue.enqueue(3);
    queue.enqueue(4);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.flush().await, FlushOutcome::Skipped);

    assert_eq!(
        in_flight.await.unwrap(),
        FlushOutcome::Delivered { events: 3 }
    );

    sleep(Duration::from_millis(600)).await;

    let batches: Vec<Vec<u32>> = requests_to(&mock_server, "/events")
        .await
        .iter()
        .map(body)
        .collect();
    assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4]]);
    assert!(queue.is_empty());
}

/// Verifies events that fill a batch during a flight are flushed right after.
#[tokio::test]
async fn test_full_batch_accumulated_in_flight_flushes_immediately() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(150)))
        .mount(&mock_server)
        .await;

    let queue = create_queue(
        &mock_server,
        QueueKind::Primary,
        2,
        Duration::from_secs(60),
        Fallback::Drop,
    );

    queue.enqueue(0);
    queue.enqueue(1);
    sleep(Duration::from_millis(50)).await;
    assert!(queue.is_flushing());

    queue.enqueue(2);
    queue.enqueue(3);

    sleep(Duration::from_millis(500)).await;

    let batches: Vec<Vec<u32>> = requests_to(&mock_server, "/batch")
        .await
        .iter()
        .map(body)
        .collect();
    assert_eq!(batches, vec![vec![0, 1], vec![2, 3]]);
}

/// Verifies `settle` waits out a flush started elsewhere, then sends what
/// arrived meanwhile.
#[tokio::test]
async fn test_settle_waits_for_flight_and_drains_backlog() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&mock_server)
        .await;

    let queue = create_queue(
        &mock_server,
        QueueKind::Primary,
        2,
        Duration::from_secs(60),
        Fallback::Drop,
    );

    queue.enqueue(0);
    queue.enqueue(1);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.in_flight(), 2);

    queue.enqueue(2);
    queue.settle().await;

    assert!(queue.is_empty());
    assert!(!queue.is_flushing());
    assert_eq!(queue.in_flight(), 0);

    let batches: Vec<Vec<u32>> = requests_to(&mock_server, "/batch")
        .await
        .iter()
        .map(body)
        .collect();
    assert_eq!(batches, vec![vec![0, 1], vec![2]]);
}

// =============================================================================
// Failure Policy
// =============================================================================

/// Verifies a failed primary batch of N is re-sent as N individual requests.
#[tokio::test]
async fn test_failed_primary_batch_is_sent_individually() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/batch"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let page = Arc::new(StaticPage::new(Url::parse("https://example.com/").unwrap()));
    let queue = create_queue(
        &mock_server,
        QueueKind::Primary,
        10,
        Duration::from_secs(60),
        Fallback::SendIndividually(open_gate(&page)),
    );

    for n in 0..4 {
        queue.enqueue(n);
    }

    let outcome = queue.flush().await;
    assert_eq!(
        outcome,
        FlushOutcome::Failed {
            events: 4,
            fallback_attempted: 4,
            fallback_delivered: 4,
        }
    );

    let mut singles: Vec<u32> = requests_to(&mock_server, "/")
        .await
        .iter()
        .map(|r| r.body_json::<u32>().unwrap())
        .collect();
    singles.sort_unstable();
    assert_eq!(singles, vec![0, 1, 2, 3]);
    assert!(queue.is_empty());
}

/// Verifies the individual re-send re-checks the skip gate.
#[tokio::test]
async fn test_fallback_respects_skip_pattern_at_send_time() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/batch"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;
    mount_ok(&mock_server).await;

    let page = Arc::new(StaticPage::new(Url::parse("https://example.com/").unwrap()));
    let queue = create_queue(
        &mock_server,
        QueueKind::Primary,
        10,
        Duration::from_secs(60),
        Fallback::SendIndividually(open_gate(&page)),
    );

    queue.enqueue(1);
    queue.enqueue(2);
    page.navigate("/admin/settings").unwrap();

    let outcome = queue.flush().await;
    assert_eq!(
        outcome,
        FlushOutcome::Failed {
            events: 2,
            fallback_attempted: 0,
            fallback_delivered: 0,
        }
    );
    assert!(requests_to(&mock_server, "/").await.is_empty());
}

/// Verifies a failed diagnostic batch is dropped without any retry.
#[tokio::test]
async fn test_failed_diagnostic_batch_is_dropped() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    for (kind, endpoint) in [
        (QueueKind::Vitals, "/vitals"),
        (QueueKind::Errors, "/errors"),
        (QueueKind::Custom, "/events"),
    ] {
        let queue = create_queue(&mock_server, kind, 10, Duration::from_secs(60), Fallback::Drop);
        queue.enqueue(1);
        queue.enqueue(2);

        let outcome = queue.flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Failed {
                events: 2,
                fallback_attempted: 0,
                fallback_delivered: 0,
            }
        );
        assert_eq!(requests_to(&mock_server, endpoint).await.len(), 1);
        assert!(queue.is_empty());
        assert!(!queue.is_flushing());
    }

    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        mock_server.received_requests().await.unwrap_or_default().len(),
        3
    );
}
