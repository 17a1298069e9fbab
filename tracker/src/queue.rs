//! Batching queues.
//!
//! The tracker runs four independent [`EventQueue`]s (primary events,
//! vitals, errors, custom events). Each queue buffers events and hands them
//! to the [`DeliveryClient`] as one ordered batch when either trigger fires:
//!
//! - **Size**: the queue reaches its threshold (configurable for the primary
//!   queue, fixed for the others), which starts a flush immediately.
//! - **Time**: the first event enqueued into an idle queue arms a timer;
//!   when it fires the queue flushes whatever it holds.
//!
//! # Invariants
//!
//! - At most one flush is in flight per queue. The busy check, timer
//!   cancellation and capture of the pending events happen in a single
//!   critical section, so overlapping triggers cannot both capture.
//! - An event leaves the pending sequence exactly when it is captured into a
//!   batch. Pending events and the in-flight batch are always disjoint.
//!
//! # Failure policy
//!
//! The primary queue re-sends every event of a failed batch individually to
//! `POST /`, so one poison event cannot sink the rest. The diagnostic queues
//! (vitals, errors, custom) log and drop a failed batch rather than add load
//! to a collector that is already struggling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::delivery::{DeliveryClient, Endpoint};
use crate::gate::TrackingGate;

/// Size threshold of the vitals queue.
pub const VITALS_BATCH_SIZE: usize = 6;

/// Size threshold of the errors queue.
pub const ERRORS_BATCH_SIZE: usize = 10;

/// Size threshold of the custom events queue.
pub const CUSTOM_EVENTS_BATCH_SIZE: usize = 10;

/// The four queue kinds a tracker owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Primary,
    Vitals,
    Errors,
    Custom,
}

impl QueueKind {
    /// Collector endpoint batches of this kind are posted to.
    #[must_use]
    pub fn endpoint(self) -> Endpoint {
        match self {
            Self::Primary => Endpoint::Batch,
            Self::Vitals => Endpoint::Vitals,
            Self::Errors => Endpoint::Errors,
            Self::Custom => Endpoint::Events,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Primary => "events",
            Self::Vitals => "vitals",
            Self::Errors => "errors",
            Self::Custom => "custom_events",
        }
    }

    /// Size threshold for `kind`; `primary_batch_size` applies to the
    /// primary queue only.
    #[must_use]
    pub fn batch_size(self, primary_batch_size: usize) -> usize {
        match self {
            Self::Primary => primary_batch_size,
            Self::Vitals => VITALS_BATCH_SIZE,
            Self::Errors => ERRORS_BATCH_SIZE,
            Self::Custom => CUSTOM_EVENTS_BATCH_SIZE,
        }
    }
}

/// What happens to the events of a batch the collector did not accept.
#[derive(Clone)]
pub enum Fallback {
    /// Log and drop the batch.
    Drop,
    /// Re-send each event on its own to `POST /`, unless the gate says
    /// tracking should be skipped.
    SendIndividually(Arc<TrackingGate>),
}

/// Result of a [`EventQueue::flush`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was sent: the queue was empty or a flush was already in
    /// flight.
    Skipped,
    /// The batch was accepted by the collector.
    Delivered { events: usize },
    /// The batch failed; `fallback_attempted` events were re-sent
    /// individually and `fallback_delivered` of those were accepted.
    Failed {
        events: usize,
        fallback_attempted: usize,
        fallback_delivered: usize,
    },
}

impl FlushOutcome {
    /// Events of this flush the collector never accepted, either as part of
    /// the batch or individually.
    #[must_use]
    pub fn lost(self) -> usize {
        match self {
            Self::Failed {
                events,
                fallback_delivered,
                ..
            } => events.saturating_sub(fallback_delivered),
            Self::Skipped | Self::Delivered { .. } => 0,
        }
    }
}

/// Armed flush timer, identified so a firing timer can recognise itself.
struct FlushTimer {
    id: u64,
    task: JoinHandle<()>,
}

struct QueueState<E> {
    pending: Vec<E>,
    timer: Option<FlushTimer>,
    busy: bool,
    in_flight: usize,
    timer_seq: u64,
}

struct Shared<E> {
    kind: QueueKind,
    batch_size: usize,
    batch_timeout: Duration,
    client: Arc<DeliveryClient>,
    fallback: Fallback,
    runtime: Handle,
    state: Mutex<QueueState<E>>,
    /// Signalled every time a flush ends.
    idle: Notify,
    /// Events lost to failed flushes since creation.
    lost: AtomicUsize,
}

impl<E> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, QueueState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A batching queue for one event kind.
///
/// Cloning yields another handle to the same queue.
pub struct EventQueue<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for EventQueue<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> EventQueue<E>
where
    E: Serialize + Send + Sync + 'static,
{
    /// Creates an idle queue. Timers and size-triggered flushes are spawned
    /// on `runtime`.
    #[must_use]
    pub fn new(
        kind: QueueKind,
        batch_size: usize,
        batch_timeout: Duration,
        client: Arc<DeliveryClient>,
        fallback: Fallback,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind,
                batch_size: batch_size.max(1),
                batch_timeout,
                client,
                fallback,
                runtime,
                state: Mutex::new(QueueState {
                    pending: Vec::new(),
                    timer: None,
                    busy: false,
                    in_flight: 0,
                    timer_seq: 0,
                }),
                idle: Notify::new(),
                lost: AtomicUsize::new(0),
            }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.shared.kind
    }

    /// Number of events waiting to be captured.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a flush is currently in flight.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.shared.lock().busy
    }

    /// Size of the batch currently in flight, zero when idle.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }

    /// Events lost to failed flushes over the lifetime of the queue.
    #[must_use]
    pub fn lost(&self) -> usize {
        self.shared.lost.load(Ordering::Acquire)
    }

    /// Whether a flush timer is armed.
    #[must_use]
    pub fn has_timer(&self) -> bool {
        self.shared.lock().timer.is_some()
    }

    /// Appends `event`. Never blocks.
    ///
    /// Arms the flush timer if none is armed, and starts a flush right away
    /// when the queue reaches its size threshold.
    pub fn enqueue(&self, event: E) {
        let reached_threshold = {
            let mut state = self.shared.lock();
            state.pending.push(event);
            if state.timer.is_none() {
                arm_timer(&self.shared, &mut state);
            }
            state.pending.len() >= self.shared.batch_size
        };

        if reached_threshold {
            debug!(queue = self.shared.kind.name(), "Batch size reached, flushing");
            self.spawn_flush();
        }
    }

    /// Captures every pending event and sends it as one batch.
    ///
    /// A no-op when the queue is empty or another flush is in flight.
    pub async fn flush(&self) -> FlushOutcome {
        let batch = {
            let mut state = self.shared.lock();
            if state.busy || state.pending.is_empty() {
                return FlushOutcome::Skipped;
            }
            if let Some(timer) = state.timer.take() {
                timer.task.abort();
            }
            state.busy = true;
            state.in_flight = state.pending.len();
            std::mem::take(&mut state.pending)
        };

        let _busy = BusyGuard {
            shared: &self.shared,
        };

        let kind = self.shared.kind;
        let events = batch.len();
        debug!(queue = kind.name(), events, "Flushing batch");

        let outcome = match self.shared.client.send(kind.endpoint(), &batch).await {
            Ok(()) => {
                info!(queue = kind.name(), events, "Batch sent");
                FlushOutcome::Delivered { events }
            }
            Err(e) => match &self.shared.fallback {
                Fallback::Drop => {
                    error!(queue = kind.name(), events, error = %e, "Batch failed, dropping");
                    FlushOutcome::Failed {
                        events,
                        fallback_attempted: 0,
                        fallback_delivered: 0,
                    }
                }
                Fallback::SendIndividually(gate) => {
                    warn!(
                        queue = kind.name(),
                        events,
                        error = %e,
                        "Batch failed, retrying individually"
                    );
                    let (attempted, delivered) =
                        send_individually(&self.shared.client, gate, batch).await;
                    FlushOutcome::Failed {
                        events,
                        fallback_attempted: attempted,
                        fallback_delivered: delivered,
                    }
                }
            },
        };

        // Recorded before the busy guard drops, so a waiter that sees the
        // queue idle also sees the loss.
        self.shared.lost.fetch_add(outcome.lost(), Ordering::AcqRel);
        outcome
    }

    /// Flushes until the queue is idle and empty, waiting out batches in
    /// flight, including ones started by timers or the size trigger.
    ///
    /// Events enqueued while this runs are flushed too, so it only returns
    /// once producers stop.
    pub async fn settle(&self) {
        loop {
            self.flush().await;

            let notified = self.shared.idle.notified();
            {
                let state = self.shared.lock();
                if !state.busy {
                    if state.pending.is_empty() {
                        return;
                    }
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Synchronously takes every pending event and disarms the timer.
    ///
    /// Used on page teardown, where an asynchronous flush cannot be awaited.
    /// An in-flight batch is unaffected.
    pub fn drain(&self) -> Vec<E> {
        let mut state = self.shared.lock();
        if let Some(timer) = state.timer.take() {
            timer.task.abort();
        }
        std::mem::take(&mut state.pending)
    }

    fn spawn_flush(&self) {
        let queue = self.clone();
        self.shared.runtime.spawn(async move {
            queue.flush().await;
        });
    }
}

/// Clears the busy flag when a flush ends, however it ends.
///
/// Events that arrived while the batch was in flight are picked up again:
/// immediately if they already fill a batch, otherwise by a timer.
struct BusyGuard<'a, E>
where
    E: Serialize + Send + Sync + 'static,
{
    shared: &'a Arc<Shared<E>>,
}

impl<E> Drop for BusyGuard<'_, E>
where
    E: Serialize + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let flush_now = {
            let mut state = self.shared.lock();
            state.busy = false;
            state.in_flight = 0;
            if state.pending.len() >= self.shared.batch_size {
                true
            } else {
                if !state.pending.is_empty() && state.timer.is_none() {
                    arm_timer(self.shared, &mut state);
                }
                false
            }
        };

        if flush_now {
            EventQueue {
                shared: Arc::clone(self.shared),
            }
            .spawn_flush();
        }
        self.shared.idle.notify_waiters();
    }
}

fn arm_timer<E>(shared: &Arc<Shared<E>>, state: &mut QueueState<E>)
where
    E: Serialize + Send + Sync + 'static,
{
    state.timer_seq += 1;
    let id = state.timer_seq;
    let weak = Arc::downgrade(shared);
    let timeout = shared.batch_timeout;

    let task = shared.runtime.spawn(async move {
        sleep(timeout).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };

        {
            let mut state = shared.lock();
            match &state.timer {
                // Disarm without aborting: this task is the timer.
                Some(timer) if timer.id == id => state.timer = None,
                _ => return,
            }
        }

        debug!(queue = shared.kind.name(), "Batch timeout reached, flushing");
        EventQueue { shared }.flush().await;
    });

    state.timer = Some(FlushTimer { id, task });
}

/// Sends each event of a failed batch on its own. Returns how many sends
/// were attempted and how many succeeded.
async fn send_individually<E>(
    client: &DeliveryClient,
    gate: &TrackingGate,
    batch: Vec<E>,
) -> (usize, usize)
where
    E: Serialize + Send + Sync,
{
    if let Some(reason) = gate.skip_reason() {
        debug!(%reason, events = batch.len(), "Skipping individual re-send");
        return (0, 0);
    }

    let results = join_all(
        batch
            .iter()
            .map(|event| client.send(Endpoint::Single, event)),
    )
    .await;

    let attempted = results.len();
    let delivered = results
        .iter()
        .filter(|result| match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Individual re-send failed");
                false
            }
        })
        .count();

    (attempted, delivered)
}
