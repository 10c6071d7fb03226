//! Drains the submission queue whenever the device is online.
//!
//! The coordinator is the only consumer of the queue. It delivers one report
//! at a time in insertion order, aborts the in-flight delivery when
//! connectivity drops, and broadcasts every outcome for the UI.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::connectivity::Connectivity;
use crate::delivery::{DeliveryEndpoint, DeliveryReceipt, DeliveryRequest};
use crate::media::MediaStager;
use crate::model::{Clock, DraftStatus, FailureKind, ReportDraft, ReportId, UnixTimeMs};
use crate::queue::{DeliveryFailure, QueueError, SubmissionQueue};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_drafts_per_cycle: usize,
    pub delivery_timeout_ms: u64,
    /// Longest sleep between cycles while online.
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_drafts_per_cycle: 20,
            delivery_timeout_ms: 30_000,
            poll_interval_ms: 60_000,
        }
    }
}

impl SyncConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStop {
    /// No report is eligible right now.
    Idle,
    Offline,
    CycleLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub stopped: DrainStop,
}

impl DrainReport {
    fn new() -> Self {
        Self {
            delivered: 0,
            retried: 0,
            failed: 0,
            stopped: DrainStop::Idle,
        }
    }

    pub fn attempted(&self) -> usize {
        self.delivered + self.retried + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Delivered {
        report_id: ReportId,
        server_id: String,
    },
    RetryScheduled {
        report_id: ReportId,
        attempts: u32,
        next_attempt_at: Option<UnixTimeMs>,
        reason: String,
    },
    Failed {
        report_id: ReportId,
        failure: FailureKind,
        reason: String,
    },
    CycleFinished(DrainReport),
}

/// Returns a dequeued report to the queue if the drain is dropped before
/// its attempt is settled.
struct InFlight {
    queue: Arc<SubmissionQueue>,
    id: Option<ReportId>,
}

impl InFlight {
    fn new(queue: &Arc<SubmissionQueue>, id: &ReportId) -> Self {
        Self {
            queue: Arc::clone(queue),
            id: Some(id.clone()),
        }
    }

    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let queue = Arc::clone(&self.queue);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    queue.release_in_flight(&id).await;
                });
            }
            Err(_) => warn!(report_id = %id, "drain dropped outside a runtime, report left in flight"),
        }
    }
}

pub struct SyncCoordinator {
    queue: Arc<SubmissionQueue>,
    endpoint: Arc<dyn DeliveryEndpoint>,
    stager: Option<Arc<MediaStager>>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<SubmissionQueue>,
        endpoint: Arc<dyn DeliveryEndpoint>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue,
            endpoint,
            stager: None,
            clock,
            config,
            events,
        }
    }

    /// Release staged media of delivered reports through `stager`.
    #[must_use]
    pub fn with_stager(mut self, stager: Arc<MediaStager>) -> Self {
        self.stager = Some(stager);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Deliver eligible reports until none is left, connectivity drops or
    /// the per-cycle limit is hit.
    #[instrument(skip_all)]
    pub async fn drain_cycle(
        &self,
        connectivity: &mut watch::Receiver<Connectivity>,
    ) -> Result<DrainReport, QueueError> {
        let mut report = DrainReport::new();

        loop {
            if report.attempted() >= self.config.max_drafts_per_cycle {
                report.stopped = DrainStop::CycleLimit;
                break;
            }
            if !connectivity.borrow().is_online() {
                report.stopped = DrainStop::Offline;
                break;
            }

            let Some(draft) = self.queue.dequeue_next(self.clock.now()).await? else {
                report.stopped = DrainStop::Idle;
                break;
            };

            let in_flight = InFlight::new(&self.queue, &draft.id);
            let outcome = self.attempt(&draft, connectivity).await;
            let settled = self.settle(&draft, outcome, &mut report).await;
            in_flight.disarm();

            match settled {
                Ok(false) => {}
                Ok(true) => {
                    report.stopped = DrainStop::Offline;
                    break;
                }
                Err(e) => {
                    self.queue.release_in_flight(&draft.id).await;
                    return Err(e);
                }
            }
        }

        debug!(?report, "drain cycle finished");
        self.emit(SyncEvent::CycleFinished(report));
        Ok(report)
    }

    /// Ack or nack one attempt. Returns `true` when connectivity was lost
    /// and the cycle should stop.
    async fn settle(
        &self,
        draft: &ReportDraft,
        outcome: Result<DeliveryReceipt, DeliveryFailure>,
        report: &mut DrainReport,
    ) -> Result<bool, QueueError> {
        match outcome {
            Ok(receipt) => {
                let delivered = self.queue.ack(&draft.id, &receipt, self.clock.now()).await?;
                if let Some(stager) = &self.stager {
                    stager.release_refs(&delivered.media).await;
                }
                report.delivered += 1;
                self.emit(SyncEvent::Delivered {
                    report_id: delivered.id,
                    server_id: receipt.server_id,
                });
                Ok(false)
            }
            Err(failure) => {
                let lost = failure == DeliveryFailure::ConnectivityLost;
                let reason = failure.message();
                let updated = self.queue.nack(&draft.id, failure, self.clock.now()).await?;
                self.record_failure(report, updated, reason);
                Ok(lost)
            }
        }
    }

    fn record_failure(&self, report: &mut DrainReport, draft: ReportDraft, reason: String) {
        match (draft.status, draft.failure) {
            (DraftStatus::Failed, Some(failure)) => {
                report.failed += 1;
                self.emit(SyncEvent::Failed {
                    report_id: draft.id,
                    failure,
                    reason,
                });
            }
            _ => {
                report.retried += 1;
                self.emit(SyncEvent::RetryScheduled {
                    report_id: draft.id,
                    attempts: draft.attempts,
                    next_attempt_at: draft.next_attempt_at,
                    reason,
                });
            }
        }
    }

    async fn attempt(
        &self,
        draft: &ReportDraft,
        connectivity: &mut watch::Receiver<Connectivity>,
    ) -> Result<DeliveryReceipt, DeliveryFailure> {
        let request = DeliveryRequest::from_draft(draft).await?;
        let timeout = self.config.delivery_timeout();

        tokio::select! {
            biased;

            result = tokio::time::timeout(timeout, self.endpoint.deliver(&request)) => match result {
                Ok(Ok(receipt)) => Ok(receipt),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(DeliveryFailure::Transient(format!(
                    "delivery timed out after {}ms",
                    timeout.as_millis()
                ))),
            },
            _ = wait_offline(connectivity) => {
                warn!(report_id = %draft.id, "connectivity lost, aborting delivery");
                Err(DeliveryFailure::ConnectivityLost)
            }
        }
    }

    /// Run until shut down: drain on every transition to online, then sleep
    /// until the next backoff expiry, a new report, a connectivity change or
    /// the poll interval.
    pub fn spawn(self: Arc<Self>, connectivity: watch::Receiver<Connectivity>) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(connectivity, shutdown_rx));
        SyncHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut connectivity: watch::Receiver<Connectivity>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("sync coordinator started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let online = connectivity.borrow_and_update().is_online();
            let mut wait = self.config.poll_interval();

            if online {
                match self.drain_cycle(&mut connectivity).await {
                    Ok(report) if report.stopped == DrainStop::CycleLimit => {
                        wait = Duration::ZERO;
                    }
                    Ok(_) => {
                        if let Some(at) = self.queue.next_eligible_at().await {
                            let until = self.clock.now().until(at);
                            wait = wait.min(Duration::from_millis(until));
                        }
                    }
                    Err(e) => error!("drain cycle failed: {}", e),
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(wait), if online => {}
            }
        }

        info!("sync coordinator stopped");
    }
}

async fn wait_offline(connectivity: &mut watch::Receiver<Connectivity>) {
    let closed = connectivity.wait_for(|c| !c.is_online()).await.is_err();
    if closed {
        // Monitor gone: nothing will ever report offline.
        std::future::pending::<()>().await;
    }
}

/// Handle to a running coordinator task.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stop after the current delivery settles.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("sync coordinator panicked: {}", e);
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
