use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, instrument, warn};

use crate::delivery::DeliveryReceipt;
use crate::model::{DraftStatus, FailureKind, HazardType, MediaRef, ReportDraft, ReportId, UnixTimeMs};
use crate::storage::{DraftStorage, StoreError, StoredDraft};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("report not found: {0}")]
    NotFound(String),

    #[error("queue full (max {0} reports)")]
    Full(usize),

    #[error("report {0} is being delivered")]
    InFlight(String),

    #[error("report {0} was already delivered")]
    AlreadyDelivered(String),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: DraftStatus,
        to: DraftStatus,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Why a delivery attempt did not produce a receipt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Network error, timeout or server-side error. Retried with backoff.
    Transient(String),
    /// The endpoint refused the report. Never retried automatically.
    Rejected(String),
    /// Connectivity dropped mid-delivery. Retried without spending budget.
    ConnectivityLost,
}

impl DeliveryFailure {
    pub fn message(&self) -> String {
        match self {
            DeliveryFailure::Transient(reason) => reason.clone(),
            DeliveryFailure::Rejected(reason) => format!("rejected: {reason}"),
            DeliveryFailure::ConnectivityLost => "connectivity lost during delivery".into(),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_entries: usize,
    /// Transient failures tolerated before a report is marked failed.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound of random delay added to each backoff. Zero disables it.
    pub jitter_ms: u64,
    /// Delivered ids remembered in memory to refuse re-enqueue.
    pub delivered_cache_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_attempts: 10,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            jitter_ms: 0,
            delivered_cache_size: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_entries == 0 {
            return Err(QueueError::InvalidConfig("max_entries must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidConfig("max_attempts must be > 0".into()));
        }
        if self.base_backoff_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "base_backoff_ms must be > 0".into(),
            ));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(QueueError::InvalidConfig(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if self.delivered_cache_size == 0 {
            return Err(QueueError::InvalidConfig(
                "delivered_cache_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Delay after a transient failure, given the budget spent before it.
    pub fn backoff_ms(&self, budget_used_before: u32) -> u64 {
        let factor = 2u64.saturating_pow(budget_used_before.min(63));
        self.base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms)
    }
}

// ============================================================================
// Metrics and aggregates
// ============================================================================

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub enqueued: AtomicU64,
    pub updated: AtomicU64,
    pub duplicate_rejections: AtomicU64,
    pub dequeued: AtomicU64,
    pub delivered: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub failed: AtomicU64,
    pub removed: AtomicU64,
    pub manual_retries: AtomicU64,
    pub recovered_in_flight: AtomicU64,
    pub released_in_flight: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            duplicate_rejections: self.duplicate_rejections.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            manual_retries: self.manual_retries.load(Ordering::Relaxed),
            recovered_in_flight: self.recovered_in_flight.load(Ordering::Relaxed),
            released_in_flight: self.released_in_flight.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub updated: u64,
    pub duplicate_rejections: u64,
    pub dequeued: u64,
    pub delivered: u64,
    pub retries_scheduled: u64,
    pub failed: u64,
    pub removed: u64,
    pub manual_retries: u64,
    pub recovered_in_flight: u64,
    pub released_in_flight: u64,
    pub storage_errors: u64,
}

/// Pre-aggregated figures for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub sending: usize,
    pub failed: usize,
    pub by_hazard: BTreeMap<HazardType, usize>,
    pub without_location: usize,
    pub media_files: usize,
    pub oldest_pending_at: Option<UnixTimeMs>,
    pub recently_delivered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantinedRow {
    pub id: String,
    pub reason: String,
    pub detected_at: UnixTimeMs,
}

// ============================================================================
// Queue
// ============================================================================

/// Result of `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub draft: ReportDraft,
    /// Attachments an update dropped. The caller owns their files now.
    pub superseded_media: Vec<MediaRef>,
}

struct QueueState {
    entries: HashMap<String, StoredDraft>,
    next_seq: u64,
    delivered: lru::LruCache<String, UnixTimeMs>,
    quarantined: HashMap<String, QuarantinedRow>,
}

impl QueueState {
    fn new(delivered_cache_size: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(delivered_cache_size)
            .unwrap_or(std::num::NonZeroUsize::MIN);

        Self {
            entries: HashMap::new(),
            next_seq: 1,
            delivered: lru::LruCache::new(capacity),
            quarantined: HashMap::new(),
        }
    }

    fn sending(&self, id: &ReportId, to: DraftStatus) -> Result<&StoredDraft, QueueError> {
        let entry = self
            .entries
            .get(id.as_str())
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if entry.draft.status != DraftStatus::Sending {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: entry.draft.status,
                to,
            });
        }
        Ok(entry)
    }
}

/// Durable FIFO-with-retry queue of submitted reports, keyed by report id.
///
/// Every mutation runs under one async mutex: memory is updated first and
/// rolled back if the storage write fails, so memory never runs ahead of disk.
pub struct SubmissionQueue<S: DraftStorage + ?Sized = dyn DraftStorage> {
    storage: Arc<S>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    metrics: QueueMetrics,
    wakeup: Notify,
}

impl<S: DraftStorage + ?Sized> SubmissionQueue<S> {
    /// Load the persisted queue. Reports left `Sending` by a crash go back
    /// to `Queued` with their attempt count untouched.
    #[instrument(skip(storage, config))]
    pub async fn open(storage: Arc<S>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let loaded = storage.load_all().await?;
        let mut state = QueueState::new(config.delivered_cache_size);
        let metrics = QueueMetrics::default();
        let now = UnixTimeMs::now();

        for id in storage
            .load_delivered(config.delivered_cache_size)
            .await?
            .into_iter()
            .rev()
        {
            state.delivered.put(id.as_str().to_string(), now);
        }

        for result in loaded {
            match result {
                Ok(mut record) => {
                    state.next_seq = state.next_seq.max(record.seq.saturating_add(1));

                    match record.draft.status {
                        DraftStatus::Sending => {
                            warn!(report_id = %record.draft.id, "recovering in-flight report");
                            record.draft.status = DraftStatus::Queued;
                            storage.save(&record).await?;
                            QueueMetrics::bump(&metrics.recovered_in_flight);
                        }
                        DraftStatus::Delivered => {
                            storage.mark_delivered(&record.draft.id, now).await?;
                            state.delivered.put(record.draft.id.as_str().to_string(), now);
                            continue;
                        }
                        DraftStatus::Draft => {
                            record.draft.status = DraftStatus::Queued;
                            storage.save(&record).await?;
                        }
                        DraftStatus::Queued | DraftStatus::Failed => {}
                    }

                    state
                        .entries
                        .insert(record.draft.id.as_str().to_string(), record);
                }
                Err(e) => match e.row_id() {
                    Some(id) => {
                        warn!(row = id, "quarantining undecodable report: {}", e);
                        state.quarantined.insert(
                            id.to_string(),
                            QuarantinedRow {
                                id: id.to_string(),
                                reason: e.to_string(),
                                detected_at: now,
                            },
                        );
                    }
                    None => warn!("skipping unreadable row: {}", e),
                },
            }
        }

        info!(
            "Submission queue opened with {} reports, {} quarantined",
            state.entries.len(),
            state.quarantined.len()
        );

        Ok(Self {
            storage,
            config,
            state: Mutex::new(state),
            metrics,
            wakeup: Notify::new(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a report, or update the content of one already queued under the
    /// same id. An update keeps the insertion position, the attempt count and
    /// a `Failed` status.
    #[instrument(skip(self, draft, now), fields(report_id = %draft.id))]
    pub async fn enqueue(&self, draft: ReportDraft, now: UnixTimeMs) -> Result<Enqueued, QueueError> {
        let key = draft.id.as_str().to_string();
        let mut state = self.state.lock().await;

        if state.delivered.contains(&key) {
            QueueMetrics::bump(&self.metrics.duplicate_rejections);
            return Err(QueueError::AlreadyDelivered(key));
        }

        let previous = state.entries.get(&key).cloned();
        let mut superseded = Vec::new();
        let record = match &previous {
            Some(existing) => {
                if existing.draft.status == DraftStatus::Sending {
                    return Err(QueueError::InFlight(key));
                }
                let mut updated = existing.clone();
                updated.draft.reporter_name = draft.reporter_name;
                updated.draft.reporter_email = draft.reporter_email;
                updated.draft.description = draft.description;
                updated.draft.hazard_type = draft.hazard_type;
                updated.draft.location = draft.location;
                superseded = existing
                    .draft
                    .media
                    .iter()
                    .filter(|old| !draft.media.iter().any(|m| m.handle == old.handle))
                    .cloned()
                    .collect();
                updated.draft.media = draft.media;
                updated
            }
            None => {
                if state.entries.len() >= self.config.max_entries {
                    return Err(QueueError::Full(self.config.max_entries));
                }
                let mut fresh = draft;
                fresh.status = DraftStatus::Queued;
                fresh.next_attempt_at = None;
                fresh.retry_budget_used = 0;
                fresh.failure = None;
                fresh.last_error = None;
                if fresh.created_at == UnixTimeMs::default() {
                    fresh.created_at = now;
                }
                let seq = state.next_seq;
                state.next_seq += 1;
                StoredDraft { seq, draft: fresh }
            }
        };

        state.entries.insert(key.clone(), record.clone());

        if let Err(e) = self.storage.save(&record).await {
            match previous.clone() {
                Some(prev) => state.entries.insert(key, prev),
                None => state.entries.remove(&key),
            };
            QueueMetrics::bump(&self.metrics.storage_errors);
            error!("Failed to persist report: {}", e);
            return Err(e.into());
        }
        drop(state);

        if previous.is_some() {
            QueueMetrics::bump(&self.metrics.updated);
            info!(superseded_media = superseded.len(), "Queued report updated");
        } else {
            QueueMetrics::bump(&self.metrics.enqueued);
            info!(
                location = ?record.draft.location_quality(),
                media = record.draft.media.len(),
                "Report queued"
            );
        }
        self.wakeup.notify_one();

        Ok(Enqueued {
            draft: record.draft,
            superseded_media: superseded,
        })
    }

    /// Take the oldest eligible report and mark it `Sending`. Reports still
    /// in backoff are skipped, not waited on.
    #[instrument(skip(self))]
    pub async fn dequeue_next(&self, now: UnixTimeMs) -> Result<Option<ReportDraft>, QueueError> {
        let mut state = self.state.lock().await;

        let Some(key) = state
            .entries
            .values()
            .filter(|r| r.draft.is_eligible(now))
            .min_by_key(|r| r.seq)
            .map(|r| r.draft.id.as_str().to_string())
        else {
            return Ok(None);
        };

        let Some(previous) = state.entries.get(&key).cloned() else {
            return Ok(None);
        };
        let mut updated = previous.clone();
        updated.draft.status = DraftStatus::Sending;

        self.persist(&mut state, previous, updated.clone()).await?;
        QueueMetrics::bump(&self.metrics.dequeued);

        Ok(Some(updated.draft))
    }

    /// Confirm delivery. The report leaves the queue and its id is
    /// remembered so it can never be queued again.
    #[instrument(skip(self, receipt, now), fields(report_id = %id))]
    pub async fn ack(
        &self,
        id: &ReportId,
        receipt: &DeliveryReceipt,
        now: UnixTimeMs,
    ) -> Result<ReportDraft, QueueError> {
        let mut state = self.state.lock().await;
        state.sending(id, DraftStatus::Delivered)?;

        let Some(record) = state.entries.remove(id.as_str()) else {
            return Err(QueueError::NotFound(id.to_string()));
        };

        if let Err(e) = self.storage.mark_delivered(id, now).await {
            state.entries.insert(id.as_str().to_string(), record);
            QueueMetrics::bump(&self.metrics.storage_errors);
            error!("Failed to persist delivery: {}", e);
            return Err(e.into());
        }
        state.delivered.put(id.as_str().to_string(), now);
        drop(state);

        QueueMetrics::bump(&self.metrics.delivered);
        info!(server_id = %receipt.server_id, "Report delivered");

        let mut draft = record.draft;
        draft.status = DraftStatus::Delivered;
        draft.next_attempt_at = None;
        Ok(draft)
    }

    /// Record a failed attempt and decide what happens next.
    #[instrument(skip(self, failure, now), fields(report_id = %id))]
    pub async fn nack(
        &self,
        id: &ReportId,
        failure: DeliveryFailure,
        now: UnixTimeMs,
    ) -> Result<ReportDraft, QueueError> {
        let mut state = self.state.lock().await;
        let previous = state.sending(id, DraftStatus::Queued)?.clone();

        let mut updated = previous.clone();
        let draft = &mut updated.draft;
        draft.attempts = draft.attempts.saturating_add(1);
        draft.record_error(failure.message());

        match &failure {
            DeliveryFailure::Transient(_) => {
                let budget_before = draft.retry_budget_used;
                draft.retry_budget_used = budget_before.saturating_add(1);
                if draft.retry_budget_used >= self.config.max_attempts {
                    draft.status = DraftStatus::Failed;
                    draft.failure = Some(FailureKind::RetriesExhausted);
                    draft.next_attempt_at = None;
                } else {
                    draft.status = DraftStatus::Queued;
                    let delay = self.config.backoff_ms(budget_before) + self.jitter();
                    draft.next_attempt_at = Some(now.saturating_add(delay));
                }
            }
            DeliveryFailure::Rejected(_) => {
                draft.status = DraftStatus::Failed;
                draft.failure = Some(FailureKind::Rejected);
                draft.next_attempt_at = None;
            }
            DeliveryFailure::ConnectivityLost => {
                draft.status = DraftStatus::Queued;
                draft.next_attempt_at = Some(now.saturating_add(self.config.base_backoff_ms));
            }
        }

        self.persist(&mut state, previous, updated.clone()).await?;
        drop(state);

        let draft = updated.draft;
        if draft.status == DraftStatus::Failed {
            QueueMetrics::bump(&self.metrics.failed);
            warn!(
                attempts = draft.attempts,
                failure = ?draft.failure,
                "Report failed permanently"
            );
        } else {
            QueueMetrics::bump(&self.metrics.retries_scheduled);
            info!(
                attempts = draft.attempts,
                next_attempt_at = ?draft.next_attempt_at,
                "Retry scheduled"
            );
        }

        Ok(draft)
    }

    /// Put a report whose delivery was never settled back to `Queued`.
    ///
    /// Memory changes even if storage refuses the write: a persisted
    /// `Sending` row is recovered on the next open anyway. Waiters are not
    /// woken, so a broken store is retried at the poll interval.
    #[instrument(skip(self), fields(report_id = %id))]
    pub async fn release_in_flight(&self, id: &ReportId) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(id.as_str()) else {
            return false;
        };
        if entry.draft.status != DraftStatus::Sending {
            return false;
        }
        entry.draft.status = DraftStatus::Queued;
        let record = entry.clone();

        if let Err(e) = self.storage.save(&record).await {
            QueueMetrics::bump(&self.metrics.storage_errors);
            warn!("In-flight report released in memory only: {}", e);
        }
        drop(state);

        QueueMetrics::bump(&self.metrics.released_in_flight);
        warn!("In-flight report returned to the queue");
        true
    }

    /// Cancel a report that is not currently being delivered.
    #[instrument(skip(self), fields(report_id = %id))]
    pub async fn remove(&self, id: &ReportId) -> Result<ReportDraft, QueueError> {
        let mut state = self.state.lock().await;

        let status = state
            .entries
            .get(id.as_str())
            .map(|r| r.draft.status)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if status == DraftStatus::Sending {
            return Err(QueueError::InFlight(id.to_string()));
        }

        let Some(record) = state.entries.remove(id.as_str()) else {
            return Err(QueueError::NotFound(id.to_string()));
        };
        if let Err(e) = self.storage.remove(id).await {
            state.entries.insert(id.as_str().to_string(), record);
            QueueMetrics::bump(&self.metrics.storage_errors);
            error!("Failed to remove report: {}", e);
            return Err(e.into());
        }
        drop(state);

        QueueMetrics::bump(&self.metrics.removed);
        info!("Report removed");
        Ok(record.draft)
    }

    /// Manually requeue a failed report with a fresh retry budget.
    #[instrument(skip(self, now), fields(report_id = %id))]
    pub async fn retry(&self, id: &ReportId, now: UnixTimeMs) -> Result<ReportDraft, QueueError> {
        let mut state = self.state.lock().await;

        let previous = state
            .entries
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if previous.draft.status != DraftStatus::Failed {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: previous.draft.status,
                to: DraftStatus::Queued,
            });
        }

        let mut updated = previous.clone();
        updated.draft.status = DraftStatus::Queued;
        updated.draft.retry_budget_used = 0;
        updated.draft.failure = None;
        updated.draft.next_attempt_at = Some(now);

        self.persist(&mut state, previous, updated.clone()).await?;
        drop(state);

        QueueMetrics::bump(&self.metrics.manual_retries);
        info!("Manual retry requested");
        self.wakeup.notify_one();

        Ok(updated.draft)
    }

    pub async fn get(&self, id: &ReportId) -> Option<ReportDraft> {
        let state = self.state.lock().await;
        state.entries.get(id.as_str()).map(|r| r.draft.clone())
    }

    /// Insertion-ordered snapshot of every report not yet delivered.
    pub async fn list_pending(&self) -> Vec<ReportDraft> {
        let state = self.state.lock().await;
        let mut records: Vec<&StoredDraft> = state.entries.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.draft.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Earliest time a queued report becomes eligible, if any is queued.
    pub async fn next_eligible_at(&self) -> Option<UnixTimeMs> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|r| r.draft.status == DraftStatus::Queued)
            .map(|r| r.draft.next_attempt_at.unwrap_or_default())
            .min()
    }

    pub async fn is_delivered(&self, id: &ReportId) -> bool {
        self.state.lock().await.delivered.contains(id.as_str())
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            total: state.entries.len(),
            recently_delivered: state.delivered.len(),
            ..QueueStats::default()
        };

        for record in state.entries.values() {
            let draft = &record.draft;
            match draft.status {
                DraftStatus::Queued => stats.queued += 1,
                DraftStatus::Sending => stats.sending += 1,
                DraftStatus::Failed => stats.failed += 1,
                DraftStatus::Draft | DraftStatus::Delivered => {}
            }
            *stats.by_hazard.entry(draft.hazard_type).or_insert(0) += 1;
            if draft.location.is_none() {
                stats.without_location += 1;
            }
            stats.media_files += draft.media.len();
            stats.oldest_pending_at = Some(match stats.oldest_pending_at {
                Some(oldest) => oldest.min(draft.created_at),
                None => draft.created_at,
            });
        }

        stats
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedRow> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state.quarantined.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Resolves after the next enqueue or manual retry.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.wakeup.notified()
    }

    async fn persist(
        &self,
        state: &mut QueueState,
        previous: StoredDraft,
        updated: StoredDraft,
    ) -> Result<(), QueueError> {
        let key = updated.draft.id.as_str().to_string();
        state.entries.insert(key.clone(), updated.clone());

        if let Err(e) = self.storage.save(&updated).await {
            state.entries.insert(key, previous);
            QueueMetrics::bump(&self.metrics.storage_errors);
            error!("Failed to persist report state: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    fn jitter(&self) -> u64 {
        if self.config.jitter_ms == 0 {
            return 0;
        }
        use rand::Rng;
        rand::thread_rng().gen_range(0..=self.config.jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coordinate, GeoTag, LocationSource, ReportForm};
    use crate::storage::MemoryDraftStorage;
    use crate::validator;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;

    const T0: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

    fn draft(id: &str) -> ReportDraft {
        let form = ReportForm {
            name: "Jane Smith".into(),
            email: "jane@phone.com".into(),
            description: "Flooding near the pier".into(),
            hazard_type: Some("Flood".into()),
        };
        let mut draft = validator::validate_with_id(&form, ReportId::new(id).unwrap(), T0).unwrap();
        draft.location = Some(GeoTag {
            coordinate: Coordinate::new(19.076, 72.8777).unwrap(),
            source: LocationSource::Manual,
        });
        draft
    }

    fn id(raw: &str) -> ReportId {
        ReportId::new(raw).unwrap()
    }

    fn receipt() -> DeliveryReceipt {
        DeliveryReceipt {
            server_id: "srv-1".into(),
            received_at: T0,
        }
    }

    async fn open_memory() -> (Arc<MemoryDraftStorage>, SubmissionQueue<MemoryDraftStorage>) {
        let storage = Arc::new(MemoryDraftStorage::new());
        let queue = SubmissionQueue::open(storage.clone(), QueueConfig::default())
            .await
            .unwrap();
        (storage, queue)
    }

    struct FailableStorage {
        inner: MemoryDraftStorage,
        fail_writes: AtomicBool,
    }

    impl FailableStorage {
        fn new() -> Self {
            Self {
                inner: MemoryDraftStorage::new(),
                fail_writes: AtomicBool::new(false),
            }
        }

        fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Database("Injected failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl DraftStorage for FailableStorage {
        async fn load_all(&self) -> Result<Vec<Result<StoredDraft, StoreError>>, StoreError> {
            self.inner.load_all().await
        }

        async fn save(&self, record: &StoredDraft) -> Result<(), StoreError> {
            self.check()?;
            self.inner.save(record).await
        }

        async fn remove(&self, id: &ReportId) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.remove(id).await
        }

        async fn mark_delivered(&self, id: &ReportId, at: UnixTimeMs) -> Result<(), StoreError> {
            self.check()?;
            self.inner.mark_delivered(id, at).await
        }

        async fn load_delivered(&self, limit: usize) -> Result<Vec<ReportId>, StoreError> {
            self.inner.load_delivered(limit).await
        }
    }

    #[tokio::test]
    async fn enqueue_then_deliver() {
        let (storage, queue) = open_memory().await;

        let queued = queue.enqueue(draft("jane"), T0).await.unwrap();
        assert_eq!(queued.draft.status, DraftStatus::Queued);
        assert_eq!(storage.len(), 1);

        let sending = queue.dequeue_next(T0).await.unwrap().unwrap();
        assert_eq!(sending.status, DraftStatus::Sending);
        assert!(queue.dequeue_next(T0).await.unwrap().is_none());

        let delivered = queue.ack(&id("jane"), &receipt(), T0).await.unwrap();
        assert_eq!(delivered.status, DraftStatus::Delivered);
        assert!(queue.list_pending().await.is_empty());
        assert!(storage.is_empty());
        assert!(queue.is_delivered(&id("jane")).await);

        assert_matches!(
            queue.enqueue(draft("jane"), T0).await,
            Err(QueueError::AlreadyDelivered(_))
        );
    }

    #[tokio::test]
    async fn reenqueue_updates_in_place() {
        let (_, queue) = open_memory().await;
        queue.enqueue(draft("a"), T0).await.unwrap();
        queue.enqueue(draft("b"), T0).await.unwrap();

        let mut edited = draft("a");
        edited.description = "Flooding near the pier, now over the road".into();
        queue.enqueue(edited, T0).await.unwrap();

        let pending = queue.list_pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id.as_str(), "a");
        assert!(pending[0].description.ends_with("over the road"));
        assert_eq!(queue.metrics().updated, 1);
    }

    fn media(name: &str) -> MediaRef {
        MediaRef {
            handle: crate::model::MediaHandle::generate(),
            file_name: name.into(),
            mime_type: "video/mp4".into(),
            kind: crate::model::MediaKind::Video,
            size_bytes: 4,
            content_hash: "00".into(),
            local_path: std::path::PathBuf::from(name),
            preview_path: None,
        }
    }

    #[tokio::test]
    async fn update_hands_back_dropped_attachments() {
        let (_, queue) = open_memory().await;
        let (kept, dropped) = (media("kept.mp4"), media("dropped.mp4"));

        let mut original = draft("a");
        original.media = vec![kept.clone(), dropped.clone()];
        let first = queue.enqueue(original, T0).await.unwrap();
        assert!(first.superseded_media.is_empty());

        let mut edited = draft("a");
        edited.media = vec![kept.clone()];
        let updated = queue.enqueue(edited, T0).await.unwrap();
        assert_eq!(updated.superseded_media, vec![dropped]);
        assert_eq!(updated.draft.media, vec![kept]);
    }

    #[tokio::test]
    async fn sending_report_cannot_be_updated_or_removed() {
        let (_, queue) = open_memory().await;
        queue.enqueue(draft("a"), T0).await.unwrap();
        queue.dequeue_next(T0).await.unwrap();

        assert_matches!(queue.enqueue(draft("a"), T0).await, Err(QueueError::InFlight(_)));
        assert_matches!(queue.remove(&id("a")).await, Err(QueueError::InFlight(_)));
    }

    #[tokio::test]
    async fn three_transient_failures_back_off_exponentially() {
        let (_, queue) = open_memory().await;
        queue.enqueue(draft("a"), T0).await.unwrap();

        let mut now = T0;
        let mut offsets = Vec::new();
        for attempt in 1..=3 {
            let sending = queue.dequeue_next(now).await.unwrap().unwrap();
            assert_eq!(sending.attempts, attempt - 1);

            let nacked = queue
                .nack(&id("a"), DeliveryFailure::Transient("503".into()), now)
                .await
                .unwrap();
            assert_eq!(nacked.status, DraftStatus::Queued);
            assert_eq!(nacked.attempts, attempt);
            assert_eq!(nacked.last_error.as_deref(), Some("503"));

            let next = nacked.next_attempt_at.unwrap();
            offsets.push(now.until(next));
            assert!(queue.dequeue_next(now).await.unwrap().is_none());
            now = next;
        }

        assert_eq!(offsets, vec![1_000, 2_000, 4_000]);
    }

    #[tokio::test]
    async fn backoff_does_not_block_later_reports() {
        let (_, queue) = open_memory().await;
        queue.enqueue(draft("a"), T0).await.unwrap();
        queue.enqueue(draft("b"), T0).await.unwrap();

        queue.dequeue_next(T0).await.unwrap();
        queue
            .nack(&id("a"), DeliveryFailure::Transient("timeout".into()), T0)
            .await
            .unwrap();

        let next = queue.dequeue_next(T0).await.unwrap().unwrap();
        assert_eq!(next.id.as_str(), "b");
        assert_eq!(queue.next_eligible_at().await, Some(T0.saturating_add(1_000)));
    }

    #[tokio::test]
    async fn exhausted_report_stays_failed() {
        let storage = Arc::new(MemoryDraftStorage::new());
        let config = QueueConfig {
            max_attempts: 2,
            ..QueueConfig::default()
        };
        let queue = SubmissionQueue::open(storage, config).await.unwrap();
        queue.enqueue(draft("a"), T0).await.unwrap();

        let mut now = T0;
        for _ in 0..2 {
            queue.dequeue_next(now).await.unwrap().unwrap();
            queue
                .nack(&id("a"), DeliveryFailure::Transient("502".into()), now)
                .await
                .unwrap();
            now = now.saturating_add(1_000_000);
        }

        let failed = queue.get(&id("a")).await.unwrap();
        assert_eq!(failed.status, DraftStatus::Failed);
        assert_eq!(failed.failure, Some(FailureKind::RetriesExhausted));
        assert!(queue.dequeue_next(now.saturating_add(10_000_000)).await.unwrap().is_none());

        // Re-enqueueing edits content but does not revive it.
        queue.enqueue(draft("a"), now).await.unwrap();
        assert_eq!(queue.get(&id("a")).await.unwrap().status, DraftStatus::Failed);

        let retried = queue.retry(&id("a"), now).await.unwrap();
        assert_eq!(retried.status, DraftStatus::Queued);
        assert_eq!(retried.retry_budget_used, 0);
        assert_eq!(retried.attempts, 2);
        assert!(queue.dequeue_next(now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rejection_fails_immediately_without_spending_budget() {
        let (_, queue) = open_memory().await;
        queue.enqueue(draft("a"), T0).await.unwrap();
        queue.dequeue_next(T0).await.unwrap();

        let failed = queue
            .nack(&id("a"), DeliveryFailure::Rejected("422 invalid".into()), T0)
            .await
            .unwrap();
        assert_eq!(failed.status, DraftStatus::Failed);
        assert_eq!(failed.failure, Some(FailureKind::Rejected));
        assert_eq!(failed.retry_budget_used, 0);
        assert_eq!(failed.attempts, 1);
    }

    #[tokio::test]
    async fn connectivity_loss_uses_one_base_step() {
        let (_, queue) = open_memory().await;
        queue.enqueue(draft("a"), T0).await.unwrap();

        let mut now = T0;
        for _ in 0..5 {
            queue.dequeue_next(now).await.unwrap().unwrap();
            let requeued = queue
                .nack(&id("a"), DeliveryFailure::ConnectivityLost, now)
                .await
                .unwrap();
            assert_eq!(requeued.status, DraftStatus::Queued);
            assert_eq!(requeued.retry_budget_used, 0);
            assert_eq!(requeued.next_attempt_at, Some(now.saturating_add(1_000)));
            now = now.saturating_add(1_000);
        }
        assert_eq!(queue.get(&id("a")).await.unwrap().attempts, 5);
    }

    #[tokio::test]
    async fn ack_requires_sending() {
        let (_, queue) = open_memory().await;
        queue.enqueue(draft("a"), T0).await.unwrap();

        assert_matches!(
            queue.ack(&id("a"), &receipt(), T0).await,
            Err(QueueError::InvalidTransition {
                from: DraftStatus::Queued,
                to: DraftStatus::Delivered,
                ..
            })
        );
        assert_matches!(
            queue.nack(&id("missing"), DeliveryFailure::ConnectivityLost, T0).await,
            Err(QueueError::NotFound(_))
        );
        assert_matches!(
            queue.retry(&id("a"), T0).await,
            Err(QueueError::InvalidTransition { .. })
        );
    }

    #[tokio::test]
    async fn crash_recovery_resets_sending() {
        let storage = Arc::new(MemoryDraftStorage::new());
        {
            let queue = SubmissionQueue::open(storage.clone(), QueueConfig::default())
                .await
                .unwrap();
            queue.enqueue(draft("a"), T0).await.unwrap();
            queue.dequeue_next(T0).await.unwrap();
            queue
                .nack(&id("a"), DeliveryFailure::Transient("503".into()), T0)
                .await
                .unwrap();
            queue.dequeue_next(T0.saturating_add(5_000)).await.unwrap().unwrap();
        }

        let queue = SubmissionQueue::open(storage.clone(), QueueConfig::default())
            .await
            .unwrap();
        let recovered = queue.get(&id("a")).await.unwrap();
        assert_eq!(recovered.status, DraftStatus::Queued);
        assert_eq!(recovered.attempts, 1);
        assert_eq!(queue.metrics().recovered_in_flight, 1);

        let reloaded = storage.load_all().await.unwrap();
        assert_eq!(
            reloaded[0].as_ref().unwrap().draft.status,
            DraftStatus::Queued
        );
    }

    #[tokio::test]
    async fn insertion_order_survives_restart() {
        let storage = Arc::new(MemoryDraftStorage::new());
        {
            let queue = SubmissionQueue::open(storage.clone(), QueueConfig::default())
                .await
                .unwrap();
            for name in ["c", "a", "b"] {
                queue.enqueue(draft(name), T0).await.unwrap();
            }
        }

        let queue = SubmissionQueue::open(storage, QueueConfig::default())
            .await
            .unwrap();
        let order: Vec<_> = queue
            .list_pending()
            .await
            .into_iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);

        queue.enqueue(draft("d"), T0).await.unwrap();
        assert_eq!(queue.list_pending().await[3].id.as_str(), "d");
    }

    #[tokio::test]
    async fn delivered_ids_survive_restart() {
        let storage = Arc::new(MemoryDraftStorage::new());
        {
            let queue = SubmissionQueue::open(storage.clone(), QueueConfig::default())
                .await
                .unwrap();
            queue.enqueue(draft("a"), T0).await.unwrap();
            queue.dequeue_next(T0).await.unwrap();
            queue.ack(&id("a"), &receipt(), T0).await.unwrap();
        }

        let queue = SubmissionQueue::open(storage, QueueConfig::default())
            .await
            .unwrap();
        assert_matches!(
            queue.enqueue(draft("a"), T0).await,
            Err(QueueError::AlreadyDelivered(_))
        );
    }

    #[tokio::test]
    async fn storage_failure_rolls_back() {
        let storage = Arc::new(FailableStorage::new());
        let queue = SubmissionQueue::open(storage.clone(), QueueConfig::default())
            .await
            .unwrap();

        storage.set_fail_writes(true);
        assert_matches!(
            queue.enqueue(draft("a"), T0).await,
            Err(QueueError::Storage(_))
        );
        assert!(queue.get(&id("a")).await.is_none());

        storage.set_fail_writes(false);
        queue.enqueue(draft("a"), T0).await.unwrap();
        queue.dequeue_next(T0).await.unwrap();

        storage.set_fail_writes(true);
        assert!(queue.ack(&id("a"), &receipt(), T0).await.is_err());
        assert_eq!(queue.get(&id("a")).await.unwrap().status, DraftStatus::Sending);
        assert!(queue
            .nack(&id("a"), DeliveryFailure::Transient("x".into()), T0)
            .await
            .is_err());
        assert_eq!(queue.get(&id("a")).await.unwrap().attempts, 0);
        assert_eq!(queue.metrics().storage_errors, 3);
    }

    #[tokio::test]
    async fn unsettled_report_is_released_even_when_storage_refuses() {
        let storage = Arc::new(FailableStorage::new());
        let queue = SubmissionQueue::open(storage.clone(), QueueConfig::default())
            .await
            .unwrap();
        queue.enqueue(draft("a"), T0).await.unwrap();
        queue.dequeue_next(T0).await.unwrap().unwrap();

        storage.set_fail_writes(true);
        assert!(queue.ack(&id("a"), &receipt(), T0).await.is_err());
        assert!(queue.release_in_flight(&id("a")).await);

        let released = queue.get(&id("a")).await.unwrap();
        assert_eq!(released.status, DraftStatus::Queued);
        assert_eq!(released.attempts, 0);
        assert!(!queue.release_in_flight(&id("a")).await);
        assert!(!queue.release_in_flight(&id("missing")).await);

        storage.set_fail_writes(false);
        let again = queue.dequeue_next(T0).await.unwrap().unwrap();
        assert_eq!(again.id, id("a"));
        queue.ack(&id("a"), &receipt(), T0).await.unwrap();
        assert_eq!(queue.metrics().released_in_flight, 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let storage = Arc::new(MemoryDraftStorage::new());
        let config = QueueConfig {
            max_entries: 1,
            ..QueueConfig::default()
        };
        let queue = SubmissionQueue::open(storage, config).await.unwrap();
        queue.enqueue(draft("a"), T0).await.unwrap();
        assert_matches!(queue.enqueue(draft("b"), T0).await, Err(QueueError::Full(1)));
        // Updating an existing report is not blocked by capacity.
        queue.enqueue(draft("a"), T0).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_rows_are_quarantined() {
        let storage = Arc::new(MemoryDraftStorage::new());
        storage.insert_raw("broken", 1, b"garbage".to_vec());
        let queue = SubmissionQueue::open(storage, QueueConfig::default())
            .await
            .unwrap();

        assert!(queue.is_empty().await);
        let quarantined = queue.quarantined().await;
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].id, "broken");

        queue.enqueue(draft("fresh"), T0).await.unwrap();
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn stats_aggregate_by_status_and_hazard() {
        let (_, queue) = open_memory().await;
        queue.enqueue(draft("a"), T0).await.unwrap();
        let mut unlocated = draft("b");
        unlocated.location = None;
        unlocated.hazard_type = HazardType::HighWaves;
        queue.enqueue(unlocated, T0).await.unwrap();
        queue.dequeue_next(T0).await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.sending, 1);
        assert_eq!(stats.without_location, 1);
        assert_eq!(stats.by_hazard.get(&HazardType::Flood), Some(&1));
        assert_eq!(stats.by_hazard.get(&HazardType::HighWaves), Some(&1));
        assert_eq!(stats.oldest_pending_at, Some(T0));
    }

    #[tokio::test]
    async fn enqueue_wakes_waiters() {
        let (_, queue) = open_memory().await;
        let queue = Arc::new(queue);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.notified().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(draft("a"), T0).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn config_validation() {
        assert!(QueueConfig::default().validate().is_ok());
        let bad = QueueConfig {
            max_attempts: 0,
            ..QueueConfig::default()
        };
        assert_matches!(bad.validate(), Err(QueueError::InvalidConfig(_)));
        let inverted = QueueConfig {
            max_backoff_ms: 10,
            ..QueueConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Enqueue(usize),
        Dequeue,
        Ack(usize),
        Transient(usize),
        Rejected(usize),
        ConnectivityLost(usize),
        Retry(usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize).prop_map(Op::Enqueue),
            Just(Op::Dequeue),
            (0..4usize).prop_map(Op::Ack),
            (0..4usize).prop_map(Op::Transient),
            (0..4usize).prop_map(Op::Rejected),
            (0..4usize).prop_map(Op::ConnectivityLost),
            (0..4usize).prop_map(Op::Retry),
            (0..4usize).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn backoff_is_monotonic_and_capped(base in 1u64..10_000, steps in 0u32..80) {
            let config = QueueConfig {
                base_backoff_ms: base,
                max_backoff_ms: base * 300,
                ..QueueConfig::default()
            };
            let current = config.backoff_ms(steps);
            prop_assert!(current <= config.max_backoff_ms);
            prop_assert!(current >= base);
            prop_assert!(config.backoff_ms(steps + 1) >= current);
        }

        #[test]
        fn transitions_follow_the_legal_graph(ops in proptest::collection::vec(op(), 1..60)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let config = QueueConfig { max_attempts: 3, ..QueueConfig::default() };
                let queue = SubmissionQueue::open(Arc::new(MemoryDraftStorage::new()), config)
                    .await
                    .unwrap();
                let ids = ["r0", "r1", "r2", "r3"];
                let mut seen: HashMap<String, (DraftStatus, u32)> = HashMap::new();
                let mut now = T0;

                for op in ops {
                    now = now.saturating_add(1_000_000);
                    let _ = match op {
                        Op::Enqueue(i) => queue.enqueue(draft(ids[i]), now).await.map(|_| ()),
                        Op::Dequeue => queue.dequeue_next(now).await.map(|_| ()),
                        Op::Ack(i) => queue.ack(&id(ids[i]), &receipt(), now).await.map(|_| ()),
                        Op::Transient(i) => queue
                            .nack(&id(ids[i]), DeliveryFailure::Transient("t".into()), now)
                            .await
                            .map(|_| ()),
                        Op::Rejected(i) => queue
                            .nack(&id(ids[i]), DeliveryFailure::Rejected("r".into()), now)
                            .await
                            .map(|_| ()),
                        Op::ConnectivityLost(i) => queue
                            .nack(&id(ids[i]), DeliveryFailure::ConnectivityLost, now)
                            .await
                            .map(|_| ()),
                        Op::Retry(i) => queue.retry(&id(ids[i]), now).await.map(|_| ()),
                        Op::Remove(i) => queue.remove(&id(ids[i])).await.map(|_| ()),
                    };

                    let pending = queue.list_pending().await;
                    let mut current: HashMap<String, (DraftStatus, u32)> = HashMap::new();
                    for draft in &pending {
                        assert!(
                            current
                                .insert(draft.id.to_string(), (draft.status, draft.attempts))
                                .is_none(),
                            "duplicate entry for {}",
                            draft.id
                        );
                        if let Some((before, attempts)) = seen.get(draft.id.as_str()) {
                            assert!(
                                *before == draft.status || before.can_transition_to(draft.status),
                                "illegal transition {before} -> {}",
                                draft.status
                            );
                            assert!(draft.attempts >= *attempts);
                        }
                    }
                    for (gone, (status, _)) in &seen {
                        if !current.contains_key(gone) && queue.is_delivered(&id(gone)).await {
                            assert_eq!(*status, DraftStatus::Sending);
                        }
                    }
                    seen = current;
                }
            });
        }
    }
}
