//! The reporting core as seen by a platform shell.

use geojson::FeatureCollection;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::composer::{ComposeError, ReportComposer};
use crate::config::{ConfigError, ReportingConfig};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::crypto::CryptoProvider;
use crate::delivery::{DeliveryEndpoint, EndpointError, HttpDeliveryEndpoint};
use crate::feed::{self, FeedFilter};
use crate::location::{LocationProvider, LocationResolver};
use crate::media::MediaStager;
use crate::model::{Clock, ReportDraft, ReportId, SystemClock};
use crate::queue::{MetricsSnapshot, QuarantinedRow, QueueError, QueueStats, SubmissionQueue};
use crate::storage::{DraftStorage, StoreError};
use crate::sync::{DrainReport, SyncCoordinator, SyncEvent, SyncHandle};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("storage.seal_at_rest is set but no sealing key was provided")]
    MissingSealingKey,
}

/// Assembles a [`ReportingService`]. Anything not supplied is built from the
/// configuration.
pub struct ServiceBuilder {
    config: ReportingConfig,
    storage: Option<Arc<dyn DraftStorage>>,
    endpoint: Option<Arc<dyn DeliveryEndpoint>>,
    location: Option<Arc<dyn LocationProvider>>,
    sealer: Option<Arc<dyn CryptoProvider>>,
    clock: Arc<dyn Clock>,
    initial: Connectivity,
}

impl ServiceBuilder {
    pub fn new(config: ReportingConfig) -> Self {
        Self {
            config,
            storage: None,
            endpoint: None,
            location: None,
            sealer: None,
            clock: Arc::new(SystemClock),
            initial: Connectivity::Offline,
        }
    }

    pub fn storage(mut self, storage: Arc<dyn DraftStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn endpoint(mut self, endpoint: Arc<dyn DeliveryEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn location_provider(mut self, provider: Arc<dyn LocationProvider>) -> Self {
        self.location = Some(provider);
        self
    }

    /// Key used to seal rows of the default SQLite storage.
    pub fn sealer(mut self, sealer: Arc<dyn CryptoProvider>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn connectivity(mut self, initial: Connectivity) -> Self {
        self.initial = initial;
        self
    }

    pub async fn build(self) -> Result<ReportingService, ServiceError> {
        self.config.validate()?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => open_storage(&self.config, self.sealer)?,
        };
        let endpoint: Arc<dyn DeliveryEndpoint> = match self.endpoint {
            Some(endpoint) => endpoint,
            None => Arc::new(HttpDeliveryEndpoint::new(&self.config.endpoint)?),
        };

        let queue = Arc::new(SubmissionQueue::open(storage, self.config.queue.clone()).await?);
        let stager = Arc::new(MediaStager::new(self.config.media.clone()));

        let mut adopted = 0;
        for draft in queue.list_pending().await {
            adopted += stager.adopt(&draft.id, &draft.media);
        }
        if adopted > 0 {
            info!(adopted, "re-registered staged media of queued reports");
        }

        let resolver = match self.location {
            Some(provider) => LocationResolver::new(provider),
            None => LocationResolver::unavailable(),
        };

        let coordinator = Arc::new(
            SyncCoordinator::new(
                queue.clone(),
                endpoint,
                self.clock.clone(),
                self.config.sync.clone(),
            )
            .with_stager(stager.clone()),
        );

        Ok(ReportingService {
            config: self.config,
            queue,
            stager,
            resolver,
            clock: self.clock,
            connectivity: ConnectivityMonitor::new(self.initial),
            coordinator,
        })
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn open_storage(
    config: &ReportingConfig,
    sealer: Option<Arc<dyn CryptoProvider>>,
) -> Result<Arc<dyn DraftStorage>, ServiceError> {
    if let Some(parent) = config.storage.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(StoreError::from)?;
        }
    }
    let storage = crate::storage::SqliteDraftStorage::open(&config.storage.database_path)?;
    let storage = match (config.storage.seal_at_rest, sealer) {
        (true, Some(sealer)) => storage.with_sealer(sealer),
        (true, None) => return Err(ServiceError::MissingSealingKey),
        (false, Some(_)) => {
            warn!("sealing key provided but storage.seal_at_rest is off, ignoring it");
            storage
        }
        (false, None) => storage,
    };
    Ok(Arc::new(storage))
}

#[cfg(target_arch = "wasm32")]
fn open_storage(
    _config: &ReportingConfig,
    _sealer: Option<Arc<dyn CryptoProvider>>,
) -> Result<Arc<dyn DraftStorage>, ServiceError> {
    Ok(Arc::new(crate::storage::MemoryDraftStorage::new()))
}

pub struct ReportingService {
    config: ReportingConfig,
    queue: Arc<SubmissionQueue>,
    stager: Arc<MediaStager>,
    resolver: LocationResolver,
    clock: Arc<dyn Clock>,
    connectivity: ConnectivityMonitor,
    coordinator: Arc<SyncCoordinator>,
}

impl ReportingService {
    pub fn builder(config: ReportingConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn config(&self) -> &ReportingConfig {
        &self.config
    }

    /// Start a new report.
    pub fn compose(&self) -> ReportComposer {
        ReportComposer::new(
            self.queue.clone(),
            self.stager.clone(),
            self.resolver.clone(),
            self.clock.clone(),
        )
    }

    pub fn set_connectivity(&self, state: Connectivity) {
        self.connectivity.set(state);
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity.current()
    }

    /// Run the coordinator in the background until the handle is shut down.
    pub fn start_sync(&self) -> SyncHandle {
        self.coordinator.clone().spawn(self.connectivity.subscribe())
    }

    /// One drain cycle on the caller's task.
    pub async fn drain_now(&self) -> Result<DrainReport, ServiceError> {
        let mut connectivity = self.connectivity.subscribe();
        Ok(self.coordinator.drain_cycle(&mut connectivity).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    pub async fn pending(&self) -> Vec<ReportDraft> {
        self.queue.list_pending().await
    }

    pub async fn get(&self, id: &ReportId) -> Option<ReportDraft> {
        self.queue.get(id).await
    }

    pub async fn stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.queue.metrics()
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedRow> {
        self.queue.quarantined().await
    }

    pub async fn feed(&self) -> FeatureCollection {
        feed::pending_feature_collection(&self.queue.list_pending().await)
    }

    pub async fn feed_filtered(&self, filter: &FeedFilter) -> FeatureCollection {
        feed::filtered_feature_collection(&self.queue.list_pending().await, filter)
    }

    /// Give a failed report a fresh retry budget.
    pub async fn retry(&self, id: &ReportId) -> Result<ReportDraft, ServiceError> {
        Ok(self.queue.retry(id, self.clock.now()).await?)
    }

    /// Replace the content of a report already in the queue. Attachments
    /// the new content no longer lists are deleted.
    #[instrument(skip(self, draft), fields(report_id = %draft.id))]
    pub async fn update(&self, draft: ReportDraft) -> Result<ReportDraft, ServiceError> {
        if self.queue.get(&draft.id).await.is_none() {
            return Err(QueueError::NotFound(draft.id.to_string()).into());
        }
        let enqueued = self.queue.enqueue(draft, self.clock.now()).await?;
        let released = self.stager.release_refs(&enqueued.superseded_media).await;
        if released > 0 {
            info!(released, "superseded media released");
        }
        Ok(enqueued.draft)
    }

    /// Cancel a queued report and delete its staged media.
    #[instrument(skip(self), fields(report_id = %id))]
    pub async fn discard(&self, id: &ReportId) -> Result<ReportDraft, ServiceError> {
        let draft = self.queue.remove(id).await?;
        let released = self.stager.release_refs(&draft.media).await;
        info!(released, "queued report discarded");
        Ok(draft)
    }

    /// Staged attachments not yet released, across drafts and queued reports.
    pub fn outstanding_media(&self) -> usize {
        self.stager.outstanding()
    }
}
