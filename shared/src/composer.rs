//! A single report being put together: attachments staging in the
//! background, an optional location lookup, then validation and enqueue.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::location::{LocationError, LocationResolver};
use crate::media::{MediaError, MediaFile, MediaStager};
use crate::model::{Clock, Coordinate, GeoTag, MediaRef, ReportDraft, ReportForm, ReportId};
use crate::queue::{Enqueued, QueueError, SubmissionQueue};
use crate::validator::{self, ValidationError};

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("report is invalid: {}", summarize(.0))]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ValidationError::message)
        .collect::<Vec<_>>()
        .join("; ")
}

/// An attachment that could not be staged. The rest of the report is
/// unaffected.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFailure {
    pub file_name: String,
    pub error: MediaError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedReport {
    pub draft: ReportDraft,
    pub media_failures: Vec<MediaFailure>,
    pub location_error: Option<LocationError>,
}

enum Attachment {
    Staging {
        file_name: String,
        task: JoinHandle<Result<MediaRef, MediaError>>,
    },
    Done {
        file_name: String,
        result: Result<MediaRef, MediaError>,
    },
}

enum LocationSlot {
    Empty,
    Resolving(JoinHandle<Result<GeoTag, LocationError>>),
    Resolved(Result<GeoTag, LocationError>),
}

pub struct ReportComposer {
    id: ReportId,
    queue: Arc<SubmissionQueue>,
    stager: Arc<MediaStager>,
    resolver: LocationResolver,
    clock: Arc<dyn Clock>,
    attachments: Vec<Attachment>,
    location: LocationSlot,
    finished: bool,
}

impl ReportComposer {
    pub fn new(
        queue: Arc<SubmissionQueue>,
        stager: Arc<MediaStager>,
        resolver: LocationResolver,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: ReportId::generate(),
            queue,
            stager,
            resolver,
            clock,
            attachments: Vec::new(),
            location: LocationSlot::Empty,
            finished: false,
        }
    }

    pub fn id(&self) -> &ReportId {
        &self.id
    }

    /// Start staging `file` in the background. Returns its position in
    /// attach order.
    pub fn attach(&mut self, file: MediaFile) -> usize {
        let file_name = file.file_name.clone();
        let stager = self.stager.clone();
        let owner = self.id.clone();
        let task = tokio::spawn(async move { stager.stage(&owner, file).await });

        debug!(report_id = %self.id, file_name = %file_name, "attachment staging started");
        self.attachments.push(Attachment::Staging { file_name, task });
        self.attachments.len() - 1
    }

    /// Remove the attachment at `index`: abort its staging or delete the
    /// staged file. Later attachments move up one place, keeping their order.
    #[instrument(skip(self), fields(report_id = %self.id))]
    pub async fn detach(&mut self, index: usize) -> Result<(), MediaError> {
        if index >= self.attachments.len() {
            return Err(MediaError::NotFound(format!("attachment #{index}")));
        }

        match self.attachments.remove(index) {
            Attachment::Staging { task, .. } => {
                task.abort();
                // Staging may have finished before the abort landed.
                if let Ok(Ok(media)) = task.await {
                    self.stager.unstage(&media.handle).await?;
                }
                Ok(())
            }
            Attachment::Done { result: Ok(media), .. } => self.stager.unstage(&media.handle).await,
            Attachment::Done { result: Err(_), .. } => Ok(()),
        }
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Ask the device for a fix in the background, replacing any previous
    /// location.
    pub fn locate(&mut self, timeout: Duration) {
        self.abort_location();
        let resolver = self.resolver.clone();
        self.location = LocationSlot::Resolving(tokio::spawn(async move {
            resolver.resolve_current(timeout).await
        }));
    }

    /// Place the report by hand. Cancels a pending device lookup.
    pub fn set_manual_location(&mut self, coordinate: Coordinate) -> GeoTag {
        self.abort_location();
        let tag = self.resolver.set_manual(coordinate);
        self.location = LocationSlot::Resolved(Ok(tag));
        tag
    }

    fn abort_location(&mut self) {
        if let LocationSlot::Resolving(task) = &self.location {
            task.abort();
        }
        self.location = LocationSlot::Empty;
    }

    /// Wait for every attachment started so far. Returns how many staged
    /// successfully.
    pub async fn wait_for_media(&mut self) -> usize {
        for attachment in &mut self.attachments {
            settle(attachment).await;
        }
        self.attachments
            .iter()
            .filter(|a| matches!(a, Attachment::Done { result: Ok(_), .. }))
            .count()
    }

    /// Validate, collect finished attachments and location, and queue the
    /// report. An invalid form ends the session and releases its media.
    #[instrument(skip_all, fields(report_id = %self.id))]
    pub async fn submit(mut self, form: &ReportForm) -> Result<SubmittedReport, ComposeError> {
        let now = self.clock.now();
        let mut draft = match validator::validate_with_id(form, self.id.clone(), now) {
            Ok(draft) => draft,
            Err(errors) => {
                info!(errors = errors.len(), "report rejected by validation");
                self.release().await;
                return Err(ComposeError::Invalid(errors));
            }
        };

        self.wait_for_media().await;
        let mut media_failures = Vec::new();
        for attachment in std::mem::take(&mut self.attachments) {
            if let Attachment::Done { file_name, result } = attachment {
                match result {
                    Ok(media) => draft.media.push(media),
                    Err(error) => media_failures.push(MediaFailure { file_name, error }),
                }
            }
        }

        let mut location_error = None;
        match self.take_location().await {
            Some(Ok(tag)) => draft.location = Some(tag),
            Some(Err(e)) => {
                warn!("submitting without location: {}", e);
                location_error = Some(e);
            }
            None => {}
        }

        let media = draft.media.clone();
        match self.queue.enqueue(draft, now).await {
            Ok(Enqueued { draft, .. }) => {
                self.finished = true;
                info!(
                    media = draft.media.len(),
                    media_failures = media_failures.len(),
                    located = draft.location.is_some(),
                    "report submitted"
                );
                Ok(SubmittedReport {
                    draft,
                    media_failures,
                    location_error,
                })
            }
            Err(e) => {
                self.stager.release_refs(&media).await;
                self.release().await;
                Err(e.into())
            }
        }
    }

    async fn take_location(&mut self) -> Option<Result<GeoTag, LocationError>> {
        match std::mem::replace(&mut self.location, LocationSlot::Empty) {
            LocationSlot::Empty => None,
            LocationSlot::Resolved(result) => Some(result),
            LocationSlot::Resolving(task) => Some(match task.await {
                Ok(result) => result,
                Err(_) => Err(LocationError::Unavailable),
            }),
        }
    }

    /// Abandon the report: stop background work and delete staged media.
    /// Returns the number of attachments released.
    #[instrument(skip_all, fields(report_id = %self.id))]
    pub async fn discard(mut self) -> usize {
        self.release().await
    }

    async fn release(&mut self) -> usize {
        self.abort_location();
        for attachment in std::mem::take(&mut self.attachments) {
            if let Attachment::Staging { task, .. } = attachment {
                task.abort();
                let _ = task.await;
            }
        }
        self.finished = true;
        self.stager.release_owner(&self.id).await
    }
}

async fn settle(attachment: &mut Attachment) {
    if let Attachment::Staging { file_name, task } = attachment {
        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(MediaError::Cancelled),
            Err(e) => Err(MediaError::Io(format!("staging task failed: {e}"))),
        };
        *attachment = Attachment::Done {
            file_name: std::mem::take(file_name),
            result,
        };
    }
}

impl Drop for ReportComposer {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for attachment in &self.attachments {
            if let Attachment::Staging { task, .. } = attachment {
                task.abort();
            }
        }
        if let LocationSlot::Resolving(task) = &self.location {
            task.abort();
        }

        let stager = self.stager.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    stager.release_owner(&id).await;
                });
            }
            Err(_) => warn!(report_id = %self.id, "composer dropped outside a runtime, staged media kept"),
        }
    }
}
