// lib.rs - Coastal hazard reporting core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod composer;
pub mod config;
pub mod connectivity;
pub mod crypto;
pub mod delivery;
pub mod feed;
pub mod location;
pub mod media;
pub mod model;
pub mod queue;
pub mod service;
pub mod storage;
pub mod sync;
pub mod validator;

pub use composer::{ComposeError, MediaFailure, ReportComposer, SubmittedReport};
pub use config::{ConfigError, ReportingConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use delivery::{DeliveryEndpoint, DeliveryError, DeliveryReceipt, DeliveryRequest, HttpDeliveryEndpoint};
pub use feed::FeedFilter;
pub use location::{LocationError, LocationProvider, LocationResolver, PositionFix};
pub use media::{MediaError, MediaFile, MediaStager};
pub use model::{
    Coordinate, DraftStatus, FailureKind, GeoTag, HazardType, LocationSource, MediaRef,
    ReportDraft, ReportForm, ReportId, UnixTimeMs,
};
pub use queue::{DeliveryFailure, Enqueued, QueueConfig, QueueError, QueueStats, SubmissionQueue};
pub use service::{ReportingService, ServiceBuilder, ServiceError};
pub use storage::{DraftStorage, MemoryDraftStorage, StoreError};
#[cfg(not(target_arch = "wasm32"))]
pub use storage::SqliteDraftStorage;
pub use sync::{DrainReport, DrainStop, SyncCoordinator, SyncEvent, SyncHandle};
pub use validator::{validate, ValidationError};
