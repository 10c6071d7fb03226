use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("unknown hazard type: {0:?}")]
    UnknownHazardType(String),
}

// ============================================================================
// Time
// ============================================================================

/// Unix timestamp in milliseconds
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub fn saturating_add(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn saturating_sub(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }

    /// Milliseconds from `self` until `later`, zero if `later` is in the past.
    #[must_use]
    pub fn until(self, later: UnixTimeMs) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Clock driven by the caller. Used by hosts that replay events and by tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self(AtomicU64::new(start.0))
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.0.store(now.0, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.0.load(Ordering::SeqCst))
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Client-generated report identifier, immutable after construction.
///
/// Doubles as the idempotency key sent to the delivery endpoint, so it must
/// stay stable across retries and restarts.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReportId(String);

impl ReportId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(ModelError::InvalidId("ReportId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "ReportId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidId(
                "ReportId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ReportId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ReportId> for String {
    fn from(id: ReportId) -> Self {
        id.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Revocable handle to a staged media file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaHandle(String);

impl MediaHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Location
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct CoordinateRepr {
    lat: f64,
    lon: f64,
}

/// Validated, canonical geographic coordinate.
///
/// Canonical form is rounded to 7 decimal places (about 1 cm) with negative
/// zero folded to zero, so two fixes of the same spot compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CoordinateRepr", into = "CoordinateRepr")]
pub struct Coordinate {
    lat: f64,
    lon: f64,
}

impl Coordinate {
    const SCALE: f64 = 1e7;

    pub fn new(lat: f64, lon: f64) -> Result<Self, ModelError> {
        if !lat.is_finite()
            || !lon.is_finite()
            || !(-90.0..=90.0).contains(&lat)
            || !(-180.0..=180.0).contains(&lon)
        {
            return Err(ModelError::InvalidCoordinate { lat, lon });
        }
        Ok(Self {
            lat: Self::canonical(lat),
            lon: Self::canonical(lon),
        })
    }

    fn canonical(value: f64) -> f64 {
        let rounded = (value * Self::SCALE).round() / Self::SCALE;
        if rounded == 0.0 {
            0.0
        } else {
            rounded
        }
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }
}

impl TryFrom<CoordinateRepr> for Coordinate {
    type Error = ModelError;

    fn try_from(value: CoordinateRepr) -> Result<Self, Self::Error> {
        Self::new(value.lat, value.lon)
    }
}

impl From<Coordinate> for CoordinateRepr {
    fn from(c: Coordinate) -> Self {
        Self {
            lat: c.lat,
            lon: c.lon,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.lat, self.lon)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocationSource {
    Device { accuracy_m: Option<f64> },
    Manual,
}

impl LocationSource {
    pub fn name(&self) -> &'static str {
        match self {
            LocationSource::Device { .. } => "device",
            LocationSource::Manual => "manual",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoTag {
    pub coordinate: Coordinate,
    pub source: LocationSource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationQuality {
    Located,
    /// Queued without a location; the server has to rely on the description.
    Degraded,
}

// ============================================================================
// Hazard classification
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardType {
    Flood,
    Cyclone,
    Tsunami,
    StormSurge,
    HighWaves,
    CoastalErosion,
    AbnormalSeaBehavior,
    Other,
    /// Left for the server to classify from the description.
    Unclassified,
}

impl HazardType {
    pub const ALL: [HazardType; 9] = [
        HazardType::Flood,
        HazardType::Cyclone,
        HazardType::Tsunami,
        HazardType::StormSurge,
        HazardType::HighWaves,
        HazardType::CoastalErosion,
        HazardType::AbnormalSeaBehavior,
        HazardType::Other,
        HazardType::Unclassified,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            HazardType::Flood => "Flood",
            HazardType::Cyclone => "Cyclone",
            HazardType::Tsunami => "Tsunami",
            HazardType::StormSurge => "Storm Surge",
            HazardType::HighWaves => "High Waves",
            HazardType::CoastalErosion => "Coastal Erosion",
            HazardType::AbnormalSeaBehavior => "Abnormal Sea Behavior",
            HazardType::Other => "Other",
            HazardType::Unclassified => "Auto-classified",
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            HazardType::Flood => "flood",
            HazardType::Cyclone => "cyclone",
            HazardType::Tsunami => "tsunami",
            HazardType::StormSurge => "storm_surge",
            HazardType::HighWaves => "high_waves",
            HazardType::CoastalErosion => "coastal_erosion",
            HazardType::AbnormalSeaBehavior => "abnormal_sea_behavior",
            HazardType::Other => "other",
            HazardType::Unclassified => "unclassified",
        }
    }
}

impl FromStr for HazardType {
    type Err = ModelError;

    /// Accepts display labels, variant names and wire names, ignoring case,
    /// spaces, hyphens and underscores.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .flat_map(char::to_lowercase)
            .collect();

        let hazard = match folded.as_str() {
            "flood" => HazardType::Flood,
            "cyclone" => HazardType::Cyclone,
            "tsunami" => HazardType::Tsunami,
            "stormsurge" => HazardType::StormSurge,
            "highwaves" => HazardType::HighWaves,
            "coastalerosion" => HazardType::CoastalErosion,
            "abnormalseabehavior" | "abnormalseabehaviour" => HazardType::AbnormalSeaBehavior,
            "other" => HazardType::Other,
            "unclassified" | "autoclassified" => HazardType::Unclassified,
            _ => return Err(ModelError::UnknownHazardType(s.to_string())),
        };
        Ok(hazard)
    }
}

impl fmt::Display for HazardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Media
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Some(MediaKind::Image)
        } else if mime.starts_with("video/") {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

/// Locally staged attachment. Raw bytes live at `local_path`, never in the
/// draft itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub handle: MediaHandle,
    pub file_name: String,
    pub mime_type: String,
    pub kind: MediaKind,
    pub size_bytes: u64,
    /// blake3, hex encoded
    pub content_hash: String,
    pub local_path: PathBuf,
    pub preview_path: Option<PathBuf>,
}

// ============================================================================
// Drafts
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Draft,
    Queued,
    Sending,
    Delivered,
    Failed,
}

impl DraftStatus {
    pub fn name(&self) -> &'static str {
        match self {
            DraftStatus::Draft => "draft",
            DraftStatus::Queued => "queued",
            DraftStatus::Sending => "sending",
            DraftStatus::Delivered => "delivered",
            DraftStatus::Failed => "failed",
        }
    }

    /// Legal edges: Draft→Queued→Sending→{Delivered | Queued | Failed}, and
    /// Failed→Queued for a manual retry.
    pub fn can_transition_to(&self, next: DraftStatus) -> bool {
        matches!(
            (self, next),
            (DraftStatus::Draft, DraftStatus::Queued)
                | (DraftStatus::Queued, DraftStatus::Sending)
                | (DraftStatus::Sending, DraftStatus::Delivered)
                | (DraftStatus::Sending, DraftStatus::Queued)
                | (DraftStatus::Sending, DraftStatus::Failed)
                | (DraftStatus::Failed, DraftStatus::Queued)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DraftStatus::Delivered)
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RetriesExhausted,
    Rejected,
}

/// Raw form input as entered by the reporter.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportForm {
    pub name: String,
    pub email: String,
    pub description: String,
    pub hazard_type: Option<String>,
}

impl fmt::Debug for ReportForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportForm")
            .field("name_present", &!self.name.trim().is_empty())
            .field("email_present", &!self.email.trim().is_empty())
            .field("description_len", &self.description.len())
            .field("hazard_type", &self.hazard_type)
            .finish()
    }
}

/// One citizen observation prior to confirmed delivery.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDraft {
    pub id: ReportId,
    pub reporter_name: String,
    pub reporter_email: String,
    pub description: String,
    pub hazard_type: HazardType,
    pub location: Option<GeoTag>,
    pub media: Vec<MediaRef>,
    pub created_at: UnixTimeMs,
    pub status: DraftStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<UnixTimeMs>,
    /// Transient failures counted against the ceiling since the last manual retry.
    #[serde(default)]
    pub retry_budget_used: u32,
    #[serde(default)]
    pub failure: Option<FailureKind>,
}

impl ReportDraft {
    pub const MAX_ERROR_LENGTH: usize = 512;

    pub fn location_quality(&self) -> LocationQuality {
        if self.location.is_some() {
            LocationQuality::Located
        } else {
            LocationQuality::Degraded
        }
    }

    /// Queued and past its backoff.
    pub fn is_eligible(&self, now: UnixTimeMs) -> bool {
        self.status == DraftStatus::Queued && self.next_attempt_at.map_or(true, |at| now >= at)
    }

    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_ERROR_LENGTH);
        self.last_error = Some(message);
    }
}

// Redact debug output because this can contain sensitive user-provided data.
impl fmt::Debug for ReportDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportDraft")
            .field("id", &self.id)
            .field("hazard_type", &self.hazard_type)
            .field("location", &self.location)
            .field("media_count", &self.media.len())
            .field("created_at", &self.created_at)
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .field("last_error", &self.last_error)
            .field("next_attempt_at", &self.next_attempt_at)
            .field("retry_budget_used", &self.retry_budget_used)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}
