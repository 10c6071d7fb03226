use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::model::{MediaKind, ReportDraft, ReportId, UnixTimeMs};
use crate::queue::DeliveryFailure;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_REQUEST_BODY_SIZE: usize = 200 * 1024 * 1024;
pub const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
pub const REPORTS_PATH: &str = "api/reports";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying: network trouble, timeouts, 408/429/5xx.
    #[error("transient delivery failure: {reason}")]
    Transient { reason: String },

    #[error("delivery rejected: {reason}")]
    Rejected { status: Option<u16>, reason: String },
}

impl DeliveryError {
    pub fn transient(reason: impl Into<String>) -> Self {
        DeliveryError::Transient {
            reason: reason.into(),
        }
    }

    pub fn rejected(status: Option<u16>, reason: impl Into<String>) -> Self {
        DeliveryError::Rejected {
            status,
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }
}

impl From<DeliveryError> for DeliveryFailure {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::Transient { reason } => DeliveryFailure::Transient(reason),
            DeliveryError::Rejected { status, reason } => match status {
                Some(status) => DeliveryFailure::Rejected(format!("HTTP {status}: {reason}")),
                None => DeliveryFailure::Rejected(reason),
            },
        }
    }
}

/// Errors building an endpoint. Never produced during delivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("private network access blocked: {url} resolves to {host}")]
    PrivateNetworkBlocked { url: String, host: String },

    #[error("http client error: {0}")]
    Client(String),
}

/// Server acknowledgement of a delivered report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub server_id: String,
    pub received_at: UnixTimeMs,
}

// ============================================================================
// Wire payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    pub lat: f64,
    pub lon: f64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub file_name: String,
    pub mime_type: String,
    pub kind: MediaKind,
    pub size_bytes: u64,
    pub content_hash: String,
    /// Standard base64 of the staged bytes.
    pub data: String,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    pub client_id: String,
    pub reporter_name: String,
    pub reporter_email: String,
    pub description: String,
    pub hazard_type: String,
    pub location: Option<LocationPayload>,
    pub created_at: u64,
    pub media: Vec<MediaPayload>,
}

impl std::fmt::Debug for ReportPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportPayload")
            .field("client_id", &self.client_id)
            .field("hazard_type", &self.hazard_type)
            .field("location", &self.location)
            .field("media_count", &self.media.len())
            .finish_non_exhaustive()
    }
}

/// One delivery attempt, built fresh from the queued draft each time.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub report_id: ReportId,
    pub payload: ReportPayload,
}

impl DeliveryRequest {
    /// Build the request, reading staged media bytes back from disk.
    ///
    /// A staged file that vanished or no longer matches its hash can never
    /// be delivered, so that is a rejection rather than a transient failure.
    #[instrument(skip(draft), fields(report_id = %draft.id))]
    pub async fn from_draft(draft: &ReportDraft) -> Result<Self, DeliveryError> {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut media = Vec::with_capacity(draft.media.len());
        let mut total = 0usize;

        for item in &draft.media {
            let bytes = tokio::fs::read(&item.local_path).await.map_err(|e| {
                DeliveryError::rejected(
                    None,
                    format!("staged media {} unreadable: {e}", item.file_name),
                )
            })?;

            if blake3::hash(&bytes).to_hex().as_str() != item.content_hash {
                return Err(DeliveryError::rejected(
                    None,
                    format!("staged media {} changed on disk", item.file_name),
                ));
            }

            total = total.saturating_add(bytes.len());
            if total > MAX_REQUEST_BODY_SIZE {
                return Err(DeliveryError::rejected(
                    None,
                    format!("media exceeds {MAX_REQUEST_BODY_SIZE} bytes in total"),
                ));
            }

            media.push(MediaPayload {
                file_name: item.file_name.clone(),
                mime_type: item.mime_type.clone(),
                kind: item.kind,
                size_bytes: item.size_bytes,
                content_hash: item.content_hash.clone(),
                data: engine.encode(&bytes),
            });
        }

        let location = draft.location.map(|tag| {
            let accuracy_m = match tag.source {
                crate::model::LocationSource::Device { accuracy_m } => accuracy_m,
                crate::model::LocationSource::Manual => None,
            };
            LocationPayload {
                lat: tag.coordinate.lat(),
                lon: tag.coordinate.lon(),
                source: tag.source.name().to_string(),
                accuracy_m,
            }
        });

        debug!(media = media.len(), bytes = total, "delivery request built");

        Ok(Self {
            report_id: draft.id.clone(),
            payload: ReportPayload {
                client_id: draft.id.to_string(),
                reporter_name: draft.reporter_name.clone(),
                reporter_email: draft.reporter_email.clone(),
                description: draft.description.clone(),
                hazard_type: draft.hazard_type.wire_name().to_string(),
                location,
                created_at: draft.created_at.0,
                media,
            },
        })
    }

    pub fn idempotency_key(&self) -> &str {
        self.report_id.as_str()
    }
}

/// The remote endpoint that accepts reports.
#[async_trait::async_trait]
pub trait DeliveryEndpoint: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError>;
}

// ============================================================================
// HTTP endpoint
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Permit loopback and private-range hosts, for local development servers.
    pub allow_private_hosts: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "https://reports.coastwatch.example".into(),
            request_timeout_ms: 30_000,
            allow_private_hosts: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedUrl {
    url: Url,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: &str, allow_private: bool) -> Result<Self, EndpointError> {
        let invalid = |reason: String| EndpointError::InvalidUrl {
            url: truncate_url(url),
            reason,
        };

        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(invalid("URL cannot be empty".into()));
        }
        if trimmed.len() > MAX_URL_LENGTH {
            return Err(invalid(format!(
                "URL exceeds maximum length of {MAX_URL_LENGTH} bytes"
            )));
        }

        let parsed = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;

        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(invalid(format!(
                "invalid scheme '{scheme}', only 'http' and 'https' are allowed"
            )));
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid("credentials in URL are not allowed".into()));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| invalid("URL must have a host".into()))?
            .to_lowercase();

        if !allow_private && is_private_host(&host) {
            return Err(EndpointError::PrivateNetworkBlocked {
                url: truncate_url(url),
                host,
            });
        }

        Ok(Self { url: parsed, host })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Append a path below this URL, keeping any base path.
    pub fn join(&self, path: &str) -> Result<Url, EndpointError> {
        let mut base = self.url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path).map_err(|e| EndpointError::InvalidUrl {
            url: truncate_url(self.url.as_str()),
            reason: e.to_string(),
        })
    }
}

fn is_private_host(host: &str) -> bool {
    if matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]" | "0.0.0.0") {
        return true;
    }
    if host.ends_with(".local") || host.ends_with(".localhost") || host.ends_with(".internal") {
        return true;
    }
    if host.starts_with("10.") || host.starts_with("192.168.") || host.starts_with("169.254.") {
        return true;
    }
    if let Some(rest) = host.strip_prefix("172.") {
        if let Some(octet) = rest.split('.').next().and_then(|o| o.parse::<u8>().ok()) {
            return (16..=31).contains(&octet);
        }
    }
    host.starts_with("[fd") || host.starts_with("[fe80:")
}

fn truncate_url(url: &str) -> String {
    let mut out = url.to_string();
    if out.len() > 100 {
        crate::model::truncate_utf8_safe(&mut out, 100);
        out.push_str("...");
    }
    out
}

/// Map a non-success status to the failure class the queue understands.
pub fn classify_status(status: u16, body: &str) -> DeliveryError {
    let mut reason = body.trim().to_string();
    crate::model::truncate_utf8_safe(&mut reason, 200);
    if reason.is_empty() {
        reason = format!("HTTP {status}");
    }

    match status {
        408 | 429 => DeliveryError::transient(format!("HTTP {status}: {reason}")),
        500..=599 => DeliveryError::transient(format!("HTTP {status}: {reason}")),
        _ => DeliveryError::rejected(Some(status), reason),
    }
}

/// Read at most `cap` bytes of the body, chunk by chunk. The rest is never
/// pulled off the wire.
async fn read_capped(mut response: reqwest::Response, cap: usize) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = cap - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[derive(Deserialize)]
struct ServerAck {
    id: String,
}

/// Posts reports as JSON to `<base_url>/api/reports`.
pub struct HttpDeliveryEndpoint {
    client: reqwest::Client,
    reports_url: Url,
    timeout: Duration,
}

impl HttpDeliveryEndpoint {
    pub fn new(config: &EndpointConfig) -> Result<Self, EndpointError> {
        let base = ValidatedUrl::new(&config.base_url, config.allow_private_hosts)?;
        let timeout = Duration::from_millis(config.request_timeout_ms.max(1));
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if config.allow_private_hosts {
            // Private hosts are reached directly, never through a proxy.
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| EndpointError::Client(e.to_string()))?;

        Ok(Self {
            client,
            reports_url: base.join(REPORTS_PATH)?,
            timeout,
        })
    }

    pub fn reports_url(&self) -> &Url {
        &self.reports_url
    }
}

#[async_trait::async_trait]
impl DeliveryEndpoint for HttpDeliveryEndpoint {
    #[instrument(skip(self, request), fields(report_id = %request.report_id))]
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
        let response = self
            .client
            .post(self.reports_url.clone())
            .header(IDEMPOTENCY_HEADER, request.idempotency_key())
            .timeout(self.timeout)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    DeliveryError::rejected(None, e.to_string())
                } else {
                    DeliveryError::transient(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = read_capped(response, MAX_RESPONSE_BODY_SIZE)
            .await
            .map_err(|e| DeliveryError::transient(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(classify_status(status, &String::from_utf8_lossy(&body)));
        }

        let ack: ServerAck = serde_json::from_slice(&body).map_err(|e| {
            DeliveryError::rejected(Some(status), format!("malformed acknowledgement: {e}"))
        })?;
        if ack.id.trim().is_empty() {
            return Err(DeliveryError::rejected(
                Some(status),
                "acknowledgement without id",
            ));
        }

        debug!(status, server_id = %ack.id, "endpoint acknowledged report");
        Ok(DeliveryReceipt {
            server_id: ack.id,
            received_at: UnixTimeMs::now(),
        })
    }
}
