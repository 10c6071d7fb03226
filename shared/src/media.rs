//! Staging of photo and video attachments.
//!
//! Attachments are copied into an app-owned staging directory before the
//! report is queued, so the queue only ever holds handles and paths. Each
//! handle belongs to one report; releasing the report closes it, and a
//! staging task that finishes afterwards deletes its own file instead of
//! registering it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::{MediaHandle, MediaKind, MediaRef, ReportId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("unsupported media type: {mime}")]
    UnsupportedType { mime: String },

    #[error("{file_name} is empty")]
    Empty { file_name: String },

    #[error("{file_name} is too large: {size} bytes, max {max}")]
    TooLarge {
        file_name: String,
        size: u64,
        max: u64,
    },

    #[error("io error: {0}")]
    Io(String),

    #[error("staging cancelled")]
    Cancelled,

    #[error("unknown media handle: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for MediaError {
    fn from(e: std::io::Error) -> Self {
        MediaError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub staging_dir: PathBuf,
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
    /// Longest edge of generated previews. Zero disables previews.
    pub thumbnail_px: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join("coastal-report").join("media"),
            max_image_bytes: 10 * 1024 * 1024,
            max_video_bytes: 100 * 1024 * 1024,
            thumbnail_px: 256,
        }
    }
}

impl MediaConfig {
    pub fn max_bytes(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Image => self.max_image_bytes,
            MediaKind::Video => self.max_video_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Bytes(Bytes),
    Path(PathBuf),
}

/// An attachment as picked by the reporter, before staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub file_name: String,
    pub mime_type: String,
    pub source: MediaSource,
}

impl MediaFile {
    pub fn from_bytes(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            source: MediaSource::Bytes(data.into()),
        }
    }

    pub fn from_path(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            source: MediaSource::Path(path.into()),
        }
    }
}

struct Staged {
    owner: ReportId,
    paths: Vec<PathBuf>,
}

/// Released owners remembered so a late staging task cannot resurrect them.
/// Only tasks aborted moments ago can race a release, so recent owners are
/// enough.
const CLOSED_OWNERS: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

struct Registry {
    handles: HashMap<MediaHandle, Staged>,
    closed: lru::LruCache<ReportId, ()>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            handles: HashMap::new(),
            closed: lru::LruCache::new(CLOSED_OWNERS),
        }
    }
}

/// Deletes staged files unless disarmed. Covers both error returns and a
/// staging future dropped mid-write.
struct PartialFiles {
    paths: Vec<PathBuf>,
}

impl PartialFiles {
    fn new() -> Self {
        Self { paths: Vec::new() }
    }

    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn disarm(mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.paths)
    }
}

impl Drop for PartialFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "failed to remove partial media: {}", e);
                }
            }
        }
    }
}

pub struct MediaStager {
    config: MediaConfig,
    registry: Mutex<Registry>,
}

impl MediaStager {
    pub fn new(config: MediaConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy an attachment into the staging directory and register a handle
    /// owned by `owner`.
    #[instrument(skip(self, file), fields(report_id = %owner, mime = %file.mime_type))]
    pub async fn stage(&self, owner: &ReportId, file: MediaFile) -> Result<MediaRef, MediaError> {
        let kind = MediaKind::from_mime(&file.mime_type).ok_or_else(|| {
            MediaError::UnsupportedType {
                mime: file.mime_type.clone(),
            }
        })?;

        if self.registry().closed.contains(owner) {
            return Err(MediaError::Cancelled);
        }

        let max = self.config.max_bytes(kind);
        let declared = match &file.source {
            MediaSource::Bytes(data) => data.len() as u64,
            MediaSource::Path(path) => tokio::fs::metadata(path).await?.len(),
        };
        check_size(&file.file_name, declared, max)?;

        tokio::fs::create_dir_all(&self.config.staging_dir).await?;

        let handle = MediaHandle::generate();
        let local_path = self
            .config
            .staging_dir
            .join(format!("{}.{}", handle, extension(&file.file_name, kind)));

        let mut guard = PartialFiles::new();
        guard.track(local_path.clone());

        let size_bytes = match &file.source {
            MediaSource::Bytes(data) => {
                tokio::fs::write(&local_path, data).await?;
                data.len() as u64
            }
            MediaSource::Path(source) => tokio::fs::copy(source, &local_path).await?,
        };
        // The source file may have changed between stat and copy.
        check_size(&file.file_name, size_bytes, max)?;

        let thumbnail_px = match kind {
            MediaKind::Image => self.config.thumbnail_px,
            MediaKind::Video => 0,
        };
        let (content_hash, preview) = {
            let path = local_path.clone();
            tokio::task::spawn_blocking(move || digest_and_preview(&path, thumbnail_px))
                .await
                .map_err(|e| MediaError::Io(format!("staging task failed: {e}")))??
        };

        let preview_path = match preview {
            Some(png) => {
                let path = self.config.staging_dir.join(format!("{handle}.preview.png"));
                guard.track(path.clone());
                tokio::fs::write(&path, png).await?;
                Some(path)
            }
            None => None,
        };

        {
            let mut registry = self.registry();
            if registry.closed.contains(owner) {
                debug!("owner released while staging, discarding file");
                return Err(MediaError::Cancelled);
            }
            let paths = guard.disarm();
            registry.handles.insert(
                handle.clone(),
                Staged {
                    owner: owner.clone(),
                    paths,
                },
            );
        }

        info!(handle = %handle, size_bytes, "media staged");

        Ok(MediaRef {
            handle,
            file_name: file.file_name,
            mime_type: file.mime_type.trim().to_ascii_lowercase(),
            kind,
            size_bytes,
            content_hash,
            local_path,
            preview_path,
        })
    }

    /// Drop a single staged attachment.
    #[instrument(skip(self))]
    pub async fn unstage(&self, handle: &MediaHandle) -> Result<(), MediaError> {
        let staged = self
            .registry()
            .handles
            .remove(handle)
            .ok_or_else(|| MediaError::NotFound(handle.to_string()))?;
        remove_files(&staged.paths).await;
        Ok(())
    }

    /// Release every handle owned by `owner` and refuse further staging for it.
    /// Returns the number of handles released.
    #[instrument(skip(self))]
    pub async fn release_owner(&self, owner: &ReportId) -> usize {
        let released: Vec<Staged> = {
            let mut registry = self.registry();
            registry.closed.put(owner.clone(), ());
            let handles: Vec<MediaHandle> = registry
                .handles
                .iter()
                .filter(|(_, staged)| &staged.owner == owner)
                .map(|(handle, _)| handle.clone())
                .collect();
            handles
                .iter()
                .filter_map(|handle| registry.handles.remove(handle))
                .collect()
        };

        for staged in &released {
            remove_files(&staged.paths).await;
        }
        if !released.is_empty() {
            info!(count = released.len(), "released staged media");
        }
        released.len()
    }

    /// Delete the files behind `refs`, registered or not. Used once a report
    /// is delivered or removed from the queue, possibly after a restart.
    pub async fn release_refs(&self, refs: &[MediaRef]) -> usize {
        {
            let mut registry = self.registry();
            for media in refs {
                registry.handles.remove(&media.handle);
            }
        }

        let mut paths = Vec::new();
        for media in refs {
            paths.push(media.local_path.clone());
            paths.extend(media.preview_path.clone());
        }
        remove_files(&paths).await;
        refs.len()
    }

    /// Re-register handles of a queued report after a restart.
    pub fn adopt(&self, owner: &ReportId, refs: &[MediaRef]) -> usize {
        let mut registry = self.registry();
        let mut adopted = 0;
        for media in refs {
            if !media.local_path.exists() {
                warn!(handle = %media.handle, "staged media missing on disk");
                continue;
            }
            let mut paths = vec![media.local_path.clone()];
            paths.extend(media.preview_path.clone());
            registry.handles.insert(
                media.handle.clone(),
                Staged {
                    owner: owner.clone(),
                    paths,
                },
            );
            adopted += 1;
        }
        adopted
    }

    /// Live handles across all owners.
    pub fn outstanding(&self) -> usize {
        self.registry().handles.len()
    }

    pub fn outstanding_for(&self, owner: &ReportId) -> usize {
        self.registry()
            .handles
            .values()
            .filter(|staged| &staged.owner == owner)
            .count()
    }
}

fn check_size(file_name: &str, size: u64, max: u64) -> Result<(), MediaError> {
    if size == 0 {
        return Err(MediaError::Empty {
            file_name: file_name.to_string(),
        });
    }
    if size > max {
        return Err(MediaError::TooLarge {
            file_name: file_name.to_string(),
            size,
            max,
        });
    }
    Ok(())
}

fn extension(file_name: &str, kind: MediaKind) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| match kind {
            MediaKind::Image => "img".into(),
            MediaKind::Video => "vid".into(),
        })
}

async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "failed to remove staged media: {}", e);
            }
        }
    }
}

/// Hash the staged file and, for images, render a PNG preview. Runs on the
/// blocking pool. A preview that cannot be produced is logged and skipped.
fn digest_and_preview(path: &Path, thumbnail_px: u32) -> Result<(String, Option<Vec<u8>>), MediaError> {
    let mut hasher = blake3::Hasher::new();
    let mut file = std::fs::File::open(path)?;
    hasher.update_reader(&mut file)?;
    let hash = hasher.finalize().to_hex().to_string();

    let preview = if thumbnail_px == 0 {
        None
    } else {
        match render_preview(path, thumbnail_px) {
            Ok(png) => png,
            Err(reason) => {
                warn!(path = %path.display(), "preview skipped: {}", reason);
                None
            }
        }
    };

    Ok((hash, preview))
}

#[cfg(feature = "thumbnails")]
fn render_preview(path: &Path, thumbnail_px: u32) -> Result<Option<Vec<u8>>, String> {
    use std::io::Cursor;

    const MAX_DIMENSION: u32 = 15_000;
    const MAX_ALLOC_BYTES: u64 = 512 * 1024 * 1024;

    let mut reader = image::ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| e.to_string())?;
    if reader.format().is_none() {
        return Err("unrecognized image format".into());
    }

    let mut limits = image::Limits::default();
    limits.max_image_width = Some(MAX_DIMENSION);
    limits.max_image_height = Some(MAX_DIMENSION);
    limits.max_alloc = Some(MAX_ALLOC_BYTES);
    reader.limits(limits);

    let img = reader.decode().map_err(|e| e.to_string())?;
    let thumb = img.thumbnail(thumbnail_px, thumbnail_px);

    let mut out = Cursor::new(Vec::new());
    thumb
        .write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| e.to_string())?;
    Ok(Some(out.into_inner()))
}

#[cfg(not(feature = "thumbnails"))]
fn render_preview(_path: &Path, _thumbnail_px: u32) -> Result<Option<Vec<u8>>, String> {
    Ok(None)
}
