use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::crypto::{CryptoError, CryptoProvider};
use crate::model::{ReportDraft, ReportId, UnixTimeMs};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const ROW_MAGIC: &[u8; 4] = b"CRDR";
const MAX_ROW_BYTES: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted row {id}: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("integrity check failed for {id}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("row too large: {size} bytes, max {max}")]
    RowTooLarge { size: usize, max: usize },

    #[error("lock acquisition failed")]
    LockFailed,
}

impl StoreError {
    /// Id of the row this error is about, when it concerns a single row.
    pub fn row_id(&self) -> Option<&str> {
        match self {
            StoreError::Corrupted { id, .. } | StoreError::IntegrityCheckFailed { id, .. } => {
                Some(id)
            }
            _ => None,
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A queued draft together with its insertion position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredDraft {
    pub seq: u64,
    pub draft: ReportDraft,
}

/// Durable key-value persistence for the submission queue, keyed by report id.
///
/// The queue is the only writer. `load_all` returns per-row results so one
/// undecodable row does not take the whole queue down with it.
#[async_trait::async_trait]
pub trait DraftStorage: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Result<StoredDraft, StoreError>>, StoreError>;
    async fn save(&self, record: &StoredDraft) -> Result<(), StoreError>;
    async fn remove(&self, id: &ReportId) -> Result<bool, StoreError>;
    /// Remove the row and remember the id as delivered, atomically.
    async fn mark_delivered(&self, id: &ReportId, at: UnixTimeMs) -> Result<(), StoreError>;
    /// Most recently delivered ids, newest first.
    async fn load_delivered(&self, limit: usize) -> Result<Vec<ReportId>, StoreError>;
}

// ============================================================================
// Row codec
// ============================================================================

#[derive(Serialize, Deserialize, Debug)]
struct RowEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

pub(crate) fn encode_row(
    record: &StoredDraft,
    sealer: Option<&dyn CryptoProvider>,
) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(record, &mut payload)?;

    let envelope = RowEnvelope {
        magic: *ROW_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *blake3::hash(&payload).as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;

    match sealer {
        Some(sealer) => Ok(sealer.encrypt(&bytes, record.draft.id.as_str().as_bytes())?),
        None => Ok(bytes),
    }
}

/// Decode one row. Every failure names the row so it can be quarantined.
pub(crate) fn decode_row(
    id: &str,
    bytes: &[u8],
    sealer: Option<&dyn CryptoProvider>,
) -> Result<StoredDraft, StoreError> {
    decode_row_inner(id, bytes, sealer).map_err(|e| match e {
        StoreError::Corrupted { .. } | StoreError::IntegrityCheckFailed { .. } => e,
        other => StoreError::Corrupted {
            id: id.to_string(),
            reason: other.to_string(),
        },
    })
}

fn decode_row_inner(
    id: &str,
    bytes: &[u8],
    sealer: Option<&dyn CryptoProvider>,
) -> Result<StoredDraft, StoreError> {
    if bytes.len() > MAX_ROW_BYTES {
        return Err(StoreError::RowTooLarge {
            size: bytes.len(),
            max: MAX_ROW_BYTES,
        });
    }

    let opened;
    let bytes = match sealer {
        Some(sealer) => {
            opened = sealer.decrypt(bytes, id.as_bytes())?;
            &opened[..]
        }
        None => bytes,
    };

    let corrupted = |reason: String| StoreError::Corrupted {
        id: id.to_string(),
        reason,
    };

    let envelope: RowEnvelope =
        ciborium::from_reader(bytes).map_err(|e| corrupted(e.to_string()))?;

    if envelope.magic != *ROW_MAGIC {
        return Err(corrupted("invalid magic bytes".into()));
    }
    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            id: id.to_string(),
            expected: hex::encode(envelope.checksum),
            actual: actual.to_hex().to_string(),
        });
    }

    let record: StoredDraft =
        ciborium::from_reader(&envelope.payload[..]).map_err(|e| corrupted(e.to_string()))?;

    if record.draft.id.as_str() != id {
        return Err(corrupted(format!(
            "row key does not match payload id {}",
            record.draft.id
        )));
    }
    Ok(record)
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite-backed storage. One row per draft, CBOR-encoded and checksummed,
/// optionally sealed.
#[cfg(not(target_arch = "wasm32"))]
pub struct SqliteDraftStorage {
    conn: Mutex<rusqlite::Connection>,
    sealer: Option<Arc<dyn CryptoProvider>>,
}

#[cfg(not(target_arch = "wasm32"))]
impl SqliteDraftStorage {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        Self::init(rusqlite::Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS drafts (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                status TEXT NOT NULL,
                data BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_drafts_seq ON drafts(seq);

            CREATE TABLE IF NOT EXISTS delivered (
                id TEXT PRIMARY KEY,
                delivered_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_delivered_at ON delivered(delivered_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            sealer: None,
        })
    }

    /// Seal every row written from now on. Rows written without a sealer
    /// will no longer decode and are quarantined on the next load.
    #[must_use]
    pub fn with_sealer(mut self, sealer: Arc<dyn CryptoProvider>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockFailed)
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait::async_trait]
impl DraftStorage for SqliteDraftStorage {
    async fn load_all(&self) -> Result<Vec<Result<StoredDraft, StoreError>>, StoreError> {
        let rows: Vec<(String, Vec<u8>)> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT id, data FROM drafts ORDER BY seq ASC")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect::<Result<_, _>>()?
        };

        Ok(rows
            .into_iter()
            .map(|(id, data)| decode_row(&id, &data, self.sealer.as_deref()))
            .collect())
    }

    async fn save(&self, record: &StoredDraft) -> Result<(), StoreError> {
        let data = encode_row(record, self.sealer.as_deref())?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO drafts (id, seq, status, data, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                seq = excluded.seq,
                status = excluded.status,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![
                record.draft.id.as_str(),
                record.seq as i64,
                record.draft.status.name(),
                data,
                UnixTimeMs::now().0 as i64,
            ],
        )?;
        Ok(())
    }

    async fn remove(&self, id: &ReportId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM drafts WHERE id = ?1", [id.as_str()])?;
        Ok(removed > 0)
    }

    async fn mark_delivered(&self, id: &ReportId, at: UnixTimeMs) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM drafts WHERE id = ?1", [id.as_str()])?;
        tx.execute(
            "INSERT OR REPLACE INTO delivered (id, delivered_at) VALUES (?1, ?2)",
            rusqlite::params![id.as_str(), at.0 as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn load_delivered(&self, limit: usize) -> Result<Vec<ReportId>, StoreError> {
        let raw: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt =
                conn.prepare("SELECT id FROM delivered ORDER BY delivered_at DESC LIMIT ?1")?;
            let mapped = stmt.query_map([limit as i64], |row| row.get(0))?;
            mapped.collect::<Result<_, _>>()?
        };

        Ok(raw
            .into_iter()
            .filter_map(|id| ReportId::new(id).ok())
            .collect())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    rows: HashMap<String, (u64, Vec<u8>)>,
    delivered: Vec<(ReportId, UnixTimeMs)>,
}

/// Process-lifetime storage. Rows go through the same codec as SQLite, so a
/// clone of the `Arc` survives a simulated restart of the queue.
#[derive(Default)]
pub struct MemoryDraftStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryDraftStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, id: &str, seq: u64, bytes: Vec<u8>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.rows.insert(id.to_string(), (seq, bytes));
        }
    }

    fn inner(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockFailed)
    }
}

#[async_trait::async_trait]
impl DraftStorage for MemoryDraftStorage {
    async fn load_all(&self) -> Result<Vec<Result<StoredDraft, StoreError>>, StoreError> {
        let inner = self.inner()?;
        let mut rows: Vec<_> = inner.rows.iter().collect();
        rows.sort_by_key(|(_, (seq, _))| *seq);
        Ok(rows
            .into_iter()
            .map(|(id, (_, data))| decode_row(id, data, None))
            .collect())
    }

    async fn save(&self, record: &StoredDraft) -> Result<(), StoreError> {
        let data = encode_row(record, None)?;
        self.inner()?
            .rows
            .insert(record.draft.id.as_str().to_string(), (record.seq, data));
        Ok(())
    }

    async fn remove(&self, id: &ReportId) -> Result<bool, StoreError> {
        Ok(self.inner()?.rows.remove(id.as_str()).is_some())
    }

    async fn mark_delivered(&self, id: &ReportId, at: UnixTimeMs) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        inner.rows.remove(id.as_str());
        inner.delivered.retain(|(existing, _)| existing != id);
        inner.delivered.push((id.clone(), at));
        Ok(())
    }

    async fn load_delivered(&self, limit: usize) -> Result<Vec<ReportId>, StoreError> {
        let inner = self.inner()?;
        let mut delivered = inner.delivered.clone();
        delivered.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(delivered
            .into_iter()
            .take(limit)
            .map(|(id, _)| id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SealingKey;
    use crate::model::{DraftStatus, HazardType};
    use tempfile::tempdir;

    fn sample(id: &str, seq: u64) -> StoredDraft {
        StoredDraft {
            seq,
            draft: ReportDraft {
                id: ReportId::new(id).unwrap(),
                reporter_name: "Jane Smith".into(),
                reporter_email: "jane@phone.com".into(),
                description: "Flooding near the pier".into(),
                hazard_type: HazardType::Flood,
                location: None,
                media: Vec::new(),
                created_at: UnixTimeMs(1_000),
                status: DraftStatus::Queued,
                attempts: 0,
                last_error: None,
                next_attempt_at: None,
                retry_budget_used: 0,
                failure: None,
            },
        }
    }

    fn sealer() -> Arc<dyn CryptoProvider> {
        Arc::new(SealingKey::from_bytes(&[3u8; 32]).unwrap())
    }

    #[test]
    fn row_codec_detects_tampering() {
        let record = sample("r1", 1);
        let mut bytes = encode_row(&record, None).unwrap();
        assert_eq!(decode_row("r1", &bytes, None).unwrap(), record);

        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(decode_row("r1", &bytes, None).is_err());
    }

    #[test]
    fn row_codec_rejects_mismatched_key() {
        let bytes = encode_row(&sample("r1", 1), None).unwrap();
        assert!(matches!(
            decode_row("r2", &bytes, None),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn sealed_rows_are_bound_to_their_id() {
        let sealer = sealer();
        let bytes = encode_row(&sample("r1", 1), Some(sealer.as_ref())).unwrap();
        assert!(!bytes.windows(14).any(|w| w == b"jane@phone.com"));
        assert!(decode_row("r1", &bytes, Some(sealer.as_ref())).is_ok());
        let err = decode_row("r2", &bytes, Some(sealer.as_ref())).unwrap_err();
        assert_eq!(err.row_id(), Some("r2"));
        assert!(err.to_string().contains("authentication failed"));
    }

    #[tokio::test]
    async fn sqlite_roundtrip_in_seq_order() {
        let storage = SqliteDraftStorage::open_in_memory().unwrap();
        storage.save(&sample("b", 2)).await.unwrap();
        storage.save(&sample("a", 1)).await.unwrap();

        let mut updated = sample("b", 2);
        updated.draft.attempts = 3;
        storage.save(&updated).await.unwrap();

        let loaded: Vec<_> = storage
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].draft.id.as_str(), "a");
        assert_eq!(loaded[1].draft.attempts, 3);
    }

    #[tokio::test]
    async fn sqlite_mark_delivered_tombstones() {
        let storage = SqliteDraftStorage::open_in_memory().unwrap();
        storage.save(&sample("a", 1)).await.unwrap();
        let id = ReportId::new("a").unwrap();

        storage.mark_delivered(&id, UnixTimeMs(5)).await.unwrap();

        assert!(storage.load_all().await.unwrap().is_empty());
        assert_eq!(storage.load_delivered(10).await.unwrap(), vec![id.clone()]);
        assert!(!storage.remove(&id).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_survives_reopen_with_sealer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let sealer = sealer();

        {
            let storage = SqliteDraftStorage::open(&path)
                .unwrap()
                .with_sealer(sealer.clone());
            storage.save(&sample("a", 1)).await.unwrap();
        }

        let storage = SqliteDraftStorage::open(&path).unwrap().with_sealer(sealer);
        let loaded = storage.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].as_ref().unwrap().draft.reporter_email, "jane@phone.com");

        let unsealed = SqliteDraftStorage::open(&path).unwrap();
        let loaded = unsealed.load_all().await.unwrap();
        assert!(loaded[0].is_err());
    }

    #[tokio::test]
    async fn memory_storage_matches_sqlite_semantics() {
        let storage = MemoryDraftStorage::new();
        storage.save(&sample("b", 2)).await.unwrap();
        storage.save(&sample("a", 1)).await.unwrap();
        assert_eq!(storage.len(), 2);

        let loaded = storage.load_all().await.unwrap();
        assert_eq!(loaded[0].as_ref().unwrap().draft.id.as_str(), "a");

        let id = ReportId::new("a").unwrap();
        storage.mark_delivered(&id, UnixTimeMs(9)).await.unwrap();
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.load_delivered(5).await.unwrap(), vec![id]);
    }
}
