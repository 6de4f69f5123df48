//! Durable sketch snapshots and the policy layer around them.
//!
//! A flush writes one complete `DurabilityRecord` (header, monotonic
//! version, CRC-framed sketch payload) through a `SnapshotStore`. The file
//! store's atomic mode stages the record in a temp file, fsyncs it, renames
//! it over the target and fsyncs the directory, so a reader never observes
//! a torn snapshot; non-atomic mode trades that guarantee for one less
//! rename. Restart recovery loads the latest complete record and resumes
//! from its version.
//!
//! `DurabilityController` maps the configured level onto mutations:
//! `none` skips persistence, `sync` commits before a mutation is
//! acknowledged, `async` marks state dirty for the interval committer and
//! applies the configured backpressure once too many mutations are
//! unflushed. Flush failures retry with backoff; exhausting the retries
//! flips the node into read-only degradation instead of dropping data
//! silently.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use crate::config::{Backpressure, DurabilityLevel, NodeConfig};
use crate::error::NodeError;

/// SNAPSHOT_FORMAT_VERSION is bumped on any incompatible record change.
pub const SNAPSHOT_FORMAT_VERSION: u8 = 1;

/// TMP_EXTENSION is the suffix of the staging file used by atomic replace.
const TMP_EXTENSION: &str = "tmp";

/// Base delay between flush retries; doubles per attempt.
const FLUSH_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// One durable snapshot of sketch state. Local crash recovery only; never
/// transmitted to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurabilityRecord {
    /// Monotonically increasing flush counter.
    pub version: u64,
    /// Canonical sketch encoding.
    pub sketch: Vec<u8>,
}

impl DurabilityRecord {
    /// encode frames the record: format version, flush version, payload
    /// length, payload, then a CRC32 over everything before it.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 8 + 4 + self.sketch.len() + 4);
        buf.put_u8(SNAPSHOT_FORMAT_VERSION);
        buf.put_u64(self.version);
        buf.put_u32(self.sketch.len() as u32);
        buf.extend_from_slice(&self.sketch);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf
    }

    pub fn decode(data: &[u8]) -> io::Result<Self> {
        let malformed = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);
        if data.len() < 1 + 8 + 4 + 4 {
            return Err(malformed(format!("snapshot too short: {} bytes", data.len())));
        }
        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let want = u32::from_be_bytes(crc_bytes.try_into().unwrap());
        let got = crc32fast::hash(body);
        if want != got {
            return Err(malformed(format!(
                "snapshot crc mismatch: got {:#010x}, exp {:#010x}",
                got, want
            )));
        }
        let mut cursor = body;
        let format = cursor.get_u8();
        if format != SNAPSHOT_FORMAT_VERSION {
            return Err(malformed(format!("unsupported snapshot format {}", format)));
        }
        let version = cursor.get_u64();
        let len = cursor.get_u32() as usize;
        if cursor.remaining() != len {
            return Err(malformed(format!(
                "snapshot payload is {} bytes, exp {}",
                cursor.remaining(),
                len
            )));
        }
        Ok(Self {
            version,
            sketch: cursor.to_vec(),
        })
    }
}

/// SnapshotStore is the opaque persistence boundary: something that can
/// durably keep the latest record and give it back after a restart.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn persist(&self, record: &DurabilityRecord) -> io::Result<()>;

    /// load_latest returns the most recent complete record, or None when
    /// nothing has ever been flushed.
    async fn load_latest(&self) -> io::Result<Option<DurabilityRecord>>;
}

/// File-backed snapshot store. One file holds the latest record; atomic
/// mode replaces it via rename so every observable state of the path is a
/// complete record.
pub struct FileSnapshotStore {
    path: PathBuf,
    atomic_replace: bool,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>, atomic_replace: bool) -> Self {
        Self {
            path: path.into(),
            atomic_replace,
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push("_.");
        name.push(TMP_EXTENSION);
        self.path.with_file_name(name)
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    async fn write_atomic(&self, data: &[u8]) -> io::Result<()> {
        let tmp = self.tmp_path();
        let result = async {
            let mut f = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)
                .await?;
            f.write_all(data).await?;
            f.flush().await?;
            f.sync_all().await?;
            drop(f);
            tokio::fs::rename(&tmp, &self.path).await?;
            // The rename itself must survive a crash too.
            let dir = tokio::fs::File::open(self.parent_dir()).await?;
            dir.sync_all().await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(tmp = %tmp.display(), error = %e, "failed to clean up staging file");
                }
            }
        }
        result
    }

    async fn write_in_place(&self, data: &[u8]) -> io::Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)
            .await?;
        f.write_all(data).await?;
        f.flush().await?;
        f.sync_all().await
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn persist(&self, record: &DurabilityRecord) -> io::Result<()> {
        let data = record.encode();
        if self.atomic_replace {
            self.write_atomic(&data).await
        } else {
            self.write_in_place(&data).await
        }
    }

    async fn load_latest(&self) -> io::Result<Option<DurabilityRecord>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        DurabilityRecord::decode(&data).map(Some)
    }
}

/// DurabilityController owns the level policy, the flush version, the
/// dirty/pending bookkeeping and the degraded gate. It holds no sketch
/// state; the aggregator hands it encoded snapshots at commit points.
pub struct DurabilityController {
    level: DurabilityLevel,
    store: Option<Arc<dyn SnapshotStore>>,
    version: AtomicU64,
    dirty: AtomicBool,
    /// Mutations acknowledged but not yet flushed (async level only).
    pending: AtomicU64,
    degraded: AtomicBool,
    flushed: Notify,
    flush_retries: u32,
    max_pending: u64,
    backpressure: Backpressure,
    /// How long a blocked insert waits for the committer before giving up.
    block_wait: Duration,
}

impl DurabilityController {
    pub fn new(config: &NodeConfig, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        debug_assert!(
            !config.durability.is_durable() || store.is_some(),
            "durable level without a snapshot store"
        );
        Self {
            level: config.durability,
            store,
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            pending: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            flushed: Notify::new(),
            flush_retries: config.flush_retries,
            max_pending: config.max_pending,
            backpressure: config.backpressure,
            block_wait: config.flush_interval.saturating_mul(2),
        }
    }

    pub fn level(&self) -> DurabilityLevel {
        self.level
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// recover loads the latest record, resumes its version, and returns
    /// the stored sketch bytes. A corrupt record is an error, not a silent
    /// empty start.
    pub async fn recover(&self) -> Result<Option<Vec<u8>>, NodeError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.load_latest().await? {
            Some(record) => {
                self.version.store(record.version, Ordering::Release);
                tracing::info!(version = record.version, "recovered durable sketch snapshot");
                Ok(Some(record.sketch))
            }
            None => Ok(None),
        }
    }

    /// admit gates an insert before it mutates the sketch. Under async
    /// durability with a full pending queue this is where the configured
    /// backpressure bites.
    pub async fn admit(&self) -> Result<(), NodeError> {
        if self.is_degraded() {
            return Err(NodeError::ReadOnly);
        }
        if self.level != DurabilityLevel::Async {
            return Ok(());
        }
        let mut pending = self.pending.load(Ordering::Acquire);
        if pending < self.max_pending {
            return Ok(());
        }
        if self.backpressure == Backpressure::Block {
            // Bounded wait for the committer to drain, then re-check once.
            let _ = tokio::time::timeout(self.block_wait, self.flushed.notified()).await;
            pending = self.pending.load(Ordering::Acquire);
            if pending < self.max_pending {
                return Ok(());
            }
        }
        Err(NodeError::Overloaded(pending))
    }

    /// after_mutation runs with the sketch write lock held, right after a
    /// register changed. `snapshot` is the already-encoded new state; it is
    /// only written under sync durability.
    pub async fn after_mutation(&self, snapshot: &[u8]) -> Result<(), NodeError> {
        match self.level {
            DurabilityLevel::None => Ok(()),
            DurabilityLevel::Async => {
                self.pending.fetch_add(1, Ordering::AcqRel);
                self.dirty.store(true, Ordering::Release);
                Ok(())
            }
            DurabilityLevel::Sync => self.commit(snapshot).await,
        }
    }

    /// flush_if_dirty is the interval committer's entry point. Returns
    /// whether a flush happened.
    pub async fn flush_if_dirty(&self, snapshot: &[u8]) -> Result<bool, NodeError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.commit(snapshot).await?;
        Ok(true)
    }

    /// commit persists one complete record, retrying with backoff. On
    /// exhaustion the node degrades to read-only and the failure is
    /// surfaced to the operator; it is never swallowed.
    pub async fn commit(&self, snapshot: &[u8]) -> Result<(), NodeError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let record = DurabilityRecord {
            version: self.version() + 1,
            sketch: snapshot.to_vec(),
        };
        let mut backoff = FLUSH_RETRY_BACKOFF;
        let mut last_err = None;
        for attempt in 0..self.flush_retries.max(1) {
            match store.persist(&record).await {
                Ok(()) => {
                    self.version.store(record.version, Ordering::Release);
                    self.dirty.store(false, Ordering::Release);
                    self.pending.store(0, Ordering::Release);
                    self.flushed.notify_waiters();
                    tracing::debug!(version = record.version, "flushed sketch snapshot");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "sketch snapshot flush failed"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
        self.degraded.store(true, Ordering::Release);
        let err = last_err.map(|e| e.to_string()).unwrap_or_default();
        tracing::error!(
            error = %err,
            "durability flush retries exhausted; node entering read-only mode"
        );
        Err(NodeError::Durability(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn record(version: u64) -> DurabilityRecord {
        DurabilityRecord {
            version,
            sketch: vec![1, 14, 1, 0],
        }
    }

    #[test]
    fn test_record_round_trip() {
        let r = record(42);
        let decoded = DurabilityRecord::decode(&r.encode()).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn test_record_rejects_corruption() {
        let mut data = record(7).encode();
        // Flip one payload bit; the CRC must catch it.
        data[10] ^= 0x01;
        assert!(DurabilityRecord::decode(&data).is_err());

        let data = record(7).encode();
        for len in 0..data.len() {
            assert!(
                DurabilityRecord::decode(&data[..len]).is_err(),
                "decode of {}-byte prefix succeeded",
                len
            );
        }
    }

    #[tokio::test]
    async fn test_file_store_round_trip_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("sketch.bin"), true);
        assert!(store.load_latest().await.unwrap().is_none());

        store.persist(&record(1)).await.unwrap();
        store.persist(&record(2)).await.unwrap();
        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.version, 2);

        // The staging file never outlives a successful flush.
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn test_file_store_round_trip_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("sketch.bin"), false);
        store.persist(&record(9)).await.unwrap();
        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.version, 9);
    }

    #[tokio::test]
    async fn test_file_store_rejects_torn_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sketch.bin");
        let store = FileSnapshotStore::new(path.clone(), true);
        store.persist(&record(1)).await.unwrap();

        let mut data = tokio::fs::read(&path).await.unwrap();
        data.truncate(data.len() - 2);
        tokio::fs::write(&path, &data).await.unwrap();
        assert!(store.load_latest().await.is_err());
    }

    fn controller(level: DurabilityLevel, store: Option<Arc<dyn SnapshotStore>>) -> DurabilityController {
        let config = NodeConfig {
            durability: level,
            sketch_file: Some("ignored".into()),
            flush_retries: 2,
            max_pending: 4,
            backpressure: Backpressure::Reject,
            flush_interval: Duration::from_millis(10),
            ..NodeConfig::default()
        };
        DurabilityController::new(&config, store)
    }

    #[tokio::test]
    async fn test_sync_commit_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> =
            Arc::new(FileSnapshotStore::new(dir.path().join("s.bin"), true));
        let ctl = controller(DurabilityLevel::Sync, Some(store.clone()));

        ctl.after_mutation(&[1, 2, 3]).await.unwrap();
        ctl.after_mutation(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(ctl.version(), 2);
        assert!(!ctl.is_dirty());
        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.sketch, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_async_marks_dirty_and_committer_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> =
            Arc::new(FileSnapshotStore::new(dir.path().join("s.bin"), true));
        let ctl = controller(DurabilityLevel::Async, Some(store.clone()));

        ctl.after_mutation(&[5]).await.unwrap();
        assert!(ctl.is_dirty());
        assert_eq!(ctl.version(), 0, "async must not flush inline");

        assert!(ctl.flush_if_dirty(&[5]).await.unwrap());
        assert!(!ctl.is_dirty());
        assert_eq!(ctl.version(), 1);

        // Clean state flushes nothing.
        assert!(!ctl.flush_if_dirty(&[5]).await.unwrap());
    }

    #[tokio::test]
    async fn test_backpressure_rejects_past_bound() {
        let ctl = controller(DurabilityLevel::Async, Some(failing_store()));
        for _ in 0..4 {
            ctl.admit().await.unwrap();
            ctl.after_mutation(&[0]).await.unwrap();
        }
        match ctl.admit().await {
            Err(NodeError::Overloaded(n)) => assert_eq!(n, 4),
            other => panic!("unexpected admit result: {:?}", other.err()),
        }
    }

    struct FailingStore;

    #[async_trait]
    impl SnapshotStore for FailingStore {
        async fn persist(&self, _record: &DurabilityRecord) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }

        async fn load_latest(&self) -> io::Result<Option<DurabilityRecord>> {
            Ok(None)
        }
    }

    fn failing_store() -> Arc<dyn SnapshotStore> {
        Arc::new(FailingStore)
    }

    #[tokio::test]
    async fn test_flush_exhaustion_degrades_node() {
        let ctl = controller(DurabilityLevel::Sync, Some(failing_store()));
        let err = ctl.after_mutation(&[1]).await.unwrap_err();
        assert!(matches!(err, NodeError::Durability(_)));
        assert!(ctl.is_degraded());
        assert!(matches!(ctl.admit().await, Err(NodeError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_recover_resumes_version() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> =
            Arc::new(FileSnapshotStore::new(dir.path().join("s.bin"), true));
        store
            .persist(&DurabilityRecord {
                version: 17,
                sketch: vec![9, 9],
            })
            .await
            .unwrap();

        let ctl = controller(DurabilityLevel::Sync, Some(store));
        let sketch = ctl.recover().await.unwrap().unwrap();
        assert_eq!(sketch, vec![9, 9]);
        assert_eq!(ctl.version(), 17);
    }
}
