//! Content-addressed blob storage with deduplication and reference counting.
//!
//! [`BlobStore`] owns physical payload bytes, keyed by the hex SHA-256
//! digest of the content. Identical payloads are stored once; each stored
//! blob tracks two counters:
//!
//! - `refcount`: the number of committed object versions referencing the
//!   hash, adjusted only through [`HoldGuard::commit`] and
//!   [`BlobStore::decref`].
//! - `holds`: provisional references owned by in-flight operations
//!   (pending commits, multipart parts) that keep a blob alive before any
//!   version references it.
//!
//! A blob is garbage-collected by [`BlobStore::sweep`] only when both
//! counters are zero. All counter mutations and the sweep's zero check run
//! under the same per-hash map lock, so a concurrent increment can never
//! race a deletion into a half-visible state: callers either observe the
//! blob present with a positive count or fully absent.
//!
//! Payloads below a configurable threshold are kept in memory as
//! [`Bytes`]; larger payloads are spilled to temporary files, so bodies
//! larger than available memory are supported through
//! [`BlobStore::put_stream`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, trace, warn};

use crate::checksums::{self, ContentHasher};
use crate::error::{EngineError, EngineResult};

/// Default maximum payload size (in bytes) kept in memory before spilling
/// to disk. 512 KiB.
const DEFAULT_SPILL_THRESHOLD: usize = 524_288;

/// Chunk size for streamed reads of spilled payloads. 64 KiB.
const STREAM_CHUNK_SIZE: usize = 65_536;

// ---------------------------------------------------------------------------
// StoredData
// ---------------------------------------------------------------------------

/// Internal representation of stored payload bytes.
///
/// Small payloads stay in memory. Large payloads live in a spill file that
/// is removed when the entry is dropped.
enum StoredData {
    /// Payload kept entirely in memory.
    InMemory {
        /// The raw payload bytes.
        data: Bytes,
    },
    /// Payload spilled to a file on disk.
    OnDisk {
        /// Path to the spill file.
        path: PathBuf,
        /// Size of the stored payload in bytes.
        size: u64,
    },
}

impl std::fmt::Debug for StoredData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InMemory { data } => f
                .debug_struct("InMemory")
                .field("size", &data.len())
                .finish(),
            Self::OnDisk { path, size } => f
                .debug_struct("OnDisk")
                .field("path", path)
                .field("size", size)
                .finish(),
        }
    }
}

impl Drop for StoredData {
    fn drop(&mut self) {
        if let Self::OnDisk { path, .. } = self {
            if let Err(e) = std::fs::remove_file(path.as_path()) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove spill file");
                }
            } else {
                trace!(path = %path.display(), "removed spill file");
            }
        }
    }
}

/// A snapshot of where a blob's bytes live, cloned out of the map so reads
/// never hold a map lock across I/O.
enum DataLocation {
    InMemory(Bytes),
    OnDisk(PathBuf),
}

// ---------------------------------------------------------------------------
// BlobEntry / BlobStats
// ---------------------------------------------------------------------------

/// A stored blob with its reference counters.
#[derive(Debug)]
struct BlobEntry {
    /// The payload bytes (in memory or spilled).
    data: StoredData,
    /// Payload size in bytes.
    size: u64,
    /// Committed object versions referencing this hash.
    refcount: u64,
    /// Provisional in-flight references (pending commits, multipart parts).
    holds: u64,
    /// When the blob was first stored.
    stored_at: DateTime<Utc>,
}

/// Observable counters for a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStats {
    /// Payload size in bytes.
    pub size: u64,
    /// Committed references.
    pub refcount: u64,
    /// Provisional holds.
    pub holds: u64,
}

// ---------------------------------------------------------------------------
// HoldGuard
// ---------------------------------------------------------------------------

/// A scoped provisional reference to a blob.
///
/// Every write path receives its blob through a guard: dropping the guard
/// releases the hold, so an abandoned request (client disconnect, error
/// return) can never leave a dangling hold behind. Ownership leaves the
/// guard in exactly two ways:
///
/// - [`HoldGuard::commit`] converts the hold into a committed reference
///   once the metadata CAS swap has succeeded.
/// - [`HoldGuard::into_hash`] transfers the hold to a longer-lived owner
///   (a multipart session records it and releases it explicitly).
#[must_use = "dropping the guard releases the hold"]
pub struct HoldGuard<'a> {
    store: &'a BlobStore,
    hash: String,
    size: u64,
    deduplicated: bool,
    armed: bool,
}

impl std::fmt::Debug for HoldGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoldGuard")
            .field("hash", &self.hash)
            .field("size", &self.size)
            .field("deduplicated", &self.deduplicated)
            .field("armed", &self.armed)
            .finish()
    }
}

impl HoldGuard<'_> {
    /// The content hash this guard holds.
    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.hash
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the write was deduplicated against an existing blob.
    #[must_use]
    pub fn deduplicated(&self) -> bool {
        self.deduplicated
    }

    /// Convert the hold into a committed reference and return the hash.
    ///
    /// Called after the metadata pointer swap succeeds, so the reference
    /// transfers atomically from the in-flight operation to the committed
    /// version.
    pub fn commit(mut self) -> String {
        self.store.promote_hold(&self.hash);
        self.armed = false;
        std::mem::take(&mut self.hash)
    }

    /// Transfer hold ownership out of the guard without committing.
    ///
    /// The caller becomes responsible for eventually calling
    /// [`BlobStore::commit_hold`] or [`BlobStore::release_hold`].
    pub fn into_hash(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.hash)
    }
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            trace!(hash = %self.hash, "releasing abandoned hold");
            self.store.release_hold(&self.hash);
        }
    }
}

// ---------------------------------------------------------------------------
// BlobStore
// ---------------------------------------------------------------------------

/// Deduplicating, reference-counted blob store.
///
/// Thread-safe: uses [`DashMap`] keyed by content hash. Counter mutations
/// take the per-hash entry lock, which is also what [`BlobStore::sweep`]
/// holds while checking for zero, closing the check-then-act window
/// between GC and a concurrent re-reference.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use objection_core::blob::BlobStore;
///
/// # tokio_test::block_on(async {
/// let store = BlobStore::new(1024, None);
/// let guard = store.put(Bytes::from("hello")).await.unwrap();
/// let hash = guard.commit();
///
/// let data = store.get(&hash, None).await.unwrap();
/// assert_eq!(data.as_ref(), b"hello");
/// # });
/// ```
pub struct BlobStore {
    /// Blob entries keyed by hex content hash.
    blobs: DashMap<String, BlobEntry>,
    /// Max payload size kept in memory before spilling to disk.
    spill_threshold: usize,
    /// Optional total byte budget.
    capacity_bytes: Option<u64>,
    /// Bytes currently stored (including reserved in-flight writes).
    used_bytes: AtomicU64,
    /// Directory for spill files; OS temp dir when `None`.
    spill_dir: Option<PathBuf>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("blob_count", &self.blobs.len())
            .field("spill_threshold", &self.spill_threshold)
            .field("capacity_bytes", &self.capacity_bytes)
            .field("used_bytes", &self.used_bytes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for BlobStore {
    fn default() -> Self {
        Self::new(DEFAULT_SPILL_THRESHOLD, None)
    }
}

impl BlobStore {
    /// Create a new blob store.
    ///
    /// Payloads larger than `spill_threshold` bytes are spilled to disk.
    /// When `capacity_bytes` is set, writes that would push total stored
    /// bytes past the budget fail with
    /// [`EngineError::CapacityExceeded`].
    #[must_use]
    pub fn new(spill_threshold: usize, capacity_bytes: Option<u64>) -> Self {
        debug!(spill_threshold, ?capacity_bytes, "creating BlobStore");
        Self {
            blobs: DashMap::new(),
            spill_threshold,
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            spill_dir: None,
        }
    }

    /// Use `dir` for spill files instead of the OS temp directory.
    #[must_use]
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Store a payload, deduplicating against existing content.
    ///
    /// Returns a [`HoldGuard`] carrying one provisional hold on the
    /// resulting blob. If a blob with the same hash already exists, the new
    /// bytes are discarded and the existing blob gains the hold instead.
    ///
    /// # Errors
    ///
    /// - [`EngineError::CapacityExceeded`] if the byte budget would be
    ///   exceeded; no partial state is persisted.
    /// - [`EngineError::Internal`] if spill-file I/O fails.
    pub async fn put(&self, data: Bytes) -> EngineResult<HoldGuard<'_>> {
        let size = data.len() as u64;
        let hash = checksums::content_hash(&data);

        // Dedup fast path: no reservation, no byte copy.
        if self.try_hold(&hash) {
            trace!(hash = %hash, size, "deduplicated payload");
            return Ok(self.guard(hash, size, true));
        }

        self.reserve(size)?;
        let stored = match self.store_data(data).await {
            Ok(stored) => stored,
            Err(e) => {
                self.unreserve(size);
                return Err(e);
            }
        };

        Ok(self.insert_prepared(hash, stored, size))
    }

    /// Store a payload from a stream of chunks, hashing incrementally.
    ///
    /// Buffers in memory up to the spill threshold, then switches to a
    /// spill file, so payloads larger than available memory are supported
    /// with bounded buffering.
    ///
    /// # Errors
    ///
    /// - [`EngineError::CapacityExceeded`] if the byte budget is exceeded
    ///   mid-stream; everything written so far is discarded.
    /// - [`EngineError::Internal`] on stream or spill-file I/O failure.
    pub async fn put_stream(
        &self,
        mut stream: impl Stream<Item = std::io::Result<Bytes>> + Unpin,
    ) -> EngineResult<HoldGuard<'_>> {
        let mut hasher = ContentHasher::new();
        let mut buffer = BytesMut::new();
        let mut spill: Option<(PathBuf, tokio::fs::File)> = None;
        let mut total: u64 = 0;

        let result: EngineResult<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk
                    .map_err(|e| EngineError::Internal(anyhow::Error::new(e).context("payload stream")))?;
                self.reserve(chunk.len() as u64).inspect_err(|_| {
                    // Give back what this stream already reserved.
                    self.unreserve(total);
                })?;
                total += chunk.len() as u64;
                hasher.update(&chunk);

                if let Some((_, file)) = spill.as_mut() {
                    file.write_all(&chunk).await.map_err(|e| {
                        EngineError::Internal(anyhow::anyhow!("failed to write spill file: {e}"))
                    })?;
                } else {
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() > self.spill_threshold {
                        let path = self.create_spill_file()?;
                        let mut file = tokio::fs::File::create(&path).await.map_err(|e| {
                            EngineError::Internal(anyhow::anyhow!(
                                "failed to open spill file {}: {e}",
                                path.display()
                            ))
                        })?;
                        file.write_all(&buffer).await.map_err(|e| {
                            EngineError::Internal(anyhow::anyhow!(
                                "failed to write spill file: {e}"
                            ))
                        })?;
                        buffer.clear();
                        spill = Some((path, file));
                    }
                }
            }
            if let Some((_, file)) = spill.as_mut() {
                file.flush().await.map_err(|e| {
                    EngineError::Internal(anyhow::anyhow!("failed to flush spill file: {e}"))
                })?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            // Remove any partial spill file; capacity errors already gave
            // back their reservation above.
            if let Some((path, file)) = spill {
                drop(file);
                let _ = std::fs::remove_file(&path);
            }
            if !matches!(e, EngineError::CapacityExceeded { .. }) {
                self.unreserve(total);
            }
            return Err(e);
        }

        let hash = hasher.finalize();
        let stored = match spill {
            Some((path, file)) => {
                drop(file);
                StoredData::OnDisk { path, size: total }
            }
            None => StoredData::InMemory {
                data: buffer.freeze(),
            },
        };

        Ok(self.insert_prepared(hash, stored, total))
    }

    // -----------------------------------------------------------------------
    // Holds and reference counts
    // -----------------------------------------------------------------------

    /// Acquire a provisional hold on an existing blob.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoSuchBlob`] if the hash is unknown; callers
    /// treat that as a cache miss and re-upload the payload.
    pub fn acquire_hold(&self, hash: &str) -> EngineResult<HoldGuard<'_>> {
        let size = {
            let mut entry = self
                .blobs
                .get_mut(hash)
                .ok_or_else(|| EngineError::NoSuchBlob {
                    content_hash: hash.to_owned(),
                })?;
            entry.holds += 1;
            entry.size
        };
        Ok(self.guard(hash.to_owned(), size, true))
    }

    /// Release a provisional hold previously transferred out of a guard.
    pub fn release_hold(&self, hash: &str) {
        if let Some(mut entry) = self.blobs.get_mut(hash) {
            if entry.holds == 0 {
                warn!(hash = %hash, "release_hold with zero holds");
            }
            entry.holds = entry.holds.saturating_sub(1);
        } else {
            warn!(hash = %hash, "release_hold on unknown blob");
        }
    }

    /// Convert one transferred hold into a committed reference.
    pub fn commit_hold(&self, hash: &str) {
        self.promote_hold(hash);
    }

    /// Release a committed reference when the version that owned it is
    /// superseded or deleted. The blob becomes GC-eligible once refcount
    /// and holds both reach zero; physical deletion happens in
    /// [`BlobStore::sweep`].
    pub fn decref(&self, hash: &str) {
        if let Some(mut entry) = self.blobs.get_mut(hash) {
            if entry.refcount == 0 {
                warn!(hash = %hash, "decref with zero refcount");
            }
            entry.refcount = entry.refcount.saturating_sub(1);
            trace!(hash = %hash, refcount = entry.refcount, holds = entry.holds, "decref");
        } else {
            warn!(hash = %hash, "decref on unknown blob");
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read a blob's payload.
    ///
    /// If `range` is `(start, end)` (inclusive on both ends), only that
    /// byte range is returned. Full reads re-verify the stored bytes
    /// against the content hash.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NoSuchBlob`] if the hash is unknown.
    /// - [`EngineError::InvalidArgument`] if the range is out of bounds.
    /// - [`EngineError::Corrupt`] if a full read fails hash re-verification.
    pub async fn get(&self, hash: &str, range: Option<(u64, u64)>) -> EngineResult<Bytes> {
        // Snapshot the location so no map lock is held across file I/O.
        let location = {
            let entry = self
                .blobs
                .get(hash)
                .ok_or_else(|| EngineError::NoSuchBlob {
                    content_hash: hash.to_owned(),
                })?;
            match &entry.data {
                StoredData::InMemory { data } => DataLocation::InMemory(data.clone()),
                StoredData::OnDisk { path, .. } => DataLocation::OnDisk(path.clone()),
            }
        };

        let all_data = match location {
            DataLocation::InMemory(data) => data,
            DataLocation::OnDisk(path) => {
                let raw = tokio::fs::read(&path).await.map_err(|e| {
                    EngineError::Internal(anyhow::anyhow!(
                        "failed to read spill file {}: {e}",
                        path.display()
                    ))
                })?;
                Bytes::from(raw)
            }
        };

        match range {
            Some((start, end)) => {
                let len = all_data.len();
                let start_idx = usize::try_from(start).map_err(|_| range_error(start, end))?;
                let end_idx = usize::try_from(end).map_err(|_| range_error(start, end))?;
                if start_idx >= len || end_idx >= len || start_idx > end_idx {
                    return Err(range_error(start, end));
                }
                Ok(all_data.slice(start_idx..=end_idx))
            }
            None => {
                if checksums::content_hash(&all_data) != hash {
                    error!(hash = %hash, "stored blob failed hash re-verification");
                    return Err(EngineError::Corrupt {
                        content_hash: hash.to_owned(),
                    });
                }
                Ok(all_data)
            }
        }
    }

    /// Stream a blob's payload in chunks.
    ///
    /// Spilled payloads are read from disk one chunk at a time, so a blob
    /// larger than available memory can be served as well as ingested. The
    /// bytes are hashed as they stream and re-verified against the content
    /// hash once the payload ends.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NoSuchBlob`] if the hash is unknown.
    /// - [`EngineError::Corrupt`] immediately for an in-memory payload
    ///   that fails re-verification; for spilled payloads the mismatch
    ///   surfaces as the final stream item, after the bytes have already
    ///   been yielded.
    pub async fn get_stream(
        &self,
        hash: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<Bytes>>> {
        let location = {
            let entry = self
                .blobs
                .get(hash)
                .ok_or_else(|| EngineError::NoSuchBlob {
                    content_hash: hash.to_owned(),
                })?;
            match &entry.data {
                StoredData::InMemory { data } => DataLocation::InMemory(data.clone()),
                StoredData::OnDisk { path, .. } => DataLocation::OnDisk(path.clone()),
            }
        };

        match location {
            DataLocation::InMemory(data) => {
                if checksums::content_hash(&data) != hash {
                    error!(hash = %hash, "stored blob failed hash re-verification");
                    return Err(EngineError::Corrupt {
                        content_hash: hash.to_owned(),
                    });
                }
                Ok(futures::stream::iter([Ok(data)]).boxed())
            }
            DataLocation::OnDisk(path) => {
                let file = tokio::fs::File::open(&path).await.map_err(|e| {
                    EngineError::Internal(anyhow::anyhow!(
                        "failed to open spill file {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(spill_stream(file, hash.to_owned()))
            }
        }
    }

    /// Observable counters for a blob, if stored.
    #[must_use]
    pub fn stats(&self, hash: &str) -> Option<BlobStats> {
        self.blobs.get(hash).map(|entry| BlobStats {
            size: entry.size,
            refcount: entry.refcount,
            holds: entry.holds,
        })
    }

    /// Whether a blob is stored under `hash`.
    #[must_use]
    pub fn contains(&self, hash: &str) -> bool {
        self.blobs.contains_key(hash)
    }

    /// Number of distinct blobs stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store holds zero blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total payload bytes currently stored.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Remove every blob whose refcount and hold count are both zero.
    ///
    /// The zero check runs under the same per-hash lock that counter
    /// increments take, so a blob observed at zero cannot gain a reference
    /// before removal completes. Returns the number of blobs collected.
    pub fn sweep(&self) -> usize {
        let mut collected = 0usize;
        let mut freed: u64 = 0;
        self.blobs.retain(|hash, entry| {
            let keep = entry.refcount > 0 || entry.holds > 0;
            if !keep {
                trace!(hash = %hash, size = entry.size, age = %entry.stored_at, "collecting blob");
                collected += 1;
                freed += entry.size;
            }
            keep
        });
        if collected > 0 {
            self.unreserve(freed);
            debug!(collected, freed, "blob sweep complete");
        }
        collected
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn guard(&self, hash: String, size: u64, deduplicated: bool) -> HoldGuard<'_> {
        HoldGuard {
            store: self,
            hash,
            size,
            deduplicated,
            armed: true,
        }
    }

    /// Take a hold on an existing entry. Returns `false` if absent.
    fn try_hold(&self, hash: &str) -> bool {
        if let Some(mut entry) = self.blobs.get_mut(hash) {
            entry.holds += 1;
            true
        } else {
            false
        }
    }

    /// Convert one hold into a committed reference.
    fn promote_hold(&self, hash: &str) {
        if let Some(mut entry) = self.blobs.get_mut(hash) {
            if entry.holds == 0 {
                warn!(hash = %hash, "promoting hold with zero holds");
            }
            entry.holds = entry.holds.saturating_sub(1);
            entry.refcount += 1;
            trace!(hash = %hash, refcount = entry.refcount, holds = entry.holds, "hold promoted");
        } else {
            warn!(hash = %hash, "promote_hold on unknown blob");
        }
    }

    /// Insert prepared payload data, resolving a dedup race if another
    /// writer landed the same hash first.
    fn insert_prepared(&self, hash: String, stored: StoredData, size: u64) -> HoldGuard<'_> {
        match self.blobs.entry(hash.clone()) {
            Entry::Occupied(mut occupied) => {
                // A concurrent writer won; discard our copy and hold theirs.
                occupied.get_mut().holds += 1;
                drop(stored);
                self.unreserve(size);
                trace!(hash = %hash, size, "deduplicated payload (insert race)");
                self.guard(hash, size, true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(BlobEntry {
                    data: stored,
                    size,
                    refcount: 0,
                    holds: 1,
                    stored_at: Utc::now(),
                });
                trace!(hash = %hash, size, "stored new blob");
                self.guard(hash, size, false)
            }
        }
    }

    /// Reserve `n` bytes against the budget.
    fn reserve(&self, n: u64) -> EngineResult<()> {
        let Some(cap) = self.capacity_bytes else {
            self.used_bytes.fetch_add(n, Ordering::Relaxed);
            return Ok(());
        };
        let mut current = self.used_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(n);
            if next > cap {
                return Err(EngineError::CapacityExceeded {
                    requested: n,
                    available: cap.saturating_sub(current),
                });
            }
            match self.used_bytes.compare_exchange(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn unreserve(&self, n: u64) {
        self.used_bytes.fetch_sub(n, Ordering::Relaxed);
    }

    /// Store payload bytes either in memory or in a spill file.
    async fn store_data(&self, data: Bytes) -> EngineResult<StoredData> {
        if data.len() > self.spill_threshold {
            let size = data.len() as u64;
            let path = self.create_spill_file()?;
            tokio::fs::write(&path, &data).await.map_err(|e| {
                EngineError::Internal(anyhow::anyhow!(
                    "failed to write spill file {}: {e}",
                    path.display()
                ))
            })?;
            trace!(path = %path.display(), size, "spilled payload to disk");
            Ok(StoredData::OnDisk { path, size })
        } else {
            Ok(StoredData::InMemory { data })
        }
    }

    /// Create an empty spill file and return its path.
    ///
    /// The named temp file is persisted so it is not auto-deleted; cleanup
    /// happens in [`StoredData`]'s `Drop`.
    fn create_spill_file(&self) -> EngineResult<PathBuf> {
        let temp = match &self.spill_dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir),
            None => tempfile::NamedTempFile::new(),
        }
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("failed to create spill file: {e}")))?;
        let path = temp.path().to_path_buf();
        temp.persist(&path).map_err(|e| {
            EngineError::Internal(anyhow::anyhow!(
                "failed to persist spill file {}: {e}",
                path.display()
            ))
        })?;
        Ok(path)
    }

    /// Overwrite a blob's stored bytes with junk, for corruption tests.
    #[cfg(test)]
    fn corrupt_for_test(&self, hash: &str) {
        if let Some(mut entry) = self.blobs.get_mut(hash) {
            entry.data = StoredData::InMemory {
                data: Bytes::from_static(b"flipped bits"),
            };
        }
    }

    /// The spill file path of an on-disk blob, for corruption tests.
    #[cfg(test)]
    fn spill_path_for_test(&self, hash: &str) -> Option<PathBuf> {
        self.blobs.get(hash).and_then(|entry| match &entry.data {
            StoredData::OnDisk { path, .. } => Some(path.clone()),
            StoredData::InMemory { .. } => None,
        })
    }
}

fn range_error(start: u64, end: u64) -> EngineError {
    EngineError::InvalidArgument {
        message: format!("requested range {start}-{end} is not satisfiable"),
    }
}

/// Stream a spill file in fixed-size chunks, hashing as it goes. The
/// final item is [`EngineError::Corrupt`] when the stored bytes no longer
/// match `hash`.
fn spill_stream(file: tokio::fs::File, hash: String) -> BoxStream<'static, EngineResult<Bytes>> {
    let state = (file, ContentHasher::new(), hash, false);
    futures::stream::unfold(state, |(mut file, mut hasher, hash, done)| async move {
        if done {
            return None;
        }
        let mut buf = vec![0_u8; STREAM_CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => {
                if hasher.finalize() == hash {
                    None
                } else {
                    error!(hash = %hash, "stored blob failed hash re-verification");
                    Some((
                        Err(EngineError::Corrupt {
                            content_hash: hash.clone(),
                        }),
                        (file, ContentHasher::new(), hash, true),
                    ))
                }
            }
            Ok(n) => {
                buf.truncate(n);
                hasher.update(&buf);
                Some((Ok(Bytes::from(buf)), (file, hasher, hash, false)))
            }
            Err(e) => Some((
                Err(EngineError::Internal(anyhow::anyhow!(
                    "failed to read spill file: {e}"
                ))),
                (file, hasher, hash, true),
            )),
        }
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
