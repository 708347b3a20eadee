//! Single-shot object operations: put, get, delete, list.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blob::HoldGuard;
use crate::checksums;
use crate::error::{EngineError, EngineResult};
use crate::state::keystore::ListResult;
use crate::state::object::{ObjectRecord, ObjectVersion};

use super::ObjectEngine;

// ---------------------------------------------------------------------------
// Operation inputs / outputs
// ---------------------------------------------------------------------------

/// Optional metadata supplied with a put.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutOptions {
    /// MIME type of the payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Cache policy; falls back to the bucket default when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    /// Initial tags.
    #[serde(default)]
    pub tags: std::collections::BTreeMap<String, String>,
    /// Per-object ACL statements.
    #[serde(default)]
    pub acl: Vec<crate::policy::Statement>,
    /// Optional expiration instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The result of a successful put.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    /// Version ID of the committed version.
    pub version_id: String,
    /// Quoted ETag.
    pub etag: String,
    /// Content hash of the payload.
    pub content_hash: String,
    /// Payload size in bytes.
    pub size: u64,
    /// Whether the payload deduplicated against an existing blob.
    pub deduplicated: bool,
}

/// The result of a successful get.
#[derive(Debug, Clone)]
pub struct GetOutcome {
    /// The version's metadata record.
    pub record: ObjectRecord,
    /// Payload bytes (the requested range for range reads).
    pub data: Bytes,
    /// Effective cache policy: the record's own, or the bucket default.
    pub cache_control: Option<String>,
}

/// The result of a successful streaming get.
pub struct GetStreamOutcome {
    /// The version's metadata record.
    pub record: ObjectRecord,
    /// Payload bytes as a chunked stream; spilled blobs never materialize
    /// in memory.
    pub data: BoxStream<'static, crate::error::EngineResult<Bytes>>,
    /// Effective cache policy: the record's own, or the bucket default.
    pub cache_control: Option<String>,
}

impl std::fmt::Debug for GetStreamOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetStreamOutcome")
            .field("record", &self.record)
            .field("cache_control", &self.cache_control)
            .finish_non_exhaustive()
    }
}

/// The result of a delete.
#[derive(Debug, Clone)]
pub struct DeleteObjectOutcome {
    /// Version ID of the delete marker (versioned buckets only).
    pub marker_version_id: Option<String>,
    /// Whether a live record existed before the delete.
    pub existed: bool,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl ObjectEngine {
    /// Store an object.
    ///
    /// The payload is hashed and persisted (or deduplicated) first; the
    /// version becomes visible only through the metadata pointer swap, and
    /// the superseded version's blob reference is released only after that
    /// swap succeeds.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Forbidden`] when policy denies `PutObject`.
    /// - [`EngineError::NoSuchBucket`] for an unknown bucket.
    /// - [`EngineError::WriteConflict`] when the CAS retry budget runs out.
    /// - [`EngineError::CapacityExceeded`] when the byte budget is exhausted.
    pub async fn put_object(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
        data: Bytes,
        opts: PutOptions,
    ) -> EngineResult<PutOutcome> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "PutObject", Some(key))?;

        let guard = self.blobs().put(data).await?;
        self.commit_put(&bucket, key, guard, opts).await
    }

    /// Store an object from a stream of payload chunks, hashing
    /// incrementally with bounded buffering.
    ///
    /// Dropping the future mid-flight (client disconnect) releases any
    /// provisional blob state; no hold outlives the call.
    pub async fn put_object_stream(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
        data: impl Stream<Item = std::io::Result<Bytes>> + Unpin,
        opts: PutOptions,
    ) -> EngineResult<PutOutcome> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "PutObject", Some(key))?;

        let guard = self.blobs().put_stream(data).await?;
        self.commit_put(&bucket, key, guard, opts).await
    }

    /// Read the current version of an object.
    ///
    /// `range` is an inclusive byte range; full reads re-verify the
    /// payload against its content hash.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NoSuchKey`] when the key is absent, deleted, or
    ///   its current version has expired.
    /// - [`EngineError::Corrupt`] when a full read fails re-verification.
    pub async fn get_object(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> EngineResult<GetOutcome> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "GetObject", Some(key))?;

        let record = bucket
            .keys
            .read()
            .get_current(key, Utc::now())
            .cloned()
            .ok_or_else(|| EngineError::NoSuchKey {
                key: key.to_owned(),
            })?;
        let data = self.blobs().get(&record.content_hash, range).await?;
        let cache_control = record
            .cache_control
            .clone()
            .or_else(|| bucket.default_cache_policy.read().clone());

        Ok(GetOutcome {
            record,
            data,
            cache_control,
        })
    }

    /// Read the current version of an object as a chunked byte stream.
    ///
    /// Unlike [`Self::get_object`], spilled payloads are served from disk
    /// one chunk at a time, so objects larger than available memory can be
    /// read back. The bytes are re-verified against the content hash as
    /// they stream; a mismatch surfaces [`EngineError::Corrupt`] as the
    /// final stream item.
    pub async fn get_object_stream(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
    ) -> EngineResult<GetStreamOutcome> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "GetObject", Some(key))?;

        let record = bucket
            .keys
            .read()
            .get_current(key, Utc::now())
            .cloned()
            .ok_or_else(|| EngineError::NoSuchKey {
                key: key.to_owned(),
            })?;
        let data = self.blobs().get_stream(&record.content_hash).await?;
        let cache_control = record
            .cache_control
            .clone()
            .or_else(|| bucket.default_cache_policy.read().clone());

        Ok(GetStreamOutcome {
            record,
            data,
            cache_control,
        })
    }

    /// Read a specific version of an object by version ID.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSuchVersion`] when the version is absent or is a
    /// delete marker.
    pub async fn get_object_version(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
        version_id: &str,
        range: Option<(u64, u64)>,
    ) -> EngineResult<GetOutcome> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "GetObject", Some(key))?;

        let record = bucket
            .keys
            .read()
            .get_version(key, version_id)
            .and_then(ObjectVersion::as_record)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchVersion {
                key: key.to_owned(),
                version_id: version_id.to_owned(),
            })?;
        let data = self.blobs().get(&record.content_hash, range).await?;
        let cache_control = record
            .cache_control
            .clone()
            .or_else(|| bucket.default_cache_policy.read().clone());

        Ok(GetOutcome {
            record,
            data,
            cache_control,
        })
    }

    /// Delete an object.
    ///
    /// In versioned buckets this writes a delete marker; older versions
    /// stay addressable. In unversioned buckets the record is removed and
    /// its blob reference released. Deleting an absent key succeeds with
    /// `existed: false`.
    pub async fn delete_object(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
    ) -> EngineResult<DeleteObjectOutcome> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "DeleteObject", Some(key))?;

        let outcome = self.delete_with_retry(&bucket, key).await?;
        if let Some(hash) = &outcome.removed_hash {
            self.blobs().decref(hash);
        }
        info!(bucket = %bucket_name, key, existed = outcome.existed, "deleted object");
        Ok(DeleteObjectOutcome {
            marker_version_id: outcome.marker_version_id,
            existed: outcome.existed,
        })
    }

    /// Permanently remove one version from a versioned bucket and release
    /// its blob reference. Removing a delete marker resurfaces the next
    /// newest version.
    pub async fn delete_object_version(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
        version_id: &str,
    ) -> EngineResult<()> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "DeleteObject", Some(key))?;

        let removed = bucket
            .keys
            .write()
            .remove_version(key, version_id)
            .ok_or_else(|| EngineError::NoSuchVersion {
                key: key.to_owned(),
                version_id: version_id.to_owned(),
            })?;
        if let Some(hash) = removed.content_hash() {
            self.blobs().decref(hash);
        }
        Ok(())
    }

    /// List current objects in key order.
    pub fn list_objects(
        &self,
        principal: &str,
        bucket_name: &str,
        prefix: &str,
        delimiter: &str,
        start_after: &str,
        max_keys: usize,
    ) -> EngineResult<ListResult> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "ListObjects", None)?;

        Ok(bucket
            .keys
            .read()
            .list_objects(prefix, delimiter, start_after, max_keys, Utc::now()))
    }

    /// The full version chain of a key, newest first, delete markers
    /// included.
    pub fn list_versions(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
    ) -> EngineResult<Vec<ObjectVersion>> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "ListObjectVersions", Some(key))?;

        Ok(bucket.keys.read().versions(key).to_vec())
    }

    // -----------------------------------------------------------------------
    // Shared put tail
    // -----------------------------------------------------------------------

    /// CAS-commit a held blob as the new current version of `key`.
    ///
    /// The hold converts into the version's committed reference only after
    /// the pointer swap succeeds; on any failure the guard's drop releases
    /// it and the blob stays unattached.
    async fn commit_put(
        &self,
        bucket: &crate::state::bucket::Bucket,
        key: &str,
        guard: HoldGuard<'_>,
        opts: PutOptions,
    ) -> EngineResult<PutOutcome> {
        let content_hash = guard.content_hash().to_owned();
        let size = guard.size();
        let deduplicated = guard.deduplicated();
        let etag = checksums::etag_for_hash(&content_hash);

        let outcome = self
            .commit_with_retry(bucket, key, |_current, version_id| {
                let mut record =
                    ObjectRecord::new(key, version_id, content_hash.clone(), size, etag.clone());
                record.content_type = opts.content_type.clone();
                record.cache_control = opts.cache_control.clone();
                record.tags = opts.tags.clone();
                record.acl = opts.acl.clone();
                record.expires_at = opts.expires_at;
                record
            })
            .await?;

        // Pointer swap succeeded: the hold becomes the version's reference,
        // and only now is the superseded version's reference released.
        let content_hash = guard.commit();
        if let Some(old) = &outcome.superseded_hash {
            self.blobs().decref(old);
        }

        debug!(
            bucket = %bucket.name,
            key,
            version_id = %outcome.version_id,
            hash = %content_hash,
            deduplicated,
            "put committed"
        );
        Ok(PutOutcome {
            version_id: outcome.version_id,
            etag,
            content_hash,
            size,
            deduplicated,
        })
    }
}
