//! Multipart upload coordination.
//!
//! Drives the session state machine in `state::multipart` against the
//! blob store and key store. Each part upload stores its payload and
//! transfers the blob hold into the session; completion validates the
//! client's part list, assembles the final payload by streaming the parts
//! through a fresh blob put, commits the assembled object via the CAS
//! path, and only then releases the part holds.
//!
//! A completed session is replaced by a tombstone so retrying the same
//! completion is idempotent, while aborts and part uploads against the
//! finished upload ID observe it as gone.

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::checksums;
use crate::error::{EngineError, EngineResult};
use crate::state::multipart::{CompletedUpload, PartRecord, UploadSession};
use crate::state::object::ObjectRecord;

use super::ObjectEngine;
use super::object::PutOptions;

// ---------------------------------------------------------------------------
// Operation inputs / outputs
// ---------------------------------------------------------------------------

/// The result of initiating a multipart upload.
#[derive(Debug, Clone)]
pub struct CreateUploadOutcome {
    /// Unique identifier for the new session.
    pub upload_id: String,
    /// The target key.
    pub key: String,
}

/// The result of uploading one part.
#[derive(Debug, Clone)]
pub struct UploadPartOutcome {
    /// The part number the payload was recorded under.
    pub part_number: u32,
    /// Quoted per-part ETag.
    pub etag: String,
    /// Content hash of the part payload.
    pub content_hash: String,
    /// Part size in bytes.
    pub size: u64,
}

/// One entry of the client-provided part list at completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    /// The part number.
    pub part_number: u32,
    /// The ETag the client received when uploading the part.
    pub etag: String,
}

/// The result of completing a multipart upload.
#[derive(Debug, Clone)]
pub struct CompleteOutcome {
    /// Version ID of the committed object.
    pub version_id: String,
    /// Composite ETag of the assembled object.
    pub etag: String,
    /// Content hash of the assembled payload.
    pub content_hash: String,
    /// Assembled size in bytes.
    pub size: u64,
    /// Number of parts assembled.
    pub parts_count: u32,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl ObjectEngine {
    /// Initiate a multipart upload. Object metadata is captured now and
    /// applied to the assembled object at completion.
    pub fn create_multipart_upload(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
        opts: PutOptions,
    ) -> EngineResult<CreateUploadOutcome> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "PutObject", Some(key))?;

        let upload_id = Uuid::new_v4().to_string();
        let mut session = UploadSession::new(upload_id.clone(), key);
        session.content_type = opts.content_type;
        session.cache_control = opts.cache_control;
        session.tags = opts.tags;
        bucket.uploads.insert(upload_id.clone(), session);

        info!(bucket = %bucket_name, key, upload_id = %upload_id, "initiated multipart upload");
        Ok(CreateUploadOutcome {
            upload_id,
            key: key.to_owned(),
        })
    }

    /// Upload one part. Parts for distinct numbers may run in parallel;
    /// re-uploading a number replaces the earlier part and releases its
    /// blob hold (last write wins).
    ///
    /// # Errors
    ///
    /// - [`EngineError::NoSuchUpload`] for an unknown or finished session.
    /// - [`EngineError::UploadStateConflict`] while a completion is
    ///   pending.
    /// - [`EngineError::InvalidArgument`] for part number zero.
    pub async fn upload_part(
        &self,
        principal: &str,
        bucket_name: &str,
        upload_id: &str,
        part_number: u32,
        data: bytes::Bytes,
    ) -> EngineResult<UploadPartOutcome> {
        if part_number == 0 {
            return Err(EngineError::InvalidArgument {
                message: "part numbers start at 1".to_owned(),
            });
        }
        let bucket = self.meta().bucket(bucket_name)?;
        let key = self.session_key(&bucket, upload_id)?;
        self.authorize(&bucket, principal, "PutObject", Some(&key))?;

        // Store the payload before touching the session, so the session
        // entry lock is never held across I/O.
        let guard = self.blobs().put(data).await?;
        let part = PartRecord {
            part_number,
            content_hash: guard.content_hash().to_owned(),
            size: guard.size(),
            etag: checksums::etag_for_hash(guard.content_hash()),
            uploaded_at: Utc::now(),
        };
        let outcome = UploadPartOutcome {
            part_number,
            etag: part.etag.clone(),
            content_hash: part.content_hash.clone(),
            size: part.size,
        };

        let replaced = {
            let mut session =
                bucket
                    .uploads
                    .get_mut(upload_id)
                    .ok_or_else(|| EngineError::NoSuchUpload {
                        upload_id: upload_id.to_owned(),
                    })?;
            session.record_part(part)?
        };

        // The session now owns the hold; a replaced part gives its hold up.
        let _hash = guard.into_hash();
        if let Some(previous) = replaced {
            self.blobs().release_hold(&previous.content_hash);
        }

        debug!(upload_id, part_number, size = outcome.size, "recorded part");
        Ok(outcome)
    }

    /// The recorded parts of a session in part-number order, for callers
    /// re-deriving a part list after a mismatch.
    pub fn list_parts(
        &self,
        principal: &str,
        bucket_name: &str,
        upload_id: &str,
    ) -> EngineResult<Vec<PartRecord>> {
        let bucket = self.meta().bucket(bucket_name)?;
        let key = self.session_key(&bucket, upload_id)?;
        self.authorize(&bucket, principal, "ListParts", Some(&key))?;

        let session = bucket
            .uploads
            .get(upload_id)
            .ok_or_else(|| EngineError::NoSuchUpload {
                upload_id: upload_id.to_owned(),
            })?;
        Ok(session.parts.values().cloned().collect())
    }

    /// Complete a multipart upload.
    ///
    /// Validates the client part list against the recorded parts (count,
    /// order, ETags), assembles the parts in numeric order into one
    /// payload, and commits it through the CAS path. A retried completion
    /// with the same part list returns the original result; the session
    /// itself is gone once completed, so aborts and part uploads fail with
    /// not-found.
    ///
    /// # Errors
    ///
    /// - [`EngineError::PartMismatch`] when validation fails; the session
    ///   returns to accepting parts and the completion may be retried with
    ///   a corrected list.
    /// - [`EngineError::UploadStateConflict`] when another completion is
    ///   in flight.
    /// - [`EngineError::WriteConflict`] when the CAS budget runs out; the
    ///   session also returns to accepting parts.
    pub async fn complete_multipart_upload(
        &self,
        principal: &str,
        bucket_name: &str,
        upload_id: &str,
        client_parts: &[CompletedPart],
    ) -> EngineResult<CompleteOutcome> {
        let bucket = self.meta().bucket(bucket_name)?;

        // Idempotent retry: a finished upload answers from its tombstone.
        if let Some(done) = bucket.completed_uploads.get(upload_id) {
            self.authorize(&bucket, principal, "PutObject", Some(&done.key))?;
            validate_part_list(upload_id, &done.parts, client_parts)?;
            debug!(upload_id, "returning completed upload from tombstone");
            return Ok(CompleteOutcome {
                version_id: done.version_id.clone(),
                etag: done.etag.clone(),
                content_hash: done.content_hash.clone(),
                size: done.size,
                parts_count: done.parts_count,
            });
        }

        let key = self.session_key(&bucket, upload_id)?;
        self.authorize(&bucket, principal, "PutObject", Some(&key))?;

        // Fence out concurrent completes, part uploads, and aborts, and
        // snapshot everything needed to assemble outside the entry lock.
        let (recorded, content_type, cache_control, tags) = {
            let mut session =
                bucket
                    .uploads
                    .get_mut(upload_id)
                    .ok_or_else(|| EngineError::NoSuchUpload {
                        upload_id: upload_id.to_owned(),
                    })?;
            session.begin_complete()?;
            (
                session.parts.values().cloned().collect::<Vec<_>>(),
                session.content_type.clone(),
                session.cache_control.clone(),
                session.tags.clone(),
            )
        };

        let result = self
            .assemble_and_commit(
                &bucket,
                &key,
                &recorded,
                client_parts,
                upload_id,
                content_type,
                cache_control,
                tags,
            )
            .await;

        match result {
            Ok(outcome) => {
                // Tombstone first, then drop the session, then release the
                // part holds: retries always find one of the two records.
                bucket.completed_uploads.insert(
                    upload_id.to_owned(),
                    CompletedUpload {
                        upload_id: upload_id.to_owned(),
                        key: key.clone(),
                        version_id: outcome.version_id.clone(),
                        content_hash: outcome.content_hash.clone(),
                        etag: outcome.etag.clone(),
                        size: outcome.size,
                        parts_count: outcome.parts_count,
                        parts: recorded.clone(),
                        completed_at: Utc::now(),
                    },
                );
                bucket.uploads.remove(upload_id);
                for part in &recorded {
                    self.blobs().release_hold(&part.content_hash);
                }
                info!(
                    bucket = %bucket_name,
                    key = %key,
                    upload_id,
                    version_id = %outcome.version_id,
                    parts = outcome.parts_count,
                    "completed multipart upload"
                );
                Ok(outcome)
            }
            Err(e) => {
                // Roll back so a corrected part list can be retried.
                if let Some(mut session) = bucket.uploads.get_mut(upload_id) {
                    session.fail_complete();
                }
                Err(e)
            }
        }
    }

    /// Abort a multipart upload, releasing every part hold. Permitted
    /// while parts are uploading; a pending completion fences it out, and
    /// a finished upload is simply gone.
    pub fn abort_multipart_upload(
        &self,
        principal: &str,
        bucket_name: &str,
        upload_id: &str,
    ) -> EngineResult<()> {
        let bucket = self.meta().bucket(bucket_name)?;
        {
            let session =
                bucket
                    .uploads
                    .get(upload_id)
                    .ok_or_else(|| EngineError::NoSuchUpload {
                        upload_id: upload_id.to_owned(),
                    })?;
            self.authorize(&bucket, principal, "AbortMultipartUpload", Some(&session.key))?;
            session.check_abortable()?;
        }

        let Some((_, session)) = bucket
            .uploads
            .remove_if(upload_id, |_, s| s.check_abortable().is_ok())
        else {
            // Lost a race with a completion that started in between.
            return Err(EngineError::NoSuchUpload {
                upload_id: upload_id.to_owned(),
            });
        };
        for hash in session.part_hashes() {
            self.blobs().release_hold(&hash);
        }
        info!(bucket = %bucket_name, upload_id, "aborted multipart upload");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn session_key(
        &self,
        bucket: &crate::state::bucket::Bucket,
        upload_id: &str,
    ) -> EngineResult<String> {
        bucket
            .uploads
            .get(upload_id)
            .map(|session| session.key.clone())
            .ok_or_else(|| EngineError::NoSuchUpload {
                upload_id: upload_id.to_owned(),
            })
    }

    /// Validate, assemble, and CAS-commit the final object. The session
    /// stays fenced in complete-pending for the duration; the caller
    /// settles it based on the result.
    #[allow(clippy::too_many_arguments)]
    async fn assemble_and_commit(
        &self,
        bucket: &crate::state::bucket::Bucket,
        key: &str,
        recorded: &[PartRecord],
        client_parts: &[CompletedPart],
        upload_id: &str,
        content_type: Option<String>,
        cache_control: Option<String>,
        tags: std::collections::BTreeMap<String, String>,
    ) -> EngineResult<CompleteOutcome> {
        validate_part_list(upload_id, recorded, client_parts)?;

        // Assemble by streaming the parts chunk-by-chunk through a fresh
        // put, so neither a part nor the final payload has to fit in
        // memory at once. Each part's bytes re-verify against its hash as
        // they stream.
        let part_hashes: Vec<String> =
            recorded.iter().map(|p| p.content_hash.clone()).collect();
        let blobs = self.blobs();
        let stream = Box::pin(
            futures::stream::iter(part_hashes.clone())
                .then(move |hash| async move {
                    blobs
                        .get_stream(&hash)
                        .await
                        .map(|part| part.map(|chunk| chunk.map_err(std::io::Error::other)))
                        .map_err(std::io::Error::other)
                })
                .try_flatten(),
        );
        let guard = self.blobs().put_stream(stream).await.map_err(unwrap_nested)?;

        let content_hash = guard.content_hash().to_owned();
        let size = guard.size();
        let etag = checksums::composite_etag(&part_hashes);
        let parts_count = u32::try_from(recorded.len()).unwrap_or(u32::MAX);

        // Only the metadata CAS retries on conflict; the assembled blob
        // is kept across attempts.
        let outcome = self
            .commit_with_retry(bucket, key, |_current, version_id| {
                let mut record = ObjectRecord::new(
                    key,
                    version_id,
                    content_hash.clone(),
                    size,
                    etag.clone(),
                );
                record.content_type = content_type.clone();
                record.cache_control = cache_control.clone();
                record.tags = tags.clone();
                record.parts_count = Some(parts_count);
                record
            })
            .await?;

        let content_hash = guard.commit();
        if let Some(old) = &outcome.superseded_hash {
            self.blobs().decref(old);
        }

        Ok(CompleteOutcome {
            version_id: outcome.version_id,
            etag,
            content_hash,
            size,
            parts_count,
        })
    }
}

/// Validate the client's part list against the recorded parts: same
/// count, same part numbers in ascending order, same ETags.
fn validate_part_list(
    upload_id: &str,
    recorded: &[PartRecord],
    client: &[CompletedPart],
) -> EngineResult<()> {
    let mismatch = |reason: String| EngineError::PartMismatch {
        upload_id: upload_id.to_owned(),
        reason,
    };

    if recorded.is_empty() {
        return Err(mismatch("no parts uploaded".to_owned()));
    }
    if client.len() != recorded.len() {
        return Err(mismatch(format!(
            "expected {} parts, got {}",
            recorded.len(),
            client.len()
        )));
    }
    for (have, want) in recorded.iter().zip(client) {
        if have.part_number != want.part_number {
            return Err(mismatch(format!(
                "part {} out of order or missing (got {})",
                have.part_number, want.part_number
            )));
        }
        if have.etag.trim_matches('"') != want.etag.trim_matches('"') {
            return Err(mismatch(format!(
                "etag mismatch for part {}",
                want.part_number
            )));
        }
    }
    Ok(())
}

/// Part reads surface their engine error wrapped in the stream's I/O
/// error; unwrap one level so callers see the original variant.
fn unwrap_nested(err: EngineError) -> EngineError {
    match err {
        EngineError::Internal(inner) => match inner.downcast::<std::io::Error>() {
            Ok(io_err) => io_err
                .downcast::<EngineError>()
                .map_or_else(
                    |e| EngineError::Internal(anyhow::anyhow!("part read failed: {e}")),
                    |engine_err| engine_err,
                ),
            Err(other) => EngineError::Internal(other),
        },
        other => other,
    }
}
