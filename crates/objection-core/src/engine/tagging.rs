//! Sidecar metadata updates: tags and cache policy.
//!
//! Committed versions are immutable, so in versioned buckets a tag or
//! cache-control change commits a fresh version referencing the same blob
//! (a hold on the content hash bridges the commit, no payload re-hash).
//! In unversioned buckets the single current record's sidecar fields are
//! updated in place, since no blob data is touched and no history is kept.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::state::bucket::Bucket;
use crate::state::keystore::new_version_id;
use crate::state::object::ObjectRecord;

use super::ObjectEngine;

impl ObjectEngine {
    /// Replace an object's tags. Returns the record now carrying them.
    pub async fn put_object_tagging(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
        tags: BTreeMap<String, String>,
    ) -> EngineResult<ObjectRecord> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "PutObjectTagging", Some(key))?;
        self.update_sidecar(&bucket, key, move |record| {
            record.tags = tags.clone();
        })
        .await
    }

    /// Read an object's tags.
    pub fn get_object_tagging(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
    ) -> EngineResult<BTreeMap<String, String>> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "GetObjectTagging", Some(key))?;

        bucket
            .keys
            .read()
            .get_current(key, Utc::now())
            .map(|record| record.tags.clone())
            .ok_or_else(|| EngineError::NoSuchKey {
                key: key.to_owned(),
            })
    }

    /// Replace an object's cache policy. `None` falls back to the bucket
    /// default at read time.
    pub async fn put_cache_control(
        &self,
        principal: &str,
        bucket_name: &str,
        key: &str,
        cache_control: Option<String>,
    ) -> EngineResult<ObjectRecord> {
        let bucket = self.meta().bucket(bucket_name)?;
        self.authorize(&bucket, principal, "PutObject", Some(key))?;
        self.update_sidecar(&bucket, key, move |record| {
            record.cache_control = cache_control.clone();
        })
        .await
    }

    /// Apply a sidecar mutation to the current version of `key`.
    ///
    /// Versioned buckets commit a new version referencing the same blob;
    /// the hold taken per attempt guarantees the blob outlives the CAS
    /// window even against a concurrent delete-and-sweep. Unversioned
    /// buckets mutate the record in place.
    async fn update_sidecar(
        &self,
        bucket: &Bucket,
        key: &str,
        mutate: impl Fn(&mut ObjectRecord),
    ) -> EngineResult<ObjectRecord> {
        if !bucket.is_versioned() {
            let mut keys = bucket.keys.write();
            let record = keys
                .get_current_mut(key, Utc::now())
                .ok_or_else(|| EngineError::NoSuchKey {
                    key: key.to_owned(),
                })?;
            mutate(record);
            debug!(bucket = %bucket.name, key, "sidecar updated in place");
            return Ok(record.clone());
        }

        let max_attempts = self.config().max_commit_attempts.max(1);
        for attempt in 1..=max_attempts {
            let (expected, current) = {
                let keys = bucket.keys.read();
                let expected = keys.current_pointer(key).map(str::to_owned);
                let current = keys.get_current(key, Utc::now()).cloned();
                (expected, current)
            };
            let Some(current) = current else {
                return Err(EngineError::NoSuchKey {
                    key: key.to_owned(),
                });
            };

            let guard = self.blobs().acquire_hold(&current.content_hash)?;
            let mut record = current;
            record.version_id = new_version_id();
            record.created_at = Utc::now();
            mutate(&mut record);

            let result = bucket
                .keys
                .write()
                .commit_version(expected.as_deref(), record.clone());
            match result {
                Ok(outcome) => {
                    guard.commit();
                    if let Some(old) = &outcome.superseded_hash {
                        self.blobs().decref(old);
                    }
                    debug!(
                        bucket = %bucket.name,
                        key,
                        version_id = %record.version_id,
                        "sidecar update committed as new version"
                    );
                    return Ok(record);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    drop(guard);
                    debug!(key, attempt, "sidecar commit conflict, retrying");
                    self.backoff(attempt).await;
                }
                Err(e) if e.is_retryable() => {
                    drop(guard);
                    warn!(key, attempts = max_attempts, "sidecar retry budget exhausted");
                    return Err(EngineError::WriteConflict {
                        key: key.to_owned(),
                        attempts: max_attempts,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop returns on every branch")
    }
}
