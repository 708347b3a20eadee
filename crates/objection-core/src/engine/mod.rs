//! The object engine orchestrator.
//!
//! [`ObjectEngine`] is the public API surface: it sequences every
//! operation as authorize, then blob write, then metadata CAS commit,
//! then release of the superseded blob reference. The CAS commit runs in
//! a bounded retry loop with backoff and jitter; exhausting the budget
//! surfaces [`EngineError::WriteConflict`] to the caller.
//!
//! Bucket administration (create/delete bucket, policy, versioning,
//! bucket settings) is an operator surface and is not policy-checked;
//! every object operation is.

mod multipart;
mod object;
mod reaper;
mod tagging;

pub use multipart::{CompleteOutcome, CompletedPart, CreateUploadOutcome, UploadPartOutcome};
pub use object::{DeleteObjectOutcome, GetOutcome, GetStreamOutcome, PutOptions, PutOutcome};
pub use reaper::ReaperStats;

use std::sync::Arc;

use chrono::Utc;
use rand::RngExt;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::policy::{self, Decision, Statement};
use crate::state::bucket::Bucket;
use crate::state::keystore::{CommitOutcome, new_version_id};
use crate::state::object::ObjectRecord;
use crate::state::service::MetadataStore;

/// Content-addressed object storage engine.
///
/// Owns the metadata store and the blob store; all public operations go
/// through it so the ordering invariants (authorize before any mutation,
/// blob durable before metadata commit, decref only after a successful
/// pointer swap) hold everywhere.
#[derive(Debug)]
pub struct ObjectEngine {
    meta: MetadataStore,
    blobs: BlobStore,
    config: EngineConfig,
}

impl ObjectEngine {
    /// Create an engine from configuration.
    ///
    /// Spill files go under the configured data directory when it can be
    /// created, otherwise the OS temp directory.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let mut blobs = BlobStore::new(config.spill_threshold, config.capacity_bytes);
        match std::fs::create_dir_all(&config.data_dir) {
            Ok(()) => blobs = blobs.with_spill_dir(&config.data_dir),
            Err(e) => {
                warn!(dir = %config.data_dir, error = %e, "data dir unavailable, spilling to OS temp");
            }
        }
        info!(data_dir = %config.data_dir, "starting object engine");
        Self {
            meta: MetadataStore::new(),
            blobs,
            config,
        }
    }

    /// The blob store, for observability and tests.
    #[must_use]
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// The metadata store, for observability and tests.
    #[must_use]
    pub fn meta(&self) -> &MetadataStore {
        &self.meta
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Bucket administration
    // -----------------------------------------------------------------------

    /// Create a bucket.
    ///
    /// # Errors
    ///
    /// [`EngineError::BucketAlreadyExists`] when the name is taken.
    pub fn create_bucket(&self, name: &str) -> EngineResult<Arc<Bucket>> {
        self.meta.create_bucket(name)
    }

    /// Delete a bucket; only permitted when empty.
    pub fn delete_bucket(&self, name: &str) -> EngineResult<()> {
        self.meta.delete_bucket(name)
    }

    /// Bucket names in sorted order.
    #[must_use]
    pub fn list_buckets(&self) -> Vec<String> {
        self.meta.list_buckets()
    }

    /// Replace a bucket's policy statements.
    pub fn set_bucket_policy(&self, name: &str, statements: Vec<Statement>) -> EngineResult<()> {
        self.meta.bucket(name)?.set_policy(statements);
        Ok(())
    }

    /// Enable versioning on a bucket. Existing records become the first
    /// retained version of their key. One-way.
    pub fn enable_versioning(&self, name: &str) -> EngineResult<()> {
        let bucket = self.meta.bucket(name)?;
        bucket.enable_versioning();
        info!(bucket = %name, "versioning enabled");
        Ok(())
    }

    /// Set the cache policy applied to objects without their own
    /// `cache_control`.
    pub fn set_default_cache_policy(
        &self,
        name: &str,
        cache_policy: Option<String>,
    ) -> EngineResult<()> {
        let bucket = self.meta.bucket(name)?;
        *bucket.default_cache_policy.write() = cache_policy;
        Ok(())
    }

    /// Toggle access logging for a bucket.
    pub fn set_access_logging(&self, name: &str, enabled: bool) -> EngineResult<()> {
        let bucket = self.meta.bucket(name)?;
        *bucket.access_logging.write() = enabled;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal plumbing shared by the operation modules
    // -----------------------------------------------------------------------

    /// Authorize `principal` to perform `action` on the bucket or an
    /// object in it. Combines the bucket policy with the current object's
    /// ACL (when a key is given) under explicit-deny-overrides-allow with
    /// a default deny.
    ///
    /// Runs before any blob or metadata mutation and before payload bytes
    /// are returned on reads.
    pub(crate) fn authorize(
        &self,
        bucket: &Bucket,
        principal: &str,
        action: &str,
        key: Option<&str>,
    ) -> EngineResult<()> {
        let resource = match key {
            Some(key) => format!("{}/{key}", bucket.name),
            None => bucket.name.clone(),
        };
        let bucket_statements = bucket.policy_snapshot();
        let object_statements: Vec<Statement> = key
            .and_then(|key| {
                bucket
                    .keys
                    .read()
                    .get_current(key, Utc::now())
                    .map(|record| record.acl.clone())
            })
            .unwrap_or_default();

        let decision = policy::evaluate(
            bucket_statements.iter().chain(object_statements.iter()),
            principal,
            action,
            &resource,
        );
        if decision == Decision::Allow {
            Ok(())
        } else {
            debug!(principal, action, resource = %resource, "access denied");
            Err(EngineError::Forbidden {
                principal: principal.to_owned(),
                action: action.to_owned(),
                resource,
            })
        }
    }

    /// Commit a new version of `key` with a bounded CAS retry loop.
    ///
    /// Each attempt re-reads the current pointer, builds a fresh record
    /// via `build` (which receives the current record, if any, and the
    /// new version ID), and attempts the swap. Conflicts back off with
    /// jitter and retry; budget exhaustion surfaces
    /// [`EngineError::WriteConflict`].
    pub(crate) async fn commit_with_retry(
        &self,
        bucket: &Bucket,
        key: &str,
        build: impl Fn(Option<&ObjectRecord>, String) -> ObjectRecord,
    ) -> EngineResult<CommitOutcome> {
        let max_attempts = self.config.max_commit_attempts.max(1);
        for attempt in 1..=max_attempts {
            let (expected, record) = {
                let keys = bucket.keys.read();
                let expected = keys.current_pointer(key).map(str::to_owned);
                let current = keys.get_current(key, Utc::now());
                (expected, build(current, new_version_id()))
            };
            // Bind the commit result so the write guard drops before any
            // await; the backoff must never hold the key-store lock.
            let result = bucket
                .keys
                .write()
                .commit_version(expected.as_deref(), record);
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    debug!(key, attempt, "commit conflict, retrying");
                    self.backoff(attempt).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(key, attempts = max_attempts, "commit retry budget exhausted");
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

    /// Commit a delete of `key` with the same bounded retry loop as
    /// [`Self::commit_with_retry`].
    pub(crate) async fn delete_with_retry(
        &self,
        bucket: &Bucket,
        key: &str,
    ) -> EngineResult<crate::state::keystore::DeleteOutcome> {
        let max_attempts = self.config.max_commit_attempts.max(1);
        for attempt in 1..=max_attempts {
            let expected = bucket
                .keys
                .read()
                .current_pointer(key)
                .map(str::to_owned);
            let result = bucket.keys.write().commit_delete(key, expected.as_deref());
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    debug!(key, attempt, "delete conflict, retrying");
                    self.backoff(attempt).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(key, attempts = max_attempts, "delete retry budget exhausted");
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

    /// Sleep between CAS attempts: linear base backoff plus jitter.
    async fn backoff(&self, attempt: u32) {
        let base = self.config.commit_backoff_ms.saturating_mul(u64::from(attempt));
        let jitter = rand::rng().random_range(0..=self.config.commit_backoff_ms.max(1));
        tokio::time::sleep(std::time::Duration::from_millis(base + jitter)).await;
    }
}
