//! Engine error types.
//!
//! Defines [`EngineError`], the domain error enum covering every failure
//! the storage engine may produce. The protocol layer maps these onto
//! wire-level responses; inside the engine only [`EngineError::Conflict`]
//! is retried (by the bounded CAS commit loop), all other variants
//! propagate unchanged to the caller.
//!
//! # Usage
//!
//! ```
//! use objection_core::error::EngineError;
//!
//! let err = EngineError::NoSuchBucket {
//!     bucket: "images".to_owned(),
//! };
//! assert!(err.is_not_found());
//! assert!(!err.is_retryable());
//! ```

/// Engine error type.
///
/// Each variant corresponds to a distinct failure class. Variants carry
/// enough context to produce a useful message without the caller having to
/// re-derive it.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -----------------------------------------------------------------------
    // Not-found errors
    // -----------------------------------------------------------------------
    /// The specified bucket does not exist.
    #[error("the specified bucket does not exist: {bucket}")]
    NoSuchBucket {
        /// The bucket name that was not found.
        bucket: String,
    },

    /// The specified key does not exist (or its current version has expired).
    #[error("the specified key does not exist: {key}")]
    NoSuchKey {
        /// The key that was not found.
        key: String,
    },

    /// The specified version does not exist.
    #[error("the specified version does not exist: key={key}, version_id={version_id}")]
    NoSuchVersion {
        /// The key for the version.
        key: String,
        /// The version ID that was not found.
        version_id: String,
    },

    /// No blob is stored under the given content hash.
    #[error("no blob stored for content hash {content_hash}")]
    NoSuchBlob {
        /// The content hash that was not found.
        content_hash: String,
    },

    /// The specified multipart upload session does not exist.
    #[error("the specified upload does not exist: {upload_id}")]
    NoSuchUpload {
        /// The upload ID that was not found.
        upload_id: String,
    },

    // -----------------------------------------------------------------------
    // Bucket lifecycle errors
    // -----------------------------------------------------------------------
    /// A bucket with the same name already exists.
    #[error("the requested bucket name is not available: {bucket}")]
    BucketAlreadyExists {
        /// The bucket name that already exists.
        bucket: String,
    },

    /// The bucket is not empty and cannot be deleted.
    #[error("the bucket you tried to delete is not empty: {bucket}")]
    BucketNotEmpty {
        /// The bucket name that is not empty.
        bucket: String,
    },

    // -----------------------------------------------------------------------
    // Concurrency errors
    // -----------------------------------------------------------------------
    /// The current-version pointer no longer matches the expected value.
    ///
    /// Retryable: the caller should re-read the current pointer and attempt
    /// the commit again.
    #[error("current-version pointer changed concurrently for key {key}")]
    Conflict {
        /// The contended key.
        key: String,
    },

    /// The bounded CAS retry budget was exhausted.
    #[error("write conflict on key {key} persisted after {attempts} attempts")]
    WriteConflict {
        /// The contended key.
        key: String,
        /// Number of commit attempts made before giving up.
        attempts: u32,
    },

    // -----------------------------------------------------------------------
    // Access control
    // -----------------------------------------------------------------------
    /// Access denied by policy evaluation.
    #[error("access denied: principal={principal}, action={action}, resource={resource}")]
    Forbidden {
        /// The principal that was denied.
        principal: String,
        /// The action that was attempted.
        action: String,
        /// The resource the action targeted.
        resource: String,
    },

    // -----------------------------------------------------------------------
    // Multipart errors
    // -----------------------------------------------------------------------
    /// The client-provided part list does not match the recorded parts.
    ///
    /// Not retried automatically: the caller must re-derive the part list
    /// (e.g. by listing the recorded parts) before completing again.
    #[error("part list mismatch for upload {upload_id}: {reason}")]
    PartMismatch {
        /// The upload the completion targeted.
        upload_id: String,
        /// Why validation failed (count, order, or etag mismatch).
        reason: String,
    },

    /// The operation is not valid for the session's current state.
    #[error("upload {upload_id} is in state {state}, which does not permit this operation")]
    UploadStateConflict {
        /// The upload whose state rejected the operation.
        upload_id: String,
        /// The state the session was observed in.
        state: String,
    },

    // -----------------------------------------------------------------------
    // Storage integrity / capacity
    // -----------------------------------------------------------------------
    /// A stored blob failed hash re-verification on read.
    ///
    /// Fatal for that blob; surfaced to the caller and logged for alerting,
    /// never silently repaired.
    #[error("stored blob failed hash verification: {content_hash}")]
    Corrupt {
        /// The content hash whose payload no longer matches.
        content_hash: String,
    },

    /// The storage backend is out of space; the write was rejected with no
    /// partial state persisted.
    #[error("capacity exceeded: {requested} bytes requested, {available} available")]
    CapacityExceeded {
        /// Bytes the rejected write needed.
        requested: u64,
        /// Bytes remaining under the configured budget.
        available: u64,
    },

    // -----------------------------------------------------------------------
    // Validation / catch-all
    // -----------------------------------------------------------------------
    /// An argument provided is invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Internal error with context.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error is a transient CAS conflict the engine may retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether this error reports a missing entity.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoSuchBucket { .. }
                | Self::NoSuchKey { .. }
                | Self::NoSuchVersion { .. }
                | Self::NoSuchBlob { .. }
                | Self::NoSuchUpload { .. }
        )
    }
}

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
