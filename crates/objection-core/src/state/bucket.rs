//! Per-bucket state.
//!
//! A [`Bucket`] owns everything scoped to one bucket: the key store, the
//! multipart upload table, completed-upload tombstones, the bucket policy,
//! and supplementary bucket settings (default cache policy, access
//! logging). Interior mutability uses `parking_lot::RwLock` for
//! single-valued fields and the key store, and `DashMap` for the upload
//! tables, matching how the engine locks them: key-store access is brief
//! and never spans I/O, upload sessions lock per entry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::keystore::KeyStore;
use super::multipart::{CompletedUpload, UploadSession};
use crate::policy::Statement;

/// A bucket with all its state and configuration.
pub struct Bucket {
    /// Stable bucket identity.
    pub id: Uuid,
    /// Globally unique, immutable bucket name.
    pub name: String,
    /// When the bucket was created.
    pub created_at: DateTime<Utc>,

    // -- object metadata --
    /// Key-to-version-chain store.
    pub keys: RwLock<KeyStore>,

    // -- multipart uploads --
    /// In-progress upload sessions, keyed by upload ID.
    pub uploads: DashMap<String, UploadSession>,
    /// Tombstones for completed uploads, keyed by upload ID.
    pub completed_uploads: DashMap<String, CompletedUpload>,

    // -- access control / settings --
    /// Bucket policy statements.
    pub policy: RwLock<Vec<Statement>>,
    /// Cache policy applied to objects without their own `cache_control`.
    pub default_cache_policy: RwLock<Option<String>>,
    /// Whether access logging is enabled for this bucket.
    pub access_logging: RwLock<bool>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .field("uploads", &self.uploads.len())
            .finish_non_exhaustive()
    }
}

impl Bucket {
    /// Create an empty bucket.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(bucket = %name, "creating bucket");
        Self {
            id: Uuid::new_v4(),
            name,
            created_at: Utc::now(),
            keys: RwLock::new(KeyStore::default()),
            uploads: DashMap::new(),
            completed_uploads: DashMap::new(),
            policy: RwLock::new(Vec::new()),
            default_cache_policy: RwLock::new(None),
            access_logging: RwLock::new(false),
        }
    }

    /// Whether versioning is enabled.
    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.keys.read().is_versioned()
    }

    /// Enable versioning; existing records become the first retained
    /// version of their key. One-way.
    pub fn enable_versioning(&self) {
        self.keys.write().enable_versioning();
    }

    /// Whether the bucket holds no live objects and no in-progress
    /// uploads as of `now`. Deletion is only permitted when empty.
    #[must_use]
    pub fn is_empty(&self, now: DateTime<Utc>) -> bool {
        self.keys.read().is_empty(now) && self.uploads.is_empty()
    }

    /// Snapshot of the bucket policy statements.
    #[must_use]
    pub fn policy_snapshot(&self) -> Vec<Statement> {
        self.policy.read().clone()
    }

    /// Replace the bucket policy.
    pub fn set_policy(&self, statements: Vec<Statement>) {
        debug!(bucket = %self.name, statements = statements.len(), "replacing bucket policy");
        *self.policy.write() = statements;
    }
}
