//! Object version records and delete markers.
//!
//! An [`ObjectRecord`] is immutable metadata for one committed version of a
//! key: it points at a blob by content hash and never owns payload bytes.
//! Updating a key produces a new record; the old record stays readable by
//! version ID in versioned buckets. A [`DeleteMarker`] is the version-chain
//! entry a delete writes in a versioned bucket.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::Statement;

// ---------------------------------------------------------------------------
// ObjectRecord
// ---------------------------------------------------------------------------

/// Immutable metadata for one committed object version.
///
/// The record's identity is `(key, version_id)`. Sidecar mutations (tags,
/// cache policy) on unversioned buckets replace fields in place; in
/// versioned buckets they commit a fresh record instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    /// The object key.
    pub key: String,
    /// Unique version ID, assigned at commit time.
    pub version_id: String,
    /// Hex SHA-256 content hash of the payload; the blob store key.
    pub content_hash: String,
    /// Payload size in bytes.
    pub size: u64,
    /// Entity tag: quoted content hash, or composite form for
    /// multipart-assembled objects.
    pub etag: String,
    /// MIME type of the payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Cache policy directives (e.g. `max-age=3600`); falls back to the
    /// bucket default when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    /// User tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Per-object ACL statements, evaluated together with the bucket policy.
    #[serde(default)]
    pub acl: Vec<Statement>,
    /// When this version was committed.
    pub created_at: DateTime<Utc>,
    /// Optional expiration; past this instant the version reads as absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of parts if assembled by a multipart upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts_count: Option<u32>,
}

impl ObjectRecord {
    /// Create a record with the required identity fields; optional
    /// metadata starts empty.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        version_id: impl Into<String>,
        content_hash: impl Into<String>,
        size: u64,
        etag: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            version_id: version_id.into(),
            content_hash: content_hash.into(),
            size,
            etag: etag.into(),
            content_type: None,
            cache_control: None,
            tags: BTreeMap::new(),
            acl: Vec::new(),
            created_at: Utc::now(),
            expires_at: None,
            parts_count: None,
        }
    }

    /// Whether the version has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// DeleteMarker
// ---------------------------------------------------------------------------

/// A delete marker in a versioned bucket.
///
/// Becomes the current version of its key: reads of the key report
/// not-found while older versions stay addressable by version ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMarker {
    /// The object key.
    pub key: String,
    /// Version ID of the marker itself.
    pub version_id: String,
    /// When the delete was committed.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ObjectVersion
// ---------------------------------------------------------------------------

/// One entry in a key's version chain: a record or a delete marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ObjectVersion {
    /// A committed object version (boxed to reduce enum size).
    Record(Box<ObjectRecord>),
    /// A delete-marker version.
    DeleteMarker(DeleteMarker),
}

impl ObjectVersion {
    /// The object key.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Record(record) => &record.key,
            Self::DeleteMarker(marker) => &marker.key,
        }
    }

    /// The version ID.
    #[must_use]
    pub fn version_id(&self) -> &str {
        match self {
            Self::Record(record) => &record.version_id,
            Self::DeleteMarker(marker) => &marker.version_id,
        }
    }

    /// When this chain entry was committed.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Record(record) => record.created_at,
            Self::DeleteMarker(marker) => marker.created_at,
        }
    }

    /// Whether this entry is a delete marker.
    #[must_use]
    pub fn is_delete_marker(&self) -> bool {
        matches!(self, Self::DeleteMarker(_))
    }

    /// The content hash, if this entry is a record.
    #[must_use]
    pub fn content_hash(&self) -> Option<&str> {
        self.as_record().map(|r| r.content_hash.as_str())
    }

    /// The inner record, if this entry is one.
    #[must_use]
    pub fn as_record(&self) -> Option<&ObjectRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::DeleteMarker(_) => None,
        }
    }

    /// Mutable access to the inner record, if this entry is one.
    pub fn as_record_mut(&mut self) -> Option<&mut ObjectRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::DeleteMarker(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
