//! Versioned key metadata with compare-and-swap commits.
//!
//! [`KeyStore`] maps object keys to version chains (newest first) inside a
//! `BTreeMap`, so keys are always sorted for correct listing pagination.
//! Every mutation of a key's current version goes through a CAS commit:
//! the caller states which version ID it believes is current, and the
//! commit fails with a retryable conflict if the pointer moved underneath
//! it. Whether the bucket is versioned only changes what happens to the
//! superseded entry; the commit protocol is identical.
//!
//! Version IDs are real UUIDs even in unversioned mode, so enabling
//! versioning later is a flag flip with no migration: existing records
//! become the first retained version of their key.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::object::{DeleteMarker, ObjectRecord, ObjectVersion};
use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Outcome / list result types
// ---------------------------------------------------------------------------

/// The result of a successful version commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Version ID of the committed entry.
    pub version_id: String,
    /// Content hash of the record this commit replaced, when the
    /// replacement made that record unreachable (unversioned supersede).
    /// The caller owns releasing its blob reference.
    pub superseded_hash: Option<String>,
}

/// The result of a successful delete commit.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    /// Version ID of the delete marker, when one was written (versioned
    /// buckets only).
    pub marker_version_id: Option<String>,
    /// Content hash of the record the delete removed outright
    /// (unversioned buckets). The caller owns releasing its blob reference.
    pub removed_hash: Option<String>,
    /// Whether a live record existed for the key before the delete.
    pub existed: bool,
}

/// Result of a paginated object listing.
#[derive(Debug, Clone)]
pub struct ListResult {
    /// Current records matching the listing criteria.
    pub records: Vec<ObjectRecord>,
    /// Common prefixes when a delimiter is used.
    pub common_prefixes: Vec<String>,
    /// Whether more keys are available.
    pub is_truncated: bool,
    /// The key to pass as `start_after` for the next page.
    pub next_marker: Option<String>,
}

// ---------------------------------------------------------------------------
// KeyStore
// ---------------------------------------------------------------------------

/// Sorted key-to-version-chain store for one bucket.
#[derive(Debug, Default)]
pub struct KeyStore {
    /// Key to version chain, newest entry first.
    keys: BTreeMap<String, Vec<ObjectVersion>>,
    /// Whether superseded versions are retained and deletes write markers.
    versioned: bool,
}

impl KeyStore {
    /// Whether versioning is enabled.
    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    /// Enable versioning. Existing records are retroactively promoted:
    /// each becomes the first retained version of its key. One-way.
    pub fn enable_versioning(&mut self) {
        if !self.versioned {
            debug!("enabling versioning");
            self.versioned = true;
        }
    }

    /// The version ID of the latest chain entry for a key, delete markers
    /// included. This is the value a CAS commit must name as `expected`;
    /// `None` means the key has no chain at all.
    #[must_use]
    pub fn current_pointer(&self, key: &str) -> Option<&str> {
        self.keys
            .get(key)
            .and_then(|chain| chain.first())
            .map(ObjectVersion::version_id)
    }

    /// The current readable record for a key.
    ///
    /// Returns `None` when the key is absent, its latest entry is a delete
    /// marker, or the current record has expired as of `now`.
    #[must_use]
    pub fn get_current(&self, key: &str, now: DateTime<Utc>) -> Option<&ObjectRecord> {
        let record = self.keys.get(key)?.first()?.as_record()?;
        if record.is_expired(now) {
            None
        } else {
            Some(record)
        }
    }

    /// Mutable access to the current readable record, for in-place sidecar
    /// updates on unversioned buckets.
    pub fn get_current_mut(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut ObjectRecord> {
        let record = self.keys.get_mut(key)?.first_mut()?.as_record_mut()?;
        if record.is_expired(now) {
            None
        } else {
            Some(record)
        }
    }

    /// Look up a chain entry by version ID. Expired records stay
    /// addressable by version until the reaper removes them.
    #[must_use]
    pub fn get_version(&self, key: &str, version_id: &str) -> Option<&ObjectVersion> {
        self.keys
            .get(key)?
            .iter()
            .find(|v| v.version_id() == version_id)
    }

    /// The full version chain for a key, newest first.
    #[must_use]
    pub fn versions(&self, key: &str) -> &[ObjectVersion] {
        self.keys.get(key).map_or(&[], Vec::as_slice)
    }

    // -----------------------------------------------------------------------
    // CAS commits
    // -----------------------------------------------------------------------

    /// Commit a new version of `record.key`, provided the current pointer
    /// still equals `expected`.
    ///
    /// In versioned mode the record is prepended and the superseded entry
    /// is retained. In unversioned mode the chain is replaced and the
    /// superseded record's hash is returned so the caller can release its
    /// blob reference.
    ///
    /// # Errors
    ///
    /// [`EngineError::Conflict`] when the pointer no longer matches
    /// `expected`; the caller re-reads the pointer and retries.
    pub fn commit_version(
        &mut self,
        expected: Option<&str>,
        record: ObjectRecord,
    ) -> EngineResult<CommitOutcome> {
        self.check_pointer(&record.key, expected)?;

        let key = record.key.clone();
        let version_id = record.version_id.clone();
        let entry = ObjectVersion::Record(Box::new(record));
        let chain = self.keys.entry(key.clone()).or_default();

        let superseded_hash = if self.versioned {
            chain.insert(0, entry);
            None
        } else {
            let old = std::mem::replace(chain, vec![entry]);
            old.into_iter()
                .next()
                .and_then(|v| v.content_hash().map(str::to_owned))
        };

        debug!(key = %key, version_id = %version_id, superseded = ?superseded_hash, "committed version");
        Ok(CommitOutcome {
            version_id,
            superseded_hash,
        })
    }

    /// Commit a delete of `key`, provided the current pointer still equals
    /// `expected`.
    ///
    /// Versioned mode writes a delete marker and retains every version.
    /// Unversioned mode removes the chain and returns the removed record's
    /// hash. Deleting an absent key succeeds with `existed: false`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Conflict`] when the pointer no longer matches.
    pub fn commit_delete(
        &mut self,
        key: &str,
        expected: Option<&str>,
    ) -> EngineResult<DeleteOutcome> {
        self.check_pointer(key, expected)?;

        if self.versioned {
            let marker = DeleteMarker {
                key: key.to_owned(),
                version_id: new_version_id(),
                created_at: Utc::now(),
            };
            let version_id = marker.version_id.clone();
            let chain = self.keys.entry(key.to_owned()).or_default();
            let existed = chain.first().is_some_and(|v| !v.is_delete_marker());
            chain.insert(0, ObjectVersion::DeleteMarker(marker));
            debug!(key, version_id = %version_id, "inserted delete marker");
            Ok(DeleteOutcome {
                marker_version_id: Some(version_id),
                removed_hash: None,
                existed,
            })
        } else {
            let removed = self.keys.remove(key);
            let removed_hash = removed
                .as_ref()
                .and_then(|chain| chain.first())
                .and_then(|v| v.content_hash().map(str::to_owned));
            debug!(key, removed = ?removed_hash, "removed key");
            Ok(DeleteOutcome {
                marker_version_id: None,
                existed: removed_hash.is_some(),
                removed_hash,
            })
        }
    }

    /// Remove one version (record or marker) from a key's chain outright.
    /// Returns the removed entry; the caller owns any blob reference.
    pub fn remove_version(&mut self, key: &str, version_id: &str) -> Option<ObjectVersion> {
        let chain = self.keys.get_mut(key)?;
        let idx = chain.iter().position(|v| v.version_id() == version_id)?;
        let removed = chain.remove(idx);
        if chain.is_empty() {
            self.keys.remove(key);
        }
        Some(removed)
    }

    // -----------------------------------------------------------------------
    // Listing / counting
    // -----------------------------------------------------------------------

    /// Number of keys with a live current record as of `now`.
    #[must_use]
    pub fn len(&self, now: DateTime<Utc>) -> usize {
        self.keys
            .keys()
            .filter(|key| self.get_current(key, now).is_some())
            .count()
    }

    /// Whether no key has a live current record.
    #[must_use]
    pub fn is_empty(&self, now: DateTime<Utc>) -> bool {
        self.len(now) == 0
    }

    /// List current records in key order with prefix, delimiter,
    /// start-after, and max-keys semantics.
    ///
    /// Keys whose current version is a delete marker or expired are
    /// skipped. With a delimiter, keys sharing a prefix segment collapse
    /// into a common prefix entry.
    #[must_use]
    pub fn list_objects(
        &self,
        prefix: &str,
        delimiter: &str,
        start_after: &str,
        max_keys: usize,
        now: DateTime<Utc>,
    ) -> ListResult {
        let use_delim = !delimiter.is_empty();
        let mut records: Vec<ObjectRecord> = Vec::new();
        let mut common_prefixes: Vec<String> = Vec::new();
        let mut seen_prefixes = std::collections::HashSet::new();
        let mut is_truncated = false;

        for key in self.keys.keys() {
            if !start_after.is_empty() && key.as_str() <= start_after {
                continue;
            }
            if !prefix.is_empty() && !key.starts_with(prefix) {
                continue;
            }
            let Some(record) = self.get_current(key, now) else {
                continue;
            };

            if use_delim {
                let after_prefix = &key[prefix.len()..];
                if let Some(pos) = after_prefix.find(delimiter) {
                    let cp = format!("{}{}{}", prefix, &after_prefix[..pos], delimiter);
                    if seen_prefixes.insert(cp.clone()) {
                        common_prefixes.push(cp);
                    }
                    continue;
                }
            }

            if records.len() >= max_keys {
                is_truncated = true;
                break;
            }
            records.push(record.clone());
        }

        let next_marker = if is_truncated {
            records.last().map(|r| r.key.clone())
        } else {
            None
        };

        ListResult {
            records,
            common_prefixes,
            is_truncated,
            next_marker,
        }
    }

    // -----------------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------------

    /// Permanently remove every record version that has expired as of
    /// `now`, returning the removed content hashes so the caller can
    /// release their blob references. Delete markers are not expirable.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut removed = Vec::new();
        self.keys.retain(|key, chain| {
            chain.retain(|version| match version.as_record() {
                Some(record) if record.is_expired(now) => {
                    debug!(key = %key, version_id = %record.version_id, "expiring version");
                    removed.push(record.content_hash.clone());
                    false
                }
                _ => true,
            });
            // A chain that is only delete markers left behind by expiry is
            // dead weight; the marker carries no payload.
            !chain.is_empty() && !chain.iter().all(ObjectVersion::is_delete_marker)
        });
        removed
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn check_pointer(&self, key: &str, expected: Option<&str>) -> EngineResult<()> {
        if self.current_pointer(key) == expected {
            Ok(())
        } else {
            Err(EngineError::Conflict {
                key: key.to_owned(),
            })
        }
    }
}

/// Generate a version ID.
#[must_use]
pub fn new_version_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
