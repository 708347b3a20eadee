//! Multipart upload session state.
//!
//! An [`UploadSession`] tracks one in-progress multipart upload through an
//! explicit state machine. Part payloads are written to the blob store as
//! they arrive; the session records each part's content hash together with
//! a provisional hold, so nothing a live session references can be
//! garbage-collected. Transitions that a state does not permit fail with a
//! typed state conflict rather than corrupting the session.
//!
//! Completion is two-phase: [`UploadSession::begin_complete`] moves the
//! session to [`SessionState::CompletePending`] (fencing out concurrent
//! completes, part uploads, and aborts), the assembled object is built and
//! committed outside the session lock, and the session is then either
//! removed (replaced by a [`CompletedUpload`] tombstone for idempotent
//! retries) or rolled back to accept a corrected part list.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// The lifecycle state of a multipart upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created; no parts uploaded yet.
    Initiated,
    /// At least one part recorded; more may arrive.
    PartsUploading,
    /// A completion is assembling the final object. Part uploads, aborts,
    /// and second completions are fenced out.
    CompletePending,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiated => "initiated",
            Self::PartsUploading => "parts-uploading",
            Self::CompletePending => "complete-pending",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// PartRecord
// ---------------------------------------------------------------------------

/// One uploaded part, pointing at its blob by content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    /// The part number (1-based).
    pub part_number: u32,
    /// Hex SHA-256 content hash of the part payload.
    pub content_hash: String,
    /// Part size in bytes.
    pub size: u64,
    /// Quoted per-part ETag.
    pub etag: String,
    /// When the part was uploaded.
    pub uploaded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// UploadSession
// ---------------------------------------------------------------------------

/// An in-progress multipart upload.
///
/// Object metadata is captured at initiation and applied to the assembled
/// object at completion. Parts are keyed by part number; re-uploading a
/// number replaces the previous part, whose blob hold the caller must
/// release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Unique identifier for this upload.
    pub upload_id: String,
    /// The object key the upload will create.
    pub key: String,
    /// MIME type for the final object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Cache policy for the final object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    /// Tags for the final object.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// When the upload was initiated.
    pub initiated_at: DateTime<Utc>,
    /// Last part upload or completion attempt; drives reaper staleness.
    pub last_activity_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Parts uploaded so far, keyed by part number.
    pub parts: BTreeMap<u32, PartRecord>,
}

impl UploadSession {
    /// Create a fresh session in [`SessionState::Initiated`].
    #[must_use]
    pub fn new(upload_id: impl Into<String>, key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            upload_id: upload_id.into(),
            key: key.into(),
            content_type: None,
            cache_control: None,
            tags: BTreeMap::new(),
            initiated_at: now,
            last_activity_at: now,
            state: SessionState::Initiated,
            parts: BTreeMap::new(),
        }
    }

    /// Record an uploaded part, returning the part it replaced (if any) so
    /// the caller can release the replaced part's blob hold.
    ///
    /// # Errors
    ///
    /// [`EngineError::UploadStateConflict`] when a completion is pending.
    pub fn record_part(&mut self, part: PartRecord) -> EngineResult<Option<PartRecord>> {
        match self.state {
            SessionState::Initiated | SessionState::PartsUploading => {
                self.state = SessionState::PartsUploading;
                self.last_activity_at = Utc::now();
                Ok(self.parts.insert(part.part_number, part))
            }
            SessionState::CompletePending => Err(self.state_conflict()),
        }
    }

    /// Move to [`SessionState::CompletePending`], fencing out concurrent
    /// part uploads, aborts, and second completions.
    ///
    /// # Errors
    ///
    /// [`EngineError::UploadStateConflict`] when a completion is already
    /// pending.
    pub fn begin_complete(&mut self) -> EngineResult<()> {
        match self.state {
            SessionState::Initiated | SessionState::PartsUploading => {
                self.state = SessionState::CompletePending;
                self.last_activity_at = Utc::now();
                Ok(())
            }
            SessionState::CompletePending => Err(self.state_conflict()),
        }
    }

    /// Roll a failed completion back so a corrected part list can be
    /// retried.
    pub fn fail_complete(&mut self) {
        if self.state == SessionState::CompletePending {
            self.state = SessionState::PartsUploading;
            self.last_activity_at = Utc::now();
        }
    }

    /// Check that the session may be aborted in its current state.
    ///
    /// # Errors
    ///
    /// [`EngineError::UploadStateConflict`] while a completion is pending;
    /// the abort must wait for the completion to settle.
    pub fn check_abortable(&self) -> EngineResult<()> {
        match self.state {
            SessionState::Initiated | SessionState::PartsUploading => Ok(()),
            SessionState::CompletePending => Err(self.state_conflict()),
        }
    }

    /// Content hashes of every recorded part, for hold release.
    #[must_use]
    pub fn part_hashes(&self) -> Vec<String> {
        self.parts.values().map(|p| p.content_hash.clone()).collect()
    }

    /// Total size of all recorded parts in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.parts.values().map(|p| p.size).sum()
    }

    /// Whether the session has seen no activity for longer than `ttl`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_activity_at > ttl
    }

    fn state_conflict(&self) -> EngineError {
        EngineError::UploadStateConflict {
            upload_id: self.upload_id.clone(),
            state: self.state.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// CompletedUpload
// ---------------------------------------------------------------------------

/// Tombstone kept after a completed upload's session is removed.
///
/// A retried completion for the same upload ID returns this result instead
/// of failing, making completion idempotent. Aborts and part uploads after
/// completion still observe the session as gone (not-found). Pruned by the
/// reaper after a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    /// The upload ID the tombstone stands in for.
    pub upload_id: String,
    /// The key the upload committed.
    pub key: String,
    /// Version ID of the committed object.
    pub version_id: String,
    /// Content hash of the assembled payload.
    pub content_hash: String,
    /// Composite ETag of the committed object.
    pub etag: String,
    /// Assembled size in bytes.
    pub size: u64,
    /// Number of parts assembled.
    pub parts_count: u32,
    /// The parts that were assembled, for validating retried completions.
    pub parts: Vec<PartRecord>,
    /// When the completion committed.
    pub completed_at: DateTime<Utc>,
}

impl CompletedUpload {
    /// Whether the tombstone is older than `ttl`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.completed_at > ttl
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_part(number: u32, hash: &str, size: u64) -> PartRecord {
        PartRecord {
            part_number: number,
            content_hash: hash.to_owned(),
            size,
            etag: format!("\"{hash}\""),
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_should_start_in_initiated_state() {
        let session = UploadSession::new("u-1", "data.bin");
        assert_eq!(session.state, SessionState::Initiated);
        assert!(session.parts.is_empty());
        assert_eq!(session.total_size(), 0);
    }

    #[test]
    fn test_should_transition_to_parts_uploading_on_first_part() {
        let mut session = UploadSession::new("u-1", "data.bin");
        session
            .record_part(make_part(1, "h1", 100))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));
        assert_eq!(session.state, SessionState::PartsUploading);
        assert_eq!(session.parts.len(), 1);
    }

    #[test]
    fn test_should_replace_part_and_return_previous() {
        let mut session = UploadSession::new("u-1", "data.bin");
        session
            .record_part(make_part(1, "old", 100))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));
        let replaced = session
            .record_part(make_part(1, "new", 200))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));

        assert_eq!(replaced.map(|p| p.content_hash), Some("old".to_owned()));
        assert_eq!(session.parts.len(), 1);
        assert_eq!(session.total_size(), 200);
    }

    #[test]
    fn test_should_fence_part_uploads_while_complete_pending() {
        let mut session = UploadSession::new("u-1", "data.bin");
        session
            .record_part(make_part(1, "h1", 100))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));
        session
            .begin_complete()
            .unwrap_or_else(|e| panic!("begin_complete failed: {e}"));

        let result = session.record_part(make_part(2, "h2", 100));
        assert!(matches!(
            result,
            Err(EngineError::UploadStateConflict { .. })
        ));
    }

    #[test]
    fn test_should_reject_concurrent_completion() {
        let mut session = UploadSession::new("u-1", "data.bin");
        session
            .record_part(make_part(1, "h1", 100))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));
        session
            .begin_complete()
            .unwrap_or_else(|e| panic!("begin_complete failed: {e}"));

        let result = session.begin_complete();
        assert!(matches!(
            result,
            Err(EngineError::UploadStateConflict { .. })
        ));
    }

    #[test]
    fn test_should_reject_abort_while_complete_pending() {
        let mut session = UploadSession::new("u-1", "data.bin");
        session
            .record_part(make_part(1, "h1", 100))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));
        assert!(session.check_abortable().is_ok());

        session
            .begin_complete()
            .unwrap_or_else(|e| panic!("begin_complete failed: {e}"));
        assert!(matches!(
            session.check_abortable(),
            Err(EngineError::UploadStateConflict { .. })
        ));
    }

    #[test]
    fn test_should_allow_retry_after_failed_completion() {
        let mut session = UploadSession::new("u-1", "data.bin");
        session
            .record_part(make_part(1, "h1", 100))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));
        session
            .begin_complete()
            .unwrap_or_else(|e| panic!("begin_complete failed: {e}"));

        session.fail_complete();
        assert_eq!(session.state, SessionState::PartsUploading);
        // A corrected part list can be uploaded and completed again.
        session
            .record_part(make_part(2, "h2", 100))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));
        session
            .begin_complete()
            .unwrap_or_else(|e| panic!("begin_complete failed: {e}"));
    }

    #[test]
    fn test_should_collect_part_hashes_in_part_number_order() {
        let mut session = UploadSession::new("u-1", "data.bin");
        session
            .record_part(make_part(3, "h3", 10))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));
        session
            .record_part(make_part(1, "h1", 10))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));
        session
            .record_part(make_part(2, "h2", 10))
            .unwrap_or_else(|e| panic!("record_part failed: {e}"));

        assert_eq!(session.part_hashes(), vec!["h1", "h2", "h3"]);
        assert_eq!(session.total_size(), 30);
    }

    #[test]
    fn test_should_report_stale_session_by_last_activity() {
        let mut session = UploadSession::new("u-1", "data.bin");
        let now = Utc::now();
        assert!(!session.is_stale(now, Duration::hours(1)));

        session.last_activity_at = now - Duration::hours(2);
        assert!(session.is_stale(now, Duration::hours(1)));
        assert!(!session.is_stale(now, Duration::hours(3)));
    }

    #[test]
    fn test_should_report_stale_tombstone() {
        let tombstone = CompletedUpload {
            upload_id: "u-1".to_owned(),
            key: "data.bin".to_owned(),
            version_id: "v-1".to_owned(),
            content_hash: "h".to_owned(),
            etag: "\"h-2\"".to_owned(),
            size: 20,
            parts_count: 2,
            parts: Vec::new(),
            completed_at: Utc::now() - Duration::hours(2),
        };
        assert!(tombstone.is_stale(Utc::now(), Duration::hours(1)));
        assert!(!tombstone.is_stale(Utc::now(), Duration::hours(3)));
    }
}
