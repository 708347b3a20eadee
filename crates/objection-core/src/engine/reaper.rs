//! Background maintenance sweeps.
//!
//! The reaper does four things on each pass: permanently removes expired
//! object versions, aborts abandoned multipart sessions (releasing their
//! part holds, exactly like an explicit abort), prunes stale
//! completed-upload tombstones, and collects unreferenced blobs. Blob
//! collection runs last so references released earlier in the same pass
//! are reclaimed immediately.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use super::ObjectEngine;

/// What one reaper pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    /// Expired object versions removed.
    pub expired_versions: usize,
    /// Abandoned upload sessions aborted.
    pub reaped_uploads: usize,
    /// Completed-upload tombstones pruned.
    pub pruned_tombstones: usize,
    /// Blobs collected.
    pub collected_blobs: usize,
}

impl ObjectEngine {
    /// Permanently remove expired object versions and release their blob
    /// references. Returns the number of versions removed.
    pub fn sweep_expired_objects(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0usize;
        for bucket in self.meta().all_buckets() {
            let hashes = bucket.keys.write().sweep_expired(now);
            removed += hashes.len();
            for hash in &hashes {
                self.blobs().decref(hash);
            }
        }
        removed
    }

    /// Abort upload sessions with no activity past the configured TTL and
    /// prune stale completion tombstones. Sessions with a completion in
    /// flight are left alone. Returns `(reaped_sessions, pruned_tombstones)`.
    pub fn sweep_uploads(&self) -> (usize, usize) {
        let now = Utc::now();
        let session_ttl = seconds(self.config().upload_session_ttl_secs);
        let tombstone_ttl = seconds(self.config().upload_tombstone_ttl_secs);

        let mut reaped = 0usize;
        let mut pruned = 0usize;
        for bucket in self.meta().all_buckets() {
            let stale: Vec<String> = bucket
                .uploads
                .iter()
                .filter(|entry| {
                    entry.is_stale(now, session_ttl) && entry.check_abortable().is_ok()
                })
                .map(|entry| entry.key().clone())
                .collect();
            for upload_id in stale {
                let removed = bucket.uploads.remove_if(&upload_id, |_, session| {
                    session.is_stale(now, session_ttl) && session.check_abortable().is_ok()
                });
                if let Some((_, session)) = removed {
                    debug!(bucket = %bucket.name, upload_id = %upload_id, "reaping abandoned upload");
                    for hash in session.part_hashes() {
                        self.blobs().release_hold(&hash);
                    }
                    reaped += 1;
                }
            }

            let before = bucket.completed_uploads.len();
            bucket
                .completed_uploads
                .retain(|_, tombstone| !tombstone.is_stale(now, tombstone_ttl));
            pruned += before - bucket.completed_uploads.len();
        }
        (reaped, pruned)
    }

    /// Collect every blob whose refcount and hold count are both zero.
    pub fn sweep_blobs(&self) -> usize {
        self.blobs().sweep()
    }

    /// Run one full maintenance pass.
    pub fn sweep_all(&self) -> ReaperStats {
        let expired_versions = self.sweep_expired_objects();
        let (reaped_uploads, pruned_tombstones) = self.sweep_uploads();
        let collected_blobs = self.sweep_blobs();

        let stats = ReaperStats {
            expired_versions,
            reaped_uploads,
            pruned_tombstones,
            collected_blobs,
        };
        if stats != ReaperStats::default() {
            info!(
                expired = stats.expired_versions,
                uploads = stats.reaped_uploads,
                tombstones = stats.pruned_tombstones,
                blobs = stats.collected_blobs,
                "reaper pass complete"
            );
        }
        stats
    }

    /// Spawn the periodic reaper task. Runs until the handle is aborted
    /// or the runtime shuts down.
    #[must_use]
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = std::time::Duration::from_secs(engine.config().reaper_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh engine
            // is not swept at startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.sweep_all();
            }
        })
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}
