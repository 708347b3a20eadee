//! Top-level metadata store.
//!
//! [`MetadataStore`] owns every bucket, keyed by name in a [`DashMap`].
//! Buckets are handed out as `Arc<Bucket>` so callers can work with a
//! bucket without holding the map entry.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use super::bucket::Bucket;
use crate::error::{EngineError, EngineResult};

/// The collection of all buckets.
#[derive(Debug, Default)]
pub struct MetadataStore {
    /// Buckets keyed by name.
    buckets: DashMap<String, Arc<Bucket>>,
}

impl MetadataStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bucket. Names are globally unique and immutable.
    ///
    /// # Errors
    ///
    /// [`EngineError::BucketAlreadyExists`] when the name is taken.
    pub fn create_bucket(&self, name: &str) -> EngineResult<Arc<Bucket>> {
        match self.buckets.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(EngineError::BucketAlreadyExists {
                bucket: name.to_owned(),
            }),
            Entry::Vacant(vacant) => {
                let bucket = Arc::new(Bucket::new(name));
                vacant.insert(Arc::clone(&bucket));
                info!(bucket = %name, "created bucket");
                Ok(bucket)
            }
        }
    }

    /// Look up a bucket by name.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSuchBucket`] when absent.
    pub fn bucket(&self, name: &str) -> EngineResult<Arc<Bucket>> {
        self.buckets
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::NoSuchBucket {
                bucket: name.to_owned(),
            })
    }

    /// Delete a bucket. Only permitted when it holds no live objects and
    /// no in-progress uploads.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NoSuchBucket`] when absent.
    /// - [`EngineError::BucketNotEmpty`] when objects or uploads remain.
    pub fn delete_bucket(&self, name: &str) -> EngineResult<()> {
        match self.buckets.entry(name.to_owned()) {
            Entry::Occupied(occupied) => {
                // Emptiness is checked under the entry lock, so a
                // concurrent put into this bucket either lands before the
                // check or fails its bucket lookup after removal.
                if occupied.get().is_empty(Utc::now()) {
                    occupied.remove();
                    info!(bucket = %name, "deleted bucket");
                    Ok(())
                } else {
                    Err(EngineError::BucketNotEmpty {
                        bucket: name.to_owned(),
                    })
                }
            }
            Entry::Vacant(_) => Err(EngineError::NoSuchBucket {
                bucket: name.to_owned(),
            }),
        }
    }

    /// Bucket names in sorted order.
    #[must_use]
    pub fn list_buckets(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Every bucket handle, for background sweeps.
    #[must_use]
    pub fn all_buckets(&self) -> Vec<Arc<Bucket>> {
        self.buckets
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no buckets exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop all buckets. Test helper.
    pub fn reset(&self) {
        debug!("resetting metadata store");
        self.buckets.clear();
    }
}
