//! Content hashing and ETag derivation.
//!
//! The engine identifies blobs by the hex-encoded SHA-256 digest of their
//! full payload. ETags are derived from content hashes: single-part objects
//! carry the quoted content hash, multipart objects carry a composite ETag
//! (digest of the concatenated per-part binary digests with a `-N` part
//! count suffix) so the final ETag is derivable from per-part hashes alone.

use digest::Digest;
use sha2::Sha256;

/// Compute the hex-encoded SHA-256 content hash of `data`.
///
/// # Examples
///
/// ```
/// use objection_core::checksums::content_hash;
///
/// let hash = content_hash(b"hello");
/// assert_eq!(hash.len(), 64);
/// assert_eq!(
///     hash,
///     "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
/// );
/// ```
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Incremental content hasher for streaming writes.
///
/// Feed payload chunks with [`ContentHasher::update`] and call
/// [`ContentHasher::finalize`] once the stream ends.
#[derive(Debug, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    /// Create a fresh hasher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a payload chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    /// Finish hashing and return the hex-encoded digest.
    #[must_use]
    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Derive a quoted ETag from a content hash.
///
/// # Examples
///
/// ```
/// use objection_core::checksums::etag_for_hash;
///
/// assert_eq!(etag_for_hash("abc123"), "\"abc123\"");
/// ```
#[must_use]
pub fn etag_for_hash(hash: &str) -> String {
    format!("\"{hash}\"")
}

/// Compute a composite ETag for a multipart-assembled object.
///
/// The composite ETag is the SHA-256 of the concatenated binary digests of
/// each part, formatted as `"<hex>-<part_count>"`. Each entry in
/// `part_hashes` should be the *unquoted* hex content hash of a part, in
/// part-number order.
///
/// # Examples
///
/// ```
/// use objection_core::checksums::{composite_etag, content_hash};
///
/// let parts = [content_hash(b"hello "), content_hash(b"world")];
/// let etag = composite_etag(&parts);
/// assert!(etag.ends_with("-2\""));
/// ```
#[must_use]
pub fn composite_etag(part_hashes: &[impl AsRef<str>]) -> String {
    let mut combined = Vec::with_capacity(part_hashes.len() * 32);
    for hash in part_hashes {
        let hash = hash.as_ref().trim_matches('"');
        if let Ok(bytes) = hex::decode(hash) {
            combined.extend_from_slice(&bytes);
        }
    }
    let digest = hex::encode(Sha256::digest(&combined));
    format!("\"{digest}-{}\"", part_hashes.len())
}
