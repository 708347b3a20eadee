//! Metadata state: buckets, key version chains, and multipart sessions.

pub mod bucket;
pub mod keystore;
pub mod multipart;
pub mod object;
pub mod service;

pub use bucket::Bucket;
pub use keystore::{CommitOutcome, DeleteOutcome, KeyStore, ListResult};
pub use multipart::{CompletedUpload, PartRecord, SessionState, UploadSession};
pub use object::{DeleteMarker, ObjectRecord, ObjectVersion};
pub use service::MetadataStore;
