//! Content-addressed, deduplicating object storage engine.
//!
//! `objection-core` is the storage core of an S3-compatible object store:
//! payloads are identified by the SHA-256 digest of their bytes, identical
//! content is stored once and reference-counted, object versions become
//! visible through an atomic compare-and-swap on each key's current
//! pointer, and every read or mutation passes a deny-overrides policy
//! check first.
//!
//! # Architecture
//!
//! ```text
//!   ObjectEngine (authorize -> blob write -> CAS commit -> decref)
//!        |                                  |
//!        v                                  v
//!   BlobStore                         MetadataStore
//!   (payload bytes, dedup,            (buckets, key version chains,
//!    refcounts + holds, GC)            multipart sessions, policy)
//! ```
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use objection_core::{EngineConfig, ObjectEngine};
//! use objection_core::engine::PutOptions;
//! use objection_core::policy::Statement;
//!
//! # tokio_test::block_on(async {
//! let engine = ObjectEngine::new(EngineConfig::default());
//! engine.create_bucket("images").unwrap();
//! engine
//!     .set_bucket_policy("images", vec![Statement::allow("*", "*", "*")])
//!     .unwrap();
//!
//! let put = engine
//!     .put_object("alice", "images", "a.png", Bytes::from("pixels"), PutOptions::default())
//!     .await
//!     .unwrap();
//!
//! let got = engine.get_object("alice", "images", "a.png", None).await.unwrap();
//! assert_eq!(got.data.as_ref(), b"pixels");
//! assert_eq!(got.record.etag, put.etag);
//! # });
//! ```

pub mod blob;
pub mod checksums;
pub mod config;
pub mod engine;
pub mod error;
pub mod policy;
pub mod state;

pub use blob::BlobStore;
pub use config::EngineConfig;
pub use engine::ObjectEngine;
pub use error::{EngineError, EngineResult};
