//! End-to-end engine scenarios: dedup, GC, CAS, policy, multipart,
//! versioning, tagging, and expiry, exercised through the public API.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::StreamExt;
use objection_core::engine::{CompletedPart, PutOptions};
use objection_core::policy::Statement;
use objection_core::{EngineConfig, EngineError, ObjectEngine};
use parking_lot::RwLockUpgradableReadGuard;

/// Build an engine with a scratch data dir and snappy retry timings.
fn test_engine() -> (tempfile::TempDir, ObjectEngine) {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let config = EngineConfig::builder()
        .data_dir(dir.path().display().to_string())
        .spill_threshold(4096)
        .commit_backoff_ms(1)
        .build();
    (dir, ObjectEngine::new(config))
}

/// Create `bucket` with an allow-everything policy.
fn open_bucket(engine: &ObjectEngine, bucket: &str) {
    engine
        .create_bucket(bucket)
        .unwrap_or_else(|e| panic!("create_bucket failed: {e}"));
    engine
        .set_bucket_policy(bucket, vec![Statement::allow("*", "*", "*")])
        .unwrap_or_else(|e| panic!("set_bucket_policy failed: {e}"));
}

// ---------------------------------------------------------------------------
// Dedup and GC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_deduplicate_identical_payloads_across_keys() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");
    let payload = Bytes::from("identical pixels");

    let v1 = engine
        .put_object("alice", "images", "a.png", payload.clone(), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put a.png failed: {e}"));
    let v2 = engine
        .put_object("alice", "images", "b.png", payload.clone(), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put b.png failed: {e}"));

    // Same content hash, one physical copy, refcount two.
    assert_eq!(v1.content_hash, v2.content_hash);
    assert!(!v1.deduplicated);
    assert!(v2.deduplicated);
    assert_eq!(engine.blobs().len(), 1);
    let stats = engine
        .blobs()
        .stats(&v1.content_hash)
        .unwrap_or_else(|| panic!("blob missing"));
    assert_eq!(stats.refcount, 2);
    assert_eq!(stats.holds, 0);

    // Deleting one key drops the refcount; the other still reads.
    engine
        .delete_object("alice", "images", "a.png")
        .await
        .unwrap_or_else(|e| panic!("delete failed: {e}"));
    let stats = engine
        .blobs()
        .stats(&v1.content_hash)
        .unwrap_or_else(|| panic!("blob missing"));
    assert_eq!(stats.refcount, 1);

    let got = engine
        .get_object("alice", "images", "b.png", None)
        .await
        .unwrap_or_else(|e| panic!("get b.png failed: {e}"));
    assert_eq!(got.data, payload);
    assert_eq!(got.record.etag, v2.etag);
}

#[tokio::test]
async fn test_should_collect_blob_only_after_last_reference_gone() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");
    let payload = Bytes::from("shared bytes");

    let put = engine
        .put_object("alice", "images", "a.png", payload.clone(), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));
    engine
        .put_object("alice", "images", "b.png", payload.clone(), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));

    engine
        .delete_object("alice", "images", "a.png")
        .await
        .unwrap_or_else(|e| panic!("delete failed: {e}"));
    // One reference left: nothing to collect.
    assert_eq!(engine.sweep_blobs(), 0);
    assert!(engine.blobs().contains(&put.content_hash));

    engine
        .delete_object("alice", "images", "b.png")
        .await
        .unwrap_or_else(|e| panic!("delete failed: {e}"));
    assert_eq!(engine.sweep_blobs(), 1);
    assert!(!engine.blobs().contains(&put.content_hash));

    let result = engine.get_object("alice", "images", "b.png", None).await;
    assert!(matches!(result, Err(EngineError::NoSuchKey { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_should_survive_concurrent_puts_deletes_and_sweeps() {
    let (_dir, engine) = test_engine();
    let engine = Arc::new(engine);
    open_bucket(&engine, "churn");
    let payload = Bytes::from("contended content");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        let payload = payload.clone();
        tasks.push(tokio::spawn(async move {
            let key = format!("k-{i}");
            for _ in 0..20 {
                engine
                    .put_object("alice", "churn", &key, payload.clone(), PutOptions::default())
                    .await?;
                engine.delete_object("alice", "churn", &key).await?;
            }
            Ok::<(), EngineError>(())
        }));
    }
    let sweeper = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for _ in 0..200 {
                engine.sweep_blobs();
                tokio::task::yield_now().await;
            }
        })
    };

    for task in tasks {
        task.await
            .unwrap_or_else(|e| panic!("task panicked: {e}"))
            .unwrap_or_else(|e| panic!("churn failed: {e}"));
    }
    sweeper
        .await
        .unwrap_or_else(|e| panic!("sweeper panicked: {e}"));

    // Everything deleted: a final sweep leaves no blobs and no bytes.
    engine.sweep_blobs();
    assert!(engine.blobs().is_empty());
    assert_eq!(engine.blobs().used_bytes(), 0);
}

// ---------------------------------------------------------------------------
// CAS atomicity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_let_exactly_one_commit_win_per_round() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");
    engine
        .put_object("alice", "images", "k", Bytes::from("v0"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("seed put failed: {e}"));

    // N writers all naming the same expected pointer: exactly one swap
    // succeeds, the rest observe a conflict.
    let bucket = engine
        .meta()
        .bucket("images")
        .unwrap_or_else(|e| panic!("bucket lookup failed: {e}"));
    let expected = bucket
        .keys
        .read()
        .current_pointer("k")
        .map(str::to_owned);

    let mut wins = 0;
    let mut conflicts = 0;
    for i in 0..8 {
        let record = objection_core::state::ObjectRecord::new(
            "k",
            format!("contender-{i}"),
            format!("hash-{i}"),
            2,
            format!("\"hash-{i}\""),
        );
        match bucket.keys.write().commit_version(expected.as_deref(), record) {
            Ok(_) => wins += 1,
            Err(EngineError::Conflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_should_serialize_concurrent_same_key_puts_via_retry() {
    let (_dir, engine) = test_engine();
    let engine = Arc::new(engine);
    open_bucket(&engine, "images");

    let mut tasks = Vec::new();
    for i in 0..10 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            engine
                .put_object(
                    "alice",
                    "images",
                    "hot-key",
                    Bytes::from(format!("payload-{i}")),
                    PutOptions::default(),
                )
                .await
        }));
    }
    for task in tasks {
        task.await
            .unwrap_or_else(|e| panic!("task panicked: {e}"))
            .unwrap_or_else(|e| panic!("concurrent put failed: {e}"));
    }

    // Last CAS wins; the key reads as one of the written payloads and all
    // superseded blobs were released.
    let got = engine
        .get_object("alice", "images", "hot-key", None)
        .await
        .unwrap_or_else(|e| panic!("get failed: {e}"));
    assert!(got.data.starts_with(b"payload-"));
    engine.sweep_blobs();
    assert_eq!(engine.blobs().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_should_surface_write_conflict_when_retry_budget_exhausted() {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let config = EngineConfig::builder()
        .data_dir(dir.path().display().to_string())
        .max_commit_attempts(1)
        .commit_backoff_ms(1)
        .build();
    let engine = Arc::new(ObjectEngine::new(config));
    open_bucket(&engine, "images");
    engine
        .put_object("alice", "images", "k", Bytes::from("v0"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("seed put failed: {e}"));

    let bucket = engine
        .meta()
        .bucket("images")
        .unwrap_or_else(|e| panic!("bucket lookup failed: {e}"));

    // An upgradable lock lets the writer below read the current pointer
    // while its commit has to queue behind us.
    let guard = bucket.keys.upgradable_read();
    let stale = guard.current_pointer("k").map(str::to_owned);

    let writer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .put_object("alice", "images", "k", Bytes::from("v1"), PutOptions::default())
                .await
        })
    };
    // Let the writer read the pointer and block on its commit.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Move the pointer out from under it, then let it through. With a
    // budget of one attempt the stale commit must fail terminally.
    let mut keys = RwLockUpgradableReadGuard::upgrade(guard);
    keys.commit_version(
        stale.as_deref(),
        objection_core::state::ObjectRecord::new("k", "interloper", "hash-x", 1, "\"hash-x\""),
    )
    .unwrap_or_else(|e| panic!("interposed commit failed: {e}"));
    drop(keys);

    let result = writer
        .await
        .unwrap_or_else(|e| panic!("writer panicked: {e}"));
    assert!(
        matches!(result, Err(EngineError::WriteConflict { attempts: 1, .. })),
        "expected write conflict, got {result:?}"
    );
}

#[test]
fn test_should_keep_engine_write_futures_send() {
    fn assert_send<T: Send>(_: &T) {}
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");

    // Spawned tasks need Send futures, so the commit retry loop must not
    // carry a lock guard across its backoff sleep.
    let put = engine.put_object("alice", "images", "k", Bytes::from("x"), PutOptions::default());
    assert_send(&put);
    drop(put);
    let delete = engine.delete_object("alice", "images", "k");
    assert_send(&delete);
    drop(delete);
}

// ---------------------------------------------------------------------------
// Access control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_deny_by_default_without_matching_statement() {
    let (_dir, engine) = test_engine();
    engine
        .create_bucket("locked")
        .unwrap_or_else(|e| panic!("create_bucket failed: {e}"));

    let result = engine
        .put_object("alice", "locked", "k", Bytes::from("x"), PutOptions::default())
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden { .. })));
}

#[tokio::test]
async fn test_should_let_explicit_deny_override_allow() {
    let (_dir, engine) = test_engine();
    engine
        .create_bucket("images")
        .unwrap_or_else(|e| panic!("create_bucket failed: {e}"));
    engine
        .set_bucket_policy(
            "images",
            vec![
                Statement::allow("*", "*", "*"),
                Statement::deny("mallory", "GetObject", "images/*"),
            ],
        )
        .unwrap_or_else(|e| panic!("set_bucket_policy failed: {e}"));

    engine
        .put_object("alice", "images", "pic.png", Bytes::from("x"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));

    // Alice reads; mallory is denied despite the blanket allow.
    engine
        .get_object("alice", "images", "pic.png", None)
        .await
        .unwrap_or_else(|e| panic!("get as alice failed: {e}"));
    let result = engine.get_object("mallory", "images", "pic.png", None).await;
    assert!(matches!(result, Err(EngineError::Forbidden { .. })));

    // Mallory can still write: the deny is scoped to GetObject.
    engine
        .put_object("mallory", "images", "up.png", Bytes::from("y"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put as mallory failed: {e}"));
}

#[tokio::test]
async fn test_should_apply_object_acl_deny_on_top_of_bucket_policy() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");

    let opts = PutOptions {
        acl: vec![Statement::deny("mallory", "*", "*")],
        ..PutOptions::default()
    };
    engine
        .put_object("alice", "images", "private.png", Bytes::from("x"), opts)
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));

    let result = engine
        .get_object("mallory", "images", "private.png", None)
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden { .. })));
    engine
        .get_object("alice", "images", "private.png", None)
        .await
        .unwrap_or_else(|e| panic!("get as alice failed: {e}"));
}

// ---------------------------------------------------------------------------
// Multipart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_assemble_multipart_upload_in_part_order() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");

    let upload = engine
        .create_multipart_upload("alice", "images", "big.bin", PutOptions::default())
        .unwrap_or_else(|e| panic!("create upload failed: {e}"));
    // Upload out of order; assembly is by part number.
    let p2 = engine
        .upload_part("alice", "images", &upload.upload_id, 2, Bytes::from("BBBB"))
        .await
        .unwrap_or_else(|e| panic!("part 2 failed: {e}"));
    let p1 = engine
        .upload_part("alice", "images", &upload.upload_id, 1, Bytes::from("AAAA"))
        .await
        .unwrap_or_else(|e| panic!("part 1 failed: {e}"));

    let parts = vec![
        CompletedPart {
            part_number: 1,
            etag: p1.etag.clone(),
        },
        CompletedPart {
            part_number: 2,
            etag: p2.etag.clone(),
        },
    ];
    let done = engine
        .complete_multipart_upload("alice", "images", &upload.upload_id, &parts)
        .await
        .unwrap_or_else(|e| panic!("complete failed: {e}"));

    assert_eq!(done.size, 8);
    assert_eq!(done.parts_count, 2);
    assert!(done.etag.ends_with("-2\""), "composite etag: {}", done.etag);

    let got = engine
        .get_object("alice", "images", "big.bin", None)
        .await
        .unwrap_or_else(|e| panic!("get failed: {e}"));
    assert_eq!(got.data.as_ref(), b"AAAABBBB");
    assert_eq!(got.record.parts_count, Some(2));

    // Session is gone: a later abort reports not-found.
    let result = engine.abort_multipart_upload("alice", "images", &upload.upload_id);
    assert!(matches!(result, Err(EngineError::NoSuchUpload { .. })));

    // Part holds were released; sweeping collects the two part blobs but
    // never the assembled object.
    engine.sweep_blobs();
    assert!(engine.blobs().contains(&done.content_hash));
    assert!(!engine.blobs().contains(&p1.content_hash));
    assert!(!engine.blobs().contains(&p2.content_hash));
}

#[tokio::test]
async fn test_should_complete_idempotently_with_same_part_list() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");

    let upload = engine
        .create_multipart_upload("alice", "images", "big.bin", PutOptions::default())
        .unwrap_or_else(|e| panic!("create upload failed: {e}"));
    let p1 = engine
        .upload_part("alice", "images", &upload.upload_id, 1, Bytes::from("hello "))
        .await
        .unwrap_or_else(|e| panic!("part failed: {e}"));
    let p2 = engine
        .upload_part("alice", "images", &upload.upload_id, 2, Bytes::from("world"))
        .await
        .unwrap_or_else(|e| panic!("part failed: {e}"));
    let parts = vec![
        CompletedPart {
            part_number: 1,
            etag: p1.etag,
        },
        CompletedPart {
            part_number: 2,
            etag: p2.etag,
        },
    ];

    let first = engine
        .complete_multipart_upload("alice", "images", &upload.upload_id, &parts)
        .await
        .unwrap_or_else(|e| panic!("first complete failed: {e}"));
    let second = engine
        .complete_multipart_upload("alice", "images", &upload.upload_id, &parts)
        .await
        .unwrap_or_else(|e| panic!("retried complete failed: {e}"));

    assert_eq!(first.content_hash, second.content_hash);
    assert_eq!(first.etag, second.etag);
    assert_eq!(first.version_id, second.version_id);

    // The retry committed nothing new.
    let stats = engine
        .blobs()
        .stats(&first.content_hash)
        .unwrap_or_else(|| panic!("blob missing"));
    assert_eq!(stats.refcount, 1);
}

#[tokio::test]
async fn test_should_reject_mismatched_part_list_and_allow_corrected_retry() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");

    let upload = engine
        .create_multipart_upload("alice", "images", "big.bin", PutOptions::default())
        .unwrap_or_else(|e| panic!("create upload failed: {e}"));
    let p1 = engine
        .upload_part("alice", "images", &upload.upload_id, 1, Bytes::from("data"))
        .await
        .unwrap_or_else(|e| panic!("part failed: {e}"));

    let wrong = vec![CompletedPart {
        part_number: 1,
        etag: "\"not-the-etag\"".to_owned(),
    }];
    let result = engine
        .complete_multipart_upload("alice", "images", &upload.upload_id, &wrong)
        .await;
    assert!(matches!(result, Err(EngineError::PartMismatch { .. })));

    // The session went back to accepting parts; the listed parts give the
    // caller what it needs to retry correctly.
    let listed = engine
        .list_parts("alice", "images", &upload.upload_id)
        .unwrap_or_else(|e| panic!("list_parts failed: {e}"));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].etag, p1.etag);

    let corrected = vec![CompletedPart {
        part_number: 1,
        etag: p1.etag,
    }];
    engine
        .complete_multipart_upload("alice", "images", &upload.upload_id, &corrected)
        .await
        .unwrap_or_else(|e| panic!("corrected complete failed: {e}"));
}

#[tokio::test]
async fn test_should_release_holds_on_abort() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");

    let upload = engine
        .create_multipart_upload("alice", "images", "big.bin", PutOptions::default())
        .unwrap_or_else(|e| panic!("create upload failed: {e}"));
    let p1 = engine
        .upload_part("alice", "images", &upload.upload_id, 1, Bytes::from("part one"))
        .await
        .unwrap_or_else(|e| panic!("part failed: {e}"));

    // The hold keeps the part blob alive.
    assert_eq!(engine.sweep_blobs(), 0);

    engine
        .abort_multipart_upload("alice", "images", &upload.upload_id)
        .unwrap_or_else(|e| panic!("abort failed: {e}"));
    assert_eq!(engine.sweep_blobs(), 1);
    assert!(!engine.blobs().contains(&p1.content_hash));

    // A second abort reports not-found.
    let result = engine.abort_multipart_upload("alice", "images", &upload.upload_id);
    assert!(matches!(result, Err(EngineError::NoSuchUpload { .. })));
}

#[tokio::test]
async fn test_should_replace_reuploaded_part_and_release_old_hold() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");

    let upload = engine
        .create_multipart_upload("alice", "images", "big.bin", PutOptions::default())
        .unwrap_or_else(|e| panic!("create upload failed: {e}"));
    let old = engine
        .upload_part("alice", "images", &upload.upload_id, 1, Bytes::from("old bytes"))
        .await
        .unwrap_or_else(|e| panic!("part failed: {e}"));
    let new = engine
        .upload_part("alice", "images", &upload.upload_id, 1, Bytes::from("new bytes"))
        .await
        .unwrap_or_else(|e| panic!("part failed: {e}"));
    assert_ne!(old.content_hash, new.content_hash);

    // The replaced part's hold is gone; only the new blob survives a sweep.
    assert_eq!(engine.sweep_blobs(), 1);
    assert!(!engine.blobs().contains(&old.content_hash));
    assert!(engine.blobs().contains(&new.content_hash));
}

// ---------------------------------------------------------------------------
// Versioning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_retain_versions_and_write_delete_markers_when_versioned() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "docs");
    engine
        .enable_versioning("docs")
        .unwrap_or_else(|e| panic!("enable_versioning failed: {e}"));

    let v1 = engine
        .put_object("alice", "docs", "note.txt", Bytes::from("draft"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put v1 failed: {e}"));
    let v2 = engine
        .put_object("alice", "docs", "note.txt", Bytes::from("final"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put v2 failed: {e}"));

    // Both blobs stay referenced.
    assert_eq!(engine.sweep_blobs(), 0);

    let current = engine
        .get_object("alice", "docs", "note.txt", None)
        .await
        .unwrap_or_else(|e| panic!("get failed: {e}"));
    assert_eq!(current.data.as_ref(), b"final");
    assert_eq!(current.record.version_id, v2.version_id);

    let old = engine
        .get_object_version("alice", "docs", "note.txt", &v1.version_id, None)
        .await
        .unwrap_or_else(|e| panic!("get old version failed: {e}"));
    assert_eq!(old.data.as_ref(), b"draft");

    // Delete writes a marker; the key reads as gone but history remains.
    let deleted = engine
        .delete_object("alice", "docs", "note.txt")
        .await
        .unwrap_or_else(|e| panic!("delete failed: {e}"));
    assert!(deleted.existed);
    assert!(deleted.marker_version_id.is_some());

    let result = engine.get_object("alice", "docs", "note.txt", None).await;
    assert!(matches!(result, Err(EngineError::NoSuchKey { .. })));

    let versions = engine
        .list_versions("alice", "docs", "note.txt")
        .unwrap_or_else(|e| panic!("list_versions failed: {e}"));
    assert_eq!(versions.len(), 3);
    assert!(versions[0].is_delete_marker());

    // Removing the marker resurfaces the newest real version.
    let marker_id = versions[0].version_id().to_owned();
    engine
        .delete_object_version("alice", "docs", "note.txt", &marker_id)
        .await
        .unwrap_or_else(|e| panic!("remove marker failed: {e}"));
    let back = engine
        .get_object("alice", "docs", "note.txt", None)
        .await
        .unwrap_or_else(|e| panic!("get after marker removal failed: {e}"));
    assert_eq!(back.data.as_ref(), b"final");
}

#[tokio::test]
async fn test_should_promote_existing_objects_when_versioning_enabled_late() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "docs");

    let v1 = engine
        .put_object("alice", "docs", "note.txt", Bytes::from("before"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));
    engine
        .enable_versioning("docs")
        .unwrap_or_else(|e| panic!("enable_versioning failed: {e}"));
    engine
        .put_object("alice", "docs", "note.txt", Bytes::from("after"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));

    // The pre-versioning record became the first retained version.
    let old = engine
        .get_object_version("alice", "docs", "note.txt", &v1.version_id, None)
        .await
        .unwrap_or_else(|e| panic!("get old version failed: {e}"));
    assert_eq!(old.data.as_ref(), b"before");
}

// ---------------------------------------------------------------------------
// Range reads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_serve_range_reads() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");
    engine
        .put_object("alice", "images", "k", Bytes::from("hello world"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));

    let got = engine
        .get_object("alice", "images", "k", Some((6, 10)))
        .await
        .unwrap_or_else(|e| panic!("range get failed: {e}"));
    assert_eq!(got.data.as_ref(), b"world");

    let result = engine.get_object("alice", "images", "k", Some((20, 30))).await;
    assert!(matches!(result, Err(EngineError::InvalidArgument { .. })));
}

// ---------------------------------------------------------------------------
// Tagging and cache policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_update_tags_in_place_when_unversioned() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");
    let put = engine
        .put_object("alice", "images", "k", Bytes::from("x"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));

    let mut tags = BTreeMap::new();
    tags.insert("team".to_owned(), "infra".to_owned());
    let updated = engine
        .put_object_tagging("alice", "images", "k", tags.clone())
        .await
        .unwrap_or_else(|e| panic!("tagging failed: {e}"));

    // Unversioned: sidecar updated in place, same version, same blob.
    assert_eq!(updated.version_id, put.version_id);
    assert_eq!(
        engine
            .get_object_tagging("alice", "images", "k")
            .unwrap_or_else(|e| panic!("get tagging failed: {e}")),
        tags
    );
    let stats = engine
        .blobs()
        .stats(&put.content_hash)
        .unwrap_or_else(|| panic!("blob missing"));
    assert_eq!(stats.refcount, 1);
}

#[tokio::test]
async fn test_should_commit_new_version_for_tag_update_when_versioned() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "docs");
    engine
        .enable_versioning("docs")
        .unwrap_or_else(|e| panic!("enable_versioning failed: {e}"));
    let put = engine
        .put_object("alice", "docs", "k", Bytes::from("x"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));

    let mut tags = BTreeMap::new();
    tags.insert("state".to_owned(), "reviewed".to_owned());
    let updated = engine
        .put_object_tagging("alice", "docs", "k", tags)
        .await
        .unwrap_or_else(|e| panic!("tagging failed: {e}"));

    // A new version referencing the same blob: refcount grows to two.
    assert_ne!(updated.version_id, put.version_id);
    assert_eq!(updated.content_hash, put.content_hash);
    let stats = engine
        .blobs()
        .stats(&put.content_hash)
        .unwrap_or_else(|| panic!("blob missing"));
    assert_eq!(stats.refcount, 2);

    // The older version still has its original (empty) tags.
    let versions = engine
        .list_versions("alice", "docs", "k")
        .unwrap_or_else(|e| panic!("list_versions failed: {e}"));
    assert_eq!(versions.len(), 2);
}

#[tokio::test]
async fn test_should_fall_back_to_bucket_default_cache_policy() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");
    engine
        .set_default_cache_policy("images", Some("max-age=3600".to_owned()))
        .unwrap_or_else(|e| panic!("set default failed: {e}"));

    engine
        .put_object("alice", "images", "k", Bytes::from("x"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));
    let got = engine
        .get_object("alice", "images", "k", None)
        .await
        .unwrap_or_else(|e| panic!("get failed: {e}"));
    assert_eq!(got.cache_control.as_deref(), Some("max-age=3600"));

    // An object-level policy overrides the bucket default.
    engine
        .put_cache_control("alice", "images", "k", Some("no-store".to_owned()))
        .await
        .unwrap_or_else(|e| panic!("put_cache_control failed: {e}"));
    let got = engine
        .get_object("alice", "images", "k", None)
        .await
        .unwrap_or_else(|e| panic!("get failed: {e}"));
    assert_eq!(got.cache_control.as_deref(), Some("no-store"));
}

// ---------------------------------------------------------------------------
// Expiry and the reaper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_hide_expired_object_and_reclaim_it() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "cache");

    let opts = PutOptions {
        expires_at: Some(Utc::now() - Duration::seconds(1)),
        ..PutOptions::default()
    };
    let put = engine
        .put_object("alice", "cache", "stale", Bytes::from("old"), opts)
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));

    // Already past its expiry: reads miss immediately.
    let result = engine.get_object("alice", "cache", "stale", None).await;
    assert!(matches!(result, Err(EngineError::NoSuchKey { .. })));

    let stats = engine.sweep_all();
    assert_eq!(stats.expired_versions, 1);
    assert_eq!(stats.collected_blobs, 1);
    assert!(!engine.blobs().contains(&put.content_hash));
}

#[tokio::test]
async fn test_should_reap_abandoned_upload_sessions() {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let config = EngineConfig::builder()
        .data_dir(dir.path().display().to_string())
        .upload_session_ttl_secs(0)
        .build();
    let engine = ObjectEngine::new(config);
    open_bucket(&engine, "images");

    let upload = engine
        .create_multipart_upload("alice", "images", "big.bin", PutOptions::default())
        .unwrap_or_else(|e| panic!("create upload failed: {e}"));
    engine
        .upload_part("alice", "images", &upload.upload_id, 1, Bytes::from("part"))
        .await
        .unwrap_or_else(|e| panic!("part failed: {e}"));

    // TTL of zero: the session is immediately stale.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let stats = engine.sweep_all();
    assert_eq!(stats.reaped_uploads, 1);
    assert_eq!(stats.collected_blobs, 1);

    let result = engine.abort_multipart_upload("alice", "images", &upload.upload_id);
    assert!(matches!(result, Err(EngineError::NoSuchUpload { .. })));
}

// ---------------------------------------------------------------------------
// Buckets and listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_enforce_bucket_lifecycle_rules() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");

    assert!(matches!(
        engine.create_bucket("images"),
        Err(EngineError::BucketAlreadyExists { .. })
    ));

    engine
        .put_object("alice", "images", "k", Bytes::from("x"), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));
    assert!(matches!(
        engine.delete_bucket("images"),
        Err(EngineError::BucketNotEmpty { .. })
    ));

    engine
        .delete_object("alice", "images", "k")
        .await
        .unwrap_or_else(|e| panic!("delete failed: {e}"));
    engine
        .delete_bucket("images")
        .unwrap_or_else(|e| panic!("delete_bucket failed: {e}"));
    assert!(engine.list_buckets().is_empty());
}

#[tokio::test]
async fn test_should_list_objects_with_prefix_and_delimiter() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");
    for key in ["photos/2023/a.jpg", "photos/2024/b.jpg", "docs/readme.md"] {
        engine
            .put_object("alice", "images", key, Bytes::from(key), PutOptions::default())
            .await
            .unwrap_or_else(|e| panic!("put {key} failed: {e}"));
    }

    let listing = engine
        .list_objects("alice", "images", "photos/", "/", "", 100)
        .unwrap_or_else(|e| panic!("list failed: {e}"));
    assert!(listing.records.is_empty());
    assert_eq!(listing.common_prefixes.len(), 2);

    let listing = engine
        .list_objects("alice", "images", "", "", "", 2)
        .unwrap_or_else(|e| panic!("list failed: {e}"));
    assert_eq!(listing.records.len(), 2);
    assert!(listing.is_truncated);
}

// ---------------------------------------------------------------------------
// Streaming puts and capacity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_should_put_object_from_stream_with_spill() {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let config = EngineConfig::builder()
        .data_dir(dir.path().display().to_string())
        .spill_threshold(64)
        .build();
    let engine = ObjectEngine::new(config);
    open_bucket(&engine, "images");

    let chunk = vec![0x42_u8; 64];
    let chunks: Vec<std::io::Result<Bytes>> =
        (0..4).map(|_| Ok(Bytes::from(chunk.clone()))).collect();
    let put = engine
        .put_object_stream(
            "alice",
            "images",
            "big",
            futures::stream::iter(chunks),
            PutOptions::default(),
        )
        .await
        .unwrap_or_else(|e| panic!("streamed put failed: {e}"));
    assert_eq!(put.size, 256);

    let got = engine
        .get_object("alice", "images", "big", None)
        .await
        .unwrap_or_else(|e| panic!("get failed: {e}"));
    assert_eq!(got.data.len(), 256);
    assert!(got.data.iter().all(|&b| b == 0x42));
}

#[tokio::test]
async fn test_should_stream_object_payload_back_in_chunks() {
    let (_dir, engine) = test_engine();
    open_bucket(&engine, "images");

    // Above the 4096-byte spill threshold: the payload comes back from
    // the spill file chunk by chunk, re-verified as it streams.
    let payload = Bytes::from(vec![0x5a_u8; 8192]);
    let put = engine
        .put_object("alice", "images", "big", payload.clone(), PutOptions::default())
        .await
        .unwrap_or_else(|e| panic!("put failed: {e}"));

    let out = engine
        .get_object_stream("alice", "images", "big")
        .await
        .unwrap_or_else(|e| panic!("get stream failed: {e}"));
    assert_eq!(out.record.content_hash, put.content_hash);

    let mut data = out.data;
    let mut assembled = Vec::new();
    while let Some(chunk) = data.next().await {
        let chunk = chunk.unwrap_or_else(|e| panic!("stream chunk failed: {e}"));
        assembled.extend_from_slice(&chunk);
    }
    assert_eq!(assembled.as_slice(), payload.as_ref());

    // The stream path is policy-checked like any other read.
    engine
        .set_bucket_policy("images", vec![Statement::deny("*", "*", "*")])
        .unwrap_or_else(|e| panic!("set_bucket_policy failed: {e}"));
    let result = engine.get_object_stream("alice", "images", "big").await;
    assert!(matches!(result, Err(EngineError::Forbidden { .. })));
}

#[tokio::test]
async fn test_should_reject_put_over_capacity_without_partial_state() {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let config = EngineConfig::builder()
        .data_dir(dir.path().display().to_string())
        .capacity_bytes(Some(8))
        .build();
    let engine = ObjectEngine::new(config);
    open_bucket(&engine, "tiny");

    let result = engine
        .put_object("alice", "tiny", "k", Bytes::from("far too large"), PutOptions::default())
        .await;
    assert!(matches!(result, Err(EngineError::CapacityExceeded { .. })));
    assert!(engine.blobs().is_empty());
    assert!(matches!(
        engine.get_object("alice", "tiny", "k", None).await,
        Err(EngineError::NoSuchKey { .. })
    ));
}
