mod support;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use support::{init_tracing, Device, PASSWORD};
use tabsync_cloud::manifest::{session_blob_name, MANIFEST_BLOB_NAME};
use tabsync_cloud::*;
use tabsync_storage::{keys, KvSessionStore, KvStoreExt, SessionStore};

async fn two_devices() -> (Arc<MemoryBlobStore>, Device, Device) {
    init_tracing();
    let blobs = Arc::new(MemoryBlobStore::new());
    let a = Device::new(blobs.clone());
    a.setup(PASSWORD).await;
    let b = Device::new(blobs.clone());
    assert!(b.join(PASSWORD).await);
    (blobs, a, b)
}

// --- Full sync ---

#[tokio::test]
async fn first_sync_uploads_every_local_session() {
    let (blobs, a, _b) = two_devices().await;
    a.save("s1", "Work", 100);
    a.save("s2", "Home", 100);

    let report = a.engine.perform_full_sync().await.unwrap();
    assert!(report.success);
    assert_eq!(report.uploaded, 2);
    assert_eq!(report.downloaded, 0);

    let names = blobs.names();
    assert!(names.contains(&MANIFEST_BLOB_NAME.to_string()));
    assert!(names.contains(&session_blob_name("s1")));
    assert!(names.contains(&session_blob_name("s2")));
}

#[tokio::test]
async fn second_sync_without_changes_is_a_no_op() {
    let (_blobs, a, _b) = two_devices().await;
    a.save("s1", "Work", 100);
    a.engine.perform_full_sync().await.unwrap();

    let report = a.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.downloaded, 0);
    assert_eq!(report.deleted, 0);
    assert!(report.success);
}

#[tokio::test]
async fn remote_blobs_are_not_plaintext() {
    let (blobs, a, _b) = two_devices().await;
    a.save("s1", "Secret Project", 100);
    a.engine.perform_full_sync().await.unwrap();

    let bytes = blobs.bytes_by_name(&session_blob_name("s1")).unwrap();
    let text = String::from_utf8(bytes).unwrap();
    assert!(!text.contains("Secret Project"));
    assert!(!text.contains("example.com"));
    let envelope: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(envelope["v"], 1);
}

#[tokio::test]
async fn newer_remote_copy_is_downloaded_not_reuploaded() {
    let (_blobs, a, b) = two_devices().await;
    a.save("s1", "From A", 100);
    a.engine.perform_full_sync().await.unwrap();

    b.save("s1", "Stale on B", 90);
    let report = b.engine.perform_full_sync().await.unwrap();

    assert_eq!(report.uploaded, 0);
    assert_eq!(report.downloaded, 1);
    let local = b.local("s1").unwrap();
    assert_eq!(local.updated_at, 100);
    assert_eq!(local.name, "From A");
}

#[tokio::test]
async fn newer_local_copy_wins_and_reaches_other_device() {
    let (_blobs, a, b) = two_devices().await;
    a.save("s1", "Old", 100);
    a.engine.perform_full_sync().await.unwrap();

    b.save("s1", "Edited on B", 200);
    let report = b.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.downloaded, 0);

    let report = a.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(a.local("s1").unwrap().name, "Edited on B");
}

#[tokio::test]
async fn equal_timestamps_transfer_nothing() {
    let (_blobs, a, b) = two_devices().await;
    a.save("s1", "A", 100);
    a.engine.perform_full_sync().await.unwrap();

    b.save("s1", "B", 100);
    let report = b.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.downloaded, 0);
    assert_eq!(b.local("s1").unwrap().name, "B");
}

#[tokio::test]
async fn local_delete_propagates_as_tombstone() {
    let (blobs, a, b) = two_devices().await;
    a.save("s1", "Doomed", 100);
    a.save("s2", "Kept", 100);
    a.engine.perform_full_sync().await.unwrap();
    b.engine.perform_full_sync().await.unwrap();
    assert_eq!(b.local_ids(), vec!["s1", "s2"]);

    a.sessions.delete("s1").unwrap();
    let report = a.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(!blobs.names().contains(&session_blob_name("s1")));

    // B was offline when A deleted.
    let report = b.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(b.local_ids(), vec!["s2"]);
}

#[tokio::test]
async fn tombstone_beats_newer_local_edit() {
    let (_blobs, a, b) = two_devices().await;
    a.save("s1", "Shared", 100);
    a.engine.perform_full_sync().await.unwrap();
    b.engine.perform_full_sync().await.unwrap();

    a.sessions.delete("s1").unwrap();
    a.engine.perform_full_sync().await.unwrap();

    b.save("s1", "Edited offline", i64::MAX / 2);
    let report = b.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.uploaded, 0);
    assert!(b.local("s1").is_none());
}

#[tokio::test]
async fn locally_deleted_session_is_not_downloaded_again() {
    let (_blobs, a, _b) = two_devices().await;
    a.save("s1", "Gone", 100);
    a.engine.perform_full_sync().await.unwrap();

    a.sessions.delete("s1").unwrap();
    let report = a.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.downloaded, 0);
    assert!(a.local("s1").is_none());
}

#[tokio::test]
async fn unreadable_session_is_reported_without_aborting_the_rest() {
    let (blobs, a, b) = two_devices().await;
    a.save("s1", "Corrupt", 100);
    a.save("s2", "Fine", 100);
    a.engine.perform_full_sync().await.unwrap();

    blobs
        .upload("any", &session_blob_name("s1"), b"not an envelope".to_vec(), None)
        .await
        .unwrap();

    let report = b.engine.perform_full_sync().await.unwrap();
    assert!(!report.success);
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.first_error.unwrap().contains("s1"));
    assert_eq!(b.local_ids(), vec!["s2"]);
}

#[tokio::test]
async fn failed_upload_is_reported_and_retried_next_cycle() {
    let (blobs, a, b) = two_devices().await;
    a.save("s1", "Stuck", 100);
    a.save("s2", "Fine", 100);
    blobs.fail_op(BlobOp::Upload, &session_blob_name("s1"), BlobStoreError::PayloadTooLarge);

    let report = a.engine.perform_full_sync().await.unwrap();
    assert!(!report.success);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.first_error.unwrap().contains("upload s1"));

    b.engine.perform_full_sync().await.unwrap();
    assert_eq!(b.local_ids(), vec!["s2"]);

    blobs.clear_failure();
    let report = a.engine.perform_full_sync().await.unwrap();
    assert!(report.success);
    assert_eq!(report.uploaded, 1);
    assert_eq!(a.local_ids(), vec!["s1", "s2"]);

    b.engine.perform_full_sync().await.unwrap();
    assert_eq!(b.local_ids(), vec!["s1", "s2"]);
}

#[tokio::test]
async fn failed_remote_delete_is_retried_not_resurrected() {
    let (blobs, a, b) = two_devices().await;
    a.save("s1", "Doomed", 100);
    a.save("s2", "Also doomed", 100);
    a.engine.perform_full_sync().await.unwrap();
    b.engine.perform_full_sync().await.unwrap();

    a.sessions.delete("s1").unwrap();
    a.sessions.delete("s2").unwrap();
    blobs.fail_op(
        BlobOp::Delete,
        &session_blob_name("s1"),
        BlobStoreError::ForbiddenOrRateLimited("HTTP 429".into()),
    );

    let report = a.engine.perform_full_sync().await.unwrap();
    assert!(!report.success);
    assert_eq!(report.deleted, 1);
    assert!(report.first_error.unwrap().contains("delete remote s1"));
    assert!(blobs.names().contains(&session_blob_name("s1")));
    assert!(!blobs.names().contains(&session_blob_name("s2")));

    blobs.clear_failure();
    let report = a.engine.perform_full_sync().await.unwrap();
    assert!(report.success);
    assert_eq!(report.downloaded, 0);
    assert_eq!(report.deleted, 1);
    assert!(a.local_ids().is_empty());
    assert!(!blobs.names().contains(&session_blob_name("s1")));

    b.engine.perform_full_sync().await.unwrap();
    assert!(b.local_ids().is_empty());
}

#[tokio::test]
async fn rejected_access_token_is_refreshed_and_cycle_retried() {
    init_tracing();
    let blobs = Arc::new(MemoryBlobStore::new());
    let a = Device::new(blobs.clone());
    a.setup(PASSWORD).await;
    a.save("s1", "Work", 100);
    // Revoked server-side before its expiry.
    blobs.reject_token("at-1");

    let report = a.engine.perform_full_sync().await.unwrap();
    assert!(report.success);
    assert_eq!(report.uploaded, 1);
    assert_eq!(a.oauth.refresh_count(), 1);
}

#[tokio::test]
async fn unreachable_store_aborts_cycle_and_resets_state() {
    let (blobs, a, _b) = two_devices().await;
    blobs.fail_with(BlobStoreError::Other("connection reset".into()));

    let err = a.engine.perform_full_sync().await.unwrap_err();
    assert!(err.is_transient());

    let state = a.engine.sync_state().await;
    assert!(!state.syncing);
    assert_eq!(state.current_operation, None);
    assert!(state.last_error.unwrap().contains("connection reset"));
}

#[tokio::test]
async fn unauthorized_store_surfaces_auth_error() {
    let (blobs, a, _b) = two_devices().await;
    blobs.fail_with(BlobStoreError::Unauthorized);
    let err = a.engine.perform_full_sync().await.unwrap_err();
    assert!(err.is_auth());
}

#[tokio::test]
async fn full_sync_refused_before_connect() {
    init_tracing();
    let device = Device::new(Arc::new(MemoryBlobStore::new()));
    assert!(matches!(
        device.engine.perform_full_sync().await,
        Err(CloudError::NotConnected)
    ));
    assert!(matches!(
        device.engine.push_session("s1").await,
        Err(CloudError::NotConnected)
    ));
}

#[tokio::test]
async fn full_sync_refused_while_locked() {
    let (_blobs, a, _b) = two_devices().await;
    a.engine.lock().await;
    assert!(matches!(
        a.engine.perform_full_sync().await,
        Err(CloudError::Locked)
    ));
}

// --- Single-item operations ---

#[tokio::test]
async fn push_session_uploads_then_reports_unchanged() {
    let (blobs, a, b) = two_devices().await;
    a.save("s1", "Fresh", 100);

    assert_eq!(a.engine.push_session("s1").await.unwrap(), PushOutcome::Uploaded);
    assert!(blobs.names().contains(&session_blob_name("s1")));
    assert_eq!(a.engine.push_session("s1").await.unwrap(), PushOutcome::Unchanged);

    let report = b.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.downloaded, 1);
}

#[tokio::test]
async fn push_of_tombstoned_session_removes_it_locally() {
    let (_blobs, a, b) = two_devices().await;
    a.save("s1", "Shared", 100);
    a.engine.perform_full_sync().await.unwrap();
    b.engine.perform_full_sync().await.unwrap();

    assert_eq!(
        a.engine.delete_session_from_cloud("s1").await.unwrap(),
        PushOutcome::Deleted
    );

    b.save("s1", "Edited", 500);
    assert_eq!(b.engine.push_session("s1").await.unwrap(), PushOutcome::Tombstoned);
    assert!(b.local("s1").is_none());
}

#[tokio::test]
async fn delete_from_cloud_reaches_other_device() {
    let (blobs, a, b) = two_devices().await;
    a.save("s1", "Shared", 100);
    a.engine.perform_full_sync().await.unwrap();
    b.engine.perform_full_sync().await.unwrap();

    a.sessions.delete("s1").unwrap();
    a.engine.delete_session_from_cloud("s1").await.unwrap();
    assert!(!blobs.names().contains(&session_blob_name("s1")));

    b.engine.perform_full_sync().await.unwrap();
    assert!(b.local("s1").is_none());
}

#[tokio::test]
async fn push_while_locked_is_queued_and_drained_after_unlock() {
    let (blobs, a, _b) = two_devices().await;
    a.save("s1", "Offline edit", 100);
    a.engine.lock().await;

    assert_eq!(a.engine.push_session("s1").await.unwrap(), PushOutcome::Queued);
    assert_eq!(a.engine.queue().pending_count().await.unwrap(), 1);
    assert_eq!(a.engine.sync_state().await.pending_count, 1);
    assert!(!blobs.names().contains(&session_blob_name("s1")));

    assert!(a.engine.unlock(PASSWORD).await.unwrap());
    let report = a.engine.process_queue().await.unwrap();
    assert_eq!(report.retried, 1);
    assert!(blobs.names().contains(&session_blob_name("s1")));
    assert_eq!(a.engine.sync_state().await.pending_count, 0);
}

#[tokio::test]
async fn failed_push_is_queued_not_lost() {
    let (blobs, a, _b) = two_devices().await;
    a.save("s1", "Unlucky", 100);
    blobs.fail_with(BlobStoreError::ForbiddenOrRateLimited("rate limited".into()));

    assert_eq!(a.engine.push_session("s1").await.unwrap(), PushOutcome::Queued);
    let items = a.engine.queue().items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].operation, QueueOperation::Upload);
    assert!(a.engine.sync_state().await.last_error.is_some());

    blobs.clear_failure();
    let report = a.engine.process_queue().await.unwrap();
    assert_eq!(report.retried, 1);
    assert!(blobs.names().contains(&session_blob_name("s1")));
}

#[tokio::test]
async fn later_delete_replaces_queued_upload() {
    let (_blobs, a, _b) = two_devices().await;
    a.save("s1", "Short lived", 100);
    a.engine.lock().await;

    a.engine.push_session("s1").await.unwrap();
    a.engine.delete_session_from_cloud("s1").await.unwrap();

    let items = a.engine.queue().items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].operation, QueueOperation::Delete);
}

#[tokio::test]
async fn full_sync_drains_ready_queue_items() {
    let (blobs, a, _b) = two_devices().await;
    a.save("s1", "Queued", 100);
    a.engine.lock().await;
    a.engine.push_session("s1").await.unwrap();
    a.engine.unlock(PASSWORD).await.unwrap();

    let report = a.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(a.engine.queue().pending_count().await.unwrap(), 0);
    assert!(blobs.names().contains(&session_blob_name("s1")));
}

#[tokio::test]
async fn exhausted_queue_item_emits_drop_event() {
    init_tracing();
    let blobs = Arc::new(MemoryBlobStore::new());
    let mut config = SyncConfig::default();
    config.retry.max_retries = 1;
    let a = Device::with_config(blobs.clone(), config);
    a.setup(PASSWORD).await;
    a.save("s1", "Doomed", 100);

    let mut events = a.engine.subscribe();
    blobs.fail_with(BlobStoreError::StorageFull);
    assert_eq!(a.engine.push_session("s1").await.unwrap(), PushOutcome::Queued);

    let report = a.engine.process_queue().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(a.engine.queue().pending_count().await.unwrap(), 0);

    let mut dropped = None;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::QueueItemDropped { session_id, operation, last_error } = event {
            dropped = Some((session_id, operation, last_error));
        }
    }
    let (session_id, operation, last_error) = dropped.expect("drop event");
    assert_eq!(session_id, "s1");
    assert_eq!(operation, QueueOperation::Upload);
    assert!(last_error.unwrap().contains("storage full"));
}

// --- State and events ---

#[tokio::test]
async fn sync_broadcasts_phases_and_completion() {
    let (_blobs, a, _b) = two_devices().await;
    a.save("s1", "Watched", 100);
    let mut events = a.engine.subscribe();

    a.engine.perform_full_sync().await.unwrap();

    let mut phases = Vec::new();
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::StateChanged(state) => {
                if let Some(phase) = state.current_operation {
                    if phases.last() != Some(&phase) {
                        phases.push(phase);
                    }
                }
            }
            SyncEvent::SyncCompleted(report) => completed = Some(report),
            SyncEvent::QueueItemDropped { .. } => {}
        }
    }
    assert_eq!(
        phases,
        vec![
            SyncPhase::Fetching,
            SyncPhase::Uploading,
            SyncPhase::Downloading,
            SyncPhase::ReconcilingDeletes,
            SyncPhase::Finalizing,
        ]
    );
    assert_eq!(completed.unwrap().uploaded, 1);
    assert!(!a.engine.sync_state().await.syncing);
}

#[tokio::test]
async fn sync_state_survives_restart() {
    let (blobs, a, _b) = two_devices().await;
    a.engine.perform_full_sync().await.unwrap();
    let before = a.engine.sync_state().await;
    assert!(before.last_sync_at.is_some());

    let persisted: SyncState = a.kv.get_json(keys::SYNC_STATE).unwrap().unwrap();
    assert_eq!(persisted.last_sync_at, before.last_sync_at);

    let restarted = ManifestSyncEngine::new(
        SyncConfig::default(),
        a.kv.clone(),
        Arc::new(KvSessionStore::new(a.kv.clone())),
        blobs,
        a.oauth.clone(),
    )
    .unwrap();
    assert_eq!(restarted.sync_state().await.last_sync_at, before.last_sync_at);
    assert_eq!(restarted.device_id(), a.engine.device_id());
    assert!(!restarted.is_unlocked().await);
}

#[tokio::test]
async fn devices_get_distinct_ids() {
    let (_blobs, a, b) = two_devices().await;
    assert_ne!(a.engine.device_id(), b.engine.device_id());
}
