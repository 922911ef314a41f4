mod support;

use futures::future::join_all;
use std::sync::Arc;
use support::{init_tracing, Device, PASSWORD};
use tabsync_cloud::*;
use tabsync_storage::SessionStore;

async fn pair() -> (Device, Device) {
    init_tracing();
    let blobs = Arc::new(MemoryBlobStore::new());
    let a = Device::new(blobs.clone());
    a.setup(PASSWORD).await;
    let b = Device::new(blobs);
    assert!(b.join(PASSWORD).await);
    (a, b)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pushes_lose_no_manifest_entries() {
    let (a, b) = pair().await;
    let ids: Vec<String> = (0..12).map(|i| format!("s{i:02}")).collect();
    for id in &ids {
        a.save(id, id, 100);
    }

    let pushes = ids.iter().cloned().map(|id| {
        let engine = a.engine.clone();
        tokio::spawn(async move { engine.push_session(&id).await })
    });
    for result in join_all(pushes).await {
        assert_eq!(result.unwrap().unwrap(), PushOutcome::Uploaded);
    }

    let report = b.engine.perform_full_sync().await.unwrap();
    assert_eq!(report.downloaded, ids.len());
    assert_eq!(b.local_ids(), ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pushes_and_deletes_interleaved_with_full_syncs() {
    let (a, b) = pair().await;
    for i in 0..6 {
        a.save(&format!("keep{i}"), "keep", 100);
        a.save(&format!("drop{i}"), "drop", 100);
    }
    a.engine.perform_full_sync().await.unwrap();
    for i in 0..6 {
        a.sessions.delete(&format!("drop{i}")).unwrap();
    }

    let mut tasks = Vec::new();
    for i in 0..6 {
        let engine = a.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .delete_session_from_cloud(&format!("drop{i}"))
                .await
                .map(|_| ())
        }));
        let engine = a.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.perform_full_sync().await.map(|_| ())
        }));
    }
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    b.engine.perform_full_sync().await.unwrap();
    let expected: Vec<String> = (0..6).map(|i| format!("keep{i}")).collect();
    assert_eq!(b.local_ids(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_full_syncs_all_succeed() {
    let (a, _b) = pair().await;
    a.save("s1", "one", 100);

    let syncs = (0..5).map(|_| {
        let engine = a.engine.clone();
        tokio::spawn(async move { engine.perform_full_sync().await })
    });
    let reports: Vec<SyncReport> = join_all(syncs)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    // Serialized: exactly one of them did the upload.
    assert_eq!(reports.iter().map(|r| r.uploaded).sum::<usize>(), 1);
    assert!(reports.iter().all(|r| r.success));
    assert!(!a.engine.sync_state().await.syncing);
}
