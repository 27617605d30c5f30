// SPDX-License-Identifier: Apache-2.0

mod support;

use cxg_core::{CxgError, Tombstone};
use cxg_server::{CacheConfig, HttpMetadataClient, Locator, MetadataClient};
use cxg_store::StoreContext;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::*;
use tempfile::tempdir;

fn metadata_reply(line: &str, relocated: &str) -> (u16, String) {
    if line.contains("gone.cxg") {
        return (
            200,
            json!({"collection_id": "X", "dataset_id": "Y", "tombstoned": true}).to_string(),
        );
    }
    if line.contains("moved.cxg") {
        return (
            200,
            json!({
                "collection_id": "C1",
                "collection_visibility": "PUBLIC",
                "dataset_id": "D1",
                "s3_uri": relocated,
                "tombstoned": false
            })
            .to_string(),
        );
    }
    if line.contains("flaky.cxg") {
        return (500, "{}".to_string());
    }
    (404, "{}".to_string())
}

async fn locator_with_stub(root: &str, relocated: String) -> (Locator, Arc<AtomicUsize>) {
    let (base, hits) =
        stub_metadata_service(move |line| metadata_reply(line, &relocated)).await;
    (locator_for(root, &base), hits)
}

fn locator_for(root: &str, base: &str) -> Locator {
    let client: Arc<dyn MetadataClient> =
        Arc::new(HttpMetadataClient::new(base, Duration::from_secs(2)).expect("client"));
    let mut roots = std::collections::BTreeMap::new();
    roots.insert(
        "d".to_string(),
        cxg_server::DatarootConfig {
            root: root.to_string(),
            user_scoped: false,
        },
    );
    Locator::new(
        roots,
        Some(WEB_BASE.to_string()),
        Some(client),
        StoreContext::default(),
        CacheConfig {
            max_entries: 16,
            ttl: None,
        },
    )
}

#[tokio::test]
async fn metadata_record_wins_over_the_dataroot() {
    let dir = tempdir().expect("tempdir");
    let relocated = write_dataset(dir.path().join("elsewhere").join("moved.cxg"), false);
    let root = dir.path().join("d").display().to_string();
    let (locator, hits) = locator_with_stub(&root, relocated.display().to_string()).await;

    let lease = locator.resolve("d", "moved.cxg", None).await.expect("resolve");
    assert_eq!(lease.store_uri, relocated.display().to_string());
    assert_eq!(lease.collection_id.as_deref(), Some("C1"));
    assert_eq!(lease.dataset_id.as_deref(), Some("D1"));
    drop(lease);

    let seen = hits.load(Ordering::SeqCst);
    let again = locator.resolve("d", "moved.cxg", None).await.expect("cached");
    assert_eq!(again.dataset_id.as_deref(), Some("D1"));
    assert_eq!(hits.load(Ordering::SeqCst), seen, "second resolve is served from cache");
}

#[tokio::test]
async fn service_errors_and_misses_fall_back_to_the_dataroot() {
    let dir = tempdir().expect("tempdir");
    write_dataset(dir.path().join("d").join("flaky.cxg"), false);
    write_dataset(dir.path().join("d").join("plain.cxg"), false);
    let root = dir.path().join("d").display().to_string();
    let (locator, _) = locator_with_stub(&root, String::new()).await;

    let flaky = locator.resolve("d", "flaky.cxg", None).await.expect("500 falls back");
    assert_eq!(flaky.store_uri, format!("{root}/flaky.cxg"));
    assert_eq!(flaky.collection_id, None);
    let plain = locator.resolve("d", "plain.cxg", None).await.expect("404 falls back");
    assert_eq!(plain.store_uri, format!("{root}/plain.cxg"));

    let err = locator
        .resolve("d", "absent.cxg", None)
        .await
        .err()
        .expect("absent dataset");
    assert!(matches!(err, CxgError::DatasetNotFound(_)), "{err:?}");
    assert_eq!(locator.cache().len().await, 3, "the miss is cached too");
}

#[tokio::test]
async fn failed_lookup_with_a_dataroot_miss_is_retried() {
    let dir = tempdir().expect("tempdir");
    let relocated = write_dataset(dir.path().join("elsewhere").join("late.cxg"), false)
        .display()
        .to_string();
    let root = dir.path().join("d").display().to_string();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let record = relocated.clone();
    let (base, _) = stub_metadata_service(move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            return (503, "{}".to_string());
        }
        (
            200,
            json!({"dataset_id": "L1", "s3_uri": record, "tombstoned": false}).to_string(),
        )
    })
    .await;
    let locator = locator_for(&root, &base);

    let err = locator
        .resolve("d", "late.cxg", None)
        .await
        .err()
        .expect("service unavailable and not in the dataroot");
    assert!(matches!(err, CxgError::DatasetMetadata(_)), "{err:?}");
    assert!(!err.is_terminal());
    assert_eq!(locator.cache().len().await, 0, "nothing cached after a failed lookup");

    let lease = locator.resolve("d", "late.cxg", None).await.expect("service back");
    assert_eq!(lease.store_uri, relocated);
    assert_eq!(lease.dataset_id.as_deref(), Some("L1"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tombstones_are_terminal() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().join("d").display().to_string();
    let (locator, hits) = locator_with_stub(&root, String::new()).await;

    for _ in 0..2 {
        let err = locator
            .resolve("d", "gone.cxg", None)
            .await
            .err()
            .expect("tombstoned");
        assert_eq!(
            err,
            CxgError::Tombstone(Tombstone {
                collection_id: Some("X".to_string()),
                dataset_id: Some("Y".to_string()),
            })
        );
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tombstoned_dataset_redirects_to_its_collection() {
    let dir = tempdir().expect("tempdir");
    let mut config = fixture_config(dir.path());
    let (base, _) = stub_metadata_service(|line| metadata_reply(line, "")).await;
    config.metadata_service.api_base = Some(base);
    config.metadata_service.web_base = Some(WEB_BASE.to_string());
    let (addr, _) = start(config).await;

    for op in ["schema", "annotations/obs", "config"] {
        let (status, head, _) = get(addr, &format!("/d/gone.cxg/api/v0.2/{op}"), &[]).await;
        assert_eq!(status, 302, "{op}");
        assert_eq!(
            header(&head, "location"),
            Some("http://cells.example/collections/X?tombstoned_dataset_id=Y")
        );
    }

    let (status, _, _) = get(addr, "/d/pbmc.cxg/api/v0.2/schema", &[]).await;
    assert_eq!(status, 200, "unknown to the service, served from the dataroot");
}
