// SPDX-License-Identifier: Apache-2.0

use crate::cache::entry::{CacheLease, CacheValue};
use crate::cache::manager::{CacheConfig, CacheManager};
use cxg_core::CxgError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Value whose cleanup records how many leases were outstanding.
struct Handle {
    name: String,
    live_leases: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
    readers_at_cleanup: Arc<AtomicUsize>,
}

impl CacheValue for Handle {
    fn cleanup(&self) -> Result<(), CxgError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.readers_at_cleanup
            .fetch_max(self.live_leases.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Handles {
    cleanups: Arc<AtomicUsize>,
    readers_at_cleanup: Arc<AtomicUsize>,
}

impl Handles {
    fn handle(&self, name: &str) -> Handle {
        Handle {
            name: name.to_string(),
            live_leases: Arc::new(AtomicUsize::new(0)),
            cleanups: Arc::clone(&self.cleanups),
            readers_at_cleanup: Arc::clone(&self.readers_at_cleanup),
        }
    }
}

fn manager(max_entries: usize) -> CacheManager<Handle> {
    CacheManager::new(
        "test",
        CacheConfig {
            max_entries,
            ttl: None,
        },
    )
}

async fn get(mgr: &CacheManager<Handle>, handles: &Handles, key: &str) -> CacheLease<Handle> {
    let handle = handles.handle(key);
    mgr.get(key, || async { Ok(handle) }).await.expect("get")
}

#[tokio::test]
async fn lru_eviction_skips_entries_in_use() {
    let mgr = manager(2);
    let handles = Handles::default();
    drop(get(&mgr, &handles, "A").await);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let held = get(&mgr, &handles, "B").await;
    tokio::time::sleep(Duration::from_millis(2)).await;

    drop(get(&mgr, &handles, "C").await);
    assert_eq!(mgr.keys().await, vec!["B", "C"]);

    // B is now the least recently used entry but a reader still holds it
    drop(get(&mgr, &handles, "D").await);
    assert_eq!(mgr.keys().await, vec!["B", "D"]);
    assert_eq!(held.name, "B");
    assert_eq!(mgr.metrics.evictions.load(Ordering::Relaxed), 2);
    assert_eq!(handles.cleanups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn every_slot_in_use_is_reported_as_exhaustion() {
    let mgr = manager(1);
    let handles = Handles::default();
    let held = get(&mgr, &handles, "A").await;
    let handle = handles.handle("B");
    let err = mgr
        .get("B", || async { Ok(handle) })
        .await
        .err()
        .expect("exhausted");
    assert!(matches!(err, CxgError::CacheExhausted(_)));
    assert_eq!(mgr.metrics.thrash.load(Ordering::Relaxed), 1);
    drop(held);
    drop(get(&mgr, &handles, "B").await);
    assert_eq!(mgr.keys().await, vec!["B"]);
}

#[tokio::test]
async fn concurrent_gets_share_one_loader_invocation() {
    let mgr = Arc::new(manager(4));
    let handles = Handles::default();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut joins = Vec::new();
    for _ in 0..16 {
        let (mgr, handles) = (Arc::clone(&mgr), handles.clone());
        let (in_flight, peak, calls) = (Arc::clone(&in_flight), Arc::clone(&peak), Arc::clone(&calls));
        joins.push(tokio::spawn(async move {
            let lease = mgr
                .get("k", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(handles.handle("k"))
                })
                .await
                .expect("get");
            lease.name.clone()
        }));
    }
    for j in joins {
        assert_eq!(j.await.expect("join"), "k");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(peak.load(Ordering::SeqCst) <= 1);
    assert_eq!(mgr.metrics.hits.load(Ordering::Relaxed), 15);
}

#[tokio::test]
async fn terminal_errors_are_cached_until_evicted() {
    let mgr = manager(4);
    let handles = Handles::default();
    let calls = AtomicUsize::new(0);
    for _ in 0..3 {
        let err = mgr
            .get("gone", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Handle, _>(CxgError::not_found("no such store"))
            })
            .await
            .err()
            .expect("not found");
        assert_eq!(err.code(), "DatasetNotFoundError");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(mgr.evict("gone").await);
    drop(get(&mgr, &handles, "gone").await);
    assert_eq!(mgr.keys().await, vec!["gone"]);
}

#[tokio::test]
async fn transient_errors_are_not_cached() {
    let mgr = manager(4);
    let calls = AtomicUsize::new(0);
    for _ in 0..2 {
        assert!(mgr
            .get("flaky", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Handle, _>(CxgError::compute("metadata service flap"))
            })
            .await
            .is_err());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(mgr.is_empty().await);
}

#[tokio::test]
async fn idle_entries_expire_after_ttl() {
    let mgr = CacheManager::new(
        "ttl",
        CacheConfig {
            max_entries: 4,
            ttl: Some(Duration::from_millis(20)),
        },
    );
    let handles = Handles::default();
    drop(get(&mgr, &handles, "old").await);
    let pinned = get(&mgr, &handles, "busy").await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    drop(get(&mgr, &handles, "new").await);
    // the busy entry outlives its TTL while a lease holds it
    assert_eq!(mgr.keys().await, vec!["busy", "new"]);
    drop(pinned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cleanup_never_runs_while_a_reader_holds_the_value() {
    let mgr = Arc::new(manager(2));
    let handles = Handles::default();
    let mut joins = Vec::new();
    for worker in 0..8 {
        let (mgr, handles) = (Arc::clone(&mgr), handles.clone());
        joins.push(tokio::spawn(async move {
            for i in 0..50 {
                let key = format!("k{}", (worker + i) % 4);
                let handle = handles.handle(&key);
                let Ok(lease) = mgr.get(&key, || async { Ok(handle) }).await else {
                    continue;
                };
                lease.live_leases.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                lease.live_leases.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
            }
        }));
    }
    for j in joins {
        j.await.expect("join");
    }
    mgr.evict_all().await;
    assert!(handles.cleanups.load(Ordering::SeqCst) > 0);
    assert_eq!(handles.readers_at_cleanup.load(Ordering::SeqCst), 0);
}
