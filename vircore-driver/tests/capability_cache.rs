//! Capability cache monotonicity (§9 Open Question resolution).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vircore_driver::capability::{CapabilityCache, Capabilities};

#[tokio::test]
async fn concurrent_probes_of_the_same_binary_share_one_result() {
    let cache = Arc::new(CapabilityCache::new());
    let probe_count = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..8 {
        let cache = cache.clone();
        let probe_count = probe_count.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_probe("qemu-system-x86_64", || {
                    let probe_count = probe_count.clone();
                    async move {
                        probe_count.fetch_add(1, Ordering::SeqCst);
                        Capabilities { transactions: i % 2 == 0, migration_v3: true, ..Default::default() }
                    }
                })
                .await
        }));
    }

    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }

    assert_eq!(probe_count.load(Ordering::SeqCst), 1, "only one probe should run for a given binary path");
    let first = results[0];
    assert!(results.iter().all(|c| *c == first), "every caller must observe the same cached result");
}

#[tokio::test]
async fn distinct_binaries_probe_independently() {
    let cache = CapabilityCache::new();
    let a = cache.get_or_probe("binary-a", || async { Capabilities { transactions: true, ..Default::default() } }).await;
    let b = cache.get_or_probe("binary-b", || async { Capabilities { transactions: false, ..Default::default() } }).await;
    assert_ne!(a, b);
    assert_eq!(cache.len().await, 2);
}
