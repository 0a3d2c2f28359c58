//! Leader election: single-dictator guarantee, lease expiry, demotion,
//! and the tyrant bootstrap override.

use std::sync::Arc;
use std::time::Duration;

use forgepool::coordination::{group_key, LockService, MemoryLockService};
use forgepool::election::{Election, Role, Transition};

const TTL: Duration = Duration::from_secs(60);

fn election(lock: &Arc<MemoryLockService>, uri: &str, tyrant: bool) -> Election {
    Election::new(lock.clone(), "ci", uri, TTL, tyrant)
}

#[tokio::test]
async fn at_most_one_leader_per_tick() {
    let lock = Arc::new(MemoryLockService::new());
    let peers: Vec<Election> = (1..=3)
        .map(|i| election(&lock, &format!("http://peer{i}"), false))
        .collect();

    for _ in 0..3 {
        let mut leaders = 0;
        for peer in &peers {
            if peer.tick().await.is_leader() {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
    }
}

#[tokio::test]
async fn followers_cache_the_leader_uri() {
    let lock = Arc::new(MemoryLockService::new());
    let a = election(&lock, "http://a", false);
    let b = election(&lock, "http://b", false);

    assert_eq!(a.tick().await, Transition::BecameLeader);
    assert_eq!(b.tick().await, Transition::StayedFollower);

    assert_eq!(b.role().await, Role::Follower);
    assert_eq!(
        b.leader_handle().read().await.clone(),
        Some("http://a".to_string())
    );
}

#[tokio::test]
async fn leader_keeps_the_lock_across_ticks() {
    let lock = Arc::new(MemoryLockService::new());
    let a = election(&lock, "http://a", false);

    assert_eq!(a.tick().await, Transition::BecameLeader);
    assert_eq!(a.tick().await, Transition::StayedLeader);
    assert_eq!(
        lock.read(&group_key("ci")).await.unwrap(),
        Some("http://a".to_string())
    );
}

#[tokio::test]
async fn demoted_when_another_peer_holds_the_lock() {
    let lock = Arc::new(MemoryLockService::new());
    let a = election(&lock, "http://a", false);
    let b = election(&lock, "http://b", false);

    assert_eq!(a.tick().await, Transition::BecameLeader);

    // The lease vanishes (expired and taken over by b).
    lock.evict(&group_key("ci"));
    assert_eq!(b.tick().await, Transition::BecameLeader);

    assert_eq!(a.tick().await, Transition::LostLeadership);
    assert_eq!(
        a.leader_handle().read().await.clone(),
        Some("http://b".to_string())
    );
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let lock = Arc::new(MemoryLockService::new());
    assert!(lock
        .acquire("k", "holder-1", Duration::from_millis(10))
        .await
        .unwrap());
    assert!(!lock.acquire("k", "holder-2", TTL).await.unwrap());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(lock.acquire("k", "holder-2", TTL).await.unwrap());
    assert_eq!(lock.read("k").await.unwrap(), Some("holder-2".to_string()));
}

#[tokio::test]
async fn renew_requires_ownership() {
    let lock = Arc::new(MemoryLockService::new());
    assert!(lock.acquire("k", "holder-1", TTL).await.unwrap());

    assert!(lock.renew("k", "holder-1", TTL).await.unwrap());
    assert!(!lock.renew("k", "intruder", TTL).await.unwrap());
}

#[tokio::test]
async fn tyrant_overrides_the_current_holder() {
    let lock = Arc::new(MemoryLockService::new());
    let normal = election(&lock, "http://a", false);
    let tyrant = election(&lock, "http://t", true);

    assert_eq!(normal.tick().await, Transition::BecameLeader);

    // The tyrant seizes the key even though the lease is live.
    assert_eq!(tyrant.tick().await, Transition::BecameLeader);
    assert_eq!(
        lock.read(&group_key("ci")).await.unwrap(),
        Some("http://t".to_string())
    );

    assert_eq!(normal.tick().await, Transition::LostLeadership);
}
