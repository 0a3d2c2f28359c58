//! Discovery tags: publish on start, clean withdrawal at shutdown.

use forgepool::discovery::{find_workers, worker_tag, MemoryTagStore, TagStore};

#[tokio::test]
async fn tag_naming() {
    assert_eq!(worker_tag("ci"), "dcc:ci:uri");
}

#[tokio::test]
async fn published_workers_are_found() {
    let tags = MemoryTagStore::new();
    tags.publish(&worker_tag("ci"), "http://a").await.unwrap();
    tags.publish(&worker_tag("ci"), "http://b").await.unwrap();
    tags.publish(&worker_tag("other"), "http://c").await.unwrap();

    let workers = find_workers(&tags, "ci").await.unwrap();
    assert_eq!(workers, vec!["http://a".to_string(), "http://b".to_string()]);
}

#[tokio::test]
async fn withdrawal_leaves_no_residue() {
    let tags = MemoryTagStore::new();
    let tag = worker_tag("ci");
    tags.publish(&tag, "http://a").await.unwrap();
    tags.publish(&tag, "http://b").await.unwrap();

    tags.withdraw(&tag, "http://a").await.unwrap();
    assert_eq!(
        find_workers(&tags, "ci").await.unwrap(),
        vec!["http://b".to_string()]
    );

    tags.withdraw(&tag, "http://b").await.unwrap();
    assert!(find_workers(&tags, "ci").await.unwrap().is_empty());
}
