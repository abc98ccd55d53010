use kvmesh_core::{BucketConfig, ConfigVersion, NodeAdapter, ServiceType};

use super::{BUCKET, CONFIG_ERROR, Harness, SERVICE_PER_NODE, parse};

const HOSTS: [&str; 4] = [
    "10.143.194.101",
    "10.143.194.102",
    "10.143.194.103",
    "10.143.194.104",
];

#[tokio::test]
async fn rebalanced_node_is_removed() {
    let harness = Harness::new();
    for host in HOSTS {
        harness.add_kv_node(host).await;
    }

    let removed = harness.context.prune_nodes(&parse(CONFIG_ERROR));

    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].endpoint().host(), "10.143.194.102");
    assert!(removed[0].is_retired());
    assert_eq!(
        harness.hosts(),
        vec!["10.143.194.101", "10.143.194.103", "10.143.194.104"]
    );
}

#[tokio::test]
async fn single_service_nodes_are_kept() {
    let harness = Harness::new();
    for host in HOSTS {
        harness.add_kv_node(host).await;
    }

    let removed = harness.context.prune_nodes(&parse(SERVICE_PER_NODE));

    assert!(removed.is_empty());
    assert_eq!(harness.hosts(), HOSTS.to_vec());
}

#[tokio::test]
async fn pruning_twice_with_the_same_snapshot_is_idempotent() {
    let harness = Harness::new();
    for host in HOSTS {
        harness.add_kv_node(host).await;
    }
    let config = parse(CONFIG_ERROR);

    assert_eq!(harness.context.prune_nodes(&config).len(), 1);
    let before = harness.hosts();
    assert!(harness.context.prune_nodes(&config).is_empty());
    assert_eq!(harness.hosts(), before);
}

#[tokio::test]
async fn last_node_is_kept_when_snapshot_is_empty() {
    let harness = Harness::new();
    harness.add_kv_node("10.143.194.101").await;

    let empty = BucketConfig::new(Some(BUCKET), ConfigVersion::from_rev(2), Vec::new());
    assert!(harness.context.prune_nodes(&empty).is_empty());
    assert_eq!(harness.hosts(), vec!["10.143.194.101"]);
}

#[tokio::test]
async fn redundant_provider_is_removed_even_if_service_vanishes() {
    let harness = Harness::new();
    harness.add_kv_node("10.143.194.101").await;
    harness.add_kv_node("10.143.194.102").await;

    // .102 离开，快照只剩 .101，KV 仍由保留下来的 .101 提供。
    let snapshot = BucketConfig::new(
        Some(BUCKET),
        ConfigVersion::from_rev(3),
        vec![NodeAdapter::new("10.143.194.101").with_service(ServiceType::KeyValue, 11210)],
    );
    let removed = harness.context.prune_nodes(&snapshot);
    assert_eq!(removed.len(), 1);
    assert_eq!(harness.hosts(), vec!["10.143.194.101"]);
}
