use std::sync::Arc;

use kvmesh_core::{ConfigHandler, Connection, HostEndpoint, PublishOutcome, ServiceType};

use super::{BUCKET, CONFIG_ERROR, Harness, SERVICE_PER_NODE, parse};

#[tokio::test]
async fn seed_shaped_nodes_are_replaced_with_full_service_maps() {
    let harness = Harness::new();
    let mut seeds = Vec::new();
    for host in ["10.143.194.101", "10.143.194.102", "10.143.194.103", "10.143.194.104"] {
        seeds.push(harness.add_kv_node(host).await);
    }

    let report = harness.context.apply(&parse(CONFIG_ERROR)).await;

    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.replaced.len(), 3);
    assert!(report.added.is_empty());
    assert!(seeds.iter().all(|seed| seed.is_retired()));
    let views = harness
        .context
        .get_random_node_for_service(ServiceType::Views, Some(BUCKET))
        .expect("views served after replacement");
    assert_eq!(views.uri(ServiceType::Views).as_deref().map(|uri| uri.ends_with(":8092/")), Some(true));
    assert_eq!(
        harness.hosts(),
        vec!["10.143.194.101", "10.143.194.103", "10.143.194.104"]
    );
}

#[tokio::test]
async fn reapplying_a_snapshot_causes_no_churn() {
    let harness = Harness::new();
    let config = parse(SERVICE_PER_NODE);

    let first = harness.context.apply(&config).await;
    assert_eq!(first.added.len(), 4);
    let attempts = harness.connector.attempts();
    let snapshot = harness.context.nodes();

    let second = harness.context.apply(&config).await;
    assert!(second.is_noop(), "{second:?}");
    assert_eq!(harness.connector.attempts(), attempts);
    for node in snapshot.iter() {
        let current = harness.context.nodes();
        let same = current.get(node.key()).expect("still registered");
        assert!(Arc::ptr_eq(same, node));
    }
}

#[tokio::test]
async fn http_only_nodes_open_no_connections() {
    let harness = Harness::new();
    harness.context.apply(&parse(SERVICE_PER_NODE)).await;

    // 只有 .101 提供 KV，连接池最小为 1。
    assert_eq!(harness.connector.opened().len(), 1);
    assert_eq!(
        harness.connector.opened()[0].endpoint(),
        &HostEndpoint::new("10.143.194.101", 11210)
    );
    for service in [ServiceType::Query, ServiceType::Search, ServiceType::Analytics] {
        assert!(harness
            .context
            .get_random_node_for_service(service, Some(BUCKET))
            .is_ok());
    }
}

#[tokio::test]
async fn handler_never_regresses_revisions() {
    let harness = Harness::new();
    let context = Arc::new(harness.context);
    let handler = ConfigHandler::new(Arc::clone(&context));

    let applied = handler.publish(parse(SERVICE_PER_NODE)).await;
    assert!(matches!(applied, PublishOutcome::Applied(_)));

    // rev 1073 < 36310：旧快照不得把拓扑回退。
    let stale = handler.publish(parse(CONFIG_ERROR)).await;
    assert!(matches!(stale, PublishOutcome::Ignored { .. }));
    assert!(context
        .get_random_node_for_service(ServiceType::Search, Some(BUCKET))
        .is_ok());
    assert_eq!(
        handler.applied_version(Some(BUCKET)).await.map(|version| version.rev),
        Some(36310)
    );
}
