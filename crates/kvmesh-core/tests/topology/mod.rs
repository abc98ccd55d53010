//! 拓扑调和集成测试：以真实形态的配置文档驱动 `ClusterContext`，
//! 校验剪枝幂等、单服务节点保留、再平衡移除、节点替换与唯一提供者推迟移除。

mod apply;
mod prune;

use std::sync::Arc;

use kvmesh_core::{
    BucketConfig, BucketType, ClusterContext, ClusterOptions, DefaultClusterNodeFactory,
    HostEndpoint, MechanismType, SharedNode, test_stubs::MockConnector,
};
use tokio_util::sync::CancellationToken;

pub const CONFIG_ERROR: &[u8] = include_bytes!("../fixtures/config-error.json");
pub const SERVICE_PER_NODE: &[u8] = include_bytes!("../fixtures/rev-36310-service-per-node.json");

pub const BUCKET: &str = "default";

pub struct Harness {
    pub connector: Arc<MockConnector>,
    pub context: ClusterContext,
}

impl Harness {
    pub fn new() -> Self {
        let connector = Arc::new(MockConnector::accepting());
        let options = ClusterOptions::default()
            .with_credentials("Administrator", "password")
            .with_sasl_mechanism(MechanismType::Plain)
            .with_pool(1, 2);
        let factory = DefaultClusterNodeFactory::new(&options, Arc::clone(&connector) as _);
        Self {
            connector,
            context: ClusterContext::new(Arc::new(factory)),
        }
    }

    /// 以“只知道 KV 端点”的形态注册节点，与引导阶段由种子地址创建的节点一致。
    pub async fn add_kv_node(&self, host: &str) -> SharedNode {
        let node = self
            .context
            .factory()
            .create_and_connect(
                HostEndpoint::new(host, 11210),
                BucketType::Couchbase,
                None,
                Some(Arc::from(BUCKET)),
                &CancellationToken::new(),
            )
            .await
            .expect("mock node connects");
        self.context.add_node(Arc::clone(&node)).expect("registered");
        node
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .context
            .nodes()
            .owned_by(Some(BUCKET))
            .map(|node| node.endpoint().host().to_owned())
            .collect();
        hosts.sort();
        hosts
    }
}

pub fn parse(raw: &[u8]) -> BucketConfig {
    BucketConfig::from_json(raw, None).expect("fixture parses")
}
