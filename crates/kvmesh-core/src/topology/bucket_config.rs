use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::Deserialize;

use crate::{endpoint::HostEndpoint, error::KvError, service::ServiceType};

use super::{BucketType, ConfigVersion, NodeAdapter};

/// 不可变的拓扑快照。
///
/// # 教案式说明
/// - **意图 (Why)**：承载服务端推送的集群/bucket 视图，供配置处理器去重与调和算法比较；
/// - **契约 (What)**：
///   - `name` 为 `None` 表示集群级配置（不属于任何 bucket）；
///   - 节点顺序保留服务端文档中的顺序；
///   - 解析后的值不再变化，可通过 `Arc` 在任务间共享。
/// - **执行 (How)**：优先使用 `nodesExt` 构造节点适配器；缺失时回退到旧式 `nodes` 数组。
///   `$HOST` 占位符与缺省主机名替换为拉取该配置的源主机。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketConfig {
    version: ConfigVersion,
    name: Option<Arc<str>>,
    bucket_type: BucketType,
    nodes: Vec<NodeAdapter>,
    bucket_capabilities: BTreeSet<String>,
    cluster_capabilities: BTreeMap<String, BTreeSet<String>>,
}

impl BucketConfig {
    /// 直接由字段构造快照。
    pub fn new(name: Option<&str>, version: ConfigVersion, nodes: Vec<NodeAdapter>) -> Self {
        Self {
            version,
            name: name.map(Arc::from),
            bucket_type: BucketType::Couchbase,
            nodes,
            bucket_capabilities: BTreeSet::new(),
            cluster_capabilities: BTreeMap::new(),
        }
    }

    /// 解析一份 JSON 配置文档。
    ///
    /// `origin_host` 为提供该文档的节点主机名，用于替换 `$HOST` 占位符。
    pub fn from_json(raw: &[u8], origin_host: Option<&str>) -> Result<Self, KvError> {
        let doc: RawBucketConfig = serde_json::from_slice(raw)?;
        doc.into_config(origin_host)
    }

    pub fn with_bucket_type(mut self, bucket_type: BucketType) -> Self {
        self.bucket_type = bucket_type;
        self
    }

    pub fn version(&self) -> ConfigVersion {
        self.version
    }

    pub fn rev(&self) -> u64 {
        self.version.rev
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn name_arc(&self) -> Option<&Arc<str>> {
        self.name.as_ref()
    }

    pub fn bucket_type(&self) -> BucketType {
        self.bucket_type
    }

    pub fn nodes(&self) -> &[NodeAdapter] {
        &self.nodes
    }

    pub fn has_bucket_capability(&self, capability: &str) -> bool {
        self.bucket_capabilities.contains(capability)
    }

    /// 集群能力，例如 `("n1ql", "enhancedPreparedStatements")`。
    pub fn has_cluster_capability(&self, group: &str, capability: &str) -> bool {
        self.cluster_capabilities
            .get(group)
            .is_some_and(|caps| caps.contains(capability))
    }

    /// 快照中是否至少有一个节点提供该服务。
    pub fn provides(&self, service: ServiceType) -> bool {
        self.nodes.iter().any(|node| node.has_service(service))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBucketConfig {
    #[serde(default)]
    rev: u64,
    #[serde(default)]
    rev_epoch: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    bucket_type: Option<String>,
    #[serde(default)]
    node_locator: Option<String>,
    #[serde(default)]
    bucket_capabilities: Vec<String>,
    #[serde(default)]
    cluster_capabilities: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    nodes_ext: Vec<RawNodeExt>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    hostname: String,
    #[serde(default)]
    ports: RawPorts,
}

#[derive(Debug, Default, Deserialize)]
struct RawPorts {
    #[serde(default)]
    direct: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNodeExt {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: BTreeMap<String, u32>,
    #[serde(default)]
    this_node: bool,
}

/// `nodesExt.services` 中的键到服务类型的映射；TLS 端口（`kvSSL` 等）不在此列。
fn service_for_key(key: &str) -> Option<ServiceType> {
    match key {
        "kv" => Some(ServiceType::KeyValue),
        "n1ql" => Some(ServiceType::Query),
        "fts" => Some(ServiceType::Search),
        "cbas" => Some(ServiceType::Analytics),
        "capi" => Some(ServiceType::Views),
        "mgmt" => Some(ServiceType::Management),
        "eventingAdminPort" => Some(ServiceType::Eventing),
        _ => None,
    }
}

impl RawBucketConfig {
    fn into_config(self, origin_host: Option<&str>) -> Result<BucketConfig, KvError> {
        let nodes = if self.nodes_ext.is_empty() {
            self.nodes
                .iter()
                .map(legacy_adapter)
                .collect::<Result<Vec<_>, _>>()?
        } else {
            self.nodes_ext.iter().map(ext_adapter).collect::<Result<Vec<_>, _>>()?
        };
        let nodes = nodes
            .into_iter()
            .map(|adapter| adapter.resolve_placeholder(origin_host))
            .collect();

        let name = self.name.filter(|name| !name.is_empty());
        Ok(BucketConfig {
            version: ConfigVersion::new(self.rev_epoch, self.rev),
            name: name.as_deref().map(Arc::from),
            bucket_type: BucketType::infer(self.bucket_type.as_deref(), self.node_locator.as_deref()),
            nodes,
            bucket_capabilities: self.bucket_capabilities.into_iter().collect(),
            cluster_capabilities: self
                .cluster_capabilities
                .into_iter()
                .map(|(group, caps)| (group, caps.into_iter().collect()))
                .collect(),
        })
    }
}

fn ext_adapter(raw: &RawNodeExt) -> Result<NodeAdapter, KvError> {
    let hostname = raw.hostname.as_deref().unwrap_or("");
    let mut adapter = NodeAdapter::new(hostname).with_this_node(raw.this_node);
    for (key, port) in &raw.services {
        if let Some(service) = service_for_key(key) {
            let port = u16::try_from(*port).map_err(|_| KvError::ConfigParse {
                detail: format!("port {port} for service `{key}` is out of range"),
            })?;
            adapter = adapter.with_service(service, port);
        }
    }
    Ok(adapter)
}

fn legacy_adapter(raw: &RawNode) -> Result<NodeAdapter, KvError> {
    let management = HostEndpoint::parse_with_default_port(
        &raw.hostname,
        crate::service::DEFAULT_MANAGEMENT_PORT,
    )
    .map_err(|err| KvError::ConfigParse {
        detail: err.to_string(),
    })?;
    let mut adapter = NodeAdapter::new(management.host())
        .with_service(ServiceType::Management, management.port());
    if let Some(direct) = raw.ports.direct {
        adapter = adapter.with_service(ServiceType::KeyValue, direct);
    }
    Ok(adapter)
}
