use std::{collections::BTreeMap, sync::Arc};

use crate::{
    endpoint::HostEndpoint,
    service::{DEFAULT_MANAGEMENT_PORT, ServiceType},
};

use super::NodeIdentity;

/// 快照中单个节点的视图：主机名 + 服务到端口的映射。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 主机名在构造时归一化（与 [`HostEndpoint`] 一致）；
///   - 管理服务端口总是存在，缺省为 8091；
///   - 值语义：两个适配器相等当且仅当主机名与端口映射完全一致，调和时据此判断节点是否需要替换。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAdapter {
    hostname: Arc<str>,
    ports: BTreeMap<ServiceType, u16>,
    this_node: bool,
}

impl NodeAdapter {
    /// 构造只暴露管理服务（默认端口）的适配器。
    pub fn new(hostname: impl AsRef<str>) -> Self {
        let endpoint = HostEndpoint::new(hostname, DEFAULT_MANAGEMENT_PORT);
        let mut ports = BTreeMap::new();
        ports.insert(ServiceType::Management, DEFAULT_MANAGEMENT_PORT);
        Self {
            hostname: Arc::from(endpoint.host()),
            ports,
            this_node: false,
        }
    }

    /// 由一个 KV 端点构造适配器，用于种子节点与无拓扑信息的建连。
    pub fn from_kv_endpoint(endpoint: &HostEndpoint) -> Self {
        Self::new(endpoint.host()).with_service(ServiceType::KeyValue, endpoint.port())
    }

    /// 声明服务端口（覆盖已有值）。
    pub fn with_service(mut self, service: ServiceType, port: u16) -> Self {
        self.ports.insert(service, port);
        self
    }

    pub(crate) fn with_this_node(mut self, this_node: bool) -> Self {
        self.this_node = this_node;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// 该条目是否描述了提供此快照的节点自身。
    pub fn is_this_node(&self) -> bool {
        self.this_node
    }

    pub fn port(&self, service: ServiceType) -> Option<u16> {
        self.ports.get(&service).copied()
    }

    pub fn has_service(&self, service: ServiceType) -> bool {
        self.ports.contains_key(&service)
    }

    /// 节点暴露的全部服务，按 [`ServiceType`] 排序。
    pub fn services(&self) -> impl Iterator<Item = ServiceType> + '_ {
        self.ports.keys().copied()
    }

    pub fn endpoint(&self, service: ServiceType) -> Option<HostEndpoint> {
        self.port(service)
            .map(|port| HostEndpoint::new(self.hostname.as_ref(), port))
    }

    /// 主端点：存在 KV 服务时取 KV 端点，否则取管理端点。
    pub fn primary_endpoint(&self) -> HostEndpoint {
        self.endpoint(ServiceType::KeyValue)
            .or_else(|| self.endpoint(ServiceType::Management))
            .unwrap_or_else(|| HostEndpoint::new(self.hostname.as_ref(), DEFAULT_MANAGEMENT_PORT))
    }

    /// HTTP 服务的基础 URI；KV 服务与未暴露的服务返回 `None`。
    pub fn uri(&self, service: ServiceType) -> Option<String> {
        if !service.is_http() {
            return None;
        }
        self.endpoint(service)
            .map(|endpoint| format!("http://{endpoint}{}", service.uri_path()))
    }

    /// 主机名与服务端口是否完全一致（忽略 `thisNode` 标记）。
    pub fn same_services(&self, other: &NodeAdapter) -> bool {
        self.hostname == other.hostname && self.ports == other.ports
    }

    /// 计算节点身份集合。
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::of(self)
    }

    /// 替换 `$HOST` 占位符或空主机名。
    pub(crate) fn resolve_placeholder(mut self, origin_host: Option<&str>) -> Self {
        if let Some(origin) = origin_host
            && (self.hostname.is_empty() || self.hostname.as_ref() == "$host")
        {
            self.hostname = Arc::from(HostEndpoint::new(origin, 0).host());
        }
        self
    }
}
