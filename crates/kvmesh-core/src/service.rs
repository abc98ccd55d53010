//! 集群节点可能暴露的服务类型。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 数据服务（二进制 KV 协议）默认端口。
pub const DEFAULT_KV_PORT: u16 = 11210;
/// 集群管理服务默认端口；每个节点都运行管理服务。
pub const DEFAULT_MANAGEMENT_PORT: u16 = 8091;

/// 节点服务类型。
///
/// 一个节点不必暴露全部服务；在“每节点单服务”的拓扑中，不同节点提供互不重叠的服务集合。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    KeyValue,
    Query,
    Search,
    Analytics,
    Views,
    Management,
    Eventing,
}

impl ServiceType {
    /// 全部服务类型，顺序稳定。
    pub const ALL: [ServiceType; 7] = [
        ServiceType::KeyValue,
        ServiceType::Query,
        ServiceType::Search,
        ServiceType::Analytics,
        ServiceType::Views,
        ServiceType::Management,
        ServiceType::Eventing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "query",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
            ServiceType::Views => "views",
            ServiceType::Management => "management",
            ServiceType::Eventing => "eventing",
        }
    }

    /// 该服务是否通过 HTTP 访问；KV 走二进制协议，没有 URI。
    pub fn is_http(self) -> bool {
        !matches!(self, ServiceType::KeyValue)
    }

    /// 服务 URI 的路径前缀。
    pub(crate) fn uri_path(self) -> &'static str {
        match self {
            ServiceType::Query => "/query/service",
            ServiceType::Analytics => "/analytics/service",
            ServiceType::Search | ServiceType::Views | ServiceType::Management | ServiceType::Eventing => "/",
            ServiceType::KeyValue => "",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
