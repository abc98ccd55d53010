//! HTTP 服务的随机选点。
//!
//! 查询、全文检索、分析、视图、事件与管理请求都不经过 KV 连接池，只需要一个提供该服务的
//! 节点基础 URI。选点规则与 [`ClusterContext::get_random_node_for_service`] 一致：
//! 在当前注册表快照中均匀随机，没有候选时返回 [`KvError::NodeNotAvailable`]。

use std::sync::Arc;

use crate::{cluster_context::ClusterContext, error::KvError, service::ServiceType};

#[derive(Clone, Debug)]
pub struct ServiceUriProvider {
    context: Arc<ClusterContext>,
}

impl ServiceUriProvider {
    pub fn new(context: Arc<ClusterContext>) -> Self {
        Self { context }
    }

    pub fn random_query_uri(&self) -> Result<String, KvError> {
        self.random_uri(ServiceType::Query, None)
    }

    pub fn random_search_uri(&self) -> Result<String, KvError> {
        self.random_uri(ServiceType::Search, None)
    }

    pub fn random_analytics_uri(&self) -> Result<String, KvError> {
        self.random_uri(ServiceType::Analytics, None)
    }

    pub fn random_eventing_uri(&self) -> Result<String, KvError> {
        self.random_uri(ServiceType::Eventing, None)
    }

    /// 视图服务按 bucket 选点：只有属于该 bucket 的节点才会被选中。
    pub fn random_views_uri(&self, bucket: &str) -> Result<String, KvError> {
        self.random_uri(ServiceType::Views, Some(bucket))
    }

    /// 管理服务在每个节点上都运行，任一节点均可。
    pub fn random_management_uri(&self) -> Result<String, KvError> {
        let node = self.context.get_random_node()?;
        node.uri(ServiceType::Management)
            .ok_or_else(|| unavailable(ServiceType::Management, None))
    }

    fn random_uri(&self, service: ServiceType, bucket: Option<&str>) -> Result<String, KvError> {
        let node = self.context.get_random_node_for_service(service, bucket)?;
        node.uri(service).ok_or_else(|| unavailable(service, bucket))
    }
}

fn unavailable(service: ServiceType, bucket: Option<&str>) -> KvError {
    KvError::NodeNotAvailable {
        service,
        bucket: bucket.map(str::to_owned),
    }
}
