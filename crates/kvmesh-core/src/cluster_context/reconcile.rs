//! 拓扑调和：剪枝、补齐与替换。
//!
//! # 教案式说明
//! - **意图 (Why)**：把一份新快照翻译成注册表上的增删操作，同时保证服务可用性不因
//!   “每节点单服务”的拓扑或再平衡中的临时快照而中断；
//! - **契约 (What)**：
//!   - 节点身份是其全部 (服务, 端点) 对的集合，与快照条目有任一交集即视为仍在拓扑中；
//!   - 剪枝候选若是某服务在本 bucket 中唯一的提供者，而新快照中没有任何节点提供该服务，
//!     则推迟移除并记录日志；
//!   - 同一快照重复调和不产生任何增删（幂等）；
//!   - 节点创建失败只记录，等待下一份快照重试；
//! - **执行 (How)**：剪枝计划在写锁内基于当前表计算并立即生效；建连在锁外并发进行，
//!   完成后逐个插入或替换。
//! - **风险 (Trade-offs)**：推迟移除意味着注册表可能短暂保留已离开拓扑的节点，
//!   调度到该节点的请求会以传输错误失败并由熔断器隔离。

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClusterContext, retire_all};
use crate::{
    endpoint::HostEndpoint,
    error::KvError,
    node::{NodeKey, SharedNode},
    service::ServiceType,
    topology::{BucketConfig, NodeAdapter, NodeIdentity},
};

/// 一次调和的结果摘要。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<NodeKey>,
    pub replaced: Vec<NodeKey>,
    pub removed: Vec<NodeKey>,
    /// 因唯一服务提供者约束而推迟移除的节点。
    pub deferred: Vec<NodeKey>,
    /// 建连失败的端点，下一份快照会重试。
    pub failed: Vec<(HostEndpoint, KvError)>,
}

impl ReconcileReport {
    /// 注册表是否发生了任何变化。
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.replaced.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct PrunePlan {
    remove: Vec<SharedNode>,
    deferred: Vec<(SharedNode, Vec<ServiceType>)>,
}

impl ClusterContext {
    /// 移除不再出现在快照中的节点，返回被移除的节点。
    pub fn prune_nodes(&self, config: &BucketConfig) -> Vec<SharedNode> {
        self.prune(config).remove
    }

    /// 以快照调和注册表：先剪枝，再创建缺失节点、替换服务端口发生变化的节点。
    pub async fn apply(&self, config: &BucketConfig) -> ReconcileReport {
        let plan = self.prune(config);
        let mut report = ReconcileReport {
            removed: plan.remove.iter().map(|node| node.key().clone()).collect(),
            deferred: plan.deferred.iter().map(|(node, _)| node.key().clone()).collect(),
            ..ReconcileReport::default()
        };

        let registry = self.nodes();
        let owned: Vec<&SharedNode> = registry.owned_by(config.name()).collect();
        let mut creates: Vec<&NodeAdapter> = Vec::new();
        let mut replaces: Vec<(SharedNode, &NodeAdapter)> = Vec::new();
        for adapter in config.nodes() {
            let identity = adapter.identity();
            match owned.iter().find(|node| node.identity().intersects(&identity)) {
                None => creates.push(adapter),
                Some(node) if !node.adapter().same_services(adapter) => {
                    if !replaces.iter().any(|(old, _)| old.key() == node.key()) {
                        replaces.push((Arc::clone(node), adapter));
                    }
                }
                Some(_) => {}
            }
        }

        let cancel = self.shutdown_token().child_token();
        let (created, replacements) = futures::join!(
            join_all(creates.iter().map(|adapter| self.connect(config, adapter, &cancel))),
            join_all(replaces.iter().map(|(_, adapter)| self.connect(config, adapter, &cancel))),
        );

        for (adapter, result) in creates.iter().zip(created) {
            match result {
                Ok(node) => match self.add_node(Arc::clone(&node)) {
                    Ok(()) => report.added.push(node.key().clone()),
                    Err(err) => {
                        debug!(node = %node.key(), error = %err, "discarding freshly connected node");
                        retire_all(vec![node]);
                    }
                },
                Err(err) => self.record_failure(config, adapter, err, &mut report),
            }
        }

        for ((old, adapter), result) in replaces.into_iter().zip(replacements) {
            match result {
                Ok(node) => {
                    if self.swap(&old, &node) {
                        report.replaced.push(node.key().clone());
                        retire_all(vec![old]);
                    } else {
                        retire_all(vec![node]);
                    }
                }
                Err(err) => self.record_failure(config, adapter, err, &mut report),
            }
        }

        if report.is_noop() && report.failed.is_empty() {
            debug!(
                bucket = config.name().unwrap_or(""),
                rev = %config.version(),
                "topology unchanged"
            );
        } else {
            info!(
                bucket = config.name().unwrap_or(""),
                rev = %config.version(),
                added = report.added.len(),
                replaced = report.replaced.len(),
                removed = report.removed.len(),
                deferred = report.deferred.len(),
                failed = report.failed.len(),
                "topology reconciled"
            );
        }
        report
    }

    fn prune(&self, config: &BucketConfig) -> PrunePlan {
        let snapshot: Vec<NodeIdentity> = config.nodes().iter().map(NodeAdapter::identity).collect();
        let plan = self.mutate(|nodes| {
            let owned = nodes.values().filter(|node| node.bucket() == config.name()).cloned();
            let plan = plan_prune(owned.collect(), config, &snapshot);
            for node in &plan.remove {
                nodes.remove(node.key());
            }
            plan
        });

        for (node, services) in &plan.deferred {
            warn!(
                node = %node.key(),
                rev = %config.version(),
                services = ?services.iter().map(|service| service.as_str()).collect::<Vec<_>>(),
                "deferring removal of last provider of services absent from snapshot"
            );
        }
        for node in &plan.remove {
            info!(node = %node.key(), rev = %config.version(), "node left topology");
        }
        retire_all(plan.remove.clone());
        plan
    }

    async fn connect(
        &self,
        config: &BucketConfig,
        adapter: &NodeAdapter,
        cancel: &CancellationToken,
    ) -> Result<SharedNode, KvError> {
        self.factory()
            .create_and_connect(
                adapter.primary_endpoint(),
                config.bucket_type(),
                Some(adapter.clone()),
                config.name_arc().cloned(),
                cancel,
            )
            .await
    }

    /// 以新节点替换旧节点；旧节点已不在表中或新键被占用时放弃替换。
    fn swap(&self, old: &SharedNode, new: &SharedNode) -> bool {
        if self.is_closed() {
            return false;
        }
        self.mutate(|nodes| {
            let current = nodes
                .get(old.key())
                .is_some_and(|node| Arc::ptr_eq(node, old));
            let clash = new.key() != old.key() && nodes.contains_key(new.key());
            if !current || clash {
                return false;
            }
            nodes.remove(old.key());
            nodes.insert(new.key().clone(), Arc::clone(new));
            true
        })
    }

    fn record_failure(
        &self,
        config: &BucketConfig,
        adapter: &NodeAdapter,
        err: KvError,
        report: &mut ReconcileReport,
    ) {
        let endpoint = adapter.primary_endpoint();
        if err == KvError::Canceled {
            debug!(endpoint = %endpoint, "node creation canceled");
        } else {
            warn!(
                endpoint = %endpoint,
                bucket = config.name().unwrap_or(""),
                rev = %config.version(),
                code = err.code(),
                error = %err,
                "node creation failed; retrying on next snapshot"
            );
        }
        report.failed.push((endpoint, err));
    }
}

/// 计算剪枝计划。
///
/// 候选按键排序后逐个评估，先移除的候选不再计入“其他提供者”，结果与表的迭代顺序无关。
fn plan_prune(mut owned: Vec<SharedNode>, config: &BucketConfig, snapshot: &[NodeIdentity]) -> PrunePlan {
    owned.sort_by(|a, b| a.key().cmp(b.key()));
    let candidates: Vec<SharedNode> = owned
        .iter()
        .filter(|node| !snapshot.iter().any(|identity| node.identity().intersects(identity)))
        .cloned()
        .collect();

    let mut plan = PrunePlan::default();
    let mut survivors = owned;
    for candidate in candidates {
        let orphaned: Vec<ServiceType> = candidate
            .adapter()
            .services()
            .filter(|service| {
                !survivors
                    .iter()
                    .any(|other| other.key() != candidate.key() && other.has_service(*service))
            })
            .filter(|service| !config.provides(*service))
            .collect();
        if orphaned.is_empty() {
            survivors.retain(|node| node.key() != candidate.key());
            plan.remove.push(candidate);
        } else {
            plan.deferred.push((candidate, orphaned));
        }
    }
    plan
}
