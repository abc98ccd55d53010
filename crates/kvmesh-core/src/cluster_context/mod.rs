//! # cluster_context：已连接节点注册表与拓扑调和
//!
//! ## 核心意图（Why）
//! - 进程内唯一的节点注册表：调度路径只读、无锁；拓扑调和路径在互斥锁下以写时复制更新；
//! - 调和算法（剪枝 + 补齐 + 替换）集中在 [`reconcile`] 子模块，注册表本身只负责一致的增删。
//!
//! ## 行为契约（What）
//! - 注册表键为 [`NodeKey`]（主端点 + 所属 bucket），同一物理节点可以为多个 bucket 各持有一个节点；
//! - [`ClusterContext::nodes`] 返回不可变快照，持有期间不会观察到并发修改；
//! - 被移出注册表的节点立即触发 `retired`，其连接池在后台关闭：已租出的连接归还时关闭，
//!   新的租约返回 [`KvError::PoolClosed`]；
//! - 写锁内不发生任何挂起。
//!
//! ## 风险提示（Trade-offs）
//! - 每次写入复制整张表，节点规模在数百以内时代价可以忽略；读路径因此完全无锁。

mod reconcile;

use std::{collections::HashMap, fmt, sync::Arc};

use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::KvError,
    node::{NodeKey, SharedNode},
    node_factory::SharedNodeFactory,
    pool::spawn_detached,
    service::ServiceType,
};

pub use reconcile::ReconcileReport;

/// 注册表的不可变快照。
#[derive(Clone, Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeKey, SharedNode>,
}

impl NodeRegistry {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&SharedNode> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedNode> {
        self.nodes.values()
    }

    /// 属于指定 bucket 的节点；`None` 表示集群级节点。
    pub fn owned_by<'a>(&'a self, bucket: Option<&'a str>) -> impl Iterator<Item = &'a SharedNode> + 'a {
        self.nodes.values().filter(move |node| node.bucket() == bucket)
    }
}

/// 集群上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：为拓扑调和、配置监听与服务选点提供同一份节点视图；
/// - **契约 (What)**：
///   - 读操作（选点、快照）无锁，写操作通过 `write` 互斥锁串行化；
///   - `node_count` 广播注册表规模，监听器在注册表为空时据此等待；
///   - [`ClusterContext::close`] 之后所有进行中的节点创建被取消。
/// - **执行 (How)**：写入时克隆当前表、修改、`store` 回 `ArcSwap`，再在锁外处理被移除的节点。
pub struct ClusterContext {
    registry: ArcSwap<NodeRegistry>,
    write: Mutex<()>,
    factory: SharedNodeFactory,
    node_count: watch::Sender<usize>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterContext")
            .field("nodes", &self.registry.load().len())
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ClusterContext {
    pub fn new(factory: SharedNodeFactory) -> Self {
        let (node_count, _) = watch::channel(0);
        Self {
            registry: ArcSwap::from_pointee(NodeRegistry::default()),
            write: Mutex::new(()),
            factory,
            node_count,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn factory(&self) -> &SharedNodeFactory {
        &self.factory
    }

    /// 当前注册表快照。
    pub fn nodes(&self) -> Arc<NodeRegistry> {
        self.registry.load_full()
    }

    pub fn len(&self) -> usize {
        self.registry.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.load().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 插入一个已连接节点。
    pub fn add_node(&self, node: SharedNode) -> Result<(), KvError> {
        if self.is_closed() {
            return Err(KvError::PoolClosed {
                endpoint: node.endpoint().clone(),
            });
        }
        self.mutate(|nodes| {
            if nodes.contains_key(node.key()) {
                return Err(KvError::DuplicateNode {
                    endpoint: node.endpoint().clone(),
                });
            }
            nodes.insert(node.key().clone(), Arc::clone(&node));
            Ok(())
        })?;
        debug!(node = %node.key(), "node registered");
        Ok(())
    }

    /// 移除节点并在后台释放其连接池。
    pub fn remove_node(&self, key: &NodeKey) -> Option<SharedNode> {
        let removed = self.mutate(|nodes| nodes.remove(key))?;
        retire_all(vec![Arc::clone(&removed)]);
        Some(removed)
    }

    /// 随机选择一个提供 `service` 的节点；`bucket` 给定时只在该 bucket 的节点中选择。
    pub fn get_random_node_for_service(
        &self,
        service: ServiceType,
        bucket: Option<&str>,
    ) -> Result<SharedNode, KvError> {
        let registry = self.registry.load();
        let candidates: Vec<&SharedNode> = registry
            .iter()
            .filter(|node| node.has_service(service))
            .filter(|node| bucket.is_none() || node.bucket() == bucket)
            .collect();
        candidates
            .choose(&mut rand::rng())
            .map(|node| Arc::clone(node))
            .ok_or_else(|| KvError::NodeNotAvailable {
                service,
                bucket: bucket.map(str::to_owned),
            })
    }

    /// 随机选择任一节点，用于管理类请求。
    pub fn get_random_node(&self) -> Result<SharedNode, KvError> {
        let registry = self.registry.load();
        let candidates: Vec<&SharedNode> = registry.iter().collect();
        candidates
            .choose(&mut rand::rng())
            .map(|node| Arc::clone(node))
            .ok_or(KvError::NodeNotAvailable {
                service: ServiceType::Management,
                bucket: None,
            })
    }

    /// 等待注册表中至少出现一个节点。
    pub async fn wait_for_nodes(&self, cancel: &CancellationToken) -> Result<(), KvError> {
        let mut count = self.node_count.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(KvError::Canceled),
            _ = self.shutdown.cancelled() => Err(KvError::Canceled),
            changed = count.wait_for(|count| *count > 0) => changed.map(|_| ()).map_err(|_| KvError::Canceled),
        }
    }

    /// 关闭上下文：取消进行中的节点创建，清空注册表并释放全部节点。
    pub async fn close(&self) {
        self.shutdown.cancel();
        let drained = self.mutate(|nodes| nodes.drain().map(|(_, node)| node).collect::<Vec<_>>());
        for node in &drained {
            node.retire();
        }
        join_all(drained.iter().map(|node| node.dispose())).await;
        info!(nodes = drained.len(), "cluster context closed");
    }

    /// 上下文级取消令牌，节点创建以其子令牌运行。
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// 写时复制更新注册表；闭包在写锁内执行，不得挂起。
    fn mutate<R>(&self, f: impl FnOnce(&mut HashMap<NodeKey, SharedNode>) -> R) -> R {
        let _guard = self.write.lock();
        let mut nodes = self.registry.load().nodes.clone();
        let result = f(&mut nodes);
        let len = nodes.len();
        self.registry.store(Arc::new(NodeRegistry { nodes }));
        self.node_count.send_replace(len);
        result
    }
}

/// 立即标记退役，连接池在后台关闭；不在运行时内时退化为只标记退役。
fn retire_all(nodes: Vec<SharedNode>) {
    for node in nodes {
        node.retire();
        debug!(node = %node.key(), "node retired");
        spawn_detached(async move { node.dispose().await });
    }
}
