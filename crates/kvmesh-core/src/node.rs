//! # node：集群成员节点
//!
//! ## 核心意图（Why）
//! - 把“一个节点的服务端点、连接池与熔断器”收拢为一个不可变值，注册表以 `Arc` 共享；
//! - 拓扑变化时不原地修改节点，而是构造新节点替换旧节点，读者永远看到一致的视图。
//!
//! ## 行为契约（What）
//! - 节点键 [`NodeKey`] = 主端点（有 KV 服务时取 KV 端点，否则取管理端点）+ 所属 bucket；
//! - [`ClusterNode::send`] 依次经过熔断器、连接池租约与连接发送，并把结果回填熔断统计；
//!   调用方取消不计为失败；
//! - 只暴露 HTTP 服务的节点没有连接池，向其发送二进制命令返回 [`KvError::NodeNotAvailable`]；
//! - [`ClusterNode::dispose`] 触发 `retired` 令牌并关闭连接池，正在进行的租约归还时关闭。

use std::{fmt, sync::Arc};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

use crate::{
    circuit_breaker::{CallOutcome, CircuitBreaker, CircuitPermit, CircuitState},
    endpoint::HostEndpoint,
    error::KvError,
    pool::{ConnectionPool, PoolStats},
    protocol::{Request, Response},
    service::ServiceType,
    topology::{BucketType, NodeAdapter, NodeIdentity},
};

/// 注册表键。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub endpoint: HostEndpoint,
    pub bucket: Option<Arc<str>>,
}

impl NodeKey {
    pub fn new(endpoint: HostEndpoint, bucket: Option<Arc<str>>) -> Self {
        Self { endpoint, bucket }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bucket {
            Some(bucket) => write!(f, "{}/{}", self.endpoint, bucket),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

/// 共享节点句柄。
pub type SharedNode = Arc<ClusterNode>;

/// 已连接的集群节点。
pub struct ClusterNode {
    key: NodeKey,
    adapter: NodeAdapter,
    identity: NodeIdentity,
    bucket_type: BucketType,
    pool: Option<ConnectionPool>,
    breaker: CircuitBreaker,
    retired: CancellationToken,
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("key", &self.key)
            .field("bucket_type", &self.bucket_type)
            .field("services", &self.adapter.services().collect::<Vec<_>>())
            .field("circuit", &self.breaker.state())
            .field("pool", &self.pool.as_ref().map(ConnectionPool::stats))
            .finish()
    }
}

impl ClusterNode {
    pub(crate) fn new(
        key: NodeKey,
        adapter: NodeAdapter,
        bucket_type: BucketType,
        pool: Option<ConnectionPool>,
        breaker: CircuitBreaker,
    ) -> Self {
        let identity = adapter.identity();
        Self {
            key,
            adapter,
            identity,
            bucket_type,
            pool,
            breaker,
            retired: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn endpoint(&self) -> &HostEndpoint {
        &self.key.endpoint
    }

    pub fn bucket(&self) -> Option<&str> {
        self.key.bucket.as_deref()
    }

    pub fn bucket_type(&self) -> BucketType {
        self.bucket_type
    }

    pub fn adapter(&self) -> &NodeAdapter {
        &self.adapter
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn has_service(&self, service: ServiceType) -> bool {
        self.adapter.has_service(service)
    }

    /// HTTP 服务的基础 URI。
    pub fn uri(&self, service: ServiceType) -> Option<String> {
        self.adapter.uri(service)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(ConnectionPool::stats)
    }

    /// 节点被移出注册表或释放时完成。
    pub fn retired(&self) -> WaitForCancellationFuture<'_> {
        self.retired.cancelled()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// 通过节点连接池发送一个请求。
    pub async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response, KvError> {
        let pool = self.pool.as_ref().ok_or_else(|| KvError::NodeNotAvailable {
            service: ServiceType::KeyValue,
            bucket: self.bucket().map(str::to_owned),
        })?;
        let permit = PermitGuard::new(&self.breaker, self.breaker.try_acquire()?);
        let result = Self::dispatch(pool, request, cancel).await;
        permit.complete(CallOutcome::from_result(&result));
        result
    }

    async fn dispatch(
        pool: &ConnectionPool,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, KvError> {
        let lease = pool.lease(cancel).await?;
        let result = lease.send(request, cancel).await;
        if let Err(KvError::Transport { .. } | KvError::Protocol { .. }) = &result {
            lease.mark_broken();
        }
        result
    }

    /// 标记节点已退役：`retired()` 的等待者立即被唤醒，连接池保持不变。
    pub(crate) fn retire(&self) {
        self.retired.cancel();
    }

    /// 释放节点：通知监听者并关闭连接池。重复调用无副作用。
    pub async fn dispose(&self) {
        self.retire();
        if let Some(pool) = &self.pool {
            if pool.is_closed() {
                return;
            }
            pool.close().await;
        }
        info!(node = %self.key, "node disposed");
    }
}

/// 保证许可在发送被中途丢弃时也会交还（记为 `Ignored`）。
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<CircuitPermit>,
}

impl<'a> PermitGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, permit: CircuitPermit) -> Self {
        Self {
            breaker,
            permit: Some(permit),
        }
    }

    fn complete(mut self, outcome: CallOutcome) {
        if let Some(permit) = self.permit.take() {
            self.breaker.complete(permit, outcome);
        }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            debug!("dispatch dropped before completion");
            self.breaker.complete(permit, CallOutcome::Ignored);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        node_factory::{ClusterNodeFactory, DefaultClusterNodeFactory},
        options::{CircuitBreakerOptions, ClusterOptions},
        protocol::{Opcode, Status},
        sasl::MechanismType,
        test_stubs::MockConnector,
        time::ManualClock,
    };

    fn options() -> ClusterOptions {
        ClusterOptions::default()
            .with_credentials("app", "pw")
            .with_sasl_mechanism(MechanismType::Plain)
            .with_pool(1, 2)
            .with_circuit_breaker(CircuitBreakerOptions {
                enabled: true,
                failure_threshold: 2,
                rolling_window_ms: 10_000,
                cooldown_ms: 1_000,
            })
    }

    fn noop_count(connector: &MockConnector) -> usize {
        connector
            .opened()
            .iter()
            .flat_map(|connection| connection.sent())
            .filter(|request| request.opcode == Opcode::Noop)
            .count()
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_touching_the_network() {
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&healthy);
        let connector = Arc::new(MockConnector::with_responder(Arc::new(move |request: &Request| {
            if request.opcode == Opcode::Noop && !flag.load(Ordering::SeqCst) {
                Err(KvError::Transport {
                    endpoint: HostEndpoint::new("10.0.0.1", 11210),
                    detail: "connection reset".into(),
                })
            } else {
                Ok(Response::for_request(request, Status::Success))
            }
        })));
        let clock = ManualClock::new();
        let factory = DefaultClusterNodeFactory::new(&options(), Arc::clone(&connector) as _)
            .with_clock(Arc::new(clock.clone()));
        let cancel = CancellationToken::new();
        let node = factory
            .create_and_connect(
                HostEndpoint::new("10.0.0.1", 11210),
                BucketType::Couchbase,
                None,
                Some(Arc::from("default")),
                &cancel,
            )
            .await
            .expect("connected");

        for _ in 0..2 {
            let err = node.send(Request::new(Opcode::Noop), &cancel).await.expect_err("reset");
            assert!(matches!(err, KvError::Transport { .. }));
        }
        assert_eq!(node.circuit_state(), CircuitState::Open);
        assert_eq!(noop_count(&connector), 2);

        let err = node.send(Request::new(Opcode::Noop), &cancel).await.expect_err("fast fail");
        assert!(matches!(err, KvError::CircuitOpen { .. }));
        assert_eq!(noop_count(&connector), 2);

        clock.advance(Duration::from_secs(1));
        healthy.store(true, Ordering::SeqCst);
        node.send(Request::new(Opcode::Noop), &cancel).await.expect("probe succeeds");
        assert_eq!(node.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn canceled_sends_do_not_trip_the_breaker() {
        let connector = Arc::new(MockConnector::accepting());
        let factory = DefaultClusterNodeFactory::new(&options(), Arc::clone(&connector) as _);
        let node = factory
            .create_and_connect(
                HostEndpoint::new("10.0.0.1", 11210),
                BucketType::Couchbase,
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .expect("connected");
        let canceled = CancellationToken::new();
        canceled.cancel();
        for _ in 0..5 {
            let err = node.send(Request::new(Opcode::Noop), &canceled).await.expect_err("canceled");
            assert_eq!(err, KvError::Canceled);
        }
        assert_eq!(node.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dispose_retires_and_closes_the_pool() {
        let connector = Arc::new(MockConnector::accepting());
        let factory = DefaultClusterNodeFactory::new(&options(), Arc::clone(&connector) as _);
        let node = factory
            .create_and_connect(
                HostEndpoint::new("10.0.0.1", 11210),
                BucketType::Couchbase,
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .expect("connected");
        node.dispose().await;
        node.retired().await;
        assert!(node.is_retired());
        assert_eq!(connector.live_connections(), 0);
        let err = node
            .send(Request::new(Opcode::Noop), &CancellationToken::new())
            .await
            .expect_err("closed");
        assert!(matches!(err, KvError::PoolClosed { .. }));
    }
}
