//! # node_factory：节点构造与连接
//!
//! ## 核心意图（Why）
//! - 把“选择连接池形态 → 预热并认证 → 组装熔断器”集中在一处，注册表只接收完全就绪的节点；
//! - 以 trait 暴露，拓扑调和与监听测试可以替换为计数或失败注入的实现。
//!
//! ## 行为契约（What）
//! - 成功返回的节点已完成连接池预热，池中每条连接都已认证；
//! - 握手失败返回 [`KvError::AuthenticationFailed`]，传输失败返回 [`KvError::ConnectFailed`]，
//!   取消返回 [`KvError::Canceled`]；任一失败都会关闭本次打开的全部连接；
//! - 工厂从不读写注册表。

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    bootstrap::AuthenticatingOpener,
    circuit_breaker::CircuitBreaker,
    connection::SharedConnector,
    endpoint::HostEndpoint,
    error::KvError,
    node::{ClusterNode, NodeKey, SharedNode},
    options::{CircuitBreakerOptions, ClusterOptions, PoolOptions},
    pool::ConnectionPool,
    sasl::{SharedMechanism, mechanism_for},
    service::ServiceType,
    time::{SharedClock, SystemClock},
    topology::{BucketType, NodeAdapter},
};

/// 节点工厂。
#[async_trait]
pub trait ClusterNodeFactory: Send + Sync + fmt::Debug + 'static {
    /// 构造并连接节点。
    ///
    /// - `adapter` 缺省时视为只提供 KV 服务的节点（种子节点）；
    /// - `bucket` 非空时每条连接在认证后执行 `SELECT_BUCKET`。
    async fn create_and_connect(
        &self,
        endpoint: HostEndpoint,
        bucket_type: BucketType,
        adapter: Option<NodeAdapter>,
        bucket: Option<Arc<str>>,
        cancel: &CancellationToken,
    ) -> Result<SharedNode, KvError>;
}

/// 共享工厂句柄。
pub type SharedNodeFactory = Arc<dyn ClusterNodeFactory>;

/// 基于 [`SharedConnector`] 与 SASL 认证的默认工厂。
pub struct DefaultClusterNodeFactory {
    connector: SharedConnector,
    mechanism: SharedMechanism,
    pool: PoolOptions,
    breaker: CircuitBreakerOptions,
    handshake_timeout: Duration,
    clock: SharedClock,
}

impl fmt::Debug for DefaultClusterNodeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultClusterNodeFactory")
            .field("mechanism", &self.mechanism.mechanism_type())
            .field("pool", &self.pool)
            .field("breaker", &self.breaker)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl DefaultClusterNodeFactory {
    pub fn new(options: &ClusterOptions, connector: SharedConnector) -> Self {
        Self {
            connector,
            mechanism: mechanism_for(options.sasl_mechanism, options.credentials.clone()),
            pool: options.pool,
            breaker: options.circuit_breaker,
            handshake_timeout: options.handshake_timeout(),
            clock: Arc::new(SystemClock),
        }
    }

    /// 替换熔断器使用的时钟。
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Memcached bucket 不做弹性伸缩，使用固定尺寸连接池。
    fn pool_options(&self, bucket_type: BucketType) -> PoolOptions {
        match bucket_type {
            BucketType::Memcached => {
                let size = self.pool.min_size.max(1);
                PoolOptions {
                    min_size: size,
                    max_size: size,
                }
            }
            BucketType::Couchbase | BucketType::Ephemeral => self.pool,
        }
    }
}

#[async_trait]
impl ClusterNodeFactory for DefaultClusterNodeFactory {
    async fn create_and_connect(
        &self,
        endpoint: HostEndpoint,
        bucket_type: BucketType,
        adapter: Option<NodeAdapter>,
        bucket: Option<Arc<str>>,
        cancel: &CancellationToken,
    ) -> Result<SharedNode, KvError> {
        if cancel.is_cancelled() {
            return Err(KvError::Canceled);
        }
        let adapter = adapter.unwrap_or_else(|| NodeAdapter::from_kv_endpoint(&endpoint));

        let pool = if adapter.has_service(ServiceType::KeyValue) {
            let opener = AuthenticatingOpener::new(
                endpoint.clone(),
                Arc::clone(&self.connector),
                Arc::clone(&self.mechanism),
                bucket.clone(),
                self.handshake_timeout,
            );
            let pool = ConnectionPool::new(Arc::new(opener), self.pool_options(bucket_type));
            if let Err(err) = pool.warm_up(cancel).await {
                pool.close().await;
                if !matches!(err, KvError::Canceled) {
                    warn!(
                        endpoint = %endpoint,
                        bucket = bucket.as_deref().unwrap_or(""),
                        code = err.code(),
                        error = %err,
                        "node connection failed"
                    );
                }
                return Err(err);
            }
            Some(pool)
        } else {
            None
        };

        let breaker = CircuitBreaker::new(endpoint.clone(), self.breaker, Arc::clone(&self.clock));
        let node = ClusterNode::new(
            NodeKey::new(endpoint, bucket),
            adapter,
            bucket_type,
            pool,
            breaker,
        );
        info!(
            node = %node.key(),
            bucket_type = %bucket_type,
            services = ?node.adapter().services().map(ServiceType::as_str).collect::<Vec<_>>(),
            "node connected"
        );
        Ok(Arc::new(node))
    }
}
