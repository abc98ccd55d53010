//! # cluster：客户端门面
//!
//! ## 核心意图（Why）
//! - 把节点工厂、集群上下文、配置处理器与每个 bucket 的监听器装配在一起，
//!   调用方只面对 `connect → open_bucket → close` 三个动作；
//!
//! ## 行为契约（What）
//! - [`Cluster::connect`] 并发连接全部种子节点，至少一个成功即返回；全部失败时返回最后一个错误；
//! - [`Cluster::open_bucket`] 为 bucket 启动流式监听，并等待第一份配置被应用；重复打开同一 bucket
//!   复用已有监听器；
//! - [`Cluster::close`] 停止全部监听器、释放全部节点，之后的选点返回 [`KvError::NodeNotAvailable`]。

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cluster_context::ClusterContext,
    config_handler::ConfigHandler,
    connection::SharedConnector,
    endpoint::HostEndpoint,
    error::KvError,
    listener::{ConfigListener, ListenerState, SharedConfigSource},
    node::SharedNode,
    node_factory::{ClusterNodeFactory, DefaultClusterNodeFactory, SharedNodeFactory},
    options::ClusterOptions,
    service::ServiceType,
    service_uri::ServiceUriProvider,
    topology::BucketType,
};

/// 已连接的集群。
pub struct Cluster {
    options: ClusterOptions,
    context: Arc<ClusterContext>,
    handler: Arc<ConfigHandler>,
    source: SharedConfigSource,
    listeners: DashMap<String, Arc<ConfigListener>>,
    uris: ServiceUriProvider,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("context", &self.context)
            .field("buckets", &self.listeners.len())
            .finish()
    }
}

impl Cluster {
    /// 以默认节点工厂连接集群。
    pub async fn connect(
        options: ClusterOptions,
        connector: SharedConnector,
        source: SharedConfigSource,
        cancel: &CancellationToken,
    ) -> Result<Self, KvError> {
        let factory = Arc::new(DefaultClusterNodeFactory::new(&options, connector));
        Self::connect_with_factory(options, factory, source, cancel).await
    }

    /// 以自定义节点工厂连接集群。
    pub async fn connect_with_factory(
        options: ClusterOptions,
        factory: SharedNodeFactory,
        source: SharedConfigSource,
        cancel: &CancellationToken,
    ) -> Result<Self, KvError> {
        options.validate()?;
        if options.seed_nodes.is_empty() {
            return Err(KvError::invalid_config("at least one seed node is required"));
        }

        let context = Arc::new(ClusterContext::new(Arc::clone(&factory)));
        let results = join_all(
            options
                .seed_nodes
                .iter()
                .map(|seed| connect_seed(factory.as_ref(), seed, &options, cancel)),
        )
        .await;

        let mut last_error = None;
        for (seed, result) in options.seed_nodes.iter().zip(results) {
            match result.and_then(|node| context.add_node(node)) {
                Ok(()) => {}
                Err(err) => {
                    warn!(endpoint = %seed, code = err.code(), error = %err, "seed node unavailable");
                    last_error = Some(err);
                }
            }
        }
        if context.is_empty() {
            return Err(last_error.unwrap_or(KvError::NodeNotAvailable {
                service: ServiceType::KeyValue,
                bucket: None,
            }));
        }
        info!(seeds = context.len(), "cluster connected");

        let handler = Arc::new(ConfigHandler::new(Arc::clone(&context)));
        let uris = ServiceUriProvider::new(Arc::clone(&context));
        Ok(Self {
            options,
            context,
            handler,
            source,
            listeners: DashMap::new(),
            uris,
        })
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    pub fn config_handler(&self) -> &Arc<ConfigHandler> {
        &self.handler
    }

    pub fn service_uris(&self) -> &ServiceUriProvider {
        &self.uris
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// 随机选择提供服务的节点。
    pub fn get_random_node_for_service(
        &self,
        service: ServiceType,
        bucket: Option<&str>,
    ) -> Result<SharedNode, KvError> {
        self.context.get_random_node_for_service(service, bucket)
    }

    /// bucket 监听器的当前状态。
    pub fn listener_state(&self, bucket: &str) -> Option<ListenerState> {
        self.listeners.get(bucket).map(|listener| listener.state())
    }

    /// 打开 bucket：启动配置监听并等待第一份配置被应用。
    pub async fn open_bucket(&self, name: &str, cancel: &CancellationToken) -> Result<(), KvError> {
        if self.context.is_closed() {
            return Err(KvError::NodeNotAvailable {
                service: ServiceType::KeyValue,
                bucket: Some(name.to_owned()),
            });
        }
        let mut applied = self.handler.subscribe(Some(name));
        let listener = self
            .listeners
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(ConfigListener::new(
                    name,
                    Arc::clone(&self.handler),
                    Arc::clone(&self.source),
                    self.options.streaming,
                ))
            })
            .value()
            .clone();
        listener.start();

        tokio::select! {
            _ = cancel.cancelled() => Err(KvError::Canceled),
            ready = applied.wait_for(Option::is_some) => match ready {
                Ok(_) => {
                    info!(bucket = name, "bucket opened");
                    Ok(())
                }
                Err(_) => Err(KvError::Canceled),
            },
        }
    }

    /// 关闭 bucket：停止监听并释放该 bucket 的全部节点。
    pub async fn close_bucket(&self, name: &str) {
        if let Some((_, listener)) = self.listeners.remove(name) {
            listener.stop().await;
        }
        let owned: Vec<SharedNode> = self
            .context
            .nodes()
            .owned_by(Some(name))
            .cloned()
            .collect();
        for node in owned {
            self.context.remove_node(node.key());
        }
        self.handler.forget(Some(name));
    }

    /// 停止全部监听器并释放全部节点。
    ///
    /// 先取消上下文令牌，正在进行的节点创建随之中止，监听器无需等待调和完成即可退出。
    pub async fn close(&self) {
        self.context.shutdown_token().cancel();
        let listeners: Vec<Arc<ConfigListener>> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.listeners.clear();
        join_all(listeners.iter().map(|listener| listener.stop())).await;
        self.context.close().await;
    }
}

async fn connect_seed(
    factory: &dyn ClusterNodeFactory,
    seed: &HostEndpoint,
    options: &ClusterOptions,
    cancel: &CancellationToken,
) -> Result<SharedNode, KvError> {
    let attempt = factory.create_and_connect(seed.clone(), BucketType::Couchbase, None, None, cancel);
    match tokio::time::timeout(options.connect_timeout(), attempt).await {
        Ok(result) => result,
        Err(_) => Err(KvError::ConnectFailed {
            endpoint: seed.clone(),
            detail: format!("connect timed out after {:?}", options.connect_timeout()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{
        sasl::MechanismType,
        test_stubs::{MockConfigSource, MockConnector, reject_auth},
    };

    fn options(seeds: &[&str]) -> ClusterOptions {
        seeds
            .iter()
            .fold(ClusterOptions::default(), |options, seed| {
                options.with_seed_node(HostEndpoint::new(*seed, 11210))
            })
            .with_credentials("app", "pw")
            .with_sasl_mechanism(MechanismType::Plain)
            .with_pool(1, 2)
    }

    #[tokio::test]
    async fn connects_when_any_seed_is_reachable() {
        let connector = Arc::new(MockConnector::accepting());
        connector.refuse(HostEndpoint::new("10.0.0.1", 11210));
        let cluster = Cluster::connect(
            options(&["10.0.0.1", "10.0.0.2"]),
            Arc::clone(&connector) as _,
            Arc::new(MockConfigSource::new()),
            &CancellationToken::new(),
        )
        .await
        .expect("one seed reachable");
        assert_eq!(cluster.context().len(), 1);
        assert!(cluster.service_uris().random_management_uri().is_ok());
        cluster.close().await;
        assert!(cluster.get_random_node_for_service(ServiceType::KeyValue, None).is_err());
    }

    #[tokio::test]
    async fn rejected_credentials_fail_connect() {
        let connector = Arc::new(MockConnector::with_responder(reject_auth()));
        let err = Cluster::connect(
            options(&["10.0.0.1"]),
            Arc::clone(&connector) as _,
            Arc::new(MockConfigSource::new()),
            &CancellationToken::new(),
        )
        .await
        .expect_err("rejected");
        assert!(matches!(err, KvError::AuthenticationFailed { .. }));
        assert_eq!(connector.live_connections(), 0);
    }

    #[tokio::test]
    async fn missing_seeds_are_invalid() {
        let err = Cluster::connect(
            options(&[]),
            Arc::new(MockConnector::accepting()),
            Arc::new(MockConfigSource::new()),
            &CancellationToken::new(),
        )
        .await
        .expect_err("no seeds");
        assert_eq!(err.code(), "kvmesh.config.invalid");
    }

    #[tokio::test(start_paused = true)]
    async fn open_bucket_waits_for_first_config() {
        let connector = Arc::new(MockConnector::accepting());
        let source = Arc::new(MockConfigSource::new());
        let session = source.session();
        let cluster = Cluster::connect(
            options(&["10.0.0.1"]),
            Arc::clone(&connector) as _,
            source.clone(),
            &CancellationToken::new(),
        )
        .await
        .expect("connected");

        session
            .unbounded_send(Ok(Bytes::from_static(
                b"{\"rev\":7,\"name\":\"travel\",\"nodesExt\":[{\"hostname\":\"10.0.0.1\",\"services\":{\"kv\":11210,\"mgmt\":8091,\"capi\":8092}}]}\n\n\n\n",
            )))
            .expect("send");
        cluster
            .open_bucket("travel", &CancellationToken::new())
            .await
            .expect("opened");
        assert_eq!(cluster.listener_state("travel"), Some(ListenerState::Streaming));
        assert_eq!(
            cluster.service_uris().random_views_uri("travel").expect("views"),
            "http://10.0.0.1:8092/"
        );

        cluster.close_bucket("travel").await;
        assert!(cluster.listener_state("travel").is_none());
        assert_eq!(cluster.context().nodes().owned_by(Some("travel")).count(), 0);
        cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_interrupts_node_creation_in_flight() {
        let connector = Arc::new(MockConnector::accepting());
        let source = Arc::new(MockConfigSource::new());
        let session = source.session();
        let cluster = Cluster::connect(
            options(&["10.0.0.1"]),
            Arc::clone(&connector) as _,
            source.clone(),
            &CancellationToken::new(),
        )
        .await
        .expect("connected");
        connector.set_connect_latency(Duration::from_secs(3600));
        let attempts = connector.attempts();

        session
            .unbounded_send(Ok(Bytes::from_static(
                b"{\"rev\":1,\"name\":\"travel\",\"nodesExt\":[{\"hostname\":\"10.0.0.1\",\"services\":{\"kv\":11210,\"mgmt\":8091}},{\"hostname\":\"10.0.0.2\",\"services\":{\"kv\":11210,\"mgmt\":8091}}]}\n\n\n\n",
            )))
            .expect("send");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = cluster.open_bucket("travel", &cancel).await.expect_err("still reconciling");
        assert_eq!(err, KvError::Canceled);
        assert!(connector.attempts() > attempts);

        tokio::time::timeout(Duration::from_secs(1), cluster.close())
            .await
            .expect("close does not wait for the reconcile");
        assert!(cluster.listener_state("travel").is_none());
        assert_eq!(cluster.context().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_bucket_honours_cancellation() {
        let connector = Arc::new(MockConnector::accepting());
        let cluster = Cluster::connect(
            options(&["10.0.0.1"]),
            Arc::clone(&connector) as _,
            Arc::new(MockConfigSource::new()),
            &CancellationToken::new(),
        )
        .await
        .expect("connected");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let err = cluster.open_bucket("ghost", &cancel).await.expect_err("canceled");
        assert_eq!(err, KvError::Canceled);
        cluster.close().await;
    }
}
