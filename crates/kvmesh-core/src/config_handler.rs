//! # config_handler：按 bucket 去重并串行化拓扑快照
//!
//! ## 核心意图（Why）
//! - 同一快照可能经由多条路径到达（流式推送、重连后的首帧、引导时的主动拉取），
//!   处理器按版本去重，只把更新的快照交给调和；
//! - 调和需要建连，耗时不可忽略；同一 bucket 的调和串行执行，不同 bucket 互不阻塞。
//!
//! ## 行为契约（What）
//! - 版本不高于已应用版本的快照被忽略，注册表不变；
//! - 同一 bucket 的 [`ConfigHandler::publish`] 在异步互斥锁下执行，调用方按到达顺序 await 即可得到
//!   严格有序的应用；
//! - 每个 bucket 的最新已应用快照通过 `watch` 通道广播。

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::{
    cluster_context::{ClusterContext, ReconcileReport},
    topology::{BucketConfig, ConfigVersion},
};

/// 快照处理结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// 快照已应用。
    Applied(ReconcileReport),
    /// 快照不比已应用版本新。
    Ignored { applied: ConfigVersion },
}

type BucketKey = Option<Arc<str>>;

fn key(bucket: Option<&str>) -> BucketKey {
    bucket.map(Arc::from)
}

struct BucketSlot {
    applied: Mutex<Option<ConfigVersion>>,
    latest: watch::Sender<Option<Arc<BucketConfig>>>,
}

impl BucketSlot {
    fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            applied: Mutex::new(None),
            latest,
        }
    }
}

/// 拓扑快照处理器。
pub struct ConfigHandler {
    context: Arc<ClusterContext>,
    buckets: DashMap<BucketKey, Arc<BucketSlot>>,
}

impl fmt::Debug for ConfigHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigHandler")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl ConfigHandler {
    pub fn new(context: Arc<ClusterContext>) -> Self {
        Self {
            context,
            buckets: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    /// 处理一份快照。
    pub async fn publish(&self, config: BucketConfig) -> PublishOutcome {
        let slot = self.slot(config.name_arc().cloned());
        let mut applied = slot.applied.lock().await;
        if let Some(current) = *applied {
            if config.version() <= current {
                debug!(
                    bucket = config.name().unwrap_or(""),
                    rev = %config.version(),
                    applied = %current,
                    "ignoring stale config"
                );
                return PublishOutcome::Ignored { applied: current };
            }
        }

        let report = self.context.apply(&config).await;
        *applied = Some(config.version());
        slot.latest.send_replace(Some(Arc::new(config)));
        PublishOutcome::Applied(report)
    }

    /// 指定 bucket 最近一次应用的版本。
    pub async fn applied_version(&self, bucket: Option<&str>) -> Option<ConfigVersion> {
        let slot = self.buckets.get(&key(bucket))?.value().clone();
        let applied = *slot.applied.lock().await;
        applied
    }

    /// 订阅指定 bucket 的最新已应用快照。
    pub fn subscribe(&self, bucket: Option<&str>) -> watch::Receiver<Option<Arc<BucketConfig>>> {
        self.slot(key(bucket)).latest.subscribe()
    }

    /// 当前已应用的快照。
    pub fn latest(&self, bucket: Option<&str>) -> Option<Arc<BucketConfig>> {
        let slot = self.buckets.get(&key(bucket))?.value().clone();
        let latest = slot.latest.borrow().clone();
        latest
    }

    /// 忘记 bucket 的去重状态；之后同名 bucket 的任何快照都会被应用。
    pub fn forget(&self, bucket: Option<&str>) {
        self.buckets.remove(&key(bucket));
    }

    fn slot(&self, key: BucketKey) -> Arc<BucketSlot> {
        self.buckets
            .entry(key)
            .or_insert_with(|| Arc::new(BucketSlot::new()))
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node_factory::DefaultClusterNodeFactory,
        options::ClusterOptions,
        sasl::MechanismType,
        service::ServiceType,
        test_stubs::MockConnector,
        topology::NodeAdapter,
    };

    fn handler(connector: &Arc<MockConnector>) -> ConfigHandler {
        let options = ClusterOptions::default()
            .with_credentials("app", "pw")
            .with_sasl_mechanism(MechanismType::Plain)
            .with_pool(1, 1);
        let factory = DefaultClusterNodeFactory::new(&options, Arc::clone(connector) as _);
        ConfigHandler::new(Arc::new(ClusterContext::new(Arc::new(factory))))
    }

    fn snapshot(bucket: &str, version: ConfigVersion, hosts: &[&str]) -> BucketConfig {
        let nodes = hosts
            .iter()
            .map(|host| NodeAdapter::new(host).with_service(ServiceType::KeyValue, 11210))
            .collect();
        BucketConfig::new(Some(bucket), version, nodes)
    }

    #[tokio::test]
    async fn stale_and_duplicate_versions_are_ignored() {
        let connector = Arc::new(MockConnector::accepting());
        let handler = handler(&connector);

        let outcome = handler
            .publish(snapshot("default", ConfigVersion::from_rev(5), &["10.0.0.1"]))
            .await;
        assert!(matches!(outcome, PublishOutcome::Applied(_)));

        for rev in [5, 4] {
            let outcome = handler
                .publish(snapshot("default", ConfigVersion::from_rev(rev), &["10.0.0.2"]))
                .await;
            assert_eq!(
                outcome,
                PublishOutcome::Ignored {
                    applied: ConfigVersion::from_rev(5)
                }
            );
        }
        assert_eq!(handler.context().len(), 1);
        assert_eq!(
            handler.applied_version(Some("default")).await,
            Some(ConfigVersion::from_rev(5))
        );
    }

    #[tokio::test]
    async fn newer_epoch_wins_over_higher_rev() {
        let connector = Arc::new(MockConnector::accepting());
        let handler = handler(&connector);
        handler
            .publish(snapshot("default", ConfigVersion::new(1, 900), &["10.0.0.1"]))
            .await;
        let outcome = handler
            .publish(snapshot("default", ConfigVersion::new(2, 3), &["10.0.0.2"]))
            .await;
        assert!(matches!(outcome, PublishOutcome::Applied(_)));
        assert_eq!(
            handler.latest(Some("default")).map(|config| config.version()),
            Some(ConfigVersion::new(2, 3))
        );
    }

    #[tokio::test]
    async fn buckets_track_versions_independently() {
        let connector = Arc::new(MockConnector::accepting());
        let handler = handler(&connector);
        let mut updates = handler.subscribe(Some("travel"));
        handler
            .publish(snapshot("default", ConfigVersion::from_rev(10), &["10.0.0.1"]))
            .await;
        let outcome = handler
            .publish(snapshot("travel", ConfigVersion::from_rev(1), &["10.0.0.1"]))
            .await;
        assert!(matches!(outcome, PublishOutcome::Applied(_)));
        updates.changed().await.expect("travel update");
        assert_eq!(
            updates.borrow().as_ref().map(|config| config.rev()),
            Some(1)
        );
        assert_eq!(handler.context().len(), 2);
    }
}
