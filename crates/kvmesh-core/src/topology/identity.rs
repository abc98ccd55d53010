use std::collections::BTreeSet;

use crate::{endpoint::HostEndpoint, service::ServiceType};

use super::NodeAdapter;

/// 节点身份：节点适配器可推导出的全部 (服务, 端点) 对。
///
/// # 教案式说明
/// - **意图 (Why)**：节点在不同快照间可能增减服务，只要仍有任一 (服务, 端点) 对重合，
///   就是同一个节点；
/// - **执行 (How)**：以有序集合存放身份对，比较时做集合求交；
/// - **契约 (What)**：空身份与任何身份都不相交。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeIdentity {
    pairs: BTreeSet<(ServiceType, HostEndpoint)>,
}

impl NodeIdentity {
    pub fn of(adapter: &NodeAdapter) -> Self {
        let pairs = adapter
            .services()
            .filter_map(|service| adapter.endpoint(service).map(|endpoint| (service, endpoint)))
            .collect();
        Self { pairs }
    }

    /// 两个身份是否共享任一 (服务, 端点) 对。
    pub fn intersects(&self, other: &NodeIdentity) -> bool {
        let (small, large) = if self.pairs.len() <= other.pairs.len() {
            (&self.pairs, &other.pairs)
        } else {
            (&other.pairs, &self.pairs)
        };
        small.iter().any(|pair| large.contains(pair))
    }

    pub fn services(&self) -> BTreeSet<ServiceType> {
        self.pairs.iter().map(|(service, _)| *service).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ServiceType, HostEndpoint)> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn same_host_different_services_share_management_pair() {
        let kv_only = NodeAdapter::new("10.143.194.102").with_service(ServiceType::KeyValue, 11210);
        let query_only = NodeAdapter::new("10.143.194.102").with_service(ServiceType::Query, 8093);
        assert!(kv_only.identity().intersects(&query_only.identity()));
    }

    #[test]
    fn different_hosts_never_intersect() {
        let a = NodeAdapter::new("10.143.194.101").with_service(ServiceType::KeyValue, 11210);
        let b = NodeAdapter::new("10.143.194.102").with_service(ServiceType::KeyValue, 11210);
        assert!(!a.identity().intersects(&b.identity()));
    }

    #[test]
    fn cluster_run_nodes_on_one_host_are_distinct() {
        let a = NodeAdapter::new("127.0.0.1")
            .with_service(ServiceType::Management, 9000)
            .with_service(ServiceType::KeyValue, 12000);
        let b = NodeAdapter::new("127.0.0.1")
            .with_service(ServiceType::Management, 9001)
            .with_service(ServiceType::KeyValue, 12002);
        assert!(!a.identity().intersects(&b.identity()));
    }

    fn adapter_strategy() -> impl Strategy<Value = NodeAdapter> {
        (
            0u8..4,
            proptest::collection::btree_map(0usize..ServiceType::ALL.len(), 8000u16..12000, 0..5),
        )
            .prop_map(|(host, services)| {
                services.into_iter().fold(
                    NodeAdapter::new(format!("10.0.0.{host}")),
                    |adapter, (idx, port)| adapter.with_service(ServiceType::ALL[idx], port),
                )
            })
    }

    proptest! {
        #[test]
        fn intersection_is_symmetric(a in adapter_strategy(), b in adapter_strategy()) {
            prop_assert_eq!(a.identity().intersects(&b.identity()), b.identity().intersects(&a.identity()));
        }

        #[test]
        fn identity_intersects_itself(a in adapter_strategy()) {
            prop_assert!(a.identity().intersects(&a.identity()));
        }
    }
}
