//! # topology：拓扑快照数据模型
//!
//! ## 核心意图（Why）
//! - 把服务端推送的配置文档解析为不可变的 [`BucketConfig`] 值，供调和算法比较；
//! - 以 [`NodeIdentity`] 表达“节点由哪些 (服务, 端点) 对组成”，替代单一主键比较，
//!   使“每节点单服务”的拓扑不会被朴素的 host:port 比较误删。
//!
//! ## 行为契约（What）
//! - 同一 bucket 的两个快照按 [`ConfigVersion`] 比较，`revEpoch` 优先于 `rev`；
//! - [`NodeAdapter`] 总是包含管理服务端口（缺省 8091），因为每个节点都运行集群管理进程。

mod bucket_config;
mod identity;
mod node_adapter;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use bucket_config::BucketConfig;
pub use identity::NodeIdentity;
pub use node_adapter::NodeAdapter;

/// 快照版本：`(revEpoch, rev)` 字典序比较。
///
/// 服务端在故障切换后可能重置 `rev`，同时提升 `revEpoch`；只比较 `rev` 会把新纪元的
/// 快照误判为过期。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub epoch: u64,
    pub rev: u64,
}

impl ConfigVersion {
    pub const fn new(epoch: u64, rev: u64) -> Self {
        Self { epoch, rev }
    }

    pub const fn from_rev(rev: u64) -> Self {
        Self { epoch: 0, rev }
    }
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.rev)
    }
}

/// bucket 类型，决定连接池形态与是否需要选择 bucket。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketType {
    #[default]
    Couchbase,
    Ephemeral,
    Memcached,
}

impl BucketType {
    /// 由配置文档中的 `bucketType` / `nodeLocator` 推断。
    pub(crate) fn infer(bucket_type: Option<&str>, node_locator: Option<&str>) -> Self {
        match (bucket_type, node_locator) {
            (Some("ephemeral"), _) => BucketType::Ephemeral,
            (Some("memcached"), _) | (None, Some("ketama")) => BucketType::Memcached,
            _ => BucketType::Couchbase,
        }
    }
}

impl fmt::Display for BucketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BucketType::Couchbase => "couchbase",
            BucketType::Ephemeral => "ephemeral",
            BucketType::Memcached => "memcached",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_dominates_rev() {
        assert!(ConfigVersion::new(2, 1) > ConfigVersion::new(1, 9_000));
        assert!(ConfigVersion::from_rev(10) > ConfigVersion::from_rev(9));
        assert_eq!(ConfigVersion::new(1, 5).to_string(), "1:5");
    }

    #[test]
    fn bucket_type_inference() {
        assert_eq!(BucketType::infer(None, Some("vbucket")), BucketType::Couchbase);
        assert_eq!(BucketType::infer(None, Some("ketama")), BucketType::Memcached);
        assert_eq!(BucketType::infer(Some("ephemeral"), Some("vbucket")), BucketType::Ephemeral);
    }
}
