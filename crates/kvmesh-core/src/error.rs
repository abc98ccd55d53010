//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义客户端核心在“发现 → 建连 → 认证 → 调度 → 回收”全链路上可能暴露的错误语义；
//! - 每个错误携带稳定错误码与 [`ErrorCategory`]，调用方据此决定重试、重新选点或直接失败，
//!   不需要解析错误文本。
//!
//! ## 设计要求（What）
//! - 所有错误均派生 `thiserror::Error`，满足 `Send + Sync + 'static + Clone`，可跨任务广播；
//! - 错误码遵循 `kvmesh.<领域>.<语义>` 约定；
//! - `Canceled` 属于调用方主动中止，不计入熔断统计，也不应计入失败率指标。

use std::time::Duration;

use thiserror::Error;

use crate::{endpoint::HostEndpoint, service::ServiceType};

/// 客户端核心统一的结果别名。
pub type Result<T, E = KvError> = std::result::Result<T, E>;

/// 错误的处置分类，驱动上层的自动化重试策略。
///
/// - `Retryable(after)`：可在 `after` 之后重试，零时长表示可立即重新选点重试；
/// - `NonRetryable`：相同输入重试不会成功（如凭证被拒）；
/// - `Cancelled`：调用方主动取消，不属于故障。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    Retryable(Duration),
    NonRetryable,
    Cancelled,
}

/// 核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把传输失败、认证失败、拓扑暂不可用、熔断快速失败等语义区分开，
///   让调度层精确选择“换节点重试”“等待冷却”“放弃”三种动作；
/// - **契约 (What)**：
///   - 变体均可 `Clone`，便于在 `watch`/广播通道中复用；
///   - [`KvError::code`] 返回稳定错误码，[`KvError::category`] 返回处置分类；
///   - [`KvError::counts_as_circuit_failure`] 界定哪些失败计入节点熔断器。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum KvError {
    /// 建立到节点的传输连接失败（拒绝连接、超时、DNS 失败等）。
    #[error("connect to `{endpoint}` failed: {detail}")]
    ConnectFailed {
        endpoint: HostEndpoint,
        detail: String,
    },

    /// 凭证或认证协议被服务端拒绝，相同凭证不会重试。
    #[error("authentication against `{endpoint}` failed: {reason}")]
    AuthenticationFailed {
        endpoint: HostEndpoint,
        reason: String,
    },

    /// 当前没有任何已连接节点提供所需服务。
    #[error("no connected node offers service `{service}`{}", bucket_suffix(.bucket))]
    NodeNotAvailable {
        service: ServiceType,
        bucket: Option<String>,
    },

    /// 节点熔断器处于打开状态，请求被快速拒绝，未触达网络。
    #[error("circuit breaker for `{endpoint}` is open, retry after {retry_after:?}")]
    CircuitOpen {
        endpoint: HostEndpoint,
        retry_after: Duration,
    },

    /// 节点连接池已被关闭（节点已从拓扑中移除）。
    #[error("connection pool for `{endpoint}` is closed")]
    PoolClosed { endpoint: HostEndpoint },

    /// 调用方通过取消令牌中止了操作。
    #[error("operation canceled")]
    Canceled,

    /// 注册表中已存在相同身份的节点。
    #[error("node `{endpoint}` is already registered")]
    DuplicateNode { endpoint: HostEndpoint },

    /// 已建立连接上的读写失败，连接应被视为损坏。
    #[error("transport failure on `{endpoint}`: {detail}")]
    Transport {
        endpoint: HostEndpoint,
        detail: String,
    },

    /// 对端返回了不符合引导协议的帧或响应。
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// 拓扑快照无法解析。
    #[error("malformed topology snapshot: {detail}")]
    ConfigParse { detail: String },

    /// 启动参数非法。
    #[error("invalid configuration: {detail}")]
    InvalidConfiguration { detail: String },
}

fn bucket_suffix(bucket: &Option<String>) -> String {
    match bucket {
        Some(name) => format!(" for bucket `{name}`"),
        None => String::new(),
    }
}

const CONNECT_RETRY: Duration = Duration::from_millis(50);
const NODE_RETRY: Duration = Duration::from_millis(100);

impl KvError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            KvError::ConnectFailed { .. } => "kvmesh.node.connect_failed",
            KvError::AuthenticationFailed { .. } => "kvmesh.auth.failed",
            KvError::NodeNotAvailable { .. } => "kvmesh.cluster.node_not_available",
            KvError::CircuitOpen { .. } => "kvmesh.node.circuit_open",
            KvError::PoolClosed { .. } => "kvmesh.pool.closed",
            KvError::Canceled => "kvmesh.canceled",
            KvError::DuplicateNode { .. } => "kvmesh.cluster.duplicate_node",
            KvError::Transport { .. } => "kvmesh.connection.transport",
            KvError::Protocol { .. } => "kvmesh.connection.protocol",
            KvError::ConfigParse { .. } => "kvmesh.config.parse",
            KvError::InvalidConfiguration { .. } => "kvmesh.config.invalid",
        }
    }

    /// 返回处置分类。
    ///
    /// - `CircuitOpen` 的重试间隔取熔断器剩余冷却时间；
    /// - `PoolClosed` 可立即重试，但调用方必须重新选点。
    pub fn category(&self) -> ErrorCategory {
        match self {
            KvError::ConnectFailed { .. } | KvError::Transport { .. } => {
                ErrorCategory::Retryable(CONNECT_RETRY)
            }
            KvError::NodeNotAvailable { .. } => ErrorCategory::Retryable(NODE_RETRY),
            KvError::CircuitOpen { retry_after, .. } => ErrorCategory::Retryable(*retry_after),
            KvError::PoolClosed { .. } => ErrorCategory::Retryable(Duration::ZERO),
            KvError::Canceled => ErrorCategory::Cancelled,
            KvError::AuthenticationFailed { .. }
            | KvError::DuplicateNode { .. }
            | KvError::Protocol { .. }
            | KvError::ConfigParse { .. }
            | KvError::InvalidConfiguration { .. } => ErrorCategory::NonRetryable,
        }
    }

    /// 是否允许重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Retryable(_))
    }

    /// 该错误是否应计入节点熔断器的失败窗口。
    ///
    /// 只有体现“节点本身不健康”的失败才计数；取消、熔断自身与池关闭不计数。
    pub fn counts_as_circuit_failure(&self) -> bool {
        matches!(
            self,
            KvError::ConnectFailed { .. } | KvError::Transport { .. } | KvError::Protocol { .. }
        )
    }

    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        KvError::Protocol {
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_config(detail: impl Into<String>) -> Self {
        KvError::InvalidConfiguration {
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for KvError {
    fn from(err: serde_json::Error) -> Self {
        KvError::ConfigParse {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> HostEndpoint {
        HostEndpoint::new("10.0.0.1", 11210)
    }

    #[test]
    fn categories_follow_taxonomy() {
        let connect = KvError::ConnectFailed {
            endpoint: endpoint(),
            detail: "refused".into(),
        };
        assert!(connect.is_retryable());
        assert!(connect.counts_as_circuit_failure());

        let auth = KvError::AuthenticationFailed {
            endpoint: endpoint(),
            reason: "bad password".into(),
        };
        assert_eq!(auth.category(), ErrorCategory::NonRetryable);
        assert!(!auth.counts_as_circuit_failure());

        assert_eq!(KvError::Canceled.category(), ErrorCategory::Cancelled);
        assert!(!KvError::Canceled.counts_as_circuit_failure());
    }

    #[test]
    fn circuit_open_carries_remaining_cooldown() {
        let err = KvError::CircuitOpen {
            endpoint: endpoint(),
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(
            err.category(),
            ErrorCategory::Retryable(Duration::from_secs(3))
        );
        assert_eq!(err.code(), "kvmesh.node.circuit_open");
    }

    #[test]
    fn node_not_available_mentions_bucket() {
        let err = KvError::NodeNotAvailable {
            service: ServiceType::Views,
            bucket: Some("travel".into()),
        };
        assert_eq!(
            err.to_string(),
            "no connected node offers service `views` for bucket `travel`"
        );
    }
}
