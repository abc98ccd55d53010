//! # connection：传输连接边界
//!
//! ## 核心意图（Why）
//! - 核心层只依赖“可发送引导命令的连接”这一抽象，具体的 TCP/TLS 实现由传输 crate 提供；
//! - 测试以内存连接替换网络，确定性地复现握手失败、连接损坏等场景。
//!
//! ## 行为契约（What）
//! - [`Connection::send`] 需遵守取消令牌：令牌触发后尽快返回 [`KvError::Canceled`]；
//! - 连接一旦出现读写失败即视为损坏（[`Connection::is_broken`]），连接池不会再复用它；
//! - [`Connector::connect`] 只负责建立传输层连接，认证由 [`crate::bootstrap`] 完成。

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    endpoint::HostEndpoint,
    error::KvError,
    protocol::{Request, Response},
};

/// 连接唯一编号，仅用于日志关联。
pub type ConnectionId = u64;

/// 单条到节点的已建立连接。
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug + 'static {
    fn id(&self) -> ConnectionId;

    fn endpoint(&self) -> &HostEndpoint;

    /// 发送一个请求并等待对应响应。
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response, KvError>;

    fn is_broken(&self) -> bool;

    /// 标记连接已损坏；之后的 `send` 应直接失败。
    fn mark_broken(&self);

    /// 关闭连接；重复调用无副作用。
    async fn close(&self);
}

/// 共享连接句柄。
pub type SharedConnection = Arc<dyn Connection>;

/// 传输连接工厂。
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    async fn connect(
        &self,
        endpoint: &HostEndpoint,
        cancel: &CancellationToken,
    ) -> Result<SharedConnection, KvError>;
}

/// 共享连接工厂句柄。
pub type SharedConnector = Arc<dyn Connector>;
