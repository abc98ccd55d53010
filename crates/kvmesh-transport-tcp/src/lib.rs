//! # kvmesh-transport-tcp
//!
//! ## 教案目的（Why）
//! - 为 `kvmesh-core` 的 [`Connector`](kvmesh_core::Connector) 契约提供基于 Tokio 的 TCP 实现，
//!   承载引导阶段的二进制协议命令（SASL、SELECT_BUCKET、NOOP）。
//!
//! ## 模块结构（How）
//! - `codec`：24 字节定长头的请求/响应编解码；
//! - `connection`：单条串行化连接，负责 opaque 匹配与损坏标记；
//! - `connector`：建连、超时与套接字调优；
//! - `error`/`util`：IO 错误映射与取消/超时包装。
//!
//! ## 使用契约（What）
//! - 典型用法：`DefaultClusterNodeFactory::new(&options, Arc::new(TcpConnector::from_options(&options)))`。

pub mod codec;
mod connection;
mod connector;
mod error;
mod util;

pub use codec::FrameError;
pub use connection::{TcpConnection, TcpConnectionOptions};
pub use connector::{TcpConnector, TcpSocketConfig};
