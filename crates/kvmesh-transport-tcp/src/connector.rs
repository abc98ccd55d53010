use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use kvmesh_core::{ClusterOptions, Connector, HostEndpoint, KvError, SharedConnection};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    connection::{TcpConnection, TcpConnectionOptions},
    error::{CONFIGURE, CONNECT, map_io_error},
    util::run_with_context,
};

/// TCP 套接字的可调参数。
///
/// - `nodelay` 默认开启：引导命令都是小包一问一答，Nagle 只会增加往返延迟；
/// - `keepalive` 为 `None` 时沿用系统默认；
/// - `linger` 对应 `SO_LINGER`，`None` 表示关闭。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpSocketConfig {
    nodelay: bool,
    keepalive: Option<Duration>,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            keepalive: None,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置 TCP keepalive 的空闲探测时间。
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let sock = SockRef::from(stream);
        if let Some(idle) = self.keepalive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        sock.set_linger(self.linger)
    }
}

/// 以 Tokio `TcpStream` 建立节点连接的 [`Connector`]。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 核心只依赖 `Connector` 抽象；本类型把 DNS 解析、建连超时与套接字调优收拢到一处。
///
/// ## 契约 (What)
/// - 建连超过 `connect_timeout` 或套接字配置失败均返回 [`KvError::ConnectFailed`]；
/// - 取消令牌触发时返回 [`KvError::Canceled`]；
/// - 连接编号在同一个 connector 内单调递增，仅用于日志关联。
#[derive(Debug)]
pub struct TcpConnector {
    socket: TcpSocketConfig,
    connection: TcpConnectionOptions,
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            socket: TcpSocketConfig::new(),
            connection: TcpConnectionOptions::default(),
            connect_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// 从集群配置读取建连超时。
    pub fn from_options(options: &ClusterOptions) -> Self {
        Self::new(options.connect_timeout())
    }

    pub fn with_socket_config(mut self, socket: TcpSocketConfig) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_connection_options(mut self, connection: TcpConnectionOptions) -> Self {
        self.connection = connection;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// 建立连接并返回具体类型，便于调用方访问 [`TcpConnection::peer_addr`] 等扩展信息。
    pub async fn connect_tcp(
        &self,
        endpoint: &HostEndpoint,
        cancel: &CancellationToken,
    ) -> Result<TcpConnection, KvError> {
        let stream = run_with_context(
            cancel,
            Some(self.connect_timeout),
            CONNECT,
            endpoint,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await?;
        self.socket
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, endpoint, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONNECT, endpoint, err))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, endpoint = %endpoint, peer = %peer_addr, "tcp connected");
        Ok(TcpConnection::new(
            id,
            endpoint.clone(),
            stream,
            peer_addr,
            self.connection,
        ))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        endpoint: &HostEndpoint,
        cancel: &CancellationToken,
    ) -> Result<SharedConnection, KvError> {
        let connection = self.connect_tcp(endpoint, cancel).await?;
        Ok(Arc::new(connection))
    }
}
