use std::{
    fmt, io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use kvmesh_core::{
    Connection, HostEndpoint, KvError,
    connection::ConnectionId,
    protocol::{Request, Response},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex as AsyncMutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    codec::{decode_response, encode_request},
    error::{READ, WRITE, map_io_error},
    util::run_with_context,
};

/// 单条连接的读写参数。
#[derive(Clone, Copy, Debug)]
pub struct TcpConnectionOptions {
    /// 单帧体的上限，超出即视为协议错误并废弃连接。
    pub max_body_bytes: usize,
    /// 单次读或写的超时；`None` 表示只受调用方取消约束。
    pub io_timeout: Option<Duration>,
}

impl Default for TcpConnectionOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: 20 * 1024 * 1024,
            io_timeout: None,
        }
    }
}

#[derive(Debug)]
struct Io {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

/// 到节点 KV 端口的一条二进制协议连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 引导阶段是严格的一问一答，连接池也保证同一时刻只有一个持有者；
///   以 `tokio::sync::Mutex` 串行化整段“写请求 + 读响应”即可满足需求。
///
/// ## 契约 (What)
/// - 每次 `send` 分配新的 opaque，读取直到遇到 opaque 相同的响应，之前的帧被丢弃；
/// - 交换过程中的任何失败（含中途取消）都会把连接标记为损坏：流可能已失去帧边界；
/// - `close` 之后的 `send` 立即失败；正在进行的交换被中断。
///
/// ## 风险 (Trade-offs)
/// - 不支持多路复用；若需要流水线，应改为独立的读写半部加 opaque 路由表。
pub struct TcpConnection {
    id: ConnectionId,
    endpoint: HostEndpoint,
    peer_addr: SocketAddr,
    io: AsyncMutex<Io>,
    next_opaque: AtomicU32,
    broken: AtomicBool,
    closed: CancellationToken,
    options: TcpConnectionOptions,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("peer_addr", &self.peer_addr)
            .field("broken", &self.is_broken())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl TcpConnection {
    pub(crate) fn new(
        id: ConnectionId,
        endpoint: HostEndpoint,
        stream: TcpStream,
        peer_addr: SocketAddr,
        options: TcpConnectionOptions,
    ) -> Self {
        Self {
            id,
            endpoint,
            peer_addr,
            io: AsyncMutex::new(Io {
                stream,
                read_buf: BytesMut::with_capacity(4096),
                write_buf: BytesMut::with_capacity(256),
            }),
            next_opaque: AtomicU32::new(1),
            broken: AtomicBool::new(false),
            closed: CancellationToken::new(),
            options,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn unusable(&self, detail: &str) -> KvError {
        KvError::Transport {
            endpoint: self.endpoint.clone(),
            detail: detail.to_owned(),
        }
    }

    async fn exchange(
        &self,
        io: &mut Io,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Response, KvError> {
        let Io {
            stream,
            read_buf,
            write_buf,
        } = io;
        let timeout = self.options.io_timeout;

        write_buf.clear();
        encode_request(request, write_buf);
        run_with_context(
            cancel,
            timeout,
            WRITE,
            &self.endpoint,
            stream.write_all(&write_buf[..]),
        )
        .await?;

        loop {
            if let Some(response) = decode_response(&mut *read_buf, self.options.max_body_bytes)? {
                if response.opaque == request.opaque {
                    return Ok(response);
                }
                trace!(
                    connection = self.id,
                    expected = request.opaque,
                    found = response.opaque,
                    "discarding unmatched frame"
                );
                continue;
            }
            let read = run_with_context(
                cancel,
                timeout,
                READ,
                &self.endpoint,
                stream.read_buf(&mut *read_buf),
            )
            .await?;
            if read == 0 {
                return Err(map_io_error(
                    READ,
                    &self.endpoint,
                    io::Error::from(io::ErrorKind::UnexpectedEof),
                ));
            }
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response, KvError> {
        if self.closed.is_cancelled() {
            return Err(self.unusable("connection closed"));
        }
        if self.is_broken() {
            return Err(self.unusable("connection marked broken"));
        }
        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        let request = request.with_opaque(opaque);

        let mut io = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KvError::Canceled),
            _ = self.closed.cancelled() => return Err(self.unusable("connection closed")),
            io = self.io.lock() => io,
        };
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.unusable("connection closed")),
            result = self.exchange(&mut io, &request, cancel) => result,
        };
        if let Err(err) = &result {
            debug!(
                connection = self.id,
                endpoint = %self.endpoint,
                opcode = %request.opcode,
                code = err.code(),
                "exchange failed, connection discarded"
            );
            self.mark_broken();
        }
        result
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.mark_broken();
        let mut io = self.io.lock().await;
        if let Err(err) = io.stream.shutdown().await {
            trace!(connection = self.id, error = %err, "shutdown after close failed");
        }
        debug!(connection = self.id, endpoint = %self.endpoint, "connection closed");
    }
}
