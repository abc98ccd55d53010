//! # test_stubs：内存连接与连接工厂
//!
//! ## 设计定位（Why）
//! - 连接池、节点工厂、拓扑调和的测试都需要“可控的网络”：指定端点拒绝连接、握手被拒、
//!   连接在发送中途损坏；
//! - 统一出口避免各测试文件重复定义桩对象，接口调整时集中获得编译错误。
//!
//! ## 使用方式（How）
//! - [`MockConnector::accepting`] 返回对所有请求回复成功的连接工厂，配合 PLAIN 机制即可完成握手；
//! - 通过 [`MockConnector::set_responder`] 改写后续新连接的应答逻辑，
//!   通过 [`MockConnector::refuse`] 让指定端点拒绝连接；
//! - [`MockConnector::opened`] 返回所有已创建的连接，用于断言关闭与认证状态；
//! - [`MockConfigSource::session`] 预置一次流式订阅，返回的发送端推送字节块，丢弃即断线。
//!
//! ## 契约说明（What）
//! - 桩对象不访问网络，只在配置了延迟时挂起，且延迟始终可被取消令牌打断；
//! - 该模块随 crate 公开，仅供测试与示例使用。

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{Connection, ConnectionId, Connector, SharedConnection},
    endpoint::HostEndpoint,
    error::KvError,
    listener::{ConfigStream, ConfigStreamSource, StreamRequest},
    protocol::{Opcode, Request, Response, Status},
};

/// 请求到响应的应答函数。
pub type Responder = Arc<dyn Fn(&Request) -> Result<Response, KvError> + Send + Sync>;

/// 对所有请求回复成功。
pub fn accept_all() -> Responder {
    Arc::new(|request: &Request| Ok(Response::for_request(request, Status::Success)))
}

/// 拒绝 `SASL_AUTH`，其余请求回复成功。
pub fn reject_auth() -> Responder {
    Arc::new(|request: &Request| {
        if request.opcode == Opcode::SaslAuth {
            Ok(Response::for_request(request, Status::AuthError).with_body("Auth failure"))
        } else {
            Ok(Response::for_request(request, Status::Success))
        }
    })
}

/// 内存连接。
#[derive(Debug)]
pub struct MockConnection {
    id: ConnectionId,
    endpoint: HostEndpoint,
    responder: ResponderCell,
    latency: Duration,
    broken: AtomicBool,
    closed: AtomicBool,
    authenticated: AtomicBool,
    sent: Mutex<Vec<Request>>,
}

struct ResponderCell(Responder);

impl std::fmt::Debug for ResponderCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Responder")
    }
}

impl MockConnection {
    pub fn new<F>(id: ConnectionId, endpoint: HostEndpoint, responder: F) -> Self
    where
        F: Fn(&Request) -> Result<Response, KvError> + Send + Sync + 'static,
    {
        Self::with_responder(id, endpoint, Arc::new(responder))
    }

    pub fn with_responder(id: ConnectionId, endpoint: HostEndpoint, responder: Responder) -> Self {
        Self {
            id,
            endpoint,
            responder: ResponderCell(responder),
            latency: Duration::ZERO,
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// 每次发送前等待的时长。
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 是否有认证请求得到了成功应答。
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// 已发送请求的副本。
    pub fn sent(&self) -> Vec<Request> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response, KvError> {
        if cancel.is_cancelled() {
            return Err(KvError::Canceled);
        }
        if self.is_broken() || self.is_closed() {
            return Err(KvError::Transport {
                endpoint: self.endpoint.clone(),
                detail: "connection is no longer usable".into(),
            });
        }
        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(KvError::Canceled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }

        self.sent.lock().push(request.clone());
        let result = (self.responder.0)(&request);
        match &result {
            Ok(response)
                if response.status == Status::Success
                    && matches!(request.opcode, Opcode::SaslAuth | Opcode::SaslStep) =>
            {
                self.authenticated.store(true, Ordering::Release);
            }
            Err(KvError::Transport { .. }) => self.mark_broken(),
            _ => {}
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
        self.closed.store(true, Ordering::Release);
    }
}

/// 内存连接工厂。
#[derive(Debug)]
pub struct MockConnector {
    responder: Mutex<ResponderCell>,
    refused: Mutex<HashSet<HostEndpoint>>,
    opened: Mutex<Vec<Arc<MockConnection>>>,
    attempts: AtomicU64,
    next_id: AtomicU64,
    connect_latency: Mutex<Duration>,
    send_latency: Mutex<Duration>,
}

impl MockConnector {
    pub fn accepting() -> Self {
        Self::with_responder(accept_all())
    }

    pub fn with_responder(responder: Responder) -> Self {
        Self {
            responder: Mutex::new(ResponderCell(responder)),
            refused: Mutex::new(HashSet::new()),
            opened: Mutex::new(Vec::new()),
            attempts: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            connect_latency: Mutex::new(Duration::ZERO),
            send_latency: Mutex::new(Duration::ZERO),
        }
    }

    /// 替换之后新建连接的应答逻辑。
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = ResponderCell(responder);
    }

    /// 让指定端点拒绝连接。
    pub fn refuse(&self, endpoint: HostEndpoint) {
        self.refused.lock().insert(endpoint);
    }

    pub fn allow(&self, endpoint: &HostEndpoint) {
        self.refused.lock().remove(endpoint);
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        *self.connect_latency.lock() = latency;
    }

    /// 之后新建连接上每次发送的延迟。
    pub fn set_send_latency(&self, latency: Duration) {
        *self.send_latency.lock() = latency;
    }

    /// 全部已创建连接（按创建顺序）。
    pub fn opened(&self) -> Vec<Arc<MockConnection>> {
        self.opened.lock().clone()
    }

    /// 指定端点上已创建的连接。
    pub fn opened_to(&self, endpoint: &HostEndpoint) -> Vec<Arc<MockConnection>> {
        self.opened
            .lock()
            .iter()
            .filter(|connection| connection.endpoint() == endpoint)
            .cloned()
            .collect()
    }

    /// 仍未关闭的连接数。
    pub fn live_connections(&self) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|connection| !connection.is_closed())
            .count()
    }

    /// 建连尝试次数（含失败）。
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint: &HostEndpoint,
        cancel: &CancellationToken,
    ) -> Result<SharedConnection, KvError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let latency = *self.connect_latency.lock();
        if !latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(KvError::Canceled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(KvError::Canceled);
        }
        if self.refused.lock().contains(endpoint) {
            return Err(KvError::ConnectFailed {
                endpoint: endpoint.clone(),
                detail: "connection refused".into(),
            });
        }

        let responder = Arc::clone(&self.responder.lock().0);
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let send_latency = *self.send_latency.lock();
        let connection = Arc::new(
            MockConnection::with_responder(id, endpoint.clone(), responder).with_latency(send_latency),
        );
        self.opened.lock().push(Arc::clone(&connection));
        Ok(connection as SharedConnection)
    }
}

/// 可编排的配置推送源。
///
/// 每次 `open` 按顺序消费一个预置会话；没有会话时返回建连失败。
#[derive(Debug, Default)]
pub struct MockConfigSource {
    sessions: Mutex<VecDeque<UnboundedReceiver<Result<Bytes, KvError>>>>,
    failures: Mutex<VecDeque<KvError>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl MockConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一次订阅；发送端被丢弃时该订阅的流结束。
    pub fn session(&self) -> UnboundedSender<Result<Bytes, KvError>> {
        let (sender, receiver) = unbounded();
        self.sessions.lock().push_back(receiver);
        sender
    }

    /// 下一次 `open` 直接返回该错误，不消费会话。
    pub fn fail_next(&self, err: KvError) {
        self.failures.lock().push_back(err);
    }

    /// 全部订阅请求（含失败）。
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ConfigStreamSource for MockConfigSource {
    async fn open(&self, request: &StreamRequest, cancel: &CancellationToken) -> Result<ConfigStream, KvError> {
        if cancel.is_cancelled() {
            return Err(KvError::Canceled);
        }
        self.requests.lock().push(request.clone());
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        let session = self.sessions.lock().pop_front();
        match session {
            Some(receiver) => Ok(receiver.boxed()),
            None => Err(KvError::ConnectFailed {
                endpoint: request.endpoint.clone(),
                detail: "no scripted stream session".into(),
            }),
        }
    }
}
