//! # listener：流式拓扑配置监听
//!
//! ## 核心意图（Why）
//! - 服务端在拓扑变化时通过长连接推送新的 bucket 配置；监听器维持这条订阅，
//!   并在断线、节点下线、分帧错误后自动切换到其他节点重新订阅；
//! - 状态机显式化（[`ListenerState`]），由唯一的驱动任务推进，外部通过 `watch` 通道观察。
//!
//! ## 行为契约（What）
//! - `Disconnected → Connecting`：启动后向一个提供管理服务的节点发起
//!   `GET /pools/default/bs/{bucket}`；
//! - `Connecting/Reconnecting → Streaming`：收到第一份格式正确的配置；
//! - 格式错误的文档被丢弃并记录日志，状态不变；
//! - `Streaming → Reconnecting`：传输错误、流结束、超长帧、承载节点被移出注册表；
//! - `Reconnecting`：轮询下一个节点，指数退避加抖动；注册表为空时等待节点出现；
//! - `Stopped`：终态，由 [`ConfigListener::stop`] 或丢弃监听器触发；
//! - 配置按到达顺序逐个 await 交给 [`ConfigHandler`]，不并行、不重排。
//!
//! ## 风险提示（Trade-offs）
//! - 节点退役只在等待下一个数据块时检查；正在处理的配置先处理完，再切换节点，
//!   避免在调和中途丢弃其 future。

mod backoff;
mod frame;

use std::{fmt, ops::ControlFlow, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config_handler::ConfigHandler,
    endpoint::HostEndpoint,
    error::KvError,
    node::SharedNode,
    options::StreamingOptions,
    service::ServiceType,
    topology::BucketConfig,
};

pub use backoff::Backoff;
pub use frame::{FRAME_DELIMITER, FrameDecoder};

/// 监听器状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

impl ListenerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerState::Disconnected => "disconnected",
            ListenerState::Connecting => "connecting",
            ListenerState::Streaming => "streaming",
            ListenerState::Reconnecting => "reconnecting",
            ListenerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次流式订阅请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    /// 管理服务端点。
    pub endpoint: HostEndpoint,
    pub bucket: Arc<str>,
}

impl StreamRequest {
    pub fn new(endpoint: HostEndpoint, bucket: Arc<str>) -> Self {
        Self { endpoint, bucket }
    }

    /// bucket 名作为单个路径段编码，空格、`%` 与 `/` 等字符不会破坏路径结构。
    pub fn uri(&self) -> String {
        format!(
            "http://{}/pools/default/bs/{}",
            self.endpoint,
            urlencoding::encode(&self.bucket)
        )
    }
}

/// 原始字节块流。
pub type ConfigStream = BoxStream<'static, Result<Bytes, KvError>>;

/// 配置推送源。
///
/// 实现方只负责建立长连接并交出响应体字节流；分帧与解析由监听器完成。
/// 认证失败应返回 [`KvError::AuthenticationFailed`]。
#[async_trait]
pub trait ConfigStreamSource: Send + Sync + fmt::Debug + 'static {
    async fn open(&self, request: &StreamRequest, cancel: &CancellationToken) -> Result<ConfigStream, KvError>;
}

pub type SharedConfigSource = Arc<dyn ConfigStreamSource>;

/// 单个 bucket 的配置监听器。
pub struct ConfigListener {
    inner: Arc<ListenerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ConfigListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigListener")
            .field("bucket", &self.inner.bucket)
            .field("state", &self.state())
            .finish()
    }
}

struct ListenerInner {
    bucket: Arc<str>,
    handler: Arc<ConfigHandler>,
    source: SharedConfigSource,
    options: StreamingOptions,
    state: watch::Sender<ListenerState>,
    cancel: CancellationToken,
}

/// 一次订阅结束的原因。
enum Disconnect {
    Failed(KvError),
    Closed,
    Retired,
    Stopped,
}

impl ConfigListener {
    pub fn new(
        bucket: &str,
        handler: Arc<ConfigHandler>,
        source: SharedConfigSource,
        options: StreamingOptions,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Self {
            inner: Arc::new(ListenerInner {
                bucket: Arc::from(bucket),
                handler,
                source,
                options,
                state,
                cancel: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    pub fn state(&self) -> ListenerState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.inner.state.subscribe()
    }

    /// 启动驱动任务；重复调用或停止后调用无效果。
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(inner.run()));
    }

    /// 停止监听并等待驱动任务退出。
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(bucket = %self.inner.bucket, error = %err, "config listener task failed");
            }
        }
        self.inner.transition(ListenerState::Stopped);
    }

    /// 等待监听器进入指定状态。
    pub async fn wait_for_state(
        &self,
        target: ListenerState,
        cancel: &CancellationToken,
    ) -> Result<(), KvError> {
        let mut state = self.subscribe_state();
        tokio::select! {
            _ = cancel.cancelled() => Err(KvError::Canceled),
            reached = state.wait_for(|state| *state == target || *state == ListenerState::Stopped) => {
                match reached {
                    Ok(state) if *state == target => Ok(()),
                    _ => Err(KvError::Canceled),
                }
            }
        }
    }
}

impl Drop for ConfigListener {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl ListenerInner {
    async fn run(self: Arc<Self>) {
        let seed = rand::random::<u64>();
        let mut backoff = Backoff::new(self.options.initial_backoff(), self.options.max_backoff(), seed);
        let mut cursor = 0usize;
        self.transition(ListenerState::Connecting);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(node) = self.next_node(&mut cursor) else {
                debug!(bucket = %self.bucket, "no management node available, waiting for topology");
                if self.handler.context().wait_for_nodes(&self.cancel).await.is_err() {
                    break;
                }
                continue;
            };

            let outcome = self.stream_from(&node, &mut backoff).await;
            let reason = match outcome {
                Disconnect::Stopped => break,
                Disconnect::Failed(err) => {
                    warn!(
                        bucket = %self.bucket,
                        endpoint = %node.endpoint(),
                        code = err.code(),
                        error = %err,
                        "config stream failed"
                    );
                    "failed"
                }
                Disconnect::Closed => "closed",
                Disconnect::Retired => "node retired",
            };
            self.transition(ListenerState::Reconnecting);

            let delay = backoff.next_delay();
            debug!(bucket = %self.bucket, reason, delay = ?delay, "reconnecting config stream");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.transition(ListenerState::Stopped);
    }

    /// 轮询选择下一个提供管理服务且未退役的节点。
    fn next_node(&self, cursor: &mut usize) -> Option<SharedNode> {
        let registry = self.handler.context().nodes();
        let mut candidates: Vec<&SharedNode> = registry
            .iter()
            .filter(|node| node.has_service(ServiceType::Management) && !node.is_retired())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.key().cmp(b.key()));
        let node = Arc::clone(candidates[*cursor % candidates.len()]);
        *cursor = cursor.wrapping_add(1);
        Some(node)
    }

    async fn stream_from(&self, node: &SharedNode, backoff: &mut Backoff) -> Disconnect {
        let Some(endpoint) = node.adapter().endpoint(ServiceType::Management) else {
            return Disconnect::Retired;
        };
        let request = StreamRequest::new(endpoint, Arc::clone(&self.bucket));
        debug!(bucket = %self.bucket, uri = %request.uri(), "opening config stream");

        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Disconnect::Stopped,
            _ = node.retired() => return Disconnect::Retired,
            opened = self.source.open(&request, &self.cancel) => match opened {
                Ok(stream) => stream,
                Err(KvError::Canceled) => return Disconnect::Stopped,
                Err(err) => return Disconnect::Failed(err),
            },
        };

        let mut decoder = FrameDecoder::new(self.options.max_frame_bytes);
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Disconnect::Stopped,
                _ = node.retired() => return Disconnect::Retired,
                chunk = stream.next() => chunk,
            };
            let frames = match chunk {
                None => return Disconnect::Closed,
                Some(Err(KvError::Canceled)) => return Disconnect::Stopped,
                Some(Err(err)) => return Disconnect::Failed(err),
                Some(Ok(bytes)) => match decoder.push(&bytes) {
                    Ok(frames) => frames,
                    Err(err) => return Disconnect::Failed(err),
                },
            };
            for frame in frames {
                if self.deliver(&frame, request.endpoint.host(), backoff).await.is_break() {
                    return Disconnect::Stopped;
                }
            }
        }
    }

    /// 解析并发布一帧；监听器在发布期间被停止时返回 `Break`，该快照被放弃且不记录版本。
    async fn deliver(&self, frame: &[u8], origin_host: &str, backoff: &mut Backoff) -> ControlFlow<()> {
        let config = match BucketConfig::from_json(frame, Some(origin_host)) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    bucket = %self.bucket,
                    bytes = frame.len(),
                    error = %err,
                    "dropping malformed config"
                );
                return ControlFlow::Continue(());
            }
        };
        if config.name().is_some_and(|name| name != &*self.bucket) {
            warn!(
                bucket = %self.bucket,
                received = config.name().unwrap_or(""),
                "dropping config for another bucket"
            );
            return ControlFlow::Continue(());
        }
        if self.transition(ListenerState::Streaming) {
            backoff.reset();
        }
        let rev = config.version();
        debug!(bucket = %self.bucket, rev = %rev, "config received");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(bucket = %self.bucket, rev = %rev, "listener stopped mid-apply, config abandoned");
                ControlFlow::Break(())
            }
            _ = self.handler.publish(config) => ControlFlow::Continue(()),
        }
    }

    /// 切换状态；返回状态是否发生变化。`Stopped` 之后不再变化。
    fn transition(&self, next: ListenerState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if *state == next || *state == ListenerState::Stopped {
                return false;
            }
            previous = Some(*state);
            *state = next;
            true
        });
        if let Some(previous) = previous {
            info!(bucket = %self.bucket, from = %previous, to = %next, "config listener state changed");
        }
        changed
    }
}
