//! # pool：单节点连接池
//!
//! ## 核心意图（Why）
//! - 复用已认证连接，避免每个请求都重复建连与 SASL 握手；
//! - 以 `max_size` 约束单节点的连接上限，以 `min_size` 维持预热水位。
//!
//! ## 行为契约（What）
//! - [`ConnectionPool::lease`] 依次尝试：复用空闲连接 → 在上限内新建 → 等待归还或取消；
//! - 租约 [`PooledConnection`] 在 `Drop` 时自动归还；损坏的连接被关闭并在低于最小水位时异步补充；
//! - [`ConnectionPool::close`] 立即关闭空闲连接，已租出的连接在归还时关闭；之后的租用返回
//!   [`KvError::PoolClosed`]；
//! - 池中只会出现 [`ConnectionOpener`] 成功返回的连接，开启器负责握手的原子性。
//!
//! ## 实现策略（How）
//! - 池状态由 `parking_lot::Mutex` 保护，所有 `await` 都发生在锁外；
//! - 等待者先注册 `Notify` 再检查状态，避免“检查后、挂起前”发生的归还被错过；
//! - 关闭与补充通过池内部的取消令牌协调：关闭会中止尚未完成的补充。

use std::{
    collections::VecDeque,
    fmt,
    ops::Deref,
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, SharedConnection},
    endpoint::HostEndpoint,
    error::KvError,
    options::PoolOptions,
};

/// 为连接池打开新连接（建连 + 认证）。
#[async_trait]
pub trait ConnectionOpener: Send + Sync + fmt::Debug + 'static {
    fn endpoint(&self) -> &HostEndpoint;

    async fn open(&self, cancel: &CancellationToken) -> Result<SharedConnection, KvError>;
}

/// 连接池的瞬时计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    /// 含正在建立中的连接。
    pub total: usize,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<SharedConnection>,
    total: usize,
    leased: usize,
    closed: bool,
}

struct PoolInner {
    endpoint: HostEndpoint,
    opener: Arc<dyn ConnectionOpener>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    available: Notify,
    shutdown: CancellationToken,
}

/// 单节点连接池；克隆得到指向同一池的句柄。
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.endpoint)
            .field("options", &self.inner.options)
            .field("stats", &self.stats())
            .finish()
    }
}

enum LeaseStep {
    Ready(SharedConnection),
    Open,
    Wait,
}

impl ConnectionPool {
    pub fn new(opener: Arc<dyn ConnectionOpener>, options: PoolOptions) -> Self {
        let endpoint = opener.endpoint().clone();
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                opener,
                options,
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn endpoint(&self) -> &HostEndpoint {
        &self.inner.endpoint
    }

    pub fn options(&self) -> PoolOptions {
        self.inner.options
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            leased: state.leased,
            total: state.total,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// 并发打开连接直到最小水位。
    ///
    /// 任一连接失败时，本轮已打开的连接全部关闭。返回的错误按优先级挑选：
    /// 认证失败优先于其他错误，其次是首个非取消错误，全部为取消时返回 [`KvError::Canceled`]。
    /// 预热的 future 在中途被丢弃时，预占的名额同样会归还。
    pub async fn warm_up(&self, cancel: &CancellationToken) -> Result<(), KvError> {
        let wanted = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            let wanted = self.inner.options.min_size.saturating_sub(state.total);
            state.total += wanted;
            wanted
        };
        if wanted == 0 {
            return Ok(());
        }
        let reservation = SlotReservation::new(&self.inner, wanted);

        let results = join_all((0..wanted).map(|_| self.inner.opener.open(cancel))).await;
        let (opened, errors): (Vec<_>, Vec<_>) = results.into_iter().partition(Result::is_ok);
        let opened: Vec<SharedConnection> = opened.into_iter().filter_map(Result::ok).collect();
        let mut errors: Vec<KvError> = errors.into_iter().filter_map(Result::err).collect();

        if errors.is_empty() {
            reservation.fulfill();
            let rejected = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    state.total -= opened.len();
                    Some(opened)
                } else {
                    state.idle.extend(opened);
                    None
                }
            };
            if let Some(rejected) = rejected {
                close_all(rejected).await;
                return Err(self.closed_error());
            }
            self.inner.available.notify_waiters();
            debug!(endpoint = %self.inner.endpoint, connections = wanted, "connection pool warmed up");
            return Ok(());
        }

        drop(reservation);
        close_all(opened).await;
        let err = errors.swap_remove(primary_error(&errors));
        warn!(
            endpoint = %self.inner.endpoint,
            failed = errors.len() + 1,
            requested = wanted,
            code = err.code(),
            "connection pool warm-up failed, opened connections closed"
        );
        Err(err)
    }

    /// 租用一条连接。
    pub async fn lease(&self, cancel: &CancellationToken) -> Result<PooledConnection, KvError> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut stale = Vec::new();
            let step = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(self.closed_error());
                }
                let mut step = None;
                while let Some(connection) = state.idle.pop_front() {
                    if connection.is_broken() {
                        state.total -= 1;
                        stale.push(connection);
                        continue;
                    }
                    state.leased += 1;
                    step = Some(LeaseStep::Ready(connection));
                    break;
                }
                match step {
                    Some(step) => step,
                    None if state.total < self.inner.options.max_size => {
                        state.total += 1;
                        LeaseStep::Open
                    }
                    None => LeaseStep::Wait,
                }
            };
            if !stale.is_empty() {
                close_all(stale).await;
            }

            match step {
                LeaseStep::Ready(connection) => return Ok(self.guard(connection)),
                LeaseStep::Open => return self.open_for_lease(cancel).await,
                LeaseStep::Wait => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(KvError::Canceled),
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    async fn open_for_lease(&self, cancel: &CancellationToken) -> Result<PooledConnection, KvError> {
        // 名额已在锁内预占；开启期间 future 被丢弃（超时、select 落败或任务中止）时由守卫归还。
        let reservation = SlotReservation::new(&self.inner, 1);
        match self.inner.opener.open(cancel).await {
            Ok(connection) => {
                reservation.fulfill();
                let closed = {
                    let mut state = self.inner.state.lock();
                    if state.closed {
                        state.total -= 1;
                        true
                    } else {
                        state.leased += 1;
                        false
                    }
                };
                if closed {
                    connection.close().await;
                    return Err(self.closed_error());
                }
                Ok(self.guard(connection))
            }
            Err(err) => {
                drop(reservation);
                Err(err)
            }
        }
    }

    /// 关闭连接池。
    pub async fn close(&self) {
        let idle: Vec<SharedConnection> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total -= idle.len();
            idle
        };
        self.inner.shutdown.cancel();
        self.inner.available.notify_waiters();
        info!(
            endpoint = %self.inner.endpoint,
            idle = idle.len(),
            "connection pool closed"
        );
        close_all(idle).await;
    }

    fn guard(&self, connection: SharedConnection) -> PooledConnection {
        PooledConnection {
            connection,
            pool: Arc::clone(&self.inner),
        }
    }

    fn closed_error(&self) -> KvError {
        KvError::PoolClosed {
            endpoint: self.inner.endpoint.clone(),
        }
    }
}

impl PoolInner {
    fn release(self: &Arc<Self>, connection: SharedConnection) {
        let (discard, replenish) = {
            let mut state = self.state.lock();
            state.leased -= 1;
            if state.closed || connection.is_broken() {
                state.total -= 1;
                let replenish = !state.closed && state.total < self.options.min_size;
                (true, replenish)
            } else {
                state.idle.push_back(Arc::clone(&connection));
                (false, false)
            }
        };

        if !discard {
            self.available.notify_one();
            return;
        }
        debug!(
            endpoint = %self.endpoint,
            connection = connection.id(),
            "discarding returned connection"
        );
        spawn_detached(async move { connection.close().await });
        if replenish {
            self.replenish();
        } else {
            self.available.notify_one();
        }
    }

    /// 异步补充一条连接以维持最小水位。
    fn replenish(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.closed || state.total >= self.options.min_size {
                return;
            }
            state.total += 1;
        }
        let pool = Arc::clone(self);
        let spawned = spawn_detached(async move {
            let cancel = pool.shutdown.child_token();
            match pool.opener.open(&cancel).await {
                Ok(connection) => {
                    let accepted = {
                        let mut state = pool.state.lock();
                        if state.closed {
                            state.total -= 1;
                            false
                        } else {
                            state.idle.push_back(Arc::clone(&connection));
                            true
                        }
                    };
                    if !accepted {
                        connection.close().await;
                    }
                }
                Err(err) => {
                    pool.state.lock().total -= 1;
                    if !matches!(err, KvError::Canceled) {
                        warn!(endpoint = %pool.endpoint, error = %err, "failed to replenish connection");
                    }
                }
            }
            pool.available.notify_one();
        });
        if !spawned {
            self.state.lock().total -= 1;
        }
    }
}

/// 在当前 Tokio 运行时上派生任务；不在运行时内时返回 `false`。
pub(crate) fn spawn_detached<F>(future: F) -> bool
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => false,
    }
}

/// 预热失败时挑选对外报告的错误下标：认证失败 → 首个非取消错误 → 第一个错误。
fn primary_error(errors: &[KvError]) -> usize {
    errors
        .iter()
        .position(|err| matches!(err, KvError::AuthenticationFailed { .. }))
        .or_else(|| errors.iter().position(|err| !matches!(err, KvError::Canceled)))
        .unwrap_or(0)
}

/// 已在锁内计入 `total` 但尚未兑现为连接的名额。
///
/// 未调用 [`SlotReservation::fulfill`] 就被丢弃时，名额退回池中并唤醒等待者。
struct SlotReservation<'a> {
    pool: &'a PoolInner,
    slots: usize,
}

impl<'a> SlotReservation<'a> {
    fn new(pool: &'a PoolInner, slots: usize) -> Self {
        Self { pool, slots }
    }

    /// 名额已由打开的连接接管，之后的计数调整由调用方负责。
    fn fulfill(mut self) {
        self.slots = 0;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.slots == 0 {
            return;
        }
        self.pool.state.lock().total -= self.slots;
        // 释放出的名额交给等待者。
        if self.slots == 1 {
            self.pool.available.notify_one();
        } else {
            self.pool.available.notify_waiters();
        }
    }
}

async fn close_all(connections: Vec<SharedConnection>) {
    join_all(connections.iter().map(|connection| connection.close())).await;
}

/// 连接租约；`Drop` 时归还连接池。
pub struct PooledConnection {
    connection: SharedConnection,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("endpoint", &self.pool.endpoint)
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.connection));
    }
}
