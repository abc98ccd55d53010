//! # circuit_breaker：节点级熔断器
//!
//! ## 核心意图（Why）
//! - 隔离持续失败的节点：失败在滚动窗口内累积到阈值后快速失败，不再触达网络；
//! - 冷却结束后只放行一个探测请求，由它的结果决定恢复还是继续打开。
//!
//! ## 行为契约（What）
//! - 状态机：`Closed → Open → HalfOpen → Closed | Open`；
//! - [`CircuitBreaker::try_acquire`] 在打开状态返回 [`KvError::CircuitOpen`]，`retry_after`
//!   为剩余冷却时长；
//! - 每个成功获取的 [`CircuitPermit`] 都必须交还给 [`CircuitBreaker::complete`]，
//!   探测许可若以 [`CallOutcome::Ignored`] 交还，则释放探测名额但保持半开；
//! - 禁用时所有请求放行，统计不生效。
//!
//! ## 实现策略（How）
//! - 计数与状态迁移在 `parking_lot::Mutex` 内完成；状态另存一份原子镜像，
//!   关闭态下的放行判断不加锁；
//! - 滚动窗口是固定数量时间桶组成的环形缓冲，桶宽 = 窗口 / 桶数，过期桶按需清零。
//!
//! ## 风险提示（Trade-offs）
//! - 桶粒度决定失败过期的精度：失败会在窗口长度减去一个桶宽之后的某一时刻过期。

use std::{
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    endpoint::HostEndpoint,
    error::KvError,
    options::CircuitBreakerOptions,
    time::SharedClock,
};

const WINDOW_BUCKETS: usize = 10;

/// 熔断状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// 一次调用的结果，用于回填熔断统计。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// 调用未得出节点健康结论（例如调用方取消）。
    Ignored,
}

impl CallOutcome {
    /// 按错误语义归类调用结果。
    pub fn from_result<T>(result: &Result<T, KvError>) -> Self {
        match result {
            Ok(_) => CallOutcome::Success,
            Err(err) if err.counts_as_circuit_failure() => CallOutcome::Failure,
            Err(_) => CallOutcome::Ignored,
        }
    }
}

/// 放行凭证；探测请求的凭证携带 `probe = true`。
#[must_use = "a permit must be handed back through CircuitBreaker::complete"]
#[derive(Debug)]
pub struct CircuitPermit {
    probe: bool,
}

impl CircuitPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    epoch: u64,
    failures: u32,
}

/// 固定桶数的滚动失败计数器。
#[derive(Debug)]
struct RollingWindow {
    origin: Instant,
    bucket_width: Duration,
    slots: [Slot; WINDOW_BUCKETS],
}

impl RollingWindow {
    fn new(origin: Instant, window: Duration) -> Self {
        let width = window / WINDOW_BUCKETS as u32;
        Self {
            origin,
            bucket_width: width.max(Duration::from_millis(1)),
            slots: [Slot::default(); WINDOW_BUCKETS],
        }
    }

    fn epoch_of(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        // 偏移 1，使 epoch 0 专用于“从未写入”的空桶。
        (elapsed.as_nanos() / self.bucket_width.as_nanos()) as u64 + 1
    }

    fn record_failure(&mut self, now: Instant) {
        let epoch = self.epoch_of(now);
        let slot = &mut self.slots[(epoch % WINDOW_BUCKETS as u64) as usize];
        if slot.epoch != epoch {
            *slot = Slot { epoch, failures: 0 };
        }
        slot.failures = slot.failures.saturating_add(1);
    }

    fn failures(&self, now: Instant) -> u32 {
        let current = self.epoch_of(now);
        self.slots
            .iter()
            .filter(|slot| slot.epoch != 0 && current.saturating_sub(slot.epoch) < WINDOW_BUCKETS as u64)
            .map(|slot| slot.failures)
            .sum()
    }

    fn clear(&mut self) {
        self.slots = [Slot::default(); WINDOW_BUCKETS];
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// 单节点熔断器。
///
/// # 教案式说明
/// - **意图 (Why)**：节点失联时，让调度层立即拿到 `CircuitOpen` 去选择其他节点，
///   而不是在每个请求上等待连接超时；
/// - **契约 (What)**：时间一律来自注入的 [`SharedClock`]，测试可精确推进；
/// - **执行 (How)**：见模块文档。
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: HostEndpoint,
    options: CircuitBreakerOptions,
    clock: SharedClock,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: HostEndpoint, options: CircuitBreakerOptions, clock: SharedClock) -> Self {
        let window = RollingWindow::new(clock.now(), options.rolling_window());
        Self {
            endpoint,
            options,
            clock,
            state: AtomicU8::new(CircuitState::Closed as u8),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// 当前状态（无锁读取镜像）。
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    /// 申请一次放行。
    pub fn try_acquire(&self) -> Result<CircuitPermit, KvError> {
        if !self.options.enabled || self.state() == CircuitState::Closed {
            return Ok(CircuitPermit { probe: false });
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit { probe: false }),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                let cooldown = self.options.cooldown();
                if elapsed >= cooldown {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    debug!(endpoint = %self.endpoint, "circuit half-open, dispatching probe");
                    Ok(CircuitPermit { probe: true })
                } else {
                    Err(self.open_error(cooldown - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error(self.options.cooldown()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(CircuitPermit { probe: true })
                }
            }
        }
    }

    /// 交还许可并记录结果。
    pub fn complete(&self, permit: CircuitPermit, outcome: CallOutcome) {
        if !self.options.enabled {
            return;
        }
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if permit.probe {
            inner.probe_in_flight = false;
            match outcome {
                CallOutcome::Success => {
                    inner.window.clear();
                    inner.opened_at = None;
                    self.transition(&mut inner, CircuitState::Closed);
                    info!(endpoint = %self.endpoint, "circuit closed after successful probe");
                }
                CallOutcome::Failure => {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(endpoint = %self.endpoint, "probe failed, circuit reopened");
                }
                CallOutcome::Ignored => {}
            }
            return;
        }

        // 打开之前已放行的普通请求，其结果不再影响状态。
        if outcome != CallOutcome::Failure || inner.state != CircuitState::Closed {
            return;
        }
        inner.window.record_failure(now);
        let failures = inner.window.failures(now);
        if failures >= self.options.failure_threshold {
            inner.opened_at = Some(now);
            self.transition(&mut inner, CircuitState::Open);
            warn!(
                endpoint = %self.endpoint,
                failures,
                window_ms = self.options.rolling_window_ms,
                "failure threshold reached, circuit opened"
            );
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        inner.state = next;
        self.state.store(next as u8, Ordering::Release);
    }

    fn open_error(&self, retry_after: Duration) -> KvError {
        KvError::CircuitOpen {
            endpoint: self.endpoint.clone(),
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::time::ManualClock;

    fn options(threshold: u32) -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            enabled: true,
            failure_threshold: threshold,
            rolling_window_ms: 10_000,
            cooldown_ms: 5_000,
        }
    }

    fn breaker(threshold: u32) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(
            HostEndpoint::new("10.0.0.1", 11210),
            options(threshold),
            Arc::new(clock.clone()),
        );
        (breaker, clock)
    }

    fn fail(breaker: &CircuitBreaker) {
        let permit = breaker.try_acquire().expect("closed breaker admits");
        breaker.complete(permit, CallOutcome::Failure);
    }

    #[test]
    fn opens_at_threshold_then_fails_fast() {
        let (breaker, clock) = breaker(3);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(2));
        match breaker.try_acquire() {
            Err(KvError::CircuitOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(3));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let (breaker, clock) = breaker(1);
        fail(&breaker);
        clock.advance(Duration::from_secs(5));

        let probe = breaker.try_acquire().expect("probe admitted");
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(breaker.try_acquire(), Err(KvError::CircuitOpen { .. })));

        breaker.complete(probe, CallOutcome::Success);
        assert_eq!(breaker.state(), CircuitState::Closed);
        let permit = breaker.try_acquire().expect("closed again");
        assert!(!permit.is_probe());
        breaker.complete(permit, CallOutcome::Success);
    }

    #[test]
    fn failed_probe_restarts_cooldown() {
        let (breaker, clock) = breaker(1);
        fail(&breaker);
        clock.advance(Duration::from_secs(5));
        let probe = breaker.try_acquire().expect("probe admitted");
        breaker.complete(probe, CallOutcome::Failure);
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(4));
        assert!(breaker.try_acquire().is_err());
        clock.advance(Duration::from_secs(1));
        let probe = breaker.try_acquire().expect("second probe");
        breaker.complete(probe, CallOutcome::Success);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn ignored_probe_releases_the_slot() {
        let (breaker, clock) = breaker(1);
        fail(&breaker);
        clock.advance(Duration::from_secs(5));
        let probe = breaker.try_acquire().expect("probe admitted");
        breaker.complete(probe, CallOutcome::Ignored);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let probe = breaker.try_acquire().expect("slot released");
        assert!(probe.is_probe());
        breaker.complete(probe, CallOutcome::Success);
    }

    #[test]
    fn failures_expire_with_the_window() {
        let (breaker, clock) = breaker(3);
        fail(&breaker);
        fail(&breaker);
        clock.advance(Duration::from_secs(11));
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(
            HostEndpoint::new("10.0.0.1", 11210),
            CircuitBreakerOptions {
                enabled: false,
                ..options(1)
            },
            Arc::new(clock),
        );
        for _ in 0..10 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn outcome_classification() {
        let canceled: Result<(), KvError> = Err(KvError::Canceled);
        assert_eq!(CallOutcome::from_result(&canceled), CallOutcome::Ignored);
        let transport: Result<(), KvError> = Err(KvError::Transport {
            endpoint: HostEndpoint::new("h", 1),
            detail: "reset".into(),
        });
        assert_eq!(CallOutcome::from_result(&transport), CallOutcome::Failure);
        assert_eq!(CallOutcome::from_result(&Ok::<_, KvError>(())), CallOutcome::Success);
    }

    proptest! {
        #[test]
        fn stays_closed_below_threshold(threshold in 2u32..20, failures in 0u32..20) {
            prop_assume!(failures < threshold);
            let (breaker, _clock) = breaker(threshold);
            for _ in 0..failures {
                fail(&breaker);
            }
            prop_assert_eq!(breaker.state(), CircuitState::Closed);
        }
    }
}
