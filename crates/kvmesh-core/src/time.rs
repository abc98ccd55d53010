//! 可注入的单调时钟。
//!
//! 熔断器的滚动窗口与冷却计时都通过 [`Clock`] 读取时间；生产环境使用 [`SystemClock`]，
//! 测试注入 [`ManualClock`] 并手动推进，保证状态跃迁可确定复现。

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// 单调时间来源。
///
/// 实现者必须保证 `now` 单调不减。
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> Instant;
}

/// 共享时钟句柄。
pub type SharedClock = Arc<dyn Clock>;

/// 直接委托 [`Instant::now`] 的系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手动推进的虚拟时钟。
///
/// - `advance` 只会增加偏移量，保持单调；
/// - 克隆体共享同一时间线。
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// 推进虚拟时间。
    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed = elapsed.saturating_add(by);
    }

    /// 自构造以来累计推进的时长。
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }
}
