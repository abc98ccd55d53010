use std::time::Duration;

/// 带抖动的指数退避。
///
/// # 教案式说明
/// - **意图 (Why)**：所有客户端在同一次集群故障后同时重连会形成尖峰，抖动把重连时刻摊开；
/// - **契约 (What)**：第 `n` 次等待落在 `[base/2, base]`，`base = min(initial * 2^n, max)`；
///   [`Backoff::reset`] 后回到初始值；
/// - **执行 (How)**：抖动来自对 `(seed, attempt)` 的 splitmix64 混合，不依赖全局随机数，
///   相同种子可复现。
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
    seed: u64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, seed: u64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
            seed,
        }
    }

    /// 下一次等待时长。
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(20);
        let base = self
            .initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max));
        self.attempt = self.attempt.saturating_add(1);

        let nanos = u64::try_from(base.as_nanos()).unwrap_or(u64::MAX);
        let jitter = mix64(self.seed ^ u64::from(self.attempt)) % (nanos / 2 + 1);
        Duration::from_nanos(nanos - jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[inline]
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn grows_then_caps_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 7);
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_secs(1));
        }
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_millis(500));

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }

    proptest! {
        #[test]
        fn delays_stay_within_jitter_band(seed in any::<u64>(), steps in 1usize..40) {
            let initial = Duration::from_millis(20);
            let max = Duration::from_secs(5);
            let mut backoff = Backoff::new(initial, max, seed);
            for step in 0..steps {
                let base = initial
                    .checked_mul(1u32 << (step as u32).min(20))
                    .map_or(max, |delay| delay.min(max));
                let delay = backoff.next_delay();
                prop_assert!(delay <= base);
                prop_assert!(delay >= base / 2);
            }
        }
    }
}
