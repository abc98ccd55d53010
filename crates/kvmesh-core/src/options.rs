//! # options：启动期不可变配置
//!
//! ## 核心意图（Why）
//! - 以单一结构承载种子节点、凭证、连接池、熔断、流式重连等全部输入；启动后不支持热更新；
//! - 支持 TOML 装载（`ClusterOptions::from_toml_str`）与链式构造（`with_*`）两种入口。
//!
//! ## 行为契约（What）
//! - 时长字段以毫秒整数存储，便于在 TOML 中书写；访问器返回 [`Duration`]；
//! - [`ClusterOptions::validate`] 拒绝自相矛盾的取值，返回
//!   [`KvError::InvalidConfiguration`]；
//! - 凭证的 `Debug` 输出不包含密码。

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{endpoint::HostEndpoint, error::KvError, sasl::MechanismType};

/// 用户名/密码凭证。
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// 每节点连接池的尺寸。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 8,
        }
    }
}

/// 熔断策略参数。
///
/// - `failure_threshold`：滚动窗口内累计失败达到该值即打开；
/// - `rolling_window_ms`：统计窗口长度；
/// - `cooldown_ms`：打开后到允许探测请求的冷却时长。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerOptions {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub rolling_window_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 10,
            rolling_window_ms: 60_000,
            cooldown_ms: 5_000,
        }
    }
}

impl CircuitBreakerOptions {
    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// 流式配置监听的重连与分帧参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingOptions {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 单个配置文档的最大字节数；超过视为分帧错误并触发重连。
    pub max_frame_bytes: usize,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

impl StreamingOptions {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// 客户端启动配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterOptions {
    pub seed_nodes: Vec<HostEndpoint>,
    pub credentials: Credentials,
    pub sasl_mechanism: MechanismType,
    pub pool: PoolOptions,
    pub circuit_breaker: CircuitBreakerOptions,
    pub streaming: StreamingOptions,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            seed_nodes: Vec::new(),
            credentials: Credentials::default(),
            sasl_mechanism: MechanismType::ScramSha512,
            pool: PoolOptions::default(),
            circuit_breaker: CircuitBreakerOptions::default(),
            streaming: StreamingOptions::default(),
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 2_500,
        }
    }
}

impl ClusterOptions {
    /// 从 TOML 文本装载并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, KvError> {
        let options: ClusterOptions =
            toml::from_str(raw).map_err(|err| KvError::invalid_config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_seed_node(mut self, endpoint: HostEndpoint) -> Self {
        self.seed_nodes.push(endpoint);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Credentials::new(username, password);
        self
    }

    pub fn with_sasl_mechanism(mut self, mechanism: MechanismType) -> Self {
        self.sasl_mechanism = mechanism;
        self
    }

    pub fn with_pool(mut self, min_size: usize, max_size: usize) -> Self {
        self.pool = PoolOptions { min_size, max_size };
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerOptions) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_streaming(mut self, streaming: StreamingOptions) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// 校验取值的一致性。
    pub fn validate(&self) -> Result<(), KvError> {
        if self.credentials.username.is_empty() {
            return Err(KvError::invalid_config("credentials.username must not be empty"));
        }
        if self.pool.max_size == 0 {
            return Err(KvError::invalid_config("pool.max_size must be at least 1"));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(KvError::invalid_config(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0 {
                return Err(KvError::invalid_config(
                    "circuit_breaker.failure_threshold must be at least 1",
                ));
            }
            if self.circuit_breaker.rolling_window_ms == 0 {
                return Err(KvError::invalid_config(
                    "circuit_breaker.rolling_window_ms must be positive",
                ));
            }
        }
        if self.streaming.initial_backoff_ms > self.streaming.max_backoff_ms {
            return Err(KvError::invalid_config(
                "streaming.initial_backoff_ms exceeds streaming.max_backoff_ms",
            ));
        }
        if self.streaming.max_frame_bytes == 0 {
            return Err(KvError::invalid_config("streaming.max_frame_bytes must be positive"));
        }
        if self.handshake_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(KvError::invalid_config("timeouts must be positive"));
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_toml_with_defaults() {
        let raw = r#"
            seed_nodes = ["10.0.0.1", "10.0.0.2:11207"]
            sasl_mechanism = "plain"

            [credentials]
            username = "app"
            password = "s3cret"

            [pool]
            min_size = 1
            max_size = 4

            [circuit_breaker]
            failure_threshold = 3
        "#;
        let options = ClusterOptions::from_toml_str(raw).expect("valid options");
        assert_eq!(options.seed_nodes.len(), 2);
        assert_eq!(options.seed_nodes[1].port(), 11207);
        assert_eq!(options.sasl_mechanism, MechanismType::Plain);
        assert_eq!(options.pool.max_size, 4);
        assert_eq!(options.circuit_breaker.failure_threshold, 3);
        assert_eq!(options.circuit_breaker.cooldown(), Duration::from_secs(5));
        assert_eq!(options.streaming, StreamingOptions::default());
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let err = ClusterOptions::default()
            .with_credentials("app", "pw")
            .with_pool(5, 2)
            .validate()
            .expect_err("min > max");
        assert_eq!(err.code(), "kvmesh.config.invalid");
    }

    #[test]
    fn rejects_unknown_keys() {
        let raw = r#"
            unknown_key = 1
            [credentials]
            username = "app"
        "#;
        assert!(ClusterOptions::from_toml_str(raw).is_err());
    }

    #[test]
    fn debug_output_redacts_password() {
        let creds = Credentials::new("app", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("app"));
        assert!(!rendered.contains("hunter2"));
    }
}
