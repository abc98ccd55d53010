//! # logging：进程级 tracing 订阅器安装
//!
//! ## 核心意图（Why）
//! - 客户端核心只通过 `tracing` 宏输出结构化事件（`bucket`、`endpoint`、`rev`、`state` 等字段），
//!   不假设宿主使用哪种订阅器；
//! - 没有自带日志方案的宿主可以调用 [`install`] 获得 `fmt + EnvFilter` 的默认组合。
//!
//! ## 行为契约（What）
//! - 过滤规则取自 `RUST_LOG`，缺省为 `info`；
//! - 宿主已设置全局订阅器时返回 [`LoggingError::SubscriberAlreadySet`]，不覆盖既有配置；
//! - 重复调用返回 [`LoggingError::AlreadyInstalled`]。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// 安装阶段的错误。
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("kvmesh logging is already installed")]
    AlreadyInstalled,
    #[error("a global tracing subscriber is already set")]
    SubscriberAlreadySet,
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装默认订阅器。
pub fn install() -> Result<(), LoggingError> {
    if INSTALLED.get().is_some() {
        return Err(LoggingError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(LoggingError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    INSTALLED.set(()).map_err(|_| LoggingError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_refused() {
        // 同一测试进程内其他测试可能已安装订阅器，两种拒绝都可接受。
        let first = install();
        let second = install();
        assert!(matches!(
            second,
            Err(LoggingError::AlreadyInstalled | LoggingError::SubscriberAlreadySet)
        ));
        if first.is_ok() {
            assert!(matches!(second, Err(LoggingError::AlreadyInstalled)));
        }
    }
}
