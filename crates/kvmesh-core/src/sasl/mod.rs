//! # sasl：连接认证握手
//!
//! ## 核心意图（Why）
//! - 每条新连接在投入使用前必须证明身份；认证失败的连接不得进入连接池；
//! - 机制（PLAIN / SCRAM）之间只在报文内容上不同，统一收敛到 [`SaslMechanism`] 接口。
//!
//! ## 行为契约（What）
//! - [`SaslMechanism::authenticate`] 成功返回即表示服务端已接受凭证；
//! - 服务端拒绝返回 [`KvError::AuthenticationFailed`]，原因优先取服务端给出的文本；
//! - 读写失败原样返回（通常为 [`KvError::Transport`]），由调用方决定如何归类；
//! - 会话状态只存活于单次 `authenticate` 调用内，从不跨连接复用。

mod plain;
mod scram;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::Connection,
    error::KvError,
    options::Credentials,
    protocol::{Response, Status},
};

pub use plain::PlainMechanism;
pub use scram::{ScramHash, ScramMechanism};

/// 支持的认证机制。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismType {
    Plain,
    ScramSha256,
    #[default]
    ScramSha512,
}

impl MechanismType {
    /// 线上使用的机制名。
    pub fn wire_name(self) -> &'static str {
        match self {
            MechanismType::Plain => "PLAIN",
            MechanismType::ScramSha256 => "SCRAM-SHA256",
            MechanismType::ScramSha512 => "SCRAM-SHA512",
        }
    }
}

impl fmt::Display for MechanismType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// 认证机制。
#[async_trait]
pub trait SaslMechanism: Send + Sync + fmt::Debug + 'static {
    fn mechanism_type(&self) -> MechanismType;

    async fn authenticate(
        &self,
        connection: &dyn Connection,
        cancel: &CancellationToken,
    ) -> Result<(), KvError>;
}

/// 共享认证机制句柄。
pub type SharedMechanism = Arc<dyn SaslMechanism>;

/// 按配置构造认证机制。
pub fn mechanism_for(kind: MechanismType, credentials: Credentials) -> SharedMechanism {
    match kind {
        MechanismType::Plain => Arc::new(PlainMechanism::new(credentials)),
        MechanismType::ScramSha256 => Arc::new(ScramMechanism::new(ScramHash::Sha256, credentials)),
        MechanismType::ScramSha512 => Arc::new(ScramMechanism::new(ScramHash::Sha512, credentials)),
    }
}

/// 把最终响应映射为认证结果。
fn expect_success(connection: &dyn Connection, response: &Response) -> Result<(), KvError> {
    match response.status {
        Status::Success => Ok(()),
        status => Err(rejected(connection, status, response)),
    }
}

fn rejected(connection: &dyn Connection, status: Status, response: &Response) -> KvError {
    let text = response.body_text();
    let reason = if text.is_empty() {
        format!("server rejected credentials (status 0x{:04x})", status.to_u16())
    } else {
        text
    };
    KvError::AuthenticationFailed {
        endpoint: connection.endpoint().clone(),
        reason,
    }
}
