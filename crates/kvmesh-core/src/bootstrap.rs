//! # bootstrap：建连 + 认证 + 选择 bucket
//!
//! ## 核心意图（Why）
//! - 连接池只接收完成引导的连接；把“传输建连、SASL 握手、SELECT_BUCKET”封装为一个原子步骤，
//!   任何一步失败都关闭已打开的连接，不会有半认证连接泄漏到池中。
//!
//! ## 行为契约（What）
//! - 建连失败与握手过程中的读写失败统一为 [`KvError::ConnectFailed`]；
//! - 凭证被拒、协议响应异常、bucket 选择被拒统一为 [`KvError::AuthenticationFailed`]；
//! - 握手超过 `handshake_timeout` 视为建连失败，连接被关闭；
//! - 取消令牌触发时返回 [`KvError::Canceled`]，同样关闭连接。

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    connection::{Connection, SharedConnection, SharedConnector},
    endpoint::HostEndpoint,
    error::KvError,
    pool::ConnectionOpener,
    protocol::{Request, Status},
    sasl::SharedMechanism,
};

/// 为单个端点打开已认证连接的开启器。
pub struct AuthenticatingOpener {
    endpoint: HostEndpoint,
    connector: SharedConnector,
    mechanism: SharedMechanism,
    bucket: Option<Arc<str>>,
    handshake_timeout: Duration,
}

impl fmt::Debug for AuthenticatingOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatingOpener")
            .field("endpoint", &self.endpoint)
            .field("mechanism", &self.mechanism.mechanism_type())
            .field("bucket", &self.bucket)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl AuthenticatingOpener {
    pub fn new(
        endpoint: HostEndpoint,
        connector: SharedConnector,
        mechanism: SharedMechanism,
        bucket: Option<Arc<str>>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            connector,
            mechanism,
            bucket,
            handshake_timeout,
        }
    }

    async fn handshake(
        &self,
        connection: &dyn Connection,
        cancel: &CancellationToken,
    ) -> Result<(), KvError> {
        self.mechanism.authenticate(connection, cancel).await?;
        if let Some(bucket) = &self.bucket {
            let response = connection.send(Request::select_bucket(bucket), cancel).await?;
            match response.status {
                Status::Success => {}
                Status::KeyNotFound => {
                    return Err(KvError::AuthenticationFailed {
                        endpoint: self.endpoint.clone(),
                        reason: format!("bucket `{bucket}` does not exist"),
                    });
                }
                status => {
                    return Err(KvError::AuthenticationFailed {
                        endpoint: self.endpoint.clone(),
                        reason: format!(
                            "select bucket `{bucket}` rejected (status 0x{:04x})",
                            status.to_u16()
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn classify(&self, err: KvError) -> KvError {
        match err {
            KvError::Transport { detail, .. } | KvError::ConnectFailed { detail, .. } => {
                KvError::ConnectFailed {
                    endpoint: self.endpoint.clone(),
                    detail,
                }
            }
            KvError::Protocol { detail } => KvError::AuthenticationFailed {
                endpoint: self.endpoint.clone(),
                reason: detail,
            },
            other => other,
        }
    }
}

#[async_trait]
impl ConnectionOpener for AuthenticatingOpener {
    fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<SharedConnection, KvError> {
        let connection = self
            .connector
            .connect(&self.endpoint, cancel)
            .await
            .map_err(|err| self.classify(err))?;

        let outcome = tokio::time::timeout(
            self.handshake_timeout,
            self.handshake(connection.as_ref(), cancel),
        )
        .await;

        let err = match outcome {
            Ok(Ok(())) => {
                debug!(
                    endpoint = %self.endpoint,
                    connection = connection.id(),
                    bucket = self.bucket.as_deref().unwrap_or(""),
                    "connection bootstrapped"
                );
                return Ok(connection);
            }
            Ok(Err(err)) => self.classify(err),
            Err(_) => KvError::ConnectFailed {
                endpoint: self.endpoint.clone(),
                detail: format!("handshake timed out after {:?}", self.handshake_timeout),
            },
        };

        connection.close().await;
        if !matches!(err, KvError::Canceled) {
            warn!(
                endpoint = %self.endpoint,
                connection = connection.id(),
                code = err.code(),
                error = %err,
                "connection bootstrap failed"
            );
        }
        Err(err)
    }
}
