use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use kvmesh_core::{
    ClusterOptions, ConfigStreamSource, Credentials, HostEndpoint, KvError, StreamRequest,
    listener::ConfigStream,
};
use reqwest::{Client, StatusCode, header::ACCEPT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// 通过管理端口的流式 HTTP 接口 (`/pools/default/bs/{bucket}`) 获取配置推送。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 监听器只关心“字节块流”；本类型负责建连、Basic 认证与状态码判定，
///   把 HTTP 细节挡在核心之外。
///
/// ## 契约 (What)
/// - `401/403` 映射为 [`KvError::AuthenticationFailed`]；其余非 2xx 映射为 [`KvError::Transport`]；
/// - 建连失败或建连超时映射为 [`KvError::ConnectFailed`]；
/// - 返回的流在取消令牌触发后结束；读取中途的错误以 [`KvError::Transport`] 交给监听器决定重连。
///
/// ## 风险 (Trade-offs)
/// - 客户端不设整体请求超时：流式响应会无限期保持打开，超时只作用于建连阶段。
pub struct HttpStreamingConfigSource {
    client: Client,
    credentials: Credentials,
}

impl fmt::Debug for HttpStreamingConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStreamingConfigSource")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl HttpStreamingConfigSource {
    /// 以集群配置中的凭证与建连超时构造推送源。
    pub fn new(options: &ClusterOptions) -> Result<Self, KvError> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_nodelay(true)
            .build()
            .map_err(|err| KvError::InvalidConfiguration {
                detail: format!("http client: {err}"),
            })?;
        Ok(Self::with_client(client, options.credentials.clone()))
    }

    /// 复用调用方提供的客户端（例如已配置代理或 TLS 的实例）。
    pub fn with_client(client: Client, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
        }
    }
}

fn request_error(endpoint: &HostEndpoint, err: &reqwest::Error) -> KvError {
    if err.is_connect() || err.is_timeout() {
        KvError::ConnectFailed {
            endpoint: endpoint.clone(),
            detail: err.to_string(),
        }
    } else {
        KvError::Transport {
            endpoint: endpoint.clone(),
            detail: err.to_string(),
        }
    }
}

fn status_error(endpoint: &HostEndpoint, bucket: &str, status: StatusCode) -> KvError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => KvError::AuthenticationFailed {
            endpoint: endpoint.clone(),
            reason: format!("config stream for bucket `{bucket}` rejected with {status}"),
        },
        status => KvError::Transport {
            endpoint: endpoint.clone(),
            detail: format!("config stream for bucket `{bucket}` answered {status}"),
        },
    }
}

#[async_trait]
impl ConfigStreamSource for HttpStreamingConfigSource {
    async fn open(&self, request: &StreamRequest, cancel: &CancellationToken) -> Result<ConfigStream, KvError> {
        let uri = request.uri();
        let pending = self
            .client
            .get(&uri)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .header(ACCEPT, "application/json")
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KvError::Canceled),
            response = pending => response.map_err(|err| request_error(&request.endpoint, &err))?,
        };

        let status = response.status();
        if !status.is_success() {
            let err = status_error(&request.endpoint, &request.bucket, status);
            warn!(uri = %uri, status = status.as_u16(), code = err.code(), "config stream refused");
            return Err(err);
        }
        debug!(uri = %uri, "config stream opened");

        let endpoint = request.endpoint.clone();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|err| request_error(&endpoint, &err)))
            .take_until(cancel.clone().cancelled_owned());
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_are_authentication_failures() {
        let endpoint = HostEndpoint::new("10.0.0.1", 8091);
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            assert!(matches!(
                status_error(&endpoint, "default", status),
                KvError::AuthenticationFailed { .. }
            ));
        }
        let err = status_error(&endpoint, "default", StatusCode::NOT_FOUND);
        assert!(matches!(err, KvError::Transport { .. }));
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn debug_output_redacts_password() {
        let options = ClusterOptions::default().with_credentials("Administrator", "s3cret");
        let source = HttpStreamingConfigSource::new(&options).expect("client builds");
        let rendered = format!("{source:?}");
        assert!(rendered.contains("Administrator"));
        assert!(!rendered.contains("s3cret"));
    }
}
