use std::future::Future;
use std::io;
use std::time::Duration;

use kvmesh_core::{HostEndpoint, KvError};
use tokio_util::sync::CancellationToken;

use crate::error::{OperationKind, map_io_error, timeout_error};

/// 在保留取消/超时语义的前提下执行 IO Future。
///
/// - 取消优先于超时，超时优先于 IO 结果（`biased` 选择），保证取消信号总能及时生效；
/// - 取消映射为 [`KvError::Canceled`]，其余失败按 `kind` 映射为连接或传输错误。
pub(crate) async fn run_with_context<F, T>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    kind: OperationKind,
    endpoint: &HostEndpoint,
    future: F,
) -> Result<T, KvError>
where
    F: Future<Output = io::Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(KvError::Canceled);
    }
    tokio::pin!(future);

    if let Some(timeout) = timeout {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KvError::Canceled),
            _ = &mut sleep => Err(timeout_error(kind, endpoint)),
            result = &mut future => result.map_err(|err| map_io_error(kind, endpoint, err)),
        }
    } else {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KvError::Canceled),
            result = &mut future => result.map_err(|err| map_io_error(kind, endpoint, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::READ;

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let endpoint = HostEndpoint::new("127.0.0.1", 11210);
        let result = run_with_context(&cancel, None, READ, &endpoint, async { Ok(1u8) }).await;
        assert_eq!(result, Err(KvError::Canceled));
    }

    #[tokio::test]
    async fn pending_io_times_out() {
        let cancel = CancellationToken::new();
        let endpoint = HostEndpoint::new("127.0.0.1", 11210);
        let result = run_with_context(
            &cancel,
            Some(Duration::from_millis(10)),
            READ,
            &endpoint,
            std::future::pending::<io::Result<()>>(),
        )
        .await;
        assert!(matches!(result, Err(KvError::Transport { .. })));
    }
}
