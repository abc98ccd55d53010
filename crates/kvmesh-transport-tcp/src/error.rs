use std::io;

use kvmesh_core::{HostEndpoint, KvError};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "kvmesh.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "kvmesh.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "kvmesh.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "kvmesh.transport.tcp.configure_failed",
    message: "tcp configure",
};

impl OperationKind {
    /// 连接建立阶段（含套接字配置）的失败统一映射为 `ConnectFailed`，
    /// 以便节点工厂将其计入熔断并允许重试。
    fn is_connect_phase(self) -> bool {
        self.code == CONNECT.code || self.code == CONFIGURE.code
    }
}

/// 将 IO 错误映射为核心错误，附带操作错误码与 IO 错误种类。
pub(crate) fn map_io_error(kind: OperationKind, endpoint: &HostEndpoint, error: io::Error) -> KvError {
    let detail = format!("{} [{}] ({}): {}", kind.message, kind.code, describe(&error), error);
    failure(kind, endpoint, detail)
}

/// 构造超时错误；超时与 IO 失败一样视为节点不健康。
pub(crate) fn timeout_error(kind: OperationKind, endpoint: &HostEndpoint) -> KvError {
    failure(kind, endpoint, format!("{} [{}] timed out", kind.message, kind.code))
}

fn failure(kind: OperationKind, endpoint: &HostEndpoint, detail: String) -> KvError {
    if kind.is_connect_phase() {
        KvError::ConnectFailed {
            endpoint: endpoint.clone(),
            detail,
        }
    } else {
        KvError::Transport {
            endpoint: endpoint.clone(),
            detail,
        }
    }
}

fn describe(error: &io::Error) -> &'static str {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => "timed out",
        ErrorKind::ConnectionRefused => "refused",
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => "reset",
        ErrorKind::UnexpectedEof => "peer closed",
        ErrorKind::NotConnected => "not connected",
        ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable => "address unavailable",
        ErrorKind::PermissionDenied => "permission denied",
        _ => "io",
    }
}
