use std::{fmt, io, net::SocketAddr, sync::Arc};

use flint_buffer::BufferError;
use thiserror::Error;

use crate::queue::Tag;

/// 读写方向，用于在超时等错误中指明受影响的队列。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// 单次建连尝试的失败记录。
///
/// `address` 为 `None` 表示失败发生在解析阶段，尚未产生候选地址。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptFailure {
    pub address: Option<SocketAddr>,
    pub reason: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{address}: {}", self.reason),
            None => write!(f, "resolve: {}", self.reason),
        }
    }
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no eligible address".to_owned();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// 套接字引擎对外暴露的错误类型。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 所有失败都是连接级的：触发失败的操作拿到具体原因，同一连接上其余挂起操作统一收到
///   [`SocketError::ConnectionClosed`]，只有 [`SocketError::TlsFailure`] 会原样广播给每个操作；
/// - 错误需要跨任务、跨事件复制，因此实现 `Clone`，底层 `io::Error` 以 `Arc` 共享。
///
/// ## 契约 (What)
/// - [`SocketError::code`] 返回稳定的错误码（`flint.socket.*`），供日志与告警检索；
/// - `BadConfig`/`BadParam` 只在调用入口同步返回，不会出现在事件流中；
/// - `InsufficientData` 代表缓冲契约被破坏，正常运行不应出现。
#[derive(Clone, Debug, Error)]
pub enum SocketError {
    /// 所有建连尝试均失败，或主机未解析出任何可用地址。
    #[error("connection to {host} failed: {}", summarize(.attempts))]
    ConnectionFailed {
        host: String,
        attempts: Vec<AttemptFailure>,
    },
    /// 对端关闭或本端主动断开。
    #[error("connection closed")]
    ConnectionClosed,
    /// 操作在截止时间前未完成。
    #[error("{direction} operation (tag {tag}) timed out")]
    OperationTimedOut { tag: Tag, direction: Direction },
    /// 分隔符读取在最大长度内未匹配。
    #[error("read (tag {tag}) exceeded max length {max_length} without a delimiter match")]
    OversizedRead { tag: Tag, max_length: usize },
    /// 内部缓冲契约被破坏。
    #[error("insufficient data: requested {requested} bytes, {available} available")]
    InsufficientData { requested: usize, available: usize },
    /// TLS 握手或记录层错误。
    #[error("tls failure: {reason}")]
    TlsFailure { reason: String },
    /// 手动信任评估给出了拒绝结论。
    #[error("peer credential was rejected by trust evaluation")]
    TrustRejected,
    /// 配置自相矛盾或与当前连接不兼容。
    #[error("bad config: {0}")]
    BadConfig(String),
    /// 调用参数非法。
    #[error("bad param: {0}")]
    BadParam(String),
    /// 底层系统调用失败。
    #[error("{operation}: {source}")]
    Io {
        code: &'static str,
        operation: &'static str,
        #[source]
        source: Arc<io::Error>,
    },
}

impl SocketError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::ConnectionFailed { .. } => "flint.socket.connect_failed",
            SocketError::ConnectionClosed => "flint.socket.connection_closed",
            SocketError::OperationTimedOut { .. } => TIMEOUT_CODE,
            SocketError::OversizedRead { .. } => "flint.socket.oversized_read",
            SocketError::InsufficientData { .. } => "flint.socket.insufficient_data",
            SocketError::TlsFailure { .. } => "flint.socket.tls_failed",
            SocketError::TrustRejected => "flint.socket.trust_rejected",
            SocketError::BadConfig(_) => "flint.socket.bad_config",
            SocketError::BadParam(_) => "flint.socket.bad_param",
            SocketError::Io { code, .. } => *code,
        }
    }

    /// 该错误是否需要广播给连接上的全部挂起操作。
    pub(crate) fn is_broadcast(&self) -> bool {
        matches!(self, SocketError::TlsFailure { .. })
    }

    pub(crate) fn tls(reason: impl fmt::Display) -> Self {
        SocketError::TlsFailure {
            reason: reason.to_string(),
        }
    }
}

impl From<BufferError> for SocketError {
    fn from(error: BufferError) -> Self {
        match error {
            BufferError::InsufficientData {
                requested,
                available,
            } => SocketError::InsufficientData {
                requested,
                available,
            },
            BufferError::CommitOverflow { requested, spare } => SocketError::InsufficientData {
                requested,
                available: spare,
            },
        }
    }
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "flint.socket.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "flint.socket.accept_failed",
    message: "tcp accept",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "flint.socket.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "flint.socket.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "flint.socket.configure_failed",
    message: "tcp configure",
};

const TIMEOUT_CODE: &str = "flint.socket.timeout";

/// 将 IO 错误包装为 [`SocketError::Io`]，保留操作名与错误码。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> SocketError {
    SocketError::Io {
        code: kind.code,
        operation: kind.message,
        source: Arc::new(error),
    }
}
