use thiserror::Error;

/// 字节缓冲的契约违规错误。
///
/// 这些错误代表调用方的编程错误：调用前应当先检查
/// [`ByteBuffer::available_to_read`](crate::ByteBuffer::available_to_read)。正常运行路径中不应出现。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// 请求读取的字节数超过当前可读字节数。
    #[error("insufficient data: requested {requested} bytes, {available} available")]
    InsufficientData { requested: usize, available: usize },
    /// `commit` 的长度超过了此前 `spare` 暴露的可写区域。
    #[error("commit of {requested} bytes exceeds {spare} spare bytes")]
    CommitOverflow { requested: usize, spare: usize },
}
