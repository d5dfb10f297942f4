use std::{io, net::SocketAddr};

use flint_buffer::ByteBuffer;
use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::{trace, warn};

use crate::{
    config::SocketConfig,
    error::{CONFIGURE, SocketError, map_io_error},
};

/// 单个套接字在 Tokio 反应器上的就绪绑定。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 驱动任务只关心“现在可读/可写吗”与“非阻塞地读写一次”，具体的 epoll/kqueue 注册交给
///   Tokio 反应器；
/// - 拆除时先从反应器注销再关闭描述符，避免描述符号被复用后收到旧连接的就绪事件。
///
/// ## 逻辑 (How)
/// - `readable`/`writable` 等待就绪，`try_read`/`try_write` 在未就绪时返回 `WouldBlock`
///   并清除就绪标记，下一次等待会重新挂起；
/// - `close` 调用 `TcpStream::into_std` 完成注销，随后丢弃标准库句柄关闭描述符，两步在
///   同一个调用里完成。
///
/// ## 契约 (What)
/// - 仅由所属驱动任务访问；
/// - `close` 消耗绑定，之后不会再有任何就绪事件。
#[derive(Debug)]
pub(crate) struct ReactorBinding {
    stream: TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
}

impl ReactorBinding {
    pub(crate) fn new(stream: TcpStream, config: &SocketConfig) -> Result<Self, SocketError> {
        if config.nodelay() {
            stream
                .set_nodelay(true)
                .map_err(|err| map_io_error(CONFIGURE, err))?;
        }
        let local = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        Ok(Self {
            stream,
            local,
            peer,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    pub(crate) async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    pub(crate) fn try_write(&self, data: &[u8]) -> io::Result<usize> {
        self.stream.try_write(data)
    }

    /// 非阻塞地读入 `buffer`，单次最多 `limit` 字节；返回 `Ok(0)` 表示对端有序关闭。
    pub(crate) fn read_into(&self, buffer: &mut ByteBuffer, limit: usize) -> io::Result<usize> {
        let spare = buffer.spare(limit);
        let window = spare.len().min(limit);
        let n = self.stream.try_read(&mut spare[..window])?;
        buffer.commit(n).map_err(io::Error::other)?;
        Ok(n)
    }

    /// 读取对端挂起的套接字错误，用于在拆除日志中给出 RST 等原因。
    pub(crate) fn take_error(&self) -> Option<io::Error> {
        SockRef::from(&self.stream).take_error().ok().flatten()
    }

    /// 从反应器注销并关闭描述符。
    pub(crate) fn close(self) {
        let peer = self.peer;
        match self.stream.into_std() {
            Ok(stream) => {
                drop(stream);
                trace!(%peer, "descriptor deregistered and closed");
            }
            Err(err) => warn!(%peer, error = %err, "deregistration failed, descriptor dropped"),
        }
    }
}
