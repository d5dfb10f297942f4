//! 向上层交付的类型化事件与状态快照。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 以一条无界事件通道取代回调委托：驱动任务只负责按发生顺序推送事件，应用在自己的任务里
//!   消费，不存在回调在错误线程上执行的问题；
//! - 连接阶段、端点与 TLS 状态通过 `watch` 快照发布，查询不需要与驱动任务往返。
//!
//! ## 契约 (What)
//! - 每个被接受的读写操作恰好对应一个 `*Completed` 或 `*Failed` 事件；
//! - [`SocketEvent::Disconnected`] 总是该套接字的最后一个事件，`cause` 为 `None`
//!   表示本端有序断开。

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{error::SocketError, queue::Tag, tls::TrustRequest};

/// 套接字事件。
#[derive(Debug)]
pub enum SocketEvent {
    /// 建连成功（主动建连或接管描述符）；被动接受的连接不会产生该事件。
    Connected { local: SocketAddr, peer: SocketAddr },
    ReadCompleted { data: Bytes, tag: Tag },
    /// 读操作取得进展但尚未完成，`done` 为累计字节数。
    ReadProgress { tag: Tag, done: usize },
    ReadFailed { tag: Tag, error: SocketError },
    WriteCompleted { tag: Tag },
    /// 写操作已交出 `done` 字节但尚未完成。
    WriteProgress { tag: Tag, done: usize },
    WriteFailed { tag: Tag, error: SocketError },
    /// TLS 握手完成，只触发一次；携带协商出的 ALPN 协议（如有）。
    Secured { alpn_protocol: Option<Vec<u8>> },
    /// 手动信任且未配置评估器时，凭据交给应用作答。
    TrustRequest(TrustRequest),
    Disconnected { cause: Option<SocketError> },
}

/// 单个套接字的事件接收端。
#[derive(Debug)]
pub struct SocketEvents {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SocketEvent>) -> Self {
        Self { rx }
    }

    /// 等待下一个事件；驱动任务结束且事件耗尽后返回 `None`。
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.rx.recv().await
    }

    /// 非阻塞地取出一个已到达的事件。
    pub fn try_recv(&mut self) -> Option<SocketEvent> {
        self.rx.try_recv().ok()
    }
}

/// 连接阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Connected,
    Disconnected,
}

/// 由驱动任务发布的状态快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketState {
    pub phase: ConnectionPhase,
    pub local: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
    /// TLS 已进入 Secured。
    pub secure: bool,
    /// 主动建连时使用的主机名，作为 TLS 对端名称的缺省值。
    pub host: Option<String>,
}

impl SocketState {
    pub(crate) fn connecting(host: Option<String>) -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            local: None,
            peer: None,
            secure: false,
            host,
        }
    }
}
