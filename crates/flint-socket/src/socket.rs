use std::{fmt, net::SocketAddr, time::Duration};

use bytes::Bytes;
use tokio::{
    net::TcpStream,
    runtime::Handle,
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{Instrument, debug_span};

use crate::{
    config::SocketConfig,
    driver::{self, Command, DisconnectMode, Origin},
    error::{CONFIGURE, SocketError, map_io_error},
    establish::validate_attached,
    event::{ConnectionPhase, SocketEvents, SocketState},
    queue::{ReadCondition, Tag},
    tls::TlsSettings,
};

/// 异步套接字句柄。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 句柄只是命令通道的发送端加一份状态快照，可以随意克隆并在多个任务间共享；
///   真正的套接字状态由后台驱动任务独占；
/// - 所有入队方法同步返回：参数非法立即以 [`SocketError::BadParam`] 拒绝，
///   合法的操作随后恰好产生一个完成或失败事件。
///
/// ## 逻辑 (How)
/// - 构造函数在当前 Tokio 运行时上派生驱动任务，返回句柄与 [`SocketEvents`]；
/// - 读写的截止时间在入队这一刻计算，排队等待的时间同样计入超时；
/// - 驱动任务已经结束时，入队返回 [`SocketError::ConnectionClosed`]。
///
/// ## 契约 (What)
/// - 必须在 Tokio 运行时内构造，否则返回 [`SocketError::BadConfig`]；
/// - 超时传 `None` 或零时长表示不限时；
/// - 所有句柄被丢弃后，驱动在待写数据发送完毕后断开。
#[derive(Clone)]
pub struct AsyncSocket {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SocketState>,
}

impl AsyncSocket {
    /// 解析主机并竞速建连。
    pub fn connect(
        host: impl Into<String>,
        port: u16,
        config: SocketConfig,
    ) -> Result<(Self, SocketEvents), SocketError> {
        config.validate()?;
        let host = host.into();
        if host.is_empty() {
            return Err(SocketError::BadParam("host must not be empty".into()));
        }
        Self::spawn(Origin::Resolve { host, port }, config)
    }

    /// 对已解析的地址建连。
    pub fn connect_addr(address: SocketAddr, config: SocketConfig) -> Result<(Self, SocketEvents), SocketError> {
        config.validate()?;
        if !config.allows(&address) {
            return Err(SocketError::BadConfig(format!(
                "address family of {address} is disabled by the socket config"
            )));
        }
        Self::spawn(Origin::Address(address), config)
    }

    /// 接管一个已经连接的标准库描述符，不经过建连竞速。
    pub fn from_std(stream: std::net::TcpStream, config: SocketConfig) -> Result<(Self, SocketEvents), SocketError> {
        config.validate()?;
        ensure_runtime()?;
        validate_attached(stream.peer_addr(), &config)?;
        stream
            .set_nonblocking(true)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let stream = TcpStream::from_std(stream).map_err(|err| map_io_error(CONFIGURE, err))?;
        Ok(Self::spawn_driver(
            Origin::Attached {
                stream,
                announce: true,
            },
            config,
        ))
    }

    /// 监听器接受的连接：不推送 `Connected`。
    pub(crate) fn accepted(stream: TcpStream, config: SocketConfig) -> (Self, SocketEvents) {
        Self::spawn_driver(
            Origin::Attached {
                stream,
                announce: false,
            },
            config,
        )
    }

    fn spawn(origin: Origin, config: SocketConfig) -> Result<(Self, SocketEvents), SocketError> {
        ensure_runtime()?;
        Ok(Self::spawn_driver(origin, config))
    }

    fn spawn_driver(origin: Origin, config: SocketConfig) -> (Self, SocketEvents) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(origin.initial_state());
        let span = debug_span!("flint_socket", target = %origin.label());
        tokio::spawn(driver::run(origin, config, command_rx, event_tx, state_tx).instrument(span));
        (
            Self {
                commands: command_tx,
                state: state_rx,
            },
            SocketEvents::new(event_rx),
        )
    }

    fn send(&self, command: Command) -> Result<(), SocketError> {
        self.commands
            .send(command)
            .map_err(|_| SocketError::ConnectionClosed)
    }

    /// 通用读入口；`max_length` 为 0 表示不设上限。
    pub fn read(
        &self,
        condition: ReadCondition,
        max_length: usize,
        timeout: Option<Duration>,
        tag: Tag,
    ) -> Result<(), SocketError> {
        match &condition {
            ReadCondition::ToLength(0) => {
                return Err(SocketError::BadParam("read length must be positive".into()));
            }
            ReadCondition::ToDelimiter(delimiter) if delimiter.is_empty() => {
                return Err(SocketError::BadParam("delimiter must not be empty".into()));
            }
            ReadCondition::ToDelimiter(delimiter) if max_length > 0 && max_length < delimiter.len() => {
                return Err(SocketError::BadParam(format!(
                    "max length {max_length} is shorter than the delimiter"
                )));
            }
            _ => {}
        }
        self.send(Command::Read {
            condition,
            max_length,
            deadline: deadline(timeout),
            tag,
        })
    }

    /// 恰好读取 `length` 字节。
    pub fn read_to_length(&self, length: usize, timeout: Option<Duration>, tag: Tag) -> Result<(), SocketError> {
        self.read(ReadCondition::ToLength(length), 0, timeout, tag)
    }

    /// 读到首个分隔符为止（结果包含分隔符）。
    pub fn read_to_delimiter(
        &self,
        delimiter: impl Into<Bytes>,
        max_length: usize,
        timeout: Option<Duration>,
        tag: Tag,
    ) -> Result<(), SocketError> {
        self.read(ReadCondition::ToDelimiter(delimiter.into()), max_length, timeout, tag)
    }

    /// 读取当前可用的字节。
    pub fn read_available(&self, max_length: usize, timeout: Option<Duration>, tag: Tag) -> Result<(), SocketError> {
        self.read(ReadCondition::Available, max_length, timeout, tag)
    }

    /// 写出全部字节；空数据以 [`SocketError::BadParam`] 拒绝。
    pub fn write(&self, data: impl Into<Bytes>, timeout: Option<Duration>, tag: Tag) -> Result<(), SocketError> {
        let data = data.into();
        if data.is_empty() {
            return Err(SocketError::BadParam("write data must not be empty".into()));
        }
        self.send(Command::Write {
            data,
            deadline: deadline(timeout),
            tag,
        })
    }

    /// 请求 TLS 升级；在此之前入队的读写全部完成后才开始握手。
    pub fn start_tls(&self, settings: TlsSettings) -> Result<(), SocketError> {
        settings.validate()?;
        self.send(Command::StartTls(Box::new(settings)))
    }

    /// 立即断开，所有挂起操作以 `ConnectionClosed` 失败。
    pub fn disconnect(&self) {
        self.request_disconnect(DisconnectMode::Now);
    }

    /// 已入队的读全部完成后断开；之后新的读被拒绝。
    pub fn disconnect_after_reading(&self) {
        self.request_disconnect(DisconnectMode::AfterReading);
    }

    /// 已入队的写全部完成后断开；之后新的写被拒绝。
    pub fn disconnect_after_writing(&self) {
        self.request_disconnect(DisconnectMode::AfterWriting);
    }

    pub fn disconnect_after_reading_and_writing(&self) {
        self.request_disconnect(DisconnectMode::AfterReadingAndWriting);
    }

    fn request_disconnect(&self, mode: DisconnectMode) {
        // 已经断开的套接字上再次断开没有效果。
        let _ = self.send(Command::Disconnect(mode));
    }

    pub fn state(&self) -> SocketState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.borrow().phase
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.borrow().local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.borrow().peer
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.phase() == ConnectionPhase::Disconnected
    }

    pub fn is_ipv4(&self) -> bool {
        self.peer_addr().is_some_and(|peer| peer.is_ipv4())
    }

    pub fn is_ipv6(&self) -> bool {
        self.peer_addr().is_some_and(|peer| peer.is_ipv6())
    }

    pub fn is_secure(&self) -> bool {
        self.state.borrow().secure
    }

    /// 主动建连时使用的主机名。
    pub fn connected_host(&self) -> Option<String> {
        self.state.borrow().host.clone()
    }

    /// 等待套接字进入 `Disconnected`。
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // 驱动任务异常退出时发送端被丢弃，同样视为已关闭。
        let _ = state
            .wait_for(|snapshot| snapshot.phase == ConnectionPhase::Disconnected)
            .await;
    }
}

impl fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

fn ensure_runtime() -> Result<(), SocketError> {
    Handle::try_current()
        .map(|_| ())
        .map_err(|_| SocketError::BadConfig("sockets must be created inside a tokio runtime".into()))
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout
        .filter(|timeout| !timeout.is_zero())
        .map(|timeout| Instant::now() + timeout)
}
