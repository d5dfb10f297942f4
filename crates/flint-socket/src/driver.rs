//! 每个套接字一个的驱动任务：套接字状态的唯一所有者与串行执行域。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 套接字的全部可变状态（操作队列、缓冲、TLS 会话、超时表）只在这一个任务里被访问，
//!   句柄通过无界命令通道与之交互，入队永不阻塞，也不需要任何锁；
//! - 失败一律是连接级的：任何错误都走同一条拆除路径，保证“每个被接受的操作恰好一个
//!   完成或失败事件，`Disconnected` 最后到达”。
//!
//! ## 逻辑 (How)
//! - 建连阶段：一边等待建连结果，一边把期间到达的命令暂存；建连成功后按原顺序重放；
//! - 主循环以 `tokio::select!`（biased）依次关注：命令、信任结论、最早的截止时间、
//!   可读就绪、可写就绪；读写兴趣按背压与握手状态动态开关；
//! - 每次唤醒后调用 `make_progress`：推进读队列、推进写队列、在屏障就绪时开始 TLS 握手、
//!   检查延迟断开条件与对端关闭后的半开状态；
//! - 拆除：尽力发送 `close_notify`/告警 → 按 FIFO 失败全部挂起操作 → 清空超时 →
//!   从反应器注销并关闭描述符 → 关闭命令通道并发布 `Disconnected` 快照 → 失败仍在通道里的
//!   命令 → 最后推送 `Disconnected` 事件。
//!
//! ## 契约 (What)
//! - 触发失败的操作拿到具体原因，其余操作拿到 `ConnectionClosed`，`TlsFailure` 例外地广播；
//! - 所有句柄被丢弃等价于 `disconnect_after_writing`；
//! - 对端关闭后，缓冲中尚未交付的字节不会丢失：连接保持半开，直到缓冲耗尽或出现缓冲
//!   无法满足的读。

use std::{future::Future, io};

use bytes::Bytes;
use flint_buffer::ByteBuffer;
use futures::future::OptionFuture;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    time::Instant,
};
use tracing::{debug, trace, warn};

use crate::{
    config::SocketConfig,
    error::{Direction, OperationKind, READ, SocketError, WRITE, map_io_error},
    establish,
    event::{ConnectionPhase, SocketEvent, SocketState},
    queue::{OpId, OperationQueue, ReadCondition, ReadEvent, Tag, WriteEvent, WriteSink},
    reactor::ReactorBinding,
    timeout::TimeoutManager,
    tls::{PeerCredential, TlsProgress, TlsSession, TlsSettings, TrustDecision, TrustEvaluator, TrustRequest},
};

/// 句柄发给驱动任务的命令；截止时间在入队时计算。
#[derive(Debug)]
pub(crate) enum Command {
    Read {
        condition: ReadCondition,
        max_length: usize,
        deadline: Option<Instant>,
        tag: Tag,
    },
    Write {
        data: Bytes,
        deadline: Option<Instant>,
        tag: Tag,
    },
    StartTls(Box<TlsSettings>),
    Disconnect(DisconnectMode),
}

/// 断开方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DisconnectMode {
    Now,
    AfterReading,
    AfterWriting,
    AfterReadingAndWriting,
}

impl DisconnectMode {
    fn reading(self) -> bool {
        matches!(self, Self::AfterReading | Self::AfterReadingAndWriting)
    }

    fn writing(self) -> bool {
        matches!(self, Self::AfterWriting | Self::AfterReadingAndWriting)
    }

    /// 叠加两次断开请求：`Now` 优先，其余按方向取并集。
    fn merge(self, other: Self) -> Self {
        if self == Self::Now || other == Self::Now {
            return Self::Now;
        }
        match (self.reading() || other.reading(), self.writing() || other.writing()) {
            (true, true) => Self::AfterReadingAndWriting,
            (true, false) => Self::AfterReading,
            _ => Self::AfterWriting,
        }
    }
}

/// 驱动任务的连接来源。
#[derive(Debug)]
pub(crate) enum Origin {
    Resolve { host: String, port: u16 },
    Address(std::net::SocketAddr),
    /// 已连接的描述符；`announce` 决定是否推送 `Connected`。
    Attached { stream: TcpStream, announce: bool },
}

impl Origin {
    pub(crate) fn host(&self) -> Option<String> {
        match self {
            Origin::Resolve { host, .. } => Some(host.clone()),
            _ => None,
        }
    }

    /// 驱动任务启动前发布的初始快照；已连接的描述符直接处于 `Connected`。
    pub(crate) fn initial_state(&self) -> SocketState {
        let mut state = SocketState::connecting(self.host());
        if let Origin::Attached { stream, .. } = self {
            state.phase = ConnectionPhase::Connected;
            state.local = stream.local_addr().ok();
            state.peer = stream.peer_addr().ok();
        }
        state
    }

    /// 用作 tracing span 字段的目标描述。
    pub(crate) fn label(&self) -> String {
        match self {
            Origin::Resolve { host, port } => format!("{host}:{port}"),
            Origin::Address(address) => address.to_string(),
            Origin::Attached { stream, .. } => stream
                .peer_addr()
                .map(|peer| peer.to_string())
                .unwrap_or_else(|_| "unconnected".to_owned()),
        }
    }
}

/// 结束主循环的原因。
#[derive(Debug)]
enum Shutdown {
    /// 本端有序断开。
    Local,
    Failed {
        cause: SocketError,
        /// 直接触发失败、应当拿到具体原因的操作。
        trigger: Option<OpId>,
    },
}

impl Shutdown {
    fn failed(cause: SocketError, trigger: Option<OpId>) -> Self {
        Shutdown::Failed { cause, trigger }
    }
}

enum Wake {
    Command(Option<Command>),
    Trust(Option<Result<TrustDecision, oneshot::error::RecvError>>),
    Deadline,
    Readable(io::Result<()>),
    Writable(io::Result<()>),
    Idle,
}

/// 明文写路径：字节直接交给内核，交出即落地。
struct PlainSink<'a> {
    binding: &'a ReactorBinding,
}

impl WriteSink for PlainSink<'_> {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.binding.try_write(data)
    }

    fn commit_mark(&self) -> u64 {
        0
    }

    fn is_flushed(&self, _mark: u64) -> bool {
        true
    }
}

/// 任务入口：建连（如需要）后进入主循环，结束时完成拆除。
pub(crate) async fn run(
    origin: Origin,
    config: SocketConfig,
    mut commands: UnboundedReceiver<Command>,
    events: UnboundedSender<SocketEvent>,
    state: watch::Sender<SocketState>,
) {
    let host = origin.host();
    let (stream, announce, backlog) = match origin {
        Origin::Attached { stream, announce } => (Ok(stream), announce, Vec::new()),
        Origin::Resolve { host, port } => {
            let (stream, backlog) =
                await_connect(establish::connect(&host, port, &config), &mut commands).await;
            (stream, true, backlog)
        }
        Origin::Address(address) => {
            let (stream, backlog) =
                await_connect(establish::connect_addr(address, &config), &mut commands).await;
            (stream, true, backlog)
        }
    };

    let binding = stream.and_then(|stream| ReactorBinding::new(stream, &config).map_err(Some));
    let binding = match binding {
        Ok(binding) => binding,
        Err(cause) => {
            abandon(commands, backlog, &events, &state, cause);
            return;
        }
    };

    let (local, peer) = (binding.local_addr(), binding.peer_addr());
    state.send_modify(|snapshot| {
        snapshot.phase = ConnectionPhase::Connected;
        snapshot.local = Some(local);
        snapshot.peer = Some(peer);
    });
    debug!(%local, %peer, "socket connected");
    if announce {
        let _ = events.send(SocketEvent::Connected { local, peer });
    }

    let mut driver = Driver::new(binding, config, host, commands, events, state);
    let shutdown = match driver.replay(backlog) {
        Ok(()) => driver.serve().await,
        Err(shutdown) => shutdown,
    };
    driver.teardown(shutdown);
}

/// 等待建连，期间到达的命令按序暂存；`Err(None)` 表示建连被本端取消。
///
/// 句柄在建连期间全部被丢弃时继续建连，由主循环按 `disconnect_after_writing` 收尾。
async fn await_connect<F>(
    connecting: F,
    commands: &mut UnboundedReceiver<Command>,
) -> (Result<TcpStream, Option<SocketError>>, Vec<Command>)
where
    F: Future<Output = Result<(TcpStream, std::net::SocketAddr), SocketError>>,
{
    let mut backlog = Vec::new();
    let mut listening = true;
    tokio::pin!(connecting);
    loop {
        tokio::select! {
            biased;
            command = commands.recv(), if listening => match command {
                Some(Command::Disconnect(DisconnectMode::Now)) => {
                    debug!("connect cancelled before completion");
                    return (Err(None), backlog);
                }
                Some(command) => backlog.push(command),
                None => listening = false,
            },
            result = &mut connecting => {
                return match result {
                    Ok((stream, _)) => (Ok(stream), backlog),
                    Err(error) => {
                        debug!(error = %error, "connect failed");
                        (Err(Some(error)), backlog)
                    }
                };
            }
        }
    }
}

/// 从未进入主循环的套接字的收尾：失败暂存与残留的命令，推送最终事件。
fn abandon(
    mut commands: UnboundedReceiver<Command>,
    backlog: Vec<Command>,
    events: &UnboundedSender<SocketEvent>,
    state: &watch::Sender<SocketState>,
    cause: Option<SocketError>,
) {
    commands.close();
    state.send_modify(|snapshot| snapshot.phase = ConnectionPhase::Disconnected);
    let mut leftovers = backlog;
    while let Ok(command) = commands.try_recv() {
        leftovers.push(command);
    }
    for command in leftovers {
        reject(events, command);
    }
    let _ = events.send(SocketEvent::Disconnected { cause });
}

/// 以 `ConnectionClosed` 失败一条未被接受的读写命令。
fn reject(events: &UnboundedSender<SocketEvent>, command: Command) {
    let event = match command {
        Command::Read { tag, .. } => SocketEvent::ReadFailed {
            tag,
            error: SocketError::ConnectionClosed,
        },
        Command::Write { tag, .. } => SocketEvent::WriteFailed {
            tag,
            error: SocketError::ConnectionClosed,
        },
        Command::StartTls(_) | Command::Disconnect(_) => return,
    };
    let _ = events.send(event);
}

struct Driver {
    binding: ReactorBinding,
    config: SocketConfig,
    host: Option<String>,
    queue: OperationQueue,
    timeouts: TimeoutManager,
    inbound: ByteBuffer,
    tls: Option<TlsSession>,
    upgrade: Option<Box<TlsSettings>>,
    evaluator: Option<std::sync::Arc<dyn TrustEvaluator>>,
    trust_rx: Option<oneshot::Receiver<TrustDecision>>,
    close_mode: Option<DisconnectMode>,
    accepting: bool,
    eof: bool,
    commands: UnboundedReceiver<Command>,
    events: UnboundedSender<SocketEvent>,
    state: watch::Sender<SocketState>,
}

impl Driver {
    fn new(
        binding: ReactorBinding,
        config: SocketConfig,
        host: Option<String>,
        commands: UnboundedReceiver<Command>,
        events: UnboundedSender<SocketEvent>,
        state: watch::Sender<SocketState>,
    ) -> Self {
        let threshold = config.tuning().buffer_shrink_threshold;
        Self {
            binding,
            config,
            host,
            queue: OperationQueue::new(),
            timeouts: TimeoutManager::new(),
            inbound: ByteBuffer::new().with_shrink_threshold(threshold),
            tls: None,
            upgrade: None,
            evaluator: None,
            trust_rx: None,
            close_mode: None,
            accepting: true,
            eof: false,
            commands,
            events,
            state,
        }
    }

    fn emit(&self, event: SocketEvent) {
        // 接收端被丢弃时事件无人消费，驱动照常运行。
        let _ = self.events.send(event);
    }

    fn emit_failure(&self, direction: Direction, tag: Tag, error: SocketError) {
        self.emit(match direction {
            Direction::Read => SocketEvent::ReadFailed { tag, error },
            Direction::Write => SocketEvent::WriteFailed { tag, error },
        });
    }

    fn replay(&mut self, backlog: Vec<Command>) -> Result<(), Shutdown> {
        for command in backlog {
            self.on_command(command)?;
        }
        self.make_progress(false)
    }

    async fn serve(&mut self) -> Shutdown {
        loop {
            if let Err(shutdown) = self.step().await {
                return shutdown;
            }
        }
    }

    async fn step(&mut self) -> Result<(), Shutdown> {
        let read_interest = self.read_interest();
        let write_interest = self.write_interest();
        let deadline = self.timeouts.next_deadline();
        let trust_waiting = self.trust_rx.is_some();

        let wake = tokio::select! {
            biased;
            command = self.commands.recv(), if self.accepting => Wake::Command(command),
            decision = OptionFuture::from(self.trust_rx.as_mut()), if trust_waiting => Wake::Trust(decision),
            _ = OptionFuture::from(deadline.map(tokio::time::sleep_until)), if deadline.is_some() => Wake::Deadline,
            ready = self.binding.readable(), if read_interest => Wake::Readable(ready),
            ready = self.binding.writable(), if write_interest => Wake::Writable(ready),
            else => Wake::Idle,
        };

        match wake {
            Wake::Command(Some(command)) => self.on_command(command),
            Wake::Command(None) => {
                debug!("all handles dropped, disconnecting after pending writes");
                self.accepting = false;
                self.request_close(DisconnectMode::AfterWriting)
            }
            Wake::Trust(decision) => {
                self.trust_rx = None;
                let decision = match decision {
                    Some(Ok(decision)) => decision,
                    // 应答方被丢弃等价于拒绝。
                    _ => TrustDecision::Reject,
                };
                self.on_trust_decision(decision)
            }
            Wake::Deadline => self.on_deadline(),
            Wake::Readable(Ok(())) => self.on_readable(),
            Wake::Readable(Err(err)) => Err(self.io_failure(READ, err, self.queue.head_read_id())),
            Wake::Writable(Ok(())) => self.make_progress(false),
            Wake::Writable(Err(err)) => Err(self.io_failure(WRITE, err, self.queue.head_write_id())),
            Wake::Idle => {
                debug!("no remaining interest, closing");
                Err(Shutdown::Local)
            }
        }
    }

    fn read_interest(&self) -> bool {
        if self.eof {
            return false;
        }
        let limit = self.config.tuning().read_ahead_limit;
        match &self.tls {
            Some(session) if session.trust_pending() => false,
            Some(session) => {
                session.is_handshaking()
                    || self.queue.has_pending_read()
                    || session.buffered_plaintext() < limit
            }
            None => self.queue.has_pending_read() || self.inbound.available_to_read() < limit,
        }
    }

    fn write_interest(&self) -> bool {
        match &self.tls {
            Some(session) => !session.trust_pending() && session.has_pending_output(),
            None => self.queue.head_write_pending(),
        }
    }

    fn on_command(&mut self, command: Command) -> Result<(), Shutdown> {
        match command {
            Command::Read {
                condition,
                max_length,
                deadline,
                tag,
            } => {
                if self.close_mode.is_some_and(DisconnectMode::reading) {
                    self.emit_failure(Direction::Read, tag, SocketError::ConnectionClosed);
                    return Ok(());
                }
                let id = self.queue.enqueue_read(condition, max_length, tag);
                self.timeouts.schedule(id, deadline);
                trace!(tag, id, "read enqueued");
                self.make_progress(false)
            }
            Command::Write {
                data,
                deadline,
                tag,
            } => {
                if self.close_mode.is_some_and(DisconnectMode::writing) {
                    self.emit_failure(Direction::Write, tag, SocketError::ConnectionClosed);
                    return Ok(());
                }
                let id = self.queue.enqueue_write(data, tag);
                self.timeouts.schedule(id, deadline);
                trace!(tag, id, "write enqueued");
                self.make_progress(false)
            }
            Command::StartTls(settings) => {
                if self.tls.is_some() || self.upgrade.is_some() {
                    warn!("tls upgrade already requested, ignoring");
                    return Ok(());
                }
                debug!(role = ?settings.role(), "tls upgrade queued");
                self.upgrade = Some(settings);
                self.queue.enqueue_upgrade();
                self.make_progress(false)
            }
            Command::Disconnect(mode) => {
                debug!(?mode, "disconnect requested");
                self.request_close(mode)
            }
        }
    }

    fn request_close(&mut self, mode: DisconnectMode) -> Result<(), Shutdown> {
        let mode = match self.close_mode {
            Some(current) => current.merge(mode),
            None => mode,
        };
        self.close_mode = Some(mode);
        self.check_close_mode()
    }

    fn check_close_mode(&self) -> Result<(), Shutdown> {
        let Some(mode) = self.close_mode else {
            return Ok(());
        };
        let reads_done = self.queue.reads_idle();
        let writes_done = self.queue.writes_idle()
            && !self
                .tls
                .as_ref()
                .is_some_and(|session| session.has_pending_output() && !session.trust_pending());
        let done = match mode {
            DisconnectMode::Now => true,
            DisconnectMode::AfterReading => reads_done,
            DisconnectMode::AfterWriting => writes_done,
            DisconnectMode::AfterReadingAndWriting => reads_done && writes_done,
        };
        if done { Err(Shutdown::Local) } else { Ok(()) }
    }

    /// 读写两个方向尽可能推进，并在屏障就绪时开始握手。
    fn make_progress(&mut self, readable_event: bool) -> Result<(), Shutdown> {
        self.pump_reads(readable_event)?;
        self.pump_writes()?;
        if self.queue.upgrade_ready() {
            self.begin_tls()?;
            self.pump_reads(false)?;
            self.pump_writes()?;
        }
        self.check_close_mode()?;
        self.check_eof()
    }

    /// 对端已关闭写方向：仍有缓冲字节且没有无法满足的读时保持半开，否则拆除。
    fn check_eof(&self) -> Result<(), Shutdown> {
        if !self.eof {
            return Ok(());
        }
        let buffered = match &self.tls {
            Some(session) if session.is_handshaking() => 0,
            Some(session) => session.buffered_plaintext(),
            None => self.inbound.available_to_read(),
        };
        if buffered > 0 && !self.queue.has_pending_read() {
            trace!(buffered, "peer closed, serving buffered bytes");
            return Ok(());
        }
        debug!(buffered, "peer closed and no pending read can be satisfied");
        Err(Shutdown::failed(SocketError::ConnectionClosed, None))
    }

    fn pump_reads(&mut self, readable_event: bool) -> Result<(), Shutdown> {
        let source = match self.tls.as_mut() {
            Some(session) => match session.plaintext() {
                Some(plaintext) => plaintext,
                None => return Ok(()),
            },
            None => &mut self.inbound,
        };
        let events = self.queue.advance_reads(source, readable_event);
        for event in events {
            match event {
                ReadEvent::Completed { id, tag, data } => {
                    self.timeouts.cancel(id);
                    trace!(tag, bytes = data.len(), "read completed");
                    self.emit(SocketEvent::ReadCompleted { data, tag });
                }
                ReadEvent::Progress { tag, done } => {
                    self.emit(SocketEvent::ReadProgress { tag, done });
                }
                ReadEvent::Failed { id, tag, error } => {
                    self.timeouts.cancel(id);
                    debug!(tag, error = %error, "read failed");
                    self.emit(SocketEvent::ReadFailed {
                        tag,
                        error: error.clone(),
                    });
                    return Err(Shutdown::failed(error, None));
                }
            }
        }
        Ok(())
    }

    fn pump_writes(&mut self) -> Result<(), Shutdown> {
        loop {
            let trigger = self.queue.head_write_id();
            let binding = &self.binding;
            let (events, flushed) = match self.tls.as_mut() {
                Some(session) => {
                    let events = self
                        .queue
                        .advance_writes(session)
                        .map_err(|err| Shutdown::failed(SocketError::tls(err), None))?;
                    let flushed = session
                        .flush(|data| binding.try_write(data))
                        .map_err(|err| Shutdown::failed(map_io_error(WRITE, err), trigger))?;
                    (events, flushed)
                }
                None => {
                    let events = self
                        .queue
                        .advance_writes(&mut PlainSink { binding })
                        .map_err(|err| Shutdown::failed(map_io_error(WRITE, err), trigger))?;
                    (events, 0)
                }
            };
            for event in events {
                match event {
                    WriteEvent::Completed { id, tag } => {
                        self.timeouts.cancel(id);
                        trace!(tag, "write completed");
                        self.emit(SocketEvent::WriteCompleted { tag });
                    }
                    WriteEvent::Progress { tag, done } => {
                        self.emit(SocketEvent::WriteProgress { tag, done });
                    }
                }
            }
            // 冲刷出密文后，已落地的写操作需要再评估一次才能完成。
            if flushed == 0 {
                return Ok(());
            }
        }
    }

    fn on_readable(&mut self) -> Result<(), Shutdown> {
        let limit = self.config.tuning().read_chunk_size;
        let binding = &self.binding;
        let result = match self.tls.as_mut() {
            Some(session) => session.receive(|buffer, hint| binding.read_into(buffer, hint)),
            None => binding.read_into(&mut self.inbound, limit),
        };
        match result {
            Ok(0) => self.on_eof(),
            Ok(n) => {
                trace!(bytes = n, "socket read");
                if let Some(session) = self.tls.as_mut() {
                    let progress = session.process().map_err(|error| Shutdown::failed(error, None))?;
                    self.apply_tls(progress)?;
                }
                self.make_progress(true)
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(()),
            Err(err) => Err(self.io_failure(READ, err, self.queue.head_read_id())),
        }
    }

    /// 有序关闭：停止读兴趣，已缓冲的字节继续服务之后入队的读。
    fn on_eof(&mut self) -> Result<(), Shutdown> {
        debug!("peer closed the connection");
        self.eof = true;
        self.make_progress(false)
    }

    fn on_deadline(&mut self) -> Result<(), Shutdown> {
        for id in self.timeouts.expired(Instant::now()) {
            if let Some((direction, tag)) = self.queue.remove(id) {
                let error = SocketError::OperationTimedOut { tag, direction };
                debug!(tag, %direction, "operation timed out");
                self.emit_failure(direction, tag, error.clone());
                return Err(Shutdown::failed(error, None));
            }
        }
        Ok(())
    }

    fn io_failure(&self, kind: OperationKind, err: io::Error, trigger: Option<OpId>) -> Shutdown {
        if let Some(pending) = self.binding.take_error() {
            debug!(error = %pending, "pending socket error");
        }
        debug!(operation = kind.message, error = %err, "socket io failed");
        Shutdown::failed(map_io_error(kind, err), trigger)
    }

    fn begin_tls(&mut self) -> Result<(), Shutdown> {
        self.queue.take_upgrade();
        let Some(settings) = self.upgrade.take() else {
            return Ok(());
        };
        let default_peer = match &self.host {
            Some(host) => host.clone(),
            None => self.binding.peer_addr().ip().to_string(),
        };
        let session = TlsSession::new(&settings, &default_peer, *self.config.tuning())
            .map_err(|error| Shutdown::failed(error, None))?;
        self.evaluator = settings.evaluator();
        let session = self.tls.insert(session);
        let progress = session
            .start(self.inbound.readable())
            .map_err(|error| Shutdown::failed(error, None))?;
        self.inbound.clear();
        self.apply_tls(progress)
    }

    fn apply_tls(&mut self, progress: TlsProgress) -> Result<(), Shutdown> {
        if let Some(credential) = progress.trust_request {
            self.request_trust(credential);
        }
        if progress.secured {
            let alpn_protocol = self.tls.as_ref().and_then(TlsSession::negotiated_alpn);
            self.state.send_modify(|snapshot| snapshot.secure = true);
            self.emit(SocketEvent::Secured { alpn_protocol });
        }
        if progress.peer_closed && !self.eof {
            // 调用方随后的 make_progress 负责判断是否还能由已解密的明文服务读操作。
            debug!("peer sent close_notify");
            self.eof = true;
        }
        Ok(())
    }

    fn request_trust(&mut self, credential: PeerCredential) {
        let (tx, rx) = oneshot::channel();
        self.trust_rx = Some(rx);
        match self.evaluator.clone() {
            Some(evaluator) => {
                tokio::spawn(async move {
                    let decision = evaluator.evaluate(credential).await;
                    // 套接字已拆除时结论无人接收。
                    let _ = tx.send(decision);
                });
            }
            None => self.emit(SocketEvent::TrustRequest(TrustRequest::new(credential, tx))),
        }
    }

    fn on_trust_decision(&mut self, decision: TrustDecision) -> Result<(), Shutdown> {
        let Some(session) = self.tls.as_mut() else {
            return Ok(());
        };
        let progress = session
            .resolve_trust(decision)
            .map_err(|error| Shutdown::failed(error, None))?;
        self.apply_tls(progress)?;
        self.make_progress(false)
    }

    fn teardown(self, shutdown: Shutdown) {
        let Driver {
            binding,
            mut queue,
            mut timeouts,
            mut tls,
            mut commands,
            events,
            state,
            ..
        } = self;
        let (cause, trigger) = match shutdown {
            Shutdown::Local => (None, None),
            Shutdown::Failed { cause, trigger } => (Some(cause), trigger),
        };
        debug!(cause = ?cause, "tearing down socket");

        if let Some(session) = tls.as_mut() {
            trace!(tls_state = ?session.state(), "closing tls session");
            session.close(|data| binding.try_write(data));
        }

        for (direction, id, tag) in queue.drain() {
            let error = match &cause {
                Some(cause) if cause.is_broadcast() || trigger == Some(id) => cause.clone(),
                _ => SocketError::ConnectionClosed,
            };
            let _ = events.send(match direction {
                Direction::Read => SocketEvent::ReadFailed { tag, error },
                Direction::Write => SocketEvent::WriteFailed { tag, error },
            });
        }
        timeouts.clear();
        binding.close();
        commands.close();
        state.send_modify(|snapshot| snapshot.phase = ConnectionPhase::Disconnected);
        while let Ok(command) = commands.try_recv() {
            reject(&events, command);
        }
        let _ = events.send(SocketEvent::Disconnected { cause });
    }
}
