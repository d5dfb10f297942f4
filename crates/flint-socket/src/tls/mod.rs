//! TLS 会话：在同一个就绪绑定与缓冲层之上驱动 rustls 记录层，实现原地升级。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 升级发生在已有连接上：升级前已交付的明文保持交付，升级屏障到达时尚未消费的预读字节
//!   作为握手输入，既不丢失也不被重新解释；
//! - 不借助异步 TLS 流适配器，而是直接驱动 `read_tls`/`process_new_packets`/`write_tls`，
//!   以便与操作队列共享背压、超时与拆除逻辑。
//!
//! ## 逻辑 (How)
//! - 三块缓冲：`ciphertext_in` 接收套接字密文，`ciphertext_out` 暂存待发送密文，
//!   `plaintext_in` 存放已解密、尚未交付给读操作的明文；
//! - `process` 循环“喂密文 → 处理记录 → 排空明文 → 检查凭据槽位”，直到没有新的密文可喂；
//! - 手动信任时，校验回调只捕获凭据；会话随即进入待决状态：不再冲刷密文、不交付明文、
//!   不宣告 Secured，直到驱动层送回结论；
//! - 写方向实现 [`WriteSink`]：加密后的密文进入 `ciphertext_out`，用累计计数标记“落地”，
//!   写操作在其密文真正写入套接字后才完成。
//!
//! ## 契约 (What)
//! - 状态机：`Idle → Handshaking → Secured → Closed`，`Handshaking`/`Secured` 可进入 `Failed`；
//! - 任一握手或记录层错误返回 [`SocketError::TlsFailure`] 并进入 `Failed`；
//! - 不支持重协商与会话恢复。

mod settings;
mod trust;
mod verifier;

pub use settings::{ClientAuthentication, TlsIdentity, TlsRole, TlsSettings};
pub use trust::{FnTrustEvaluator, PeerCredential, TrustDecision, TrustEvaluator, TrustRequest};

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use flint_buffer::ByteBuffer;
use rustls::{ClientConnection, Connection, ServerConnection};
use rustls_pki_types::ServerName;
use tracing::{debug, trace};

use crate::{config::EngineTuning, error::SocketError, queue::WriteSink};
use trust::CredentialSlot;

/// 单次从 rustls 读取明文的窗口。
const PLAINTEXT_CHUNK: usize = 16 * 1024;

/// TLS 会话状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TlsState {
    Idle,
    Handshaking,
    Secured,
    Closed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrustGate {
    /// 走 rustls 默认链校验。
    Automatic,
    /// 手动信任，尚未收到对端凭据。
    Awaiting,
    /// 凭据已交出，等待结论。
    Pending,
    Accepted,
}

/// 一次推进后需要驱动层处理的变化。
#[derive(Debug, Default)]
pub(crate) struct TlsProgress {
    pub(crate) secured: bool,
    pub(crate) trust_request: Option<PeerCredential>,
    pub(crate) peer_closed: bool,
}

pub(crate) struct TlsSession {
    connection: Connection,
    state: TlsState,
    trust: TrustGate,
    slot: CredentialSlot,
    ciphertext_in: ByteBuffer,
    ciphertext_out: ByteBuffer,
    plaintext_in: ByteBuffer,
    last_read: usize,
    queued: u64,
    flushed: u64,
    tuning: EngineTuning,
}

impl TlsSession {
    /// 按升级参数构造会话；`default_peer` 在未显式指定对端名称时用于 SNI 与主机名校验。
    pub(crate) fn new(
        settings: &TlsSettings,
        default_peer: &str,
        tuning: EngineTuning,
    ) -> Result<Self, SocketError> {
        settings.validate()?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let slot = CredentialSlot::default();
        let connection = match settings.role() {
            TlsRole::Initiator => {
                let config = settings.client_config(provider, &slot)?;
                let name = settings.peer_name().unwrap_or(default_peer).to_owned();
                let server_name = ServerName::try_from(name)
                    .map_err(|err| SocketError::BadConfig(format!("invalid peer name: {err}")))?;
                Connection::Client(
                    ClientConnection::new(config, server_name).map_err(SocketError::tls)?,
                )
            }
            TlsRole::Acceptor => {
                let config = settings.server_config(provider, &slot)?;
                Connection::Server(ServerConnection::new(config).map_err(SocketError::tls)?)
            }
        };
        let buffer = || ByteBuffer::new().with_shrink_threshold(tuning.buffer_shrink_threshold);
        Ok(Self {
            connection,
            state: TlsState::Idle,
            trust: if settings.manual_trust() {
                TrustGate::Awaiting
            } else {
                TrustGate::Automatic
            },
            slot,
            ciphertext_in: buffer(),
            ciphertext_out: buffer(),
            plaintext_in: buffer(),
            last_read: tuning.read_chunk_size.min(tuning.tls_read_max),
            queued: 0,
            flushed: 0,
            tuning,
        })
    }

    /// `Idle → Handshaking`：先把屏障处尚未消费的预读字节交给握手。
    pub(crate) fn start(&mut self, preread: &[u8]) -> Result<TlsProgress, SocketError> {
        self.state = TlsState::Handshaking;
        debug!(preread = preread.len(), "tls handshake started");
        self.ciphertext_in.append(preread);
        self.process()
    }

    pub(crate) fn state(&self) -> TlsState {
        self.state
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.state == TlsState::Handshaking
    }

    pub(crate) fn trust_pending(&self) -> bool {
        self.trust == TrustGate::Pending
    }

    pub(crate) fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        self.connection.alpn_protocol().map(<[u8]>::to_vec)
    }

    /// 下一次读取密文的大小提示：上次读取量加余量，并受上限约束。
    pub(crate) fn read_hint(&self) -> usize {
        (self.last_read + self.tuning.tls_read_margin).min(self.tuning.tls_read_max)
    }

    /// 由调用方把密文读入内部缓冲；`read` 收到缓冲与大小提示。
    pub(crate) fn receive<F>(&mut self, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut ByteBuffer, usize) -> io::Result<usize>,
    {
        let hint = self.read_hint();
        let n = read(&mut self.ciphertext_in, hint)?;
        if n > 0 {
            self.last_read = n;
        }
        Ok(n)
    }

    /// 处理已缓冲的全部密文。
    pub(crate) fn process(&mut self) -> Result<TlsProgress, SocketError> {
        let mut progress = TlsProgress::default();
        if !matches!(self.state, TlsState::Handshaking | TlsState::Secured) {
            return Ok(progress);
        }
        while self.trust != TrustGate::Pending {
            let mut consumed = 0;
            if !self.ciphertext_in.is_empty() {
                consumed = self
                    .connection
                    .read_tls(&mut self.ciphertext_in)
                    .map_err(|err| self.fail(err))?;
            }
            let io_state = match self.connection.process_new_packets() {
                Ok(io_state) => io_state,
                Err(err) => {
                    // 告警记录留在待发送密文里，拆除时尽力发出。
                    if let Err(alert) = self.move_output() {
                        debug!(error = %alert, "failed to queue tls alert");
                    }
                    return Err(self.fail(err));
                }
            };
            if self.drain_plaintext()? || io_state.peer_has_closed() {
                progress.peer_closed = true;
            }
            if self.trust == TrustGate::Awaiting
                && let Some(credential) = self.slot.take()
            {
                debug!(server_name = ?credential.server_name(), "peer credential captured, awaiting trust decision");
                self.trust = TrustGate::Pending;
                progress.trust_request = Some(credential);
            }
            if consumed == 0 || self.ciphertext_in.is_empty() {
                break;
            }
        }
        if self.state == TlsState::Handshaking
            && !self.connection.is_handshaking()
            && self.trust != TrustGate::Pending
        {
            self.state = TlsState::Secured;
            progress.secured = true;
            debug!(alpn = ?self.negotiated_alpn(), "tls session secured");
        }
        Ok(progress)
    }

    /// 送回信任结论；会话已不在待决状态时结论被忽略。
    pub(crate) fn resolve_trust(&mut self, decision: TrustDecision) -> Result<TlsProgress, SocketError> {
        if self.trust != TrustGate::Pending {
            return Ok(TlsProgress::default());
        }
        match decision {
            TrustDecision::Accept => {
                debug!("peer credential accepted");
                self.trust = TrustGate::Accepted;
                self.process()
            }
            TrustDecision::Reject => {
                debug!("peer credential rejected");
                self.state = TlsState::Failed;
                Err(SocketError::TrustRejected)
            }
        }
    }

    /// 可交付给读操作的明文；握手完成前返回 `None`。
    pub(crate) fn plaintext(&mut self) -> Option<&mut ByteBuffer> {
        if self.state == TlsState::Secured {
            Some(&mut self.plaintext_in)
        } else {
            None
        }
    }

    pub(crate) fn buffered_plaintext(&self) -> usize {
        self.plaintext_in.available_to_read()
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.ciphertext_out.is_empty() || self.connection.wants_write()
    }

    /// 把待发送密文交给 `write`，直到写空或 `WouldBlock`；信任待决期间不发送任何字节。
    pub(crate) fn flush<F>(&mut self, mut write: F) -> io::Result<usize>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        if self.trust == TrustGate::Pending {
            return Ok(0);
        }
        self.move_output()?;
        let mut total = 0;
        while !self.ciphertext_out.is_empty() {
            match write(self.ciphertext_out.readable()) {
                Ok(0) => break,
                Ok(n) => {
                    self.ciphertext_out.skip(n).map_err(io::Error::other)?;
                    self.flushed += n as u64;
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        if total > 0 {
            trace!(bytes = total, "ciphertext flushed");
        }
        Ok(total)
    }

    /// 拆除前的收尾：已建立的会话尽力发送 `close_notify`，失败的会话尽力发送告警。
    pub(crate) fn close<F>(&mut self, write: F)
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        match self.state {
            TlsState::Secured => {
                self.connection.send_close_notify();
                self.state = TlsState::Closed;
            }
            TlsState::Failed => {}
            _ => return,
        }
        if let Err(err) = self.flush(write) {
            trace!(error = %err, "best-effort tls shutdown flush failed");
        }
    }

    fn move_output(&mut self) -> io::Result<()> {
        while self.connection.wants_write() {
            let n = self.connection.write_tls(&mut self.ciphertext_out)?;
            if n == 0 {
                break;
            }
            self.queued += n as u64;
        }
        Ok(())
    }

    /// 排空 rustls 内部明文；返回对端是否已发送 `close_notify`。
    fn drain_plaintext(&mut self) -> Result<bool, SocketError> {
        loop {
            let spare = self.plaintext_in.spare(PLAINTEXT_CHUNK);
            match self.connection.reader().read(spare) {
                Ok(0) => return Ok(true),
                Ok(n) => self.plaintext_in.commit(n)?,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    fn fail(&mut self, reason: impl fmt::Display) -> SocketError {
        self.state = TlsState::Failed;
        let error = SocketError::tls(reason);
        debug!(error = %error, "tls session failed");
        error
    }
}

impl WriteSink for TlsSession {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.state != TlsState::Secured
            || self.ciphertext_out.available_to_read() >= self.tuning.tls_outbound_high_water
        {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let window = data.len().min(self.tuning.tls_outbound_high_water);
        let n = self.connection.writer().write(&data[..window])?;
        self.move_output()?;
        Ok(n)
    }

    fn commit_mark(&self) -> u64 {
        self.queued
    }

    fn is_flushed(&self, mark: u64) -> bool {
        self.flushed >= mark
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("state", &self.state)
            .field("trust", &self.trust)
            .field("ciphertext_in", &self.ciphertext_in)
            .field("ciphertext_out", &self.ciphertext_out)
            .field("plaintext_in", &self.plaintext_in)
            .finish_non_exhaustive()
    }
}
