use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use futures::future::select_all;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::TcpListener, runtime::Handle};
use tracing::debug;

use crate::{
    config::{ListenConfig, SocketConfig},
    error::{ACCEPT, BIND, SocketError, map_io_error},
    event::SocketEvents,
    socket::AsyncSocket,
};

const LISTEN_BACKLOG: i32 = 1024;

/// 按地址族监听并接受入站连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 双栈服务端需要同时监听 IPv4 与 IPv6；IPv6 监听器开启 `IPV6_V6ONLY`，避免与 IPv4
///   监听器争抢映射地址，两者彼此独立；
/// - 接受到的连接直接交给新的驱动任务，继承监听器的 [`SocketConfig`]。
///
/// ## 逻辑 (How)
/// - `bind`：按 [`ListenConfig`] 计算每个启用地址族的绑定地址，使用 `socket2` 设置
///   `SO_REUSEADDR`、v6-only 与非阻塞后绑定，再交给 Tokio；端口为 0 时第二个地址族复用第一次
///   绑定得到的端口；
/// - `accept`：同时等待所有监听器，先就绪者返回，其余等待被丢弃（Tokio 的 `accept` 可安全取消）。
///
/// ## 契约 (What)
/// - 必须在 Tokio 运行时内调用 `bind`；
/// - `close` 之后 `accept` 返回 [`SocketError::ConnectionClosed`]；丢弃监听器即停止接受。
#[derive(Debug)]
pub struct SocketListener {
    listeners: Vec<TcpListener>,
    local_addrs: Vec<SocketAddr>,
    config: SocketConfig,
}

impl SocketListener {
    pub fn bind(listen: ListenConfig, config: SocketConfig) -> Result<Self, SocketError> {
        config.validate()?;
        Handle::try_current().map_err(|_| {
            SocketError::BadConfig("listeners must be bound inside a tokio runtime".into())
        })?;

        let mut port = listen.port();
        let mut listeners = Vec::new();
        let mut local_addrs = Vec::new();
        for ip in interface_addresses(listen.interface(), &config)? {
            let listener = bind_one(SocketAddr::new(ip, port))?;
            let local = listener
                .local_addr()
                .map_err(|err| map_io_error(BIND, err))?;
            if port == 0 {
                port = local.port();
            }
            debug!(%local, "listening");
            listeners.push(listener);
            local_addrs.push(local);
        }
        Ok(Self {
            listeners,
            local_addrs,
            config,
        })
    }

    /// 实际绑定的地址，每个地址族一个。
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// 接受下一个入站连接。
    pub async fn accept(&self) -> Result<(AsyncSocket, SocketEvents), SocketError> {
        if self.listeners.is_empty() {
            return Err(SocketError::ConnectionClosed);
        }
        let pending = self
            .listeners
            .iter()
            .map(|listener| Box::pin(listener.accept()));
        let (result, _, _) = select_all(pending).await;
        let (stream, peer) = result.map_err(|err| map_io_error(ACCEPT, err))?;
        debug!(%peer, "connection accepted");
        Ok(AsyncSocket::accepted(stream, self.config.clone()))
    }

    /// 停止监听并关闭所有监听描述符。
    pub fn close(&mut self) {
        for local in self.local_addrs.drain(..) {
            debug!(%local, "listener closed");
        }
        self.listeners.clear();
    }
}

/// 计算需要绑定的地址：未指定接口时监听全部接口，回环别名映射到两个回环地址。
fn interface_addresses(interface: Option<&str>, config: &SocketConfig) -> Result<Vec<IpAddr>, SocketError> {
    let (v4, v6) = match interface {
        None => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        Some("localhost" | "loopback") => (IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)),
        Some(raw) => {
            let ip: IpAddr = raw
                .parse()
                .map_err(|_| SocketError::BadParam(format!("unsupported listen interface `{raw}`")))?;
            if !config.allows(&SocketAddr::new(ip, 0)) {
                return Err(SocketError::BadConfig(format!(
                    "interface {ip} belongs to a disabled address family"
                )));
            }
            return Ok(vec![ip]);
        }
    };
    let mut addresses = Vec::with_capacity(2);
    if config.ipv4_enabled() {
        addresses.push(v4);
    }
    if config.ipv6_enabled() {
        addresses.push(v6);
    }
    Ok(addresses)
}

fn bind_one(address: SocketAddr) -> Result<TcpListener, SocketError> {
    let bind_error = |err| map_io_error(BIND, err);
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    if address.is_ipv6() {
        socket.set_only_v6(true).map_err(bind_error)?;
    }
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&address.into()).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
    TcpListener::from_std(socket.into()).map_err(bind_error)
}
