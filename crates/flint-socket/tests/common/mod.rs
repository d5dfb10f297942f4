//! 集成测试共享的夹具：日志初始化、事件等待与一次性 TLS 身份。
//!
//! # 教案式说明
//! - **意图（Why）**：每个用例都需要“建立一对连接 → 等待某类事件”，集中在这里避免各测试
//!   文件重复拼装监听器与超时逻辑；
//! - **契约（What）**：所有等待都带 10 秒上限，超时以 `anyhow` 错误返回而不是挂死测试进程；
//! - **权衡（Trade-offs）**：部分测试文件只用到其中几个函数，因此整体放开 `dead_code`。
#![allow(dead_code)]

use std::{sync::Once, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use flint_socket::{
    AsyncSocket, ListenConfig, SocketConfig, SocketError, SocketEvent, SocketEvents,
    SocketListener, TlsIdentity,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(10);

/// 按 `RUST_LOG` 安装 fmt 订阅者，重复调用无副作用。
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// 主机是否具备 IPv6 回环；不具备时相关用例直接跳过。
pub fn ipv6_available() -> bool {
    std::net::TcpListener::bind("[::1]:0").is_ok()
}

pub struct Endpoint {
    pub socket: AsyncSocket,
    pub events: SocketEvents,
}

/// 在 `127.0.0.1` 上建立一对已连接的套接字：`(客户端, 服务端)`。
pub async fn connected_pair() -> Result<(Endpoint, Endpoint)> {
    let listener = SocketListener::bind(
        ListenConfig::new(0).with_interface("127.0.0.1"),
        SocketConfig::new(),
    )?;
    let address = listener
        .local_addrs()
        .first()
        .copied()
        .context("监听器没有绑定地址")?;
    let (client, mut client_events) =
        AsyncSocket::connect_addr(address, SocketConfig::new().with_nodelay(true))?;
    let (server, server_events) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .context("等待入站连接超时")??;
    wait_for(&mut client_events, |event| matches!(event, SocketEvent::Connected { .. })).await?;
    Ok((
        Endpoint {
            socket: client,
            events: client_events,
        },
        Endpoint {
            socket: server,
            events: server_events,
        },
    ))
}

pub async fn next_event(events: &mut SocketEvents) -> Result<SocketEvent> {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .context("等待事件超时")?
        .ok_or_else(|| anyhow!("事件通道已关闭"))
}

/// 跳过无关事件直到 `matches` 命中；中途断开或出现操作失败视为测试失败。
pub async fn wait_for<F>(events: &mut SocketEvents, mut matches: F) -> Result<SocketEvent>
where
    F: FnMut(&SocketEvent) -> bool,
{
    loop {
        let event = next_event(events).await?;
        if matches(&event) {
            return Ok(event);
        }
        match event {
            SocketEvent::Disconnected { cause } => bail!("连接提前断开: {cause:?}"),
            SocketEvent::ReadFailed { tag, error } | SocketEvent::WriteFailed { tag, error } => {
                bail!("操作 {tag} 意外失败: {error}")
            }
            _ => {}
        }
    }
}

pub async fn expect_read(events: &mut SocketEvents, tag: u64) -> Result<Bytes> {
    match wait_for(events, |event| {
        matches!(event, SocketEvent::ReadCompleted { tag: done, .. } if *done == tag)
    })
    .await?
    {
        SocketEvent::ReadCompleted { data, .. } => Ok(data),
        other => bail!("意外事件: {other:?}"),
    }
}

pub async fn expect_write(events: &mut SocketEvents, tag: u64) -> Result<()> {
    wait_for(events, |event| {
        matches!(event, SocketEvent::WriteCompleted { tag: done } if *done == tag)
    })
    .await
    .map(drop)
}

pub async fn expect_secured(events: &mut SocketEvents) -> Result<()> {
    wait_for(events, |event| matches!(event, SocketEvent::Secured { .. }))
        .await
        .map(drop)
}

/// 收集直到 `Disconnected` 为止的全部事件，返回终止原因与之前的事件。
pub async fn drain_until_disconnected(
    events: &mut SocketEvents,
) -> Result<(Option<SocketError>, Vec<SocketEvent>)> {
    let mut seen = Vec::new();
    loop {
        match next_event(events).await? {
            SocketEvent::Disconnected { cause } => return Ok((cause, seen)),
            other => seen.push(other),
        }
    }
}

/// 为 `localhost` 生成一次性自签名身份，返回根证书与身份。
pub fn self_signed_identity() -> Result<(CertificateDer<'static>, TlsIdentity)> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])?;
    let der = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((der.clone(), TlsIdentity::new(vec![der], key)))
}

/// 客户端认证夹具：一次性 CA、由它签发的客户端证书，以及对应的客户端身份。
pub struct ClientIdentity {
    pub ca: CertificateDer<'static>,
    pub cert: CertificateDer<'static>,
    pub identity: TlsIdentity,
}

/// 生成一次性 CA 并签发带 `clientAuth` 用途的客户端证书。
pub fn issue_client_identity() -> Result<ClientIdentity> {
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
        KeyUsagePurpose,
    };

    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name.push(DnType::CommonName, "flint test ca");
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let client_key = KeyPair::generate()?;
    let mut client_params = CertificateParams::new(vec!["client.flint.test".to_owned()])?;
    client_params.distinguished_name.push(DnType::CommonName, "flint test client");
    client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key)?;

    let cert = client_cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(client_key.serialize_der()));
    Ok(ClientIdentity {
        ca: ca_cert.der().clone(),
        cert: cert.clone(),
        identity: TlsIdentity::new(vec![cert], key),
    })
}
