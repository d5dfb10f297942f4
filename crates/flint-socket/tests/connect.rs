//! 建连路径：主机名竞速、单栈服务端、失败汇总、接管描述符与句柄丢弃。

mod common;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use flint_socket::{
    AsyncSocket, ConnectionPhase, ListenConfig, SocketConfig, SocketError, SocketEvent,
    SocketListener,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{WAIT, drain_until_disconnected, init_tracing, ipv6_available, wait_for};

#[tokio::test(flavor = "multi_thread")]
async fn hostname_connect_reaches_loopback_listener() -> Result<()> {
    init_tracing();
    let config = SocketConfig::new().with_ipv6_enabled(ipv6_available());
    let listener = SocketListener::bind(ListenConfig::new(0).with_interface("localhost"), config.clone())?;
    let port = listener.local_addrs()[0].port();
    assert!(
        listener.local_addrs().iter().all(|local| local.port() == port),
        "两个地址族应共享同一端口"
    );

    let (client, mut events) = AsyncSocket::connect("localhost", port, config)?;
    let (_server, _server_events) = tokio::time::timeout(WAIT, listener.accept()).await??;
    match wait_for(&mut events, |event| matches!(event, SocketEvent::Connected { .. })).await? {
        SocketEvent::Connected { peer, .. } => assert_eq!(peer.port(), port),
        other => bail!("意外事件: {other:?}"),
    }
    assert!(client.is_connected());
    assert_eq!(client.connected_host().as_deref(), Some("localhost"));
    assert!(client.is_ipv4() ^ client.is_ipv6());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dual_stack_client_reaches_ipv6_only_server() -> Result<()> {
    init_tracing();
    if !ipv6_available() {
        return Ok(());
    }
    let resolved: Vec<_> = tokio::net::lookup_host(("localhost", 0)).await?.collect();
    if !resolved.iter().any(|address| address.is_ipv6()) {
        // `localhost` 未解析出 IPv6 地址的主机上无法构造该场景。
        return Ok(());
    }

    let listener = SocketListener::bind(ListenConfig::new(0).with_interface("::1"), SocketConfig::new())?;
    let port = listener.local_addrs()[0].port();
    let (client, mut events) = AsyncSocket::connect(
        "localhost",
        port,
        SocketConfig::new().with_connect_timeout(Some(Duration::from_secs(5))),
    )?;
    let (server, _server_events) = tokio::time::timeout(WAIT, listener.accept()).await??;
    wait_for(&mut events, |event| matches!(event, SocketEvent::Connected { .. })).await?;
    assert!(client.is_ipv6(), "只有 IPv6 候选能连上");
    assert!(server.is_ipv6());
    Ok(())
}

/// 连接到单栈监听器未覆盖的地址族，断言以 `ConnectionFailed` 结束。
async fn expect_refused(address: std::net::SocketAddr) -> Result<()> {
    let (_client, mut events) = AsyncSocket::connect_addr(address, SocketConfig::new())?;
    let (cause, _) = drain_until_disconnected(&mut events).await?;
    match cause {
        Some(SocketError::ConnectionFailed { attempts, .. }) => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].address, Some(address));
            Ok(())
        }
        other => bail!("{address} 期望 ConnectionFailed，实际为 {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn ipv6_only_listener_rejects_ipv4_clients() -> Result<()> {
    init_tracing();
    if !ipv6_available() {
        return Ok(());
    }
    let listener = SocketListener::bind(
        ListenConfig::new(0).with_interface("localhost"),
        SocketConfig::new().with_ipv4_enabled(false),
    )?;
    assert_eq!(listener.local_addrs().len(), 1, "只应绑定 IPv6 回环");
    let local = listener.local_addrs()[0];
    assert!(local.is_ipv6());

    let (client, mut events) = AsyncSocket::connect_addr(local, SocketConfig::new())?;
    let (server, _server_events) = tokio::time::timeout(WAIT, listener.accept()).await??;
    wait_for(&mut events, |event| matches!(event, SocketEvent::Connected { .. })).await?;
    assert!(server.is_ipv6(), "接受到的连接必须来自 IPv6");
    assert!(client.is_ipv6());

    expect_refused(([127, 0, 0, 1], local.port()).into()).await
}

#[tokio::test(flavor = "multi_thread")]
async fn ipv4_only_listener_rejects_ipv6_clients() -> Result<()> {
    init_tracing();
    let listener = SocketListener::bind(
        ListenConfig::new(0).with_interface("localhost"),
        SocketConfig::new().with_ipv6_enabled(false),
    )?;
    assert_eq!(listener.local_addrs().len(), 1, "只应绑定 IPv4 回环");
    let port = listener.local_addrs()[0].port();

    // 客户端按本机能力启用双栈，竞速只有 IPv4 一侧能连上。
    let (client, mut events) = AsyncSocket::connect(
        "localhost",
        port,
        SocketConfig::new()
            .with_ipv6_enabled(ipv6_available())
            .with_connect_timeout(Some(Duration::from_secs(5))),
    )?;
    let (server, _server_events) = tokio::time::timeout(WAIT, listener.accept()).await??;
    wait_for(&mut events, |event| matches!(event, SocketEvent::Connected { .. })).await?;
    assert!(server.is_ipv4(), "接受到的连接必须来自 IPv4");
    assert!(client.is_ipv4());

    if ipv6_available() {
        expect_refused((std::net::Ipv6Addr::LOCALHOST, port).into()).await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connect_fails_queued_operations_then_disconnects() -> Result<()> {
    init_tracing();
    let refused = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let (client, mut events) = AsyncSocket::connect_addr(refused, SocketConfig::new())?;
    // 建连极快失败时驱动可能已经结束，此时入队同步返回 ConnectionClosed。
    let queued = client.read_to_length(4, None, 1).is_ok();

    let (cause, seen) = drain_until_disconnected(&mut events).await?;
    match cause {
        Some(SocketError::ConnectionFailed { attempts, .. }) => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].address, Some(refused));
        }
        other => bail!("期望 ConnectionFailed，实际为 {other:?}"),
    }
    if queued {
        assert!(matches!(
            seen.as_slice(),
            [SocketEvent::ReadFailed {
                tag: 1,
                error: SocketError::ConnectionClosed
            }]
        ));
    }
    client.closed().await;
    assert_eq!(client.phase(), ConnectionPhase::Disconnected);
    assert!(matches!(client.write(&b"late"[..], None, 2), Err(SocketError::ConnectionClosed)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unresolvable_host_reports_resolution_failure() -> Result<()> {
    init_tracing();
    let (_client, mut events) = AsyncSocket::connect("flint.invalid", 80, SocketConfig::new())?;
    let (cause, _) = drain_until_disconnected(&mut events).await?;
    match cause {
        Some(SocketError::ConnectionFailed { host, .. }) => assert_eq!(host, "flint.invalid"),
        other => bail!("期望 ConnectionFailed，实际为 {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn attached_descriptor_announces_connected_and_writes() -> Result<()> {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let std_stream = std::net::TcpStream::connect(address)?;
    let (mut raw, _) = listener.accept().await?;

    let (socket, mut events) = AsyncSocket::from_std(std_stream, SocketConfig::new())?;
    match common::next_event(&mut events).await? {
        SocketEvent::Connected { peer, .. } => assert_eq!(peer, address),
        other => bail!("第一个事件应为 Connected，实际为 {other:?}"),
    }
    socket.write(&b"ping"[..], None, 7)?;
    common::expect_write(&mut events, 7).await?;

    let mut buffer = [0u8; 4];
    raw.read_exact(&mut buffer).await?;
    assert_eq!(&buffer, b"ping");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn accepted_socket_emits_no_connected_event() -> Result<()> {
    init_tracing();
    let (client, mut server) = common::connected_pair().await?;
    client.socket.write(&b"hello"[..], None, 1)?;
    server.socket.read_to_length(5, None, 2)?;
    match common::next_event(&mut server.events).await? {
        SocketEvent::ReadCompleted { data, tag: 2 } => assert_eq!(&data[..], b"hello"),
        other => bail!("被动连接的第一个事件应为读完成，实际为 {other:?}"),
    }
    assert!(server.socket.is_connected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_every_handle_flushes_writes_then_disconnects() -> Result<()> {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let (client, _events) = AsyncSocket::connect_addr(listener.local_addr()?, SocketConfig::new())?;
    let (mut raw, _) = listener.accept().await?;

    let payload = vec![0x5Au8; 256 * 1024];
    client.write(payload.clone(), None, 1)?;
    drop(client);

    let mut received = Vec::new();
    tokio::time::timeout(WAIT, raw.read_to_end(&mut received))
        .await
        .context("等待对端关闭超时")??;
    assert_eq!(received, payload, "句柄丢弃前入队的写必须全部送达");
    raw.shutdown().await.ok();
    Ok(())
}

#[tokio::test]
async fn connected_host_is_absent_for_address_connects() -> Result<()> {
    let (client, _events) = AsyncSocket::connect_addr("127.0.0.1:9".parse()?, SocketConfig::new())?;
    assert_eq!(client.connected_host(), None);
    client.disconnect();
    Ok(())
}
