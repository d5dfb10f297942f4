//! `flint-socket`：异步非阻塞 TCP 套接字引擎。
//!
//! # 模块定位（Why）
//! - 为需要事件驱动网络、但不想自己管理原始描述符、轮询循环与 TLS 缓冲的客户端和服务端
//!   提供统一的套接字抽象；
//! - 引擎只交付字节流，不实现任何应用层协议，也不实现自己的密码学原语（交给 `rustls`）。
//!
//! # 架构概览（How）
//! - [`AsyncSocket`]：可克隆的句柄，入队读写、请求 TLS 升级与断开；
//! - 每个套接字一个后台驱动任务，独占操作队列、字节缓冲、TLS 会话与超时表；
//! - 建连时对 IPv4/IPv6 候选同时发起连接，先成功者胜出；
//! - [`SocketEvent`] 通过无界通道按发生顺序交付完成、失败与生命周期事件；
//! - [`SocketListener`] 按地址族监听，接受的连接继承监听器配置。
//!
//! # 契约（What）
//! - 每个方向严格 FIFO，任一时刻至多一个读与一个写处于推进状态；
//! - 每个被接受的操作恰好产生一个完成或失败事件，`Disconnected` 是最后一个事件；
//! - TLS 升级以屏障形式生效：之前入队的读写全部完成后才开始握手，屏障处未消费的预读
//!   字节作为握手输入。

mod config;
mod driver;
mod error;
mod establish;
mod event;
mod listener;
mod queue;
mod reactor;
mod socket;
mod timeout;
mod tls;

pub use config::{EngineTuning, ListenConfig, SocketConfig};
pub use error::{AttemptFailure, Direction, SocketError};
pub use event::{ConnectionPhase, SocketEvent, SocketEvents, SocketState};
pub use listener::SocketListener;
pub use queue::{ReadCondition, Tag};
pub use socket::AsyncSocket;
pub use tls::{
    ClientAuthentication, FnTrustEvaluator, PeerCredential, TlsIdentity, TlsRole, TlsSettings,
    TrustDecision, TrustEvaluator, TrustRequest,
};

/// 证书与私钥的 DER 包装类型。
pub use rustls_pki_types as pki_types;
