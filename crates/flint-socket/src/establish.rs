//! 建连器：解析主机、按地址族筛选候选地址，并对双栈候选同时发起连接竞速。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 某个地址族整体不可达时（常见于只配置了 IPv6 地址却没有路由的网络），顺序尝试会被
//!   该地址族的连接超时拖住；同时发起、先成功者胜出可以避免这种队首阻塞；
//! - 竞速只由一个仲裁者驱动，尝试之间不共享可变状态。
//!
//! ## 逻辑 (How)
//! - 解析结果按启用的地址族过滤，每个地址族只取第一个地址；
//! - 每个候选对应一个 [`PendingConnectAttempt`]，其连接 future 放进 `FuturesUnordered`；
//! - 第一个成功结果出现后，再以 `now_or_never` 收割同一轮轮询中已经就绪的其他结果，
//!   仅在这些“同时成功”之间用 `prefer_ipv4` 打破平局；
//! - 仲裁结束时丢弃仍在进行的 future，内核描述符随之关闭。
//!
//! ## 契约 (What)
//! - 成功返回胜出的 `TcpStream` 与其地址；
//! - 全部失败、没有可用地址或整体超时都返回 [`SocketError::ConnectionFailed`]，携带每次尝试的原因；
//! - `connect_timeout` 从解析开始计时，解析与竞速共享同一个截止时间。

use std::{future::Future, io, net::SocketAddr};

use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use tokio::{
    net::{TcpSocket, TcpStream},
    time::Instant,
};
use tracing::{debug, trace};

use crate::{
    config::SocketConfig,
    error::{AttemptFailure, SocketError},
};

/// 单个候选地址的尝试状态。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AttemptState {
    Pending,
    Succeeded,
    Failed(String),
    Aborted,
}

/// 竞速中的一次建连尝试。
#[derive(Clone, Debug)]
pub(crate) struct PendingConnectAttempt {
    address: SocketAddr,
    state: AttemptState,
}

/// 每个地址族至多一个候选。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Candidates {
    pub(crate) v4: Option<SocketAddr>,
    pub(crate) v6: Option<SocketAddr>,
}

impl Candidates {
    /// 按启用的地址族过滤解析结果，各取第一个。
    pub(crate) fn select(addresses: impl IntoIterator<Item = SocketAddr>, config: &SocketConfig) -> Self {
        let mut candidates = Self::default();
        for address in addresses {
            match address {
                SocketAddr::V4(_) if config.ipv4_enabled() && candidates.v4.is_none() => {
                    candidates.v4 = Some(address);
                }
                SocketAddr::V6(_) if config.ipv6_enabled() && candidates.v6.is_none() => {
                    candidates.v6 = Some(address);
                }
                _ => {}
            }
        }
        candidates
    }

    fn into_attempts(self) -> Vec<PendingConnectAttempt> {
        [self.v4, self.v6]
            .into_iter()
            .flatten()
            .map(|address| PendingConnectAttempt {
                address,
                state: AttemptState::Pending,
            })
            .collect()
    }
}

/// 解析并竞速建连。
pub(crate) async fn connect(
    host: &str,
    port: u16,
    config: &SocketConfig,
) -> Result<(TcpStream, SocketAddr), SocketError> {
    let deadline = connect_deadline(config);
    let resolved = resolve(host, tokio::net::lookup_host((host, port)), deadline).await?;
    let candidates = Candidates::select(resolved, config);
    debug!(host, port, ?candidates, "resolved connect candidates");
    ConnectArbiter::new(candidates, config.prefer_ipv4(), deadline)
        .run(host)
        .await
}

fn connect_deadline(config: &SocketConfig) -> Option<Instant> {
    config.connect_timeout().map(|timeout| Instant::now() + timeout)
}

/// 在整体截止时间内完成解析；解析失败与超时都记为一次没有地址的尝试。
async fn resolve<F, I>(
    host: &str,
    lookup: F,
    deadline: Option<Instant>,
) -> Result<Vec<SocketAddr>, SocketError>
where
    F: Future<Output = io::Result<I>>,
    I: Iterator<Item = SocketAddr>,
{
    let outcome = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, lookup)
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "resolution timed out"))),
        None => lookup.await,
    };
    match outcome {
        Ok(addresses) => Ok(addresses.collect()),
        Err(err) => {
            debug!(host, error = %err, "host resolution failed");
            Err(SocketError::ConnectionFailed {
                host: host.to_owned(),
                attempts: vec![AttemptFailure {
                    address: None,
                    reason: err.to_string(),
                }],
            })
        }
    }
}

/// 对已解析的单个地址建连，仍受地址族开关与整体超时约束。
pub(crate) async fn connect_addr(
    address: SocketAddr,
    config: &SocketConfig,
) -> Result<(TcpStream, SocketAddr), SocketError> {
    let candidates = Candidates::select([address], config);
    ConnectArbiter::new(candidates, config.prefer_ipv4(), connect_deadline(config))
        .run(&address.ip().to_string())
        .await
}

/// “先成功者胜出、其余中止”的仲裁者。
pub(crate) struct ConnectArbiter {
    attempts: Vec<PendingConnectAttempt>,
    prefer_ipv4: bool,
    deadline: Option<Instant>,
}

impl ConnectArbiter {
    pub(crate) fn new(candidates: Candidates, prefer_ipv4: bool, deadline: Option<Instant>) -> Self {
        Self {
            attempts: candidates.into_attempts(),
            prefer_ipv4,
            deadline,
        }
    }

    pub(crate) async fn run(mut self, host: &str) -> Result<(TcpStream, SocketAddr), SocketError> {
        let mut in_flight = FuturesUnordered::new();
        for (index, attempt) in self.attempts.iter().enumerate() {
            trace!(address = %attempt.address, "connect attempt started");
            in_flight.push(attempt_connect(index, attempt.address));
        }
        loop {
            let next = match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, in_flight.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(host, "connect attempts timed out");
                        self.settle_pending(AttemptState::Failed("timed out".to_owned()));
                        break;
                    }
                },
                None => in_flight.next().await,
            };
            let Some((index, result)) = next else {
                break;
            };
            let stream = match result {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(address = %self.attempts[index].address, error = %err, "connect attempt failed");
                    self.attempts[index].state = AttemptState::Failed(err.to_string());
                    continue;
                }
            };

            let mut winners = vec![(index, stream)];
            while let Some(Some((other, result))) = in_flight.next().now_or_never() {
                match result {
                    Ok(stream) => winners.push((other, stream)),
                    Err(err) => self.attempts[other].state = AttemptState::Failed(err.to_string()),
                }
            }
            let (winner, stream) = self.pick(winners);
            self.attempts[winner].state = AttemptState::Succeeded;
            self.settle_pending(AttemptState::Aborted);
            let address = self.attempts[winner].address;
            debug!(%address, "connect attempt won");
            return Ok((stream, address));
        }

        Err(SocketError::ConnectionFailed {
            host: host.to_owned(),
            attempts: self.failures(),
        })
    }

    /// 在同一轮就绪的成功者中按地址族偏好挑选，落选的流直接丢弃关闭。
    fn pick(&mut self, mut winners: Vec<(usize, TcpStream)>) -> (usize, TcpStream) {
        let preferred = winners
            .iter()
            .position(|(index, _)| self.attempts[*index].address.is_ipv4() == self.prefer_ipv4)
            .unwrap_or(0);
        let chosen = winners.swap_remove(preferred);
        for (loser, _) in winners {
            trace!(address = %self.attempts[loser].address, "simultaneous success dropped by preference");
            self.attempts[loser].state = AttemptState::Aborted;
        }
        chosen
    }

    fn settle_pending(&mut self, state: AttemptState) {
        for attempt in &mut self.attempts {
            if attempt.state == AttemptState::Pending {
                attempt.state = state.clone();
            }
        }
    }

    fn failures(&self) -> Vec<AttemptFailure> {
        self.attempts
            .iter()
            .filter_map(|attempt| match &attempt.state {
                AttemptState::Failed(reason) => Some(AttemptFailure {
                    address: Some(attempt.address),
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

async fn attempt_connect(index: usize, address: SocketAddr) -> (usize, io::Result<TcpStream>) {
    let result = async {
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.connect(address).await
    }
    .await;
    (index, result)
}

/// 校验一个已连接描述符能否被当前配置接管。
pub(crate) fn validate_attached(peer: io::Result<SocketAddr>, config: &SocketConfig) -> Result<SocketAddr, SocketError> {
    let peer = peer.map_err(|err| SocketError::BadParam(format!("descriptor is not connected: {err}")))?;
    if !config.allows(&peer) {
        let family = if peer.is_ipv4() { "IPv4" } else { "IPv6" };
        return Err(SocketError::BadConfig(format!(
            "descriptor family {family} is disabled by the socket config"
        )));
    }
    Ok(peer)
}
