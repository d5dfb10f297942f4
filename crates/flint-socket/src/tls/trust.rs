use std::{
    fmt,
    sync::{Arc, Mutex},
};

use futures::future::{self, BoxFuture};
use rustls_pki_types::CertificateDer;
use tokio::sync::oneshot;

/// 对端在握手中出示的凭据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCredential {
    end_entity: CertificateDer<'static>,
    intermediates: Vec<CertificateDer<'static>>,
    server_name: Option<String>,
}

impl PeerCredential {
    pub(crate) fn new(
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: Option<String>,
    ) -> Self {
        Self {
            end_entity: end_entity.clone().into_owned(),
            intermediates: intermediates
                .iter()
                .map(|cert| cert.clone().into_owned())
                .collect(),
            server_name,
        }
    }

    /// 叶子证书（DER）。
    pub fn end_entity(&self) -> &CertificateDer<'static> {
        &self.end_entity
    }

    pub fn intermediates(&self) -> &[CertificateDer<'static>] {
        &self.intermediates
    }

    /// 作为发起方时期望校验的对端名称；作为接受方评估客户端证书时为 `None`。
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }
}

/// 信任评估结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustDecision {
    Accept,
    Reject,
}

/// 外部信任评估能力。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 证书链校验策略（证书钉扎、私有 CA、吊销检查）属于应用决策，引擎只负责在握手中暂停并
///   把凭据交出去；
/// - 评估可能涉及 IO（查询 OCSP、访问配置中心），因此返回 future，而不是同步布尔值。
///
/// ## 契约 (What)
/// - 返回的 future 由引擎在独立任务中驱动，完成后结论通过一次性通道送回所属套接字；
/// - 套接字在结论到达前已被拆除时，结论被静默丢弃。
pub trait TrustEvaluator: Send + Sync + 'static {
    fn evaluate(&self, credential: PeerCredential) -> BoxFuture<'static, TrustDecision>;
}

/// 以同步闭包实现的信任评估器。
pub struct FnTrustEvaluator<F> {
    decide: F,
}

impl<F> FnTrustEvaluator<F>
where
    F: Fn(&PeerCredential) -> TrustDecision + Send + Sync + 'static,
{
    pub fn new(decide: F) -> Self {
        Self { decide }
    }
}

impl<F> TrustEvaluator for FnTrustEvaluator<F>
where
    F: Fn(&PeerCredential) -> TrustDecision + Send + Sync + 'static,
{
    fn evaluate(&self, credential: PeerCredential) -> BoxFuture<'static, TrustDecision> {
        Box::pin(future::ready((self.decide)(&credential)))
    }
}

impl<F> fmt::Debug for FnTrustEvaluator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTrustEvaluator").finish_non_exhaustive()
    }
}

/// 未配置评估器时随 [`SocketEvent::TrustRequest`](crate::SocketEvent::TrustRequest) 交给应用的待决请求。
///
/// 丢弃请求而不作答等价于拒绝。
pub struct TrustRequest {
    credential: PeerCredential,
    responder: oneshot::Sender<TrustDecision>,
}

impl TrustRequest {
    pub(crate) fn new(credential: PeerCredential, responder: oneshot::Sender<TrustDecision>) -> Self {
        Self {
            credential,
            responder,
        }
    }

    pub fn credential(&self) -> &PeerCredential {
        &self.credential
    }

    pub fn respond(self, decision: TrustDecision) {
        // 套接字可能已经拆除，结论无人接收时直接丢弃。
        let _ = self.responder.send(decision);
    }

    pub fn accept(self) {
        self.respond(TrustDecision::Accept);
    }

    pub fn reject(self) {
        self.respond(TrustDecision::Reject);
    }
}

impl fmt::Debug for TrustRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustRequest")
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

/// 握手回调与会话之间传递凭据的单槽位。
///
/// rustls 的校验回调是同步的，回调只负责把凭据放进槽位，会话在 `process_new_packets`
/// 返回后取出并挂起后续流程。
#[derive(Clone, Debug, Default)]
pub(crate) struct CredentialSlot {
    inner: Arc<Mutex<Option<PeerCredential>>>,
}

impl CredentialSlot {
    pub(crate) fn store(&self, credential: PeerCredential) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(credential);
    }

    pub(crate) fn take(&self) -> Option<PeerCredential> {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_request_reads_as_closed_channel() {
        let (tx, mut rx) = oneshot::channel();
        let request = TrustRequest::new(
            PeerCredential::new(&CertificateDer::from(vec![1, 2, 3]), &[], None),
            tx,
        );
        drop(request);
        assert!(rx.try_recv().is_err(), "丢弃请求应让接收端观察到关闭");
    }

    #[test]
    fn slot_hands_over_credential_once() {
        let slot = CredentialSlot::default();
        slot.store(PeerCredential::new(
            &CertificateDer::from(vec![9]),
            &[],
            Some("localhost".into()),
        ));
        let credential = slot.take().expect("凭据已写入");
        assert_eq!(credential.server_name(), Some("localhost"));
        assert!(slot.take().is_none());
    }
}
