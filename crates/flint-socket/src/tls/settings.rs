use std::{fmt, sync::Arc};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    client::WebPkiServerVerifier,
    crypto::CryptoProvider,
    server::WebPkiClientVerifier,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use super::{
    trust::{CredentialSlot, TrustEvaluator},
    verifier::{CapturingClientVerifier, CapturingServerVerifier},
};
use crate::error::SocketError;

/// 升级时本端扮演的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsRole {
    /// 发起握手（客户端）。
    Initiator,
    /// 响应握手（服务端）。
    Acceptor,
}

/// 接受方对客户端证书的要求。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientAuthentication {
    #[default]
    Never,
    /// 请求但不强制。
    Optional,
    /// 未出示证书则握手失败。
    Required,
}

/// 本端身份：证书链与私钥（均为已解析的 DER）。
pub struct TlsIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// 一次 TLS 升级请求的全部参数。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 身份与信任材料以显式值随升级请求传入，不存在进程级共享的证书缓存；
/// - 证书加载与信任库引导不属于引擎职责，这里只接收已解析的 DER。
///
/// ## 契约 (What)
/// - `peer_name` 缺省时使用建连时的主机名（无主机名时退回对端 IP 字面量）；
/// - 发起方必须提供根证书或开启手动信任；接受方必须提供身份；
/// - 设置 [`TrustEvaluator`] 会隐式开启手动信任；开启手动信任但未设置评估器时，
///   凭据以 [`SocketEvent::TrustRequest`](crate::SocketEvent::TrustRequest) 事件交给应用；
/// - [`TlsSettings::validate`] 在组合非法时返回 [`SocketError::BadConfig`]。
///
/// ## 注意事项 (Trade-offs)
/// - 手动信任模式下引擎只校验握手签名，证书链与主机名的判断完全交给评估方。
#[derive(Clone)]
pub struct TlsSettings {
    role: TlsRole,
    peer_name: Option<String>,
    manual_trust: bool,
    evaluator: Option<Arc<dyn TrustEvaluator>>,
    identity: Option<TlsIdentity>,
    root_certificates: Vec<CertificateDer<'static>>,
    client_authentication: ClientAuthentication,
    alpn_protocols: Vec<Vec<u8>>,
}

impl TlsSettings {
    fn with_role(role: TlsRole) -> Self {
        Self {
            role,
            peer_name: None,
            manual_trust: false,
            evaluator: None,
            identity: None,
            root_certificates: Vec::new(),
            client_authentication: ClientAuthentication::Never,
            alpn_protocols: Vec::new(),
        }
    }

    /// 发起方配置。
    pub fn initiator() -> Self {
        Self::with_role(TlsRole::Initiator)
    }

    /// 接受方配置，必须携带本端身份。
    pub fn acceptor(identity: TlsIdentity) -> Self {
        Self::with_role(TlsRole::Acceptor).with_identity(identity)
    }

    pub fn with_peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    pub fn with_manual_trust(mut self, manual: bool) -> Self {
        self.manual_trust = manual;
        self
    }

    pub fn with_trust_evaluator(mut self, evaluator: Arc<dyn TrustEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self.manual_trust = true;
        self
    }

    /// 设置本端身份；发起方设置后会在服务端请求时出示客户端证书。
    pub fn with_identity(mut self, identity: TlsIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_root_certificates(mut self, roots: Vec<CertificateDer<'static>>) -> Self {
        self.root_certificates = roots;
        self
    }

    pub fn with_client_authentication(mut self, policy: ClientAuthentication) -> Self {
        self.client_authentication = policy;
        self
    }

    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    pub fn role(&self) -> TlsRole {
        self.role
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn manual_trust(&self) -> bool {
        self.manual_trust
    }

    pub(crate) fn evaluator(&self) -> Option<Arc<dyn TrustEvaluator>> {
        self.evaluator.clone()
    }

    /// 校验角色与材料的组合。
    pub fn validate(&self) -> Result<(), SocketError> {
        match self.role {
            TlsRole::Acceptor if self.identity.is_none() => Err(SocketError::BadConfig(
                "acceptor role requires a local identity".into(),
            )),
            TlsRole::Acceptor
                if !self.manual_trust
                    && self.client_authentication != ClientAuthentication::Never
                    && self.root_certificates.is_empty() =>
            {
                Err(SocketError::BadConfig(
                    "client authentication requires root certificates or manual trust".into(),
                ))
            }
            TlsRole::Initiator if !self.manual_trust && self.root_certificates.is_empty() => {
                Err(SocketError::BadConfig(
                    "initiator role requires root certificates or manual trust".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    fn root_store(&self) -> Result<RootCertStore, SocketError> {
        let mut roots = RootCertStore::empty();
        for cert in &self.root_certificates {
            roots
                .add(cert.clone())
                .map_err(|err| SocketError::BadConfig(format!("invalid root certificate: {err}")))?;
        }
        Ok(roots)
    }

    /// 构造发起方的 rustls 配置；手动信任时安装捕获型校验器。
    pub(crate) fn client_config(
        &self,
        provider: Arc<CryptoProvider>,
        slot: &CredentialSlot,
    ) -> Result<Arc<ClientConfig>, SocketError> {
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|err| SocketError::BadConfig(format!("tls protocol versions: {err}")))?;
        let builder = if self.manual_trust {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(CapturingServerVerifier::new(
                    slot.clone(),
                    provider.signature_verification_algorithms,
                )))
        } else {
            let verifier = WebPkiServerVerifier::builder_with_provider(
                Arc::new(self.root_store()?),
                provider.clone(),
            )
            .build()
            .map_err(|err| SocketError::BadConfig(format!("server verifier: {err}")))?;
            builder.with_webpki_verifier(verifier)
        };
        let mut config = match &self.identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
                .map_err(|err| SocketError::BadConfig(format!("client identity: {err}")))?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }

    /// 构造接受方的 rustls 配置。
    pub(crate) fn server_config(
        &self,
        provider: Arc<CryptoProvider>,
        slot: &CredentialSlot,
    ) -> Result<Arc<ServerConfig>, SocketError> {
        let Some(identity) = &self.identity else {
            return Err(SocketError::BadConfig(
                "acceptor role requires a local identity".into(),
            ));
        };
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|err| SocketError::BadConfig(format!("tls protocol versions: {err}")))?;
        let builder = match (self.client_authentication, self.manual_trust) {
            (ClientAuthentication::Never, _) => builder.with_no_client_auth(),
            (policy, true) => builder.with_client_cert_verifier(Arc::new(
                CapturingClientVerifier::new(
                    slot.clone(),
                    provider.signature_verification_algorithms,
                    policy == ClientAuthentication::Required,
                ),
            )),
            (policy, false) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(
                    Arc::new(self.root_store()?),
                    provider.clone(),
                );
                let verifier = if policy == ClientAuthentication::Optional {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                let verifier = verifier
                    .build()
                    .map_err(|err| SocketError::BadConfig(format!("client verifier: {err}")))?;
                builder.with_client_cert_verifier(verifier)
            }
        };
        let mut config = builder
            .with_single_cert(identity.chain.clone(), identity.key.clone_key())
            .map_err(|err| SocketError::BadConfig(format!("server identity: {err}")))?;
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("role", &self.role)
            .field("peer_name", &self.peer_name)
            .field("manual_trust", &self.manual_trust)
            .field("has_evaluator", &self.evaluator.is_some())
            .field("identity", &self.identity)
            .field("root_certificates", &self.root_certificates.len())
            .field("client_authentication", &self.client_authentication)
            .field("alpn_protocols", &self.alpn_protocols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::trust::{FnTrustEvaluator, TrustDecision};

    #[test]
    fn role_requirements_are_validated() {
        assert!(matches!(
            TlsSettings::initiator().validate(),
            Err(SocketError::BadConfig(_))
        ));
        assert!(TlsSettings::initiator().with_manual_trust(true).validate().is_ok());
        assert!(
            TlsSettings::initiator()
                .with_root_certificates(vec![CertificateDer::from(vec![0u8; 4])])
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn evaluator_implies_manual_trust() {
        let evaluator = Arc::new(FnTrustEvaluator::new(|_| TrustDecision::Accept));
        let settings = TlsSettings::initiator().with_trust_evaluator(evaluator);
        assert!(settings.manual_trust());
        assert!(settings.evaluator().is_some());
    }
}
