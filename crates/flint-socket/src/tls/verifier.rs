//! 手动信任模式下使用的证书校验器：只捕获凭据，签名仍按提供者的算法表严格校验。

use rustls::{
    DigitallySignedStruct, DistinguishedName, Error as RustlsError, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature},
    server::danger::{ClientCertVerified, ClientCertVerifier},
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use super::trust::{CredentialSlot, PeerCredential};

/// 发起方使用：把服务端证书链交给信任评估，而不是走默认链校验。
#[derive(Debug)]
pub(crate) struct CapturingServerVerifier {
    slot: CredentialSlot,
    algorithms: WebPkiSupportedAlgorithms,
}

impl CapturingServerVerifier {
    pub(crate) fn new(slot: CredentialSlot, algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self { slot, algorithms }
    }
}

impl ServerCertVerifier for CapturingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        self.slot.store(PeerCredential::new(
            end_entity,
            intermediates,
            Some(server_name.to_str().into_owned()),
        ));
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// 接受方使用：请求客户端证书并交给信任评估。
#[derive(Debug)]
pub(crate) struct CapturingClientVerifier {
    slot: CredentialSlot,
    algorithms: WebPkiSupportedAlgorithms,
    mandatory: bool,
}

impl CapturingClientVerifier {
    pub(crate) fn new(
        slot: CredentialSlot,
        algorithms: WebPkiSupportedAlgorithms,
        mandatory: bool,
    ) -> Self {
        Self {
            slot,
            algorithms,
            mandatory,
        }
    }
}

impl ClientCertVerifier for CapturingClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, RustlsError> {
        self.slot
            .store(PeerCredential::new(end_entity, intermediates, None));
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
