//! Transport identity: client-certificate fingerprints and the
//! handshake-time ban gate.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rustls::rustls::{
    self, DigitallySignedStruct, DistinguishedName, SignatureScheme,
    client::danger::HandshakeSignatureValid,
    pki_types::{CertificateDer, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
};

use crate::registry::Registry;

/// Authentication failed for a single connection attempt. Fatal to that
/// attempt only.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity is banned")]
    Banned,
    #[error("no client certificate presented")]
    MissingCertificate,
}

/// Stable identity for a connecting client: the SHA-256 digest of its
/// certificate (DER), as colon-separated lowercase hex.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    let bytes: Vec<String> = digest.iter().map(|b| format!("{b:02x}")).collect();
    bytes.join(":")
}

/// Gate a freshly handshaken connection: derive the fingerprint and
/// reject banned identities before any participant is constructed.
pub fn authenticate(
    registry: &Registry,
    peer_certs: Option<&[CertificateDer<'_>]>,
) -> Result<String, AuthError> {
    let cert = peer_certs
        .and_then(|certs| certs.first())
        .ok_or(AuthError::MissingCertificate)?;
    let fingerprint = fingerprint(cert);
    if registry.is_banned(&fingerprint) {
        return Err(AuthError::Banned);
    }
    Ok(fingerprint)
}

/// Accepts any client certificate as proof of identity.
///
/// Possession of the private key IS the identity; authorization (bans,
/// operator status) is the registry's job, keyed on the fingerprint.
/// Handshake signature verification still runs, so a client must actually
/// hold the key for the certificate it presents.
#[derive(Debug)]
pub struct AcceptAnyClientCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl AcceptAnyClientCert {
    pub fn new() -> Self {
        Self {
            provider: rustls::crypto::CryptoProvider::get_default()
                .cloned()
                .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider())),
        }
    }
}

impl Default for AcceptAnyClientCert {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
