//! TLS acceptor configuration and certificate identity
//!
//! Client certificates are trusted by SHA-256 fingerprint of their DER encoding
//! rather than by chain building, so the subscriber registry can key identities
//! on a stable value. The trust store is shared and may be replaced at runtime.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};

/// SHA-256 fingerprint of a DER-encoded certificate
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertificateFingerprint([u8; 32]);

impl CertificateFingerprint {
    pub fn of(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    /// Parses a hex fingerprint, ignoring `:` separators and case.
    pub fn from_hex(text: &str) -> Option<Self> {
        let cleaned: String = text.chars().filter(|c| *c != ':' && !c.is_whitespace()).collect();
        let bytes = hex::decode(cleaned).ok()?;
        let raw: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateFingerprint({self})")
    }
}

/// Fingerprints of client certificates allowed to complete a handshake
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    fingerprints: Arc<RwLock<HashSet<CertificateFingerprint>>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fingerprint: CertificateFingerprint) {
        self.fingerprints.write().insert(fingerprint);
    }

    pub fn contains(&self, fingerprint: &CertificateFingerprint) -> bool {
        self.fingerprints.read().contains(fingerprint)
    }

    pub fn replace(&self, fingerprints: impl IntoIterator<Item = CertificateFingerprint>) {
        *self.fingerprints.write() = fingerprints.into_iter().collect();
    }

    pub fn len(&self) -> usize {
        self.fingerprints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct FingerprintClientVerifier {
    trust_store: TrustStore,
    mandatory: bool,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for FingerprintClientVerifier {
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
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let fingerprint = CertificateFingerprint::of(end_entity.as_ref());
        if self.trust_store.contains(&fingerprint) {
            debug!(%fingerprint, "Client certificate trusted");
            Ok(ClientCertVerified::assertion())
        } else {
            warn!(%fingerprint, "Client certificate not in trust store");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Server identity plus client-certificate policy
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub certificate_chain: Vec<CertificateDer<'static>>,
    pub private_key: Arc<PrivateKeyDer<'static>>,
    pub require_client_certificate: bool,
    pub trust_store: TrustStore,
}

impl TlsSettings {
    /// Loads the server certificate chain and private key from PEM files.
    pub fn from_pem_files(
        certificate: &Path,
        private_key: &Path,
        require_client_certificate: bool,
        trust_store: TrustStore,
    ) -> Result<Self> {
        Ok(Self {
            certificate_chain: load_certificates(certificate)?,
            private_key: Arc::new(load_private_key(private_key)?),
            require_client_certificate,
            trust_store,
        })
    }

    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(FingerprintClientVerifier {
            trust_store: self.trust_store.clone(),
            mandatory: self.require_client_certificate,
            provider: provider.clone(),
        });

        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certificate_chain.clone(), self.private_key.clone_key())?;
        Ok(Arc::new(config))
    }
}

pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::configuration(
            format!("cannot open certificate {}: {e}", path.display()),
            Some("tls.certificate"),
        )
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::configuration(
            format!("no certificates found in {}", path.display()),
            Some("tls.certificate"),
        ));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::configuration(
            format!("cannot open private key {}: {e}", path.display()),
            Some("tls.private_key"),
        )
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?.ok_or_else(|| {
        TransportError::configuration(
            format!("no private key found in {}", path.display()),
            Some("tls.private_key"),
        )
    })
}
