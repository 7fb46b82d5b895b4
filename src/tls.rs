//! Mutual-TLS session setup with certificate pinning instead of a CA chain
//! (§4.C).
//!
//! Grounded on the ephemeral single-cert `ServerConfig` construction in
//! `duallink-transport::generate_tls_identity` (rustls 0.23 + ring provider,
//! `with_single_cert`), extended here with custom
//! `danger::ServerCertVerifier` / `danger::ClientCertVerifier`
//! implementations that pin by exact DER equality against the
//! [`IdentityStore`] rather than trusting any CA — required because every
//! peer certificate is self-signed.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityStore;

/// Installs the `ring` crypto provider process-wide. Idempotent: rustls
/// returns an error if a provider is already installed, which we ignore,
/// mirroring `generate_tls_identity`'s own `let _ = ... .install_default()`.
pub fn ensure_crypto_provider_installed() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Verifies a peer's certificate against the [`IdentityStore`] trust
/// pinning rule instead of a certificate authority chain. Used for both
/// the client and server verifier (mutual auth is symmetric here: every
/// peer authenticates the other with the same pin check).
#[derive(Debug)]
struct PinningVerifier {
    identity: Arc<IdentityStore>,
    announced_device_id: std::sync::Mutex<Option<String>>,
    /// `tokio_rustls` only hands the caller an opaque `std::io::Error` on
    /// handshake failure, which would otherwise erase *why* verification
    /// failed. Stashed here so the provider can recover the typed
    /// [`CoreError`] after the handshake future resolves.
    last_error: std::sync::Mutex<Option<CoreError>>,
}

impl PinningVerifier {
    fn new(identity: Arc<IdentityStore>) -> Self {
        Self {
            identity,
            announced_device_id: std::sync::Mutex::new(None),
            last_error: std::sync::Mutex::new(None),
        }
    }

    /// The pre-TLS identity packet tells us who we expect to be talking to;
    /// record it so the verifier can check the handshake cert's CN against
    /// it (§4.A `verifyPeer`).
    fn set_expected_device_id(&self, device_id: &str) {
        *self.announced_device_id.lock().unwrap() = Some(device_id.to_string());
    }

    fn verify(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let expected = self.announced_device_id.lock().unwrap().clone();
        let Some(expected) = expected else {
            return Err(rustls::Error::General(
                "no announced device id set before handshake".into(),
            ));
        };
        match self.identity.verify_peer(end_entity.as_ref(), &expected) {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = e.to_string();
                *self.last_error.lock().unwrap() = Some(e);
                Err(rustls::Error::General(message))
            }
        }
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.verify(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        all_signature_schemes()
    }
}

impl ClientCertVerifier for PinningVerifier {
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
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.verify(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        all_signature_schemes()
    }
}

fn all_signature_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::RSA_PKCS1_SHA512,
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PSS_SHA512,
        SignatureScheme::ED25519,
    ]
}

/// A pinning verifier shared between the client and server halves of a
/// single link handshake, so the host can tell it which device id it
/// expects to see before handing the socket to rustls.
pub struct HandshakeVerifier(Arc<PinningVerifier>);

impl HandshakeVerifier {
    pub fn new(identity: Arc<IdentityStore>) -> Self {
        Self(Arc::new(PinningVerifier::new(identity)))
    }

    pub fn expect_device_id(&self, device_id: &str) {
        self.0.set_expected_device_id(device_id);
    }

    /// Recover the typed error the verifier observed during the handshake
    /// just attempted, if any. Call this after `accept`/`connect` fails to
    /// tell a pin violation apart from an ordinary TLS/IO failure.
    pub fn take_error(&self) -> Option<CoreError> {
        self.0.last_error.lock().unwrap().take()
    }
}

fn local_cert_chain(identity: &IdentityStore) -> CoreResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_der = CertificateDer::from(identity.cert_der().to_vec());
    let key_der = rcgen::KeyPair::from_pem(identity.key_pem())
        .map_err(|e| CoreError::FatalInit(format!("cannot parse local key: {e}")))?
        .serialize_der();
    let key_der = PrivateKeyDer::try_from(key_der)
        .map_err(|e| CoreError::FatalInit(format!("cannot encode local key: {e}")))?;
    Ok((vec![cert_der], key_der))
}

/// Build the `TlsAcceptor` used for the server half of a link (§4.F Flow 1).
/// `verifier.expect_device_id` must be called with the peer's announced id
/// (from the pre-TLS identity frame) before the handshake is driven.
pub fn build_acceptor(identity: &IdentityStore, verifier: &HandshakeVerifier) -> CoreResult<TlsAcceptor> {
    ensure_crypto_provider_installed();
    let (chain, key) = local_cert_chain(identity)?;

    let client_verifier: Arc<dyn ClientCertVerifier> = verifier.0.clone();
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(chain, key)
        .map_err(|e| CoreError::FatalInit(format!("TLS server config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the `TlsConnector` used for the client half of a link (§4.F Flow 2).
pub fn build_connector(identity: &IdentityStore, verifier: &HandshakeVerifier) -> CoreResult<TlsConnector> {
    ensure_crypto_provider_installed();
    let (chain, key) = local_cert_chain(identity)?;

    let server_verifier: Arc<dyn ServerCertVerifier> = verifier.0.clone();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(server_verifier)
        .with_client_auth_cert(chain, key)
        .map_err(|e| CoreError::FatalInit(format!("TLS client config: {e}")))?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// A placeholder server name for the `rustls` client API, which requires
/// one even though verification here never consults DNS names. Any valid
/// `ServerName` works since [`PinningVerifier`] ignores it.
pub fn placeholder_server_name() -> ServerName<'static> {
    ServerName::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST).into())
}
