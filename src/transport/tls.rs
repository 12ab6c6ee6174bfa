//! # TLS for `adcs://` hubs
//!
//! Hubs almost always present self-signed certificates, so the usual
//! web PKI is no help. Two modes are supported:
//! - **Pinned**: the URL carries `kp=SHA256/<base32>` and the certificate's
//!   SHA-256 fingerprint must match it
//! - **Unverified**: no key print given; any certificate is accepted and a
//!   warning is logged

use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::core::identifier::encode_base32;
use crate::error::{ProtocolError, Result};

/// Client-side TLS settings for one hub
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    /// SHA-256 fingerprint of the hub certificate
    pinned_cert_hash: Option<Vec<u8>>,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            pinned_cert_hash: None,
        }
    }

    /// Pin the hub certificate by its SHA-256 fingerprint
    pub fn with_pinned_cert_hash(mut self, hash: Vec<u8>) -> Self {
        self.pinned_cert_hash = Some(hash);
        self
    }

    /// Calculate the SHA-256 fingerprint of a certificate
    pub fn calculate_cert_hash(cert: &Certificate) -> Vec<u8> {
        Sha256::digest(&cert.0).to_vec()
    }

    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder().with_safe_defaults();

        let config = match &self.pinned_cert_hash {
            Some(hash) => builder
                .with_custom_certificate_verifier(Arc::new(CertificateFingerprint {
                    fingerprint: hash.clone(),
                }))
                .with_no_client_auth(),
            None => {
                warn!(
                    server = %self.server_name,
                    "no key print for hub, accepting any certificate"
                );
                builder
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                    .with_no_client_auth()
            }
        };
        Ok(config)
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }
}

struct CertificateFingerprint {
    fingerprint: Vec<u8>,
}

impl ServerCertVerifier for CertificateFingerprint {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let hash = Sha256::digest(&end_entity.0);
        if hash.as_slice() == self.fingerprint.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "hub certificate SHA256/{} does not match the pinned key print",
                encode_base32(&hash)
            )))
        }
    }
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Run the TLS handshake over an open TCP stream.
#[instrument(skip(stream, config), fields(server = %config.server_name))]
pub async fn connect(stream: TcpStream, config: &TlsClientConfig) -> Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(config.load_client_config()?));
    let domain = config.server_name()?;
    let tls = connector
        .connect(domain, stream)
        .await
        .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))?;
    debug!("TLS established");
    Ok(tls)
}
