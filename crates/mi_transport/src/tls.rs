//! TLS transport with a pinned leaf certificate.
//!
//! Chain building and names are deliberately ignored: trust is the pin. The
//! verifier hashes the presented leaf DER with SHA-256 and requires the hex
//! digest to equal the stored fingerprint, aborting the handshake before any
//! application byte otherwise. First contact uses [`probe_fingerprint`] and a
//! human-confirmed SAS before the pin is stored.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::TransportError;
use crate::tcp::{connect_stream, read_message, write_message};
use crate::{Endpoint, Transport, TransportKind};

/// Hex SHA-256 of a certificate's DER encoding.
pub fn cert_fingerprint_hex(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

#[derive(Debug)]
struct PinVerifier {
    /// Lowercase hex fingerprint; `None` accepts anything (probe mode only).
    pinned: Option<String>,
}

impl ServerCertVerifier for PinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(expected) = &self.pinned {
            let got = cert_fingerprint_hex(end_entity.as_ref());
            let matches: bool = {
                use subtle::ConstantTimeEq;
                got.as_bytes().ct_eq(expected.as_bytes()).into()
            };
            if !matches {
                return Err(rustls::Error::General("pinned certificate mismatch".into()));
            }
        }
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
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

fn client_config(pinned: Option<String>) -> Result<Arc<ClientConfig>, TransportError> {
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinVerifier { pinned }))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn open_connection(
    endpoint: &Endpoint,
    pinned: Option<String>,
) -> Result<StreamOwned<ClientConnection, TcpStream>, TransportError> {
    let tcp = connect_stream(endpoint)?;
    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|_| TransportError::Tls(format!("invalid server name {}", endpoint.host)))?;
    let conn = ClientConnection::new(client_config(pinned)?, server_name)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut stream = StreamOwned::new(conn, tcp);
    // Drive the handshake now so a pin mismatch surfaces before any payload.
    while stream.conn.is_handshaking() {
        stream
            .conn
            .complete_io(&mut stream.sock)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
    }
    Ok(stream)
}

/// First-contact probe: complete a handshake accepting any certificate and
/// return the leaf fingerprint for the TOFU SAS confirmation. Nothing is
/// sent on the connection.
pub fn probe_fingerprint(endpoint: &Endpoint) -> Result<String, TransportError> {
    let stream = open_connection(endpoint, None)?;
    let certs = stream
        .conn
        .peer_certificates()
        .ok_or_else(|| TransportError::Tls("server sent no certificate".into()))?;
    let leaf = certs
        .first()
        .ok_or_else(|| TransportError::Tls("server sent no certificate".into()))?;
    Ok(cert_fingerprint_hex(leaf.as_ref()))
}

pub struct TlsTransport {
    endpoint: Endpoint,
    pinned_fingerprint: String,
    stream: Mutex<Option<StreamOwned<ClientConnection, TcpStream>>>,
}

impl TlsTransport {
    /// `pinned_fingerprint` is the lowercase hex SHA-256 of the expected
    /// leaf DER, from the trust store.
    pub fn new(endpoint: Endpoint, pinned_fingerprint: String) -> Self {
        Self {
            endpoint,
            pinned_fingerprint: pinned_fingerprint.to_ascii_lowercase(),
            stream: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Transport for TlsTransport {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.stream.lock();
        if guard.is_none() {
            debug!(endpoint = %self.endpoint, "tls connect");
            *guard = Some(open_connection(
                &self.endpoint,
                Some(self.pinned_fingerprint.clone()),
            )?);
        }
        let stream = guard.as_mut().expect("just set");
        let result = write_tls(stream, request).and_then(|()| read_tls(stream));
        if result.is_err() {
            *guard = None;
        }
        result
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    fn reset(&self) {
        *self.stream.lock() = None;
    }
}

fn write_tls<S: Read + Write>(stream: &mut S, message: &[u8]) -> Result<(), TransportError> {
    write_message(stream, message)
}

fn read_tls<S: Read + Write>(stream: &mut S) -> Result<Vec<u8>, TransportError> {
    read_message(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_lowercase_hex() {
        let fp = cert_fingerprint_hex(b"not really a cert");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
