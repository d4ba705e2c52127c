//! Handshake driver seam and its rustls implementation over memory buffers.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("tls configuration: {0}")]
    Config(#[from] rustls::Error),
    #[error("handshake already initiated")]
    AlreadyInitiated,
}

/// What a handshake step achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More peer bytes are needed.
    AwaitingInput,
    /// The server certificate arrived (or the handshake finished).
    Done,
    /// The peer sent something the engine rejected.
    Failed,
}

/// A client handshake driven entirely through byte buffers.
pub trait HandshakeCapability {
    fn initiate(&mut self) -> Result<(), HandshakeError>;
    /// Consume buffered input and report progress.
    fn step(&mut self) -> Progress;
    /// Drain bytes that must go to the peer.
    fn pending_output(&mut self) -> Vec<u8>;
    fn feed_input(&mut self, bytes: &[u8]);
}

/// Builds one capability per probed address.
pub trait HandshakeFactory: Send + Sync {
    fn create(&self, address: Ipv4Addr) -> Result<Box<dyn HandshakeCapability + Send>, HandshakeError>;
}

/// Accepts whatever chain the server presents. The probe harvests
/// certificates; it never trusts them.
#[derive(Debug)]
struct AcceptAnyCertificate {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
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
        self.schemes.clone()
    }
}

/// TLS 1.2 only: the Certificate message is sent in the clear and ends up
/// verbatim in the captured bytes.
pub fn probe_client_config() -> Result<ClientConfig, HandshakeError> {
    let provider = rustls::crypto::ring::default_provider();
    let schemes = provider.signature_verification_algorithms.supported_schemes();
    let config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { schemes }))
        .with_no_client_auth();
    Ok(config)
}

pub struct RustlsHandshake {
    conn: ClientConnection,
    inbox: Vec<u8>,
    initiated: bool,
    failed: bool,
}

impl RustlsHandshake {
    pub fn new(config: Arc<ClientConfig>, address: Ipv4Addr) -> Result<Self, HandshakeError> {
        let name = ServerName::IpAddress(IpAddr::V4(address).into());
        let conn = ClientConnection::new(config, name)?;
        Ok(RustlsHandshake { conn, inbox: Vec::new(), initiated: false, failed: false })
    }
}

impl HandshakeCapability for RustlsHandshake {
    fn initiate(&mut self) -> Result<(), HandshakeError> {
        // The ClientHello is queued when the connection is built.
        if self.initiated {
            return Err(HandshakeError::AlreadyInitiated);
        }
        self.initiated = true;
        Ok(())
    }

    fn step(&mut self) -> Progress {
        if self.failed {
            return Progress::Failed;
        }
        while !self.inbox.is_empty() {
            let mut reader = &self.inbox[..];
            let n = match self.conn.read_tls(&mut reader) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::trace!(error = %e, "read_tls rejected input");
                    self.failed = true;
                    return Progress::Failed;
                }
            };
            self.inbox.drain(..n);
            if let Err(e) = self.conn.process_new_packets() {
                tracing::trace!(error = %e, "handshake rejected");
                self.failed = true;
                return Progress::Failed;
            }
        }
        if self.conn.peer_certificates().is_some() || !self.conn.is_handshaking() {
            Progress::Done
        } else {
            Progress::AwaitingInput
        }
    }

    fn pending_output(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut out) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        out
    }

    fn feed_input(&mut self, bytes: &[u8]) {
        self.inbox.extend_from_slice(bytes);
    }
}

/// Shares one client configuration across every probe.
pub struct RustlsFactory {
    config: Arc<ClientConfig>,
}

impl RustlsFactory {
    pub fn new() -> Result<Self, HandshakeError> {
        Ok(RustlsFactory { config: Arc::new(probe_client_config()?) })
    }
}

impl HandshakeFactory for RustlsFactory {
    fn create(&self, address: Ipv4Addr) -> Result<Box<dyn HandshakeCapability + Send>, HandshakeError> {
        Ok(Box::new(RustlsHandshake::new(self.config.clone(), address)?))
    }
}
