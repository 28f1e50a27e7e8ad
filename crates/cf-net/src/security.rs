// security.rs - Transports and the TLS capability.
//
// A `Transport` is whatever carries transactions for one connection: a
// plain `TcpStream` for classic sessions, or a rustls stream over one for
// TLS sessions. The rest of the crate never touches rustls directly; it asks
// a `SecurityProvider` to wrap a freshly connected or accepted socket.
//
// A client that trusts a server on first use skips certificate path
// validation but still checks the handshake signatures, so the session is
// bound to the key the server presented. That key's digest is what the
// connection records.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, ServerConfig, ServerConnection,
    SignatureScheme, StreamOwned,
};
use sha2::{Digest, Sha256};

use crate::error::NetError;

/// First byte of a TLS handshake record.
pub const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// A byte stream carrying one peer session.
pub trait Transport: Read + Write + Send {
    fn is_encrypted(&self) -> bool;

    /// `SHA=<hex>` digest of the peer's certificate, when the peer presented
    /// one.
    fn peer_key_digest(&self) -> Option<String>;

    /// The underlying socket (timeouts, readiness polling, shutdown).
    fn socket(&self) -> &TcpStream;

    /// Whether input is already buffered above the socket, where polling
    /// the socket cannot see it.
    fn has_pending_input(&mut self) -> bool {
        false
    }
}

/// Decrypted bytes rustls holds that no read has taken yet. An error means
/// the next read has something to report, so it counts as pending.
fn plaintext_pending(state: Result<rustls::IoState, rustls::Error>) -> bool {
    state.map_or(true, |io| io.plaintext_bytes_to_read() > 0)
}

impl Transport for TcpStream {
    fn is_encrypted(&self) -> bool {
        false
    }

    fn peer_key_digest(&self) -> Option<String> {
        None
    }

    fn socket(&self) -> &TcpStream {
        self
    }
}

impl Transport for StreamOwned<ClientConnection, TcpStream> {
    fn is_encrypted(&self) -> bool {
        true
    }

    fn peer_key_digest(&self) -> Option<String> {
        certificate_digest(self.conn.peer_certificates())
    }

    fn socket(&self) -> &TcpStream {
        &self.sock
    }

    fn has_pending_input(&mut self) -> bool {
        plaintext_pending(self.conn.process_new_packets())
    }
}

impl Transport for StreamOwned<ServerConnection, TcpStream> {
    fn is_encrypted(&self) -> bool {
        true
    }

    fn peer_key_digest(&self) -> Option<String> {
        certificate_digest(self.conn.peer_certificates())
    }

    fn socket(&self) -> &TcpStream {
        &self.sock
    }

    fn has_pending_input(&mut self) -> bool {
        plaintext_pending(self.conn.process_new_packets())
    }
}

fn certificate_digest(certs: Option<&[CertificateDer<'static>]>) -> Option<String> {
    let leaf = certs?.first()?;
    Some(format!("SHA={:x}", Sha256::digest(leaf.as_ref())))
}

/// Accepts whatever certificate the server presents, checking only that
/// the handshake was signed by its key.
#[derive(Debug)]
struct TrustOnFirstUse {
    algorithms: WebPkiSupportedAlgorithms,
}

impl TrustOnFirstUse {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for TrustOnFirstUse {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        tracing::warn!(
            server = ?server_name,
            key = %format!("SHA={:x}", Sha256::digest(end_entity.as_ref())),
            "trusting server key without verification"
        );
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn trusting_client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustOnFirstUse::new()))
        .with_no_client_auth();
    Arc::new(config)
}

/// Wraps sockets in an encrypted transport.
pub trait SecurityProvider: Send + Sync {
    /// Run the client side of the TLS handshake with `server`. With
    /// `trust_server` the server's key is accepted without checking it
    /// against trust anchors.
    fn secure_client(
        &self,
        stream: TcpStream,
        server: &str,
        trust_server: bool,
    ) -> Result<Box<dyn Transport>, NetError>;

    /// Run the server side of the TLS handshake on an accepted socket.
    fn secure_server(&self, stream: TcpStream) -> Result<Box<dyn Transport>, NetError>;
}

/// rustls-backed provider.
///
/// Built empty (classic sessions only) and given trust anchors for the client
/// side and/or a certificate chain and key for the server side.
#[derive(Default, Clone)]
pub struct RustlsSecurity {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl RustlsSecurity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the CA certificates in `ca_pem` when connecting to servers.
    pub fn with_trust_anchors(mut self, ca_pem: &Path) -> Result<Self, NetError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_pem)? {
            roots.add(cert).map_err(|e| NetError::TlsMaterial {
                path: ca_pem.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        self.client = Some(Arc::new(config));
        Ok(self)
    }

    /// Present `cert_pem` (chain) signed by `key_pem` to connecting agents.
    pub fn with_identity(mut self, cert_pem: &Path, key_pem: &Path) -> Result<Self, NetError> {
        let certs = load_certs(cert_pem)?;
        let key = load_key(key_pem)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        self.server = Some(Arc::new(config));
        Ok(self)
    }

    pub fn has_client_config(&self) -> bool {
        self.client.is_some()
    }

    pub fn has_server_config(&self) -> bool {
        self.server.is_some()
    }
}

impl SecurityProvider for RustlsSecurity {
    fn secure_client(
        &self,
        stream: TcpStream,
        server: &str,
        trust_server: bool,
    ) -> Result<Box<dyn Transport>, NetError> {
        let config = match (&self.client, trust_server) {
            (_, true) => trusting_client_config(),
            (Some(config), false) => config.clone(),
            (None, false) => {
                return Err(NetError::Tls(
                    "no trust anchors configured for TLS sessions".to_string(),
                ))
            }
        };
        let name = ServerName::try_from(server.to_string())
            .map_err(|e| NetError::Tls(format!("invalid server name '{}': {}", server, e)))?;

        let mut conn = ClientConnection::new(config, name)?;
        let mut sock = stream;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)?;
        }
        tracing::debug!(server, "TLS session established");
        Ok(Box::new(StreamOwned::new(conn, sock)))
    }

    fn secure_server(&self, stream: TcpStream) -> Result<Box<dyn Transport>, NetError> {
        let config = self
            .server
            .clone()
            .ok_or_else(|| NetError::Tls("no server certificate configured".to_string()))?;

        let mut conn = ServerConnection::new(config)?;
        let mut sock = stream;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)?;
        }
        Ok(Box::new(StreamOwned::new(conn, sock)))
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>, NetError> {
    let file = File::open(path).map_err(|e| NetError::TlsMaterial {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, NetError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NetError::TlsMaterial {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(NetError::TlsMaterial {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, NetError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| NetError::TlsMaterial {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| NetError::TlsMaterial {
            path: path.to_path_buf(),
            reason: "no private key found".to_string(),
        })
}
