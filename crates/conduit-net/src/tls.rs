//! Non-blocking TLS handshake step, gated behind `feature = "tls"`.
//!
//! The handshake is modelled as a sequenced I/O step rather than a
//! cryptographic primitive worth re-deriving: callers push socket bytes
//! through [`TlsSession::advance`] on every readable/writable readiness
//! event until it reports [`HandshakeStatus::Complete`], then switch to
//! reading/writing plaintext through the same session.
use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use rustls::{ClientConnection, Connection, ServerConnection};

/// Materialises the PEM-encoded certificate chain and private key named by
/// `ssl_server_cert_chain_fn`/`ssl_server_key_fn` in the configuration (file
/// paths, matching the original `boost::asio::ssl::context::use_certificate_
/// chain_file`/`use_private_key_file` calls they came from).
pub struct ServerIdentity {
    pub cert_chain_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

/// Materialises the PEM-encoded CA bundle named by `ssl_client_verify_fn`,
/// used to verify the server's certificate on outbound connections.
pub struct ClientTrust {
    pub ca_bundle_pem: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("failed to parse PEM material: {0}")]
    Pem(String),
    #[error("rustls configuration error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("no private key found in supplied PEM")]
    NoPrivateKey,
}

pub fn server_config(identity: ServerIdentity) -> Result<Arc<rustls::ServerConfig>, TlsConfigError> {
    let mut chain_reader = io::BufReader::new(identity.cert_chain_pem.as_slice());
    let certs: Vec<_> = rustls_pemfile::certs(&mut chain_reader)
        .map(|r| r.map_err(|e| TlsConfigError::Pem(e.to_string())))
        .collect::<Result<_, _>>()?;

    let mut key_reader = io::BufReader::new(identity.private_key_pem.as_slice());
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| TlsConfigError::Pem(e.to_string()))?
        .ok_or(TlsConfigError::NoPrivateKey)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

pub fn client_config(trust: ClientTrust) -> Result<Arc<rustls::ClientConfig>, TlsConfigError> {
    let mut reader = io::BufReader::new(trust.ca_bundle_pem.as_slice());
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| TlsConfigError::Pem(e.to_string()))?;
        let _ = roots.add(cert);
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub enum HandshakeStatus {
    InProgress,
    Complete,
    Failed(io::Error),
}

enum Role {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Role {
    fn conn_mut(&mut self) -> &mut dyn Connection {
        match self {
            Role::Server(c) => c,
            Role::Client(c) => c,
        }
    }
}

/// Wraps one rustls connection (client or server side) plus the
/// application-visible plaintext buffers either side of it.
pub struct TlsSession {
    role: Role,
}

impl TlsSession {
    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, rustls::Error> {
        Ok(Self { role: Role::Server(ServerConnection::new(config)?) })
    }

    pub fn client(
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<Self, rustls::Error> {
        Ok(Self { role: Role::Client(ClientConnection::new(config, server_name)?) })
    }

    pub fn is_handshaking(&mut self) -> bool {
        self.role.conn_mut().is_handshaking()
    }

    /// Pumps TLS record bytes to/from `socket` once. Should be called again
    /// on every subsequent readable/writable readiness event until it stops
    /// returning `InProgress`.
    pub fn advance(&mut self, socket: &mut dyn ReadWrite) -> HandshakeStatus {
        let conn = self.role.conn_mut();

        if conn.wants_write() {
            loop {
                match conn.write_tls(socket) {
                    Ok(0) => break,
                    Ok(_) => {
                        if !conn.wants_write() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return HandshakeStatus::Failed(err),
                }
            }
        }

        if conn.wants_read() {
            match conn.read_tls(socket) {
                Ok(0) => return HandshakeStatus::Failed(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during TLS handshake",
                )),
                Ok(_) => {
                    if let Err(err) = conn.process_new_packets() {
                        return HandshakeStatus::Failed(io::Error::new(
                            io::ErrorKind::InvalidData,
                            err,
                        ));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return HandshakeStatus::Failed(err),
            }
        }

        if conn.is_handshaking() { HandshakeStatus::InProgress } else { HandshakeStatus::Complete }
    }

    /// Reads decrypted application bytes produced during/after the
    /// handshake. Returns 0 if none are buffered right now.
    pub fn read_plaintext(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.role.conn_mut().reader().read(out)
    }

    pub fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        self.role.conn_mut().writer().write(data)
    }
}

/// Blanket trait so [`TlsSession::advance`] can operate on either a raw
/// `mio::net::TcpStream` or a test double.
pub trait ReadWrite: io::Read + io::Write {}
impl<T: io::Read + io::Write> ReadWrite for T {}
