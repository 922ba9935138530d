//! TLS configuration
//!
//! This module provides TLS configuration builders for both client and server.
//! Builder steps never panic: the first OpenSSL failure is remembered and
//! reported by `build()`.

use openssl::pkey::PKey;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    fn to_openssl_version(self) -> SslVersion {
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Encode protocol names in ALPN wire format (length-prefixed)
pub fn encode_alpn(protocols: &[&str]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) is_server: bool,
    pub(crate) servername: Option<String>,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Create a new server configuration builder
    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Connect to a server with TLS (client-side)
    pub fn connect(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if self.is_server {
            return Err(TlsError::InvalidConfig(
                "cannot use server config for client connection".to_string(),
            ));
        }
        super::session::TlsSessionOps::connect(stream, self)
    }

    /// Accept a client connection with TLS (server-side)
    pub fn accept(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "cannot use client config for server accept".to_string(),
            ));
        }
        super::session::TlsSessionOps::accept(stream, self)
    }
}

fn load_pem_identity(builder: &mut SslContextBuilder, pem: &[u8]) -> Result<(), TlsError> {
    let cert = X509::from_pem(pem)
        .map_err(|e| TlsError::Certificate(format!("failed to load certificate: {}", e)))?;
    builder.set_certificate(&cert)?;
    let key = PKey::private_key_from_pem(pem)
        .map_err(|e| TlsError::Certificate(format!("failed to load private key: {}", e)))?;
    builder.set_private_key(&key)?;
    Ok(())
}

fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, TlsError> {
    let mut contents = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut contents)?;
    Ok(contents)
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    ctx_builder: Result<SslContextBuilder, TlsError>,
    servername: Option<String>,
}

impl ClientConfigBuilder {
    fn new() -> Self {
        let ctx_builder = SslContextBuilder::new(SslMethod::tls_client())
            .map(|mut b| {
                // probing tool: peer verification is opt-in
                b.set_verify(SslVerifyMode::NONE);
                b
            })
            .map_err(TlsError::from);

        ClientConfigBuilder { ctx_builder, servername: None }
    }

    fn apply<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut SslContextBuilder) -> Result<(), TlsError>,
    {
        if let Ok(builder) = self.ctx_builder.as_mut() {
            if let Err(e) = f(builder) {
                self.ctx_builder = Err(e);
            }
        }
        self
    }

    /// Set TLS version range
    pub fn version_range(self, min: TlsVersion, max: TlsVersion) -> Self {
        self.apply(|b| {
            b.set_min_proto_version(Some(min.to_openssl_version()))?;
            b.set_max_proto_version(Some(max.to_openssl_version()))?;
            Ok(())
        })
    }

    /// Set ALPN protocols, most preferred first
    pub fn alpn(self, protocols: &[&str]) -> Self {
        let wire = encode_alpn(protocols);
        self.apply(move |b| b.set_alpn_protos(&wire).map_err(TlsError::from))
    }

    /// Set SNI servername
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(self, verify: bool) -> Self {
        self.apply(move |b| {
            if verify {
                b.set_default_verify_paths()?;
                b.set_verify(SslVerifyMode::PEER);
            } else {
                b.set_verify(SslVerifyMode::NONE);
            }
            Ok(())
        })
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        Ok(TlsConfig {
            ctx: self.ctx_builder?.build(),
            is_server: false,
            servername: self.servername,
        })
    }
}

/// Server configuration builder
pub struct ServerConfigBuilder {
    ctx_builder: Result<SslContextBuilder, TlsError>,
    has_cert: bool,
}

impl ServerConfigBuilder {
    fn new() -> Self {
        ServerConfigBuilder {
            ctx_builder: SslContextBuilder::new(SslMethod::tls_server()).map_err(TlsError::from),
            has_cert: false,
        }
    }

    fn apply<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut SslContextBuilder) -> Result<(), TlsError>,
    {
        if let Ok(builder) = self.ctx_builder.as_mut() {
            if let Err(e) = f(builder) {
                self.ctx_builder = Err(e);
            }
        }
        self
    }

    /// Set TLS version range
    pub fn version_range(self, min: TlsVersion, max: TlsVersion) -> Self {
        self.apply(|b| {
            b.set_min_proto_version(Some(min.to_openssl_version()))?;
            b.set_max_proto_version(Some(max.to_openssl_version()))?;
            Ok(())
        })
    }

    /// Set ALPN protocols the server is willing to select
    pub fn alpn(self, protocols: &[&str]) -> Self {
        let ours: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
        self.apply(move |b| {
            b.set_alpn_select_callback(move |_ssl, client_protos| {
                let mut pos = 0;
                while pos < client_protos.len() {
                    let len = client_protos[pos] as usize;
                    pos += 1;
                    if pos + len > client_protos.len() {
                        break;
                    }
                    let candidate = &client_protos[pos..pos + len];
                    if ours.iter().any(|p| p.as_slice() == candidate) {
                        return Ok(candidate);
                    }
                    pos += len;
                }
                Err(openssl::ssl::AlpnError::NOACK)
            });
            Ok(())
        })
    }

    /// Load certificate and private key from one PEM file
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        match read_file(path) {
            Ok(pem) => {
                self.has_cert = true;
                self.apply(move |b| load_pem_identity(b, &pem))
            }
            Err(e) => {
                self.ctx_builder = Err(e);
                self
            }
        }
    }

    /// Build the TLS configuration, falling back to the built-in certificate
    pub fn build(mut self) -> Result<TlsConfig, TlsError> {
        if !self.has_cert {
            self = self.apply(|b| load_pem_identity(b, super::builtin_cert::BUILTIN_CERT.as_bytes()));
        }

        Ok(TlsConfig {
            ctx: self.ctx_builder?.build(),
            is_server: true,
            servername: None,
        })
    }
}
