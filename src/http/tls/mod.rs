//! TLS support for pooled connections
//!
//! # Architecture
//!
//! The TLS implementation uses the session operations abstraction pattern:
//!
//! 1. `TlsConfig` defines TLS settings (version range, ALPN, SNI, certificates)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. The HTTP/2 engine stays unchanged; it only sees `SessionOps`
//!
//! The dialer offers `h2` and `http/1.1` through ALPN and reads the selected
//! protocol back from the session to decide whether a connection hosts an
//! HTTP/2 engine. Servers built without a certificate use a built-in
//! self-signed one, which is enough for loopback harnesses.
//!
//! # Examples
//!
//! ```no_run
//! use lowhttp::http::tls::TlsConfig;
//! use std::net::TcpStream;
//!
//! let tls_config = TlsConfig::client()
//!     .servername("example.com")
//!     .alpn(&["h2", "http/1.1"])
//!     .build()
//!     .unwrap();
//!
//! let tcp_stream = TcpStream::connect("example.com:443").unwrap();
//! let tls_session = tls_config.connect(tcp_stream).unwrap();
//! ```

pub mod builtin_cert;
pub mod config;
pub mod session;

pub use config::{
    encode_alpn, ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion,
};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
