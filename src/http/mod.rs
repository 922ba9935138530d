//! HTTP plumbing shared by the pooled engines
//!
//! This module provides the transport abstraction and the raw packet helpers
//! that the HTTP/2 engine and the connection pool are built on.
//!
//! # Architecture
//!
//! The HTTP layer uses a session operations abstraction pattern that allows
//! seamless switching between plain TCP and TLS connections:
//!
//! - `SessionOps` trait defines operations (poll, read, write, close)
//! - `SharedSession` lets one reader thread and many writers share a transport
//! - All HTTP/2 I/O code is transparent to the underlying transport
//!
//! Raw request packets arrive as bytes, already normalized by the caller.
//! [`packet`] splits them into a request line, header pairs and a body
//! without rejecting the odd line ending or a malformed header line.
//!
//! # Examples
//!
//! ```no_run
//! use lowhttp::http::packet::split_request_packet;
//!
//! let packet = split_request_packet(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
//! assert_eq!(packet.method, "GET");
//! assert_eq!(packet.headers.get("host"), Some("example.com"));
//! ```

pub mod chunked;
pub mod h2;
pub mod headers;
pub mod packet;
pub mod pool;
pub mod session;
pub mod tls;

pub use headers::Headers;
pub use packet::{should_send_req_content_length, RequestPacket};
pub use pool::{ConnectionKey, ConnectionPool, PersistentConnection, PoolConfig, Scheme};
pub use session::{FdSessionOps, PollEvents, SessionOps, SharedSession};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 256;
