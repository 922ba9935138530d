//! HTTP/2 multiplexing engine
//!
//! A hand-rolled HTTP/2 implementation with low-level frame control, built
//! to carry arbitrary, possibly malformed request packets to servers that
//! may themselves misbehave.
//!
//! # Architecture
//!
//! - [`frames`] and [`codec`]: frame types, payload parsing, wire encoding
//!   and an incremental [`FrameReader`](codec::FrameReader)
//! - [`settings`]: SETTINGS parameters with RFC 7540 validation
//! - [`flow_control`]: [`WindowControl`], send credit shared between the
//!   reader thread and the writers
//! - [`stream`]: one request/response exchange and its recycling arena
//! - [`client`]: [`Http2ClientConnection`], one reader thread per
//!   connection demultiplexing frames to streams
//! - [`server`]: [`serve_h2`], the inbound counterpart used by test servers
//!
//! HPACK comes from the `hpack` crate. The encoder is shared under the
//! connection's write lock; the decoder is touched only by the reader.
//!
//! # Examples
//!
//! ```no_run
//! use lowhttp::http::h2::{ClientConfig, Http2ClientConnection, RoundTrip};
//! use lowhttp::http::SharedSession;
//! use std::net::TcpStream;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let tcp = TcpStream::connect("127.0.0.1:8080")?;
//! let session = Arc::new(SharedSession::from_tcp_stream(tcp));
//! let conn = Http2ClientConnection::handshake(session, false, "127.0.0.1:8080", ClientConfig::default())?;
//!
//! let request = b"GET / HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n\r\n";
//! match conn.round_trip(bytes::Bytes::from_static(request), Duration::from_secs(5)) {
//!     RoundTrip::Success(resp) => println!("{}", resp.status),
//!     RoundTrip::NeedReconnect(e) => println!("retry elsewhere: {}", e),
//!     RoundTrip::Fatal { error, .. } => println!("failed: {}", error),
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod server;
pub mod settings;
pub mod signal;
pub mod stream;

pub use client::{ClientConfig, Http2ClientConnection, RoundTrip};
pub use codec::{FrameCodec, FrameReader};
pub use error::{Error, ErrorCode, Result};
pub use flow_control::WindowControl;
pub use frames::{DataFrame, Frame, FrameFlags, FrameType, HeadersFrame, SettingsFrame};
pub use server::{serve_h2, H2Handler, H2Request, H2ServerBuilder, H2ServerResponse, Http2ConnectionConfig, RequestBody, ServeSummary};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{EndReason, H2Response, Http2ClientStream, StreamArena, StreamId, StreamOutcome, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Receive window advertised for each stream (4 MiB)
pub const DEFAULT_STREAM_RECEIVE_WINDOW: u32 = 4 << 20;

pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Advertised SETTINGS_MAX_HEADER_LIST_SIZE (10 MiB)
pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 10 << 20;
