//! HTTP/2 error types
//!
//! Errors fall into three groups that callers treat differently:
//!
//! - retryable on a fresh connection: [`Error::CreateStreamAfterGoAway`]
//!   and [`Error::Refused`]. Nothing of the request reached a peer that
//!   will process it.
//! - timed out: [`Error::Timeout`]. The connection stays usable.
//! - everything else: the request truly failed.

use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    #[error("dial failed: {0}")]
    Dial(#[from] crate::net::Error),

    #[error("connection closed")]
    ConnectionClosed,

    /// The peer sent GOAWAY, or the connection broke before any byte of
    /// the request was written
    #[error("cannot create stream after GOAWAY")]
    CreateStreamAfterGoAway,

    /// The stream id was above the last id accepted by a GOAWAY
    #[error("stream {stream_id} refused by GOAWAY (last stream {last_stream_id})")]
    Refused { stream_id: u32, last_stream_id: u32 },

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("timed out waiting for response")]
    Timeout,

    #[error("stream {stream_id} reset by peer: {}", describe_code(.code))]
    RemoteReset { stream_id: u32, code: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("flow control error: {0}")]
    FlowControl(String),

    #[error("frame size error: {0}")]
    FrameSize(String),

    #[error("invalid settings value: {0}")]
    InvalidSettings(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The pool's cancel signal fired; no connections are handed out
    #[error("connection pool cancelled")]
    PoolCancelled,
}

impl Error {
    /// Whether the request may be replayed on a fresh connection
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CreateStreamAfterGoAway | Error::Refused { .. }
        )
    }

    /// Whether the error invalidates the whole connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Http(_)
                | Error::Protocol(_)
                | Error::Compression(_)
                | Error::FrameSize(_)
                | Error::InvalidSettings(_)
                | Error::WriteFailed(_)
        )
    }

    /// RFC 7540 code to report in GOAWAY for a connection-fatal error
    pub fn goaway_code(&self) -> ErrorCode {
        match self {
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Protocol(_) | Error::InvalidSettings(_) => ErrorCode::ProtocolError,
            _ => ErrorCode::InternalError,
        }
    }
}

fn describe_code(code: &u32) -> String {
    match ErrorCode::from_u32(*code) {
        Some(c) => c.to_string(),
        None => format!("unknown (0x{:x})", code),
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
