//! HTTP/2 frame types (RFC 7540 Section 6)
//!
//! Outbound frames are described by small structs that the codec encodes.
//! Inbound frames arrive as a raw [`Frame`] and are interpreted with the
//! `parse_*` helpers here, which validate payload shape but never touch
//! connection state.

use super::error::{Error, ErrorCode, Result};
use super::settings::Settings;
use bytes::{Buf, Bytes};
use std::fmt;

/// HTTP/2 frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Known frame type for a wire value; extension types yield `None`
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::Goaway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const END_STREAM: u8 = 0x1;
    /// Shares the bit with END_STREAM; SETTINGS and PING only
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn is_set(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A frame as read from the wire
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw type byte; unknown types are carried so callers can skip them
    pub kind: u8,
    pub flags: FrameFlags,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }

    /// Payload length as counted by flow control (padding included)
    pub fn flow_len(&self) -> usize {
        self.payload.len()
    }
}

/// Remove the pad-length byte and trailing padding from a padded payload
fn strip_padding(flags: FrameFlags, mut payload: Bytes) -> Result<Bytes> {
    if !flags.is_padded() {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(Error::Protocol("padded frame without pad length".to_string()));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(Error::Protocol(format!(
            "padding {} exceeds payload {}",
            pad,
            payload.len()
        )));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

/// DATA payload with padding removed
pub fn parse_data(frame: &Frame) -> Result<Bytes> {
    strip_padding(frame.flags, frame.payload.clone())
}

/// Header block fragment carried by HEADERS or CONTINUATION
#[derive(Debug, Clone)]
pub struct HeaderFragment {
    pub fragment: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
}

/// Extract the header block fragment, dropping padding and priority fields
pub fn parse_header_fragment(frame: &Frame) -> Result<HeaderFragment> {
    let is_headers = frame.kind == FrameType::Headers.as_u8();
    let mut fragment = if is_headers {
        strip_padding(frame.flags, frame.payload.clone())?
    } else {
        frame.payload.clone()
    };
    if is_headers && frame.flags.is_priority() {
        if fragment.len() < 5 {
            return Err(Error::FrameSize("HEADERS priority block truncated".to_string()));
        }
        fragment.advance(5);
    }
    Ok(HeaderFragment {
        fragment,
        // END_STREAM is only meaningful on HEADERS
        end_stream: is_headers && frame.flags.is_end_stream(),
        end_headers: frame.flags.is_end_headers(),
    })
}

fn fixed_u32(frame: &Frame, what: &str) -> Result<u32> {
    if frame.payload.len() != 4 {
        return Err(Error::FrameSize(format!(
            "{} payload must be 4 bytes, got {}",
            what,
            frame.payload.len()
        )));
    }
    Ok(u32::from_be_bytes([
        frame.payload[0],
        frame.payload[1],
        frame.payload[2],
        frame.payload[3],
    ]))
}

/// Error code carried by RST_STREAM
pub fn parse_rst_stream(frame: &Frame) -> Result<u32> {
    fixed_u32(frame, "RST_STREAM")
}

/// Window increment carried by WINDOW_UPDATE (reserved bit cleared)
pub fn parse_window_update(frame: &Frame) -> Result<u32> {
    Ok(fixed_u32(frame, "WINDOW_UPDATE")? & 0x7FFF_FFFF)
}

/// Opaque data carried by PING
pub fn parse_ping(frame: &Frame) -> Result<[u8; 8]> {
    let data: [u8; 8] = frame.payload[..]
        .try_into()
        .map_err(|_| Error::FrameSize(format!("PING payload must be 8 bytes, got {}", frame.payload.len())))?;
    Ok(data)
}

/// Parsed GOAWAY payload
#[derive(Debug, Clone)]
pub struct GoAway {
    pub last_stream_id: u32,
    pub error_code: u32,
    pub debug_data: Bytes,
}

pub fn parse_goaway(frame: &Frame) -> Result<GoAway> {
    if frame.payload.len() < 8 {
        return Err(Error::FrameSize(format!("GOAWAY payload too short: {}", frame.payload.len())));
    }
    let mut payload = frame.payload.clone();
    let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
    let error_code = payload.get_u32();
    Ok(GoAway { last_stream_id, error_code, debug_data: payload })
}

/// Outbound DATA frame
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    pub padding: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame { stream_id, data, end_stream, padding: None }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// Outbound HEADERS frame carrying one header block fragment
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub padding: Option<u8>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame { stream_id, header_block, end_stream, end_headers, padding: None }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

#[derive(Debug, Clone)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame { ack: false, settings }
    }

    pub fn ack() -> Self {
        SettingsFrame { ack: true, settings: Settings::new() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

#[derive(Debug, Clone)]
pub struct GoawayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    /// 0 for the connection window
    pub stream_id: u32,
    pub size_increment: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: FrameType, flags: u8, payload: &'static [u8]) -> Frame {
        Frame {
            kind: kind.as_u8(),
            flags: FrameFlags::from_u8(flags),
            stream_id: 1,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_unknown_type_is_none() {
        assert_eq!(FrameType::from_u8(0x9), Some(FrameType::Continuation));
        assert_eq!(FrameType::from_u8(0xb), None);
        let f = Frame { kind: 0xb, flags: FrameFlags::empty(), stream_id: 0, payload: Bytes::new() };
        assert!(f.frame_type().is_none());
    }

    #[test]
    fn test_parse_padded_data() {
        let f = frame(FrameType::Data, FrameFlags::PADDED, b"\x02abc\0\0");
        assert_eq!(&parse_data(&f).unwrap()[..], b"abc");
        assert_eq!(f.flow_len(), 6);

        let bad = frame(FrameType::Data, FrameFlags::PADDED, b"\x09abc");
        assert!(matches!(parse_data(&bad), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_headers_with_priority_and_padding() {
        let f = frame(
            FrameType::Headers,
            FrameFlags::PADDED | FrameFlags::PRIORITY | FrameFlags::END_HEADERS | FrameFlags::END_STREAM,
            b"\x01\x00\x00\x00\x03\x10\x88\0",
        );
        let frag = parse_header_fragment(&f).unwrap();
        assert_eq!(&frag.fragment[..], b"\x88");
        assert!(frag.end_stream);
        assert!(frag.end_headers);
    }

    #[test]
    fn test_continuation_ignores_end_stream_bit() {
        let f = frame(FrameType::Continuation, FrameFlags::END_STREAM | FrameFlags::END_HEADERS, b"\x82");
        let frag = parse_header_fragment(&f).unwrap();
        assert!(!frag.end_stream);
        assert!(frag.end_headers);
    }

    #[test]
    fn test_fixed_size_payloads() {
        let f = frame(FrameType::WindowUpdate, 0, b"\x80\x00\x01\x00");
        assert_eq!(parse_window_update(&f).unwrap(), 256);
        let f = frame(FrameType::RstStream, 0, b"\x00\x00");
        assert!(matches!(parse_rst_stream(&f), Err(Error::FrameSize(_))));
        let f = frame(FrameType::Ping, 0, b"12345678");
        assert_eq!(&parse_ping(&f).unwrap(), b"12345678");
    }

    #[test]
    fn test_parse_goaway() {
        let f = frame(FrameType::Goaway, 0, b"\x00\x00\x00\x05\x00\x00\x00\x00bye");
        let g = parse_goaway(&f).unwrap();
        assert_eq!(g.last_stream_id, 5);
        assert_eq!(g.error_code, 0);
        assert_eq!(&g.debug_data[..], b"bye");
    }
}
