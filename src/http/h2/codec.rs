//! HTTP/2 frame encoding and decoding
//!
//! Encoding produces complete wire frames as [`Bytes`] so callers can hand
//! them to a session under a single write lock. Decoding is incremental:
//! [`FrameReader`] accumulates whatever the socket returns and yields whole
//! frames once they are buffered.

use super::error::{Error, Result};
use super::frames::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame encoder
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(kind: FrameType, flags: FrameFlags, stream_id: u32, length: usize) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0] = (length >> 16) as u8;
        header[1] = (length >> 8) as u8;
        header[2] = length as u8;
        header[3] = kind.as_u8();
        header[4] = flags.as_u8();
        header[5..9].copy_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
        header
    }

    /// Decode a frame header into (type byte, flags, stream id, payload length)
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, FrameFlags, u32, usize) {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize;
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFF_FFFF;
        (bytes[3], FrameFlags::from_u8(bytes[4]), stream_id, length)
    }

    fn padded(kind: FrameType, mut flags: FrameFlags, stream_id: u32, body: &[u8], padding: Option<u8>) -> Bytes {
        let pad = padding.unwrap_or(0) as usize;
        let mut len = body.len();
        if padding.is_some() {
            flags.set(FrameFlags::PADDED);
            len += 1 + pad;
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + len);
        buf.put_slice(&Self::encode_header(kind, flags, stream_id, len));
        if padding.is_some() {
            buf.put_u8(pad as u8);
        }
        buf.put_slice(body);
        buf.put_bytes(0, pad);
        buf.freeze()
    }

    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        Self::padded(FrameType::Data, flags, frame.stream_id, &frame.data, frame.padding)
    }

    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        Self::padded(FrameType::Headers, flags, frame.stream_id, &frame.header_block, frame.padding)
    }

    pub fn encode_continuation_frame(stream_id: u32, fragment: &[u8], end_headers: bool) -> Bytes {
        let mut flags = FrameFlags::empty();
        if end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        Self::padded(FrameType::Continuation, flags, stream_id, fragment, None)
    }

    /// Split an encoded header block into HEADERS plus CONTINUATION frames
    /// no larger than `max_frame_size`, concatenated into one buffer
    pub fn encode_header_block(stream_id: u32, block: &[u8], end_stream: bool, max_frame_size: usize) -> Bytes {
        let max = max_frame_size.max(1);
        let mut chunks = block.chunks(max);
        let first = chunks.next().unwrap_or(&[]);
        let rest: Vec<&[u8]> = chunks.collect();

        let mut out = BytesMut::with_capacity(block.len() + FRAME_HEADER_SIZE * (rest.len() + 1));
        out.put(Self::encode_headers_frame(&HeadersFrame::new(
            stream_id,
            Bytes::copy_from_slice(first),
            end_stream,
            rest.is_empty(),
        )));
        for (i, chunk) in rest.iter().enumerate() {
            out.put(Self::encode_continuation_frame(stream_id, chunk, i + 1 == rest.len()));
        }
        out.freeze()
    }

    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut payload = BytesMut::new();
        let mut flags = FrameFlags::empty();
        if frame.ack {
            flags.set(FrameFlags::ACK);
        } else {
            frame.settings.encode_payload(&mut payload);
        }
        Self::padded(FrameType::Settings, flags, 0, &payload, None)
    }

    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.ack {
            flags.set(FrameFlags::ACK);
        }
        Self::padded(FrameType::Ping, flags, 0, &frame.data, None)
    }

    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut payload = BytesMut::with_capacity(8 + frame.debug_data.len());
        payload.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        payload.put_u32(frame.error_code.as_u32());
        payload.put_slice(&frame.debug_data);
        Self::padded(FrameType::Goaway, FrameFlags::empty(), 0, &payload, None)
    }

    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let increment = (frame.size_increment & 0x7FFF_FFFF).to_be_bytes();
        Self::padded(FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, &increment, None)
    }

    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let code = frame.error_code.as_u32().to_be_bytes();
        Self::padded(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, &code, None)
    }
}

/// Incremental frame decoder
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameReader {
    /// `max_frame_size` is the largest payload we advertised
    pub fn new(max_frame_size: usize) -> Self {
        FrameReader { buf: BytesMut::with_capacity(FRAME_HEADER_SIZE + max_frame_size), max_frame_size }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, or `None` when more input is needed
    ///
    /// A payload above the advertised maximum is a connection error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.buf[..FRAME_HEADER_SIZE]);
        let (kind, flags, stream_id, length) = FrameCodec::decode_header(&header);
        if length > self.max_frame_size {
            return Err(Error::FrameSize(format!(
                "frame of {} bytes exceeds max frame size {}",
                length, self.max_frame_size
            )));
        }
        if self.buf.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_SIZE);
        let payload = self.buf.split_to(length).freeze();
        Ok(Some(Frame { kind, flags, stream_id, payload }))
    }
}
