//! HTTP/2 client streams
//!
//! One [`Http2ClientStream`] carries one request/response exchange. The
//! read loop feeds it decoded header blocks and DATA payloads; the waiting
//! caller sleeps on a capacity-1 end signal that every terminal transition
//! fills exactly once, so the read loop never blocks on a slow or absent
//! waiter.
//!
//! Streams are recycled through a [`StreamArena`]. A stream is reset before
//! every reuse and only goes back to the arena when nothing else holds it.

use super::error::{Error, ErrorCode};
use super::flow_control::WindowControl;
use crate::http::packet::render_response;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

/// Stream ID type
pub type StreamId = u32;

/// Why a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// END_STREAM received
    Normal,
    /// RST_STREAM received with this code
    Reset(u32),
    /// We reset the stream
    LocalReset(ErrorCode),
    ConnClosed,
    Timeout,
    /// Stream id above the last one a GOAWAY accepted
    Refused { last_stream_id: u32 },
}

impl EndReason {
    fn into_error(self, stream_id: StreamId) -> Option<Error> {
        match self {
            EndReason::Normal => None,
            EndReason::Reset(code) => Some(Error::RemoteReset { stream_id, code }),
            EndReason::LocalReset(ErrorCode::FlowControlError) => {
                Some(Error::FlowControl(format!("stream {} window overflow", stream_id)))
            }
            EndReason::LocalReset(code) => {
                Some(Error::Protocol(format!("stream {} reset locally: {}", stream_id, code)))
            }
            EndReason::ConnClosed => Some(Error::ConnectionClosed),
            EndReason::Timeout => Some(Error::Timeout),
            EndReason::Refused { last_stream_id } => Some(Error::Refused { stream_id, last_stream_id }),
        }
    }
}

/// Client stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    HeadersSent,
    DataSent,
    EndStreamWithoutBody,
    HeadersReceiving,
    HeadersReceived,
    DataReceiving,
    Ended(EndReason),
}

/// What happened to a frame handed to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Applied,
    /// The stream already ended; the frame is dropped
    Dropped,
    /// The frame violates the stream's state; the stream was reset
    Malformed,
}

/// Response assembled from a stream
#[derive(Debug, Clone, Default)]
pub struct H2Response {
    pub stream_id: StreamId,
    /// 0 when no final response head arrived
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// HTTP/1.1-style rendering: `HTTP/2.0 <code> <reason>`, headers, body
    pub raw: Bytes,
}

impl H2Response {
    /// First header value with a case-insensitive name match
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether nothing at all was received
    pub fn is_empty(&self) -> bool {
        self.status == 0 && self.headers.is_empty() && self.body.is_empty()
    }
}

/// Response plus the error that ended the exchange, if any
///
/// Partial responses are kept next to the error.
#[derive(Debug)]
pub struct StreamOutcome {
    pub response: H2Response,
    pub error: Option<Error>,
}

impl StreamOutcome {
    pub fn into_result(self) -> Result<H2Response, Error> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.response),
        }
    }
}

struct StreamInner {
    id: StreamId,
    request: Bytes,
    state: StreamState,
    status: u16,
    headers: Vec<(String, String)>,
    body: BytesMut,
    sent_headers: bool,
    sent_end_stream: bool,
    read_header_end: bool,
    read_end_stream: bool,
    end_reason: Option<EndReason>,
    end_tx: SyncSender<EndReason>,
    end_rx: Option<Receiver<EndReason>>,
}

impl StreamInner {
    fn new(id: StreamId, request: Bytes) -> Self {
        let (end_tx, end_rx) = sync_channel(1);
        StreamInner {
            id,
            request,
            state: StreamState::Created,
            status: 0,
            headers: Vec::new(),
            body: BytesMut::new(),
            sent_headers: false,
            sent_end_stream: false,
            read_header_end: false,
            read_end_stream: false,
            end_reason: None,
            end_tx,
            end_rx: Some(end_rx),
        }
    }
}

/// One request/response exchange on an HTTP/2 connection
pub struct Http2ClientStream {
    inner: Mutex<StreamInner>,
    send_window: WindowControl,
}

impl Http2ClientStream {
    pub(crate) fn new(id: StreamId, request: Bytes, send_window: u32) -> Self {
        Http2ClientStream {
            inner: Mutex::new(StreamInner::new(id, request)),
            send_window: WindowControl::new(send_window),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.lock().id
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.inner.lock().end_reason
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().end_reason.is_some()
    }

    pub(crate) fn set_id(&self, id: StreamId) {
        self.inner.lock().id = id;
    }

    pub(crate) fn request(&self) -> Bytes {
        self.inner.lock().request.clone()
    }

    pub(crate) fn send_window(&self) -> &WindowControl {
        &self.send_window
    }

    pub(crate) fn sent_end_stream(&self) -> bool {
        self.inner.lock().sent_end_stream
    }

    pub(crate) fn mark_headers_sent(&self) {
        let mut inner = self.inner.lock();
        inner.sent_headers = true;
        if inner.end_reason.is_none() {
            inner.state = StreamState::HeadersSent;
        }
    }

    /// Record outbound DATA; `with_body` tells a real body from the lone
    /// empty END_STREAM frame
    pub(crate) fn mark_data_sent(&self, with_body: bool, end_stream: bool) {
        let mut inner = self.inner.lock();
        inner.sent_end_stream |= end_stream;
        if inner.end_reason.is_none() && matches!(inner.state, StreamState::HeadersSent | StreamState::DataSent) {
            inner.state = if with_body { StreamState::DataSent } else { StreamState::EndStreamWithoutBody };
        }
    }

    /// Move to a terminal state; the first reason wins
    ///
    /// Returns whether this call ended the stream.
    pub(crate) fn set_end(&self, reason: EndReason) -> bool {
        let mut inner = self.inner.lock();
        self.end_locked(&mut inner, reason)
    }

    fn end_locked(&self, inner: &mut StreamInner, reason: EndReason) -> bool {
        if inner.end_reason.is_some() {
            return false;
        }
        inner.end_reason = Some(reason);
        inner.state = StreamState::Ended(reason);
        self.send_window.close();
        // capacity 1 and filled once, so this never blocks
        let _ = inner.end_tx.try_send(reason);
        true
    }

    /// Apply a decoded header block
    ///
    /// The first block with a final status is the response head; 1xx blocks
    /// are discarded and later blocks are trailers appended to the head.
    pub(crate) fn on_headers(&self, fields: Vec<(Vec<u8>, Vec<u8>)>, end_stream: bool) -> Delivery {
        let mut inner = self.inner.lock();
        if inner.end_reason.is_some() {
            return Delivery::Dropped;
        }

        let mut status = None;
        let mut regular = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            let name = String::from_utf8_lossy(&name).into_owned();
            let value = String::from_utf8_lossy(&value).into_owned();
            if name == ":status" {
                status = value.trim().parse::<u16>().ok();
            } else if !name.starts_with(':') {
                regular.push((name, value));
            }
        }

        if inner.read_header_end {
            inner.headers.extend(regular);
        } else {
            match status {
                Some(code) if (100..200).contains(&code) => {
                    tracing::trace!(stream_id = inner.id, code, "discarding informational response");
                    inner.state = StreamState::HeadersReceiving;
                }
                Some(code) => {
                    inner.status = code;
                    inner.headers = regular;
                    inner.read_header_end = true;
                    inner.state = StreamState::HeadersReceived;
                }
                None => {
                    self.end_locked(&mut inner, EndReason::LocalReset(ErrorCode::ProtocolError));
                    return Delivery::Malformed;
                }
            }
        }

        if end_stream {
            inner.read_end_stream = true;
            self.end_locked(&mut inner, EndReason::Normal);
        }
        Delivery::Applied
    }

    /// Append a DATA payload
    pub(crate) fn on_data(&self, data: &[u8], end_stream: bool) -> Delivery {
        let mut inner = self.inner.lock();
        if inner.end_reason.is_some() {
            return Delivery::Dropped;
        }
        if !inner.read_header_end {
            self.end_locked(&mut inner, EndReason::LocalReset(ErrorCode::ProtocolError));
            return Delivery::Malformed;
        }

        inner.body.extend_from_slice(data);
        inner.state = StreamState::DataReceiving;
        if end_stream {
            inner.read_end_stream = true;
            self.end_locked(&mut inner, EndReason::Normal);
        }
        Delivery::Applied
    }

    pub(crate) fn take_end_receiver(&self) -> Option<Receiver<EndReason>> {
        self.inner.lock().end_rx.take()
    }

    /// Build the response from whatever was received
    pub(crate) fn finish(&self) -> StreamOutcome {
        let mut inner = self.inner.lock();
        let headers = std::mem::take(&mut inner.headers);
        let body = std::mem::take(&mut inner.body).freeze();
        let mut response = H2Response {
            stream_id: inner.id,
            status: inner.status,
            headers,
            body,
            raw: Bytes::new(),
        };
        if !response.is_empty() {
            response.raw = render_response(response.status, &response.headers, &response.body);
        }

        let error = inner
            .end_reason
            .unwrap_or(EndReason::ConnClosed)
            .into_error(inner.id);
        StreamOutcome { response, error }
    }

    /// Return to the zero state for reuse
    fn reset(&self, id: StreamId, request: Bytes, send_window: u32) {
        *self.inner.lock() = StreamInner::new(id, request);
        self.send_window.reset(send_window);
    }
}

impl std::fmt::Debug for Http2ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Http2ClientStream")
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("sent_headers", &inner.sent_headers)
            .field("read_end_stream", &inner.read_end_stream)
            .finish()
    }
}

/// Free-list of streams for reuse
#[derive(Debug)]
pub struct StreamArena {
    free: Mutex<Vec<Arc<Http2ClientStream>>>,
    capacity: usize,
}

impl StreamArena {
    pub fn new(capacity: usize) -> Self {
        StreamArena { free: Mutex::new(Vec::with_capacity(capacity)), capacity }
    }

    /// A zeroed stream for `id`
    pub fn acquire(&self, id: StreamId, request: Bytes, send_window: u32) -> Arc<Http2ClientStream> {
        match self.free.lock().pop() {
            Some(stream) => {
                stream.reset(id, request, send_window);
                stream
            }
            None => Arc::new(Http2ClientStream::new(id, request, send_window)),
        }
    }

    /// Recycle a stream; returns false when it is still referenced elsewhere
    /// or the arena is full
    pub fn release(&self, stream: Arc<Http2ClientStream>) -> bool {
        if Arc::strong_count(&stream) != 1 {
            return false;
        }
        let mut free = self.free.lock();
        if free.len() >= self.capacity {
            return false;
        }
        stream.reset(0, Bytes::new(), 0);
        free.push(stream);
        true
    }

    /// Streams waiting for reuse
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}
