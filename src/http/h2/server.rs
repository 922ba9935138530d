//! HTTP/2 server counterpart
//!
//! [`serve_h2`] runs the inbound side of one connection on the calling
//! thread: it reads the client preface, answers with its own SETTINGS and
//! then demultiplexes frames the same way the client engine does. Every
//! stream gets a request state whose DATA payloads flow through a body pipe
//! into a user handler running on its own thread. Handler threads are
//! counted in a [`WaitGroup`] so a GOAWAY or EOF can drain them before the
//! transport is closed.

use super::codec::{FrameCodec, FrameReader};
use super::error::{Error, ErrorCode, Result};
use super::flow_control::WindowControl;
use super::frames::*;
use super::settings::{Settings, SettingsBuilder};
use super::signal::WaitGroup;
use super::stream::StreamId;
use super::{CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_MAX_FRAME_SIZE};
use crate::diag::{TaskGuard, TaskKind};
use crate::http::SharedSession;
use bytes::{BufMut, Bytes, BytesMut};
use hpack::{Decoder, Encoder};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Settings and timeouts for one served connection
#[derive(Debug, Clone)]
pub struct Http2ConnectionConfig {
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    /// Give up on a connection that sends nothing for this long
    pub idle_timeout: Duration,
    /// How long in-flight handlers may run after GOAWAY or EOF
    pub drain_timeout: Duration,
    /// Bound on a handler waiting for request body bytes
    pub body_read_timeout: Duration,
    /// Bound on waiting for the client's flow-control credit
    pub write_timeout: Duration,
}

impl Default for Http2ConnectionConfig {
    fn default() -> Self {
        Http2ConnectionConfig {
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: 1 << 20,
            idle_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            body_read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Builder for [`Http2ConnectionConfig`]
#[derive(Debug, Default, Clone)]
pub struct H2ServerBuilder {
    config: Http2ConnectionConfig,
}

impl H2ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = max;
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.initial_window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    pub fn body_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.body_read_timeout = timeout;
        self
    }

    pub fn build(self) -> Http2ConnectionConfig {
        self.config
    }

    /// Serve one connection with the built config
    pub fn serve(self, session: Arc<SharedSession>, handler: Arc<dyn H2Handler>) -> Result<ServeSummary> {
        serve_h2(session, self.config, handler)
    }
}

/// Request head assembled from the pseudo-headers
#[derive(Debug, Clone)]
pub struct H2Request {
    pub stream_id: StreamId,
    pub method: String,
    pub path: String,
    pub scheme: String,
    pub authority: String,
    /// Regular headers in arrival order
    pub headers: Vec<(String, String)>,
}

impl H2Request {
    fn from_fields(stream_id: StreamId, fields: Vec<(Vec<u8>, Vec<u8>)>) -> Option<Self> {
        let mut req = H2Request {
            stream_id,
            method: String::new(),
            path: String::new(),
            scheme: String::new(),
            authority: String::new(),
            headers: Vec::new(),
        };
        for (name, value) in fields {
            let name = String::from_utf8_lossy(&name).into_owned();
            let value = String::from_utf8_lossy(&value).into_owned();
            match name.as_str() {
                ":method" => req.method = value,
                ":path" => req.path = value,
                ":scheme" => req.scheme = value,
                ":authority" => req.authority = value,
                n if n.starts_with(':') => tracing::debug!(stream_id, name = n, "unknown pseudo-header"),
                _ => req.headers.push((name, value)),
            }
        }
        if req.method.is_empty() {
            return None;
        }
        Some(req)
    }

    /// HTTP/1.1-style request line, e.g. `GET /index HTTP/2.0`
    pub fn request_line(&self) -> String {
        let target = if self.method.eq_ignore_ascii_case("CONNECT") { &self.authority } else { &self.path };
        format!("{} {} HTTP/2.0", self.method, target)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response produced by a handler
#[derive(Debug, Clone, Default)]
pub struct H2ServerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl H2ServerResponse {
    pub fn new(status: u16) -> Self {
        H2ServerResponse { status, ..Default::default() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Request handler run on a dedicated thread per stream
pub trait H2Handler: Send + Sync {
    fn handle(&self, request: H2Request, body: RequestBody) -> H2ServerResponse;
}

impl<F> H2Handler for F
where
    F: Fn(H2Request, RequestBody) -> H2ServerResponse + Send + Sync,
{
    fn handle(&self, request: H2Request, body: RequestBody) -> H2ServerResponse {
        self(request, body)
    }
}

/// What [`serve_h2`] saw before the connection ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeSummary {
    /// Streams handed to the handler
    pub streams: usize,
    /// Streams refused over the concurrency limit
    pub refused: usize,
    pub goaway_received: bool,
    /// Whether every handler finished within the drain timeout
    pub drained: bool,
}

#[derive(Debug, Default)]
struct PipeState {
    buf: BytesMut,
    closed: bool,
    aborted: bool,
}

/// Buffered byte pipe from the read loop to a handler
#[derive(Debug, Default)]
struct BodyPipe {
    state: Mutex<PipeState>,
    cond: Condvar,
}

impl BodyPipe {
    fn push(&self, data: &[u8]) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.aborted {
            return false;
        }
        state.buf.extend_from_slice(data);
        self.cond.notify_all();
        true
    }

    /// End of request body
    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    /// Stream reset; pending and future reads fail
    fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.buf.clear();
        self.cond.notify_all();
    }
}

/// Request body as seen by a handler
///
/// Reads block until DATA arrives, the body ends (`Ok(0)`), the client
/// resets the stream (`ConnectionReset`) or the read timeout passes
/// (`TimedOut`).
#[derive(Debug)]
pub struct RequestBody {
    pipe: Arc<BodyPipe>,
    timeout: Duration,
}

impl Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.pipe.state.lock();
        loop {
            if state.aborted {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "stream reset by client"));
            }
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                buf[..n].copy_from_slice(&state.buf.split_to(n));
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            if self.pipe.cond.wait_until(&mut state, deadline).timed_out() && state.buf.is_empty() && !state.closed {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "request body read timed out"));
            }
        }
    }
}

/// Per-stream server state
struct H2RequestState {
    id: StreamId,
    pipe: Arc<BodyPipe>,
    send_window: WindowControl,
    dispatched: AtomicBool,
}

struct ServerState {
    streams: HashMap<StreamId, Arc<H2RequestState>>,
    last_stream_id: StreamId,
    peer_initial_window: u32,
}

struct ServerWriter {
    encoder: Encoder<'static>,
    max_frame_size: usize,
}

struct ServerConn {
    session: Arc<SharedSession>,
    config: Http2ConnectionConfig,
    state: Mutex<ServerState>,
    writer: Mutex<ServerWriter>,
    conn_send_window: WindowControl,
    handlers: WaitGroup,
}

struct PendingBlock {
    stream_id: StreamId,
    block: BytesMut,
    end_stream: bool,
}

#[derive(Default)]
struct ReadState {
    pending: Option<PendingBlock>,
    /// The client's SETTINGS that must follow its preface arrived
    seen_settings: bool,
    summary: ServeSummary,
}

/// Serve one HTTP/2 connection until GOAWAY, EOF, idle timeout or a
/// connection error, then drain handlers and close the transport
pub fn serve_h2(
    session: Arc<SharedSession>,
    config: Http2ConnectionConfig,
    handler: Arc<dyn H2Handler>,
) -> Result<ServeSummary> {
    let conn = Arc::new(ServerConn {
        session,
        state: Mutex::new(ServerState {
            streams: HashMap::new(),
            last_stream_id: 0,
            peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
        }),
        writer: Mutex::new(ServerWriter {
            encoder: Encoder::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
        }),
        conn_send_window: WindowControl::new(DEFAULT_INITIAL_WINDOW_SIZE),
        handlers: WaitGroup::new(),
        config,
    });

    let result = conn.run(&handler);
    let summary = conn.shutdown(result.as_ref().cloned().unwrap_or_default());
    result.map(|_| summary)
}

impl ServerConn {
    fn run(self: &Arc<Self>, handler: &Arc<dyn H2Handler>) -> Result<ServeSummary> {
        let mut reader = FrameReader::new(self.config.max_frame_size as usize);
        let mut buf = vec![0u8; 16 * 1024];
        let mut deadline = Instant::now() + self.config.idle_timeout;

        let mut preface = BytesMut::new();
        while preface.len() < CONNECTION_PREFACE.len() {
            match self.read_some(&mut buf, &mut deadline)? {
                Some(data) => preface.extend_from_slice(data),
                None => return Err(Error::ConnectionClosed),
            }
        }
        if &preface[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
            return Err(Error::Protocol("invalid client preface".to_string()));
        }
        reader.feed(&preface[CONNECTION_PREFACE.len()..]);

        let settings = SettingsBuilder::new()
            .max_concurrent_streams(self.config.max_concurrent_streams)
            .initial_window_size(self.config.initial_window_size)
            .max_frame_size(self.config.max_frame_size)
            .max_header_list_size(self.config.max_header_list_size)
            .build()?;
        self.send(&FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)))?;
        tracing::debug!("h2 server preface exchanged");

        let mut decoder = Decoder::new();
        let mut rs = ReadState::default();
        loop {
            while let Some(frame) = reader.next_frame()? {
                deadline = Instant::now() + self.config.idle_timeout;
                if let Err(e) = self.dispatch(frame, &mut decoder, &mut rs, handler) {
                    tracing::warn!(error = %e, "h2 server connection error");
                    let goaway = FrameCodec::encode_goaway_frame(&GoawayFrame {
                        last_stream_id: self.state.lock().last_stream_id,
                        error_code: e.goaway_code(),
                        debug_data: Bytes::new(),
                    });
                    if let Err(we) = self.send(&goaway) {
                        tracing::trace!(error = %we, "GOAWAY write failed");
                    }
                    return Err(e);
                }
                if rs.summary.goaway_received {
                    return Ok(rs.summary);
                }
            }
            match self.read_some(&mut buf, &mut deadline)? {
                Some(data) => reader.feed(data),
                None => return Ok(rs.summary),
            }
        }
    }

    /// Next chunk from the transport; `None` on EOF or idle timeout
    fn read_some<'a>(&self, buf: &'a mut [u8], deadline: &mut Instant) -> Result<Option<&'a [u8]>> {
        loop {
            let now = Instant::now();
            if now >= *deadline {
                tracing::debug!("h2 server connection idle timeout");
                return Ok(None);
            }
            match self.session.read_timeout(buf, *deadline - now)? {
                Some(0) => return Ok(None),
                Some(n) => {
                    *deadline = Instant::now() + self.config.idle_timeout;
                    return Ok(Some(&buf[..n]));
                }
                None => continue,
            }
        }
    }

    /// Drain handlers, then close the transport
    fn shutdown(&self, mut summary: ServeSummary) -> ServeSummary {
        summary.drained = self.handlers.wait_timeout(self.config.drain_timeout);
        if !summary.drained {
            tracing::warn!(pending = self.handlers.pending(), "h2 handlers still running at close");
        }
        let streams: Vec<_> = self.state.lock().streams.drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.pipe.abort();
            stream.send_window.close();
        }
        self.conn_send_window.close();
        self.session.close();
        summary
    }

    fn send(&self, wire: &[u8]) -> Result<()> {
        let _writer = self.writer.lock();
        self.session.write_all(wire).map_err(|e| Error::WriteFailed(e.to_string()))
    }

    fn send_rst(&self, stream_id: StreamId, code: ErrorCode) -> Result<()> {
        self.send(&FrameCodec::encode_rst_stream_frame(&RstStreamFrame { stream_id, error_code: code }))
    }

    fn lookup(&self, id: StreamId) -> Option<Arc<H2RequestState>> {
        self.state.lock().streams.get(&id).cloned()
    }

    fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        decoder: &mut Decoder<'static>,
        rs: &mut ReadState,
        handler: &Arc<dyn H2Handler>,
    ) -> Result<()> {
        let kind = frame.frame_type();
        tracing::trace!(
            kind = kind.map(|k| k.name()).unwrap_or("UNKNOWN"),
            stream_id = frame.stream_id,
            len = frame.payload.len(),
            "server read frame"
        );
        if !rs.seen_settings {
            if kind != Some(FrameType::Settings) || frame.flags.is_ack() {
                return Err(Error::Protocol("client preface must be followed by SETTINGS".to_string()));
            }
            rs.seen_settings = true;
        }
        if let Some(p) = &rs.pending {
            if kind != Some(FrameType::Continuation) || frame.stream_id != p.stream_id {
                return Err(Error::Protocol(format!("expected CONTINUATION for stream {}", p.stream_id)));
            }
        }

        match kind {
            Some(FrameType::Headers) => {
                if frame.stream_id == 0 {
                    return Err(Error::Protocol("HEADERS on stream 0".to_string()));
                }
                let frag = parse_header_fragment(&frame)?;
                if frag.end_headers {
                    self.on_header_block(frame.stream_id, &frag.fragment, frag.end_stream, decoder, rs, handler)
                } else {
                    rs.pending = Some(PendingBlock {
                        stream_id: frame.stream_id,
                        block: BytesMut::from(&frag.fragment[..]),
                        end_stream: frag.end_stream,
                    });
                    Ok(())
                }
            }
            Some(FrameType::Continuation) => {
                let mut p = rs
                    .pending
                    .take()
                    .ok_or_else(|| Error::Protocol("CONTINUATION without HEADERS".to_string()))?;
                let frag = parse_header_fragment(&frame)?;
                p.block.extend_from_slice(&frag.fragment);
                if p.block.len() > self.config.max_header_list_size as usize {
                    return Err(Error::Protocol("header block too large".to_string()));
                }
                if frag.end_headers {
                    self.on_header_block(p.stream_id, &p.block, p.end_stream, decoder, rs, handler)
                } else {
                    rs.pending = Some(p);
                    Ok(())
                }
            }
            Some(FrameType::Data) => self.on_data(&frame),
            Some(FrameType::Settings) => self.on_settings(&frame),
            Some(FrameType::WindowUpdate) => {
                let increment = parse_window_update(&frame)?;
                if frame.stream_id == 0 {
                    if increment == 0 {
                        return Err(Error::Protocol("zero connection window increment".to_string()));
                    }
                    self.conn_send_window.increase(increment)?;
                } else if let Some(stream) = self.lookup(frame.stream_id) {
                    if increment == 0 || stream.send_window.increase(increment).is_err() {
                        stream.send_window.close();
                        return self.send_rst(frame.stream_id, ErrorCode::FlowControlError);
                    }
                }
                Ok(())
            }
            Some(FrameType::Ping) => {
                if frame.stream_id != 0 {
                    return Err(Error::Protocol("PING on a stream".to_string()));
                }
                let data = parse_ping(&frame)?;
                if frame.flags.is_ack() {
                    return Ok(());
                }
                self.send(&FrameCodec::encode_ping_frame(&PingFrame { ack: true, data }))
            }
            Some(FrameType::RstStream) => {
                let code = parse_rst_stream(&frame)?;
                if let Some(stream) = self.lookup(frame.stream_id) {
                    tracing::debug!(stream_id = frame.stream_id, code, "client reset stream");
                    stream.pipe.abort();
                    stream.send_window.close();
                }
                Ok(())
            }
            Some(FrameType::Goaway) => {
                let goaway = parse_goaway(&frame)?;
                tracing::debug!(last_stream_id = goaway.last_stream_id, code = goaway.error_code, "client sent GOAWAY");
                rs.summary.goaway_received = true;
                Ok(())
            }
            Some(FrameType::PushPromise) => Err(Error::Protocol("PUSH_PROMISE from client".to_string())),
            Some(FrameType::Priority) | None => Ok(()),
        }
    }

    fn on_header_block(
        self: &Arc<Self>,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        decoder: &mut Decoder<'static>,
        rs: &mut ReadState,
        handler: &Arc<dyn H2Handler>,
    ) -> Result<()> {
        let fields = decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error on stream {}: {:?}", stream_id, e)))?;

        if let Some(stream) = self.lookup(stream_id) {
            // trailers
            if end_stream {
                stream.pipe.close();
            }
            return Ok(());
        }

        let state = {
            let mut state = self.state.lock();
            if stream_id % 2 == 0 {
                return Err(Error::Protocol(format!("invalid client stream id {}", stream_id)));
            }
            if stream_id <= state.last_stream_id {
                // trailers or a late block for a stream whose handler already
                // finished; the block was decoded above so HPACK stays in sync
                tracing::warn!(stream_id, end_stream, "HEADERS for closed stream dropped");
                return Ok(());
            }
            state.last_stream_id = stream_id;
            if state.streams.len() as u32 >= self.config.max_concurrent_streams {
                None
            } else {
                let s = Arc::new(H2RequestState {
                    id: stream_id,
                    pipe: Arc::new(BodyPipe::default()),
                    send_window: WindowControl::new(state.peer_initial_window),
                    dispatched: AtomicBool::new(false),
                });
                state.streams.insert(stream_id, Arc::clone(&s));
                Some(s)
            }
        };
        let Some(state) = state else {
            rs.summary.refused += 1;
            tracing::debug!(stream_id, "refusing stream over concurrency limit");
            return self.send_rst(stream_id, ErrorCode::RefusedStream);
        };

        let Some(request) = H2Request::from_fields(stream_id, fields) else {
            tracing::warn!(stream_id, "request without :method");
            self.state.lock().streams.remove(&stream_id);
            return self.send_rst(stream_id, ErrorCode::ProtocolError);
        };
        if end_stream {
            state.pipe.close();
        }
        rs.summary.streams += 1;
        self.dispatch_handler(state, request, Arc::clone(handler))
    }

    /// Start the handler thread for a stream, at most once
    fn dispatch_handler(
        self: &Arc<Self>,
        stream: Arc<H2RequestState>,
        request: H2Request,
        handler: Arc<dyn H2Handler>,
    ) -> Result<()> {
        if stream.dispatched.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let body = RequestBody { pipe: Arc::clone(&stream.pipe), timeout: self.config.body_read_timeout };
        let conn = Arc::clone(self);
        self.handlers.add();
        let spawned = thread::Builder::new().name("h2-serve-handler".to_string()).spawn(move || {
            let _task = TaskGuard::new(TaskKind::ServeHandler);
            let _done = HandlerDone(&conn);
            let id = stream.id;
            let response = handler.handle(request, body);
            if let Err(e) = conn.send_response(&stream, response) {
                tracing::debug!(stream_id = id, error = %e, "response not delivered");
            }
            conn.state.lock().streams.remove(&id);
        });
        if let Err(e) = spawned {
            self.handlers.done();
            return Err(Error::Io(e));
        }
        Ok(())
    }

    fn send_response(&self, stream: &H2RequestState, response: H2ServerResponse) -> Result<()> {
        let id = stream.id;
        let mut fields = vec![(":status".to_string(), response.status.to_string())];
        let mut has_length = false;
        for (name, value) in &response.headers {
            let name = name.to_ascii_lowercase();
            has_length |= name == "content-length";
            fields.push((name, value.clone()));
        }
        if !has_length {
            fields.push(("content-length".to_string(), response.body.len().to_string()));
        }

        {
            let mut writer = self.writer.lock();
            let mut block = Vec::new();
            writer
                .encoder
                .encode_into(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())), &mut block)
                .map_err(|e| Error::Compression(format!("HPACK encode error: {}", e)))?;
            let wire = FrameCodec::encode_header_block(id, &block, response.body.is_empty(), writer.max_frame_size);
            self.session.write_all(&wire).map_err(|e| Error::WriteFailed(e.to_string()))?;
        }

        let body = response.body;
        let deadline = Instant::now() + self.config.write_timeout;
        let mut offset = 0;
        while offset < body.len() {
            let max = self.writer.lock().max_frame_size;
            let want = (body.len() - offset).min(max);
            let n = loop {
                let n = stream.send_window.try_consume(want);
                if n > 0 {
                    let m = self.conn_send_window.try_consume(n);
                    if m < n {
                        stream.send_window.give_back(n - m);
                    }
                    if m > 0 {
                        break m;
                    }
                    self.conn_send_window.wait_positive(deadline)?;
                } else {
                    stream.send_window.wait_positive(deadline)?;
                }
            };
            let chunk = body.slice(offset..offset + n);
            offset += n;
            let end_stream = offset == body.len();
            self.send(&FrameCodec::encode_data_frame(&DataFrame::new(id, chunk, end_stream)))?;
        }
        Ok(())
    }

    fn on_data(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("DATA on stream 0".to_string()));
        }
        let len = frame.flow_len() as u32;
        let data = parse_data(frame)?;
        let delivered = match self.lookup(frame.stream_id) {
            Some(stream) => {
                let ok = stream.pipe.push(&data);
                if frame.flags.is_end_stream() {
                    stream.pipe.close();
                }
                ok
            }
            None => false,
        };
        if !delivered {
            tracing::warn!(stream_id = frame.stream_id, len, "DATA for unknown or closed stream dropped");
        }
        if len == 0 {
            return Ok(());
        }
        let mut out = BytesMut::new();
        out.put(FrameCodec::encode_window_update_frame(&WindowUpdateFrame { stream_id: 0, size_increment: len }));
        if delivered {
            out.put(FrameCodec::encode_window_update_frame(&WindowUpdateFrame {
                stream_id: frame.stream_id,
                size_increment: len,
            }));
        }
        self.send(&out)
    }

    fn on_settings(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id != 0 {
            return Err(Error::Protocol("SETTINGS on a stream".to_string()));
        }
        if frame.flags.is_ack() {
            return Ok(());
        }
        let settings: Settings = Settings::parse_payload(&frame.payload)?;
        if let Some(window) = settings.initial_window_size {
            let streams: Vec<_> = {
                let mut state = self.state.lock();
                let delta = window as i64 - state.peer_initial_window as i64;
                state.peer_initial_window = window;
                state.streams.values().map(|s| (Arc::clone(s), delta)).collect()
            };
            for (stream, delta) in streams {
                stream.send_window.adjust(delta)?;
            }
        }
        let mut writer = self.writer.lock();
        if let Some(size) = settings.max_frame_size {
            writer.max_frame_size = size as usize;
        }
        self.session
            .write_all(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()))
            .map_err(|e| Error::WriteFailed(e.to_string()))
    }
}

/// Counts a handler thread out of the wait group on every exit path
struct HandlerDone<'a>(&'a ServerConn);

impl Drop for HandlerDone<'_> {
    fn drop(&mut self) {
        self.0.handlers.done();
    }
}
