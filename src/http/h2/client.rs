//! HTTP/2 client connection
//!
//! One [`Http2ClientConnection`] owns one transport and multiplexes any
//! number of concurrent requests over it. A dedicated reader thread
//! demultiplexes inbound frames to streams; every outbound frame goes
//! through a single writer lock that also guards the HPACK encoder.
//!
//! Lock order is writer, then connection state, then individual streams.
//! The read loop never holds the state lock while writing. Control frames
//! (WINDOW_UPDATE, SETTINGS ACK, PING ACK, RST_STREAM) never wait for the
//! writer: when a request writer holds it they are queued and go out ahead
//! of that writer's next frame, or from the read loop once the writer lock
//! is free again.
//!
//! A request runs in three steps: [`new_stream`](Http2ClientConnection::new_stream)
//! registers it, [`do_request`](Http2ClientConnection::do_request) writes it,
//! and [`wait_response`](Http2ClientConnection::wait_response) collects the
//! result and recycles the stream. [`round_trip`](Http2ClientConnection::round_trip)
//! chains the three and classifies the outcome.

use super::codec::{FrameCodec, FrameReader};
use super::error::{Error, ErrorCode, Result};
use super::flow_control::WindowControl;
use super::frames::*;
use super::settings::{Settings, SettingsBuilder};
use super::signal::CloseSignal;
use super::stream::{Delivery, EndReason, H2Response, Http2ClientStream, StreamArena, StreamId, StreamOutcome};
use super::{
    CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_MAX_HEADER_LIST_SIZE, DEFAULT_STREAM_RECEIVE_WINDOW, MAX_STREAM_ID,
};
use crate::diag::{TaskGuard, TaskKind};
use crate::http::packet::{split_request_packet, RequestPacket};
use crate::http::{should_send_req_content_length, Headers, SharedSession};
use bytes::{BufMut, Bytes, BytesMut};
use hpack::{Decoder, Encoder};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Read loop wake-up interval while queued control frames wait for the writer
const QUEUED_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Client connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Close the connection after this long without an inbound frame
    pub idle_timeout: Duration,
    /// Bound on waiting for send credit while writing a request body
    pub write_timeout: Duration,
    /// Advertised SETTINGS_INITIAL_WINDOW_SIZE
    pub initial_window_size: u32,
    /// Advertised SETTINGS_MAX_FRAME_SIZE; larger inbound frames are fatal
    pub max_frame_size: u32,
    pub max_concurrent_streams: u32,
    pub max_header_list_size: u32,
    /// Forward the caller's content-length as is
    pub preserve_content_length: bool,
    /// Streams kept for reuse
    pub stream_arena_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            idle_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(30),
            initial_window_size: DEFAULT_STREAM_RECEIVE_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
            preserve_content_length: false,
            stream_arena_capacity: 64,
        }
    }
}

impl ClientConfig {
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn preserve_content_length(mut self, preserve: bool) -> Self {
        self.preserve_content_length = preserve;
        self
    }

    /// SETTINGS sent with the preface
    fn local_settings(&self) -> Result<Settings> {
        SettingsBuilder::new()
            .enable_push(false)
            .initial_window_size(self.initial_window_size)
            .max_frame_size(self.max_frame_size)
            .max_concurrent_streams(self.max_concurrent_streams)
            .max_header_list_size(self.max_header_list_size)
            .build()
    }
}

/// Outcome of one request
#[derive(Debug)]
pub enum RoundTrip {
    Success(H2Response),
    /// Nothing reached a peer that will process it; replay on a fresh
    /// connection
    NeedReconnect(Error),
    /// The request failed; whatever arrived before the failure is kept
    Fatal { error: Error, partial: Option<H2Response> },
}

impl RoundTrip {
    fn from_outcome(outcome: StreamOutcome) -> Self {
        match outcome.error {
            None => RoundTrip::Success(outcome.response),
            Some(error) if error.is_retryable() => RoundTrip::NeedReconnect(error),
            Some(error) => RoundTrip::Fatal {
                error,
                partial: if outcome.response.is_empty() { None } else { Some(outcome.response) },
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RoundTrip::Success(_))
    }
}

struct ConnState {
    streams: HashMap<StreamId, Arc<Http2ClientStream>>,
    next_stream_id: StreamId,
    closed: bool,
    read_goaway: bool,
    last_stream_id: StreamId,
    full: bool,
    max_concurrent_streams: u32,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE, our per-stream send credit
    peer_initial_window: u32,
}

struct FrameWriter {
    encoder: Encoder<'static>,
    /// Highest stream id whose HEADERS went out
    last_opened: StreamId,
}

/// Header block being reassembled from HEADERS + CONTINUATION
struct PendingHeaders {
    stream_id: StreamId,
    block: BytesMut,
    end_stream: bool,
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// A multiplexed HTTP/2 client connection
pub struct Http2ClientConnection {
    session: Arc<SharedSession>,
    config: ClientConfig,
    scheme: &'static str,
    /// `:authority` when the request names none
    authority: String,
    state: Mutex<ConnState>,
    writer: Mutex<FrameWriter>,
    /// Control frames waiting for the writer lock
    queued: Mutex<BytesMut>,
    /// Peer's SETTINGS_MAX_FRAME_SIZE
    peer_max_frame_size: AtomicUsize,
    decoder: Mutex<Decoder<'static>>,
    conn_send_window: WindowControl,
    preface_sent: AtomicBool,
    closing: AtomicBool,
    close_signal: CloseSignal,
    arena: StreamArena,
    cleanup_runs: AtomicUsize,
    on_close: Mutex<Option<CloseHook>>,
}

impl Http2ClientConnection {
    /// Wrap an established transport; no bytes are exchanged yet
    pub fn new(session: Arc<SharedSession>, https: bool, authority: impl Into<String>, config: ClientConfig) -> Self {
        let arena = StreamArena::new(config.stream_arena_capacity);
        Http2ClientConnection {
            session,
            scheme: if https { "https" } else { "http" },
            authority: authority.into(),
            state: Mutex::new(ConnState {
                streams: HashMap::new(),
                next_stream_id: 1,
                closed: false,
                read_goaway: false,
                last_stream_id: 0,
                full: false,
                max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
                peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            }),
            writer: Mutex::new(FrameWriter {
                encoder: Encoder::new(),
                last_opened: 0,
            }),
            queued: Mutex::new(BytesMut::new()),
            peer_max_frame_size: AtomicUsize::new(DEFAULT_MAX_FRAME_SIZE as usize),
            decoder: Mutex::new(Decoder::new()),
            conn_send_window: WindowControl::new(DEFAULT_INITIAL_WINDOW_SIZE),
            preface_sent: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_signal: CloseSignal::new(),
            arena,
            cleanup_runs: AtomicUsize::new(0),
            on_close: Mutex::new(None),
            config,
        }
    }

    /// Create, start the reader and send the preface
    pub fn handshake(
        session: Arc<SharedSession>,
        https: bool,
        authority: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        let conn = Arc::new(Self::new(session, https, authority, config));
        conn.start()?;
        if let Err(e) = conn.preface() {
            conn.set_close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Spawn the read loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let conn = Arc::clone(self);
        thread::Builder::new()
            .name("h2-read-loop".to_string())
            .spawn(move || conn.read_loop())?;
        Ok(())
    }

    /// Send the client preface and our SETTINGS
    pub fn preface(&self) -> Result<()> {
        let settings = self.config.local_settings()?;
        let mut wire = BytesMut::with_capacity(CONNECTION_PREFACE.len() + 64);
        wire.put_slice(CONNECTION_PREFACE);
        wire.put(FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)));

        let _writer = self.writer.lock();
        self.session
            .write_all(&wire)
            .map_err(|e| Error::WriteFailed(format!("preface: {}", e)))?;
        self.preface_sent.store(true, Ordering::Release);
        tracing::debug!(authority = %self.authority, "h2 preface sent");
        Ok(())
    }

    /// Run a hook once the connection closes; runs at once if already closed
    pub fn set_on_close(&self, hook: impl FnOnce() + Send + 'static) {
        if self.close_signal.is_fired() {
            hook();
            return;
        }
        *self.on_close.lock() = Some(Box::new(hook));
        // lost the race with cleanup
        if self.close_signal.is_fired() {
            if let Some(hook) = self.on_close.lock().take() {
                hook();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn read_goaway(&self) -> bool {
        self.state.lock().read_goaway
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().full
    }

    /// Whether a new request may be started here
    pub fn is_usable(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let state = self.state.lock();
        !(state.closed || state.read_goaway || state.full)
    }

    pub fn active_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// How many times the cleanup body ran; 1 after any number of closes
    pub fn cleanup_count(&self) -> usize {
        self.cleanup_runs.load(Ordering::SeqCst)
    }

    /// Block until the connection is closed; returns whether it closed in time
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        self.close_signal.wait_timeout(timeout)
    }

    pub fn arena(&self) -> &StreamArena {
        &self.arena
    }

    /// Register a stream for a raw HTTP/1.x request packet
    pub fn new_stream(&self, request: Bytes) -> Result<Arc<Http2ClientStream>> {
        let mut state = self.state.lock();
        if state.read_goaway {
            return Err(Error::CreateStreamAfterGoAway);
        }
        if state.closed || self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if !self.preface_sent.load(Ordering::Acquire) {
            return Err(Error::Protocol("stream requested before preface".to_string()));
        }
        if state.next_stream_id > MAX_STREAM_ID {
            // id space exhausted; retire the connection
            state.read_goaway = true;
            return Err(Error::CreateStreamAfterGoAway);
        }

        let id = state.next_stream_id;
        state.next_stream_id += 2;
        let stream = self.arena.acquire(id, request, state.peer_initial_window);
        state.streams.insert(id, Arc::clone(&stream));
        state.full = state.streams.len() as u32 >= state.max_concurrent_streams;
        tracing::trace!(stream_id = id, active = state.streams.len(), "stream registered");
        Ok(stream)
    }

    /// Write the stream's request: HEADERS (+ CONTINUATION), then DATA
    ///
    /// A broken transport detected on the first write yields
    /// [`Error::CreateStreamAfterGoAway`]; nothing usable reached the peer.
    pub fn do_request(&self, stream: &Arc<Http2ClientStream>) -> Result<()> {
        let packet = split_request_packet(&stream.request()).map_err(|e| Error::InvalidRequest(e.to_string()))?;
        let fields = self.request_fields(&packet);
        let body = packet.body;
        let deadline = Instant::now() + self.config.write_timeout;

        let mut writer = self.writer.lock();
        let id = self.open_stream_id(stream, &writer)?;
        writer.last_opened = id;

        let mut block = Vec::new();
        writer
            .encoder
            .encode_into(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())), &mut block)
            .map_err(|e| Error::Compression(format!("HPACK encode error: {}", e)))?;
        let wire = FrameCodec::encode_header_block(id, &block, false, self.max_frame_size());
        self.write_request(&wire, true)?;
        stream.mark_headers_sent();
        tracing::trace!(stream_id = id, fields = fields.len(), block = block.len(), "sent HEADERS");

        if body.is_empty() {
            let frame = FrameCodec::encode_data_frame(&DataFrame::new(id, Bytes::new(), true));
            self.write_request(&frame, false)?;
            stream.mark_data_sent(false, true);
            return Ok(());
        }

        let mut offset = 0;
        while offset < body.len() {
            if stream.is_ended() {
                // reset or refused mid-body; the waiter reports why
                return Ok(());
            }
            let want = (body.len() - offset).min(self.max_frame_size());
            let granted = match self.take_credit(stream, want) {
                Some(n) => n,
                None => match MutexGuard::unlocked(&mut writer, || self.wait_credit(stream, want, deadline)) {
                    Ok(n) => n,
                    Err(Error::ConnectionClosed) => return Ok(()),
                    Err(Error::Timeout) => {
                        tracing::debug!(stream_id = id, "timed out waiting for send window");
                        if stream.set_end(EndReason::Timeout) {
                            let rst = FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
                                stream_id: id,
                                error_code: ErrorCode::Cancel,
                            });
                            self.write_request(&rst, false)?;
                        }
                        return Err(Error::Timeout);
                    }
                    Err(e) => return Err(e),
                },
            };
            // the peer may have lowered SETTINGS_MAX_FRAME_SIZE while we waited
            let n = granted.min(self.max_frame_size());
            if n < granted {
                stream.send_window().give_back(granted - n);
                self.conn_send_window.give_back(granted - n);
            }

            let chunk = body.slice(offset..offset + n);
            offset += n;
            let end_stream = offset == body.len();
            let frame = FrameCodec::encode_data_frame(&DataFrame::new(id, chunk, end_stream));
            self.write_request(&frame, false)?;
            stream.mark_data_sent(true, end_stream);
            tracing::trace!(stream_id = id, len = n, end_stream, "sent DATA");
        }
        Ok(())
    }

    /// Wait for the stream to end, then finalize and recycle it
    ///
    /// A timeout resets the stream but leaves the connection usable. If the
    /// connection is closing when the timeout fires, the closed error wins.
    /// The reset is queued rather than waited for when another request is
    /// holding the writer, so this returns promptly after `timeout`.
    pub fn wait_response(&self, stream: Arc<Http2ClientStream>, timeout: Duration) -> StreamOutcome {
        match stream.take_end_receiver() {
            Some(rx) => match rx.recv_timeout(timeout) {
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_closed() {
                        stream.set_end(EndReason::ConnClosed);
                    } else if stream.set_end(EndReason::Timeout) {
                        tracing::debug!(stream_id = stream.id(), "response wait timed out");
                        if let Err(e) = self.send_rst(stream.id(), ErrorCode::Cancel) {
                            tracing::debug!(error = %e, "RST_STREAM after timeout failed");
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    stream.set_end(EndReason::ConnClosed);
                }
            },
            None => {
                tracing::warn!(stream_id = stream.id(), "stream waited on twice");
                stream.set_end(EndReason::ConnClosed);
            }
        }

        let outcome = stream.finish();
        self.release_stream(stream);
        outcome
    }

    /// Send one request and classify the outcome
    pub fn round_trip(&self, request: Bytes, timeout: Duration) -> RoundTrip {
        let stream = match self.new_stream(request) {
            Ok(stream) => stream,
            Err(e) => return RoundTrip::NeedReconnect(e),
        };

        if let Err(e) = self.do_request(&stream) {
            stream.set_end(match e {
                Error::Timeout => EndReason::Timeout,
                _ => EndReason::ConnClosed,
            });
            let outcome = stream.finish();
            self.release_stream(stream);
            return if e.is_retryable() {
                RoundTrip::NeedReconnect(e)
            } else {
                RoundTrip::Fatal {
                    error: e,
                    partial: if outcome.response.is_empty() { None } else { Some(outcome.response) },
                }
            };
        }

        RoundTrip::from_outcome(self.wait_response(stream, timeout))
    }

    /// Close the connection; only the first call runs the cleanup
    pub fn set_close(&self) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.cleanup_resources();
    }

    fn cleanup_resources(&self) {
        self.cleanup_runs.fetch_add(1, Ordering::SeqCst);

        let streams: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.streams.drain().map(|(_, s)| s).collect()
        };
        let ended = streams.len();
        for stream in streams {
            stream.set_end(EndReason::ConnClosed);
        }
        self.conn_send_window.close();
        // an HPACK decoder cannot be reset, only replaced
        *self.decoder.lock() = Decoder::new();
        self.session.close();
        self.close_signal.fire();
        tracing::debug!(authority = %self.authority, ended, "h2 connection closed");

        if let Some(hook) = self.on_close.lock().take() {
            hook();
        }
    }

    fn request_fields(&self, packet: &RequestPacket) -> Vec<(String, String)> {
        let method = packet.method.clone();
        let authority = packet.authority().unwrap_or_else(|| self.authority.clone());
        let mut fields = Vec::with_capacity(packet.headers.len() + 5);

        fields.push((":method".to_string(), method.clone()));
        if method.eq_ignore_ascii_case("CONNECT") {
            fields.push((":authority".to_string(), authority));
        } else {
            let target = packet.target();
            let scheme = target.scheme.unwrap_or_else(|| self.scheme.to_string());
            fields.push((":path".to_string(), target.path));
            fields.push((":scheme".to_string(), scheme));
            fields.push((":authority".to_string(), authority));
        }

        let mut has_length = false;
        for (name, value) in packet.headers.iter() {
            let name = name.to_ascii_lowercase();
            if Headers::is_connection_specific(&name) || name == "host" {
                continue;
            }
            if name == "te" && !value.eq_ignore_ascii_case("trailers") {
                continue;
            }
            if name == "content-length" {
                if !self.config.preserve_content_length {
                    continue;
                }
                has_length = true;
            }
            fields.push((name, value.to_string()));
        }

        let len = packet.body.len() as i64;
        if !has_length && should_send_req_content_length(&method.to_ascii_uppercase(), len) {
            fields.push(("content-length".to_string(), len.to_string()));
        }
        fields
    }

    /// Stream id to open on the wire, renumbering a stream overtaken by a
    /// later one so ids stay increasing
    fn open_stream_id(&self, stream: &Http2ClientStream, writer: &FrameWriter) -> Result<StreamId> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::CreateStreamAfterGoAway);
        }
        let id = stream.id();
        if state.read_goaway && id > state.last_stream_id {
            return Err(Error::CreateStreamAfterGoAway);
        }
        if id > writer.last_opened {
            return Ok(id);
        }
        if state.read_goaway || state.next_stream_id > MAX_STREAM_ID {
            return Err(Error::CreateStreamAfterGoAway);
        }

        let new_id = state.next_stream_id;
        state.next_stream_id += 2;
        if let Some(s) = state.streams.remove(&id) {
            state.streams.insert(new_id, s);
        }
        stream.set_id(new_id);
        tracing::debug!(old = id, new = new_id, "renumbered stream opened out of order");
        Ok(new_id)
    }

    fn max_frame_size(&self) -> usize {
        self.peer_max_frame_size.load(Ordering::Acquire)
    }

    /// Credit available right now from both windows
    fn take_credit(&self, stream: &Http2ClientStream, want: usize) -> Option<usize> {
        let n = stream.send_window().try_consume(want);
        if n == 0 {
            return None;
        }
        let m = self.conn_send_window.try_consume(n);
        if m < n {
            stream.send_window().give_back(n - m);
        }
        if m == 0 {
            None
        } else {
            Some(m)
        }
    }

    fn wait_credit(&self, stream: &Http2ClientStream, want: usize, deadline: Instant) -> Result<usize> {
        loop {
            if let Some(n) = self.take_credit(stream, want) {
                return Ok(n);
            }
            let window = stream.send_window();
            if window.is_closed() || window.size() <= 0 {
                window.wait_positive(deadline)?;
            } else {
                self.conn_send_window.wait_positive(deadline)?;
            }
        }
    }

    /// Write request frames; the caller holds the writer lock
    ///
    /// Queued control frames go out first, in one write.
    fn write_request(&self, wire: &[u8], first: bool) -> Result<()> {
        let queued = std::mem::take(&mut *self.queued.lock());
        let result = if queued.is_empty() {
            self.session.write_all(wire)
        } else {
            let mut out = queued;
            out.extend_from_slice(wire);
            self.session.write_all(&out)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if first && is_stale_transport(&e) => {
                tracing::debug!(error = %e, "stale connection on first write");
                self.set_close();
                Err(Error::CreateStreamAfterGoAway)
            }
            Err(e) => {
                tracing::warn!(error = %e, "request write failed");
                self.set_close();
                Err(Error::WriteFailed(e.to_string()))
            }
        }
    }

    /// Write a control frame now, or queue it while the writer is busy
    fn send(&self, wire: &[u8]) -> Result<()> {
        self.queued.lock().extend_from_slice(wire);
        self.flush_queued()
    }

    /// Write queued control frames if the writer lock is free
    fn flush_queued(&self) -> Result<()> {
        if !self.has_queued() {
            return Ok(());
        }
        let Some(_writer) = self.writer.try_lock() else {
            tracing::trace!("writer busy, control frames queued");
            return Ok(());
        };
        let out = std::mem::take(&mut *self.queued.lock());
        if out.is_empty() {
            return Ok(());
        }
        self.session.write_all(&out).map_err(|e| Error::WriteFailed(e.to_string()))
    }

    fn has_queued(&self) -> bool {
        !self.queued.lock().is_empty()
    }

    fn send_rst(&self, stream_id: StreamId, code: ErrorCode) -> Result<()> {
        self.send(&FrameCodec::encode_rst_stream_frame(&RstStreamFrame { stream_id, error_code: code }))
    }

    fn release_stream(&self, stream: Arc<Http2ClientStream>) {
        let id = stream.id();
        let drained = {
            let mut state = self.state.lock();
            if state.streams.get(&id).is_some_and(|s| Arc::ptr_eq(s, &stream)) {
                state.streams.remove(&id);
            }
            state.full = state.streams.len() as u32 >= state.max_concurrent_streams;
            state.read_goaway && state.streams.is_empty() && !state.closed
        };
        self.arena.release(stream);
        if drained {
            tracing::debug!(authority = %self.authority, "GOAWAY drained, closing");
            self.set_close();
        }
    }

    fn lookup(&self, id: StreamId) -> Option<Arc<Http2ClientStream>> {
        self.state.lock().streams.get(&id).cloned()
    }

    fn read_loop(self: Arc<Self>) {
        let _task = TaskGuard::new(TaskKind::ReadLoop);
        let _close = CloseOnExit(&self);

        let mut reader = FrameReader::new(self.config.max_frame_size as usize);
        let mut pending: Option<PendingHeaders> = None;
        let mut seen_settings = false;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut deadline = Instant::now() + self.config.idle_timeout;

        loop {
            loop {
                match reader.next_frame() {
                    Ok(Some(frame)) => {
                        deadline = Instant::now() + self.config.idle_timeout;
                        if let Err(e) = self.dispatch(frame, &mut pending, &mut seen_settings) {
                            self.fail(e);
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                }
            }

            if self.is_closed() {
                return;
            }
            if let Err(e) = self.flush_queued() {
                tracing::warn!(authority = %self.authority, error = %e, "control frame write failed");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(authority = %self.authority, "h2 connection idle timeout");
                return;
            }
            let mut wait = deadline - now;
            if self.has_queued() {
                wait = wait.min(QUEUED_FLUSH_INTERVAL);
            }
            match self.session.read_timeout(&mut buf, wait) {
                Ok(Some(0)) => {
                    tracing::debug!(authority = %self.authority, "peer closed h2 connection");
                    return;
                }
                Ok(Some(n)) => reader.feed(&buf[..n]),
                Ok(None) => {}
                Err(e) => {
                    if !self.is_closed() {
                        tracing::warn!(authority = %self.authority, error = %e, "h2 read loop exiting");
                    }
                    return;
                }
            }
        }
    }

    /// Report a connection error to the peer before the read loop exits
    fn fail(&self, err: Error) {
        if self.is_closed() {
            return;
        }
        match err {
            Error::Compression(_) => tracing::error!(error = %err, "HPACK state lost, closing connection"),
            _ => tracing::warn!(error = %err, "h2 connection error"),
        }
        let goaway = FrameCodec::encode_goaway_frame(&GoawayFrame {
            last_stream_id: 0,
            error_code: err.goaway_code(),
            debug_data: Bytes::from(err.to_string()),
        });
        if let Err(e) = self.send(&goaway) {
            tracing::trace!(error = %e, "GOAWAY write failed");
        }
    }

    fn dispatch(&self, frame: Frame, pending: &mut Option<PendingHeaders>, seen_settings: &mut bool) -> Result<()> {
        let kind = frame.frame_type();
        tracing::trace!(
            kind = kind.map(|k| k.name()).unwrap_or("UNKNOWN"),
            stream_id = frame.stream_id,
            len = frame.payload.len(),
            flags = frame.flags.as_u8(),
            "read frame"
        );

        if kind != Some(FrameType::Settings) && !self.preface_sent.load(Ordering::Acquire) {
            return Err(Error::Protocol("frame received before client preface".to_string()));
        }
        if !*seen_settings {
            if kind != Some(FrameType::Settings) || frame.flags.is_ack() {
                return Err(Error::Protocol("server preface must start with SETTINGS".to_string()));
            }
            *seen_settings = true;
        }
        if let Some(p) = pending {
            if kind != Some(FrameType::Continuation) || frame.stream_id != p.stream_id {
                return Err(Error::Protocol(format!("expected CONTINUATION for stream {}", p.stream_id)));
            }
        }

        match kind {
            Some(FrameType::Headers) => self.on_headers(&frame, pending),
            Some(FrameType::Continuation) => self.on_continuation(&frame, pending),
            Some(FrameType::Data) => self.on_data(&frame),
            Some(FrameType::Settings) => self.on_settings(&frame),
            Some(FrameType::WindowUpdate) => self.on_window_update(&frame),
            Some(FrameType::Ping) => self.on_ping(&frame),
            Some(FrameType::RstStream) => self.on_rst_stream(&frame),
            Some(FrameType::Goaway) => self.on_goaway(&frame),
            Some(FrameType::PushPromise) => Err(Error::Protocol("PUSH_PROMISE with push disabled".to_string())),
            Some(FrameType::Priority) | None => Ok(()),
        }
    }

    fn on_headers(&self, frame: &Frame, pending: &mut Option<PendingHeaders>) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("HEADERS on stream 0".to_string()));
        }
        let frag = parse_header_fragment(frame)?;
        if frag.end_headers {
            return self.apply_header_block(frame.stream_id, &frag.fragment, frag.end_stream);
        }
        *pending = Some(PendingHeaders {
            stream_id: frame.stream_id,
            block: BytesMut::from(&frag.fragment[..]),
            end_stream: frag.end_stream,
        });
        Ok(())
    }

    fn on_continuation(&self, frame: &Frame, pending: &mut Option<PendingHeaders>) -> Result<()> {
        let mut headers = pending
            .take()
            .ok_or_else(|| Error::Protocol("CONTINUATION without HEADERS".to_string()))?;
        let frag = parse_header_fragment(frame)?;
        headers.block.extend_from_slice(&frag.fragment);
        if headers.block.len() > self.config.max_header_list_size as usize {
            return Err(Error::Protocol(format!(
                "header block for stream {} exceeds {} bytes",
                headers.stream_id, self.config.max_header_list_size
            )));
        }
        if frag.end_headers {
            return self.apply_header_block(headers.stream_id, &headers.block, headers.end_stream);
        }
        *pending = Some(headers);
        Ok(())
    }

    /// Decode a complete header block and hand it to its stream
    ///
    /// Blocks for unknown streams are decoded anyway to keep the shared
    /// HPACK state in sync.
    fn apply_header_block(&self, stream_id: StreamId, block: &[u8], end_stream: bool) -> Result<()> {
        let fields = self
            .decoder
            .lock()
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error on stream {}: {:?}", stream_id, e)))?;

        let Some(stream) = self.lookup(stream_id) else {
            tracing::warn!(stream_id, "HEADERS for unknown stream dropped");
            return Ok(());
        };
        match stream.on_headers(fields, end_stream) {
            Delivery::Applied => Ok(()),
            Delivery::Dropped => {
                tracing::warn!(stream_id, "HEADERS for ended stream dropped");
                Ok(())
            }
            Delivery::Malformed => {
                tracing::warn!(stream_id, "response head without :status");
                self.send_rst(stream_id, ErrorCode::ProtocolError)
            }
        }
    }

    fn on_data(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("DATA on stream 0".to_string()));
        }
        let len = frame.flow_len() as u32;
        let data = parse_data(frame)?;
        let delivery = match self.lookup(frame.stream_id) {
            Some(stream) => stream.on_data(&data, frame.flags.is_end_stream()),
            None => Delivery::Dropped,
        };

        let mut out = BytesMut::new();
        if len > 0 {
            out.put(FrameCodec::encode_window_update_frame(&WindowUpdateFrame { stream_id: 0, size_increment: len }));
            if delivery == Delivery::Applied {
                out.put(FrameCodec::encode_window_update_frame(&WindowUpdateFrame {
                    stream_id: frame.stream_id,
                    size_increment: len,
                }));
            }
        }
        match delivery {
            Delivery::Applied => {}
            Delivery::Dropped => tracing::warn!(stream_id = frame.stream_id, len, "DATA for unknown or ended stream dropped"),
            Delivery::Malformed => {
                tracing::warn!(stream_id = frame.stream_id, "DATA before response head");
                out.put(FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
                    stream_id: frame.stream_id,
                    error_code: ErrorCode::ProtocolError,
                }));
            }
        }
        if out.is_empty() {
            return Ok(());
        }
        self.send(&out)
    }

    fn on_settings(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id != 0 {
            return Err(Error::Protocol("SETTINGS on a stream".to_string()));
        }
        if frame.flags.is_ack() {
            if !frame.payload.is_empty() {
                return Err(Error::FrameSize("SETTINGS ACK with payload".to_string()));
            }
            tracing::debug!(authority = %self.authority, "SETTINGS acknowledged");
            return Ok(());
        }

        let settings = Settings::parse_payload(&frame.payload)?;
        let (delta, streams) = {
            let mut state = self.state.lock();
            if let Some(max) = settings.max_concurrent_streams {
                state.max_concurrent_streams = max;
                state.full = state.streams.len() as u32 >= max;
            }
            match settings.initial_window_size {
                Some(window) => {
                    let delta = window as i64 - state.peer_initial_window as i64;
                    state.peer_initial_window = window;
                    (delta, state.streams.values().cloned().collect::<Vec<_>>())
                }
                None => (0, Vec::new()),
            }
        };
        if delta != 0 {
            for stream in streams {
                stream.send_window().adjust(delta)?;
            }
        }

        if let Some(size) = settings.max_frame_size {
            self.peer_max_frame_size.store(size as usize, Ordering::Release);
        }
        tracing::debug!(?settings, "applied peer SETTINGS");
        self.send(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()))
    }

    fn on_window_update(&self, frame: &Frame) -> Result<()> {
        let increment = parse_window_update(frame)?;
        if frame.stream_id == 0 {
            if increment == 0 {
                return Err(Error::Protocol("zero connection window increment".to_string()));
            }
            self.conn_send_window.increase(increment)?;
            return Ok(());
        }

        let Some(stream) = self.lookup(frame.stream_id) else {
            tracing::trace!(stream_id = frame.stream_id, "WINDOW_UPDATE for unknown stream");
            return Ok(());
        };
        if increment == 0 {
            tracing::warn!(stream_id = frame.stream_id, "zero stream window increment");
            stream.set_end(EndReason::LocalReset(ErrorCode::ProtocolError));
            return self.send_rst(frame.stream_id, ErrorCode::ProtocolError);
        }
        if let Err(e) = stream.send_window().increase(increment) {
            tracing::warn!(stream_id = frame.stream_id, error = %e, "stream window overflow");
            stream.set_end(EndReason::LocalReset(ErrorCode::FlowControlError));
            return self.send_rst(frame.stream_id, ErrorCode::FlowControlError);
        }
        Ok(())
    }

    fn on_ping(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id != 0 {
            return Err(Error::Protocol("PING on a stream".to_string()));
        }
        let data = parse_ping(frame)?;
        if frame.flags.is_ack() {
            return Ok(());
        }
        self.send(&FrameCodec::encode_ping_frame(&PingFrame { ack: true, data }))
    }

    fn on_rst_stream(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("RST_STREAM on stream 0".to_string()));
        }
        let code = parse_rst_stream(frame)?;
        match self.lookup(frame.stream_id) {
            Some(stream) => {
                if stream.set_end(EndReason::Reset(code)) {
                    tracing::debug!(stream_id = frame.stream_id, code, "stream reset by peer");
                }
            }
            None => tracing::trace!(stream_id = frame.stream_id, "RST_STREAM for unknown stream"),
        }
        Ok(())
    }

    fn on_goaway(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id != 0 {
            return Err(Error::Protocol("GOAWAY on a stream".to_string()));
        }
        let goaway = parse_goaway(frame)?;
        tracing::debug!(
            authority = %self.authority,
            last_stream_id = goaway.last_stream_id,
            code = goaway.error_code,
            debug = %String::from_utf8_lossy(&goaway.debug_data),
            "received GOAWAY"
        );

        let (refused, drained) = {
            let mut state = self.state.lock();
            state.read_goaway = true;
            state.last_stream_id = goaway.last_stream_id;
            let refused: Vec<_> = state
                .streams
                .iter()
                .filter(|(id, _)| **id > goaway.last_stream_id)
                .map(|(_, s)| Arc::clone(s))
                .collect();
            (refused, state.streams.is_empty())
        };
        for stream in refused {
            stream.set_end(EndReason::Refused { last_stream_id: goaway.last_stream_id });
        }
        if drained {
            self.set_close();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Http2ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2ClientConnection")
            .field("authority", &self.authority)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes the connection when the read loop exits by any path
struct CloseOnExit<'a>(&'a Http2ClientConnection);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.set_close();
    }
}

/// Write errors meaning the peer was already gone before we wrote
fn is_stale_transport(err: &crate::http::Error) -> bool {
    match err {
        crate::http::Error::ConnectionClosed => true,
        crate::http::Error::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Arc<SharedSession>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Arc::new(SharedSession::from_tcp_stream(client)), server)
    }

    fn conn(config: ClientConfig) -> (Http2ClientConnection, TcpStream) {
        let (session, server) = pair();
        let conn = Http2ClientConnection::new(session, true, "example.com", config);
        conn.preface_sent.store(true, Ordering::Release);
        (conn, server)
    }

    fn packet(raw: &str) -> RequestPacket {
        split_request_packet(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_request_fields_strip_connection_headers() {
        let (conn, _server) = conn(ClientConfig::default());
        let fields = conn.request_fields(&packet(
            "GET /a?b=1 HTTP/1.1\r\nHost: h.test\r\nConnection: keep-alive\r\nX-Id: 7\r\nContent-Length: 0\r\n\r\n",
        ));
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![":method", ":path", ":scheme", ":authority", "x-id"]);
        assert_eq!(fields[1].1, "/a?b=1");
        assert_eq!(fields[2].1, "https");
        assert_eq!(fields[3].1, "h.test");
    }

    #[test]
    fn test_request_fields_content_length() {
        let (conn, _server) = conn(ClientConfig::default());
        let fields = conn.request_fields(&packet("POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 99\r\n\r\nabc"));
        assert!(fields.contains(&("content-length".to_string(), "3".to_string())));

        let fields = conn.request_fields(&packet("POST / HTTP/1.1\r\nHost: h\r\n\r\n"));
        assert!(fields.contains(&("content-length".to_string(), "0".to_string())));

        let (conn, _server) = self::conn(ClientConfig::default().preserve_content_length(true));
        let fields = conn.request_fields(&packet("POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 99\r\n\r\nabc"));
        let lengths: Vec<_> = fields.iter().filter(|(n, _)| n == "content-length").collect();
        assert_eq!(lengths.len(), 1);
        assert_eq!(lengths[0].1, "99");
    }

    #[test]
    fn test_connect_uses_authority_only() {
        let (conn, _server) = conn(ClientConfig::default());
        let fields = conn.request_fields(&packet("CONNECT proxy.test:443 HTTP/1.1\r\nHost: proxy.test:443\r\n\r\n"));
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![":method", ":authority"]);
    }

    #[test]
    fn test_absolute_uri_without_host() {
        let (conn, _server) = conn(ClientConfig::default());
        let fields = conn.request_fields(&packet("GET http://abs.test:8080/x HTTP/1.1\r\n\r\n"));
        assert_eq!(fields[1], (":path".to_string(), "/x".to_string()));
        assert_eq!(fields[2], (":scheme".to_string(), "http".to_string()));
        assert_eq!(fields[3], (":authority".to_string(), "abs.test:8080".to_string()));
    }

    #[test]
    fn test_stream_ids_are_odd_and_increasing() {
        let (conn, _server) = conn(ClientConfig::default());
        let ids: Vec<_> = (0..5).map(|_| conn.new_stream(Bytes::new()).unwrap().id()).collect();
        assert_eq!(ids, vec![1, 3, 5, 7, 9]);
        assert_eq!(conn.active_streams(), 5);
    }

    #[test]
    fn test_set_close_runs_cleanup_once() {
        let (conn, _server) = conn(ClientConfig::default());
        let conn = Arc::new(conn);
        let stream = conn.new_stream(Bytes::new()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&conn);
                thread::spawn(move || c.set_close())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(conn.cleanup_count(), 1);
        assert_eq!(stream.end_reason(), Some(EndReason::ConnClosed));
        assert!(conn.wait_closed(Duration::ZERO));
        assert!(matches!(conn.new_stream(Bytes::new()), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_close_hook_runs_once() {
        let (conn, _server) = conn(ClientConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        conn.set_on_close(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        conn.set_close();
        conn.set_close();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = Arc::clone(&hits);
        conn.set_on_close(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_full_tracks_concurrency_limit() {
        let (conn, _server) = conn(ClientConfig::default());
        conn.state.lock().max_concurrent_streams = 2;
        let a = conn.new_stream(Bytes::new()).unwrap();
        assert!(!conn.is_full());
        let _b = conn.new_stream(Bytes::new()).unwrap();
        assert!(conn.is_full());
        assert!(!conn.is_usable());

        a.set_end(EndReason::Normal);
        let outcome = conn.wait_response(a, Duration::from_millis(10));
        assert!(outcome.error.is_none());
        assert!(!conn.is_full());
        assert_eq!(conn.arena().idle(), 1);
    }

    #[test]
    fn test_control_frames_queue_behind_busy_writer() {
        use std::io::Read;

        let (conn, mut server) = conn(ClientConfig::default());
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let busy = conn.writer.lock();
        conn.send_rst(1, ErrorCode::Cancel).unwrap();
        assert!(conn.has_queued());
        drop(busy);

        conn.flush_queued().unwrap();
        assert!(!conn.has_queued());
        let mut buf = [0u8; 13];
        server.read_exact(&mut buf).unwrap();
        let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_SIZE as usize);
        reader.feed(&buf);
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.frame_type(), Some(FrameType::RstStream));
        assert_eq!(parse_rst_stream(&frame).unwrap(), ErrorCode::Cancel.as_u32());
    }

    #[test]
    fn test_round_trip_classification() {
        let ok = StreamOutcome { response: H2Response { status: 200, ..Default::default() }, error: None };
        assert!(RoundTrip::from_outcome(ok).is_success());

        let refused = StreamOutcome {
            response: H2Response::default(),
            error: Some(Error::Refused { stream_id: 5, last_stream_id: 3 }),
        };
        assert!(matches!(RoundTrip::from_outcome(refused), RoundTrip::NeedReconnect(_)));

        let partial = StreamOutcome {
            response: H2Response { status: 200, body: Bytes::from_static(b"x"), ..Default::default() },
            error: Some(Error::ConnectionClosed),
        };
        match RoundTrip::from_outcome(partial) {
            RoundTrip::Fatal { error: Error::ConnectionClosed, partial: Some(resp) } => assert_eq!(&resp.body[..], b"x"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
