//! Shared helpers for integration tests: a raw-frame mock peer and a
//! threaded `serve_h2` listener

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use hpack::{Decoder, Encoder};
use lowhttp::http::h2::frames::{parse_data, parse_header_fragment};
use lowhttp::http::h2::*;
use lowhttp::http::tls::TlsConfig;
use lowhttp::http::SharedSession;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Plain-TCP client connection with prior knowledge
pub fn client(addr: &str, config: ClientConfig) -> Arc<Http2ClientConnection> {
    let tcp = TcpStream::connect(addr).unwrap();
    Http2ClientConnection::handshake(Arc::new(SharedSession::from_tcp_stream(tcp)), false, addr, config).unwrap()
}

pub fn get(addr: &str, path: &str) -> Bytes {
    Bytes::from(format!("GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: lowhttp-test\r\n\r\n", path, addr))
}

pub fn post(addr: &str, path: &str, body: &[u8]) -> Bytes {
    let mut raw = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        path,
        addr,
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(body);
    Bytes::from(raw)
}

/// Poll `cond` until it holds or `timeout` passes
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Request seen by the mock peer
#[derive(Debug)]
pub struct MockRequest {
    pub stream_id: u32,
    pub fields: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Every stream frame in arrival order
    pub frames: Vec<Frame>,
}

impl MockRequest {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

/// Server side of one connection, driven frame by frame
pub struct MockPeer {
    pub stream: TcpStream,
    reader: FrameReader,
    encoder: Encoder<'static>,
    decoder: Decoder<'static>,
}

impl MockPeer {
    pub fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        MockPeer {
            stream,
            reader: FrameReader::new(DEFAULT_MAX_FRAME_SIZE as usize),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
        }
    }

    /// Client side of a connection to `addr`, for driving `serve_h2` raw
    pub fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        MockPeer {
            stream,
            reader: FrameReader::new(DEFAULT_MAX_FRAME_SIZE as usize),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
        }
    }

    /// Client preface followed by empty SETTINGS
    pub fn send_preface(&mut self) {
        self.send(CONNECTION_PREFACE);
        self.send(&FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::new())));
    }

    pub fn handshake(&mut self) {
        self.handshake_with(Settings::new());
    }

    /// Read the client preface and SETTINGS, answer with `settings` + ACK
    pub fn handshake_with(&mut self, settings: Settings) {
        let mut preface = [0u8; 24];
        self.stream.read_exact(&mut preface).unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);
        let frame = self.next_frame().unwrap();
        assert_eq!(frame.frame_type(), Some(FrameType::Settings));
        assert!(!frame.flags.is_ack());

        self.send(&FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)));
        self.send(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
    }

    /// Next frame; `None` on EOF, read timeout or a framing error
    pub fn next_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.reader.next_frame() {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(_) => return None,
            }
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.reader.feed(&buf[..n]),
            }
        }
    }

    /// Next frame on a non-zero stream, skipping connection-level frames
    pub fn next_stream_frame(&mut self) -> Option<Frame> {
        loop {
            let frame = self.next_frame()?;
            if frame.stream_id != 0 {
                return Some(frame);
            }
        }
    }

    /// Collect one request up to END_STREAM
    pub fn read_request(&mut self) -> MockRequest {
        let mut frames = Vec::new();
        let mut block = BytesMut::new();
        let mut body = Vec::new();
        let mut stream_id;
        let mut fields = Vec::new();
        loop {
            let frame = self.next_stream_frame().expect("request frame");
            stream_id = frame.stream_id;
            match frame.frame_type() {
                Some(FrameType::Headers) | Some(FrameType::Continuation) => {
                    let frag = parse_header_fragment(&frame).unwrap();
                    block.extend_from_slice(&frag.fragment);
                    if frag.end_headers {
                        fields = self.decode(&block);
                        block.clear();
                    }
                }
                Some(FrameType::Data) => body.extend_from_slice(&parse_data(&frame).unwrap()),
                _ => {}
            }
            let end = frame.flags.is_end_stream();
            frames.push(frame);
            if end {
                return MockRequest { stream_id, fields, body, frames };
            }
        }
    }

    pub fn decode(&mut self, block: &[u8]) -> Vec<(String, String)> {
        self.decoder
            .decode(block)
            .unwrap()
            .into_iter()
            .map(|(n, v)| (String::from_utf8(n).unwrap(), String::from_utf8(v).unwrap()))
            .collect()
    }

    pub fn send(&mut self, wire: &[u8]) {
        self.stream.write_all(wire).unwrap();
    }

    pub fn send_headers(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) {
        let mut block = Vec::new();
        self.encoder
            .encode_into(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())), &mut block)
            .unwrap();
        let wire = FrameCodec::encode_header_block(stream_id, &block, end_stream, DEFAULT_MAX_FRAME_SIZE as usize);
        self.send(&wire);
    }

    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        let frame = DataFrame::new(stream_id, Bytes::copy_from_slice(data), end_stream);
        self.send(&FrameCodec::encode_data_frame(&frame));
    }

    pub fn respond(&mut self, stream_id: u32, status: u16, body: &[u8]) {
        let status = status.to_string();
        let length = body.len().to_string();
        self.send_headers(
            stream_id,
            &[(":status", status.as_str()), ("content-length", length.as_str())],
            body.is_empty(),
        );
        if !body.is_empty() {
            self.send_data(stream_id, body, true);
        }
    }

    pub fn send_rst(&mut self, stream_id: u32, code: ErrorCode) {
        self.send(&FrameCodec::encode_rst_stream_frame(&frames::RstStreamFrame { stream_id, error_code: code }));
    }

    pub fn send_goaway(&mut self, last_stream_id: u32, code: ErrorCode) {
        self.send(&FrameCodec::encode_goaway_frame(&frames::GoawayFrame {
            last_stream_id,
            error_code: code,
            debug_data: Bytes::from_static(b"test"),
        }));
    }

    pub fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        self.send(&FrameCodec::encode_window_update_frame(&frames::WindowUpdateFrame {
            stream_id,
            size_increment: increment,
        }));
    }
}

/// Handler that echoes the request body and reports method and path
pub fn echo_handler() -> Arc<dyn H2Handler> {
    Arc::new(|req: H2Request, mut body: RequestBody| -> H2ServerResponse {
        let mut data = Vec::new();
        if let Err(e) = body.read_to_end(&mut data) {
            return H2ServerResponse::new(500).body(e.to_string());
        }
        H2ServerResponse::new(200)
            .header("x-method", req.method.clone())
            .header("x-path", req.path.clone())
            .body(data)
    })
}

/// Accept connections forever, serving each with `serve_h2` on its own
/// thread; summaries of finished connections arrive on the receiver
pub fn spawn_h2_server(
    config: Http2ConnectionConfig,
    handler: Arc<dyn H2Handler>,
    tls: Option<TlsConfig>,
) -> (String, mpsc::Receiver<ServeSummary>) {
    let (listener, addr) = listen();
    let (tx, rx) = mpsc::channel();
    let tls = tls.map(Arc::new);
    thread::spawn(move || {
        for tcp in listener.incoming() {
            let Ok(tcp) = tcp else { return };
            let (config, handler, tx, tls) = (config.clone(), Arc::clone(&handler), tx.clone(), tls.clone());
            thread::spawn(move || {
                let session = match tls {
                    Some(tls) => match tls.accept(tcp) {
                        Ok(s) => SharedSession::new(s),
                        Err(_) => return,
                    },
                    None => SharedSession::from_tcp_stream(tcp),
                };
                if let Ok(summary) = serve_h2(Arc::new(session), config, handler) {
                    let _ = tx.send(summary);
                }
            });
        }
    });
    (addr, rx)
}
