//! HTTP/2 client connection tests against a raw-frame mock server
//!
//! Each test drives the server side frame by frame so the exact wire
//! sequence the client produces can be checked:
//! - request framing (HEADERS, CONTINUATION, empty END_STREAM DATA)
//! - WINDOW_UPDATE accounting for received DATA
//! - send-side flow control against the peer's windows
//! - GOAWAY, RST_STREAM, timeouts and abrupt closes

mod common;

use bytes::Bytes;
use common::*;
use lowhttp::http::h2::frames::{parse_goaway, parse_rst_stream, parse_window_update, HeadersFrame};
use lowhttp::http::h2::*;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

fn setup() -> (Arc<Http2ClientConnection>, MockPeer, String) {
    init_tracing();
    let (listener, addr) = listen();
    let conn = client(&addr, ClientConfig::default());
    let mut peer = MockPeer::accept(&listener);
    peer.handshake();
    (conn, peer, addr)
}

fn spawn_round_trip(conn: &Arc<Http2ClientConnection>, request: Bytes, timeout: Duration) -> thread::JoinHandle<RoundTrip> {
    let conn = Arc::clone(conn);
    thread::spawn(move || conn.round_trip(request, timeout))
}

#[test]
fn test_get_sends_headers_then_empty_end_stream_data() {
    let (conn, mut peer, addr) = setup();
    let waiter = spawn_round_trip(&conn, get(&addr, "/index?q=1"), Duration::from_secs(5));

    let req = peer.read_request();
    assert_eq!(req.stream_id, 1);
    assert_eq!(req.frames.len(), 2);
    assert_eq!(req.frames[0].frame_type(), Some(FrameType::Headers));
    assert!(req.frames[0].flags.is_end_headers());
    assert!(!req.frames[0].flags.is_end_stream());
    assert_eq!(req.frames[1].frame_type(), Some(FrameType::Data));
    assert!(req.frames[1].payload.is_empty());
    assert!(req.frames[1].flags.is_end_stream());

    assert_eq!(req.field(":method"), Some("GET"));
    assert_eq!(req.field(":path"), Some("/index?q=1"));
    assert_eq!(req.field(":scheme"), Some("http"));
    assert_eq!(req.field(":authority"), Some(addr.as_str()));
    assert_eq!(req.field("user-agent"), Some("lowhttp-test"));
    assert!(req.field("host").is_none());
    assert!(req.field("content-length").is_none());

    peer.respond(1, 200, b"hello");
    match waiter.join().unwrap() {
        RoundTrip::Success(resp) => {
            assert_eq!(resp.status, 200);
            assert_eq!(&resp.body[..], b"hello");
            assert_eq!(resp.header("content-length"), Some("5"));
            assert!(resp.raw.starts_with(b"HTTP/2.0 200 OK\r\n"));
            assert!(resp.raw.ends_with(b"\r\n\r\nhello"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(conn.is_usable());
    conn.set_close();
}

#[test]
fn test_post_drops_connection_headers_and_recomputes_length() {
    let (conn, mut peer, addr) = setup();
    let waiter = spawn_round_trip(&conn, post(&addr, "/submit", b"a=1&b=2"), Duration::from_secs(5));

    let req = peer.read_request();
    assert_eq!(req.field(":method"), Some("POST"));
    assert_eq!(req.field("content-length"), Some("7"));
    assert!(req.field("connection").is_none());
    assert_eq!(req.body, b"a=1&b=2");
    let data: Vec<_> = req.frames.iter().filter(|f| f.frame_type() == Some(FrameType::Data)).collect();
    assert_eq!(data.len(), 1);
    assert!(data[0].flags.is_end_stream());

    peer.respond(1, 201, b"");
    assert!(waiter.join().unwrap().is_success());
    conn.set_close();
}

#[test]
fn test_large_header_blocks_use_continuation() {
    let (conn, mut peer, addr) = setup();
    let big = "x".repeat(20_000);
    let raw = format!("GET / HTTP/1.1\r\nHost: {}\r\nX-Big: {}\r\n\r\n", addr, big);
    let waiter = spawn_round_trip(&conn, Bytes::from(raw), Duration::from_secs(5));

    let req = peer.read_request();
    assert_eq!(req.frames[0].frame_type(), Some(FrameType::Headers));
    assert!(!req.frames[0].flags.is_end_headers());
    assert_eq!(req.frames[1].frame_type(), Some(FrameType::Continuation));
    assert_eq!(req.field("x-big").map(str::len), Some(20_000));

    peer.send_headers(1, &[(":status", "200"), ("x-echo", big.as_str())], true);
    match waiter.join().unwrap() {
        RoundTrip::Success(resp) => assert_eq!(resp.header("x-echo").map(str::len), Some(20_000)),
        other => panic!("unexpected {:?}", other),
    }
    conn.set_close();
}

#[test]
fn test_window_update_per_data_frame() {
    let (conn, mut peer, addr) = setup();
    let waiter = spawn_round_trip(&conn, get(&addr, "/"), Duration::from_secs(5));
    peer.read_request();

    peer.send_headers(1, &[(":status", "200")], false);
    peer.send_data(1, &[b'a'; 100], false);
    peer.send_data(1, &[b'b'; 50], true);

    let mut updates = Vec::new();
    while updates.len() < 4 {
        let frame = peer.next_frame().expect("WINDOW_UPDATE");
        if frame.frame_type() == Some(FrameType::WindowUpdate) {
            updates.push((frame.stream_id, parse_window_update(&frame).unwrap()));
        }
    }
    assert_eq!(updates, vec![(0, 100), (1, 100), (0, 50), (1, 50)]);

    match waiter.join().unwrap() {
        RoundTrip::Success(resp) => assert_eq!(resp.body.len(), 150),
        other => panic!("unexpected {:?}", other),
    }
    conn.set_close();
}

#[test]
fn test_body_respects_peer_stream_window() {
    init_tracing();
    let (listener, addr) = listen();
    let conn = client(&addr, ClientConfig::default());
    let mut peer = MockPeer::accept(&listener);
    peer.handshake_with(SettingsBuilder::new().initial_window_size(10).build().unwrap());
    // wait until the client applied our window
    loop {
        let frame = peer.next_frame().expect("SETTINGS ACK");
        if frame.frame_type() == Some(FrameType::Settings) && frame.flags.is_ack() {
            break;
        }
    }

    let waiter = spawn_round_trip(&conn, post(&addr, "/", &[b'z'; 25]), Duration::from_secs(5));
    let headers = peer.next_stream_frame().unwrap();
    assert_eq!(headers.frame_type(), Some(FrameType::Headers));

    let first = peer.next_stream_frame().unwrap();
    assert_eq!(first.payload.len(), 10);
    assert!(!first.flags.is_end_stream());

    peer.stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    assert!(peer.next_stream_frame().is_none(), "wrote past the stream window");
    peer.stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    peer.send_window_update(1, 10);
    let second = peer.next_stream_frame().unwrap();
    assert_eq!(second.payload.len(), 10);
    peer.send_window_update(1, 10);
    let last = peer.next_stream_frame().unwrap();
    assert_eq!(last.payload.len(), 5);
    assert!(last.flags.is_end_stream());

    peer.respond(1, 200, b"");
    assert!(waiter.join().unwrap().is_success());
    conn.set_close();
}

#[test]
fn test_goaway_refuses_new_streams_but_finishes_open_ones() {
    let (conn, mut peer, addr) = setup();
    let open = conn.new_stream(get(&addr, "/a")).unwrap();
    conn.do_request(&open).unwrap();
    assert_eq!(peer.read_request().stream_id, 1);

    peer.send_goaway(1, ErrorCode::NoError);
    assert!(eventually(Duration::from_secs(5), || conn.read_goaway()));
    assert!(!conn.is_usable());
    assert!(matches!(conn.new_stream(get(&addr, "/b")), Err(Error::CreateStreamAfterGoAway)));
    assert!(matches!(
        conn.round_trip(get(&addr, "/c"), Duration::from_secs(1)),
        RoundTrip::NeedReconnect(Error::CreateStreamAfterGoAway)
    ));

    peer.respond(1, 204, b"");
    let resp = conn.wait_response(open, Duration::from_secs(5)).into_result().unwrap();
    assert_eq!(resp.status, 204);

    // the last stream drained, so the connection retires itself
    assert!(conn.wait_closed(Duration::from_secs(5)));
}

#[test]
fn test_goaway_refuses_streams_above_last_id() {
    let (conn, mut peer, addr) = setup();
    let first = conn.new_stream(get(&addr, "/1")).unwrap();
    let second = conn.new_stream(get(&addr, "/2")).unwrap();
    conn.do_request(&first).unwrap();
    conn.do_request(&second).unwrap();
    peer.read_request();
    peer.read_request();

    peer.send_goaway(1, ErrorCode::NoError);
    let refused = conn.wait_response(second, Duration::from_secs(5));
    match refused.error {
        Some(ref e @ Error::Refused { stream_id: 3, last_stream_id: 1 }) => assert!(e.is_retryable()),
        ref other => panic!("unexpected {:?}", other),
    }

    peer.respond(1, 200, b"ok");
    assert_eq!(conn.wait_response(first, Duration::from_secs(5)).into_result().unwrap().status, 200);
    conn.set_close();
}

#[test]
fn test_rst_stream_is_remote_reset() {
    let (conn, mut peer, addr) = setup();
    let waiter = spawn_round_trip(&conn, get(&addr, "/"), Duration::from_secs(5));
    peer.read_request();
    peer.send_rst(1, ErrorCode::InternalError);

    match waiter.join().unwrap() {
        RoundTrip::Fatal { error: Error::RemoteReset { stream_id: 1, code: 2 }, partial: None } => {}
        other => panic!("unexpected {:?}", other),
    }
    assert!(conn.is_usable());
    conn.set_close();
}

#[test]
fn test_wait_timeout_resets_stream_and_keeps_connection() {
    let (conn, mut peer, addr) = setup();
    let waiter = spawn_round_trip(&conn, get(&addr, "/slow"), Duration::from_millis(200));
    peer.read_request();

    let rst = loop {
        let frame = peer.next_stream_frame().expect("RST_STREAM");
        if frame.frame_type() == Some(FrameType::RstStream) {
            break frame;
        }
    };
    assert_eq!(rst.stream_id, 1);
    assert_eq!(parse_rst_stream(&rst).unwrap(), ErrorCode::Cancel.as_u32());
    assert!(matches!(waiter.join().unwrap(), RoundTrip::Fatal { error: Error::Timeout, .. }));
    assert!(conn.is_usable());

    // a late answer for the abandoned stream is dropped, HPACK stays in sync
    peer.respond(1, 200, b"late");
    let waiter = spawn_round_trip(&conn, get(&addr, "/next"), Duration::from_secs(5));
    let req = peer.read_request();
    assert_eq!(req.stream_id, 3);
    peer.respond(3, 200, b"fresh");
    match waiter.join().unwrap() {
        RoundTrip::Success(resp) => assert_eq!(&resp.body[..], b"fresh"),
        other => panic!("unexpected {:?}", other),
    }
    conn.set_close();
}

#[test]
fn test_wait_timeout_not_held_up_by_stalled_upload() {
    const MAX_WINDOW: u32 = 0x7FFF_FFFF;
    init_tracing();
    let (listener, addr) = listen();
    let conn = client(&addr, ClientConfig::default());
    let mut peer = MockPeer::accept(&listener);
    peer.handshake_with(SettingsBuilder::new().initial_window_size(MAX_WINDOW).build().unwrap());
    peer.send_window_update(0, MAX_WINDOW - DEFAULT_INITIAL_WINDOW_SIZE);
    loop {
        let frame = peer.next_frame().expect("SETTINGS ACK");
        if frame.frame_type() == Some(FrameType::Settings) && frame.flags.is_ack() {
            break;
        }
    }

    let waiting = conn.new_stream(get(&addr, "/b")).unwrap();
    conn.do_request(&waiting).unwrap();

    // the peer stops reading, so this upload ends up blocked inside a write
    let uploader = {
        let conn = Arc::clone(&conn);
        let request = post(&addr, "/a", &vec![b'u'; 64 << 20]);
        thread::spawn(move || conn.round_trip(request, Duration::from_secs(30)))
    };
    thread::sleep(Duration::from_millis(300));

    let (tx, rx) = mpsc::channel();
    {
        let conn = Arc::clone(&conn);
        thread::spawn(move || {
            let start = Instant::now();
            let outcome = conn.wait_response(waiting, Duration::from_millis(300));
            let _ = tx.send((matches!(outcome.error, Some(Error::Timeout)), start.elapsed()));
        });
    }
    let (timed_out, waited) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("wait_response stuck behind the blocked writer");
    assert!(timed_out);
    assert!(waited < Duration::from_secs(2), "waited {:?}", waited);

    conn.set_close();
    assert!(!uploader.join().unwrap().is_success());
    drop(peer);
}

#[test]
fn test_abrupt_close_returns_partial_response() {
    let (conn, mut peer, addr) = setup();
    let waiter = spawn_round_trip(&conn, get(&addr, "/"), Duration::from_secs(10));
    peer.read_request();
    peer.send_headers(1, &[(":status", "200")], false);
    peer.send_data(1, b"part", false);
    thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    drop(peer);

    match waiter.join().unwrap() {
        RoundTrip::Fatal { error: Error::ConnectionClosed, partial: Some(resp) } => {
            assert_eq!(resp.status, 200);
            assert_eq!(&resp.body[..], b"part");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(conn.wait_closed(Duration::from_secs(5)));
    assert_eq!(conn.cleanup_count(), 1);

    assert!(matches!(
        conn.round_trip(get(&addr, "/again"), Duration::from_secs(1)),
        RoundTrip::NeedReconnect(_)
    ));
}

#[test]
fn test_close_from_another_thread_wakes_waiter() {
    let (conn, mut peer, addr) = setup();
    let waiter = spawn_round_trip(&conn, get(&addr, "/"), Duration::from_secs(30));
    peer.read_request();

    let start = Instant::now();
    let closers: Vec<_> = (0..4)
        .map(|_| {
            let c = Arc::clone(&conn);
            thread::spawn(move || c.set_close())
        })
        .collect();
    for c in closers {
        c.join().unwrap();
    }

    assert!(matches!(
        waiter.join().unwrap(),
        RoundTrip::Fatal { error: Error::ConnectionClosed, partial: None }
    ));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(conn.cleanup_count(), 1);
}

#[test]
fn test_hpack_failure_is_connection_fatal() {
    let (conn, mut peer, addr) = setup();
    let waiter = spawn_round_trip(&conn, get(&addr, "/"), Duration::from_secs(10));
    peer.read_request();

    let garbage = HeadersFrame::new(1, Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0x0f]), false, true);
    peer.send(&FrameCodec::encode_headers_frame(&garbage));

    let goaway = loop {
        let frame = peer.next_frame().expect("GOAWAY");
        if frame.frame_type() == Some(FrameType::Goaway) {
            break frame;
        }
    };
    assert_eq!(parse_goaway(&goaway).unwrap().error_code, ErrorCode::CompressionError.as_u32());
    assert!(matches!(waiter.join().unwrap(), RoundTrip::Fatal { error: Error::ConnectionClosed, .. }));
    assert!(conn.wait_closed(Duration::from_secs(5)));
}

#[test]
fn test_data_for_unknown_stream_is_dropped() {
    let (conn, mut peer, addr) = setup();
    peer.send_data(99, b"stray", false);

    let waiter = spawn_round_trip(&conn, get(&addr, "/"), Duration::from_secs(5));
    let req = peer.read_request();
    peer.respond(req.stream_id, 200, b"ok");
    assert!(waiter.join().unwrap().is_success());
    assert!(conn.is_usable());
    conn.set_close();
}
