//! Connection pool tests over plain TCP and TLS
//!
//! - HTTP/2 connections are shared by every caller with the same key
//! - ALPN decides between HTTP/2 and a downgrade to HTTP/1.1
//! - idle HTTP/2 connections drop out of the pool on their own
//! - dial failures surface as dial errors
//! - cancelling a pool with requests in flight

mod common;

use common::*;
use lowhttp::http::h2::{
    ClientConfig, Error, H2Handler, H2Request, H2ServerResponse, Http2ConnectionConfig, RequestBody, RoundTrip,
};
use lowhttp::http::tls::TlsConfig;
use lowhttp::http::{ConnectionKey, ConnectionPool, PoolConfig, Scheme, SessionOps};
use lowhttp::net::DialOptions;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn tls_server(alpn: &[&str]) -> TlsConfig {
    TlsConfig::server().alpn(alpn).build().unwrap()
}

#[test]
fn test_h2_connection_is_shared() {
    init_tracing();
    let (addr, _summaries) = spawn_h2_server(Http2ConnectionConfig::default(), echo_handler(), None);
    let pool = ConnectionPool::default();
    let key = ConnectionKey::new(addr.clone(), false, Scheme::H2);
    let opts = DialOptions::default();

    let a = pool.get_idle_conn(&key, &opts).unwrap();
    let b = pool.get_idle_conn(&key, &opts).unwrap();
    assert!(a.is_h2());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(pool.bucket_len(&key), 1);

    let h2 = a.h2().unwrap();
    assert!(h2.round_trip(get(&addr, "/"), Duration::from_secs(5)).is_success());
    assert!(b.release());
    assert_eq!(pool.idle_count(), 1);

    pool.clear();
    assert_eq!(pool.idle_count(), 0);
    assert!(h2.wait_closed(Duration::from_secs(5)));
}

#[test]
fn test_closed_h2_connection_is_replaced() {
    init_tracing();
    let (addr, _summaries) = spawn_h2_server(Http2ConnectionConfig::default(), echo_handler(), None);
    let pool = ConnectionPool::default();
    let key = ConnectionKey::new(addr.clone(), false, Scheme::H2);
    let opts = DialOptions::default();

    let first = pool.get_idle_conn(&key, &opts).unwrap();
    first.close();
    assert!(!first.is_alive());
    assert_eq!(pool.bucket_len(&key), 0);

    let second = pool.get_idle_conn(&key, &opts).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.h2().unwrap().round_trip(get(&addr, "/"), Duration::from_secs(5)).is_success());
    pool.clear();
}

#[test]
fn test_idle_h2_connection_leaves_pool() {
    init_tracing();
    let (addr, _summaries) = spawn_h2_server(Http2ConnectionConfig::default(), echo_handler(), None);
    let config = PoolConfig::default().h2(ClientConfig::default().idle_timeout(Duration::from_millis(200)));
    let pool = ConnectionPool::new(config);
    let key = ConnectionKey::new(addr.clone(), false, Scheme::H2);

    let conn = pool.get_idle_conn(&key, &DialOptions::default()).unwrap();
    assert_eq!(pool.bucket_len(&key), 1);
    assert!(conn.h2().unwrap().wait_closed(Duration::from_secs(5)));
    assert!(eventually(Duration::from_secs(5), || pool.bucket_len(&key) == 0));
    assert!(!conn.is_alive());
}

#[test]
fn test_tls_alpn_selects_h2() {
    init_tracing();
    let (addr, _summaries) = spawn_h2_server(Http2ConnectionConfig::default(), echo_handler(), Some(tls_server(&["h2"])));
    let pool = ConnectionPool::default();
    let key = ConnectionKey::new(addr.clone(), true, Scheme::H2);

    let conn = pool.get_idle_conn(&key, &DialOptions::default()).unwrap();
    assert!(conn.is_h2());
    assert_eq!(conn.session().alpn_protocol().as_deref(), Some(&b"h2"[..]));
    match conn.h2().unwrap().round_trip(post(&addr, "/tls", b"secret"), Duration::from_secs(5)) {
        RoundTrip::Success(resp) => assert_eq!(&resp.body[..], b"secret"),
        other => panic!("unexpected {:?}", other),
    }
    pool.clear();
}

#[test]
fn test_tls_without_h2_downgrades_to_http1() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let tls = tls_server(&["http/1.1"]);
    thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        let mut session = tls.accept(tcp).unwrap();
        let mut buf = [0u8; 1024];
        if let Ok(n) = session.read(&mut buf) {
            if n > 0 {
                let _ = session.write(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
            }
        }
        thread::sleep(Duration::from_millis(200));
    });

    let pool = ConnectionPool::default();
    let key = ConnectionKey::new(addr.clone(), true, Scheme::H2);
    let conn = pool.get_idle_conn(&key, &DialOptions::default()).unwrap();
    assert!(!conn.is_h2());
    assert_eq!(conn.key().scheme, Scheme::H1);

    conn.session()
        .write_all(format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", addr).as_bytes())
        .unwrap();
    let mut buf = [0u8; 256];
    let n = conn.session().read_timeout(&mut buf, Duration::from_secs(5)).unwrap().unwrap();
    assert!(buf[..n].starts_with(b"HTTP/1.1 200 OK"));

    let h1_key = conn.key().clone();
    assert!(conn.release());
    assert_eq!(pool.bucket_len(&h1_key), 1);
    let again = pool.get_idle_conn(&h1_key, &DialOptions::default()).unwrap();
    assert!(Arc::ptr_eq(&conn, &again));
    assert_eq!(pool.bucket_len(&h1_key), 0);
    again.close();
}

#[test]
fn test_plain_http1_reuse() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for tcp in listener.incoming() {
            let Ok(mut tcp) = tcp else { return };
            thread::spawn(move || {
                let mut buf = [0u8; 1024];
                while let Ok(n) = tcp.read(&mut buf) {
                    if n == 0 || tcp.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").is_err() {
                        return;
                    }
                }
            });
        }
    });

    let pool = ConnectionPool::default();
    let key = ConnectionKey::new(addr.clone(), false, Scheme::H1);
    let conn = pool.get_idle_conn(&key, &DialOptions::default()).unwrap();
    assert!(!conn.is_h2());
    assert!(!pool.host_conn_full(&key));
    assert!(conn.release());

    let reused = pool.get_idle_conn(&key, &DialOptions::default()).unwrap();
    assert!(Arc::ptr_eq(&conn, &reused));
    reused.session().write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let mut buf = [0u8; 64];
    let n = reused.session().read_timeout(&mut buf, Duration::from_secs(5)).unwrap().unwrap();
    assert!(buf[..n].starts_with(b"HTTP/1.1 204"));
    reused.close();
}

#[test]
fn test_dial_failure_surfaces() {
    init_tracing();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let pool = ConnectionPool::default();
    let key = ConnectionKey::new(addr, false, Scheme::H2);
    let opts = DialOptions::builder().connect_timeout(Duration::from_secs(1)).build();
    assert!(matches!(pool.get_idle_conn(&key, &opts), Err(Error::Dial(_))));
    assert_eq!(pool.idle_count(), 0);
}

#[test]
fn test_cancel_with_requests_in_flight() {
    init_tracing();
    let slow: Arc<dyn H2Handler> = Arc::new(|_req: H2Request, _body: RequestBody| -> H2ServerResponse {
        thread::sleep(Duration::from_millis(100));
        H2ServerResponse::new(200).body("ok")
    });
    let (addr, _summaries) = spawn_h2_server(Http2ConnectionConfig::default(), slow, None);
    let pool = ConnectionPool::new(PoolConfig::default().max_idle_conn(20).max_idle_conn_per_host(5));
    let key = ConnectionKey::new(addr.clone(), false, Scheme::H2);
    let shared = pool.get_idle_conn(&key, &DialOptions::default()).unwrap();
    let h2 = Arc::clone(shared.h2().unwrap());

    let workers: Vec<_> = (0..10)
        .map(|_| {
            let (pool, key, addr) = (pool.clone(), key.clone(), addr.clone());
            thread::spawn(move || match pool.get_idle_conn(&key, &DialOptions::default()) {
                Ok(conn) => conn.h2().is_some_and(|h2| h2.round_trip(get(&addr, "/"), Duration::from_secs(2)).is_success()),
                Err(_) => false,
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(50));
    pool.cancel();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(pool.is_cancelled());
    assert_eq!(pool.idle_count(), 0);
    assert!(h2.wait_closed(Duration::from_secs(5)));
    assert!(matches!(
        pool.get_idle_conn(&key, &DialOptions::default()),
        Err(Error::PoolCancelled)
    ));
    assert!(!shared.is_alive());
}
