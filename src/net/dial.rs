use super::{DialOptions, Error, Result};
use crate::http::session::{FdSessionOps, SessionOps};
use crate::http::tls::TlsConfig;
use base64::{engine::general_purpose, Engine as _};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use url::Url;

/// Largest proxy CONNECT response head we accept
const MAX_PROXY_RESPONSE: usize = 8192;

/// Dial `addr` (`host:port`), wrapping it in TLS when `https` is set
pub fn dial(addr: &str, https: bool, opts: &DialOptions) -> Result<Box<dyn SessionOps>> {
    if opts.gm_tls {
        return Err(Error::Unsupported("GM-TLS handshake".to_string()));
    }
    if let Some(spec) = &opts.client_hello_spec {
        tracing::debug!(spec = %spec, "client hello spec is a pool key only, using the default hello");
    }

    let mut attempt = 0;
    loop {
        match dial_once(addr, https, opts) {
            Ok(session) => return Ok(session),
            Err(e) if e.is_timeout() && attempt < opts.retry_times => {
                attempt += 1;
                tracing::warn!(addr, attempt, error = %e, "dial timed out, retrying");
                thread::sleep(opts.retry_backoff * attempt);
            }
            Err(e) => return Err(e),
        }
    }
}

fn dial_once(addr: &str, https: bool, opts: &DialOptions) -> Result<Box<dyn SessionOps>> {
    let tcp = if opts.proxies.is_empty() {
        dial_tcp(addr, opts)?
    } else {
        dial_via_proxies(addr, opts)?
    };
    tcp.set_read_timeout(Some(opts.read_timeout))?;
    tcp.set_write_timeout(Some(opts.write_timeout))?;

    if !https {
        tracing::debug!(addr, "dialed plain tcp");
        return Ok(Box::new(FdSessionOps::new(tcp)));
    }

    let host = host_of(addr);
    let mut builder = TlsConfig::client()
        .verify_peer(opts.tls_verify)
        .alpn(&opts.alpn.iter().map(String::as_str).collect::<Vec<_>>());
    match &opts.sni {
        Some(sni) => builder = builder.servername(sni.clone()),
        // SNI must not carry an IP literal
        None if host.parse::<IpAddr>().is_err() => builder = builder.servername(host),
        None => {}
    }
    let config = builder.build().map_err(|e| Error::Tls(e.to_string()))?;
    let session = config.connect(tcp).map_err(|e| Error::Tls(e.to_string()))?;
    tracing::debug!(addr, version = session.version(), "dialed tls");
    Ok(Box::new(session))
}

/// Host part of `host:port`, without IPv6 brackets
fn host_of(addr: &str) -> String {
    let host = match addr.rfind(':') {
        Some(idx) if !addr[idx + 1..].contains(']') => &addr[..idx],
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

/// Connect a TCP socket with the configured timeout and keepalive
pub fn dial_tcp(addr: &str, opts: &DialOptions) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", addr, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::InvalidAddress(format!("{}: no addresses", addr)));
    }

    let mut last_err = None;
    for sa in addrs {
        let socket = Socket::new(Domain::for_address(sa), Type::STREAM, Some(Protocol::TCP))?;
        match socket.connect_timeout(&sa.into(), opts.connect_timeout) {
            Ok(()) => {
                socket.set_nodelay(true)?;
                if let Some(idle) = opts.keep_alive {
                    socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
                }
                return Ok(socket.into());
            }
            Err(e) => {
                tracing::debug!(addr = %sa, error = %e, "connect failed");
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            Err(Error::Timeout { addr: addr.to_string() })
        }
        Some(e) => Err(Error::Io(e)),
        None => Err(Error::InvalidAddress(addr.to_string())),
    }
}

fn dial_via_proxies(target: &str, opts: &DialOptions) -> Result<TcpStream> {
    let mut last_err = String::new();
    for proxy in &opts.proxies {
        match connect_tunnel(proxy, target, opts) {
            Ok(stream) => {
                tracing::debug!(proxy = %proxy, target, "proxy tunnel established");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(proxy = %proxy, target, error = %e, "proxy failed");
                last_err = e.to_string();
            }
        }
    }
    Err(Error::AllProxiesFailed(last_err))
}

fn connect_tunnel(proxy: &str, target: &str, opts: &DialOptions) -> Result<TcpStream> {
    let url = Url::parse(proxy).map_err(|e| Error::Proxy(format!("{}: {}", proxy, e)))?;
    if url.scheme() != "http" {
        return Err(Error::Unsupported(format!("proxy scheme {}", url.scheme())));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::Proxy(format!("{}: missing host", proxy)))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let mut stream = dial_tcp(&format!("{}:{}", host, port), opts)?;
    stream.set_read_timeout(Some(opts.read_timeout))?;
    stream.set_write_timeout(Some(opts.write_timeout))?;

    let mut request = format!("CONNECT {t} HTTP/1.1\r\nHost: {t}\r\n", t = target);
    if !url.username().is_empty() {
        let creds = format!("{}:{}", url.username(), url.password().unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            general_purpose::STANDARD.encode(creds)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes())?;

    // byte at a time so no tunnel bytes are swallowed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE {
            return Err(Error::Proxy("CONNECT response head too large".to_string()));
        }
        match stream.read(&mut byte)? {
            0 => return Err(Error::Proxy("proxy closed during CONNECT".to_string())),
            _ => head.push(byte[0]),
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if !status.starts_with('2') {
        return Err(Error::Proxy(format!("CONNECT refused: {}", status_line)));
    }
    Ok(stream)
}
