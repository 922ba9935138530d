//! Transport dialing
//!
//! Turns a destination address plus [`DialOptions`] into a connected
//! [`SessionOps`](crate::http::SessionOps): TCP with a bounded connect
//! timeout and keepalive, optionally tunnelled through an HTTP CONNECT proxy
//! chain, optionally wrapped in TLS with ALPN.
//!
//! Proxies are tried in order until one yields a tunnel. Dial attempts that
//! time out are retried `retry_times` times with a linear backoff; any other
//! failure is returned immediately.

mod dial;

pub use dial::{dial, dial_tcp};

use std::time::Duration;

/// Result type for dialing
pub type Result<T> = std::result::Result<T, Error>;

/// Dial errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect to {addr} timed out")]
    Timeout { addr: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("all proxies failed, last error: {0}")]
    AllProxiesFailed(String),
}

impl Error {
    /// Whether another dial attempt may succeed
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default socket read/write timeout
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// How to reach a destination
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Proxy URLs (`http://[user:pass@]host:port`), tried in order
    pub proxies: Vec<String>,
    /// Extra attempts after a timed out dial
    pub retry_times: u32,
    pub retry_backoff: Duration,
    /// TCP keepalive idle time; `None` disables keepalive
    pub keep_alive: Option<Duration>,
    pub tls_verify: bool,
    /// SNI override; the destination host is used otherwise
    pub sni: Option<String>,
    /// ALPN offer for TLS connections
    pub alpn: Vec<String>,
    /// Named client-hello fingerprint; carried for pool keying only
    pub client_hello_spec: Option<String>,
    /// Chinese national (SM) TLS suites
    pub gm_tls: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        DialOptions {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            proxies: Vec::new(),
            retry_times: 0,
            retry_backoff: Duration::from_millis(200),
            keep_alive: Some(Duration::from_secs(30)),
            tls_verify: false,
            sni: None,
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            client_hello_spec: None,
            gm_tls: false,
        }
    }
}

impl DialOptions {
    /// Create a builder
    pub fn builder() -> DialOptionsBuilder {
        DialOptionsBuilder::default()
    }
}

/// Builder for [`DialOptions`]
#[derive(Debug, Default)]
pub struct DialOptionsBuilder {
    opts: DialOptions,
}

impl DialOptionsBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.opts.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.opts.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.opts.write_timeout = timeout;
        self
    }

    /// Append a proxy to the chain
    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.opts.proxies.push(url.into());
        self
    }

    pub fn retry(mut self, times: u32, backoff: Duration) -> Self {
        self.opts.retry_times = times;
        self.opts.retry_backoff = backoff;
        self
    }

    pub fn keep_alive(mut self, idle: Option<Duration>) -> Self {
        self.opts.keep_alive = idle;
        self
    }

    pub fn tls_verify(mut self, verify: bool) -> Self {
        self.opts.tls_verify = verify;
        self
    }

    pub fn sni(mut self, name: impl Into<String>) -> Self {
        self.opts.sni = Some(name.into());
        self
    }

    /// Replace the ALPN offer
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.opts.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn client_hello_spec(mut self, spec: impl Into<String>) -> Self {
        self.opts.client_hello_spec = Some(spec.into());
        self
    }

    pub fn gm_tls(mut self, enabled: bool) -> Self {
        self.opts.gm_tls = enabled;
        self
    }

    pub fn build(self) -> DialOptions {
        self.opts
    }
}
