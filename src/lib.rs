//! lowhttp - low-level HTTP execution engine
//!
//! Sends arbitrary, possibly malformed request packets over pooled
//! transport connections. The HTTP/2 side multiplexes many request/response
//! exchanges over one connection with a single reader thread per connection.
//!
//! # Layout
//!
//! - [`net`]: transport dialing (TCP, proxies, TLS with ALPN)
//! - [`http`]: session abstraction, raw packet handling, TLS configuration
//! - [`http::h2`]: HTTP/2 client engine and the server counterpart
//! - [`http::pool`]: keyed connection pool
//! - [`diag`]: live task counters

pub mod diag;
pub mod http;
pub mod net;
