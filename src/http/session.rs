//! Session operations abstraction
//!
//! This module provides the session operations pattern that allows
//! transparent switching between plain TCP and TLS connections.
//!
//! [`SharedSession`] wraps a boxed [`SessionOps`] so that a reader thread,
//! writers and closers on other threads can use the same transport. Plain
//! sockets are split into a read half and a write half under separate
//! locks, so a writer stuck on a peer that stopped reading never keeps the
//! reader from draining the socket. TLS state cannot be split; there writes
//! go out in slices and the lock is only taken once the socket has room.

use super::{Error, Result};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session,
/// abstracting over plain TCP and TLS connections.
pub trait SessionOps: Send {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the session
    fn close(&mut self) -> Result<()>;

    /// Bytes already decrypted and buffered above the socket
    fn pending(&self) -> usize {
        0
    }

    /// Descriptor of the underlying socket
    fn raw_fd(&self) -> RawFd;

    /// Protocol selected through ALPN, if any
    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        None
    }

    /// Bound blocking reads and writes on the underlying socket
    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> Result<()>;

    /// Independent handle for the write direction, if the transport allows one
    fn try_clone_writer(&self) -> Option<Box<dyn SessionOps>> {
        None
    }
}

/// Largest write made under the lock of an unsplit session
const WRITE_SLICE: usize = 16 * 1024;

/// Poll step while an unsplit session waits for send buffer room
const WRITE_ROOM_POLL: Duration = Duration::from_millis(50);

/// Give up on a peer that accepts nothing for this long
const DEFAULT_WRITE_STALL: Duration = Duration::from_secs(30);

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Wait for `events` on a raw descriptor
///
/// `None` waits forever. An interrupted wait reports "not ready".
pub fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        // round sub-millisecond waits up so they do not become busy polls
        Some(d) => d.as_millis().clamp(1, i32::MAX as u128) as i32,
    };

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Io(err));
    }

    Ok(result > 0)
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Create a new FD session operations from a TCP stream
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        use std::net::Shutdown;
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(read)?;
        self.stream.set_write_timeout(write)?;
        Ok(())
    }

    fn try_clone_writer(&self) -> Option<Box<dyn SessionOps>> {
        match self.stream.try_clone() {
            Ok(stream) => Some(Box::new(FdSessionOps::new(stream))),
            Err(e) => {
                tracing::debug!(error = %e, "socket clone failed, session stays unsplit");
                None
            }
        }
    }
}

/// Write the whole buffer through one handle, then flush
fn write_fully(io: &mut dyn SessionOps, buf: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match io.write(&buf[written..]) {
            Ok(0) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "session accepted no bytes",
                )))
            }
            Ok(n) => written += n,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    io.flush()
}

/// A transport shared between a reader thread and any number of writers
pub struct SharedSession {
    fd: RawFd,
    /// Read half; also the write half when `writer` is `None`
    io: Mutex<Box<dyn SessionOps>>,
    writer: Option<Mutex<Box<dyn SessionOps>>>,
    write_stall: Mutex<Duration>,
    closed: AtomicBool,
}

impl SharedSession {
    /// Wrap a session
    pub fn new<S: SessionOps + 'static>(ops: S) -> Self {
        Self::from_boxed(Box::new(ops))
    }

    /// Wrap an already boxed session
    pub fn from_boxed(ops: Box<dyn SessionOps>) -> Self {
        let writer = ops.try_clone_writer().map(Mutex::new);
        SharedSession {
            fd: ops.raw_fd(),
            io: Mutex::new(ops),
            writer,
            write_stall: Mutex::new(DEFAULT_WRITE_STALL),
            closed: AtomicBool::new(false),
        }
    }

    /// Helper to share a plain TCP stream
    pub fn from_tcp_stream(stream: TcpStream) -> Self {
        Self::new(FdSessionOps::new(stream))
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether reads and writes run under separate locks
    pub fn is_split(&self) -> bool {
        self.writer.is_some()
    }

    /// Protocol negotiated through ALPN
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.io.lock().alpn_protocol()
    }

    /// Bound blocking socket operations
    pub fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> Result<()> {
        if let Some(write) = write {
            *self.write_stall.lock() = write;
        }
        self.io.lock().set_timeouts(read, write)
    }

    /// Write the whole buffer and flush
    pub fn write_all(&self, buf: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        match &self.writer {
            Some(writer) => write_fully(&mut **writer.lock(), buf),
            None => self.write_sliced(buf),
        }
    }

    /// Unsplit write path: the shared lock is held for one slice at a time
    fn write_sliced(&self, buf: &[u8]) -> Result<()> {
        let stall = *self.write_stall.lock();
        for slice in buf.chunks(WRITE_SLICE) {
            let deadline = Instant::now() + stall;
            while !poll_fd(self.fd, PollEvents::Write, Some(WRITE_ROOM_POLL))? {
                if self.is_closed() {
                    return Err(Error::ConnectionClosed);
                }
                if Instant::now() >= deadline {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "peer stopped accepting data",
                    )));
                }
            }
            write_fully(&mut **self.io.lock(), slice)?;
        }
        Ok(())
    }

    /// Read whatever is available, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when nothing arrived in time and `Ok(Some(0))` on
    /// end of stream.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        {
            let mut io = self.io.lock();
            if io.pending() > 0 {
                return io.read(buf).map(Some);
            }
        }

        if !poll_fd(self.fd, PollEvents::Read, Some(timeout))? {
            return Ok(None);
        }
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let mut io = self.io.lock();
        match io.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(Error::Io(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Close the transport; idempotent
    ///
    /// The socket is shut down without the I/O lock so that a reader blocked
    /// inside `read` wakes up immediately.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
        if let Some(mut io) = self.io.try_lock_for(Duration::from_millis(100)) {
            if let Err(e) = io.close() {
                tracing::trace!(error = %e, "session close");
            }
        }
        if let Some(mut writer) = self.writer.as_ref().and_then(|w| w.try_lock_for(Duration::from_millis(100))) {
            let _ = writer.close();
        }
    }
}
