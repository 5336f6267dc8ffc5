//! Platform networking capability consumed by the server.
//!
//! The server never touches sockets directly. It issues operations through a
//! [`Transport`] and learns about their outcome from the transport's completion
//! channel. The production implementation drives io_uring and lives in the
//! binary; tests script completions by hand.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::ptr::NonNull;

use crossbeam_channel::Receiver;

use crate::connection::ConnectionId;

/// Platform socket handle of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(pub RawFd);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Raw view of a chunk byte range handed to an asynchronous operation.
///
/// The issuer keeps the backing chunk alive and untouched until the matching
/// [`Completion`] has been dispatched.
#[derive(Debug)]
pub struct IoBuf {
    ptr: NonNull<u8>,
    len: u32,
}

// The view is only dereferenced by the transport while the owning chunk is
// parked behind the in-flight operation.
unsafe impl Send for IoBuf {}

impl IoBuf {
    pub(crate) fn new(ptr: NonNull<u8>, len: u32) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Outcome of a previously issued operation.
#[derive(Debug)]
pub enum Completion {
    Accept(io::Result<SocketHandle>),
    Receive {
        conn: ConnectionId,
        result: io::Result<usize>,
    },
    Send {
        conn: ConnectionId,
        result: io::Result<usize>,
    },
}

/// `{listen, accept_async, receive_async, send_async, close}` as provided by
/// the host platform.
///
/// The `*_async` methods only submit; an `Err` means the operation was never
/// issued and no completion will follow.
pub trait Transport: Send + Sync + 'static {
    /// Bind and listen. Returns the bound local address.
    fn listen(&self, addr: SocketAddr, backlog: u32) -> io::Result<SocketAddr>;

    fn accept_async(&self) -> io::Result<()>;

    fn receive_async(&self, conn: ConnectionId, socket: SocketHandle, buf: IoBuf)
    -> io::Result<()>;

    fn send_async(&self, conn: ConnectionId, socket: SocketHandle, buf: IoBuf) -> io::Result<()>;

    /// Abort outstanding operations on `socket` so they complete promptly.
    /// Runs while the connection's slot is locked, so it must not wait for
    /// a completion to be dispatched.
    fn shutdown(&self, socket: SocketHandle);

    fn close(&self, socket: SocketHandle) -> io::Result<()>;

    /// Completion stream. Every clone observes a disjoint share of completions.
    fn completions(&self) -> Receiver<Completion>;
}
