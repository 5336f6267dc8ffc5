#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing_subscriber::EnvFilter;

use ioarena::{Completion, ConnectionId, Consumer, IoBuf, SocketHandle, Transport};

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(100);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Everything the server asked the transport to do for its connections, in
/// order. Accepts come from their own thread and are recorded separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Listen { backlog: u32 },
    Receive { conn: ConnectionId, socket: SocketHandle, len: u32 },
    Send { conn: ConnectionId, socket: SocketHandle, bytes: Vec<u8> },
    Shutdown(SocketHandle),
    Close(SocketHandle),
}

#[derive(Clone, Copy)]
struct RawBuf {
    ptr: usize,
    len: u32,
}

/// Transport that records calls and lets the test decide every completion.
pub struct ScriptedTransport {
    calls_tx: Sender<Call>,
    calls_rx: Receiver<Call>,
    accepts_tx: Sender<()>,
    accepts_rx: Receiver<()>,
    accept_attempts: AtomicUsize,
    shutdown_stall: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    receive_bufs: Mutex<HashMap<ConnectionId, RawBuf>>,
    fail_next_receive: AtomicBool,
    fail_accept_submit: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (calls_tx, calls_rx) = unbounded();
        let (accepts_tx, accepts_rx) = unbounded();
        let (completions_tx, completions_rx) = unbounded();
        Self {
            calls_tx,
            calls_rx,
            accepts_tx,
            accepts_rx,
            accept_attempts: AtomicUsize::new(0),
            shutdown_stall: Mutex::new(None),
            completions_tx,
            completions_rx,
            receive_bufs: Mutex::new(HashMap::new()),
            fail_next_receive: AtomicBool::new(false),
            fail_accept_submit: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Receiver<Call> {
        self.calls_rx.clone()
    }

    /// One message per accept the server issued.
    pub fn accepts(&self) -> Receiver<()> {
        self.accepts_rx.clone()
    }

    /// Accept submissions so far, failed ones included.
    pub fn accept_attempts(&self) -> usize {
        self.accept_attempts.load(Ordering::SeqCst)
    }

    /// Make the next `shutdown` block until released. The first receiver
    /// fires once `shutdown` is entered; sending on the returned sender lets
    /// it finish and record the call.
    pub fn stall_shutdown(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        *self.shutdown_stall.lock().unwrap() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    pub fn fail_next_receive(&self) {
        self.fail_next_receive.store(true, Ordering::SeqCst);
    }

    pub fn fail_accept_submit(&self, fail: bool) {
        self.fail_accept_submit.store(fail, Ordering::SeqCst);
    }

    /// Feed a completion to the server's workers.
    pub fn complete(&self, completion: Completion) {
        self.completions_tx
            .send(completion)
            .expect("completion channel closed");
    }

    /// Copy `bytes` into the buffer of `conn`'s pending receive and build the
    /// matching completion.
    pub fn deliver(&self, conn: ConnectionId, bytes: &[u8]) -> Completion {
        let buf = *self
            .receive_bufs
            .lock()
            .unwrap()
            .get(&conn)
            .expect("no receive pending for connection");
        assert!(bytes.len() <= buf.len as usize, "delivery larger than receive buffer");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.ptr as *mut u8, bytes.len());
        }
        Completion::Receive {
            conn,
            result: Ok(bytes.len()),
        }
    }

    fn record(&self, call: Call) {
        let _ = self.calls_tx.send(call);
    }
}

impl Transport for ScriptedTransport {
    fn listen(&self, addr: SocketAddr, backlog: u32) -> io::Result<SocketAddr> {
        self.record(Call::Listen { backlog });
        Ok(addr)
    }

    fn accept_async(&self) -> io::Result<()> {
        self.accept_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_accept_submit.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }
        let _ = self.accepts_tx.send(());
        Ok(())
    }

    fn receive_async(
        &self,
        conn: ConnectionId,
        socket: SocketHandle,
        buf: IoBuf,
    ) -> io::Result<()> {
        if self.fail_next_receive.swap(false, Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        self.receive_bufs.lock().unwrap().insert(
            conn,
            RawBuf {
                ptr: buf.as_mut_ptr() as usize,
                len: buf.len(),
            },
        );
        self.record(Call::Receive {
            conn,
            socket,
            len: buf.len(),
        });
        Ok(())
    }

    fn send_async(&self, conn: ConnectionId, socket: SocketHandle, buf: IoBuf) -> io::Result<()> {
        let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len() as usize) };
        self.record(Call::Send {
            conn,
            socket,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn shutdown(&self, socket: SocketHandle) {
        let stall = self.shutdown_stall.lock().unwrap().take();
        if let Some((entered, release)) = stall {
            let _ = entered.send(());
            let _ = release.recv_timeout(TIMEOUT);
        }
        self.record(Call::Shutdown(socket));
    }

    fn close(&self, socket: SocketHandle) -> io::Result<()> {
        self.record(Call::Close(socket));
        Ok(())
    }

    fn completions(&self) -> Receiver<Completion> {
        self.completions_rx.clone()
    }
}

type Reply = dyn Fn(&[u8], &mut Vec<u8>) -> Option<Vec<u8>> + Send + Sync;

/// Consumer that records what it saw and answers through a closure.
pub struct RecordingConsumer {
    reply: Box<Reply>,
    pub received: Mutex<Vec<(ConnectionId, Vec<u8>)>>,
    pub closed: Mutex<Vec<ConnectionId>>,
}

impl RecordingConsumer {
    pub fn with_reply(
        reply: impl Fn(&[u8], &mut Vec<u8>) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            reply: Box::new(reply),
            received: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::with_reply(|bytes, _| Some(bytes.to_vec()))
    }

    pub fn silent() -> Self {
        Self::with_reply(|_, _| None)
    }

    /// Reply with every complete `\n`-terminated line, holding the rest back
    /// in the remainder.
    pub fn lines() -> Self {
        Self::with_reply(|bytes, remainder| {
            remainder.extend_from_slice(bytes);
            let end = remainder.iter().rposition(|&b| b == b'\n')? + 1;
            Some(remainder.drain(..end).collect())
        })
    }

    pub fn closed(&self) -> Vec<ConnectionId> {
        self.closed.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<(ConnectionId, Vec<u8>)> {
        self.received.lock().unwrap().clone()
    }
}

impl Consumer for RecordingConsumer {
    fn on_bytes_received(
        &self,
        conn: ConnectionId,
        bytes: &[u8],
        remainder: &mut Vec<u8>,
    ) -> Option<Vec<u8>> {
        self.received.lock().unwrap().push((conn, bytes.to_vec()));
        (self.reply)(bytes, remainder)
    }

    fn on_connection_closed(&self, conn: ConnectionId) {
        self.closed.lock().unwrap().push(conn);
    }
}

pub fn next_call(calls: &Receiver<Call>) -> Call {
    calls
        .recv_timeout(TIMEOUT)
        .expect("timed out waiting for a transport call")
}

pub fn assert_quiet<T: Debug>(calls: &Receiver<T>) {
    if let Ok(call) = calls.recv_timeout(QUIET) {
        panic!("unexpected transport call: {call:?}");
    }
}

pub fn expect_accept(accepts: &Receiver<()>) {
    accepts
        .recv_timeout(TIMEOUT)
        .expect("timed out waiting for an accept");
}

/// Poll `cond` until it holds or `TIMEOUT` passes.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn expect_receive(calls: &Receiver<Call>) -> (ConnectionId, SocketHandle) {
    match next_call(calls) {
        Call::Receive { conn, socket, .. } => (conn, socket),
        other => panic!("expected a receive, got {other:?}"),
    }
}

pub fn expect_send(calls: &Receiver<Call>) -> (ConnectionId, Vec<u8>) {
    match next_call(calls) {
        Call::Send { conn, bytes, .. } => (conn, bytes),
        other => panic!("expected a send, got {other:?}"),
    }
}

pub fn local_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}
