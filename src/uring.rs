//! io_uring backed [`Transport`].
//!
//! One ring thread owns the `IoUring`. Submissions from the server arrive over a
//! channel; the ring keeps an eventfd read armed so a submitter can wake it out
//! of `submit_and_wait`. Completions are translated and pushed onto the shared
//! completion channel for the server's workers.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use io_uring::{IoUring, opcode, squeue::Entry, types::Fd};
use ioarena::{Completion, ConnectionId, IoBuf, SocketHandle, Transport};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, warn};

/// Operation tag in the top byte of user_data; the low 56 bits carry the
/// packed connection id.
const OP_ACCEPT: u64 = 0;
const OP_RECV: u64 = 1;
const OP_SEND: u64 = 2;
const OP_EVENTFD: u64 = 3;

const OP_SHIFT: u32 = 56;
const CONN_MASK: u64 = (1 << OP_SHIFT) - 1;

fn encode_user_data(op: u64, conn: u64) -> u64 {
    (op << OP_SHIFT) | (conn & CONN_MASK)
}

fn decode_user_data(user_data: u64) -> (u64, u64) {
    (user_data >> OP_SHIFT, user_data & CONN_MASK)
}

enum Op {
    Accept,
    Recv {
        conn: ConnectionId,
        fd: RawFd,
        buf: IoBuf,
    },
    Send {
        conn: ConnectionId,
        fd: RawFd,
        buf: IoBuf,
    },
}

/// Push an SQE, flushing the submission queue if full.
fn push_sqe(ring: &mut IoUring, sqe: &Entry) -> io::Result<()> {
    loop {
        // SAFETY: buffers referenced by the entry stay valid until the
        // matching completion is dispatched.
        match unsafe { ring.submission().push(sqe) } {
            Ok(()) => return Ok(()),
            Err(_) => {
                ring.submit()?;
            }
        }
    }
}

fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    Ok(socket)
}

fn create_eventfd() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn cqe_result(result: i32) -> io::Result<usize> {
    if result < 0 {
        Err(io::Error::from_raw_os_error(-result))
    } else {
        Ok(result as usize)
    }
}

pub struct UringTransport {
    ring_entries: u32,
    eventfd: RawFd,
    ops_tx: Sender<Op>,
    ops_rx: Receiver<Op>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    listener: Mutex<Option<Socket>>,
    ring_thread: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

impl UringTransport {
    pub fn new(ring_entries: u32) -> io::Result<Self> {
        let (ops_tx, ops_rx) = unbounded();
        let (completions_tx, completions_rx) = unbounded();
        Ok(Self {
            ring_entries,
            eventfd: create_eventfd()?,
            ops_tx,
            ops_rx,
            completions_tx,
            completions_rx,
            listener: Mutex::new(None),
            ring_thread: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    fn submit(&self, op: Op) -> io::Result<()> {
        self.ops_tx
            .send(op)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ring thread gone"))?;
        self.wake()
    }

    fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.eventfd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: the ring is already due to wake.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Transport for UringTransport {
    fn listen(&self, addr: SocketAddr, backlog: u32) -> io::Result<SocketAddr> {
        let socket = create_listener(addr, backlog)?;
        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"))?;

        let ring = IoUring::new(self.ring_entries)?;
        let mut ring_loop = RingLoop {
            ring,
            listen_fd: socket.as_raw_fd(),
            eventfd: self.eventfd,
            ops: self.ops_rx.clone(),
            completions: self.completions_tx.clone(),
            stop: self.stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("uring".into())
            .spawn(move || ring_loop.run())?;

        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(socket);
        *self.ring_thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(local_addr)
    }

    fn accept_async(&self) -> io::Result<()> {
        self.submit(Op::Accept)
    }

    fn receive_async(
        &self,
        conn: ConnectionId,
        socket: SocketHandle,
        buf: IoBuf,
    ) -> io::Result<()> {
        self.submit(Op::Recv {
            conn,
            fd: socket.0,
            buf,
        })
    }

    fn send_async(&self, conn: ConnectionId, socket: SocketHandle, buf: IoBuf) -> io::Result<()> {
        self.submit(Op::Send {
            conn,
            fd: socket.0,
            buf,
        })
    }

    fn shutdown(&self, socket: SocketHandle) {
        // Pending recv/send on the socket complete once it is shut down.
        if unsafe { libc::shutdown(socket.0, libc::SHUT_RDWR) } < 0 {
            debug!(%socket, error = %io::Error::last_os_error(), "shutdown failed");
        }
    }

    fn close(&self, socket: SocketHandle) -> io::Result<()> {
        if unsafe { libc::close(socket.0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn completions(&self) -> Receiver<Completion> {
        self.completions_rx.clone()
    }
}

impl Drop for UringTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.wake();
        let handle = self
            .ring_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("ring thread panicked");
        }
        unsafe {
            libc::close(self.eventfd);
        }
    }
}

struct RingLoop {
    ring: IoUring,
    listen_fd: RawFd,
    eventfd: RawFd,
    ops: Receiver<Op>,
    completions: Sender<Completion>,
    stop: Arc<AtomicBool>,
}

impl RingLoop {
    fn run(&mut self) {
        let mut eventfd_buf: u64 = 0;
        if let Err(e) = self.submit_eventfd_read(&mut eventfd_buf) {
            error!(error = %e, "failed to arm eventfd");
            return;
        }

        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "submit_and_wait failed");
                    return;
                }
            }

            let cqes: Vec<(u64, i32)> = self
                .ring
                .completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect();

            for (user_data, result) in cqes {
                let (op, conn) = decode_user_data(user_data);
                let completion = match op {
                    OP_ACCEPT => Completion::Accept(
                        cqe_result(result).map(|fd| SocketHandle(fd as RawFd)),
                    ),
                    OP_RECV => Completion::Receive {
                        conn: ConnectionId::from_u64(conn),
                        result: cqe_result(result),
                    },
                    OP_SEND => Completion::Send {
                        conn: ConnectionId::from_u64(conn),
                        result: cqe_result(result),
                    },
                    OP_EVENTFD => {
                        if self.stop.load(Ordering::Acquire) {
                            debug!("ring thread stopping");
                            return;
                        }
                        if let Err(e) = self
                            .drain_ops()
                            .and_then(|()| self.submit_eventfd_read(&mut eventfd_buf))
                        {
                            error!(error = %e, "submission failed");
                            return;
                        }
                        continue;
                    }
                    _ => {
                        warn!(user_data, "unknown completion");
                        continue;
                    }
                };
                if self.completions.send(completion).is_err() {
                    return;
                }
            }
        }
    }

    fn drain_ops(&mut self) -> io::Result<()> {
        while let Ok(op) = self.ops.try_recv() {
            let sqe = match op {
                Op::Accept => {
                    opcode::Accept::new(Fd(self.listen_fd), ptr::null_mut(), ptr::null_mut())
                        .build()
                        .user_data(encode_user_data(OP_ACCEPT, 0))
                }
                Op::Recv { conn, fd, buf } => {
                    opcode::Recv::new(Fd(fd), buf.as_mut_ptr(), buf.len())
                        .build()
                        .user_data(encode_user_data(OP_RECV, conn.as_u64()))
                }
                Op::Send { conn, fd, buf } => {
                    opcode::Send::new(Fd(fd), buf.as_ptr(), buf.len())
                        .build()
                        .user_data(encode_user_data(OP_SEND, conn.as_u64()))
                }
            };
            push_sqe(&mut self.ring, &sqe)?;
        }
        Ok(())
    }

    fn submit_eventfd_read(&mut self, buf: &mut u64) -> io::Result<()> {
        let sqe = opcode::Read::new(Fd(self.eventfd), buf as *mut u64 as *mut u8, 8)
            .build()
            .user_data(encode_user_data(OP_EVENTFD, 0));
        push_sqe(&mut self.ring, &sqe)
    }
}
