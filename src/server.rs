//! Connection lifecycle: admission, completion dispatch and teardown.
//!
//! One accept thread issues accepts, blocking on the [`AdmissionGate`] when the
//! connection ceiling is reached. Completion workers drain the transport's
//! completion channel and run each completion through [`Server::dispatch`].
//!
//! Each connection has at most one socket operation in flight. While it is in
//! flight the connection's state is parked in its table slot; the worker that
//! handles the completion takes it out, owns it for the duration of the
//! callback, and parks it again when it issues the next operation. Teardown
//! only runs on a state nobody else can reach, so a chunk never goes back to
//! the arena while the platform may still write into it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select, unbounded};
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionGate;
use crate::buffer_arena::BufferArena;
use crate::config::ServerConfig;
use crate::connection::{ConnectionId, ConnectionState, ConnectionTable, Phase};
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::metrics;
use crate::op_context::{OperationContext, OperationContextPool, OperationKind};
use crate::transport::{Completion, SocketHandle, Transport};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// What the accept thread learns about the accept it issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptOutcome {
    Admitted(ConnectionId),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Receive,
    Send,
}

/// Point-in-time view of the shared pools and counters.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub connection_count: u32,
    pub total_bytes_read: u64,
    pub admission_available: u32,
    pub contexts_available: usize,
    pub chunks_available: usize,
    pub arena_cursor: u32,
    /// Arena free list, bottom of the stack first.
    pub free_offsets: Vec<u32>,
}

struct Shared<T, C> {
    config: ServerConfig,
    transport: T,
    consumer: C,
    arena: Mutex<BufferArena>,
    contexts: OperationContextPool,
    gate: AdmissionGate,
    table: ConnectionTable,
    connection_count: AtomicU32,
    total_bytes_read: AtomicU64,
    accept_done: Sender<AcceptOutcome>,
}

/// Accepts connections and moves each one through
/// `Accepting -> Receiving <-> Sending -> Closing -> Closed`.
pub struct Server<T: Transport, C: Consumer> {
    shared: Arc<Shared<T, C>>,
    accept_outcomes: Option<Receiver<AcceptOutcome>>,
    shutdown_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl<T: Transport, C: Consumer> Server<T, C> {
    /// Validate `config` and pre-allocate the arena, contexts, gate and
    /// connection table. Nothing is allocated per connection after this.
    ///
    /// # Errors
    /// `Error::Config` for invalid sizing, `Error::Capacity` if the derived
    /// arena layout is inconsistent.
    pub fn init(config: ServerConfig, transport: T, consumer: C) -> Result<Self> {
        config.validate()?;

        let arena = BufferArena::initialize(
            config.arena_pool_size(),
            config.chunk_size,
            config.arena_start_offset,
        )?;
        let contexts = OperationContextPool::initialize(config.context_capacity());
        let gate = AdmissionGate::new(config.max_connections);
        let table = ConnectionTable::new(config.max_connections);
        let (accept_done, accept_outcomes) = unbounded();

        debug!(
            max_connections = config.max_connections,
            chunk_size = config.chunk_size,
            pool_size = arena.pool_size(),
            contexts = contexts.capacity(),
            "server initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                consumer,
                arena: Mutex::new(arena),
                contexts,
                gate,
                table,
                connection_count: AtomicU32::new(0),
                total_bytes_read: AtomicU64::new(0),
                accept_done,
            }),
            accept_outcomes: Some(accept_outcomes),
            shutdown_tx: None,
            threads: Vec::new(),
            local_addr: None,
        })
    }

    /// Listen on `addr` with the configured backlog, then start the completion
    /// workers and the accept loop. Returns the bound address.
    ///
    /// # Errors
    /// `Error::Io` if listening or spawning a thread fails,
    /// `Error::InvalidArgument` on a second call.
    pub fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let Some(outcomes) = self.accept_outcomes.take() else {
            return Err(Error::InvalidArgument("server already started"));
        };
        let backlog = self.shared.config.listen_backlog;
        let local_addr = self.shared.transport.listen(addr, backlog)?;

        // Dropping the sender stops every thread spawned below.
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let workers = self.shared.config.completion_workers;
        for i in 0..workers {
            let shared = self.shared.clone();
            let completions = shared.transport.completions();
            let shutdown = shutdown_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("completion-{i}"))
                .spawn(move || run_worker(&shared, &completions, &shutdown))?;
            self.threads.push(handle);
        }

        let shared = self.shared.clone();
        let acceptor = thread::Builder::new()
            .name("acceptor".into())
            .spawn(move || run_acceptor(&shared, &outcomes, &shutdown_rx))?;
        self.threads.push(acceptor);

        self.local_addr = Some(local_addr);
        info!(%local_addr, backlog, workers, "listening");
        Ok(local_addr)
    }

    /// Run one completion through the state machine. Worker threads call this;
    /// an owner running with `completion_workers == 0` drives it directly.
    pub fn dispatch(&self, completion: Completion) {
        self.shared.dispatch(completion);
    }

    /// Close `conn` from outside the completion path. Idempotent; stale ids
    /// are ignored.
    pub fn close_connection(&self, conn: ConnectionId) {
        self.shared.close_connection(conn);
    }

    /// `None` once the connection is closed, or for a stale id.
    pub fn connection_phase(&self, conn: ConnectionId) -> Option<Phase> {
        self.shared.table.lock(conn).map(|slot| slot.phase())
    }

    pub fn stats(&self) -> ServerStats {
        let shared = &self.shared;
        let (free_offsets, chunks_available, arena_cursor) = {
            let arena = shared.arena();
            (
                arena.free_offsets().to_vec(),
                arena.available(),
                arena.cursor(),
            )
        };
        ServerStats {
            connection_count: shared.connection_count.load(Ordering::Acquire),
            total_bytes_read: shared.total_bytes_read.load(Ordering::Relaxed),
            admission_available: shared.gate.available(),
            contexts_available: shared.contexts.available(),
            chunks_available,
            arena_cursor,
            free_offsets,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn consumer(&self) -> &C {
        &self.shared.consumer
    }

    /// Stop accepting and dispatching, then join the server threads. Live
    /// connections keep their resources.
    pub fn shutdown(&mut self) {
        if self.shutdown_tx.is_none() && self.threads.is_empty() {
            return;
        }
        self.shared.gate.close();
        self.shutdown_tx.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("server thread panicked");
            }
        }
        info!(
            connections = self.shared.connection_count.load(Ordering::Acquire),
            "server stopped"
        );
    }
}

impl<T: Transport, C: Consumer> Drop for Server<T, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T: Transport, C: Consumer>(
    shared: &Shared<T, C>,
    completions: &Receiver<Completion>,
    shutdown: &Receiver<()>,
) {
    loop {
        let completion = select! {
            recv(completions) -> completion => completion.ok(),
            recv(shutdown) -> _ => None,
        };
        let Some(completion) = completion else {
            break;
        };
        shared.dispatch(completion);
    }
    debug!("completion worker stopped");
}

fn run_acceptor<T: Transport, C: Consumer>(
    shared: &Shared<T, C>,
    outcomes: &Receiver<AcceptOutcome>,
    shutdown: &Receiver<()>,
) {
    let mut ctx = OperationContext::accept();
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        ctx.reset();
        if shared.gate.acquire().is_err() {
            break;
        }

        let admitted = match shared.transport.accept_async() {
            Ok(()) => {
                let outcome = select! {
                    recv(outcomes) -> outcome => outcome.ok(),
                    recv(shutdown) -> _ => None,
                };
                match outcome {
                    Some(AcceptOutcome::Admitted(conn)) => {
                        ctx.bind(conn);
                        debug!(conn = ?ctx.owning_connection(), "accept completed");
                        true
                    }
                    Some(AcceptOutcome::Failed) => false,
                    None => break,
                }
            }
            Err(e) => {
                warn!(error = %e, "accept submit failed");
                metrics::inc_accept_errors();
                shared.gate.release();
                false
            }
        };

        if admitted {
            backoff = ACCEPT_BACKOFF_MIN;
            continue;
        }

        debug!(backoff_ms = backoff.as_millis() as u64, "accept backoff");
        match shutdown.recv_timeout(backoff) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
    }
    debug!("accept loop stopped");
}

impl<T: Transport, C: Consumer> Shared<T, C> {
    fn arena(&self) -> MutexGuard<'_, BufferArena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, completion: Completion) {
        match completion {
            Completion::Accept(result) => self.process_accept(result),
            Completion::Receive { conn, result } => self.process_receive(conn, result),
            Completion::Send { conn, result } => self.process_send(conn, result),
        }
    }

    fn process_accept(&self, result: io::Result<SocketHandle>) {
        let socket = match result {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "accept failed");
                metrics::inc_accept_errors();
                self.gate.release();
                let _ = self.accept_done.send(AcceptOutcome::Failed);
                return;
            }
        };

        match self.admit(socket) {
            Ok(state) => {
                let conn = state.id();
                let count = self.connection_count.fetch_add(1, Ordering::AcqRel) + 1;
                metrics::inc_accepted();
                debug!(%conn, %socket, connections = count, "connection admitted");
                let _ = self.accept_done.send(AcceptOutcome::Admitted(conn));
                self.park_and_issue(state, Next::Receive);
            }
            Err(e) => {
                // The gate is sized to the pools; reaching this is a bookkeeping bug.
                error!(error = %e, %socket, "pool exhausted on accept path, dropping connection");
                if let Err(e) = self.transport.close(socket) {
                    warn!(error = %e, %socket, "close after failed admission");
                }
                self.gate.release();
                let _ = self.accept_done.send(AcceptOutcome::Failed);
            }
        }
    }

    /// Check out a context pair and a chunk pair, then claim a slot. Anything
    /// already taken is handed back if a later step fails.
    fn admit(&self, socket: SocketHandle) -> Result<ConnectionState> {
        let mut read_ctx = self.contexts.checkout()?;
        let mut write_ctx = match self.contexts.checkout() {
            Ok(ctx) => ctx,
            Err(e) => {
                self.checkin(read_ctx);
                return Err(e);
            }
        };

        let chunks = {
            let mut arena = self.arena();
            arena.acquire_chunk().and_then(|read| match arena.acquire_chunk() {
                Ok(write) => Ok((read, write)),
                Err(e) => {
                    arena.release_chunk(read);
                    Err(e)
                }
            })
        };
        let (read_chunk, write_chunk) = match chunks {
            Ok(pair) => pair,
            Err(e) => {
                self.checkin(read_ctx);
                self.checkin(write_ctx);
                return Err(e);
            }
        };

        let conn = match self.table.reserve(socket) {
            Ok(conn) => conn,
            Err(e) => {
                {
                    let mut arena = self.arena();
                    arena.release_chunk(read_chunk);
                    arena.release_chunk(write_chunk);
                }
                self.checkin(read_ctx);
                self.checkin(write_ctx);
                return Err(e);
            }
        };

        read_ctx.assign(OperationKind::Receive, read_chunk, conn);
        write_ctx.assign(OperationKind::Send, write_chunk, conn);
        Ok(ConnectionState::new(conn, socket, read_ctx, write_ctx))
    }

    fn process_receive(&self, conn: ConnectionId, result: io::Result<usize>) {
        let Some(mut state) = self.take(conn) else {
            return;
        };

        let n = match result {
            Ok(0) => {
                debug!(%conn, "peer closed");
                return self.teardown(state);
            }
            Ok(n) => n,
            Err(e) => {
                debug!(%conn, error = %e, "receive failed");
                return self.teardown(state);
            }
        };

        self.total_bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        metrics::add_bytes_received(n);

        let reply = {
            let (bytes, remainder) = state.delivery(n);
            self.consumer.on_bytes_received(conn, bytes, remainder)
        };
        match reply {
            Some(bytes) if !bytes.is_empty() => {
                state.queue_send(bytes);
                self.park_and_issue(state, Next::Send);
            }
            _ => self.park_and_issue(state, Next::Receive),
        }
    }

    fn process_send(&self, conn: ConnectionId, result: io::Result<usize>) {
        let Some(mut state) = self.take(conn) else {
            return;
        };

        match result {
            Ok(0) => {
                debug!(%conn, "zero-byte send");
                self.teardown(state);
            }
            Ok(n) => {
                metrics::add_bytes_sent(n);
                let next = if state.advance_send(n) {
                    Next::Receive
                } else {
                    Next::Send
                };
                self.park_and_issue(state, next);
            }
            Err(e) => {
                debug!(%conn, error = %e, "send failed");
                self.teardown(state);
            }
        }
    }

    /// Claim a parked connection for one completion. A completion that finds
    /// the slot reused or vacant is stale; one that finds a close request
    /// tears the connection down instead.
    fn take(&self, conn: ConnectionId) -> Option<ConnectionState> {
        let Some(mut slot) = self.table.lock(conn) else {
            debug!(%conn, "stale completion ignored");
            return None;
        };
        let Some(state) = slot.take() else {
            warn!(%conn, "completion for a connection with no operation in flight");
            return None;
        };
        if slot.close_requested() {
            drop(slot);
            self.teardown(state);
            return None;
        }
        Some(state)
    }

    /// Park `state` and issue its next operation under the slot lock, so the
    /// completion cannot be handled before the state is back in the slot.
    fn park_and_issue(&self, mut state: ConnectionState, next: Next) {
        let conn = state.id();
        let socket = state.socket();
        let Some(mut slot) = self.table.lock(conn) else {
            error!(%conn, "owned connection lost its slot");
            return self.teardown(state);
        };
        if slot.close_requested() {
            drop(slot);
            return self.teardown(state);
        }

        let buf = match next {
            Next::Receive => state.receive_buf(),
            Next::Send => state.next_send_buf(),
        };
        let Some(buf) = buf else {
            error!(%conn, ?next, "no buffer to issue");
            drop(slot);
            return self.teardown(state);
        };
        state.phase = match next {
            Next::Receive => Phase::Receiving,
            Next::Send => Phase::Sending,
        };
        slot.park(state);

        let issued = match next {
            Next::Receive => self.transport.receive_async(conn, socket, buf),
            Next::Send => self.transport.send_async(conn, socket, buf),
        };
        if let Err(e) = issued {
            debug!(%conn, ?next, error = %e, "submit failed");
            slot.request_close();
            let state = slot.take();
            drop(slot);
            if let Some(state) = state {
                self.teardown(state);
            }
        }
    }

    fn close_connection(&self, conn: ConnectionId) {
        let Some(mut slot) = self.table.lock(conn) else {
            return;
        };
        if !slot.request_close() {
            return;
        }
        debug!(%conn, "close requested");
        // A busy connection is torn down by its worker before the next issue.
        // Shutdown runs under the guard; teardown needs it before closing the fd.
        if !slot.is_parked() {
            return;
        }
        if let Some(socket) = slot.socket() {
            self.transport.shutdown(socket);
        }
    }

    /// Mark an owned connection `Closing`, on the state and in its slot.
    fn begin_close(&self, state: &mut ConnectionState) {
        state.phase = Phase::Closing;
        if let Some(mut slot) = self.table.lock(state.id()) {
            slot.request_close();
        }
    }

    /// Return everything the connection held. Runs at most once per
    /// connection: only the current owner of the state can reach it.
    fn teardown(&self, mut state: ConnectionState) {
        self.begin_close(&mut state);
        let conn = state.id();
        let bytes_read = state.bytes_read_total();
        let (socket, mut read_ctx, mut write_ctx) = state.into_parts();

        if let Err(e) = self.transport.close(socket) {
            warn!(%conn, %socket, error = %e, "close failed");
        }
        {
            let mut arena = self.arena();
            if let Some(chunk) = read_ctx.take_chunk() {
                arena.release_chunk(chunk);
            }
            if let Some(chunk) = write_ctx.take_chunk() {
                arena.release_chunk(chunk);
            }
        }
        self.checkin(read_ctx);
        self.checkin(write_ctx);
        self.table.release(conn);

        let count = self.connection_count.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::inc_closed();
        self.gate.release();
        debug!(%conn, %socket, bytes_read, connections = count, "connection closed");

        self.consumer.on_connection_closed(conn);
    }

    fn checkin(&self, ctx: OperationContext) {
        let id = ctx.id();
        if let Err(e) = self.contexts.checkin(ctx) {
            error!(context = id, error = %e, "context check-in rejected");
            debug_assert!(false, "context check-in rejected: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Echo;
    use crate::error::Resource;
    use crate::transport::IoBuf;

    const CHUNK: u32 = 8;

    /// Accepts every submission and remembers the sockets it closed.
    #[derive(Default)]
    struct Recorder {
        receives: Mutex<Vec<ConnectionId>>,
        closed: Mutex<Vec<SocketHandle>>,
    }

    impl Recorder {
        fn closed(&self) -> Vec<SocketHandle> {
            self.closed.lock().unwrap().clone()
        }
    }

    impl Transport for Recorder {
        fn listen(&self, addr: SocketAddr, _backlog: u32) -> io::Result<SocketAddr> {
            Ok(addr)
        }

        fn accept_async(&self) -> io::Result<()> {
            Ok(())
        }

        fn receive_async(
            &self,
            conn: ConnectionId,
            _socket: SocketHandle,
            _buf: IoBuf,
        ) -> io::Result<()> {
            self.receives.lock().unwrap().push(conn);
            Ok(())
        }

        fn send_async(
            &self,
            _conn: ConnectionId,
            _socket: SocketHandle,
            _buf: IoBuf,
        ) -> io::Result<()> {
            Ok(())
        }

        fn shutdown(&self, _socket: SocketHandle) {}

        fn close(&self, socket: SocketHandle) -> io::Result<()> {
            self.closed.lock().unwrap().push(socket);
            Ok(())
        }

        fn completions(&self) -> Receiver<Completion> {
            crossbeam_channel::never()
        }
    }

    /// Pools sized independently of the gate, which `Server::init` never
    /// allows, so the accept path can run out of each one in turn.
    fn undersized(
        gate: u32,
        contexts: usize,
        chunks: u32,
        slots: u32,
    ) -> (Shared<Recorder, Echo>, Receiver<AcceptOutcome>) {
        let config = ServerConfig {
            max_connections: gate,
            chunk_size: CHUNK,
            listen_backlog: 16,
            arena_start_offset: 0,
            completion_workers: 0,
        };
        let arena = BufferArena::initialize(chunks * CHUNK, CHUNK, 0).expect("arena layout");
        let (accept_done, outcomes) = unbounded();
        let shared = Shared {
            config,
            transport: Recorder::default(),
            consumer: Echo,
            arena: Mutex::new(arena),
            contexts: OperationContextPool::initialize(contexts),
            gate: AdmissionGate::new(gate),
            table: ConnectionTable::new(slots),
            connection_count: AtomicU32::new(0),
            total_bytes_read: AtomicU64::new(0),
            accept_done,
        };
        (shared, outcomes)
    }

    /// Take a gate slot the way the accept thread does, then complete the
    /// accept with `fd`.
    fn accept(
        shared: &Shared<Recorder, Echo>,
        outcomes: &Receiver<AcceptOutcome>,
        fd: i32,
    ) -> AcceptOutcome {
        assert!(shared.gate.try_acquire(), "gate unexpectedly full");
        shared.process_accept(Ok(SocketHandle(fd)));
        outcomes.try_recv().expect("no accept outcome reported")
    }

    fn admitted(outcome: AcceptOutcome) -> ConnectionId {
        match outcome {
            AcceptOutcome::Admitted(conn) => conn,
            AcceptOutcome::Failed => panic!("accept was not admitted"),
        }
    }

    /// Admit one connection, fail a second admission on whichever pool is
    /// short, and check the failed attempt left nothing behind.
    fn second_admission_rolls_back(contexts: usize, chunks: u32, slots: u32) {
        let (shared, outcomes) = undersized(2, contexts, chunks, slots);
        let a = admitted(accept(&shared, &outcomes, 10));

        let contexts_before = shared.contexts.available();
        let chunks_before = shared.arena().available();
        assert_eq!(accept(&shared, &outcomes, 11), AcceptOutcome::Failed);

        assert_eq!(shared.transport.closed(), vec![SocketHandle(11)]);
        assert_eq!(shared.contexts.available(), contexts_before);
        assert_eq!(shared.arena().available(), chunks_before);
        assert_eq!(shared.gate.available(), 1);
        assert_eq!(shared.table.live(), 1);
        assert_eq!(shared.connection_count.load(Ordering::Acquire), 1);

        // Once A closes, the freed resources admit a new connection.
        shared.process_receive(a, Ok(0));
        assert_eq!(
            shared.transport.closed(),
            vec![SocketHandle(11), SocketHandle(10)]
        );
        assert_eq!(shared.gate.available(), 2);
        let c = admitted(accept(&shared, &outcomes, 12));
        assert_eq!(shared.transport.receives.lock().unwrap().last(), Some(&c));
        assert_eq!(shared.connection_count.load(Ordering::Acquire), 1);
    }

    #[test]
    fn admission_without_any_context_closes_the_socket() {
        second_admission_rolls_back(2, 4, 2);
    }

    #[test]
    fn admission_short_one_context_returns_the_first() {
        second_admission_rolls_back(3, 4, 2);
    }

    #[test]
    fn admission_without_any_chunk_returns_both_contexts() {
        second_admission_rolls_back(4, 2, 2);
    }

    #[test]
    fn admission_short_one_chunk_returns_the_first() {
        second_admission_rolls_back(4, 3, 2);
    }

    #[test]
    fn admission_without_a_slot_returns_chunks_and_contexts() {
        second_admission_rolls_back(4, 4, 1);
    }

    #[test]
    fn admit_reports_which_pool_ran_out() {
        let (shared, _outcomes) = undersized(2, 3, 4, 2);
        let _a = shared.admit(SocketHandle(10)).expect("first admission");
        assert!(matches!(
            shared.admit(SocketHandle(11)),
            Err(Error::PoolExhausted(Resource::Context))
        ));

        let (shared, _outcomes) = undersized(2, 4, 3, 2);
        let _a = shared.admit(SocketHandle(10)).expect("first admission");
        assert!(matches!(
            shared.admit(SocketHandle(11)),
            Err(Error::PoolExhausted(Resource::Buffer))
        ));
    }

    #[test]
    fn teardown_marks_connection_closing_before_release() {
        let (shared, outcomes) = undersized(1, 2, 2, 1);
        let a = admitted(accept(&shared, &outcomes, 10));

        let mut state = shared.take(a).expect("receive should be parked");
        assert_eq!(state.phase(), Phase::Receiving);
        shared.begin_close(&mut state);
        assert_eq!(state.phase(), Phase::Closing);
        assert_eq!(shared.table.lock(a).map(|slot| slot.phase()), Some(Phase::Closing));

        shared.teardown(state);
        assert!(shared.table.lock(a).is_none());
        assert_eq!(shared.transport.closed(), vec![SocketHandle(10)]);
        assert_eq!(shared.gate.available(), 1);
    }

    #[test]
    fn error_driven_close_goes_through_closing() {
        let (shared, outcomes) = undersized(1, 2, 2, 1);
        let a = admitted(accept(&shared, &outcomes, 10));
        assert_eq!(shared.table.lock(a).map(|slot| slot.phase()), Some(Phase::Receiving));

        shared.process_receive(a, Err(io::Error::from_raw_os_error(libc::ECONNRESET)));
        assert!(shared.table.lock(a).is_none());
        assert_eq!(shared.contexts.available(), 2);
        assert_eq!(shared.arena().available(), 2);
    }
}
