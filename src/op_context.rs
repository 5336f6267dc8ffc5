//! Reusable descriptors for pending socket operations.
//!
//! A fixed set of contexts is built at init (one read and one write context per
//! connection slot) and recycled for the lifetime of the server. A connection
//! checks out a pair on admission and checks both back in on teardown.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::buffer_arena::Chunk;
use crate::connection::ConnectionId;
use crate::error::{Error, Resource, Result};
use crate::transport::IoBuf;

const ACCEPT_CONTEXT_ID: u32 = u32::MAX;

/// Pool tag carried by contexts no pool minted.
const NO_POOL: u32 = 0;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(NO_POOL + 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Accept,
    Receive,
    Send,
}

#[derive(Debug)]
pub struct OperationContext {
    pool: u32,
    id: u32,
    kind: OperationKind,
    chunk: Option<Chunk>,
    owner: Option<ConnectionId>,
}

impl OperationContext {
    fn pooled(pool: u32, id: u32) -> Self {
        Self {
            pool,
            id,
            kind: OperationKind::Receive,
            chunk: None,
            owner: None,
        }
    }

    /// The accept loop's context. Never pooled and never carries a chunk.
    pub fn accept() -> Self {
        Self {
            pool: NO_POOL,
            id: ACCEPT_CONTEXT_ID,
            kind: OperationKind::Accept,
            chunk: None,
            owner: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn assigned_chunk_offset(&self) -> Option<u32> {
        self.chunk.as_ref().map(Chunk::offset)
    }

    pub fn owning_connection(&self) -> Option<ConnectionId> {
        self.owner
    }

    /// Bind a checked-out context to a connection and its buffer.
    pub fn assign(&mut self, kind: OperationKind, chunk: Chunk, owner: ConnectionId) {
        debug_assert!(self.chunk.is_none(), "context already holds a chunk");
        self.kind = kind;
        self.chunk = Some(chunk);
        self.owner = Some(owner);
    }

    /// Record the connection an accept produced.
    pub fn bind(&mut self, owner: ConnectionId) {
        self.owner = Some(owner);
    }

    pub fn chunk(&self) -> Option<&Chunk> {
        self.chunk.as_ref()
    }

    pub fn chunk_mut(&mut self) -> Option<&mut Chunk> {
        self.chunk.as_mut()
    }

    /// Detach the chunk so it can go back to the arena.
    pub fn take_chunk(&mut self) -> Option<Chunk> {
        self.chunk.take()
    }

    /// Raw view of `range` within the assigned chunk.
    pub fn io_buf(&mut self, range: Range<usize>) -> Option<IoBuf> {
        self.chunk.as_mut().map(|chunk| chunk.io_buf(range))
    }

    /// Clear the owner before the context is reused.
    pub fn reset(&mut self) {
        self.owner = None;
    }
}

struct PoolInner {
    free: Vec<OperationContext>,
    pooled: Vec<bool>,
}

/// Thread-safe stack of [`OperationContext`]s.
///
/// Completions for unrelated connections check contexts in and out
/// concurrently, so unlike the arena this pool carries its own lock. The lock
/// is held only for a push or pop.
pub struct OperationContextPool {
    inner: Mutex<PoolInner>,
    id: u32,
    capacity: usize,
}

impl OperationContextPool {
    pub fn initialize(capacity: usize) -> Self {
        assert!(
            capacity < ACCEPT_CONTEXT_ID as usize,
            "context ids must stay below the accept id"
        );
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        // Reverse so the first checkout hands out id 0.
        let free = (0..capacity as u32)
            .rev()
            .map(|ctx| OperationContext::pooled(id, ctx))
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                free,
                pooled: vec![true; capacity],
            }),
            id,
            capacity,
        }
    }

    /// # Errors
    /// `Error::PoolExhausted(Resource::Context)` when every context is checked
    /// out. Callers must not spin on this; it signals a sizing bug upstream.
    pub fn checkout(&self) -> Result<OperationContext> {
        let mut inner = self.lock();
        let ctx = inner
            .free
            .pop()
            .ok_or(Error::PoolExhausted(Resource::Context))?;
        inner.pooled[ctx.id as usize] = false;
        Ok(ctx)
    }

    /// Return a context. Every check-in must match exactly one prior checkout.
    ///
    /// # Errors
    /// `Error::InvalidArgument` if the context was not minted by this pool, is
    /// already pooled, or still holds a chunk.
    pub fn checkin(&self, mut ctx: OperationContext) -> Result<()> {
        if ctx.pool != self.id || ctx.id as usize >= self.capacity {
            return Err(Error::InvalidArgument(
                "context does not belong to this pool",
            ));
        }
        if ctx.chunk.is_some() {
            return Err(Error::InvalidArgument("context still holds a chunk"));
        }
        ctx.reset();

        let mut inner = self.lock();
        if inner.pooled[ctx.id as usize] {
            return Err(Error::InvalidArgument("context is already pooled"));
        }
        inner.pooled[ctx.id as usize] = true;
        inner.free.push(ctx);
        Ok(())
    }

    /// Contexts currently pooled.
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
