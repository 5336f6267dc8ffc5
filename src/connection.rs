use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use slab::Slab;

use crate::error::{Error, Resource, Result};
use crate::op_context::OperationContext;
use crate::transport::{IoBuf, SocketHandle};

/// Generation bits kept in a packed id; leaves the top byte free for an op tag.
const GENERATION_BITS: u32 = 24;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// Identifies one admitted connection for its whole lifetime.
///
/// Slots are reused; the generation tells a live connection apart from a
/// completion that belonged to an earlier occupant of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    slot: u32,
    generation: u32,
}

impl ConnectionId {
    pub fn new(slot: u32, generation: u32) -> Self {
        Self {
            slot,
            generation: generation & GENERATION_MASK,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into the low 56 bits of a word.
    pub fn as_u64(&self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }

    pub fn from_u64(raw: u64) -> Self {
        Self::new(raw as u32, (raw >> 32) as u32)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

/// Lifecycle: `Accepting -> Receiving <-> Sending -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Accepting,
    Receiving,
    Sending,
    Closing,
    Closed,
}

/// Ordered byte ranges waiting to be copied into the write chunk.
#[derive(Debug, Default)]
pub struct SendQueue {
    ranges: VecDeque<Vec<u8>>,
    front_pos: usize,
    bytes: usize,
}

impl SendQueue {
    pub fn push(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.bytes += bytes.len();
        self.ranges.push_back(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Queued bytes not yet copied out.
    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    /// Copy queued bytes in order into `dst`. Returns how many were copied.
    pub fn fill(&mut self, dst: &mut [u8]) -> usize {
        let mut written = 0;
        while written < dst.len() {
            let Some(front) = self.ranges.front() else {
                break;
            };
            let src = &front[self.front_pos..];
            let n = src.len().min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&src[..n]);
            written += n;
            self.front_pos += n;
            if self.front_pos == front.len() {
                self.ranges.pop_front();
                self.front_pos = 0;
            }
        }
        self.bytes -= written;
        written
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.front_pos = 0;
        self.bytes = 0;
    }
}

/// Mutable record of one accepted connection.
///
/// Owned by whichever worker is handling the connection's current completion;
/// parked in the [`ConnectionTable`] while an operation is in flight.
#[derive(Debug)]
pub struct ConnectionState {
    id: ConnectionId,
    socket: SocketHandle,
    pub(crate) phase: Phase,
    read_ctx: OperationContext,
    write_ctx: OperationContext,
    bytes_read_total: u64,
    pending_send: SendQueue,
    partial_receive_remainder: Vec<u8>,
    // Bytes copied into the write chunk and how many of them went out.
    staged_len: usize,
    staged_sent: usize,
}

impl ConnectionState {
    /// Both contexts must already carry their chunk.
    pub fn new(
        id: ConnectionId,
        socket: SocketHandle,
        read_ctx: OperationContext,
        write_ctx: OperationContext,
    ) -> Self {
        debug_assert!(read_ctx.chunk().is_some() && write_ctx.chunk().is_some());
        Self {
            id,
            socket,
            phase: Phase::Receiving,
            read_ctx,
            write_ctx,
            bytes_read_total: 0,
            pending_send: SendQueue::default(),
            partial_receive_remainder: Vec::new(),
            staged_len: 0,
            staged_sent: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn socket(&self) -> SocketHandle {
        self.socket
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn bytes_read_total(&self) -> u64 {
        self.bytes_read_total
    }

    pub fn read_chunk_offset(&self) -> Option<u32> {
        self.read_ctx.assigned_chunk_offset()
    }

    pub fn write_chunk_offset(&self) -> Option<u32> {
        self.write_ctx.assigned_chunk_offset()
    }

    pub fn pending_send_bytes(&self) -> usize {
        self.pending_send.len_bytes() + (self.staged_len - self.staged_sent)
    }

    /// View of the whole read chunk for the next receive.
    pub(crate) fn receive_buf(&mut self) -> Option<IoBuf> {
        let len = self.read_ctx.chunk()?.len();
        self.read_ctx.io_buf(0..len)
    }

    /// Account for `n` received bytes and split out what the consumer sees:
    /// the fresh bytes and the carried-over remainder.
    pub(crate) fn delivery(&mut self, n: usize) -> (&[u8], &mut Vec<u8>) {
        self.bytes_read_total += n as u64;
        let bytes: &[u8] = match self.read_ctx.chunk() {
            Some(chunk) => &chunk.as_slice()[..n.min(chunk.len())],
            None => &[],
        };
        (bytes, &mut self.partial_receive_remainder)
    }

    pub(crate) fn queue_send(&mut self, bytes: Vec<u8>) {
        self.pending_send.push(bytes);
    }

    /// View of the next bytes to send, refilling the write chunk from the
    /// queue once the staged bytes are all out. `None` when nothing is left.
    pub(crate) fn next_send_buf(&mut self) -> Option<IoBuf> {
        if self.staged_sent == self.staged_len {
            let chunk = self.write_ctx.chunk_mut()?;
            self.staged_len = self.pending_send.fill(chunk.as_mut_slice());
            self.staged_sent = 0;
        }
        if self.staged_len == 0 {
            return None;
        }
        self.write_ctx.io_buf(self.staged_sent..self.staged_len)
    }

    /// Record `n` bytes sent. Returns `true` when nothing remains staged or
    /// queued.
    pub(crate) fn advance_send(&mut self, n: usize) -> bool {
        self.staged_sent = (self.staged_sent + n).min(self.staged_len);
        self.staged_sent == self.staged_len && self.pending_send.is_empty()
    }

    /// Give up the socket and both contexts for teardown.
    pub(crate) fn into_parts(self) -> (SocketHandle, OperationContext, OperationContext) {
        (self.socket, self.read_ctx, self.write_ctx)
    }
}

/// Who holds a slot's connection right now.
#[derive(Debug)]
pub(crate) enum Occupant {
    Vacant,
    /// An operation is in flight; the state waits here for its completion.
    Parked(ConnectionState),
    /// A worker owns the state for the duration of one completion.
    Busy,
}

#[derive(Debug)]
pub(crate) struct Slot {
    generation: u32,
    occupant: Occupant,
    socket: Option<SocketHandle>,
    phase: Phase,
    close_requested: bool,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            generation: 0,
            occupant: Occupant::Vacant,
            socket: None,
            phase: Phase::Closed,
            close_requested: false,
        }
    }

    fn holds(&self, id: ConnectionId) -> bool {
        self.generation == id.generation && !matches!(self.occupant, Occupant::Vacant)
    }

    /// Take a parked state for processing.
    pub(crate) fn take(&mut self) -> Option<ConnectionState> {
        match std::mem::replace(&mut self.occupant, Occupant::Busy) {
            Occupant::Parked(state) => Some(state),
            other => {
                self.occupant = other;
                None
            }
        }
    }

    pub(crate) fn park(&mut self, state: ConnectionState) {
        debug_assert!(matches!(self.occupant, Occupant::Busy));
        self.phase = state.phase;
        self.occupant = Occupant::Parked(state);
    }

    pub(crate) fn is_parked(&self) -> bool {
        matches!(self.occupant, Occupant::Parked(_))
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Flag the connection for close. Returns `false` if already flagged.
    pub(crate) fn request_close(&mut self) -> bool {
        if self.close_requested {
            return false;
        }
        self.close_requested = true;
        self.phase = Phase::Closing;
        if let Occupant::Parked(state) = &mut self.occupant {
            state.phase = Phase::Closing;
        }
        true
    }

    pub(crate) fn socket(&self) -> Option<SocketHandle> {
        self.socket
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }
}

/// Fixed table of connection slots.
///
/// Each slot has its own lock; two completions for the same connection never
/// race, so the locks only guard against explicit closes and stale
/// completions. Free slot keys come from a slab sized to `max_connections`.
pub struct ConnectionTable {
    slots: Box<[Mutex<Slot>]>,
    keys: Mutex<Slab<()>>,
}

impl ConnectionTable {
    pub fn new(capacity: u32) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(Slot::vacant())).collect();
        Self {
            slots,
            keys: Mutex::new(Slab::with_capacity(capacity as usize)),
        }
    }

    /// Claim a free slot for a freshly accepted socket. The caller owns the
    /// new connection (slot is `Busy`) until it parks it.
    pub fn reserve(&self, socket: SocketHandle) -> Result<ConnectionId> {
        let key = {
            let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
            if keys.len() >= self.slots.len() {
                return Err(Error::PoolExhausted(Resource::Connection));
            }
            keys.insert(())
        };

        let mut slot = self.slots[key].lock().unwrap_or_else(PoisonError::into_inner);
        slot.occupant = Occupant::Busy;
        slot.socket = Some(socket);
        slot.phase = Phase::Accepting;
        slot.close_requested = false;
        Ok(ConnectionId::new(key as u32, slot.generation))
    }

    /// Lock the slot if it still belongs to `id`.
    pub(crate) fn lock(&self, id: ConnectionId) -> Option<MutexGuard<'_, Slot>> {
        let slot = self
            .slots
            .get(id.slot as usize)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.holds(id).then_some(slot)
    }

    /// Vacate the slot and bump its generation so late completions for `id`
    /// are recognized as stale.
    pub fn release(&self, id: ConnectionId) {
        let Some(mut slot) = self.lock(id) else {
            return;
        };
        slot.occupant = Occupant::Vacant;
        slot.socket = None;
        slot.phase = Phase::Closed;
        slot.close_requested = false;
        slot.generation = (slot.generation + 1) & GENERATION_MASK;
        drop(slot);

        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.try_remove(id.slot as usize);
    }

    /// Connections currently holding a slot.
    pub fn live(&self) -> usize {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
