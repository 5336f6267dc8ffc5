use std::cell::UnsafeCell;
use std::ops::Range;
use std::ptr::NonNull;

use crate::error::{Error, Resource, Result};
use crate::metrics;
use crate::transport::IoBuf;

/// Owned handle to one chunk of a [`BufferArena`].
///
/// Minted only by the arena and consumed by [`BufferArena::release_chunk`], so a
/// handle can never be released twice or aliased once checked out.
#[derive(Debug)]
pub struct Chunk {
    data: NonNull<u8>,
    offset: u32,
    len: u32,
}

unsafe impl Send for Chunk {}

impl Chunk {
    /// Starting offset inside the arena.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len as usize) }
    }

    /// Raw view of `range` for an asynchronous operation.
    pub fn io_buf(&mut self, range: Range<usize>) -> IoBuf {
        assert!(
            range.start <= range.end && range.end <= self.len as usize,
            "io_buf range out of bounds"
        );
        let ptr = unsafe { self.data.add(range.start) };
        IoBuf::new(ptr, (range.end - range.start) as u32)
    }
}

/// Fixed-capacity byte arena carved into equal chunks.
///
/// Fresh chunks are bump-allocated from `cursor`; released chunks go on a LIFO
/// free list and are handed out again before the cursor advances, so bursty
/// connect/disconnect cycles keep touching the same cache lines.
///
/// # Concurrency
///
/// Not internally synchronized. The server keeps the arena behind a mutex and
/// only holds it for a push or pop.
pub struct BufferArena {
    storage: Box<[UnsafeCell<u8>]>,
    pool_size: u32,
    chunk_size: u32,
    cursor: u32,
    free_offsets: Vec<u32>,
}

unsafe impl Send for BufferArena {}

impl BufferArena {
    /// Allocate `pool_size` bytes without checking the layout.
    ///
    /// Pre-touches every page so the first connections do not pay for page
    /// faults. Chunks that would straddle `pool_size` are never handed out.
    pub fn new(pool_size: u32, chunk_size: u32, start_offset: u32) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");

        let storage: Vec<UnsafeCell<u8>> =
            (0..pool_size as usize).map(|_| UnsafeCell::new(0u8)).collect();
        let storage = storage.into_boxed_slice();
        for i in (0..storage.len()).step_by(4096) {
            unsafe {
                *storage[i].get() = 0;
            }
        }

        let chunks = pool_size / chunk_size;
        Self {
            storage,
            pool_size,
            chunk_size,
            cursor: start_offset,
            free_offsets: Vec::with_capacity(chunks as usize),
        }
    }

    /// Validated constructor used at server init.
    ///
    /// # Errors
    /// `Error::Capacity` unless `pool_size` is a positive multiple of `chunk_size`.
    pub fn initialize(pool_size: u32, chunk_size: u32, start_offset: u32) -> Result<Self> {
        if chunk_size == 0 || pool_size == 0 || pool_size % chunk_size != 0 {
            return Err(Error::Capacity {
                pool_size,
                chunk_size,
            });
        }
        Ok(Self::new(pool_size, chunk_size, start_offset))
    }

    /// Hand out one chunk, most recently released first.
    ///
    /// # Errors
    /// `Error::PoolExhausted(Resource::Buffer)` when the free list is empty and
    /// the cursor has no room for another chunk. The arena never grows.
    pub fn acquire_chunk(&mut self) -> Result<Chunk> {
        let offset = match self.free_offsets.pop() {
            Some(offset) => offset,
            None => {
                let fits = self
                    .cursor
                    .checked_add(self.chunk_size)
                    .is_some_and(|end| end <= self.pool_size);
                if !fits {
                    metrics::inc_pool_exhausted();
                    return Err(Error::PoolExhausted(Resource::Buffer));
                }
                let offset = self.cursor;
                self.cursor += self.chunk_size;
                offset
            }
        };

        let base = self.storage.as_ptr() as *mut u8;
        let data = unsafe { NonNull::new_unchecked(base.add(offset as usize)) };
        Ok(Chunk {
            data,
            offset,
            len: self.chunk_size,
        })
    }

    /// Return a chunk to the free list.
    ///
    /// The caller must not have any outstanding operation still reading or
    /// writing through the chunk.
    pub fn release_chunk(&mut self, chunk: Chunk) {
        debug_assert!(
            self.owns(&chunk),
            "chunk at offset {} does not belong to this arena",
            chunk.offset
        );
        self.free_offsets.push(chunk.offset);
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Next never-used offset.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Released offsets, bottom of the stack first.
    pub fn free_offsets(&self) -> &[u32] {
        &self.free_offsets
    }

    /// Chunks that can still be acquired.
    pub fn available(&self) -> usize {
        let untouched = self.pool_size.saturating_sub(self.cursor) / self.chunk_size;
        self.free_offsets.len() + untouched as usize
    }

    fn owns(&self, chunk: &Chunk) -> bool {
        let base = self.storage.as_ptr() as *const u8;
        let expected = unsafe { base.add(chunk.offset as usize) };
        std::ptr::eq(expected, chunk.data.as_ptr())
            && chunk.offset as u64 + chunk.len as u64 <= self.pool_size as u64
    }
}
