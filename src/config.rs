//! Server sizing and operational configuration.
//!
//! Loaded once by the binary (see `main.rs`) and immutable afterwards.

use crate::error::{Error, Result};

/// One read chunk and one write chunk per connection. Accepts carry no buffer.
pub const OPERATIONS_PER_CONNECTION: u32 = 2;

/// Default number of completion dispatch threads.
pub const DEFAULT_COMPLETION_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of simultaneously admitted connections.
    pub max_connections: u32,
    /// Bytes per read/write chunk.
    pub chunk_size: u32,
    /// Listen backlog handed to the transport. Authoritative.
    pub listen_backlog: u32,
    /// Initial bump cursor of the arena. Bytes below it are reserved and never
    /// handed out. Must be a multiple of `chunk_size`.
    pub arena_start_offset: u32,
    /// Threads draining the completion channel. Zero means the owner drives
    /// `Server::dispatch` itself.
    pub completion_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            chunk_size: 1024,
            listen_backlog: 100,
            arena_start_offset: 0,
            completion_workers: DEFAULT_COMPLETION_WORKERS,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be > 0".into()));
        }
        if self.listen_backlog == 0 {
            return Err(Error::Config("listen_backlog must be > 0".into()));
        }
        if self.arena_start_offset % self.chunk_size != 0 {
            return Err(Error::Config(format!(
                "arena_start_offset {} is not a multiple of chunk_size {}",
                self.arena_start_offset, self.chunk_size
            )));
        }
        if self.checked_arena_pool_size().is_none() {
            return Err(Error::Config(format!(
                "arena of {} connections x {} bytes x {} does not fit in u32 offsets",
                self.max_connections, self.chunk_size, OPERATIONS_PER_CONNECTION
            )));
        }
        Ok(())
    }

    /// Bytes the arena dedicates to connection chunks.
    pub fn connection_pool_size(&self) -> u32 {
        self.chunk_size * self.max_connections * OPERATIONS_PER_CONNECTION
    }

    /// Total arena size including the reserved prefix. Call after `validate`.
    pub fn arena_pool_size(&self) -> u32 {
        self.arena_start_offset + self.connection_pool_size()
    }

    /// Operation contexts pre-allocated at init.
    pub fn context_capacity(&self) -> usize {
        self.max_connections as usize * OPERATIONS_PER_CONNECTION as usize
    }

    fn checked_arena_pool_size(&self) -> Option<u32> {
        self.chunk_size
            .checked_mul(self.max_connections)?
            .checked_mul(OPERATIONS_PER_CONNECTION)?
            .checked_add(self.arena_start_offset)
    }
}
