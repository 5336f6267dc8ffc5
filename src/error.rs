use std::fmt;
use std::io;

use thiserror::Error;

/// Which fixed-size pool ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Buffer arena chunks.
    Buffer,
    /// Operation contexts.
    Context,
    /// Connection table slots.
    Connection,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Buffer => f.write_str("buffer"),
            Resource::Context => f.write_str("operation context"),
            Resource::Connection => f.write_str("connection slot"),
        }
    }
}

/// Errors returned by the arena, pools and server.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid server sizing. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Arena pool size is not a positive multiple of the chunk size.
    #[error("pool size {pool_size} is not a positive multiple of chunk size {chunk_size}")]
    Capacity { pool_size: u32, chunk_size: u32 },
    /// A fixed-size pool has no free unit left.
    #[error("{0} pool exhausted")]
    PoolExhausted(Resource),
    /// Caller misuse of a pool (bookkeeping bug, never transient).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Socket-layer failure surfaced synchronously.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The admission gate was closed while waiting for a slot.
    #[error("server is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
