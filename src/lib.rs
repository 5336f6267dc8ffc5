//! Library crate for ioarena: buffer arena, operation contexts, admission gate,
//! connection table and the server state machine.
//!
//! The **binary** (`main.rs`) is the only io_uring entrypoint: it compiles `uring`
//! and hands a `UringTransport` to the server. `uring` is intentionally not part
//! of the lib, so everything here stays testable against a scripted transport.

pub mod admission;
pub mod buffer_arena;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod op_context;
pub mod server;
pub mod transport;

pub use admission::AdmissionGate;
pub use buffer_arena::{BufferArena, Chunk};
pub use config::ServerConfig;
pub use connection::{ConnectionId, Phase};
pub use consumer::{Consumer, Echo};
pub use error::{Error, Resource, Result};
pub use op_context::{OperationContext, OperationContextPool, OperationKind};
pub use server::{Server, ServerStats};
pub use transport::{Completion, IoBuf, SocketHandle, Transport};
