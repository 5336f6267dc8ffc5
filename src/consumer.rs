//! Outward seam where a wire protocol plugs in.

use crate::connection::ConnectionId;

/// Application side of the server.
///
/// Called from completion workers; calls for different connections run
/// concurrently, calls for one connection arrive in wire order.
pub trait Consumer: Send + Sync + 'static {
    /// `bytes` is exactly what the last receive delivered. `remainder` is the
    /// connection's hold-over buffer: the server keeps it between calls and
    /// never looks inside. Returning bytes queues them for sending; receiving
    /// pauses until they are written.
    fn on_bytes_received(
        &self,
        conn: ConnectionId,
        bytes: &[u8],
        remainder: &mut Vec<u8>,
    ) -> Option<Vec<u8>>;

    fn on_connection_closed(&self, conn: ConnectionId);
}

/// Writes every received byte straight back.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Consumer for Echo {
    fn on_bytes_received(
        &self,
        _conn: ConnectionId,
        bytes: &[u8],
        _remainder: &mut Vec<u8>,
    ) -> Option<Vec<u8>> {
        Some(bytes.to_vec())
    }

    fn on_connection_closed(&self, _conn: ConnectionId) {}
}
