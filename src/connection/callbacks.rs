//! Callback types a connection invokes.
//!
//! All callbacks run on the loop thread, never while the connection holds an
//! internal lock, so any of them may call back into the connection.

use super::Connection;
use crate::buffer::Buffer;

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Shared ownership handle of a connection.
pub type ConnectionRef = Arc<Connection>;

/// Fires once when the connection is established and once when it closes.
/// Check [`Connection::connected`] to tell the two apart.
pub type ConnectionCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;

/// Fires per receive with the input buffer and the receive time. Bytes the
/// callback leaves in the buffer are kept for the next invocation.
pub type MessageCallback = Arc<dyn Fn(&ConnectionRef, &mut Buffer, Instant) + Send + Sync>;

/// Fires when everything handed to `send` has been written to the socket.
pub type WriteCompleteCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;

/// Fires with the new output buffer size when it crosses the high-water
/// mark from below.
pub type HighWaterMarkCallback = Arc<dyn Fn(&ConnectionRef, usize) + Send + Sync>;

/// Teardown signal to the collaborator that owns the connection.
pub type CloseCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;

pub fn default_connection_callback(conn: &ConnectionRef) {
    info!(
        name = %conn.name(),
        local_addr = %conn.local_addr(),
        peer_addr = %conn.peer_addr(),
        "Connection is {}",
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

pub fn default_message_callback(_conn: &ConnectionRef, buffer: &mut Buffer, _receive_time: Instant) {
    buffer.retrieve_all();
}

pub(super) struct Callbacks {
    pub(super) connection: ConnectionCallback,
    pub(super) message: MessageCallback,
    pub(super) write_complete: Option<WriteCompleteCallback>,
    pub(super) high_water_mark: Option<HighWaterMarkCallback>,
    pub(super) close: Option<CloseCallback>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            connection: Arc::new(default_connection_callback),
            message: Arc::new(default_message_callback),
            write_complete: None,
            high_water_mark: None,
            close: None,
        }
    }
}
