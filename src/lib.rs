//! RustConn - callback-driven connections on a single-threaded reactor
//!
//! RustConn models one transport endpoint association (a TCP stream or a
//! connected UDP socket) whose reads, writes, shutdown and teardown are all
//! performed asynchronously on an [`EventLoop`] and reported through
//! callbacks. The [`Connection`] type owns the lifecycle state machine, the
//! non-blocking write path with high-water-mark backpressure, and the
//! teardown protocol; any of its public operations may be called from any
//! thread.
//!
//! ```no_run
//! use rustconn::prelude::*;
//!
//! let mut event_loop = EventLoop::new().expect("Failed to create event loop");
//! let reactor = event_loop.reactor();
//! let table = ConnectionTable::new(reactor.clone());
//!
//! let socket = DatagramSocket::connect("127.0.0.1:0", "127.0.0.1:9000")
//!     .expect("Failed to connect socket");
//! let conn = Connection::from_datagram(reactor, "feed", socket)
//!     .expect("Failed to read socket addresses");
//! conn.set_message_callback(|conn, buffer, _at| {
//!     let data = buffer.retrieve_all_as_vec();
//!     conn.send(&data);
//! });
//! table.adopt(conn);
//!
//! event_loop.run().expect("Event loop failed");
//! ```

// Internal-only modules
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod reactor;
pub(crate) mod socket;
pub(crate) mod table;

// These are the intended public API
pub use buffer::Buffer;
pub use config::{ConnectionConfig, LoopConfig};
pub use connection::{
    default_connection_callback, default_message_callback, CloseCallback, Connection,
    ConnectionCallback, ConnectionRef, ConnectionStats, HighWaterMarkCallback, MessageCallback,
    State, WriteCompleteCallback,
};
pub use error::Error;
pub use reactor::{EventHandler, EventLoop, LoopHandle, Reactor, Ready, Task};
pub use socket::{DatagramSocket, Socket, SocketKind, StreamSocket};
pub use table::ConnectionTable;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::connection::{Connection, ConnectionRef, State};
    pub use crate::error::Error;
    pub use crate::reactor::{EventLoop, LoopHandle, Reactor};
    pub use crate::socket::{DatagramSocket, SocketKind, StreamSocket};
    pub use crate::table::ConnectionTable;
}
