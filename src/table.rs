//! Owner-side bookkeeping for connections.
//!
//! [`ConnectionTable`] plays the part an acceptor or connector plays for its
//! connections: it keeps them alive by name, establishes them on the loop
//! thread, and on close removes them and schedules their destruction.

use crate::connection::ConnectionRef;
use crate::reactor::Reactor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

type Entries = Mutex<HashMap<String, ConnectionRef>>;

/// Named set of live connections bound to one reactor.
pub struct ConnectionTable {
    reactor: Arc<dyn Reactor>,
    entries: Arc<Entries>,
}

impl ConnectionTable {
    pub fn new(reactor: Arc<dyn Reactor>) -> Self {
        Self {
            reactor,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Takes ownership of `conn` and establishes it on the loop thread.
    ///
    /// Once the connection closes it is removed from the table and
    /// [`Connection::connect_destroyed`](crate::Connection::connect_destroyed) is queued on the loop.
    ///
    /// # Panics
    ///
    /// Panics if a connection with the same name is already in the table.
    pub fn adopt(&self, conn: ConnectionRef) {
        let entries: Weak<Entries> = Arc::downgrade(&self.entries);
        let reactor = self.reactor.clone();
        conn.set_close_callback(move |conn| {
            if let Some(entries) = entries.upgrade() {
                let removed = lock(&entries).remove(conn.name());
                debug!(name = %conn.name(), removed = removed.is_some(), "Removing connection");
            }
            let conn = conn.clone();
            reactor.queue_in_loop(Box::new(move || conn.connect_destroyed()));
        });

        {
            let mut entries = lock(&self.entries);
            assert!(
                !entries.contains_key(conn.name()),
                "Connection name {} already in use",
                conn.name()
            );
            entries.insert(conn.name().to_string(), conn.clone());
        }
        info!(name = %conn.name(), peer_addr = %conn.peer_addr(), "Adopted connection");

        self.reactor
            .run_in_loop(Box::new(move || conn.connect_established()));
    }

    pub fn get(&self, name: &str) -> Option<ConnectionRef> {
        lock(&self.entries).get(name).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    /// Force-closes every connection. Entries leave the table as their
    /// close paths run on the loop.
    pub fn close_all(&self) {
        let conns: Vec<ConnectionRef> = lock(&self.entries).values().cloned().collect();
        if conns.is_empty() {
            return;
        }
        warn!(count = conns.len(), "Force closing all connections");
        for conn in conns {
            conn.force_close();
        }
    }
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, ConnectionRef>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}
