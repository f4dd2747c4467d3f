//! Reactor abstraction and the mio-backed event loop.
//!
//! A [`Reactor`] is the single thread that owns a set of sockets. It polls
//! them for readiness, dispatches readiness to [`EventHandler`]s, runs
//! delayed tasks, and executes tasks queued from other threads in FIFO
//! order. [`EventLoop`] is the production implementation; anything else
//! that honors the same contract (a deterministic test reactor, for example)
//! can drive a [`Connection`](crate::Connection) too.

mod event_loop;
pub(crate) mod registration;
mod timer;

pub use event_loop::{EventLoop, LoopHandle};

use crate::socket::Socket;

use mio::event::Event;
use mio::{Interest, Token};
use std::io;
use std::sync::Weak;
use std::time::{Duration, Instant};

/// A unit of work executed on the loop thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Readiness reported for one registered socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl Ready {
    pub fn readable() -> Self {
        Self {
            readable: true,
            ..Self::default()
        }
    }

    pub fn writable() -> Self {
        Self {
            writable: true,
            ..Self::default()
        }
    }

    pub fn error() -> Self {
        Self {
            error: true,
            ..Self::default()
        }
    }

    /// Both directions closed with nothing left to read.
    pub fn hang_up() -> Self {
        Self {
            read_closed: true,
            write_closed: true,
            ..Self::default()
        }
    }
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

/// Receiver of readiness notifications for one token.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, ready: Ready, receive_time: Instant);
}

/// The loop a connection is bound to.
///
/// Every method is callable from any thread unless stated otherwise. Poller
/// operations must only be issued from the loop thread.
pub trait Reactor: Send + Sync {
    fn is_in_loop_thread(&self) -> bool;

    /// Enqueues `task` to run on the loop thread during the next turn.
    fn queue_in_loop(&self, task: Task);

    /// Runs `task` right away when called on the loop thread, otherwise
    /// enqueues it.
    fn run_in_loop(&self, task: Task) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Runs `task` on the loop thread once `delay` has elapsed. A delay too
    /// large to represent as a deadline never elapses: the task is dropped.
    fn run_after(&self, delay: Duration, task: Task);

    /// Allocates a token that is unique within this reactor.
    fn next_token(&self) -> Token;

    /// Routes readiness for `token` to `handler`. The reactor holds the
    /// handler weakly and upgrades it for the duration of each dispatch.
    fn attach(&self, token: Token, handler: Weak<dyn EventHandler>);

    fn detach(&self, token: Token);

    fn register(&self, socket: &mut dyn Socket, token: Token, interest: Interest)
        -> io::Result<()>;

    fn reregister(
        &self,
        socket: &mut dyn Socket,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister(&self, socket: &mut dyn Socket, token: Token) -> io::Result<()>;

    /// # Panics
    ///
    /// Panics when called off the loop thread.
    fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "Loop-affine operation invoked from {:?}",
            std::thread::current().id()
        );
    }
}
