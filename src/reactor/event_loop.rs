//! mio-backed reactor.
//!
//! The [`EventLoop`] owns the `Poll` and runs on the thread that created it.
//! Its [`LoopHandle`] is the thread-safe side: other threads use it to queue
//! tasks, schedule timers and stop the loop, and connections use it as their
//! [`Reactor`].

use super::timer::TimerQueue;
use super::{EventHandler, Reactor, Ready, Task};
use crate::config::LoopConfig;
use crate::error::Error;
use crate::socket::Socket;
use ::config::Config;

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, trace, warn};

const WAKE_TOKEN: Token = Token(0);
const FIRST_HANDLER_TOKEN: usize = 1;

/// Single-threaded reactor.
///
/// Not `Send`: the loop is bound to the thread that constructs it, and
/// [`Reactor::is_in_loop_thread`] compares against that thread.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    receiver: Receiver<Task>,
    handle: LoopHandle,
    _not_send: PhantomData<*const ()>,
}

/// Thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Registry,
    waker: Waker,
    sender: Sender<Task>,
    thread_id: ThreadId,
    timers: Mutex<TimerQueue>,
    handlers: Mutex<HashMap<Token, Weak<dyn EventHandler>>>,
    next_token: AtomicUsize,
    quit: AtomicBool,
}

// ============================================================================
// Constructors
// ============================================================================

impl EventLoop {
    pub fn new() -> Result<Self, Error> {
        Self::with_config(&LoopConfig::default())
    }

    /// Creates a loop from `config`, using `name` as the configuration
    /// namespace.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        Self::with_config(&LoopConfig::from_config(config, name))
    }

    pub fn with_config(config: &LoopConfig) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (sender, receiver) = channel();

        let shared = Arc::new(Shared {
            registry,
            waker,
            sender,
            thread_id: thread::current().id(),
            timers: Mutex::new(TimerQueue::default()),
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(FIRST_HANDLER_TOKEN),
            quit: AtomicBool::new(false),
        });

        debug!(poll_capacity = config.poll_capacity, thread = ?shared.thread_id, "Created event loop");

        Ok(Self {
            poll,
            events: Events::with_capacity(config.poll_capacity),
            receiver,
            handle: LoopHandle { shared },
            _not_send: PhantomData,
        })
    }
}

// ============================================================================
// Loop Operations
// ============================================================================

impl EventLoop {
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Returns the handle as a shareable [`Reactor`] for connections.
    pub fn reactor(&self) -> Arc<dyn Reactor> {
        Arc::new(self.handle.clone())
    }

    /// Runs until [`LoopHandle::quit`] is called. A quit requested before
    /// `run` starts makes it return after a single turn.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> Result<(), Error> {
        debug!("Event loop started");
        loop {
            self.run_once(None)?;
            if self.handle.shared.quit.load(Ordering::Acquire) {
                break;
            }
        }
        debug!("Event loop stopped");
        Ok(())
    }

    /// Performs one loop turn: waits up to `timeout` (or until the next
    /// timer is due) for readiness, dispatches it, fires expired timers and
    /// runs queued tasks.
    ///
    /// Returns the number of readiness events dispatched.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        self.handle.assert_in_loop_thread();

        let timeout = match (timeout, self.handle.time_to_next_timer()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err.into()),
        }
        let receive_time = Instant::now();

        let mut dispatched = 0;
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }

            // The handler table lock must not be held while dispatching.
            let handler = self.handle.shared.lock_handlers().get(&token).cloned();
            match handler.as_ref().and_then(Weak::upgrade) {
                Some(handler) => {
                    handler.handle_event(Ready::from(event), receive_time);
                    dispatched += 1;
                }
                None => trace!(token = token.0, "Readiness for a detached token"),
            }
        }

        self.run_expired_timers();
        self.run_pending_tasks();

        Ok(dispatched)
    }

    fn run_expired_timers(&mut self) {
        let expired = self
            .handle
            .shared
            .lock_timers()
            .pop_expired(Instant::now());
        if !expired.is_empty() {
            trace!(count = expired.len(), "Running expired timers");
        }
        for task in expired {
            task();
        }
    }

    fn run_pending_tasks(&mut self) {
        let tasks: Vec<Task> = self.receiver.try_iter().collect();
        if !tasks.is_empty() {
            trace!(count = tasks.len(), "Running queued tasks");
        }
        for task in tasks {
            task();
        }
    }
}

// ============================================================================
// Handle Operations
// ============================================================================

impl LoopHandle {
    /// Asks the loop to stop after the current turn.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    /// Number of timers that have not fired yet.
    pub fn pending_timers(&self) -> usize {
        self.shared.lock_timers().len()
    }

    fn time_to_next_timer(&self) -> Option<Duration> {
        self.shared
            .lock_timers()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn wake(&self) {
        if let Err(err) = self.shared.waker.wake() {
            error!(?err, "Failed to wake event loop");
        }
    }
}

impl Shared {
    fn lock_timers(&self) -> MutexGuard<'_, TimerQueue> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, HashMap<Token, Weak<dyn EventHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Reactor Trait Implementation
// ============================================================================

impl Reactor for LoopHandle {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    fn queue_in_loop(&self, task: Task) {
        if self.shared.sender.send(task).is_err() {
            warn!("Event loop is gone, dropping task");
            return;
        }
        self.wake();
    }

    fn run_after(&self, delay: Duration, task: Task) {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            warn!(?delay, "Delay out of range, timer will never fire");
            return;
        };
        self.shared.lock_timers().push(deadline, task);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn attach(&self, token: Token, handler: Weak<dyn EventHandler>) {
        self.shared.lock_handlers().insert(token, handler);
    }

    fn detach(&self, token: Token) {
        self.shared.lock_handlers().remove(&token);
    }

    fn register(
        &self,
        socket: &mut dyn Socket,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.shared.registry.register(socket, token, interest)
    }

    fn reregister(
        &self,
        socket: &mut dyn Socket,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.shared.registry.reregister(socket, token, interest)
    }

    fn deregister(&self, socket: &mut dyn Socket, _token: Token) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.shared.registry.deregister(socket)
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread_id", &self.shared.thread_id)
            .finish_non_exhaustive()
    }
}
