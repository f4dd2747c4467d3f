//! Connection state machine and write-path flow control.
//!
//! A [`Connection`] owns one socket bound to one [`Reactor`]. All socket I/O
//! and buffer mutation happens on the loop thread. The public mutators
//! ([`send`](Connection::send), [`shutdown`](Connection::shutdown),
//! [`force_close`](Connection::force_close),
//! [`start_read`](Connection::start_read), [`stop_read`](Connection::stop_read))
//! may be called from any thread; off the loop thread they are queued as
//! tasks and run later in FIFO order.
//!
//! Lifecycle:
//!
//! ```text
//! Connecting --connect_established--> Connected --shutdown/force_close--> Disconnecting
//!                                         |                                    |
//!                                         +------- close path (peer, error) ---+--> Disconnected
//! ```
//!
//! The owner calls [`connect_established`](Connection::connect_established)
//! once, and [`connect_destroyed`](Connection::connect_destroyed) once after
//! the close callback told it the connection is gone.

mod callbacks;
mod state;

pub use callbacks::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    ConnectionRef, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
pub use state::State;

use callbacks::Callbacks;
use state::AtomicState;

use crate::buffer::Buffer;
use crate::config::ConnectionConfig;
use crate::reactor::registration::Registration;
use crate::reactor::{EventHandler, Reactor, Ready};
use crate::error::Error;
use crate::socket::{DatagramSocket, Socket, SocketKind, StreamSocket};

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

/// Traffic counters of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub created_at: Instant,
    pub last_receive: Option<Instant>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// One transport endpoint association driven by a reactor.
///
/// Always handled through [`ConnectionRef`]. The connection keeps only a
/// weak reference to itself, which deferred tasks upgrade so that the
/// connection outlives any task or callback still in flight.
pub struct Connection {
    reactor: Arc<dyn Reactor>,
    name: String,
    kind: SocketKind,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicState,
    reading: AtomicBool,
    weak_self: Weak<Connection>,
    callbacks: Mutex<Callbacks>,
    io: Mutex<Io>,
}

// Loop-thread state. Never locked across a callback.
struct Io {
    socket: Option<Box<dyn Socket>>,
    registration: Registration,
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
    // Set by force_close; the queued close must not be preceded by a drain.
    closing: bool,
    half_closed: bool,
    stats: ConnectionStats,
}

// Callbacks owed by the write path once the io lock is released.
#[derive(Default)]
struct WriteOutcome {
    complete: bool,
    high_water: Option<usize>,
    shutdown: bool,
    fault: Option<io::Error>,
}

enum ReadOutcome {
    Data(usize),
    WouldBlock,
    EndOfStream,
    Fault(io::Error),
}

// ============================================================================
// Constructors
// ============================================================================

impl Connection {
    /// Creates a connection around an open, non-blocking socket.
    ///
    /// The connection starts in [`State::Connecting`] and does nothing until
    /// its owner calls [`connect_established`](Self::connect_established).
    pub fn new(
        reactor: Arc<dyn Reactor>,
        name: impl Into<String>,
        socket: Box<dyn Socket>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> ConnectionRef {
        Self::with_config(
            reactor,
            name,
            socket,
            local_addr,
            peer_addr,
            &ConnectionConfig::default(),
        )
    }

    pub fn with_config(
        reactor: Arc<dyn Reactor>,
        name: impl Into<String>,
        socket: Box<dyn Socket>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: &ConnectionConfig,
    ) -> ConnectionRef {
        let name = name.into();
        let kind = socket.kind();
        let token = reactor.next_token();
        debug!(%name, ?kind, token = token.0, %local_addr, %peer_addr, "Creating connection");

        Arc::new_cyclic(|weak_self| Self {
            reactor,
            name,
            kind,
            local_addr,
            peer_addr,
            state: AtomicState::new(State::Connecting),
            reading: AtomicBool::new(false),
            weak_self: weak_self.clone(),
            callbacks: Mutex::new(Callbacks::default()),
            io: Mutex::new(Io {
                socket: Some(socket),
                registration: Registration::new(token),
                input: Buffer::new(),
                output: Buffer::new(),
                high_water_mark: config.high_water_mark,
                closing: false,
                half_closed: false,
                stats: ConnectionStats {
                    created_at: Instant::now(),
                    last_receive: None,
                    bytes_received: 0,
                    bytes_sent: 0,
                },
            }),
        })
    }

    /// Wraps an accepted or connected TCP stream, reading the endpoint
    /// addresses from the socket.
    pub fn from_stream(
        reactor: Arc<dyn Reactor>,
        name: impl Into<String>,
        socket: StreamSocket,
    ) -> Result<ConnectionRef, Error> {
        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr()?;
        Ok(Self::new(reactor, name, Box::new(socket), local_addr, peer_addr))
    }

    /// Wraps a connected datagram socket, reading the endpoint addresses from
    /// the socket.
    pub fn from_datagram(
        reactor: Arc<dyn Reactor>,
        name: impl Into<String>,
        socket: DatagramSocket,
    ) -> Result<ConnectionRef, Error> {
        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr()?;
        Ok(Self::new(reactor, name, Box::new(socket), local_addr, peer_addr))
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Connection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.reactor
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> State {
        self.state.load()
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Whether reading is enabled.
    ///
    /// Not synchronized with [`start_read`](Self::start_read) or
    /// [`stop_read`](Self::stop_read) issued from another thread: the answer
    /// reflects the last toggle the loop thread has executed.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.lock_io().stats.clone()
    }

    /// Runs `f` on the input buffer.
    ///
    /// Inside a message callback the input buffer is lent to the callback,
    /// so `f` sees it empty there.
    pub fn with_input_buffer<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        f(&mut self.lock_io().input)
    }

    /// Runs `f` on the output buffer. Only meaningful on the loop thread.
    pub fn with_output_buffer<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        f(&mut self.lock_io().output)
    }
}

// ============================================================================
// Callback Configuration
// ============================================================================

impl Connection {
    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionRef) + Send + Sync + 'static,
    {
        self.lock_callbacks().connection = Arc::new(cb);
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionRef, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        self.lock_callbacks().message = Arc::new(cb);
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionRef) + Send + Sync + 'static,
    {
        self.lock_callbacks().write_complete = Some(Arc::new(cb));
    }

    /// Installs the backpressure callback and its threshold in bytes. A
    /// threshold of 0 disables the callback.
    pub fn set_high_water_mark_callback<F>(&self, cb: F, high_water_mark: usize)
    where
        F: Fn(&ConnectionRef, usize) + Send + Sync + 'static,
    {
        self.lock_callbacks().high_water_mark = Some(Arc::new(cb));
        self.lock_io().high_water_mark = high_water_mark;
    }

    /// Internal use by the owning collaborator.
    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionRef) + Send + Sync + 'static,
    {
        self.lock_callbacks().close = Some(Arc::new(cb));
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl Connection {
    /// Arms read readiness and fires the connection callback.
    ///
    /// Called exactly once, on the loop thread, by the owner.
    ///
    /// # Panics
    ///
    /// Panics off the loop thread or when the connection is not in
    /// [`State::Connecting`].
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn connect_established(&self) {
        self.reactor.assert_in_loop_thread();
        if let Err(state) = self.state.transition(&[State::Connecting], State::Connected) {
            panic!("connect_established called in state {state}");
        }

        let registered = {
            let mut guard = self.lock_io();
            let io = &mut *guard;
            let handler: Weak<dyn EventHandler> = self.weak_self.clone();
            self.reactor.attach(io.registration.token(), handler);
            match io.socket.as_deref_mut() {
                Some(socket) => io.registration.enable_reading(&*self.reactor, socket),
                None => Ok(()),
            }
        };
        self.reading.store(true, Ordering::Relaxed);
        info!(local_addr = %self.local_addr, peer_addr = %self.peer_addr, "Connection established");

        if let Some(this) = self.shared() {
            let cb = self.lock_callbacks().connection.clone();
            cb(&this);
        }

        if let Err(err) = registered {
            self.handle_fault("register", err);
        }
    }

    /// Releases the event registration and the socket.
    ///
    /// Called exactly once, on the loop thread, by the owner after it
    /// dropped the connection from its bookkeeping. A connection the owner
    /// tears down while still connected goes through the teardown
    /// notification here.
    ///
    /// # Panics
    ///
    /// Panics off the loop thread, before establishment, or on a second
    /// call.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn connect_destroyed(&self) {
        self.reactor.assert_in_loop_thread();

        if self
            .state
            .transition(&[State::Connected, State::Disconnecting], State::Disconnected)
            .is_ok()
        {
            self.disable_all_interest();
            if let Some(this) = self.shared() {
                let cb = self.lock_callbacks().connection.clone();
                cb(&this);
            }
        }

        let state = self.state();
        assert!(
            state == State::Disconnected,
            "connect_destroyed called in state {state}"
        );

        let mut guard = self.lock_io();
        let io = &mut *guard;
        assert!(
            !io.registration.is_removed(),
            "connect_destroyed called twice"
        );
        if let Some(socket) = io.socket.as_deref_mut() {
            if let Err(err) = io.registration.remove(&*self.reactor, socket) {
                warn!(?err, "Failed to deregister socket");
            }
        }
        io.socket = None;
        io.output.retrieve_all();
        info!(
            bytes_received = io.stats.bytes_received,
            bytes_sent = io.stats.bytes_sent,
            "Connection destroyed"
        );
    }
}

// ============================================================================
// Public Operations
// ============================================================================

impl Connection {
    /// Sends `data`, buffering whatever the socket does not take right away.
    ///
    /// Dropped with a warning unless the connection is
    /// [`State::Connected`]. Off the loop thread the bytes are copied and the
    /// write happens later on the loop thread.
    pub fn send(&self, data: &[u8]) {
        if !self.accepting_sends(data.len()) {
            return;
        }
        if self.reactor.is_in_loop_thread() {
            self.send_in_loop(data);
        } else if let Some(this) = self.shared() {
            let data = data.to_vec();
            self.reactor
                .queue_in_loop(Box::new(move || this.send_in_loop(&data)));
        }
    }

    /// Sends the readable bytes of `buffer`, leaving it empty.
    ///
    /// Off the loop thread the storage is moved into the queued task rather
    /// than copied.
    pub fn send_buffer(&self, buffer: &mut Buffer) {
        if !self.accepting_sends(buffer.readable_bytes()) {
            return;
        }
        if self.reactor.is_in_loop_thread() {
            self.send_in_loop(buffer.peek());
            buffer.retrieve_all();
        } else if let Some(this) = self.shared() {
            let owned = std::mem::take(buffer);
            self.reactor
                .queue_in_loop(Box::new(move || this.send_in_loop(owned.peek())));
        }
    }

    /// Half-closes the connection once all buffered output is written.
    ///
    /// Later sends are dropped. Not meant to race with itself: only the
    /// first call has an effect.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn shutdown(&self) {
        if self
            .state
            .transition(&[State::Connected], State::Disconnecting)
            .is_ok()
        {
            debug!("Shutting down connection");
            if let Some(this) = self.shared() {
                self.reactor
                    .run_in_loop(Box::new(move || this.shutdown_in_loop()));
            }
        }
    }

    /// Closes the connection without waiting for buffered output, which is
    /// discarded.
    ///
    /// Always deferred to the next loop turn. Repeated calls are absorbed.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn force_close(&self) {
        if !matches!(self.state(), State::Connected | State::Disconnecting) {
            return;
        }
        let _ = self
            .state
            .transition(&[State::Connected], State::Disconnecting);
        self.lock_io().closing = true;
        if let Some(this) = self.shared() {
            self.reactor
                .queue_in_loop(Box::new(move || this.force_close_in_loop()));
        }
    }

    /// Like [`force_close`](Self::force_close), but after `delay`.
    ///
    /// The connection stops accepting sends immediately. If it is already
    /// closed or dropped when the delay elapses, nothing happens.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn force_close_with_delay(&self, delay: Duration) {
        if !matches!(self.state(), State::Connected | State::Disconnecting) {
            return;
        }
        let _ = self
            .state
            .transition(&[State::Connected], State::Disconnecting);
        let weak = self.weak_self.clone();
        self.reactor.run_after(
            delay,
            Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            }),
        );
    }

    pub fn start_read(&self) {
        if let Some(this) = self.shared() {
            self.reactor
                .run_in_loop(Box::new(move || this.start_read_in_loop()));
        }
    }

    pub fn stop_read(&self) {
        if let Some(this) = self.shared() {
            self.reactor
                .run_in_loop(Box::new(move || this.stop_read_in_loop()));
        }
    }
}

// ============================================================================
// Loop-Thread Operations
// ============================================================================

impl Connection {
    fn accepting_sends(&self, len: usize) -> bool {
        let state = self.state();
        if state == State::Connected {
            true
        } else {
            warn!(name = %self.name, %state, len, "Not connected, dropping send");
            false
        }
    }

    // Runs a send that was accepted while connected. A shutdown issued after
    // the send was accepted does not cancel it; the half-close waits for it.
    fn send_in_loop(&self, data: &[u8]) {
        self.reactor.assert_in_loop_thread();
        let state = self.state();
        if state == State::Disconnected {
            warn!(name = %self.name, len = data.len(), "Disconnected, giving up writing");
            return;
        }

        let mut outcome = WriteOutcome::default();
        {
            let mut guard = self.lock_io();
            let io = &mut *guard;
            if io.closing || io.half_closed {
                warn!(name = %self.name, %state, len = data.len(), "Connection closing, giving up writing");
                return;
            }
            let Some(socket) = io.socket.as_deref_mut() else {
                return;
            };

            let mut written = 0;
            if !io.registration.is_writing() && io.output.is_empty() {
                match write_some(socket, data) {
                    Ok(n) => {
                        trace!(name = %self.name, len = n, remaining = data.len() - n, "Wrote to socket");
                        written = n;
                        io.stats.bytes_sent += n as u64;
                        outcome.complete = n == data.len();
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => outcome.fault = Some(err),
                }
            }

            if outcome.fault.is_none() && written < data.len() {
                let old_len = io.output.readable_bytes();
                let new_len = old_len + (data.len() - written);
                if io.high_water_mark > 0
                    && old_len < io.high_water_mark
                    && new_len >= io.high_water_mark
                {
                    outcome.high_water = Some(new_len);
                }
                io.output.append(&data[written..]);
                debug!(name = %self.name, buffered = new_len, "Buffered unsent data");
                if !io.registration.is_writing() {
                    if let Err(err) = io.registration.enable_writing(&*self.reactor, socket) {
                        outcome.fault = Some(err);
                    }
                }
            }
        }

        self.finish_write(outcome);
    }

    fn shutdown_in_loop(&self) {
        self.reactor.assert_in_loop_thread();
        if self.state() != State::Disconnecting {
            return;
        }

        {
            let mut guard = self.lock_io();
            let io = &mut *guard;
            if io.registration.is_writing() {
                debug!(name = %self.name, pending = io.output.readable_bytes(), "Half-close deferred until output drains");
                return;
            }
            if self.kind == SocketKind::Stream {
                if io.half_closed {
                    return;
                }
                if let Some(socket) = io.socket.as_deref_mut() {
                    io.half_closed = true;
                    match socket.shutdown_write() {
                        Ok(()) => info!(name = %self.name, "Half-closed connection"),
                        Err(err) => warn!(name = %self.name, ?err, "Error shutting down connection"),
                    }
                }
                return;
            }
        }

        // A datagram socket has no write direction to close on its own.
        debug!(name = %self.name, "Datagram shutdown closes the connection");
        self.handle_close();
    }

    fn force_close_in_loop(&self) {
        self.reactor.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            info!(name = %self.name, "Force closing connection");
            self.handle_close();
        }
    }

    fn start_read_in_loop(&self) {
        self.reactor.assert_in_loop_thread();
        if self.disconnected() {
            return;
        }
        let mut guard = self.lock_io();
        let io = &mut *guard;
        if self.is_reading() && io.registration.is_reading() {
            return;
        }
        if let Some(socket) = io.socket.as_deref_mut() {
            if let Err(err) = io.registration.enable_reading(&*self.reactor, socket) {
                warn!(name = %self.name, ?err, "Failed to enable reading");
                return;
            }
            self.reading.store(true, Ordering::Relaxed);
            debug!(name = %self.name, "Reading started");
        }
    }

    fn stop_read_in_loop(&self) {
        self.reactor.assert_in_loop_thread();
        if self.disconnected() {
            return;
        }
        let mut guard = self.lock_io();
        let io = &mut *guard;
        if !self.is_reading() && !io.registration.is_reading() {
            return;
        }
        if let Some(socket) = io.socket.as_deref_mut() {
            if let Err(err) = io.registration.disable_reading(&*self.reactor, socket) {
                warn!(name = %self.name, ?err, "Failed to disable reading");
                return;
            }
            self.reading.store(false, Ordering::Relaxed);
            debug!(name = %self.name, "Reading stopped");
        }
    }
}

// ============================================================================
// Readiness Handlers
// ============================================================================

impl EventHandler for Connection {
    fn handle_event(&self, ready: Ready, receive_time: Instant) {
        trace!(name = %self.name, ?ready, "Handling readiness");
        if self.disconnected() {
            return;
        }
        if ready.read_closed && ready.write_closed && !ready.readable {
            self.handle_close();
            return;
        }
        if ready.error {
            self.handle_error();
            return;
        }
        if ready.readable || ready.read_closed {
            self.handle_read(receive_time);
        }
        if ready.writable && !self.disconnected() {
            self.handle_write();
        }
    }
}

impl Connection {
    fn handle_read(&self, receive_time: Instant) {
        let mut end_of_stream = false;
        let mut fault = None;
        let mut received = 0;

        // mio is edge-triggered: keep receiving until the socket would block.
        loop {
            if self.disconnected() {
                return;
            }
            match self.receive_once(receive_time) {
                ReadOutcome::Data(n) => {
                    received += n;
                    if self.kind == SocketKind::Datagram {
                        self.deliver_input(receive_time);
                        if !self.is_reading() {
                            break;
                        }
                    }
                }
                ReadOutcome::WouldBlock => break,
                ReadOutcome::EndOfStream => {
                    end_of_stream = true;
                    break;
                }
                ReadOutcome::Fault(err) => {
                    fault = Some(err);
                    break;
                }
            }
        }

        if self.kind == SocketKind::Stream && received > 0 {
            self.deliver_input(receive_time);
        }

        if let Some(err) = fault {
            self.handle_fault("receive", err);
        } else if end_of_stream && !self.disconnected() {
            info!(name = %self.name, peer_addr = %self.peer_addr, "Peer closed connection");
            self.handle_close();
        }
    }

    fn receive_once(&self, receive_time: Instant) -> ReadOutcome {
        let mut guard = self.lock_io();
        let io = &mut *guard;
        if !io.registration.is_reading() {
            return ReadOutcome::WouldBlock;
        }
        let Some(socket) = io.socket.as_deref_mut() else {
            return ReadOutcome::WouldBlock;
        };
        loop {
            match socket.recv(&mut io.input) {
                Ok(0) if self.kind == SocketKind::Stream => return ReadOutcome::EndOfStream,
                Ok(n) => {
                    trace!(name = %self.name, len = n, "Read from socket");
                    io.stats.bytes_received += n as u64;
                    io.stats.last_receive = Some(receive_time);
                    return ReadOutcome::Data(n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return ReadOutcome::Fault(err),
            }
        }
    }

    // Lends the input buffer to the message callback. Leftover bytes go back.
    fn deliver_input(&self, receive_time: Instant) {
        let Some(this) = self.shared() else {
            return;
        };
        let mut input = std::mem::replace(&mut self.lock_io().input, Buffer::with_capacity(0));
        debug!(name = %self.name, len = input.readable_bytes(), "Received data");
        let cb = self.lock_callbacks().message.clone();
        cb(&this, &mut input, receive_time);
        self.lock_io().input = input;
    }

    fn handle_write(&self) {
        let mut outcome = WriteOutcome::default();
        {
            let mut guard = self.lock_io();
            let io = &mut *guard;
            if !io.registration.is_writing() {
                trace!(name = %self.name, "Connection is down, no more writing");
                return;
            }
            if io.closing {
                trace!(name = %self.name, "Force close pending, not draining output");
                return;
            }
            let Some(socket) = io.socket.as_deref_mut() else {
                return;
            };

            while !io.output.is_empty() {
                match socket.send(io.output.peek()) {
                    Ok(0) => {
                        warn!(name = %self.name, remaining = io.output.readable_bytes(), "Write to socket returned 0");
                        break;
                    }
                    Ok(n) => {
                        io.output.retrieve(n);
                        io.stats.bytes_sent += n as u64;
                        trace!(name = %self.name, len = n, remaining = io.output.readable_bytes(), "Wrote to socket");
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        outcome.fault = Some(err);
                        break;
                    }
                }
            }

            if outcome.fault.is_none() && io.output.is_empty() {
                if let Err(err) = io.registration.disable_writing(&*self.reactor, socket) {
                    warn!(name = %self.name, ?err, "Failed to disable writing");
                }
                outcome.complete = true;
                outcome.shutdown = self.state() == State::Disconnecting;
            }
        }

        self.finish_write(outcome);
    }

    fn finish_write(&self, outcome: WriteOutcome) {
        if let Some(err) = outcome.fault {
            self.handle_fault("send", err);
            return;
        }
        if let Some(this) = self.shared() {
            if let Some(size) = outcome.high_water {
                debug!(name = %self.name, size, "Output crossed the high-water mark");
                let cb = self.lock_callbacks().high_water_mark.clone();
                if let Some(cb) = cb {
                    cb(&this, size);
                }
            }
            if outcome.complete {
                let cb = self.lock_callbacks().write_complete.clone();
                if let Some(cb) = cb {
                    cb(&this);
                }
            }
        }
        if outcome.shutdown {
            self.shutdown_in_loop();
        }
    }

    /// Close path: state goes to Disconnected, interest is dropped, pending
    /// output is discarded, then the connection and close callbacks run.
    fn handle_close(&self) {
        self.reactor.assert_in_loop_thread();
        if let Err(state) = self
            .state
            .transition(&[State::Connected, State::Disconnecting], State::Disconnected)
        {
            panic!("handle_close called in state {state}");
        }

        self.disable_all_interest();
        let discarded = {
            let mut io = self.lock_io();
            let discarded = io.output.readable_bytes();
            io.output.retrieve_all();
            discarded
        };
        info!(name = %self.name, peer_addr = %self.peer_addr, discarded, "Connection closed");

        let Some(this) = self.shared() else {
            return;
        };
        let (connection_cb, close_cb) = {
            let callbacks = self.lock_callbacks();
            (callbacks.connection.clone(), callbacks.close.clone())
        };
        connection_cb(&this);
        if let Some(close_cb) = close_cb {
            close_cb(&this);
        }
    }

    fn handle_error(&self) {
        let err = {
            let mut io = self.lock_io();
            match io.socket.as_deref_mut() {
                Some(socket) => socket.take_error(),
                None => Ok(None),
            }
        };
        match err {
            Ok(Some(err)) | Err(err) => self.handle_fault("poll", err),
            Ok(None) => {
                error!(name = %self.name, "Error readiness without a pending socket error");
                if matches!(self.state(), State::Connected | State::Disconnecting) {
                    self.handle_close();
                }
            }
        }
    }

    fn handle_fault(&self, op: &str, err: io::Error) {
        match err.kind() {
            ErrorKind::BrokenPipe => warn!(name = %self.name, op, "Broken pipe"),
            ErrorKind::ConnectionReset => warn!(name = %self.name, op, "Connection reset"),
            _ => error!(name = %self.name, op, ?err, "Socket error"),
        }
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl Connection {
    fn shared(&self) -> Option<ConnectionRef> {
        self.weak_self.upgrade()
    }

    fn disable_all_interest(&self) {
        let mut guard = self.lock_io();
        let io = &mut *guard;
        if io.registration.is_removed() {
            return;
        }
        if let Some(socket) = io.socket.as_deref_mut() {
            if let Err(err) = io.registration.disable_all(&*self.reactor, socket) {
                warn!(name = %self.name, ?err, "Failed to disable readiness");
            }
        }
    }

    fn lock_io(&self) -> MutexGuard<'_, Io> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_some(socket: &mut dyn Socket, data: &[u8]) -> io::Result<usize> {
    loop {
        match socket.send(data) {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}
