//! Shared test support: a deterministic reactor and a scripted socket.
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity:
//!
//! ```bash
//! TEST_LOG=1 cargo test -- --nocapture   # info
//! TEST_LOG=2 cargo test -- --nocapture   # debug
//! TEST_LOG=3 cargo test -- --nocapture   # trace
//! ```

#![allow(dead_code)]

use mio::event::Source;
use mio::{Interest, Registry, Token};
use rustconn::{Buffer, Connection, ConnectionRef, EventHandler, Reactor, Ready, Socket, SocketKind, Task};
use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("rustconn={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Manual Reactor
// ============================================================================

/// Reactor driven by hand. The loop thread is the thread that created it,
/// time is virtual, and nothing runs until the test asks for it.
pub struct ManualReactor {
    thread_id: ThreadId,
    tasks: Mutex<VecDeque<Task>>,
    timers: Mutex<Vec<(Duration, u64, Task)>>,
    now: Mutex<Duration>,
    timer_seq: AtomicUsize,
    next_token: AtomicUsize,
    handlers: Mutex<HashMap<Token, Weak<dyn EventHandler>>>,
    interests: Mutex<HashMap<Token, Interest>>,
}

impl ManualReactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            thread_id: thread::current().id(),
            tasks: Mutex::new(VecDeque::new()),
            timers: Mutex::new(Vec::new()),
            now: Mutex::new(Duration::ZERO),
            timer_seq: AtomicUsize::new(0),
            next_token: AtomicUsize::new(1),
            handlers: Mutex::new(HashMap::new()),
            interests: Mutex::new(HashMap::new()),
        })
    }

    /// Runs queued tasks, including those queued while running, until the
    /// queue is empty. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let task = self.tasks.lock().unwrap().pop_front();
            match task {
                Some(task) => {
                    task();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    /// Moves virtual time forward, firing due timers in deadline order and
    /// then draining the task queue.
    pub fn advance(&self, by: Duration) {
        let now = {
            let mut now = self.now.lock().unwrap();
            *now += by;
            *now
        };
        loop {
            let due = {
                let mut timers = self.timers.lock().unwrap();
                let next = timers
                    .iter()
                    .enumerate()
                    .filter(|(_, (deadline, _, _))| *deadline <= now)
                    .min_by_key(|(_, (deadline, seq, _))| (*deadline, *seq))
                    .map(|(index, _)| index);
                next.map(|index| timers.remove(index))
            };
            match due {
                Some((_, _, task)) => task(),
                None => break,
            }
        }
        self.run_pending();
    }

    /// Delivers `ready` to every attached handler.
    pub fn fire(&self, ready: Ready) {
        let handlers: Vec<_> = self.handlers.lock().unwrap().values().cloned().collect();
        for handler in handlers.iter().filter_map(Weak::upgrade) {
            handler.handle_event(ready, Instant::now());
        }
    }

    pub fn attached(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.interests.lock().unwrap().get(&token).copied()
    }

    /// Interest of the only registered token, if any.
    pub fn only_interest(&self) -> Option<Interest> {
        let interests = self.interests.lock().unwrap();
        assert!(interests.len() <= 1, "more than one registered token");
        interests.values().next().copied()
    }

    pub fn readable_armed(&self) -> bool {
        self.only_interest().is_some_and(|i| i.is_readable())
    }

    pub fn writable_armed(&self) -> bool {
        self.only_interest().is_some_and(|i| i.is_writable())
    }
}

impl Reactor for ManualReactor {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn queue_in_loop(&self, task: Task) {
        self.tasks.lock().unwrap().push_back(task);
    }

    fn run_after(&self, delay: Duration, task: Task) {
        let Some(deadline) = self.now.lock().unwrap().checked_add(delay) else {
            return;
        };
        let seq = self.timer_seq.fetch_add(1, Ordering::Relaxed) as u64;
        self.timers.lock().unwrap().push((deadline, seq, task));
    }

    fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn attach(&self, token: Token, handler: Weak<dyn EventHandler>) {
        self.handlers.lock().unwrap().insert(token, handler);
    }

    fn detach(&self, token: Token) {
        self.handlers.lock().unwrap().remove(&token);
    }

    fn register(&self, _socket: &mut dyn Socket, token: Token, interest: Interest) -> io::Result<()> {
        self.assert_in_loop_thread();
        let previous = self.interests.lock().unwrap().insert(token, interest);
        assert!(previous.is_none(), "token {token:?} registered twice");
        Ok(())
    }

    fn reregister(&self, _socket: &mut dyn Socket, token: Token, interest: Interest) -> io::Result<()> {
        self.assert_in_loop_thread();
        let previous = self.interests.lock().unwrap().insert(token, interest);
        assert!(previous.is_some(), "token {token:?} reregistered before register");
        Ok(())
    }

    fn deregister(&self, _socket: &mut dyn Socket, token: Token) -> io::Result<()> {
        self.assert_in_loop_thread();
        let previous = self.interests.lock().unwrap().remove(&token);
        assert!(previous.is_some(), "token {token:?} deregistered while not registered");
        Ok(())
    }
}

// ============================================================================
// Scripted Socket
// ============================================================================

#[derive(Debug)]
pub struct Script {
    pub kind: SocketKind,
    /// Bytes the socket accepts before reporting `WouldBlock`.
    pub write_capacity: usize,
    pub written: Vec<u8>,
    pub send_calls: usize,
    /// Receives in order; `Ok(vec![])` is end-of-stream on a stream socket.
    pub inbound: VecDeque<io::Result<Vec<u8>>>,
    pub shutdown_writes: usize,
    pub send_error: Option<ErrorKind>,
    pub pending_error: Option<ErrorKind>,
}

#[derive(Debug, Clone)]
pub struct ScriptHandle(Arc<Mutex<Script>>);

impl ScriptHandle {
    pub fn grant(&self, bytes: usize) {
        self.0.lock().unwrap().write_capacity += bytes;
    }

    pub fn written(&self) -> Vec<u8> {
        self.0.lock().unwrap().written.clone()
    }

    pub fn send_calls(&self) -> usize {
        self.0.lock().unwrap().send_calls
    }

    pub fn shutdown_writes(&self) -> usize {
        self.0.lock().unwrap().shutdown_writes
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.0.lock().unwrap().inbound.push_back(Ok(bytes.to_vec()));
    }

    pub fn push_end_of_stream(&self) {
        self.0.lock().unwrap().inbound.push_back(Ok(Vec::new()));
    }

    pub fn push_read_error(&self, kind: ErrorKind) {
        self.0.lock().unwrap().inbound.push_back(Err(kind.into()));
    }

    pub fn fail_sends(&self, kind: ErrorKind) {
        self.0.lock().unwrap().send_error = Some(kind);
    }

    pub fn set_pending_error(&self, kind: ErrorKind) {
        self.0.lock().unwrap().pending_error = Some(kind);
    }
}

pub struct ScriptedSocket(Arc<Mutex<Script>>);

impl ScriptedSocket {
    pub fn new(kind: SocketKind, write_capacity: usize) -> (Self, ScriptHandle) {
        let script = Arc::new(Mutex::new(Script {
            kind,
            write_capacity,
            written: Vec::new(),
            send_calls: 0,
            inbound: VecDeque::new(),
            shutdown_writes: 0,
            send_error: None,
            pending_error: None,
        }));
        (Self(script.clone()), ScriptHandle(script))
    }
}

impl Socket for ScriptedSocket {
    fn kind(&self) -> SocketKind {
        self.0.lock().unwrap().kind
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut script = self.0.lock().unwrap();
        script.send_calls += 1;
        if let Some(kind) = script.send_error {
            return Err(kind.into());
        }
        if script.write_capacity == 0 && !data.is_empty() {
            return Err(ErrorKind::WouldBlock.into());
        }
        let n = data.len().min(script.write_capacity);
        script.write_capacity -= n;
        script.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn recv(&mut self, buffer: &mut Buffer) -> io::Result<usize> {
        let next = self.0.lock().unwrap().inbound.pop_front();
        match next {
            Some(Ok(bytes)) => {
                buffer.append(&bytes);
                Ok(bytes.len())
            }
            Some(Err(err)) => Err(err),
            None => Err(ErrorKind::WouldBlock.into()),
        }
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().shutdown_writes += 1;
        Ok(())
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        Ok(self.0.lock().unwrap().pending_error.take().map(io::Error::from))
    }
}

impl Source for ScriptedSocket {
    fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _: &Registry) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn local() -> SocketAddr {
    "127.0.0.1:4000".parse().unwrap()
}

pub fn peer() -> SocketAddr {
    "127.0.0.1:5000".parse().unwrap()
}

/// Records every callback invocation in order.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| e.as_str() == event).count()
    }
}

/// A connection over a scripted socket with every callback recorded:
/// `up`/`down`, `message:<bytes>`, `write_complete`, `high_water:<size>`,
/// `close`.
pub fn recorded_connection(
    reactor: &Arc<ManualReactor>,
    kind: SocketKind,
    write_capacity: usize,
) -> (ConnectionRef, ScriptHandle, Recorder) {
    init_tracing();
    let (socket, script) = ScriptedSocket::new(kind, write_capacity);
    let conn = Connection::new(reactor.clone(), "test-conn", Box::new(socket), local(), peer());
    let recorder = Recorder::default();

    let r = recorder.clone();
    conn.set_connection_callback(move |conn| r.push(if conn.connected() { "up" } else { "down" }));
    let r = recorder.clone();
    conn.set_message_callback(move |_conn, buffer, _at| {
        let data = buffer.retrieve_all_as_vec();
        r.push(format!("message:{}", String::from_utf8_lossy(&data)));
    });
    let r = recorder.clone();
    conn.set_write_complete_callback(move |_conn| r.push("write_complete"));
    let r = recorder.clone();
    conn.set_close_callback(move |_conn| r.push("close"));

    (conn, script, recorder)
}

pub fn set_high_water_mark(conn: &ConnectionRef, recorder: &Recorder, mark: usize) {
    let r = recorder.clone();
    conn.set_high_water_mark_callback(move |_conn, size| r.push(format!("high_water:{size}")), mark);
}
