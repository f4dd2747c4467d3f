use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a connection. States only ever move forward, in
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Connecting => "Connecting",
            State::Connected => "Connected",
            State::Disconnecting => "Disconnecting",
            State::Disconnected => "Disconnected",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free state cell.
#[derive(Debug)]
pub(super) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(super) fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(super) fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `to` if the current state is one of `from` and lies before
    /// `to`. Returns the previous state, or the current one on refusal.
    pub(super) fn transition(&self, from: &[State], to: State) -> Result<State, State> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = State::from_u8(current);
                (from.contains(&current) && current < to).then_some(to as u8)
            })
            .map(State::from_u8)
            .map_err(State::from_u8)
    }
}
