//! Event registration of one socket with its reactor.
//!
//! mio has no empty interest set, so a registration with neither reading nor
//! writing enabled is taken out of the poller while its token stays
//! attached. Removing the registration detaches the token for good.

use super::Reactor;
use crate::socket::Socket;

use mio::{Interest, Token};
use std::io;
use tracing::trace;

#[derive(Debug)]
pub(crate) struct Registration {
    token: Token,
    reading: bool,
    writing: bool,
    in_poller: bool,
    removed: bool,
}

impl Registration {
    pub(crate) fn new(token: Token) -> Self {
        Self {
            token,
            reading: false,
            writing: false,
            in_poller: false,
            removed: false,
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.reading
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.writing
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed
    }

    pub(crate) fn enable_reading(
        &mut self,
        reactor: &dyn Reactor,
        socket: &mut dyn Socket,
    ) -> io::Result<()> {
        self.reading = true;
        self.update(reactor, socket)
    }

    pub(crate) fn disable_reading(
        &mut self,
        reactor: &dyn Reactor,
        socket: &mut dyn Socket,
    ) -> io::Result<()> {
        self.reading = false;
        self.update(reactor, socket)
    }

    pub(crate) fn enable_writing(
        &mut self,
        reactor: &dyn Reactor,
        socket: &mut dyn Socket,
    ) -> io::Result<()> {
        self.writing = true;
        self.update(reactor, socket)
    }

    pub(crate) fn disable_writing(
        &mut self,
        reactor: &dyn Reactor,
        socket: &mut dyn Socket,
    ) -> io::Result<()> {
        self.writing = false;
        self.update(reactor, socket)
    }

    pub(crate) fn disable_all(
        &mut self,
        reactor: &dyn Reactor,
        socket: &mut dyn Socket,
    ) -> io::Result<()> {
        self.reading = false;
        self.writing = false;
        self.update(reactor, socket)
    }

    /// Takes the socket out of the poller and detaches the token.
    ///
    /// # Panics
    ///
    /// Panics if the registration was already removed.
    pub(crate) fn remove(
        &mut self,
        reactor: &dyn Reactor,
        socket: &mut dyn Socket,
    ) -> io::Result<()> {
        assert!(!self.removed, "Registration {:?} removed twice", self.token);
        self.removed = true;
        self.reading = false;
        self.writing = false;
        reactor.detach(self.token);
        if self.in_poller {
            self.in_poller = false;
            reactor.deregister(socket, self.token)?;
        }
        Ok(())
    }

    fn interest(&self) -> Option<Interest> {
        match (self.reading, self.writing) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn update(&mut self, reactor: &dyn Reactor, socket: &mut dyn Socket) -> io::Result<()> {
        assert!(
            !self.removed,
            "Registration {:?} updated after removal",
            self.token
        );
        trace!(token = self.token.0, reading = self.reading, writing = self.writing, "Updating registration");
        match (self.interest(), self.in_poller) {
            (Some(interest), false) => {
                reactor.register(socket, self.token, interest)?;
                self.in_poller = true;
            }
            (Some(interest), true) => reactor.reregister(socket, self.token, interest)?,
            (None, true) => {
                self.in_poller = false;
                reactor.deregister(socket, self.token)?;
            }
            (None, false) => {}
        }
        Ok(())
    }
}
