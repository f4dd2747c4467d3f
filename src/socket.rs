//! Socket handles owned by a connection.
//!
//! A [`Socket`] is the only thing a [`Connection`](crate::Connection) knows
//! about the operating system: non-blocking send and receive, a write-side
//! half-close and pending-error retrieval. Dropping the handle closes the
//! descriptor.

use crate::buffer::Buffer;
use crate::config::{ConnectionConfig, DEFAULT_RECEIVE_SCRATCH_SIZE};
use crate::error::Error;

use mio::event::Source;
use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use tracing::debug;

const MAX_UDP_PAYLOAD_V4: usize = 65507;
const MAX_UDP_PAYLOAD_V6: usize = 65527;

/// Transport semantics of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Connection-oriented byte stream. A zero-length read is end-of-stream
    /// and the write direction can be half-closed.
    Stream,
    /// Datagram socket connected to one fixed peer. A zero-length read is an
    /// empty datagram and there is no half-close.
    Datagram,
}

/// Non-blocking socket owned exclusively by one connection.
pub trait Socket: Source + Send {
    fn kind(&self) -> SocketKind;

    /// Writes as much of `data` as the socket accepts right now.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Performs one receive, appending to `buffer`.
    fn recv(&mut self, buffer: &mut Buffer) -> io::Result<usize>;

    /// Stops the send direction. Datagram sockets report success without
    /// doing anything.
    fn shutdown_write(&mut self) -> io::Result<()>;

    /// Takes the pending socket-level error, if any.
    fn take_error(&mut self) -> io::Result<Option<io::Error>>;
}

// ============================================================================
// Stream sockets
// ============================================================================

/// TCP stream socket.
#[derive(Debug)]
pub struct StreamSocket {
    stream: TcpStream,
    scratch: Vec<u8>,
}

impl StreamSocket {
    /// Wraps an already connected, non-blocking stream.
    pub fn new(stream: TcpStream) -> Self {
        Self::with_scratch_size(stream, DEFAULT_RECEIVE_SCRATCH_SIZE)
    }

    pub fn with_scratch_size(stream: TcpStream, scratch_size: usize) -> Self {
        Self {
            stream,
            scratch: vec![0; scratch_size],
        }
    }

    /// Wraps a stream that came from a blocking `std` listener or connect.
    pub fn from_std(stream: std::net::TcpStream) -> Result<Self, Error> {
        Self::from_std_with_config(stream, &ConnectionConfig::default())
    }

    /// Like [`from_std`](Self::from_std), sizing the receive scratch area
    /// from `config`.
    pub fn from_std_with_config(
        stream: std::net::TcpStream,
        config: &ConnectionConfig,
    ) -> Result<Self, Error> {
        stream.set_nonblocking(true)?;
        Ok(Self::with_scratch_size(
            TcpStream::from_std(stream),
            config.receive_scratch_size,
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }
}

impl Socket for StreamSocket {
    fn kind(&self) -> SocketKind {
        SocketKind::Stream
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    fn recv(&mut self, buffer: &mut Buffer) -> io::Result<usize> {
        buffer.read_from(&mut self.stream, &mut self.scratch)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Write)
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }
}

impl Source for StreamSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

// ============================================================================
// Datagram sockets
// ============================================================================

/// UDP socket connected to a single peer.
///
/// Connecting lets the operating system drop datagrams from any other
/// source and gives write readiness a meaning, which the connection's flow
/// control relies on.
#[derive(Debug)]
pub struct DatagramSocket {
    socket: UdpSocket,
    scratch: Vec<u8>,
    max_payload: usize,
}

impl DatagramSocket {
    /// Binds to `local` and connects to `peer`.
    pub fn connect<A: ToSocketAddrs, B: ToSocketAddrs>(local: A, peer: B) -> Result<Self, Error> {
        Self::connect_with_config(local, peer, &ConnectionConfig::default())
    }

    /// Like [`connect`](Self::connect), sizing the socket from `config`.
    pub fn connect_with_config<A: ToSocketAddrs, B: ToSocketAddrs>(
        local: A,
        peer: B,
        config: &ConnectionConfig,
    ) -> Result<Self, Error> {
        let local = local
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let peer = peer.to_socket_addrs()?.next().ok_or(Error::InvalidAddress)?;
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        debug!(local_addr = %socket.local_addr()?, %peer, "Connected datagram socket");
        Self::with_config(socket, config)
    }

    /// Wraps an already connected, non-blocking socket.
    ///
    /// Outgoing datagrams carry at most `config.max_datagram_size` bytes,
    /// never more than UDP allows for the peer's address family.
    pub fn with_config(socket: UdpSocket, config: &ConnectionConfig) -> Result<Self, Error> {
        let limit = if socket.peer_addr()?.is_ipv4() {
            MAX_UDP_PAYLOAD_V4
        } else {
            MAX_UDP_PAYLOAD_V6
        };
        Ok(Self {
            socket,
            scratch: vec![0; config.receive_scratch_size],
            max_payload: config.max_datagram_size.clamp(1, limit),
        })
    }

    /// Largest payload one `send` puts in a datagram.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

impl Socket for DatagramSocket {
    fn kind(&self) -> SocketKind {
        SocketKind::Datagram
    }

    // Buffered output goes out in datagrams of at most `max_payload` bytes.
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let len = data.len().min(self.max_payload);
        self.socket.send(&data[..len])
    }

    fn recv(&mut self, buffer: &mut Buffer) -> io::Result<usize> {
        let n = self.socket.recv(&mut self.scratch)?;
        buffer.append(&self.scratch[..n]);
        Ok(n)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        self.socket.take_error()
    }
}

impl Source for DatagramSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.socket.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.socket.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.socket.deregister(registry)
    }
}
