// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Sockets and name resolution
//!
//! Ports never touch the operating system directly.  Sockets are created through a
//! [`SocketFactory`] and host names are looked up through a [`Resolver`].  Two implementations
//! are provided:
//!
//! - [`VirtualNetwork`]: an in-process network where datagrams, streams and lookups are
//!   delivered when [`VirtualNetwork::process`] is called.
//! - [`StdNetwork`]: sockets from `std::net` and lookups through the system resolver.

use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use stun_proto::agent::Transmit;
use stun_proto::types::TransportType;

mod std_net;
mod virtual_net;

pub use std_net::StdNetwork;
pub use virtual_net::{VirtualListener, VirtualNetwork, VirtualSocket};

/// The connection state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// A stream socket that is still establishing its connection.
    Connecting,
    /// The socket can send and receive.
    Connected,
    /// The socket was closed, by either side, or failed to connect.
    Closed,
}

/// Options that can be applied to a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SocketOption {
    /// The size of the kernel send buffer.
    SendBufferSize(usize),
    /// The size of the kernel receive buffer.
    ReceiveBufferSize(usize),
    /// The IP time to live.
    Ttl(u32),
}

impl SocketOption {
    pub(crate) fn same_kind(&self, other: &SocketOption) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Errors produced by sockets and socket factories.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SocketError {
    /// A stream socket is not connected (yet).
    #[error("The socket is not connected")]
    NotConnected,
    /// The socket has been closed.
    #[error("The socket is closed")]
    Closed,
    /// The local address is already in use.
    #[error("The address {0} is already in use")]
    AddressInUse(SocketAddr),
    /// The local and remote addresses use different address families.
    #[error("The address family is not supported")]
    AddressFamilyMismatch,
    /// Too much data is waiting to be written to a stream.
    #[error("The send buffer is full")]
    BufferFull,
    /// The option cannot be applied to this socket.
    #[error("The socket option is not supported")]
    UnsupportedOption,
    /// Any other I/O error.
    #[error("I/O error: {0}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for SocketError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotConnected => Self::NotConnected,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::Closed,
            kind => Self::Io(kind),
        }
    }
}

/// Errors produced while resolving a host name.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResolveError {
    /// The host name is not known.
    #[error("Unknown host {0}")]
    NotFound(String),
    /// The host does not have an address of the requested family.
    #[error("No address of the local address family for {0}")]
    NoSuitableAddress(String),
    /// The lookup was abandoned before producing a result.
    #[error("The lookup was cancelled")]
    Cancelled,
    /// The system resolver failed.
    #[error("I/O error: {0}")]
    Io(std::io::ErrorKind),
}

/// A datagram or stream socket.
///
/// All methods take `&self` so that a socket can be shared between ports, see
/// [`SharedSocket`].  The socket is closed when it is dropped.
pub trait PacketSocket: std::fmt::Debug {
    /// The transport of the socket.
    fn transport(&self) -> TransportType;
    /// The local address.
    fn local_addr(&self) -> SocketAddr;
    /// The connected remote address of a stream socket.
    fn remote_addr(&self) -> Option<SocketAddr>;
    /// The current state.
    fn state(&self) -> SocketState;
    /// Send `data` to `to`.  For stream sockets `to` must be the remote address.
    fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<(), SocketError>;
    /// Receive the next datagram or chunk of stream data without blocking.
    fn recv(&self) -> Option<Transmit<Vec<u8>>>;
    /// Apply an option.
    fn set_option(&self, option: SocketOption) -> Result<(), SocketError>;
}

/// Creates sockets for ports.
pub trait SocketFactory: std::fmt::Debug {
    /// Bind a UDP socket to an ephemeral port of `ip`.
    fn create_udp_socket(&self, ip: IpAddr) -> Result<Box<dyn PacketSocket>, SocketError>;
    /// Start connecting a TCP socket from `local_ip` to `remote`.  The returned socket is
    /// [`SocketState::Connecting`] until the connection completes.
    fn create_client_tcp_socket(
        &self,
        local_ip: IpAddr,
        remote: SocketAddr,
    ) -> Result<Box<dyn PacketSocket>, SocketError>;
}

/// An outstanding host name lookup.  Dropping the handle cancels the lookup.
pub trait PendingResolve: std::fmt::Debug {
    /// The result of the lookup once available.
    fn poll(&mut self) -> Option<Result<Vec<IpAddr>, ResolveError>>;
}

/// Looks up host names.
pub trait Resolver: std::fmt::Debug {
    /// Start resolving `host`.
    fn resolve(&self, host: &str) -> Box<dyn PendingResolve>;
}

/// Everything a port needs from its environment.
pub trait Network: SocketFactory + Resolver {}

impl<T: SocketFactory + Resolver> Network for T {}

/// A socket owned by the caller and used by one or more ports.
///
/// Ports never read from a shared socket: the owner receives and hands each packet to the ports
/// through [`Port::handle_incoming_packet`](crate::port::Port::handle_incoming_packet).  The
/// socket is closed when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct SharedSocket(Rc<dyn PacketSocket>);

impl SharedSocket {
    /// Share `socket`.
    pub fn new(socket: Box<dyn PacketSocket>) -> Self {
        Self(Rc::from(socket))
    }

    /// The shared socket.
    pub fn socket(&self) -> &dyn PacketSocket {
        self.0.as_ref()
    }
}

// The socket a port sends with.
#[derive(Debug)]
pub(crate) enum PortSocket {
    Owned(Box<dyn PacketSocket>),
    Shared(SharedSocket),
}

impl PortSocket {
    pub(crate) fn get(&self) -> &dyn PacketSocket {
        match self {
            Self::Owned(socket) => socket.as_ref(),
            Self::Shared(shared) => shared.socket(),
        }
    }

    pub(crate) fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    // Only owned sockets are read by the port itself.
    pub(crate) fn recv(&self) -> Option<Transmit<Vec<u8>>> {
        match self {
            Self::Owned(socket) => socket.recv(),
            Self::Shared(_) => None,
        }
    }
}

// Remember `option`, replacing any earlier value of the same kind.
pub(crate) fn cache_option(options: &mut Vec<SocketOption>, option: SocketOption) {
    options.retain(|existing| !existing.same_kind(&option));
    options.push(option);
}
