// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Port module
//!
//! The API shared by [`UdpPort`](crate::udp::UdpPort) and [`TurnPort`](crate::turn::TurnPort).

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use stun_proto::agent::{StunError, Transmit};
use stun_proto::types::message::StunWriteError;

use crate::candidate::{Candidate, CandidateOrigin, IceCredentials, ProtocolType};
use crate::connection::{Connection, ConnectionId};
use crate::net::{ResolveError, SocketError, SocketOption};

/// Receives the signals of a port.
///
/// Every method has an empty default implementation.
pub trait PortObserver: std::fmt::Debug {
    /// The port produced its candidates.  Called at most once.
    fn on_port_complete(&mut self, _candidates: &[Candidate]) {}

    /// The port failed and will not make further progress.  Called at most once.
    fn on_port_error(&mut self, _error: &PortError) {}

    /// A valid ping arrived from `remote` for which no connection exists.
    fn on_unknown_address(
        &mut self,
        _remote: SocketAddr,
        _protocol: ProtocolType,
        _remote_ufrag: &str,
    ) {
    }

    /// The outcome of installing a permission for `peer`.  `code` is 0 on success, otherwise the
    /// STUN error code returned by the server, or 408 when the server never answered.
    fn on_create_permission_result(&mut self, _peer: IpAddr, _code: u16) {}

    /// Application data arrived on `connection`.
    fn on_read_packet(&mut self, _connection: ConnectionId, _data: &[u8]) {}
}

/// An observer that ignores every signal.
impl PortObserver for () {}

/// Terminal failures of a port.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PortError {
    /// The port was configured with something it cannot do.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// The server address could not be resolved.
    #[error("Failed to resolve the server address: {0}")]
    Resolve(#[from] ResolveError),
    /// No connection could be made to the server.
    #[error("Failed to connect to {0}")]
    Connect(SocketAddr),
    /// The server rejected the credentials.
    #[error("Authentication with the server failed")]
    Authentication,
    /// The server sent something unexpected or refused the allocation.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// An existing allocation could not be refreshed or expired.
    #[error("The allocation was lost")]
    AllocationLost,
    /// The socket failed.
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),
}

/// Errors produced when sending data over a connection.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SendError {
    /// The connection does not exist.
    #[error("The connection does not exist")]
    UnknownConnection,
    /// The port has not finished preparing or has failed.
    #[error("The port is not ready")]
    NotReady,
    /// The data cannot be carried in a single packet.
    #[error("The data is too large")]
    TooLarge,
    /// The socket failed.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// A STUN message could not be written.
    #[error(transparent)]
    Stun(#[from] StunError),
    /// An attribute could not be added to a STUN message.
    #[error(transparent)]
    StunWrite(#[from] StunWriteError),
}

/// Errors produced when pinging over a connection.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PingError {
    /// The connection does not exist.
    #[error("The connection does not exist")]
    UnknownConnection,
    /// The port has not finished preparing or has failed.
    #[error("The port is not ready")]
    NotReady,
    /// The socket failed.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// A STUN message could not be written.
    #[error(transparent)]
    Stun(#[from] StunError),
    /// An attribute could not be added to a STUN message.
    #[error(transparent)]
    StunWrite(#[from] StunWriteError),
}

impl From<SendError> for PingError {
    fn from(value: SendError) -> Self {
        match value {
            SendError::UnknownConnection => Self::UnknownConnection,
            SendError::Socket(e) => Self::Socket(e),
            SendError::Stun(e) => Self::Stun(e),
            SendError::StunWrite(e) => Self::StunWrite(e),
            SendError::NotReady | SendError::TooLarge => Self::NotReady,
        }
    }
}

/// Errors produced when requesting a permission.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CreatePermissionError {
    /// The permission already exists or is being created.
    #[error("The permission already exists")]
    AlreadyExists,
    /// There is no allocation that could hold the permission.
    #[error("There is no allocation for this permission")]
    NoAllocation,
}

/// Return value of [`Port::handle_incoming_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRecv {
    /// The packet was consumed by the port.
    Handled,
    /// The packet is not for this port.
    Ignored,
}

/// A local transport address that connections to remote candidates are made from.
///
/// Ports are driven by the caller: [`process`](Port::process) must be called at the returned
/// time or whenever the network may have made progress.
pub trait Port: std::fmt::Debug {
    /// The protocol candidates of this port use.
    fn protocol(&self) -> ProtocolType;

    /// The local socket address once a socket exists.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// The ICE credentials put into this port's candidates.
    fn ice_credentials(&self) -> &IceCredentials;

    /// Start producing candidates.  The result is reported through
    /// [`PortObserver::on_port_complete`] or [`PortObserver::on_port_error`].
    fn prepare_address(&mut self, now: Instant);

    /// The candidates produced so far.
    fn candidates(&self) -> &[Candidate];

    /// Create a connection to `remote`.  Returns `None` if `remote` cannot be reached from this
    /// port.  An existing connection to the same address is returned as is.
    fn create_connection(
        &mut self,
        remote: &Candidate,
        origin: CandidateOrigin,
        now: Instant,
    ) -> Option<ConnectionId>;

    /// A connection by identifier.
    fn connection(&self, id: ConnectionId) -> Option<&Connection>;

    /// The connection to `remote`, if any.
    fn connection_to(&self, remote: SocketAddr) -> Option<ConnectionId>;

    /// Remove a connection.  Returns whether it existed.
    fn destroy_connection(&mut self, id: ConnectionId) -> bool;

    /// Send a connectivity check over a connection.
    fn ping(&mut self, id: ConnectionId, now: Instant) -> Result<(), PingError>;

    /// Send application data over a connection.
    fn send(&mut self, id: ConnectionId, data: &[u8], now: Instant) -> Result<(), SendError>;

    /// Provide a packet received on this port's socket.
    fn handle_incoming_packet(&mut self, transmit: Transmit<&[u8]>, now: Instant) -> PacketRecv;

    /// Make progress: read the owned socket, run timers and send what is due.  Returns when
    /// this should be called again.
    fn process(&mut self, now: Instant) -> Instant;

    /// Apply a socket option now and to any socket created later.
    fn set_option(&mut self, option: SocketOption) -> Result<(), SocketError>;
}
