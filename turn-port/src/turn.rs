// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # TURN port
//!
//! A [`TurnPort`] obtains a relayed transport address from a TURN server and makes connections to
//! remote candidates through it.  The connection to the server is made over UDP or TCP, the
//! relayed address is always UDP.
//!
//! ```
//! # use std::time::Instant;
//! # use turn_port::candidate::{ProtocolAddress, RelayCredentials};
//! # use turn_port::net::VirtualNetwork;
//! # use turn_port::port::Port;
//! # use turn_port::turn::{TurnPort, TurnPortState};
//! let network = VirtualNetwork::default();
//! let server: ProtocolAddress = "udp://turn.example.com:3478".parse().unwrap();
//! let mut port = TurnPort::builder(
//!     network.clone(),
//!     "192.168.1.10".parse().unwrap(),
//!     server,
//!     RelayCredentials::new("user", "pass"),
//! )
//! .build();
//! let now = Instant::now();
//! port.prepare_address(now);
//! assert_eq!(port.state(), TurnPortState::Resolving);
//! // nothing is known about turn.example.com
//! network.process();
//! port.process(now);
//! assert_eq!(port.state(), TurnPortState::Failed);
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use stun_proto::agent::Transmit;
use stun_proto::types::TransportType;

use relay_types::framing::StreamFramer;

use tracing::{debug, info, trace, warn};

use crate::candidate::{
    Candidate, CandidateOrigin, IceCredentials, ProtocolAddress, ProtocolType, RelayCredentials,
    ServerAddress,
};
use crate::config::TurnPortConfig;
use crate::connection::{Connection, ConnectionId, ConnectionSet};
use crate::net::{
    cache_option, Network, PendingResolve, PortSocket, ResolveError, SharedSocket, SocketError,
    SocketOption, SocketState,
};
use crate::port::{
    CreatePermissionError, PacketRecv, PingError, Port, PortError, PortObserver, SendError,
};
use crate::protocol::{RelayEvent, RelayProtocol, RelayRecv};

// How often to check on an outstanding lookup or connect.
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(50);
const IDLE_INTERVAL: Duration = Duration::from_secs(3600);

/// The lifecycle of a [`TurnPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPortState {
    /// [`prepare_address`](Port::prepare_address) was not called yet.
    New,
    /// The server host name is being resolved.
    Resolving,
    /// The TCP connection to the server is being established.
    Connecting,
    /// The allocation is being requested.
    Allocating,
    /// The relay candidate exists.
    Ready,
    /// The allocation was released with [`TurnPort::close`].
    Closed,
    /// The port failed.
    Failed,
}

/// Builder for a [`TurnPort`].
#[derive(Debug)]
pub struct TurnPortBuilder {
    network: Box<dyn Network>,
    local_ip: IpAddr,
    server: ProtocolAddress,
    credentials: RelayCredentials,
    config: TurnPortConfig,
    observer: Box<dyn PortObserver>,
    shared_socket: Option<SharedSocket>,
    ice: Option<IceCredentials>,
}

impl TurnPortBuilder {
    /// Tunables of the port.
    pub fn config(mut self, config: TurnPortConfig) -> Self {
        self.config = config;
        self
    }

    /// Where the port reports to.
    pub fn observer(mut self, observer: Box<dyn PortObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use a UDP socket owned by the caller instead of creating one.
    pub fn shared_socket(mut self, socket: SharedSocket) -> Self {
        self.shared_socket = Some(socket);
        self
    }

    /// The ICE credentials for the relay candidate.  Random credentials are generated otherwise.
    pub fn ice_credentials(mut self, ice: IceCredentials) -> Self {
        self.ice = Some(ice);
        self
    }

    /// Construct the [`TurnPort`].  No I/O is performed.
    pub fn build(self) -> TurnPort {
        TurnPort {
            network: self.network,
            local_ip: self.local_ip,
            server: self.server,
            credentials: self.credentials,
            config: self.config,
            observer: self.observer,
            ice: self.ice.unwrap_or_else(IceCredentials::generate),
            state: TurnPortState::New,
            shared_socket: self.shared_socket,
            socket: None,
            resolve: None,
            server_addr: None,
            protocol: None,
            framer: StreamFramer::new(),
            candidates: vec![],
            connections: ConnectionSet::default(),
            options: vec![],
        }
    }
}

/// A port relaying through a TURN server.
#[derive(Debug)]
pub struct TurnPort {
    network: Box<dyn Network>,
    local_ip: IpAddr,
    server: ProtocolAddress,
    credentials: RelayCredentials,
    config: TurnPortConfig,
    observer: Box<dyn PortObserver>,
    ice: IceCredentials,
    state: TurnPortState,
    shared_socket: Option<SharedSocket>,
    socket: Option<PortSocket>,
    resolve: Option<Box<dyn PendingResolve>>,
    server_addr: Option<SocketAddr>,
    protocol: Option<RelayProtocol>,
    framer: StreamFramer,
    candidates: Vec<Candidate>,
    connections: ConnectionSet,
    options: Vec<SocketOption>,
}

fn same_family(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

impl TurnPort {
    /// Start building a [`TurnPort`] from `local_ip` to `server`.
    pub fn builder(
        network: impl Network + 'static,
        local_ip: IpAddr,
        server: ProtocolAddress,
        credentials: RelayCredentials,
    ) -> TurnPortBuilder {
        TurnPortBuilder {
            network: Box::new(network),
            local_ip,
            server,
            credentials,
            config: TurnPortConfig::default(),
            observer: Box::new(()),
            shared_socket: None,
            ice: None,
        }
    }

    /// The current state.
    pub fn state(&self) -> TurnPortState {
        self.state
    }

    /// The configured server.
    pub fn server(&self) -> &ProtocolAddress {
        &self.server
    }

    /// The resolved server address.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// The relayed address of the allocation.
    pub fn relayed_addr(&self) -> Option<SocketAddr> {
        self.protocol
            .as_ref()
            .and_then(|protocol| protocol.relayed_address())
    }

    /// Whether a permission for `peer` is installed on the server.
    pub fn has_permission(&self, peer: IpAddr) -> bool {
        self.protocol
            .as_ref()
            .is_some_and(|protocol| protocol.has_permission(peer))
    }

    /// Whether a channel to `peer` is bound.
    pub fn has_channel(&self, peer: SocketAddr) -> bool {
        self.protocol
            .as_ref()
            .is_some_and(|protocol| protocol.has_channel(peer))
    }

    /// Install a permission for `peer` without creating a connection.  The result is reported
    /// through [`PortObserver::on_create_permission_result`].
    pub fn create_permission(
        &mut self,
        peer: IpAddr,
        now: Instant,
    ) -> Result<(), CreatePermissionError> {
        if self.state != TurnPortState::Ready {
            return Err(CreatePermissionError::NoAllocation);
        }
        let protocol = self
            .protocol
            .as_mut()
            .ok_or(CreatePermissionError::NoAllocation)?;
        protocol.create_permission(peer, now)?;
        self.drain(now);
        Ok(())
    }

    /// Release the allocation on the server.  The port can not be used afterwards.
    #[tracing::instrument(name = "turn_port_close", skip(self, now), fields(server = %self.server))]
    pub fn close(&mut self, now: Instant) {
        if matches!(self.state, TurnPortState::Closed | TurnPortState::Failed) {
            return;
        }
        info!("closing");
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.deallocate(now);
        }
        self.flush_transmits(now);
        self.resolve = None;
        self.state = TurnPortState::Closed;
    }

    fn fail(&mut self, error: PortError) {
        if matches!(self.state, TurnPortState::Failed | TurnPortState::Closed) {
            return;
        }
        warn!("port failed: {error}");
        self.state = TurnPortState::Failed;
        self.resolve = None;
        if self.socket.as_ref().is_some_and(PortSocket::is_owned) {
            self.socket = None;
        }
        self.observer.on_port_error(&error);
    }

    fn connect(&mut self, server: SocketAddr, now: Instant) {
        if !same_family(self.local_ip, server.ip()) {
            self.fail(PortError::Configuration(format!(
                "local address {} and server {server} are of different address families",
                self.local_ip
            )));
            return;
        }
        self.server_addr = Some(server);
        let socket = match (self.server.protocol(), self.shared_socket.take()) {
            (ProtocolType::Udp, Some(shared)) => {
                if shared.socket().transport() != TransportType::Udp {
                    self.fail(PortError::Configuration(
                        "the shared socket must be a UDP socket".to_owned(),
                    ));
                    return;
                }
                Ok(PortSocket::Shared(shared))
            }
            (ProtocolType::Udp, None) => self
                .network
                .create_udp_socket(self.local_ip)
                .map(PortSocket::Owned),
            (ProtocolType::Tcp, None) => self
                .network
                .create_client_tcp_socket(self.local_ip, server)
                .map(PortSocket::Owned),
            (ProtocolType::Tcp, Some(_)) => {
                self.fail(PortError::Configuration(
                    "a shared socket can only be used with UDP".to_owned(),
                ));
                return;
            }
            (ProtocolType::SslTcp, _) => {
                self.fail(PortError::Configuration(
                    "TLS connections are not supported".to_owned(),
                ));
                return;
            }
        };
        let socket = match socket {
            Ok(socket) => socket,
            Err(e) => {
                self.fail(e.into());
                return;
            }
        };
        if socket.is_owned() {
            for option in self.options.iter() {
                if let Err(e) = socket.get().set_option(*option) {
                    debug!("failed to apply {option:?}: {e}");
                }
            }
        }
        debug!("using socket {}", socket.get().local_addr());
        let connected = socket.get().state() == SocketState::Connected;
        self.socket = Some(socket);
        if connected {
            self.start_allocation(now);
        } else {
            self.state = TurnPortState::Connecting;
        }
    }

    fn start_allocation(&mut self, now: Instant) {
        let (Some(socket), Some(server)) = (self.socket.as_ref(), self.server_addr) else {
            return;
        };
        let socket = socket.get();
        let mut protocol = RelayProtocol::new(
            socket.transport(),
            socket.local_addr(),
            server,
            self.credentials.clone(),
            self.config,
        );
        if let Err(e) = protocol.start(now) {
            self.fail(PortError::Protocol(format!("failed to write allocate: {e}")));
            return;
        }
        self.protocol = Some(protocol);
        self.state = TurnPortState::Allocating;
        self.flush_transmits(now);
    }

    fn poll_resolve(&mut self, now: Instant) {
        let Some(result) = self.resolve.as_mut().and_then(|resolve| resolve.poll()) else {
            return;
        };
        self.resolve = None;
        let ServerAddress::Unresolved { host, port } = self.server.address().clone() else {
            return;
        };
        match result {
            Ok(addresses) => {
                let Some(ip) = addresses
                    .iter()
                    .copied()
                    .find(|ip| same_family(*ip, self.local_ip))
                else {
                    self.fail(PortError::Resolve(ResolveError::NoSuitableAddress(host)));
                    return;
                };
                info!("resolved {host} to {ip}");
                self.connect(SocketAddr::new(ip, port), now);
            }
            Err(e) => self.fail(e.into()),
        }
    }

    fn check_socket(&mut self, now: Instant) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        match (self.state, socket.get().state()) {
            (TurnPortState::Connecting, SocketState::Connected) => {
                info!("connected to {}", self.server);
                self.start_allocation(now);
            }
            (TurnPortState::Connecting, SocketState::Closed) => {
                let server = self.server_addr.unwrap_or(socket.get().local_addr());
                self.fail(PortError::Connect(server));
            }
            (TurnPortState::Allocating, SocketState::Closed) => {
                let server = self.server_addr.unwrap_or(socket.get().local_addr());
                self.fail(PortError::Connect(server));
            }
            (TurnPortState::Ready, SocketState::Closed) => self.fail(PortError::AllocationLost),
            _ => (),
        }
    }

    fn handle_events(&mut self, now: Instant) {
        while let Some(event) = self.protocol.as_mut().and_then(RelayProtocol::poll_event) {
            match event {
                RelayEvent::Allocated { relayed, mapped } => {
                    let candidate = Candidate::relay(relayed, mapped, &self.server, &self.ice);
                    info!("relay candidate {candidate}");
                    self.candidates.push(candidate);
                    self.state = TurnPortState::Ready;
                    self.observer.on_port_complete(&self.candidates);
                }
                RelayEvent::Failed(error) => self.fail(error),
                RelayEvent::PermissionCreated(peer) => {
                    self.observer.on_create_permission_result(peer, 0);
                    let remotes = self
                        .connections
                        .iter()
                        .map(|connection| connection.remote_candidate().address)
                        .filter(|remote| remote.ip() == peer)
                        .collect::<Vec<_>>();
                    if let Some(protocol) = self.protocol.as_mut() {
                        for remote in remotes {
                            protocol.bind_channel(remote, now);
                        }
                    }
                }
                RelayEvent::PermissionFailed(peer, code) => {
                    self.observer.on_create_permission_result(peer, code);
                }
            }
        }
    }

    fn flush_transmits(&mut self, now: Instant) {
        let (Some(protocol), Some(socket)) = (self.protocol.as_mut(), self.socket.as_ref()) else {
            return;
        };
        let mut error = None;
        while let Some(data) = protocol.poll_transmit(now) {
            trace!("sending {} bytes to {}", data.len(), protocol.server());
            match socket.get().send_to(&data, protocol.server()) {
                Ok(()) => (),
                Err(e @ (SocketError::Closed | SocketError::NotConnected)) => {
                    error = Some(e);
                    break;
                }
                Err(e) => warn!("failed to send to {}: {e}", protocol.server()),
            }
        }
        if let Some(e) = error {
            self.fail(e.into());
        }
    }

    fn drain(&mut self, now: Instant) {
        self.handle_events(now);
        self.flush_transmits(now);
    }

    fn handle_server_data(&mut self, data: &[u8], now: Instant) {
        let Self {
            protocol,
            connections,
            observer,
            ice,
            ..
        } = self;
        let Some(protocol) = protocol.as_mut() else {
            return;
        };
        match protocol.handle_message(data, now) {
            RelayRecv::PeerData { peer, range } => {
                if let Some(response) = connections.handle_packet(
                    ice,
                    ProtocolType::Udp,
                    peer,
                    &data[range],
                    observer.as_mut(),
                    now,
                ) {
                    if let Err(e) = protocol.send_to(peer, &response, now) {
                        warn!("failed to answer ping from {peer}: {e}");
                    }
                }
            }
            RelayRecv::Handled => (),
            RelayRecv::Ignored => trace!("ignored {} bytes from the server", data.len()),
        }
    }

    fn relay_ready(&self) -> bool {
        self.state == TurnPortState::Ready
    }
}

impl Port for TurnPort {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Udp
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|socket| socket.get().local_addr())
    }

    fn ice_credentials(&self) -> &IceCredentials {
        &self.ice
    }

    #[tracing::instrument(
        name = "turn_port_prepare_address",
        skip(self, now),
        fields(server = %self.server, local_ip = %self.local_ip)
    )]
    fn prepare_address(&mut self, now: Instant) {
        if self.state != TurnPortState::New {
            debug!("already prepared");
            return;
        }
        if self.server.protocol() == ProtocolType::SslTcp {
            self.fail(PortError::Configuration(
                "TLS connections are not supported".to_owned(),
            ));
            return;
        }
        match self.server.address().clone() {
            ServerAddress::Resolved(addr) => self.connect(addr, now),
            ServerAddress::Unresolved { host, .. } => {
                debug!("resolving {host}");
                self.resolve = Some(self.network.resolve(&host));
                self.state = TurnPortState::Resolving;
            }
        }
    }

    fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    fn create_connection(
        &mut self,
        remote: &Candidate,
        origin: CandidateOrigin,
        now: Instant,
    ) -> Option<ConnectionId> {
        let local = self.candidates.first()?.clone();
        if !self.relay_ready()
            || remote.protocol != ProtocolType::Udp
            || !same_family(local.address.ip(), remote.address.ip())
        {
            debug!("can not connect to {remote}");
            return None;
        }
        if let Some(id) = self.connections.find(remote.address) {
            return Some(id);
        }
        let id = self.connections.add(local, remote.clone(), origin);
        let protocol = self.protocol.as_mut()?;
        if protocol.has_permission(remote.address.ip()) {
            protocol.bind_channel(remote.address, now);
        } else {
            match protocol.create_permission(remote.address.ip(), now) {
                Ok(()) | Err(CreatePermissionError::AlreadyExists) => (),
                Err(e) => debug!("no permission for {}: {e}", remote.address),
            }
        }
        self.drain(now);
        Some(id)
    }

    fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    fn connection_to(&self, remote: SocketAddr) -> Option<ConnectionId> {
        self.connections.find(remote)
    }

    fn destroy_connection(&mut self, id: ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    #[tracing::instrument(name = "turn_port_ping", skip(self, now), err)]
    fn ping(&mut self, id: ConnectionId, now: Instant) -> Result<(), PingError> {
        if !self.relay_ready() {
            return Err(PingError::NotReady);
        }
        let connection = self
            .connections
            .get_mut(id)
            .ok_or(PingError::UnknownConnection)?;
        let ping = connection.build_ping(now)?;
        let remote = connection.remote_candidate().address;
        let protocol = self.protocol.as_mut().ok_or(PingError::NotReady)?;
        protocol.send_to(remote, &ping, now)?;
        self.drain(now);
        Ok(())
    }

    #[tracing::instrument(
        name = "turn_port_send",
        skip(self, data, now),
        fields(data_len = data.len()),
        err
    )]
    fn send(&mut self, id: ConnectionId, data: &[u8], now: Instant) -> Result<(), SendError> {
        if !self.relay_ready() {
            return Err(SendError::NotReady);
        }
        let remote = self
            .connections
            .get(id)
            .ok_or(SendError::UnknownConnection)?
            .remote_candidate()
            .address;
        let protocol = self.protocol.as_mut().ok_or(SendError::NotReady)?;
        protocol.send_to(remote, data, now)?;
        self.flush_transmits(now);
        Ok(())
    }

    #[tracing::instrument(
        name = "turn_port_handle_incoming_packet",
        skip(self, transmit, now),
        fields(
            transport = %transmit.transport,
            from = %transmit.from,
            to = %transmit.to,
            data_len = transmit.data.len(),
        )
    )]
    fn handle_incoming_packet(&mut self, transmit: Transmit<&[u8]>, now: Instant) -> PacketRecv {
        let (Some(socket), Some(protocol)) = (self.socket.as_ref(), self.protocol.as_ref()) else {
            return PacketRecv::Ignored;
        };
        if transmit.transport != protocol.transport()
            || transmit.to != socket.get().local_addr()
            || transmit.from != protocol.server()
        {
            trace!("not from our server");
            return PacketRecv::Ignored;
        }
        if protocol.transport() == TransportType::Tcp {
            self.framer.push(transmit.data);
            loop {
                match self.framer.pop() {
                    Ok(Some(frame)) => self.handle_server_data(frame.as_ref(), now),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("failed to frame data from the server: {e}");
                        break;
                    }
                }
            }
        } else {
            self.handle_server_data(transmit.data, now);
        }
        self.drain(now);
        PacketRecv::Handled
    }

    #[tracing::instrument(level = "trace", name = "turn_port_process", skip(self), ret)]
    fn process(&mut self, now: Instant) -> Instant {
        match self.state {
            TurnPortState::Resolving => self.poll_resolve(now),
            TurnPortState::Connecting | TurnPortState::Allocating | TurnPortState::Ready => {
                self.check_socket(now)
            }
            _ => (),
        }
        while let Some(transmit) = self.socket.as_ref().and_then(PortSocket::recv) {
            let transmit = Transmit::new(
                transmit.data.as_slice(),
                transmit.transport,
                transmit.from,
                transmit.to,
            );
            self.handle_incoming_packet(transmit, now);
        }

        let mut next = match self.state {
            TurnPortState::Resolving | TurnPortState::Connecting => now + PENDING_POLL_INTERVAL,
            _ => now + IDLE_INTERVAL,
        };
        // a closed port keeps retransmitting its deallocation until answered or timed out
        let closing = self.state == TurnPortState::Closed
            && self
                .protocol
                .as_ref()
                .is_some_and(RelayProtocol::has_pending_requests);
        if closing || matches!(self.state, TurnPortState::Allocating | TurnPortState::Ready) {
            if let Some(protocol) = self.protocol.as_mut() {
                next = next.min(protocol.poll(now));
            }
            self.drain(now);
        }
        if let Some(wait) = self
            .connections
            .update_write_states(&self.config.get_connection(), now)
        {
            next = next.min(wait);
        }
        next.max(now)
    }

    fn set_option(&mut self, option: SocketOption) -> Result<(), SocketError> {
        cache_option(&mut self.options, option);
        match self.socket.as_ref() {
            Some(socket) if socket.is_owned() => socket.get().set_option(option),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::net::VirtualNetwork;

    use super::*;

    #[derive(Debug, Default)]
    struct Errors(std::rc::Rc<std::cell::RefCell<Vec<PortError>>>);

    impl PortObserver for Errors {
        fn on_port_error(&mut self, error: &PortError) {
            self.0.borrow_mut().push(error.clone());
        }
    }

    fn port(network: &VirtualNetwork, local: &str, server: &str) -> (TurnPort, Errors) {
        let errors = Errors::default();
        let port = TurnPort::builder(
            network.clone(),
            local.parse().unwrap(),
            server.parse().unwrap(),
            RelayCredentials::new("test", "test"),
        )
        .observer(Box::new(Errors(errors.0.clone())))
        .build();
        (port, errors)
    }

    #[test]
    fn tls_rejected_without_io() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        let (mut port, errors) = port(&network, "11.11.11.11", "ssltcp://99.99.99.3:443");
        port.prepare_address(Instant::now());
        assert_eq!(port.state(), TurnPortState::Failed);
        assert!(matches!(
            errors.0.borrow().as_slice(),
            [PortError::Configuration(_)]
        ));
        assert_eq!(network.open_sockets(), 0);
    }

    #[test]
    fn family_mismatch() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        let (mut port, errors) = port(&network, "2400:4030::1", "udp://99.99.99.3:3478");
        port.prepare_address(Instant::now());
        assert_eq!(port.state(), TurnPortState::Failed);
        assert_eq!(errors.0.borrow().len(), 1);
        assert_eq!(network.open_sockets(), 0);
    }

    #[test]
    fn resolve_without_suitable_address() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        network.add_host("turn.test", vec!["2400:4030::3".parse().unwrap()]);
        let (mut port, errors) = port(&network, "11.11.11.11", "udp://turn.test:3478");
        let now = Instant::now();
        port.prepare_address(now);
        assert_eq!(network.pending_resolutions(), 1);
        network.process();
        port.process(now);
        assert_eq!(
            errors.0.borrow().as_slice(),
            &[PortError::Resolve(ResolveError::NoSuitableAddress(
                "turn.test".to_owned()
            ))]
        );
    }

    #[test]
    fn drop_cancels_resolve() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        let (mut port, _errors) = port(&network, "11.11.11.11", "udp://turn.test:3478");
        port.prepare_address(Instant::now());
        assert_eq!(network.pending_resolutions(), 1);
        drop(port);
        assert_eq!(network.pending_resolutions(), 0);
    }

    #[test]
    fn options_applied_on_creation() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        let (mut port, _errors) = port(&network, "11.11.11.11", "udp://99.99.99.3:3478");
        port.set_option(SocketOption::Ttl(10)).unwrap();
        port.set_option(SocketOption::Ttl(20)).unwrap();
        port.prepare_address(Instant::now());
        assert_eq!(port.state(), TurnPortState::Allocating);
        assert_eq!(network.open_sockets(), 1);
        assert_eq!(port.options, vec![SocketOption::Ttl(20)]);
    }

    #[test]
    fn not_ready() {
        let _log = crate::tests::test_init_log();
        let network = VirtualNetwork::default();
        let (mut port, _errors) = port(&network, "11.11.11.11", "udp://99.99.99.3:3478");
        let now = Instant::now();
        let remote = Candidate::host(
            "22.22.22.22:5000".parse().unwrap(),
            ProtocolType::Udp,
            &IceCredentials::generate(),
        );
        assert!(port
            .create_connection(&remote, CandidateOrigin::Message, now)
            .is_none());
        assert_eq!(
            port.create_permission("22.22.22.22".parse().unwrap(), now),
            Err(CreatePermissionError::NoAllocation)
        );
    }
}
