// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # UDP port
//!
//! A [`UdpPort`] sends directly from a local UDP socket and produces a single host candidate.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use stun_proto::agent::Transmit;
use stun_proto::types::TransportType;

use tracing::{debug, info, trace, warn};

use crate::candidate::{Candidate, CandidateOrigin, IceCredentials, ProtocolType};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionId, ConnectionSet};
use crate::net::{
    cache_option, Network, PortSocket, SharedSocket, SocketError, SocketOption,
};
use crate::port::{PacketRecv, PingError, Port, PortError, PortObserver, SendError};

/// Builder for a [`UdpPort`].
#[derive(Debug)]
pub struct UdpPortBuilder {
    network: Box<dyn Network>,
    local_ip: IpAddr,
    observer: Box<dyn PortObserver>,
    shared_socket: Option<SharedSocket>,
    ice: Option<IceCredentials>,
    connection_config: ConnectionConfig,
}

impl UdpPortBuilder {
    /// Where the port reports to.
    pub fn observer(mut self, observer: Box<dyn PortObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use a UDP socket owned by the caller instead of binding one.
    pub fn shared_socket(mut self, socket: SharedSocket) -> Self {
        self.shared_socket = Some(socket);
        self
    }

    /// The ICE credentials for the host candidate.  Random credentials are generated otherwise.
    pub fn ice_credentials(mut self, ice: IceCredentials) -> Self {
        self.ice = Some(ice);
        self
    }

    /// When connections consider their remote side gone.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Construct the [`UdpPort`].  No I/O is performed.
    pub fn build(self) -> UdpPort {
        UdpPort {
            network: self.network,
            local_ip: self.local_ip,
            observer: self.observer,
            shared_socket: self.shared_socket,
            ice: self.ice.unwrap_or_else(IceCredentials::generate),
            connection_config: self.connection_config,
            socket: None,
            failed: false,
            candidates: vec![],
            connections: ConnectionSet::default(),
            options: vec![],
        }
    }
}

/// A port sending directly from a local UDP socket.
#[derive(Debug)]
pub struct UdpPort {
    network: Box<dyn Network>,
    local_ip: IpAddr,
    observer: Box<dyn PortObserver>,
    shared_socket: Option<SharedSocket>,
    ice: IceCredentials,
    connection_config: ConnectionConfig,
    socket: Option<PortSocket>,
    failed: bool,
    candidates: Vec<Candidate>,
    connections: ConnectionSet,
    options: Vec<SocketOption>,
}

impl UdpPort {
    /// Start building a [`UdpPort`] on `local_ip`.
    pub fn builder(network: impl Network + 'static, local_ip: IpAddr) -> UdpPortBuilder {
        UdpPortBuilder {
            network: Box::new(network),
            local_ip,
            observer: Box::new(()),
            shared_socket: None,
            ice: None,
            connection_config: ConnectionConfig::default(),
        }
    }

    fn fail(&mut self, error: PortError) {
        if self.failed {
            return;
        }
        warn!("port failed: {error}");
        self.failed = true;
        self.observer.on_port_error(&error);
    }

    fn send_bytes(&self, data: &[u8], to: SocketAddr) -> Result<(), SocketError> {
        let socket = self.socket.as_ref().ok_or(SocketError::NotConnected)?;
        socket.get().send_to(data, to)
    }

    fn ready(&self) -> bool {
        !self.failed && !self.candidates.is_empty()
    }
}

impl Port for UdpPort {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Udp
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|socket| socket.get().local_addr())
    }

    fn ice_credentials(&self) -> &IceCredentials {
        &self.ice
    }

    #[tracing::instrument(name = "udp_port_prepare_address", skip(self, _now), fields(local_ip = %self.local_ip))]
    fn prepare_address(&mut self, _now: Instant) {
        if self.socket.is_some() || self.failed {
            debug!("already prepared");
            return;
        }
        let socket = match self.shared_socket.take() {
            Some(shared) if shared.socket().transport() != TransportType::Udp => {
                self.fail(PortError::Configuration(
                    "the shared socket must be a UDP socket".to_owned(),
                ));
                return;
            }
            Some(shared) => PortSocket::Shared(shared),
            None => match self.network.create_udp_socket(self.local_ip) {
                Ok(socket) => {
                    for option in self.options.iter() {
                        if let Err(e) = socket.set_option(*option) {
                            debug!("failed to apply {option:?}: {e}");
                        }
                    }
                    PortSocket::Owned(socket)
                }
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            },
        };
        let candidate = Candidate::host(socket.get().local_addr(), ProtocolType::Udp, &self.ice);
        info!("host candidate {candidate}");
        self.socket = Some(socket);
        self.candidates.push(candidate);
        self.observer.on_port_complete(&self.candidates);
    }

    fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    fn create_connection(
        &mut self,
        remote: &Candidate,
        origin: CandidateOrigin,
        _now: Instant,
    ) -> Option<ConnectionId> {
        let local = self.candidates.first()?.clone();
        if self.failed
            || remote.protocol != ProtocolType::Udp
            || local.address.is_ipv4() != remote.address.is_ipv4()
        {
            debug!("can not connect to {remote}");
            return None;
        }
        if let Some(id) = self.connections.find(remote.address) {
            return Some(id);
        }
        Some(self.connections.add(local, remote.clone(), origin))
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

    #[tracing::instrument(name = "udp_port_ping", skip(self, now), err)]
    fn ping(&mut self, id: ConnectionId, now: Instant) -> Result<(), PingError> {
        if !self.ready() {
            return Err(PingError::NotReady);
        }
        let connection = self
            .connections
            .get_mut(id)
            .ok_or(PingError::UnknownConnection)?;
        let ping = connection.build_ping(now)?;
        let remote = connection.remote_candidate().address;
        self.send_bytes(&ping, remote)?;
        Ok(())
    }

    #[tracing::instrument(
        name = "udp_port_send",
        skip(self, data, _now),
        fields(data_len = data.len()),
        err
    )]
    fn send(&mut self, id: ConnectionId, data: &[u8], _now: Instant) -> Result<(), SendError> {
        if !self.ready() {
            return Err(SendError::NotReady);
        }
        let remote = self
            .connections
            .get(id)
            .ok_or(SendError::UnknownConnection)?
            .remote_candidate()
            .address;
        self.send_bytes(data, remote)?;
        Ok(())
    }

    #[tracing::instrument(
        name = "udp_port_handle_incoming_packet",
        skip(self, transmit, now),
        fields(
            from = %transmit.from,
            to = %transmit.to,
            data_len = transmit.data.len(),
        )
    )]
    fn handle_incoming_packet(&mut self, transmit: Transmit<&[u8]>, now: Instant) -> PacketRecv {
        if self.failed
            || transmit.transport != TransportType::Udp
            || Some(transmit.to) != self.local_addr()
        {
            trace!("not for this port");
            return PacketRecv::Ignored;
        }
        let Self {
            connections,
            ice,
            observer,
            ..
        } = self;
        let response = connections.handle_packet(
            ice,
            ProtocolType::Udp,
            transmit.from,
            transmit.data,
            observer.as_mut(),
            now,
        );
        if let Some(response) = response {
            if let Err(e) = self.send_bytes(&response, transmit.from) {
                warn!("failed to answer ping from {}: {e}", transmit.from);
            }
        }
        PacketRecv::Handled
    }

    #[tracing::instrument(level = "trace", name = "udp_port_process", skip(self), ret)]
    fn process(&mut self, now: Instant) -> Instant {
        while let Some(transmit) = self.socket.as_ref().and_then(PortSocket::recv) {
            let transmit = Transmit::new(
                transmit.data.as_slice(),
                transmit.transport,
                transmit.from,
                transmit.to,
            );
            self.handle_incoming_packet(transmit, now);
        }
        let next = self
            .connections
            .update_write_states(&self.connection_config, now)
            .unwrap_or(now + Duration::from_secs(3600));
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
