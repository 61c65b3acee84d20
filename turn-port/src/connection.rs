// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Connections
//!
//! A [`Connection`] is the path between a local candidate of a port and one remote candidate.
//! Its reachability is tracked with STUN Binding requests (pings) authenticated with the ICE
//! short-term credentials of both sides.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stun_proto::agent::StunError;
use stun_proto::types::attribute::{Fingerprint, MessageIntegrity, Username, XorMappedAddress};
use stun_proto::types::message::{
    IntegrityAlgorithm, Message, MessageClass, MessageHeader, MessageIntegrityCredentials,
    MessageWrite, MessageWriteExt, MessageWriteVec, TransactionId, BINDING,
};

use tracing::{debug, info, trace, warn};

use crate::candidate::{Candidate, CandidateOrigin, IceCredentials, ProtocolType};
use crate::config::ConnectionConfig;
use crate::port::PortObserver;

/// Identifies a [`Connection`] within its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(usize);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection-{}", self.0)
    }
}

/// Whether the remote side is known to receive what is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// No ping was answered yet.
    Init,
    /// A ping was answered.
    Writable,
    /// Too many pings went unanswered for too long.
    WriteTimeout,
}

/// Whether the remote side is known to reach us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Nothing was received yet.
    Init,
    /// A valid ping or data was received.
    Readable,
}

/// The path between a local candidate and a remote candidate.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    local: Candidate,
    remote: Candidate,
    origin: CandidateOrigin,
    write_state: WriteState,
    read_state: ReadState,
    pending_pings: VecDeque<(TransactionId, Instant)>,
    last_ping_sent: Option<Instant>,
    last_ping_response: Option<Instant>,
    last_data_received: Option<Instant>,
    rtt: Option<Duration>,
}

impl Connection {
    fn new(
        id: ConnectionId,
        local: Candidate,
        remote: Candidate,
        origin: CandidateOrigin,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            origin,
            write_state: WriteState::Init,
            read_state: ReadState::Init,
            pending_pings: VecDeque::new(),
            last_ping_sent: None,
            last_ping_response: None,
            last_data_received: None,
            rtt: None,
        }
    }

    /// The identifier of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The local candidate data is sent from.
    pub fn local_candidate(&self) -> &Candidate {
        &self.local
    }

    /// The remote candidate data is sent to.
    pub fn remote_candidate(&self) -> &Candidate {
        &self.remote
    }

    /// Where the remote candidate came from.
    pub fn origin(&self) -> CandidateOrigin {
        self.origin
    }

    /// The write state.
    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    /// The read state.
    pub fn read_state(&self) -> ReadState {
        self.read_state
    }

    /// Whether data can be expected to arrive at the remote side.
    pub fn writable(&self) -> bool {
        self.write_state == WriteState::Writable
    }

    /// Whether the remote side is known to reach us.
    pub fn readable(&self) -> bool {
        self.read_state == ReadState::Readable
    }

    /// The number of pings without a response.
    pub fn unanswered_pings(&self) -> usize {
        self.pending_pings.len()
    }

    /// When the last ping was sent.
    pub fn last_ping_sent(&self) -> Option<Instant> {
        self.last_ping_sent
    }

    /// When the last successful ping response was received.
    pub fn last_ping_response(&self) -> Option<Instant> {
        self.last_ping_response
    }

    /// When data was last received.
    pub fn last_data_received(&self) -> Option<Instant> {
        self.last_data_received
    }

    /// The round trip time measured by the last answered ping.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    fn set_write_state(&mut self, state: WriteState) {
        if self.write_state != state {
            info!(
                "{} to {} write state {:?} -> {:?}",
                self.id, self.remote.address, self.write_state, state
            );
            self.write_state = state;
        }
    }

    fn set_readable(&mut self) {
        if self.read_state != ReadState::Readable {
            info!("{} to {} is readable", self.id, self.remote.address);
            self.read_state = ReadState::Readable;
        }
    }

    // USERNAME is `remote:local`, signed with the remote password.
    pub(crate) fn build_ping(&mut self, now: Instant) -> Result<Vec<u8>, StunError> {
        let username = self.remote.username.clone() + ":" + &self.local.username;
        let mut msg = Message::builder_request(BINDING, MessageWriteVec::new());
        msg.add_attribute(&Username::new(&username)?)?;
        msg.add_message_integrity(
            &MessageIntegrityCredentials::ShortTerm((&self.remote.ice_credentials()).into()),
            IntegrityAlgorithm::Sha1,
        )?;
        msg.add_fingerprint()?;
        let transaction_id = msg.transaction_id();
        trace!("{} sending ping {transaction_id}", self.id);
        self.pending_pings.push_back((transaction_id, now));
        self.last_ping_sent = Some(now);
        Ok(msg.finish())
    }

    // Returns whether `msg` answered one of our pings.
    fn handle_ping_response(&mut self, msg: &Message<'_>, now: Instant) -> bool {
        let transaction_id = msg.transaction_id();
        let Some(position) = self
            .pending_pings
            .iter()
            .position(|(pending, _sent)| *pending == transaction_id)
        else {
            return false;
        };
        if msg
            .validate_integrity(&MessageIntegrityCredentials::ShortTerm(
                (&self.remote.ice_credentials()).into(),
            ))
            .is_err()
        {
            debug!("{} ping response failed integrity check", self.id);
            return true;
        }
        if msg.has_class(MessageClass::Error) {
            warn!("{} ping {transaction_id} returned an error", self.id);
            self.pending_pings.remove(position);
            return true;
        }
        if msg.attribute::<XorMappedAddress>().is_err() {
            debug!("{} ping response without XOR-MAPPED-ADDRESS", self.id);
            return true;
        }
        let sent = self.pending_pings[position].1;
        self.rtt = Some(now.saturating_duration_since(sent));
        // a response acknowledges every earlier ping too
        self.pending_pings.clear();
        self.last_ping_response = Some(now);
        self.set_write_state(WriteState::Writable);
        true
    }

    pub(crate) fn received_data(&mut self, now: Instant) {
        self.last_data_received = Some(now);
        self.set_readable();
    }

    // Returns when the write state should be checked again.
    pub(crate) fn update_write_state(
        &mut self,
        config: &ConnectionConfig,
        now: Instant,
    ) -> Option<Instant> {
        if self.pending_pings.len() < config.get_write_timeout_pings() {
            return None;
        }
        let (_transaction, oldest) = self.pending_pings.front()?;
        let deadline = *oldest + config.get_write_timeout();
        if deadline <= now {
            if self.write_state != WriteState::WriteTimeout {
                warn!(
                    "{} to {}: {} pings unanswered since {:?}",
                    self.id,
                    self.remote.address,
                    self.pending_pings.len(),
                    now - *oldest
                );
            }
            self.set_write_state(WriteState::WriteTimeout);
            return None;
        }
        Some(deadline)
    }
}

/// What a peer sent to a port.
#[derive(Debug)]
pub(crate) enum PeerPacket<'a> {
    BindingRequest(Message<'a>),
    BindingResponse(Message<'a>),
    Data,
}

impl<'a> PeerPacket<'a> {
    pub(crate) fn classify(data: &'a [u8]) -> Self {
        if MessageHeader::from_bytes(data).is_err() {
            return Self::Data;
        }
        let Ok(msg) = Message::from_bytes(data) else {
            return Self::Data;
        };
        if !msg.has_method(BINDING) {
            return Self::Data;
        }
        if msg.has_class(MessageClass::Request) {
            Self::BindingRequest(msg)
        } else if msg.is_response() {
            Self::BindingResponse(msg)
        } else {
            Self::Data
        }
    }
}

// Check USERNAME (`local:remote`) and MESSAGE-INTEGRITY of an incoming ping, returning the remote
// username fragment.
pub(crate) fn validate_ping(msg: &Message<'_>, local: &IceCredentials) -> Option<String> {
    if msg.attribute::<Fingerprint>().is_err() || msg.attribute::<MessageIntegrity>().is_err() {
        trace!("ping without FINGERPRINT or MESSAGE-INTEGRITY");
        return None;
    }
    let username = msg.attribute::<Username>().ok()?;
    let (local_ufrag, remote_ufrag) = username.username().split_once(':')?;
    if local_ufrag != local.ufrag {
        debug!("ping for unknown username {}", username.username());
        return None;
    }
    if msg
        .validate_integrity(&MessageIntegrityCredentials::ShortTerm(local.into()))
        .is_err()
    {
        debug!("ping failed integrity check");
        return None;
    }
    Some(remote_ufrag.to_owned())
}

pub(crate) fn ping_response(
    msg: &Message<'_>,
    from: SocketAddr,
    local: &IceCredentials,
) -> Result<Vec<u8>, StunError> {
    let mut response = Message::builder_success(msg, MessageWriteVec::new());
    response.add_attribute(&XorMappedAddress::new(from, msg.transaction_id()))?;
    response.add_message_integrity(
        &MessageIntegrityCredentials::ShortTerm(local.into()),
        IntegrityAlgorithm::Sha1,
    )?;
    response.add_fingerprint()?;
    Ok(response.finish())
}

/// The connections of a port.
#[derive(Debug, Default)]
pub(crate) struct ConnectionSet {
    next_id: usize,
    connections: BTreeMap<ConnectionId, Connection>,
}

impl ConnectionSet {
    pub(crate) fn add(
        &mut self,
        local: Candidate,
        remote: Candidate,
        origin: CandidateOrigin,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        info!(
            "created {id} from {} to {} ({origin:?})",
            local.address, remote.address
        );
        self.connections
            .insert(id, Connection::new(id, local, remote, origin));
        id
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        info!("destroyed {id} to {}", connection.remote.address);
        Some(connection)
    }

    pub(crate) fn find(&self, remote: SocketAddr) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|connection| connection.remote.address == remote)
            .map(|connection| connection.id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.values()
    }

    pub(crate) fn update_write_states(
        &mut self,
        config: &ConnectionConfig,
        now: Instant,
    ) -> Option<Instant> {
        self.connections
            .values_mut()
            .filter_map(|connection| connection.update_write_state(config, now))
            .min()
    }

    /// Handle a packet from the peer at `from`.  Returns a response that must be sent back to
    /// `from`.
    pub(crate) fn handle_packet(
        &mut self,
        local: &IceCredentials,
        protocol: ProtocolType,
        from: SocketAddr,
        data: &[u8],
        observer: &mut dyn PortObserver,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let id = self.find(from);
        match PeerPacket::classify(data) {
            PeerPacket::BindingRequest(msg) => {
                let remote_ufrag = validate_ping(&msg, local)?;
                let Some(connection) = id.and_then(|id| self.connections.get_mut(&id)) else {
                    debug!("ping from unknown address {from} with username {remote_ufrag}");
                    observer.on_unknown_address(from, protocol, &remote_ufrag);
                    return None;
                };
                if connection.remote.username != remote_ufrag {
                    debug!(
                        "{} ping username {remote_ufrag} does not match remote {}",
                        connection.id, connection.remote.username
                    );
                    return None;
                }
                connection.set_readable();
                match ping_response(&msg, from, local) {
                    Ok(response) => Some(response),
                    Err(e) => {
                        warn!("failed to construct ping response: {e}");
                        None
                    }
                }
            }
            PeerPacket::BindingResponse(msg) => {
                let connection = id.and_then(|id| self.connections.get_mut(&id))?;
                if !connection.handle_ping_response(&msg, now) {
                    trace!("{} ignoring unknown response", connection.id);
                }
                None
            }
            PeerPacket::Data => {
                let Some(connection) = id.and_then(|id| self.connections.get_mut(&id)) else {
                    trace!("dropping {} bytes from unknown {from}", data.len());
                    return None;
                };
                connection.received_data(now);
                observer.on_read_packet(connection.id, data);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::port::PortError;

    #[derive(Debug, Default)]
    struct Recorder {
        unknown: Vec<(SocketAddr, String)>,
        packets: Vec<(ConnectionId, Vec<u8>)>,
    }

    impl PortObserver for Recorder {
        fn on_port_complete(&mut self, _candidates: &[Candidate]) {}
        fn on_port_error(&mut self, _error: &PortError) {}
        fn on_create_permission_result(&mut self, _peer: IpAddr, _code: u16) {}
        fn on_unknown_address(&mut self, remote: SocketAddr, _protocol: ProtocolType, ufrag: &str) {
            self.unknown.push((remote, ufrag.to_owned()));
        }
        fn on_read_packet(&mut self, connection: ConnectionId, data: &[u8]) {
            self.packets.push((connection, data.to_vec()));
        }
    }

    struct Side {
        ice: IceCredentials,
        candidate: Candidate,
        connections: ConnectionSet,
        recorder: Recorder,
    }

    impl Side {
        fn new(addr: &str) -> Self {
            let ice = IceCredentials::generate();
            let candidate = Candidate::host(addr.parse().unwrap(), ProtocolType::Udp, &ice);
            Self {
                ice,
                candidate,
                connections: ConnectionSet::default(),
                recorder: Recorder::default(),
            }
        }

        fn connect(&mut self, other: &Side) -> ConnectionId {
            self.connections.add(
                self.candidate.clone(),
                other.candidate.clone(),
                CandidateOrigin::Message,
            )
        }

        fn receive(&mut self, from: &Side, data: &[u8], now: Instant) -> Option<Vec<u8>> {
            self.connections.handle_packet(
                &self.ice,
                ProtocolType::Udp,
                from.candidate.address,
                data,
                &mut self.recorder,
                now,
            )
        }
    }

    #[test]
    fn ping_pong() {
        let _log = crate::tests::test_init_log();
        let now = Instant::now();
        let mut a = Side::new("10.0.0.1:1000");
        let mut b = Side::new("10.0.0.2:2000");
        let a_id = a.connect(&b);
        let b_id = b.connect(&a);

        let ping = a.connections.get_mut(a_id).unwrap().build_ping(now).unwrap();
        let msg = Message::from_bytes(&ping).unwrap();
        let username = msg.attribute::<Username>().unwrap();
        assert_eq!(
            username.username(),
            format!("{}:{}", b.ice.ufrag, a.ice.ufrag)
        );

        let response = b.receive(&a, &ping, now).unwrap();
        assert!(b.connections.get(b_id).unwrap().readable());
        assert!(!b.connections.get(b_id).unwrap().writable());

        let later = now + Duration::from_millis(20);
        assert!(a.receive(&b, &response, later).is_none());
        let connection = a.connections.get(a_id).unwrap();
        assert!(connection.writable());
        assert_eq!(connection.rtt(), Some(Duration::from_millis(20)));
        assert_eq!(connection.unanswered_pings(), 0);
        assert_eq!(connection.read_state(), ReadState::Init);
    }

    #[test]
    fn ping_wrong_password() {
        let _log = crate::tests::test_init_log();
        let now = Instant::now();
        let mut a = Side::new("10.0.0.1:1000");
        let mut b = Side::new("10.0.0.2:2000");
        let mut wrong = b.candidate.clone();
        wrong.password = "wrong".to_owned();
        let a_id = a
            .connections
            .add(a.candidate.clone(), wrong, CandidateOrigin::Message);
        b.connect(&a);
        let ping = a.connections.get_mut(a_id).unwrap().build_ping(now).unwrap();
        assert!(b.receive(&a, &ping, now).is_none());
        assert!(b.recorder.unknown.is_empty());
    }

    #[test]
    fn ping_unknown_address() {
        let _log = crate::tests::test_init_log();
        let now = Instant::now();
        let mut a = Side::new("10.0.0.1:1000");
        let mut b = Side::new("10.0.0.2:2000");
        let a_id = a.connect(&b);
        let ping = a.connections.get_mut(a_id).unwrap().build_ping(now).unwrap();
        assert!(b.receive(&a, &ping, now).is_none());
        assert_eq!(
            b.recorder.unknown,
            vec![(a.candidate.address, a.ice.ufrag.clone())]
        );
        assert_eq!(b.connections.iter().count(), 0);
    }

    #[test]
    fn data_makes_readable() {
        let _log = crate::tests::test_init_log();
        let now = Instant::now();
        let a = Side::new("10.0.0.1:1000");
        let mut b = Side::new("10.0.0.2:2000");
        let b_id = b.connect(&a);
        assert!(b.receive(&a, &[0xff, 0x01], now).is_none());
        let connection = b.connections.get(b_id).unwrap();
        assert!(connection.readable());
        assert_eq!(connection.last_data_received(), Some(now));
        assert_eq!(b.recorder.packets, vec![(b_id, vec![0xff, 0x01])]);
    }

    #[test]
    fn write_timeout() {
        let _log = crate::tests::test_init_log();
        let config = ConnectionConfig::default();
        let mut now = Instant::now();
        let mut a = Side::new("10.0.0.1:1000");
        let mut b = Side::new("10.0.0.2:2000");
        let a_id = a.connect(&b);
        b.connect(&a);

        let ping = a.connections.get_mut(a_id).unwrap().build_ping(now).unwrap();
        let response = b.receive(&a, &ping, now).unwrap();
        a.receive(&b, &response, now);
        assert!(a.connections.get(a_id).unwrap().writable());

        let start = now;
        for _ in 0..5 {
            a.connections.get_mut(a_id).unwrap().build_ping(now).unwrap();
            now += Duration::from_secs(1);
        }
        // enough pings but not old enough
        assert_eq!(
            a.connections.update_write_states(&config, now),
            Some(start + Duration::from_secs(15))
        );
        assert!(a.connections.get(a_id).unwrap().writable());
        now = start + Duration::from_secs(15);
        assert_eq!(a.connections.update_write_states(&config, now), None);
        assert_eq!(
            a.connections.get(a_id).unwrap().write_state(),
            WriteState::WriteTimeout
        );

        // a fresh answer recovers
        let ping = a.connections.get_mut(a_id).unwrap().build_ping(now).unwrap();
        let response = b.receive(&a, &ping, now).unwrap();
        a.receive(&b, &response, now);
        assert!(a.connections.get(a_id).unwrap().writable());
    }

    #[test]
    fn few_old_pings_stay_writable() {
        let _log = crate::tests::test_init_log();
        let config = ConnectionConfig::default();
        let now = Instant::now();
        let mut a = Side::new("10.0.0.1:1000");
        let b = Side::new("10.0.0.2:2000");
        let a_id = a.connect(&b);
        a.connections.get_mut(a_id).unwrap().build_ping(now).unwrap();
        a.connections
            .update_write_states(&config, now + Duration::from_secs(60));
        assert_eq!(
            a.connections.get(a_id).unwrap().write_state(),
            WriteState::Init
        );
    }
}
