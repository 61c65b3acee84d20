// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Protocol module
//!
//! The sans-IO state machine of a TURN allocation: authentication, refreshes, permissions,
//! channels and the relaying of peer data.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::time::{Duration, Instant};

use stun_proto::agent::{HandleStunReply, StunAgent, StunAgentPollRet, StunError};
use stun_proto::types::attribute::{ErrorCode, Nonce, Realm, Username, XorMappedAddress};
use stun_proto::types::data::Data;
use stun_proto::types::message::{
    IntegrityAlgorithm, LongTermCredentials, Message, MessageClass, MessageIntegrityCredentials,
    MessageType, MessageWrite, MessageWriteExt, MessageWriteVec, TransactionId,
};
use stun_proto::types::TransportType;

use relay_types::attribute::Data as AData;
use relay_types::attribute::{
    ChannelNumber, DontFragment, Lifetime, RequestedTransport, XorPeerAddress, XorRelayedAddress,
};
use relay_types::channel::ChannelData;
use relay_types::message::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, DATA, REFRESH, SEND};
use relay_types::TurnCredentials;

use tracing::{debug, error, info, trace, warn};

use crate::config::TurnPortConfig;
use crate::port::{CreatePermissionError, PortError, SendError};

/// Reported for requests that never got an answer.
pub(crate) const TIMEOUT_CODE: u16 = 408;

const FIRST_CHANNEL: u16 = 0x4000;
const LAST_CHANNEL: u16 = 0x7FFF;

#[derive(Debug)]
enum AuthState {
    Initial,
    InitialSent(TransactionId),
    Authenticating {
        credentials: LongTermCredentials,
        nonce: String,
        transaction_id: TransactionId,
    },
    Authenticated {
        credentials: LongTermCredentials,
        nonce: String,
    },
    Error,
}

// Requests sent once authenticated, keyed by transaction.
#[derive(Debug, Clone, Copy)]
enum PendingRequest {
    Refresh { lifetime: u32 },
    CreatePermission { peer: IpAddr },
    ChannelBind { channel: u16, peer: SocketAddr },
}

#[derive(Debug)]
struct Allocation {
    relayed: SocketAddr,
    lifetime: Duration,
    expires_at: Instant,
    refreshing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallState {
    Pending,
    Installed,
}

#[derive(Debug)]
struct Permission {
    ip: IpAddr,
    state: InstallState,
    expires_at: Instant,
    used: bool,
    refreshing: bool,
    queued: VecDeque<(SocketAddr, Vec<u8>)>,
}

#[derive(Debug)]
struct Channel {
    number: u16,
    peer: SocketAddr,
    state: InstallState,
    expires_at: Instant,
    used: bool,
    refreshing: bool,
}

/// Things that happened to the allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RelayEvent {
    Allocated {
        relayed: SocketAddr,
        mapped: SocketAddr,
    },
    Failed(PortError),
    PermissionCreated(IpAddr),
    PermissionFailed(IpAddr, u16),
}

/// Return value of [`RelayProtocol::handle_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RelayRecv {
    Handled,
    Ignored,
    /// `range` of the handled message holds data sent by `peer`.
    PeerData { peer: SocketAddr, range: Range<usize> },
}

#[derive(Debug)]
pub(crate) struct RelayProtocol {
    agent: StunAgent,
    server: SocketAddr,
    credentials: TurnCredentials,
    config: TurnPortConfig,
    state: AuthState,
    pending: HashMap<TransactionId, PendingRequest>,
    allocation: Option<Allocation>,
    permissions: Vec<Permission>,
    channels: Vec<Channel>,
    next_channel: u16,
    pending_transmits: VecDeque<Vec<u8>>,
    events: VecDeque<RelayEvent>,
}

impl RelayProtocol {
    pub(crate) fn new(
        transport: TransportType,
        local_addr: SocketAddr,
        server: SocketAddr,
        credentials: TurnCredentials,
        config: TurnPortConfig,
    ) -> Self {
        let agent = StunAgent::builder(transport, local_addr)
            .remote_addr(server)
            .build();
        Self {
            agent,
            server,
            credentials,
            config,
            state: AuthState::Initial,
            pending: HashMap::new(),
            allocation: None,
            permissions: vec![],
            channels: vec![],
            next_channel: FIRST_CHANNEL,
            pending_transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub(crate) fn transport(&self) -> TransportType {
        self.agent.transport()
    }

    pub(crate) fn server(&self) -> SocketAddr {
        self.server
    }

    #[cfg(test)]
    pub(crate) fn is_failed(&self) -> bool {
        matches!(self.state, AuthState::Error)
    }

    pub(crate) fn relayed_address(&self) -> Option<SocketAddr> {
        self.allocation.as_ref().map(|allocation| allocation.relayed)
    }

    pub(crate) fn has_permission(&self, peer: IpAddr) -> bool {
        self.permission(peer)
            .is_some_and(|permission| permission.state == InstallState::Installed)
    }

    pub(crate) fn has_channel(&self, peer: SocketAddr) -> bool {
        self.channels
            .iter()
            .any(|channel| channel.peer == peer && channel.state == InstallState::Installed)
    }

    fn permission(&self, peer: IpAddr) -> Option<&Permission> {
        self.permissions.iter().find(|permission| permission.ip == peer)
    }

    fn permission_mut(&mut self, peer: IpAddr) -> Option<&mut Permission> {
        self.permissions
            .iter_mut()
            .find(|permission| permission.ip == peer)
    }

    fn padded(&self) -> bool {
        self.agent.transport() == TransportType::Tcp
    }

    fn fail(&mut self, error: PortError) {
        if matches!(self.state, AuthState::Error) {
            return;
        }
        error!("relay failed: {error}");
        self.state = AuthState::Error;
        self.pending.clear();
        self.allocation = None;
        self.permissions.clear();
        self.channels.clear();
        self.events.push_back(RelayEvent::Failed(error));
    }

    fn send_request(&mut self, msg: &[u8], now: Instant) -> Result<(), StunError> {
        let transmit = self.agent.send_request(msg, self.server, now)?;
        self.pending_transmits.push_back(transmit.data.to_vec());
        Ok(())
    }

    fn allocate_request(
        &self,
        auth: Option<(&LongTermCredentials, &str)>,
    ) -> Result<(Vec<u8>, TransactionId), StunError> {
        let mut builder = Message::builder_request(ALLOCATE, MessageWriteVec::new());
        let lifetime = self.config.get_allocation_lifetime().as_secs() as u32;
        builder.add_attribute(&Lifetime::new(lifetime))?;
        builder.add_attribute(&RequestedTransport::new(RequestedTransport::UDP))?;
        builder.add_attribute(&DontFragment::new())?;
        let transaction_id = builder.transaction_id();
        let msg = match auth {
            Some((credentials, nonce)) => sign(builder, credentials, nonce)?,
            None => builder.finish(),
        };
        Ok((msg, transaction_id))
    }

    /// Send the unauthenticated Allocate request.
    #[tracing::instrument(name = "relay_start", skip(self, now), fields(server = %self.server))]
    pub(crate) fn start(&mut self, now: Instant) -> Result<(), StunError> {
        if !matches!(self.state, AuthState::Initial) {
            return Ok(());
        }
        let (msg, transaction_id) = self.allocate_request(None)?;
        self.send_request(&msg, now)?;
        info!("sent initial allocate {transaction_id}");
        self.state = AuthState::InitialSent(transaction_id);
        Ok(())
    }

    fn send_allocate(
        &mut self,
        credentials: LongTermCredentials,
        nonce: String,
        now: Instant,
    ) -> Result<(), StunError> {
        let (msg, transaction_id) = self.allocate_request(Some((&credentials, &nonce)))?;
        self.send_request(&msg, now)?;
        debug!("sent authenticated allocate {transaction_id}");
        self.state = AuthState::Authenticating {
            credentials,
            nonce,
            transaction_id,
        };
        Ok(())
    }

    fn send_authenticated(&mut self, request: PendingRequest, now: Instant) -> Result<(), StunError> {
        let AuthState::Authenticated { credentials, nonce } = &self.state else {
            debug!("not authenticated, dropping {request:?}");
            return Ok(());
        };
        let (method, name) = match request {
            PendingRequest::Refresh { .. } => (REFRESH, "refresh"),
            PendingRequest::CreatePermission { .. } => (CREATE_PERMISSION, "create permission"),
            PendingRequest::ChannelBind { .. } => (CHANNEL_BIND, "channel bind"),
        };
        let mut builder = Message::builder_request(method, MessageWriteVec::new());
        let transaction_id = builder.transaction_id();
        match request {
            PendingRequest::Refresh { lifetime } => {
                builder.add_attribute(&Lifetime::new(lifetime))?;
            }
            PendingRequest::CreatePermission { peer } => {
                builder.add_attribute(&XorPeerAddress::new(
                    SocketAddr::new(peer, 0),
                    transaction_id,
                ))?;
            }
            PendingRequest::ChannelBind { channel, peer } => {
                builder.add_attribute(&ChannelNumber::new(channel))?;
                builder.add_attribute(&XorPeerAddress::new(peer, transaction_id))?;
            }
        }
        let msg = sign(builder, credentials, nonce)?;
        self.send_request(&msg, now)?;
        trace!("sent {name} {transaction_id} {request:?}");
        self.pending.insert(transaction_id, request);
        Ok(())
    }

    fn send_or_log(&mut self, request: PendingRequest, now: Instant) {
        if let Err(e) = self.send_authenticated(request, now) {
            warn!("failed to send {request:?}: {e}");
        }
    }

    /// Request a permission for `peer`.
    #[tracing::instrument(name = "relay_create_permission", skip(self, now), err)]
    pub(crate) fn create_permission(
        &mut self,
        peer: IpAddr,
        now: Instant,
    ) -> Result<(), CreatePermissionError> {
        if self.allocation.is_none() || !matches!(self.state, AuthState::Authenticated { .. }) {
            return Err(CreatePermissionError::NoAllocation);
        }
        if self.permission(peer).is_some() {
            return Err(CreatePermissionError::AlreadyExists);
        }
        self.permissions.push(Permission {
            ip: peer,
            state: InstallState::Pending,
            expires_at: now,
            used: false,
            refreshing: false,
            queued: VecDeque::new(),
        });
        self.send_or_log(PendingRequest::CreatePermission { peer }, now);
        Ok(())
    }

    /// Bind a channel to `peer` if channels are enabled and the permission exists.
    pub(crate) fn bind_channel(&mut self, peer: SocketAddr, now: Instant) {
        if !self.config.get_use_channels()
            || !self.has_permission(peer.ip())
            || self.channels.iter().any(|channel| channel.peer == peer)
        {
            return;
        }
        let number = self.next_channel;
        self.next_channel = if number >= LAST_CHANNEL {
            FIRST_CHANNEL
        } else {
            number + 1
        };
        debug!("binding channel {number:#06x} to {peer}");
        self.channels.push(Channel {
            number,
            peer,
            state: InstallState::Pending,
            expires_at: now,
            used: false,
            refreshing: false,
        });
        self.send_or_log(
            PendingRequest::ChannelBind {
                channel: number,
                peer,
            },
            now,
        );
    }

    /// Relay `data` to `peer`.  Data for a peer without an installed permission is queued until
    /// the permission is installed.
    pub(crate) fn send_to(
        &mut self,
        peer: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<(), SendError> {
        if self.allocation.is_none() {
            return Err(SendError::NotReady);
        }
        if data.len() > AData::MAX_LEN {
            return Err(SendError::TooLarge);
        }
        match self.permission_mut(peer.ip()) {
            Some(permission) if permission.state == InstallState::Installed => {
                permission.used = true;
            }
            Some(permission) => {
                trace!("queueing {} bytes for {peer} until permission", data.len());
                permission.queued.push_back((peer, data.to_vec()));
                return Ok(());
            }
            None => {
                self.create_permission(peer.ip(), now)
                    .map_err(|_| SendError::NotReady)?;
                if let Some(permission) = self.permission_mut(peer.ip()) {
                    permission.queued.push_back((peer, data.to_vec()));
                }
                return Ok(());
            }
        }
        self.send_direct(peer, data)
    }

    fn send_direct(&mut self, peer: SocketAddr, data: &[u8]) -> Result<(), SendError> {
        let padded = self.padded();
        if let Some(channel) = self
            .channels
            .iter_mut()
            .find(|channel| channel.peer == peer && channel.state == InstallState::Installed)
        {
            channel.used = true;
            let msg = ChannelData::new(channel.number, data).to_vec(padded);
            self.pending_transmits.push_back(msg);
            return Ok(());
        }
        let transaction_id = TransactionId::generate();
        let mut builder = Message::builder(
            MessageType::from_class_method(MessageClass::Indication, SEND),
            transaction_id,
            MessageWriteVec::new(),
        );
        builder.add_attribute(&XorPeerAddress::new(peer, transaction_id))?;
        let data = AData::new(data).ok_or(SendError::TooLarge)?;
        builder.add_attribute(&data)?;
        self.pending_transmits.push_back(builder.finish());
        Ok(())
    }

    /// Remove the allocation from the server.  Returns whether a request was sent.
    pub(crate) fn deallocate(&mut self, now: Instant) -> bool {
        if self.allocation.is_none() {
            return false;
        }
        info!("deallocating");
        self.permissions.clear();
        self.channels.clear();
        self.pending.clear();
        self.send_or_log(PendingRequest::Refresh { lifetime: 0 }, now);
        self.allocation = None;
        true
    }

    /// Whether any request is still waiting for a response.
    pub(crate) fn has_pending_requests(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn poll_event(&mut self) -> Option<RelayEvent> {
        self.events.pop_front()
    }

    pub(crate) fn poll_transmit(&mut self, now: Instant) -> Option<Vec<u8>> {
        if let Some(transmit) = self.pending_transmits.pop_front() {
            return Some(transmit);
        }
        self.agent
            .poll_transmit(now)
            .map(|transmit| Data::from(transmit.data).to_vec())
    }

    /// Run the timers.  Returns when this should be called again.
    #[tracing::instrument(level = "trace", name = "relay_poll", skip(self), ret)]
    pub(crate) fn poll(&mut self, now: Instant) -> Instant {
        if matches!(self.state, AuthState::Error) {
            return now + Duration::from_secs(3600);
        }
        let mut next = match self.agent.poll(now) {
            StunAgentPollRet::WaitUntil(wait) => wait,
            StunAgentPollRet::TransactionTimedOut(transaction_id)
            | StunAgentPollRet::TransactionCancelled(transaction_id) => {
                self.handle_timeout(transaction_id);
                now
            }
        };
        if let Some(wait) = self.run_timers(now) {
            next = next.min(wait);
        }
        next.max(now)
    }

    fn handle_timeout(&mut self, transaction_id: TransactionId) {
        match &self.state {
            AuthState::InitialSent(pending)
            | AuthState::Authenticating {
                transaction_id: pending,
                ..
            } if *pending == transaction_id => {
                warn!("allocate {transaction_id} timed out");
                let server = self.server;
                self.fail(PortError::Connect(server));
                return;
            }
            _ => (),
        }
        let Some(request) = self.pending.remove(&transaction_id) else {
            return;
        };
        warn!("{request:?} timed out");
        match request {
            PendingRequest::Refresh { lifetime: 0 } => (),
            PendingRequest::Refresh { .. } => self.fail(PortError::AllocationLost),
            PendingRequest::CreatePermission { peer } => {
                self.permission_failed(peer, TIMEOUT_CODE)
            }
            PendingRequest::ChannelBind { channel, .. } => {
                self.channels.retain(|existing| existing.number != channel)
            }
        }
    }

    fn run_timers(&mut self, now: Instant) -> Option<Instant> {
        if !matches!(self.state, AuthState::Authenticated { .. }) {
            return None;
        }
        let allocation = self.allocation.as_mut()?;
        if allocation.expires_at <= now {
            warn!("allocation {} expired", allocation.relayed);
            self.fail(PortError::AllocationLost);
            return None;
        }
        let mut next = allocation.expires_at;
        let refresh_at = self
            .config
            .refresh_at(allocation.expires_at, allocation.lifetime);
        let mut requests = vec![];
        if !allocation.refreshing {
            if refresh_at <= now {
                allocation.refreshing = true;
                let lifetime = self.config.get_allocation_lifetime().as_secs() as u32;
                requests.push(PendingRequest::Refresh { lifetime });
            } else {
                next = next.min(refresh_at);
            }
        }

        let config = self.config;
        let mut expired = vec![];
        for permission in self
            .permissions
            .iter_mut()
            .filter(|permission| permission.state == InstallState::Installed)
        {
            if permission.expires_at <= now {
                expired.push(permission.ip);
                continue;
            }
            next = next.min(permission.expires_at);
            if permission.refreshing {
                continue;
            }
            let refresh_at =
                config.refresh_at(permission.expires_at, config.get_permission_lifetime());
            if refresh_at > now {
                next = next.min(refresh_at);
            } else if permission.used {
                permission.used = false;
                permission.refreshing = true;
                requests.push(PendingRequest::CreatePermission {
                    peer: permission.ip,
                });
            } else {
                expired.push(permission.ip);
            }
        }
        for ip in expired {
            debug!("permission for {ip} expired unused");
            self.permissions.retain(|permission| permission.ip != ip);
            self.channels.retain(|channel| channel.peer.ip() != ip);
        }

        let mut expired_channels = vec![];
        for channel in self
            .channels
            .iter_mut()
            .filter(|channel| channel.state == InstallState::Installed)
        {
            if channel.expires_at <= now {
                expired_channels.push(channel.number);
                continue;
            }
            next = next.min(channel.expires_at);
            if channel.refreshing {
                continue;
            }
            let refresh_at = config.refresh_at(channel.expires_at, config.get_channel_lifetime());
            if refresh_at > now {
                next = next.min(refresh_at);
            } else if channel.used {
                channel.used = false;
                channel.refreshing = true;
                requests.push(PendingRequest::ChannelBind {
                    channel: channel.number,
                    peer: channel.peer,
                });
            } else {
                expired_channels.push(channel.number);
            }
        }
        self.channels
            .retain(|channel| !expired_channels.contains(&channel.number));

        for request in requests {
            self.send_or_log(request, now);
        }
        Some(next)
    }

    /// Handle a message received from the server.  `data` is a complete STUN message or
    /// ChannelData frame.
    #[tracing::instrument(
        name = "relay_handle_message",
        skip(self, data, now),
        fields(data_len = data.len())
    )]
    pub(crate) fn handle_message(&mut self, data: &[u8], now: Instant) -> RelayRecv {
        if matches!(self.state, AuthState::Error) {
            return RelayRecv::Ignored;
        }
        if data.first().is_some_and(|first| first >> 6 == 0b01) {
            return self.handle_channel(data);
        }
        let Ok(msg) = Message::from_bytes(data) else {
            trace!("not a STUN message");
            return RelayRecv::Ignored;
        };
        match self.agent.handle_stun(msg, self.server) {
            HandleStunReply::Drop => {
                trace!("dropping message");
                RelayRecv::Ignored
            }
            HandleStunReply::IncomingStun(msg) => self.handle_indication(&msg),
            HandleStunReply::ValidatedStunResponse(msg) => {
                self.handle_response(&msg, now);
                RelayRecv::Handled
            }
            HandleStunReply::UnvalidatedStunResponse(msg) => {
                // authentication errors come back without MESSAGE-INTEGRITY
                if !msg.has_class(MessageClass::Error) {
                    debug!("ignoring unvalidated success response {}", msg.transaction_id());
                    return RelayRecv::Ignored;
                }
                self.agent.remove_outstanding_request(msg.transaction_id());
                self.handle_response(&msg, now);
                RelayRecv::Handled
            }
        }
    }

    fn handle_channel(&mut self, data: &[u8]) -> RelayRecv {
        let Ok(channel_data) = ChannelData::parse(data) else {
            trace!("invalid channel data");
            return RelayRecv::Ignored;
        };
        let Some(channel) = self
            .channels
            .iter_mut()
            .find(|channel| channel.number == channel_data.id())
        else {
            debug!("data for unknown channel {:#06x}", channel_data.id());
            return RelayRecv::Ignored;
        };
        channel.used = true;
        let peer = channel.peer;
        if let Some(permission) = self.permission_mut(peer.ip()) {
            permission.used = true;
        }
        RelayRecv::PeerData {
            peer,
            range: ChannelData::HEADER_LEN..ChannelData::HEADER_LEN + channel_data.data().len(),
        }
    }

    fn handle_indication(&mut self, msg: &Message<'_>) -> RelayRecv {
        if !msg.has_class(MessageClass::Indication) || !msg.has_method(DATA) {
            trace!("ignoring {msg}");
            return RelayRecv::Ignored;
        }
        let Ok(peer) = msg.attribute::<XorPeerAddress>() else {
            debug!("data indication without XOR-PEER-ADDRESS");
            return RelayRecv::Ignored;
        };
        let peer = peer.addr(msg.transaction_id());
        let Ok((offset, data)) = msg.attribute_and_offset::<AData>() else {
            debug!("data indication without DATA");
            return RelayRecv::Ignored;
        };
        let Some(permission) = self.permission_mut(peer.ip()) else {
            debug!("data indication from {peer} without permission");
            return RelayRecv::Ignored;
        };
        permission.used = true;
        // skip the attribute header
        let start = offset + 4;
        RelayRecv::PeerData {
            peer,
            range: start..start + data.data().len(),
        }
    }

    fn handle_response(&mut self, msg: &Message<'_>, now: Instant) {
        let transaction_id = msg.transaction_id();
        match &self.state {
            AuthState::InitialSent(pending) if *pending == transaction_id => {
                self.handle_initial_response(msg, now)
            }
            AuthState::Authenticating {
                transaction_id: pending,
                ..
            } if *pending == transaction_id => self.handle_allocate_response(msg, now),
            _ => match self.pending.remove(&transaction_id) {
                Some(request) => self.handle_request_response(request, msg, now),
                None => trace!("response to unknown transaction {transaction_id}"),
            },
        }
    }

    fn handle_initial_response(&mut self, msg: &Message<'_>, now: Instant) {
        if !msg.has_class(MessageClass::Error) {
            self.fail(PortError::Protocol(
                "allocation succeeded without authentication".to_owned(),
            ));
            return;
        }
        let code = error_code(msg);
        let (Ok(realm), Ok(nonce)) = (msg.attribute::<Realm>(), msg.attribute::<Nonce>()) else {
            self.fail(PortError::Protocol(format!(
                "allocate rejected with {code} without REALM and NONCE"
            )));
            return;
        };
        if code != ErrorCode::UNAUTHORIZED && code != ErrorCode::STALE_NONCE {
            self.fail(PortError::Protocol(format!("allocate rejected with {code}")));
            return;
        }
        info!("authenticating with realm {}", realm.realm());
        let credentials = self
            .credentials
            .clone()
            .into_long_term_credentials(realm.realm());
        self.agent
            .set_remote_credentials(MessageIntegrityCredentials::LongTerm(credentials.clone()));
        if let Err(e) = self.send_allocate(credentials, nonce.nonce().to_owned(), now) {
            self.fail(PortError::Protocol(format!("failed to write allocate: {e}")));
        }
    }

    fn handle_allocate_response(&mut self, msg: &Message<'_>, now: Instant) {
        let AuthState::Authenticating {
            credentials, nonce, ..
        } = std::mem::replace(&mut self.state, AuthState::Initial)
        else {
            return;
        };
        if msg.has_class(MessageClass::Error) {
            match error_code(msg) {
                ErrorCode::STALE_NONCE => {
                    let Ok(new_nonce) = msg.attribute::<Nonce>() else {
                        self.fail(PortError::Protocol("stale nonce without NONCE".to_owned()));
                        return;
                    };
                    debug!("allocate got stale nonce, retrying");
                    if let Err(e) = self.send_allocate(credentials, new_nonce.nonce().to_owned(), now)
                    {
                        self.fail(PortError::Protocol(format!("failed to write allocate: {e}")));
                    }
                }
                ErrorCode::UNAUTHORIZED => self.fail(PortError::Authentication),
                code => self.fail(PortError::Protocol(format!("allocate rejected with {code}"))),
            }
            return;
        }

        let (Ok(relayed), Ok(lifetime)) = (
            msg.attribute::<XorRelayedAddress>(),
            msg.attribute::<Lifetime>(),
        ) else {
            self.fail(PortError::Protocol(
                "allocate response without XOR-RELAYED-ADDRESS or LIFETIME".to_owned(),
            ));
            return;
        };
        let relayed = relayed.addr(msg.transaction_id());
        let mapped = msg
            .attribute::<XorMappedAddress>()
            .map(|mapped| mapped.addr(msg.transaction_id()))
            .unwrap_or_else(|_| self.agent.local_addr());
        let lifetime = Duration::from_secs(lifetime.seconds() as u64);
        info!(
            relayed = %relayed,
            mapped = %mapped,
            "allocated, expiring in {}s",
            lifetime.as_secs()
        );
        self.allocation = Some(Allocation {
            relayed,
            lifetime,
            expires_at: now + lifetime,
            refreshing: false,
        });
        self.state = AuthState::Authenticated { credentials, nonce };
        self.events
            .push_back(RelayEvent::Allocated { relayed, mapped });
    }

    fn handle_request_response(
        &mut self,
        request: PendingRequest,
        msg: &Message<'_>,
        now: Instant,
    ) {
        let code = if msg.has_class(MessageClass::Error) {
            error_code(msg)
        } else {
            0
        };
        if code == ErrorCode::STALE_NONCE {
            if let (Ok(new_nonce), AuthState::Authenticated { nonce, .. }) =
                (msg.attribute::<Nonce>(), &mut self.state)
            {
                debug!("{request:?} got stale nonce, retrying");
                *nonce = new_nonce.nonce().to_owned();
                self.send_or_log(request, now);
                return;
            }
        }

        match request {
            PendingRequest::Refresh { lifetime: 0 } => {
                info!("deallocated with code {code}");
            }
            PendingRequest::Refresh { .. } => {
                if code != 0 {
                    warn!("refresh rejected with {code}");
                    self.fail(PortError::AllocationLost);
                    return;
                }
                let Some(allocation) = self.allocation.as_mut() else {
                    return;
                };
                if let Ok(lifetime) = msg.attribute::<Lifetime>() {
                    allocation.lifetime = Duration::from_secs(lifetime.seconds() as u64);
                }
                allocation.expires_at = now + allocation.lifetime;
                allocation.refreshing = false;
                debug!(
                    "allocation refreshed for {}s",
                    allocation.lifetime.as_secs()
                );
            }
            PendingRequest::CreatePermission { peer } => {
                if code != 0 {
                    warn!("permission for {peer} rejected with {code}");
                    self.permission_failed(peer, code);
                    return;
                }
                let lifetime = self.config.get_permission_lifetime();
                let Some(permission) = self.permission_mut(peer) else {
                    return;
                };
                permission.expires_at = now + lifetime;
                permission.refreshing = false;
                if permission.state == InstallState::Installed {
                    trace!("permission for {peer} refreshed");
                    return;
                }
                permission.state = InstallState::Installed;
                let queued = std::mem::take(&mut permission.queued);
                info!("permission for {peer} installed, {} queued", queued.len());
                self.events.push_back(RelayEvent::PermissionCreated(peer));
                if let Some(permission) = self.permission_mut(peer) {
                    permission.used |= !queued.is_empty();
                }
                for (to, data) in queued {
                    if let Err(e) = self.send_direct(to, &data) {
                        warn!("failed to send queued data to {to}: {e}");
                    }
                }
            }
            PendingRequest::ChannelBind { channel, peer } => {
                if code != 0 {
                    warn!("channel {channel:#06x} for {peer} rejected with {code}");
                    self.channels.retain(|existing| existing.number != channel);
                    return;
                }
                let lifetime = self.config.get_channel_lifetime();
                if let Some(existing) = self
                    .channels
                    .iter_mut()
                    .find(|existing| existing.number == channel)
                {
                    if existing.state == InstallState::Pending {
                        info!("channel {channel:#06x} bound to {peer}");
                    }
                    existing.state = InstallState::Installed;
                    existing.expires_at = now + lifetime;
                    existing.refreshing = false;
                }
            }
        }
    }

    fn permission_failed(&mut self, peer: IpAddr, code: u16) {
        let Some(position) = self
            .permissions
            .iter()
            .position(|permission| permission.ip == peer)
        else {
            return;
        };
        let permission = self.permissions.remove(position);
        if !permission.queued.is_empty() {
            debug!(
                "dropping {} queued packets for {peer}",
                permission.queued.len()
            );
        }
        self.channels.retain(|channel| channel.peer.ip() != peer);
        self.events
            .push_back(RelayEvent::PermissionFailed(peer, code));
    }
}

fn sign(
    mut builder: MessageWriteVec,
    credentials: &LongTermCredentials,
    nonce: &str,
) -> Result<Vec<u8>, StunError> {
    builder.add_attribute(&Username::new(credentials.username())?)?;
    builder.add_attribute(&Realm::new(credentials.realm())?)?;
    builder.add_attribute(&Nonce::new(nonce)?)?;
    builder.add_message_integrity(
        &MessageIntegrityCredentials::LongTerm(credentials.clone()),
        IntegrityAlgorithm::Sha1,
    )?;
    Ok(builder.finish())
}

fn error_code(msg: &Message<'_>) -> u16 {
    msg.attribute::<ErrorCode>()
        .map(|error| error.code())
        .unwrap_or(ErrorCode::BAD_REQUEST)
}
