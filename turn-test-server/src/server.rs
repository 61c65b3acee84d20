// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A TURN server that can handle UDP and TCP clients.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rand::Rng;
use stun_proto::agent::{StunError, Transmit};
use stun_proto::types::attribute::{
    ErrorCode, MessageIntegrity, Nonce, Realm, Username, XorMappedAddress,
};
use stun_proto::types::message::{
    IntegrityAlgorithm, LongTermCredentials, Message, MessageClass, MessageIntegrityCredentials,
    MessageType, MessageWrite, MessageWriteExt, MessageWriteVec, Method, TransactionId, BINDING,
};
use stun_proto::types::prelude::{Attribute, AttributeFromRaw, AttributeStaticType};
use stun_proto::types::TransportType;

use relay_types::attribute::Data as AData;
use relay_types::attribute::{
    ChannelNumber, Lifetime, RequestedTransport, XorPeerAddress, XorRelayedAddress,
};
use relay_types::channel::ChannelData;
use relay_types::message::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, DATA, REFRESH, SEND};
use relay_types::TurnCredentials;

use tracing::{debug, info, trace, warn};

const PERMISSION_DURATION: Duration = Duration::from_secs(300);
const CHANNEL_DURATION: Duration = Duration::from_secs(600);
const FORBIDDEN: u16 = 403;

/// Configuration of a [`TurnServer`].
#[derive(Debug, Clone)]
pub struct TurnServerConfig {
    realm: String,
    nonce_expiry: Duration,
    default_lifetime: Duration,
    max_lifetime: Duration,
    one_time_nonce: bool,
}

impl TurnServerConfig {
    /// A configuration for `realm` with a one hour nonce expiry and a 10 minute default
    /// allocation lifetime.
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_owned(),
            nonce_expiry: Duration::from_secs(3600),
            default_lifetime: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            one_time_nonce: false,
        }
    }

    /// Only accept each nonce for a single request.  Every further request is answered with 438
    /// (Stale Nonce) and a fresh nonce.
    pub fn one_time_nonce(mut self, one_time_nonce: bool) -> Self {
        self.one_time_nonce = one_time_nonce;
        self
    }

    /// How long a nonce stays valid.
    pub fn nonce_expiry(mut self, expiry: Duration) -> Self {
        self.nonce_expiry = expiry;
        self
    }

    /// The lifetime granted when a request does not contain a LIFETIME and the upper bound of
    /// any requested lifetime.
    pub fn lifetimes(mut self, default_lifetime: Duration, max_lifetime: Duration) -> Self {
        self.default_lifetime = default_lifetime;
        self.max_lifetime = max_lifetime.max(default_lifetime);
        self
    }

    /// The configured realm.
    pub fn realm(&self) -> &str {
        &self.realm
    }
}

/// Return value for [`TurnServer::poll`].
#[derive(Debug)]
pub enum TurnServerPollRet {
    /// Wait until the specified time before calling poll() again.
    WaitUntil(Instant),
    /// Allocate a UDP socket for the client identified by its 5-tuple and report the result
    /// with [`TurnServer::allocated_udp_socket`].
    AllocateSocketUdp {
        /// The transport of the client asking for an allocation.
        transport: TransportType,
        /// The server address the client sent the Allocate request to.
        local_addr: SocketAddr,
        /// The client address.
        remote_addr: SocketAddr,
    },
}

/// Errors that can be conveyed when allocating a socket for a client.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum SocketAllocateError {
    /// The requested address family is not supported.
    #[error("The address family is not supported.")]
    AddressFamilyNotSupported,
    /// The server does not have the capacity to handle this request.
    #[error("The server does not have the capacity to handle this request.")]
    InsufficientCapacity,
}

/// A TURN server.
#[derive(Debug)]
pub struct TurnServer {
    config: TurnServerConfig,
    listeners: Vec<(TransportType, SocketAddr)>,
    // username -> password
    users: HashMap<String, String>,
    denied_peers: Vec<IpAddr>,

    clients: Vec<Client>,
    nonces: Vec<NonceData>,
    pending_allocates: VecDeque<PendingAllocate>,
    pending_transmits: VecDeque<Transmit<Vec<u8>>>,
}

#[derive(Debug)]
struct PendingAllocate {
    transport: TransportType,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    credentials: LongTermCredentials,
    transaction_id: TransactionId,
    lifetime: Duration,
    asked: bool,
}

#[derive(Debug)]
struct NonceData {
    nonce: String,
    expires_at: Instant,

    transport: TransportType,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
}

#[derive(Debug)]
struct Client {
    transport: TransportType,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    credentials: LongTermCredentials,

    // the peer facing address of the allocation
    relayed: SocketAddr,
    expires_at: Instant,
    permissions: Vec<Permission>,
    channels: Vec<Channel>,
}

#[derive(Debug)]
struct Permission {
    addr: IpAddr,
    expires_at: Instant,
}

#[derive(Debug)]
struct Channel {
    id: u16,
    peer_addr: SocketAddr,
    expires_at: Instant,
}

impl Client {
    fn is_5tuple(&self, ttype: TransportType, local: SocketAddr, remote: SocketAddr) -> bool {
        self.transport == ttype && self.local_addr == local && self.remote_addr == remote
    }

    fn have_permission(&self, addr: IpAddr, now: Instant) -> bool {
        self.permissions
            .iter()
            .any(|permission| permission.addr == addr && permission.expires_at >= now)
    }

    fn install_permission(&mut self, addr: IpAddr, now: Instant) {
        if let Some(existing) = self.permissions.iter_mut().find(|perm| perm.addr == addr) {
            existing.expires_at = now + PERMISSION_DURATION;
        } else {
            self.permissions.push(Permission {
                addr,
                expires_at: now + PERMISSION_DURATION,
            });
        }
    }
}

/// An attribute to add to a reply.
#[derive(Debug)]
enum ReplyAttribute {
    ErrorCode(u16),
    Realm(String),
    Nonce(String),
    Lifetime(u32),
    XorRelayedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
}

/// A response under construction, written out by [`Reply::finish`].
#[derive(Debug)]
struct Reply {
    mtype: MessageType,
    transaction_id: TransactionId,
    attributes: Vec<ReplyAttribute>,
    integrity: Option<LongTermCredentials>,
}

impl Reply {
    fn new(class: MessageClass, method: Method, transaction_id: TransactionId) -> Self {
        Self {
            mtype: MessageType::from_class_method(class, method),
            transaction_id,
            attributes: vec![],
            integrity: None,
        }
    }

    fn success(msg: &Message<'_>) -> Self {
        Self::new(MessageClass::Success, msg.method(), msg.transaction_id())
    }

    fn error(msg: &Message<'_>, code: u16) -> Self {
        Self::new(MessageClass::Error, msg.method(), msg.transaction_id())
            .attribute(ReplyAttribute::ErrorCode(code))
    }

    fn attribute(mut self, attribute: ReplyAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    fn signed(mut self, credentials: &LongTermCredentials) -> Self {
        self.integrity = Some(credentials.clone());
        self
    }

    fn finish(self) -> Result<Vec<u8>, StunError> {
        let transaction_id = self.transaction_id;
        let mut builder = Message::builder(self.mtype, transaction_id, MessageWriteVec::new());
        for attribute in self.attributes {
            match attribute {
                ReplyAttribute::ErrorCode(code) => {
                    builder.add_attribute(&ErrorCode::builder(code).build()?)?
                }
                ReplyAttribute::Realm(realm) => builder.add_attribute(&Realm::new(&realm)?)?,
                ReplyAttribute::Nonce(nonce) => builder.add_attribute(&Nonce::new(&nonce)?)?,
                ReplyAttribute::Lifetime(seconds) => {
                    builder.add_attribute(&Lifetime::new(seconds))?
                }
                ReplyAttribute::XorRelayedAddress(addr) => {
                    builder.add_attribute(&XorRelayedAddress::new(addr, transaction_id))?
                }
                ReplyAttribute::XorMappedAddress(addr) => {
                    builder.add_attribute(&XorMappedAddress::new(addr, transaction_id))?
                }
            }
        }
        if let Some(credentials) = self.integrity {
            builder.add_message_integrity(
                &MessageIntegrityCredentials::LongTerm(credentials),
                IntegrityAlgorithm::Sha1,
            )?;
        }
        builder.add_fingerprint()?;
        Ok(builder.finish())
    }
}

impl TurnServer {
    /// Construct a new [`TurnServer`] without any listening addresses or users.
    ///
    /// # Examples
    /// ```
    /// # use turn_test_server::{TurnServer, TurnServerConfig};
    /// # use stun_proto::types::TransportType;
    /// let listen_addr = "10.0.0.1:3478".parse().unwrap();
    /// let mut server = TurnServer::new(TurnServerConfig::new("realm"));
    /// server.add_listener(TransportType::Udp, listen_addr);
    /// assert!(server.is_listening(TransportType::Udp, listen_addr));
    /// ```
    pub fn new(config: TurnServerConfig) -> Self {
        Self {
            config,
            listeners: vec![],
            users: HashMap::default(),
            denied_peers: vec![],
            clients: vec![],
            nonces: vec![],
            pending_allocates: VecDeque::default(),
            pending_transmits: VecDeque::default(),
        }
    }

    /// Accept clients connecting over `transport` to `addr`.
    pub fn add_listener(&mut self, transport: TransportType, addr: SocketAddr) {
        if !self.is_listening(transport, addr) {
            self.listeners.push((transport, addr));
        }
    }

    /// Whether clients are accepted over `transport` to `addr`.
    pub fn is_listening(&self, transport: TransportType, addr: SocketAddr) -> bool {
        self.listeners.contains(&(transport, addr))
    }

    /// Add a user that will be accepted by this server.
    pub fn add_user(&mut self, username: String, password: String) {
        self.users.insert(username, password);
    }

    /// Refuse CreatePermission and ChannelBind requests for `peer` with 403 (Forbidden).
    pub fn deny_peer(&mut self, peer: IpAddr) {
        self.denied_peers.push(peer);
    }

    /// The relayed addresses of the currently existing allocations.
    pub fn relayed_addresses(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.clients.iter().map(|client| client.relayed)
    }

    /// Whether the allocation at `relayed` has a permission for `peer`.
    pub fn has_permission(&self, relayed: SocketAddr, peer: IpAddr, now: Instant) -> bool {
        self.clients
            .iter()
            .any(|client| client.relayed == relayed && client.have_permission(peer, now))
    }

    /// Whether the allocation at `relayed` has a channel bound to `peer`.
    pub fn has_channel(&self, relayed: SocketAddr, peer: SocketAddr) -> bool {
        self.clients.iter().any(|client| {
            client.relayed == relayed
                && client
                    .channels
                    .iter()
                    .any(|channel| channel.peer_addr == peer)
        })
    }

    fn generate_nonce() -> String {
        let mut rng = rand::rng();
        String::from_iter((0..16).map(|_| rng.sample(rand::distr::Alphanumeric) as char))
    }

    fn current_nonce(
        &mut self,
        ttype: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        now: Instant,
    ) -> String {
        let expiry = self.config.nonce_expiry;
        if let Some(nonce_data) = self.nonces.iter_mut().find(|nonce| {
            nonce.transport == ttype && nonce.remote_addr == from && nonce.local_addr == to
        }) {
            if nonce_data.expires_at < now {
                nonce_data.nonce = Self::generate_nonce();
                nonce_data.expires_at = now + expiry;
            }
            return nonce_data.nonce.clone();
        }
        let nonce = Self::generate_nonce();
        self.nonces.push(NonceData {
            nonce: nonce.clone(),
            expires_at: now + expiry,
            transport: ttype,
            remote_addr: from,
            local_addr: to,
        });
        nonce
    }

    fn consume_nonce(&mut self, ttype: TransportType, from: SocketAddr, to: SocketAddr) {
        if let Some(nonce_data) = self.nonces.iter_mut().find(|nonce| {
            nonce.transport == ttype && nonce.remote_addr == from && nonce.local_addr == to
        }) {
            nonce_data.nonce = Self::generate_nonce();
        }
    }

    // Long-term credential checks of RFC5389 section 10.2.2.
    fn authenticate(
        &mut self,
        msg: &Message<'_>,
        ttype: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        now: Instant,
    ) -> Result<LongTermCredentials, Reply> {
        let realm = self.config.realm.clone();
        if msg.attribute::<MessageIntegrity>().is_err() {
            let nonce = self.current_nonce(ttype, from, to, now);
            trace!("no message-integrity, returning unauthorized with nonce: {nonce}");
            return Err(Reply::error(msg, ErrorCode::UNAUTHORIZED)
                .attribute(ReplyAttribute::Realm(realm))
                .attribute(ReplyAttribute::Nonce(nonce)));
        }

        let username = msg.attribute::<Username>().ok();
        let msg_realm = msg.attribute::<Realm>().ok();
        let msg_nonce = msg.attribute::<Nonce>().ok();
        let Some(((username, _realm), msg_nonce)) = username.zip(msg_realm).zip(msg_nonce) else {
            trace!("bad request due to missing username, realm, nonce");
            return Err(Reply::error(msg, ErrorCode::BAD_REQUEST));
        };

        let nonce = self.current_nonce(ttype, from, to, now);
        if nonce != msg_nonce.nonce() {
            debug!("stale nonce");
            return Err(Reply::error(msg, ErrorCode::STALE_NONCE)
                .attribute(ReplyAttribute::Realm(realm))
                .attribute(ReplyAttribute::Nonce(nonce)));
        }

        let password = self.users.get(username.username());
        let credentials = TurnCredentials::new(
            username.username(),
            password.map_or("", |pass| pass.as_str()),
        )
        .into_long_term_credentials(&realm);
        if password.is_none()
            || msg
                .validate_integrity(&MessageIntegrityCredentials::LongTerm(credentials.clone()))
                .is_err()
        {
            debug!("integrity check failed for user {}", username.username());
            return Err(Reply::error(msg, ErrorCode::UNAUTHORIZED)
                .attribute(ReplyAttribute::Realm(realm))
                .attribute(ReplyAttribute::Nonce(nonce)));
        }

        // Requests for an existing allocation must come from the user that created it.
        if let Some(client) = self
            .clients
            .iter()
            .find(|client| client.is_5tuple(ttype, to, from))
        {
            if client.credentials.username() != username.username() {
                return Err(
                    Reply::error(msg, ErrorCode::WRONG_CREDENTIALS).signed(&client.credentials)
                );
            }
        }

        if self.config.one_time_nonce {
            self.consume_nonce(ttype, from, to);
        }

        Ok(credentials)
    }

    fn client_index(&self, ttype: TransportType, local: SocketAddr, remote: SocketAddr) -> Option<usize> {
        self.clients
            .iter()
            .position(|client| client.is_5tuple(ttype, local, remote))
    }

    fn handle_binding(&self, msg: &Message<'_>, from: SocketAddr) -> Reply {
        Reply::success(msg).attribute(ReplyAttribute::XorMappedAddress(from))
    }

    fn requested_lifetime(&self, msg: &Message<'_>) -> Duration {
        msg.attribute::<Lifetime>()
            .map(|lifetime| Duration::from_secs(lifetime.seconds() as u64))
            .unwrap_or(self.config.default_lifetime)
            .min(self.config.max_lifetime)
    }

    fn handle_allocate(
        &mut self,
        msg: &Message<'_>,
        ttype: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        now: Instant,
    ) -> Option<Reply> {
        let credentials = match self.authenticate(msg, ttype, from, to, now) {
            Ok(credentials) => credentials,
            Err(reply) => return Some(reply),
        };

        if self.client_index(ttype, to, from).is_some() {
            return Some(Reply::error(msg, ErrorCode::ALLOCATION_MISMATCH).signed(&credentials));
        }

        let Ok(requested_transport) = msg.attribute::<RequestedTransport>() else {
            return Some(Reply::error(msg, ErrorCode::BAD_REQUEST).signed(&credentials));
        };
        if requested_transport.protocol() != RequestedTransport::UDP {
            return Some(
                Reply::error(msg, ErrorCode::UNSUPPORTED_TRANSPORT_PROTOCOL).signed(&credentials),
            );
        }

        if self.pending_allocates.iter().any(|pending| {
            pending.transport == ttype && pending.local_addr == to && pending.remote_addr == from
        }) {
            trace!("allocation already pending");
            return None;
        }

        debug!("have new pending ALLOCATE from client {ttype} from {from} to {to}");
        let lifetime = self.requested_lifetime(msg);
        self.pending_allocates.push_back(PendingAllocate {
            transport: ttype,
            local_addr: to,
            remote_addr: from,
            credentials,
            transaction_id: msg.transaction_id(),
            lifetime,
            asked: false,
        });
        None
    }

    fn handle_refresh(
        &mut self,
        msg: &Message<'_>,
        ttype: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        now: Instant,
    ) -> Reply {
        let credentials = match self.authenticate(msg, ttype, from, to, now) {
            Ok(credentials) => credentials,
            Err(reply) => return reply,
        };
        let Some(idx) = self.client_index(ttype, to, from) else {
            return Reply::error(msg, ErrorCode::ALLOCATION_MISMATCH).signed(&credentials);
        };

        let lifetime = self.requested_lifetime(msg);
        if lifetime.is_zero() {
            let client = self.clients.remove(idx);
            info!(
                "removed allocation {} of client {ttype} from {from} to {to}",
                client.relayed
            );
        } else {
            self.clients[idx].expires_at = now + lifetime;
            info!("refreshed allocation {ttype} from {from} to {to} for {lifetime:?}");
        }

        Reply::success(msg)
            .attribute(ReplyAttribute::Lifetime(lifetime.as_secs() as u32))
            .signed(&credentials)
    }

    fn handle_create_permission(
        &mut self,
        msg: &Message<'_>,
        ttype: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        now: Instant,
    ) -> Reply {
        let credentials = match self.authenticate(msg, ttype, from, to, now) {
            Ok(credentials) => credentials,
            Err(reply) => return reply,
        };
        let Some(idx) = self.client_index(ttype, to, from) else {
            return Reply::error(msg, ErrorCode::ALLOCATION_MISMATCH).signed(&credentials);
        };

        let mut peers = vec![];
        for (_offset, raw) in msg
            .iter_attributes()
            .filter(|(_offset, attr)| attr.get_type() == XorPeerAddress::TYPE)
        {
            let Ok(peer) = XorPeerAddress::from_raw(raw) else {
                return Reply::error(msg, ErrorCode::BAD_REQUEST).signed(&credentials);
            };
            peers.push(peer.addr(msg.transaction_id()).ip());
        }
        if peers.is_empty() {
            return Reply::error(msg, ErrorCode::BAD_REQUEST).signed(&credentials);
        }

        let client = &mut self.clients[idx];
        if client.expires_at < now {
            trace!("allocation has expired");
            return Reply::error(msg, ErrorCode::ALLOCATION_MISMATCH).signed(&credentials);
        }
        if peers
            .iter()
            .any(|peer| peer.is_ipv4() != client.relayed.is_ipv4())
        {
            return Reply::error(msg, ErrorCode::PEER_ADDRESS_FAMILY_MISMATCH)
                .signed(&credentials);
        }
        if peers.iter().any(|peer| self.denied_peers.contains(peer)) {
            debug!("refusing permission for {peers:?}");
            return Reply::error(msg, FORBIDDEN).signed(&credentials);
        }

        for peer in peers.iter() {
            client.install_permission(*peer, now);
        }
        debug!(
            "allocation {} created permission for {peers:?}",
            client.relayed
        );
        Reply::success(msg).signed(&credentials)
    }

    fn handle_channel_bind(
        &mut self,
        msg: &Message<'_>,
        ttype: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        now: Instant,
    ) -> Reply {
        let credentials = match self.authenticate(msg, ttype, from, to, now) {
            Ok(credentials) => credentials,
            Err(reply) => return reply,
        };
        let Some(idx) = self.client_index(ttype, to, from) else {
            return Reply::error(msg, ErrorCode::ALLOCATION_MISMATCH).signed(&credentials);
        };

        let peer_addr = msg
            .attribute::<XorPeerAddress>()
            .ok()
            .map(|peer| peer.addr(msg.transaction_id()));
        let channel = msg.attribute::<ChannelNumber>().ok();
        let (Some(peer_addr), Some(channel)) = (peer_addr, channel) else {
            trace!("missing peer address or channel number");
            return Reply::error(msg, ErrorCode::BAD_REQUEST).signed(&credentials);
        };
        if !channel.is_bindable() {
            trace!("channel number out of range");
            return Reply::error(msg, ErrorCode::BAD_REQUEST).signed(&credentials);
        }
        if self.denied_peers.contains(&peer_addr.ip()) {
            return Reply::error(msg, FORBIDDEN).signed(&credentials);
        }

        let client = &mut self.clients[idx];
        if client.expires_at < now {
            return Reply::error(msg, ErrorCode::ALLOCATION_MISMATCH).signed(&credentials);
        }
        if peer_addr.is_ipv4() != client.relayed.is_ipv4() {
            return Reply::error(msg, ErrorCode::PEER_ADDRESS_FAMILY_MISMATCH)
                .signed(&credentials);
        }
        // a channel number and a peer address can only be bound to each other
        if client.channels.iter().any(|existing| {
            (existing.id == channel.channel()) != (existing.peer_addr == peer_addr)
        }) {
            trace!("channel or peer address already bound differently");
            return Reply::error(msg, ErrorCode::BAD_REQUEST).signed(&credentials);
        }

        if let Some(existing) = client
            .channels
            .iter_mut()
            .find(|existing| existing.id == channel.channel())
        {
            existing.expires_at = now + CHANNEL_DURATION;
        } else {
            client.channels.push(Channel {
                id: channel.channel(),
                peer_addr,
                expires_at: now + CHANNEL_DURATION,
            });
        }
        client.install_permission(peer_addr.ip(), now);
        debug!(
            "allocation {} bound channel {:#06x} to {peer_addr}",
            client.relayed,
            channel.channel()
        );
        Reply::success(msg).signed(&credentials)
    }

    fn handle_send_indication(
        &mut self,
        msg: &Message<'_>,
        ttype: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        now: Instant,
    ) -> Option<Transmit<Vec<u8>>> {
        let peer_addr = msg
            .attribute::<XorPeerAddress>()
            .ok()?
            .addr(msg.transaction_id());
        let idx = self.client_index(ttype, to, from)?;
        let client = &self.clients[idx];
        if client.expires_at < now {
            debug!("allocation {} expired", client.relayed);
            return None;
        }
        if !client.have_permission(peer_addr.ip(), now) {
            trace!("no permission for {peer_addr}, dropping");
            return None;
        }
        let data = msg.attribute::<AData>().ok()?;
        trace!("forwarding {} bytes to {peer_addr}", data.data().len());
        Some(Transmit::new(
            data.data().to_vec(),
            TransportType::Udp,
            client.relayed,
            peer_addr,
        ))
    }

    fn handle_channel_data(
        &mut self,
        data: &[u8],
        ttype: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        now: Instant,
    ) -> Option<Transmit<Vec<u8>>> {
        let Some(idx) = self.client_index(ttype, to, from) else {
            trace!("no client for {} bytes over {ttype} from {from}", data.len());
            return None;
        };
        let channel = ChannelData::parse(data).ok()?;
        let client = &self.clients[idx];
        let Some(existing) = client
            .channels
            .iter()
            .find(|existing| existing.id == channel.id() && existing.expires_at >= now)
        else {
            warn!("no channel {:#06x} for client {from}", channel.id());
            return None;
        };
        if !client.have_permission(existing.peer_addr.ip(), now) {
            trace!("permission for {} expired", existing.peer_addr);
            return None;
        }
        Some(Transmit::new(
            channel.data().to_vec(),
            TransportType::Udp,
            client.relayed,
            existing.peer_addr,
        ))
    }

    // data from a peer arriving at the relayed address of `idx`
    fn relay_to_client(
        &self,
        idx: usize,
        peer: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Option<Transmit<Vec<u8>>> {
        let client = &self.clients[idx];
        if !client.have_permission(peer.ip(), now) {
            trace!("no permission for peer {peer}, dropping");
            return None;
        }

        let bytes = if let Some(channel) = client
            .channels
            .iter()
            .find(|channel| channel.peer_addr == peer && channel.expires_at >= now)
        {
            trace!("using channel {:#06x} for {peer}", channel.id);
            ChannelData::new(channel.id, data).to_vec(client.transport == TransportType::Tcp)
        } else {
            let transaction_id = TransactionId::generate();
            let mut builder = Message::builder(
                MessageType::from_class_method(MessageClass::Indication, DATA),
                transaction_id,
                MessageWriteVec::new(),
            );
            let peer_address = XorPeerAddress::new(peer, transaction_id);
            let Some(data) = AData::new(data) else {
                warn!("{} bytes from {peer} are too large to relay", data.len());
                return None;
            };
            if let Err(e) = builder
                .add_attribute(&peer_address)
                .and_then(|_| builder.add_attribute(&data))
            {
                warn!("failed to build data indication: {e}");
                return None;
            }
            builder.finish()
        };

        Some(Transmit::new(
            bytes,
            client.transport,
            client.local_addr,
            client.remote_addr,
        ))
    }

    #[tracing::instrument(
        name = "turn_server_handle_stun",
        skip(self, msg, ttype, from, to, now),
        fields(
            msg.transaction = %msg.transaction_id(),
            msg.method = %msg.method(),
        )
    )]
    fn handle_stun(
        &mut self,
        msg: &Message<'_>,
        ttype: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        now: Instant,
    ) -> Option<Transmit<Vec<u8>>> {
        trace!("received STUN message {msg}");
        if msg.has_class(MessageClass::Indication) {
            if msg.has_method(SEND) {
                return self.handle_send_indication(msg, ttype, from, to, now);
            }
            trace!("ignoring indication");
            return None;
        }
        if !msg.has_class(MessageClass::Request) {
            trace!("ignoring response");
            return None;
        }

        let reply = match msg.method() {
            BINDING => Some(self.handle_binding(msg, from)),
            ALLOCATE => self.handle_allocate(msg, ttype, from, to, now),
            REFRESH => Some(self.handle_refresh(msg, ttype, from, to, now)),
            CREATE_PERMISSION => Some(self.handle_create_permission(msg, ttype, from, to, now)),
            CHANNEL_BIND => Some(self.handle_channel_bind(msg, ttype, from, to, now)),
            _ => Some(Reply::error(msg, ErrorCode::BAD_REQUEST)),
        }?;
        match reply.finish() {
            Ok(data) => Some(Transmit::new(data, ttype, to, from)),
            Err(e) => {
                warn!("failed to write reply: {e}");
                None
            }
        }
    }

    /// Provide received data to the [`TurnServer`].
    ///
    /// `transmit` is either a datagram received on a listening or relayed UDP socket, or a
    /// single complete STUN message or channel data frame read from a client TCP stream.  Any
    /// returned transmission must be sent from `transmit.from` to `transmit.to` over its
    /// transport.
    #[tracing::instrument(
        name = "turn_server_recv",
        skip(self, transmit, now),
        fields(
            transport = %transmit.transport,
            remote_addr = %transmit.from,
            local_addr = %transmit.to,
            data_len = transmit.data.as_ref().len(),
        )
    )]
    pub fn recv<T: AsRef<[u8]>>(
        &mut self,
        transmit: Transmit<T>,
        now: Instant,
    ) -> Option<Transmit<Vec<u8>>> {
        let data = transmit.data.as_ref();
        if transmit.transport == TransportType::Udp {
            if let Some(idx) = self
                .clients
                .iter()
                .position(|client| client.relayed == transmit.to && client.expires_at >= now)
            {
                return self.relay_to_client(idx, transmit.from, data, now);
            }
        }

        if !self.is_listening(transmit.transport, transmit.to) {
            trace!("not listening on {}", transmit.to);
            return None;
        }

        match Message::from_bytes(data) {
            Ok(msg) => self.handle_stun(
                &msg,
                transmit.transport,
                transmit.from,
                transmit.to,
                now,
            ),
            Err(_) => self.handle_channel_data(
                data,
                transmit.transport,
                transmit.from,
                transmit.to,
                now,
            ),
        }
    }

    /// Poll the [`TurnServer`] in order to make further progress.
    #[tracing::instrument(level = "trace", name = "turn_server_poll", skip(self), ret)]
    pub fn poll(&mut self, now: Instant) -> TurnServerPollRet {
        if let Some(pending) = self.pending_allocates.iter_mut().find(|pending| !pending.asked) {
            pending.asked = true;
            return TurnServerPollRet::AllocateSocketUdp {
                transport: pending.transport,
                local_addr: pending.local_addr,
                remote_addr: pending.remote_addr,
            };
        }

        self.clients.retain_mut(|client| {
            if client.expires_at < now {
                info!("allocation {} expired", client.relayed);
                return false;
            }
            client
                .permissions
                .retain(|permission| permission.expires_at >= now);
            client.channels.retain(|channel| channel.expires_at >= now);
            true
        });

        let next = self
            .clients
            .iter()
            .map(|client| client.expires_at)
            .chain(
                self.clients
                    .iter()
                    .flat_map(|client| client.permissions.iter().map(|perm| perm.expires_at)),
            )
            .min()
            .unwrap_or(now + Duration::from_secs(60));
        TurnServerPollRet::WaitUntil(next.max(now))
    }

    /// Poll for a new Transmit to send over a socket.
    pub fn poll_transmit(&mut self, _now: Instant) -> Option<Transmit<Vec<u8>>> {
        self.pending_transmits.pop_front()
    }

    /// Report the result of a [`TurnServerPollRet::AllocateSocketUdp`].
    #[tracing::instrument(name = "turn_server_allocated_udp_socket", skip(self, now))]
    pub fn allocated_udp_socket(
        &mut self,
        transport: TransportType,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        socket_addr: Result<SocketAddr, SocketAllocateError>,
        now: Instant,
    ) {
        let Some(position) = self.pending_allocates.iter().position(|pending| {
            pending.transport == transport
                && pending.local_addr == local_addr
                && pending.remote_addr == remote_addr
        }) else {
            warn!("no pending allocation for {transport} from {remote_addr} to {local_addr}");
            return;
        };
        let Some(pending) = self.pending_allocates.remove(position) else {
            return;
        };

        let reply = match socket_addr {
            Ok(relayed) => {
                info!("allocated {relayed} for {transport} from {remote_addr} to {local_addr}");
                self.clients.push(Client {
                    transport,
                    local_addr,
                    remote_addr,
                    credentials: pending.credentials.clone(),
                    relayed,
                    expires_at: now + pending.lifetime,
                    permissions: vec![],
                    channels: vec![],
                });
                Reply::new(MessageClass::Success, ALLOCATE, pending.transaction_id)
                    .attribute(ReplyAttribute::XorRelayedAddress(relayed))
                    .attribute(ReplyAttribute::Lifetime(pending.lifetime.as_secs() as u32))
                    .attribute(ReplyAttribute::XorMappedAddress(remote_addr))
            }
            Err(e) => {
                warn!("failed to allocate socket: {e}");
                let code = match e {
                    SocketAllocateError::AddressFamilyNotSupported => {
                        ErrorCode::ADDRESS_FAMILY_NOT_SUPPORTED
                    }
                    SocketAllocateError::InsufficientCapacity => ErrorCode::INSUFFICIENT_CAPACITY,
                };
                Reply::new(MessageClass::Error, ALLOCATE, pending.transaction_id)
                    .attribute(ReplyAttribute::ErrorCode(code))
            }
        };
        match reply.signed(&pending.credentials).finish() {
            Ok(data) => self.pending_transmits.push_back(Transmit::new(
                data,
                transport,
                local_addr,
                remote_addr,
            )),
            Err(e) => warn!("failed to write allocate reply: {e}"),
        }
    }
}
