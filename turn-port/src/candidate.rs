// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Addresses, credentials and candidates produced and consumed by a port.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use rand::Rng;
use stun_proto::types::message::ShortTermCredentials;
use stun_proto::types::TransportType;

pub use relay_types::TurnCredentials as RelayCredentials;

/// The protocol used to reach a server or a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolType {
    /// UDP.
    Udp,
    /// TCP.
    Tcp,
    /// TLS over TCP.  Not supported for transporting data and rejected when preparing a port.
    SslTcp,
}

impl ProtocolType {
    /// The transport this protocol is carried over, if supported.
    pub fn transport(self) -> Option<TransportType> {
        match self {
            Self::Udp => Some(TransportType::Udp),
            Self::Tcp => Some(TransportType::Tcp),
            Self::SslTcp => None,
        }
    }
}

impl From<TransportType> for ProtocolType {
    fn from(value: TransportType) -> Self {
        match value {
            TransportType::Udp => Self::Udp,
            TransportType::Tcp => Self::Tcp,
        }
    }
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => f.write_str("udp"),
            Self::Tcp => f.write_str("tcp"),
            Self::SslTcp => f.write_str("ssltcp"),
        }
    }
}

/// Errors when parsing addresses and protocols from strings.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressParseError {
    /// The protocol is not one of `udp`, `tcp` or `ssltcp`.
    #[error("Unknown protocol {0}")]
    UnknownProtocol(String),
    /// No `:port` suffix was present.
    #[error("The address is missing a port")]
    MissingPort,
    /// The port could not be parsed.
    #[error("Invalid port {0}")]
    InvalidPort(String),
    /// The host part is empty.
    #[error("The address is missing a host")]
    EmptyHost,
}

impl FromStr for ProtocolType {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            "ssltcp" | "tls" => Ok(Self::SslTcp),
            _ => Err(AddressParseError::UnknownProtocol(s.to_owned())),
        }
    }
}

/// The host and port of a server, either as an IP address or as a name that still needs to be
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddress {
    /// A literal IP address.
    Resolved(SocketAddr),
    /// A host name that must be resolved before use.
    Unresolved {
        /// The host name.
        host: String,
        /// The port.
        port: u16,
    },
}

impl ServerAddress {
    /// The port of the server.
    pub fn port(&self) -> u16 {
        match self {
            Self::Resolved(addr) => addr.port(),
            Self::Unresolved { port, .. } => *port,
        }
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(value: SocketAddr) -> Self {
        Self::Resolved(value)
    }
}

impl FromStr for ServerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Resolved(addr));
        }
        let (host, port) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost);
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError::InvalidPort(port.to_owned()))?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::Resolved(SocketAddr::new(ip, port)));
        }
        Ok(Self::Unresolved {
            host: host.to_owned(),
            port,
        })
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved(addr) => write!(f, "{addr}"),
            Self::Unresolved { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// An address together with the protocol used to reach it.
///
/// # Examples
///
/// ```
/// # use turn_port::candidate::{ProtocolAddress, ProtocolType, ServerAddress};
/// let server = ProtocolAddress::new("turn.example.org:3478".parse().unwrap(), ProtocolType::Tcp);
/// assert_eq!(server.protocol(), ProtocolType::Tcp);
/// assert!(matches!(server.address(), ServerAddress::Unresolved { .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    address: ServerAddress,
    protocol: ProtocolType,
}

impl ProtocolAddress {
    /// Construct a new [`ProtocolAddress`].
    pub fn new(address: ServerAddress, protocol: ProtocolType) -> Self {
        Self { address, protocol }
    }

    /// The host and port.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The protocol.
    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }
}

impl std::fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

/// Parses `protocol://host:port`, the inverse of the [`Display`](std::fmt::Display)
/// implementation.
impl FromStr for ProtocolAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, address) = s
            .split_once("://")
            .ok_or_else(|| AddressParseError::UnknownProtocol(String::new()))?;
        Ok(Self {
            address: address.parse()?,
            protocol: protocol.parse()?,
        })
    }
}

const ICE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/";

fn random_ice_string(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ICE_ALPHABET[rng.random_range(0..ICE_ALPHABET.len())] as char)
        .collect()
}

/// The ICE username fragment and password of one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    /// The username fragment.
    pub ufrag: String,
    /// The password.
    pub pwd: String,
}

impl IceCredentials {
    /// Construct a new set of [`IceCredentials`].
    pub fn new(ufrag: &str, pwd: &str) -> Self {
        Self {
            ufrag: ufrag.to_owned(),
            pwd: pwd.to_owned(),
        }
    }

    /// Random credentials with a 4 character username fragment and a 22 character password.
    pub fn generate() -> Self {
        Self {
            ufrag: random_ice_string(4),
            pwd: random_ice_string(22),
        }
    }
}

impl From<&IceCredentials> for ShortTermCredentials {
    fn from(value: &IceCredentials) -> Self {
        ShortTermCredentials::new(value.pwd.clone())
    }
}

/// The kind of a [`Candidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// An address of a local socket.
    Host,
    /// An address allocated on a TURN server.
    Relay,
}

impl CandidateType {
    /// The RFC 5245 type preference.
    pub fn type_preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::Relay => 0,
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Relay => f.write_str("relay"),
        }
    }
}

/// Where a remote candidate used to create a connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateOrigin {
    /// A candidate of this same port.
    ThisPort,
    /// A candidate of another local port.
    OtherPort,
    /// A candidate learned from the remote peer through signalling.
    Message,
}

const LOCAL_PREFERENCE: u32 = 65535;
const COMPONENT: u32 = 1;

/// A transport address that can be used to exchange data with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The address.
    pub address: SocketAddr,
    /// The protocol data is exchanged with.
    pub protocol: ProtocolType,
    /// The RFC 5245 priority.
    pub priority: u32,
    /// Candidates sharing a foundation share a base, type and server.
    pub foundation: String,
    /// For relay candidates the address the server saw the allocation request from.
    pub related_address: Option<SocketAddr>,
    /// The type.
    pub candidate_type: CandidateType,
    /// The ICE username fragment of the side owning this candidate.
    pub username: String,
    /// The ICE password of the side owning this candidate.
    pub password: String,
}

impl Candidate {
    /// A host candidate for a local socket.
    pub fn host(address: SocketAddr, protocol: ProtocolType, ice: &IceCredentials) -> Self {
        Self {
            address,
            protocol,
            priority: Self::compute_priority(CandidateType::Host, LOCAL_PREFERENCE, COMPONENT),
            foundation: Self::compute_foundation(CandidateType::Host, address.ip(), protocol, None),
            related_address: None,
            candidate_type: CandidateType::Host,
            username: ice.ufrag.clone(),
            password: ice.pwd.clone(),
        }
    }

    /// A relay candidate for an allocation at `relayed`, made from the server reflexive
    /// address `mapped` through `server`.
    pub fn relay(
        relayed: SocketAddr,
        mapped: SocketAddr,
        server: &ProtocolAddress,
        ice: &IceCredentials,
    ) -> Self {
        let server_id = server.to_string();
        Self {
            address: relayed,
            protocol: ProtocolType::Udp,
            priority: Self::compute_priority(CandidateType::Relay, LOCAL_PREFERENCE, COMPONENT),
            foundation: Self::compute_foundation(
                CandidateType::Relay,
                mapped.ip(),
                server.protocol(),
                Some(&server_id),
            ),
            related_address: Some(mapped),
            candidate_type: CandidateType::Relay,
            username: ice.ufrag.clone(),
            password: ice.pwd.clone(),
        }
    }

    /// The credentials of the side owning this candidate.
    pub fn ice_credentials(&self) -> IceCredentials {
        IceCredentials::new(&self.username, &self.password)
    }

    /// `(type_pref << 24) | (local_pref << 8) | (256 - component)`
    ///
    /// # Examples
    ///
    /// ```
    /// # use turn_port::candidate::{Candidate, CandidateType};
    /// assert_eq!(Candidate::compute_priority(CandidateType::Host, 65535, 1), 2130706431);
    /// ```
    pub fn compute_priority(
        candidate_type: CandidateType,
        local_preference: u32,
        component: u32,
    ) -> u32 {
        (candidate_type.type_preference() << 24)
            | ((local_preference & 0xffff) << 8)
            | (256 - component.clamp(1, 256))
    }

    fn compute_foundation(
        candidate_type: CandidateType,
        base: IpAddr,
        protocol: ProtocolType,
        server: Option<&str>,
    ) -> String {
        let mut hasher = DefaultHasher::new();
        candidate_type.hash(&mut hasher);
        base.hash(&mut hasher);
        protocol.hash(&mut hasher);
        server.hash(&mut hasher);
        format!("{}", hasher.finish() as u32)
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} typ {}",
            self.foundation, self.protocol, self.priority, self.address, self.candidate_type
        )?;
        if let Some(related) = self.related_address {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}
