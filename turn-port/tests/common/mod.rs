// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![allow(dead_code)]

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use stun_proto::agent::Transmit;
use stun_proto::types::TransportType;
use tracing::subscriber::DefaultGuard;
use tracing::{debug, trace};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

use turn_port::candidate::{Candidate, ProtocolAddress, ProtocolType, RelayCredentials};
use turn_port::config::TurnPortConfig;
use turn_port::connection::ConnectionId;
use turn_port::net::{
    PacketSocket, SharedSocket, SocketFactory, SocketState, VirtualListener, VirtualNetwork,
    VirtualSocket,
};
use turn_port::turn::TurnPort;
use turn_port::types::framing::StreamFramer;
use turn_port::udp::UdpPort;
use turn_port::{Port, PortError, PortObserver};
use turn_test_server::{TurnServer, TurnServerConfig, TurnServerPollRet};

pub const TURN_IP: &str = "11.11.11.11";
pub const UDP_IP: &str = "22.22.22.22";
pub const UDP_SERVER: &str = "99.99.99.3:3478";
pub const TCP_SERVER: &str = "99.99.99.4:3478";
pub const EXTERNAL_IP: &str = "99.99.99.5";

pub const TURN_IP_V6: &str = "2400:4030:1:2c00:be30:abcd:efab:1111";
pub const UDP_IP_V6: &str = "2400:4030:1:2c00:be30:abcd:efab:2222";
pub const UDP_SERVER_V6: &str = "[2400:4030:1:2c00:be30:abcd:efab:cdef]:3478";
pub const EXTERNAL_IP_V6: &str = "2400:4030:1:2c00:be30:abcd:efab:5555";

pub const SERVER_HOST: &str = "turn.test";
pub const USERNAME: &str = "test";
pub const PASSWORD: &str = "test";
pub const REALM: &str = "realm";

const STEP: Duration = Duration::from_millis(10);

pub fn test_init_log() -> DefaultGuard {
    let level_filter = std::env::var("TURN_LOG")
        .or(std::env::var("RUST_LOG"))
        .ok()
        .and_then(|var| var.parse::<tracing_subscriber::filter::Targets>().ok())
        .unwrap_or(tracing_subscriber::filter::Targets::new().with_default(tracing::Level::TRACE));
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_target(false)
            .with_test_writer()
            .with_filter(level_filter),
    );
    tracing::subscriber::set_default(registry)
}

/// Everything a port signalled.
#[derive(Debug, Default)]
pub struct Recorded {
    pub complete: Vec<Vec<Candidate>>,
    pub errors: Vec<PortError>,
    pub unknown: Vec<(SocketAddr, ProtocolType, String)>,
    pub permissions: Vec<(IpAddr, u16)>,
    pub packets: Vec<(ConnectionId, Vec<u8>)>,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder(Rc<RefCell<Recorded>>);

impl Recorder {
    pub fn get(&self) -> std::cell::Ref<'_, Recorded> {
        self.0.borrow()
    }

    pub fn clear_packets(&self) {
        self.0.borrow_mut().packets.clear();
    }
}

impl PortObserver for Recorder {
    fn on_port_complete(&mut self, candidates: &[Candidate]) {
        self.0.borrow_mut().complete.push(candidates.to_vec());
    }

    fn on_port_error(&mut self, error: &PortError) {
        self.0.borrow_mut().errors.push(error.clone());
    }

    fn on_unknown_address(&mut self, remote: SocketAddr, protocol: ProtocolType, ufrag: &str) {
        self.0
            .borrow_mut()
            .unknown
            .push((remote, protocol, ufrag.to_owned()));
    }

    fn on_create_permission_result(&mut self, peer: IpAddr, code: u16) {
        self.0.borrow_mut().permissions.push((peer, code));
    }

    fn on_read_packet(&mut self, connection: ConnectionId, data: &[u8]) {
        self.0
            .borrow_mut()
            .packets
            .push((connection, data.to_vec()));
    }
}

/// A [`TurnServer`] attached to the virtual network.
#[derive(Debug)]
pub struct TestServer {
    pub server: TurnServer,
    /// Drop everything sent to the server and never answer.
    pub offline: bool,
    relay_ip: Option<IpAddr>,
    network: VirtualNetwork,
    udp: Vec<VirtualSocket>,
    tcp: VirtualListener,
    streams: Vec<(VirtualSocket, StreamFramer)>,
    relays: Vec<Box<dyn PacketSocket>>,
}

impl TestServer {
    fn new(network: &VirtualNetwork, config: TurnServerConfig, relay_ip: Option<IpAddr>) -> Self {
        let mut server = TurnServer::new(config);
        server.add_user(USERNAME.to_owned(), PASSWORD.to_owned());
        let mut udp = vec![];
        for addr in [UDP_SERVER, UDP_SERVER_V6] {
            let addr: SocketAddr = addr.parse().unwrap();
            server.add_listener(TransportType::Udp, addr);
            udp.push(network.bind_udp(addr).unwrap());
        }
        let tcp_addr = TCP_SERVER.parse().unwrap();
        server.add_listener(TransportType::Tcp, tcp_addr);
        let tcp = network.listen_tcp(tcp_addr).unwrap();
        Self {
            server,
            offline: false,
            relay_ip,
            network: network.clone(),
            udp,
            tcp,
            streams: vec![],
            relays: vec![],
        }
    }

    /// The number of relayed sockets that are still open.
    pub fn relay_sockets(&self) -> usize {
        self.relays.len()
    }

    fn process(&mut self, now: Instant) {
        while let Some(stream) = self.tcp.accept() {
            debug!("server accepted {:?}", stream.remote_addr());
            self.streams.push((stream, StreamFramer::new()));
        }

        let mut incoming = vec![];
        for socket in self.udp.iter() {
            while let Some(transmit) = socket.recv() {
                incoming.push(transmit);
            }
        }
        for socket in self.relays.iter() {
            while let Some(transmit) = socket.recv() {
                incoming.push(transmit);
            }
        }
        for (stream, framer) in self.streams.iter_mut() {
            while let Some(transmit) = stream.recv() {
                framer.push(&transmit.data);
                while let Ok(Some(frame)) = framer.pop() {
                    incoming.push(Transmit::new(
                        frame.as_ref().to_vec(),
                        TransportType::Tcp,
                        transmit.from,
                        transmit.to,
                    ));
                }
            }
        }
        self.streams
            .retain(|(stream, _framer)| stream.state() != SocketState::Closed);
        if self.offline {
            trace!("server offline, dropping {} transmits", incoming.len());
            return;
        }

        for transmit in incoming {
            if let Some(reply) = self.server.recv(transmit, now) {
                self.send(reply);
            }
        }

        while let TurnServerPollRet::AllocateSocketUdp {
            transport,
            local_addr,
            remote_addr,
        } = self.server.poll(now)
        {
            let external: IpAddr = match self.relay_ip {
                Some(ip) => ip,
                None if local_addr.is_ipv4() => EXTERNAL_IP.parse().unwrap(),
                None => EXTERNAL_IP_V6.parse().unwrap(),
            };
            let relay = self.network.create_udp_socket(external).unwrap();
            let relayed = relay.local_addr();
            debug!("server relaying {remote_addr} through {relayed}");
            self.relays.push(relay);
            self.server
                .allocated_udp_socket(transport, local_addr, remote_addr, Ok(relayed), now);
        }
        while let Some(transmit) = self.server.poll_transmit(now) {
            self.send(transmit);
        }

        let live = self.server.relayed_addresses().collect::<Vec<_>>();
        self.relays
            .retain(|relay| live.contains(&relay.local_addr()));
    }

    fn send(&self, transmit: Transmit<Vec<u8>>) {
        trace!(
            "server sending {} bytes from {} to {}",
            transmit.data.len(),
            transmit.from,
            transmit.to
        );
        let socket: Option<&dyn PacketSocket> = match transmit.transport {
            TransportType::Udp => self
                .udp
                .iter()
                .map(|socket| socket as &dyn PacketSocket)
                .chain(self.relays.iter().map(|relay| relay.as_ref()))
                .find(|socket| socket.local_addr() == transmit.from),
            TransportType::Tcp => self
                .streams
                .iter()
                .map(|(stream, _framer)| stream as &dyn PacketSocket)
                .find(|stream| {
                    stream.local_addr() == transmit.from
                        && stream.remote_addr() == Some(transmit.to)
                }),
        };
        match socket {
            Some(socket) => {
                let _ = socket.send_to(&transmit.data, transmit.to);
            }
            None => debug!("server has no socket for {}", transmit.from),
        }
    }
}

/// How to set up a [`TurnPortFixture`].
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub server: ProtocolAddress,
    pub turn_ip: IpAddr,
    pub udp_ip: IpAddr,
    pub password: String,
    pub one_time_nonce: bool,
    pub shared_socket: bool,
    /// Address the server relays from.  Follows the family of the client when unset.
    pub relay_ip: Option<IpAddr>,
    pub turn_config: TurnPortConfig,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            server: udp_server(),
            turn_ip: TURN_IP.parse().unwrap(),
            udp_ip: UDP_IP.parse().unwrap(),
            password: PASSWORD.to_owned(),
            one_time_nonce: false,
            shared_socket: false,
            relay_ip: None,
            turn_config: TurnPortConfig::default(),
        }
    }
}

pub fn udp_server() -> ProtocolAddress {
    format!("udp://{UDP_SERVER}").parse().unwrap()
}

pub fn tcp_server() -> ProtocolAddress {
    format!("tcp://{TCP_SERVER}").parse().unwrap()
}

pub fn udp_server_v6() -> ProtocolAddress {
    format!("udp://{UDP_SERVER_V6}").parse().unwrap()
}

/// A [`TurnPort`] and a [`UdpPort`] on a virtual network together with a TURN server.
#[derive(Debug)]
pub struct TurnPortFixture {
    pub network: VirtualNetwork,
    pub server: TestServer,
    pub turn: TurnPort,
    pub turn_events: Recorder,
    pub udp: UdpPort,
    pub udp_events: Recorder,
    pub shared: Option<SharedSocket>,
    pub now: Instant,
}

impl TurnPortFixture {
    pub fn new() -> Self {
        Self::with_config(FixtureConfig::default())
    }

    pub fn with_config(config: FixtureConfig) -> Self {
        let network = VirtualNetwork::default();
        network.add_host(SERVER_HOST, vec![UDP_SERVER.parse::<SocketAddr>().unwrap().ip()]);
        let server = TestServer::new(
            &network,
            TurnServerConfig::new(REALM).one_time_nonce(config.one_time_nonce),
            config.relay_ip,
        );

        let turn_events = Recorder::default();
        let mut turn = TurnPort::builder(
            network.clone(),
            config.turn_ip,
            config.server,
            RelayCredentials::new(USERNAME, &config.password),
        )
        .config(config.turn_config)
        .observer(Box::new(turn_events.clone()));
        let shared = if config.shared_socket {
            let shared = SharedSocket::new(network.create_udp_socket(config.turn_ip).unwrap());
            turn = turn.shared_socket(shared.clone());
            Some(shared)
        } else {
            None
        };
        let turn = turn.build();

        let udp_events = Recorder::default();
        let udp = UdpPort::builder(network.clone(), config.udp_ip)
            .observer(Box::new(udp_events.clone()))
            .build();

        Self {
            network,
            server,
            turn,
            turn_events,
            udp,
            udp_events,
            shared,
            now: Instant::now(),
        }
    }

    /// Deliver everything that is due and advance time by one step.
    pub fn step(&mut self) {
        self.network.process();
        self.server.process(self.now);
        if let Some(shared) = self.shared.as_ref() {
            while let Some(transmit) = shared.socket().recv() {
                self.turn.handle_incoming_packet(
                    Transmit::new(
                        transmit.data.as_slice(),
                        transmit.transport,
                        transmit.from,
                        transmit.to,
                    ),
                    self.now,
                );
            }
        }
        self.turn.process(self.now);
        self.udp.process(self.now);
        self.now += STEP;
    }

    /// Step until `condition` holds.  Returns false if it did not within `timeout`.
    pub fn run_until(&mut self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let end = self.now + timeout;
        while self.now < end {
            if condition(self) {
                return true;
            }
            self.step();
        }
        condition(self)
    }

    /// Step through `duration`.
    pub fn advance(&mut self, duration: Duration) {
        let end = self.now + duration;
        while self.now < end {
            self.step();
        }
    }

    /// Prepare both ports and wait for the TURN allocation.
    pub fn prepare(&mut self) {
        self.turn.prepare_address(self.now);
        self.udp.prepare_address(self.now);
        assert!(self.run_until(Duration::from_secs(5), |fixture| {
            !fixture.turn_events.get().complete.is_empty()
        }));
    }

    pub fn relay_candidate(&self) -> Candidate {
        self.turn.candidates()[0].clone()
    }

    pub fn udp_candidate(&self) -> Candidate {
        self.udp.candidates()[0].clone()
    }
}
