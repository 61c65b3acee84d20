use std::net::SocketAddr;
use std::time::Instant;

use stun_proto::agent::Transmit;
use stun_proto::types::TransportType;
use turn_port::candidate::{
    Candidate, CandidateOrigin, IceCredentials, ProtocolType, RelayCredentials,
};
use turn_port::net::{PacketSocket, VirtualNetwork, VirtualSocket};
use turn_port::turn::{TurnPort, TurnPortState};
use turn_port::Port;
use turn_test_server::{TurnServer, TurnServerConfig, TurnServerPollRet};

struct RelayFixture {
    network: VirtualNetwork,
    server: TurnServer,
    server_socket: VirtualSocket,
    port: TurnPort,
    relayed_addr: SocketAddr,
    peer_addr: SocketAddr,
    now: Instant,
}

impl RelayFixture {
    fn new() -> Self {
        let server_addr: SocketAddr = "127.0.0.1:3478".parse().unwrap();
        let credentials = RelayCredentials::new("tuser", "tpass");
        let network = VirtualNetwork::default();
        let server_socket = network.bind_udp(server_addr).unwrap();
        let mut server = TurnServer::new(TurnServerConfig::new("realm"));
        server.add_listener(TransportType::Udp, server_addr);
        server.add_user(
            credentials.username().to_string(),
            credentials.password().to_string(),
        );
        let port = TurnPort::builder(
            network.clone(),
            "127.0.0.1".parse().unwrap(),
            format!("udp://{server_addr}").parse().unwrap(),
            credentials,
        )
        .build();
        Self {
            network,
            server,
            server_socket,
            port,
            relayed_addr: "10.0.0.2:2222".parse().unwrap(),
            peer_addr: "10.0.0.4:44444".parse().unwrap(),
            now: Instant::now(),
        }
    }

    fn allocate(&mut self) {
        self.port.prepare_address(self.now);
        self.run(|fixture| fixture.port.state() == TurnPortState::Ready);
        let peer = Candidate::host(self.peer_addr, ProtocolType::Udp, &IceCredentials::generate());
        let peer_addr = self.peer_addr;
        self.port
            .create_connection(&peer, CandidateOrigin::Message, self.now)
            .unwrap();
        self.run(|fixture| fixture.port.has_channel(peer_addr));
    }

    fn run(&mut self, done: impl Fn(&Self) -> bool) {
        for _ in 0..100 {
            if done(self) {
                return;
            }
            self.network.process();
            while let Some(transmit) = self.server_socket.recv() {
                if let Some(reply) = self.server.recv(transmit, self.now) {
                    self.reply(reply);
                }
            }
            while let TurnServerPollRet::AllocateSocketUdp {
                transport,
                local_addr,
                remote_addr,
            } = self.server.poll(self.now)
            {
                self.server.allocated_udp_socket(
                    transport,
                    local_addr,
                    remote_addr,
                    Ok(self.relayed_addr),
                    self.now,
                );
            }
            while let Some(reply) = self.server.poll_transmit(self.now) {
                self.reply(reply);
            }
            self.port.process(self.now);
        }
        unreachable!();
    }

    fn reply(&self, transmit: Transmit<Vec<u8>>) {
        if transmit.from == self.server_socket.local_addr() {
            self.server_socket
                .send_to(&transmit.data, transmit.to)
                .unwrap();
        }
    }
}
