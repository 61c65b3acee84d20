// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::IpAddr;
use std::time::Duration;

use turn_port::candidate::{
    Candidate, CandidateOrigin, CandidateType, IceCredentials, ProtocolType,
};
use turn_port::config::{ConnectionConfig, TurnPortConfig};
use turn_port::connection::{ConnectionId, ReadState, WriteState};
use turn_port::net::ResolveError;
use turn_port::turn::TurnPortState;
use turn_port::{Port, PortError};

mod common;
use common::*;

const TIMEOUT: Duration = Duration::from_secs(5);

fn udp_ip() -> IpAddr {
    UDP_IP.parse().unwrap()
}

fn allocate(config: FixtureConfig) -> TurnPortFixture {
    let mut fixture = TurnPortFixture::with_config(config);
    fixture.prepare();
    assert_eq!(fixture.turn.state(), TurnPortState::Ready);
    assert!(fixture.turn_events.get().errors.is_empty());
    fixture
}

/// Ping in both directions until both connections are usable.  Returns the connection of the TURN
/// port and of the UDP port.
fn connect(fixture: &mut TurnPortFixture) -> (ConnectionId, ConnectionId) {
    let relay = fixture.relay_candidate();
    let host = fixture.udp_candidate();

    let turn_conn = fixture
        .turn
        .create_connection(&host, CandidateOrigin::Message, fixture.now)
        .unwrap();
    let udp_conn = fixture
        .udp
        .create_connection(&relay, CandidateOrigin::Message, fixture.now)
        .unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| f.turn.has_permission(host.address.ip())));

    let now = fixture.now;
    fixture.turn.ping(turn_conn, now).unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| {
        f.turn.connection(turn_conn).unwrap().writable()
    }));
    let now = fixture.now;
    fixture.udp.ping(udp_conn, now).unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| {
        f.udp.connection(udp_conn).unwrap().writable()
    }));

    let turn_connection = fixture.turn.connection(turn_conn).unwrap();
    assert_eq!(turn_connection.write_state(), WriteState::Writable);
    assert_eq!(turn_connection.read_state(), ReadState::Readable);
    let udp_connection = fixture.udp.connection(udp_conn).unwrap();
    assert_eq!(udp_connection.write_state(), WriteState::Writable);
    assert_eq!(udp_connection.read_state(), ReadState::Readable);

    (turn_conn, udp_conn)
}

fn send_recv(fixture: &mut TurnPortFixture) {
    let (turn_conn, udp_conn) = connect(fixture);
    fixture.turn_events.clear_packets();
    fixture.udp_events.clear_packets();

    for j in 0..256usize {
        let data = vec![0xFF - j as u8; j + 1];
        let now = fixture.now;
        fixture.turn.send(turn_conn, &data, now).unwrap();
        fixture.udp.send(udp_conn, &data, now).unwrap();
    }
    assert!(fixture.run_until(TIMEOUT, |f| {
        f.udp_events.get().packets.len() >= 256 && f.turn_events.get().packets.len() >= 256
    }));

    for (events, conn) in [
        (&fixture.udp_events, udp_conn),
        (&fixture.turn_events, turn_conn),
    ] {
        let recorded = events.get();
        assert_eq!(recorded.packets.len(), 256);
        for (j, (id, data)) in recorded.packets.iter().enumerate() {
            assert_eq!(*id, conn);
            assert_eq!(data.len(), j + 1);
            assert!(data.iter().all(|&b| b == 0xFF - j as u8));
        }
    }
}

#[test]
fn allocate_udp() {
    let _log = test_init_log();
    let fixture = allocate(FixtureConfig::default());
    let relay = fixture.relay_candidate();
    assert_eq!(relay.candidate_type, CandidateType::Relay);
    assert_eq!(relay.protocol, ProtocolType::Udp);
    assert_eq!(relay.address.ip(), EXTERNAL_IP.parse::<IpAddr>().unwrap());
    assert_eq!(
        relay.related_address.map(|addr| addr.ip()),
        Some(TURN_IP.parse().unwrap())
    );
    assert_eq!(fixture.turn.relayed_addr(), Some(relay.address));
    assert_eq!(
        fixture.server.server.relayed_addresses().collect::<Vec<_>>(),
        vec![relay.address]
    );
    assert_eq!(fixture.turn_events.get().complete, vec![vec![relay]]);
}

#[test]
fn allocate_tcp() {
    let _log = test_init_log();
    let fixture = allocate(FixtureConfig {
        server: tcp_server(),
        ..Default::default()
    });
    let relay = fixture.relay_candidate();
    assert_eq!(relay.protocol, ProtocolType::Udp);
    assert_eq!(relay.address.ip(), EXTERNAL_IP.parse::<IpAddr>().unwrap());
    assert_eq!(fixture.server.relay_sockets(), 1);
}

#[test]
fn allocate_ipv6() {
    let _log = test_init_log();
    let fixture = allocate(FixtureConfig {
        server: udp_server_v6(),
        turn_ip: TURN_IP_V6.parse().unwrap(),
        udp_ip: UDP_IP_V6.parse().unwrap(),
        ..Default::default()
    });
    let relay = fixture.relay_candidate();
    assert_eq!(relay.address.ip(), EXTERNAL_IP_V6.parse::<IpAddr>().unwrap());
}

#[test]
fn allocate_ipv6_relay_ipv4() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig {
        server: udp_server_v6(),
        turn_ip: TURN_IP_V6.parse().unwrap(),
        relay_ip: Some(EXTERNAL_IP.parse().unwrap()),
        ..Default::default()
    });
    let relay = fixture.relay_candidate();
    assert_eq!(relay.address.ip(), EXTERNAL_IP.parse::<IpAddr>().unwrap());
    assert_eq!(
        relay.related_address.map(|addr| addr.ip()),
        Some(TURN_IP_V6.parse().unwrap())
    );
    assert_eq!(fixture.turn.server_addr(), Some(UDP_SERVER_V6.parse().unwrap()));

    // peers must match the relayed family, not the family of the server
    let v6_peer = Candidate::host(
        format!("[{UDP_IP_V6}]:6000").parse().unwrap(),
        ProtocolType::Udp,
        &IceCredentials::generate(),
    );
    assert_eq!(
        fixture
            .turn
            .create_connection(&v6_peer, CandidateOrigin::Message, fixture.now),
        None
    );
    send_recv(&mut fixture);
}

#[test]
fn allocate_resolved_host() {
    let _log = test_init_log();
    let fixture = allocate(FixtureConfig {
        server: format!("udp://{SERVER_HOST}:3478").parse().unwrap(),
        ..Default::default()
    });
    assert_eq!(
        fixture.turn.server_addr(),
        Some(UDP_SERVER.parse().unwrap())
    );
    assert_eq!(fixture.network.pending_resolutions(), 0);
}

#[test]
fn unknown_host() {
    let _log = test_init_log();
    let mut fixture = TurnPortFixture::with_config(FixtureConfig {
        server: "udp://nowhere.test:3478".parse().unwrap(),
        ..Default::default()
    });
    let now = fixture.now;
    fixture.turn.prepare_address(now);
    assert_eq!(fixture.turn.state(), TurnPortState::Resolving);
    assert!(fixture.run_until(TIMEOUT, |f| !f.turn_events.get().errors.is_empty()));
    assert!(matches!(
        fixture.turn_events.get().errors[..],
        [PortError::Resolve(ResolveError::NotFound(_))]
    ));
    assert_eq!(fixture.turn.state(), TurnPortState::Failed);
    assert!(fixture.turn_events.get().complete.is_empty());
}

#[test]
fn wrong_password() {
    let _log = test_init_log();
    let mut fixture = TurnPortFixture::with_config(FixtureConfig {
        password: "wrong".to_owned(),
        ..Default::default()
    });
    let now = fixture.now;
    fixture.turn.prepare_address(now);
    assert!(fixture.run_until(TIMEOUT, |f| !f.turn_events.get().errors.is_empty()));
    assert_eq!(
        fixture.turn_events.get().errors,
        vec![PortError::Authentication]
    );
    assert_eq!(fixture.turn.state(), TurnPortState::Failed);
    assert!(fixture.turn.candidates().is_empty());
    assert_eq!(fixture.server.server.relayed_addresses().count(), 0);
}

#[test]
fn tls_rejected() {
    let _log = test_init_log();
    let mut fixture = TurnPortFixture::with_config(FixtureConfig {
        server: format!("ssltcp://{TCP_SERVER}").parse().unwrap(),
        ..Default::default()
    });
    let sockets = fixture.network.open_sockets();
    let now = fixture.now;
    fixture.turn.prepare_address(now);
    assert_eq!(fixture.turn.state(), TurnPortState::Failed);
    assert!(matches!(
        fixture.turn_events.get().errors[..],
        [PortError::Configuration(_)]
    ));
    fixture.step();
    assert_eq!(fixture.network.open_sockets(), sockets);
}

#[test]
fn address_family_mismatch() {
    let _log = test_init_log();
    let mut fixture = TurnPortFixture::with_config(FixtureConfig {
        turn_ip: TURN_IP_V6.parse().unwrap(),
        ..Default::default()
    });
    let sockets = fixture.network.open_sockets();
    let now = fixture.now;
    fixture.turn.prepare_address(now);
    assert_eq!(fixture.turn.state(), TurnPortState::Failed);
    assert!(matches!(
        fixture.turn_events.get().errors[..],
        [PortError::Configuration(_)]
    ));
    assert_eq!(fixture.network.open_sockets(), sockets);
}

#[test]
fn ping_needs_permission() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    let relay = fixture.relay_candidate();
    let host = fixture.udp_candidate();

    let udp_conn = fixture
        .udp
        .create_connection(&relay, CandidateOrigin::Message, fixture.now)
        .unwrap();
    let now = fixture.now;
    fixture.udp.ping(udp_conn, now).unwrap();
    fixture.advance(Duration::from_millis(200));
    // dropped by the server
    assert!(fixture.turn_events.get().unknown.is_empty());
    assert_eq!(
        fixture.udp.connection(udp_conn).unwrap().write_state(),
        WriteState::Init
    );

    let turn_conn = fixture
        .turn
        .create_connection(&host, CandidateOrigin::Message, fixture.now)
        .unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| {
        f.turn_events.get().permissions == vec![(udp_ip(), 0)]
    }));
    assert!(fixture
        .server
        .server
        .has_permission(relay.address, udp_ip(), fixture.now));

    let now = fixture.now;
    fixture.udp.ping(udp_conn, now).unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| {
        f.udp.connection(udp_conn).unwrap().writable()
    }));
    assert!(fixture.turn.connection(turn_conn).unwrap().readable());
}

#[test]
fn channel_bound_with_permission() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    let host = fixture.udp_candidate();
    let relay = fixture.relay_candidate();
    fixture
        .turn
        .create_connection(&host, CandidateOrigin::Message, fixture.now)
        .unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| f.turn.has_channel(host.address)));
    assert!(fixture.server.server.has_channel(relay.address, host.address));
}

#[test]
fn connection_udp() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    connect(&mut fixture);
}

#[test]
fn connection_tcp() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig {
        server: tcp_server(),
        ..Default::default()
    });
    connect(&mut fixture);
}

#[test]
fn connection_shared_socket() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig {
        shared_socket: true,
        ..Default::default()
    });
    connect(&mut fixture);
}

#[test]
fn connection_one_time_nonce() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig {
        one_time_nonce: true,
        ..Default::default()
    });
    connect(&mut fixture);
}

#[test]
fn send_recv_udp() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    send_recv(&mut fixture);
}

#[test]
fn send_recv_tcp() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig {
        server: tcp_server(),
        ..Default::default()
    });
    send_recv(&mut fixture);
}

#[test]
fn send_recv_without_channels() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig {
        turn_config: TurnPortConfig::default().use_channels(false),
        ..Default::default()
    });
    send_recv(&mut fixture);
    let peer = fixture.udp_candidate().address;
    assert!(!fixture.turn.has_channel(peer));
    let relayed = fixture.relay_candidate().address;
    assert!(!fixture.server.server.has_channel(relayed, peer));
}

#[test]
fn write_timeout_is_local() {
    let _log = test_init_log();
    let connection = ConnectionConfig::default()
        .write_timeout(Duration::from_secs(2))
        .write_timeout_pings(3);
    let mut fixture = allocate(FixtureConfig {
        turn_config: TurnPortConfig::default().connection(connection),
        ..Default::default()
    });
    let (turn_conn, udp_conn) = connect(&mut fixture);

    // nothing answers at this address
    let silent = Candidate::host(
        "22.22.22.23:6000".parse().unwrap(),
        ProtocolType::Udp,
        &IceCredentials::generate(),
    );
    let silent_conn = fixture
        .turn
        .create_connection(&silent, CandidateOrigin::Message, fixture.now)
        .unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| f.turn.has_permission(silent.address.ip())));

    for _ in 0..6 {
        let now = fixture.now;
        fixture.turn.ping(silent_conn, now).unwrap();
        fixture.turn.ping(turn_conn, now).unwrap();
        fixture.advance(Duration::from_millis(500));
    }
    assert_eq!(
        fixture.turn.connection(silent_conn).unwrap().write_state(),
        WriteState::WriteTimeout
    );
    assert_eq!(
        fixture.turn.connection(turn_conn).unwrap().write_state(),
        WriteState::Writable
    );
    assert_eq!(fixture.turn.state(), TurnPortState::Ready);
    assert!(fixture.turn_events.get().errors.is_empty());

    fixture.udp_events.clear_packets();
    let now = fixture.now;
    fixture.turn.send(turn_conn, &[1, 2, 3], now).unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| {
        f.udp_events.get().packets == vec![(udp_conn, vec![1, 2, 3])]
    }));
}

#[test]
fn unknown_address() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    let relay = fixture.relay_candidate();
    let host = fixture.udp_candidate();

    let now = fixture.now;
    fixture.turn.create_permission(udp_ip(), now).unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| {
        f.turn_events.get().permissions == vec![(udp_ip(), 0)]
    }));

    let udp_conn = fixture
        .udp
        .create_connection(&relay, CandidateOrigin::Message, fixture.now)
        .unwrap();
    let now = fixture.now;
    fixture.udp.ping(udp_conn, now).unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| !f.turn_events.get().unknown.is_empty()));
    let ufrag = fixture.udp.ice_credentials().ufrag.clone();
    assert_eq!(
        fixture.turn_events.get().unknown,
        vec![(host.address, ProtocolType::Udp, ufrag)]
    );
    assert_eq!(fixture.turn.connection_to(host.address), None);
}

#[test]
fn permission_denied() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    fixture.server.server.deny_peer(udp_ip());
    let host = fixture.udp_candidate();
    let turn_conn = fixture
        .turn
        .create_connection(&host, CandidateOrigin::Message, fixture.now)
        .unwrap();
    assert!(fixture.run_until(TIMEOUT, |f| !f.turn_events.get().permissions.is_empty()));
    assert_eq!(fixture.turn_events.get().permissions, vec![(udp_ip(), 403)]);
    assert!(!fixture.turn.has_permission(udp_ip()));
    // the port keeps its allocation
    assert_eq!(fixture.turn.state(), TurnPortState::Ready);
    assert!(fixture.turn.connection(turn_conn).is_some());
}

#[test]
fn close_deallocates() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    assert_eq!(fixture.server.server.relayed_addresses().count(), 1);
    let now = fixture.now;
    fixture.turn.close(now);
    assert_eq!(fixture.turn.state(), TurnPortState::Closed);
    assert!(fixture.run_until(TIMEOUT, |f| {
        f.server.server.relayed_addresses().count() == 0
    }));
    assert_eq!(fixture.server.relay_sockets(), 0);
    assert!(fixture.turn_events.get().errors.is_empty());
}

#[test]
fn close_retransmits_deallocation() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    fixture.server.offline = true;
    let now = fixture.now;
    fixture.turn.close(now);
    fixture.advance(Duration::from_millis(200));
    assert_eq!(fixture.server.server.relayed_addresses().count(), 1);

    fixture.server.offline = false;
    assert!(fixture.run_until(TIMEOUT, |f| {
        f.server.server.relayed_addresses().count() == 0
    }));
    assert_eq!(fixture.turn.state(), TurnPortState::Closed);
    assert!(fixture.turn_events.get().errors.is_empty());
}

#[test]
fn allocation_lost_without_refresh() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    let host = fixture.udp_candidate();
    fixture.server.offline = true;
    for _ in 0..12 {
        fixture.now += Duration::from_secs(60);
        fixture.advance(Duration::from_millis(100));
    }
    assert_eq!(
        fixture.turn_events.get().errors,
        vec![PortError::AllocationLost]
    );
    assert_eq!(fixture.turn.state(), TurnPortState::Failed);
    assert_eq!(
        fixture
            .turn
            .create_connection(&host, CandidateOrigin::Message, fixture.now),
        None
    );

    // nothing more is reported once failed
    fixture.server.offline = false;
    fixture.advance(Duration::from_secs(1));
    assert_eq!(fixture.turn_events.get().errors.len(), 1);
}

#[test]
fn allocation_refreshed() {
    let _log = test_init_log();
    let mut fixture = allocate(FixtureConfig::default());
    let relay = fixture.relay_candidate();
    for _ in 0..30 {
        fixture.now += Duration::from_secs(60);
        fixture.advance(Duration::from_millis(100));
    }
    assert_eq!(fixture.turn.state(), TurnPortState::Ready);
    assert!(fixture.turn_events.get().errors.is_empty());
    assert_eq!(
        fixture.server.server.relayed_addresses().collect::<Vec<_>>(),
        vec![relay.address]
    );
}

#[test]
fn drop_releases_resources() {
    let _log = test_init_log();
    let fixture = allocate(FixtureConfig {
        server: format!("udp://{SERVER_HOST}:3478").parse().unwrap(),
        ..Default::default()
    });
    let TurnPortFixture { network, turn, .. } = fixture;
    assert_eq!(network.pending_resolutions(), 0);
    let sockets = network.open_sockets();
    drop(turn);
    assert_eq!(network.open_sockets(), sockets - 1);
}
