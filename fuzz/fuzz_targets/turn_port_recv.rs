// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![no_main]
use std::sync::Once;

use libfuzzer_sys::fuzz_target;

use tracing_subscriber::EnvFilter;

include!("helpers/relay_fixture.rs");

pub fn debug_init() {
    static TRACING: Once = Once::new();

    TRACING.call_once(|| {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}

fuzz_target!(|data: &[u8]| {
    debug_init();
    let mut test = RelayFixture::new();
    test.allocate();
    let local_addr = test.port.local_addr().unwrap();
    let now = test.now;

    // relayed from the peer
    if let Some(transmit) = test.server.recv(
        Transmit::new(data, TransportType::Udp, test.peer_addr, test.relayed_addr),
        now,
    ) {
        test.port.handle_incoming_packet(
            Transmit::new(
                transmit.data.as_slice(),
                transmit.transport,
                transmit.from,
                transmit.to,
            ),
            now,
        );
    }
    // directly from the server
    test.port.handle_incoming_packet(
        Transmit::new(data, TransportType::Udp, test.server_socket.local_addr(), local_addr),
        now,
    );
    test.port.process(now);
});
