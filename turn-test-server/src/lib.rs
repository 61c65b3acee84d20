// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # turn-test-server
//!
//! A sans-IO TURN server to run TURN clients against.  It implements the long-term credential
//! mechanism (including optional one-time-use nonces), UDP allocations, permissions, channels
//! and Send/Data indications over any number of UDP or TCP listening addresses.
//!
//! The caller owns all sockets: received datagrams (or complete frames from a TCP stream) are
//! passed to [`TurnServer::recv`](server::TurnServer::recv) and the returned or polled
//! transmissions are written to the matching socket.
//!
//! Relevant standards:
//! - [RFC5766]: Traversal Using Relays around NAT (TURN).
//!
//! [RFC5766]: https://datatracker.ietf.org/doc/html/rfc5766

#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

pub mod server;

pub use relay_types as types;
pub use stun_proto as stun;

pub use server::{SocketAllocateError, TurnServer, TurnServerConfig, TurnServerPollRet};

#[cfg(test)]
mod tests {
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Layer;

    pub fn test_init_log() -> DefaultGuard {
        let level_filter = std::env::var("TURN_LOG")
            .or(std::env::var("RUST_LOG"))
            .ok()
            .and_then(|var| var.parse::<tracing_subscriber::filter::Targets>().ok())
            .unwrap_or(
                tracing_subscriber::filter::Targets::new().with_default(tracing::Level::TRACE),
            );
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
}
