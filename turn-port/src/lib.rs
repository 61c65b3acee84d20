// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![deny(missing_debug_implementations)]

//! # turn-port
//!
//! Ports produce local candidates and carry connectivity checks and application data between a
//! local candidate and remote candidates.
//!
//! - [`UdpPort`](udp::UdpPort) sends directly from a local UDP socket.
//! - [`TurnPort`](turn::TurnPort) allocates a relayed address on a TURN server over UDP or TCP and
//!   relays through it, installing permissions and channels as connections are made.
//!
//! Ports perform no I/O of their own: sockets and name lookups come from a
//! [`Network`](net::Network) and time is always passed in by the caller, who drives every port
//! with [`Port::process`](port::Port::process).

pub use relay_types as types;
pub use stun_proto as stun;

pub mod candidate;
pub mod config;
pub mod connection;
pub mod net;
pub mod port;
mod protocol;
pub mod turn;
pub mod udp;

pub use port::{Port, PortError, PortObserver};
