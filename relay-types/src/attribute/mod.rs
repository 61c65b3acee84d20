// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! STUN Attributes for TURN.
//!
//! The subset of the TURN [RFC5766] attributes that a relay client sends or expects back from a
//! server.
//!
//! [RFC5766]: https://tools.ietf.org/html/rfc5766

mod address;
pub use address::{XorPeerAddress, XorRelayedAddress};
mod data;
pub use data::Data;
mod value;
pub use value::{ChannelNumber, DontFragment, Lifetime, RequestedTransport};
