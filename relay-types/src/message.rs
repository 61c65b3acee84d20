// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TURN methods, in addition to the BINDING method specified by STUN.

use stun_types::message::Method;

/// Allocate: reserve a relayed transport address on the server. Request/response only.
pub const ALLOCATE: Method = Method::new(0x0003);

/// Refresh: extend (or with a zero lifetime, release) an allocation. Request/response only.
pub const REFRESH: Method = Method::new(0x0004);

/// Send: client to server data for a peer. Indication only.
pub const SEND: Method = Method::new(0x0006);

/// Data: server to client data from a peer. Indication only.
pub const DATA: Method = Method::new(0x0007);

/// CreatePermission: install or refresh permissions for peer IP addresses.
pub const CREATE_PERMISSION: Method = Method::new(0x0008);

/// ChannelBind: bind a channel number to a peer transport address.
pub const CHANNEL_BIND: Method = Method::new(0x0009);

/// Whether `method` is one of the TURN methods in this module.
pub fn is_turn_method(method: Method) -> bool {
    [ALLOCATE, REFRESH, SEND, DATA, CREATE_PERMISSION, CHANNEL_BIND].contains(&method)
}
