// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

//! # relay-types
//!
//! The TURN vocabulary needed by a relay client and its test server:
//! 1. TURN methods and the TURN specific STUN attributes, built on the `stun-types` crate.
//! 2. [`ChannelData`](channel::ChannelData) messages.
//! 3. Framing of STUN messages and channel data carried over a byte stream (TCP).
//!
//! This is based on the following standards:
//! - [RFC5766]
//!
//! [RFC5766]: https://tools.ietf.org/html/rfc5766

pub use stun_types as stun;
use stun_types::message::LongTermCredentials;
pub mod attribute;
pub mod channel;
pub mod framing;
pub mod message;

/// The username and password a TURN server knows a client by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    username: String,
    password: String,
}

impl TurnCredentials {
    /// Construct a new set of [`TurnCredentials`]
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    /// The username of the credentials.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password of the credentials.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Bind these credentials to the `realm` a server challenged with, producing the
    /// `LongTermCredentials` used for MESSAGE-INTEGRITY.
    pub fn into_long_term_credentials(self, realm: &str) -> LongTermCredentials {
        LongTermCredentials::new(self.username, self.password, realm.to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
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

    #[test]
    fn long_term_credentials() {
        let _log = test_init_log();
        let creds = super::TurnCredentials::new("user", "pass");
        assert_eq!(creds.username(), "user");
        assert_eq!(creds.password(), "pass");
        let long_term = creds.into_long_term_credentials("realm");
        assert_eq!(long_term.username(), "user");
        assert_eq!(long_term.password(), "pass");
        assert_eq!(long_term.realm(), "realm");
    }
}
