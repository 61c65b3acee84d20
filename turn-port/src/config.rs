// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tunable timings of ports and their connections.

use std::time::Duration;

/// Timings of the connectivity checks performed over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    write_timeout: Duration,
    write_timeout_pings: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(15),
            write_timeout_pings: 5,
        }
    }
}

impl ConnectionConfig {
    /// How old the oldest unanswered ping must be before a connection stops being writable.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// How many pings must be unanswered before a connection stops being writable.
    pub fn write_timeout_pings(mut self, pings: usize) -> Self {
        self.write_timeout_pings = pings.max(1);
        self
    }

    /// The configured write timeout.
    pub fn get_write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// The configured number of unanswered pings.
    pub fn get_write_timeout_pings(&self) -> usize {
        self.write_timeout_pings
    }
}

/// Configuration of a [`TurnPort`](crate::turn::TurnPort).
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use turn_port::config::TurnPortConfig;
/// let config = TurnPortConfig::default()
///     .allocation_lifetime(Duration::from_secs(300))
///     .use_channels(false);
/// assert_eq!(config.get_allocation_lifetime(), Duration::from_secs(300));
/// assert!(!config.get_use_channels());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnPortConfig {
    allocation_lifetime: Duration,
    refresh_lead: Duration,
    permission_lifetime: Duration,
    channel_lifetime: Duration,
    use_channels: bool,
    connection: ConnectionConfig,
}

impl Default for TurnPortConfig {
    fn default() -> Self {
        Self {
            allocation_lifetime: Duration::from_secs(600),
            refresh_lead: Duration::from_secs(60),
            permission_lifetime: Duration::from_secs(300),
            channel_lifetime: Duration::from_secs(600),
            use_channels: true,
            connection: ConnectionConfig::default(),
        }
    }
}

impl TurnPortConfig {
    /// The allocation lifetime requested from the server.
    pub fn allocation_lifetime(mut self, lifetime: Duration) -> Self {
        self.allocation_lifetime = lifetime;
        self
    }

    /// How long before an allocation, permission or channel expires it is refreshed.
    pub fn refresh_lead(mut self, lead: Duration) -> Self {
        self.refresh_lead = lead;
        self
    }

    /// How long the server keeps a permission.
    pub fn permission_lifetime(mut self, lifetime: Duration) -> Self {
        self.permission_lifetime = lifetime;
        self
    }

    /// How long the server keeps a channel binding.
    pub fn channel_lifetime(mut self, lifetime: Duration) -> Self {
        self.channel_lifetime = lifetime;
        self
    }

    /// Whether to bind channels to peers and send data as ChannelData.
    pub fn use_channels(mut self, use_channels: bool) -> Self {
        self.use_channels = use_channels;
        self
    }

    /// Timings for the connections of the port.
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// The requested allocation lifetime.
    pub fn get_allocation_lifetime(&self) -> Duration {
        self.allocation_lifetime
    }

    /// The refresh lead.
    pub fn get_refresh_lead(&self) -> Duration {
        self.refresh_lead
    }

    /// The permission lifetime.
    pub fn get_permission_lifetime(&self) -> Duration {
        self.permission_lifetime
    }

    /// The channel lifetime.
    pub fn get_channel_lifetime(&self) -> Duration {
        self.channel_lifetime
    }

    /// Whether channels are used.
    pub fn get_use_channels(&self) -> bool {
        self.use_channels
    }

    /// The connection timings.
    pub fn get_connection(&self) -> ConnectionConfig {
        self.connection
    }

    // Refreshes happen `refresh_lead` before expiry unless the lifetime is so short that half of
    // it comes first.
    pub(crate) fn refresh_at(
        &self,
        expires_at: std::time::Instant,
        lifetime: Duration,
    ) -> std::time::Instant {
        if lifetime > self.refresh_lead * 2 {
            expires_at - self.refresh_lead
        } else {
            expires_at - lifetime / 2
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn defaults() {
        let config = TurnPortConfig::default();
        assert_eq!(config.get_allocation_lifetime(), Duration::from_secs(600));
        assert_eq!(config.get_refresh_lead(), Duration::from_secs(60));
        assert_eq!(config.get_permission_lifetime(), Duration::from_secs(300));
        assert_eq!(config.get_channel_lifetime(), Duration::from_secs(600));
        assert!(config.get_use_channels());
        assert_eq!(
            config.get_connection().get_write_timeout(),
            Duration::from_secs(15)
        );
        assert_eq!(config.get_connection().get_write_timeout_pings(), 5);
    }

    #[test]
    fn refresh_time() {
        let config = TurnPortConfig::default();
        let now = Instant::now();
        let lifetime = Duration::from_secs(600);
        assert_eq!(
            config.refresh_at(now + lifetime, lifetime),
            now + Duration::from_secs(540)
        );
        let lifetime = Duration::from_secs(100);
        assert_eq!(
            config.refresh_at(now + lifetime, lifetime),
            now + Duration::from_secs(50)
        );
    }
}
