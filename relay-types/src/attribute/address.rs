// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::SocketAddr;

use stun_types::{
    attribute::*,
    message::{StunParseError, TransactionId},
};

// Both TURN address attributes share the XOR-MAPPED-ADDRESS encoding and only differ in their
// attribute type.
macro_rules! xor_address_attribute {
    ($(#[$meta:meta])* $name:ident, $type:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            // kept XOR-ed, the transaction id is needed to recover the address
            addr: XorSocketAddr,
        }

        impl AttributeStaticType for $name {
            const TYPE: AttributeType = AttributeType::new($type);
        }

        impl Attribute for $name {
            fn get_type(&self) -> AttributeType {
                Self::TYPE
            }

            fn length(&self) -> u16 {
                self.addr.length()
            }
        }

        impl AttributeWrite for $name {
            fn to_raw(&self) -> RawAttribute<'_> {
                self.addr.to_raw(self.get_type())
            }

            fn write_into_unchecked(&self, dest: &mut [u8]) {
                self.write_header_unchecked(dest);
                self.addr.write_into_unchecked(&mut dest[4..]);
            }
        }

        impl AttributeFromRaw<'_> for $name {
            fn from_raw_ref(raw: &RawAttribute) -> Result<Self, StunParseError>
            where
                Self: Sized,
            {
                Self::try_from(raw)
            }
        }

        impl TryFrom<&RawAttribute<'_>> for $name {
            type Error = StunParseError;

            fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
                raw.check_type_and_len(Self::TYPE, 4..=20)?;
                Ok(Self {
                    addr: XorSocketAddr::from_raw(raw)?,
                })
            }
        }

        impl $name {
            /// Create the attribute for `addr` as sent in the message with id `transaction`.
            pub fn new(addr: SocketAddr, transaction: TransactionId) -> Self {
                Self {
                    addr: XorSocketAddr::new(addr, transaction),
                }
            }

            /// Recover the address using the id of the message this attribute was read from.
            pub fn addr(&self, transaction: TransactionId) -> SocketAddr {
                self.addr.addr(transaction)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}: {}", self.get_type(), self.addr)
            }
        }
    };
}

xor_address_attribute!(
    /// The XOR-PEER-ADDRESS [`Attribute`].
    ///
    /// The peer a Send indication, CreatePermission or ChannelBind is aimed at, or the peer a
    /// Data indication arrived from.
    ///
    /// Reference: [RFC5766 Section 14.3](https://datatracker.ietf.org/doc/html/rfc5766#section-14.3).
    ///
    /// # Examples
    ///
    /// ```
    /// # use relay_types::attribute::*;
    /// let addr = "127.0.0.1:1234".parse().unwrap();
    /// let peer = XorPeerAddress::new(addr, 0x5678.into());
    /// assert_eq!(peer.addr(0x5678.into()), addr);
    /// ```
    XorPeerAddress,
    0x0012
);

xor_address_attribute!(
    /// The XOR-RELAYED-ADDRESS [`Attribute`].
    ///
    /// The address the server allocated on behalf of the client.
    ///
    /// Reference: [RFC5766 Section 14.5](https://datatracker.ietf.org/doc/html/rfc5766#section-14.5).
    ///
    /// # Examples
    ///
    /// ```
    /// # use relay_types::attribute::*;
    /// let addr = "[::1]:1234".parse().unwrap();
    /// let relayed = XorRelayedAddress::new(addr, 0x5678.into());
    /// assert_eq!(relayed.addr(0x5678.into()), addr);
    /// ```
    XorRelayedAddress,
    0x0016
);

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};

    #[test]
    fn peer_address_is_xored() {
        let _log = crate::tests::test_init_log();
        let transaction = TransactionId::generate();
        let addr: SocketAddr = "192.168.10.1:4000".parse().unwrap();
        let peer = XorPeerAddress::new(addr, transaction);
        let raw = peer.to_raw();
        assert_eq!(raw.get_type(), XorPeerAddress::TYPE);
        // the port is XOR-ed with the top of the magic cookie
        assert_ne!(BigEndian::read_u16(&raw.value[2..4]), 4000);
        let parsed = XorPeerAddress::try_from(&raw).unwrap();
        assert_eq!(parsed.addr(transaction), addr);
    }

    #[test]
    fn relayed_address_wrong_type() {
        let _log = crate::tests::test_init_log();
        let transaction = TransactionId::generate();
        let relayed = XorRelayedAddress::new("[fd12::1]:9000".parse().unwrap(), transaction);
        let mut data: Vec<_> = relayed.to_raw().into();
        BigEndian::write_u16(&mut data[0..2], 0x0012);
        let raw = RawAttribute::from_bytes(&data).unwrap();
        assert!(matches!(
            XorRelayedAddress::try_from(&raw),
            Err(StunParseError::WrongAttributeImplementation)
        ));
        assert_eq!(
            XorPeerAddress::try_from(&raw).unwrap().addr(transaction),
            "[fd12::1]:9000".parse().unwrap()
        );
    }
}
