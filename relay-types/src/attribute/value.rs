// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fixed size TURN attributes.

use byteorder::{BigEndian, ByteOrder};

use stun_types::{attribute::*, message::StunParseError};

/// The LIFETIME [`Attribute`]: seconds until an allocation expires.
///
/// Reference: [RFC5766 Section 14.2](https://datatracker.ietf.org/doc/html/rfc5766#section-14.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    seconds: u32,
}

impl AttributeStaticType for Lifetime {
    const TYPE: AttributeType = AttributeType::new(0x000D);
}

impl Attribute for Lifetime {
    fn get_type(&self) -> AttributeType {
        Self::TYPE
    }

    fn length(&self) -> u16 {
        4
    }
}

impl AttributeWrite for Lifetime {
    fn to_raw(&self) -> RawAttribute<'_> {
        let mut buf = [0; 4];
        BigEndian::write_u32(&mut buf, self.seconds);
        RawAttribute::new(self.get_type(), &buf).into_owned()
    }

    fn write_into_unchecked(&self, dest: &mut [u8]) {
        self.write_header_unchecked(dest);
        BigEndian::write_u32(&mut dest[4..8], self.seconds);
    }
}

impl AttributeFromRaw<'_> for Lifetime {
    fn from_raw_ref(raw: &RawAttribute) -> Result<Self, StunParseError>
    where
        Self: Sized,
    {
        Self::try_from(raw)
    }
}

impl TryFrom<&RawAttribute<'_>> for Lifetime {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        raw.check_type_and_len(Self::TYPE, 4..=4)?;
        Ok(Self {
            seconds: BigEndian::read_u32(&raw.value),
        })
    }
}

impl Lifetime {
    /// Create a new [`Lifetime`].  A value of 0 asks the server to delete an allocation.
    ///
    /// # Examples
    ///
    /// ```
    /// # use relay_types::attribute::*;
    /// assert_eq!(Lifetime::new(600).seconds(), 600);
    /// ```
    pub fn new(seconds: u32) -> Self {
        Self { seconds }
    }

    /// The number of seconds.
    pub fn seconds(&self) -> u32 {
        self.seconds
    }
}

impl std::fmt::Display for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}s", self.get_type(), self.seconds)
    }
}

/// The CHANNEL-NUMBER [`Attribute`] of a [`CHANNEL_BIND`](crate::message::CHANNEL_BIND)
/// request.
///
/// Reference: [RFC5766 Section 14.1](https://datatracker.ietf.org/doc/html/rfc5766#section-14.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelNumber {
    channel: u16,
}

impl AttributeStaticType for ChannelNumber {
    const TYPE: AttributeType = AttributeType::new(0x000C);
}

impl Attribute for ChannelNumber {
    fn get_type(&self) -> AttributeType {
        Self::TYPE
    }

    fn length(&self) -> u16 {
        4
    }
}

impl AttributeWrite for ChannelNumber {
    fn to_raw(&self) -> RawAttribute<'_> {
        let mut buf = [0; 4];
        BigEndian::write_u16(&mut buf[..2], self.channel);
        RawAttribute::new(self.get_type(), &buf).into_owned()
    }

    fn write_into_unchecked(&self, dest: &mut [u8]) {
        self.write_header_unchecked(dest);
        BigEndian::write_u16(&mut dest[4..6], self.channel);
        // RFFU
        dest[6..8].fill(0);
    }
}

impl AttributeFromRaw<'_> for ChannelNumber {
    fn from_raw_ref(raw: &RawAttribute) -> Result<Self, StunParseError>
    where
        Self: Sized,
    {
        Self::try_from(raw)
    }
}

impl TryFrom<&RawAttribute<'_>> for ChannelNumber {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        raw.check_type_and_len(Self::TYPE, 4..=4)?;
        Ok(Self {
            channel: BigEndian::read_u16(&raw.value[..2]),
        })
    }
}

impl ChannelNumber {
    /// The range of channel numbers a client may bind.
    pub const BINDABLE: std::ops::RangeInclusive<u16> = 0x4000..=0x7FFF;

    /// Create a new [`ChannelNumber`].
    ///
    /// # Examples
    ///
    /// ```
    /// # use relay_types::attribute::*;
    /// let channel = ChannelNumber::new(0x4001);
    /// assert_eq!(channel.channel(), 0x4001);
    /// assert!(channel.is_bindable());
    /// ```
    pub fn new(channel: u16) -> Self {
        Self { channel }
    }

    /// The channel number.
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Whether a ChannelBind request for this number is valid.
    pub fn is_bindable(&self) -> bool {
        Self::BINDABLE.contains(&self.channel)
    }
}

impl std::fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:#06x}", self.get_type(), self.channel)
    }
}

/// The REQUESTED-TRANSPORT [`Attribute`] of an Allocate request.
///
/// Reference: [RFC5766 Section 14.7](https://datatracker.ietf.org/doc/html/rfc5766#section-14.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedTransport {
    protocol: u8,
}

impl AttributeStaticType for RequestedTransport {
    const TYPE: AttributeType = AttributeType::new(0x0019);
}

impl Attribute for RequestedTransport {
    fn get_type(&self) -> AttributeType {
        Self::TYPE
    }

    fn length(&self) -> u16 {
        4
    }
}

impl AttributeWrite for RequestedTransport {
    fn to_raw(&self) -> RawAttribute<'_> {
        RawAttribute::new(self.get_type(), &[self.protocol, 0, 0, 0]).into_owned()
    }

    fn write_into_unchecked(&self, dest: &mut [u8]) {
        self.write_header_unchecked(dest);
        dest[4] = self.protocol;
        dest[5..8].fill(0);
    }
}

impl AttributeFromRaw<'_> for RequestedTransport {
    fn from_raw_ref(raw: &RawAttribute) -> Result<Self, StunParseError>
    where
        Self: Sized,
    {
        Self::try_from(raw)
    }
}

impl TryFrom<&RawAttribute<'_>> for RequestedTransport {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        raw.check_type_and_len(Self::TYPE, 4..=4)?;
        Ok(Self {
            protocol: raw.value[0],
        })
    }
}

impl RequestedTransport {
    /// IANA protocol number for UDP, the only relayed transport RFC5766 defines.
    pub const UDP: u8 = 17;

    /// Create a new [`RequestedTransport`] for the IANA protocol number `protocol`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use relay_types::attribute::*;
    /// let transport = RequestedTransport::new(RequestedTransport::UDP);
    /// assert_eq!(transport.protocol(), 17);
    /// ```
    pub fn new(protocol: u8) -> Self {
        Self { protocol }
    }

    /// The IANA protocol number.
    pub fn protocol(&self) -> u8 {
        self.protocol
    }
}

impl std::fmt::Display for RequestedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.get_type(), self.protocol)
    }
}

/// The DONT-FRAGMENT [`Attribute`].  Carries no value.
///
/// Reference: [RFC5766 Section 14.8](https://datatracker.ietf.org/doc/html/rfc5766#section-14.8).
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DontFragment {}

impl AttributeStaticType for DontFragment {
    const TYPE: AttributeType = AttributeType::new(0x001A);
}

impl Attribute for DontFragment {
    fn get_type(&self) -> AttributeType {
        Self::TYPE
    }

    fn length(&self) -> u16 {
        0
    }
}

impl AttributeWrite for DontFragment {
    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(self.get_type(), &[])
    }

    fn write_into_unchecked(&self, dest: &mut [u8]) {
        self.write_header_unchecked(dest);
    }
}

impl AttributeFromRaw<'_> for DontFragment {
    fn from_raw_ref(raw: &RawAttribute) -> Result<Self, StunParseError>
    where
        Self: Sized,
    {
        Self::try_from(raw)
    }
}

impl TryFrom<&RawAttribute<'_>> for DontFragment {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        raw.check_type_and_len(Self::TYPE, 0..=0)?;
        Ok(Self {})
    }
}

impl DontFragment {
    /// Create a new [`DontFragment`].
    pub fn new() -> Self {
        Self {}
    }
}

impl std::fmt::Display for DontFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_type())
    }
}
