// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TURN [`ChannelData`] messages.
//!
//! The four byte header alternative to Send and Data indications once a channel has been bound to
//! a peer.

use stun_types::message::StunParseError;

/// A [`ChannelData`] message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelData<'a> {
    id: u16,
    data: &'a [u8],
}

impl<'a> ChannelData<'a> {
    /// Size of the channel number and length header.
    pub const HEADER_LEN: usize = 4;

    /// Construct a new [`ChannelData`] with the provided identifer and byte sequence.
    pub fn new(id: u16, data: &'a [u8]) -> Self {
        Self { id, data }
    }

    /// The channel identifier.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The payload.
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// Parse a sequence of bytes into a [`ChannelData`].  Any bytes after the announced length
    /// (e.g. stream padding) are ignored.
    ///
    /// # Examples
    /// ```
    /// # use relay_types::channel::*;
    /// let data = [4; 3];
    /// let channel = ChannelData::new(0x4000, &data);
    /// let bytes = channel.to_vec(false);
    /// assert_eq!(bytes.len(), 7);
    /// let parsed = ChannelData::parse(&bytes).unwrap();
    /// assert_eq!(parsed, channel);
    /// ```
    pub fn parse(data: &'a [u8]) -> Result<Self, StunParseError> {
        let (id, len) = Self::parse_header(data)?;

        if len + Self::HEADER_LEN > data.len() {
            return Err(StunParseError::Truncated {
                expected: Self::HEADER_LEN + len,
                actual: data.len(),
            });
        }

        Ok(ChannelData {
            id,
            data: &data[Self::HEADER_LEN..Self::HEADER_LEN + len],
        })
    }

    /// Parse the header returning the channel ID and the length of the payload.
    ///
    /// # Examples
    /// ```
    /// # use relay_types::channel::*;
    /// let bytes = ChannelData::new(0x4000, &[4; 3]).to_vec(true);
    /// assert_eq!(bytes.len(), 8);
    /// assert_eq!(ChannelData::parse_header(&bytes).unwrap(), (0x4000, 3));
    /// ```
    pub fn parse_header(data: &[u8]) -> Result<(u16, usize), StunParseError> {
        if data.len() < Self::HEADER_LEN {
            return Err(StunParseError::Truncated {
                expected: Self::HEADER_LEN,
                actual: data.len(),
            });
        }
        let id = u16::from_be_bytes([data[0], data[1]]);
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;

        if !(0x4000..=0xFFFE).contains(&id) {
            return Err(StunParseError::InvalidAttributeData);
        }

        Ok((id, len))
    }

    /// The number of bytes this message occupies on the wire.  Over a stream transport the
    /// message is padded to a multiple of 4 bytes.
    pub fn wire_len(&self, padded: bool) -> usize {
        let len = Self::HEADER_LEN + self.data.len();
        if padded {
            padded_len(len)
        } else {
            len
        }
    }

    /// Write this [`ChannelData`] into `dest` returning the number of bytes written.
    ///
    /// `dest` must be at least [`wire_len(padded)`](Self::wire_len) bytes long.
    pub fn write_into_unchecked(self, dest: &mut [u8], padded: bool) -> usize {
        let len = self.wire_len(padded);
        dest[..2].copy_from_slice(&self.id.to_be_bytes());
        dest[2..4].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        dest[4..4 + self.data.len()].copy_from_slice(self.data);
        dest[4 + self.data.len()..len].fill(0);
        len
    }

    /// Write this [`ChannelData`] into a new `Vec<u8>`.
    pub fn to_vec(self, padded: bool) -> Vec<u8> {
        let mut out = vec![0; self.wire_len(padded)];
        self.write_into_unchecked(&mut out, padded);
        out
    }
}

/// Round `len` up to the next multiple of 4.
pub(crate) fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

impl std::fmt::Display for ChannelData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ChannelData(id: {:#06x}, data of {} bytes)",
            self.id,
            self.data.len()
        )
    }
}

impl AsRef<[u8]> for ChannelData<'_> {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}
