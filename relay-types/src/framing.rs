// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Framing of TURN traffic carried over a byte stream.
//!
//! Over TCP, STUN messages and [`ChannelData`] messages follow each other without any
//! additional framing. The two leading bits of each frame tell them apart (`0b00` for STUN,
//! `0b01` for channel data) and channel data is padded to a multiple of 4 bytes.

use stun_types::message::{MessageHeader, StunParseError};
use tracing::{trace, warn};

use crate::channel::{padded_len, ChannelData};

/// A complete frame taken out of a [`StreamFramer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A STUN message.
    Message(Vec<u8>),
    /// A channel data message including its 4 byte header but without any padding.
    Channel(Vec<u8>),
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Message(data) => data,
            Self::Channel(data) => data,
        }
    }
}

/// Errors produced by a [`StreamFramer`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StreamFramingError {
    /// The stream does not start with a STUN message or channel data.
    #[error("Unrecognised frame starting with {0:#04x}")]
    UnknownFrame(u8),
    /// The frame header could not be parsed.
    #[error("Failed to parse frame header: {0}")]
    Parse(#[from] StunParseError),
}

/// Reassembles [`Frame`]s out of the chunks read from a stream.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: Vec<u8>,
}

impl StreamFramer {
    /// Construct a new empty [`StreamFramer`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next chunk read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// The number of bytes buffered that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame out of the buffer.
    ///
    /// On error the buffered data is discarded as the stream can not be resynchronised.
    pub fn pop(&mut self) -> Result<Option<Frame>, StreamFramingError> {
        let Some(&first) = self.buffer.first() else {
            return Ok(None);
        };
        let ret = match first >> 6 {
            0b00 => self.pop_message(),
            0b01 => self.pop_channel(),
            _ => Err(StreamFramingError::UnknownFrame(first)),
        };
        if let Err(e) = &ret {
            warn!("Dropping {} buffered bytes: {e}", self.buffer.len());
            self.buffer.clear();
        }
        ret
    }

    fn pop_message(&mut self) -> Result<Option<Frame>, StreamFramingError> {
        if self.buffer.len() < MessageHeader::LENGTH {
            return Ok(None);
        }
        let hdr = MessageHeader::from_bytes(&self.buffer)?;
        let msg_len = MessageHeader::LENGTH + hdr.data_length() as usize;
        if self.buffer.len() < msg_len {
            trace!("have {} of {msg_len} message bytes", self.buffer.len());
            return Ok(None);
        }
        let rest = self.buffer.split_off(msg_len);
        Ok(Some(Frame::Message(std::mem::replace(
            &mut self.buffer,
            rest,
        ))))
    }

    fn pop_channel(&mut self) -> Result<Option<Frame>, StreamFramingError> {
        if self.buffer.len() < ChannelData::HEADER_LEN {
            return Ok(None);
        }
        let (_id, len) = ChannelData::parse_header(&self.buffer)?;
        let frame_len = ChannelData::HEADER_LEN + len;
        let wire_len = padded_len(frame_len);
        if self.buffer.len() < wire_len {
            trace!("have {} of {wire_len} channel bytes", self.buffer.len());
            return Ok(None);
        }
        let rest = self.buffer.split_off(wire_len);
        let mut frame = std::mem::replace(&mut self.buffer, rest);
        frame.truncate(frame_len);
        Ok(Some(Frame::Channel(frame)))
    }
}
