// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use stun_types::{attribute::*, message::StunParseError};

/// The DATA [`Attribute`]: the application payload of Send and Data indications.
#[derive(Debug, Clone)]
pub struct Data<'a> {
    data: stun_types::data::Data<'a>,
}

impl AttributeStaticType for Data<'_> {
    const TYPE: AttributeType = AttributeType::new(0x0013);
}

impl Attribute for Data<'_> {
    fn get_type(&self) -> AttributeType {
        Self::TYPE
    }

    fn length(&self) -> u16 {
        self.data.len() as u16
    }
}

impl AttributeWrite for Data<'_> {
    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(self.get_type(), &self.data)
    }

    fn write_into_unchecked(&self, dest: &mut [u8]) {
        self.write_header_unchecked(dest);
        dest[4..4 + self.data.len()].copy_from_slice(&self.data);
    }
}

impl<'a> AttributeFromRaw<'a> for Data<'a> {
    fn from_raw_ref(raw: &RawAttribute) -> Result<Self, StunParseError>
    where
        Self: Sized,
    {
        raw.check_type_and_len(Self::TYPE, ..)?;
        Ok(Self {
            data: raw.value.clone().into_owned(),
        })
    }

    fn from_raw(raw: RawAttribute<'a>) -> Result<Self, StunParseError>
    where
        Self: Sized,
    {
        Self::try_from(raw)
    }
}

impl<'a> TryFrom<RawAttribute<'a>> for Data<'a> {
    type Error = StunParseError;

    fn try_from(raw: RawAttribute<'a>) -> Result<Self, Self::Error> {
        raw.check_type_and_len(Self::TYPE, ..)?;
        Ok(Self { data: raw.value })
    }
}

impl<'a> Data<'a> {
    /// The largest payload a DATA attribute can describe.
    pub const MAX_LEN: usize = u16::MAX as usize;

    /// Wrap `data` in a DATA [`Attribute`].  Returns `None` when `data` is longer than
    /// [`Data::MAX_LEN`].
    ///
    /// # Examples
    ///
    /// ```
    /// # use relay_types::attribute::*;
    /// let bytes = vec![0, 1, 2];
    /// let data = Data::new(&bytes).unwrap();
    /// assert_eq!(data.data(), &bytes);
    /// assert!(Data::new(&vec![0; 70000]).is_none());
    /// ```
    pub fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() > Self::MAX_LEN {
            return None;
        }
        Some(Self {
            data: stun_types::data::Data::from(data),
        })
    }

    /// The payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Display for Data<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: len:{}", self.get_type(), self.data.len())
    }
}
