// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![no_main]
use std::sync::Once;

use libfuzzer_sys::fuzz_target;

#[macro_use]
extern crate tracing;
use tracing_subscriber::EnvFilter;

use relay_types::channel::ChannelData;
use relay_types::framing::StreamFramer;

#[derive(arbitrary::Arbitrary, Debug)]
struct Chunks<'data> {
    chunks: Vec<&'data [u8]>,
}

pub fn debug_init() {
    static TRACING: Once = Once::new();

    TRACING.call_once(|| {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}

fuzz_target!(|input: Chunks| {
    debug_init();
    let mut framer = StreamFramer::new();
    for chunk in input.chunks {
        if let Ok(channel) = ChannelData::parse(chunk) {
            assert!(channel.data().len() <= chunk.len() - ChannelData::HEADER_LEN);
        }
        framer.push(chunk);
        loop {
            match framer.pop() {
                Ok(Some(frame)) => {
                    debug!("frame of {} bytes", frame.as_ref().len());
                    assert!(!frame.as_ref().is_empty());
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("framing failed: {e}");
                    return;
                }
            }
        }
    }
});
