// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VP8 bitstream preparation.
//!
//! VP8 has no NAL framing and no out-of-band parameter sets: the frame
//! header travels inside the frame payload, so the slice data is forwarded
//! to the decoder exactly as received.

use crate::bitstream::Bitstream;
use crate::codec::slice_payload;
use crate::codec::SliceParameter;

pub(crate) fn assemble(bitstream: &mut Bitstream, slices: &[SliceParameter], data: &[u8]) {
    for param in slices {
        match slice_payload(data, param) {
            Some(payload) => bitstream.append(payload),
            None => log::warn!("VP8: slice parameters out of range, dropped"),
        }
    }
}
