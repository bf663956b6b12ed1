// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VP9 bitstream preparation.
//!
//! Like VP8, VP9 frames carry their own headers. A payload may be a
//! superframe bundling several frames; the decoder unpacks those itself,
//! so everything is forwarded verbatim.

use crate::bitstream::Bitstream;
use crate::codec::slice_payload;
use crate::codec::SliceParameter;

pub(crate) fn assemble(bitstream: &mut Bitstream, slices: &[SliceParameter], data: &[u8]) {
    for param in slices {
        match slice_payload(data, param) {
            Some(payload) => bitstream.append(payload),
            None => log::warn!("VP9: slice parameters out of range, dropped"),
        }
    }
}
