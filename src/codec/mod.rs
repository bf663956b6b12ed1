// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-codec bitstream preparation.
//!
//! Each codec is one variant of [`Codec`]. H.264 and HEVC carry the cached
//! parameter-set NAL units synthesised from the consumer's parsed picture
//! parameters; the block-format codecs (VP8, VP9, AV1) forward their frame
//! payloads untouched.

pub mod h264;
pub mod hevc;
pub mod vp8;
pub mod vp9;

use v4l2r::PixelFormat;

use crate::bitstream::Bitstream;
use crate::Profile;

/// The slice parameter fields the assembler consumes. The parsed-slice
/// buffers carry far more, but a stateful decoder only needs to know where
/// each payload sits inside the slice-data buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceParameter {
    pub slice_data_size: u32,
    pub slice_data_offset: u32,
}

/// Parsed picture parameters, per codec.
#[derive(Clone, Debug)]
pub enum PictureParameters {
    H264(h264::PictureParameters),
    Hevc(hevc::PictureParameters),
}

/// Returns the payload of one slice, or `None` when the parameters point
/// outside the slice-data buffer.
pub(crate) fn slice_payload<'a>(data: &'a [u8], param: &SliceParameter) -> Option<&'a [u8]> {
    let start = param.slice_data_offset as usize;
    let end = start.checked_add(param.slice_data_size as usize)?;
    data.get(start..end)
}

/// Codec-specific behaviour of a decode session.
pub enum Codec {
    H264(h264::H264State),
    Hevc(hevc::HevcState),
    Vp8,
    Vp9,
    /// Advertised for passthrough only. Header synthesis for AV1 is not
    /// implemented; this presumes the consumer submits a complete OBU
    /// stream.
    Av1,
}

impl Codec {
    pub fn from_profile(profile: Profile) -> Codec {
        match profile {
            Profile::H264ConstrainedBaseline | Profile::H264Main | Profile::H264High => {
                Codec::H264(Default::default())
            }
            Profile::HevcMain | Profile::HevcMain10 => Codec::Hevc(Default::default()),
            Profile::Vp8Version0_3 => Codec::Vp8,
            Profile::Vp9Profile0 | Profile::Vp9Profile2 => Codec::Vp9,
            Profile::Av1Profile0 => Codec::Av1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264(_) => "H.264",
            Codec::Hevc(_) => "HEVC",
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
            Codec::Av1 => "AV1",
        }
    }

    /// Coded pixel format submitted on the device's input queue.
    pub fn pixelformat(&self) -> PixelFormat {
        match self {
            Codec::H264(_) => PixelFormat::from_fourcc(b"H264"),
            Codec::Hevc(_) => PixelFormat::from_fourcc(b"HEVC"),
            Codec::Vp8 => PixelFormat::from_fourcc(b"VP80"),
            Codec::Vp9 => PixelFormat::from_fourcc(b"VP90"),
            Codec::Av1 => PixelFormat::from_fourcc(b"AV01"),
        }
    }

    /// Feeds new picture parameters to the codec, refreshing its cached
    /// header NAL units. Codecs without synthesised headers ignore this.
    pub fn handle_picture_params(&mut self, params: &PictureParameters) {
        match (self, params) {
            (Codec::H264(state), PictureParameters::H264(pic)) => state.update(pic),
            (Codec::Hevc(state), PictureParameters::Hevc(pic)) => state.update(pic),
            (codec, _) => {
                log::debug!("{}: ignoring mismatched picture parameters", codec.name())
            }
        }
    }

    /// Appends the picture's slice payloads to the assembly buffer,
    /// inserting synthesised headers ahead of keyframes where the codec
    /// needs them.
    pub fn handle_slice_data(
        &mut self,
        bitstream: &mut Bitstream,
        slices: &[SliceParameter],
        data: &[u8],
    ) {
        match self {
            Codec::H264(state) => state.assemble(bitstream, slices, data),
            Codec::Hevc(state) => state.assemble(bitstream, slices, data),
            Codec::Vp8 => vp8::assemble(bitstream, slices, data),
            Codec::Vp9 => vp9::assemble(bitstream, slices, data),
            Codec::Av1 => {
                // Raw OBU passthrough, same shape as the VP9 path.
                for param in slices {
                    match slice_payload(data, param) {
                        Some(payload) => bitstream.append(payload),
                        None => log::warn!("AV1: slice parameters out of range, dropped"),
                    }
                }
            }
        }
    }

    /// Final fix-up hook run right before the assembled bitstream is handed
    /// to the kernel. No current codec needs one.
    pub fn prepare_bitstream(&mut self, _bitstream: &mut Bitstream) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_to_codec() {
        assert!(matches!(Codec::from_profile(Profile::H264Main), Codec::H264(_)));
        assert!(matches!(Codec::from_profile(Profile::HevcMain10), Codec::Hevc(_)));
        assert!(matches!(Codec::from_profile(Profile::Vp8Version0_3), Codec::Vp8));
        assert!(matches!(Codec::from_profile(Profile::Vp9Profile2), Codec::Vp9));
        assert!(matches!(Codec::from_profile(Profile::Av1Profile0), Codec::Av1));
    }

    #[test]
    fn slice_payload_bounds() {
        let data = [0u8; 16];
        let ok = SliceParameter { slice_data_offset: 8, slice_data_size: 8 };
        assert_eq!(slice_payload(&data, &ok).map(|p| p.len()), Some(8));
        let overrun = SliceParameter { slice_data_offset: 8, slice_data_size: 9 };
        assert!(slice_payload(&data, &overrun).is_none());
        let overflow = SliceParameter { slice_data_offset: u32::MAX, slice_data_size: 2 };
        assert!(slice_payload(&data, &overflow).is_none());
    }

    #[test]
    fn mismatched_picture_params_are_ignored() {
        let mut codec = Codec::Vp9;
        codec.handle_picture_params(&PictureParameters::H264(Default::default()));
        let mut bitstream = Bitstream::new();
        let slices = [SliceParameter { slice_data_offset: 0, slice_data_size: 3 }];
        codec.handle_slice_data(&mut bitstream, &slices, &[1, 2, 3]);
        assert_eq!(bitstream.as_slice(), &[1, 2, 3]);
    }
}
