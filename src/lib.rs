// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode-session layer adapting a VA-style parsed-picture API onto V4L2
//! stateful (memory-to-memory) decoders.
//!
//! The consumer hands us *parsed* stream metadata (sequence, picture and
//! slice parameters) plus raw slice payloads. A stateful decoder wants the
//! opposite: a plain Annex-B bitstream on its input queue, which it parses
//! itself. The bridge is built from three pieces:
//!
//! - [`bitstream`] re-packs syntax elements bit by bit (Exp-Golomb and all)
//!   so that [`codec`] can synthesise the parameter-set NAL units the
//!   demuxer stripped away,
//! - [`codec`] assembles a start-code-delimited bitstream per picture,
//!   inserting the synthesised headers ahead of keyframes,
//! - [`session`] drives the two memory-mapped kernel queues: compressed
//!   input in, decoded NV12 frames out, with the asynchronous source-change
//!   handshake in between.
//!
//! [`driver`] ties it together behind the familiar object-handle surface
//! (configs, contexts, surfaces, buffers, images).

pub mod backend;
pub mod bitstream;
pub mod buffer;
pub mod codec;
pub mod device;
pub mod driver;
mod logging;
pub mod session;
pub mod surface;

use thiserror::Error;

pub use v4l2r::PixelFormat;

/// A frame size, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Bytes needed for one packed NV12 frame at this size.
    pub fn nv12_frame_size(&self) -> usize {
        (self.width as usize * self.height as usize) * 3 / 2
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Codec profiles the driver can be configured for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Profile {
    H264ConstrainedBaseline,
    H264Main,
    H264High,
    HevcMain,
    HevcMain10,
    Vp8Version0_3,
    Vp9Profile0,
    Vp9Profile2,
    Av1Profile0,
}

/// Entry points a config can select. Only [`Entrypoint::Vld`] is decodable
/// here; the others exist so a config request for them can be rejected with
/// the proper code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Entrypoint {
    /// Full slice-level decode.
    Vld,
    EncSlice,
    VideoProc,
}

/// Render-target format bits advertised through config attributes.
pub const RT_FORMAT_YUV420: u32 = 0x0000_0001;
pub const RT_FORMAT_YUV420_10: u32 = 0x0000_0100;

/// Attribute value meaning "not supported" in a config attribute query.
pub const ATTRIB_NOT_SUPPORTED: u32 = 0x8000_0000;

/// Config attribute selectors understood by [`driver::Driver::get_config_attributes`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigAttribType {
    RtFormat,
    MaxPictureWidth,
    MaxPictureHeight,
    /// Post-decode processing; queried by some players, never supported.
    DecProcessing,
}

/// One config attribute slot: the caller picks the type, we fill the value.
#[derive(Copy, Clone, Debug)]
pub struct ConfigAttrib {
    pub attrib_type: ConfigAttribType,
    pub value: u32,
}

/// Object handles. The bases keep the classes visually distinct in logs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigId(pub u32);
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u32);
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub u32);
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u32);

/// Images share the buffer ID space, like the original object model.
pub type ImageId = BufferId;

pub(crate) const CONFIG_ID_BASE: u32 = 1;
pub(crate) const CONTEXT_ID_BASE: u32 = 0x1001;
pub(crate) const SURFACE_ID_BASE: u32 = 0x2001;
pub(crate) const BUFFER_ID_BASE: u32 = 0x3001;

/// Error codes surfaced to the API consumer.
#[derive(Debug, Error)]
pub enum VaError {
    #[error("invalid config handle")]
    InvalidConfig,
    #[error("invalid context handle")]
    InvalidContext,
    #[error("invalid surface handle")]
    InvalidSurface,
    #[error("invalid buffer handle")]
    InvalidBuffer,
    #[error("invalid image handle")]
    InvalidImage,
    #[error("unsupported profile")]
    UnsupportedProfile,
    #[error("unsupported entrypoint")]
    UnsupportedEntrypoint,
    #[error("unsupported memory type")]
    UnsupportedMemoryType,
    #[error("allocation failed")]
    AllocationFailed,
    #[error("surface is still being decoded")]
    SurfaceBusy,
    #[error("operation failed")]
    OperationFailed(#[from] anyhow::Error),
    #[error("entry point not implemented")]
    Unimplemented,
}

pub type VaResult<T> = Result<T, VaError>;

/// Profiles advertised for a coded (input-queue) pixel format.
pub fn profiles_for_coded_format(pixelformat: PixelFormat) -> &'static [Profile] {
    const H264: &[Profile] =
        &[Profile::H264ConstrainedBaseline, Profile::H264Main, Profile::H264High];
    const HEVC: &[Profile] = &[Profile::HevcMain, Profile::HevcMain10];
    const VP8: &[Profile] = &[Profile::Vp8Version0_3];
    const VP9: &[Profile] = &[Profile::Vp9Profile0, Profile::Vp9Profile2];
    const AV1: &[Profile] = &[Profile::Av1Profile0];

    if pixelformat == PixelFormat::from_fourcc(b"H264") {
        H264
    } else if pixelformat == PixelFormat::from_fourcc(b"HEVC") {
        HEVC
    } else if pixelformat == PixelFormat::from_fourcc(b"VP80") {
        VP8
    } else if pixelformat == PixelFormat::from_fourcc(b"VP90") {
        VP9
    } else if pixelformat == PixelFormat::from_fourcc(b"AV01") {
        AV1
    } else {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_format_profile_mapping() {
        assert_eq!(profiles_for_coded_format(PixelFormat::from_fourcc(b"H264")).len(), 3);
        assert_eq!(profiles_for_coded_format(PixelFormat::from_fourcc(b"HEVC")).len(), 2);
        assert_eq!(profiles_for_coded_format(PixelFormat::from_fourcc(b"VP80")).len(), 1);
        assert_eq!(profiles_for_coded_format(PixelFormat::from_fourcc(b"VP90")).len(), 2);
        assert_eq!(profiles_for_coded_format(PixelFormat::from_fourcc(b"AV01")).len(), 1);
        assert!(profiles_for_coded_format(PixelFormat::from_fourcc(b"MJPG")).is_empty());
    }

    #[test]
    fn nv12_frame_size() {
        let res = Resolution { width: 640, height: 480 };
        assert_eq!(res.nv12_frame_size(), 640 * 480 * 3 / 2);
    }
}
