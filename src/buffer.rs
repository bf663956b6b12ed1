// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Consumer-visible buffers and images.
//!
//! Buffers are typed by payload rather than by a type tag plus opaque
//! bytes. Image buffers have two independent owners: the consumer handle
//! (released by destroy) and an active mapping (released by unmap). The
//! entry is freed only once both are gone, so destroying a still-mapped
//! image defers the free to the unmap.

use crate::codec::PictureParameters;
use crate::codec::SliceParameter;
use crate::ImageId;
use crate::SurfaceId;

/// Payload of a consumer buffer.
#[derive(Clone, Debug)]
pub enum BufferData {
    PictureParameters(PictureParameters),
    SliceParameters(Vec<SliceParameter>),
    SliceData(Vec<u8>),
    /// Accepted and ignored: a stateful decoder derives quantisation
    /// matrices from the bitstream itself.
    IqMatrix,
    /// Pixel storage for an image created through the image calls.
    Image(Vec<u8>),
}

/// Buffer type tags reported through the info query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferType {
    PictureParameter,
    SliceParameter,
    SliceData,
    IqMatrix,
    Image,
}

/// Image pixel layout description handed to the consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    LsbFirst,
    MsbFirst,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageFormat {
    pub fourcc: u32,
    pub byte_order: ByteOrder,
    pub bits_per_pixel: u32,
}

/// NV12 is the only image format decoded frames come in.
pub const FOURCC_NV12: u32 = u32::from_le_bytes(*b"NV12");

/// An image: a described pixel layout plus the buffer holding the pixels.
#[derive(Copy, Clone, Debug)]
pub struct Image {
    pub id: ImageId,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub num_planes: u32,
    pub pitches: [u32; 2],
    pub offsets: [u32; 2],
    pub data_size: u32,
    pub buf: ImageId,
}

impl Image {
    /// Describes a packed NV12 image: an 8-bit Y plane followed by an
    /// interleaved half-resolution UV plane.
    pub(crate) fn nv12(id: ImageId, width: u32, height: u32) -> Image {
        Image {
            id,
            format: ImageFormat {
                fourcc: FOURCC_NV12,
                byte_order: ByteOrder::LsbFirst,
                bits_per_pixel: 12,
            },
            width,
            height,
            num_planes: 2,
            pitches: [width, width],
            offsets: [0, width * height],
            data_size: width * height * 3 / 2,
            buf: id,
        }
    }
}

/// One entry in the driver's buffer table.
pub(crate) struct VaBuffer {
    pub data: BufferData,
    pub num_elements: u32,
    /// Surface whose decoded kernel buffer backs this image, when the
    /// image was derived rather than created standalone.
    pub derived_from: Option<SurfaceId>,
    /// Pixel dimensions, for image buffers.
    pub image_size: Option<crate::Resolution>,
    /// The image is currently mapped by the consumer.
    pub mapped: bool,
    /// Destroy arrived while mapped; free on unmap.
    pub destroy_deferred: bool,
}

impl VaBuffer {
    pub(crate) fn new(data: BufferData, num_elements: u32) -> Self {
        Self {
            data,
            num_elements,
            derived_from: None,
            image_size: None,
            mapped: false,
            destroy_deferred: false,
        }
    }

    pub(crate) fn buffer_type(&self) -> BufferType {
        match self.data {
            BufferData::PictureParameters(_) => BufferType::PictureParameter,
            BufferData::SliceParameters(_) => BufferType::SliceParameter,
            BufferData::SliceData(_) => BufferType::SliceData,
            BufferData::IqMatrix => BufferType::IqMatrix,
            BufferData::Image(_) => BufferType::Image,
        }
    }

    pub(crate) fn size(&self) -> usize {
        match &self.data {
            BufferData::PictureParameters(_) => std::mem::size_of::<PictureParameters>(),
            BufferData::SliceParameters(params) => {
                params.len() * std::mem::size_of::<SliceParameter>()
            }
            BufferData::SliceData(data) => data.len(),
            BufferData::IqMatrix => 0,
            BufferData::Image(data) => data.len(),
        }
    }
}
