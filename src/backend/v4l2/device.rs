// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`DecoderDevice`] over one V4L2 stateful decoder node.
//!
//! All buffers are MMAP memory. Input buffers are single-plane and mapped
//! eagerly at allocation; output planes are mapped lazily on the first
//! readback and cached (mappings unmap on drop, so teardown is automatic).

use std::fs::File;
use std::path::Path;

use anyhow::anyhow;
use anyhow::Context;
use v4l2r::device::Device;
use v4l2r::device::DeviceConfig;
use v4l2r::ioctl;
use v4l2r::ioctl::DqBufError;
use v4l2r::ioctl::DqEventError;
use v4l2r::ioctl::EventType;
use v4l2r::ioctl::ExpbufFlags;
use v4l2r::ioctl::PlaneMapping;
use v4l2r::ioctl::QBufPlane;
use v4l2r::ioctl::QueryBuffer;
use v4l2r::ioctl::SubscribeEventFlags;
use v4l2r::memory::MemoryType;
use v4l2r::Format;
use v4l2r::PixelFormat;
use v4l2r::PlaneLayout;
use v4l2r::QueueType;

use crate::device::DecoderDevice;
use crate::device::DequeueError;
use crate::device::DeviceEvent;
use crate::device::QueueDirection;
use crate::device::StreamFormat;
use crate::Resolution;

/// Planes an NV12 output buffer can have.
const MAX_OUTPUT_PLANES: usize = 2;

fn queue_type(direction: QueueDirection) -> QueueType {
    match direction {
        QueueDirection::Input => QueueType::VideoOutputMplane,
        QueueDirection::Output => QueueType::VideoCaptureMplane,
    }
}

fn stream_format(format: &Format) -> StreamFormat {
    StreamFormat {
        pixelformat: format.pixelformat,
        resolution: Resolution { width: format.width, height: format.height },
        plane_sizes: format.plane_fmt.iter().map(|plane| plane.sizeimage as usize).collect(),
    }
}

pub struct V4l2Device {
    device: Device,
    input_mappings: Vec<PlaneMapping>,
    output_mappings: Vec<[Option<PlaneMapping>; MAX_OUTPUT_PLANES]>,
    output_planes: usize,
}

impl V4l2Device {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let device = Device::open(path, DeviceConfig::new().non_blocking_dqbuf())
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            device,
            input_mappings: Vec::new(),
            output_mappings: Vec::new(),
            output_planes: MAX_OUTPUT_PLANES,
        })
    }

    /// Maps plane `plane` of output buffer `index` if it is not mapped yet.
    fn ensure_output_mapping(&mut self, index: usize, plane: usize) -> anyhow::Result<()> {
        let slot = self
            .output_mappings
            .get_mut(index)
            .ok_or_else(|| anyhow!("no such output buffer {}", index))?;
        if plane >= MAX_OUTPUT_PLANES {
            return Err(anyhow!("no such output plane {}", plane));
        }
        if slot[plane].is_some() {
            return Ok(());
        }

        let query: QueryBuffer =
            ioctl::querybuf(&self.device, QueueType::VideoCaptureMplane, index)
                .context("querying output buffer")?;
        let info = query
            .planes
            .get(plane)
            .ok_or_else(|| anyhow!("output buffer {} has no plane {}", index, plane))?;
        let mapping = ioctl::mmap(&self.device, info.mem_offset, info.length)
            .context("mapping output plane")?;
        slot[plane] = Some(mapping);
        Ok(())
    }
}

impl DecoderDevice for V4l2Device {
    fn subscribe_events(&mut self) -> anyhow::Result<()> {
        ioctl::subscribe_event(
            &self.device,
            EventType::SourceChange(0),
            SubscriptionFlags::empty(),
        )
        .context("subscribing to source-change events")?;
        // End-of-stream is informational only; decoding works without it.
        if let Err(e) =
            ioctl::subscribe_event(&self.device, EventType::Eos, SubscriptionFlags::empty())
        {
            log::warn!("failed to subscribe to EOS events: {}", e);
        }
        Ok(())
    }

    fn set_input_format(
        &mut self,
        pixelformat: PixelFormat,
        resolution: Resolution,
        sizeimage: u32,
    ) -> anyhow::Result<()> {
        let format = Format {
            width: resolution.width,
            height: resolution.height,
            pixelformat,
            plane_fmt: vec![PlaneLayout { sizeimage, bytesperline: 0 }],
        };
        log::debug!(
            "setting input format {}x{} {}",
            resolution.width,
            resolution.height,
            pixelformat
        );
        let _: Format = ioctl::s_fmt(&mut self.device, (QueueType::VideoOutputMplane, &format))
            .context("setting input format")?;
        Ok(())
    }

    fn request_input_buffers(&mut self, count: u32) -> anyhow::Result<usize> {
        let reqbufs: ioctl::RequestBuffers =
            ioctl::reqbufs(&self.device, QueueType::VideoOutputMplane, MemoryType::Mmap, count)
                .context("requesting input buffers")?;
        let granted = reqbufs.count as usize;

        self.input_mappings.clear();
        for index in 0..granted {
            let query: QueryBuffer =
                ioctl::querybuf(&self.device, QueueType::VideoOutputMplane, index)
                    .context("querying input buffer")?;
            let plane = query
                .planes
                .first()
                .ok_or_else(|| anyhow!("input buffer {} has no planes", index))?;
            let mapping = ioctl::mmap(&self.device, plane.mem_offset, plane.length)
                .context("mapping input buffer")?;
            self.input_mappings.push(mapping);
        }
        log::debug!("allocated {} input buffers", granted);
        Ok(granted)
    }

    fn input_buffer_len(&self, index: usize) -> usize {
        self.input_mappings.get(index).map(|mapping| mapping.len()).unwrap_or(0)
    }

    fn write_input(&mut self, index: usize, data: &[u8]) -> anyhow::Result<()> {
        let mapping = self
            .input_mappings
            .get_mut(index)
            .ok_or_else(|| anyhow!("no such input buffer {}", index))?;
        if data.len() > mapping.len() {
            return Err(anyhow!("bitstream too large: {} > {}", data.len(), mapping.len()));
        }
        mapping.as_mut()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn queue_input(&mut self, index: usize, bytes_used: usize) -> anyhow::Result<()> {
        let _: () = ioctl::qbuf(
            &self.device,
            QueueType::VideoOutputMplane,
            index,
            vec![QBufPlane::new(bytes_used)],
        )
        .context("queueing input buffer")?;
        Ok(())
    }

    fn dequeue_input(&mut self) -> Result<usize, DequeueError> {
        match ioctl::dqbuf::<ioctl::V4l2Buffer>(&self.device, QueueType::VideoOutputMplane) {
            Ok(buffer) => Ok(buffer.index() as usize),
            Err(DqBufError::NotReady) => Err(DequeueError::NotReady),
            Err(e) => Err(DequeueError::Other(e.into())),
        }
    }

    fn output_format(&mut self) -> anyhow::Result<StreamFormat> {
        let format: Format = ioctl::g_fmt(&self.device, QueueType::VideoCaptureMplane)
            .context("querying output format")?;
        Ok(stream_format(&format))
    }

    fn set_output_format(
        &mut self,
        pixelformat: PixelFormat,
        resolution: Resolution,
    ) -> anyhow::Result<StreamFormat> {
        let format = Format {
            width: resolution.width,
            height: resolution.height,
            pixelformat,
            plane_fmt: Vec::new(),
        };
        let applied: Format =
            ioctl::s_fmt(&mut self.device, (QueueType::VideoCaptureMplane, &format))
                .context("setting output format")?;
        Ok(stream_format(&applied))
    }

    fn request_output_buffers(&mut self, count: u32) -> anyhow::Result<usize> {
        let reqbufs: ioctl::RequestBuffers =
            ioctl::reqbufs(&self.device, QueueType::VideoCaptureMplane, MemoryType::Mmap, count)
                .context("requesting output buffers")?;
        let granted = reqbufs.count as usize;

        self.output_mappings.clear();
        self.output_mappings.resize_with(granted, Default::default);
        if granted > 0 {
            let query: QueryBuffer =
                ioctl::querybuf(&self.device, QueueType::VideoCaptureMplane, 0)
                    .context("querying output buffer")?;
            self.output_planes = query.planes.len().min(MAX_OUTPUT_PLANES);
        }
        log::debug!("allocated {} output buffers", granted);
        Ok(granted)
    }

    fn queue_output(&mut self, index: usize) -> anyhow::Result<()> {
        let planes = (0..self.output_planes).map(|_| QBufPlane::new(0)).collect();
        let _: () = ioctl::qbuf(&self.device, QueueType::VideoCaptureMplane, index, planes)
            .context("queueing output buffer")?;
        Ok(())
    }

    fn dequeue_output(&mut self) -> Result<usize, DequeueError> {
        match ioctl::dqbuf::<ioctl::V4l2Buffer>(&self.device, QueueType::VideoCaptureMplane) {
            Ok(buffer) => Ok(buffer.index() as usize),
            Err(DqBufError::NotReady) => Err(DequeueError::NotReady),
            Err(e) => Err(DequeueError::Other(e.into())),
        }
    }

    fn stream_on(&mut self, direction: QueueDirection) -> anyhow::Result<()> {
        ioctl::streamon(&self.device, queue_type(direction)).context("stream on")?;
        Ok(())
    }

    fn stream_off(&mut self, direction: QueueDirection) -> anyhow::Result<()> {
        ioctl::streamoff(&self.device, queue_type(direction)).context("stream off")?;
        Ok(())
    }

    fn dequeue_event(&mut self) -> Result<DeviceEvent, DequeueError> {
        match ioctl::dqevent(&self.device) {
            Ok(ioctl::Event::SrcChangeEvent(changes)) => {
                log::debug!("source change event: {:?}", changes);
                Ok(DeviceEvent::SourceChange)
            }
            Ok(ioctl::Event::Eos) => Ok(DeviceEvent::EndOfStream),
            Err(DqEventError::NotReady) => Err(DequeueError::NotReady),
            Err(e) => Err(DequeueError::Other(e.into())),
        }
    }

    fn export_output_buffer(&mut self, index: usize, plane: usize) -> anyhow::Result<File> {
        let file: File = ioctl::expbuf(
            &self.device,
            QueueType::VideoCaptureMplane,
            index,
            plane,
            ExpbufFlags::CLOEXEC,
        )
        .context("exporting output buffer")?;
        Ok(file)
    }

    fn read_output_plane(
        &mut self,
        index: usize,
        plane: usize,
        dst: &mut [u8],
    ) -> anyhow::Result<usize> {
        self.ensure_output_mapping(index, plane)?;
        let mapping = self.output_mappings[index][plane]
            .as_ref()
            .ok_or_else(|| anyhow!("output plane mapping missing"))?;
        let n = dst.len().min(mapping.len());
        dst[..n].copy_from_slice(&mapping.as_ref()[..n]);
        Ok(n)
    }
}
