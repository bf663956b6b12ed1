// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! V4L2 decoder discovery.

pub mod device;

use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use v4l2r::device::Device;
use v4l2r::device::DeviceConfig;
use v4l2r::ioctl;
use v4l2r::ioctl::Capabilities;
use v4l2r::ioctl::Capability;
use v4l2r::ioctl::FormatIterator;
use v4l2r::PixelFormat;
use v4l2r::QueueType;

use crate::device::DecoderDevice;
use crate::device::DeviceBackend;

use self::device::V4l2Device;

/// Video nodes tried in order when looking for a decoder.
const DEVICE_PATHS: &[&str] = &["/dev/video0", "/dev/video-dec0"];

fn open_node(path: &Path) -> anyhow::Result<Device> {
    Ok(Device::open(path, DeviceConfig::new().non_blocking_dqbuf())?)
}

/// A discovered V4L2 memory-to-memory decoder node.
pub struct V4l2Backend {
    path: PathBuf,
}

impl V4l2Backend {
    /// Probes the well-known device paths and keeps the first node that
    /// reports memory-to-memory video capability.
    pub fn discover() -> anyhow::Result<V4l2Backend> {
        for path in DEVICE_PATHS {
            let path = Path::new(path);
            let Ok(device) = open_node(path) else {
                continue;
            };
            let Ok(caps) = ioctl::querycap::<Capability>(&device) else {
                continue;
            };
            if !caps
                .device_caps()
                .intersects(Capabilities::VIDEO_M2M_MPLANE | Capabilities::VIDEO_M2M)
            {
                continue;
            }
            log::info!("opened V4L2 decoder {} ({})", path.display(), caps.card);
            return Ok(V4l2Backend { path: path.to_path_buf() });
        }
        Err(anyhow!("no V4L2 M2M decoder found"))
    }
}

impl DeviceBackend for V4l2Backend {
    fn coded_formats(&self) -> anyhow::Result<Vec<PixelFormat>> {
        let device = open_node(&self.path)?;
        let formats: Vec<PixelFormat> =
            FormatIterator::new(&device, QueueType::VideoOutputMplane)
                .map(|desc| PixelFormat::from(desc.pixelformat))
                .collect();
        log::info!("coded formats: {:?}", formats);
        Ok(formats)
    }

    fn open_decoder(&self) -> anyhow::Result<Box<dyn DecoderDevice>> {
        Ok(Box::new(V4l2Device::open(&self.path)?))
    }
}
