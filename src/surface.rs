// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded-frame surfaces.
//!
//! A surface is the consumer-visible handle for one decoded frame slot.
//! Once a session dequeues a frame for it, the surface owns that kernel
//! output buffer until it is re-used as a render target, unmapped from a
//! derived image, or destroyed; at most one surface references any output
//! buffer index at a time.

use std::fs::File;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use crate::session::Session;
use crate::Resolution;

/// Decode progress reported to the consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SurfaceStatus {
    Rendering,
    Ready,
}

/// Memory types accepted by the surface-descriptor export.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExportMemoryType {
    DrmPrime,
    DrmPrime2,
}

/// One memory object backing an exported surface.
#[derive(Debug)]
pub struct PrimeObject {
    pub fd: File,
    pub size: u32,
    pub drm_format_modifier: u64,
}

/// One image layer of an exported surface.
#[derive(Copy, Clone, Debug)]
pub struct PrimeLayer {
    pub drm_format: u32,
    pub object_index: u32,
    pub offset: u32,
    pub pitch: u32,
}

/// DMA-BUF description of a decoded NV12 surface.
#[derive(Debug)]
pub struct PrimeSurfaceDescriptor {
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
    pub objects: Vec<PrimeObject>,
    pub layers: Vec<PrimeLayer>,
}

/// Surface attributes advertised for a config.
#[derive(Clone, Debug)]
pub struct SurfaceAttributes {
    pub memory_types: Vec<ExportMemoryType>,
    pub pixel_format: u32,
    pub min_size: Resolution,
    pub max_size: Resolution,
}

#[derive(Default)]
struct State {
    session: Option<Weak<Session>>,
    output_index: Option<usize>,
    decoded: bool,
}

pub struct Surface {
    width: u32,
    height: u32,
    rt_format: u32,
    state: Mutex<State>,
    decoded_cond: Condvar,
}

impl Surface {
    pub(crate) fn new(width: u32, height: u32, rt_format: u32) -> Self {
        Self {
            width,
            height,
            rt_format,
            state: Mutex::new(State::default()),
            decoded_cond: Condvar::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rt_format(&self) -> u32 {
        self.rt_format
    }

    pub fn status(&self) -> SurfaceStatus {
        if self.state.lock().unwrap().decoded {
            SurfaceStatus::Ready
        } else {
            SurfaceStatus::Rendering
        }
    }

    /// The session that last rendered into this surface, if still alive.
    pub(crate) fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().unwrap().session.as_ref()?.upgrade()
    }

    /// Re-targets the surface for a new picture decoded by `session`.
    pub(crate) fn begin_decode(&self, session: &Arc<Session>) {
        let mut state = self.state.lock().unwrap();
        state.session = Some(Arc::downgrade(session));
        state.decoded = false;
    }

    pub(crate) fn output_index(&self) -> Option<usize> {
        self.state.lock().unwrap().output_index
    }

    /// Drops the binding to a kernel output buffer, returning it so the
    /// caller can requeue the buffer.
    pub(crate) fn take_output_index(&self) -> Option<usize> {
        self.state.lock().unwrap().output_index.take()
    }

    /// Records a dequeued frame and wakes any sync waiter.
    pub(crate) fn complete(&self, output_index: usize) {
        let mut state = self.state.lock().unwrap();
        state.output_index = Some(output_index);
        state.decoded = true;
        self.decoded_cond.notify_all();
    }

    pub(crate) fn is_decoded(&self) -> bool {
        self.state.lock().unwrap().decoded
    }

    /// Marks the surface ready without a frame. Used when a sync wait
    /// exhausts its budget: the consumer gets stale pixels instead of a
    /// hang.
    pub(crate) fn force_ready(&self) {
        let mut state = self.state.lock().unwrap();
        state.decoded = true;
        self.decoded_cond.notify_all();
    }

    /// Blocks on the decoded flag for at most `timeout`.
    pub(crate) fn wait_decoded(&self, timeout: Duration) {
        let state = self.state.lock().unwrap();
        if !state.decoded {
            let _ = self.decoded_cond.wait_timeout(state, timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_binds_and_readies() {
        let surface = Surface::new(640, 480, crate::RT_FORMAT_YUV420);
        assert_eq!(surface.status(), SurfaceStatus::Rendering);
        assert_eq!(surface.output_index(), None);

        surface.complete(3);
        assert_eq!(surface.status(), SurfaceStatus::Ready);
        assert_eq!(surface.output_index(), Some(3));

        assert_eq!(surface.take_output_index(), Some(3));
        assert_eq!(surface.output_index(), None);
    }

    #[test]
    fn wait_decoded_returns_after_timeout() {
        let surface = Surface::new(640, 480, crate::RT_FORMAT_YUV420);
        let start = std::time::Instant::now();
        surface.wait_decoded(Duration::from_millis(10));
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
