// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One decode session over one stateful decoder handle.
//!
//! The input queue is configured at session creation; the output queue is
//! deliberately not. A stateful decoder announces its negotiated output
//! format through a source-change event once it has parsed enough input,
//! so output configuration waits for the first submitted picture.
//!
//! All waits are bounded and poll the session's cancellation flag, which
//! context destruction raises so in-flight consumer calls unblock
//! promptly. There is no worker thread: every dequeue happens inline on
//! the consumer's thread under the session mutex, except the sync wait,
//! which parks on the surface's own condition variable with the session
//! mutex released.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use drm_fourcc::DrmFourcc;
use drm_fourcc::DrmModifier;
use v4l2r::PixelFormat;

use crate::bitstream::Bitstream;
use crate::buffer::FOURCC_NV12;
use crate::codec::Codec;
use crate::codec::PictureParameters;
use crate::codec::SliceParameter;
use crate::device::DecoderDevice;
use crate::device::DequeueError;
use crate::device::DeviceEvent;
use crate::device::QueueDirection;
use crate::surface::PrimeLayer;
use crate::surface::PrimeObject;
use crate::surface::PrimeSurfaceDescriptor;
use crate::surface::Surface;
use crate::Resolution;
use crate::VaError;
use crate::VaResult;

const INPUT_BUFFER_COUNT: u32 = 8;
const OUTPUT_BUFFER_COUNT: u32 = 16;
const INPUT_BUFFER_SIZE: u32 = 4 << 20;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Polls while waiting for the source-change event (~1 s).
const EVENT_WAIT_POLLS: u32 = 100;
/// Polls while waiting for a free input buffer (~1 s).
const RECYCLE_WAIT_POLLS: u32 = 100;
/// Polls while waiting for a frame in a surface sync (~500 ms).
const SYNC_WAIT_POLLS: u32 = 50;

#[derive(Default)]
struct OutputSlot {
    /// The kernel owns the buffer. When false, exactly one surface does.
    queued: bool,
    /// Exported DMA-BUF handle, cached across export requests.
    dmabuf: Option<std::fs::File>,
}

struct SessionInner {
    codec: Codec,
    coded_size: Resolution,
    dev: Box<dyn DecoderDevice>,
    input_streaming: bool,
    output_streaming: bool,
    /// Whether each input buffer is currently queued to the kernel.
    input_queued: Vec<bool>,
    output_slots: Vec<OutputSlot>,
    /// Annex-B assembly buffer for the picture being rendered.
    bitstream: Bitstream,
    /// Slice parameters latched until the matching slice data arrives.
    slice_params: Option<Vec<SliceParameter>>,
    render_target: Option<Arc<Surface>>,
}

pub struct Session {
    cancelled: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        codec: Codec,
        coded_size: Resolution,
        mut dev: Box<dyn DecoderDevice>,
    ) -> VaResult<Session> {
        dev.subscribe_events()?;
        dev.set_input_format(codec.pixelformat(), coded_size, INPUT_BUFFER_SIZE)?;
        let granted = dev.request_input_buffers(INPUT_BUFFER_COUNT)?;
        log::info!(
            "session: {} {}x{}, {} input buffers",
            codec.name(),
            coded_size.width,
            coded_size.height,
            granted
        );

        Ok(Session {
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                codec,
                coded_size,
                dev,
                input_streaming: false,
                output_streaming: false,
                input_queued: vec![false; granted],
                output_slots: Vec::new(),
                bitstream: Bitstream::new(),
                slice_params: None,
                render_target: None,
            }),
        })
    }

    /// Aborts the bounded waits of in-flight calls. Raised before teardown.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Starts a new picture targeting `surface`, resetting the assembly
    /// state. A surface holding a frame from an earlier picture gives its
    /// kernel buffer back first so decoding can progress.
    pub(crate) fn begin_picture(self: &Arc<Self>, surface: &Arc<Surface>) -> VaResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = surface.take_output_index() {
            inner.recycle_output(index);
        }
        inner.bitstream.clear();
        inner.slice_params = None;
        inner.render_target = Some(Arc::clone(surface));
        surface.begin_decode(self);
        Ok(())
    }

    pub(crate) fn handle_picture_params(&self, params: &PictureParameters) {
        self.inner.lock().unwrap().codec.handle_picture_params(params);
    }

    pub(crate) fn latch_slice_params(&self, params: Vec<SliceParameter>) {
        self.inner.lock().unwrap().slice_params = Some(params);
    }

    pub(crate) fn handle_slice_data(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let SessionInner { codec, bitstream, slice_params, .. } = &mut *inner;
        let Some(params) = slice_params.as_deref() else {
            log::warn!("{}: slice data without slice parameters, dropped", codec.name());
            return;
        };
        codec.handle_slice_data(bitstream, params, data);
    }

    /// Submits the assembled picture to the decoder and opportunistically
    /// collects a finished frame for the render target.
    pub(crate) fn end_picture(&self) -> VaResult<()> {
        let mut inner = self.inner.lock().unwrap();
        {
            let SessionInner { codec, bitstream, .. } = &mut *inner;
            codec.prepare_bitstream(bitstream);
        }

        if !inner.bitstream.is_empty() {
            self.submit_bitstream(&mut inner)?;
        }

        if let Some(surface) = inner.render_target.clone() {
            inner.try_dequeue_frame(&surface);
        }
        Ok(())
    }

    /// Drives the output dequeue for `surface` under a bounded wait. On
    /// exhaustion the surface is marked ready regardless: returning stale
    /// pixels beats hanging the consumer.
    pub(crate) fn sync_surface(&self, surface: &Arc<Surface>) -> VaResult<()> {
        for _ in 0..SYNC_WAIT_POLLS {
            if surface.is_decoded() {
                return Ok(());
            }
            if self.cancelled() {
                break;
            }
            {
                let mut inner = self.inner.lock().unwrap();
                inner.try_dequeue_frame(surface);
            }
            if surface.is_decoded() {
                return Ok(());
            }
            // The session mutex is released here; only the surface's own
            // mutex is held across the wait.
            surface.wait_decoded(POLL_INTERVAL);
        }

        log::warn!("surface sync timed out, marking ready without a frame");
        surface.force_ready();
        Ok(())
    }

    /// Gives a kernel output buffer back to the decoder.
    pub(crate) fn recycle_output(&self, index: usize) {
        self.inner.lock().unwrap().recycle_output(index);
    }

    /// Exports the surface's decoded buffer as a DMA-BUF descriptor. The
    /// exported handle is cached on the buffer slot; the descriptor gets a
    /// duplicate, so both sides own their descriptor independently.
    pub(crate) fn export_descriptor(
        &self,
        surface: &Surface,
    ) -> VaResult<PrimeSurfaceDescriptor> {
        let Some(index) = surface.output_index() else {
            return Err(VaError::InvalidSurface);
        };
        let mut inner = self.inner.lock().unwrap();
        let SessionInner { dev, output_slots, .. } = &mut *inner;
        let slot = output_slots.get_mut(index).ok_or(VaError::InvalidSurface)?;

        if slot.dmabuf.is_none() {
            slot.dmabuf = Some(dev.export_output_buffer(index, 0)?);
        }
        let Some(file) = slot.dmabuf.as_ref() else {
            return Err(VaError::InvalidSurface);
        };
        let fd = file.try_clone().map_err(|e| VaError::OperationFailed(e.into()))?;

        let width = surface.width();
        let height = surface.height();
        Ok(PrimeSurfaceDescriptor {
            fourcc: FOURCC_NV12,
            width,
            height,
            objects: vec![PrimeObject {
                fd,
                size: width * height * 3 / 2,
                drm_format_modifier: DrmModifier::Linear.into(),
            }],
            layers: vec![
                PrimeLayer {
                    drm_format: DrmFourcc::R8 as u32,
                    object_index: 0,
                    offset: 0,
                    pitch: width,
                },
                PrimeLayer {
                    drm_format: DrmFourcc::Rg88 as u32,
                    object_index: 0,
                    offset: width * height,
                    pitch: width,
                },
            ],
        })
    }

    /// Copies the surface's decoded NV12 frame into `dst`: W*H bytes of Y
    /// followed by W*H/2 bytes of interleaved UV. The kernel buffer stays
    /// with the surface.
    pub(crate) fn read_frame(
        &self,
        surface: &Surface,
        size: Resolution,
        dst: &mut [u8],
    ) -> VaResult<()> {
        let Some(index) = surface.output_index() else {
            return Err(VaError::SurfaceBusy);
        };
        let y_size = (size.width * size.height) as usize;
        let uv_size = y_size / 2;
        if dst.len() < y_size + uv_size {
            return Err(anyhow!("image buffer too small for {}x{}", size.width, size.height).into());
        }

        let mut inner = self.inner.lock().unwrap();
        inner.dev.read_output_plane(index, 0, &mut dst[..y_size])?;
        inner.dev.read_output_plane(index, 1, &mut dst[y_size..y_size + uv_size])?;
        Ok(())
    }

    /// Stops both streams and releases kernel resources. Outstanding
    /// consumer calls finish with whatever state they observe once they
    /// re-acquire the mutex.
    pub(crate) fn shutdown(&self) {
        self.cancel();
        let mut inner = self.inner.lock().unwrap();
        if inner.input_streaming {
            if let Err(e) = inner.dev.stream_off(QueueDirection::Input) {
                log::warn!("input stream off: {:#}", e);
            }
            inner.input_streaming = false;
        }
        if inner.output_streaming {
            if let Err(e) = inner.dev.stream_off(QueueDirection::Output) {
                log::warn!("output stream off: {:#}", e);
            }
            inner.output_streaming = false;
        }
        // Cached DMA-BUF handles close with their slots; mapped planes
        // unmap when the device handle drops.
        inner.output_slots.clear();
        inner.render_target = None;
    }

    /// Copies the assembled bitstream into a free input buffer and queues
    /// it, starting the streams on first use.
    fn submit_bitstream(&self, inner: &mut SessionInner) -> VaResult<()> {
        inner.reclaim_completed_inputs();
        let mut index = inner.free_input_index();

        // Everything in flight: wait for the decoder to hand one back.
        if index.is_none() && inner.input_streaming {
            for _ in 0..RECYCLE_WAIT_POLLS {
                if self.cancelled() {
                    break;
                }
                match inner.dev.dequeue_input() {
                    Ok(reclaimed) => {
                        if let Some(queued) = inner.input_queued.get_mut(reclaimed) {
                            *queued = false;
                        }
                        index = Some(reclaimed);
                        break;
                    }
                    Err(DequeueError::NotReady) => thread::sleep(POLL_INTERVAL),
                    Err(DequeueError::Other(e)) => {
                        log::error!("input dequeue: {:#}", e);
                        break;
                    }
                }
            }
        }

        let Some(index) = index else {
            log::warn!("no input buffer available after bounded wait");
            return Err(anyhow!("input queue full").into());
        };

        let size = inner.bitstream.len();
        if size > inner.dev.input_buffer_len(index) {
            return Err(anyhow!("bitstream of {} bytes exceeds the input buffer", size).into());
        }

        {
            let SessionInner { dev, bitstream, .. } = &mut *inner;
            dev.write_input(index, bitstream.as_slice())?;
            dev.queue_input(index, size)?;
        }
        if let Some(queued) = inner.input_queued.get_mut(index) {
            *queued = true;
        }
        log::debug!("queued {} bytes on input buffer {}", size, index);

        if !inner.input_streaming {
            inner.dev.stream_on(QueueDirection::Input)?;
            inner.input_streaming = true;
            self.start_output_queue(inner)?;
        }
        Ok(())
    }

    /// First-input handshake: wait for the source-change event, then
    /// configure, fill and start the output queue.
    fn start_output_queue(&self, inner: &mut SessionInner) -> VaResult<()> {
        let mut got_event = false;
        for _ in 0..EVENT_WAIT_POLLS {
            if self.cancelled() {
                break;
            }
            match inner.dev.dequeue_event() {
                Ok(DeviceEvent::SourceChange) => {
                    got_event = true;
                    break;
                }
                Ok(DeviceEvent::EndOfStream) => (),
                Err(DequeueError::NotReady) => thread::sleep(POLL_INTERVAL),
                Err(DequeueError::Other(e)) => {
                    log::error!("event dequeue: {:#}", e);
                    break;
                }
            }
        }
        if !got_event {
            log::warn!("no source-change event, configuring the output queue anyway");
        }

        let format = match inner.dev.output_format() {
            Ok(format) => format,
            Err(e) => {
                log::warn!("output format query failed ({:#}), setting YUV420", e);
                inner.dev.set_output_format(PixelFormat::from_fourcc(b"YU12"), inner.coded_size)?
            }
        };
        log::info!(
            "output: {}x{} {}",
            format.resolution.width,
            format.resolution.height,
            format.pixelformat
        );

        let granted = inner.dev.request_output_buffers(OUTPUT_BUFFER_COUNT)?;
        inner.output_slots = std::iter::repeat_with(OutputSlot::default).take(granted).collect();
        for index in 0..granted {
            inner.dev.queue_output(index)?;
            inner.output_slots[index].queued = true;
        }
        inner.dev.stream_on(QueueDirection::Output)?;
        inner.output_streaming = true;
        Ok(())
    }
}

impl SessionInner {
    /// Non-blocking drain of completed input buffers.
    fn reclaim_completed_inputs(&mut self) {
        if !self.input_streaming {
            return;
        }
        loop {
            match self.dev.dequeue_input() {
                Ok(index) => {
                    if let Some(queued) = self.input_queued.get_mut(index) {
                        *queued = false;
                    }
                }
                Err(DequeueError::NotReady) => break,
                Err(DequeueError::Other(e)) => {
                    log::error!("input dequeue: {:#}", e);
                    break;
                }
            }
        }
    }

    fn free_input_index(&self) -> Option<usize> {
        self.input_queued.iter().position(|queued| !queued)
    }

    /// Non-blocking output dequeue. A dequeued frame transfers buffer
    /// ownership from the kernel to `surface`.
    fn try_dequeue_frame(&mut self, surface: &Surface) -> bool {
        if !self.output_streaming {
            return false;
        }
        match self.dev.dequeue_output() {
            Ok(index) => {
                if let Some(slot) = self.output_slots.get_mut(index) {
                    slot.queued = false;
                }
                surface.complete(index);
                true
            }
            Err(DequeueError::NotReady) => false,
            Err(DequeueError::Other(e)) => {
                log::error!("output dequeue: {:#}", e);
                false
            }
        }
    }

    fn recycle_output(&mut self, index: usize) {
        if !self.output_streaming {
            return;
        }
        match self.output_slots.get(index) {
            Some(slot) if !slot.queued => (),
            _ => return,
        }
        match self.dev.queue_output(index) {
            Ok(()) => self.output_slots[index].queued = true,
            Err(e) => log::error!("requeueing output buffer {}: {:#}", index, e),
        }
    }
}
