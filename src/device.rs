// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface the session manager requires from a stateful decoder device.
//!
//! The trait mirrors the kernel primitive surface one-to-one (formats,
//! buffer allocation, queue/dequeue, streaming, events, export) so the
//! session logic above it stays a faithful transcription of the M2M
//! protocol, while tests can substitute a scriptable fake for paths real
//! hardware cannot produce deterministically.

use std::fs::File;

use thiserror::Error;
use v4l2r::PixelFormat;

use crate::Resolution;

/// Direction of an M2M queue, named from the consumer's point of view: the
/// input queue carries compressed bitstream, the output queue decoded
/// frames. (V4L2 calls these OUTPUT and CAPTURE respectively.)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueDirection {
    Input,
    Output,
}

/// Asynchronous notifications from the decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The decoder has parsed enough input to pin down the output format;
    /// the output queue may now be configured.
    SourceChange,
    EndOfStream,
}

/// Format negotiated on a queue.
#[derive(Clone, Debug)]
pub struct StreamFormat {
    pub pixelformat: PixelFormat,
    pub resolution: Resolution,
    /// Per-plane image sizes, in bytes.
    pub plane_sizes: Vec<usize>,
}

/// Error of the non-blocking dequeue primitives.
#[derive(Debug, Error)]
pub enum DequeueError {
    #[error("nothing ready to dequeue")]
    NotReady,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One open handle to a stateful decoder.
pub trait DecoderDevice: Send {
    /// Subscribes to source-change and end-of-stream notifications.
    fn subscribe_events(&mut self) -> anyhow::Result<()>;

    fn set_input_format(
        &mut self,
        pixelformat: PixelFormat,
        resolution: Resolution,
        sizeimage: u32,
    ) -> anyhow::Result<()>;

    /// Allocates and maps `count` input buffers; returns how many the
    /// kernel actually granted.
    fn request_input_buffers(&mut self, count: u32) -> anyhow::Result<usize>;

    /// Capacity of one mapped input buffer, in bytes.
    fn input_buffer_len(&self, index: usize) -> usize;

    /// Copies a bitstream into the mapped input buffer `index`.
    fn write_input(&mut self, index: usize, data: &[u8]) -> anyhow::Result<()>;

    fn queue_input(&mut self, index: usize, bytes_used: usize) -> anyhow::Result<()>;

    /// Reclaims one completed input buffer, non-blocking.
    fn dequeue_input(&mut self) -> Result<usize, DequeueError>;

    /// Queries the format the decoder negotiated for its output queue.
    fn output_format(&mut self) -> anyhow::Result<StreamFormat>;

    /// Fallback when the decoder has not negotiated an output format.
    fn set_output_format(
        &mut self,
        pixelformat: PixelFormat,
        resolution: Resolution,
    ) -> anyhow::Result<StreamFormat>;

    fn request_output_buffers(&mut self, count: u32) -> anyhow::Result<usize>;

    fn queue_output(&mut self, index: usize) -> anyhow::Result<()>;

    /// Dequeues one decoded frame, non-blocking.
    fn dequeue_output(&mut self) -> Result<usize, DequeueError>;

    fn stream_on(&mut self, direction: QueueDirection) -> anyhow::Result<()>;

    fn stream_off(&mut self, direction: QueueDirection) -> anyhow::Result<()>;

    /// Dequeues one pending event, non-blocking.
    fn dequeue_event(&mut self) -> Result<DeviceEvent, DequeueError>;

    /// Exports plane `plane` of output buffer `index` as a DMA-BUF.
    fn export_output_buffer(&mut self, index: usize, plane: usize) -> anyhow::Result<File>;

    /// Copies decoded bytes of one plane into `dst`, mapping the plane
    /// lazily on first use; returns the number of bytes copied.
    fn read_output_plane(
        &mut self,
        index: usize,
        plane: usize,
        dst: &mut [u8],
    ) -> anyhow::Result<usize>;
}

/// Discovery and session-creation surface for decoder devices.
pub trait DeviceBackend: Send + Sync {
    /// Coded pixel formats the hardware accepts on its input queue.
    fn coded_formats(&self) -> anyhow::Result<Vec<PixelFormat>>;

    /// Opens a fresh decoder handle for one decode session.
    fn open_decoder(&self) -> anyhow::Result<Box<dyn DecoderDevice>>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scriptable in-memory decoder. Inputs complete after a configurable
    //! number of dequeue polls; each completed input pairs with one queued
    //! output buffer, in FIFO order.

    use std::collections::VecDeque;
    use std::fs::File;
    use std::sync::Arc;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use anyhow::Context;
    use v4l2r::PixelFormat;

    use super::*;

    #[derive(Clone)]
    pub(crate) struct FakeConfig {
        /// Dequeue polls before a queued input buffer completes.
        pub input_delay_polls: u32,
        /// Whether completed inputs produce decoded frames at all.
        pub produce_output: bool,
        pub input_buffer_count: usize,
        pub input_buffer_len: usize,
        pub output_buffer_count: usize,
        pub output_resolution: Resolution,
    }

    impl Default for FakeConfig {
        fn default() -> Self {
            Self {
                input_delay_polls: 0,
                produce_output: true,
                input_buffer_count: 8,
                input_buffer_len: 4 << 20,
                output_buffer_count: 16,
                output_resolution: Resolution { width: 640, height: 480 },
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub config: FakeConfig,
        pub input_streaming: bool,
        pub output_streaming: bool,
        pub subscribed: bool,
        pub input_format: Option<PixelFormat>,
        pub input_buffers: usize,
        pub output_buffers: usize,
        /// Bitstreams submitted so far, in order.
        pub submitted: Vec<Vec<u8>>,
        /// Every `queue_output` call, in order.
        pub output_queue_calls: Vec<usize>,
        pub event_pending: bool,
        pending_inputs: VecDeque<(usize, u32)>,
        completed_inputs: VecDeque<usize>,
        /// Decoded frames not yet delivered: back-pressure from inputs that
        /// completed before any output buffer was queued.
        frames_waiting_for_buffer: usize,
        queued_outputs: VecDeque<usize>,
        decoded_ready: VecDeque<usize>,
    }

    impl FakeState {
        /// Advances simulated decode progress by one poll.
        fn tick(&mut self) {
            let mut still_pending = VecDeque::new();
            while let Some((index, polls)) = self.pending_inputs.pop_front() {
                if polls == 0 {
                    self.completed_inputs.push_back(index);
                    if self.config.produce_output {
                        self.frames_waiting_for_buffer += 1;
                    }
                } else {
                    still_pending.push_back((index, polls - 1));
                }
            }
            self.pending_inputs = still_pending;
            self.settle_frames();
        }

        /// Pairs decoded frames with queued output buffers, FIFO.
        fn settle_frames(&mut self) {
            while self.frames_waiting_for_buffer > 0 {
                let Some(index) = self.queued_outputs.pop_front() else {
                    break;
                };
                self.decoded_ready.push_back(index);
                self.frames_waiting_for_buffer -= 1;
            }
        }
    }

    /// Handle implementing [`DecoderDevice`] over shared [`FakeState`], so
    /// tests keep a second handle for inspection.
    #[derive(Clone)]
    pub(crate) struct FakeDecoder {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeDecoder {
        pub(crate) fn new(config: FakeConfig) -> (Self, Arc<Mutex<FakeState>>) {
            let state =
                Arc::new(Mutex::new(FakeState { config, ..Default::default() }));
            (Self { state: Arc::clone(&state) }, state)
        }
    }

    impl DecoderDevice for FakeDecoder {
        fn subscribe_events(&mut self) -> anyhow::Result<()> {
            self.state.lock().unwrap().subscribed = true;
            Ok(())
        }

        fn set_input_format(
            &mut self,
            pixelformat: PixelFormat,
            _resolution: Resolution,
            _sizeimage: u32,
        ) -> anyhow::Result<()> {
            self.state.lock().unwrap().input_format = Some(pixelformat);
            Ok(())
        }

        fn request_input_buffers(&mut self, count: u32) -> anyhow::Result<usize> {
            let mut state = self.state.lock().unwrap();
            state.input_buffers = (count as usize).min(state.config.input_buffer_count);
            Ok(state.input_buffers)
        }

        fn input_buffer_len(&self, _index: usize) -> usize {
            self.state.lock().unwrap().config.input_buffer_len
        }

        fn write_input(&mut self, _index: usize, data: &[u8]) -> anyhow::Result<()> {
            self.state.lock().unwrap().submitted.push(data.to_vec());
            Ok(())
        }

        fn queue_input(&mut self, index: usize, _bytes_used: usize) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            let delay = state.config.input_delay_polls;
            state.pending_inputs.push_back((index, delay));
            state.event_pending = true;
            if delay == 0 {
                state.tick();
            }
            Ok(())
        }

        fn dequeue_input(&mut self) -> Result<usize, DequeueError> {
            let mut state = self.state.lock().unwrap();
            state.tick();
            state.completed_inputs.pop_front().ok_or(DequeueError::NotReady)
        }

        fn output_format(&mut self) -> anyhow::Result<StreamFormat> {
            let state = self.state.lock().unwrap();
            let res = state.config.output_resolution;
            let y = (res.width * res.height) as usize;
            Ok(StreamFormat {
                pixelformat: PixelFormat::from_fourcc(b"NV12"),
                resolution: res,
                plane_sizes: vec![y, y / 2],
            })
        }

        fn set_output_format(
            &mut self,
            pixelformat: PixelFormat,
            resolution: Resolution,
        ) -> anyhow::Result<StreamFormat> {
            let y = (resolution.width * resolution.height) as usize;
            Ok(StreamFormat { pixelformat, resolution, plane_sizes: vec![y, y / 2] })
        }

        fn request_output_buffers(&mut self, count: u32) -> anyhow::Result<usize> {
            let mut state = self.state.lock().unwrap();
            state.output_buffers = (count as usize).min(state.config.output_buffer_count);
            Ok(state.output_buffers)
        }

        fn queue_output(&mut self, index: usize) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.output_queue_calls.push(index);
            state.queued_outputs.push_back(index);
            state.settle_frames();
            Ok(())
        }

        fn dequeue_output(&mut self) -> Result<usize, DequeueError> {
            let mut state = self.state.lock().unwrap();
            state.tick();
            state.decoded_ready.pop_front().ok_or(DequeueError::NotReady)
        }

        fn stream_on(&mut self, direction: QueueDirection) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            match direction {
                QueueDirection::Input => state.input_streaming = true,
                QueueDirection::Output => state.output_streaming = true,
            }
            Ok(())
        }

        fn stream_off(&mut self, direction: QueueDirection) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            match direction {
                QueueDirection::Input => state.input_streaming = false,
                QueueDirection::Output => state.output_streaming = false,
            }
            Ok(())
        }

        fn dequeue_event(&mut self) -> Result<DeviceEvent, DequeueError> {
            let mut state = self.state.lock().unwrap();
            if state.event_pending {
                state.event_pending = false;
                Ok(DeviceEvent::SourceChange)
            } else {
                Err(DequeueError::NotReady)
            }
        }

        fn export_output_buffer(&mut self, index: usize, _plane: usize) -> anyhow::Result<File> {
            let state = self.state.lock().unwrap();
            if index >= state.output_buffers {
                return Err(anyhow!("no such output buffer {}", index));
            }
            File::open("/dev/null").context("export placeholder")
        }

        fn read_output_plane(
            &mut self,
            index: usize,
            plane: usize,
            dst: &mut [u8],
        ) -> anyhow::Result<usize> {
            let state = self.state.lock().unwrap();
            let res = state.config.output_resolution;
            let y = (res.width * res.height) as usize;
            let plane_size = if plane == 0 { y } else { y / 2 };
            let n = dst.len().min(plane_size);
            // Fill with a recognisable per-buffer pattern.
            let value = (index as u8).wrapping_add(if plane == 0 { 0x10 } else { 0x80 });
            dst[..n].fill(value);
            Ok(n)
        }
    }

    /// Backend producing [`FakeDecoder`] sessions. Clones share the list
    /// of created decoder states, so tests can keep one handle for
    /// inspection after boxing another.
    #[derive(Clone)]
    pub(crate) struct FakeBackend {
        pub config: FakeConfig,
        pub formats: Vec<PixelFormat>,
        pub created: Arc<Mutex<Vec<Arc<Mutex<FakeState>>>>>,
    }

    impl FakeBackend {
        pub(crate) fn new(config: FakeConfig) -> Self {
            Self {
                config,
                formats: vec![
                    PixelFormat::from_fourcc(b"H264"),
                    PixelFormat::from_fourcc(b"HEVC"),
                    PixelFormat::from_fourcc(b"VP80"),
                    PixelFormat::from_fourcc(b"VP90"),
                ],
                created: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl DeviceBackend for FakeBackend {
        fn coded_formats(&self) -> anyhow::Result<Vec<PixelFormat>> {
            Ok(self.formats.clone())
        }

        fn open_decoder(&self) -> anyhow::Result<Box<dyn DecoderDevice>> {
            let (decoder, state) = FakeDecoder::new(self.config.clone());
            self.created.lock().unwrap().push(state);
            Ok(Box::new(decoder))
        }
    }
}
