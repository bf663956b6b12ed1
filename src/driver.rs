// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Driver state and the consumer-facing entry-point surface.
//!
//! Objects are ID-addressed: configs, contexts (decode sessions), surfaces
//! and buffers live in per-class tables behind one driver mutex. That
//! mutex is only held for table manipulation; anything that can wait (the
//! picture submission path, surface syncs) runs on the session's own lock
//! after the table lookup, so one stalled session does not freeze the
//! driver.
//!
//! Entry points with no backing implementation still exist and return
//! [`VaError::Unimplemented`]; dispatchers reject drivers with missing
//! slots, so the full surface is represented.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;

use crate::backend::v4l2::V4l2Backend;
use crate::buffer::BufferData;
use crate::buffer::BufferType;
use crate::buffer::ByteOrder;
use crate::buffer::Image;
use crate::buffer::ImageFormat;
use crate::buffer::VaBuffer;
use crate::buffer::FOURCC_NV12;
use crate::codec::Codec;
use crate::device::DeviceBackend;
use crate::logging;
use crate::session::Session;
use crate::surface::ExportMemoryType;
use crate::surface::PrimeSurfaceDescriptor;
use crate::surface::Surface;
use crate::surface::SurfaceAttributes;
use crate::surface::SurfaceStatus;
use crate::BufferId;
use crate::ConfigAttrib;
use crate::ConfigAttribType;
use crate::ConfigId;
use crate::ContextId;
use crate::Entrypoint;
use crate::ImageId;
use crate::Profile;
use crate::Resolution;
use crate::SurfaceId;
use crate::VaError;
use crate::VaResult;
use crate::ATTRIB_NOT_SUPPORTED;
use crate::BUFFER_ID_BASE;
use crate::CONFIG_ID_BASE;
use crate::CONTEXT_ID_BASE;
use crate::RT_FORMAT_YUV420;
use crate::RT_FORMAT_YUV420_10;
use crate::SURFACE_ID_BASE;

const MAX_PICTURE_DIM: u32 = 4096;
const MIN_SURFACE_DIM: u32 = 16;

/// A profile/entrypoint pair validated at creation time.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub profile: Profile,
    pub entrypoint: Entrypoint,
}

/// Surface attributes a consumer can pass to the extended surface-creation
/// call. They are accepted and ignored: decoded buffers always come from
/// the kernel queue in its negotiated layout.
#[derive(Copy, Clone, Debug)]
pub enum SurfaceAttrib {
    PixelFormat(u32),
    MemoryType(u32),
}

#[derive(Default)]
struct Objects {
    configs: BTreeMap<ConfigId, Config>,
    contexts: BTreeMap<ContextId, Arc<Session>>,
    surfaces: BTreeMap<SurfaceId, Arc<Surface>>,
    buffers: BTreeMap<BufferId, VaBuffer>,
    next_config: u32,
    next_context: u32,
    next_surface: u32,
    next_buffer: u32,
}

pub struct Driver {
    backend: Box<dyn DeviceBackend>,
    profiles: Vec<Profile>,
    objects: Mutex<Objects>,
}

impl Driver {
    /// Opens the driver against the first V4L2 stateful decoder node.
    pub fn new() -> VaResult<Driver> {
        logging::init_from_env();
        let backend = V4l2Backend::discover()?;
        Self::with_backend(Box::new(backend))
    }

    /// Opens the driver against an explicit device backend.
    pub fn with_backend(backend: Box<dyn DeviceBackend>) -> VaResult<Driver> {
        logging::init_from_env();

        let mut profiles = Vec::new();
        for format in backend.coded_formats()? {
            for profile in crate::profiles_for_coded_format(format) {
                if !profiles.contains(profile) {
                    profiles.push(*profile);
                }
            }
        }
        if profiles.is_empty() {
            return Err(anyhow!("device decodes no supported format").into());
        }
        log::info!("driver initialised with {} profiles", profiles.len());

        Ok(Driver { backend, profiles, objects: Mutex::new(Objects::default()) })
    }

    pub fn query_config_profiles(&self) -> Vec<Profile> {
        self.profiles.clone()
    }

    pub fn query_config_entrypoints(&self, profile: Profile) -> VaResult<Vec<Entrypoint>> {
        if !self.profiles.contains(&profile) {
            return Err(VaError::UnsupportedProfile);
        }
        Ok(vec![Entrypoint::Vld])
    }

    /// Fills the requested attribute slots for a profile/entrypoint pair.
    pub fn get_config_attributes(
        &self,
        profile: Profile,
        _entrypoint: Entrypoint,
        attribs: &mut [ConfigAttrib],
    ) -> VaResult<()> {
        if !self.profiles.contains(&profile) {
            return Err(VaError::UnsupportedProfile);
        }
        for attrib in attribs {
            attrib.value = match attrib.attrib_type {
                ConfigAttribType::RtFormat => {
                    let mut formats = RT_FORMAT_YUV420;
                    if matches!(
                        profile,
                        Profile::HevcMain10 | Profile::Vp9Profile2 | Profile::Av1Profile0
                    ) {
                        formats |= RT_FORMAT_YUV420_10;
                    }
                    formats
                }
                ConfigAttribType::MaxPictureWidth => MAX_PICTURE_DIM,
                ConfigAttribType::MaxPictureHeight => MAX_PICTURE_DIM,
                ConfigAttribType::DecProcessing => ATTRIB_NOT_SUPPORTED,
            };
        }
        Ok(())
    }

    pub fn create_config(
        &self,
        profile: Profile,
        entrypoint: Entrypoint,
        _attribs: &[ConfigAttrib],
    ) -> VaResult<ConfigId> {
        if !self.profiles.contains(&profile) {
            log::info!("unsupported profile {:?}", profile);
            return Err(VaError::UnsupportedProfile);
        }
        if entrypoint != Entrypoint::Vld {
            log::info!("unsupported entrypoint {:?}", entrypoint);
            return Err(VaError::UnsupportedEntrypoint);
        }

        let mut objects = self.objects.lock().unwrap();
        let id = ConfigId(CONFIG_ID_BASE + objects.next_config);
        objects.next_config += 1;
        objects.configs.insert(id, Config { profile, entrypoint });
        log::debug!("created config {:?} for {:?}", id, profile);
        Ok(id)
    }

    pub fn destroy_config(&self, id: ConfigId) -> VaResult<()> {
        self.objects.lock().unwrap().configs.remove(&id).ok_or(VaError::InvalidConfig)?;
        Ok(())
    }

    pub fn query_config_attributes(&self, id: ConfigId) -> VaResult<(Profile, Entrypoint)> {
        let objects = self.objects.lock().unwrap();
        let config = objects.configs.get(&id).ok_or(VaError::InvalidConfig)?;
        Ok((config.profile, config.entrypoint))
    }

    pub fn create_surfaces(
        &self,
        width: u32,
        height: u32,
        rt_format: u32,
        count: usize,
    ) -> VaResult<Vec<SurfaceId>> {
        let mut objects = self.objects.lock().unwrap();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = SurfaceId(SURFACE_ID_BASE + objects.next_surface);
            objects.next_surface += 1;
            objects.surfaces.insert(id, Arc::new(Surface::new(width, height, rt_format)));
            ids.push(id);
        }
        log::debug!("created {} surfaces ({}x{})", count, width, height);
        Ok(ids)
    }

    /// Extended creation variant; attributes are accepted but not acted
    /// on.
    pub fn create_surfaces_with_attribs(
        &self,
        width: u32,
        height: u32,
        rt_format: u32,
        count: usize,
        _attribs: &[SurfaceAttrib],
    ) -> VaResult<Vec<SurfaceId>> {
        self.create_surfaces(width, height, rt_format, count)
    }

    pub fn destroy_surfaces(&self, ids: &[SurfaceId]) -> VaResult<()> {
        let mut objects = self.objects.lock().unwrap();
        if ids.iter().any(|id| !objects.surfaces.contains_key(id)) {
            return Err(VaError::InvalidSurface);
        }
        for id in ids {
            if let Some(surface) = objects.surfaces.remove(id) {
                // A held kernel buffer goes back to its session so
                // decoding can progress.
                if let Some(session) = surface.session() {
                    if let Some(index) = surface.take_output_index() {
                        session.recycle_output(index);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn create_context(
        &self,
        config_id: ConfigId,
        picture_width: u32,
        picture_height: u32,
        _render_targets: &[SurfaceId],
    ) -> VaResult<ContextId> {
        let profile = {
            let objects = self.objects.lock().unwrap();
            objects.configs.get(&config_id).ok_or(VaError::InvalidConfig)?.profile
        };

        let codec = Codec::from_profile(profile);
        let name = codec.name();
        let dev = self.backend.open_decoder()?;
        let session = Session::new(
            codec,
            Resolution { width: picture_width, height: picture_height },
            dev,
        )?;

        let mut objects = self.objects.lock().unwrap();
        let id = ContextId(CONTEXT_ID_BASE + objects.next_context);
        objects.next_context += 1;
        objects.contexts.insert(id, Arc::new(session));
        log::info!("created context {:?}: {} {}x{}", id, name, picture_width, picture_height);
        Ok(id)
    }

    pub fn destroy_context(&self, id: ContextId) -> VaResult<()> {
        let session = {
            let mut objects = self.objects.lock().unwrap();
            objects.contexts.remove(&id).ok_or(VaError::InvalidContext)?
        };
        // Unblock any consumer call stuck in a bounded wait before tearing
        // the streams down.
        session.cancel();
        session.shutdown();
        Ok(())
    }

    pub fn create_buffer(&self, context: ContextId, data: BufferData) -> VaResult<BufferId> {
        let mut objects = self.objects.lock().unwrap();
        if !objects.contexts.contains_key(&context) {
            return Err(VaError::InvalidContext);
        }
        let num_elements = match &data {
            BufferData::SliceParameters(params) => params.len() as u32,
            _ => 1,
        };
        Ok(Self::insert_buffer(&mut objects, VaBuffer::new(data, num_elements)))
    }

    pub fn buffer_set_num_elements(&self, id: BufferId, num_elements: u32) -> VaResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let buffer = objects.buffers.get_mut(&id).ok_or(VaError::InvalidBuffer)?;
        buffer.num_elements = num_elements;
        Ok(())
    }

    pub fn buffer_info(&self, id: BufferId) -> VaResult<(BufferType, usize, u32)> {
        let objects = self.objects.lock().unwrap();
        let buffer = objects.buffers.get(&id).ok_or(VaError::InvalidBuffer)?;
        Ok((buffer.buffer_type(), buffer.size(), buffer.num_elements))
    }

    /// Maps an image buffer and hands its bytes to `f`.
    ///
    /// For an image derived from a surface this pulls the decoded planes
    /// out of the kernel buffer on first map and pins the buffer until
    /// [`Driver::unmap_buffer`]. Parameter and slice buffers are typed at
    /// creation and have no byte mapping.
    pub fn map_buffer<R>(&self, id: BufferId, f: impl FnOnce(&[u8]) -> R) -> VaResult<R> {
        let mut objects = self.objects.lock().unwrap();
        let Objects { surfaces, buffers, .. } = &mut *objects;
        let buffer = buffers.get_mut(&id).ok_or(VaError::InvalidBuffer)?;

        match buffer.derived_from {
            Some(surface_id) => {
                let surface =
                    surfaces.get(&surface_id).cloned().ok_or(VaError::InvalidSurface)?;
                let session = surface.session().ok_or(VaError::InvalidSurface)?;
                let size =
                    Resolution { width: surface.width(), height: surface.height() };

                {
                    let BufferData::Image(storage) = &mut buffer.data else {
                        return Err(VaError::InvalidBuffer);
                    };
                    if storage.len() < size.nv12_frame_size() {
                        storage.resize(size.nv12_frame_size(), 0);
                    }
                    session.read_frame(&surface, size, storage)?;
                }
                buffer.mapped = true;
                match &buffer.data {
                    BufferData::Image(storage) => Ok(f(storage)),
                    _ => Err(VaError::InvalidBuffer),
                }
            }
            None => match &buffer.data {
                BufferData::Image(storage) => Ok(f(storage)),
                _ => Err(VaError::InvalidBuffer),
            },
        }
    }

    /// Releases a mapping made by [`Driver::map_buffer`]. For a derived
    /// image this also returns the surface's kernel buffer to the decoder
    /// and completes a deferred destroy.
    pub fn unmap_buffer(&self, id: BufferId) -> VaResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let Objects { surfaces, buffers, .. } = &mut *objects;
        let buffer = buffers.get_mut(&id).ok_or(VaError::InvalidBuffer)?;

        if !buffer.mapped {
            return Ok(());
        }
        buffer.mapped = false;

        if let Some(surface_id) = buffer.derived_from {
            if let Some(surface) = surfaces.get(&surface_id) {
                if let Some(session) = surface.session() {
                    if let Some(index) = surface.take_output_index() {
                        session.recycle_output(index);
                    }
                }
            }
        }

        if buffer.destroy_deferred {
            buffers.remove(&id);
        }
        Ok(())
    }

    pub fn destroy_buffer(&self, id: BufferId) -> VaResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let buffer = objects.buffers.get_mut(&id).ok_or(VaError::InvalidBuffer)?;
        // A mapped image stays alive until its unmap.
        if buffer.mapped {
            log::debug!("buffer {:?} still mapped, deferring free", id);
            buffer.destroy_deferred = true;
            return Ok(());
        }
        objects.buffers.remove(&id);
        Ok(())
    }

    pub fn begin_picture(&self, context: ContextId, target: SurfaceId) -> VaResult<()> {
        let (session, surface) = {
            let objects = self.objects.lock().unwrap();
            let session =
                objects.contexts.get(&context).cloned().ok_or(VaError::InvalidContext)?;
            let surface =
                objects.surfaces.get(&target).cloned().ok_or(VaError::InvalidSurface)?;
            (session, surface)
        };

        // If the surface still holds a frame decoded by another session,
        // hand the buffer back through that session.
        if let Some(previous) = surface.session() {
            if !Arc::ptr_eq(&previous, &session) {
                if let Some(index) = surface.take_output_index() {
                    previous.recycle_output(index);
                }
            }
        }

        session.begin_picture(&surface)
    }

    pub fn render_picture(&self, context: ContextId, buffers: &[BufferId]) -> VaResult<()> {
        let objects = self.objects.lock().unwrap();
        let session = objects.contexts.get(&context).cloned().ok_or(VaError::InvalidContext)?;

        for id in buffers {
            let Some(buffer) = objects.buffers.get(id) else {
                log::warn!("render: unknown buffer {:?}, skipped", id);
                continue;
            };
            match &buffer.data {
                BufferData::PictureParameters(params) => session.handle_picture_params(params),
                BufferData::SliceParameters(params) => {
                    session.latch_slice_params(params.clone())
                }
                BufferData::SliceData(data) => session.handle_slice_data(data),
                // Stateful hardware reads quantisation matrices from the
                // bitstream on its own.
                BufferData::IqMatrix => (),
                BufferData::Image(_) => {
                    log::warn!("render: image buffer {:?} is not renderable, skipped", id)
                }
            }
        }
        Ok(())
    }

    pub fn end_picture(&self, context: ContextId) -> VaResult<()> {
        let session = {
            let objects = self.objects.lock().unwrap();
            objects.contexts.get(&context).cloned().ok_or(VaError::InvalidContext)?
        };
        session.end_picture()
    }

    pub fn sync_surface(&self, id: SurfaceId) -> VaResult<()> {
        let surface = {
            let objects = self.objects.lock().unwrap();
            objects.surfaces.get(&id).cloned().ok_or(VaError::InvalidSurface)?
        };
        match surface.session() {
            Some(session) => session.sync_surface(&surface),
            None => {
                // Nothing ever rendered into it; it is as ready as it will
                // get.
                surface.force_ready();
                Ok(())
            }
        }
    }

    pub fn query_surface_status(&self, id: SurfaceId) -> VaResult<SurfaceStatus> {
        let objects = self.objects.lock().unwrap();
        let surface = objects.surfaces.get(&id).ok_or(VaError::InvalidSurface)?;
        Ok(surface.status())
    }

    pub fn query_surface_error(&self, id: SurfaceId) -> VaResult<()> {
        let objects = self.objects.lock().unwrap();
        objects.surfaces.get(&id).ok_or(VaError::InvalidSurface)?;
        Ok(())
    }

    pub fn query_image_formats(&self) -> Vec<ImageFormat> {
        vec![ImageFormat { fourcc: FOURCC_NV12, byte_order: ByteOrder::LsbFirst, bits_per_pixel: 12 }]
    }

    pub fn create_image(&self, format: ImageFormat, width: u32, height: u32) -> VaResult<Image> {
        if format.fourcc != FOURCC_NV12 {
            return Err(anyhow!("unsupported image fourcc").into());
        }
        let mut objects = self.objects.lock().unwrap();
        let image_size = Resolution { width, height };
        let mut buffer =
            VaBuffer::new(BufferData::Image(vec![0; image_size.nv12_frame_size()]), 1);
        buffer.image_size = Some(image_size);
        let id = Self::insert_buffer(&mut objects, buffer);
        log::debug!("created image {:?}, {}x{} NV12", id, width, height);
        Ok(Image::nv12(id, width, height))
    }

    /// Describes the surface's decoded frame as an image whose pixels are
    /// fetched from the kernel buffer when the image buffer is mapped.
    pub fn derive_image(&self, surface_id: SurfaceId) -> VaResult<Image> {
        let mut objects = self.objects.lock().unwrap();
        let surface = objects.surfaces.get(&surface_id).cloned().ok_or(VaError::InvalidSurface)?;
        if surface.session().is_none() {
            return Err(VaError::InvalidSurface);
        }
        if surface.output_index().is_none() {
            return Err(VaError::SurfaceBusy);
        }

        let mut buffer = VaBuffer::new(BufferData::Image(Vec::new()), 1);
        buffer.derived_from = Some(surface_id);
        buffer.image_size =
            Some(Resolution { width: surface.width(), height: surface.height() });
        let id = Self::insert_buffer(&mut objects, buffer);
        log::debug!("derived image {:?} from surface {:?}", id, surface_id);
        Ok(Image::nv12(id, surface.width(), surface.height()))
    }

    pub fn destroy_image(&self, id: ImageId) -> VaResult<()> {
        self.destroy_buffer(id)
    }

    /// Copies the decoded frame bound to `surface_id` into the image's
    /// buffer: Y plane first, then the interleaved UV plane.
    pub fn get_image(&self, surface_id: SurfaceId, image: ImageId) -> VaResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let Objects { surfaces, buffers, .. } = &mut *objects;

        let surface = surfaces.get(&surface_id).cloned().ok_or(VaError::InvalidSurface)?;
        let buffer = buffers.get_mut(&image).ok_or(VaError::InvalidImage)?;
        let size = buffer
            .image_size
            .unwrap_or(Resolution { width: surface.width(), height: surface.height() });

        if !surface.is_decoded() {
            return Err(VaError::SurfaceBusy);
        }
        let session = surface.session().ok_or(VaError::SurfaceBusy)?;

        let BufferData::Image(storage) = &mut buffer.data else {
            return Err(VaError::InvalidImage);
        };
        if storage.len() < size.nv12_frame_size() {
            storage.resize(size.nv12_frame_size(), 0);
        }
        session.read_frame(&surface, size, storage)
    }

    pub fn export_surface_handle(
        &self,
        id: SurfaceId,
        _mem_type: ExportMemoryType,
    ) -> VaResult<PrimeSurfaceDescriptor> {
        let surface = {
            let objects = self.objects.lock().unwrap();
            objects.surfaces.get(&id).cloned().ok_or(VaError::InvalidSurface)?
        };
        let session = surface.session().ok_or(VaError::InvalidSurface)?;
        session.export_descriptor(&surface)
    }

    pub fn query_surface_attributes(&self, config: ConfigId) -> VaResult<SurfaceAttributes> {
        let objects = self.objects.lock().unwrap();
        if !objects.configs.contains_key(&config) {
            return Err(VaError::InvalidConfig);
        }
        Ok(SurfaceAttributes {
            memory_types: vec![ExportMemoryType::DrmPrime, ExportMemoryType::DrmPrime2],
            pixel_format: FOURCC_NV12,
            min_size: Resolution { width: MIN_SURFACE_DIM, height: MIN_SURFACE_DIM },
            max_size: Resolution { width: MAX_PICTURE_DIM, height: MAX_PICTURE_DIM },
        })
    }

    /// Display-attribute queries succeed with nothing to report.
    pub fn query_display_attributes(&self) -> Vec<()> {
        Vec::new()
    }

    pub fn query_subpicture_formats(&self) -> Vec<ImageFormat> {
        Vec::new()
    }

    // Entry points present for dispatch completeness only.

    pub fn put_surface(&self, _surface: SurfaceId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn put_image(&self, _surface: SurfaceId, _image: ImageId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn set_image_palette(&self, _image: ImageId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn create_subpicture(&self, _image: ImageId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn destroy_subpicture(&self) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn set_subpicture_image(&self) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn set_subpicture_chromakey(&self) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn set_subpicture_global_alpha(&self) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn associate_subpicture(&self) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn deassociate_subpicture(&self) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn lock_surface(&self, _surface: SurfaceId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn unlock_surface(&self, _surface: SurfaceId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn acquire_buffer_handle(&self, _buffer: BufferId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn release_buffer_handle(&self, _buffer: BufferId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn create_mf_context(&self) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn mf_add_context(&self, _context: ContextId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn mf_release_context(&self, _context: ContextId) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn mf_submit(&self, _contexts: &[ContextId]) -> VaResult<()> {
        Err(VaError::Unimplemented)
    }

    pub fn create_buffer2(&self, _context: ContextId) -> VaResult<BufferId> {
        Err(VaError::Unimplemented)
    }

    pub fn query_processing_rate(&self, _config: ConfigId) -> VaResult<u32> {
        Err(VaError::Unimplemented)
    }

    fn insert_buffer(objects: &mut Objects, buffer: VaBuffer) -> BufferId {
        let id = BufferId(BUFFER_ID_BASE + objects.next_buffer);
        objects.next_buffer += 1;
        objects.buffers.insert(id, buffer);
        id
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        let contexts: Vec<Arc<Session>> = {
            let mut objects = self.objects.lock().unwrap();
            objects.surfaces.clear();
            objects.buffers.clear();
            std::mem::take(&mut objects.contexts).into_values().collect()
        };
        for session in contexts {
            session.cancel();
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::Instant;

    use super::*;
    use crate::codec::SliceParameter;
    use crate::device::fake::FakeBackend;
    use crate::device::fake::FakeConfig;

    fn driver_with(config: FakeConfig) -> (Driver, FakeBackend) {
        let backend = FakeBackend::new(config);
        let driver = Driver::with_backend(Box::new(backend.clone())).expect("driver");
        (driver, backend)
    }

    fn decode_one_frame(driver: &Driver) -> (ContextId, SurfaceId) {
        let config = driver
            .create_config(Profile::Vp8Version0_3, Entrypoint::Vld, &[])
            .expect("config");
        let surfaces = driver.create_surfaces(640, 480, RT_FORMAT_YUV420, 1).expect("surfaces");
        let context = driver.create_context(config, 640, 480, &surfaces).expect("context");

        let frame = vec![0x9d; 32];
        let slice_params = driver
            .create_buffer(
                context,
                BufferData::SliceParameters(vec![SliceParameter {
                    slice_data_offset: 0,
                    slice_data_size: frame.len() as u32,
                }]),
            )
            .expect("slice params");
        let slice_data =
            driver.create_buffer(context, BufferData::SliceData(frame)).expect("slice data");

        driver.begin_picture(context, surfaces[0]).expect("begin");
        driver.render_picture(context, &[slice_params, slice_data]).expect("render");
        driver.end_picture(context).expect("end");
        driver.sync_surface(surfaces[0]).expect("sync");

        (context, surfaces[0])
    }

    #[test]
    fn profiles_follow_device_formats() {
        let (driver, _backend) = driver_with(FakeConfig::default());
        let profiles = driver.query_config_profiles();
        assert!(profiles.contains(&Profile::H264High));
        assert!(profiles.contains(&Profile::HevcMain10));
        assert!(profiles.contains(&Profile::Vp9Profile2));
        // The fake device does not decode AV1.
        assert!(!profiles.contains(&Profile::Av1Profile0));
    }

    #[test]
    fn config_validation() {
        let (driver, _backend) = driver_with(FakeConfig::default());
        assert!(matches!(
            driver.create_config(Profile::Av1Profile0, Entrypoint::Vld, &[]),
            Err(VaError::UnsupportedProfile)
        ));
        assert!(matches!(
            driver.create_config(Profile::H264Main, Entrypoint::EncSlice, &[]),
            Err(VaError::UnsupportedEntrypoint)
        ));

        let id = driver.create_config(Profile::H264Main, Entrypoint::Vld, &[]).expect("config");
        assert_eq!(
            driver.query_config_attributes(id).expect("query"),
            (Profile::H264Main, Entrypoint::Vld)
        );
        driver.destroy_config(id).expect("destroy");
        assert!(matches!(driver.destroy_config(id), Err(VaError::InvalidConfig)));
    }

    #[test]
    fn rt_format_attributes() {
        let (driver, _backend) = driver_with(FakeConfig::default());
        let mut attribs = [ConfigAttrib { attrib_type: ConfigAttribType::RtFormat, value: 0 }];

        driver
            .get_config_attributes(Profile::H264Main, Entrypoint::Vld, &mut attribs)
            .expect("attribs");
        assert_eq!(attribs[0].value, RT_FORMAT_YUV420);

        driver
            .get_config_attributes(Profile::HevcMain10, Entrypoint::Vld, &mut attribs)
            .expect("attribs");
        assert_eq!(attribs[0].value, RT_FORMAT_YUV420 | RT_FORMAT_YUV420_10);
    }

    #[test]
    fn invalid_handles_are_rejected() {
        let (driver, _backend) = driver_with(FakeConfig::default());
        let bogus_context = ContextId(0x1999);
        let bogus_surface = SurfaceId(0x2999);
        let bogus_buffer = BufferId(0x3999);

        assert!(matches!(
            driver.begin_picture(bogus_context, bogus_surface),
            Err(VaError::InvalidContext)
        ));
        assert!(matches!(driver.end_picture(bogus_context), Err(VaError::InvalidContext)));
        assert!(matches!(driver.sync_surface(bogus_surface), Err(VaError::InvalidSurface)));
        assert!(matches!(
            driver.query_surface_status(bogus_surface),
            Err(VaError::InvalidSurface)
        ));
        assert!(matches!(driver.buffer_info(bogus_buffer), Err(VaError::InvalidBuffer)));
        assert!(matches!(driver.destroy_buffer(bogus_buffer), Err(VaError::InvalidBuffer)));
        assert!(matches!(
            driver.create_context(ConfigId(0x999), 640, 480, &[]),
            Err(VaError::InvalidConfig)
        ));
    }

    #[test]
    fn decode_round_trip_readback() {
        let (driver, backend) = driver_with(FakeConfig::default());
        let (context, surface) = decode_one_frame(&driver);

        assert_eq!(driver.query_surface_status(surface).expect("status"), SurfaceStatus::Ready);

        let image = driver.create_image(
            ImageFormat { fourcc: FOURCC_NV12, byte_order: ByteOrder::LsbFirst, bits_per_pixel: 12 },
            640,
            480,
        )
        .expect("image");
        driver.get_image(surface, image.buf).expect("get image");

        driver
            .map_buffer(image.buf, |bytes| {
                assert_eq!(bytes.len(), 640 * 480 * 3 / 2);
                // The fake fills Y with 0x10 + buffer index (frame 0 lands
                // in buffer 0) and UV with 0x80 + index.
                assert!(bytes[..640 * 480].iter().all(|&b| b == 0x10));
                assert!(bytes[640 * 480..].iter().all(|&b| b == 0x80));
            })
            .expect("map");

        let states = backend.created.lock().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].lock().unwrap().submitted.len(), 1);

        driver.destroy_context(context).expect("destroy context");
    }

    #[test]
    fn derived_image_defers_destroy_until_unmap() {
        let (driver, backend) = driver_with(FakeConfig::default());
        let (_context, surface) = decode_one_frame(&driver);

        let image = driver.derive_image(surface).expect("derive");
        driver.map_buffer(image.buf, |bytes| assert!(!bytes.is_empty())).expect("map");

        // Destroy while mapped defers the free.
        driver.destroy_image(image.id).expect("destroy");
        assert!(driver.buffer_info(image.buf).is_ok());

        // Unmap hands the kernel buffer back and completes the destroy.
        driver.unmap_buffer(image.buf).expect("unmap");
        assert!(matches!(driver.buffer_info(image.buf), Err(VaError::InvalidBuffer)));

        let states = backend.created.lock().unwrap();
        let state = states[0].lock().unwrap();
        // 16 initial queuings plus the recycle from the unmap.
        assert_eq!(state.output_queue_calls.len(), 17);
    }

    #[test]
    fn derive_image_before_decode_is_busy() {
        let (driver, _backend) = driver_with(FakeConfig::default());
        let config =
            driver.create_config(Profile::Vp8Version0_3, Entrypoint::Vld, &[]).expect("config");
        let surfaces = driver.create_surfaces(640, 480, RT_FORMAT_YUV420, 1).expect("surfaces");
        let context = driver.create_context(config, 640, 480, &surfaces).expect("context");

        // Never rendered: no session at all.
        assert!(matches!(driver.derive_image(surfaces[0]), Err(VaError::InvalidSurface)));

        // Rendered but no frame dequeued yet.
        driver.begin_picture(context, surfaces[0]).expect("begin");
        assert!(matches!(driver.derive_image(surfaces[0]), Err(VaError::SurfaceBusy)));
    }

    #[test]
    fn export_surface_descriptor() {
        let (driver, _backend) = driver_with(FakeConfig::default());
        let (_context, surface) = decode_one_frame(&driver);

        let descriptor =
            driver.export_surface_handle(surface, ExportMemoryType::DrmPrime).expect("export");
        assert_eq!(descriptor.fourcc, FOURCC_NV12);
        assert_eq!(descriptor.width, 640);
        assert_eq!(descriptor.height, 480);
        assert_eq!(descriptor.objects[0].size, 640 * 480 * 3 / 2);
        assert_eq!(descriptor.layers[1].offset, 640 * 480);
    }

    #[test]
    fn sync_on_untouched_surface_is_immediate() {
        let (driver, _backend) = driver_with(FakeConfig::default());
        let surfaces = driver.create_surfaces(640, 480, RT_FORMAT_YUV420, 1).expect("surfaces");

        let start = Instant::now();
        driver.sync_surface(surfaces[0]).expect("sync");
        assert!(start.elapsed() < Duration::from_millis(600));
        assert_eq!(driver.query_surface_status(surfaces[0]).expect("status"), SurfaceStatus::Ready);
    }

    #[test]
    fn destroy_surfaces_returns_held_buffers() {
        let (driver, backend) = driver_with(FakeConfig::default());
        let (_context, surface) = decode_one_frame(&driver);

        driver.destroy_surfaces(&[surface]).expect("destroy");

        let states = backend.created.lock().unwrap();
        let state = states[0].lock().unwrap();
        assert_eq!(state.output_queue_calls.len(), 17);
    }

    #[test]
    fn unimplemented_entry_points_say_so() {
        let (driver, _backend) = driver_with(FakeConfig::default());
        let surface = SurfaceId(0x2001);
        assert!(matches!(driver.put_surface(surface), Err(VaError::Unimplemented)));
        assert!(matches!(driver.lock_surface(surface), Err(VaError::Unimplemented)));
        assert!(matches!(driver.create_mf_context(), Err(VaError::Unimplemented)));
        assert!(matches!(driver.query_processing_rate(ConfigId(1)), Err(VaError::Unimplemented)));
        assert!(driver.query_display_attributes().is_empty());
        assert!(driver.query_subpicture_formats().is_empty());
    }

    #[test]
    fn surface_attributes_report_limits() {
        let (driver, _backend) = driver_with(FakeConfig::default());
        let config = driver.create_config(Profile::H264Main, Entrypoint::Vld, &[]).expect("config");
        let attribs = driver.query_surface_attributes(config).expect("attribs");
        assert_eq!(attribs.pixel_format, FOURCC_NV12);
        assert_eq!(attribs.min_size.width, 16);
        assert_eq!(attribs.max_size.width, 4096);
        assert_eq!(attribs.memory_types.len(), 2);
    }

    #[test]
    fn iq_matrix_buffers_are_ignored() {
        let (driver, backend) = driver_with(FakeConfig::default());
        let config =
            driver.create_config(Profile::Vp8Version0_3, Entrypoint::Vld, &[]).expect("config");
        let surfaces = driver.create_surfaces(640, 480, RT_FORMAT_YUV420, 1).expect("surfaces");
        let context = driver.create_context(config, 640, 480, &surfaces).expect("context");

        let iq = driver.create_buffer(context, BufferData::IqMatrix).expect("iq");
        driver.begin_picture(context, surfaces[0]).expect("begin");
        driver.render_picture(context, &[iq]).expect("render");
        driver.end_picture(context).expect("end");

        // Nothing was assembled, so nothing was submitted.
        let states = backend.created.lock().unwrap();
        assert!(states[0].lock().unwrap().submitted.is_empty());
    }
}
