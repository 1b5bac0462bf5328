//! Device-resident textures and the staging upload protocol.
//!
//! A [`GpuTexture`] owns one device-local image plus one host-visible staging
//! image and drives the copy-and-transition protocol between them: staging
//! writes, layout transitions, buffer-routed volume uploads, partial region
//! updates and mip chain generation. Uploads run either blocking or
//! asynchronously; asynchronous completions arrive as [`UploadEvent`]s on a
//! channel drained by [`GpuTexture::pump_events`].

use crate::command::FencedCommandBuffer;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::format::{
    address_mode, border_color, filter, format_for, pad_three_channel, transition_access_masks,
    transition_stage_masks,
};
use crate::memory::{GpuBuffer, GpuImage};
use crate::registry::RegisteredTexture;
use ash::vk;
use crossbeam::channel::{unbounded, Receiver, Sender};
use gpu_allocator::MemoryLocation;
use parking_lot::{Condvar, Mutex};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use vista_core::texture::{Texture, TextureId, TextureState, TextureUsage};

/// Empirical tuning knobs for the transfer path.
///
/// The growth constants mirror long-standing renderer behaviour but are not
/// load-bearing; adjust freely.
#[derive(Clone, Copy, Debug)]
pub struct TransferConfig {
    /// Headroom factor applied when regrowing the reusable transfer buffer.
    pub growth_factor: f64,
    /// Buffers at least this large are sized exactly, without headroom.
    pub exact_fit_threshold: u64,
    /// Smallest transfer buffer ever allocated.
    pub min_size: u64,
    /// How often an asynchronous upload polls its fence.
    pub poll_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            growth_factor: 1.33,
            exact_fit_threshold: 8 * 1024 * 1024,
            min_size: 1024 * 1024,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl TransferConfig {
    /// Capacity to allocate for a transfer buffer that must hold `required`
    /// bytes.
    pub fn reserved_capacity(&self, required: u64) -> u64 {
        let reserved = if required < self.exact_fit_threshold {
            (required as f64 * self.growth_factor).round() as u64
        } else {
            required
        };
        reserved.max(self.min_size)
    }
}

/// How an upload is carried out, selected once per `copy_from` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadPlan {
    /// 2D, single mip: staging image, image-to-image copy.
    Simple2D,
    /// 3D data or partial updates: routed through the reusable transfer
    /// buffer.
    Volumetric3D,
    /// Multiple mip levels: one-shot staging buffer, then device-side blits.
    Mipmapped,
}

impl UploadPlan {
    /// Select the plan for a texture's shape and pending work.
    pub const fn select(depth: u32, mip_levels: u32, has_updates: bool) -> Self {
        if mip_levels > 1 {
            Self::Mipmapped
        } else if depth > 1 || has_updates {
            Self::Volumetric3D
        } else {
            Self::Simple2D
        }
    }
}

/// Whether `copy_from` blocks until the transfer fence signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadMode {
    /// Block the calling thread until the transfer completes.
    Blocking,
    /// Return immediately; completion arrives as an [`UploadEvent`].
    Async,
}

/// Completion message posted by an asynchronous upload's fence watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadEvent {
    /// The transfer for the given texture has completed on the device.
    Completed(TextureId),
}

/// One upload in flight at a time per texture. Callers serialize their own
/// upload requests; this slot only prevents overlapping GPU submissions.
struct UploadSlot {
    busy: Mutex<bool>,
    done: Condvar,
}

impl UploadSlot {
    const fn new() -> Self {
        Self {
            busy: Mutex::new(false),
            done: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.done.wait(&mut busy);
        }
        *busy = true;
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.done.notify_all();
    }

    fn drain(&self) {
        self.acquire();
        self.release();
    }
}

/// An image with its lazily-created sampler and view, and its tracked layout.
///
/// Vulkan itself has no notion of a "current layout"; it is an invariant this
/// struct maintains. All transitions go through the translation table, and a
/// rejected transition leaves the tracked layout untouched.
pub struct ImageResource {
    /// The image and its allocation.
    pub image: GpuImage,
    /// Sampler, null until created.
    pub sampler: vk::Sampler,
    /// View, null until created.
    pub view: vk::ImageView,
    layout: vk::ImageLayout,
}

impl ImageResource {
    fn new(image: GpuImage, layout: vk::ImageLayout) -> Self {
        Self {
            image,
            sampler: vk::Sampler::null(),
            view: vk::ImageView::null(),
            layout,
        }
    }

    /// The layout the image is currently tracked in.
    pub const fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Record a transition of the whole image into `to`, updating the
    /// tracked layout.
    fn transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        to: vk::ImageLayout,
    ) -> Result<()> {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: self.image.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        };
        record_transition(device, cmd, self.image.image, self.layout, to, range)?;
        self.layout = to;
        Ok(())
    }
}

/// Record a layout transition barrier.
///
/// Fails loudly on pairs outside the translation table; no barrier is
/// recorded in that case.
fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
    range: vk::ImageSubresourceRange,
) -> Result<()> {
    let (src_access, dst_access) = transition_access_masks(from, to).inspect_err(|e| {
        tracing::error!("{e}");
    })?;
    let (src_stage, dst_stage) = transition_stage_masks(from, to);

    tracing::trace!(
        "Transition: {from:?} -> {to:?} with src_access={src_access:?}, dst_access={dst_access:?}"
    );

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(from)
        .new_layout(to)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .image(image)
        .subresource_range(range);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    Ok(())
}

const fn subresource_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

const fn mip_range(mip_level: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: mip_level,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// A texture on the device, with its staging image and transfer machinery.
pub struct GpuTexture {
    ctx: Arc<GpuContext>,
    descriptor: Arc<Texture>,
    width: u32,
    height: u32,
    depth: u32,
    format: vk::Format,
    mip_levels: u32,

    image: ImageResource,
    staging: ImageResource,
    /// Reusable transfer buffer; grown, never shrunk, for this texture's
    /// lifetime. Never shared across textures.
    tmp_buffer: Option<GpuBuffer>,
    transfer_cmd: FencedCommandBuffer,
    config: TransferConfig,

    upload_slot: Arc<UploadSlot>,
    events: (Sender<UploadEvent>, Receiver<UploadEvent>),
    destroyed: bool,
}

impl GpuTexture {
    /// Create the device and staging images for `descriptor`.
    ///
    /// `mip_levels` above 1 enables the mipmapped upload path.
    pub fn new(ctx: &Arc<GpuContext>, descriptor: &Arc<Texture>, mip_levels: u32) -> Result<Self> {
        let dims = descriptor.dimensions;
        let format = format_for(descriptor.element, descriptor.channels, descriptor.normalized);

        // 3D textures route uploads through a buffer; their staging image is
        // only a stub kept for the protocol's sake.
        let staging_image = if dims.z == 1 {
            create_image(
                ctx,
                dims.x,
                dims.y,
                1,
                format,
                vk::ImageUsageFlags::TRANSFER_SRC,
                vk::ImageTiling::LINEAR,
                MemoryLocation::CpuToGpu,
                1,
                vk::ImageLayout::PREINITIALIZED,
                "texture_staging",
            )?
        } else {
            create_image(
                ctx,
                16,
                16,
                1,
                format,
                vk::ImageUsageFlags::TRANSFER_SRC,
                vk::ImageTiling::LINEAR,
                MemoryLocation::CpuToGpu,
                1,
                vk::ImageLayout::PREINITIALIZED,
                "texture_staging_stub",
            )?
        };

        let mut usage = vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::SAMPLED;
        if descriptor.usage.contains(TextureUsage::RENDER_TARGET) {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }

        let device_image = create_image(
            ctx,
            dims.x,
            dims.y,
            dims.z,
            format,
            usage,
            vk::ImageTiling::OPTIMAL,
            MemoryLocation::GpuOnly,
            mip_levels,
            vk::ImageLayout::UNDEFINED,
            "texture_device",
        )?;

        let transfer_cmd = FencedCommandBuffer::new(ctx.device_arc(), true)?;

        let mut texture = Self {
            ctx: Arc::clone(ctx),
            descriptor: Arc::clone(descriptor),
            width: dims.x,
            height: dims.y,
            depth: dims.z,
            format,
            mip_levels,
            image: ImageResource::new(device_image, vk::ImageLayout::UNDEFINED),
            staging: ImageResource::new(staging_image, vk::ImageLayout::PREINITIALIZED),
            tmp_buffer: None,
            transfer_cmd,
            config: TransferConfig::default(),
            upload_slot: Arc::new(UploadSlot::new()),
            events: unbounded(),
            destroyed: false,
        };

        texture.image.sampler = texture.create_sampler()?;
        texture.image.view = texture.create_image_view()?;

        texture.ctx.textures().lock().register(
            descriptor,
            RegisteredTexture {
                image: texture.image.image.image,
                view: texture.image.view,
                sampler: texture.image.sampler,
            },
        );

        Ok(texture)
    }

    /// Texel format of the device image.
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    /// Number of mip levels of the device image.
    pub const fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// The device-side image resource.
    pub const fn image(&self) -> &ImageResource {
        &self.image
    }

    /// The scene-side descriptor this texture was created for.
    pub fn descriptor(&self) -> &Arc<Texture> {
        &self.descriptor
    }

    /// Override the transfer tuning knobs.
    pub fn set_transfer_config(&mut self, config: TransferConfig) {
        self.config = config;
    }

    /// Copy `data` into the device image.
    ///
    /// Blocks until the transfer completes unless the descriptor carries
    /// [`TextureUsage::ASYNC_LOAD`], in which case the call returns after
    /// submission and completion is posted as an [`UploadEvent`].
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if self.destroyed {
            return Err(GpuError::InvalidState(
                "Texture has been destroyed".to_string(),
            ));
        }

        let mode = if self.descriptor.usage.contains(TextureUsage::ASYNC_LOAD) {
            UploadMode::Async
        } else {
            UploadMode::Blocking
        };

        let plan = UploadPlan::select(
            self.depth,
            self.mip_levels,
            self.descriptor.has_pending_updates(),
        );

        if plan == UploadPlan::Simple2D && data.len() as u64 > self.staging.image.size {
            tracing::warn!(
                "Allocated staging size for {:?} ({}) less than copy source size {}",
                self.descriptor.id(),
                self.staging.image.size,
                data.len()
            );
            return Err(GpuError::CopySourceTooLarge {
                have: self.staging.image.size,
                need: data.len() as u64,
            });
        }

        // 3-channel data has no fully-supported device format; pad to 4
        // channels before any GPU copy. The padded buffer is owned here and
        // freed on every exit path.
        let source: Cow<'_, [u8]> = if self.descriptor.channels == 3 {
            tracing::debug!("Loading RGB texture, padding channels to 4 to fit RGBA");
            Cow::Owned(pad_three_channel(data, self.descriptor.element))
        } else {
            Cow::Borrowed(data)
        };

        tracing::debug!(
            "Updating {:?} with {} mip levels ({plan:?}, {mode:?})",
            self.descriptor.id(),
            self.mip_levels
        );

        // Wait for any upload already in flight; requests are not queued.
        self.upload_slot.acquire();

        let result = match plan {
            UploadPlan::Simple2D => self.upload_simple_2d(&source, mode),
            UploadPlan::Volumetric3D => self.upload_volumetric(&source, mode),
            UploadPlan::Mipmapped => self.upload_mipmapped(&source),
        };

        if result.is_err() {
            self.upload_slot.release();
        }

        result
    }

    /// Drain completion events from asynchronous uploads, updating the
    /// descriptor's lifecycle state. Returns the number of events handled.
    pub fn pump_events(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.1.try_recv() {
            let UploadEvent::Completed(id) = event;
            debug_assert_eq!(id, self.descriptor.id());
            self.descriptor
                .add_state(TextureState::UPLOADED | TextureState::AVAILABLE_FOR_USE);
            self.descriptor.clear_consumed_updates();
            handled += 1;
        }
        handled
    }

    /// Block until no upload is in flight.
    pub fn wait_idle(&self) {
        self.upload_slot.drain();
    }

    /// 2D single-mip path: staging image, image-to-image copy.
    fn upload_simple_2d(&mut self, source: &[u8], mode: UploadMode) -> Result<()> {
        let device = self.ctx.device_arc();
        let cmd = self
            .transfer_cmd
            .prepare_and_start_recording(&self.ctx.pools().transfer)?;

        // Host-side copy into the persistently mapped staging image. The
        // content lock is held only for the duration of the copy.
        {
            let _contents = self.descriptor.contents();
            let ptr = self.staging.image.mapped_ptr().ok_or_else(|| {
                GpuError::InvalidState("Staging image is not host-visible".to_string())
            })?;
            unsafe {
                std::ptr::copy_nonoverlapping(source.as_ptr(), ptr, source.len());
            }
        }

        if self.staging.layout() == vk::ImageLayout::PREINITIALIZED {
            self.staging
                .transition(&device, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
        }
        self.image
            .transition(&device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

        let region = vk::ImageCopy {
            src_subresource: subresource_layers(0),
            src_offset: vk::Offset3D::default(),
            dst_subresource: subresource_layers(0),
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: self.depth,
            },
        };
        unsafe {
            device.cmd_copy_image(
                cmd,
                self.staging.image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.image.image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        self.image
            .transition(&device, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;

        self.finish_upload(mode)
    }

    /// Volume / partial-update path: bytes go through the reusable transfer
    /// buffer, one copy region per pending update.
    fn upload_volumetric(&mut self, source: &[u8], mode: UploadMode) -> Result<()> {
        let device = self.ctx.device_arc();

        let has_updates = self.descriptor.has_pending_updates();
        let required = if has_updates {
            self.descriptor.pending_update_bytes() as u64
        } else {
            source.len() as u64
        };
        self.ensure_tmp_buffer(required)?;

        let cmd = self
            .transfer_cmd
            .prepare_and_start_recording(&self.ctx.pools().transfer)?;

        self.image
            .transition(&device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

        let tmp = self
            .tmp_buffer
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Transfer buffer missing".to_string()))?;

        if has_updates {
            // Pack pending updates back-to-back and issue one copy region
            // per update, in queue order.
            let mut updates = self.descriptor.updates();
            let mut offset = 0u64;
            for update in updates.iter_mut().filter(|u| !u.consumed) {
                tmp.write_bytes(offset, &update.contents)?;

                let region = vk::BufferImageCopy {
                    buffer_offset: offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: subresource_layers(0),
                    image_offset: vk::Offset3D {
                        x: update.extents.x as i32,
                        y: update.extents.y as i32,
                        z: update.extents.z as i32,
                    },
                    image_extent: vk::Extent3D {
                        width: update.extents.w,
                        height: update.extents.h,
                        depth: update.extents.d,
                    },
                };
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        tmp.buffer,
                        self.image.image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }

                offset += update.contents.len() as u64;
                update.consumed = true;
            }
        } else {
            {
                let _contents = self.descriptor.contents();
                tmp.write_bytes(0, source)?;
            }

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: subresource_layers(0),
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: self.width,
                    height: self.height,
                    depth: self.depth,
                },
            };
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    tmp.buffer,
                    self.image.image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        }

        self.image
            .transition(&device, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;

        self.finish_upload(mode)
    }

    /// Mipmapped path: base level through a one-shot staging buffer, then a
    /// device-side blit per level. Always blocking.
    fn upload_mipmapped(&mut self, source: &[u8]) -> Result<()> {
        let device = self.ctx.device_arc();

        let mut staging = self.ctx.allocator().lock().create_buffer(
            source.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "texture_mip_staging",
        )?;

        let upload_result = (|| -> Result<()> {
            {
                let _contents = self.descriptor.contents();
                staging.write_bytes(0, source)?;
            }

            // Base level upload on the transfer queue.
            let cmd = self
                .transfer_cmd
                .prepare_and_start_recording(&self.ctx.pools().transfer)?;

            self.image
                .transition(&device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: subresource_layers(0),
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: self.width,
                    height: self.height,
                    depth: 1,
                },
            };
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    self.image.image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            self.image
                .transition(&device, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;

            self.transfer_cmd.end_and_submit(self.ctx.transfer_queue())?;
            self.transfer_cmd.wait_for_fence(None)?;
            self.transfer_cmd.reset_fence()?;

            self.generate_mip_chain(&device)
        })();

        // The one-shot buffer is freed on every exit path.
        self.ctx.allocator().lock().free_buffer(&mut staging)?;
        upload_result?;

        self.descriptor
            .add_state(TextureState::UPLOADED | TextureState::AVAILABLE_FOR_USE);
        self.upload_slot.release();
        Ok(())
    }

    /// Blit each mip level from the previous one on the graphics queue.
    fn generate_mip_chain(&mut self, device: &ash::Device) -> Result<()> {
        let mut blit_cmd = FencedCommandBuffer::new(self.ctx.device_arc(), true)?;
        let cmd = blit_cmd.prepare_and_start_recording(&self.ctx.pools().standard)?;

        for level in 1..self.mip_levels {
            let dst_width = self.width >> level;
            let dst_height = self.height >> level;
            if dst_width < 2 || dst_height < 2 {
                break;
            }

            // Level 1 reads mip 0, still in TRANSFER_SRC from the base
            // upload; deeper levels leave SHADER_READ_ONLY first.
            if level > 1 {
                record_transition(
                    device,
                    cmd,
                    self.image.image.image,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    mip_range(level - 1),
                )?;
            }
            record_transition(
                device,
                cmd,
                self.image.image.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                mip_range(level),
            )?;

            let blit = vk::ImageBlit {
                src_subresource: subresource_layers(level - 1),
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: (self.width >> (level - 1)) as i32,
                        y: (self.height >> (level - 1)) as i32,
                        z: 1,
                    },
                ],
                dst_subresource: subresource_layers(level),
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst_width as i32,
                        y: dst_height as i32,
                        z: 1,
                    },
                ],
            };
            unsafe {
                device.cmd_blit_image(
                    cmd,
                    self.image.image.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image.image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            record_transition(
                device,
                cmd,
                self.image.image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                mip_range(level - 1),
            )?;
            record_transition(
                device,
                cmd,
                self.image.image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                mip_range(level),
            )?;
        }

        blit_cmd.end_and_submit(self.ctx.graphics_queue())?;
        blit_cmd.wait_for_fence(None)?;

        // Every level the loop touched ends shader-readable.
        self.image.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        Ok(())
    }

    /// Submit the transfer and either wait for the fence or hand it to a
    /// watcher thread that posts the completion event.
    fn finish_upload(&mut self, mode: UploadMode) -> Result<()> {
        self.transfer_cmd.end_and_submit(self.ctx.transfer_queue())?;

        match mode {
            UploadMode::Blocking => {
                self.transfer_cmd.wait_for_fence(None)?;
                self.transfer_cmd.reset_fence()?;
                self.descriptor
                    .add_state(TextureState::UPLOADED | TextureState::AVAILABLE_FOR_USE);
                self.descriptor.clear_consumed_updates();
                self.upload_slot.release();
                Ok(())
            }
            UploadMode::Async => {
                // The watcher owns the fence from here; the command buffer is
                // re-fenced on the next upload.
                let fence = self.transfer_cmd.take_fence().ok_or_else(|| {
                    GpuError::InvalidState("Async upload requires a fenced transfer".to_string())
                })?;

                let device = self.ctx.device_arc();
                let sender = self.events.0.clone();
                let slot = Arc::clone(&self.upload_slot);
                let id = self.descriptor.id();
                let interval = self.config.poll_interval;

                std::thread::spawn(move || {
                    watch_fence(&device, fence, interval, id, &sender, &slot);
                });

                self.transfer_cmd.add_fence()?;
                Ok(())
            }
        }
    }

    /// Grow the reusable transfer buffer to hold `required` bytes.
    fn ensure_tmp_buffer(&mut self, required: u64) -> Result<()> {
        let current = self.tmp_buffer.as_ref().map_or(0, |b| b.size);
        if current >= required && self.tmp_buffer.is_some() {
            return Ok(());
        }

        let reserved = self.config.reserved_capacity(required);
        tracing::debug!(
            "({:?}) Reallocating transfer buffer, old size={current} new size={:.2} MiB",
            self.descriptor.id(),
            reserved as f64 / 1024.0 / 1024.0
        );

        let mut allocator = self.ctx.allocator().lock();
        if let Some(mut old) = self.tmp_buffer.take() {
            allocator.free_buffer(&mut old)?;
        }
        self.tmp_buffer = Some(allocator.create_buffer(
            reserved,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::CpuToGpu,
            "texture_transfer",
        )?);

        Ok(())
    }

    /// Copy the first layer, first mip level of the device image into `dst`.
    ///
    /// Blocks until the read-back completes.
    pub fn copy_to(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.destroyed {
            return Err(GpuError::InvalidState(
                "Texture has been destroyed".to_string(),
            ));
        }

        self.upload_slot.acquire();
        let result = self.copy_to_inner(dst);
        self.upload_slot.release();
        result
    }

    fn copy_to_inner(&mut self, dst: &mut [u8]) -> Result<()> {
        let device = self.ctx.device_arc();
        self.ensure_tmp_buffer(self.image.image.size)?;

        let cmd = self
            .transfer_cmd
            .prepare_and_start_recording(&self.ctx.pools().transfer)?;

        self.image
            .transition(&device, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;

        let tmp = self
            .tmp_buffer
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Transfer buffer missing".to_string()))?;

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: subresource_layers(0),
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: self.depth,
            },
        };
        unsafe {
            device.cmd_copy_image_to_buffer(
                cmd,
                self.image.image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                tmp.buffer,
                &[region],
            );
        }

        self.image
            .transition(&device, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;

        // Make the transfer write visible to the host read below.
        let buffer_barrier = vk::BufferMemoryBarrier::default()
            .buffer(tmp.buffer)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .size(vk::WHOLE_SIZE);
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[buffer_barrier],
                &[],
            );
        }

        self.transfer_cmd.end_and_submit(self.ctx.transfer_queue())?;
        self.transfer_cmd.wait_for_fence(None)?;
        self.transfer_cmd.reset_fence()?;

        tmp.read_bytes(0, dst)
    }

    /// Create a sampler from the descriptor's sampling parameters.
    fn create_sampler(&self) -> Result<vk::Sampler> {
        let desc = &self.descriptor;
        let is_3d = self.depth > 1;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter(desc.max_filter))
            .min_filter(filter(desc.min_filter))
            .mipmap_mode(if is_3d {
                vk::SamplerMipmapMode::NEAREST
            } else {
                vk::SamplerMipmapMode::LINEAR
            })
            .address_mode_u(address_mode(desc.repeat[0]))
            .address_mode_v(address_mode(desc.repeat[1]))
            .address_mode_w(address_mode(desc.repeat[2]))
            .mip_lod_bias(0.0)
            .anisotropy_enable(!is_3d)
            .max_anisotropy(if is_3d { 1.0 } else { 8.0 })
            .min_lod(0.0)
            .max_lod(if is_3d { 0.0 } else { self.mip_levels as f32 })
            .border_color(border_color(desc.border_color, desc.element))
            .compare_op(vk::CompareOp::NEVER);

        let sampler = unsafe { self.ctx.device().create_sampler(&sampler_info, None)? };
        tracing::debug!("Created sampler {sampler:?}");
        Ok(sampler)
    }

    /// Create the sampling view for the device image.
    fn create_image_view(&self) -> Result<vk::ImageView> {
        let is_3d = self.depth > 1;

        let mut view_info = vk::ImageViewCreateInfo::default()
            .image(self.image.image.image)
            .view_type(if is_3d {
                vk::ImageViewType::TYPE_3D
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: self.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });

        // Single-channel volumes broadcast red so shaders can sample .rgba.
        if self.descriptor.channels == 1 && is_3d {
            view_info = view_info.components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::R,
                b: vk::ComponentSwizzle::R,
                a: vk::ComponentSwizzle::R,
            });
        }

        let view = unsafe { self.ctx.device().create_image_view(&view_info, None)? };
        Ok(view)
    }

    /// Tear down every device resource owned by this texture.
    ///
    /// Waits for in-flight uploads first. Idempotent; calling twice is a
    /// no-op.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        self.upload_slot.drain();
        self.ctx.textures().lock().remove(self.descriptor.id());

        let device = self.ctx.device_arc();
        unsafe {
            if self.image.view != vk::ImageView::null() {
                device.destroy_image_view(self.image.view, None);
                self.image.view = vk::ImageView::null();
            }
            if self.image.sampler != vk::Sampler::null() {
                device.destroy_sampler(self.image.sampler, None);
                self.image.sampler = vk::Sampler::null();
            }
        }

        let mut allocator = self.ctx.allocator().lock();
        allocator.free_image(&mut self.image.image)?;
        allocator.free_image(&mut self.staging.image)?;
        if let Some(mut tmp) = self.tmp_buffer.take() {
            allocator.free_buffer(&mut tmp)?;
        }
        drop(allocator);

        self.transfer_cmd.destroy();
        Ok(())
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::error!("Texture teardown failed: {e}");
        }
    }
}

/// Poll `fence` until it signals, then destroy it, free the upload slot and
/// post the completion event.
///
/// The watcher owns the fence, so it never races the texture's teardown; if
/// the texture is gone the send simply fails and the event is dropped.
fn watch_fence(
    device: &ash::Device,
    fence: vk::Fence,
    interval: Duration,
    id: TextureId,
    sender: &Sender<UploadEvent>,
    slot: &UploadSlot,
) {
    loop {
        let done = unsafe { device.get_fence_status(fence) }.unwrap_or(true);
        tracing::trace!("Upload done: {done}");
        if done {
            break;
        }
        std::thread::sleep(interval);
    }

    unsafe {
        device.destroy_fence(fence, None);
    }

    slot.release();
    let _ = sender.send(UploadEvent::Completed(id));
}

#[allow(clippy::too_many_arguments)]
fn create_image(
    ctx: &Arc<GpuContext>,
    width: u32,
    height: u32,
    depth: u32,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    tiling: vk::ImageTiling,
    location: MemoryLocation,
    mip_levels: u32,
    initial_layout: vk::ImageLayout,
    name: &str,
) -> Result<GpuImage> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(if depth == 1 {
            vk::ImageType::TYPE_2D
        } else {
            vk::ImageType::TYPE_3D
        })
        .extent(vk::Extent3D {
            width,
            height,
            depth,
        })
        .mip_levels(mip_levels)
        .array_layers(1)
        .format(format)
        .tiling(tiling)
        .initial_layout(initial_layout)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .samples(vk::SampleCountFlags::TYPE_1);

    ctx.allocator().lock().create_image(&image_info, location, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_selection_is_explicit() {
        assert_eq!(UploadPlan::select(1, 1, false), UploadPlan::Simple2D);
        assert_eq!(UploadPlan::select(64, 1, false), UploadPlan::Volumetric3D);
        assert_eq!(UploadPlan::select(1, 1, true), UploadPlan::Volumetric3D);
        // Mip generation wins over everything else.
        assert_eq!(UploadPlan::select(1, 5, true), UploadPlan::Mipmapped);
    }

    #[test]
    fn small_transfer_buffers_get_headroom() {
        let config = TransferConfig::default();

        // Below the threshold: 1.33x growth, clamped to the floor.
        assert_eq!(config.reserved_capacity(1000), 1024 * 1024);
        let two_mib = 2 * 1024 * 1024;
        assert_eq!(
            config.reserved_capacity(two_mib),
            (two_mib as f64 * 1.33).round() as u64
        );

        // At or above the threshold: exact fit.
        let ten_mib = 10 * 1024 * 1024;
        assert_eq!(config.reserved_capacity(ten_mib), ten_mib);
    }

    #[test]
    fn upload_slot_serializes() {
        let slot = Arc::new(UploadSlot::new());
        slot.acquire();

        let other = Arc::clone(&slot);
        let handle = std::thread::spawn(move || {
            // Blocks until the main thread releases.
            other.acquire();
            other.release();
            true
        });

        std::thread::sleep(Duration::from_millis(10));
        slot.release();
        assert!(handle.join().unwrap());
    }
}
