//! GPU context management.
//!
//! The [`GpuContext`] is the single top-level object of the resource layer:
//! it owns the device, the queues, the command pools, the memory allocator
//! and the texture registry. Everything else borrows capabilities from it.

use crate::command::CommandPool;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use crate::registry::TextureRegistry;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// A queue paired with its submission lock.
///
/// Vulkan queues are externally synchronized; every submission goes through
/// the lock, which is held only for the `vkQueueSubmit` call itself.
pub struct SharedQueue {
    queue: vk::Queue,
    lock: Mutex<()>,
}

impl SharedQueue {
    /// Wrap a raw queue handle.
    pub const fn new(queue: vk::Queue) -> Self {
        Self {
            queue,
            lock: Mutex::new(()),
        }
    }

    /// The raw queue handle.
    pub const fn raw(&self) -> vk::Queue {
        self.queue
    }

    /// Submit one command buffer, optionally signalling `fence`.
    pub fn submit(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        let cmds = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmds);
        unsafe {
            device.queue_submit(self.queue, &[submit_info], fence)?;
        }
        Ok(())
    }

    /// Block until the queue is idle.
    pub fn wait_idle(&self, device: &ash::Device) -> Result<()> {
        let _guard = self.lock.lock();
        unsafe {
            device.queue_wait_idle(self.queue)?;
        }
        Ok(())
    }
}

/// Command pools for the two queue families the resource layer uses.
pub struct CommandPools {
    /// Pool on the graphics queue family, for blits and general work.
    pub standard: CommandPool,
    /// Pool on the transfer queue family, for staging copies.
    pub transfer: CommandPool,
}

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    allocator: Mutex<GpuAllocator>,
    textures: Mutex<TextureRegistry>,

    graphics_queue_family: u32,
    transfer_queue_family: u32,
    graphics_queue: SharedQueue,
    transfer_queue: SharedQueue,
    pools: CommandPools,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get a shared handle to the device, for background workers.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Get the physical device handle.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the graphics queue.
    pub const fn graphics_queue(&self) -> &SharedQueue {
        &self.graphics_queue
    }

    /// Get the transfer queue.
    pub const fn transfer_queue(&self) -> &SharedQueue {
        &self.transfer_queue
    }

    /// Get the graphics queue family index.
    pub const fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get the transfer queue family index.
    pub const fn transfer_queue_family(&self) -> u32 {
        self.transfer_queue_family
    }

    /// Get the command pools.
    pub const fn pools(&self) -> &CommandPools {
        &self.pools
    }

    /// Get access to the GPU allocator.
    pub const fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Get access to the texture registry.
    pub const fn textures(&self) -> &Mutex<TextureRegistry> {
        &self.textures
    }

    /// Wait for the device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.pools.standard.destroy(&self.device);
            self.pools.transfer.destroy(&self.device);

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Vista".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;
        let physical_device = unsafe { select_physical_device(&instance) }?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe {
            std::ffi::CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };
        tracing::info!("Selected GPU: {device_name}");

        let queue_families = unsafe { find_queue_families(&instance, physical_device) }?;

        let (device, graphics_queue, transfer_queue) =
            unsafe { create_device(&instance, physical_device, &queue_families)? };

        let device = Arc::new(device);

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        let pools = unsafe {
            CommandPools {
                standard: CommandPool::new(
                    &device,
                    queue_families.graphics,
                    vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                )?,
                transfer: CommandPool::new(
                    &device,
                    queue_families.transfer,
                    vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                )?,
            }
        };

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            allocator: Mutex::new(allocator),
            textures: Mutex::new(TextureRegistry::new()),
            graphics_queue_family: queue_families.graphics,
            transfer_queue_family: queue_families.transfer,
            graphics_queue: SharedQueue::new(graphics_queue),
            transfer_queue: SharedQueue::new(transfer_queue),
            pools,
        })
    }
}

/// Queue family indices.
struct QueueFamilyIndices {
    graphics: u32,
    transfer: u32,
}

/// Find queue families for graphics and transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut graphics_family = None;
    let mut transfer_family = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        // Look for a dedicated transfer queue (no graphics or compute)
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && !family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    // Graphics queue is required
    let graphics = graphics_family.ok_or(GpuError::NoSuitableDevice)?;

    // Fall back to the graphics queue for transfer if no dedicated queue
    let transfer = transfer_family.unwrap_or(graphics);

    Ok(QueueFamilyIndices { graphics, transfer })
}

/// Create the logical device and retrieve queues.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
    // Collect unique queue families
    let mut unique_families = std::collections::HashSet::new();
    unique_families.insert(queue_families.graphics);
    unique_families.insert(queue_families.transfer);

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_features(&features);

    let device = unsafe {
        instance
            .create_device(physical_device, &device_create_info, None)
            .map_err(GpuError::from)?
    };

    let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
    let transfer_queue = unsafe { device.get_device_queue(queue_families.transfer, 0) };

    Ok((device, graphics_queue, transfer_queue))
}
