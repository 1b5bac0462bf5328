//! Command buffer and fence management.
//!
//! Transfers are recorded through a [`FencedCommandBuffer`], which pairs one
//! command buffer with an optional fence. The fence is the only
//! cross-thread-safe way to learn that submitted work has completed.

use crate::context::SharedQueue;
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffer(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        Ok(buffers[0])
    }

    /// Destroy the command pool, returning all its command buffers.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

/// One unit of GPU work with optional fence-based synchronisation.
///
/// The underlying command buffer is allocated lazily on the first call to
/// [`FencedCommandBuffer::prepare_and_start_recording`]. Command buffers are
/// returned to their pool when the pool is destroyed; teardown here only owns
/// the fence.
pub struct FencedCommandBuffer {
    device: Arc<ash::Device>,
    handle: Option<vk::CommandBuffer>,
    fence: Option<vk::Fence>,
    /// Whether the recorded contents are outdated and need re-recording.
    pub stale: bool,
    /// Whether this command buffer has been submitted to a queue.
    pub submitted: bool,
}

impl FencedCommandBuffer {
    /// Create a new command buffer wrapper; `fenced` attaches a fence up front.
    pub fn new(device: Arc<ash::Device>, fenced: bool) -> Result<Self> {
        let mut cmd = Self {
            device,
            handle: None,
            fence: None,
            stale: true,
            submitted: false,
        };

        if fenced {
            cmd.add_fence()?;
        }

        Ok(cmd)
    }

    /// Wrap an already-allocated raw command buffer.
    pub fn with_handle(
        device: Arc<ash::Device>,
        handle: vk::CommandBuffer,
        fenced: bool,
    ) -> Result<Self> {
        let mut cmd = Self::new(device, fenced)?;
        cmd.handle = Some(handle);
        Ok(cmd)
    }

    /// The raw command buffer handle, if one has been allocated.
    pub fn handle(&self) -> Option<vk::CommandBuffer> {
        self.handle
    }

    /// The fence guarding this command buffer, if any.
    pub fn fence(&self) -> Option<vk::Fence> {
        self.fence
    }

    /// Attach a fence for synchronisation. Safe to call more than once; only
    /// the first call creates a fence.
    pub fn add_fence(&mut self) -> Result<()> {
        if self.fence.is_none() {
            self.fence = Some(unsafe { create_fence(&self.device, false)? });
        }
        Ok(())
    }

    /// Block until the fence signals, or `timeout_ms` elapses.
    ///
    /// No-op when the buffer was created without a fence.
    pub fn wait_for_fence(&self, timeout_ms: Option<u64>) -> Result<()> {
        let Some(fence) = self.fence else {
            return Ok(());
        };

        let timeout_ns = timeout_ms.map_or(u64::MAX, |ms| ms.saturating_mul(1_000_000));
        unsafe {
            self.device.wait_for_fences(&[fence], true, timeout_ns)?;
        }
        Ok(())
    }

    /// Whether the fence has signaled. `false` for unfenced buffers.
    pub fn fence_signaled(&self) -> Result<bool> {
        let Some(fence) = self.fence else {
            return Ok(false);
        };

        let signaled = unsafe { self.device.get_fence_status(fence)? };
        Ok(signaled)
    }

    /// Reset the fence to unsignaled for reuse.
    pub fn reset_fence(&self) -> Result<()> {
        if let Some(fence) = self.fence {
            unsafe {
                self.device.reset_fences(&[fence])?;
            }
        }
        Ok(())
    }

    /// Prepare this command buffer for recording, allocating the underlying
    /// command buffer from `pool` if absent, and begin recording.
    pub fn prepare_and_start_recording(&mut self, pool: &CommandPool) -> Result<vk::CommandBuffer> {
        let cmd = match self.handle {
            Some(cmd) => cmd,
            None => {
                let cmd = unsafe { pool.allocate_command_buffer(&self.device)? };
                self.handle = Some(cmd);
                cmd
            }
        };

        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cmd, &begin_info)?;
        }

        self.submitted = false;
        Ok(cmd)
    }

    /// End recording and submit to `queue`, signalling this buffer's fence.
    pub fn end_and_submit(&mut self, queue: &SharedQueue) -> Result<()> {
        let cmd = self.handle.ok_or_else(|| {
            crate::error::GpuError::InvalidState(
                "Command buffer must be recorded before submission".to_string(),
            )
        })?;

        unsafe {
            self.device.end_command_buffer(cmd)?;
        }

        queue.submit(&self.device, cmd, self.fence.unwrap_or_else(vk::Fence::null))?;
        self.submitted = true;
        self.stale = false;
        Ok(())
    }

    /// Take ownership of the fence, leaving the buffer unfenced.
    ///
    /// The caller becomes responsible for destroying it.
    pub fn take_fence(&mut self) -> Option<vk::Fence> {
        self.fence.take()
    }

    /// Destroy the fence. Idempotent; calling twice is a no-op.
    pub fn destroy(&mut self) {
        if let Some(fence) = self.fence.take() {
            unsafe {
                self.device.destroy_fence(fence, None);
            }
        }
    }
}

impl Drop for FencedCommandBuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}
