//! Vulkan resource layer for the Vista engine.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - Memory allocation via gpu-allocator
//! - Pooled buffer suballocation
//! - Fence-guarded command buffers
//! - Device-resident textures with staged, optionally asynchronous uploads

pub mod command;
pub mod context;
pub mod error;
pub mod format;
pub mod instance;
pub mod load;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod suballoc;
pub mod texture;

pub use command::{CommandPool, FencedCommandBuffer};
pub use context::{CommandPools, GpuContext, GpuContextBuilder, SharedQueue};
pub use error::{GpuError, Result};
pub use format::{format_for, pad_three_channel, transition_access_masks};
pub use load::{load_raw_volume, load_texture};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pool::{BackingSource, BufferPool, BASIC_BUFFER_SIZE};
pub use registry::{RegisteredTexture, TextureRegistry};
pub use suballoc::{BackingAllocation, Suballocation};
pub use texture::{GpuTexture, TransferConfig, UploadEvent, UploadMode, UploadPlan};
