//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// An image layout transition outside the supported table was requested.
    #[error("Unsupported layout transition: {from:?} -> {to:?}")]
    UnsupportedTransition {
        /// Layout the image is currently in.
        from: vk::ImageLayout,
        /// Layout that was requested.
        to: vk::ImageLayout,
    },

    /// Copy source larger than the destination resource.
    #[error("Copy source of {need} bytes exceeds destination capacity {have}")]
    CopySourceTooLarge {
        /// Capacity of the destination in bytes.
        have: u64,
        /// Size of the source in bytes.
        need: u64,
    },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error while loading texture data.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
