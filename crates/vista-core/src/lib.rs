//! Core types and traits for the Vista engine.
//!
//! This crate provides the renderer-agnostic types used throughout the
//! engine:
//! - Texture descriptors and pending-update queues
//! - Pixel element kinds and sampling modes
//! - Common error types

pub mod error;
pub mod texture;

pub use error::{Error, Result};
pub use texture::{
    BorderColor, ElementKind, FilteringMode, RepeatMode, Texture, TextureExtents, TextureId,
    TextureState, TextureUpdate, TextureUsage,
};
