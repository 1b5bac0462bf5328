//! Renderer-agnostic texture descriptors.
//!
//! A [`Texture`] describes pixel data owned by the scene; the renderer backend
//! turns it into a device-resident resource. Partial updates are queued as
//! [`TextureUpdate`]s and consumed by the backend in the order they arrived.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use glam::UVec3;
use parking_lot::{Mutex, MutexGuard};

/// Scalar type of a single texture channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 16-bit integer
    Int16,
    /// Unsigned 16-bit integer
    UInt16,
    /// Signed 32-bit integer
    Int32,
    /// Unsigned 32-bit integer
    UInt32,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
}

impl ElementKind {
    /// Width of one element of this kind in bytes.
    #[inline]
    pub const fn byte_width(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

/// Texture repeat modes for the U/V/W coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepeatMode {
    /// Tile the texture
    #[default]
    Repeat,
    /// Tile the texture, mirroring every other tile
    MirroredRepeat,
    /// Clamp sampling to the edge texels
    ClampToEdge,
    /// Clamp sampling to the border color
    ClampToBorder,
}

impl RepeatMode {
    /// The same mode on all three coordinates.
    pub const fn all(self) -> [Self; 3] {
        [self, self, self]
    }
}

/// Border colors available for sampling outside the texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BorderColor {
    /// Transparent black border
    #[default]
    TransparentBlack,
    /// Opaque black border
    OpaqueBlack,
    /// Opaque white border
    OpaqueWhite,
}

/// Texture filtering modes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilteringMode {
    /// Nearest-neighbour filtering
    NearestNeighbour,
    /// Linear interpolation
    #[default]
    Linear,
}

bitflags! {
    /// Intended usage of a texture.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        /// Regular sampled texture
        const TEXTURE = 1 << 0;
        /// Render target (color attachment)
        const RENDER_TARGET = 1 << 1;
        /// Upload asynchronously, off the render thread
        const ASYNC_LOAD = 1 << 2;
    }
}

bitflags! {
    /// Lifecycle state of a texture's device-side copy.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TextureState: u32 {
        /// Contents have been transferred to the device
        const UPLOADED = 1 << 0;
        /// The device-side resource may be bound for sampling
        const AVAILABLE_FOR_USE = 1 << 1;
    }
}

/// Process-unique identifier for a [`Texture`] descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Offset and extent of a region within a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureExtents {
    /// X offset in texels
    pub x: u32,
    /// Y offset in texels
    pub y: u32,
    /// Z offset in texels
    pub z: u32,
    /// Region width in texels
    pub w: u32,
    /// Region height in texels
    pub h: u32,
    /// Region depth in texels
    pub d: u32,
}

impl TextureExtents {
    /// Extents covering a whole texture of the given dimensions.
    pub const fn full(dimensions: UVec3) -> Self {
        Self {
            x: 0,
            y: 0,
            z: 0,
            w: dimensions.x,
            h: dimensions.y,
            d: dimensions.z,
        }
    }
}

/// A pending partial update to a texture.
///
/// Created by the scene side, consumed by the renderer backend once the bytes
/// have been issued to the device.
#[derive(Clone, Debug)]
pub struct TextureUpdate {
    /// Region the update covers
    pub extents: TextureExtents,
    /// Bytes for the region, tightly packed
    pub contents: Vec<u8>,
    /// Set once the backend has issued the copy for this update
    pub consumed: bool,
}

impl TextureUpdate {
    /// Create a new, unconsumed update.
    pub const fn new(extents: TextureExtents, contents: Vec<u8>) -> Self {
        Self {
            extents,
            contents,
            consumed: false,
        }
    }
}

/// Descriptor for renderer-agnostic texture data.
pub struct Texture {
    id: TextureId,
    /// Dimensions of the texture in texels
    pub dimensions: UVec3,
    /// Number of channels per texel
    pub channels: u32,
    /// Scalar type stored per channel
    pub element: ElementKind,
    /// Shall the texture be repeated on the U/V/W coordinates?
    pub repeat: [RepeatMode; 3],
    /// Border color used with [`RepeatMode::ClampToBorder`]
    pub border_color: BorderColor,
    /// Interpret the data as normalized? Non-normalized suits volume data.
    pub normalized: bool,
    /// Should mipmaps be generated?
    pub mipmap: bool,
    /// Filtering used when scaling down
    pub min_filter: FilteringMode,
    /// Filtering used when scaling up
    pub max_filter: FilteringMode,
    /// Intended usage
    pub usage: TextureUsage,
    contents: Mutex<Option<Vec<u8>>>,
    state: Mutex<TextureState>,
    updates: Mutex<Vec<TextureUpdate>>,
}

impl Texture {
    /// Create a new texture descriptor with default sampling parameters.
    pub fn new(
        dimensions: UVec3,
        channels: u32,
        element: ElementKind,
        contents: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id: TextureId(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed)),
            dimensions,
            channels,
            element,
            repeat: RepeatMode::Repeat.all(),
            border_color: BorderColor::default(),
            normalized: true,
            mipmap: true,
            min_filter: FilteringMode::Linear,
            max_filter: FilteringMode::Linear,
            usage: TextureUsage::TEXTURE,
            contents: Mutex::new(contents),
            state: Mutex::new(TextureState::empty()),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// The process-unique id of this descriptor.
    #[inline]
    pub const fn id(&self) -> TextureId {
        self.id
    }

    /// Bytes needed to store one texel.
    #[inline]
    pub const fn texel_size(&self) -> usize {
        self.channels as usize * self.element.byte_width()
    }

    /// Bytes needed to store the full texture, tightly packed.
    pub const fn required_bytes(&self) -> usize {
        self.dimensions.x as usize
            * self.dimensions.y as usize
            * self.dimensions.z as usize
            * self.texel_size()
    }

    /// Lock the byte contents.
    ///
    /// The backend holds this lock only for the duration of the host-side
    /// memory copy, never across a whole transfer.
    pub fn contents(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.contents.lock()
    }

    /// Replace the byte contents.
    pub fn set_contents(&self, contents: Vec<u8>) {
        *self.contents.lock() = Some(contents);
    }

    /// Current device-side lifecycle state.
    pub fn state(&self) -> TextureState {
        *self.state.lock()
    }

    /// Merge flags into the lifecycle state.
    pub fn add_state(&self, flags: TextureState) {
        self.state.lock().insert(flags);
    }

    /// Clear the lifecycle state.
    pub fn clear_state(&self) {
        *self.state.lock() = TextureState::empty();
    }

    /// Queue a partial update for the backend to apply.
    pub fn queue_update(&self, update: TextureUpdate) {
        self.updates.lock().push(update);
    }

    /// Whether any queued update has not yet been consumed.
    pub fn has_pending_updates(&self) -> bool {
        self.updates.lock().iter().any(|u| !u.consumed)
    }

    /// Total byte size of all unconsumed updates, in queue order.
    pub fn pending_update_bytes(&self) -> usize {
        self.updates
            .lock()
            .iter()
            .filter(|u| !u.consumed)
            .map(|u| u.contents.len())
            .sum()
    }

    /// Lock the update queue.
    pub fn updates(&self) -> MutexGuard<'_, Vec<TextureUpdate>> {
        self.updates.lock()
    }

    /// Drop all updates that have been consumed by the backend.
    pub fn clear_consumed_updates(&self) {
        self.updates.lock().retain(|u| !u.consumed);
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.id)
            .field("dimensions", &self.dimensions)
            .field("channels", &self.channels)
            .field("element", &self.element)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_texture() -> Texture {
        Texture::new(UVec3::new(64, 64, 1), 4, ElementKind::UInt8, None)
    }

    #[test]
    fn element_byte_widths() {
        assert_eq!(ElementKind::UInt8.byte_width(), 1);
        assert_eq!(ElementKind::Int16.byte_width(), 2);
        assert_eq!(ElementKind::UInt32.byte_width(), 4);
        assert_eq!(ElementKind::Float32.byte_width(), 4);
        assert_eq!(ElementKind::Float64.byte_width(), 8);
    }

    #[test]
    fn required_bytes_accounts_for_channels_and_element() {
        let tex = Texture::new(UVec3::new(16, 8, 4), 2, ElementKind::UInt16, None);
        assert_eq!(tex.required_bytes(), 16 * 8 * 4 * 2 * 2);
    }

    #[test]
    fn texture_ids_are_unique() {
        let a = test_texture();
        let b = test_texture();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn state_flags_accumulate() {
        let tex = test_texture();
        assert_eq!(tex.state(), TextureState::empty());

        tex.add_state(TextureState::UPLOADED);
        tex.add_state(TextureState::AVAILABLE_FOR_USE);
        assert!(tex.state().contains(TextureState::UPLOADED));
        assert!(tex.state().contains(TextureState::AVAILABLE_FOR_USE));

        tex.clear_state();
        assert_eq!(tex.state(), TextureState::empty());
    }

    #[test]
    fn update_queue_preserves_order_and_consumption() {
        let tex = test_texture();
        let region = TextureExtents {
            x: 0,
            y: 0,
            z: 0,
            w: 2,
            h: 2,
            d: 1,
        };

        tex.queue_update(TextureUpdate::new(region, vec![1; 16]));
        tex.queue_update(TextureUpdate::new(region, vec![2; 32]));
        assert!(tex.has_pending_updates());
        assert_eq!(tex.pending_update_bytes(), 48);

        // consume the first update only
        tex.updates()[0].consumed = true;
        assert_eq!(tex.pending_update_bytes(), 32);

        tex.clear_consumed_updates();
        let updates = tex.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].contents[0], 2);
    }
}
