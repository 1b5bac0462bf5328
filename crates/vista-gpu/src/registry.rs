//! Registry of device-resident textures.
//!
//! Maps scene-side texture descriptors to the native handles created for
//! them, so a descriptor that is attached to several scene nodes gets one
//! device resource. The registry holds weak references: it tracks existence
//! but never extends a descriptor's lifetime. Entries are removed explicitly
//! on texture teardown; dead entries are dropped on lookup.

use ash::vk;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use vista_core::texture::{Texture, TextureId};

/// Native handles registered for one texture descriptor.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisteredTexture {
    /// Device-local image.
    pub image: vk::Image,
    /// Sampling view of the image.
    pub view: vk::ImageView,
    /// Sampler configured from the descriptor.
    pub sampler: vk::Sampler,
}

struct Entry {
    descriptor: Weak<Texture>,
    handles: RegisteredTexture,
}

/// Registry owned by the graphics context.
#[derive(Default)]
pub struct TextureRegistry {
    entries: HashMap<TextureId, Entry>,
}

impl TextureRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the native handles created for `descriptor`.
    pub fn register(&mut self, descriptor: &Arc<Texture>, handles: RegisteredTexture) {
        self.entries.insert(
            descriptor.id(),
            Entry {
                descriptor: Arc::downgrade(descriptor),
                handles,
            },
        );
    }

    /// Look up the native handles for a descriptor id.
    ///
    /// Returns `None` and drops the entry when the descriptor has been
    /// released by the scene.
    pub fn get(&mut self, id: TextureId) -> Option<(Arc<Texture>, RegisteredTexture)> {
        let entry = self.entries.get(&id)?;
        if let Some(descriptor) = entry.descriptor.upgrade() {
            return Some((descriptor, entry.handles));
        }

        self.entries.remove(&id);
        None
    }

    /// Remove a registration, returning its handles for teardown.
    pub fn remove(&mut self, id: TextureId) -> Option<RegisteredTexture> {
        self.entries.remove(&id).map(|e| e.handles)
    }

    /// Number of registered textures, live or not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec3;
    use vista_core::texture::ElementKind;

    fn descriptor() -> Arc<Texture> {
        Arc::new(Texture::new(
            UVec3::new(4, 4, 1),
            4,
            ElementKind::UInt8,
            None,
        ))
    }

    #[test]
    fn registered_textures_are_found_by_id() {
        let mut registry = TextureRegistry::new();
        let tex = descriptor();

        registry.register(&tex, RegisteredTexture::default());
        let (found, _) = registry.get(tex.id()).expect("registered");
        assert_eq!(found.id(), tex.id());
    }

    #[test]
    fn registry_does_not_extend_descriptor_lifetime() {
        let mut registry = TextureRegistry::new();
        let tex = descriptor();
        let id = tex.id();

        registry.register(&tex, RegisteredTexture::default());
        drop(tex);

        assert!(registry.get(id).is_none());
        // The dead entry was pruned by the failed lookup.
        assert!(registry.is_empty());
    }

    #[test]
    fn removal_returns_the_handles() {
        let mut registry = TextureRegistry::new();
        let tex = descriptor();

        registry.register(&tex, RegisteredTexture::default());
        assert!(registry.remove(tex.id()).is_some());
        assert!(registry.remove(tex.id()).is_none());
        assert!(registry.get(tex.id()).is_none());
    }
}
