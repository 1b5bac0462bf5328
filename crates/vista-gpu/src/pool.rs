//! Pooled buffer allocation.
//!
//! A [`BufferPool`] owns a growable set of [`BackingAllocation`]s and routes
//! size-based requests to the first backing store with room, creating a new,
//! larger one when none fits. Backing stores are never freed individually;
//! they live until the pool is torn down.

use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer};
use crate::suballoc::{BackingAllocation, Suballocation};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

/// Default backing store size: 32 MiB.
pub const BASIC_BUFFER_SIZE: u64 = 1024 * 1024 * 32;

/// Source of backing buffers for a [`BufferPool`].
///
/// The pool never talks to the device directly; it asks its source for
/// fixed-capacity device-local buffers and suballocates them.
pub trait BackingSource {
    /// Create one backing buffer of `size` bytes with the given usage.
    fn create_backing(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Result<GpuBuffer>;
}

impl BackingSource for GpuAllocator {
    fn create_backing(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
        self.create_buffer(size, usage, MemoryLocation::GpuOnly, "buffer_pool_backing")
    }
}

/// A pool of backing buffers from which suballocations are made.
///
/// Each pool has specific usage flags, e.g. for vertex or index storage.
/// `create` is safe to call from multiple threads; the filter, grow and
/// allocate sequence runs under one lock.
pub struct BufferPool {
    usage: vk::BufferUsageFlags,
    backing_size: u64,
    store: Mutex<Vec<BackingAllocation>>,
}

impl BufferPool {
    /// Create a pool with the default backing store size.
    pub fn new(usage: vk::BufferUsageFlags) -> Self {
        Self::with_backing_size(usage, BASIC_BUFFER_SIZE)
    }

    /// Create a pool whose backing stores start at `backing_size` bytes.
    pub fn with_backing_size(usage: vk::BufferUsageFlags, backing_size: u64) -> Self {
        Self {
            usage,
            backing_size,
            store: Mutex::new(Vec::new()),
        }
    }

    /// Usage flags shared by all backing stores of this pool.
    pub const fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Number of backing stores currently owned by the pool.
    pub fn backing_count(&self) -> usize {
        self.store.lock().len()
    }

    /// Create a new suballocation of `size` bytes.
    ///
    /// If no existing backing store can hold the request, a new one is added
    /// whose capacity is the default size doubled until it fits.
    pub fn create(&self, source: &mut dyn BackingSource, size: u64) -> Result<Suballocation> {
        let mut store = self.store.lock();

        if let Some(backing) = store
            .iter_mut()
            .find(|b| b.usage() == self.usage && b.fit(size).is_some())
        {
            let offset = backing.fit(size).ok_or_else(|| {
                GpuError::InvalidState("Suballocation vanished under the pool lock".to_string())
            })?;
            return backing.allocate(offset, size);
        }

        tracing::trace!("Could not find space for allocation of {size}, creating new buffer");
        let mut capacity = self.backing_size;
        while capacity < size {
            capacity *= 2;
        }

        let buffer = source.create_backing(capacity, self.usage)?;
        let alignment = buffer.alignment;
        let mut backing = BackingAllocation::new(self.usage, alignment, buffer);
        tracing::trace!("Added new buffer of size {capacity} to backing store");

        let offset = backing.fit(size).ok_or_else(|| {
            GpuError::InvalidState(format!(
                "New allocation of {capacity} cannot fit {size}"
            ))
        })?;
        let suballocation = backing.allocate(offset, size)?;
        store.push(backing);

        Ok(suballocation)
    }

    /// Release a suballocation back to its backing store.
    pub fn release(&self, suballocation: &Suballocation) -> Result<()> {
        let mut store = self.store.lock();

        for backing in store.iter_mut() {
            if backing.buffer().buffer == suballocation.buffer
                && backing.has_live(suballocation)
            {
                return backing.release(suballocation);
            }
        }

        Err(GpuError::ResourceNotFound(format!(
            "No backing store owns suballocation at {} (+{})",
            suballocation.offset, suballocation.size
        )))
    }

    /// Free all backing buffers. The pool is unusable afterwards.
    pub fn destroy(&self, allocator: &mut GpuAllocator) -> Result<()> {
        let mut store = self.store.lock();
        for backing in store.iter_mut() {
            allocator.free_buffer(backing.buffer_mut())?;
        }
        store.clear();
        Ok(())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store.lock();
        f.debug_struct("BufferPool")
            .field("usage", &self.usage)
            .field("backing_size", &self.backing_size)
            .field("backing_stores", &store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backing source that hands out unmapped dummy buffers and records
    /// every capacity it was asked for.
    struct RecordingSource {
        created: Vec<u64>,
    }

    impl RecordingSource {
        const fn new() -> Self {
            Self {
                created: Vec::new(),
            }
        }
    }

    impl BackingSource for RecordingSource {
        fn create_backing(&mut self, size: u64, _usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
            self.created.push(size);
            Ok(GpuBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
                size,
                alignment: 64,
            })
        }
    }

    fn pool(backing_size: u64) -> BufferPool {
        BufferPool::with_backing_size(vk::BufferUsageFlags::VERTEX_BUFFER, backing_size)
    }

    #[test]
    fn oversized_request_grows_a_second_backing_store() {
        let pool = pool(1024);
        let mut source = RecordingSource::new();

        pool.create(&mut source, 100).unwrap();
        pool.create(&mut source, 200).unwrap();
        assert_eq!(pool.backing_count(), 1);

        pool.create(&mut source, 5000).unwrap();
        assert_eq!(pool.backing_count(), 2);
        assert_eq!(source.created, vec![1024, 8192]);
    }

    #[test]
    fn released_space_is_reused_without_growth() {
        let pool = pool(1024);
        let mut source = RecordingSource::new();

        let a = pool.create(&mut source, 512).unwrap();
        let _b = pool.create(&mut source, 256).unwrap();
        assert_eq!(pool.backing_count(), 1);

        pool.release(&a).unwrap();
        let c = pool.create(&mut source, 512).unwrap();
        assert_eq!(pool.backing_count(), 1);
        assert_eq!(c.offset, a.offset);
    }

    #[test]
    fn growth_is_geometric_and_sufficient() {
        let pool = pool(1024);
        let mut source = RecordingSource::new();

        for (request, expected) in [(1500, 2048), (60_000, 65_536), (1_000_000, 1_048_576)] {
            let sub = pool.create(&mut source, request).unwrap();
            assert_eq!(sub.size, request);
            assert!(source.created.contains(&expected));
            // Capacity is the default size times a power of two.
            assert_eq!(expected % 1024, 0);
            assert!((expected / 1024).is_power_of_two());
        }
    }

    #[test]
    fn releasing_a_foreign_suballocation_fails() {
        let pool = pool(1024);
        let mut source = RecordingSource::new();
        pool.create(&mut source, 128).unwrap();

        let bogus = Suballocation {
            offset: 512,
            size: 64,
            buffer: vk::Buffer::null(),
        };
        assert!(pool.release(&bogus).is_err());
    }
}
