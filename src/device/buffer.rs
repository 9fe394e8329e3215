//! Device-resident buffers with memory accounting

use crate::core::{Result, SVMError};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Byte budget shared by every buffer of one device
#[derive(Debug)]
pub(crate) struct MemoryPool {
    capacity: usize,
    allocated: AtomicUsize,
}

impl MemoryPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            allocated: AtomicUsize::new(0),
        }
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| SVMError::DeviceAllocation {
                requested: bytes,
                available: self.capacity.saturating_sub(used),
            })
    }

    fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A typed allocation in device memory
///
/// The bytes are returned to the device budget when the buffer is dropped,
/// so tearing down the owner of a set of buffers frees the device.
pub struct DeviceBuffer<T> {
    data: Vec<T>,
    bytes: usize,
    pool: Arc<MemoryPool>,
}

impl<T: Clone + Default> DeviceBuffer<T> {
    pub(crate) fn allocate(pool: &Arc<MemoryPool>, len: usize) -> Result<Self> {
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(SVMError::DeviceAllocation {
                requested: usize::MAX,
                available: pool.capacity().saturating_sub(pool.allocated()),
            })?;
        pool.reserve(bytes)?;

        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            pool.release(bytes);
            return Err(SVMError::DeviceAllocation {
                requested: bytes,
                available: pool.capacity().saturating_sub(pool.allocated()),
            });
        }
        data.resize(len, T::default());

        Ok(Self {
            data,
            bytes,
            pool: Arc::clone(pool),
        })
    }
}

impl<T> DeviceBuffer<T> {
    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes charged against the device budget
    pub fn size_bytes(&self) -> usize {
        self.bytes
    }
}

impl<T> Deref for DeviceBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> DerefMut for DeviceBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.pool.release(self.bytes);
    }
}

impl<T> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.data.len())
            .field("bytes", &self.bytes)
            .finish()
    }
}
