//! Data-parallel accelerator runtime
//!
//! The solver talks to the accelerator only through the operations here:
//! allocating device buffers, copying between host and device, issuing a
//! pass of work-groups over an output buffer, and running a single-writer
//! section. This runtime hosts the device on the CPU: every pass is a
//! `rayon` parallel iteration over work-groups and returns only when all
//! groups have finished, which is the barrier between passes.
//!
//! A lane that faults (panics) fails the whole pass; the fault surfaces as
//! [`SVMError::Dispatch`] when the pass completes.

pub mod buffer;
pub mod launch;

pub use self::buffer::DeviceBuffer;
pub use self::launch::{find_launch_parameters, LaunchConfig, WorkGroup, THREADS_PER_GROUP, WARP_SIZE};

use self::buffer::MemoryPool;
use crate::core::{Result, SVMError};
use log::{debug, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Device runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device memory budget in bytes
    pub memory_bytes: usize,
    /// Maximum lanes per work-group
    pub max_group_size: usize,
    /// Lanes executing in lock-step
    pub warp_size: usize,
    /// Maximum lanes touched by one gradient initialisation pass
    pub max_grid_size: usize,
    /// Worker threads backing the device (all cores when unset)
    pub threads: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 2 << 30,
            max_group_size: THREADS_PER_GROUP,
            warp_size: WARP_SIZE,
            max_grid_size: 65_535,
            threads: None,
        }
    }
}

/// Properties reported by the device at construction
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub name: String,
    pub memory_bytes: usize,
    pub max_group_size: usize,
    pub warp_size: usize,
    pub max_grid_size: usize,
    pub compute_units: usize,
}

struct DeviceInner {
    properties: DeviceProperties,
    memory: Arc<MemoryPool>,
    pool: rayon::ThreadPool,
    passes: Mutex<HashMap<&'static str, PassStats>>,
}

/// Passes issued under one operation name and the lanes they launched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PassStats {
    passes: u64,
    lanes: u64,
}

/// Handle to one accelerator; clones share the same device
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Bring up a device and query its properties
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        if config.memory_bytes == 0 {
            return Err(SVMError::DeviceUnavailable(
                "device reports no memory".to_string(),
            ));
        }
        if config.warp_size == 0 || config.max_group_size < config.warp_size {
            return Err(SVMError::DeviceUnavailable(format!(
                "invalid group geometry: max group size {} with warp size {}",
                config.max_group_size, config.warp_size
            )));
        }
        if config.max_grid_size == 0 {
            return Err(SVMError::DeviceUnavailable(
                "device reports an empty grid".to_string(),
            ));
        }

        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("smoaccel-lane-{i}"));
        if let Some(threads) = config.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|e| SVMError::DeviceUnavailable(e.to_string()))?;

        let properties = DeviceProperties {
            name: "cpu-dataparallel".to_string(),
            memory_bytes: config.memory_bytes,
            max_group_size: config.max_group_size,
            warp_size: config.warp_size,
            max_grid_size: config.max_grid_size,
            compute_units: pool.current_num_threads(),
        };
        debug!(
            "device {} up: {} compute units, {} bytes",
            properties.name, properties.compute_units, properties.memory_bytes
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                properties,
                memory: Arc::new(MemoryPool::new(config.memory_bytes)),
                pool,
                passes: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.inner.properties
    }

    /// Launch shape for a pass over `n` elements on this device
    pub fn launch_for(&self, n: usize) -> LaunchConfig {
        let props = &self.inner.properties;
        find_launch_parameters(n, props.max_group_size, props.warp_size)
    }

    /// Bytes currently allocated on the device
    pub fn allocated_bytes(&self) -> usize {
        self.inner.memory.allocated()
    }

    /// Allocate a zero-initialised buffer
    pub fn alloc<T: Clone + Default>(&self, len: usize) -> Result<DeviceBuffer<T>> {
        DeviceBuffer::allocate(&self.inner.memory, len)
    }

    /// Allocate a buffer and copy `host` into it
    pub fn upload<T: Clone + Default>(&self, host: &[T]) -> Result<DeviceBuffer<T>> {
        let mut buffer = self.alloc(host.len())?;
        buffer.clone_from_slice(host);
        Ok(buffer)
    }

    /// Copy `src` into `dst` starting at `offset`
    pub fn upload_into<T: Clone>(
        &self,
        operation: &str,
        dst: &mut DeviceBuffer<T>,
        offset: usize,
        src: &[T],
    ) -> Result<()> {
        let end = offset.checked_add(src.len()).filter(|&end| end <= dst.len());
        match end {
            Some(end) => {
                dst[offset..end].clone_from_slice(src);
                Ok(())
            }
            None => Err(SVMError::Transfer {
                operation: operation.to_string(),
                expected: dst.len().saturating_sub(offset),
                actual: src.len(),
            }),
        }
    }

    /// Copy a whole device buffer back into `dst`
    pub fn download<T: Clone>(
        &self,
        operation: &str,
        src: &DeviceBuffer<T>,
        dst: &mut [T],
    ) -> Result<()> {
        if src.len() < dst.len() {
            return Err(SVMError::Transfer {
                operation: operation.to_string(),
                expected: dst.len(),
                actual: src.len(),
            });
        }
        let n = dst.len();
        dst.clone_from_slice(&src[..n]);
        Ok(())
    }

    /// Read one element back to the host
    pub fn read_scalar<T: Copy>(&self, operation: &str, src: &[T], index: usize) -> Result<T> {
        src.get(index).copied().ok_or_else(|| SVMError::Transfer {
            operation: operation.to_string(),
            expected: index + 1,
            actual: src.len(),
        })
    }

    /// Run one pass of `launch.groups` work-groups
    ///
    /// `out` is split into consecutive chunks of `per_group` elements and
    /// group `g` receives chunk `g`. The call returns after every group has
    /// run.
    pub fn dispatch<T, F>(
        &self,
        operation: &'static str,
        launch: LaunchConfig,
        out: &mut [T],
        per_group: usize,
        kernel: F,
    ) -> Result<()>
    where
        T: Send,
        F: Fn(WorkGroup, &mut [T]) + Sync,
    {
        let per_group = per_group.max(1);
        if out.len().div_ceil(per_group) < launch.groups {
            return Err(SVMError::Dispatch {
                operation: format!(
                    "{operation} (output of {} elements cannot host {} groups)",
                    out.len(),
                    launch.groups
                ),
            });
        }
        self.record(operation, launch.lanes());
        trace!(
            "pass {operation}: {} groups x {} lanes",
            launch.groups,
            launch.group_size
        );

        let pool = &self.inner.pool;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.install(|| {
                out.par_chunks_mut(per_group)
                    .take(launch.groups)
                    .enumerate()
                    .for_each(|(id, chunk)| {
                        kernel(
                            WorkGroup {
                                id,
                                size: launch.group_size,
                            },
                            chunk,
                        )
                    });
            })
        }));
        outcome.map_err(|_| SVMError::Dispatch {
            operation: operation.to_string(),
        })
    }

    /// Run one pass whose lanes each write one element of `first` and the
    /// element at the same position of `second`
    ///
    /// Both outputs are split into chunks of `per_group` elements and group
    /// `g` receives chunk `g` of each.
    pub fn dispatch_pair<T, F>(
        &self,
        operation: &'static str,
        launch: LaunchConfig,
        first: &mut [T],
        second: &mut [T],
        per_group: usize,
        kernel: F,
    ) -> Result<()>
    where
        T: Send,
        F: Fn(WorkGroup, &mut [T], &mut [T]) + Sync,
    {
        let per_group = per_group.max(1);
        let hosted = first.len().min(second.len()).div_ceil(per_group);
        if first.len() != second.len() || hosted < launch.groups {
            return Err(SVMError::Dispatch {
                operation: format!(
                    "{operation} (outputs of {} and {} elements cannot host {} groups)",
                    first.len(),
                    second.len(),
                    launch.groups
                ),
            });
        }
        self.record(operation, launch.lanes());
        trace!(
            "paired pass {operation}: {} groups x {} lanes",
            launch.groups,
            launch.group_size
        );

        let pool = &self.inner.pool;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.install(|| {
                first
                    .par_chunks_mut(per_group)
                    .zip(second.par_chunks_mut(per_group))
                    .take(launch.groups)
                    .enumerate()
                    .for_each(|(id, (a, b))| {
                        kernel(
                            WorkGroup {
                                id,
                                size: launch.group_size,
                            },
                            a,
                            b,
                        )
                    });
            })
        }));
        outcome.map_err(|_| SVMError::Dispatch {
            operation: operation.to_string(),
        })
    }

    /// Run `section` on the elected lane only
    ///
    /// All shared-state writes of a pass happen here; the call joins before
    /// returning, so every later pass observes the completed update.
    pub fn single_writer<R, F>(&self, operation: &'static str, section: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        self.record(operation, 1);
        trace!("single-writer section {operation}");
        panic::catch_unwind(AssertUnwindSafe(section)).map_err(|_| SVMError::Dispatch {
            operation: operation.to_string(),
        })
    }

    /// Number of passes issued under `operation` so far
    pub fn pass_count(&self, operation: &str) -> u64 {
        self.passes()
            .get(operation)
            .map_or(0, |stats| stats.passes)
    }

    /// Lanes launched under `operation` so far, summed over its passes
    pub fn lane_count(&self, operation: &str) -> u64 {
        self.passes()
            .get(operation)
            .map_or(0, |stats| stats.lanes)
    }

    fn record(&self, operation: &'static str, lanes: usize) {
        let mut passes = self.passes();
        let stats = passes.entry(operation).or_default();
        stats.passes += 1;
        stats.lanes += lanes as u64;
    }

    fn passes(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, PassStats>> {
        // A poisoned counter map only means a pass panicked while recording.
        self.inner
            .passes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("properties", &self.inner.properties)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_device() -> Device {
        Device::new(&DeviceConfig {
            memory_bytes: 1 << 20,
            threads: Some(2),
            ..DeviceConfig::default()
        })
        .expect("device")
    }

    #[test]
    fn test_device_rejects_invalid_geometry() {
        let config = DeviceConfig {
            max_group_size: 16,
            warp_size: 32,
            ..DeviceConfig::default()
        };
        assert!(matches!(
            Device::new(&config),
            Err(SVMError::DeviceUnavailable(_))
        ));
        let config = DeviceConfig {
            memory_bytes: 0,
            ..DeviceConfig::default()
        };
        assert!(Device::new(&config).is_err());
    }

    #[test]
    fn test_dispatch_covers_every_element() {
        let device = small_device();
        let n = 1000;
        let launch = LaunchConfig::covering(n, 64);
        let mut out = device.alloc::<usize>(n).expect("alloc");
        device
            .dispatch("iota", launch, &mut out, launch.group_size, |group, chunk| {
                let range = group.lane_range(n);
                for (slot, t) in chunk.iter_mut().zip(range) {
                    *slot = t;
                }
            })
            .expect("pass");
        assert!(out.iter().enumerate().all(|(i, &v)| i == v));
        assert_eq!(device.pass_count("iota"), 1);
        assert_eq!(device.lane_count("iota"), 1024);
    }

    #[test]
    fn test_paired_dispatch_writes_both_halves() {
        let device = small_device();
        let n = 300;
        let launch = LaunchConfig::covering(n, 64);
        let mut low = vec![0usize; n];
        let mut high = vec![0usize; n];
        device
            .dispatch_pair("mirror", launch, &mut low, &mut high, 64, |group, a, b| {
                for ((x, y), t) in a.iter_mut().zip(b.iter_mut()).zip(group.lane_range(n)) {
                    *x = t;
                    *y = t + n;
                }
            })
            .expect("pass");
        assert!(low.iter().enumerate().all(|(i, &v)| i == v));
        assert!(high.iter().enumerate().all(|(i, &v)| i + n == v));
        assert_eq!(device.pass_count("mirror"), 1);
        assert_eq!(device.lane_count("mirror"), 320);

        let mut short = vec![0usize; n - 1];
        assert!(device
            .dispatch_pair("mirror", launch, &mut low, &mut short, 64, |_, _, _| {})
            .is_err());
    }

    #[test]
    fn test_lane_fault_fails_the_pass() {
        let device = small_device();
        let launch = LaunchConfig::covering(128, 64);
        let mut out = vec![0u32; 128];
        let err = device
            .dispatch("faulty", launch, &mut out, 64, |group, _chunk| {
                if group.id == 1 {
                    panic!("lane fault");
                }
            })
            .unwrap_err();
        assert!(matches!(err, SVMError::Dispatch { ref operation } if operation == "faulty"));
    }

    #[test]
    fn test_dispatch_rejects_undersized_output() {
        let device = small_device();
        let mut out = vec![0u32; 2];
        let launch = LaunchConfig {
            groups: 3,
            group_size: 64,
        };
        assert!(device.dispatch("short", launch, &mut out, 1, |_, _| {}).is_err());
    }

    #[test]
    fn test_single_writer_runs_once() {
        let device = small_device();
        let mut counter = 0;
        let value = device
            .single_writer("bump", || {
                counter += 1;
                counter
            })
            .expect("section");
        assert_eq!(value, 1);
        assert_eq!(counter, 1);
        assert_eq!(device.pass_count("bump"), 1);
    }

    #[test]
    fn test_transfers_check_lengths() {
        let device = small_device();
        let mut buffer = device.upload(&[1.0f32, 2.0, 3.0]).expect("upload");
        device
            .upload_into("patch", &mut buffer, 1, &[5.0])
            .expect("in range");
        assert_eq!(&buffer[..], &[1.0, 5.0, 3.0]);
        assert!(device.upload_into("overflow", &mut buffer, 2, &[1.0, 1.0]).is_err());

        let mut host = [0.0f32; 3];
        device.download("read", &buffer, &mut host).expect("download");
        assert_eq!(host, [1.0, 5.0, 3.0]);
        assert!(device.read_scalar("scalar", &buffer, 3).is_err());
    }

    #[test]
    fn test_buffers_release_memory_on_drop() {
        let device = small_device();
        let before = device.allocated_bytes();
        {
            let _a = device.alloc::<f64>(100).expect("alloc");
            assert_eq!(device.allocated_bytes(), before + 800);
        }
        assert_eq!(device.allocated_bytes(), before);
    }
}
