//! Cross-block parallel reduction
//!
//! A pass over `n` candidates launches `ceil(n / group_size)` work-groups;
//! each group folds its slice of the input buffer into one candidate of the
//! output buffer. Buffers are then swapped and the next pass reduces the
//! group results, until a single candidate is left.
//!
//! Reducers differ only in the candidate they carry and how two candidates
//! merge, see [`min_idx`] and [`gmax`].

pub mod gmax;
pub mod min_idx;

pub use self::gmax::{GmaxCandidate, GmaxReducer};
pub use self::min_idx::{MinCandidate, MinIdxReducer};

use crate::core::Result;
use crate::device::{Device, DeviceBuffer, LaunchConfig};
use log::trace;

/// Index carried by a candidate that saw no valid element
pub const NO_INDEX: usize = usize::MAX;

/// A reduction candidate
///
/// `Default` is the identity of `merge`.
pub trait Candidate: Copy + Default + Send + Sync {
    /// Combine two candidates; must be associative and commutative
    fn merge(self, other: Self) -> Self;
}

/// A multi-pass reduction driven by [`cross_block_reduce`]
pub trait Reducer {
    type Output;

    /// Reduce the first `n` input candidates into `launch.groups` outputs
    fn compute_pass(&mut self, device: &Device, launch: LaunchConfig, n: usize) -> Result<()>;

    /// Make the last pass's output the next pass's input
    fn swap_buffers(&mut self);

    /// Read the final candidate back to the host
    fn extract_result(&self, device: &Device) -> Result<Self::Output>;
}

/// Run passes of `group_size` lanes until one candidate remains
pub fn cross_block_reduce<R: Reducer>(
    device: &Device,
    group_size: usize,
    reducer: &mut R,
    n: usize,
) -> Result<R::Output> {
    let mut remaining = n;
    let mut passes = 0;
    loop {
        let launch = LaunchConfig::covering(remaining, group_size);
        reducer.compute_pass(device, launch, remaining)?;
        reducer.swap_buffers();
        passes += 1;
        remaining = launch.groups;
        if remaining <= 1 {
            break;
        }
    }
    trace!("reduced {n} candidates in {passes} passes");
    reducer.extract_result(device)
}

/// Two candidate buffers used alternately as input and output
#[derive(Debug)]
pub struct PingPong<T> {
    front: DeviceBuffer<T>,
    back: DeviceBuffer<T>,
}

impl<T: Copy + Default> PingPong<T> {
    /// Allocate both buffers with room for `len` candidates
    pub fn new(device: &Device, len: usize) -> Result<Self> {
        let len = len.max(1);
        Ok(Self {
            front: device.alloc(len)?,
            back: device.alloc(len)?,
        })
    }

    pub fn len(&self) -> usize {
        self.front.len()
    }

    pub fn is_empty(&self) -> bool {
        self.front.is_empty()
    }

    /// Reset both buffers to the empty candidate
    pub fn reset(&mut self) {
        self.front.fill(T::default());
        self.back.fill(T::default());
    }

    /// (input, output) of the next pass
    pub fn split(&mut self) -> (&[T], &mut [T]) {
        (&self.front, &mut self.back)
    }

    pub fn swap(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
    }

    /// Input of the next pass; prep passes write their candidates here
    pub fn primary(&self) -> &[T] {
        &self.front
    }

    pub fn primary_mut(&mut self) -> &mut [T] {
        &mut self.front
    }
}

/// One reduction pass over `buffers` labelled `operation`
pub(crate) fn reduce_pass<C: Candidate>(
    device: &Device,
    operation: &'static str,
    buffers: &mut PingPong<C>,
    launch: LaunchConfig,
    n: usize,
) -> Result<()> {
    let (input, output) = buffers.split();
    let groups = launch.groups.min(output.len());
    device.dispatch(operation, launch, &mut output[..groups], 1, |group, out| {
        let best = input[group.lane_range(n)]
            .iter()
            .fold(C::default(), |acc, &candidate| acc.merge(candidate));
        out[0] = best;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Sum(u64);

    impl Candidate for Sum {
        fn merge(self, other: Self) -> Self {
            Sum(self.0 + other.0)
        }
    }

    struct SumReducer<'a> {
        buffers: &'a mut PingPong<Sum>,
    }

    impl Reducer for SumReducer<'_> {
        type Output = u64;

        fn compute_pass(&mut self, device: &Device, launch: LaunchConfig, n: usize) -> Result<()> {
            reduce_pass(device, "sum_reduce", self.buffers, launch, n)
        }

        fn swap_buffers(&mut self) {
            self.buffers.swap();
        }

        fn extract_result(&self, device: &Device) -> Result<u64> {
            device
                .read_scalar("sum_result", self.buffers.primary(), 0)
                .map(|s| s.0)
        }
    }

    fn device() -> Device {
        Device::new(&DeviceConfig {
            memory_bytes: 1 << 24,
            threads: Some(2),
            ..DeviceConfig::default()
        })
        .expect("device")
    }

    #[test]
    fn test_passes_shrink_by_group_size() {
        let dev = device();
        let n = 10_000;
        let mut buffers = PingPong::<Sum>::new(&dev, n).expect("buffers");
        for (t, slot) in buffers.primary_mut().iter_mut().enumerate() {
            *slot = Sum(t as u64);
        }
        let total = cross_block_reduce(&dev, 64, &mut SumReducer { buffers: &mut buffers }, n)
            .expect("reduce");
        assert_eq!(total, (n as u64 - 1) * n as u64 / 2);
        // 10000 -> 157 -> 3 -> 1
        assert_eq!(dev.pass_count("sum_reduce"), 3);
    }

    #[test]
    fn test_single_and_empty_inputs() {
        let dev = device();
        let mut buffers = PingPong::<Sum>::new(&dev, 4).expect("buffers");
        buffers.primary_mut()[0] = Sum(42);
        let one = cross_block_reduce(&dev, 64, &mut SumReducer { buffers: &mut buffers }, 1)
            .expect("reduce");
        assert_eq!(one, 42);

        buffers.reset();
        let none = cross_block_reduce(&dev, 64, &mut SumReducer { buffers: &mut buffers }, 0)
            .expect("reduce");
        assert_eq!(none, 0);
    }

    #[test]
    fn test_ping_pong_swap() {
        let dev = device();
        let mut buffers = PingPong::<Sum>::new(&dev, 2).expect("buffers");
        {
            let (input, output) = buffers.split();
            assert_eq!(input.len(), output.len());
            output[0] = Sum(7);
        }
        buffers.swap();
        assert_eq!(buffers.primary()[0], Sum(7));
        buffers.reset();
        assert_eq!(buffers.primary()[0], Sum(0));
    }
}
