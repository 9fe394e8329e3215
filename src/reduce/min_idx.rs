//! Minimum-with-index reduction, used to pick the second working-set index

use super::{reduce_pass, Candidate, PingPong, Reducer, NO_INDEX};
use crate::core::{CValue, Result};
use crate::device::{Device, LaunchConfig};

/// A value and the element it came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinCandidate {
    pub value: CValue,
    pub index: usize,
}

impl MinCandidate {
    pub fn new(value: CValue, index: usize) -> Self {
        Self { value, index }
    }

    /// Whether this candidate came from a real element
    pub fn is_valid(&self) -> bool {
        self.index != NO_INDEX
    }
}

impl Default for MinCandidate {
    fn default() -> Self {
        Self {
            value: CValue::INFINITY,
            index: NO_INDEX,
        }
    }
}

impl Candidate for MinCandidate {
    /// Smaller value wins; on equal values the lower index wins
    fn merge(self, other: Self) -> Self {
        if other.value < self.value || (other.value == self.value && other.index < self.index) {
            other
        } else {
            self
        }
    }
}

/// Reducer over a borrowed pair of [`MinCandidate`] buffers
pub struct MinIdxReducer<'a> {
    buffers: &'a mut PingPong<MinCandidate>,
}

impl<'a> MinIdxReducer<'a> {
    pub fn new(buffers: &'a mut PingPong<MinCandidate>) -> Self {
        Self { buffers }
    }
}

impl Reducer for MinIdxReducer<'_> {
    type Output = MinCandidate;

    fn compute_pass(&mut self, device: &Device, launch: LaunchConfig, n: usize) -> Result<()> {
        reduce_pass(device, "min_idx_reduce", self.buffers, launch, n)
    }

    fn swap_buffers(&mut self) {
        self.buffers.swap();
    }

    fn extract_result(&self, device: &Device) -> Result<MinCandidate> {
        device.read_scalar("min_idx_result", self.buffers.primary(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::reduce::cross_block_reduce;

    fn device() -> Device {
        Device::new(&DeviceConfig {
            memory_bytes: 1 << 24,
            threads: Some(4),
            ..DeviceConfig::default()
        })
        .expect("device")
    }

    fn reduce(dev: &Device, values: &[CValue], group_size: usize) -> MinCandidate {
        let mut buffers = PingPong::new(dev, values.len()).expect("buffers");
        buffers.reset();
        for (t, (slot, &v)) in buffers.primary_mut().iter_mut().zip(values).enumerate() {
            *slot = MinCandidate::new(v, t);
        }
        cross_block_reduce(dev, group_size, &mut MinIdxReducer::new(&mut buffers), values.len())
            .expect("reduce")
    }

    #[test]
    fn test_finds_minimum_across_blocks() {
        let dev = device();
        let values: Vec<CValue> = (0..5000).map(|t| ((t * 7919) % 4999) as CValue).collect();
        let expected = values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap().then(a.0.cmp(&b.0)))
            .map(|(t, _)| t)
            .unwrap();
        for group_size in [64, 128, 512] {
            let best = reduce(&dev, &values, group_size);
            assert_eq!(best.index, expected, "group size {group_size}");
            assert_eq!(best.value, values[expected]);
        }
    }

    #[test]
    fn test_ties_go_to_the_lowest_index() {
        let dev = device();
        let mut values = vec![3.0; 1000];
        values[700] = -1.0;
        values[130] = -1.0;
        values[999] = -1.0;
        assert_eq!(reduce(&dev, &values, 64).index, 130);

        let flat = vec![0.5; 777];
        assert_eq!(reduce(&dev, &flat, 64).index, 0);
    }

    #[test]
    fn test_infinite_entries_are_ignored() {
        let dev = device();
        let mut values = vec![CValue::INFINITY; 300];
        values[299] = 10.0;
        let best = reduce(&dev, &values, 64);
        assert_eq!(best.index, 299);
    }

    #[test]
    fn test_no_valid_element() {
        let dev = device();
        let mut buffers = PingPong::<MinCandidate>::new(&dev, 100).expect("buffers");
        buffers.reset();
        let best = cross_block_reduce(&dev, 64, &mut MinIdxReducer::new(&mut buffers), 100)
            .expect("reduce");
        assert!(!best.is_valid());
        assert_eq!(best.value, CValue::INFINITY);
    }

    #[test]
    fn test_merge_identity() {
        let c = MinCandidate::new(1.5, 4);
        assert_eq!(c.merge(MinCandidate::default()), c);
        assert_eq!(MinCandidate::default().merge(c), c);
    }
}
