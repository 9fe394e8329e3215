//! Dual-maximum reduction for the first working-set index
//!
//! Carries two independent maxima: `gmax` over the "up" candidates together
//! with the element that produced it, and `gmax2` over the "low" candidates.
//! Their sum is the maximal violation checked against the stopping
//! tolerance.

use super::{reduce_pass, Candidate, PingPong, Reducer, NO_INDEX};
use crate::core::{GradValue, Result};
use crate::device::{Device, LaunchConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GmaxCandidate {
    pub gmax: GradValue,
    pub gmax2: GradValue,
    /// Element owning `gmax`
    pub gmax_idx: usize,
}

impl GmaxCandidate {
    pub fn new(gmax: GradValue, gmax2: GradValue, gmax_idx: usize) -> Self {
        Self {
            gmax,
            gmax2,
            gmax_idx,
        }
    }

    pub fn has_index(&self) -> bool {
        self.gmax_idx != NO_INDEX
    }

    /// Maximal violating-pair gap
    pub fn gap(&self) -> GradValue {
        self.gmax + self.gmax2
    }
}

impl Default for GmaxCandidate {
    fn default() -> Self {
        Self {
            gmax: GradValue::NEG_INFINITY,
            gmax2: GradValue::NEG_INFINITY,
            gmax_idx: NO_INDEX,
        }
    }
}

impl Candidate for GmaxCandidate {
    fn merge(self, other: Self) -> Self {
        let take_other = other.gmax > self.gmax
            || (other.gmax == self.gmax && other.gmax_idx < self.gmax_idx);
        let (gmax, gmax_idx) = if take_other {
            (other.gmax, other.gmax_idx)
        } else {
            (self.gmax, self.gmax_idx)
        };
        Self {
            gmax,
            gmax2: self.gmax2.max(other.gmax2),
            gmax_idx,
        }
    }
}

/// Reducer over a borrowed pair of [`GmaxCandidate`] buffers
pub struct GmaxReducer<'a> {
    buffers: &'a mut PingPong<GmaxCandidate>,
}

impl<'a> GmaxReducer<'a> {
    pub fn new(buffers: &'a mut PingPong<GmaxCandidate>) -> Self {
        Self { buffers }
    }
}

impl Reducer for GmaxReducer<'_> {
    type Output = GmaxCandidate;

    fn compute_pass(&mut self, device: &Device, launch: LaunchConfig, n: usize) -> Result<()> {
        reduce_pass(device, "gmax_reduce", self.buffers, launch, n)
    }

    fn swap_buffers(&mut self) {
        self.buffers.swap();
    }

    fn extract_result(&self, device: &Device) -> Result<GmaxCandidate> {
        device.read_scalar("gmax_result", self.buffers.primary(), 0)
    }
}
