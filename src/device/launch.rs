//! Launch sizing
//!
//! Maps a problem size to a (work-group count, work-group size) pair. Large
//! groups amortise per-lane overhead, but a pass needs enough groups to keep
//! every compute unit busy, so the group size is halved until at least
//! `MIN_GROUPS` groups exist or the group is down to two warps.

use std::ops::Range;

/// Default maximum lanes per work-group
pub const THREADS_PER_GROUP: usize = 512;

/// Lanes that execute in lock-step
pub const WARP_SIZE: usize = 32;

/// Group count below which the group size is halved
const MIN_GROUPS: usize = 50;

/// Shape of one parallel pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Number of work-groups
    pub groups: usize,
    /// Lanes per work-group
    pub group_size: usize,
}

impl LaunchConfig {
    /// Enough groups of `group_size` lanes to cover `n` elements
    pub fn covering(n: usize, group_size: usize) -> Self {
        let group_size = group_size.max(1);
        Self {
            groups: n.div_ceil(group_size).max(1),
            group_size,
        }
    }

    /// Total lanes launched
    pub fn lanes(&self) -> usize {
        self.groups * self.group_size
    }

    /// Same group size, half the groups (rounded up)
    pub fn halved(&self) -> Self {
        Self {
            groups: self.groups.div_ceil(2).max(1),
            group_size: self.group_size,
        }
    }
}

/// One work-group of a running pass
#[derive(Debug, Clone, Copy)]
pub struct WorkGroup {
    /// Group index within the pass
    pub id: usize,
    /// Lanes per group
    pub size: usize,
}

impl WorkGroup {
    /// Global element range owned by this group, clipped to `n`
    pub fn lane_range(&self, n: usize) -> Range<usize> {
        let start = (self.id * self.size).min(n);
        let end = ((self.id + 1) * self.size).min(n);
        start..end
    }

    /// Whether this group hosts the elected lane (group 0, lane 0)
    pub fn is_first(&self) -> bool {
        self.id == 0
    }
}

/// Pick the launch shape for a pass over `n` elements
pub fn find_launch_parameters(n: usize, max_group_size: usize, warp_size: usize) -> LaunchConfig {
    let mut group_size = max_group_size.max(1);
    while group_size > 2 * warp_size {
        if n / group_size < MIN_GROUPS {
            group_size >>= 1;
        } else {
            break;
        }
    }
    LaunchConfig::covering(n, group_size)
}
