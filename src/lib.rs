//! SMO support vector machine training on a data-parallel device
//!
//! Working-set selection, kernel-column access and gradient updates run as
//! passes on a device (see [`device`]); kernel columns live in an LRU cache
//! in device memory ([`cache`]), per-element candidates are folded by
//! multi-pass reductions ([`reduce`]), and sparse feature membership is
//! stored as run-length bit vectors ([`bitvector`]).

pub mod api;
pub mod bitvector;
pub mod cache;
pub mod core;
pub mod data;
pub mod device;
pub mod kernel;
pub mod optimizer;
pub mod persistence;
pub mod reduce;
pub mod solver;

pub use crate::api::{EvaluationMetrics, ModelInfo, TrainedModel, SVM};
pub use crate::cache::{CacheStats, ColumnCache};
pub use crate::core::traits::*;
pub use crate::core::types::*;
pub use crate::core::{Result, SVMError};
pub use crate::data::{LabelMode, LibSVMDataset};
pub use crate::device::{Device, DeviceConfig};
pub use crate::kernel::{Kernel, KernelType};
pub use crate::optimizer::{SVMOptimizer, TrainedSVM};
pub use crate::solver::{DeviceSolver, Selection};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
