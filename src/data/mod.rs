//! Training data sources
//!
//! LibSVM text files with binary or real-valued labels.

pub mod libsvm;

pub use self::libsvm::{LabelMode, LibSVMDataset};
