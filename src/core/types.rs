//! Core type definitions for the accelerated SMO solver

use crate::device::DeviceConfig;
use crate::kernel::KernelType;
use serde::{Deserialize, Serialize};

/// Element type of cached kernel columns and objective-difference candidates.
pub type CValue = f32;

/// Element type of the device-resident gradient and alpha vectors.
pub type GradValue = f64;

/// Curvature floor used when the quadratic coefficient is not positive.
pub const TAU: f64 = 1e-12;

/// Prediction result containing label and decision value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Predicted class label (+1 or -1), or the regression estimate
    pub label: f64,
    /// Raw decision function value
    pub decision_value: f64,
}

impl Prediction {
    /// Create a new prediction
    pub fn new(label: f64, decision_value: f64) -> Self {
        Self {
            label,
            decision_value,
        }
    }
}

/// Sparse vector representation with sorted indices
#[derive(Clone, Debug, PartialEq)]
pub struct SparseVector {
    /// Sorted indices of non-zero elements
    pub indices: Vec<usize>,
    /// Values corresponding to indices
    pub values: Vec<f64>,
}

impl SparseVector {
    /// Create a new sparse vector, ensuring indices are sorted
    pub fn new(indices: Vec<usize>, values: Vec<f64>) -> Self {
        assert_eq!(
            indices.len(),
            values.len(),
            "Indices and values must have same length"
        );

        let mut pairs: Vec<_> = indices.into_iter().zip(values).collect();
        pairs.sort_by_key(|&(idx, _)| idx);

        let (indices, values): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Self { indices, values }
    }

    /// Create an empty sparse vector
    pub fn empty() -> Self {
        Self {
            indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Get the value at a specific index (0 if not present)
    pub fn get(&self, index: usize) -> f64 {
        match self.indices.binary_search(&index) {
            Ok(pos) => self.values[pos],
            Err(_) => 0.0,
        }
    }

    /// Sparse dot product
    pub fn dot(&self, other: &SparseVector) -> f64 {
        let (mut a, mut b) = (0, 0);
        let mut sum = 0.0;
        while a < self.indices.len() && b < other.indices.len() {
            match self.indices[a].cmp(&other.indices[b]) {
                std::cmp::Ordering::Equal => {
                    sum += self.values[a] * other.values[b];
                    a += 1;
                    b += 1;
                }
                std::cmp::Ordering::Less => a += 1,
                std::cmp::Ordering::Greater => b += 1,
            }
        }
        sum
    }

    /// Compute squared L2 norm
    pub fn norm_squared(&self) -> f64 {
        self.values.iter().map(|&v| v * v).sum()
    }

    /// Number of non-zero elements
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Check if vector is empty
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Training sample with features and label
#[derive(Clone, Debug)]
pub struct Sample {
    /// Feature vector (sparse representation)
    pub features: SparseVector,
    /// Class label (+1 or -1) for classification, target value for regression
    pub label: f64,
}

impl Sample {
    /// Create a new sample
    pub fn new(features: SparseVector, label: f64) -> Self {
        Self { features, label }
    }
}

/// Bound status of one dual variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlphaStatus {
    #[default]
    LowerBound,
    UpperBound,
    Free,
}

impl AlphaStatus {
    /// Classify `alpha` against its box `[0, c]`
    pub fn from_alpha(alpha: GradValue, c: f64) -> Self {
        if alpha >= c {
            AlphaStatus::UpperBound
        } else if alpha <= 0.0 {
            AlphaStatus::LowerBound
        } else {
            AlphaStatus::Free
        }
    }
}

/// Formulation being solved
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SvmType {
    /// C-support vector classification
    CSvc,
    /// Epsilon-support vector regression with insensitivity `p`
    EpsilonSvr { p: f64 },
}

impl SvmType {
    /// Regression problems double the active size and are symmetric in the two halves
    pub fn is_regression(&self) -> bool {
        matches!(self, SvmType::EpsilonSvr { .. })
    }
}

/// Word width of the run-length bit vector encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WordWidth {
    U8,
    U16,
}

/// How feature vectors are laid out in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureLayout {
    /// Run-length bit vectors for membership plus a values-only array
    BitVector(WordWidth),
    /// Fixed-width bit patterns sized for the largest feature index, plus a
    /// values-only array
    DenseBits,
    /// Explicit (index, value) pairs
    IndexValue,
}

/// Configuration of the solver and the device it runs on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Regularization parameter (upper bound for alpha)
    pub c: f64,
    /// Optional penalty weights for the positive and negative class
    pub class_weights: Option<(f64, f64)>,
    /// Stopping tolerance on the maximal violating pair
    pub epsilon: f64,
    /// Column cache budget in megabytes
    pub cache_size_mb: f64,
    /// Kernel function
    pub kernel: KernelType,
    /// Classification or regression
    pub svm_type: SvmType,
    /// Device feature layout
    pub feature_layout: FeatureLayout,
    /// Elements per host-to-device feature transfer
    pub transfer_chunk_size: usize,
    /// Host-side iteration cap
    pub max_iterations: usize,
    /// Device runtime settings
    pub device: DeviceConfig,
}

impl SolverConfig {
    /// Penalties `(Cp, Cn)` for positive and negative labels
    pub fn penalties(&self) -> (f64, f64) {
        match self.class_weights {
            Some((wp, wn)) => (self.c * wp, self.c * wn),
            None => (self.c, self.c),
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            c: 1.0,
            class_weights: None,
            epsilon: 0.001,
            cache_size_mb: 100.0,
            kernel: KernelType::default(),
            svm_type: SvmType::CSvc,
            feature_layout: FeatureLayout::BitVector(WordWidth::U8),
            transfer_chunk_size: 100_000_000,
            max_iterations: 10_000_000,
            device: DeviceConfig::default(),
        }
    }
}

/// Result of a complete training run
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Dual variables over the active set (2l entries for regression)
    pub alpha: Vec<f64>,
    /// Final gradient over the active set
    pub gradient: Vec<f64>,
    /// Offset of the decision function (decision = Σ coef·K - rho)
    pub rho: f64,
    /// Per-sample expansion coefficients (alpha·y, or alpha⁺ - alpha⁻)
    pub coefficients: Vec<f64>,
    /// Indices of samples with a non-zero coefficient
    pub support_vectors: Vec<usize>,
    /// Number of SMO iterations performed
    pub iterations: usize,
    /// Whether the stopping rule was met before the iteration cap
    pub converged: bool,
    /// Final dual objective value
    pub objective_value: f64,
}
