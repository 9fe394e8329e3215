//! Kernel trait definition

use crate::core::SparseVector;

/// Kernel function trait
///
/// Device passes only see the inner product of two rows and, for kernels
/// that need them, the rows' squared norms, so every kernel is expressed
/// through [`Kernel::evaluate`].
pub trait Kernel: Send + Sync {
    /// K(x, y) from <x, y>, ||x||² and ||y||²
    fn evaluate(&self, dot: f64, x_norm_sq: f64, y_norm_sq: f64) -> f64;

    /// Whether `evaluate` reads the squared norms
    fn needs_norms(&self) -> bool {
        false
    }

    /// Compute kernel value K(x, y) on host vectors
    fn compute(&self, x: &SparseVector, y: &SparseVector) -> f64 {
        let (x_norm_sq, y_norm_sq) = if self.needs_norms() {
            (x.norm_squared(), y.norm_squared())
        } else {
            (0.0, 0.0)
        };
        self.evaluate(x.dot(y), x_norm_sq, y_norm_sq)
    }
}
