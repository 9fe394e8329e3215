//! Sigmoid (Tanh) Kernel Implementation
//!
//! K(x, y) = tanh(γ * <x, y> + r)
//!
//! The kernel is not positive semi-definite for every parameter choice; the
//! solver's curvature floor keeps the two-variable update well defined when
//! it is not.

use crate::kernel::traits::Kernel;

/// Sigmoid (Hyperbolic Tangent) kernel
#[derive(Debug, Clone, Copy)]
pub struct SigmoidKernel {
    /// Scaling parameter for the dot product (must be positive)
    pub gamma: f64,
    /// Bias/offset parameter
    pub coef0: f64,
}

impl SigmoidKernel {
    /// # Panics
    /// Panics if gamma is not positive
    pub fn new(gamma: f64, coef0: f64) -> Self {
        if gamma <= 0.0 {
            panic!("Gamma must be positive, got: {}", gamma);
        }
        Self { gamma, coef0 }
    }
}

impl Kernel for SigmoidKernel {
    fn evaluate(&self, dot: f64, _x_norm_sq: f64, _y_norm_sq: f64) -> f64 {
        (self.gamma * dot + self.coef0).tanh()
    }
}
