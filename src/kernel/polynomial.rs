//! Polynomial Kernel Implementation
//!
//! K(x, y) = (γ * <x, y> + r)^d

use crate::kernel::traits::Kernel;

/// Polynomial kernel with configurable degree, gamma, and coefficient
#[derive(Debug, Clone, Copy)]
pub struct PolynomialKernel {
    /// Scaling factor for the dot product
    pub gamma: f64,
    /// Independent term in the polynomial
    pub coef0: f64,
    /// Degree of the polynomial
    pub degree: u32,
}

impl PolynomialKernel {
    /// Creates a new polynomial kernel
    ///
    /// # Panics
    /// Panics if `degree` is zero or `gamma` is not positive
    pub fn new(degree: u32, gamma: f64, coef0: f64) -> Self {
        assert!(degree > 0, "Polynomial degree must be positive");
        assert!(gamma > 0.0, "Gamma must be positive");

        Self {
            gamma,
            coef0,
            degree,
        }
    }

    /// Creates a quadratic kernel: (γ * <x,y> + 1)²
    pub fn quadratic(gamma: f64) -> Self {
        Self::new(2, gamma, 1.0)
    }
}

impl Kernel for PolynomialKernel {
    fn evaluate(&self, dot: f64, _x_norm_sq: f64, _y_norm_sq: f64) -> f64 {
        (self.gamma * dot + self.coef0).powi(self.degree as i32)
    }
}
