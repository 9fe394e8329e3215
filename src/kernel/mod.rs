//! Kernel functions for SVM

pub mod linear;
pub mod polynomial;
pub mod rbf;
pub mod sigmoid;
pub mod traits;

pub use self::linear::*;
pub use self::polynomial::*;
pub use self::rbf::*;
pub use self::sigmoid::*;
pub use self::traits::*;

use crate::core::{Result, SVMError};
use serde::{Deserialize, Serialize};

/// Kernel selection carried by the solver configuration and saved models
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelType {
    #[default]
    Linear,
    Polynomial {
        degree: u32,
        gamma: f64,
        coef0: f64,
    },
    Rbf {
        gamma: f64,
    },
    Sigmoid {
        gamma: f64,
        coef0: f64,
    },
}

impl KernelType {
    /// Reject parameters the kernel constructors would panic on
    pub fn validate(&self) -> Result<()> {
        let gamma = match *self {
            KernelType::Linear => return Ok(()),
            KernelType::Polynomial { degree: 0, .. } => {
                return Err(SVMError::InvalidParameter(
                    "polynomial degree must be positive".to_string(),
                ))
            }
            KernelType::Polynomial { gamma, .. }
            | KernelType::Rbf { gamma }
            | KernelType::Sigmoid { gamma, .. } => gamma,
        };
        if gamma > 0.0 && gamma.is_finite() {
            Ok(())
        } else {
            Err(SVMError::InvalidParameter(format!(
                "gamma must be positive, got {gamma}"
            )))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KernelType::Linear => "linear",
            KernelType::Polynomial { .. } => "polynomial",
            KernelType::Rbf { .. } => "rbf",
            KernelType::Sigmoid { .. } => "sigmoid",
        }
    }
}

impl Kernel for KernelType {
    fn evaluate(&self, dot: f64, x_norm_sq: f64, y_norm_sq: f64) -> f64 {
        match *self {
            KernelType::Linear => LinearKernel.evaluate(dot, x_norm_sq, y_norm_sq),
            KernelType::Polynomial {
                degree,
                gamma,
                coef0,
            } => PolynomialKernel {
                gamma,
                coef0,
                degree,
            }
            .evaluate(dot, x_norm_sq, y_norm_sq),
            KernelType::Rbf { gamma } => RBFKernel { gamma }.evaluate(dot, x_norm_sq, y_norm_sq),
            KernelType::Sigmoid { gamma, coef0 } => {
                SigmoidKernel { gamma, coef0 }.evaluate(dot, x_norm_sq, y_norm_sq)
            }
        }
    }

    fn needs_norms(&self) -> bool {
        matches!(self, KernelType::Rbf { .. })
    }

    fn compute(&self, x: &crate::core::SparseVector, y: &crate::core::SparseVector) -> f64 {
        match *self {
            KernelType::Rbf { gamma } => RBFKernel { gamma }.compute(x, y),
            _ => self.evaluate(x.dot(y), 0.0, 0.0),
        }
    }
}
