//! Host training loop
//!
//! [`SVMOptimizer`] moves a dataset to the device, drives the
//! [`DeviceSolver`] until the working-set search converges or the iteration
//! cap is reached, and turns the final device vectors into a [`TrainedSVM`].

use crate::core::{
    AlphaStatus, Dataset, Prediction, Result, SVMError, SVMModel, Sample, SolverConfig, SvmType,
    TrainingResult,
};
use crate::device::Device;
use crate::kernel::{Kernel, KernelType};
use crate::solver::{
    calculate_rho, load_problem_parameters, objective_value, DeviceSolver, Selection, SolverInit,
};
use log::{debug, info, warn};

/// Iterations between progress messages
const PROGRESS_INTERVAL: usize = 1000;

/// Trains models on the device described by its configuration
#[derive(Debug, Clone)]
pub struct SVMOptimizer {
    config: SolverConfig,
}

impl SVMOptimizer {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Train on every sample of `dataset`
    pub fn train<D: Dataset>(&self, dataset: &D) -> Result<TrainedSVM> {
        self.train_samples(&dataset.samples())
    }

    /// Train on a slice of samples
    pub fn train_samples(&self, samples: &[Sample]) -> Result<TrainedSVM> {
        let config = &self.config;
        validate_config(config)?;
        if samples.is_empty() {
            return Err(SVMError::EmptyDataset);
        }
        let l = samples.len();

        let (y, p) = match config.svm_type {
            SvmType::CSvc => {
                let mut y = Vec::with_capacity(l);
                for sample in samples {
                    y.push(class_label(sample.label)?);
                }
                (y, vec![-1.0; l])
            }
            SvmType::EpsilonSvr { p } => {
                let mut y = vec![1i8; l];
                y.resize(2 * l, -1);
                let mut linear = Vec::with_capacity(2 * l);
                linear.extend(samples.iter().map(|s| p - s.label));
                linear.extend(samples.iter().map(|s| p + s.label));
                (y, linear)
            }
        };
        let active_size = y.len();
        let (cp, cn) = match config.svm_type {
            SvmType::CSvc => config.penalties(),
            SvmType::EpsilonSvr { .. } => (config.c, config.c),
        };

        let device = Device::new(&config.device)?;
        let problem = load_problem_parameters(&device, samples, config)?;
        let mut solver = DeviceSolver::new(device, problem, config);
        solver.setup_solver(SolverInit {
            y: &y,
            gradient: &p,
            alpha: &vec![0.0; active_size],
            alpha_status: &vec![AlphaStatus::LowerBound; active_size],
            cp,
            cn,
            active_size,
        })?;

        let mut iterations = 0;
        let mut converged = false;
        while iterations < config.max_iterations {
            match solver.select_working_set(active_size)? {
                Selection::Converged => {
                    converged = true;
                    break;
                }
                Selection::Selected { .. } => {
                    solver.compute_alpha()?;
                    solver.update_alpha_status()?;
                    solver.update_gradient(active_size)?;
                }
            }
            iterations += 1;
            if iterations % PROGRESS_INTERVAL == 0 {
                debug!("{iterations} iterations");
            }
        }
        if !converged {
            warn!(
                "reached the iteration cap of {} before convergence",
                config.max_iterations
            );
        }

        let mut gradient = vec![0.0; active_size];
        let mut alpha = vec![0.0; active_size];
        let mut status = vec![AlphaStatus::LowerBound; active_size];
        solver.fetch_vectors(&mut gradient, &mut alpha, &mut status, active_size)?;

        let rho = calculate_rho(&y, &gradient, &status);
        let objective = objective_value(&alpha, &gradient, &p);
        let coefficients: Vec<f64> = match config.svm_type {
            SvmType::CSvc => alpha
                .iter()
                .zip(&y)
                .map(|(&a, &y_t)| a * f64::from(y_t))
                .collect(),
            SvmType::EpsilonSvr { .. } => (0..l).map(|k| alpha[k] - alpha[k + l]).collect(),
        };
        let support_vectors: Vec<usize> = coefficients
            .iter()
            .enumerate()
            .filter(|(_, coef)| **coef != 0.0)
            .map(|(k, _)| k)
            .collect();

        info!(
            "optimization finished, #iter = {iterations}, obj = {objective:.6}, rho = {rho:.6}, nSV = {}",
            support_vectors.len()
        );

        let result = TrainingResult {
            alpha,
            gradient,
            rho,
            coefficients,
            support_vectors,
            iterations,
            converged,
            objective_value: objective,
        };
        Ok(TrainedSVM::new(config.kernel, config.svm_type, samples, result))
    }
}

fn validate_config(config: &SolverConfig) -> Result<()> {
    if !(config.c > 0.0 && config.c.is_finite()) {
        return Err(SVMError::InvalidParameter(format!(
            "C must be positive, got {}",
            config.c
        )));
    }
    if let Some((wp, wn)) = config.class_weights {
        if !(wp > 0.0 && wn > 0.0) {
            return Err(SVMError::InvalidParameter(format!(
                "class weights must be positive, got ({wp}, {wn})"
            )));
        }
    }
    if !(config.epsilon > 0.0) {
        return Err(SVMError::InvalidParameter(format!(
            "epsilon must be positive, got {}",
            config.epsilon
        )));
    }
    if !(config.cache_size_mb > 0.0) {
        return Err(SVMError::InvalidParameter(format!(
            "cache size must be positive, got {} MB",
            config.cache_size_mb
        )));
    }
    if let SvmType::EpsilonSvr { p } = config.svm_type {
        if !(p >= 0.0) {
            return Err(SVMError::InvalidParameter(format!(
                "epsilon-SVR insensitivity must be non-negative, got {p}"
            )));
        }
    }
    config.kernel.validate()
}

fn class_label(label: f64) -> Result<i8> {
    if label == 1.0 {
        Ok(1)
    } else if label == -1.0 {
        Ok(-1)
    } else {
        Err(SVMError::InvalidLabel(label))
    }
}

/// A trained model: support vectors, their coefficients and the offset
#[derive(Debug, Clone)]
pub struct TrainedSVM {
    kernel: KernelType,
    svm_type: SvmType,
    support_vectors: Vec<Sample>,
    coefficients: Vec<f64>,
    support_indices: Vec<usize>,
    rho: f64,
    result: Option<TrainingResult>,
}

impl TrainedSVM {
    pub(crate) fn new(
        kernel: KernelType,
        svm_type: SvmType,
        training_samples: &[Sample],
        result: TrainingResult,
    ) -> Self {
        let support_vectors = result
            .support_vectors
            .iter()
            .map(|&k| training_samples[k].clone())
            .collect();
        let coefficients = result
            .support_vectors
            .iter()
            .map(|&k| result.coefficients[k])
            .collect();

        Self {
            kernel,
            svm_type,
            support_vectors,
            coefficients,
            support_indices: result.support_vectors.clone(),
            rho: result.rho,
            result: Some(result),
        }
    }

    /// Rebuild a model from stored parts; no training record is kept
    pub(crate) fn from_parts(
        kernel: KernelType,
        svm_type: SvmType,
        support_vectors: Vec<Sample>,
        coefficients: Vec<f64>,
        rho: f64,
    ) -> Result<Self> {
        if support_vectors.len() != coefficients.len() {
            return Err(SVMError::DimensionMismatch {
                expected: support_vectors.len(),
                actual: coefficients.len(),
            });
        }
        kernel.validate()?;
        Ok(Self {
            kernel,
            svm_type,
            support_indices: (0..support_vectors.len()).collect(),
            support_vectors,
            coefficients,
            rho,
            result: None,
        })
    }

    /// `Σ coef_k K(x_k, x) - rho`
    pub fn decision_function(&self, sample: &Sample) -> f64 {
        self.support_vectors
            .iter()
            .zip(&self.coefficients)
            .map(|(sv, &coef)| coef * self.kernel.compute(&sv.features, &sample.features))
            .sum::<f64>()
            - self.rho
    }

    pub fn kernel(&self) -> &KernelType {
        &self.kernel
    }

    pub fn svm_type(&self) -> SvmType {
        self.svm_type
    }

    pub fn support_vectors(&self) -> &[Sample] {
        &self.support_vectors
    }

    /// Expansion coefficient of each support vector
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Indices of the support vectors in the training set
    pub fn support_vector_indices(&self) -> &[usize] {
        &self.support_indices
    }

    /// Solver output of the run that produced this model
    pub fn training_result(&self) -> Option<&TrainingResult> {
        self.result.as_ref()
    }
}

impl SVMModel for TrainedSVM {
    fn predict(&self, sample: &Sample) -> Prediction {
        let decision_value = self.decision_function(sample);
        let label = match self.svm_type {
            SvmType::CSvc => {
                if decision_value > 0.0 {
                    1.0
                } else {
                    -1.0
                }
            }
            SvmType::EpsilonSvr { .. } => decision_value,
        };
        Prediction::new(label, decision_value)
    }

    fn n_support_vectors(&self) -> usize {
        self.support_vectors.len()
    }

    fn rho(&self) -> f64 {
        self.rho
    }
}
