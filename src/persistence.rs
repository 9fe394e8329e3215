//! Model persistence as JSON

use crate::api::TrainedModel;
use crate::core::{Result, SVMError, Sample, SolverConfig, SparseVector, SvmType};
use crate::kernel::KernelType;
use crate::optimizer::TrainedSVM;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// On-disk form of a trained model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableModel {
    pub kernel: KernelType,
    pub svm_type: SvmType,
    pub support_vectors: Vec<SerializableSample>,
    /// Expansion coefficient per support vector
    pub coefficients: Vec<f64>,
    pub rho: f64,
    pub metadata: ModelMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableSample {
    pub indices: Vec<usize>,
    pub values: Vec<f64>,
    pub label: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub library_version: String,
    pub n_support_vectors: usize,
    pub training_params: TrainingParams,
    /// RFC 3339 creation time
    pub created_at: String,
    pub iterations: Option<usize>,
    pub converged: Option<bool>,
    pub objective_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    pub c: f64,
    pub epsilon: f64,
    pub cache_size_mb: f64,
    pub max_iterations: usize,
}

impl From<&SolverConfig> for TrainingParams {
    fn from(config: &SolverConfig) -> Self {
        Self {
            c: config.c,
            epsilon: config.epsilon,
            cache_size_mb: config.cache_size_mb,
            max_iterations: config.max_iterations,
        }
    }
}

impl From<&Sample> for SerializableSample {
    fn from(sample: &Sample) -> Self {
        Self {
            indices: sample.features.indices.clone(),
            values: sample.features.values.clone(),
            label: sample.label,
        }
    }
}

impl TryFrom<&SerializableSample> for Sample {
    type Error = SVMError;

    fn try_from(s: &SerializableSample) -> Result<Self> {
        if s.indices.len() != s.values.len() {
            return Err(SVMError::DimensionMismatch {
                expected: s.indices.len(),
                actual: s.values.len(),
            });
        }
        Ok(Sample::new(
            SparseVector::new(s.indices.clone(), s.values.clone()),
            s.label,
        ))
    }
}

impl SerializableModel {
    /// Capture `model` together with the parameters it was trained with
    pub fn from_trained_model(model: &TrainedModel, params: TrainingParams) -> Self {
        let info = model.info();
        let inner = model.inner();

        Self {
            kernel: info.kernel,
            svm_type: info.svm_type,
            support_vectors: inner
                .support_vectors()
                .iter()
                .map(SerializableSample::from)
                .collect(),
            coefficients: inner.coefficients().to_vec(),
            rho: info.rho,
            metadata: ModelMetadata {
                library_version: env!("CARGO_PKG_VERSION").to_string(),
                n_support_vectors: info.n_support_vectors,
                training_params: params,
                created_at: chrono::Utc::now().to_rfc3339(),
                iterations: info.iterations,
                converged: info.converged,
                objective_value: info.objective_value,
            },
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| SVMError::SerializationError(e.to_string()))
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        serde_json::from_reader(reader).map_err(|e| SVMError::SerializationError(e.to_string()))
    }

    /// Rebuild a model that predicts exactly like the saved one
    pub fn to_trained_model(&self) -> Result<TrainedModel> {
        let support_vectors = self
            .support_vectors
            .iter()
            .map(Sample::try_from)
            .collect::<Result<Vec<_>>>()?;
        let svm = TrainedSVM::from_parts(
            self.kernel,
            self.svm_type,
            support_vectors,
            self.coefficients.clone(),
            self.rho,
        )?;
        Ok(TrainedModel::from_svm(svm))
    }

    pub fn print_summary(&self) {
        let params = &self.metadata.training_params;
        println!("=== SVM Model Summary ===");
        println!("Type: {}", svm_type_name(self.svm_type));
        println!("Kernel: {}", describe_kernel(&self.kernel));
        println!("Support Vectors: {}", self.metadata.n_support_vectors);
        println!("Rho: {:.6}", self.rho);
        if let Some(iterations) = self.metadata.iterations {
            println!("Iterations: {iterations}");
        }
        if let Some(converged) = self.metadata.converged {
            println!("Converged: {converged}");
        }
        if let Some(objective) = self.metadata.objective_value {
            println!("Objective: {objective:.6}");
        }
        println!("Library Version: {}", self.metadata.library_version);
        println!("Created: {}", self.metadata.created_at);
        println!("Training Parameters:");
        println!("  C: {}", params.c);
        println!("  Epsilon: {}", params.epsilon);
        println!("  Cache: {} MB", params.cache_size_mb);
        println!("  Max Iterations: {}", params.max_iterations);
    }
}

fn svm_type_name(svm_type: SvmType) -> String {
    match svm_type {
        SvmType::CSvc => "c_svc".to_string(),
        SvmType::EpsilonSvr { p } => format!("epsilon_svr (p = {p})"),
    }
}

fn describe_kernel(kernel: &KernelType) -> String {
    match *kernel {
        KernelType::Linear => "linear".to_string(),
        KernelType::Polynomial {
            degree,
            gamma,
            coef0,
        } => format!("polynomial (degree = {degree}, gamma = {gamma}, coef0 = {coef0})"),
        KernelType::Rbf { gamma } => format!("rbf (gamma = {gamma})"),
        KernelType::Sigmoid { gamma, coef0 } => {
            format!("sigmoid (gamma = {gamma}, coef0 = {coef0})")
        }
    }
}
