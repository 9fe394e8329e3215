//! High-level API for training and using models
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use smoaccel::api::SVM;
//! use smoaccel::kernel::KernelType;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = SVM::new()
//!     .with_c(1.0)
//!     .with_kernel(KernelType::Rbf { gamma: 0.5 })
//!     .with_cache_size_mb(256.0)
//!     .train_from_file("data.libsvm")?;
//!
//! println!("Accuracy: {:.2}%", model.evaluate_from_file("test.libsvm")? * 100.0);
//! # Ok(())
//! # }
//! ```

use crate::core::{
    Dataset, FeatureLayout, Prediction, Result, SVMError, SVMModel, Sample, SolverConfig,
    SvmType, TrainingResult,
};
use crate::data::{LabelMode, LibSVMDataset};
use crate::device::DeviceConfig;
use crate::kernel::KernelType;
use crate::optimizer::{SVMOptimizer, TrainedSVM};
use std::path::Path;

/// Builder over [`SolverConfig`]
#[derive(Debug, Clone, Default)]
pub struct SVM {
    config: SolverConfig,
}

impl SVM {
    /// Create a builder with default parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn with_config(config: SolverConfig) -> Self {
        Self { config }
    }

    /// Set regularization parameter C
    pub fn with_c(mut self, c: f64) -> Self {
        self.config.c = c;
        self
    }

    /// Scale C for the positive and negative class
    pub fn with_class_weights(mut self, positive: f64, negative: f64) -> Self {
        self.config.class_weights = Some((positive, negative));
        self
    }

    /// Set convergence tolerance
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.config.epsilon = epsilon;
        self
    }

    /// Set kernel type
    pub fn with_kernel(mut self, kernel: KernelType) -> Self {
        self.config.kernel = kernel;
        self
    }

    /// Choose classification or epsilon-SVR
    pub fn with_svm_type(mut self, svm_type: SvmType) -> Self {
        self.config.svm_type = svm_type;
        self
    }

    /// Set column cache budget in megabytes
    pub fn with_cache_size_mb(mut self, cache_size_mb: f64) -> Self {
        self.config.cache_size_mb = cache_size_mb;
        self
    }

    /// Set how feature rows are stored on the device
    pub fn with_feature_layout(mut self, layout: FeatureLayout) -> Self {
        self.config.feature_layout = layout;
        self
    }

    /// Set maximum number of SMO iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Set device memory budget and work-group geometry
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.config.device = device;
        self
    }

    /// Current configuration
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Train on a dataset
    pub fn train<D: Dataset>(self, dataset: &D) -> Result<TrainedModel> {
        let model = SVMOptimizer::new(self.config).train(dataset)?;
        Ok(TrainedModel { model })
    }

    /// Train on samples already in memory
    pub fn train_samples(self, samples: &[Sample]) -> Result<TrainedModel> {
        let model = SVMOptimizer::new(self.config).train_samples(samples)?;
        Ok(TrainedModel { model })
    }

    /// Train from a LibSVM format file; regression keeps the real targets
    pub fn train_from_file<P: AsRef<Path>>(self, path: P) -> Result<TrainedModel> {
        let dataset = LibSVMDataset::from_file_with(path, label_mode(self.config.svm_type))?;
        self.train(&dataset)
    }
}

fn label_mode(svm_type: SvmType) -> LabelMode {
    if svm_type.is_regression() {
        LabelMode::Real
    } else {
        LabelMode::Binary
    }
}

/// Trained model with file-level helpers
#[derive(Debug, Clone)]
pub struct TrainedModel {
    model: TrainedSVM,
}

impl TrainedModel {
    pub(crate) fn from_svm(model: TrainedSVM) -> Self {
        Self { model }
    }

    /// Predict a single sample
    pub fn predict(&self, sample: &Sample) -> Prediction {
        self.model.predict(sample)
    }

    /// Predict multiple samples
    pub fn predict_batch(&self, samples: &[Sample]) -> Vec<Prediction> {
        self.model.predict_batch(samples)
    }

    /// Predict every sample of a dataset
    pub fn predict_dataset<D: Dataset>(&self, dataset: &D) -> Vec<Prediction> {
        self.predict_batch(&dataset.samples())
    }

    /// Predict every row of a LibSVM file
    pub fn predict_from_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<Prediction>> {
        let dataset = LibSVMDataset::from_file_with(path, self.label_mode())?;
        Ok(self.predict_dataset(&dataset))
    }

    /// `Σ coef·K(sv, x) - rho`
    pub fn decision_value(&self, sample: &Sample) -> f64 {
        self.model.decision_function(sample)
    }

    /// Accuracy for classification, mean squared error for regression
    pub fn evaluate<D: Dataset>(&self, dataset: &D) -> f64 {
        let predictions = self.predict_dataset(dataset);
        let labels = dataset.get_labels();
        if labels.is_empty() {
            return 0.0;
        }

        let n = labels.len() as f64;
        if self.model.svm_type().is_regression() {
            predictions
                .iter()
                .zip(&labels)
                .map(|(pred, &actual)| (pred.label - actual).powi(2))
                .sum::<f64>()
                / n
        } else {
            predictions
                .iter()
                .zip(&labels)
                .filter(|(pred, &actual)| pred.label == actual)
                .count() as f64
                / n
        }
    }

    /// Evaluate on a LibSVM file, see [`TrainedModel::evaluate`]
    pub fn evaluate_from_file<P: AsRef<Path>>(&self, path: P) -> Result<f64> {
        let dataset = LibSVMDataset::from_file_with(path, self.label_mode())?;
        Ok(self.evaluate(&dataset))
    }

    /// Confusion counts for a classification model
    pub fn evaluate_detailed<D: Dataset>(&self, dataset: &D) -> Result<EvaluationMetrics> {
        if self.model.svm_type().is_regression() {
            return Err(SVMError::InvalidParameter(
                "confusion counts need a classification model".to_string(),
            ));
        }
        let predictions = self.predict_dataset(dataset);
        let labels = dataset.get_labels();

        let mut metrics = EvaluationMetrics::default();
        for (pred, &actual) in predictions.iter().zip(&labels) {
            match (pred.label > 0.0, actual > 0.0) {
                (true, true) => metrics.true_positives += 1,
                (false, false) => metrics.true_negatives += 1,
                (true, false) => metrics.false_positives += 1,
                (false, true) => metrics.false_negatives += 1,
            }
        }
        Ok(metrics)
    }

    /// Get model information
    pub fn info(&self) -> ModelInfo {
        let result = self.model.training_result();
        ModelInfo {
            kernel: *self.model.kernel(),
            svm_type: self.model.svm_type(),
            n_support_vectors: self.model.n_support_vectors(),
            rho: self.model.rho(),
            iterations: result.map(|r| r.iterations),
            converged: result.map(|r| r.converged),
            objective_value: result.map(|r| r.objective_value),
        }
    }

    /// Solver output, absent for models loaded from disk
    pub fn training_result(&self) -> Option<&TrainingResult> {
        self.model.training_result()
    }

    /// Get the underlying model
    pub fn inner(&self) -> &TrainedSVM {
        &self.model
    }

    fn label_mode(&self) -> LabelMode {
        label_mode(self.model.svm_type())
    }
}

/// Confusion counts of a binary classifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationMetrics {
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl EvaluationMetrics {
    /// Number of evaluated samples
    pub fn total(&self) -> usize {
        self.true_positives + self.true_negatives + self.false_positives + self.false_negatives
    }

    /// (TP + TN) / total
    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    /// TP / (TP + FP)
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// TP / (TP + FN)
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    /// Harmonic mean of precision and recall
    pub fn f1_score(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * (p * r) / (p + r)
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Summary of a trained model
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub kernel: KernelType,
    pub svm_type: SvmType,
    pub n_support_vectors: usize,
    pub rho: f64,
    /// Training details; absent for models loaded from disk
    pub iterations: Option<usize>,
    pub converged: Option<bool>,
    pub objective_value: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SparseVector;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn small_device() -> DeviceConfig {
        DeviceConfig {
            memory_bytes: 1 << 22,
            threads: Some(2),
            ..DeviceConfig::default()
        }
    }

    fn point(x: f64, label: f64) -> Sample {
        Sample::new(SparseVector::new(vec![0], vec![x]), label)
    }

    #[test]
    fn test_builder_sets_config() {
        let svm = SVM::new()
            .with_c(2.0)
            .with_class_weights(1.0, 3.0)
            .with_epsilon(0.01)
            .with_kernel(KernelType::Rbf { gamma: 0.5 })
            .with_cache_size_mb(8.0)
            .with_feature_layout(FeatureLayout::IndexValue)
            .with_max_iterations(5000);

        let config = svm.config();
        assert_eq!(config.c, 2.0);
        assert_eq!(config.penalties(), (2.0, 6.0));
        assert_eq!(config.epsilon, 0.01);
        assert_eq!(config.kernel, KernelType::Rbf { gamma: 0.5 });
        assert_eq!(config.cache_size_mb, 8.0);
        assert_eq!(config.feature_layout, FeatureLayout::IndexValue);
        assert_eq!(config.max_iterations, 5000);
    }

    #[test]
    fn test_train_and_inspect() {
        let samples = vec![point(2.0, 1.0), point(-2.0, -1.0), point(1.5, 1.0), point(-1.5, -1.0)];
        let model = SVM::new()
            .with_device(small_device())
            .train_samples(&samples)
            .expect("train");

        assert_eq!(model.predict(&point(1.0, 1.0)).label, 1.0);
        assert!(model.decision_value(&point(-3.0, -1.0)) < 0.0);

        let info = model.info();
        assert!(info.n_support_vectors > 0);
        assert_eq!(info.converged, Some(true));
        assert_eq!(info.kernel, KernelType::Linear);
    }

    #[test]
    fn test_evaluation_metrics() {
        let metrics = EvaluationMetrics {
            true_positives: 10,
            true_negatives: 5,
            false_positives: 2,
            false_negatives: 3,
        };
        assert_eq!(metrics.total(), 20);
        assert_eq!(metrics.accuracy(), 0.75);
        assert_eq!(metrics.precision(), 10.0 / 12.0);
        assert_eq!(metrics.recall(), 10.0 / 13.0);
        assert!(metrics.f1_score() > 0.0);
        assert_eq!(EvaluationMetrics::default().accuracy(), 0.0);
    }

    #[test]
    fn test_file_round() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "+1 1:2.0").unwrap();
        writeln!(file, "-1 1:-2.0").unwrap();
        writeln!(file, "+1 1:1.5").unwrap();
        writeln!(file, "-1 1:-1.5").unwrap();
        file.flush().unwrap();

        let model = SVM::new()
            .with_device(small_device())
            .train_from_file(file.path())
            .expect("train");
        let accuracy = model.evaluate_from_file(file.path()).expect("evaluate");
        assert_eq!(accuracy, 1.0);
        assert_eq!(model.predict_from_file(file.path()).unwrap().len(), 4);

        let dataset = LibSVMDataset::from_file(file.path()).unwrap();
        let metrics = model.evaluate_detailed(&dataset).expect("metrics");
        assert_eq!(metrics.true_positives, 2);
        assert_eq!(metrics.true_negatives, 2);
    }

    #[test]
    fn test_regression_reads_real_targets() {
        let mut file = NamedTempFile::new().expect("temp file");
        for k in 0..8 {
            writeln!(file, "{} 1:{}", 0.5 * k as f64 + 1.0, k).unwrap();
        }
        file.flush().unwrap();

        let model = SVM::new()
            .with_c(50.0)
            .with_svm_type(SvmType::EpsilonSvr { p: 0.01 })
            .with_device(small_device())
            .train_from_file(file.path())
            .expect("train");
        let mse = model.evaluate_from_file(file.path()).expect("evaluate");
        assert!(mse < 1e-3, "mse {mse}");
        let dataset = LibSVMDataset::from_file_with(file.path(), LabelMode::Real).unwrap();
        assert!(model.evaluate_detailed(&dataset).is_err());
    }
}
