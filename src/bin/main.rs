//! smoaccel command line interface
//!
//! Train, apply and inspect SVM models on LibSVM format data.

use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{error, info};
use smoaccel::api::SVM;
use smoaccel::core::{FeatureLayout, Result, SVMError, SvmType, WordWidth};
use smoaccel::data::LabelMode;
use smoaccel::device::DeviceConfig;
use smoaccel::kernel::KernelType;
use smoaccel::persistence::{SerializableModel, TrainingParams};
use smoaccel::{Dataset, LibSVMDataset};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "smoaccel")]
#[command(about = "SMO support vector machine training on a data-parallel device")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a new model
    Train(TrainArgs),
    /// Predict with a trained model
    Predict(PredictArgs),
    /// Evaluate a model on labelled data
    Evaluate(EvaluateArgs),
    /// Display model information
    Info(InfoArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Training data file (LibSVM format)
    #[arg(long)]
    data: PathBuf,

    /// Output model file
    #[arg(short, long)]
    output: PathBuf,

    /// Problem formulation
    #[arg(long, value_enum, default_value = "c-svc")]
    svm_type: CliSvmType,

    /// Regularization parameter C
    #[arg(short = 'C', long, default_value = "1.0")]
    c: f64,

    /// Multiplier of C for positive labels
    #[arg(long, default_value = "1.0")]
    weight_positive: f64,

    /// Multiplier of C for negative labels
    #[arg(long, default_value = "1.0")]
    weight_negative: f64,

    /// Epsilon-SVR insensitivity
    #[arg(short, long, default_value = "0.1")]
    p: f64,

    /// Stopping tolerance
    #[arg(short, long, default_value = "0.001")]
    epsilon: f64,

    /// Iteration cap
    #[arg(short, long, default_value = "10000000")]
    max_iterations: usize,

    /// Kernel function
    #[arg(short, long, value_enum, default_value = "rbf")]
    kernel: CliKernel,

    /// Kernel gamma (default 1/number of features)
    #[arg(short, long)]
    gamma: Option<f64>,

    /// Polynomial degree
    #[arg(long, default_value = "3")]
    degree: u32,

    /// Polynomial and sigmoid offset
    #[arg(long, default_value = "0.0")]
    coef0: f64,

    /// Column cache size in MB
    #[arg(long, default_value = "100")]
    cache_size: f64,

    /// Device feature layout
    #[arg(long, value_enum, default_value = "bits8")]
    layout: CliLayout,

    /// Device memory budget in MB
    #[arg(long, default_value = "2048")]
    device_memory: usize,

    /// Worker threads backing the device (all cores by default)
    #[arg(long)]
    threads: Option<usize>,

    /// Feature elements per host-to-device transfer
    #[arg(long, default_value = "100000000")]
    transfer_chunk: usize,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliSvmType {
    #[value(name = "c-svc")]
    CSvc,
    #[value(name = "epsilon-svr")]
    EpsilonSvr,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliKernel {
    Linear,
    Polynomial,
    Rbf,
    Sigmoid,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliLayout {
    /// Run-length bit vectors with 8-bit words
    Bits8,
    /// Run-length bit vectors with 16-bit words
    Bits16,
    /// Fixed-width bit patterns, one bit per feature
    #[value(name = "dense-bits")]
    DenseBits,
    /// Explicit index/value pairs
    #[value(name = "index-value")]
    IndexValue,
}

impl From<CliLayout> for FeatureLayout {
    fn from(layout: CliLayout) -> Self {
        match layout {
            CliLayout::Bits8 => FeatureLayout::BitVector(WordWidth::U8),
            CliLayout::Bits16 => FeatureLayout::BitVector(WordWidth::U16),
            CliLayout::DenseBits => FeatureLayout::DenseBits,
            CliLayout::IndexValue => FeatureLayout::IndexValue,
        }
    }
}

#[derive(Args)]
struct PredictArgs {
    /// Trained model file
    #[arg(short, long)]
    model: PathBuf,

    /// Input data file
    #[arg(long)]
    data: PathBuf,

    /// Output file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also print decision values
    #[arg(long)]
    decision_values: bool,
}

#[derive(Args)]
struct EvaluateArgs {
    /// Trained model file
    #[arg(short, long)]
    model: PathBuf,

    /// Test data file
    #[arg(long)]
    data: PathBuf,

    /// Show confusion counts (classification only)
    #[arg(long)]
    detailed: bool,
}

#[derive(Args)]
struct InfoArgs {
    /// Model file
    model: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let result = match cli.command {
        Commands::Train(args) => train_command(args),
        Commands::Predict(args) => predict_command(args),
        Commands::Evaluate(args) => evaluate_command(args),
        Commands::Info(args) => info_command(args),
    };

    if let Err(e) = result {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn train_command(args: TrainArgs) -> Result<()> {
    let svm_type = match args.svm_type {
        CliSvmType::CSvc => SvmType::CSvc,
        CliSvmType::EpsilonSvr => SvmType::EpsilonSvr { p: args.p },
    };
    let mode = if svm_type.is_regression() {
        LabelMode::Real
    } else {
        LabelMode::Binary
    };
    info!("Loading training data from {:?}", args.data);
    let dataset = LibSVMDataset::from_file_with(&args.data, mode)?;
    info!(
        "Loaded {} samples with {} dimensions",
        dataset.len(),
        dataset.dim()
    );
    if dataset.len() < 2 {
        return Err(SVMError::InvalidDataset(
            "training needs at least 2 samples".to_string(),
        ));
    }

    let gamma = args
        .gamma
        .unwrap_or_else(|| 1.0 / dataset.dim().max(1) as f64);
    let kernel = match args.kernel {
        CliKernel::Linear => KernelType::Linear,
        CliKernel::Polynomial => KernelType::Polynomial {
            degree: args.degree,
            gamma,
            coef0: args.coef0,
        },
        CliKernel::Rbf => KernelType::Rbf { gamma },
        CliKernel::Sigmoid => KernelType::Sigmoid {
            gamma,
            coef0: args.coef0,
        },
    };
    info!(
        "Parameters: C={}, epsilon={}, kernel={}, cache={} MB",
        args.c,
        args.epsilon,
        kernel.name(),
        args.cache_size
    );

    let mut svm = SVM::new()
        .with_c(args.c)
        .with_epsilon(args.epsilon)
        .with_max_iterations(args.max_iterations)
        .with_kernel(kernel)
        .with_svm_type(svm_type)
        .with_cache_size_mb(args.cache_size)
        .with_feature_layout(args.layout.into())
        .with_device(DeviceConfig {
            memory_bytes: args.device_memory.saturating_mul(1 << 20),
            threads: args.threads,
            ..DeviceConfig::default()
        });
    if args.weight_positive != 1.0 || args.weight_negative != 1.0 {
        svm = svm.with_class_weights(args.weight_positive, args.weight_negative);
    }
    let mut config = svm.config().clone();
    config.transfer_chunk_size = args.transfer_chunk;
    let params = TrainingParams::from(&config);

    let model = SVM::with_config(config).train(&dataset)?;
    let model_info = model.info();
    info!(
        "Training finished: {} support vectors, rho = {:.6}",
        model_info.n_support_vectors, model_info.rho
    );

    SerializableModel::from_trained_model(&model, params).save_to_file(&args.output)?;
    info!("Model saved to {:?}", args.output);

    let score = model.evaluate(&dataset);
    if svm_type.is_regression() {
        info!("Training mean squared error: {score:.6}");
    } else {
        info!("Training accuracy: {:.2}%", score * 100.0);
    }
    Ok(())
}

fn predict_command(args: PredictArgs) -> Result<()> {
    info!("Loading model from {:?}", args.model);
    let model = SerializableModel::load_from_file(&args.model)?.to_trained_model()?;
    let predictions = model.predict_from_file(&args.data)?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    };
    for prediction in &predictions {
        if args.decision_values {
            writeln!(out, "{} {:.6}", prediction.label, prediction.decision_value)?;
        } else {
            writeln!(out, "{}", prediction.label)?;
        }
    }
    out.flush()?;
    info!("Wrote {} predictions", predictions.len());
    Ok(())
}

fn evaluate_command(args: EvaluateArgs) -> Result<()> {
    let serializable = SerializableModel::load_from_file(&args.model)?;
    let model = serializable.to_trained_model()?;
    let regression = serializable.svm_type.is_regression();
    let mode = if regression {
        LabelMode::Real
    } else {
        LabelMode::Binary
    };
    let dataset = LibSVMDataset::from_file_with(&args.data, mode)?;

    println!("=== Model Evaluation ===");
    serializable.print_summary();
    println!("\nTest Results:");
    let score = model.evaluate(&dataset);
    if regression {
        println!("  Mean squared error: {score:.6}");
    } else {
        println!("  Accuracy: {:.2}%", score * 100.0);
    }

    if args.detailed {
        let metrics = model.evaluate_detailed(&dataset)?;
        println!("\nDetailed Metrics:");
        println!("  True Positives:  {}", metrics.true_positives);
        println!("  True Negatives:  {}", metrics.true_negatives);
        println!("  False Positives: {}", metrics.false_positives);
        println!("  False Negatives: {}", metrics.false_negatives);
        println!("  Precision:       {:.4}", metrics.precision());
        println!("  Recall:          {:.4}", metrics.recall());
        println!("  F1 Score:        {:.4}", metrics.f1_score());
    }
    Ok(())
}

fn info_command(args: InfoArgs) -> Result<()> {
    let serializable = SerializableModel::load_from_file(&args.model)?;
    serializable.print_summary();

    let coefficients = &serializable.coefficients;
    let n_show = coefficients.len().min(10);
    println!("\nCoefficients:");
    for (i, coef) in coefficients.iter().enumerate().take(n_show) {
        println!("  sv{i}: {coef:.6}");
    }
    if coefficients.len() > n_show {
        println!("  ... ({} more)", coefficients.len() - n_show);
    }
    Ok(())
}
