//! Integration tests for the command line interface

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::{NamedTempFile, TempDir};

struct TestDataFiles {
    train: NamedTempFile,
    test: NamedTempFile,
    regression: NamedTempFile,
}

impl TestDataFiles {
    fn new() -> std::io::Result<Self> {
        let mut train = NamedTempFile::new()?;
        writeln!(train, "+1 1:2.0 2:1.0")?;
        writeln!(train, "-1 1:-2.0 2:-1.0")?;
        writeln!(train, "+1 1:1.5 2:0.8")?;
        writeln!(train, "-1 1:-1.5 2:-0.8")?;
        writeln!(train, "+1 1:1.8 2:0.9")?;
        writeln!(train, "-1 1:-1.8 2:-0.9")?;
        train.flush()?;

        let mut test = NamedTempFile::new()?;
        writeln!(test, "+1 1:1.6 2:0.7")?;
        writeln!(test, "-1 1:-1.6 2:-0.7")?;
        test.flush()?;

        let mut regression = NamedTempFile::new()?;
        for k in 0..10 {
            let x = k as f64 * 0.5;
            writeln!(regression, "{} 1:{}", 2.0 * x - 1.0, x)?;
        }
        regression.flush()?;

        Ok(Self {
            train,
            test,
            regression,
        })
    }
}

fn smoaccel(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_smoaccel"))
        .args(args)
        .output()
        .expect("run smoaccel")
}

fn path(p: &Path) -> &str {
    p.to_str().expect("utf-8 path")
}

fn train_model(data: &Path, model: &Path, extra: &[&str]) {
    let mut args = vec![
        "train",
        "--data",
        path(data),
        "--output",
        path(model),
        "--device-memory",
        "16",
        "--threads",
        "2",
    ];
    args.extend_from_slice(extra);
    let output = smoaccel(&args);
    assert!(
        output.status.success(),
        "train failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(model.exists());
}

#[test]
fn test_train_writes_model() {
    let data = TestDataFiles::new().expect("test data");
    let dir = TempDir::new().expect("temp dir");
    let model = dir.path().join("model.json");
    train_model(data.train.path(), &model, &["--kernel", "linear", "-C", "2.0"]);

    let json = std::fs::read_to_string(&model).expect("read model");
    let value: serde_json::Value = serde_json::from_str(&json).expect("json");
    assert_eq!(value["kernel"]["type"], "linear");
    assert_eq!(value["metadata"]["training_params"]["c"], 2.0);
    assert_eq!(value["metadata"]["converged"], true);
}

#[test]
fn test_every_layout_and_kernel_trains() {
    let data = TestDataFiles::new().expect("test data");
    let dir = TempDir::new().expect("temp dir");
    for (i, (layout, kernel)) in [
        ("bits8", "rbf"),
        ("bits16", "polynomial"),
        ("dense-bits", "linear"),
        ("index-value", "sigmoid"),
    ]
    .into_iter()
    .enumerate()
    {
        let model = dir.path().join(format!("model{i}.json"));
        train_model(
            data.train.path(),
            &model,
            &["--layout", layout, "--kernel", kernel, "--cache-size", "1"],
        );
    }
}

#[test]
fn test_predict_to_stdout_and_file() {
    let data = TestDataFiles::new().expect("test data");
    let dir = TempDir::new().expect("temp dir");
    let model = dir.path().join("model.json");
    train_model(data.train.path(), &model, &["--kernel", "linear"]);

    let output = smoaccel(&["predict", "--model", path(&model), "--data", path(data.test.path())]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let labels: Vec<&str> = stdout.lines().collect();
    assert_eq!(labels, vec!["1", "-1"]);

    let predictions = dir.path().join("predictions.txt");
    let output = smoaccel(&[
        "predict",
        "--model",
        path(&model),
        "--data",
        path(data.test.path()),
        "--output",
        path(&predictions),
        "--decision-values",
    ]);
    assert!(output.status.success());
    let written = std::fs::read_to_string(&predictions).expect("predictions");
    let first: Vec<&str> = written.lines().next().expect("line").split(' ').collect();
    assert_eq!(first[0], "1");
    assert!(first[1].parse::<f64>().expect("decision value") > 0.0);
}

#[test]
fn test_evaluate_detailed() {
    let data = TestDataFiles::new().expect("test data");
    let dir = TempDir::new().expect("temp dir");
    let model = dir.path().join("model.json");
    train_model(data.train.path(), &model, &[]);

    let output = smoaccel(&[
        "evaluate",
        "--model",
        path(&model),
        "--data",
        path(data.test.path()),
        "--detailed",
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Accuracy: 100.00%"));
    assert!(stdout.contains("True Positives:  1"));
}

#[test]
fn test_regression_train_and_evaluate() {
    let data = TestDataFiles::new().expect("test data");
    let dir = TempDir::new().expect("temp dir");
    let model = dir.path().join("svr.json");
    train_model(
        data.regression.path(),
        &model,
        &["--svm-type", "epsilon-svr", "--kernel", "linear", "-C", "100", "-p", "0.01"],
    );

    let output = smoaccel(&[
        "evaluate",
        "--model",
        path(&model),
        "--data",
        path(data.regression.path()),
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Mean squared error"));
    assert!(stdout.contains("epsilon_svr"));
}

#[test]
fn test_info_command() {
    let data = TestDataFiles::new().expect("test data");
    let dir = TempDir::new().expect("temp dir");
    let model = dir.path().join("model.json");
    train_model(data.train.path(), &model, &["--kernel", "rbf", "--gamma", "0.25"]);

    let output = smoaccel(&["info", path(&model)]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("SVM Model Summary"));
    assert!(stdout.contains("rbf (gamma = 0.25)"));
    assert!(stdout.contains("Coefficients:"));
}

#[test]
fn test_errors_exit_with_status_one() {
    let data = TestDataFiles::new().expect("test data");
    let dir = TempDir::new().expect("temp dir");

    let output = smoaccel(&[
        "train",
        "--data",
        "/non/existent/file.libsvm",
        "--output",
        path(&dir.path().join("never.json")),
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error"));

    let output = smoaccel(&[
        "train",
        "--data",
        path(data.train.path()),
        "--output",
        path(&dir.path().join("tiny.json")),
        "--device-memory",
        "0",
    ]);
    assert_eq!(output.status.code(), Some(1));

    let output = smoaccel(&["info", path(data.train.path())]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_help_lists_commands() {
    let output = smoaccel(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["train", "predict", "evaluate", "info"] {
        assert!(stdout.contains(command), "missing {command}");
    }
}
