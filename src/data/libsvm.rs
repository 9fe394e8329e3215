//! LibSVM format datasets
//!
//! One sample per line:
//!
//! ```text
//! <label> <index>:<value> <index>:<value> ...
//! ```
//!
//! Indices are 1-based in the file and 0-based in memory. Blank lines and
//! lines starting with `#` are skipped.

use crate::core::{Dataset, Result, SVMError, Sample, SparseVector};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// How the leading label of each line is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelMode {
    /// Map to `+1` (positive) or `-1` (zero or negative)
    #[default]
    Binary,
    /// Keep the value, for regression targets
    Real,
}

/// Dataset read from a LibSVM format file
#[derive(Debug, Clone)]
pub struct LibSVMDataset {
    samples: Vec<Sample>,
    dimensions: usize,
}

impl LibSVMDataset {
    /// Load a classification dataset
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_with(path, LabelMode::Binary)
    }

    /// Load a dataset, reading labels as `mode` says
    pub fn from_file_with<P: AsRef<Path>>(path: P, mode: LabelMode) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader_with(BufReader::new(file), mode)
    }

    /// Parse a classification dataset from any buffered reader
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        Self::from_reader_with(reader, LabelMode::Binary)
    }

    /// Parse from a buffered reader; blank lines and `#` comments are skipped
    pub fn from_reader_with<R: BufRead>(reader: R, mode: LabelMode) -> Result<Self> {
        let mut samples = Vec::new();
        let mut dimensions = 0;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let sample = parse_line(line, mode).map_err(|e| {
                SVMError::ParseError(format!("line {}: {}", line_num + 1, e))
            })?;
            if let Some(&last) = sample.features.indices.last() {
                dimensions = dimensions.max(last + 1);
            }
            samples.push(sample);
        }

        if samples.is_empty() {
            return Err(SVMError::EmptyDataset);
        }
        Ok(Self {
            samples,
            dimensions,
        })
    }

    /// Build a dataset from samples already in memory
    pub fn from_samples(samples: Vec<Sample>) -> Result<Self> {
        if samples.is_empty() {
            return Err(SVMError::EmptyDataset);
        }
        let dimensions = samples
            .iter()
            .filter_map(|s| s.features.indices.last())
            .map(|&idx| idx + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            samples,
            dimensions,
        })
    }

    /// Write the samples back out in LibSVM format
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for sample in &self.samples {
            write!(writer, "{}", sample.label)?;
            for (idx, value) in sample.features.indices.iter().zip(&sample.features.values) {
                write!(writer, " {}:{}", idx + 1, value)?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    /// Borrow the samples in file order
    pub fn as_samples(&self) -> &[Sample] {
        &self.samples
    }
}

fn parse_line(line: &str, mode: LabelMode) -> std::result::Result<Sample, String> {
    let mut tokens = line.split_whitespace();
    let label_str = tokens.next().ok_or("missing label")?;
    let label: f64 = label_str
        .parse()
        .map_err(|_| format!("invalid label '{label_str}'"))?;
    if !label.is_finite() {
        return Err(format!("invalid label '{label_str}'"));
    }
    let label = match mode {
        LabelMode::Binary if label > 0.0 => 1.0,
        LabelMode::Binary => -1.0,
        LabelMode::Real => label,
    };

    let mut indices = Vec::new();
    let mut values = Vec::new();
    for token in tokens {
        let (idx_str, value_str) = token
            .split_once(':')
            .ok_or_else(|| format!("invalid feature '{token}'"))?;
        let index: usize = idx_str
            .parse()
            .map_err(|_| format!("invalid feature index '{idx_str}'"))?;
        if index == 0 {
            return Err("feature indices start at 1".to_string());
        }
        let value: f64 = value_str
            .parse()
            .map_err(|_| format!("invalid feature value '{value_str}'"))?;
        indices.push(index - 1);
        values.push(value);
    }

    let features = SparseVector::new(indices, values);
    if features.indices.windows(2).any(|w| w[0] == w[1]) {
        return Err("duplicate feature index".to_string());
    }
    Ok(Sample::new(features, label))
}

impl Dataset for LibSVMDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn dim(&self) -> usize {
        self.dimensions
    }

    fn get_sample(&self, i: usize) -> Sample {
        self.samples[i].clone()
    }

    fn samples(&self) -> Vec<Sample> {
        self.samples.clone()
    }

    fn get_labels(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.label).collect()
    }
}
