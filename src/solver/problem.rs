//! Training rows resident on the device
//!
//! Feature values are moved to the device in chunks of
//! `transfer_chunk_size` elements. Membership is stored as one run-length
//! bit vector per row (with a table of each row's starting word), as a
//! fixed-width bit pattern per row, or as explicit `(index, value)` pairs. Kernel evaluations inside device
//! passes read rows back through [`DeviceProblem::row`].

use crate::bitvector::{BitVectorReader, DenseBitPattern, DenseBitReader, SparseBitVector};
use crate::core::{FeatureLayout, Result, SVMError, Sample, SolverConfig, SvmType, WordWidth};
use crate::device::{Device, DeviceBuffer};
use crate::kernel::{Kernel, KernelType};
use log::{debug, info};
use std::iter::Peekable;

enum FeatureStore {
    BitVector {
        width: WordWidth,
        words: DeviceBuffer<u32>,
        /// first word of each row in `words`
        row_words: DeviceBuffer<usize>,
        values: DeviceBuffer<f64>,
    },
    DenseBits {
        patterns: DeviceBuffer<u32>,
        row_words: usize,
        values: DeviceBuffer<f64>,
    },
    IndexValue {
        pairs: DeviceBuffer<(usize, f64)>,
    },
}

/// Device copy of the training rows
pub struct DeviceProblem {
    l: usize,
    active_size: usize,
    /// element offset of each row, plus one past the last row
    row_offsets: DeviceBuffer<usize>,
    store: FeatureStore,
    /// ||x||² per row, RBF only
    x_square: Option<DeviceBuffer<f64>>,
    kernel: KernelType,
    svm_type: SvmType,
}

/// Non-zero `(index, value)` entries of one row
pub enum Row<'a> {
    Bits(std::iter::Zip<BitVectorReader<'a>, std::slice::Iter<'a, f64>>),
    Dense(std::iter::Zip<DenseBitReader<'a>, std::slice::Iter<'a, f64>>),
    Pairs(std::slice::Iter<'a, (usize, f64)>),
}

impl Iterator for Row<'_> {
    type Item = (usize, f64);

    fn next(&mut self) -> Option<(usize, f64)> {
        match self {
            Row::Bits(inner) => inner.next().map(|(index, &value)| (index, value)),
            Row::Dense(inner) => inner.next().map(|(index, &value)| (index, value)),
            Row::Pairs(inner) => inner.next().copied(),
        }
    }
}

impl DeviceProblem {
    /// Number of training rows
    pub fn len(&self) -> usize {
        self.l
    }

    pub fn is_empty(&self) -> bool {
        self.l == 0
    }

    /// Number of dual variables (`2l` for regression)
    pub fn active_size(&self) -> usize {
        self.active_size
    }

    pub fn kernel(&self) -> &KernelType {
        &self.kernel
    }

    pub fn svm_type(&self) -> SvmType {
        self.svm_type
    }

    /// Training row behind dual variable `t`
    pub fn data_row(&self, t: usize) -> usize {
        t % self.l
    }

    pub fn layout(&self) -> FeatureLayout {
        match self.store {
            FeatureStore::BitVector { width, .. } => FeatureLayout::BitVector(width),
            FeatureStore::DenseBits { .. } => FeatureLayout::DenseBits,
            FeatureStore::IndexValue { .. } => FeatureLayout::IndexValue,
        }
    }

    pub fn row(&self, r: usize) -> Row<'_> {
        let (start, end) = (self.row_offsets[r], self.row_offsets[r + 1]);
        match &self.store {
            FeatureStore::BitVector {
                width,
                words,
                row_words,
                values,
            } => Row::Bits(BitVectorReader::new(words, row_words[r], *width).zip(values[start..end].iter())),
            FeatureStore::DenseBits {
                patterns,
                row_words,
                values,
            } => {
                let row_words = *row_words;
                let pattern = &patterns[r * row_words..(r + 1) * row_words];
                Row::Dense(DenseBitReader::new(pattern).zip(values[start..end].iter()))
            }
            FeatureStore::IndexValue { pairs } => Row::Pairs(pairs[start..end].iter()),
        }
    }

    /// <x_a, x_b> over training rows
    pub fn dot(&self, a: usize, b: usize) -> f64 {
        sparse_dot(self.row(a).peekable(), self.row(b).peekable())
    }

    /// K(x_a, x_b) over training rows
    pub fn kernel_value(&self, a: usize, b: usize) -> f64 {
        let (sq_a, sq_b) = match &self.x_square {
            Some(squares) => (squares[a], squares[b]),
            None => (0.0, 0.0),
        };
        self.kernel.evaluate(self.dot(a, b), sq_a, sq_b)
    }

    fn setup_x_square(&mut self, device: &Device) -> Result<()> {
        if !self.kernel.needs_norms() {
            return Ok(());
        }
        let l = self.l;
        let launch = device.launch_for(l);
        let mut squares = device.alloc::<f64>(l)?;
        let problem = &*self;
        device.dispatch("setup_x_square", launch, &mut squares, launch.group_size, |group, out| {
            for (slot, r) in out.iter_mut().zip(group.lane_range(l)) {
                *slot = problem.dot(r, r);
            }
        })?;
        self.x_square = Some(squares);
        Ok(())
    }
}

impl std::fmt::Debug for DeviceProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProblem")
            .field("l", &self.l)
            .field("active_size", &self.active_size)
            .field("layout", &self.layout())
            .field("kernel", &self.kernel)
            .finish()
    }
}

fn sparse_dot<A, B>(mut a: Peekable<A>, mut b: Peekable<B>) -> f64
where
    A: Iterator<Item = (usize, f64)>,
    B: Iterator<Item = (usize, f64)>,
{
    let mut sum = 0.0;
    while let (Some(&(ia, va)), Some(&(ib, vb))) = (a.peek(), b.peek()) {
        match ia.cmp(&ib) {
            std::cmp::Ordering::Equal => {
                sum += va * vb;
                a.next();
                b.next();
            }
            std::cmp::Ordering::Less => {
                a.next();
            }
            std::cmp::Ordering::Greater => {
                b.next();
            }
        }
    }
    sum
}

/// Move `samples` to the device in the layout `config` asks for
pub fn load_problem_parameters(
    device: &Device,
    samples: &[Sample],
    config: &SolverConfig,
) -> Result<DeviceProblem> {
    if samples.is_empty() {
        return Err(SVMError::EmptyDataset);
    }
    if config.transfer_chunk_size == 0 {
        return Err(SVMError::InvalidParameter(
            "transfer chunk size must be positive".to_string(),
        ));
    }
    config.kernel.validate()?;

    let l = samples.len();
    let elements: usize = samples.iter().map(|s| s.features.nnz()).sum();
    debug!("load_problem_parameters: {elements} elements need to be moved to device");

    let mut offsets = Vec::with_capacity(l + 1);
    let mut next = 0;
    for sample in samples {
        offsets.push(next);
        next += sample.features.nnz();
    }
    offsets.push(next);
    let row_offsets = device.upload(&offsets)?;

    let store = match config.feature_layout {
        FeatureLayout::BitVector(width) => {
            let mut values = device.alloc::<f64>(elements)?;
            transfer_chunked(
                device,
                "feature values",
                &mut values,
                samples.iter().flat_map(|s| s.features.values.iter().copied()),
                config.transfer_chunk_size,
            )?;

            // element count is the initial size guess for the encoder
            let mut bit_vector = SparseBitVector::new(elements.max(1), width);
            let mut table = Vec::with_capacity(l);
            for sample in samples {
                table.push(bit_vector.position());
                for &idx in &sample.features.indices {
                    bit_vector.set(idx)?;
                }
                bit_vector.finish_row();
            }
            let encoded = bit_vector.into_words();
            debug!("load_problem_parameters: sparse bit vector size is {} words", encoded.len());

            FeatureStore::BitVector {
                width,
                words: device.upload(&encoded)?,
                row_words: device.upload(&table)?,
                values,
            }
        }
        FeatureLayout::DenseBits => {
            let mut values = device.alloc::<f64>(elements)?;
            transfer_chunked(
                device,
                "feature values",
                &mut values,
                samples.iter().flat_map(|s| s.features.values.iter().copied()),
                config.transfer_chunk_size,
            )?;

            let max_index = samples
                .iter()
                .filter_map(|s| s.features.indices.last().copied())
                .max();
            let mut pattern = DenseBitPattern::new(l, max_index);
            for (r, sample) in samples.iter().enumerate() {
                for &idx in &sample.features.indices {
                    pattern.set(r, idx)?;
                }
            }
            let row_words = pattern.row_words();
            debug!("load_problem_parameters: dense bit patterns of {row_words} words per row");

            FeatureStore::DenseBits {
                patterns: device.upload(&pattern.into_words())?,
                row_words,
                values,
            }
        }
        FeatureLayout::IndexValue => {
            let mut pairs = device.alloc::<(usize, f64)>(elements)?;
            transfer_chunked(
                device,
                "feature pairs",
                &mut pairs,
                samples.iter().flat_map(|s| {
                    s.features
                        .indices
                        .iter()
                        .copied()
                        .zip(s.features.values.iter().copied())
                }),
                config.transfer_chunk_size,
            )?;
            FeatureStore::IndexValue { pairs }
        }
    };

    let active_size = match config.svm_type {
        SvmType::CSvc => l,
        SvmType::EpsilonSvr { .. } => 2 * l,
    };
    let mut problem = DeviceProblem {
        l,
        active_size,
        row_offsets,
        store,
        x_square: None,
        kernel: config.kernel,
        svm_type: config.svm_type,
    };
    problem.setup_x_square(device)?;

    info!(
        "problem on device: {} rows, {} elements, {:?} layout, {} kernel",
        l,
        elements,
        problem.layout(),
        problem.kernel.name()
    );
    Ok(problem)
}

/// Stage `items` on the host and copy them over `chunk` elements at a time
fn transfer_chunked<T, I>(
    device: &Device,
    operation: &str,
    dst: &mut DeviceBuffer<T>,
    items: I,
    chunk: usize,
) -> Result<()>
where
    T: Clone,
    I: Iterator<Item = T>,
{
    let mut staging = Vec::with_capacity(chunk.min(dst.len()));
    let mut next_loc = 0;
    let mut transfers = 0;
    for item in items {
        staging.push(item);
        if staging.len() == chunk {
            device.upload_into(operation, dst, next_loc, &staging)?;
            next_loc += staging.len();
            staging.clear();
            transfers += 1;
        }
    }
    if !staging.is_empty() {
        device.upload_into(operation, dst, next_loc, &staging)?;
        next_loc += staging.len();
        transfers += 1;
    }
    if next_loc != dst.len() {
        return Err(SVMError::Transfer {
            operation: operation.to_string(),
            expected: dst.len(),
            actual: next_loc,
        });
    }
    debug!("{operation}: {next_loc} elements in {transfers} transfers");
    Ok(())
}
