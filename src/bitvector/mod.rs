//! Run-length bit vectors for sparse feature membership
//!
//! A row's set positions are stored as a stream of fixed-width words:
//!
//! * flag clear, magnitude `MAX_RUN`: a run of `MAX_RUN` unset positions,
//!   keep going;
//! * flag set, magnitude `n <= MAX_RUN`: `n` positions past the last set
//!   position (or past 0 at the start of a row) is set;
//! * a zero word ends the row; the next row starts on a 32-bit boundary.
//!
//! Words are little-endian inside the 32-bit words handed to the device, so
//! every row begins at a whole word offset that can be stored in a table.
//!
//! [`DenseBitPattern`] is the fixed-width alternative: every row owns the
//! same number of 32-bit words and position `idx` is bit `idx % 32` of word
//! `idx / 32`. Rows are found by multiplication, no table needed, at the
//! cost of storing every unset position up to the widest row.

use crate::core::{Result, SVMError, WordWidth};
use log::warn;

const WORD_BYTES: usize = 4;

/// Growth step of the backing buffer, in 32-bit words
const MEMORY_INCREMENT: usize = 1000;

impl WordWidth {
    /// Bytes per encoded word
    pub fn bytes(self) -> usize {
        match self {
            WordWidth::U8 => 1,
            WordWidth::U16 => 2,
        }
    }

    /// Longest run one word can describe
    pub fn max_run(self) -> usize {
        match self {
            WordWidth::U8 => 0x7F,
            WordWidth::U16 => 0x7FFF,
        }
    }

    fn flag(self) -> u32 {
        match self {
            WordWidth::U8 => 0x80,
            WordWidth::U16 => 0x8000,
        }
    }

    fn mask(self) -> u32 {
        match self {
            WordWidth::U8 => 0xFF,
            WordWidth::U16 => 0xFFFF,
        }
    }
}

/// Encoder for one or more rows of run-length bit vectors
#[derive(Debug, Clone)]
pub struct SparseBitVector {
    bytes: Vec<u8>,
    /// next byte to fill
    pos: usize,
    /// last index set in the current row
    run_count: usize,
    width: WordWidth,
}

impl SparseBitVector {
    /// Create an encoder with room for `initial_words` 32-bit words
    pub fn new(initial_words: usize, width: WordWidth) -> Self {
        Self {
            bytes: vec![0; initial_words * WORD_BYTES],
            pos: 0,
            run_count: 0,
            width,
        }
    }

    pub fn width(&self) -> WordWidth {
        self.width
    }

    /// Capacity of the backing buffer in bytes
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Last index set in the current row
    pub fn last_set(&self) -> usize {
        self.run_count
    }

    /// Mark position `idx` of the current row as set
    ///
    /// Positions must be set in increasing order. A smaller index is
    /// rejected and leaves the vector untouched.
    pub fn set(&mut self, idx: usize) -> Result<()> {
        if idx < self.run_count {
            warn!(
                "bit vector index {idx} is smaller than the last set index {}",
                self.run_count
            );
            return Err(SVMError::BitVectorOrder {
                index: idx,
                last: self.run_count,
            });
        }

        let max_run = self.width.max_run();
        let mut len = idx - self.run_count;
        while len > max_run {
            self.push_word(max_run as u32);
            len -= max_run;
        }
        self.push_word(len as u32 | self.width.flag());
        self.run_count = idx;
        Ok(())
    }

    /// Terminate the current row
    pub fn finish_row(&mut self) {
        self.push_word(0);
        self.align();
        self.run_count = 0;
    }

    /// Word offset at which the next row will start
    pub fn position(&mut self) -> usize {
        self.align();
        self.pos / WORD_BYTES
    }

    /// The encoded stream as 32-bit words
    pub fn words(&mut self) -> Vec<u32> {
        self.align();
        self.bytes[..self.pos]
            .chunks_exact(WORD_BYTES)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Finish encoding and hand over the stream
    pub fn into_words(mut self) -> Vec<u32> {
        self.words()
    }

    fn push_word(&mut self, word: u32) {
        let width = self.width.bytes();
        self.reserve(width);
        let le = word.to_le_bytes();
        self.bytes[self.pos..self.pos + width].copy_from_slice(&le[..width]);
        self.pos += width;
    }

    fn align(&mut self) {
        let rem = self.pos % WORD_BYTES;
        if rem != 0 {
            self.pos += WORD_BYTES - rem;
            self.reserve(0);
        }
    }

    fn reserve(&mut self, extra: usize) {
        while self.pos + extra > self.bytes.len() {
            let grown = self.bytes.len() + MEMORY_INCREMENT * WORD_BYTES;
            self.bytes.resize(grown, 0);
        }
    }
}

/// Iterator over the set positions of one encoded row
#[derive(Debug, Clone)]
pub struct BitVectorReader<'a> {
    words: &'a [u32],
    byte_pos: usize,
    current: usize,
    width: WordWidth,
    done: bool,
}

impl<'a> BitVectorReader<'a> {
    /// Start reading the row beginning at word `offset`
    pub fn new(words: &'a [u32], offset: usize, width: WordWidth) -> Self {
        Self {
            words,
            byte_pos: offset * WORD_BYTES,
            current: 0,
            width,
            done: false,
        }
    }

    fn next_word(&mut self) -> Option<u32> {
        let word = self.words.get(self.byte_pos / WORD_BYTES)?;
        let shift = 8 * (self.byte_pos % WORD_BYTES);
        self.byte_pos += self.width.bytes();
        Some((word >> shift) & self.width.mask())
    }
}

impl Iterator for BitVectorReader<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while !self.done {
            let word = match self.next_word() {
                Some(0) | None => {
                    self.done = true;
                    return None;
                }
                Some(word) => word,
            };
            let magnitude = (word & self.width.max_run() as u32) as usize;
            self.current += magnitude;
            if word & self.width.flag() != 0 {
                return Some(self.current);
            }
        }
        None
    }
}

/// Bits per word of a dense pattern
pub const PATTERN_WORD_BITS: usize = 32;

/// Fixed-width membership patterns, one row of `row_words` words per sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseBitPattern {
    words: Vec<u32>,
    rows: usize,
    row_words: usize,
}

impl DenseBitPattern {
    /// All-clear patterns for `rows` rows wide enough for `max_index`
    ///
    /// `None` means no row has a set position; every row is then empty.
    pub fn new(rows: usize, max_index: Option<usize>) -> Self {
        let row_words = max_index.map_or(0, |idx| idx / PATTERN_WORD_BITS + 1);
        Self {
            words: vec![0; rows * row_words],
            rows,
            row_words,
        }
    }

    /// Words per row
    pub fn row_words(&self) -> usize {
        self.row_words
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Mark position `idx` of `row` as set
    pub fn set(&mut self, row: usize, idx: usize) -> Result<()> {
        let word = idx / PATTERN_WORD_BITS;
        if word >= self.row_words || row >= self.rows {
            return Err(SVMError::DimensionMismatch {
                expected: self.row_words * PATTERN_WORD_BITS,
                actual: idx + 1,
            });
        }
        self.words[row * self.row_words + word] |= 1u32 << (idx % PATTERN_WORD_BITS);
        Ok(())
    }

    /// Words of one row
    pub fn row(&self, row: usize) -> &[u32] {
        &self.words[row * self.row_words..(row + 1) * self.row_words]
    }

    pub fn into_words(self) -> Vec<u32> {
        self.words
    }
}

/// Iterator over the set positions of one dense row, in increasing order
#[derive(Debug, Clone)]
pub struct DenseBitReader<'a> {
    words: &'a [u32],
    word: usize,
    /// bits of `words[word]` not yet returned
    pending: u32,
}

impl<'a> DenseBitReader<'a> {
    /// Read the row held in `words`
    pub fn new(words: &'a [u32]) -> Self {
        Self {
            words,
            word: 0,
            pending: words.first().copied().unwrap_or(0),
        }
    }
}

impl Iterator for DenseBitReader<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.pending == 0 {
            self.word += 1;
            self.pending = *self.words.get(self.word)?;
        }
        let bit = self.pending.trailing_zeros() as usize;
        self.pending &= self.pending - 1;
        Some(self.word * PATTERN_WORD_BITS + bit)
    }
}
