#![forbid(unsafe_code)]

mod schema;
mod table;

use pc_types::{DType, ScalarValue, Status, TypeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use schema::{Field, Schema};
pub use table::Table;

/// Row selection over a table, one flag per row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mask {
    bits: Vec<bool>,
}

impl Mask {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    #[must_use]
    pub fn all(len: usize) -> Self {
        Self {
            bits: vec![true; len],
        }
    }

    #[must_use]
    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    #[must_use]
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        self.bits.get(idx).copied().unwrap_or(false)
    }

    /// Sets a flag, growing the mask with unset flags when `idx` is past the
    /// end.
    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.bits.len() {
            self.bits.resize(idx + 1, false);
        }
        self.bits[idx] = value;
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|bit| **bit).count()
    }

    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(idx, bit)| bit.then_some(idx))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<ScalarValue>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("row {idx} out of bounds for length {len}")]
    OutOfBounds { idx: usize, len: usize },
    #[error("column {name:?} not found")]
    UnknownColumn { name: String },
    #[error("column {name:?} already exists")]
    DuplicateColumn { name: String },
    #[error("column of dtype {expected:?} cannot hold a value of dtype {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl Column {
    #[must_use]
    pub fn new(dtype: DType) -> Self {
        Self {
            dtype,
            values: Vec::new(),
        }
    }

    /// Column of `len` invalid cells.
    #[must_use]
    pub fn with_len(dtype: DType, len: usize) -> Self {
        Self {
            dtype,
            values: vec![ScalarValue::null(dtype); len],
        }
    }

    pub fn from_values(dtype: DType, values: Vec<ScalarValue>) -> Result<Self, ColumnError> {
        let values = values
            .into_iter()
            .map(|value| fit(dtype, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { dtype, values })
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[ScalarValue] {
        &self.values
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&ScalarValue> {
        self.values.get(idx)
    }

    /// Owned cell, or an invalid value of the column dtype past the end.
    #[must_use]
    pub fn get_scalar(&self, idx: usize) -> ScalarValue {
        self.values
            .get(idx)
            .cloned()
            .unwrap_or_else(|| ScalarValue::null(self.dtype))
    }

    /// Writes a cell. Numeric values are re-expressed in the column dtype;
    /// non-valid values keep their status and take the column dtype.
    pub fn set(&mut self, idx: usize, value: ScalarValue) -> Result<(), ColumnError> {
        let len = self.values.len();
        let value = fit(self.dtype, value)?;
        let slot = self
            .values
            .get_mut(idx)
            .ok_or(ColumnError::OutOfBounds { idx, len })?;
        *slot = value;
        Ok(())
    }

    pub fn clear(&mut self, idx: usize) -> Result<(), ColumnError> {
        self.set(idx, ScalarValue::cleared(self.dtype))
    }

    /// Marks a cell invalid, which is how unused slots are kept.
    pub fn unset(&mut self, idx: usize) -> Result<(), ColumnError> {
        self.set(idx, ScalarValue::null(self.dtype))
    }

    pub fn push(&mut self, value: ScalarValue) -> Result<(), ColumnError> {
        self.values.push(fit(self.dtype, value)?);
        Ok(())
    }

    /// Grows the column to `len` with invalid cells; never shrinks.
    pub fn extend_to(&mut self, len: usize) {
        if len > self.values.len() {
            self.values.resize(len, ScalarValue::null(self.dtype));
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    pub fn reserve(&mut self, additional: usize) {
        self.values.reserve(additional);
    }

    #[must_use]
    pub fn clone_with_mask(&self, mask: &Mask) -> Self {
        Self {
            dtype: self.dtype,
            values: mask
                .positions()
                .map(|idx| self.get_scalar(idx))
                .collect(),
        }
    }

    #[must_use]
    pub fn clone_with_positions(&self, positions: &[usize]) -> Self {
        Self {
            dtype: self.dtype,
            values: positions.iter().map(|idx| self.get_scalar(*idx)).collect(),
        }
    }

    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|value| value.is_valid()).count()
    }
}

fn fit(dtype: DType, value: ScalarValue) -> Result<ScalarValue, ColumnError> {
    if value.dtype() == dtype {
        return Ok(value);
    }
    if !value.is_valid() || value.is_none() {
        let out = match value.status() {
            Status::Valid | Status::Invalid => ScalarValue::null(dtype),
            Status::Empty => ScalarValue::empty(dtype),
            Status::Cleared => ScalarValue::cleared(dtype),
            Status::Error => {
                ScalarValue::error(dtype, value.error_description().unwrap_or("ERROR"))
            }
        };
        return Ok(out.with_format(value.format()));
    }
    if dtype.is_numeric() && value.is_numeric() {
        return Ok(value.coerce_numeric(dtype));
    }
    Err(ColumnError::DTypeMismatch {
        expected: dtype,
        actual: value.dtype(),
    })
}
