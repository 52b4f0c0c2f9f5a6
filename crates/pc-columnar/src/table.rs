use pc_types::{DType, ScalarValue};
use serde::{Deserialize, Serialize};

use crate::{Column, ColumnError, Field, Mask, Schema};

/// Columns of equal length under one schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    schema: Schema,
    columns: Vec<Column>,
    size: usize,
}

impl Table {
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|field| Column::new(field.dtype))
            .collect();
        Self {
            schema,
            columns,
            size: 0,
        }
    }

    pub fn from_columns(schema: Schema, columns: Vec<Column>) -> Result<Self, ColumnError> {
        if schema.len() != columns.len() {
            return Err(ColumnError::LengthMismatch {
                left: schema.len(),
                right: columns.len(),
            });
        }
        let size = columns.first().map_or(0, Column::len);
        for (field, column) in schema.fields().iter().zip(&columns) {
            if column.len() != size {
                return Err(ColumnError::LengthMismatch {
                    left: size,
                    right: column.len(),
                });
            }
            if column.dtype() != field.dtype {
                return Err(ColumnError::DTypeMismatch {
                    expected: field.dtype,
                    actual: column.dtype(),
                });
            }
        }
        Ok(Self {
            schema,
            columns,
            size,
        })
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.schema.colidx(name).map(|idx| &self.columns[idx])
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.schema.colidx(name).map(|idx| &mut self.columns[idx])
    }

    pub fn require_column(&self, name: &str) -> Result<&Column, ColumnError> {
        self.column(name).ok_or_else(|| ColumnError::UnknownColumn {
            name: name.to_owned(),
        })
    }

    #[must_use]
    pub fn column_at(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    /// Adds a column of invalid cells sized to the table.
    pub fn add_column(&mut self, name: &str, dtype: DType) -> Result<usize, ColumnError> {
        let idx = self.schema.add_field(Field::new(name, dtype))?;
        self.columns.push(Column::with_len(dtype, self.size));
        Ok(idx)
    }

    /// Cell at (`row`, `name`); invalid when either is unknown.
    #[must_use]
    pub fn get(&self, row: usize, name: &str) -> ScalarValue {
        match self.schema.colidx(name) {
            Some(idx) => self.columns[idx].get_scalar(row),
            None => ScalarValue::null(DType::None),
        }
    }

    pub fn set(&mut self, row: usize, name: &str, value: ScalarValue) -> Result<(), ColumnError> {
        let column = self
            .column_mut(name)
            .ok_or_else(|| ColumnError::UnknownColumn {
                name: name.to_owned(),
            })?;
        column.set(row, value)
    }

    #[must_use]
    pub fn row(&self, row: usize) -> Vec<ScalarValue> {
        self.columns.iter().map(|column| column.get_scalar(row)).collect()
    }

    /// Appends one row given in schema order.
    pub fn push_row(&mut self, values: Vec<ScalarValue>) -> Result<usize, ColumnError> {
        if values.len() != self.columns.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.columns.len(),
                right: values.len(),
            });
        }
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.push(value)?;
        }
        self.size += 1;
        Ok(self.size - 1)
    }

    /// Grows every column to `size` rows of invalid cells.
    pub fn extend_to(&mut self, size: usize) {
        if size <= self.size {
            return;
        }
        for column in &mut self.columns {
            column.extend_to(size);
        }
        self.size = size;
    }

    pub fn reserve(&mut self, additional: usize) {
        for column in &mut self.columns {
            column.reserve(additional);
        }
    }

    pub fn clear(&mut self) {
        for column in &mut self.columns {
            column.truncate(0);
        }
        self.size = 0;
    }

    #[must_use]
    pub fn clone_with_mask(&self, mask: &Mask) -> Self {
        let columns: Vec<Column> = self
            .columns
            .iter()
            .map(|column| column.clone_with_mask(mask))
            .collect();
        let size = columns.first().map_or_else(|| mask.count(), Column::len);
        Self {
            schema: self.schema.clone(),
            columns,
            size,
        }
    }

    #[must_use]
    pub fn clone_with_positions(&self, positions: &[usize]) -> Self {
        Self {
            schema: self.schema.clone(),
            columns: self
                .columns
                .iter()
                .map(|column| column.clone_with_positions(positions))
                .collect(),
            size: positions.len(),
        }
    }

    /// Table restricted to `names`, in that order.
    pub fn project(&self, names: &[&str]) -> Result<Self, ColumnError> {
        let schema = self.schema.project(names)?;
        let columns = names
            .iter()
            .map(|name| self.require_column(name).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema,
            columns,
            size: self.size,
        })
    }
}
