use pc_columnar::{Schema, Table};
use pc_types::{DType, ScalarValue, SymbolTable};

use crate::{OP_COLUMN, Op, PKEY_COLUMN, StoreError, delta_schema};

/// What a host row source returned for one cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellRead {
    /// Column absent from the host row; the stored value is kept.
    Missing,
    /// Explicit null; the stored value is cleared.
    Null,
    /// Host-side undefined; treated like `Missing`.
    Undefined,
    Value(ScalarValue),
}

/// Row-oriented view over host data.
pub trait RowAccessor {
    fn row_count(&self) -> usize;

    fn read(&self, row: usize, column: &str, dtype: DType) -> CellRead;

    fn op(&self, _row: usize) -> Op {
        Op::Insert
    }
}

/// Where primary keys come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSource {
    /// Read the key from this host column.
    Column(String),
    /// Number rows from this offset.
    Implicit(i64),
}

impl Default for IndexSource {
    fn default() -> Self {
        Self::Implicit(0)
    }
}

impl IndexSource {
    #[must_use]
    pub fn pkey_dtype(&self, business: &Schema) -> DType {
        match self {
            Self::Column(name) => business.dtype(name).unwrap_or(DType::Str),
            Self::Implicit(_) => DType::Int64,
        }
    }
}

/// Builds a delta table from host rows. Rows without a valid key are
/// skipped; string cells are interned through `symbols`.
pub fn build_input(
    accessor: &dyn RowAccessor,
    business: &Schema,
    index: &IndexSource,
    symbols: &SymbolTable,
) -> Result<Table, StoreError> {
    let schema = delta_schema(business, index.pkey_dtype(business))?;
    let mut table = Table::new(schema.clone());
    table.reserve(accessor.row_count());

    for row in 0..accessor.row_count() {
        let pkey = match index {
            IndexSource::Column(name) => {
                let dtype = business.dtype(name).unwrap_or(DType::Str);
                match accessor.read(row, name, dtype) {
                    CellRead::Value(value) if value.is_valid() => intern(symbols, value),
                    _ => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(row, index = %name, "skipping host row without a primary key");
                        continue;
                    }
                }
            }
            IndexSource::Implicit(offset) => ScalarValue::int64(offset + row as i64),
        };

        let cells = schema
            .fields()
            .iter()
            .map(|field| match field.name.as_str() {
                PKEY_COLUMN => pkey.clone(),
                OP_COLUMN => accessor.op(row).to_scalar(),
                name => match accessor.read(row, name, field.dtype) {
                    CellRead::Missing | CellRead::Undefined => ScalarValue::null(field.dtype),
                    CellRead::Null => ScalarValue::cleared(field.dtype),
                    CellRead::Value(value) => intern(symbols, value),
                },
            })
            .collect();
        table.push_row(cells)?;
    }
    Ok(table)
}

fn intern(symbols: &SymbolTable, value: ScalarValue) -> ScalarValue {
    match value.as_str() {
        Some(text) if value.is_valid() => ScalarValue::interned(symbols, text),
        _ => value,
    }
}
