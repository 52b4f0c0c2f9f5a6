#![forbid(unsafe_code)]

//! The canonical store: the current row of every primary key.
//!
//! One physical [`Table`] holds the business columns plus `psp_pkey` and
//! `psp_op`; a `BTreeMap` maps each live key to its row. Erased rows go to a
//! free list and are handed out again before the table grows.

mod accessor;
mod change;
mod flatten;

use std::collections::{BTreeMap, BTreeSet};

use pc_columnar::{Column, ColumnError, Field, Mask, Schema, Table};
use pc_runtime::ParallelConfig;
use pc_types::{DType, ScalarValue, Status};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use accessor::{CellRead, IndexSource, RowAccessor, build_input};
pub use change::{ChangeSet, ValueTransition, calc_transition};
pub use flatten::flatten;

pub const PKEY_COLUMN: &str = "psp_pkey";
pub const OP_COLUMN: &str = "psp_op";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Insert,
    Delete,
}

impl Op {
    #[must_use]
    pub fn to_scalar(self) -> ScalarValue {
        ScalarValue::uint8(match self {
            Self::Insert => 0,
            Self::Delete => 1,
        })
    }

    pub fn from_scalar(value: &ScalarValue) -> Result<Self, StoreError> {
        match value.to_i64() {
            Ok(0) => Ok(Self::Insert),
            Ok(1) => Ok(Self::Delete),
            _ => Err(StoreError::InvariantViolation(format!(
                "unexpected op cell {value:?}"
            ))),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("table has no {0} column")]
    MissingColumn(String),
    #[error("unknown column {0}")]
    UnknownColumn(String),
    /// Build or configuration bug; the update must not continue.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

impl StoreError {
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::InvariantViolation(_) | Self::Column(ColumnError::DTypeMismatch { .. })
        )
    }
}

/// Counts from one `apply_delta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub fast_path: bool,
    pub inserted: usize,
    pub updated: usize,
    pub erased: usize,
}

/// Schema of a delta table for `business`: the business columns followed by
/// `psp_pkey` and `psp_op`.
pub fn delta_schema(business: &Schema, pkey_dtype: DType) -> Result<Schema, StoreError> {
    let mut schema = business.clone();
    if !schema.has_column(PKEY_COLUMN) {
        schema.add_field(Field::new(PKEY_COLUMN, pkey_dtype))?;
    }
    if !schema.has_column(OP_COLUMN) {
        schema.add_field(Field::new(OP_COLUMN, DType::UInt8))?;
    }
    Ok(schema)
}

enum RowWrite {
    Copy { src: usize, dst: usize },
    Unset { dst: usize },
}

#[derive(Debug, Clone)]
pub struct CanonicalStore {
    table: Table,
    mapping: BTreeMap<ScalarValue, usize>,
    free: BTreeSet<usize>,
    parallel: ParallelConfig,
}

impl CanonicalStore {
    /// `schema` holds the business columns; `psp_pkey` (of `pkey_dtype`)
    /// and `psp_op` are appended when absent.
    pub fn new(schema: &Schema, pkey_dtype: DType) -> Result<Self, StoreError> {
        Ok(Self {
            table: Table::new(delta_schema(schema, pkey_dtype)?),
            mapping: BTreeMap::new(),
            free: BTreeSet::new(),
            parallel: ParallelConfig::default(),
        })
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        self.table.schema()
    }

    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Allocated rows, free slots included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.table.size()
    }

    #[must_use]
    pub fn mapping_size(&self) -> usize {
        self.mapping.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn reset(&mut self) {
        self.table.clear();
        self.mapping.clear();
        self.free.clear();
    }

    #[must_use]
    pub fn lookup(&self, pkey: &ScalarValue) -> Option<usize> {
        self.mapping.get(pkey).copied()
    }

    #[must_use]
    pub fn has_pkey(&self, pkey: &ScalarValue) -> bool {
        self.mapping.contains_key(pkey)
    }

    #[must_use]
    pub fn has_pkeys(&self, pkeys: &[ScalarValue]) -> Vec<bool> {
        pkeys.iter().map(|pkey| self.has_pkey(pkey)).collect()
    }

    /// Live keys in key order.
    #[must_use]
    pub fn get_pkeys(&self) -> Vec<ScalarValue> {
        self.mapping.keys().cloned().collect()
    }

    /// Row of `pkey`, reusing a free slot before growing the table.
    pub fn lookup_or_create(&mut self, pkey: &ScalarValue) -> Result<usize, StoreError> {
        if let Some(idx) = self.lookup(pkey) {
            return Ok(idx);
        }
        let idx = match self.free.pop_first() {
            Some(idx) => idx,
            None => {
                let idx = self.table.size();
                if idx == 0 || idx.is_power_of_two() {
                    self.table.reserve(idx.max(1));
                }
                self.table.extend_to(idx + 1);
                idx
            }
        };
        self.table.set(idx, PKEY_COLUMN, pkey.clone())?;
        self.table.set(idx, OP_COLUMN, Op::Insert.to_scalar())?;
        self.mapping.insert(pkey.clone(), idx);
        Ok(idx)
    }

    /// Clears the row of `pkey` and frees its slot. No-op for unknown keys.
    pub fn erase(&mut self, pkey: &ScalarValue) -> Result<(), StoreError> {
        let Some(idx) = self.mapping.remove(pkey) else {
            return Ok(());
        };
        self.unset_row(idx)?;
        self.free.insert(idx);
        Ok(())
    }

    fn unset_row(&mut self, idx: usize) -> Result<(), StoreError> {
        for column in self.table.columns_mut() {
            column.unset(idx)?;
        }
        Ok(())
    }

    fn require_delta_columns(delta: &Table) -> Result<(&Column, &Column), StoreError> {
        let pkeys = delta
            .column(PKEY_COLUMN)
            .ok_or_else(|| StoreError::MissingColumn(PKEY_COLUMN.to_owned()))?;
        let ops = delta
            .column(OP_COLUMN)
            .ok_or_else(|| StoreError::MissingColumn(OP_COLUMN.to_owned()))?;
        Ok((pkeys, ops))
    }

    /// Absorbs a delta table row by row. Insert rows overwrite the business
    /// cells they carry: invalid cells leave the stored value alone, cleared
    /// cells clear it. Delete rows erase their key. An empty store takes the
    /// whole delta by column clone instead.
    pub fn apply_delta(&mut self, delta: &Table) -> Result<DeltaSummary, StoreError> {
        let (pkeys, ops) = Self::require_delta_columns(delta)?;
        for name in delta.schema().names() {
            if !self.table.schema().has_column(name) {
                return Err(StoreError::UnknownColumn(name.to_owned()));
            }
        }

        if self.mapping.is_empty() && self.free.is_empty() && self.table.is_empty() {
            if let Some(summary) = self.try_fast_path(delta, pkeys, ops)? {
                #[cfg(feature = "tracing")]
                tracing::debug!(rows = delta.size(), inserted = summary.inserted, "delta cloned into empty store");
                return Ok(summary);
            }
        }

        let mut summary = DeltaSummary::default();
        let mut writes = Vec::with_capacity(delta.size());
        for row in 0..delta.size() {
            let pkey = pkeys.get_scalar(row);
            if !pkey.is_valid() {
                continue;
            }
            match Op::from_scalar(&ops.get_scalar(row))? {
                Op::Insert => {
                    if self.has_pkey(&pkey) {
                        summary.updated += 1;
                    } else {
                        summary.inserted += 1;
                    }
                    let dst = self.lookup_or_create(&pkey)?;
                    writes.push(RowWrite::Copy { src: row, dst });
                }
                Op::Delete => {
                    if let Some(dst) = self.mapping.remove(&pkey) {
                        self.free.insert(dst);
                        writes.push(RowWrite::Unset { dst });
                        summary.erased += 1;
                    }
                }
            }
        }

        let sources: Vec<Option<usize>> = self
            .table
            .schema()
            .names()
            .map(|name| delta.schema().colidx(name))
            .collect();
        let parallel = self.parallel.should_parallelize(sources.len());
        write_columns(self.table.columns_mut(), delta, &sources, &writes, parallel)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            rows = delta.size(),
            inserted = summary.inserted,
            updated = summary.updated,
            erased = summary.erased,
            "delta merged into store"
        );
        Ok(summary)
    }

    /// Clones the delta's columns wholesale. Declines (returns `None`) when
    /// a key repeats, leaving the store untouched.
    fn try_fast_path(
        &mut self,
        delta: &Table,
        pkeys: &Column,
        ops: &Column,
    ) -> Result<Option<DeltaSummary>, StoreError> {
        let mut mapping = BTreeMap::new();
        let mut free = BTreeSet::new();
        for row in 0..delta.size() {
            let pkey = pkeys.get_scalar(row);
            let op = Op::from_scalar(&ops.get_scalar(row))?;
            if !pkey.is_valid() || op == Op::Delete {
                free.insert(row);
                continue;
            }
            if mapping.insert(pkey, row).is_some() {
                return Ok(None);
            }
        }

        let fields = self.table.schema().fields();
        let parallel = self.parallel.should_parallelize(fields.len());
        let columns = copy_columns(fields, delta, &free, parallel)?;

        self.table = Table::from_columns(self.table.schema().clone(), columns)?;
        let inserted = mapping.len();
        self.mapping = mapping;
        self.free = free;
        Ok(Some(DeltaSummary {
            fast_path: true,
            inserted,
            updated: 0,
            erased: 0,
        }))
    }

    fn require_column(&self, colname: &str) -> Result<&Column, StoreError> {
        self.table
            .column(colname)
            .ok_or_else(|| StoreError::UnknownColumn(colname.to_owned()))
    }

    /// Projects a column for `pkeys`, skipping unknown keys.
    pub fn read_column(
        &self,
        colname: &str,
        pkeys: &[ScalarValue],
    ) -> Result<Vec<ScalarValue>, StoreError> {
        let column = self.require_column(colname)?;
        Ok(pkeys
            .iter()
            .filter_map(|pkey| self.lookup(pkey))
            .map(|idx| column.get_scalar(idx))
            .collect())
    }

    /// Projects a column for `pkeys`, one output per key; unknown keys read
    /// as invalid so aggregate inputs stay aligned with the key list.
    pub fn read_column_aligned(
        &self,
        colname: &str,
        pkeys: &[ScalarValue],
    ) -> Result<Vec<ScalarValue>, StoreError> {
        let column = self.require_column(colname)?;
        Ok(pkeys
            .iter()
            .map(|pkey| match self.lookup(pkey) {
                Some(idx) => column.get_scalar(idx),
                None => ScalarValue::null(column.dtype()),
            })
            .collect())
    }

    pub fn reduce<T>(
        &self,
        pkeys: &[ScalarValue],
        colname: &str,
        f: impl FnOnce(&[ScalarValue]) -> T,
    ) -> Result<T, StoreError> {
        let values = self.read_column(colname, pkeys)?;
        Ok(f(&values))
    }

    /// Whether every known key holds the same value, and that value (`none`
    /// when no key is known).
    pub fn is_unique(
        &self,
        pkeys: &[ScalarValue],
        colname: &str,
    ) -> Result<(bool, ScalarValue), StoreError> {
        let column = self.require_column(colname)?;
        let mut value = ScalarValue::none();
        for idx in pkeys.iter().filter_map(|pkey| self.lookup(pkey)) {
            let cell = column.get_scalar(idx);
            if !value.is_none() && value != cell {
                return Ok((false, value));
            }
            value = cell;
        }
        Ok((true, value))
    }

    /// Scans the column for `pkeys` in order and returns the first value `f`
    /// maps to `Some`.
    pub fn apply<T>(
        &self,
        pkeys: &[ScalarValue],
        colname: &str,
        mut f: impl FnMut(&ScalarValue) -> Option<T>,
    ) -> Result<Option<T>, StoreError> {
        let column = self.require_column(colname)?;
        for idx in pkeys.iter().filter_map(|pkey| self.lookup(pkey)) {
            if let Some(cell) = column.get(idx) {
                if let Some(out) = f(cell) {
                    return Ok(Some(out));
                }
            }
        }
        Ok(None)
    }

    /// Cell of `pkey`; invalid for unknown keys or columns.
    #[must_use]
    pub fn get_value(&self, pkey: &ScalarValue, colname: &str) -> ScalarValue {
        match (self.lookup(pkey), self.table.column(colname)) {
            (Some(idx), Some(column)) => column.get_scalar(idx),
            (None, Some(column)) => ScalarValue::null(column.dtype()),
            _ => ScalarValue::null(DType::None),
        }
    }

    /// Business cells of `pkey` in schema order, without `psp_op`.
    #[must_use]
    pub fn get_row(&self, pkey: &ScalarValue) -> Option<Vec<ScalarValue>> {
        let idx = self.lookup(pkey)?;
        Some(
            self.table
                .schema()
                .fields()
                .iter()
                .zip(self.table.columns())
                .filter(|(field, _)| field.name != OP_COLUMN)
                .map(|(_, column)| column.get_scalar(idx))
                .collect(),
        )
    }

    /// Current rows in primary-key order, without `psp_op`. With a mask over
    /// store rows, only masked rows are kept; the output is dense either way.
    pub fn get_pkeyed_table(&self, mask: Option<&Mask>) -> Result<Table, StoreError> {
        let positions: Vec<usize> = self
            .mapping
            .values()
            .copied()
            .filter(|idx| mask.is_none_or(|mask| mask.get(*idx)))
            .collect();
        let names: Vec<&str> = self
            .table
            .schema()
            .names()
            .filter(|name| *name != OP_COLUMN)
            .collect();
        Ok(self.table.clone_with_positions(&positions).project(&names)?)
    }

    /// Row indices of `pkeys`, skipping unknown keys.
    #[must_use]
    pub fn get_pkeys_idx(&self, pkeys: &[ScalarValue]) -> Vec<usize> {
        pkeys.iter().filter_map(|pkey| self.lookup(pkey)).collect()
    }

    /// Mask over store rows selecting live keys.
    #[must_use]
    pub fn live_mask(&self) -> Mask {
        let mut mask = Mask::new(self.table.size());
        for idx in self.mapping.values() {
            mask.set(*idx, true);
        }
        mask
    }
}

fn write_cell(column: &mut Column, dst: usize, value: &ScalarValue) -> Result<(), ColumnError> {
    match value.status() {
        Status::Invalid => Ok(()),
        Status::Cleared => column.clear(dst),
        _ => column.set(dst, value.clone()),
    }
}

fn write_column(
    column: &mut Column,
    source: Option<&Column>,
    writes: &[RowWrite],
) -> Result<(), ColumnError> {
    for write in writes {
        match (write, source) {
            (RowWrite::Copy { src, dst }, Some(source)) => {
                write_cell(column, *dst, &source.get_scalar(*src))?;
            }
            (RowWrite::Copy { .. }, None) => {}
            (RowWrite::Unset { dst }, _) => column.unset(*dst)?,
        }
    }
    Ok(())
}

fn copy_column(field: &Field, delta: &Table, free: &BTreeSet<usize>) -> Result<Column, ColumnError> {
    match delta.column(&field.name) {
        Some(source) => {
            let mut column = Column::from_values(field.dtype, source.values().to_vec())?;
            for row in free {
                column.unset(*row)?;
            }
            Ok(column)
        }
        None => Ok(Column::with_len(field.dtype, delta.size())),
    }
}

/// Builds store columns straight from the delta, leaving `free` rows unset.
#[cfg(feature = "parallel")]
fn copy_columns(
    fields: &[Field],
    delta: &Table,
    free: &BTreeSet<usize>,
    parallel: bool,
) -> Result<Vec<Column>, ColumnError> {
    use rayon::prelude::*;

    if parallel {
        return fields
            .par_iter()
            .map(|field| copy_column(field, delta, free))
            .collect();
    }
    fields
        .iter()
        .map(|field| copy_column(field, delta, free))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn copy_columns(
    fields: &[Field],
    delta: &Table,
    free: &BTreeSet<usize>,
    _parallel: bool,
) -> Result<Vec<Column>, ColumnError> {
    fields
        .iter()
        .map(|field| copy_column(field, delta, free))
        .collect()
}

#[cfg(feature = "parallel")]
fn write_columns(
    columns: &mut [Column],
    delta: &Table,
    sources: &[Option<usize>],
    writes: &[RowWrite],
    parallel: bool,
) -> Result<(), ColumnError> {
    use rayon::prelude::*;

    if parallel {
        return columns
            .par_iter_mut()
            .zip(sources.par_iter())
            .try_for_each(|(column, source)| {
                write_column(column, source.and_then(|idx| delta.column_at(idx)), writes)
            });
    }
    columns
        .iter_mut()
        .zip(sources)
        .try_for_each(|(column, source)| {
            write_column(column, source.and_then(|idx| delta.column_at(idx)), writes)
        })
}

#[cfg(not(feature = "parallel"))]
fn write_columns(
    columns: &mut [Column],
    delta: &Table,
    sources: &[Option<usize>],
    writes: &[RowWrite],
    _parallel: bool,
) -> Result<(), ColumnError> {
    columns
        .iter_mut()
        .zip(sources)
        .try_for_each(|(column, source)| {
            write_column(column, source.and_then(|idx| delta.column_at(idx)), writes)
        })
}

#[cfg(test)]
mod tests {
    use pc_columnar::{Field, Mask, Schema, Table};
    use pc_types::{DType, ScalarValue};
    use proptest::prelude::*;

    use super::{CanonicalStore, Op, StoreError, delta_schema};

    pub(crate) fn business() -> Schema {
        Schema::new(vec![
            Field::new("region", DType::Str),
            Field::new("amt", DType::Int64),
        ])
        .expect("schema")
    }

    pub(crate) fn delta(rows: &[(i64, Op, Option<&str>, Option<i64>)]) -> Table {
        let mut table = Table::new(delta_schema(&business(), DType::Int64).expect("delta schema"));
        for (pkey, op, region, amt) in rows {
            table
                .push_row(vec![
                    region.map_or_else(|| ScalarValue::null(DType::Str), ScalarValue::string),
                    amt.map_or_else(|| ScalarValue::null(DType::Int64), ScalarValue::int64),
                    ScalarValue::int64(*pkey),
                    op.to_scalar(),
                ])
                .expect("row");
        }
        table
    }

    fn store() -> CanonicalStore {
        CanonicalStore::new(&business(), DType::Int64).expect("store")
    }

    fn k(v: i64) -> ScalarValue {
        ScalarValue::int64(v)
    }

    #[test]
    fn empty_store_takes_fast_path() {
        let mut store = store();
        let summary = store
            .apply_delta(&delta(&[
                (1, Op::Insert, Some("US"), Some(10)),
                (2, Op::Insert, Some("US"), Some(5)),
                (3, Op::Insert, Some("EU"), Some(7)),
            ]))
            .expect("apply");
        assert!(summary.fast_path);
        assert_eq!(summary.inserted, 3);
        assert_eq!(store.mapping_size(), 3);
        assert_eq!(store.get_value(&k(2), "amt"), k(5));
        assert_eq!(store.get_value(&k(3), "region"), ScalarValue::string("EU"));
    }

    #[test]
    fn fast_path_declines_duplicate_keys() {
        let mut store = store();
        let summary = store
            .apply_delta(&delta(&[
                (1, Op::Insert, Some("US"), Some(10)),
                (1, Op::Insert, None, Some(11)),
            ]))
            .expect("apply");
        assert!(!summary.fast_path);
        assert_eq!(store.mapping_size(), 1);
        assert_eq!(store.get_value(&k(1), "amt"), k(11));
        assert_eq!(store.get_value(&k(1), "region"), ScalarValue::string("US"));
    }

    #[test]
    fn pooled_and_serial_copies_agree_on_both_paths() {
        use pc_runtime::ParallelConfig;

        let first = delta(&[
            (1, Op::Insert, Some("US"), Some(10)),
            (2, Op::Delete, None, None),
            (3, Op::Insert, Some("EU"), Some(7)),
        ]);
        let second = delta(&[
            (3, Op::Insert, None, Some(8)),
            (4, Op::Insert, Some("APAC"), Some(1)),
        ]);
        let mut pooled = store().with_parallel(ParallelConfig::default().with_min_columns(1));
        let mut serial = store().with_parallel(ParallelConfig::serial());

        for (batch, fast) in [(&first, true), (&second, false)] {
            let a = pooled.apply_delta(batch).expect("pooled");
            let b = serial.apply_delta(batch).expect("serial");
            assert_eq!(a, b);
            assert_eq!(a.fast_path, fast);
        }
        assert_eq!(pooled.mapping_size(), 3);
        for key in [1, 3, 4] {
            for col in ["region", "amt"] {
                assert_eq!(pooled.get_value(&k(key), col), serial.get_value(&k(key), col));
            }
        }
        assert_eq!(pooled.get_value(&k(3), "amt"), k(8));
        assert_eq!(pooled.get_value(&k(3), "region"), ScalarValue::string("EU"));
        assert!(!pooled.has_pkey(&k(2)));
    }

    #[test]
    fn invalid_cells_keep_and_cleared_cells_clear() {
        let mut store = store();
        store
            .apply_delta(&delta(&[(1, Op::Insert, Some("US"), Some(10))]))
            .expect("load");
        let mut update = delta(&[(1, Op::Insert, None, None)]);
        update.set(0, "amt", ScalarValue::cleared(DType::Int64)).expect("set");
        store.apply_delta(&update).expect("update");
        assert_eq!(store.get_value(&k(1), "region"), ScalarValue::string("US"));
        assert!(store.get_value(&k(1), "amt").is_cleared());
    }

    #[test]
    fn erase_frees_slot_for_reuse() {
        let mut store = store();
        store
            .apply_delta(&delta(&[
                (1, Op::Insert, Some("US"), Some(10)),
                (2, Op::Insert, Some("EU"), Some(7)),
            ]))
            .expect("load");
        let row = store.lookup(&k(1)).expect("row");
        store.erase(&k(1)).expect("erase");
        assert!(!store.has_pkey(&k(1)));
        assert_eq!(store.free_slots(), 1);
        store.erase(&k(99)).expect("absent key is a no-op");

        let reused = store.lookup_or_create(&k(5)).expect("create");
        assert_eq!(reused, row);
        assert_eq!(store.size(), 2);
        assert!(!store.get_value(&k(5), "amt").is_valid());
    }

    #[test]
    fn projections_and_reductions() {
        let mut store = store();
        store
            .apply_delta(&delta(&[
                (1, Op::Insert, Some("US"), Some(10)),
                (2, Op::Insert, Some("US"), Some(5)),
                (3, Op::Insert, Some("EU"), Some(7)),
            ]))
            .expect("load");
        let keys = [k(3), k(42), k(1)];
        assert_eq!(store.read_column("amt", &keys).expect("read"), vec![k(7), k(10)]);
        assert_eq!(store.read_column_aligned("amt", &keys).expect("read").len(), 3);
        let total = store
            .reduce(&keys, "amt", |values| values.iter().fold(ScalarValue::none(), |acc, v| acc.add(v)))
            .expect("reduce");
        assert_eq!(total, k(17));

        let (unique, value) = store.is_unique(&[k(1), k(2)], "region").expect("unique");
        assert!(unique);
        assert_eq!(value, ScalarValue::string("US"));
        assert!(!store.is_unique(&keys, "region").expect("unique").0);

        let first_big = store
            .apply(&[k(2), k(3), k(1)], "amt", |v| v.gt(&k(6)).then(|| v.clone()))
            .expect("apply");
        assert_eq!(first_big, Some(k(7)));
        assert!(matches!(
            store.read_column("nope", &keys),
            Err(StoreError::UnknownColumn(_))
        ));
    }

    #[test]
    fn pkeyed_table_is_dense_and_ordered() {
        let mut store = store();
        store
            .apply_delta(&delta(&[
                (3, Op::Insert, Some("EU"), Some(7)),
                (1, Op::Insert, Some("US"), Some(10)),
                (2, Op::Insert, Some("US"), Some(5)),
            ]))
            .expect("load");
        store.erase(&k(1)).expect("erase");
        let full = store.get_pkeyed_table(None).expect("table");
        assert_eq!(full.size(), 2);
        assert_eq!(full.get(0, "psp_pkey"), k(2));
        assert!(full.column("psp_op").is_none());

        let mut mask = Mask::new(store.size());
        mask.set(store.lookup(&k(3)).expect("row"), true);
        let masked = store.get_pkeyed_table(Some(&mask)).expect("masked");
        assert_eq!(masked.size(), 1);
        assert_eq!(masked.get(0, "amt"), k(7));
    }

    fn rows_strategy(offset: i64) -> impl Strategy<Value = Vec<(i64, i64)>> {
        prop::collection::btree_map(0i64..50, -100i64..100, 0..20)
            .prop_map(move |m| m.into_iter().map(|(key, amt)| (key + offset, amt)).collect())
    }

    fn load(store: &mut CanonicalStore, rows: &[(i64, i64)]) {
        let rows: Vec<_> = rows
            .iter()
            .map(|(key, amt)| (*key, Op::Insert, Some("X"), Some(*amt)))
            .collect();
        store.apply_delta(&delta(&rows)).expect("apply");
    }

    proptest! {
        #[test]
        fn split_batches_converge_with_merged_batch(a in rows_strategy(0), b in rows_strategy(1000)) {
            let mut split = store();
            load(&mut split, &a);
            load(&mut split, &b);

            let mut merged = store();
            let all: Vec<_> = a.iter().chain(b.iter()).copied().collect();
            load(&mut merged, &all);

            prop_assert_eq!(split.get_pkeys(), merged.get_pkeys());
            for key in split.get_pkeys() {
                prop_assert_eq!(split.get_row(&key), merged.get_row(&key));
            }
        }
    }
}
