#![forbid(unsafe_code)]

//! Strand derivation.
//!
//! A strand is one contribution of one primary key to one pivot path: the
//! transformed pivot values, their sort values, the key, a signed count and
//! the key's aggregate inputs. A full build emits a `+1` strand per passing
//! row (per unnested path); a delta build emits only what a `ChangeSet`
//! moved, pairing a `-1` strand on the old path with a `+1` strand on the
//! new one when a row's path changes.

mod binning;
mod digest;
mod filter;

use std::collections::BTreeSet;

use pc_columnar::{ColumnError, Field, Schema, Table};
use pc_config::{PivotConfig, PivotSpec};
use pc_store::{CanonicalStore, ChangeSet, PKEY_COLUMN, StoreError, ValueTransition};
use pc_types::{AggLevel, BinningKind, BinningSpec, DType, ScalarValue};
use thiserror::Error;

pub use binning::{MAX_AUTO_BINS, auto_binning};
pub use digest::{DigestNode, StrandDigest};
pub use filter::{RowFilter, RowView};

pub const STRAND_COUNT_COLUMN: &str = "psp_strand_count";

#[must_use]
pub fn pivot_column(level: usize) -> String {
    format!("psp_pivot_{level}")
}

#[must_use]
pub fn sort_column(level: usize) -> String {
    format!("psp_sort_{level}")
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StrandError {
    /// Configuration bug; the context cannot be built.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

impl StrandError {
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            Self::InvariantViolation(_) => true,
            Self::Store(err) => err.is_invariant_violation(),
            Self::Column(err) => matches!(err, ColumnError::DTypeMismatch { .. }),
        }
    }
}

/// Binning of one pivot after resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PivotBinning {
    Off,
    On(BinningSpec),
    /// Requested but unusable; the pivot value is left out of strands.
    Degenerate,
}

/// A pivot bound to the store schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPivot {
    /// One-based tree depth of the pivot.
    pub level: usize,
    pub column: String,
    pub sort_by: Option<String>,
    pub agg_level: AggLevel,
    pub binning: PivotBinning,
    pub source_dtype: DType,
    pub dtype: DType,
    pub sort_dtype: DType,
}

fn leveled_dtype(source: DType, level: AggLevel) -> DType {
    let element = source.element_dtype().unwrap_or(source);
    match level {
        AggLevel::None => element,
        _ if element.is_temporal() => level.output_dtype(element),
        _ => DType::Str,
    }
}

fn binned_dtype(leveled: DType) -> Option<DType> {
    if leveled.is_numeric() {
        Some(DType::Float64)
    } else if leveled.is_temporal() {
        Some(DType::Date)
    } else {
        None
    }
}

impl ResolvedPivot {
    fn resolve(
        level: usize,
        spec: &PivotSpec,
        store: &CanonicalStore,
    ) -> Result<Self, StrandError> {
        let schema = store.schema();
        let source_dtype = schema.dtype(&spec.column).ok_or_else(|| {
            StrandError::InvariantViolation(format!("pivot column {} is not in the schema", spec.column))
        })?;
        let leveled = leveled_dtype(source_dtype, spec.agg_level);

        let (binning, dtype) = match (spec.binning.kind, binned_dtype(leveled)) {
            (BinningKind::None, _) => (PivotBinning::Off, leveled),
            (_, None) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(column = %spec.column, dtype = ?leveled, "ignoring binning on a non-binnable pivot");
                (PivotBinning::Off, leveled)
            }
            (BinningKind::Custom, Some(dtype)) if spec.binning.is_degenerate() => {
                #[cfg(feature = "tracing")]
                tracing::warn!(column = %spec.column, "degenerate binning, pivot values left out");
                (PivotBinning::Degenerate, dtype)
            }
            (BinningKind::Custom, Some(dtype)) => (PivotBinning::On(spec.binning), dtype),
            (BinningKind::Auto, Some(dtype)) => {
                let values = store.read_column(&spec.column, &store.get_pkeys())?;
                let leveled_values: Vec<ScalarValue> = values
                    .iter()
                    .flat_map(|value| match value.as_list() {
                        Some(items) => items.to_vec(),
                        None => vec![value.clone()],
                    })
                    .map(|value| value.to_agg_level_value(spec.agg_level))
                    .collect();
                match auto_binning(&leveled_values) {
                    Some(derived) => (PivotBinning::On(derived), dtype),
                    None => (PivotBinning::Degenerate, dtype),
                }
            }
        };

        let sort_by = spec
            .sort_by
            .as_ref()
            .filter(|column| {
                let known = schema.has_column(column);
                #[cfg(feature = "tracing")]
                if !known {
                    tracing::warn!(column = %column, "ignoring unknown sort-by column");
                }
                known
            })
            .cloned();
        let sort_dtype = sort_by
            .as_deref()
            .and_then(|column| schema.dtype(column))
            .unwrap_or(dtype);

        Ok(Self {
            level,
            column: spec.column.clone(),
            sort_by,
            agg_level: spec.agg_level,
            binning,
            source_dtype,
            dtype,
            sort_dtype,
        })
    }

    fn transform(&self, value: &ScalarValue) -> ScalarValue {
        if !value.is_valid() {
            return ScalarValue::null(self.dtype);
        }
        let leveled = value.to_agg_level_value(self.agg_level);
        match &self.binning {
            PivotBinning::Off => leveled,
            PivotBinning::On(spec) => leveled.to_binning_middle_value(spec),
            PivotBinning::Degenerate => ScalarValue::null(self.dtype),
        }
    }

    /// Pivot values of one cell: one per list element, a single null for
    /// an empty list.
    #[must_use]
    pub fn values(&self, cell: &ScalarValue) -> Vec<ScalarValue> {
        match cell.as_list() {
            Some([]) => vec![ScalarValue::null(self.dtype)],
            Some(items) => items.iter().map(|item| self.transform(item)).collect(),
            None => vec![self.transform(cell)],
        }
    }

    /// Resolved binning spec, when binning is active.
    #[must_use]
    pub fn binning_spec(&self) -> Option<BinningSpec> {
        match self.binning {
            PivotBinning::On(spec) => Some(spec),
            _ => None,
        }
    }
}

/// Strand rows and their aggregate inputs, row-aligned.
#[derive(Debug, Clone)]
pub struct Strands {
    depth: usize,
    table: Table,
    aggregates: Table,
}

impl Strands {
    pub fn new(
        pivot_dtypes: &[DType],
        sort_dtypes: &[DType],
        pkey_dtype: DType,
        inputs: &[(String, DType)],
    ) -> Result<Self, StrandError> {
        if pivot_dtypes.len() != sort_dtypes.len() {
            return Err(StrandError::InvariantViolation(
                "pivot and sort dtypes differ in length".to_owned(),
            ));
        }
        let mut fields = Vec::with_capacity(pivot_dtypes.len() * 2 + 2);
        for (idx, dtype) in pivot_dtypes.iter().enumerate() {
            fields.push(Field::new(pivot_column(idx + 1), *dtype));
        }
        for (idx, dtype) in sort_dtypes.iter().enumerate() {
            fields.push(Field::new(sort_column(idx + 1), *dtype));
        }
        fields.push(Field::new(PKEY_COLUMN, pkey_dtype));
        fields.push(Field::new(STRAND_COUNT_COLUMN, DType::Int64));

        let mut agg_fields: Vec<Field> = inputs
            .iter()
            .map(|(name, dtype)| Field::new(name.clone(), *dtype))
            .collect();
        agg_fields.push(Field::new(PKEY_COLUMN, pkey_dtype));

        Ok(Self {
            depth: pivot_dtypes.len(),
            table: Table::new(Schema::new(fields)?),
            aggregates: Table::new(Schema::new(agg_fields)?),
        })
    }

    pub fn push(
        &mut self,
        mut pivots: Vec<ScalarValue>,
        sorts: Vec<ScalarValue>,
        pkey: ScalarValue,
        count: i64,
        mut inputs: Vec<ScalarValue>,
    ) -> Result<(), StrandError> {
        pivots.extend(sorts);
        pivots.push(pkey.clone());
        pivots.push(ScalarValue::int64(count));
        self.table.push_row(pivots)?;
        inputs.push(pkey);
        self.aggregates.push_row(inputs)?;
        Ok(())
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    #[must_use]
    pub fn aggregates(&self) -> &Table {
        &self.aggregates
    }

    /// Pivot value at one-based `level`.
    #[must_use]
    pub fn pivot_value(&self, row: usize, level: usize) -> ScalarValue {
        self.table
            .column_at(level - 1)
            .map_or_else(ScalarValue::none, |column| column.get_scalar(row))
    }

    #[must_use]
    pub fn sort_value(&self, row: usize, level: usize) -> ScalarValue {
        self.table
            .column_at(self.depth + level - 1)
            .map_or_else(ScalarValue::none, |column| column.get_scalar(row))
    }

    #[must_use]
    pub fn pkey(&self, row: usize) -> ScalarValue {
        self.table.get(row, PKEY_COLUMN)
    }

    #[must_use]
    pub fn count(&self, row: usize) -> i64 {
        self.table.get(row, STRAND_COUNT_COLUMN).to_i64().unwrap_or(0)
    }

    #[must_use]
    pub fn net_count(&self) -> i64 {
        (0..self.len()).map(|row| self.count(row)).sum()
    }
}

/// Builds strands for one pivot configuration over one store.
#[derive(Debug, Clone)]
pub struct StrandBuilder {
    pivots: Vec<ResolvedPivot>,
    inputs: Vec<(String, DType)>,
    filter: RowFilter,
    pkey_dtype: DType,
}

impl StrandBuilder {
    /// Binds `config` to the store schema and derives automatic binnings
    /// from the current store contents.
    pub fn new(config: &PivotConfig, store: &CanonicalStore) -> Result<Self, StrandError> {
        let schema = store.schema();
        let pkey_dtype = schema.dtype(PKEY_COLUMN).ok_or_else(|| {
            StrandError::InvariantViolation("store has no primary key column".to_owned())
        })?;

        let pivots = config
            .pivots()
            .enumerate()
            .map(|(idx, spec)| ResolvedPivot::resolve(idx + 1, spec, store))
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = BTreeSet::new();
        let mut inputs = Vec::new();
        for agg in &config.aggregates {
            if agg.kind.is_composite() {
                continue;
            }
            for dependency in &agg.dependencies {
                let dtype = schema.dtype(dependency).ok_or_else(|| {
                    StrandError::InvariantViolation(format!(
                        "aggregate {} depends on missing column {dependency}",
                        agg.name
                    ))
                })?;
                if seen.insert(dependency.clone()) {
                    inputs.push((dependency.clone(), dtype));
                }
            }
        }

        let search_defaults: Vec<String> = pivots.iter().map(|p| p.column.clone()).collect();
        let filter = RowFilter::new(&config.filters, &config.search, schema, &search_defaults);

        Ok(Self {
            pivots,
            inputs,
            filter,
            pkey_dtype,
        })
    }

    #[must_use]
    pub fn pivots(&self) -> &[ResolvedPivot] {
        &self.pivots
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.pivots.len()
    }

    #[must_use]
    pub fn filter(&self) -> &RowFilter {
        &self.filter
    }

    /// Distinct aggregate input columns in first-use order.
    pub fn input_columns(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(name, _)| name.as_str())
    }

    /// Resolved binning per pivot; a change between cycles means existing
    /// nodes were grouped under different buckets.
    #[must_use]
    pub fn binnings(&self) -> Vec<PivotBinning> {
        self.pivots.iter().map(|pivot| pivot.binning).collect()
    }

    /// Store columns a build reads, without duplicates: the primary key,
    /// pivot and sort-by columns, aggregate inputs and filter columns.
    #[must_use]
    pub fn required_columns(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let candidates = std::iter::once(PKEY_COLUMN.to_owned())
            .chain(self.pivots.iter().map(|p| p.column.clone()))
            .chain(self.pivots.iter().filter_map(|p| p.sort_by.clone()))
            .chain(self.inputs.iter().map(|(name, _)| name.clone()))
            .chain(self.filter.columns());
        for column in candidates {
            if seen.insert(column.clone()) {
                out.push(column);
            }
        }
        out
    }

    fn empty_strands(&self) -> Result<Strands, StrandError> {
        let pivot_dtypes: Vec<DType> = self.pivots.iter().map(|p| p.dtype).collect();
        let sort_dtypes: Vec<DType> = self.pivots.iter().map(|p| p.sort_dtype).collect();
        Strands::new(&pivot_dtypes, &sort_dtypes, self.pkey_dtype, &self.inputs)
    }

    /// One `+1` strand per path of every live row passing the filters.
    pub fn build_full(&self, store: &CanonicalStore) -> Result<Strands, StrandError> {
        let names = self.required_columns();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let table = store.get_pkeyed_table(None)?.project(&names)?;
        let mut out = self.empty_strands()?;
        for row in 0..table.size() {
            let view = RowView::new(&table, row);
            if self.filter.passes(&view) {
                self.emit(&mut out, &view, 1, false)?;
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(rows = table.size(), strands = out.len(), "full strand build");
        Ok(out)
    }

    /// Strands for the rows a `ChangeSet` touched. Rows leaving the filtered
    /// set or moving to another path get a `-1` strand on the old path with
    /// negated inputs; rows entering or moving get a `+1` strand on the new
    /// path; rows that stay put get a `0` strand so their path is
    /// recomputed.
    pub fn build_delta(&self, changes: &ChangeSet) -> Result<Strands, StrandError> {
        let mut out = self.empty_strands()?;
        for row in 0..changes.len() {
            let prev = RowView::new(&changes.prev, row);
            let cur = RowView::new(&changes.current, row);
            let existed = changes.existed.get(row).copied().unwrap_or(false);
            let prev_pass = existed && self.filter.passes(&prev);

            if changes.is_delete(row) {
                if prev_pass {
                    self.emit(&mut out, &prev, -1, true)?;
                }
                continue;
            }

            let cur_pass = self.filter.passes(&cur);
            match (prev_pass, cur_pass) {
                (true, true) if self.path_changed(changes, row) => {
                    self.emit(&mut out, &prev, -1, true)?;
                    self.emit(&mut out, &cur, 1, false)?;
                }
                (true, true) => self.emit(&mut out, &cur, 0, false)?,
                (false, true) => self.emit(&mut out, &cur, 1, false)?,
                (true, false) => self.emit(&mut out, &prev, -1, true)?,
                (false, false) => {}
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(rows = changes.len(), strands = out.len(), net = out.net_count(), "delta strand build");
        Ok(out)
    }

    fn path_changed(&self, changes: &ChangeSet, row: usize) -> bool {
        self.pivots.iter().any(|pivot| {
            matches!(
                changes.transition(&pivot.column, row),
                Some(ValueTransition::NeqTF | ValueTransition::NveqFT | ValueTransition::NeqTT)
            )
        })
    }

    fn emit(
        &self,
        out: &mut Strands,
        row: &RowView<'_>,
        count: i64,
        removing: bool,
    ) -> Result<(), StrandError> {
        let pkey = row.get(PKEY_COLUMN);
        let choices: Vec<Vec<ScalarValue>> = self
            .pivots
            .iter()
            .map(|pivot| pivot.values(&row.get(&pivot.column)))
            .collect();
        let sorts: Vec<Option<ScalarValue>> = self
            .pivots
            .iter()
            .map(|pivot| pivot.sort_by.as_deref().map(|column| row.get(column)))
            .collect();
        let inputs: Vec<ScalarValue> = self
            .inputs
            .iter()
            .map(|(name, _)| {
                let value = row.get(name);
                if removing && value.is_numeric() {
                    value.negate()
                } else {
                    value
                }
            })
            .collect();

        // Odometer over the cartesian product of unnested pivot values.
        let mut cursor = vec![0usize; choices.len()];
        loop {
            let pivots: Vec<ScalarValue> = cursor
                .iter()
                .zip(&choices)
                .map(|(idx, values)| values[*idx].clone())
                .collect();
            let sort_values = pivots
                .iter()
                .zip(&sorts)
                .map(|(pivot, sort)| sort.clone().unwrap_or_else(|| pivot.clone()))
                .collect();
            out.push(pivots, sort_values, pkey.clone(), count, inputs.clone())?;

            let mut level = choices.len();
            loop {
                if level == 0 {
                    return Ok(());
                }
                level -= 1;
                cursor[level] += 1;
                if cursor[level] < choices[level].len() {
                    break;
                }
                cursor[level] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pc_columnar::{Field, Schema, Table};
    use pc_config::{AggKind, AggSpec, FilterSpec, PivotConfig, PivotSpec};
    use pc_expr::{Combiner, FilterOp, FilterTerm};
    use pc_store::{CanonicalStore, Op, delta_schema};
    use pc_types::{AggLevel, BinningKind, BinningSpec, DType, ScalarValue};

    use super::{PivotBinning, StrandBuilder, StrandError, Strands};

    pub(crate) fn strands_of<const N: usize>(rows: &[(i64, [&str; N], i64)]) -> Strands {
        let dtypes = vec![DType::Str; N];
        let mut strands = Strands::new(&dtypes, &dtypes, DType::Int64, &[]).expect("strands");
        for (pkey, path, count) in rows {
            let values: Vec<ScalarValue> = path.iter().map(|v| ScalarValue::string(*v)).collect();
            strands
                .push(values.clone(), values, ScalarValue::int64(*pkey), *count, Vec::new())
                .expect("push");
        }
        strands
    }

    fn business() -> Schema {
        Schema::new(vec![
            Field::new("region", DType::Str),
            Field::new("tags", DType::ListStr),
            Field::new("amt", DType::Int64),
            Field::new("day", DType::Date),
        ])
        .expect("schema")
    }

    fn tags(items: &[&str]) -> ScalarValue {
        ScalarValue::list(DType::ListStr, items.iter().map(|t| ScalarValue::string(*t)).collect())
            .expect("tags")
    }

    fn day(d: u32) -> ScalarValue {
        ScalarValue::date(NaiveDate::from_ymd_opt(2024, 3, d).expect("date"))
    }

    fn row(pkey: i64, op: Op, region: &str, tag_list: &[&str], amt: i64, d: u32) -> Vec<ScalarValue> {
        vec![
            ScalarValue::string(region),
            tags(tag_list),
            ScalarValue::int64(amt),
            day(d),
            ScalarValue::int64(pkey),
            op.to_scalar(),
        ]
    }

    fn delta(rows: Vec<Vec<ScalarValue>>) -> Table {
        let mut table = Table::new(delta_schema(&business(), DType::Int64).expect("schema"));
        for cells in rows {
            table.push_row(cells).expect("row");
        }
        table
    }

    fn loaded_store() -> CanonicalStore {
        let mut store = CanonicalStore::new(&business(), DType::Int64).expect("store");
        store
            .process(&delta(vec![
                row(1, Op::Insert, "US", &["a", "b"], 10, 1),
                row(2, Op::Insert, "US", &[], 5, 2),
                row(3, Op::Insert, "EU", &["a"], 7, 3),
            ]))
            .expect("load");
        store
    }

    fn config(pivots: Vec<PivotSpec>) -> PivotConfig {
        PivotConfig {
            row_pivots: pivots,
            aggregates: vec![AggSpec::new("total", AggKind::Sum, vec!["amt"])],
            ..PivotConfig::default()
        }
    }

    #[test]
    fn full_build_unnests_lists() {
        let store = loaded_store();
        let builder = StrandBuilder::new(
            &config(vec![PivotSpec::new("region"), PivotSpec::new("tags")]),
            &store,
        )
        .expect("builder");
        let strands = builder.build_full(&store).expect("strands");
        assert_eq!(strands.depth(), 2);
        // key 1 unnests to two paths, key 2's empty list groups under null
        assert_eq!(strands.len(), 4);
        assert_eq!(strands.net_count(), 4);
        assert_eq!(strands.pivot_value(0, 2), ScalarValue::string("a"));
        assert_eq!(strands.pivot_value(1, 2), ScalarValue::string("b"));
        assert!(!strands.pivot_value(2, 2).is_valid());
        assert_eq!(strands.aggregates().get(0, "amt"), ScalarValue::int64(10));
    }

    #[test]
    fn agg_level_and_binning_transform_values() {
        let store = loaded_store();
        let pivots = vec![
            PivotSpec::new("day").with_agg_level(AggLevel::Month),
            PivotSpec::new("amt").with_binning(BinningSpec::custom(0.0, 20.0, 10.0, false)),
        ];
        let builder = StrandBuilder::new(&config(pivots), &store).expect("builder");
        assert_eq!(builder.pivots()[0].dtype, DType::Int64);
        assert_eq!(builder.pivots()[1].dtype, DType::Float64);
        let strands = builder.build_full(&store).expect("strands");
        assert_eq!(strands.pivot_value(0, 1), ScalarValue::int64(2));
        assert_eq!(strands.pivot_value(0, 2).to_f64().expect("mid"), 15.0);
        assert_eq!(strands.pivot_value(1, 2).to_f64().expect("mid"), 5.0);
    }

    #[test]
    fn degenerate_binning_leaves_values_out() {
        let store = loaded_store();
        let pivots = vec![PivotSpec::new("amt").with_binning(BinningSpec::custom(0.0, 20.0, 0.0, false))];
        let builder = StrandBuilder::new(&config(pivots), &store).expect("builder");
        assert_eq!(builder.binnings(), vec![PivotBinning::Degenerate]);
        let strands = builder.build_full(&store).expect("strands");
        assert_eq!(strands.len(), 3);
        assert!((0..3).all(|row| !strands.pivot_value(row, 1).is_valid()));
    }

    #[test]
    fn auto_binning_uses_store_range() {
        let store = loaded_store();
        let spec = BinningSpec {
            kind: BinningKind::Auto,
            ..BinningSpec::default()
        };
        let builder = StrandBuilder::new(&config(vec![PivotSpec::new("amt").with_binning(spec)]), &store)
            .expect("builder");
        let resolved = builder.pivots()[0].binning_spec().expect("resolved");
        assert_eq!((resolved.min, resolved.max), (5.0, 10.0));
        assert_eq!(resolved.size, 2.5);
    }

    #[test]
    fn filters_exclude_rows() {
        let store = loaded_store();
        let mut cfg = config(vec![PivotSpec::new("region")]);
        cfg.filters = FilterSpec {
            combiner: Combiner::And,
            terms: vec![FilterTerm::new("amt", FilterOp::GtEq, vec![ScalarValue::int64(7)])],
        };
        let builder = StrandBuilder::new(&cfg, &store).expect("builder");
        assert!(builder.required_columns().contains(&"amt".to_owned()));
        let strands = builder.build_full(&store).expect("strands");
        assert_eq!(strands.len(), 2);
    }

    #[test]
    fn delta_build_moves_paths() {
        let mut store = loaded_store();
        let cfg = config(vec![PivotSpec::new("region")]);
        let changes = store
            .process(&delta(vec![
                row(1, Op::Insert, "EU", &["a"], 10, 1),
                row(3, Op::Insert, "EU", &["a"], 8, 3),
                row(2, Op::Delete, "US", &[], 0, 2),
                row(4, Op::Insert, "US", &[], 1, 4),
            ]))
            .expect("update");
        let builder = StrandBuilder::new(&cfg, &store).expect("builder");
        let strands = builder.build_delta(&changes).expect("strands");

        let summary: Vec<(String, i64)> = (0..strands.len())
            .map(|r| (strands.pivot_value(r, 1).to_string(), strands.count(r)))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("US".to_owned(), -1),
                ("EU".to_owned(), 1),
                ("EU".to_owned(), 0),
                ("US".to_owned(), -1),
                ("US".to_owned(), 1),
            ]
        );
        assert_eq!(strands.aggregates().get(0, "amt"), ScalarValue::int64(-10));
        assert_eq!(strands.net_count(), 0);
    }

    #[test]
    fn missing_dependency_is_fatal() {
        let store = loaded_store();
        let mut cfg = config(vec![PivotSpec::new("region")]);
        cfg.aggregates = vec![AggSpec::new("x", AggKind::Sum, vec!["nope"])];
        let err = StrandBuilder::new(&cfg, &store).expect_err("missing column");
        assert!(matches!(err, StrandError::InvariantViolation(_)));
        assert!(err.is_invariant_violation());
    }
}
