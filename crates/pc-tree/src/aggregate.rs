use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use pc_columnar::{Field, Schema};
use pc_config::{AggKind, AggSpec, PivotConfig, SortDirection};
use pc_expr::Formula;
use pc_store::CanonicalStore;
use pc_strand::Strands;
use pc_types::{DType, ScalarValue};
use serde::{Deserialize, Serialize};

use crate::TreeError;

/// Which cap cut a distinct-values cell short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    Values,
    Size,
    Both,
}

/// Advisory flags surfaced next to an aggregate cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CellFlags {
    pub truncation: Option<Truncation>,
    /// Some input cell carried an error status.
    pub has_errors: bool,
}

impl CellFlags {
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.truncation.is_none() && !self.has_errors
    }
}

/// One aggregate bound to the store schema.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAggregate {
    pub spec: AggSpec,
    /// Dtype of the first dependency in the store; `None` for composites.
    pub input_dtype: DType,
    /// Dtype of the aggregate-table column.
    pub dtype: DType,
    formula: Option<Formula>,
    siblings: Vec<usize>,
}

impl PlannedAggregate {
    #[must_use]
    pub fn kind(&self) -> AggKind {
        self.spec.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Stored as a sum and shown as a percentage on read.
    #[must_use]
    pub fn is_percentage(&self) -> bool {
        matches!(
            self.spec.kind,
            AggKind::PctSumParent | AggKind::PctSumGrandTotal
        )
    }

    /// Fed from strand inputs rather than store reads.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        matches!(
            self.spec.kind,
            AggKind::LastValue | AggKind::HighWaterMark | AggKind::LowWaterMark
        )
    }
}

/// The configured aggregates in evaluation order: store-reading kinds in
/// configuration order, then composites once their inputs are computed.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePlan {
    aggregates: Vec<PlannedAggregate>,
    order: Vec<usize>,
}

impl AggregatePlan {
    pub fn new(config: &PivotConfig, schema: &Schema) -> Result<Self, TreeError> {
        config.validate()?;
        let positions: HashMap<&str, usize> = config
            .aggregates
            .iter()
            .enumerate()
            .map(|(idx, agg)| (agg.name.as_str(), idx))
            .collect();

        let mut aggregates = Vec::with_capacity(config.aggregates.len());
        for spec in &config.aggregates {
            let (input_dtype, formula, siblings) = if spec.kind.is_composite() {
                let formula = match (&spec.kind, &spec.formula) {
                    (AggKind::Custom, Some(source)) => Some(Formula::compile(source)?),
                    _ => None,
                };
                let names: Vec<String> = match &formula {
                    Some(formula) => formula.inputs().to_vec(),
                    None => spec.dependencies.clone(),
                };
                let siblings = names
                    .iter()
                    .map(|name| {
                        positions.get(name.as_str()).copied().ok_or_else(|| {
                            TreeError::InvariantViolation(format!(
                                "aggregate {} depends on unknown aggregate {name}",
                                spec.name
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                (DType::None, formula, siblings)
            } else {
                for dependency in &spec.dependencies {
                    if !schema.has_column(dependency) {
                        return Err(TreeError::InvariantViolation(format!(
                            "aggregate {} depends on missing column {dependency}",
                            spec.name
                        )));
                    }
                }
                let input = spec
                    .dependency(0)
                    .and_then(|name| schema.dtype(name))
                    .unwrap_or(DType::None);
                (input, None, Vec::new())
            };
            aggregates.push(PlannedAggregate {
                spec: spec.clone(),
                input_dtype,
                dtype: output_dtype(spec.kind, input_dtype),
                formula,
                siblings,
            });
        }

        let order = evaluation_order(&aggregates)?;
        Ok(Self { aggregates, order })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&PlannedAggregate> {
        self.aggregates.get(idx)
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.aggregates.iter().position(|agg| agg.spec.name == name)
    }

    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlannedAggregate> {
        self.aggregates.iter()
    }

    /// Schema of the aggregate table, one column per aggregate.
    pub fn schema(&self) -> Result<Schema, TreeError> {
        let fields = self
            .aggregates
            .iter()
            .map(|agg| Field::new(agg.spec.name.clone(), agg.dtype))
            .collect();
        Ok(Schema::new(fields)?)
    }
}

/// Column dtype of an aggregate over an input of dtype `input`.
#[must_use]
pub fn output_dtype(kind: AggKind, input: DType) -> DType {
    match kind {
        AggKind::Count | AggKind::DistinctCount => DType::Int64,
        AggKind::Mean
        | AggKind::WeightedMean
        | AggKind::MeanByCount
        | AggKind::ScaledDiv
        | AggKind::ScaledAdd
        | AggKind::ScaledMul
        | AggKind::Custom => DType::Float64,
        AggKind::Sum
        | AggKind::SumAbs
        | AggKind::SumNotNull
        | AggKind::Mul
        | AggKind::PctSumParent
        | AggKind::PctSumGrandTotal => {
            if input.is_integer() {
                DType::Int64
            } else {
                DType::Float64
            }
        }
        AggKind::Join => DType::Str,
        AggKind::And => DType::Bool,
        AggKind::DistinctValues => distinct_list_dtype(input),
        AggKind::Unique
        | AggKind::Any
        | AggKind::Or
        | AggKind::Median
        | AggKind::Dominant
        | AggKind::First
        | AggKind::Last
        | AggKind::LastValue
        | AggKind::HighWaterMark
        | AggKind::LowWaterMark
        | AggKind::Identity
        | AggKind::DistinctLeaf => input,
    }
}

fn distinct_list_dtype(input: DType) -> DType {
    if input.is_list() {
        return input;
    }
    if let Some(list) = input.list_dtype() {
        return list;
    }
    if input.is_integer() {
        DType::ListInt64
    } else if input.is_numeric() {
        DType::ListFloat64
    } else {
        DType::ListStr
    }
}

fn evaluation_order(aggregates: &[PlannedAggregate]) -> Result<Vec<usize>, TreeError> {
    let mut order: Vec<usize> = (0..aggregates.len())
        .filter(|idx| !aggregates[*idx].spec.kind.is_composite())
        .collect();
    let mut placed: BTreeSet<usize> = order.iter().copied().collect();
    let mut pending: Vec<usize> = (0..aggregates.len())
        .filter(|idx| !placed.contains(idx))
        .collect();
    // Custom formulas go after the scaled kinds they may read.
    pending.sort_by_key(|idx| aggregates[*idx].spec.kind == AggKind::Custom);

    while !pending.is_empty() {
        let before = pending.len();
        pending.retain(|idx| {
            let ready = aggregates[*idx]
                .siblings
                .iter()
                .all(|sibling| placed.contains(sibling));
            if ready {
                order.push(*idx);
                placed.insert(*idx);
            }
            !ready
        });
        if pending.len() == before {
            let names: Vec<&str> = pending
                .iter()
                .map(|idx| aggregates[*idx].spec.name.as_str())
                .collect();
            return Err(TreeError::InvariantViolation(format!(
                "computed aggregates depend on each other: {}",
                names.join(", ")
            )));
        }
    }
    Ok(order)
}

/// Strand rows a node received this cycle, for the streaming kinds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StrandFeed<'a> {
    pub strands: &'a Strands,
    pub rows: &'a [usize],
}

impl StrandFeed<'_> {
    /// Inputs of the non-removing strands, in strand order.
    fn values(&self, column: &str) -> Vec<ScalarValue> {
        let Some(inputs) = self.strands.aggregates().column(column) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter(|row| self.strands.count(**row) >= 0)
            .map(|row| inputs.get_scalar(*row))
            .collect()
    }
}

/// Everything one node's recompute reads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeInputs<'a> {
    pub store: &'a CanonicalStore,
    pub pkeys: &'a [ScalarValue],
    pub is_leaf: bool,
    pub feed: Option<StrandFeed<'a>>,
    /// The node's aggregate row; earlier columns in evaluation order are
    /// already recomputed.
    pub row: &'a [ScalarValue],
    pub value_cap: usize,
    pub byte_cap: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Computed {
    pub value: ScalarValue,
    pub flags: CellFlags,
}

impl Computed {
    fn plain(value: ScalarValue) -> Self {
        Self {
            value,
            flags: CellFlags::default(),
        }
    }
}

/// Recomputes column `col` of a node from the full key set under it.
pub(crate) fn compute(
    plan: &AggregatePlan,
    col: usize,
    inputs: &NodeInputs<'_>,
) -> Result<Computed, TreeError> {
    let agg = plan.get(col).ok_or_else(|| {
        TreeError::InvariantViolation(format!("aggregate column {col} out of range"))
    })?;
    let dtype = agg.dtype;
    let existing = inputs
        .row
        .get(col)
        .cloned()
        .unwrap_or_else(|| ScalarValue::null(dtype));

    if agg.spec.kind.is_composite() {
        return composite(agg, inputs.row);
    }
    if inputs.pkeys.is_empty() {
        return Ok(Computed::plain(ScalarValue::null(dtype)));
    }
    if agg.is_streaming() {
        return Ok(Computed::plain(streaming(agg, inputs, existing)));
    }

    let store = inputs.store;
    let pkeys = inputs.pkeys;
    let Some(dep0) = agg.spec.dependency(0) else {
        // Count without a dependency counts the keys.
        return Ok(Computed::plain(ScalarValue::int64(
            store.get_pkeys_idx(pkeys).len() as i64,
        )));
    };

    match agg.spec.kind {
        AggKind::First | AggKind::Last | AggKind::WeightedMean | AggKind::MeanByCount => {
            let dep1 = agg.spec.dependency(1).ok_or_else(|| {
                TreeError::InvariantViolation(format!(
                    "aggregate {} needs a second dependency",
                    agg.spec.name
                ))
            })?;
            let values = store.read_column_aligned(dep0, pkeys)?;
            let others = store.read_column_aligned(dep1, pkeys)?;
            let value = match agg.spec.kind {
                AggKind::WeightedMean => ratio_of_sums(&values, &others, true),
                AggKind::MeanByCount => ratio_of_sums(&values, &others, false),
                kind => first_last(&values, &others, kind, agg.spec.order, dtype),
            };
            return Ok(Computed {
                value,
                flags: error_flags(values.iter().chain(others.iter())),
            });
        }
        AggKind::Unique | AggKind::Identity | AggKind::DistinctLeaf => {
            let (unique, value) = store.is_unique(pkeys, dep0)?;
            let leaf_ok = agg.spec.kind != AggKind::DistinctLeaf || inputs.is_leaf;
            let value = if unique && leaf_ok {
                value
            } else {
                match (agg.spec.kind, dtype) {
                    (AggKind::Unique, DType::Str) => ScalarValue::string("-"),
                    (AggKind::DistinctLeaf, DType::Str) => ScalarValue::string(""),
                    _ => ScalarValue::null(dtype),
                }
            };
            return Ok(Computed::plain(value));
        }
        AggKind::Any | AggKind::Or => {
            let first = store.apply(pkeys, dep0, |cell| {
                (cell.is_valid() && cell.truthy()).then(|| cell.clone())
            })?;
            let value = match first {
                Some(value) => value,
                None => store.reduce(pkeys, dep0, |values| {
                    values
                        .iter()
                        .rev()
                        .find(|value| value.is_valid())
                        .cloned()
                        .unwrap_or_else(|| ScalarValue::null(dtype))
                })?,
            };
            return Ok(Computed::plain(value));
        }
        _ => {}
    }

    let values = store.read_column(dep0, pkeys)?;
    let mut flags = error_flags(values.iter());
    let valid = || values.iter().filter(|value| value.is_valid());

    let value = match agg.spec.kind {
        AggKind::Sum | AggKind::PctSumParent | AggKind::PctSumGrandTotal => {
            sum(valid().cloned(), dtype)
        }
        AggKind::SumAbs => sum(valid().map(ScalarValue::abs), dtype),
        AggKind::SumNotNull => sum(valid().filter(|value| !value.is_nan()).cloned(), dtype),
        AggKind::Mul => product(valid(), dtype),
        AggKind::Count => ScalarValue::int64(values.len() as i64),
        AggKind::Mean => {
            let numbers: Vec<f64> = valid()
                .filter_map(|value| value.to_f64().ok())
                .filter(|value| !value.is_nan())
                .collect();
            if numbers.is_empty() {
                ScalarValue::null(DType::Float64)
            } else {
                ScalarValue::float64(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggKind::And => ScalarValue::boolean(valid().all(ScalarValue::truthy)),
        AggKind::Median => {
            let mut sorted: Vec<&ScalarValue> = valid().collect();
            sorted.sort();
            sorted
                .get(sorted.len() / 2)
                .map_or_else(|| ScalarValue::null(dtype), |value| (*value).clone())
        }
        AggKind::Dominant => dominant(valid().cloned().collect())
            .unwrap_or_else(|| ScalarValue::null(dtype)),
        AggKind::Join => {
            let distinct: BTreeSet<&ScalarValue> = valid().collect();
            let parts: Vec<String> = distinct.iter().map(ToString::to_string).collect();
            ScalarValue::string(parts.join(&agg.spec.separator))
        }
        AggKind::DistinctCount => {
            let distinct: BTreeSet<&ScalarValue> = valid().collect();
            ScalarValue::int64(distinct.len() as i64)
        }
        AggKind::DistinctValues => {
            let (value, truncation) =
                distinct_values(valid(), dtype, inputs.value_cap, inputs.byte_cap)?;
            flags.truncation = truncation;
            value
        }
        kind => {
            return Err(TreeError::InvariantViolation(format!(
                "aggregate kind {kind:?} reached the store reduction dispatch"
            )));
        }
    };
    Ok(Computed { value, flags })
}

fn error_flags<'a>(mut values: impl Iterator<Item = &'a ScalarValue>) -> CellFlags {
    CellFlags {
        truncation: None,
        has_errors: values.any(ScalarValue::is_error),
    }
}

fn sum(values: impl Iterator<Item = ScalarValue>, dtype: DType) -> ScalarValue {
    if dtype.is_integer() {
        let total = values
            .filter_map(|value| value.to_i64().ok())
            .fold(0_i64, i64::wrapping_add);
        ScalarValue::int64(total)
    } else {
        let total: f64 = values.filter_map(|value| value.to_f64().ok()).sum();
        ScalarValue::float64(total)
    }
}

fn product<'a>(values: impl Iterator<Item = &'a ScalarValue>, dtype: DType) -> ScalarValue {
    if dtype.is_integer() {
        let total = values
            .filter_map(|value| value.to_i64().ok())
            .fold(1_i64, i64::wrapping_mul);
        ScalarValue::int64(total)
    } else {
        let total: f64 = values.filter_map(|value| value.to_f64().ok()).product();
        ScalarValue::float64(total)
    }
}

/// `Σ v·w / Σ w` when `weighted`, else `Σ v / Σ c`, over pairs where both
/// sides are valid numbers.
fn ratio_of_sums(values: &[ScalarValue], others: &[ScalarValue], weighted: bool) -> ScalarValue {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (value, other) in values.iter().zip(others) {
        let (Ok(v), Ok(w)) = (value.to_f64(), other.to_f64()) else {
            continue;
        };
        if !value.is_valid() || !other.is_valid() || v.is_nan() || w.is_nan() {
            continue;
        }
        numerator += if weighted { v * w } else { v };
        denominator += w;
    }
    if denominator == 0.0 {
        ScalarValue::null(DType::Float64)
    } else {
        ScalarValue::float64(numerator / denominator)
    }
}

/// Value paired with the extreme valid sort key. `First` takes the
/// smallest key in ascending order and `Last` the largest; descending
/// orders swap the two. Ties keep the earliest key in scan order.
fn first_last(
    values: &[ScalarValue],
    sort_keys: &[ScalarValue],
    kind: AggKind,
    order: SortDirection,
    dtype: DType,
) -> ScalarValue {
    let want_smallest = (kind == AggKind::First) != order.is_descending();
    let mut best: Option<usize> = None;
    for (idx, key) in sort_keys.iter().enumerate() {
        if !key.is_valid() {
            continue;
        }
        let better = match best {
            None => true,
            Some(current) => {
                let ordering = compare_keys(key, &sort_keys[current], order.is_abs());
                if want_smallest {
                    ordering == Ordering::Less
                } else {
                    ordering == Ordering::Greater
                }
            }
        };
        if better {
            best = Some(idx);
        }
    }
    best.and_then(|idx| values.get(idx).cloned())
        .unwrap_or_else(|| ScalarValue::null(dtype))
}

fn compare_keys(a: &ScalarValue, b: &ScalarValue, abs: bool) -> Ordering {
    if abs && a.is_numeric() && b.is_numeric() {
        let (a, b) = (a.abs(), b.abs());
        return a.compare(&b).unwrap_or_else(|| a.cmp(&b));
    }
    a.compare(b).unwrap_or_else(|| a.cmp(b))
}

/// Most frequent value; ties go to the smallest.
fn dominant(mut values: Vec<ScalarValue>) -> Option<ScalarValue> {
    values.sort();
    let mut best: Option<(usize, usize)> = None;
    let mut start = 0;
    while start < values.len() {
        let end = values[start..]
            .iter()
            .position(|value| *value != values[start])
            .map_or(values.len(), |offset| start + offset);
        if best.is_none_or(|(_, count)| end - start > count) {
            best = Some((start, end - start));
        }
        start = end;
    }
    best.map(|(idx, _)| values[idx].clone())
}

/// Sorted distinct values as one list cell, stopping once `value_cap` values
/// or `byte_cap` bytes of text have been taken. The value that fills a cap is
/// kept and the cell is flagged.
fn distinct_values<'a>(
    values: impl Iterator<Item = &'a ScalarValue>,
    dtype: DType,
    value_cap: usize,
    byte_cap: usize,
) -> Result<(ScalarValue, Option<Truncation>), TreeError> {
    let element = dtype.element_dtype().ok_or_else(|| {
        TreeError::InvariantViolation(format!("distinct values stored in non-list dtype {dtype:?}"))
    })?;
    let mut distinct = BTreeSet::new();
    for value in values {
        match value.as_list() {
            Some(items) => distinct.extend(items.iter().cloned()),
            None => {
                distinct.insert(value.clone());
            }
        }
    }

    let mut out = Vec::new();
    let mut bytes = 0usize;
    let mut hit_values = false;
    let mut hit_bytes = false;
    for value in distinct {
        let element_value = if element == DType::Str && !value.is_str() {
            ScalarValue::string(value.to_string())
        } else if value.is_numeric() && element.is_numeric() {
            value.coerce_numeric(element)
        } else {
            value
        };
        if element_value.dtype() != element || !element_value.is_valid() {
            continue;
        }
        bytes += element_value.as_str().map_or(0, str::len);
        out.push(element_value);
        // A cap is reached as soon as the pushed value fills it.
        hit_values = out.len() >= value_cap;
        hit_bytes = bytes >= byte_cap;
        if hit_values || hit_bytes {
            break;
        }
    }

    let truncation = match (hit_values, hit_bytes) {
        (true, true) => Some(Truncation::Both),
        (true, false) => Some(Truncation::Values),
        (false, true) => Some(Truncation::Size),
        (false, false) => None,
    };
    Ok((ScalarValue::list(dtype, out)?, truncation))
}

fn streaming(agg: &PlannedAggregate, inputs: &NodeInputs<'_>, existing: ScalarValue) -> ScalarValue {
    let (Some(feed), Some(dep0)) = (inputs.feed, agg.spec.dependency(0)) else {
        return existing;
    };
    let fresh: Vec<ScalarValue> = feed
        .values(dep0)
        .into_iter()
        .filter(ScalarValue::is_valid)
        .collect();
    match agg.spec.kind {
        AggKind::LastValue => fresh.last().cloned().unwrap_or(existing),
        AggKind::HighWaterMark => fresh.into_iter().fold(existing, |acc, value| {
            if !acc.is_valid() || value.gt(&acc) { value } else { acc }
        }),
        AggKind::LowWaterMark => fresh.into_iter().fold(existing, |acc, value| {
            if !acc.is_valid() || value.lt(&acc) { value } else { acc }
        }),
        _ => existing,
    }
}

fn composite(agg: &PlannedAggregate, row: &[ScalarValue]) -> Result<Computed, TreeError> {
    let sibling = |pos: usize| -> ScalarValue {
        agg.siblings
            .get(pos)
            .and_then(|idx| row.get(*idx))
            .cloned()
            .unwrap_or_else(ScalarValue::none)
    };

    if let Some(formula) = &agg.formula {
        let names = formula.inputs();
        let env: HashMap<&str, ScalarValue> = names
            .iter()
            .enumerate()
            .map(|(pos, name)| (name.as_str(), sibling(pos)))
            .collect();
        let value = match formula.evaluate(|name| env.get(name).cloned()) {
            Ok(value) if value.is_numeric() => value.coerce_numeric(DType::Float64),
            Ok(value) if !value.is_valid() => ScalarValue::null(DType::Float64),
            Ok(value) => ScalarValue::error(
                DType::Float64,
                format!("formula produced {:?}", value.dtype()),
            ),
            Err(err) if err.is_invariant_violation() => return Err(err.into()),
            Err(err) => ScalarValue::error(DType::Float64, err.to_string()),
        };
        let has_errors = value.is_error();
        return Ok(Computed {
            value,
            flags: CellFlags {
                truncation: None,
                has_errors,
            },
        });
    }

    let [w1, w2] = agg.spec.weights;
    let value = match (sibling(0).to_f64(), sibling(1).to_f64()) {
        (Ok(a), Ok(b)) if sibling(0).is_valid() && sibling(1).is_valid() => {
            let (a, b) = (a * w1, b * w2);
            match agg.spec.kind {
                AggKind::ScaledDiv if b == 0.0 => ScalarValue::null(DType::Float64),
                AggKind::ScaledDiv => ScalarValue::float64(a / b),
                AggKind::ScaledAdd => ScalarValue::float64(a + b),
                AggKind::ScaledMul => ScalarValue::float64(a * b),
                kind => {
                    return Err(TreeError::InvariantViolation(format!(
                        "aggregate kind {kind:?} is not a scaled composite"
                    )));
                }
            }
        }
        _ => ScalarValue::null(DType::Float64),
    };
    Ok(Computed::plain(value))
}
