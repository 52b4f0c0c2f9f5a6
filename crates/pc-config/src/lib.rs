#![forbid(unsafe_code)]

//! Strongly typed pivot configuration.
//!
//! Every group is a serde type with defaults so hosts can hand over JSON;
//! the structs themselves are the boundary and nothing here reads files.

use std::collections::BTreeSet;

use pc_expr::{Combiner, ExprError, FilterOp, FilterTerm, Formula};
use pc_types::{AggLevel, BinningSpec, DataFormat, ScalarValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotSpec {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub agg_level: AggLevel,
    #[serde(default)]
    pub binning: BinningSpec,
    #[serde(default = "default_true")]
    pub subtotal: bool,
    /// Store column whose value orders this pivot's nodes among siblings;
    /// the pivot value itself when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
}

fn default_true() -> bool {
    true
}

impl PivotSpec {
    #[must_use]
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            display_name: None,
            agg_level: AggLevel::None,
            binning: BinningSpec::default(),
            subtotal: true,
            sort_by: None,
        }
    }

    #[must_use]
    pub fn with_agg_level(mut self, level: AggLevel) -> Self {
        self.agg_level = level;
        self
    }

    #[must_use]
    pub fn with_binning(mut self, binning: BinningSpec) -> Self {
        self.binning = binning;
        self
    }

    #[must_use]
    pub fn with_sort_by(mut self, column: impl Into<String>) -> Self {
        self.sort_by = Some(column.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggKind {
    Sum,
    Mul,
    Count,
    Mean,
    WeightedMean,
    Unique,
    Any,
    Median,
    Join,
    ScaledDiv,
    ScaledAdd,
    ScaledMul,
    Dominant,
    First,
    Last,
    And,
    Or,
    LastValue,
    HighWaterMark,
    LowWaterMark,
    SumAbs,
    SumNotNull,
    MeanByCount,
    Identity,
    DistinctCount,
    DistinctLeaf,
    DistinctValues,
    PctSumParent,
    PctSumGrandTotal,
    Custom,
}

impl AggKind {
    /// Computed from sibling aggregate cells instead of store reads.
    #[must_use]
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            Self::ScaledDiv | Self::ScaledAdd | Self::ScaledMul | Self::Custom
        )
    }

    /// Minimum number of dependency columns.
    #[must_use]
    pub fn min_dependencies(self) -> usize {
        match self {
            Self::Count | Self::Custom => 0,
            Self::WeightedMean
            | Self::First
            | Self::Last
            | Self::ScaledDiv
            | Self::ScaledAdd
            | Self::ScaledMul
            | Self::MeanByCount => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
    AscendingAbs,
    DescendingAbs,
    None,
}

impl SortDirection {
    #[must_use]
    pub fn is_descending(self) -> bool {
        matches!(self, Self::Descending | Self::DescendingAbs)
    }

    #[must_use]
    pub fn is_abs(self) -> bool {
        matches!(self, Self::AscendingAbs | Self::DescendingAbs)
    }
}

/// `(output_name, kind, dependencies)` plus kind-specific parameters.
///
/// Dependencies name store columns, except for composite kinds whose
/// dependencies name sibling aggregates. `First`/`Last` take
/// `[value, sort_by]`; `WeightedMean` and `MeanByCount` take
/// `[value, weight]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggSpec {
    pub name: String,
    pub kind: AggKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub order: SortDirection,
    #[serde(default = "default_weights")]
    pub weights: [f64; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub format: DataFormat,
}

fn default_weights() -> [f64; 2] {
    [1.0, 1.0]
}

fn default_separator() -> String {
    ", ".to_owned()
}

impl AggSpec {
    #[must_use]
    pub fn new<S: Into<String>>(name: impl Into<String>, kind: AggKind, dependencies: Vec<S>) -> Self {
        Self {
            name: name.into(),
            kind,
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            order: SortDirection::Ascending,
            weights: default_weights(),
            formula: None,
            separator: default_separator(),
            format: DataFormat::None,
        }
    }

    #[must_use]
    pub fn with_order(mut self, order: SortDirection) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn with_weights(mut self, weights: [f64; 2]) -> Self {
        self.weights = weights;
        self
    }

    #[must_use]
    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    #[must_use]
    pub fn dependency(&self, idx: usize) -> Option<&str> {
        self.dependencies.get(idx).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    #[default]
    Items,
    Percent,
}

/// Ordering of the nodes at one tree depth, optionally keeping only the
/// top `limit` of each parent's children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Aggregate name ordering the nodes.
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
    /// Depth of the nodes being ordered (1 = first pivot).
    #[serde(default = "default_level")]
    pub level: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(default)]
    pub limit_kind: LimitKind,
}

fn default_level() -> usize {
    1
}

impl SortSpec {
    #[must_use]
    pub fn new(column: impl Into<String>, direction: SortDirection, level: usize) -> Self {
        Self {
            column: column.into(),
            direction,
            level,
            limit: None,
            limit_kind: LimitKind::Items,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: f64, kind: LimitKind) -> Self {
        self.limit = Some(limit);
        self.limit_kind = kind;
        self
    }

    /// Children kept out of `n` siblings, `None` when unlimited.
    #[must_use]
    pub fn keep_count(&self, n: usize) -> Option<usize> {
        let limit = self.limit?;
        if !limit.is_finite() || limit < 0.0 {
            return None;
        }
        let keep = match self.limit_kind {
            LimitKind::Items => limit as usize,
            LimitKind::Percent => ((n as f64 * limit / 100.0) as usize).max(1),
        };
        Some(keep.min(n))
    }
}

/// Row filters combined by one combiner.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub combiner: Combiner,
    #[serde(default)]
    pub terms: Vec<FilterTerm>,
}

impl FilterSpec {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    #[must_use]
    pub fn columns(&self) -> BTreeSet<&str> {
        self.terms.iter().map(|term| term.column.as_str()).collect()
    }
}

/// A predicate on an aggregate cell at one tree depth. `term.column` names
/// the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HavingTerm {
    pub level: usize,
    pub term: FilterTerm,
}

impl HavingTerm {
    #[must_use]
    pub fn new(
        level: usize,
        aggregate: impl Into<String>,
        op: FilterOp,
        operands: Vec<ScalarValue>,
    ) -> Self {
        Self {
            level,
            term: FilterTerm::new(aggregate, op, operands),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HavingSpec {
    #[serde(default)]
    pub combiner: Combiner,
    #[serde(default)]
    pub terms: Vec<HavingTerm>,
}

impl HavingSpec {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn at_level(&self, level: usize) -> impl Iterator<Item = &HavingTerm> {
        self.terms.iter().filter(move |term| term.level == level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Equals,
    StartsWith,
    #[default]
    Contains,
    Edge,
}

/// Free-text search; a row passes when any term matches any searched
/// column.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpec {
    #[serde(default)]
    pub terms: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub mode: SearchMode,
}

impl SearchSpec {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.terms.iter().any(|term| !term.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub items_per_page: usize,
    /// One-based; zero reads as the first page.
    pub page_number: usize,
}

impl Pagination {
    /// Half-open row range of the page.
    #[must_use]
    pub fn range(&self) -> (usize, usize) {
        let page = self.page_number.max(1) - 1;
        let start = page.saturating_mul(self.items_per_page);
        (start, start.saturating_add(self.items_per_page))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NanSort {
    First,
    #[default]
    Last,
}

pub const DEFAULT_GRAND_TOTAL_LABEL: &str = "Grand Aggregate";
pub const DEFAULT_DISTINCT_VALUE_CAP: usize = 1000;
pub const DEFAULT_DISTINCT_BYTE_CAP: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    pub grand_total_label: String,
    pub track_deltas: bool,
    pub nan_sort: NanSort,
    pub distinct_value_cap: usize,
    pub distinct_byte_cap: usize,
    /// Run the zero-strand pruning pass after each update.
    pub prune_zero_strands: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            grand_total_label: DEFAULT_GRAND_TOTAL_LABEL.to_owned(),
            track_deltas: false,
            nan_sort: NanSort::Last,
            distinct_value_cap: DEFAULT_DISTINCT_VALUE_CAP,
            distinct_byte_cap: DEFAULT_DISTINCT_BYTE_CAP,
            prune_zero_strands: true,
        }
    }
}

/// Everything a pivot context is configured with.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PivotConfig {
    pub row_pivots: Vec<PivotSpec>,
    pub column_pivots: Vec<PivotSpec>,
    pub aggregates: Vec<AggSpec>,
    pub filters: FilterSpec,
    pub having: HavingSpec,
    pub sort: Vec<SortSpec>,
    pub search: SearchSpec,
    pub max_rows: Option<usize>,
    pub max_columns: Option<usize>,
    pub pagination: Option<Pagination>,
    pub options: TreeOptions,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Configuration bug; the context cannot be built.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Expr(#[from] ExprError),
}

impl ConfigError {
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            Self::InvariantViolation(_) => true,
            Self::Expr(err) => err.is_invariant_violation(),
        }
    }
}

impl PivotConfig {
    /// Row pivots followed by column pivots, forming one tree path.
    pub fn pivots(&self) -> impl Iterator<Item = &PivotSpec> {
        self.row_pivots.iter().chain(self.column_pivots.iter())
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.row_pivots.len() + self.column_pivots.len()
    }

    #[must_use]
    pub fn aggregate(&self, name: &str) -> Option<&AggSpec> {
        self.aggregates.iter().find(|agg| agg.name == name)
    }

    #[must_use]
    pub fn sort_at(&self, level: usize) -> Option<&SortSpec> {
        self.sort.iter().find(|sort| sort.level == level)
    }

    /// Compiles every computed aggregate and checks composite dependencies.
    /// Aggregate dependencies on store columns are checked against the
    /// schema when the tree is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for agg in &self.aggregates {
            if !names.insert(agg.name.as_str()) {
                return Err(ConfigError::InvariantViolation(format!(
                    "aggregate {} is defined twice",
                    agg.name
                )));
            }
        }
        for agg in &self.aggregates {
            if agg.dependencies.len() < agg.kind.min_dependencies() {
                return Err(ConfigError::InvariantViolation(format!(
                    "aggregate {} of kind {:?} needs {} dependencies",
                    agg.name,
                    agg.kind,
                    agg.kind.min_dependencies()
                )));
            }
            let sibling_inputs: Vec<String> = match agg.kind {
                AggKind::Custom => {
                    let source = agg.formula.as_deref().ok_or_else(|| {
                        ConfigError::InvariantViolation(format!(
                            "computed aggregate {} has no formula",
                            agg.name
                        ))
                    })?;
                    Formula::compile(source)?.inputs().to_vec()
                }
                kind if kind.is_composite() => agg.dependencies.clone(),
                _ => Vec::new(),
            };
            for input in sibling_inputs {
                if input == agg.name || !names.contains(input.as_str()) {
                    return Err(ConfigError::InvariantViolation(format!(
                        "aggregate {} depends on unknown aggregate {input}",
                        agg.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pc_types::AggLevel;

    use super::{
        AggKind, AggSpec, ConfigError, LimitKind, Pagination, PivotConfig, PivotSpec, SortDirection,
        SortSpec, TreeOptions,
    };

    #[test]
    fn defaults_match_engine_knobs() {
        let options = TreeOptions::default();
        assert_eq!(options.grand_total_label, "Grand Aggregate");
        assert_eq!(options.distinct_value_cap, 1000);
        assert_eq!(options.distinct_byte_cap, 2 * 1024 * 1024);
    }

    #[test]
    fn deserializes_sparse_json() {
        let json = r#"{
            "row_pivots": [{"column": "region"}],
            "column_pivots": [{"column": "ts", "agg_level": "year"}],
            "aggregates": [{"name": "total", "kind": "sum", "dependencies": ["amt"]}],
            "max_rows": 100
        }"#;
        let config: PivotConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.depth(), 2);
        let pivots: Vec<&str> = config.pivots().map(PivotSpec::name).collect();
        assert_eq!(pivots, vec!["region", "ts"]);
        assert_eq!(config.column_pivots[0].agg_level, AggLevel::Year);
        assert!(config.row_pivots[0].subtotal);
        assert_eq!(config.aggregate("total").map(|a| a.kind), Some(AggKind::Sum));
        assert_eq!(config.options, TreeOptions::default());
    }

    #[test]
    fn keep_count_for_items_and_percent() {
        let items = SortSpec::new("total", SortDirection::Descending, 1).with_limit(3.0, LimitKind::Items);
        assert_eq!(items.keep_count(10), Some(3));
        assert_eq!(items.keep_count(2), Some(2));
        let pct = SortSpec::new("total", SortDirection::Descending, 1).with_limit(10.0, LimitKind::Percent);
        assert_eq!(pct.keep_count(5), Some(1));
        assert_eq!(pct.keep_count(40), Some(4));
        assert_eq!(SortSpec::new("total", SortDirection::None, 1).keep_count(5), None);
    }

    #[test]
    fn pagination_range() {
        let page = Pagination {
            items_per_page: 25,
            page_number: 3,
        };
        assert_eq!(page.range(), (50, 75));
    }

    #[test]
    fn computed_aggregate_needs_formula() {
        let config = PivotConfig {
            aggregates: vec![AggSpec::new::<String>("margin", AggKind::Custom, Vec::new())],
            ..PivotConfig::default()
        };
        let err = config.validate().expect_err("missing formula");
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn computed_aggregate_inputs_must_exist() {
        let mut config = PivotConfig {
            aggregates: vec![
                AggSpec::new("sales", AggKind::Sum, vec!["amt"]),
                AggSpec::new::<String>("ratio", AggKind::Custom, Vec::new())
                    .with_formula("sales / cost"),
            ],
            ..PivotConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvariantViolation(_))
        ));
        config
            .aggregates
            .insert(1, AggSpec::new("cost", AggKind::Sum, vec!["cost"]));
        config.validate().expect("valid");
    }

    #[test]
    fn undefined_formula_function_is_fatal() {
        let config = PivotConfig {
            aggregates: vec![
                AggSpec::new("sales", AggKind::Sum, vec!["amt"]),
                AggSpec::new::<String>("odd", AggKind::Custom, Vec::new()).with_formula("nope(sales)"),
            ],
            ..PivotConfig::default()
        };
        let err = config.validate().expect_err("undefined function");
        assert!(err.is_invariant_violation());
    }
}
