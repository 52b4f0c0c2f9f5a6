#![forbid(unsafe_code)]

//! Incremental OLAP pivot engine.
//!
//! A [`PivotEngine`] owns one canonical store and any number of pivot
//! contexts. Each [`PivotEngine::update`] absorbs a delta batch into the
//! store and then runs one cycle per context: strands are derived from the
//! changed rows, the tree shape is updated from their digest, touched
//! aggregates are recomputed from the store, and the having/limit pass
//! decides which rows are visible.

mod view;

use std::sync::Arc;

use pc_columnar::ColumnError;
use pc_store::{ChangeSet, StoreError, build_input};
use pc_strand::{PivotBinning, StrandBuilder, StrandDigest, StrandError};
use pc_tree::TreeError;
use pc_types::SymbolTable;
use thiserror::Error;

pub use pc_columnar::{Field, Mask, Schema, Table};
pub use pc_config::{
    AggKind, AggSpec, FilterSpec, HavingSpec, HavingTerm, LimitKind, NanSort, Pagination,
    PivotConfig, PivotSpec, SearchMode, SearchSpec, SortDirection, SortSpec, TreeOptions,
};
pub use pc_expr::{Combiner, FilterOp, FilterTerm};
pub use pc_runtime::{
    AggregateChange, CancellationToken, CycleReport, ParallelConfig, Phase, Progress,
    ProgressChannel, ProgressSink,
};
pub use pc_store::{
    CanonicalStore, CellRead, IndexSource, OP_COLUMN, Op, PKEY_COLUMN, RowAccessor, delta_schema,
};
pub use pc_tree::{AggregationTree, CellFlags, ROOT, TreeNode, Truncation};
pub use pc_types::{AggLevel, BinningSpec, DType, ScalarValue};
pub use view::{RowHeader, ValueSink, WindowData};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Strand(#[from] StrandError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

impl EngineError {
    /// True for build or configuration bugs after which the engine must not
    /// be updated again.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            Self::Store(err) => err.is_invariant_violation(),
            Self::Strand(err) => err.is_invariant_violation(),
            Self::Tree(err) => err.is_invariant_violation(),
            Self::Column(_) => true,
        }
    }
}

/// Handle of a context inside its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

/// One pivot view over the engine's store.
#[derive(Debug, Clone)]
pub struct PivotContext {
    config: PivotConfig,
    tree: AggregationTree,
    binnings: Vec<PivotBinning>,
    /// Set when a cycle was cancelled; the next cycle rebuilds from the
    /// store since the skipped delta is gone.
    stale: bool,
    /// Per-aggregate `(min, max)` over non-root nodes, as of the last
    /// completed cycle.
    min_max: Vec<(ScalarValue, ScalarValue)>,
}

impl PivotContext {
    fn new(config: PivotConfig, store: &CanonicalStore) -> Result<Self, EngineError> {
        let tree = AggregationTree::new(&config, store.schema())?;
        Ok(Self {
            config,
            tree,
            binnings: Vec::new(),
            stale: true,
            min_max: Vec::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PivotConfig {
        &self.config
    }

    #[must_use]
    pub fn tree(&self) -> &AggregationTree {
        &self.tree
    }

    /// Whether the last cycle was cancelled and the tree lags the store.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    #[must_use]
    pub fn min_max(&self) -> &[(ScalarValue, ScalarValue)] {
        &self.min_max
    }

    /// Aggregate cell changes recorded since the last clear.
    #[must_use]
    pub fn deltas(&self) -> &[AggregateChange] {
        self.tree.get_deltas()
    }

    pub fn clear_deltas(&mut self) {
        self.tree.clear_deltas();
    }

    pub fn set_track_deltas(&mut self, enabled: bool) {
        self.config.options.track_deltas = enabled;
        self.tree.set_track_deltas(enabled);
    }

    /// Runs one cycle. With `changes` absent, or when the context is stale
    /// or a pivot's automatic binning moved, the tree is rebuilt from every
    /// live row.
    fn cycle(
        &mut self,
        store: &CanonicalStore,
        changes: Option<&ChangeSet>,
        input_rows: usize,
        progress: &ProgressChannel,
    ) -> Result<CycleReport, EngineError> {
        let mut report = CycleReport::begin(input_rows);
        let builder = StrandBuilder::new(&self.config, store)?;
        let binnings = builder.binnings();
        let strands = match changes {
            Some(changes) if !self.stale && binnings == self.binnings => {
                builder.build_delta(changes)?
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(stale = self.stale, "rebuilding pivot tree from store");
                self.tree = AggregationTree::new(&self.config, store.schema())?;
                builder.build_full(store)?
            }
        };
        self.binnings = binnings;
        report.strands = strands.len();

        let digest = StrandDigest::build(&strands);
        let deltas_before = self.tree.get_deltas().len();
        let shape = self.tree.update_shape(&digest, progress)?;
        report.nodes_created = shape.created;
        let mut outcome = shape.progress;
        if !outcome.is_cancelled() {
            outcome = self
                .tree
                .update_aggregates(&shape.records, store, &strands, progress)?;
        }
        if !outcome.is_cancelled() {
            outcome = self.tree.update_limiting_having_tree(store, progress)?;
        }
        if !outcome.is_cancelled() && self.config.options.prune_zero_strands {
            report.nodes_removed = self.tree.drop_zero_strands()?;
            if report.nodes_removed > 0 {
                self.tree.update_show_nodes();
            }
        }
        report.aggregate_changes = self.tree.get_deltas().len().saturating_sub(deltas_before);
        self.stale = outcome.is_cancelled();
        if !self.stale {
            self.min_max = (0..self.tree.plan().len())
                .map(|col| self.tree.get_min_max(col))
                .collect();
        }
        report.finish(outcome);
        #[cfg(feature = "tracing")]
        tracing::debug!(
            strands = report.strands,
            created = report.nodes_created,
            removed = report.nodes_removed,
            cancelled = outcome.is_cancelled(),
            "pivot cycle finished"
        );
        Ok(report)
    }
}

/// A canonical store plus the pivot contexts kept in step with it.
#[derive(Debug, Clone)]
pub struct PivotEngine {
    business: Schema,
    index: IndexSource,
    store: CanonicalStore,
    /// Interns host strings across `update_rows` calls.
    symbols: Arc<SymbolTable>,
    contexts: Vec<PivotContext>,
}

impl PivotEngine {
    /// Engine over `business` columns, with primary keys taken from
    /// `index`.
    pub fn new(business: Schema, index: IndexSource) -> Result<Self, EngineError> {
        let store = CanonicalStore::new(&business, index.pkey_dtype(&business))?;
        Ok(Self {
            business,
            index,
            store,
            symbols: Arc::new(SymbolTable::new()),
            contexts: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.store = self.store.with_parallel(parallel);
        self
    }

    #[must_use]
    pub fn store(&self) -> &CanonicalStore {
        &self.store
    }

    /// Schema of the delta tables `update` accepts.
    pub fn input_schema(&self) -> Result<Schema, EngineError> {
        Ok(delta_schema(&self.business, self.index.pkey_dtype(&self.business))?)
    }

    /// Adds a context and builds its tree from the rows already stored.
    pub fn add_context(&mut self, config: PivotConfig) -> Result<ContextId, EngineError> {
        let mut context = PivotContext::new(config, &self.store)?;
        context.cycle(&self.store, None, 0, &ProgressChannel::silent())?;
        self.contexts.push(context);
        Ok(ContextId(self.contexts.len() - 1))
    }

    #[must_use]
    pub fn context(&self, id: ContextId) -> Option<&PivotContext> {
        self.contexts.get(id.0)
    }

    pub fn context_mut(&mut self, id: ContextId) -> Option<&mut PivotContext> {
        self.contexts.get_mut(id.0)
    }

    #[must_use]
    pub fn contexts(&self) -> &[PivotContext] {
        &self.contexts
    }

    /// Absorbs a delta table (business columns plus `psp_pkey`/`psp_op`)
    /// and updates every context. The store always takes the whole batch;
    /// a cancelled context is left consistent but stale and catches up on
    /// its next cycle.
    pub fn update(
        &mut self,
        input: &Table,
        progress: &ProgressChannel,
    ) -> Result<Vec<CycleReport>, EngineError> {
        let changes = self.store.process(input)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(rows = input.size(), flattened = changes.len(), "delta absorbed");
        let mut reports = Vec::with_capacity(self.contexts.len());
        for context in &mut self.contexts {
            reports.push(context.cycle(&self.store, Some(&changes), input.size(), progress)?);
        }
        Ok(reports)
    }

    /// Reads host rows through `accessor` and runs [`Self::update`].
    pub fn update_rows(
        &mut self,
        accessor: &dyn RowAccessor,
        progress: &ProgressChannel,
    ) -> Result<Vec<CycleReport>, EngineError> {
        let input = build_input(accessor, &self.business, &self.index, &self.symbols)?;
        self.update(&input, progress)
    }

    /// Current rows in primary-key order, optionally restricted to store
    /// rows set in `mask`.
    pub fn export(&self, mask: Option<&Mask>) -> Result<Table, EngineError> {
        Ok(self.store.get_pkeyed_table(mask)?)
    }

    /// Whether any context's last cycle was cancelled.
    #[must_use]
    pub fn progress(&self) -> Progress {
        self.contexts
            .iter()
            .map(|context| {
                if context.stale {
                    Progress::Cancelled
                } else {
                    Progress::Completed
                }
            })
            .fold(Progress::Completed, Progress::and)
    }
}

#[cfg(test)]
mod tests {
    use pc_columnar::{Field, Schema};
    use pc_runtime::ProgressChannel;
    use pc_store::{CellRead, IndexSource, RowAccessor};
    use pc_types::{DType, ScalarValue};

    use super::{EngineError, PivotConfig, PivotEngine, PivotSpec, ROOT};
    use crate::{AggKind, AggSpec};

    struct Rows(Vec<(&'static str, i64)>);

    impl RowAccessor for Rows {
        fn row_count(&self) -> usize {
            self.0.len()
        }

        fn read(&self, row: usize, column: &str, _dtype: DType) -> CellRead {
            match (self.0.get(row), column) {
                (Some((region, _)), "region") => CellRead::Value(ScalarValue::string(*region)),
                (Some((_, amt)), "amt") => CellRead::Value(ScalarValue::int64(*amt)),
                _ => CellRead::Missing,
            }
        }
    }

    fn engine() -> PivotEngine {
        let business = Schema::new(vec![
            Field::new("region", DType::Str),
            Field::new("amt", DType::Int64),
        ])
        .expect("schema");
        PivotEngine::new(business, IndexSource::Implicit(0)).expect("engine")
    }

    #[test]
    fn host_rows_flow_through_accessor() {
        let mut engine = engine();
        let id = engine
            .add_context(PivotConfig {
                row_pivots: vec![PivotSpec::new("region")],
                aggregates: vec![AggSpec::new("total", AggKind::Sum, vec!["amt"])],
                ..PivotConfig::default()
            })
            .expect("context");
        let reports = engine
            .update_rows(&Rows(vec![("US", 10), ("US", 5), ("EU", 7)]), &ProgressChannel::silent())
            .expect("update");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].nodes_created, 2);

        let tree = engine.context(id).expect("context").tree();
        let col = tree.plan().position("total").expect("total");
        assert_eq!(tree.get_aggregate(ROOT, col), ScalarValue::int64(22));
        assert_eq!(engine.export(None).expect("export").size(), 3);
        assert_eq!(
            engine.context(id).expect("context").min_max()[col],
            (ScalarValue::int64(7), ScalarValue::int64(15))
        );
    }

    #[test]
    fn context_added_late_sees_existing_rows() {
        let mut engine = engine();
        engine
            .update_rows(&Rows(vec![("US", 1), ("EU", 2)]), &ProgressChannel::silent())
            .expect("update");
        let id = engine
            .add_context(PivotConfig {
                aggregates: vec![AggSpec::new("n", AggKind::Count, Vec::<String>::new())],
                ..PivotConfig::default()
            })
            .expect("context");
        let tree = engine.context(id).expect("context").tree();
        assert_eq!(tree.get_aggregate(ROOT, 0), ScalarValue::int64(2));
    }

    #[test]
    fn misconfigured_aggregate_is_an_invariant_violation() {
        let mut engine = engine();
        let err = engine
            .add_context(PivotConfig {
                aggregates: vec![AggSpec::new("total", AggKind::Sum, vec!["missing"])],
                ..PivotConfig::default()
            })
            .expect_err("missing column");
        assert!(matches!(err, EngineError::Tree(_) | EngineError::Strand(_)));
        assert!(err.is_invariant_violation());
    }
}
