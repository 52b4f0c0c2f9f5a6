#![forbid(unsafe_code)]

//! The aggregation tree.
//!
//! Nodes live in an arena indexed by `usize`, with node 0 the grand total.
//! Children are found through a `(parent, value)` index and a per-parent
//! list; leaves keep the primary keys under them. Each node owns one row of
//! a side aggregate table. Aggregates are always recomputed from the full
//! key set under a node, read fresh from the canonical store, so any number
//! of coalesced deltas converge on the same cells.

mod aggregate;
mod visibility;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use pc_columnar::{ColumnError, Schema, Table};
use pc_config::{
    AggKind, ConfigError, HavingSpec, NanSort, PivotConfig, SortDirection, SortSpec, TreeOptions,
};
use pc_expr::ExprError;
use pc_runtime::{AggregateChange, ChangeLedger, Phase, Progress, ProgressChannel};
use pc_store::{CanonicalStore, StoreError};
use pc_strand::{StrandDigest, Strands};
use pc_types::{DType, ScalarValue, TypeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use aggregate::{AggregatePlan, CellFlags, PlannedAggregate, Truncation, output_dtype};

use aggregate::{NodeInputs, StrandFeed};

/// Arena index of the grand-total node.
pub const ROOT: usize = 0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreeError {
    /// Configuration or build bug; the context cannot continue.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl TreeError {
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            Self::InvariantViolation(_) => true,
            Self::Config(err) => err.is_invariant_violation(),
            Self::Expr(err) => err.is_invariant_violation(),
            Self::Store(err) => err.is_invariant_violation(),
            Self::Column(err) => matches!(err, ColumnError::DTypeMismatch { .. }),
            Self::Type(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub parent: Option<usize>,
    /// Zero for the root, otherwise the pivot level the node groups.
    pub depth: usize,
    pub value: ScalarValue,
    pub sort_value: ScalarValue,
    /// Net contributing strands; zero marks the node prunable.
    pub strand_count: i64,
    pub agg_row: usize,
}

/// One node touched by a shape update, in root-first order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnificationRecord {
    pub node: usize,
    /// Strand rows that reached the node.
    pub strand_rows: Vec<usize>,
    pub agg_row: usize,
    pub net_delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeUpdate {
    pub records: Vec<UnificationRecord>,
    pub created: usize,
    pub zeroed: usize,
    pub progress: Progress,
}

#[derive(Debug, Clone)]
pub struct AggregationTree {
    depth: usize,
    nodes: Vec<Option<TreeNode>>,
    free_nodes: BTreeSet<usize>,
    children: HashMap<(usize, ScalarValue), usize>,
    by_parent: HashMap<usize, Vec<usize>>,
    zero_nodes: BTreeSet<usize>,
    leaf_pkeys: HashMap<usize, BTreeMap<ScalarValue, i64>>,
    plan: AggregatePlan,
    aggregates: Table,
    free_rows: BTreeSet<usize>,
    flags: HashMap<(usize, usize), CellFlags>,
    ledger: ChangeLedger,
    options: TreeOptions,
    sort: Vec<SortSpec>,
    having: HavingSpec,
    hidden_nodes: BTreeSet<usize>,
    hidden_pkeys: BTreeSet<ScalarValue>,
    restricted: BTreeSet<usize>,
    shown: Vec<bool>,
}

impl AggregationTree {
    /// Empty tree holding only the grand-total node. Aggregate dependencies
    /// are checked against `schema`, the store's.
    pub fn new(config: &PivotConfig, schema: &Schema) -> Result<Self, TreeError> {
        let plan = AggregatePlan::new(config, schema)?;
        let mut aggregates = Table::new(plan.schema()?);
        aggregates.extend_to(1);
        let root = TreeNode {
            parent: None,
            depth: 0,
            value: ScalarValue::string(config.options.grand_total_label.as_str()),
            sort_value: ScalarValue::none(),
            strand_count: 0,
            agg_row: 0,
        };
        Ok(Self {
            depth: config.depth(),
            nodes: vec![Some(root)],
            free_nodes: BTreeSet::new(),
            children: HashMap::new(),
            by_parent: HashMap::new(),
            zero_nodes: BTreeSet::new(),
            leaf_pkeys: HashMap::new(),
            plan,
            aggregates,
            free_rows: BTreeSet::new(),
            flags: HashMap::new(),
            ledger: ChangeLedger::new(config.options.track_deltas),
            options: config.options.clone(),
            sort: config.sort.clone(),
            having: config.having.clone(),
            hidden_nodes: BTreeSet::new(),
            hidden_pkeys: BTreeSet::new(),
            restricted: BTreeSet::new(),
            shown: vec![true],
        })
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn plan(&self) -> &AggregatePlan {
        &self.plan
    }

    #[must_use]
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Live node count, root included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.nodes.len() - self.free_nodes.len()
    }

    #[must_use]
    pub fn node(&self, idx: usize) -> Option<&TreeNode> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn is_leaf(&self, idx: usize) -> bool {
        self.node(idx).is_some_and(|node| node.depth == self.depth)
    }

    /// Nodes whose strand count dropped to zero and are not pruned yet.
    #[must_use]
    pub fn zero_nodes(&self) -> &BTreeSet<usize> {
        &self.zero_nodes
    }

    /// Applies one strand digest: adds net counts along existing paths,
    /// creates nodes for new paths with positive net count, and zeroes the
    /// subtree of every node whose count reaches zero.
    pub fn update_shape(
        &mut self,
        digest: &StrandDigest,
        progress: &ProgressChannel,
    ) -> Result<ShapeUpdate, TreeError> {
        if digest.depth() != self.depth {
            return Err(TreeError::InvariantViolation(format!(
                "strand digest of depth {} applied to a tree of depth {}",
                digest.depth(),
                self.depth
            )));
        }
        let mut tracker = progress.phase(Phase::ShapeUpdate, digest.len());
        let mut outcome = Progress::Completed;
        let mut mapped: Vec<Option<usize>> = vec![None; digest.len()];
        let mut records = Vec::new();
        let mut created = 0;

        for didx in digest.dfs() {
            let Some(dnode) = digest.get(didx) else {
                continue;
            };
            let target = match dnode.parent {
                None => Some(ROOT),
                Some(dparent) => match mapped.get(dparent).copied().flatten() {
                    None => None,
                    Some(parent) => match self.children.get(&(parent, dnode.value.clone())) {
                        Some(existing) => Some(*existing),
                        None if dnode.net_count > 0 => {
                            created += 1;
                            Some(self.alloc_node(
                                parent,
                                dnode.depth,
                                dnode.value.clone(),
                                dnode.sort_value.clone(),
                            ))
                        }
                        None => None,
                    },
                },
            };

            if let Some(idx) = target {
                mapped[didx] = Some(idx);
                let Some(node) = self.nodes.get_mut(idx).and_then(Option::as_mut) else {
                    continue;
                };
                node.strand_count += dnode.net_count;
                if !dnode.sort_value.is_none() && dnode.net_count >= 0 {
                    node.sort_value = dnode.sort_value.clone();
                }
                let agg_row = node.agg_row;
                if dnode.depth == self.depth {
                    let keys = self.leaf_pkeys.entry(idx).or_default();
                    for (pkey, net) in &dnode.pkeys {
                        let count = keys.entry(pkey.clone()).or_insert(0);
                        *count += net;
                        if *count <= 0 {
                            keys.remove(pkey);
                        }
                    }
                }
                records.push(UnificationRecord {
                    node: idx,
                    strand_rows: dnode.strand_rows.clone(),
                    agg_row,
                    net_delta: dnode.net_count,
                });
            }

            if !tracker.tick() {
                outcome = Progress::Cancelled;
                break;
            }
        }

        let zeroed = self.mark_zero_nodes(&records);
        #[cfg(feature = "tracing")]
        tracing::debug!(
            records = records.len(),
            created,
            zeroed,
            cancelled = outcome.is_cancelled(),
            "tree shape updated"
        );
        Ok(ShapeUpdate {
            records,
            created,
            zeroed,
            progress: tracker.finish(outcome),
        })
    }

    fn mark_zero_nodes(&mut self, records: &[UnificationRecord]) -> usize {
        let mut zeroed = 0;
        for record in records {
            let Some(count) = self.node(record.node).map(|node| node.strand_count) else {
                continue;
            };
            if record.node == ROOT {
                continue;
            }
            if count > 0 {
                self.zero_nodes.remove(&record.node);
                continue;
            }
            for idx in self.subtree(record.node) {
                if let Some(node) = self.nodes.get_mut(idx).and_then(Option::as_mut) {
                    node.strand_count = 0;
                }
                self.leaf_pkeys.remove(&idx);
                if self.zero_nodes.insert(idx) {
                    zeroed += 1;
                }
            }
        }
        zeroed
    }

    fn alloc_node(
        &mut self,
        parent: usize,
        depth: usize,
        value: ScalarValue,
        sort_value: ScalarValue,
    ) -> usize {
        let agg_row = match self.free_rows.pop_first() {
            Some(row) => row,
            None => {
                let row = self.aggregates.size();
                self.aggregates.extend_to(row + 1);
                row
            }
        };
        let node = TreeNode {
            parent: Some(parent),
            depth,
            value: value.clone(),
            sort_value,
            strand_count: 0,
            agg_row,
        };
        let idx = match self.free_nodes.pop_first() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        if self.shown.len() < self.nodes.len() {
            self.shown.resize(self.nodes.len(), false);
        }
        self.children.insert((parent, value), idx);
        self.by_parent.entry(parent).or_default().push(idx);
        idx
    }

    /// Recomputes every aggregate of every recorded node from the full key
    /// set under it. Records whose node has been pruned are skipped.
    pub fn update_aggregates(
        &mut self,
        records: &[UnificationRecord],
        store: &CanonicalStore,
        strands: &Strands,
        progress: &ProgressChannel,
    ) -> Result<Progress, TreeError> {
        let mut tracker = progress.phase(Phase::AggregateUpdate, records.len());
        let mut outcome = Progress::Completed;
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            if seen.insert(record.node) && self.node(record.node).is_some() {
                let pkeys = self.get_pkeys(record.node);
                let feed = StrandFeed {
                    strands,
                    rows: &record.strand_rows,
                };
                self.recompute(record.node, store, &pkeys, Some(feed))?;
            }
            if !tracker.tick() {
                outcome = Progress::Cancelled;
                break;
            }
        }
        #[cfg(feature = "tracing")]
        if outcome.is_cancelled() {
            tracing::info!(done = tracker.done(), "aggregate update cancelled");
        }
        Ok(tracker.finish(outcome))
    }

    /// Recomputes all aggregates of `node` over `pkeys`, writing changed
    /// cells and feeding the change ledger. Returns the number of changed
    /// cells.
    fn recompute(
        &mut self,
        node: usize,
        store: &CanonicalStore,
        pkeys: &[ScalarValue],
        feed: Option<StrandFeed<'_>>,
    ) -> Result<usize, TreeError> {
        let Some(agg_row) = self.node(node).map(|n| n.agg_row) else {
            return Ok(0);
        };
        let is_leaf = self.is_leaf(node);
        let mut row = self.aggregates.row(agg_row);
        let mut changed = 0;
        for position in 0..self.plan.order().len() {
            let col = self.plan.order()[position];
            let computed = aggregate::compute(
                &self.plan,
                col,
                &NodeInputs {
                    store,
                    pkeys,
                    is_leaf,
                    feed,
                    row: &row,
                    value_cap: self.options.distinct_value_cap,
                    byte_cap: self.options.distinct_byte_cap,
                },
            )?;
            let column = &mut self.aggregates.columns_mut()[col];
            let old = column.get_scalar(agg_row);
            column.set(agg_row, computed.value)?;
            let new = column.get_scalar(agg_row);
            if old != new || old.status() != new.status() {
                changed += 1;
                self.ledger.push(AggregateChange {
                    node,
                    column: col,
                    old,
                    new: new.clone(),
                });
            }
            if computed.flags.is_clear() {
                self.flags.remove(&(agg_row, col));
            } else {
                self.flags.insert((agg_row, col), computed.flags);
            }
            row[col] = new;
        }
        Ok(changed)
    }

    /// Stored cell of aggregate `col` at `node`.
    #[must_use]
    pub fn get_cell(&self, node: usize, col: usize) -> ScalarValue {
        let Some(node) = self.node(node) else {
            return ScalarValue::none();
        };
        self.aggregates
            .column_at(col)
            .map_or_else(ScalarValue::none, |column| column.get_scalar(node.agg_row))
    }

    /// Display value of aggregate `col` at `node`: the stored cell, except
    /// that percentage kinds are computed against the parent or the root.
    #[must_use]
    pub fn get_aggregate(&self, node: usize, col: usize) -> ScalarValue {
        let cell = self.get_cell(node, col);
        let Some(agg) = self.plan.get(col).filter(|agg| agg.is_percentage()) else {
            return cell;
        };
        let base = match agg.kind() {
            AggKind::PctSumParent => self
                .node(node)
                .and_then(|n| n.parent)
                .map_or_else(|| cell.clone(), |parent| self.get_cell(parent, col)),
            _ => self.get_cell(ROOT, col),
        };
        match (cell.to_f64(), base.to_f64()) {
            (Ok(part), Ok(whole)) if cell.is_valid() && base.is_valid() && whole != 0.0 => {
                ScalarValue::float64(part / whole * 100.0)
            }
            _ => ScalarValue::null(DType::Float64),
        }
    }

    #[must_use]
    pub fn cell_flags(&self, node: usize, col: usize) -> CellFlags {
        self.node(node)
            .and_then(|n| self.flags.get(&(n.agg_row, col)))
            .copied()
            .unwrap_or_default()
    }

    /// Removes every zero node and its subtree, returning aggregate rows
    /// and arena slots to their free lists. The root is never removed.
    pub fn drop_zero_strands(&mut self) -> Result<usize, TreeError> {
        let zero = std::mem::take(&mut self.zero_nodes);
        let mut removed = 0;
        for idx in zero {
            if idx == ROOT || self.node(idx).is_none() {
                continue;
            }
            let mut subtree = self.subtree(idx);
            subtree.reverse();
            for victim in subtree {
                self.remove_node(victim)?;
                removed += 1;
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(removed, "dropped zero-strand nodes");
        Ok(removed)
    }

    fn remove_node(&mut self, idx: usize) -> Result<(), TreeError> {
        let Some(node) = self.nodes.get_mut(idx).and_then(Option::take) else {
            return Ok(());
        };
        if let Some(parent) = node.parent {
            self.children.remove(&(parent, node.value));
            if let Some(siblings) = self.by_parent.get_mut(&parent) {
                siblings.retain(|child| *child != idx);
            }
        }
        self.by_parent.remove(&idx);
        self.leaf_pkeys.remove(&idx);
        self.hidden_nodes.remove(&idx);
        self.restricted.remove(&idx);
        if let Some(shown) = self.shown.get_mut(idx) {
            *shown = false;
        }
        for (col, column) in self.aggregates.columns_mut().iter_mut().enumerate() {
            column.unset(node.agg_row)?;
            self.flags.remove(&(node.agg_row, col));
        }
        self.free_rows.insert(node.agg_row);
        self.free_nodes.insert(idx);
        Ok(())
    }

    /// Direct children in insertion order.
    #[must_use]
    pub fn child_nodes(&self, parent: usize) -> &[usize] {
        self.by_parent.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `idx` followed by all its descendants, parents first.
    fn subtree(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            if self.node(current).is_none() {
                continue;
            }
            out.push(current);
            stack.extend(self.child_nodes(current).iter().rev().copied());
        }
        out
    }

    #[must_use]
    pub fn get_descendants(&self, idx: usize) -> Vec<usize> {
        let mut out = self.subtree(idx);
        if !out.is_empty() {
            out.remove(0);
        }
        out
    }

    /// Leaf nodes under `idx`, `idx` itself when it is a leaf.
    #[must_use]
    pub fn get_leaves(&self, idx: usize) -> Vec<usize> {
        self.subtree(idx)
            .into_iter()
            .filter(|node| self.is_leaf(*node))
            .collect()
    }

    /// Distinct primary keys under `idx`, in key order.
    #[must_use]
    pub fn get_pkeys(&self, idx: usize) -> Vec<ScalarValue> {
        let mut keys = BTreeSet::new();
        for leaf in self.get_leaves(idx) {
            if let Some(leaf_keys) = self.leaf_pkeys.get(&leaf) {
                keys.extend(leaf_keys.keys().cloned());
            }
        }
        keys.into_iter().collect()
    }

    /// Nodes from the root down to `idx`, both included.
    #[must_use]
    pub fn get_ancestry(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut current = self.node(idx).map(|_| idx);
        while let Some(node_idx) = current {
            out.push(node_idx);
            current = self.node(node_idx).and_then(|node| node.parent);
        }
        out.reverse();
        out
    }

    /// Pivot values from the first level down to `idx`.
    #[must_use]
    pub fn get_path(&self, idx: usize) -> Vec<ScalarValue> {
        self.get_ancestry(idx)
            .into_iter()
            .skip(1)
            .filter_map(|node| self.node(node).map(|n| n.value.clone()))
            .collect()
    }

    #[must_use]
    pub fn resolve_child(&self, parent: usize, value: &ScalarValue) -> Option<usize> {
        self.children.get(&(parent, value.clone())).copied()
    }

    /// `nth` child of `parent` in display order.
    #[must_use]
    pub fn get_child_idx(&self, parent: usize, nth: usize) -> Option<usize> {
        self.sorted_children(parent).get(nth).copied()
    }

    #[must_use]
    pub fn resolve_path(&self, path: &[ScalarValue]) -> Option<usize> {
        path.iter()
            .try_fold(ROOT, |current, value| self.resolve_child(current, value))
    }

    /// Smallest and largest valid cell of aggregate `col` over non-root
    /// nodes; both `none` when there is none.
    #[must_use]
    pub fn get_min_max(&self, col: usize) -> (ScalarValue, ScalarValue) {
        let mut min: Option<ScalarValue> = None;
        let mut max: Option<ScalarValue> = None;
        for idx in self.live_nodes().filter(|idx| *idx != ROOT) {
            let cell = self.get_aggregate(idx, col);
            if !cell.is_valid() {
                continue;
            }
            if min.as_ref().is_none_or(|m| cell.lt(m)) {
                min = Some(cell.clone());
            }
            if max.as_ref().is_none_or(|m| cell.gt(m)) {
                max = Some(cell);
            }
        }
        (
            min.unwrap_or_else(ScalarValue::none),
            max.unwrap_or_else(ScalarValue::none),
        )
    }

    #[must_use]
    pub fn get_deltas(&self) -> &[AggregateChange] {
        self.ledger.records()
    }

    pub fn clear_deltas(&mut self) {
        self.ledger.clear();
    }

    pub fn set_track_deltas(&mut self, enabled: bool) {
        self.ledger.set_enabled(enabled);
    }

    fn live_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, node)| node.as_ref().map(|_| idx))
    }

    /// Children of `parent` in display order: by the sort aggregate
    /// configured for their level, else by sort value, then by value.
    #[must_use]
    pub fn sorted_children(&self, parent: usize) -> Vec<usize> {
        let mut children = self.child_nodes(parent).to_vec();
        let level = self.node(parent).map_or(0, |node| node.depth + 1);
        let by_aggregate = self
            .sort
            .iter()
            .find(|sort| sort.level == level && sort.direction != SortDirection::None)
            .and_then(|sort| self.plan.position(&sort.column).map(|col| (col, sort.direction)));
        let nan_sort = self.options.nan_sort;
        children.sort_by(|a, b| {
            let (Some(na), Some(nb)) = (self.node(*a), self.node(*b)) else {
                return Ordering::Equal;
            };
            let primary = match by_aggregate {
                Some((col, direction)) => compare_for_sort(
                    &self.get_aggregate(*a, col),
                    &self.get_aggregate(*b, col),
                    direction,
                    nan_sort,
                ),
                None => Ordering::Equal,
            };
            primary
                .then_with(|| {
                    compare_for_sort(
                        &na.sort_value,
                        &nb.sort_value,
                        SortDirection::Ascending,
                        nan_sort,
                    )
                })
                .then_with(|| {
                    compare_for_sort(&na.value, &nb.value, SortDirection::Ascending, nan_sort)
                })
        });
        children
    }

    /// Live nodes in pre-order, children in display order.
    #[must_use]
    pub fn dfs(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.size());
        let mut stack = vec![ROOT];
        while let Some(idx) = stack.pop() {
            out.push(idx);
            stack.extend(self.sorted_children(idx).into_iter().rev());
        }
        out
    }

    /// Live nodes level by level, children in display order.
    #[must_use]
    pub fn bfs(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.size());
        let mut queue = VecDeque::from([ROOT]);
        while let Some(idx) = queue.pop_front() {
            out.push(idx);
            queue.extend(self.sorted_children(idx));
        }
        out
    }

    /// Indented dump of the tree with every stored aggregate, for debugging.
    #[must_use]
    pub fn pprint(&self) -> String {
        let lines: Vec<String> = self
            .dfs()
            .into_iter()
            .filter_map(|idx| {
                let node = self.node(idx)?;
                let cells: String = self
                    .plan
                    .iter()
                    .enumerate()
                    .map(|(col, agg)| format!(" {}={}", agg.name(), self.get_aggregate(idx, col)))
                    .collect();
                Some(format!(
                    "{}{} [count={}]{cells}\n",
                    "  ".repeat(node.depth),
                    node.value,
                    node.strand_count
                ))
            })
            .collect();
        lines.concat()
    }
}

/// Orders two sort keys. Invalid and NaN keys go first or last per
/// `nan_sort` regardless of direction.
#[must_use]
pub fn compare_for_sort(
    a: &ScalarValue,
    b: &ScalarValue,
    direction: SortDirection,
    nan_sort: NanSort,
) -> Ordering {
    let a_missing = !a.is_valid() || a.is_nan();
    let b_missing = !b.is_valid() || b.is_nan();
    let missing_first = nan_sort == NanSort::First;
    match (a_missing, b_missing) {
        (true, true) => Ordering::Equal,
        (true, false) if missing_first => Ordering::Less,
        (true, false) => Ordering::Greater,
        (false, true) if missing_first => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ordering = if direction.is_abs() && a.is_numeric() && b.is_numeric() {
                let (a, b) = (a.abs(), b.abs());
                a.compare(&b).unwrap_or_else(|| a.cmp(&b))
            } else {
                a.compare(b).unwrap_or_else(|| a.cmp(b))
            };
            if direction.is_descending() {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pc_columnar::{Field, Schema, Table};
    use pc_config::{AggKind, AggSpec, NanSort, PivotConfig, PivotSpec, SortDirection};
    use pc_runtime::{CancellationToken, Progress, ProgressChannel};
    use pc_store::{CanonicalStore, Op, delta_schema};
    use pc_strand::{StrandBuilder, StrandDigest};
    use pc_types::{DType, ScalarValue};

    use super::{AggregationTree, ROOT, compare_for_sort};

    pub(crate) type Row<'a> = (i64, &'a str, &'a str, i64, i64);

    fn business() -> Schema {
        Schema::new(vec![
            Field::new("region", DType::Str),
            Field::new("city", DType::Str),
            Field::new("amt", DType::Int64),
            Field::new("ts", DType::Int64),
        ])
        .expect("schema")
    }

    pub(crate) fn delta(rows: &[Row<'_>], op: Op) -> Table {
        let mut table = Table::new(delta_schema(&business(), DType::Int64).expect("delta schema"));
        for (pkey, region, city, amt, ts) in rows {
            table
                .push_row(vec![
                    ScalarValue::string(*region),
                    ScalarValue::string(*city),
                    ScalarValue::int64(*amt),
                    ScalarValue::int64(*ts),
                    ScalarValue::int64(*pkey),
                    op.to_scalar(),
                ])
                .expect("row");
        }
        table
    }

    pub(crate) fn config(pivots: &[&str], aggregates: Vec<AggSpec>) -> PivotConfig {
        PivotConfig {
            row_pivots: pivots.iter().map(|p| PivotSpec::new(*p)).collect(),
            aggregates,
            ..PivotConfig::default()
        }
    }

    /// Store plus tree kept in step one cycle at a time.
    pub(crate) struct Harness {
        pub config: PivotConfig,
        pub store: CanonicalStore,
        pub tree: AggregationTree,
    }

    impl Harness {
        pub(crate) fn new(config: PivotConfig) -> Self {
            let store = CanonicalStore::new(&business(), DType::Int64).expect("store");
            let tree = AggregationTree::new(&config, store.schema()).expect("tree");
            Self {
                config,
                store,
                tree,
            }
        }

        pub(crate) fn apply(&mut self, rows: &[Row<'_>], op: Op) {
            self.apply_with(rows, op, &ProgressChannel::silent());
        }

        pub(crate) fn apply_with(&mut self, rows: &[Row<'_>], op: Op, progress: &ProgressChannel) {
            let changes = self.store.process(&delta(rows, op)).expect("process");
            let builder = StrandBuilder::new(&self.config, &self.store).expect("builder");
            let strands = builder.build_delta(&changes).expect("strands");
            let digest = StrandDigest::build(&strands);
            let shape = self.tree.update_shape(&digest, progress).expect("shape");
            self.tree
                .update_aggregates(&shape.records, &self.store, &strands, progress)
                .expect("aggregates");
        }

        pub(crate) fn at(&self, path: &[&str]) -> usize {
            let path: Vec<ScalarValue> = path.iter().map(|v| ScalarValue::string(*v)).collect();
            self.tree.resolve_path(&path).expect("path")
        }

        pub(crate) fn cell(&self, path: &[&str], aggregate: &str) -> ScalarValue {
            let col = self.tree.plan().position(aggregate).expect("aggregate");
            self.tree.get_aggregate(self.at(path), col)
        }
    }

    fn sales() -> Vec<Row<'static>> {
        vec![
            (1, "US", "NY", 10, 3),
            (2, "US", "SF", 5, 1),
            (3, "EU", "Paris", 7, 2),
        ]
    }

    #[test]
    fn sums_follow_inserts_and_deletes() {
        let mut h = Harness::new(config(
            &["region"],
            vec![
                AggSpec::new("total", AggKind::Sum, vec!["amt"]),
                AggSpec::new("n", AggKind::Count, Vec::<String>::new()),
            ],
        ));
        h.apply(&sales(), Op::Insert);
        assert_eq!(h.cell(&[], "total"), ScalarValue::int64(22));
        assert_eq!(h.cell(&["US"], "total"), ScalarValue::int64(15));
        assert_eq!(h.cell(&["EU"], "total"), ScalarValue::int64(7));
        assert_eq!(h.cell(&[], "n"), ScalarValue::int64(3));
        let us_count = h.tree.node(h.at(&["US"])).expect("us").strand_count;

        h.apply(&[(2, "US", "SF", 5, 1)], Op::Delete);
        assert_eq!(h.cell(&["US"], "total"), ScalarValue::int64(10));
        assert_eq!(h.cell(&[], "total"), ScalarValue::int64(17));
        assert_eq!(h.tree.node(h.at(&["US"])).expect("us").strand_count, us_count - 1);
    }

    #[test]
    fn moving_a_row_moves_its_contribution() {
        let mut h = Harness::new(config(
            &["region", "city"],
            vec![AggSpec::new("total", AggKind::Sum, vec!["amt"])],
        ));
        h.apply(&sales(), Op::Insert);
        h.apply(&[(2, "EU", "Rome", 5, 1)], Op::Insert);
        assert_eq!(h.cell(&["US"], "total"), ScalarValue::int64(10));
        assert_eq!(h.cell(&["EU"], "total"), ScalarValue::int64(12));
        assert_eq!(h.cell(&["EU", "Rome"], "total"), ScalarValue::int64(5));

        let sf = h.at(&["US", "SF"]);
        assert!(h.tree.zero_nodes().contains(&sf));
        assert_eq!(h.tree.get_pkeys(sf), Vec::<ScalarValue>::new());
        let removed = h.tree.drop_zero_strands().expect("prune");
        assert_eq!(removed, 1);
        assert!(h.tree.node(sf).is_none());
        for idx in h.tree.dfs().into_iter().filter(|idx| *idx != ROOT) {
            for ancestor in h.tree.get_ancestry(idx).into_iter().skip(1) {
                assert!(h.tree.node(ancestor).expect("node").strand_count > 0);
            }
        }
    }

    #[test]
    fn recompute_is_idempotent() {
        let mut h = Harness::new(config(
            &["region"],
            vec![
                AggSpec::new("total", AggKind::Sum, vec!["amt"]),
                AggSpec::new("avg", AggKind::Mean, vec!["amt"]),
                AggSpec::new("cities", AggKind::Join, vec!["city"]),
            ],
        ));
        let builder_input = sales();
        h.apply(&builder_input, Op::Insert);
        let before = h.tree.pprint();

        let builder = StrandBuilder::new(&h.config, &h.store).expect("builder");
        let strands = builder.build_full(&h.store).expect("strands");
        let records: Vec<_> = h
            .tree
            .dfs()
            .into_iter()
            .map(|node| super::UnificationRecord {
                node,
                strand_rows: Vec::new(),
                agg_row: h.tree.node(node).expect("node").agg_row,
                net_delta: 0,
            })
            .collect();
        for _ in 0..2 {
            h.tree
                .update_aggregates(&records, &h.store, &strands, &ProgressChannel::silent())
                .expect("aggregates");
            assert_eq!(h.tree.pprint(), before);
        }
        assert_eq!(h.cell(&["US"], "cities"), ScalarValue::string("NY, SF"));
    }

    #[test]
    fn first_picks_value_at_smallest_sort_key() {
        let mut h = Harness::new(config(
            &[],
            vec![
                AggSpec::new("first", AggKind::First, vec!["amt", "ts"]),
                AggSpec::new("last", AggKind::Last, vec!["amt", "ts"]),
            ],
        ));
        h.apply(
            &[(1, "US", "NY", 30, 3), (2, "US", "NY", 10, 1), (3, "US", "NY", 20, 2)],
            Op::Insert,
        );
        assert_eq!(h.cell(&[], "first"), ScalarValue::int64(10));
        assert_eq!(h.cell(&[], "last"), ScalarValue::int64(30));
    }

    #[test]
    fn percentages_are_computed_on_read() {
        let mut h = Harness::new(config(
            &["region", "city"],
            vec![
                AggSpec::new("of_parent", AggKind::PctSumParent, vec!["amt"]),
                AggSpec::new("of_total", AggKind::PctSumGrandTotal, vec!["amt"]),
            ],
        ));
        h.apply(
            &[(1, "US", "NY", 30, 0), (2, "US", "SF", 10, 0), (3, "EU", "Rome", 60, 0)],
            Op::Insert,
        );
        assert_eq!(h.cell(&["US", "NY"], "of_parent"), ScalarValue::float64(75.0));
        assert_eq!(h.cell(&["US", "NY"], "of_total"), ScalarValue::float64(30.0));
        assert_eq!(h.cell(&[], "of_total"), ScalarValue::float64(100.0));
    }

    #[test]
    fn composite_and_computed_aggregates() {
        let mut h = Harness::new(config(
            &["region"],
            vec![
                AggSpec::new("total", AggKind::Sum, vec!["amt"]),
                AggSpec::new("n", AggKind::Count, Vec::<String>::new()),
                AggSpec::new("per_row", AggKind::ScaledDiv, vec!["total", "n"]),
                AggSpec::new::<String>("doubled", AggKind::Custom, Vec::new())
                    .with_formula("per_row * 2"),
            ],
        ));
        h.apply(&sales(), Op::Insert);
        assert_eq!(h.cell(&["US"], "per_row"), ScalarValue::float64(7.5));
        assert_eq!(h.cell(&["US"], "doubled"), ScalarValue::float64(15.0));
    }

    #[test]
    fn ledger_records_changed_cells() {
        let mut cfg = config(&["region"], vec![AggSpec::new("total", AggKind::Sum, vec!["amt"])]);
        cfg.options.track_deltas = true;
        let mut h = Harness::new(cfg);
        h.apply(&sales(), Op::Insert);
        assert_eq!(h.tree.get_deltas().len(), 3);
        h.tree.clear_deltas();

        h.apply(&[(3, "EU", "Paris", 8, 2)], Op::Insert);
        let deltas = h.tree.get_deltas();
        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().any(|change| change.node == ROOT
            && change.old == ScalarValue::int64(22)
            && change.new == ScalarValue::int64(23)));
    }

    #[test]
    fn traversal_helpers() {
        let mut h = Harness::new(config(
            &["region", "city"],
            vec![AggSpec::new("total", AggKind::Sum, vec!["amt"])],
        ));
        h.apply(&sales(), Op::Insert);
        let ny = h.at(&["US", "NY"]);
        assert_eq!(
            h.tree.get_path(ny),
            vec![ScalarValue::string("US"), ScalarValue::string("NY")]
        );
        assert_eq!(h.tree.get_ancestry(ny).len(), 3);
        assert_eq!(h.tree.get_leaves(ROOT).len(), 3);
        assert_eq!(h.tree.get_descendants(ROOT).len(), 5);
        assert_eq!(h.tree.get_pkeys(h.at(&["US"])), vec![ScalarValue::int64(1), ScalarValue::int64(2)]);
        // Children sort by value when no sort is configured.
        let first = h.tree.get_child_idx(ROOT, 0).expect("first child");
        assert_eq!(first, h.at(&["EU"]));
        assert_eq!(h.tree.bfs()[1], first);
        let (min, max) = h.tree.get_min_max(0);
        assert_eq!((min, max), (ScalarValue::int64(5), ScalarValue::int64(15)));
        assert!(h.tree.pprint().starts_with("Grand Aggregate"));
    }

    #[test]
    fn cancelled_shape_update_reports_cancellation() {
        let mut h = Harness::new(config(&["region"], vec![AggSpec::new("total", AggKind::Sum, vec!["amt"])]));
        let token = CancellationToken::new();
        token.cancel();
        let progress = ProgressChannel::silent().with_token(token);
        let changes = h.store.process(&delta(&sales(), Op::Insert)).expect("process");
        let builder = StrandBuilder::new(&h.config, &h.store).expect("builder");
        let strands = builder.build_delta(&changes).expect("strands");
        let shape = h
            .tree
            .update_shape(&StrandDigest::build(&strands), &progress)
            .expect("shape");
        assert_eq!(shape.progress, Progress::Cancelled);
        assert_eq!(shape.records.len(), 1);
    }

    #[test]
    fn missing_values_sort_per_option() {
        let valid = ScalarValue::int64(1);
        let missing = ScalarValue::null(DType::Int64);
        let order = |nan| compare_for_sort(&missing, &valid, SortDirection::Descending, nan);
        assert_eq!(order(NanSort::First), std::cmp::Ordering::Less);
        assert_eq!(order(NanSort::Last), std::cmp::Ordering::Greater);
        assert_eq!(
            compare_for_sort(&ScalarValue::int64(-5), &valid, SortDirection::AscendingAbs, NanSort::Last),
            std::cmp::Ordering::Greater
        );
    }

    fn sort_key() -> impl proptest::strategy::Strategy<Value = ScalarValue> {
        use proptest::prelude::*;
        prop_oneof![
            (-100i64..100).prop_map(ScalarValue::int64),
            (-100.0f64..100.0).prop_map(ScalarValue::float64),
            Just(ScalarValue::float64(f64::NAN)),
            Just(ScalarValue::null(DType::Int64)),
        ]
    }

    proptest::proptest! {
        #[test]
        fn sort_comparison_is_antisymmetric(
            a in sort_key(),
            b in sort_key(),
            descending in proptest::bool::ANY,
            first in proptest::bool::ANY,
        ) {
            let direction = if descending { SortDirection::Descending } else { SortDirection::Ascending };
            let nan = if first { NanSort::First } else { NanSort::Last };
            proptest::prop_assert_eq!(
                compare_for_sort(&a, &b, direction, nan),
                compare_for_sort(&b, &a, direction, nan).reverse()
            );
        }
    }
}
