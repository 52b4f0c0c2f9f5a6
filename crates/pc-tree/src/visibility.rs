use std::collections::BTreeSet;

use pc_config::SortSpec;
use pc_expr::FilterTerm;
use pc_runtime::{Progress, ProgressChannel};
use pc_store::CanonicalStore;
use pc_types::ScalarValue;

use crate::{AggregationTree, ROOT, TreeError, compare_for_sort};

impl AggregationTree {
    /// Whether any having term or row limit is configured.
    #[must_use]
    pub fn has_visibility_rules(&self) -> bool {
        !self.having.is_empty() || self.sort.iter().any(|sort| sort.limit.is_some())
    }

    #[must_use]
    pub fn is_hidden(&self, idx: usize) -> bool {
        self.hidden_nodes.contains(&idx)
    }

    /// Primary keys excluded by having terms and row limits.
    #[must_use]
    pub fn hidden_pkeys(&self) -> &BTreeSet<ScalarValue> {
        &self.hidden_pkeys
    }

    /// Whether `idx` has at least one visible primary key under it. The
    /// root is always shown.
    #[must_use]
    pub fn is_shown(&self, idx: usize) -> bool {
        idx == ROOT || self.shown.get(idx).copied().unwrap_or(false)
    }

    /// Distinct primary keys under `idx` that are not under a hidden node.
    #[must_use]
    pub fn visible_pkeys(&self, idx: usize) -> Vec<ScalarValue> {
        let mut keys = BTreeSet::new();
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            if self.hidden_nodes.contains(&current) || self.node(current).is_none() {
                continue;
            }
            if self.is_leaf(current) {
                if let Some(leaf_keys) = self.leaf_pkeys.get(&current) {
                    keys.extend(leaf_keys.keys().cloned());
                }
            }
            stack.extend(self.child_nodes(current).iter().copied());
        }
        keys.into_iter().collect()
    }

    /// Applies having terms and row limits level by level, deepest first.
    /// Failing or cut nodes are hidden with their subtrees, and every
    /// visible ancestor of a hidden node is recomputed over the keys that
    /// remain visible, so shallower levels decide on restricted values.
    pub fn update_limiting_having_tree(
        &mut self,
        store: &CanonicalStore,
        progress: &ProgressChannel,
    ) -> Result<Progress, TreeError> {
        for idx in std::mem::take(&mut self.restricted) {
            if self.node(idx).is_some() {
                let pkeys = self.get_pkeys(idx);
                self.recompute(idx, store, &pkeys, None)?;
            }
        }
        self.hidden_nodes.clear();
        self.hidden_pkeys.clear();
        if !self.has_visibility_rules() {
            self.update_show_nodes();
            return Ok(Progress::Completed);
        }

        for level in (1..=self.depth).rev() {
            if progress.is_cancelled() {
                #[cfg(feature = "tracing")]
                tracing::info!(level, "having/limit pass cancelled");
                self.update_show_nodes();
                return Ok(Progress::Cancelled);
            }
            let terms = self.having_terms(level);
            let limit = self.limit_at(level);
            if terms.is_empty() && limit.is_none() {
                continue;
            }

            let parents: Vec<usize> = self
                .live_nodes()
                .filter(|idx| {
                    self.node(*idx).is_some_and(|node| node.depth + 1 == level)
                        && !self.hidden_nodes.contains(idx)
                })
                .collect();
            let mut newly_hidden = Vec::new();
            for parent in &parents {
                let mut kept = Vec::new();
                for child in self.child_nodes(*parent) {
                    if self.hidden_nodes.contains(child) || self.zero_nodes.contains(child) {
                        continue;
                    }
                    let passes = terms.is_empty()
                        || self.having.combiner.combine(
                            terms
                                .iter()
                                .map(|(col, term)| term.matches(&self.get_aggregate(*child, *col))),
                        );
                    if passes {
                        kept.push(*child);
                    } else {
                        newly_hidden.push(*child);
                    }
                }
                if let Some((col, sort)) = &limit {
                    let nan_sort = self.options.nan_sort;
                    kept.sort_by(|a, b| {
                        compare_for_sort(
                            &self.get_aggregate(*a, *col),
                            &self.get_aggregate(*b, *col),
                            sort.direction,
                            nan_sort,
                        )
                    });
                    if let Some(keep) = sort.keep_count(kept.len()) {
                        newly_hidden.extend(kept.drain(keep..));
                    }
                }
            }

            for idx in newly_hidden {
                self.hide_subtree(idx);
            }
            for parent in &parents {
                let live: Vec<usize> = self
                    .child_nodes(*parent)
                    .iter()
                    .copied()
                    .filter(|child| !self.zero_nodes.contains(child))
                    .collect();
                if *parent != ROOT
                    && !live.is_empty()
                    && live.iter().all(|child| self.hidden_nodes.contains(child))
                {
                    self.hidden_nodes.insert(*parent);
                }
            }
            self.restrict_ancestors(store, level)?;
        }

        let visible: BTreeSet<ScalarValue> = self.visible_pkeys(ROOT).into_iter().collect();
        self.hidden_pkeys = self
            .get_pkeys(ROOT)
            .into_iter()
            .filter(|pkey| !visible.contains(pkey))
            .collect();
        self.update_show_nodes();
        #[cfg(feature = "tracing")]
        tracing::debug!(
            hidden_nodes = self.hidden_nodes.len(),
            hidden_pkeys = self.hidden_pkeys.len(),
            "having/limit pass done"
        );
        Ok(Progress::Completed)
    }

    /// Marks a node shown when it is not hidden and has a visible key,
    /// bottom-up.
    pub fn update_show_nodes(&mut self) {
        let mut shown = vec![false; self.nodes.len()];
        let order = self.bfs();
        for idx in order.into_iter().rev() {
            if self.hidden_nodes.contains(&idx) {
                continue;
            }
            shown[idx] = if self.is_leaf(idx) {
                self.leaf_pkeys.get(&idx).is_some_and(|keys| !keys.is_empty())
            } else {
                self.child_nodes(idx)
                    .iter()
                    .any(|child| shown.get(*child).copied().unwrap_or(false))
            };
        }
        if let Some(root) = shown.first_mut() {
            *root = true;
        }
        self.shown = shown;
    }

    /// Visible nodes in pre-order, children in display order, skipping
    /// nodes that are not shown and everything under them.
    #[must_use]
    pub fn visible_dfs(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![ROOT];
        while let Some(idx) = stack.pop() {
            if !self.is_shown(idx) || self.hidden_nodes.contains(&idx) {
                continue;
            }
            out.push(idx);
            stack.extend(self.sorted_children(idx).into_iter().rev());
        }
        out
    }

    fn having_terms(&self, level: usize) -> Vec<(usize, FilterTerm)> {
        self.having
            .at_level(level)
            .filter_map(|having| {
                let col = self.plan.position(&having.term.column);
                let valid = having.term.validate();
                #[cfg(feature = "tracing")]
                if col.is_none() {
                    tracing::warn!(aggregate = %having.term.column, level, "skipping having on unknown aggregate");
                } else if let Err(err) = &valid {
                    tracing::warn!(aggregate = %having.term.column, error = %err, "skipping malformed having term");
                }
                col.filter(|_| valid.is_ok())
                    .map(|col| (col, having.term.clone()))
            })
            .collect()
    }

    fn limit_at(&self, level: usize) -> Option<(usize, SortSpec)> {
        let sort = self
            .sort
            .iter()
            .find(|sort| sort.level == level && sort.limit.is_some())?;
        let col = self.plan.position(&sort.column);
        #[cfg(feature = "tracing")]
        if col.is_none() {
            tracing::warn!(aggregate = %sort.column, level, "skipping limit on unknown aggregate");
        }
        col.map(|col| (col, sort.clone()))
    }

    fn hide_subtree(&mut self, idx: usize) {
        for node in self.subtree(idx) {
            self.hidden_nodes.insert(node);
        }
    }

    /// Recomputes visible nodes shallower than `level` that have a hidden
    /// node under them.
    fn restrict_ancestors(&mut self, store: &CanonicalStore, level: usize) -> Result<(), TreeError> {
        let mut targets = BTreeSet::new();
        for hidden in &self.hidden_nodes {
            for ancestor in self.get_ancestry(*hidden) {
                let shallower = self.node(ancestor).is_some_and(|node| node.depth < level);
                if shallower && !self.hidden_nodes.contains(&ancestor) {
                    targets.insert(ancestor);
                }
            }
        }
        for idx in targets {
            let pkeys = self.visible_pkeys(idx);
            self.recompute(idx, store, &pkeys, None)?;
            self.restricted.insert(idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pc_config::{AggKind, AggSpec, HavingSpec, HavingTerm, LimitKind, SortDirection, SortSpec};
    use pc_expr::FilterOp;
    use pc_runtime::ProgressChannel;
    use pc_store::Op;
    use pc_types::ScalarValue;

    use crate::ROOT;
    use crate::tests::{Harness, Row, config};

    fn sales() -> Vec<Row<'static>> {
        vec![
            (1, "US", "NY", 10, 0),
            (2, "US", "SF", 5, 0),
            (3, "EU", "Paris", 7, 0),
            (4, "APAC", "Tokyo", 30, 0),
            (5, "APAC", "Seoul", 1, 0),
        ]
    }

    fn sums() -> Vec<AggSpec> {
        vec![
            AggSpec::new("total", AggKind::Sum, vec!["amt"]),
            AggSpec::new("n", AggKind::Count, Vec::<String>::new()),
        ]
    }

    #[test]
    fn having_hides_failing_groups_and_restricts_root() {
        let mut cfg = config(&["region"], sums());
        cfg.having = HavingSpec {
            terms: vec![HavingTerm::new(1, "total", FilterOp::Gt, vec![ScalarValue::int64(10)])],
            ..HavingSpec::default()
        };
        let mut h = Harness::new(cfg);
        h.apply(&sales(), Op::Insert);
        h.tree
            .update_limiting_having_tree(&h.store, &ProgressChannel::silent())
            .expect("having");

        assert!(h.tree.is_hidden(h.at(&["EU"])));
        assert!(!h.tree.is_shown(h.at(&["EU"])));
        assert!(h.tree.is_shown(h.at(&["US"])));
        assert_eq!(h.cell(&[], "total"), ScalarValue::int64(46));
        assert_eq!(h.cell(&[], "n"), ScalarValue::int64(4));
        assert_eq!(h.tree.hidden_pkeys().len(), 1);
        assert!(!h.tree.visible_dfs().contains(&h.at(&["EU"])));
    }

    #[test]
    fn limit_keeps_top_children() {
        let mut cfg = config(&["region"], sums());
        cfg.sort = vec![
            SortSpec::new("total", SortDirection::Descending, 1).with_limit(1.0, LimitKind::Items),
        ];
        let mut h = Harness::new(cfg);
        h.apply(&sales(), Op::Insert);
        h.tree
            .update_limiting_having_tree(&h.store, &ProgressChannel::silent())
            .expect("limit");
        assert_eq!(h.tree.visible_dfs(), vec![ROOT, h.at(&["APAC"])]);
        assert_eq!(h.cell(&[], "total"), ScalarValue::int64(31));
    }

    #[test]
    fn restricted_values_are_restored_when_rules_stop_hiding() {
        let mut cfg = config(&["region", "city"], sums());
        cfg.having = HavingSpec {
            terms: vec![HavingTerm::new(2, "total", FilterOp::GtEq, vec![ScalarValue::int64(5)])],
            ..HavingSpec::default()
        };
        let mut h = Harness::new(cfg);
        h.apply(&sales(), Op::Insert);
        let progress = ProgressChannel::silent();
        h.tree.update_limiting_having_tree(&h.store, &progress).expect("having");
        // Seoul (1) is cut, so APAC loses it.
        assert_eq!(h.cell(&["APAC"], "total"), ScalarValue::int64(30));
        assert_eq!(h.cell(&[], "total"), ScalarValue::int64(52));

        h.apply(&[(5, "APAC", "Seoul", 6, 0)], Op::Insert);
        h.tree.update_limiting_having_tree(&h.store, &progress).expect("having");
        assert_eq!(h.cell(&["APAC"], "total"), ScalarValue::int64(36));
        assert_eq!(h.cell(&[], "total"), ScalarValue::int64(58));
        assert!(h.tree.hidden_pkeys().is_empty());
    }

    #[test]
    fn parents_without_visible_children_are_hidden() {
        let mut cfg = config(&["region", "city"], sums());
        cfg.having = HavingSpec {
            terms: vec![HavingTerm::new(2, "total", FilterOp::Gt, vec![ScalarValue::int64(8)])],
            ..HavingSpec::default()
        };
        let mut h = Harness::new(cfg);
        h.apply(&sales(), Op::Insert);
        h.tree
            .update_limiting_having_tree(&h.store, &ProgressChannel::silent())
            .expect("having");
        assert!(h.tree.is_hidden(h.at(&["EU"])));
        assert!(!h.tree.is_hidden(h.at(&["US"])));
        assert_eq!(h.cell(&["US"], "total"), ScalarValue::int64(10));
    }

    #[test]
    fn unknown_having_aggregate_is_skipped() {
        let mut cfg = config(&["region"], sums());
        cfg.having = HavingSpec {
            terms: vec![HavingTerm::new(1, "nope", FilterOp::Gt, vec![ScalarValue::int64(10)])],
            ..HavingSpec::default()
        };
        let mut h = Harness::new(cfg);
        h.apply(&sales(), Op::Insert);
        h.tree
            .update_limiting_having_tree(&h.store, &ProgressChannel::silent())
            .expect("having");
        assert!(h.tree.hidden_pkeys().is_empty());
        assert_eq!(h.cell(&[], "total"), ScalarValue::int64(53));
    }
}
