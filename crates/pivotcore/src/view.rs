use std::ops::Range;

use pc_tree::CellFlags;
use pc_types::ScalarValue;
use serde::Serialize;

use crate::PivotContext;

/// Row-header data for one visible row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowHeader {
    pub node: usize,
    /// Zero for the grand total.
    pub depth: usize,
    /// Pivot values from the first level down to this row.
    pub path: Vec<ScalarValue>,
    /// Show flag of each node on `path`, first level first.
    pub show: Vec<bool>,
}

/// Receives a window of the visible rows.
pub trait ValueSink {
    fn row(&mut self, row: usize, header: RowHeader);

    fn cell(&mut self, row: usize, col: usize, value: ScalarValue, flags: CellFlags);
}

/// A window collected in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowData {
    pub first_row: usize,
    pub headers: Vec<RowHeader>,
    pub cells: Vec<Vec<ScalarValue>>,
    #[serde(skip)]
    pub flags: Vec<Vec<CellFlags>>,
}

impl ValueSink for WindowData {
    fn row(&mut self, row: usize, header: RowHeader) {
        if self.headers.is_empty() {
            self.first_row = row;
        }
        self.headers.push(header);
        self.cells.push(Vec::new());
        self.flags.push(Vec::new());
    }

    fn cell(&mut self, _row: usize, _col: usize, value: ScalarValue, flags: CellFlags) {
        if let Some(cells) = self.cells.last_mut() {
            cells.push(value);
        }
        if let Some(row_flags) = self.flags.last_mut() {
            row_flags.push(flags);
        }
    }
}

impl PivotContext {
    /// Visible tree nodes in display order after pagination and
    /// `max_rows`. The grand total is the first row of the first page.
    #[must_use]
    pub fn visible_rows(&self) -> Vec<usize> {
        let mut rows = self.tree.visible_dfs();
        if let Some(page) = self.config.pagination {
            let (start, end) = page.range();
            let end = end.min(rows.len());
            rows = rows.get(start..end).map(<[usize]>::to_vec).unwrap_or_default();
        }
        if let Some(max_rows) = self.config.max_rows {
            rows.truncate(max_rows);
        }
        rows
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.visible_rows().len()
    }

    /// Aggregate names in column order, capped by `max_columns`.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        let limit = self.config.max_columns.unwrap_or(usize::MAX);
        self.tree.plan().iter().map(|agg| agg.name()).take(limit).collect()
    }

    /// Emits rows `rows` and aggregate columns `cols` of the visible view
    /// to `sink`. Ranges are clamped to the view; returns the number of
    /// rows emitted.
    pub fn window(&self, rows: Range<usize>, cols: Range<usize>, sink: &mut dyn ValueSink) -> usize {
        let visible = self.visible_rows();
        let columns = self.column_names().len();
        let cols = cols.start.min(columns)..cols.end.min(columns);
        let rows = rows.start.min(visible.len())..rows.end.min(visible.len());

        let mut emitted = 0;
        for (offset, node) in visible[rows.clone()].iter().enumerate() {
            let row = rows.start + offset;
            let Some(tree_node) = self.tree.node(*node) else {
                continue;
            };
            let show = self
                .tree
                .get_ancestry(*node)
                .into_iter()
                .skip(1)
                .map(|idx| self.tree.is_shown(idx))
                .collect();
            sink.row(
                row,
                RowHeader {
                    node: *node,
                    depth: tree_node.depth,
                    path: self.tree.get_path(*node),
                    show,
                },
            );
            for col in cols.clone() {
                sink.cell(
                    row,
                    col,
                    self.tree.get_aggregate(*node, col),
                    self.tree.cell_flags(*node, col),
                );
            }
            emitted += 1;
        }
        emitted
    }
}
