use std::collections::BTreeSet;

use pc_columnar::{Schema, Table};
use pc_config::{FilterSpec, SearchMode, SearchSpec};
use pc_expr::{Combiner, FilterTerm};
use pc_types::ScalarValue;

/// One row of a table, read by column name.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    table: &'a Table,
    row: usize,
}

impl<'a> RowView<'a> {
    #[must_use]
    pub fn new(table: &'a Table, row: usize) -> Self {
        Self { table, row }
    }

    #[must_use]
    pub fn get(&self, column: &str) -> ScalarValue {
        self.table.get(self.row, column)
    }
}

#[derive(Debug, Clone)]
struct Search {
    needles: Vec<ScalarValue>,
    columns: Vec<String>,
    mode: SearchMode,
}

/// Row filters and free-text search, with malformed terms already dropped.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    combiner: Combiner,
    terms: Vec<FilterTerm>,
    search: Option<Search>,
}

impl RowFilter {
    /// Keeps the terms that name a known column and carry well-formed
    /// operands. Search with no columns of its own searches
    /// `default_search_columns`.
    #[must_use]
    pub fn new(
        filters: &FilterSpec,
        search: &SearchSpec,
        schema: &Schema,
        default_search_columns: &[String],
    ) -> Self {
        let terms = filters
            .terms
            .iter()
            .filter(|term| {
                let known = schema.has_column(&term.column);
                let valid = term.validate();
                #[cfg(feature = "tracing")]
                if !known {
                    tracing::warn!(column = %term.column, "skipping filter on unknown column");
                } else if let Err(err) = &valid {
                    tracing::warn!(column = %term.column, error = %err, "skipping malformed filter");
                }
                known && valid.is_ok()
            })
            .cloned()
            .collect();

        let search = search.is_active().then(|| {
            let columns = if search.columns.is_empty() {
                default_search_columns.to_vec()
            } else {
                search.columns.clone()
            };
            Search {
                needles: search
                    .terms
                    .iter()
                    .filter(|term| !term.is_empty())
                    .map(|term| ScalarValue::string(term.as_str()))
                    .collect(),
                columns: columns
                    .into_iter()
                    .filter(|column| schema.has_column(column))
                    .collect(),
                mode: search.mode,
            }
        });

        Self {
            combiner: filters.combiner,
            terms,
            search,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.search.is_none()
    }

    /// Store columns the filter reads.
    #[must_use]
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.terms.iter().map(|t| t.column.clone()).collect();
        if let Some(search) = &self.search {
            out.extend(search.columns.iter().cloned());
        }
        out
    }

    #[must_use]
    pub fn passes(&self, row: &RowView<'_>) -> bool {
        let filtered = self
            .combiner
            .combine(self.terms.iter().map(|term| term.matches(&row.get(&term.column))));
        filtered && self.search.as_ref().is_none_or(|search| search.matches(row))
    }
}

impl Search {
    fn matches(&self, row: &RowView<'_>) -> bool {
        self.columns.iter().any(|column| {
            let cell = row.get(column);
            self.needles.iter().any(|needle| search_cell(&cell, needle, self.mode))
        })
    }
}

fn search_cell(cell: &ScalarValue, needle: &ScalarValue, mode: SearchMode) -> bool {
    if !cell.is_valid() {
        return false;
    }
    if let Some(items) = cell.as_list() {
        return items.iter().any(|item| search_cell(item, needle, mode));
    }
    match mode {
        SearchMode::Equals => needle
            .as_str()
            .is_some_and(|n| cell.to_string().to_lowercase() == n.to_lowercase()),
        SearchMode::StartsWith => cell.begins_with(needle),
        SearchMode::Contains => cell.contains(needle),
        SearchMode::Edge => cell.edge(needle),
    }
}
