use std::collections::BTreeMap;

use pc_columnar::{Schema, Table};
use pc_types::{ScalarValue, Status};
use serde::{Deserialize, Serialize};

use crate::{CanonicalStore, DeltaSummary, OP_COLUMN, Op, PKEY_COLUMN, StoreError, flatten};

/// How one cell moved between the stored row and the incoming row. `T`/`F`
/// name whether a valid value existed before and after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueTransition {
    EqFF,
    EqTT,
    NeqFT,
    NeqTF,
    NeqTT,
    /// Row existed with an invalid cell that is now valid.
    NveqFT,
    NeqTDT,
    /// Row deleted.
    NeqTDF,
}

impl ValueTransition {
    /// Whether the cell's value differs from what the store held.
    #[must_use]
    pub fn is_change(self) -> bool {
        !matches!(self, Self::EqFF | Self::EqTT)
    }
}

/// Classifies an insert cell. `row_pre_existed` is whether the key was
/// stored; `prev_valid`/`cur_valid` describe the stored and incoming cells.
#[must_use]
pub fn calc_transition(
    row_pre_existed: bool,
    prev_valid: bool,
    cur_valid: bool,
    equal: bool,
) -> ValueTransition {
    let exists = cur_valid;
    let prev_existed = row_pre_existed && prev_valid;

    if !row_pre_existed && !cur_valid {
        ValueTransition::NeqFT
    } else if row_pre_existed && !prev_valid && !cur_valid {
        ValueTransition::EqTT
    } else if row_pre_existed && exists && !prev_valid && cur_valid {
        ValueTransition::NveqFT
    } else if prev_existed && exists && equal {
        ValueTransition::EqTT
    } else if !prev_existed && exists {
        ValueTransition::NeqFT
    } else if prev_existed && !exists {
        ValueTransition::NeqTF
    } else if prev_existed && exists && !equal {
        ValueTransition::NeqTT
    } else {
        ValueTransition::NeqTDT
    }
}

/// Everything one update cycle needs to know about a flattened delta:
/// per row, the stored value before the update (`prev`), the value after
/// (`current`), their numeric difference (`delta`) and the transition.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub flattened: Table,
    pub pkeys: Vec<ScalarValue>,
    pub ops: Vec<Op>,
    pub existed: Vec<bool>,
    pub prev: Table,
    pub current: Table,
    pub delta: Table,
    pub transitions: BTreeMap<String, Vec<ValueTransition>>,
    pub summary: DeltaSummary,
}

impl ChangeSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.pkeys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pkeys.is_empty()
    }

    #[must_use]
    pub fn is_delete(&self, row: usize) -> bool {
        self.ops.get(row) == Some(&Op::Delete)
    }

    #[must_use]
    pub fn transition(&self, column: &str, row: usize) -> Option<ValueTransition> {
        self.transitions.get(column)?.get(row).copied()
    }

    /// Whether any of `columns` changed on `row`.
    #[must_use]
    pub fn any_changed<'a>(&self, columns: impl IntoIterator<Item = &'a str>, row: usize) -> bool {
        columns.into_iter().any(|column| {
            self.transition(column, row)
                .is_some_and(ValueTransition::is_change)
        })
    }
}

impl CanonicalStore {
    /// Flattens `delta`, captures the before and after view of every
    /// touched row, then merges the delta into the store.
    pub fn process(&mut self, delta: &Table) -> Result<ChangeSet, StoreError> {
        let flattened = flatten(delta)?;
        let port_schema = self.port_schema()?;
        let mut prev = Table::new(port_schema.clone());
        let mut current = Table::new(port_schema.clone());
        let mut delta_port = Table::new(port_schema.clone());
        let mut transitions: BTreeMap<String, Vec<ValueTransition>> = port_schema
            .names()
            .map(|name| (name.to_owned(), Vec::with_capacity(flattened.size())))
            .collect();

        let pkey_column = flattened
            .column(PKEY_COLUMN)
            .ok_or_else(|| StoreError::MissingColumn(PKEY_COLUMN.to_owned()))?;
        let op_column = flattened
            .column(OP_COLUMN)
            .ok_or_else(|| StoreError::MissingColumn(OP_COLUMN.to_owned()))?;

        let mut pkeys = Vec::with_capacity(flattened.size());
        let mut ops = Vec::with_capacity(flattened.size());
        let mut existed = Vec::with_capacity(flattened.size());

        for row in 0..flattened.size() {
            let pkey = pkey_column.get_scalar(row);
            let op = Op::from_scalar(&op_column.get_scalar(row))?;
            let stored = self.lookup(&pkey);

            let mut prev_row = Vec::with_capacity(port_schema.len());
            let mut cur_row = Vec::with_capacity(port_schema.len());
            let mut delta_row = Vec::with_capacity(port_schema.len());
            for field in port_schema.fields() {
                let old = match stored {
                    Some(_) => self.get_value(&pkey, &field.name),
                    None => ScalarValue::null(field.dtype),
                };
                let (new, transition) = match op {
                    Op::Delete => {
                        let transition = if stored.is_some() {
                            ValueTransition::NeqTDF
                        } else {
                            ValueTransition::EqFF
                        };
                        (old.clone(), transition)
                    }
                    Op::Insert => {
                        let cell = if field.name == PKEY_COLUMN {
                            pkey.clone()
                        } else {
                            flattened.get(row, &field.name)
                        };
                        // Cells the delta leaves out keep the stored value.
                        let new = match cell.status() {
                            Status::Invalid => old.clone(),
                            Status::Cleared => ScalarValue::cleared(field.dtype),
                            _ => cell,
                        };
                        let prev_valid = old.is_valid();
                        let cur_valid = new.is_valid();
                        let transition = calc_transition(
                            stored.is_some(),
                            prev_valid,
                            cur_valid,
                            prev_valid && cur_valid && old == new,
                        );
                        (new, transition)
                    }
                };
                delta_row.push(if old.is_numeric() || new.is_numeric() {
                    new.difference(&old)
                } else {
                    ScalarValue::null(field.dtype)
                });
                if let Some(column) = transitions.get_mut(&field.name) {
                    column.push(transition);
                }
                prev_row.push(old);
                cur_row.push(new);
            }
            prev.push_row(prev_row)?;
            current.push_row(cur_row)?;
            delta_port.push_row(delta_row)?;
            pkeys.push(pkey);
            ops.push(op);
            existed.push(stored.is_some());
        }

        let summary = self.apply_delta(&flattened)?;
        Ok(ChangeSet {
            flattened,
            pkeys,
            ops,
            existed,
            prev,
            current,
            delta: delta_port,
            transitions,
            summary,
        })
    }

    /// Store schema without the op column.
    fn port_schema(&self) -> Result<Schema, StoreError> {
        let names: Vec<&str> = self
            .schema()
            .names()
            .filter(|name| *name != OP_COLUMN)
            .collect();
        Ok(self.schema().project(&names)?)
    }
}
