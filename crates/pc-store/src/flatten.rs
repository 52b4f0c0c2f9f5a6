use std::collections::HashMap;

use pc_columnar::Table;
use pc_types::{ScalarValue, Status};

use crate::{OP_COLUMN, Op, PKEY_COLUMN, StoreError};

struct Pending {
    op: Op,
    cells: Vec<ScalarValue>,
}

/// Collapses a delta to at most one row per primary key, in order of first
/// appearance.
///
/// Successive inserts merge cell by cell, later provided cells winning. A
/// delete discards what came before it. An insert after a delete replaces
/// the row outright: cells it does not provide come out cleared. Rows with
/// an invalid key are dropped.
pub fn flatten(delta: &Table) -> Result<Table, StoreError> {
    let schema = delta.schema();
    let pkey_idx = schema
        .colidx(PKEY_COLUMN)
        .ok_or_else(|| StoreError::MissingColumn(PKEY_COLUMN.to_owned()))?;
    let op_idx = schema
        .colidx(OP_COLUMN)
        .ok_or_else(|| StoreError::MissingColumn(OP_COLUMN.to_owned()))?;
    let dtypes: Vec<_> = schema.fields().iter().map(|field| field.dtype).collect();

    let mut order: Vec<ScalarValue> = Vec::new();
    let mut rows: HashMap<ScalarValue, Pending> = HashMap::new();

    for row in 0..delta.size() {
        let cells = delta.row(row);
        let pkey = cells[pkey_idx].clone();
        if !pkey.is_valid() {
            #[cfg(feature = "tracing")]
            tracing::warn!(row, "dropping delta row without a primary key");
            continue;
        }
        let op = Op::from_scalar(&cells[op_idx])?;
        let pending = rows.entry(pkey.clone()).or_insert_with(|| {
            order.push(pkey.clone());
            Pending {
                op,
                cells: dtypes.iter().map(|dtype| ScalarValue::null(*dtype)).collect(),
            }
        });

        match op {
            Op::Delete => {
                pending.op = Op::Delete;
                for (cell, dtype) in pending.cells.iter_mut().zip(&dtypes) {
                    *cell = ScalarValue::null(*dtype);
                }
            }
            Op::Insert => {
                if pending.op == Op::Delete {
                    for (cell, dtype) in pending.cells.iter_mut().zip(&dtypes) {
                        *cell = ScalarValue::cleared(*dtype);
                    }
                }
                pending.op = Op::Insert;
                for (slot, cell) in pending.cells.iter_mut().zip(cells) {
                    if cell.status() != Status::Invalid {
                        *slot = cell;
                    }
                }
            }
        }
        pending.cells[pkey_idx] = pkey;
        pending.cells[op_idx] = pending.op.to_scalar();
    }

    let mut out = Table::new(schema.clone());
    out.reserve(order.len());
    for pkey in order {
        if let Some(pending) = rows.remove(&pkey) {
            out.push_row(pending.cells)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pc_types::{DType, ScalarValue};

    use super::flatten;
    use crate::Op;
    use crate::tests::delta;

    #[test]
    fn merges_inserts_per_key() {
        let flat = flatten(&delta(&[
            (1, Op::Insert, Some("US"), None),
            (2, Op::Insert, Some("EU"), Some(3)),
            (1, Op::Insert, None, Some(9)),
        ]))
        .expect("flatten");
        assert_eq!(flat.size(), 2);
        assert_eq!(flat.get(0, "psp_pkey"), ScalarValue::int64(1));
        assert_eq!(flat.get(0, "region"), ScalarValue::string("US"));
        assert_eq!(flat.get(0, "amt"), ScalarValue::int64(9));
        assert_eq!(flat.get(1, "psp_pkey"), ScalarValue::int64(2));
    }

    #[test]
    fn delete_discards_earlier_inserts() {
        let flat = flatten(&delta(&[
            (1, Op::Insert, Some("US"), Some(1)),
            (1, Op::Delete, None, None),
        ]))
        .expect("flatten");
        assert_eq!(flat.size(), 1);
        assert_eq!(flat.get(0, "psp_op"), Op::Delete.to_scalar());
        assert!(!flat.get(0, "region").is_valid());
    }

    #[test]
    fn insert_after_delete_clears_unset_cells() {
        let flat = flatten(&delta(&[
            (1, Op::Delete, None, None),
            (1, Op::Insert, None, Some(4)),
        ]))
        .expect("flatten");
        assert_eq!(flat.get(0, "psp_op"), Op::Insert.to_scalar());
        assert_eq!(flat.get(0, "amt"), ScalarValue::int64(4));
        assert_eq!(flat.get(0, "region"), ScalarValue::cleared(DType::Str));
    }
}
