#![allow(dead_code)]

use pivotcore::{
    AggSpec, DType, Field, IndexSource, Op, PivotConfig, PivotEngine, PivotSpec, ScalarValue,
    Schema, Table,
};

/// `(pkey, region, amt, ts)`
pub type Row<'a> = (i64, &'a str, i64, i64);

pub fn business() -> Schema {
    Schema::new(vec![
        Field::new("region", DType::Str),
        Field::new("amt", DType::Int64),
        Field::new("ts", DType::Int64),
    ])
    .expect("schema")
}

pub fn engine() -> PivotEngine {
    PivotEngine::new(business(), IndexSource::Implicit(0)).expect("engine")
}

pub fn batch(engine: &PivotEngine, rows: &[Row<'_>], op: Op) -> Table {
    let mut table = Table::new(engine.input_schema().expect("input schema"));
    for (pkey, region, amt, ts) in rows {
        table
            .push_row(vec![
                ScalarValue::string(*region),
                ScalarValue::int64(*amt),
                ScalarValue::int64(*ts),
                ScalarValue::int64(*pkey),
                op.to_scalar(),
            ])
            .expect("row");
    }
    table
}

pub fn by_region(aggregates: Vec<AggSpec>) -> PivotConfig {
    PivotConfig {
        row_pivots: vec![PivotSpec::new("region")],
        aggregates,
        ..PivotConfig::default()
    }
}

pub fn scenario_a() -> Vec<Row<'static>> {
    vec![(1, "US", 10, 3), (2, "US", 5, 1), (3, "EU", 7, 2)]
}
