#![no_main]

use libfuzzer_sys::fuzz_target;
use pivotcore::{
    AggKind, AggSpec, DType, Field, IndexSource, Op, PivotConfig, PivotEngine, PivotSpec,
    ProgressChannel, ROOT, ScalarValue, Schema, Table,
};

const REGIONS: [&str; 4] = ["north", "south", "east", "west"];

// Each 3-byte chunk is one row: key, region/op bits, amount.
fuzz_target!(|data: &[u8]| {
    let Ok(business) = Schema::new(vec![
        Field::new("region", DType::Str),
        Field::new("amt", DType::Int64),
    ]) else {
        return;
    };
    let Ok(mut engine) = PivotEngine::new(business, IndexSource::Implicit(0)) else {
        return;
    };
    let config = PivotConfig {
        row_pivots: vec![PivotSpec::new("region")],
        aggregates: vec![
            AggSpec::new("total", AggKind::Sum, vec!["amt"]),
            AggSpec::new("n", AggKind::Count, Vec::<String>::new()),
        ],
        ..PivotConfig::default()
    };
    let Ok(id) = engine.add_context(config) else {
        return;
    };
    let Ok(schema) = engine.input_schema() else {
        return;
    };

    for chunk in data.chunks(24) {
        let mut input = Table::new(schema.clone());
        for row in chunk.chunks_exact(3) {
            let op = if row[1] & 0x80 == 0 { Op::Insert } else { Op::Delete };
            let region = REGIONS[usize::from(row[1] & 0x03)];
            let _ = input.push_row(vec![
                ScalarValue::string(region),
                ScalarValue::int64(i64::from(row[2] as i8)),
                ScalarValue::int64(i64::from(row[0] & 0x1f)),
                op.to_scalar(),
            ]);
        }
        if engine.update(&input, &ProgressChannel::silent()).is_err() {
            return;
        }
    }

    let Some(context) = engine.context(id) else {
        return;
    };
    let live = engine.store().mapping_size() as i64;
    let count = context.tree().get_aggregate(ROOT, 1);
    assert!(live == 0 || count == ScalarValue::int64(live));
});
