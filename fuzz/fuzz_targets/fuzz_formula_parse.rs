#![no_main]

use libfuzzer_sys::fuzz_target;
use pc_expr::Formula;
use pivotcore::ScalarValue;

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    if source.len() > 4096 {
        return;
    }
    if let Ok(formula) = Formula::compile(source) {
        let _ = formula.evaluate(|name| Some(ScalarValue::float64(name.len() as f64)));
    }
});
