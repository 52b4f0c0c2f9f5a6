use chrono::Datelike;
use pc_types::{BinningKind, BinningSpec, DType, Payload, ScalarValue};

/// Upper bound on the bucket count of a derived binning.
pub const MAX_AUTO_BINS: usize = 100;

/// Number a value is binned by: day number for dates and times, the value
/// itself for numerics.
pub(crate) fn binning_number(value: &ScalarValue) -> Option<f64> {
    if !value.is_valid() {
        return None;
    }
    match value.payload() {
        Payload::Date(d) => Some(f64::from(d.num_days_from_ce())),
        Payload::Time(t) => Some(f64::from(t.date().num_days_from_ce())),
        Payload::Int(_) | Payload::UInt(_) | Payload::Float(_) | Payload::Decimal(_) => {
            value.to_f64().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

/// Derives an automatic binning over `values`: the observed range split
/// into `ceil(sqrt(count))` buckets, at most [`MAX_AUTO_BINS`]. `None`
/// when no value is binnable. List values contribute their elements.
pub fn auto_binning<'a>(values: impl IntoIterator<Item = &'a ScalarValue>) -> Option<BinningSpec> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut count = 0usize;
    let mut is_double = false;
    let mut visit = |value: &ScalarValue| {
        if let Some(v) = binning_number(value) {
            min = min.min(v);
            max = max.max(v);
            count += 1;
            is_double |= value.dtype().is_floating() || value.dtype() == DType::Decimal;
        }
    };
    for value in values {
        match value.as_list() {
            Some(items) => items.iter().for_each(&mut visit),
            None => visit(value),
        }
    }
    if count == 0 {
        return None;
    }
    let bins = ((count as f64).sqrt().ceil() as usize).clamp(1, MAX_AUTO_BINS);
    let size = if max > min {
        (max - min) / bins as f64
    } else {
        1.0
    };
    Some(BinningSpec {
        kind: BinningKind::Auto,
        min,
        max,
        size,
        is_double,
    })
}
