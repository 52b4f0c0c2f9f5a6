use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::format::plain_float;
use crate::{DType, DataFormat, Payload, ScalarValue};

/// Label of the bucket collecting out-of-range and missing values.
pub const BINNING_OTHER_TEXT: &str = "Other/Blank";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinningKind {
    #[default]
    None,
    Auto,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningSpec {
    pub kind: BinningKind,
    pub min: f64,
    pub max: f64,
    pub size: f64,
    pub is_double: bool,
}

impl BinningSpec {
    #[must_use]
    pub fn custom(min: f64, max: f64, size: f64, is_double: bool) -> Self {
        Self {
            kind: BinningKind::Custom,
            min,
            max,
            size,
            is_double,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.kind != BinningKind::None
    }

    /// Size not positive or bounds not finite.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        !(self.size > 0.0 && self.min.is_finite() && self.max.is_finite() && self.size.is_finite())
    }

    /// `[begin, end)` of the bucket holding `value`, clamped to the bounds for
    /// custom binning. `None` when out of range or degenerate.
    fn bucket(&self, value: f64) -> Option<(f64, f64)> {
        if self.is_degenerate() || value.is_nan() || value < self.min || value > self.max {
            return None;
        }
        let pos = ((value - self.min) / self.size).floor();
        let mut begin = pos * self.size + self.min;
        let mut end = (pos + 1.0) * self.size + self.min;
        if self.kind == BinningKind::Custom {
            begin = begin.max(self.min);
            end = end.min(self.max);
        }
        Some((begin, end))
    }

    /// Inclusive upper label for a bucket ending at `end`.
    fn display_end(&self, begin: f64, end: f64, format: DataFormat) -> f64 {
        if self.max != end || end - begin == self.size {
            if self.is_double || format == DataFormat::Financial {
                end - 0.01
            } else {
                end - 1.0
            }
        } else {
            end
        }
    }
}

fn day_number(d: NaiveDate) -> f64 {
    f64::from(d.num_days_from_ce())
}

fn date_of_day_number(v: f64) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(v.round() as i32)
}

fn render(v: f64, format: DataFormat, as_date: bool) -> String {
    if as_date {
        return date_of_day_number(v).map_or_else(
            || plain_float(v),
            |d| ScalarValue::date(d).with_format(format).to_string(),
        );
    }
    ScalarValue::float64(v).with_format(format).to_string()
}

impl ScalarValue {
    fn binning_input(&self) -> Option<(f64, bool)> {
        if !self.is_valid() {
            return None;
        }
        match self.payload() {
            Payload::Date(d) => Some((day_number(*d), true)),
            Payload::Time(t) => Some((day_number(t.date()), true)),
            Payload::Int(_) | Payload::UInt(_) | Payload::Float(_) | Payload::Decimal(_) => {
                self.to_f64().ok().map(|v| (v, false))
            }
            _ => None,
        }
    }

    /// Range label `"begin - end"` of the bucket holding this value.
    /// Unbinned specs render the value itself; missing or out-of-range values
    /// land in [`BINNING_OTHER_TEXT`].
    #[must_use]
    pub fn to_binning_string(&self, binning: &BinningSpec, format: DataFormat) -> String {
        if !binning.is_enabled() {
            return self.to_string();
        }
        let Some((value, as_date)) = self.binning_input() else {
            return BINNING_OTHER_TEXT.to_owned();
        };
        let Some((begin, end)) = binning.bucket(value) else {
            return BINNING_OTHER_TEXT.to_owned();
        };
        let end = if binning.kind == BinningKind::Custom {
            binning.display_end(begin, end, format)
        } else {
            end
        };
        format!(
            "{} - {}",
            render(begin, format, as_date),
            render(end, format, as_date)
        )
    }

    /// Midpoint of the bucket holding this value as a Float64 (a Date for
    /// date inputs); null when unbinned, missing or out of range.
    #[must_use]
    pub fn to_binning_middle_value(&self, binning: &BinningSpec) -> ScalarValue {
        let null = Self::null(DType::Float64);
        if !binning.is_enabled() {
            return null;
        }
        let Some((value, as_date)) = self.binning_input() else {
            return null;
        };
        let Some((begin, end)) = binning.bucket(value) else {
            return null;
        };
        let middle = (begin + end) / 2.0;
        if as_date {
            return date_of_day_number(middle.floor())
                .map_or(Self::null(DType::Date), ScalarValue::date);
        }
        ScalarValue::float64(middle).with_format(self.format())
    }

    /// Range label around a value already reduced to its bucket midpoint.
    #[must_use]
    pub fn formatted_with_binning(&self, binning: &BinningSpec) -> String {
        if !binning.is_enabled() || binning.is_degenerate() {
            return BINNING_OTHER_TEXT.to_owned();
        }
        let Some((value, as_date)) = self.binning_input() else {
            return BINNING_OTHER_TEXT.to_owned();
        };
        let half = binning.size / 2.0;
        let mut begin = binning.min;
        let mut end = binning.max;
        if value - half > begin {
            begin = value - half;
        } else {
            end = value + (value - begin);
        }
        if value + half < end {
            end = value + half;
        } else {
            begin = value - (end - value);
        }
        let format = self.format();
        let end = binning.display_end(begin, end, format);
        format!(
            "{} - {}",
            render(begin, format, as_date),
            render(end, format, as_date)
        )
    }
}
