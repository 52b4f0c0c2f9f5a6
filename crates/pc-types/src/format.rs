use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::temporal::MONTH_NAMES;
use crate::{Duration, Payload, ScalarValue, Status};

/// Display tag carried by a value; affects rendering only, never equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    #[default]
    None,
    Text,
    YesNo,
    TrueFalse,
    Number,
    Financial,
    DateV1,
    DateV2,
    DateV3,
    Duration,
    Time,
    DateTime,
    Percent,
    Quarter,
    Week,
    Month,
    DayV1,
    DayV2,
    DayV3,
}

impl DataFormat {
    fn date_pattern(self) -> Option<&'static str> {
        match self {
            Self::DateV1 => Some("%m/%d/%Y"),
            Self::DateV2 => Some("%d/%m/%Y"),
            Self::DateV3 => Some("%B %-d, %Y"),
            Self::DayV1 => Some("%A, %B %-d"),
            Self::DayV2 => Some("%B %-d"),
            Self::DayV3 => Some("%-d"),
            _ => None,
        }
    }
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn financial(v: f64) -> String {
    let text = format!("{:.2}", v.abs());
    let (whole, frac) = text.split_once('.').unwrap_or((text.as_str(), "00"));
    let sign = if v < 0.0 { "-" } else { "" };
    format!("{sign}$ {}.{frac}", group_thousands(whole))
}

/// Integral values print without a fraction; others keep up to six
/// decimals with trailing zeros trimmed.
pub(crate) fn plain_float(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_owned();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    if v.fract() == 0.0 && v.abs() < 1e15 {
        return format!("{v:.0}");
    }
    let text = format!("{v:.6}");
    text.trim_end_matches('0').trim_end_matches('.').to_owned()
}

fn number(v: f64, format: DataFormat) -> String {
    match format {
        DataFormat::Financial => financial(v),
        DataFormat::Percent => format!("{v:.2}%"),
        DataFormat::Number => format!("{v:.2}"),
        _ => plain_float(v),
    }
}

fn integer(v: i128, format: DataFormat) -> String {
    match format {
        DataFormat::Quarter => format!("Q{v}"),
        DataFormat::Week => format!("Wk {v}"),
        DataFormat::Month => usize::try_from(v)
            .ok()
            .and_then(|i| MONTH_NAMES.get(i))
            .map_or_else(|| v.to_string(), |name| (*name).to_owned()),
        DataFormat::Financial | DataFormat::Percent => number(v as f64, format),
        _ => v.to_string(),
    }
}

fn date(d: NaiveDate, format: DataFormat) -> String {
    d.format(format.date_pattern().unwrap_or("%Y-%m-%d"))
        .to_string()
}

fn time(t: NaiveDateTime, format: DataFormat) -> String {
    match format {
        DataFormat::Time => t.format("%-I:%M %p").to_string(),
        f if f.date_pattern().is_some() => date(t.date(), f),
        _ => t.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

fn duration(d: Duration, format: DataFormat) -> String {
    if format == DataFormat::Time {
        let secs = d.total_seconds().rem_euclid(86_400);
        if let Some(clock) = u32::try_from(secs)
            .ok()
            .and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, 0))
        {
            return clock.format("%-I:%M %p").to_string();
        }
    }
    d.to_string()
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Status::Valid => {}
            Status::Error => return f.write_str(self.error_description().unwrap_or("ERROR")),
            _ => return f.write_str("null"),
        }
        let format = self.format();
        match self.payload() {
            Payload::Missing => Ok(()),
            Payload::Int(v) => f.write_str(&integer(i128::from(*v), format)),
            Payload::UInt(v) => f.write_str(&integer(i128::from(*v), format)),
            Payload::Float(v) => f.write_str(&number(*v, format)),
            Payload::Decimal(v) => match format {
                DataFormat::Financial | DataFormat::Percent => {
                    f.write_str(&number(v.to_f64(), format))
                }
                _ => write!(f, "{v}"),
            },
            Payload::Bool(v) => f.write_str(match (format, *v) {
                (DataFormat::YesNo, true) => "Yes",
                (DataFormat::YesNo, false) => "No",
                (DataFormat::TrueFalse, true) => "True",
                (DataFormat::TrueFalse, false) => "False",
                (_, true) => "true",
                (_, false) => "false",
            }),
            Payload::Str(s) => f.write_str(s),
            Payload::Date(d) => f.write_str(&date(*d, format)),
            Payload::Time(t) => f.write_str(&time(*t, format)),
            Payload::Duration(d) => f.write_str(&duration(*d, format)),
            Payload::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::DataFormat;
    use crate::{DType, Duration, ScalarValue};

    #[test]
    fn floats_trim_trailing_zeros() {
        assert_eq!(ScalarValue::float64(3.0).to_string(), "3");
        assert_eq!(ScalarValue::float64(2.5).to_string(), "2.5");
        assert_eq!(ScalarValue::float64(1.0 / 3.0).to_string(), "0.333333");
    }

    #[test]
    fn financial_and_percent() {
        let v = ScalarValue::float64(-1234.5).with_format(DataFormat::Financial);
        assert_eq!(v.to_string(), "-$ 1,234.50");
        let p = ScalarValue::float64(12.5).with_format(DataFormat::Percent);
        assert_eq!(p.to_string(), "12.50%");
    }

    #[test]
    fn calendar_buckets_render_as_labels() {
        assert_eq!(
            ScalarValue::int64(3).with_format(DataFormat::Quarter).to_string(),
            "Q3"
        );
        assert_eq!(
            ScalarValue::int64(7).with_format(DataFormat::Month).to_string(),
            "August"
        );
        let d = ScalarValue::date(NaiveDate::from_ymd_opt(2016, 8, 8).expect("date"))
            .with_format(DataFormat::DayV1);
        assert_eq!(d.to_string(), "Monday, August 8");
        let clock = ScalarValue::duration(Duration::from_hms(15, 0, 0)).with_format(DataFormat::Time);
        assert_eq!(clock.to_string(), "3:00 PM");
    }

    #[test]
    fn non_valid_statuses_render_markers() {
        assert_eq!(ScalarValue::null(DType::Int64).to_string(), "null");
        assert_eq!(
            ScalarValue::error(DType::Float64, "bad parse").to_string(),
            "bad parse"
        );
        assert_eq!(
            ScalarValue::boolean(true).with_format(DataFormat::YesNo).to_string(),
            "Yes"
        );
    }
}
