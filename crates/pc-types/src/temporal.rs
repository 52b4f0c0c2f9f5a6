use std::fmt;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::{DType, DataFormat, Payload, ScalarValue, TypeError};

/// Year used to project dates for day-level grouping, so that February 29
/// always has a slot.
pub const LEAP_YEAR: i32 = 2016;

pub(crate) const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

const SECONDS_PER_DAY: i64 = 86_400;

/// Signed span with second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Duration {
    seconds: i64,
}

impl Duration {
    #[must_use]
    pub const fn from_seconds(seconds: i64) -> Self {
        Self { seconds }
    }

    #[must_use]
    pub const fn from_hms(hours: i64, minutes: i64, seconds: i64) -> Self {
        Self {
            seconds: hours * 3600 + minutes * 60 + seconds,
        }
    }

    #[must_use]
    pub const fn total_seconds(self) -> i64 {
        self.seconds
    }

    #[must_use]
    pub const fn hours(self) -> i64 {
        self.seconds / 3600
    }

    #[must_use]
    pub const fn minutes(self) -> i64 {
        (self.seconds % 3600) / 60
    }

    #[must_use]
    pub const fn seconds(self) -> i64 {
        self.seconds % 60
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.seconds < 0 { "-" } else { "" };
        let abs = Self::from_seconds(self.seconds.abs());
        write!(
            f,
            "{sign}{}:{:02}:{:02}",
            abs.hours(),
            abs.minutes(),
            abs.seconds()
        )
    }
}

/// Arbitrary-precision decimal kept in its textual form. Arithmetic goes
/// through `f64`; the text is what gets displayed and exported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Decimal(Arc<str>);

impl Decimal {
    pub fn parse(text: &str) -> Result<Self, TypeError> {
        let trimmed = text.trim();
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Self(Arc::from(trimmed))),
            _ => Err(TypeError::InvalidDecimal {
                text: text.to_owned(),
            }),
        }
    }

    #[must_use]
    pub fn from_f64(v: f64) -> Self {
        Self(Arc::from(v.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn to_f64(&self) -> f64 {
        self.0.parse::<f64>().unwrap_or(f64::NAN)
    }

    #[must_use]
    pub fn negate(&self) -> Self {
        match self.0.strip_prefix('-') {
            Some(rest) => Self(Arc::from(rest)),
            None => Self(Arc::from(format!("-{}", self.0))),
        }
    }

    #[must_use]
    pub fn abs(&self) -> Self {
        match self.0.strip_prefix('-') {
            Some(rest) => Self(Arc::from(rest)),
            None => self.clone(),
        }
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Calendar granularity a date/time pivot is reduced to before grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggLevel {
    #[default]
    None,
    Year,
    Quarter,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
    Date,
}

impl AggLevel {
    /// Dtype of a pivot value produced by this level from a date or time
    /// source column.
    #[must_use]
    pub fn output_dtype(self, source: DType) -> DType {
        match self {
            Self::None => source,
            Self::Year | Self::Quarter | Self::Month | Self::Week => DType::Int64,
            Self::Hour | Self::Minute | Self::Second => DType::Duration,
            Self::Day | Self::Date => DType::Date,
        }
    }

    /// Display format attached to values this level produces.
    #[must_use]
    pub fn data_format(self) -> DataFormat {
        match self {
            Self::None | Self::Year | Self::Date => DataFormat::None,
            Self::Quarter => DataFormat::Quarter,
            Self::Month => DataFormat::Month,
            Self::Week => DataFormat::Week,
            Self::Day => DataFormat::DayV1,
            Self::Hour | Self::Minute | Self::Second => DataFormat::Time,
        }
    }
}

fn datetime_of(value: &ScalarValue) -> Option<NaiveDateTime> {
    match value.payload() {
        Payload::Date(d) => d.and_hms_opt(0, 0, 0),
        Payload::Time(t) => Some(*t),
        _ => None,
    }
}

impl ScalarValue {
    /// Numeric bucket of a date or time at `level`. Month is zero based;
    /// hour/minute/second are fractions of the day truncated to that unit.
    #[must_use]
    pub fn to_agg_level_number(&self, level: AggLevel) -> Option<f64> {
        if !self.is_valid() {
            return None;
        }
        let t = datetime_of(self)?;
        let secs_of_day = i64::from(t.num_seconds_from_midnight());
        let out = match level {
            AggLevel::Year => f64::from(t.year()),
            AggLevel::Quarter => f64::from(t.month0() / 3 + 1),
            AggLevel::Month => f64::from(t.month0()),
            AggLevel::Week => f64::from(t.iso_week().week()),
            AggLevel::Hour => (secs_of_day / 3600 * 3600) as f64 / SECONDS_PER_DAY as f64,
            AggLevel::Minute => (secs_of_day / 60 * 60) as f64 / SECONDS_PER_DAY as f64,
            AggLevel::Second => secs_of_day as f64 / SECONDS_PER_DAY as f64,
            AggLevel::Day => f64::from(t.ordinal()),
            AggLevel::Date | AggLevel::None => return None,
        };
        Some(out)
    }

    /// Human label of a date or time at `level`.
    #[must_use]
    pub fn to_agg_level_string(&self, level: AggLevel) -> Option<String> {
        if !self.is_valid() {
            return None;
        }
        let t = datetime_of(self)?;
        let out = match level {
            AggLevel::Year => t.year().to_string(),
            AggLevel::Quarter => format!("Q{}", t.month0() / 3 + 1),
            AggLevel::Month => MONTH_NAMES[t.month0() as usize].to_owned(),
            AggLevel::Week => format!("Wk {}", t.iso_week().week()),
            AggLevel::Day => t.format("%A, %B %-d").to_string(),
            AggLevel::Hour => t.format("%-I:00 %p").to_string(),
            AggLevel::Minute => t.format("%-I:%M %p").to_string(),
            AggLevel::Second => t.format("%-I:%M:%S %p").to_string(),
            AggLevel::Date => t.date().format("%Y-%m-%d").to_string(),
            AggLevel::None => return None,
        };
        Some(out)
    }

    /// Pivot value for this date/time reduced to `level`. Values that are
    /// not dates or times pass through unchanged when `level` is `None`,
    /// and become their level label as a string otherwise.
    #[must_use]
    pub fn to_agg_level_value(&self, level: AggLevel) -> ScalarValue {
        if level == AggLevel::None {
            return self.clone();
        }
        if !self.is_valid() {
            return ScalarValue::null(level.output_dtype(self.dtype()));
        }
        let Some(t) = datetime_of(self) else {
            return ScalarValue::string(self.to_string());
        };
        let secs_of_day = i64::from(t.num_seconds_from_midnight());
        let value = match level {
            AggLevel::Year => ScalarValue::int64(i64::from(t.year())),
            AggLevel::Quarter => ScalarValue::int64(i64::from(t.month0() / 3 + 1)),
            AggLevel::Month => ScalarValue::int64(i64::from(t.month0())),
            AggLevel::Week => ScalarValue::int64(i64::from(t.iso_week().week())),
            AggLevel::Day => match NaiveDate::from_ymd_opt(LEAP_YEAR, t.month(), t.day()) {
                Some(d) => ScalarValue::date(d),
                None => ScalarValue::null(DType::Date),
            },
            AggLevel::Date => ScalarValue::date(t.date()),
            AggLevel::Hour => {
                ScalarValue::duration(Duration::from_seconds(secs_of_day / 3600 * 3600))
            }
            AggLevel::Minute => ScalarValue::duration(Duration::from_seconds(secs_of_day / 60 * 60)),
            AggLevel::Second => ScalarValue::duration(Duration::from_seconds(secs_of_day)),
            AggLevel::None => return self.clone(),
        };
        value.with_format(level.data_format())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{AggLevel, Duration, LEAP_YEAR};
    use crate::{DType, Decimal, ScalarValue};

    fn sample() -> ScalarValue {
        let t = NaiveDate::from_ymd_opt(2024, 8, 8)
            .and_then(|d| d.and_hms_opt(15, 20, 5))
            .expect("valid timestamp");
        ScalarValue::time(t)
    }

    #[test]
    fn agg_level_numbers() {
        let v = sample();
        assert_eq!(v.to_agg_level_number(AggLevel::Year), Some(2024.0));
        assert_eq!(v.to_agg_level_number(AggLevel::Quarter), Some(3.0));
        assert_eq!(v.to_agg_level_number(AggLevel::Month), Some(7.0));
        assert_eq!(v.to_agg_level_number(AggLevel::Week), Some(32.0));
        assert_eq!(
            v.to_agg_level_number(AggLevel::Hour),
            Some(15.0 * 3600.0 / 86_400.0)
        );
    }

    #[test]
    fn agg_level_strings() {
        let v = sample();
        assert_eq!(v.to_agg_level_string(AggLevel::Year).as_deref(), Some("2024"));
        assert_eq!(v.to_agg_level_string(AggLevel::Quarter).as_deref(), Some("Q3"));
        assert_eq!(v.to_agg_level_string(AggLevel::Month).as_deref(), Some("August"));
        assert_eq!(v.to_agg_level_string(AggLevel::Week).as_deref(), Some("Wk 32"));
        assert_eq!(
            v.to_agg_level_string(AggLevel::Day).as_deref(),
            Some("Thursday, August 8")
        );
        assert_eq!(v.to_agg_level_string(AggLevel::Hour).as_deref(), Some("3:00 PM"));
    }

    #[test]
    fn day_level_projects_into_leap_year() {
        let feb29 = ScalarValue::date(NaiveDate::from_ymd_opt(2020, 2, 29).expect("date"));
        let out = feb29.to_agg_level_value(AggLevel::Day);
        assert_eq!(
            out.as_date(),
            NaiveDate::from_ymd_opt(LEAP_YEAR, 2, 29)
        );
    }

    #[test]
    fn hour_level_truncates_to_duration() {
        let out = sample().to_agg_level_value(AggLevel::Hour);
        assert_eq!(out.dtype(), DType::Duration);
        assert_eq!(out.as_duration(), Some(Duration::from_hms(15, 0, 0)));
    }

    #[test]
    fn duration_display_and_decimal_parse() {
        assert_eq!(Duration::from_hms(1, 2, 3).to_string(), "1:02:03");
        assert_eq!(Duration::from_seconds(-61).to_string(), "-0:01:01");
        assert!(Decimal::parse("12.50").is_ok());
        assert!(Decimal::parse("twelve").is_err());
        assert_eq!(Decimal::parse("-3.5").expect("decimal").abs().as_str(), "3.5");
    }
}
