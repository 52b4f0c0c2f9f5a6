#![forbid(unsafe_code)]

mod binning;
mod format;
mod symbol;
mod temporal;

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use binning::{BINNING_OTHER_TEXT, BinningKind, BinningSpec};
pub use format::DataFormat;
pub use symbol::SymbolTable;
pub use temporal::{AggLevel, Decimal, Duration, LEAP_YEAR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    None,
    Int64,
    Int32,
    Int16,
    Int8,
    UInt64,
    UInt32,
    UInt16,
    UInt8,
    Float64,
    Float32,
    Bool,
    Str,
    Date,
    Time,
    Duration,
    Decimal,
    ListStr,
    ListBool,
    ListInt64,
    ListFloat64,
    ListDate,
    ListTime,
    ListDuration,
}

impl DType {
    #[must_use]
    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_floating() || self == Self::Decimal
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        self.is_signed_integer() || self.is_unsigned_integer()
    }

    #[must_use]
    pub fn is_signed_integer(self) -> bool {
        matches!(self, Self::Int64 | Self::Int32 | Self::Int16 | Self::Int8)
    }

    #[must_use]
    pub fn is_unsigned_integer(self) -> bool {
        matches!(
            self,
            Self::UInt64 | Self::UInt32 | Self::UInt16 | Self::UInt8
        )
    }

    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float64 | Self::Float32)
    }

    #[must_use]
    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::Time)
    }

    #[must_use]
    pub fn is_list(self) -> bool {
        self.element_dtype().is_some()
    }

    /// Element dtype of a list dtype.
    #[must_use]
    pub fn element_dtype(self) -> Option<Self> {
        match self {
            Self::ListStr => Some(Self::Str),
            Self::ListBool => Some(Self::Bool),
            Self::ListInt64 => Some(Self::Int64),
            Self::ListFloat64 => Some(Self::Float64),
            Self::ListDate => Some(Self::Date),
            Self::ListTime => Some(Self::Time),
            Self::ListDuration => Some(Self::Duration),
            _ => None,
        }
    }

    /// List dtype holding elements of this dtype.
    #[must_use]
    pub fn list_dtype(self) -> Option<Self> {
        match self {
            Self::Str => Some(Self::ListStr),
            Self::Bool => Some(Self::ListBool),
            Self::Int64 => Some(Self::ListInt64),
            Self::Float64 => Some(Self::ListFloat64),
            Self::Date => Some(Self::ListDate),
            Self::Time => Some(Self::ListTime),
            Self::Duration => Some(Self::ListDuration),
            _ => None,
        }
    }

    /// Comparison family. Numeric dtypes share one family; every other
    /// dtype is its own.
    #[must_use]
    pub fn family(self) -> u8 {
        match self {
            Self::None => 0,
            d if d.is_numeric() => 1,
            Self::Bool => 2,
            Self::Str => 3,
            Self::Date => 4,
            Self::Time => 5,
            Self::Duration => 6,
            Self::ListStr => 7,
            Self::ListBool => 8,
            Self::ListInt64 => 9,
            Self::ListFloat64 => 10,
            Self::ListDate => 11,
            Self::ListTime => 12,
            Self::ListDuration => 13,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Valid,
    Invalid,
    Error,
    Empty,
    Cleared,
}

impl Status {
    fn rank(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::Cleared => 1,
            Self::Empty => 2,
            Self::Error => 3,
            Self::Valid => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Missing,
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Str(Arc<str>),
    Date(NaiveDate),
    Time(NaiveDateTime),
    Duration(Duration),
    Decimal(Decimal),
    List(Arc<[ScalarValue]>),
}

/// A single cell: dtype, validity status, display format and payload.
///
/// Equality and ordering are total so values can key ordered and hashed
/// maps. Numeric dtypes compare by value across widths; every other dtype
/// only matches itself. Non-valid values order before valid ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarValue {
    dtype: DType,
    status: Status,
    #[serde(default)]
    format: DataFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Arc<str>>,
    payload: Payload,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("cannot cast scalar of dtype {from:?} to {to:?}")]
    InvalidCast { from: DType, to: DType },
    #[error("value of dtype {dtype:?} is not numeric")]
    NonNumericValue { dtype: DType },
    #[error("value is missing ({status:?})")]
    ValueIsMissing { status: Status },
    #[error("list of {list:?} cannot hold an element of dtype {element:?}")]
    ListElementMismatch { list: DType, element: DType },
    #[error("{dtype:?} is not a list dtype")]
    NotAList { dtype: DType },
    #[error("invalid decimal literal {text:?}")]
    InvalidDecimal { text: String },
}

impl ScalarValue {
    fn valid(dtype: DType, payload: Payload) -> Self {
        Self {
            dtype,
            status: Status::Valid,
            format: DataFormat::None,
            error: None,
            payload,
        }
    }

    fn with_status(dtype: DType, status: Status) -> Self {
        Self {
            dtype,
            status,
            format: DataFormat::None,
            error: None,
            payload: Payload::Missing,
        }
    }

    /// Untyped valid value; the identity for `add`.
    #[must_use]
    pub fn none() -> Self {
        Self::with_status(DType::None, Status::Valid)
    }

    #[must_use]
    pub fn null(dtype: DType) -> Self {
        Self::with_status(dtype, Status::Invalid)
    }

    #[must_use]
    pub fn empty(dtype: DType) -> Self {
        Self::with_status(dtype, Status::Empty)
    }

    #[must_use]
    pub fn cleared(dtype: DType) -> Self {
        Self::with_status(dtype, Status::Cleared)
    }

    #[must_use]
    pub fn error(dtype: DType, description: impl Into<Arc<str>>) -> Self {
        let mut out = Self::with_status(dtype, Status::Error);
        out.error = Some(description.into());
        out
    }

    #[must_use]
    pub fn int64(v: i64) -> Self {
        Self::valid(DType::Int64, Payload::Int(v))
    }

    #[must_use]
    pub fn int32(v: i32) -> Self {
        Self::valid(DType::Int32, Payload::Int(i64::from(v)))
    }

    #[must_use]
    pub fn int16(v: i16) -> Self {
        Self::valid(DType::Int16, Payload::Int(i64::from(v)))
    }

    #[must_use]
    pub fn int8(v: i8) -> Self {
        Self::valid(DType::Int8, Payload::Int(i64::from(v)))
    }

    #[must_use]
    pub fn uint64(v: u64) -> Self {
        Self::valid(DType::UInt64, Payload::UInt(v))
    }

    #[must_use]
    pub fn uint32(v: u32) -> Self {
        Self::valid(DType::UInt32, Payload::UInt(u64::from(v)))
    }

    #[must_use]
    pub fn uint16(v: u16) -> Self {
        Self::valid(DType::UInt16, Payload::UInt(u64::from(v)))
    }

    #[must_use]
    pub fn uint8(v: u8) -> Self {
        Self::valid(DType::UInt8, Payload::UInt(u64::from(v)))
    }

    #[must_use]
    pub fn float64(v: f64) -> Self {
        Self::valid(DType::Float64, Payload::Float(v))
    }

    #[must_use]
    pub fn float32(v: f32) -> Self {
        Self::valid(DType::Float32, Payload::Float(f64::from(v)))
    }

    #[must_use]
    pub fn boolean(v: bool) -> Self {
        Self::valid(DType::Bool, Payload::Bool(v))
    }

    #[must_use]
    pub fn string(v: impl Into<Arc<str>>) -> Self {
        Self::valid(DType::Str, Payload::Str(v.into()))
    }

    /// String value whose storage is shared through `symbols`.
    #[must_use]
    pub fn interned(symbols: &SymbolTable, v: &str) -> Self {
        Self::valid(DType::Str, Payload::Str(symbols.intern(v)))
    }

    #[must_use]
    pub fn date(v: NaiveDate) -> Self {
        Self::valid(DType::Date, Payload::Date(v))
    }

    #[must_use]
    pub fn time(v: NaiveDateTime) -> Self {
        Self::valid(DType::Time, Payload::Time(v))
    }

    #[must_use]
    pub fn duration(v: Duration) -> Self {
        Self::valid(DType::Duration, Payload::Duration(v))
    }

    #[must_use]
    pub fn decimal(v: Decimal) -> Self {
        Self::valid(DType::Decimal, Payload::Decimal(v))
    }

    /// Immutable list value. Every valid element must carry the list's
    /// element dtype; invalid elements are rejected as well since lists
    /// never hold holes.
    pub fn list(dtype: DType, values: Vec<ScalarValue>) -> Result<Self, TypeError> {
        let element = dtype.element_dtype().ok_or(TypeError::NotAList { dtype })?;
        for value in &values {
            if value.dtype != element || !value.is_valid() {
                return Err(TypeError::ListElementMismatch {
                    list: dtype,
                    element: value.dtype,
                });
            }
        }
        Ok(Self::valid(dtype, Payload::List(values.into())))
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn format(&self) -> DataFormat {
        self.format
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = format;
        self
    }

    pub fn set_format(&mut self, format: DataFormat) {
        self.format = format;
    }

    #[must_use]
    pub fn error_description(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status == Status::Valid
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.status == Status::Cleared
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.dtype == DType::None
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        self.dtype.is_numeric()
    }

    #[must_use]
    pub fn is_str(&self) -> bool {
        self.dtype == DType::Str
    }

    #[must_use]
    pub fn is_list(&self) -> bool {
        self.dtype.is_list()
    }

    #[must_use]
    pub fn is_nan(&self) -> bool {
        matches!(self.payload, Payload::Float(v) if v.is_nan())
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[ScalarValue]> {
        match &self.payload {
            Payload::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn list_len(&self) -> usize {
        self.as_list().map_or(0, <[ScalarValue]>::len)
    }

    #[must_use]
    pub fn is_list_empty(&self) -> bool {
        self.is_list() && self.list_len() == 0
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match &self.payload {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self.payload {
            Payload::Bool(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self.payload {
            Payload::Date(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_time(&self) -> Option<NaiveDateTime> {
        match self.payload {
            Payload::Time(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_duration(&self) -> Option<Duration> {
        match self.payload {
            Payload::Duration(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        if !self.is_valid() {
            return Err(TypeError::ValueIsMissing {
                status: self.status,
            });
        }
        match &self.payload {
            Payload::Int(v) => Ok(*v as f64),
            Payload::UInt(v) => Ok(*v as f64),
            Payload::Float(v) => Ok(*v),
            Payload::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Payload::Decimal(v) => Ok(v.to_f64()),
            Payload::Duration(v) => Ok(v.total_seconds() as f64),
            _ => Err(TypeError::NonNumericValue { dtype: self.dtype }),
        }
    }

    pub fn to_i64(&self) -> Result<i64, TypeError> {
        if !self.is_valid() {
            return Err(TypeError::ValueIsMissing {
                status: self.status,
            });
        }
        match &self.payload {
            Payload::Int(v) => Ok(*v),
            Payload::UInt(v) => i64::try_from(*v).map_err(|_| TypeError::InvalidCast {
                from: self.dtype,
                to: DType::Int64,
            }),
            Payload::Float(v) if v.is_finite() => Ok(v.trunc() as i64),
            Payload::Bool(v) => Ok(i64::from(*v)),
            Payload::Decimal(v) => Ok(v.to_f64().trunc() as i64),
            Payload::Duration(v) => Ok(v.total_seconds()),
            _ => Err(TypeError::NonNumericValue { dtype: self.dtype }),
        }
    }

    /// Truthiness used by boolean aggregates: valid and non-zero, non-empty
    /// or `true`.
    #[must_use]
    pub fn truthy(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        match &self.payload {
            Payload::Missing => false,
            Payload::Int(v) => *v != 0,
            Payload::UInt(v) => *v != 0,
            Payload::Float(v) => *v != 0.0 && !v.is_nan(),
            Payload::Bool(v) => *v,
            Payload::Str(s) => !s.is_empty(),
            Payload::Decimal(v) => v.to_f64() != 0.0,
            Payload::Duration(v) => v.total_seconds() != 0,
            Payload::List(items) => !items.is_empty(),
            Payload::Date(_) | Payload::Time(_) => true,
        }
    }

    /// Re-expresses a numeric value in another numeric dtype, wrapping
    /// integers to the target width. Non-numeric targets or sources yield
    /// an invalid value of the target dtype.
    #[must_use]
    pub fn coerce_numeric(&self, target: DType) -> Self {
        if !self.is_valid() {
            return Self::with_status(target, self.status);
        }
        if !self.is_numeric() || !target.is_numeric() {
            return Self::null(target);
        }
        let payload = if target.is_signed_integer() {
            match self.to_i64() {
                Ok(v) => Payload::Int(fit_int(target, v)),
                Err(_) => return Self::null(target),
            }
        } else if target.is_unsigned_integer() {
            match &self.payload {
                Payload::UInt(v) => Payload::UInt(fit_uint(target, *v)),
                _ => match self.to_i64() {
                    Ok(v) => Payload::UInt(fit_uint(target, v as u64)),
                    Err(_) => return Self::null(target),
                },
            }
        } else if target == DType::Decimal {
            match self.to_f64() {
                Ok(v) => Payload::Decimal(Decimal::from_f64(v)),
                Err(_) => return Self::null(target),
            }
        } else {
            match self.to_f64() {
                Ok(v) => Payload::Float(fit_float(target, v)),
                Err(_) => return Self::null(target),
            }
        };
        Self::valid(target, payload).with_format(self.format)
    }

    /// Family-aware comparison. `None` when either side is not valid or the
    /// two values belong to different dtype families.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        if !self.is_valid() || !other.is_valid() || self.dtype.family() != other.dtype.family() {
            return None;
        }
        Some(self.valid_cmp(other))
    }

    #[must_use]
    pub fn lt(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Less)
    }

    #[must_use]
    pub fn le(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            Some(Ordering::Less | Ordering::Equal)
        )
    }

    #[must_use]
    pub fn gt(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Greater)
    }

    #[must_use]
    pub fn ge(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            Some(Ordering::Greater | Ordering::Equal)
        )
    }

    fn valid_cmp(&self, other: &Self) -> Ordering {
        match self.dtype.family().cmp(&other.dtype.family()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        match (&self.payload, &other.payload) {
            (Payload::Int(a), Payload::Int(b)) => a.cmp(b),
            (Payload::UInt(a), Payload::UInt(b)) => a.cmp(b),
            (Payload::Int(a), Payload::UInt(b)) => i128::from(*a).cmp(&i128::from(*b)),
            (Payload::UInt(a), Payload::Int(b)) => i128::from(*a).cmp(&i128::from(*b)),
            (Payload::Int(a), Payload::Float(_) | Payload::Decimal(_)) => {
                int_float_cmp(i128::from(*a), other.to_f64().unwrap_or(f64::NAN))
            }
            (Payload::UInt(a), Payload::Float(_) | Payload::Decimal(_)) => {
                int_float_cmp(i128::from(*a), other.to_f64().unwrap_or(f64::NAN))
            }
            (Payload::Float(_) | Payload::Decimal(_), Payload::Int(b)) => {
                int_float_cmp(i128::from(*b), self.to_f64().unwrap_or(f64::NAN)).reverse()
            }
            (Payload::Float(_) | Payload::Decimal(_), Payload::UInt(b)) => {
                int_float_cmp(i128::from(*b), self.to_f64().unwrap_or(f64::NAN)).reverse()
            }
            (
                Payload::Int(_) | Payload::UInt(_) | Payload::Float(_) | Payload::Decimal(_),
                Payload::Int(_) | Payload::UInt(_) | Payload::Float(_) | Payload::Decimal(_),
            ) => float_total_cmp(
                self.to_f64().unwrap_or(f64::NAN),
                other.to_f64().unwrap_or(f64::NAN),
            ),
            (Payload::Bool(a), Payload::Bool(b)) => a.cmp(b),
            (Payload::Str(a), Payload::Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Payload::Date(a), Payload::Date(b)) => a.cmp(b),
            (Payload::Time(a), Payload::Time(b)) => a.cmp(b),
            (Payload::Duration(a), Payload::Duration(b)) => a.cmp(b),
            (Payload::List(a), Payload::List(b)) => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| x.cmp(y))
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            _ => Ordering::Equal,
        }
    }

    #[must_use]
    pub fn negate(&self) -> Self {
        if !self.is_valid() {
            return Self::null(self.dtype).with_format(self.format);
        }
        let payload = match &self.payload {
            Payload::Int(v) => Payload::Int(fit_int(self.dtype, v.wrapping_neg())),
            Payload::UInt(v) => Payload::UInt(fit_uint(self.dtype, !*v)),
            Payload::Float(v) => Payload::Float(-*v),
            Payload::Decimal(v) => Payload::Decimal(v.negate()),
            _ => return Self::null(self.dtype).with_format(self.format),
        };
        Self::valid(self.dtype, payload).with_format(self.format)
    }

    #[must_use]
    pub fn abs(&self) -> Self {
        if !self.is_valid() {
            return Self::null(self.dtype).with_format(self.format);
        }
        let payload = match &self.payload {
            Payload::Int(v) => Payload::Int(fit_int(self.dtype, v.wrapping_abs())),
            Payload::UInt(v) => Payload::UInt(*v),
            Payload::Float(v) => Payload::Float(v.abs()),
            Payload::Decimal(v) => Payload::Decimal(v.abs()),
            _ => return Self::null(self.dtype).with_format(self.format),
        };
        Self::valid(self.dtype, payload).with_format(self.format)
    }

    /// Same-dtype numeric addition. An invalid operand yields the other
    /// operand; mismatched or non-numeric dtypes yield an invalid value.
    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        if !other.is_valid() {
            return self.clone();
        }
        if !self.is_valid() || self.is_none() {
            return other.clone();
        }
        if other.is_none() {
            return self.clone();
        }
        self.binary_same_dtype(other, i64::wrapping_add, u64::wrapping_add, |a, b| a + b)
    }

    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        if !other.is_valid() {
            return self.clone();
        }
        if !self.is_valid() || self.is_none() {
            return other.negate();
        }
        if other.is_none() {
            return self.clone();
        }
        self.binary_same_dtype(other, i64::wrapping_sub, u64::wrapping_sub, |a, b| a - b)
    }

    fn binary_same_dtype(
        &self,
        other: &Self,
        int_op: fn(i64, i64) -> i64,
        uint_op: fn(u64, u64) -> u64,
        float_op: fn(f64, f64) -> f64,
    ) -> Self {
        if self.dtype != other.dtype || !self.dtype.is_numeric() {
            return Self::null(self.dtype).with_format(self.format);
        }
        let payload = match (&self.payload, &other.payload) {
            (Payload::Int(a), Payload::Int(b)) => Payload::Int(fit_int(self.dtype, int_op(*a, *b))),
            (Payload::UInt(a), Payload::UInt(b)) => {
                Payload::UInt(fit_uint(self.dtype, uint_op(*a, *b)))
            }
            (Payload::Float(a), Payload::Float(b)) => {
                Payload::Float(fit_float(self.dtype, float_op(*a, *b)))
            }
            (Payload::Decimal(a), Payload::Decimal(b)) => {
                Payload::Decimal(Decimal::from_f64(float_op(a.to_f64(), b.to_f64())))
            }
            _ => return Self::null(self.dtype).with_format(self.format),
        };
        Self::valid(self.dtype, payload).with_format(self.format)
    }

    /// Product with numeric promotion: floating if either side is floating,
    /// signed if either side is signed, unsigned otherwise.
    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        if !self.is_valid() || !other.is_valid() || !self.is_numeric() || !other.is_numeric() {
            return Self::null(DType::Float64);
        }
        let floating = self.dtype.is_floating()
            || other.dtype.is_floating()
            || self.dtype == DType::Decimal
            || other.dtype == DType::Decimal;
        if floating {
            return match (self.to_f64(), other.to_f64()) {
                (Ok(a), Ok(b)) => Self::float64(a * b),
                _ => Self::null(DType::Float64),
            };
        }
        if let (Payload::UInt(a), Payload::UInt(b)) = (&self.payload, &other.payload) {
            return Self::uint64(a.wrapping_mul(*b));
        }
        match (self.to_i64(), other.to_i64()) {
            (Ok(a), Ok(b)) => Self::int64(a.wrapping_mul(b)),
            _ => Self::null(DType::Int64),
        }
    }

    /// Case-insensitive substring test on the display text. Lists match when
    /// any element matches.
    #[must_use]
    pub fn contains(&self, needle: &Self) -> bool {
        if !self.is_valid() {
            return false;
        }
        if let Some(items) = self.as_list() {
            return items.iter().any(|item| item.contains(needle));
        }
        let hay = self.to_string().to_lowercase();
        hay.contains(&needle.to_string().to_lowercase())
    }

    #[must_use]
    pub fn not_contains(&self, needle: &Self) -> bool {
        !self.contains(needle)
    }

    #[must_use]
    pub fn begins_with(&self, needle: &Self) -> bool {
        self.str_predicate(needle, |hay, n| hay.starts_with(n))
    }

    #[must_use]
    pub fn ends_with(&self, needle: &Self) -> bool {
        self.str_predicate(needle, |hay, n| hay.ends_with(n))
    }

    /// True when `needle` occurs at the start of the text or right after a
    /// space.
    #[must_use]
    pub fn edge(&self, needle: &Self) -> bool {
        self.str_predicate(needle, |hay, n| {
            hay.starts_with(n) || hay.contains(&format!(" {n}"))
        })
    }

    fn str_predicate(&self, needle: &Self, test: impl Fn(&str, &str) -> bool + Copy) -> bool {
        if !self.is_valid() || !needle.is_valid() {
            return false;
        }
        if let Some(items) = self.as_list() {
            return items.iter().any(|item| item.str_predicate(needle, test));
        }
        match (self.as_str(), needle.as_str()) {
            (Some(hay), Some(n)) => test(&hay.to_lowercase(), &n.to_lowercase()),
            _ => false,
        }
    }

    /// True when this value (or any element, for lists) is a member of
    /// `bag` (a list value or a scalar).
    #[must_use]
    pub fn in_any(&self, bag: &Self) -> bool {
        if !self.is_valid() || !bag.is_valid() {
            return false;
        }
        let members = bag.as_list().unwrap_or(std::slice::from_ref(bag));
        match self.as_list() {
            Some(items) => items.iter().any(|item| members.contains(item)),
            None => members.contains(self),
        }
    }

    /// True when every member of `bag` appears in this value.
    #[must_use]
    pub fn in_all(&self, bag: &Self) -> bool {
        if !self.is_valid() || !bag.is_valid() {
            return false;
        }
        let members = bag.as_list().unwrap_or(std::slice::from_ref(bag));
        match self.as_list() {
            Some(items) => members.iter().all(|member| items.contains(member)),
            None => members.iter().all(|member| member == self),
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScalarValue {}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.status.rank().cmp(&other.status.rank()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        if !self.is_valid() {
            return self.dtype.family().cmp(&other.dtype.family());
        }
        self.valid_cmp(other)
    }
}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.status.rank().hash(state);
        self.dtype.family().hash(state);
        if !self.is_valid() {
            return;
        }
        match &self.payload {
            Payload::Int(_) | Payload::UInt(_) | Payload::Float(_) | Payload::Decimal(_) => {
                canonical_f64_bits(self.to_f64().unwrap_or(f64::NAN)).hash(state);
            }
            Payload::Bool(v) => v.hash(state),
            Payload::Str(s) => s.hash(state),
            Payload::Date(d) => d.hash(state),
            Payload::Time(t) => t.hash(state),
            Payload::Duration(d) => d.hash(state),
            Payload::List(items) => {
                items.len().hash(state);
                for item in items.iter() {
                    item.hash(state);
                }
            }
            Payload::Missing => {}
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::int64(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::float64(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::boolean(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::string(v)
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::string(v)
    }
}

impl From<NaiveDate> for ScalarValue {
    fn from(v: NaiveDate) -> Self {
        Self::date(v)
    }
}

impl From<NaiveDateTime> for ScalarValue {
    fn from(v: NaiveDateTime) -> Self {
        Self::time(v)
    }
}

impl From<Duration> for ScalarValue {
    fn from(v: Duration) -> Self {
        Self::duration(v)
    }
}

fn float_total_cmp(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Exact comparison of an integer against a float, without rounding the
/// integer through `f64`. NaN sorts above every integer.
fn int_float_cmp(a: i128, b: f64) -> Ordering {
    // 2^127; every i64 and u64 lies strictly inside this range.
    const LIMIT: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0;
    if b.is_nan() || b >= LIMIT {
        return Ordering::Less;
    }
    if b < -LIMIT {
        return Ordering::Greater;
    }
    let whole = b.trunc();
    match a.cmp(&(whole as i128)) {
        Ordering::Equal => 0.0f64.partial_cmp(&(b - whole)).unwrap_or(Ordering::Equal),
        unequal => unequal,
    }
}

fn canonical_f64_bits(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

fn fit_int(dtype: DType, v: i64) -> i64 {
    match dtype {
        DType::Int32 => i64::from(v as i32),
        DType::Int16 => i64::from(v as i16),
        DType::Int8 => i64::from(v as i8),
        _ => v,
    }
}

fn fit_uint(dtype: DType, v: u64) -> u64 {
    match dtype {
        DType::UInt32 => u64::from(v as u32),
        DType::UInt16 => u64::from(v as u16),
        DType::UInt8 => u64::from(v as u8),
        _ => v,
    }
}

fn fit_float(dtype: DType, v: f64) -> f64 {
    if dtype == DType::Float32 {
        f64::from(v as f32)
    } else {
        v
    }
}
