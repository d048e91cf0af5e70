#![forbid(unsafe_code)]
//! Runtime values carried by input entities.
//!
//! Scalars, strings, temporal and spatial values, plus one level of arrays
//! over any of them. [`codec::ValueTypes`] maps each kind to its wire tag.

use std::fmt;

use time::{Date, PrimitiveDateTime, Time, UtcOffset};

use crate::types::{Result, StageError};

pub mod codec;

pub use codec::ValueTypes;

/// Scalar kinds a [`Value`] or an array element may have.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ValueKind {
    /// `bool`
    Bool,
    /// `i8`
    Byte,
    /// `i16`
    Short,
    /// `i32`
    Int,
    /// `i64`
    Long,
    /// `f32`
    Float,
    /// `f64`
    Double,
    /// Unicode scalar value.
    Char,
    /// UTF-8 string.
    String,
    /// Calendar date without zone.
    Date,
    /// Time of day without offset.
    LocalTime,
    /// Time of day with a fixed offset.
    Time,
    /// Date and time without zone.
    LocalDateTime,
    /// Instant with an offset or a named zone.
    DateTime,
    /// Calendar-aware duration.
    Duration,
    /// Spatial point.
    Point,
}

impl ValueKind {
    /// Every scalar kind, in registration order.
    pub const ALL: [ValueKind; 16] = [
        ValueKind::Bool,
        ValueKind::Byte,
        ValueKind::Short,
        ValueKind::Int,
        ValueKind::Long,
        ValueKind::Float,
        ValueKind::Double,
        ValueKind::Char,
        ValueKind::String,
        ValueKind::Date,
        ValueKind::LocalTime,
        ValueKind::Time,
        ValueKind::LocalDateTime,
        ValueKind::DateTime,
        ValueKind::Duration,
        ValueKind::Point,
    ];

    pub(crate) const fn ordinal(self) -> usize {
        self as usize
    }
}

/// Time of day with a fixed UTC offset.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OffsetTime {
    /// Local wall-clock time.
    pub time: Time,
    /// Offset from UTC.
    pub offset: UtcOffset,
}

/// Zone attached to a [`ZonedDateTime`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Zone {
    /// Fixed offset from UTC.
    Offset(UtcOffset),
    /// Region identifier such as `Europe/Stockholm`.
    Named(String),
}

/// Instant plus the zone it was expressed in.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ZonedDateTime {
    /// Seconds since the Unix epoch.
    pub epoch_second: i64,
    /// Nanoseconds within the second, `0..1_000_000_000`.
    pub nano: u32,
    /// Offset or region.
    pub zone: Zone,
}

impl ZonedDateTime {
    /// Builds a value with a fixed offset.
    pub fn with_offset(epoch_second: i64, nano: u32, offset: UtcOffset) -> Self {
        Self {
            epoch_second,
            nano,
            zone: Zone::Offset(offset),
        }
    }

    /// Builds a value with a named zone.
    pub fn with_zone(epoch_second: i64, nano: u32, zone: impl Into<String>) -> Self {
        Self {
            epoch_second,
            nano,
            zone: Zone::Named(zone.into()),
        }
    }
}

/// Duration with calendar components kept apart.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct DurationValue {
    /// Whole months.
    pub months: i64,
    /// Whole days.
    pub days: i64,
    /// Seconds.
    pub seconds: i64,
    /// Nanoseconds adjustment.
    pub nanos: i32,
}

/// Point in a coordinate reference system.
#[derive(Clone, Debug, PartialEq)]
pub struct PointValue {
    /// Coordinate reference system code (for example 4326 or 7203).
    pub crs: i32,
    /// One entry per dimension.
    pub coordinates: Vec<f64>,
}

/// Homogeneous one-level array.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayValue {
    element: ValueKind,
    items: Vec<Value>,
}

impl ArrayValue {
    /// Builds an array, rejecting items that are null, nested arrays or of another kind.
    pub fn new(element: ValueKind, items: Vec<Value>) -> Result<Self> {
        for (i, item) in items.iter().enumerate() {
            match item.kind() {
                Some(kind) if kind == element => {}
                Some(kind) => {
                    return Err(StageError::invalid(format!(
                        "array of {element:?} holds a {kind:?} at index {i}"
                    )))
                }
                None => {
                    return Err(StageError::invalid(format!(
                        "array of {element:?} holds a null or nested array at index {i}"
                    )))
                }
            }
        }
        Ok(Self { element, items })
    }

    /// An empty array of the given element kind.
    pub fn empty(element: ValueKind) -> Self {
        Self {
            element,
            items: Vec::new(),
        }
    }

    /// Element kind.
    pub fn element(&self) -> ValueKind {
        self.element
    }

    /// Elements.
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true for a zero-length array.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Tagged runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent value. Never encoded; properties holding it are skipped.
    Null,
    /// Boolean.
    Bool(bool),
    /// 8-bit integer.
    Byte(i8),
    /// 16-bit integer.
    Short(i16),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Single character.
    Char(char),
    /// UTF-8 string.
    String(String),
    /// Date.
    Date(Date),
    /// Time without offset.
    LocalTime(Time),
    /// Time with offset.
    Time(OffsetTime),
    /// Date-time without zone.
    LocalDateTime(PrimitiveDateTime),
    /// Date-time with offset or zone.
    DateTime(ZonedDateTime),
    /// Duration.
    Duration(DurationValue),
    /// Point.
    Point(PointValue),
    /// One-level array.
    Array(ArrayValue),
}

impl Value {
    /// Scalar kind, or `None` for [`Value::Null`] and arrays.
    pub fn kind(&self) -> Option<ValueKind> {
        let kind = match self {
            Value::Null | Value::Array(_) => return None,
            Value::Bool(_) => ValueKind::Bool,
            Value::Byte(_) => ValueKind::Byte,
            Value::Short(_) => ValueKind::Short,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Char(_) => ValueKind::Char,
            Value::String(_) => ValueKind::String,
            Value::Date(_) => ValueKind::Date,
            Value::LocalTime(_) => ValueKind::LocalTime,
            Value::Time(_) => ValueKind::Time,
            Value::LocalDateTime(_) => ValueKind::LocalDateTime,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Duration(_) => ValueKind::Duration,
            Value::Point(_) => ValueKind::Point,
        };
        Some(kind)
    }

    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<ArrayValue> for Value {
    fn from(value: ArrayValue) -> Self {
        Value::Array(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Char(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Date(v) => write!(f, "{v}"),
            Value::LocalTime(v) => write!(f, "{v}"),
            Value::Time(v) => write!(f, "{}{}", v.time, v.offset),
            Value::LocalDateTime(v) => write!(f, "{v}"),
            Value::DateTime(v) => match &v.zone {
                Zone::Offset(offset) => write!(f, "{}.{:09}{}", v.epoch_second, v.nano, offset),
                Zone::Named(zone) => write!(f, "{}.{:09}[{}]", v.epoch_second, v.nano, zone),
            },
            Value::Duration(v) => write!(
                f,
                "P{}M{}DT{}.{:09}S",
                v.months, v.days, v.seconds, v.nanos
            ),
            Value::Point(v) => {
                write!(f, "point(crs={}", v.crs)?;
                for c in &v.coordinates {
                    write!(f, ", {c}")?;
                }
                f.write_str(")")
            }
            Value::Array(v) => {
                f.write_str("[")?;
                for (i, item) in v.items().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}
