#![forbid(unsafe_code)]
//! One-byte-tagged binary codec for [`Value`].
//!
//! The registry is built once with [`ValueTypes::new`] and handed to every
//! reader and writer; ids are stable for the lifetime of the registry.

use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use super::{
    ArrayValue, DurationValue, OffsetTime, PointValue, Value, ValueKind, Zone, ZonedDateTime,
};
use crate::primitives::bytes::{string_length, ReadableChannel, WritableChannel};
use crate::types::{Result, StageError};

/// Tag written for an absent optional value.
pub const NO_VALUE: u8 = 0;

const UNIX_EPOCH_JULIAN_DAY: i64 = 2_440_588;
const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_DAY: i64 = 86_400 * NANOS_PER_SECOND;

const ZONE_OFFSET: u8 = 0;
const ZONE_NAMED: u8 = 1;

/// What a registered id decodes to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueType {
    /// A scalar kind.
    Scalar(ValueKind),
    /// The array meta-type: element tag, element count, then elements.
    Array,
}

/// Bidirectional kind/id lookup tables plus the codec operations.
#[derive(Clone, Debug)]
pub struct ValueTypes {
    by_id: Vec<Option<ValueType>>,
    by_kind: [u8; ValueKind::ALL.len()],
    array_id: u8,
}

impl Default for ValueTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueTypes {
    /// Registers every supported type. Ids start at 1; 0 is [`NO_VALUE`].
    pub fn new() -> Self {
        let mut types = Self {
            by_id: vec![None; 256],
            by_kind: [NO_VALUE; ValueKind::ALL.len()],
            array_id: NO_VALUE,
        };
        let mut next: u8 = 1;
        for kind in ValueKind::ALL {
            types.register(next, ValueType::Scalar(kind));
            next += 1;
        }
        types.register(next, ValueType::Array);
        types
    }

    fn register(&mut self, id: u8, ty: ValueType) {
        debug_assert!(self.by_id[id as usize].is_none(), "value type id {id} reused");
        self.by_id[id as usize] = Some(ty);
        match ty {
            ValueType::Scalar(kind) => self.by_kind[kind.ordinal()] = id,
            ValueType::Array => self.array_id = id,
        }
    }

    /// Wire id of a scalar kind.
    pub fn id_of_kind(&self, kind: ValueKind) -> u8 {
        self.by_kind[kind.ordinal()]
    }

    /// Wire id of the array meta-type.
    pub fn array_id(&self) -> u8 {
        self.array_id
    }

    /// Type registered under `id`.
    pub fn type_of_id(&self, id: u8) -> Result<ValueType> {
        self.by_id[id as usize]
            .ok_or_else(|| StageError::corruption(format!("unknown value type id {id}")))
    }

    fn scalar_of_id(&self, id: u8) -> Result<ValueKind> {
        match self.type_of_id(id)? {
            ValueType::Scalar(kind) => Ok(kind),
            ValueType::Array => Err(StageError::corruption("nested array element type")),
        }
    }

    /// Wire id of a value.
    pub fn id_of(&self, value: &Value) -> Result<u8> {
        match value {
            Value::Null => Err(StageError::invalid("null values have no encoding")),
            Value::Array(_) => Ok(self.array_id),
            other => match other.kind() {
                Some(kind) => Ok(self.id_of_kind(kind)),
                None => Err(StageError::invalid("value has no registered type")),
            },
        }
    }

    /// Writes the tag followed by the payload.
    pub fn write(&self, value: &Value, out: &mut dyn WritableChannel) -> Result<()> {
        let id = self.id_of(value)?;
        out.put_u8(id)?;
        match value {
            Value::Array(array) => self.write_array(array, out),
            scalar => write_scalar(scalar, out),
        }
    }

    /// Reads a tag and the payload it announces.
    pub fn read(&self, inp: &mut dyn ReadableChannel) -> Result<Value> {
        let id = inp.get_u8()?;
        self.read_tagged(id, inp)
    }

    /// Encoded size of `value`, tag included.
    pub fn length(&self, value: &Value) -> Result<usize> {
        self.id_of(value)?;
        Ok(1 + match value {
            Value::Array(array) => {
                let mut len = 1 + 4;
                for item in array.items() {
                    len += scalar_length(item);
                }
                len
            }
            scalar => scalar_length(scalar),
        })
    }

    /// Writes an optional value; `None` becomes [`NO_VALUE`].
    pub fn write_optional(&self, value: Option<&Value>, out: &mut dyn WritableChannel) -> Result<()> {
        match value {
            Some(v) if !v.is_null() => self.write(v, out),
            _ => out.put_u8(NO_VALUE),
        }
    }

    /// Reads a value written by [`ValueTypes::write_optional`].
    pub fn read_optional(&self, inp: &mut dyn ReadableChannel) -> Result<Option<Value>> {
        let id = inp.get_u8()?;
        if id == NO_VALUE {
            return Ok(None);
        }
        self.read_tagged(id, inp).map(Some)
    }

    fn read_tagged(&self, id: u8, inp: &mut dyn ReadableChannel) -> Result<Value> {
        match self.type_of_id(id)? {
            ValueType::Scalar(kind) => read_scalar(kind, inp),
            ValueType::Array => self.read_array(inp),
        }
    }

    fn write_array(&self, array: &ArrayValue, out: &mut dyn WritableChannel) -> Result<()> {
        out.put_u8(self.id_of_kind(array.element()))?;
        let count = i32::try_from(array.len())
            .map_err(|_| StageError::invalid("array has too many elements"))?;
        out.put_i32(count)?;
        for item in array.items() {
            write_scalar(item, out)?;
        }
        Ok(())
    }

    fn read_array(&self, inp: &mut dyn ReadableChannel) -> Result<Value> {
        let element = self.scalar_of_id(inp.get_u8()?)?;
        let count = inp.get_i32()?;
        let count = usize::try_from(count)
            .map_err(|_| StageError::corruption(format!("negative array length {count}")))?;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(read_scalar(element, inp)?);
        }
        Ok(Value::Array(ArrayValue::new(element, items)?))
    }
}

fn write_scalar(value: &Value, out: &mut dyn WritableChannel) -> Result<()> {
    match value {
        Value::Bool(v) => out.put_u8(u8::from(*v)),
        Value::Byte(v) => out.put_i8(*v),
        Value::Short(v) => out.put_i16(*v),
        Value::Int(v) => out.put_i32(*v),
        Value::Long(v) => out.put_i64(*v),
        Value::Float(v) => out.put_f32(*v),
        Value::Double(v) => out.put_f64(*v),
        Value::Char(v) => out.put_i32(*v as i32),
        Value::String(v) => out.put_string(v),
        Value::Date(v) => out.put_i64(epoch_day(*v)),
        Value::LocalTime(v) => out.put_i64(nano_of_day(*v)),
        Value::Time(v) => {
            out.put_i64(nano_of_day(v.time))?;
            out.put_i32(v.offset.whole_seconds())
        }
        Value::LocalDateTime(v) => {
            let utc = v.assume_utc();
            out.put_i64(utc.unix_timestamp())?;
            out.put_i32(utc.nanosecond() as i32)
        }
        Value::DateTime(v) => {
            out.put_i64(v.epoch_second)?;
            out.put_i32(v.nano as i32)?;
            match &v.zone {
                Zone::Offset(offset) => {
                    out.put_u8(ZONE_OFFSET)?;
                    out.put_i32(offset.whole_seconds())
                }
                Zone::Named(name) => {
                    out.put_u8(ZONE_NAMED)?;
                    out.put_string(name)
                }
            }
        }
        Value::Duration(v) => {
            out.put_i64(v.months)?;
            out.put_i64(v.days)?;
            out.put_i64(v.seconds)?;
            out.put_i32(v.nanos)
        }
        Value::Point(v) => {
            out.put_i32(v.crs)?;
            let dims = i32::try_from(v.coordinates.len())
                .map_err(|_| StageError::invalid("point has too many dimensions"))?;
            out.put_i32(dims)?;
            for c in &v.coordinates {
                out.put_f64(*c)?;
            }
            Ok(())
        }
        Value::Null | Value::Array(_) => Err(StageError::invalid("not a scalar value")),
    }
}

fn read_scalar(kind: ValueKind, inp: &mut dyn ReadableChannel) -> Result<Value> {
    let value = match kind {
        ValueKind::Bool => match inp.get_u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(StageError::corruption(format!(
                    "invalid boolean encoding: {other}"
                )))
            }
        },
        ValueKind::Byte => Value::Byte(inp.get_i8()?),
        ValueKind::Short => Value::Short(inp.get_i16()?),
        ValueKind::Int => Value::Int(inp.get_i32()?),
        ValueKind::Long => Value::Long(inp.get_i64()?),
        ValueKind::Float => Value::Float(inp.get_f32()?),
        ValueKind::Double => Value::Double(inp.get_f64()?),
        ValueKind::Char => {
            let raw = inp.get_i32()?;
            let c = char::from_u32(raw as u32)
                .ok_or_else(|| StageError::corruption(format!("invalid char code point {raw}")))?;
            Value::Char(c)
        }
        ValueKind::String => Value::String(inp.get_string()?),
        ValueKind::Date => Value::Date(date_from_epoch_day(inp.get_i64()?)?),
        ValueKind::LocalTime => Value::LocalTime(time_from_nano_of_day(inp.get_i64()?)?),
        ValueKind::Time => {
            let time = time_from_nano_of_day(inp.get_i64()?)?;
            let offset = offset_from_seconds(inp.get_i32()?)?;
            Value::Time(OffsetTime { time, offset })
        }
        ValueKind::LocalDateTime => {
            let secs = inp.get_i64()?;
            let nanos = inp.get_i32()?;
            let utc = instant(secs, nanos)?;
            Value::LocalDateTime(PrimitiveDateTime::new(utc.date(), utc.time()))
        }
        ValueKind::DateTime => {
            let epoch_second = inp.get_i64()?;
            let nano = inp.get_i32()?;
            if !(0..NANOS_PER_SECOND as i32).contains(&nano) {
                return Err(StageError::corruption(format!("nanosecond {nano} out of range")));
            }
            let zone = match inp.get_u8()? {
                ZONE_OFFSET => Zone::Offset(offset_from_seconds(inp.get_i32()?)?),
                ZONE_NAMED => Zone::Named(inp.get_string()?),
                other => {
                    return Err(StageError::corruption(format!(
                        "unknown zone discriminator {other}"
                    )))
                }
            };
            Value::DateTime(ZonedDateTime {
                epoch_second,
                nano: nano as u32,
                zone,
            })
        }
        ValueKind::Duration => Value::Duration(DurationValue {
            months: inp.get_i64()?,
            days: inp.get_i64()?,
            seconds: inp.get_i64()?,
            nanos: inp.get_i32()?,
        }),
        ValueKind::Point => {
            let crs = inp.get_i32()?;
            let dims = inp.get_i32()?;
            let dims = usize::try_from(dims)
                .map_err(|_| StageError::corruption(format!("negative point dimension {dims}")))?;
            let mut coordinates = Vec::with_capacity(dims.min(16));
            for _ in 0..dims {
                coordinates.push(inp.get_f64()?);
            }
            Value::Point(PointValue { crs, coordinates })
        }
    };
    Ok(value)
}

fn scalar_length(value: &Value) -> usize {
    match value {
        Value::Null | Value::Array(_) => 0,
        Value::Bool(_) | Value::Byte(_) => 1,
        Value::Short(_) => 2,
        Value::Int(_) | Value::Float(_) | Value::Char(_) => 4,
        Value::Long(_) | Value::Double(_) | Value::Date(_) | Value::LocalTime(_) => 8,
        Value::String(s) => string_length(s),
        Value::Time(_) | Value::LocalDateTime(_) => 8 + 4,
        Value::DateTime(v) => {
            8 + 4
                + 1
                + match &v.zone {
                    Zone::Offset(_) => 4,
                    Zone::Named(name) => string_length(name),
                }
        }
        Value::Duration(_) => 8 * 3 + 4,
        Value::Point(p) => 4 + 4 + 8 * p.coordinates.len(),
    }
}

fn epoch_day(date: Date) -> i64 {
    i64::from(date.to_julian_day()) - UNIX_EPOCH_JULIAN_DAY
}

fn date_from_epoch_day(day: i64) -> Result<Date> {
    let julian = i32::try_from(day + UNIX_EPOCH_JULIAN_DAY)
        .map_err(|_| StageError::corruption(format!("epoch day {day} out of range")))?;
    Date::from_julian_day(julian)
        .map_err(|err| StageError::corruption(format!("epoch day {day}: {err}")))
}

fn nano_of_day(time: Time) -> i64 {
    let (h, m, s, ns) = time.as_hms_nano();
    (i64::from(h) * 3600 + i64::from(m) * 60 + i64::from(s)) * NANOS_PER_SECOND + i64::from(ns)
}

fn time_from_nano_of_day(nanos: i64) -> Result<Time> {
    if !(0..NANOS_PER_DAY).contains(&nanos) {
        return Err(StageError::corruption(format!("nano of day {nanos} out of range")));
    }
    let secs = nanos / NANOS_PER_SECOND;
    let ns = (nanos % NANOS_PER_SECOND) as u32;
    Time::from_hms_nano(
        (secs / 3600) as u8,
        ((secs / 60) % 60) as u8,
        (secs % 60) as u8,
        ns,
    )
    .map_err(|err| StageError::corruption(format!("nano of day {nanos}: {err}")))
}

fn offset_from_seconds(seconds: i32) -> Result<UtcOffset> {
    UtcOffset::from_whole_seconds(seconds)
        .map_err(|err| StageError::corruption(format!("offset {seconds}s: {err}")))
}

fn instant(secs: i64, nanos: i32) -> Result<OffsetDateTime> {
    let base = OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|err| StageError::corruption(format!("epoch second {secs}: {err}")))?;
    let nanos = u32::try_from(nanos)
        .map_err(|_| StageError::corruption(format!("negative nanosecond {nanos}")))?;
    base.replace_nanosecond(nanos)
        .map_err(|err| StageError::corruption(format!("nanosecond {nanos}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::bytes::{ByteBuffer, ChunkCursor};
    use proptest::prelude::*;
    use time::macros::{date, datetime, offset, time};

    fn roundtrip(types: &ValueTypes, value: &Value) -> Value {
        let mut buf = ByteBuffer::default();
        types.write(value, &mut buf).unwrap();
        assert_eq!(
            buf.len(),
            types.length(value).unwrap(),
            "length mismatch for {value:?}"
        );
        let mut cur = ChunkCursor::new(buf.take());
        let back = types.read(&mut cur).unwrap();
        assert_eq!(cur.remaining(), 0);
        back
    }

    fn samples() -> Vec<Value> {
        vec![
            Value::Bool(true),
            Value::Bool(false),
            Value::Byte(i8::MIN),
            Value::Short(i16::MAX),
            Value::Int(-1),
            Value::Long(i64::MIN),
            Value::Long(i64::MAX),
            Value::Float(3.25),
            Value::Double(f64::MIN_POSITIVE),
            Value::Char('ß'),
            Value::String(String::new()),
            Value::String("unicode ✓".into()),
            Value::Date(date!(1969 - 07 - 20)),
            Value::LocalTime(time!(23:59:59.999_999_999)),
            Value::Time(OffsetTime {
                time: time!(08:30),
                offset: offset!(-05:00),
            }),
            Value::LocalDateTime(datetime!(2024-02-29 12:00:00.000_000_123)),
            Value::DateTime(ZonedDateTime::with_offset(1_700_000_000, 5, offset!(+01:00))),
            Value::DateTime(ZonedDateTime::with_zone(-86_400, 999_999_999, "Europe/Stockholm")),
            Value::Duration(DurationValue {
                months: 14,
                days: -3,
                seconds: 3600,
                nanos: 500,
            }),
            Value::Point(PointValue {
                crs: 4326,
                coordinates: vec![12.5, 55.75],
            }),
        ]
    }

    #[test]
    fn every_scalar_roundtrips() {
        let types = ValueTypes::new();
        for value in samples() {
            assert_eq!(roundtrip(&types, &value), value);
        }
    }

    #[test]
    fn every_array_type_roundtrips() {
        let types = ValueTypes::new();
        for value in samples() {
            let kind = value.kind().unwrap();
            let full = ArrayValue::new(kind, vec![value.clone(), value.clone()]).unwrap();
            assert_eq!(roundtrip(&types, &Value::Array(full.clone())), Value::Array(full));
            let empty = Value::Array(ArrayValue::empty(kind));
            assert_eq!(roundtrip(&types, &empty), empty);
        }
    }

    #[test]
    fn ids_are_unique_and_nonzero() {
        let types = ValueTypes::new();
        let mut seen = std::collections::HashSet::new();
        for kind in ValueKind::ALL {
            let id = types.id_of_kind(kind);
            assert_ne!(id, NO_VALUE);
            assert!(seen.insert(id));
            assert_eq!(types.type_of_id(id).unwrap(), ValueType::Scalar(kind));
        }
        assert!(seen.insert(types.array_id()));
    }

    #[test]
    fn unknown_id_fails_fast() {
        let types = ValueTypes::new();
        let mut cur = ChunkCursor::new(bytes::Bytes::from_static(&[200, 0, 0]));
        let err = types.read(&mut cur).unwrap_err();
        assert!(matches!(err, StageError::Corruption(ref m) if m.contains("200")));
    }

    #[test]
    fn null_has_no_encoding() {
        let types = ValueTypes::new();
        let mut buf = ByteBuffer::default();
        assert!(matches!(
            types.write(&Value::Null, &mut buf),
            Err(StageError::Invalid(_))
        ));
    }

    #[test]
    fn optional_value_roundtrip() {
        let types = ValueTypes::new();
        let mut buf = ByteBuffer::default();
        types.write_optional(None, &mut buf).unwrap();
        types.write_optional(Some(&Value::Null), &mut buf).unwrap();
        types.write_optional(Some(&Value::Long(9)), &mut buf).unwrap();
        let mut cur = ChunkCursor::new(buf.take());
        assert_eq!(types.read_optional(&mut cur).unwrap(), None);
        assert_eq!(types.read_optional(&mut cur).unwrap(), None);
        assert_eq!(types.read_optional(&mut cur).unwrap(), Some(Value::Long(9)));
    }

    #[test]
    fn named_zone_and_offset_differ_on_the_wire() {
        let types = ValueTypes::new();
        let a = Value::DateTime(ZonedDateTime::with_offset(0, 0, offset!(UTC)));
        let b = Value::DateTime(ZonedDateTime::with_zone(0, 0, "UTC"));
        assert_ne!(roundtrip(&types, &a), roundtrip(&types, &b));
    }

    proptest! {
        #[test]
        fn long_roundtrip_prop(v in any::<i64>()) {
            let types = ValueTypes::new();
            prop_assert_eq!(roundtrip(&types, &Value::Long(v)), Value::Long(v));
        }

        #[test]
        fn double_bits_roundtrip_prop(bits in any::<u64>()) {
            let types = ValueTypes::new();
            let back = roundtrip(&types, &Value::Double(f64::from_bits(bits)));
            match back {
                Value::Double(d) => prop_assert_eq!(d.to_bits(), bits),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }

        #[test]
        fn string_array_roundtrip_prop(items in proptest::collection::vec(".*", 0..8)) {
            let types = ValueTypes::new();
            let arr = ArrayValue::new(
                ValueKind::String,
                items.into_iter().map(Value::String).collect(),
            ).unwrap();
            let value = Value::Array(arr);
            prop_assert_eq!(roundtrip(&types, &value), value);
        }

        #[test]
        fn date_roundtrip_prop(day in -700_000i64..700_000) {
            let types = ValueTypes::new();
            let date = date_from_epoch_day(day).unwrap();
            prop_assert_eq!(epoch_day(date), day);
            prop_assert_eq!(roundtrip(&types, &Value::Date(date)), Value::Date(date));
        }
    }
}
