use std::fmt;

use crate::TableId;
use crate::buffer::{DecodeError, Deserializer, Serializer};

/// Month/day/microsecond interval, the common calendar-safe decomposition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

/// A node identity: table plus 64-bit node offset.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InternalId {
    pub table_id: TableId,
    pub offset: u64,
}

/// A named field of a struct type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StructField {
    pub name: String,
    pub data_type: LogicalType,
}

/// The logical (user-facing) type of a column.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogicalType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    String,
    Date,
    Timestamp,
    Interval,
    InternalId,
    List(Box<LogicalType>),
    Struct(Vec<StructField>),
}

/// The physical representation a logical type is stored as.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PhysicalType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Interval,
    InternalId,
    Nested,
}

impl PhysicalType {
    pub fn to_u8(self) -> u8 {
        match self {
            PhysicalType::Bool => 0,
            PhysicalType::Int8 => 1,
            PhysicalType::Int16 => 2,
            PhysicalType::Int32 => 3,
            PhysicalType::Int64 => 4,
            PhysicalType::Int128 => 5,
            PhysicalType::UInt8 => 6,
            PhysicalType::UInt16 => 7,
            PhysicalType::UInt32 => 8,
            PhysicalType::UInt64 => 9,
            PhysicalType::Float32 => 10,
            PhysicalType::Float64 => 11,
            PhysicalType::String => 12,
            PhysicalType::Interval => 13,
            PhysicalType::InternalId => 14,
            PhysicalType::Nested => 15,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, DecodeError> {
        Ok(match v {
            0 => PhysicalType::Bool,
            1 => PhysicalType::Int8,
            2 => PhysicalType::Int16,
            3 => PhysicalType::Int32,
            4 => PhysicalType::Int64,
            5 => PhysicalType::Int128,
            6 => PhysicalType::UInt8,
            7 => PhysicalType::UInt16,
            8 => PhysicalType::UInt32,
            9 => PhysicalType::UInt64,
            10 => PhysicalType::Float32,
            11 => PhysicalType::Float64,
            12 => PhysicalType::String,
            13 => PhysicalType::Interval,
            14 => PhysicalType::InternalId,
            15 => PhysicalType::Nested,
            other => return Err(DecodeError::InvalidTag(other)),
        })
    }
}

impl LogicalType {
    pub fn physical_type(&self) -> PhysicalType {
        match self {
            LogicalType::Bool => PhysicalType::Bool,
            LogicalType::Int8 => PhysicalType::Int8,
            LogicalType::Int16 => PhysicalType::Int16,
            LogicalType::Int32 => PhysicalType::Int32,
            LogicalType::Int64 => PhysicalType::Int64,
            LogicalType::Int128 => PhysicalType::Int128,
            LogicalType::UInt8 => PhysicalType::UInt8,
            LogicalType::UInt16 => PhysicalType::UInt16,
            LogicalType::UInt32 => PhysicalType::UInt32,
            LogicalType::UInt64 => PhysicalType::UInt64,
            LogicalType::Float => PhysicalType::Float32,
            LogicalType::Double => PhysicalType::Float64,
            LogicalType::String => PhysicalType::String,
            LogicalType::Date => PhysicalType::Int32,
            LogicalType::Timestamp => PhysicalType::Int64,
            LogicalType::Interval => PhysicalType::Interval,
            LogicalType::InternalId => PhysicalType::InternalId,
            LogicalType::List(_) | LogicalType::Struct(_) => PhysicalType::Nested,
        }
    }

    /// Is this one of the types a primary key column may have?
    pub fn is_hashable(&self) -> bool {
        !matches!(self, LogicalType::List(_) | LogicalType::Struct(_) | LogicalType::Bool)
    }

    fn tag(&self) -> u8 {
        match self {
            LogicalType::Bool => 1,
            LogicalType::Int8 => 2,
            LogicalType::Int16 => 3,
            LogicalType::Int32 => 4,
            LogicalType::Int64 => 5,
            LogicalType::Int128 => 6,
            LogicalType::UInt8 => 7,
            LogicalType::UInt16 => 8,
            LogicalType::UInt32 => 9,
            LogicalType::UInt64 => 10,
            LogicalType::Float => 11,
            LogicalType::Double => 12,
            LogicalType::String => 13,
            LogicalType::Date => 14,
            LogicalType::Timestamp => 15,
            LogicalType::Interval => 16,
            LogicalType::InternalId => 17,
            LogicalType::List(_) => 18,
            LogicalType::Struct(_) => 19,
        }
    }

    pub fn serialize(&self, ser: &mut Serializer) {
        ser.write_u8(self.tag());
        match self {
            LogicalType::List(child) => child.serialize(ser),
            LogicalType::Struct(fields) => {
                ser.write_list_len(fields.len());
                for field in fields {
                    ser.write_string(&field.name);
                    field.data_type.serialize(ser);
                }
            }
            _ => {}
        }
    }

    pub fn deserialize(de: &mut Deserializer<'_>) -> Result<Self, DecodeError> {
        let tag = de.read_u8()?;
        Ok(match tag {
            1 => LogicalType::Bool,
            2 => LogicalType::Int8,
            3 => LogicalType::Int16,
            4 => LogicalType::Int32,
            5 => LogicalType::Int64,
            6 => LogicalType::Int128,
            7 => LogicalType::UInt8,
            8 => LogicalType::UInt16,
            9 => LogicalType::UInt32,
            10 => LogicalType::UInt64,
            11 => LogicalType::Float,
            12 => LogicalType::Double,
            13 => LogicalType::String,
            14 => LogicalType::Date,
            15 => LogicalType::Timestamp,
            16 => LogicalType::Interval,
            17 => LogicalType::InternalId,
            18 => LogicalType::List(Box::new(LogicalType::deserialize(de)?)),
            19 => {
                let n = de.read_list_len()?;
                let mut fields = Vec::with_capacity(n);
                for _ in 0..n {
                    let name = de.read_string()?;
                    let data_type = LogicalType::deserialize(de)?;
                    fields.push(StructField { name, data_type });
                }
                LogicalType::Struct(fields)
            }
            other => return Err(DecodeError::InvalidTag(other)),
        })
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::List(child) => write!(f, "LIST[{child}]"),
            LogicalType::Struct(_) => write!(f, "STRUCT"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// A single cell value.
///
/// `Null` is a first-class variant; containers additionally keep a null mask
/// which is authoritative for columnar storage.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Date(i32),
    Timestamp(i64),
    Interval(Interval),
    InternalId(InternalId),
    List(Vec<Value>),
    Struct(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Does this value fit a column of `data_type`? `Null` fits every type.
    pub fn matches(&self, data_type: &LogicalType) -> bool {
        match (self, data_type) {
            (Value::Null, _) => true,
            (Value::Bool(_), LogicalType::Bool) => true,
            (Value::Int8(_), LogicalType::Int8) => true,
            (Value::Int16(_), LogicalType::Int16) => true,
            (Value::Int32(_), LogicalType::Int32) => true,
            (Value::Int64(_), LogicalType::Int64) => true,
            (Value::Int128(_), LogicalType::Int128) => true,
            (Value::UInt8(_), LogicalType::UInt8) => true,
            (Value::UInt16(_), LogicalType::UInt16) => true,
            (Value::UInt32(_), LogicalType::UInt32) => true,
            (Value::UInt64(_), LogicalType::UInt64) => true,
            (Value::Float(_), LogicalType::Float) => true,
            (Value::Double(_), LogicalType::Double) => true,
            (Value::String(_), LogicalType::String) => true,
            (Value::Date(_), LogicalType::Date) => true,
            (Value::Timestamp(_), LogicalType::Timestamp) => true,
            (Value::Interval(_), LogicalType::Interval) => true,
            (Value::InternalId(_), LogicalType::InternalId) => true,
            (Value::List(items), LogicalType::List(child)) => {
                items.iter().all(|item| item.matches(child))
            }
            (Value::Struct(fields), LogicalType::Struct(defs)) => {
                fields.len() == defs.len()
                    && fields
                        .iter()
                        .zip(defs)
                        .all(|(value, def)| value.matches(&def.data_type))
            }
            _ => false,
        }
    }

    /// The non-null zero value of `data_type`, used to backfill added columns.
    pub fn default_for(data_type: &LogicalType) -> Value {
        match data_type {
            LogicalType::Bool => Value::Bool(false),
            LogicalType::Int8 => Value::Int8(0),
            LogicalType::Int16 => Value::Int16(0),
            LogicalType::Int32 => Value::Int32(0),
            LogicalType::Int64 => Value::Int64(0),
            LogicalType::Int128 => Value::Int128(0),
            LogicalType::UInt8 => Value::UInt8(0),
            LogicalType::UInt16 => Value::UInt16(0),
            LogicalType::UInt32 => Value::UInt32(0),
            LogicalType::UInt64 => Value::UInt64(0),
            LogicalType::Float => Value::Float(0.0),
            LogicalType::Double => Value::Double(0.0),
            LogicalType::String => Value::String(String::new()),
            LogicalType::Date => Value::Date(0),
            LogicalType::Timestamp => Value::Timestamp(0),
            LogicalType::Interval => Value::Interval(Interval::default()),
            LogicalType::InternalId => Value::InternalId(InternalId::default()),
            LogicalType::List(_) => Value::List(Vec::new()),
            LogicalType::Struct(defs) => Value::Struct(
                defs.iter()
                    .map(|def| Value::default_for(&def.data_type))
                    .collect(),
            ),
        }
    }

    pub fn as_node_offset(&self) -> Option<u64> {
        match self {
            Value::InternalId(id) => Some(id.offset),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int8(_) => 2,
            Value::Int16(_) => 3,
            Value::Int32(_) => 4,
            Value::Int64(_) => 5,
            Value::Int128(_) => 6,
            Value::UInt8(_) => 7,
            Value::UInt16(_) => 8,
            Value::UInt32(_) => 9,
            Value::UInt64(_) => 10,
            Value::Float(_) => 11,
            Value::Double(_) => 12,
            Value::String(_) => 13,
            Value::Date(_) => 14,
            Value::Timestamp(_) => 15,
            Value::Interval(_) => 16,
            Value::InternalId(_) => 17,
            Value::List(_) => 18,
            Value::Struct(_) => 19,
        }
    }

    /// Self-describing serialisation: a tag byte followed by the payload.
    pub fn serialize(&self, ser: &mut Serializer) {
        ser.write_u8(self.tag());
        match self {
            Value::Null => {}
            Value::Bool(v) => ser.write_bool(*v),
            Value::Int8(v) => ser.write_i8(*v),
            Value::Int16(v) => ser.write_i16(*v),
            Value::Int32(v) | Value::Date(v) => ser.write_i32(*v),
            Value::Int64(v) | Value::Timestamp(v) => ser.write_i64(*v),
            Value::Int128(v) => ser.write_i128(*v),
            Value::UInt8(v) => ser.write_u8(*v),
            Value::UInt16(v) => ser.write_u16(*v),
            Value::UInt32(v) => ser.write_u32(*v),
            Value::UInt64(v) => ser.write_u64(*v),
            Value::Float(v) => ser.write_f32(*v),
            Value::Double(v) => ser.write_f64(*v),
            Value::String(v) => ser.write_string(v),
            Value::Interval(v) => {
                ser.write_i32(v.months);
                ser.write_i32(v.days);
                ser.write_i64(v.micros);
            }
            Value::InternalId(v) => {
                ser.write_u32(v.table_id.0);
                ser.write_u64(v.offset);
            }
            Value::List(items) | Value::Struct(items) => {
                ser.write_list_len(items.len());
                for item in items {
                    item.serialize(ser);
                }
            }
        }
    }

    pub fn deserialize(de: &mut Deserializer<'_>) -> Result<Self, DecodeError> {
        let tag = de.read_u8()?;
        Ok(match tag {
            0 => Value::Null,
            1 => Value::Bool(de.read_bool()?),
            2 => Value::Int8(de.read_i8()?),
            3 => Value::Int16(de.read_i16()?),
            4 => Value::Int32(de.read_i32()?),
            5 => Value::Int64(de.read_i64()?),
            6 => Value::Int128(de.read_i128()?),
            7 => Value::UInt8(de.read_u8()?),
            8 => Value::UInt16(de.read_u16()?),
            9 => Value::UInt32(de.read_u32()?),
            10 => Value::UInt64(de.read_u64()?),
            11 => Value::Float(de.read_f32()?),
            12 => Value::Double(de.read_f64()?),
            13 => Value::String(de.read_string()?),
            14 => Value::Date(de.read_i32()?),
            15 => Value::Timestamp(de.read_i64()?),
            16 => Value::Interval(Interval {
                months: de.read_i32()?,
                days: de.read_i32()?,
                micros: de.read_i64()?,
            }),
            17 => Value::InternalId(InternalId {
                table_id: TableId(de.read_u32()?),
                offset: de.read_u64()?,
            }),
            18 | 19 => {
                let n = de.read_list_len()?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(Value::deserialize(de)?);
                }
                if tag == 18 { Value::List(items) } else { Value::Struct(items) }
            }
            other => return Err(DecodeError::InvalidTag(other)),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) | Value::Date(v) => write!(f, "{v}"),
            Value::Int64(v) | Value::Timestamp(v) => write!(f, "{v}"),
            Value::Int128(v) => write!(f, "{v}"),
            Value::UInt8(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Interval(v) => write!(f, "{}mo {}d {}us", v.months, v.days, v.micros),
            Value::InternalId(v) => write!(f, "{}:{}", v.table_id, v.offset),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Struct(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::{Deserializer, Serializer};

    use super::*;

    fn roundtrip(value: Value) {
        let mut ser = Serializer::new();
        value.serialize(&mut ser);
        let bytes = ser.into_bytes();
        let mut de = Deserializer::new(&bytes);
        assert_eq!(Value::deserialize(&mut de).unwrap(), value);
        assert!(de.is_empty());
    }

    #[test]
    fn value_serialization_roundtrips() {
        roundtrip(Value::Null);
        roundtrip(Value::Int64(-7));
        roundtrip(Value::Int128(i128::MIN));
        roundtrip(Value::Double(2.25));
        roundtrip(Value::String("päron".into()));
        roundtrip(Value::Interval(Interval {
            months: 1,
            days: -2,
            micros: 3,
        }));
        roundtrip(Value::InternalId(InternalId {
            table_id: TableId(9),
            offset: 1 << 40,
        }));
        roundtrip(Value::List(vec![Value::Int32(1), Value::Null]));
        roundtrip(Value::Struct(vec![
            Value::String("a".into()),
            Value::Bool(true),
        ]));
    }

    #[test]
    fn type_checks() {
        assert!(Value::Null.matches(&LogicalType::String));
        assert!(Value::Date(1).matches(&LogicalType::Date));
        assert!(!Value::Int32(1).matches(&LogicalType::Date));
        assert!(
            Value::List(vec![Value::Int64(1)]).matches(&LogicalType::List(Box::new(
                LogicalType::Int64
            )))
        );
        assert!(LogicalType::Int128.is_hashable());
        assert!(!LogicalType::List(Box::new(LogicalType::Int64)).is_hashable());
    }

    #[test]
    fn logical_type_roundtrips() {
        let ty = LogicalType::Struct(vec![
            StructField {
                name: "xs".into(),
                data_type: LogicalType::List(Box::new(LogicalType::Date)),
            },
            StructField {
                name: "id".into(),
                data_type: LogicalType::InternalId,
            },
        ]);
        let mut ser = Serializer::new();
        ty.serialize(&mut ser);
        let bytes = ser.into_bytes();
        let mut de = Deserializer::new(&bytes);
        assert_eq!(LogicalType::deserialize(&mut de).unwrap(), ty);
    }
}
