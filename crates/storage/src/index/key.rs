use std::hash::Hasher as _;

use quiver_types::{
    Interval, InternalId, Value,
    buffer::{Deserializer, Serializer},
};

use crate::error::{Error, Result};

/// A primary-key value in hashable form.
///
/// Floats are keyed by their bit pattern so the key is `Eq + Hash`; the
/// hashable subset mirrors the types a PK column may have.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum IndexKey {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    FloatBits(u32),
    DoubleBits(u64),
    String(String),
    Date(i32),
    Timestamp(i64),
    Interval(Interval),
    InternalId(InternalId),
}

impl IndexKey {
    /// Converts a cell value into a key. `Null` is the caller's problem
    /// (checked as `NullPk` before any index call); non-hashable types are an
    /// invariant violation because table construction rejects them.
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Int8(v) => IndexKey::Int8(*v),
            Value::Int16(v) => IndexKey::Int16(*v),
            Value::Int32(v) => IndexKey::Int32(*v),
            Value::Int64(v) => IndexKey::Int64(*v),
            Value::Int128(v) => IndexKey::Int128(*v),
            Value::UInt8(v) => IndexKey::UInt8(*v),
            Value::UInt16(v) => IndexKey::UInt16(*v),
            Value::UInt32(v) => IndexKey::UInt32(*v),
            Value::UInt64(v) => IndexKey::UInt64(*v),
            Value::Float(v) => IndexKey::FloatBits(v.to_bits()),
            Value::Double(v) => IndexKey::DoubleBits(v.to_bits()),
            Value::String(v) => IndexKey::String(v.clone()),
            Value::Date(v) => IndexKey::Date(*v),
            Value::Timestamp(v) => IndexKey::Timestamp(*v),
            Value::Interval(v) => IndexKey::Interval(*v),
            Value::InternalId(v) => IndexKey::InternalId(*v),
            other => {
                return Err(Error::InvariantViolation(format!(
                    "value {other} is not usable as a primary key"
                )));
            }
        })
    }

    fn tag(&self) -> u8 {
        match self {
            IndexKey::Int8(_) => 0,
            IndexKey::Int16(_) => 1,
            IndexKey::Int32(_) => 2,
            IndexKey::Int64(_) => 3,
            IndexKey::Int128(_) => 4,
            IndexKey::UInt8(_) => 5,
            IndexKey::UInt16(_) => 6,
            IndexKey::UInt32(_) => 7,
            IndexKey::UInt64(_) => 8,
            IndexKey::FloatBits(_) => 9,
            IndexKey::DoubleBits(_) => 10,
            IndexKey::String(_) => 11,
            IndexKey::Date(_) => 12,
            IndexKey::Timestamp(_) => 13,
            IndexKey::Interval(_) => 14,
            IndexKey::InternalId(_) => 15,
        }
    }

    pub fn serialize(&self, ser: &mut Serializer) {
        ser.write_u8(self.tag());
        match self {
            IndexKey::Int8(v) => ser.write_i8(*v),
            IndexKey::Int16(v) => ser.write_i16(*v),
            IndexKey::Int32(v) | IndexKey::Date(v) => ser.write_i32(*v),
            IndexKey::Int64(v) | IndexKey::Timestamp(v) => ser.write_i64(*v),
            IndexKey::Int128(v) => ser.write_i128(*v),
            IndexKey::UInt8(v) => ser.write_u8(*v),
            IndexKey::UInt16(v) => ser.write_u16(*v),
            IndexKey::UInt32(v) | IndexKey::FloatBits(v) => ser.write_u32(*v),
            IndexKey::UInt64(v) | IndexKey::DoubleBits(v) => ser.write_u64(*v),
            IndexKey::String(v) => ser.write_string(v),
            IndexKey::Interval(v) => {
                ser.write_i32(v.months);
                ser.write_i32(v.days);
                ser.write_i64(v.micros);
            }
            IndexKey::InternalId(v) => {
                ser.write_u32(v.table_id.0);
                ser.write_u64(v.offset);
            }
        }
    }

    pub fn deserialize(de: &mut Deserializer<'_>) -> Result<Self> {
        let tag = de.read_u8()?;
        Ok(match tag {
            0 => IndexKey::Int8(de.read_i8()?),
            1 => IndexKey::Int16(de.read_i16()?),
            2 => IndexKey::Int32(de.read_i32()?),
            3 => IndexKey::Int64(de.read_i64()?),
            4 => IndexKey::Int128(de.read_i128()?),
            5 => IndexKey::UInt8(de.read_u8()?),
            6 => IndexKey::UInt16(de.read_u16()?),
            7 => IndexKey::UInt32(de.read_u32()?),
            8 => IndexKey::UInt64(de.read_u64()?),
            9 => IndexKey::FloatBits(de.read_u32()?),
            10 => IndexKey::DoubleBits(de.read_u64()?),
            11 => IndexKey::String(de.read_string()?),
            12 => IndexKey::Date(de.read_i32()?),
            13 => IndexKey::Timestamp(de.read_i64()?),
            14 => IndexKey::Interval(Interval {
                months: de.read_i32()?,
                days: de.read_i32()?,
                micros: de.read_i64()?,
            }),
            15 => IndexKey::InternalId(InternalId {
                table_id: quiver_types::TableId(de.read_u32()?),
                offset: de.read_u64()?,
            }),
            other => {
                return Err(Error::Corruption(format!("bad index key tag {other}")));
            }
        })
    }

    /// Stable 64-bit hash of the key's canonical byte form; persisted slot
    /// placement depends on it staying fixed across versions.
    pub fn hash64(&self) -> u64 {
        let mut ser = Serializer::new();
        self.serialize(&mut ser);
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        hasher.write(ser.bytes());
        hasher.finish()
    }

    /// A short discriminator stored in each slot to skip most key compares.
    pub fn fingerprint(&self) -> u16 {
        (self.hash64() >> 48) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_conversion_and_hash_are_stable() {
        let a = IndexKey::from_value(&Value::Int64(42)).unwrap();
        let b = IndexKey::from_value(&Value::Int64(42)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash64(), b.hash64());
        assert_ne!(
            a.hash64(),
            IndexKey::from_value(&Value::Int64(43)).unwrap().hash64()
        );
    }

    #[test]
    fn float_keys_use_bit_patterns() {
        let a = IndexKey::from_value(&Value::Double(1.5)).unwrap();
        let b = IndexKey::from_value(&Value::Double(1.5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_hashable_values_are_rejected() {
        assert!(IndexKey::from_value(&Value::List(vec![])).is_err());
    }

    #[test]
    fn serialization_roundtrip() {
        for key in [
            IndexKey::Int64(-1),
            IndexKey::String("pk".into()),
            IndexKey::Int128(1 << 100),
            IndexKey::DoubleBits(2.5f64.to_bits()),
        ] {
            let mut ser = Serializer::new();
            key.serialize(&mut ser);
            let bytes = ser.into_bytes();
            let mut de = Deserializer::new(&bytes);
            assert_eq!(IndexKey::deserialize(&mut de).unwrap(), key);
        }
    }
}
