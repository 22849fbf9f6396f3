use quiver_types::{
    Interval, InternalId, LogicalType, NullMask, PhysicalType, RowIdx, TableId, Value, ValueVector,
    buffer::{Deserializer, Serializer},
};

use crate::{
    column::codec,
    error::{Error, Result},
    page::{PageIdx, PageManager},
};

/// Where a flushed chunk lives on disk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageSpan {
    pub pages: Vec<PageIdx>,
    pub num_bytes: u64,
}

impl PageSpan {
    pub fn serialize(&self, ser: &mut Serializer) {
        ser.write_list_len(self.pages.len());
        for page in &self.pages {
            ser.write_u64(*page);
        }
        ser.write_u64(self.num_bytes);
    }

    pub fn deserialize(de: &mut Deserializer<'_>) -> Result<Self> {
        let num_pages = de.read_list_len()?;
        let mut pages = Vec::with_capacity(num_pages);
        for _ in 0..num_pages {
            pages.push(de.read_u64()?);
        }
        let num_bytes = de.read_u64()?;
        Ok(Self { pages, num_bytes })
    }
}

/// The typed element buffer of a chunk. Dispatch is by match on the tag, one
/// arm per physical representation; `Nested` covers lists and structs.
#[derive(Clone, Debug)]
pub enum ChunkData {
    Bool(Vec<bool>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Int128(Vec<i128>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
    Interval(Vec<Interval>),
    InternalId(Vec<InternalId>),
    Nested(Vec<Value>),
}

impl ChunkData {
    fn for_type(data_type: &LogicalType) -> Self {
        match data_type.physical_type() {
            PhysicalType::Bool => ChunkData::Bool(Vec::new()),
            PhysicalType::Int8 => ChunkData::Int8(Vec::new()),
            PhysicalType::Int16 => ChunkData::Int16(Vec::new()),
            PhysicalType::Int32 => ChunkData::Int32(Vec::new()),
            PhysicalType::Int64 => ChunkData::Int64(Vec::new()),
            PhysicalType::Int128 => ChunkData::Int128(Vec::new()),
            PhysicalType::UInt8 => ChunkData::UInt8(Vec::new()),
            PhysicalType::UInt16 => ChunkData::UInt16(Vec::new()),
            PhysicalType::UInt32 => ChunkData::UInt32(Vec::new()),
            PhysicalType::UInt64 => ChunkData::UInt64(Vec::new()),
            PhysicalType::Float32 => ChunkData::Float(Vec::new()),
            PhysicalType::Float64 => ChunkData::Double(Vec::new()),
            PhysicalType::String => ChunkData::String(Vec::new()),
            PhysicalType::Interval => ChunkData::Interval(Vec::new()),
            PhysicalType::InternalId => ChunkData::InternalId(Vec::new()),
            PhysicalType::Nested => ChunkData::Nested(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            ChunkData::Bool(v) => v.len(),
            ChunkData::Int8(v) => v.len(),
            ChunkData::Int16(v) => v.len(),
            ChunkData::Int32(v) => v.len(),
            ChunkData::Int64(v) => v.len(),
            ChunkData::Int128(v) => v.len(),
            ChunkData::UInt8(v) => v.len(),
            ChunkData::UInt16(v) => v.len(),
            ChunkData::UInt32(v) => v.len(),
            ChunkData::UInt64(v) => v.len(),
            ChunkData::Float(v) => v.len(),
            ChunkData::Double(v) => v.len(),
            ChunkData::String(v) => v.len(),
            ChunkData::Interval(v) => v.len(),
            ChunkData::InternalId(v) => v.len(),
            ChunkData::Nested(v) => v.len(),
        }
    }

    fn truncate(&mut self, len: usize) {
        match self {
            ChunkData::Bool(v) => v.truncate(len),
            ChunkData::Int8(v) => v.truncate(len),
            ChunkData::Int16(v) => v.truncate(len),
            ChunkData::Int32(v) => v.truncate(len),
            ChunkData::Int64(v) => v.truncate(len),
            ChunkData::Int128(v) => v.truncate(len),
            ChunkData::UInt8(v) => v.truncate(len),
            ChunkData::UInt16(v) => v.truncate(len),
            ChunkData::UInt32(v) => v.truncate(len),
            ChunkData::UInt64(v) => v.truncate(len),
            ChunkData::Float(v) => v.truncate(len),
            ChunkData::Double(v) => v.truncate(len),
            ChunkData::String(v) => v.truncate(len),
            ChunkData::Interval(v) => v.truncate(len),
            ChunkData::InternalId(v) => v.truncate(len),
            ChunkData::Nested(v) => v.truncate(len),
        }
    }
}

/// One typed, optionally compressed, vector of values with a null bitmap.
///
/// The chunk carries no visibility information; callers enforce it.
#[derive(Clone, Debug)]
pub struct ColumnChunk {
    data_type: LogicalType,
    data: ChunkData,
    nulls: NullMask,
    capacity: u64,
    persistent: Option<PageSpan>,
}

impl ColumnChunk {
    pub fn new(data_type: LogicalType, capacity: u64) -> Self {
        Self {
            data: ChunkData::for_type(&data_type),
            nulls: NullMask::default(),
            data_type,
            capacity,
            persistent: None,
        }
    }

    /// A chunk holding `count` copies of `value`, used to backfill a column
    /// added to existing node groups.
    pub fn filled(data_type: LogicalType, capacity: u64, value: &Value, count: u64) -> Result<Self> {
        let mut chunk = Self::new(data_type, capacity);
        for _ in 0..count {
            chunk.append_value(value)?;
        }
        Ok(chunk)
    }

    pub fn data_type(&self) -> &LogicalType {
        &self.data_type
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn page_span(&self) -> Option<&PageSpan> {
        self.persistent.as_ref()
    }

    fn type_mismatch(&self, value: &Value) -> Error {
        Error::TypeMismatch {
            expected: self.data_type.clone(),
            value: value.to_string(),
        }
    }

    fn check_row(&self, row: RowIdx, what: &'static str) -> Result<()> {
        if row >= self.len() {
            return Err(Error::OutOfRange {
                what,
                index: row,
                len: self.len(),
            });
        }
        Ok(())
    }

    pub fn append_value(&mut self, value: &Value) -> Result<()> {
        if self.is_full() {
            return Err(Error::ChunkFull);
        }
        if !value.matches(&self.data_type) {
            return Err(self.type_mismatch(value));
        }
        self.push_raw(value);
        Ok(())
    }

    fn push_raw(&mut self, value: &Value) {
        self.nulls.push(!value.is_null());
        let stored = if value.is_null() {
            Value::default_for(&self.data_type)
        } else {
            value.clone()
        };
        match (&mut self.data, stored) {
            (ChunkData::Bool(v), Value::Bool(x)) => v.push(x),
            (ChunkData::Int8(v), Value::Int8(x)) => v.push(x),
            (ChunkData::Int16(v), Value::Int16(x)) => v.push(x),
            (ChunkData::Int32(v), Value::Int32(x) | Value::Date(x)) => v.push(x),
            (ChunkData::Int64(v), Value::Int64(x) | Value::Timestamp(x)) => v.push(x),
            (ChunkData::Int128(v), Value::Int128(x)) => v.push(x),
            (ChunkData::UInt8(v), Value::UInt8(x)) => v.push(x),
            (ChunkData::UInt16(v), Value::UInt16(x)) => v.push(x),
            (ChunkData::UInt32(v), Value::UInt32(x)) => v.push(x),
            (ChunkData::UInt64(v), Value::UInt64(x)) => v.push(x),
            (ChunkData::Float(v), Value::Float(x)) => v.push(x),
            (ChunkData::Double(v), Value::Double(x)) => v.push(x),
            (ChunkData::String(v), Value::String(x)) => v.push(x),
            (ChunkData::Interval(v), Value::Interval(x)) => v.push(x),
            (ChunkData::InternalId(v), Value::InternalId(x)) => v.push(x),
            (ChunkData::Nested(v), x @ (Value::List(_) | Value::Struct(_))) => v.push(x),
            _ => unreachable!("value was type-checked against the chunk type"),
        }
    }

    /// The value at `row`, `Null` when the null bit is cleared.
    pub fn value(&self, row: RowIdx) -> Result<Value> {
        self.check_row(row, "chunk row")?;
        let idx = row as usize;
        if !self.nulls.is_valid(idx) {
            return Ok(Value::Null);
        }
        Ok(self.raw_value(idx))
    }

    fn raw_value(&self, idx: usize) -> Value {
        match (&self.data, &self.data_type) {
            (ChunkData::Int32(v), LogicalType::Date) => Value::Date(v[idx]),
            (ChunkData::Int64(v), LogicalType::Timestamp) => Value::Timestamp(v[idx]),
            (ChunkData::Bool(v), _) => Value::Bool(v[idx]),
            (ChunkData::Int8(v), _) => Value::Int8(v[idx]),
            (ChunkData::Int16(v), _) => Value::Int16(v[idx]),
            (ChunkData::Int32(v), _) => Value::Int32(v[idx]),
            (ChunkData::Int64(v), _) => Value::Int64(v[idx]),
            (ChunkData::Int128(v), _) => Value::Int128(v[idx]),
            (ChunkData::UInt8(v), _) => Value::UInt8(v[idx]),
            (ChunkData::UInt16(v), _) => Value::UInt16(v[idx]),
            (ChunkData::UInt32(v), _) => Value::UInt32(v[idx]),
            (ChunkData::UInt64(v), _) => Value::UInt64(v[idx]),
            (ChunkData::Float(v), _) => Value::Float(v[idx]),
            (ChunkData::Double(v), _) => Value::Double(v[idx]),
            (ChunkData::String(v), _) => Value::String(v[idx].clone()),
            (ChunkData::Interval(v), _) => Value::Interval(v[idx]),
            (ChunkData::InternalId(v), _) => Value::InternalId(v[idx]),
            (ChunkData::Nested(v), _) => v[idx].clone(),
        }
    }

    /// In-place update; returns the previous value.
    pub fn set_value(&mut self, row: RowIdx, value: &Value) -> Result<Value> {
        self.check_row(row, "chunk row")?;
        if !value.matches(&self.data_type) {
            return Err(self.type_mismatch(value));
        }
        let old = self.value(row)?;
        let idx = row as usize;
        self.nulls.set_valid(idx, !value.is_null());
        let stored = if value.is_null() {
            Value::default_for(&self.data_type)
        } else {
            value.clone()
        };
        match (&mut self.data, stored) {
            (ChunkData::Bool(v), Value::Bool(x)) => v[idx] = x,
            (ChunkData::Int8(v), Value::Int8(x)) => v[idx] = x,
            (ChunkData::Int16(v), Value::Int16(x)) => v[idx] = x,
            (ChunkData::Int32(v), Value::Int32(x) | Value::Date(x)) => v[idx] = x,
            (ChunkData::Int64(v), Value::Int64(x) | Value::Timestamp(x)) => v[idx] = x,
            (ChunkData::Int128(v), Value::Int128(x)) => v[idx] = x,
            (ChunkData::UInt8(v), Value::UInt8(x)) => v[idx] = x,
            (ChunkData::UInt16(v), Value::UInt16(x)) => v[idx] = x,
            (ChunkData::UInt32(v), Value::UInt32(x)) => v[idx] = x,
            (ChunkData::UInt64(v), Value::UInt64(x)) => v[idx] = x,
            (ChunkData::Float(v), Value::Float(x)) => v[idx] = x,
            (ChunkData::Double(v), Value::Double(x)) => v[idx] = x,
            (ChunkData::String(v), Value::String(x)) => v[idx] = x,
            (ChunkData::Interval(v), Value::Interval(x)) => v[idx] = x,
            (ChunkData::InternalId(v), Value::InternalId(x)) => v[idx] = x,
            (ChunkData::Nested(v), x @ (Value::List(_) | Value::Struct(_))) => v[idx] = x,
            _ => unreachable!("value was type-checked against the chunk type"),
        }
        Ok(old)
    }

    /// Copies `count` values starting at `start` into positions `0..count` of
    /// `out`.
    pub fn scan_into(&self, start: RowIdx, count: u64, out: &mut ValueVector) -> Result<()> {
        if start + count > self.len() {
            return Err(Error::OutOfRange {
                what: "chunk scan range",
                index: start + count,
                len: self.len(),
            });
        }
        for i in 0..count {
            out.set_value(i as usize, self.value(start + i)?);
        }
        Ok(())
    }

    pub fn truncate(&mut self, len: u64) {
        self.data.truncate(len as usize);
        self.nulls.truncate(len as usize);
    }

    fn pack_values(&self) -> Vec<u8> {
        let mut ser = Serializer::new();
        match &self.data {
            ChunkData::Bool(v) => v.iter().for_each(|x| ser.write_bool(*x)),
            ChunkData::Int8(v) => v.iter().for_each(|x| ser.write_i8(*x)),
            ChunkData::Int16(v) => v.iter().for_each(|x| ser.write_i16(*x)),
            ChunkData::Int32(v) => v.iter().for_each(|x| ser.write_i32(*x)),
            ChunkData::Int64(v) => v.iter().for_each(|x| ser.write_i64(*x)),
            ChunkData::Int128(v) => v.iter().for_each(|x| ser.write_i128(*x)),
            ChunkData::UInt8(v) => v.iter().for_each(|x| ser.write_u8(*x)),
            ChunkData::UInt16(v) => v.iter().for_each(|x| ser.write_u16(*x)),
            ChunkData::UInt32(v) => v.iter().for_each(|x| ser.write_u32(*x)),
            ChunkData::UInt64(v) => v.iter().for_each(|x| ser.write_u64(*x)),
            ChunkData::Float(v) => v.iter().for_each(|x| ser.write_f32(*x)),
            ChunkData::Double(v) => v.iter().for_each(|x| ser.write_f64(*x)),
            ChunkData::String(v) => v.iter().for_each(|x| ser.write_string(x)),
            ChunkData::Interval(v) => v.iter().for_each(|x| {
                ser.write_i32(x.months);
                ser.write_i32(x.days);
                ser.write_i64(x.micros);
            }),
            ChunkData::InternalId(v) => v.iter().for_each(|x| {
                ser.write_u32(x.table_id.0);
                ser.write_u64(x.offset);
            }),
            ChunkData::Nested(v) => v.iter().for_each(|x| x.serialize(&mut ser)),
        }
        ser.into_bytes()
    }

    fn unpack_values(data_type: &LogicalType, bytes: &[u8], count: usize) -> Result<ChunkData> {
        let mut de = Deserializer::new(bytes);
        macro_rules! read_n {
            ($variant:ident, $read:ident) => {{
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(de.$read()?);
                }
                ChunkData::$variant(v)
            }};
        }
        let data = match data_type.physical_type() {
            PhysicalType::Bool => read_n!(Bool, read_bool),
            PhysicalType::Int8 => read_n!(Int8, read_i8),
            PhysicalType::Int16 => read_n!(Int16, read_i16),
            PhysicalType::Int32 => read_n!(Int32, read_i32),
            PhysicalType::Int64 => read_n!(Int64, read_i64),
            PhysicalType::Int128 => read_n!(Int128, read_i128),
            PhysicalType::UInt8 => read_n!(UInt8, read_u8),
            PhysicalType::UInt16 => read_n!(UInt16, read_u16),
            PhysicalType::UInt32 => read_n!(UInt32, read_u32),
            PhysicalType::UInt64 => read_n!(UInt64, read_u64),
            PhysicalType::Float32 => read_n!(Float, read_f32),
            PhysicalType::Float64 => read_n!(Double, read_f64),
            PhysicalType::String => read_n!(String, read_string),
            PhysicalType::Interval => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(Interval {
                        months: de.read_i32()?,
                        days: de.read_i32()?,
                        micros: de.read_i64()?,
                    });
                }
                ChunkData::Interval(v)
            }
            PhysicalType::InternalId => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(InternalId {
                        table_id: TableId(de.read_u32()?),
                        offset: de.read_u64()?,
                    });
                }
                ChunkData::InternalId(v)
            }
            PhysicalType::Nested => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(Value::deserialize(&mut de)?);
                }
                ChunkData::Nested(v)
            }
        };
        Ok(data)
    }

    /// On-disk blob: `[num_values u64][encoding u8][payload_len u64][payload]
    /// [null_valid_count u64][null words][crc32c u32]`.
    fn encode_blob(&self, enable_compression: bool) -> Vec<u8> {
        let values = self.pack_values();
        let (encoding, payload) =
            codec::encode(self.data_type.physical_type(), &values, enable_compression);
        let mut ser = Serializer::new();
        ser.write_u64(self.len());
        ser.write_u8(encoding);
        ser.write_u64(payload.len() as u64);
        ser.write_bytes(&payload);
        ser.write_list_len(self.len() as usize);
        for i in 0..self.len() as usize {
            ser.write_bool(self.nulls.is_valid(i));
        }
        let checksum = crc32c::crc32c(ser.bytes());
        ser.write_u32(checksum);
        ser.into_bytes()
    }

    fn decode_blob(data_type: LogicalType, capacity: u64, blob: &[u8]) -> Result<Self> {
        if blob.len() < 4 {
            return Err(Error::Corruption("chunk blob too short".into()));
        }
        let (payload, checksum_bytes) = blob.split_at(blob.len() - 4);
        let stored = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
        if crc32c::crc32c(payload) != stored {
            return Err(Error::Corruption("chunk blob checksum mismatch".into()));
        }
        let mut de = Deserializer::new(payload);
        let num_values = de.read_u64()? as usize;
        let encoding = de.read_u8()?;
        let payload_len = de.read_u64()? as usize;
        let encoded = de.read_bytes(payload_len)?;
        let values = codec::decode(data_type.physical_type(), encoding, encoded)?;
        let data = Self::unpack_values(&data_type, &values, num_values)?;
        if data.len() != num_values {
            return Err(Error::Corruption("chunk value count mismatch".into()));
        }
        let null_count = de.read_list_len()?;
        if null_count != num_values {
            return Err(Error::Corruption("chunk null count mismatch".into()));
        }
        let mut nulls = NullMask::default();
        for _ in 0..null_count {
            nulls.push(de.read_bool()?);
        }
        Ok(Self {
            data_type,
            data,
            nulls,
            capacity,
            persistent: None,
        })
    }

    /// Writes the chunk to freshly allocated pages and records the span.
    pub fn flush(&mut self, pm: &PageManager, enable_compression: bool) -> Result<()> {
        let blob = self.encode_blob(enable_compression);
        let page_size = pm.page_size() as usize;
        let mut pages = Vec::with_capacity(blob.len().div_ceil(page_size));
        for part in blob.chunks(page_size) {
            let page = pm.allocate();
            pm.write_new_page(page, part)?;
            pages.push(page);
        }
        self.persistent = Some(PageSpan {
            pages,
            num_bytes: blob.len() as u64,
        });
        Ok(())
    }

    /// Reads a flushed chunk back from its pages.
    pub fn load(
        pm: &PageManager,
        span: PageSpan,
        data_type: LogicalType,
        capacity: u64,
    ) -> Result<Self> {
        let mut blob = Vec::with_capacity(span.num_bytes as usize);
        for page in &span.pages {
            blob.extend_from_slice(&pm.read_page(*page)?);
        }
        if (blob.len() as u64) < span.num_bytes {
            return Err(Error::Corruption("chunk pages shorter than span".into()));
        }
        blob.truncate(span.num_bytes as usize);
        let mut chunk = Self::decode_blob(data_type, capacity, &blob)?;
        chunk.persistent = Some(span);
        Ok(chunk)
    }

    /// Returns the chunk's pages to the free list.
    pub fn reclaim(&mut self, pm: &PageManager) {
        if let Some(span) = self.persistent.take() {
            pm.free_all(&span.pages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_chunk(values: &[i64]) -> ColumnChunk {
        let mut chunk = ColumnChunk::new(LogicalType::Int64, 2048);
        for v in values {
            chunk.append_value(&Value::Int64(*v)).unwrap();
        }
        chunk
    }

    #[test]
    fn append_and_read() {
        let mut chunk = int_chunk(&[1, 2, 3]);
        chunk.append_value(&Value::Null).unwrap();
        assert_eq!(chunk.len(), 4);
        assert_eq!(chunk.value(1).unwrap(), Value::Int64(2));
        assert_eq!(chunk.value(3).unwrap(), Value::Null);
    }

    #[test]
    fn append_past_capacity_is_chunk_full() {
        let mut chunk = ColumnChunk::new(LogicalType::Int64, 2);
        chunk.append_value(&Value::Int64(1)).unwrap();
        chunk.append_value(&Value::Int64(2)).unwrap();
        match chunk.append_value(&Value::Int64(3)) {
            Err(Error::ChunkFull) => {}
            other => panic!("expected ChunkFull, got {other:?}"),
        }
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut chunk = int_chunk(&[1]);
        match chunk.append_value(&Value::String("x".into())) {
            Err(Error::TypeMismatch { .. }) => {}
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
        match chunk.set_value(0, &Value::Bool(true)) {
            Err(Error::TypeMismatch { .. }) => {}
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn read_past_len_is_out_of_range() {
        let chunk = int_chunk(&[1]);
        match chunk.value(5) {
            Err(Error::OutOfRange { .. }) => {}
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn update_returns_old_value() {
        let mut chunk = int_chunk(&[10, 20]);
        let old = chunk.set_value(1, &Value::Int64(25)).unwrap();
        assert_eq!(old, Value::Int64(20));
        assert_eq!(chunk.value(1).unwrap(), Value::Int64(25));
    }

    #[test]
    fn flush_and_load_roundtrip() {
        let pm = PageManager::in_memory(512);
        let mut chunk = ColumnChunk::new(LogicalType::String, 2048);
        for i in 0..300 {
            if i % 7 == 0 {
                chunk.append_value(&Value::Null).unwrap();
            } else {
                chunk.append_value(&Value::String(format!("value-{i}"))).unwrap();
            }
        }
        chunk.flush(&pm, true).unwrap();
        let span = chunk.page_span().unwrap().clone();
        assert!(span.pages.len() > 1);

        let loaded = ColumnChunk::load(&pm, span, LogicalType::String, 2048).unwrap();
        assert_eq!(loaded.len(), chunk.len());
        for i in 0..300 {
            assert_eq!(loaded.value(i).unwrap(), chunk.value(i).unwrap());
        }
    }

    #[test]
    fn compressed_flush_roundtrips() {
        let pm = PageManager::in_memory(4096);
        let mut chunk = ColumnChunk::new(LogicalType::Int64, 4096);
        for _ in 0..2048 {
            chunk.append_value(&Value::Int64(7)).unwrap();
        }
        chunk.flush(&pm, true).unwrap();
        let span = chunk.page_span().unwrap().clone();
        // A constant run compresses into a single page.
        assert_eq!(span.pages.len(), 1);
        let loaded = ColumnChunk::load(&pm, span, LogicalType::Int64, 4096).unwrap();
        assert_eq!(loaded.value(2047).unwrap(), Value::Int64(7));
    }

    #[test]
    fn reclaim_frees_pages() {
        let pm = PageManager::in_memory(512);
        let mut chunk = int_chunk(&[1, 2, 3]);
        chunk.flush(&pm, false).unwrap();
        let first_page = chunk.page_span().unwrap().pages[0];
        chunk.reclaim(&pm);
        assert!(chunk.page_span().is_none());
        assert_eq!(pm.allocate(), first_page);
    }
}
