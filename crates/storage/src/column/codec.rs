//! Type-specific chunk encodings.
//!
//! A codec maps the serialised chunk body to bytes and back; the encoding
//! byte written ahead of the payload tells the reader which codec to apply.
//! Fixed-width types get run-length encoding over their elements; everything
//! else stays plain.

use quiver_types::PhysicalType;

use crate::error::{Error, Result};

pub const ENCODING_PLAIN: u8 = 0;
pub const ENCODING_RLE: u8 = 1;

/// Element width of a fixed-width physical type; `None` for variable-width.
fn element_width(physical: PhysicalType) -> Option<usize> {
    match physical {
        PhysicalType::Bool | PhysicalType::Int8 | PhysicalType::UInt8 => Some(1),
        PhysicalType::Int16 | PhysicalType::UInt16 => Some(2),
        PhysicalType::Int32 | PhysicalType::UInt32 | PhysicalType::Float32 => Some(4),
        PhysicalType::Int64 | PhysicalType::UInt64 | PhysicalType::Float64 => Some(8),
        PhysicalType::Int128 | PhysicalType::Interval => Some(16),
        PhysicalType::InternalId => Some(12),
        PhysicalType::String | PhysicalType::Nested => None,
    }
}

/// Picks an encoding for `values` (the packed element array of a chunk) and
/// returns the encoding byte plus payload. Only returns RLE when it shrinks.
pub fn encode(physical: PhysicalType, values: &[u8], enable_compression: bool) -> (u8, Vec<u8>) {
    if enable_compression
        && let Some(width) = element_width(physical)
        && !values.is_empty()
    {
        let rle = rle_encode(values, width);
        if rle.len() < values.len() {
            return (ENCODING_RLE, rle);
        }
    }
    (ENCODING_PLAIN, values.to_vec())
}

/// Inverse of [`encode`].
pub fn decode(physical: PhysicalType, encoding: u8, payload: &[u8]) -> Result<Vec<u8>> {
    match encoding {
        ENCODING_PLAIN => Ok(payload.to_vec()),
        ENCODING_RLE => {
            let width = element_width(physical).ok_or_else(|| {
                Error::Corruption(format!("rle encoding on variable-width type {physical:?}"))
            })?;
            rle_decode(payload, width)
        }
        other => Err(Error::Corruption(format!("unknown chunk encoding {other}"))),
    }
}

/// Runs of identical `width`-sized elements as `(count: u32, element)` pairs.
fn rle_encode(values: &[u8], width: usize) -> Vec<u8> {
    debug_assert_eq!(values.len() % width, 0);
    let mut out = Vec::new();
    let mut chunks = values.chunks_exact(width);
    let Some(first) = chunks.next() else {
        return out;
    };
    let mut run: (&[u8], u32) = (first, 1);
    for element in chunks {
        if element == run.0 && run.1 < u32::MAX {
            run.1 += 1;
        } else {
            out.extend_from_slice(&run.1.to_le_bytes());
            out.extend_from_slice(run.0);
            run = (element, 1);
        }
    }
    out.extend_from_slice(&run.1.to_le_bytes());
    out.extend_from_slice(run.0);
    out
}

fn rle_decode(payload: &[u8], width: usize) -> Result<Vec<u8>> {
    let pair = 4 + width;
    if payload.len() % pair != 0 {
        return Err(Error::Corruption("rle payload length mismatch".into()));
    }
    let mut out = Vec::new();
    for entry in payload.chunks_exact(pair) {
        let count = u32::from_le_bytes(entry[..4].try_into().unwrap());
        let element = &entry[4..];
        for _ in 0..count {
            out.extend_from_slice(element);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn constant_runs_shrink() {
        let values: Vec<u8> = [42i64; 512]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let (encoding, payload) = encode(PhysicalType::Int64, &values, true);
        assert_eq!(encoding, ENCODING_RLE);
        assert!(payload.len() < values.len());
        assert_eq!(decode(PhysicalType::Int64, encoding, &payload).unwrap(), values);
    }

    #[test]
    fn compression_disabled_stays_plain() {
        let values = vec![7u8; 64];
        let (encoding, _) = encode(PhysicalType::UInt8, &values, false);
        assert_eq!(encoding, ENCODING_PLAIN);
    }

    #[test]
    fn variable_width_stays_plain() {
        let (encoding, payload) = encode(PhysicalType::String, b"aaaabbbb", true);
        assert_eq!(encoding, ENCODING_PLAIN);
        assert_eq!(payload, b"aaaabbbb");
    }

    proptest! {
        #[test]
        fn rle_roundtrips(elements in proptest::collection::vec(0i32..4, 0..600)) {
            let bytes: Vec<u8> = elements.iter().flat_map(|v| v.to_le_bytes()).collect();
            let (encoding, payload) = encode(PhysicalType::Int32, &bytes, true);
            let decoded = decode(PhysicalType::Int32, encoding, &payload).unwrap();
            prop_assert_eq!(decoded, bytes);
        }
    }
}
