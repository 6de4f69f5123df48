//! Canonical byte encoding of a sketch, and the digest fingerprint used by
//! the gossip layer to skip transfers between already-identical replicas.
//!
//! Layout: a three-byte header `{format_version, p, mode}` followed by the
//! register payload. Dense mode carries the full `m`-byte register array.
//! Sparse mode carries a varint pair count, then for each nonzero register
//! a varint index delta (indices strictly ascending) and the one-byte
//! value. Either mode decodes to the identical logical register vector; the
//! mode is chosen from the sketch's in-memory representation and is not
//! part of the value.

use std::hash::Hasher;

use bytes::{Buf, BufMut};
use twox_hash::XxHash64;

use crate::error::SketchError;
use crate::hll::{HllSketch, MAX_PRECISION, MIN_PRECISION};
use crate::varint::VarInt;

/// FORMAT_VERSION is bumped on any incompatible layout change.
pub const FORMAT_VERSION: u8 = 1;

/// MODE_DENSE tags a full register array payload.
pub const MODE_DENSE: u8 = 0;
/// MODE_SPARSE tags a delta-encoded pair list payload.
pub const MODE_SPARSE: u8 = 1;

const HEADER_LEN: usize = 3;

/// encode serializes the sketch, picking the cheaper payload mode.
pub fn encode(s: &HllSketch) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 8);
    buf.put_u8(FORMAT_VERSION);
    buf.put_u8(s.precision());
    if s.is_sparse() {
        buf.put_u8(MODE_SPARSE);
        (s.nonzero() as u64).encode_var(&mut buf);
        let mut prev = 0_u32;
        let mut first = true;
        for (idx, v) in s.registers().enumerate() {
            if v == 0 {
                continue;
            }
            let idx = idx as u32;
            let delta = if first { idx } else { idx - prev };
            first = false;
            prev = idx;
            delta.encode_var(&mut buf);
            buf.put_u8(v);
        }
    } else {
        buf.put_u8(MODE_DENSE);
        buf.extend_from_slice(&s.dense_registers());
    }
    buf
}

/// decode parses a serialized sketch, validating every field; any deviation
/// from the canonical layout is a malformed-payload error, never a panic
/// and never a silently-partial sketch.
pub fn decode(data: &[u8]) -> Result<HllSketch, SketchError> {
    if data.len() < HEADER_LEN {
        return Err(SketchError::MalformedPayload(format!(
            "short header: {} bytes",
            data.len()
        )));
    }
    let mut cursor = data;
    let version = cursor.get_u8();
    if version != FORMAT_VERSION {
        return Err(SketchError::MalformedPayload(format!(
            "unsupported format version {}",
            version
        )));
    }
    let p = cursor.get_u8();
    if !(MIN_PRECISION..=MAX_PRECISION).contains(&p) {
        return Err(SketchError::MalformedPayload(format!(
            "precision {} out of range",
            p
        )));
    }
    let mode = cursor.get_u8();

    let mut sketch = HllSketch::new(p).map_err(|_| {
        // unreachable after the range check above
        SketchError::MalformedPayload(format!("precision {} out of range", p))
    })?;
    let m = sketch.m();
    let max_rank = sketch.max_rank();

    match mode {
        MODE_DENSE => {
            if cursor.remaining() != m as usize {
                return Err(SketchError::MalformedPayload(format!(
                    "dense payload is {} bytes, exp {}",
                    cursor.remaining(),
                    m
                )));
            }
            for idx in 0..m {
                let v = cursor.get_u8();
                if v > max_rank {
                    return Err(SketchError::MalformedPayload(format!(
                        "register {} holds {}, exp <= {}",
                        idx, v, max_rank
                    )));
                }
                if v != 0 {
                    sketch.set_max(idx, v);
                }
            }
        }
        MODE_SPARSE => {
            let (count, n) = u64::decode_var(cursor)
                .ok_or_else(|| SketchError::MalformedPayload("bad pair count".to_string()))?;
            cursor.advance(n);
            if count > m as u64 {
                return Err(SketchError::MalformedPayload(format!(
                    "{} sparse pairs for {} registers",
                    count, m
                )));
            }
            let mut idx = 0_u32;
            for i in 0..count {
                let (delta, n) = u32::decode_var(cursor).ok_or_else(|| {
                    SketchError::MalformedPayload(format!("bad index delta at pair {}", i))
                })?;
                cursor.advance(n);
                if i > 0 && delta == 0 {
                    return Err(SketchError::MalformedPayload(
                        "sparse indices not strictly ascending".to_string(),
                    ));
                }
                idx = idx.checked_add(delta).filter(|&v| v < m).ok_or_else(|| {
                    SketchError::MalformedPayload(format!("sparse index past {} registers", m))
                })?;
                if cursor.remaining() < 1 {
                    return Err(SketchError::MalformedPayload(format!(
                        "missing value at pair {}",
                        i
                    )));
                }
                let v = cursor.get_u8();
                if v == 0 || v > max_rank {
                    return Err(SketchError::MalformedPayload(format!(
                        "register {} holds {}, exp 1..={}",
                        idx, v, max_rank
                    )));
                }
                sketch.set_max(idx, v);
            }
            if cursor.has_remaining() {
                return Err(SketchError::MalformedPayload(format!(
                    "{} trailing bytes",
                    cursor.remaining()
                )));
            }
        }
        other => {
            return Err(SketchError::MalformedPayload(format!(
                "unknown encoding mode {}",
                other
            )));
        }
    }

    Ok(sketch)
}

/// digest fingerprints the logical register contents. Two sketches share a
/// digest exactly when they share precision and registers, regardless of
/// which representation either side happens to hold. A collision merely
/// skips one exchange; the merge itself never trusts digests.
pub fn digest(s: &HllSketch) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(&[s.precision()]);
    h.write(&s.dense_registers());
    h.finish()
}
