//! Deterministic CBOR encoding of a [`Value`] tree.
//!
//! Heads are always minimal length and every container is definite-length.
//! In [`Mode::Canonical`] map keys are additionally ordered by the RFC 8949
//! core-deterministic rule (shorter key encoding first, then bytewise
//! lexicographic) and duplicate keys are rejected; insertion order is kept
//! otherwise. Signed and MACed payloads must be canonical so both sides
//! hash identical bytes.

use ciborium::value::Value;

use crate::{CborError, Result};

/// Map-key handling during encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Minimal heads, maps in insertion order.
    Deterministic,
    /// Minimal heads, map keys sorted, duplicates rejected.
    Canonical,
}

/// Encode a value tree to CBOR bytes.
pub fn encode(value: &Value, mode: Mode) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_into(value, mode, &mut out)?;
    Ok(out)
}

fn encode_into(value: &Value, mode: Mode, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            if n >= 0 {
                let n: u64 = n.try_into().map_err(|_| CborError::IntegerOverflow)?;
                write_head(out, 0, n);
            } else {
                let n: u64 = (-1 - n).try_into().map_err(|_| CborError::IntegerOverflow)?;
                write_head(out, 1, n);
            }
        }
        Value::Bytes(b) => {
            write_head(out, 2, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::Text(t) => {
            write_head(out, 3, t.len() as u64);
            out.extend_from_slice(t.as_bytes());
        }
        Value::Array(items) => {
            write_head(out, 4, items.len() as u64);
            for item in items {
                encode_into(item, mode, out)?;
            }
        }
        Value::Map(entries) => encode_map(entries, mode, out)?,
        Value::Tag(tag, inner) => {
            write_head(out, 6, *tag);
            encode_into(inner, mode, out)?;
        }
        Value::Bool(false) => out.push(0xF4),
        Value::Bool(true) => out.push(0xF5),
        Value::Null => out.push(0xF6),
        Value::Float(f) => write_float(out, *f),
        _ => return Err(CborError::UnexpectedType("encodable CBOR value")),
    }
    Ok(())
}

fn encode_map(entries: &[(Value, Value)], mode: Mode, out: &mut Vec<u8>) -> Result<()> {
    write_head(out, 5, entries.len() as u64);
    match mode {
        Mode::Deterministic => {
            for (key, value) in entries {
                encode_into(key, mode, out)?;
                encode_into(value, mode, out)?;
            }
        }
        Mode::Canonical => {
            let mut encoded: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                encoded.push((encode(key, mode)?, encode(value, mode)?));
            }
            // Shorter encoding first, then bytewise lexicographic. A slice
            // comparison on (len, bytes) implements exactly that.
            encoded.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));
            for window in encoded.windows(2) {
                if window[0].0 == window[1].0 {
                    return Err(CborError::DuplicateMapKey);
                }
            }
            for (key, value) in encoded {
                out.extend_from_slice(&key);
                out.extend_from_slice(&value);
            }
        }
    }
    Ok(())
}

/// Write a major type head with the minimal-length argument encoding.
pub fn write_head(out: &mut Vec<u8>, major: u8, arg: u64) {
    let major = major << 5;
    if arg < 24 {
        out.push(major | arg as u8);
    } else if arg <= u8::MAX as u64 {
        out.push(major | 24);
        out.push(arg as u8);
    } else if arg <= u16::MAX as u64 {
        out.push(major | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= u32::MAX as u64 {
        out.push(major | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(major | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}

/// Number of head bytes needed for a given argument (1, 2, 3, or 5;
/// arguments above `u32::MAX` take 9). Used by the ServiceInfo chunker to
/// budget frame overhead without encoding twice.
pub fn head_len(arg: u64) -> usize {
    if arg < 24 {
        1
    } else if arg <= u8::MAX as u64 {
        2
    } else if arg <= u16::MAX as u64 {
        3
    } else if arg <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

fn write_float(out: &mut Vec<u8>, f: f64) {
    // Shortest of f32/f64 that round-trips; half-precision is never
    // produced.
    let as32 = f as f32;
    if f.is_nan() || as32 as f64 == f {
        out.push(0xFA);
        out.extend_from_slice(&as32.to_be_bytes());
    } else {
        out.push(0xFB);
        out.extend_from_slice(&f.to_be_bytes());
    }
}
