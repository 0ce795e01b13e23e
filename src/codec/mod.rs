//! Value codec: raw bytes <-> raw values <-> physical values
//!
//! Converts between slave memory bytes and engineering-unit values given a
//! datatype, byte order, and encoding rule. Scalars and fixed-length arrays
//! are supported; ASCII parameters bypass numeric encoding entirely and are
//! write-protected; curve and map parameters fail explicitly instead of
//! silently no-opping.
//!
//! # Type preservation
//!
//! Applying or inverting an encoding rule preserves the numeric kind of its
//! input: integer datatypes stay [`Value::Integer`] (linear results are
//! truncated toward zero), float datatypes stay [`Value::Float`].
//! Dictionary lookups are lossless key/label swaps.

use crate::database::{deposit, CompuMethod, CompuRule, ParameterKind, SymbolRef};
use crate::error::{Result, XcpError};
use crate::types::{ByteOrder, Datatype, Value};

/// Decode one scalar raw value from the leading bytes of a slice
///
/// The slice may be longer than the datatype (deposit padding); the value
/// occupies the first `native_size` bytes.
pub fn decode_raw(bytes: &[u8], datatype: Datatype, byte_order: ByteOrder) -> Result<Value> {
    let size = datatype.native_size() as usize;
    if bytes.len() < size {
        return Err(XcpError::Encoding(format!(
            "need {} bytes for {}, got {}",
            size,
            datatype,
            bytes.len()
        )));
    }
    let bytes = &bytes[..size];

    if datatype.is_float() {
        let value = match (datatype, byte_order) {
            (Datatype::Float32Ieee, ByteOrder::MsbFirst) => {
                f32::from_be_bytes(bytes.try_into().unwrap_or_default()) as f64
            }
            (Datatype::Float32Ieee, ByteOrder::MsbLast) => {
                f32::from_le_bytes(bytes.try_into().unwrap_or_default()) as f64
            }
            (Datatype::Float64Ieee, ByteOrder::MsbFirst) => {
                f64::from_be_bytes(bytes.try_into().unwrap_or_default())
            }
            (Datatype::Float64Ieee, ByteOrder::MsbLast) => {
                f64::from_le_bytes(bytes.try_into().unwrap_or_default())
            }
            _ => unreachable!("is_float covers exactly the float datatypes"),
        };
        return Ok(Value::Float(value));
    }

    // Accumulate into a u64, then reinterpret as two's complement if signed.
    let mut accum: u64 = 0;
    match byte_order {
        ByteOrder::MsbFirst => {
            for &b in bytes {
                accum = (accum << 8) | b as u64;
            }
        }
        ByteOrder::MsbLast => {
            for &b in bytes.iter().rev() {
                accum = (accum << 8) | b as u64;
            }
        }
    }
    let value = if datatype.is_signed() {
        let shift = 64 - 8 * size as u32;
        ((accum << shift) as i64) >> shift
    } else {
        accum as i64
    };
    Ok(Value::Integer(value))
}

/// Encode one scalar raw value to its native-size byte representation
///
/// Exact inverse of [`decode_raw`]: `decode_raw(&encode_raw(v)?)? == v`
/// for every representable `v`. Float inputs to integer datatypes are
/// truncated toward zero; integer inputs to float datatypes are widened.
/// Integers outside the datatype's representable range fail with an
/// `Encoding` error instead of wrapping.
pub fn encode_raw(value: &Value, datatype: Datatype, byte_order: ByteOrder) -> Result<Vec<u8>> {
    let size = datatype.native_size() as usize;

    if datatype.is_float() {
        let v = match value {
            Value::Float(v) => *v,
            Value::Integer(v) => *v as f64,
            other => {
                return Err(XcpError::Encoding(format!(
                    "cannot encode {} as {}",
                    other, datatype
                )))
            }
        };
        let bytes = match (datatype, byte_order) {
            (Datatype::Float32Ieee, ByteOrder::MsbFirst) => (v as f32).to_be_bytes().to_vec(),
            (Datatype::Float32Ieee, ByteOrder::MsbLast) => (v as f32).to_le_bytes().to_vec(),
            (Datatype::Float64Ieee, ByteOrder::MsbFirst) => v.to_be_bytes().to_vec(),
            (Datatype::Float64Ieee, ByteOrder::MsbLast) => v.to_le_bytes().to_vec(),
            _ => unreachable!("is_float covers exactly the float datatypes"),
        };
        return Ok(bytes);
    }

    let v = match value {
        Value::Integer(v) => *v,
        Value::Float(v) => v.trunc() as i64,
        other => {
            return Err(XcpError::Encoding(format!(
                "cannot encode {} as {}",
                other, datatype
            )))
        }
    };
    if !integer_in_range(v, datatype) {
        return Err(XcpError::Encoding(format!(
            "{} does not fit {}",
            v, datatype
        )));
    }
    let le = (v as u64).to_le_bytes();
    let mut bytes = le[..size].to_vec();
    if byte_order == ByteOrder::MsbFirst {
        bytes.reverse();
    }
    Ok(bytes)
}

/// Whether `v` is representable by the integer datatype
///
/// 64-bit checks degenerate to the sign: `i64` covers A_INT64 completely
/// and the non-negative half of A_UINT64.
fn integer_in_range(v: i64, datatype: Datatype) -> bool {
    let bits = 8 * datatype.native_size();
    if datatype.is_signed() {
        if bits == 64 {
            return true;
        }
        let max = (1i64 << (bits - 1)) - 1;
        (-max - 1..=max).contains(&v)
    } else {
        if bits == 64 {
            return v >= 0;
        }
        (0..(1i64 << bits)).contains(&v)
    }
}

/// Apply an encoding rule to a raw value
pub fn apply_compu(raw: &Value, compu: Option<&CompuMethod>) -> Result<Value> {
    let Some(compu) = compu else {
        return Ok(raw.clone());
    };
    match &compu.rule {
        CompuRule::Identity => Ok(raw.clone()),
        CompuRule::Linear { a, b } => match raw {
            Value::Integer(v) => Ok(Value::Integer((*v as f64 * a + b).trunc() as i64)),
            Value::Float(v) => Ok(Value::Float(v * a + b)),
            Value::IntArray(vs) => Ok(Value::IntArray(
                vs.iter().map(|v| (*v as f64 * a + b).trunc() as i64).collect(),
            )),
            Value::FloatArray(vs) => Ok(Value::FloatArray(vs.iter().map(|v| v * a + b).collect())),
            other => Err(XcpError::Encoding(format!(
                "linear rule '{}' cannot apply to {}",
                compu.name, other
            ))),
        },
        CompuRule::Dictionary { dictionary } => match raw {
            Value::Integer(v) => dictionary
                .get(&v.to_string())
                .map(|label| Value::Text(label.clone()))
                .ok_or_else(|| {
                    XcpError::Encoding(format!(
                        "dictionary '{}' has no entry for raw value {}",
                        compu.name, v
                    ))
                }),
            other => Err(XcpError::Encoding(format!(
                "dictionary rule '{}' cannot apply to {}",
                compu.name, other
            ))),
        },
    }
}

/// Invert an encoding rule, recovering the raw value for a physical one
pub fn invert_compu(
    physical: &Value,
    compu: Option<&CompuMethod>,
    datatype: Datatype,
) -> Result<Value> {
    let Some(compu) = compu else {
        return Ok(physical.clone());
    };
    match &compu.rule {
        CompuRule::Identity => Ok(physical.clone()),
        CompuRule::Linear { a, b } => {
            if *a == 0.0 {
                return Err(XcpError::Encoding(format!(
                    "linear rule '{}' with a = 0 is not invertible",
                    compu.name
                )));
            }
            let invert_one = |phy: f64| -> Value {
                let raw = (phy - b) / a;
                if datatype.is_float() {
                    Value::Float(raw)
                } else {
                    Value::Integer(raw.trunc() as i64)
                }
            };
            match physical {
                Value::Integer(v) => Ok(invert_one(*v as f64)),
                Value::Float(v) => Ok(invert_one(*v)),
                Value::IntArray(vs) => {
                    let raw: Vec<i64> = vs
                        .iter()
                        .map(|v| ((*v as f64 - b) / a).trunc() as i64)
                        .collect();
                    Ok(Value::IntArray(raw))
                }
                Value::FloatArray(vs) => {
                    Ok(Value::FloatArray(vs.iter().map(|v| (v - b) / a).collect()))
                }
                other => Err(XcpError::Encoding(format!(
                    "linear rule '{}' cannot invert {}",
                    compu.name, other
                ))),
            }
        }
        CompuRule::Dictionary { dictionary } => {
            let label = match physical {
                Value::Text(s) => s.as_str(),
                other => {
                    return Err(XcpError::Encoding(format!(
                        "dictionary rule '{}' expects a label, got {}",
                        compu.name, other
                    )))
                }
            };
            let raw_key = dictionary
                .iter()
                .find(|(_, v)| v.as_str() == label)
                .map(|(k, _)| k)
                .ok_or_else(|| {
                    XcpError::Encoding(format!(
                        "dictionary '{}' has no key for label '{}'",
                        compu.name, label
                    ))
                })?;
            let raw = raw_key.parse::<i64>().map_err(|e| {
                XcpError::Encoding(format!(
                    "dictionary '{}' key '{}' is not an integer: {}",
                    compu.name, raw_key, e
                ))
            })?;
            Ok(Value::Integer(raw))
        }
    }
}

/// Decode a symbol's bytes into its `(raw, physical)` value pair
pub fn decode_symbol(
    bytes: &[u8],
    symbol: &SymbolRef<'_>,
    byte_order: ByteOrder,
) -> Result<(Value, Value)> {
    match symbol.kind() {
        ParameterKind::Value => {
            let raw = decode_raw(bytes, symbol.datatype(), byte_order)?;
            let physical = apply_compu(&raw, symbol.compu_method())?;
            Ok((raw, physical))
        }
        ParameterKind::Ascii => {
            let text: String = bytes
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect();
            Ok((Value::Bytes(bytes.to_vec()), Value::Text(text)))
        }
        ParameterKind::Array => {
            let datatype = symbol.datatype();
            let step = deposit(datatype, symbol.alignment()) as usize;
            let count = symbol.count() as usize;
            if bytes.len() < step * count {
                return Err(XcpError::Encoding(format!(
                    "array '{}' needs {} bytes, got {}",
                    symbol.name(),
                    step * count,
                    bytes.len()
                )));
            }
            let mut raw_ints = Vec::new();
            let mut raw_floats = Vec::new();
            for i in 0..count {
                match decode_raw(&bytes[i * step..], datatype, byte_order)? {
                    Value::Integer(v) => raw_ints.push(v),
                    Value::Float(v) => raw_floats.push(v),
                    _ => unreachable!("decode_raw yields Integer or Float"),
                }
            }
            let raw = if datatype.is_float() {
                Value::FloatArray(raw_floats)
            } else {
                Value::IntArray(raw_ints)
            };
            let physical = apply_compu(&raw, symbol.compu_method())?;
            Ok((raw, physical))
        }
        ParameterKind::Curve | ParameterKind::Map => Err(XcpError::NotImplemented(format!(
            "decoding curve/map parameter '{}'",
            symbol.name()
        ))),
    }
}

/// Encode a physical value into the symbol's byte representation
///
/// Array elements are emitted at their deposit stride, zero-padded past the
/// native size, so that [`decode_symbol`] round-trips the result.
pub fn encode_symbol(
    physical: &Value,
    symbol: &SymbolRef<'_>,
    byte_order: ByteOrder,
) -> Result<Vec<u8>> {
    match symbol.kind() {
        ParameterKind::Value => {
            let raw = invert_compu(physical, symbol.compu_method(), symbol.datatype())?;
            encode_raw(&raw, symbol.datatype(), byte_order)
        }
        ParameterKind::Ascii => Err(XcpError::UnsupportedOperation(format!(
            "ASCII parameter '{}' is read-only",
            symbol.name()
        ))),
        ParameterKind::Array => {
            let datatype = symbol.datatype();
            let step = deposit(datatype, symbol.alignment()) as usize;
            let count = symbol.count() as usize;
            let elements: Vec<Value> = match physical {
                Value::IntArray(vs) => vs.iter().map(|v| Value::Integer(*v)).collect(),
                Value::FloatArray(vs) => vs.iter().map(|v| Value::Float(*v)).collect(),
                other => {
                    return Err(XcpError::Encoding(format!(
                        "array '{}' expects an array value, got {}",
                        symbol.name(),
                        other
                    )))
                }
            };
            if elements.len() != count {
                return Err(XcpError::Encoding(format!(
                    "array '{}' expects {} elements, got {}",
                    symbol.name(),
                    count,
                    elements.len()
                )));
            }
            let mut out = Vec::with_capacity(step * count);
            for element in &elements {
                let raw = invert_compu(element, symbol.compu_method(), datatype)?;
                let mut bytes = encode_raw(&raw, datatype, byte_order)?;
                bytes.resize(step, 0);
                out.extend_from_slice(&bytes);
            }
            Ok(out)
        }
        ParameterKind::Curve | ParameterKind::Map => Err(XcpError::NotImplemented(format!(
            "encoding curve/map parameter '{}'",
            symbol.name()
        ))),
    }
}
