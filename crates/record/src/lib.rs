//! Record serial-type codec.
//!
//! Values serialize into records keyed by one-byte serial types: a record
//! is a varint header length, the header's worth of varint serial types,
//! then the concatenated payloads. All integers are big-endian. This is
//! the format clients put *into* pages; the page store never parses it.


mod varint;

pub use varint::{read_varint, varint_len, write_varint};

use common::{DbError, DbResult};

/// A single column value inside a record.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Serial types for the fixed-width integer encodings, by payload width.
const INT_WIDTHS: [(u64, usize); 6] = [(1, 1), (2, 2), (3, 3), (4, 4), (5, 6), (6, 8)];

impl Value {
    /// The serial type this value encodes as.
    pub fn serial_type(&self) -> u64 {
        match self {
            Value::Null => 0,
            Value::Integer(0) => 8,
            Value::Integer(1) => 9,
            Value::Integer(v) => match int_width(*v) {
                1 => 1,
                2 => 2,
                3 => 3,
                4 => 4,
                6 => 5,
                _ => 6,
            },
            Value::Real(_) => 7,
            Value::Blob(b) => 12 + 2 * b.len() as u64,
            Value::Text(s) => 13 + 2 * s.len() as u64,
        }
    }

    /// Payload size in bytes for a given serial type.
    pub fn payload_len(serial_type: u64) -> usize {
        match serial_type {
            0 | 8 | 9 => 0,
            7 => 8,
            t if t >= 12 => (t as usize - 12) / 2,
            t => INT_WIDTHS
                .iter()
                .find(|(st, _)| *st == t)
                .map(|(_, w)| *w)
                .unwrap_or(0),
        }
    }
}

/// Minimal signed width (1, 2, 3, 4, 6, or 8 bytes) that holds `v`.
fn int_width(v: i64) -> usize {
    if (-0x80..0x80).contains(&v) {
        1
    } else if (-0x8000..0x8000).contains(&v) {
        2
    } else if (-0x80_0000..0x80_0000).contains(&v) {
        3
    } else if (-0x8000_0000..0x8000_0000).contains(&v) {
        4
    } else if (-0x8000_0000_0000..0x8000_0000_0000).contains(&v) {
        6
    } else {
        8
    }
}

/// Appends `v`'s payload bytes (big-endian, minimal width) to `out`.
fn write_payload(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null | Value::Integer(0) | Value::Integer(1) => {}
        Value::Integer(v) => {
            let width = int_width(*v);
            let be = v.to_be_bytes();
            out.extend_from_slice(&be[8 - width..]);
        }
        Value::Real(f) => out.extend_from_slice(&f.to_be_bytes()),
        Value::Text(s) => out.extend_from_slice(s.as_bytes()),
        Value::Blob(b) => out.extend_from_slice(b),
    }
}

/// Sign-extends a big-endian payload of 1..=8 bytes into an i64.
fn read_int(payload: &[u8]) -> i64 {
    let mut buf = if payload[0] & 0x80 == 0 {
        [0u8; 8]
    } else {
        [0xffu8; 8]
    };
    buf[8 - payload.len()..].copy_from_slice(payload);
    i64::from_be_bytes(buf)
}

/// Encodes a sequence of values into record bytes.
pub fn encode(values: &[Value]) -> Vec<u8> {
    let mut serial_types = Vec::new();
    for value in values {
        write_varint(&mut serial_types, value.serial_type());
    }

    // The header length varint counts itself, so its width feeds back into
    // the value it encodes; iterate until the width settles.
    let mut header_len = serial_types.len() + 1;
    loop {
        let candidate = serial_types.len() + varint_len(header_len as u64);
        if candidate == header_len {
            break;
        }
        header_len = candidate;
    }

    let mut out = Vec::new();
    write_varint(&mut out, header_len as u64);
    out.extend_from_slice(&serial_types);
    for value in values {
        write_payload(&mut out, value);
    }
    out
}

/// Decodes record bytes back into values.
pub fn decode(bytes: &[u8]) -> DbResult<Vec<Value>> {
    let (header_len, header_varint_len) =
        read_varint(bytes).ok_or_else(|| DbError::Record("truncated record header".into()))?;
    let header_len = header_len as usize;
    if header_len < header_varint_len || header_len > bytes.len() {
        return Err(DbError::Record(format!(
            "header length {header_len} out of range"
        )));
    }

    let mut serial_types = Vec::new();
    let mut pos = header_varint_len;
    while pos < header_len {
        let (st, n) = read_varint(&bytes[pos..header_len])
            .ok_or_else(|| DbError::Record("truncated serial type".into()))?;
        serial_types.push(st);
        pos += n;
    }

    let mut values = Vec::with_capacity(serial_types.len());
    let mut pos = header_len;
    for st in serial_types {
        let len = Value::payload_len(st);
        let payload = bytes
            .get(pos..pos + len)
            .ok_or_else(|| DbError::Record("truncated payload".into()))?;
        pos += len;

        let value = match st {
            0 => Value::Null,
            8 => Value::Integer(0),
            9 => Value::Integer(1),
            1..=6 => Value::Integer(read_int(payload)),
            7 => Value::Real(f64::from_be_bytes(payload.try_into().unwrap())),
            t if t >= 13 && t % 2 == 1 => Value::Text(
                String::from_utf8(payload.to_vec())
                    .map_err(|e| DbError::Record(format!("invalid utf-8 in text: {e}")))?,
            ),
            t if t >= 12 && t % 2 == 0 => Value::Blob(payload.to_vec()),
            t => return Err(DbError::Record(format!("unknown serial type {t}"))),
        };
        values.push(value);
    }
    Ok(values)
}
