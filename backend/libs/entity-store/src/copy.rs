//! PostgreSQL binary COPY encoding
//!
//! Layout: an 11-byte signature, a flags word and a header extension length,
//! then per row a field count followed by `(length, bytes)` pairs, where a
//! length of -1 is NULL. The stream ends with a field count of -1.

use crate::column::ColumnType;
use crate::error::ValueError;
use crate::value::Value;
use bigdecimal::BigDecimal;
use bytes::{BufMut, BytesMut};

const SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// Microseconds between the Unix epoch and 2000-01-01
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const NUMERIC_POSITIVE: u16 = 0x0000;
const NUMERIC_NEGATIVE: u16 = 0x4000;
const NUMERIC_MAX_SCALE: i64 = 0x3FFF;

const INT4_OID: i32 = 23;
const INT8_OID: i32 = 20;
const TEXT_OID: i32 = 25;

/// Streaming encoder for one `COPY ... FROM STDIN (FORMAT BINARY)`
pub struct BinaryCopyEncoder {
    buf: BytesMut,
    rows: usize,
}

impl Default for BinaryCopyEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryCopyEncoder {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        buf.put_slice(SIGNATURE);
        buf.put_i32(0);
        buf.put_i32(0);
        Self { buf, rows: 0 }
    }

    /// Append one row. On error the buffer holds a partial row and the copy
    /// must be aborted.
    pub fn write_row(&mut self, fields: &[(Value, ColumnType)]) -> Result<(), ValueError> {
        let count = i16::try_from(fields.len())
            .map_err(|_| ValueError::OutOfRange(format!("{} columns in one row", fields.len())))?;
        self.buf.put_i16(count);
        for (value, column_type) in fields {
            encode_field(&mut self.buf, value, *column_type)?;
        }
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Bytes not yet handed out by [`take`](Self::take)
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the encoded bytes so far, for sending while encoding continues
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    /// Append the trailer and return the remaining bytes
    pub fn finish(mut self) -> BytesMut {
        self.buf.put_i16(-1);
        self.buf
    }
}

fn mismatch(column_type: ColumnType, value: &Value) -> ValueError {
    ValueError::Mismatch {
        expected: column_type.catalog_type(),
        found: value.kind(),
    }
}

/// Write a length-prefixed field, with integer values widened to the column
fn encode_field(buf: &mut BytesMut, value: &Value, column_type: ColumnType) -> Result<(), ValueError> {
    match (column_type, value) {
        (_, Value::Null) => buf.put_i32(-1),
        (ColumnType::Boolean, Value::Bool(v)) => {
            buf.put_i32(1);
            buf.put_u8(u8::from(*v));
        }
        (ColumnType::SmallInt, Value::SmallInt(v)) => {
            buf.put_i32(2);
            buf.put_i16(*v);
        }
        (ColumnType::Integer, Value::Int(v)) => {
            buf.put_i32(4);
            buf.put_i32(*v);
        }
        (ColumnType::Integer, Value::SmallInt(v)) => {
            buf.put_i32(4);
            buf.put_i32(i32::from(*v));
        }
        (ColumnType::BigInt, Value::BigInt(v)) => {
            buf.put_i32(8);
            buf.put_i64(*v);
        }
        (ColumnType::BigInt, Value::Int(v)) => {
            buf.put_i32(8);
            buf.put_i64(i64::from(*v));
        }
        (ColumnType::BigInt, Value::SmallInt(v)) => {
            buf.put_i32(8);
            buf.put_i64(i64::from(*v));
        }
        (ColumnType::Real, Value::Real(v)) => {
            buf.put_i32(4);
            buf.put_f32(*v);
        }
        (ColumnType::Double, Value::Double(v)) => {
            buf.put_i32(8);
            buf.put_f64(*v);
        }
        (ColumnType::Decimal, Value::Decimal(v)) => encode_numeric(buf, v)?,
        (ColumnType::Text, Value::Text(v)) => put_bytes(buf, v.as_bytes())?,
        (ColumnType::Bytes, Value::Bytes(v)) => put_bytes(buf, v)?,
        (ColumnType::Uuid, Value::Uuid(v)) => put_bytes(buf, v.as_bytes())?,
        (ColumnType::Timestamp, Value::Timestamp(v)) => {
            buf.put_i32(8);
            buf.put_i64(v.and_utc().timestamp_micros() - PG_EPOCH_OFFSET_MICROS);
        }
        (ColumnType::TimestampTz, Value::TimestampTz(v)) => {
            buf.put_i32(8);
            buf.put_i64(v.timestamp_micros() - PG_EPOCH_OFFSET_MICROS);
        }
        (ColumnType::Jsonb, Value::Json(v)) => {
            let text = serde_json::to_vec(v)?;
            put_length(buf, text.len() + 1)?;
            // jsonb binary format version
            buf.put_u8(1);
            buf.put_slice(&text);
        }
        (ColumnType::TextArray, Value::TextArray(v)) => {
            let elements: Vec<&[u8]> = v.iter().map(|s| s.as_bytes()).collect();
            encode_array(buf, TEXT_OID, &elements)?;
        }
        (ColumnType::IntegerArray, Value::IntArray(v)) => {
            let elements: Vec<[u8; 4]> = v.iter().map(|n| n.to_be_bytes()).collect();
            let slices: Vec<&[u8]> = elements.iter().map(|e| e.as_slice()).collect();
            encode_array(buf, INT4_OID, &slices)?;
        }
        (ColumnType::BigIntArray, Value::BigIntArray(v)) => {
            let elements: Vec<[u8; 8]> = v.iter().map(|n| n.to_be_bytes()).collect();
            let slices: Vec<&[u8]> = elements.iter().map(|e| e.as_slice()).collect();
            encode_array(buf, INT8_OID, &slices)?;
        }
        (column_type, value) => return Err(mismatch(column_type, value)),
    }
    Ok(())
}

fn put_length(buf: &mut BytesMut, len: usize) -> Result<(), ValueError> {
    let len = i32::try_from(len)
        .map_err(|_| ValueError::OutOfRange(format!("{} byte field", len)))?;
    buf.put_i32(len);
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<(), ValueError> {
    put_length(buf, bytes.len())?;
    buf.put_slice(bytes);
    Ok(())
}

/// One-dimensional array without NULL elements; empty arrays have zero
/// dimensions
fn encode_array(buf: &mut BytesMut, element_oid: i32, elements: &[&[u8]]) -> Result<(), ValueError> {
    if elements.is_empty() {
        buf.put_i32(12);
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_i32(element_oid);
        return Ok(());
    }

    let payload: usize = 20 + elements.iter().map(|e| 4 + e.len()).sum::<usize>();
    put_length(buf, payload)?;
    buf.put_i32(1);
    buf.put_i32(0);
    buf.put_i32(element_oid);
    put_length(buf, elements.len())?;
    buf.put_i32(1);
    for element in elements {
        put_bytes(buf, element)?;
    }
    Ok(())
}

/// NUMERIC as base-10000 digit groups with weight, sign and display scale
fn encode_numeric(buf: &mut BytesMut, value: &BigDecimal) -> Result<(), ValueError> {
    let (unscaled, exponent) = value.as_bigint_and_exponent();
    let rendered = unscaled.to_string();
    let (negative, magnitude) = match rendered.strip_prefix('-') {
        Some(rest) => (true, rest.to_string()),
        None => (false, rendered),
    };

    let (mut digits, scale) = if exponent < 0 {
        let zeros = usize::try_from(-exponent)
            .map_err(|_| ValueError::OutOfRange(format!("numeric exponent {}", exponent)))?;
        (format!("{}{}", magnitude, "0".repeat(zeros)), 0usize)
    } else if exponent > NUMERIC_MAX_SCALE {
        return Err(ValueError::OutOfRange(format!("numeric scale {}", exponent)));
    } else {
        (magnitude, exponent as usize)
    };

    if digits.len() <= scale {
        digits = format!("{}{}", "0".repeat(scale + 1 - digits.len()), digits);
    }
    let (integer, fraction) = digits.split_at(digits.len() - scale);

    let integer = format!("{}{}", "0".repeat((4 - integer.len() % 4) % 4), integer);
    let fraction = format!("{}{}", fraction, "0".repeat((4 - fraction.len() % 4) % 4));

    let mut groups: Vec<i16> = integer
        .as_bytes()
        .chunks(4)
        .chain(fraction.as_bytes().chunks(4))
        .map(|chunk| chunk.iter().fold(0i16, |acc, b| acc * 10 + i16::from(b - b'0')))
        .collect();
    let mut weight = i64::try_from(integer.len() / 4).unwrap_or(i64::MAX) - 1;

    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= leading as i64;
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        weight = 0;
    }

    let weight = i16::try_from(weight)
        .map_err(|_| ValueError::OutOfRange(format!("numeric weight {}", weight)))?;
    let ndigits = i16::try_from(groups.len())
        .map_err(|_| ValueError::OutOfRange(format!("{} numeric digits", groups.len())))?;
    let sign = if negative && !groups.is_empty() {
        NUMERIC_NEGATIVE
    } else {
        NUMERIC_POSITIVE
    };

    put_length(buf, 8 + 2 * groups.len())?;
    buf.put_i16(ndigits);
    buf.put_i16(weight);
    buf.put_u16(sign);
    buf.put_u16(scale as u16);
    for group in groups {
        buf.put_i16(group);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::str::FromStr;

    fn field(value: Value, column_type: ColumnType) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_field(&mut buf, &value, column_type).unwrap();
        buf.to_vec()
    }

    /// (ndigits, weight, sign, dscale, groups) of an encoded numeric
    fn numeric(text: &str) -> (i16, i16, u16, u16, Vec<i16>) {
        let bytes = field(
            Value::Decimal(BigDecimal::from_str(text).unwrap()),
            ColumnType::Decimal,
        );
        let word = |i: usize| i16::from_be_bytes([bytes[i], bytes[i + 1]]);
        let ndigits = word(4);
        let groups = (0..ndigits as usize).map(|g| word(12 + 2 * g)).collect();
        (ndigits, word(6), word(8) as u16, word(10) as u16, groups)
    }

    #[test]
    fn test_header_and_trailer() {
        let encoder = BinaryCopyEncoder::new();
        let bytes = encoder.finish();
        assert_eq!(&bytes[..11], SIGNATURE);
        assert_eq!(&bytes[11..19], &[0u8; 8]);
        assert_eq!(&bytes[19..], &[0xff, 0xff]);
    }

    #[test]
    fn test_row_layout() {
        let mut encoder = BinaryCopyEncoder::new();
        let header_len = encoder.buffered();
        encoder.take();
        encoder
            .write_row(&[
                (Value::Int(7), ColumnType::Integer),
                (Value::Null, ColumnType::Text),
                (Value::Text("ab".into()), ColumnType::Text),
            ])
            .unwrap();
        assert_eq!(header_len, 19);
        assert_eq!(encoder.rows(), 1);
        assert_eq!(
            encoder.take().to_vec(),
            vec![
                0, 3, // field count
                0, 0, 0, 4, 0, 0, 0, 7, // int4
                0xff, 0xff, 0xff, 0xff, // NULL
                0, 0, 0, 2, b'a', b'b',
            ]
        );
    }

    #[test]
    fn test_integers_widen_to_column() {
        assert_eq!(
            field(Value::Int(1), ColumnType::BigInt),
            vec![0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_mismatch_is_rejected() {
        let mut buf = BytesMut::new();
        let err = encode_field(&mut buf, &Value::Text("x".into()), ColumnType::Integer).unwrap_err();
        assert!(matches!(err, ValueError::Mismatch { .. }));
    }

    #[test]
    fn test_timestamps_use_postgres_epoch() {
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 1)
            .unwrap();
        assert_eq!(
            field(Value::Timestamp(epoch), ColumnType::Timestamp),
            vec![0, 0, 0, 8, 0, 0, 0, 0, 0, 0x0f, 0x42, 0x40]
        );

        let before = Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap();
        let bytes = field(Value::TimestampTz(before), ColumnType::TimestampTz);
        let micros = i64::from_be_bytes(bytes[4..12].try_into().unwrap());
        assert_eq!(micros, -1_000_000);
    }

    #[test]
    fn test_jsonb_has_version_byte() {
        let bytes = field(Value::Json(serde_json::json!([1])), ColumnType::Jsonb);
        assert_eq!(bytes, vec![0, 0, 0, 4, 1, b'[', b'1', b']']);
    }

    #[test]
    fn test_arrays() {
        let empty = field(Value::TextArray(vec![]), ColumnType::TextArray);
        assert_eq!(empty, vec![0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 25]);

        let ints = field(Value::IntArray(vec![5]), ColumnType::IntegerArray);
        assert_eq!(
            ints,
            vec![
                0, 0, 0, 28, // payload length
                0, 0, 0, 1, // ndim
                0, 0, 0, 0, // has nulls
                0, 0, 0, 23, // int4
                0, 0, 0, 1, // length
                0, 0, 0, 1, // lower bound
                0, 0, 0, 4, 0, 0, 0, 5,
            ]
        );
    }

    #[test]
    fn test_numeric_groups() {
        assert_eq!(numeric("123.45"), (2, 0, 0, 2, vec![123, 4500]));
        assert_eq!(numeric("0.001"), (1, -1, 0, 3, vec![10]));
        assert_eq!(numeric("-20000"), (1, 1, 0x4000, 0, vec![2]));
        assert_eq!(numeric("0"), (0, 0, 0, 0, vec![]));
        assert_eq!(numeric("12345678.9"), (3, 1, 0, 1, vec![1234, 5678, 9000]));
    }

    #[test]
    fn test_numeric_negative_exponent() {
        let value = BigDecimal::from_str("5e4").unwrap();
        let mut buf = BytesMut::new();
        encode_numeric(&mut buf, &value).unwrap();
        // 50000 = 5 * 10000^1
        assert_eq!(&buf[4..], &[0, 1, 0, 1, 0, 0, 0, 0, 0, 5]);
    }
}
