//! Single-record binary codec
//!
//! Decoding never validates integer ranges: every bit pattern of a field's
//! width is a legal value. The only decode failures are a span whose length
//! differs from the record size and a text field that is not valid UTF-8
//! once its NUL padding is stripped.

use crate::layout::{ByteOrder, FieldType, RecordLayout};
use hetl_common::{EtlError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// One decoded field value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Unsigned(u64),
    Signed(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Numeric view of the value, `None` for text and bytes
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Unsigned(v) => Some(*v as f64),
            FieldValue::Signed(v) => Some(*v as f64),
            FieldValue::Text(_) | FieldValue::Bytes(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Unsigned(v) => write!(f, "{v}"),
            FieldValue::Signed(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Bytes(b) => f.write_str(&hex::encode(b)),
        }
    }
}

/// A decoded record: one value per layout field, in layout order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record {
    values: Vec<FieldValue>,
}

impl Record {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<FieldValue> {
        self.values
    }
}

/// Encodes and decodes records of one layout
#[derive(Debug, Clone)]
pub struct RecordCodec {
    layout: Arc<RecordLayout>,
}

impl RecordCodec {
    pub fn new(layout: Arc<RecordLayout>) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    pub fn record_size(&self) -> usize {
        self.layout.record_size()
    }

    /// Decode exactly one record
    pub fn decode(&self, bytes: &[u8]) -> Result<Record> {
        if bytes.len() != self.layout.record_size() {
            return Err(EtlError::malformed(format!(
                "expected {} bytes, got {}",
                self.layout.record_size(),
                bytes.len()
            )));
        }

        let order = self.layout.byte_order();
        let mut values = Vec::with_capacity(self.layout.len());
        for field in self.layout.fields() {
            let raw = &bytes[field.span()];
            let value = match field.field_type {
                FieldType::Text(_) => {
                    let end = raw.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                    let text = std::str::from_utf8(&raw[..end]).map_err(|e| {
                        EtlError::malformed(format!(
                            "field '{}' is not valid UTF-8: {e}",
                            field.name
                        ))
                    })?;
                    FieldValue::Text(text.to_string())
                }
                FieldType::Bytes(_) => FieldValue::Bytes(raw.to_vec()),
                t if t.is_signed() => FieldValue::Signed(sign_extend(read_uint(raw, order), raw.len())),
                _ => FieldValue::Unsigned(read_uint(raw, order)),
            };
            values.push(value);
        }

        Ok(Record::new(values))
    }

    /// Encode a record into a fresh buffer of `record_size` bytes
    pub fn encode(&self, record: &Record) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.layout.record_size());
        self.encode_into(record, &mut out)?;
        Ok(out)
    }

    /// Append the encoding of a record to `out`
    ///
    /// On error `out` is left as it was.
    pub fn encode_into(&self, record: &Record, out: &mut Vec<u8>) -> Result<()> {
        if record.len() != self.layout.len() {
            return Err(EtlError::InvalidRecord(format!(
                "record has {} values, layout has {} fields",
                record.len(),
                self.layout.len()
            )));
        }

        let start = out.len();
        let order = self.layout.byte_order();
        for (field, value) in self.layout.fields().iter().zip(record.values()) {
            let width = field.width();
            let written = match (field.field_type, value) {
                (t, FieldValue::Unsigned(v)) if t.is_integer() && !t.is_signed() => {
                    if width < 8 && *v >> (width * 8) != 0 {
                        Err(format!("{v} does not fit {t}"))
                    } else {
                        write_uint(out, *v, width, order);
                        Ok(())
                    }
                }
                (t, FieldValue::Signed(v)) if t.is_signed() => {
                    let bits = width * 8;
                    let min = i64::MIN >> (64 - bits);
                    let max = i64::MAX >> (64 - bits);
                    if *v < min || *v > max {
                        Err(format!("{v} does not fit {t}"))
                    } else {
                        write_uint(out, *v as u64, width, order);
                        Ok(())
                    }
                }
                (FieldType::Text(n), FieldValue::Text(s)) => {
                    if s.len() > n {
                        Err(format!("text of {} bytes exceeds width {n}", s.len()))
                    } else if s.ends_with('\0') {
                        Err("text must not end with NUL".to_string())
                    } else {
                        out.extend_from_slice(s.as_bytes());
                        out.resize(out.len() + (n - s.len()), 0);
                        Ok(())
                    }
                }
                (FieldType::Bytes(n), FieldValue::Bytes(b)) => {
                    if b.len() != n {
                        Err(format!("bytes value has {} bytes, field needs {n}", b.len()))
                    } else {
                        out.extend_from_slice(b);
                        Ok(())
                    }
                }
                (t, v) => Err(format!("value {v:?} does not match type {t}")),
            };

            if let Err(msg) = written {
                out.truncate(start);
                return Err(EtlError::InvalidRecord(format!(
                    "field '{}': {msg}",
                    field.name
                )));
            }
        }

        Ok(())
    }
}

fn read_uint(raw: &[u8], order: ByteOrder) -> u64 {
    match order {
        ByteOrder::Little => raw
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        ByteOrder::Big => raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
    }
}

fn sign_extend(raw: u64, width: usize) -> i64 {
    let shift = 64 - width * 8;
    ((raw << shift) as i64) >> shift
}

fn write_uint(out: &mut Vec<u8>, value: u64, width: usize, order: ByteOrder) {
    match order {
        ByteOrder::Little => out.extend_from_slice(&value.to_le_bytes()[..width]),
        ByteOrder::Big => out.extend_from_slice(&value.to_be_bytes()[8 - width..]),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sales_codec() -> RecordCodec {
        RecordCodec::new(Arc::new(RecordLayout::sales_default()))
    }

    fn sale(id: u64, value_cents: i64, product: &str) -> Record {
        Record::new(vec![
            FieldValue::Unsigned(id),
            FieldValue::Unsigned(1_700_000_000),
            FieldValue::Unsigned(3),
            FieldValue::Signed(value_cents),
            FieldValue::Text(product.to_string()),
        ])
    }

    #[test]
    fn test_decode_known_bytes() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&1_700_000_000u64.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&(-1250i64).to_le_bytes());
        let mut product = b"widget".to_vec();
        product.resize(32, 0);
        bytes.extend_from_slice(&product);

        let record = sales_codec().decode(&bytes).unwrap();
        assert_eq!(record, sale(7, -1250, "widget"));
        assert_eq!(sales_codec().encode(&record).unwrap(), bytes);
    }

    #[test]
    fn test_big_endian_signed_fields() {
        let layout = RecordLayout::new(
            ByteOrder::Big,
            [("a", FieldType::I16), ("b", FieldType::U16), ("c", FieldType::I8)],
        )
        .unwrap();
        let codec = RecordCodec::new(Arc::new(layout));

        let record = codec.decode(&[0xff, 0xfe, 0x01, 0x02, 0x80]).unwrap();
        assert_eq!(
            record.values(),
            &[
                FieldValue::Signed(-2),
                FieldValue::Unsigned(258),
                FieldValue::Signed(-128)
            ]
        );
    }

    #[test]
    fn test_wrong_length_is_malformed() {
        let err = sales_codec().decode(&[0u8; 55]).unwrap_err();
        assert_eq!(err.kind(), "malformed_record");
    }

    #[test]
    fn test_invalid_utf8_text_is_malformed() {
        let mut bytes = sales_codec().encode(&sale(1, 0, "ok")).unwrap();
        bytes[24] = 0xff;
        bytes[25] = 0xfe;
        let err = sales_codec().decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("product"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_encode_rejects_out_of_range_values() {
        let codec = sales_codec();
        assert!(codec.encode(&sale(u64::from(u32::MAX) + 1, 0, "x")).is_err());
        assert!(codec.encode(&sale(1, 0, &"x".repeat(33))).is_err());
        assert!(codec.encode(&sale(1, 0, "nul\0")).is_err());

        let mut wrong_type = sale(1, 0, "x").into_values();
        wrong_type[3] = FieldValue::Unsigned(5);
        let err = codec.encode(&Record::new(wrong_type)).unwrap_err();
        assert_eq!(err.kind(), "invalid_record");
    }

    #[test]
    fn test_encode_into_leaves_buffer_untouched_on_error() {
        let codec = sales_codec();
        let mut out = vec![1, 2, 3];
        assert!(codec
            .encode_into(&sale(1, 0, &"y".repeat(40)), &mut out)
            .is_err());
        assert_eq!(out, vec![1, 2, 3]);
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            id in any::<u32>(),
            ts in any::<u64>(),
            qty in any::<u32>(),
            cents in any::<i64>(),
            product in "[a-zA-Z0-9 =+@-]{0,32}",
        ) {
            let record = Record::new(vec![
                FieldValue::Unsigned(u64::from(id)),
                FieldValue::Unsigned(ts),
                FieldValue::Unsigned(u64::from(qty)),
                FieldValue::Signed(cents),
                FieldValue::Text(product),
            ]);
            let codec = sales_codec();
            let bytes = codec.encode(&record).unwrap();
            prop_assert_eq!(bytes.len(), 56);
            prop_assert_eq!(codec.decode(&bytes).unwrap(), record);
        }
    }
}
