//! Fixed-width record layouts
//!
//! A [`RecordLayout`] is an ordered list of named, typed fields packed
//! back to back with no padding. It is built once from configuration,
//! validated, and then shared read-only by every worker of a job.
//!
//! The compact struct-format notation (`<IQIq32s`) is accepted as a
//! serialisation of a layout only; at runtime everything works on the
//! typed [`FieldType`] list.

use hetl_common::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Scalar type of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// UTF-8 text, NUL padded to a fixed width
    Text(usize),
    /// Raw bytes of a fixed width
    Bytes(usize),
}

impl FieldType {
    /// Width of the field in bytes
    pub fn width(&self) -> usize {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 | FieldType::I16 => 2,
            FieldType::U32 | FieldType::I32 => 4,
            FieldType::U64 | FieldType::I64 => 8,
            FieldType::Text(n) | FieldType::Bytes(n) => *n,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, FieldType::Text(_) | FieldType::Bytes(_))
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            FieldType::I8 | FieldType::I16 | FieldType::I32 | FieldType::I64
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::U8 => write!(f, "u8"),
            FieldType::U16 => write!(f, "u16"),
            FieldType::U32 => write!(f, "u32"),
            FieldType::U64 => write!(f, "u64"),
            FieldType::I8 => write!(f, "i8"),
            FieldType::I16 => write!(f, "i16"),
            FieldType::I32 => write!(f, "i32"),
            FieldType::I64 => write!(f, "i64"),
            FieldType::Text(n) => write!(f, "text({n})"),
            FieldType::Bytes(n) => write!(f, "bytes({n})"),
        }
    }
}

impl FromStr for FieldType {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let sized = |prefix: &str| -> Option<Result<usize>> {
            let inner = s.strip_prefix(prefix)?.strip_prefix('(')?.strip_suffix(')')?;
            Some(
                inner
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| EtlError::config(format!("Invalid field width in '{s}'"))),
            )
        };

        if let Some(width) = sized("text") {
            return Ok(FieldType::Text(width?));
        }
        if let Some(width) = sized("bytes") {
            return Ok(FieldType::Bytes(width?));
        }

        match s.as_str() {
            "u8" => Ok(FieldType::U8),
            "u16" => Ok(FieldType::U16),
            "u32" => Ok(FieldType::U32),
            "u64" => Ok(FieldType::U64),
            "i8" => Ok(FieldType::I8),
            "i16" => Ok(FieldType::I16),
            "i32" => Ok(FieldType::I32),
            "i64" => Ok(FieldType::I64),
            other => Err(EtlError::config(format!(
                "Unknown field type '{other}' (expected u8..u64, i8..i64, text(N) or bytes(N))"
            ))),
        }
    }
}

impl TryFrom<String> for FieldType {
    type Error = EtlError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.to_string()
    }
}

/// Byte order of integer fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => write!(f, "little"),
            ByteOrder::Big => write!(f, "big"),
        }
    }
}

/// One field of a layout with its resolved byte offset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub offset: usize,
}

impl FieldDef {
    pub fn width(&self) -> usize {
        self.field_type.width()
    }

    /// Byte range of the field inside a record
    pub fn span(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.width()
    }
}

/// Validated, immutable record layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordLayout {
    fields: Vec<FieldDef>,
    byte_order: ByteOrder,
    record_size: usize,
}

impl RecordLayout {
    /// Build a layout from `(name, type)` pairs in record order
    ///
    /// Fails when the list is empty, a name is blank or repeated, or a
    /// text/bytes field has zero width.
    pub fn new<I, S>(byte_order: ByteOrder, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        let mut defs = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = 0usize;

        for (name, field_type) in fields {
            let name = name.into();
            if name.trim().is_empty() {
                return Err(EtlError::config("Field names must not be empty"));
            }
            if !seen.insert(name.clone()) {
                return Err(EtlError::config(format!("Duplicate field name '{name}'")));
            }
            if field_type.width() == 0 {
                return Err(EtlError::config(format!(
                    "Field '{name}' has zero width"
                )));
            }
            let end = offset.checked_add(field_type.width()).ok_or_else(|| {
                EtlError::config(format!("Record layout overflows at field '{name}'"))
            })?;
            defs.push(FieldDef {
                name,
                field_type,
                offset,
            });
            offset = end;
        }

        if defs.is_empty() {
            return Err(EtlError::config("Record layout has no fields"));
        }

        Ok(Self {
            fields: defs,
            byte_order,
            record_size: offset,
        })
    }

    /// Parse a compact struct-format string such as `<IQIq32s`
    ///
    /// `names` supplies one name per field, in order.
    pub fn from_format<S: AsRef<str>>(format: &str, names: &[S]) -> Result<Self> {
        let mut chars = format.trim().chars().peekable();

        let byte_order = match chars.peek() {
            Some('<') | Some('=') => {
                chars.next();
                ByteOrder::Little
            }
            Some('>') | Some('!') => {
                chars.next();
                ByteOrder::Big
            }
            _ => ByteOrder::Little,
        };

        let mut types = Vec::new();
        let mut count = String::new();
        for c in chars {
            if c.is_ascii_digit() {
                count.push(c);
                continue;
            }
            let repeat = if count.is_empty() {
                None
            } else {
                Some(count.parse::<usize>().map_err(|_| {
                    EtlError::config(format!("Invalid count '{count}' in format '{format}'"))
                })?)
            };
            count.clear();

            let scalar = match c {
                'B' => FieldType::U8,
                'H' => FieldType::U16,
                'I' | 'L' => FieldType::U32,
                'Q' => FieldType::U64,
                'b' => FieldType::I8,
                'h' => FieldType::I16,
                'i' | 'l' => FieldType::I32,
                'q' => FieldType::I64,
                's' => {
                    types.push(FieldType::Text(repeat.unwrap_or(1)));
                    continue;
                }
                c if c.is_whitespace() => continue,
                other => {
                    return Err(EtlError::config(format!(
                        "Unsupported format character '{other}' in '{format}'"
                    )))
                }
            };
            types.extend(std::iter::repeat_n(scalar, repeat.unwrap_or(1)));
        }

        if !count.is_empty() {
            return Err(EtlError::config(format!(
                "Format '{format}' ends with a dangling count"
            )));
        }
        if types.len() != names.len() {
            return Err(EtlError::config(format!(
                "Format '{format}' describes {} fields but {} names were given",
                types.len(),
                names.len()
            )));
        }

        Self::new(
            byte_order,
            names
                .iter()
                .map(|n| n.as_ref().to_string())
                .zip(types),
        )
    }

    /// Compact struct-format string for this layout
    ///
    /// Bytes fields have no struct-format equivalent and are rejected.
    pub fn to_format(&self) -> Result<String> {
        let mut out = String::from(match self.byte_order {
            ByteOrder::Little => "<",
            ByteOrder::Big => ">",
        });
        for field in &self.fields {
            match field.field_type {
                FieldType::U8 => out.push('B'),
                FieldType::U16 => out.push('H'),
                FieldType::U32 => out.push('I'),
                FieldType::U64 => out.push('Q'),
                FieldType::I8 => out.push('b'),
                FieldType::I16 => out.push('h'),
                FieldType::I32 => out.push('i'),
                FieldType::I64 => out.push('q'),
                FieldType::Text(n) => out.push_str(&format!("{n}s")),
                FieldType::Bytes(_) => {
                    return Err(EtlError::config(format!(
                        "Field '{}' is raw bytes and has no struct-format code",
                        field.name
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Layout of the sales feed this tool was first built for:
    /// `id:u32, timestamp:u64, quantity:u32, value_cents:i64, product:text(32)`
    pub fn sales_default() -> Self {
        Self {
            fields: vec![
                FieldDef {
                    name: "id".into(),
                    field_type: FieldType::U32,
                    offset: 0,
                },
                FieldDef {
                    name: "timestamp".into(),
                    field_type: FieldType::U64,
                    offset: 4,
                },
                FieldDef {
                    name: "quantity".into(),
                    field_type: FieldType::U32,
                    offset: 12,
                },
                FieldDef {
                    name: "value_cents".into(),
                    field_type: FieldType::I64,
                    offset: 16,
                },
                FieldDef {
                    name: "product".into(),
                    field_type: FieldType::Text(32),
                    offset: 24,
                },
            ],
            byte_order: ByteOrder::Little,
            record_size: 56,
        }
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position and definition of a field by name
    pub fn field(&self, name: &str) -> Option<(usize, &FieldDef)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

impl fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "record_size: {} bytes, byte order: {}",
            self.record_size, self.byte_order
        )?;
        for field in &self.fields {
            writeln!(
                f,
                "  {:>5}  {:<24} {}",
                field.offset, field.name, field.field_type
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_format_sales_schema() {
        let layout = RecordLayout::from_format(
            "<IQIq32s",
            &["id", "timestamp", "quantity", "value_cents", "product"],
        )
        .unwrap();

        assert_eq!(layout.record_size(), 56);
        assert_eq!(layout.byte_order(), ByteOrder::Little);
        assert_eq!(layout, RecordLayout::sales_default());

        let (idx, product) = layout.field("product").unwrap();
        assert_eq!(idx, 4);
        assert_eq!(product.offset, 24);
        assert_eq!(product.field_type, FieldType::Text(32));
    }

    #[test]
    fn test_to_format_round_trips() {
        let layout = RecordLayout::from_format(">hB10sQ", &["a", "b", "c", "d"]).unwrap();
        assert_eq!(layout.to_format().unwrap(), ">hB10sQ");
        assert_eq!(layout.record_size(), 2 + 1 + 10 + 8);
    }

    #[test]
    fn test_repeat_counts_expand_scalars() {
        let layout = RecordLayout::from_format("<3I", &["x", "y", "z"]).unwrap();
        assert_eq!(layout.len(), 3);
        assert_eq!(layout.record_size(), 12);
    }

    #[test]
    fn test_name_count_mismatch_is_config_error() {
        let err = RecordLayout::from_format("<IQ", &["id"]).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn test_unsupported_format_character() {
        let err = RecordLayout::from_format("<If", &["id", "ratio"]).unwrap_err();
        assert!(err.to_string().contains("'f'"));
    }

    #[test]
    fn test_validation_rejects_bad_layouts() {
        let empty: Vec<(String, FieldType)> = vec![];
        assert!(RecordLayout::new(ByteOrder::Little, empty).is_err());
        assert!(RecordLayout::new(
            ByteOrder::Little,
            [("a", FieldType::U8), ("a", FieldType::U16)]
        )
        .is_err());
        assert!(RecordLayout::new(ByteOrder::Little, [("t", FieldType::Text(0))]).is_err());
        assert!(RecordLayout::new(ByteOrder::Little, [(" ", FieldType::U8)]).is_err());
    }

    #[test]
    fn test_oversized_layout_is_rejected() {
        let err = RecordLayout::new(
            ByteOrder::Little,
            [("id", FieldType::U64), ("blob", FieldType::Text(usize::MAX))],
        )
        .unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(err.to_string().contains("blob"));
    }

    #[test]
    fn test_bytes_field_has_no_format_code() {
        let layout =
            RecordLayout::new(ByteOrder::Little, [("id", FieldType::U32), ("raw", FieldType::Bytes(4))])
                .unwrap();
        assert!(layout.to_format().is_err());
    }

    #[test]
    fn test_field_type_parsing() {
        assert_eq!("u32".parse::<FieldType>().unwrap(), FieldType::U32);
        assert_eq!("I64".parse::<FieldType>().unwrap(), FieldType::I64);
        assert_eq!("text(16)".parse::<FieldType>().unwrap(), FieldType::Text(16));
        assert_eq!("bytes( 8 )".parse::<FieldType>().unwrap(), FieldType::Bytes(8));
        assert!("float".parse::<FieldType>().is_err());
        assert!("text(x)".parse::<FieldType>().is_err());
        assert_eq!(FieldType::Text(32).to_string(), "text(32)");
    }
}
