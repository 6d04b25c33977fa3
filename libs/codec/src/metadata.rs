//! Tabular metadata model and its two wire encodings
//!
//! Native encoding is bincode. The common binary image is big-endian:
//!
//! ```text
//! [table count:i32]
//!   { [name][column count:i32] { [name][kind:u8] }*
//!     [row count:i32] { { [tag:u8][value] }* }* }*
//! ```
//!
//! Strings are `i32` length-prefixed in the client's text encoding.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ensure_remaining, CodecError, Result};
use crate::text::TextEncoding;
use crate::wire::{get_count, get_guid, get_text, put_guid, put_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Boolean,
    Integer,
    Float,
    Text,
    Guid,
    Timestamp,
}

impl ValueKind {
    fn code(self) -> u8 {
        match self {
            Self::Boolean => 1,
            Self::Integer => 2,
            Self::Float => 3,
            Self::Text => 4,
            Self::Guid => 5,
            Self::Timestamp => 6,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => Self::Boolean,
            2 => Self::Integer,
            3 => Self::Float,
            4 => Self::Text,
            5 => Self::Guid,
            6 => Self::Timestamp,
            other => {
                return Err(CodecError::serialization(
                    "metadata image",
                    format!("unknown column kind {other}"),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Guid(Uuid),
    Timestamp(i64),
}

impl MetadataValue {
    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            Self::Guid(id) => Some(*id),
            Self::Text(text) => Uuid::parse_str(text.trim()).ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataColumn {
    pub name: String,
    pub kind: ValueKind,
}

impl MetadataColumn {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataTable {
    pub name: String,
    pub columns: Vec<MetadataColumn>,
    pub rows: Vec<Vec<MetadataValue>>,
}

impl MetadataTable {
    pub fn new(name: impl Into<String>, columns: Vec<MetadataColumn>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Case-insensitive column lookup
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[MetadataValue]) -> bool) {
        self.rows.retain(|row| keep(row));
    }

    /// Copies the table keeping only `columns` (in the given order).
    pub fn project(&self, columns: &[&str]) -> Result<Self> {
        let indexes = columns
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    CodecError::serialization(
                        "metadata",
                        format!("column \"{name}\" does not exist in {}", self.name),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: self.name.clone(),
            columns: indexes.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| indexes.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSet {
    pub tables: Vec<MetadataTable>,
}

impl MetadataSet {
    pub fn table(&self, name: &str) -> Option<&MetadataTable> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn to_native(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CodecError::serialization("bincode", e.to_string()))
    }

    pub fn from_native(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| CodecError::serialization("bincode", e.to_string()))
    }

    pub fn to_binary_image(&self, encoding: TextEncoding) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i32(self.tables.len() as i32);
        for table in &self.tables {
            put_text(&mut buf, encoding, &table.name);
            buf.put_i32(table.columns.len() as i32);
            for column in &table.columns {
                put_text(&mut buf, encoding, &column.name);
                buf.put_u8(column.kind.code());
            }
            buf.put_i32(table.rows.len() as i32);
            for row in &table.rows {
                for value in row {
                    put_value(&mut buf, encoding, value);
                }
            }
        }
        buf.to_vec()
    }

    pub fn from_binary_image(image: &[u8], encoding: TextEncoding) -> Result<Self> {
        let mut buf = image;
        let table_count = get_count(&mut buf, "table count")?;
        let mut tables = Vec::with_capacity(table_count.min(64));
        for _ in 0..table_count {
            let name = get_text(&mut buf, encoding, "table name")?;
            let column_count = get_count(&mut buf, "column count")?;
            let mut columns = Vec::with_capacity(column_count.min(256));
            for _ in 0..column_count {
                let name = get_text(&mut buf, encoding, "column name")?;
                ensure_remaining(buf, 1, "column kind")?;
                columns.push(MetadataColumn::new(name, ValueKind::from_code(buf.get_u8())?));
            }
            let row_count = get_count(&mut buf, "row count")?;
            let mut rows = Vec::with_capacity(row_count.min(4096));
            for _ in 0..row_count {
                let row = (0..column_count)
                    .map(|_| get_value(&mut buf, encoding))
                    .collect::<Result<Vec<_>>>()?;
                rows.push(row);
            }
            tables.push(MetadataTable { name, columns, rows });
        }
        Ok(Self { tables })
    }
}

fn put_value(buf: &mut BytesMut, encoding: TextEncoding, value: &MetadataValue) {
    match value {
        MetadataValue::Null => buf.put_u8(0),
        MetadataValue::Boolean(v) => {
            buf.put_u8(1);
            buf.put_u8(u8::from(*v));
        }
        MetadataValue::Integer(v) => {
            buf.put_u8(2);
            buf.put_i64(*v);
        }
        MetadataValue::Float(v) => {
            buf.put_u8(3);
            buf.put_f64(*v);
        }
        MetadataValue::Text(v) => {
            buf.put_u8(4);
            put_text(buf, encoding, v);
        }
        MetadataValue::Guid(v) => {
            buf.put_u8(5);
            put_guid(buf, v);
        }
        MetadataValue::Timestamp(v) => {
            buf.put_u8(6);
            buf.put_i64(*v);
        }
    }
}

fn get_value(buf: &mut &[u8], encoding: TextEncoding) -> Result<MetadataValue> {
    ensure_remaining(buf, 1, "value tag")?;
    let tag = buf.get_u8();
    Ok(match tag {
        0 => MetadataValue::Null,
        1 => {
            ensure_remaining(buf, 1, "boolean value")?;
            MetadataValue::Boolean(buf.get_u8() != 0)
        }
        2 => {
            ensure_remaining(buf, 8, "integer value")?;
            MetadataValue::Integer(buf.get_i64())
        }
        3 => {
            ensure_remaining(buf, 8, "float value")?;
            MetadataValue::Float(buf.get_f64())
        }
        4 => MetadataValue::Text(get_text(buf, encoding, "text value")?),
        5 => MetadataValue::Guid(get_guid(buf, "guid value")?),
        6 => {
            ensure_remaining(buf, 8, "timestamp value")?;
            MetadataValue::Timestamp(buf.get_i64())
        }
        other => {
            return Err(CodecError::serialization(
                "metadata image",
                format!("unknown value tag {other}"),
            ))
        }
    })
}
