//! Metadata query source
//!
//! MetaDataRefresh runs a list of select expressions against a
//! [`MetadataSource`]. The built-in [`InMemoryMetadata`] answers them from the
//! security catalog, supporting `SELECT <cols|*> FROM <table>` with an optional
//! `WHERE` made of `AND`-joined `=`, `<>`, `IS NULL` and `IS NOT NULL` terms.

use async_trait::async_trait;
use gateway_codec::{MetadataColumn, MetadataTable, MetadataValue, ValueKind};
use regex::Regex;

use crate::catalog::CatalogHandle;
use crate::error::{PublisherError, Result};

/// Tabular metadata provider
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn query(&self, expression: &str) -> Result<MetadataTable>;
}

fn pattern(source: &str) -> Result<Regex> {
    Regex::new(source).map_err(|e| PublisherError::metadata(format!("invalid pattern: {e}")))
}

/// Table named by the `FROM` clause of `expression`.
pub fn table_name(expression: &str) -> Option<String> {
    pattern(r"(?i)FROM\s+(\w+)")
        .ok()?
        .captures(expression)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Equals(String, String),
    NotEquals(String, String),
    IsNull(String),
    IsNotNull(String),
}

#[derive(Debug, Clone, PartialEq)]
struct SelectQuery {
    columns: Option<Vec<String>>,
    table: String,
    conditions: Vec<Condition>,
}

fn parse_select(expression: &str) -> Result<SelectQuery> {
    let select = pattern(r"(?is)^\s*SELECT\s+(.+?)\s+FROM\s+(\w+)(?:\s+WHERE\s+(.+?))?\s*;?\s*$")?;
    let captures = select
        .captures(expression)
        .ok_or_else(|| PublisherError::metadata(format!("unsupported expression \"{expression}\"")))?;

    let columns = captures[1].trim();
    let columns = if columns == "*" {
        None
    } else {
        Some(
            columns
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        )
    };

    let conditions = match captures.get(3) {
        Some(clause) => parse_conditions(clause.as_str())?,
        None => Vec::new(),
    };

    Ok(SelectQuery {
        columns,
        table: captures[2].to_string(),
        conditions,
    })
}

fn parse_conditions(clause: &str) -> Result<Vec<Condition>> {
    let and = pattern(r"(?i)\s+AND\s+")?;
    let null_test = pattern(r"(?i)^(\w+)\s+IS\s+(NOT\s+)?NULL$")?;
    let comparison = pattern(r"^(\w+)\s*(=|<>|!=)\s*(?:'([^']*)'|(\S+))$")?;

    and.split(clause.trim())
        .map(|term| {
            let term = term.trim();
            if let Some(c) = null_test.captures(term) {
                let column = c[1].to_string();
                return Ok(if c.get(2).is_some() {
                    Condition::IsNotNull(column)
                } else {
                    Condition::IsNull(column)
                });
            }
            if let Some(c) = comparison.captures(term) {
                let column = c[1].to_string();
                let value = c
                    .get(3)
                    .or_else(|| c.get(4))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                return Ok(if &c[2] == "=" {
                    Condition::Equals(column, value)
                } else {
                    Condition::NotEquals(column, value)
                });
            }
            Err(PublisherError::metadata(format!("unsupported filter \"{term}\"")))
        })
        .collect()
}

fn cell_text(value: &MetadataValue) -> Option<String> {
    match value {
        MetadataValue::Null => None,
        MetadataValue::Boolean(b) => Some(if *b { "1" } else { "0" }.to_string()),
        MetadataValue::Integer(i) => Some(i.to_string()),
        MetadataValue::Float(f) => Some(f.to_string()),
        MetadataValue::Text(s) => Some(s.clone()),
        MetadataValue::Guid(g) => Some(g.to_string()),
        MetadataValue::Timestamp(t) => Some(t.to_string()),
    }
}

fn matches(value: &MetadataValue, expected: &str) -> bool {
    match value {
        MetadataValue::Boolean(b) => {
            let expected = expected.to_ascii_lowercase();
            (expected == "true" || expected == "1") == *b
        }
        other => cell_text(other).is_some_and(|text| text.eq_ignore_ascii_case(expected)),
    }
}

fn apply(mut table: MetadataTable, query: &SelectQuery) -> Result<MetadataTable> {
    for condition in &query.conditions {
        let column = match condition {
            Condition::Equals(c, _) | Condition::NotEquals(c, _) | Condition::IsNull(c) | Condition::IsNotNull(c) => c,
        };
        let index = table.column_index(column).ok_or_else(|| {
            PublisherError::metadata(format!("column \"{column}\" does not exist in {}", table.name))
        })?;
        table.retain_rows(|row| match condition {
            Condition::Equals(_, v) => matches(&row[index], v),
            Condition::NotEquals(_, v) => !matches(&row[index], v),
            Condition::IsNull(_) => row[index] == MetadataValue::Null,
            Condition::IsNotNull(_) => row[index] != MetadataValue::Null,
        });
    }

    match &query.columns {
        Some(columns) => {
            let names: Vec<&str> = columns.iter().map(String::as_str).collect();
            Ok(table.project(&names)?)
        }
        None => Ok(table),
    }
}

fn text(value: &str) -> MetadataValue {
    if value.is_empty() {
        MetadataValue::Null
    } else {
        MetadataValue::Text(value.to_string())
    }
}

/// Metadata served from the current security catalog
#[derive(Debug, Clone)]
pub struct InMemoryMetadata {
    catalog: CatalogHandle,
}

impl InMemoryMetadata {
    pub fn new(catalog: CatalogHandle) -> Self {
        Self { catalog }
    }

    fn table(&self, name: &str) -> Result<MetadataTable> {
        let catalog = self.catalog.current();
        let table = match name.to_ascii_lowercase().as_str() {
            "activemeasurements" => {
                let mut table = MetadataTable::new(
                    "ActiveMeasurements",
                    vec![
                        MetadataColumn::new("SourceNodeID", ValueKind::Guid),
                        MetadataColumn::new("ID", ValueKind::Text),
                        MetadataColumn::new("SignalID", ValueKind::Guid),
                        MetadataColumn::new("PointTag", ValueKind::Text),
                        MetadataColumn::new("Device", ValueKind::Text),
                        MetadataColumn::new("SignalType", ValueKind::Text),
                        MetadataColumn::new("Description", ValueKind::Text),
                    ],
                );
                table.rows = catalog
                    .measurements
                    .iter()
                    .filter(|m| m.enabled)
                    .map(|m| {
                        vec![
                            MetadataValue::Guid(m.node_id),
                            MetadataValue::Text(m.key()),
                            MetadataValue::Guid(m.signal_id),
                            text(&m.point_tag),
                            text(&m.device),
                            text(&m.signal_type),
                            text(&m.description),
                        ]
                    })
                    .collect();
                table
            }
            "measurementdetail" => {
                let mut table = MetadataTable::new(
                    "MeasurementDetail",
                    vec![
                        MetadataColumn::new("NodeID", ValueKind::Guid),
                        MetadataColumn::new("DeviceAcronym", ValueKind::Text),
                        MetadataColumn::new("ID", ValueKind::Text),
                        MetadataColumn::new("SignalID", ValueKind::Guid),
                        MetadataColumn::new("PointTag", ValueKind::Text),
                        MetadataColumn::new("SignalAcronym", ValueKind::Text),
                        MetadataColumn::new("Description", ValueKind::Text),
                        MetadataColumn::new("Internal", ValueKind::Boolean),
                        MetadataColumn::new("Enabled", ValueKind::Boolean),
                    ],
                );
                table.rows = catalog
                    .measurements
                    .iter()
                    .map(|m| {
                        vec![
                            MetadataValue::Guid(m.node_id),
                            text(&m.device),
                            MetadataValue::Text(m.key()),
                            MetadataValue::Guid(m.signal_id),
                            text(&m.point_tag),
                            text(&m.signal_type),
                            text(&m.description),
                            MetadataValue::Boolean(m.internal),
                            MetadataValue::Boolean(m.enabled),
                        ]
                    })
                    .collect();
                table
            }
            "devicedetail" => {
                let mut table = MetadataTable::new(
                    "DeviceDetail",
                    vec![
                        MetadataColumn::new("NodeID", ValueKind::Guid),
                        MetadataColumn::new("UniqueID", ValueKind::Guid),
                        MetadataColumn::new("Acronym", ValueKind::Text),
                        MetadataColumn::new("Name", ValueKind::Text),
                        MetadataColumn::new("ProtocolName", ValueKind::Text),
                        MetadataColumn::new("FramesPerSecond", ValueKind::Integer),
                        MetadataColumn::new("Enabled", ValueKind::Boolean),
                    ],
                );
                table.rows = catalog
                    .devices
                    .iter()
                    .map(|d| {
                        vec![
                            MetadataValue::Guid(d.node_id),
                            MetadataValue::Guid(d.unique_id),
                            MetadataValue::Text(d.acronym.clone()),
                            text(&d.name),
                            text(&d.protocol),
                            MetadataValue::Integer(d.frames_per_second),
                            MetadataValue::Boolean(d.enabled),
                        ]
                    })
                    .collect();
                table
            }
            "phasordetail" => {
                let mut table = MetadataTable::new(
                    "PhasorDetail",
                    vec![
                        MetadataColumn::new("DeviceAcronym", ValueKind::Text),
                        MetadataColumn::new("Label", ValueKind::Text),
                        MetadataColumn::new("Type", ValueKind::Text),
                        MetadataColumn::new("Phase", ValueKind::Text),
                        MetadataColumn::new("SourceIndex", ValueKind::Integer),
                    ],
                );
                table.rows = catalog
                    .phasors
                    .iter()
                    .map(|p| {
                        vec![
                            MetadataValue::Text(p.device.clone()),
                            text(&p.label),
                            text(&p.phasor_type),
                            text(&p.phase),
                            MetadataValue::Integer(p.source_index),
                        ]
                    })
                    .collect();
                table
            }
            _ => return Err(PublisherError::metadata(format!("unknown table \"{name}\""))),
        };
        Ok(table)
    }
}

#[async_trait]
impl MetadataSource for InMemoryMetadata {
    async fn query(&self, expression: &str) -> Result<MetadataTable> {
        let query = parse_select(expression)?;
        let table = self.table(&query.table)?;
        apply(table, &query)
    }
}
