use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Column name to nullable textual value, as captured by the source triggers.
pub type ColumnMap = BTreeMap<String, Option<String>>;

/// Column list shared by every query that materializes a [`DataRow`].
pub const DATA_COLUMNS: &str = "data_id, table_name, event_type, row_data, old_data, channel_id, \
                                transaction_id, source_node_id, node_list, create_time";

/// Index of `channel_id` within [`DATA_COLUMNS`].
pub const CHANNEL_COLUMN_INDEX: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Insert,
    Update,
    Delete,
    Sql,
    Create,
    Reload,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "I",
            EventType::Update => "U",
            EventType::Delete => "D",
            EventType::Sql => "S",
            EventType::Create => "C",
            EventType::Reload => "R",
        }
    }

    pub fn from_code(value: &str) -> Result<Self> {
        match value {
            "I" => Ok(EventType::Insert),
            "U" => Ok(EventType::Update),
            "D" => Ok(EventType::Delete),
            "S" => Ok(EventType::Sql),
            "C" => Ok(EventType::Create),
            "R" => Ok(EventType::Reload),
            other => Err(anyhow!("unknown event type: {other}")),
        }
    }
}

/// A change row about to be appended to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDataRow {
    pub table_name: String,
    pub event_type: EventType,
    pub row_data: ColumnMap,
    pub old_data: Option<ColumnMap>,
    pub channel_id: String,
    pub transaction_id: Option<String>,
    pub source_node_id: Option<String>,
    pub node_list: Option<String>,
}

impl NewDataRow {
    pub fn new(table_name: &str, event_type: EventType, channel_id: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            event_type,
            row_data: ColumnMap::new(),
            old_data: None,
            channel_id: channel_id.to_string(),
            transaction_id: None,
            source_node_id: None,
            node_list: None,
        }
    }

    pub fn with_column(mut self, name: &str, value: Option<&str>) -> Self {
        self.row_data
            .insert(name.to_string(), value.map(str::to_string));
        self
    }

    pub fn with_old_column(mut self, name: &str, value: Option<&str>) -> Self {
        self.old_data
            .get_or_insert_with(ColumnMap::new)
            .insert(name.to_string(), value.map(str::to_string));
        self
    }

    pub fn with_transaction(mut self, transaction_id: &str) -> Self {
        self.transaction_id = Some(transaction_id.to_string());
        self
    }

    pub fn with_source_node(mut self, node_id: &str) -> Self {
        self.source_node_id = Some(node_id.to_string());
        self
    }

    pub fn with_node_list(mut self, node_list: &str) -> Self {
        self.node_list = Some(node_list.to_string());
        self
    }
}

/// One captured mutation, read back from the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub data_id: i64,
    pub table_name: String,
    pub event_type: EventType,
    pub row_data: ColumnMap,
    pub old_data: Option<ColumnMap>,
    pub channel_id: String,
    pub transaction_id: Option<String>,
    pub source_node_id: Option<String>,
    pub node_list: Option<String>,
    pub create_time: DateTime<Utc>,
}

impl DataRow {
    /// Materializes a row selected with [`DATA_COLUMNS`].
    pub fn from_sql_row(row: &rusqlite::Row<'_>) -> Result<Self> {
        let data_id: i64 = row.get(0)?;
        let event_code: String = row.get(2)?;
        let row_data: Option<String> = row.get(3)?;
        let old_data: Option<String> = row.get(4)?;
        Ok(Self {
            data_id,
            table_name: row.get(1)?,
            event_type: EventType::from_code(&event_code)?,
            row_data: match row_data {
                Some(text) => parse_columns(&text)
                    .with_context(|| format!("invalid row_data for data_id {data_id}"))?,
                None => ColumnMap::new(),
            },
            old_data: old_data
                .map(|text| parse_columns(&text))
                .transpose()
                .with_context(|| format!("invalid old_data for data_id {data_id}"))?,
            channel_id: row.get(5)?,
            transaction_id: row.get(6)?,
            source_node_id: row.get(7)?,
            node_list: row.get(8)?,
            create_time: row.get(9)?,
        })
    }

    /// Approximate serialized size: the summed length of every captured value.
    pub fn estimated_bytes(&self) -> u64 {
        let sum = |columns: &ColumnMap| -> u64 {
            columns
                .values()
                .map(|value| value.as_ref().map_or(0, |v| v.len() as u64))
                .sum()
        };
        sum(&self.row_data) + self.old_data.as_ref().map_or(0, sum)
    }

    /// Target node ids carried by reload rows.
    pub fn target_nodes(&self) -> Vec<String> {
        self.node_list
            .as_deref()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parses a JSON object of captured values. Non-string scalars keep their JSON text.
pub fn parse_columns(text: &str) -> Result<ColumnMap> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(map) = value else {
        return Err(anyhow!("captured columns must be a JSON object"));
    };
    Ok(map
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::Null => None,
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            };
            (name, value)
        })
        .collect())
}

pub fn encode_columns(columns: &ColumnMap) -> String {
    // A map of strings and nulls always serializes.
    serde_json::to_string(columns).unwrap_or_else(|_| "{}".to_string())
}
