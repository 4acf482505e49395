//! # Change Events
//!
//! Row-level change notifications delivered to listeners.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{RealtimeError, RealtimeResult};

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Row inserted
    Created,
    /// Row updated
    Updated,
    /// Row deleted
    Deleted,
}

impl ChangeKind {
    /// All kinds, in wire order
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Created, ChangeKind::Updated, ChangeKind::Deleted];

    /// Name used by the hosted change feed
    pub fn wire_name(&self) -> &'static str {
        match self {
            ChangeKind::Created => "INSERT",
            ChangeKind::Updated => "UPDATE",
            ChangeKind::Deleted => "DELETE",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            ChangeKind::Created => 0b001,
            ChangeKind::Updated => 0b010,
            ChangeKind::Deleted => 0b100,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for ChangeKind {
    type Err = RealtimeError;

    /// Accepts both the application names and the wire names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" | "insert" => Ok(ChangeKind::Created),
            "updated" | "update" => Ok(ChangeKind::Updated),
            "deleted" | "delete" => Ok(ChangeKind::Deleted),
            other => Err(RealtimeError::InvalidMessage(format!(
                "unknown change kind '{}'",
                other
            ))),
        }
    }
}

/// Set of change kinds a subscriber is interested in.
///
/// An empty set means every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeKinds(u8);

impl ChangeKinds {
    const FULL: u8 = 0b111;

    /// Every kind
    pub fn all() -> Self {
        Self(Self::FULL)
    }

    /// A single kind
    pub fn only(kind: ChangeKind) -> Self {
        Self(kind.bit())
    }

    /// Add a kind
    pub fn with(self, kind: ChangeKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Whether `kind` is in the set
    pub fn contains(&self, kind: ChangeKind) -> bool {
        self.is_all() || self.0 & kind.bit() != 0
    }

    /// Whether the set admits every kind
    pub fn is_all(&self) -> bool {
        self.0 == 0 || self.0 == Self::FULL
    }

    /// Whether every kind in `other` is also in `self`
    pub fn covers(&self, other: &ChangeKinds) -> bool {
        self.is_all() || (!other.is_all() && other.0 & !self.0 == 0)
    }

    /// Kinds in the set, in wire order
    pub fn iter(&self) -> impl Iterator<Item = ChangeKind> + '_ {
        ChangeKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }

    /// Parse a comma separated list such as `created,updated`
    pub fn parse_list(s: &str) -> RealtimeResult<Self> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(ChangeKind::from_str)
            .collect()
    }
}

impl FromIterator<ChangeKind> for ChangeKinds {
    fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
        iter.into_iter().fold(ChangeKinds::default(), |acc, k| acc.with(k))
    }
}

impl From<ChangeKind> for ChangeKinds {
    fn from(kind: ChangeKind) -> Self {
        ChangeKinds::only(kind)
    }
}

impl fmt::Display for ChangeKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return write!(f, "*");
        }
        let names: Vec<String> = self.iter().map(|k| k.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

/// A row as delivered by the change feed
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowPayload(Value);

impl RowPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Raw JSON value
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Field lookup
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// String field lookup
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Primary key, whether stored as a string or a number
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl From<Value> for RowPayload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// A row-level change for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,

    pub table: String,

    /// The new row for created/updated, the removed row for deleted
    pub row: RowPayload,

    /// Previous row for updated, when the feed sends it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<RowPayload>,

    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create a created event
    pub fn created(table: impl Into<String>, row: Value) -> Self {
        Self {
            kind: ChangeKind::Created,
            table: table.into(),
            row: RowPayload(row),
            old_row: None,
            commit_timestamp: Utc::now(),
        }
    }

    /// Create an updated event
    pub fn updated(table: impl Into<String>, row: Value, old_row: Option<Value>) -> Self {
        Self {
            kind: ChangeKind::Updated,
            table: table.into(),
            row: RowPayload(row),
            old_row: old_row.map(RowPayload),
            commit_timestamp: Utc::now(),
        }
    }

    /// Create a deleted event
    pub fn deleted(table: impl Into<String>, row: Value) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            table: table.into(),
            row: RowPayload(row),
            old_row: None,
            commit_timestamp: Utc::now(),
        }
    }

    /// Build an event from the `data` object of a `postgres_changes` message:
    /// `{ type, table, record, old_record, commit_timestamp }`.
    pub fn from_change_data(data: &Value) -> RealtimeResult<Self> {
        let kind_name = data
            .get("type")
            .or_else(|| data.get("eventType"))
            .and_then(Value::as_str)
            .ok_or_else(|| RealtimeError::InvalidMessage("change without type".into()))?;
        let kind = ChangeKind::from_str(kind_name)?;

        let table = data
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| RealtimeError::InvalidMessage("change without table".into()))?
            .to_string();

        let record = data.get("record").filter(|v| !is_empty_row(v)).cloned();
        let old_record = data.get("old_record").filter(|v| !is_empty_row(v)).cloned();

        let (row, old_row) = match kind {
            ChangeKind::Created => (record.unwrap_or(Value::Null), None),
            ChangeKind::Updated => (record.unwrap_or(Value::Null), old_record),
            ChangeKind::Deleted => (old_record.unwrap_or(Value::Null), None),
        };

        let commit_timestamp = data
            .get("commit_timestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            kind,
            table,
            row: RowPayload(row),
            old_row: old_row.map(RowPayload),
            commit_timestamp,
        })
    }
}

fn is_empty_row(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
