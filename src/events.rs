//! # Change event types
//!
//! A [`ChangeEvent`] is produced by the generated trigger function once per
//! affected row and delivered over `pg_notify` as JSON text:
//!
//! ```json
//! {"operation": "INSERT", "timestamp": "2024-05-01T12:00:00.123Z", "data": {"id": 53}}
//! ```
//!
//! That shape is the wire contract with any existing consumer, so the serde
//! representation here must not drift from it.
//!
//! ## Usage
//!
//! ```rust
//! use row_notify::events::{ChangeEvent, Operation};
//!
//! let payload = r#"{"operation":"DELETE","timestamp":"2024-05-01T12:00:00.123Z","data":{"id":7}}"#;
//! let event: ChangeEvent = serde_json::from_str(payload).unwrap();
//!
//! assert_eq!(event.operation, Operation::Delete);
//! assert_eq!(event.get("id"), Some(&serde_json::json!(7)));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RowNotifyError};

/// Row-level write operation that fired the trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// All operations in canonical trigger-clause order
    pub const ALL: [Operation; 3] = [Operation::Insert, Operation::Update, Operation::Delete];

    /// SQL keyword for this operation (also the value of `TG_OP`)
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Operation {
    type Err = RowNotifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(RowNotifyError::config(format!("Unknown operation: {other}"))),
        }
    }
}

/// Duplicate-free subset of {INSERT, UPDATE, DELETE}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationSet {
    insert: bool,
    update: bool,
    delete: bool,
}

impl OperationSet {
    /// Every operation
    pub fn all() -> Self {
        Self {
            insert: true,
            update: true,
            delete: true,
        }
    }

    /// No operations; rejected by validation but useful as a builder seed
    pub fn empty() -> Self {
        Self {
            insert: false,
            update: false,
            delete: false,
        }
    }

    pub fn with(mut self, operation: Operation) -> Self {
        match operation {
            Operation::Insert => self.insert = true,
            Operation::Update => self.update = true,
            Operation::Delete => self.delete = true,
        }
        self
    }

    pub fn contains(&self, operation: Operation) -> bool {
        match operation {
            Operation::Insert => self.insert,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.insert || self.update || self.delete)
    }

    /// Operations in canonical order
    pub fn iter(&self) -> impl Iterator<Item = Operation> + '_ {
        Operation::ALL
            .into_iter()
            .filter(move |operation| self.contains(*operation))
    }

    /// Trigger event clause, e.g. `INSERT OR UPDATE`
    pub fn to_trigger_clause(&self) -> String {
        self.iter()
            .map(|operation| operation.as_sql())
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

impl Default for OperationSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<Operation> for OperationSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), OperationSet::with)
    }
}

impl fmt::Display for OperationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_trigger_clause())
    }
}

/// One row change as emitted by the trigger function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Operation that fired the trigger
    pub operation: Operation,
    /// ISO-8601 UTC timestamp with millisecond precision and a trailing `Z`
    pub timestamp: String,
    /// Row image: the prior row for DELETE, otherwise the (possibly projected) new row
    pub data: Map<String, Value>,
}

impl ChangeEvent {
    /// Decode a raw notification payload
    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Parse the timestamp into a `DateTime<Utc>`
    pub fn timestamp_utc(&self) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| RowNotifyError::Generic(anyhow::anyhow!("Invalid event timestamp: {e}")))
    }

    /// Value of a single field in the row image
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}
