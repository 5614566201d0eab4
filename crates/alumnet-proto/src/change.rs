//! Change records delivered on named subscriptions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

impl ChangeKind {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ProtoError::Validation(format!("unknown change kind: {s}"))),
        }
    }
}

/// One row change. The row contents are opaque to the realtime layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Insert, update or delete.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Schema of the changed table.
    pub schema: String,
    /// Changed table.
    pub table: String,
    /// When the backend committed the change.
    pub commit_timestamp: DateTime<Utc>,
    /// New row (null for deletes).
    #[serde(default)]
    pub record: Value,
    /// Previous row, when the backend publishes it.
    #[serde(default)]
    pub old_record: Value,
}

impl ChangeRecord {
    /// Build a record stamped with the current time.
    #[must_use]
    pub fn new(
        kind: ChangeKind,
        schema: impl Into<String>,
        table: impl Into<String>,
        record: Value,
    ) -> Self {
        Self {
            kind,
            schema: schema.into(),
            table: table.into(),
            commit_timestamp: Utc::now(),
            record,
            old_record: Value::Null,
        }
    }

    /// Attach the previous row.
    #[must_use]
    pub fn with_old_record(mut self, old: Value) -> Self {
        self.old_record = old;
        self
    }
}
