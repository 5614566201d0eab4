//! Subscription filters.
//!
//! A [`FilterSpec`] names the resource a feature wants change notifications
//! for (schema + table), which change kinds it cares about, and an optional
//! row filter in the backend's `column=op.value` notation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::change::ChangeKind;
use crate::error::ProtoError;

/// Schema used when a filter does not name one.
pub const DEFAULT_SCHEMA: &str = "public";

/// Which change kinds a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventFilter {
    /// Every insert, update and delete.
    #[default]
    All,
    /// A single change kind.
    Only(ChangeKind),
}

impl EventFilter {
    /// Wire representation (`*`, `INSERT`, `UPDATE`, `DELETE`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::All => "*",
            Self::Only(kind) => kind.as_str(),
        }
    }

    /// Whether a change of `kind` passes this filter.
    #[must_use]
    pub fn accepts(&self, kind: ChangeKind) -> bool {
        match self {
            Self::All => true,
            Self::Only(only) => *only == kind,
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventFilter {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "*" | "all" | "ALL" => Ok(Self::All),
            other => other.parse::<ChangeKind>().map(Self::Only),
        }
    }
}

impl TryFrom<String> for EventFilter {
    type Error = ProtoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventFilter> for String {
    fn from(value: EventFilter) -> Self {
        value.as_str().to_string()
    }
}

/// Comparison operator of a [`RowFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Member of a parenthesised, comma separated list.
    In,
}

impl FilterOp {
    /// Operator keyword as written in a row filter.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::In => "in",
        }
    }
}

impl FromStr for FilterOp {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "in" => Ok(Self::In),
            other => Err(ProtoError::UnknownOperator(other.to_string())),
        }
    }
}

/// A single-column row filter, e.g. `user_id=eq.42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RowFilter {
    /// Column the filter applies to.
    pub column: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Right-hand side, verbatim.
    pub value: String,
}

impl RowFilter {
    /// Create a row filter, validating the column and value.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is not a plain identifier or the value
    /// is empty.
    pub fn new(
        column: impl Into<String>,
        op: FilterOp,
        value: impl Into<String>,
    ) -> Result<Self, ProtoError> {
        let filter = Self {
            column: column.into(),
            op,
            value: value.into(),
        };
        filter.validate()?;
        Ok(filter)
    }

    /// Shorthand for an equality filter.
    ///
    /// # Errors
    ///
    /// Same as [`RowFilter::new`].
    pub fn eq(column: impl Into<String>, value: impl fmt::Display) -> Result<Self, ProtoError> {
        Self::new(column, FilterOp::Eq, value.to_string())
    }

    fn validate(&self) -> Result<(), ProtoError> {
        validate_identifier("column", &self.column)?;
        if self.value.is_empty() {
            return Err(ProtoError::Validation(format!(
                "row filter on '{}' has an empty value",
                self.column
            )));
        }
        if self.op == FilterOp::In && !(self.value.starts_with('(') && self.value.ends_with(')')) {
            return Err(ProtoError::Validation(
                "'in' filter value must be a parenthesised list".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

impl FromStr for RowFilter {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .ok_or_else(|| ProtoError::Validation(format!("row filter '{s}' is missing '='")))?;
        let (op, value) = rest.split_once('.').ok_or_else(|| {
            ProtoError::Validation(format!("row filter '{s}' is missing an operator"))
        })?;
        Self::new(column.trim(), op.parse()?, value)
    }
}

impl TryFrom<String> for RowFilter {
    type Error = ProtoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RowFilter> for String {
    fn from(value: RowFilter) -> Self {
        value.to_string()
    }
}

/// What a named subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Database schema.
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Change kinds to receive.
    #[serde(default)]
    pub event: EventFilter,
    /// Optional row filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_filter: Option<RowFilter>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl FilterSpec {
    /// All changes on `table` in the default schema.
    #[must_use]
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: default_schema(),
            table: table.into(),
            event: EventFilter::All,
            row_filter: None,
        }
    }

    /// Use a different schema.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Restrict to one change kind.
    #[must_use]
    pub fn with_event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    /// Add a row filter.
    #[must_use]
    pub fn with_row_filter(mut self, filter: RowFilter) -> Self {
        self.row_filter = Some(filter);
        self
    }

    /// Validate identifiers.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema or table is empty or contains
    /// characters other than ASCII alphanumerics and underscores.
    pub fn validate(&self) -> Result<(), ProtoError> {
        validate_identifier("schema", &self.schema)?;
        validate_identifier("table", &self.table)?;
        if let Some(row) = &self.row_filter {
            row.validate()?;
        }
        Ok(())
    }

    /// The `postgres_changes` entry sent when joining a channel.
    #[must_use]
    pub fn to_join_config(&self) -> Value {
        let mut config = json!({
            "event": self.event.as_str(),
            "schema": self.schema,
            "table": self.table,
        });
        if let (Some(row), Some(map)) = (&self.row_filter, config.as_object_mut()) {
            map.insert("filter".to_string(), Value::String(row.to_string()));
        }
        config
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.event, self.schema, self.table)?;
        if let Some(row) = &self.row_filter {
            write!(f, "?{row}")?;
        }
        Ok(())
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<(), ProtoError> {
    if value.is_empty() {
        return Err(ProtoError::Validation(format!("{field} cannot be empty")));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ProtoError::Validation(format!(
            "{field} '{value}' must contain only alphanumeric characters and underscores"
        )));
    }
    Ok(())
}
