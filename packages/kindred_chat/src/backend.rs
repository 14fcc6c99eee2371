//! Hosted backend abstraction
//!
//! Row-level CRUD over named tables with equality / "in" / boolean filters,
//! ordering and limits, plus named remote procedures. Rows are JSON objects;
//! the typed view lives in [`crate::repository`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::error::BackendError;

/// Procedure creating (or returning) the conversation for a match
pub const CREATE_CONVERSATION_FROM_MATCH: &str = "create_conversation_from_match";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Conversations,
    Messages,
    TypingIndicators,
    Profiles,
    Matches,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Conversations => "conversations",
            Table::Messages => "messages",
            Table::TypingIndicators => "typing_indicators",
            Table::Profiles => "profiles",
            Table::Matches => "matches",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Is(String, bool),
}

impl Filter {
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(column, value) => row.get(column) == Some(value),
            // A missing boolean column reads as false
            Filter::Is(column, expected) => {
                row.get(column).and_then(Value::as_bool).unwrap_or(false) == *expected
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A filtered, ordered read (or the row selection of an update)
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn from(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn is(mut self, column: &str, value: bool) -> Self {
        self.filters.push(Filter::Is(column.to_string(), value));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Filter, order and limit `rows` the way a query engine would.
    pub fn apply<'a>(&self, rows: impl IntoIterator<Item = &'a Value>) -> Vec<Value> {
        let mut selected: Vec<Value> = rows
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();
        if let Some(order) = &self.order {
            selected.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending { ord } else { ord.reverse() }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Column ordering: nulls first, timestamps chronologically, then numbers,
/// strings and booleans by value.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::String(x), Value::String(y)) => {
            match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Query/write/RPC surface of the hosted backend
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError>;

    async fn count(&self, query: &Query) -> Result<usize, BackendError>;

    /// Insert one row; returns the stored row with server-assigned columns.
    async fn insert(&self, table: Table, row: Value) -> Result<Value, BackendError>;

    /// Merge `patch` into every row selected by `query`; returns the row count.
    async fn update(&self, query: &Query, patch: Value) -> Result<usize, BackendError>;

    /// Insert, or merge into the row whose `conflict` columns match.
    async fn upsert(
        &self,
        table: Table,
        row: Value,
        conflict: &[&str],
    ) -> Result<Value, BackendError>;

    async fn rpc(&self, procedure: &str, args: Value) -> Result<Value, BackendError>;
}
