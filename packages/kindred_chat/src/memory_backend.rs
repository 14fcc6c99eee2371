//! In-memory backend
//!
//! JSON row tables behind one lock, emitting row changes into a
//! [`MemoryHub`] the way the hosted platform's replication stream would.
//! Also carries the server-side behaviour the chat layer relies on:
//!
//! - `id` and `created_at` are assigned on insert when absent
//! - new messages start unread and bump their conversation's
//!   `last_message_id` / `last_message_at`
//! - `create_conversation_from_match` is idempotent per match

use async_trait::async_trait;
use chrono::Utc;
use kindred_realtime::{ChangeKind, MemoryHub, RowChange};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{Backend, CREATE_CONVERSATION_FROM_MATCH, Query, Table};
use crate::error::BackendError;

#[derive(Default)]
struct Tables {
    rows: HashMap<Table, Vec<Value>>,
    failing: HashSet<Table>,
    failing_rpc: bool,
}

impl Tables {
    fn check(&self, table: Table) -> Result<(), BackendError> {
        if self.failing.contains(&table) {
            return Err(BackendError::Unavailable(format!("{} unavailable", table)));
        }
        Ok(())
    }

    fn table(&mut self, table: Table) -> &mut Vec<Value> {
        self.rows.entry(table).or_default()
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    hub: Option<MemoryHub>,
}

fn object(row: Value) -> Result<Map<String, Value>, BackendError> {
    match row {
        Value::Object(map) => Ok(map),
        other => Err(BackendError::Rejected(format!("row must be an object, got {}", other))),
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose writes are replicated into `hub`
    pub fn with_hub(hub: MemoryHub) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            hub: Some(hub),
        }
    }

    /// Store a row directly, bypassing defaults and replication.
    pub async fn seed(&self, table: Table, row: Value) {
        self.tables.lock().await.table(table).push(row);
    }

    pub async fn rows(&self, table: Table) -> Vec<Value> {
        self.tables
            .lock()
            .await
            .rows
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every operation on `table` fail as unavailable (or recover).
    pub async fn set_failing(&self, table: Table, failing: bool) {
        let mut tables = self.tables.lock().await;
        if failing {
            tables.failing.insert(table);
        } else {
            tables.failing.remove(&table);
        }
    }

    pub async fn set_rpc_failing(&self, failing: bool) {
        self.tables.lock().await.failing_rpc = failing;
    }

    async fn emit(&self, table: Table, kind: ChangeKind, record: Value, old_record: Option<Value>) {
        if let Some(hub) = &self.hub {
            hub.publish(RowChange {
                table: table.as_str().to_string(),
                kind,
                record,
                old_record,
            })
            .await;
        }
    }

    /// Insert with server defaults. Caller holds the table lock so replication
    /// order matches write order.
    async fn insert_locked(
        &self,
        tables: &mut Tables,
        table: Table,
        row: Value,
    ) -> Result<Value, BackendError> {
        let mut row = object(row)?;
        row.entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        row.entry("created_at")
            .or_insert_with(|| Value::String(now_string()));
        if table == Table::Messages {
            row.entry("is_read").or_insert(Value::Bool(false));
        }
        let row = Value::Object(row);
        tables.table(table).push(row.clone());
        self.emit(table, ChangeKind::Insert, row.clone(), None).await;

        if table == Table::Messages {
            self.touch_conversation(tables, &row).await;
        }
        Ok(row)
    }

    async fn touch_conversation(&self, tables: &mut Tables, message: &Value) {
        let Some(conversation_id) = message.get("conversation_id") else {
            return;
        };
        let conversation = tables
            .table(Table::Conversations)
            .iter_mut()
            .find(|c| c.get("id") == Some(conversation_id));
        let Some(conversation) = conversation else {
            return;
        };
        let old = conversation.clone();
        if let Value::Object(map) = conversation {
            map.insert("last_message_id".into(), message["id"].clone());
            map.insert("last_message_at".into(), message["created_at"].clone());
        }
        let updated = conversation.clone();
        self.emit(Table::Conversations, ChangeKind::Update, updated, Some(old))
            .await;
    }

    async fn conversation_from_match(&self, args: Value) -> Result<Value, BackendError> {
        let match_id = args
            .get("match_id")
            .cloned()
            .ok_or_else(|| BackendError::Rejected("match_id is required".into()))?;

        let mut tables = self.tables.lock().await;
        tables.check(Table::Matches)?;
        tables.check(Table::Conversations)?;

        let existing = tables
            .table(Table::Conversations)
            .iter()
            .find(|c| c.get("match_id") == Some(&match_id))
            .and_then(|c| c.get("id").cloned());
        if let Some(id) = existing {
            debug!("Conversation for match {} already exists", match_id);
            return Ok(id);
        }

        let found = tables
            .table(Table::Matches)
            .iter()
            .find(|m| m.get("id") == Some(&match_id))
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                table: Table::Matches.to_string(),
                id: match_id.to_string(),
            })?;

        let row = json!({
            "participant_a_id": found["user_a_id"],
            "participant_b_id": found["user_b_id"],
            "match_id": match_id,
        });
        let created = self
            .insert_locked(&mut tables, Table::Conversations, row)
            .await?;
        debug!("Created conversation {} from match {}", created["id"], match_id);
        Ok(created["id"].clone())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError> {
        let tables = self.tables.lock().await;
        tables.check(query.table)?;
        let rows = tables.rows.get(&query.table).map(Vec::as_slice).unwrap_or(&[]);
        Ok(query.apply(rows))
    }

    async fn count(&self, query: &Query) -> Result<usize, BackendError> {
        let tables = self.tables.lock().await;
        tables.check(query.table)?;
        Ok(tables
            .rows
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).count())
            .unwrap_or(0))
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, BackendError> {
        let mut tables = self.tables.lock().await;
        tables.check(table)?;
        self.insert_locked(&mut tables, table, row).await
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<usize, BackendError> {
        let patch = object(patch)?;
        let mut tables = self.tables.lock().await;
        tables.check(query.table)?;

        let mut changes = Vec::new();
        for row in tables.table(query.table).iter_mut() {
            if !query.matches(row) {
                continue;
            }
            let old = row.clone();
            if let Value::Object(map) = row {
                for (k, v) in &patch {
                    map.insert(k.clone(), v.clone());
                }
            }
            changes.push((row.clone(), old));
        }

        let updated = changes.len();
        for (record, old) in changes {
            self.emit(query.table, ChangeKind::Update, record, Some(old))
                .await;
        }
        Ok(updated)
    }

    async fn upsert(
        &self,
        table: Table,
        row: Value,
        conflict: &[&str],
    ) -> Result<Value, BackendError> {
        let incoming = object(row)?;
        let mut tables = self.tables.lock().await;
        tables.check(table)?;

        let existing = tables.table(table).iter_mut().find(|r| {
            conflict
                .iter()
                .all(|column| r.get(*column).is_some() && r.get(*column) == incoming.get(*column))
        });

        match existing {
            Some(row) => {
                let old = row.clone();
                if let Value::Object(map) = row {
                    for (k, v) in &incoming {
                        map.insert(k.clone(), v.clone());
                    }
                }
                let record = row.clone();
                self.emit(table, ChangeKind::Update, record.clone(), Some(old))
                    .await;
                Ok(record)
            }
            None => {
                self.insert_locked(&mut tables, table, Value::Object(incoming))
                    .await
            }
        }
    }

    async fn rpc(&self, procedure: &str, args: Value) -> Result<Value, BackendError> {
        if self.tables.lock().await.failing_rpc {
            return Err(BackendError::Unavailable(format!("{} unavailable", procedure)));
        }
        match procedure {
            CREATE_CONVERSATION_FROM_MATCH => self.conversation_from_match(args).await,
            other => Err(BackendError::UnknownProcedure(other.to_string())),
        }
    }
}
