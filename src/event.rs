//! Row-change event model.
//!
//! Every committed transaction observed on a slot is delivered to a watcher
//! as the contiguous sequence `Begin, (Insert | Update | Delete)*, Commit`.
//! The five kinds are a closed sum type with distinct field shapes: an
//! insert only has a new image, a delete only an old image, and so on.
//! Dispatch on events should use exhaustive matching.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lsn::Lsn;

/// A decoded row image: column name to decoded value (or JSON null).
pub type Row = serde_json::Map<String, Value>;

/// Per-transaction context attached to row events.
///
/// Populated from logical messages emitted by application sessions via
/// `pg_logical_emit_message` and reset at every transaction begin.
pub type Context = serde_json::Map<String, Value>;

/// One component of a primary key. Keys that decode to anything other than
/// integers or strings make the row unkeyable and the event is dropped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Int(i64),
    Text(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Text(s) => write!(f, "{s}"),
        }
    }
}

/// The primary key of a changed row: a scalar for single-column keys, an
/// ordered tuple for composite keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Scalar(KeyPart),
    Composite(Vec<KeyPart>),
}

impl PrimaryKey {
    /// Build a key from decoded column values in key-column order.
    ///
    /// Returns `None` when any component is not an integer or string, or
    /// when `values` is empty.
    pub fn from_values(values: &[&Value]) -> Option<PrimaryKey> {
        let mut parts = Vec::with_capacity(values.len());
        for value in values {
            let part = match value {
                Value::Number(n) => KeyPart::Int(n.as_i64()?),
                Value::String(s) => KeyPart::Text(s.clone()),
                _ => return None,
            };
            parts.push(part);
        }
        match parts.len() {
            0 => None,
            1 => parts.pop().map(PrimaryKey::Scalar),
            _ => Some(PrimaryKey::Composite(parts)),
        }
    }

    /// JSON rendering: a scalar for single-column keys, an array otherwise.
    /// Used as the conflict key in the temporary-table backend.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("primary key serializes infallibly")
    }

    pub fn from_json(value: &Value) -> Option<PrimaryKey> {
        serde_json::from_value(value.clone()).ok()
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Scalar(part) => write!(f, "{part}"),
            PrimaryKey::Composite(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeginEvent {
    pub xid: u32,
    pub lsn: Lsn,
    pub final_lsn: Lsn,
    pub timestamp: DateTime<Utc>,
}

impl BeginEvent {
    /// WAL bytes the transaction is expected to span. Drives the
    /// aggregation strategy choice; zero when the server reports a final
    /// LSN at or before the begin LSN.
    pub fn estimated_size(&self) -> u64 {
        self.final_lsn.as_u64().saturating_sub(self.lsn.as_u64())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertEvent {
    pub xid: u32,
    pub lsn: Lsn,
    pub context: Context,
    pub schema: String,
    pub table: String,
    pub primary_key: PrimaryKey,
    pub new: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub xid: u32,
    pub lsn: Lsn,
    pub context: Context,
    pub schema: String,
    pub table: String,
    pub primary_key: PrimaryKey,
    pub old: Row,
    pub new: Row,
    /// Columns whose new image carried an unchanged-TOAST marker that could
    /// not be resolved from the old image. Their value is JSON null here;
    /// the aggregation engine fills them from prior in-transaction state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unchanged_toast_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteEvent {
    pub xid: u32,
    pub lsn: Lsn,
    pub context: Context,
    pub schema: String,
    pub table: String,
    pub primary_key: PrimaryKey,
    pub old: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub xid: u32,
    pub lsn: Lsn,
    pub context: Context,
    pub timestamp: DateTime<Utc>,
}

/// A change observed on the replication stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Begin(BeginEvent),
    Insert(InsertEvent),
    Update(UpdateEvent),
    Delete(DeleteEvent),
    Commit(CommitEvent),
}

impl Event {
    pub fn transaction_id(&self) -> u32 {
        match self {
            Event::Begin(e) => e.xid,
            Event::Insert(e) => e.xid,
            Event::Update(e) => e.xid,
            Event::Delete(e) => e.xid,
            Event::Commit(e) => e.xid,
        }
    }

    pub fn lsn(&self) -> Lsn {
        match self {
            Event::Begin(e) => e.lsn,
            Event::Insert(e) => e.lsn,
            Event::Update(e) => e.lsn,
            Event::Delete(e) => e.lsn,
            Event::Commit(e) => e.lsn,
        }
    }

    /// Schema of the changed table; `None` for transaction delimiters.
    pub fn schema(&self) -> Option<&str> {
        match self {
            Event::Insert(e) => Some(&e.schema),
            Event::Update(e) => Some(&e.schema),
            Event::Delete(e) => Some(&e.schema),
            _ => None,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            Event::Insert(e) => Some(&e.table),
            Event::Update(e) => Some(&e.table),
            Event::Delete(e) => Some(&e.table),
            _ => None,
        }
    }

    /// `"schema.table"`, with the `public` schema elided to just `"table"`.
    pub fn full_table_name(&self) -> Option<String> {
        match (self.schema(), self.table()) {
            (Some(schema), Some(table)) => Some(full_table_name(schema, table)),
            _ => None,
        }
    }

    pub fn primary_key(&self) -> Option<&PrimaryKey> {
        match self {
            Event::Insert(e) => Some(&e.primary_key),
            Event::Update(e) => Some(&e.primary_key),
            Event::Delete(e) => Some(&e.primary_key),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&Context> {
        match self {
            Event::Insert(e) => Some(&e.context),
            Event::Update(e) => Some(&e.context),
            Event::Delete(e) => Some(&e.context),
            Event::Commit(e) => Some(&e.context),
            Event::Begin(_) => None,
        }
    }

    /// New image of the row, where the event carries one.
    pub fn new_row(&self) -> Option<&Row> {
        match self {
            Event::Insert(e) => Some(&e.new),
            Event::Update(e) => Some(&e.new),
            _ => None,
        }
    }

    /// Old image of the row, where the event carries one.
    pub fn old_row(&self) -> Option<&Row> {
        match self {
            Event::Update(e) => Some(&e.old),
            Event::Delete(e) => Some(&e.old),
            _ => None,
        }
    }

    /// Current value of a column: `new[key]` for inserts and updates.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.new_row().and_then(|row| row.get(key))
    }

    /// Previous value of a column: `old[key]` for updates and deletes.
    pub fn attribute_was(&self, key: &str) -> Option<&Value> {
        self.old_row().and_then(|row| row.get(key))
    }

    /// Whether a column's value differs between the old and new images.
    pub fn changed_attribute(&self, key: &str) -> bool {
        self.diff().contains_key(key)
    }

    /// Per-column `(old, new)` pairs describing this change.
    ///
    /// Inserts diff against nothing (`old` is null), deletes against
    /// nothing going forward (`new` is null), updates list only columns
    /// whose value actually changed.
    pub fn diff(&self) -> BTreeMap<String, (Value, Value)> {
        let mut diff = BTreeMap::new();
        match self {
            Event::Insert(e) => {
                for (key, value) in &e.new {
                    diff.insert(key.clone(), (Value::Null, value.clone()));
                }
            }
            Event::Update(e) => {
                for (key, new_value) in &e.new {
                    let old_value = e.old.get(key).cloned().unwrap_or(Value::Null);
                    if &old_value != new_value {
                        diff.insert(key.clone(), (old_value, new_value.clone()));
                    }
                }
            }
            Event::Delete(e) => {
                for (key, value) in &e.old {
                    diff.insert(key.clone(), (value.clone(), Value::Null));
                }
            }
            Event::Begin(_) | Event::Commit(_) => {}
        }
        diff
    }

    /// Short action name, used in logs and the temporary-table backend.
    pub fn action(&self) -> &'static str {
        match self {
            Event::Begin(_) => "begin",
            Event::Insert(_) => "insert",
            Event::Update(_) => "update",
            Event::Delete(_) => "delete",
            Event::Commit(_) => "commit",
        }
    }
}

/// `"schema.table"`, with the `public` schema elided.
pub fn full_table_name(schema: &str, table: &str) -> String {
    if schema == "public" {
        table.to_string()
    } else {
        format!("{schema}.{table}")
    }
}
