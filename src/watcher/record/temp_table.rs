//! Temporary-table aggregation store.
//!
//! For transactions too large to buffer in memory, per-row state lives in a
//! session-temporary table on the database. Each incoming event reads the
//! prior state for its key, coalesces in process, and writes the merged
//! state back through an upsert; commit drains the table in LSN order and
//! drops it.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio_postgres::NoTls;
use tracing::debug;

use crate::config::PostgresConfig;
use crate::event::{
    Context, DeleteEvent, Event, InsertEvent, PrimaryKey, Row, UpdateEvent,
};
use crate::watcher::record::{aggregation_key, coalesce, AggregationStore};
use crate::{Error, Result};

const DRAIN_BATCH_SIZE: i64 = 500;

pub struct TempTableStore {
    client: tokio_postgres::Client,
    table: String,
}

impl TempTableStore {
    /// Open a dedicated session and create the scratch table for one
    /// transaction.
    pub async fn create(config: &PostgresConfig, xid: u32) -> Result<Self> {
        let (client, connection) = config.pg_config().connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("aggregation session closed: {e}");
            }
        });

        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        let table = format!("temp_record_watcher_{nonce}");

        client
            .batch_execute(&format!(
                "create temporary table {table} ( \
                     xid bigint not null, \
                     lsn bigint not null, \
                     action text not null, \
                     table_name text not null, \
                     primary_key text not null, \
                     \"old\" jsonb, \
                     \"new\" jsonb, \
                     context jsonb \
                 ); \
                 create unique index {table}_row_key on {table} (table_name, primary_key);"
            ))
            .await?;
        debug!(%table, xid, "created aggregation table");

        Ok(Self { client, table })
    }

    async fn load_prior(
        &self,
        table_name: &str,
        primary_key: &str,
        xid: u32,
        schema: &str,
        table: &str,
        key: &PrimaryKey,
    ) -> Result<Option<Event>> {
        let query = format!(
            "select action, \"old\", \"new\", context, lsn from {} \
             where table_name = $1 and primary_key = $2",
            self.table
        );
        let row = self
            .client
            .query_opt(&query, &[&table_name, &primary_key])
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(event_from_columns(
                row.get::<_, String>(0).as_str(),
                row.get::<_, Option<Value>>(1),
                row.get::<_, Option<Value>>(2),
                row.get::<_, Option<Value>>(3),
                row.get::<_, i64>(4),
                xid,
                schema,
                table,
                key,
            )?)),
        }
    }
}

#[async_trait]
impl AggregationStore for TempTableStore {
    async fn apply(&mut self, event: Event) -> Result<()> {
        let Some((table_name, key)) = aggregation_key(&event) else {
            return Ok(());
        };
        let key_text = serde_json::to_string(&key.to_json())?;
        let (schema, table) = (
            event.schema().unwrap_or_default().to_string(),
            event.table().unwrap_or_default().to_string(),
        );
        let xid = event.transaction_id();

        let prior = self
            .load_prior(&table_name, &key_text, xid, &schema, &table, &key)
            .await?;

        match coalesce(prior, event) {
            Some(merged) => {
                let (action, old, new, context) = event_to_columns(&merged);
                let query = format!(
                    "insert into {} (xid, lsn, action, table_name, primary_key, \"old\", \"new\", context) \
                     values ($1, $2, $3, $4, $5, $6, $7, $8) \
                     on conflict (table_name, primary_key) do update set \
                         xid = excluded.xid, lsn = excluded.lsn, action = excluded.action, \
                         \"old\" = excluded.\"old\", \"new\" = excluded.\"new\", \
                         context = excluded.context",
                    self.table
                );
                self.client
                    .execute(
                        &query,
                        &[
                            &(xid as i64),
                            &(merged.lsn().as_u64() as i64),
                            &action,
                            &table_name,
                            &key_text,
                            &old,
                            &new,
                            &context,
                        ],
                    )
                    .await?;
            }
            None => {
                let query = format!(
                    "delete from {} where table_name = $1 and primary_key = $2",
                    self.table
                );
                self.client
                    .execute(&query, &[&table_name, &key_text])
                    .await?;
            }
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let query = format!(
            "select xid, lsn, action, table_name, primary_key, \"old\", \"new\", context \
             from {} order by lsn, table_name, primary_key limit $1 offset $2",
            self.table
        );

        let mut offset: i64 = 0;
        loop {
            let rows = self
                .client
                .query(&query, &[&DRAIN_BATCH_SIZE, &offset])
                .await?;
            let batch_len = rows.len();
            for row in rows {
                let xid = row.get::<_, i64>(0) as u32;
                let table_name: String = row.get(3);
                let (schema, table) = split_full_name(&table_name);
                let key_text: String = row.get(4);
                let key_json: Value = serde_json::from_str(&key_text)?;
                let key = PrimaryKey::from_json(&key_json).ok_or_else(|| Error::Watcher(
                    format!("unreadable primary key in aggregation table: {key_text}"),
                ))?;
                events.push(event_from_columns(
                    row.get::<_, String>(2).as_str(),
                    row.get::<_, Option<Value>>(5),
                    row.get::<_, Option<Value>>(6),
                    row.get::<_, Option<Value>>(7),
                    row.get::<_, i64>(1),
                    xid,
                    &schema,
                    &table,
                    &key,
                )?);
            }
            if (batch_len as i64) < DRAIN_BATCH_SIZE {
                break;
            }
            offset += DRAIN_BATCH_SIZE;
        }

        self.client
            .batch_execute(&format!("drop table if exists {}", self.table))
            .await?;
        Ok(events)
    }

    async fn discard(&mut self) -> Result<()> {
        self.client
            .batch_execute(&format!("drop table if exists {}", self.table))
            .await?;
        Ok(())
    }
}

/// `"schema.table"` (or bare `"table"` for public) back into components.
fn split_full_name(full_name: &str) -> (String, String) {
    match full_name.split_once('.') {
        Some((schema, table)) => (schema.to_string(), table.to_string()),
        None => ("public".to_string(), full_name.to_string()),
    }
}

fn event_to_columns(event: &Event) -> (&'static str, Option<Value>, Option<Value>, Option<Value>) {
    let old = event.old_row().map(|row| Value::Object(row.clone()));
    let new = event.new_row().map(|row| Value::Object(row.clone()));
    let context = event
        .context()
        .map(|context| Value::Object(context.clone()));
    (event.action(), old, new, context)
}

#[allow(clippy::too_many_arguments)]
fn event_from_columns(
    action: &str,
    old: Option<Value>,
    new: Option<Value>,
    context: Option<Value>,
    lsn: i64,
    xid: u32,
    schema: &str,
    table: &str,
    key: &PrimaryKey,
) -> Result<Event> {
    let as_row = |value: Option<Value>| -> Row {
        match value {
            Some(Value::Object(map)) => map,
            _ => Row::new(),
        }
    };
    let context: Context = as_row(context);
    let lsn = crate::lsn::Lsn(lsn as u64);

    let event = match action {
        "insert" => Event::Insert(InsertEvent {
            xid,
            lsn,
            context,
            schema: schema.to_string(),
            table: table.to_string(),
            primary_key: key.clone(),
            new: as_row(new),
        }),
        "update" => Event::Update(UpdateEvent {
            xid,
            lsn,
            context,
            schema: schema.to_string(),
            table: table.to_string(),
            primary_key: key.clone(),
            old: as_row(old),
            new: as_row(new),
            unchanged_toast_columns: Vec::new(),
        }),
        "delete" => Event::Delete(DeleteEvent {
            xid,
            lsn,
            context,
            schema: schema.to_string(),
            table: table.to_string(),
            primary_key: key.clone(),
            old: as_row(old),
        }),
        other => {
            return Err(Error::Watcher(format!(
                "unexpected action in aggregation table: {other}"
            )))
        }
    };
    Ok(event)
}
