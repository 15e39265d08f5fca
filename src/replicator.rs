//! The replication state machine.
//!
//! A `Replicator` owns one slot: it opens the replication connection,
//! decodes the pgoutput stream into [`Event`]s and feeds them to a watcher
//! in server order. A second, ordinary connection resolves primary keys
//! from the catalogs the first time each relation appears.
//!
//! Acknowledgement is tied to delivery: the slot's confirmed LSN advances
//! only after the watcher has returned from the commit event, so a crash
//! before that point replays the transaction on restart.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::config::PostgresConfig;
use crate::event::{
    full_table_name, BeginEvent, CommitEvent, Context, DeleteEvent, Event, InsertEvent,
    PrimaryKey, Row, UpdateEvent,
};
use crate::lsn::Lsn;
use crate::postgres::connection::ReplicationConnection;
use crate::postgres::decoder::{PgOutputMessage, RelationBody, TupleData, TupleValue};
use crate::postgres::primary_key::{CatalogKeyLookup, KeyLookup};
use crate::postgres::protocol::{pg_timestamp_to_utc, Frame};
use crate::watcher::Watcher;
use crate::{Error, Result};

/// Logical-message prefix used as a liveness probe by the runner's ping
/// task. Recognised messages advance the acknowledged LSN and emit nothing.
pub const WAL_PING_PREFIX: &str = "wal_ping";

/// A cached relation: wire metadata plus the resolved key columns.
#[derive(Debug, Clone)]
pub struct Relation {
    pub oid: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<crate::postgres::decoder::RelationColumn>,
    /// Ordered key column names; empty when the table is unkeyed.
    pub key_columns: Vec<String>,
}

impl Relation {
    pub fn full_name(&self) -> String {
        full_table_name(&self.schema, &self.table)
    }
}

pub struct Replicator {
    config: PostgresConfig,
    slot: String,
    temporary: bool,
    key_lookup: Box<dyn KeyLookup>,
    relations: HashMap<u32, Relation>,
    /// Per-transaction state; reset at every begin.
    context: Context,
    transaction_id: Option<u32>,
    last_confirmed: Lsn,
}

impl Replicator {
    pub fn new(config: PostgresConfig, slot: impl Into<String>, temporary: bool) -> Self {
        let key_lookup = Box::new(CatalogKeyLookup::new(config.clone()));
        Self::with_key_lookup(config, slot, temporary, key_lookup)
    }

    /// Replicator with a custom key resolver. Tests use this to run the
    /// state machine without a database.
    pub fn with_key_lookup(
        config: PostgresConfig,
        slot: impl Into<String>,
        temporary: bool,
        key_lookup: Box<dyn KeyLookup>,
    ) -> Self {
        Self {
            config,
            slot: slot.into(),
            temporary,
            key_lookup,
            relations: HashMap::new(),
            context: Context::new(),
            transaction_id: None,
            last_confirmed: Lsn::ZERO,
        }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Stream events to the watcher until the server closes the stream or
    /// an error occurs. Returns `Ok` on a clean end of stream.
    pub async fn replicate(
        &mut self,
        watcher: &mut dyn Watcher,
        publications: &[String],
    ) -> Result<()> {
        let mut connection = ReplicationConnection::connect(&self.config).await?;
        connection.create_slot(&self.slot, self.temporary).await?;
        let mut stream = connection
            .start_replication(&self.slot, publications, Lsn::ZERO)
            .await?;

        let result = loop {
            let frame = match stream.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            match self.handle_frame(frame, watcher).await {
                Ok(Some(ack)) => {
                    if let Err(e) = stream.ack(ack).await {
                        break Err(e);
                    }
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };

        // Both connections are closed on the way out, error or not.
        stream.close().await;
        result
    }

    /// Like [`replicate`](Self::replicate), but a clean end of stream is
    /// normal shutdown rather than something to report.
    pub async fn replicate_forever(
        &mut self,
        watcher: &mut dyn Watcher,
        publications: &[String],
    ) -> Result<()> {
        self.replicate(watcher, publications).await
    }

    /// Advance the state machine by one replication frame.
    ///
    /// Returns the LSN to acknowledge to the server, if this frame calls
    /// for one. Separated from the socket loop so the dispatch logic can be
    /// exercised against synthetic frames.
    pub async fn handle_frame(
        &mut self,
        frame: Frame,
        watcher: &mut dyn Watcher,
    ) -> Result<Option<Lsn>> {
        match frame {
            Frame::Keepalive { wal_end, reply, .. } => {
                trace!(wal_end, reply, "keepalive");
                if reply {
                    // The server insists on hearing from us; report the
                    // position we have actually delivered.
                    Ok(Some(self.last_confirmed))
                } else {
                    Ok(None)
                }
            }
            Frame::XLogData {
                start_lsn, data, ..
            } => {
                let message = PgOutputMessage::decode(data)?;
                self.handle_message(Lsn(start_lsn), message, watcher).await
            }
        }
    }

    async fn handle_message(
        &mut self,
        frame_lsn: Lsn,
        message: PgOutputMessage,
        watcher: &mut dyn Watcher,
    ) -> Result<Option<Lsn>> {
        match message {
            PgOutputMessage::Relation(body) => {
                self.cache_relation(body).await?;
                Ok(None)
            }
            PgOutputMessage::Begin(body) => {
                self.context.clear();
                self.transaction_id = Some(body.xid);
                let event = Event::Begin(BeginEvent {
                    xid: body.xid,
                    lsn: frame_lsn,
                    final_lsn: Lsn(body.final_lsn),
                    timestamp: pg_timestamp_to_utc(body.timestamp),
                });
                watcher.on_event(event).await?;
                Ok(None)
            }
            PgOutputMessage::Message {
                lsn,
                prefix,
                content,
                ..
            } => self.handle_logical_message(Lsn(lsn), &prefix, content, watcher),
            PgOutputMessage::Insert { relation_oid, new } => {
                let Some((relation, full_name)) = self.watched_relation(relation_oid, watcher)?
                else {
                    return Ok(None);
                };
                let (new_row, _) = decode_row(&relation, &new, None)?;
                let Some(primary_key) = resolve_key(&relation, &new_row) else {
                    trace!(table = %full_name, "dropping insert without resolvable key");
                    return Ok(None);
                };
                let event = Event::Insert(InsertEvent {
                    xid: self.current_xid(),
                    lsn: frame_lsn,
                    context: self.context.clone(),
                    schema: relation.schema,
                    table: relation.table,
                    primary_key,
                    new: new_row,
                });
                watcher.on_event(event).await?;
                Ok(None)
            }
            PgOutputMessage::Update {
                relation_oid,
                old,
                key,
                new,
            } => {
                let Some((relation, full_name)) = self.watched_relation(relation_oid, watcher)?
                else {
                    return Ok(None);
                };
                let old_image = old.as_ref().or(key.as_ref());
                let (new_row, unresolved) = decode_row(&relation, &new, old_image)?;
                let old_row = match old_image {
                    Some(image) => decode_row(&relation, image, Some(&new))?.0,
                    None => Row::new(),
                };
                let Some(primary_key) = resolve_key(&relation, &new_row) else {
                    trace!(table = %full_name, "dropping update without resolvable key");
                    return Ok(None);
                };
                let event = Event::Update(UpdateEvent {
                    xid: self.current_xid(),
                    lsn: frame_lsn,
                    context: self.context.clone(),
                    schema: relation.schema,
                    table: relation.table,
                    primary_key,
                    old: old_row,
                    new: new_row,
                    unchanged_toast_columns: unresolved,
                });
                watcher.on_event(event).await?;
                Ok(None)
            }
            PgOutputMessage::Delete {
                relation_oid,
                old,
                key,
            } => {
                let Some((relation, full_name)) = self.watched_relation(relation_oid, watcher)?
                else {
                    return Ok(None);
                };
                let image = old.as_ref().or(key.as_ref()).ok_or_else(|| {
                    Error::InvalidMessage {
                        message: "delete without an old or key image".to_string(),
                    }
                })?;
                let (old_row, _) = decode_row(&relation, image, None)?;
                let Some(primary_key) = resolve_key(&relation, &old_row) else {
                    trace!(table = %full_name, "dropping delete without resolvable key");
                    return Ok(None);
                };
                let event = Event::Delete(DeleteEvent {
                    xid: self.current_xid(),
                    lsn: frame_lsn,
                    context: self.context.clone(),
                    schema: relation.schema,
                    table: relation.table,
                    primary_key,
                    old: old_row,
                });
                watcher.on_event(event).await?;
                Ok(None)
            }
            PgOutputMessage::Commit(body) => {
                let event = Event::Commit(CommitEvent {
                    xid: self.current_xid(),
                    lsn: Lsn(body.commit_lsn),
                    context: self.context.clone(),
                    timestamp: pg_timestamp_to_utc(body.timestamp),
                });
                watcher.on_event(event).await?;
                // The watcher has seen the whole transaction; the server
                // may release WAL up to its end.
                self.last_confirmed = Lsn(body.end_lsn);
                Ok(Some(self.last_confirmed))
            }
            PgOutputMessage::Truncate { relation_oids, .. } => {
                trace!(?relation_oids, "dropping truncate message");
                Ok(None)
            }
            PgOutputMessage::Origin { .. }
            | PgOutputMessage::Type { .. }
            | PgOutputMessage::StreamStart { .. }
            | PgOutputMessage::StreamStop
            | PgOutputMessage::StreamCommit { .. }
            | PgOutputMessage::StreamAbort { .. } => Ok(None),
        }
    }

    fn handle_logical_message(
        &mut self,
        lsn: Lsn,
        prefix: &str,
        content: Bytes,
        watcher: &mut dyn Watcher,
    ) -> Result<Option<Lsn>> {
        if prefix == WAL_PING_PREFIX {
            let ack = self.last_confirmed.max(lsn);
            self.last_confirmed = ack;
            return Ok(Some(ack));
        }
        if !watcher.valid_context_prefix(prefix) {
            return Ok(None);
        }
        match serde_json::from_slice::<Value>(&content) {
            Ok(Value::Object(map)) => {
                debug!(prefix, "replacing transaction context");
                self.context = map;
            }
            Ok(_) | Err(_) => {
                // Malformed context payloads are dropped; the prior
                // context stays in effect.
                debug!(prefix, "ignoring non-object context payload");
            }
        }
        Ok(None)
    }

    async fn cache_relation(&mut self, body: RelationBody) -> Result<()> {
        if self.relations.contains_key(&body.oid) {
            // Schema evolution: the server re-sends the relation, and any
            // cached key may be stale.
            debug!(oid = body.oid, "relation re-sent, refreshing cached key");
            self.key_lookup.invalidate(&body.namespace, &body.name);
        }
        let key_columns = self
            .key_lookup
            .key_columns(&body.namespace, &body.name)
            .await?;
        debug!(
            oid = body.oid,
            schema = %body.namespace,
            table = %body.name,
            key = ?key_columns,
            "cached relation"
        );
        self.relations.insert(
            body.oid,
            Relation {
                oid: body.oid,
                schema: body.namespace,
                table: body.name,
                columns: body.columns,
                key_columns,
            },
        );
        Ok(())
    }

    /// Relation for a row message, or `None` when the watcher declines the
    /// table. The cache lookup happens regardless of the filter.
    fn watched_relation(
        &self,
        oid: u32,
        watcher: &dyn Watcher,
    ) -> Result<Option<(Relation, String)>> {
        let relation = self.relations.get(&oid).ok_or_else(|| Error::InvalidMessage {
            message: format!("row message for unknown relation oid {oid}"),
        })?;
        let full_name = relation.full_name();
        if !watcher.should_watch_table(&full_name) {
            trace!(table = %full_name, "table not watched, dropping");
            return Ok(None);
        }
        Ok(Some((relation.clone(), full_name)))
    }

    fn current_xid(&self) -> u32 {
        match self.transaction_id {
            Some(xid) => xid,
            None => {
                warn!("row message outside a transaction");
                0
            }
        }
    }
}

/// Decode a wire tuple against its relation.
///
/// Unchanged-TOAST positions take their value from `fallback` (the other
/// image of the same message) when it carries one; positions that stay
/// unresolved become null and are reported back to the caller.
fn decode_row(
    relation: &Relation,
    tuple: &TupleData,
    fallback: Option<&TupleData>,
) -> Result<(Row, Vec<String>)> {
    if tuple.0.len() != relation.columns.len() {
        return Err(Error::InvalidMessage {
            message: format!(
                "tuple has {} columns but relation {}.{} has {}",
                tuple.0.len(),
                relation.schema,
                relation.table,
                relation.columns.len()
            ),
        });
    }

    let mut row = Row::new();
    let mut unresolved = Vec::new();
    for (position, (value, column)) in tuple.0.iter().zip(&relation.columns).enumerate() {
        let decoded = match value {
            TupleValue::Null => Value::Null,
            TupleValue::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| Error::InvalidMessage {
                    message: format!("column {} is not valid UTF-8", column.name),
                })?;
                crate::postgres::types::decode_value(column.type_oid, text)
            }
            TupleValue::Toast => {
                let substituted = fallback
                    .and_then(|image| image.0.get(position))
                    .and_then(|other| match other {
                        TupleValue::Text(bytes) => std::str::from_utf8(bytes).ok(),
                        _ => None,
                    })
                    .map(|text| crate::postgres::types::decode_value(column.type_oid, text));
                match substituted {
                    Some(value) => value,
                    None => {
                        unresolved.push(column.name.clone());
                        Value::Null
                    }
                }
            }
        };
        row.insert(column.name.clone(), decoded);
    }
    Ok((row, unresolved))
}

/// Resolve the primary key from a decoded row using the relation's key
/// columns. `None` when the table is unkeyed or a component is not an
/// integer or string.
fn resolve_key(relation: &Relation, row: &Row) -> Option<PrimaryKey> {
    if relation.key_columns.is_empty() {
        return None;
    }
    let values: Vec<&Value> = relation
        .key_columns
        .iter()
        .map(|column| row.get(column))
        .collect::<Option<Vec<_>>>()?;
    PrimaryKey::from_values(&values)
}
