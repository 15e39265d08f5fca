//! Per-transaction aggregation of row changes.
//!
//! A [`RecordWatcher`] collapses every change a transaction makes to a row
//! into a single terminal event, delivered at commit: an insert followed by
//! updates is still an insert (with the latest values), an insert followed
//! by a delete is nothing at all, consecutive updates merge keeping the
//! original old image, and an update followed by a delete keeps that
//! original old image on the delete.
//!
//! Two interchangeable stores hold the per-transaction state: an in-memory
//! map, and a session-temporary database table for transactions whose
//! estimated WAL footprint makes buffering in memory unreasonable.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use crate::event::{BeginEvent, Event, PrimaryKey, Row};
use crate::watcher::Watcher;
use crate::{Error, Result};

pub mod memory;
pub mod temp_table;

use memory::MemoryStore;
use temp_table::TempTableStore;

/// Spill to the temporary-table store above this estimated transaction
/// size (2 GiB).
pub const DEFAULT_SPILL_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;

/// How a transaction's row state is buffered until commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Memory,
    TempTable,
}

/// Backend holding `(table, primary_key) → event` state for one transaction.
#[async_trait]
pub(crate) trait AggregationStore: Send + Sync {
    /// Fold an incoming row event into the stored state for its key.
    async fn apply(&mut self, event: Event) -> Result<()>;

    /// Return the terminal events and release the store's resources.
    async fn drain(&mut self) -> Result<Vec<Event>>;

    /// Drop any state without delivering it.
    async fn discard(&mut self) -> Result<()>;
}

/// Coalesce an incoming row event with the prior state for the same
/// `(table, primary_key)`. Returns `None` when the pair annihilates
/// (insert then delete within one transaction).
pub(crate) fn coalesce(prior: Option<Event>, incoming: Event) -> Option<Event> {
    let prior = match prior {
        None => return Some(incoming),
        Some(prior) => prior,
    };

    match (prior, incoming) {
        // A fresh insert supersedes anything we knew about the row.
        (_, insert @ Event::Insert(_)) => Some(insert),

        (Event::Insert(prior_insert), Event::Update(update)) => {
            // The row is still new to this transaction: stay an insert,
            // refresh the data. The intermediate image is not observable.
            let (new, _) = resolve_toast(
                update.new,
                &update.unchanged_toast_columns,
                &prior_insert.new,
            );
            Some(Event::Insert(crate::event::InsertEvent {
                xid: update.xid,
                lsn: update.lsn,
                context: update.context,
                schema: update.schema,
                table: update.table,
                primary_key: update.primary_key,
                new,
            }))
        }
        (Event::Insert(_), Event::Delete(_)) => None,

        (Event::Update(prior_update), Event::Update(update)) => {
            let (new, unresolved) = resolve_toast(
                update.new,
                &update.unchanged_toast_columns,
                &prior_update.new,
            );
            Some(Event::Update(crate::event::UpdateEvent {
                xid: update.xid,
                lsn: update.lsn,
                context: update.context,
                schema: update.schema,
                table: update.table,
                primary_key: update.primary_key,
                old: prior_update.old,
                new,
                unchanged_toast_columns: unresolved,
            }))
        }
        (Event::Update(prior_update), Event::Delete(delete)) => {
            Some(Event::Delete(crate::event::DeleteEvent {
                xid: delete.xid,
                lsn: delete.lsn,
                context: delete.context,
                schema: delete.schema,
                table: delete.table,
                primary_key: delete.primary_key,
                old: prior_update.old,
            }))
        }

        (Event::Delete(_), update @ Event::Update(_)) => Some(update),
        (delete @ Event::Delete(_), Event::Delete(_)) => Some(delete),

        // Transaction delimiters never reach the store.
        (_, other) => Some(other),
    }
}

/// Fill unresolved TOAST columns in `new` from a prior in-transaction
/// image. Returns the resolved row and the columns that remain unresolved.
fn resolve_toast(mut new: Row, toast_columns: &[String], prior_new: &Row) -> (Row, Vec<String>) {
    let mut unresolved = Vec::new();
    for column in toast_columns {
        match prior_new.get(column) {
            Some(value) => {
                new.insert(column.clone(), value.clone());
            }
            None => unresolved.push(column.clone()),
        }
    }
    (new, unresolved)
}

/// Aggregation key for a row event, or `None` for delimiters.
pub(crate) fn aggregation_key(event: &Event) -> Option<(String, PrimaryKey)> {
    Some((event.full_table_name()?, event.primary_key()?.clone()))
}

enum HandlerKind {
    Insert,
    Update,
    Save,
    Destroy,
}

type Callback = Box<dyn Fn(&Event) -> Result<()> + Send + Sync>;

struct Registration {
    kind: HandlerKind,
    changed: Option<HashSet<String>>,
    callback: Callback,
}

impl Registration {
    fn matches(&self, event: &Event) -> bool {
        let changed_matches = |changed: &Option<HashSet<String>>| match changed {
            None => true,
            Some(columns) => event.diff().keys().any(|k| columns.contains(k)),
        };
        match (&self.kind, event) {
            (HandlerKind::Insert, Event::Insert(_)) => true,
            (HandlerKind::Update, Event::Update(_)) => changed_matches(&self.changed),
            (HandlerKind::Save, Event::Insert(_)) => true,
            (HandlerKind::Save, Event::Update(_)) => changed_matches(&self.changed),
            (HandlerKind::Destroy, Event::Delete(_)) => true,
            _ => false,
        }
    }
}

/// Builds a [`RecordWatcher`]: handlers are registered per table and fire
/// in registration order on the transaction's terminal events.
#[derive(Default)]
pub struct RecordWatcherBuilder {
    handlers: Vec<(String, Registration)>,
    record_changed: Option<Callback>,
    session: Option<crate::config::PostgresConfig>,
    spill_threshold: u64,
}

impl RecordWatcherBuilder {
    pub fn new() -> Self {
        Self {
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            ..Default::default()
        }
    }

    /// Fire on a terminal insert to `table`.
    pub fn on_insert<F>(mut self, table: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((
            table.into(),
            Registration {
                kind: HandlerKind::Insert,
                changed: None,
                callback: Box::new(callback),
            },
        ));
        self
    }

    /// Fire on a terminal update to `table`; with `changed`, only when one
    /// of the named columns actually changed.
    pub fn on_update<F>(
        mut self,
        table: impl Into<String>,
        changed: Option<&[&str]>,
        callback: F,
    ) -> Self
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((
            table.into(),
            Registration {
                kind: HandlerKind::Update,
                changed: changed.map(|cols| cols.iter().map(|c| c.to_string()).collect()),
                callback: Box::new(callback),
            },
        ));
        self
    }

    /// Fire on a terminal insert or update; `changed` filters updates only.
    pub fn on_save<F>(
        mut self,
        table: impl Into<String>,
        changed: Option<&[&str]>,
        callback: F,
    ) -> Self
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((
            table.into(),
            Registration {
                kind: HandlerKind::Save,
                changed: changed.map(|cols| cols.iter().map(|c| c.to_string()).collect()),
                callback: Box::new(callback),
            },
        ));
        self
    }

    /// Fire on a terminal delete from `table`.
    pub fn on_destroy<F>(mut self, table: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((
            table.into(),
            Registration {
                kind: HandlerKind::Destroy,
                changed: None,
                callback: Box::new(callback),
            },
        ));
        self
    }

    /// Fire on every terminal event, regardless of table. Registering this
    /// hook makes the watcher observe all tables.
    pub fn on_record_changed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.record_changed = Some(Box::new(callback));
        self
    }

    /// Database session used by the temporary-table store. Without one,
    /// every transaction aggregates in memory.
    pub fn session(mut self, config: crate::config::PostgresConfig) -> Self {
        self.session = Some(config);
        self
    }

    /// Estimated-transaction-size threshold above which state spills to a
    /// temporary table.
    pub fn spill_threshold(mut self, bytes: u64) -> Self {
        self.spill_threshold = bytes;
        self
    }

    pub fn build(self) -> RecordWatcher {
        let tables = self
            .handlers
            .iter()
            .map(|(table, _)| table.clone())
            .collect();
        RecordWatcher {
            handlers: self.handlers,
            record_changed: self.record_changed,
            tables,
            session: self.session,
            spill_threshold: self.spill_threshold,
            store: None,
        }
    }
}

/// Watcher that delivers one terminal event per `(table, primary_key)` per
/// transaction to its registered handlers.
pub struct RecordWatcher {
    handlers: Vec<(String, Registration)>,
    record_changed: Option<Callback>,
    tables: HashSet<String>,
    session: Option<crate::config::PostgresConfig>,
    spill_threshold: u64,
    store: Option<Box<dyn AggregationStore>>,
}

impl RecordWatcher {
    pub fn builder() -> RecordWatcherBuilder {
        RecordWatcherBuilder::new()
    }

    /// Pick the store for a transaction from its begin event.
    fn aggregation_strategy(&self, begin: &BeginEvent) -> Strategy {
        if begin.estimated_size() > self.spill_threshold && self.session.is_some() {
            Strategy::TempTable
        } else {
            Strategy::Memory
        }
    }

    async fn open_store(&mut self, begin: &BeginEvent) -> Result<()> {
        let strategy = self.aggregation_strategy(begin);
        let store: Box<dyn AggregationStore> = match (strategy, &self.session) {
            (Strategy::TempTable, Some(config)) => {
                debug!(
                    xid = begin.xid,
                    estimated_size = begin.estimated_size(),
                    "spilling transaction to temporary table"
                );
                Box::new(TempTableStore::create(config, begin.xid).await?)
            }
            _ => Box::new(MemoryStore::new()),
        };
        self.store = Some(store);
        Ok(())
    }

    fn fire(&self, event: &Event) -> Result<()> {
        if let Some(callback) = &self.record_changed {
            callback(event)?;
        }
        let Some(full_name) = event.full_table_name() else {
            return Ok(());
        };
        for (table, registration) in &self.handlers {
            if *table == full_name && registration.matches(event) {
                (registration.callback)(event)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Watcher for RecordWatcher {
    async fn on_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Begin(ref begin) => {
                if let Some(mut stale) = self.store.take() {
                    // Leftover state from an aborted stream.
                    stale.discard().await?;
                }
                self.open_store(begin).await
            }
            Event::Commit(_) => {
                let Some(mut store) = self.store.take() else {
                    return Ok(());
                };
                let result = async {
                    for terminal in store.drain().await? {
                        self.fire(&terminal)?;
                    }
                    Ok(())
                }
                .await;
                if result.is_err() {
                    store.discard().await.ok();
                }
                result
            }
            row_event => {
                if aggregation_key(&row_event).is_none() {
                    // Unresolvable key; the event is ignored.
                    return Ok(());
                }
                match self.store.as_mut() {
                    Some(store) => store.apply(row_event).await,
                    None => Err(Error::Watcher(
                        "row event outside a transaction".to_string(),
                    )),
                }
            }
        }
    }

    fn should_watch_table(&self, full_name: &str) -> bool {
        self.record_changed.is_some() || self.tables.contains(full_name)
    }
}
