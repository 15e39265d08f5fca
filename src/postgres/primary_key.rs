//! Primary-key discovery against the system catalogs.
//!
//! The replication stream identifies rows positionally; to key events the
//! replicator looks the primary key up over a separate, non-replication
//! connection the first time it sees a relation. Tables without a primary
//! key fall back to their first unique index; tables with neither are
//! unkeyed and their row events are dropped.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::config::PostgresConfig;
use crate::{Error, Result};

const PRIMARY_KEY_QUERY: &str = "\
    select a.attname \
    from pg_constraint con \
    join pg_class c on c.oid = con.conrelid \
    join pg_namespace n on n.oid = c.relnamespace \
    join unnest(con.conkey) with ordinality as k(attnum, ord) on true \
    join pg_attribute a on a.attrelid = con.conrelid and a.attnum = k.attnum \
    where con.contype = 'p' and n.nspname = $1 and c.relname = $2 \
    order by k.ord";

const UNIQUE_INDEX_QUERY: &str = "\
    select a.attname, i.indexrelid::int8 \
    from pg_index i \
    join pg_class c on c.oid = i.indrelid \
    join pg_namespace n on n.oid = c.relnamespace \
    join unnest(i.indkey::int2[]) with ordinality as k(attnum, ord) on true \
    join pg_attribute a on a.attrelid = i.indrelid and a.attnum = k.attnum \
    where i.indisunique and n.nspname = $1 and c.relname = $2 \
    order by i.indisprimary desc, i.indexrelid, k.ord";

/// Resolves the key columns of a table. Seam over the catalog connection so
/// the replicator can be driven without a server.
#[async_trait]
pub trait KeyLookup: Send {
    /// Ordered key column names; empty when the table has no resolvable key.
    async fn key_columns(&mut self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Forget a cached result, e.g. after schema evolution.
    fn invalidate(&mut self, schema: &str, table: &str);
}

/// Catalog-backed lookup with a per-`(schema, table)` cache and a single
/// transparent reconnect when the metadata connection has gone away.
pub struct CatalogKeyLookup {
    config: PostgresConfig,
    client: Option<tokio_postgres::Client>,
    cache: HashMap<(String, String), Vec<String>>,
}

impl CatalogKeyLookup {
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            client: None,
            cache: HashMap::new(),
        }
    }

    async fn client(&mut self) -> Result<&tokio_postgres::Client> {
        if self.client.is_none() {
            let (client, connection) = self.config.pg_config().connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("metadata connection closed: {e}");
                }
            });
            self.client = Some(client);
        }
        match &self.client {
            Some(client) => Ok(client),
            None => Err(Error::Connection(
                "metadata connection unavailable".to_string(),
            )),
        }
    }

    async fn query_key_columns(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let client = self.client().await?;

        let rows = client
            .query(PRIMARY_KEY_QUERY, &[&schema, &table])
            .await?;
        if !rows.is_empty() {
            return Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect());
        }

        // No primary key; fall back to the best-ranked unique index.
        let rows = client
            .query(UNIQUE_INDEX_QUERY, &[&schema, &table])
            .await?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let chosen_index: i64 = first.get(1);
        Ok(rows
            .iter()
            .filter(|row| row.get::<_, i64>(1) == chosen_index)
            .map(|row| row.get::<_, String>(0))
            .collect())
    }
}

#[async_trait]
impl KeyLookup for CatalogKeyLookup {
    async fn key_columns(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let cache_key = (schema.to_string(), table.to_string());
        if let Some(columns) = self.cache.get(&cache_key) {
            return Ok(columns.clone());
        }

        let columns = match self.query_key_columns(schema, table).await {
            Ok(columns) => columns,
            Err(Error::Postgres(e)) if e.is_closed() => {
                // The metadata session died; reopen and retry once.
                warn!(schema, table, "metadata connection lost, reconnecting");
                self.client = None;
                self.query_key_columns(schema, table).await?
            }
            Err(e) => return Err(e),
        };

        if columns.is_empty() {
            warn!(schema, table, "table has no resolvable key; row events will be dropped");
        } else {
            debug!(schema, table, columns = ?columns, "resolved key columns");
        }
        self.cache.insert(cache_key, columns.clone());
        Ok(columns)
    }

    fn invalidate(&mut self, schema: &str, table: &str) {
        self.cache
            .remove(&(schema.to_string(), table.to_string()));
    }
}

/// Fixed key assignments, for exercising the replicator in tests.
#[derive(Default)]
pub struct StaticKeyLookup {
    pub keys: HashMap<(String, String), Vec<String>>,
}

impl StaticKeyLookup {
    pub fn with(mut self, schema: &str, table: &str, columns: &[&str]) -> Self {
        self.keys.insert(
            (schema.to_string(), table.to_string()),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl KeyLookup for StaticKeyLookup {
    async fn key_columns(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        Ok(self
            .keys
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn invalidate(&mut self, _schema: &str, _table: &str) {}
}
