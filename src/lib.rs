//! # pg-watch
//!
//! A PostgreSQL change-data-capture runtime that tails logical replication
//! slots, decodes the binary `pgoutput` stream into strongly-typed row
//! change events and dispatches them to application-defined *watchers*.
//!
//! Unlike trigger- or ORM-callback-based capture, every committed row
//! change is observed exactly once per slot, no matter whether the write
//! came from the application, an out-of-band SQL session, or a bulk
//! operation that bypasses application hooks.
//!
//! ## Overview
//!
//! - A [`Replicator`](replicator::Replicator) owns one slot: it speaks the
//!   streaming replication subprotocol, decodes `pgoutput` messages,
//!   resolves primary keys from the catalogs, handles unchanged-TOAST
//!   markers and emits an ordered event stream bracketed by transaction
//!   delimiters. The slot is acknowledged only after the watcher has seen
//!   the commit, so restarts replay unconfirmed transactions.
//! - Watchers implement [`watcher::Watcher`].
//!   [`RecordWatcher`](watcher::RecordWatcher) coalesces every change a
//!   transaction makes to a row into a single terminal event;
//!   [`StreamingWatcher`](watcher::StreamingWatcher) hands events to a
//!   worker task as they arrive; [`LoggingWatcher`](watcher::LoggingWatcher)
//!   adds an event trace around any of them.
//! - The [`Runner`](runner::Runner) supervises many slots: worker groups,
//!   retry with backoff, periodic liveness pings that advance idle slots,
//!   and orderly shutdown on signal.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pg_watch::{Config, Runner, Result};
//! use pg_watch::watcher::RecordWatcher;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_file("pg-watch.yaml")?;
//!     let mut runner = Runner::new(config);
//!
//!     runner.register("checkout", || {
//!         RecordWatcher::builder()
//!             .on_save("orders", None, |event| {
//!                 println!("order changed: {:?}", event.primary_key());
//!                 Ok(())
//!             })
//!             .build()
//!     });
//!
//!     runner.start().await
//! }
//! ```
//!
//! ## PostgreSQL setup
//!
//! 1. Enable logical replication in `postgresql.conf`:
//!    ```ini
//!    wal_level = logical
//!    max_replication_slots = 4
//!    max_wal_senders = 4
//!    ```
//!
//! 2. Create a publication for the tables to watch:
//!    ```sql
//!    CREATE PUBLICATION checkout_pub FOR TABLE orders, order_items;
//!    ```
//!
//! 3. Grant the connection role replication and read access:
//!    ```sql
//!    CREATE USER replicator WITH REPLICATION LOGIN PASSWORD 'secret';
//!    GRANT CONNECT ON DATABASE app TO replicator;
//!    GRANT SELECT ON ALL TABLES IN SCHEMA public TO replicator;
//!    ```
//!
//! ## Transaction context
//!
//! Application sessions can attach a context object to every subsequent
//! row event of their transaction:
//!
//! ```sql
//! SELECT pg_logical_emit_message(true, 'app_context', '{"actor":"jo"}');
//! ```
//!
//! Watchers opt in per prefix via
//! [`Watcher::valid_context_prefix`](watcher::Watcher::valid_context_prefix);
//! accepted payloads replace the context until the next message or the end
//! of the transaction.

/// Configuration structures, YAML loading and environment overrides.
pub mod config;

/// Error types and result handling.
pub mod error;

/// Row-change event model: the event sum type, rows, primary keys, diffs.
pub mod event;

/// Log sequence numbers.
pub mod lsn;

/// PostgreSQL protocol handling: replication connection, pgoutput decoding,
/// column decoders and primary-key discovery.
pub mod postgres;

/// The per-slot replication state machine.
pub mod replicator;

/// Multi-slot supervision: worker groups, retries, pings, signals.
pub mod runner;

/// The watcher contract and built-in watchers.
pub mod watcher;

pub use config::Config;
pub use error::{Error, Result};
pub use event::Event;
pub use lsn::Lsn;
pub use replicator::Replicator;
pub use runner::Runner;
