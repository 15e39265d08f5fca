//! Watcher contract and the built-in watcher implementations.
//!
//! A watcher receives the ordered event stream of one slot. The trait is a
//! small capability set; [`LoggingWatcher`] and [`StreamingWatcher`] are
//! decorators over any implementation, and [`RecordWatcher`] aggregates raw
//! events into one terminal change per row per transaction.

use async_trait::async_trait;

use crate::event::Event;
use crate::Result;

pub mod logging;
pub mod record;
pub mod streaming;

pub use logging::LoggingWatcher;
pub use record::{RecordWatcher, RecordWatcherBuilder};
pub use streaming::{StreamingWatcher, TransactionHandler};

/// Receives the event stream of a slot, in server order.
///
/// `on_event` is called synchronously from the replicator's task: the
/// stream does not advance, and the slot is not acknowledged, until it
/// returns. Failures propagate through the replicator and abort the slot,
/// which the runner then restarts under its retry policy.
#[async_trait]
pub trait Watcher: Send {
    async fn on_event(&mut self, event: Event) -> Result<()>;

    /// Consulted before row decoding; tables answering `false` are dropped
    /// without being decoded. `full_name` elides the `public` schema.
    fn should_watch_table(&self, _full_name: &str) -> bool {
        true
    }

    /// Consulted for every logical message; accepted prefixes replace the
    /// transaction context.
    fn valid_context_prefix(&self, _prefix: &str) -> bool {
        true
    }
}

#[async_trait]
impl Watcher for Box<dyn Watcher + Send> {
    async fn on_event(&mut self, event: Event) -> Result<()> {
        (**self).on_event(event).await
    }

    fn should_watch_table(&self, full_name: &str) -> bool {
        (**self).should_watch_table(full_name)
    }

    fn valid_context_prefix(&self, prefix: &str) -> bool {
        (**self).valid_context_prefix(prefix)
    }
}

/// Watcher that discards every event. Useful as a base for decorators in
/// tests and as the replicate-only mode of the CLI.
#[derive(Debug, Default)]
pub struct NoopWatcher;

#[async_trait]
impl Watcher for NoopWatcher {
    async fn on_event(&mut self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Watcher that records every event it sees. Test support.
#[derive(Debug, Default)]
pub struct CollectingWatcher {
    pub events: Vec<Event>,
}

#[async_trait]
impl Watcher for CollectingWatcher {
    async fn on_event(&mut self, event: Event) -> Result<()> {
        self.events.push(event);
        Ok(())
    }
}
