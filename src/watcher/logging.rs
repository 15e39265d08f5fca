//! Observability decorator for watchers.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::event::Event;
use crate::watcher::Watcher;
use crate::Result;

/// Wraps any watcher and logs each event before delegating.
///
/// The runner wraps every slot's watcher in this decorator, so each slot
/// produces a uniform event trace regardless of the user implementation.
pub struct LoggingWatcher<W> {
    inner: W,
    slot: String,
}

impl<W> LoggingWatcher<W> {
    pub fn new(slot: impl Into<String>, inner: W) -> Self {
        Self {
            inner,
            slot: slot.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W: Watcher> Watcher for LoggingWatcher<W> {
    async fn on_event(&mut self, event: Event) -> Result<()> {
        match &event {
            Event::Begin(begin) => debug!(
                slot = %self.slot,
                xid = begin.xid,
                lsn = %begin.lsn,
                estimated_size = begin.estimated_size(),
                "transaction begin"
            ),
            Event::Commit(commit) => debug!(
                slot = %self.slot,
                xid = commit.xid,
                lsn = %commit.lsn,
                "transaction commit"
            ),
            row_event => info!(
                slot = %self.slot,
                xid = row_event.transaction_id(),
                lsn = %row_event.lsn(),
                action = row_event.action(),
                table = row_event.full_table_name().as_deref().unwrap_or(""),
                key = %row_event.primary_key().map(ToString::to_string).unwrap_or_default(),
                "row change"
            ),
        }
        self.inner.on_event(event).await
    }

    fn should_watch_table(&self, full_name: &str) -> bool {
        self.inner.should_watch_table(full_name)
    }

    fn valid_context_prefix(&self, prefix: &str) -> bool {
        self.inner.valid_context_prefix(prefix)
    }
}
