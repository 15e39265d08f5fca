//! In-memory aggregation store.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::event::{Event, PrimaryKey};
use crate::watcher::record::{aggregation_key, coalesce, AggregationStore};
use crate::Result;

/// Default store: a map from `(table, primary_key)` to the coalesced event.
#[derive(Default)]
pub struct MemoryStore {
    entries: HashMap<(String, PrimaryKey), Event>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregationStore for MemoryStore {
    async fn apply(&mut self, event: Event) -> Result<()> {
        let key = match aggregation_key(&event) {
            Some(key) => key,
            None => return Ok(()),
        };
        let prior = self.entries.remove(&key);
        if let Some(merged) = coalesce(prior, event) {
            self.entries.insert(key, merged);
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self.entries.drain().map(|(_, event)| event).collect();
        events.sort_by_key(|event| event.lsn());
        Ok(events)
    }

    async fn discard(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
