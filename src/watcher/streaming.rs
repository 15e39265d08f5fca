//! Streaming delivery: hand events to a handler while the transaction is
//! still open, instead of waiting for commit.
//!
//! Each transaction gets a single worker task and a bounded queue. The
//! producer (the replicator's task) blocks when the queue is full, so
//! back-pressure is the only flow control. Worker failures are re-raised on
//! the producer side at commit so the stream aborts instead of silently
//! losing work.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::event::{BeginEvent, Event};
use crate::watcher::Watcher;
use crate::{Error, Result};

pub const DEFAULT_QUEUE_SIZE: usize = 5000;

/// Consumes the events of one transaction from a bounded queue.
///
/// The receiver yields the transaction's row events followed by the commit
/// event, then terminates.
#[async_trait]
pub trait TransactionHandler: Send + Sync + 'static {
    async fn on_transaction_events(&self, events: mpsc::Receiver<Event>) -> Result<()>;

    /// Queue capacity for a transaction, decided from its begin event.
    fn queue_size(&self, _begin: &BeginEvent) -> usize {
        DEFAULT_QUEUE_SIZE
    }
}

struct ActiveTransaction {
    sender: mpsc::Sender<Event>,
    worker: JoinHandle<Result<()>>,
}

/// Watcher that forwards each transaction to a [`TransactionHandler`]
/// running on its own worker task.
pub struct StreamingWatcher<H> {
    handler: Arc<H>,
    active: Option<ActiveTransaction>,
}

impl<H: TransactionHandler> StreamingWatcher<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            active: None,
        }
    }

    fn spawn_worker(&mut self, begin: &BeginEvent) {
        let capacity = self.handler.queue_size(begin).max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let handler = Arc::clone(&self.handler);
        let worker = tokio::spawn(async move { handler.on_transaction_events(receiver).await });
        self.active = Some(ActiveTransaction { sender, worker });
    }

    async fn finish_worker(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        // Dropping the sender terminates the handler's stream.
        drop(active.sender);
        match active.worker.await {
            Ok(result) => result,
            Err(join_error) => Err(Error::Watcher(format!(
                "transaction worker panicked: {join_error}"
            ))),
        }
    }

    async fn enqueue(&mut self, event: Event) -> Result<()> {
        let send_failed = match self.active.as_ref() {
            // Row event without a begin; nothing to stream into.
            None => return Ok(()),
            Some(active) => active.sender.send(event).await.is_err(),
        };
        if send_failed {
            // The worker dropped its receiver: it failed mid-transaction.
            // Surface its error now rather than at commit.
            return match self.finish_worker().await {
                Ok(()) => Err(Error::Watcher(
                    "transaction worker stopped before commit".to_string(),
                )),
                Err(e) => Err(e),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl<H: TransactionHandler> Watcher for StreamingWatcher<H> {
    async fn on_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Begin(ref begin) => {
                if let Some(stale) = self.active.take() {
                    warn!("discarding stale transaction worker from an aborted stream");
                    stale.worker.abort();
                }
                self.spawn_worker(begin);
                Ok(())
            }
            Event::Commit(_) => {
                self.enqueue(event).await?;
                self.finish_worker().await
            }
            row_event => self.enqueue(row_event).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommitEvent, Context, InsertEvent, KeyPart, PrimaryKey, Row};
    use crate::lsn::Lsn;
    use chrono::Utc;
    use std::sync::Mutex;

    fn begin(xid: u32) -> Event {
        Event::Begin(BeginEvent {
            xid,
            lsn: Lsn(10),
            final_lsn: Lsn(20),
            timestamp: Utc::now(),
        })
    }

    fn insert(xid: u32, id: i64) -> Event {
        Event::Insert(InsertEvent {
            xid,
            lsn: Lsn(11),
            context: Context::new(),
            schema: "public".into(),
            table: "records".into(),
            primary_key: PrimaryKey::Scalar(KeyPart::Int(id)),
            new: Row::new(),
        })
    }

    fn commit(xid: u32) -> Event {
        Event::Commit(CommitEvent {
            xid,
            lsn: Lsn(20),
            context: Context::new(),
            timestamp: Utc::now(),
        })
    }

    struct Recorder {
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl TransactionHandler for Recorder {
        async fn on_transaction_events(&self, mut events: mpsc::Receiver<Event>) -> Result<()> {
            let mut actions = Vec::new();
            while let Some(event) = events.recv().await {
                actions.push(event.action().to_string());
            }
            self.seen.lock().unwrap().push(actions);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl TransactionHandler for Failing {
        async fn on_transaction_events(&self, mut events: mpsc::Receiver<Event>) -> Result<()> {
            // Consume one event then fail.
            events.recv().await;
            Err(Error::Watcher("handler exploded".to_string()))
        }
    }

    #[tokio::test]
    async fn streams_rows_and_commit_then_eof() {
        let mut watcher = StreamingWatcher::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });

        watcher.on_event(begin(1)).await.unwrap();
        watcher.on_event(insert(1, 1)).await.unwrap();
        watcher.on_event(insert(1, 2)).await.unwrap();
        watcher.on_event(commit(1)).await.unwrap();

        let seen = watcher.handler.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![vec!["insert", "insert", "commit"]]);
    }

    #[tokio::test]
    async fn one_worker_per_transaction() {
        let mut watcher = StreamingWatcher::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });

        for xid in 1..=3 {
            watcher.on_event(begin(xid)).await.unwrap();
            watcher.on_event(insert(xid, 1)).await.unwrap();
            watcher.on_event(commit(xid)).await.unwrap();
            assert!(watcher.active.is_none());
        }

        assert_eq!(watcher.handler.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn worker_failure_surfaces_to_producer() {
        let mut watcher = StreamingWatcher::new(Failing);

        watcher.on_event(begin(1)).await.unwrap();
        // The failure surfaces on a later send or at commit, depending on
        // scheduling; either way the commit must not succeed.
        let mut failed = false;
        for i in 0..10 {
            if watcher.on_event(insert(1, i)).await.is_err() {
                failed = true;
                break;
            }
        }
        if !failed {
            failed = watcher.on_event(commit(1)).await.is_err();
        }
        assert!(failed, "worker failure must abort the stream");
    }
}
