//! Slot supervision.
//!
//! The runner partitions configured slots into worker groups, runs each
//! group's slots concurrently, retries failed slots with backoff, keeps a
//! liveness ping going so idle slots still advance, and tears everything
//! down on SIGINT/SIGTERM.
//!
//! Groups are isolated from one another: with more than one group each
//! runs on its own OS thread with a dedicated runtime, so no database
//! handle, task or panic crosses a group boundary. A single group runs
//! directly on the calling runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::task::JoinSet;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, PostgresConfig, SlotConfig};
use crate::replicator::{Replicator, WAL_PING_PREFIX};
use crate::watcher::{LoggingWatcher, Watcher};
use crate::{Error, Result};

/// Creates a fresh watcher for each (re)start of a slot.
pub type WatcherFactory = Arc<dyn Fn() -> Box<dyn Watcher + Send> + Send + Sync>;

pub struct Runner {
    config: Config,
    factories: HashMap<String, WatcherFactory>,
    shutdown: CancellationToken,
    signalled: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            factories: HashMap::new(),
            shutdown: CancellationToken::new(),
            signalled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a watcher factory under the name slots refer to with their
    /// `watcher:` key. A fresh watcher is built for every (re)start of a
    /// slot.
    pub fn register<W, F>(&mut self, name: impl Into<String>, factory: F)
    where
        W: Watcher + Send + 'static,
        F: Fn() -> W + Send + Sync + 'static,
    {
        let factory: WatcherFactory = Arc::new(move || {
            let watcher: Box<dyn Watcher + Send> = Box::new(factory());
            watcher
        });
        self.factories.insert(name.into(), factory);
    }

    /// Token cancelled when the runner is shutting down. Cancelling it
    /// externally stops all slots.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all configured slots until shutdown.
    ///
    /// Returns `Ok` for a signal-initiated shutdown and `Err` when a slot
    /// exhausted its retries or configuration was invalid.
    pub async fn start(&self) -> Result<()> {
        // Resolve factories up front; a missing watcher is a configuration
        // error, not something to retry.
        let mut slots: Vec<(String, SlotConfig, WatcherFactory)> = Vec::new();
        for (name, slot) in &self.config.slots {
            let factory = self.factories.get(&slot.watcher).ok_or_else(|| {
                Error::Config(format!(
                    "slot '{name}' refers to unregistered watcher '{}'",
                    slot.watcher
                ))
            })?;
            slots.push((name.clone(), slot.clone(), Arc::clone(factory)));
        }

        let mut groups: BTreeMap<String, Vec<(String, SlotConfig, WatcherFactory)>> =
            BTreeMap::new();
        for entry in slots {
            groups.entry(entry.1.worker.clone()).or_default().push(entry);
        }
        info!(
            slots = self.config.slots.len(),
            groups = groups.len(),
            "starting runner"
        );

        let signal_task = tokio::spawn(wait_for_shutdown_signal(
            self.shutdown.clone(),
            Arc::clone(&self.signalled),
        ));
        let ping_task = tokio::spawn(ping_loop(
            self.config.database.clone(),
            self.config.ping_interval_secs,
            self.shutdown.clone(),
        ));

        let database = self.config.database.clone();
        let shutdown = self.shutdown.clone();
        let result = if groups.len() > 1 {
            run_groups_on_threads(groups, database, shutdown).await
        } else if let Some(group) = groups.into_values().next() {
            run_group(group, database, shutdown).await
        } else {
            Ok(())
        };

        self.shutdown.cancel();
        ping_task.abort();
        signal_task.abort();

        match result {
            Err(e) if !self.signalled.load(Ordering::SeqCst) => Err(e),
            _ => {
                info!("runner stopped");
                Ok(())
            }
        }
    }
}

/// One OS thread and runtime per worker group.
async fn run_groups_on_threads(
    groups: BTreeMap<String, Vec<(String, SlotConfig, WatcherFactory)>>,
    database: PostgresConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut handles = Vec::new();
    for (group_name, group) in groups {
        let database = database.clone();
        let shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(format!("pg-watch-{group_name}"))
            .spawn(move || -> Result<()> {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(run_group(group, database, shutdown))
            })
            .map_err(Error::Io)?;
        handles.push(handle);
    }

    tokio::task::spawn_blocking(move || {
        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(Error::Watcher("worker group panicked".to_string()));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
    .await
    .map_err(|e| Error::Watcher(format!("worker join failed: {e}")))?
}

/// Run one group's slots concurrently until they all stop.
async fn run_group(
    group: Vec<(String, SlotConfig, WatcherFactory)>,
    database: PostgresConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut tasks = JoinSet::new();
    for (name, slot, factory) in group {
        let database = database.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { run_slot(name, slot, factory, database, shutdown).await });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(join_error) => {
                first_error
                    .get_or_insert(Error::Watcher(format!("slot task panicked: {join_error}")));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Supervise one slot: replicate, retry with backoff, restart after normal
/// completion when configured to.
async fn run_slot(
    name: String,
    slot: SlotConfig,
    factory: WatcherFactory,
    database: PostgresConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let slot_name = if slot.temporary {
            format!("{name}_{}", random_suffix())
        } else {
            name.clone()
        };
        let mut replicator = Replicator::new(database.clone(), &slot_name, slot.temporary);
        let mut watcher = LoggingWatcher::new(slot_name.clone(), factory());

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            outcome = replicator.replicate_forever(&mut watcher, &slot.publications) => outcome,
        };

        match outcome {
            Ok(()) => {
                if !slot.auto_restart {
                    info!(slot = %slot_name, "slot finished");
                    return Ok(());
                }
                attempt += 1;
                debug!(slot = %slot_name, attempt, "restarting after normal completion");
            }
            Err(e) if e.is_fatal() => {
                error!(slot = %slot_name, error = %e, "slot failed with non-retriable error");
                shutdown.cancel();
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                if let Some(max_retries) = slot.retries {
                    if attempt >= max_retries {
                        error!(slot = %slot_name, attempt, error = %e, "slot exhausted its retries");
                        shutdown.cancel();
                        return Err(e);
                    }
                }
                warn!(slot = %slot_name, attempt, error = %e, "slot failed, backing off");
            }
        }

        let delay = slot.backoff_delay(attempt);
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Periodically emit a `wal_ping` logical message so slots acknowledge a
/// fresh LSN even when their tables are idle. The replicator recognises
/// the prefix and advances without emitting events.
async fn ping_loop(database: PostgresConfig, interval_secs: u64, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so startup isn't racing
    // slot creation.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = emit_ping(&database).await {
            warn!(error = %e, "liveness ping failed");
        }
    }
}

async fn emit_ping(database: &PostgresConfig) -> Result<()> {
    let (client, connection) = database.pg_config().connect(NoTls).await?;
    let connection_task = tokio::spawn(connection);
    let query = format!("select pg_logical_emit_message(true, '{WAL_PING_PREFIX}', '{{}}')");
    let result = client.execute(query.as_str(), &[]).await;
    drop(client);
    connection_task.abort();
    result?;
    debug!("emitted liveness ping");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(shutdown: CancellationToken, signalled: Arc<AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return;
        }
    };

    loop {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        if !shutdown.is_cancelled() {
            info!("got {name}, shutting down");
            signalled.store(true, Ordering::SeqCst);
            shutdown.cancel();
        } else {
            info!("got {name}, already shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(shutdown: CancellationToken, signalled: Arc<AtomicBool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        signalled.store(true, Ordering::SeqCst);
        shutdown.cancel();
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_slot() -> Config {
        serde_yaml::from_str(
            "\
database: {database: app, username: u}
slots:
  s:
    watcher: missing
    publications: [p]
",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unregistered_watcher_is_a_config_error() {
        let runner = Runner::new(config_with_slot());
        match runner.start().await {
            Err(Error::Config(message)) => assert!(message.contains("missing")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn random_suffix_shape() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
