//! src/services/sync_service.rs
//!
//! SyncService: moves changes between the local JarStore and a
//! RemoteBackend.
//!
//! A cycle snapshots pending local changes, pushes them, records the ack,
//! pulls everything since the stored change token and merges it in one
//! transaction. No store lock is held while a remote call is in flight.
//! Cycles run periodically and whenever a local mutation is committed; a
//! request arriving mid-cycle abandons the running one. Failures end up in
//! the published `SyncStatus`, never in the store's callers.

use crate::{
    models::change::ChangeOrigin,
    services::{
        change_hub::Subscription,
        remote::{NetworkError, RemoteBackend},
        retry::{RetryConfig, retry_async},
        store_service::{JarStore, StoreError},
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Mutex, Notify, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A cycle may be abandoned for a newer request at most this many times in a
/// row before it is allowed to finish.
const MAX_SUPERSEDED: u32 = 3;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    /// No remote configured; changes stay on this device.
    LocalOnly,
    Idle,
    Syncing,
    Synced {
        at: DateTime<Utc>,
        pushed: usize,
        pulled: usize,
    },
    /// The last cycle failed; local changes are waiting for the next one.
    Pending {
        error: String,
        since: DateTime<Utc>,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Time between periodic cycles.
    pub interval: Duration,
    /// Upper bound for a single remote call.
    pub remote_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

pub struct SyncService {
    store: JarStore,
    remote: Arc<dyn RemoteBackend>,
    config: SyncConfig,
}

impl SyncService {
    pub fn new(store: JarStore, remote: Arc<dyn RemoteBackend>, config: SyncConfig) -> Self {
        Self {
            store,
            remote,
            config,
        }
    }

    /// Run one push/pull cycle.
    pub async fn sync_once(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        let pending = self.store.pending_changes().await?;
        if !pending.is_empty() {
            let ack = self
                .call_remote("push_changes", || {
                    self.remote.push_changes(pending.records.clone())
                })
                .await?;
            self.store.mark_pushed(&pending, &ack).await?;
            report.pushed = ack.accepted.len();
        }

        let since = self.store.sync_token().await?;
        let batch = self
            .call_remote("pull_changes", || self.remote.pull_changes(since))
            .await?;
        report.pulled = self.store.apply_remote(&batch).await?;

        debug!(pushed = report.pushed, pulled = report.pulled, "sync cycle finished");
        Ok(report)
    }

    /// One remote call with a timeout, retried with backoff while the
    /// failure is transient.
    async fn call_remote<T, F, Fut>(&self, name: &str, mut call: F) -> Result<T, NetworkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        let timeout = self.config.remote_timeout;
        retry_async(
            &self.config.retry,
            name,
            || {
                let fut = call();
                async move {
                    tokio::time::timeout(timeout, fut)
                        .await
                        .unwrap_or(Err(NetworkError::Timeout(timeout)))
                }
            },
            NetworkError::is_transient,
        )
        .await
    }

    /// Spawn the background loop. The returned handle triggers cycles,
    /// exposes the status and stops the loop.
    pub fn start(self) -> SyncHandle {
        let trigger = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(SyncStatus::Idle);

        let on_change = trigger.clone();
        let subscription = self.store.subscribe(move |event| {
            if event.origin == ChangeOrigin::Local {
                on_change.notify_one();
            }
        });

        let task = tokio::spawn(self.run(
            trigger.clone(),
            status_tx,
            cancel.clone(),
            subscription,
        ));
        info!("sync service started");

        SyncHandle {
            trigger,
            status: status_rx,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(
        self,
        trigger: Arc<Notify>,
        status: watch::Sender<SyncStatus>,
        cancel: CancellationToken,
        _subscription: Subscription,
    ) {
        let mut ticker = tokio::time::interval(self.config.interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = trigger.notified() => {}
            }

            let mut superseded = 0u32;
            loop {
                status.send_replace(SyncStatus::Syncing);
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    res = self.sync_once() => Some(res),
                    _ = trigger.notified(), if superseded < MAX_SUPERSEDED => {
                        superseded += 1;
                        debug!(superseded, "sync cycle superseded by a newer request");
                        continue;
                    }
                };

                match outcome {
                    None => {
                        info!("sync service stopped");
                        return;
                    }
                    Some(Ok(report)) => {
                        status.send_replace(SyncStatus::Synced {
                            at: Utc::now(),
                            pushed: report.pushed,
                            pulled: report.pulled,
                        });
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "sync cycle failed, will retry next cycle");
                        let since = match &*status.borrow() {
                            SyncStatus::Pending { since, .. } => *since,
                            _ => Utc::now(),
                        };
                        status.send_replace(SyncStatus::Pending {
                            error: err.to_string(),
                            since,
                        });
                    }
                }
                break;
            }
        }
        info!("sync service stopped");
    }
}

/// Control handle for a running (or absent) sync loop.
#[derive(Clone)]
pub struct SyncHandle {
    trigger: Arc<Notify>,
    status: watch::Receiver<SyncStatus>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Handle for running without a remote.
    pub fn local_only() -> Self {
        let (_, status) = watch::channel(SyncStatus::LocalOnly);
        Self {
            trigger: Arc::new(Notify::new()),
            status,
            cancel: CancellationToken::new(),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Ask for a cycle as soon as possible.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop the loop and wait for it to exit. An in-flight cycle is dropped;
    /// its open transaction rolls back.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "sync task ended abnormally");
            }
        }
    }
}
