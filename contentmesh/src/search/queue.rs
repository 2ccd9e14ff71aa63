use crate::common::LockRegistry;
use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::event::{ElementType, MutationAction, MutationEvent, MutationListener};
use crate::mesh_config::MeshConfig;
use crate::search::{DeadLetter, DeadLetterLog, IndexSource, IndexTarget, SearchBackend};
use dashmap::DashSet;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;

/// Outcome of processing one mutation event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub stored: usize,
    pub deleted: usize,
    /// Store obligations whose content vanished before the write.
    pub skipped: usize,
    pub mappings: usize,
    pub dropped: usize,
    /// Distinct indices refreshed after the obligations completed.
    pub refreshed: Vec<String>,
    pub failed: Vec<IndexTarget>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

enum BackendCall {
    Upsert {
        index: String,
        document_type: String,
        document_id: String,
        document: Value,
    },
    Delete {
        index: String,
        document_type: String,
        document_id: String,
    },
    Refresh {
        index: String,
    },
    PutMapping {
        index: String,
        document_type: String,
        mapping: Value,
    },
    DropIndex {
        index: String,
    },
}

impl BackendCall {
    fn describe(&self) -> String {
        match self {
            BackendCall::Upsert { index, document_id, .. } => format!("upsert of {} into {}", document_id, index),
            BackendCall::Delete { index, document_id, .. } => format!("delete of {} from {}", document_id, index),
            BackendCall::Refresh { index } => format!("refresh of {}", index),
            BackendCall::PutMapping { index, .. } => format!("mapping update of {}", index),
            BackendCall::DropIndex { index } => format!("drop of {}", index),
        }
    }
}

enum Outcome {
    Stored,
    Deleted,
    Skipped,
}

/// Keeps the search backend in sync with content mutations.
///
/// Events are queued without blocking and drained in the background by at
/// most `sync_workers` concurrent tasks. Each event is expanded into index
/// targets, deduplicated and executed against the backend with per-attempt
/// timeouts and exponential backoff. Writes to the same document are
/// serialized and mapping updates exclude writes into the same index. Once
/// all obligations of an event finished, every touched index is refreshed.
/// Obligations that keep failing end up in the dead letter log.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<SyncQueueInner>,
}

struct SyncQueueInner {
    source: Arc<dyn IndexSource>,
    backend: Arc<dyn SearchBackend>,
    config: MeshConfig,
    dead_letters: DeadLetterLog,
    index_locks: LockRegistry,
    document_locks: LockRegistry,
    mapped_indices: DashSet<String>,
    workers: Arc<Semaphore>,
    sender: Mutex<Option<mpsc::UnboundedSender<MutationEvent>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<MutationEvent>>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

impl SyncQueue {
    pub fn new(
        source: Arc<dyn IndexSource>,
        backend: Arc<dyn SearchBackend>,
        config: MeshConfig,
        dead_letters: DeadLetterLog,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let workers = Arc::new(Semaphore::new(config.sync_workers().max(1)));
        SyncQueue {
            inner: Arc::new(SyncQueueInner {
                source,
                backend,
                config,
                dead_letters,
                index_locks: LockRegistry::new(),
                document_locks: LockRegistry::new(),
                mapped_indices: DashSet::new(),
                workers,
                sender: Mutex::new(Some(sender)),
                receiver: Mutex::new(Some(receiver)),
                drain_task: Mutex::new(None),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Starts draining the queue. Must be called within a tokio runtime.
    pub fn start(&self) -> MeshResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            MeshError::new(
                &format!("The sync queue must be started within a tokio runtime: {}", e),
                ErrorKind::InvalidOperation,
            )
        })?;
        let receiver = self.inner.receiver.lock().take().ok_or_else(|| {
            MeshError::new("The sync queue is already started", ErrorKind::InvalidOperation)
        })?;

        let inner = self.inner.clone();
        let task = runtime.spawn(async move { inner.drain(receiver).await });
        *self.inner.drain_task.lock() = Some(task);
        log::debug!("Sync queue started with {} workers", self.inner.config.sync_workers());
        Ok(())
    }

    /// Queues an event for background processing.
    pub fn enqueue(&self, event: MutationEvent) -> MeshResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MeshError::new("The sync queue is closed", ErrorKind::InvalidOperation));
        }
        let sender = self.inner.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(MeshError::new("The sync queue is closed", ErrorKind::InvalidOperation));
        };

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = sender.send(event) {
            self.inner.finish_one();
            return Err(MeshError::new(
                &format!("Failed to queue event {}", e.0.describe()),
                ErrorKind::InternalError,
            ));
        }
        Ok(())
    }

    /// Event bus listener feeding this queue.
    pub fn listener(&self) -> MutationListener {
        let queue = self.clone();
        MutationListener::new(move |event| queue.enqueue(event))
    }

    /// Processes one event right away, bypassing the queue.
    pub async fn process(&self, event: &MutationEvent) -> MeshResult<SyncReport> {
        self.inner.process(event).await
    }

    /// Number of queued events not yet processed.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Waits until every queued event has been processed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Puts the mapping of every given index, whether or not it was put before.
    pub async fn update_mappings(&self, targets: &BTreeSet<IndexTarget>) -> MeshResult<usize> {
        let results = join_all(targets.iter().map(|t| self.inner.put_mapping(t))).await;
        collect_count(results)
    }

    /// Drops every given index.
    pub async fn drop_indices(&self, targets: &BTreeSet<IndexTarget>) -> MeshResult<usize> {
        let results = join_all(targets.iter().map(|t| self.inner.drop_index(t))).await;
        collect_count(results)
    }

    pub fn dead_letters(&self) -> &DeadLetterLog {
        &self.inner.dead_letters
    }

    /// Reprocesses every dead-lettered event. Events failing again are dead
    /// lettered again. Returns the number of events that went through.
    ///
    /// A letter leaves the log only after its event was reprocessed, so an
    /// interrupted retry keeps it. A letter failing again is replaced in
    /// place.
    pub async fn retry_dead_letters(&self) -> MeshResult<usize> {
        let letters = self.inner.dead_letters.entries();
        log::info!("Retrying {} dead-lettered events", letters.len());
        let mut recovered = 0;
        for letter in letters {
            let (result, replacement) = self.inner.synchronize(&letter.event).await;
            match result {
                Ok(report) if report.is_complete() => recovered += 1,
                Ok(_) => {}
                Err(e) => log::error!("Dead-lettered event {} failed again: {}", letter.event.describe(), e),
            }
            match replacement {
                Some(replacement) => self.inner.dead_letters.replace(&letter.id, replacement)?,
                None => {
                    self.inner.dead_letters.remove(&letter.id)?;
                }
            }
        }
        Ok(recovered)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting events without waiting. Queued events are still
    /// processed, after which the background drain ends.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.sender.lock().take();
    }

    /// Stops accepting events, processes what is queued and stops the
    /// background drain.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.drain_task.lock().is_some() {
            self.wait_idle().await;
        }
        self.inner.sender.lock().take();
        let task = self.inner.drain_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Sync queue drain task failed: {}", e);
            }
        }
        self.inner.index_locks.prune();
        self.inner.document_locks.prune();
        log::debug!("Sync queue shut down");
    }
}

fn collect_count(results: Vec<MeshResult<()>>) -> MeshResult<usize> {
    let mut count = 0;
    for result in results {
        result?;
        count += 1;
    }
    Ok(count)
}

impl SyncQueueInner {
    async fn drain(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<MutationEvent>) {
        while let Some(event) = receiver.recv().await {
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    log::error!("Sync workers are gone: {}", e);
                    self.finish_one();
                    break;
                }
            };
            let inner = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = inner.process(&event).await {
                    log::error!("Failed to synchronize {}: {}", event.describe(), e);
                }
                inner.finish_one();
            });
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn process(&self, event: &MutationEvent) -> MeshResult<SyncReport> {
        let (result, letter) = self.synchronize(event).await;
        if let Some(letter) = letter {
            self.dead_letters.append(letter)?;
        }
        result
    }

    /// Runs every obligation of `event`. Returns the dead letter to record
    /// when something failed.
    async fn synchronize(&self, event: &MutationEvent) -> (MeshResult<SyncReport>, Option<DeadLetter>) {
        let outcome = self.run_obligations(event).await;
        self.document_locks.prune();
        self.index_locks.prune();
        outcome
    }

    async fn run_obligations(&self, event: &MutationEvent) -> (MeshResult<SyncReport>, Option<DeadLetter>) {
        let expanded = match self.source.expand(event) {
            Ok(targets) => targets,
            Err(e) => {
                log::error!("Failed to resolve targets of {}: {}", event.describe(), e);
                let letter = DeadLetter::new(event.clone(), Vec::new(), e.message(), 0);
                return (Err(e), Some(letter));
            }
        };
        let count = expanded.len();
        let targets: BTreeSet<IndexTarget> = expanded.into_iter().collect();
        if targets.len() < count {
            log::debug!(
                "Dropped {} duplicate targets of {}",
                count - targets.len(),
                event.describe()
            );
        }

        let mut report = SyncReport::default();
        let mut last_error = None;
        match event.element_type {
            ElementType::Node => {
                let results = join_all(targets.iter().map(|t| self.execute(event.action, t))).await;
                let mut touched = BTreeSet::new();
                for (target, result) in targets.iter().zip(results) {
                    match result {
                        Ok(Outcome::Stored) => {
                            report.stored += 1;
                            touched.insert(target.to_index());
                        }
                        Ok(Outcome::Deleted) => {
                            report.deleted += 1;
                            touched.insert(target.to_index());
                        }
                        Ok(Outcome::Skipped) => report.skipped += 1,
                        Err(e) => {
                            report.failed.push(target.clone());
                            last_error = Some(e);
                        }
                    }
                }

                // all obligations of the event are done at this point
                let refreshes = join_all(touched.iter().map(|t| self.refresh(t))).await;
                for (target, result) in touched.into_iter().zip(refreshes) {
                    match result {
                        Ok(()) => report.refreshed.push(target.index_name),
                        Err(e) => {
                            report.failed.push(target);
                            last_error = Some(e);
                        }
                    }
                }
            }
            ElementType::Release => {
                let results = match event.action {
                    MutationAction::Store => join_all(targets.iter().map(|t| self.put_mapping(t))).await,
                    MutationAction::Delete => join_all(targets.iter().map(|t| self.drop_index(t))).await,
                };
                for (target, result) in targets.iter().zip(results) {
                    match (result, event.action) {
                        (Ok(()), MutationAction::Store) => report.mappings += 1,
                        (Ok(()), MutationAction::Delete) => report.dropped += 1,
                        (Err(e), _) => {
                            report.failed.push(target.clone());
                            last_error = Some(e);
                        }
                    }
                }
            }
        }

        if let Some(error) = last_error {
            log::error!(
                "{} of {} targets of {} failed, dead-lettering: {}",
                report.failed.len(),
                targets.len(),
                event.describe(),
                error
            );
            let letter = DeadLetter::new(
                event.clone(),
                report.failed.clone(),
                error.message(),
                self.config.sync_max_attempts(),
            );
            return (Ok(report), Some(letter));
        }
        log::debug!(
            "Synchronized {}: {} stored, {} deleted, {} refreshed",
            event.describe(),
            report.stored,
            report.deleted,
            report.refreshed.len()
        );
        (Ok(report), None)
    }

    async fn execute(&self, action: MutationAction, target: &IndexTarget) -> MeshResult<Outcome> {
        let document_id = target.document_id.clone().ok_or_else(|| {
            MeshError::new(
                &format!("Target {} has no document id", target.index_name),
                ErrorKind::InternalError,
            )
        })?;

        if action == MutationAction::Store {
            self.ensure_mapping(target).await?;
        }

        let _index_guard = self.index_locks.get_lock(&target.index_name).read().await;
        let _document_guard = self.document_locks.get_lock(&document_id).write().await;
        match action {
            MutationAction::Store => {
                // read under the document lock so the latest content wins
                let Some(document) = self.source.document(target)? else {
                    return Ok(Outcome::Skipped);
                };
                self.with_retry(&BackendCall::Upsert {
                    index: target.index_name.clone(),
                    document_type: target.document_type.clone(),
                    document_id,
                    document,
                })
                .await?;
                Ok(Outcome::Stored)
            }
            MutationAction::Delete => {
                self.with_retry(&BackendCall::Delete {
                    index: target.index_name.clone(),
                    document_type: target.document_type.clone(),
                    document_id,
                })
                .await?;
                Ok(Outcome::Deleted)
            }
        }
    }

    async fn refresh(&self, target: &IndexTarget) -> MeshResult<()> {
        self.with_retry(&BackendCall::Refresh {
            index: target.index_name.clone(),
        })
        .await
    }

    async fn ensure_mapping(&self, target: &IndexTarget) -> MeshResult<()> {
        if self.mapped_indices.contains(&target.index_name) {
            return Ok(());
        }
        let _guard = self.index_locks.get_lock(&target.index_name).write().await;
        if self.mapped_indices.contains(&target.index_name) {
            return Ok(());
        }
        self.put_mapping_locked(target).await
    }

    async fn put_mapping(&self, target: &IndexTarget) -> MeshResult<()> {
        let _guard = self.index_locks.get_lock(&target.index_name).write().await;
        self.put_mapping_locked(target).await
    }

    async fn put_mapping_locked(&self, target: &IndexTarget) -> MeshResult<()> {
        let mapping = self.source.mapping(target)?;
        self.with_retry(&BackendCall::PutMapping {
            index: target.index_name.clone(),
            document_type: target.document_type.clone(),
            mapping,
        })
        .await?;
        self.mapped_indices.insert(target.index_name.clone());
        log::debug!("Mapping of {} updated", target.index_name);
        Ok(())
    }

    async fn drop_index(&self, target: &IndexTarget) -> MeshResult<()> {
        let _guard = self.index_locks.get_lock(&target.index_name).write().await;
        self.with_retry(&BackendCall::DropIndex {
            index: target.index_name.clone(),
        })
        .await?;
        self.mapped_indices.remove(&target.index_name);
        log::info!("Dropped index {}", target.index_name);
        Ok(())
    }

    async fn invoke(&self, call: &BackendCall) -> MeshResult<()> {
        match call {
            BackendCall::Upsert {
                index,
                document_type,
                document_id,
                document,
            } => {
                self.backend
                    .upsert_document(index, document_type, document_id, document.clone())
                    .await
            }
            BackendCall::Delete {
                index,
                document_type,
                document_id,
            } => self.backend.delete_document(index, document_type, document_id).await,
            BackendCall::Refresh { index } => self.backend.refresh_index(index).await,
            BackendCall::PutMapping {
                index,
                document_type,
                mapping,
            } => self.backend.put_mapping(index, document_type, mapping.clone()).await,
            BackendCall::DropIndex { index } => self.backend.drop_index(index).await,
        }
    }

    async fn with_retry(&self, call: &BackendCall) -> MeshResult<()> {
        let attempts = self.config.sync_max_attempts();
        let timeout = self.config.sync_attempt_timeout();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.invoke(call)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    log::warn!("{} failed (attempt {}/{}): {}", call.describe(), attempt, attempts, e);
                    last_error = Some(e);
                }
                Err(_) => {
                    log::warn!(
                        "{} timed out after {:?} (attempt {}/{})",
                        call.describe(),
                        timeout,
                        attempt,
                        attempts
                    );
                    last_error = Some(MeshError::new(
                        &format!("{} timed out after {:?}", call.describe(), timeout),
                        ErrorKind::Timeout,
                    ));
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.backoff_for(attempt)).await;
            }
        }

        let message = format!("{} failed after {} attempts", call.describe(), attempts);
        Err(match last_error {
            Some(cause) => MeshError::new_with_cause(&message, ErrorKind::SyncObligationFailure, cause),
            None => MeshError::new(&message, ErrorKind::SyncObligationFailure),
        })
    }
}
