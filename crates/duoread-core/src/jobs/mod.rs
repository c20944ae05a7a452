//! Alignment job pipeline.
//!
//! Architecture:
//!
//! ```text
//! ImportJobClient::start()          (gate acquired here)
//!         │
//!         ▼  mpsc<Dispatch>
//!   worker task ──► AlignmentScheduler::run()
//!         │                 │  PageEngine (blocking thread)
//!         │                 │  PageStore
//!         ▼  mpsc<JobEvent> ▼
//!   event dispatcher ──► ProgressTracker, collection index, ready signal
//!         │
//!         ▼  broadcast<JobEvent>
//!   subscribers (UI, CLI)
//! ```
//!
//! The worker releases the gate before it sends Done/Failed.

mod progress;
mod scheduler;
mod types;
mod worker;

pub use progress::{ImportProgress, JobState, ProgressTracker};
pub use scheduler::{advance, select_stream, AlignmentScheduler, SchedulerConfig};
pub use types::{AlignmentJob, Command, Cursors, JobEvent, ProgressEvent};

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{ClientError, StoreError};
use crate::gate::{GateGuard, JobGate};
use crate::kv::KeyValueStore;
use crate::storage::{self, PageStore};
use crate::types::InputImage;
use worker::{Dispatch, WorkerHandle};

/// Entry point for UIs: submits jobs to the worker and fans out its events.
pub struct ImportJobClient {
    worker: Mutex<WorkerHandle>,
    scheduler: Arc<AlignmentScheduler>,
    gate: Arc<JobGate>,
    store: Arc<dyn PageStore>,
    index: Arc<KeyValueStore>,
    events_tx: mpsc::Sender<JobEvent>,
    control_tx: mpsc::Sender<Control>,
    broadcast: broadcast::Sender<JobEvent>,
    progress: ProgressTracker,
    ready: Arc<watch::Sender<Option<String>>>,
    dispatcher: JoinHandle<()>,
}

impl ImportJobClient {
    /// Spawn the worker and the event dispatcher. Must be called inside a tokio runtime.
    pub fn new(
        scheduler: AlignmentScheduler,
        gate: Arc<JobGate>,
        store: Arc<dyn PageStore>,
        index: Arc<KeyValueStore>,
        event_buffer: usize,
    ) -> Self {
        let event_buffer = event_buffer.max(1);
        let scheduler = Arc::new(scheduler);
        let (events_tx, events_rx) = mpsc::channel(event_buffer);
        let (control_tx, control_rx) = mpsc::channel(1);
        let (broadcast, _) = broadcast::channel(event_buffer);
        let progress = ProgressTracker::new();
        let (ready, _) = watch::channel(None);
        let ready = Arc::new(ready);

        let worker = WorkerHandle::spawn(
            Arc::clone(&scheduler),
            events_tx.clone(),
            Arc::clone(&index),
        );
        let dispatcher = tokio::spawn(dispatch_events(
            events_rx,
            control_rx,
            broadcast.clone(),
            progress.clone(),
            Arc::clone(&index),
            Arc::clone(&ready),
        ));

        Self {
            worker: Mutex::new(worker),
            scheduler,
            gate,
            store,
            index,
            events_tx,
            control_tx,
            broadcast,
            progress,
            ready,
            dispatcher,
        }
    }

    /// Receive every job event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.broadcast.subscribe()
    }

    /// Job events as a stream. Events missed by a lagging consumer are skipped.
    pub fn events(&self) -> impl Stream<Item = JobEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|event| {
            futures::future::ready(match event {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Event subscriber lagging");
                    None
                }
            })
        })
    }

    /// Fires with the collection name once the first original page of the current job is stored.
    pub fn ready(&self) -> watch::Receiver<Option<String>> {
        self.ready.subscribe()
    }

    /// Start an alignment job. Fails fast if another job holds the gate.
    pub async fn start(&self, job: AlignmentJob) -> Result<(), ClientError> {
        storage::validate_name(&job.name).map_err(|e| ClientError::invalid(e.to_string()))?;

        let guard = self.acquire(&job.name)?;
        tracing::info!(
            collection = %job.name,
            orig = job.orig_imgs.len(),
            transl = job.transl_imgs.len(),
            "Submitting alignment"
        );
        let name = job.name.clone();
        self.arm_ready(&name).await?;
        self.progress.start(&name).await;
        self.submit(&name, Command::Start(job), guard).await
    }

    /// Store finished pages for a collection without running the engine.
    pub async fn direct_import(
        &self,
        name: &str,
        orig_imgs: Vec<InputImage>,
        transl_imgs: Vec<InputImage>,
    ) -> Result<(), ClientError> {
        storage::validate_name(name).map_err(|e| ClientError::invalid(e.to_string()))?;

        let guard = self.acquire(name)?;
        self.progress.start(name).await;
        let command = Command::DirectImport {
            name: name.to_string(),
            orig_imgs,
            transl_imgs,
        };
        self.submit(name, command, guard).await
    }

    /// Ask the worker to stop after the current job.
    pub async fn exit(&self) -> Result<(), ClientError> {
        self.dispatch(Command::Exit, None).await
    }

    /// Whether the worker still accepts commands.
    pub async fn is_running(&self) -> bool {
        !self.worker.lock().await.tx.is_closed()
    }

    /// Collection of the running job, if any.
    pub fn in_progress(&self) -> Option<String> {
        self.gate.current()
    }

    pub async fn progress(&self, collection: &str) -> Option<ImportProgress> {
        self.progress.get(collection).await
    }

    pub fn collections(&self) -> Vec<String> {
        self.index.collection_names()
    }

    /// Delete a collection's pages and index entries.
    ///
    /// A job running for this collection is aborted first; the worker is
    /// replaced by a fresh one.
    pub async fn delete_collection(&self, collection: &str) -> Result<(), ClientError> {
        storage::validate_name(collection).map_err(|e| ClientError::invalid(e.to_string()))?;

        let mut worker = self.worker.lock().await;
        if self.gate.current().as_deref() == Some(collection) {
            tracing::warn!(collection = %collection, "Aborting running alignment for deletion");
            worker.terminate().await;
            self.gate.release();
            *worker = WorkerHandle::spawn(
                Arc::clone(&self.scheduler),
                self.events_tx.clone(),
                Arc::clone(&self.index),
            );
        }

        self.store.delete_collection(collection).await?;

        // Routed through the dispatcher so events still queued from an aborted job
        // cannot recreate the entries afterwards.
        let (done, forgotten) = oneshot::channel();
        self.control_tx
            .send(Control::Forget {
                collection: collection.to_string(),
                done,
            })
            .await
            .map_err(|_| ClientError::internal("event dispatcher stopped"))?;
        forgotten
            .await
            .map_err(|_| ClientError::internal("event dispatcher stopped"))??;

        tracing::info!(collection = %collection, "Collection deleted");
        Ok(())
    }

    /// Stop the worker, dropping any job in flight.
    pub async fn shutdown(&self) {
        self.worker.lock().await.terminate().await;
    }

    fn acquire(&self, collection: &str) -> Result<GateGuard, ClientError> {
        self.gate.acquire(collection).ok_or_else(|| {
            let running = self.gate.current().unwrap_or_default();
            tracing::warn!(requested = %collection, running = %running, "Alignment already in progress");
            ClientError::AlreadyInProgress {
                collection: running,
            }
        })
    }

    /// Reset the ready signal to fire on the first original page of `collection`.
    ///
    /// Goes through the dispatcher so late events of the previous job are
    /// handled before the reset.
    async fn arm_ready(&self, collection: &str) -> Result<(), ClientError> {
        let (done, armed) = oneshot::channel();
        self.control_tx
            .send(Control::Arm {
                collection: collection.to_string(),
                done,
            })
            .await
            .map_err(|_| ClientError::internal("event dispatcher stopped"))?;
        armed
            .await
            .map_err(|_| ClientError::internal("event dispatcher stopped"))
    }

    /// Dispatch a gated job; forget its progress entry if the worker is gone.
    async fn submit(&self, name: &str, command: Command, guard: GateGuard) -> Result<(), ClientError> {
        let result = self.dispatch(command, Some(guard)).await;
        if result.is_err() {
            self.progress.remove(name).await;
        }
        result
    }

    async fn dispatch(&self, command: Command, guard: Option<GateGuard>) -> Result<(), ClientError> {
        let tx = self.worker.lock().await.tx.clone();
        tx.send(Dispatch { command, guard })
            .await
            .map_err(|_| ClientError::WorkerStopped)
    }
}

impl Drop for ImportJobClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Requests handled by the event dispatcher after all queued events.
enum Control {
    /// Clear the ready signal and wait for the first original page of `collection`
    Arm {
        collection: String,
        done: oneshot::Sender<()>,
    },
    /// Drop a deleted collection's index entries and progress
    Forget {
        collection: String,
        done: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Forward worker events to subscribers, keeping progress and the collection index current.
async fn dispatch_events(
    mut rx: mpsc::Receiver<JobEvent>,
    mut control_rx: mpsc::Receiver<Control>,
    broadcast: broadcast::Sender<JobEvent>,
    progress: ProgressTracker,
    index: Arc<KeyValueStore>,
    ready: Arc<watch::Sender<Option<String>>>,
) {
    let mut armed: Option<String> = None;
    loop {
        tokio::select! {
            biased;

            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                progress.apply(&event).await;

                if let JobEvent::OrigWritten(p) = &event {
                    if let Err(e) = index.set_page_count(&p.collection_name, p.count) {
                        tracing::warn!(collection = %p.collection_name, error = %e, "Failed to record page count");
                    }
                    if armed.as_deref() == Some(p.collection_name.as_str()) {
                        armed = None;
                        ready.send_replace(Some(p.collection_name.clone()));
                    }
                }

                // No subscribers is fine
                let _ = broadcast.send(event);
            }

            Some(control) = control_rx.recv() => match control {
                Control::Arm { collection, done } => {
                    ready.send_replace(None);
                    armed = Some(collection);
                    let _ = done.send(());
                }
                Control::Forget { collection, done } => {
                    progress.remove(&collection).await;
                    let _ = done.send(index.remove_collection(&collection));
                }
            },
        }
    }

    tracing::debug!("Event dispatcher stopped");
}
