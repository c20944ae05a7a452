//! Alignment worker task.
//!
//! Commands arrive on an mpsc channel and run one at a time. The gate guard
//! travels with the command and is released before the terminal event goes
//! out, so a listener reacting to Done/Failed can start the next job.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::scheduler::AlignmentScheduler;
use super::types::{Command, Cursors, JobEvent};
use crate::gate::GateGuard;
use crate::kv::KeyValueStore;

/// Queued commands per worker.
const COMMAND_BUFFER: usize = 16;

/// A command plus the gate it runs under.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub command: Command,
    pub guard: Option<GateGuard>,
}

/// Handle to a running worker task.
pub(crate) struct WorkerHandle {
    pub tx: mpsc::Sender<Dispatch>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(
        scheduler: Arc<AlignmentScheduler>,
        events_tx: mpsc::Sender<JobEvent>,
        index: Arc<KeyValueStore>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(scheduler, rx, events_tx, index, cancel.clone()));
        Self {
            tx,
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the worker, dropping any job in flight, and wait for the task to end.
    pub async fn terminate(&mut self) {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "Alignment worker panicked");
            }
        }
    }
}

async fn run(
    scheduler: Arc<AlignmentScheduler>,
    mut rx: mpsc::Receiver<Dispatch>,
    events_tx: mpsc::Sender<JobEvent>,
    index: Arc<KeyValueStore>,
    cancel: CancellationToken,
) {
    loop {
        let dispatch = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Alignment worker cancelled");
                break;
            }

            dispatch = rx.recv() => {
                let Some(dispatch) = dispatch else {
                    tracing::debug!("Alignment worker shutting down - channel closed");
                    break;
                };
                dispatch
            }
        };

        let Dispatch { command, guard } = dispatch;
        let job_id = Uuid::new_v4();

        let work = async {
            match command {
                Command::Start(job) => {
                    let span = tracing::info_span!("alignment", job = %job_id, collection = %job.name);
                    let event = match scheduler.run(&job, &events_tx).instrument(span).await {
                        Ok(_) => JobEvent::Done {
                            collection_name: job.name,
                        },
                        Err(failure) => {
                            let point = failure.error.failure_point();
                            JobEvent::Failed {
                                collection_name: job.name,
                                stream: point.map(|(stream, _)| stream),
                                index: point.map(|(_, index)| index),
                                error: failure.error.to_string(),
                                cursors: failure.cursors,
                            }
                        }
                    };
                    Some(event)
                }
                Command::DirectImport {
                    name,
                    orig_imgs,
                    transl_imgs,
                } => {
                    let span = tracing::info_span!("direct_import", job = %job_id, collection = %name);
                    let result = scheduler
                        .direct_import(&name, &orig_imgs, &transl_imgs)
                        .instrument(span)
                        .await;
                    let event = match result {
                        Ok(count) => {
                            if let Err(e) = index.set_page_count(&name, count) {
                                tracing::warn!(collection = %name, error = %e, "Failed to record page count");
                            }
                            JobEvent::Done {
                                collection_name: name,
                            }
                        }
                        Err(e) => {
                            tracing::error!(collection = %name, error = %e, "Direct import failed");
                            JobEvent::Failed {
                                collection_name: name,
                                stream: None,
                                index: None,
                                error: e.to_string(),
                                cursors: Cursors::default(),
                            }
                        }
                    };
                    Some(event)
                }
                Command::Exit => None,
            }
        };

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::warn!(job = %job_id, "Job aborted");
                break;
            }

            outcome = work => outcome,
        };

        if let Some(guard) = guard {
            guard.release();
        }

        let Some(event) = outcome else {
            tracing::info!("Alignment worker exiting");
            break;
        };
        if events_tx.send(event).await.is_err() {
            tracing::warn!("Failed to send job event - channel closed");
            break;
        }
    }

    tracing::debug!("Alignment worker stopped");
}
