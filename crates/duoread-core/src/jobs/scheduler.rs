//! Interleaved two-stream alignment.
//!
//! One job walks both input sequences one image at a time. Each step runs the
//! page engine on a single image, commits the returned pages, syncs the store
//! and reports which output indices changed. The next stream is chosen so that
//! original output never gets more than `search_range` pages ahead of
//! translation output while translation input is pending.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::types::{AlignmentJob, Cursors, JobEvent, ProgressEvent};
use crate::config::Settings;
use crate::engine::{self, EngineInput, SharedEngine};
use crate::error::{EngineError, JobError, JobFailure, StoreError};
use crate::storage::{OutputPage, PageStore, SyncDirection, Timestamp};
use crate::types::{InputImage, StreamKind};

/// Scheduling and retry parameters.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub search_range: usize,
    /// Extra sync attempts before a step fails
    pub sync_retries: u32,
    pub sync_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SchedulerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            search_range: settings.search_range,
            sync_retries: settings.sync_retries,
            sync_backoff: settings.sync_backoff(),
        }
    }
}

/// Pick the stream to advance next.
///
/// Originals go first while translation output is within `search_range` of
/// original output, or once translations are exhausted. `None` means neither
/// stream has pending input.
pub fn select_stream(
    cursors: &Cursors,
    orig_len: usize,
    transl_len: usize,
    search_range: usize,
) -> Option<StreamKind> {
    let transl_exhausted = cursors.in_transl >= transl_len;
    if (cursors.out_transl + search_range > cursors.out_orig || transl_exhausted)
        && cursors.in_orig < orig_len
    {
        Some(StreamKind::Orig)
    } else if !transl_exhausted {
        Some(StreamKind::Transl)
    } else {
        None
    }
}

/// Record a finished step: one more input consumed, output cursor raised to the
/// highest new index.
pub fn advance(cursors: &mut Cursors, stream: StreamKind, new_indexes: &BTreeSet<usize>) {
    let highest = new_indexes.last().copied();
    let (input, output) = match stream {
        StreamKind::Orig => (&mut cursors.in_orig, &mut cursors.out_orig),
        StreamKind::Transl => (&mut cursors.in_transl, &mut cursors.out_transl),
    };
    *input += 1;
    if let Some(highest) = highest {
        *output = (*output).max(highest);
    }
}

/// Runs alignment and direct-import jobs against one store and engine.
///
/// Callers must hold the [`JobGate`](crate::gate::JobGate) for the collection.
pub struct AlignmentScheduler {
    store: Arc<dyn PageStore>,
    engine: SharedEngine,
    config: SchedulerConfig,
}

impl AlignmentScheduler {
    pub fn new(store: Arc<dyn PageStore>, engine: SharedEngine, config: SchedulerConfig) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    /// Run one alignment job to completion, sending a progress event after every step.
    ///
    /// Returns the final cursors. On failure the cursors are those of the last
    /// completed step. Staged inputs are removed either way; the terminal
    /// event is left to the caller.
    pub async fn run(
        &self,
        job: &AlignmentJob,
        events: &mpsc::Sender<JobEvent>,
    ) -> Result<Cursors, JobFailure> {
        let mut cursors = Cursors::default();
        let result = self.run_steps(job, events, &mut cursors).await;

        if let Err(e) = self.cleanup(&job.name).await {
            tracing::warn!(collection = %job.name, error = %e, "Failed to remove staged inputs");
        }

        match result {
            Ok(()) => {
                tracing::info!(
                    collection = %job.name,
                    orig = cursors.in_orig,
                    transl = cursors.in_transl,
                    "Alignment finished"
                );
                Ok(cursors)
            }
            Err(error) => {
                tracing::error!(collection = %job.name, cursors = ?cursors, error = %error, "Alignment failed");
                Err(JobFailure { error, cursors })
            }
        }
    }

    async fn run_steps(
        &self,
        job: &AlignmentJob,
        events: &mpsc::Sender<JobEvent>,
        cursors: &mut Cursors,
    ) -> Result<(), JobError> {
        self.prepare(job).await?;

        let orig_len = job.orig_imgs.len();
        let transl_len = job.transl_imgs.len();
        tracing::info!(
            collection = %job.name,
            orig_len,
            transl_len,
            search_range = self.config.search_range,
            "Alignment started"
        );

        while cursors.in_orig < orig_len || cursors.in_transl < transl_len {
            let Some(stream) =
                select_stream(cursors, orig_len, transl_len, self.config.search_range)
            else {
                tracing::error!(cursors = ?cursors, "No stream selectable with input pending");
                return Err(JobError::Inconsistent(*cursors));
            };

            let new_indexes = self.step(job, stream, cursors, events).await?;
            advance(cursors, stream, &new_indexes);
        }

        Ok(())
    }

    /// Clear staging, stage both input sequences and reset the engine.
    async fn prepare(&self, job: &AlignmentJob) -> Result<(), JobError> {
        self.store.open(&job.name).await?;
        self.store.sync(SyncDirection::FromDurable).await?;

        for stream in StreamKind::ALL {
            self.store.delete_input_area(&job.name, stream).await?;
            for (index, image) in job.inputs(stream).iter().enumerate() {
                self.store
                    .write_input(&job.name, stream, index, image)
                    .await?;
            }
        }
        self.sync_durable().await?;

        self.reset_engine().await.map_err(JobError::Reset)
    }

    /// Reset the engine on a blocking thread; an aborted job may still hold the lock.
    async fn reset_engine(&self) -> Result<(), EngineError> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            engine
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .reset();
            engine.clear_poison();
        })
        .await
        .map_err(|e| EngineError::Processing(format!("page engine panicked: {e}")))
    }

    /// Process the next input of `stream` and emit its progress event.
    async fn step(
        &self,
        job: &AlignmentJob,
        stream: StreamKind,
        cursors: &Cursors,
        events: &mpsc::Sender<JobEvent>,
    ) -> Result<BTreeSet<usize>, JobError> {
        let index = cursors.input(stream);
        let inputs = job.inputs(stream);
        let image = &inputs[index];

        let (width, height) =
            engine::image_dimensions(&image.content).map_err(|source| JobError::Decode {
                stream,
                index,
                name: image.name.clone(),
                source,
            })?;

        let step_start = self.store.now();
        let before = self.store.list_output_indices(&job.name, stream).await?;

        let pages = self
            .process(
                EngineInput {
                    stream,
                    index,
                    name: image.name.clone(),
                    bytes: image.content.clone(),
                    width,
                    height,
                },
                job,
            )
            .await
            .map_err(|source| JobError::Engine {
                stream,
                index,
                source,
            })?;

        for page in &pages {
            self.store.write_page(&job.name, stream, page).await?;
        }

        self.sync_durable()
            .await
            .map_err(|source| JobError::Sync {
                stream,
                index,
                source,
            })?;

        let after = self.store.list_output_indices(&job.name, stream).await?;
        let new_indexes = self
            .changed_since(&job.name, stream, &before, &after, step_start)
            .await?;

        tracing::debug!(
            stream = %stream,
            index,
            width,
            height,
            new_pages = new_indexes.len(),
            "Processed input image"
        );

        let event = JobEvent::written(
            stream,
            ProgressEvent {
                collection_name: job.name.clone(),
                count: after.len(),
                progress_index: index + 1,
                progress_max: inputs.len(),
                new_indexes: new_indexes.clone(),
            },
        );
        if events.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped");
        }

        Ok(new_indexes)
    }

    /// Run the engine on a blocking thread.
    async fn process(
        &self,
        input: EngineInput,
        job: &AlignmentJob,
    ) -> Result<Vec<OutputPage>, EngineError> {
        let engine = Arc::clone(&self.engine);
        let settings = job.settings(input.stream).clone();

        tokio::task::spawn_blocking(move || {
            let mut engine = engine.lock().map_err(|_| EngineError::Poisoned)?;
            engine.process(&input, &settings)
        })
        .await
        .map_err(|e| EngineError::Processing(format!("page engine panicked: {e}")))?
    }

    /// Indices that appeared during the step or were rewritten after `step_start`.
    async fn changed_since(
        &self,
        collection: &str,
        stream: StreamKind,
        before: &BTreeSet<usize>,
        after: &BTreeSet<usize>,
        step_start: Timestamp,
    ) -> Result<BTreeSet<usize>, StoreError> {
        let mut changed: BTreeSet<usize> = after.difference(before).copied().collect();
        for &index in before.intersection(after) {
            if self.store.stat_time(collection, stream, index).await? > step_start {
                changed.insert(index);
            }
        }
        Ok(changed)
    }

    /// Sync to durable storage, retrying with linear backoff.
    async fn sync_durable(&self) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.sync(SyncDirection::ToDurable).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.sync_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Store sync failed, retrying");
                    tokio::time::sleep(self.config.sync_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn cleanup(&self, collection: &str) -> Result<(), StoreError> {
        for stream in StreamKind::ALL {
            self.store.delete_input_area(collection, stream).await?;
        }
        Ok(())
    }

    /// Store finished pages under their own file names in both output areas.
    ///
    /// Returns the number of original pages now stored.
    pub async fn direct_import(
        &self,
        collection: &str,
        orig_imgs: &[InputImage],
        transl_imgs: &[InputImage],
    ) -> Result<usize, JobError> {
        self.store.open(collection).await?;
        self.store.sync(SyncDirection::FromDurable).await?;

        for (stream, images) in [(StreamKind::Orig, orig_imgs), (StreamKind::Transl, transl_imgs)] {
            for image in images {
                self.store
                    .write_output_file(collection, stream, &image.name, &image.content)
                    .await?;
            }
        }
        self.sync_durable().await?;

        let count = self
            .store
            .list_output_indices(collection, StreamKind::Orig)
            .await?
            .len();
        tracing::info!(
            collection = %collection,
            orig = orig_imgs.len(),
            transl = transl_imgs.len(),
            "Direct import finished"
        );
        Ok(count)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedEngine;
    use super::*;
    use crate::engine::testing::png;
    use crate::storage::MemoryPageStore;
    use crate::types::StreamSettings;

    fn job(name: &str, orig: usize, transl: usize) -> AlignmentJob {
        let images = |prefix: &str, n: usize| {
            (0..n)
                .map(|i| InputImage::new(format!("{prefix}{i}.png"), png(4, 6)))
                .collect()
        };
        AlignmentJob {
            name: name.to_string(),
            orig_imgs: images("o", orig),
            orig_settings: StreamSettings::default(),
            transl_imgs: images("t", transl),
            transl_settings: StreamSettings::translation(),
        }
    }

    fn scheduler(
        store: Arc<MemoryPageStore>,
        engine: ScriptedEngine,
        search_range: usize,
    ) -> AlignmentScheduler {
        AlignmentScheduler::new(
            store,
            engine::shared(engine),
            SchedulerConfig {
                search_range,
                sync_retries: 2,
                sync_backoff: Duration::from_millis(1),
            },
        )
    }

    fn drain(rx: &mut mpsc::Receiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn progress(event: &JobEvent) -> (StreamKind, &ProgressEvent) {
        match event {
            JobEvent::OrigWritten(p) => (StreamKind::Orig, p),
            JobEvent::TranslWritten(p) => (StreamKind::Transl, p),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_select_stream_rule() {
        let c = |in_orig, out_orig, in_transl, out_transl| Cursors {
            in_orig,
            out_orig,
            in_transl,
            out_transl,
        };

        assert_eq!(select_stream(&c(0, 0, 0, 0), 3, 3, 10), Some(StreamKind::Orig));
        // Original output too far ahead
        assert_eq!(select_stream(&c(5, 12, 0, 2), 20, 3, 10), Some(StreamKind::Transl));
        assert_eq!(select_stream(&c(5, 11, 0, 2), 20, 3, 10), Some(StreamKind::Orig));
        // Translations exhausted
        assert_eq!(select_stream(&c(5, 40, 3, 2), 20, 3, 10), Some(StreamKind::Orig));
        // Originals exhausted
        assert_eq!(select_stream(&c(20, 0, 0, 0), 20, 3, 10), Some(StreamKind::Transl));
        assert_eq!(select_stream(&c(20, 19, 3, 2), 20, 3, 10), None);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut cursors = Cursors {
            out_orig: 5,
            ..Cursors::default()
        };
        advance(&mut cursors, StreamKind::Orig, &BTreeSet::from([2, 3]));
        assert_eq!((cursors.in_orig, cursors.out_orig), (1, 5));

        advance(&mut cursors, StreamKind::Orig, &BTreeSet::from([6, 7]));
        assert_eq!((cursors.in_orig, cursors.out_orig), (2, 7));

        advance(&mut cursors, StreamKind::Transl, &BTreeSet::new());
        assert_eq!((cursors.in_transl, cursors.out_transl), (1, 0));
    }

    #[tokio::test]
    async fn test_originals_only() {
        let store = Arc::new(MemoryPageStore::new());
        let scheduler = scheduler(store.clone(), ScriptedEngine::new(1), 10);
        let (tx, mut rx) = mpsc::channel(64);

        let cursors = scheduler.run(&job("c", 5, 0), &tx).await.unwrap();
        let events = drain(&mut rx);

        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            let (stream, p) = progress(event);
            assert_eq!(stream, StreamKind::Orig);
            assert_eq!(p.progress_index, i + 1);
            assert_eq!(p.progress_max, 5);
            assert_eq!(p.count, i + 1);
            assert_eq!(p.new_indexes, BTreeSet::from([i]));
        }
        assert_eq!(
            cursors,
            Cursors {
                in_orig: 5,
                out_orig: 4,
                in_transl: 0,
                out_transl: 0
            }
        );
        assert!(store.file_names("c", "in_orig").is_empty());
        assert_eq!(store.file_names("c", "out_orig").len(), 10);
    }

    #[tokio::test]
    async fn test_small_jobs_finish_originals_first() {
        let store = Arc::new(MemoryPageStore::new());
        let engine = ScriptedEngine::new(1);
        let calls = engine.calls.clone();
        let scheduler = scheduler(store, engine, 10);
        let (tx, mut rx) = mpsc::channel(64);

        let cursors = scheduler.run(&job("c", 3, 3), &tx).await.unwrap();

        use StreamKind::{Orig, Transl};
        assert_eq!(
            *calls.lock().unwrap(),
            vec![(Orig, 0), (Orig, 1), (Orig, 2), (Transl, 0), (Transl, 1), (Transl, 2)]
        );
        assert_eq!((cursors.in_orig, cursors.in_transl), (3, 3));
        assert_eq!(drain(&mut rx).len(), 6);
    }

    #[tokio::test]
    async fn test_narrow_search_range_interleaves() {
        let store = Arc::new(MemoryPageStore::new());
        let engine = ScriptedEngine::new(1);
        let calls = engine.calls.clone();
        let scheduler = scheduler(store, engine, 1);
        let (tx, _rx) = mpsc::channel(64);

        scheduler.run(&job("c", 3, 3), &tx).await.unwrap();

        let order: Vec<StreamKind> = calls.lock().unwrap().iter().map(|(s, _)| *s).collect();
        use StreamKind::{Orig, Transl};
        assert_eq!(order, vec![Orig, Orig, Transl, Transl, Orig, Transl]);
    }

    #[tokio::test]
    async fn test_progress_is_ordered_per_stream() {
        let store = Arc::new(MemoryPageStore::new());
        let scheduler = scheduler(store, ScriptedEngine::new(2), 2);
        let (tx, mut rx) = mpsc::channel(128);

        let cursors = scheduler.run(&job("c", 7, 6), &tx).await.unwrap();
        assert_eq!((cursors.in_orig, cursors.in_transl), (7, 6));

        let mut last = [0usize, 0usize];
        for event in drain(&mut rx) {
            let (stream, p) = progress(&event);
            let slot = &mut last[stream as usize];
            assert_eq!(p.progress_index, *slot + 1);
            assert_eq!(p.new_indexes.len(), 2);
            *slot = p.progress_index;
        }
        assert_eq!(last, [7, 6]);
    }

    #[tokio::test]
    async fn test_engine_failure_keeps_last_good_cursors() {
        let store = Arc::new(MemoryPageStore::new());
        let mut engine = ScriptedEngine::new(1);
        engine.fail_on = Some((StreamKind::Orig, 1));
        let scheduler = scheduler(store.clone(), engine, 10);
        let (tx, mut rx) = mpsc::channel(64);

        let failure = scheduler.run(&job("c", 4, 2), &tx).await.unwrap_err();

        assert_eq!(failure.error.failure_point(), Some((StreamKind::Orig, 1)));
        assert!(matches!(failure.error, JobError::Engine { .. }));
        assert_eq!(failure.cursors.in_orig, 1);
        assert_eq!(failure.cursors.in_transl, 0);
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(store.file_names("c", "in_orig").is_empty());
        assert!(store.file_names("c", "in_transl").is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_input_fails_before_engine() {
        let store = Arc::new(MemoryPageStore::new());
        let engine = ScriptedEngine::new(1);
        let calls = engine.calls.clone();
        let scheduler = scheduler(store, engine, 10);
        let (tx, mut rx) = mpsc::channel(64);

        let mut job = job("c", 2, 0);
        job.orig_imgs[0] = InputImage::new("broken.png", b"not an image".to_vec());

        let failure = scheduler.run(&job, &tx).await.unwrap_err();
        assert!(matches!(
            failure.error,
            JobError::Decode { stream: StreamKind::Orig, index: 0, .. }
        ));
        assert_eq!(failure.cursors, Cursors::default());
        assert!(calls.lock().unwrap().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_sync_retries_then_fails_step() {
        let store = Arc::new(MemoryPageStore::new());
        let mut engine = ScriptedEngine::new(1);
        engine.break_sync = Some((StreamKind::Orig, 1, store.clone()));
        let scheduler = scheduler(store.clone(), engine, 10);
        let (tx, mut rx) = mpsc::channel(64);

        let failure = scheduler.run(&job("c", 3, 0), &tx).await.unwrap_err();

        assert!(matches!(
            failure.error,
            JobError::Sync { stream: StreamKind::Orig, index: 1, .. }
        ));
        assert_eq!(failure.cursors.in_orig, 1);
        // The failed step's event is never sent
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_transient_sync_failure_is_retried() {
        let store = Arc::new(MemoryPageStore::new());
        store.fail_next_syncs(2);
        let scheduler = scheduler(store.clone(), ScriptedEngine::new(1), 10);
        let (tx, _rx) = mpsc::channel(64);

        let cursors = scheduler.run(&job("c", 2, 0), &tx).await.unwrap();
        assert_eq!(cursors.in_orig, 2);
        assert_eq!(store.sync_count(), 3);
    }

    #[tokio::test]
    async fn test_rewritten_pages_are_reported() {
        let store = Arc::new(MemoryPageStore::new());
        let mut engine = ScriptedEngine::new(1);
        engine.rewrite_first = true;
        let scheduler = scheduler(store, engine, 10);
        let (tx, mut rx) = mpsc::channel(64);

        scheduler.run(&job("c", 1, 2), &tx).await.unwrap();

        let transl: Vec<BTreeSet<usize>> = drain(&mut rx)
            .iter()
            .filter_map(|e| match e {
                JobEvent::TranslWritten(p) => Some(p.new_indexes.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(transl, vec![BTreeSet::from([0]), BTreeSet::from([0])]);
    }

    #[tokio::test]
    async fn test_direct_import_is_idempotent() {
        let store = Arc::new(MemoryPageStore::new());
        let scheduler = scheduler(store.clone(), ScriptedEngine::new(1), 10);
        let orig = vec![
            InputImage::new("1000001.png", png(2, 2)),
            InputImage::new("1000001.txt", b"2:2\n".to_vec()),
            InputImage::new("1000002.png", png(2, 2)),
        ];
        let transl = vec![InputImage::new("1000001.png", png(2, 2))];

        assert_eq!(scheduler.direct_import("c", &orig, &transl).await.unwrap(), 2);
        let first = store.file_names("c", "out_orig");
        assert_eq!(scheduler.direct_import("c", &orig, &transl).await.unwrap(), 2);

        assert_eq!(store.file_names("c", "out_orig"), first);
        assert_eq!(store.file_names("c", "out_transl"), vec!["1000001.png".to_string()]);
        assert_eq!(store.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_engine_reset_does_not_block_runtime() {
        let store = Arc::new(MemoryPageStore::new());
        let shared = engine::shared(ScriptedEngine::new(1));
        let scheduler = AlignmentScheduler::new(
            store.clone(),
            Arc::clone(&shared),
            SchedulerConfig::default(),
        );

        // Engine call still running for a job that was aborted
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = shared.lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(500));
        });
        locked_rx.recv().unwrap();

        let (tx, _rx) = mpsc::channel(64);
        let job = job("c", 1, 0);
        let run = tokio::spawn(async move { scheduler.run(&job, &tx).await });

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(300));

        assert_eq!(run.await.unwrap().unwrap().in_orig, 1);
        holder.join().unwrap();
        assert_eq!(store.refresh_count(), 1);
    }
}
