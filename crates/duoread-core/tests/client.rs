use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duoread_core::engine::{self, EngineInput};
use duoread_core::jobs::{JobState, ProgressEvent};
use duoread_core::storage::OutputPage;
use duoread_core::{
    AlignmentJob, AlignmentScheduler, ClientError, EngineError, ImagePageEngine, ImportJobClient,
    InputImage, JobEvent, JobGate, KeyValueStore, MemoryPageStore, PageEngine, PageStore,
    SchedulerConfig, StreamKind, StreamSettings,
};
use futures::{Stream, StreamExt};
use image::{ImageFormat, Rgb, RgbImage};

/// One page per input, optionally slow or failing.
struct TestEngine {
    delay: Duration,
    fail_on: Option<(StreamKind, usize)>,
    next: [usize; 2],
}

impl TestEngine {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_on: None,
            next: [0, 0],
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }
}

impl PageEngine for TestEngine {
    fn reset(&mut self) {
        self.next = [0, 0];
    }

    fn process(
        &mut self,
        input: &EngineInput,
        _settings: &StreamSettings,
    ) -> Result<Vec<OutputPage>, EngineError> {
        std::thread::sleep(self.delay);
        if self.fail_on == Some((input.stream, input.index)) {
            return Err(EngineError::Processing("unreadable page".to_string()));
        }
        let slot = match input.stream {
            StreamKind::Orig => 0,
            StreamKind::Transl => 1,
        };
        let index = self.next[slot];
        self.next[slot] += 1;
        Ok(vec![OutputPage {
            index,
            width: input.width,
            height: input.height,
            png: Bytes::from_static(b"png"),
        }])
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([30, 60, 90]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn job(name: &str, orig: usize, transl: usize) -> AlignmentJob {
    let images = |prefix: &str, n: usize| {
        (0..n)
            .map(|i| InputImage::new(format!("{prefix}-{i}.png"), png(6, 9)))
            .collect()
    };
    AlignmentJob {
        name: name.to_string(),
        orig_imgs: images("orig", orig),
        orig_settings: StreamSettings::default(),
        transl_imgs: images("transl", transl),
        transl_settings: StreamSettings::translation(),
    }
}

struct Harness {
    client: ImportJobClient,
    store: Arc<MemoryPageStore>,
    markers: Arc<KeyValueStore>,
}

fn harness(engine: impl PageEngine + 'static) -> Harness {
    let store = Arc::new(MemoryPageStore::new());
    let markers = Arc::new(KeyValueStore::in_memory());
    let gate = Arc::new(JobGate::new(markers.clone()));
    let scheduler = AlignmentScheduler::new(
        store.clone(),
        engine::shared(engine),
        SchedulerConfig::default(),
    );
    let client = ImportJobClient::new(scheduler, gate, store.clone(), markers.clone(), 64);
    Harness {
        client,
        store,
        markers,
    }
}

/// Collect events up to and including the next terminal one.
async fn until_terminal(events: &mut (impl Stream<Item = JobEvent> + Unpin)) -> Vec<JobEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.next())
            .await
            .expect("timed out waiting for job events")
            .expect("event stream closed");
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

fn progress_of(events: &[JobEvent], stream: StreamKind) -> Vec<&ProgressEvent> {
    events
        .iter()
        .filter_map(|e| match (e, stream) {
            (JobEvent::OrigWritten(p), StreamKind::Orig) => Some(p),
            (JobEvent::TranslWritten(p), StreamKind::Transl) => Some(p),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_alignment_with_image_engine() {
    let h = harness(ImagePageEngine::new(10));
    let mut events = Box::pin(h.client.events());
    let ready = h.client.ready();

    h.client.start(job("manga", 3, 2)).await.unwrap();
    let seen = until_terminal(&mut events).await;

    let orig = progress_of(&seen, StreamKind::Orig);
    let transl = progress_of(&seen, StreamKind::Transl);
    assert_eq!(orig.len(), 3);
    assert_eq!(transl.len(), 2);
    assert_eq!(orig[2].count, 3);
    assert_eq!(transl[1].new_indexes.iter().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(
        seen.last(),
        Some(&JobEvent::Done {
            collection_name: "manga".to_string()
        })
    );

    assert_eq!(h.client.in_progress(), None);
    assert_eq!(h.markers.page_count("manga"), Some(3));
    assert_eq!(h.client.collections(), vec!["manga".to_string()]);
    assert_eq!(ready.borrow().as_deref(), Some("manga"));

    let progress = h.client.progress("manga").await.unwrap();
    assert_eq!(progress.state, JobState::Done);
    assert_eq!(progress.orig_pages, 3);

    let page = h.store.read_page("manga", StreamKind::Transl, 0).await.unwrap();
    assert!(page.starts_with(b"\x89PNG"));
    assert!(h.store.file_names("manga", "in_orig").is_empty());
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let h = harness(TestEngine::slow(Duration::from_millis(30)));
    let mut events = Box::pin(h.client.events());

    h.client.start(job("foo", 4, 0)).await.unwrap();
    assert_eq!(h.client.in_progress().as_deref(), Some("foo"));

    for name in ["foo", "bar"] {
        let err = h.client.start(job(name, 1, 0)).await.unwrap_err();
        assert_eq!(
            err,
            ClientError::AlreadyInProgress {
                collection: "foo".to_string()
            }
        );
    }

    until_terminal(&mut events).await;
    h.client.start(job("bar", 1, 0)).await.unwrap();
    let seen = until_terminal(&mut events).await;
    assert_eq!(seen.last().unwrap().collection_name(), "bar");
}

#[tokio::test]
async fn test_engine_failure_is_reported_and_frees_gate() {
    let mut engine = TestEngine::new();
    engine.fail_on = Some((StreamKind::Orig, 1));
    let h = harness(engine);
    let mut events = Box::pin(h.client.events());

    h.client.start(job("broken", 3, 1)).await.unwrap();
    let seen = until_terminal(&mut events).await;

    match seen.last().unwrap() {
        JobEvent::Failed {
            stream,
            index,
            cursors,
            error,
            ..
        } => {
            assert_eq!(*stream, Some(StreamKind::Orig));
            assert_eq!(*index, Some(1));
            assert_eq!(cursors.in_orig, 1);
            assert!(error.contains("unreadable page"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.client.in_progress(), None);
    assert!(matches!(
        h.client.progress("broken").await.unwrap().state,
        JobState::Failed { .. }
    ));

    // The collection can be retried right away
    h.client.start(job("broken", 1, 0)).await.unwrap();
}

#[tokio::test]
async fn test_direct_import_records_page_count() {
    let h = harness(TestEngine::new());
    let mut events = Box::pin(h.client.events());

    let orig = vec![
        InputImage::new("1000001.png", png(2, 3)),
        InputImage::new("1000002.png", png(2, 3)),
    ];
    let transl = vec![InputImage::new("1000001.png", png(2, 3))];
    h.client
        .direct_import("restored", orig, transl)
        .await
        .unwrap();

    let seen = until_terminal(&mut events).await;
    assert_eq!(
        seen,
        vec![JobEvent::Done {
            collection_name: "restored".to_string()
        }]
    );
    assert_eq!(h.markers.page_count("restored"), Some(2));
    assert_eq!(
        h.store
            .list_output_indices("restored", StreamKind::Transl)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_invalid_requests() {
    let h = harness(TestEngine::new());

    let err = h.client.start(job("", 1, 0)).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidRequest { .. }));

    let err = h.client.start(job("../escape", 1, 0)).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidRequest { .. }));

    assert_eq!(h.client.in_progress(), None);
}

#[tokio::test]
async fn test_translations_only_job_runs() {
    let h = harness(TestEngine::new());
    let mut events = Box::pin(h.client.events());

    h.client.start(job("transl-only", 0, 2)).await.unwrap();
    let seen = until_terminal(&mut events).await;

    assert!(progress_of(&seen, StreamKind::Orig).is_empty());
    assert_eq!(progress_of(&seen, StreamKind::Transl).len(), 2);
    assert!(matches!(seen.last(), Some(JobEvent::Done { .. })));
    assert_eq!(h.client.in_progress(), None);
}

#[tokio::test]
async fn test_exit_stops_worker() {
    let h = harness(TestEngine::new());
    h.client.exit().await.unwrap();

    for _ in 0..100 {
        if !h.client.is_running().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!h.client.is_running().await);

    let err = h.client.start(job("late", 1, 0)).await.unwrap_err();
    assert_eq!(err, ClientError::WorkerStopped);
    assert_eq!(h.client.in_progress(), None);
    assert!(h.client.progress("late").await.is_none());
}

#[tokio::test]
async fn test_delete_aborts_running_job() {
    let h = harness(TestEngine::slow(Duration::from_millis(20)));
    let mut events = Box::pin(h.client.events());

    h.client.start(job("doomed", 40, 0)).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(10), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, JobEvent::OrigWritten(_)));

    h.client.delete_collection("doomed").await.unwrap();
    assert_eq!(h.client.in_progress(), None);
    assert!(h.markers.page_count("doomed").is_none());
    assert!(h.client.progress("doomed").await.is_none());

    // A fresh worker picks up new jobs
    h.client.start(job("next", 1, 0)).await.unwrap();
    let seen = until_terminal(&mut events).await;
    assert_eq!(
        seen.last(),
        Some(&JobEvent::Done {
            collection_name: "next".to_string()
        })
    );
    assert!(h.client.collections().contains(&"next".to_string()));
}
