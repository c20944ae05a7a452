//! Progress summaries for import jobs, derived from the event stream.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::types::{JobEvent, ProgressEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Running,
    Done,
    Failed { error: String },
}

/// What a UI shows for one collection's import.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub collection_name: String,
    /// Fraction of original inputs processed
    pub orig: f32,
    /// Fraction of translation inputs processed
    pub transl: f32,
    pub orig_pages: usize,
    pub transl_pages: usize,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportProgress {
    pub fn new(collection_name: String) -> Self {
        Self {
            collection_name,
            orig: 0.0,
            transl: 0.0,
            orig_pages: 0,
            transl_pages: 0,
            state: JobState::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == JobState::Running
    }

    fn finish(&mut self, state: JobState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

fn fraction(progress: &ProgressEvent) -> f32 {
    if progress.progress_max == 0 {
        return 1.0;
    }
    progress.progress_index as f32 / progress.progress_max as f32
}

/// Tracks progress for all collections.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    collections: Arc<RwLock<HashMap<String, ImportProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a job, replacing any earlier summary for the collection.
    pub async fn start(&self, collection: &str) {
        self.collections.write().await.insert(
            collection.to_string(),
            ImportProgress::new(collection.to_string()),
        );
    }

    /// Apply a job event.
    pub async fn apply(&self, event: &JobEvent) {
        let mut collections = self.collections.write().await;
        let progress = collections
            .entry(event.collection_name().to_string())
            .or_insert_with(|| ImportProgress::new(event.collection_name().to_string()));

        match event {
            JobEvent::OrigWritten(p) => {
                progress.orig = fraction(p);
                progress.orig_pages = p.count;
            }
            JobEvent::TranslWritten(p) => {
                progress.transl = fraction(p);
                progress.transl_pages = p.count;
            }
            JobEvent::Done { .. } => {
                progress.orig = 1.0;
                progress.transl = 1.0;
                progress.finish(JobState::Done);
            }
            JobEvent::Failed { error, .. } => {
                progress.finish(JobState::Failed {
                    error: error.clone(),
                });
            }
        }
    }

    /// Get progress for a collection.
    pub async fn get(&self, collection: &str) -> Option<ImportProgress> {
        self.collections.read().await.get(collection).cloned()
    }

    /// Get progress for all running jobs.
    pub async fn get_all_active(&self) -> Vec<ImportProgress> {
        self.collections
            .read()
            .await
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect()
    }

    /// Remove a collection from tracking.
    pub async fn remove(&self, collection: &str) {
        self.collections.write().await.remove(collection);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::jobs::Cursors;
    use crate::types::StreamKind;

    fn written(stream: StreamKind, index: usize, max: usize, count: usize) -> JobEvent {
        JobEvent::written(
            stream,
            ProgressEvent {
                collection_name: "c".to_string(),
                count,
                progress_index: index,
                progress_max: max,
                new_indexes: BTreeSet::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_fractions_follow_events() {
        let tracker = ProgressTracker::new();
        tracker.start("c").await;

        tracker.apply(&written(StreamKind::Orig, 1, 4, 2)).await;
        tracker.apply(&written(StreamKind::Transl, 1, 2, 1)).await;

        let progress = tracker.get("c").await.unwrap();
        assert_eq!(progress.orig, 0.25);
        assert_eq!(progress.transl, 0.5);
        assert_eq!(progress.orig_pages, 2);
        assert!(progress.is_active());
        assert_eq!(tracker.get_all_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_events() {
        let tracker = ProgressTracker::new();
        tracker.start("c").await;
        tracker
            .apply(&JobEvent::Failed {
                collection_name: "c".to_string(),
                stream: Some(StreamKind::Orig),
                index: Some(1),
                error: "boom".to_string(),
                cursors: Cursors::default(),
            })
            .await;

        let progress = tracker.get("c").await.unwrap();
        assert_eq!(
            progress.state,
            JobState::Failed {
                error: "boom".to_string()
            }
        );
        assert!(progress.finished_at.is_some());
        assert!(tracker.get_all_active().await.is_empty());

        tracker.start("c").await;
        tracker
            .apply(&JobEvent::Done {
                collection_name: "c".to_string(),
            })
            .await;
        let progress = tracker.get("c").await.unwrap();
        assert_eq!(progress.state, JobState::Done);
        assert_eq!(progress.transl, 1.0);

        tracker.remove("c").await;
        assert!(tracker.get("c").await.is_none());
    }
}
