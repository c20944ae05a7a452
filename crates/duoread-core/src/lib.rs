//! Duoread Core - alignment and import of paired page collections
//!
//! This crate contains the core functionality for duoread, including:
//! - Page storage per collection (filesystem and in-memory)
//! - The reference image page engine
//! - The interleaved original/translation alignment scheduler
//! - The job gate and the worker-backed import client
//! - Persistent markers and the collection index

pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod jobs;
pub mod kv;
pub mod ordering;
pub mod storage;
pub mod types;

use std::sync::Arc;

pub use config::{Config, Settings};
pub use engine::{ImagePageEngine, PageEngine};
pub use error::{ClientError, EngineError, JobError, StoreError};
pub use gate::JobGate;
pub use jobs::{AlignmentJob, AlignmentScheduler, ImportJobClient, JobEvent, SchedulerConfig};
pub use kv::KeyValueStore;
pub use storage::{FsPageStore, MemoryPageStore, PageStore};
pub use types::{InputImage, StreamKind, StreamSettings};

/// Application state shared by the front end
pub struct AppState {
    pub config: Config,
    pub settings: Settings,
    /// Markers and the collection index
    pub markers: Arc<KeyValueStore>,
    pub gate: Arc<JobGate>,
    pub store: Arc<dyn PageStore>,
    pub client: ImportJobClient,
}

impl AppState {
    /// Wire up storage, the gate and the worker from a configuration.
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.ensure_dirs()?;
        let settings = Settings::load(&config.settings_path);
        let store: Arc<dyn PageStore> = Arc::new(FsPageStore::new(&config.pages_dir));
        Ok(Self::with_store(config, settings, store))
    }

    pub fn with_store(config: Config, settings: Settings, store: Arc<dyn PageStore>) -> Self {
        let markers = Arc::new(KeyValueStore::open(&config.state_path));
        let gate = Arc::new(JobGate::new(Arc::clone(&markers)));

        let engine = engine::shared(ImagePageEngine::new(settings.search_range));
        let scheduler = AlignmentScheduler::new(
            Arc::clone(&store),
            engine,
            SchedulerConfig::from(&settings),
        );
        let client = ImportJobClient::new(
            scheduler,
            Arc::clone(&gate),
            Arc::clone(&store),
            Arc::clone(&markers),
            settings.event_buffer,
        );

        tracing::debug!(data_dir = %config.data_dir.display(), "Application state ready");

        Self {
            config,
            settings,
            markers,
            gate,
            store,
            client,
        }
    }
}
