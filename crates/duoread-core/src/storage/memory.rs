//! In-memory page store with a logical clock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    info_file_name, input_key, page_file_name, parse_page_index, validate_name, OutputPage,
    PageStore, SyncDirection, Timestamp,
};
use crate::error::StoreError;
use crate::types::{InputImage, StreamKind};

#[derive(Debug, Clone)]
struct StoredFile {
    content: Bytes,
    modified: Timestamp,
}

/// Files of one area, keyed by file name.
type Area = BTreeMap<String, StoredFile>;

#[derive(Debug, Default)]
struct Collection {
    areas: HashMap<&'static str, Area>,
}

/// Page store kept entirely in memory.
///
/// Every write and every [`PageStore::now`] call advances a logical clock, so
/// timestamps are strictly ordered. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    collections: Mutex<HashMap<String, Collection>>,
    clock: AtomicU64,
    syncs: AtomicUsize,
    refreshes: AtomicUsize,
    failing_syncs: AtomicU32,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` durable syncs fail.
    pub fn fail_next_syncs(&self, count: u32) {
        self.failing_syncs.store(count, Ordering::SeqCst);
    }

    /// Number of successful durable syncs so far.
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Number of [`SyncDirection::FromDurable`] refreshes so far.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// File names currently stored in an area, sorted.
    pub fn file_names(&self, collection: &str, area: &str) -> Vec<String> {
        let collections = self.lock();
        collections
            .get(collection)
            .and_then(|c| c.areas.get(area))
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn tick(&self) -> Timestamp {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Collection>> {
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against an area of an opened collection.
    fn with_area<R>(
        &self,
        collection: &str,
        area: &'static str,
        f: impl FnOnce(&mut Area) -> R,
    ) -> Result<R, StoreError> {
        let mut collections = self.lock();
        let files = collections
            .get_mut(collection)
            .and_then(|c| c.areas.get_mut(area))
            .ok_or_else(|| StoreError::NotOpen(collection.to_string()))?;
        Ok(f(files))
    }

    fn put(&self, collection: &str, area: &'static str, name: String, content: Bytes) -> Result<(), StoreError> {
        let modified = self.tick();
        self.with_area(collection, area, |files| {
            files.insert(name, StoredFile { content, modified });
        })
    }
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn open(&self, collection: &str) -> Result<(), StoreError> {
        validate_name(collection)?;
        let mut collections = self.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        for stream in StreamKind::ALL {
            entry.areas.entry(stream.input_area()).or_default();
            entry.areas.entry(stream.output_area()).or_default();
        }
        Ok(())
    }

    async fn write_input(
        &self,
        collection: &str,
        stream: StreamKind,
        index: usize,
        image: &InputImage,
    ) -> Result<(), StoreError> {
        self.put(
            collection,
            stream.input_area(),
            input_key(index, image),
            image.content.clone(),
        )
    }

    async fn delete_input_area(
        &self,
        collection: &str,
        stream: StreamKind,
    ) -> Result<(), StoreError> {
        self.with_area(collection, stream.input_area(), |files| files.clear())
    }

    async fn write_page(
        &self,
        collection: &str,
        stream: StreamKind,
        page: &OutputPage,
    ) -> Result<(), StoreError> {
        let info = format!("{}:{}\n", page.width, page.height);
        self.put(
            collection,
            stream.output_area(),
            info_file_name(page.index),
            Bytes::from(info),
        )?;
        self.put(
            collection,
            stream.output_area(),
            page_file_name(page.index),
            page.png.clone(),
        )
    }

    async fn write_output_file(
        &self,
        collection: &str,
        stream: StreamKind,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        validate_name(file_name)?;
        self.put(
            collection,
            stream.output_area(),
            file_name.to_string(),
            Bytes::copy_from_slice(content),
        )
    }

    async fn read_page(
        &self,
        collection: &str,
        stream: StreamKind,
        index: usize,
    ) -> Result<Bytes, StoreError> {
        self.with_area(collection, stream.output_area(), |files| {
            files.get(&page_file_name(index)).map(|f| f.content.clone())
        })?
        .ok_or_else(|| StoreError::MissingPage {
            collection: collection.to_string(),
            stream,
            index,
        })
    }

    async fn list_output_indices(
        &self,
        collection: &str,
        stream: StreamKind,
    ) -> Result<BTreeSet<usize>, StoreError> {
        self.with_area(collection, stream.output_area(), |files| {
            files.keys().filter_map(|name| parse_page_index(name)).collect()
        })
    }

    async fn stat_time(
        &self,
        collection: &str,
        stream: StreamKind,
        index: usize,
    ) -> Result<Timestamp, StoreError> {
        self.with_area(collection, stream.output_area(), |files| {
            files.get(&page_file_name(index)).map(|f| f.modified)
        })?
        .ok_or_else(|| StoreError::MissingPage {
            collection: collection.to_string(),
            stream,
            index,
        })
    }

    async fn sync(&self, direction: SyncDirection) -> Result<(), StoreError> {
        if direction == SyncDirection::FromDurable {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        let failing = self
            .failing_syncs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Sync {
                direction,
                reason: "injected failure".to_string(),
            });
        }
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.lock().remove(collection);
        Ok(())
    }

    fn now(&self) -> Timestamp {
        self.tick()
    }
}
