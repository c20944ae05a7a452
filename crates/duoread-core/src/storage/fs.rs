//! Filesystem-backed page store.

use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    info_file_name, input_key, page_file_name, parse_page_index, validate_name, OutputPage,
    PageStore, SyncDirection, Timestamp,
};
use crate::error::StoreError;
use crate::types::{InputImage, StreamKind};

/// Stores every collection as a directory under `root`.
///
/// Writes land in the OS page cache and are fsynced on
/// [`SyncDirection::ToDurable`]. Modification times of files written through
/// this handle are journaled in memory, so "newer than" comparisons do not
/// depend on the filesystem's timestamp granularity.
pub struct FsPageStore {
    root: PathBuf,
    /// Files written since the last durable sync
    pending: Mutex<Vec<PathBuf>>,
    /// Write times of files written through this handle
    journal: Mutex<HashMap<PathBuf, Timestamp>>,
}

impl FsPageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: Mutex::new(Vec::new()),
            journal: Mutex::new(HashMap::new()),
        }
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, StoreError> {
        validate_name(collection)?;
        Ok(self.root.join(collection))
    }

    fn area_dir(&self, collection: &str, area: &str) -> Result<PathBuf, StoreError> {
        Ok(self.collection_dir(collection)?.join(area))
    }

    /// Output area of an opened collection.
    async fn output_dir(&self, collection: &str, stream: StreamKind) -> Result<PathBuf, StoreError> {
        let dir = self.area_dir(collection, stream.output_area())?;
        if !tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            return Err(StoreError::NotOpen(collection.to_string()));
        }
        Ok(dir)
    }

    async fn write_file(&self, path: PathBuf, content: &[u8]) -> Result<(), StoreError> {
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        let now = self.now();
        lock(&self.journal).insert(path.clone(), now);
        lock(&self.pending).push(path);
        Ok(())
    }

    /// Fsync `paths` and their directories.
    async fn flush(&self, paths: &[PathBuf], direction: SyncDirection) -> Result<(), StoreError> {
        let mut dirs = BTreeSet::new();
        for path in paths {
            match tokio::fs::File::open(path).await {
                Ok(file) => file.sync_all().await.map_err(|e| StoreError::Sync {
                    direction,
                    reason: format!("{}: {}", path.display(), e),
                })?,
                // Staged inputs may already be cleaned up
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(path, e)),
            }
            if let Some(parent) = path.parent() {
                dirs.insert(parent.to_path_buf());
            }
        }

        // Directory entries must be durable too for new files to survive a crash
        #[cfg(unix)]
        for dir in dirs {
            if let Ok(handle) = tokio::fs::File::open(&dir).await {
                handle.sync_all().await.map_err(|e| StoreError::Sync {
                    direction,
                    reason: format!("{}: {}", dir.display(), e),
                })?;
            }
        }
        Ok(())
    }

    /// Put paths of a failed flush back in front of anything written since.
    fn requeue(&self, mut paths: Vec<PathBuf>) {
        let mut pending = lock(&self.pending);
        paths.append(&mut pending);
        *pending = paths;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn system_nanos(time: SystemTime) -> Timestamp {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Timestamp)
        .unwrap_or(0)
}

#[async_trait]
impl PageStore for FsPageStore {
    async fn open(&self, collection: &str) -> Result<(), StoreError> {
        for stream in StreamKind::ALL {
            for area in [stream.input_area(), stream.output_area()] {
                let dir = self.area_dir(collection, area)?;
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| StoreError::io(&dir, e))?;
            }
        }
        tracing::debug!(collection, root = %self.root.display(), "Opened collection");
        Ok(())
    }

    async fn write_input(
        &self,
        collection: &str,
        stream: StreamKind,
        index: usize,
        image: &InputImage,
    ) -> Result<(), StoreError> {
        let dir = self.area_dir(collection, stream.input_area())?;
        self.write_file(dir.join(input_key(index, image)), &image.content)
            .await
    }

    async fn delete_input_area(
        &self,
        collection: &str,
        stream: StreamKind,
    ) -> Result<(), StoreError> {
        let dir = self.area_dir(collection, stream.input_area())?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&dir, e)),
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        lock(&self.pending).retain(|p| !p.starts_with(&dir));
        lock(&self.journal).retain(|p, _| !p.starts_with(&dir));
        Ok(())
    }

    async fn write_page(
        &self,
        collection: &str,
        stream: StreamKind,
        page: &OutputPage,
    ) -> Result<(), StoreError> {
        let dir = self.output_dir(collection, stream).await?;
        let info = format!("{}:{}\n", page.width, page.height);
        self.write_file(dir.join(info_file_name(page.index)), info.as_bytes())
            .await?;
        self.write_file(dir.join(page_file_name(page.index)), &page.png)
            .await
    }

    async fn write_output_file(
        &self,
        collection: &str,
        stream: StreamKind,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        validate_name(file_name)?;
        let dir = self.output_dir(collection, stream).await?;
        self.write_file(dir.join(file_name), content).await
    }

    async fn read_page(
        &self,
        collection: &str,
        stream: StreamKind,
        index: usize,
    ) -> Result<Bytes, StoreError> {
        let path = self
            .output_dir(collection, stream)
            .await?
            .join(page_file_name(index));
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::MissingPage {
                collection: collection.to_string(),
                stream,
                index,
            }),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn list_output_indices(
        &self,
        collection: &str,
        stream: StreamKind,
    ) -> Result<BTreeSet<usize>, StoreError> {
        let dir = self.output_dir(collection, stream).await?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let mut indices = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            if let Some(index) = entry.file_name().to_str().and_then(parse_page_index) {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    async fn stat_time(
        &self,
        collection: &str,
        stream: StreamKind,
        index: usize,
    ) -> Result<Timestamp, StoreError> {
        let path = self
            .output_dir(collection, stream)
            .await?
            .join(page_file_name(index));

        let journaled = lock(&self.journal).get(&path).copied();
        if let Some(time) = journaled {
            return Ok(time);
        }

        match tokio::fs::metadata(&path).await {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .map_err(|e| StoreError::io(&path, e))?;
                Ok(system_nanos(modified))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::MissingPage {
                collection: collection.to_string(),
                stream,
                index,
            }),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn sync(&self, direction: SyncDirection) -> Result<(), StoreError> {
        match direction {
            SyncDirection::ToDurable => {
                let pending = std::mem::take(&mut *lock(&self.pending));
                let count = pending.len();
                if let Err(e) = self.flush(&pending, direction).await {
                    self.requeue(pending);
                    return Err(e);
                }
                tracing::debug!(files = count, "Synced page store to disk");
            }
            SyncDirection::FromDurable => {
                // Reads always go to the filesystem; nothing to refresh
                tracing::trace!("Sync from disk is a no-op for the filesystem store");
            }
        }
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), StoreError> {
        let dir = self.collection_dir(collection)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&dir, e)),
        }
        lock(&self.pending).retain(|p| !p.starts_with(&dir));
        lock(&self.journal).retain(|p, _| !p.starts_with(&dir));
        tracing::info!(collection, "Deleted collection pages");
        Ok(())
    }

    fn now(&self) -> Timestamp {
        system_nanos(SystemTime::now())
    }
}
