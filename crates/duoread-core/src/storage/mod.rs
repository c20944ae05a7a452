//! Page storage for collections.
//!
//! Each collection owns four areas, one staging and one output area per stream:
//!
//! ```text
//! <collection>/
//!   in_orig/     1000000.jpg, 1000001.jpg, ...   staged inputs (removed after a job)
//!   out_orig/    1000001.png + 1000001.txt, ...  produced pages (kept)
//!   in_transl/
//!   out_transl/
//! ```
//!
//! Staged inputs are keyed by their position in the submitted sequence, never
//! by file name, so downstream indexing does not depend on how files were named.
//! Output page `i` lives at `{1000001 + i}.png` with a `width:height` companion.

mod fs;
mod memory;

pub use fs::FsPageStore;
pub use memory::MemoryPageStore;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;
use crate::types::{InputImage, StreamKind};

/// Key base for staged inputs: input `i` is stored as `{INPUT_INDEX_BASE + i}.{ext}`.
pub const INPUT_INDEX_BASE: usize = 1_000_000;

/// Key base for produced pages: output `i` is stored as `{OUTPUT_INDEX_BASE + i}.png`.
pub const OUTPUT_INDEX_BASE: usize = INPUT_INDEX_BASE + 1;

/// Store-local timestamp. Only comparable with values from the same store's [`PageStore::now`].
pub type Timestamp = u64;

/// Direction of a store flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Push buffered writes to durable storage
    ToDurable,
    /// Refresh the working view from durable storage
    FromDurable,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::ToDurable => write!(f, "to durable"),
            SyncDirection::FromDurable => write!(f, "from durable"),
        }
    }
}

/// A produced page, PNG encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPage {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub png: Bytes,
}

/// Staging key for input `index`.
pub fn input_key(index: usize, image: &InputImage) -> String {
    format!("{}.{}", INPUT_INDEX_BASE + index, image.extension())
}

/// Image file name for output page `index`.
pub fn page_file_name(index: usize) -> String {
    format!("{}.png", OUTPUT_INDEX_BASE + index)
}

/// Info file name (`width:height`) for output page `index`.
pub fn info_file_name(index: usize) -> String {
    format!("{}.txt", OUTPUT_INDEX_BASE + index)
}

/// Recover an output index from a page file name; other files yield `None`.
pub fn parse_page_index(file_name: &str) -> Option<usize> {
    let stem = file_name.strip_suffix(".png")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<usize>().ok()?.checked_sub(OUTPUT_INDEX_BASE)
}

/// Collection and file names must stay inside their area.
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Persistent storage for raw inputs and produced pages, addressed by
/// collection name + stream + numeric index.
///
/// Writes may be buffered until [`PageStore::sync`] is called with
/// [`SyncDirection::ToDurable`]; readers are only guaranteed to observe
/// pages written before the last successful sync.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Prepare a collection: ensure all four areas exist.
    async fn open(&self, collection: &str) -> Result<(), StoreError>;

    /// Stage input `index` of a stream.
    async fn write_input(
        &self,
        collection: &str,
        stream: StreamKind,
        index: usize,
        image: &InputImage,
    ) -> Result<(), StoreError>;

    /// Remove every staged input of a stream. The area itself stays available.
    async fn delete_input_area(&self, collection: &str, stream: StreamKind)
        -> Result<(), StoreError>;

    /// Write a produced page (image plus info file) under its index.
    async fn write_page(
        &self,
        collection: &str,
        stream: StreamKind,
        page: &OutputPage,
    ) -> Result<(), StoreError>;

    /// Write a finished file into an output area under its own name.
    async fn write_output_file(
        &self,
        collection: &str,
        stream: StreamKind,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), StoreError>;

    /// Read the image of output page `index`.
    async fn read_page(
        &self,
        collection: &str,
        stream: StreamKind,
        index: usize,
    ) -> Result<Bytes, StoreError>;

    /// Indices of all output pages of a stream.
    async fn list_output_indices(
        &self,
        collection: &str,
        stream: StreamKind,
    ) -> Result<BTreeSet<usize>, StoreError>;

    /// Last modification time of output page `index`.
    async fn stat_time(
        &self,
        collection: &str,
        stream: StreamKind,
        index: usize,
    ) -> Result<Timestamp, StoreError>;

    /// Flush buffered writes (or refresh the working view).
    async fn sync(&self, direction: SyncDirection) -> Result<(), StoreError>;

    /// Remove a collection with all of its areas.
    async fn delete_collection(&self, collection: &str) -> Result<(), StoreError>;

    /// Current time on the store's clock.
    fn now(&self) -> Timestamp;
}
