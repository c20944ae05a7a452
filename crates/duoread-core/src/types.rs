//! Domain types shared by the store, the page engine and the scheduler.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Default feature count used when matching translation pages.
pub const DEFAULT_ORB_COUNT: u32 = 10_000;

/// Default pixel-area target for downscaled pages.
pub const DEFAULT_RESIZE: u32 = 2_000_000;

/// One of the two parallel page sequences of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Source pages
    Orig,
    /// Translated pages
    Transl,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Orig, StreamKind::Transl];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Orig => "orig",
            StreamKind::Transl => "transl",
        }
    }

    /// Staging area holding raw inputs while a job runs.
    pub fn input_area(&self) -> &'static str {
        match self {
            StreamKind::Orig => "in_orig",
            StreamKind::Transl => "in_transl",
        }
    }

    /// Permanent area holding produced pages.
    pub fn output_area(&self) -> &'static str {
        match self {
            StreamKind::Orig => "out_orig",
            StreamKind::Transl => "out_transl",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source image as submitted by the user: file name plus raw bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputImage {
    pub name: String,
    pub content: Bytes,
}

impl InputImage {
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// File extension of the original name, used to key the staged copy.
    pub fn extension(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
            _ => "img",
        }
    }
}

impl fmt::Debug for InputImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputImage")
            .field("name", &self.name)
            .field("len", &self.content.len())
            .finish()
    }
}

/// Per-stream processing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Target pixel area of a produced page (0 disables downscaling)
    pub resize: u32,
    /// Split double pages into two outputs
    pub do_split: bool,
    /// Trim uniform borders
    pub do_crop: bool,
    /// Right page comes first when splitting
    pub right2left: bool,
    /// Feature count for translation matching (translation stream only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orb_count: Option<u32>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            resize: DEFAULT_RESIZE,
            do_split: true,
            do_crop: true,
            right2left: true,
            orb_count: None,
        }
    }
}

impl StreamSettings {
    /// Default settings for the translation stream.
    pub fn translation() -> Self {
        Self {
            orb_count: Some(DEFAULT_ORB_COUNT),
            ..Self::default()
        }
    }
}
