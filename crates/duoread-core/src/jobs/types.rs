//! Messages exchanged with the alignment worker.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{InputImage, StreamKind, StreamSettings};

/// A full alignment request: both input sequences with their settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentJob {
    pub name: String,
    pub orig_imgs: Vec<InputImage>,
    pub orig_settings: StreamSettings,
    #[serde(default)]
    pub transl_imgs: Vec<InputImage>,
    pub transl_settings: StreamSettings,
}

impl AlignmentJob {
    pub fn inputs(&self, stream: StreamKind) -> &[InputImage] {
        match stream {
            StreamKind::Orig => &self.orig_imgs,
            StreamKind::Transl => &self.transl_imgs,
        }
    }

    pub fn settings(&self, stream: StreamKind) -> &StreamSettings {
        match stream {
            StreamKind::Orig => &self.orig_settings,
            StreamKind::Transl => &self.transl_settings,
        }
    }
}

/// Requests handled by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    /// Run a full alignment
    Start(AlignmentJob),
    /// Store already finished pages without processing them
    DirectImport {
        name: String,
        orig_imgs: Vec<InputImage>,
        #[serde(default)]
        transl_imgs: Vec<InputImage>,
    },
    /// Stop the worker
    Exit,
}

/// Input and output progress of both streams during one job.
///
/// `in_*` count inputs handed to the engine; `out_*` hold the highest output
/// index produced so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursors {
    pub in_orig: usize,
    pub out_orig: usize,
    pub in_transl: usize,
    pub out_transl: usize,
}

impl Cursors {
    pub fn input(&self, stream: StreamKind) -> usize {
        match stream {
            StreamKind::Orig => self.in_orig,
            StreamKind::Transl => self.in_transl,
        }
    }
}

/// One processed input image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub collection_name: String,
    /// Output pages currently stored for the stream
    pub count: usize,
    /// Inputs of the stream processed so far, including this one
    pub progress_index: usize,
    pub progress_max: usize,
    /// Output indices written during this step
    pub new_indexes: BTreeSet<usize>,
}

/// Events emitted by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub enum JobEvent {
    OrigWritten(ProgressEvent),
    TranslWritten(ProgressEvent),
    #[serde(rename_all = "camelCase")]
    Done { collection_name: String },
    #[serde(rename_all = "camelCase")]
    Failed {
        collection_name: String,
        stream: Option<StreamKind>,
        index: Option<usize>,
        error: String,
        cursors: Cursors,
    },
}

impl JobEvent {
    pub fn written(stream: StreamKind, progress: ProgressEvent) -> Self {
        match stream {
            StreamKind::Orig => JobEvent::OrigWritten(progress),
            StreamKind::Transl => JobEvent::TranslWritten(progress),
        }
    }

    pub fn collection_name(&self) -> &str {
        match self {
            JobEvent::OrigWritten(p) | JobEvent::TranslWritten(p) => &p.collection_name,
            JobEvent::Done { collection_name } | JobEvent::Failed { collection_name, .. } => {
                collection_name
            }
        }
    }

    /// Done or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Done { .. } | JobEvent::Failed { .. })
    }
}
