//! Page engine abstraction.
//!
//! An engine turns one input image into zero or more output pages. It keeps
//! state across calls (translation pages are matched against original pages
//! produced earlier in the same job), so one engine instance serves one job at
//! a time and is reset before every job.

mod raster;

pub use raster::ImagePageEngine;

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::EngineError;
use crate::storage::OutputPage;
use crate::types::{StreamKind, StreamSettings};

/// One input image handed to the engine.
#[derive(Debug, Clone)]
pub struct EngineInput {
    pub stream: StreamKind,
    /// Position of the image in its input sequence
    pub index: usize,
    pub name: String,
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

/// Processes single images into output pages.
///
/// Implementations are CPU-bound and run on a blocking thread.
pub trait PageEngine: Send {
    /// Drop all state from a previous job.
    fn reset(&mut self);

    /// Process one image. Returned pages carry the output index they must be stored under;
    /// an index may be returned again to replace an earlier page.
    fn process(
        &mut self,
        input: &EngineInput,
        settings: &StreamSettings,
    ) -> Result<Vec<OutputPage>, EngineError>;
}

/// Engine shared between the scheduler and the blocking thread running it.
pub type SharedEngine = Arc<Mutex<Box<dyn PageEngine>>>;

pub fn shared(engine: impl PageEngine + 'static) -> SharedEngine {
    let engine: Box<dyn PageEngine> = Box::new(engine);
    Arc::new(Mutex::new(engine))
}

/// Read pixel dimensions from an encoded image without decoding the pixels.
pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32), image::ImageError> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()
}
