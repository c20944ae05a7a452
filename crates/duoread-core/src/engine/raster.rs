//! Reference page engine built on the `image` crate.
//!
//! Original pages are cropped, split and downscaled, then appended to the
//! original output sequence. Translation pages get the same preprocessing and
//! are paired positionally with the next original page of the same shape
//! (single vs. double) inside the search window, resized to that page's size.

use std::io::Cursor;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat};

use super::{EngineInput, PageEngine};
use crate::error::EngineError;
use crate::storage::OutputPage;
use crate::types::{StreamKind, StreamSettings, DEFAULT_ORB_COUNT};

/// Tolerance (pixels) when looking for the gutter of a double page.
const PIXEL_EPS: u32 = 10;

#[derive(Debug, Clone, Copy)]
struct PageShape {
    width: u32,
    height: u32,
    double: bool,
}

/// Image-based engine. See module docs.
pub struct ImagePageEngine {
    search_range: usize,
    origs: Vec<PageShape>,
    /// Next original page a translation page may be paired with
    transl_cursor: usize,
}

impl ImagePageEngine {
    pub fn new(search_range: usize) -> Self {
        Self {
            search_range: search_range.max(1),
            origs: Vec::new(),
            transl_cursor: 0,
        }
    }

    fn process_orig(&mut self, pieces: Vec<DynamicImage>) -> Result<Vec<OutputPage>, EngineError> {
        let mut pages = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let index = self.origs.len();
            self.origs.push(PageShape {
                width: piece.width(),
                height: piece.height(),
                double: is_double_page(piece.width(), piece.height()),
            });
            pages.push(encode(index, &piece)?);
        }
        Ok(pages)
    }

    fn process_transl(&mut self, pieces: Vec<DynamicImage>) -> Result<Vec<OutputPage>, EngineError> {
        let mut pages = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let double = is_double_page(piece.width(), piece.height());
            let Some(orig_index) = self.pair(double) else {
                tracing::debug!(
                    cursor = self.transl_cursor,
                    origs = self.origs.len(),
                    "No original page left to pair translation page with"
                );
                continue;
            };
            let target = self.origs[orig_index];
            let resized = piece.resize_exact(target.width, target.height, FilterType::Triangle);
            pages.push(encode(orig_index, &resized)?);
        }
        Ok(pages)
    }

    /// Pick the original page for the next translation page and advance the cursor past it.
    fn pair(&mut self, double: bool) -> Option<usize> {
        if self.transl_cursor >= self.origs.len() {
            return None;
        }
        let end = (self.transl_cursor + self.search_range).min(self.origs.len());
        let chosen = (self.transl_cursor..end)
            .find(|&i| self.origs[i].double == double)
            .unwrap_or(self.transl_cursor);
        self.transl_cursor = chosen + 1;
        Some(chosen)
    }
}

impl PageEngine for ImagePageEngine {
    fn reset(&mut self) {
        self.origs.clear();
        self.transl_cursor = 0;
    }

    fn process(
        &mut self,
        input: &EngineInput,
        settings: &StreamSettings,
    ) -> Result<Vec<OutputPage>, EngineError> {
        let img = image::load_from_memory(&input.bytes)?;
        let pieces = preprocess(img, settings);

        match input.stream {
            StreamKind::Orig => self.process_orig(pieces),
            StreamKind::Transl => {
                tracing::trace!(
                    orb_count = settings.orb_count.unwrap_or(DEFAULT_ORB_COUNT),
                    "Pairing translation image"
                );
                self.process_transl(pieces)
            }
        }
    }
}

/// Landscape pages are treated as two facing pages.
fn is_double_page(width: u32, height: u32) -> bool {
    width >= height
}

/// Crop, split and downscale one input image into page images.
fn preprocess(img: DynamicImage, settings: &StreamSettings) -> Vec<DynamicImage> {
    let img = if settings.do_crop { crop(img) } else { img };

    if settings.do_split && is_double_page(img.width(), img.height()) && has_gutter(&img.to_luma8()) {
        let half = img.width() / 2;
        let left = img.crop_imm(0, 0, half, img.height());
        let right = img.crop_imm(half, 0, img.width() - half, img.height());
        let (left, right) = if settings.do_crop {
            (crop(left), crop(right))
        } else {
            (left, right)
        };
        let (first, second) = if settings.right2left {
            (right, left)
        } else {
            (left, right)
        };
        return vec![
            downscale(first, settings.resize),
            downscale(second, settings.resize),
        ];
    }

    vec![downscale(img, settings.resize)]
}

/// A double page is only split if a uniform column sits near its centre.
fn has_gutter(grey: &GrayImage) -> bool {
    let mid = grey.width() / 2;
    [Some(mid), mid.checked_add(PIXEL_EPS), mid.checked_sub(PIXEL_EPS)]
        .into_iter()
        .flatten()
        .filter(|&x| x < grey.width())
        .any(|x| uniform_column(grey, x, 0, grey.height()))
}

fn uniform_row(grey: &GrayImage, y: u32, x0: u32, x1: u32, value: u8) -> bool {
    (x0..x1).all(|x| grey.get_pixel(x, y)[0] == value)
}

fn uniform_column(grey: &GrayImage, x: u32, y0: u32, y1: u32) -> bool {
    if y0 >= y1 {
        return false;
    }
    let value = grey.get_pixel(x, y0)[0];
    (y0..y1).all(|y| grey.get_pixel(x, y)[0] == value)
}

/// Bounding box left after peeling off uniform border rows and columns.
fn content_bounds(grey: &GrayImage) -> Option<(u32, u32, u32, u32)> {
    let (mut x0, mut y0, mut x1, mut y1) = (0, 0, grey.width(), grey.height());

    while x0 < x1 && y0 < y1 {
        let top_left = grey.get_pixel(x0, y0)[0];
        let bottom_right = grey.get_pixel(x1 - 1, y1 - 1)[0];

        if uniform_row(grey, y0, x0, x1, top_left) {
            y0 += 1;
        } else if uniform_row(grey, y1 - 1, x0, x1, bottom_right) {
            y1 -= 1;
        } else if (y0..y1).all(|y| grey.get_pixel(x0, y)[0] == top_left) {
            x0 += 1;
        } else if (y0..y1).all(|y| grey.get_pixel(x1 - 1, y)[0] == bottom_right) {
            x1 -= 1;
        } else {
            break;
        }
    }

    (x0 < x1 && y0 < y1).then(|| (x0, y0, x1 - x0, y1 - y0))
}

/// Crop uniform borders; a fully uniform image is kept as is.
fn crop(img: DynamicImage) -> DynamicImage {
    match content_bounds(&img.to_luma8()) {
        Some((x, y, w, h)) if (w, h) != (img.width(), img.height()) => img.crop_imm(x, y, w, h),
        _ => img,
    }
}

/// Scale down to roughly `target` pixels, keeping the aspect ratio.
/// Double pages get twice the budget.
fn downscale(img: DynamicImage, target: u32) -> DynamicImage {
    let (width, height) = (img.width() as u64, img.height() as u64);
    let mut target = target as u64;
    if target == 0 || target >= width * height {
        return img;
    }
    if is_double_page(img.width(), img.height()) {
        target *= 2;
    }

    let new_width = ((target as f64) * (width as f64) / (height as f64)).sqrt() as u64;
    let new_width = new_width.clamp(1, width);
    let new_height = (target / new_width).clamp(1, height);
    img.resize_exact(new_width as u32, new_height as u32, FilterType::Triangle)
}

fn encode(index: usize, img: &DynamicImage) -> Result<OutputPage, EngineError> {
    let mut png = Cursor::new(Vec::new());
    img.write_to(&mut png, ImageFormat::Png)?;
    Ok(OutputPage {
        index,
        width: img.width(),
        height: img.height(),
        png: Bytes::from(png.into_inner()),
    })
}
