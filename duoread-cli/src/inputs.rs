//! Reading input files from directories.

use std::path::{Path, PathBuf};

use anyhow::Context;
use duoread_core::ordering::PageOrdering;
use duoread_core::InputImage;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Regular, non-hidden files of a directory, sorted by name.
fn list_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn load(paths: Vec<PathBuf>) -> anyhow::Result<Vec<InputImage>> {
    paths
        .into_iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let content =
                std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(InputImage::new(name, content))
        })
        .collect()
}

/// Images of a directory in name order, or reordered by `order`.
pub fn read_images(dir: &Path, order: Option<&str>) -> anyhow::Result<Vec<InputImage>> {
    let paths = list_files(dir)?.into_iter().filter(|p| is_image(p)).collect();
    let mut images = load(paths)?;
    if let Some(pattern) = order {
        PageOrdering::new(pattern)?.sort(&mut images);
    }
    tracing::debug!(dir = %dir.display(), count = images.len(), "Read input images");
    Ok(images)
}

/// Every file of a previously exported page directory, including info files.
pub fn read_pages(dir: &Path) -> anyhow::Result<Vec<InputImage>> {
    load(list_files(dir)?)
}
