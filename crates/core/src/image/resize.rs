// Sprite size normalization

use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::path::Path;

/// Outcome of a normalization pass over a directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub resized: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Resize an image in place to `target_height`, keeping its aspect ratio.
/// Returns false when the image already has the target height.
pub fn resize_to_height(path: &Path, target_height: u32) -> Result<bool> {
    let img = image::open(path).with_context(|| format!("open '{}'", path.display()))?;
    let (width, height) = (img.width(), img.height());
    if height == target_height || height == 0 {
        return Ok(false);
    }

    let new_width = ((target_height as f64) * (width as f64) / (height as f64)) as u32;
    let resized = img.resize_exact(new_width.max(1), target_height, FilterType::Lanczos3);
    resized
        .save(path)
        .with_context(|| format!("save '{}'", path.display()))?;

    tracing::info!(
        "Resized {}: {}x{} -> {}x{}",
        path.display(),
        width,
        height,
        new_width.max(1),
        target_height
    );
    Ok(true)
}

/// Bring every PNG in `dir` to the same height. Failures are logged and skipped.
pub fn normalize_directory(dir: &Path, target_height: u32) -> NormalizeReport {
    let mut report = NormalizeReport::default();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Failed to scan {} for normalization: {}", dir.display(), e);
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_png = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("png"))
            .unwrap_or(false);
        if !path.is_file() || !is_png {
            continue;
        }

        match resize_to_height(&path, target_height) {
            Ok(true) => report.resized += 1,
            Ok(false) => report.unchanged += 1,
            Err(e) => {
                tracing::warn!("Failed to resize {}: {:#}", path.display(), e);
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        "Normalized {} to {}px ({} resized, {} unchanged, {} failed)",
        dir.display(),
        target_height,
        report.resized,
        report.unchanged,
        report.failed
    );
    report
}
