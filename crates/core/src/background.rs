// Background removal for generated character art

use crate::settings::BackgroundRemovalSettings;
use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "webp", "bmp", "tiff"];

const TRANSPARENT_SUFFIX: &str = "_transparent";

/// Foreground/background segmentation. Returns the foreground with transparency.
pub trait Segmenter: Send + Sync {
    fn segment(&self, input: &Path) -> Result<DynamicImage>;

    fn name(&self) -> &str;
}

/// Segmenter backed by the `rembg` command line tool
pub struct RembgSegmenter {
    program: PathBuf,
}

impl RembgSegmenter {
    /// Locate the command on PATH; `None` disables background removal
    pub fn detect(command: &str) -> Option<Self> {
        match which::which(command) {
            Ok(program) => Some(Self { program }),
            Err(e) => {
                tracing::warn!(
                    "{} is unavailable; automatic background removal disabled ({})",
                    command,
                    e
                );
                None
            }
        }
    }
}

impl Segmenter for RembgSegmenter {
    fn segment(&self, input: &Path) -> Result<DynamicImage> {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        let scratch = input.with_file_name(format!(".{}.rembg.png", stem));

        let output = Command::new(&self.program)
            .arg("i")
            .arg(input)
            .arg(&scratch)
            .output()
            .with_context(|| format!("Failed to run {}", self.program.display()))?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&scratch);
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let result = image::open(&scratch).context("Failed to read rembg output");
        let _ = std::fs::remove_file(&scratch);
        result
    }

    fn name(&self) -> &str {
        "rembg"
    }
}

/// Produces `{stem}_transparent.png` derivatives with the input's exact dimensions
pub struct BackgroundRemover {
    segmenter: Option<Arc<dyn Segmenter>>,
    resize_to: Option<u32>,
}

impl BackgroundRemover {
    pub fn new(segmenter: Option<Arc<dyn Segmenter>>, resize_to: Option<u32>) -> Self {
        Self {
            segmenter,
            resize_to,
        }
    }

    pub fn from_settings(settings: &BackgroundRemovalSettings) -> Self {
        let segmenter = RembgSegmenter::detect(&settings.command)
            .map(|s| Arc::new(s) as Arc<dyn Segmenter>);
        Self::new(segmenter, settings.resize_to)
    }

    pub fn is_available(&self) -> bool {
        self.segmenter.is_some()
    }

    /// Remove the background of a single image. Best effort: every failure is
    /// logged and reported as `None`.
    pub fn remove_background(&self, input: &Path) -> Option<PathBuf> {
        let segmenter = self.segmenter.as_ref()?;

        if !is_supported_image(input) {
            tracing::debug!("Skipping unsupported file {}", input.display());
            return None;
        }
        if is_transparent_derivative(input) {
            tracing::debug!("Skipping already processed {}", input.display());
            return None;
        }

        let output = transparent_path(input);
        if output.exists() {
            tracing::debug!("Transparent version already exists: {}", output.display());
            return Some(output);
        }

        match self.remove_inner(segmenter.as_ref(), input, &output) {
            Ok(()) => {
                tracing::info!(
                    "Removed background: {} -> {}",
                    input.display(),
                    output.display()
                );
                Some(output)
            }
            Err(e) => {
                tracing::error!(
                    "Failed to remove background for {}: {:#}",
                    input.display(),
                    e
                );
                None
            }
        }
    }

    fn remove_inner(&self, segmenter: &dyn Segmenter, input: &Path, output: &Path) -> Result<()> {
        let original = image::open(input).with_context(|| format!("open '{}'", input.display()))?;
        let (width, height) = (original.width(), original.height());

        let mut result = segmenter.segment(input)?;
        if (result.width(), result.height()) != (width, height) {
            tracing::warn!(
                "{} changed size {}x{} -> {}x{}, resizing back",
                segmenter.name(),
                width,
                height,
                result.width(),
                result.height()
            );
            result = result.resize_exact(width, height, FilterType::Lanczos3);
        }

        if let Some(size) = self.resize_to {
            result = result.resize_exact(size, size, FilterType::Lanczos3);
        }

        DynamicImage::ImageRgba8(result.to_rgba8())
            .save_with_format(output, image::ImageFormat::Png)
            .with_context(|| format!("save '{}'", output.display()))?;
        Ok(())
    }

    /// Process every supported, not yet derived image in a directory
    pub fn process_directory(&self, dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
        let mut successes = Vec::new();
        let mut failures = Vec::new();

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_supported_image(p) && !is_transparent_derivative(p))
            .collect();
        entries.sort();

        for path in entries {
            match self.remove_background(&path) {
                Some(output) => successes.push(output),
                None => failures.push(path),
            }
        }
        Ok((successes, failures))
    }
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

fn is_transparent_derivative(path: &Path) -> bool {
    path.file_stem()
        .map(|s| s.to_string_lossy().contains(TRANSPARENT_SUFFIX))
        .unwrap_or(false)
}

/// `{dir}/{stem}_transparent.png`
pub fn transparent_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    input.with_file_name(format!("{}{}.png", stem, TRANSPARENT_SUFFIX))
}
