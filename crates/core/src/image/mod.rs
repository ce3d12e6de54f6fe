// Image asset generation: stream payloads from a backend into the project's asset folders

pub mod backend;
pub mod gemini;
pub mod resize;

pub use backend::{ChunkStream, GenerationChunk, GenerationRequest, ImageBackend};
pub use gemini::GeminiBackend;
pub use resize::{normalize_directory, resize_to_height, NormalizeReport};

use crate::settings::Settings;
use crate::types::{AssetCategory, ImageGenerationResult};
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Suffixes assigned by position when a character is generated with emotion variants
pub const EMOTION_SUFFIXES: [&str; 5] = ["neutral", "happy", "sad", "surprised", "angry"];

const MAX_PROMPT_SLUG: usize = 48;

/// High-level image generation helpers
pub struct ImageService {
    backend: Option<Arc<dyn ImageBackend>>,
    character_height: u32,
}

impl ImageService {
    pub fn new(backend: Option<Arc<dyn ImageBackend>>, character_height: u32) -> Self {
        Self {
            backend,
            character_height,
        }
    }

    /// Build the service from settings, using Gemini when an API key is configured
    pub fn from_settings(settings: &Settings) -> Self {
        let backend: Option<Arc<dyn ImageBackend>> = match GeminiBackend::from_settings(&settings.image) {
            Ok(Some(backend)) => Some(Arc::new(backend)),
            Ok(None) => {
                tracing::warn!("Image backend unavailable: GEMINI_API_KEY is not configured");
                None
            }
            Err(e) => {
                tracing::warn!("Image backend unavailable: {:#}", e);
                None
            }
        };
        Self::new(backend, settings.image.character_height)
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn character_height(&self) -> u32 {
        self.character_height
    }

    /// Generate an image asset and persist every returned payload under
    /// `{project_dir}/assets/{category}/`.
    pub async fn generate_image(
        &self,
        project_dir: &Path,
        prompt: &str,
        category: AssetCategory,
        base_name: Option<&str>,
        generate_emotions: bool,
    ) -> ImageGenerationResult {
        let Some(backend) = self.backend.clone() else {
            return ImageGenerationResult::failed(
                prompt,
                category,
                "Image backend is not configured. Set GEMINI_API_KEY.",
            );
        };

        let emotions = generate_emotions && category == AssetCategory::Character;
        match self
            .generate_inner(backend.as_ref(), project_dir, prompt, category, base_name, emotions)
            .await
        {
            Ok(files) if files.is_empty() => ImageGenerationResult::failed(
                prompt,
                category,
                "No image data returned from the image backend.",
            ),
            Ok(files) => {
                if category == AssetCategory::Character {
                    self.normalize_category_dir(project_dir, category).await;
                }
                ImageGenerationResult::saved(prompt, category, files)
            }
            Err(e) => {
                tracing::error!("Image generation failed: {:#}", e);
                ImageGenerationResult::failed(prompt, category, format!("{:#}", e))
            }
        }
    }

    async fn generate_inner(
        &self,
        backend: &dyn ImageBackend,
        project_dir: &Path,
        prompt: &str,
        category: AssetCategory,
        base_name: Option<&str>,
        emotions: bool,
    ) -> Result<Vec<PathBuf>> {
        let assets_dir = category_dir(project_dir, category);
        tokio::fs::create_dir_all(&assets_dir)
            .await
            .context("Failed to create asset directory")?;

        let root = file_root(prompt, base_name);
        let request = GenerationRequest {
            prompt: if emotions {
                emotion_prompt(prompt)
            } else {
                prompt.to_string()
            },
            aspect_ratio: category.aspect_ratio().to_string(),
        };

        let mut stream = backend.generate(request).await?;
        let mut saved = Vec::new();

        while let Some(chunk) = stream.next().await {
            match chunk? {
                GenerationChunk::Image { mime_type, data } => {
                    if data.is_empty() {
                        continue;
                    }
                    let name = payload_name(&root, saved.len(), emotions);
                    let path = assets_dir.join(format!("{}{}", name, extension_for_mime(&mime_type)));
                    tokio::fs::write(&path, &data)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!("Saved image {}", path.display());
                    saved.push(path);
                }
                GenerationChunk::Text(text) => {
                    tracing::debug!("{} text response: {}", backend.name(), text);
                }
            }
        }

        Ok(saved)
    }

    /// Rescan the whole category directory so sprites from earlier calls match too
    pub async fn normalize_category_dir(&self, project_dir: &Path, category: AssetCategory) -> NormalizeReport {
        let dir = category_dir(project_dir, category);
        let height = self.character_height;
        match tokio::task::spawn_blocking(move || normalize_directory(&dir, height)).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Normalization worker failed: {}", e);
                NormalizeReport::default()
            }
        }
    }
}

/// `{project}/assets/{category}`
pub fn category_dir(project_dir: &Path, category: AssetCategory) -> PathBuf {
    project_dir.join("assets").join(category.as_str())
}

/// Lowercase, runs of anything outside `[a-z0-9]` become `-`
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for c in value.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "image".to_string()
    } else {
        slug
    }
}

fn file_root(prompt: &str, base_name: Option<&str>) -> String {
    match base_name.filter(|n| !n.trim().is_empty()) {
        Some(name) => slugify(name),
        None => {
            let prompt_slug: String = slugify(prompt).chars().take(MAX_PROMPT_SLUG).collect();
            slugify(&format!(
                "{}-{}",
                prompt_slug,
                Utc::now().format("%Y%m%d%H%M%S")
            ))
        }
    }
}

/// File stem for the payload at `index`
fn payload_name(root: &str, index: usize, emotions: bool) -> String {
    if emotions {
        if let Some(suffix) = EMOTION_SUFFIXES.get(index) {
            return format!("{}_{}", root, suffix);
        }
    }
    if index == 0 {
        root.to_string()
    } else {
        format!("{}-{}", root, index)
    }
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        _ => ".png",
    }
}

fn emotion_prompt(prompt: &str) -> String {
    format!(
        "{prompt}\n\n\
         IMPORTANT: Generate 5 SEPARATE, INDIVIDUAL images (not a character sheet).\n\
         Each image should contain ONE SINGLE character with a different emotion:\n\
         1. First image: Neutral/calm expression\n\
         2. Second image: Happy/cheerful expression\n\
         3. Third image: Sad/worried expression\n\
         4. Fourth image: Surprised/shocked expression\n\
         5. Fifth image: Angry/serious expression\n\n\
         Keep the character design IDENTICAL across all images, only change the facial expression.\n\
         Each image must show ONLY ONE character, not multiple characters side-by-side."
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::anyhow;
    use bytes::Bytes;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// PNG bytes of a solid image
    pub fn png_bytes(width: u32, height: u32) -> Bytes {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 120, 200, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        Bytes::from(out.into_inner())
    }

    /// Backend replaying a fixed list of chunks
    pub struct ScriptedBackend {
        pub chunks: Vec<std::result::Result<GenerationChunk, String>>,
        pub requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedBackend {
        pub fn new(chunks: Vec<std::result::Result<GenerationChunk, String>>) -> Self {
            Self {
                chunks,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn images(count: usize) -> Self {
            let mut chunks = vec![Ok(GenerationChunk::Text("thinking".to_string()))];
            for i in 0..count {
                chunks.push(Ok(GenerationChunk::Image {
                    mime_type: "image/png".to_string(),
                    data: png_bytes(20 + i as u32, 30),
                }));
            }
            Self::new(chunks)
        }
    }

    #[async_trait::async_trait]
    impl ImageBackend for ScriptedBackend {
        async fn generate(&self, request: GenerationRequest) -> Result<ChunkStream> {
            self.requests.lock().unwrap().push(request);
            let items: Vec<Result<GenerationChunk>> = self
                .chunks
                .iter()
                .cloned()
                .map(|c| c.map_err(|e| anyhow!(e)))
                .collect();
            Ok(futures_util::stream::iter(items).boxed())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::TempDir;

    fn service(backend: ScriptedBackend) -> (ImageService, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let shared: Arc<dyn ImageBackend> = backend.clone();
        (ImageService::new(Some(shared), 60), backend)
    }

    #[tokio::test]
    async fn test_unconfigured_backend_fails_fast() {
        let temp = TempDir::new().unwrap();
        let service = ImageService::new(None, 750);

        let result = service
            .generate_image(temp.path(), "a cafe", AssetCategory::Background, None, false)
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("not configured"));
        assert!(!temp.path().join("assets").exists());
    }

    #[tokio::test]
    async fn test_short_emotion_batch_uses_leading_suffixes() {
        let temp = TempDir::new().unwrap();
        let (service, backend) = service(ScriptedBackend::images(3));

        let result = service
            .generate_image(temp.path(), "alice", AssetCategory::Character, Some("Alice"), true)
            .await;

        assert!(result.success);
        let names: Vec<String> = result
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["alice_neutral.png", "alice_happy.png", "alice_sad.png"]);
        assert_eq!(result.primary_file.as_ref(), result.files.first());

        let request = backend.requests.lock().unwrap()[0].clone();
        assert_eq!(request.aspect_ratio, "2:3");
        assert!(request.prompt.contains("5 SEPARATE"));

        // Character sprites are normalized to the configured height
        for file in &result.files {
            assert_eq!(image::open(file).unwrap().height(), 60);
        }
    }

    #[tokio::test]
    async fn test_background_names_and_aspect_ratio() {
        let temp = TempDir::new().unwrap();
        let (service, backend) = service(ScriptedBackend::images(2));

        let result = service
            .generate_image(temp.path(), "city park", AssetCategory::Background, Some("park"), true)
            .await;

        assert!(result.success);
        let dir = temp.path().join("assets/background");
        assert_eq!(result.files, vec![dir.join("park.png"), dir.join("park-1.png")]);
        assert_eq!(backend.requests.lock().unwrap()[0].aspect_ratio, "16:9");
        // Backgrounds keep their generated size
        assert_eq!(image::open(dir.join("park.png")).unwrap().height(), 30);
    }

    #[tokio::test]
    async fn test_zero_payloads_is_failure() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service(ScriptedBackend::new(vec![Ok(GenerationChunk::Text(
            "I cannot draw that".to_string(),
        ))]));

        let result = service
            .generate_image(temp.path(), "x", AssetCategory::Background, None, false)
            .await;

        assert!(!result.success);
        assert!(result.files.is_empty());
        assert!(result.error.unwrap().contains("No image data"));
    }

    #[tokio::test]
    async fn test_stream_error_is_reported_as_data() {
        let temp = TempDir::new().unwrap();
        let (service, _) = service(ScriptedBackend::new(vec![Err("connection reset".to_string())]));

        let result = service
            .generate_image(temp.path(), "x", AssetCategory::Character, Some("bob"), false)
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("connection reset"));
    }

    #[test]
    fn test_naming_helpers() {
        assert_eq!(slugify("Cozy Café, evening!"), "cozy-caf-evening");
        assert_eq!(slugify("!!!"), "image");
        assert_eq!(payload_name("bob", 0, false), "bob");
        assert_eq!(payload_name("bob", 2, false), "bob-2");
        assert_eq!(payload_name("bob", 4, true), "bob_angry");
        assert_eq!(payload_name("bob", 5, true), "bob-5");
        assert_eq!(extension_for_mime("image/jpeg"), ".jpg");
        assert_eq!(extension_for_mime("application/octet-stream"), ".png");

        let generated = file_root("A very long prompt", None);
        assert!(generated.starts_with("a-very-long-prompt-"));
    }
}
