// Asset tools: generated backgrounds and character sprites

use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_boolean, json_schema_object, json_schema_string, Tool};
use anyhow::{Context, Result};
use renpy_forge_core::background::BackgroundRemover;
use renpy_forge_core::image::ImageService;
use renpy_forge_core::project::ProjectManager;
use renpy_forge_core::types::{AssetCategory, ImageGenerationResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BACKEND_UNAVAILABLE: &str =
    "Image backend is not configured. Set GEMINI_API_KEY to enable image generation.";

const BACKGROUND_DESCRIPTION: &str = "Generate a background image asset (16:9) for a visual novel scene.

Describe the location (interior/exterior/fantasy), time of day and lighting, weather and mood, \
specific details (furniture, architecture, color palette, light sources) and composition. \
Vague descriptions like \"a room\" give poor results.

Example: \"Cozy café interior, evening, warm light from vintage hanging lamps, wooden tables, \
espresso machine on the counter, large windows showing a darkening sky, anime visual novel style\"

Images are saved under assets/background/ and copied into game/images/ on the next build.";

const CHARACTER_DESCRIPTION: &str = "Generate a full-body character sprite for a visual novel.

Describe appearance (hair, eyes, build), clothing and accessories, personality, age range and \
distinctive features. Sprites are normalized to a common height and a transparent \
{name}_transparent.png version is produced when background removal is available.

Set generate_emotions=true to create five variants in one call: {name}_neutral, {name}_happy, \
{name}_sad, {name}_surprised and {name}_angry. Switch between them in Ren'Py with \
`image alice happy = \"images/alice_happy_transparent.png\"` and `show alice happy`.";

/// Payload paths relative to the project directory where possible
fn relative_to(project_dir: &Path, files: &[PathBuf]) -> Vec<String> {
    files
        .iter()
        .map(|path| {
            path.strip_prefix(project_dir)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect()
}

/// Generation result plus extra tool-specific fields
fn generation_payload(
    result: &ImageGenerationResult,
    extra: serde_json::Map<String, serde_json::Value>,
) -> Result<CallToolResult> {
    let mut payload = serde_json::to_value(result)?;
    if let Some(object) = payload.as_object_mut() {
        object.extend(extra);
    }
    Ok(CallToolResult::json(&payload)?.failed_if(!result.success))
}

#[derive(Debug, Deserialize)]
struct BackgroundArgs {
    project_name: String,
    description: String,
    #[serde(default)]
    style: Option<String>,
    #[serde(default)]
    base_filename: Option<String>,
}

/// Background prompt: the scene description plus framing instructions
pub fn background_prompt(description: &str, style: Option<&str>) -> String {
    let mut parts = vec![
        description.to_string(),
        "Create a detailed visual novel background scene, 16:9 ratio.".to_string(),
    ];
    if let Some(style) = style.filter(|s| !s.trim().is_empty()) {
        parts.push(format!("Style: {}.", style));
    }
    parts.join(" ")
}

/// Tool to generate a background image
pub struct GenerateBackgroundTool {
    projects: Arc<ProjectManager>,
    images: Arc<ImageService>,
}

impl GenerateBackgroundTool {
    pub fn new(projects: Arc<ProjectManager>, images: Arc<ImageService>) -> Self {
        Self { projects, images }
    }
}

#[async_trait::async_trait]
impl Tool for GenerateBackgroundTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "generate_background".to_string(),
            description: BACKGROUND_DESCRIPTION.to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "project_name": json_schema_string("Name of the project"),
                    "description": json_schema_string("Detailed scene description"),
                    "style": json_schema_string("Art style (default: anime visual novel background art)"),
                    "base_filename": json_schema_string("Custom file name (generated from the prompt if omitted)")
                }),
                vec!["project_name", "description"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: BackgroundArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for generate_background")?;

        if !self.images.is_available() {
            return Ok(CallToolResult::error(BACKEND_UNAVAILABLE));
        }
        let project_dir = match self.projects.ensure_project_dir(&args.project_name) {
            Ok(dir) => dir,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };

        let prompt = background_prompt(&args.description, args.style.as_deref());
        let result = self
            .images
            .generate_image(
                &project_dir,
                &prompt,
                AssetCategory::Background,
                args.base_filename.as_deref(),
                false,
            )
            .await;

        let mut extra = serde_json::Map::new();
        extra.insert("project".to_string(), args.project_name.into());
        if result.success {
            extra.insert(
                "relative_files".to_string(),
                relative_to(&project_dir, &result.files).into(),
            );
        }
        generation_payload(&result, extra)
    }
}

#[derive(Debug, Deserialize)]
struct CharacterArgs {
    project_name: String,
    character_name: String,
    description: String,
    #[serde(default)]
    pose: Option<String>,
    #[serde(default)]
    emotion: Option<String>,
    #[serde(default)]
    style: Option<String>,
    #[serde(default)]
    generate_emotions: bool,
}

/// Character prompt with framing instructions that keep sprite scale consistent
pub fn character_prompt(
    character_name: &str,
    description: &str,
    pose: Option<&str>,
    emotion: Option<&str>,
    style: Option<&str>,
) -> String {
    let mut parts = vec![
        format!("Character name: {}.", character_name),
        description.to_string(),
        "Create a full body character sprite suitable for a Ren'Py visual novel with transparent background."
            .to_string(),
        "IMPORTANT FRAMING: Character should fill approximately 70-75% of the vertical frame height, \
         centered, with head near top and feet near bottom."
            .to_string(),
        "Leave some empty space above the head and below the feet for consistent sizing across all characters."
            .to_string(),
        "The character should be drawn at a consistent scale - not too close (filling entire frame) \
         and not too far (tiny in frame)."
            .to_string(),
    ];
    let optional = [("Pose", pose), ("Emotion", emotion), ("Art style", style)];
    for (label, value) in optional {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            parts.push(format!("{}: {}.", label, value));
        }
    }
    parts.join(" ")
}

/// Tool to generate character sprites with transparent derivatives
pub struct GenerateCharacterTool {
    projects: Arc<ProjectManager>,
    images: Arc<ImageService>,
    remover: Arc<BackgroundRemover>,
}

impl GenerateCharacterTool {
    pub fn new(
        projects: Arc<ProjectManager>,
        images: Arc<ImageService>,
        remover: Arc<BackgroundRemover>,
    ) -> Self {
        Self {
            projects,
            images,
            remover,
        }
    }

    /// Remove backgrounds on a blocking worker, one file at a time
    async fn remove_backgrounds(&self, files: &[PathBuf]) -> Vec<PathBuf> {
        let mut transparent = Vec::new();
        for file in files {
            let remover = self.remover.clone();
            let input = file.clone();
            match tokio::task::spawn_blocking(move || remover.remove_background(&input)).await {
                Ok(Some(output)) => transparent.push(output),
                Ok(None) => {}
                Err(e) => tracing::warn!("Background removal worker failed: {}", e),
            }
        }
        transparent
    }
}

#[async_trait::async_trait]
impl Tool for GenerateCharacterTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "generate_character".to_string(),
            description: CHARACTER_DESCRIPTION.to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "project_name": json_schema_string("Name of the project"),
                    "character_name": json_schema_string("Character name (lowercase, used for file names)"),
                    "description": json_schema_string("Detailed visual description"),
                    "pose": json_schema_string("Pose (default: standing)"),
                    "emotion": json_schema_string("Expression (default: neutral)"),
                    "style": json_schema_string("Art style (default: anime visual novel style)"),
                    "generate_emotions": json_schema_boolean("Generate neutral, happy, sad, surprised and angry variants")
                }),
                vec!["project_name", "character_name", "description"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: CharacterArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for generate_character")?;

        if !self.images.is_available() {
            return Ok(CallToolResult::error(BACKEND_UNAVAILABLE));
        }
        let project_dir = match self.projects.ensure_project_dir(&args.project_name) {
            Ok(dir) => dir,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };

        let prompt = character_prompt(
            &args.character_name,
            &args.description,
            args.pose.as_deref(),
            args.emotion.as_deref(),
            args.style.as_deref(),
        );
        let result = self
            .images
            .generate_image(
                &project_dir,
                &prompt,
                AssetCategory::Character,
                Some(&args.character_name),
                args.generate_emotions,
            )
            .await;

        let mut extra = serde_json::Map::new();
        extra.insert("project".to_string(), args.project_name.clone().into());
        extra.insert("character".to_string(), args.character_name.clone().into());

        if result.success {
            let transparent = self.remove_backgrounds(&result.files).await;
            // Transparent derivatives join the originals at the common height
            self.images
                .normalize_category_dir(&project_dir, AssetCategory::Character)
                .await;

            extra.insert(
                "relative_files".to_string(),
                relative_to(&project_dir, &result.files).into(),
            );
            if !transparent.is_empty() {
                extra.insert(
                    "transparent_files".to_string(),
                    relative_to(&project_dir, &transparent).into(),
                );
            }
        }
        generation_payload(&result, extra)
    }
}
