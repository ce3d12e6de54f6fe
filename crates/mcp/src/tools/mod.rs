pub mod assets;
pub mod build;
pub mod projects;
pub mod script;
mod registry;

pub use assets::{GenerateBackgroundTool, GenerateCharacterTool};
pub use build::{BuildProjectTool, StartWebPreviewTool, StopWebPreviewTool};
pub use projects::{
    CreateProjectTool, DeleteProjectTool, EditProjectFileTool, ListProjectFilesTool,
    ListProjectsTool, ReadProjectFileTool,
};
pub use registry::{json_schema_boolean, json_schema_object, json_schema_string, Tool, ToolRegistry};
pub use script::GenerateScriptTool;

use anyhow::Result;
use renpy_forge_core::background::BackgroundRemover;
use renpy_forge_core::build::BuildCoordinator;
use renpy_forge_core::image::ImageService;
use renpy_forge_core::preview::PreviewRegistry;
use renpy_forge_core::project::ProjectManager;
use renpy_forge_core::settings::Settings;
use std::sync::Arc;

/// Managers shared by every tool
#[derive(Clone)]
pub struct ToolContext {
    pub settings: Arc<Settings>,
    pub projects: Arc<ProjectManager>,
    pub builds: Arc<BuildCoordinator>,
    pub previews: Arc<PreviewRegistry>,
    pub images: Arc<ImageService>,
    pub remover: Arc<BackgroundRemover>,
}

impl ToolContext {
    /// Wire up production managers: Gemini when a key is set, rembg when on PATH
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let images = ImageService::from_settings(&settings);
        let remover = BackgroundRemover::from_settings(&settings.background_removal);
        Self::with_services(settings, images, remover)
    }

    pub fn with_services(settings: Settings, images: ImageService, remover: BackgroundRemover) -> Result<Self> {
        let settings = Arc::new(settings);
        Ok(Self {
            projects: Arc::new(ProjectManager::new(settings.clone())?),
            builds: Arc::new(BuildCoordinator::new(settings.clone())),
            previews: Arc::new(PreviewRegistry::new()),
            images: Arc::new(images),
            remover: Arc::new(remover),
            settings,
        })
    }

    /// Registry holding every tool the server exposes
    pub fn registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();

        // Project and file management
        registry.register(Arc::new(ListProjectsTool::new(self.projects.clone())));
        registry.register(Arc::new(ListProjectFilesTool::new(self.projects.clone())));
        registry.register(Arc::new(ReadProjectFileTool::new(self.projects.clone())));
        registry.register(Arc::new(EditProjectFileTool::new(self.projects.clone())));
        registry.register(Arc::new(CreateProjectTool::new(self.projects.clone())));
        registry.register(Arc::new(DeleteProjectTool::new(
            self.projects.clone(),
            self.previews.clone(),
        )));

        // Assets and scripts
        registry.register(Arc::new(GenerateBackgroundTool::new(
            self.projects.clone(),
            self.images.clone(),
        )));
        registry.register(Arc::new(GenerateCharacterTool::new(
            self.projects.clone(),
            self.images.clone(),
            self.remover.clone(),
        )));
        registry.register(Arc::new(GenerateScriptTool::new(self.projects.clone())));

        // Build and preview
        registry.register(Arc::new(BuildProjectTool::new(self.builds.clone())));
        registry.register(Arc::new(StartWebPreviewTool::new(
            self.settings.clone(),
            self.previews.clone(),
        )));
        registry.register(Arc::new(StopWebPreviewTool::new(self.previews.clone())));

        registry
    }
}
