// Workspace settings: file-backed defaults with environment overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_WORKSPACE: &str = "RENPY_MCP_WORKSPACE";
pub const ENV_SDK_PATH: &str = "RENPY_SDK_PATH";
pub const ENV_TEMPLATES: &str = "RENPY_MCP_TEMPLATES";
pub const ENV_REMBG: &str = "RENPY_MCP_REMBG";
pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_GEMINI_IMAGE_MODEL: &str = "GEMINI_IMAGE_MODEL";

/// Settings shared by every manager. Constructed once by the entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding one folder per project
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Extracted Ren'Py SDK used to build projects
    #[serde(default)]
    pub renpy_sdk_path: Option<PathBuf>,

    /// Template used when create_project is called without one
    #[serde(default = "default_template")]
    pub default_template: String,

    /// Optional directory with additional project templates
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,

    #[serde(default)]
    pub image: ImageSettings,

    #[serde(default)]
    pub background_removal: BackgroundRemovalSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSettings {
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_image_model")]
    pub model: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Height every character sprite is normalized to
    #[serde(default = "default_character_height")]
    pub character_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundRemovalSettings {
    #[serde(default = "default_rembg_command")]
    pub command: String,

    /// Optional square output size applied after removal
    #[serde(default)]
    pub resize_to: Option<u32>,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("workspace")
}

fn default_template() -> String {
    "basic".to_string()
}

fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_character_height() -> u32 {
    750
}

fn default_rembg_command() -> String {
    "rembg".to_string()
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_image_model(),
            api_base: default_api_base(),
            character_height: default_character_height(),
        }
    }
}

impl Default for BackgroundRemovalSettings {
    fn default() -> Self {
        Self {
            command: default_rembg_command(),
            resize_to: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            renpy_sdk_path: None,
            default_template: default_template(),
            templates_dir: None,
            image: ImageSettings::default(),
            background_removal: BackgroundRemovalSettings::default(),
        }
    }
}

impl Settings {
    /// Settings rooted at a workspace directory with everything else defaulted
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            ..Default::default()
        }
    }

    /// Load settings from an optional TOML file, then apply environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = Self::from_file(config_path)?;
        settings.apply_env(|key| std::env::var(key).ok());
        settings.finalize()?;
        Ok(settings)
    }

    /// Settings from an optional TOML file without overrides or finalization
    pub fn from_file(config_path: Option<&Path>) -> Result<Self> {
        let settings: Self = match config_path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings file {}", path.display()))?;
                toml::from_str(&content).context("Failed to parse settings file")?
            }
            Some(path) => {
                tracing::info!("Settings file {} not found, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };
        Ok(settings)
    }

    /// Apply overrides from a variable lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(root) = get(ENV_WORKSPACE) {
            self.workspace_root = PathBuf::from(root);
        }
        if let Some(sdk) = get(ENV_SDK_PATH) {
            self.renpy_sdk_path = Some(PathBuf::from(sdk));
        }
        if let Some(templates) = get(ENV_TEMPLATES) {
            self.templates_dir = Some(PathBuf::from(templates));
        }
        if let Some(command) = get(ENV_REMBG) {
            self.background_removal.command = command;
        }
        if let Some(key) = get(ENV_GEMINI_API_KEY) {
            self.image.api_key = Some(key);
        }
        if let Some(model) = get(ENV_GEMINI_IMAGE_MODEL) {
            self.image.model = model;
        }
    }

    /// Resolve relative paths, create the workspace and detect a local SDK.
    pub fn finalize(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.workspace_root).with_context(|| {
            format!(
                "Failed to create workspace directory {}",
                self.workspace_root.display()
            )
        })?;
        self.workspace_root = self
            .workspace_root
            .canonicalize()
            .context("Failed to resolve workspace directory")?;

        self.renpy_sdk_path = match self.renpy_sdk_path.take() {
            Some(path) if path.exists() => Some(path.canonicalize()?),
            Some(path) => {
                tracing::warn!("Configured Ren'Py SDK {} does not exist", path.display());
                None
            }
            None => {
                let local = PathBuf::from("renpy");
                if local.exists() {
                    Some(local.canonicalize()?)
                } else {
                    None
                }
            }
        };

        Ok(())
    }

    /// Directory the toolchain writes distributions into for a project
    pub fn dists_dir(&self, project_name: &str) -> PathBuf {
        self.workspace_root.join(format!("{}-dists", project_name))
    }

    /// Directory holding the servable web build for a project
    pub fn web_build_dir(&self, project_name: &str) -> PathBuf {
        self.dists_dir(project_name)
            .join(format!("{}-web", project_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_WORKSPACE, "/tmp/ws"),
            (ENV_GEMINI_API_KEY, "secret"),
            (ENV_GEMINI_IMAGE_MODEL, ""),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.workspace_root, PathBuf::from("/tmp/ws"));
        assert_eq!(settings.image.api_key.as_deref(), Some("secret"));
        // Empty values do not override
        assert_eq!(settings.image.model, "gemini-2.5-flash-image");
    }

    #[test]
    fn test_parse_toml() {
        let settings: Settings = toml::from_str(
            r#"
            workspace_root = "games"
            default_template = "dating"

            [image]
            character_height = 600
            "#,
        )
        .unwrap();

        assert_eq!(settings.workspace_root, PathBuf::from("games"));
        assert_eq!(settings.default_template, "dating");
        assert_eq!(settings.image.character_height, 600);
        assert_eq!(settings.background_removal.command, "rembg");
    }

    #[test]
    fn test_finalize_drops_missing_sdk() {
        let temp = TempDir::new().unwrap();
        let mut settings = Settings::for_workspace(temp.path().join("ws"));
        settings.renpy_sdk_path = Some(temp.path().join("does-not-exist"));

        settings.finalize().unwrap();

        assert!(settings.workspace_root.is_dir());
        assert!(settings.renpy_sdk_path.is_none());
    }

    #[test]
    fn test_build_dirs() {
        let settings = Settings::for_workspace("/ws");
        assert_eq!(
            settings.web_build_dir("demo"),
            PathBuf::from("/ws/demo-dists/demo-web")
        );
    }
}
