use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for a managed Ren'Py project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters controlling a build request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub project_name: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default)]
    pub force_rebuild: bool,
}

fn default_target() -> String {
    WEB_TARGET.to_string()
}

/// The only build target the toolchain driver implements
pub const WEB_TARGET: &str = "web";

impl BuildRequest {
    pub fn new(project_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            target: target.into(),
            force_rebuild: false,
        }
    }

    pub fn with_force_rebuild(mut self, force_rebuild: bool) -> Self {
        self.force_rebuild = force_rebuild;
        self
    }
}

/// Why a build did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFailureKind {
    ProjectNotFound,
    NoToolchain,
    UnsupportedTarget,
    ToolchainMissingFeature,
    LogUnavailable,
    SpawnFailed,
    NonzeroExit,
}

/// Which artifact a successful build points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutputKind {
    /// Extracted build with runtime files and a packaged game.zip
    Bundle,
    /// Extracted build without the player runtime
    Extracted,
    /// The toolchain's archive, left as produced
    Archive,
}

/// Result payload returned from a build run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub project_name: String,
    pub target: String,
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub output_kind: Option<BuildOutputKind>,
    pub log_path: Option<PathBuf>,
    pub error: Option<String>,
    pub failure: Option<BuildFailureKind>,
}

impl BuildResult {
    pub fn failed(
        request: &BuildRequest,
        failure: BuildFailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            project_name: request.project_name.clone(),
            target: request.target.clone(),
            success: false,
            output_path: None,
            output_kind: None,
            log_path: None,
            error: Some(error.into()),
            failure: Some(failure),
        }
    }

    pub fn succeeded(
        request: &BuildRequest,
        output: Option<(PathBuf, BuildOutputKind)>,
        log_path: PathBuf,
    ) -> Self {
        let (output_path, output_kind) = match output {
            Some((path, kind)) => (Some(path), Some(kind)),
            None => (None, None),
        };
        Self {
            project_name: request.project_name.clone(),
            target: request.target.clone(),
            success: true,
            output_path,
            output_kind,
            log_path: Some(log_path),
            error: None,
            failure: None,
        }
    }

    pub fn with_log(mut self, log_path: PathBuf) -> Self {
        self.log_path = Some(log_path);
        self
    }
}

/// Classification of a generated image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetCategory {
    Background,
    Character,
}

impl AssetCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetCategory::Background => "background",
            AssetCategory::Character => "character",
        }
    }

    /// Aspect ratio requested from the image backend
    pub fn aspect_ratio(&self) -> &'static str {
        match self {
            AssetCategory::Background => "16:9",
            AssetCategory::Character => "2:3",
        }
    }

    pub fn all() -> [AssetCategory; 2] {
        [AssetCategory::Background, AssetCategory::Character]
    }
}

impl std::fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AssetCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "background" => Ok(AssetCategory::Background),
            "character" => Ok(AssetCategory::Character),
            other => Err(format!("Unknown asset category '{}'", other)),
        }
    }
}

/// Metadata about generated image files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGenerationResult {
    pub success: bool,
    pub prompt: String,
    pub image_type: AssetCategory,
    pub files: Vec<PathBuf>,
    pub primary_file: Option<PathBuf>,
    pub error: Option<String>,
}

impl ImageGenerationResult {
    pub fn failed(prompt: &str, image_type: AssetCategory, error: impl Into<String>) -> Self {
        Self {
            success: false,
            prompt: prompt.to_string(),
            image_type,
            files: Vec::new(),
            primary_file: None,
            error: Some(error.into()),
        }
    }

    pub fn saved(prompt: &str, image_type: AssetCategory, files: Vec<PathBuf>) -> Self {
        Self {
            success: true,
            prompt: prompt.to_string(),
            image_type,
            primary_file: files.first().cloned(),
            files,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_defaults() {
        let request: BuildRequest =
            serde_json::from_value(serde_json::json!({"project_name": "demo"})).unwrap();
        assert_eq!(request.target, "web");
        assert!(!request.force_rebuild);
    }

    #[test]
    fn test_failure_serializes_snake_case() {
        let request = BuildRequest::new("demo", "pc");
        let result = BuildResult::failed(&request, BuildFailureKind::UnsupportedTarget, "nope");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["failure"], "unsupported_target");
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_asset_category_parse() {
        assert_eq!("character".parse::<AssetCategory>(), Ok(AssetCategory::Character));
        assert!("portrait".parse::<AssetCategory>().is_err());
        assert_eq!(AssetCategory::Background.aspect_ratio(), "16:9");
    }
}
