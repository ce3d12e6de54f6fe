// Project directory management: workspace listing, templates and game files

use crate::settings::Settings;
use crate::types::ProjectInfo;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Marker line that identifies an untouched template entry script
pub const DEFAULT_SCRIPT_MARKER: &str = "Welcome to your new Ren'Py project!";

const BASIC_TEMPLATE: &[(&str, &str)] = &[
    (
        "game/script.rpy",
        include_str!("../templates/basic/game/script.rpy"),
    ),
    (
        "game/options.rpy",
        include_str!("../templates/basic/game/options.rpy"),
    ),
];

const FALLBACK_SCRIPT: &str = "label start:\n    \"Hello from the Ren'Py MCP server!\"\n";

const PREVIEW_LINES: usize = 15;

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Invalid project name '{0}'")]
    InvalidName(String),

    #[error("Path '{0}' must be relative to the project's game directory")]
    PathOutsideProject(String),

    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("File {file} not found in project {project}")]
    FileNotFound { project: String, file: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ProjectResult<T> = std::result::Result<T, ProjectError>;

/// Where a template's files come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    Directory(PathBuf),
    BuiltIn(&'static [(&'static str, &'static str)]),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedProject {
    pub name: String,
    pub path: PathBuf,
    pub template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    pub path: String,
    pub full_path: PathBuf,
    pub size: u64,
    #[serde(rename = "type")]
    pub extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContents {
    pub project: String,
    pub file_path: String,
    pub full_path: PathBuf,
    pub content: String,
    pub size: usize,
    pub lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWritten {
    pub project: String,
    pub file_path: String,
    pub full_path: PathBuf,
    pub size: usize,
    pub lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptWritten {
    pub project_name: String,
    pub script_name: String,
    pub script_path: PathBuf,
    pub label: Option<String>,
    pub entry_script_updated: bool,
    pub preview: String,
}

/// Manage project directories and their game files
pub struct ProjectManager {
    settings: Arc<Settings>,
}

impl ProjectManager {
    pub fn new(settings: Arc<Settings>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&settings.workspace_root)
            .context("Failed to create workspace directory")?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn workspace_root(&self) -> &Path {
        &self.settings.workspace_root
    }

    /// Return metadata for all known projects, sorted by name
    pub fn list_projects(&self) -> ProjectResult<Vec<ProjectInfo>> {
        let mut projects = Vec::new();
        for entry in std::fs::read_dir(self.workspace_root())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.ends_with("-dists") {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_dir() {
                continue;
            }

            let updated_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let created_at = metadata
                .created()
                .map(DateTime::<Utc>::from)
                .unwrap_or(updated_at);

            projects.push(ProjectInfo {
                name,
                path: entry.path(),
                created_at,
                updated_at,
            });
        }
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    /// Absolute project directory without touching the filesystem
    pub fn project_dir(&self, name: &str) -> ProjectResult<PathBuf> {
        validate_project_name(name)?;
        Ok(self.workspace_root().join(name))
    }

    /// Return the project directory, creating it if necessary. Never erases content.
    pub fn ensure_project_dir(&self, name: &str) -> ProjectResult<PathBuf> {
        let dir = self.project_dir(name)?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove a project directory and its build output
    pub fn delete_project(&self, name: &str) -> ProjectResult<bool> {
        let dir = self.project_dir(name)?;
        let existed = dir.exists();
        if existed {
            std::fs::remove_dir_all(&dir)?;
        }
        let dists = self.settings.dists_dir(name);
        if dists.exists() {
            std::fs::remove_dir_all(&dists)?;
        }
        tracing::info!("Deleted project {} (existed: {})", name, existed);
        Ok(existed)
    }

    /// Locate a template by name: configured templates directory first, then built-ins
    pub fn find_template(&self, name: &str) -> Option<Template> {
        if let Some(dir) = &self.settings.templates_dir {
            let candidate = dir.join(name);
            if candidate.is_dir() {
                return Some(Template::Directory(candidate));
            }
        }
        match name {
            "basic" => Some(Template::BuiltIn(BASIC_TEMPLATE)),
            _ => None,
        }
    }

    /// Replace `destination` with the template's contents
    pub fn copy_template(&self, destination: &Path, template: Option<&Template>) -> ProjectResult<()> {
        if destination.exists() {
            std::fs::remove_dir_all(destination)?;
        }

        match template {
            None => {
                let game_dir = destination.join("game");
                std::fs::create_dir_all(&game_dir)?;
                std::fs::write(game_dir.join("script.rpy"), FALLBACK_SCRIPT)?;
            }
            Some(Template::BuiltIn(files)) => {
                for (rel, content) in files.iter() {
                    let target = destination.join(rel);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&target, content)?;
                }
            }
            Some(Template::Directory(source)) => {
                copy_dir_all(source, destination)?;
            }
        }
        Ok(())
    }

    /// Create (or re-seed) a project from a named template
    pub fn create_project(&self, name: &str, template: Option<&str>) -> ProjectResult<CreatedProject> {
        let template_name = template
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.settings.default_template)
            .to_string();
        let project_dir = self.ensure_project_dir(name)?;
        let found = self.find_template(&template_name);
        if found.is_none() {
            tracing::warn!(
                "Template '{}' not found, seeding {} with a minimal script",
                template_name,
                name
            );
        }
        self.copy_template(&project_dir, found.as_ref())?;

        tracing::info!(
            "Created project {} from template {} at {}",
            name,
            template_name,
            project_dir.display()
        );
        Ok(CreatedProject {
            name: name.to_string(),
            path: project_dir,
            template: template_name,
        })
    }

    fn game_dir(&self, name: &str) -> ProjectResult<PathBuf> {
        Ok(self.ensure_project_dir(name)?.join("game"))
    }

    /// List every file below the project's game directory
    pub fn list_files(&self, name: &str) -> ProjectResult<Vec<ProjectFile>> {
        let game_dir = self.game_dir(name)?;
        if !game_dir.is_dir() {
            return Err(ProjectError::FileNotFound {
                project: name.to_string(),
                file: "game/".to_string(),
            });
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&game_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| anyhow::anyhow!(e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&game_dir)
                .map_err(|e| anyhow::anyhow!(e))?;
            files.push(ProjectFile {
                path: rel.to_string_lossy().replace('\\', "/"),
                full_path: entry.path().to_path_buf(),
                size: entry.metadata().map(|m| m.len()).unwrap_or(0),
                extension: entry
                    .path()
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default(),
            });
        }
        Ok(files)
    }

    /// Read a UTF-8 file from the project's game directory
    pub fn read_file(&self, name: &str, file_path: &str) -> ProjectResult<FileContents> {
        let game_dir = self.game_dir(name)?;
        let target = resolve_relative(&game_dir, file_path)?;
        if !target.is_file() {
            return Err(ProjectError::FileNotFound {
                project: name.to_string(),
                file: file_path.to_string(),
            });
        }

        let content = std::fs::read_to_string(&target)
            .with_context(|| format!("Failed to read {}", file_path))?;
        Ok(FileContents {
            project: name.to_string(),
            file_path: file_path.to_string(),
            full_path: target,
            size: content.len(),
            lines: content.lines().count(),
            content,
        })
    }

    /// Create or overwrite a file in the project's game directory
    pub fn write_file(&self, name: &str, file_path: &str, content: &str) -> ProjectResult<FileWritten> {
        let game_dir = self.game_dir(name)?;
        let target = resolve_relative(&game_dir, file_path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;

        tracing::info!("Edited {} in project {}", file_path, name);
        Ok(FileWritten {
            project: name.to_string(),
            file_path: file_path.to_string(),
            full_path: target,
            size: content.len(),
            lines: content.lines().count(),
        })
    }

    /// Write a named script and hook its first label into an untouched entry script
    pub fn write_script(&self, name: &str, script_name: &str, content: &str) -> ProjectResult<ScriptWritten> {
        let project_dir = self.ensure_project_dir(name)?;
        let safe_name = sanitize_script_name(script_name);
        let rel_path = PathBuf::from("game").join(format!("{}.rpy", safe_name));
        let script_path = project_dir.join(&rel_path);
        if let Some(parent) = script_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&script_path, content)?;
        tracing::info!(
            "Wrote script {} ({} bytes)",
            script_path.display(),
            content.len()
        );

        let label = first_label(content);
        let mut entry_script_updated = false;
        let main_script = project_dir.join("game").join("script.rpy");
        if let Some(label) = &label {
            if safe_name != "script" && main_script.is_file() {
                let main_content = std::fs::read_to_string(&main_script)?;
                if main_content.contains(DEFAULT_SCRIPT_MARKER) {
                    std::fs::write(&main_script, entry_script_calling(label))?;
                    entry_script_updated = true;
                    tracing::info!("Updated script.rpy to call label {}", label);
                }
            }
        }

        Ok(ScriptWritten {
            project_name: name.to_string(),
            script_name: safe_name,
            script_path: rel_path,
            label,
            entry_script_updated,
            preview: preview_lines(content),
        })
    }
}

/// Project names are a single, visible path component
pub fn validate_project_name(name: &str) -> ProjectResult<()> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed != name
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.ends_with("-dists");
    if invalid {
        return Err(ProjectError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Join a user-supplied relative path onto `base`, refusing anything that escapes it
fn resolve_relative(base: &Path, rel: &str) -> ProjectResult<PathBuf> {
    let rel_path = Path::new(rel);
    if rel.trim().is_empty() {
        return Err(ProjectError::PathOutsideProject(rel.to_string()));
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ProjectError::PathOutsideProject(rel.to_string())),
        }
    }
    Ok(base.join(rel_path))
}

/// Lowercase, `[^a-z0-9_]` runs collapsed to `_`
pub fn sanitize_script_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            if pending_sep {
                out.push('_');
                pending_sep = false;
            }
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "scene".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Name of the first `label name:` statement in a script
pub fn first_label(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix("label ")?;
        let colon = rest.find(':')?;
        let label = rest[..colon].trim();
        (!label.is_empty()).then(|| label.to_string())
    })
}

fn entry_script_calling(label: &str) -> String {
    format!("label start:\n    call {}\n\n    return\n", label)
}

fn preview_lines(content: &str) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut preview = lines
        .iter()
        .take(PREVIEW_LINES)
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    if lines.len() > PREVIEW_LINES {
        preview.push_str("\n... (truncated)");
    }
    preview
}

/// Recursively copy `source` into `destination`, merging into existing directories
pub fn copy_dir_all(source: &Path, destination: &Path) -> anyhow::Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source)?;
        let target = destination.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
