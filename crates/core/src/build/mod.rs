// Build coordination: staged assets, toolchain run and web post-processing

pub mod bundle;
pub mod toolchain;

use crate::locks::KeyedLocks;
use crate::settings::Settings;
use crate::types::{BuildFailureKind, BuildRequest, BuildResult, WEB_TARGET};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
pub use toolchain::LocalToolchain;

/// Extensions copied from staged asset folders into the game
pub const STAGED_ASSET_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

const STAGED_ASSET_DIRS: [&str; 2] = ["background", "character"];

/// Reasons a build stops before producing output
#[derive(Debug, thiserror::Error)]
pub enum BuildFailure {
    #[error("Project '{name}' not found in {workspace}")]
    ProjectNotFound { name: String, workspace: PathBuf },

    #[error("No usable Ren'Py SDK found. Set the RENPY_SDK_PATH environment variable to an extracted Ren'Py SDK.")]
    SdkNotConfigured,

    #[error("No usable Ren'Py SDK found. Checked {0}, but could not locate 'renpy.sh'.")]
    ExecutableNotFound(PathBuf),

    #[error("Unsupported build target '{0}'. Only 'web' is currently implemented.")]
    UnsupportedTarget(String),

    #[error("Ren'Py Web support is not installed. Open the Ren'Py launcher and download web support, or place the 'web' directory inside the SDK path.")]
    WebSupportMissing,

    #[error("Could not create build log {}: {reason:#}", path.display())]
    LogUnavailable { path: PathBuf, reason: anyhow::Error },

    #[error("Failed to start Ren'Py: {0:#}")]
    Spawn(anyhow::Error),

    #[error("Ren'Py exited with status {code}. See log at {}", log.display())]
    NonzeroExit { code: i32, log: PathBuf },
}

impl BuildFailure {
    pub fn kind(&self) -> BuildFailureKind {
        match self {
            BuildFailure::ProjectNotFound { .. } => BuildFailureKind::ProjectNotFound,
            BuildFailure::SdkNotConfigured | BuildFailure::ExecutableNotFound(_) => {
                BuildFailureKind::NoToolchain
            }
            BuildFailure::UnsupportedTarget(_) => BuildFailureKind::UnsupportedTarget,
            BuildFailure::WebSupportMissing => BuildFailureKind::ToolchainMissingFeature,
            BuildFailure::LogUnavailable { .. } => BuildFailureKind::LogUnavailable,
            BuildFailure::Spawn(_) => BuildFailureKind::SpawnFailed,
            BuildFailure::NonzeroExit { .. } => BuildFailureKind::NonzeroExit,
        }
    }

    fn into_result(self, request: &BuildRequest) -> BuildResult {
        let log = match &self {
            BuildFailure::NonzeroExit { log, .. } => Some(log.clone()),
            _ => None,
        };
        let result = BuildResult::failed(request, self.kind(), self.to_string());
        match log {
            Some(log) => result.with_log(log),
            None => result,
        }
    }
}

/// Runs builds one at a time per project
pub struct BuildCoordinator {
    settings: Arc<Settings>,
    locks: KeyedLocks,
}

impl BuildCoordinator {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            locks: KeyedLocks::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Execute a build request. Failures are reported in the result, never as `Err`.
    pub async fn build(&self, request: &BuildRequest) -> BuildResult {
        let _guard = self.locks.lock(&request.project_name).await;
        tracing::info!(
            "Build requested for {} (target: {}, force: {})",
            request.project_name,
            request.target,
            request.force_rebuild
        );

        match self.run(request).await {
            Ok(result) => result,
            Err(failure) => {
                tracing::warn!("Build of {} failed: {}", request.project_name, failure);
                failure.into_result(request)
            }
        }
    }

    async fn run(&self, request: &BuildRequest) -> std::result::Result<BuildResult, BuildFailure> {
        let name = request.project_name.as_str();
        let project_dir = self.settings.workspace_root.join(name);
        if crate::project::validate_project_name(name).is_err() || !project_dir.is_dir() {
            return Err(BuildFailure::ProjectNotFound {
                name: name.to_string(),
                workspace: self.settings.workspace_root.clone(),
            });
        }

        let staged_from = project_dir.clone();
        match run_blocking(move || copy_staged_assets(&staged_from)).await {
            Ok(0) => {}
            Ok(copied) => tracing::info!("Copied {} staged assets into {}", copied, name),
            Err(e) => tracing::warn!("Failed to copy staged assets for {}: {:#}", name, e),
        }

        let toolchain = self.resolve_toolchain()?;

        if request.target != WEB_TARGET {
            return Err(BuildFailure::UnsupportedTarget(request.target.clone()));
        }
        if !toolchain.web_support_available() {
            return Err(BuildFailure::WebSupportMissing);
        }

        let destination = self.settings.dists_dir(name);
        let web_dir = self.settings.web_build_dir(name);
        if request.force_rebuild {
            let (dest, web) = (destination.clone(), web_dir.clone());
            if let Err(e) = run_blocking(move || bundle::clean_previous_output(&dest, &web)).await {
                tracing::warn!("Failed to clean previous build of {}: {:#}", name, e);
            }
        }

        let command = toolchain
            .distribute_command(&project_dir, &destination)
            .ok_or_else(|| BuildFailure::ExecutableNotFound(toolchain.sdk_path().to_path_buf()))?;

        let log_path = project_dir.join("logs").join(format!(
            "build-{}-{}.log",
            request.target,
            Utc::now().format("%Y%m%d-%H%M%S")
        ));
        let log = create_log(&log_path)
            .await
            .map_err(|reason| BuildFailure::LogUnavailable {
                path: log_path.clone(),
                reason,
            })?;

        tracing::info!(
            "Starting Ren'Py build: {} {} (log: {})",
            command.program.display(),
            command.args.join(" "),
            log_path.display()
        );

        let code = toolchain::run_with_log(&command, log)
            .await
            .map_err(BuildFailure::Spawn)?;
        if code != 0 {
            return Err(BuildFailure::NonzeroExit {
                code,
                log: log_path,
            });
        }

        let runtime_dir = toolchain.web_runtime_dir();
        let title = name.to_string();
        let output = tokio::task::spawn_blocking(move || {
            bundle::post_process(&destination, &web_dir, &runtime_dir, &title)
        })
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Post-processing task failed: {}", e);
            None
        });

        tracing::info!(
            "Build of {} finished: {}",
            name,
            output
                .as_ref()
                .map(|(path, kind)| format!("{:?} at {}", kind, path.display()))
                .unwrap_or_else(|| "no output found".to_string())
        );
        Ok(BuildResult::succeeded(request, output, log_path))
    }

    fn resolve_toolchain(&self) -> std::result::Result<LocalToolchain, BuildFailure> {
        let sdk = self
            .settings
            .renpy_sdk_path
            .as_ref()
            .ok_or(BuildFailure::SdkNotConfigured)?;
        let toolchain = LocalToolchain::new(sdk);
        if !toolchain.available() {
            return Err(BuildFailure::ExecutableNotFound(sdk.clone()));
        }
        Ok(toolchain)
    }
}

/// Run filesystem work on the blocking pool
async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("Blocking task did not complete")?
}

async fn create_log(path: &Path) -> Result<tokio::fs::File> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))
}

/// Copy generated images from `assets/{background,character}` into `game/images`.
/// Returns the number of files copied.
pub fn copy_staged_assets(project_dir: &Path) -> Result<usize> {
    let images_dir = project_dir.join("game").join("images");
    let mut copied = 0;

    for category in STAGED_ASSET_DIRS {
        let source = project_dir.join("assets").join(category);
        if !source.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&source)? {
            let path = entry?.path();
            let staged = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .map(|e| STAGED_ASSET_EXTENSIONS.contains(&e.as_str()))
                .unwrap_or(false);
            if !path.is_file() || !staged {
                continue;
            }
            let Some(file_name) = path.file_name() else {
                continue;
            };
            std::fs::create_dir_all(&images_dir)?;
            std::fs::copy(&path, images_dir.join(file_name))?;
            tracing::debug!("Copied asset {} into game/images", path.display());
            copied += 1;
        }
    }
    Ok(copied)
}
