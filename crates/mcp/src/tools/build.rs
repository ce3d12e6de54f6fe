// Build and preview tools

use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_boolean, json_schema_object, json_schema_string, Tool};
use anyhow::{Context, Result};
use renpy_forge_core::build::BuildCoordinator;
use renpy_forge_core::preview::PreviewRegistry;
use renpy_forge_core::project::validate_project_name;
use renpy_forge_core::settings::Settings;
use renpy_forge_core::types::{BuildRequest, WEB_TARGET};
use serde::Deserialize;
use std::sync::Arc;

const BUILD_DESCRIPTION: &str = "Build a project with the Ren'Py SDK. Required after every script \
change. Generated images are copied into game/images automatically before the build.

Workflow: generate_background and generate_character, then generate_script, then build_project, \
then start_web_preview.

Requires RENPY_SDK_PATH pointing at an extracted Ren'Py SDK with web support installed. Only the \
\"web\" target is implemented. On success the playable build is in {project}-dists/{project}-web; \
the build log is returned either way.";

fn default_target() -> String {
    WEB_TARGET.to_string()
}

#[derive(Debug, Deserialize)]
struct BuildArgs {
    project_name: String,
    #[serde(default = "default_target")]
    target: String,
    #[serde(default)]
    force_rebuild: bool,
}

/// Tool to run a project build
pub struct BuildProjectTool {
    builds: Arc<BuildCoordinator>,
}

impl BuildProjectTool {
    pub fn new(builds: Arc<BuildCoordinator>) -> Self {
        Self { builds }
    }
}

#[async_trait::async_trait]
impl Tool for BuildProjectTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "build_project".to_string(),
            description: BUILD_DESCRIPTION.to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "project_name": json_schema_string("Name of the project to build"),
                    "target": json_schema_string("Build target (default: \"web\")"),
                    "force_rebuild": json_schema_boolean("Remove previous build output first (default: false)")
                }),
                vec!["project_name"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: BuildArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for build_project")?;

        let request = BuildRequest::new(args.project_name, args.target)
            .with_force_rebuild(args.force_rebuild);
        let result = self.builds.build(&request).await;

        if result.success {
            tracing::info!(
                "Build complete for {} ({}): {:?}",
                result.project_name,
                result.target,
                result.output_path
            );
        } else {
            tracing::error!(
                "Build failed for {} ({}): {}",
                result.project_name,
                result.target,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        Ok(CallToolResult::json(&result)?.failed_if(!result.success))
    }
}

#[derive(Debug, Deserialize)]
struct PreviewArgs {
    project_name: String,
}

/// Tool to serve a project's web build locally
pub struct StartWebPreviewTool {
    settings: Arc<Settings>,
    previews: Arc<PreviewRegistry>,
}

impl StartWebPreviewTool {
    pub fn new(settings: Arc<Settings>, previews: Arc<PreviewRegistry>) -> Self {
        Self { settings, previews }
    }
}

#[async_trait::async_trait]
impl Tool for StartWebPreviewTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "start_web_preview".to_string(),
            description: "Serve the project's latest web build on a local port and return its URL. \
                          A preview already running for the project is replaced."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "project_name": json_schema_string("Name of the project")
                }),
                vec!["project_name"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: PreviewArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for start_web_preview")?;
        if let Err(e) = validate_project_name(&args.project_name) {
            return Ok(CallToolResult::error(e.to_string()));
        }

        let build_dir = self.settings.web_build_dir(&args.project_name);
        if !build_dir.is_dir() {
            return Ok(CallToolResult::error(format!(
                "No web build found for project '{}'. Run build_project first.",
                args.project_name
            )));
        }
        if !build_dir.join("index.html").is_file() {
            return Ok(CallToolResult::error(format!(
                "Web build at {} is missing index.html. Ensure the build completed successfully.",
                build_dir.display()
            )));
        }

        let session = self
            .previews
            .start(&args.project_name, &build_dir)
            .await
            .context("Failed to start preview server")?;

        CallToolResult::json(&serde_json::json!({
            "success": true,
            "project": session.project_name,
            "url": session.url,
            "port": session.port,
        }))
    }
}

/// Tool to stop a running preview
pub struct StopWebPreviewTool {
    previews: Arc<PreviewRegistry>,
}

impl StopWebPreviewTool {
    pub fn new(previews: Arc<PreviewRegistry>) -> Self {
        Self { previews }
    }
}

#[async_trait::async_trait]
impl Tool for StopWebPreviewTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "stop_web_preview".to_string(),
            description: "Stop the local preview server for a project.".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "project_name": json_schema_string("Name of the project")
                }),
                vec!["project_name"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: PreviewArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for stop_web_preview")?;

        let stopped = self.previews.stop(&args.project_name).await;
        CallToolResult::json(&serde_json::json!({
            "project": args.project_name,
            "stopped": stopped,
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::tools::testing::{context, payload};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_without_sdk_reports_no_toolchain() {
        let temp = TempDir::new().unwrap();
        let registry = context(temp.path()).registry();
        registry.call("create_project", json!({"name": "demo"})).await.unwrap();

        let result = registry
            .call("build_project", json!({"project_name": "demo"}))
            .await
            .unwrap();

        assert!(result.is_error());
        let body = payload(&result);
        assert_eq!(body["success"], false);
        assert_eq!(body["target"], "web");
        assert_eq!(body["failure"], "no_toolchain");
    }

    #[tokio::test]
    async fn test_preview_requires_web_build() {
        let temp = TempDir::new().unwrap();
        let registry = context(temp.path()).registry();

        let missing = registry
            .call("start_web_preview", json!({"project_name": "demo"}))
            .await
            .unwrap();
        assert!(missing.is_error());
        assert!(missing.text_content().contains("Run build_project first"));

        std::fs::create_dir_all(temp.path().join("demo-dists/demo-web")).unwrap();
        let no_index = registry
            .call("start_web_preview", json!({"project_name": "demo"}))
            .await
            .unwrap();
        assert!(no_index.is_error());
        assert!(no_index.text_content().contains("missing index.html"));
    }

    #[tokio::test]
    async fn test_preview_start_and_stop() {
        let temp = TempDir::new().unwrap();
        let web_dir = temp.path().join("demo-dists/demo-web");
        std::fs::create_dir_all(&web_dir).unwrap();
        std::fs::write(web_dir.join("index.html"), "<html></html>").unwrap();
        let ctx = context(temp.path());
        let registry = ctx.registry();

        let started = payload(
            &registry
                .call("start_web_preview", json!({"project_name": "demo"}))
                .await
                .unwrap(),
        );
        assert_eq!(started["success"], true);
        let port = started["port"].as_u64().unwrap();
        assert_eq!(started["url"], format!("http://127.0.0.1:{}/index.html", port));
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port as u16)).await.is_ok());

        let stopped = payload(
            &registry
                .call("stop_web_preview", json!({"project_name": "demo"}))
                .await
                .unwrap(),
        );
        assert_eq!(stopped["stopped"], true);
        assert!(ctx.previews.list().is_empty());

        let again = payload(
            &registry
                .call("stop_web_preview", json!({"project_name": "demo"}))
                .await
                .unwrap(),
        );
        assert_eq!(again["stopped"], false);
    }
}
