// Project tools: listing, creation, deletion and game file access

use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_object, json_schema_string, Tool};
use anyhow::{Context, Result};
use renpy_forge_core::preview::PreviewRegistry;
use renpy_forge_core::project::ProjectManager;
use serde::Deserialize;
use std::sync::Arc;

/// Tool to list projects in the workspace
pub struct ListProjectsTool {
    projects: Arc<ProjectManager>,
}

impl ListProjectsTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait::async_trait]
impl Tool for ListProjectsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "list_projects".to_string(),
            description: "Return metadata for available projects.".to_string(),
            input_schema: json_schema_object(serde_json::json!({}), vec![]),
        }
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<CallToolResult> {
        let projects = self.projects.list_projects()?;
        CallToolResult::json(&serde_json::json!({ "projects": projects }))
    }
}

#[derive(Debug, Deserialize)]
struct ProjectArgs {
    project_name: String,
}

/// Tool to list files in a project's game directory
pub struct ListProjectFilesTool {
    projects: Arc<ProjectManager>,
}

impl ListProjectFilesTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait::async_trait]
impl Tool for ListProjectFilesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "list_project_files".to_string(),
            description: "List all files in a project's game directory: .rpy scripts, images and \
                          other game files. Useful for inspecting a project before editing."
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
        let args: ProjectArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for list_project_files")?;

        match self.projects.list_files(&args.project_name) {
            Ok(files) => {
                let game_dir = self.projects.project_dir(&args.project_name)?.join("game");
                CallToolResult::json(&serde_json::json!({
                    "project": args.project_name,
                    "game_dir": game_dir,
                    "count": files.len(),
                    "files": files,
                }))
            }
            Err(e) => Ok(CallToolResult::error(e.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    project_name: String,
    file_path: String,
}

/// Tool to read a file from a project's game directory
pub struct ReadProjectFileTool {
    projects: Arc<ProjectManager>,
}

impl ReadProjectFileTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait::async_trait]
impl Tool for ReadProjectFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read_project_file".to_string(),
            description: "Read a file in a project's game directory, e.g. to inspect .rpy scripts \
                          before making edits."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "project_name": json_schema_string("Name of the project"),
                    "file_path": json_schema_string("Path relative to the game directory (e.g. \"script.rpy\")")
                }),
                vec!["project_name", "file_path"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: ReadFileArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for read_project_file")?;

        match self.projects.read_file(&args.project_name, &args.file_path) {
            Ok(contents) => CallToolResult::json(&contents),
            Err(e) => Ok(CallToolResult::error(e.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EditFileArgs {
    project_name: String,
    file_path: String,
    content: String,
}

/// Tool to create or overwrite a file in a project's game directory
pub struct EditProjectFileTool {
    projects: Arc<ProjectManager>,
}

impl EditProjectFileTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait::async_trait]
impl Tool for EditProjectFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "edit_project_file".to_string(),
            description: "Edit or create a file in a project's game directory. The content replaces \
                          the whole file. Call build_project afterwards or the change will not show up."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "project_name": json_schema_string("Name of the project"),
                    "file_path": json_schema_string("Path relative to the game directory (e.g. \"script.rpy\")"),
                    "content": json_schema_string("New content for the file")
                }),
                vec!["project_name", "file_path", "content"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: EditFileArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for edit_project_file")?;

        match self
            .projects
            .write_file(&args.project_name, &args.file_path, &args.content)
        {
            Ok(written) => CallToolResult::json(&serde_json::json!({
                "success": true,
                "project": written.project,
                "file_path": written.file_path,
                "full_path": written.full_path,
                "size": written.size,
                "lines": written.lines,
                "message": format!(
                    "File {} updated successfully. Remember to rebuild the project!",
                    args.file_path
                ),
            })),
            Err(e) => Ok(CallToolResult::error(e.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateProjectArgs {
    name: String,
    #[serde(default)]
    template: Option<String>,
}

/// Tool to create a project from a template
pub struct CreateProjectTool {
    projects: Arc<ProjectManager>,
}

impl CreateProjectTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait::async_trait]
impl Tool for CreateProjectTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "create_project".to_string(),
            description: "Create a new project directory using the requested template. An existing \
                          project with the same name is replaced."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "name": json_schema_string("Name of the project"),
                    "template": json_schema_string("Template name (defaults to the configured default template)")
                }),
                vec!["name"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: CreateProjectArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for create_project")?;

        match self
            .projects
            .create_project(&args.name, args.template.as_deref())
        {
            Ok(created) => CallToolResult::json(&created),
            Err(e) => Ok(CallToolResult::error(e.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeleteProjectArgs {
    name: String,
}

/// Tool to delete a project and its build output
pub struct DeleteProjectTool {
    projects: Arc<ProjectManager>,
    previews: Arc<PreviewRegistry>,
}

impl DeleteProjectTool {
    pub fn new(projects: Arc<ProjectManager>, previews: Arc<PreviewRegistry>) -> Self {
        Self { projects, previews }
    }
}

#[async_trait::async_trait]
impl Tool for DeleteProjectTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "delete_project".to_string(),
            description: "Delete a project directory together with its build output. A running \
                          preview for the project is stopped first."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "name": json_schema_string("Name of the project")
                }),
                vec!["name"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: DeleteProjectArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for delete_project")?;

        if let Err(e) = self.projects.project_dir(&args.name) {
            return Ok(CallToolResult::error(e.to_string()));
        }
        let preview_stopped = self.previews.stop(&args.name).await;

        match self.projects.delete_project(&args.name) {
            Ok(deleted) => CallToolResult::json(&serde_json::json!({
                "project": args.name,
                "deleted": deleted,
                "preview_stopped": preview_stopped,
            })),
            Err(e) => Ok(CallToolResult::error(e.to_string())),
        }
    }
}
