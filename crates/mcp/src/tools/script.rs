// Script tool: save client-written Ren'Py scripts into a project

use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_object, json_schema_string, Tool};
use anyhow::{Context, Result};
use renpy_forge_core::project::ProjectManager;
use serde::Deserialize;
use std::sync::Arc;

const SCRIPT_DESCRIPTION: &str = "Save a Ren'Py script written by you (the client) into the project.

Guidelines:
- Never use `label start` in generated scripts. Use a unique label named after the script, \
e.g. `label tennis_date:`. The project's script.rpy calls the first label of a new script \
while it is still the untouched template.
- Include at least one menu with two or three choices.
- Give every `show` an `at` clause (e.g. `show alice at scaled, left_pos`) and keep it when \
switching emotions, otherwise sprites change size or get duplicated.
- Backgrounds are referenced as \"images/{file}.png\", characters as \
\"images/{name}_{emotion}_transparent.png\".
- Use transitions (dissolve, fade, moveinleft) when changing scenes or bringing sprites on screen.

Call build_project afterwards to compile the game.";

#[derive(Debug, Deserialize)]
struct GenerateScriptArgs {
    project_name: String,
    script_name: String,
    script_content: String,
}

/// Tool to write a script file and register it with the entry script
pub struct GenerateScriptTool {
    projects: Arc<ProjectManager>,
}

impl GenerateScriptTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait::async_trait]
impl Tool for GenerateScriptTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "generate_script".to_string(),
            description: SCRIPT_DESCRIPTION.to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "project_name": json_schema_string("Name of the project"),
                    "script_name": json_schema_string("Script file name (\"intro\" creates game/intro.rpy)"),
                    "script_content": json_schema_string("Complete Ren'Py script content")
                }),
                vec!["project_name", "script_name", "script_content"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: GenerateScriptArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for generate_script")?;

        let written = match self.projects.write_script(
            &args.project_name,
            &args.script_name,
            &args.script_content,
        ) {
            Ok(written) => written,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };

        let script_path = written.script_path.to_string_lossy().replace('\\', "/");
        let mut message = format!("Script saved to {}", script_path);
        if let (Some(label), true) = (&written.label, written.entry_script_updated) {
            message.push_str(&format!(" and main script.rpy updated to call '{}'", label));
        }

        CallToolResult::json(&serde_json::json!({
            "success": true,
            "project_name": written.project_name,
            "script_name": written.script_name,
            "script_path": script_path,
            "label": written.label,
            "entry_script_updated": written.entry_script_updated,
            "preview": written.preview,
            "message": message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::tools::testing::{context, payload};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_script_is_registered_with_template_entry() {
        let temp = TempDir::new().unwrap();
        let registry = context(temp.path()).registry();
        registry
            .call("create_project", json!({"name": "demo"}))
            .await
            .unwrap();

        let result = registry
            .call(
                "generate_script",
                json!({
                    "project_name": "demo",
                    "script_name": "Tennis Date!",
                    "script_content": "label tennis_date:\n    \"Serve!\"\n    return\n"
                }),
            )
            .await
            .unwrap();

        let body = payload(&result);
        assert_eq!(body["script_name"], "tennis_date");
        assert_eq!(body["script_path"], "game/tennis_date.rpy");
        assert_eq!(body["entry_script_updated"], true);
        assert!(body["message"].as_str().unwrap().contains("call 'tennis_date'"));

        let main = std::fs::read_to_string(temp.path().join("demo/game/script.rpy")).unwrap();
        assert!(main.contains("call tennis_date"));

        // The entry script is no longer the template, so a second script leaves it alone
        let second = registry
            .call(
                "generate_script",
                json!({
                    "project_name": "demo",
                    "script_name": "epilogue",
                    "script_content": "label epilogue:\n    return\n"
                }),
            )
            .await
            .unwrap();
        assert_eq!(payload(&second)["entry_script_updated"], false);
        let main_after = std::fs::read_to_string(temp.path().join("demo/game/script.rpy")).unwrap();
        assert_eq!(main, main_after);
    }
}
