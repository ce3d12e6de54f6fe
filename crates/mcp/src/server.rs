// MCP server: newline-delimited JSON-RPC over stdio

use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    ReadResourceParams, ReadResourceResult, ResourcesCapability, ServerCapabilities, ServerInfo,
    ToolsCapability, DEFAULT_PROTOCOL_VERSION,
};
use crate::resources;
use crate::tools::{ToolContext, ToolRegistry};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub const SERVER_NAME: &str = "renpy-forge";

#[derive(Clone)]
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    context: ToolContext,
}

impl McpServer {
    pub fn new(context: ToolContext) -> Self {
        let registry = context.registry();
        tracing::info!("Registered {} tools", registry.len());
        Self {
            registry: Arc::new(registry),
            context,
        }
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Serve stdin/stdout until the client disconnects
    pub async fn start(&self) -> Result<()> {
        tracing::info!("MCP server listening on stdio");
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Read one JSON-RPC message per line and write one response per request.
    /// Tool calls run in their own tasks, so a long build does not hold up
    /// other requests; their responses are written as they complete.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        // Dropped at end of input; the loop ends once every task has answered
        let mut tx = Some(tx);

        loop {
            tokio::select! {
                line = lines.next_line(), if tx.is_some() => match line? {
                    Some(line) => {
                        if let Some(sender) = &tx {
                            self.accept_line(&line, sender).await;
                        }
                    }
                    None => {
                        tracing::info!("Client closed the connection");
                        tx = None;
                    }
                },
                response = rx.recv() => match response {
                    Some(response) => write_response(&mut writer, &response).await?,
                    None => break,
                },
            }
        }
        Ok(())
    }

    /// Answer a message inline, or spawn it when it is a tool call
    async fn accept_line(&self, line: &str, responses: &mpsc::UnboundedSender<JsonRpcResponse>) {
        if line.trim().is_empty() {
            return;
        }
        let request = match parse_line(line) {
            Ok(request) => request,
            Err(response) => {
                let _ = responses.send(response);
                return;
            }
        };

        if request.method == "tools/call" {
            let server = self.clone();
            let responses = responses.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle_request(request).await {
                    let _ = responses.send(response);
                }
            });
        } else if let Some(response) = self.handle_request(request).await {
            let _ = responses.send(response);
        }
    }

    /// Handle one raw message. Notifications produce no response.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        match parse_line(line) {
            Ok(request) => self.handle_request(request).await,
            Err(response) => Some(response),
        }
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        tracing::debug!("<- {}", request.method);
        let result = self
            .dispatch(&request.method, request.params.unwrap_or(Value::Null))
            .await;

        let Some(id) = request.id else {
            if let Err(e) = result {
                tracing::debug!("Notification {} failed: {}", request.method, e.message);
            }
            return None;
        };
        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    async fn dispatch(&self, method: &str, params: Value) -> std::result::Result<Value, JsonRpcError> {
        match method {
            "initialize" => self.initialize(params),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => to_result(ListToolsResult {
                tools: self.registry.list_schemas(),
            }),
            "tools/call" => self.call_tool(params).await,
            "resources/list" => {
                let resources = resources::list_build_resources(&self.context.projects)
                    .map_err(|e| JsonRpcError::internal_error(format!("{:#}", e)))?;
                to_result(ListResourcesResult { resources })
            }
            "resources/templates/list" => to_result(ListResourceTemplatesResult {
                resource_templates: vec![resources::build_template()],
            }),
            "resources/read" => {
                let params: ReadResourceParams = parse_params(params)?;
                let contents = resources::read_build_resource(&self.context.settings, &params.uri)
                    .ok_or_else(|| {
                        JsonRpcError::invalid_params(format!("Unknown resource: {}", params.uri))
                    })?;
                to_result(ReadResourceResult {
                    contents: vec![contents],
                })
            }
            m if m.starts_with("notifications/") => Ok(Value::Null),
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    fn initialize(&self, params: Value) -> std::result::Result<Value, JsonRpcError> {
        let protocol_version = match serde_json::from_value::<InitializeParams>(params) {
            Ok(params) => {
                if let Some(client) = &params.client_info {
                    tracing::info!("Client connected: {} {}", client.name, client.version);
                }
                params.protocol_version
            }
            Err(_) => DEFAULT_PROTOCOL_VERSION.to_string(),
        };

        to_result(InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                resources: Some(ResourcesCapability {
                    subscribe: false,
                    list_changed: false,
                }),
            },
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })
    }

    async fn call_tool(&self, params: Value) -> std::result::Result<Value, JsonRpcError> {
        let params: CallToolParams = parse_params(params)?;
        tracing::info!("Calling tool {}", params.name);

        let result = self
            .registry
            .call(&params.name, params.arguments)
            .await
            .ok_or_else(|| JsonRpcError::invalid_params(format!("Unknown tool: {}", params.name)))?;
        to_result(result)
    }
}

/// Decode one line into a request, or the error response owed for it
fn parse_line(line: &str) -> std::result::Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Unparseable message: {}", e);
            return Err(JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error()));
        }
    };

    match serde_json::from_value::<JsonRpcRequest>(value.clone()) {
        Ok(request) if request.jsonrpc == "2.0" => Ok(request),
        _ => {
            let id = value.get("id").cloned().unwrap_or(Value::Null);
            Err(JsonRpcResponse::error(id, JsonRpcError::invalid_request()))
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &JsonRpcResponse) -> Result<()> {
    let mut out = serde_json::to_string(response)?;
    out.push('\n');
    writer.write_all(out.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))
}

fn to_result(value: impl Serialize) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::context;
    use serde_json::json;
    use tempfile::TempDir;

    fn server(temp: &TempDir) -> McpServer {
        McpServer::new(context(temp.path()))
    }

    async fn request(server: &McpServer, id: i64, method: &str, params: Value) -> JsonRpcResponse {
        server
            .handle_request(JsonRpcRequest::new(id, method, params))
            .await
            .unwrap()
    }

    /// Decode the JSON text payload of a tools/call response
    fn tool_payload(response: &JsonRpcResponse) -> Value {
        let text = response.result.as_ref().unwrap()["content"][0]["text"]
            .as_str()
            .unwrap()
            .to_string();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_echoes_protocol_version() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);

        let response = request(
            &server,
            1,
            "initialize",
            json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "1.0"}
            }),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
        assert!(result["capabilities"]["tools"].is_object());
        assert!(result["capabilities"]["resources"].is_object());

        let fallback = request(&server, 2, "initialize", json!({})).await;
        assert_eq!(fallback.result.unwrap()["protocolVersion"], DEFAULT_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);

        let parse = server.handle_line("{not json").await.unwrap();
        assert_eq!(parse.error.unwrap().code, JsonRpcError::PARSE_ERROR);

        let invalid = server.handle_line(r#"{"jsonrpc":"1.0","id":3,"method":"ping"}"#).await.unwrap();
        assert_eq!(invalid.id, json!(3));
        assert_eq!(invalid.error.unwrap().code, JsonRpcError::INVALID_REQUEST);

        let unknown = request(&server, 4, "bogus/method", json!({})).await;
        assert_eq!(unknown.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);

        let unknown_tool = request(&server, 5, "tools/call", json!({"name": "nope"})).await;
        assert_eq!(unknown_tool.error.unwrap().code, JsonRpcError::INVALID_PARAMS);

        let bad_read = request(&server, 6, "resources/read", json!({"uri": "file:///etc"})).await;
        assert_eq!(bad_read.error.unwrap().code, JsonRpcError::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);

        assert!(server
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());
        assert!(server
            .handle_line(r#"{"jsonrpc":"2.0","method":"unknown/notification"}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_tools_list() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);

        let response = request(&server, 1, "tools/list", json!({})).await;
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        assert_eq!(tools.len(), 12);
        for tool in &tools {
            assert_eq!(tool["inputSchema"]["type"], "object");
        }
    }

    #[tokio::test]
    async fn test_create_script_build_flow_without_toolchain() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);

        let created = request(&server, 1, "tools/call", json!({"name": "create_project", "arguments": {"name": "demo"}})).await;
        assert_eq!(tool_payload(&created)["name"], "demo");

        let script = request(
            &server,
            2,
            "tools/call",
            json!({
                "name": "generate_script",
                "arguments": {
                    "project_name": "demo",
                    "script_name": "demo_scene",
                    "script_content": "label demo_scene:\n    \"Hello.\"\n    return\n"
                }
            }),
        )
        .await;
        assert_eq!(tool_payload(&script)["label"], "demo_scene");

        let build = request(
            &server,
            3,
            "tools/call",
            json!({"name": "build_project", "arguments": {"project_name": "demo", "target": "web"}}),
        )
        .await;
        assert_eq!(build.result.as_ref().unwrap()["isError"], true);
        let body = tool_payload(&build);
        assert_eq!(body["success"], false);
        assert_eq!(body["failure"], "no_toolchain");
        assert!(!temp.path().join("demo-dists").exists());

        let summary = request(&server, 4, "resources/read", json!({"uri": "renpy://build/demo"})).await;
        assert_eq!(
            summary.result.unwrap()["contents"][0]["text"],
            "No web build found for project 'demo'."
        );
    }

    #[tokio::test]
    async fn test_resources_list_only_built_projects() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);
        std::fs::create_dir_all(temp.path().join("built")).unwrap();
        std::fs::create_dir_all(temp.path().join("built-dists/built-web")).unwrap();
        std::fs::create_dir_all(temp.path().join("fresh")).unwrap();

        let response = request(&server, 1, "resources/list", json!({})).await;
        let resources = response.result.unwrap()["resources"].clone();
        assert_eq!(resources.as_array().unwrap().len(), 1);
        assert_eq!(resources[0]["uri"], "renpy://build/built");

        let templates = request(&server, 2, "resources/templates/list", json!({})).await;
        assert_eq!(
            templates.result.unwrap()["resourceTemplates"][0]["uriTemplate"],
            resources::BUILD_URI_TEMPLATE
        );
    }

    #[tokio::test]
    async fn test_serve_reads_lines_and_writes_responses() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n"
        );
        let mut output = Vec::new();

        server.serve(input.as_bytes(), &mut output).await.unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
        assert_eq!(lines[1]["id"], 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ping_is_answered_while_a_build_runs() {
        use crate::tools::testing::context_with_settings;
        use renpy_forge_core::settings::Settings;
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let sdk = temp.path().join("sdk");
        std::fs::create_dir_all(sdk.join("web")).unwrap();
        let script = sdk.join("renpy.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let workspace = temp.path().join("workspace");
        std::fs::create_dir_all(workspace.join("demo")).unwrap();

        let mut settings = Settings::for_workspace(&workspace);
        settings.renpy_sdk_path = Some(sdk);
        let server = McpServer::new(context_with_settings(settings));

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"build_project","arguments":{"project_name":"demo"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            "\n"
        );
        let mut output = Vec::new();
        server.serve(input.as_bytes(), &mut output).await.unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], json!({"jsonrpc": "2.0", "id": 2, "result": {}}));
        assert_eq!(lines[1]["id"], 1);
        assert!(lines[1]["result"]["isError"].is_null());
    }
}
