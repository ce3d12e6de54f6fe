// Standalone MCP server binary

use anyhow::Result;
use clap::Parser;
use renpy_forge_core::settings::{Settings, ENV_SDK_PATH, ENV_WORKSPACE};
use renpy_forge_mcp::{McpServer, ToolContext};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "renpy-forge-mcp")]
#[command(about = "MCP server for building Ren'Py visual novels", long_about = None)]
struct Args {
    /// Path to a TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding one folder per project
    #[arg(short, long, env = ENV_WORKSPACE)]
    workspace: Option<PathBuf>,

    /// Extracted Ren'Py SDK used for builds
    #[arg(long, env = ENV_SDK_PATH)]
    sdk_path: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "renpy_forge=info".into());

    // stdout carries the protocol, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!("Ren'Py MCP server starting...");

    let mut settings = Settings::from_file(args.config.as_deref())?;
    settings.apply_env(|key| std::env::var(key).ok());
    if let Some(workspace) = args.workspace {
        settings.workspace_root = workspace;
    }
    if let Some(sdk_path) = args.sdk_path {
        settings.renpy_sdk_path = Some(sdk_path);
    }
    settings.finalize()?;

    tracing::info!("Workspace: {}", settings.workspace_root.display());
    match &settings.renpy_sdk_path {
        Some(sdk) => tracing::info!("Ren'Py SDK: {}", sdk.display()),
        None => tracing::warn!("No Ren'Py SDK configured; builds will fail until {} is set", ENV_SDK_PATH),
    }

    let context = ToolContext::from_settings(settings)?;
    let previews = context.previews.clone();
    let server = McpServer::new(context);

    let outcome = tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    };

    previews.stop_all().await;
    tracing::info!("Ren'Py MCP server stopped");
    outcome
}
