// Build summary resource: renpy://build/{project_name}

use crate::protocol::{Resource, ResourceContents, ResourceTemplate};
use renpy_forge_core::project::{validate_project_name, ProjectManager};
use renpy_forge_core::settings::Settings;
use std::path::{Path, PathBuf};

pub const BUILD_URI_PREFIX: &str = "renpy://build/";
pub const BUILD_URI_TEMPLATE: &str = "renpy://build/{project_name}";

const TEXT_MIME: &str = "text/plain";

pub fn build_uri(project_name: &str) -> String {
    format!("{}{}", BUILD_URI_PREFIX, project_name)
}

/// Project named by a build resource URI
pub fn project_from_uri(uri: &str) -> Option<&str> {
    let name = uri.strip_prefix(BUILD_URI_PREFIX)?;
    validate_project_name(name).ok()?;
    Some(name)
}

pub fn build_template() -> ResourceTemplate {
    ResourceTemplate {
        uri_template: BUILD_URI_TEMPLATE.to_string(),
        name: "build".to_string(),
        description: Some("Summary of the latest web build for a project".to_string()),
        mime_type: Some(TEXT_MIME.to_string()),
    }
}

/// One build resource per project that has a web build
pub fn list_build_resources(projects: &ProjectManager) -> anyhow::Result<Vec<Resource>> {
    let settings = projects.settings();
    Ok(projects
        .list_projects()?
        .into_iter()
        .filter(|p| settings.web_build_dir(&p.name).is_dir())
        .map(|p| Resource {
            uri: build_uri(&p.name),
            name: format!("{} build", p.name),
            description: Some(format!("Latest web build of {}", p.name)),
            mime_type: Some(TEXT_MIME.to_string()),
        })
        .collect())
}

/// Human-readable summary of a project's latest web build
pub fn build_summary(settings: &Settings, project_name: &str) -> String {
    let build_dir = settings.web_build_dir(project_name);
    if !build_dir.is_dir() {
        return format!("No web build found for project '{}'.", project_name);
    }

    let mut lines = vec![
        format!("Project: {}", project_name),
        format!("Build directory: {}", build_dir.display()),
    ];

    let log_dir = settings.workspace_root.join(project_name).join("logs");
    if let Some(log) = latest_web_log(&log_dir) {
        lines.push(format!("Latest log: {}", log.display()));
    }

    if build_dir.join("index.html").is_file() {
        lines.push("Status: Ready to preview via start_web_preview tool.".to_string());
    } else {
        lines.push("Status: Build directory exists but index.html is missing.".to_string());
    }
    lines.join("\n")
}

pub fn read_build_resource(settings: &Settings, uri: &str) -> Option<ResourceContents> {
    let project_name = project_from_uri(uri)?;
    Some(ResourceContents {
        uri: uri.to_string(),
        mime_type: Some(TEXT_MIME.to_string()),
        text: build_summary(settings, project_name),
    })
}

/// Most recently modified `build-web-*.log`
fn latest_web_log(log_dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(log_dir)
        .ok()?
        .flatten()
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.starts_with("build-web-") && name.ends_with(".log")
        })
        .filter_map(|e| Some((e.metadata().ok()?.modified().ok()?, e.path())))
        .max()
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_uri_parsing() {
        assert_eq!(project_from_uri("renpy://build/demo"), Some("demo"));
        assert_eq!(project_from_uri("renpy://build/../etc"), None);
        assert_eq!(project_from_uri("renpy://build/"), None);
        assert_eq!(project_from_uri("file:///demo"), None);
    }

    #[test]
    fn test_summary_states() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::for_workspace(temp.path());

        assert_eq!(
            build_summary(&settings, "demo"),
            "No web build found for project 'demo'."
        );

        let web_dir = settings.web_build_dir("demo");
        std::fs::create_dir_all(&web_dir).unwrap();
        let summary = build_summary(&settings, "demo");
        assert!(summary.contains("index.html is missing"));
        assert!(!summary.contains("Latest log"));

        std::fs::write(web_dir.join("index.html"), "").unwrap();
        let log_dir = temp.path().join("demo/logs");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join("build-web-20250101-000000.log"), "").unwrap();
        std::fs::write(log_dir.join("other.log"), "").unwrap();

        let summary = build_summary(&settings, "demo");
        assert!(summary.starts_with("Project: demo\nBuild directory: "));
        assert!(summary.contains("build-web-20250101-000000.log"));
        assert!(summary.ends_with("Status: Ready to preview via start_web_preview tool."));
    }
}
