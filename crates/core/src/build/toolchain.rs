// Local Ren'Py SDK driver: executable discovery and the streamed distribute run

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Environment applied to the toolchain unless the variable is already set,
/// so it runs headless and never prompts for updates.
pub const HEADLESS_ENV: [(&str, &str); 5] = [
    ("SDL_VIDEODRIVER", "dummy"),
    ("SDL_AUDIODRIVER", "dummy"),
    ("RENPY_FORCE_SOFTWARE", "1"),
    ("RENPY_DISABLE_UPDATE", "1"),
    ("RENPY_DISABLE_JOYSTICK", "1"),
];

const EXECUTABLE_CANDIDATES: [&str; 3] = ["renpy.sh", "renpy.exe", "renpy"];

/// A fully resolved toolchain invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// A Ren'Py SDK extracted on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalToolchain {
    sdk_path: PathBuf,
    executable: Option<PathBuf>,
}

impl LocalToolchain {
    pub fn new(sdk_path: impl Into<PathBuf>) -> Self {
        let sdk_path = sdk_path.into();
        let executable = find_executable(&sdk_path);
        Self {
            sdk_path,
            executable,
        }
    }

    pub fn sdk_path(&self) -> &Path {
        &self.sdk_path
    }

    pub fn available(&self) -> bool {
        self.executable.is_some()
    }

    /// Directory holding the web player runtime, if web support is installed
    pub fn web_runtime_dir(&self) -> PathBuf {
        self.sdk_path.join("web")
    }

    pub fn web_support_available(&self) -> bool {
        self.web_runtime_dir().is_dir()
    }

    /// `{exe} {sdk}/launcher distribute --package web --destination {dest} {project}`
    pub fn distribute_command(&self, project_dir: &Path, destination: &Path) -> Option<ToolchainCommand> {
        let program = self.executable.clone()?;
        let env = HEADLESS_ENV
            .iter()
            .filter(|(key, _)| std::env::var_os(key).is_none())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Some(ToolchainCommand {
            program,
            args: vec![
                self.sdk_path.join("launcher").to_string_lossy().to_string(),
                "distribute".to_string(),
                "--package".to_string(),
                "web".to_string(),
                "--destination".to_string(),
                destination.to_string_lossy().to_string(),
                project_dir.to_string_lossy().to_string(),
            ],
            cwd: self.sdk_path.clone(),
            env,
        })
    }
}

/// Look for the launcher script under the SDK, with the macOS app bundle as a fallback
pub fn find_executable(sdk_path: &Path) -> Option<PathBuf> {
    for name in EXECUTABLE_CANDIDATES {
        let candidate = sdk_path.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    if cfg!(target_os = "macos") {
        let bundle = sdk_path
            .join("Ren'Py.app")
            .join("Contents")
            .join("MacOS")
            .join("python");
        if bundle.is_file() {
            return Some(bundle);
        }
    }
    None
}

/// Run the command, writing combined stdout/stderr to `log` line by line as it
/// arrives. Returns the exit code (`-1` when terminated by a signal). The child
/// is killed if this future is dropped or the log cannot be written.
pub async fn run_with_log(command: &ToolchainCommand, mut log: tokio::fs::File) -> Result<i32> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .current_dir(&command.cwd)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", command.program.display()))?;

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(BufReader::new(stdout), tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(BufReader::new(stderr), tx.clone())));
    }
    drop(tx);

    while let Some(line) = rx.recv().await {
        log.write_all(&line).await.context("Failed to write build log")?;
        if !line.ends_with(b"\n") {
            log.write_all(b"\n").await.context("Failed to write build log")?;
        }
        log.flush().await.context("Failed to flush build log")?;
        tracing::debug!("renpy: {}", String::from_utf8_lossy(&line).trim_end());
    }

    for reader in readers {
        if let Err(e) = reader.await {
            tracing::warn!("Toolchain output reader stopped abnormally: {}", e);
        }
    }

    let status = child
        .wait()
        .await
        .context("Failed to wait for the toolchain process")?;
    Ok(status.code().unwrap_or(-1))
}

async fn forward_lines<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Error reading toolchain output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_executable_prefers_shell_script() {
        let temp = TempDir::new().unwrap();
        assert!(find_executable(temp.path()).is_none());

        std::fs::write(temp.path().join("renpy.exe"), "").unwrap();
        assert_eq!(find_executable(temp.path()), Some(temp.path().join("renpy.exe")));

        std::fs::write(temp.path().join("renpy.sh"), "").unwrap();
        assert_eq!(find_executable(temp.path()), Some(temp.path().join("renpy.sh")));
    }

    #[test]
    fn test_distribute_command_shape() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("renpy.sh"), "").unwrap();
        let toolchain = LocalToolchain::new(temp.path());

        let command = toolchain
            .distribute_command(Path::new("/ws/demo"), Path::new("/ws/demo-dists"))
            .unwrap();

        assert_eq!(command.program, temp.path().join("renpy.sh"));
        assert_eq!(command.cwd, temp.path());
        assert_eq!(
            &command.args[1..],
            &["distribute", "--package", "web", "--destination", "/ws/demo-dists", "/ws/demo"]
        );
        assert!(command.args[0].ends_with("launcher"));
    }

    #[test]
    fn test_missing_executable_has_no_command() {
        let temp = TempDir::new().unwrap();
        let toolchain = LocalToolchain::new(temp.path());
        assert!(!toolchain.available());
        assert!(toolchain
            .distribute_command(Path::new("/p"), Path::new("/d"))
            .is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn test_run_with_log_streams_both_pipes() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("build.log");
        let command = ToolchainCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                "echo out-line; echo err-line 1>&2; printf 'no newline'; exit 4".to_string(),
            ],
            cwd: temp.path().to_path_buf(),
            env: vec![],
        };

        let file = tokio::fs::File::create(&log).await.unwrap();
        let code = run_with_log(&command, file).await.unwrap();
        assert_eq!(code, 4);

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("out-line\n"));
        assert!(content.contains("err-line\n"));
        assert!(content.contains("no newline\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn test_dropping_run_kills_child() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("finished");
        let command = ToolchainCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                format!("sleep 1; touch '{}'", marker.display()),
            ],
            cwd: temp.path().to_path_buf(),
            env: vec![],
        };
        let file = tokio::fs::File::create(temp.path().join("build.log")).await.unwrap();

        let run = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            run_with_log(&command, file),
        )
        .await;
        assert!(run.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
