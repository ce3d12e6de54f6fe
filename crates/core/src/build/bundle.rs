// Web build post-processing: locate, extract and repackage into a player bundle

use crate::types::BuildOutputKind;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Packaged game archive the web runtime loads at startup
pub const GAME_ARCHIVE: &str = "game.zip";

const TITLE_PLACEHOLDER: &str = "%%TITLE%%";

/// Files the web runtime provides itself; they stay out of game.zip
pub const RUNTIME_FILES: [&str; 10] = [
    "index.html",
    "index.html.symbols",
    "manifest.json",
    "renpy-pre.js",
    "renpy.data",
    "renpy.js",
    "renpy.wasm",
    "service-worker.js",
    "web-icon.png",
    "web-presplash.jpg",
];

/// Runtime entries that are never copied into a bundle
const SKIPPED_RUNTIME_ENTRIES: [&str; 1] = ["hash.txt"];

/// Every `*-web.zip` in `dest`. The toolchain's exact filename varies with the version.
fn web_archives(dest: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dest) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .map(|n| n.to_string_lossy().ends_with("-web.zip"))
                    .unwrap_or(false)
        })
        .collect()
}

/// The most recently written `*-web.zip` in `dest`. Archives left by builds of
/// older versions stay in the directory, so the name alone does not identify
/// the current one. Ties go to the name sorting last.
pub fn find_web_archive(dest: &Path) -> Option<PathBuf> {
    web_archives(dest)
        .into_iter()
        .map(|path| {
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .max()
        .map(|(_, path)| path)
}

/// Remove prior build artifacts so the next run starts clean
pub fn clean_previous_output(dest: &Path, web_dir: &Path) -> Result<()> {
    if web_dir.exists() {
        std::fs::remove_dir_all(web_dir)
            .with_context(|| format!("Failed to remove {}", web_dir.display()))?;
    }
    for archive in web_archives(dest) {
        std::fs::remove_file(&archive)
            .with_context(|| format!("Failed to remove {}", archive.display()))?;
    }
    Ok(())
}

/// Extract `archive` into a fresh `target` directory
pub fn extract_archive(archive: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        tracing::info!("Removing old build directory {}", target.display());
        std::fs::remove_dir_all(target)?;
    }
    std::fs::create_dir_all(target)?;

    let file = File::open(archive).with_context(|| format!("open '{}'", archive.display()))?;
    let mut zip = ZipArchive::new(BufReader::new(file)).context("Not a valid zip archive")?;
    zip.extract(target)
        .with_context(|| format!("Failed to extract into {}", target.display()))?;
    Ok(())
}

/// Copy the SDK's web runtime into `web_dir`, titling index.html with `title`
pub fn create_web_player(web_dir: &Path, runtime_dir: &Path, title: &str) -> Result<()> {
    if !runtime_dir.is_dir() {
        anyhow::bail!("Web runtime not found at {}", runtime_dir.display());
    }

    for entry in std::fs::read_dir(runtime_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let source = entry.path();
        let dest = web_dir.join(&name);

        if name == "index.html" {
            let html = std::fs::read_to_string(&source).context("Failed to read runtime index.html")?;
            std::fs::write(&dest, html.replace(TITLE_PLACEHOLDER, title))?;
        } else if SKIPPED_RUNTIME_ENTRIES.contains(&name.as_str()) {
            continue;
        } else if source.is_dir() {
            crate::project::copy_dir_all(&source, &dest)?;
        } else {
            std::fs::copy(&source, &dest)
                .with_context(|| format!("Failed to copy {}", source.display()))?;
        }
    }
    Ok(())
}

/// Write `game.zip` holding every non-runtime file of `web_dir`
pub fn package_game_archive(web_dir: &Path) -> Result<PathBuf> {
    let archive_path = web_dir.join(GAME_ARCHIVE);
    let mut files = Vec::new();
    for entry in WalkDir::new(web_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.path() == archive_path {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if RUNTIME_FILES.contains(&name.as_ref()) {
            continue;
        }
        files.push(entry.path().to_path_buf());
    }

    let mut writer = ZipWriter::new(BufWriter::new(File::create(&archive_path)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in files {
        let rel = path.strip_prefix(web_dir)?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        writer.start_file(name.as_str(), options)?;
        let mut source = File::open(&path)?;
        std::io::copy(&mut source, &mut writer)?;
        tracing::debug!("Added {} to {}", name, GAME_ARCHIVE);
    }
    writer.finish()?.flush()?;
    Ok(archive_path)
}

/// Turn the toolchain's output into something servable. Precedence:
/// bundle > extracted directory > archive > pre-existing directory > nothing.
pub fn post_process(
    dest: &Path,
    web_dir: &Path,
    runtime_dir: &Path,
    title: &str,
) -> Option<(PathBuf, BuildOutputKind)> {
    let Some(archive) = find_web_archive(dest) else {
        if web_dir.is_dir() {
            return Some((web_dir.to_path_buf(), BuildOutputKind::Extracted));
        }
        tracing::warn!("No web archive found in {}", dest.display());
        return None;
    };

    tracing::info!(
        "Extracting web build {} into {}",
        archive.display(),
        web_dir.display()
    );
    if let Err(e) = extract_archive(&archive, web_dir) {
        tracing::error!("Failed to process web build: {:#}", e);
        return Some((archive, BuildOutputKind::Archive));
    }

    let bundled = create_web_player(web_dir, runtime_dir, title)
        .and_then(|_| package_game_archive(web_dir));
    match bundled {
        Ok(_) => {
            tracing::info!("Web player created at {}", web_dir.display());
            Some((web_dir.to_path_buf(), BuildOutputKind::Bundle))
        }
        Err(e) => {
            tracing::warn!("Failed to create web player, using extracted files: {:#}", e);
            Some((web_dir.to_path_buf(), BuildOutputKind::Extracted))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Write a zip archive holding `files` (path, contents)
    pub fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in files {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    /// Names stored in a zip archive, sorted
    pub fn zip_names(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    /// A minimal SDK web runtime
    pub fn write_runtime(dir: &Path) {
        std::fs::create_dir_all(dir.join("fonts")).unwrap();
        std::fs::write(dir.join("index.html"), "<title>%%TITLE%%</title>").unwrap();
        std::fs::write(dir.join("renpy.js"), "// runtime").unwrap();
        std::fs::write(dir.join("hash.txt"), "abc").unwrap();
        std::fs::write(dir.join("fonts/font.ttf"), "font").unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Backdate a file's modification time by `age`
    fn age_file(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_find_web_archive_matches_pattern() {
        let temp = TempDir::new().unwrap();
        assert!(find_web_archive(temp.path()).is_none());

        std::fs::write(temp.path().join("demo-pc.zip"), "").unwrap();
        std::fs::write(temp.path().join("demo-1.0-web.zip"), "").unwrap();
        std::fs::create_dir_all(temp.path().join("folder-web.zip")).unwrap();

        assert_eq!(
            find_web_archive(temp.path()),
            Some(temp.path().join("demo-1.0-web.zip"))
        );
    }

    #[test]
    fn test_find_web_archive_prefers_newest() {
        let temp = TempDir::new().unwrap();
        let newer_name_older_file = temp.path().join("demo-2.0-web.zip");
        std::fs::write(&newer_name_older_file, "").unwrap();
        age_file(&newer_name_older_file, Duration::from_secs(3600));
        std::fs::write(temp.path().join("demo-10.0-web.zip"), "").unwrap();

        assert_eq!(
            find_web_archive(temp.path()),
            Some(temp.path().join("demo-10.0-web.zip"))
        );
    }

    #[test]
    fn test_post_process_extracts_current_version_over_stale_archive() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("demo-dists");
        let web_dir = dest.join("demo-web");
        std::fs::create_dir_all(&dest).unwrap();

        let stale = dest.join("demo-1.0-web.zip");
        write_zip(&stale, &[("game/version.txt", "OLD")]);
        age_file(&stale, Duration::from_secs(24 * 3600));
        write_zip(&dest.join("demo-1.1-web.zip"), &[("game/version.txt", "NEW")]);

        let (path, kind) =
            post_process(&dest, &web_dir, &temp.path().join("missing"), "demo").unwrap();

        assert_eq!(kind, BuildOutputKind::Extracted);
        assert_eq!(path, web_dir);
        assert_eq!(
            std::fs::read_to_string(web_dir.join("game/version.txt")).unwrap(),
            "NEW"
        );
    }

    #[test]
    fn test_post_process_creates_bundle() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("demo-dists");
        let web_dir = dest.join("demo-web");
        let runtime = temp.path().join("sdk/web");
        std::fs::create_dir_all(&dest).unwrap();
        write_runtime(&runtime);
        write_zip(
            &dest.join("demo-1.0-web.zip"),
            &[("game/script.rpyc", "compiled"), ("renpy.js", "stale")],
        );
        // Stale output from an earlier build is replaced
        std::fs::create_dir_all(web_dir.join("old")).unwrap();

        let (path, kind) = post_process(&dest, &web_dir, &runtime, "demo").unwrap();

        assert_eq!(kind, BuildOutputKind::Bundle);
        assert_eq!(path, web_dir);
        assert!(!web_dir.join("old").exists());
        assert!(!web_dir.join("hash.txt").exists());
        assert_eq!(
            std::fs::read_to_string(web_dir.join("index.html")).unwrap(),
            "<title>demo</title>"
        );
        assert_eq!(
            std::fs::read_to_string(web_dir.join("renpy.js")).unwrap(),
            "// runtime"
        );
        assert_eq!(
            zip_names(&web_dir.join(GAME_ARCHIVE)),
            vec!["fonts/font.ttf", "game/script.rpyc"]
        );
    }

    #[test]
    fn test_post_process_falls_back_to_extracted_without_runtime() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("demo-dists");
        let web_dir = dest.join("demo-web");
        std::fs::create_dir_all(&dest).unwrap();
        write_zip(&dest.join("demo-web.zip"), &[("game/script.rpyc", "x")]);

        let (path, kind) =
            post_process(&dest, &web_dir, &temp.path().join("missing"), "demo").unwrap();

        assert_eq!(kind, BuildOutputKind::Extracted);
        assert_eq!(path, web_dir);
        assert!(web_dir.join("game/script.rpyc").is_file());
    }

    #[test]
    fn test_post_process_falls_back_to_archive_on_bad_zip() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path();
        let archive = dest.join("demo-web.zip");
        std::fs::write(&archive, "definitely not a zip").unwrap();

        let (path, kind) =
            post_process(dest, &dest.join("demo-web"), &dest.join("web"), "demo").unwrap();

        assert_eq!(kind, BuildOutputKind::Archive);
        assert_eq!(path, archive);
    }

    #[test]
    fn test_post_process_uses_existing_directory_without_archive() {
        let temp = TempDir::new().unwrap();
        let web_dir = temp.path().join("demo-web");
        assert!(post_process(temp.path(), &web_dir, temp.path(), "demo").is_none());

        std::fs::create_dir_all(&web_dir).unwrap();
        let (path, kind) = post_process(temp.path(), &web_dir, temp.path(), "demo").unwrap();
        assert_eq!(kind, BuildOutputKind::Extracted);
        assert_eq!(path, web_dir);
    }

    #[test]
    fn test_clean_previous_output() {
        let temp = TempDir::new().unwrap();
        let web_dir = temp.path().join("demo-web");
        std::fs::create_dir_all(&web_dir).unwrap();
        std::fs::write(temp.path().join("a-web.zip"), "").unwrap();
        std::fs::write(temp.path().join("b-web.zip"), "").unwrap();

        clean_previous_output(temp.path(), &web_dir).unwrap();

        assert!(!web_dir.exists());
        assert!(find_web_archive(temp.path()).is_none());
    }
}
