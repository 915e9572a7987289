pub mod chunker;
pub mod extractor;
pub mod walker;

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::DocumentUpload;
use self::extractor::extract_text;
use self::walker::walk_directory;

static REPEATED_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").unwrap());

/// Trims every line, drops blank lines and collapses runs of spaces.
pub fn clean_content(content: &str) -> String {
    let joined = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    REPEATED_SPACES.replace_all(&joined, " ").into_owned()
}

#[derive(Debug, Default)]
pub struct CollectedDocuments {
    pub documents: Vec<DocumentUpload>,
    pub failed_files: Vec<(PathBuf, String)>,
    pub empty_files: Vec<PathBuf>,
}

/// Turns every supported file under `dir` into a `DocumentUpload` titled by
/// its file stem. Unreadable files are reported, not fatal.
pub fn collect_documents(dir: &Path) -> anyhow::Result<CollectedDocuments> {
    if !dir.is_dir() {
        anyhow::bail!("Documentation directory not found: {}", dir.display());
    }

    let mut collected = CollectedDocuments::default();
    let files = walk_directory(dir);
    tracing::info!("Processing {} documentation files from {}", files.len(), dir.display());

    for (path, format) in files {
        let text = match extract_text(&path, format) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to extract {}: {:#}", path.display(), e);
                collected.failed_files.push((path, format!("{:#}", e)));
                continue;
            }
        };

        let content = clean_content(&text);
        if content.is_empty() {
            tracing::warn!("No content extracted from {}", path.display());
            collected.empty_files.push(path);
            continue;
        }

        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let relative = path.strip_prefix(dir).unwrap_or(&path);
        let source = format!("documentation/{}", relative.to_string_lossy().replace('\\', "/"));

        tracing::debug!("Processed {}: {} characters", path.display(), content.len());
        collected.documents.push(DocumentUpload {
            title,
            content,
            source,
        });
    }

    Ok(collected)
}
