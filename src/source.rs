//! Source enumeration: collect Markdown files from a local directory or
//! a fresh git checkout, in deterministic path order.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::models::{SourceDocument, SourceKind};

/// A prepared source tree. Keeps the temporary checkout alive for the
/// duration of the run when the source is a repository.
pub struct SourceTree {
    pub root: PathBuf,
    pub kind: SourceKind,
    _checkout: Option<tempfile::TempDir>,
}

/// Resolve the configured source into a scannable directory, cloning
/// the repository first when needed.
pub fn prepare(config: &SourceConfig) -> Result<SourceTree> {
    if let Some(root) = &config.root {
        if !root.is_dir() {
            bail!("Source root does not exist: {}", root.display());
        }
        return Ok(SourceTree {
            root: root.clone(),
            kind: SourceKind::Local,
            _checkout: None,
        });
    }

    let repo = config
        .repo
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No source configured"))?;

    let checkout = tempfile::Builder::new()
        .prefix("docport-checkout-")
        .tempdir()
        .context("Failed to create checkout directory")?;

    let url = clone_url(repo);
    let dest = checkout.path().join(short_hash(&url));
    git_clone_with_fallback(&url, &config.reference, &dest, &config.mirror_prefix)?;

    let root = if config.subdir.is_empty() {
        dest
    } else {
        let sub = dest.join(&config.subdir);
        if !sub.is_dir() {
            bail!("Subdirectory '{}' does not exist in {}", config.subdir, repo);
        }
        sub
    };

    Ok(SourceTree {
        root,
        kind: SourceKind::Repository,
        _checkout: Some(checkout),
    })
}

/// Walk the source tree and load every matching Markdown file.
pub fn enumerate(tree: &SourceTree, config: &SourceConfig) -> Result<Vec<SourceDocument>> {
    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/.github/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut documents = Vec::new();

    for entry in WalkDir::new(&tree.root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&tree.root).unwrap_or(path);
        let rel_str = relative
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        documents.push(read_document(path, &rel_str, tree.kind)?);
    }

    // Sort for deterministic ordering
    documents.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok(documents)
}

fn read_document(path: &Path, relative_path: &str, kind: SourceKind) -> Result<SourceDocument> {
    let raw_text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read source file: {}", path.display()))?;

    let relative_dir = match relative_path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    };

    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let title = extract_title(&raw_text, relative_path);

    Ok(SourceDocument {
        relative_path: relative_path.to_string(),
        relative_dir,
        title,
        raw_text,
        base_dir,
        source_kind: kind,
    })
}

/// First `#` heading if present, otherwise the file stem.
fn extract_title(text: &str, relative_path: &str) -> String {
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("# ") {
            let heading = rest.trim();
            if !heading.is_empty() {
                return heading.to_string();
            }
        }
    }

    let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
    file_name
        .strip_suffix(".md")
        .unwrap_or(file_name)
        .to_string()
}

/// Expand `owner/name` shorthand to a github.com HTTPS URL; full URLs
/// and local paths pass through unchanged.
fn clone_url(repo: &str) -> String {
    let looks_like_url = repo.contains("://") || repo.starts_with("git@");
    let looks_like_path = repo.starts_with('/') || repo.starts_with('.') || Path::new(repo).is_dir();
    if !looks_like_url && !looks_like_path && repo.matches('/').count() == 1 {
        return format!("https://github.com/{}.git", repo);
    }
    repo.to_string()
}

fn git_clone_with_fallback(
    url: &str,
    reference: &str,
    dest: &Path,
    mirror_prefix: &str,
) -> Result<()> {
    match git_clone(url, reference, dest) {
        Ok(()) => return Ok(()),
        Err(err) => {
            let mirrorable = !mirror_prefix.is_empty() && url.starts_with("https://github.com/");
            if !mirrorable {
                return Err(err);
            }
            tracing::warn!(%url, error = %err, "Direct clone failed, retrying via mirror");
        }
    }

    let _ = std::fs::remove_dir_all(dest);
    let mirrored = format!("{}{}", mirror_prefix, url);
    git_clone(&mirrored, reference, dest)
        .with_context(|| format!("Mirror clone failed for {}", url))
}

fn git_clone(url: &str, reference: &str, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create checkout directory: {}", dest.display()))?;

    let output = Command::new("git")
        .args(["clone", "--branch", reference, "--single-branch", "--depth", "1"])
        .arg(url)
        .arg(dest)
        .output()
        .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git clone failed: {}", stderr.trim());
    }

    Ok(())
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn local_config(root: &Path) -> SourceConfig {
        SourceConfig {
            root: Some(root.to_path_buf()),
            repo: None,
            reference: "main".to_string(),
            subdir: String::new(),
            include_globs: vec!["**/*.md".to_string()],
            exclude_globs: Vec::new(),
            mirror_prefix: String::new(),
        }
    }

    #[test]
    fn enumerates_markdown_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("guide")).unwrap();
        fs::write(dir.path().join("zeta.md"), "# Zeta\n").unwrap();
        fs::write(dir.path().join("guide/alpha.md"), "body only\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();

        let config = local_config(dir.path());
        let tree = prepare(&config).unwrap();
        let docs = enumerate(&tree, &config).unwrap();

        let paths: Vec<&str> = docs.iter().map(|d| d.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["guide/alpha.md", "zeta.md"]);
        assert_eq!(docs[0].relative_dir, "guide");
        assert_eq!(docs[1].relative_dir, "");
    }

    #[test]
    fn title_prefers_first_heading_then_stem() {
        assert_eq!(extract_title("intro\n\n# Real Title\n", "a/b.md"), "Real Title");
        assert_eq!(extract_title("no headings here\n", "a/setup-guide.md"), "setup-guide");
    }

    #[test]
    fn excludes_configured_globs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("drafts")).unwrap();
        fs::write(dir.path().join("keep.md"), "# Keep\n").unwrap();
        fs::write(dir.path().join("drafts/wip.md"), "# WIP\n").unwrap();

        let mut config = local_config(dir.path());
        config.exclude_globs = vec!["drafts/**".to_string()];
        let tree = prepare(&config).unwrap();
        let docs = enumerate(&tree, &config).unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].relative_path, "keep.md");
    }

    #[test]
    fn shorthand_expands_to_github_url() {
        assert_eq!(clone_url("acme/handbook"), "https://github.com/acme/handbook.git");
        assert_eq!(
            clone_url("https://gitlab.com/acme/handbook.git"),
            "https://gitlab.com/acme/handbook.git"
        );
    }

    #[test]
    fn missing_root_is_an_error() {
        let config = local_config(Path::new("/definitely/not/here"));
        assert!(prepare(&config).is_err());
    }
}
