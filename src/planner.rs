//! Structure planner: order enumerated documents into the final write
//! plan, either by explicit table-of-contents order or by path sort.
//!
//! TOC resolution is deterministic: a link resolves by exact relative
//! path, then by unique basename, then by unique path suffix. Remaining
//! ambiguous links may be delegated to a capped disambiguation oracle;
//! whatever stays unresolved falls into the path-sorted tail.

use anyhow::Result;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::config::{ChunkingConfig, ImportConfig, OracleConfig};
use crate::models::{DocOutcome, DocumentNode, PlanManifest, SourceDocument};
use crate::oracle::TocResolver;

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap())
}

/// One TOC entry with its normalized target path.
#[derive(Debug, Clone)]
struct TocLink {
    label: String,
    target: String,
}

/// Build the ordered plan for one run.
pub async fn plan(
    documents: &[SourceDocument],
    import: &ImportConfig,
    chunking: &ChunkingConfig,
    oracle: Option<&dyn TocResolver>,
    oracle_cfg: &OracleConfig,
) -> Result<PlanManifest> {
    let mut manifest = PlanManifest::default();

    let mut candidates: Vec<&SourceDocument> = Vec::new();
    let mut toc_doc: Option<&SourceDocument> = None;
    for doc in documents {
        if doc.relative_path == import.toc_file {
            // The TOC drives ordering but is not itself imported.
            toc_doc = Some(doc);
            continue;
        }
        if import.skip_root_readme && is_root_readme(&doc.relative_path) {
            manifest.skipped.push(DocOutcome {
                path: doc.relative_path.clone(),
                reason: "root README skipped by policy".to_string(),
            });
            continue;
        }
        candidates.push(doc);
    }

    let mut ordered: Vec<&SourceDocument> = Vec::new();
    let mut taken: BTreeSet<&str> = BTreeSet::new();
    let mut labels: Vec<Option<String>> = Vec::new();

    if import.structure_order == "toc_first" {
        if let Some(toc) = toc_doc {
            let links = parse_toc_links(&toc.raw_text);
            manifest.toc_links = links.len();
            let paths: Vec<String> = candidates
                .iter()
                .map(|d| d.relative_path.clone())
                .collect();

            for link in &links {
                if let Some(path) = resolve_link(link, &paths, oracle, oracle_cfg, &mut manifest).await {
                    if taken.contains(path.as_str()) {
                        continue;
                    }
                    if let Some(doc) = candidates.iter().find(|d| d.relative_path == path) {
                        taken.insert(doc.relative_path.as_str());
                        ordered.push(doc);
                        labels.push(Some(link.label.clone()));
                        manifest.matched_links += 1;
                    }
                }
            }
        }
    }

    // Everything the TOC did not place, in path order.
    let mut rest: Vec<&SourceDocument> = candidates
        .iter()
        .filter(|d| !taken.contains(d.relative_path.as_str()))
        .copied()
        .collect();
    rest.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    for doc in rest {
        ordered.push(doc);
        labels.push(None);
    }

    for (order, (doc, toc_label)) in ordered.into_iter().zip(labels).enumerate() {
        let is_index = is_index_file(&doc.relative_path);
        let display_title = toc_label
            .clone()
            .map(|label| normalize_title(&label, chunking.title_max_bytes))
            .filter(|t| !t.is_empty())
            .or_else(|| title_candidates(doc, chunking.title_max_bytes).into_iter().next())
            .unwrap_or_else(|| "untitled".to_string());
        manifest.nodes.push(DocumentNode {
            path: doc.relative_path.clone(),
            relative_dir: doc.relative_dir.clone(),
            display_title,
            order,
            is_index,
            toc_label,
        });
    }

    Ok(manifest)
}

async fn resolve_link(
    link: &TocLink,
    paths: &[String],
    oracle: Option<&dyn TocResolver>,
    oracle_cfg: &OracleConfig,
    manifest: &mut PlanManifest,
) -> Option<String> {
    // Exact relative path.
    if paths.iter().any(|p| p == &link.target) {
        return Some(link.target.clone());
    }

    // Unique basename.
    let base = link.target.rsplit('/').next().unwrap_or(&link.target);
    let by_base: Vec<&String> = paths
        .iter()
        .filter(|p| p.rsplit('/').next() == Some(base))
        .collect();
    if by_base.len() == 1 {
        return Some(by_base[0].clone());
    }

    // Unique path suffix.
    let suffix = format!("/{}", link.target);
    let by_suffix: Vec<&String> = paths.iter().filter(|p| p.ends_with(&suffix)).collect();
    if by_suffix.len() == 1 {
        return Some(by_suffix[0].clone());
    }

    let ambiguous: Vec<String> = if !by_base.is_empty() {
        by_base.into_iter().cloned().collect()
    } else {
        by_suffix.into_iter().cloned().collect()
    };

    if ambiguous.is_empty() {
        manifest.unresolved_links.push(format!(
            "'{}' ({}): no matching file",
            link.label, link.target
        ));
        return None;
    }

    manifest.ambiguous_links += 1;
    if let Some(oracle) = oracle {
        if manifest.oracle_calls < oracle_cfg.max_calls {
            manifest.oracle_calls += 1;
            match oracle.resolve(&link.label, &link.target, &ambiguous).await {
                Ok(resolution) => {
                    if let Some(selected) =
                        resolution.accepted(&ambiguous, oracle_cfg.confidence_threshold)
                    {
                        tracing::debug!(
                            label = %link.label,
                            selected = %selected,
                            confidence = resolution.confidence,
                            "Oracle resolved ambiguous link"
                        );
                        return Some(selected);
                    }
                }
                Err(err) => {
                    tracing::warn!(label = %link.label, error = %err, "Oracle call failed");
                }
            }
        }
    }

    manifest.unresolved_links.push(format!(
        "'{}' ({}): {} candidates",
        link.label,
        link.target,
        ambiguous.len()
    ));
    None
}

/// Markdown links in the TOC body whose targets look like local
/// Markdown files. Scheme URLs and parent-escaping paths are ignored.
fn parse_toc_links(text: &str) -> Vec<TocLink> {
    let mut links = Vec::new();
    for caps in link_re().captures_iter(text) {
        let label = caps[1].trim().to_string();
        if let Some(target) = normalize_target(&caps[2]) {
            links.push(TocLink { label, target });
        }
    }
    links
}

/// Normalize a link target to a clean relative `.md` path, or reject it.
fn normalize_target(raw: &str) -> Option<String> {
    let mut target = raw.trim().to_string();
    if let Some(at) = target.find(['#', '?']) {
        target.truncate(at);
    }
    let target = percent_decode(&target);
    let target = target.trim().trim_start_matches("./").replace('\\', "/");

    if target.is_empty()
        || target.contains("://")
        || target.starts_with("mailto:")
        || target.starts_with('/')
        || target.split('/').any(|part| part == "..")
    {
        return None;
    }
    if !target.to_ascii_lowercase().ends_with(".md") {
        return None;
    }
    Some(target)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &input[i + 1..i + 3];
            if let Ok(value) = u8::from_str_radix(hex, 16) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_root_readme(path: &str) -> bool {
    !path.contains('/') && path.eq_ignore_ascii_case("readme.md")
}

fn is_index_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    let stem = name.strip_suffix(".md").unwrap_or(name);
    matches!(stem.to_ascii_lowercase().as_str(), "readme" | "index")
}

/// Ordered title candidates for a document: containing directory name
/// for index files, the document's own title, then a path-derived
/// fallback. All normalized; a structural rejection of one candidate
/// lets the writer try the next.
pub fn title_candidates(doc: &SourceDocument, max_bytes: usize) -> Vec<String> {
    let mut raw = Vec::new();
    if is_index_file(&doc.relative_path) && !doc.relative_dir.is_empty() {
        if let Some(dir) = doc.relative_dir.rsplit('/').next() {
            raw.push(dir.to_string());
        }
    }
    raw.push(doc.title.clone());
    raw.push(path_derived_title(&doc.relative_path));

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for candidate in raw {
        let normalized = normalize_title(&candidate, max_bytes);
        if !normalized.is_empty() && seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}

/// `dir - sub - stem`, dropping a trailing readme/index stem.
fn path_derived_title(path: &str) -> String {
    let mut parts: Vec<&str> = path.split('/').collect();
    if let Some(last) = parts.last_mut() {
        *last = last.strip_suffix(".md").unwrap_or(last);
    }
    if parts.len() > 1 {
        if let Some(last) = parts.last() {
            if matches!(last.to_ascii_lowercase().as_str(), "readme" | "index") {
                parts.pop();
            }
        }
    }
    parts.join(" - ")
}

/// Strip control and filesystem-hostile characters, collapse
/// whitespace, and truncate UTF-8-safely.
pub fn normalize_title(raw: &str, max_bytes: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    crate::chunker::truncate_utf8(&collapsed, max_bytes)
}

/// Folder names share the title normalization with a wider byte cap.
pub fn normalize_folder_name(raw: &str, max_bytes: usize) -> String {
    let name = normalize_title(raw, max_bytes);
    if name.is_empty() {
        "untitled".to_string()
    } else {
        name
    }
}
