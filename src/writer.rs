//! Remote writer: turn an ordered chunk sequence into block writes for
//! one document.
//!
//! Writes within a document are strictly sequential. Transient retry
//! lives in the backend and is scoped to the failing call, so a chunk
//! that already landed is never re-sent. Tables arrive from the chunker
//! as pipe-delimited text and are written as text blocks; no native
//! table write exists on this path at all.

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::models::{
    Chunk, ChunkPayload, DocumentNode, ImageRef, WriteResult, WriteStatus,
};
use crate::remote::{class_of, is_refresh_failure, ErrorClass, RemoteBackend, RemoteDoc};

/// Everything needed to write one planned document.
pub struct DocumentJob {
    pub node: DocumentNode,
    pub chunks: Vec<Chunk>,
    /// Title candidates in preference order; a structural rejection of
    /// one moves to the next.
    pub titles: Vec<String>,
    /// Directory for resolving relative image paths.
    pub base_dir: PathBuf,
    /// Destination folder for the created document.
    pub folder_id: String,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub dry_run: bool,
    /// Blocks per append call.
    pub append_batch: usize,
}

/// Write one document and report the outcome. Per-document failures
/// become a `Failed` status; only a failed token refresh propagates as
/// `Err`, since every later document would fail the same way.
pub async fn write_document(
    backend: &dyn RemoteBackend,
    job: &DocumentJob,
    options: &WriteOptions,
) -> Result<WriteResult> {
    if options.dry_run {
        return Ok(WriteResult {
            path: job.node.path.clone(),
            display_title: job.node.display_title.clone(),
            status: WriteStatus::Success {
                remote_id: format!("dry-run:{}", job.node.path),
                url: String::new(),
                wiki_node: None,
            },
        });
    }

    match write_inner(backend, job, options).await {
        Ok(doc) => Ok(WriteResult {
            path: job.node.path.clone(),
            display_title: job.node.display_title.clone(),
            status: WriteStatus::Success {
                remote_id: doc.document_id,
                url: doc.url,
                wiki_node: None,
            },
        }),
        Err(err) if is_refresh_failure(&err) => Err(err),
        Err(err) => Ok(WriteResult {
            path: job.node.path.clone(),
            display_title: job.node.display_title.clone(),
            status: WriteStatus::Failed {
                error_detail: format!("{:#}", err),
            },
        }),
    }
}

async fn write_inner(
    backend: &dyn RemoteBackend,
    job: &DocumentJob,
    options: &WriteOptions,
) -> Result<RemoteDoc> {
    let doc = create_with_title_candidates(backend, &job.titles, &job.folder_id).await?;

    for chunk in &job.chunks {
        let blocks = build_blocks(backend, &doc.document_id, chunk, &job.base_dir).await;
        let batch = options.append_batch.max(1);
        for slice in blocks.chunks(batch) {
            backend
                .append_blocks(&doc.document_id, slice)
                .await
                .with_context(|| {
                    format!(
                        "Failed writing chunk {}/{} of segment {}",
                        chunk.part_index + 1,
                        chunk.part_count,
                        chunk.parent_segment_ordinal
                    )
                })?;
        }
    }

    Ok(doc)
}

/// Try each title candidate until one is accepted. Only a structural
/// rejection moves to the next candidate; every other error is final.
async fn create_with_title_candidates(
    backend: &dyn RemoteBackend,
    titles: &[String],
    folder_id: &str,
) -> Result<RemoteDoc> {
    let mut last_err = None;
    for title in titles {
        match backend.create_document(title, folder_id).await {
            Ok(doc) => return Ok(doc),
            Err(err) => {
                if class_of(&err) != ErrorClass::Structural {
                    return Err(err);
                }
                tracing::warn!(%title, error = %err, "Title rejected, trying next candidate");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("No title candidates available")))
}

/// Build the block payloads for one chunk. Image references are
/// uploaded first so the blocks that mention them never race their
/// uploads; an image that cannot be fetched keeps its original
/// reference in the text.
async fn build_blocks(
    backend: &dyn RemoteBackend,
    document_id: &str,
    chunk: &Chunk,
    base_dir: &Path,
) -> Vec<serde_json::Value> {
    match &chunk.payload {
        ChunkPayload::Heading { level, text } => vec![serde_json::json!({
            "block_type": "heading",
            "level": level,
            "elements": text_runs(text),
        })],
        ChunkPayload::Text { text, images } => {
            let mut text = text.clone();
            let mut image_blocks = Vec::new();
            for image in images {
                match resolve_image(backend, document_id, image, base_dir).await {
                    Ok(media_id) => {
                        strip_image_reference(&mut text, image);
                        image_blocks.push(serde_json::json!({
                            "block_type": "image",
                            "media_id": media_id,
                            "alt": image.alt,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            reference = %image.original,
                            error = %err,
                            "Image resolution failed, keeping original reference"
                        );
                    }
                }
            }
            let mut blocks = Vec::new();
            if !text.trim().is_empty() {
                blocks.push(serde_json::json!({
                    "block_type": "text",
                    "elements": text_runs(&text),
                }));
            }
            blocks.extend(image_blocks);
            blocks
        }
        ChunkPayload::ListItems { items } => items.iter().map(|item| item_block(item)).collect(),
        ChunkPayload::Code { language, body } => vec![serde_json::json!({
            "block_type": "code",
            "language": language,
            "elements": [{"text": body}],
        })],
        ChunkPayload::Image(image) => {
            match resolve_image(backend, document_id, image, base_dir).await {
                Ok(media_id) => vec![serde_json::json!({
                    "block_type": "image",
                    "media_id": media_id,
                    "alt": image.alt,
                })],
                Err(err) => {
                    tracing::warn!(
                        reference = %image.original,
                        error = %err,
                        "Image resolution failed, writing reference as text"
                    );
                    vec![serde_json::json!({
                        "block_type": "text",
                        "elements": [{"text": image.original}],
                    })]
                }
            }
        }
        ChunkPayload::Math { source } => vec![serde_json::json!({
            "block_type": "math",
            "expression": source,
        })],
        ChunkPayload::Rule => vec![serde_json::json!({ "block_type": "divider" })],
    }
}

/// One list/quote item to a block, keyed by its leading marker.
fn item_block(item: &str) -> serde_json::Value {
    let trimmed = item.trim_start();
    if let Some(rest) = trimmed.strip_prefix('>') {
        return serde_json::json!({
            "block_type": "quote",
            "elements": text_runs(rest.trim_start()),
        });
    }
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return serde_json::json!({
                "block_type": "bullet",
                "elements": text_runs(rest),
            });
        }
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(after) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return serde_json::json!({
                "block_type": "ordered",
                "elements": text_runs(after),
            });
        }
    }
    serde_json::json!({
        "block_type": "bullet",
        "elements": text_runs(trimmed),
    })
}

/// Fetch the referenced image (local path or URL), log its digest, and
/// upload it.
async fn resolve_image(
    backend: &dyn RemoteBackend,
    document_id: &str,
    image: &ImageRef,
    base_dir: &Path,
) -> Result<String> {
    let bytes = fetch_image_bytes(&image.original, base_dir).await?;
    let digest = Sha256::digest(&bytes);
    tracing::debug!(
        reference = %image.original,
        bytes = bytes.len(),
        sha256 = %format!("{:x}", digest),
        "Uploading image"
    );

    let file_name = image
        .original
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("image")
        .to_string();
    backend.upload_media(document_id, &file_name, bytes).await
}

async fn fetch_image_bytes(reference: &str, base_dir: &Path) -> Result<Vec<u8>> {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        let response = reqwest::get(reference)
            .await
            .with_context(|| format!("Failed to fetch image: {}", reference))?;
        if !response.status().is_success() {
            anyhow::bail!("Image fetch returned {}: {}", response.status(), reference);
        }
        return Ok(response.bytes().await?.to_vec());
    }
    let path = base_dir.join(reference);
    std::fs::read(&path).with_context(|| format!("Failed to read image: {}", path.display()))
}

/// Remove a resolved image's markdown/HTML reference from the text.
fn strip_image_reference(text: &mut String, image: &ImageRef) {
    let markdown = format!("![{}]({})", image.alt, image.original);
    if text.contains(&markdown) {
        *text = text.replace(&markdown, "");
        return;
    }
    // HTML form: drop any <img> tag naming this source.
    let escaped = regex::escape(&image.original);
    if let Ok(re) = Regex::new(&format!(r#"(?i)<img[^>]*{}[^>]*>"#, escaped)) {
        *text = re.replace_all(text, "").into_owned();
    }
}

fn inline_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            \[(?P<ltext>[^\]]+)\]\((?P<lurl>[^)]+)\)   # link
            | \*\*(?P<bold>[^*]+)\*\*                  # bold
            | `(?P<code>[^`]+)`                        # inline code
            | ~~(?P<strike>[^~]+)~~                    # strikethrough
            | \*(?P<italic>[^*]+)\*                    # italic
            ",
        )
        .unwrap()
    })
}

/// Split text into styled runs for a text-bearing block.
pub fn text_runs(text: &str) -> Vec<serde_json::Value> {
    let mut runs = Vec::new();
    let mut cursor = 0;

    for caps in inline_re().captures_iter(text) {
        let whole = caps.get(0).unwrap();
        if whole.start() > cursor {
            runs.push(serde_json::json!({ "text": &text[cursor..whole.start()] }));
        }
        if let (Some(ltext), Some(lurl)) = (caps.name("ltext"), caps.name("lurl")) {
            runs.push(serde_json::json!({ "text": ltext.as_str(), "link": lurl.as_str() }));
        } else if let Some(bold) = caps.name("bold") {
            runs.push(serde_json::json!({ "text": bold.as_str(), "style": {"bold": true} }));
        } else if let Some(code) = caps.name("code") {
            runs.push(serde_json::json!({ "text": code.as_str(), "style": {"inline_code": true} }));
        } else if let Some(strike) = caps.name("strike") {
            runs.push(
                serde_json::json!({ "text": strike.as_str(), "style": {"strikethrough": true} }),
            );
        } else if let Some(italic) = caps.name("italic") {
            runs.push(serde_json::json!({ "text": italic.as_str(), "style": {"italic": true} }));
        }
        cursor = whole.end();
    }
    if cursor < text.len() {
        runs.push(serde_json::json!({ "text": &text[cursor..] }));
    }
    if runs.is_empty() {
        runs.push(serde_json::json!({ "text": "" }));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SegmentKind, WriteStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        appended: Mutex<Vec<serde_json::Value>>,
        append_calls: Mutex<u32>,
        create_calls: Mutex<Vec<String>>,
        fail_append_at_call: Option<u32>,
        structural_titles: Vec<String>,
        refresh_failure: bool,
    }

    #[async_trait]
    impl RemoteBackend for RecordingBackend {
        async fn create_document(
            &self,
            title: &str,
            _folder_id: &str,
        ) -> Result<crate::remote::RemoteDoc> {
            self.create_calls.lock().unwrap().push(title.to_string());
            if self.refresh_failure {
                return Err(crate::remote::TokenRefreshError(
                    "app credentials rejected".to_string(),
                )
                .into());
            }
            if self.structural_titles.iter().any(|t| t == title) {
                return Err(crate::remote::ApiError {
                    class: ErrorClass::Structural,
                    status: 400,
                    code: 1770001,
                    message: "bad title".to_string(),
                }
                .into());
            }
            Ok(crate::remote::RemoteDoc {
                document_id: "doc1".to_string(),
                url: "https://remote/doc1".to_string(),
            })
        }
        async fn append_blocks(
            &self,
            _document_id: &str,
            blocks: &[serde_json::Value],
        ) -> Result<()> {
            let mut calls = self.append_calls.lock().unwrap();
            *calls += 1;
            if Some(*calls) == self.fail_append_at_call {
                anyhow::bail!("injected permanent failure");
            }
            self.appended.lock().unwrap().extend(blocks.iter().cloned());
            Ok(())
        }
        async fn upload_media(
            &self,
            _document_id: &str,
            _file_name: &str,
            _bytes: Vec<u8>,
        ) -> Result<String> {
            Ok("media-1".to_string())
        }
        async fn list_folder_children(
            &self,
            _folder_id: &str,
        ) -> Result<Vec<crate::remote::FolderEntry>> {
            Ok(Vec::new())
        }
        async fn create_folder(&self, _name: &str, _parent_id: &str) -> Result<String> {
            Ok("f1".to_string())
        }
        async fn list_spaces(&self) -> Result<Vec<crate::remote::WikiSpace>> {
            Ok(Vec::new())
        }
        async fn create_space(&self, _name: &str) -> Result<String> {
            Ok("s1".to_string())
        }
        async fn list_space_nodes(
            &self,
            _space_id: &str,
            _parent_node: Option<&str>,
        ) -> Result<Vec<crate::remote::WikiNode>> {
            Ok(Vec::new())
        }
        async fn move_doc_to_wiki(
            &self,
            _space_id: &str,
            _parent_node: Option<&str>,
            _document_id: &str,
        ) -> Result<String> {
            Ok("n1".to_string())
        }
    }

    fn node(path: &str) -> DocumentNode {
        DocumentNode {
            path: path.to_string(),
            relative_dir: String::new(),
            display_title: "Doc".to_string(),
            order: 0,
            is_index: false,
            toc_label: None,
        }
    }

    fn text_chunk(ordinal: usize, part_index: usize, part_count: usize, text: &str) -> Chunk {
        Chunk {
            parent_segment_ordinal: ordinal,
            part_index,
            part_count,
            kind: SegmentKind::Paragraph,
            payload: ChunkPayload::Text {
                text: text.to_string(),
                images: Vec::new(),
            },
        }
    }

    fn options() -> WriteOptions {
        WriteOptions {
            dry_run: false,
            append_batch: 20,
        }
    }

    fn job(chunks: Vec<Chunk>) -> DocumentJob {
        DocumentJob {
            node: node("a.md"),
            chunks,
            titles: vec!["Doc".to_string()],
            base_dir: PathBuf::from("."),
            folder_id: "root".to_string(),
        }
    }

    #[tokio::test]
    async fn table_chunks_never_write_native_table_blocks() {
        let backend = RecordingBackend::default();
        let chunk = Chunk {
            parent_segment_ordinal: 0,
            part_index: 0,
            part_count: 1,
            kind: SegmentKind::Table,
            payload: ChunkPayload::Text {
                text: "| **A** |\n| 1 |".to_string(),
                images: Vec::new(),
            },
        };
        let result = write_document(&backend, &job(vec![chunk]), &options()).await.unwrap();
        assert!(matches!(result.status, WriteStatus::Success { .. }));

        let appended = backend.appended.lock().unwrap();
        assert!(!appended.is_empty());
        for block in appended.iter() {
            assert_ne!(block["block_type"], "table");
        }
        assert_eq!(appended[0]["block_type"], "text");
    }

    #[tokio::test]
    async fn failure_on_second_chunk_does_not_resend_first() {
        let backend = RecordingBackend {
            fail_append_at_call: Some(2),
            ..Default::default()
        };
        let chunks = vec![
            text_chunk(0, 0, 3, "part one"),
            text_chunk(0, 1, 3, "part two"),
            text_chunk(0, 2, 3, "part three"),
        ];
        let result = write_document(&backend, &job(chunks), &options()).await.unwrap();

        match &result.status {
            WriteStatus::Failed { error_detail } => {
                assert!(error_detail.contains("chunk 2/3"), "got: {error_detail}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // Exactly two append calls: the first landed, the second failed,
        // the third was never attempted.
        assert_eq!(*backend.append_calls.lock().unwrap(), 2);
        assert_eq!(backend.appended.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn structural_title_rejection_tries_next_candidate() {
        let backend = RecordingBackend {
            structural_titles: vec!["Bad*Title".to_string()],
            ..Default::default()
        };
        let mut j = job(vec![text_chunk(0, 0, 1, "hello")]);
        j.titles = vec!["Bad*Title".to_string(), "Fallback".to_string()];
        let result = write_document(&backend, &j, &options()).await.unwrap();

        assert!(matches!(result.status, WriteStatus::Success { .. }));
        assert_eq!(
            *backend.create_calls.lock().unwrap(),
            vec!["Bad*Title".to_string(), "Fallback".to_string()]
        );
    }

    #[tokio::test]
    async fn token_refresh_failure_propagates_instead_of_failing_the_document() {
        let backend = RecordingBackend {
            refresh_failure: true,
            ..Default::default()
        };
        let result = write_document(&backend, &job(vec![text_chunk(0, 0, 1, "x")]), &options()).await;
        let err = result.expect_err("refresh failure must escalate");
        assert!(is_refresh_failure(&err));
    }

    #[tokio::test]
    async fn dry_run_touches_no_backend() {
        let backend = RecordingBackend::default();
        let result = write_document(&backend, &job(vec![text_chunk(0, 0, 1, "x")]), &WriteOptions {
            dry_run: true,
            append_batch: 20,
        })
        .await
        .unwrap();
        match result.status {
            WriteStatus::Success { remote_id, .. } => assert!(remote_id.starts_with("dry-run:")),
            other => panic!("expected success, got {other:?}"),
        }
        assert!(backend.create_calls.lock().unwrap().is_empty());
        assert_eq!(*backend.append_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn local_image_is_uploaded_and_reference_stripped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pic.png"), b"png-bytes").unwrap();

        let backend = RecordingBackend::default();
        let chunk = Chunk {
            parent_segment_ordinal: 0,
            part_index: 0,
            part_count: 1,
            kind: SegmentKind::Paragraph,
            payload: ChunkPayload::Text {
                text: "Before ![p](pic.png) after".to_string(),
                images: vec![ImageRef {
                    alt: "p".to_string(),
                    original: "pic.png".to_string(),
                }],
            },
        };
        let mut j = job(vec![chunk]);
        j.base_dir = dir.path().to_path_buf();
        let result = write_document(&backend, &j, &options()).await.unwrap();
        assert!(matches!(result.status, WriteStatus::Success { .. }));

        let appended = backend.appended.lock().unwrap();
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[0]["block_type"], "text");
        let text_json = appended[0]["elements"].to_string();
        assert!(!text_json.contains("pic.png"));
        assert_eq!(appended[1]["block_type"], "image");
        assert_eq!(appended[1]["media_id"], "media-1");
    }

    #[tokio::test]
    async fn missing_image_keeps_reference_and_succeeds() {
        let backend = RecordingBackend::default();
        let chunk = Chunk {
            parent_segment_ordinal: 0,
            part_index: 0,
            part_count: 1,
            kind: SegmentKind::Paragraph,
            payload: ChunkPayload::Text {
                text: "See ![gone](missing.png)".to_string(),
                images: vec![ImageRef {
                    alt: "gone".to_string(),
                    original: "missing.png".to_string(),
                }],
            },
        };
        let result = write_document(&backend, &job(vec![chunk]), &options()).await.unwrap();
        assert!(matches!(result.status, WriteStatus::Success { .. }));

        let appended = backend.appended.lock().unwrap();
        assert_eq!(appended.len(), 1);
        assert!(appended[0]["elements"].to_string().contains("missing.png"));
    }

    #[test]
    fn inline_runs_cover_links_and_styles() {
        let runs = text_runs("See [docs](https://d.io), **bold**, `code`, ~~old~~ and *lean*.");
        let rendered = serde_json::to_string(&runs).unwrap();
        assert!(rendered.contains("\"link\":\"https://d.io\""));
        assert!(rendered.contains("\"bold\":true"));
        assert!(rendered.contains("\"inline_code\":true"));
        assert!(rendered.contains("\"strikethrough\":true"));
        assert!(rendered.contains("\"italic\":true"));

        let plain = text_runs("no styling here");
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0]["text"], "no styling here");
    }

    #[test]
    fn list_items_map_to_marker_specific_blocks() {
        assert_eq!(item_block("- a")["block_type"], "bullet");
        assert_eq!(item_block("1. a")["block_type"], "ordered");
        assert_eq!(item_block("> a")["block_type"], "quote");
        assert_eq!(item_block("stray continuation")["block_type"], "bullet");
    }
}
