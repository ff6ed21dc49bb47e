//! Core data models used throughout the import pipeline.
//!
//! These types represent the documents, parsed segments, size-bounded
//! chunks, planned placements, and per-run results that flow from the
//! source enumerator through the remote writer.

use std::path::PathBuf;

/// Where a source document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    Repository,
}

/// One input Markdown file, immutable once enumerated.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Path relative to the source root, `/`-separated, unique per run.
    pub relative_path: String,
    /// Directory part of `relative_path` (empty for root-level files).
    pub relative_dir: String,
    /// Title derived from the first `#` heading, else the file stem.
    pub title: String,
    /// Full UTF-8 file content.
    pub raw_text: String,
    /// Absolute directory of the file on disk, for resolving relative
    /// image references.
    pub base_dir: PathBuf,
    pub source_kind: SourceKind,
}

/// One image reference extracted from Markdown or an HTML `<img>` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub alt: String,
    /// The raw URL/path exactly as written in the document.
    pub original: String,
}

/// Closed set of semantic segment kinds.
///
/// Adding a kind is a compile-time-checked change: the chunker and the
/// writer both match exhaustively on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Heading,
    Paragraph,
    List,
    Table,
    Code,
    Image,
    Math,
    Rule,
}

/// Kind-specific payload of a segment.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentBody {
    /// `level` is 1..=6. Inline math runs stay embedded in `text`.
    Heading { level: u8, text: String },
    /// Paragraph text with any image references extracted alongside so
    /// the writer can resolve uploads independent of text layout.
    Paragraph { text: String, images: Vec<ImageRef> },
    /// List and blockquote items; each item is one complete entry
    /// including continuation lines.
    List { items: Vec<String> },
    /// Row-by-row cell structure, preserved even for ragged tables.
    Table { rows: Vec<Vec<String>> },
    Code { language: String, body: String },
    /// A paragraph consisting solely of one image reference.
    Image(ImageRef),
    /// Display math (`$$ … $$`), delimiters stripped.
    Math { source: String },
    Rule,
}

/// One semantic unit of a parsed document. Never mutated after parsing;
/// chunking produces new [`Chunk`]s instead of editing in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Stable position within the document, used for re-assembly.
    pub ordinal: usize,
    pub kind: SegmentKind,
    pub body: SegmentBody,
}

/// Payload of a writable chunk. Tables never appear here natively: the
/// chunker re-serializes them to pipe-delimited text rows first.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    Heading { level: u8, text: String },
    Text { text: String, images: Vec<ImageRef> },
    ListItems { items: Vec<String> },
    Code { language: String, body: String },
    Image(ImageRef),
    Math { source: String },
    Rule,
}

/// A size-bounded writable slice of one segment.
///
/// For a given parent segment, `part_index` ranges `0..part_count`
/// contiguously and the payloads concatenate back to the parent content.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub parent_segment_ordinal: usize,
    pub part_index: usize,
    pub part_count: usize,
    pub kind: SegmentKind,
    pub payload: ChunkPayload,
}

impl Chunk {
    /// Serialized payload size in bytes, used to verify the per-request
    /// budget.
    pub fn payload_bytes(&self) -> usize {
        match &self.payload {
            ChunkPayload::Heading { text, .. } => text.len(),
            ChunkPayload::Text { text, .. } => text.len(),
            ChunkPayload::ListItems { items } => items.iter().map(|i| i.len() + 1).sum(),
            ChunkPayload::Code { body, .. } => body.len(),
            ChunkPayload::Image(image) => image.original.len(),
            ChunkPayload::Math { source } => source.len(),
            ChunkPayload::Rule => 0,
        }
    }
}

/// A planned placement of one source document in the output tree.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentNode {
    pub path: String,
    pub relative_dir: String,
    /// Display title; a TOC label wins over the document's own title.
    pub display_title: String,
    /// Final stable order index within the plan.
    pub order: usize,
    /// Whether the file is a `README`/`index`-style directory index.
    pub is_index: bool,
    pub toc_label: Option<String>,
}

/// One skipped or failed document with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct DocOutcome {
    pub path: String,
    pub reason: String,
}

/// Ordered plan for one run, plus TOC resolution statistics.
#[derive(Debug, Clone, Default)]
pub struct PlanManifest {
    pub nodes: Vec<DocumentNode>,
    pub skipped: Vec<DocOutcome>,
    /// Unresolved/ambiguous TOC link summaries, for the run log.
    pub unresolved_links: Vec<String>,
    pub toc_links: usize,
    pub matched_links: usize,
    pub ambiguous_links: usize,
    pub oracle_calls: u32,
}

/// Outcome of writing one document.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    Success {
        remote_id: String,
        url: String,
        wiki_node: Option<String>,
    },
    Failed {
        error_detail: String,
    },
    Skipped {
        reason: String,
    },
}

/// Terminal result for one [`DocumentNode`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub path: String,
    pub display_title: String,
    pub status: WriteStatus,
}

/// Record of one successfully created remote document, kept for the
/// navigation document.
#[derive(Debug, Clone)]
pub struct CreatedDoc {
    pub path: String,
    pub title: String,
    pub remote_id: String,
    pub url: String,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// Aggregated per-run report; the only externally persisted artifact.
///
/// Insertion is order-independent: results are keyed by relative path,
/// not by completion time.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub status: RunStatus,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<DocOutcome>,
    pub skipped_docs: Vec<DocOutcome>,
    pub created: Vec<CreatedDoc>,
}

impl TaskReport {
    pub fn new(total: usize) -> Self {
        Self {
            status: RunStatus::Completed,
            total,
            success: 0,
            failed: 0,
            skipped: 0,
            failures: Vec::new(),
            skipped_docs: Vec::new(),
            created: Vec::new(),
        }
    }

    /// Fold one terminal write result into the report.
    pub fn record(&mut self, result: &WriteResult) {
        match &result.status {
            WriteStatus::Success { remote_id, url, .. } => {
                self.success += 1;
                self.created.push(CreatedDoc {
                    path: result.path.clone(),
                    title: result.display_title.clone(),
                    remote_id: remote_id.clone(),
                    url: url.clone(),
                });
            }
            WriteStatus::Failed { error_detail } => {
                self.failed += 1;
                self.failures.push(DocOutcome {
                    path: result.path.clone(),
                    reason: one_line(error_detail),
                });
            }
            WriteStatus::Skipped { reason } => {
                self.skipped += 1;
                self.skipped_docs.push(DocOutcome {
                    path: result.path.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Process exit code convention: 0 all succeeded, 2 at least one
    /// document failed. (Fatal run errors exit 1 before a report exists.)
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            2
        } else {
            0
        }
    }
}

/// Compress an error detail to a single summary line.
fn one_line(detail: &str) -> String {
    let mut line = detail.lines().next().unwrap_or("").trim().to_string();
    const MAX: usize = 300;
    if line.len() > MAX {
        let mut cut = MAX;
        while cut > 0 && !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
    }
    line
}
