//! Segment chunker: split one segment into size-bounded chunks that
//! reassemble losslessly.
//!
//! Policy by kind:
//! - tables are re-serialized as pipe-delimited text rows and chunked
//!   at row boundaries; native table payloads are never produced
//! - paragraphs, code, and math split at line boundaries where
//!   possible, else at the nearest UTF-8 character boundary
//! - lists split at item boundaries only
//! - headings, images, and rules are never split; an oversized heading
//!   is truncated with a warning as a last resort
//!
//! Chunk boundaries are a pure function of the input and the limit.

use anyhow::{bail, Result};

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkPayload, ImageRef, Segment, SegmentBody, SegmentKind};

/// Split one segment into ordered chunks, each payload within
/// `limits.block_max_bytes`.
pub fn chunk_segment(segment: &Segment, limits: &ChunkingConfig) -> Result<Vec<Chunk>> {
    let max = limits.block_max_bytes;
    let payloads = match &segment.body {
        SegmentBody::Heading { level, text } => {
            let text = if text.len() > max {
                tracing::warn!(
                    ordinal = segment.ordinal,
                    bytes = text.len(),
                    "Heading exceeds block budget, truncating"
                );
                truncate_utf8(text, max)
            } else {
                text.clone()
            };
            vec![ChunkPayload::Heading {
                level: *level,
                text,
            }]
        }
        SegmentBody::Paragraph { text, images } => {
            let parts = split_text(text, max);
            let assigned = assign_images(&parts, images);
            parts
                .into_iter()
                .zip(assigned)
                .map(|(text, images)| ChunkPayload::Text { text, images })
                .collect()
        }
        SegmentBody::List { items } => split_items(items, max, segment.ordinal)?
            .into_iter()
            .map(|items| ChunkPayload::ListItems { items })
            .collect(),
        SegmentBody::Table { rows } => {
            let text = serialize_table(rows);
            split_text(&text, max)
                .into_iter()
                .map(|part| ChunkPayload::Text {
                    text: part,
                    images: Vec::new(),
                })
                .collect()
        }
        SegmentBody::Code { language, body } => split_text(body, max)
            .into_iter()
            .map(|part| ChunkPayload::Code {
                language: language.clone(),
                body: part,
            })
            .collect(),
        SegmentBody::Image(image) => vec![ChunkPayload::Image(image.clone())],
        SegmentBody::Math { source } => split_text(source, max)
            .into_iter()
            .map(|part| ChunkPayload::Math { source: part })
            .collect(),
        SegmentBody::Rule => vec![ChunkPayload::Rule],
    };

    let part_count = payloads.len();
    Ok(payloads
        .into_iter()
        .enumerate()
        .map(|(part_index, payload)| Chunk {
            parent_segment_ordinal: segment.ordinal,
            part_index,
            part_count,
            kind: segment.kind,
            payload,
        })
        .collect())
}

/// Chunk a whole document in segment order.
pub fn chunk_document(segments: &[Segment], limits: &ChunkingConfig) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    for segment in segments {
        chunks.extend(chunk_segment(segment, limits)?);
    }
    Ok(chunks)
}

/// Split text into parts of at most `max` bytes, preferring line
/// boundaries, then falling back to character-boundary byte splits
/// within an oversized line.
pub fn split_text(text: &str, max: usize) -> Vec<String> {
    if text.len() <= max {
        return vec![text.to_string()];
    }

    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.split_inclusive('\n') {
        if line.len() > max {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            parts.extend(split_by_chars(line, max));
            // An oversized line may leave a short tail; keep packing
            // into it.
            if let Some(tail) = parts.pop() {
                current = tail;
            }
            continue;
        }
        if current.len() + line.len() > max {
            parts.push(std::mem::take(&mut current));
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn split_by_chars(text: &str, max: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + max).min(text.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // A single character larger than the budget cannot occur
            // for any practical limit; step over it whole.
            end = text[start..]
                .char_indices()
                .nth(1)
                .map(|(i, _)| start + i)
                .unwrap_or(text.len());
        }
        parts.push(text[start..end].to_string());
        start = end;
    }
    parts
}

/// Group list items into runs whose joined size stays within budget.
/// Items are never split; a single oversized item is a size violation
/// surfaced as a document failure.
fn split_items(items: &[String], max: usize, ordinal: usize) -> Result<Vec<Vec<String>>> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_bytes = 0usize;

    for item in items {
        let cost = item.len() + 1;
        if cost > max {
            bail!(
                "List item at segment {} is {} bytes and cannot fit the {}-byte block budget",
                ordinal,
                item.len(),
                max
            );
        }
        if current_bytes + cost > max && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(item.clone());
        current_bytes += cost;
    }
    if !current.is_empty() {
        groups.push(current);
    }
    if groups.is_empty() {
        groups.push(Vec::new());
    }
    Ok(groups)
}

/// Pipe-delimited plain rendering of a table, one row per line. Header
/// cells are bolded unless already bold; alignment rows were dropped at
/// parse time.
pub fn serialize_table(rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len());
    for (row_index, row) in rows.iter().enumerate() {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| {
                if row_index == 0 && !cell.is_empty() && !cell.starts_with("**") {
                    format!("**{}**", cell)
                } else {
                    cell.clone()
                }
            })
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));
    }
    lines.join("\n")
}

/// Truncate to at most `max` bytes on a character boundary.
pub fn truncate_utf8(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

/// Assign each image to the part its reference appears in. A reference
/// cut in half by a character-boundary split keeps its upload with the
/// part holding the front of the reference.
fn assign_images(parts: &[String], images: &[ImageRef]) -> Vec<Vec<ImageRef>> {
    let mut assigned: Vec<Vec<ImageRef>> = vec![Vec::new(); parts.len()];
    for image in images {
        if let Some(at) = parts.iter().position(|p| p.contains(&image.original)) {
            assigned[at].push(image.clone());
            continue;
        }
        let split_at = parts.iter().position(|p| {
            (1..image.original.len())
                .rev()
                .filter(|&n| image.original.is_char_boundary(n))
                .any(|n| p.ends_with(&image.original[..n]))
        });
        match split_at {
            Some(at) => {
                tracing::warn!(
                    reference = %image.original,
                    "Image reference split across chunks, keeping upload with the first part"
                );
                assigned[at].push(image.clone());
            }
            None => {
                tracing::warn!(
                    reference = %image.original,
                    "Image reference lost during chunking"
                );
            }
        }
    }
    assigned
}

/// Sum of chunk counts without retaining the chunks, for plan output.
pub fn count_chunks(segments: &[Segment], limits: &ChunkingConfig) -> Result<usize> {
    Ok(chunk_document(segments, limits)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize) -> ChunkingConfig {
        ChunkingConfig {
            block_max_bytes: max,
            ..ChunkingConfig::default()
        }
    }

    fn paragraph(ordinal: usize, text: &str) -> Segment {
        Segment {
            ordinal,
            kind: SegmentKind::Paragraph,
            body: SegmentBody::Paragraph {
                text: text.to_string(),
                images: Vec::new(),
            },
        }
    }

    #[test]
    fn small_segment_passes_through_whole() {
        let chunks = chunk_segment(&paragraph(0, "short"), &limits(100)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].part_count, 1);
        assert_eq!(chunks[0].payload_bytes(), 5);
    }

    #[test]
    fn triple_limit_paragraph_yields_three_chunks() {
        let text = "x".repeat(300);
        let chunks = chunk_segment(&paragraph(4, &text), &limits(100)).unwrap();
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.parent_segment_ordinal, 4);
            assert_eq!(chunk.part_index, i);
            assert_eq!(chunk.part_count, 3);
            assert!(chunk.payload_bytes() <= 100);
        }
    }

    #[test]
    fn text_chunks_reassemble_losslessly() {
        let text = "alpha beta\ngamma delta\n".repeat(40);
        let parts = split_text(&text, 64);
        assert!(parts.iter().all(|p| p.len() <= 64));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn split_prefers_line_boundaries() {
        let text = "first line\nsecond line\nthird line\n";
        let parts = split_text(text, 24);
        assert_eq!(parts[0], "first line\nsecond line\n");
        assert_eq!(parts[1], "third line\n");
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "héllo wörld ünïcode ".repeat(30);
        let parts = split_text(&text, 50);
        assert!(parts.iter().all(|p| p.len() <= 50));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn list_splits_at_item_boundaries_only() {
        let items: Vec<String> = (0..10).map(|i| format!("- item number {}", i)).collect();
        let segment = Segment {
            ordinal: 1,
            kind: SegmentKind::List,
            body: SegmentBody::List {
                items: items.clone(),
            },
        };
        let chunks = chunk_segment(&segment, &limits(40)).unwrap();
        assert!(chunks.len() > 1);
        let mut reassembled = Vec::new();
        for chunk in &chunks {
            match &chunk.payload {
                ChunkPayload::ListItems { items } => reassembled.extend(items.clone()),
                other => panic!("expected list items, got {other:?}"),
            }
        }
        assert_eq!(reassembled, items);
    }

    #[test]
    fn oversized_list_item_is_a_size_violation() {
        let segment = Segment {
            ordinal: 0,
            kind: SegmentKind::List,
            body: SegmentBody::List {
                items: vec!["- ".to_string() + &"y".repeat(200)],
            },
        };
        assert!(chunk_segment(&segment, &limits(100)).is_err());
    }

    #[test]
    fn table_becomes_bold_header_text_rows() {
        let segment = Segment {
            ordinal: 0,
            kind: SegmentKind::Table,
            body: SegmentBody::Table {
                rows: vec![
                    vec!["Name".to_string(), "Role".to_string()],
                    vec!["ada".to_string(), "eng".to_string()],
                ],
            },
        };
        let chunks = chunk_segment(&segment, &limits(1000)).unwrap();
        assert_eq!(chunks.len(), 1);
        match &chunks[0].payload {
            ChunkPayload::Text { text, .. } => {
                assert_eq!(text, "| **Name** | **Role** |\n| ada | eng |");
            }
            other => panic!("expected text fallback, got {other:?}"),
        }
        // The table never surfaces as a native payload kind.
        assert_eq!(chunks[0].kind, SegmentKind::Table);
    }

    #[test]
    fn large_table_falls_back_to_multiple_text_chunks() {
        let rows: Vec<Vec<String>> = (0..200)
            .map(|i| vec![format!("cell-{}", i), "x".repeat(20)])
            .collect();
        let segment = Segment {
            ordinal: 0,
            kind: SegmentKind::Table,
            body: SegmentBody::Table { rows },
        };
        let chunks = chunk_segment(&segment, &limits(500)).unwrap();
        assert!(chunks.len() >= 2);
        assert!(chunks
            .iter()
            .all(|c| matches!(c.payload, ChunkPayload::Text { .. })));
    }

    #[test]
    fn oversized_heading_is_truncated_not_split() {
        let segment = Segment {
            ordinal: 0,
            kind: SegmentKind::Heading,
            body: SegmentBody::Heading {
                level: 2,
                text: "h".repeat(500),
            },
        };
        let chunks = chunk_segment(&segment, &limits(100)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload_bytes(), 100);
    }

    #[test]
    fn chunk_boundaries_are_deterministic() {
        let text = "word ".repeat(500);
        let a = split_text(&text, 128);
        let b = split_text(&text, 128);
        assert_eq!(a, b);
    }

    #[test]
    fn image_refs_follow_their_text_part() {
        let image = ImageRef {
            alt: "d".to_string(),
            original: "pic.png".to_string(),
        };
        let mut text = "a".repeat(120);
        text.push_str("\n![d](pic.png)\n");
        let segment = Segment {
            ordinal: 0,
            kind: SegmentKind::Paragraph,
            body: SegmentBody::Paragraph {
                text,
                images: vec![image.clone()],
            },
        };
        let chunks = chunk_segment(&segment, &limits(128)).unwrap();
        assert!(chunks.len() >= 2);
        let with_image: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| matches!(&c.payload, ChunkPayload::Text { images, .. } if !images.is_empty()))
            .collect();
        assert_eq!(with_image.len(), 1);
    }

    #[test]
    fn image_reference_split_by_hard_cut_keeps_its_upload() {
        let image = ImageRef {
            alt: "d".to_string(),
            original: "very-long-image-name.png".to_string(),
        };
        // One 120-byte line with no break points: the character-boundary
        // fallback cuts straight through the reference.
        let text = format!("{}![d]({})", "a".repeat(90), image.original);
        let segment = Segment {
            ordinal: 0,
            kind: SegmentKind::Paragraph,
            body: SegmentBody::Paragraph {
                text,
                images: vec![image.clone()],
            },
        };
        let chunks = chunk_segment(&segment, &limits(100)).unwrap();
        assert_eq!(chunks.len(), 2);
        let carriers: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| matches!(&c.payload, ChunkPayload::Text { images, .. } if !images.is_empty()))
            .collect();
        assert_eq!(carriers.len(), 1, "exactly one chunk keeps the upload");
    }
}
