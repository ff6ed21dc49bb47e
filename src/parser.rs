//! Markdown block parser.
//!
//! A single forward line scan converts raw Markdown into an ordered
//! sequence of typed [`Segment`]s. The parser is total: it never fails
//! on malformed input. Any line that matches no block rule is treated
//! as paragraph continuation, and an unclosed fence or table simply
//! ends at end of input.

use regex::Regex;
use std::sync::OnceLock;

use crate::models::{ImageRef, Segment, SegmentBody, SegmentKind};

fn md_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)(?:\s+[^)]*)?\)").unwrap())
}

fn html_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)<img[^>]*\bsrc\s*=\s*["']([^"']+)["'][^>]*>"#).unwrap())
}

/// Parse one document into segments. Total function, no I/O.
pub fn parse(text: &str) -> Vec<Segment> {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = Builder::default();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if trimmed.is_empty() {
            out.flush_paragraph(&mut paragraph);
            i += 1;
            continue;
        }

        if let Some((marker, language)) = fence_open(trimmed) {
            out.flush_paragraph(&mut paragraph);
            let mut body = Vec::new();
            i += 1;
            while i < lines.len() && !lines[i].trim().starts_with(marker) {
                body.push(lines[i]);
                i += 1;
            }
            // Skip the closing fence when present; EOF closes it too.
            if i < lines.len() {
                i += 1;
            }
            out.push(
                SegmentKind::Code,
                SegmentBody::Code {
                    language,
                    body: body.join("\n"),
                },
            );
            continue;
        }

        if let Some((level, heading)) = heading_line(trimmed) {
            out.flush_paragraph(&mut paragraph);
            out.push(
                SegmentKind::Heading,
                SegmentBody::Heading {
                    level,
                    text: heading,
                },
            );
            i += 1;
            continue;
        }

        if trimmed.starts_with("$$") {
            out.flush_paragraph(&mut paragraph);
            let inner = trimmed.trim_start_matches("$$");
            if inner.ends_with("$$") && !inner.is_empty() {
                let source = inner.trim_end_matches("$$").trim().to_string();
                out.push(SegmentKind::Math, SegmentBody::Math { source });
                i += 1;
            } else {
                let mut body = Vec::new();
                if !inner.trim().is_empty() {
                    body.push(inner.trim().to_string());
                }
                i += 1;
                while i < lines.len() && lines[i].trim() != "$$" {
                    body.push(lines[i].to_string());
                    i += 1;
                }
                if i < lines.len() {
                    i += 1;
                }
                out.push(
                    SegmentKind::Math,
                    SegmentBody::Math {
                        source: body.join("\n"),
                    },
                );
            }
            continue;
        }

        if is_thematic_break(trimmed) {
            out.flush_paragraph(&mut paragraph);
            out.push(SegmentKind::Rule, SegmentBody::Rule);
            i += 1;
            continue;
        }

        // A table opens only when a pipe row is followed by an
        // alignment row. Once open, every consecutive pipe row joins
        // it, ragged widths included.
        if is_table_row(trimmed)
            && i + 1 < lines.len()
            && is_alignment_row(lines[i + 1].trim())
        {
            out.flush_paragraph(&mut paragraph);
            let mut rows = vec![split_table_row(trimmed)];
            i += 2; // header + alignment row
            while i < lines.len() {
                let row = lines[i].trim();
                if !is_table_row(row) {
                    break;
                }
                if !is_alignment_row(row) {
                    rows.push(split_table_row(row));
                }
                i += 1;
            }
            out.push(SegmentKind::Table, SegmentBody::Table { rows });
            continue;
        }

        if is_item_marker(line) {
            out.flush_paragraph(&mut paragraph);
            let mut items: Vec<String> = Vec::new();
            while i < lines.len() {
                let line = lines[i];
                if line.trim().is_empty() {
                    i += 1;
                    break;
                }
                if is_item_marker(line) {
                    items.push(line.trim_end().trim_start().to_string());
                    i += 1;
                } else if line.starts_with(' ') || line.starts_with('\t') {
                    // Indented continuation of the current item.
                    if let Some(last) = items.last_mut() {
                        last.push('\n');
                        last.push_str(line.trim());
                    }
                    i += 1;
                } else {
                    break;
                }
            }
            out.push(SegmentKind::List, SegmentBody::List { items });
            continue;
        }

        paragraph.push(line);
        i += 1;
    }

    out.flush_paragraph(&mut paragraph);
    out.segments
}

#[derive(Default)]
struct Builder {
    segments: Vec<Segment>,
}

impl Builder {
    fn push(&mut self, kind: SegmentKind, body: SegmentBody) {
        self.segments.push(Segment {
            ordinal: self.segments.len(),
            kind,
            body,
        });
    }

    fn flush_paragraph(&mut self, lines: &mut Vec<&str>) {
        if lines.is_empty() {
            return;
        }
        let text = lines.join("\n").trim().to_string();
        lines.clear();
        if text.is_empty() {
            return;
        }

        let images = extract_images(&text);
        if images.len() == 1 && is_image_only(&text) {
            let image = images.into_iter().next().unwrap();
            self.push(SegmentKind::Image, SegmentBody::Image(image));
            return;
        }
        self.push(SegmentKind::Paragraph, SegmentBody::Paragraph { text, images });
    }
}

/// All markdown and HTML image references in order of appearance.
pub fn extract_images(text: &str) -> Vec<ImageRef> {
    let mut images: Vec<(usize, ImageRef)> = Vec::new();
    for caps in md_image_re().captures_iter(text) {
        let at = caps.get(0).map(|m| m.start()).unwrap_or(0);
        images.push((
            at,
            ImageRef {
                alt: caps[1].to_string(),
                original: caps[2].to_string(),
            },
        ));
    }
    for caps in html_image_re().captures_iter(text) {
        let at = caps.get(0).map(|m| m.start()).unwrap_or(0);
        images.push((
            at,
            ImageRef {
                alt: String::new(),
                original: caps[1].to_string(),
            },
        ));
    }
    images.sort_by_key(|(at, _)| *at);
    images.into_iter().map(|(_, image)| image).collect()
}

/// True when the paragraph body is exactly one image reference.
fn is_image_only(text: &str) -> bool {
    let stripped = html_image_re().replace_all(text, "");
    let stripped = md_image_re().replace_all(&stripped, "");
    stripped.trim().is_empty()
}

fn fence_open(trimmed: &str) -> Option<(&'static str, String)> {
    for marker in ["```", "~~~"] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            let language = rest.trim_start_matches(marker.chars().next().unwrap());
            return Some((marker, language.trim().to_string()));
        }
    }
    None
}

fn heading_line(trimmed: &str) -> Option<(u8, String)> {
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    // ATX closing hashes are decoration.
    let text = rest.trim().trim_end_matches('#').trim_end().to_string();
    Some((hashes as u8, text))
}

fn is_thematic_break(trimmed: &str) -> bool {
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 3 {
        return false;
    }
    let first = compact.chars().next().unwrap();
    matches!(first, '-' | '*' | '_') && compact.chars().all(|c| c == first)
}

fn is_table_row(trimmed: &str) -> bool {
    trimmed.starts_with('|') && trimmed.len() > 1
}

fn is_alignment_row(trimmed: &str) -> bool {
    if !is_table_row(trimmed) {
        return false;
    }
    let cells = split_table_row(trimmed);
    !cells.is_empty()
        && cells.iter().all(|cell| {
            let body = cell.trim_start_matches(':').trim_end_matches(':');
            !body.is_empty() && body.chars().all(|c| c == '-')
        })
}

fn split_table_row(trimmed: &str) -> Vec<String> {
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

fn is_item_marker(line: &str) -> bool {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix('>') {
        return rest.is_empty() || rest.starts_with(' ');
    }
    for marker in ['-', '*', '+'] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            if rest.starts_with(' ') {
                return true;
            }
        }
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(after) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return after.starts_with(' ');
        }
    }
    false
}
