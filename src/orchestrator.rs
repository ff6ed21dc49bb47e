//! Task orchestrator: run the whole pipeline for one invocation.
//!
//! Phases run in order: enumerate, plan, write, report. Writing is the
//! only concurrent phase. Document nodes are partitioned into groups by
//! top-level source directory (root-level files form their own group);
//! groups run concurrently under one semaphore while chunk planning
//! runs under a second, independent one. Within a group, documents are
//! written strictly in planned order.
//!
//! One document's failure never cancels its siblings. Cancellation is
//! cooperative: the flag is polled between documents, never mid-write.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

use crate::chunker;
use crate::config::Config;
use crate::models::{
    Chunk, CreatedDoc, DocumentNode, PlanManifest, RunStatus, SourceDocument, TaskReport,
    WriteResult, WriteStatus,
};
use crate::notify::{Event, NotifySink, NullSink};
use crate::oracle::TocResolver;
use crate::parser;
use crate::planner;
use crate::remote::{self, FolderCache, NodeCache, RemoteBackend};
use crate::source;
use crate::writer::{self, DocumentJob, WriteOptions};

/// Enumerate the source and build the ordered plan. Shared by the
/// import run and the plan-preview command.
pub async fn build_plan(
    config: &Config,
    oracle: Option<&dyn TocResolver>,
) -> Result<(Vec<SourceDocument>, PlanManifest)> {
    tracing::info!("Enumerating source");
    let tree = source::prepare(&config.source)?;
    let documents = source::enumerate(&tree, &config.source)?;
    tracing::info!(count = documents.len(), "Enumerated documents");

    tracing::info!("Planning structure");
    let manifest = planner::plan(
        &documents,
        &config.import,
        &config.chunking,
        oracle,
        &config.oracle,
    )
    .await?;
    tracing::info!(
        nodes = manifest.nodes.len(),
        toc_links = manifest.toc_links,
        matched = manifest.matched_links,
        ambiguous = manifest.ambiguous_links,
        "Plan ready"
    );
    for unresolved in &manifest.unresolved_links {
        tracing::warn!(link = %unresolved, "Unresolved TOC link");
    }

    Ok((documents, manifest))
}

/// Execute one full import run and return the final report.
pub async fn run(
    config: &Config,
    backend: Arc<dyn RemoteBackend>,
    oracle: Option<Box<dyn TocResolver>>,
    sink: Box<dyn NotifySink>,
    dry_run: bool,
    cancel: Arc<AtomicBool>,
) -> Result<TaskReport> {
    // Dry runs must not produce any network traffic, notifications
    // included.
    let sink: Arc<dyn NotifySink> = if dry_run {
        Arc::from(Box::new(NullSink) as Box<dyn NotifySink>)
    } else {
        Arc::from(sink)
    };

    let (documents, manifest) = build_plan(config, oracle.as_deref()).await?;

    let mut report = TaskReport::new(manifest.nodes.len() + manifest.skipped.len());
    for skipped in &manifest.skipped {
        report.skipped += 1;
        report.skipped_docs.push(skipped.clone());
    }

    sink.send(Event::RunStarted {
        total: manifest.nodes.len(),
    })
    .await;

    let placement = if dry_run {
        Placement::dry_run()
    } else {
        prepare_placement(config, backend.as_ref()).await?
    };

    tracing::info!(groups = "by top-level directory", "Writing documents");
    let by_path: BTreeMap<String, SourceDocument> = documents
        .into_iter()
        .map(|d| (d.relative_path.clone(), d))
        .collect();

    let mut groups: BTreeMap<String, Vec<(DocumentNode, SourceDocument)>> = BTreeMap::new();
    for node in &manifest.nodes {
        let doc = by_path
            .get(&node.path)
            .cloned()
            .context("Planned node lost its source document")?;
        groups
            .entry(group_key(&node.path))
            .or_default()
            .push((node.clone(), doc));
    }

    let report = Arc::new(Mutex::new(report));
    // First unrecoverable error from any group. Set together with the
    // cancel flag so sibling groups stop scheduling.
    let fatal: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
    let doc_permits = Arc::new(Semaphore::new(config.concurrency.doc_workers));
    let plan_permits = Arc::new(Semaphore::new(config.concurrency.plan_workers));
    let placement = Arc::new(placement);
    let options = WriteOptions {
        dry_run,
        append_batch: config.remote.append_batch,
    };

    let mut handles = Vec::new();
    for (key, group) in groups {
        let backend = Arc::clone(&backend);
        let report = Arc::clone(&report);
        let fatal = Arc::clone(&fatal);
        let doc_permits = Arc::clone(&doc_permits);
        let plan_permits = Arc::clone(&plan_permits);
        let placement = Arc::clone(&placement);
        let cancel = Arc::clone(&cancel);
        let sink = Arc::clone(&sink);
        let chunking = config.chunking.clone();
        let options = options.clone();

        handles.push(tokio::spawn(async move {
            let _permit = match doc_permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            tracing::debug!(group = %key, docs = group.len(), "Group started");
            run_group(
                group,
                backend.as_ref(),
                &placement,
                &plan_permits,
                &chunking,
                &options,
                &cancel,
                sink.as_ref(),
                &report,
                &fatal,
            )
            .await;
        }));
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Group task panicked");
        }
    }

    if let Some(err) = fatal.lock().await.take() {
        return Err(err);
    }

    let mut report = Arc::try_unwrap(report)
        .map_err(|_| anyhow::anyhow!("Report still shared after all groups finished"))?
        .into_inner();

    if cancel.load(Ordering::SeqCst) {
        report.status = RunStatus::Cancelled;
    }

    if !dry_run
        && config.import.nav_doc
        && placement.nav_folder_id.is_some()
        && !cancel.load(Ordering::SeqCst)
    {
        write_nav_doc(config, backend.as_ref(), &placement, &mut report).await;
    }

    sink.send(Event::RunFinished {
        summary: crate::notify::summarize(&report),
    })
    .await;
    tracing::info!(
        success = report.success,
        failed = report.failed,
        skipped = report.skipped,
        "Run complete"
    );
    Ok(report)
}

/// Resolved write destinations for the run.
struct Placement {
    /// Root folder documents are created in (folder and both modes).
    folder_root: String,
    /// Folder to place the navigation document in, when enabled.
    nav_folder_id: Option<String>,
    /// Wiki space id (wiki and both modes).
    space_id: Option<String>,
    /// Mirror source directories as sub-folders.
    folder_subdirs: bool,
    folder_cache: Mutex<FolderCache>,
    node_cache: Mutex<NodeCache>,
}

impl Placement {
    fn dry_run() -> Self {
        Self {
            folder_root: String::new(),
            nav_folder_id: None,
            space_id: None,
            folder_subdirs: false,
            folder_cache: Mutex::new(FolderCache::new()),
            node_cache: Mutex::new(NodeCache::new()),
        }
    }
}

async fn prepare_placement(config: &Config, backend: &dyn RemoteBackend) -> Result<Placement> {
    let uses_folders = matches!(config.import.write_mode.as_str(), "folder" | "both");
    let uses_wiki = matches!(config.import.write_mode.as_str(), "wiki" | "both");

    let mut folder_cache = FolderCache::new();
    let mut folder_root = config.remote.folder_id.clone();
    if uses_folders && config.import.batch_root {
        let name = if config.import.batch_root_name.is_empty() {
            format!("Import {}", Utc::now().format("%Y-%m-%d %H%M%S"))
        } else {
            config.import.batch_root_name.clone()
        };
        let name =
            planner::normalize_folder_name(&name, config.chunking.folder_name_max_bytes);
        folder_root = remote::ensure_folder(backend, &mut folder_cache, &folder_root, &name)
            .await
            .context("Failed to ensure batch root folder")?;
        tracing::info!(%name, "Batch root ready");
    }

    let space_id = if uses_wiki {
        let id = remote::ensure_space(
            backend,
            &config.import.space_id,
            &config.import.space_name,
        )
        .await?;
        Some(id)
    } else {
        None
    };

    Ok(Placement {
        nav_folder_id: uses_folders.then(|| folder_root.clone()),
        folder_root,
        space_id,
        folder_subdirs: config.import.folder_subdirs,
        folder_cache: Mutex::new(folder_cache),
        node_cache: Mutex::new(NodeCache::new()),
    })
}

/// Group key: first path component, or the reserved root group.
fn group_key(path: &str) -> String {
    match path.split_once('/') {
        Some((first, _)) => first.to_string(),
        None => String::new(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_group(
    group: Vec<(DocumentNode, SourceDocument)>,
    backend: &dyn RemoteBackend,
    placement: &Placement,
    plan_permits: &Arc<Semaphore>,
    chunking: &crate::config::ChunkingConfig,
    options: &WriteOptions,
    cancel: &AtomicBool,
    sink: &dyn NotifySink,
    report: &Mutex<TaskReport>,
    fatal: &Mutex<Option<anyhow::Error>>,
) {
    // Chunk planning is pipelined: every document's parse+chunk task is
    // spawned up front (bounded by the planning semaphore) while writes
    // drain them in planned order.
    let mut planned = Vec::new();
    for (node, doc) in group {
        let permits = Arc::clone(plan_permits);
        let chunking = chunking.clone();
        let raw_text = doc.raw_text.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire().await.ok()?;
            Some(chunker::chunk_document(&parser::parse(&raw_text), &chunking))
        });
        planned.push((node, doc, handle));
    }

    for (node, doc, handle) in planned {
        if cancel.load(Ordering::SeqCst) {
            handle.abort();
            let result = WriteResult {
                path: node.path.clone(),
                display_title: node.display_title.clone(),
                status: WriteStatus::Skipped {
                    reason: "run cancelled".to_string(),
                },
            };
            report.lock().await.record(&result);
            continue;
        }

        let chunks = match handle.await {
            Ok(Some(Ok(chunks))) => chunks,
            Ok(Some(Err(err))) => {
                let result = WriteResult {
                    path: node.path.clone(),
                    display_title: node.display_title.clone(),
                    status: WriteStatus::Failed {
                        error_detail: format!("{:#}", err),
                    },
                };
                sink.send(Event::DocumentFinished {
                    path: result.path.clone(),
                    outcome: "failed (size violation)".to_string(),
                })
                .await;
                report.lock().await.record(&result);
                continue;
            }
            _ => continue, // aborted or panicked planning task
        };

        let result =
            match write_one(backend, placement, node, doc, chunks, chunking, options).await {
                Ok(result) => result,
                Err(err) => {
                    // Unrecoverable: stop this group and tell the others
                    // to stop scheduling.
                    let mut slot = fatal.lock().await;
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    cancel.store(true, Ordering::SeqCst);
                    return;
                }
            };
        let outcome = match &result.status {
            WriteStatus::Success { .. } => "success",
            WriteStatus::Failed { .. } => "failed",
            WriteStatus::Skipped { .. } => "skipped",
        };
        sink.send(Event::DocumentFinished {
            path: result.path.clone(),
            outcome: outcome.to_string(),
        })
        .await;
        report.lock().await.record(&result);
    }
}

async fn write_one(
    backend: &dyn RemoteBackend,
    placement: &Placement,
    node: DocumentNode,
    doc: SourceDocument,
    chunks: Vec<Chunk>,
    chunking: &crate::config::ChunkingConfig,
    options: &WriteOptions,
) -> Result<WriteResult> {
    let folder_id = if options.dry_run {
        String::new()
    } else if placement.folder_subdirs && !node.relative_dir.is_empty() {
        let mut cache = placement.folder_cache.lock().await;
        match remote::ensure_folder_path(
            backend,
            &mut cache,
            &placement.folder_root,
            &node.relative_dir,
            chunking.folder_name_max_bytes,
        )
        .await
        {
            Ok(id) => id,
            Err(err) if remote::is_refresh_failure(&err) => return Err(err),
            Err(err) => {
                return Ok(WriteResult {
                    path: node.path.clone(),
                    display_title: node.display_title.clone(),
                    status: WriteStatus::Failed {
                        error_detail: format!("folder placement: {:#}", err),
                    },
                });
            }
        }
    } else {
        placement.folder_root.clone()
    };

    // The TOC label, when present, outranks the document's own
    // candidates.
    let mut titles = Vec::new();
    if node.toc_label.is_some() {
        titles.push(node.display_title.clone());
    }
    for candidate in planner::title_candidates(&doc, chunking.title_max_bytes) {
        if !titles.contains(&candidate) {
            titles.push(candidate);
        }
    }

    let job = DocumentJob {
        node: node.clone(),
        chunks,
        titles,
        base_dir: doc.base_dir.clone(),
        folder_id,
    };
    let mut result = writer::write_document(backend, &job, options).await?;

    // Wiki placement happens after the document exists.
    if let (Some(space_id), WriteStatus::Success { remote_id, .. }) =
        (&placement.space_id, &result.status)
    {
        let remote_id = remote_id.clone();
        let parent = {
            let mut cache = placement.node_cache.lock().await;
            remote::ensure_path_nodes(backend, &mut cache, space_id, &node.relative_dir).await
        };
        let moved = match parent {
            Ok(parent) => {
                backend
                    .move_doc_to_wiki(space_id, parent.as_deref(), &remote_id)
                    .await
            }
            Err(err) => Err(err),
        };
        match moved {
            Ok(node_id) => {
                if let WriteStatus::Success { wiki_node, .. } = &mut result.status {
                    *wiki_node = Some(node_id);
                }
            }
            Err(err) if remote::is_refresh_failure(&err) => return Err(err),
            Err(err) => {
                result.status = WriteStatus::Failed {
                    error_detail: format!("wiki placement: {:#}", err),
                };
            }
        }
    }

    Ok(result)
}

/// Write the navigation document at the batch root: an indented link
/// list over everything created this run, in planned order.
async fn write_nav_doc(
    config: &Config,
    backend: &dyn RemoteBackend,
    placement: &Placement,
    report: &mut TaskReport,
) {
    if report.created.is_empty() {
        return;
    }
    let Some(folder_id) = placement.nav_folder_id.clone() else {
        return;
    };

    let markdown = nav_markdown(&report.created);
    let chunks = match chunker::chunk_document(&parser::parse(&markdown), &config.chunking) {
        Ok(chunks) => chunks,
        Err(err) => {
            tracing::warn!(error = %err, "Navigation document could not be chunked");
            return;
        }
    };

    let node = DocumentNode {
        path: "<navigation>".to_string(),
        relative_dir: String::new(),
        display_title: config.import.nav_title.clone(),
        order: 0,
        is_index: true,
        toc_label: None,
    };
    let job = DocumentJob {
        node,
        chunks,
        titles: vec![config.import.nav_title.clone()],
        base_dir: std::path::PathBuf::from("."),
        folder_id,
    };
    let options = WriteOptions {
        dry_run: false,
        append_batch: config.remote.append_batch,
    };
    let result = match writer::write_document(backend, &job, &options).await {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(error = %format!("{:#}", err), "Navigation document failed");
            return;
        }
    };
    match &result.status {
        WriteStatus::Success { url, .. } => {
            tracing::info!(%url, "Navigation document written");
        }
        WriteStatus::Failed { error_detail } => {
            tracing::warn!(error = %error_detail, "Navigation document failed");
        }
        WriteStatus::Skipped { .. } => {}
    }
}

/// Indented markdown link list mirroring the source tree depth.
fn nav_markdown(created: &[CreatedDoc]) -> String {
    let mut lines = vec!["# Contents".to_string(), String::new()];
    for doc in created {
        let depth = doc.path.matches('/').count();
        let indent = "  ".repeat(depth);
        if doc.url.is_empty() {
            lines.push(format!("{}- {}", indent, doc.title));
        } else {
            lines.push(format!("{}- [{}]({})", indent, doc.title, doc.url));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_key_reserves_root_group() {
        assert_eq!(group_key("README.md"), "");
        assert_eq!(group_key("guides/setup.md"), "guides");
        assert_eq!(group_key("guides/deep/usage.md"), "guides");
    }

    #[test]
    fn nav_markdown_indents_by_depth() {
        let created = vec![
            CreatedDoc {
                path: "intro.md".to_string(),
                title: "Intro".to_string(),
                remote_id: "d1".to_string(),
                url: "https://r/d1".to_string(),
            },
            CreatedDoc {
                path: "guides/setup.md".to_string(),
                title: "Setup".to_string(),
                remote_id: "d2".to_string(),
                url: "https://r/d2".to_string(),
            },
        ];
        let markdown = nav_markdown(&created);
        assert!(markdown.contains("- [Intro](https://r/d1)"));
        assert!(markdown.contains("  - [Setup](https://r/d2)"));
    }
}
