//! # docport
//!
//! Migrate Markdown trees from a local directory or a git repository
//! into a remote document workspace, as standalone files in a folder
//! hierarchy, as nodes in a wiki space, or both.
//!
//! The pipeline parses each document into typed segments, splits them
//! to satisfy the remote API's per-request byte budget, plans a stable
//! document order (TOC-driven when one exists), and writes the result
//! with per-document failure isolation and a single end-of-run report.
//!
//! ```text
//! ┌────────┐   ┌────────┐   ┌─────────┐   ┌────────┐
//! │ source │──▶│ parser │──▶│ chunker │──▶│ writer │──▶ remote API
//! └────────┘   └────────┘   └─────────┘   └────────┘
//!      │            ▲                          ▲
//!      └──▶ planner ┘      orchestrator ───────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`source`] | Local/git source enumeration |
//! | [`parser`] | Markdown block parser |
//! | [`chunker`] | Byte-budget segment chunking |
//! | [`planner`] | Document ordering and TOC resolution |
//! | [`oracle`] | Optional LLM link disambiguation |
//! | [`remote`] | Workspace API client, tokens, retry |
//! | [`writer`] | Chunk-to-block writes per document |
//! | [`notify`] | Webhook progress notifications |
//! | [`orchestrator`] | Concurrency, cancellation, reporting |

pub mod chunker;
pub mod config;
pub mod models;
pub mod notify;
pub mod oracle;
pub mod orchestrator;
pub mod parser;
pub mod planner;
pub mod remote;
pub mod source;
pub mod writer;
