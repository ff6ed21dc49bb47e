use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
}

/// Where the Markdown tree comes from: a local directory or a git
/// repository checkout.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Local root directory. Mutually exclusive with `repo`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Repository in `owner/name` form, a full clone URL, or a local
    /// git path.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_ref", alias = "ref")]
    pub reference: String,
    /// Optional subdirectory within the repository to scan.
    #[serde(default)]
    pub subdir: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Mirror prefix tried when a direct github.com clone fails
    /// (e.g. `https://gh-proxy.com/`). Empty disables the fallback.
    #[serde(default)]
    pub mirror_prefix: String,
}

fn default_ref() -> String {
    "main".to_string()
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

/// Remote workspace API settings. App credentials are read from the
/// `DOCPORT_APP_ID` / `DOCPORT_APP_SECRET` environment variables, never
/// from the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// API payload codes treated as structural rejections (the write is
    /// well-formed but the endpoint refuses it for policy reasons).
    #[serde(default = "default_structural_codes")]
    pub structural_codes: Vec<i64>,
    /// Root folder id for folder-mode placement.
    #[serde(default)]
    pub folder_id: String,
    /// Blocks per append call.
    #[serde(default = "default_append_batch")]
    pub append_batch: usize,
    /// On-disk cache for the refreshed user token.
    #[serde(default = "default_token_cache")]
    pub token_cache_path: PathBuf,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_structural_codes() -> Vec<i64> {
    vec![1770001]
}
fn default_append_batch() -> usize {
    20
}
fn default_token_cache() -> PathBuf {
    PathBuf::from("cache/user_token.json")
}

/// Byte budgets for chunking and remote-facing strings.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum serialized payload bytes per chunk.
    #[serde(default = "default_block_max_bytes")]
    pub block_max_bytes: usize,
    #[serde(default = "default_title_max_bytes")]
    pub title_max_bytes: usize,
    #[serde(default = "default_folder_name_max_bytes")]
    pub folder_name_max_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            block_max_bytes: default_block_max_bytes(),
            title_max_bytes: default_title_max_bytes(),
            folder_name_max_bytes: default_folder_name_max_bytes(),
        }
    }
}

fn default_block_max_bytes() -> usize {
    3000
}
fn default_title_max_bytes() -> usize {
    180
}
fn default_folder_name_max_bytes() -> usize {
    256
}

/// Placement and ordering policy for one run.
#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    /// `folder`, `wiki`, or `both`.
    #[serde(default = "default_write_mode")]
    pub write_mode: String,
    /// `toc_first` or `path`.
    #[serde(default = "default_structure_order")]
    pub structure_order: String,
    #[serde(default = "default_toc_file")]
    pub toc_file: String,
    #[serde(default)]
    pub skip_root_readme: bool,
    /// Destination wiki space name (created when missing) …
    #[serde(default)]
    pub space_name: String,
    /// … or an existing space id, which wins when both are set.
    #[serde(default)]
    pub space_id: String,
    /// Mirror source directories as sub-folders in folder mode.
    #[serde(default)]
    pub folder_subdirs: bool,
    /// Group everything written in one run under a batch root folder.
    #[serde(default)]
    pub batch_root: bool,
    /// Batch root folder name; empty means auto-named from the run
    /// timestamp.
    #[serde(default)]
    pub batch_root_name: String,
    /// Generate a navigation document at the batch root after import.
    #[serde(default = "default_true")]
    pub nav_doc: bool,
    #[serde(default = "default_nav_title")]
    pub nav_title: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            write_mode: default_write_mode(),
            structure_order: default_structure_order(),
            toc_file: default_toc_file(),
            skip_root_readme: false,
            space_name: String::new(),
            space_id: String::new(),
            folder_subdirs: false,
            batch_root: false,
            batch_root_name: String::new(),
            nav_doc: default_true(),
            nav_title: default_nav_title(),
        }
    }
}

fn default_write_mode() -> String {
    "folder".to_string()
}
fn default_structure_order() -> String {
    "toc_first".to_string()
}
fn default_toc_file() -> String {
    "TABLE_OF_CONTENTS.md".to_string()
}
fn default_true() -> bool {
    true
}
fn default_nav_title() -> String {
    "00 Navigation Index".to_string()
}

/// Two independent worker pools: document groups (network-bound) and
/// chunk planning (local computation).
#[derive(Debug, Deserialize, Clone)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_doc_workers")]
    pub doc_workers: usize,
    #[serde(default = "default_plan_workers")]
    pub plan_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            doc_workers: default_doc_workers(),
            plan_workers: default_plan_workers(),
        }
    }
}

fn default_doc_workers() -> usize {
    2
}
fn default_plan_workers() -> usize {
    4
}

/// Progress notification settings. Delivery failures are logged, never
/// fatal.
#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    /// `none`, `minimal`, or `normal`.
    #[serde(default = "default_notify_level")]
    pub level: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_message_max_bytes")]
    pub message_max_bytes: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            level: default_notify_level(),
            webhook_url: String::new(),
            message_max_bytes: default_message_max_bytes(),
        }
    }
}

fn default_notify_level() -> String {
    "normal".to_string()
}
fn default_message_max_bytes() -> usize {
    18000
}

/// Optional LLM oracle used only for TOC ambiguity resolution. The API
/// key comes from the `ORACLE_API_KEY` environment variable.
#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_oracle_max_calls")]
    pub max_calls: u32,
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_oracle_provider(),
            base_url: String::new(),
            model: String::new(),
            max_calls: default_oracle_max_calls(),
            confidence_threshold: default_confidence(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_oracle_provider() -> String {
    "disabled".to_string()
}
fn default_oracle_max_calls() -> u32 {
    3
}
fn default_confidence() -> f64 {
    0.6
}

impl OracleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match (&config.source.root, &config.source.repo) {
        (None, None) => anyhow::bail!("source.root or source.repo must be set"),
        (Some(_), Some(_)) => {
            anyhow::bail!("source.root and source.repo are mutually exclusive")
        }
        _ => {}
    }

    if config.remote.base_url.is_empty() {
        anyhow::bail!("remote.base_url must be set");
    }

    if config.chunking.block_max_bytes == 0 {
        anyhow::bail!("chunking.block_max_bytes must be > 0");
    }

    match config.import.write_mode.as_str() {
        "folder" | "wiki" | "both" => {}
        other => anyhow::bail!(
            "Unknown import.write_mode: '{}'. Must be folder, wiki, or both.",
            other
        ),
    }

    match config.import.structure_order.as_str() {
        "toc_first" | "path" => {}
        other => anyhow::bail!(
            "Unknown import.structure_order: '{}'. Must be toc_first or path.",
            other
        ),
    }

    if matches!(config.import.write_mode.as_str(), "wiki" | "both")
        && config.import.space_name.is_empty()
        && config.import.space_id.is_empty()
    {
        anyhow::bail!("import.space_name or import.space_id is required in wiki/both mode");
    }

    if config.concurrency.doc_workers == 0 || config.concurrency.plan_workers == 0 {
        anyhow::bail!("concurrency worker counts must be >= 1");
    }

    match config.notify.level.as_str() {
        "none" | "minimal" | "normal" => {}
        other => anyhow::bail!(
            "Unknown notify.level: '{}'. Must be none, minimal, or normal.",
            other
        ),
    }

    match config.oracle.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown oracle.provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.oracle.is_enabled() {
        if config.oracle.model.is_empty() {
            anyhow::bail!("oracle.model must be set when the oracle is enabled");
        }
        if !(0.0..=1.0).contains(&config.oracle.confidence_threshold) {
            anyhow::bail!("oracle.confidence_threshold must be in [0.0, 1.0]");
        }
    }

    Ok(())
}
