//! Configuration parsing and validation.
//!
//! The engine is configured via a TOML file (default: `config/grag.toml`).
//! The config defines the storage root, language-model endpoint, embedding
//! provider settings, retrieval tuning, graph traversal bounds, and the
//! server bind address.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for all persisted state: the SQLite database,
    /// `indexes/vector`, and uploaded blobs under `documents/`.
    pub root: PathBuf,
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.root.join("grag.sqlite")
    }

    pub fn vector_index_path(&self) -> PathBuf {
        self.root.join("indexes").join("vector")
    }

    pub fn graph_path(&self) -> PathBuf {
        self.root.join("indexes").join("graph")
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.root.join("documents")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint, e.g. an LM Studio or vLLM server.
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            base_url: None,
            model: None,
            dims: 384,
            batch_size: default_batch_size(),
            timeout_secs: default_embedding_timeout_secs(),
            max_retries: default_embedding_max_retries(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_embedding_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_top_k_speed")]
    pub top_k_speed: usize,
    #[serde(default = "default_top_k_deep")]
    pub top_k_deep: usize,
    /// Complexity score at or above which a query is routed to deep mode.
    #[serde(default = "default_mode_threshold")]
    pub mode_selection_threshold: f64,
    /// Fixed chunk window size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between consecutive windows, in characters. Must be < chunk_size.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k_speed: default_top_k_speed(),
            top_k_deep: default_top_k_deep(),
            mode_selection_threshold: default_mode_threshold(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_top_k_speed() -> usize {
    5
}
fn default_top_k_deep() -> usize {
    10
}
fn default_mode_threshold() -> f64 {
    0.5
}
fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    /// Maximum number of edges a single path may traverse.
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    /// Cap on paths returned by a single traversal, shortest-first.
    #[serde(default = "default_max_paths")]
    pub max_paths: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            max_paths: default_max_paths(),
        }
    }
}

fn default_max_hops() -> usize {
    2
}
fn default_max_paths() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" => {}
        "openai-compatible" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash or openai-compatible.",
            other
        ),
    }

    if config.rag.top_k_speed == 0 || config.rag.top_k_deep == 0 {
        anyhow::bail!("rag.top_k_speed and rag.top_k_deep must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.rag.mode_selection_threshold) {
        anyhow::bail!("rag.mode_selection_threshold must be in [0.0, 1.0]");
    }

    if config.rag.chunk_size == 0 {
        anyhow::bail!("rag.chunk_size must be > 0");
    }

    if config.rag.chunk_overlap >= config.rag.chunk_size {
        anyhow::bail!("rag.chunk_overlap must be smaller than rag.chunk_size");
    }

    if config.graph.max_paths == 0 {
        anyhow::bail!("graph.max_paths must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("grag.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_loads_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[storage]
root = "./data"

[llm]
base_url = "http://127.0.0.1:1234/v1"
model = "local-model"

[server]
bind = "127.0.0.1:8420"
"#,
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.rag.top_k_speed, 5);
        assert_eq!(config.rag.top_k_deep, 10);
        assert!((config.rag.mode_selection_threshold - 0.5).abs() < 1e-9);
        assert_eq!(config.graph.max_hops, 2);
        assert_eq!(config.graph.max_paths, 32);
        assert_eq!(config.embedding.provider, "hash");
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[storage]
root = "./data"

[llm]
base_url = "http://127.0.0.1:1234/v1"
model = "local-model"

[rag]
chunk_size = 100
chunk_overlap = 100

[server]
bind = "127.0.0.1:8420"
"#,
        );

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[storage]
root = "./data"

[llm]
base_url = "http://127.0.0.1:1234/v1"
model = "local-model"

[embedding]
provider = "sentencepiece"
dims = 384

[server]
bind = "127.0.0.1:8420"
"#,
        );

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_storage_paths_derived_from_root() {
        let storage = StorageConfig {
            root: PathBuf::from("/var/lib/grag"),
        };
        assert_eq!(storage.db_path(), PathBuf::from("/var/lib/grag/grag.sqlite"));
        assert_eq!(
            storage.vector_index_path(),
            PathBuf::from("/var/lib/grag/indexes/vector")
        );
        assert_eq!(
            storage.documents_dir(),
            PathBuf::from("/var/lib/grag/documents")
        );
    }
}
