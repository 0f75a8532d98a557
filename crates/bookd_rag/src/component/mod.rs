//! component provides the building blocks of the synthesis pipeline:
//! readers, chunker, embedder, vector store, prompt templates, LLM clients.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod bert;
pub mod cloud_model;
pub mod database;
pub mod llm;
pub mod operation;
pub mod prompt;
pub mod reader;
pub mod sqlite;

use bert::Embedder;
use database::Store;
use llm::Llm;
use operation::ChunkOptions;
use prompt::PromptManager;

/// Dimension of the default embedding model
/// (`sentence-transformers/all-MiniLM-L6-v2`).
pub const EMBEDDING_DIMENSION: usize = 384;

/// Explicit pipeline configuration, constructed once by the caller and
/// passed by reference. No module-level mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding the durable collections; `None` keeps everything
    /// in memory.
    pub storage_root: Option<PathBuf>,
    pub collection: String,
    pub embedding_model: Option<String>,
    pub embedding_dimension: usize,
    pub llm_model: Option<String>,
    pub chunking: ChunkOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_root: None,
            collection: "library".to_string(),
            embedding_model: None,
            embedding_dimension: EMBEDDING_DIMENSION,
            llm_model: None,
            chunking: ChunkOptions::default(),
        }
    }
}

/// [`LocalComponent`] bundles the locally running parts of the pipeline.
/// The embedding model is loaded lazily on first use so that sessions which
/// never embed (theme relabeling, synthesis from stored chunks) skip the
/// model download entirely.
pub struct LocalComponent {
    embedder: Option<Embedder>,
    pub llm: Box<dyn Llm + Send + Sync>,
    pub prompts: PromptManager,
    pub store: Store,
    pub config: PipelineConfig,
}

impl std::fmt::Debug for LocalComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LOCAL").finish()
    }
}

impl LocalComponent {
    /// Full local setup: llama.cpp LLM plus the configured store.
    #[cfg(not(target_os = "android"))]
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let llm = Box::new(llm::LocalLlm::new(config.llm_model.clone())?);
        Self::with_llm(llm, config)
    }

    /// Same wiring with a caller-chosen LLM client (cloud, mock).
    pub fn with_llm(llm: Box<dyn Llm + Send + Sync>, config: PipelineConfig) -> Result<Self> {
        let store = match &config.storage_root {
            Some(root) => Store::open(root, &config.collection, config.embedding_dimension)?,
            None => Store::in_memory(config.embedding_dimension)?,
        };
        Ok(Self {
            embedder: None,
            llm,
            prompts: PromptManager::default(),
            store,
            config,
        })
    }

    /// The embedding model, loading it on first call.
    pub fn embedder(&mut self) -> Result<&mut Embedder> {
        if self.embedder.is_none() {
            let embedder = Embedder::new(self.config.embedding_model.clone(), None)?;
            if embedder.dimension() != self.store.dimension() {
                return Err(crate::error::PipelineError::DimensionMismatch {
                    expected: self.store.dimension(),
                    got: embedder.dimension(),
                }
                .into());
            }
            self.embedder = Some(embedder);
        }
        // just set above
        Ok(self.embedder.as_mut().expect("embedder initialized"))
    }

    pub fn reset(&mut self) -> Result<()> {
        self.store.clear_collection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::MockLlm;

    #[test]
    fn test_with_llm_builds_in_memory_component() {
        let comps =
            LocalComponent::with_llm(Box::new(MockLlm::always("ok")), PipelineConfig::default())
                .unwrap();
        assert_eq!(comps.store.count().unwrap(), 0);
        assert_eq!(comps.llm.model_name(), "mock");
    }

    #[test]
    fn test_durable_config_uses_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            storage_root: Some(dir.path().to_path_buf()),
            collection: "shelf".to_string(),
            ..Default::default()
        };
        let comps = LocalComponent::with_llm(Box::new(MockLlm::always("ok")), config).unwrap();
        assert_eq!(comps.store.count().unwrap(), 0);
        assert!(dir.path().join("shelf.sqlite3").exists());
    }
}
