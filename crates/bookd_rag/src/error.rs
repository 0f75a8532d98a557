//! Typed failure classes for the synthesis pipeline.
//!
//! Functions across the crate return [`anyhow::Result`] like the rest of the
//! codebase; operations with a contractual failure mode wrap one of these
//! variants so callers can tell input errors apart from dependent-service
//! errors by downcasting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A document reached the chunker with no usable text.
    #[error("document '{name}' has no text content")]
    EmptyContent { name: String },

    /// A chunk was handed to the store before being embedded.
    #[error("chunk '{chunk_id}' has no embedding; embed before storing")]
    MissingEmbedding { chunk_id: String },

    /// An embedding of the wrong dimension reached the store.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// File extension the reader does not understand.
    #[error("unsupported document format: {path}")]
    UnsupportedFormat { path: String },

    /// URL ingestion accepts http/https only.
    #[error("invalid url '{url}': only http and https are supported")]
    InvalidUrl { url: String },

    /// Prompt template name not registered. A caller bug, not recoverable.
    #[error("unknown prompt template '{name}'")]
    MissingTemplate { name: String },

    /// Prompt template rendered with a variable left unbound.
    #[error("prompt template '{template}' is missing variable '{name}'")]
    MissingTemplateVariable { template: String, name: String },
}
