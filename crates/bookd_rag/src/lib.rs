//! bookd_rag turns a pile of documents into a book.
//!
//! The pipeline: readers ingest PDFs, DOCX, text files and URLs into
//! [`component::operation::Document`]s; the chunker splits them into
//! overlapping passages; the embedder maps passages to normalized vectors;
//! the store persists and searches them; theme discovery clusters the
//! collection into labeled groups; the synthesis engine plans a chapter
//! order and writes each chapter with retrieval-augmented LLM calls,
//! tracking which chunks each chapter cites.

pub mod component;
pub mod error;
pub mod method;

pub use component::{LocalComponent, PipelineConfig, EMBEDDING_DIMENSION};
pub use error::PipelineError;
