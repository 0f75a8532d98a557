//! Retrieval-augmented generation over the chunk store.
//!
//! `insert` runs the write path (chunk, embed, store); `retrieve` +
//! `build_context` + `generate` run the read path. Store and LLM errors
//! propagate to the caller untouched; an empty store is not an error, it
//! just retrieves nothing.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::component::database::{SearchFilter, SearchResult};
use crate::component::llm::{GenerateOptions, TokenStream};
use crate::component::operation::{Chunk, ChunkOptions, Document};
use crate::component::prompt::RAG_QUERY;
use crate::component::LocalComponent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagOptions {
    pub top_k: usize,
    /// Annotate each context block with its source document and page.
    pub include_metadata: bool,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for RagOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            include_metadata: true,
            temperature: 0.7,
            max_tokens: 2048,
        }
    }
}

impl RagOptions {
    pub(crate) fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Chunk a document, embed the chunks, and persist everything. Returns the
/// stored chunks. Re-inserting the same document upserts by chunk id.
pub async fn insert(
    document: &Document,
    comps: &mut LocalComponent,
    opt: &ChunkOptions,
) -> Result<Vec<Chunk>> {
    let mut chunks = crate::component::operation::chunk_document(document, opt)?;
    comps.embedder()?.embed_chunks(&mut chunks, 16)?;

    let mut stored_doc = document.clone();
    stored_doc.processed = true;
    comps.store.add_document(&stored_doc)?;
    comps.store.add_chunks(&chunks)?;
    info!("inserted {} chunks of '{}'", chunks.len(), document.title);
    Ok(chunks)
}

/// Embed the query and rank stored chunks against it.
pub fn retrieve(
    query: &str,
    comps: &mut LocalComponent,
    top_k: usize,
    filter: Option<&SearchFilter>,
) -> Result<Vec<SearchResult>> {
    if comps.store.count()? == 0 {
        return Ok(Vec::new());
    }
    let query_embedding = comps.embedder()?.embed_text(query)?;
    comps.store.search(&query_embedding, top_k, filter)
}

const CONTEXT_DELIMITER: &str = "\n---\n";

/// Concatenate retrieved texts into one prompt context. Zero results yield
/// the empty string.
pub fn build_context(results: &[SearchResult], include_metadata: bool) -> String {
    let blocks: Vec<String> = results
        .iter()
        .map(|result| {
            if include_metadata {
                let doc_fragment: String = if result.metadata.document_id.is_empty() {
                    "unknown".to_string()
                } else {
                    result.metadata.document_id.chars().take(8).collect()
                };
                let page = result
                    .metadata
                    .page_number
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("[source: {doc_fragment} p.{page}]\n{}", result.text)
            } else {
                result.text.clone()
            }
        })
        .collect();
    blocks.join(CONTEXT_DELIMITER)
}

/// Answer a question from the store: retrieve, build context, call the LLM.
pub async fn generate(
    question: &str,
    comps: &mut LocalComponent,
    opt: &RagOptions,
) -> Result<String> {
    let results = retrieve(question, comps, opt.top_k, None)?;
    let context = build_context(&results, opt.include_metadata);
    let vars: HashMap<&str, String> = [
        ("context", context),
        ("question", question.to_string()),
    ]
    .into_iter()
    .collect();
    let (system, user) = comps.prompts.get_prompt(RAG_QUERY, &vars)?;
    comps.llm.generate(&system, &user, &opt.generate_options())
}

/// Streaming variant of [`generate`]; fragments arrive as the model emits
/// them. Dropping the stream abandons the generation.
pub async fn generate_stream(
    question: &str,
    comps: &mut LocalComponent,
    opt: &RagOptions,
) -> Result<TokenStream> {
    let results = retrieve(question, comps, opt.top_k, None)?;
    let context = build_context(&results, opt.include_metadata);
    let vars: HashMap<&str, String> = [
        ("context", context),
        ("question", question.to_string()),
    ]
    .into_iter()
    .collect();
    let (system, user) = comps.prompts.get_prompt(RAG_QUERY, &vars)?;
    comps
        .llm
        .generate_stream(&system, &user, &opt.generate_options())
}
