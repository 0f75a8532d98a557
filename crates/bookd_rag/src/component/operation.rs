//! Main data structures flowing through the synthesis pipeline.
//!
//! Documents come in from the reader, get chunked here, embedded by
//! [`super::bert`], persisted by [`super::database::Store`], grouped into
//! [`Theme`]s and finally rendered into [`Chapter`]s.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub file_path: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub page_count: Option<u32>,
    pub file_size: Option<u64>,
    pub text_content: String,
    pub processed: bool,
}

impl Document {
    pub fn new(title: &str, text_content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_path: None,
            title: title.to_string(),
            author: None,
            page_count: None,
            file_size: None,
            text_content: text_content.to_string(),
            processed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub chunk_index: usize,
    /// Character span into the original document text. The overlap prefix
    /// borrowed from the previous chunk is not part of the span.
    pub start_char: usize,
    pub end_char: usize,
    pub page_number: Option<u32>,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    /// Chunk ids are derived from the document id and position so that
    /// re-ingesting the same document upserts instead of duplicating.
    pub fn make_id(document_id: &str, chunk_index: usize) -> String {
        format!("{document_id}:{chunk_index}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub id: String,
    pub label: String,
    pub description: String,
    pub chunk_ids: Vec<String>,
    pub keywords: Vec<String>,
    /// Relative cluster weight. Comparable within one discovery run only.
    pub importance_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailLevel {
    Brief,
    Standard,
    Comprehensive,
}

impl DetailLevel {
    pub fn instruction(self) -> &'static str {
        match self {
            DetailLevel::Brief => "Write a concise chapter covering only the key points.",
            DetailLevel::Standard => {
                "Write a well developed chapter with supporting detail from the sources."
            }
            DetailLevel::Comprehensive => {
                "Write an exhaustive chapter that works through every source passage in depth."
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterMetadata {
    pub detail_level: DetailLevel,
    pub model: Option<String>,
    pub generated_with_context: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    /// 1-based position in the final narrative order, which may differ
    /// from theme discovery order.
    pub chapter_number: usize,
    pub title: String,
    pub content: String,
    pub theme_id: String,
    /// Chunk ids used as sources, in retrieval order.
    pub source_chunk_ids: Vec<String>,
    pub word_count: usize,
    pub citations: Vec<Citation>,
    pub metadata: ChapterMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkOptions {
    /// Target chunk length in characters.
    pub chunk_size: usize,
    /// Characters of the previous chunk re-included at the start of the next.
    pub chunk_overlap: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 120,
        }
    }
}

/// A paragraph with its character span into the source text.
struct Paragraph {
    start_char: usize,
    end_char: usize,
    text: String,
}

/// Paragraphs are maximal runs of non-blank lines. Offsets are in characters.
fn split_paragraphs(text: &str) -> Vec<Paragraph> {
    let mut paragraphs = Vec::new();
    let mut current: Option<Paragraph> = None;
    let mut offset = 0usize;

    for line in text.split('\n') {
        let line_chars = line.chars().count();
        if line.trim().is_empty() {
            if let Some(p) = current.take() {
                paragraphs.push(p);
            }
        } else {
            match current.as_mut() {
                Some(p) => {
                    p.text.push('\n');
                    p.text.push_str(line);
                    p.end_char = offset + line_chars;
                }
                None => {
                    current = Some(Paragraph {
                        start_char: offset,
                        end_char: offset + line_chars,
                        text: line.to_string(),
                    });
                }
            }
        }
        // +1 for the consumed newline; harmless overshoot on the last line.
        offset += line_chars + 1;
    }
    if let Some(p) = current.take() {
        paragraphs.push(p);
    }
    paragraphs
}

fn char_tail(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}

/// Split a document into overlapping, size-bounded chunks.
///
/// Paragraphs are accumulated greedily until the next one would push the
/// chunk past `chunk_size` characters; the closing chunk's trailing
/// `chunk_overlap` characters seed the next chunk so local context survives
/// the boundary. A single paragraph longer than `chunk_size` becomes its own
/// oversized chunk rather than being dropped or split mid-sentence.
///
/// Deterministic: the same text and options always produce byte-identical
/// chunks.
pub fn chunk_document(document: &Document, opt: &ChunkOptions) -> Result<Vec<Chunk>> {
    if document.text_content.trim().is_empty() {
        return Err(PipelineError::EmptyContent {
            name: document.title.clone(),
        }
        .into());
    }

    let overlap = opt.chunk_overlap.min(opt.chunk_size.saturating_sub(1));
    let paragraphs = split_paragraphs(&document.text_content);

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut text = String::new();
    let mut len = 0usize;
    let mut span: Option<(usize, usize)> = None;

    let close_chunk =
        |chunks: &mut Vec<Chunk>, text: &mut String, len: &mut usize, span: &mut Option<(usize, usize)>| {
            let (start_char, end_char) = span.take().unwrap_or((0, 0));
            let chunk_index = chunks.len();
            chunks.push(Chunk {
                id: Chunk::make_id(&document.id, chunk_index),
                document_id: document.id.clone(),
                text: std::mem::take(text),
                chunk_index,
                start_char,
                end_char,
                page_number: None,
                embedding: None,
            });
            *len = 0;
        };

    for paragraph in paragraphs {
        let paragraph_len = paragraph.text.chars().count();
        let grown = len + 2 + paragraph_len;
        if span.is_some() && grown > opt.chunk_size {
            let tail = char_tail(&text, overlap);
            close_chunk(&mut chunks, &mut text, &mut len, &mut span);
            if overlap > 0 {
                text = tail;
                len = text.chars().count();
            }
        }
        if !text.is_empty() {
            text.push_str("\n\n");
            len += 2;
        }
        text.push_str(&paragraph.text);
        len += paragraph_len;
        span = Some(match span {
            Some((start, _)) => (start, paragraph.end_char),
            None => (paragraph.start_char, paragraph.end_char),
        });
    }
    if span.is_some() {
        close_chunk(&mut chunks, &mut text, &mut len, &mut span);
    }

    Ok(chunks)
}
