//! Document readers: local text/Markdown, PDF, DOCX, and URL fetch.
//!
//! Single-document readers fail fast with a typed error naming the broken
//! precondition. The batch helpers never abort on one bad item; they return
//! an [`IngestReport`] with per-item failure reasons.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::operation::Document;
use crate::error::PipelineError;

fn title_from_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn non_empty(text: String, name: &str) -> Result<String> {
    if text.trim().is_empty() {
        return Err(PipelineError::EmptyContent {
            name: name.to_string(),
        }
        .into());
    }
    Ok(text)
}

fn read_pdf(path: &Path) -> Result<(String, Option<u32>)> {
    let text = pdf_extract::extract_text(path)
        .with_context(|| format!("failed to extract pdf text from {}", path.display()))?;
    // page count comes from the raw document; text extraction flattens it
    let page_count = lopdf::Document::load(path)
        .map(|doc| doc.get_pages().len() as u32)
        .ok();
    Ok((text, page_count))
}

fn read_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("{} is not a valid docx archive", path.display()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .with_context(|| format!("{} has no word/document.xml", path.display()))?
        .read_to_string(&mut xml)?;
    docx_xml_to_text(&xml)
}

/// Pull the visible text out of `word/document.xml`: `<w:t>` runs joined,
/// `</w:p>` closing a paragraph.
fn docx_xml_to_text(xml: &str) -> Result<String> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text_run = false;

    loop {
        match reader
            .read_event_into(&mut buf)
            .with_context(|| "malformed docx xml")?
        {
            Event::Start(e) if e.name().as_ref() == b"w:t" => in_text_run = true,
            Event::End(e) if e.name().as_ref() == b"w:t" => in_text_run = false,
            Event::End(e) if e.name().as_ref() == b"w:p" => {
                out.push_str("\n\n");
            }
            Event::Text(e) if in_text_run => {
                out.push_str(&e.unescape().with_context(|| "malformed docx text")?);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

/// Read one document from disk, dispatching on the file extension.
pub fn read_document(path: &Path) -> Result<Document> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let title = title_from_stem(path);

    let (text, page_count) = match extension.as_str() {
        "txt" | "md" | "markdown" => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            (text, None)
        }
        "pdf" => read_pdf(path)?,
        "docx" => (read_docx(path)?, None),
        _ => {
            return Err(PipelineError::UnsupportedFormat {
                path: path.display().to_string(),
            }
            .into())
        }
    };
    let text = non_empty(text, &title)?;
    let file_size = std::fs::metadata(path).map(|m| m.len()).ok();

    info!("read {} ({} chars)", path.display(), text.chars().count());
    Ok(Document {
        id: Uuid::new_v4().to_string(),
        file_path: Some(path.display().to_string()),
        title,
        author: None,
        page_count,
        file_size,
        text_content: text,
        processed: false,
    })
}

/// Fetch a document over http(s). Any other scheme is rejected up front.
pub fn fetch_url(url: &str) -> Result<Document> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(PipelineError::InvalidUrl {
            url: url.to_string(),
        }
        .into());
    }
    let response = reqwest::blocking::get(url).with_context(|| format!("failed to fetch {url}"))?;
    let response = response
        .error_for_status()
        .with_context(|| format!("{url} answered with an error status"))?;
    let text = response
        .text()
        .with_context(|| format!("failed to read body of {url}"))?;
    let text = non_empty(text, url)?;

    let title = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(url)
        .to_string();
    Ok(Document {
        id: Uuid::new_v4().to_string(),
        file_path: Some(url.to_string()),
        title,
        author: None,
        page_count: None,
        file_size: Some(text.len() as u64),
        text_content: text,
        processed: false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Completed,
    CompletedWithFailures,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestFailure {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestReport {
    pub succeeded: Vec<Document>,
    pub failed: Vec<IngestFailure>,
    pub status: IngestStatus,
}

impl IngestReport {
    fn from_parts(succeeded: Vec<Document>, failed: Vec<IngestFailure>) -> Self {
        let status = match (succeeded.is_empty(), failed.is_empty()) {
            (_, true) => IngestStatus::Completed,
            (false, false) => IngestStatus::CompletedWithFailures,
            (true, false) => IngestStatus::Failed,
        };
        Self {
            succeeded,
            failed,
            status,
        }
    }
}

fn ingest_batch<T, F>(items: &[T], source: impl Fn(&T) -> String, read: F) -> IngestReport
where
    F: Fn(&T) -> Result<Document>,
{
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for item in items {
        match read(item) {
            Ok(document) => succeeded.push(document),
            Err(err) => {
                warn!("ingestion of {} failed: {err:#}", source(item));
                failed.push(IngestFailure {
                    source: source(item),
                    reason: format!("{err:#}"),
                });
            }
        }
    }
    IngestReport::from_parts(succeeded, failed)
}

pub fn ingest_paths(paths: &[std::path::PathBuf]) -> IngestReport {
    ingest_batch(paths, |p| p.display().to_string(), |p| read_document(p))
}

pub fn ingest_urls(urls: &[String]) -> IngestReport {
    ingest_batch(urls, |u| u.clone(), |u| fetch_url(u))
}
