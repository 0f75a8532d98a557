//! Chapter planning and synthesis.
//!
//! Planning (theme ordering) is a quality enhancement: any failure there
//! falls back to the input order. Chapter generation is different, since
//! bad or missing content corrupts the book, so LLM failures propagate and
//! the caller decides whether to retry or abort.

use std::collections::HashMap;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::component::database::{ChunkMetadata, SearchResult};
use crate::component::llm::GenerateOptions;
use crate::component::operation::{
    Chapter, ChapterMetadata, Chunk, Citation, DetailLevel, Theme,
};
use crate::component::prompt::{CHAPTER_OUTLINE, CHAPTER_SEQUENCING, CHAPTER_SYNTHESIS};
use crate::component::LocalComponent;

use super::rag::build_context;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisOptions {
    pub book_title: String,
    pub book_objective: String,
    /// Cap on synthesized chapters; `None` synthesizes every theme.
    pub max_chapters: Option<usize>,
    pub detail_level: DetailLevel,
    /// Cap on source chunks pulled into one chapter's context.
    pub chunks_per_chapter: usize,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            book_title: "Untitled".to_string(),
            book_objective: String::new(),
            max_chapters: None,
            detail_level: DetailLevel::Standard,
            chunks_per_chapter: 12,
            temperature: 0.7,
            max_tokens: 2048,
        }
    }
}

impl SynthesisOptions {
    fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Rolling summary passed from one chapter to the next. Plain truncation;
/// chapters open with their thesis, so the head is the useful part.
const SUMMARY_WORDS: usize = 120;

fn summarize(content: &str) -> String {
    let words: Vec<&str> = content.split_whitespace().take(SUMMARY_WORDS).collect();
    words.join(" ")
}

fn numbered_theme_list(themes: &[Theme]) -> String {
    themes
        .iter()
        .enumerate()
        .map(|(i, theme)| format!("{}. {}: {}", i + 1, theme.label, theme.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Best-effort parse of a numbered-list ordering reply into a permutation
/// of `0..n`. `None` means no confident order could be read; the caller
/// falls back to the input order. Indices the model skipped are appended
/// in input order so the result is always a full permutation.
pub fn parse_chapter_order(response: &str, n: usize) -> Option<Vec<usize>> {
    // unwrap: literal pattern, compiles
    let digits = Regex::new(r"\d+").unwrap();
    let mut order = Vec::new();
    for m in digits.find_iter(response) {
        let Ok(number) = m.as_str().parse::<usize>() else {
            continue;
        };
        if number >= 1 && number <= n {
            let index = number - 1;
            if !order.contains(&index) {
                order.push(index);
            }
        }
    }
    if order.is_empty() {
        return None;
    }
    for index in 0..n {
        if !order.contains(&index) {
            order.push(index);
        }
    }
    Some(order)
}

/// Propose a narrative order for the themes. A single theme needs no
/// ordering and costs no LLM call. Any planning failure (client error,
/// unparseable reply) keeps the input order; ordering is an enhancement,
/// not a correctness requirement.
pub async fn plan_chapters(
    themes: &[Theme],
    comps: &mut LocalComponent,
    opt: &SynthesisOptions,
) -> Vec<Theme> {
    if themes.len() <= 1 {
        return themes.to_vec();
    }

    let vars: HashMap<&str, String> = [
        ("book_title", opt.book_title.clone()),
        ("book_objective", opt.book_objective.clone()),
        ("themes", numbered_theme_list(themes)),
    ]
    .into_iter()
    .collect();

    let response = comps
        .prompts
        .get_prompt(CHAPTER_SEQUENCING, &vars)
        .and_then(|(system, user)| comps.llm.generate(&system, &user, &opt.generate_options()));

    match response {
        Ok(response) => match parse_chapter_order(&response, themes.len()) {
            Some(order) => {
                info!("planned chapter order: {order:?}");
                order.into_iter().map(|i| themes[i].clone()).collect()
            }
            None => {
                warn!("no confident chapter order in reply, keeping input order");
                themes.to_vec()
            }
        },
        Err(err) => {
            warn!("chapter planning failed, keeping input order: {err:#}");
            themes.to_vec()
        }
    }
}

fn chunk_to_result(chunk: &Chunk) -> SearchResult {
    SearchResult {
        chunk_id: chunk.id.clone(),
        text: chunk.text.clone(),
        metadata: ChunkMetadata {
            document_id: chunk.document_id.clone(),
            chunk_index: chunk.chunk_index,
            page_number: chunk.page_number,
        },
        score: 1.0,
    }
}

/// Synthesize one chapter from a theme's chunks. Every chunk that went into
/// the context is recorded in `source_chunk_ids` and `citations`, in
/// retrieval order. A theme with no chunks still produces a well-formed
/// (content-sparse) chapter. LLM failures propagate.
pub async fn synthesize_chapter(
    theme: &Theme,
    chapter_number: usize,
    total_chapters: usize,
    opt: &SynthesisOptions,
    previous_chapter_summary: Option<&str>,
    comps: &mut LocalComponent,
) -> Result<Chapter> {
    let mut chunks = comps.store.get_chunks_by_ids(&theme.chunk_ids)?;
    chunks.truncate(opt.chunks_per_chapter);

    let results: Vec<SearchResult> = chunks.iter().map(chunk_to_result).collect();
    let context = build_context(&results, true);

    let vars: HashMap<&str, String> = [
        ("book_title", opt.book_title.clone()),
        ("detail_instruction", opt.detail_level.instruction().to_string()),
        ("chapter_number", chapter_number.to_string()),
        ("total_chapters", total_chapters.to_string()),
        ("chapter_title", theme.label.clone()),
        (
            "previous_summary",
            previous_chapter_summary
                .unwrap_or("This is the opening chapter.")
                .to_string(),
        ),
        ("context", context),
    ]
    .into_iter()
    .collect();

    let (system, user) = comps.prompts.get_prompt(CHAPTER_SYNTHESIS, &vars)?;
    let content = comps
        .llm
        .generate(&system, &user, &opt.generate_options())?;

    let citations: Vec<Citation> = chunks
        .iter()
        .map(|chunk| Citation {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            page_number: chunk.page_number,
        })
        .collect();

    Ok(Chapter {
        chapter_number,
        title: theme.label.clone(),
        word_count: content.split_whitespace().count(),
        theme_id: theme.id.clone(),
        source_chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
        citations,
        metadata: ChapterMetadata {
            detail_level: opt.detail_level,
            model: Some(comps.llm.model_name().to_string()),
            generated_with_context: !chunks.is_empty(),
        },
        content,
    })
}

/// Plan the order, then synthesize each theme into a chapter.
///
/// `progress` is invoked with `(chapters_done, total, message)` from 0 up to
/// and including `total`, so a determinate progress bar maps directly onto
/// it. The cancellation token is checked between chapters (cooperative; a
/// chapter already talking to the LLM runs to completion) and an early stop
/// returns the chapters finished so far.
pub async fn synthesize_book(
    themes: &[Theme],
    comps: &mut LocalComponent,
    opt: &SynthesisOptions,
    progress: &mut dyn FnMut(usize, usize, &str),
    cancel: &CancellationToken,
) -> Result<Vec<Chapter>> {
    if themes.is_empty() {
        progress(0, 0, "no themes to synthesize");
        return Ok(Vec::new());
    }

    let mut ordered = plan_chapters(themes, comps, opt).await;
    if let Some(max) = opt.max_chapters {
        ordered.truncate(max);
    }
    let total = ordered.len();
    progress(0, total, &format!("planned {total} chapters"));

    let mut chapters: Vec<Chapter> = Vec::with_capacity(total);
    let mut previous_summary: Option<String> = None;
    for (index, theme) in ordered.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("synthesis cancelled after {} chapters", chapters.len());
            break;
        }
        let chapter = synthesize_chapter(
            theme,
            index + 1,
            total,
            opt,
            previous_summary.as_deref(),
            comps,
        )
        .await?;
        previous_summary = Some(summarize(&chapter.content));
        progress(
            index + 1,
            total,
            &format!("finished chapter {}/{}: {}", index + 1, total, chapter.title),
        );
        chapters.push(chapter);
    }
    Ok(chapters)
}

/// Pre-synthesis outline of the planned book, one short block per theme.
pub async fn outline_book(
    themes: &[Theme],
    comps: &mut LocalComponent,
    opt: &SynthesisOptions,
) -> Result<String> {
    let vars: HashMap<&str, String> = [
        ("book_title", opt.book_title.clone()),
        ("book_objective", opt.book_objective.clone()),
        ("themes", numbered_theme_list(themes)),
    ]
    .into_iter()
    .collect();
    let (system, user) = comps.prompts.get_prompt(CHAPTER_OUTLINE, &vars)?;
    comps.llm.generate(&system, &user, &opt.generate_options())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::llm::MockLlm;
    use crate::component::operation::Chunk;
    use crate::component::PipelineConfig;
    use uuid::Uuid;

    fn theme(label: &str, chunk_ids: &[&str]) -> Theme {
        Theme {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            description: format!("about {label}"),
            chunk_ids: chunk_ids.iter().map(|s| s.to_string()).collect(),
            keywords: vec![],
            importance_score: 0.5,
        }
    }

    fn mock_component(llm: MockLlm) -> LocalComponent {
        LocalComponent::with_llm(
            Box::new(llm),
            PipelineConfig {
                embedding_dimension: 2,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn seed_chunks(comps: &LocalComponent) {
        let chunks: Vec<Chunk> = (0..3)
            .map(|i| Chunk {
                id: Chunk::make_id("doc", i),
                document_id: "doc".to_string(),
                text: format!("passage {i}"),
                chunk_index: i,
                start_char: i * 10,
                end_char: i * 10 + 9,
                page_number: Some(i as u32 + 1),
                embedding: Some(vec![i as f32, 1.0]),
            })
            .collect();
        comps.store.add_chunks(&chunks).unwrap();
    }

    #[test]
    fn test_parse_chapter_order_happy_path() {
        assert_eq!(parse_chapter_order("2\n1\n3", 3), Some(vec![1, 0, 2]));
        assert_eq!(
            parse_chapter_order("1. Theme 3\n2. Theme 1\n3. Theme 2", 3),
            Some(vec![0, 2, 1])
        );
    }

    #[test]
    fn test_parse_chapter_order_no_numbers() {
        assert_eq!(parse_chapter_order("No numbers here", 3), None);
    }

    #[test]
    fn test_parse_chapter_order_fills_missing_and_skips_out_of_range() {
        // 7 is out of range, 2 never mentioned: appended in input order
        assert_eq!(parse_chapter_order("3 then 7 then 1", 3), Some(vec![2, 0, 1]));
    }

    #[tokio::test]
    async fn test_plan_single_theme_skips_llm() {
        // a failing client proves no call happens for the trivial case
        let mut comps = mock_component(MockLlm::failing("must not be called"));
        let themes = vec![theme("Only", &[])];
        let planned = plan_chapters(&themes, &mut comps, &SynthesisOptions::default()).await;
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].label, "Only");
    }

    #[tokio::test]
    async fn test_plan_falls_back_on_unparseable_reply() {
        let mut comps = mock_component(MockLlm::always("No numbers here"));
        let themes = vec![theme("A", &[]), theme("B", &[]), theme("C", &[])];
        let planned = plan_chapters(&themes, &mut comps, &SynthesisOptions::default()).await;
        let labels: Vec<&str> = planned.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_plan_falls_back_on_llm_error() {
        let mut comps = mock_component(MockLlm::failing("timeout"));
        let themes = vec![theme("A", &[]), theme("B", &[])];
        let planned = plan_chapters(&themes, &mut comps, &SynthesisOptions::default()).await;
        assert_eq!(planned[0].label, "A");
        assert_eq!(planned[1].label, "B");
    }

    #[tokio::test]
    async fn test_plan_reorders_from_reply() {
        let mut comps = mock_component(MockLlm::always("3\n1\n2"));
        let themes = vec![theme("A", &[]), theme("B", &[]), theme("C", &[])];
        let planned = plan_chapters(&themes, &mut comps, &SynthesisOptions::default()).await;
        let labels: Vec<&str> = planned.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["C", "A", "B"]);
    }

    #[tokio::test]
    async fn test_chapter_records_citations_in_retrieval_order() {
        let mut comps = mock_component(MockLlm::always("Generated chapter prose."));
        seed_chunks(&comps);
        let theme = theme("Passages", &["doc:2", "doc:0"]);
        let chapter = synthesize_chapter(&theme, 1, 1, &SynthesisOptions::default(), None, &mut comps)
            .await
            .unwrap();
        assert_eq!(chapter.source_chunk_ids, vec!["doc:2", "doc:0"]);
        assert_eq!(chapter.citations.len(), 2);
        assert_eq!(chapter.citations[0].page_number, Some(3));
        assert_eq!(chapter.word_count, 3);
        assert!(chapter.metadata.generated_with_context);
    }

    #[tokio::test]
    async fn test_chapter_from_empty_theme_is_well_formed() {
        let mut comps = mock_component(MockLlm::always("Thin chapter."));
        let theme = theme("Empty", &[]);
        let chapter = synthesize_chapter(&theme, 2, 5, &SynthesisOptions::default(), None, &mut comps)
            .await
            .unwrap();
        assert_eq!(chapter.chapter_number, 2);
        assert_eq!(chapter.title, "Empty");
        assert!(chapter.source_chunk_ids.is_empty());
        assert!(!chapter.metadata.generated_with_context);
    }

    #[tokio::test]
    async fn test_chapter_generation_failure_propagates() {
        let mut comps = mock_component(MockLlm::failing("model crashed"));
        let theme = theme("Doomed", &[]);
        let err = synthesize_chapter(&theme, 1, 1, &SynthesisOptions::default(), None, &mut comps)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("model crashed"));
    }

    #[tokio::test]
    async fn test_book_covers_every_theme_once() {
        let mut comps = mock_component(MockLlm::always("Chapter text."));
        let themes = vec![theme("A", &[]), theme("B", &[]), theme("C", &[])];
        let cancel = CancellationToken::new();
        let chapters = synthesize_book(
            &themes,
            &mut comps,
            &SynthesisOptions::default(),
            &mut |_, _, _| {},
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(chapters.len(), 3);
        let mut theme_ids: Vec<&str> = chapters.iter().map(|c| c.theme_id.as_str()).collect();
        theme_ids.sort_unstable();
        theme_ids.dedup();
        assert_eq!(theme_ids.len(), 3, "each theme exactly once");
        for (i, chapter) in chapters.iter().enumerate() {
            assert_eq!(chapter.chapter_number, i + 1);
        }
    }

    #[tokio::test]
    async fn test_book_progress_is_monotone_and_complete() {
        let mut comps = mock_component(MockLlm::always("Chapter text."));
        let themes = vec![theme("A", &[]), theme("B", &[])];
        let mut calls: Vec<(usize, usize)> = Vec::new();
        let cancel = CancellationToken::new();
        synthesize_book(
            &themes,
            &mut comps,
            &SynthesisOptions::default(),
            &mut |current, total, _| calls.push((current, total)),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(calls.first(), Some(&(0, 2)));
        assert_eq!(calls.last(), Some(&(2, 2)));
        for pair in calls.windows(2) {
            assert!(pair[1].0 >= pair[0].0, "progress must not go backwards");
        }
    }

    #[tokio::test]
    async fn test_book_empty_themes_no_llm_calls() {
        let mut comps = mock_component(MockLlm::failing("must not be called"));
        let mut calls = Vec::new();
        let cancel = CancellationToken::new();
        let chapters = synthesize_book(
            &[],
            &mut comps,
            &SynthesisOptions::default(),
            &mut |current, total, _| calls.push((current, total)),
            &cancel,
        )
        .await
        .unwrap();
        assert!(chapters.is_empty());
        assert_eq!(calls, vec![(0, 0)]);
    }

    #[tokio::test]
    async fn test_book_respects_max_chapters() {
        let mut comps = mock_component(MockLlm::always("Chapter text."));
        let themes = vec![theme("A", &[]), theme("B", &[]), theme("C", &[])];
        let opt = SynthesisOptions {
            max_chapters: Some(2),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let chapters = synthesize_book(&themes, &mut comps, &opt, &mut |_, _, _| {}, &cancel)
            .await
            .unwrap();
        assert_eq!(chapters.len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_between_chapters() {
        let mut comps = mock_component(MockLlm::always("Chapter text."));
        let themes = vec![theme("A", &[]), theme("B", &[]), theme("C", &[])];
        let cancel = CancellationToken::new();
        let cancel_after_first = cancel.clone();
        let chapters = synthesize_book(
            &themes,
            &mut comps,
            &SynthesisOptions::default(),
            &mut |current, _, _| {
                if current == 1 {
                    cancel_after_first.cancel();
                }
            },
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(chapters.len(), 1, "stops at the next chapter boundary");
    }

    #[tokio::test]
    async fn test_outline_renders() {
        let mut comps = mock_component(MockLlm::always("- point one\n- point two"));
        let themes = vec![theme("A", &[])];
        let outline = outline_book(&themes, &mut comps, &SynthesisOptions::default())
            .await
            .unwrap();
        assert!(outline.contains("point one"));
    }
}
