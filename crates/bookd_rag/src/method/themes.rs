//! Theme discovery: cluster the stored chunk embeddings, then ask the LLM
//! to name each cluster.
//!
//! Labeling is cosmetic, so a failed label call degrades that one cluster
//! to a deterministic default name instead of aborting discovery. Every
//! stored chunk ends up in exactly one theme.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::component::operation::Theme;
use crate::component::prompt::THEME_LABELING;
use crate::component::LocalComponent;

use super::cluster::{cluster_embeddings, cosine_to_centroid};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeOptions {
    /// Upper bound on discovered themes; clamped to the chunk count.
    pub n_themes: usize,
    /// Representative passages shown to the LLM per cluster.
    pub samples_per_theme: usize,
    pub keywords_per_theme: usize,
}

impl Default for ThemeOptions {
    fn default() -> Self {
        Self {
            n_themes: 6,
            samples_per_theme: 3,
            keywords_per_theme: 5,
        }
    }
}

const SAMPLE_CHARS: usize = 300;

fn truncate_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

/// Most frequent words of the cluster, ties broken alphabetically. Short
/// words are skipped, which drops most stopwords without a word list.
fn extract_keywords(texts: &[&str], n: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 4)
        {
            *counts.entry(word.to_lowercase()).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(word, _)| word).collect()
}

/// Parse the two-line labeling reply. `None` when the model ignored the
/// format badly enough that nothing usable remains.
fn parse_label_response(response: &str) -> Option<(String, String)> {
    let mut label = None;
    let mut description = None;
    for line in response.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let lower = line.to_lowercase();
        if lower.starts_with("label:") {
            label = Some(line["label:".len()..].trim().to_string());
        } else if lower.starts_with("description:") {
            description = Some(line["description:".len()..].trim().to_string());
        } else if label.is_none() && line.split_whitespace().count() <= 8 {
            // tolerate a bare short title on the first line
            label = Some(line.to_string());
        }
    }
    let label = label.filter(|l| !l.is_empty())?;
    Some((label, description.unwrap_or_default()))
}

fn label_cluster(
    comps: &mut LocalComponent,
    samples: &[String],
    fallback_label: &str,
    keywords: &[String],
) -> (String, String) {
    let vars: HashMap<&str, String> =
        [("samples", samples.join("\n---\n"))].into_iter().collect();
    let labeled = comps
        .prompts
        .get_prompt(THEME_LABELING, &vars)
        .and_then(|(system, user)| {
            comps
                .llm
                .generate(&system, &user, &Default::default())
        });
    match labeled {
        Ok(response) => match parse_label_response(&response) {
            Some((label, description)) => (label, description),
            None => {
                warn!("unparseable label response for {fallback_label}, using default");
                (fallback_label.to_string(), keywords.join(", "))
            }
        },
        Err(err) => {
            // a missing label must not sink the whole discovery run
            warn!("labeling {fallback_label} failed: {err:#}");
            (fallback_label.to_string(), keywords.join(", "))
        }
    }
}

/// Group every stored chunk into at most `n_themes` labeled themes,
/// ordered by importance. An empty store discovers nothing.
pub async fn discover_themes(
    comps: &mut LocalComponent,
    opt: &ThemeOptions,
) -> Result<Vec<Theme>> {
    let chunks = comps.store.get_all_chunks()?;
    if chunks.is_empty() {
        return Ok(Vec::new());
    }

    let embeddings: Vec<Vec<f32>> = chunks
        .iter()
        .map(|chunk| {
            chunk
                .embedding
                .clone()
                .ok_or_else(|| anyhow!("stored chunk {} has no embedding", chunk.id))
        })
        .collect::<Result<_>>()?;

    let clustering = cluster_embeddings(&embeddings, opt.n_themes.max(1))?;
    let members = clustering.members();
    let total_chunks = chunks.len();

    let mut themes = Vec::new();
    for (cluster_index, member_indices) in members.iter().enumerate() {
        if member_indices.is_empty() {
            continue;
        }
        let centroid = clustering.centroids.row(cluster_index).to_vec();

        let member_texts: Vec<&str> = member_indices
            .iter()
            .map(|&i| chunks[i].text.as_str())
            .collect();
        let keywords = extract_keywords(&member_texts, opt.keywords_per_theme);

        let mut by_centrality: Vec<&usize> = member_indices.iter().collect();
        by_centrality.sort_by(|&&a, &&b| {
            cosine_to_centroid(&embeddings[b], &centroid)
                .total_cmp(&cosine_to_centroid(&embeddings[a], &centroid))
                .then(a.cmp(&b))
        });
        let samples: Vec<String> = by_centrality
            .iter()
            .take(opt.samples_per_theme.max(1))
            .map(|&&i| truncate_chars(&chunks[i].text, SAMPLE_CHARS))
            .collect();

        let fallback_label = format!("Theme {}", themes.len() + 1);
        let (label, description) = label_cluster(comps, &samples, &fallback_label, &keywords);

        themes.push(Theme {
            id: Uuid::new_v4().to_string(),
            label,
            description,
            chunk_ids: member_indices.iter().map(|&i| chunks[i].id.clone()).collect(),
            keywords,
            importance_score: member_indices.len() as f32 / total_chunks as f32,
        });
    }

    themes.sort_by(|a, b| b.importance_score.total_cmp(&a.importance_score));
    info!("discovered {} themes over {} chunks", themes.len(), total_chunks);
    Ok(themes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::llm::MockLlm;
    use crate::component::operation::Chunk;
    use crate::component::PipelineConfig;

    fn component_with(llm: MockLlm, dimension: usize) -> LocalComponent {
        let config = PipelineConfig {
            embedding_dimension: dimension,
            ..Default::default()
        };
        LocalComponent::with_llm(Box::new(llm), config).unwrap()
    }

    fn chunk(doc: &str, index: usize, text: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: Chunk::make_id(doc, index),
            document_id: doc.to_string(),
            text: text.to_string(),
            chunk_index: index,
            start_char: 0,
            end_char: text.len(),
            page_number: None,
            embedding: Some(embedding),
        }
    }

    fn seed_two_topics(comps: &LocalComponent) {
        comps
            .store
            .add_chunks(&[
                chunk("d", 0, "rockets burn fuel to reach orbit", vec![1.0, 0.0]),
                chunk("d", 1, "orbital launches need rockets", vec![0.95, 0.05]),
                chunk("d", 2, "sourdough bread needs long proofing", vec![0.0, 1.0]),
                chunk("d", 3, "proofing dough overnight improves bread", vec![0.05, 0.95]),
            ])
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_store_discovers_nothing() {
        let mut comps = component_with(MockLlm::always("irrelevant"), 2);
        let themes = discover_themes(&mut comps, &ThemeOptions::default())
            .await
            .unwrap();
        assert!(themes.is_empty());
    }

    #[tokio::test]
    async fn test_every_chunk_assigned_exactly_once() {
        let mut comps = component_with(
            MockLlm::always("Label: Some Theme\nDescription: A theme."),
            2,
        );
        seed_two_topics(&comps);
        let opt = ThemeOptions {
            n_themes: 2,
            ..Default::default()
        };
        let themes = discover_themes(&mut comps, &opt).await.unwrap();
        assert_eq!(themes.len(), 2);

        let mut all_ids: Vec<String> = themes.iter().flat_map(|t| t.chunk_ids.clone()).collect();
        all_ids.sort();
        assert_eq!(all_ids.len(), 4);
        all_ids.dedup();
        assert_eq!(all_ids.len(), 4, "no chunk may appear in two themes");

        let total_importance: f32 = themes.iter().map(|t| t.importance_score).sum();
        assert!((total_importance - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_llm_labels_applied() {
        let mut comps = component_with(
            MockLlm::with_responses(&[
                "Label: Rocketry\nDescription: Launch vehicles and orbits.",
                "Label: Baking\nDescription: Bread and fermentation.",
            ]),
            2,
        );
        seed_two_topics(&comps);
        let opt = ThemeOptions {
            n_themes: 2,
            ..Default::default()
        };
        let themes = discover_themes(&mut comps, &opt).await.unwrap();
        let labels: Vec<&str> = themes.iter().map(|t| t.label.as_str()).collect();
        assert!(labels.contains(&"Rocketry") || labels.contains(&"Baking"));
        for theme in &themes {
            assert!(!theme.description.is_empty());
            assert!(!theme.keywords.is_empty());
        }
    }

    #[tokio::test]
    async fn test_label_failure_degrades_to_default() {
        let mut comps = component_with(MockLlm::failing("model not found"), 2);
        seed_two_topics(&comps);
        let opt = ThemeOptions {
            n_themes: 2,
            ..Default::default()
        };
        let themes = discover_themes(&mut comps, &opt).await.unwrap();
        assert_eq!(themes.len(), 2, "discovery must survive label failures");
        for theme in &themes {
            assert!(theme.label.starts_with("Theme "));
            assert!(!theme.chunk_ids.is_empty());
        }
    }

    #[test]
    fn test_parse_label_response_variants() {
        let parsed =
            parse_label_response("Label: Deep Sea Mining\nDescription: Extraction underwater.")
                .unwrap();
        assert_eq!(parsed.0, "Deep Sea Mining");
        assert_eq!(parsed.1, "Extraction underwater.");

        let bare = parse_label_response("Ocean Currents").unwrap();
        assert_eq!(bare.0, "Ocean Currents");
        assert!(bare.1.is_empty());

        assert!(parse_label_response("").is_none());
    }

    #[test]
    fn test_extract_keywords_ranks_by_frequency() {
        let keywords = extract_keywords(
            &["rockets rockets rockets launch", "launch rockets engines"],
            2,
        );
        assert_eq!(keywords[0], "rockets");
        assert_eq!(keywords[1], "launch");
    }
}
