//! Named prompt templates for every LLM call the pipeline makes.
//!
//! Templates are (system, user) pairs with `{variable}` placeholders. A
//! missing template name or an unbound variable is a caller bug and raises
//! immediately rather than producing a half-rendered prompt.

use std::collections::HashMap;

use anyhow::Result;

use crate::error::PipelineError;

#[derive(Debug, Clone)]
struct PromptTemplate {
    system: &'static str,
    user: &'static str,
}

#[derive(Debug, Clone)]
pub struct PromptManager {
    templates: HashMap<&'static str, PromptTemplate>,
}

pub const RAG_QUERY: &str = "rag_query";
pub const THEME_LABELING: &str = "theme_labeling";
pub const CHAPTER_SYNTHESIS: &str = "chapter_synthesis";
pub const CHAPTER_OUTLINE: &str = "chapter_outline";
pub const CHAPTER_SEQUENCING: &str = "chapter_sequencing";

impl Default for PromptManager {
    fn default() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            RAG_QUERY,
            PromptTemplate {
                system: "You answer questions strictly from the provided context. \
                         If the context does not contain the answer, say so.",
                user: "Context:\n{context}\n\nQuestion: {question}",
            },
        );
        templates.insert(
            THEME_LABELING,
            PromptTemplate {
                system: "You name thematic groups of text passages. Reply with exactly \
                         two lines:\nLabel: <at most six words>\nDescription: <one sentence>",
                user: "These passages were grouped together by similarity:\n\n{samples}\n\n\
                       Name the theme they share.",
            },
        );
        templates.insert(
            CHAPTER_SYNTHESIS,
            PromptTemplate {
                system: "You are writing one chapter of the book '{book_title}'. \
                         Base the chapter on the source passages only, keep a narrative \
                         tone, and do not invent facts. {detail_instruction}",
                user: "Chapter {chapter_number} of {total_chapters}: {chapter_title}\n\n\
                       Summary of the previous chapter:\n{previous_summary}\n\n\
                       Source passages:\n{context}\n\n\
                       Write the chapter.",
            },
        );
        templates.insert(
            CHAPTER_OUTLINE,
            PromptTemplate {
                system: "You outline book chapters before they are written.",
                user: "Book: {book_title}\nObjective: {book_objective}\n\
                       Chapter themes, in order:\n{themes}\n\n\
                       Produce a short outline (three to five bullet points) per chapter.",
            },
        );
        templates.insert(
            CHAPTER_SEQUENCING,
            PromptTemplate {
                system: "You order book chapters into the sequence that reads best. \
                         Reply with a numbered list of the theme numbers in your \
                         proposed order, one per line, nothing else.",
                user: "Book: {book_title}\nObjective: {book_objective}\n\n\
                       Candidate themes:\n{themes}\n\n\
                       Propose the chapter order.",
            },
        );
        Self { templates }
    }
}

/// Substitute `{placeholder}`s by scanning the template, never the values,
/// so braces inside substituted document text cannot confuse the renderer.
fn render(template: &str, name: &str, vars: &HashMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push('{');
            rest = after;
            continue;
        };
        let key = &after[..end];
        match vars.get(key) {
            Some(value) => out.push_str(value),
            None => {
                return Err(PipelineError::MissingTemplateVariable {
                    template: name.to_string(),
                    name: key.to_string(),
                }
                .into())
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

impl PromptManager {
    /// Render the named template, returning the (system, user) prompt pair.
    pub fn get_prompt(
        &self,
        name: &str,
        vars: &HashMap<&str, String>,
    ) -> Result<(String, String)> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| PipelineError::MissingTemplate {
                name: name.to_string(),
            })?;
        let system = render(template.system, name, vars)?;
        let user = render(template.user, name, vars)?;
        Ok((system, user))
    }

    pub fn template_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.templates.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_render_rag_query() {
        let manager = PromptManager::default();
        let (system, user) = manager
            .get_prompt(
                RAG_QUERY,
                &vars(&[("context", "Paris is in France."), ("question", "Where is Paris?")]),
            )
            .unwrap();
        assert!(system.contains("provided context"));
        assert!(user.contains("Paris is in France."));
        assert!(user.contains("Where is Paris?"));
    }

    #[test]
    fn test_missing_template_is_an_error() {
        let manager = PromptManager::default();
        let err = manager.get_prompt("no_such_template", &vars(&[])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingTemplate { .. })
        ));
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        let manager = PromptManager::default();
        let err = manager
            .get_prompt(RAG_QUERY, &vars(&[("context", "something")]))
            .unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::MissingTemplateVariable { name, .. }) => {
                assert_eq!(name, "question");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_all_named_templates_registered() {
        let manager = PromptManager::default();
        let names = manager.template_names();
        for expected in [
            CHAPTER_OUTLINE,
            CHAPTER_SEQUENCING,
            CHAPTER_SYNTHESIS,
            RAG_QUERY,
            THEME_LABELING,
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }
}
