//! Knowledge-base collaborator consulted by agents before invoking the model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use super::Persona;
use crate::error::{AppError, AppResult};

/// Maximum snippets returned per query.
pub const MAX_SNIPPETS: usize = 5;

/// One retrieved piece of reference material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub source: String,
    pub content: String,
    /// Fraction of topic terms matched (0.0-1.0).
    pub relevance: f64,
}

/// Read-only knowledge lookup. An empty result is not an error.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Snippets relevant to `topic` for `persona`, most relevant first.
    async fn query(&self, persona: Persona, topic: &str) -> Vec<Snippet>;
}

/// Knowledge base that never returns anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKnowledge;

#[async_trait]
impl KnowledgeBase for NoKnowledge {
    async fn query(&self, _persona: Persona, _topic: &str) -> Vec<Snippet> {
        Vec::new()
    }
}

/// A stored knowledge entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub source: String,
    pub content: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// On-disk layout of a knowledge file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KnowledgeFile {
    #[serde(default)]
    shared: Vec<KnowledgeEntry>,
    #[serde(default)]
    personas: BTreeMap<String, Vec<KnowledgeEntry>>,
}

/// Keyword-matched knowledge base held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKnowledgeBase {
    shared: Vec<KnowledgeEntry>,
    personas: BTreeMap<Persona, Vec<KnowledgeEntry>>,
}

impl InMemoryKnowledgeBase {
    /// Create an empty knowledge base.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file of the form
    /// `{"shared": [...], "personas": {"analyst": [...]}}`.
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| AppError::Config {
            message: format!("Failed to read knowledge base {}: {}", path.display(), e),
        })?;
        Self::from_json(&raw)
    }

    /// Parse from JSON text.
    pub fn from_json(raw: &str) -> AppResult<Self> {
        let file: KnowledgeFile = serde_json::from_str(raw).map_err(|e| AppError::Config {
            message: format!("Invalid knowledge base: {}", e),
        })?;

        let mut kb = Self {
            shared: file.shared,
            personas: BTreeMap::new(),
        };
        for (name, entries) in file.personas {
            let persona = name
                .parse::<Persona>()
                .map_err(|message| AppError::Config { message })?;
            kb.personas.entry(persona).or_default().extend(entries);
        }
        Ok(kb)
    }

    /// Add an entry visible to every persona.
    pub fn with_shared(mut self, entry: KnowledgeEntry) -> Self {
        self.shared.push(entry);
        self
    }

    /// Add an entry visible to one persona.
    pub fn with_entry(mut self, persona: Persona, entry: KnowledgeEntry) -> Self {
        self.personas.entry(persona).or_default().push(entry);
        self
    }

    fn rank(&self, persona: Persona, topic: &str) -> Vec<Snippet> {
        let terms = topic_terms(topic);
        if terms.is_empty() {
            return Vec::new();
        }

        let own = self.personas.get(&persona).map(Vec::as_slice).unwrap_or(&[]);
        let mut scored: Vec<(usize, usize, &KnowledgeEntry)> = own
            .iter()
            .chain(self.shared.iter())
            .enumerate()
            .filter_map(|(order, entry)| {
                let haystack =
                    format!("{} {}", entry.content, entry.keywords.join(" ")).to_lowercase();
                let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (hits > 0).then_some((hits, order, entry))
            })
            .collect();

        // Most hits first; persona entries before shared ones on ties.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(MAX_SNIPPETS)
            .map(|(hits, _, entry)| Snippet {
                source: entry.source.clone(),
                content: entry.content.clone(),
                relevance: hits as f64 / terms.len() as f64,
            })
            .collect()
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn query(&self, persona: Persona, topic: &str) -> Vec<Snippet> {
        let snippets = self.rank(persona, topic);
        debug!(persona = %persona, results = snippets.len(), "Knowledge base queried");
        snippets
    }
}

fn topic_terms(topic: &str) -> Vec<String> {
    let mut terms: Vec<String> = topic
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(source: &str, content: &str, keywords: &[&str]) -> KnowledgeEntry {
        KnowledgeEntry {
            source: source.to_string(),
            content: content.to_string(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_no_knowledge_is_empty() {
        assert!(NoKnowledge.query(Persona::Analyst, "market").await.is_empty());
    }

    #[tokio::test]
    async fn test_query_ranks_by_term_hits() {
        let kb = InMemoryKnowledgeBase::new()
            .with_shared(entry("report", "Market X grew 12% last year", &["growth"]))
            .with_shared(entry("memo", "Hiring plan for Q3", &[]))
            .with_entry(
                Persona::Analyst,
                entry("dataset", "Costs to enter market X for new competitors", &["entry"]),
            );

        let results = kb.query(Persona::Analyst, "Should we enter market X?").await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source, "dataset");
        assert!(results[0].relevance > results[1].relevance);

        let results = kb.query(Persona::Challenger, "Should we enter market X?").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "report");
    }

    #[test]
    fn test_from_json_maps_persona_names() {
        let kb = InMemoryKnowledgeBase::from_json(
            r#"{"personas": {"creative": [{"source": "s", "content": "c"}]}}"#,
        )
        .unwrap();
        assert_eq!(kb.personas[&Persona::CreativeThinker].len(), 1);

        let err = InMemoryKnowledgeBase::from_json(r#"{"personas": {"oracle": []}}"#).unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"shared": [{"source": "wiki", "content": "pricing strategy basics"}]}"#,
        )
        .unwrap();
        let kb = InMemoryKnowledgeBase::from_file(file.path()).unwrap();
        assert_eq!(kb.rank(Persona::Strategist, "pricing").len(), 1);
        assert!(InMemoryKnowledgeBase::from_file(Path::new("/nonexistent/kb.json")).is_err());
    }
}
