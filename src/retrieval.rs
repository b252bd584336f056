//! Lexical retrieval over document chunks and retrieval-augmented answering.
//!
//! [`Bm25Index`] ranks chunks with Okapi BM25 over lowercase word tokens.
//! [`RetrievalQa`] stuffs the top-k chunks into a single QA prompt.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::config::ModelSettings;
use crate::gateway::{Attribution, ChatGateway, ProviderError};
use crate::prompts::{complete, QA_ANSWER};

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("Invalid word regex"));

const K1: f64 = 1.2;
const B: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "has",
    "have", "how", "in", "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was",
    "what", "when", "which", "will", "with", "would",
];

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("retrieval index is empty")]
    EmptyIndex,
    #[error("no passages matched the question")]
    NoMatches,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl RetrievalError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RetrievalError::Provider(e) if e.is_fatal())
    }
}

/// Answers one question from an indexed corpus.
#[async_trait]
pub trait RetrievalIndex: Send + Sync {
    async fn query(&self, question: &str) -> Result<String, RetrievalError>;
}

/// A unit of indexed text with a human-readable origin label.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredChunk {
    pub index: usize,
    pub score: f64,
}

pub fn tokenize(text: &str) -> Vec<String> {
    WORD.find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

#[derive(Debug, Clone)]
struct IndexedChunk {
    chunk: Chunk,
    term_freq: HashMap<String, u32>,
    len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Bm25Index {
    docs: Vec<IndexedChunk>,
    doc_freq: HashMap<String, usize>,
    avg_len: f64,
}

impl Bm25Index {
    pub fn build(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        let mut docs = Vec::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for chunk in chunks {
            let tokens = tokenize(&chunk.text);
            let mut term_freq: HashMap<String, u32> = HashMap::new();
            for t in &tokens {
                *term_freq.entry(t.clone()).or_default() += 1;
            }
            for t in term_freq.keys() {
                *doc_freq.entry(t.clone()).or_default() += 1;
            }
            docs.push(IndexedChunk {
                chunk,
                term_freq,
                len: tokens.len(),
            });
        }
        let avg_len = if docs.is_empty() {
            0.0
        } else {
            docs.iter().map(|d| d.len).sum::<usize>() as f64 / docs.len() as f64
        };
        Self {
            docs,
            doc_freq,
            avg_len,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.docs.get(index).map(|d| &d.chunk)
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Top `k` chunks with a positive score, best first; ties keep corpus order.
    pub fn search(&self, query: &str, k: usize) -> Vec<ScoredChunk> {
        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }
        let avg_len = self.avg_len.max(1.0);

        let mut scored: Vec<ScoredChunk> = self
            .docs
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let score = terms
                    .iter()
                    .filter_map(|t| doc.term_freq.get(t).map(|tf| (t, *tf as f64)))
                    .map(|(t, tf)| {
                        let norm = K1 * (1.0 - B + B * doc.len as f64 / avg_len);
                        self.idf(t) * tf * (K1 + 1.0) / (tf + norm)
                    })
                    .sum::<f64>();
                ScoredChunk { index, score }
            })
            .filter(|s| s.score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
        scored.truncate(k);
        scored
    }
}

/// Retrieval-augmented QA: BM25 top-k chunks + one model call per question.
pub struct RetrievalQa {
    index: Bm25Index,
    gateway: Arc<dyn ChatGateway>,
    model: ModelSettings,
    top_k: usize,
}

impl RetrievalQa {
    pub fn new(
        index: Bm25Index,
        gateway: Arc<dyn ChatGateway>,
        model: ModelSettings,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            gateway,
            model,
            top_k: top_k.max(1),
        }
    }

    pub fn index(&self) -> &Bm25Index {
        &self.index
    }
}

#[async_trait]
impl RetrievalIndex for RetrievalQa {
    async fn query(&self, question: &str) -> Result<String, RetrievalError> {
        if self.index.is_empty() {
            return Err(RetrievalError::EmptyIndex);
        }
        let hits = self.index.search(question, self.top_k);
        if hits.is_empty() {
            return Err(RetrievalError::NoMatches);
        }
        let context = hits
            .iter()
            .filter_map(|h| self.index.chunk(h.index))
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        debug!(
            hits = hits.len(),
            context_chars = context.len(),
            "retrieved passages"
        );

        let answer = complete(
            self.gateway.as_ref(),
            &self.model,
            &QA_ANSWER,
            &[("context", context.as_str()), ("question", question)],
            Attribution::new("qa::answer"),
        )
        .await?;
        Ok(answer.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> Chunk {
        Chunk {
            label: "doc".into(),
            text: text.into(),
        }
    }

    fn index() -> Bm25Index {
        Bm25Index::build(vec![
            chunk("Inflation eased to 3 percent as energy prices fell."),
            chunk("Consumer spending on durable goods slowed in the third quarter."),
            chunk("The Federal Reserve held interest rates steady; inflation expectations anchored."),
        ])
    }

    #[test]
    fn tokenize_lowercases_and_drops_stopwords() {
        assert_eq!(tokenize("What is the Rate of Inflation?"), vec!["rate", "inflation"]);
    }

    #[test]
    fn search_ranks_matching_chunks() {
        let idx = index();
        let hits = idx.search("interest rates", 2);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index, 2);

        let hits = idx.search("inflation", 5);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.index == 0 || h.index == 2));
    }

    #[test]
    fn search_without_overlap_is_empty() {
        assert!(index().search("semiconductor tariffs", 3).is_empty());
        assert!(Bm25Index::default().search("inflation", 3).is_empty());
    }

    #[test]
    fn fatal_provider_errors_are_flagged() {
        let err = RetrievalError::from(ProviderError::config("missing key"));
        assert!(err.is_fatal());
        assert!(!RetrievalError::NoMatches.is_fatal());
    }
}
