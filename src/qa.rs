//! Document question-answering context.
//!
//! Builds the macro stage's context from a document corpus: chunk the pages,
//! index the chunks, ask the model for a fixed number of questions about the
//! topic, answer each question against the index, and keep the pairs in the
//! order the questions were generated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ModelSettings;
use crate::gateway::{Attribution, ChatGateway, ProviderError};
use crate::parser::{parse, TokenCountMismatch, QUESTION_DELIMITER};
use crate::prompts::{complete, QA_QUESTIONS};
use crate::retrieval::{Bm25Index, Chunk, RetrievalError, RetrievalIndex, RetrievalQa};
use crate::text_chunking::{chunk_text, ChunkingError, ChunkingParams};

/// Page separator in plain-text documents.
pub const PAGE_BREAK: char = '\u{0c}';

#[derive(Debug, Error)]
pub enum QaError {
    #[error("document corpus is empty")]
    EmptyCorpus,
    #[error("question generation failed: {0}")]
    Questions(ProviderError),
    #[error("model returned no usable questions ({requested} requested)")]
    NoQuestions { requested: usize },
    #[error("retrieval failed: {0}")]
    Retrieval(RetrievalError),
    #[error("invalid chunking: {0}")]
    Chunking(#[from] ChunkingError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl QaError {
    pub fn is_fatal(&self) -> bool {
        match self {
            QaError::Questions(e) => e.is_fatal(),
            QaError::Retrieval(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// A page of source text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub source: String,
    /// 1-based page number within `source`.
    pub page: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum QaAnswer {
    Answered(String),
    Unavailable(String),
}

impl QaAnswer {
    pub fn text(&self) -> &str {
        match self {
            QaAnswer::Answered(t) | QaAnswer::Unavailable(t) => t,
        }
    }

    pub fn is_answered(&self) -> bool {
        matches!(self, QaAnswer::Answered(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QaExchange {
    /// Position in generation order, from 0.
    pub index: usize,
    pub question: String,
    pub answer: QaAnswer,
}

#[derive(Debug, Clone, Serialize)]
pub struct QaContext {
    pub exchanges: Vec<QaExchange>,
    pub requested: usize,
    pub chunks: usize,
    #[serde(skip)]
    pub mismatch: Option<TokenCountMismatch>,
}

impl QaContext {
    /// `question\n\nanswer` pairs in generation order, joined by blank lines.
    pub fn blob(&self) -> String {
        self.exchanges
            .iter()
            .map(|e| format!("{}\n\n{}", e.question, e.answer.text()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn answered(&self) -> usize {
        self.exchanges.iter().filter(|e| e.answer.is_answered()).count()
    }
}

pub struct QaContextBuilder {
    gateway: Arc<dyn ChatGateway>,
    model: ModelSettings,
    chunking: ChunkingParams,
    top_k: usize,
    concurrency: usize,
}

impl QaContextBuilder {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: ModelSettings) -> Self {
        Self {
            gateway,
            model,
            chunking: ChunkingParams::default(),
            top_k: 4,
            concurrency: 1,
        }
    }

    pub fn chunking(mut self, params: ChunkingParams) -> Self {
        self.chunking = params;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k.max(1);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Chunk and index `corpus`, then build the context for `topic`.
    pub async fn build(
        &self,
        corpus: &[Passage],
        topic: &str,
        question_count: usize,
    ) -> Result<QaContext, QaError> {
        let chunks: Vec<Chunk> = corpus
            .iter()
            .flat_map(|p| {
                chunk_text(&p.text, &self.chunking)
                    .into_iter()
                    .map(move |c| Chunk {
                        label: format!("{} p.{}", p.source, p.page),
                        text: c.text,
                    })
            })
            .collect();
        if chunks.is_empty() {
            return Err(QaError::EmptyCorpus);
        }
        let chunk_count = chunks.len();
        info!(passages = corpus.len(), chunks = chunk_count, "indexed document corpus");

        let index = RetrievalQa::new(
            Bm25Index::build(chunks),
            self.gateway.clone(),
            self.model.clone(),
            self.top_k,
        );
        let mut ctx = self.build_with_index(&index, topic, question_count).await?;
        ctx.chunks = chunk_count;
        Ok(ctx)
    }

    /// Build the context against an existing index.
    pub async fn build_with_index(
        &self,
        index: &dyn RetrievalIndex,
        topic: &str,
        question_count: usize,
    ) -> Result<QaContext, QaError> {
        let count = question_count.to_string();
        let raw = complete(
            self.gateway.as_ref(),
            &self.model,
            &QA_QUESTIONS,
            &[("company", topic), ("count", count.as_str())],
            Attribution::new("qa::questions"),
        )
        .await
        .map_err(QaError::Questions)?;

        let parsed = parse(&raw, QUESTION_DELIMITER, Some(question_count));
        let mismatch = parsed.mismatch;
        let questions = parsed.non_empty();
        if questions.is_empty() {
            return Err(QaError::NoQuestions {
                requested: question_count,
            });
        }
        info!(
            requested = question_count,
            generated = questions.len(),
            "generated questions"
        );

        let answers: Vec<Result<QaExchange, QaError>> = stream::iter(questions.into_iter().enumerate())
            .map(|(i, question)| async move {
                let answer = match index.query(&question).await {
                    Ok(text) => QaAnswer::Answered(text),
                    Err(e) if e.is_fatal() => return Err(QaError::Retrieval(e)),
                    Err(e) => {
                        warn!(question = i, error = %e, "answer unavailable");
                        QaAnswer::Unavailable(format!("answer unavailable: {e}"))
                    }
                };
                Ok(QaExchange {
                    index: i,
                    question,
                    answer,
                })
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let exchanges = answers.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(QaContext {
            exchanges,
            requested: question_count,
            chunks: 0,
            mismatch,
        })
    }
}

// =============================================================================
// Corpus loading
// =============================================================================

/// Page text with newlines folded to spaces.
fn clean_page(text: &str) -> String {
    text.replace(['\r', '\n'], " ").trim().to_string()
}

/// Split a plain-text document into pages on form feeds, dropping blank pages.
pub fn pages_from_text(source: &str, text: &str) -> Vec<Passage> {
    text.split(PAGE_BREAK)
        .enumerate()
        .filter_map(|(i, page)| {
            let text = clean_page(page);
            (!text.is_empty()).then(|| Passage {
                source: source.to_string(),
                page: i + 1,
                text,
            })
        })
        .collect()
}

/// Expand glob patterns to files; plain paths are kept as given.
pub fn expand_globs(patterns: &[String]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for pattern in patterns {
        if pattern.contains('*') || pattern.contains('?') || pattern.contains('[') {
            match glob::glob(pattern) {
                Ok(entries) => {
                    for entry in entries {
                        match entry {
                            Ok(path) if path.is_file() => paths.push(path),
                            Ok(_) => {}
                            Err(e) => warn!(pattern = %pattern, error = %e, "glob error"),
                        }
                    }
                }
                Err(e) => warn!(pattern = %pattern, error = %e, "invalid glob pattern"),
            }
        } else {
            paths.push(PathBuf::from(pattern));
        }
    }
    paths
}

pub async fn load_document(path: &Path) -> Result<Vec<Passage>, QaError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| QaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(pages_from_text(&path.display().to_string(), &text))
}

/// Load every document matched by `patterns`, in pattern order.
pub async fn load_corpus(patterns: &[String]) -> Result<Vec<Passage>, QaError> {
    let mut passages = Vec::new();
    for path in expand_globs(patterns) {
        passages.extend(load_document(&path).await?);
    }
    Ok(passages)
}
