#![forbid(unsafe_code)]

//! # valuate
//!
//! Automated equity research through a staged language-model pipeline.
//!
//! A run asks the model for industry peers and relevance weights, has it
//! compute financial ratios per peer from fetched statements, reconciles those
//! free-text numbers into weighted industry averages, builds a question/answer
//! context over a macroeconomic document corpus, summarizes recent news and
//! technical indicators, and finally asks for an investment recommendation
//! over everything gathered.
//!
//! Model output is never trusted to follow its format: [`parser`] reports
//! count mismatches as values, [`reconcile`] excludes what it cannot parse,
//! and [`pipeline`] decides per stage whether a failure aborts the run or
//! leaves an explicit "unavailable" placeholder.

pub mod analyst;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod indicators;
pub mod market;
pub mod news;
pub mod parser;
pub mod pipeline;
pub mod prompts;
pub mod qa;
pub mod reconcile;
pub mod retrieval;
pub mod stages;
pub mod text_chunking;
pub mod trace;

pub use analyst::{analyze, AnalysisError, Dependencies, Recommendation};
pub use cache::{CachedGateway, CompletionCache, SqliteCompletionCache};
pub use config::AnalystConfig;
pub use gateway::{Attribution, ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use parser::{parse, to_number, ParsedTokens, TokenCountMismatch};
pub use pipeline::{
    Artifact, FailurePolicy, PipelineContext, PipelineRun, PipelineRunner, PipelineStage,
    StageError, StageOutcome, StageStatus,
};
pub use qa::{QaContext, QaContextBuilder, QaExchange};
pub use reconcile::{reconcile, AggregateResult, Entity, MetricAggregate};
pub use retrieval::{Bm25Index, RetrievalIndex};
pub use trace::{JsonlTraceSink, StageTrace, TraceError, TraceSink, TraceWorker};
