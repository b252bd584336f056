//! Staged pipeline runner.
//!
//! Stages run one at a time in declared order. Each stage carries a
//! [`FailurePolicy`]: a failing `Degrade` stage leaves an
//! [`Artifact::Unavailable`] placeholder under its name and the run continues;
//! a failing `Abort` stage ends the run and no later stage executes.
//! Credential failures always abort.
//!
//! The [`PipelineContext`] is append-only and written only by the runner,
//! between stage awaits. Stages read it through a shared reference.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::gateway::ProviderError;
use crate::market::MarketError;
use crate::news::NewsError;
use crate::qa::QaError;
use crate::trace::{now_epoch_ms, StageTrace, TraceSink};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Abort,
    Degrade,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Abort => "abort",
            FailurePolicy::Degrade => "degrade",
        }
    }
}

/// Output of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    Text { text: String },
    Structured { value: Value },
    Unavailable { reason: String },
}

impl Artifact {
    pub fn text(text: impl Into<String>) -> Self {
        Artifact::Text { text: text.into() }
    }

    pub fn structured(value: Value) -> Self {
        Artifact::Structured { value }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Artifact::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Text { .. } => "text",
            Artifact::Structured { .. } => "structured",
            Artifact::Unavailable { .. } => "unavailable",
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Artifact::Unavailable { .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Artifact::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Artifact::Structured { value } => Some(value),
            _ => None,
        }
    }

    /// Plain-text rendering used when artifacts are combined into a prompt.
    pub fn render(&self) -> String {
        match self {
            Artifact::Text { text } => text.clone(),
            Artifact::Structured { value } => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
            Artifact::Unavailable { reason } => format!("Data Unavailable ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context already holds an artifact for '{0}'")]
    DuplicateKey(String),
}

/// Append-only, insertion-ordered map from stage name to artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineContext {
    entries: Vec<(String, Artifact)>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, artifact: Artifact) -> Result<(), ContextError> {
        let key = key.into();
        if self.contains(&key) {
            return Err(ContextError::DuplicateKey(key));
        }
        self.entries.push((key, artifact));
        Ok(())
    }

    pub fn with(mut self, key: impl Into<String>, artifact: Artifact) -> Result<Self, ContextError> {
        self.insert(key, artifact)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&Artifact> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, a)| a)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Artifact)> {
        self.entries.iter().map(|(k, a)| (k.as_str(), a))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Text of a required upstream artifact.
    pub fn require_text(&self, key: &str) -> Result<&str, StageError> {
        self.get(key)
            .and_then(Artifact::as_text)
            .ok_or_else(|| StageError::MissingInput(key.to_string()))
    }
}

impl Serialize for PipelineContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Credential missing or rejected; aborts regardless of policy.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("provider error: {0}")]
    Provider(ProviderError),
    #[error("market data error: {0}")]
    Market(#[from] MarketError),
    #[error("news error: {0}")]
    News(#[from] NewsError),
    #[error("document Q&A error: {0}")]
    Qa(QaError),
    #[error("missing upstream artifact '{0}'")]
    MissingInput(String),
    #[error("stage timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("{0}")]
    Failed(String),
}

impl From<ProviderError> for StageError {
    fn from(err: ProviderError) -> Self {
        if err.is_fatal() {
            StageError::Unauthorized(err.to_string())
        } else {
            StageError::Provider(err)
        }
    }
}

impl From<QaError> for StageError {
    fn from(err: QaError) -> Self {
        if err.is_fatal() {
            StageError::Unauthorized(err.to_string())
        } else {
            StageError::Qa(err)
        }
    }
}

impl StageError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Unauthorized(_) | StageError::Context(_))
    }
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Context key the artifact is stored under.
    fn name(&self) -> &str;
    fn policy(&self) -> FailurePolicy;
    async fn run(&self, ctx: &PipelineContext) -> Result<Artifact, StageError>;
}

/// Replaces the policy of a wrapped stage.
pub struct WithPolicy {
    inner: Box<dyn PipelineStage>,
    policy: FailurePolicy,
}

impl WithPolicy {
    pub fn new(inner: Box<dyn PipelineStage>, policy: FailurePolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl PipelineStage for WithPolicy {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn policy(&self) -> FailurePolicy {
        self.policy
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<Artifact, StageError> {
        self.inner.run(ctx).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    Degraded,
    Aborted,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Succeeded => "succeeded",
            StageStatus::Degraded => "degraded",
            StageStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: String,
    pub policy: FailurePolicy,
    pub status: StageStatus,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// The stage that ended a run and why.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: String,
    pub error: StageError,
}

#[derive(Debug)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub context: PipelineContext,
    pub outcomes: Vec<StageOutcome>,
    pub abort: Option<StageFailure>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage '{stage}' aborted the run: {source}")]
    StageAborted {
        stage: String,
        #[source]
        source: StageError,
    },
}

impl PipelineRun {
    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }

    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage == stage)
    }

    pub fn into_result(self) -> Result<PipelineContext, PipelineError> {
        match self.abort {
            Some(StageFailure { stage, error }) => Err(PipelineError::StageAborted {
                stage,
                source: error,
            }),
            None => Ok(self.context),
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub stage_timeout: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct PipelineRunner {
    config: RunnerConfig,
    trace: Option<Arc<dyn TraceSink>>,
}

impl PipelineRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            trace: None,
        }
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    pub async fn run(
        &self,
        stages: &[Box<dyn PipelineStage>],
        initial: PipelineContext,
    ) -> PipelineRun {
        self.run_inner(stages, initial, None).await
    }

    /// Like [`run`](Self::run), bounded by a caller-level deadline. When it
    /// expires the executing stage is aborted with [`StageError::Timeout`],
    /// whatever its policy.
    pub async fn run_with_deadline(
        &self,
        stages: &[Box<dyn PipelineStage>],
        initial: PipelineContext,
        deadline: Duration,
    ) -> PipelineRun {
        let at = tokio::time::Instant::now() + deadline;
        self.run_inner(stages, initial, Some((at, deadline))).await
    }

    async fn run_inner(
        &self,
        stages: &[Box<dyn PipelineStage>],
        initial: PipelineContext,
        deadline: Option<(tokio::time::Instant, Duration)>,
    ) -> PipelineRun {
        let mut run = PipelineRun {
            run_id: Uuid::new_v4(),
            context: initial,
            outcomes: Vec::with_capacity(stages.len()),
            abort: None,
        };

        for (index, stage) in stages.iter().enumerate() {
            let name = stage.name().to_string();
            let policy = stage.policy();
            info!(stage = %name, policy = policy.as_str(), "stage started");
            let start = Instant::now();

            let result = if run.context.contains(&name) {
                Err(Execution::Failed(StageError::from(ContextError::DuplicateKey(
                    name.clone(),
                ))))
            } else {
                self.execute(stage.as_ref(), &run.context, deadline).await
            };
            let elapsed_ms = start.elapsed().as_millis() as u64;

            let (result, deadline_hit) = match result {
                Ok(artifact) => match run.context.insert(name.clone(), artifact.clone()) {
                    Ok(()) => (Ok(artifact), false),
                    Err(e) => (Err(StageError::from(e)), false),
                },
                Err(Execution::Failed(e)) => (Err(e), false),
                Err(Execution::Deadline(d)) => (Err(StageError::Timeout(d)), true),
            };

            let status = match &result {
                Ok(_) => StageStatus::Succeeded,
                Err(e) if deadline_hit || e.is_fatal() || policy == FailurePolicy::Abort => {
                    StageStatus::Aborted
                }
                Err(_) => StageStatus::Degraded,
            };

            let artifact_kind = result.as_ref().ok().map(Artifact::kind);
            let artifact_chars = result.as_ref().ok().map(|a| a.render().chars().count());
            let error_text = result.as_ref().err().map(|e| e.to_string());

            match result {
                Ok(artifact) => {
                    if artifact.is_unavailable() {
                        warn!(stage = %name, elapsed_ms, "stage produced no data");
                    } else {
                        info!(stage = %name, elapsed_ms, "stage succeeded");
                    }
                }
                Err(e) if status == StageStatus::Degraded => {
                    warn!(stage = %name, elapsed_ms, error = %e, "stage degraded");
                    let reason = e.to_string();
                    // Absence of `name` was checked before execute.
                    if let Err(e) = run.context.insert(name.clone(), Artifact::unavailable(reason)) {
                        error!(stage = %name, error = %e, "placeholder insert failed");
                    }
                }
                Err(e) => {
                    error!(stage = %name, elapsed_ms, error = %e, "stage aborted the run");
                    run.abort = Some(StageFailure {
                        stage: name.clone(),
                        error: e,
                    });
                }
            }

            self.record_trace(StageTrace {
                timestamp_ms: now_epoch_ms(),
                run_id: run.run_id,
                stage_index: index,
                stage: name.clone(),
                policy: policy.as_str(),
                status: status.as_str(),
                elapsed_ms,
                artifact_kind: if status == StageStatus::Degraded {
                    Some("unavailable")
                } else {
                    artifact_kind
                },
                artifact_chars,
                error: error_text.clone(),
            });
            run.outcomes.push(StageOutcome {
                stage: name,
                policy,
                status,
                elapsed_ms,
                error: error_text,
            });

            if status == StageStatus::Aborted {
                break;
            }
        }

        run
    }

    async fn execute(
        &self,
        stage: &dyn PipelineStage,
        ctx: &PipelineContext,
        deadline: Option<(tokio::time::Instant, Duration)>,
    ) -> Result<Artifact, Execution> {
        let stage_deadline = self
            .config
            .stage_timeout
            .map(|t| (tokio::time::Instant::now() + t, t));

        // Whichever bound is earlier wins; the run deadline takes precedence on a tie.
        let bound = match (stage_deadline, deadline) {
            (Some(s), Some(d)) if s.0 < d.0 => Some((s, false)),
            (_, Some(d)) => Some((d, true)),
            (Some(s), None) => Some((s, false)),
            (None, None) => None,
        };

        match bound {
            None => stage.run(ctx).await.map_err(Execution::Failed),
            Some(((at, limit), is_run_deadline)) => {
                match tokio::time::timeout_at(at, stage.run(ctx)).await {
                    Ok(result) => result.map_err(Execution::Failed),
                    Err(_) if is_run_deadline => Err(Execution::Deadline(limit)),
                    Err(_) => Err(Execution::Failed(StageError::Timeout(limit))),
                }
            }
        }
    }

    fn record_trace(&self, event: StageTrace) {
        if let Some(sink) = &self.trace {
            if let Err(e) = sink.record(event) {
                warn!(error = %e, "failed to record stage trace");
            }
        }
    }
}

enum Execution {
    Failed(StageError),
    Deadline(Duration),
}

// =============================================================================
// TESTS
// =============================================================================
