//! `analyze(company)`: the whole research run behind one call.
//!
//! A completed call yields either the recommendation text or a single error
//! naming the fatal stage; no recommendation is produced from an aborted run.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::{AnalystConfig, ConfigError};
use crate::gateway::{ChatGateway, OpenAiAdapter, ProviderError, ProviderGateway, TracingUsageSink};
use crate::market::{FinancialDataProvider, FixtureDataProvider, MarketError, YahooFinanceProvider};
use crate::news::{JsonFileNewsProvider, NewsCorpusProvider, NoNewsProvider};
use crate::pipeline::{
    PipelineContext, PipelineRun, PipelineRunner, PipelineStage, RunnerConfig, StageError,
    WithPolicy,
};
use crate::stages::{
    MacroStage, NewsStage, PeerStage, RecommendationStage, TechnicalStage, RECOMMENDATION_STAGE,
};
use crate::trace::TraceSink;

/// Checked in order when no key is passed explicitly.
pub const API_KEY_ENVS: &[&str] = &["VALUATE_API_KEY", "OPENAI_API_KEY"];

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("missing API credential: pass --api-key or set VALUATE_API_KEY or OPENAI_API_KEY")]
    MissingCredential,
    #[error("company name is empty")]
    EmptyCompany,
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("gateway setup failed: {0}")]
    Gateway(#[from] ProviderError),
    #[error("market data setup failed: {0}")]
    Market(#[from] MarketError),
    #[error("run finished without a recommendation")]
    NoRecommendation,
}

#[derive(Debug)]
pub struct Recommendation {
    pub company: String,
    pub text: String,
    /// Full context and per-stage outcomes, for audit output.
    pub run: PipelineRun,
}

/// External collaborators of a run.
#[derive(Clone)]
pub struct Dependencies {
    pub gateway: Arc<dyn ChatGateway>,
    pub market: Arc<dyn FinancialDataProvider>,
    pub news: Arc<dyn NewsCorpusProvider>,
    pub trace: Option<Arc<dyn TraceSink>>,
}

impl Dependencies {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        market: Arc<dyn FinancialDataProvider>,
        news: Arc<dyn NewsCorpusProvider>,
    ) -> Self {
        Self {
            gateway,
            market,
            news,
            trace: None,
        }
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Production collaborators: OpenAI-compatible gateway with retries and
    /// usage logging, Yahoo (or fixture) market data, file-based news.
    pub fn from_config(config: &AnalystConfig, api_key: &str) -> Result<Self, AnalysisError> {
        if api_key.trim().is_empty() {
            return Err(AnalysisError::MissingCredential);
        }
        let adapter = OpenAiAdapter::with_config(
            api_key.trim(),
            config.model.base_url.as_str(),
            config.model_timeout(),
        )?;
        let gateway = ProviderGateway::with_config(
            adapter,
            Arc::new(TracingUsageSink),
            config.gateway.to_gateway_config(),
        );

        let market: Arc<dyn FinancialDataProvider> = match &config.market.fixture_dir {
            Some(dir) => Arc::new(FixtureDataProvider::new(dir.clone())),
            None => Arc::new(YahooFinanceProvider::with_base_url(
                config.market.yahoo_base_url.as_str(),
                config.model_timeout(),
            )?),
        };
        let news: Arc<dyn NewsCorpusProvider> = match &config.news.source_dir {
            Some(dir) => Arc::new(JsonFileNewsProvider::new(dir.clone())),
            None => Arc::new(NoNewsProvider),
        };

        Ok(Self::new(Arc::new(gateway), market, news))
    }
}

/// The explicit key if non-blank, else the first non-blank of [`API_KEY_ENVS`].
pub fn resolve_api_key(
    explicit: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, AnalysisError> {
    explicit
        .map(str::to_string)
        .into_iter()
        .chain(API_KEY_ENVS.iter().filter_map(|k| lookup(*k)))
        .map(|k| k.trim().to_string())
        .find(|k| !k.is_empty())
        .ok_or(AnalysisError::MissingCredential)
}

/// Stages in run order, with `[pipeline.policies]` overrides applied.
pub fn build_stages(
    company: &str,
    config: &AnalystConfig,
    deps: &Dependencies,
) -> Vec<Box<dyn PipelineStage>> {
    let model = config.model.clone();
    let stages: Vec<Box<dyn PipelineStage>> = vec![
        Box::new(PeerStage::new(
            company,
            deps.gateway.clone(),
            deps.market.clone(),
            model.clone(),
            config.peers.clone(),
        )),
        Box::new(MacroStage::new(
            company,
            deps.gateway.clone(),
            model.clone(),
            config.qa.clone(),
        )),
        Box::new(NewsStage::new(
            company,
            deps.gateway.clone(),
            deps.news.clone(),
            model.clone(),
            config.news.cache_dir.clone(),
        )),
        Box::new(TechnicalStage::new(
            company,
            deps.gateway.clone(),
            deps.market.clone(),
            model.clone(),
            config.technical.clone(),
        )),
        Box::new(RecommendationStage::new(
            company,
            deps.gateway.clone(),
            model,
            config.pipeline.context_token_budget,
        )),
    ];

    stages
        .into_iter()
        .map(|stage| {
            let default = stage.policy();
            let policy = config.pipeline.policy_for(stage.name(), default);
            if policy == default {
                stage
            } else {
                info!(stage = stage.name(), policy = policy.as_str(), "policy override");
                Box::new(WithPolicy::new(stage, policy)) as Box<dyn PipelineStage>
            }
        })
        .collect()
}

pub async fn analyze(
    company: &str,
    config: &AnalystConfig,
    deps: &Dependencies,
) -> Result<Recommendation, AnalysisError> {
    let company = company.trim();
    if company.is_empty() {
        return Err(AnalysisError::EmptyCompany);
    }

    let stages = build_stages(company, config, deps);
    let mut runner = PipelineRunner::new(RunnerConfig {
        stage_timeout: config.pipeline.stage_timeout(),
    });
    if let Some(sink) = &deps.trace {
        runner = runner.with_trace(sink.clone());
    }

    info!(company, stages = stages.len(), "analysis started");
    let mut run = match config.pipeline.run_timeout() {
        Some(deadline) => {
            runner
                .run_with_deadline(&stages, PipelineContext::new(), deadline)
                .await
        }
        None => runner.run(&stages, PipelineContext::new()).await,
    };

    if let Some(failure) = run.abort.take() {
        return Err(AnalysisError::Stage {
            stage: failure.stage,
            source: failure.error,
        });
    }
    let text = run
        .context
        .get(RECOMMENDATION_STAGE)
        .and_then(|a| a.as_text())
        .map(str::to_string)
        .ok_or(AnalysisError::NoRecommendation)?;
    info!(company, run_id = %run.run_id, "analysis finished");

    Ok(Recommendation {
        company: company.to_string(),
        text,
        run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChatRequest, ChatResponse};
    use crate::pipeline::FailurePolicy;
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl ChatGateway for Silent {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse::text(""))
        }
    }

    fn deps() -> Dependencies {
        Dependencies::new(
            Arc::new(Silent),
            Arc::new(FixtureDataProvider::new("/nonexistent")),
            Arc::new(NoNewsProvider),
        )
    }

    #[test]
    fn explicit_key_wins_over_environment() {
        let env = |k: &str| (k == "OPENAI_API_KEY").then(|| "sk-env".to_string());
        assert_eq!(resolve_api_key(Some("sk-cli"), env).unwrap(), "sk-cli");
        assert_eq!(resolve_api_key(Some("  "), env).unwrap(), "sk-env");
        assert_eq!(resolve_api_key(None, env).unwrap(), "sk-env");
        assert!(matches!(
            resolve_api_key(None, |_| None),
            Err(AnalysisError::MissingCredential)
        ));
    }

    #[test]
    fn blank_key_is_a_missing_credential() {
        let err = Dependencies::from_config(&AnalystConfig::default(), " ").err();
        assert!(matches!(err, Some(AnalysisError::MissingCredential)));
    }

    #[test]
    fn stages_run_in_declared_order_with_default_policies() {
        let stages = build_stages("ACME", &AnalystConfig::default(), &deps());
        let plan: Vec<_> = stages.iter().map(|s| (s.name(), s.policy())).collect();
        use FailurePolicy::*;
        assert_eq!(
            plan,
            vec![
                ("peers", Abort),
                ("macro", Degrade),
                ("news", Degrade),
                ("technical", Degrade),
                ("recommendation", Abort),
            ]
        );
    }

    #[test]
    fn configured_policy_overrides_apply() {
        let mut config = AnalystConfig::default();
        config.pipeline.policies.insert("news".into(), FailurePolicy::Abort);
        config.pipeline.policies.insert("peers".into(), FailurePolicy::Degrade);
        let stages = build_stages("ACME", &config, &deps());
        assert_eq!(stages[0].policy(), FailurePolicy::Degrade);
        assert_eq!(stages[2].policy(), FailurePolicy::Abort);
    }

    #[tokio::test]
    async fn blank_company_is_rejected() {
        let err = analyze("  ", &AnalystConfig::default(), &deps()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyCompany));
    }
}
