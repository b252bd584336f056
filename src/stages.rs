//! The analysis stages of an equity research run.
//!
//! Each stage owns its collaborators (gateway, data providers, settings) and
//! reads upstream results only through the [`PipelineContext`] it is handed.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::{ModelSettings, PeerSettings, QaSettings, TechnicalSettings};
use crate::gateway::{Attribution, ChatGateway};
use crate::indicators::{fmt_value, IndicatorSnapshot};
use crate::market::{normalize_ticker, FinancialDataProvider, MarketError};
use crate::news::{cache_path, read_contents, write_cache, NewsCorpusProvider, NewsError};
use crate::parser::{parse, parse_words, RATIO_DELIMITER};
use crate::pipeline::{Artifact, FailurePolicy, PipelineContext, PipelineStage, StageError};
use crate::prompts::{
    complete, MACRO_ANALYSIS, NEWS_DISTILL, NEWS_INSIGHT, PEER_RATIO_NAMES, PEER_RATIO_VALUES,
    PEER_TICKERS, PEER_WEIGHTS, RECOMMENDATION, TECHNICAL_ANALYSIS,
};
use crate::qa::{load_corpus, QaContextBuilder, QaError};
use crate::reconcile::{reconcile, Entity};
use crate::text_chunking::truncate_to_tokens;

pub const PEERS: &str = "peers";
pub const MACRO: &str = "macro";
pub const NEWS: &str = "news";
pub const TECHNICAL: &str = "technical";
pub const RECOMMENDATION_STAGE: &str = "recommendation";

/// Appended when the combined analysis is cut to the token budget.
pub const TRUNCATION_MARKER: &str = "\n[combined analysis truncated]";

/// Section titles of the combined analysis, in order, with the stage they read.
pub const SECTIONS: &[(&str, &str)] = &[
    ("Industry Analysis", PEERS),
    ("Macroeconomic Analysis", MACRO),
    ("News Analysis", NEWS),
    ("Technical Analysis", TECHNICAL),
];

// =============================================================================
// Peers
// =============================================================================

/// Peer selection, relevance weighting, per-peer ratios and industry averages.
pub struct PeerStage {
    company: String,
    gateway: Arc<dyn ChatGateway>,
    market: Arc<dyn FinancialDataProvider>,
    model: ModelSettings,
    settings: PeerSettings,
}

impl PeerStage {
    pub fn new(
        company: impl Into<String>,
        gateway: Arc<dyn ChatGateway>,
        market: Arc<dyn FinancialDataProvider>,
        model: ModelSettings,
        settings: PeerSettings,
    ) -> Self {
        Self {
            company: company.into(),
            gateway,
            market,
            model,
            settings,
        }
    }

    /// Valid tickers from the model's list; the last one is the subject and
    /// survives the peer cap.
    fn select_tickers(&self, raw: &str) -> Vec<String> {
        let mut tickers: Vec<String> = parse_words(raw, None)
            .into_tokens()
            .into_iter()
            .filter_map(|t| match normalize_ticker(&t) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(token = %t, error = %e, "dropping invalid ticker");
                    None
                }
            })
            .collect();
        if let Some(subject) = tickers.pop() {
            tickers.truncate(self.settings.max_peers);
            tickers.push(subject);
        }
        tickers
    }

    fn subject_index(&self, tickers: &[String]) -> usize {
        tickers
            .iter()
            .position(|t| t.eq_ignore_ascii_case(self.company.trim()))
            .unwrap_or(tickers.len().saturating_sub(1))
    }

    async fn ratio_values(
        &self,
        ticker: &str,
        ratio_list: &str,
        expected: usize,
    ) -> Result<Vec<String>, StageError> {
        let statements = match self.market.statements(ticker).await {
            Ok(s) => s,
            Err(e) => {
                warn!(ticker, error = %e, "no financial statements; peer excluded");
                return Ok(Vec::new());
            }
        };
        let data = statements.render(self.settings.statement_periods);
        debug!(ticker, chars = data.len(), "rendered financial statements");
        let raw = complete(
            self.gateway.as_ref(),
            &self.model,
            &PEER_RATIO_VALUES,
            &[("ratios", ratio_list), ("financial_data", data.as_str())],
            Attribution::new("peers::ratio_values"),
        )
        .await;
        match raw {
            Ok(raw) => Ok(parse(&raw, RATIO_DELIMITER, Some(expected)).into_tokens()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(ticker, error = %e, "ratio calculation failed; peer excluded");
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl PipelineStage for PeerStage {
    fn name(&self) -> &str {
        PEERS
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }

    async fn run(&self, _ctx: &PipelineContext) -> Result<Artifact, StageError> {
        let company = self.company.as_str();
        let gateway = self.gateway.as_ref();

        let raw = complete(
            gateway,
            &self.model,
            &PEER_TICKERS,
            &[("company", company)],
            Attribution::new("peers::tickers"),
        )
        .await?;
        let tickers = self.select_tickers(&raw);
        if tickers.is_empty() {
            return Err(StageError::Failed("model returned no peer tickers".into()));
        }

        let peers = tickers.join(" ");
        let raw = complete(
            gateway,
            &self.model,
            &PEER_WEIGHTS,
            &[("company", company), ("peers", peers.as_str())],
            Attribution::new("peers::weights"),
        )
        .await?;
        let weights = parse_words(&raw, Some(tickers.len())).into_tokens();

        let raw = complete(
            gateway,
            &self.model,
            &PEER_RATIO_NAMES,
            &[("company", company)],
            Attribution::new("peers::ratio_names"),
        )
        .await?;
        let names = parse(&raw, RATIO_DELIMITER, None).non_empty();
        if names.is_empty() {
            return Err(StageError::Failed("model returned no ratio names".into()));
        }
        let ratio_list = names.join(RATIO_DELIMITER);
        info!(peers = tickers.len(), ratios = names.len(), "peer set selected");

        let mut entities = Vec::with_capacity(tickers.len());
        for (i, ticker) in tickers.iter().enumerate() {
            let values = self.ratio_values(ticker, &ratio_list, names.len()).await?;
            entities.push(Entity::from_tokens(
                ticker.clone(),
                &names,
                &values,
                weights.get(i).cloned(),
            ));
        }

        let aggregate = reconcile(&entities, &names);
        let subject = &entities[self.subject_index(&tickers)];

        let mut value = Map::new();
        value.insert("ticker".into(), Value::String(subject.id.clone()));
        value.insert(company.to_string(), json!(subject.metrics));
        value.insert("industry_average".into(), json!(aggregate.values()));
        value.insert(
            "peers".into(),
            Value::Array(
                entities
                    .iter()
                    .map(|e| json!({ "ticker": e.id, "weight": e.weight }))
                    .collect(),
            ),
        );
        Ok(Artifact::structured(Value::Object(value)))
    }
}

/// Subject ticker chosen by the peer stage, if it ran and succeeded.
pub fn subject_ticker(ctx: &PipelineContext) -> Option<&str> {
    ctx.get(PEERS)?
        .as_structured()?
        .get("ticker")?
        .as_str()
}

// =============================================================================
// Macro
// =============================================================================

/// Document Q&A over the macroeconomic corpus, then one synthesis call.
pub struct MacroStage {
    company: String,
    gateway: Arc<dyn ChatGateway>,
    model: ModelSettings,
    qa: QaSettings,
}

impl MacroStage {
    pub fn new(
        company: impl Into<String>,
        gateway: Arc<dyn ChatGateway>,
        model: ModelSettings,
        qa: QaSettings,
    ) -> Self {
        Self {
            company: company.into(),
            gateway,
            model,
            qa,
        }
    }
}

#[async_trait]
impl PipelineStage for MacroStage {
    fn name(&self) -> &str {
        MACRO
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Degrade
    }

    async fn run(&self, _ctx: &PipelineContext) -> Result<Artifact, StageError> {
        let corpus = load_corpus(&self.qa.documents).await?;
        let qa = QaContextBuilder::new(self.gateway.clone(), self.model.clone())
            .chunking(self.qa.chunking().map_err(QaError::from)?)
            .top_k(self.qa.top_k)
            .concurrency(self.qa.concurrency)
            .build(&corpus, &self.company, self.qa.question_count)
            .await?;
        info!(
            exchanges = qa.exchanges.len(),
            answered = qa.answered(),
            "document Q&A context built"
        );

        let context = qa.blob();
        let text = complete(
            self.gateway.as_ref(),
            &self.model,
            &MACRO_ANALYSIS,
            &[("company", self.company.as_str()), ("context", context.as_str())],
            Attribution::new("macro::analysis"),
        )
        .await?;
        Ok(Artifact::text(text.trim()))
    }
}

// =============================================================================
// News
// =============================================================================

pub struct NewsStage {
    company: String,
    gateway: Arc<dyn ChatGateway>,
    news: Arc<dyn NewsCorpusProvider>,
    model: ModelSettings,
    cache_dir: PathBuf,
}

impl NewsStage {
    pub fn new(
        company: impl Into<String>,
        gateway: Arc<dyn ChatGateway>,
        news: Arc<dyn NewsCorpusProvider>,
        model: ModelSettings,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            company: company.into(),
            gateway,
            news,
            model,
            cache_dir: cache_dir.into(),
        }
    }
}

#[async_trait]
impl PipelineStage for NewsStage {
    fn name(&self) -> &str {
        NEWS
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Degrade
    }

    async fn run(&self, _ctx: &PipelineContext) -> Result<Artifact, StageError> {
        let company = self.company.as_str();
        let articles = self.news.fetch_articles(company).await?;
        let path = cache_path(&self.cache_dir, company)?;
        write_cache(&path, &articles).await?;

        let contents = read_contents(&path).await?;
        if contents.is_empty() {
            return Err(NewsError::Empty(company.to_string()).into());
        }
        info!(articles = articles.len(), with_content = contents.len(), "news corpus loaded");

        let news = contents.join(" ");
        let insight = complete(
            self.gateway.as_ref(),
            &self.model,
            &NEWS_INSIGHT,
            &[("company", company), ("news", news.as_str())],
            Attribution::new("news::insight"),
        )
        .await?;
        let distilled = complete(
            self.gateway.as_ref(),
            &self.model,
            &NEWS_DISTILL,
            &[("response", insight.as_str())],
            Attribution::new("news::distill"),
        )
        .await?;
        Ok(Artifact::text(distilled.trim()))
    }
}

// =============================================================================
// Technical
// =============================================================================

pub struct TechnicalStage {
    company: String,
    gateway: Arc<dyn ChatGateway>,
    market: Arc<dyn FinancialDataProvider>,
    model: ModelSettings,
    settings: TechnicalSettings,
}

impl TechnicalStage {
    pub fn new(
        company: impl Into<String>,
        gateway: Arc<dyn ChatGateway>,
        market: Arc<dyn FinancialDataProvider>,
        model: ModelSettings,
        settings: TechnicalSettings,
    ) -> Self {
        Self {
            company: company.into(),
            gateway,
            market,
            model,
            settings,
        }
    }
}

#[async_trait]
impl PipelineStage for TechnicalStage {
    fn name(&self) -> &str {
        TECHNICAL
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Degrade
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<Artifact, StageError> {
        let ticker = normalize_ticker(subject_ticker(ctx).unwrap_or(&self.company))?;
        let bars = self
            .market
            .price_history(&ticker, &self.settings.range, &self.settings.interval)
            .await?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let snapshot =
            IndicatorSnapshot::from_closes(&closes).ok_or_else(|| MarketError::NoData {
                ticker: ticker.clone(),
                what: "price history",
            })?;

        let current = match self.market.current_price(&ticker).await {
            Ok(price) => price,
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "no daily quote; using last bar close");
                snapshot.last_close
            }
        };
        debug!(ticker = %ticker, bars = snapshot.bars, "computed indicators");

        let sma50 = fmt_value(snapshot.sma50);
        let ema20 = fmt_value(Some(snapshot.ema20));
        let macd = fmt_value(Some(snapshot.macd));
        let signal = fmt_value(Some(snapshot.signal_line));
        let rsi = fmt_value(snapshot.rsi);
        let price = fmt_value(Some(current));
        let text = complete(
            self.gateway.as_ref(),
            &self.model,
            &TECHNICAL_ANALYSIS,
            &[
                ("ticker", ticker.as_str()),
                ("sma50", sma50.as_str()),
                ("ema20", ema20.as_str()),
                ("macd", macd.as_str()),
                ("signal_line", signal.as_str()),
                ("rsi", rsi.as_str()),
                ("current_price", price.as_str()),
            ],
            Attribution::new("technical::analysis"),
        )
        .await?;
        Ok(Artifact::text(text.trim()))
    }
}

// =============================================================================
// Recommendation
// =============================================================================

/// Final synthesis over every upstream section.
pub struct RecommendationStage {
    company: String,
    gateway: Arc<dyn ChatGateway>,
    model: ModelSettings,
    token_budget: usize,
}

impl RecommendationStage {
    pub fn new(
        company: impl Into<String>,
        gateway: Arc<dyn ChatGateway>,
        model: ModelSettings,
        token_budget: usize,
    ) -> Self {
        Self {
            company: company.into(),
            gateway,
            model,
            token_budget,
        }
    }
}

/// Every section in [`SECTIONS`] order. A section whose stage never ran
/// renders as unavailable.
pub fn combined_analysis(ctx: &PipelineContext) -> String {
    SECTIONS
        .iter()
        .map(|(title, key)| {
            let body = ctx
                .get(key)
                .map(Artifact::render)
                .unwrap_or_else(|| Artifact::unavailable("stage did not run").render());
            format!("{title}:\n{body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl PipelineStage for RecommendationStage {
    fn name(&self) -> &str {
        RECOMMENDATION_STAGE
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<Artifact, StageError> {
        let combined = truncate_to_tokens(&combined_analysis(ctx), self.token_budget, TRUNCATION_MARKER);
        debug!(chars = combined.len(), "combined analysis");
        let text = complete(
            self.gateway.as_ref(),
            &self.model,
            &RECOMMENDATION,
            &[("company", self.company.as_str()), ("combined_analysis", combined.as_str())],
            Attribution::new("recommendation"),
        )
        .await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(StageError::Failed("model returned an empty recommendation".into()));
        }
        Ok(Artifact::text(text))
    }
}
