//! Prompt templates for the analysis stages.
//!
//! Templates use `{name}` placeholders. Substitution is a single pass over the
//! template, so placeholder-like text inside a substituted value (an article
//! body, a model answer) is never expanded again. Unknown placeholders are
//! left verbatim.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ModelSettings;
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message, ProviderError};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").expect("placeholder regex"));

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: Option<String>,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = vec![Message::system(&self.system)];
        if let Some(user) = &self.user {
            messages.push(Message::user(user));
        }
        messages
    }
}

/// A prompt template with `{name}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: Option<&'static str>,
}

fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value).to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

impl PromptTemplate {
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: substitute(self.system, vars).trim().to_string(),
            user: self.user.map(|u| substitute(u, vars).trim().to_string()),
        }
    }

    /// Placeholder names referenced by this template, in first-seen order.
    pub fn placeholders(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = Vec::new();
        for text in std::iter::once(self.system).chain(self.user) {
            for caps in PLACEHOLDER.captures_iter(text) {
                if let Some(m) = caps.get(1) {
                    if !names.contains(&m.as_str()) {
                        names.push(m.as_str());
                    }
                }
            }
        }
        names
    }
}

/// Render `template` and send it through `gateway`, returning the raw text.
pub async fn complete<G: ChatGateway + ?Sized>(
    gateway: &G,
    settings: &ModelSettings,
    template: &PromptTemplate,
    vars: &[(&str, &str)],
    attribution: Attribution,
) -> Result<String, ProviderError> {
    let prompt = template.render(vars);
    let mut req = ChatRequest::new(&settings.name, prompt.to_messages(), attribution)
        .temperature(settings.temperature);
    if let Some(max) = settings.max_tokens {
        req = req.max_tokens(max);
    }
    let resp = gateway.chat(req).await?;
    Ok(resp.content)
}

// =============================================================================
// Peer analysis
// =============================================================================

pub const PEER_TICKERS: PromptTemplate = PromptTemplate {
    slug: "peers_tickers_v1",
    system: r#"Select companies that operate in similar segments, have similar business models, or share product offerings with {company}. Prioritize companies that compete directly with {company} in key markets or have similar operating structures.
List only their ticker symbols, separated by single spaces, with no numbering and no other text. Add the ticker of {company} at the end."#,
    user: None,
};

pub const PEER_WEIGHTS: PromptTemplate = PromptTemplate {
    slug: "peers_weights_v1",
    system: r#"Assign a weight to each peer company based on its relevance to the business of {company}. Consider:
- Business overlap: how closely their product offerings align with the core businesses of {company}.
- Market position: direct competitors in key markets.
- Industry influence: companies operating in similar market environments or under similar economic pressures.
Weights must be between 0 and 1 and sum to 1. Companies to weigh, in order: {peers}
Output only the weights, in the same order, separated by single spaces. No words."#,
    user: None,
};

pub const PEER_RATIO_NAMES: PromptTemplate = PromptTemplate {
    slug: "peers_ratio_names_v1",
    system: r#"You are a senior financial analyst preparing a peer comparison for {company}. List the financial ratios most relevant for comparing the financial health of {company} with its industry peers.
Output a single line with the ratio names separated by ****, no other words and no numbers."#,
    user: None,
};

pub const PEER_RATIO_VALUES: PromptTemplate = PromptTemplate {
    slug: "peers_ratio_values_v1",
    system: r#"You are a senior financial analyst. Using the last two years of financial data below, calculate these ratios: {ratios}
Recheck your arithmetic before answering. Output a single line with one number per ratio, in the same order, separated by ****. Only numbers, no other words.

Financial data:
{financial_data}"#,
    user: None,
};

// =============================================================================
// Macroeconomic document Q&A
// =============================================================================

pub const QA_QUESTIONS: PromptTemplate = PromptTemplate {
    slug: "qa_questions_v1",
    system: r#"You are a renowned financial analyst reading a macroeconomic report. You want to understand the economic factors that will drive the growth or decline of {company}: fiscal policy, consumer spending, inflation, interest rates, technology shifts and trade dynamics.
Write exactly {count} questions to ask of the report. Prefer industry-wide questions over company-specific ones.
Output only the questions, each as a short paragraph, separated by ********. No other text."#,
    user: None,
};

pub const QA_ANSWER: PromptTemplate = PromptTemplate {
    slug: "qa_answer_v1",
    system: r#"Use the following pieces of context to answer the question at the end. If you don't know the answer, say that you don't know; don't try to make up an answer.

{context}"#,
    user: Some("Question: {question}\nHelpful Answer:"),
};

pub const MACRO_ANALYSIS: PromptTemplate = PromptTemplate {
    slug: "macro_analysis_v1",
    system: r#"You are a top financial analyst providing macroeconomic insights on {company} based on economic data.
Write a comprehensive analysis and recommendation using the provided context:

{context}"#,
    user: None,
};

// =============================================================================
// News
// =============================================================================

pub const NEWS_INSIGHT: PromptTemplate = PromptTemplate {
    slug: "news_insight_v1",
    system: "You are an experienced news-driven equity trader. You read company news and judge its likely effect on the stock.",
    user: Some(
        r#"Recent news articles about {company}:
{news}

Give your insights on this news. What is likely to happen to the stock price of {company}? Up or down, and why? What should investors in {company} do?"#,
    ),
};

pub const NEWS_DISTILL: PromptTemplate = PromptTemplate {
    slug: "news_distill_v1",
    system: r#"Rewrite the following content in a neutral, report-like voice. Remove conversational filler and any commentary about being an AI; keep only the information.

{response}"#,
    user: None,
};

// =============================================================================
// Technical analysis
// =============================================================================

pub const TECHNICAL_ANALYSIS: PromptTemplate = PromptTemplate {
    slug: "technical_v1",
    system: "You are a stock market expert in technical analysis. Analyze the stock's technical indicators and give an insightful prediction.",
    user: Some(
        r#"Technical analysis data for {ticker} (weekly bars):
SMA50: {sma50}
EMA20: {ema20}
MACD: {macd}
Signal_Line: {signal_line}
RSI: {rsi}
Current Price: {current_price}

Analyze the stock's potential movement. Should investors buy, hold, or sell? What should the strategy be?"#,
    ),
};

// =============================================================================
// Recommendation
// =============================================================================

pub const RECOMMENDATION: PromptTemplate = PromptTemplate {
    slug: "recommendation_v1",
    system: "You are a financial analyst with expertise in stock market analysis.",
    user: Some(
        r#"Based on the following combined analysis of {company}, provide a detailed investment recommendation.

{combined_analysis}

The output should include:
- A summary of the investment outlook considering the factors above.
- A specific strategy for short-term traders, long-term investors, and current holders.
- Risks and opportunities identified for the stock.
- Potential price targets, trends to watch, and cautionary advice."#,
    ),
};

pub const PROMPTS: &[PromptTemplate] = &[
    PEER_TICKERS,
    PEER_WEIGHTS,
    PEER_RATIO_NAMES,
    PEER_RATIO_VALUES,
    QA_QUESTIONS,
    QA_ANSWER,
    MACRO_ANALYSIS,
    NEWS_INSIGHT,
    NEWS_DISTILL,
    TECHNICAL_ANALYSIS,
    RECOMMENDATION,
];

pub fn prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    PROMPTS.iter().find(|t| t.slug == slug).copied()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_system_and_user() {
        let p = NEWS_INSIGHT.render(&[("company", "ACME"), ("news", "Record quarter.")]);
        assert!(p.user.as_deref().unwrap().contains("about ACME:\nRecord quarter."));
        assert_eq!(p.to_messages().len(), 2);
    }

    #[test]
    fn system_only_template_yields_one_message() {
        let p = PEER_TICKERS.render(&[("company", "ACME")]);
        assert_eq!(p.to_messages().len(), 1);
        assert!(!p.system.contains("{company}"));
    }

    #[test]
    fn values_are_not_re_expanded() {
        let p = NEWS_INSIGHT.render(&[("company", "ACME"), ("news", "see {company} filing")]);
        assert!(p.user.unwrap().contains("see {company} filing"));
    }

    #[test]
    fn unknown_placeholder_is_left_verbatim() {
        let p = MACRO_ANALYSIS.render(&[("company", "ACME")]);
        assert!(p.system.contains("{context}"));
    }

    #[test]
    fn placeholders_are_listed_once() {
        assert_eq!(PEER_WEIGHTS.placeholders(), vec!["company", "peers"]);
        assert_eq!(QA_ANSWER.placeholders(), vec!["context", "question"]);
    }

    #[test]
    fn prompt_lookup() {
        assert!(prompt_by_slug("recommendation_v1").is_some());
        assert!(prompt_by_slug("nonexistent").is_none());
        let mut slugs: Vec<_> = PROMPTS.iter().map(|p| p.slug).collect();
        slugs.dedup();
        assert_eq!(slugs.len(), PROMPTS.len());
    }
}
