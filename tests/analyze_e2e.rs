use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use valuate::analyst::{analyze, AnalysisError, Dependencies};
use valuate::config::AnalystConfig;
use valuate::gateway::{ChatGateway, ChatRequest, ChatResponse, ProviderError};
use valuate::market::FixtureDataProvider;
use valuate::news::{JsonFileNewsProvider, NoNewsProvider};
use valuate::pipeline::{StageError, StageStatus};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Replies in order per caller tag and keeps every request.
#[derive(Default)]
struct Scripted {
    replies: Mutex<HashMap<&'static str, VecDeque<String>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl Scripted {
    fn reply(self, caller: &'static str, text: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(caller)
            .or_default()
            .push_back(text.to_string());
        self
    }

    fn callers(&self) -> Vec<&'static str> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.attribution.caller)
            .collect()
    }

    fn prompt_of(&self, caller: &str) -> String {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.attribution.caller == caller)
            .flat_map(|r| r.messages.iter().map(|m| m.content.clone()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl ChatGateway for Scripted {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let caller = req.attribution.caller;
        self.requests.lock().unwrap().push(req);
        self.replies
            .lock()
            .unwrap()
            .get_mut(caller)
            .and_then(VecDeque::pop_front)
            .map(ChatResponse::text)
            .ok_or_else(|| ProviderError::provider("test", format!("no reply for {caller}"), false))
    }
}

fn full_script() -> Scripted {
    Scripted::default()
        .reply("peers::tickers", "MSFT ACME")
        .reply("peers::weights", "0.6 0.4")
        .reply("peers::ratio_names", "P/E Ratio****Return on Equity")
        .reply("peers::ratio_values", "30****0.4")
        .reply("peers::ratio_values", "20****0.2")
        .reply("qa::questions", "How are interest rates moving?********Is industrial demand growing?")
        .reply("qa::answer", "Rates are expected to fall.")
        .reply("qa::answer", "Demand is growing modestly.")
        .reply("macro::analysis", "Macro backdrop is supportive.")
        .reply("news::insight", "Orders rose sharply.")
        .reply("news::distill", "News flow is positive.")
        .reply("technical::analysis", "Price is above trend.")
        .reply("recommendation", "  BUY ACME with a 12 month horizon.  ")
}

fn write_json(path: &Path, value: &serde_json::Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Market fixtures for ACME and MSFT, a one-page macro report and an ACME
/// news file.
fn workspace() -> (TempDir, AnalystConfig) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let history: Vec<_> = (0..30)
        .map(|i| {
            json!({
                "time": format!("2024-01-{:02}T00:00:00Z", i + 1),
                "close": 10.0 + i as f64,
            })
        })
        .collect();
    for ticker in ["ACME", "MSFT"] {
        write_json(
            &root.join(format!("market/{ticker}.json")),
            &json!({
                "statements": {
                    "ticker": ticker,
                    "info": { "sector": "Industrials" },
                    "income_statement": {
                        "periods": ["2023-12-31"],
                        "rows": [{ "name": "netIncome", "values": [1000.0] }]
                    }
                },
                "history": history,
                "current_price": 41.5
            }),
        );
    }

    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::write(
        root.join("docs/outlook.txt"),
        "Interest rates are expected to fall next year.\u{0c}Industrial demand is growing modestly.",
    )
    .unwrap();

    write_json(
        &root.join("news/source/ACME.json"),
        &json!([
            { "title": "ACME wins contract", "content": "ACME won a large order." },
            { "title": "No body" }
        ]),
    );

    let mut config = AnalystConfig::default();
    config.market.fixture_dir = Some(root.join("market"));
    config.news.source_dir = Some(root.join("news/source"));
    config.news.cache_dir = root.join("news/cache");
    config.qa.documents = vec![format!("{}/docs/*.txt", root.display())];
    config.qa.question_count = 2;
    config.gateway.max_retries = 0;
    (dir, config)
}

fn deps(config: &AnalystConfig, gateway: Arc<Scripted>) -> Dependencies {
    Dependencies::new(
        gateway,
        Arc::new(FixtureDataProvider::new(config.market.fixture_dir.clone().unwrap())),
        Arc::new(JsonFileNewsProvider::new(config.news.source_dir.clone().unwrap())),
    )
}

#[tokio::test]
async fn full_run_produces_a_recommendation() {
    let (dir, config) = workspace();
    let gateway = Arc::new(full_script());

    let rec = analyze(" ACME ", &config, &deps(&config, gateway.clone()))
        .await
        .unwrap();

    assert_eq!(rec.company, "ACME");
    assert_eq!(rec.text, "BUY ACME with a 12 month horizon.");
    assert!(rec
        .run
        .outcomes
        .iter()
        .all(|o| o.status == StageStatus::Succeeded));
    let order: Vec<_> = rec.run.outcomes.iter().map(|o| o.stage.as_str()).collect();
    assert_eq!(order, vec!["peers", "macro", "news", "technical", "recommendation"]);

    let peers = rec.run.context.get("peers").unwrap().as_structured().unwrap();
    assert_eq!(peers["ticker"], "ACME");
    assert_eq!(peers["ACME"]["P/E Ratio"], "20");
    let pe = peers["industry_average"]["P/E Ratio"].as_f64().unwrap();
    assert!((pe - 26.0).abs() < 1e-9);
    let roe = peers["industry_average"]["Return on Equity"].as_f64().unwrap();
    assert!((roe - 0.32).abs() < 1e-9);

    let cached = std::fs::read_to_string(dir.path().join("news/cache/ACME_news.json")).unwrap();
    assert!(cached.contains("ACME won a large order."));
    assert!(gateway.prompt_of("news::insight").contains("ACME won a large order."));
    assert!(gateway.prompt_of("technical::analysis").contains("41.50"));

    let prompt = gateway.prompt_of("recommendation");
    let industry = prompt.find("Industry Analysis:").unwrap();
    let macro_ = prompt.find("Macroeconomic Analysis:\nMacro backdrop is supportive.").unwrap();
    let news = prompt.find("News Analysis:\nNews flow is positive.").unwrap();
    let technical = prompt.find("Technical Analysis:\nPrice is above trend.").unwrap();
    assert!(industry < macro_ && macro_ < news && news < technical);
}

#[tokio::test]
async fn missing_news_degrades_but_still_recommends() {
    let (_dir, config) = workspace();
    let gateway = Arc::new(full_script());
    let deps = Dependencies::new(
        gateway.clone(),
        Arc::new(FixtureDataProvider::new(config.market.fixture_dir.clone().unwrap())),
        Arc::new(NoNewsProvider),
    );

    let rec = analyze("ACME", &config, &deps).await.unwrap();

    assert_eq!(rec.run.outcome("news").unwrap().status, StageStatus::Degraded);
    assert!(rec.run.context.get("news").unwrap().is_unavailable());
    assert!(!gateway.callers().contains(&"news::insight"));
    assert!(gateway
        .prompt_of("recommendation")
        .contains("News Analysis:\nData Unavailable ("));
}

#[tokio::test]
async fn failed_peer_stage_aborts_before_any_other_call() {
    let (_dir, config) = workspace();
    let gateway = Arc::new(Scripted::default().reply("peers::tickers", "   "));

    let err = analyze("ACME", &config, &deps(&config, gateway.clone()))
        .await
        .unwrap_err();

    assert!(matches!(err, AnalysisError::Stage { ref stage, .. } if stage == "peers"));
    assert_eq!(gateway.callers(), vec!["peers::tickers"]);
}

#[tokio::test]
async fn rejected_credential_aborts_the_run() {
    let (_dir, mut config) = workspace();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    config.model.base_url = server.uri();

    let deps = Dependencies::from_config(&config, "sk-revoked").unwrap();
    let err = analyze("ACME", &config, &deps).await.unwrap_err();

    match err {
        AnalysisError::Stage { stage, source } => {
            assert_eq!(stage, "peers");
            assert!(matches!(source, StageError::Unauthorized(_)));
        }
        other => panic!("expected a stage failure, got {other:?}"),
    }
}
