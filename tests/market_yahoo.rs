use std::time::Duration;

use serde_json::json;
use valuate::market::{FinancialDataProvider, MarketError, YahooFinanceProvider};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> YahooFinanceProvider {
    YahooFinanceProvider::with_base_url(server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn weekly_history_and_current_price() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/AAPL"))
        .and(query_param("range", "1y"))
        .and(query_param("interval", "1wk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "chart": { "result": [{
                "timestamp": [1700000000, 1700604800, 1701209600],
                "indicators": { "quote": [{ "close": [180.0, null, 190.5] }] }
            }]}
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/AAPL"))
        .and(query_param("range", "5d"))
        .and(query_param("interval", "1d"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "chart": { "result": [{
                "timestamp": [1701209600, 1701296000],
                "indicators": { "quote": [{ "close": [190.5, 191.25] }] }
            }]}
        })))
        .mount(&server)
        .await;

    let yahoo = provider(&server);
    let bars = yahoo.price_history("aapl", "1y", "1wk").await.unwrap();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    assert_eq!(closes, vec![180.0, 190.5]);
    assert!(bars[0].time < bars[1].time);

    assert_eq!(yahoo.current_price("AAPL").await.unwrap(), 191.25);
}

#[tokio::test]
async fn statements_render_with_placeholders() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v10/finance/quoteSummary/MSFT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "quoteSummary": { "result": [{
                "assetProfile": { "sector": "Technology", "maxAge": 86400 },
                "incomeStatementHistory": { "incomeStatementHistory": [
                    { "endDate": { "raw": 1, "fmt": "2023-06-30" }, "netIncome": { "raw": 72361000000.0 } },
                    { "endDate": { "raw": 0, "fmt": "2022-06-30" }, "netIncome": { "raw": 72738000000.0 } },
                    { "endDate": { "raw": 0, "fmt": "2021-06-30" }, "netIncome": { "raw": 61271000000.0 } }
                ]}
            }]}
        })))
        .mount(&server)
        .await;

    let statements = provider(&server).statements("MSFT").await.unwrap();
    assert_eq!(statements.ticker, "MSFT");
    assert_eq!(statements.info.get("sector").map(String::as_str), Some("Technology"));

    let text = statements.render(2);
    assert!(text.starts_with("Info:\nsector: Technology\n"));
    assert!(text.contains("Balance Sheet: Data Unavailable"));
    assert!(text.contains("Cash Flow Statement: Data Unavailable"));
    assert!(text.contains("2023-06-30"));
    assert!(text.contains("72361000000"));
    assert!(!text.contains("2021-06-30"));
}

#[tokio::test]
async fn unknown_ticker_is_no_data() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v10/finance/quoteSummary/NOPE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = provider(&server).statements("NOPE").await.unwrap_err();
    assert!(matches!(err, MarketError::NoData { .. }));
}

#[tokio::test]
async fn invalid_ticker_never_reaches_the_network() {
    let server = MockServer::start().await;
    let err = provider(&server)
        .price_history("../etc", "1y", "1wk")
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InvalidTicker(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}
