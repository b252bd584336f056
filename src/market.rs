//! Financial statements and price history.
//!
//! [`FinancialDataProvider`] is the seam the peer and technical stages read
//! market data through. [`YahooFinanceProvider`] talks to the public chart and
//! quoteSummary endpoints; [`FixtureDataProvider`] reads `<dir>/<TICKER>.json`
//! for offline runs and tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const YAHOO_BASE_URL: &str = "https://query1.finance.yahoo.com";

const QUOTE_SUMMARY_MODULES: &str = "assetProfile,summaryDetail,financialData,defaultKeyStatistics,balanceSheetHistory,incomeStatementHistory,cashflowStatementHistory";

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("no {what} available for {ticker}")]
    NoData { ticker: String, what: &'static str },
    #[error("invalid ticker symbol '{0}'")]
    InvalidTicker(String),
    #[error("market data request for {ticker} failed with HTTP {status}")]
    Status { ticker: String, status: u16 },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed market data: {0}")]
    Parse(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

// =============================================================================
// Types
// =============================================================================

/// One financial statement: line items by reporting period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementTable {
    /// Period labels, most recent first.
    pub periods: Vec<String>,
    pub rows: Vec<StatementRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRow {
    pub name: String,
    /// One value per period, aligned with [`StatementTable::periods`].
    pub values: Vec<Option<f64>>,
}

impl StatementTable {
    pub fn is_empty(&self) -> bool {
        self.periods.is_empty() || self.rows.is_empty()
    }

    /// Keep only the `n` most recent periods.
    pub fn most_recent(&self, n: usize) -> StatementTable {
        let keep = n.min(self.periods.len());
        StatementTable {
            periods: self.periods[..keep].to_vec(),
            rows: self
                .rows
                .iter()
                .map(|r| StatementRow {
                    name: r.name.clone(),
                    values: r.values.iter().take(keep).cloned().collect(),
                })
                .collect(),
        }
    }

    /// Fixed-width text table, line items down, periods across.
    pub fn render(&self) -> String {
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| {
                (0..self.periods.len())
                    .map(|i| format_value(r.values.get(i).copied().flatten()))
                    .collect()
            })
            .collect();

        let name_width = self.rows.iter().map(|r| r.name.len()).max().unwrap_or(0);
        let widths: Vec<usize> = self
            .periods
            .iter()
            .enumerate()
            .map(|(i, p)| {
                cells
                    .iter()
                    .map(|row| row[i].len())
                    .chain(std::iter::once(p.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut out = format!("{:name_width$}", "");
        for (p, w) in self.periods.iter().zip(&widths) {
            out.push_str(&format!("  {p:>w$}"));
        }
        for (row, values) in self.rows.iter().zip(&cells) {
            out.push('\n');
            out.push_str(&format!("{:name_width$}", row.name));
            for (v, w) in values.iter().zip(&widths) {
                out.push_str(&format!("  {v:>w$}"));
            }
        }
        out
    }
}

fn format_value(v: Option<f64>) -> String {
    match v {
        None => "NaN".to_string(),
        Some(x) if x.fract() == 0.0 && x.abs() < 1e15 => format!("{}", x as i64),
        Some(x) => format!("{x}"),
    }
}

/// Everything the peer stage hands the model for one ticker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinancialStatements {
    pub ticker: String,
    pub info: BTreeMap<String, String>,
    pub balance_sheet: StatementTable,
    pub income_statement: StatementTable,
    pub cash_flow: StatementTable,
}

impl FinancialStatements {
    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
            && self.balance_sheet.is_empty()
            && self.income_statement.is_empty()
            && self.cash_flow.is_empty()
    }

    /// Analyst-facing text. Empty statements render as a "Data Unavailable"
    /// line rather than being omitted.
    pub fn render(&self, periods: usize) -> String {
        let mut out = String::from("Info:\n");
        for (k, v) in &self.info {
            out.push_str(&format!("{k}: {v}\n"));
        }
        out.push('\n');

        for (title, table) in [
            ("Balance Sheet", &self.balance_sheet),
            ("Income Statement", &self.income_statement),
            ("Cash Flow Statement", &self.cash_flow),
        ] {
            if table.is_empty() {
                out.push_str(&format!("{title}: Data Unavailable\n\n"));
            } else {
                out.push_str(&format!(
                    "{title}:\n{}\n\n",
                    table.most_recent(periods).render()
                ));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub time: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<u64>,
}

#[async_trait]
pub trait FinancialDataProvider: Send + Sync {
    async fn statements(&self, ticker: &str) -> Result<FinancialStatements, MarketError>;

    /// Bars oldest first. `range`/`interval` use Yahoo's vocabulary ("1y", "1wk").
    async fn price_history(
        &self,
        ticker: &str,
        range: &str,
        interval: &str,
    ) -> Result<Vec<PriceBar>, MarketError>;

    /// Latest daily close.
    async fn current_price(&self, ticker: &str) -> Result<f64, MarketError> {
        self.price_history(ticker, "5d", "1d")
            .await?
            .last()
            .map(|b| b.close)
            .ok_or_else(|| MarketError::NoData {
                ticker: ticker.to_string(),
                what: "current price",
            })
    }
}

/// Uppercased symbol restricted to characters that appear in exchange tickers.
pub fn normalize_ticker(raw: &str) -> Result<String, MarketError> {
    let t = raw.trim().to_uppercase();
    let valid = !t.is_empty()
        && t.len() <= 16
        && t
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='))
        && !t.starts_with('.');
    if valid {
        Ok(t)
    } else {
        Err(MarketError::InvalidTicker(raw.to_string()))
    }
}

// =============================================================================
// Yahoo Finance
// =============================================================================

#[derive(Debug, Clone)]
pub struct YahooFinanceProvider {
    client: reqwest::Client,
    base_url: String,
}

impl YahooFinanceProvider {
    pub fn new() -> Result<Self, MarketError> {
        Self::with_base_url(YAHOO_BASE_URL, Duration::from_secs(30))
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self, MarketError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (compatible; valuate/0.1)"),
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, ticker: &str, url: String, query: &[(&str, &str)]) -> Result<Value, MarketError> {
        let resp = self.client.get(&url).query(query).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(MarketError::NoData {
                ticker: ticker.to_string(),
                what: "market data",
            });
        }
        if !status.is_success() {
            return Err(MarketError::Status {
                ticker: ticker.to_string(),
                status: status.as_u16(),
            });
        }
        resp.json::<Value>()
            .await
            .map_err(|e| MarketError::Parse(e.to_string()))
    }
}

#[async_trait]
impl FinancialDataProvider for YahooFinanceProvider {
    async fn statements(&self, ticker: &str) -> Result<FinancialStatements, MarketError> {
        let ticker = normalize_ticker(ticker)?;
        let url = format!("{}/v10/finance/quoteSummary/{ticker}", self.base_url);
        let body = self
            .get_json(&ticker, url, &[("modules", QUOTE_SUMMARY_MODULES)])
            .await?;
        let statements = parse_quote_summary(&ticker, &body)?;
        debug!(
            ticker = %ticker,
            info_fields = statements.info.len(),
            balance_rows = statements.balance_sheet.rows.len(),
            "fetched statements"
        );
        Ok(statements)
    }

    async fn price_history(
        &self,
        ticker: &str,
        range: &str,
        interval: &str,
    ) -> Result<Vec<PriceBar>, MarketError> {
        let ticker = normalize_ticker(ticker)?;
        let url = format!("{}/v8/finance/chart/{ticker}", self.base_url);
        let body = self
            .get_json(&ticker, url, &[("range", range), ("interval", interval)])
            .await?;
        let bars = parse_chart(&body)?;
        if bars.is_empty() {
            return Err(MarketError::NoData {
                ticker,
                what: "price history",
            });
        }
        Ok(bars)
    }
}

fn raw_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Object(o) => o.get("raw").and_then(Value::as_f64),
        _ => None,
    }
}

fn display_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(o) => o
            .get("fmt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| o.get("raw").and_then(Value::as_f64).map(|x| x.to_string())),
        _ => None,
    }
}

fn parse_chart(body: &Value) -> Result<Vec<PriceBar>, MarketError> {
    let result = body
        .pointer("/chart/result/0")
        .ok_or_else(|| MarketError::Parse("chart response has no result".into()))?;
    let timestamps = match result.get("timestamp").and_then(Value::as_array) {
        Some(ts) => ts,
        None => return Ok(Vec::new()),
    };
    let quote = result
        .pointer("/indicators/quote/0")
        .ok_or_else(|| MarketError::Parse("chart response has no quote series".into()))?;
    let series = |name: &str| -> Vec<Option<f64>> {
        quote
            .get(name)
            .and_then(Value::as_array)
            .map(|a| a.iter().map(Value::as_f64).collect())
            .unwrap_or_default()
    };
    let (open, high, low, close) = (series("open"), series("high"), series("low"), series("close"));
    let volume: Vec<Option<u64>> = quote
        .get("volume")
        .and_then(Value::as_array)
        .map(|a| a.iter().map(Value::as_u64).collect())
        .unwrap_or_default();

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, ts) in timestamps.iter().enumerate() {
        let (Some(secs), Some(Some(c))) = (ts.as_i64(), close.get(i)) else {
            continue;
        };
        let Some(time) = Utc.timestamp_opt(secs, 0).single() else {
            continue;
        };
        bars.push(PriceBar {
            time,
            open: open.get(i).copied().flatten(),
            high: high.get(i).copied().flatten(),
            low: low.get(i).copied().flatten(),
            close: *c,
            volume: volume.get(i).copied().flatten(),
        });
    }
    Ok(bars)
}

fn parse_statement(items: Option<&Vec<Value>>) -> StatementTable {
    let Some(items) = items else {
        return StatementTable::default();
    };

    let mut periods: Vec<(String, &serde_json::Map<String, Value>)> = items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let period = obj.get("endDate").and_then(display_value)?;
            Some((period, obj))
        })
        .collect();
    // ISO dates sort lexicographically; most recent first.
    periods.sort_by(|a, b| b.0.cmp(&a.0));

    let mut names: Vec<String> = Vec::new();
    for (_, obj) in &periods {
        for (k, v) in obj.iter() {
            if k == "endDate" || k == "maxAge" || raw_number(v).is_none() {
                continue;
            }
            if !names.contains(k) {
                names.push(k.clone());
            }
        }
    }

    let rows = names
        .into_iter()
        .map(|name| StatementRow {
            values: periods
                .iter()
                .map(|(_, obj)| obj.get(&name).and_then(raw_number))
                .collect(),
            name,
        })
        .collect();

    StatementTable {
        periods: periods.into_iter().map(|(p, _)| p).collect(),
        rows,
    }
}

fn parse_quote_summary(ticker: &str, body: &Value) -> Result<FinancialStatements, MarketError> {
    let result = body
        .pointer("/quoteSummary/result/0")
        .ok_or_else(|| MarketError::NoData {
            ticker: ticker.to_string(),
            what: "financial statements",
        })?;

    let mut info = BTreeMap::new();
    for module in [
        "assetProfile",
        "summaryDetail",
        "financialData",
        "defaultKeyStatistics",
    ] {
        if let Some(obj) = result.get(module).and_then(Value::as_object) {
            for (k, v) in obj {
                if k == "maxAge" || k == "companyOfficers" {
                    continue;
                }
                if let Some(s) = display_value(v) {
                    info.insert(k.clone(), s);
                }
            }
        }
    }

    let array = |path: &str| result.pointer(path).and_then(Value::as_array);
    Ok(FinancialStatements {
        ticker: ticker.to_string(),
        info,
        balance_sheet: parse_statement(array("/balanceSheetHistory/balanceSheetStatements")),
        income_statement: parse_statement(array("/incomeStatementHistory/incomeStatementHistory")),
        cash_flow: parse_statement(array("/cashflowStatementHistory/cashflowStatements")),
    })
}

// =============================================================================
// Fixtures
// =============================================================================

/// Contents of `<dir>/<TICKER>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketFixture {
    pub statements: FinancialStatements,
    pub history: Vec<PriceBar>,
    pub current_price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FixtureDataProvider {
    dir: PathBuf,
}

impl FixtureDataProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, ticker: &str) -> Result<PathBuf, MarketError> {
        Ok(self.dir.join(format!("{}.json", normalize_ticker(ticker)?)))
    }

    async fn load(&self, ticker: &str) -> Result<MarketFixture, MarketError> {
        let path = self.path_for(ticker)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MarketError::NoData {
                    ticker: ticker.to_string(),
                    what: "fixture",
                })
            }
            Err(source) => return Err(MarketError::Io { path, source }),
        };
        serde_json::from_str(&raw)
            .map_err(|e| MarketError::Parse(format!("{}: {e}", display(&path))))
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl FinancialDataProvider for FixtureDataProvider {
    async fn statements(&self, ticker: &str) -> Result<FinancialStatements, MarketError> {
        let mut statements = self.load(ticker).await?.statements;
        if statements.ticker.is_empty() {
            statements.ticker = normalize_ticker(ticker)?;
        }
        Ok(statements)
    }

    async fn price_history(
        &self,
        ticker: &str,
        _range: &str,
        _interval: &str,
    ) -> Result<Vec<PriceBar>, MarketError> {
        let history = self.load(ticker).await?.history;
        if history.is_empty() {
            return Err(MarketError::NoData {
                ticker: ticker.to_string(),
                what: "price history",
            });
        }
        Ok(history)
    }

    async fn current_price(&self, ticker: &str) -> Result<f64, MarketError> {
        let fixture = self.load(ticker).await?;
        fixture
            .current_price
            .or_else(|| fixture.history.last().map(|b| b.close))
            .ok_or_else(|| MarketError::NoData {
                ticker: ticker.to_string(),
                what: "current price",
            })
    }
}
