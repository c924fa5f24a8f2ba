//! Typed helpers for the upstream endpoints the analysis pipeline uses.
//!
//! | Helper | Endpoint |
//! |--------|----------|
//! | [`stock_info`](ApiClient::stock_info) | `GET /api/stock/{ticker}/info` |
//! | [`earnings_calendar`](ApiClient::earnings_calendar) | `GET /api/earnings/calendar` |
//! | [`options_flow`](ApiClient::options_flow) | `GET /api/stock/{ticker}/options-flow` |
//! | [`net_premium_ticks`](ApiClient::net_premium_ticks) | `GET /api/stock/{ticker}/net-prem-ticks` |
//! | [`insider_trades`](ApiClient::insider_trades) | `GET /api/insider/transactions` |
//! | [`market_overview`](ApiClient::market_overview) | `GET /api/market/overview` |
//! | [`sector_performance`](ApiClient::sector_performance) | `GET /api/market/{sector}/sector-tide` |

use std::collections::{BTreeMap, HashMap};

use crate::api_client::{ApiClient, ApiRequest, ApiResult, ErrorKind};
use crate::cache::CacheMode;

pub const DEFAULT_EARNINGS_LIMIT: u32 = 50;
pub const DEFAULT_OPTIONS_FLOW_LIMIT: u32 = 100;
pub const DEFAULT_INSIDER_LIMIT: u32 = 50;

/// Dataset names shared by the endpoint helpers, the pipeline and the persistence sink.
pub mod dataset {
    pub const STOCK_INFO: &str = "stock_info";
    pub const EARNINGS: &str = "earnings_data";
    pub const OPTIONS_FLOW: &str = "options_flow";
    pub const NET_PREMIUM: &str = "net_premium";
    pub const INSIDER_TRADES: &str = "insider_trades";
    pub const ANALYSIS: &str = "analysis_results";
}

pub fn stock_info_request(ticker: &str) -> ApiRequest {
    ApiRequest::get(format!("/api/stock/{ticker}/info"))
}

pub fn earnings_calendar_request(date: Option<&str>, limit: u32) -> ApiRequest {
    ApiRequest::get("/api/earnings/calendar")
        .with_param("limit", limit)
        .with_optional_param("date", date)
}

pub fn options_flow_request(ticker: &str, date: Option<&str>, limit: u32) -> ApiRequest {
    ApiRequest::get(format!("/api/stock/{ticker}/options-flow"))
        .with_param("limit", limit)
        .with_optional_param("date", date)
}

pub fn net_premium_ticks_request(ticker: &str, date: Option<&str>) -> ApiRequest {
    ApiRequest::get(format!("/api/stock/{ticker}/net-prem-ticks")).with_optional_param("date", date)
}

pub fn insider_trades_request(ticker: &str, limit: u32) -> ApiRequest {
    ApiRequest::get("/api/insider/transactions")
        .with_param("ticker_symbol", ticker)
        .with_param("limit", limit)
}

impl ApiClient {
    pub async fn stock_info(&self, ticker: &str) -> ApiResult {
        self.request(stock_info_request(ticker)).await
    }

    pub async fn earnings_calendar(&self, date: Option<&str>, limit: u32) -> ApiResult {
        self.request(earnings_calendar_request(date, limit)).await
    }

    pub async fn options_flow(&self, ticker: &str, date: Option<&str>, limit: u32) -> ApiResult {
        self.request(options_flow_request(ticker, date, limit)).await
    }

    pub async fn net_premium_ticks(&self, ticker: &str, date: Option<&str>) -> ApiResult {
        self.request(net_premium_ticks_request(ticker, date)).await
    }

    pub async fn insider_trades(&self, ticker: &str, limit: u32) -> ApiResult {
        self.request(insider_trades_request(ticker, limit)).await
    }

    pub async fn market_overview(&self) -> ApiResult {
        self.request(ApiRequest::get("/api/market/overview")).await
    }

    pub async fn sector_performance(&self, sector: &str) -> ApiResult {
        self.request(ApiRequest::get(format!("/api/market/{sector}/sector-tide")))
            .await
    }

    /// Stock info for every ticker, fetched concurrently.
    pub async fn multiple_stock_data(
        &self,
        tickers: &[String],
        cache_mode: CacheMode,
    ) -> HashMap<String, ApiResult> {
        self.request_many(tickers.iter().cloned(), move |client, ticker| async move {
            client
                .request(stock_info_request(&ticker).with_cache_mode(cache_mode))
                .await
        })
        .await
    }

    /// Raw per-ticker dataset fan-out: stock info always, options flow and net premium
    /// when `include_options`, insider trades when `include_insider`.
    pub async fn batch_earnings_analysis(
        &self,
        tickers: &[String],
        include_options: bool,
        include_insider: bool,
    ) -> HashMap<String, BTreeMap<&'static str, ApiResult>> {
        let mut plan: Vec<(String, &'static str, ApiRequest)> = Vec::new();
        for ticker in tickers {
            plan.push((ticker.clone(), dataset::STOCK_INFO, stock_info_request(ticker)));
            if include_options {
                plan.push((
                    ticker.clone(),
                    dataset::OPTIONS_FLOW,
                    options_flow_request(ticker, None, DEFAULT_OPTIONS_FLOW_LIMIT),
                ));
                plan.push((
                    ticker.clone(),
                    dataset::NET_PREMIUM,
                    net_premium_ticks_request(ticker, None),
                ));
            }
            if include_insider {
                plan.push((
                    ticker.clone(),
                    dataset::INSIDER_TRADES,
                    insider_trades_request(ticker, DEFAULT_INSIDER_LIMIT),
                ));
            }
        }

        let requests: Vec<ApiRequest> = plan.iter().map(|(_, _, request)| request.clone()).collect();
        let mut outcomes = self
            .request_many(0..plan.len(), move |client, index| {
                let request = requests.get(index).cloned();
                async move {
                    match request {
                        Some(request) => client.request(request).await,
                        None => ApiResult::failure(
                            ErrorKind::Unknown,
                            format!("no request planned for slot {index}"),
                            None,
                            String::new(),
                        ),
                    }
                }
            })
            .await;

        let mut results: HashMap<String, BTreeMap<&'static str, ApiResult>> = HashMap::new();
        for (index, (ticker, name, _)) in plan.into_iter().enumerate() {
            if let Some(result) = outcomes.remove(&index) {
                results.entry(ticker).or_default().insert(name, result);
            }
        }
        results
    }
}
