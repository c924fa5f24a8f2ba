//! Behavior-driven tests for the upstream API client
//!
//! These tests verify HOW requests are classified, cached and fanned out,
//! using a scripted transport instead of the network.

mod support;

use std::sync::Arc;
use std::time::Duration;

use flowlens_core::{
    dataset, ApiClient, ApiRequest, CacheMode, ErrorKind, HttpError, ScriptedHttpClient,
    StaticCredentialProvider,
};
use support::{client_with, config, json, status};

// =============================================================================
// Outcome Classification
// =============================================================================

#[tokio::test]
async fn when_upstream_rejects_the_token_result_is_auth_failure() {
    // Given: An upstream that answers 401
    let http = Arc::new(ScriptedHttpClient::new().with_rule("/info", status(401, "unauthorized")));
    let client = client_with(http, 0.0);

    // When: Stock info is requested
    let result = client.stock_info("AAPL").await;

    // Then: The failure is classified as Auth with the status preserved
    assert!(!result.is_success());
    assert_eq!(result.error_kind(), Some(ErrorKind::Auth));
    assert_eq!(result.status_code(), Some(401));
    assert!(result.payload().is_none());
}

#[tokio::test]
async fn when_upstream_throttles_result_is_rate_limit_failure() {
    // Given: An upstream that answers 429
    let http = Arc::new(ScriptedHttpClient::new().with_rule("/market", status(429, "")));
    let client = client_with(http, 0.0);

    // When: The market overview is requested
    let result = client.market_overview().await;

    // Then: The failure is RateLimit and is not retried
    assert_eq!(result.error_kind(), Some(ErrorKind::RateLimit));
}

#[tokio::test]
async fn when_transport_times_out_result_is_timeout_failure() {
    // Given: A transport that reports a timeout
    let http = Arc::new(
        ScriptedHttpClient::new().with_rule("/", Err(HttpError::timeout("deadline exceeded"))),
    );
    let client = client_with(http, 0.0);

    // When: Any endpoint is requested
    let result = client.market_overview().await;

    // Then: The failure is Timeout
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(result.status_code().is_none());
}

#[tokio::test(start_paused = true)]
async fn when_upstream_is_slower_than_the_configured_timeout_result_is_timeout() {
    // Given: A transport slower than the 30 second default timeout
    let http = Arc::new(ScriptedHttpClient::new().with_latency(Duration::from_secs(45)));
    let client = client_with(http, 0.0);

    // When: A request is issued
    let result = client.market_overview().await;

    // Then: The client gives up and reports Timeout
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn when_connection_is_refused_result_is_network_failure() {
    // Given: A transport that cannot connect
    let http = Arc::new(ScriptedHttpClient::new().with_rule("/", Err(HttpError::connect("refused"))));
    let client = client_with(http, 0.0);

    // When: A request is issued
    let result = client.stock_info("MSFT").await;

    // Then: The failure is Network
    assert_eq!(result.error_kind(), Some(ErrorKind::Network));
}

#[tokio::test]
async fn when_success_body_is_not_json_result_is_data_failure() {
    // Given: A 200 response with an HTML body
    let http = Arc::new(ScriptedHttpClient::new().with_rule("/", json("<html>oops</html>")));
    let client = client_with(http, 0.0);

    // When: A request is issued
    let result = client.stock_info("MSFT").await;

    // Then: The failure is Data
    assert_eq!(result.error_kind(), Some(ErrorKind::Data));
    assert_eq!(result.status_code(), Some(200));
}

#[tokio::test]
async fn when_upstream_returns_server_error_message_carries_status_and_body() {
    // Given: A 503 with a maintenance page
    let http = Arc::new(ScriptedHttpClient::new().with_rule("/", status(503, "maintenance")));
    let client = client_with(http, 0.0);

    // When: A request is issued
    let result = client.stock_info("MSFT").await;

    // Then: The failure is Data and the message mentions status and body
    assert_eq!(result.error_kind(), Some(ErrorKind::Data));
    let message = result.error_message().expect("message");
    assert!(message.contains("503") && message.contains("maintenance"));
}

#[tokio::test]
async fn when_success_body_is_empty_result_is_data_error_and_not_cached() {
    // Given: A 200 with an empty body
    let http = Arc::new(ScriptedHttpClient::new().with_rule("/", json("")));
    let client = client_with(http.clone(), 0.0);

    // When: The same read is issued twice
    let first = client.market_overview().await;
    let second = client.market_overview().await;

    // Then: Both fail as data errors and each one reached the network
    assert_eq!(first.error_kind(), Some(ErrorKind::Data));
    assert!(first.payload().is_none());
    assert!(!second.is_cached());
    assert_eq!(http.dispatch_count(), 2);
}

#[tokio::test]
async fn when_status_is_2xx_but_not_200_result_is_data_error() {
    // Given: A 204 with no body
    let http = Arc::new(ScriptedHttpClient::new().with_rule("/", status(204, "")));
    let client = client_with(http, 0.0);

    // When: A request is issued
    let result = client.market_overview().await;

    // Then: It is reported as an API error carrying the status
    assert_eq!(result.error_kind(), Some(ErrorKind::Data));
    assert_eq!(result.status_code(), Some(204));
    assert_eq!(result.error_message(), Some("API error 204: "));
}

// =============================================================================
// Caching
// =============================================================================

#[tokio::test]
async fn when_same_read_is_repeated_second_is_served_from_cache() {
    // Given: A client with caching enabled
    let http = Arc::new(
        ScriptedHttpClient::new().with_rule("/info", json(r#"{"ticker":"AAPL","sector":"Tech"}"#)),
    );
    let client = client_with(http.clone(), 0.0);

    // When: The same read is issued twice
    let first = client.stock_info("AAPL").await;
    let second = client.stock_info("AAPL").await;

    // Then: The second result is a cache hit with an identical payload
    assert!(first.is_success() && !first.is_cached());
    assert!(second.is_success() && second.is_cached());
    assert_eq!(first.payload(), second.payload());
    assert_ne!(first.request_id(), second.request_id());

    // And: Neither the transport nor the limiter saw the second call
    assert_eq!(http.dispatch_count(), 1);
    assert_eq!(client.rate_limiter().acquisitions(), 1);
}

#[tokio::test]
async fn when_params_are_given_in_different_order_cache_entry_is_shared() {
    // Given: A client with caching enabled
    let http = Arc::new(ScriptedHttpClient::new());
    let client = client_with(http.clone(), 0.0);

    // When: Two logically identical reads differ only in parameter order
    let forward = ApiRequest::get("/api/earnings/calendar")
        .with_param("date", "2025-01-15")
        .with_param("limit", 50);
    let reverse = ApiRequest::get("/api/earnings/calendar")
        .with_param("limit", 50)
        .with_param("date", "2025-01-15");
    client.request(forward).await;
    let second = client.request(reverse).await;

    // Then: Only one dispatch happens
    assert!(second.is_cached());
    assert_eq!(http.dispatch_count(), 1);
}

#[tokio::test]
async fn when_cache_is_bypassed_every_read_dispatches_and_nothing_is_stored() {
    // Given: A client with caching enabled
    let http = Arc::new(ScriptedHttpClient::new());
    let client = client_with(http.clone(), 0.0);

    // When: The same read is issued twice with the cache bypassed
    let request = ApiRequest::get("/api/market/overview").bypass_cache();
    client.request(request.clone()).await;
    let second = client.request(request).await;

    // Then: Both calls dispatch and the cache stays empty
    assert!(!second.is_cached());
    assert_eq!(http.dispatch_count(), 2);
    assert!(client.cache().is_empty());
}

#[tokio::test]
async fn when_refresh_mode_is_used_fresh_response_replaces_cached_one() {
    // Given: A cached overview
    let http = Arc::new(ScriptedHttpClient::new());
    let client = client_with(http.clone(), 0.0);
    client.market_overview().await;

    // When: The overview is fetched in refresh mode and then normally
    let refreshed = client
        .request(ApiRequest::get("/api/market/overview").with_cache_mode(CacheMode::Refresh))
        .await;
    let cached = client.market_overview().await;

    // Then: Refresh dispatched, the follow-up read is a hit
    assert!(!refreshed.is_cached());
    assert!(cached.is_cached());
    assert_eq!(http.dispatch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn when_ttl_elapses_cached_read_is_fetched_again() {
    // Given: A read cached for two seconds
    let http = Arc::new(ScriptedHttpClient::new());
    let client = client_with(http.clone(), 0.0);
    let request = ApiRequest::get("/api/market/overview").with_ttl(Duration::from_secs(2));
    client.request(request.clone()).await;

    // When: Three seconds pass and the read is repeated
    tokio::time::advance(Duration::from_secs(3)).await;
    let result = client.request(request).await;

    // Then: The entry expired and the read went upstream
    assert!(!result.is_cached());
    assert_eq!(http.dispatch_count(), 2);
}

#[tokio::test]
async fn when_read_fails_nothing_is_cached() {
    // Given: An upstream that fails once with 500
    let http = Arc::new(ScriptedHttpClient::new().with_rule("/info", status(500, "boom")));
    let client = client_with(http.clone(), 0.0);

    // When: The read is issued
    client.stock_info("AAPL").await;

    // Then: The failure is not memoized
    assert!(client.cache().is_empty());
}

// =============================================================================
// Credentials
// =============================================================================

#[tokio::test]
async fn when_token_is_configured_requests_carry_bearer_header() {
    // Given: A client with a static token
    let http = Arc::new(ScriptedHttpClient::new());
    let client = ApiClient::builder(config(0.0))
        .http_client(http.clone())
        .credentials(Arc::new(StaticCredentialProvider::new("secret-token")))
        .build()
        .expect("client");

    // When: A request is issued
    client.market_overview().await;

    // Then: The authorization header holds the bearer token
    let sent = http.dispatched();
    assert_eq!(
        sent[0].headers.get("authorization").map(String::as_str),
        Some("Bearer secret-token")
    );
}

#[tokio::test]
async fn when_no_token_is_configured_request_still_succeeds_without_header() {
    // Given: A client without credentials
    let http = Arc::new(ScriptedHttpClient::new());
    let client = client_with(http.clone(), 0.0);

    // When: A request is issued
    let result = client.market_overview().await;

    // Then: It succeeds and sends no authorization header
    assert!(result.is_success());
    assert!(!http.dispatched()[0].headers.contains_key("authorization"));
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn when_one_entity_fails_in_request_many_others_are_unaffected() {
    // Given: An upstream where one ticker is unknown
    let http = Arc::new(
        ScriptedHttpClient::new()
            .with_rule("/stock/BAD/", status(404, "unknown ticker"))
            .with_rule("/info", json(r#"{"ok":true}"#)),
    );
    let client = client_with(http, 0.0);
    let tickers: Vec<String> = ["AAPL", "BAD", "MSFT"].map(String::from).to_vec();

    // When: Stock info is fetched for all tickers at once
    let results = client.multiple_stock_data(&tickers, CacheMode::Use).await;

    // Then: Each ticker has its own outcome
    assert_eq!(results.len(), 3);
    assert!(results["AAPL"].is_success());
    assert!(results["MSFT"].is_success());
    assert_eq!(results["BAD"].error_kind(), Some(ErrorKind::Data));
}

#[tokio::test]
async fn when_a_per_entity_task_panics_only_that_entity_is_unknown() {
    // Given: A per-entity request that panics for one key
    let http = Arc::new(ScriptedHttpClient::new());
    let client = client_with(http, 0.0);

    // When: The fan-out collects results
    let results = client
        .request_many(["AAPL", "CRASH", "MSFT"], |client, ticker| async move {
            if ticker == "CRASH" {
                panic!("per-entity request blew up");
            }
            client.stock_info(ticker).await
        })
        .await;

    // Then: The panicking entity is Unknown and the others succeed
    assert_eq!(results["CRASH"].error_kind(), Some(ErrorKind::Unknown));
    assert!(results["AAPL"].is_success());
    assert!(results["MSFT"].is_success());
}

#[tokio::test]
async fn when_batch_earnings_analysis_runs_each_ticker_gets_requested_datasets() {
    // Given: A healthy upstream
    let http = Arc::new(ScriptedHttpClient::new());
    let client = client_with(http.clone(), 0.0);
    let tickers = vec![String::from("AAPL"), String::from("NVDA")];

    // When: Options data is requested without insider trades
    let results = client.batch_earnings_analysis(&tickers, true, false).await;

    // Then: Each ticker has stock info, options flow and net premium only
    for ticker in &tickers {
        let datasets = &results[ticker];
        let names: Vec<&str> = datasets.keys().copied().collect();
        assert_eq!(
            names,
            vec![dataset::NET_PREMIUM, dataset::OPTIONS_FLOW, dataset::STOCK_INFO]
        );
        assert!(datasets.values().all(|result| result.is_success()));
    }
    assert_eq!(http.dispatch_count(), 6);
}
