//! # Flowlens Core
//!
//! Rate-limited, cached client for the Unusual Whales API plus concurrent
//! per-ticker analysis runs on top of it.
//!
//! ## Overview
//!
//! - **One outbound rate budget** shared by every caller through an injected [`RateLimiter`]
//! - **TTL response cache** with canonical keys, shared the same way
//! - **Classified outcomes**: upstream failures are [`ApiResult`] values with an [`ErrorKind`]
//! - **Analysis pipeline** with cooperative cancellation and progress events
//! - **Orchestrator** allowing one run per ticker and bounded batch fan-out
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api_client`] | Request flow, classification and concurrent fan-out |
//! | [`cache`] | TTL cache, canonical keys, cache modes |
//! | [`config`] | Client configuration from defaults, file and environment |
//! | [`credentials`] | Bearer token providers |
//! | [`endpoints`] | Typed helpers for the endpoints the pipeline reads |
//! | [`entity`] | Validated ticker keys |
//! | [`error`] | Error types |
//! | [`events`] | Progress records and the event bus |
//! | [`http_client`] | Transport abstraction (reqwest and a scripted offline client) |
//! | [`orchestrator`] | Active-run registry, cancellation and batches |
//! | [`pipeline`] | The per-ticker step sequence |
//! | [`rate_limiter`] | Minimum-interval dispatch limiter |
//! | [`sink`] | Persistence contract for published datasets |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flowlens_core::{
//!     AnalysisPipeline, ApiClient, ClientConfig, EventBus, MemorySink, Orchestrator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::from_env()?;
//!     let client = ApiClient::builder(config.clone()).build()?;
//!     let pipeline = AnalysisPipeline::new(client, Arc::new(MemorySink::new()), EventBus::default());
//!     let orchestrator = Orchestrator::new(pipeline, &config.batch);
//!
//!     let outcomes = orchestrator.run_batch(&["AAPL", "MSFT"], 2).await;
//!     println!("{outcomes:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │  Orchestrator   │────▶│    EventBus      │
//! └────────┬────────┘     └──────────────────┘
//!          │                        ▲
//!          ▼                        │
//! ┌─────────────────┐     ┌──────────────────┐
//! │ AnalysisPipeline│────▶│ PersistenceSink  │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │   ApiClient     │────▶│ RateLimiter      │
//! │                 │────▶│ ResponseCache    │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ HttpClient      │
//! │ (reqwest)       │
//! └─────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Upstream calls never return `Err`; inspect the result instead:
//!
//! ```rust
//! use flowlens_core::{ApiResult, ErrorKind};
//!
//! fn describe(result: &ApiResult) -> &'static str {
//!     match result.error_kind() {
//!         None => "ok",
//!         Some(ErrorKind::RateLimit) => "slow down",
//!         Some(ErrorKind::Auth) => "check the API token",
//!         Some(_) => "upstream failure",
//!     }
//! }
//! ```
//!
//! ## Security
//!
//! - The API token comes from a [`CredentialProvider`] and is never logged

pub mod api_client;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod endpoints;
pub mod entity;
pub mod error;
pub mod events;
pub mod http_client;
pub mod orchestrator;
pub mod pipeline;
pub mod rate_limiter;
pub mod sink;

// Client
pub use api_client::{ApiClient, ApiClientBuilder, ApiRequest, ApiResult, ErrorKind};

// Caching
pub use cache::{cache_key, CacheMode, ResponseCache};

// Configuration
pub use config::{ApiConfig, BatchConfig, CacheConfig, ClientConfig, DEFAULT_BASE_URL};

// Credentials
pub use credentials::{
    CredentialProvider, EnvCredentialProvider, NoCredentials, StaticCredentialProvider,
};

pub use endpoints::dataset;

pub use entity::EntityKey;

// Error types
pub use error::{ConfigError, OrchestratorError, PipelineError, ValidationError};

// Events
pub use events::{AnalysisEvent, AnalysisProgress, AnalysisStatus, EventBus, ProgressSink};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpMethod, HttpRequest, HttpResponse,
    ReqwestHttpClient, ScriptedHttpClient, ScriptedReply,
};

// Orchestration
pub use orchestrator::{Orchestrator, RunOutcome};
pub use pipeline::{
    AnalysisPipeline, AnalysisReport, Analyzer, CancellationToken, DatasetSummaryAnalyzer,
    PipelineOutcome, ProgressTracker, RunOptions, TOTAL_STEPS,
};

pub use rate_limiter::RateLimiter;

pub use sink::{MemorySink, NullSink, PersistenceSink};
