//! Shared fixtures for the behaviour tests.
#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use flowlens_core::{
    AnalysisPipeline, ApiClient, ClientConfig, EventBus, HttpClient, HttpError, HttpRequest,
    HttpResponse, MemorySink, NoCredentials, Orchestrator, ScriptedHttpClient, ScriptedReply,
};
use tokio::time::Instant;

pub const BASE_URL: &str = "http://upstream.test";

pub fn config(rate_limit_per_second: f64) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.api.base_url = String::from(BASE_URL);
    config.api.rate_limit_per_second = rate_limit_per_second;
    config
}

/// Client over `http` with no credentials and the given request budget.
pub fn client_with(http: Arc<dyn HttpClient>, rate_limit_per_second: f64) -> ApiClient {
    ApiClient::builder(config(rate_limit_per_second))
        .http_client(http)
        .credentials(Arc::new(NoCredentials))
        .build()
        .expect("test client should build")
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub sink: Arc<MemorySink>,
    pub http: Arc<ScriptedHttpClient>,
}

/// Orchestrator over a scripted transport with throttling disabled.
pub fn harness(http: ScriptedHttpClient) -> Harness {
    let http = Arc::new(http);
    let client = client_with(http.clone(), 0.0);
    let sink = Arc::new(MemorySink::new());
    let pipeline = AnalysisPipeline::new(client, sink.clone(), EventBus::new(4096));
    let orchestrator = Orchestrator::new(pipeline, &config(0.0).batch);
    Harness {
        orchestrator,
        sink,
        http,
    }
}

pub fn json(body: &str) -> ScriptedReply {
    Ok(HttpResponse::ok_json(body))
}

pub fn status(code: u16, body: &str) -> ScriptedReply {
    Ok(HttpResponse::new(code, body))
}

/// Transport that records the virtual-clock instant of every dispatch.
#[derive(Debug, Default)]
pub struct TimestampingHttpClient {
    dispatched_at: Mutex<Vec<Instant>>,
}

impl TimestampingHttpClient {
    pub fn dispatch_times(&self) -> Vec<Instant> {
        let mut times = self.dispatched_at.lock().expect("lock").clone();
        times.sort();
        times
    }
}

impl HttpClient for TimestampingHttpClient {
    fn execute<'a>(
        &'a self,
        _request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            self.dispatched_at.lock().expect("lock").push(Instant::now());
            Ok(HttpResponse::ok_json("{}"))
        })
    }
}
