//! Upstream API client.
//!
//! [`ApiClient::request`] turns one logical read or write into a classified
//! [`ApiResult`]. Upstream failures are never returned as `Err`: every outcome,
//! including transport errors and timeouts, is an `ApiResult` carrying an
//! [`ErrorKind`].
//!
//! # Request flow
//!
//! | Step | Reads (`GET`) | Writes |
//! |------|---------------|--------|
//! | Cache lookup | when the [`CacheMode`] reads | never |
//! | Rate limiter | on cache miss | always |
//! | Dispatch | bounded by the configured timeout | same |
//! | Cache store | on success, when the mode writes | never |

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::cache::{cache_key, CacheMode, ResponseCache};
use crate::config::ClientConfig;
use crate::credentials::{CredentialProvider, EnvCredentialProvider};
use crate::http_client::{
    HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpMethod, HttpRequest, HttpResponse,
    ReqwestHttpClient,
};
use crate::rate_limiter::RateLimiter;
use crate::ConfigError;

/// Failure taxonomy for upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Auth,
    RateLimit,
    /// Malformed payload or a non-2xx application error.
    Data,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "api.network",
            Self::Auth => "api.auth",
            Self::RateLimit => "api.rate_limit",
            Self::Data => "api.data",
            Self::Timeout => "api.timeout",
            Self::Unknown => "api.unknown",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of one upstream call.
///
/// `success` holds exactly when a payload is present and no error kind is set;
/// the constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResult {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    cached: bool,
    request_id: String,
}

impl ApiResult {
    pub fn ok(payload: Value, status_code: Option<u16>, request_id: impl Into<String>) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error_message: None,
            error_kind: None,
            status_code,
            cached: false,
            request_id: request_id.into(),
        }
    }

    pub fn cache_hit(payload: Value, request_id: impl Into<String>) -> Self {
        Self {
            cached: true,
            ..Self::ok(payload, None, request_id)
        }
    }

    pub fn failure(
        kind: ErrorKind,
        message: impl Into<String>,
        status_code: Option<u16>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            payload: None,
            error_message: Some(message.into()),
            error_kind: Some(kind),
            status_code,
            cached: false,
            request_id: request_id.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.success
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<Value> {
        self.payload
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub const fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub const fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub const fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// A logical request before canonicalization and dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub params: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Cache lifetime for this read; the configured default when absent.
    pub ttl: Option<Duration>,
    pub cache_mode: CacheMode,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
            body: None,
            ttl: None,
            cache_mode: CacheMode::Use,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, endpoint)
    }

    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, endpoint).with_body(body)
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn with_optional_param(self, name: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.with_param(name, value),
            None => self,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn bypass_cache(self) -> Self {
        self.with_cache_mode(CacheMode::Bypass)
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.endpoint, &self.params)
    }
}

struct ClientInner {
    base_url: String,
    timeout: Duration,
    default_ttl: Duration,
    http: Arc<dyn HttpClient>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    credentials: Arc<dyn CredentialProvider>,
    request_counter: AtomicU64,
}

/// Cheaply cloneable handle; clones share the limiter, cache and request counter.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url)
            .field("timeout", &self.inner.timeout)
            .field("min_interval", &self.inner.limiter.min_interval())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ApiClient`]; unset collaborators are derived from the config.
pub struct ApiClientBuilder {
    config: ClientConfig,
    http: Option<Arc<dyn HttpClient>>,
    limiter: Option<Arc<RateLimiter>>,
    cache: Option<Arc<ResponseCache>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl ApiClientBuilder {
    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn build(self) -> Result<ApiClient, ConfigError> {
        self.config.validate()?;
        let api = &self.config.api;

        let http = match self.http {
            Some(http) => http,
            None => Arc::new(
                ReqwestHttpClient::new(&api.user_agent)
                    .map_err(|e| ConfigError::Transport(e.to_string()))?,
            ),
        };
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::new(api.rate_limit_per_second)));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ResponseCache::from_config(&self.config.cache)));
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(EnvCredentialProvider));

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                base_url: api.base_url.trim_end_matches('/').to_owned(),
                timeout: api.timeout(),
                default_ttl: self.config.cache.default_ttl(),
                http,
                limiter,
                cache,
                credentials,
                request_counter: AtomicU64::new(0),
            }),
        })
    }
}

impl ApiClient {
    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            http: None,
            limiter: None,
            cache: None,
            credentials: None,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    fn next_request_id(&self) -> String {
        let counter = self.inner.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "req_{counter}_{}",
            OffsetDateTime::now_utc().unix_timestamp()
        )
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.inner.base_url,
            endpoint.trim_start_matches('/')
        )
    }

    /// Issue one request, applying cache, rate limit and classification.
    pub async fn request(&self, request: ApiRequest) -> ApiResult {
        let request_id = self.next_request_id();
        let key = (request.method.is_read() && self.inner.cache.is_enabled())
            .then(|| request.cache_key());

        if request.cache_mode.reads() {
            if let Some(payload) = key.as_deref().and_then(|key| self.inner.cache.get(key)) {
                debug!(request_id = %request_id, endpoint = %request.endpoint, "cache hit");
                return ApiResult::cache_hit(payload, request_id);
            }
        }

        self.inner.limiter.acquire().await;

        let http_request = match self.build_http_request(&request) {
            Ok(http_request) => http_request,
            Err(message) => {
                error!(request_id = %request_id, endpoint = %request.endpoint, %message, "failed to build request");
                return ApiResult::failure(ErrorKind::Unknown, message, None, request_id);
            }
        };
        debug!(
            request_id = %request_id,
            method = %request.method,
            url = %http_request.url,
            "dispatching request"
        );

        let outcome =
            tokio::time::timeout(self.inner.timeout, self.inner.http.execute(http_request)).await;
        let result = match outcome {
            Ok(Ok(response)) => classify_response(response, &request_id),
            Ok(Err(transport)) => classify_transport_error(&transport, &request_id),
            Err(_) => {
                error!(request_id = %request_id, endpoint = %request.endpoint, "request timeout");
                ApiResult::failure(ErrorKind::Timeout, "Request timeout", None, request_id)
            }
        };

        if result.is_success() && request.cache_mode.writes() {
            if let (Some(key), Some(payload)) = (key, result.payload()) {
                let ttl = request.ttl.unwrap_or(self.inner.default_ttl);
                self.inner.cache.set(key, payload.clone(), Some(ttl));
            }
        }

        result
    }

    /// One concurrent request per entity. A task that dies is reported as an
    /// `Unknown` failure for that entity only.
    pub async fn request_many<K, I, F, Fut>(&self, entities: I, per_entity: F) -> HashMap<K, ApiResult>
    where
        I: IntoIterator<Item = K>,
        K: Clone + Eq + Hash + Display + Send + 'static,
        F: Fn(ApiClient, K) -> Fut,
        Fut: Future<Output = ApiResult> + Send + 'static,
    {
        let tasks: Vec<_> = entities
            .into_iter()
            .map(|entity| {
                let task = tokio::spawn(per_entity(self.clone(), entity.clone()));
                (entity, task)
            })
            .collect();

        let mut results = HashMap::with_capacity(tasks.len());
        for (entity, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(entity = %entity, error = %join_error, "request task failed");
                    ApiResult::failure(
                        ErrorKind::Unknown,
                        format!("request task failed: {join_error}"),
                        None,
                        self.next_request_id(),
                    )
                }
            };
            results.insert(entity, result);
        }
        results
    }

    fn build_http_request(&self, request: &ApiRequest) -> Result<HttpRequest, String> {
        let auth = HttpAuth::from_token(self.inner.credentials.token());
        let mut http_request = HttpRequest::new(request.method, self.url_for(&request.endpoint))
            .with_query(&request.params)
            .with_header("accept", "application/json")
            .with_auth(&auth)
            .with_timeout(self.inner.timeout);

        if let Some(body) = &request.body {
            let encoded = serde_json::to_string(body)
                .map_err(|e| format!("failed to encode request body: {e}"))?;
            http_request = http_request.with_json_body(encoded);
        }
        Ok(http_request)
    }
}

fn classify_response(response: HttpResponse, request_id: &str) -> ApiResult {
    let status = response.status;
    match status {
        401 => {
            error!(request_id, "authentication failed");
            ApiResult::failure(
                ErrorKind::Auth,
                "Authentication failed - check API token",
                Some(status),
                request_id,
            )
        }
        429 => {
            warn!(request_id, "rate limit exceeded");
            ApiResult::failure(
                ErrorKind::RateLimit,
                "Rate limit exceeded",
                Some(status),
                request_id,
            )
        }
        200 => serde_json::from_str::<Value>(&response.body)
            .map(|payload| ApiResult::ok(payload, Some(status), request_id))
            .unwrap_or_else(|e| {
                error!(request_id, error = %e, "invalid JSON response");
                ApiResult::failure(
                    ErrorKind::Data,
                    format!("Invalid JSON response: {e}"),
                    Some(status),
                    request_id,
                )
            }),
        _ => {
            error!(request_id, status, body = %response.body, "upstream API error");
            ApiResult::failure(
                ErrorKind::Data,
                format!("API error {status}: {}", response.body),
                Some(status),
                request_id,
            )
        }
    }
}

fn classify_transport_error(transport: &HttpError, request_id: &str) -> ApiResult {
    let (kind, message) = match transport.kind() {
        HttpErrorKind::Timeout => (ErrorKind::Timeout, String::from("Request timeout")),
        HttpErrorKind::Connect => (
            ErrorKind::Network,
            format!("Network error: {}", transport.message()),
        ),
        HttpErrorKind::Other => (
            ErrorKind::Unknown,
            format!("Unexpected error: {}", transport.message()),
        ),
    };
    error!(request_id, code = kind.code(), error = %transport, "transport failure");
    ApiResult::failure(kind, message, None, request_id)
}
