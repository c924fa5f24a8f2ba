use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// HTTP verbs the API client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Reads are the only requests eligible for caching.
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Get)
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication strategy applied to outgoing HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    BearerToken(String),
}

impl HttpAuth {
    pub fn from_token(token: Option<String>) -> Self {
        token.map_or(Self::None, Self::BearerToken)
    }

    pub fn apply(&self, headers: &mut BTreeMap<String, String>) {
        match self {
            Self::None => {}
            Self::BearerToken(token) => {
                headers.insert(String::from("authorization"), format!("Bearer {token}"));
            }
        }
    }
}

/// HTTP request envelope handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout_ms: u64,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout_ms: 30_000,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Append percent-encoded query parameters to the URL.
    pub fn with_query(mut self, params: &BTreeMap<String, String>) -> Self {
        if params.is_empty() {
            return self;
        }
        let query = params
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        let separator = if self.url.contains('?') { '&' } else { '?' };
        self.url = format!("{}{separator}{query}", self.url);
        self
    }

    pub fn with_json_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self.headers
            .insert(String::from("content-type"), String::from("application/json"));
        self
    }

    pub fn with_auth(mut self, auth: &HttpAuth) -> Self {
        auth.apply(&mut self.headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// HTTP response envelope returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Transport failure category, decided before any HTTP status exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    /// The request or body read exceeded its deadline.
    Timeout,
    /// Connection refused, DNS failure, reset mid-flight.
    Connect,
    /// Anything the transport could not attribute.
    Other,
}

/// Transport-level HTTP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    kind: HttpErrorKind,
    message: String,
}

impl HttpError {
    pub fn new(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Connect, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Other, message)
    }

    pub const fn kind(&self) -> HttpErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

/// Transport contract used by the API client.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;
}

/// Production transport backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new(user_agent: &str) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .pool_max_idle_per_host(30)
            .build()
            .map_err(|e| HttpError::other(format!("failed to build http client: {e}")))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

fn classify_reqwest_error(context: &str, error: &reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::timeout(format!("{context} timed out: {error}"))
    } else if error.is_connect() || error.is_request() || error.is_body() {
        HttpError::connect(format!("{context} failed: {error}"))
    } else {
        HttpError::other(format!("{context} failed: {error}"))
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let method = match request.method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
                HttpMethod::Delete => reqwest::Method::DELETE,
            };
            let mut builder = self
                .client
                .request(method, &request.url)
                .timeout(Duration::from_millis(request.timeout_ms));

            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| classify_reqwest_error("request", &e))?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| classify_reqwest_error("reading response body", &e))?;

            Ok(HttpResponse { status, body })
        })
    }
}

/// Canned reply for [`ScriptedHttpClient`].
pub type ScriptedReply = Result<HttpResponse, HttpError>;

#[derive(Debug, Clone)]
struct ScriptedRule {
    fragment: String,
    reply: ScriptedReply,
    delay: Option<Duration>,
}

/// Offline transport that answers from URL-matched rules.
///
/// Rules are checked in insertion order; the first rule whose fragment occurs in the
/// request URL wins. Unmatched requests get `200 {}`. Every dispatch is recorded.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    rules: Mutex<Vec<ScriptedRule>>,
    latency: Option<Duration>,
    dispatched: Mutex<Vec<HttpRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `latency` (honours tokio's paused clock).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_rule(self, url_fragment: impl Into<String>, reply: ScriptedReply) -> Self {
        self.push_rule(url_fragment, reply);
        self
    }

    /// Like [`with_rule`](Self::with_rule), but the matching reply is held back by `delay`
    /// on top of any global latency.
    pub fn with_delayed_rule(
        self,
        url_fragment: impl Into<String>,
        delay: Duration,
        reply: ScriptedReply,
    ) -> Self {
        lock(&self.rules).push(ScriptedRule {
            fragment: url_fragment.into(),
            reply,
            delay: Some(delay),
        });
        self
    }

    pub fn push_rule(&self, url_fragment: impl Into<String>, reply: ScriptedReply) {
        lock(&self.rules).push(ScriptedRule {
            fragment: url_fragment.into(),
            reply,
            delay: None,
        });
    }

    pub fn dispatch_count(&self) -> usize {
        lock(&self.dispatched).len()
    }

    pub fn dispatched(&self) -> Vec<HttpRequest> {
        lock(&self.dispatched).clone()
    }

    /// Highest number of requests observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn reply_for(&self, url: &str) -> (ScriptedReply, Option<Duration>) {
        lock(&self.rules)
            .iter()
            .find(|rule| url.contains(rule.fragment.as_str()))
            .map(|rule| (rule.reply.clone(), rule.delay))
            .unwrap_or_else(|| (Ok(HttpResponse::ok_json("{}")), None))
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let (reply, delay) = self.reply_for(&request.url);
            lock(&self.dispatched).push(request);

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            let wait = self.latency.unwrap_or_default() + delay.unwrap_or_default();
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            reply
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
