//! Bearer token sources for upstream requests.

use std::env;

/// Supplies the bearer token attached to outgoing requests.
///
/// A missing token is not an error: the request is still sent and may come
/// back as an auth failure.
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Reads the token from `FLOWLENS_API_TOKEN`, falling back to `UNUSUAL_WHALES_API_KEY`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn token(&self) -> Option<String> {
        env::var("FLOWLENS_API_TOKEN")
            .ok()
            .and_then(non_blank)
            .or_else(|| env::var("UNUSUAL_WHALES_API_KEY").ok().and_then(non_blank))
    }
}

/// Fixed token, mostly useful for tests and embedding.
#[derive(Clone)]
pub struct StaticCredentialProvider {
    token: String,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentialProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn token(&self) -> Option<String> {
        non_blank(self.token.clone())
    }
}

/// Never supplies a token.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn token(&self) -> Option<String> {
        None
    }
}

fn non_blank(token: String) -> Option<String> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}
