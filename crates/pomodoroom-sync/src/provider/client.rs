//! Shared HTTP plumbing for the Google adapters.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::wire::ListPage;
use crate::error::ProviderError;

/// Upper bound on pages followed by one `list_all`.
pub const MAX_PAGES: usize = 1000;

/// Supplies OAuth access tokens. Acquisition and refresh happen elsewhere.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, owner_id: &str) -> Result<String, ProviderError>;
}

/// Same token for every owner.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self, _owner_id: &str) -> Result<String, ProviderError> {
        Ok(self.token.clone())
    }
}

/// Reads the token from an environment variable on each call.
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn access_token(&self, _owner_id: &str) -> Result<String, ProviderError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(ProviderError::Permanent {
                status: Some(401),
                message: format!("no access token in ${}", self.var),
            }),
        }
    }
}

/// Build `{base}/{seg}/{seg}...` with each segment percent-encoded.
pub fn endpoint(base: &str, segments: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for segment in segments {
        url.push('/');
        url.push_str(&urlencoding::encode(segment));
    }
    url
}

/// Authenticated JSON client with status classification.
#[derive(Clone)]
pub struct GoogleClient {
    http: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl GoogleClient {
    pub fn new(tokens: Arc<dyn TokenProvider>, timeout: Duration) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pomodoroom-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::permanent(format!("http client: {e}")))?;
        Ok(Self { http, tokens })
    }

    async fn execute(
        &self,
        owner_id: &str,
        request: RequestBuilder,
    ) -> Result<Response, ProviderError> {
        let token = self.tokens.access_token(owner_id).await?;
        let resp = request.bearer_auth(token).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), &body, retry_after))
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ProviderError> {
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        owner_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let resp = self
            .execute(owner_id, self.http.get(url).query(query))
            .await?;
        Self::decode(resp).await
    }

    /// GET that maps 404/410 to `None`.
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        owner_id: &str,
        url: &str,
    ) -> Result<Option<T>, ProviderError> {
        match self.execute(owner_id, self.http.get(url)).await {
            Ok(resp) => Ok(Some(Self::decode(resp).await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        owner_id: &str,
        method: Method,
        url: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let resp = self
            .execute(owner_id, self.http.request(method, url).json(body))
            .await?;
        Self::decode(resp).await
    }

    /// DELETE that treats 404/410 as already gone.
    pub async fn delete(&self, owner_id: &str, url: &str) -> Result<(), ProviderError> {
        match self.execute(owner_id, self.http.delete(url)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(url, "delete target already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Follow `nextPageToken` until exhausted.
    ///
    /// A repeated token or more than [`MAX_PAGES`] pages is a permanent error.
    pub async fn list_all<T: DeserializeOwned>(
        &self,
        owner_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ProviderError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;
        let mut seen_tokens: HashSet<String> = HashSet::new();

        loop {
            let mut params: Vec<(&str, String)> = query.to_vec();
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let page: ListPage<T> = self.get_json(owner_id, url, &params).await?;
            pages += 1;
            items.extend(page.items);

            page_token = page.next_page_token.filter(|t| !t.is_empty());
            let Some(token) = &page_token else {
                break;
            };
            if !seen_tokens.insert(token.clone()) {
                return Err(ProviderError::permanent(format!(
                    "provider repeated page token '{token}' for {url}"
                )));
            }
            if pages >= MAX_PAGES {
                return Err(ProviderError::permanent(format!(
                    "gave up listing {url} after {MAX_PAGES} pages"
                )));
            }
        }

        debug!(url, pages, items = items.len(), "listed remote collection");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encodes_segments() {
        assert_eq!(
            endpoint("https://example.test/calendar/v3/", &["calendars", "me@example.com", "events"]),
            "https://example.test/calendar/v3/calendars/me%40example.com/events"
        );
    }

    #[tokio::test]
    async fn env_token_provider_reports_missing_token_as_permanent() {
        let provider = EnvTokenProvider::new("POMODOROOM_SYNC_TEST_TOKEN_THAT_IS_NEVER_SET");
        let err = provider.access_token("o1").await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn static_token_provider_returns_token() {
        let provider = StaticTokenProvider::new("abc");
        assert_eq!(provider.access_token("anyone").await.unwrap(), "abc");
    }
}
