//! HTTP access to the origin platform.
//!
//! Two requests are needed: the embed document (retried with exponential
//! backoff) and the structured post query (single attempt, used as a last
//! resort by the extractor).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::types::{FetchError, FetchResult};

pub const DEFAULT_BASE_URL: &str = "https://www.instagram.com";

/// Persisted query id for the single-post GraphQL call.
pub const POST_QUERY_DOC_ID: &str = "8845758582119845";

const POST_QUERY_FRIENDLY_NAME: &str = "PolarisPostActionLoadPostQueryQuery";

const DOCUMENT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko)";

const QUERY_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Source of raw post documents.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch the embed document for a post, retrying transient failures.
    async fn fetch_document(&self, post_id: &str) -> FetchResult<String>;

    /// Issue the structured post query and return the raw response body.
    async fn query_post(&self, post_id: &str) -> FetchResult<String>;
}

#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Scheme and host the embed document is fetched from.
    pub base_url: String,
    /// Full URL of the GraphQL endpoint.
    pub query_url: String,
    pub doc_id: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Total attempts for the embed document.
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub retry_backoff: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            query_url: format!("{DEFAULT_BASE_URL}/graphql/query/"),
            doc_id: POST_QUERY_DOC_ID.to_string(),
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl OriginConfig {
    /// Point both endpoints at another base URL (a mock server, a proxy).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        self.base_url = base.to_string();
        self.query_url = format!("{base}/graphql/query/");
        self
    }

    pub fn document_url(&self, post_id: &str) -> String {
        format!("{}/p/{post_id}/embed/captioned/", self.base_url)
    }
}

/// [`Origin`] backed by reqwest.
#[derive(Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
    config: OriginConfig,
}

impl HttpOrigin {
    pub fn new(config: OriginConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    pub fn config(&self) -> &OriginConfig {
        &self.config
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    async fn get_once(&self, url: &str) -> Result<String, String> {
        let resp = self
            .client
            .get(url)
            .headers(document_headers())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        resp.text().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch_document(&self, post_id: &str) -> FetchResult<String> {
        let url = self.config.document_url(post_id);
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.get_once(&url).await {
                Ok(body) => {
                    debug!(post_id, attempt, bytes = body.len(), "fetched embed document");
                    return Ok(body);
                }
                Err(e) => {
                    warn!(post_id, attempt, error = %e, "embed document request failed");
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(FetchError::Transport(format!(
            "embed document for {post_id} failed after {attempts} attempts: {last_error}"
        )))
    }

    async fn query_post(&self, post_id: &str) -> FetchResult<String> {
        let variables = serde_json::json!({
            "shortcode": post_id,
            "fetch_tagged_user_count": null,
            "hoisted_comment_id": null,
            "hoisted_reply_id": null,
        })
        .to_string();
        let form = [
            ("variables", variables.as_str()),
            ("server_timestamps", "true"),
            ("doc_id", self.config.doc_id.as_str()),
        ];

        let resp = self
            .client
            .post(&self.config.query_url)
            .headers(query_headers())
            .form(&form)
            .send()
            .await
            .map_err(|e| FetchError::Transport(format!("post query for {post_id}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Transport(format!(
                "post query for {post_id}: HTTP {}",
                status.as_u16()
            )));
        }
        resp.text()
            .await
            .map_err(|e| FetchError::Transport(format!("post query body for {post_id}: {e}")))
    }
}

fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for &(name, value) in pairs {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    headers
}

fn document_headers() -> HeaderMap {
    header_map(&[
        (
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8",
        ),
        ("accept-language", "en-US,en;q=0.9"),
        ("user-agent", DOCUMENT_USER_AGENT),
        ("sec-fetch-mode", "navigate"),
    ])
}

fn query_headers() -> HeaderMap {
    header_map(&[
        ("user-agent", QUERY_USER_AGENT),
        ("accept", "*/*"),
        ("accept-language", "en-US,en;q=0.5"),
        ("x-fb-friendly-name", POST_QUERY_FRIENDLY_NAME),
        ("origin", "https://www.instagram.com"),
        ("dnt", "1"),
        ("sec-gpc", "1"),
        ("sec-fetch-dest", "empty"),
        ("sec-fetch-mode", "cors"),
        ("sec-fetch-site", "same-origin"),
        ("pragma", "no-cache"),
        ("cache-control", "no-cache"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(server: &MockServer) -> OriginConfig {
        OriginConfig {
            timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(10),
            ..OriginConfig::default()
        }
        .with_base_url(&server.uri())
    }

    #[test]
    fn test_document_url() {
        let config = OriginConfig::default();
        assert_eq!(
            config.document_url("Cabc123"),
            "https://www.instagram.com/p/Cabc123/embed/captioned/"
        );
        let config = config.with_base_url("http://127.0.0.1:9000/");
        assert_eq!(config.query_url, "http://127.0.0.1:9000/graphql/query/");
    }

    #[test]
    fn test_backoff_doubles() {
        let origin = HttpOrigin::new(OriginConfig::default());
        assert_eq!(origin.backoff(1), Duration::from_millis(500));
        assert_eq!(origin.backoff(2), Duration::from_millis(1000));
        assert_eq!(origin.backoff(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_document_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p/Cabc123/embed/captioned/"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p/Cabc123/embed/captioned/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let origin = HttpOrigin::new(fast_config(&server));
        let body = origin.fetch_document("Cabc123").await.unwrap();
        assert_eq!(body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn test_document_gives_up_after_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p/Cabc123/embed/captioned/"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let origin = HttpOrigin::new(fast_config(&server));
        let err = origin.fetch_document("Cabc123").await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
    }

    #[tokio::test]
    async fn test_query_sends_form_and_friendly_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql/query/"))
            .and(header("x-fb-friendly-name", POST_QUERY_FRIENDLY_NAME))
            .and(body_string_contains("doc_id=8845758582119845"))
            .and(body_string_contains("server_timestamps=true"))
            .and(body_string_contains("Cabc123"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"data\":{}}"))
            .expect(1)
            .mount(&server)
            .await;

        let origin = HttpOrigin::new(fast_config(&server));
        let body = origin.query_post("Cabc123").await.unwrap();
        assert_eq!(body, "{\"data\":{}}");
    }
}
