//! Looker REST API as a reporting source: client-credentials login, look search, look run.

use async_trait::async_trait;
use rws_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{ReportId, ReportSource, ResultFormat, SourceError};

#[derive(Debug, Clone)]
pub struct LookerConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_version: String,
}

impl LookerConfig {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_version: "4.0".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

pub struct LookerSource {
    config: LookerConfig,
    http: HttpFetcher,
    token: Mutex<Option<String>>,
}

impl LookerSource {
    pub fn new(config: LookerConfig, http: HttpFetcher) -> Self {
        Self {
            config,
            http,
            token: Mutex::new(None),
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version,
            path.trim_start_matches('/')
        )
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let mut token = self.token.lock().await;
        if let Some(existing) = token.as_ref() {
            return Ok(existing.clone());
        }

        let url = self.api_url("login");
        let resp = self
            .http
            .post_form(
                &url,
                &[
                    ("client_id", self.config.client_id.as_str()),
                    ("client_secret", self.config.client_secret.as_str()),
                ],
            )
            .await
            .map_err(map_fetch_error)?;
        let login: LoginResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| SourceError::Auth(format!("unreadable login response: {e}")))?;
        info!(base_url = %self.config.base_url, "authenticated against reporting source");

        *token = Some(login.access_token.clone());
        Ok(login.access_token)
    }

    async fn authorized_get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<u8>, SourceError> {
        let token = self.access_token().await?;
        match self.http.get_bytes(url, query, Some(&token)).await {
            Ok(resp) => Ok(resp.body),
            Err(err) => {
                if err.status() == Some(401) {
                    // Expired session; the next call logs in again.
                    self.token.lock().await.take();
                }
                Err(map_fetch_error(err))
            }
        }
    }
}

#[async_trait]
impl ReportSource for LookerSource {
    async fn search(&self, name: &str) -> Result<Vec<ReportId>, SourceError> {
        let url = self.api_url("looks/search");
        let body = self
            .authorized_get(&url, &[("title", name), ("fields", "id")])
            .await?;
        let ids = parse_search_response(&body)?;
        debug!(report = name, matches = ids.len(), "searched looks");
        Ok(ids)
    }

    async fn run(&self, id: &ReportId, format: ResultFormat) -> Result<Vec<u8>, SourceError> {
        if id.as_str().is_empty() || !id.as_str().chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SourceError::Rejected(format!("invalid look id {id:?}")));
        }
        let url = self.api_url(&format!("looks/{}/run/{}", id, format.as_str()));
        self.authorized_get(&url, &[]).await
    }
}

/// Extract look ids from a `looks/search` response, preserving result order.
pub fn parse_search_response(body: &[u8]) -> Result<Vec<ReportId>, SourceError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| SourceError::Rejected(format!("unreadable search response: {e}")))?;
    let Some(items) = value.as_array() else {
        return Err(SourceError::Rejected(
            "search response is not a list".to_string(),
        ));
    };

    items
        .iter()
        .map(|item| match item.get("id") {
            Some(JsonValue::String(s)) => Ok(ReportId::new(s.clone())),
            Some(JsonValue::Number(n)) => Ok(ReportId::new(n.to_string())),
            _ => Err(SourceError::Rejected(format!(
                "search result without id: {item}"
            ))),
        })
        .collect()
}

fn map_fetch_error(err: FetchError) -> SourceError {
    match (err.disposition(), err.status()) {
        (RetryDisposition::Retryable, _) => SourceError::Transport(err.to_string()),
        (_, Some(401 | 403)) => SourceError::Auth(err.to_string()),
        _ => SourceError::Rejected(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rws_storage::HttpClientConfig;

    #[test]
    fn search_response_ids_keep_order_and_accept_numbers() {
        let ids = parse_search_response(br#"[{"id":"42"},{"id":7}]"#).unwrap();
        assert_eq!(ids, vec![ReportId::new("42"), ReportId::new("7")]);
        assert!(parse_search_response(b"[]").unwrap().is_empty());
    }

    #[test]
    fn search_response_without_ids_is_rejected() {
        assert!(matches!(
            parse_search_response(br#"[{"title":"x"}]"#),
            Err(SourceError::Rejected(_))
        ));
        assert!(matches!(
            parse_search_response(br#"{"id":"1"}"#),
            Err(SourceError::Rejected(_))
        ));
    }

    #[test]
    fn api_urls_are_versioned() {
        let source = LookerSource::new(
            LookerConfig::new("https://looker.example.com/", "id", "secret"),
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
        );
        assert_eq!(
            source.api_url("/looks/search"),
            "https://looker.example.com/api/4.0/looks/search"
        );
    }

    #[test]
    fn http_failures_map_onto_source_errors() {
        let transient = FetchError::HttpStatus {
            status: 502,
            url: "u".into(),
        };
        assert!(map_fetch_error(transient).is_transient());
        let auth = FetchError::HttpStatus {
            status: 403,
            url: "u".into(),
        };
        assert!(matches!(map_fetch_error(auth), SourceError::Auth(_)));
        let missing = FetchError::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        assert!(matches!(map_fetch_error(missing), SourceError::Rejected(_)));
    }

    #[tokio::test]
    async fn malformed_ids_are_rejected_before_any_request() {
        let source = LookerSource::new(
            LookerConfig::new("https://looker.example.com", "id", "secret"),
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
        );
        let err = source
            .run(&ReportId::new("../admin"), ResultFormat::Csv)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Rejected(_)));
    }
}
