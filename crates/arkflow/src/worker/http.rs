//! JSON-over-HTTP client shared by the worker adapters.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::WorkerError;
use crate::config::WorkerEndpoint;
use crate::error::ConfigError;
use crate::sanitize::truncate_for_log;
use crate::secrets::resolve_secret_optional;

#[derive(Clone)]
pub struct WorkerHttpClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
    timeout: Duration,
}

impl WorkerHttpClient {
    pub fn new(base_url: &str, token: Option<SecretString>, timeout: Duration) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Transport {
                endpoint: base_url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            timeout,
        })
    }

    /// Builds a client from a configured endpoint, resolving its token.
    pub fn from_endpoint(name: &str, endpoint: &WorkerEndpoint) -> Result<Self, ConfigError> {
        let token = resolve_secret_optional(
            endpoint.token.as_deref(),
            endpoint.token_file.as_deref(),
            endpoint.token_env.as_deref(),
        )
        .map_err(|e| ConfigError::Secret {
            name: name.to_string(),
            source: e,
        })?;

        Self::new(&endpoint.base_url, token, endpoint.timeout()).map_err(|e| {
            ConfigError::InvalidEndpoint {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, WorkerError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        self.send(self.client.post(&url).json(body), &url).await
    }

    pub async fn get_json<R>(&self, path: &str) -> Result<R, WorkerError>
    where
        R: DeserializeOwned,
    {
        let url = self.url(path);
        self.send(self.client.get(&url), &url).await
    }

    async fn send<R>(&self, request: RequestBuilder, url: &str) -> Result<R, WorkerError>
    where
        R: DeserializeOwned,
    {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                WorkerError::Timeout(self.timeout)
            } else {
                WorkerError::Transport {
                    endpoint: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Status {
                status: status.as_u16(),
                body: truncate_for_log(&body),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| WorkerError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pong {
        ok: bool,
    }

    #[tokio::test]
    async fn test_get_json_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/ping"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let client = WorkerHttpClient::new(
            &format!("{}/", server.uri()),
            Some(SecretString::from("s3cret".to_string())),
            Duration::from_secs(5),
        )
        .unwrap();
        let pong: Pong = client.get_json("/v1/ping").await.unwrap();
        assert_eq!(pong, Pong { ok: true });
    }

    #[tokio::test]
    async fn test_error_status_is_reported_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/jobs"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = WorkerHttpClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = client
            .post_json::<_, Pong>("v1/jobs", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WorkerError::Status {
                status: 503,
                body: "overloaded".to_string()
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = WorkerHttpClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = client.get_json::<Pong>("anything").await.unwrap_err();
        assert!(matches!(err, WorkerError::Decode(_)));
    }

    #[tokio::test]
    async fn test_slow_worker_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client =
            WorkerHttpClient::new(&server.uri(), None, Duration::from_millis(100)).unwrap();
        let err = client.get_json::<Pong>("slow").await.unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)));
    }

    #[test]
    fn test_from_endpoint_with_missing_token_file_fails() {
        let mut endpoint = WorkerEndpoint::new("http://ocr.internal");
        endpoint.token_file = Some("/nonexistent/arkflow/token".to_string());
        assert!(matches!(
            WorkerHttpClient::from_endpoint("recognition", &endpoint),
            Err(ConfigError::Secret { .. })
        ));
    }
}
