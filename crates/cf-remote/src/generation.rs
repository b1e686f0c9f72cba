//! Asynchronous generation provider.
//!
//! Work is submitted to a provider endpoint and identified by the returned
//! request id from then on. Re-polling the same id is safe, which is what
//! makes a persisted `(endpoint, request_id)` pair enough to resume a job.

use std::time::Duration;

use async_trait::async_trait;
use cf_core::config::GenerationConfig;
use cf_core::{Error, ProgressSender, Result};
use serde::Deserialize;

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submit work and return the provider's request id without waiting.
    async fn submit(&self, endpoint: &str, input: &serde_json::Value) -> Result<String>;

    /// Wait until the request reaches a terminal state. Intermediate status
    /// updates are reported through `progress` on a best-effort basis.
    async fn await_completion(
        &self,
        endpoint: &str,
        request_id: &str,
        progress: &ProgressSender,
    ) -> Result<()>;

    /// URL of the finished artifact.
    async fn fetch_result(&self, endpoint: &str, request_id: &str) -> Result<String>;
}

/// Queue-style REST provider:
///
/// - `POST {base}/{endpoint}` -> `{"request_id"}`
/// - `GET {base}/{endpoint}/requests/{id}/status` -> `{"status", "queue_position"?}`
/// - `GET {base}/{endpoint}/requests/{id}` -> `{"video": {"url"}}`
#[derive(Debug, Clone)]
pub struct HttpGenerationProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    queue_position: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    #[serde(default)]
    video: Option<MediaRef>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaRef {
    #[serde(default)]
    url: Option<String>,
}

impl HttpGenerationProvider {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            http: crate::http_client(Duration::from_secs(60))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn request_url(&self, endpoint: &str, request_id: &str) -> String {
        format!(
            "{}/{}/requests/{request_id}",
            self.base_url,
            endpoint.trim_matches('/')
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(reqwest::header::AUTHORIZATION, format!("Key {key}")),
            None => req,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(|e| Error::Generation(format!("request to {url} failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("{url} returned {status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| Error::Generation(format!("unreadable response from {url}: {e}")))
    }

    async fn poll_until_done(
        &self,
        endpoint: &str,
        request_id: &str,
        progress: &ProgressSender,
    ) -> Result<()> {
        let url = format!("{}/status", self.request_url(endpoint, request_id));
        let mut last_reported = String::new();

        loop {
            let status: StatusResponse = self.get_json(&url).await?;
            let report = match status.queue_position {
                Some(pos) => format!("{} (position {pos})", status.status),
                None => status.status.clone(),
            };
            if report != last_reported {
                progress.send(&report);
                last_reported = report;
            }

            match status.status.as_str() {
                "COMPLETED" => return Ok(()),
                "FAILED" | "ERROR" | "CANCELLED" => {
                    return Err(Error::Generation(format!(
                        "request {request_id} ended with status {}",
                        status.status
                    )))
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    async fn submit(&self, endpoint: &str, input: &serde_json::Value) -> Result<String> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_matches('/'));
        let resp = self
            .authorize(self.http.post(&url))
            .json(input)
            .send()
            .await
            .map_err(|e| Error::Generation(format!("submit to {endpoint} failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Generation(format!(
                "submit to {endpoint} returned {status}: {body}"
            )));
        }
        let submitted: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| Error::Generation(format!("unreadable submit response: {e}")))?;

        tracing::info!(endpoint, request_id = %submitted.request_id, "Submitted generation request");
        Ok(submitted.request_id)
    }

    async fn await_completion(
        &self,
        endpoint: &str,
        request_id: &str,
        progress: &ProgressSender,
    ) -> Result<()> {
        tokio::time::timeout(self.timeout, self.poll_until_done(endpoint, request_id, progress))
            .await
            .map_err(|_| {
                Error::Generation(format!(
                    "request {request_id} did not finish within {:?}",
                    self.timeout
                ))
            })?
    }

    async fn fetch_result(&self, endpoint: &str, request_id: &str) -> Result<String> {
        let result: ResultResponse = self.get_json(&self.request_url(endpoint, request_id)).await?;
        result
            .video
            .and_then(|v| v.url)
            .or(result.url)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Generation(format!("request {request_id} produced no video")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpGenerationProvider {
        HttpGenerationProvider::new(&GenerationConfig {
            base_url: server.uri(),
            api_key: Some("k".into()),
            poll_interval_ms: 1,
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn submit_returns_request_id() {
        let server = MockServer::start().await;
        let input = serde_json::json!({"prompt": "swap"});
        Mock::given(method("POST"))
            .and(path("/vendor/model"))
            .and(header("authorization", "Key k"))
            .and(body_json(&input))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"request_id": "r-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let id = provider(&server).submit("vendor/model", &input).await.unwrap();
        assert_eq!(id, "r-1");
    }

    #[tokio::test]
    async fn await_reports_status_then_completes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vendor/model/requests/r-1/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "IN_QUEUE", "queue_position": 2})),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/vendor/model/requests/r-1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "COMPLETED"})))
            .mount(&server)
            .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = ProgressSender::new(move |s: &str| sink.lock().unwrap().push(s.to_string()));

        provider(&server)
            .await_completion("vendor/model", "r-1", &progress)
            .await
            .unwrap();

        // Repeated statuses are reported once.
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["IN_QUEUE (position 2)".to_string(), "COMPLETED".to_string()]);
    }

    #[tokio::test]
    async fn failed_status_is_generation_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/m/requests/r/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "FAILED"})))
            .mount(&server)
            .await;

        let err = provider(&server)
            .await_completion("m", "r", &ProgressSender::noop())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }

    #[tokio::test]
    async fn fetch_result_extracts_video_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/m/requests/r"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"video": {"url": "https://cdn/out.mp4"}})),
            )
            .mount(&server)
            .await;

        let url = provider(&server).fetch_result("m", "r").await.unwrap();
        assert_eq!(url, "https://cdn/out.mp4");
    }

    #[tokio::test]
    async fn fetch_result_without_video_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/m/requests/r"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"images": []})))
            .mount(&server)
            .await;

        let err = provider(&server).fetch_result("m", "r").await.unwrap_err();
        assert!(err.to_string().contains("produced no video"));
    }
}
