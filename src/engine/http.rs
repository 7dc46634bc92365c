//! HTTP client for the session lifecycle service.

use crate::engine::{AnalysisReport, SessionService};
use crate::error::{CoraError, Result};
use crate::session::{Mood, SessionId};
use serde::Deserialize;
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct CreateResponse {
    success: bool,
    conversation_id: Option<SessionId>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    success: bool,
    analysis: Option<AnalysisReport>,
    error: Option<String>,
}

/// [`SessionService`] over `POST {base_url}/conversation/...`.
pub struct HttpSessionService {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpSessionService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoraError::EngineUnreachable {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|e| {
            CoraError::ConfigInvalidValue {
                key: "engine.base_url".to_string(),
                message: format!("{}: {}", base_url, e),
            }
        })?;
        if base_url.cannot_be_a_base() {
            return Err(CoraError::ConfigInvalidValue {
                key: "engine.base_url".to_string(),
                message: format!("{} cannot carry a path", base_url),
            });
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Base URL plus `segments`, each percent-encoded as a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post<T: DeserializeOwned>(&self, url: Url, body: serde_json::Value) -> Result<T> {
        debug!(%url, "engine request");
        let response = self
            .client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| CoraError::EngineUnreachable {
                message: format!("{}: {}", url, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoraError::EngineStatus {
                status: status.as_u16(),
                body: error_text(&body),
            });
        }

        response.json::<T>().await.map_err(|e| CoraError::EngineRejected {
            message: format!("malformed response from {}: {}", url, e),
        })
    }
}

/// Prefer the `error` field of a JSON error body over the raw text.
fn error_text(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn rejected(error: Option<String>, fallback: &str) -> CoraError {
    CoraError::EngineRejected {
        message: error.unwrap_or_else(|| fallback.to_string()),
    }
}

#[async_trait::async_trait]
impl SessionService for HttpSessionService {
    async fn create(&self, mood: Mood) -> Result<SessionId> {
        let resp: CreateResponse = self
            .post(
                self.endpoint(&["conversation", "new"]),
                serde_json::json!({ "mood": mood.as_str() }),
            )
            .await?;
        match resp {
            CreateResponse {
                success: true,
                conversation_id: Some(id),
                ..
            } => {
                info!(session = %id, %mood, "conversation created");
                Ok(id)
            }
            CreateResponse { error, .. } => {
                Err(rejected(error, "failed to start conversation"))
            }
        }
    }

    async fn analyze(&self, id: &SessionId) -> Result<AnalysisReport> {
        let url = self.endpoint(&["conversation", id.as_str(), "analyze"]);
        let resp: AnalyzeResponse = self.post(url, serde_json::json!({})).await?;
        if !resp.success {
            return Err(rejected(resp.error, "analysis failed"));
        }
        Ok(resp.analysis.unwrap_or_default())
    }
}
