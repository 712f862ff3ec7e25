//! HTTP model backend
//!
//! Talks to a model server exposing `POST /embeddings`, `POST /predict` and a
//! `GET /` status endpoint. Masks travel run-length encoded.

use crate::backend::{
    EmbeddingArtifact, EmbeddingOutput, ImageEmbedding, ImageSource, ModelBackend, RawCandidate,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use reqwest::Client;
use samstudio_core::config::BackendConfig;
use samstudio_core::{BackendError, BinaryMask, NormalizedRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const UNKNOWN_VERSION: &str = "unknown";

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    image_id: &'a str,
    width: u32,
    height: u32,
    pixels: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingArtifact,
    model_version: String,
    #[serde(default)]
    device: Option<String>,
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    image_id: &'a str,
    model_version: &'a str,
    embedding: &'a EmbeddingArtifact,
    request: &'a NormalizedRequest,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    width: u32,
    height: u32,
    #[serde(default)]
    origin_x: i32,
    #[serde(default)]
    origin_y: i32,
    counts: Vec<u32>,
    score: f32,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    candidates: Vec<WireCandidate>,
}

/// Status reported by the model server's root endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthStatus {
    pub message: String,
    pub model_status: String,
    #[serde(default)]
    pub model_version: Option<String>,
}

impl HealthStatus {
    pub fn is_ready(&self) -> bool {
        self.model_status.eq_ignore_ascii_case("loaded")
    }
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    timeout: Duration,
    model_version: Arc<RwLock<String>>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            model_version: Arc::new(RwLock::new(UNKNOWN_VERSION.to_string())),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Query the server status and adopt the model version it reports.
    pub async fn health(&self) -> Result<HealthStatus, BackendError> {
        let response = self
            .client
            .get(self.url("/"))
            .send()
            .await
            .map_err(|e| map_transport(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &text));
        }

        let health: HealthStatus = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        if let Some(version) = &health.model_version {
            self.adopt_version(version);
        }
        info!("Model server {} status: {}", self.base_url, health.model_status);
        Ok(health)
    }

    fn adopt_version(&self, version: &str) {
        let mut current = self.model_version.write();
        if *current != version {
            if *current != UNKNOWN_VERSION {
                warn!("Model server version changed from {} to {}", *current, version);
            }
            *current = version.to_string();
        }
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn model_version(&self) -> String {
        self.model_version.read().clone()
    }

    async fn embed(&self, image: &ImageSource) -> Result<EmbeddingOutput, BackendError> {
        let body = EmbedRequest {
            image_id: image.id.as_str(),
            width: image.size.width,
            height: image.size.height,
            pixels: STANDARD.encode(&image.pixels),
        };

        debug!("Requesting embedding for {} ({} bytes)", image.id, image.pixels.len());
        let response = self
            .client
            .post(self.url("/embeddings"))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &text));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        self.adopt_version(&parsed.model_version);
        Ok(EmbeddingOutput {
            artifact: parsed.embedding,
            model_version: parsed.model_version,
            device: parsed.device,
        })
    }

    async fn predict(
        &self,
        embedding: &ImageEmbedding,
        request: &NormalizedRequest,
    ) -> Result<Vec<RawCandidate>, BackendError> {
        let body = PredictRequest {
            image_id: embedding.image.as_str(),
            model_version: &embedding.model_version,
            embedding: &embedding.artifact,
            request,
        };

        let response = self
            .client
            .post(self.url("/predict"))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &text));
        }

        let parsed: PredictResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        decode_candidates(parsed)
    }
}

fn decode_candidates(response: PredictResponse) -> Result<Vec<RawCandidate>, BackendError> {
    response
        .candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            if !c.score.is_finite() {
                return Err(BackendError::InvalidResponse(format!(
                    "candidate {} has a non-finite score",
                    i
                )));
            }
            let mask = BinaryMask::from_rle(c.width, c.height, &c.counts).ok_or_else(|| {
                BackendError::InvalidResponse(format!(
                    "candidate {} run lengths do not cover {}x{}",
                    i, c.width, c.height
                ))
            })?;
            Ok(RawCandidate {
                mask: mask.translated(c.origin_x, c.origin_y),
                score: c.score,
            })
        })
        .collect()
}

fn map_transport(err: reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout.as_millis() as u64)
    } else {
        BackendError::Transport(err.to_string())
    }
}

fn map_status(status: u16, body: &str) -> BackendError {
    // Limit error message size
    let detail = if body.len() > 500 {
        let mut end = 500;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("HTTP {}: {}", status, &body[..end])
    } else {
        format!("HTTP {}: {}", status, body)
    };

    match status {
        400 | 413 | 415 | 422 => BackendError::InvalidInput(detail),
        404 | 409 => BackendError::IncompatibleEmbedding(detail),
        429 | 507 => BackendError::ResourceExhausted(detail),
        503 => BackendError::Unavailable(detail),
        500..=599 => BackendError::Transport(detail),
        _ => BackendError::InvalidResponse(detail),
    }
}
