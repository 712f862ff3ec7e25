#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::RwLock;
use samstudio_core::config::{EngineConfig, SessionConfig};
use samstudio_core::{BackendError, BinaryMask, ImageId, ImageSize, NormalizedRequest};
use samstudio_engine::{EmbeddingCache, MaskEngine};
use samstudio_model::{
    EmbeddingArtifact, EmbeddingOutput, ImageEmbedding, ImageSource, ModelBackend, RawCandidate,
};
use samstudio_session::SessionManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const IMAGE_SIZE: ImageSize = ImageSize {
    width: 64,
    height: 64,
};

/// Deterministic backend with configurable latency, scores and failures.
pub struct ScriptedBackend {
    version: RwLock<String>,
    // Adopted as the model version on the first embed
    learns: Option<String>,
    scores: Vec<f32>,
    embed_delay: Duration,
    predict_delay: Duration,
    embed_calls: AtomicUsize,
    predict_calls: AtomicUsize,
    failing_embeds: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(version: &str) -> Self {
        Self {
            version: RwLock::new(version.to_string()),
            learns: None,
            scores: vec![0.91, 0.77],
            embed_delay: Duration::ZERO,
            predict_delay: Duration::ZERO,
            embed_calls: AtomicUsize::new(0),
            predict_calls: AtomicUsize::new(0),
            failing_embeds: AtomicUsize::new(0),
        }
    }

    /// Report "unknown" until the first embedding, like a remote model
    /// server that has not been queried yet.
    pub fn learning(version: &str) -> Self {
        let mut backend = Self::new("unknown");
        backend.learns = Some(version.to_string());
        backend
    }

    pub fn with_scores(mut self, scores: Vec<f32>) -> Self {
        self.scores = scores;
        self
    }

    pub fn with_embed_delay(mut self, delay: Duration) -> Self {
        self.embed_delay = delay;
        self
    }

    pub fn with_predict_delay(mut self, delay: Duration) -> Self {
        self.predict_delay = delay;
        self
    }

    /// Make the next `n` embedding calls fail
    pub fn fail_next_embeds(&self, n: usize) {
        self.failing_embeds.store(n, Ordering::SeqCst);
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn predict_calls(&self) -> usize {
        self.predict_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model_version(&self) -> String {
        self.version.read().clone()
    }

    async fn embed(&self, image: &ImageSource) -> Result<EmbeddingOutput, BackendError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if !self.embed_delay.is_zero() {
            tokio::time::sleep(self.embed_delay).await;
        }

        let should_fail = self
            .failing_embeds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BackendError::ResourceExhausted("scripted failure".to_string()));
        }
        if let Some(learned) = &self.learns {
            *self.version.write() = learned.clone();
        }

        Ok(EmbeddingOutput {
            artifact: EmbeddingArtifact::Remote {
                handle: format!("{}:{}", image.id, self.model_version()),
            },
            model_version: self.model_version(),
            device: Some("cpu".to_string()),
        })
    }

    async fn predict(
        &self,
        embedding: &ImageEmbedding,
        request: &NormalizedRequest,
    ) -> Result<Vec<RawCandidate>, BackendError> {
        self.predict_calls.fetch_add(1, Ordering::SeqCst);
        if !self.predict_delay.is_zero() {
            tokio::time::sleep(self.predict_delay).await;
        }

        let (cx, cy) = match request {
            NormalizedRequest::Geometry { points, boxes } => match (points.first(), boxes.first()) {
                (Some(p), _) => (p.at.x, p.at.y),
                (None, Some(b)) => (b.x + b.width / 2.0, b.y + b.height / 2.0),
                (None, None) => return Err(BackendError::InvalidInput("no geometry".to_string())),
            },
            NormalizedRequest::Text { .. } => (32.0, 32.0),
        };

        let size = embedding.image_size;
        Ok(self
            .scores
            .iter()
            .enumerate()
            .map(|(i, score)| {
                let radius = 3.0 + 3.0 * i as f32;
                RawCandidate {
                    mask: BinaryMask::from_fn(size.width, size.height, |x, y| {
                        (x as f32 - cx).abs() <= radius && (y as f32 - cy).abs() <= radius
                    }),
                    score: *score,
                }
            })
            .collect())
    }
}

pub fn image(name: &str) -> ImageSource {
    ImageSource::new(ImageId::from(name), IMAGE_SIZE, vec![7u8; 32])
}

pub fn engine(backend: Arc<ScriptedBackend>, capacity: usize) -> Arc<MaskEngine> {
    Arc::new(MaskEngine::new(
        backend,
        EmbeddingCache::new(capacity),
        EngineConfig::default(),
    ))
}

pub fn manager(backend: Arc<ScriptedBackend>, capacity: usize) -> SessionManager {
    SessionManager::new(
        engine(backend, capacity),
        SessionConfig {
            max_open_sessions: 16,
        },
    )
}
