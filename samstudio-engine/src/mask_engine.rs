//! Mask prediction orchestration
//!
//! Combines the embedding cache, the prompt resolver and the active model
//! backend into one ranked prediction call.

use crate::cache::{EmbeddingCache, EmbeddingLease};
use crate::resolver::PromptResolver;
use parking_lot::RwLock;
use samstudio_core::config::EngineConfig;
use samstudio_core::{BackendError, BinaryMask, Error, ImageId, PromptSet, Result};
use samstudio_model::{ImageSource, ModelBackend, RawCandidate};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-call settings
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// Bound on each backend call made on behalf of this prediction
    pub timeout: Duration,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// One ranked mask candidate.
#[derive(Debug, Clone, Serialize)]
pub struct MaskResult {
    pub mask: BinaryMask,
    pub score: f32,
    /// Position in the ranking, 0 is the most confident
    pub rank: usize,
    /// The prompts that produced this candidate
    pub prompts: Arc<PromptSet>,
    pub model_version: String,
    pub image: ImageId,
}

pub struct MaskEngine {
    backend: RwLock<Arc<dyn ModelBackend>>,
    cache: EmbeddingCache,
    resolver: PromptResolver,
    config: EngineConfig,
}

impl MaskEngine {
    pub fn new(backend: Arc<dyn ModelBackend>, cache: EmbeddingCache, config: EngineConfig) -> Self {
        Self {
            backend: RwLock::new(backend),
            cache,
            resolver: PromptResolver::new(),
            config,
        }
    }

    /// The backend new calls will use
    pub fn backend(&self) -> Arc<dyn ModelBackend> {
        self.backend.read().clone()
    }

    /// Replace the active backend. Calls already running keep the backend
    /// they started with; sessions move their embedding lease to the new
    /// model version on their next prediction.
    pub fn set_backend(&self, backend: Arc<dyn ModelBackend>) {
        let mut current = self.backend.write();
        info!(
            "Switching model backend from {} ({}) to {} ({})",
            current.name(),
            current.model_version(),
            backend.name(),
            backend.model_version()
        );
        *current = backend;
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn default_options(&self) -> CallOptions {
        CallOptions::with_timeout(self.config.call_timeout())
    }

    /// Make sure `held` leases the embedding of `image` under the active
    /// backend's model version, computing it if needed.
    pub async fn ensure_embedding(
        &self,
        image: &ImageSource,
        held: &mut Option<EmbeddingLease>,
        options: CallOptions,
    ) -> Result<()> {
        self.lease_for(&self.backend(), image, held, options).await
    }

    async fn lease_for(
        &self,
        backend: &Arc<dyn ModelBackend>,
        image: &ImageSource,
        held: &mut Option<EmbeddingLease>,
        options: CallOptions,
    ) -> Result<()> {
        let version = backend.model_version();

        let current = held
            .as_ref()
            .map(|lease| lease.key().image == image.id && lease.key().model_version == version)
            .unwrap_or(false);
        if current {
            return Ok(());
        }

        if let Some(stale) = held.take() {
            debug!("Releasing embedding {} for model version {}", stale.key(), version);
        }
        let lease = self.cache.get_or_compute(image, backend, options.timeout).await?;
        *held = Some(lease);
        Ok(())
    }

    /// Predict masks for `prompts` over `image`, most confident first.
    ///
    /// `held` is the caller's long-lived embedding lease; it is acquired or
    /// replaced here when missing or stale. A successful call never returns
    /// an empty list.
    pub async fn predict(
        &self,
        image: &ImageSource,
        held: &mut Option<EmbeddingLease>,
        prompts: PromptSet,
        options: CallOptions,
    ) -> Result<Vec<MaskResult>> {
        // Validate before any backend work
        let request = self.resolver.resolve(&prompts, image.size)?;

        // One backend for the whole call, even if it is swapped meanwhile
        let backend = self.backend();
        self.lease_for(&backend, image, held, options).await?;
        let lease = match held.as_ref() {
            Some(lease) => self.cache.retain(lease)?,
            None => {
                return Err(Error::InvariantViolation(
                    "embedding lease missing after acquisition".to_string(),
                ))
            }
        };

        let embedding = lease.embedding().clone();
        if backend.model_version() != embedding.model_version {
            warn!(
                "Backend {} reports {}, predicting against embedding from {}",
                backend.name(),
                backend.model_version(),
                embedding.model_version
            );
        }

        let raw = match tokio::time::timeout(options.timeout, backend.predict(&embedding, &request)).await {
            Err(_) => {
                warn!("Prediction on {} timed out after {:?}", image.id, options.timeout);
                return Err(Error::Backend(BackendError::Timeout(options.timeout.as_millis() as u64)));
            }
            Ok(Err(e)) => {
                warn!("Backend {} prediction failed: {}", backend.name(), e);
                return Err(Error::Backend(e));
            }
            Ok(Ok(candidates)) => candidates,
        };

        let ranked = self.rank(raw)?;
        let prompts = Arc::new(prompts);
        let results: Vec<MaskResult> = ranked
            .into_iter()
            .enumerate()
            .map(|(rank, candidate)| MaskResult {
                mask: candidate.mask,
                score: candidate.score,
                rank,
                prompts: prompts.clone(),
                model_version: embedding.model_version.clone(),
                image: image.id.clone(),
            })
            .collect();

        debug!(
            "Predicted {} candidates for {} (top score {:.3})",
            results.len(),
            image.id,
            results[0].score
        );
        Ok(results)
    }

    /// Order candidates by descending score, apply the confidence floor and
    /// the candidate limit. The top candidate always survives.
    fn rank(&self, raw: Vec<RawCandidate>) -> Result<Vec<RawCandidate>> {
        let mut candidates: Vec<RawCandidate> = raw.into_iter().filter(|c| c.score.is_finite()).collect();
        if candidates.is_empty() {
            return Err(Error::Backend(BackendError::EmptyResult));
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let floor = self.config.min_confidence;
        let limit = self.config.max_candidates.max(1);
        let mut ranked = Vec::with_capacity(candidates.len().min(limit));
        for (i, candidate) in candidates.into_iter().enumerate() {
            if ranked.len() == limit {
                break;
            }
            if i == 0 || candidate.score >= floor {
                ranked.push(candidate);
            }
        }
        Ok(ranked)
    }
}
