use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use samstudio_core::{BackendError, BinaryMask, ImageId, ImageSize, NormalizedRequest};
use serde::{Deserialize, Serialize};

/// Pixel data of an open image, as handed to a backend.
#[derive(Debug, Clone)]
pub struct ImageSource {
    pub id: ImageId,
    pub size: ImageSize,
    /// Encoded image bytes (PNG/JPEG) or raw RGB, as the backend expects
    pub pixels: Bytes,
}

impl ImageSource {
    pub fn new(id: ImageId, size: ImageSize, pixels: impl Into<Bytes>) -> Self {
        Self {
            id,
            size,
            pixels: pixels.into(),
        }
    }

    /// Identity derived from the pixel bytes themselves
    pub fn from_content(size: ImageSize, pixels: impl Into<Bytes>) -> Self {
        let pixels = pixels.into();
        Self {
            id: ImageId::from_content(&pixels),
            size,
            pixels,
        }
    }
}

/// Opaque embedding payload. Either the tensor itself or a handle to an
/// embedding kept on the model server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingArtifact {
    Tensor { shape: Vec<usize>, values: Vec<f32> },
    Remote { handle: String },
}

impl EmbeddingArtifact {
    pub fn element_count(&self) -> usize {
        match self {
            EmbeddingArtifact::Tensor { values, .. } => values.len(),
            EmbeddingArtifact::Remote { .. } => 0,
        }
    }
}

/// What a backend returns from its embedding operation.
#[derive(Debug, Clone)]
pub struct EmbeddingOutput {
    pub artifact: EmbeddingArtifact,
    pub model_version: String,
    pub device: Option<String>,
}

/// An embedding with its metadata. Read-only once built; shared through `Arc`.
#[derive(Debug)]
pub struct ImageEmbedding {
    pub image: ImageId,
    pub image_size: ImageSize,
    pub model_version: String,
    pub device: String,
    pub created_at: DateTime<Utc>,
    pub artifact: EmbeddingArtifact,
}

impl ImageEmbedding {
    pub fn new(image: &ImageSource, output: EmbeddingOutput) -> Self {
        Self {
            image: image.id.clone(),
            image_size: image.size,
            model_version: output.model_version,
            device: output.device.unwrap_or_else(|| "unknown".to_string()),
            created_at: Utc::now(),
            artifact: output.artifact,
        }
    }
}

/// One mask candidate as produced by a backend, before ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCandidate {
    pub mask: BinaryMask,
    pub score: f32,
}

/// Uniform interface to one pluggable segmentation model.
///
/// Implementations must be cheap to share behind `Arc<dyn ModelBackend>`;
/// the core never holds a concrete model type.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Version string of the model currently served
    fn model_version(&self) -> String;

    /// Compute the embedding of an image
    async fn embed(&self, image: &ImageSource) -> Result<EmbeddingOutput, BackendError>;

    /// Decode masks for a request against a previously computed embedding
    async fn predict(
        &self,
        embedding: &ImageEmbedding,
        request: &NormalizedRequest,
    ) -> Result<Vec<RawCandidate>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_source_from_content() {
        let a = ImageSource::from_content(ImageSize::new(2, 2), vec![1u8, 2, 3]);
        let b = ImageSource::from_content(ImageSize::new(2, 2), vec![1u8, 2, 3]);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_embedding_metadata() {
        let image = ImageSource::new(ImageId::from("img-1"), ImageSize::new(64, 32), Bytes::new());
        let embedding = ImageEmbedding::new(
            &image,
            EmbeddingOutput {
                artifact: EmbeddingArtifact::Tensor {
                    shape: vec![1, 4],
                    values: vec![0.0; 4],
                },
                model_version: "sam2.1-b+".to_string(),
                device: None,
            },
        );
        assert_eq!(embedding.image, ImageId::from("img-1"));
        assert_eq!(embedding.image_size, ImageSize::new(64, 32));
        assert_eq!(embedding.device, "unknown");
        assert_eq!(embedding.artifact.element_count(), 4);
    }

    #[test]
    fn test_artifact_wire_format() {
        let artifact = EmbeddingArtifact::Remote {
            handle: "abc".to_string(),
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["kind"], "remote");
        assert_eq!(json["handle"], "abc");
    }
}
