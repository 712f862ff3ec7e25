//! samstudio-model: the model backend boundary
//!
//! A backend computes image embeddings and decodes masks from prompts. The
//! rest of the system only sees the [`ModelBackend`] trait; [`HttpBackend`]
//! reaches a model server over HTTP.

pub mod backend;
pub mod http;

pub use backend::{
    EmbeddingArtifact, EmbeddingOutput, ImageEmbedding, ImageSource, ModelBackend, RawCandidate,
};
pub use http::{HealthStatus, HttpBackend};
