//! samstudio-engine: embedding cache, prompt resolution and mask prediction

pub mod cache;
pub mod mask_engine;
pub mod resolver;

pub use cache::{CacheStats, EmbeddingCache, EmbeddingKey, EmbeddingLease};
pub use mask_engine::{CallOptions, MaskEngine, MaskResult};
pub use resolver::PromptResolver;
