//! samstudio-core: shared types for the annotation core
//!
//! Identifiers, geometry, prompts, annotation objects, configuration and the
//! error taxonomy used by every other samstudio crate.

pub mod annotation;
pub mod config;
pub mod error;
pub mod prompt;
pub mod types;

pub use annotation::{AnnotationObject, Geometry, Provenance};
pub use config::{ConfigError, StudioConfig};
pub use error::{BackendError, Error, Result};
pub use prompt::{LabeledPoint, NormalizedRequest, PointLabel, Prompt, PromptSet};
pub use types::{AnnotationId, BinaryMask, ImageId, ImageSize, Point, Rect, SessionId, ThreadId};
