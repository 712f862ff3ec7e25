//! Prompt types submitted by the user and the canonical request sent to a
//! model backend.

use crate::types::{Point, Rect};
use serde::{Deserialize, Serialize};

/// Whether a point marks the object (foreground) or excludes a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointLabel {
    Foreground,
    Background,
}

impl PointLabel {
    /// Numeric label used by SAM-style decoders.
    pub fn as_model_label(&self) -> i32 {
        match self {
            PointLabel::Foreground => 1,
            PointLabel::Background => 0,
        }
    }
}

/// A single user cue over the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Prompt {
    Point { at: Point, label: PointLabel },
    Box { rect: Rect },
    Text { query: String },
}

impl Prompt {
    pub fn foreground(x: f32, y: f32) -> Self {
        Prompt::Point {
            at: Point::new(x, y),
            label: PointLabel::Foreground,
        }
    }

    pub fn background(x: f32, y: f32) -> Self {
        Prompt::Point {
            at: Point::new(x, y),
            label: PointLabel::Background,
        }
    }

    pub fn rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Prompt::Box {
            rect: Rect::new(x, y, width, height),
        }
    }

    pub fn text(query: impl Into<String>) -> Self {
        Prompt::Text {
            query: query.into(),
        }
    }
}

/// The prompts of one request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PromptSet {
    prompts: Vec<Prompt>,
}

impl PromptSet {
    pub fn new(prompts: Vec<Prompt>) -> Self {
        Self { prompts }
    }

    pub fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

impl From<Vec<Prompt>> for PromptSet {
    fn from(prompts: Vec<Prompt>) -> Self {
        Self::new(prompts)
    }
}

impl FromIterator<Prompt> for PromptSet {
    fn from_iter<I: IntoIterator<Item = Prompt>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabeledPoint {
    pub at: Point,
    pub label: PointLabel,
}

/// Canonical model request. Geometry and text never share a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NormalizedRequest {
    Geometry {
        points: Vec<LabeledPoint>,
        boxes: Vec<Rect>,
    },
    Text {
        query: String,
    },
}

impl NormalizedRequest {
    pub fn is_text(&self) -> bool {
        matches!(self, NormalizedRequest::Text { .. })
    }
}
