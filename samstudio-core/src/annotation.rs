//! Committed annotation objects.

use crate::types::{AnnotationId, BinaryMask, Point, Rect};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an annotation's geometry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Manual,
    ModelAccepted,
    ModelEdited,
}

impl Provenance {
    /// Provenance after the user changes the geometry.
    pub fn after_geometry_edit(self) -> Self {
        match self {
            Provenance::Manual => Provenance::Manual,
            Provenance::ModelAccepted | Provenance::ModelEdited => Provenance::ModelEdited,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    Mask { mask: BinaryMask },
    Polygon { vertices: Vec<Point> },
}

impl Geometry {
    pub fn polygon(vertices: Vec<Point>) -> Self {
        Geometry::Polygon { vertices }
    }

    pub fn mask(mask: BinaryMask) -> Self {
        Geometry::Mask { mask }
    }

    /// Move the geometry. Mask offsets are rounded to whole pixels.
    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        match self {
            Geometry::Mask { mask } => Geometry::Mask {
                mask: mask.translated(dx.round() as i32, dy.round() as i32),
            },
            Geometry::Polygon { vertices } => Geometry::Polygon {
                vertices: vertices.iter().map(|p| p.translated(dx, dy)).collect(),
            },
        }
    }

    pub fn bounding_box(&self) -> Option<Rect> {
        match self {
            Geometry::Mask { mask } => mask.bounding_box(),
            Geometry::Polygon { vertices } => {
                let first = vertices.first()?;
                let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
                for v in vertices {
                    min_x = min_x.min(v.x);
                    min_y = min_y.min(v.y);
                    max_x = max_x.max(v.x);
                    max_y = max_y.max(v.y);
                }
                Some(Rect::new(min_x, min_y, max_x - min_x, max_y - min_y))
            }
        }
    }

    /// Polygon outline: the vertices themselves, or the convex hull of a mask.
    pub fn outline(&self) -> Vec<Point> {
        match self {
            Geometry::Mask { mask } => mask.convex_hull(),
            Geometry::Polygon { vertices } => vertices.clone(),
        }
    }
}

/// A committed, user-owned shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationObject {
    pub id: AnnotationId,
    pub label: String,
    pub geometry: Geometry,
    pub provenance: Provenance,
    /// Number of edits applied since creation
    pub version: u32,
    /// Model version that produced the geometry, if model-assisted
    pub model_version: Option<String>,
    /// Confidence of the accepted candidate
    pub score: Option<f32>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_after_edit() {
        assert_eq!(Provenance::Manual.after_geometry_edit(), Provenance::Manual);
        assert_eq!(Provenance::ModelAccepted.after_geometry_edit(), Provenance::ModelEdited);
        assert_eq!(Provenance::ModelEdited.after_geometry_edit(), Provenance::ModelEdited);
    }

    #[test]
    fn test_polygon_translate_and_bbox() {
        let geometry = Geometry::polygon(vec![
            Point::new(0.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(4.0, 2.0),
        ]);
        let moved = geometry.translated(1.5, -1.0);
        assert_eq!(moved.bounding_box(), Some(Rect::new(1.5, -1.0, 4.0, 2.0)));
        assert_eq!(Geometry::polygon(vec![]).bounding_box(), None);
    }

    #[test]
    fn test_mask_outline_uses_hull() {
        let mask = BinaryMask::from_fn(4, 4, |x, y| x < 2 && y < 2);
        let outline = Geometry::mask(mask).outline();
        assert_eq!(outline.len(), 4);
    }
}
