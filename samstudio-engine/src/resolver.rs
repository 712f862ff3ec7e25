//! Prompt normalization

use samstudio_core::{Error, ImageSize, LabeledPoint, NormalizedRequest, Prompt, PromptSet, Rect, Result};

/// Turns a user prompt set into the canonical request a backend accepts.
///
/// Point and box prompts merge into one geometry request. A text prompt
/// must stand alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptResolver;

impl PromptResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, prompts: &PromptSet, image_size: ImageSize) -> Result<NormalizedRequest> {
        if prompts.is_empty() {
            return Err(Error::InvalidPrompt("prompt set is empty".to_string()));
        }

        let mut points = Vec::new();
        let mut boxes = Vec::new();
        let mut text: Option<&str> = None;

        for (i, prompt) in prompts.prompts().iter().enumerate() {
            match prompt {
                Prompt::Point { at, label } => {
                    if !at.is_finite() {
                        return Err(Error::InvalidPrompt(format!("point {} is not finite", i)));
                    }
                    if at.x < 0.0
                        || at.y < 0.0
                        || at.x >= image_size.width as f32
                        || at.y >= image_size.height as f32
                    {
                        return Err(Error::InvalidPrompt(format!(
                            "point {} ({}, {}) lies outside the {}x{} image",
                            i, at.x, at.y, image_size.width, image_size.height
                        )));
                    }
                    points.push(LabeledPoint { at: *at, label: *label });
                }
                Prompt::Box { rect } => {
                    validate_box(i, rect, image_size)?;
                    boxes.push(*rect);
                }
                Prompt::Text { query } => {
                    if text.is_some() {
                        return Err(Error::InvalidPrompt(
                            "only one text prompt is allowed per request".to_string(),
                        ));
                    }
                    text = Some(query);
                }
            }
        }

        match text {
            Some(_) if !points.is_empty() || !boxes.is_empty() => Err(Error::InvalidPrompt(
                "text prompts cannot be combined with point or box prompts".to_string(),
            )),
            Some(query) => Ok(NormalizedRequest::Text {
                query: query.to_string(),
            }),
            None => Ok(NormalizedRequest::Geometry { points, boxes }),
        }
    }
}

fn validate_box(index: usize, rect: &Rect, image_size: ImageSize) -> Result<()> {
    if !rect.is_finite() {
        return Err(Error::InvalidPrompt(format!("box {} is not finite", index)));
    }
    if rect.width <= 0.0 || rect.height <= 0.0 {
        return Err(Error::InvalidPrompt(format!(
            "box {} has non-positive area ({} x {})",
            index, rect.width, rect.height
        )));
    }
    if !rect.is_within(image_size) {
        return Err(Error::InvalidPrompt(format!(
            "box {} exceeds the {}x{} image",
            index, image_size.width, image_size.height
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use samstudio_core::{Point, PointLabel};

    const SIZE: ImageSize = ImageSize {
        width: 640,
        height: 480,
    };

    fn resolve(prompts: Vec<Prompt>) -> Result<NormalizedRequest> {
        PromptResolver::new().resolve(&PromptSet::new(prompts), SIZE)
    }

    #[test]
    fn test_empty_set_rejected() {
        assert!(matches!(resolve(vec![]), Err(Error::InvalidPrompt(_))));
    }

    #[test]
    fn test_points_and_boxes_merge() {
        let request = resolve(vec![
            Prompt::foreground(10.0, 20.0),
            Prompt::background(30.0, 40.0),
            Prompt::rect(5.0, 5.0, 100.0, 50.0),
        ])
        .unwrap();

        match request {
            NormalizedRequest::Geometry { points, boxes } => {
                assert_eq!(points.len(), 2);
                assert_eq!(points[0].at, Point::new(10.0, 20.0));
                assert_eq!(points[1].label, PointLabel::Background);
                assert_eq!(boxes, vec![Rect::new(5.0, 5.0, 100.0, 50.0)]);
            }
            other => panic!("expected geometry request, got {:?}", other),
        }
    }

    #[test]
    fn test_text_passes_through() {
        let request = resolve(vec![Prompt::text("  the dog  ")]).unwrap();
        assert_eq!(
            request,
            NormalizedRequest::Text {
                query: "  the dog  ".to_string()
            }
        );
    }

    #[test]
    fn test_text_with_geometry_rejected() {
        let result = resolve(vec![Prompt::text("dog"), Prompt::foreground(1.0, 1.0)]);
        assert!(matches!(result, Err(Error::InvalidPrompt(_))));

        let result = resolve(vec![Prompt::rect(0.0, 0.0, 10.0, 10.0), Prompt::text("dog")]);
        assert!(matches!(result, Err(Error::InvalidPrompt(_))));
    }

    #[test]
    fn test_two_text_prompts_rejected() {
        let result = resolve(vec![Prompt::text("dog"), Prompt::text("cat")]);
        assert!(matches!(result, Err(Error::InvalidPrompt(_))));
    }

    #[test]
    fn test_degenerate_boxes_rejected() {
        for rect in [
            Prompt::rect(10.0, 10.0, 0.0, 5.0),
            Prompt::rect(10.0, 10.0, 5.0, 0.0),
            Prompt::rect(10.0, 10.0, -3.0, 5.0),
            Prompt::rect(f32::NAN, 10.0, 3.0, 5.0),
        ] {
            assert!(matches!(resolve(vec![rect]), Err(Error::InvalidPrompt(_))));
        }
    }

    #[test]
    fn test_box_outside_image_rejected() {
        assert!(resolve(vec![Prompt::rect(600.0, 0.0, 40.0, 480.0)]).is_ok());
        assert!(matches!(
            resolve(vec![Prompt::rect(600.0, 0.0, 41.0, 10.0)]),
            Err(Error::InvalidPrompt(_))
        ));
        assert!(matches!(
            resolve(vec![Prompt::rect(-1.0, 0.0, 10.0, 10.0)]),
            Err(Error::InvalidPrompt(_))
        ));
    }

    #[test]
    fn test_point_outside_image_rejected() {
        assert!(matches!(
            resolve(vec![Prompt::foreground(640.0, 10.0)]),
            Err(Error::InvalidPrompt(_))
        ));
        assert!(matches!(
            resolve(vec![Prompt::foreground(f32::INFINITY, 10.0)]),
            Err(Error::InvalidPrompt(_))
        ));
    }
}
