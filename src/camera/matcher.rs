//! Normalized sum-of-squared-errors template matching.

use image::imageops;
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};

use super::locator::{CameraError, CameraPosition, Frame, Located, Locator, SearchRequest, Template};

/// Default side of the tracking search window, in pixels.
pub const DEFAULT_SEARCH_DIAMETER: u32 = 100;

/// Extra pixels added around a template that does not fit the default window.
pub const SEARCH_MARGIN: u32 = 50;

/// Window side needed to track `template` without spurious misses.
///
/// Templates at least as large as the default window get a window of their
/// larger side plus a margin.
pub fn search_diameter_for(template: &Template, default_diameter: u32, margin: u32) -> u32 {
    let (w, h) = template.dimensions();
    if w >= default_diameter || h >= default_diameter {
        w.max(h) + margin
    } else {
        default_diameter
    }
}

/// Locates templates with imageproc's normalized SSE matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateMatcher;

impl TemplateMatcher {
    pub fn new() -> Self {
        Self
    }
}

impl Locator for TemplateMatcher {
    fn locate(
        &mut self,
        template: &Template,
        frame: &Frame,
        request: &SearchRequest,
    ) -> Result<Located, CameraError> {
        let (tw, th) = template.dimensions();
        if tw == 0 || th == 0 {
            return Err(CameraError::EmptyTemplate);
        }

        let Some((x0, y0, w, h)) = search_region(frame, request) else {
            tracing::debug!("Search window {:?} exceeds frame bounds", request);
            return Ok(Located::OutOfBounds);
        };
        if tw > w || th > h {
            return Ok(Located::OutOfBounds);
        }

        let region = imageops::crop_imm(frame, x0, y0, w, h).to_image();
        let scores = match_template(&region, template, MatchTemplateMethod::SumOfSquaredErrorsNormalized);
        let (mx, my) = find_extremes(&scores).min_value_location;

        let (dx, dy) = if request.subpixel {
            (
                parabolic_offset(|i| score_at(&scores, i, my as i64), mx as i64, scores.width()),
                parabolic_offset(|j| score_at(&scores, mx as i64, j), my as i64, scores.height()),
            )
        } else {
            (0.0, 0.0)
        };

        Ok(Located::Found(CameraPosition::new(
            (x0 + mx) as f64 + dx + tw as f64 / 2.0,
            (y0 + my) as f64 + dy + th as f64 / 2.0,
        )))
    }
}

/// Top-left corner and size of the region to search, or `None` if the
/// requested window leaves the frame.
fn search_region(frame: &Frame, request: &SearchRequest) -> Option<(u32, u32, u32, u32)> {
    let (fw, fh) = frame.dimensions();
    match (request.near, request.diameter) {
        (Some(near), Some(d)) => {
            let half = d as f64 / 2.0;
            let x0 = (near.x - half).round();
            let y0 = (near.y - half).round();
            if x0 < 0.0 || y0 < 0.0 || x0 + d as f64 > fw as f64 || y0 + d as f64 > fh as f64 {
                return None;
            }
            Some((x0 as u32, y0 as u32, d, d))
        }
        _ => Some((0, 0, fw, fh)),
    }
}

fn score_at(scores: &image::ImageBuffer<image::Luma<f32>, Vec<f32>>, x: i64, y: i64) -> f64 {
    scores.get_pixel(x as u32, y as u32)[0] as f64
}

/// Vertex offset of the parabola through the scores at `i-1`, `i`, `i+1`.
fn parabolic_offset(score: impl Fn(i64) -> f64, i: i64, len: u32) -> f64 {
    if i <= 0 || i + 1 >= len as i64 {
        return 0.0;
    }
    let (l, c, r) = (score(i - 1), score(i), score(i + 1));
    let denom = l - 2.0 * c + r;
    if !denom.is_finite() || denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{GrayImage, Luma};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn frame_with_square() -> Frame {
        let mut frame = GrayImage::from_pixel(200, 150, Luma([40u8]));
        draw_filled_rect_mut(&mut frame, Rect::at(120, 60).of_size(20, 20), Luma([220u8]));
        frame
    }

    fn square_template(frame: &Frame) -> Template {
        imageops::crop_imm(frame, 110, 50, 40, 40).to_image()
    }

    #[test]
    fn test_locate_whole_frame() {
        let frame = frame_with_square();
        let template = square_template(&frame);
        let mut matcher = TemplateMatcher::new();

        let found = matcher
            .locate(&template, &frame, &SearchRequest::whole_frame(false))
            .unwrap();
        assert_eq!(found, Located::Found(CameraPosition::new(130.0, 70.0)));
    }

    #[test]
    fn test_locate_subpixel_symmetric_peak() {
        let frame = frame_with_square();
        let template = square_template(&frame);
        let mut matcher = TemplateMatcher::new();

        let Located::Found(pos) = matcher
            .locate(&template, &frame, &SearchRequest::whole_frame(true))
            .unwrap()
        else {
            panic!("template not found");
        };
        assert_relative_eq!(pos.x, 130.0, epsilon = 1e-6);
        assert_relative_eq!(pos.y, 70.0, epsilon = 1e-6);
    }

    #[test]
    fn test_locate_in_window() {
        let frame = frame_with_square();
        let template = square_template(&frame);
        let mut matcher = TemplateMatcher::new();

        let request = SearchRequest::around(CameraPosition::new(128.0, 72.0), 60, false);
        let found = matcher.locate(&template, &frame, &request).unwrap();
        assert_eq!(found, Located::Found(CameraPosition::new(130.0, 70.0)));
    }

    #[test]
    fn test_window_outside_frame() {
        let frame = frame_with_square();
        let template = square_template(&frame);
        let mut matcher = TemplateMatcher::new();

        let request = SearchRequest::around(CameraPosition::new(10.0, 10.0), 60, false);
        assert_eq!(
            matcher.locate(&template, &frame, &request).unwrap(),
            Located::OutOfBounds
        );

        let too_small = SearchRequest::around(CameraPosition::new(130.0, 70.0), 30, false);
        assert_eq!(
            matcher.locate(&template, &frame, &too_small).unwrap(),
            Located::OutOfBounds
        );
    }

    #[test]
    fn test_search_diameter_for_large_templates() {
        let small = GrayImage::new(40, 80);
        let wide = GrayImage::new(120, 30);
        assert_eq!(search_diameter_for(&small, 100, 50), 100);
        assert_eq!(search_diameter_for(&wide, 100, 50), 170);
    }

    #[test]
    fn test_empty_template_is_an_error() {
        let frame = frame_with_square();
        let mut matcher = TemplateMatcher::new();
        let result = matcher.locate(&GrayImage::new(0, 0), &frame, &SearchRequest::default());
        assert!(matches!(result, Err(CameraError::EmptyTemplate)));
    }
}
