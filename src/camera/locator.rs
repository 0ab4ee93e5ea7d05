//! Template location: where is the tracked object in this frame?

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};
use thiserror::Error;

/// A camera frame. Only ever consumed by a [`Locator`].
pub type Frame = GrayImage;

/// A sub-image pattern, captured once and searched for in later frames.
pub type Template = GrayImage;

/// Camera and template search errors.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Frame capture failed: {0}")]
    Capture(String),
    #[error("Template is empty")]
    EmptyTemplate,
    #[error("Failed to load image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Simulation error: {0}")]
    Simulation(String),
}

/// Pixel coordinates in a frame, origin top-left, possibly sub-pixel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraPosition {
    pub x: f64,
    pub y: f64,
}

impl CameraPosition {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean length when used as a displacement.
    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Centre of a `width` x `height` frame.
    pub fn centre_of(width: u32, height: u32) -> Self {
        Self::new(width as f64 / 2.0, height as f64 / 2.0)
    }
}

impl Sub for CameraPosition {
    type Output = CameraPosition;

    fn sub(self, rhs: CameraPosition) -> CameraPosition {
        CameraPosition::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Add for CameraPosition {
    type Output = CameraPosition;

    fn add(self, rhs: CameraPosition) -> CameraPosition {
        CameraPosition::new(self.x + rhs.x, self.y + rhs.y)
    }
}

/// Where and how to search for a template.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SearchRequest {
    /// Last known position; the search window is centred here.
    pub near: Option<CameraPosition>,
    /// Side of the square search window in pixels. `None` searches the
    /// whole frame.
    pub diameter: Option<u32>,
    /// Refine the match below one pixel.
    pub subpixel: bool,
}

impl SearchRequest {
    /// Search the whole frame.
    pub fn whole_frame(subpixel: bool) -> Self {
        Self {
            near: None,
            diameter: None,
            subpixel,
        }
    }

    /// Search a square window around a known position.
    pub fn around(near: CameraPosition, diameter: u32, subpixel: bool) -> Self {
        Self {
            near: Some(near),
            diameter: Some(diameter),
            subpixel,
        }
    }
}

/// Outcome of a template search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Located {
    /// Centre of the best match.
    Found(CameraPosition),
    /// The requested search window does not fit inside the frame.
    OutOfBounds,
}

/// Finds a template in a frame.
pub trait Locator {
    fn locate(
        &mut self,
        template: &Template,
        frame: &Frame,
        request: &SearchRequest,
    ) -> Result<Located, CameraError>;
}

impl<L: Locator + ?Sized> Locator for Box<L> {
    fn locate(
        &mut self,
        template: &Template,
        frame: &Frame,
        request: &SearchRequest,
    ) -> Result<Located, CameraError> {
        (**self).locate(template, frame, request)
    }
}
