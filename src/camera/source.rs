//! Frame sources and template cropping.

use image::{imageops, GrayImage, Luma};
use imageproc::drawing::draw_filled_circle_mut;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::Path;

use super::locator::{CameraError, Frame, Template};
use crate::stage::PositionFeed;

/// Default frame width in pixels.
pub const DEFAULT_WIDTH: u32 = 640;

/// Default frame height in pixels.
pub const DEFAULT_HEIGHT: u32 = 480;

/// Something that produces greyscale frames.
pub trait Camera {
    /// Capture the latest frame.
    fn frame(&mut self) -> Result<Frame, CameraError>;

    /// Frame size as (width, height).
    fn resolution(&self) -> (u32, u32);
}

impl<C: Camera + ?Sized> Camera for Box<C> {
    fn frame(&mut self) -> Result<Frame, CameraError> {
        (**self).frame()
    }

    fn resolution(&self) -> (u32, u32) {
        (**self).resolution()
    }
}

/// Serves the same image on every capture.
pub struct StillCamera {
    image: Frame,
}

impl StillCamera {
    pub fn new(image: Frame) -> Self {
        Self { image }
    }

    /// Load an image file, converted to greyscale.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        Ok(Self::new(image::open(path)?.to_luma8()))
    }

    /// A uniform black frame.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(GrayImage::new(width, height))
    }
}

impl Camera for StillCamera {
    fn frame(&mut self) -> Result<Frame, CameraError> {
        Ok(self.image.clone())
    }

    fn resolution(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// A camera looking at a larger synthetic scene through an emulated stage.
///
/// Each frame is a window onto `scene`. The window moves as the stage moves:
/// a stage displacement `s` (microsteps) shifts features in the image by
/// `s · pixels_per_microstep` pixels.
pub struct SimulatedCamera {
    scene: GrayImage,
    width: u32,
    height: u32,
    feed: PositionFeed,
    pixels_per_microstep: [[f64; 2]; 2],
}

impl SimulatedCamera {
    pub fn new(
        scene: GrayImage,
        width: u32,
        height: u32,
        feed: PositionFeed,
        pixels_per_microstep: [[f64; 2]; 2],
    ) -> Result<Self, CameraError> {
        if scene.width() < width || scene.height() < height {
            return Err(CameraError::Simulation(format!(
                "scene {}x{} is smaller than the {}x{} frame",
                scene.width(),
                scene.height(),
                width,
                height
            )));
        }
        Ok(Self {
            scene,
            width,
            height,
            feed,
            pixels_per_microstep,
        })
    }

    fn window_origin(&self) -> (u32, u32) {
        let [sx, sy] = self.feed.get().xy().map(|v| v as f64);
        let m = &self.pixels_per_microstep;
        let shift_x = sx * m[0][0] + sy * m[1][0];
        let shift_y = sx * m[0][1] + sy * m[1][1];

        let max_x = (self.scene.width() - self.width) as f64;
        let max_y = (self.scene.height() - self.height) as f64;
        let x = (max_x / 2.0 - shift_x).round().clamp(0.0, max_x);
        let y = (max_y / 2.0 - shift_y).round().clamp(0.0, max_y);
        (x as u32, y as u32)
    }
}

impl Camera for SimulatedCamera {
    fn frame(&mut self) -> Result<Frame, CameraError> {
        let (x, y) = self.window_origin();
        Ok(imageops::crop_imm(&self.scene, x, y, self.width, self.height).to_image())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Draw a deterministic field of bright blobs on a dark background.
pub fn generate_scene(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut scene = GrayImage::from_pixel(width, height, Luma([25u8]));
    if width == 0 || height == 0 {
        return scene;
    }
    let mut rng = StdRng::seed_from_u64(seed);

    let blobs = (width as u64 * height as u64 / 4000).max(1);
    for _ in 0..blobs {
        let cx = rng.random_range(0..width) as i32;
        let cy = rng.random_range(0..height) as i32;
        let radius = rng.random_range(3..13);
        let value = rng.random_range(90..250u8);
        draw_filled_circle_mut(&mut scene, (cx, cy), radius, Luma([value]));
    }
    scene
}

/// The central half of a frame, used as a default calibration template.
pub fn crop_centre_half(frame: &Frame) -> Template {
    let (w, h) = frame.dimensions();
    imageops::crop_imm(frame, w / 4, h / 4, w / 2, h / 2).to_image()
}

/// Cut a `width` x `height` template with its top-left corner at (`x`, `y`).
pub fn crop_template(
    frame: &Frame,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> Result<Template, CameraError> {
    let (fw, fh) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(CameraError::EmptyTemplate);
    }
    let fits = |start: u32, len: u32, limit: u32| {
        start.checked_add(len).is_some_and(|end| end <= limit)
    };
    if !fits(x, width, fw) || !fits(y, height, fh) {
        return Err(CameraError::Capture(format!(
            "selection {}x{}+{}+{} exceeds {}x{} frame",
            width, height, x, y, fw, fh
        )));
    }
    Ok(imageops::crop_imm(frame, x, y, width, height).to_image())
}
