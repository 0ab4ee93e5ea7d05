//! The microscope context shared by the servo loop and calibration.

use crate::calibration::{
    CalibrationConfig, CalibrationError, CalibrationResult, StageCalibrator, TransformMatrix,
};
use crate::camera::{
    crop_template, Camera, CameraError, CameraPosition, Frame, Located, Locator, SearchRequest,
    Template,
};
use crate::servo::{centre_on_template, ServoConfig, ServoError, ServoRun, ServoStatus};
use crate::stage::{Stage, Transport};

/// A stage, a camera looking through it, and the transform between them.
///
/// Also holds the currently selected template, if any.
pub struct Microscope<T: Transport> {
    pub stage: Stage<T>,
    /// Pixel-to-microstep transform used by [`Microscope::centre_on_template`].
    pub transform: TransformMatrix,
    camera: Box<dyn Camera>,
    locator: Box<dyn Locator>,
    selection: Option<Template>,
}

impl<T: Transport> Microscope<T> {
    pub fn new(stage: Stage<T>, camera: Box<dyn Camera>, locator: Box<dyn Locator>) -> Self {
        Self {
            stage,
            transform: TransformMatrix::default(),
            camera,
            locator,
            selection: None,
        }
    }

    pub fn with_transform(mut self, transform: TransformMatrix) -> Self {
        self.transform = transform;
        self
    }

    /// Grab a frame.
    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        self.camera.frame()
    }

    /// Centre of the camera frame, in pixels.
    pub fn frame_centre(&self) -> CameraPosition {
        let (w, h) = self.camera.resolution();
        CameraPosition::centre_of(w, h)
    }

    /// Grab a frame and search it for `template`.
    pub fn find_template(
        &mut self,
        template: &Template,
        request: &SearchRequest,
    ) -> Result<Located, CameraError> {
        let frame = self.camera.frame()?;
        self.locator.locate(template, &frame, request)
    }

    pub fn selection(&self) -> Option<&Template> {
        self.selection.as_ref()
    }

    /// Use `template` as the tracked selection.
    pub fn select(&mut self, template: Template) {
        self.selection = Some(template);
    }

    /// Select a region of the current frame, top-left at (`x`, `y`).
    pub fn select_region(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<&Template, CameraError> {
        let frame = self.capture()?;
        let template = crop_template(&frame, x, y, width, height)?;
        Ok(self.selection.insert(template))
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
    }

    /// Centre `template` in the frame. See [`centre_on_template`].
    pub fn centre_on_template(
        &mut self,
        template: &Template,
        config: &ServoConfig,
    ) -> Result<ServoRun, ServoError> {
        centre_on_template(self, template, config)
    }

    /// Centre the current selection, dropping it if it is lost.
    pub fn track_selection(&mut self, config: &ServoConfig) -> Result<ServoRun, ServoError> {
        let template = self.selection.clone().ok_or(ServoError::NoSelection)?;
        let run = centre_on_template(self, &template, config)?;
        if run.status() == ServoStatus::TargetLost {
            tracing::info!("Selection lost, clearing it");
            self.clear_selection();
        }
        Ok(run)
    }

    /// Run the square calibration. The fitted transform is returned, not
    /// applied.
    pub fn calibrate(
        &mut self,
        template: Option<&Template>,
        config: &CalibrationConfig,
    ) -> Result<CalibrationResult, CalibrationError> {
        StageCalibrator::new(config.clone()).calibrate(self, template)
    }
}
