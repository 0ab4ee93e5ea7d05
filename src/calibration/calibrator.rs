//! Camera-to-stage calibration by stepping the stage around a square.
//!
//! The stage is driven to four corners of a square around a reference point.
//! At each corner the reference template is located again; the pixel
//! displacements and the commanded stage displacements are then fitted to a
//! 2x2 matrix with [`fit_transform`].
//!
//! Every waypoint is approached from the same side to take up backlash in
//! the lead screws.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::transform::{fit_transform, CalibrationSample, TransformMatrix};
use crate::camera::{crop_centre_half, CameraError, CameraPosition, Located, SearchRequest, Template};
use crate::microscope::Microscope;
use crate::stage::{MoveOptions, MoveOutcome, Position, StageError, Transport};

/// Default half side of the calibration square, in microsteps.
pub const DEFAULT_HALF_WIDTH: i64 = 128;

/// Calibration errors.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Template lost during calibration")]
    TemplateLost,
    #[error("Calibration waypoint {0} is outside the stage travel bounds")]
    OutOfBounds(Position),
    #[error("Degenerate calibration data: {0}")]
    Degenerate(String),
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
}

/// Calibration configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Half side of the square pattern, in microsteps
    pub half_width: i64,
    /// Offset approached first when moving to the neutral start point
    pub approach_offset: Position,
    /// Offset approached first when moving to each waypoint
    pub backlash_offset: Position,
    /// Wait after each move before grabbing a frame
    pub settle: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            half_width: DEFAULT_HALF_WIDTH,
            approach_offset: Position::new(16, 16, 0),
            backlash_offset: Position::new(-32, -16, 0),
            settle: Duration::from_secs(1),
        }
    }
}

impl CalibrationConfig {
    pub fn with_half_width(mut self, half_width: i64) -> Self {
        self.half_width = half_width;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_backlash_offset(mut self, offset: Position) -> Self {
        self.backlash_offset = offset;
        self
    }

    /// Square corners relative to the reference, in visiting order.
    pub fn waypoints(&self) -> [Position; 4] {
        let d = self.half_width;
        [
            Position::new(d, d, 0),
            Position::new(d, -d, 0),
            Position::new(-d, -d, 0),
            Position::new(-d, d, 0),
        ]
    }
}

/// Result of a calibration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Fitted pixel-to-microstep matrix
    pub transform: TransformMatrix,
    /// Measurements the fit was made from
    pub samples: Vec<CalibrationSample>,
    /// Template position at the reference point
    pub reference_position: CameraPosition,
    /// Sum of squared residuals per stage axis
    pub residuals: Option<[f64; 2]>,
    /// Frobenius norm of the fitted matrix
    pub norm: f64,
    pub rank: usize,
    pub singular_values: [f64; 2],
    pub timestamp: DateTime<Utc>,
}

/// Runs the square calibration pattern on a [`Microscope`].
pub struct StageCalibrator {
    config: CalibrationConfig,
}

impl StageCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Calibrate against `template`, or the central half of the frame at the
    /// neutral point if none is given.
    ///
    /// On success the stage is back at the reference point with its motors
    /// released. The microscope's own transform is left untouched.
    pub fn calibrate<T: Transport>(
        &self,
        scope: &mut Microscope<T>,
        template: Option<&Template>,
    ) -> Result<CalibrationResult, CalibrationError> {
        let result = self.run_pattern(scope, template);
        if result.is_err() {
            if let Err(e) = scope.stage.release() {
                tracing::warn!("Failed to release stage after calibration error: {}", e);
            }
        }
        result
    }

    fn run_pattern<T: Transport>(
        &self,
        scope: &mut Microscope<T>,
        template: Option<&Template>,
    ) -> Result<CalibrationResult, CalibrationError> {
        // Neutral start point, approached from the same side every time
        self.backlash_move(scope, Position::ORIGIN, self.config.approach_offset)?;

        let template = match template {
            Some(t) => t.clone(),
            None => crop_centre_half(&scope.capture()?),
        };

        self.settle();
        let reference_position = self.measure(scope, &template)?;
        let reference_stage = scope.stage.position();
        tracing::info!(
            "Calibration reference: template at {:?}, stage at {}",
            reference_position,
            reference_stage
        );

        let mut samples = Vec::with_capacity(4);
        for offset in self.config.waypoints() {
            let target = reference_stage + offset;
            self.backlash_move(scope, target, self.config.backlash_offset)?;
            self.settle();

            let position = self.measure(scope, &template)?;
            let stage_displacement = scope.stage.position() - reference_stage;
            let sample =
                CalibrationSample::new(position - reference_position, stage_displacement.xy());
            tracing::info!(
                "Calibration sample: stage {:?} -> camera ({:.2}, {:.2})",
                sample.stage_displacement,
                sample.camera_displacement.x,
                sample.camera_displacement.y
            );
            samples.push(sample);
        }

        let fit = fit_transform(&samples)?;
        tracing::info!(
            "Calibration fit: {:?}, residuals {:?}, norm {:.3}",
            fit.transform.rows,
            fit.residuals,
            fit.norm
        );

        self.move_to(scope, reference_stage, MoveOptions::held())?;
        scope.stage.release()?;

        Ok(CalibrationResult {
            transform: fit.transform,
            samples,
            reference_position,
            residuals: fit.residuals,
            norm: fit.norm,
            rank: fit.rank,
            singular_values: fit.singular_values,
            timestamp: Utc::now(),
        })
    }

    fn measure<T: Transport>(
        &self,
        scope: &mut Microscope<T>,
        template: &Template,
    ) -> Result<CameraPosition, CalibrationError> {
        match scope.find_template(template, &SearchRequest::whole_frame(true))? {
            Located::Found(position) => Ok(position),
            Located::OutOfBounds => Err(CalibrationError::TemplateLost),
        }
    }

    /// Move to `target` via `target + offset`, holding power throughout.
    fn backlash_move<T: Transport>(
        &self,
        scope: &mut Microscope<T>,
        target: Position,
        offset: Position,
    ) -> Result<(), CalibrationError> {
        self.move_to(scope, target + offset, MoveOptions::held())?;
        self.move_to(scope, target, MoveOptions::held())
    }

    fn move_to<T: Transport>(
        &self,
        scope: &mut Microscope<T>,
        target: Position,
        opts: MoveOptions,
    ) -> Result<(), CalibrationError> {
        match scope.stage.move_to_pos(target, opts)? {
            MoveOutcome::Moved { .. } => Ok(()),
            MoveOutcome::OutOfBounds { requested, .. } => {
                Err(CalibrationError::OutOfBounds(requested))
            }
        }
    }

    fn settle(&self) {
        if !self.config.settle.is_zero() {
            std::thread::sleep(self.config.settle);
        }
    }
}
