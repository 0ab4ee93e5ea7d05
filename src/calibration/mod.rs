//! Camera-to-stage calibration.

mod calibrator;
mod transform;

pub use calibrator::{
    CalibrationConfig, CalibrationError, CalibrationResult, StageCalibrator, DEFAULT_HALF_WIDTH,
};
pub use transform::{fit_transform, CalibrationSample, TransformFit, TransformMatrix};
