//! Camera-to-stage transform and its least-squares fit.

use nalgebra::{DMatrix, Matrix2};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::calibrator::CalibrationError;
use crate::camera::CameraPosition;
use crate::stage::Position;

/// Linear map from a pixel displacement to a stage displacement in microsteps.
///
/// Row-vector convention: `stage = [dx, dy] · rows`, z is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformMatrix {
    pub rows: [[f64; 2]; 2],
}

impl Default for TransformMatrix {
    /// Hand-measured matrix for the usual camera mounting. Recalibrate after
    /// touching the optics.
    fn default() -> Self {
        Self::new([[5.2, 7.0], [6.3, -5.6]])
    }
}

impl TransformMatrix {
    pub fn new(rows: [[f64; 2]; 2]) -> Self {
        Self { rows }
    }

    pub fn identity() -> Self {
        Self::new([[1.0, 0.0], [0.0, 1.0]])
    }

    /// Map a pixel displacement to a (real-valued) stage displacement.
    pub fn apply(&self, offset: CameraPosition) -> [f64; 2] {
        let m = &self.rows;
        [
            offset.x * m[0][0] + offset.y * m[1][0],
            offset.x * m[0][1] + offset.y * m[1][1],
        ]
    }

    /// Stage move for a pixel displacement: truncated toward zero, z = 0.
    pub fn to_stage_move(&self, offset: CameraPosition) -> Position {
        let [x, y] = self.apply(offset);
        Position::new(x.trunc() as i64, y.trunc() as i64, 0)
    }

    /// Inverse map (stage microsteps to pixels), if the matrix is invertible.
    pub fn inverse(&self) -> Option<[[f64; 2]; 2]> {
        let inv = self.as_matrix().try_inverse()?;
        Some([[inv[(0, 0)], inv[(0, 1)]], [inv[(1, 0)], inv[(1, 1)]]])
    }

    /// Frobenius norm.
    pub fn norm(&self) -> f64 {
        self.as_matrix().norm()
    }

    pub fn as_matrix(&self) -> Matrix2<f64> {
        let m = &self.rows;
        Matrix2::new(m[0][0], m[0][1], m[1][0], m[1][1])
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// One calibration measurement, relative to the common reference point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    /// Template displacement in the image, in pixels.
    pub camera_displacement: CameraPosition,
    /// Stage displacement (x, y), in microsteps.
    pub stage_displacement: [i64; 2],
}

impl CalibrationSample {
    pub fn new(camera_displacement: CameraPosition, stage_displacement: [i64; 2]) -> Self {
        Self {
            camera_displacement,
            stage_displacement,
        }
    }
}

/// A fitted transform with its quality diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformFit {
    pub transform: TransformMatrix,
    /// Sum of squared residuals per stage axis. Only defined for a
    /// full-rank, overdetermined system.
    pub residuals: Option<[f64; 2]>,
    /// Frobenius norm of the fitted matrix.
    pub norm: f64,
    pub rank: usize,
    pub singular_values: [f64; 2],
}

/// Fit the transform mapping camera displacements onto stage displacements.
///
/// Camera displacements are mean-centred first, which cancels a constant
/// offset such as a reference template that was not quite centred. Stage
/// displacements are used as measured. Solves `min ‖C·A − S‖²` by SVD.
pub fn fit_transform(samples: &[CalibrationSample]) -> Result<TransformFit, CalibrationError> {
    let n = samples.len();
    if n < 2 {
        return Err(CalibrationError::Degenerate(format!(
            "need at least 2 samples, got {}",
            n
        )));
    }

    let mean_x = samples.iter().map(|s| s.camera_displacement.x).sum::<f64>() / n as f64;
    let mean_y = samples.iter().map(|s| s.camera_displacement.y).sum::<f64>() / n as f64;

    let camera = DMatrix::from_fn(n, 2, |i, j| {
        let c = samples[i].camera_displacement;
        if j == 0 {
            c.x - mean_x
        } else {
            c.y - mean_y
        }
    });
    let stage = DMatrix::from_fn(n, 2, |i, j| samples[i].stage_displacement[j] as f64);

    let svd = camera.clone().svd(true, true);
    let rank = svd.rank(1e-10 * svd.singular_values.max().max(1.0));
    let singular_values = [svd.singular_values[0], svd.singular_values[1]];
    if rank < 2 {
        return Err(CalibrationError::Degenerate(format!(
            "camera displacements have rank {}",
            rank
        )));
    }

    let a = svd
        .solve(&stage, 1e-10)
        .map_err(|e| CalibrationError::Degenerate(e.to_string()))?;

    let residuals = if n > 2 {
        let r = &camera * &a - &stage;
        Some([r.column(0).norm_squared(), r.column(1).norm_squared()])
    } else {
        None
    };

    let transform = TransformMatrix::new([[a[(0, 0)], a[(0, 1)]], [a[(1, 0)], a[(1, 1)]]]);
    Ok(TransformFit {
        transform,
        residuals,
        norm: transform.norm(),
        rank,
        singular_values,
    })
}
