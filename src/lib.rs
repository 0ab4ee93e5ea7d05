// Copyright 2025 The microscope-stage Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Microscope Stage
//!
//! Control of a 3-axis stepper-motor microscope stage, with closed-loop
//! centring on a camera template and calibration of the pixel-to-stage
//! transform.
//!
//! The stage talks a line-based serial protocol (`move_rel a b c`,
//! `fast_move a b c`, `release`) to a small controller board. Positions are
//! tracked in software and every move is bounds-checked.
//!
//! ## Example
//!
//! ```rust,no_run
//! use microscope_stage::{
//!     CalibrationConfig, Microscope, ServoConfig, Stage, StillCamera, TemplateMatcher,
//!     TransportMode,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let transport = TransportMode::Serial {
//!         path: "/dev/ttyACM0".to_string(),
//!         baud: 9600,
//!     }
//!     .open()?;
//!     let mut scope = Microscope::new(
//!         Stage::new(transport),
//!         Box::new(StillCamera::open("frame.png")?),
//!         Box::new(TemplateMatcher::new()),
//!     );
//!
//!     let calibration = scope.calibrate(None, &CalibrationConfig::default())?;
//!     scope.transform = calibration.transform;
//!
//!     scope.select_region(280, 200, 80, 80)?;
//!     let run = scope.track_selection(&ServoConfig::default())?;
//!     println!("Centred: {}", run.is_converged());
//!     Ok(())
//! }
//! ```

pub mod calibration;
pub mod camera;
pub mod datafile;
pub mod microscope;
pub mod servo;
pub mod settings;
pub mod stage;

pub use calibration::{
    fit_transform, CalibrationConfig, CalibrationError, CalibrationResult, CalibrationSample,
    StageCalibrator, TransformMatrix,
};
pub use camera::{
    Camera, CameraError, CameraPosition, Located, Locator, SearchRequest, SimulatedCamera,
    StillCamera, Template, TemplateMatcher,
};
pub use datafile::{Datafile, DatafileError};
pub use microscope::Microscope;
pub use servo::{
    centre_on_template, ServoConfig, ServoError, ServoRun, ServoStatus, DEFAULT_UM_PER_PIXEL,
};
pub use settings::AppSettings;
pub use stage::{
    EmulatedTransport, MoveOptions, MoveOutcome, Position, SerialTransport, Stage, StageError,
    Transport, TransportError, TransportMode,
};
