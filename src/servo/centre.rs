//! Closed-loop centring: move the stage until the template sits at the
//! middle of the frame.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::camera::{
    search_diameter_for, CameraError, CameraPosition, Located, SearchRequest, Template,
    DEFAULT_SEARCH_DIAMETER, SEARCH_MARGIN,
};
use crate::microscope::Microscope;
use crate::stage::{MoveOptions, MoveOutcome, Position, StageError, Transport};

/// Sample-plane distance covered by one camera pixel, in microns.
pub const DEFAULT_UM_PER_PIXEL: f64 = 0.4846;

/// Servo errors. Losing the target is not an error; see [`ServoStatus`].
#[derive(Error, Debug)]
pub enum ServoError {
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("No template selected")]
    NoSelection,
}

/// Centring loop configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServoConfig {
    /// Stop once the template is this close to the frame centre, in microns
    pub tolerance: f64,
    /// Pixel size in the sample plane, in microns
    pub um_per_pixel: f64,
    /// Maximum number of corrective moves
    pub max_iterations: u32,
    /// Leave the motors energized when the loop ends
    pub hold_at_end: bool,
    /// Wait after each move before grabbing a frame
    pub settle: Duration,
    /// Search window side for small templates
    pub default_search_diameter: u32,
    /// Added to the larger template side for large templates
    pub search_margin: u32,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            tolerance: 1.0,
            um_per_pixel: DEFAULT_UM_PER_PIXEL,
            max_iterations: 10,
            hold_at_end: true,
            settle: Duration::from_millis(500),
            default_search_diameter: DEFAULT_SEARCH_DIAMETER,
            search_margin: SEARCH_MARGIN,
        }
    }
}

impl ServoConfig {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_um_per_pixel(mut self, um_per_pixel: f64) -> Self {
        self.um_per_pixel = um_per_pixel;
        self
    }

    /// Sample-plane length of a pixel offset, in microns.
    pub fn distance(&self, offset: CameraPosition) -> f64 {
        offset.norm() * self.um_per_pixel
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_hold_at_end(mut self, hold_at_end: bool) -> Self {
        self.hold_at_end = hold_at_end;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

/// How a centring run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServoStatus {
    Converged,
    /// The iteration budget ran out with the template still off-centre.
    NotConverged,
    /// The search window left the frame; the template is considered lost.
    TargetLost,
}

/// Log of a centring run.
///
/// `camera_positions[i]` was measured after `stage_moves[i]` was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServoRun {
    iteration: i64,
    status: ServoStatus,
    initial_position: Option<CameraPosition>,
    camera_positions: Vec<CameraPosition>,
    stage_moves: Vec<Position>,
}

impl ServoRun {
    /// Moves made when converged (0 if the template was already centred).
    /// Always negative otherwise: `-max_iterations` when the budget ran out,
    /// `-(moves + 1)` when the target was lost.
    pub fn iteration(&self) -> i64 {
        self.iteration
    }

    pub fn status(&self) -> ServoStatus {
        self.status
    }

    pub fn is_converged(&self) -> bool {
        self.status == ServoStatus::Converged
    }

    /// Template position before any move, if it was found at all.
    pub fn initial_position(&self) -> Option<CameraPosition> {
        self.initial_position
    }

    pub fn camera_positions(&self) -> &[CameraPosition] {
        &self.camera_positions
    }

    /// Requested corrections. A move the stage refused as out of bounds is
    /// still listed, although nothing was sent to the device.
    pub fn stage_moves(&self) -> &[Position] {
        &self.stage_moves
    }

    /// Last measured template position.
    pub fn final_position(&self) -> Option<CameraPosition> {
        self.camera_positions.last().copied().or(self.initial_position)
    }
}

/// Drive the stage until `template` is within `config.tolerance` microns of
/// the frame centre.
///
/// The first search covers the whole frame. Each correction is the pixel
/// offset to the centre mapped through the microscope's transform; the next
/// search uses a window around where that correction should have put the
/// template.
pub fn centre_on_template<T: Transport>(
    scope: &mut Microscope<T>,
    template: &Template,
    config: &ServoConfig,
) -> Result<ServoRun, ServoError> {
    let diameter = search_diameter_for(
        template,
        config.default_search_diameter,
        config.search_margin,
    );
    let centre = scope.frame_centre();
    let transform = scope.transform;

    let mut run = ServoRun {
        iteration: 0,
        status: ServoStatus::TargetLost,
        initial_position: None,
        camera_positions: Vec::new(),
        stage_moves: Vec::new(),
    };

    let mut position = match scope.find_template(template, &SearchRequest::whole_frame(true))? {
        Located::Found(p) => p,
        Located::OutOfBounds => {
            tracing::warn!("Template not found, centring aborted");
            run.iteration = -1;
            return finish(scope, config, run);
        }
    };
    run.initial_position = Some(position);

    let mut completed: u32 = 0;
    let mut offset = centre - position;
    while config.distance(offset) > config.tolerance && completed < config.max_iterations {
        let step = transform.to_stage_move(offset);
        let expected = match scope.stage.move_rel(step, MoveOptions::held())? {
            MoveOutcome::Moved { .. } => position + offset,
            MoveOutcome::OutOfBounds { requested, bound } => {
                tracing::warn!(
                    "Centring move to {} exceeds +/-{}, continuing without it",
                    requested,
                    bound
                );
                position
            }
        };
        if !config.settle.is_zero() {
            std::thread::sleep(config.settle);
        }

        let request = SearchRequest::around(expected, diameter, true);
        position = match scope.find_template(template, &request)? {
            Located::Found(p) => p,
            Located::OutOfBounds => {
                tracing::warn!("Lost the template after {} moves", completed);
                run.iteration = -(completed as i64 + 1);
                return finish(scope, config, run);
            }
        };

        completed += 1;
        run.stage_moves.push(step);
        run.camera_positions.push(position);
        offset = centre - position;
        tracing::debug!(
            "Centring move {}: {} -> offset {:.2} um",
            completed,
            step,
            config.distance(offset)
        );
    }

    if config.distance(offset) <= config.tolerance {
        run.status = ServoStatus::Converged;
        run.iteration = completed as i64;
        tracing::info!("Template centred after {} moves", completed);
    } else {
        run.status = ServoStatus::NotConverged;
        run.iteration = -(config.max_iterations.max(1) as i64);
        tracing::warn!(
            "Centring did not converge in {} moves, {:.2} um off",
            config.max_iterations,
            config.distance(offset)
        );
    }
    finish(scope, config, run)
}

fn finish<T: Transport>(
    scope: &mut Microscope<T>,
    config: &ServoConfig,
    run: ServoRun,
) -> Result<ServoRun, ServoError> {
    if !config.hold_at_end {
        scope.stage.release()?;
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Frame, Locator, StillCamera};
    use crate::stage::{EmulatedTransport, PowerState, Stage};
    use image::GrayImage;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Moves the template halfway to the centre on every look after the first.
    struct HalvingLocator {
        position: CameraPosition,
        requests: Rc<RefCell<Vec<SearchRequest>>>,
    }

    impl Locator for HalvingLocator {
        fn locate(
            &mut self,
            _template: &Template,
            _frame: &Frame,
            request: &SearchRequest,
        ) -> Result<Located, CameraError> {
            let looks = {
                let mut requests = self.requests.borrow_mut();
                requests.push(*request);
                requests.len()
            };
            if looks > 1 {
                let centre = CameraPosition::centre_of(640, 480);
                let offset = centre - self.position;
                self.position = CameraPosition::new(
                    self.position.x + offset.x / 2.0,
                    self.position.y + offset.y / 2.0,
                );
            }
            Ok(Located::Found(self.position))
        }
    }

    /// Always reports the same spot.
    struct FixedLocator(CameraPosition);

    impl Locator for FixedLocator {
        fn locate(
            &mut self,
            _template: &Template,
            _frame: &Frame,
            _request: &SearchRequest,
        ) -> Result<Located, CameraError> {
            Ok(Located::Found(self.0))
        }
    }

    /// Finds the template `found` times, then reports the window off-frame.
    struct FadingLocator {
        found: usize,
    }

    impl Locator for FadingLocator {
        fn locate(
            &mut self,
            _template: &Template,
            _frame: &Frame,
            _request: &SearchRequest,
        ) -> Result<Located, CameraError> {
            if self.found == 0 {
                return Ok(Located::OutOfBounds);
            }
            self.found -= 1;
            Ok(Located::Found(CameraPosition::new(400.0, 300.0)))
        }
    }

    fn scope_with(locator: Box<dyn Locator>) -> Microscope<EmulatedTransport> {
        Microscope::new(
            Stage::new(EmulatedTransport::new()),
            Box::new(StillCamera::blank(640, 480)),
            locator,
        )
    }

    fn quick() -> ServoConfig {
        ServoConfig::default().with_settle(Duration::ZERO)
    }

    fn template(size: u32) -> Template {
        GrayImage::new(size, size)
    }

    #[test]
    fn test_halving_offset_converges() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let locator = HalvingLocator {
            position: CameraPosition::new(320.0 + 16.0, 240.0),
            requests: requests.clone(),
        };
        let mut scope = scope_with(Box::new(locator));

        let run = centre_on_template(&mut scope, &template(20), &quick()).unwrap();

        // 16 -> 8 -> 4 -> 2 px; 2 px is under a micron
        assert!(run.is_converged());
        assert_eq!(run.iteration(), 3);
        assert_eq!(run.stage_moves().len(), run.camera_positions().len());
        assert_eq!(run.camera_positions().len(), 3);
        assert_eq!(run.final_position(), Some(CameraPosition::new(322.0, 240.0)));
        assert!(run.camera_positions().windows(2).all(|w| {
            let centre = CameraPosition::centre_of(640, 480);
            (centre - w[1]).norm() < (centre - w[0]).norm()
        }));

        // Offset (-16, 0) through the default matrix
        assert_eq!(run.stage_moves()[0], Position::new(-83, -112, 0));

        let requests = requests.borrow();
        assert_eq!(requests[0], SearchRequest::whole_frame(true));
        assert_eq!(requests[1].diameter, Some(DEFAULT_SEARCH_DIAMETER));
        assert_eq!(requests[1].near, Some(CameraPosition::new(320.0, 240.0)));
    }

    #[test]
    fn test_already_centred_makes_no_moves() {
        let mut scope = scope_with(Box::new(FixedLocator(CameraPosition::new(320.5, 239.5))));
        let run = centre_on_template(&mut scope, &template(20), &quick()).unwrap();

        assert!(run.is_converged());
        assert_eq!(run.iteration(), 0);
        assert!(run.stage_moves().is_empty());
        assert!(scope.stage.transport().history().is_empty());
    }

    #[test]
    fn test_tolerance_is_in_microns() {
        let off_centre = CameraPosition::new(321.5, 240.0);

        let mut scope = scope_with(Box::new(FixedLocator(off_centre)));
        let run = centre_on_template(&mut scope, &template(20), &quick()).unwrap();
        assert!(run.is_converged());
        assert_eq!(run.iteration(), 0);

        // The same 1.5 px offset is too far with 1 um pixels
        let mut scope = scope_with(Box::new(FixedLocator(off_centre)));
        let config = quick().with_um_per_pixel(1.0).with_max_iterations(2);
        let run = centre_on_template(&mut scope, &template(20), &config).unwrap();
        assert_eq!(run.status(), ServoStatus::NotConverged);
        assert_eq!(run.iteration(), -2);
    }

    #[test]
    fn test_never_converging_reports_negative_budget() {
        let mut scope = scope_with(Box::new(FixedLocator(CameraPosition::new(300.0, 200.0))));
        let config = quick().with_max_iterations(3);
        let run = centre_on_template(&mut scope, &template(20), &config).unwrap();

        assert_eq!(run.status(), ServoStatus::NotConverged);
        assert_eq!(run.iteration(), -3);
        assert_eq!(run.stage_moves().len(), 3);
        assert_eq!(run.camera_positions().len(), 3);
        assert_eq!(scope.stage.power(), PowerState::Holding);
    }

    #[test]
    fn test_target_lost_stops_early() {
        let mut scope = scope_with(Box::new(FadingLocator { found: 2 }));
        let run = centre_on_template(&mut scope, &template(20), &quick()).unwrap();

        assert_eq!(run.status(), ServoStatus::TargetLost);
        assert_eq!(run.iteration(), -2);
        assert_eq!(run.initial_position(), Some(CameraPosition::new(400.0, 300.0)));
        assert_eq!(run.camera_positions().len(), 1);
        assert_eq!(run.stage_moves().len(), 1);
    }

    #[test]
    fn test_target_missing_from_the_start() {
        let mut scope = scope_with(Box::new(FadingLocator { found: 0 }));
        let run = centre_on_template(&mut scope, &template(20), &quick()).unwrap();

        assert_eq!(run.status(), ServoStatus::TargetLost);
        assert!(run.iteration() < 0);
        assert_eq!(run.iteration(), -1);
        assert_eq!(run.initial_position(), None);
        assert_eq!(run.final_position(), None);
    }

    #[test]
    fn test_release_at_end() {
        let mut scope = scope_with(Box::new(FixedLocator(CameraPosition::new(300.0, 200.0))));
        let config = quick().with_max_iterations(1).with_hold_at_end(false);
        centre_on_template(&mut scope, &template(20), &config).unwrap();

        assert_eq!(scope.stage.power(), PowerState::Released);
        assert_eq!(
            scope.stage.transport().history().last().map(String::as_str),
            Some("release")
        );
    }

    #[test]
    fn test_large_template_widens_window() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let locator = HalvingLocator {
            position: CameraPosition::new(330.0, 240.0),
            requests: requests.clone(),
        };
        let mut scope = scope_with(Box::new(locator));
        centre_on_template(&mut scope, &template(120), &quick()).unwrap();

        assert_eq!(requests.borrow()[1].diameter, Some(170));
    }
}
