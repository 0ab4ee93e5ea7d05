//! Stage motion controller: tracked position, travel bounds and motor power.

use thiserror::Error;

use super::position::Position;
use super::transport::{Transport, TransportError};

/// Default travel limit on every axis, in microsteps from the origin.
pub const DEFAULT_XYZ_BOUND: i64 = 5000;

/// Microsteps per physical motor step.
pub const MICROSTEPS_PER_STEP: i64 = 16;

/// Stage errors.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Move vectors must have 3 components, got {0}")]
    Dimension(usize),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Whether the motor coils are energized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    /// Magnets on, holding the slide in place.
    Holding,
    /// Motors off, slide free.
    #[default]
    Released,
}

/// Flags accepted by every motion command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveOptions {
    /// Keep the motors energized after the move.
    pub hold: bool,
    /// Skip the travel bounds check. Use with extreme caution.
    pub override_bounds: bool,
}

impl MoveOptions {
    /// Options that keep the motors energized after the move.
    pub fn held() -> Self {
        Self {
            hold: true,
            override_bounds: false,
        }
    }

    pub fn with_hold(mut self, hold: bool) -> Self {
        self.hold = hold;
        self
    }

    pub fn with_override(mut self, override_bounds: bool) -> Self {
        self.override_bounds = override_bounds;
        self
    }
}

/// Result of a motion command that did not fail at the transport level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The command was sent and the tracked position updated.
    Moved { position: Position, response: String },
    /// The target lies outside the travel bounds; nothing was sent.
    OutOfBounds { requested: Position, bound: i64 },
}

impl MoveOutcome {
    /// Whether the stage actually moved.
    pub fn is_moved(&self) -> bool {
        matches!(self, MoveOutcome::Moved { .. })
    }
}

/// A 3-axis stepper stage behind a [`Transport`].
///
/// The stage keeps its own idea of where it is; the controller board has no
/// position feedback. Every move is bounds-checked against that tracked
/// position unless explicitly overridden.
///
/// # Example
/// ```rust
/// use microscope_stage::stage::{EmulatedTransport, MoveOptions, Position, Stage};
///
/// let mut stage = Stage::new(EmulatedTransport::new());
/// let outcome = stage.move_rel(Position::new(100, 0, 0), MoveOptions::default()).unwrap();
/// assert!(outcome.is_moved());
/// assert_eq!(stage.position(), Position::new(100, 0, 0));
/// ```
pub struct Stage<T: Transport> {
    transport: T,
    position: Position,
    bound: i64,
    power: PowerState,
}

impl<T: Transport> Stage<T> {
    /// Create a stage at the tracked origin with the default travel bound.
    pub fn new(transport: T) -> Self {
        Self::with_bound(transport, DEFAULT_XYZ_BOUND)
    }

    /// Create a stage with a custom travel bound.
    pub fn with_bound(transport: T, bound: i64) -> Self {
        tracing::info!("Stage connected: {}", transport.identity());
        Self {
            transport,
            position: Position::ORIGIN,
            bound,
            power: PowerState::Released,
        }
    }

    /// Identity line reported by the controller.
    pub fn version(&self) -> &str {
        self.transport.identity()
    }

    /// Current tracked position.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Travel bound applied to every axis.
    pub fn bound(&self) -> i64 {
        self.bound
    }

    /// Current motor power state.
    pub fn power(&self) -> PowerState {
        self.power
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Move the stage by `vector` microsteps.
    ///
    /// If precision matters, set `opts.hold` so the magnets keep the slide
    /// in place, and call [`Stage::release`] afterwards.
    pub fn move_rel(
        &mut self,
        vector: Position,
        opts: MoveOptions,
    ) -> Result<MoveOutcome, StageError> {
        let (Some(new_pos), Some(motor)) = (self.checked_target(vector, opts), vector.to_motor())
        else {
            return Ok(self.refuse(vector));
        };

        let command = format!("move_rel {}\n", motor.args());
        self.finish_move(&command, new_pos, opts)
    }

    /// Move the stage by `vector` microsteps using whole motor steps.
    ///
    /// Components that are not multiples of [`MICROSTEPS_PER_STEP`] lose
    /// their remainder on the device, while the tracked position still
    /// advances by the full vector. The bounds check is done in microsteps.
    // TODO: confirm with the hardware owners whether bounds should be
    // checked on the whole-step displacement actually sent.
    pub fn fast_move(
        &mut self,
        vector: Position,
        opts: MoveOptions,
    ) -> Result<MoveOutcome, StageError> {
        let steps = vector.div_trunc(MICROSTEPS_PER_STEP);
        let (Some(new_pos), Some(motor)) = (self.checked_target(vector, opts), steps.to_motor())
        else {
            return Ok(self.refuse(vector));
        };

        let command = format!("fast_move {}\n", motor.args());
        self.finish_move(&command, new_pos, opts)
    }

    /// Move to an absolute tracked position.
    pub fn move_to_pos(
        &mut self,
        target: Position,
        opts: MoveOptions,
    ) -> Result<MoveOutcome, StageError> {
        match target.checked_sub(self.position) {
            Some(vector) => self.move_rel(vector, opts),
            None => {
                tracing::warn!("Refusing move to {}: displacement overflows", target);
                Ok(MoveOutcome::OutOfBounds {
                    requested: target,
                    bound: self.bound,
                })
            }
        }
    }

    /// Move the focus axis by `z` microsteps.
    pub fn focus_rel(&mut self, z: i64, opts: MoveOptions) -> Result<MoveOutcome, StageError> {
        self.move_rel(Position::focus(z), opts)
    }

    /// Return to the tracked origin, which in theory centres the stage.
    pub fn centre_stage(&mut self) -> Result<MoveOutcome, StageError> {
        self.move_to_pos(Position::ORIGIN, MoveOptions::default())
    }

    /// Turn the motors off.
    pub fn release(&mut self) -> Result<String, StageError> {
        let response = self.transport.query("release\n")?;
        self.power = PowerState::Released;
        Ok(response)
    }

    /// Forget the tracked position and call the current spot the origin.
    pub fn reset_position(&mut self) {
        tracing::warn!("Resetting tracked stage position from {}", self.position);
        self.position = Position::ORIGIN;
    }

    /// Target of a relative move, if it is representable and allowed.
    /// Overflow is refused even when the bounds check is overridden.
    fn checked_target(&self, vector: Position, opts: MoveOptions) -> Option<Position> {
        match self.position.checked_add(vector) {
            Some(new_pos) => self.check_bounds(new_pos, opts).then_some(new_pos),
            None => {
                tracing::warn!("Refusing move by {}: position overflows", vector);
                None
            }
        }
    }

    fn refuse(&self, vector: Position) -> MoveOutcome {
        MoveOutcome::OutOfBounds {
            requested: self.position + vector,
            bound: self.bound,
        }
    }

    fn check_bounds(&self, new_pos: Position, opts: MoveOptions) -> bool {
        if new_pos.within(self.bound) {
            return true;
        }
        if opts.override_bounds {
            tracing::warn!("Bounds check overridden, moving to {}", new_pos);
            return true;
        }
        tracing::warn!(
            "Refusing move to {}: outside +/-{} microsteps",
            new_pos,
            self.bound
        );
        false
    }

    fn finish_move(
        &mut self,
        command: &str,
        new_pos: Position,
        opts: MoveOptions,
    ) -> Result<MoveOutcome, StageError> {
        tracing::debug!("Stage command: {}", command.trim_end());
        let response = self.transport.query(command)?;
        self.position = new_pos;
        self.power = PowerState::Holding;
        if !opts.hold {
            self.release()?;
        }
        Ok(MoveOutcome::Moved {
            position: new_pos,
            response,
        })
    }
}

impl<T: Transport> Drop for Stage<T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to release stage motors on close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::EmulatedTransport;

    fn emulated() -> Stage<EmulatedTransport> {
        Stage::new(EmulatedTransport::new())
    }

    #[test]
    fn test_move_rel_within_bounds() {
        let mut stage = emulated();
        let outcome = stage
            .move_rel(Position::new(100, -50, 7), MoveOptions::default())
            .unwrap();

        assert!(outcome.is_moved());
        assert_eq!(stage.position(), Position::new(100, -50, 7));
        assert_eq!(stage.power(), PowerState::Released);
        assert_eq!(
            stage.transport().history(),
            &["move_rel -7 -100 50".to_string(), "release".to_string()]
        );
    }

    #[test]
    fn test_move_rel_hold_keeps_power() {
        let mut stage = emulated();
        stage.move_rel(Position::new(1, 2, 3), MoveOptions::held()).unwrap();

        assert_eq!(stage.power(), PowerState::Holding);
        assert_eq!(stage.transport().history().len(), 1);

        stage.release().unwrap();
        stage.release().unwrap();
        assert_eq!(stage.power(), PowerState::Released);
    }

    #[test]
    fn test_bound_scenario() {
        let mut stage = emulated();
        let first = stage
            .move_rel(Position::new(5000, 0, 0), MoveOptions::default())
            .unwrap();
        assert!(first.is_moved());
        assert_eq!(stage.position(), Position::new(5000, 0, 0));

        let sent = stage.transport().history().len();
        let second = stage
            .move_rel(Position::new(1, 0, 0), MoveOptions::default())
            .unwrap();
        assert_eq!(
            second,
            MoveOutcome::OutOfBounds {
                requested: Position::new(5001, 0, 0),
                bound: 5000
            }
        );
        assert_eq!(stage.position(), Position::new(5000, 0, 0));
        assert_eq!(stage.transport().history().len(), sent);
    }

    #[test]
    fn test_override_bypasses_bounds() {
        let mut stage = emulated();
        let outcome = stage
            .move_rel(
                Position::new(0, -6000, 0),
                MoveOptions::default().with_override(true),
            )
            .unwrap();
        assert!(outcome.is_moved());
        assert_eq!(stage.position(), Position::new(0, -6000, 0));
    }

    #[test]
    fn test_bounds_for_many_vectors() {
        for v in [
            Position::new(4999, 0, 0),
            Position::new(-5000, 5000, -5000),
            Position::new(0, 0, 5001),
            Position::new(-5001, 1, 1),
        ] {
            let mut stage = emulated();
            let moved = stage.move_rel(v, MoveOptions::default()).unwrap().is_moved();
            assert_eq!(moved, v.within(5000));
            let expected = if moved { v } else { Position::ORIGIN };
            assert_eq!(stage.position(), expected);
        }
    }

    #[test]
    fn test_extreme_vectors_are_refused() {
        let mut stage = emulated();
        for v in [
            Position::new(i64::MIN, 0, 0),
            Position::new(0, i64::MAX, 0),
            Position::new(0, 0, i64::MIN),
        ] {
            let outcome = stage.move_rel(v, MoveOptions::held()).unwrap();
            assert!(!outcome.is_moved());
            let outcome = stage.fast_move(v, MoveOptions::held()).unwrap();
            assert!(!outcome.is_moved());
        }
        assert!(stage.transport().history().is_empty());
        assert_eq!(stage.position(), Position::ORIGIN);
    }

    #[test]
    fn test_override_does_not_bypass_overflow() {
        let mut stage = emulated();
        let anything = MoveOptions::held().with_override(true);

        // -i64::MIN cannot be sent to the device
        let outcome = stage.move_rel(Position::new(i64::MIN, 0, 0), anything).unwrap();
        assert!(!outcome.is_moved());

        stage.move_rel(Position::new(10, 0, 0), anything).unwrap();
        let outcome = stage.move_rel(Position::new(i64::MAX, 0, 0), anything).unwrap();
        assert_eq!(
            outcome,
            MoveOutcome::OutOfBounds {
                requested: Position::new(i64::MAX, 0, 0),
                bound: 5000
            }
        );
        assert_eq!(stage.position(), Position::new(10, 0, 0));

        let outcome = stage
            .move_to_pos(Position::new(i64::MIN, 0, 0), anything)
            .unwrap();
        assert!(!outcome.is_moved());
        assert_eq!(stage.transport().history(), &["move_rel 0 -10 0".to_string()]);
    }

    #[test]
    fn test_fast_move_drops_remainder() {
        let mut stage = emulated();
        stage
            .fast_move(Position::new(17, -17, 16), MoveOptions::held())
            .unwrap();

        // Steps (1, -1, 1) after the (-z, -x, -y) wiring remap
        assert_eq!(stage.transport().history(), &["fast_move -1 -1 1".to_string()]);
        assert_eq!(stage.position(), Position::new(17, -17, 16));
    }

    #[test]
    fn test_fast_move_checks_microstep_bounds() {
        let mut stage = Stage::with_bound(EmulatedTransport::new(), 100);
        let outcome = stage
            .fast_move(Position::new(112, 0, 0), MoveOptions::default())
            .unwrap();
        assert!(!outcome.is_moved());
        assert!(stage.transport().history().is_empty());
    }

    #[test]
    fn test_move_to_pos_and_centre() {
        let mut stage = emulated();
        stage
            .move_to_pos(Position::new(300, 200, -10), MoveOptions::default())
            .unwrap();
        stage
            .move_to_pos(Position::new(100, 250, 0), MoveOptions::default())
            .unwrap();
        assert_eq!(stage.position(), Position::new(100, 250, 0));
        assert_eq!(stage.transport().history()[2], "move_rel -10 200 -50");

        stage.centre_stage().unwrap();
        assert_eq!(stage.position(), Position::ORIGIN);
        assert_eq!(stage.transport().history()[4], "move_rel 0 100 250");
    }

    #[test]
    fn test_focus_and_reset() {
        let mut stage = emulated();
        stage.focus_rel(-40, MoveOptions::default()).unwrap();
        assert_eq!(stage.position(), Position::new(0, 0, -40));

        stage.reset_position();
        assert_eq!(stage.position(), Position::ORIGIN);
        assert_eq!(stage.version(), "Emulated Stage");
    }
}
