//! Stepper stage control: position tracking, bounds and the device link.

mod controller;
mod position;
mod transport;

pub use controller::{
    MoveOptions, MoveOutcome, PowerState, Stage, StageError, DEFAULT_XYZ_BOUND,
    MICROSTEPS_PER_STEP,
};
pub use position::{MotorCommand, Position};
pub use transport::{
    EmulatedTransport, PositionFeed, SerialTransport, Transport, TransportError, TransportMode,
    DEFAULT_BAUD, DEFAULT_TTY, EMULATED_IDENTITY, EMULATED_RESPONSE,
};
