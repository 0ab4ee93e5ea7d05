//! Stage position vectors and the motor wiring remap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

use super::controller::StageError;

/// A 3-axis stage position or displacement, in motor microsteps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Position {
    /// The origin of the tracked frame.
    pub const ORIGIN: Position = Position { x: 0, y: 0, z: 0 };

    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// A displacement in the focus (z) axis only.
    pub const fn focus(z: i64) -> Self {
        Self { x: 0, y: 0, z }
    }

    /// Largest absolute component.
    pub fn max_abs(&self) -> u64 {
        self.x
            .unsigned_abs()
            .max(self.y.unsigned_abs())
            .max(self.z.unsigned_abs())
    }

    /// Whether every component lies within `[-bound, bound]`.
    pub fn within(&self, bound: i64) -> bool {
        bound >= 0 && self.max_abs() <= bound.unsigned_abs()
    }

    /// Component-wise sum, or `None` on overflow.
    pub fn checked_add(self, rhs: Position) -> Option<Position> {
        Some(Position::new(
            self.x.checked_add(rhs.x)?,
            self.y.checked_add(rhs.y)?,
            self.z.checked_add(rhs.z)?,
        ))
    }

    /// Component-wise difference, or `None` on overflow.
    pub fn checked_sub(self, rhs: Position) -> Option<Position> {
        Some(Position::new(
            self.x.checked_sub(rhs.x)?,
            self.y.checked_sub(rhs.y)?,
            self.z.checked_sub(rhs.z)?,
        ))
    }

    /// Divide every component by `divisor`, truncating toward zero.
    pub fn div_trunc(&self, divisor: i64) -> Self {
        Self::new(self.x / divisor, self.y / divisor, self.z / divisor)
    }

    /// The xy part, as used by the camera-plane calibration.
    pub fn xy(&self) -> [i64; 2] {
        [self.x, self.y]
    }

    /// Apply the hardware wiring remap. `None` if a component is
    /// `i64::MIN`, which has no negation.
    pub fn to_motor(self) -> Option<MotorCommand> {
        Some(MotorCommand {
            a: self.z.checked_neg()?,
            b: self.x.checked_neg()?,
            c: self.y.checked_neg()?,
        })
    }

    /// Build from a slice, rejecting anything but exactly three components.
    pub fn from_slice(values: &[i64]) -> Result<Self, StageError> {
        match values {
            [x, y, z] => Ok(Self::new(*x, *y, *z)),
            _ => Err(StageError::Dimension(values.len())),
        }
    }
}

impl From<[i64; 3]> for Position {
    fn from(v: [i64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

impl TryFrom<&[i64]> for Position {
    type Error = StageError;

    fn try_from(values: &[i64]) -> Result<Self, Self::Error> {
        Self::from_slice(values)
    }
}

// The operators saturate at the i64 limits; motion code uses the checked forms.
impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(
            self.x.saturating_add(rhs.x),
            self.y.saturating_add(rhs.y),
            self.z.saturating_add(rhs.z),
        )
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(
            self.x.saturating_sub(rhs.x),
            self.y.saturating_sub(rhs.y),
            self.z.saturating_sub(rhs.z),
        )
    }
}

impl Neg for Position {
    type Output = Position;

    fn neg(self) -> Position {
        Position::new(
            self.x.saturating_neg(),
            self.y.saturating_neg(),
            self.z.saturating_neg(),
        )
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A displacement expressed in device (motor) axes.
///
/// The stage is wired so that logical (x, y, z) drives motors (-z, -x, -y).
/// Only ever built from a [`Position`] through [`Position::to_motor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCommand {
    pub a: i64,
    pub b: i64,
    pub c: i64,
}

impl MotorCommand {
    /// Invert the wiring remap.
    pub fn to_logical(self) -> Position {
        Position::new(
            self.b.saturating_neg(),
            self.c.saturating_neg(),
            self.a.saturating_neg(),
        )
    }

    /// Render as the three space-separated arguments of a device command.
    pub fn args(&self) -> String {
        format!("{} {} {}", self.a, self.b, self.c)
    }
}
